//! Prometheus metrics for phase runs.

use lazy_static::lazy_static;
use prometheus::{self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::error::PadoccError;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Phase outcomes by phase and status
    pub static ref PHASE_OUTCOMES: IntCounterVec = IntCounterVec::new(
        Opts::new("phase_outcomes", "The number of project phase runs by outcome"),
        &["phase", "status"]
    ).expect("metric can be created");
    // Per-project phase duration
    pub static ref PHASE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("phase_duration", "The time taken to run a phase for one project"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &["phase"],
    ).expect("metric can be created");
    // Projects selected by the latest group run
    pub static ref GROUP_PROJECTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("group_projects", "The number of projects in the latest group run"),
        &["group"]
    ).expect("metric can be created");
}

/// Register every metric with [REGISTRY].
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(PHASE_OUTCOMES.clone()))?;
    REGISTRY.register(Box::new(PHASE_DURATION.clone()))?;
    REGISTRY.register(Box::new(GROUP_PROJECTS.clone()))?;
    Ok(())
}

/// Render the registry in the Prometheus text format.
pub fn render() -> Result<String, PadoccError> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| PadoccError::InvalidConfig(e.to_string()))?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Record the outcome and duration of one phase run.
pub fn record_phase(phase: &str, status: &str, seconds: f64) {
    PHASE_OUTCOMES.with_label_values(&[phase, status]).inc();
    PHASE_DURATION
        .with_label_values(&[phase])
        .observe(seconds);
}
