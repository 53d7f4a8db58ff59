//! Tracing (logging)
//!
//! Log events go to stderr and are also captured in memory so that the output of each phase can
//! be stored in the project's phase log.

use lazy_static::lazy_static;
use std::io;
use std::sync::{Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

lazy_static! {
    // Formatted log output since the last drain
    static ref CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());
}

/// Filter directive for a `-v` count.
fn level_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "padocc=warn",
        1 => "padocc=info",
        2 => "padocc=debug",
        _ => "padocc=trace",
    }
}

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to a level for
/// this crate derived from the verbosity if not set.
pub fn init_tracing(verbose: u8) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level_directive(verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(PhaseLogCapture),
        )
        .init();
}

/// In-memory sink for formatted log events.
#[derive(Clone, Copy, Debug, Default)]
pub struct PhaseLogCapture;

fn captured() -> MutexGuard<'static, Vec<u8>> {
    // A poisoned buffer still holds valid bytes.
    CAPTURED.lock().unwrap_or_else(|e| e.into_inner())
}

impl PhaseLogCapture {
    /// Discard everything captured so far.
    pub fn clear() {
        captured().clear();
    }

    /// Take the captured lines, leaving the buffer empty.
    pub fn drain() -> Vec<String> {
        let bytes = std::mem::take(&mut *captured());
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(String::from)
            .collect()
    }
}

impl io::Write for PhaseLogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        captured().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for PhaseLogCapture {
    type Writer = PhaseLogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        PhaseLogCapture
    }
}
