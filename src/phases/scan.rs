//! Scan phase: convert a small sample of files to estimate the cost of the full computation.

use crate::drivers::DriverKind;
use crate::error::PadoccError;
use crate::filehandlers::JsonMap;
use crate::phases::compute::{ComputeOperation, Timings};
use crate::phases::is_truthy;
use crate::phases::zarr::ZarrOperation;
use crate::project::{Artifact, CloudFormat, Phase, ProjectOperation};
use crate::references::{RefSet, RECORD_SIZE};
use crate::utils::{format_float, format_seconds, get_seconds, phase_time_budget};

use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Reference volume beyond which a parquet-shaped store is recommended.
const PARQ_THRESHOLD: f64 = 5e8;

/// Memory allowance of the trial rechunk.
const TRIAL_MEMORY: &str = "500MB";

/// Number of files converted when scanning `nfiles` files.
pub fn scan_limiter(nfiles: usize) -> usize {
    (nfiles / 20).clamp(2, 100)
}

/// Run the scan phase for a project.
#[tracing::instrument(level = "DEBUG", skip(project), fields(proj_code = %project.proj_code()))]
pub fn run(project: &mut ProjectOperation) -> Result<(), PadoccError> {
    let nfiles = project.allfiles.len()?;
    if nfiles < 3 {
        info!(
            "Skipped scanning {} - fewer than 3 files ({})",
            project.proj_code(),
            nfiles
        );
        let mut skipped = JsonMap::new();
        skipped.insert("skipped".to_string(), Value::Bool(true));
        project.detail_cfg.set(skipped);
        return Ok(());
    }

    let limiter = scan_limiter(nfiles);
    let cloud_format = project.cloud_format()?;
    info!(
        "Scanning {} with {} of {} files",
        project.proj_code(),
        limiter,
        nfiles
    );
    let summary = match cloud_format {
        CloudFormat::Zarr => scan_zarr(project, limiter)?,
        CloudFormat::Kerchunk | CloudFormat::Cfa => scan_kerchunk(project, limiter)?,
    };

    let estimates = ScanEstimates::new(
        summary.avg_cpf,
        summary.avg_vol,
        summary.variables.len(),
        nfiles,
    );
    let details = summary.compile(&estimates, nfiles, cloud_format);
    for (key, value) in details {
        if value.is_boolean() || is_truthy(&value) {
            project.detail_cfg.insert(&key, value)?;
        }
    }
    check_timeout(&summary.timings, nfiles)
}

/// Estimated compute time must fit the compute budget.
fn check_timeout(timings: &Timings, nfiles: usize) -> Result<(), PadoccError> {
    let per_file = timings.convert.unwrap_or_default() + timings.concat.unwrap_or_default();
    let estimate = per_file * nfiles as f64;
    let budget = phase_time_budget(Phase::Compute);
    if estimate > get_seconds(budget)? as f64 {
        return Err(PadoccError::ExpectTimeout {
            required: format_seconds(estimate),
            current: budget.to_string(),
        });
    }
    Ok(())
}

fn scan_kerchunk(project: &mut ProjectOperation, limiter: usize) -> Result<ScanSummary, PadoccError> {
    let mut op = ComputeOperation::new(project, Some(limiter), true, true)?;
    let refs = op.create_refs()?;
    let mut summary = ScanSummary::from_refs(&refs)?;
    summary.timings = op.timings;
    summary.ctypes = op.ctypes.clone();
    Ok(summary)
}

fn scan_zarr(project: &mut ProjectOperation, limiter: usize) -> Result<ScanSummary, PadoccError> {
    let was_trial = project.settings.is_trial;
    project.settings.is_trial = true;
    let result = trial_zarr(project, limiter);
    if let Some(Artifact::Store(mut store)) = project.artifact()? {
        store.clear()?;
    }
    project.settings.is_trial = was_trial;
    result
}

fn trial_zarr(project: &mut ProjectOperation, limiter: usize) -> Result<ScanSummary, PadoccError> {
    let mut op = ZarrOperation::new(project, Some(limiter), TRIAL_MEMORY, true, true)?;
    let scheme = op.create_store()?;
    Ok(ScanSummary {
        avg_cpf: scheme.chunks_per_file,
        avg_vol: scheme.volume_per_file,
        variables: op.variables.clone(),
        var_err: false,
        timings: op.timings,
        ctypes: op.ctypes.clone(),
        file_type: "zarr",
    })
}

/// What the sample says about the project.
#[derive(Clone, Debug, PartialEq)]
struct ScanSummary {
    avg_cpf: f64,
    avg_vol: f64,
    variables: Vec<String>,
    var_err: bool,
    timings: Timings,
    ctypes: Vec<DriverKind>,
    file_type: &'static str,
}

impl ScanSummary {
    /// Summarise per-file reference sets.
    ///
    /// The first file's variables are the reference. Chunk shapes must agree across files.
    fn from_refs(refs: &[RefSet]) -> Result<Self, PadoccError> {
        let mut volumes = Vec::with_capacity(refs.len());
        let mut counts = Vec::with_capacity(refs.len());
        let mut variables: Vec<String> = Vec::new();
        let mut var_err = false;
        let mut chunks: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (index, refset) in refs.iter().enumerate() {
            let (bytes, count) = refset.chunk_summary();
            volumes.push(bytes as f64);
            counts.push(count as f64);

            let zarrays = refset.zarrays()?;
            let names: Vec<String> = zarrays.keys().cloned().collect();
            if index == 0 {
                variables = names;
            } else if names != variables {
                warn!("Variables of file {} differ from the first file", index);
                var_err = true;
            }

            for (var, zarray) in zarrays {
                match chunks.get(&var) {
                    Some(first) if *first != zarray.chunks => {
                        return Err(PadoccError::ConcatFatal {
                            var,
                            chunk1: format!("{:?}", first),
                            chunk2: format!("{:?}", zarray.chunks),
                        });
                    }
                    Some(_) => (),
                    None => {
                        chunks.insert(var, zarray.chunks);
                    }
                }
            }
        }
        debug!("Sampled volumes {:?} and chunk counts {:?}", volumes, counts);

        Ok(ScanSummary {
            avg_cpf: mean(&counts),
            avg_vol: mean(&volumes),
            variables,
            var_err,
            timings: Timings::default(),
            ctypes: Vec::new(),
            file_type: "",
        })
    }

    /// Driver used for every sampled file, if unanimous.
    fn driver(&self) -> Option<DriverKind> {
        let (first, rest) = self.ctypes.split_first()?;
        rest.iter().all(|kind| kind == first).then_some(*first)
    }

    /// Detail entries for the scan.
    fn compile(&self, estimates: &ScanEstimates, nfiles: usize, cloud_format: CloudFormat) -> JsonMap {
        let file_type = match self.file_type {
            "" => estimates.file_type,
            file_type => file_type,
        };
        let mut details = JsonMap::new();
        let mut put = |key: &str, value: Value| {
            details.insert(key.to_string(), value);
        };
        put("netcdf_data", json!(format_float(estimates.netcdf_data)));
        put("kerchunk_data", json!(format_float(estimates.kerchunk_data)));
        put("num_files", json!(nfiles));
        put("chunks_per_file", json!(format!("{:.1}", estimates.avg_cpf)));
        put("total_chunks", json!(format!("{:.2}", estimates.total_chunks)));
        put("estm_chunksize", json!(format_float(estimates.avg_chunk)));
        put(
            "estm_spatial_res",
            json!(format!("{:.2} deg", estimates.spatial_res)),
        );
        put(
            "timings",
            json!({
                "convert_estm": self.timings.convert,
                "concat_estm": self.timings.concat,
                "validate_estm": self.timings.validate,
                "convert_actual": null,
                "concat_actual": null,
                "validate_actual": null,
            }),
        );
        put("variable_count", json!(self.variables.len()));
        put("variables", json!(self.variables));
        put("addition", json!(format!("{:.3} %", estimates.addition)));
        put("var_err", json!(self.var_err));
        put("file_err", json!(false));
        put("type", json!(file_type));
        if let Some(driver) = self.driver() {
            put("driver", json!(driver.to_string()));
        }
        put("scanned_with", json!(cloud_format.to_string()));
        details
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Whole-project estimates extrapolated from per-file averages.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanEstimates {
    /// Average chunks per file
    pub avg_cpf: f64,
    /// Average bytes per file
    pub avg_vol: f64,
    /// Average bytes per chunk
    pub avg_chunk: f64,
    /// Approximate resolution in degrees, assuming a 2:1 lon/lat grid
    pub spatial_res: f64,
    /// Total native volume in bytes
    pub netcdf_data: f64,
    pub total_chunks: f64,
    /// Reference volume as a percentage of native volume
    pub addition: f64,
    /// Total reference volume in bytes
    pub kerchunk_data: f64,
    /// Recommended reference file type
    pub file_type: &'static str,
}

impl ScanEstimates {
    pub fn new(avg_cpf: f64, avg_vol: f64, num_vars: usize, nfiles: usize) -> Self {
        let record = RECORD_SIZE as f64;
        let nfiles = nfiles as f64;
        let (avg_chunk, spatial_res) = if avg_cpf > 0.0 {
            (
                avg_vol / avg_cpf,
                180.0 * (2.0 * num_vars as f64 / avg_cpf).sqrt(),
            )
        } else {
            (0.0, 0.0)
        };
        let addition = if avg_chunk > 0.0 {
            record * 100.0 / avg_chunk
        } else {
            0.0
        };
        let kerchunk_data = avg_cpf * nfiles * record;
        ScanEstimates {
            avg_cpf,
            avg_vol,
            avg_chunk,
            spatial_res,
            netcdf_data: avg_vol * nfiles,
            total_chunks: avg_cpf * nfiles,
            addition,
            kerchunk_data,
            file_type: if kerchunk_data > PARQ_THRESHOLD {
                "parq"
            } else {
                "JSON"
            },
        }
    }
}
