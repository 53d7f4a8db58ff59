//! Error handling.
//!
//! Every failure a phase can raise is a variant of [PadoccError]. Variants from the pipeline's
//! own taxonomy carry a short kind token which is written verbatim into project status logs.
//! Errors from foreign crates have no token; their status is recovered from the rendered cause
//! chain instead.

use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tracing::{event, Level};
use zune_inflate::errors::InflateDecodeErrors;

use crate::filehandlers::{CsvFileHandler, FileHandler};
use crate::project::Phase;

/// Status value returned when a handled error is short-circuited for group tallying.
pub const FATAL: &str = "Fatal";

/// Pipeline error type
///
/// This type encapsulates the various errors that may occur while processing a project.
#[derive(Debug, Error)]
pub enum PadoccError {
    /// Some files in a batch could not be converted by any driver
    #[error("All drivers failed when performing conversion for files {filenums:?}")]
    PartialDriver { filenums: Vec<usize> },

    /// No driver could convert a file
    #[error("All drivers failed when performing conversion")]
    KerchunkDriverFatal,

    /// A variable expected in the output is missing
    #[error("Missing variable: {var}")]
    MissingVariable { var: String },

    /// Estimated run time exceeds the phase budget
    #[error("Scan requires minimum {required} - current {current}")]
    ExpectTimeout { required: String, current: String },

    /// Estimated memory exceeds the allowance
    #[error("Process requires minimum {required} memory - current allowance {current}")]
    ExpectMemory { required: String, current: String },

    /// Chunk data could not be decoded
    #[error("Decoding resulted in overflow - received chunk data contains junk ({reason})")]
    ChunkData { reason: String },

    /// Temporal selection found nothing to compare
    #[error("No valid timeslices found for {message}")]
    NoValidTimeSlices { message: String },

    /// The output product already exists
    #[error("Output file already exists and forceful overwrite not set.")]
    NoOverwrite,

    /// No output product could be found for validation
    #[error("No suitable kerchunk file found.")]
    MissingKerchunk,

    /// Data comparison failed
    #[error("Data Report: {report}")]
    Validation { report: String },

    /// Invalid compute configuration
    #[error("Invalid configuration for the Compute stage: {reason}")]
    Compute { reason: String },

    /// Variables neither concatenate nor duplicate
    #[error(
        "Variables could not be concatenated over time and are not duplicates - no known solution"
    )]
    Concatenation,

    /// Chunk structures differ between files
    #[error("Chunk sizes differ between refs for {var}: {chunk1} - {chunk2} - files cannot be concatenated")]
    ConcatFatal {
        var: String,
        chunk1: String,
        chunk2: String,
    },

    /// A source file is missing from disk
    #[error("Source file could not be located: {sfile}")]
    SourceNotFound { sfile: String },

    /// An output reference file could not be decoded
    #[error("Decoding of Kerchunk file failed - {reason}")]
    KerchunkDecode { reason: String },

    /// Variable shapes differ between the product and its source
    #[error("Shape mismatch for {var}: {product} (product) - {source_shape} (source)")]
    ShapeMismatch {
        var: String,
        product: String,
        source_shape: String,
    },

    /// Variable sets differ between the product and its source
    #[error("Variable mismatch: {missing:?} present in only one dataset")]
    VariableMismatch { missing: Vec<String> },

    /// Shape mismatch beyond the concatenation tolerance
    #[error("Shape mismatch for {var} exceeds tolerance along {dim}: {product} - {source_len}")]
    XKShapeTolerance {
        var: String,
        dim: String,
        product: usize,
        source_len: usize,
    },

    /// Only one of the compared arrays is entirely NaN
    #[error("NaN values mismatched between datasets for {var}")]
    NaNComparison { var: String },

    /// Comparison skipped because every sample was empty
    #[error("Comparison of {var} skipped - all selections were empty")]
    SoftfailBypass { var: String },

    /// Every variable is identical across files
    #[error("All variables are identical across files - no variables vary for concatenation")]
    IdenticalVariables,

    /// Full-shape validation could not be completed
    #[error("Shape validation failed: {reason}")]
    TrueShapeValidation { reason: String },

    /// A project code was not recognised
    #[error("Project code {proj_code} not recognised: {reason}")]
    ProjectCode { proj_code: String, reason: String },

    /// Project is in the faultlist
    #[error("Project {proj_code} is in the faultlist: {reason}")]
    Blacklisted { proj_code: String, reason: String },

    /// Archive links could not be verified
    #[error("Connection verification to the archive failed - {proj_code}")]
    ArchiveConnect { proj_code: String },

    /// Error converting from bytes to a type
    #[error("failed to convert from bytes to {type_name}")]
    FromBytes { type_name: &'static str },

    /// Invalid user or file configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unsupported operation requested
    #[error("unsupported operation {operation}")]
    UnsupportedOperation { operation: String },

    /// Filesystem errors
    #[error("filesystem error")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialisation errors
    #[error("failed to (de)serialise JSON")]
    Json(#[from] serde_json::Error),

    /// YAML configuration errors
    #[error("failed to parse YAML")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid glob pattern
    #[error("invalid file pattern")]
    GlobPattern(#[from] glob::PatternError),

    /// Unreadable path while expanding a glob
    #[error("failed to expand file pattern")]
    Glob(#[from] glob::GlobError),

    /// Error creating ndarray from shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ndarray::ShapeError),

    /// Error decompressing data
    #[error("failed to decompress data")]
    DecompressionZune(#[from] InflateDecodeErrors),

    /// Invalid base64 inline reference
    #[error("failed to decode inline data")]
    Base64(#[from] base64::DecodeError),

    /// Invalid memory allowance
    #[error("failed to parse memory allowance")]
    ByteUnit(#[from] byte_unit::ParseError),

    /// Invalid configuration model
    #[error("configuration is not valid")]
    Validator(#[from] validator::ValidationErrors),

    /// Error with the project and group it occurred in
    #[error("{source} [project: {proj_code}, group: {group_id}]")]
    Context {
        proj_code: String,
        group_id: String,
        #[source]
        source: Box<PadoccError>,
    },
}

impl PadoccError {
    /// Short kind token used in status logs.
    ///
    /// Returns `None` for errors raised by foreign crates.
    pub fn kind(&self) -> Option<&'static str> {
        let kind = match self {
            PadoccError::PartialDriver { .. } => "PartialDriver",
            PadoccError::KerchunkDriverFatal => "KerchunkDriverFatal",
            PadoccError::MissingVariable { .. } => "MissingVariable",
            PadoccError::ExpectTimeout { .. } => "ExpectTimeout",
            PadoccError::ExpectMemory { .. } => "ExpectMemory",
            PadoccError::ChunkData { .. } => "ChunkData",
            PadoccError::NoValidTimeSlices { .. } => "NoValidTimeSlices",
            PadoccError::NoOverwrite => "NoOverwrite",
            PadoccError::MissingKerchunk => "MissingKerchunk",
            PadoccError::Validation { .. } => "Validation",
            PadoccError::Compute { .. } => "Compute",
            PadoccError::Concatenation => "Concatenation",
            PadoccError::ConcatFatal { .. } => "ConcatFatal",
            PadoccError::SourceNotFound { .. } => "SourceNotFound",
            PadoccError::KerchunkDecode { .. } => "KerchunkDecode",
            PadoccError::ShapeMismatch { .. } => "ShapeMismatch",
            PadoccError::VariableMismatch { .. } => "VariableMismatch",
            PadoccError::XKShapeTolerance { .. } => "XKShapeTolerance",
            PadoccError::NaNComparison { .. } => "NaNComparison",
            PadoccError::SoftfailBypass { .. } => "SoftfailBypass",
            PadoccError::IdenticalVariables => "IdenticalVariables",
            PadoccError::TrueShapeValidation { .. } => "TrueShapeValidation",
            PadoccError::ProjectCode { .. } => "ProjectCode",
            PadoccError::Blacklisted { .. } => "Blacklisted",
            PadoccError::ArchiveConnect { .. } => "ArchiveConnect",
            PadoccError::Context { source, .. } => return source.kind(),
            _ => return None,
        };
        Some(kind)
    }

    /// Attach project and group context to an error.
    ///
    /// Errors that already carry context are returned unchanged.
    pub fn in_project(self, proj_code: &str, group_id: Option<&str>) -> Self {
        match self {
            PadoccError::Context { .. } => self,
            _ => PadoccError::Context {
                proj_code: proj_code.to_string(),
                group_id: group_id.unwrap_or("general").to_string(),
                source: Box::new(self),
            },
        }
    }

    /// Status string recorded in the status log for this error.
    pub fn status(&self) -> String {
        match self.kind() {
            Some(kind) => format!("Failed - {}", kind),
            None => status_from_trace(&ErrorBody::new(self).render()),
        }
    }
}

/// Rendered error with its chain of causes
///
/// Implements serde (de)serialise.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    /// Main error message
    pub message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    pub fn new<E>(error: &E) -> Self
    where
        E: std::error::Error,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody { message, caused_by }
    }

    /// Render as a traceback-like capture, innermost cause last.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("Error: {}", self.message)];
        if let Some(causes) = &self.caused_by {
            for cause in causes {
                lines.push(format!("Caused by: {}", cause));
            }
        }
        lines.join("\n")
    }
}

/// Derive a status string from a traceback-like capture.
///
/// The last non-empty line is taken and truncated at its first colon.
pub fn status_from_trace(trace: &str) -> String {
    trace
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| {
            let line = line.strip_prefix("Caused by: ").unwrap_or(line);
            format!("Failed - {}", line.split(':').next().unwrap_or(line).trim())
        })
        .unwrap_or_else(|| "Failed - NoLogGiven".to_string())
}

/// Centralised per-project error handling.
///
/// Records the error status in the project status log (when given) and decides whether the
/// error is absorbed into a [FATAL] status for group tallying, or returned to the caller.
///
/// # Arguments
///
/// * `err`: The error raised by a phase
/// * `phase`: Phase during which the error occurred
/// * `subset_bypass`: Whether to absorb the error and return [FATAL]
/// * `job_id`: Optional identifier of the batch job
/// * `status_fh`: Optional status log of the project
pub fn error_handler(
    err: PadoccError,
    phase: Phase,
    subset_bypass: bool,
    job_id: Option<&str>,
    status_fh: Option<&mut CsvFileHandler>,
) -> Result<String, PadoccError> {
    let status = err.status();

    if let Some(status_fh) = status_fh {
        status_fh.update_status(&phase.to_string(), &status, job_id)?;
        status_fh.close()?;
    }

    if subset_bypass {
        event!(Level::ERROR, "{}", err.to_string());
        let mut current = err.source();
        while let Some(source) = current {
            event!(Level::ERROR, "Caused by: {}", source.to_string());
            current = source.source();
        }
        Ok(FATAL.to_string())
    } else {
        Err(err)
    }
}
