//! Per-project state.
//!
//! A [ProjectOperation] bundles the on-disk handles of one project and dispatches phase runs.
//! Every phase reads and writes the project only through these handles, and [ProjectOperation::run]
//! flushes them before returning.

use crate::bypass::BypassSwitch;
use crate::cfa::CfaBackend;
use crate::dataset::Dataset;
use crate::drivers::{DriverKind, DriverRegistry};
use crate::error::{error_handler, PadoccError};
use crate::filehandlers::{
    CsvFileHandler, FileHandler, FileOptions, JsonFileHandler, JsonMap, KerchunkFile,
    ListFileHandler, LogFileHandler, StoreHandler, StoreKind,
};
use crate::metrics;
use crate::models::{parse_version, BaseConfig, DEFAULT_VERSION};
use crate::phases;
use crate::tracing::PhaseLogCapture;
use crate::utils;

pub use crate::models::{CloudFormat, FileType};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use strum_macros::Display;
use tracing::{debug, info, warn};
use url::Url;

/// Status recorded for a phase that completed.
pub const SUCCESS: &str = "Success";

/// Value given to global attributes that differ across files.
pub const CONCAT_MSG: &str = "See individual files for more details";

/// Pipeline phase
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Init,
    Scan,
    Compute,
    Validate,
}

impl Phase {
    /// Phases that keep a log file.
    pub const LOGGED: [Phase; 3] = [Phase::Scan, Phase::Compute, Phase::Validate];

    /// The phase run after this one.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Init => Some(Phase::Scan),
            Phase::Scan => Some(Phase::Compute),
            Phase::Compute => Some(Phase::Validate),
            Phase::Validate => None,
        }
    }
}

impl FromStr for Phase {
    type Err = PadoccError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "init" => Ok(Phase::Init),
            "scan" => Ok(Phase::Scan),
            "compute" => Ok(Phase::Compute),
            "validate" => Ok(Phase::Validate),
            _ => Err(PadoccError::InvalidConfig(format!("unknown phase {}", s))),
        }
    }
}

/// Run options shared by every project of a group run.
#[derive(Clone, Debug)]
pub struct ProjectSettings {
    /// Dryrun and forceful flags for every handle
    pub options: FileOptions,
    /// Recreate everything from scratch, ignoring caches
    pub thorough: bool,
    pub bypass: BypassSwitch,
    /// Batch job identifier recorded in status rows
    pub job_id: Option<String>,
    /// Increment the version when the output product already exists
    pub new_version: bool,
    /// Trial products carry a `trial-` prefix
    pub is_trial: bool,
    /// Memory allowance of the rechunker
    pub mem_allowed: String,
    /// Preferred rechunk length per dimension
    pub preferences: Option<Vec<Option<usize>>>,
    /// Value for global attributes that differ across files
    pub concat_msg: String,
    /// Base url prefixed to local references
    pub link_base: Option<Url>,
    pub drivers: DriverRegistry,
    pub cfa: Option<Arc<dyn CfaBackend>>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        ProjectSettings {
            options: FileOptions::default(),
            thorough: false,
            bypass: BypassSwitch::default(),
            job_id: None,
            new_version: false,
            is_trial: false,
            mem_allowed: "100MB".to_string(),
            preferences: None,
            concat_msg: CONCAT_MSG.to_string(),
            link_base: None,
            drivers: DriverRegistry::default(),
            cfa: None,
        }
    }
}

/// Compose a revision from its parts.
///
/// The first letter of the cloud format, then of the file type (if any), then the version.
pub fn revision_of(cloud_format: CloudFormat, file_type: Option<FileType>, version: &str) -> String {
    let mut revision = String::new();
    revision.extend(cloud_format.to_string().chars().next());
    if let Some(file_type) = file_type {
        revision.extend(file_type.to_string().chars().next());
    }
    revision.push_str(version);
    revision
}

/// The output artifact of a project.
#[derive(Debug)]
pub enum Artifact {
    /// Single kerchunk reference file
    Kerchunk(KerchunkFile),
    /// Parquet-shaped reference store or rechunked zarr store
    Store(StoreHandler),
}

impl Artifact {
    pub fn handler(&self) -> &dyn FileHandler {
        match self {
            Artifact::Kerchunk(kfile) => kfile as &dyn FileHandler,
            Artifact::Store(store) => store as &dyn FileHandler,
        }
    }

    pub fn handler_mut(&mut self) -> &mut dyn FileHandler {
        match self {
            Artifact::Kerchunk(kfile) => kfile as &mut dyn FileHandler,
            Artifact::Store(store) => store as &mut dyn FileHandler,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.handler().path()
    }

    pub fn exists(&self) -> bool {
        self.handler().exists()
    }

    /// Open the artifact as a dataset.
    pub fn open_dataset(&mut self) -> Result<Dataset, PadoccError> {
        if !self.exists() {
            return Err(PadoccError::MissingKerchunk);
        }
        match self {
            Artifact::Kerchunk(kfile) => Dataset::open_refs(&kfile.refs()?),
            Artifact::Store(store) => store.open_dataset(),
        }
    }
}

/// State and handles of one project.
#[derive(Debug)]
pub struct ProjectOperation {
    proj_code: String,
    workdir: PathBuf,
    group_id: Option<String>,
    dir: PathBuf,
    pub(crate) settings: ProjectSettings,
    pub(crate) base_cfg: JsonFileHandler,
    pub(crate) detail_cfg: JsonFileHandler,
    pub(crate) allfiles: ListFileHandler,
    pub(crate) status_log: CsvFileHandler,
    pub(crate) phase_logs: HashMap<Phase, LogFileHandler>,
}

impl fmt::Display for ProjectOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<PADOCC Project: {} ({})>", self.proj_code, self.group_name())
    }
}

impl ProjectOperation {
    /// Return a new ProjectOperation
    ///
    /// Nothing is read from disk until a handle is first accessed.
    ///
    /// # Arguments
    ///
    /// * `proj_code`: Project code
    /// * `workdir`: Pipeline working directory
    /// * `group_id`: Group the project belongs to, if any
    /// * `settings`: Run options
    pub fn new(
        proj_code: &str,
        workdir: &Path,
        group_id: Option<&str>,
        settings: ProjectSettings,
    ) -> Self {
        let group = group_id.unwrap_or("general");
        let dir = workdir.join("in_progress").join(group).join(proj_code);
        let options = settings.options;
        ProjectOperation {
            proj_code: proj_code.to_string(),
            workdir: workdir.to_path_buf(),
            group_id: group_id.map(String::from),
            base_cfg: JsonFileHandler::new(&dir, "base-cfg", options),
            detail_cfg: JsonFileHandler::new(&dir, "detail-cfg", options),
            allfiles: ListFileHandler::new(&dir, "allfiles", options),
            status_log: CsvFileHandler::new(&dir, "status_log", options),
            phase_logs: Self::phase_log_handles(&dir, options),
            dir,
            settings,
        }
    }

    fn phase_log_handles(dir: &Path, options: FileOptions) -> HashMap<Phase, LogFileHandler> {
        Phase::LOGGED
            .into_iter()
            .map(|phase| (phase, LogFileHandler::new(dir, &phase.to_string(), options)))
            .collect()
    }

    pub fn proj_code(&self) -> &str {
        &self.proj_code
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    fn group_name(&self) -> &str {
        self.group_id.as_deref().unwrap_or("general")
    }

    /// Project directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> FileOptions {
        self.settings.options
    }

    pub fn settings(&self) -> &ProjectSettings {
        &self.settings
    }

    /// Directory of cached per-file references.
    pub fn cache_dir(&self) -> PathBuf {
        self.dir.join("cache")
    }

    /// Path of the CFA file of this project.
    pub fn cfa_path(&self) -> PathBuf {
        self.dir.join(format!("{}.nca", self.proj_code))
    }

    /// Directory receiving validated artifacts.
    pub fn complete_dir(&self) -> PathBuf {
        self.workdir.join("complete").join(self.group_name())
    }

    /// Whether the project has been initialised on disk.
    pub fn exists(&self) -> bool {
        self.base_cfg.exists()
    }

    /// Write the base configuration and, on first creation, the file list.
    ///
    /// The file list of an existing project is kept unless forceful.
    pub fn setup_config(&mut self, config: &BaseConfig) -> Result<(), PadoccError> {
        let first_time = !self.exists();
        match serde_json::to_value(config)? {
            Value::Object(map) => self.base_cfg.set(map),
            _ => {
                return Err(PadoccError::InvalidConfig(format!(
                    "configuration of {} is not a map",
                    self.proj_code
                )))
            }
        }
        if first_time || self.options().forceful {
            self.configure_filelist()?;
        } else {
            debug!("Keeping existing file list for {}", self.proj_code);
        }
        if first_time {
            for log in self.phase_logs.values() {
                log.create_file()?;
            }
            self.detail_cfg.set(JsonMap::new());
        }
        Ok(())
    }

    /// Resolve the configured pattern into the file list.
    ///
    /// A `.txt` pattern is read as a listing; anything else is glob-expanded and sorted.
    pub fn configure_filelist(&mut self) -> Result<(), PadoccError> {
        let pattern: String = self.base_cfg.get_as("pattern")?.ok_or_else(|| {
            PadoccError::InvalidConfig(format!("no pattern configured for {}", self.proj_code))
        })?;
        let files = if pattern.ends_with(".txt") {
            utils::extract_file(Path::new(&pattern))?
        } else {
            let mut files = glob::glob(&pattern)?
                .map(|path| path.map(|p| p.to_string_lossy().into_owned()))
                .collect::<Result<Vec<_>, _>>()?;
            files.sort();
            files
        };
        if files.is_empty() {
            warn!("No files found for {} using {}", self.proj_code, pattern);
        }
        info!("Configured {} files for {}", files.len(), self.proj_code);
        self.allfiles.set(files);
        Ok(())
    }

    /// Input files of the project.
    pub fn files(&mut self) -> Result<Vec<String>, PadoccError> {
        self.allfiles.get()
    }

    fn override_value(&mut self, key: &str) -> Result<Option<String>, PadoccError> {
        Ok(match self.base_cfg.get("override")? {
            Some(Value::Object(map)) => map.get(key).and_then(Value::as_str).map(String::from),
            _ => None,
        })
    }

    fn set_override(&mut self, key: &str, value: Option<String>) -> Result<(), PadoccError> {
        let cfg = self.base_cfg.value_mut()?;
        let entry = cfg
            .entry("override")
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if !entry.is_object() {
            *entry = Value::Object(JsonMap::new());
        }
        if let Value::Object(map) = entry {
            match value {
                Some(value) => map.insert(key.to_string(), Value::String(value)),
                None => map.remove(key),
            };
        }
        Ok(())
    }

    /// Resolve an override, falling back to a detail value which is then cached.
    fn check_override<T>(&mut self, key: &str, mapper: &str) -> Result<Option<T>, PadoccError>
    where
        T: FromStr + fmt::Display,
    {
        if let Some(value) = self.override_value(key)? {
            match value.parse() {
                Ok(value) => return Ok(Some(value)),
                Err(_) => warn!("Ignoring invalid override {}={}", key, value),
            }
        }
        let detail: Option<String> = match self.detail_cfg.get(mapper)? {
            Some(Value::String(value)) => Some(value),
            _ => None,
        };
        if let Some(value) = detail.and_then(|v| v.parse::<T>().ok()) {
            self.set_override(key, Some(value.to_string()))?;
            return Ok(Some(value));
        }
        Ok(None)
    }

    /// Cloud format of the output artifact.
    pub fn cloud_format(&mut self) -> Result<CloudFormat, PadoccError> {
        Ok(self
            .check_override("cloud_type", "scanned_with")?
            .unwrap_or(CloudFormat::Kerchunk))
    }

    /// Pin the cloud format, resetting the file type to its default.
    pub fn set_cloud_format(&mut self, cloud_format: CloudFormat) -> Result<(), PadoccError> {
        self.set_override("cloud_type", Some(cloud_format.to_string()))?;
        self.set_file_type(None)
    }

    /// File type of the output artifact, if the cloud format has one.
    pub fn file_type(&mut self) -> Result<Option<FileType>, PadoccError> {
        let cloud_format = self.cloud_format()?;
        let permitted = cloud_format.permitted_file_types();
        if permitted.is_empty() {
            return Ok(None);
        }
        match self.check_override::<FileType>("file_type", "type")? {
            Some(file_type) if permitted.contains(&file_type) => Ok(Some(file_type)),
            _ => Ok(cloud_format.default_file_type()),
        }
    }

    /// Pin the file type; `None` selects the default for the cloud format.
    pub fn set_file_type(&mut self, file_type: Option<FileType>) -> Result<(), PadoccError> {
        let cloud_format = match self.override_value("cloud_type")? {
            Some(value) => value.parse()?,
            None => self.cloud_format()?,
        };
        let file_type = match file_type {
            None => cloud_format.default_file_type(),
            Some(file_type) if cloud_format.permitted_file_types().contains(&file_type) => {
                Some(file_type)
            }
            Some(file_type) => {
                return Err(PadoccError::InvalidConfig(format!(
                    "file type {} not permitted for {} - must be one of {:?}",
                    file_type,
                    cloud_format,
                    cloud_format.permitted_file_types()
                )))
            }
        };
        self.set_override("file_type", file_type.map(|f| f.to_string()))
    }

    pub fn version_no(&mut self) -> Result<String, PadoccError> {
        Ok(self
            .base_cfg
            .get_as("version_no")?
            .unwrap_or_else(|| DEFAULT_VERSION.to_string()))
    }

    pub(crate) fn set_version_no(&mut self, version: &str) -> Result<(), PadoccError> {
        self.base_cfg.insert("version_no", version)
    }

    pub fn revision(&mut self) -> Result<String, PadoccError> {
        let cloud_format = self.cloud_format()?;
        let file_type = self.file_type()?;
        Ok(revision_of(cloud_format, file_type, &self.version_no()?))
    }

    /// Name of the output artifact in the project directory.
    pub fn outproduct(&mut self) -> Result<String, PadoccError> {
        let revision = self.revision()?;
        if self.settings.is_trial {
            Ok(format!("trial-{}a", revision))
        } else {
            Ok(format!("{}a", revision))
        }
    }

    pub fn outpath(&mut self) -> Result<PathBuf, PadoccError> {
        let outproduct = self.outproduct()?;
        Ok(self.dir.join(outproduct))
    }

    /// Name of the artifact once moved out of the pipeline.
    pub fn complete_product(&mut self) -> Result<String, PadoccError> {
        let revision = self.revision()?;
        Ok(format!("{}.{}", self.proj_code, revision))
    }

    /// Path of the marker written when the project is complete.
    pub fn complete_marker(&mut self) -> Result<PathBuf, PadoccError> {
        let outproduct = self.outproduct()?;
        Ok(self.dir.join(format!("{}.complete", outproduct)))
    }

    pub fn is_complete(&mut self) -> Result<bool, PadoccError> {
        Ok(self.complete_marker()?.exists())
    }

    /// Handle over the output artifact, or `None` for CFA projects.
    pub fn artifact(&mut self) -> Result<Option<Artifact>, PadoccError> {
        let outproduct = self.outproduct()?;
        let options = self.options();
        Ok(match (self.cloud_format()?, self.file_type()?) {
            (CloudFormat::Kerchunk, Some(FileType::Parq)) => Some(Artifact::Store(
                StoreHandler::new(&self.dir, &outproduct, StoreKind::KerchunkParquet, options),
            )),
            (CloudFormat::Kerchunk, _) => Some(Artifact::Kerchunk(KerchunkFile::new(
                &self.dir,
                &outproduct,
                options,
            ))),
            (CloudFormat::Zarr, _) => Some(Artifact::Store(StoreHandler::new(
                &self.dir,
                &outproduct,
                StoreKind::Zarr,
                options,
            ))),
            (CloudFormat::Cfa, _) => None,
        })
    }

    /// Native format recorded by scan, or `src` when unknown.
    pub fn source_format(&mut self) -> Result<String, PadoccError> {
        Ok(self
            .detail_cfg
            .get_as("driver")?
            .unwrap_or_else(|| "src".to_string()))
    }

    /// Driver recorded by scan, tried first on later conversions.
    pub fn driver_hint(&mut self) -> Result<Option<DriverKind>, PadoccError> {
        Ok(self
            .detail_cfg
            .get_as::<String>("driver")?
            .and_then(|d| d.parse().ok()))
    }

    fn bump_version(&mut self, bump: fn((u32, u32)) -> (u32, u32)) -> Result<String, PadoccError> {
        if self.is_complete()? {
            return Err(PadoccError::UnsupportedOperation {
                operation: format!("version increment of completed project {}", self.proj_code),
            });
        }
        let current = self.version_no()?;
        let parts = parse_version(&current)
            .ok_or_else(|| PadoccError::InvalidConfig(format!("bad version {}", current)))?;
        let (major, minor) = bump(parts);
        let version = format!("{}.{}", major, minor);
        info!("Version of {} changed {} -> {}", self.proj_code, current, version);
        self.set_version_no(&version)?;
        Ok(version)
    }

    /// Increment the minor version (`x.Y+1`).
    pub fn minor_version_increment(&mut self) -> Result<String, PadoccError> {
        self.bump_version(|(major, minor)| (major, minor + 1))
    }

    /// Increment the major version (`X+1.0`).
    pub fn major_version_increment(&mut self) -> Result<String, PadoccError> {
        self.bump_version(|(major, _)| (major + 1, 0))
    }

    /// Append a row to the status log.
    pub fn update_status(&mut self, phase: Phase, status: &str) -> Result<(), PadoccError> {
        let job_id = self.settings.job_id.clone();
        self.status_log
            .update_status(&phase.to_string(), status, job_id.as_deref())
    }

    /// The last row of the status log.
    pub fn get_last_status(&mut self) -> Result<Option<Vec<String>>, PadoccError> {
        self.status_log.last()
    }

    /// Stored log output of a phase.
    pub fn get_log_contents(&mut self, phase: Phase) -> Result<String, PadoccError> {
        match self.phase_logs.get_mut(&phase) {
            Some(log) => Ok(log.items()?.join("\n")),
            None => Ok(String::new()),
        }
    }

    /// Print the stored log output of a phase.
    ///
    /// With `halt`, waits for confirmation and returns whether to continue.
    pub fn show_log_contents(&mut self, phase: Phase, halt: bool) -> Result<bool, PadoccError> {
        let contents = self.get_log_contents(phase)?;
        println!("{}: {} log\n{}", self.proj_code, phase, contents);
        if halt {
            return Ok(!confirm("Stop viewing logs?", &mut io::stdin().lock()));
        }
        Ok(true)
    }

    /// Phase and duration of the last run.
    pub fn get_last_run(&mut self) -> Result<Option<(String, String)>, PadoccError> {
        self.detail_cfg.get_as("last_run")
    }

    pub fn set_last_run(&mut self, phase: Phase, time: &str) -> Result<(), PadoccError> {
        self.detail_cfg
            .insert("last_run", vec![phase.to_string(), time.to_string()])
    }

    /// Short description of the project state.
    pub fn info(&mut self) -> Result<JsonMap, PadoccError> {
        let mut info = JsonMap::new();
        info.insert("proj_code".into(), self.proj_code.clone().into());
        info.insert("group".into(), self.group_name().into());
        info.insert("files".into(), self.allfiles.len()?.into());
        info.insert("cloud_format".into(), self.cloud_format()?.to_string().into());
        if let Some(file_type) = self.file_type()? {
            info.insert("file_type".into(), file_type.to_string().into());
        }
        info.insert("revision".into(), self.revision()?.into());
        if let Some(status) = self.get_last_status()? {
            info.insert("last_status".into(), status.join(",").into());
        }
        Ok(info)
    }

    /// Flush every modified handle.
    pub fn save_files(&mut self) -> Result<(), PadoccError> {
        self.base_cfg.close()?;
        self.detail_cfg.close()?;
        self.allfiles.close()?;
        self.status_log.close()?;
        for log in self.phase_logs.values_mut() {
            log.close()?;
        }
        Ok(())
    }

    fn reset_handles(&mut self) {
        self.base_cfg.reset();
        self.detail_cfg.reset();
        self.allfiles.reset();
        self.status_log.reset();
        for log in self.phase_logs.values_mut() {
            log.reset();
        }
    }

    /// Remove the project directory.
    ///
    /// With `ask`, the removal must be confirmed on stdin. Returns whether anything was removed.
    pub fn delete_project(&mut self, ask: bool) -> Result<bool, PadoccError> {
        if self.options().dryrun {
            info!("DRYRUN: Skip deleting {}", self.dir.display());
            return Ok(false);
        }
        if ask && !confirm(
            &format!("Delete project {} at {}?", self.proj_code, self.dir.display()),
            &mut io::stdin().lock(),
        ) {
            info!("Skipped deleting {}", self.proj_code);
            return Ok(false);
        }
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        self.reset_handles();
        info!("Deleted project {}", self.proj_code);
        Ok(true)
    }

    /// Move the project directory, rebinding every handle.
    pub fn move_to(&mut self, new_dir: &Path) -> Result<(), PadoccError> {
        self.save_files()?;
        let options = self.options();
        if options.dryrun {
            info!(
                "DRYRUN: Skip moving {} to {}",
                self.dir.display(),
                new_dir.display()
            );
            return Ok(());
        }
        if new_dir.exists() {
            if !options.forceful {
                return Err(PadoccError::NoOverwrite);
            }
            fs::remove_dir_all(new_dir)?;
        }
        if let Some(parent) = new_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.dir.exists() {
            fs::rename(&self.dir, new_dir)?;
        }
        debug!("Moved {} to {}", self.dir.display(), new_dir.display());
        self.dir = new_dir.to_path_buf();
        self.base_cfg = JsonFileHandler::new(new_dir, "base-cfg", options);
        self.detail_cfg = JsonFileHandler::new(new_dir, "detail-cfg", options);
        self.allfiles = ListFileHandler::new(new_dir, "allfiles", options);
        self.status_log = CsvFileHandler::new(new_dir, "status_log", options);
        self.phase_logs = Self::phase_log_handles(new_dir, options);
        Ok(())
    }

    /// Move the project into another group.
    pub fn migrate(&mut self, new_group: &str) -> Result<(), PadoccError> {
        let new_dir = self
            .workdir
            .join("in_progress")
            .join(new_group)
            .join(&self.proj_code);
        self.move_to(&new_dir)?;
        if !self.options().dryrun {
            self.group_id = Some(new_group.to_string());
        }
        Ok(())
    }

    /// Run a phase for this project.
    ///
    /// Errors are recorded in the status log. With `subset_bypass` they are absorbed into a
    /// `Fatal` status, otherwise returned.
    ///
    /// # Arguments
    ///
    /// * `phase`: Phase to run
    /// * `mode`: Cloud format to pin before running
    /// * `subset_bypass`: Absorb errors for group tallying
    #[tracing::instrument(level = "DEBUG", skip(self), fields(proj_code = %self.proj_code))]
    pub fn run(
        &mut self,
        phase: Phase,
        mode: Option<CloudFormat>,
        subset_bypass: bool,
    ) -> Result<String, PadoccError> {
        PhaseLogCapture::clear();
        let start = Instant::now();
        info!("Starting {} operation for {}", phase, self.proj_code);

        let result = self.run_phase(phase, mode);
        let elapsed = start.elapsed().as_secs_f64();

        let outcome = match result {
            Ok(()) => self
                .update_status(phase, SUCCESS)
                .map(|()| SUCCESS.to_string()),
            Err(err) => {
                // Partial phase output is discarded.
                self.base_cfg.reset();
                self.detail_cfg.reset();
                let job_id = self.settings.job_id.clone();
                let err = err.in_project(&self.proj_code, self.group_id.as_deref());
                error_handler(
                    err,
                    phase,
                    subset_bypass,
                    job_id.as_deref(),
                    Some(&mut self.status_log),
                )
            }
        };
        let label = match &outcome {
            Ok(status) => status.clone(),
            Err(err) => err.status(),
        };
        metrics::record_phase(&phase.to_string(), &label, elapsed);

        // A skipped scan leaves only the skip marker in detail-cfg.
        let skipped = outcome.is_ok()
            && phase == Phase::Scan
            && self.detail_cfg.get_as::<bool>("skipped")?.unwrap_or(false);
        if !skipped {
            self.set_last_run(phase, &utils::format_seconds(elapsed))?;
        }
        let lines = PhaseLogCapture::drain();
        if let Some(log) = self.phase_logs.get_mut(&phase) {
            log.set(lines);
        }
        self.save_files()?;
        outcome
    }

    fn run_phase(&mut self, phase: Phase, mode: Option<CloudFormat>) -> Result<(), PadoccError> {
        if let Some(mode) = mode {
            if self.cloud_format()? != mode {
                info!("Switching {} to cloud format {}", self.proj_code, mode);
                self.set_cloud_format(mode)?;
            }
        }
        match phase {
            Phase::Init => {
                info!("Nothing to run for init - use the group init operation");
                Ok(())
            }
            Phase::Scan => phases::scan::run(self),
            Phase::Compute => phases::compute::run(self),
            Phase::Validate => phases::validate::run(self),
        }?;
        self.save_files()
    }
}

/// Prompt for a `Y` answer.
fn confirm<R: BufRead>(prompt: &str, input: &mut R) -> bool {
    print!("{} (Y/N) ", prompt);
    let _ = io::stdout().flush();
    let mut answer = String::new();
    input.read_line(&mut answer).is_ok() && answer.trim() == "Y"
}
