//! Group orchestration.
//!
//! A [GroupOperation] owns the project sets of one group: named subsets of project codes
//! (`proj_codes/<repeat_id>.txt`, always including `main`), the `datasets.csv` manifest and the
//! `faultlist.csv` of excluded projects. Phases are run over a selected slice of a subset, one
//! project after another.

mod evaluations;
mod init;
mod modifiers;

pub use evaluations::{DataSummary, StatusReport, JOB_CANCELLED, PENDING};
pub use init::INIT_COMPLETE;

use crate::bypass::BypassSwitch;
use crate::error::PadoccError;
use crate::filehandlers::{CsvFileHandler, FileHandler, FileOptions, JsonMap, ListFileHandler};
use crate::metrics;
use crate::project::{CloudFormat, Phase, ProjectOperation, ProjectSettings};

use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the subset holding every project of a group.
pub const MAIN: &str = "main";

/// Selection and flags of a group run
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Cloud format to pin on every project
    pub mode: Option<CloudFormat>,
    /// Subset of project codes to run over
    pub repeat_id: String,
    /// Single project, by code or by index into the subset
    pub proj_code: Option<String>,
    /// `(size, id)`: run the `id`-th slice of `size` codes
    pub subset: Option<(usize, usize)>,
    /// Absorb per-project errors into a `Fatal` tally
    pub subset_bypass: bool,
    /// Bypass switch replacing the group default
    pub bypass: Option<BypassSwitch>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            mode: None,
            repeat_id: MAIN.to_string(),
            proj_code: None,
            subset: None,
            subset_bypass: false,
            bypass: None,
        }
    }
}

/// State and handles of one group.
#[derive(Debug)]
pub struct GroupOperation {
    group_id: String,
    workdir: PathBuf,
    groupdir: PathBuf,
    pub(crate) settings: ProjectSettings,
    pub(crate) proj_codes: HashMap<String, ListFileHandler>,
    pub(crate) datasets: CsvFileHandler,
    pub(crate) faultlist: CsvFileHandler,
}

impl fmt::Display for GroupOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<PADOCC Group: {}>", self.group_id)
    }
}

impl GroupOperation {
    /// Return a new GroupOperation
    ///
    /// Existing subsets are discovered from `proj_codes/*.txt`. Nothing else is read until a
    /// handle is first accessed.
    ///
    /// # Arguments
    ///
    /// * `group_id`: Group identifier
    /// * `workdir`: Pipeline working directory
    /// * `settings`: Run options applied to every project of the group
    pub fn new(
        group_id: &str,
        workdir: &Path,
        settings: ProjectSettings,
    ) -> Result<Self, PadoccError> {
        if group_id.is_empty() || group_id.contains('/') || group_id == "general" {
            return Err(PadoccError::InvalidConfig(format!(
                "invalid group identifier '{}'",
                group_id
            )));
        }
        let groupdir = workdir.join("groups").join(group_id);
        let options = settings.options;
        let proj_codes = Self::load_proj_codes(&groupdir.join("proj_codes"), options)?;
        Ok(GroupOperation {
            group_id: group_id.to_string(),
            workdir: workdir.to_path_buf(),
            datasets: CsvFileHandler::new(&groupdir, "datasets", options),
            faultlist: CsvFileHandler::new(&groupdir, "faultlist", options),
            groupdir,
            settings,
            proj_codes,
        })
    }

    fn load_proj_codes(
        dir: &Path,
        options: FileOptions,
    ) -> Result<HashMap<String, ListFileHandler>, PadoccError> {
        let pattern = format!("{}/*.txt", glob::Pattern::escape(&dir.to_string_lossy()));
        let mut proj_codes = HashMap::new();
        for path in glob::glob(&pattern)? {
            let path = path?;
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                debug!("Found subset {}", name);
                proj_codes.insert(name.to_string(), ListFileHandler::new(dir, name, options));
            }
        }
        proj_codes
            .entry(MAIN.to_string())
            .or_insert_with(|| ListFileHandler::new(dir, MAIN, options));
        Ok(proj_codes)
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Group directory, `<workdir>/groups/<group_id>`.
    pub fn groupdir(&self) -> &Path {
        &self.groupdir
    }

    /// Directory of the subset files.
    pub fn proj_codes_dir(&self) -> PathBuf {
        self.groupdir.join("proj_codes")
    }

    pub fn options(&self) -> FileOptions {
        self.settings.options
    }

    /// Ensure the working directory exists and can be written to.
    pub fn check_writable(&self) -> Result<(), PadoccError> {
        if !self.workdir.exists() {
            if self.options().dryrun {
                info!("DRYRUN: Skip creating {}", self.workdir.display());
                return Ok(());
            }
            fs::create_dir_all(&self.workdir)?;
        }
        if fs::metadata(&self.workdir)?.permissions().readonly() {
            return Err(PadoccError::InvalidConfig(format!(
                "working directory {} is not writable",
                self.workdir.display()
            )));
        }
        Ok(())
    }

    /// Short description of the group state.
    pub fn info(&mut self) -> Result<JsonMap, PadoccError> {
        let mut info = JsonMap::new();
        info.insert("group".into(), self.group_id.clone().into());
        info.insert("workdir".into(), self.workdir.to_string_lossy().into());
        info.insert("projects".into(), self.main()?.len()?.into());
        info.insert("subsets".into(), self.subset_names().into());
        info.insert("faultlist".into(), self.faultlist.len()?.into());
        Ok(info)
    }

    /// Sorted names of every subset.
    pub fn subset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.proj_codes.keys().cloned().collect();
        names.sort();
        names
    }

    fn main(&mut self) -> Result<&mut ListFileHandler, PadoccError> {
        self.subset(MAIN)
    }

    fn subset(&mut self, repeat_id: &str) -> Result<&mut ListFileHandler, PadoccError> {
        self.proj_codes
            .get_mut(repeat_id)
            .ok_or_else(|| PadoccError::InvalidConfig(format!("unknown subset '{}'", repeat_id)))
    }

    /// Project codes of a subset.
    pub fn get_codes(&mut self, repeat_id: &str) -> Result<Vec<String>, PadoccError> {
        self.subset(repeat_id)?.get()
    }

    /// Project code at `index` of the main subset.
    pub fn code_at(&mut self, index: usize) -> Result<String, PadoccError> {
        self.main()?
            .index(index)?
            .ok_or_else(|| PadoccError::ProjectCode {
                proj_code: index.to_string(),
                reason: format!("index out of range for group {}", self.group_id),
            })
    }

    /// Index of a project code in the main subset.
    pub fn index_of(&mut self, proj_code: &str) -> Result<Option<usize>, PadoccError> {
        Ok(self.main()?.items()?.iter().position(|c| c == proj_code))
    }

    /// Open a project of this group with the group settings.
    pub fn get_project(&self, proj_code: &str) -> ProjectOperation {
        self.project_with(proj_code, self.settings.clone())
    }

    fn project_with(&self, proj_code: &str, settings: ProjectSettings) -> ProjectOperation {
        ProjectOperation::new(proj_code, &self.workdir, Some(&self.group_id), settings)
    }

    /// Create or replace a subset.
    pub fn add_proj_codeset(&mut self, repeat_id: &str, codes: Vec<String>) {
        let options = self.options();
        let dir = self.proj_codes_dir();
        match self.proj_codes.get_mut(repeat_id) {
            Some(subset) => subset.set(codes),
            None => {
                self.proj_codes.insert(
                    repeat_id.to_string(),
                    ListFileHandler::with_value(&dir, repeat_id, codes, options),
                );
            }
        }
    }

    /// Delete a subset and its file. The main subset cannot be deleted.
    pub fn delete_proj_codeset(&mut self, repeat_id: &str) -> Result<(), PadoccError> {
        if repeat_id == MAIN {
            return Err(PadoccError::UnsupportedOperation {
                operation: "deleting the main subset".to_string(),
            });
        }
        match self.proj_codes.remove(repeat_id) {
            Some(mut subset) => {
                subset.remove_file()?;
                info!("Removed subset {} from {}", repeat_id, self.group_id);
            }
            None => warn!("Subset {} not found in {}", repeat_id, self.group_id),
        }
        Ok(())
    }

    /// Exclude a project from group runs.
    pub fn add_to_faultlist(&mut self, proj_code: &str, reason: &str) -> Result<(), PadoccError> {
        self.faultlist.remove_code(proj_code)?;
        self.faultlist.append(vec![
            proj_code.to_string(),
            reason.replace([',', '\n'], "."),
        ])?;
        info!("Added {} to the faultlist of {}", proj_code, self.group_id);
        Ok(())
    }

    /// Reason a project is in the faultlist, if it is.
    pub fn fault_reason(&mut self, proj_code: &str) -> Result<Option<String>, PadoccError> {
        Ok(self
            .faultlist
            .find(proj_code)?
            .map(|row| row.get(1).cloned().unwrap_or_default()))
    }

    /// Flush every modified handle.
    pub fn save_files(&mut self) -> Result<(), PadoccError> {
        self.datasets.close()?;
        self.faultlist.close()?;
        for subset in self.proj_codes.values_mut() {
            subset.close()?;
        }
        Ok(())
    }

    /// Resolve the project codes selected by a run.
    fn configure_subset(&mut self, options: &RunOptions) -> Result<Vec<String>, PadoccError> {
        let mut codes = self.get_codes(&options.repeat_id)?;
        if let Some((size, id)) = options.subset {
            if size == 0 {
                return Err(PadoccError::InvalidConfig(
                    "subset size must be at least 1".to_string(),
                ));
            }
            let start = size * id;
            if start >= codes.len() {
                return Err(PadoccError::InvalidConfig(format!(
                    "subset {} of size {} is out of range for {} codes",
                    id,
                    size,
                    codes.len()
                )));
            }
            let end = (start + size).min(codes.len());
            codes = codes[start..end].to_vec();
        }
        if let Some(proj_code) = &options.proj_code {
            if codes.contains(proj_code) {
                codes = vec![proj_code.clone()];
            } else {
                let code = proj_code
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| codes.get(index).cloned())
                    .ok_or_else(|| PadoccError::ProjectCode {
                        proj_code: proj_code.clone(),
                        reason: format!("not found in subset {}", options.repeat_id),
                    })?;
                codes = vec![code];
            }
        }
        Ok(codes)
    }

    /// Run a phase over the selected projects, returning the tally of statuses.
    ///
    /// Projects in the faultlist are skipped. Unless `subset_bypass` is set, the first project
    /// error stops the run.
    #[tracing::instrument(level = "DEBUG", skip(self, options), fields(group = %self.group_id))]
    pub fn run(
        &mut self,
        phase: Phase,
        options: &RunOptions,
    ) -> Result<BTreeMap<String, usize>, PadoccError> {
        let codes = self.configure_subset(options)?;
        metrics::GROUP_PROJECTS
            .with_label_values(&[&self.group_id])
            .set(codes.len() as i64);
        info!(
            "Starting {} for {} projects in {}",
            phase,
            codes.len(),
            self.group_id
        );

        let mut settings = self.settings.clone();
        if let Some(bypass) = &options.bypass {
            settings.bypass = bypass.clone();
        }
        let mut results: BTreeMap<String, usize> = BTreeMap::new();
        for (index, code) in codes.iter().enumerate() {
            if let Some(reason) = self.fault_reason(code)? {
                warn!("Skipping {} (faultlist: {})", code, reason);
                continue;
            }
            debug!("Project {}/{}: {}", index + 1, codes.len(), code);
            let mut project = self.project_with(code, settings.clone());
            let status = project.run(phase, options.mode, options.subset_bypass)?;
            *results.entry(status).or_default() += 1;
        }

        info!("Pipeline execution finished for {}", self.group_id);
        for (status, count) in &results {
            info!("{}: {}", status, count);
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("Metrics:\n{}", metrics::render()?);
        }
        self.save_files()?;
        Ok(results)
    }
}
