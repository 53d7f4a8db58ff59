//! Cyclic deployment of groups through the pipeline.
//!
//! The shepherd watches a directory of groups ("flocks"). Each cycle it finds the projects that
//! finished a phase, collects them into a `progression_<phase>` subset and runs the next phase
//! over that subset.

use crate::bypass::BypassSwitch;
use crate::error::PadoccError;
use crate::group::{GroupOperation, RunOptions, INIT_COMPLETE, MAIN};
use crate::project::{Phase, ProjectSettings, SUCCESS};
use crate::utils;

use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bypass switch for every shepherd run.
pub const SHEPHERD_SWITCH: &str = "DFLS";

/// Suffix of flock descriptor files.
pub const FLOCK_SUFFIX: &str = ".flock.yaml";

/// Marker file that excludes a group from deployment.
const QUARANTINE: &str = ".shpignore";

fn default_batch_limit() -> usize {
    100
}

fn default_cycle_limit() -> usize {
    1000
}

fn default_cycle_delay() -> u64 {
    10
}

/// Shepherd configuration, read from YAML
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ShepherdConfig {
    /// Working directory holding every flock
    pub flock_dir: PathBuf,
    /// Projects advanced per batch, at least one phase of a flock is always taken
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Cycles run in continuous mode
    #[serde(default = "default_cycle_limit")]
    pub cycle_limit: usize,
    /// Seconds between cycles
    #[serde(default = "default_cycle_delay")]
    pub cycle_delay: u64,
}

impl ShepherdConfig {
    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, PadoccError> {
        if !path.is_file() {
            return Err(PadoccError::InvalidConfig(format!(
                "config file {} unreachable",
                path.display()
            )));
        }
        let config: ShepherdConfig = serde_yaml::from_str(&fs::read_to_string(path)?)?;
        Ok(config)
    }
}

/// Descriptor of a flock, `<name>.flock.yaml` in the flock directory
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FlockDescriptor {
    pub group_id: String,
    /// Manifest used to initialise the group when it has no projects
    #[serde(default)]
    pub group_file: Option<PathBuf>,
}

/// Deployment modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ShepherdMode {
    /// Run a single cycle
    Batch,
    /// Run cycles until the cycle limit
    Continuous,
}

/// Projects of one flock moving from one phase to the next
#[derive(Clone, Debug, PartialEq)]
pub struct ShepherdTask {
    pub group_id: String,
    pub old_phase: Phase,
    pub new_phase: Phase,
    pub num_codes: usize,
}

impl ShepherdTask {
    /// Subset the projects of this task are collected into.
    pub fn repeat_id(&self) -> String {
        format!("progression_{}", self.new_phase)
    }
}

/// Status of a project ready to leave a phase.
fn ready_status(phase: Phase) -> &'static str {
    match phase {
        Phase::Init => INIT_COMPLETE,
        _ => SUCCESS,
    }
}

/// Cyclic runner over a directory of flocks.
#[derive(Debug)]
pub struct Shepherd {
    config: ShepherdConfig,
    settings: ProjectSettings,
}

impl Shepherd {
    /// Return a new Shepherd
    ///
    /// # Arguments
    ///
    /// * `config`: Shepherd configuration
    /// * `settings`: Project settings of every flock. The bypass switch is replaced by
    ///   [SHEPHERD_SWITCH].
    pub fn new(config: ShepherdConfig, mut settings: ProjectSettings) -> Self {
        settings.bypass = BypassSwitch::new(SHEPHERD_SWITCH);
        Shepherd { config, settings }
    }

    pub fn config(&self) -> &ShepherdConfig {
        &self.config
    }

    /// Run the deployment, returning the number of cycles completed.
    pub async fn activate(&self, mode: ShepherdMode) -> Result<usize, PadoccError> {
        if mode == ShepherdMode::Batch {
            info!("Running in single batch mode");
            self.run_batch(1)?;
            return Ok(1);
        }
        info!("Running in continuous cycle mode");
        let delay = Duration::from_secs(self.config.cycle_delay);
        for cycle in 1..=self.config.cycle_limit {
            info!("Cycle {}/{}", cycle, self.config.cycle_limit);
            self.run_batch(cycle)?;
            if cycle < self.config.cycle_limit {
                tokio::time::sleep(delay).await;
            }
        }
        info!("Cycle limit reached - exiting on {}", self.config.cycle_limit);
        Ok(self.config.cycle_limit)
    }

    /// Run one batch of tasks over every flock, returning the tasks processed.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub fn run_batch(&self, cycle: usize) -> Result<Vec<ShepherdTask>, PadoccError> {
        let mut flocks = self.init_flocks()?;
        if flocks.is_empty() {
            info!("Exiting - no flocks identified");
            return Ok(Vec::new());
        }
        info!("All flocks initialised");

        let (tasks, total) = self.assemble_tasks(&mut flocks)?;
        let current = utils::status_timestamp(utils::now());
        if tasks.is_empty() {
            info!("No processes identified: {}", current);
            return Ok(tasks);
        }
        info!("Shepherd batch {}: {} ({} processes)", cycle, current, total);
        for task in &tasks {
            info!(
                " > Group: {}, Progression: {} -> {} [{}]",
                task.group_id, task.old_phase, task.new_phase, task.num_codes
            );
        }

        info!("Starting processing jobs");
        for task in &tasks {
            if let Some(flock) = flocks.get_mut(&task.group_id) {
                if let Err(err) = process_task(task, flock) {
                    warn!("Task for {} failed: {}", task.group_id, err);
                }
            }
        }
        info!("Finished processing jobs");

        self.complete_flocks(&mut flocks)?;
        Ok(tasks)
    }

    /// Discover and open every flock, initialising described groups that are empty.
    fn init_flocks(&self) -> Result<BTreeMap<String, GroupOperation>, PadoccError> {
        let flock_dir = &self.config.flock_dir;
        if !flock_dir.is_dir() {
            return Err(PadoccError::InvalidConfig(format!(
                "flock directory {} inaccessible",
                flock_dir.display()
            )));
        }

        let mut descriptors: BTreeMap<String, Option<PathBuf>> = BTreeMap::new();
        for descriptor in self.find_descriptors()? {
            descriptors.insert(descriptor.group_id, descriptor.group_file);
        }
        for group_id in self.find_groups()? {
            descriptors.entry(group_id).or_insert(None);
        }
        info!("Discovering {} flocks", descriptors.len());

        let mut flocks = BTreeMap::new();
        for (group_id, group_file) in descriptors {
            let mut flock = GroupOperation::new(&group_id, flock_dir, self.settings.clone())?;
            if flock.groupdir().join(QUARANTINE).is_file() {
                debug!("Skipping quarantined flock {}", group_id);
                continue;
            }
            if let Some(group_file) = group_file {
                if flock.get_codes(MAIN)?.is_empty() {
                    info!("Creating flock {} from {}", group_id, group_file.display());
                    flock.init_from_file(&group_file)?;
                }
            }
            flocks.insert(group_id, flock);
        }
        Ok(flocks)
    }

    fn find_descriptors(&self) -> Result<Vec<FlockDescriptor>, PadoccError> {
        let pattern = format!(
            "{}/*{}",
            glob::Pattern::escape(&self.config.flock_dir.to_string_lossy()),
            FLOCK_SUFFIX
        );
        let mut descriptors = Vec::new();
        for path in glob::glob(&pattern)? {
            let path = path?;
            let descriptor: FlockDescriptor = serde_yaml::from_str(&fs::read_to_string(&path)?)?;
            debug!("Found descriptor {}", path.display());
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    /// Groups already present under `groups/`.
    fn find_groups(&self) -> Result<Vec<String>, PadoccError> {
        let pattern = format!(
            "{}/groups/*/proj_codes/main.txt",
            glob::Pattern::escape(&self.config.flock_dir.to_string_lossy())
        );
        let mut groups = Vec::new();
        for path in glob::glob(&pattern)? {
            let path = path?;
            let group_id = path
                .ancestors()
                .nth(2)
                .and_then(|dir| dir.file_name())
                .map(|name| name.to_string_lossy().into_owned());
            groups.extend(group_id);
        }
        Ok(groups)
    }

    /// Collect progressions from flocks in random order until the batch limit is reached.
    fn assemble_tasks(
        &self,
        flocks: &mut BTreeMap<String, GroupOperation>,
    ) -> Result<(Vec<ShepherdTask>, usize), PadoccError> {
        let mut order: Vec<String> = flocks.keys().cloned().collect();
        order.shuffle(&mut rand::thread_rng());

        let mut tasks = Vec::new();
        let mut total = 0;
        for group_id in order {
            if total >= self.config.batch_limit {
                break;
            }
            let Some(flock) = flocks.get_mut(&group_id) else {
                continue;
            };
            let report = flock.summarise_status(MAIN, false)?;
            debug!("Obtained status for flock {}", group_id);
            for old_phase in [Phase::Init, Phase::Scan, Phase::Compute] {
                let num_codes = report
                    .matching(ready_status(old_phase), Some(old_phase))
                    .len();
                if num_codes == 0 {
                    continue;
                }
                let Some(new_phase) = old_phase.next() else {
                    continue;
                };
                tasks.push(ShepherdTask {
                    group_id: group_id.clone(),
                    old_phase,
                    new_phase,
                    num_codes,
                });
                total += num_codes;
            }
        }
        Ok((tasks, total))
    }

    /// Report flocks whose every project passed validation.
    fn complete_flocks(
        &self,
        flocks: &mut BTreeMap<String, GroupOperation>,
    ) -> Result<(), PadoccError> {
        for (group_id, flock) in flocks.iter_mut() {
            let report = flock.summarise_status(MAIN, false)?;
            let warned = report
                .phases
                .get(&Phase::Validate.to_string())
                .map_or(0, |statuses| {
                    statuses
                        .iter()
                        .filter(|(status, _)| status.contains("Warn"))
                        .map(|(_, codes)| codes.len())
                        .sum()
                });
            let passed = report.complete.len() + warned;
            if report.total > 0 && passed == report.total {
                info!("Flock {} now acceptable for completion", group_id);
            }
        }
        Ok(())
    }
}

/// Collect the ready projects of a task and run the next phase over them.
fn process_task(task: &ShepherdTask, flock: &mut GroupOperation) -> Result<(), PadoccError> {
    let repeat_id = task.repeat_id();
    flock.repeat_by_status(
        ready_status(task.old_phase),
        &repeat_id,
        Some(task.old_phase),
        MAIN,
    )?;
    let options = RunOptions {
        repeat_id,
        subset_bypass: true,
        bypass: Some(BypassSwitch::new(SHEPHERD_SWITCH)),
        ..Default::default()
    };
    let results = flock.run(task.new_phase, &options)?;
    debug!("Results for {}: {:?}", task.group_id, results);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;

    fn config(flock_dir: &Path) -> ShepherdConfig {
        ShepherdConfig {
            flock_dir: flock_dir.to_path_buf(),
            batch_limit: 100,
            cycle_limit: 2,
            cycle_delay: 0,
        }
    }

    fn last_status(group: &GroupOperation, code: &str) -> Vec<String> {
        group.get_project(code).get_last_status().unwrap().unwrap()
    }

    #[test]
    fn config_from_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("shepherd.yaml");
        fs::write(&path, "flock_dir: /my/flocks\ncycle_delay: 5\n").unwrap();
        let config = ShepherdConfig::load(&path).unwrap();
        assert_eq!(PathBuf::from("/my/flocks"), config.flock_dir);
        assert_eq!(100, config.batch_limit);
        assert_eq!(1000, config.cycle_limit);
        assert_eq!(5, config.cycle_delay);

        fs::write(&path, "batch_limit: 5\n").unwrap();
        assert!(matches!(
            ShepherdConfig::load(&path),
            Err(PadoccError::Yaml(_))
        ));
        assert!(ShepherdConfig::load(&tmp.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn shepherd_bypass() {
        let mut settings = ProjectSettings::default();
        settings.bypass = BypassSwitch::new("X");
        let shepherd = Shepherd::new(config(Path::new("/tmp")), settings);
        assert_eq!(BypassSwitch::new("DFLS"), shepherd.settings.bypass);
        assert!(shepherd.settings.bypass.skip_scan);
        assert!(!shepherd.settings.bypass.skip_boxfail);
    }

    #[tokio::test]
    async fn batch_advances_initialised_projects() {
        let tmp = tempfile::tempdir().unwrap();
        test_utils::new_group(tmp.path(), "g1", &["a", "b"]);
        let shepherd = Shepherd::new(config(tmp.path()), ProjectSettings::default());

        assert_eq!(1, shepherd.activate(ShepherdMode::Batch).await.unwrap());

        let mut group = GroupOperation::new("g1", tmp.path(), ProjectSettings::default()).unwrap();
        assert_eq!(vec!["a", "b"], group.get_codes("progression_scan").unwrap());
        for code in ["a", "b"] {
            assert_eq!(vec!["scan", SUCCESS], last_status(&group, code)[..2].to_vec());
        }
    }

    #[test]
    fn tasks_follow_last_status() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = test_utils::new_group(tmp.path(), "g1", &["a", "b", "c"]);
        group
            .run(
                Phase::Scan,
                &RunOptions {
                    proj_code: Some("a".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let shepherd = Shepherd::new(config(tmp.path()), ProjectSettings::default());

        let tasks = shepherd.run_batch(1).unwrap();
        assert_eq!(
            vec![
                ShepherdTask {
                    group_id: "g1".to_string(),
                    old_phase: Phase::Init,
                    new_phase: Phase::Scan,
                    num_codes: 2,
                },
                ShepherdTask {
                    group_id: "g1".to_string(),
                    old_phase: Phase::Scan,
                    new_phase: Phase::Compute,
                    num_codes: 1,
                },
            ],
            tasks
        );
        assert_eq!("progression_compute", tasks[1].repeat_id());
    }

    #[test]
    fn quarantined_flocks_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let group = test_utils::new_group(tmp.path(), "g1", &["a"]);
        fs::write(group.groupdir().join(QUARANTINE), "").unwrap();
        let shepherd = Shepherd::new(config(tmp.path()), ProjectSettings::default());
        assert!(shepherd.run_batch(1).unwrap().is_empty());
        assert_eq!("init", last_status(&group, "a")[0]);
    }

    #[test]
    fn descriptors_create_flocks() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = tmp.path().join("g2.csv");
        fs::write(&manifest, "x,/data/x/*.nc,,\ny,/data/y/*.nc,,\n").unwrap();
        fs::write(
            tmp.path().join(format!("g2{}", FLOCK_SUFFIX)),
            format!("group_id: g2\ngroup_file: {}\n", manifest.display()),
        )
        .unwrap();
        let shepherd = Shepherd::new(config(tmp.path()), ProjectSettings::default());

        let tasks = shepherd.run_batch(1).unwrap();
        assert_eq!(1, tasks.len());
        assert_eq!(2, tasks[0].num_codes);
        let mut group = GroupOperation::new("g2", tmp.path(), ProjectSettings::default()).unwrap();
        assert_eq!(vec!["x", "y"], group.get_codes(MAIN).unwrap());
        assert_eq!(vec!["x", "y"], group.get_codes("progression_scan").unwrap());
    }

    #[test]
    fn missing_flock_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let shepherd = Shepherd::new(
            config(&tmp.path().join("missing")),
            ProjectSettings::default(),
        );
        assert!(matches!(
            shepherd.run_batch(1),
            Err(PadoccError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn continuous_runs_every_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let shepherd = Shepherd::new(config(tmp.path()), ProjectSettings::default());
        assert_eq!(2, shepherd.activate(ShepherdMode::Continuous).await.unwrap());
    }
}
