//! Allocation of projects to batch job arrays.
//!
//! Projects with compute timings recorded by scan are given a time estimate. Estimated projects
//! are either bin-packed into allocations whose estimates sum to at most one bin, or placed in
//! time bands. Projects without an estimate are banded by the phase budget, widened when the
//! previous run of the same phase may have timed out. Each allocation or band is written as a
//! list of project codes under `proj_codes/<repeat_id>/` for an external scheduler.

use crate::error::PadoccError;
use crate::filehandlers::{FileHandler, ListFileHandler};
use crate::group::GroupOperation;
use crate::project::{Phase, ProjectOperation};
use crate::utils;

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Minimum number of estimates for bin-packing to be used.
pub const BINPACK_MIN: usize = 5;

/// Minimum band for validation of projects requiring a full comparison.
const QUALITY_BAND: u64 = 120;

/// Options of an allocation
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocateOptions {
    /// Widen the band of projects whose last run was of the same phase
    pub band_increase: bool,
    /// Bin-pack estimated projects into allocations
    pub binpack: bool,
}

/// One job array to submit
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    /// `allocations` or `band_<minutes>`
    pub label: String,
    /// Time allowed per job, `MM:00`
    pub time: String,
    /// Number of jobs in the array
    pub count: usize,
}

impl Allocation {
    fn new(label: String, minutes: u64, count: usize) -> Self {
        Allocation {
            label,
            time: format!("{}:00", minutes),
            count,
        }
    }
}

/// Estimated compute time in minutes.
pub fn compute_estimate(convert_estm: f64, num_files: f64) -> f64 {
    (500.0 + (2.5 + 1.5 * convert_estm) * num_files) / 60.0
}

/// Capacity of a bin, in minutes, for a largest estimate of `max_estimate` minutes.
pub fn bin_size(max_estimate: f64) -> f64 {
    (max_estimate * 1.4 / 600.0).ceil().max(1.0) * 600.0
}

/// First-fit-decreasing packing of estimates into bins of `bin_size`.
pub fn first_fit_decreasing(estimates: &[(String, f64)], bin_size: f64) -> Vec<Vec<String>> {
    let mut sorted: Vec<&(String, f64)> = estimates.iter().collect();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    let mut bins: Vec<(f64, Vec<String>)> = Vec::new();
    for (code, estimate) in sorted {
        match bins
            .iter_mut()
            .find(|(used, _)| used + estimate <= bin_size)
        {
            Some((used, codes)) => {
                *used += estimate;
                codes.push(code.clone());
            }
            None => bins.push((*estimate, vec![code.clone()])),
        }
    }
    bins.into_iter().map(|(_, codes)| codes).collect()
}

/// Smallest multiple of `default` that is at least `estimate`.
fn band_for(estimate: f64, default: u64) -> u64 {
    let multiple = (estimate / default as f64).ceil().max(1.0) as u64;
    multiple * default
}

/// Compute estimate of a project, if scan recorded its timings.
fn project_estimate(project: &mut ProjectOperation) -> Result<Option<f64>, PadoccError> {
    let convert = match project.detail_cfg.get("timings")? {
        Some(Value::Object(timings)) => timings.get("convert_estm").and_then(Value::as_f64),
        _ => None,
    };
    let num_files = project
        .detail_cfg
        .get("num_files")?
        .and_then(|v| v.as_f64());
    Ok(convert.zip(num_files).map(|(c, n)| compute_estimate(c, n)))
}

/// Band of a project without an estimate.
fn default_band(
    project: &mut ProjectOperation,
    phase: Phase,
    default: u64,
    options: AllocateOptions,
) -> Result<u64, PadoccError> {
    let mut band = default;
    if options.band_increase {
        if let Some((last_phase, time)) = project.get_last_run()? {
            if last_phase == phase.to_string() {
                band = match utils::get_seconds(&time) {
                    Ok(seconds) => seconds / 60 + default,
                    Err(_) => default * 2,
                };
            }
        }
    }
    if phase == Phase::Validate
        && project
            .detail_cfg
            .get_as::<bool>("quality_required")?
            .unwrap_or(false)
    {
        band = band.max(QUALITY_BAND);
    }
    Ok(band)
}

/// Assign every project of a subset to an allocation or a band, writing the code lists.
///
/// Returns the job arrays to submit, allocations first, then bands by increasing time.
#[tracing::instrument(level = "DEBUG", skip(group), fields(group = group.group_id()))]
pub fn assemble_allocations(
    group: &mut GroupOperation,
    phase: Phase,
    repeat_id: &str,
    options: AllocateOptions,
) -> Result<Vec<Allocation>, PadoccError> {
    let default = utils::get_seconds(utils::phase_time_budget(phase))? / 60;
    let mut estimates: Vec<(String, f64)> = Vec::new();
    let mut bands: BTreeMap<u64, Vec<String>> = BTreeMap::new();

    for code in group.get_codes(repeat_id)? {
        let mut project = group.get_project(&code);
        match project_estimate(&mut project)? {
            Some(estimate) if phase == Phase::Compute => {
                debug!("Estimated {:.1} minutes for {}", estimate, code);
                estimates.push((code, estimate));
            }
            _ => {
                let band = default_band(&mut project, phase, default, options)?;
                bands.entry(band).or_default().push(code);
            }
        }
    }

    let dir = group.proj_codes_dir().join(repeat_id);
    let file_options = group.options();
    let mut allocations = Vec::new();
    if options.binpack && estimates.len() >= BINPACK_MIN {
        let max = estimates.iter().map(|(_, e)| *e).fold(0.0, f64::max);
        let size = bin_size(max);
        let bins = first_fit_decreasing(&estimates, size);
        let alloc_dir = dir.join("allocations");
        for (index, codes) in bins.iter().enumerate() {
            ListFileHandler::with_value(&alloc_dir, &index.to_string(), codes.clone(), file_options)
                .close()?;
        }
        info!("Packed {} projects into {} allocations", estimates.len(), bins.len());
        allocations.push(Allocation::new(
            "allocations".to_string(),
            size as u64,
            bins.len(),
        ));
    } else {
        debug!("Skipped job allocations - using bands only");
        for (code, estimate) in estimates {
            bands
                .entry(band_for(estimate, default))
                .or_default()
                .push(code);
        }
    }

    for (minutes, codes) in &bands {
        let label = format!("band_{}", minutes);
        ListFileHandler::with_value(&dir, &label, codes.clone(), file_options).close()?;
        allocations.push(Allocation::new(label, *minutes, codes.len()));
    }
    for allocation in &allocations {
        info!(
            "{}: ({}) - {} jobs",
            allocation.label, allocation.time, allocation.count
        );
    }
    Ok(allocations)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::filehandlers::FileOptions;
    use crate::group::MAIN;
    use crate::project::ProjectSettings;
    use crate::test_utils;
    use serde_json::json;
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;

    fn set_timings(group: &GroupOperation, code: &str, convert_estm: f64, num_files: u64) {
        let mut project = group.get_project(code);
        project
            .detail_cfg
            .insert("timings", json!({"convert_estm": convert_estm, "concat_estm": 0.1}))
            .unwrap();
        project.detail_cfg.insert("num_files", num_files).unwrap();
        project.save_files().unwrap();
    }

    fn read_codes(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn estimates_and_bins() {
        assert_eq!(12.0, compute_estimate(13.0, 10.0));
        assert_eq!(600.0, bin_size(100.0));
        assert_eq!(1200.0, bin_size(500.0));
        assert_eq!(60, band_for(12.0, 60));
        assert_eq!(60, band_for(60.0, 60));
        assert_eq!(180, band_for(150.0, 60));
        assert_eq!(60, band_for(0.0, 60));
    }

    #[test]
    fn first_fit_packing() {
        let estimates: Vec<(String, f64)> = [("a", 5.0), ("b", 7.0), ("c", 3.0), ("d", 4.0), ("e", 1.0)]
            .iter()
            .map(|(c, e)| (c.to_string(), *e))
            .collect();
        let bins = first_fit_decreasing(&estimates, 10.0);
        assert_eq!(vec![vec!["b", "c"], vec!["a", "d", "e"]], bins);
    }

    #[test]
    fn banding() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = test_utils::new_group(tmp.path(), "g1", &["p1", "p2", "p3"]);
        set_timings(&group, "p1", 13.0, 10);
        set_timings(&group, "p2", 23.0, 100);
        set_timings(&group, "p3", 55.0, 100);

        let allocations =
            assemble_allocations(&mut group, Phase::Compute, MAIN, AllocateOptions::default())
                .unwrap();
        assert_eq!(
            vec![
                Allocation::new("band_60".to_string(), 60, 1),
                Allocation::new("band_120".to_string(), 120, 1),
                Allocation::new("band_180".to_string(), 180, 1),
            ],
            allocations
        );
        assert_eq!("60:00", allocations[0].time);
        let dir = tmp.path().join("groups/g1/proj_codes/main");
        assert_eq!(vec!["p1"], read_codes(&dir.join("band_60.txt")));
        assert_eq!(vec!["p2"], read_codes(&dir.join("band_120.txt")));
        assert_eq!(vec!["p3"], read_codes(&dir.join("band_180.txt")));

        let reopened = GroupOperation::new("g1", tmp.path(), ProjectSettings::default()).unwrap();
        assert_eq!(vec!["main"], reopened.subset_names());
    }

    #[test]
    fn binpacking_covers_every_code() {
        let tmp = tempfile::tempdir().unwrap();
        let codes = ["a", "b", "c", "d", "e", "f", "g"];
        let mut group = test_utils::new_group(tmp.path(), "g1", &codes);
        for (i, code) in codes.iter().take(6).enumerate() {
            set_timings(&group, code, 10.0 * (i + 1) as f64, 200);
        }
        let options = AllocateOptions {
            binpack: true,
            ..Default::default()
        };
        let allocations = assemble_allocations(&mut group, Phase::Compute, MAIN, options).unwrap();
        assert_eq!("allocations", allocations[0].label);
        assert_eq!(Allocation::new("band_60".to_string(), 60, 1), allocations[1]);

        let dir = tmp.path().join("groups/g1/proj_codes/main");
        let size = bin_size(compute_estimate(60.0, 200.0));
        let mut seen = HashSet::new();
        for i in 0..allocations[0].count {
            let mut total = 0.0;
            for code in read_codes(&dir.join(format!("allocations/{}.txt", i))) {
                let index = codes.iter().position(|c| *c == code).unwrap();
                total += compute_estimate(10.0 * (index + 1) as f64, 200.0);
                assert!(seen.insert(code));
            }
            assert!(total <= size);
        }
        assert_eq!(vec!["g"], read_codes(&dir.join("band_60.txt")));
        assert_eq!(6, seen.len());
    }

    #[test]
    fn few_estimates_are_banded() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = test_utils::new_group(tmp.path(), "g1", &["a", "b"]);
        set_timings(&group, "a", 13.0, 10);
        let options = AllocateOptions {
            binpack: true,
            ..Default::default()
        };
        let allocations = assemble_allocations(&mut group, Phase::Compute, MAIN, options).unwrap();
        assert_eq!(vec![Allocation::new("band_60".to_string(), 60, 2)], allocations);
    }

    #[test]
    fn band_increase_and_quality() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = test_utils::new_group(tmp.path(), "g1", &["a", "b", "c"]);
        let mut a = group.get_project("a");
        a.set_last_run(Phase::Validate, "31:00").unwrap();
        a.save_files().unwrap();
        let mut b = group.get_project("b");
        b.detail_cfg.insert("quality_required", true).unwrap();
        b.save_files().unwrap();

        let plain =
            assemble_allocations(&mut group, Phase::Validate, MAIN, AllocateOptions::default())
                .unwrap();
        assert_eq!(
            vec![
                Allocation::new("band_30".to_string(), 30, 2),
                Allocation::new("band_120".to_string(), 120, 1),
            ],
            plain
        );

        let options = AllocateOptions {
            band_increase: true,
            ..Default::default()
        };
        let widened = assemble_allocations(&mut group, Phase::Validate, MAIN, options).unwrap();
        assert_eq!(
            vec![
                Allocation::new("band_30".to_string(), 30, 1),
                Allocation::new("band_61".to_string(), 61, 1),
                Allocation::new("band_120".to_string(), 120, 1),
            ],
            widened
        );
    }

    #[test]
    fn dryrun_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        test_utils::new_group(tmp.path(), "g1", &["a"]);
        let settings = ProjectSettings {
            options: FileOptions {
                dryrun: true,
                forceful: false,
            },
            ..Default::default()
        };
        let mut group = GroupOperation::new("g1", tmp.path(), settings).unwrap();
        let allocations =
            assemble_allocations(&mut group, Phase::Scan, MAIN, AllocateOptions::default())
                .unwrap();
        assert_eq!(vec![Allocation::new("band_10".to_string(), 10, 1)], allocations);
        assert!(!tmp.path().join("groups/g1/proj_codes/main").exists());
    }
}
