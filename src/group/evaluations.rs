//! Status and data summaries over the projects of a group.

use super::GroupOperation;
use crate::error::PadoccError;
use crate::project::{Phase, SUCCESS};
use crate::utils::{self, deformat_float, format_float, format_str};

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use time::{Duration, PrimitiveDateTime};
use tracing::{debug, info};

/// Status of a submitted job that has not started.
pub const PENDING: &str = "pending";

/// Status given to jobs left pending for too long.
pub const JOB_CANCELLED: &str = "JobCancelled";

/// Status of projects without a status log.
const UNKNOWN: &str = "Unknown";

/// Longest status shown in full.
const STATUS_WIDTH: usize = 30;

/// Age after which a pending job is taken to be cancelled.
fn pending_limit() -> Duration {
    Duration::days(1)
}

/// Last status of every project of a subset
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusReport {
    pub group_id: String,
    pub total: usize,
    /// Codes by phase and status, for projects not complete
    pub phases: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// Codes that passed validation
    pub complete: Vec<String>,
    /// Number of faultlist entries by reason
    pub faultlist: BTreeMap<String, usize>,
}

impl StatusReport {
    /// Codes whose last status matches, optionally within one phase.
    pub fn matching(&self, status: &str, phase: Option<Phase>) -> Vec<String> {
        if status == "complete" && phase.map_or(true, |p| p == Phase::Validate) {
            return self.complete.clone();
        }
        self.phases
            .iter()
            .filter(|(name, _)| phase.map_or(true, |p| p.to_string() == **name))
            .filter_map(|(_, statuses)| statuses.get(status))
            .flatten()
            .cloned()
            .collect()
    }
}

fn percent(count: usize, total: usize) -> String {
    let value = if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    };
    format_str(&format!("{:.1}", value), 4, false)
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Group: {}", self.group_id)?;
        writeln!(f, "  Total Codes: {}", self.total)?;
        writeln!(f)?;
        writeln!(f, "Pipeline Current:")?;
        for (phase, statuses) in &self.phases {
            let count: usize = statuses.values().map(Vec::len).sum();
            writeln!(f)?;
            writeln!(
                f,
                "   {}: {} [{}%] (Variety: {})",
                format_str(phase, 10, false),
                format_str(&count.to_string(), 5, false),
                percent(count, self.total),
                statuses.len()
            )?;
            let mut ordered: Vec<_> = statuses.iter().collect();
            ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
            for (status, codes) in ordered {
                writeln!(
                    f,
                    "    - {}: {}",
                    format_str(status, STATUS_WIDTH + 1, true),
                    codes.len()
                )?;
            }
        }
        writeln!(f)?;
        writeln!(f, "Pipeline Complete:")?;
        writeln!(f)?;
        writeln!(
            f,
            "   complete  : {} [{}%]",
            format_str(&self.complete.len().to_string(), 5, false),
            percent(self.complete.len(), self.total)
        )?;
        for (reason, count) in &self.faultlist {
            writeln!(
                f,
                "   {}: {}",
                format_str(reason, STATUS_WIDTH + 1, true),
                count
            )?;
        }
        Ok(())
    }
}

/// Data volumes and formats across the projects of a subset
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataSummary {
    pub group_id: String,
    pub projects: usize,
    pub cloud_formats: BTreeMap<String, usize>,
    pub file_types: BTreeMap<String, usize>,
    pub source_files: Vec<f64>,
    pub source_data: Vec<f64>,
    pub cloud_data: Vec<f64>,
    pub chunks_per_file: Vec<f64>,
    pub total_chunks: Vec<f64>,
}

fn total_and_mean(values: &[f64]) -> (f64, f64) {
    let total: f64 = values.iter().sum();
    let mean = if values.is_empty() {
        0.0
    } else {
        total / values.len() as f64
    };
    (total, mean)
}

fn detail_number(detail: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    match detail.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok().or_else(|| deformat_float(s)),
        _ => None,
    }
}

impl fmt::Display for DataSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let volume = |v: f64| format_float(v).unwrap_or_else(|| "0 B".to_string());
        writeln!(f, "Summary Report: {}", self.group_id)?;
        writeln!(f, "Project Codes: {}", self.projects)?;
        writeln!(f)?;
        let (files, files_mean) = total_and_mean(&self.source_files);
        writeln!(
            f,
            "Source Files: {} [Avg. {:.2} per project]",
            files, files_mean
        )?;
        let (source, source_mean) = total_and_mean(&self.source_data);
        writeln!(
            f,
            "Source Data: {} [Avg. {} per project]",
            volume(source),
            volume(source_mean)
        )?;
        let (cloud, cloud_mean) = total_and_mean(&self.cloud_data);
        writeln!(
            f,
            "Cloud Data: {} [Avg. {} per project]",
            volume(cloud),
            volume(cloud_mean)
        )?;
        writeln!(f)?;
        writeln!(f, "Cloud Formats: {:?}", self.cloud_formats.keys().collect::<Vec<_>>())?;
        writeln!(f, "File Types: {:?}", self.file_types.keys().collect::<Vec<_>>())?;
        writeln!(f)?;
        let (cpf, cpf_mean) = total_and_mean(&self.chunks_per_file);
        writeln!(
            f,
            "Chunks per File: {:.1} [Avg. {:.2} per project]",
            cpf, cpf_mean
        )?;
        let (chunks, chunks_mean) = total_and_mean(&self.total_chunks);
        writeln!(
            f,
            "Total Chunks: {:.0} [Avg. {:.2} per project]",
            chunks, chunks_mean
        )
    }
}

impl GroupOperation {
    /// Summarise the last status of every project in a subset.
    ///
    /// Projects in the faultlist are skipped. With `write`, jobs pending for more than a day
    /// are recorded as cancelled.
    pub fn summarise_status(
        &mut self,
        repeat_id: &str,
        write: bool,
    ) -> Result<StatusReport, PadoccError> {
        if write {
            info!("Write permission granted - pending jobs older than a day will be cancelled");
        }
        let codes = self.get_codes(repeat_id)?;
        let mut report = StatusReport {
            group_id: self.group_id().to_string(),
            total: codes.len(),
            ..Default::default()
        };
        for row in self.faultlist.rows()? {
            let reason = row.get(1).cloned().unwrap_or_default();
            *report.faultlist.entry(reason).or_default() += 1;
        }

        let now = utils::now();
        let now = PrimitiveDateTime::new(now.date(), now.time());
        for code in codes {
            if self.fault_reason(&code)?.is_some() {
                continue;
            }
            let mut project = self.get_project(&code);
            let (phase, mut status, stamp) = match project.get_last_status()? {
                Some(row) => (
                    row.first().cloned().unwrap_or_default(),
                    row.get(1).cloned().unwrap_or_default(),
                    row.get(2).cloned().unwrap_or_default(),
                ),
                None => (Phase::Init.to_string(), UNKNOWN.to_string(), String::new()),
            };
            if write && status == PENDING {
                let stale = utils::parse_status_timestamp(&stamp)
                    .map_or(false, |then| now - then > pending_limit());
                if stale {
                    let phase: Phase = phase.parse()?;
                    project.update_status(phase, JOB_CANCELLED)?;
                    project.save_files()?;
                    status = JOB_CANCELLED.to_string();
                }
            }
            if phase == Phase::Validate.to_string() && status == SUCCESS {
                report.complete.push(code);
            } else {
                report
                    .phases
                    .entry(phase)
                    .or_default()
                    .entry(status)
                    .or_default()
                    .push(code);
            }
        }
        info!("\n{}", report);
        Ok(report)
    }

    /// Create a subset from the projects of `old_repeat_id` whose last status matches.
    ///
    /// Returns the number of projects in the new subset.
    pub fn repeat_by_status(
        &mut self,
        status: &str,
        new_repeat_id: &str,
        phase: Option<Phase>,
        old_repeat_id: &str,
    ) -> Result<usize, PadoccError> {
        let codes = self
            .summarise_status(old_repeat_id, false)?
            .matching(status, phase);
        let count = codes.len();
        self.add_proj_codeset(new_repeat_id, codes);
        self.save_files()?;
        info!("Created subset {} with {} projects", new_repeat_id, count);
        Ok(count)
    }

    /// Remove every project of `old_repeat_id` whose last status matches.
    pub fn remove_by_status(
        &mut self,
        status: &str,
        phase: Option<Phase>,
        old_repeat_id: &str,
    ) -> Result<usize, PadoccError> {
        let codes = self
            .summarise_status(old_repeat_id, false)?
            .matching(status, phase);
        for code in &codes {
            self.remove_project(code)?;
        }
        self.save_files()?;
        Ok(codes.len())
    }

    /// Combine subsets into a new one, optionally deleting the inputs.
    pub fn merge_subsets(
        &mut self,
        subsets: &[&str],
        combined_id: &str,
        remove_after: bool,
    ) -> Result<(), PadoccError> {
        let mut combined: Vec<String> = Vec::new();
        for subset in subsets {
            for code in self.get_codes(subset)? {
                if !combined.contains(&code) {
                    combined.push(code);
                }
            }
        }
        debug!("Merged {} subsets into {}", subsets.len(), combined_id);
        self.add_proj_codeset(combined_id, combined);
        if remove_after {
            for subset in subsets {
                if *subset != combined_id {
                    self.delete_proj_codeset(subset)?;
                }
            }
        }
        self.save_files()
    }

    /// Summarise the data volumes and formats of a subset.
    pub fn summarise_data(&mut self, repeat_id: &str) -> Result<DataSummary, PadoccError> {
        let codes = self.get_codes(repeat_id)?;
        let mut summary = DataSummary {
            group_id: self.group_id().to_string(),
            projects: codes.len(),
            ..Default::default()
        };
        for code in codes {
            let mut project = self.get_project(&code);
            *summary
                .cloud_formats
                .entry(project.cloud_format()?.to_string())
                .or_default() += 1;
            if let Some(file_type) = project.file_type()? {
                *summary.file_types.entry(file_type.to_string()).or_default() += 1;
            }
            let detail = project.detail_cfg.value()?;
            let push = |key: &str, values: &mut Vec<f64>| {
                if let Some(value) = detail_number(detail, key) {
                    values.push(value);
                }
            };
            push("num_files", &mut summary.source_files);
            push("netcdf_data", &mut summary.source_data);
            push("kerchunk_data", &mut summary.cloud_data);
            push("chunks_per_file", &mut summary.chunks_per_file);
            push("total_chunks", &mut summary.total_chunks);
        }
        info!("\n{}", summary);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::group::{RunOptions, MAIN};
    use crate::project::ProjectSettings;
    use crate::test_utils;
    use time::OffsetDateTime;

    #[test]
    fn status_report() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = test_utils::new_group(tmp.path(), "g1", &["a", "b", "c", "d"]);
        group.add_to_faultlist("d", "corrupt").unwrap();
        group
            .run(
                Phase::Scan,
                &RunOptions {
                    proj_code: Some("a".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let mut b = group.get_project("b");
        b.update_status(Phase::Validate, SUCCESS).unwrap();
        b.save_files().unwrap();

        let report = group.summarise_status(MAIN, false).unwrap();
        assert_eq!(4, report.total);
        assert_eq!(vec!["b"], report.complete);
        assert_eq!(vec!["a"], report.phases["scan"][SUCCESS]);
        assert_eq!(vec!["c"], report.phases["init"]["complete"]);
        assert_eq!(Some(&1), report.faultlist.get("corrupt"));
        assert_eq!(vec!["c"], report.matching("complete", Some(Phase::Init)));
        assert_eq!(vec!["b"], report.matching("complete", None));

        let rendered = report.to_string();
        assert!(rendered.contains("Total Codes: 4"));
        assert!(rendered.contains("complete  : 1     [25.0%]"));
        assert!(rendered.contains("corrupt"));
    }

    #[test]
    fn stale_pending_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = test_utils::new_group(tmp.path(), "g1", &["a", "b"]);
        let old = utils::status_timestamp(OffsetDateTime::now_utc() - Duration::days(3));
        let mut a = group.get_project("a");
        a.status_log
            .append(vec!["compute".into(), PENDING.into(), old, String::new()])
            .unwrap();
        a.save_files().unwrap();
        let mut b = group.get_project("b");
        b.update_status(Phase::Compute, PENDING).unwrap();
        b.save_files().unwrap();

        let report = group.summarise_status(MAIN, false).unwrap();
        assert_eq!(2, report.phases["compute"][PENDING].len());

        let report = group.summarise_status(MAIN, true).unwrap();
        assert_eq!(vec!["a"], report.phases["compute"][JOB_CANCELLED]);
        assert_eq!(vec!["b"], report.phases["compute"][PENDING]);
        assert_eq!(
            JOB_CANCELLED,
            group.get_project("a").get_last_status().unwrap().unwrap()[1]
        );
    }

    #[test]
    fn repeat_and_remove_by_status() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = test_utils::new_group(tmp.path(), "g1", &["a", "b", "c"]);
        let options = RunOptions {
            subset_bypass: true,
            subset: Some((2, 0)),
            ..Default::default()
        };
        group.run(Phase::Validate, &options).unwrap();

        let failed = "Failed - MissingKerchunk";
        assert_eq!(
            2,
            group
                .repeat_by_status(failed, "retry", Some(Phase::Validate), MAIN)
                .unwrap()
        );
        assert_eq!(vec!["a", "b"], group.get_codes("retry").unwrap());
        assert_eq!(0, group.repeat_by_status(failed, "none", Some(Phase::Scan), MAIN).unwrap());

        assert_eq!(2, group.remove_by_status(failed, None, "retry").unwrap());
        assert_eq!(vec!["c"], group.get_codes(MAIN).unwrap());
        assert!(group.get_codes("retry").unwrap().is_empty());
    }

    #[test]
    fn merging_subsets() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = GroupOperation::new("g1", tmp.path(), ProjectSettings::default()).unwrap();
        group.add_proj_codeset("r1", vec!["a".to_string(), "b".to_string()]);
        group.add_proj_codeset("r2", vec!["b".to_string(), "c".to_string()]);
        group.merge_subsets(&["r1", "r2"], "both", true).unwrap();
        assert_eq!(vec!["a", "b", "c"], group.get_codes("both").unwrap());
        assert_eq!(vec!["both", "main"], group.subset_names());
        assert!(group.merge_subsets(&["r1"], "again", false).is_err());
    }

    #[test]
    fn data_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut group = test_utils::new_group(tmp.path(), "g1", &["a", "b"]);
        for (code, files) in [("a", 10), ("b", 30)] {
            let mut project = group.get_project(code);
            project.detail_cfg.insert("num_files", files).unwrap();
            project.detail_cfg.insert("netcdf_data", "1.00 GB").unwrap();
            project.detail_cfg.insert("chunks_per_file", "2.0").unwrap();
            project.save_files().unwrap();
        }
        let summary = group.summarise_data(MAIN).unwrap();
        assert_eq!(2, summary.projects);
        assert_eq!(vec![10.0, 30.0], summary.source_files);
        assert_eq!(vec![1e9, 1e9], summary.source_data);
        assert_eq!(Some(&2), summary.cloud_formats.get("kerchunk"));
        let rendered = summary.to_string();
        assert!(rendered.contains("Source Files: 40 [Avg. 20.00 per project]"));
        assert!(rendered.contains("Source Data: 2.00 GB"));
    }
}
