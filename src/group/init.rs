//! Group initialisation.
//!
//! A group is initialised from a `datasets.csv`-shaped manifest, a text list of paths or
//! patterns, or a JSON base configuration of a single project.

use super::{GroupOperation, MAIN};
use crate::error::PadoccError;
use crate::filehandlers::{CsvFileHandler, FileOptions};
use crate::models::{BaseConfig, DatasetRow};
use crate::project::Phase;
use crate::utils;

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use validator::Validate;

/// Status recorded for every initialised project.
pub const INIT_COMPLETE: &str = "complete";

impl GroupOperation {
    /// Initialise the group from an input file.
    ///
    /// `.csv` files are read as a manifest, `.txt` files as a list of paths or patterns, and
    /// `.json` files as the base configuration of a single project.
    #[tracing::instrument(level = "DEBUG", skip(self), fields(group = %self.group_id))]
    pub fn init_from_file(&mut self, input_file: &Path) -> Result<(), PadoccError> {
        self.check_writable()?;
        info!(
            "Starting initialisation of {} from {}",
            self.group_id,
            input_file.display()
        );
        let rows = match input_file.extension().and_then(|e| e.to_str()) {
            Some("csv") => rows_from_csv(input_file, self.options())?,
            Some("txt") => rows_from_text(&utils::extract_file(input_file)?),
            Some("json") => {
                let config: BaseConfig = serde_json::from_str(&fs::read_to_string(input_file)?)?;
                config.validate()?;
                self.add_project(&config)?;
                return self.save_files();
            }
            _ => {
                return Err(PadoccError::InvalidConfig(format!(
                    "unrecognised input file {} - expected .csv, .txt or .json",
                    input_file.display()
                )))
            }
        };
        self.init_from_rows(rows)
    }

    /// Initialise one project per manifest row.
    ///
    /// Every row is resolved into a base configuration before anything is written.
    pub fn init_from_rows(&mut self, rows: Vec<DatasetRow>) -> Result<(), PadoccError> {
        let configs = rows
            .iter()
            .map(DatasetRow::base_config)
            .collect::<Result<Vec<_>, _>>()?;
        let total = configs.len();
        for (index, config) in configs.iter().enumerate() {
            self.init_project(config)?;
            debug!("Initialised {}/{}: {}", index + 1, total, config.proj_code);
        }
        for row in &rows {
            self.datasets.remove_code(&row.proj_code)?;
        }
        let mut manifest = self.datasets.get()?;
        manifest.extend(rows.iter().map(DatasetRow::to_row));
        self.datasets.set(manifest);
        self.save_files()?;
        info!("Created {} projects in {}", total, self.group_id);
        Ok(())
    }

    /// Create or refresh the files of one project and add it to the main subset.
    pub(crate) fn init_project(&mut self, config: &BaseConfig) -> Result<(), PadoccError> {
        let mut project = self.get_project(&config.proj_code);
        project.setup_config(config)?;
        project.update_status(Phase::Init, INIT_COMPLETE)?;
        project.save_files()?;
        let main = self.subset(MAIN)?;
        if !main.contains(&config.proj_code)? {
            main.append(&config.proj_code)?;
        }
        Ok(())
    }
}

/// Manifest rows of a CSV file, skipping a header row.
fn rows_from_csv(path: &Path, options: FileOptions) -> Result<Vec<DatasetRow>, PadoccError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut csv = CsvFileHandler::new(dir, &name, options);
    let rows = csv.get()?;
    let skip = rows
        .first()
        .map_or(false, |row| row.iter().any(|field| field == "proj_code"));
    rows.iter()
        .skip(usize::from(skip))
        .map(|row| DatasetRow::from_row(row))
        .collect()
}

/// Manifest rows of a list of paths or patterns.
///
/// Entries not ending in `.nc` or `.tif` are treated as directories, whose files must share a
/// single extension. Project codes are derived from the paths below their common directory.
fn rows_from_text(lines: &[String]) -> Vec<DatasetRow> {
    let prefix = if lines.len() > 1 {
        common_dir(lines)
    } else {
        String::new()
    };
    let mut rows = Vec::new();
    for line in lines {
        let pattern = if line.ends_with(".nc") || line.ends_with(".tif") {
            line.clone()
        } else {
            match common_extension(line) {
                Some(ext) => format!("{}/*.{}", line.trim_end_matches('/'), ext),
                None => {
                    warn!("Skipping {} - no single common file extension found", line);
                    continue;
                }
            }
        };
        let proj_code = proj_code_from_path(line, &prefix);
        match DatasetRow::from_row(&[proj_code, pattern]) {
            Ok(row) => rows.push(row),
            Err(err) => warn!("Skipping {}: {}", line, err),
        }
    }
    rows
}

/// The one extension shared by every file in `dir`.
fn common_extension(dir: &str) -> Option<String> {
    let pattern = format!(
        "{}/*",
        glob::Pattern::escape(dir.trim_end_matches('/'))
    );
    let extensions: BTreeSet<String> = glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .filter_map(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(String::from)
        })
        .collect();
    match extensions.len() {
        1 => extensions.into_iter().next(),
        _ => None,
    }
}

/// Longest common prefix of `lines`, cut back to a directory boundary.
fn common_dir(lines: &[String]) -> String {
    let Some(first) = lines.first() else {
        return String::new();
    };
    let mut len = first.len();
    for line in &lines[1..] {
        len = first
            .bytes()
            .zip(line.bytes())
            .take(len)
            .take_while(|(a, b)| a == b)
            .count();
    }
    let common = first.get(..len).unwrap_or("");
    match common.rfind('/') {
        Some(end) => common[..=end].to_string(),
        None => String::new(),
    }
}

/// Project code of a path: separators become `_`, and a trailing `<dir>/*.<ext>` is dropped.
fn proj_code_from_path(path: &str, prefix: &str) -> String {
    let stripped = path.strip_prefix(prefix).unwrap_or(path).replace('/', "_");
    let mut parts: Vec<&str> = stripped.split('_').collect();
    if parts.last().map_or(false, |last| last.contains("*.")) {
        parts.truncate(parts.len().saturating_sub(2));
    }
    parts.join("_").trim_matches('_').to_string()
}
