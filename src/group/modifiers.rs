//! Changes to the membership of a group.
//!
//! Moves between groups are checked in full before anything is changed. Project directories move
//! first; subsets, manifest and faultlist are only rewritten once every directory is in place.

use super::{GroupOperation, MAIN};
use crate::error::PadoccError;
use crate::filehandlers::FileHandler;
use crate::models::{BaseConfig, DatasetRow};

use hashbrown::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use validator::Validate;

/// Rows of `incoming` replace the rows of `current` keyed by the same project code.
fn merge_rows(current: Vec<Vec<String>>, incoming: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let codes: HashSet<String> = incoming
        .iter()
        .filter_map(|row| row.first().cloned())
        .collect();
    let mut rows: Vec<Vec<String>> = current
        .into_iter()
        .filter(|row| row.first().map_or(true, |code| !codes.contains(code)))
        .collect();
    rows.extend(incoming);
    rows
}

/// Codes of `incoming` not already in `current`, appended in order.
fn merge_codes(mut current: Vec<String>, incoming: Vec<String>) -> Vec<String> {
    for code in incoming {
        if !current.contains(&code) {
            current.push(code);
        }
    }
    current
}

impl GroupOperation {
    /// Directory a project of this group lives in.
    fn project_dir(&self, proj_code: &str) -> PathBuf {
        self.workdir()
            .join("in_progress")
            .join(self.group_id())
            .join(proj_code)
    }

    /// Add a project to the group, creating its files.
    pub fn add_project(&mut self, config: &BaseConfig) -> Result<(), PadoccError> {
        config.validate()?;
        self.init_project(config)?;
        self.datasets.remove_code(&config.proj_code)?;
        let row = DatasetRow {
            proj_code: config.proj_code.clone(),
            pattern: config.pattern.clone(),
            updates: None,
            removals: None,
        };
        self.datasets.append(row.to_row())?;
        info!("Added {} to {}", config.proj_code, self.group_id());
        Ok(())
    }

    /// Remove a project from every subset, the manifest and the faultlist, then delete its files.
    pub fn remove_project(&mut self, proj_code: &str) -> Result<(), PadoccError> {
        for subset in self.proj_codes.values_mut() {
            subset.remove(proj_code)?;
        }
        self.datasets.remove_code(proj_code)?;
        self.faultlist.remove_code(proj_code)?;
        self.get_project(proj_code).delete_project(false)?;
        self.save_files()?;
        info!("Removed {} from {}", proj_code, self.group_id());
        Ok(())
    }

    /// Move a project into another group.
    pub fn transfer_project(
        &mut self,
        proj_code: &str,
        receiver: &mut GroupOperation,
    ) -> Result<(), PadoccError> {
        self.hand_over(&[proj_code.to_string()], receiver)?;
        info!(
            "Transferred {} from {} to {}",
            proj_code,
            self.group_id(),
            receiver.group_id()
        );
        Ok(())
    }

    /// Merge another group into this one, consuming it.
    ///
    /// Codes held by both groups are rejected unless forceful overwrites are set.
    pub fn merge(&mut self, mut other: GroupOperation) -> Result<(), PadoccError> {
        info!("Merging {} into {}", other.group_id(), self.group_id());
        let proj_codes = other.get_codes(MAIN)?;
        other.check_hand_over(&proj_codes, self)?;
        other.move_projects(&proj_codes, self)?;

        let datasets = merge_rows(self.datasets.get()?, other.datasets.get()?);
        self.datasets.set(datasets);
        let faultlist = merge_rows(self.faultlist.get()?, other.faultlist.get()?);
        self.faultlist.set(faultlist);

        let dir = self.proj_codes_dir();
        for (name, mut subset) in other.proj_codes.drain() {
            match self.proj_codes.get_mut(&name) {
                Some(existing) => {
                    debug!("Merging subset {}", name);
                    let codes = merge_codes(existing.get()?, subset.get()?);
                    existing.set(codes);
                    subset.remove_file()?;
                }
                None => {
                    debug!("Migrating subset {}", name);
                    subset.move_file(&dir, None)?;
                    self.proj_codes.insert(name, subset);
                }
            }
        }
        other.datasets.remove_file()?;
        other.faultlist.remove_file()?;
        self.save_files()?;
        info!("Merge operation complete");
        Ok(())
    }

    /// Split the given projects out of this group into another.
    pub fn unmerge(
        &mut self,
        other: &mut GroupOperation,
        proj_codes: &[String],
    ) -> Result<(), PadoccError> {
        info!(
            "Separating {} projects from {} to {}",
            proj_codes.len(),
            self.group_id(),
            other.group_id()
        );
        self.hand_over(proj_codes, other)?;
        info!("Unmerge operation complete");
        Ok(())
    }

    /// Check that every project can move from this group into `receiver`.
    ///
    /// Each code must be in this group. Unless forceful, no code may already be in the receiver
    /// and no project directory may already exist there.
    fn check_hand_over(
        &mut self,
        proj_codes: &[String],
        receiver: &mut GroupOperation,
    ) -> Result<(), PadoccError> {
        let forceful = receiver.options().forceful;
        for proj_code in proj_codes {
            if !self.subset(MAIN)?.contains(proj_code)? {
                return Err(PadoccError::ProjectCode {
                    proj_code: proj_code.to_string(),
                    reason: format!("not found in group {}", self.group_id()),
                });
            }
            if forceful {
                continue;
            }
            if receiver.subset(MAIN)?.contains(proj_code)? {
                return Err(PadoccError::ProjectCode {
                    proj_code: proj_code.to_string(),
                    reason: format!("already in group {}", receiver.group_id()),
                });
            }
            if receiver.project_dir(proj_code).exists() {
                return Err(PadoccError::NoOverwrite);
            }
        }
        Ok(())
    }

    /// Move project directories into `receiver`.
    ///
    /// If one move fails the directories already moved are returned to this group.
    fn move_projects(
        &self,
        proj_codes: &[String],
        receiver: &GroupOperation,
    ) -> Result<(), PadoccError> {
        let mut moved: Vec<&str> = Vec::new();
        for proj_code in proj_codes {
            debug!("Migrating project {}", proj_code);
            let result = self
                .get_project(proj_code)
                .move_to(&receiver.project_dir(proj_code));
            if let Err(err) = result {
                for proj_code in moved.into_iter().rev() {
                    let restored = receiver
                        .get_project(proj_code)
                        .move_to(&self.project_dir(proj_code));
                    if let Err(undo) = restored {
                        warn!("Failed to return {} to {}: {}", proj_code, self.group_id(), undo);
                    }
                }
                return Err(err);
            }
            moved.push(proj_code);
        }
        Ok(())
    }

    /// Move projects with their manifest and faultlist rows into `receiver`.
    fn hand_over(
        &mut self,
        proj_codes: &[String],
        receiver: &mut GroupOperation,
    ) -> Result<(), PadoccError> {
        let proj_codes = merge_codes(Vec::new(), proj_codes.to_vec());
        self.check_hand_over(&proj_codes, receiver)?;
        self.move_projects(&proj_codes, receiver)?;

        for proj_code in &proj_codes {
            for subset in self.proj_codes.values_mut() {
                subset.remove(proj_code)?;
            }
            let main = receiver.subset(MAIN)?;
            if !main.contains(proj_code)? {
                main.append(proj_code)?;
            }
            let datasets = merge_rows(
                receiver.datasets.get()?,
                self.datasets.remove_code(proj_code)?,
            );
            receiver.datasets.set(datasets);
            let mut faultlist = receiver.faultlist.get()?;
            faultlist.retain(|row| row.first() != Some(proj_code));
            faultlist.extend(self.faultlist.remove_code(proj_code)?);
            receiver.faultlist.set(faultlist);
        }
        self.save_files()?;
        receiver.save_files()?;
        Ok(())
    }
}
