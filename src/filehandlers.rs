//! Filehandle layer.
//!
//! One handle per on-disk file. Every handle loads lazily on first access, caches the value
//! until [FileHandler::close], and only writes back when the value was modified. The `dryrun`
//! option suppresses every write path while still allowing reads.

use crate::dataset::Dataset;
use crate::error::PadoccError;
use crate::references::{self, RefSet, RefValue};
use crate::utils;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

/// JSON object type held by [JsonFileHandler].
pub type JsonMap = Map<String, Value>;

/// Options shared by every handle of an operation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileOptions {
    /// Suppress all writes
    pub dryrun: bool,
    /// Allow overwriting existing artifacts
    pub forceful: bool,
}

/// Location of a handle on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct FileLocation {
    dir: PathBuf,
    name: String,
    extension: Option<&'static str>,
    options: FileOptions,
}

impl FileLocation {
    /// Return a new FileLocation
    ///
    /// # Arguments
    ///
    /// * `dir`: Parent directory
    /// * `name`: File name without extension. May contain sub-directories.
    /// * `extension`: Fixed extension, or `None` for directories and pre-named files
    /// * `options`: Dryrun and forceful flags
    pub fn new(
        dir: &Path,
        name: &str,
        extension: Option<&'static str>,
        options: FileOptions,
    ) -> Self {
        let name = match extension {
            Some(ext) => name
                .strip_suffix(&format!(".{}", ext))
                .unwrap_or(name)
                .to_string(),
            None => name.to_string(),
        };
        FileLocation {
            dir: dir.to_path_buf(),
            name,
            extension,
            options,
        }
    }

    /// Full path of the file.
    pub fn path(&self) -> PathBuf {
        match self.extension {
            Some(ext) => self.dir.join(format!("{}.{}", self.name, ext)),
            None => self.dir.join(&self.name),
        }
    }

    /// Parent directory given at construction.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name without extension.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> FileOptions {
        self.options
    }

    pub fn set_options(&mut self, options: FileOptions) {
        self.options = options
    }

    fn read(&self) -> Result<Option<String>, PadoccError> {
        let path = self.path();
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    fn write(&self, contents: &str) -> Result<(), PadoccError> {
        let path = self.path();
        if self.options.dryrun {
            debug!("DRYRUN: Skip writing {}", path.display());
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    fn create(&self) -> Result<(), PadoccError> {
        let path = self.path();
        if self.options.dryrun {
            debug!("DRYRUN: Skip creating {}", path.display());
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            if self.extension.is_some() {
                fs::File::create(&path)?;
            } else {
                fs::create_dir_all(&path)?;
            }
        }
        Ok(())
    }

    fn remove(&self) -> Result<(), PadoccError> {
        let path = self.path();
        if self.options.dryrun {
            debug!("DRYRUN: Skip removing {}", path.display());
            return Ok(());
        }
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn move_to(&mut self, new_dir: &Path, new_name: Option<&str>) -> Result<(), PadoccError> {
        let mut moved = self.clone();
        moved.dir = new_dir.to_path_buf();
        if let Some(name) = new_name {
            moved.name = name.to_string();
        }
        if self.options.dryrun {
            debug!(
                "DRYRUN: Skip moving {} to {}",
                self.path().display(),
                moved.path().display()
            );
            return Ok(());
        }
        let (from, to) = (self.path(), moved.path());
        if from.exists() {
            if to.exists() && !self.options.forceful {
                return Err(PadoccError::NoOverwrite);
            }
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&from, &to)?;
        }
        *self = moved;
        Ok(())
    }
}

/// Uniform contract over every on-disk handle.
pub trait FileHandler {
    /// Location of this handle.
    fn location(&self) -> &FileLocation;

    /// Mutable location of this handle.
    fn location_mut(&mut self) -> &mut FileLocation;

    /// Flush the cached value if it was modified.
    ///
    /// Safe to call when nothing was loaded.
    fn close(&mut self) -> Result<(), PadoccError>;

    /// Forget any cached value.
    fn reset(&mut self);

    /// Full path of the file.
    fn path(&self) -> PathBuf {
        self.location().path()
    }

    /// Whether the file exists on disk.
    fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Create an empty file (and missing parents).
    fn create_file(&self) -> Result<(), PadoccError> {
        self.location().create()
    }

    /// Remove the file from disk and drop the cached value.
    fn remove_file(&mut self) -> Result<(), PadoccError> {
        self.location().remove()?;
        if !self.location().options().dryrun {
            self.reset();
        }
        Ok(())
    }

    /// Move the file into a new directory, optionally renaming it.
    fn move_file(&mut self, new_dir: &Path, new_name: Option<&str>) -> Result<(), PadoccError> {
        self.close()?;
        self.location_mut().move_to(new_dir, new_name)
    }
}

macro_rules! impl_location {
    () => {
        fn location(&self) -> &FileLocation {
            &self.location
        }

        fn location_mut(&mut self) -> &mut FileLocation {
            &mut self.location
        }
    };
}

/// Handle over a JSON map file (`.json`).
#[derive(Debug)]
pub struct JsonFileHandler {
    location: FileLocation,
    value: Option<JsonMap>,
    dirty: bool,
}

impl JsonFileHandler {
    pub fn new(dir: &Path, name: &str, options: FileOptions) -> Self {
        JsonFileHandler {
            location: FileLocation::new(dir, name, Some("json"), options),
            value: None,
            dirty: false,
        }
    }

    fn load(&mut self) -> Result<&mut JsonMap, PadoccError> {
        if self.value.is_none() {
            let value = match self.location.read()? {
                Some(content) => match serde_json::from_str::<Value>(&content) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) | Err(_) => {
                        warn!(
                            "Contents of {} are not a JSON map - loading as empty",
                            self.location.path().display()
                        );
                        JsonMap::new()
                    }
                },
                None => JsonMap::new(),
            };
            self.value = Some(value);
        }
        Ok(self.value.get_or_insert_with(JsonMap::new))
    }

    /// Borrow the whole map.
    pub fn value(&mut self) -> Result<&JsonMap, PadoccError> {
        Ok(self.load()?)
    }

    /// Mutably borrow the whole map, marking it modified.
    pub fn value_mut(&mut self) -> Result<&mut JsonMap, PadoccError> {
        self.dirty = true;
        self.load()
    }

    /// Replace the whole map.
    pub fn set(&mut self, value: JsonMap) {
        self.value = Some(value);
        self.dirty = true;
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Value>, PadoccError> {
        Ok(self.load()?.get(key).cloned())
    }

    /// Value of a key deserialised into `T`; null counts as missing.
    pub fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, PadoccError> {
        match self.load()?.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn get_or(&mut self, key: &str, default: Value) -> Result<Value, PadoccError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn insert<V: Into<Value>>(&mut self, key: &str, value: V) -> Result<(), PadoccError> {
        self.value_mut()?.insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, PadoccError> {
        let removed = self.load()?.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        Ok(removed)
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool, PadoccError> {
        Ok(self.load()?.contains_key(key))
    }

    pub fn keys(&mut self) -> Result<Vec<String>, PadoccError> {
        Ok(self.load()?.keys().cloned().collect())
    }

    pub fn is_empty(&mut self) -> Result<bool, PadoccError> {
        Ok(self.load()?.is_empty())
    }
}

impl FileHandler for JsonFileHandler {
    impl_location!();

    fn close(&mut self) -> Result<(), PadoccError> {
        if self.dirty {
            if let Some(value) = &self.value {
                self.location
                    .write(&serde_json::to_string_pretty(value)?)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.value = None;
        self.dirty = false;
    }
}

/// Handle over a newline-separated text list.
#[derive(Debug)]
pub struct ListFileHandler {
    location: FileLocation,
    value: Option<Vec<String>>,
    dirty: bool,
}

impl ListFileHandler {
    /// Return a new text list handle (`.txt`).
    pub fn new(dir: &Path, name: &str, options: FileOptions) -> Self {
        Self::with_extension(dir, name, "txt", options)
    }

    /// Return a new text list handle holding an initial value, which is written on close.
    pub fn with_value(dir: &Path, name: &str, init: Vec<String>, options: FileOptions) -> Self {
        let mut handle = Self::new(dir, name, options);
        handle.set(init);
        handle
    }

    fn with_extension(
        dir: &Path,
        name: &str,
        extension: &'static str,
        options: FileOptions,
    ) -> Self {
        ListFileHandler {
            location: FileLocation::new(dir, name, Some(extension), options),
            value: None,
            dirty: false,
        }
    }

    fn load(&mut self) -> Result<&mut Vec<String>, PadoccError> {
        if self.value.is_none() {
            let value = match self.location.read()? {
                Some(content) => content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect(),
                None => Vec::new(),
            };
            self.value = Some(value);
        }
        Ok(self.value.get_or_insert_with(Vec::new))
    }

    /// Borrow the items.
    pub fn items(&mut self) -> Result<&[String], PadoccError> {
        Ok(self.load()?.as_slice())
    }

    /// Copy of the items.
    pub fn get(&mut self) -> Result<Vec<String>, PadoccError> {
        Ok(self.load()?.clone())
    }

    pub fn set(&mut self, value: Vec<String>) {
        self.value = Some(value);
        self.dirty = true;
    }

    pub fn append(&mut self, item: &str) -> Result<(), PadoccError> {
        self.load()?.push(item.to_string());
        self.dirty = true;
        Ok(())
    }

    /// Remove every occurrence of an item, returning whether any was present.
    pub fn remove(&mut self, item: &str) -> Result<bool, PadoccError> {
        let items = self.load()?;
        let before = items.len();
        items.retain(|i| i != item);
        let removed = items.len() != before;
        if removed {
            self.dirty = true;
        }
        Ok(removed)
    }

    pub fn contains(&mut self, item: &str) -> Result<bool, PadoccError> {
        Ok(self.load()?.iter().any(|i| i == item))
    }

    pub fn index(&mut self, index: usize) -> Result<Option<String>, PadoccError> {
        Ok(self.load()?.get(index).cloned())
    }

    pub fn len(&mut self) -> Result<usize, PadoccError> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&mut self) -> Result<bool, PadoccError> {
        Ok(self.load()?.is_empty())
    }
}

impl FileHandler for ListFileHandler {
    impl_location!();

    fn close(&mut self) -> Result<(), PadoccError> {
        if self.dirty {
            if let Some(value) = &self.value {
                self.location.write(&value.join("\n"))?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.value = None;
        self.dirty = false;
    }
}

/// Handle over a per-phase log (`phase_logs/<phase>.log`).
///
/// Shares the text list contract.
#[derive(Debug)]
pub struct LogFileHandler(ListFileHandler);

impl LogFileHandler {
    /// Return a new log handle under `dir/phase_logs`.
    pub fn new(dir: &Path, phase: &str, options: FileOptions) -> Self {
        LogFileHandler(ListFileHandler::with_extension(
            &dir.join("phase_logs"),
            phase,
            "log",
            options,
        ))
    }
}

impl Deref for LogFileHandler {
    type Target = ListFileHandler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LogFileHandler {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FileHandler for LogFileHandler {
    fn location(&self) -> &FileLocation {
        self.0.location()
    }

    fn location_mut(&mut self) -> &mut FileLocation {
        self.0.location_mut()
    }

    fn close(&mut self) -> Result<(), PadoccError> {
        self.0.close()
    }

    fn reset(&mut self) {
        self.0.reset()
    }
}

/// Handle over comma-separated rows (`.csv`).
#[derive(Debug)]
pub struct CsvFileHandler {
    location: FileLocation,
    value: Option<Vec<Vec<String>>>,
    dirty: bool,
}

impl CsvFileHandler {
    pub fn new(dir: &Path, name: &str, options: FileOptions) -> Self {
        CsvFileHandler {
            location: FileLocation::new(dir, name, Some("csv"), options),
            value: None,
            dirty: false,
        }
    }

    fn load(&mut self) -> Result<&mut Vec<Vec<String>>, PadoccError> {
        if self.value.is_none() {
            let value = match self.location.read()? {
                Some(content) => content
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(|l| l.split(',').map(|f| f.trim().to_string()).collect())
                    .collect(),
                None => Vec::new(),
            };
            self.value = Some(value);
        }
        Ok(self.value.get_or_insert_with(Vec::new))
    }

    pub fn rows(&mut self) -> Result<&[Vec<String>], PadoccError> {
        Ok(self.load()?.as_slice())
    }

    pub fn get(&mut self) -> Result<Vec<Vec<String>>, PadoccError> {
        Ok(self.load()?.clone())
    }

    pub fn set(&mut self, rows: Vec<Vec<String>>) {
        self.value = Some(rows);
        self.dirty = true;
    }

    pub fn append(&mut self, row: Vec<String>) -> Result<(), PadoccError> {
        self.load()?.push(row);
        self.dirty = true;
        Ok(())
    }

    /// Last row, if any.
    pub fn last(&mut self) -> Result<Option<Vec<String>>, PadoccError> {
        Ok(self.load()?.last().cloned())
    }

    pub fn len(&mut self) -> Result<usize, PadoccError> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&mut self) -> Result<bool, PadoccError> {
        Ok(self.load()?.is_empty())
    }

    /// First row keyed by `code` in its first column.
    pub fn find(&mut self, code: &str) -> Result<Option<Vec<String>>, PadoccError> {
        Ok(self
            .load()?
            .iter()
            .find(|row| row.first().map(String::as_str) == Some(code))
            .cloned())
    }

    pub fn contains_code(&mut self, code: &str) -> Result<bool, PadoccError> {
        Ok(self.find(code)?.is_some())
    }

    /// Remove every row keyed by `code`, returning the removed rows.
    pub fn remove_code(&mut self, code: &str) -> Result<Vec<Vec<String>>, PadoccError> {
        let rows = self.load()?;
        let (removed, kept): (Vec<_>, Vec<_>) = rows
            .drain(..)
            .partition(|row| row.first().map(String::as_str) == Some(code));
        *rows = kept;
        if !removed.is_empty() {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// Append a status row `phase,status,HH:MM DD/MM/YY,job_id`.
    ///
    /// Commas and newlines in the status are replaced with `.`.
    pub fn update_status(
        &mut self,
        phase: &str,
        status: &str,
        job_id: Option<&str>,
    ) -> Result<(), PadoccError> {
        let status = status.replace([',', '\n'], ".");
        let row = vec![
            phase.to_string(),
            status.clone(),
            utils::status_timestamp(utils::now()),
            job_id.unwrap_or_default().to_string(),
        ];
        self.append(row)?;
        info!("Updated new status: {} - {}", phase, status);
        Ok(())
    }
}

impl FileHandler for CsvFileHandler {
    impl_location!();

    fn close(&mut self) -> Result<(), PadoccError> {
        if self.dirty {
            if let Some(value) = &self.value {
                let content = value
                    .iter()
                    .map(|row| row.join(","))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.location.write(&content)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.value = None;
        self.dirty = false;
    }
}

/// Handle over a single kerchunk reference file.
#[derive(Debug)]
pub struct KerchunkFile(JsonFileHandler);

impl KerchunkFile {
    pub fn new(dir: &Path, name: &str, options: FileOptions) -> Self {
        KerchunkFile(JsonFileHandler::new(dir, name, options))
    }

    /// Parse the file as a reference set.
    pub fn refs(&mut self) -> Result<RefSet, PadoccError> {
        let value = Value::Object(self.0.value()?.clone());
        serde_json::from_value(value).map_err(|err| PadoccError::KerchunkDecode {
            reason: err.to_string(),
        })
    }

    /// Replace the file content with a reference set.
    pub fn set_refs(&mut self, refs: &RefSet) -> Result<(), PadoccError> {
        match serde_json::to_value(refs)? {
            Value::Object(map) => {
                self.0.set(map);
                Ok(())
            }
            _ => Err(PadoccError::KerchunkDecode {
                reason: "reference set is not a JSON map".to_string(),
            }),
        }
    }

    /// Prefix every `/`-rooted byte-range url with a download base.
    ///
    /// Returns the number of references changed.
    pub fn add_download_link(&mut self, base: &Url) -> Result<usize, PadoccError> {
        let mut refs = self.refs()?;
        let mut changed = 0;
        for value in refs.refs.values_mut() {
            if let RefValue::Range { url, .. } = value {
                if url.starts_with('/') {
                    *url = format!("{}{}", base.as_str().trim_end_matches('/'), url);
                    changed += 1;
                }
            }
        }
        self.set_refs(&refs)?;
        Ok(changed)
    }

    /// Record creation or update in the global history and stamp the revision.
    pub fn add_kerchunk_history(&mut self, revision: &str) -> Result<(), PadoccError> {
        let mut refs = self.refs()?;
        add_kerchunk_history(&mut refs, revision)?;
        self.set_refs(&refs)
    }
}

/// Record creation or update in the global history of a reference set and stamp the revision.
///
/// The history line is updated in place when the last line already mentions Kerchunk.
pub fn add_kerchunk_history(refs: &mut RefSet, revision: &str) -> Result<(), PadoccError> {
    let mut attrs = refs.zattrs(None)?;
    let now = utils::now();
    let date = utils::format_date(now);
    let history = match attrs.get("history") {
        Some(Value::String(history)) => {
            let mut lines: Vec<String> = history
                .split('\n')
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            match lines.last_mut() {
                Some(last) if last.contains("Kerchunk") => {
                    *last = format!("Kerchunk file updated on {}", date)
                }
                _ => lines.push(format!("Kerchunk file created on {}", date)),
            }
            lines.join("\n")
        }
        Some(Value::Array(items)) => {
            let mut lines: Vec<String> = items
                .iter()
                .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                .collect();
            lines.push(format!("Kerchunk file created on {}", date));
            lines.join("\n")
        }
        _ => format!("Kerchunk file created on {}\n", date),
    };
    attrs.insert("history".to_string(), Value::String(history));
    attrs.insert(
        "padocc_revision".to_string(),
        Value::String(revision.to_string()),
    );
    attrs.insert(
        "padocc_creation_date".to_string(),
        Value::String(utils::status_timestamp(now)),
    );
    refs.set_zattrs(None, &attrs)
}

impl Deref for KerchunkFile {
    type Target = JsonFileHandler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for KerchunkFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FileHandler for KerchunkFile {
    fn location(&self) -> &FileLocation {
        self.0.location()
    }

    fn location_mut(&mut self) -> &mut FileLocation {
        self.0.location_mut()
    }

    fn close(&mut self) -> Result<(), PadoccError> {
        self.0.close()
    }

    fn reset(&mut self) {
        self.0.reset()
    }
}

/// Layout of a directory store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreKind {
    /// Rechunked zarr v2 store (`.zarr`)
    Zarr,
    /// Parquet-shaped kerchunk reference store (`.parq`)
    KerchunkParquet,
}

/// Handle over a directory store with a JSON metadata sub-handle.
#[derive(Debug)]
pub struct StoreHandler {
    location: FileLocation,
    kind: StoreKind,
    meta: JsonFileHandler,
}

impl StoreHandler {
    /// Return a new store handle
    ///
    /// # Arguments
    ///
    /// * `dir`: Parent directory
    /// * `name`: Store name without extension
    /// * `kind`: Store layout
    /// * `options`: Dryrun and forceful flags
    pub fn new(dir: &Path, name: &str, kind: StoreKind, options: FileOptions) -> Self {
        let extension = match kind {
            StoreKind::Zarr => "zarr",
            StoreKind::KerchunkParquet => "parq",
        };
        let location = FileLocation::new(dir, name, Some(extension), options);
        let meta_name = match kind {
            StoreKind::Zarr => ".zattrs",
            StoreKind::KerchunkParquet => ".zmetadata",
        };
        let meta = JsonFileHandler {
            location: FileLocation::new(&location.path(), meta_name, None, options),
            value: None,
            dirty: false,
        };
        StoreHandler {
            location,
            kind,
            meta,
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Metadata sub-handle (`.zattrs` or `.zmetadata`).
    pub fn meta(&mut self) -> &mut JsonFileHandler {
        &mut self.meta
    }

    /// Remove the whole store.
    pub fn clear(&mut self) -> Result<(), PadoccError> {
        if self.location.options().dryrun {
            warn!(
                "Unable to clear store \"{}\" in dryrun mode.",
                self.location.path().display()
            );
            return Ok(());
        }
        self.location.remove()?;
        self.meta.reset();
        Ok(())
    }

    /// Whether the store is missing or holds no entries.
    pub fn is_empty(&self) -> Result<bool, PadoccError> {
        let path = self.location.path();
        if !path.is_dir() {
            return Ok(true);
        }
        Ok(fs::read_dir(path)?.next().is_none())
    }

    /// Reference set describing the store content.
    pub fn refs(&self) -> Result<RefSet, PadoccError> {
        let path = self.location.path();
        match self.kind {
            StoreKind::KerchunkParquet => references::read_parquet_store(&path),
            StoreKind::Zarr => references::refs_from_zarr_store(&path),
        }
    }

    /// Open the store as an in-memory dataset.
    pub fn open_dataset(&self) -> Result<Dataset, PadoccError> {
        Dataset::open_refs(&self.refs()?)
    }
}

impl FileHandler for StoreHandler {
    impl_location!();

    fn close(&mut self) -> Result<(), PadoccError> {
        self.meta.close()
    }

    fn reset(&mut self) {
        self.meta.reset()
    }

    fn move_file(&mut self, new_dir: &Path, new_name: Option<&str>) -> Result<(), PadoccError> {
        self.close()?;
        self.location.move_to(new_dir, new_name)?;
        let meta_name = self.meta.location.name.clone();
        self.meta.location = FileLocation::new(
            &self.location.path(),
            &meta_name,
            None,
            self.location.options(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn options() -> FileOptions {
        FileOptions::default()
    }

    #[test]
    fn json_missing_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut fh = JsonFileHandler::new(dir.path(), "detail-cfg", options());
        assert!(fh.is_empty().unwrap());
        assert_eq!(None, fh.get("x").unwrap());
        fh.close().unwrap();
        assert!(!fh.exists());
    }

    #[test]
    fn json_invalid_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base-cfg.json"), "not json").unwrap();
        let mut fh = JsonFileHandler::new(dir.path(), "base-cfg", options());
        assert!(fh.is_empty().unwrap());
    }

    #[test]
    fn json_set_close_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut fh = JsonFileHandler::new(dir.path(), "detail-cfg", options());
        fh.insert("num_files", 40).unwrap();
        fh.insert("timings", json!({"convert_estm": 1.5})).unwrap();
        fh.close().unwrap();
        let mut again = JsonFileHandler::new(dir.path(), "detail-cfg.json", options());
        assert_eq!(Some(40), again.get_as::<u64>("num_files").unwrap());
        assert!(again.contains_key("timings").unwrap());
        assert_eq!(
            vec!["num_files".to_string(), "timings".to_string()],
            again.keys().unwrap()
        );
        assert_eq!(Some(json!(40)), again.remove("num_files").unwrap());
        assert_eq!(json!(false), again.get_or("missing", json!(false)).unwrap());
    }

    #[test]
    fn clean_close_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base-cfg.json");
        fs::write(&path, "{\"a\": 1}").unwrap();
        let mut fh = JsonFileHandler::new(dir.path(), "base-cfg", options());
        assert_eq!(Some(json!(1)), fh.get("a").unwrap());
        // Replace on disk; a clean close must not clobber it.
        fs::write(&path, "{\"a\": 2}").unwrap();
        fh.close().unwrap();
        assert_eq!("{\"a\": 2}", fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allfiles.txt");
        fs::write(&path, "a\nb\n").unwrap();
        let mut fh = ListFileHandler::new(dir.path(), "allfiles", options());
        assert_eq!(2, fh.len().unwrap());
        fs::write(&path, "a\nb\nc").unwrap();
        assert_eq!(2, fh.len().unwrap());
    }

    #[test]
    fn dryrun_suppresses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let opts = FileOptions {
            dryrun: true,
            forceful: false,
        };
        let mut fh = ListFileHandler::new(dir.path(), "main", opts);
        fh.append("a").unwrap();
        fh.close().unwrap();
        fh.create_file().unwrap();
        assert!(!fh.exists());
        assert_eq!(vec!["a".to_string()], fh.get().unwrap());
    }

    #[test]
    fn list_operations() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("proj_codes");
        let mut fh =
            ListFileHandler::with_value(&sub, "main", vec!["a".into(), "b".into()], options());
        fh.append("c").unwrap();
        assert!(fh.remove("b").unwrap());
        assert!(!fh.remove("z").unwrap());
        assert!(fh.contains("c").unwrap());
        assert_eq!(Some("c".to_string()), fh.index(1).unwrap());
        fh.close().unwrap();
        assert_eq!("a\nc", fs::read_to_string(sub.join("main.txt")).unwrap());
    }

    #[test]
    fn move_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut fh = ListFileHandler::with_value(dir.path(), "x", vec!["1".into()], options());
        fh.close().unwrap();
        let other = dir.path().join("other");
        fh.move_file(&other, Some("y")).unwrap();
        assert!(other.join("y.txt").exists());
        assert!(!dir.path().join("x.txt").exists());
        fh.remove_file().unwrap();
        assert!(!fh.exists());
        assert!(fh.is_empty().unwrap());
    }

    #[test]
    fn log_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogFileHandler::new(dir.path(), "scan", options());
        log.set(vec!["INFO started".into()]);
        log.close().unwrap();
        assert!(dir.path().join("phase_logs/scan.log").exists());
    }

    #[test]
    fn csv_status_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut fh = CsvFileHandler::new(dir.path(), "status_log", options());
        fh.update_status("scan", "Failed - a,b\nc", Some("7")).unwrap();
        fh.close().unwrap();
        let mut again = CsvFileHandler::new(dir.path(), "status_log", options());
        let row = again.last().unwrap().unwrap();
        assert_eq!(4, row.len());
        assert_eq!("Failed - a.b.c", row[1]);
        assert_eq!("7", row[3]);
    }

    #[test]
    fn csv_codes() {
        let dir = tempfile::tempdir().unwrap();
        let mut fh = CsvFileHandler::new(dir.path(), "datasets", options());
        fh.set(vec![
            vec!["a".into(), "/data/a/*.nc".into()],
            vec!["b".into(), "/data/b/*.nc".into()],
        ]);
        assert!(fh.contains_code("a").unwrap());
        let removed = fh.remove_code("a").unwrap();
        assert_eq!(1, removed.len());
        assert!(!fh.contains_code("a").unwrap());
        assert_eq!(1, fh.len().unwrap());
    }

    #[test]
    fn kerchunk_download_link_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut kfile = KerchunkFile::new(dir.path(), "kj1.0a", options());
        kfile.set(
            json!({
                "version": 1,
                "refs": {
                    ".zattrs": "{\"history\": \"made\"}",
                    "tas/0": ["/badc/a.nc", 10, 20],
                    "tas/1": ["https://x/b.nc", 10, 20],
                }
            })
            .as_object()
            .unwrap()
            .clone(),
        );
        let base = Url::parse("https://dap.ceda.ac.uk").unwrap();
        assert_eq!(1, kfile.add_download_link(&base).unwrap());
        kfile.add_kerchunk_history("kj1.0").unwrap();
        kfile.add_kerchunk_history("kj1.0").unwrap();
        let refs = kfile.refs().unwrap();
        assert_eq!(
            RefValue::Range {
                url: "https://dap.ceda.ac.uk/badc/a.nc".into(),
                offset: 10,
                length: 20
            },
            refs.refs["tas/0"]
        );
        let attrs = refs.zattrs(None).unwrap();
        let history = attrs["history"].as_str().unwrap();
        assert_eq!(2, history.lines().count());
        assert!(history.lines().last().unwrap().starts_with("Kerchunk file updated"));
        assert_eq!("kj1.0", attrs["padocc_revision"]);
    }

    #[test]
    fn store_clear_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StoreHandler::new(dir.path(), "zj1.0a", StoreKind::Zarr, options());
        assert!(store.is_empty().unwrap());
        store.meta().insert("title", "x").unwrap();
        store.close().unwrap();
        assert!(dir.path().join("zj1.0a.zarr/.zattrs").exists());
        assert!(!store.is_empty().unwrap());
        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
    }
}
