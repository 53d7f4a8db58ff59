//! Compute phase: full conversion and concatenation into the output artifact.

use crate::cfa::cfa_handler;
use crate::combine::{self, add_virtual_dim, determine_dim_specs, CombineKwargs};
use crate::dataset::Dataset;
use crate::drivers::{DriverKind, KerchunkConverter};
use crate::error::PadoccError;
use crate::filehandlers::{
    self, FileHandler, JsonFileHandler, JsonMap, KerchunkFile, StoreHandler, StoreKind,
};
use crate::phases::zarr;
use crate::project::{CloudFormat, FileType, ProjectOperation};
use crate::references::{self, RefSet, RECORD_SIZE};

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-file timings of a compute run, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Timings {
    pub convert: Option<f64>,
    pub concat: Option<f64>,
    pub validate: Option<f64>,
}

/// Run the compute phase for a project.
#[tracing::instrument(level = "DEBUG", skip(project), fields(proj_code = %project.proj_code()))]
pub fn run(project: &mut ProjectOperation) -> Result<(), PadoccError> {
    let scanned = project.detail_cfg.contains_key("num_files")?
        || project.detail_cfg.contains_key("skipped")?;
    if !scanned {
        if project.settings.bypass.skip_scan {
            info!("Fasttrack: computing {} without a scan", project.proj_code());
        } else {
            warn!(
                "{} has not been scanned - estimates are unavailable",
                project.proj_code()
            );
        }
    }

    let start = Instant::now();
    let cloud_format = project.cloud_format()?;
    match cloud_format {
        CloudFormat::Kerchunk => {
            let thorough = project.settings.thorough;
            let forceful = project.options().forceful;
            let mut op = ComputeOperation::new(project, None, thorough, forceful)?;
            op.create_refs()?;
            let (timings, loaded) = (op.timings, op.loaded_refs);
            if loaded {
                info!("Skipped writing timings - references were loaded from cache");
            } else {
                record_timings(project, &timings, start.elapsed().as_secs_f64())?;
            }
        }
        CloudFormat::Zarr => {
            let timings = zarr::run(project)?;
            record_timings(project, &timings, start.elapsed().as_secs_f64())?;
        }
        CloudFormat::Cfa => debug!("No reference output for CFA projects"),
    }

    let files = project.files()?;
    let dryrun = project.options().dryrun;
    let written = cfa_handler(
        project.settings.cfa.as_deref(),
        &files,
        &project.cfa_path(),
        dryrun,
    );
    project.detail_cfg.insert("cfa", written)?;
    if cloud_format == CloudFormat::Cfa && !written && !dryrun {
        return Err(PadoccError::Compute {
            reason: "no CFA file could be written".to_string(),
        });
    }
    Ok(())
}

/// Store actual timings in the detail configuration.
pub(crate) fn record_timings(
    project: &mut ProjectOperation,
    timings: &Timings,
    compute_time: f64,
) -> Result<(), PadoccError> {
    let mut stored = match project.detail_cfg.get("timings")? {
        Some(Value::Object(map)) => map,
        _ => JsonMap::new(),
    };
    let mut put = |key: &str, value: Option<f64>| {
        if let Some(value) = value {
            stored.insert(key.to_string(), value.into());
        }
    };
    put("convert_actual", timings.convert);
    put("concat_actual", timings.concat);
    put("validate_actual", timings.validate);
    put("compute_actual", Some(compute_time));
    project.detail_cfg.insert("timings", stored)
}

/// Pick a version whose output product does not exist yet.
///
/// Forceful runs overwrite the current version.
pub(crate) fn determine_version(
    project: &mut ProjectOperation,
    forceful: bool,
) -> Result<(), PadoccError> {
    if forceful {
        return Ok(());
    }
    loop {
        let exists = match project.artifact()? {
            Some(artifact) => artifact.exists(),
            None => false,
        };
        if !exists {
            return Ok(());
        }
        if !project.settings.new_version {
            return Err(PadoccError::NoOverwrite);
        }
        let version = project.minor_version_increment()?;
        info!("Output product exists - moving to version {}", version);
    }
}

/// Reference conversion and concatenation over the first `limiter` files of a project.
pub struct ComputeOperation<'p> {
    project: &'p mut ProjectOperation,
    limiter: usize,
    partial: bool,
    thorough: bool,
    temp_zattrs: JsonFileHandler,
    combine_kwargs: Option<CombineKwargs>,
    special_attrs: Vec<String>,
    var_shapes: BTreeMap<String, Vec<usize>>,
    /// Timings of this run
    pub timings: Timings,
    /// At least one reference set came from the cache
    pub loaded_refs: bool,
    /// Shapes differ between files, so only full validation is trustworthy
    pub quality_required: bool,
    /// Driver used for each converted file
    pub ctypes: Vec<DriverKind>,
}

impl<'p> ComputeOperation<'p> {
    /// Return a new ComputeOperation
    ///
    /// # Arguments
    ///
    /// * `project`: Project to compute
    /// * `limiter`: Number of leading files to process, all by default
    /// * `thorough`: Ignore and clear cached references
    /// * `forceful`: Overwrite an existing output product
    pub fn new(
        project: &'p mut ProjectOperation,
        limiter: Option<usize>,
        thorough: bool,
        forceful: bool,
    ) -> Result<Self, PadoccError> {
        let nfiles = project.allfiles.len()?;
        if nfiles == 0 {
            return Err(PadoccError::Compute {
                reason: format!("no input files configured for {}", project.proj_code()),
            });
        }
        let limiter = limiter.unwrap_or(nfiles).clamp(1, nfiles);
        determine_version(project, forceful)?;

        let options = project.options();
        let cache_dir = project.cache_dir();
        if thorough && cache_dir.is_dir() && !options.dryrun {
            debug!("Clearing cache {}", cache_dir.display());
            fs::remove_dir_all(&cache_dir)?;
        }
        let mut temp_zattrs = JsonFileHandler::new(&cache_dir, "temp_zattrs", options);
        if thorough {
            temp_zattrs.set(JsonMap::new());
        }
        Ok(ComputeOperation {
            project,
            limiter,
            partial: limiter != nfiles,
            thorough,
            temp_zattrs,
            combine_kwargs: None,
            special_attrs: Vec::new(),
            var_shapes: BTreeMap::new(),
            timings: Timings::default(),
            loaded_refs: false,
            quality_required: false,
            ctypes: Vec::new(),
        })
    }

    /// Convert or load every file's references, then combine and save them.
    ///
    /// Returns the per-file reference sets.
    #[tracing::instrument(level = "DEBUG", skip(self), fields(limiter = self.limiter))]
    pub fn create_refs(&mut self) -> Result<Vec<RefSet>, PadoccError> {
        info!(
            "Starting computation for components of {}",
            self.project.proj_code()
        );
        let files = self.project.files()?;
        let registry = self.project.settings.drivers.clone();
        let converter = KerchunkConverter::new(&registry, self.project.settings.bypass.skip_driver);
        let mut hint = self.project.driver_hint()?;
        let options = self.project.options();
        let cache_dir = self.project.cache_dir();

        let mut refs: Vec<RefSet> = Vec::with_capacity(self.limiter);
        let mut allzattrs = Vec::with_capacity(self.limiter);
        let mut partials = Vec::new();
        let mut converted = 0;
        let start = Instant::now();
        for (index, file) in files.iter().take(self.limiter).enumerate() {
            let mut cache = KerchunkFile::new(&cache_dir, &index.to_string(), options);
            let refset = if !self.thorough && !cache.is_empty()? {
                info!("Loaded refs: {}/{}", index + 1, self.limiter);
                self.loaded_refs = true;
                cache.refs()?
            } else {
                info!("Creating refs: {}/{}", index + 1, self.limiter);
                match converter.run(Path::new(file), hint) {
                    Ok((refset, kind)) => {
                        hint = Some(kind);
                        self.ctypes.push(kind);
                        converted += 1;
                        cache.set_refs(&refset)?;
                        cache.close()?;
                        refset
                    }
                    Err(PadoccError::KerchunkDriverFatal) if !refs.is_empty() => {
                        warn!("Every driver failed for file {}: {}", index, file);
                        partials.push(index);
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            };
            allzattrs.push(refset.zattrs(None)?);
            if !self.quality_required {
                self.perform_shape_checks(&refset)?;
            }
            refs.push(refset);
        }
        if converted > 0 {
            self.timings.convert = Some(start.elapsed().as_secs_f64() / converted as f64);
        }
        if !partials.is_empty() {
            return Err(PadoccError::PartialDriver { filenums: partials });
        }

        if self.temp_zattrs.is_empty()? {
            let zattrs = self.correct_metadata(&allzattrs)?;
            self.temp_zattrs.set(zattrs);
        }
        self.temp_zattrs.close()?;

        self.combine_and_save(&refs)?;

        if self.thorough && !options.dryrun && cache_dir.is_dir() {
            fs::remove_dir_all(&cache_dir)?;
            self.temp_zattrs.reset();
        }
        Ok(refs)
    }

    /// Record each variable's first-seen shape and flag any later change.
    fn perform_shape_checks(&mut self, refset: &RefSet) -> Result<(), PadoccError> {
        let variables: Vec<String> = match self.project.detail_cfg.get_as("variables")? {
            Some(variables) => variables,
            None => refset.variables(),
        };
        for var in variables {
            let Some(zarray) = refset.zarray(&var)? else {
                continue;
            };
            let first = self
                .var_shapes
                .entry(var.clone())
                .or_insert_with(|| zarray.shape.clone());
            if *first != zarray.shape {
                debug!(
                    "Shape of {} differs between files: {:?} - {:?}",
                    var, first, zarray.shape
                );
                self.quality_required = true;
            }
        }
        Ok(())
    }

    /// Merge the global attributes of every file and apply the configured patches.
    fn correct_metadata(&mut self, allzattrs: &[JsonMap]) -> Result<JsonMap, PadoccError> {
        debug!("Starting metadata corrections");
        let (mut zattrs, special) = clean_attr_array(
            allzattrs,
            self.limiter,
            &self.project.settings.concat_msg,
        );
        self.special_attrs = special;

        debug!("Applying config info on updates and removals");
        if let Some(Value::Object(updates)) = self.project.base_cfg.get("updates")? {
            for (key, value) in updates {
                zattrs.insert(key, value);
            }
        }
        if let Some(Value::Array(removals)) = self.project.base_cfg.get("removals")? {
            for key in removals.iter().filter_map(Value::as_str) {
                zattrs.remove(key);
            }
        }
        if zattrs.is_empty() {
            error!("Lost global attributes at correction phase");
            return Err(PadoccError::Compute {
                reason: "global attributes are empty after corrections".to_string(),
            });
        }
        Ok(zattrs)
    }

    fn find_dim_specs(&mut self, first: &RefSet, last: &RefSet) -> Result<bool, PadoccError> {
        let start = Instant::now();
        info!("Determining concatenation dimensions");
        let specs = determine_dim_specs(&Dataset::open_refs(first)?, &Dataset::open_refs(last)?)?;
        debug!(
            "Concatenation dimensions: {:?}, identical variables: {:?}",
            specs.kwargs.concat_dims, specs.kwargs.identical_dims
        );
        self.timings.validate = Some(start.elapsed().as_secs_f64());
        self.project
            .detail_cfg
            .insert("virtual_concat", specs.virtual_concat)?;
        self.combine_kwargs = Some(specs.kwargs);
        Ok(specs.virtual_concat)
    }

    fn combine_and_save(&mut self, refs: &[RefSet]) -> Result<(), PadoccError> {
        info!("Starting concatenation of refs");
        let start = Instant::now();
        let mut combined = match refs {
            [] => {
                return Err(PadoccError::Compute {
                    reason: "no references to combine".to_string(),
                })
            }
            [single] => {
                debug!("Found single ref to save");
                single.clone()
            }
            [first, .., last] => {
                let mut virtual_concat = self
                    .project
                    .detail_cfg
                    .get_as::<bool>("virtual_concat")?
                    .unwrap_or(false);
                match self.project.detail_cfg.get_as::<CombineKwargs>("combine_kwargs")? {
                    Some(kwargs) => self.combine_kwargs = Some(kwargs),
                    None => virtual_concat = self.find_dim_specs(first, last)?,
                }
                let mut kwargs = self.combine_kwargs.clone().unwrap_or_default();
                if virtual_concat {
                    let mut refs = refs.to_vec();
                    kwargs.concat_dims = vec![add_virtual_dim(&mut refs)?.to_string()];
                    combine::combine(&refs, &kwargs)?
                } else {
                    combine::combine(refs, &kwargs)?
                }
            }
        };

        let zattrs = self.temp_zattrs.value()?.clone();
        if !zattrs.is_empty() {
            combined.set_zattrs(None, &zattrs)?;
        }
        let revision = self.project.revision()?;
        filehandlers::add_kerchunk_history(&mut combined, &revision)?;

        match self.project.file_type()? {
            Some(FileType::Parq) => self.data_to_parq(&combined)?,
            _ => self.data_to_json(&combined)?,
        }
        self.timings.concat = Some(start.elapsed().as_secs_f64() / self.limiter as f64);

        if !self.project.options().dryrun {
            self.collect_details()?;
            debug!("Details updated in detail-cfg.json");
        }
        Ok(())
    }

    fn data_to_json(&mut self, combined: &RefSet) -> Result<(), PadoccError> {
        let outproduct = self.project.outproduct()?;
        let mut kfile = KerchunkFile::new(self.project.dir(), &outproduct, self.project.options());
        kfile.set_refs(combined)?;
        let links_added = match (
            &self.project.settings.link_base,
            self.project.settings.bypass.skip_links,
        ) {
            (Some(base), false) => {
                let changed = kfile.add_download_link(base)?;
                debug!("Added download links to {} references", changed);
                true
            }
            _ => false,
        };
        self.project.detail_cfg.insert("links_added", links_added)?;
        if self.partial {
            info!("Skipped writing to JSON file - {}", kfile.path().display());
        } else {
            kfile.close()?;
            info!("Written to JSON file - {}", kfile.path().display());
        }
        Ok(())
    }

    fn data_to_parq(&mut self, combined: &RefSet) -> Result<(), PadoccError> {
        let outproduct = self.project.outproduct()?;
        let options = self.project.options();
        let store = StoreHandler::new(
            self.project.dir(),
            &outproduct,
            StoreKind::KerchunkParquet,
            options,
        );
        if self.partial {
            info!("Skipped writing to parquet store - {}", store.path().display());
        } else if options.dryrun {
            info!("DRYRUN: Skipped writing parquet store - {}", store.path().display());
        } else {
            references::write_parquet_store(&store.path(), combined, RECORD_SIZE)?;
            info!("Written to parquet store - {}", store.path().display());
        }
        self.project.detail_cfg.insert("links_added", false)
    }

    fn collect_details(&mut self) -> Result<(), PadoccError> {
        if let Some(kwargs) = &self.combine_kwargs {
            let kwargs = serde_json::to_value(kwargs)?;
            self.project.detail_cfg.insert("combine_kwargs", kwargs)?;
        }
        if !self.special_attrs.is_empty() {
            self.project
                .detail_cfg
                .insert("special_attrs", self.special_attrs.clone())?;
        }
        self.project
            .detail_cfg
            .insert("quality_required", self.quality_required)
    }
}

/// Order JSON values, numbers numerically and text lexically.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

/// Distinct values in first-seen order.
fn unique_values(values: &[Value]) -> Vec<Value> {
    let mut unique: Vec<Value> = Vec::new();
    for value in values {
        if !unique.contains(value) {
            unique.push(value.clone());
        }
    }
    unique
}

/// Collate time-like attributes across files.
///
/// `start` keys take the earliest value and `end`/`stop` keys the latest. `duration` keys keep
/// the first file's value.
fn check_time_attributes(times: &BTreeMap<String, Vec<Value>>, nfiles: usize) -> JsonMap {
    let mut collated = JsonMap::new();
    for (key, values) in times {
        let mut sorted = values.clone();
        sorted.sort_by(compare_values);
        if key.contains("start") {
            if let Some(first) = sorted.first() {
                collated.insert(key.clone(), first.clone());
            }
        } else if key.contains("end") || key.contains("stop") {
            if let Some(last) = sorted.last() {
                collated.insert(key.clone(), last.clone());
            }
        } else if key.contains("duration") {
            continue;
        } else {
            let unique = unique_values(values);
            let value = match unique.len() {
                1 => unique[0].clone(),
                n if n == nfiles => Value::String("See individual files for details".to_string()),
                _ => Value::Array(unique),
            };
            collated.insert(key.clone(), value);
        }
    }
    collated
}

/// Merge the global attributes of several files.
///
/// Starts from the first file. Attributes whose values differ are collated as time attributes
/// when their name contains `time`, otherwise kept when unanimous or set to `concat_msg`.
/// Returns the merged attributes and the names set to `concat_msg`.
pub(crate) fn clean_attr_array(
    allzattrs: &[JsonMap],
    nfiles: usize,
    concat_msg: &str,
) -> (JsonMap, Vec<String>) {
    let Some((base, rest)) = allzattrs.split_first() else {
        return (JsonMap::new(), Vec::new());
    };
    let mut merged = base.clone();
    let mut times: BTreeMap<String, Vec<Value>> = base
        .iter()
        .filter(|(key, _)| key.contains("time"))
        .map(|(key, value)| (key.clone(), vec![value.clone()]))
        .collect();
    let mut all_values: BTreeMap<String, Vec<Value>> = base
        .iter()
        .map(|(key, value)| (key.clone(), vec![value.clone()]))
        .collect();
    let mut nonequal: Vec<String> = Vec::new();

    for zattrs in rest {
        for (key, value) in zattrs {
            all_values.entry(key.clone()).or_default().push(value.clone());
            if let Some(values) = times.get_mut(key) {
                values.push(value.clone());
            } else if base.get(key) != Some(value) && !nonequal.contains(key) {
                nonequal.push(key.clone());
            }
        }
    }

    for (key, value) in check_time_attributes(&times, nfiles) {
        merged.insert(key, value);
    }
    let mut special = Vec::new();
    for key in nonequal {
        let values = all_values.get(&key).map(Vec::as_slice).unwrap_or_default();
        let unique = unique_values(values);
        if unique.len() == 1 {
            merged.insert(key, unique[0].clone());
        } else {
            merged.insert(key.clone(), Value::String(concat_msg.to_string()));
            special.push(key);
        }
    }
    (merged, special)
}
