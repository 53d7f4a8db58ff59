//! Rechunk variant of the compute phase, writing a zarr store.

use crate::combine::{self, determine_dim_specs, CombineKwargs};
use crate::dataset::Dataset;
use crate::drivers::{DriverKind, KerchunkConverter};
use crate::error::PadoccError;
use crate::filehandlers::{FileHandler, StoreHandler, StoreKind};
use crate::phases::compute::{determine_version, Timings};
use crate::project::ProjectOperation;
use crate::rechunk::{rechunk_scheme, RechunkScheme, ZarrWriter};
use crate::references::RefSet;

use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Name of the scratch store used while rechunking.
const TEMPSTORE: &str = "zarrcache.zarr";

/// Run the zarr compute phase, returning its timings.
pub fn run(project: &mut ProjectOperation) -> Result<Timings, PadoccError> {
    let thorough = project.settings.thorough;
    let forceful = project.options().forceful;
    let mem_allowed = project.settings.mem_allowed.clone();
    let mut op = ZarrOperation::new(project, None, &mem_allowed, thorough, forceful)?;
    op.create_store()?;
    Ok(op.timings)
}

/// Conversion, combination and rechunking of the first `limiter` files into a zarr store.
pub struct ZarrOperation<'p> {
    project: &'p mut ProjectOperation,
    limiter: usize,
    mem_allowed: String,
    clear_tempstore: bool,
    pub timings: Timings,
    /// Driver used for each converted file
    pub ctypes: Vec<DriverKind>,
    /// Variables of the combined dataset
    pub variables: Vec<String>,
}

impl<'p> ZarrOperation<'p> {
    /// Return a new ZarrOperation
    ///
    /// # Arguments
    ///
    /// * `project`: Project to compute
    /// * `limiter`: Number of leading files to process, all by default
    /// * `mem_allowed`: Memory allowance of the rechunker, e.g. `500MB`
    /// * `thorough`: Remove the scratch store afterwards
    /// * `forceful`: Overwrite an existing output store
    pub fn new(
        project: &'p mut ProjectOperation,
        limiter: Option<usize>,
        mem_allowed: &str,
        thorough: bool,
        forceful: bool,
    ) -> Result<Self, PadoccError> {
        let nfiles = project.allfiles.len()?;
        if nfiles == 0 {
            return Err(PadoccError::Compute {
                reason: format!("no input files configured for {}", project.proj_code()),
            });
        }
        determine_version(project, forceful)?;
        Ok(ZarrOperation {
            project,
            limiter: limiter.unwrap_or(nfiles).clamp(1, nfiles),
            mem_allowed: mem_allowed.to_string(),
            clear_tempstore: thorough || forceful,
            timings: Timings::default(),
            ctypes: Vec::new(),
            variables: Vec::new(),
        })
    }

    fn combine_kwargs(&mut self, refs: &[RefSet]) -> Result<CombineKwargs, PadoccError> {
        if let Some(kwargs) = self.project.detail_cfg.get_as::<CombineKwargs>("combine_kwargs")? {
            return Ok(kwargs);
        }
        let [first, .., last] = refs else {
            return Ok(CombineKwargs::default());
        };
        let start = Instant::now();
        let specs = determine_dim_specs(&Dataset::open_refs(first)?, &Dataset::open_refs(last)?)?;
        self.timings.validate = Some(start.elapsed().as_secs_f64());
        Ok(specs.kwargs)
    }

    /// Write the rechunked store and return the rechunk scheme.
    #[tracing::instrument(level = "DEBUG", skip(self), fields(limiter = self.limiter))]
    pub fn create_store(&mut self) -> Result<RechunkScheme, PadoccError> {
        info!("Starting zarr computation for {}", self.project.proj_code());
        let files = self.project.files()?;
        let registry = self.project.settings.drivers.clone();
        let converter = KerchunkConverter::new(&registry, self.project.settings.bypass.skip_driver);
        let mut hint = self.project.driver_hint()?;

        let start = Instant::now();
        let mut refs = Vec::with_capacity(self.limiter);
        for (index, file) in files.iter().take(self.limiter).enumerate() {
            debug!("Opening file {}/{}", index + 1, self.limiter);
            let (refset, kind) = converter.run(Path::new(file), hint)?;
            hint = Some(kind);
            self.ctypes.push(kind);
            refs.push(refset);
        }
        let convert_time = start.elapsed().as_secs_f64();

        let start = Instant::now();
        let kwargs = self.combine_kwargs(&refs)?;
        if kwargs.concat_dims.is_empty() {
            return Err(PadoccError::UnsupportedOperation {
                operation: "zarr conversion without a concatenation dimension".to_string(),
            });
        }
        let combined = combine::combine(&refs, &kwargs)?;
        let mut ds = Dataset::open_refs(&combined)?;
        let revision = self.project.revision()?;
        ds.attrs
            .insert("padocc_revision".to_string(), Value::String(revision));
        self.variables = ds.variables.keys().cloned().collect();
        let preferences = self.project.settings.preferences.clone();
        let scheme = rechunk_scheme(&ds, preferences.as_deref(), self.limiter);
        debug!("Rechunk scheme: {:?}", scheme.chunks);
        self.timings.concat = Some(start.elapsed().as_secs_f64() / self.limiter as f64);

        let options = self.project.options();
        if options.dryrun {
            info!("DRYRUN: Skipped writing zarr store");
        } else {
            let start = Instant::now();
            let outproduct = self.project.outproduct()?;
            let store = StoreHandler::new(self.project.dir(), &outproduct, StoreKind::Zarr, options);
            let tempstore = self.project.dir().join(TEMPSTORE);
            ZarrWriter::new(&self.mem_allowed)?.write(&ds, &scheme, &store.path(), &tempstore)?;
            if self.clear_tempstore && tempstore.is_dir() {
                fs::remove_dir_all(&tempstore)?;
            }
            self.timings.convert =
                Some((convert_time + start.elapsed().as_secs_f64()) / self.limiter as f64);
            self.project
                .detail_cfg
                .insert("combine_kwargs", serde_json::to_value(&kwargs)?)?;
        }
        Ok(scheme)
    }
}
