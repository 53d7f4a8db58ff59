//! Validate phase: compare the output artifact against its source files.

use crate::bypass::BypassSwitch;
use crate::combine::{self, add_virtual_dim, CombineKwargs, VIRTUAL_DIM};
use crate::dataset::{Dataset, Values};
use crate::drivers::KerchunkConverter;
use crate::error::PadoccError;
use crate::project::{CloudFormat, ProjectOperation};
use crate::references::RefSet;

use ndarray::ArrayD;
use ndarray_stats::QuantileExt;
use rand::seq::index;
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info, warn};

/// Times a box may shrink before a comparison is abandoned.
const RECURSION_LIMIT: u32 = 10;

/// Dimensions shorter than this are never boxed.
const MIN_BOX_DIM: usize = 8;

/// Element-wise differences logged per variable.
const MAX_DIFFS: usize = 10;

/// Global attributes written with the artifact.
const WRITTEN_ATTRS: [&str; 3] = ["history", "padocc_revision", "padocc_creation_date"];

/// Run the validate phase for a project.
///
/// On success the artifact is moved to the completed directory and the completion marker is
/// written.
#[tracing::instrument(level = "DEBUG", skip(project), fields(proj_code = %project.proj_code()))]
pub fn run(project: &mut ProjectOperation) -> Result<(), PadoccError> {
    if project.cloud_format()? == CloudFormat::Cfa {
        if !project.cfa_path().is_file() {
            return Err(PadoccError::MissingKerchunk);
        }
        info!("No reference product to compare for CFA projects");
    } else {
        ValidateOperation::new(project)?.validate()?;
    }
    complete(project)
}

/// Whether only a full comparison is trustworthy for this project.
fn quality_mode(project: &mut ProjectOperation) -> Result<bool, PadoccError> {
    let required = project
        .detail_cfg
        .get_as::<bool>("quality_required")?
        .unwrap_or(false);
    Ok(required || project.settings.thorough)
}

/// Move the artifact out of the pipeline and mark the project complete.
///
/// The completed product is named `<proj_code>.<revision>` with no extension.
fn complete(project: &mut ProjectOperation) -> Result<(), PadoccError> {
    let target = project.complete_dir().join(project.complete_product()?);
    let options = project.options();
    if let Some(artifact) = project.artifact()? {
        if options.dryrun {
            debug!("DRYRUN: Skip moving {}", artifact.path().display());
        } else {
            if target.exists() {
                if !options.forceful {
                    return Err(PadoccError::NoOverwrite);
                }
                remove_path(&target)?;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(artifact.path(), &target)?;
            info!("Moved {} to {}", artifact.path().display(), target.display());
        }
    }
    let marker = project.complete_marker()?;
    if options.dryrun {
        debug!("DRYRUN: Skip writing {}", marker.display());
    } else {
        fs::write(&marker, "")?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<(), PadoccError> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Undo the completion of a project.
///
/// The artifact is moved back into the project directory, or deleted when the project
/// requires full validation.
pub fn backtrack(project: &mut ProjectOperation) -> Result<(), PadoccError> {
    let quality = quality_mode(project)?;
    let completed = project.complete_dir().join(project.complete_product()?);
    let options = project.options();

    if let Some(artifact) = project.artifact()? {
        if !completed.exists() {
            warn!("No completed product found at {}", completed.display());
        } else if options.dryrun {
            debug!("DRYRUN: Skip backtracking {}", completed.display());
        } else if quality {
            remove_path(&completed)?;
            info!("Removed completed product {}", completed.display());
        } else {
            fs::rename(&completed, artifact.path())?;
            info!("Returned {} to {}", completed.display(), project.dir().display());
        }
    }

    let marker = project.complete_marker()?;
    if marker.exists() && !options.dryrun {
        fs::remove_file(marker)?;
    }
    Ok(())
}

/// Source files compared in sampled mode, in ascending order.
///
/// One file in a thousand is sampled, at least three.
pub fn sample_indices<R: Rng>(nfiles: usize, rng: &mut R) -> Vec<usize> {
    let amount = (nfiles / 1000).max(3).min(nfiles);
    let mut indices = index::sample(rng, nfiles, amount).into_vec();
    indices.sort_unstable();
    indices
}

/// Range of `product` times holding exactly `source` times.
fn match_timesteps(product: &[f64], source: &[f64]) -> Option<Range<usize>> {
    let first = source.first()?;
    let start = product.iter().position(|t| t == first)?;
    let range = start..start + source.len();
    (product.get(range.clone())? == source).then_some(range)
}

/// Differences a comparison tolerates.
#[derive(Clone, Debug, Default)]
pub struct Allowances {
    /// Global attributes excluded from comparison
    pub ignore_attrs: BTreeSet<String>,
    /// Variables and dimensions present in the product only
    pub ignore_variables: BTreeSet<String>,
    pub bypass: BypassSwitch,
}

/// Comparison of one project's artifact against its sources.
pub struct ValidateOperation<'p> {
    project: &'p mut ProjectOperation,
    quality: bool,
    virtual_concat: bool,
    kwargs: CombineKwargs,
    allowances: Allowances,
}

impl<'p> ValidateOperation<'p> {
    pub fn new(project: &'p mut ProjectOperation) -> Result<Self, PadoccError> {
        let quality = quality_mode(project)?;
        let virtual_concat = project
            .detail_cfg
            .get_as::<bool>("virtual_concat")?
            .unwrap_or(false);
        let kwargs = project
            .detail_cfg
            .get_as::<CombineKwargs>("combine_kwargs")?
            .unwrap_or_default();

        let mut ignore_attrs: BTreeSet<String> =
            WRITTEN_ATTRS.iter().map(|a| a.to_string()).collect();
        if let Some(special) = project.detail_cfg.get_as::<Vec<String>>("special_attrs")? {
            ignore_attrs.extend(special);
        }
        if let Some(Value::Object(updates)) = project.base_cfg.get("updates")? {
            ignore_attrs.extend(updates.keys().cloned());
        }
        if let Some(Value::Array(removals)) = project.base_cfg.get("removals")? {
            ignore_attrs.extend(removals.iter().filter_map(Value::as_str).map(String::from));
        }
        let allowances = Allowances {
            ignore_attrs,
            ignore_variables: BTreeSet::from([VIRTUAL_DIM.to_string()]),
            bypass: project.settings.bypass.clone(),
        };
        Ok(ValidateOperation {
            project,
            quality,
            virtual_concat,
            kwargs,
            allowances,
        })
    }

    /// Compare the artifact with every source (quality mode) or a sample of sources.
    pub fn validate(&mut self) -> Result<(), PadoccError> {
        let mut artifact = self
            .project
            .artifact()?
            .ok_or(PadoccError::MissingKerchunk)?;
        info!("Opening product {}", artifact.path().display());
        let product = artifact.open_dataset()?;

        let files = self.project.files()?;
        if files.is_empty() {
            return Err(PadoccError::Validation {
                report: "no source files to compare against".to_string(),
            });
        }
        let registry = self.project.settings.drivers.clone();
        let converter = KerchunkConverter::new(&registry, self.allowances.bypass.skip_driver);
        let mut hint = self.project.driver_hint()?;
        let mut convert = |file: &str| -> Result<RefSet, PadoccError> {
            let (refs, kind) = converter.run(Path::new(file), hint)?;
            hint = Some(kind);
            Ok(refs)
        };

        if self.quality {
            info!("Comparing the product against all {} source files", files.len());
            let refs = files
                .iter()
                .map(|f| convert(f))
                .collect::<Result<Vec<_>, _>>()?;
            let source = self.combined_sources(refs)?;
            return compare_datasets(&product, &source, &self.allowances);
        }

        let indices = sample_indices(files.len(), &mut rand::thread_rng());
        info!("Comparing the product against source files {:?}", indices);
        for index in indices {
            let file = &files[index];
            let source = Dataset::open_refs(&convert(file)?)?;
            let selection = self.select(&product, &source, index, file)?;
            debug!("Comparing selection for {}", file);
            compare_datasets(&selection, &source, &self.allowances)?;
        }
        Ok(())
    }

    /// The source files combined the way the product was.
    fn combined_sources(&self, mut refs: Vec<RefSet>) -> Result<Dataset, PadoccError> {
        if refs.len() == 1 {
            return Dataset::open_refs(&refs[0]);
        }
        let mut kwargs = self.kwargs.clone();
        if self.virtual_concat {
            kwargs.concat_dims = vec![add_virtual_dim(&mut refs)?.to_string()];
        }
        Dataset::open_refs(&combine::combine(&refs, &kwargs)?)
    }

    /// The part of the product that came from source file `index`.
    fn select(
        &self,
        product: &Dataset,
        source: &Dataset,
        index: usize,
        file: &str,
    ) -> Result<Dataset, PadoccError> {
        if self.virtual_concat {
            return product
                .isel(VIRTUAL_DIM, index..index + 1)
                .squeeze(VIRTUAL_DIM);
        }
        let dim = self
            .kwargs
            .concat_dims
            .first()
            .map(String::as_str)
            .unwrap_or("time");
        let no_match = || PadoccError::NoValidTimeSlices {
            message: file.to_string(),
        };
        let product_times = product.coord(dim).ok_or_else(no_match)?;
        let source_times = source.coord(dim).ok_or_else(no_match)?;
        let range = match_timesteps(&product_times, &source_times).ok_or_else(no_match)?;
        debug!("Matched {} to {}[{:?}]", file, dim, range);
        Ok(product.isel(dim, range))
    }
}

/// Compare metadata, then data, of a product selection with its source.
pub fn compare_datasets(
    product: &Dataset,
    source: &Dataset,
    allow: &Allowances,
) -> Result<(), PadoccError> {
    check_variables(product, source, allow)?;
    check_dimensions(product, source, allow)?;
    let skipped = check_shapes(product, source, allow)?;
    check_global_attrs(product, source, allow)?;

    for (var, control) in &source.variables {
        if skipped.contains(var) {
            continue;
        }
        let Some(test) = product.variables.get(var) else {
            continue;
        };
        match growbox(var, &test.values, &control.values, &allow.bypass) {
            Ok(true) => debug!("Data comparison passed for {}", var),
            Ok(false) if allow.bypass.skip_softfail => {
                warn!("Data comparison not performed for {} - all selections were NaN", var)
            }
            Ok(false) => return Err(PadoccError::SoftfailBypass { var: var.clone() }),
            Err(PadoccError::NaNComparison { .. }) if allow.bypass.skip_boxfail => {
                warn!("Skipped box comparison of {} - NaN values mismatched", var)
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn check_variables(
    product: &Dataset,
    source: &Dataset,
    allow: &Allowances,
) -> Result<(), PadoccError> {
    let ours: BTreeSet<&String> = product.variables.keys().collect();
    let theirs: BTreeSet<&String> = source.variables.keys().collect();
    let mut missing = Vec::new();
    for var in ours.symmetric_difference(&theirs) {
        if allow.ignore_variables.contains(*var) {
            debug!("Allowed product-only variable {}", var);
        } else {
            missing.push(var.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(PadoccError::VariableMismatch { missing });
    }
    Ok(())
}

fn check_dimensions(
    product: &Dataset,
    source: &Dataset,
    allow: &Allowances,
) -> Result<(), PadoccError> {
    let ours: BTreeSet<&String> = product.dims.keys().collect();
    let theirs: BTreeSet<&String> = source.dims.keys().collect();
    let differing: Vec<&String> = ours
        .symmetric_difference(&theirs)
        .copied()
        .filter(|dim| !allow.ignore_variables.contains(*dim))
        .collect();
    if !differing.is_empty() {
        return Err(PadoccError::Validation {
            report: format!("Dimensions present in only one dataset: {:?}", differing),
        });
    }
    Ok(())
}

/// Check variable shapes, returning variables excluded from the data pass.
fn check_shapes(
    product: &Dataset,
    source: &Dataset,
    allow: &Allowances,
) -> Result<Vec<String>, PadoccError> {
    let mut skipped = Vec::new();
    for (var, control) in &source.variables {
        let Some(test) = product.variables.get(var) else {
            continue;
        };
        if test.shape() == control.shape() {
            continue;
        }
        if allow.bypass.skip_xkshape {
            warn!(
                "Skipped comparison of {}: shapes {:?} and {:?} differ",
                var,
                test.shape(),
                control.shape()
            );
            skipped.push(var.clone());
        } else {
            return Err(PadoccError::ShapeMismatch {
                var: var.clone(),
                product: format!("{:?}", test.shape()),
                source_shape: format!("{:?}", control.shape()),
            });
        }
    }
    Ok(skipped)
}

/// Global attributes must agree, except ignored and time-collated ones.
fn check_global_attrs(
    product: &Dataset,
    source: &Dataset,
    allow: &Allowances,
) -> Result<(), PadoccError> {
    let keys: BTreeSet<&String> = product.attrs.keys().chain(source.attrs.keys()).collect();
    let differing: Vec<&str> = keys
        .into_iter()
        .filter(|key| !allow.ignore_attrs.contains(*key) && !key.contains("time"))
        .filter(|key| product.attrs.get(*key) != source.attrs.get(*key))
        .map(String::as_str)
        .collect();
    if !differing.is_empty() {
        return Err(PadoccError::Validation {
            report: format!("Global attributes differ: {}", differing.join(", ")),
        });
    }
    Ok(())
}

/// Centered box of side `ceil(dim / (2 * current))` along every dimension of at least 8.
fn box_ranges(shape: &[usize], current: usize) -> Vec<Range<usize>> {
    shape
        .iter()
        .map(|&dim| {
            if dim < MIN_BOX_DIM {
                return 0..dim;
            }
            let side = dim.div_ceil(2 * current).max(1);
            let start = (dim - side) / 2;
            start..start + side
        })
        .collect()
}

fn all_nan(values: &Values) -> bool {
    match values {
        Values::Numeric(a) => !a.is_empty() && a.iter().all(|v| v.is_nan()),
        Values::Text(_) => false,
    }
}

/// Compare a centered box of two arrays, shrinking the box while the source holds only NaN.
///
/// Returns `false` when no box with data was found.
fn growbox(
    var: &str,
    test: &Values,
    control: &Values,
    bypass: &BypassSwitch,
) -> Result<bool, PadoccError> {
    let mut current = 1;
    for _ in 0..RECURSION_LIMIT {
        let ranges = box_ranges(control.shape(), current);
        let control_box = control.slice(&ranges);
        if all_nan(&control_box) {
            current *= 2;
            continue;
        }
        let test_box = test.slice(&ranges);
        if all_nan(&test_box) {
            return Err(PadoccError::NaNComparison {
                var: var.to_string(),
            });
        }
        compare_boxes(var, &test_box, &control_box, bypass)?;
        return Ok(true);
    }
    Ok(false)
}

fn compare_boxes(
    var: &str,
    test: &Values,
    control: &Values,
    bypass: &BypassSwitch,
) -> Result<(), PadoccError> {
    if !test.equal_nan(control) {
        let diffs = log_differences(var, test, control);
        return Err(PadoccError::Validation {
            report: format!(
                "{} differs in {} of {} compared values",
                var,
                diffs,
                control.len()
            ),
        });
    }
    match (test.as_numeric(), control.as_numeric()) {
        (Some(test), Some(control)) if !control.is_empty() => {
            let tolerance = nanmean(test).abs() / 1000.0;
            let checks = [
                ("max", *test.max_skipnan(), *control.max_skipnan()),
                ("min", *test.min_skipnan(), *control.min_skipnan()),
                ("mean", nanmean(test), nanmean(control)),
            ];
            for (name, ours, theirs) in checks {
                if (ours - theirs).abs() > tolerance {
                    return Err(PadoccError::Validation {
                        report: format!("{} {} differs: {} - {}", var, name, ours, theirs),
                    });
                }
            }
            Ok(())
        }
        (Some(_), Some(_)) => Ok(()),
        _ if bypass.skip_data_sum => {
            debug!("Skipped max/min/mean of non-summable {}", var);
            Ok(())
        }
        _ => Err(PadoccError::Validation {
            report: format!("{} is not summable - max/min/mean not compared", var),
        }),
    }
}

fn nanmean(values: &ArrayD<f64>) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Log differing elements and return how many differ.
fn log_differences(var: &str, test: &Values, control: &Values) -> usize {
    let pairs: Vec<(String, String)> = match (test, control) {
        (Values::Numeric(t), Values::Numeric(c)) => t
            .iter()
            .zip(c.iter())
            .filter(|(a, b)| a != b && !(a.is_nan() && b.is_nan()))
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect(),
        (Values::Text(t), Values::Text(c)) => t
            .iter()
            .zip(c.iter())
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect(),
        _ => {
            warn!("{}: value types differ between product and source", var);
            return control.len();
        }
    };
    for (ours, theirs) in pairs.iter().take(MAX_DIFFS) {
        warn!("{}: {} (product) - {} (source)", var, ours, theirs);
    }
    if pairs.len() > MAX_DIFFS {
        warn!("{}: {} further differences", var, pairs.len() - MAX_DIFFS);
    }
    pairs.len()
}
