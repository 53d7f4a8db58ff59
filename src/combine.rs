//! Multi-reference combiner.
//!
//! Concatenates single-file reference sets along one dimension by re-indexing chunk keys.
//! No chunk data is read.

use crate::dataset::Dataset;
use crate::error::PadoccError;
use crate::filehandlers::JsonMap;
use crate::references::{chunk_key, RefSet, ZArray};
use crate::types::DType;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the synthesised stacking dimension.
pub const VIRTUAL_DIM: &str = "file_number";

/// Fill value of the virtual dimension array.
const VIRTUAL_FILL: u64 = 4611686018427387904;

/// Dimension arguments for combining references.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CombineKwargs {
    /// Dimensions to concatenate over; only the first is used
    #[serde(default)]
    pub concat_dims: Vec<String>,
    /// Variables copied unchanged from the first reference set
    #[serde(default)]
    pub identical_dims: Vec<String>,
}

/// Combiner error type
#[derive(Debug, Error)]
pub enum CombineError {
    /// Chunking of a variable differs between files, or is irregular along the concat dim
    #[error("chunk size mismatch for {var}: {chunk1:?} vs {chunk2:?}")]
    ChunkSizeMismatch {
        var: String,
        chunk1: Vec<usize>,
        chunk2: Vec<usize>,
    },

    /// A variable is present in one reference set but not another
    #[error("variable {var} missing from reference set {index}")]
    MissingVariable { var: String, index: usize },

    /// A variable without the concat dim has more than one element along the new axis
    #[error("variable {var} differs in shape between reference sets")]
    Inconsistent { var: String },

    /// No concat dimension given
    #[error("no concatenation dimension given")]
    NoConcatDim,

    /// Nothing to combine
    #[error("no references to combine")]
    NoReferences,

    /// Invalid reference metadata
    #[error("invalid reference metadata")]
    Refs(#[from] PadoccError),
}

impl From<CombineError> for PadoccError {
    fn from(err: CombineError) -> Self {
        match err {
            CombineError::ChunkSizeMismatch {
                var,
                chunk1,
                chunk2,
            } => PadoccError::ConcatFatal {
                var,
                chunk1: format!("{:?}", chunk1),
                chunk2: format!("{:?}", chunk2),
            },
            CombineError::MissingVariable { var, .. } => PadoccError::MissingVariable { var },
            CombineError::Refs(err) => err,
            _ => PadoccError::Concatenation,
        }
    }
}

/// Combine reference sets along the first concat dimension.
///
/// Metadata and global attributes come from the first set.
///
/// # Arguments
///
/// * `refsets`: Single-file reference sets, in concatenation order
/// * `kwargs`: Concat and identical dimensions
#[tracing::instrument(level = "DEBUG", skip_all, fields(n = refsets.len()))]
pub fn combine(refsets: &[RefSet], kwargs: &CombineKwargs) -> Result<RefSet, CombineError> {
    let first = refsets.first().ok_or(CombineError::NoReferences)?;
    let dim = kwargs
        .concat_dims
        .first()
        .ok_or(CombineError::NoConcatDim)?;
    if kwargs.concat_dims.len() > 1 {
        warn!(
            "Only the first concat dimension is used, ignoring {:?}",
            &kwargs.concat_dims[1..]
        );
    }

    let mut out = RefSet::new();
    for key in [".zgroup", ".zattrs"] {
        if let Some(value) = first.refs.get(key) {
            out.refs.insert(key.to_string(), value.clone());
        }
    }

    for var in first.variables() {
        if kwargs.identical_dims.contains(&var) {
            for key in first.keys_of(&var) {
                if let Some(value) = first.refs.get(&key) {
                    out.refs.insert(key, value.clone());
                }
            }
            continue;
        }
        let dims = first.dims_of(&var)?;
        match dims.iter().position(|d| d == dim) {
            Some(axis) => concat_along(refsets, &var, axis, &mut out)?,
            None => stack_new_axis(refsets, &var, dim, &dims, &mut out)?,
        }
    }

    for (index, refs) in refsets.iter().enumerate().skip(1) {
        for var in refs.variables() {
            if !out.refs.contains_key(&format!("{}/.zarray", var)) {
                warn!("Variable {} only present from reference set {}", var, index);
            }
        }
    }
    debug!("Combined into {} references", out.refs.len());
    Ok(out)
}

fn zarray_of(refs: &RefSet, var: &str, index: usize) -> Result<ZArray, CombineError> {
    refs.zarray(var)?.ok_or_else(|| CombineError::MissingVariable {
        var: var.to_string(),
        index,
    })
}

fn concat_along(
    refsets: &[RefSet],
    var: &str,
    axis: usize,
    out: &mut RefSet,
) -> Result<(), CombineError> {
    let base = zarray_of(&refsets[0], var, 0)?;
    let mut combined = base.clone();
    combined.shape[axis] = 0;
    let mut chunk_offset = 0;
    let last = refsets.len() - 1;

    for (index, refs) in refsets.iter().enumerate() {
        let zarray = zarray_of(refs, var, index)?;
        let other_axes_match = zarray.shape.len() == base.shape.len()
            && zarray
                .shape
                .iter()
                .zip(&base.shape)
                .enumerate()
                .all(|(i, (a, b))| i == axis || a == b);
        if zarray.chunks != base.chunks || !other_axes_match {
            return Err(CombineError::ChunkSizeMismatch {
                var: var.to_string(),
                chunk1: base.chunks.clone(),
                chunk2: zarray.chunks,
            });
        }
        // Only the last file may end on a partial chunk.
        if index != last && zarray.shape[axis] % zarray.chunks[axis] != 0 {
            return Err(CombineError::ChunkSizeMismatch {
                var: var.to_string(),
                chunk1: base.chunks.clone(),
                chunk2: vec![zarray.shape[axis]],
            });
        }
        for (mut chunk_index, value) in refs.chunks_of(var) {
            chunk_index[axis] += chunk_offset;
            out.refs.insert(chunk_key(var, &chunk_index), value.clone());
        }
        chunk_offset += zarray.grid()[axis];
        combined.shape[axis] += zarray.shape[axis];
    }

    out.set_zarray(var, &combined)?;
    out.set_zattrs(Some(var), &refsets[0].zattrs(Some(var))?)?;
    Ok(())
}

fn stack_new_axis(
    refsets: &[RefSet],
    var: &str,
    dim: &str,
    dims: &[String],
    out: &mut RefSet,
) -> Result<(), CombineError> {
    let base = zarray_of(&refsets[0], var, 0)?;
    for (index, refs) in refsets.iter().enumerate() {
        let zarray = zarray_of(refs, var, index)?;
        if zarray.shape != base.shape {
            return Err(CombineError::Inconsistent {
                var: var.to_string(),
            });
        }
        if zarray.chunks != base.chunks {
            return Err(CombineError::ChunkSizeMismatch {
                var: var.to_string(),
                chunk1: base.chunks.clone(),
                chunk2: zarray.chunks,
            });
        }
        for (chunk_index, value) in refs.chunks_of(var) {
            let mut stacked = vec![index];
            stacked.extend(chunk_index);
            out.refs.insert(chunk_key(var, &stacked), value.clone());
        }
    }

    let mut combined = base;
    combined.shape.insert(0, refsets.len());
    combined.chunks.insert(0, 1);
    out.set_zarray(var, &combined)?;

    let mut attrs = refsets[0].zattrs(Some(var))?;
    let mut new_dims = vec![Value::String(dim.to_string())];
    new_dims.extend(dims.iter().map(|d| Value::String(d.clone())));
    attrs.insert("_ARRAY_DIMENSIONS".to_string(), Value::Array(new_dims));
    out.set_zattrs(Some(var), &attrs)?;
    Ok(())
}

/// Add a one-element `file_number` coordinate holding the file index to every set.
///
/// Returns the name of the virtual dimension.
pub fn add_virtual_dim(refsets: &mut [RefSet]) -> Result<&'static str, PadoccError> {
    let zarray = ZArray {
        chunks: vec![1],
        compressor: None,
        dtype: DType::I8,
        fill_value: json!(VIRTUAL_FILL),
        filters: None,
        order: Default::default(),
        shape: vec![1],
        zarr_format: 2,
    };
    let mut zattrs = JsonMap::new();
    zattrs.insert("_ARRAY_DIMENSIONS".to_string(), json!([VIRTUAL_DIM]));
    zattrs.insert("axis".to_string(), json!("F"));
    zattrs.insert("long_name".to_string(), json!(VIRTUAL_DIM));
    zattrs.insert("standard_name".to_string(), json!(VIRTUAL_DIM));

    for (index, refs) in refsets.iter_mut().enumerate() {
        refs.set_zarray(VIRTUAL_DIM, &zarray)?;
        refs.set_zattrs(Some(VIRTUAL_DIM), &zattrs)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode((index as i64).to_le_bytes());
        refs.refs.insert(
            chunk_key(VIRTUAL_DIM, &[0]),
            crate::references::RefValue::Inline(format!(
                "{}{}",
                crate::dataset::BASE64_PREFIX,
                encoded
            )),
        );
    }
    Ok(VIRTUAL_DIM)
}

/// Concat and identical dimensions found by comparing two sample datasets.
#[derive(Clone, Debug, PartialEq)]
pub struct DimSpecs {
    pub kwargs: CombineKwargs,
    /// No dimension varies, so files stack along [VIRTUAL_DIM]
    pub virtual_concat: bool,
}

/// Classify dimensions and variables from the first and last sample datasets.
///
/// A dimension whose coordinate values differ is a concat dimension. A variable that has
/// no concat dimension and equal values in both datasets is identical.
pub fn determine_dim_specs(first: &Dataset, last: &Dataset) -> Result<DimSpecs, PadoccError> {
    let mut concat_dims = Vec::new();
    for (dim, size) in &first.dims {
        let differs = match (first.variables.get(dim), last.variables.get(dim)) {
            (Some(a), Some(b)) => {
                if a.values.is_empty() && b.values.is_empty() {
                    return Err(PadoccError::SoftfailBypass { var: dim.clone() });
                }
                !a.values.equal_nan(&b.values)
            }
            _ => last.dims.get(dim) != Some(size),
        };
        if differs {
            debug!(
                "Non-identical dimension: {} - if this dimension should be identical across the files, please inspect.",
                dim
            );
            concat_dims.push(dim.clone());
        }
    }
    let virtual_concat = concat_dims.is_empty();

    let mut identical_dims = Vec::new();
    let mut normal_dims = Vec::new();
    for (name, var) in &first.variables {
        let has_concat = var.dims.iter().any(|d| concat_dims.contains(d));
        let identical = !has_concat
            && last
                .variables
                .get(name)
                .map_or(false, |other| !var.values.is_empty() && var.values.equal_nan(&other.values));
        if identical {
            identical_dims.push(name.clone());
        } else {
            normal_dims.push(name.clone());
        }
    }
    if identical_dims.len() == first.variables.len() {
        return Err(PadoccError::IdenticalVariables);
    }
    if virtual_concat {
        info!(
            "No concatenation dimensions identified - {:?} will be concatenated using a virtual dimension",
            normal_dims
        );
    } else {
        debug!(
            "Found {:?} that vary over concatenation dimensions {:?}",
            normal_dims, concat_dims
        );
    }
    Ok(DimSpecs {
        kwargs: CombineKwargs {
            concat_dims,
            identical_dims,
        },
        virtual_concat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::references::RefValue;
    use crate::test_utils;

    fn kwargs(concat: &[&str], identical: &[&str]) -> CombineKwargs {
        CombineKwargs {
            concat_dims: concat.iter().map(|s| s.to_string()).collect(),
            identical_dims: identical.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn concat_over_time() {
        let a = test_utils::synthetic_refs("/data/a.nc", &[0.0, 1.0], 2);
        let b = test_utils::synthetic_refs("/data/b.nc", &[2.0, 3.0], 2);
        let combined = combine(&[a, b], &kwargs(&["time"], &["lat"])).unwrap();
        let tas = combined.zarray("tas").unwrap().unwrap();
        assert_eq!(vec![4, 3], tas.shape);
        assert_eq!(vec![2, 2], tas.chunks);
        match &combined.refs["tas/1.1"] {
            RefValue::Range { url, .. } => assert_eq!("/data/b.nc", url),
            other => panic!("unexpected reference {:?}", other),
        }
        assert_eq!(vec![4], combined.zarray("time").unwrap().unwrap().shape);
        assert_eq!(vec![3], combined.zarray("lat").unwrap().unwrap().shape);
        assert_eq!("x", combined.zattrs(None).unwrap()["title"]);
    }

    #[test]
    fn concat_rejects_chunk_mismatch() {
        let a = test_utils::synthetic_refs("/data/a.nc", &[0.0, 1.0], 2);
        let b = test_utils::synthetic_refs("/data/b.nc", &[2.0, 3.0], 3);
        let err = combine(&[a, b], &kwargs(&["time"], &["lat"])).unwrap_err();
        assert!(matches!(err, CombineError::ChunkSizeMismatch { ref var, .. } if var == "tas"));
        assert!(matches!(
            PadoccError::from(err),
            PadoccError::ConcatFatal { .. }
        ));
    }

    #[test]
    fn concat_rejects_irregular_boundary() {
        let mut a = test_utils::synthetic_refs("/data/a.nc", &[0.0, 1.0], 2);
        let b = test_utils::synthetic_refs("/data/b.nc", &[2.0, 3.0], 2);
        let mut zarray = a.zarray("time").unwrap().unwrap();
        zarray.chunks = vec![3];
        zarray.shape = vec![2];
        a.set_zarray("time", &zarray).unwrap();
        let mut zarray_b = b.zarray("time").unwrap().unwrap();
        zarray_b.chunks = vec![3];
        let mut b = b;
        b.set_zarray("time", &zarray_b).unwrap();
        assert!(matches!(
            combine(&[a, b], &kwargs(&["time"], &["lat"])),
            Err(CombineError::ChunkSizeMismatch { .. })
        ));
    }

    #[test]
    fn virtual_dimension_stacking() {
        let mut refsets = vec![
            test_utils::synthetic_refs("/data/a.nc", &[0.0, 1.0], 2),
            test_utils::synthetic_refs("/data/b.nc", &[0.0, 1.0], 2),
            test_utils::synthetic_refs("/data/c.nc", &[0.0, 1.0], 2),
        ];
        let dim = add_virtual_dim(&mut refsets).unwrap();
        assert_eq!(
            RefValue::Inline("base64:AgAAAAAAAAA=".into()),
            refsets[2].refs["file_number/0"]
        );
        let combined = combine(&refsets, &kwargs(&[dim], &["lat", "time"])).unwrap();
        let tas = combined.zarray("tas").unwrap().unwrap();
        assert_eq!(vec![3, 2, 3], tas.shape);
        assert_eq!(vec![1, 2, 2], tas.chunks);
        assert_eq!(
            vec!["file_number", "time", "lat"],
            combined.dims_of("tas").unwrap()
        );
        assert_eq!(vec![3], combined.zarray(dim).unwrap().unwrap().shape);
        assert!(combined.refs.contains_key("tas/2.0.1"));
        let fill = &combined.zarray(dim).unwrap().unwrap().fill_value;
        assert_eq!(&json!(4611686018427387904_u64), fill);
    }

    #[test]
    fn missing_concat_dim() {
        let a = test_utils::synthetic_refs("/data/a.nc", &[0.0], 2);
        assert!(matches!(
            combine(&[a], &CombineKwargs::default()),
            Err(CombineError::NoConcatDim)
        ));
        assert!(matches!(
            combine(&[], &kwargs(&["time"], &[])),
            Err(CombineError::NoReferences)
        ));
    }

    #[test]
    fn kwargs_serde() {
        let value = serde_json::to_value(kwargs(&["time"], &["lat"])).unwrap();
        assert_eq!(json!({"concat_dims": ["time"], "identical_dims": ["lat"]}), value);
        let back: CombineKwargs = serde_json::from_value(json!({"concat_dims": ["t"]})).unwrap();
        assert!(back.identical_dims.is_empty());
    }

    #[test]
    fn dim_specs_from_samples() {
        let dir = tempfile::tempdir().unwrap();
        let first = test_utils::write_synthetic(&dir.path().join("a.bin"), &[0.0, 1.0], 2);
        let last = test_utils::write_synthetic(&dir.path().join("b.bin"), &[2.0, 3.0], 2);
        let specs = determine_dim_specs(
            &Dataset::open_refs(&first).unwrap(),
            &Dataset::open_refs(&last).unwrap(),
        )
        .unwrap();
        assert!(!specs.virtual_concat);
        assert_eq!(vec!["time".to_string()], specs.kwargs.concat_dims);
        assert_eq!(vec!["lat".to_string()], specs.kwargs.identical_dims);
    }

    #[test]
    fn dim_specs_all_identical() {
        let dir = tempfile::tempdir().unwrap();
        let first = test_utils::write_synthetic(&dir.path().join("a.bin"), &[0.0, 1.0], 2);
        let last = test_utils::write_synthetic(&dir.path().join("b.bin"), &[0.0, 1.0], 2);
        assert!(matches!(
            determine_dim_specs(
                &Dataset::open_refs(&first).unwrap(),
                &Dataset::open_refs(&last).unwrap(),
            ),
            Err(PadoccError::IdenticalVariables)
        ));
    }
}
