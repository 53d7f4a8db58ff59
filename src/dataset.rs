//! In-memory datasets read through reference sets.
//!
//! This is the reference reader: chunks are fetched from inline content or byte ranges of
//! local files, decompressed, unfiltered and decoded into [ndarray] arrays.

use crate::array::{self, build_array};
use crate::compression::{self, Compression};
use crate::error::PadoccError;
use crate::filehandlers::JsonMap;
use crate::filters::{self, Filter};
use crate::references::{chunk_key, RefSet, RefValue, ZArray};
use crate::types::DType;

use base64::Engine;
use bytes::Bytes;
use ndarray::{ArrayD, Axis, Dimension, IxDyn, Slice};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::PathBuf;
use tracing::debug;
use url::Url;

/// Prefix of base64 encoded inline chunks.
pub const BASE64_PREFIX: &str = "base64:";

/// Values of a variable.
#[derive(Clone, Debug, PartialEq)]
pub enum Values {
    /// Numbers of any width, widened to `f64`
    Numeric(ArrayD<f64>),
    /// Fixed-width text
    Text(ArrayD<String>),
}

impl Values {
    pub fn shape(&self) -> &[usize] {
        match self {
            Values::Numeric(a) => a.shape(),
            Values::Text(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select a hyper-rectangle, one range per axis.
    pub fn slice(&self, ranges: &[Range<usize>]) -> Values {
        let select = |ax: ndarray::AxisDescription| {
            let range = &ranges[ax.axis.index()];
            Slice::from(range.start as isize..range.end as isize)
        };
        match self {
            Values::Numeric(a) => Values::Numeric(a.slice_each_axis(select).to_owned()),
            Values::Text(a) => Values::Text(a.slice_each_axis(select).to_owned()),
        }
    }

    fn remove_axis(self, axis: usize) -> Values {
        match self {
            Values::Numeric(a) => Values::Numeric(a.index_axis_move(Axis(axis), 0)),
            Values::Text(a) => Values::Text(a.index_axis_move(Axis(axis), 0)),
        }
    }

    /// Element-wise equality where NaN equals NaN.
    pub fn equal_nan(&self, other: &Values) -> bool {
        match (self, other) {
            (Values::Numeric(a), Values::Numeric(b)) => {
                a.shape() == b.shape()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
            }
            (Values::Text(a), Values::Text(b)) => a == b,
            _ => false,
        }
    }

    /// Numeric values, if any.
    pub fn as_numeric(&self) -> Option<&ArrayD<f64>> {
        match self {
            Values::Numeric(a) => Some(a),
            Values::Text(_) => None,
        }
    }
}

/// A named array with dimensions and attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub attrs: JsonMap,
    pub dtype: DType,
    pub values: Values,
}

impl Variable {
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }
}

/// A set of variables sharing named dimensions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    pub dims: BTreeMap<String, usize>,
    pub variables: BTreeMap<String, Variable>,
    pub attrs: JsonMap,
}

impl Dataset {
    /// Open a reference set, reading every variable into memory.
    #[tracing::instrument(level = "DEBUG", skip(refs))]
    pub fn open_refs(refs: &RefSet) -> Result<Self, PadoccError> {
        let mut dataset = Dataset {
            attrs: refs.zattrs(None)?,
            ..Default::default()
        };
        for (name, zarray) in refs.zarrays()? {
            let dims = refs.dims_of(&name)?;
            for (dim, size) in dims.iter().zip(&zarray.shape) {
                match dataset.dims.get(dim) {
                    Some(existing) if existing != size => {
                        return Err(PadoccError::KerchunkDecode {
                            reason: format!(
                                "dimension {} has sizes {} and {}",
                                dim, existing, size
                            ),
                        })
                    }
                    _ => {
                        dataset.dims.insert(dim.clone(), *size);
                    }
                }
            }
            let mut attrs = refs.zattrs(Some(&name))?;
            attrs.remove("_ARRAY_DIMENSIONS");
            let values = read_variable(refs, &name, &zarray)?;
            debug!("Read {} with shape {:?}", name, values.shape());
            dataset.variables.insert(
                name,
                Variable {
                    dims,
                    attrs,
                    dtype: zarray.dtype,
                    values,
                },
            );
        }
        Ok(dataset)
    }

    /// Numeric values of a one-dimensional variable.
    pub fn coord(&self, name: &str) -> Option<Vec<f64>> {
        let var = self.variables.get(name)?;
        if var.dims.len() != 1 {
            return None;
        }
        var.values.as_numeric().map(|a| a.iter().copied().collect())
    }

    /// Select `range` along `dim` in every variable that has it.
    pub fn isel(&self, dim: &str, range: Range<usize>) -> Dataset {
        let mut selected = self.clone();
        if let Some(size) = selected.dims.get_mut(dim) {
            *size = range.len();
        }
        for var in selected.variables.values_mut() {
            if let Some(axis) = var.dims.iter().position(|d| d == dim) {
                let ranges: Vec<Range<usize>> = var
                    .shape()
                    .iter()
                    .enumerate()
                    .map(|(i, s)| if i == axis { range.clone() } else { 0..*s })
                    .collect();
                var.values = var.values.slice(&ranges);
            }
        }
        selected
    }

    /// Remove a length-one dimension and its coordinate variable.
    pub fn squeeze(mut self, dim: &str) -> Result<Dataset, PadoccError> {
        match self.dims.remove(dim) {
            Some(1) | None => (),
            Some(size) => {
                return Err(PadoccError::UnsupportedOperation {
                    operation: format!("squeeze of dimension {} with size {}", dim, size),
                })
            }
        }
        self.variables.remove(dim);
        for var in self.variables.values_mut() {
            if let Some(axis) = var.dims.iter().position(|d| d == dim) {
                var.dims.remove(axis);
                var.values = var.values.clone().remove_axis(axis);
            }
        }
        Ok(self)
    }
}

/// Numeric fill value of an array.
fn numeric_fill(zarray: &ZArray) -> f64 {
    match &zarray.fill_value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => match s.as_str() {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            _ => f64::NAN,
        },
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ if zarray.dtype.is_float() => f64::NAN,
        _ => 0.0,
    }
}

fn read_variable(refs: &RefSet, var: &str, zarray: &ZArray) -> Result<Values, PadoccError> {
    let shape = IxDyn(&zarray.shape);
    let mut values = if zarray.dtype.is_numeric() {
        Values::Numeric(ArrayD::from_elem(shape, numeric_fill(zarray)))
    } else {
        Values::Text(ArrayD::from_elem(shape, String::new()))
    };
    let compression = match &zarray.compressor {
        Some(Value::Null) | None => None,
        Some(value) => Some(Compression::from_value(value)?),
    };
    let chunk_filters = zarray
        .filters
        .iter()
        .flatten()
        .map(Filter::from_value)
        .collect::<Result<Vec<_>, _>>()?;

    for index in ndarray::indices(IxDyn(&zarray.grid())) {
        let index = index.slice().to_vec();
        let key = chunk_key(var, &index);
        let Some(reference) = refs.refs.get(&key) else {
            continue;
        };
        let mut data = load_chunk(reference)?;
        if let Some(compression) = &compression {
            data = compression::decompress(compression, &data)?;
        }
        for filter in chunk_filters.iter().rev() {
            data = filters::decode(filter, &data)?;
        }
        let expected = zarray.chunk_len() * zarray.dtype.itemsize();
        if data.len() != expected {
            return Err(PadoccError::ChunkData {
                reason: format!("{} has {} bytes, expected {}", key, data.len(), expected),
            });
        }
        let region: Vec<Range<usize>> = index
            .iter()
            .zip(&zarray.chunks)
            .zip(&zarray.shape)
            .map(|((i, c), s)| (i * c)..((i + 1) * c).min(*s))
            .collect();
        let within: Vec<Range<usize>> = region.iter().map(|r| 0..r.len()).collect();
        let target = |ax: ndarray::AxisDescription| {
            let r = &region[ax.axis.index()];
            Slice::from(r.start as isize..r.end as isize)
        };
        let source = |ax: ndarray::AxisDescription| {
            let r = &within[ax.axis.index()];
            Slice::from(r.start as isize..r.end as isize)
        };
        match &mut values {
            Values::Numeric(full) => {
                let chunk = build_array(
                    &zarray.chunks,
                    zarray.order,
                    array::decode_numeric(&zarray.dtype, &data)?,
                )?;
                full.slice_each_axis_mut(target)
                    .assign(&chunk.slice_each_axis(source));
            }
            Values::Text(full) => {
                let chunk = build_array(
                    &zarray.chunks,
                    zarray.order,
                    array::decode_text(&zarray.dtype, &data)?,
                )?;
                full.slice_each_axis_mut(target)
                    .assign(&chunk.slice_each_axis(source));
            }
        }
    }
    Ok(values)
}

/// Local path of a reference url.
///
/// Absolute paths and `file://` urls are supported.
pub fn local_path(url: &str) -> Result<PathBuf, PadoccError> {
    if url.starts_with('/') {
        return Ok(PathBuf::from(url));
    }
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => {
            parsed
                .to_file_path()
                .map_err(|_| PadoccError::UnsupportedOperation {
                    operation: format!("reading reference {}", url),
                })
        }
        Ok(_) => Err(PadoccError::UnsupportedOperation {
            operation: format!("reading remote reference {}", url),
        }),
        Err(_) => Ok(PathBuf::from(url)),
    }
}

/// Raw bytes of a reference.
pub fn load_chunk(reference: &RefValue) -> Result<Bytes, PadoccError> {
    match reference {
        RefValue::Inline(text) => match text.strip_prefix(BASE64_PREFIX) {
            Some(encoded) => Ok(base64::engine::general_purpose::STANDARD
                .decode(encoded)?
                .into()),
            None => Ok(Bytes::copy_from_slice(text.as_bytes())),
        },
        RefValue::Range {
            url,
            offset,
            length,
        } => {
            let path = local_path(url)?;
            let mut file = File::open(&path).map_err(|_| PadoccError::SourceNotFound {
                sfile: path.to_string_lossy().into_owned(),
            })?;
            file.seek(SeekFrom::Start(*offset))?;
            let mut buf = vec![0_u8; *length as usize];
            file.read_exact(&mut buf)?;
            Ok(buf.into())
        }
        RefValue::Whole(url) => Ok(std::fs::read(local_path(url)?)?.into()),
    }
}

/// Encode bytes as an inline reference.
pub fn inline_chunk(data: &[u8]) -> RefValue {
    RefValue::Inline(format!(
        "{}{}",
        BASE64_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(data)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;
    use ndarray::array;

    #[test]
    fn open_synthetic_refs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let refs = test_utils::write_synthetic(&path, &[10.0, 11.0], 2);
        let ds = Dataset::open_refs(&refs).unwrap();
        assert_eq!(Some(&2), ds.dims.get("time"));
        assert_eq!(Some(&3), ds.dims.get("lat"));
        assert_eq!(Some(vec![10.0, 11.0]), ds.coord("time"));
        let tas = &ds.variables["tas"];
        assert_eq!(&[2, 3], tas.shape());
        assert_eq!(
            &array![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]].into_dyn(),
            tas.values.as_numeric().unwrap()
        );
        assert_eq!("x", ds.attrs["title"]);
        assert!(!tas.attrs.contains_key("_ARRAY_DIMENSIONS"));
    }

    #[test]
    fn missing_chunk_uses_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let mut refs = test_utils::write_synthetic(&path, &[10.0, 11.0], 2);
        refs.refs.remove("tas/0.1");
        let ds = Dataset::open_refs(&refs).unwrap();
        let tas = ds.variables["tas"].values.as_numeric().unwrap();
        assert!(tas[[0, 2]].is_nan());
        assert_eq!(0.0, tas[[0, 0]]);
    }

    #[test]
    fn missing_source_file() {
        let refs = test_utils::synthetic_refs("/no/such/file.nc", &[0.0], 2);
        assert!(matches!(
            Dataset::open_refs(&refs),
            Err(PadoccError::SourceNotFound { .. })
        ));
    }

    #[test]
    fn isel_and_squeeze() {
        let dir = tempfile::tempdir().unwrap();
        let refs = test_utils::write_synthetic(&dir.path().join("a.bin"), &[10.0, 11.0], 2);
        let ds = Dataset::open_refs(&refs).unwrap();
        let second = ds.isel("time", 1..2);
        assert_eq!(Some(vec![11.0]), second.coord("time"));
        let squeezed = second.squeeze("time").unwrap();
        assert!(!squeezed.variables.contains_key("time"));
        assert_eq!(&[3], squeezed.variables["tas"].shape());
        assert!(ds.squeeze("time").is_err());
    }

    #[test]
    fn inline_base64_roundtrip() {
        let value = inline_chunk(&[1, 2, 3]);
        assert_eq!(Bytes::from_static(&[1, 2, 3]), load_chunk(&value).unwrap());
        let text = RefValue::Inline("{\"a\": 1}".into());
        assert_eq!(Bytes::from_static(b"{\"a\": 1}"), load_chunk(&text).unwrap());
    }

    #[test]
    fn local_paths() {
        assert_eq!(PathBuf::from("/a/b.nc"), local_path("/a/b.nc").unwrap());
        assert_eq!(PathBuf::from("/a/b.nc"), local_path("file:///a/b.nc").unwrap());
        assert!(local_path("https://dap.ceda.ac.uk/a.nc").is_err());
    }
}
