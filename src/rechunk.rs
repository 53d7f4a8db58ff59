//! Rechunking writer for zarr v2 stores.

use crate::array;
use crate::compression::{self, Compression};
use crate::dataset::{Dataset, Values, Variable};
use crate::error::PadoccError;
use crate::references::{chunk_key, ZArray};
use crate::utils::find_closest;

use byte_unit::{Byte, UnitType};
use ndarray::{ArrayD, Dimension, IxDyn, Slice};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info};

/// Total dimension length above which chunks are sized relative to the whole dataset.
const LARGE_TOTAL: usize = 20000;

/// Chunking decided for a dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct RechunkScheme {
    /// Chunk length per dimension
    pub chunks: BTreeMap<String, usize>,
    /// Length of each dimension
    pub dim_sizes: BTreeMap<String, usize>,
    /// Estimated chunks per input file
    pub chunks_per_file: f64,
    /// Estimated bytes per input file
    pub volume_per_file: f64,
}

/// Decide per-dimension chunk lengths.
///
/// # Arguments
///
/// * `ds`: Combined dataset
/// * `preferences`: Optional preferred chunk length per dimension, in dimension order
/// * `nfiles`: Number of files the dataset was built from
pub fn rechunk_scheme(
    ds: &Dataset,
    preferences: Option<&[Option<usize>]>,
    nfiles: usize,
) -> RechunkScheme {
    let total: usize = ds.dims.values().sum();
    let mut chunks = BTreeMap::new();
    for (index, (dim, size)) in ds.dims.iter().enumerate() {
        let preference = preferences.and_then(|p| p.get(index).copied().flatten());
        let chunk = match preference {
            Some(pref) => find_closest(*size, pref as f64),
            None if total > LARGE_TOTAL => {
                find_closest(*size, 10000.0 * (*size as f64 / total as f64))
            }
            None => find_closest(*size, *size as f64 / 10.0),
        };
        chunks.insert(dim.clone(), chunk.max(1));
    }

    let mut cpf = 0.0;
    let mut volume = 0.0;
    for var in ds.variables.values() {
        cpf += var
            .dims
            .iter()
            .zip(var.shape())
            .map(|(dim, size)| *size as f64 / chunks.get(dim).copied().unwrap_or(1) as f64)
            .sum::<f64>();
        volume += (var.values.len() * var.dtype.itemsize()) as f64;
    }
    let nfiles = nfiles.max(1) as f64;
    RechunkScheme {
        chunks,
        dim_sizes: ds.dims.clone(),
        chunks_per_file: cpf / nfiles,
        volume_per_file: volume / nfiles,
    }
}

/// Parse a memory allowance such as `500MB`.
pub fn parse_memory(allowance: &str) -> Result<u64, PadoccError> {
    Ok(Byte::parse_str(allowance, /* ignore case */ true)?.as_u64())
}

fn format_memory(bytes: u64) -> String {
    format!(
        "{:.2}",
        Byte::from_u64(bytes).get_appropriate_unit(UnitType::Decimal)
    )
}

/// Writer of rechunked zarr v2 stores.
#[derive(Debug)]
pub struct ZarrWriter {
    mem_allowed: u64,
    compression: Compression,
}

impl ZarrWriter {
    /// Return a new ZarrWriter
    ///
    /// # Arguments
    ///
    /// * `mem_allowed`: Memory allowance for a single chunk copy, e.g. `500MB`
    pub fn new(mem_allowed: &str) -> Result<Self, PadoccError> {
        Ok(ZarrWriter {
            mem_allowed: parse_memory(mem_allowed)?,
            compression: Compression::Zlib { level: 1 },
        })
    }

    /// Write `ds` with the chunking of `scheme`.
    ///
    /// Chunks are staged in a unique directory below `tempstore` and moved to `outstore`
    /// once every variable is written.
    #[tracing::instrument(level = "DEBUG", skip(self, ds, scheme))]
    pub fn write(
        &self,
        ds: &Dataset,
        scheme: &RechunkScheme,
        outstore: &Path,
        tempstore: &Path,
    ) -> Result<(), PadoccError> {
        let staging = tempstore.join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&staging)?;
        let result = self.write_store(ds, scheme, &staging);
        if let Err(err) = result {
            fs::remove_dir_all(&staging)?;
            return Err(err);
        }
        if outstore.exists() {
            fs::remove_dir_all(outstore)?;
        }
        if let Some(parent) = outstore.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&staging, outstore)?;
        if fs::read_dir(tempstore)?.next().is_none() {
            fs::remove_dir(tempstore)?;
        }
        info!("Written zarr store {}", outstore.display());
        Ok(())
    }

    fn write_store(
        &self,
        ds: &Dataset,
        scheme: &RechunkScheme,
        store: &Path,
    ) -> Result<(), PadoccError> {
        fs::write(store.join(".zgroup"), json!({"zarr_format": 2}).to_string())?;
        fs::write(store.join(".zattrs"), serde_json::to_string(&ds.attrs)?)?;
        for (name, var) in &ds.variables {
            self.write_variable(name, var, scheme, store)?;
        }
        Ok(())
    }

    fn write_variable(
        &self,
        name: &str,
        var: &Variable,
        scheme: &RechunkScheme,
        store: &Path,
    ) -> Result<(), PadoccError> {
        let shape = var.shape().to_vec();
        let chunks: Vec<usize> = var
            .dims
            .iter()
            .zip(&shape)
            .map(|(dim, size)| scheme.chunks.get(dim).copied().unwrap_or(*size).max(1))
            .collect();
        let chunk_bytes = chunks.iter().product::<usize>() as u64 * var.dtype.itemsize() as u64;
        if chunk_bytes > self.mem_allowed {
            return Err(PadoccError::ExpectMemory {
                required: format_memory(chunk_bytes),
                current: format_memory(self.mem_allowed),
            });
        }
        let fill_value = match (&var.values, var.dtype.is_float()) {
            (Values::Numeric(_), true) => Value::String("NaN".to_string()),
            (Values::Numeric(_), false) => json!(0),
            (Values::Text(_), _) => json!(""),
        };
        let zarray = ZArray {
            chunks: chunks.clone(),
            compressor: Some(serde_json::to_value(&self.compression)?),
            dtype: var.dtype,
            fill_value,
            filters: None,
            order: Default::default(),
            shape: shape.clone(),
            zarr_format: 2,
        };
        let dir = store.join(name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(".zarray"), serde_json::to_string(&zarray)?)?;
        let mut attrs = var.attrs.clone();
        attrs.insert("_ARRAY_DIMENSIONS".to_string(), json!(var.dims));
        fs::write(dir.join(".zattrs"), serde_json::to_string(&attrs)?)?;

        if shape.iter().any(|s| *s == 0) {
            return Ok(());
        }
        let mut count = 0;
        for index in ndarray::indices(IxDyn(&zarray.grid())) {
            let index = index.slice().to_vec();
            let region: Vec<Range<usize>> = index
                .iter()
                .zip(&chunks)
                .zip(&shape)
                .map(|((i, c), s)| (i * c)..((i + 1) * c).min(*s))
                .collect();
            let data = match &var.values {
                Values::Numeric(values) => {
                    let fill = if var.dtype.is_float() { f64::NAN } else { 0.0 };
                    let chunk = padded_chunk(values, &region, &chunks, fill);
                    array::encode_numeric(&var.dtype, &chunk)?
                }
                Values::Text(values) => {
                    let chunk = padded_chunk(values, &region, &chunks, String::new());
                    array::encode_text(&var.dtype, &chunk)?
                }
            };
            let compressed = compression::compress(&self.compression, &data)?;
            let key = chunk_key(name, &index);
            let file = key.rsplit('/').next().unwrap_or(&key);
            fs::write(dir.join(file), &compressed)?;
            count += 1;
        }
        debug!("Wrote {} chunks for {}", count, name);
        Ok(())
    }
}

/// Values of `region` in C order, padded with `fill` to the full chunk shape.
fn padded_chunk<T: Clone>(
    values: &ArrayD<T>,
    region: &[Range<usize>],
    chunks: &[usize],
    fill: T,
) -> Vec<T> {
    let mut chunk = ArrayD::from_elem(IxDyn(chunks), fill);
    let source = values.slice_each_axis(|ax| {
        let r = &region[ax.axis.index()];
        Slice::from(r.start as isize..r.end as isize)
    });
    chunk
        .slice_each_axis_mut(|ax| Slice::from(0..region[ax.axis.index()].len() as isize))
        .assign(&source);
    chunk.into_iter().collect()
}
