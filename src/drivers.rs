//! Reader drivers translating native files into reference sets.
//!
//! Drivers are tried in a fixed order, starting from a hint when one is known. A NetCDF-3
//! classic driver is built in; other formats are supplied by embedders as [Driver] trait
//! objects.

use crate::error::PadoccError;
use crate::filehandlers::JsonMap;
use crate::references::{chunk_key, RefSet, RefValue, ZArray};
use crate::types::DType;

use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use strum_macros::Display;
use tracing::{debug, error, warn};

/// Native formats with a reader driver.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DriverKind {
    /// NetCDF-3 classic
    Ncf3,
    /// NetCDF-4 / HDF5
    Hdf5,
    /// GeoTIFF
    Tif,
    /// GRIB
    Grib,
}

impl DriverKind {
    /// Order in which drivers are tried.
    pub const ALL: [DriverKind; 4] = [
        DriverKind::Ncf3,
        DriverKind::Hdf5,
        DriverKind::Tif,
        DriverKind::Grib,
    ];
}

impl FromStr for DriverKind {
    type Err = PadoccError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DriverKind::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s)
            .ok_or_else(|| PadoccError::InvalidConfig(format!("unknown driver {}", s)))
    }
}

/// A reader for one native file format.
pub trait Driver: Send + Sync {
    /// Format handled by this driver.
    fn kind(&self) -> DriverKind;

    /// Translate a native file into a reference set.
    fn translate(&self, path: &Path) -> Result<RefSet, PadoccError>;
}

/// Registered drivers, at most one per kind.
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<DriverKind> = self.drivers.iter().map(|d| d.kind()).collect();
        f.debug_struct("DriverRegistry").field("drivers", &kinds).finish()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        DriverRegistry {
            drivers: vec![Arc::new(Netcdf3Driver)],
        }
    }
}

impl DriverRegistry {
    /// Registry without any driver.
    pub fn empty() -> Self {
        DriverRegistry {
            drivers: Vec::new(),
        }
    }

    /// Register a driver, replacing any driver of the same kind.
    pub fn register(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.retain(|d| d.kind() != driver.kind());
        self.drivers.push(driver);
        self
    }

    pub fn get(&self, kind: DriverKind) -> Option<&Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.kind() == kind)
    }
}

/// Single-file converter trying every driver in turn.
pub struct KerchunkConverter<'a> {
    registry: &'a DriverRegistry,
    bypass_driver: bool,
}

impl<'a> KerchunkConverter<'a> {
    /// Return a new KerchunkConverter
    ///
    /// # Arguments
    ///
    /// * `registry`: Available drivers
    /// * `bypass_driver`: Treat driver errors as a failed attempt rather than fatal
    pub fn new(registry: &'a DriverRegistry, bypass_driver: bool) -> Self {
        KerchunkConverter {
            registry,
            bypass_driver,
        }
    }

    /// Convert a file, returning the references and the driver that produced them.
    ///
    /// The `hint` driver is tried first, then the others in their default order.
    pub fn run(
        &self,
        path: &Path,
        hint: Option<DriverKind>,
    ) -> Result<(RefSet, DriverKind), PadoccError> {
        if !path.is_file() {
            return Err(PadoccError::SourceNotFound {
                sfile: path.to_string_lossy().into_owned(),
            });
        }
        let order = hint
            .into_iter()
            .chain(DriverKind::ALL.into_iter().filter(|k| Some(*k) != hint));
        for kind in order {
            let Some(driver) = self.registry.get(kind) else {
                debug!("Extension {} not valid", kind);
                continue;
            };
            debug!("Attempting conversion using \"{}\" driver", kind);
            match driver.translate(path) {
                Ok(refs) if !refs.is_empty() => {
                    debug!("Scan successful with {} driver", kind);
                    return Ok((refs, kind));
                }
                Ok(_) => continue,
                Err(err) if self.bypass_driver => {
                    debug!("Driver {} failed: {}", kind, err);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        error!("Scanning failed for all drivers, file type is not Kerchunkable");
        Err(PadoccError::KerchunkDriverFatal)
    }
}

/// NetCDF-3 classic (CDF-1) and 64-bit offset (CDF-2) driver.
#[derive(Debug, Default)]
pub struct Netcdf3Driver;

const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;
const STREAMING: u32 = 0xFFFF_FFFF;

struct HeaderReader<R: Read> {
    inner: R,
}

impl<R: Read> HeaderReader<R> {
    fn bytes(&mut self, n: usize) -> Result<Vec<u8>, PadoccError> {
        let mut buf = vec![0_u8; n];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn u32(&mut self) -> Result<u32, PadoccError> {
        let mut buf = [0_u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, PadoccError> {
        let mut buf = [0_u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Read `n` bytes followed by padding to a 4-byte boundary.
    fn padded(&mut self, n: usize) -> Result<Vec<u8>, PadoccError> {
        let data = self.bytes(n)?;
        self.bytes((4 - n % 4) % 4)?;
        Ok(data)
    }

    fn name(&mut self) -> Result<String, PadoccError> {
        let len = self.u32()? as usize;
        Ok(String::from_utf8_lossy(&self.padded(len)?).into_owned())
    }

    /// Read a list header, returning the element count.
    fn list(&mut self, tag: u32) -> Result<usize, PadoccError> {
        let found = self.u32()?;
        let count = self.u32()? as usize;
        if found == 0 && count == 0 {
            return Ok(0);
        }
        if found != tag {
            return Err(PadoccError::KerchunkDecode {
                reason: format!("expected tag {:#x}, found {:#x}", tag, found),
            });
        }
        Ok(count)
    }
}

/// NetCDF external type.
#[derive(Clone, Copy, Debug)]
enum NcType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
}

impl NcType {
    fn from_code(code: u32) -> Result<Self, PadoccError> {
        Ok(match code {
            1 => NcType::Byte,
            2 => NcType::Char,
            3 => NcType::Short,
            4 => NcType::Int,
            5 => NcType::Float,
            6 => NcType::Double,
            _ => {
                return Err(PadoccError::KerchunkDecode {
                    reason: format!("unknown nc_type {}", code),
                })
            }
        })
    }

    fn size(&self) -> usize {
        match self {
            NcType::Byte | NcType::Char => 1,
            NcType::Short => 2,
            NcType::Int | NcType::Float => 4,
            NcType::Double => 8,
        }
    }

    fn dtype(&self) -> &'static str {
        match self {
            NcType::Byte => "|i1",
            NcType::Char => "|S1",
            NcType::Short => ">i2",
            NcType::Int => ">i4",
            NcType::Float => ">f4",
            NcType::Double => ">f8",
        }
    }

    fn values(&self, data: &[u8]) -> Value {
        if let NcType::Char = self {
            let end = data.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
            return Value::String(String::from_utf8_lossy(&data[..end]).into_owned());
        }
        let number = |chunk: &[u8]| -> Value {
            match self {
                NcType::Byte => json!(chunk[0] as i8),
                NcType::Short => json!(i16::from_be_bytes([chunk[0], chunk[1]])),
                NcType::Int => json!(i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
                NcType::Float => {
                    let v = f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    Number::from_f64(v as f64).map_or(Value::Null, Value::Number)
                }
                NcType::Double => {
                    let mut buf = [0_u8; 8];
                    buf.copy_from_slice(chunk);
                    Number::from_f64(f64::from_be_bytes(buf)).map_or(Value::Null, Value::Number)
                }
                NcType::Char => Value::Null,
            }
        };
        let mut values: Vec<Value> = data.chunks_exact(self.size()).map(number).collect();
        if values.len() == 1 {
            values.remove(0)
        } else {
            Value::Array(values)
        }
    }
}

struct NcVariable {
    name: String,
    dimids: Vec<usize>,
    attrs: JsonMap,
    nc_type: NcType,
    vsize: u64,
    begin: u64,
}

fn read_attrs<R: Read>(reader: &mut HeaderReader<R>) -> Result<JsonMap, PadoccError> {
    let count = reader.list(NC_ATTRIBUTE)?;
    let mut attrs = JsonMap::new();
    for _ in 0..count {
        let name = reader.name()?;
        let nc_type = NcType::from_code(reader.u32()?)?;
        let nelems = reader.u32()? as usize;
        let data = reader.padded(nelems * nc_type.size())?;
        attrs.insert(name, nc_type.values(&data));
    }
    Ok(attrs)
}

impl Driver for Netcdf3Driver {
    fn kind(&self) -> DriverKind {
        DriverKind::Ncf3
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    fn translate(&self, path: &Path) -> Result<RefSet, PadoccError> {
        let mut reader = HeaderReader {
            inner: BufReader::new(File::open(path)?),
        };
        let magic = reader.bytes(4)?;
        let offset64 = match magic.as_slice() {
            b"CDF\x01" => false,
            b"CDF\x02" => true,
            _ => {
                return Err(PadoccError::KerchunkDecode {
                    reason: format!("{} is not a NetCDF-3 file", path.display()),
                })
            }
        };
        let numrecs = match reader.u32()? {
            STREAMING => {
                return Err(PadoccError::KerchunkDecode {
                    reason: "streaming record count is not supported".to_string(),
                })
            }
            n => n as usize,
        };

        let ndims = reader.list(NC_DIMENSION)?;
        let mut dims = Vec::with_capacity(ndims);
        let mut record_dim = None;
        for i in 0..ndims {
            let name = reader.name()?;
            let len = reader.u32()? as usize;
            if len == 0 {
                record_dim = Some(i);
                dims.push((name, numrecs));
            } else {
                dims.push((name, len));
            }
        }
        let global_attrs = read_attrs(&mut reader)?;

        let nvars = reader.list(NC_VARIABLE)?;
        let mut variables = Vec::with_capacity(nvars);
        for _ in 0..nvars {
            let name = reader.name()?;
            let ndim = reader.u32()? as usize;
            let dimids = (0..ndim)
                .map(|_| reader.u32().map(|d| d as usize))
                .collect::<Result<Vec<_>, _>>()?;
            if dimids.iter().any(|d| *d >= dims.len()) {
                return Err(PadoccError::KerchunkDecode {
                    reason: format!("variable {} has an unknown dimension", name),
                });
            }
            let attrs = read_attrs(&mut reader)?;
            let nc_type = NcType::from_code(reader.u32()?)?;
            let vsize = reader.u32()? as u64;
            let begin = if offset64 {
                reader.u64()?
            } else {
                reader.u32()? as u64
            };
            variables.push(NcVariable {
                name,
                dimids,
                attrs,
                nc_type,
                vsize,
                begin,
            });
        }

        let is_record = |v: &NcVariable| record_dim.is_some() && v.dimids.first() == record_dim.as_ref();
        let record_vars: Vec<&NcVariable> = variables.iter().filter(|v| is_record(v)).collect();
        let unpadded = |v: &NcVariable| -> u64 {
            v.dimids
                .iter()
                .skip(usize::from(is_record(v)))
                .map(|d| dims[*d].1 as u64)
                .product::<u64>()
                * v.nc_type.size() as u64
        };
        let recsize: u64 = match record_vars.as_slice() {
            [single] => unpadded(single),
            many => many.iter().map(|v| v.vsize).sum(),
        };

        let url = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned();
        let mut refs = RefSet::new();
        refs.refs.insert(
            ".zgroup".to_string(),
            RefValue::Inline(json!({"zarr_format": 2}).to_string()),
        );
        refs.set_zattrs(None, &global_attrs)?;

        for var in &variables {
            let shape: Vec<usize> = var.dimids.iter().map(|d| dims[*d].1).collect();
            let record = is_record(var);
            let mut chunks = shape.clone();
            if record {
                chunks[0] = 1;
            }
            let fill_value = var
                .attrs
                .get("_FillValue")
                .filter(|v| v.is_number())
                .cloned()
                .unwrap_or(Value::Null);
            let dtype: DType = var.nc_type.dtype().parse()?;
            let zarray = ZArray {
                chunks: chunks.clone(),
                compressor: None,
                dtype,
                fill_value,
                filters: None,
                order: Default::default(),
                shape: shape.clone(),
                zarr_format: 2,
            };
            refs.set_zarray(&var.name, &zarray)?;
            let mut attrs = var.attrs.clone();
            let dim_names: Vec<Value> = var
                .dimids
                .iter()
                .map(|d| Value::String(dims[*d].0.clone()))
                .collect();
            attrs.insert("_ARRAY_DIMENSIONS".to_string(), Value::Array(dim_names));
            refs.set_zattrs(Some(&var.name), &attrs)?;

            if shape.iter().any(|s| *s == 0) {
                continue;
            }
            let zeros = vec![0; shape.len().saturating_sub(1)];
            if record {
                let length = unpadded(var);
                for r in 0..numrecs {
                    let mut index = vec![r];
                    index.extend(&zeros);
                    refs.refs.insert(
                        chunk_key(&var.name, &index),
                        RefValue::Range {
                            url: url.clone(),
                            offset: var.begin + r as u64 * recsize,
                            length,
                        },
                    );
                }
            } else {
                let index = vec![0; shape.len()];
                refs.refs.insert(
                    chunk_key(&var.name, &index),
                    RefValue::Range {
                        url: url.clone(),
                        offset: var.begin,
                        length: unpadded(var),
                    },
                );
            }
        }
        if variables.is_empty() {
            warn!("No variables found in {}", path.display());
        }
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dataset::Dataset;
    use crate::test_utils;

    struct Failing(DriverKind);

    impl Driver for Failing {
        fn kind(&self) -> DriverKind {
            self.0
        }

        fn translate(&self, _path: &Path) -> Result<RefSet, PadoccError> {
            Err(PadoccError::KerchunkDecode {
                reason: "not my format".into(),
            })
        }
    }

    #[test]
    fn driver_kind_names() {
        assert_eq!("ncf3", DriverKind::Ncf3.to_string());
        assert_eq!(DriverKind::Grib, "grib".parse().unwrap());
        assert!("nc".parse::<DriverKind>().is_err());
    }

    #[test]
    fn netcdf3_translation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nc");
        test_utils::write_netcdf3(&path, &[5.0, 6.0], 1.0);
        let refs = Netcdf3Driver.translate(&path).unwrap();
        assert_eq!(
            vec!["lat".to_string(), "tas".to_string(), "time".to_string()],
            refs.variables()
        );
        let tas = refs.zarray("tas").unwrap().unwrap();
        assert_eq!(vec![2, 4], tas.shape);
        assert_eq!(vec![1, 4], tas.chunks);
        assert_eq!("test file", refs.zattrs(None).unwrap()["title"]);
        assert_eq!("K", refs.zattrs(Some("tas")).unwrap()["units"]);

        let ds = Dataset::open_refs(&refs).unwrap();
        assert_eq!(Some(vec![5.0, 6.0]), ds.coord("time"));
        assert_eq!(Some(vec![-45.0, -15.0, 15.0, 45.0]), ds.coord("lat"));
        let tas = ds.variables["tas"].values.as_numeric().unwrap();
        assert_eq!(1.0 + 5.0 * 10.0 + 3.0, tas[[0, 3]]);
        assert_eq!(1.0 + 6.0 * 10.0, tas[[1, 0]]);
    }

    #[test]
    fn netcdf3_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.h5");
        std::fs::write(&path, b"\x89HDF\r\n\x1a\n").unwrap();
        assert!(matches!(
            Netcdf3Driver.translate(&path),
            Err(PadoccError::KerchunkDecode { .. })
        ));
    }

    #[test]
    fn converter_source_not_found() {
        let registry = DriverRegistry::default();
        let converter = KerchunkConverter::new(&registry, true);
        assert!(matches!(
            converter.run(Path::new("/no/such/file.nc"), None),
            Err(PadoccError::SourceNotFound { .. })
        ));
    }

    #[test]
    fn converter_tries_hint_then_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nc");
        test_utils::write_netcdf3(&path, &[0.0], 0.0);
        let registry = DriverRegistry::default().register(Arc::new(Failing(DriverKind::Hdf5)));
        let converter = KerchunkConverter::new(&registry, true);
        let (_, kind) = converter.run(&path, Some(DriverKind::Hdf5)).unwrap();
        assert_eq!(DriverKind::Ncf3, kind);
    }

    #[test]
    fn converter_without_bypass_raises_driver_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nc");
        test_utils::write_netcdf3(&path, &[0.0], 0.0);
        let registry = DriverRegistry::default().register(Arc::new(Failing(DriverKind::Hdf5)));
        let converter = KerchunkConverter::new(&registry, false);
        assert!(matches!(
            converter.run(&path, Some(DriverKind::Hdf5)),
            Err(PadoccError::KerchunkDecode { .. })
        ));
    }

    #[test]
    fn converter_all_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.grb");
        std::fs::write(&path, b"GRIB").unwrap();
        let registry = DriverRegistry::default();
        let converter = KerchunkConverter::new(&registry, true);
        assert!(matches!(
            converter.run(&path, None),
            Err(PadoccError::KerchunkDriverFatal)
        ));
    }
}
