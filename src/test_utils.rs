use crate::cfa::CfaBackend;
use crate::drivers::{Driver, DriverKind, DriverRegistry, Netcdf3Driver};
use crate::error::PadoccError;
use crate::filehandlers::JsonMap;
use crate::group::GroupOperation;
use crate::models::BaseConfig;
use crate::project::{ProjectOperation, ProjectSettings};
use crate::references::{chunk_key, RefSet, RefValue, ZArray};
use crate::types::DType;

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Latitudes of the synthetic datasets.
const SYNTHETIC_LAT: [f64; 3] = [-60.0, 0.0, 60.0];

/// Create empty files in `dir`.
pub(crate) fn touch_files(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
    fs::create_dir_all(dir).unwrap();
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            fs::write(&path, b"").unwrap();
            path
        })
        .collect()
}

/// Initialise a project whose file list is `files`.
pub(crate) fn new_project(
    workdir: &Path,
    group_id: Option<&str>,
    proj_code: &str,
    files: &[PathBuf],
    settings: ProjectSettings,
) -> ProjectOperation {
    fs::create_dir_all(workdir).unwrap();
    let listing = workdir.join(format!("{}-files.txt", proj_code));
    let lines: Vec<String> = files
        .iter()
        .map(|f| f.to_string_lossy().into_owned())
        .collect();
    fs::write(&listing, lines.join("\n")).unwrap();
    let mut project = ProjectOperation::new(proj_code, workdir, group_id, settings);
    project
        .setup_config(&BaseConfig::new(proj_code, &listing.to_string_lossy()))
        .unwrap();
    project.save_files().unwrap();
    project
}

/// Group `group_id` with one single-file project per code.
pub(crate) fn new_group(workdir: &Path, group_id: &str, codes: &[&str]) -> GroupOperation {
    let mut group = GroupOperation::new(group_id, workdir, ProjectSettings::default()).unwrap();
    for code in codes {
        let files = touch_files(&workdir.join("data").join(code), &["a.nc"]);
        let listing = workdir.join("data").join(format!("{}.txt", code));
        fs::write(&listing, files[0].to_string_lossy().as_bytes()).unwrap();
        group
            .add_project(&BaseConfig::new(code, &listing.to_string_lossy()))
            .unwrap();
    }
    group.save_files().unwrap();
    group
}

/// Initialise a project over NetCDF-3 files, one per entry of `times`.
pub(crate) fn netcdf_project(
    workdir: &Path,
    group_id: Option<&str>,
    proj_code: &str,
    times: &[Vec<f64>],
    settings: ProjectSettings,
) -> ProjectOperation {
    let data = workdir.join("data").join(proj_code);
    fs::create_dir_all(&data).unwrap();
    let files: Vec<PathBuf> = times
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let path = data.join(format!("{:03}.nc", i));
            write_netcdf3(&path, t, 0.0);
            path
        })
        .collect();
    new_project(workdir, group_id, proj_code, &files, settings)
}

/// Project `g1/p1` over NetCDF-3 content in `.h5` files, readable only by [FakeHdf5Driver].
pub(crate) fn hdf5_project(workdir: &Path, nfiles: usize) -> ProjectOperation {
    let data = workdir.join("data");
    let files: Vec<PathBuf> = time_steps(nfiles, 1)
        .iter()
        .enumerate()
        .map(|(i, times)| {
            let path = data.join(format!("{:03}.h5", i));
            write_netcdf3(&path, times, 0.0);
            path
        })
        .collect();
    let settings = ProjectSettings {
        drivers: DriverRegistry::empty().register(Arc::new(FakeHdf5Driver)),
        ..Default::default()
    };
    new_project(workdir, Some("g1"), "p1", &files, settings)
}

/// Consecutive time steps, `per_file` in each of `nfiles` files.
pub(crate) fn time_steps(nfiles: usize, per_file: usize) -> Vec<Vec<f64>> {
    (0..nfiles)
        .map(|i| (0..per_file).map(|t| (i * per_file + t) as f64).collect())
        .collect()
}

fn float_array(shape: Vec<usize>, chunks: Vec<usize>) -> ZArray {
    ZArray {
        chunks,
        compressor: None,
        dtype: DType::F8,
        fill_value: Value::Null,
        filters: None,
        order: Default::default(),
        shape,
        zarr_format: 2,
    }
}

fn dims_attrs(dims: &[&str]) -> JsonMap {
    let mut attrs = JsonMap::new();
    attrs.insert("_ARRAY_DIMENSIONS".to_string(), json!(dims));
    attrs
}

/// Reference set over a synthetic little-endian file at `url`.
///
/// Variables are `time(time)`, `lat(lat)` and `tas(time, lat)` with `tas[t][l] = 3t + l`,
/// chunked by `lat_chunk` along `lat`. The layout matches [write_synthetic].
pub(crate) fn synthetic_refs(url: &str, times: &[f64], lat_chunk: usize) -> RefSet {
    let ntime = times.len();
    let nlat = SYNTHETIC_LAT.len();
    let mut refs = RefSet::new();
    refs.refs.insert(
        ".zgroup".to_string(),
        RefValue::Inline(json!({"zarr_format": 2}).to_string()),
    );
    let mut global = JsonMap::new();
    global.insert("title".to_string(), json!("x"));
    refs.set_zattrs(None, &global).unwrap();

    refs.set_zarray("time", &float_array(vec![ntime], vec![ntime]))
        .unwrap();
    refs.set_zattrs(Some("time"), &dims_attrs(&["time"])).unwrap();
    refs.refs.insert(
        chunk_key("time", &[0]),
        RefValue::Range {
            url: url.to_string(),
            offset: 0,
            length: (ntime * 8) as u64,
        },
    );

    refs.set_zarray("lat", &float_array(vec![nlat], vec![nlat]))
        .unwrap();
    refs.set_zattrs(Some("lat"), &dims_attrs(&["lat"])).unwrap();
    refs.refs.insert(
        chunk_key("lat", &[0]),
        RefValue::Range {
            url: url.to_string(),
            offset: (ntime * 8) as u64,
            length: (nlat * 8) as u64,
        },
    );

    refs.set_zarray("tas", &float_array(vec![ntime, nlat], vec![ntime, lat_chunk]))
        .unwrap();
    let mut tas_attrs = dims_attrs(&["time", "lat"]);
    tas_attrs.insert("units".to_string(), json!("K"));
    refs.set_zattrs(Some("tas"), &tas_attrs).unwrap();
    let chunk_bytes = ntime * lat_chunk * 8;
    let base = (ntime + nlat) * 8;
    for j in 0..(nlat + lat_chunk - 1) / lat_chunk {
        refs.refs.insert(
            chunk_key("tas", &[0, j]),
            RefValue::Range {
                url: url.to_string(),
                offset: (base + j * chunk_bytes) as u64,
                length: chunk_bytes as u64,
            },
        );
    }
    refs
}

/// Write the file described by [synthetic_refs] and return its references.
pub(crate) fn write_synthetic(path: &Path, times: &[f64], lat_chunk: usize) -> RefSet {
    let ntime = times.len();
    let nlat = SYNTHETIC_LAT.len();
    let mut data: Vec<u8> = Vec::new();
    for t in times {
        data.extend(t.to_le_bytes());
    }
    for l in SYNTHETIC_LAT {
        data.extend(l.to_le_bytes());
    }
    for j in 0..(nlat + lat_chunk - 1) / lat_chunk {
        for t in 0..ntime {
            for k in 0..lat_chunk {
                let l = j * lat_chunk + k;
                let value = if l < nlat { (t * nlat + l) as f64 } else { 0.0 };
                data.extend(value.to_le_bytes());
            }
        }
    }
    fs::write(path, data).unwrap();
    synthetic_refs(&path.to_string_lossy(), times, lat_chunk)
}

/// Latitudes of the NetCDF-3 test files.
pub(crate) const NETCDF_LAT: [f64; 4] = [-45.0, -15.0, 15.0, 45.0];

fn put_name(buf: &mut Vec<u8>, name: &str) {
    buf.extend((name.len() as u32).to_be_bytes());
    buf.extend(name.as_bytes());
    buf.resize(buf.len() + (4 - name.len() % 4) % 4, 0);
}

fn put_text_attrs(buf: &mut Vec<u8>, attrs: &[(&str, &str)]) {
    if attrs.is_empty() {
        buf.extend([0_u8; 8]);
        return;
    }
    buf.extend(0x0C_u32.to_be_bytes());
    buf.extend((attrs.len() as u32).to_be_bytes());
    for (name, value) in attrs {
        put_name(buf, name);
        buf.extend(2_u32.to_be_bytes());
        put_name(buf, value);
    }
}

fn netcdf3_header(
    ntime: usize,
    global: &[(&str, &str)],
    lat_begin: u32,
    records_begin: u32,
) -> Vec<u8> {
    let mut buf = b"CDF\x01".to_vec();
    buf.extend((ntime as u32).to_be_bytes());

    buf.extend(0x0A_u32.to_be_bytes());
    buf.extend(2_u32.to_be_bytes());
    put_name(&mut buf, "time");
    buf.extend(0_u32.to_be_bytes());
    put_name(&mut buf, "lat");
    buf.extend((NETCDF_LAT.len() as u32).to_be_bytes());

    put_text_attrs(&mut buf, global);

    buf.extend(0x0B_u32.to_be_bytes());
    buf.extend(3_u32.to_be_bytes());
    let variables: [(&str, &[u32], &[(&str, &str)], u32, u32); 3] = [
        ("lat", &[1], &[("units", "degrees_north")], 32, lat_begin),
        (
            "time",
            &[0],
            &[("units", "days since 2000-01-01")],
            8,
            records_begin,
        ),
        ("tas", &[0, 1], &[("units", "K")], 32, records_begin + 8),
    ];
    for (name, dimids, attrs, vsize, begin) in variables {
        put_name(&mut buf, name);
        buf.extend((dimids.len() as u32).to_be_bytes());
        for d in dimids {
            buf.extend(d.to_be_bytes());
        }
        put_text_attrs(&mut buf, attrs);
        buf.extend(6_u32.to_be_bytes());
        buf.extend(vsize.to_be_bytes());
        buf.extend(begin.to_be_bytes());
    }
    buf
}

/// Write a NetCDF-3 classic file with `time` as record dimension.
///
/// `tas[t][l] = offset + 10 * times[t] + l` over four latitudes.
pub(crate) fn write_netcdf3(path: &Path, times: &[f64], offset: f64) {
    write_netcdf3_with_attrs(path, times, offset, &[]);
}

/// As [write_netcdf3], with extra global text attributes after `title`.
pub(crate) fn write_netcdf3_with_attrs(
    path: &Path,
    times: &[f64],
    offset: f64,
    attrs: &[(&str, &str)],
) {
    let mut global = vec![("title", "test file")];
    global.extend_from_slice(attrs);
    let header_len = netcdf3_header(times.len(), &global, 0, 0).len() as u32;
    let lat_begin = header_len;
    let records_begin = lat_begin + 32;
    let mut buf = netcdf3_header(times.len(), &global, lat_begin, records_begin);
    for lat in NETCDF_LAT {
        buf.extend(lat.to_be_bytes());
    }
    for t in times {
        buf.extend(t.to_be_bytes());
        for l in 0..NETCDF_LAT.len() {
            buf.extend((offset + 10.0 * t + l as f64).to_be_bytes());
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, buf).unwrap();
}

/// HDF5 stand-in that reads NetCDF-3 content from `.h5` files.
#[derive(Debug)]
pub(crate) struct FakeHdf5Driver;

impl Driver for FakeHdf5Driver {
    fn kind(&self) -> DriverKind {
        DriverKind::Hdf5
    }

    fn translate(&self, path: &Path) -> Result<RefSet, PadoccError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("h5") => Netcdf3Driver.translate(path),
            _ => Err(PadoccError::KerchunkDecode {
                reason: format!("{} is not an HDF5 file", path.display()),
            }),
        }
    }
}

/// CFA backend writing the file list as text.
#[derive(Debug)]
pub(crate) struct ListingCfa;

impl CfaBackend for ListingCfa {
    fn create(&self, files: &[String], path: &Path) -> Result<(), PadoccError> {
        fs::write(path, files.join("\n"))?;
        Ok(())
    }
}
