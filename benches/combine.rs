/// Benchmarks for combining single-file reference sets.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use padocc::combine::{combine, CombineKwargs};
use padocc::filehandlers::JsonMap;
use padocc::references::{chunk_key, RefSet, RefValue, ZArray};
use padocc::types::DType;

use serde_json::{json, Value};

const NLAT: usize = 64;
const LAT_CHUNK: usize = 8;

fn array(shape: Vec<usize>, chunks: Vec<usize>) -> ZArray {
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

fn dims(names: &[&str]) -> JsonMap {
    let mut attrs = JsonMap::new();
    attrs.insert("_ARRAY_DIMENSIONS".to_string(), json!(names));
    attrs
}

fn range(url: &str, offset: usize, length: usize) -> RefValue {
    RefValue::Range {
        url: url.to_string(),
        offset: offset as u64,
        length: length as u64,
    }
}

/// References of one file holding `ntime` steps of `tas(time, lat)`.
fn file_refs(url: &str, ntime: usize) -> RefSet {
    let mut refs = RefSet::new();
    refs.refs.insert(
        ".zgroup".to_string(),
        RefValue::Inline(json!({"zarr_format": 2}).to_string()),
    );
    refs.set_zattrs(None, &JsonMap::new()).unwrap();
    refs.set_zarray("time", &array(vec![ntime], vec![ntime])).unwrap();
    refs.set_zattrs(Some("time"), &dims(&["time"])).unwrap();
    refs.refs.insert(chunk_key("time", &[0]), range(url, 0, ntime * 8));
    refs.set_zarray("lat", &array(vec![NLAT], vec![NLAT])).unwrap();
    refs.set_zattrs(Some("lat"), &dims(&["lat"])).unwrap();
    refs.refs.insert(chunk_key("lat", &[0]), range(url, ntime * 8, NLAT * 8));
    refs.set_zarray("tas", &array(vec![ntime, NLAT], vec![ntime, LAT_CHUNK]))
        .unwrap();
    refs.set_zattrs(Some("tas"), &dims(&["time", "lat"])).unwrap();
    let chunk = ntime * LAT_CHUNK * 8;
    for j in 0..NLAT / LAT_CHUNK {
        refs.refs.insert(
            chunk_key("tas", &[0, j]),
            range(url, (ntime + NLAT) * 8 + j * chunk, chunk),
        );
    }
    refs
}

fn criterion_benchmark(c: &mut Criterion) {
    let kwargs = CombineKwargs {
        concat_dims: vec!["time".to_string()],
        identical_dims: vec!["lat".to_string()],
    };
    for nfiles in [10, 100, 1000] {
        let refsets: Vec<RefSet> = (0..nfiles)
            .map(|i| file_refs(&format!("/data/{:04}.nc", i), 12))
            .collect();
        let name = format!("combine({})", nfiles);
        c.bench_function(&name, |b| {
            b.iter(|| {
                combine(black_box(&refsets), &kwargs).unwrap();
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
