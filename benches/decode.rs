/// Benchmarks for decoding chunk data: decompression and the byte shuffle filter.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use padocc::compression::{self, Compression};
use padocc::filters::shuffle;

use bytes::Bytes;

fn criterion_benchmark(c: &mut Criterion) {
    let compression_algs = [
        (Compression::Gzip { level: 1 }, "gzip"),
        (Compression::Zlib { level: 1 }, "zlib"),
    ];
    for (compression, name) in compression_algs {
        for size_k in [64, 256, 1024] {
            let size = size_k * 1024;
            let data: Vec<u8> = (0_u32..size)
                .map(|i| u8::try_from(i % 256).unwrap())
                .collect::<Vec<u8>>();
            let compressed = compression::compress(&compression, &data).unwrap();
            let name = format!("decompress({}, {})", name, size);
            c.bench_function(&name, |b| {
                b.iter(|| {
                    compression::decompress(&compression, black_box(&compressed)).unwrap();
                })
            });
        }
    }

    for size_k in [64, 256, 1024] {
        let size = size_k * 1024;
        let data: Bytes = (0_u32..size)
            .map(|i| u8::try_from(i % 256).unwrap())
            .collect::<Vec<u8>>()
            .into();
        for element_size in [2, 4, 8] {
            let name = format!("deshuffle({}, {})", size, element_size);
            c.bench_function(&name, |b| {
                b.iter(|| {
                    shuffle::deshuffle(black_box(&data), element_size);
                })
            });
        }
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
