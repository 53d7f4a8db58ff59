/// Benchmarks for packing projects into job allocations.
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use padocc::allocate::{bin_size, compute_estimate, first_fit_decreasing};

fn criterion_benchmark(c: &mut Criterion) {
    for nprojects in [100, 1000, 10000] {
        let estimates: Vec<(String, f64)> = (0..nprojects)
            .map(|i| {
                let convert = (i % 17) as f64 * 0.5;
                let files = (i % 250 + 1) as f64;
                (format!("proj_{}", i), compute_estimate(convert, files))
            })
            .collect();
        let max = estimates.iter().map(|(_, e)| *e).fold(0.0, f64::max);
        let size = bin_size(max);
        let name = format!("first_fit_decreasing({})", nprojects);
        c.bench_function(&name, |b| {
            b.iter(|| {
                first_fit_decreasing(black_box(&estimates), size);
            })
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
