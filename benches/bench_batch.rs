use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dhpolar::polar::numerics::restricted_biorthogonalize;
use dhpolar::utilities::{calc_batch_size, gen_batch};
use ndarray::{ArrayD, IxDyn};

fn bench_planner(c: &mut Criterion) {
    c.bench_function("gen_batch 1e6 by 1024", |b| {
        b.iter(|| gen_batch(0, black_box(1_000_000), 1024).unwrap())
    });
    c.bench_function("calc_batch_size", |b| {
        b.iter(|| calc_batch_size::<f64>(black_box(15_600), Some(2048.0), None, Some(100_000)))
    });
}

fn bench_biorthogonalize(c: &mut Criterion) {
    let n: usize = 24;
    let data: Vec<f64> = (0..8 * n * n).map(|i| (i % 97) as f64 * 0.01 - 0.5).collect();
    let t = ArrayD::from_shape_vec(IxDyn(&[8, n, n]), data).unwrap();
    c.bench_function("biorthogonalize serial", |b| {
        b.iter(|| restricted_biorthogonalize(black_box(t.view()), 0.27, 1.0, 1.0, false))
    });
    c.bench_function("biorthogonalize rayon", |b| {
        b.iter(|| restricted_biorthogonalize(black_box(t.view()), 0.27, 1.0, 1.0, true))
    });
}

criterion_group!(benches, bench_planner, bench_biorthogonalize);
criterion_main!(benches);
