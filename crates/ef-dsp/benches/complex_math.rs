//! Benchmarks for the complex-vector kernels
//!
//! These are the per-block hot loops of the partitioned convolution paths;
//! run with `cargo bench -p ef-dsp`.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ef_dsp::complex::{
    complex_mul, complex_mul_accum, complex_mul_accum_scalar, complex_mul_scalar,
    planar_complex_mul_accum, planar_mac_scalar,
};

fn make_ri(pairs: usize, seed: f32) -> Vec<f32> {
    (0..2 * pairs).map(|i| ((i as f32) * 0.13 + seed).sin()).collect()
}

fn bench_complex_mul(c: &mut Criterion) {
    let a = make_ri(1024, 0.1);
    let b = make_ri(1024, 1.3);
    let mut out = vec![0.0f32; 2048];

    c.bench_function("complex_mul_dispatch_1024", |bench| {
        bench.iter(|| complex_mul(black_box(&a), black_box(&b), black_box(&mut out)))
    });

    c.bench_function("complex_mul_scalar_1024", |bench| {
        bench.iter(|| complex_mul_scalar(black_box(&a), black_box(&b), black_box(&mut out)))
    });
}

fn bench_complex_mac(c: &mut Criterion) {
    let a = make_ri(1024, 0.7);
    let b = make_ri(1024, 2.1);
    let mut acc = make_ri(1024, 4.4);

    c.bench_function("complex_mac_dispatch_1024", |bench| {
        bench.iter(|| complex_mul_accum(black_box(&a), black_box(&b), black_box(&mut acc)))
    });

    c.bench_function("complex_mac_scalar_1024", |bench| {
        bench.iter(|| complex_mul_accum_scalar(black_box(&a), black_box(&b), black_box(&mut acc)))
    });
}

fn bench_planar_mac(c: &mut Criterion) {
    let n = 1025; // half-spectrum of a 2048 FFT
    let a_re: Vec<f32> = (0..n).map(|i| (i as f32 * 0.11).cos()).collect();
    let a_im: Vec<f32> = (0..n).map(|i| (i as f32 * 0.23).sin()).collect();
    let b_re: Vec<f32> = (0..n).map(|i| (i as f32 * 0.31).cos()).collect();
    let b_im: Vec<f32> = (0..n).map(|i| (i as f32 * 0.41).sin()).collect();
    let mut acc_re = vec![0.0f32; n];
    let mut acc_im = vec![0.0f32; n];

    c.bench_function("planar_mac_dispatch_1025", |bench| {
        bench.iter(|| {
            planar_complex_mul_accum(
                black_box(&a_re),
                black_box(&a_im),
                black_box(&b_re),
                black_box(&b_im),
                black_box(&mut acc_re),
                black_box(&mut acc_im),
            )
        })
    });

    c.bench_function("planar_mac_scalar_1025", |bench| {
        bench.iter(|| {
            planar_mac_scalar(
                black_box(&a_re),
                black_box(&a_im),
                black_box(&b_re),
                black_box(&b_im),
                black_box(&mut acc_re),
                black_box(&mut acc_im),
            )
        })
    });
}

criterion_group!(benches, bench_complex_mul, bench_complex_mac, bench_planar_mac);
criterion_main!(benches);
