// Optimizer Benchmarks
// Performance benchmarks for acceptance decisions and short search runs

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use raster_rs::config::OptimizerConfig;
use raster_rs::optimizer::{AcceptanceMode, AcceptanceState, Optimizer};
use raster_rs::palette::{DistanceMetric, Palette};
use raster_rs::program::generator;
use raster_rs::rng::XorShift;
use raster_rs::target::TargetImage;

/// Benchmark the acceptance core under both rules
fn bench_acceptance(c: &mut Criterion) {
    let mut group = c.benchmark_group("acceptance");

    for (name, mode) in [("dlas", AcceptanceMode::Dlas), ("lahc", AcceptanceMode::Lahc)] {
        group.bench_function(name, |b| {
            let mut state = AcceptanceState::new(mode, 64, 0, 0.0, 1.0);
            state.seed(1000.0);
            let mut rng = XorShift::new(7);
            let mut best = 1000.0;
            b.iter(|| {
                let result = 500.0 + (rng.rand(100_000) as f64) / 100.0;
                let out = state.apply(result, 0, 0, best);
                if out.improved {
                    best = result;
                }
                black_box(out)
            });
        });
    }

    group.finish();
}

/// Benchmark a short end-to-end search on a small target
fn bench_short_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("short_run");
    group.sample_size(10); // Each iteration is a whole 2000-evaluation run

    group.bench_function("run_2000_evals_8_lines", |b| {
        let palette = Palette::grayscale();
        let mut pixels = Vec::new();
        for y in 0..8usize {
            for x in 0..160usize {
                pixels.push(palette.color(((x + y * 11) % 128) as u8));
            }
        }

        b.iter(|| {
            let target = TargetImage::new(
                160,
                8,
                pixels.clone(),
                &palette,
                DistanceMetric::Euclidean,
            );
            let ctx = raster_rs::emulator::EvalContext {
                target,
                palette: palette.clone(),
                onoff: None,
                thread_count: 1,
                unstuck_after: 0,
            };
            let mut cfg = OptimizerConfig::default();
            cfg.max_evals = 2000;
            cfg.initial_seed = 17;

            let mut rng = XorShift::new(cfg.initial_seed);
            let initial = generator::random_picture(&ctx.target, &mut rng);
            let mut opt = Optimizer::new(ctx, cfg).expect("valid config");
            opt.run(initial);
            black_box(opt.snapshot().cost)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_acceptance, bench_short_run);
criterion_main!(benches);
