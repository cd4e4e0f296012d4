// Emulator Benchmarks
// Performance benchmarks for whole-frame candidate evaluation

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;

use raster_rs::config::OptimizerConfig;
use raster_rs::emulator::{EvalContext, Evaluator};
use raster_rs::optimizer::SharedState;
use raster_rs::palette::{DistanceMetric, Palette};
use raster_rs::program::generator;
use raster_rs::rng::XorShift;
use raster_rs::target::TargetImage;

/// Helper to build a full-size evaluation context with a varied target
fn create_context(height: usize) -> Arc<EvalContext> {
    let palette = Palette::grayscale();
    let mut pixels = Vec::with_capacity(160 * height);
    for y in 0..height {
        for x in 0..160 {
            pixels.push(palette.color(((x * 7 + y * 13) % 128) as u8));
        }
    }
    let target = TargetImage::new(160, height, pixels, &palette, DistanceMetric::Yuv);
    Arc::new(EvalContext {
        target,
        palette,
        onoff: None,
        thread_count: 1,
        unstuck_after: 0,
    })
}

fn create_evaluator(ctx: &Arc<EvalContext>) -> Evaluator {
    let cfg = OptimizerConfig::default();
    let shared = Arc::new(SharedState::new(
        &cfg,
        ctx.target.height(),
        ctx.target.width(),
    ));
    Evaluator::new(0, 99, cfg.cache_size, Arc::clone(ctx), shared)
}

/// Benchmark a full-frame evaluation with cold and warm caches
fn bench_frame_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_evaluation");
    group.sample_size(20); // Full frames are slow; keep samples modest

    // Cold path: every line emulated from scratch
    group.bench_function("full_frame_240_cold", |b| {
        let ctx = create_context(240);
        let mut ev = create_evaluator(&ctx);
        let mut rng = XorShift::new(1);
        let pic = generator::random_picture(&ctx.target, &mut rng);

        b.iter(|| {
            ev.clear_all_caches();
            let mut candidate = pic.clone();
            black_box(ev.execute(&mut candidate));
        });
    });

    // Warm path: unchanged program, every line a cache hit
    group.bench_function("full_frame_240_cached", |b| {
        let ctx = create_context(240);
        let mut ev = create_evaluator(&ctx);
        let mut rng = XorShift::new(1);
        let mut pic = generator::random_picture(&ctx.target, &mut rng);
        ev.execute(&mut pic);

        b.iter(|| {
            black_box(ev.execute(&mut pic));
        });
    });

    group.finish();
}

/// Benchmark the mutate-evaluate cycle the workers run
fn bench_mutate_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutate_evaluate");
    group.sample_size(30);

    group.bench_function("mutated_frame_240", |b| {
        let ctx = create_context(240);
        let mut ev = create_evaluator(&ctx);
        let mut rng = XorShift::new(2);
        let mut base = generator::random_picture(&ctx.target, &mut rng);
        ev.execute(&mut base);

        b.iter(|| {
            let mut candidate = base.clone();
            ev.mutate_program(&mut candidate);
            black_box(ev.execute(&mut candidate));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_frame_evaluation, bench_mutate_evaluate);
criterion_main!(benches);
