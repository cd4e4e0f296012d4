// Optimizer integration tests
//
// Whole-run behaviour through the public driver: determinism for a fixed
// seed on one thread, monotone best cost, clean termination on the
// evaluation budget, and multi-thread runs reaching the finish line.

mod common;

use std::sync::Arc;

use raster_rs::config::OptimizerConfig;
use raster_rs::emulator::EvalContext;
use raster_rs::optimizer::{AcceptanceMode, Optimizer};
use raster_rs::palette::Palette;
use raster_rs::program::generator;
use raster_rs::rng::XorShift;

fn small_context(threads: usize) -> EvalContext {
    let palette = Palette::grayscale();
    let mut pixels = Vec::new();
    for y in 0..8usize {
        for x in 0..160usize {
            let v = ((x / 20 + y) * 9 % 128) as u8;
            pixels.push(palette.color(v));
        }
    }
    let mut ctx = common::plain_context_for_pixels(pixels, 160, 8);
    ctx.thread_count = threads;
    ctx
}

fn run_once(cfg: &OptimizerConfig) -> (f64, u64, Vec<Vec<u8>>) {
    let ctx = small_context(cfg.threads);
    let mut rng = XorShift::new(cfg.initial_seed);
    let initial = generator::random_picture(&ctx.target, &mut rng);

    let mut opt = Optimizer::new(ctx, cfg.clone()).expect("config is valid");
    opt.run(initial);

    let snap = opt.snapshot();
    (snap.cost, snap.evaluations, snap.painted)
}

#[test]
fn run_terminates_at_max_evals() {
    let mut cfg = OptimizerConfig::default();
    cfg.max_evals = 300;
    cfg.initial_seed = 42;
    let (cost, evaluations, _) = run_once(&cfg);
    assert_eq!(evaluations, 300);
    assert!(cost.is_finite());
}

#[test]
fn single_thread_runs_are_deterministic() {
    let mut cfg = OptimizerConfig::default();
    cfg.max_evals = 400;
    cfg.initial_seed = 777;
    cfg.optimizer = AcceptanceMode::Dlas;

    let (cost_a, evals_a, painted_a) = run_once(&cfg);
    let (cost_b, evals_b, painted_b) = run_once(&cfg);
    assert_eq!(cost_a, cost_b);
    assert_eq!(evals_a, evals_b);
    assert_eq!(painted_a, painted_b);
}

#[test]
fn best_cost_only_improves() {
    let mut cfg = OptimizerConfig::default();
    cfg.max_evals = 500;
    cfg.initial_seed = 9;

    let ctx = small_context(1);
    let mut rng = XorShift::new(cfg.initial_seed);
    let initial = generator::random_picture(&ctx.target, &mut rng);

    let mut opt = Optimizer::new(ctx, cfg).expect("config is valid");

    // Baseline: the cost of the starting program itself.
    let mut probe_ctx = small_context(1);
    probe_ctx.thread_count = 1;
    let probe_cfg = OptimizerConfig::default();
    let shared = Arc::new(raster_rs::optimizer::SharedState::new(&probe_cfg, 8, 160));
    let mut probe = raster_rs::emulator::Evaluator::new(
        0,
        1,
        probe_cfg.cache_size,
        Arc::new(probe_ctx),
        shared,
    );
    let mut initial_copy = initial.clone();
    let baseline = probe.execute(&mut initial_copy);

    opt.run(initial);
    let snap = opt.snapshot();
    assert!(snap.cost <= baseline);
    assert!(snap.last_best_evaluation <= snap.evaluations);
}

#[test]
fn lahc_mode_also_converges() {
    let mut cfg = OptimizerConfig::default();
    cfg.max_evals = 400;
    cfg.initial_seed = 5;
    cfg.optimizer = AcceptanceMode::Lahc;
    cfg.solutions = 8;

    let (cost, evaluations, _) = run_once(&cfg);
    assert_eq!(evaluations, 400);
    assert!(cost.is_finite());
}

#[test]
fn multi_thread_run_reaches_finish() {
    let mut cfg = OptimizerConfig::default();
    cfg.threads = 3;
    cfg.max_evals = 600;
    cfg.initial_seed = 21;

    let (cost, evaluations, _) = run_once(&cfg);
    // Workers race on the last slot, so the counter can overshoot by at
    // most the number of in-flight evaluations.
    assert!(evaluations >= 600);
    assert!(evaluations < 600 + cfg.threads as u64);
    assert!(cost.is_finite());
}

#[test]
fn autosave_period_raises_updates() {
    use raster_rs::optimizer::Update;
    use std::time::Duration;

    let mut cfg = OptimizerConfig::default();
    cfg.max_evals = 300;
    cfg.save_period = 100;
    cfg.initial_seed = 3;

    let ctx = small_context(1);
    let mut rng = XorShift::new(cfg.initial_seed);
    let initial = generator::random_picture(&ctx.target, &mut rng);

    let mut opt = Optimizer::new(ctx, cfg).expect("config is valid");
    opt.start(initial);

    let mut saw_autosave = false;
    loop {
        match opt.wait_update(Duration::from_secs(10)) {
            Update::Autosave => saw_autosave = true,
            Update::Finished => break,
            _ => {}
        }
    }
    opt.join();
    assert!(saw_autosave);
}

#[test]
fn mutation_stats_accumulate_on_improvements() {
    let mut cfg = OptimizerConfig::default();
    cfg.max_evals = 500;
    cfg.initial_seed = 11;

    let ctx = small_context(1);
    let initial = generator::empty_picture(8);
    let mut opt = Optimizer::new(ctx, cfg).expect("config is valid");
    opt.run(initial);

    let snap = opt.snapshot();
    // From an empty start something always improves early on.
    let total: u64 = snap.mutation_stats.iter().sum();
    assert!(total > 0);
}
