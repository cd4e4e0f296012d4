// Dual-frame integration tests
//
// Blended-objective behaviour through the public dual driver: the phase
// machine reaches alternation, frame B starts as a copy of A when
// configured so, and the blended pair tables prefer genuine mixes.

mod common;

use std::time::Duration;

use raster_rs::config::{DualInit, OptimizerConfig};
use raster_rs::dual::{DualOptimizer, DualPhase, DualTables};
use raster_rs::optimizer::Update;
use raster_rs::palette::{Palette, Rgb};
use raster_rs::program::generator;
use raster_rs::rng::XorShift;

fn dual_config(max_evals: u64) -> OptimizerConfig {
    let mut cfg = OptimizerConfig::default();
    cfg.dual_mode = true;
    cfg.max_evals = max_evals;
    cfg.first_dual_steps = 50;
    cfg.altering_dual_steps = 20;
    cfg.initial_seed = 13;
    cfg
}

#[test]
fn grey_target_prefers_a_black_white_pair() {
    // One mid-grey pixel, no flicker penalty: blending black and white
    // must beat either pure pair.
    let tables = DualTables::new(
        &Palette::grayscale(),
        &[Rgb::new(127, 127, 127)],
        1.0,
        1.0,
    );
    let mixed = tables.pixel_distance(0, 127, 0);
    assert!(mixed < tables.pixel_distance(0, 0, 0));
    assert!(mixed < tables.pixel_distance(127, 127, 0));
}

#[test]
fn dual_run_reaches_alternating_phase_and_finishes() {
    let cfg = dual_config(400);
    let ctx = common::plain_context_for_pixels(
        vec![Rgb::new(100, 100, 100); 160 * 4],
        160,
        4,
    );
    let mut rng = XorShift::new(cfg.initial_seed);
    let initial = generator::random_picture(&ctx.target, &mut rng);

    let mut opt = DualOptimizer::new(ctx, cfg).expect("config is valid");
    opt.start(initial);
    loop {
        if opt.wait_update(Duration::from_secs(30)) == Update::Finished {
            break;
        }
    }
    opt.join();

    assert_eq!(opt.phase(), DualPhase::Alternating);
    let snap = opt.snapshot();
    assert!(snap.evaluations >= 400);
    assert!(snap.cost.is_finite());
    // Both frames exist and have painted rows of the right shape.
    let (pic_b, painted_b, _, _) = opt.snapshot_b().expect("dual state present");
    assert_eq!(pic_b.height(), 4);
    assert_eq!(painted_b.len(), 4);
    assert_eq!(painted_b[0].len(), 160);
}

#[test]
fn copy_mode_starts_frame_b_as_frame_a() {
    // With a zero-length bootstrap, frame A's best is exactly the initial
    // program when B is copied from it, and no alternating improvement
    // can touch B's program before the first focus flip. B must therefore
    // come out byte-identical to the initial program.
    let mut cfg = dual_config(1);
    cfg.after_dual_steps = DualInit::Copy;
    cfg.first_dual_steps = 0;

    let ctx = common::plain_context_for_pixels(
        vec![Rgb::new(60, 60, 60); 160 * 2],
        160,
        2,
    );
    let mut rng = XorShift::new(cfg.initial_seed);
    let initial = generator::random_picture(&ctx.target, &mut rng);
    let reference = initial.clone();

    let mut opt = DualOptimizer::new(ctx, cfg).expect("config is valid");
    opt.start(initial);
    loop {
        if opt.wait_update(Duration::from_secs(30)) == Update::Finished {
            break;
        }
    }
    opt.join();

    let (pic_b, _, _, _) = opt.snapshot_b().expect("dual state present");
    assert_eq!(reference.height(), pic_b.height());
    for (a, b) in reference.lines.iter().zip(pic_b.lines.iter()) {
        assert_eq!(a.instructions, b.instructions);
    }
    assert_eq!(reference.reg_init, pic_b.reg_init);
}

#[test]
fn blended_preview_has_target_shape() {
    let cfg = dual_config(100);
    let ctx = common::plain_context_for_pixels(
        vec![Rgb::new(10, 200, 40); 160 * 3],
        160,
        3,
    );
    let mut rng = XorShift::new(cfg.initial_seed);
    let initial = generator::random_picture(&ctx.target, &mut rng);

    let mut opt = DualOptimizer::new(ctx, cfg).expect("config is valid");
    opt.run(initial);

    let preview = opt.blended_preview();
    assert_eq!(preview.len(), 3);
    assert!(preview.iter().all(|row| row.len() == 160));
}

#[test]
fn flicker_tolerance_loosens_the_penalty() {
    let target = [Rgb::new(127, 127, 127)];
    let strict = DualTables::new(&Palette::grayscale(), &target, 0.0, 0.0);
    let loose = DualTables::new(&Palette::grayscale(), &target, 1.0, 1.0);
    // The strict tables punish a black/white mix harder.
    assert!(strict.pixel_distance(0, 127, 0) > loose.pixel_distance(0, 127, 0));
}
