// Common test utilities for the integration test suites
//
// This module provides shared helpers for building evaluation contexts,
// evaluators and literal raster programs across the test suites.

#![allow(dead_code)]

use std::sync::Arc;

use raster_rs::config::OptimizerConfig;
use raster_rs::emulator::{EvalContext, Evaluator};
use raster_rs::optimizer::SharedState;
use raster_rs::palette::{DistanceMetric, Palette, Rgb};
use raster_rs::program::{Instruction, Opcode, RasterLine, Target};
use raster_rs::target::TargetImage;

/// Build an evaluation context around explicit pixel data.
pub fn context_for_pixels(pixels: Vec<Rgb>, width: usize, height: usize) -> Arc<EvalContext> {
    Arc::new(plain_context_for_pixels(pixels, width, height))
}

/// Same as [`context_for_pixels`] without the `Arc`, for callers that
/// still want to adjust fields.
pub fn plain_context_for_pixels(pixels: Vec<Rgb>, width: usize, height: usize) -> EvalContext {
    let palette = Palette::grayscale();
    let target = TargetImage::new(width, height, pixels, &palette, DistanceMetric::Euclidean);
    EvalContext {
        target,
        palette,
        onoff: None,
        thread_count: 1,
        unstuck_after: 0,
    }
}

/// Context over a uniform single-colour target.
pub fn uniform_context(color: Rgb, width: usize, height: usize) -> Arc<EvalContext> {
    context_for_pixels(vec![color; width * height], width, height)
}

/// Stand-alone evaluator over `ctx` with a fixed seed.
pub fn evaluator_for(ctx: &Arc<EvalContext>) -> Evaluator {
    let cfg = OptimizerConfig::default();
    let shared = Arc::new(SharedState::new(
        &cfg,
        ctx.target.height(),
        ctx.target.width(),
    ));
    Evaluator::new(0, 1234, cfg.cache_size, Arc::clone(ctx), shared)
}

/// Build a hashed raster line from (opcode, value, target) triples.
pub fn line_of(insns: &[(Opcode, u8, Target)]) -> RasterLine {
    let mut line = RasterLine::new();
    for &(op, v, t) in insns {
        line.push(Instruction::new(op, v, t));
    }
    line.rehash();
    line
}
