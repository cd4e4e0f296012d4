// Raster optimizer library
// Core library for converting raster images into display-list register
// programs for the Atari 8-bit playfield engine.

// Public modules
pub mod arena;
pub mod cache;
pub mod config;
pub mod dual;
pub mod emulator;
pub mod mutation;
pub mod optimizer;
pub mod output;
pub mod palette;
pub mod program;
pub mod rng;
pub mod stats;
pub mod target;

// Re-export main types for convenience
pub use config::{ConfigError, DualInit, InitMode, OptimizerConfig};
pub use dual::{DualOptimizer, DualPhase, DualTables};
pub use emulator::{EvalContext, Evaluator};
pub use mutation::{MutationKind, MUTATION_COUNT};
pub use optimizer::{
    AcceptanceMode, AcceptanceState, BestSnapshot, Optimizer, Outcome, SharedState, Update,
};
pub use palette::{DistanceMetric, Palette, Rgb};
pub use program::{
    generator, Instruction, Opcode, RasterLine, RasterPicture, RegisterState, Target, FREE_CYCLES,
};
pub use stats::{normalize_score, StatPoint};
pub use target::{OnOffMap, TargetImage, MAX_HEIGHT, SCREEN_WIDTH};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_components() {
        // Test that the core building blocks can be instantiated
        let _palette = Palette::grayscale();
        let _picture = RasterPicture::new(4);
        let _line = RasterLine::new();
        let _arena = arena::Arena::new();
        let _rng = rng::XorShift::new(1);
        let _config = OptimizerConfig::default();
    }
}
