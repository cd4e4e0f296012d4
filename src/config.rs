// Configuration management
//
// Handles optimiser configuration and settings persistence. All options
// are TOML-serialisable so a run can be reproduced from a saved file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::optimizer::acceptance::AcceptanceMode;
use crate::palette::DistanceMetric;

/// Smallest permitted per-worker cache budget; anything lower thrashes.
pub const MIN_CACHE_BYTES: usize = 1024 * 1024;

/// Default per-worker cache budget (16 MiB).
pub const DEFAULT_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Initial raster picture construction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    /// Random colours and sprite positions sampled from the target.
    Random,
    /// One NOP per line, all registers zero.
    Empty,
    /// Empty program with initial registers set to the target's dominant
    /// colours.
    Less,
}

impl InitMode {
    pub fn from_name(name: &str) -> Option<InitMode> {
        match name.to_ascii_lowercase().as_str() {
            "random" => Some(InitMode::Random),
            "empty" => Some(InitMode::Empty),
            "less" => Some(InitMode::Less),
            _ => None,
        }
    }
}

/// How frame B is prepared after frame A's bootstrap in dual mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DualInit {
    /// Copy A's best program into B.
    Copy,
    /// Random-initialise B and bootstrap it alone.
    Fresh,
}

impl DualInit {
    pub fn from_name(name: &str) -> Option<DualInit> {
        match name.to_ascii_lowercase().as_str() {
            "copy" | "dup" => Some(DualInit::Copy),
            "fresh" | "random" => Some(DualInit::Fresh),
            _ => None,
        }
    }
}

/// Optimiser configuration
///
/// Stores all user-configurable settings for a conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Worker thread count
    pub threads: usize,

    /// Stop after this many evaluations
    pub max_evals: u64,

    /// Autosave period in evaluations; -1 selects time-based saving
    pub save_period: i64,

    /// Base RNG seed; workers derive distinct streams from it
    pub initial_seed: u64,

    /// Per-worker cache budget in bytes
    pub cache_size: usize,

    /// Acceptance rule
    pub optimizer: AcceptanceMode,

    /// Acceptance history length
    pub solutions: usize,

    /// Plateau length before drift starts; 0 disables
    pub unstuck_after: u64,

    /// Normalised drift added per evaluation past the plateau threshold
    pub unstuck_drift_norm: f64,

    /// Optimise two blended frames instead of one
    pub dual_mode: bool,

    /// Evaluations spent bootstrapping each frame alone (global count)
    pub first_dual_steps: u64,

    /// Evaluations between focus flips in the alternating phase
    pub altering_dual_steps: u64,

    /// How frame B starts after A's bootstrap
    pub after_dual_steps: DualInit,

    /// Accepted luma flicker, 0 (none) to 1 (unlimited)
    pub flicker_luma_tol: f64,

    /// Accepted chroma flicker, 0 (none) to 1 (unlimited)
    pub flicker_chroma_tol: f64,

    /// Colour distance metric
    pub distance: DistanceMetric,

    /// Initial picture construction
    pub init: InitMode,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            threads: 1,
            max_evals: 1_000_000_000_000_000_000,
            save_period: -1,
            initial_seed: 1,
            cache_size: DEFAULT_CACHE_BYTES,
            optimizer: AcceptanceMode::Dlas,
            solutions: 1,
            unstuck_after: 0,
            unstuck_drift_norm: 0.0,
            dual_mode: false,
            first_dual_steps: 50_000,
            altering_dual_steps: 5_000,
            after_dual_steps: DualInit::Copy,
            flicker_luma_tol: 0.0,
            flicker_chroma_tol: 0.0,
            distance: DistanceMetric::Yuv,
            init: InitMode::Random,
        }
    }
}

/// Errors that keep the optimiser from starting.
#[derive(Debug)]
pub enum ConfigError {
    /// Worker count of zero
    NoThreads,

    /// Acceptance history length below 1
    HistoryLength(usize),

    /// Cache budget below the sane floor
    CacheBudget(usize),

    /// Target height outside 1..=240
    BadHeight(usize),

    /// Target width of zero
    BadWidth,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoThreads => write!(f, "thread count must be at least 1"),
            ConfigError::HistoryLength(n) => {
                write!(f, "acceptance history length must be at least 1, got {}", n)
            }
            ConfigError::CacheBudget(n) => write!(
                f,
                "cache budget of {} bytes is below the {} byte minimum",
                n, MIN_CACHE_BYTES
            ),
            ConfigError::BadHeight(h) => {
                write!(f, "target height {} is outside 1..=240", h)
            }
            ConfigError::BadWidth => write!(f, "target width must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl OptimizerConfig {
    /// Check option ranges; the optimiser refuses to start otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads < 1 {
            return Err(ConfigError::NoThreads);
        }
        if self.solutions < 1 {
            return Err(ConfigError::HistoryLength(self.solutions));
        }
        if self.cache_size < MIN_CACHE_BYTES {
            return Err(ConfigError::CacheBudget(self.cache_size));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, io::Error> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), io::Error> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = OptimizerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.threads, 1);
        assert_eq!(config.solutions, 1);
        assert_eq!(config.cache_size, DEFAULT_CACHE_BYTES);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = OptimizerConfig::default();
        config.threads = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NoThreads)));

        let mut config = OptimizerConfig::default();
        config.solutions = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HistoryLength(0))
        ));

        let mut config = OptimizerConfig::default();
        config.cache_size = 1024;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CacheBudget(1024))
        ));
    }

    #[test]
    fn test_config_toml_round_trip() {
        let mut config = OptimizerConfig::default();
        config.threads = 8;
        config.optimizer = AcceptanceMode::Lahc;
        config.dual_mode = true;
        config.after_dual_steps = DualInit::Fresh;

        let text = toml::to_string(&config).expect("serialize");
        let back: OptimizerConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(back.threads, 8);
        assert_eq!(back.optimizer, AcceptanceMode::Lahc);
        assert!(back.dual_mode);
        assert_eq!(back.after_dual_steps, DualInit::Fresh);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let back: OptimizerConfig = toml::from_str("threads = 4\n").expect("deserialize");
        assert_eq!(back.threads, 4);
        assert_eq!(back.solutions, 1);
        assert_eq!(back.optimizer, AcceptanceMode::Dlas);
    }
}
