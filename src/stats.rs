// Statistics module - periodic samples of optimisation progress

use serde::{Deserialize, Serialize};

use crate::palette::MAX_COLOR_DISTANCE;

/// Evaluations between statistics samples.
pub const STATISTICS_PERIOD: u64 = 10_000;

/// One progress sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatPoint {
    /// Total evaluations at sample time.
    pub evaluations: u64,
    /// Seconds since the optimiser started.
    pub seconds: u64,
    /// Accepted cost at sample time (raw, unnormalised).
    pub distance: f64,
}

/// Progress samples in chronological order.
pub type StatisticsList = Vec<StatPoint>;

/// Scale a raw accumulated distance to a per-pixel score that is
/// comparable across image sizes.
pub fn normalize_score(raw: f64, width: usize, height: usize) -> f64 {
    raw / ((width as f64) * (height as f64) * (MAX_COLOR_DISTANCE / 10_000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_score_scales_with_area() {
        let raw = 1000.0;
        let small = normalize_score(raw, 10, 10);
        let large = normalize_score(raw, 20, 20);
        assert!(small > large);
        assert!((small / large - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_zero() {
        assert_eq!(normalize_score(0.0, 160, 240), 0.0);
    }
}
