// Acceptance core - LAHC, DLAS and the legacy acceptance rule
//
// All three modes compare a candidate's cost against a short history of
// past costs rather than only the current one, which lets the walk cross
// shallow barriers. The optional plateau drift relaxes every comparison
// linearly with the time since the last improvement, so a long flat
// stretch eventually lets slightly worse candidates through.

use serde::{Deserialize, Serialize};

/// Acceptance rule selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcceptanceMode {
    /// Diversified Late Acceptance Search.
    Dlas,
    /// Late Acceptance Hill Climbing.
    Lahc,
    /// Strict historical comparison; kept for old run compatibility.
    LegacyLahc,
}

impl AcceptanceMode {
    pub fn from_name(name: &str) -> Option<AcceptanceMode> {
        match name.to_ascii_lowercase().as_str() {
            "dlas" => Some(AcceptanceMode::Dlas),
            "lahc" => Some(AcceptanceMode::Lahc),
            "legacy" | "legacy-lahc" => Some(AcceptanceMode::LegacyLahc),
            _ => None,
        }
    }
}

/// Result of one acceptance decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// The candidate becomes the walk's current solution.
    pub accepted: bool,
    /// The candidate beats the best cost ever seen.
    pub improved: bool,
}

/// Acceptance bookkeeping: cost history ring, DLAS max tracking and the
/// plateau-drift parameters. Lives under the global lock.
#[derive(Debug, Clone)]
pub struct AcceptanceState {
    pub mode: AcceptanceMode,
    history_len: usize,
    pub history: Vec<f64>,
    pub index: usize,
    /// DLAS maximum-cost threshold over the history.
    pub cost_max: f64,
    /// Count of history entries equal to `cost_max`.
    pub n: i64,
    /// Cost of the currently accepted solution.
    pub current_cost: f64,

    unstuck_after: u64,
    unstuck_drift_norm: f64,
    /// Raw-cost units per unit of normalised drift.
    drift_scale: f64,
    /// Last drift applied, in normalised units (observability).
    pub current_norm_drift: f64,
}

impl AcceptanceState {
    pub fn new(
        mode: AcceptanceMode,
        history_len: usize,
        unstuck_after: u64,
        unstuck_drift_norm: f64,
        drift_scale: f64,
    ) -> AcceptanceState {
        AcceptanceState {
            mode,
            history_len: history_len.max(1),
            history: Vec::new(),
            index: 0,
            cost_max: f64::MAX,
            n: 0,
            current_cost: f64::MAX,
            unstuck_after,
            unstuck_drift_norm,
            drift_scale,
            current_norm_drift: 0.0,
        }
    }

    /// History filled and counters coherent?
    pub fn is_seeded(&self) -> bool {
        !self.history.is_empty()
    }

    /// Reset the walk to a uniform history at `cost`. Used at start-up
    /// and whenever the objective changes scale.
    pub fn seed(&mut self, cost: f64) {
        self.history.clear();
        self.history.resize(self.history_len, cost);
        self.index = 0;
        self.cost_max = cost;
        self.n = self.history_len as i64;
        self.current_cost = cost;
        self.current_norm_drift = 0.0;
    }

    fn recompute_max(&mut self) {
        self.cost_max = self.history.iter().cloned().fold(f64::MIN, f64::max);
        self.n = self.history.iter().filter(|&&v| v == self.cost_max).count() as i64;
    }

    /// Decide on one candidate cost. `evaluations` and `last_best` drive
    /// the plateau drift; `best_cost` defines improvement.
    pub fn apply(
        &mut self,
        result: f64,
        evaluations: u64,
        last_best: u64,
        best_cost: f64,
    ) -> Outcome {
        // Plateau drift: relax every acceptance comparison linearly once
        // the plateau passes the configured length. The history itself is
        // never drifted.
        let mut drift = 0.0;
        if self.unstuck_drift_norm > 0.0 && self.unstuck_after > 0 {
            if evaluations > last_best {
                let plateau = evaluations - last_best;
                if plateau >= self.unstuck_after {
                    let steps = (plateau - self.unstuck_after + 1) as f64;
                    let norm = self.unstuck_drift_norm * steps;
                    drift = norm * self.drift_scale;
                    self.current_norm_drift = norm;
                }
            }
        } else {
            self.current_norm_drift = 0.0;
        }

        if self.history.is_empty() {
            self.seed(result);
        }

        let l = self.index;
        self.index += 1;
        if self.index == self.history.len() {
            self.index = 0;
        }
        let prev_cost = self.current_cost;

        let accepted = match self.mode {
            AcceptanceMode::Lahc => {
                let accept = result <= self.current_cost + drift
                    || result <= self.history[l] + drift;
                if accept {
                    self.current_cost = result;
                }
                // LAHC stores the previous baseline, not the candidate.
                self.history[l] = prev_cost;
                accept
            }
            AcceptanceMode::LegacyLahc => {
                let accept = result < self.history[l] + drift;
                if accept {
                    self.current_cost = result;
                    self.history[l] = result;
                }
                accept
            }
            AcceptanceMode::Dlas => {
                if result <= self.current_cost + drift || result < self.cost_max + drift {
                    self.current_cost = result;
                }
                let old_value = self.history[l];
                let f = self.current_cost;
                if f > old_value {
                    self.history[l] = f;
                    if f > self.cost_max {
                        self.cost_max = f;
                        self.n = 1;
                    } else if f == self.cost_max {
                        if old_value != self.cost_max {
                            self.n += 1;
                        }
                    } else if old_value == self.cost_max {
                        self.n -= 1;
                        if self.n <= 0 {
                            self.recompute_max();
                        }
                    }
                } else if f < old_value && f < prev_cost {
                    if old_value == self.cost_max {
                        self.n -= 1;
                    }
                    self.history[l] = f;
                    if self.n <= 0 {
                        self.recompute_max();
                    }
                }
                self.current_cost == result
            }
        };

        Outcome {
            accepted,
            improved: result < best_cost,
        }
    }
}
