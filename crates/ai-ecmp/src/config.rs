//! Controller tunables.
//!
//! One [`ControllerParams`] value is handed to the manager at construction
//! and copied into every instance it creates. Per-instance overrides (the
//! diagnostic surface can retune the search) mutate the instance's copy.

use serde::{Deserialize, Serialize};

/// Tunables governing one split-group controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerParams {
    /// Counter snapshots required before the stability gate can pass.
    pub history_window: usize,
    /// Retained counter snapshots; older ones are dropped.
    pub history_cap: usize,
    /// Mean coefficient of variation above which traffic counts as
    /// transient and optimisation holds.
    pub variance_threshold: f64,
    /// Average-gap level below which the group counts as balanced.
    pub balance_threshold: f64,
    /// Minimum improvement (percent of total gap) for a re-shuffle to be
    /// worth installing.
    pub min_improvement_percent: f64,
    /// Consecutive failed adjustments before expansion is considered.
    pub max_consecutive_failures: u32,
    /// Cycles after an expansion during which further expansion is
    /// suppressed in favour of the search.
    pub cycles_after_expansion: u32,
    /// Local-search iteration bound.
    pub max_iterations: u32,
    /// Flat cost charged against every candidate swap.
    pub exchange_cost_factor: f64,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            history_window: 5,
            history_cap: 10,
            variance_threshold: 0.05,
            balance_threshold: 0.05,
            min_improvement_percent: 1.0,
            max_consecutive_failures: 2,
            cycles_after_expansion: 3,
            max_iterations: 10_000,
            exchange_cost_factor: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_controller_constants() {
        let p = ControllerParams::default();
        assert_eq!(p.history_window, 5);
        assert_eq!(p.history_cap, 10);
        assert!((p.variance_threshold - 0.05).abs() < f64::EPSILON);
        assert!((p.balance_threshold - 0.05).abs() < f64::EPSILON);
        assert!((p.min_improvement_percent - 1.0).abs() < f64::EPSILON);
        assert_eq!(p.max_consecutive_failures, 2);
        assert_eq!(p.cycles_after_expansion, 3);
        assert_eq!(p.max_iterations, 10_000);
        assert!((p.exchange_cost_factor - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let p: ControllerParams =
            serde_json::from_str(r#"{"max_iterations": 500}"#).expect("deserialize");
        assert_eq!(p.max_iterations, 500);
        assert_eq!(p.history_window, 5);
    }
}
