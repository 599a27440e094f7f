//! Optimisation strategies.
//!
//! The instance picks a strategy by value and calls [`run`]; there is no
//! object graph between the controller and its algorithm. Local search is
//! the default; the genetic variant is selectable through the diagnostic
//! surface.

pub mod genetic;
pub mod local_search;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ControllerParams;
use crate::types::Assignment;

pub use genetic::GeneticParams;
pub use local_search::LocalSearchParams;

/// Which optimiser an instance runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    LocalSearch,
    Genetic,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalSearch => "local_search",
            Self::Genetic => "genetic",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run the chosen optimiser over the current assignment.
///
/// Returns a (possibly identical) assignment with the same per-port slot
/// counts as the input.
pub fn run(
    algorithm: Algorithm,
    assignment: &Assignment,
    member_counts: &[u64],
    port_speeds: &BTreeMap<u32, u32>,
    params: &ControllerParams,
    seed: Option<u64>,
) -> Assignment {
    match algorithm {
        Algorithm::LocalSearch => {
            let search = LocalSearchParams {
                max_iterations: params.max_iterations,
                exchange_cost_factor: params.exchange_cost_factor,
                ..Default::default()
            };
            local_search::optimize(assignment, member_counts, port_speeds, &search, seed)
        }
        Algorithm::Genetic => genetic::optimize(
            assignment,
            member_counts,
            port_speeds,
            &GeneticParams::default(),
            seed,
        ),
    }
}
