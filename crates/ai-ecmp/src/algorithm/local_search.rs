//! Randomised swap-based local search over a hash-slot assignment.
//!
//! Candidate moves are uniform random slot pairs; a move is taken only when
//! its balance-score gain beats the flat exchange cost. Accepted moves are
//! applied in place with an O(1) incremental load update, so every iteration
//! is cheap regardless of table size. Swaps are permutations: per-port slot
//! counts are invariant, which is what keeps the search safely inside the
//! adjust (not expand) regime.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::metrics;
use crate::types::Assignment;

use std::collections::BTreeMap;

/// Bounds for one search invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalSearchParams {
    pub max_iterations: u32,
    /// Flat cost charged against each candidate swap's score gain.
    pub exchange_cost_factor: f64,
    /// Give up after this many rejected candidates in a row.
    pub max_consecutive_failures: u32,
}

impl Default for LocalSearchParams {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            exchange_cost_factor: 0.1,
            max_consecutive_failures: 100,
        }
    }
}

/// Search for a better slot→port assignment.
///
/// Returns the improved assignment, or a clone of the input when no
/// profitable move was found. `seed` pins the generator for deterministic
/// tests; `None` seeds from entropy.
pub fn optimize(
    assignment: &Assignment,
    member_counts: &[u64],
    port_speeds: &BTreeMap<u32, u32>,
    params: &LocalSearchParams,
    seed: Option<u64>,
) -> Assignment {
    let mut result = assignment.clone();

    let hash_indices: Vec<u32> = assignment.keys().copied().collect();
    if hash_indices.len() < 2 {
        return result;
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut loads = metrics::port_loads(&result, member_counts);
    let start_score = metrics::balance_eval(&loads, port_speeds).balance_score;

    let mut iterations = 0u32;
    let mut consecutive_failures = 0u32;
    let mut accepted = 0u32;

    while iterations < params.max_iterations
        && consecutive_failures < params.max_consecutive_failures
    {
        let pick_a = rng.gen_range(0..hash_indices.len());
        let mut pick_b = rng.gen_range(0..hash_indices.len());
        while pick_a == pick_b {
            pick_b = rng.gen_range(0..hash_indices.len());
        }
        let hash_a = hash_indices[pick_a];
        let hash_b = hash_indices[pick_b];

        let improvement =
            metrics::swap_delta(&result, member_counts, &loads, port_speeds, hash_a, hash_b)
                - params.exchange_cost_factor;

        if improvement > 0.0 {
            let port_a = result[&hash_a];
            let port_b = result[&hash_b];
            let count_a = member_counts[hash_a as usize];
            let count_b = member_counts[hash_b as usize];

            if let Some(load) = loads.get_mut(&port_a) {
                *load = *load - count_a + count_b;
            }
            if let Some(load) = loads.get_mut(&port_b) {
                *load = *load - count_b + count_a;
            }
            result.insert(hash_a, port_b);
            result.insert(hash_b, port_a);

            accepted += 1;
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
        }
        iterations += 1;
    }

    let end_score = metrics::balance_eval(&loads, port_speeds).balance_score;
    debug!(
        iterations,
        accepted,
        consecutive_failures,
        start_score,
        end_score,
        "local search finished"
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{balance_eval, port_loads};
    use crate::types::MAX_HASH_ITEMS;

    const SEED: u64 = 0x5eed;

    fn speeds(pairs: &[(u32, u32)]) -> BTreeMap<u32, u32> {
        pairs.iter().copied().collect()
    }

    fn striped_assignment(slots: u32, ports: &[u32]) -> Assignment {
        (0..slots)
            .map(|i| (i, ports[i as usize % ports.len()]))
            .collect()
    }

    #[test]
    fn returns_input_when_fewer_than_two_slots() {
        let table: Assignment = [(0, 1)].into_iter().collect();
        let out = optimize(
            &table,
            &[100],
            &speeds(&[(1, 10)]),
            &LocalSearchParams::default(),
            Some(SEED),
        );
        assert_eq!(out, table);
    }

    #[test]
    fn finds_obvious_rebalance() {
        // Ports 1..=4, two slots each; both hot buckets start on port 1.
        let ports = [1, 2, 3, 4];
        let table = striped_assignment(8, &ports);
        let mut counts = vec![500u64; 8];
        counts[0] = 5000; // port 1
        counts[4] = 5000; // port 1
        let sp = speeds(&[(1, 10), (2, 10), (3, 10), (4, 10)]);

        let before = balance_eval(&port_loads(&table, &counts), &sp);
        let out = optimize(&table, &counts, &sp, &LocalSearchParams::default(), Some(SEED));
        let after = balance_eval(&port_loads(&out, &counts), &sp);

        assert_ne!(out, table, "a profitable swap must exist");
        assert!(
            after.total_gap < before.total_gap,
            "gap must shrink: {} -> {}",
            before.total_gap,
            after.total_gap
        );
    }

    #[test]
    fn accepted_moves_preserve_per_port_weights() {
        let ports = [1, 2, 3, 4];
        let table = striped_assignment(8, &ports);
        let mut counts = vec![500u64; 8];
        counts[0] = 5000;
        counts[4] = 5000;
        let sp = speeds(&[(1, 10), (2, 10), (3, 10), (4, 10)]);

        let out = optimize(&table, &counts, &sp, &LocalSearchParams::default(), Some(SEED));

        let weight = |table: &Assignment, port: u32| table.values().filter(|&&p| p == port).count();
        for port in ports {
            assert_eq!(weight(&out, port), weight(&table, port));
        }
        assert_eq!(
            out.keys().collect::<Vec<_>>(),
            table.keys().collect::<Vec<_>>(),
            "slot set must be untouched"
        );
    }

    #[test]
    fn same_seed_same_result() {
        let table = striped_assignment(16, &[1, 2, 3, 4]);
        let counts: Vec<u64> = (0..16).map(|i| 100 + i * 37).collect();
        let sp = speeds(&[(1, 10), (2, 10), (3, 10), (4, 10)]);
        let a = optimize(&table, &counts, &sp, &LocalSearchParams::default(), Some(SEED));
        let b = optimize(&table, &counts, &sp, &LocalSearchParams::default(), Some(SEED));
        assert_eq!(a, b);
    }

    #[test]
    fn exchange_cost_suppresses_marginal_swaps() {
        // The best available swap gains well under the cost factor.
        let table = striped_assignment(4, &[1, 2]);
        let counts = vec![1010u64, 1000, 1010, 1000];
        let sp = speeds(&[(1, 10), (2, 10)]);
        let params = LocalSearchParams {
            exchange_cost_factor: 0.5,
            ..Default::default()
        };
        let out = optimize(&table, &counts, &sp, &params, Some(SEED));
        assert_eq!(out, table);
    }

    #[test]
    fn stays_within_slot_bounds_on_full_table() {
        let table = striped_assignment(MAX_HASH_ITEMS as u32, &[1, 2, 3]);
        let counts = vec![1000u64; MAX_HASH_ITEMS];
        let sp = speeds(&[(1, 10), (2, 10), (3, 10)]);
        // Uniform load: nothing to gain, but the walk must not panic.
        let out = optimize(&table, &counts, &sp, &LocalSearchParams::default(), Some(SEED));
        assert_eq!(out.len(), MAX_HASH_ITEMS);
    }
}
