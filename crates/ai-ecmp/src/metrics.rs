//! Pure load-deviation metrics.
//!
//! Everything here is deterministic and side-effect free: aggregate
//! per-bucket counters into per-port loads, score how far the normalised
//! loads sit from the bandwidth-proportional ideal, price candidate slot
//! swaps, and measure counter stability across a window of snapshots.

use std::collections::BTreeMap;

use crate::types::{Assignment, BalanceEval};

/// Variation coefficient reported when a window cannot be judged
/// (too few samples, or a zero mean). High enough to always read as
/// unstable.
pub const UNSTABLE_VARIATION: f64 = 1.0;

/// Accumulate per-slot counters into per-port loads.
///
/// Slots beyond the end of `member_counts` contribute nothing.
pub fn port_loads(assignment: &Assignment, member_counts: &[u64]) -> BTreeMap<u32, u64> {
    let mut loads: BTreeMap<u32, u64> = BTreeMap::new();
    for (&hash_index, &port_id) in assignment {
        if let Some(&count) = member_counts.get(hash_index as usize) {
            *loads.entry(port_id).or_insert(0) += count;
        }
    }
    loads
}

/// Score a set of per-port loads against the per-port speeds.
///
/// Ports without a positive speed are dropped from the evaluation. An empty
/// input, or a zero mean, short-circuits to a zeroed [`BalanceEval`].
pub fn balance_eval(loads: &BTreeMap<u32, u64>, speeds: &BTreeMap<u32, u32>) -> BalanceEval {
    let mut eval = BalanceEval::default();
    if loads.is_empty() || speeds.is_empty() {
        return eval;
    }

    let normalised: Vec<f64> = loads
        .iter()
        .filter_map(|(port_id, &load)| match speeds.get(port_id) {
            Some(&speed) if speed > 0 => Some(load as f64 / f64::from(speed)),
            _ => None,
        })
        .collect();
    if normalised.is_empty() {
        return eval;
    }

    let avg = normalised.iter().sum::<f64>() / normalised.len() as f64;
    let min = normalised.iter().copied().fold(f64::INFINITY, f64::min);
    let max = normalised.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if avg > 0.0 {
        eval.up_bound_gap = (max - avg) / avg;
        eval.low_bound_gap = (avg - min) / avg;
        eval.total_gap = eval.up_bound_gap + eval.low_bound_gap;
        let sum_abs_dev: f64 = normalised.iter().map(|u| (u - avg).abs()).sum();
        eval.avg_gap = sum_abs_dev / normalised.len() as f64 / avg;
    }
    eval.balance_score = -eval.total_gap;
    eval
}

/// Change in balance score from swapping the ports of slots `i` and `j`.
///
/// Positive means the swap improves balance. Invalid indices, slots outside
/// the counter table, or a same-port swap all price at zero.
pub fn swap_delta(
    assignment: &Assignment,
    member_counts: &[u64],
    loads: &BTreeMap<u32, u64>,
    speeds: &BTreeMap<u32, u32>,
    hash_index_a: u32,
    hash_index_b: u32,
) -> f64 {
    let (Some(&port_a), Some(&port_b)) =
        (assignment.get(&hash_index_a), assignment.get(&hash_index_b))
    else {
        return 0.0;
    };
    if hash_index_a as usize >= member_counts.len() || hash_index_b as usize >= member_counts.len()
    {
        return 0.0;
    }
    if port_a == port_b {
        return 0.0;
    }

    let count_a = member_counts[hash_index_a as usize];
    let count_b = member_counts[hash_index_b as usize];

    let mut swapped = loads.clone();
    if let Some(load) = swapped.get_mut(&port_a) {
        *load = *load - count_a + count_b;
    }
    if let Some(load) = swapped.get_mut(&port_b) {
        *load = *load - count_b + count_a;
    }

    balance_eval(&swapped, speeds).balance_score - balance_eval(loads, speeds).balance_score
}

/// Improvement between two evaluations as a percentage of the earlier
/// total gap. Zero when there was nothing to improve.
pub fn improvement_percent(before: &BalanceEval, after: &BalanceEval) -> f64 {
    let total_before = before.up_bound_gap + before.low_bound_gap;
    let total_after = after.up_bound_gap + after.low_bound_gap;
    if total_before <= 0.0 {
        return 0.0;
    }
    (total_before - total_after) / total_before * 100.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Sample standard deviation over mean. Empty input or a non-positive mean
/// reads as maximally unstable.
pub fn variation_coefficient(values: &[f64]) -> f64 {
    if values.is_empty() {
        return UNSTABLE_VARIATION;
    }
    let m = mean(values);
    if m <= 0.0 {
        return UNSTABLE_VARIATION;
    }
    sample_std_dev(values, m) / m
}

/// Mean per-slot variation coefficient across a window of counter
/// snapshots.
///
/// For each of the first `slot_count` slots, the slot's values across the
/// window are reduced to one coefficient; the result is the mean over all
/// slots that had at least two samples. Windows shorter than two snapshots
/// cannot be judged and read as unstable.
pub fn counter_variation_coefficient(window: &[Vec<u64>], slot_count: usize) -> f64 {
    if window.len() < 2 {
        return UNSTABLE_VARIATION;
    }

    let mut coefficients = Vec::with_capacity(slot_count);
    for hash_index in 0..slot_count {
        let values: Vec<f64> = window
            .iter()
            .filter_map(|snapshot| snapshot.get(hash_index).map(|&c| c as f64))
            .collect();
        if values.len() >= 2 {
            coefficients.push(variation_coefficient(&values));
        }
    }

    if coefficients.is_empty() {
        return UNSTABLE_VARIATION;
    }
    mean(&coefficients)
}
