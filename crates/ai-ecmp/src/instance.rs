//! Per-split-group optimisation controller.
//!
//! One [`EcmpInstance`] owns the state of a single split group: the working
//! slot assignment, the rolling counter history, the last balance
//! evaluation, and the hysteresis counters that arbitrate between "search
//! harder" and "grow the table". Each tick the manager feeds it one counter
//! frame ([`EcmpInstance::update_counters`]) and then asks it to decide
//! ([`EcmpInstance::run_optimisation`]); the decision is visible as the
//! instance status, and an accepted decision parks a plan for the manager
//! to collect.
//!
//! Counter semantics: inbound frames carry raw, monotonically
//! non-decreasing bucket counters that may wrap. The load signal is the
//! per-tick delta `frame[i] - prev[i]` (mod 2^64), never the running sum.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info};

use crate::algorithm::{self, Algorithm};
use crate::config::ControllerParams;
use crate::error::EcmpError;
use crate::expansion;
use crate::metrics;
use crate::types::{Assignment, BalanceEval, CounterFrame, NextHopPlan, SgConfig, SgStatus};

/// Controller state for one split group.
#[derive(Debug, Clone)]
pub struct EcmpInstance {
    config: SgConfig,
    params: ControllerParams,
    algorithm: Algorithm,

    /// Working slot table, hash index → port id.
    assignment: Assignment,
    /// Per-slot load signal for the current tick (counter deltas).
    member_counts: Vec<u64>,
    /// Raw counter values from the previous frame, for delta derivation.
    prev_raw: Vec<u64>,
    /// Per-port aggregate of `member_counts` under `assignment`.
    port_loads: BTreeMap<u32, u64>,
    port_speeds: BTreeMap<u32, u32>,
    /// Rolling window of per-slot delta snapshots, newest at the back.
    counter_history: VecDeque<Vec<u64>>,

    last_eval: BalanceEval,
    status: SgStatus,
    cycle: u32,

    last_expand_cycle: u32,
    adjust_cycles_after_expansion: u32,
    consecutive_adjust_failures: u32,
    in_post_expansion_period: bool,

    optimisation_enabled: bool,
    disabled_cycles: u32,

    /// Plan parked by the last accepted decision, collected by the manager.
    pending_plan: Option<NextHopPlan>,
    /// Why the last decision ended in `Fail`, for the manager to aggregate.
    last_failure: Option<EcmpError>,
    /// Deterministic search seed; `None` seeds from entropy each run.
    search_seed: Option<u64>,
}

impl EcmpInstance {
    pub fn new(config: SgConfig, params: ControllerParams) -> Self {
        let mut instance = Self {
            config,
            params,
            algorithm: Algorithm::default(),
            assignment: Assignment::new(),
            member_counts: Vec::new(),
            prev_raw: Vec::new(),
            port_loads: BTreeMap::new(),
            port_speeds: BTreeMap::new(),
            counter_history: VecDeque::new(),
            last_eval: BalanceEval::default(),
            status: SgStatus::Init,
            cycle: 0,
            last_expand_cycle: 0,
            adjust_cycles_after_expansion: 0,
            consecutive_adjust_failures: 0,
            in_post_expansion_period: false,
            optimisation_enabled: true,
            disabled_cycles: 0,
            pending_plan: None,
            last_failure: None,
            search_seed: None,
        };
        instance.convert_config();
        instance
    }

    /// Install a new config version for the same group. Clears the counter
    /// history and the hysteresis state; the enable/disable switch is
    /// deliberately preserved.
    pub fn update_config(&mut self, config: SgConfig) {
        self.config = config;
        self.convert_config();
        self.counter_history.clear();
        self.cycle = 0;
        self.last_expand_cycle = 0;
        self.adjust_cycles_after_expansion = 0;
        self.consecutive_adjust_failures = 0;
        self.in_post_expansion_period = false;
        self.pending_plan = None;
        self.last_failure = None;
    }

    fn convert_config(&mut self) {
        self.assignment = self.config.assignment();
        self.port_speeds = self.config.port_speeds();
        self.member_counts = vec![0; self.config.item_num()];
        self.prev_raw = vec![0; self.config.item_num()];
        self.port_loads.clear();
    }

    // -- Per-tick entry points -------------------------------------------------

    /// Fold one counter frame into the instance.
    ///
    /// Derives per-slot deltas (wrap-safe), pushes the delta snapshot onto
    /// the rolling history, refreshes per-port loads and advances the cycle
    /// counter. Runs even while optimisation is disabled so the history
    /// stays continuous.
    pub fn update_counters(&mut self, frame: &CounterFrame) -> Result<(), EcmpError> {
        if self.member_counts.len() != self.config.item_num() {
            return Err(EcmpError::CounterRead(self.config.sg_id));
        }

        for (i, count) in self.member_counts.iter_mut().enumerate() {
            let raw = frame.counters[i];
            *count = raw.wrapping_sub(self.prev_raw[i]);
            self.prev_raw[i] = raw;
        }

        self.counter_history.push_back(self.member_counts.clone());
        while self.counter_history.len() > self.params.history_cap {
            self.counter_history.pop_front();
        }

        self.port_loads = metrics::port_loads(&self.assignment, &self.member_counts);
        self.cycle += 1;
        if !self.optimisation_enabled {
            self.disabled_cycles += 1;
        }
        Ok(())
    }

    /// Run one optimisation decision. Returns `true` when a plan is pending
    /// (status `Adjust` or `Expand`); the manager collects it through the
    /// plan getters.
    pub fn run_optimisation(&mut self) -> bool {
        self.pending_plan = None;
        self.last_failure = None;

        if !self.optimisation_enabled {
            debug!(
                sg_id = self.config.sg_id,
                disabled_cycles = self.disabled_cycles,
                "optimisation disabled, skipping"
            );
            return false;
        }

        if self.counter_history.len() < self.params.history_window {
            debug!(
                sg_id = self.config.sg_id,
                have = self.counter_history.len(),
                need = self.params.history_window,
                "insufficient counter history"
            );
            self.status = SgStatus::Wait;
            return false;
        }

        if !self.counter_variance_stable() {
            debug!(sg_id = self.config.sg_id, "counters not settled, holding");
            self.status = SgStatus::Wait;
            return false;
        }

        let current_eval = self.evaluate_balance();
        if current_eval.avg_gap < self.params.balance_threshold {
            debug!(
                sg_id = self.config.sg_id,
                avg_gap = current_eval.avg_gap,
                "group is balanced"
            );
            self.status = SgStatus::Balance;
            self.in_post_expansion_period = false;
            self.consecutive_adjust_failures = 0;
            return false;
        }

        if self.should_expand() {
            return self.try_expand();
        }
        self.try_adjust(current_eval)
    }

    // -- Decision helpers ------------------------------------------------------

    /// Arbitrate between expansion and another round of search.
    ///
    /// Repeated search failures override the post-expansion quiet period;
    /// inside the quiet period (and below the failure threshold) the search
    /// always gets another chance, even when the group looks
    /// expansion-worthy.
    fn should_expand(&mut self) -> bool {
        if self.consecutive_adjust_failures >= self.params.max_consecutive_failures {
            if self.need_expansion() {
                if self.in_post_expansion_period {
                    info!(
                        sg_id = self.config.sg_id,
                        failures = self.consecutive_adjust_failures,
                        "repeated failures end the post-expansion quiet period early"
                    );
                    self.in_post_expansion_period = false;
                }
                return true;
            }
            return false;
        }
        if self.should_skip_expansion_check() {
            return false;
        }
        // Expansion-worthy but below the failure threshold: one more chance
        // for the search.
        false
    }

    fn try_expand(&mut self) -> bool {
        match expansion::plan_expansion(&self.config) {
            Ok(plan) => {
                info!(
                    sg_id = self.config.sg_id,
                    item_num = plan.item_num,
                    "expansion planned"
                );
                self.pending_plan = Some(plan);
                self.record_expansion_operation();
                self.status = SgStatus::Expand;
                true
            }
            Err(err) => {
                debug!(sg_id = self.config.sg_id, code = err.code(), "expansion infeasible");
                self.last_failure = Some(err);
                self.record_adjustment_result(false);
                self.status = SgStatus::Fail;
                false
            }
        }
    }

    fn try_adjust(&mut self, before: BalanceEval) -> bool {
        let candidate = algorithm::run(
            self.algorithm,
            &self.assignment,
            &self.member_counts,
            &self.port_speeds,
            &self.params,
            self.search_seed,
        );

        if candidate == self.assignment {
            debug!(sg_id = self.config.sg_id, "search found no profitable move");
            self.record_adjustment_result(false);
            self.status = SgStatus::Balance;
            return false;
        }

        let candidate_loads = metrics::port_loads(&candidate, &self.member_counts);
        let after = metrics::balance_eval(&candidate_loads, &self.port_speeds);
        let improvement = metrics::improvement_percent(&before, &after);

        if improvement < self.params.min_improvement_percent {
            debug!(
                sg_id = self.config.sg_id,
                improvement,
                threshold = self.params.min_improvement_percent,
                "improvement below threshold, keeping current table"
            );
            self.last_failure = Some(EcmpError::AdjustFailed(self.config.sg_id));
            self.record_adjustment_result(false);
            self.status = SgStatus::Fail;
            return false;
        }

        info!(
            sg_id = self.config.sg_id,
            improvement,
            total_gap_before = before.total_gap,
            total_gap_after = after.total_gap,
            "re-shuffle accepted"
        );
        self.assignment = candidate;
        self.port_loads = candidate_loads;
        self.pending_plan = Some(NextHopPlan::from_assignment(
            self.config.sg_id,
            self.config.seq_id,
            &self.assignment,
        ));
        self.record_adjustment_result(true);
        self.status = SgStatus::Adjust;
        true
    }

    /// Expansion is warranted when any port is too thin to rebalance
    /// (weight below 2) or the last evaluation showed a gross imbalance.
    fn need_expansion(&self) -> bool {
        const EXPANSION_GAP_THRESHOLD: f64 = 0.2;
        if self.config.ports.iter().any(|p| p.weight < 2) {
            return true;
        }
        self.last_eval.total_gap > EXPANSION_GAP_THRESHOLD
    }

    /// Whether a re-shuffle could possibly help: more than one port, and
    /// either unequal speeds or more slots than ports.
    pub fn has_adjustment_space(&self) -> bool {
        if self.config.ports.len() <= 1 {
            return false;
        }
        let all_same_speed = self
            .config
            .ports
            .windows(2)
            .all(|w| w[0].speed == w[1].speed);
        !(all_same_speed && self.config.item_num() == self.config.port_num())
    }

    fn should_skip_expansion_check(&mut self) -> bool {
        if !self.in_post_expansion_period {
            return false;
        }
        if self.adjust_cycles_after_expansion < self.params.cycles_after_expansion {
            return true;
        }
        self.in_post_expansion_period = false;
        debug!(sg_id = self.config.sg_id, "post-expansion quiet period over");
        false
    }

    fn record_expansion_operation(&mut self) {
        self.last_expand_cycle = self.cycle;
        self.adjust_cycles_after_expansion = 0;
        self.consecutive_adjust_failures = 0;
        self.in_post_expansion_period = true;
    }

    fn record_adjustment_result(&mut self, success: bool) {
        if self.in_post_expansion_period {
            self.adjust_cycles_after_expansion += 1;
            if self.adjust_cycles_after_expansion >= self.params.cycles_after_expansion {
                self.in_post_expansion_period = false;
            }
        }
        if success {
            self.consecutive_adjust_failures = 0;
        } else {
            self.consecutive_adjust_failures += 1;
        }
    }

    fn counter_variance_stable(&self) -> bool {
        let window: Vec<Vec<u64>> = self
            .counter_history
            .iter()
            .rev()
            .take(self.params.history_window)
            .rev()
            .cloned()
            .collect();
        let coefficient =
            metrics::counter_variation_coefficient(&window, self.member_counts.len());
        coefficient <= self.params.variance_threshold
    }

    /// Score the current assignment against the current load signal,
    /// remembering the result for the expansion heuristic.
    pub fn evaluate_balance(&mut self) -> BalanceEval {
        let loads = metrics::port_loads(&self.assignment, &self.member_counts);
        let eval = metrics::balance_eval(&loads, &self.port_speeds);
        self.last_eval = eval;
        eval
    }

    // -- Plan emission ---------------------------------------------------------

    /// The re-shuffle plan, only while the instance is in `Adjust`.
    pub fn optimised_next_hops(&self) -> Option<NextHopPlan> {
        if self.status != SgStatus::Adjust {
            return None;
        }
        self.pending_plan
    }

    /// The expansion plan, only while the instance is in `Expand`.
    pub fn expanded_next_hops(&self) -> Option<NextHopPlan> {
        if self.status != SgStatus::Expand {
            return None;
        }
        self.pending_plan
    }

    /// Why the last decision ended in `Fail`, if it did.
    pub fn last_failure(&self) -> Option<&EcmpError> {
        self.last_failure.as_ref()
    }

    // -- Control & introspection -----------------------------------------------

    /// Back to a blank slate: history, hysteresis and the cycle counter are
    /// cleared. The enable/disable switch survives.
    pub fn reset(&mut self) {
        self.cycle = 0;
        self.status = SgStatus::Init;
        self.counter_history.clear();
        self.last_expand_cycle = 0;
        self.adjust_cycles_after_expansion = 0;
        self.consecutive_adjust_failures = 0;
        self.in_post_expansion_period = false;
        self.disabled_cycles = 0;
        self.pending_plan = None;
        self.last_failure = None;
    }

    pub fn enable_optimisation(&mut self) {
        if !self.optimisation_enabled {
            info!(
                sg_id = self.config.sg_id,
                was_disabled_for = self.disabled_cycles,
                "optimisation enabled"
            );
            self.optimisation_enabled = true;
            self.disabled_cycles = 0;
        }
    }

    pub fn disable_optimisation(&mut self) {
        if self.optimisation_enabled {
            info!(sg_id = self.config.sg_id, "optimisation disabled");
            self.optimisation_enabled = false;
            self.disabled_cycles = 0;
        }
    }

    pub fn set_algorithm(&mut self, algorithm: Algorithm) {
        self.algorithm = algorithm;
    }

    pub fn set_search_params(&mut self, max_iterations: u32, exchange_cost_factor: f64) {
        self.params.max_iterations = max_iterations;
        self.params.exchange_cost_factor = exchange_cost_factor;
    }

    /// Pin the optimiser seed; tests use this for reproducible runs.
    pub fn set_search_seed(&mut self, seed: Option<u64>) {
        self.search_seed = seed;
    }

    pub fn sg_id(&self) -> u32 {
        self.config.sg_id
    }

    pub fn status(&self) -> SgStatus {
        self.status
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn config(&self) -> &SgConfig {
        &self.config
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn optimisation_enabled(&self) -> bool {
        self.optimisation_enabled
    }

    pub fn disabled_cycles(&self) -> u32 {
        self.disabled_cycles
    }

    /// Cycle number of the most recent expansion, 0 if none yet.
    pub fn last_expand_cycle(&self) -> u32 {
        self.last_expand_cycle
    }

    pub fn last_eval(&self) -> BalanceEval {
        self.last_eval
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn port_loads(&self) -> &BTreeMap<u32, u64> {
        &self.port_loads
    }

    /// The most recent `last_n` delta snapshots, oldest first. `0` means
    /// the whole retained window.
    pub fn counter_history(&self, last_n: usize) -> Vec<Vec<u64>> {
        let take = if last_n == 0 {
            self.counter_history.len()
        } else {
            last_n.min(self.counter_history.len())
        };
        self.counter_history
            .iter()
            .skip(self.counter_history.len() - take)
            .cloned()
            .collect()
    }
}
