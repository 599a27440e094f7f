//! Multi-group manager and diagnostic surface.
//!
//! The manager owns one [`EcmpInstance`] per enabled split group and drives
//! them all from a single periodic entry point, [`EcmpManager::run_cycle`].
//! It is a plain value: the embedding scheduler owns it and calls it
//! serially, and tests construct as many managers as they like. Emitted
//! plans leave through a caller-supplied [`NextHopSink`]; delivery is
//! fire-and-forget from the manager's point of view.
//!
//! A failing instance never aborts the rest of a cycle: the first error
//! kind seen is remembered and returned once every instance has run.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::algorithm::Algorithm;
use crate::config::ControllerParams;
use crate::error::EcmpError;
use crate::instance::EcmpInstance;
use crate::types::{
    BalanceEval, CounterFrame, NextHopPlan, SgConfig, SgStatus, MAX_HASH_ITEMS,
};

// ---------------------------------------------------------------------------
// Inbound / outbound interface types
// ---------------------------------------------------------------------------

/// Whether a config frame enables or disables its split group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchFlag {
    Enable,
    Disable,
}

impl SwitchFlag {
    /// Decode the wire flag. Anything but 0/1 is a malformed frame.
    pub fn from_raw(raw: u16) -> Result<Self, EcmpError> {
        match raw {
            1 => Ok(Self::Enable),
            0 => Ok(Self::Disable),
            other => Err(EcmpError::ConfigInvalid(format!(
                "unknown switch flag {other}"
            ))),
        }
    }
}

/// Receiver for emitted next-hop plans.
pub trait NextHopSink {
    fn deliver(&mut self, plan: &NextHopPlan);
}

impl<F: FnMut(&NextHopPlan)> NextHopSink for F {
    fn deliver(&mut self, plan: &NextHopPlan) {
        self(plan)
    }
}

/// Which instances a diagnostic operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgSelector {
    All,
    One(u32),
}

/// Synthetic traffic shapes for forced optimisation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficPattern {
    /// Every bucket at 1000.
    Uniform,
    /// First quarter of the buckets at 5000, the rest at 500.
    Skewed,
    /// Every bucket uniform random in 100..10000.
    Random,
}

impl TrafficPattern {
    /// Materialise one synthetic counter frame.
    pub fn frame(&self) -> CounterFrame {
        let mut counters = [0u64; MAX_HASH_ITEMS];
        match self {
            Self::Uniform => counters = [1000; MAX_HASH_ITEMS],
            Self::Skewed => {
                for (i, slot) in counters.iter_mut().enumerate() {
                    *slot = if i < MAX_HASH_ITEMS / 4 { 5000 } else { 500 };
                }
            }
            Self::Random => {
                let mut rng = StdRng::from_entropy();
                for slot in counters.iter_mut() {
                    *slot = rng.gen_range(100..10_000);
                }
            }
        }
        CounterFrame::new(counters)
    }
}

// ---------------------------------------------------------------------------
// Diagnostic views
// ---------------------------------------------------------------------------

/// One-line status view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub sg_id: u32,
    pub status: SgStatus,
    pub cycle: u32,
    pub port_num: usize,
    pub item_num: usize,
    pub optimisation_enabled: bool,
    pub disabled_cycles: u32,
}

/// Coarse banding of the total gap, for operators scanning a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceBand {
    Good,
    Light,
    Moderate,
    Severe,
}

impl BalanceBand {
    pub fn from_total_gap(total_gap: f64) -> Self {
        if total_gap < 0.05 {
            Self::Good
        } else if total_gap < 0.15 {
            Self::Light
        } else if total_gap < 0.30 {
            Self::Moderate
        } else {
            Self::Severe
        }
    }
}

/// Current deviation metrics plus their band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub sg_id: u32,
    pub status: SgStatus,
    pub eval: BalanceEval,
    pub band: BalanceBand,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Keyed collection of per-group controllers.
#[derive(Debug, Default)]
pub struct EcmpManager {
    instances: BTreeMap<u32, EcmpInstance>,
    params: ControllerParams,
}

impl EcmpManager {
    pub fn new(params: ControllerParams) -> Self {
        Self {
            instances: BTreeMap::new(),
            params,
        }
    }

    // -- Config lifecycle ------------------------------------------------------

    /// Apply one decoded config frame: enable creates or updates the
    /// group's instance, disable drops it.
    pub fn handle_config(&mut self, flag: SwitchFlag, config: &SgConfig) -> Result<(), EcmpError> {
        config.validate()?;
        let sg_id = config.sg_id;
        match flag {
            SwitchFlag::Enable => {
                if let Some(instance) = self.instances.get_mut(&sg_id) {
                    instance.update_config(config.clone());
                    info!(
                        sg_id,
                        seq_id = config.seq_id,
                        item_num = config.item_num(),
                        port_num = config.port_num(),
                        "split group updated"
                    );
                } else {
                    self.instances
                        .insert(sg_id, EcmpInstance::new(config.clone(), self.params));
                    info!(
                        sg_id,
                        seq_id = config.seq_id,
                        item_num = config.item_num(),
                        port_num = config.port_num(),
                        "split group created"
                    );
                }
            }
            SwitchFlag::Disable => {
                if self.instances.remove(&sg_id).is_some() {
                    info!(sg_id, "split group dropped");
                }
            }
        }
        Ok(())
    }

    // -- The periodic entry point ----------------------------------------------

    /// Run one optimisation cycle across every instance.
    ///
    /// Each instance folds in the frame and decides; `Adjust` and `Expand`
    /// outcomes hand their plan to the sink. One instance's failure never
    /// stops the others; the first error kind seen is returned at the end.
    pub fn run_cycle(
        &mut self,
        frame: &CounterFrame,
        sink: &mut dyn NextHopSink,
    ) -> Result<(), EcmpError> {
        if self.instances.is_empty() {
            return Err(EcmpError::NoInstance);
        }

        let mut first_error: Option<EcmpError> = None;
        for instance in self.instances.values_mut() {
            Self::drive_instance(instance, frame, sink, &mut first_error);
        }

        debug!(
            instances = self.instances.len(),
            ok = first_error.is_none(),
            "optimisation cycle finished"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn drive_instance(
        instance: &mut EcmpInstance,
        frame: &CounterFrame,
        sink: &mut dyn NextHopSink,
        first_error: &mut Option<EcmpError>,
    ) {
        let sg_id = instance.sg_id();

        if let Err(err) = instance.update_counters(frame) {
            debug!(sg_id, code = err.code(), "counter update failed");
            first_error.get_or_insert(EcmpError::CounterRead(sg_id));
            return;
        }

        if !instance.run_optimisation() {
            if instance.status() == SgStatus::Fail {
                if let Some(err) = instance.last_failure() {
                    debug!(sg_id, code = err.code(), "optimisation attempt failed");
                    first_error.get_or_insert(err.clone());
                }
            }
            return;
        }

        match instance.status() {
            SgStatus::Expand => match instance.expanded_next_hops() {
                Some(plan) => {
                    info!(sg_id, item_num = plan.item_num, "delivering expansion plan");
                    sink.deliver(&plan);
                }
                None => {
                    first_error.get_or_insert(EcmpError::ExpandFailed(sg_id));
                }
            },
            SgStatus::Adjust => match instance.optimised_next_hops() {
                Some(plan) => {
                    info!(sg_id, item_num = plan.item_num, "delivering adjust plan");
                    sink.deliver(&plan);
                }
                None => {
                    first_error.get_or_insert(EcmpError::AdjustFailed(sg_id));
                }
            },
            _ => {}
        }
    }

    // -- Diagnostic surface ----------------------------------------------------

    /// Enable optimisation on the selected instances. Returns how many were
    /// touched.
    pub fn enable_optimisation(&mut self, selector: SgSelector) -> Result<u32, EcmpError> {
        self.with_selected(selector, |instance| instance.enable_optimisation())
    }

    /// Disable optimisation on the selected instances.
    pub fn disable_optimisation(&mut self, selector: SgSelector) -> Result<u32, EcmpError> {
        self.with_selected(selector, |instance| instance.disable_optimisation())
    }

    /// Reset the selected instances to their initial state.
    pub fn reset_instance(&mut self, selector: SgSelector) -> Result<u32, EcmpError> {
        self.with_selected(selector, |instance| instance.reset())
    }

    /// Switch the optimisation strategy on the selected instances.
    pub fn set_algorithm(
        &mut self,
        selector: SgSelector,
        algorithm: Algorithm,
    ) -> Result<u32, EcmpError> {
        self.with_selected(selector, |instance| instance.set_algorithm(algorithm))
    }

    /// Retune the local search on the selected instances.
    pub fn set_search_params(
        &mut self,
        selector: SgSelector,
        max_iterations: u32,
        exchange_cost_factor: f64,
    ) -> Result<u32, EcmpError> {
        if max_iterations == 0 {
            return Err(EcmpError::InvalidParam("max_iterations must be > 0".into()));
        }
        self.with_selected(selector, |instance| {
            instance.set_search_params(max_iterations, exchange_cost_factor)
        })
    }

    /// Inject one synthetic counter frame and run a full cycle against the
    /// selected instances.
    pub fn force_optimisation(
        &mut self,
        selector: SgSelector,
        pattern: TrafficPattern,
        sink: &mut dyn NextHopSink,
    ) -> Result<(), EcmpError> {
        let frame = pattern.frame();
        match selector {
            SgSelector::All => self.run_cycle(&frame, sink),
            SgSelector::One(sg_id) => {
                let instance = self
                    .instances
                    .get_mut(&sg_id)
                    .ok_or(EcmpError::NotFound(sg_id))?;
                let mut first_error = None;
                Self::drive_instance(instance, &frame, sink, &mut first_error);
                match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    /// One-line status view of a single instance.
    pub fn status_snapshot(&self, sg_id: u32) -> Result<StatusSnapshot, EcmpError> {
        let instance = self.instances.get(&sg_id).ok_or(EcmpError::NotFound(sg_id))?;
        Ok(StatusSnapshot {
            sg_id,
            status: instance.status(),
            cycle: instance.cycle(),
            port_num: instance.config().port_num(),
            item_num: instance.config().item_num(),
            optimisation_enabled: instance.optimisation_enabled(),
            disabled_cycles: instance.disabled_cycles(),
        })
    }

    /// Fresh balance evaluation of a single instance, banded for
    /// fleet-level scanning.
    pub fn balance_report(&mut self, sg_id: u32) -> Result<BalanceReport, EcmpError> {
        let instance = self
            .instances
            .get_mut(&sg_id)
            .ok_or(EcmpError::NotFound(sg_id))?;
        let eval = instance.evaluate_balance();
        Ok(BalanceReport {
            sg_id,
            status: instance.status(),
            eval,
            band: BalanceBand::from_total_gap(eval.total_gap),
        })
    }

    /// The retained delta snapshots of one instance, newest last. `0` for
    /// the whole window.
    pub fn counter_history(&self, sg_id: u32, last_n: usize) -> Result<Vec<Vec<u64>>, EcmpError> {
        self.instances
            .get(&sg_id)
            .map(|instance| instance.counter_history(last_n))
            .ok_or(EcmpError::NotFound(sg_id))
    }

    /// Current per-port load aggregate of one instance.
    pub fn port_loads(&self, sg_id: u32) -> Result<BTreeMap<u32, u64>, EcmpError> {
        self.instances
            .get(&sg_id)
            .map(|instance| instance.port_loads().clone())
            .ok_or(EcmpError::NotFound(sg_id))
    }

    pub fn instance(&self, sg_id: u32) -> Option<&EcmpInstance> {
        self.instances.get(&sg_id)
    }

    pub fn instance_mut(&mut self, sg_id: u32) -> Option<&mut EcmpInstance> {
        self.instances.get_mut(&sg_id)
    }

    pub fn for_each_instance(&self, mut f: impl FnMut(u32, &EcmpInstance)) {
        for (&sg_id, instance) in &self.instances {
            f(sg_id, instance);
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn with_selected(
        &mut self,
        selector: SgSelector,
        mut f: impl FnMut(&mut EcmpInstance),
    ) -> Result<u32, EcmpError> {
        match selector {
            SgSelector::All => {
                let mut touched = 0;
                for instance in self.instances.values_mut() {
                    f(instance);
                    touched += 1;
                }
                Ok(touched)
            }
            SgSelector::One(sg_id) => {
                let instance = self
                    .instances
                    .get_mut(&sg_id)
                    .ok_or(EcmpError::NotFound(sg_id))?;
                f(instance);
                Ok(1)
            }
        }
    }
}
