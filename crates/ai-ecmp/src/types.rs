//! Core data model for the split-group optimisation controller.
//!
//! A *split group* (SG) is a hardware next-hop group with `port_num`
//! physical member ports and `item_num` logical hash slots mapping traffic
//! buckets onto those ports. The forwarding plane describes each SG with an
//! [`SgConfig`]; the controller answers with [`NextHopPlan`]s.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EcmpError;

/// Maximum number of logical hash slots per split group.
pub const MAX_HASH_ITEMS: usize = 128;

/// Maximum number of physical member ports per split group.
pub const MAX_PORTS: usize = 128;

/// Working form of the hash-slot table: hash index → port id.
///
/// Keys are exactly the slot offsets currently in use; a `BTreeMap` keeps
/// iteration deterministic wherever the assignment is observable.
pub type Assignment = BTreeMap<u32, u32>;

// ---------------------------------------------------------------------------
// Controller status
// ---------------------------------------------------------------------------

/// Per-instance controller state, advanced once per optimisation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SgStatus {
    /// Freshly created or reset; no counter data yet.
    Init,
    /// Waiting for enough counter history, or for the traffic to settle.
    Wait,
    /// A profitable re-shuffle was accepted this cycle; a plan is pending.
    Adjust,
    /// Evaluation in progress.
    Eval,
    /// A weight expansion was planned this cycle; a plan is pending.
    Expand,
    /// Load deviation is below the balance threshold; nothing to do.
    Balance,
    /// The last optimisation attempt produced no usable result.
    Fail,
}

impl SgStatus {
    /// Stable string identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Wait => "WAIT",
            Self::Adjust => "ADJUST",
            Self::Eval => "EVAL",
            Self::Expand => "EXPAND",
            Self::Balance => "BALANCE",
            Self::Fail => "FAIL",
        }
    }
}

impl fmt::Display for SgStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Split-group configuration
// ---------------------------------------------------------------------------

/// One logical hash slot: which port the slot currently names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgItem {
    /// Port this slot maps to.
    pub port_id: u32,
    /// Slot offset in the hash table, `0..item_num`.
    pub item_offset: u32,
}

/// One physical member port with its bandwidth and current slot count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortWeight {
    pub port_id: u32,
    /// Nominal bandwidth; only used as the denominator of normalised load.
    pub speed: u32,
    /// Number of hash slots currently assigned to this port.
    pub weight: u32,
}

/// Immutable-per-version description of one split group.
///
/// `seq_id` is a version tag owned by the forwarding plane; it is copied
/// verbatim into every plan the controller emits for this config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgConfig {
    pub sg_id: u32,
    pub seq_id: u32,
    pub fwd_lag_id: u32,
    pub counter_base: u32,
    /// Hash slot table, `len() == item_num <= MAX_HASH_ITEMS`.
    pub items: Vec<SgItem>,
    /// Physical member set, `len() == port_num <= MAX_PORTS`.
    pub ports: Vec<PortWeight>,
}

impl SgConfig {
    pub fn item_num(&self) -> usize {
        self.items.len()
    }

    pub fn port_num(&self) -> usize {
        self.ports.len()
    }

    /// Structural validation of an inbound config frame.
    pub fn validate(&self) -> Result<(), EcmpError> {
        if self.items.len() > MAX_HASH_ITEMS {
            return Err(EcmpError::ConfigInvalid(format!(
                "sg {}: item_num {} exceeds {}",
                self.sg_id,
                self.items.len(),
                MAX_HASH_ITEMS
            )));
        }
        if self.ports.len() > MAX_PORTS {
            return Err(EcmpError::ConfigInvalid(format!(
                "sg {}: port_num {} exceeds {}",
                self.sg_id,
                self.ports.len(),
                MAX_PORTS
            )));
        }
        for item in &self.items {
            if item.item_offset as usize >= self.items.len() {
                return Err(EcmpError::ConfigInvalid(format!(
                    "sg {}: item offset {} outside 0..{}",
                    self.sg_id,
                    item.item_offset,
                    self.items.len()
                )));
            }
        }
        Ok(())
    }

    /// Build the working hash-slot table from the config's item list.
    pub fn assignment(&self) -> Assignment {
        self.items
            .iter()
            .map(|item| (item.item_offset, item.port_id))
            .collect()
    }

    /// Port id → speed for every configured member.
    pub fn port_speeds(&self) -> BTreeMap<u32, u32> {
        self.ports.iter().map(|p| (p.port_id, p.speed)).collect()
    }
}

// ---------------------------------------------------------------------------
// Counter frame
// ---------------------------------------------------------------------------

/// One tick's worth of per-bucket traffic counters, received whole.
///
/// `counters[i]` is the raw value of hash slot `i`: monotonically
/// non-decreasing since SG creation, and free to wrap at 2^64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterFrame {
    pub counters: [u64; MAX_HASH_ITEMS],
}

impl CounterFrame {
    pub fn new(counters: [u64; MAX_HASH_ITEMS]) -> Self {
        Self { counters }
    }

    /// Frame with every bucket at the same value.
    pub fn uniform(value: u64) -> Self {
        Self {
            counters: [value; MAX_HASH_ITEMS],
        }
    }
}

impl Default for CounterFrame {
    fn default() -> Self {
        Self {
            counters: [0; MAX_HASH_ITEMS],
        }
    }
}

// ---------------------------------------------------------------------------
// Balance evaluation
// ---------------------------------------------------------------------------

/// Deviation metrics over normalised per-port loads (`load / speed`).
///
/// All fields are dimensionless; `balance_score` is `-(up + low)`, so
/// higher is better and zero is perfect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceEval {
    /// `(max - mean) / mean`.
    pub up_bound_gap: f64,
    /// `(mean - min) / mean`.
    pub low_bound_gap: f64,
    /// `up_bound_gap + low_bound_gap`.
    pub total_gap: f64,
    /// Mean absolute deviation over the mean.
    pub avg_gap: f64,
    /// `-(up_bound_gap + low_bound_gap)`.
    pub balance_score: f64,
}

// ---------------------------------------------------------------------------
// Emitted plan
// ---------------------------------------------------------------------------

/// A next-hop table update for the forwarding plane to install.
///
/// `seq_id` is the config's version tag, passed through verbatim; the
/// downstream owner assigns sequence numbers, never this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHopPlan {
    pub sg_id: u32,
    pub seq_id: u32,
    pub item_num: u32,
    pub link_items: [u32; MAX_HASH_ITEMS],
}

impl NextHopPlan {
    /// Empty plan carrying the identity of its split group.
    pub fn new(sg_id: u32, seq_id: u32) -> Self {
        Self {
            sg_id,
            seq_id,
            item_num: 0,
            link_items: [0; MAX_HASH_ITEMS],
        }
    }

    /// Lay an assignment out into the fixed-size link table.
    pub fn from_assignment(sg_id: u32, seq_id: u32, assignment: &Assignment) -> Self {
        let mut plan = Self::new(sg_id, seq_id);
        plan.item_num = assignment.len() as u32;
        for (&hash_index, &port_id) in assignment {
            if (hash_index as usize) < MAX_HASH_ITEMS {
                plan.link_items[hash_index as usize] = port_id;
            }
        }
        plan
    }

    /// The populated prefix of the link table.
    pub fn active_items(&self) -> &[u32] {
        let n = (self.item_num as usize).min(MAX_HASH_ITEMS);
        &self.link_items[..n]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SgConfig {
        SgConfig {
            sg_id: 7,
            seq_id: 3,
            fwd_lag_id: 11,
            counter_base: 0,
            items: vec![
                SgItem {
                    port_id: 100,
                    item_offset: 0,
                },
                SgItem {
                    port_id: 200,
                    item_offset: 1,
                },
            ],
            ports: vec![
                PortWeight {
                    port_id: 100,
                    speed: 10,
                    weight: 1,
                },
                PortWeight {
                    port_id: 200,
                    speed: 10,
                    weight: 1,
                },
            ],
        }
    }

    #[test]
    fn status_strings_are_stable() {
        assert_eq!(SgStatus::Init.as_str(), "INIT");
        assert_eq!(SgStatus::Wait.as_str(), "WAIT");
        assert_eq!(SgStatus::Adjust.as_str(), "ADJUST");
        assert_eq!(SgStatus::Eval.as_str(), "EVAL");
        assert_eq!(SgStatus::Expand.as_str(), "EXPAND");
        assert_eq!(SgStatus::Balance.as_str(), "BALANCE");
        assert_eq!(SgStatus::Fail.to_string(), "FAIL");
    }

    #[test]
    fn config_validates_and_converts() {
        let cfg = small_config();
        cfg.validate().expect("valid config");
        let assignment = cfg.assignment();
        assert_eq!(assignment.len(), 2);
        assert_eq!(assignment[&0], 100);
        assert_eq!(assignment[&1], 200);
        assert_eq!(cfg.port_speeds()[&200], 10);
    }

    #[test]
    fn config_rejects_out_of_range_offset() {
        let mut cfg = small_config();
        cfg.items[1].item_offset = 5;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.code(), "ERR_ECMP_CONFIG_INVALID");
    }

    #[test]
    fn config_rejects_oversized_tables() {
        let mut cfg = small_config();
        cfg.items = (0..MAX_HASH_ITEMS as u32 + 1)
            .map(|i| SgItem {
                port_id: 100,
                item_offset: i,
            })
            .collect();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn plan_from_assignment_round_trips_slots() {
        let cfg = small_config();
        let plan = NextHopPlan::from_assignment(cfg.sg_id, cfg.seq_id, &cfg.assignment());
        assert_eq!(plan.sg_id, 7);
        assert_eq!(plan.seq_id, 3);
        assert_eq!(plan.item_num, 2);
        assert_eq!(plan.active_items(), &[100, 200]);
        assert!(plan.link_items[2..].iter().all(|&p| p == 0));
    }

    #[test]
    fn counter_frame_uniform_fills_all_slots() {
        let frame = CounterFrame::uniform(42);
        assert!(frame.counters.iter().all(|&c| c == 42));
        assert_eq!(CounterFrame::default().counters[MAX_HASH_ITEMS - 1], 0);
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&SgStatus::Balance).expect("serialize");
        assert_eq!(json, "\"balance\"");
    }
}
