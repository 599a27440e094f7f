//! Weight-expansion planning.
//!
//! When local search is powerless (a weight-1 port cannot shed load), the
//! planner grows every port's slot allocation, lowest weights first: each
//! port asks to double, a weight-0 port asks for one slot. Expansion is all
//! or nothing: if the hash table cannot honour any single port's desired
//! increase, the whole plan is abandoned rather than leaving some ports
//! starved and biasing the next search.

use tracing::debug;

use crate::error::EcmpError;
use crate::types::{NextHopPlan, SgConfig, MAX_HASH_ITEMS};

struct PortGrowth {
    port_id: u32,
    current_weight: u32,
    new_weight: u32,
}

/// Lay out a grown slot allocation for the group, or fail if it cannot fit.
///
/// On success the plan's `link_items` hold one contiguous run of slots per
/// port, in ascending order of the ports' previous weights.
pub fn plan_expansion(config: &SgConfig) -> Result<NextHopPlan, EcmpError> {
    let max_total = MAX_HASH_ITEMS as u32;

    if config.ports.is_empty() {
        return Err(EcmpError::ExpandFailed(config.sg_id));
    }

    let mut growths: Vec<PortGrowth> = config
        .ports
        .iter()
        .map(|p| PortGrowth {
            port_id: p.port_id,
            current_weight: p.weight,
            new_weight: p.weight,
        })
        .collect();

    // Low-weight ports first: they are the ones the search cannot help.
    growths.sort_by_key(|g| g.current_weight);

    let mut total: u32 = growths.iter().map(|g| g.current_weight).sum();

    for growth in &mut growths {
        let desired = growth.current_weight.max(1);
        let available = max_total.saturating_sub(total);
        if available < desired {
            debug!(
                sg_id = config.sg_id,
                port_id = growth.port_id,
                desired,
                available,
                "expansion does not fit, abandoning"
            );
            return Err(EcmpError::ExpandFailed(config.sg_id));
        }
        growth.new_weight += desired;
        total += desired;
    }

    let mut plan = NextHopPlan::new(config.sg_id, config.seq_id);
    plan.item_num = total;
    let mut cursor = 0usize;
    for growth in &growths {
        for _ in 0..growth.new_weight {
            if cursor < MAX_HASH_ITEMS {
                plan.link_items[cursor] = growth.port_id;
                cursor += 1;
            }
        }
    }

    debug!(
        sg_id = config.sg_id,
        item_num = plan.item_num,
        "expansion planned"
    );
    Ok(plan)
}
