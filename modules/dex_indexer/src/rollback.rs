//! Rollback handling.
//!
//! Deletes everything recorded after a slot in a single transaction, then puts the survivors
//! back into the shape they had at that slot: pools point at their newest remaining state,
//! orders get their fill counters and cancellation flag rebuilt from the remaining matches
//! and statuses, and ticks that only covered deleted states go away.

use std::collections::BTreeSet;

use tracing::info;

use crate::error::StoreError;
use crate::store::Tables;
use dexwatch_common::{
    EntityId, OperationKind, OrderBookOrder, Slot, SlotConfig, StatusKind, TickResolution,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub deleted: usize,
    pub repaired_orders: usize,

    /// Newest surviving state of every pool that lost states
    pub refreshed_states: Vec<EntityId>,
}

/// Undo every row recorded after `slot`
pub fn rollback_after(
    tables: &mut Tables,
    slot: Slot,
    slot_config: SlotConfig,
) -> Result<RollbackReport, StoreError> {
    let mut report = RollbackReport::default();

    let removed_states = tables.pool_states.delete_where(|state| state.slot > slot);
    let affected_pools: BTreeSet<EntityId> =
        removed_states.iter().map(|state| state.pool_id).collect();
    report.deleted += removed_states.len();

    report.deleted += tables.swaps.delete_where(|row| row.meta.slot > slot).len();
    report.deleted += tables.deposits.delete_where(|row| row.meta.slot > slot).len();
    report.deleted += tables.withdraws.delete_where(|row| row.meta.slot > slot).len();
    report.deleted += tables.zaps.delete_where(|row| row.meta.slot > slot).len();
    report.deleted += tables.statuses.delete_where(|row| row.slot > slot).len();
    report.deleted += tables.matches.delete_where(|row| row.slot > slot).len();
    report.deleted += tables.orders.delete_where(|row| row.slot > slot).len();
    report.deleted += tables.order_books.delete_where(|row| row.created_slot > slot).len();
    report.deleted += tables.pools.delete_where(|row| row.created_slot > slot).len();
    let time = slot_config.slot_to_time(slot);
    report.deleted += tables.ticks.delete_where(|tick| tick.time > time).len();

    for pool_id in &affected_pools {
        let Some(pool) = tables.pools.get(*pool_id).cloned() else {
            continue;
        };
        let latest_state = tables.newest_state(pool.id).map(|state| state.id);
        if pool.latest_state != latest_state {
            tables.pools.update(dexwatch_common::LiquidityPool { latest_state, ..pool })?;
        }
        report.refreshed_states.extend(latest_state);
    }

    let stale: Vec<OrderBookOrder> =
        tables.orders.iter().filter(|order| order.updated_slot > slot).cloned().collect();
    for order in stale {
        let repaired = repair_order(tables, order);
        tables.orders.update(repaired)?;
        report.repaired_orders += 1;
    }

    // Ticks no surviving state falls into
    let orphaned: Vec<EntityId> = tables
        .ticks
        .iter()
        .filter(|tick| affected_pools.contains(&tick.pool_id))
        .filter(|tick| {
            !bucket_has_state(tables, tick.pool_id, tick.resolution, tick.time, slot_config)
        })
        .map(|tick| tick.id)
        .collect();
    for id in orphaned {
        tables.ticks.delete(id);
        report.deleted += 1;
    }

    if report.deleted > 0 {
        info!(
            "Rolled back to slot {slot}: {} rows deleted, {} orders repaired",
            report.deleted, report.repaired_orders
        );
    }
    Ok(report)
}

fn bucket_has_state(
    tables: &Tables,
    pool_id: EntityId,
    resolution: TickResolution,
    time: u64,
    slot_config: SlotConfig,
) -> bool {
    tables
        .states_of_pool(pool_id)
        .any(|state| resolution.bucket(slot_config.slot_to_time(state.slot)) == time)
}

/// Rebuild an order's mutable fields from its surviving matches and statuses
fn repair_order(tables: &Tables, order: OrderBookOrder) -> OrderBookOrder {
    let mut matches: Vec<_> = tables.matches_of_order(order.id).collect();
    matches.sort_by_key(|m| (m.slot, m.id));

    let mut unfilled = order.original_offer_amount;
    let mut fills = 0;
    let mut updated_slot = order.slot;
    for matched in &matches {
        if matched.consumes_order {
            unfilled = 0;
        } else {
            unfilled = unfilled.saturating_sub(matched.matched_amount);
            fills += 1;
        }
        updated_slot = updated_slot.max(matched.slot);
    }

    let cancelled = tables.status(order.id, OperationKind::OrderBookOrder, StatusKind::Cancelled);
    if let Some(status) = cancelled {
        updated_slot = updated_slot.max(status.slot);
    }

    OrderBookOrder {
        unfilled_offer_amount: unfilled,
        num_partial_fills: fills,
        is_cancelled: cancelled.is_some(),
        updated_slot,
        ..order
    }
}
