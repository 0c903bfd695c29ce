//! Operation reconciler.
//!
//! Turns ordered operations into rows, one operation at a time. Every write is an upsert by
//! natural key, so replaying a block leaves the model unchanged. Operations that name a pool
//! or order which is not there yet are retried a bounded number of times before being dropped.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::broadcast::Broadcaster;
use crate::error::{ReconcileError, StoreError};
use crate::jobs::{Job, JobRunner};
use crate::operation::*;
use crate::store::{tables::OrderKey, Row, Store, Tables};
use dexwatch_common::{
    Asset, AssetClass, Deposit, Dex, DexEvent, EntityId, LiquidityPool, LiquidityPoolState,
    OperationKind, OrderBook, OrderBookMatch, OrderBookOrder, OrderMeta, StatusKind, Swap, Token,
    TokenRef, UTxOIdentifier, Withdraw, Zap,
};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub max_resolve_attempts: u32,
    pub resolve_backoff: Duration,
    pub backup_dexes: HashMap<Dex, Dex>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_resolve_attempts: 3,
            resolve_backoff: Duration::from_millis(250),
            backup_dexes: HashMap::new(),
        }
    }
}

/// Running counters over all reconciled operations
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Operations whose references resolved on the first attempt
    pub first_attempt: u64,
    pub retries: u64,
    pub dropped: u64,
    pub conflicts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// New rows were written
    Persisted,

    /// Everything was already recorded
    Unchanged,

    /// Not relevant to the model, e.g. a cancellation of an unknown output
    Skipped,
}

/// Result of one write attempt
enum Step {
    Done {
        outcome: Outcome,
        events: Vec<DexEvent>,
        jobs: Vec<Job>,
    },
    Unresolved(String),
    Invalid(String),
}

impl Step {
    fn unchanged() -> Self {
        Step::Done {
            outcome: Outcome::Unchanged,
            events: Vec::new(),
            jobs: Vec::new(),
        }
    }

    fn skipped() -> Self {
        Step::Done {
            outcome: Outcome::Skipped,
            events: Vec::new(),
            jobs: Vec::new(),
        }
    }
}

pub struct Reconciler<S: Store> {
    store: Arc<S>,
    broadcaster: Arc<dyn Broadcaster>,
    jobs: Arc<JobRunner<S>>,
    config: ReconcilerConfig,
    stats: ReconcileStats,
}

impl<S: Store> Reconciler<S> {
    pub fn new(
        store: Arc<S>,
        broadcaster: Arc<dyn Broadcaster>,
        jobs: Arc<JobRunner<S>>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            broadcaster,
            jobs,
            config,
            stats: ReconcileStats::default(),
        }
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Persist one operation
    pub async fn reconcile(&mut self, operation: &Operation) -> Result<Outcome, ReconcileError> {
        let pool = match operation {
            Operation::Swap(op) => Some(&op.header.pool),
            Operation::Deposit(op) => Some(&op.header.pool),
            Operation::Withdraw(op) => Some(&op.header.pool),
            Operation::Zap(op) => Some(&op.header.pool),
            _ => None,
        };
        if pool.is_some_and(|pool| pool.identifier.is_none() && pool.pair.is_none()) {
            return Err(ReconcileError::MissingParameter("pool reference"));
        }

        self.ensure_assets(operation).await?;

        let max_attempts = self.config.max_resolve_attempts.max(1);
        let mut attempt = 1;
        loop {
            let step = self.persist(operation).await?;
            match step {
                Step::Done {
                    outcome,
                    events,
                    jobs,
                } => {
                    if attempt == 1 {
                        self.stats.first_attempt += 1;
                    }
                    for event in events {
                        self.broadcaster.publish(event);
                    }
                    for job in jobs {
                        self.jobs.enqueue(job).await;
                    }
                    return Ok(outcome);
                }
                Step::Invalid(reason) => return Err(ReconcileError::InvalidTransition(reason)),
                Step::Unresolved(what) => {
                    if attempt >= max_attempts {
                        self.stats.dropped += 1;
                        return Err(ReconcileError::ResolutionExhausted {
                            what,
                            attempts: attempt,
                        });
                    }
                    debug!("Could not resolve {what} (attempt {attempt}), retrying");
                    self.stats.retries += 1;
                    attempt += 1;
                    if !self.config.resolve_backoff.is_zero() {
                        tokio::time::sleep(self.config.resolve_backoff).await;
                    }
                }
            }
        }
    }

    /// One write transaction, retried once as a fresh transaction on a key conflict
    async fn persist(&mut self, operation: &Operation) -> Result<Step, ReconcileError> {
        let backups = &self.config.backup_dexes;
        let write = |tables: &mut Tables| write_operation(tables, operation, backups);

        match self.store.with_transaction(write).await {
            Err(StoreError::Conflict { table, key }) => {
                self.stats.conflicts += 1;
                warn!("Write conflict on {table} {key}, retrying once");
                match self.store.with_transaction(write).await {
                    Err(e @ StoreError::Conflict { .. }) => {
                        Err(ReconcileError::PersistenceConflict(e))
                    }
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }

    /// Find-or-create every asset the operation mentions. New assets start without registry
    /// facts; a lookup job fills them in later.
    async fn ensure_assets(&self, operation: &Operation) -> Result<(), ReconcileError> {
        for class in referenced_assets(operation) {
            let known = self.store.query(|tables| tables.assets.find(&class).is_some()).await;
            if known {
                continue;
            }

            let asset = Asset {
                id: 0,
                policy_id: class.policy_id,
                name: class.name.clone(),
                ticker: None,
                display_name: None,
                decimals: 0,
                is_verified: false,
            };
            let created =
                self.store.with_transaction(move |tables| tables.create_asset(asset)).await?;
            if let Some(asset) = created {
                self.jobs.enqueue(Job::AssetMetadata { asset }).await;
            }
        }
        Ok(())
    }
}

fn referenced_assets(operation: &Operation) -> Vec<AssetClass> {
    let tokens: Vec<&Token> = match operation {
        Operation::PoolState(op) => {
            let mut tokens = vec![&op.token_a, &op.token_b];
            tokens.extend(op.token_lp.as_ref());
            tokens
        }
        Operation::Swap(op) => vec![&op.in_token, &op.out_token],
        Operation::Deposit(op) => vec![&op.amounts[0].0, &op.amounts[1].0],
        Operation::Zap(op) => vec![&op.in_token, &op.out_token],
        Operation::OrderBookOrder(op) => vec![&op.from_token, &op.to_token],
        Operation::OrderBookMatch(op) => op.matched_token.iter().collect(),
        Operation::Withdraw(op) => op.header.pool.pair.iter().flat_map(|(a, b)| [a, b]).collect(),
        Operation::OrderCancellation(_) | Operation::OrderClose(_) => Vec::new(),
    };
    let mut assets: Vec<AssetClass> =
        tokens.into_iter().filter_map(|t| t.asset()).cloned().collect();
    assets.dedup();
    assets
}

fn write_operation(
    tables: &mut Tables,
    operation: &Operation,
    backups: &HashMap<Dex, Dex>,
) -> Result<Step, StoreError> {
    match operation {
        Operation::PoolState(op) => write_pool_state(tables, op),
        Operation::Swap(op) => {
            write_amm_order(tables, &op.header, backups, OperationKind::Swap, |tables, meta| {
                let swap = Swap {
                    id: 0,
                    meta,
                    in_token: token_ref(tables, &op.in_token)?,
                    out_token: token_ref(tables, &op.out_token)?,
                    in_amount: op.in_amount,
                    min_receive: op.min_receive,
                };
                let id = tables.swaps.insert(swap.clone())?;
                Ok(DexEvent::Swap(Swap { id, ..swap }))
            })
        }
        Operation::Deposit(op) => {
            write_amm_order(tables, &op.header, backups, OperationKind::Deposit, |tables, meta| {
                let pool = tables.pools.get(meta.pool_id).cloned();
                // Amounts follow the pool's token order
                let first = token_ref(tables, &op.amounts[0].0)?;
                let (amount_a, amount_b) = match pool {
                    Some(pool) if pool.token_a != first => (op.amounts[1].1, op.amounts[0].1),
                    _ => (op.amounts[0].1, op.amounts[1].1),
                };
                let deposit = Deposit {
                    id: 0,
                    meta,
                    amount_a,
                    amount_b,
                    min_lp_receive: op.min_lp_receive,
                };
                let id = tables.deposits.insert(deposit.clone())?;
                Ok(DexEvent::Deposit(Deposit { id, ..deposit }))
            })
        }
        Operation::Withdraw(op) => {
            write_amm_order(tables, &op.header, backups, OperationKind::Withdraw, |tables, meta| {
                let withdraw = Withdraw {
                    id: 0,
                    meta,
                    lp_amount: op.lp_amount,
                    min_receive_a: op.min_receive_a,
                    min_receive_b: op.min_receive_b,
                };
                let id = tables.withdraws.insert(withdraw.clone())?;
                Ok(DexEvent::Withdraw(Withdraw { id, ..withdraw }))
            })
        }
        Operation::Zap(op) => {
            write_amm_order(tables, &op.header, backups, OperationKind::Zap, |tables, meta| {
                let zap = Zap {
                    id: 0,
                    meta,
                    in_token: token_ref(tables, &op.in_token)?,
                    out_token: token_ref(tables, &op.out_token)?,
                    in_amount: op.in_amount,
                    min_lp_receive: op.min_lp_receive,
                };
                let id = tables.zaps.insert(zap.clone())?;
                Ok(DexEvent::Zap(Zap { id, ..zap }))
            })
        }
        Operation::OrderBookOrder(op) => write_order(tables, op),
        Operation::OrderBookMatch(op) => write_match(tables, op),
        Operation::OrderCancellation(op) => write_cancellation(tables, op),
        Operation::OrderClose(op) => write_close(tables, op),
    }
}

fn token_ref(tables: &Tables, token: &Token) -> Result<TokenRef, StoreError> {
    tables.token_ref(token).ok_or_else(|| StoreError::NotFound {
        table: "assets",
        id: 0,
    })
}

fn write_pool_state(tables: &mut Tables, op: &PoolStateOp) -> Result<Step, StoreError> {
    let mut token_a = token_ref(tables, &op.token_a)?;
    let mut token_b = token_ref(tables, &op.token_b)?;
    let (mut reserve_a, mut reserve_b) = (op.reserve_a, op.reserve_b);
    // Ada is always side A
    if token_b.is_none() {
        std::mem::swap(&mut token_a, &mut token_b);
        std::mem::swap(&mut reserve_a, &mut reserve_b);
    }
    let Some(token_b) = token_b else {
        return Ok(Step::Invalid(format!("pool {} trades ada against ada", op.identifier)));
    };
    let token_lp = match &op.token_lp {
        Some(token) => token_ref(tables, token)?,
        None => None,
    };

    let pool_id = match tables.pool_by_identifier(op.dex, &op.identifier) {
        Some(pool) => pool.id,
        None => tables.pools.insert(LiquidityPool {
            id: 0,
            dex: op.dex,
            identifier: op.identifier.clone(),
            address: op.address.clone(),
            token_a,
            token_b,
            token_lp,
            created_slot: op.position.slot,
            latest_state: None,
        })?,
    };
    if tables.pool_states.find(&(pool_id, op.position.tx_hash)).is_some() {
        return Ok(Step::unchanged());
    }

    let mut state = LiquidityPoolState {
        id: 0,
        pool_id,
        slot: op.position.slot,
        tx_hash: op.position.tx_hash,
        reserve_a,
        reserve_b,
        lp_tokens: op.lp_tokens,
        fee_percent: op.fee_percent,
        tvl: None,
        source_inputs: op.source_inputs.clone(),
    };
    state.id = tables.pool_states.insert(state.clone())?;

    let mut pool = tables
        .pools
        .get(pool_id)
        .cloned()
        .ok_or(StoreError::NotFound {
            table: "pools",
            id: pool_id,
        })?;
    let supersedes = match pool.latest_state.and_then(|id| tables.pool_states.get(id)) {
        Some(latest) => (state.slot, state.id) > (latest.slot, latest.id),
        None => true,
    };
    if supersedes {
        pool.latest_state = Some(state.id);
        tables.pools.update(pool.clone())?;
    }

    let mut events = vec![DexEvent::PoolState {
        pool,
        state: state.clone(),
    }];

    // Orders consumed by this state are settled
    for input in &op.source_inputs {
        if let Some((kind, id)) = amm_order_of(tables, op.dex, input) {
            let status = tables.upsert_status(
                id,
                kind,
                StatusKind::Complete,
                state.slot,
                state.tx_hash,
                Some(op.position.output_index),
            )?;
            events.extend(status.map(DexEvent::Status));
        }
    }

    Ok(Step::Done {
        outcome: Outcome::Persisted,
        events,
        jobs: vec![Job::PoolTvl { state: state.id }, Job::PoolTicks { state: state.id }],
    })
}

/// AMM order of `dex` created at `utxo`
fn amm_order_of(
    tables: &Tables,
    dex: Dex,
    utxo: &UTxOIdentifier,
) -> Option<(OperationKind, EntityId)> {
    let (kind, id) = tables.amm_order_at(utxo)?;
    let order_dex = match kind {
        OperationKind::Swap => tables.swaps.get(id).map(|row| row.meta.dex),
        OperationKind::Deposit => tables.deposits.get(id).map(|row| row.meta.dex),
        OperationKind::Withdraw => tables.withdraws.get(id).map(|row| row.meta.dex),
        OperationKind::Zap => tables.zaps.get(id).map(|row| row.meta.dex),
        OperationKind::OrderBookOrder => None,
    }?;
    (order_dex == dex).then_some((kind, id))
}

/// Pool an AMM order refers to: exact identifier, then pair, then the backup dex
fn resolve_pool(
    tables: &Tables,
    dex: Dex,
    pool: &PoolRef,
    backups: &HashMap<Dex, Dex>,
) -> Option<EntityId> {
    let pair = pool
        .pair
        .as_ref()
        .and_then(|(a, b)| Some((tables.token_ref(a)?, tables.token_ref(b)?)));

    std::iter::once(dex).chain(backups.get(&dex).copied()).find_map(|candidate| {
        pool.identifier
            .as_ref()
            .and_then(|identifier| tables.pool_by_identifier(candidate, identifier))
            .or_else(|| pair.and_then(|(a, b)| tables.pool_by_pair(candidate, a, b)))
            .map(|found| found.id)
    })
}

fn write_amm_order(
    tables: &mut Tables,
    header: &OrderHeader,
    backups: &HashMap<Dex, Dex>,
    kind: OperationKind,
    insert: impl FnOnce(&mut Tables, OrderMeta) -> Result<DexEvent, StoreError>,
) -> Result<Step, StoreError> {
    let utxo = header.position.utxo();
    if tables.amm_order_at(&utxo).is_some() {
        return Ok(Step::unchanged());
    }
    let Some(pool_id) = resolve_pool(tables, header.dex, &header.pool, backups) else {
        return Ok(Step::Unresolved(format!("{} pool for order {utxo}", header.dex)));
    };

    let meta = OrderMeta {
        dex: header.dex,
        pool_id,
        sender_pub_key_hash: header.sender.pub_key_hash,
        sender_stake_key_hash: header.sender.stake_key_hash,
        slot: header.position.slot,
        tx_hash: header.position.tx_hash,
        output_index: header.position.output_index,
        batcher_fee: header.batcher_fee,
        deposit: header.deposit,
    };
    let event = insert(tables, meta)?;
    let (_, id) = tables.amm_order_at(&utxo).ok_or(StoreError::NotFound {
        table: "orders",
        id: 0,
    })?;

    let mut events = vec![event];
    events.extend(
        tables
            .upsert_status(
                id,
                kind,
                StatusKind::OnChain,
                header.position.slot,
                header.position.tx_hash,
                Some(header.position.output_index),
            )?
            .map(DexEvent::Status),
    );

    // Settled by a state that is already recorded, whose buckets now have more volume
    let mut jobs = Vec::new();
    let settling = tables
        .state_spending(pool_id, &utxo)
        .map(|state| (state.id, state.slot, state.tx_hash));
    if let Some((state, slot, tx_hash)) = settling {
        events.extend(
            tables
                .upsert_status(id, kind, StatusKind::Complete, slot, tx_hash, None)?
                .map(DexEvent::Status),
        );
        if kind == OperationKind::Swap {
            jobs.push(Job::PoolTicks { state });
        }
    }

    Ok(Step::Done {
        outcome: Outcome::Persisted,
        events,
        jobs,
    })
}

fn order_key(dex: Dex, target: &OrderTarget) -> OrderKey {
    match target {
        OrderTarget::Identifier(identifier) => OrderKey::Identifier(dex, identifier.clone()),
        OrderTarget::Origin {
            tx_hash,
            output_index,
            ..
        } => OrderKey::Origin(dex, *tx_hash, *output_index),
    }
}

/// Order a match or cancellation refers to, whatever its state
fn find_order<'a>(
    tables: &'a Tables,
    dex: Dex,
    target: &OrderTarget,
) -> Option<&'a OrderBookOrder> {
    let order = tables.orders.find(&order_key(dex, target))?;
    match target {
        OrderTarget::Origin { sender, .. } => {
            let agrees = |ours: Option<_>, theirs: Option<_>| match (ours, theirs) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            };
            (agrees(sender.pub_key_hash, order.sender_pub_key_hash)
                && agrees(sender.stake_key_hash, order.sender_stake_key_hash))
            .then_some(order)
        }
        OrderTarget::Identifier(_) => Some(order),
    }
}

fn write_order(tables: &mut Tables, op: &OrderBookOrderOp) -> Result<Step, StoreError> {
    let from_token = token_ref(tables, &op.from_token)?;
    let to_token = token_ref(tables, &op.to_token)?;

    let book = OrderBook {
        id: 0,
        dex: op.dex,
        token_a: from_token,
        token_b: to_token,
        created_slot: op.position.slot,
    };
    let order_book_id = match tables.order_books.find(&book.key()) {
        Some(existing) => existing.id,
        None => tables.order_books.insert(book)?,
    };

    let order = OrderBookOrder {
        id: 0,
        order_book_id,
        dex: op.dex,
        identifier: op.identifier.clone(),
        from_token,
        to_token,
        original_offer_amount: op.original_offer_amount,
        unfilled_offer_amount: op.unfilled_offer_amount,
        asked_amount: op.asked_amount,
        price: op.price,
        num_partial_fills: op.num_partial_fills,
        is_cancelled: false,
        sender_pub_key_hash: op.sender.pub_key_hash,
        sender_stake_key_hash: op.sender.stake_key_hash,
        slot: op.position.slot,
        updated_slot: op.position.slot,
        tx_hash: op.position.tx_hash,
        output_index: op.position.output_index,
    };

    let key = order.key();
    if let Some(existing) = tables.orders.find(&key).cloned() {
        // A re-statement of a known order refreshes its snapshot
        if existing.slot == op.position.slot && existing.tx_hash == op.position.tx_hash {
            return Ok(Step::unchanged());
        }
        if !existing.is_open() {
            return Ok(Step::Invalid(format!("re-statement of closed order {}", existing.id)));
        }
        if existing.updated_slot >= op.position.slot
            && existing.unfilled_offer_amount == op.unfilled_offer_amount
        {
            return Ok(Step::unchanged());
        }
        let updated = OrderBookOrder {
            unfilled_offer_amount: op.unfilled_offer_amount,
            num_partial_fills: op.num_partial_fills,
            updated_slot: op.position.slot,
            ..existing
        };
        tables.orders.update(updated.clone())?;
        return Ok(Step::Done {
            outcome: Outcome::Persisted,
            events: vec![DexEvent::Order(updated)],
            jobs: Vec::new(),
        });
    }

    let id = tables.orders.insert(order.clone())?;
    let mut events = vec![DexEvent::Order(OrderBookOrder { id, ..order })];
    events.extend(
        tables
            .upsert_status(
                id,
                OperationKind::OrderBookOrder,
                StatusKind::OnChain,
                op.position.slot,
                op.position.tx_hash,
                Some(op.position.output_index),
            )?
            .map(DexEvent::Status),
    );
    Ok(Step::Done {
        outcome: Outcome::Persisted,
        events,
        jobs: Vec::new(),
    })
}

fn write_match(tables: &mut Tables, op: &OrderBookMatchOp) -> Result<Step, StoreError> {
    let Some(order) = find_order(tables, op.dex, &op.order).cloned() else {
        return Ok(Step::Unresolved(format!("{} order {:?}", op.dex, op.order)));
    };
    if tables.matches.find(&(order.id, op.position.tx_hash)).is_some() {
        return Ok(Step::unchanged());
    }
    if !order.is_open() {
        return Ok(Step::Invalid(format!("match against closed order {}", order.id)));
    }

    let matched_token = match &op.matched_token {
        Some(token) => token_ref(tables, token)?,
        None => order.from_token,
    };
    // Without an explicit amount the fill is what the offer shrank by
    let matched_amount = match (op.matched_amount, op.consumes_order) {
        (Some(amount), _) => amount,
        (None, true) => order.unfilled_offer_amount,
        (None, false) => {
            let remaining = op.remaining.unwrap_or(order.unfilled_offer_amount);
            order.unfilled_offer_amount.saturating_sub(remaining)
        }
    };
    let unfilled = if op.consumes_order {
        0
    } else {
        op.remaining
            .unwrap_or_else(|| order.unfilled_offer_amount.saturating_sub(matched_amount))
    };

    let matched = OrderBookMatch {
        id: 0,
        order_id: order.id,
        order_book_id: order.order_book_id,
        matched_token,
        matched_amount,
        receiver_amount: None,
        consumes_order: op.consumes_order || unfilled == 0,
        continuing_output: (!op.consumes_order).then_some(op.position.output_index),
        slot: op.position.slot,
        tx_hash: op.position.tx_hash,
    };
    let match_id = tables.matches.insert(matched.clone())?;

    let updated = OrderBookOrder {
        unfilled_offer_amount: unfilled,
        num_partial_fills: order.num_partial_fills + u32::from(!op.consumes_order),
        updated_slot: op.position.slot,
        ..order
    };
    tables.orders.update(updated.clone())?;

    let mut events = vec![
        DexEvent::Match(OrderBookMatch {
            id: match_id,
            ..matched
        }),
        DexEvent::Order(updated.clone()),
    ];
    if updated.is_filled() {
        events.extend(
            tables
                .upsert_status(
                    updated.id,
                    OperationKind::OrderBookOrder,
                    StatusKind::Complete,
                    op.position.slot,
                    op.position.tx_hash,
                    None,
                )?
                .map(DexEvent::Status),
        );
    }

    Ok(Step::Done {
        outcome: Outcome::Persisted,
        events,
        jobs: vec![Job::MatchSettlement { matched: match_id }],
    })
}

fn write_cancellation(tables: &mut Tables, op: &OrderCancellationOp) -> Result<Step, StoreError> {
    match &op.target {
        CancelTarget::Order(target) => {
            let Some(order) = find_order(tables, op.dex, target).cloned() else {
                return Ok(Step::Unresolved(format!("{} order {target:?}", op.dex)));
            };
            cancel_order(tables, order, op.position)
        }
        CancelTarget::AmmOrder(utxo) => {
            let Some((kind, id)) = amm_order_of(tables, op.dex, utxo) else {
                return Ok(Step::skipped());
            };
            if tables.status(id, kind, StatusKind::Complete).is_some() {
                return Ok(Step::Invalid(format!("cancellation of settled order {utxo}")));
            }
            match tables.upsert_status(
                id,
                kind,
                StatusKind::Cancelled,
                op.position.slot,
                op.position.tx_hash,
                None,
            )? {
                Some(status) => Ok(Step::Done {
                    outcome: Outcome::Persisted,
                    events: vec![DexEvent::Status(status)],
                    jobs: Vec::new(),
                }),
                None => Ok(Step::unchanged()),
            }
        }
    }
}

fn cancel_order(
    tables: &mut Tables,
    order: OrderBookOrder,
    position: Position,
) -> Result<Step, StoreError> {
    if order.is_cancelled {
        return Ok(Step::unchanged());
    }
    if order.is_filled() {
        return Ok(Step::Invalid(format!("cancellation of filled order {}", order.id)));
    }
    let cancelled = OrderBookOrder {
        is_cancelled: true,
        updated_slot: position.slot,
        ..order
    };
    tables.orders.update(cancelled.clone())?;
    let mut events = vec![DexEvent::Order(cancelled.clone())];
    events.extend(
        tables
            .upsert_status(
                cancelled.id,
                OperationKind::OrderBookOrder,
                StatusKind::Cancelled,
                position.slot,
                position.tx_hash,
                None,
            )?
            .map(DexEvent::Status),
    );
    Ok(Step::Done {
        outcome: Outcome::Persisted,
        events,
        jobs: Vec::new(),
    })
}

/// Burned order token: the spend that unlocked the order's current output says whether it
/// was filled or cancelled. Closes without such a spend count as fills.
fn write_close(tables: &mut Tables, op: &OrderCloseOp) -> Result<Step, StoreError> {
    let Some(order) = find_order(tables, op.dex, &op.order).cloned() else {
        return Ok(Step::Unresolved(format!("{} order {:?}", op.dex, op.order)));
    };
    let utxo = tables.order_utxo(&order);
    let action = op
        .spends
        .iter()
        .find(|(input, _)| *input == utxo)
        .map(|(_, action)| *action);

    match action {
        Some(CloseAction::Cancel) => cancel_order(tables, order, op.position),
        Some(CloseAction::Fill) | None => {
            if order.is_cancelled {
                return Ok(Step::unchanged());
            }
            write_match(
                tables,
                &OrderBookMatchOp {
                    dex: op.dex,
                    order: op.order.clone(),
                    matched_token: None,
                    matched_amount: None,
                    remaining: Some(0),
                    consumes_order: true,
                    position: op.position,
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::RecordingBroadcaster;
    use crate::error::MetadataError;
    use crate::metadata::{AssetInfo, MetadataSource, NoMetadata};
    use crate::store::MemoryStore;
    use caryatid_sdk::async_trait;
    use dexwatch_common::{AssetName, PolicyId, SlotConfig, TickResolution, TxHash};

    struct Harness {
        store: Arc<MemoryStore>,
        jobs: Arc<JobRunner<MemoryStore>>,
        broadcaster: Arc<RecordingBroadcaster>,
        reconciler: Reconciler<MemoryStore>,
    }

    /// Registry that never answers
    struct SilentRegistry;

    #[async_trait]
    impl MetadataSource for SilentRegistry {
        async fn fetch(&self, _asset: &AssetClass) -> Result<AssetInfo, MetadataError> {
            std::future::pending().await
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(NoMetadata))
    }

    fn harness_with(metadata: Arc<dyn MetadataSource>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(JobRunner::new(store.clone(), metadata, 4, 1, SlotConfig::MAINNET));
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let reconciler = Reconciler::new(
            store.clone(),
            broadcaster.clone(),
            jobs.clone(),
            ReconcilerConfig {
                resolve_backoff: Duration::ZERO,
                ..Default::default()
            },
        );
        Harness {
            store,
            jobs,
            broadcaster,
            reconciler,
        }
    }

    fn token() -> Token {
        Token::Asset(AssetClass::new(PolicyId::new([5; 28]), AssetName::new(b"TKN").unwrap()))
    }

    fn position(tx: u8, slot: u64, output_index: u16) -> Position {
        Position {
            slot,
            tx_hash: TxHash::new([tx; 32]),
            output_index,
        }
    }

    fn pool_state(tx: u8, slot: u64, inputs: Vec<UTxOIdentifier>) -> Operation {
        Operation::PoolState(PoolStateOp {
            dex: Dex::Minswap,
            identifier: "pool".into(),
            address: "addr_pool".into(),
            token_a: Token::Lovelace,
            token_b: token(),
            token_lp: None,
            reserve_a: 1_000,
            reserve_b: 2_000,
            lp_tokens: Some(10),
            fee_percent: 0.3,
            position: position(tx, slot, 0),
            source_inputs: inputs,
        })
    }

    fn swap(tx: u8, slot: u64, pool: PoolRef) -> Operation {
        Operation::Swap(SwapOp {
            header: OrderHeader {
                dex: Dex::Minswap,
                pool,
                sender: SenderKeys::default(),
                position: position(tx, slot, 1),
                batcher_fee: 2,
                deposit: 2,
            },
            in_token: Token::Lovelace,
            out_token: token(),
            in_amount: 100,
            min_receive: 1,
        })
    }

    fn order(tx: u8, slot: u64) -> Operation {
        Operation::OrderBookOrder(OrderBookOrderOp {
            dex: Dex::GeniusYield,
            identifier: Some("nft".into()),
            from_token: Token::Lovelace,
            to_token: token(),
            original_offer_amount: 1_000,
            unfilled_offer_amount: 1_000,
            asked_amount: 2_000,
            price: 2.0,
            num_partial_fills: 0,
            sender: SenderKeys::default(),
            position: position(tx, slot, 0),
        })
    }

    fn fill(
        tx: u8,
        slot: u64,
        amount: Option<u64>,
        remaining: Option<u64>,
        consumes: bool,
    ) -> Operation {
        Operation::OrderBookMatch(OrderBookMatchOp {
            dex: Dex::GeniusYield,
            order: OrderTarget::Identifier("nft".into()),
            matched_token: None,
            matched_amount: amount,
            remaining,
            consumes_order: consumes,
            position: position(tx, slot, 0),
        })
    }

    #[tokio::test]
    async fn pool_state_creates_pool_and_schedules_jobs() {
        let mut h = harness();
        let outcome = h.reconciler.reconcile(&pool_state(1, 500, vec![])).await.unwrap();
        assert_eq!(outcome, Outcome::Persisted);
        h.jobs.drain().await;

        h.store
            .query(|t| {
                assert_eq!(t.pools.len(), 1);
                assert_eq!(t.assets.len(), 1);
                let pool = t.pools.iter().next().unwrap();
                assert_eq!(pool.token_a, None);
                let state = t.pool_states.get(pool.latest_state.unwrap()).unwrap();
                assert_eq!(state.tvl, Some(2_000));
                assert_eq!(t.ticks.len(), 3);
            })
            .await;
        assert_eq!(h.jobs.scheduled(crate::jobs::JobKind::PoolTvl), 1);
        assert!(matches!(h.broadcaster.events()[0], DexEvent::PoolState { .. }));
    }

    #[tokio::test]
    async fn replaying_operations_is_a_no_op() {
        let mut h = harness();
        let operations = [
            pool_state(1, 500, vec![]),
            swap(2, 510, PoolRef::by_identifier("pool")),
            order(3, 520),
            fill(4, 530, Some(100), Some(900), false),
        ];
        for op in &operations {
            assert_eq!(h.reconciler.reconcile(op).await.unwrap(), Outcome::Persisted);
        }
        for op in &operations {
            assert_eq!(h.reconciler.reconcile(op).await.unwrap(), Outcome::Unchanged);
        }
        h.store
            .query(|t| {
                assert_eq!(t.pool_states.len(), 1);
                assert_eq!(t.swaps.len(), 1);
                assert_eq!(t.orders.len(), 1);
                assert_eq!(t.matches.len(), 1);
                assert_eq!(t.statuses.len(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn swap_resolves_by_pair_in_either_order() {
        let mut h = harness();
        h.reconciler.reconcile(&pool_state(1, 500, vec![])).await.unwrap();
        let by_pair = swap(2, 510, PoolRef::by_pair(token(), Token::Lovelace));
        assert_eq!(h.reconciler.reconcile(&by_pair).await.unwrap(), Outcome::Persisted);
        assert_eq!(h.reconciler.stats().retries, 0);
    }

    #[tokio::test]
    async fn unknown_pool_is_dropped_after_bounded_retries() {
        let mut h = harness();
        let result = h.reconciler.reconcile(&swap(2, 510, PoolRef::by_identifier("nope"))).await;
        assert!(matches!(
            result,
            Err(ReconcileError::ResolutionExhausted { attempts: 3, .. })
        ));
        let stats = h.reconciler.stats();
        assert_eq!((stats.retries, stats.dropped, stats.first_attempt), (2, 1, 0));
        assert_eq!(h.store.query(|t| t.swaps.len()).await, 0);
    }

    #[tokio::test]
    async fn order_without_pool_reference_is_rejected() {
        let mut h = harness();
        let result = h.reconciler.reconcile(&swap(2, 510, PoolRef::default())).await;
        assert!(matches!(result, Err(ReconcileError::MissingParameter(_))));
        assert_eq!(h.reconciler.stats(), ReconcileStats::default());
    }

    #[tokio::test]
    async fn backup_dex_resolves_pool() {
        let mut h = harness();
        h.reconciler.config.backup_dexes.insert(Dex::SundaeSwapV3, Dex::Minswap);
        h.reconciler.reconcile(&pool_state(1, 500, vec![])).await.unwrap();
        let Operation::Swap(mut op) = swap(2, 510, PoolRef::by_identifier("pool")) else {
            unreachable!()
        };
        op.header.dex = Dex::SundaeSwapV3;
        let outcome = h.reconciler.reconcile(&Operation::Swap(op)).await.unwrap();
        assert_eq!(outcome, Outcome::Persisted);
    }

    #[tokio::test]
    async fn settling_state_completes_order() {
        let mut h = harness();
        h.reconciler.reconcile(&pool_state(1, 500, vec![])).await.unwrap();
        h.reconciler.reconcile(&swap(2, 510, PoolRef::by_identifier("pool"))).await.unwrap();
        let settled = UTxOIdentifier::new(TxHash::new([2; 32]), 1);
        h.reconciler.reconcile(&pool_state(3, 520, vec![settled])).await.unwrap();

        h.store
            .query(|t| {
                let swap = t.swaps.iter().next().unwrap();
                let complete =
                    t.status(swap.id, OperationKind::Swap, StatusKind::Complete).unwrap();
                assert_eq!(complete.tx_hash, TxHash::new([3; 32]));
                assert_eq!(complete.slot, 520);
            })
            .await;
    }

    #[tokio::test]
    async fn amm_cancellation_of_unknown_output_is_skipped() {
        let mut h = harness();
        let cancel = Operation::OrderCancellation(OrderCancellationOp {
            dex: Dex::Minswap,
            target: CancelTarget::AmmOrder(UTxOIdentifier::new(TxHash::new([9; 32]), 0)),
            position: position(9, 600, 0),
        });
        assert_eq!(h.reconciler.reconcile(&cancel).await.unwrap(), Outcome::Skipped);
        assert_eq!(h.reconciler.stats().retries, 0);
    }

    #[tokio::test]
    async fn order_fill_state_machine() {
        let mut h = harness();
        h.reconciler.reconcile(&order(1, 100)).await.unwrap();

        // Partial fill without an explicit amount derives it from the remainder
        h.reconciler.reconcile(&fill(2, 110, None, Some(700), false)).await.unwrap();
        // Full consumption takes what is left
        h.reconciler.reconcile(&fill(3, 120, None, Some(0), true)).await.unwrap();
        h.jobs.drain().await;

        h.store
            .query(|t| {
                let order = t.orders.iter().next().unwrap();
                assert_eq!(order.unfilled_offer_amount, 0);
                assert_eq!(order.num_partial_fills, 1);
                assert_eq!(order.updated_slot, 120);
                let amounts: Vec<_> = t.matches.iter().map(|m| m.matched_amount).collect();
                assert_eq!(amounts, vec![300, 700]);
                let received: Vec<_> = t.matches.iter().map(|m| m.receiver_amount).collect();
                assert_eq!(received, vec![Some(600), Some(1_400)]);
                let status = StatusKind::Complete;
                assert!(t.status(order.id, OperationKind::OrderBookOrder, status).is_some());
            })
            .await;

        // A filled order is never matched again
        let again = h.reconciler.reconcile(&fill(4, 130, Some(1), None, false)).await;
        assert!(matches!(again, Err(ReconcileError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn cancelled_order_is_kept_but_not_matched() {
        let mut h = harness();
        h.reconciler.reconcile(&order(1, 100)).await.unwrap();
        let cancel = Operation::OrderCancellation(OrderCancellationOp {
            dex: Dex::GeniusYield,
            target: CancelTarget::Order(OrderTarget::Identifier("nft".into())),
            position: position(2, 110, 0),
        });
        assert_eq!(h.reconciler.reconcile(&cancel).await.unwrap(), Outcome::Persisted);
        assert_eq!(h.reconciler.reconcile(&cancel).await.unwrap(), Outcome::Unchanged);

        let result = h.reconciler.reconcile(&fill(3, 120, Some(5), None, false)).await;
        assert!(matches!(result, Err(ReconcileError::InvalidTransition(_))));
        h.store
            .query(|t| {
                let order = t.orders.iter().next().unwrap();
                assert!(order.is_cancelled);
                assert!(t.matches.is_empty());
            })
            .await;
    }

    fn close(tx: u8, slot: u64, spends: Vec<(UTxOIdentifier, CloseAction)>) -> Operation {
        Operation::OrderClose(OrderCloseOp {
            dex: Dex::GeniusYield,
            order: OrderTarget::Identifier("nft".into()),
            spends,
            position: position(tx, slot, 0),
        })
    }

    #[tokio::test]
    async fn close_follows_the_spend_of_the_order_output() {
        let mut h = harness();
        h.reconciler.reconcile(&order(1, 100)).await.unwrap();

        // Another script's cancel sorts first; the order's own output was completed
        let other = UTxOIdentifier::new(TxHash::new([0; 32]), 0);
        let own = UTxOIdentifier::new(TxHash::new([1; 32]), 0);
        let op = close(2, 110, vec![(other, CloseAction::Cancel), (own, CloseAction::Fill)]);
        assert_eq!(h.reconciler.reconcile(&op).await.unwrap(), Outcome::Persisted);
        assert_eq!(h.reconciler.reconcile(&op).await.unwrap(), Outcome::Unchanged);

        h.store
            .query(|t| {
                let order = t.orders.iter().next().unwrap();
                assert!(!order.is_cancelled);
                assert!(order.is_filled());
                let matched = t.matches.iter().next().unwrap();
                assert_eq!(matched.matched_amount, 1_000);
                assert!(matched.consumes_order);
                assert_eq!(matched.continuing_output, None);
            })
            .await;
    }

    #[tokio::test]
    async fn close_after_partial_fill_reads_the_continuing_output() {
        let mut h = harness();
        h.reconciler.reconcile(&order(1, 100)).await.unwrap();
        h.reconciler.reconcile(&fill(2, 110, None, Some(700), false)).await.unwrap();

        let opened = UTxOIdentifier::new(TxHash::new([1; 32]), 0);
        let continuing = UTxOIdentifier::new(TxHash::new([2; 32]), 0);
        let spends = vec![(opened, CloseAction::Fill), (continuing, CloseAction::Cancel)];
        let op = close(3, 120, spends);
        assert_eq!(h.reconciler.reconcile(&op).await.unwrap(), Outcome::Persisted);

        h.store
            .query(|t| {
                let order = t.orders.iter().next().unwrap();
                assert!(order.is_cancelled);
                assert_eq!(order.unfilled_offer_amount, 700);
                assert_eq!(t.matches.len(), 1);
                let status = StatusKind::Cancelled;
                assert!(t.status(order.id, OperationKind::OrderBookOrder, status).is_some());
            })
            .await;
    }

    #[tokio::test]
    async fn silent_registry_does_not_hold_up_writes() {
        let mut h = harness_with(Arc::new(SilentRegistry));
        let state = pool_state(1, 500, vec![]);
        let write = h.reconciler.reconcile(&state);
        let outcome = tokio::time::timeout(Duration::from_secs(5), write).await;
        assert_eq!(outcome.expect("write finished").unwrap(), Outcome::Persisted);
        tokio::time::timeout(Duration::from_secs(5), h.jobs.drain())
            .await
            .expect("drain finished");

        h.store
            .query(|t| {
                let asset = t.assets.iter().next().unwrap();
                assert_eq!(asset.decimals, 0);
                assert!(!asset.is_verified);
                let pool = t.pools.iter().next().unwrap();
                assert!(pool.latest_state.is_some());
            })
            .await;
        assert_eq!(h.jobs.scheduled(crate::jobs::JobKind::AssetMetadata), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn settled_swap_volume_does_not_depend_on_job_timing() {
        let slots = SlotConfig::MAINNET;
        let settled = UTxOIdentifier::new(TxHash::new([2; 32]), 1);
        let bucket = TickResolution::Minute.bucket(slots.slot_to_time(520));
        let minute_volume = |t: &Tables| {
            t.ticks
                .iter()
                .find(|tick| tick.resolution == TickResolution::Minute && tick.time == bucket)
                .map(|tick| tick.volume)
        };

        for round in 0..50 {
            // Settling state before the swap, then after it
            let blocks = [
                [
                    pool_state(1, 500, vec![]),
                    pool_state(3, 520, vec![settled]),
                    swap(2, 510, PoolRef::by_identifier("pool")),
                ],
                [
                    pool_state(1, 500, vec![]),
                    swap(2, 510, PoolRef::by_identifier("pool")),
                    pool_state(3, 520, vec![settled]),
                ],
            ];
            for block in &blocks {
                let mut h = harness();
                for op in block {
                    h.reconciler.reconcile(op).await.unwrap();
                }
                h.jobs.drain().await;
                assert_eq!(h.store.query(minute_volume).await, Some(100), "round {round}");
            }
        }
    }
}
