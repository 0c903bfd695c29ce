//! Derived-data jobs.
//!
//! The reconciler schedules jobs after a successful write. They are held back until
//! [`JobRunner::drain`], which the pipeline calls once a block's operations are all written,
//! and then run on a bounded pool. Each job recomputes its output from the rows it names, so
//! running one twice or after a rollback converges on the same result. A job whose rows no
//! longer exist does nothing.
//!
//! Asset metadata lookups are the exception: they start right away in the background and no
//! drain waits for them, so a slow registry never holds up a block.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::metadata::{AssetInfo, MetadataSource};
use crate::store::{Store, Tables};
use dexwatch_common::{
    Asset, AssetClass, EntityId, LiquidityPoolState, OperationKind, SlotConfig, Tick,
    TickResolution,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    /// Value the locked reserves of a pool state in lovelace
    PoolTvl { state: EntityId },

    /// Refresh the OHLC buckets a pool state falls in
    PoolTicks { state: EntityId },

    /// Work out what the maker received for a match
    MatchSettlement { matched: EntityId },

    /// Fill in registry facts for a freshly created asset
    AssetMetadata { asset: EntityId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    PoolTvl,
    PoolTicks,
    MatchSettlement,
    AssetMetadata,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::PoolTvl { .. } => JobKind::PoolTvl,
            Job::PoolTicks { .. } => JobKind::PoolTicks,
            Job::MatchSettlement { .. } => JobKind::MatchSettlement,
            Job::AssetMetadata { .. } => JobKind::AssetMetadata,
        }
    }
}

#[derive(Default)]
struct Counters {
    pool_tvl: AtomicU64,
    pool_ticks: AtomicU64,
    match_settlement: AtomicU64,
    asset_metadata: AtomicU64,
}

impl Counters {
    fn of(&self, kind: JobKind) -> &AtomicU64 {
        match kind {
            JobKind::PoolTvl => &self.pool_tvl,
            JobKind::PoolTicks => &self.pool_ticks,
            JobKind::MatchSettlement => &self.match_settlement,
            JobKind::AssetMetadata => &self.asset_metadata,
        }
    }
}

pub struct JobRunner<S: Store> {
    store: Arc<S>,
    metadata: Arc<dyn MetadataSource>,
    permits: Arc<Semaphore>,
    pending: Mutex<Vec<Job>>,
    lookup_permits: Arc<Semaphore>,
    lookups: Mutex<JoinSet<()>>,
    attempts: u32,
    slot_config: SlotConfig,
    scheduled: Counters,
}

impl<S: Store> JobRunner<S> {
    pub fn new(
        store: Arc<S>,
        metadata: Arc<dyn MetadataSource>,
        concurrency: usize,
        attempts: u32,
        slot_config: SlotConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            pending: Mutex::new(Vec::new()),
            lookup_permits: Arc::new(Semaphore::new(concurrency.max(1))),
            lookups: Mutex::new(JoinSet::new()),
            attempts: attempts.max(1),
            slot_config,
            scheduled: Counters::default(),
        }
    }

    /// Number of distinct jobs of `kind` scheduled so far
    pub fn scheduled(&self, kind: JobKind) -> u64 {
        self.scheduled.of(kind).load(Ordering::Relaxed)
    }

    /// Schedule a job for the next drain. Scheduling a job that is already waiting is a no-op.
    pub async fn enqueue(&self, job: Job) {
        if let Job::AssetMetadata { asset } = job {
            self.scheduled.of(job.kind()).fetch_add(1, Ordering::Relaxed);
            self.lookup(asset).await;
            return;
        }

        let mut pending = self.pending.lock().await;
        if !pending.contains(&job) {
            self.scheduled.of(job.kind()).fetch_add(1, Ordering::Relaxed);
            pending.push(job);
        }
    }

    /// Run every job scheduled so far and wait for them
    pub async fn drain(&self) {
        let jobs = std::mem::take(&mut *self.pending.lock().await);
        let mut running = JoinSet::new();
        for job in jobs {
            let store = self.store.clone();
            let permits = self.permits.clone();
            let attempts = self.attempts;
            let slot_config = self.slot_config;
            running.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                for attempt in 1..=attempts {
                    match run(store.as_ref(), slot_config, job).await {
                        Ok(()) => return,
                        Err(e) if attempt < attempts => {
                            warn!("{job:?} failed (attempt {attempt}): {e}");
                        }
                        Err(e) => error!("{job:?} abandoned after {attempts} attempts: {e}"),
                    }
                }
            });
        }
        while let Some(result) = running.join_next().await {
            if let Err(e) = result {
                error!("Derived job panicked: {e}");
            }
        }

        let mut lookups = self.lookups.lock().await;
        while let Some(result) = lookups.try_join_next() {
            if let Err(e) = result {
                error!("Metadata lookup panicked: {e}");
            }
        }
    }

    /// Wait for the metadata lookups in flight
    pub async fn drain_lookups(&self) {
        let mut lookups = std::mem::take(&mut *self.lookups.lock().await);
        while let Some(result) = lookups.join_next().await {
            if let Err(e) = result {
                error!("Metadata lookup panicked: {e}");
            }
        }
    }

    async fn lookup(&self, asset: EntityId) {
        let store = self.store.clone();
        let metadata = self.metadata.clone();
        let permits = self.lookup_permits.clone();
        self.lookups.lock().await.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let Some(class) = store
                .query(|tables| {
                    let row = tables.assets.get(asset)?;
                    Some(AssetClass::new(row.policy_id, row.name.clone()))
                })
                .await
            else {
                return;
            };
            let info = match metadata.fetch(&class).await {
                Ok(info) => info,
                Err(e) => {
                    debug!("No metadata for {}: {e}", class.unit());
                    return;
                }
            };
            let result = store.with_transaction(|tables| enrich_asset(tables, asset, info)).await;
            if let Err(e) = result {
                warn!("Could not record metadata for {}: {e}", class.unit());
            }
        });
    }
}

async fn run<S: Store>(store: &S, slot_config: SlotConfig, job: Job) -> Result<(), StoreError> {
    store
        .with_transaction(move |tables| match job {
            Job::PoolTvl { state } => pool_tvl(tables, state),
            Job::PoolTicks { state } => pool_ticks(tables, state, slot_config),
            Job::MatchSettlement { matched } => match_settlement(tables, matched),
            // Runs through `JobRunner::lookup`
            Job::AssetMetadata { .. } => Ok(()),
        })
        .await
}

fn enrich_asset(
    tables: &mut Tables,
    asset_id: EntityId,
    info: AssetInfo,
) -> Result<(), StoreError> {
    let Some(asset) = tables.assets.get(asset_id).cloned() else {
        return Ok(());
    };
    let enriched = Asset {
        ticker: info.ticker,
        display_name: info.display_name,
        decimals: info.decimals,
        is_verified: info.is_verified,
        ..asset.clone()
    };
    if enriched != asset {
        tables.assets.update(enriched)?;
    }
    Ok(())
}

/// Newest state, as of `state`, of the oldest-first ada pool that trades `token`
fn reference_state<'a>(
    tables: &'a Tables,
    token: EntityId,
    as_of: &LiquidityPoolState,
) -> Option<&'a LiquidityPoolState> {
    tables
        .pools_of_pair(None, Some(token))
        .flat_map(|pool| {
            tables
                .states_of_pool(pool.id)
                .rev()
                .find(|other| other.slot <= as_of.slot && other.reserve_b > 0)
        })
        .max_by_key(|other| (other.slot, other.id))
}

fn pool_tvl(tables: &mut Tables, state_id: EntityId) -> Result<(), StoreError> {
    let Some(state) = tables.pool_states.get(state_id).cloned() else {
        return Ok(());
    };
    let Some(pool) = tables.pools.get(state.pool_id) else {
        return Ok(());
    };

    let tvl = match pool.token_a {
        None => state.reserve_a.saturating_mul(2),
        // Price token A through the newest ada pool trading it
        Some(token_a) => match reference_state(tables, token_a, &state) {
            Some(reference) => {
                let value = 2 * state.reserve_a as u128 * reference.reserve_a as u128
                    / reference.reserve_b as u128;
                u64::try_from(value).unwrap_or(u64::MAX)
            }
            None => 0,
        },
    };

    if state.tvl != Some(tvl) {
        tables.pool_states.update(LiquidityPoolState {
            tvl: Some(tvl),
            ..state
        })?;
    }
    Ok(())
}

fn decimals(tables: &Tables, token: Option<EntityId>) -> i32 {
    match token {
        None => 6,
        Some(id) => tables.assets.get(id).map(|asset| asset.decimals as i32).unwrap_or(0),
    }
}

fn pool_ticks(
    tables: &mut Tables,
    state_id: EntityId,
    slot_config: SlotConfig,
) -> Result<(), StoreError> {
    let Some(state) = tables.pool_states.get(state_id) else {
        return Ok(());
    };
    let Some(pool) = tables.pools.get(state.pool_id).cloned() else {
        return Ok(());
    };
    let time = slot_config.slot_to_time(state.slot);
    let scale_a = 10f64.powi(decimals(tables, pool.token_a));
    let scale_b = 10f64.powi(decimals(tables, Some(pool.token_b)));

    for resolution in TickResolution::ALL {
        let bucket = resolution.bucket(time);
        let bucket_of =
            |s: &LiquidityPoolState| resolution.bucket(slot_config.slot_to_time(s.slot));
        let mut states: Vec<_> = tables
            .states_of_pool(pool.id)
            .rev()
            .skip_while(|s| bucket_of(*s) > bucket)
            .take_while(|s| bucket_of(*s) == bucket)
            .collect();
        states.reverse();

        let prices: Vec<f64> = states
            .iter()
            .filter(|s| s.reserve_b > 0)
            .map(|s| (s.reserve_a as f64 / scale_a) / (s.reserve_b as f64 / scale_b))
            .collect();

        // Swaps paying token A into the pool, settled by a state in this bucket
        let volume: u64 = states
            .iter()
            .flat_map(|s| s.source_inputs.iter())
            .filter_map(|input| match tables.amm_order_at(input)? {
                (OperationKind::Swap, id) => tables.swaps.get(id),
                _ => None,
            })
            .filter(|swap| swap.meta.pool_id == pool.id && swap.in_token == pool.token_a)
            .map(|swap| swap.in_amount)
            .sum();

        let key = (pool.id, resolution, bucket);
        let existing = tables.ticks.find(&key).map(|tick| tick.id);
        let (Some(&open), Some(&close)) = (prices.first(), prices.last()) else {
            if let Some(id) = existing {
                tables.ticks.delete(id);
            }
            continue;
        };
        let tick = Tick {
            id: existing.unwrap_or_default(),
            pool_id: pool.id,
            resolution,
            time: bucket,
            open,
            high: prices.iter().copied().fold(f64::MIN, f64::max),
            low: prices.iter().copied().fold(f64::MAX, f64::min),
            close,
            volume,
        };
        match existing {
            Some(_) if tables.ticks.find(&key) == Some(&tick) => {}
            Some(_) => tables.ticks.update(tick)?,
            None => {
                tables.ticks.insert(tick)?;
            }
        }
    }
    Ok(())
}

fn match_settlement(tables: &mut Tables, match_id: EntityId) -> Result<(), StoreError> {
    let Some(matched) = tables.matches.get(match_id).cloned() else {
        return Ok(());
    };
    let Some(order) = tables.orders.get(matched.order_id) else {
        return Ok(());
    };
    let received = (matched.matched_amount as f64 * order.price).floor() as u64;
    if matched.receiver_amount != Some(received) {
        tables.matches.update(dexwatch_common::OrderBookMatch {
            receiver_amount: Some(received),
            ..matched
        })?;
    }
    Ok(())
}
