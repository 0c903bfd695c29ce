//! Block pipeline: analyze, order, reconcile, then advance the cursor.
//!
//! The cursor only moves once everything a block produced, derived jobs included, has been
//! committed. A crash in between replays the block, which the reconciler absorbs.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::analyzer::{analyze_block, Analyzer};
use crate::broadcast::Broadcaster;
use crate::configuration::DexIndexerConfig;
use crate::cursor_store::CursorStore;
use crate::error::ReconcileError;
use crate::jobs::{Job, JobRunner};
use crate::metadata::MetadataSource;
use crate::orderer;
use crate::reconciler::{Outcome, ReconcileStats, Reconciler, ReconcilerConfig};
use crate::rollback::{rollback_after, RollbackReport};
use crate::store::Store;
use dexwatch_common::{BlockInfo, DexTransaction, Point, SlotConfig};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub reconciler: ReconcilerConfig,
    pub job_concurrency: usize,
    pub job_attempts: u32,
    pub slot_config: SlotConfig,
}

impl PipelineConfig {
    pub fn from_config(config: &DexIndexerConfig) -> Result<Self> {
        Ok(Self {
            reconciler: ReconcilerConfig {
                max_resolve_attempts: config.max_resolve_attempts,
                resolve_backoff: config.resolve_backoff(),
                backup_dexes: config.backup_dex_map()?,
            },
            job_concurrency: config.job_concurrency,
            job_attempts: config.job_attempts,
            slot_config: config.slot_config(),
        })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            job_concurrency: 50,
            job_attempts: 2,
            slot_config: SlotConfig::MAINNET,
        }
    }
}

/// What one block amounted to
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockReport {
    pub operations: usize,
    pub persisted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub rejected: usize,
}

pub struct Pipeline<S: Store, C: CursorStore> {
    store: Arc<S>,
    cursor_store: C,
    cursor: Point,
    analyzers: Vec<Box<dyn Analyzer>>,
    reconciler: Reconciler<S>,
    jobs: Arc<JobRunner<S>>,
    slot_config: SlotConfig,

    /// Set when a block or rollback failed; only a successful rollback clears it
    halted: bool,
}

impl<S: Store, C: CursorStore> Pipeline<S, C> {
    /// Resume from the saved cursor, or from `default_start` when there is none
    pub async fn open(
        store: Arc<S>,
        cursor_store: C,
        analyzers: Vec<Box<dyn Analyzer>>,
        metadata: Arc<dyn MetadataSource>,
        broadcaster: Arc<dyn Broadcaster>,
        config: PipelineConfig,
        default_start: Point,
    ) -> Result<Self> {
        let cursor = cursor_store.load().await?.unwrap_or(default_start);
        let jobs = Arc::new(JobRunner::new(
            store.clone(),
            metadata,
            config.job_concurrency,
            config.job_attempts,
            config.slot_config,
        ));
        let reconciler =
            Reconciler::new(store.clone(), broadcaster, jobs.clone(), config.reconciler);

        Ok(Self {
            store,
            cursor_store,
            cursor,
            analyzers,
            reconciler,
            jobs,
            slot_config: config.slot_config,
            halted: false,
        })
    }

    /// Last fully processed point
    pub fn cursor(&self) -> &Point {
        &self.cursor
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn jobs(&self) -> &JobRunner<S> {
        &self.jobs
    }

    pub fn reconcile_stats(&self) -> ReconcileStats {
        self.reconciler.stats()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Ignore blocks until the next successful rollback
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Process one block's decoded transactions
    pub async fn apply_block(
        &mut self,
        block: &BlockInfo,
        txs: &[DexTransaction],
    ) -> Result<BlockReport> {
        if self.halted {
            debug!("Halted, ignoring block {}", block.number);
            return Ok(BlockReport::default());
        }
        if self.cursor != Point::Origin && block.slot <= self.cursor.slot_or_default() {
            debug!("Block {} at slot {} already processed", block.number, block.slot);
            return Ok(BlockReport::default());
        }

        let span = info_span!("dex_indexer.block", number = block.number, slot = block.slot);
        let result = async {
            let operations = orderer::order(analyze_block(&self.analyzers, txs, block.slot));
            let mut report = BlockReport {
                operations: operations.len(),
                ..Default::default()
            };

            for operation in &operations {
                match self.reconciler.reconcile(operation).await {
                    Ok(Outcome::Persisted) => report.persisted += 1,
                    Ok(Outcome::Unchanged) => report.unchanged += 1,
                    Ok(Outcome::Skipped) => report.skipped += 1,
                    Err(e @ ReconcileError::ResolutionExhausted { .. }) => {
                        let utxo = operation.position().utxo();
                        warn!("Dropping {} at {utxo}: {e}", operation.kind());
                        report.dropped += 1;
                    }
                    Err(
                        e @ (ReconcileError::InvalidTransition(_)
                        | ReconcileError::MissingParameter(_)),
                    ) => {
                        let utxo = operation.position().utxo();
                        error!("Rejecting {} at {utxo}: {e}", operation.kind());
                        report.rejected += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            self.jobs.drain().await;
            let point = block.point();
            self.cursor_store.save(&point).await?;
            self.cursor = point;

            if report.operations > 0 {
                info!(
                    operations = report.operations,
                    persisted = report.persisted,
                    dropped = report.dropped,
                    "Processed block"
                );
            }
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(span)
        .await;

        if result.is_err() {
            self.halted = true;
        }
        result
    }

    /// Undo everything after `point` and move the cursor back to it. Failing leaves the
    /// pipeline halted with its cursor where it was.
    pub async fn rollback(&mut self, point: &Point) -> Result<RollbackReport> {
        let span = info_span!("dex_indexer.rollback", slot = point.slot_or_default());
        let result = async {
            // Let in-flight jobs finish before their rows go
            self.jobs.drain().await;

            let slot = point.slot_or_default();
            let slot_config = self.slot_config;
            let report = self
                .store
                .with_transaction(move |tables| rollback_after(tables, slot, slot_config))
                .await?;

            for state in &report.refreshed_states {
                self.jobs.enqueue(Job::PoolTicks { state: *state }).await;
            }
            self.jobs.drain().await;

            self.cursor_store.save(point).await?;
            self.cursor = point.clone();
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(span)
        .await;

        self.halted = result.is_err();
        result
    }
}
