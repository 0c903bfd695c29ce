//! DexWatch DEX indexer module for Caryatid
//!
//! Follows the chain through the transaction topic, recognises DEX activity of the enabled
//! protocols, and keeps a derived model of pools, orders and order books in step with the
//! chain, rollbacks included. Every change is broadcast as a `DexEvent`.

pub mod analyzer;
pub mod broadcast;
pub mod configuration;
pub mod cursor_store;
pub mod decoder;
pub mod dex;
pub mod error;
pub mod jobs;
pub mod metadata;
pub mod operation;
pub mod orderer;
pub mod pipeline;
pub mod reconciler;
pub mod rollback;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use config::Config;
use tracing::{error, info, warn};

use caryatid_sdk::{async_trait, Context, Module};

use dexwatch_codec::decode_transaction;
use dexwatch_common::{
    commands::ChainSyncCommand,
    messages::{CardanoMessage, Command, Message, StateTransitionMessage},
    Point,
};

use crate::{
    analyzer::build_analyzers,
    broadcast::BusBroadcaster,
    configuration::{DexIndexerConfig, StoreKind},
    cursor_store::{CursorStore, FjallCursorStore, InMemoryCursorStore},
    metadata::{MetadataSource, NoMetadata, TokenRegistry},
    pipeline::{Pipeline, PipelineConfig},
    store::{FjallStore, MemoryStore, Store},
};

/// DEX indexer module
#[derive(Default)]
pub struct DexIndexer;

#[async_trait]
impl Module<Message> for DexIndexer {
    fn get_name(&self) -> &'static str {
        "dex-indexer"
    }

    fn get_description(&self) -> &'static str {
        "Cardano DEX transaction analysis and reconciliation"
    }

    async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = DexIndexerConfig::try_load(&config)?;

        match cfg.store {
            StoreKind::Memory => {
                let store = Arc::new(MemoryStore::new());
                start(context, cfg, store, InMemoryCursorStore::default()).await
            }
            StoreKind::Fjall => {
                let store = FjallStore::open(&cfg.database_path, cfg.clear_on_start)?;
                let cursor_store = FjallCursorStore::new(store.database())?;
                start(context, cfg, Arc::new(store), cursor_store).await
            }
        }
    }
}

async fn find_intersect(context: &Context<Message>, topic: &str, point: Point) -> Result<()> {
    info!("Requesting chain sync from {point} on {topic}");
    let msg = Message::Command(Command::ChainSync(ChainSyncCommand::FindIntersect(point)));
    context.publish(topic, Arc::new(msg)).await
}

async fn start<S: Store, C: CursorStore>(
    context: Arc<Context<Message>>,
    cfg: DexIndexerConfig,
    store: Arc<S>,
    cursor_store: C,
) -> Result<()> {
    let enabled = cfg.enabled_dexes()?;
    info!(
        "Indexing {}",
        enabled.iter().map(|(dex, _)| dex.name()).collect::<Vec<_>>().join(", ")
    );

    let metadata: Arc<dyn MetadataSource> = if cfg.metadata_url.is_empty() {
        Arc::new(NoMetadata)
    } else {
        Arc::new(TokenRegistry::new(
            cfg.metadata_url.clone(),
            cfg.metadata_timeout_secs,
        ))
    };
    let broadcaster = Arc::new(BusBroadcaster::new(
        context.clone(),
        cfg.events_publish_topic.clone(),
    ));

    let mut pipeline = Pipeline::open(
        store,
        cursor_store,
        build_analyzers(&enabled),
        metadata,
        broadcaster,
        PipelineConfig::from_config(&cfg)?,
        cfg.default_start()?,
    )
    .await?;

    let mut subscription = context.subscribe(&cfg.txs_subscribe_topic).await?;
    let run_context = context.clone();

    context.run(async move {
        let topic = cfg.sync_command_publisher_topic;
        find_intersect(&run_context, &topic, pipeline.cursor().clone()).await?;

        loop {
            match subscription.read().await {
                Ok((_, message)) => match message.as_ref() {
                    Message::Cardano((block, CardanoMessage::ReceivedTxs(txs_msg))) => {
                        // Waiting for the rollback that follows our intersect request
                        if pipeline.is_halted() {
                            continue;
                        }

                        let mut decoded = Vec::with_capacity(txs_msg.txs.len());
                        for (tx_index, raw_tx) in txs_msg.txs.iter().enumerate() {
                            match decode_transaction(raw_tx) {
                                Ok(tx) => decoded.push(tx),
                                Err(e) => {
                                    warn!(
                                        "Undecodable tx {tx_index} in block {}, halting: {e:#}",
                                        block.number
                                    );
                                    pipeline.halt();
                                    break;
                                }
                            }
                        }

                        if !pipeline.is_halted() {
                            if let Err(e) = pipeline.apply_block(block, &decoded).await {
                                error!("Failed to apply block {}, halting: {e:#}", block.number);
                            }
                        }

                        // Ask the transport to go back to the last good point
                        if pipeline.is_halted() {
                            find_intersect(&run_context, &topic, pipeline.cursor().clone())
                                .await?;
                        }
                    }

                    Message::Cardano((
                        _,
                        CardanoMessage::StateTransition(StateTransitionMessage::Rollback(point)),
                    )) => match pipeline.rollback(point).await {
                        Ok(report) => {
                            info!("Rolled back to {point}: {} rows deleted", report.deleted)
                        }
                        Err(e) => {
                            // Still halted; ask again from the cursor we trust
                            error!("Rollback to {point} failed, halting: {e:#}");
                            find_intersect(&run_context, &topic, pipeline.cursor().clone())
                                .await?;
                        }
                    },

                    _ => (),
                },
                Err(e) => {
                    error!("Subscription closed: {e:#}");
                    break;
                }
            }
        }

        Ok::<_, anyhow::Error>(())
    });

    Ok(())
}
