//! End-to-end behaviour of the block pipeline through its public API

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dexwatch_common::{
    AssetClass, AssetName, BlockHash, BlockInfo, Datum, Dex, DexTransaction, OperationKind,
    Point, PolicyId, Slot, StatusKind, Token, TxHash, UTxOIdentifier,
};
use dexwatch_module_dex_indexer::{
    analyzer::Analyzer,
    broadcast::NullBroadcaster,
    cursor_store::{CursorStore, FjallCursorStore, InMemoryCursorStore},
    decoder::{decode, Param, Schema, SchemaMismatch},
    error::{ReconcileError, StoreError},
    jobs::JobKind,
    metadata::NoMetadata,
    operation::*,
    pipeline::{BlockReport, Pipeline, PipelineConfig},
    reconciler::ReconcilerConfig,
    store::{FjallStore, MemoryStore, Store, Tables},
};

/// Operations to report per transaction, shared with the test body
#[derive(Clone, Default)]
struct Script(Arc<Mutex<HashMap<TxHash, Vec<Operation>>>>);

impl Script {
    fn block(
        &self,
        slot: Slot,
        txs: Vec<(u8, Vec<Operation>)>,
    ) -> (BlockInfo, Vec<DexTransaction>) {
        let mut script = self.0.lock().unwrap();
        let txs = txs
            .into_iter()
            .map(|(tx, operations)| {
                let hash = tx_hash(tx);
                script.insert(hash, operations);
                DexTransaction {
                    hash,
                    valid: true,
                    ..Default::default()
                }
            })
            .collect();
        let block = BlockInfo {
            slot,
            number: slot,
            hash: BlockHash::new([slot as u8; 32]),
            ..Default::default()
        };
        (block, txs)
    }
}

struct ScriptedAnalyzer(Script);

impl Analyzer for ScriptedAnalyzer {
    fn dex(&self) -> Dex {
        Dex::Minswap
    }

    fn start_slot(&self) -> Slot {
        0
    }

    fn analyze(&self, tx: &DexTransaction, _slot: Slot) -> Vec<Operation> {
        self.0 .0.lock().unwrap().get(&tx.hash).cloned().unwrap_or_default()
    }
}

/// Memory store that fails its next few transactions on demand
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    conflicts: AtomicU32,
    failures: AtomicU32,
}

fn take_one(armed: &AtomicU32) -> bool {
    armed.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl Store for FlakyStore {
    async fn query<R, F>(&self, read: F) -> R
    where
        R: Send,
        F: FnOnce(&Tables) -> R + Send,
    {
        self.inner.query(read).await
    }

    async fn with_transaction<R, F>(&self, write: F) -> Result<R, StoreError>
    where
        R: Send,
        F: FnOnce(&mut Tables) -> Result<R, StoreError> + Send,
    {
        if take_one(&self.conflicts) {
            return Err(StoreError::Conflict {
                table: "pool-states",
                key: "injected".into(),
            });
        }
        if take_one(&self.failures) {
            return Err(StoreError::Backend("injected failure".into()));
        }
        self.inner.with_transaction(write).await
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        reconciler: ReconcilerConfig {
            resolve_backoff: Duration::ZERO,
            ..Default::default()
        },
        job_concurrency: 4,
        ..Default::default()
    }
}

async fn open<S: Store, C: CursorStore>(
    store: Arc<S>,
    cursor_store: C,
    script: &Script,
) -> Pipeline<S, C> {
    Pipeline::open(
        store,
        cursor_store,
        vec![Box::new(ScriptedAnalyzer(script.clone())) as Box<dyn Analyzer>],
        Arc::new(NoMetadata),
        Arc::new(NullBroadcaster),
        config(),
        Point::Origin,
    )
    .await
    .unwrap()
}

async fn memory_pipeline(script: &Script) -> Pipeline<MemoryStore, InMemoryCursorStore> {
    open(Arc::new(MemoryStore::new()), InMemoryCursorStore::default(), script).await
}

fn tx_hash(tx: u8) -> TxHash {
    TxHash::new([tx; 32])
}

fn token() -> Token {
    Token::Asset(AssetClass::new(PolicyId::new([7; 28]), AssetName::new(b"MIN").unwrap()))
}

fn position(tx: u8, slot: Slot, output_index: u16) -> Position {
    Position {
        slot,
        tx_hash: tx_hash(tx),
        output_index,
    }
}

fn pool_state(tx: u8, slot: Slot, source_inputs: Vec<UTxOIdentifier>) -> Operation {
    Operation::PoolState(PoolStateOp {
        dex: Dex::Minswap,
        identifier: "pool-x".into(),
        address: "addr_pool".into(),
        token_a: Token::Lovelace,
        token_b: token(),
        token_lp: None,
        reserve_a: 5_000_000,
        reserve_b: 10_000,
        lp_tokens: Some(1_000),
        fee_percent: 0.3,
        position: position(tx, slot, 0),
        source_inputs,
    })
}

fn swap(tx: u8, slot: Slot, pool: &str) -> Operation {
    Operation::Swap(SwapOp {
        header: OrderHeader {
            dex: Dex::Minswap,
            pool: PoolRef::by_identifier(pool),
            sender: SenderKeys::default(),
            position: position(tx, slot, 1),
            batcher_fee: 2_000_000,
            deposit: 2_000_000,
        },
        in_token: Token::Lovelace,
        out_token: token(),
        in_amount: 100_000,
        min_receive: 10,
    })
}

fn order(tx: u8, slot: Slot, nft: &str) -> Operation {
    Operation::OrderBookOrder(OrderBookOrderOp {
        dex: Dex::GeniusYield,
        identifier: Some(nft.into()),
        from_token: Token::Lovelace,
        to_token: token(),
        original_offer_amount: 1_000,
        unfilled_offer_amount: 1_000,
        asked_amount: 500,
        price: 0.5,
        num_partial_fills: 0,
        sender: SenderKeys::default(),
        position: position(tx, slot, 0),
    })
}

fn consume(tx: u8, slot: Slot, nft: &str) -> Operation {
    Operation::OrderBookMatch(OrderBookMatchOp {
        dex: Dex::GeniusYield,
        order: OrderTarget::Identifier(nft.into()),
        matched_token: None,
        matched_amount: None,
        remaining: Some(0),
        consumes_order: true,
        position: position(tx, slot, 0),
    })
}

fn cancel(tx: u8, slot: Slot, nft: &str) -> Operation {
    Operation::OrderCancellation(OrderCancellationOp {
        dex: Dex::GeniusYield,
        target: CancelTarget::Order(OrderTarget::Identifier(nft.into())),
        position: position(tx, slot, 0),
    })
}

#[test]
fn decoding_is_exact_and_all_or_nothing() {
    let schema = Schema::one_of([
        Schema::constr(0, [Schema::Int(Param::AmountA), Schema::Bytes(Param::OrderNft)]),
        Schema::constr(0, [Schema::Int(Param::AmountA), Schema::Int(Param::AmountB)]),
    ]);
    let datum = Datum::Constr {
        tag: 0,
        fields: vec![Datum::Int(3), Datum::Int(4)],
    };

    // The first alternative binds AmountA before failing; none of it survives
    let params = decode(&schema, &datum).unwrap();
    assert_eq!(params.len(), 2);
    assert_eq!(params.int(Param::AmountA), Some(3));
    assert_eq!(params.int(Param::AmountB), Some(4));
    assert!(params.get(Param::OrderNft).is_none());
    assert_eq!(decode(&schema, &datum).unwrap(), params);

    let wrong_tag = Datum::Constr {
        tag: 1,
        fields: vec![Datum::Int(3), Datum::Int(4)],
    };
    assert_eq!(decode(&schema, &wrong_tag), Err(SchemaMismatch::NoAlternative));
}

#[tokio::test]
async fn pool_state_goes_first_and_swap_resolves_immediately() {
    let script = Script::default();
    let mut pipeline = memory_pipeline(&script).await;

    let order_utxo = UTxOIdentifier::new(tx_hash(1), 1);
    let (block, txs) = script.block(
        500,
        vec![
            (1, vec![swap(1, 500, "pool-x")]),
            (2, vec![pool_state(2, 500, vec![order_utxo])]),
        ],
    );
    let report = pipeline.apply_block(&block, &txs).await.unwrap();
    assert_eq!(report.persisted, 2);

    let stats = pipeline.reconcile_stats();
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.first_attempt, 2);

    pipeline
        .store()
        .query(|t| {
            let swap = t.swaps.iter().next().unwrap();
            let complete = t.status(swap.id, OperationKind::Swap, StatusKind::Complete).unwrap();
            assert_eq!(complete.tx_hash, tx_hash(2));
        })
        .await;
}

#[tokio::test]
async fn unresolvable_swap_is_dropped_and_block_completes() {
    let script = Script::default();
    let mut pipeline = memory_pipeline(&script).await;

    let (block, txs) = script.block(
        500,
        vec![(1, vec![swap(1, 500, "missing")]), (2, vec![order(2, 500, "nft")])],
    );
    let report = pipeline.apply_block(&block, &txs).await.unwrap();
    assert_eq!(report.dropped, 1);
    assert_eq!(report.persisted, 1);
    assert_eq!(pipeline.reconcile_stats().retries, 2);
    assert_eq!(pipeline.cursor(), &block.point());
    assert_eq!(pipeline.store().query(|t| t.orders.len()).await, 1);
}

#[tokio::test]
async fn latest_state_follows_newest_write() {
    let script = Script::default();
    let mut pipeline = memory_pipeline(&script).await;

    let (first, first_txs) = script.block(500, vec![(1, vec![pool_state(1, 500, vec![])])]);
    let (second, second_txs) = script.block(600, vec![(2, vec![pool_state(2, 600, vec![])])]);
    pipeline.apply_block(&first, &first_txs).await.unwrap();
    pipeline.apply_block(&second, &second_txs).await.unwrap();

    assert_eq!(pipeline.jobs().scheduled(JobKind::PoolTvl), 2);
    pipeline
        .store()
        .query(|t| {
            let pool = t.pools.iter().next().unwrap();
            let latest = t.pool_states.get(pool.latest_state.unwrap()).unwrap();
            assert_eq!(latest.slot, 600);
            assert!(t.pool_states.iter().all(|state| state.tvl == Some(10_000_000)));
        })
        .await;
}

#[tokio::test]
async fn consumed_and_cancelled_orders_stay_closed() {
    let script = Script::default();
    let mut pipeline = memory_pipeline(&script).await;

    let (block, txs) = script.block(
        100,
        vec![(1, vec![order(1, 100, "filled")]), (2, vec![order(2, 100, "cancelled")])],
    );
    pipeline.apply_block(&block, &txs).await.unwrap();

    let (block, txs) = script.block(
        110,
        vec![(3, vec![consume(3, 110, "filled")]), (4, vec![cancel(4, 110, "cancelled")])],
    );
    assert_eq!(pipeline.apply_block(&block, &txs).await.unwrap().persisted, 2);

    let (block, txs) = script.block(
        120,
        vec![(5, vec![consume(5, 120, "filled")]), (6, vec![consume(6, 120, "cancelled")])],
    );
    let report = pipeline.apply_block(&block, &txs).await.unwrap();
    assert_eq!(report.rejected, 2);

    pipeline
        .store()
        .query(|t| {
            assert_eq!(t.orders.len(), 2);
            assert_eq!(t.matches.len(), 1);
            let filled =
                t.orders.iter().find(|o| o.identifier.as_deref() == Some("filled")).unwrap();
            assert_eq!(filled.unfilled_offer_amount, 0);
            let cancelled =
                t.orders.iter().find(|o| o.identifier.as_deref() == Some("cancelled")).unwrap();
            assert!(cancelled.is_cancelled);
            assert_eq!(cancelled.unfilled_offer_amount, 1_000);
        })
        .await;
}

#[tokio::test]
async fn rollback_removes_later_rows_and_is_idempotent() {
    let script = Script::default();
    let mut pipeline = memory_pipeline(&script).await;

    let blocks = [
        script.block(
            100,
            vec![(1, vec![pool_state(1, 100, vec![])]), (2, vec![order(2, 100, "nft")])],
        ),
        script.block(200, vec![(3, vec![swap(3, 200, "pool-x")])]),
        script.block(
            300,
            vec![
                (4, vec![pool_state(4, 300, vec![UTxOIdentifier::new(tx_hash(3), 1)])]),
                (5, vec![consume(5, 300, "nft")]),
            ],
        ),
    ];
    for (block, txs) in &blocks[..2] {
        pipeline.apply_block(block, txs).await.unwrap();
    }
    let snapshot = |t: &Tables| {
        let states: Vec<_> = t.pool_states.iter().cloned().collect();
        let orders: Vec<_> = t.orders.iter().cloned().collect();
        (states, orders)
    };
    let before = pipeline.store().query(snapshot).await;
    pipeline.apply_block(&blocks[2].0, &blocks[2].1).await.unwrap();

    let point = blocks[1].0.point();
    let report = pipeline.rollback(&point).await.unwrap();
    assert!(report.deleted > 0);
    assert_eq!(pipeline.cursor(), &point);

    let after = pipeline
        .store()
        .query(|t| {
            assert!(t.matches.is_empty());
            assert!(t.statuses.iter().all(|status| status.slot <= 200));
            let pool = t.pools.iter().next().unwrap();
            assert_eq!(t.pool_states.get(pool.latest_state.unwrap()).unwrap().slot, 100);
            snapshot(t)
        })
        .await;
    assert_eq!(after, before);

    let again = pipeline.rollback(&point).await.unwrap();
    assert_eq!(again.deleted, 0);
    assert_eq!(again.repaired_orders, 0);

    // The chain moves on from the rollback point as usual
    let report = pipeline.apply_block(&blocks[2].0, &blocks[2].1).await.unwrap();
    assert_eq!(report.persisted, 2);
}

#[tokio::test]
async fn replayed_block_changes_nothing() {
    let script = Script::default();
    let store = Arc::new(MemoryStore::new());
    let (block, txs) = script.block(
        100,
        vec![
            (1, vec![pool_state(1, 100, vec![])]),
            (2, vec![swap(2, 100, "pool-x")]),
            (3, vec![order(3, 100, "nft")]),
        ],
    );

    let mut pipeline = open(store.clone(), InMemoryCursorStore::default(), &script).await;
    assert_eq!(pipeline.apply_block(&block, &txs).await.unwrap().persisted, 3);

    // Already behind the cursor
    assert_eq!(pipeline.apply_block(&block, &txs).await.unwrap().operations, 0);

    // As after a crash before the cursor was saved
    let mut restarted = open(store.clone(), InMemoryCursorStore::default(), &script).await;
    let report = restarted.apply_block(&block, &txs).await.unwrap();
    assert_eq!(report.unchanged, 3);
    let counts = store.query(|t| (t.pool_states.len(), t.swaps.len(), t.statuses.len())).await;
    assert_eq!(counts, (1, 1, 2));
}

#[tokio::test]
async fn fjall_pipeline_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::default();
    let (block, txs) = script.block(100, vec![(1, vec![pool_state(1, 100, vec![])])]);

    {
        let store = FjallStore::open(dir.path(), false).unwrap();
        let cursor_store = FjallCursorStore::new(store.database()).unwrap();
        let mut pipeline = open(Arc::new(store), cursor_store, &script).await;
        pipeline.apply_block(&block, &txs).await.unwrap();
    }

    let store = FjallStore::open(dir.path(), false).unwrap();
    let cursor_store = FjallCursorStore::new(store.database()).unwrap();
    let pipeline = open(Arc::new(store), cursor_store, &script).await;
    assert_eq!(pipeline.cursor(), &block.point());
    pipeline
        .store()
        .query(|t| {
            assert_eq!(t.pools.len(), 1);
            let state = t.pool_states.iter().next().unwrap();
            assert_eq!(state.tvl, Some(10_000_000));
        })
        .await;
}

#[tokio::test]
async fn write_conflict_is_retried_once_then_fails_the_block() {
    let script = Script::default();
    let store = Arc::new(FlakyStore::default());
    let mut pipeline = open(store.clone(), InMemoryCursorStore::default(), &script).await;

    let (first, first_txs) = script.block(100, vec![(1, vec![pool_state(1, 100, vec![])])]);
    pipeline.apply_block(&first, &first_txs).await.unwrap();

    // One conflict: the fresh transaction goes through
    store.conflicts.store(1, Ordering::SeqCst);
    let (second, second_txs) = script.block(200, vec![(2, vec![pool_state(2, 200, vec![])])]);
    let report = pipeline.apply_block(&second, &second_txs).await.unwrap();
    assert_eq!(report.persisted, 1);
    assert_eq!(pipeline.reconcile_stats().conflicts, 1);

    // Two in a row fail the block and leave the cursor behind it
    store.conflicts.store(2, Ordering::SeqCst);
    let (third, third_txs) = script.block(300, vec![(3, vec![pool_state(3, 300, vec![])])]);
    let error = pipeline.apply_block(&third, &third_txs).await.unwrap_err();
    assert!(matches!(
        error.downcast_ref::<ReconcileError>(),
        Some(ReconcileError::PersistenceConflict(_))
    ));
    assert_eq!(pipeline.reconcile_stats().conflicts, 2);
    assert_eq!(pipeline.cursor(), &second.point());
    assert!(pipeline.is_halted());
    assert_eq!(store.query(|t| t.pool_states.len()).await, 2);
}

#[tokio::test]
async fn failed_rollback_keeps_the_pipeline_halted() {
    let script = Script::default();
    let store = Arc::new(FlakyStore::default());
    let mut pipeline = open(store.clone(), InMemoryCursorStore::default(), &script).await;

    let (first, first_txs) = script.block(100, vec![(1, vec![pool_state(1, 100, vec![])])]);
    let (second, second_txs) = script.block(200, vec![(2, vec![pool_state(2, 200, vec![])])]);
    pipeline.apply_block(&first, &first_txs).await.unwrap();
    pipeline.apply_block(&second, &second_txs).await.unwrap();

    store.failures.store(1, Ordering::SeqCst);
    assert!(pipeline.rollback(&first.point()).await.is_err());
    assert!(pipeline.is_halted());
    assert_eq!(pipeline.cursor(), &second.point());

    // Blocks are ignored until a rollback succeeds
    let (third, third_txs) = script.block(300, vec![(3, vec![pool_state(3, 300, vec![])])]);
    let report = pipeline.apply_block(&third, &third_txs).await.unwrap();
    assert_eq!(report, BlockReport::default());
    assert_eq!(store.query(|t| t.pool_states.len()).await, 2);

    pipeline.rollback(&first.point()).await.unwrap();
    assert!(!pipeline.is_halted());
    assert_eq!(pipeline.cursor(), &first.point());
    assert_eq!(store.query(|t| t.pool_states.len()).await, 1);

    let report = pipeline.apply_block(&third, &third_txs).await.unwrap();
    assert_eq!(report.persisted, 1);
}
