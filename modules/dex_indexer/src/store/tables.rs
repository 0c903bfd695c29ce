//! In-memory relational model on persistent maps.
//!
//! Every table keeps its rows by id plus a unique natural-key index, and optionally files
//! rows under non-unique groups (the states of a pool, the matches of an order) so lookups
//! by parent never walk the whole table. Cloning a [`Tables`] is
//! cheap thanks to structural sharing, which is what gives the stores their transaction
//! snapshots. Ids touched since the last commit are tracked per table so a backend can write
//! through exactly what changed.

use crate::error::StoreError;
use dexwatch_common::dex::*;
use dexwatch_common::{AssetClass, Slot, TxHash, UTxOIdentifier};
use imbl::{OrdMap, OrdSet};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, hash::Hash};

/// A persisted entity
pub trait Row: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    const TABLE: &'static str;

    fn id(&self) -> EntityId;
    fn set_id(&mut self, id: EntityId);

    /// Natural key, unique within the table
    fn key(&self) -> Self::Key;

    type Group: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Secondary keys the row is filed under
    fn groups(&self) -> Vec<Self::Group>;
}

#[derive(Clone)]
pub struct Table<T: Row> {
    rows: OrdMap<EntityId, T>,
    index: imbl::HashMap<T::Key, EntityId>,
    groups: imbl::HashMap<T::Group, OrdSet<EntityId>>,
    next_id: EntityId,
    dirty: OrdSet<EntityId>,
}

impl<T: Row> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: OrdMap::new(),
            index: imbl::HashMap::new(),
            groups: imbl::HashMap::new(),
            next_id: 1,
            dirty: OrdSet::new(),
        }
    }
}

impl<T: Row> Table<T> {
    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.rows.get(&id)
    }

    pub fn find(&self, key: &T::Key) -> Option<&T> {
        self.index.get(key).and_then(|id| self.rows.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.rows.values()
    }

    /// Rows filed under `group`, in id order
    pub fn grouped(&self, group: T::Group) -> impl DoubleEndedIterator<Item = &T> + '_ {
        self.groups
            .get(&group)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(move |id| self.rows.get(id))
    }

    fn file(&mut self, row: &T) {
        let id = row.id();
        for group in row.groups() {
            self.groups.entry(group).or_insert_with(OrdSet::new).insert(id);
        }
    }

    fn unfile(&mut self, row: &T) {
        let id = row.id();
        for group in row.groups() {
            let emptied = match self.groups.get_mut(&group) {
                Some(ids) => {
                    ids.remove(&id);
                    ids.is_empty()
                }
                None => false,
            };
            if emptied {
                self.groups.remove(&group);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert a new row, assigning its id
    pub fn insert(&mut self, mut row: T) -> Result<EntityId, StoreError> {
        let key = row.key();
        if self.index.contains_key(&key) {
            return Err(StoreError::Conflict {
                table: T::TABLE,
                key: format!("{key:?}"),
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        row.set_id(id);
        self.index.insert(key, id);
        self.file(&row);
        self.rows.insert(id, row);
        self.dirty.insert(id);
        Ok(id)
    }

    /// Replace an existing row by id
    pub fn update(&mut self, row: T) -> Result<(), StoreError> {
        let id = row.id();
        let Some(existing) = self.rows.get(&id) else {
            return Err(StoreError::NotFound { table: T::TABLE, id });
        };

        let old_key = existing.key();
        let new_key = row.key();
        if old_key != new_key {
            if self.index.contains_key(&new_key) {
                return Err(StoreError::Conflict {
                    table: T::TABLE,
                    key: format!("{new_key:?}"),
                });
            }
            self.index.remove(&old_key);
            self.index.insert(new_key, id);
        }

        let existing = existing.clone();
        self.unfile(&existing);
        self.file(&row);
        self.rows.insert(id, row);
        self.dirty.insert(id);
        Ok(())
    }

    pub fn delete(&mut self, id: EntityId) -> Option<T> {
        let row = self.rows.remove(&id)?;
        self.index.remove(&row.key());
        self.unfile(&row);
        self.dirty.insert(id);
        Some(row)
    }

    /// Delete every row matching `predicate`, returning the deleted rows
    pub fn delete_where(&mut self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let doomed: Vec<EntityId> =
            self.rows.iter().filter(|(_, row)| predicate(row)).map(|(id, _)| *id).collect();
        doomed.into_iter().filter_map(|id| self.delete(id)).collect()
    }

    /// Restore a persisted row without marking it changed
    pub fn load(&mut self, row: T) {
        let id = row.id();
        self.next_id = self.next_id.max(id + 1);
        if let Some(previous) = self.rows.get(&id).cloned() {
            self.index.remove(&previous.key());
            self.unfile(&previous);
        }
        self.index.insert(row.key(), id);
        self.file(&row);
        self.rows.insert(id, row);
    }

    /// Rows touched since the last commit; `None` for deletions
    pub fn changes(&self) -> impl Iterator<Item = (EntityId, Option<&T>)> + '_ {
        self.dirty.iter().map(|id| (*id, self.rows.get(id)))
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn clear_changes(&mut self) {
        self.dirty = OrdSet::new();
    }
}

/// Encoded change for a write-through backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub table: &'static str,
    pub id: EntityId,
    pub value: Option<Vec<u8>>,
}

/// Canonical (lower, higher) ordering of an unordered token pair
pub fn canonical_pair(a: TokenRef, b: TokenRef) -> (TokenRef, TokenRef) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Secondary keys of a pool state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateGroup {
    Pool(EntityId),

    /// An order output the state consumed
    Spent(UTxOIdentifier),
}

/// Order identity: the protocol identifier when there is one, else its origin
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderKey {
    Identifier(Dex, String),
    Origin(Dex, TxHash, u16),
}

macro_rules! row {
    ($entity:ty, $table:literal, $key:ty, |$row:ident| $body:expr) => {
        row!($entity, $table, $key, |$row| $body, (), |_row| Vec::new());
    };
    (
        $entity:ty,
        $table:literal,
        $key:ty,
        |$row:ident| $body:expr,
        $group:ty,
        |$grouped:ident| $groups:expr
    ) => {
        impl Row for $entity {
            type Key = $key;
            type Group = $group;

            const TABLE: &'static str = $table;

            fn id(&self) -> EntityId {
                self.id
            }

            fn set_id(&mut self, id: EntityId) {
                self.id = id;
            }

            fn key(&self) -> Self::Key {
                let $row = self;
                $body
            }

            fn groups(&self) -> Vec<Self::Group> {
                let $grouped = self;
                $groups
            }
        }
    };
}

row!(Asset, "assets", AssetClass, |row| AssetClass::new(row.policy_id, row.name.clone()));
row!(
    LiquidityPool,
    "pools",
    (Dex, String),
    |row| (row.dex, row.identifier.clone()),
    (TokenRef, TokenRef),
    |row| vec![canonical_pair(row.token_a, Some(row.token_b))]
);
row!(
    LiquidityPoolState,
    "pool-states",
    (EntityId, TxHash),
    |row| (row.pool_id, row.tx_hash),
    StateGroup,
    |row| {
        let spent = row.source_inputs.iter().map(|input| StateGroup::Spent(*input));
        std::iter::once(StateGroup::Pool(row.pool_id)).chain(spent).collect()
    }
);
row!(Swap, "swaps", UTxOIdentifier, |row| row.meta.utxo());
row!(Deposit, "deposits", UTxOIdentifier, |row| row.meta.utxo());
row!(Withdraw, "withdraws", UTxOIdentifier, |row| row.meta.utxo());
row!(Zap, "zaps", UTxOIdentifier, |row| row.meta.utxo());
row!(OrderBook, "order-books", (Dex, TokenRef, TokenRef), |row| {
    let (a, b) = canonical_pair(row.token_a, row.token_b);
    (row.dex, a, b)
});
row!(OrderBookOrder, "orders", OrderKey, |row| match &row.identifier {
    Some(identifier) => OrderKey::Identifier(row.dex, identifier.clone()),
    None => OrderKey::Origin(row.dex, row.tx_hash, row.output_index),
});
row!(
    OrderBookMatch,
    "matches",
    (EntityId, TxHash),
    |row| (row.order_id, row.tx_hash),
    EntityId,
    |row| vec![row.order_id]
);
row!(
    OperationStatus,
    "statuses",
    (EntityId, OperationKind, StatusKind),
    |row| (row.operation_id, row.operation_type, row.status)
);
row!(Tick, "ticks", (EntityId, TickResolution, u64), |row| (
    row.pool_id,
    row.resolution,
    row.time
));

/// The whole derived model
#[derive(Clone, Default)]
pub struct Tables {
    pub assets: Table<Asset>,
    pub pools: Table<LiquidityPool>,
    pub pool_states: Table<LiquidityPoolState>,
    pub swaps: Table<Swap>,
    pub deposits: Table<Deposit>,
    pub withdraws: Table<Withdraw>,
    pub zaps: Table<Zap>,
    pub order_books: Table<OrderBook>,
    pub orders: Table<OrderBookOrder>,
    pub matches: Table<OrderBookMatch>,
    pub statuses: Table<OperationStatus>,
    pub ticks: Table<Tick>,
}

fn encode_changes<T: Row>(table: &Table<T>, out: &mut Vec<Change>) -> Result<(), StoreError> {
    for (id, row) in table.changes() {
        let value = row.map(serde_cbor::to_vec).transpose()?;
        out.push(Change {
            table: T::TABLE,
            id,
            value,
        });
    }
    Ok(())
}

fn load_row<T: Row>(table: &mut Table<T>, bytes: &[u8]) -> Result<(), StoreError> {
    table.load(serde_cbor::from_slice(bytes)?);
    Ok(())
}

impl Tables {
    pub const NAMES: [&'static str; 12] = [
        Asset::TABLE,
        LiquidityPool::TABLE,
        LiquidityPoolState::TABLE,
        Swap::TABLE,
        Deposit::TABLE,
        Withdraw::TABLE,
        Zap::TABLE,
        OrderBook::TABLE,
        OrderBookOrder::TABLE,
        OrderBookMatch::TABLE,
        OperationStatus::TABLE,
        Tick::TABLE,
    ];

    /// Encode everything changed since the last commit
    pub fn changes(&self) -> Result<Vec<Change>, StoreError> {
        let mut out = Vec::new();
        encode_changes(&self.assets, &mut out)?;
        encode_changes(&self.pools, &mut out)?;
        encode_changes(&self.pool_states, &mut out)?;
        encode_changes(&self.swaps, &mut out)?;
        encode_changes(&self.deposits, &mut out)?;
        encode_changes(&self.withdraws, &mut out)?;
        encode_changes(&self.zaps, &mut out)?;
        encode_changes(&self.order_books, &mut out)?;
        encode_changes(&self.orders, &mut out)?;
        encode_changes(&self.matches, &mut out)?;
        encode_changes(&self.statuses, &mut out)?;
        encode_changes(&self.ticks, &mut out)?;
        Ok(out)
    }

    pub fn clear_changes(&mut self) {
        self.assets.clear_changes();
        self.pools.clear_changes();
        self.pool_states.clear_changes();
        self.swaps.clear_changes();
        self.deposits.clear_changes();
        self.withdraws.clear_changes();
        self.zaps.clear_changes();
        self.order_books.clear_changes();
        self.orders.clear_changes();
        self.matches.clear_changes();
        self.statuses.clear_changes();
        self.ticks.clear_changes();
    }

    /// Restore one persisted row into the named table
    pub fn load(&mut self, table: &str, bytes: &[u8]) -> Result<(), StoreError> {
        match table {
            Asset::TABLE => load_row(&mut self.assets, bytes),
            LiquidityPool::TABLE => load_row(&mut self.pools, bytes),
            LiquidityPoolState::TABLE => load_row(&mut self.pool_states, bytes),
            Swap::TABLE => load_row(&mut self.swaps, bytes),
            Deposit::TABLE => load_row(&mut self.deposits, bytes),
            Withdraw::TABLE => load_row(&mut self.withdraws, bytes),
            Zap::TABLE => load_row(&mut self.zaps, bytes),
            OrderBook::TABLE => load_row(&mut self.order_books, bytes),
            OrderBookOrder::TABLE => load_row(&mut self.orders, bytes),
            OrderBookMatch::TABLE => load_row(&mut self.matches, bytes),
            OperationStatus::TABLE => load_row(&mut self.statuses, bytes),
            Tick::TABLE => load_row(&mut self.ticks, bytes),
            other => Err(StoreError::Backend(format!("Unknown table '{other}'"))),
        }
    }

    pub fn pool_by_identifier(&self, dex: Dex, identifier: &str) -> Option<&LiquidityPool> {
        self.pools.find(&(dex, identifier.to_string()))
    }

    /// Oldest pool of a dex trading the unordered pair
    pub fn pool_by_pair(&self, dex: Dex, a: TokenRef, b: TokenRef) -> Option<&LiquidityPool> {
        self.pools.grouped(canonical_pair(a, b)).find(|pool| pool.dex == dex)
    }

    /// Pools of any dex trading the unordered pair, oldest first
    pub fn pools_of_pair(
        &self,
        a: TokenRef,
        b: TokenRef,
    ) -> impl DoubleEndedIterator<Item = &LiquidityPool> + '_ {
        self.pools.grouped(canonical_pair(a, b))
    }

    /// States of a pool in insertion order. Blocks are applied in chain order, so within a
    /// pool this is also slot order.
    pub fn states_of_pool(
        &self,
        pool_id: EntityId,
    ) -> impl DoubleEndedIterator<Item = &LiquidityPoolState> + '_ {
        self.pool_states.grouped(StateGroup::Pool(pool_id))
    }

    /// Surviving state with the greatest slot, latest insert winning ties
    pub fn newest_state(&self, pool_id: EntityId) -> Option<&LiquidityPoolState> {
        self.states_of_pool(pool_id).next_back()
    }

    /// State of `pool_id` that consumed the order output at `utxo`
    pub fn state_spending(
        &self,
        pool_id: EntityId,
        utxo: &UTxOIdentifier,
    ) -> Option<&LiquidityPoolState> {
        self.pool_states.grouped(StateGroup::Spent(*utxo)).find(|state| state.pool_id == pool_id)
    }

    /// Matches against an order, oldest first
    pub fn matches_of_order(
        &self,
        order_id: EntityId,
    ) -> impl DoubleEndedIterator<Item = &OrderBookMatch> + '_ {
        self.matches.grouped(order_id)
    }

    /// Output currently holding an order: the continuing output of its latest partial fill,
    /// else the output that opened it
    pub fn order_utxo(&self, order: &OrderBookOrder) -> UTxOIdentifier {
        self.matches_of_order(order.id)
            .rev()
            .find_map(|matched| {
                let index = matched.continuing_output?;
                Some(UTxOIdentifier::new(matched.tx_hash, index))
            })
            .unwrap_or_else(|| UTxOIdentifier::new(order.tx_hash, order.output_index))
    }

    /// AMM order created at `utxo`, if any
    pub fn amm_order_at(&self, utxo: &UTxOIdentifier) -> Option<(OperationKind, EntityId)> {
        if let Some(swap) = self.swaps.find(utxo) {
            return Some((OperationKind::Swap, swap.id));
        }
        if let Some(deposit) = self.deposits.find(utxo) {
            return Some((OperationKind::Deposit, deposit.id));
        }
        if let Some(withdraw) = self.withdraws.find(utxo) {
            return Some((OperationKind::Withdraw, withdraw.id));
        }
        self.zaps.find(utxo).map(|zap| (OperationKind::Zap, zap.id))
    }

    pub fn status(
        &self,
        operation_id: EntityId,
        operation_type: OperationKind,
        status: StatusKind,
    ) -> Option<&OperationStatus> {
        self.statuses.find(&(operation_id, operation_type, status))
    }

    /// Record a lifecycle status; returns the new row, or `None` when it was already recorded
    pub fn upsert_status(
        &mut self,
        operation_id: EntityId,
        operation_type: OperationKind,
        status: StatusKind,
        slot: Slot,
        tx_hash: TxHash,
        output_index: Option<u16>,
    ) -> Result<Option<OperationStatus>, StoreError> {
        if self.status(operation_id, operation_type, status).is_some() {
            return Ok(None);
        }
        let mut row = OperationStatus {
            id: 0,
            operation_id,
            operation_type,
            status,
            slot,
            tx_hash,
            output_index,
        };
        row.id = self.statuses.insert(row.clone())?;
        Ok(Some(row))
    }

    /// Create an asset row from `template` unless one exists; returns the id when created
    pub fn create_asset(&mut self, template: Asset) -> Result<Option<EntityId>, StoreError> {
        if self.assets.find(&template.key()).is_some() {
            return Ok(None);
        }
        self.assets.insert(template).map(Some)
    }

    pub fn token_ref(&self, token: &dexwatch_common::Token) -> Option<TokenRef> {
        match token {
            dexwatch_common::Token::Lovelace => Some(None),
            dexwatch_common::Token::Asset(class) => self.assets.find(class).map(|a| Some(a.id)),
        }
    }
}
