//! Persisted DEX entities and the events broadcast when they change

use crate::{
    hash::{KeyHash, PolicyId, TxHash},
    types::{AssetName, Slot, UTxOIdentifier},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Row identifier, unique per table
pub type EntityId = u64;

/// Reference to an `Asset` row; `None` stands for ada
pub type TokenRef = Option<EntityId>;

/// Supported exchange protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dex {
    Minswap,
    SundaeSwapV3,
    GeniusYield,
}

impl Dex {
    pub const ALL: [Dex; 3] = [Dex::Minswap, Dex::SundaeSwapV3, Dex::GeniusYield];

    pub fn name(&self) -> &'static str {
        match self {
            Dex::Minswap => "minswap",
            Dex::SundaeSwapV3 => "sundaeswap-v3",
            Dex::GeniusYield => "genius-yield",
        }
    }
}

impl fmt::Display for Dex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dex {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dex::ALL
            .into_iter()
            .find(|dex| dex.name() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown dex '{s}'"))
    }
}

/// Native asset, created lazily on first reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: EntityId,
    pub policy_id: PolicyId,
    pub name: AssetName,
    pub ticker: Option<String>,
    pub display_name: Option<String>,
    pub decimals: u8,
    pub is_verified: bool,
}

/// AMM pool identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityPool {
    pub id: EntityId,
    pub dex: Dex,
    pub identifier: String,
    pub address: String,
    pub token_a: TokenRef,
    pub token_b: EntityId,
    pub token_lp: Option<EntityId>,
    pub created_slot: Slot,

    /// State with the greatest slot among surviving states
    pub latest_state: Option<EntityId>,
}

/// Immutable reserve snapshot of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityPoolState {
    pub id: EntityId,
    pub pool_id: EntityId,
    pub slot: Slot,
    pub tx_hash: TxHash,
    pub reserve_a: u64,
    pub reserve_b: u64,
    pub lp_tokens: Option<u64>,
    pub fee_percent: f64,

    /// Total value locked in lovelace, filled in by a derived job
    pub tvl: Option<u64>,

    /// Inputs consumed by the transaction that produced this state
    pub source_inputs: Vec<UTxOIdentifier>,
}

/// Fields shared by every AMM order row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMeta {
    pub dex: Dex,
    pub pool_id: EntityId,
    pub sender_pub_key_hash: Option<KeyHash>,
    pub sender_stake_key_hash: Option<KeyHash>,
    pub slot: Slot,
    pub tx_hash: TxHash,
    pub output_index: u16,
    pub batcher_fee: u64,
    pub deposit: u64,
}

impl OrderMeta {
    pub fn utxo(&self) -> UTxOIdentifier {
        UTxOIdentifier::new(self.tx_hash, self.output_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub id: EntityId,
    pub meta: OrderMeta,
    pub in_token: TokenRef,
    pub out_token: TokenRef,
    pub in_amount: u64,
    pub min_receive: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: EntityId,
    pub meta: OrderMeta,
    pub amount_a: u64,
    pub amount_b: u64,
    pub min_lp_receive: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdraw {
    pub id: EntityId,
    pub meta: OrderMeta,
    pub lp_amount: u64,
    pub min_receive_a: u64,
    pub min_receive_b: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zap {
    pub id: EntityId,
    pub meta: OrderMeta,
    pub in_token: TokenRef,
    pub out_token: TokenRef,
    pub in_amount: u64,
    pub min_lp_receive: u64,
}

/// Order book for an unordered token pair on one dex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub id: EntityId,
    pub dex: Dex,
    pub token_a: TokenRef,
    pub token_b: TokenRef,
    pub created_slot: Slot,
}

/// Standing limit order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookOrder {
    pub id: EntityId,
    pub order_book_id: EntityId,
    pub dex: Dex,
    pub identifier: Option<String>,
    pub from_token: TokenRef,
    pub to_token: TokenRef,
    pub original_offer_amount: u64,
    pub unfilled_offer_amount: u64,
    pub asked_amount: u64,

    /// `to_token` per unit of `from_token`
    pub price: f64,
    pub num_partial_fills: u32,
    pub is_cancelled: bool,
    pub sender_pub_key_hash: Option<KeyHash>,
    pub sender_stake_key_hash: Option<KeyHash>,
    pub slot: Slot,
    pub updated_slot: Slot,
    pub tx_hash: TxHash,
    pub output_index: u16,
}

impl OrderBookOrder {
    pub fn is_filled(&self) -> bool {
        self.unfilled_offer_amount == 0
    }

    pub fn is_open(&self) -> bool {
        !self.is_cancelled && !self.is_filled()
    }
}

/// Fill event against an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookMatch {
    pub id: EntityId,
    pub order_id: EntityId,
    pub order_book_id: EntityId,
    pub matched_token: TokenRef,
    pub matched_amount: u64,

    /// Asked-token amount paid to the maker, filled in by a derived job
    pub receiver_amount: Option<u64>,

    /// True when the match consumed the remaining order
    pub consumes_order: bool,

    /// Output of `tx_hash` that carries the order on after a partial fill
    #[serde(default)]
    pub continuing_output: Option<u16>,
    pub slot: Slot,
    pub tx_hash: TxHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Swap,
    Deposit,
    Withdraw,
    Zap,
    OrderBookOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatusKind {
    Pending,
    OnChain,
    Complete,
    Cancelled,
}

/// Links an operation to the transaction that moved it into `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub id: EntityId,
    pub operation_id: EntityId,
    pub operation_type: OperationKind,
    pub status: StatusKind,
    pub slot: Slot,
    pub tx_hash: TxHash,
    pub output_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TickResolution {
    Minute,
    Hour,
    Day,
}

impl TickResolution {
    pub const ALL: [TickResolution; 3] =
        [TickResolution::Minute, TickResolution::Hour, TickResolution::Day];

    pub fn seconds(&self) -> u64 {
        match self {
            TickResolution::Minute => 60,
            TickResolution::Hour => 3_600,
            TickResolution::Day => 86_400,
        }
    }

    /// Start of the bucket containing `time`
    pub fn bucket(&self, time: u64) -> u64 {
        time - time % self.seconds()
    }
}

/// OHLC price/volume bucket of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub id: EntityId,
    pub pool_id: EntityId,
    pub resolution: TickResolution,
    pub time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Domain events broadcast after each successful persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DexEvent {
    PoolState {
        pool: LiquidityPool,
        state: LiquidityPoolState,
    },
    Swap(Swap),
    Deposit(Deposit),
    Withdraw(Withdraw),
    Zap(Zap),
    Order(OrderBookOrder),
    Match(OrderBookMatch),
    Status(OperationStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dex_names_round_trip_through_config_strings() {
        for dex in Dex::ALL {
            assert_eq!(dex.name().parse::<Dex>().unwrap(), dex);
        }
        assert!("uniswap".parse::<Dex>().is_err());
    }

    #[test]
    fn tick_buckets() {
        assert_eq!(TickResolution::Minute.bucket(1_700_000_059), 1_700_000_040);
        assert_eq!(TickResolution::Hour.bucket(1_700_000_059), 1_699_999_200);
        assert_eq!(TickResolution::Day.bucket(1_700_000_059), 1_699_920_000);
    }
}
