//! Typed operations emitted by the protocol analyzers

use dexwatch_common::{Dex, KeyHash, Slot, Token, TxHash, UTxOIdentifier};

/// How an AMM order names its pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolRef {
    /// Protocol identifier of the pool, when the order carries one
    pub identifier: Option<String>,

    /// Traded pair, used when there is no identifier
    pub pair: Option<(Token, Token)>,
}

impl PoolRef {
    pub fn by_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            pair: None,
        }
    }

    pub fn by_pair(a: Token, b: Token) -> Self {
        Self {
            identifier: None,
            pair: Some((a, b)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderKeys {
    pub pub_key_hash: Option<KeyHash>,
    pub stake_key_hash: Option<KeyHash>,
}

/// Where an operation was found on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub slot: Slot,
    pub tx_hash: TxHash,
    pub output_index: u16,
}

impl Position {
    pub fn utxo(&self) -> UTxOIdentifier {
        UTxOIdentifier::new(self.tx_hash, self.output_index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolStateOp {
    pub dex: Dex,
    pub identifier: String,
    pub address: String,
    pub token_a: Token,
    pub token_b: Token,
    pub token_lp: Option<Token>,
    pub reserve_a: u64,
    pub reserve_b: u64,
    pub lp_tokens: Option<u64>,
    pub fee_percent: f64,
    pub position: Position,

    /// Inputs consumed by the producing transaction
    pub source_inputs: Vec<UTxOIdentifier>,
}

/// Fields shared by AMM order operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHeader {
    pub dex: Dex,
    pub pool: PoolRef,
    pub sender: SenderKeys,
    pub position: Position,
    pub batcher_fee: u64,
    pub deposit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapOp {
    pub header: OrderHeader,
    pub in_token: Token,
    pub out_token: Token,
    pub in_amount: u64,
    pub min_receive: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositOp {
    pub header: OrderHeader,
    pub amounts: [(Token, u64); 2],
    pub min_lp_receive: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawOp {
    pub header: OrderHeader,
    pub lp_amount: u64,
    pub min_receive_a: u64,
    pub min_receive_b: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapOp {
    pub header: OrderHeader,
    pub in_token: Token,
    pub out_token: Token,
    pub in_amount: u64,
    pub min_lp_receive: u64,
}

/// Standing limit order, new or re-stated
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookOrderOp {
    pub dex: Dex,
    pub identifier: Option<String>,
    pub from_token: Token,
    pub to_token: Token,
    pub original_offer_amount: u64,
    pub unfilled_offer_amount: u64,
    pub asked_amount: u64,
    pub price: f64,
    pub num_partial_fills: u32,
    pub sender: SenderKeys,
    pub position: Position,
}

/// Which order a match or cancellation refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTarget {
    /// Stable protocol identifier
    Identifier(String),

    /// Originating transaction and sender, for protocols without identifiers
    Origin {
        tx_hash: TxHash,
        output_index: u16,
        sender: SenderKeys,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookMatchOp {
    pub dex: Dex,
    pub order: OrderTarget,

    /// Token taken from the order; the order's offered token when absent
    pub matched_token: Option<Token>,

    /// Amount taken, when the transaction states it
    pub matched_amount: Option<u64>,

    /// Unfilled amount left on the continuing order, when there is one
    pub remaining: Option<u64>,
    pub consumes_order: bool,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelTarget {
    /// Order-book order
    Order(OrderTarget),

    /// AMM order spent back to its owner
    AmmOrder(UTxOIdentifier),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderCancellationOp {
    pub dex: Dex,
    pub target: CancelTarget,
    pub position: Position,
}

/// What a closing spend redeemer says happened to an order-book order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    Fill,
    Cancel,
}

/// Order-book order whose identifying token was burned.
///
/// Which spent input held the order is only known to the model, so every closing spend of
/// the transaction comes along and the reconciler picks the one unlocking the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderCloseOp {
    pub dex: Dex,
    pub order: OrderTarget,
    pub spends: Vec<(UTxOIdentifier, CloseAction)>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    PoolState(PoolStateOp),
    Swap(SwapOp),
    Deposit(DepositOp),
    Withdraw(WithdrawOp),
    Zap(ZapOp),
    OrderBookOrder(OrderBookOrderOp),
    OrderBookMatch(OrderBookMatchOp),
    OrderCancellation(OrderCancellationOp),
    OrderClose(OrderCloseOp),
}

/// Something an operation makes available to later operations in the same block
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyKey {
    Utxo(UTxOIdentifier),
    Pool(Dex, String),
    Pair(Dex, Token, Token),
    Order(Dex, String),
}

impl DependencyKey {
    /// Pair key with the tokens in canonical order
    pub fn pair(dex: Dex, a: &Token, b: &Token) -> Self {
        if a <= b {
            DependencyKey::Pair(dex, a.clone(), b.clone())
        } else {
            DependencyKey::Pair(dex, b.clone(), a.clone())
        }
    }
}

impl Operation {
    pub fn dex(&self) -> Dex {
        match self {
            Operation::PoolState(op) => op.dex,
            Operation::Swap(op) => op.header.dex,
            Operation::Deposit(op) => op.header.dex,
            Operation::Withdraw(op) => op.header.dex,
            Operation::Zap(op) => op.header.dex,
            Operation::OrderBookOrder(op) => op.dex,
            Operation::OrderBookMatch(op) => op.dex,
            Operation::OrderCancellation(op) => op.dex,
            Operation::OrderClose(op) => op.dex,
        }
    }

    pub fn position(&self) -> &Position {
        match self {
            Operation::PoolState(op) => &op.position,
            Operation::Swap(op) => &op.header.position,
            Operation::Deposit(op) => &op.header.position,
            Operation::Withdraw(op) => &op.header.position,
            Operation::Zap(op) => &op.header.position,
            Operation::OrderBookOrder(op) => &op.position,
            Operation::OrderBookMatch(op) => &op.position,
            Operation::OrderCancellation(op) => &op.position,
            Operation::OrderClose(op) => &op.position,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::PoolState(_) => "pool-state",
            Operation::Swap(_) => "swap",
            Operation::Deposit(_) => "deposit",
            Operation::Withdraw(_) => "withdraw",
            Operation::Zap(_) => "zap",
            Operation::OrderBookOrder(_) => "order",
            Operation::OrderBookMatch(_) => "match",
            Operation::OrderCancellation(_) => "cancellation",
            Operation::OrderClose(_) => "close",
        }
    }

    fn amm_header(&self) -> Option<&OrderHeader> {
        match self {
            Operation::Swap(op) => Some(&op.header),
            Operation::Deposit(op) => Some(&op.header),
            Operation::Withdraw(op) => Some(&op.header),
            Operation::Zap(op) => Some(&op.header),
            _ => None,
        }
    }

    /// Keys this operation establishes
    pub fn provides(&self) -> Vec<DependencyKey> {
        let own = DependencyKey::Utxo(self.position().utxo());
        match self {
            Operation::PoolState(op) => vec![
                own,
                DependencyKey::Pool(op.dex, op.identifier.clone()),
                DependencyKey::pair(op.dex, &op.token_a, &op.token_b),
            ],
            Operation::OrderBookOrder(op) => {
                let mut keys = vec![own];
                if let Some(identifier) = &op.identifier {
                    keys.push(DependencyKey::Order(op.dex, identifier.clone()));
                }
                keys
            }
            Operation::OrderBookMatch(_)
            | Operation::OrderCancellation(_)
            | Operation::OrderClose(_) => Vec::new(),
            _ => vec![own],
        }
    }

    /// Keys this operation needs to have been persisted first
    pub fn depends_on(&self) -> Vec<DependencyKey> {
        if let Some(header) = self.amm_header() {
            let mut keys = Vec::new();
            if let Some(identifier) = &header.pool.identifier {
                keys.push(DependencyKey::Pool(header.dex, identifier.clone()));
            }
            if let Some((a, b)) = &header.pool.pair {
                keys.push(DependencyKey::pair(header.dex, a, b));
            }
            return keys;
        }

        let order_key = |dex: Dex, target: &OrderTarget| match target {
            OrderTarget::Identifier(identifier) => DependencyKey::Order(dex, identifier.clone()),
            OrderTarget::Origin {
                tx_hash,
                output_index,
                ..
            } => DependencyKey::Utxo(UTxOIdentifier::new(*tx_hash, *output_index)),
        };

        match self {
            Operation::OrderBookMatch(op) => vec![order_key(op.dex, &op.order)],
            Operation::OrderClose(op) => vec![order_key(op.dex, &op.order)],
            Operation::OrderCancellation(op) => match &op.target {
                CancelTarget::Order(target) => vec![order_key(op.dex, target)],
                CancelTarget::AmmOrder(utxo) => vec![DependencyKey::Utxo(*utxo)],
            },
            _ => Vec::new(),
        }
    }
}
