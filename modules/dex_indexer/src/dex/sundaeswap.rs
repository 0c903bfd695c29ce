//! SundaeSwap v3 pools and orders

use std::sync::LazyLock;

use super::{amm_cancellations, decode_output, hash_from_hex, position, sender};
use crate::analyzer::Analyzer;
use crate::decoder::{
    decode_into, stake_address, Param, ParamValue, ParameterMap, Schema,
    SchemaMismatch,
};
use crate::operation::{
    DepositOp, Operation, OrderHeader, PoolRef, PoolStateOp, SwapOp, WithdrawOp,
};
use dexwatch_common::{
    datum::DatumKind, AssetClass, AssetName, Datum, Dex, DexTransaction, ScriptHash, Slot, Token,
    TxOutput,
};

/// Pool validator; also the policy of the pool NFTs and LP tokens
const POOL_SCRIPT: ScriptHash =
    hash_from_hex("e0302560ced2fdcbfcb2602697df970cd0d6a38f94b32703f51c312b");
const ORDER_SCRIPT: ScriptHash =
    hash_from_hex("fa6a58bbe2d0ff05534431c8e2f0ef2cbdc1602a8456e4b13c8f3077");

/// CIP-68 labels prefixed to the pool ident
const POOL_NFT_PREFIX: [u8; 4] = [0x00, 0x0d, 0xe1, 0x40];
const LP_PREFIX: [u8; 4] = [0x00, 0x14, 0xdf, 0x10];

const DETAILS_SWAP: i128 = 1;
const DETAILS_DEPOSIT: i128 = 2;
const DETAILS_WITHDRAWAL: i128 = 3;

fn pool_assets() -> Schema {
    Schema::list([
        Schema::list([Schema::Bytes(Param::TokenAPolicy), Schema::Bytes(Param::TokenAName)]),
        Schema::list([Schema::Bytes(Param::TokenBPolicy), Schema::Bytes(Param::TokenBName)]),
    ])
}

static POOL_DATUM: LazyLock<Schema> = LazyLock::new(|| {
    Schema::one_of([
        Schema::constr(
            0,
            [
                Schema::Bytes(Param::PoolIdentifier),
                pool_assets(),
                Schema::Int(Param::LpTokens),
                Schema::Int(Param::BidFee),
                Schema::Int(Param::AskFee),
                // fee manager, market open
                Schema::Any,
                Schema::Any,
                Schema::Int(Param::ProtocolFees),
            ],
        ),
        // Early layout with a single (bid, ask) fee pair
        Schema::constr(
            0,
            [
                Schema::Bytes(Param::PoolIdentifier),
                pool_assets(),
                Schema::Int(Param::LpTokens),
                Schema::list([Schema::Int(Param::BidFee), Schema::Int(Param::AskFee)]),
                Schema::Any,
                Schema::Any,
                Schema::Int(Param::ProtocolFees),
            ],
        ),
    ])
});

static ORDER_DATUM: LazyLock<Schema> = LazyLock::new(|| {
    Schema::constr(
        0,
        [
            Schema::one_of([
                Schema::constr(0, [Schema::Bytes(Param::PoolIdentifier)]),
                Schema::constr(1, Vec::new()),
            ]),
            Schema::one_of([
                Schema::constr(0, [Schema::Bytes(Param::SenderPubKeyHash)]),
                // Multisig owners carry no single key
                Schema::Any,
            ]),
            Schema::Int(Param::BatcherFee),
            Schema::one_of([
                Schema::constr(0, [stake_address(), Schema::Any]),
                Schema::constr(1, Vec::new()),
            ]),
            Schema::Custom(order_details),
            // extension
            Schema::Any,
        ],
    )
});

fn amount(policy: Param, name: Param, quantity: Param) -> Schema {
    Schema::list([Schema::Bytes(policy), Schema::Bytes(name), Schema::Int(quantity)])
}

static ORDER_DETAILS: LazyLock<[Schema; 3]> = LazyLock::new(|| {
    [
        Schema::constr(
            1,
            [
                amount(Param::InPolicy, Param::InName, Param::InAmount),
                amount(Param::OutPolicy, Param::OutName, Param::MinReceive),
            ],
        ),
        Schema::constr(
            2,
            [Schema::list([
                amount(Param::TokenAPolicy, Param::TokenAName, Param::AmountA),
                amount(Param::TokenBPolicy, Param::TokenBName, Param::AmountB),
            ])],
        ),
        Schema::constr(3, [Schema::list([Schema::Any, Schema::Any, Schema::Int(Param::LpAmount)])]),
    ]
});

fn order_details(datum: &Datum, params: &mut ParameterMap) -> Result<(), SchemaMismatch> {
    let Datum::Constr { tag, .. } = datum else {
        return Err(SchemaMismatch::Kind {
            expected: DatumKind::Constr,
            found: datum.kind(),
        });
    };
    let schema = match *tag as i128 {
        DETAILS_SWAP => &ORDER_DETAILS[0],
        DETAILS_DEPOSIT => &ORDER_DETAILS[1],
        DETAILS_WITHDRAWAL => &ORDER_DETAILS[2],
        _ => return Err(SchemaMismatch::Rejected("unsupported SundaeSwap order")),
    };
    decode_into(schema, datum, params)?;
    params.insert(Param::OrderStep, ParamValue::Int(*tag as i128));
    Ok(())
}

pub struct SundaeSwapV3 {
    start_slot: Slot,
}

impl SundaeSwapV3 {
    pub fn new(start_slot: Slot) -> Self {
        Self { start_slot }
    }

    fn pool_state(&self, tx: &DexTransaction, slot: Slot, output: &TxOutput) -> Option<Operation> {
        let params = decode_output(&POOL_DATUM, output)?;
        let ident = params.bytes(Param::PoolIdentifier)?;

        // The pool NFT authenticates the output
        let nft = AssetClass::new(POOL_SCRIPT, prefixed(&POOL_NFT_PREFIX, ident)?);
        if output.amount_of(&Token::Asset(nft)) != 1 {
            return None;
        }

        let token_a = params.token(Param::TokenAPolicy, Param::TokenAName)?;
        let token_b = params.token(Param::TokenBPolicy, Param::TokenBName)?;
        let protocol_fees = params.amount(Param::ProtocolFees).unwrap_or_default();
        let mut reserve_a = output.amount_of(&token_a);
        if token_a.is_lovelace() {
            reserve_a = reserve_a.saturating_sub(protocol_fees);
        }
        let bid_fee = params.amount(Param::BidFee)?;

        Some(Operation::PoolState(PoolStateOp {
            dex: Dex::SundaeSwapV3,
            identifier: hex::encode(ident),
            address: output.address.bech32.clone(),
            reserve_a,
            reserve_b: output.amount_of(&token_b),
            token_a,
            token_b,
            token_lp: Some(Token::Asset(AssetClass::new(
                POOL_SCRIPT,
                prefixed(&LP_PREFIX, ident)?,
            ))),
            lp_tokens: params.amount(Param::LpTokens),
            // Fees are per ten thousand
            fee_percent: bid_fee as f64 / 100.0,
            position: position(tx, slot, output.index),
            source_inputs: tx.inputs.clone(),
        }))
    }

    fn order(&self, tx: &DexTransaction, slot: Slot, output: &TxOutput) -> Option<Operation> {
        let params = decode_output(&ORDER_DATUM, output)?;
        let ident = params.hex(Param::PoolIdentifier);
        let header = |pair: Option<(Token, Token)>| OrderHeader {
            dex: Dex::SundaeSwapV3,
            pool: PoolRef {
                identifier: ident.clone(),
                pair: if ident.is_some() { None } else { pair },
            },
            sender: sender(&params),
            position: position(tx, slot, output.index),
            batcher_fee: params.amount(Param::BatcherFee).unwrap_or_default(),
            deposit: 0,
        };

        match params.int(Param::OrderStep)? {
            DETAILS_SWAP => {
                let in_token = params.token(Param::InPolicy, Param::InName)?;
                let out_token = params.token(Param::OutPolicy, Param::OutName)?;
                Some(Operation::Swap(SwapOp {
                    header: header(Some((in_token.clone(), out_token.clone()))),
                    in_amount: params.amount(Param::InAmount)?,
                    min_receive: params.amount(Param::MinReceive)?,
                    in_token,
                    out_token,
                }))
            }
            DETAILS_DEPOSIT => {
                let a = params.token(Param::TokenAPolicy, Param::TokenAName)?;
                let b = params.token(Param::TokenBPolicy, Param::TokenBName)?;
                Some(Operation::Deposit(DepositOp {
                    header: header(Some((a.clone(), b.clone()))),
                    amounts: [
                        (a, params.amount(Param::AmountA)?),
                        (b, params.amount(Param::AmountB)?),
                    ],
                    min_lp_receive: 0,
                }))
            }
            DETAILS_WITHDRAWAL => {
                // Without a pool hint, the LP token held names the pool
                let mut withdraw_header = header(None);
                if withdraw_header.pool.identifier.is_none() {
                    let lp = output
                        .assets_of_policy(&POOL_SCRIPT)
                        .find(|(class, _)| class.name.as_slice().starts_with(&LP_PREFIX))?;
                    withdraw_header.pool =
                        PoolRef::by_identifier(hex::encode(&lp.0.name.as_slice()[4..]));
                }
                Some(Operation::Withdraw(WithdrawOp {
                    header: withdraw_header,
                    lp_amount: params.amount(Param::LpAmount)?,
                    min_receive_a: 0,
                    min_receive_b: 0,
                }))
            }
            _ => None,
        }
    }
}

fn prefixed(prefix: &[u8; 4], ident: &[u8]) -> Option<AssetName> {
    let mut name = prefix.to_vec();
    name.extend_from_slice(ident);
    AssetName::new(&name)
}

impl Analyzer for SundaeSwapV3 {
    fn dex(&self) -> Dex {
        Dex::SundaeSwapV3
    }

    fn start_slot(&self) -> Slot {
        self.start_slot
    }

    fn analyze(&self, tx: &DexTransaction, slot: Slot) -> Vec<Operation> {
        let mut operations: Vec<Operation> = tx
            .outputs_at_script(&[POOL_SCRIPT])
            .filter_map(|output| self.pool_state(tx, slot, output))
            .collect();
        let touches_pool = !operations.is_empty();

        operations.extend(
            tx.outputs_at_script(&[ORDER_SCRIPT]).filter_map(|output| self.order(tx, slot, output)),
        );
        operations.extend(amm_cancellations(Dex::SundaeSwapV3, tx, slot, touches_pool));
        operations
    }
}
