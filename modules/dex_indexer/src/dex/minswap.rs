//! Minswap v1 constant-product pools and batched orders

use std::sync::LazyLock;

use super::{amm_cancellations, decode_output, hash_from_hex, position, sender};
use crate::analyzer::Analyzer;
use crate::decoder::{
    asset_class, decode_into, sender_address, Param, ParamValue, ParameterMap, Schema,
    SchemaMismatch,
};
use crate::operation::{
    DepositOp, Operation, OrderHeader, PoolRef, PoolStateOp, SwapOp, WithdrawOp, ZapOp,
};
use dexwatch_common::{
    AssetClass, Datum, Dex, DexTransaction, PolicyId, ScriptHash, Slot, Token, TxOutput,
};

const POOL_SCRIPT: ScriptHash =
    hash_from_hex("e1317b152faac13426e6a83e06ff88a4d62cce3c1634ab0a5ec13309");
const POOL_NFT_POLICY: PolicyId =
    hash_from_hex("0be55d262b29f564998ff81efe21bdc0022621c12f15af08d0f2ddb1");
const LP_POLICY: PolicyId =
    hash_from_hex("e4214b7cce62ac6fbba385d164df48e157eae5863521b5b67ca71d86");
const ORDER_SCRIPT: ScriptHash =
    hash_from_hex("a65ca58a4e9c755fa830173d2a5caed458ac0c73f97db7faae2e7e3b");

const FEE_PERCENT: f64 = 0.3;

const STEP_SWAP_EXACT_IN: i128 = 0;
const STEP_SWAP_EXACT_OUT: i128 = 1;
const STEP_DEPOSIT: i128 = 2;
const STEP_WITHDRAW: i128 = 3;
const STEP_ZAP_IN: i128 = 4;

static POOL_DATUM: LazyLock<Schema> = LazyLock::new(|| {
    Schema::constr(
        0,
        [
            asset_class(Param::TokenAPolicy, Param::TokenAName),
            asset_class(Param::TokenBPolicy, Param::TokenBName),
            Schema::Int(Param::LpTokens),
            // rootKLast, profit sharing
            Schema::Any,
            Schema::Any,
        ],
    )
});

static ORDER_DATUM: LazyLock<Schema> = LazyLock::new(|| {
    Schema::constr(
        0,
        [
            sender_address(),
            // receiver address, receiver datum hash
            Schema::Any,
            Schema::Any,
            Schema::Custom(order_step),
            Schema::Int(Param::BatcherFee),
            Schema::Int(Param::Deposit),
        ],
    )
});

static ORDER_STEPS: LazyLock<[Schema; 5]> = LazyLock::new(|| {
    [
        Schema::constr(
            0,
            [asset_class(Param::OutPolicy, Param::OutName), Schema::Int(Param::MinReceive)],
        ),
        Schema::constr(
            1,
            [asset_class(Param::OutPolicy, Param::OutName), Schema::Int(Param::MinReceive)],
        ),
        Schema::constr(2, [Schema::Int(Param::MinLpReceive)]),
        Schema::constr(3, [Schema::Int(Param::MinReceiveA), Schema::Int(Param::MinReceiveB)]),
        Schema::constr(
            4,
            [asset_class(Param::OutPolicy, Param::OutName), Schema::Int(Param::MinLpReceive)],
        ),
    ]
});

/// Selects the step layout by constructor tag and records which one matched
fn order_step(datum: &Datum, params: &mut ParameterMap) -> Result<(), SchemaMismatch> {
    let Datum::Constr { tag, .. } = datum else {
        return Err(SchemaMismatch::Kind {
            expected: dexwatch_common::datum::DatumKind::Constr,
            found: datum.kind(),
        });
    };
    let schema = ORDER_STEPS
        .get(*tag as usize)
        .ok_or(SchemaMismatch::Rejected("unknown Minswap order step"))?;
    decode_into(schema, datum, params)?;
    params.insert(Param::OrderStep, ParamValue::Int(*tag as i128));
    Ok(())
}

pub struct Minswap {
    start_slot: Slot,
}

impl Minswap {
    pub fn new(start_slot: Slot) -> Self {
        Self { start_slot }
    }

    fn pool_state(&self, tx: &DexTransaction, slot: Slot, output: &TxOutput) -> Option<Operation> {
        let (nft, _) = output.assets_of_policy(&POOL_NFT_POLICY).next()?;
        let params = decode_output(&POOL_DATUM, output)?;
        let token_a = params.token(Param::TokenAPolicy, Param::TokenAName)?;
        let token_b = params.token(Param::TokenBPolicy, Param::TokenBName)?;

        Some(Operation::PoolState(PoolStateOp {
            dex: Dex::Minswap,
            identifier: nft.name.to_hex(),
            address: output.address.bech32.clone(),
            reserve_a: output.amount_of(&token_a),
            reserve_b: output.amount_of(&token_b),
            token_a,
            token_b,
            token_lp: Some(Token::Asset(AssetClass::new(LP_POLICY, nft.name.clone()))),
            lp_tokens: params.amount(Param::LpTokens),
            fee_percent: FEE_PERCENT,
            position: position(tx, slot, output.index),
            source_inputs: tx.inputs.clone(),
        }))
    }

    fn order(&self, tx: &DexTransaction, slot: Slot, output: &TxOutput) -> Option<Operation> {
        let params = decode_output(&ORDER_DATUM, output)?;
        let batcher_fee = params.amount(Param::BatcherFee)?;
        let deposit = params.amount(Param::Deposit)?;
        // Fees no output could carry
        let reserved = batcher_fee.checked_add(deposit)?;
        let header = |pool: PoolRef| OrderHeader {
            dex: Dex::Minswap,
            pool,
            sender: sender(&params),
            position: position(tx, slot, output.index),
            batcher_fee,
            deposit,
        };
        // Lovelace beyond the batcher fee and the returned deposit is what the order offers
        let offered_lovelace = output.lovelace.saturating_sub(reserved);

        match params.int(Param::OrderStep)? {
            STEP_SWAP_EXACT_IN | STEP_SWAP_EXACT_OUT => {
                let out_token = params.token(Param::OutPolicy, Param::OutName)?;
                let (in_token, in_amount) = offered(output, &out_token, offered_lovelace);
                Some(Operation::Swap(SwapOp {
                    header: header(PoolRef::by_pair(in_token.clone(), out_token.clone())),
                    in_token,
                    out_token,
                    in_amount,
                    min_receive: params.amount(Param::MinReceive)?,
                }))
            }
            STEP_DEPOSIT => {
                let mut held: Vec<(Token, u64)> = output
                    .assets
                    .iter()
                    .map(|(class, quantity)| (Token::Asset(class.clone()), *quantity))
                    .collect();
                if held.len() == 1 {
                    held.insert(0, (Token::Lovelace, offered_lovelace));
                }
                let [a, b]: [(Token, u64); 2] = held.try_into().ok()?;
                Some(Operation::Deposit(DepositOp {
                    header: header(PoolRef::by_pair(a.0.clone(), b.0.clone())),
                    amounts: [a, b],
                    min_lp_receive: params.amount(Param::MinLpReceive)?,
                }))
            }
            STEP_WITHDRAW => {
                let (lp, lp_amount) = output.assets_of_policy(&LP_POLICY).next()?;
                Some(Operation::Withdraw(WithdrawOp {
                    header: header(PoolRef::by_identifier(lp.name.to_hex())),
                    lp_amount: *lp_amount,
                    min_receive_a: params.amount(Param::MinReceiveA)?,
                    min_receive_b: params.amount(Param::MinReceiveB)?,
                }))
            }
            STEP_ZAP_IN => {
                let out_token = params.token(Param::OutPolicy, Param::OutName)?;
                let (in_token, in_amount) = offered(output, &out_token, offered_lovelace);
                Some(Operation::Zap(ZapOp {
                    header: header(PoolRef::by_pair(in_token.clone(), out_token.clone())),
                    in_token,
                    out_token,
                    in_amount,
                    min_lp_receive: params.amount(Param::MinLpReceive)?,
                }))
            }
            _ => None,
        }
    }
}

/// Token an order offers: the first held asset that is not the desired one, else ada
fn offered(output: &TxOutput, desired: &Token, offered_lovelace: u64) -> (Token, u64) {
    output
        .assets
        .iter()
        .find(|(class, _)| desired.asset() != Some(class))
        .map(|(class, quantity)| (Token::Asset(class.clone()), *quantity))
        .unwrap_or((Token::Lovelace, offered_lovelace))
}

impl Analyzer for Minswap {
    fn dex(&self) -> Dex {
        Dex::Minswap
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
        operations.extend(amm_cancellations(Dex::Minswap, tx, slot, touches_pool));
        operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::fixtures::*;
    use dexwatch_common::{Redeemer, RedeemerTag, UTxOIdentifier};

    const MIN: &[u8] = b"MIN";

    fn min_policy() -> PolicyId {
        PolicyId::new([0x29; 28])
    }

    fn pool_tx() -> DexTransaction {
        let nft = asset(POOL_NFT_POLICY, &[0xaa, 0xbb]);
        let datum = Datum::constr(
            0,
            vec![
                asset_datum(b"", b""),
                asset_datum(&*min_policy(), MIN),
                Datum::int(1_000_000),
                Datum::constr(1, vec![]),
                Datum::constr(1, vec![]),
            ],
        );
        DexTransaction {
            hash: tx_hash(1),
            valid: true,
            inputs: vec![UTxOIdentifier::new(tx_hash(9), 0)],
            outputs: vec![output(
                0,
                script_address(POOL_SCRIPT),
                500_000_000,
                vec![(nft, 1), (asset(min_policy(), MIN), 2_000_000_000)],
                Some(datum),
            )],
            ..Default::default()
        }
    }

    fn order_datum(step: Datum) -> Datum {
        order_datum_with_fees(step, 2_000_000, 2_000_000)
    }

    fn order_datum_with_fees(step: Datum, batcher_fee: u64, deposit: u64) -> Datum {
        Datum::constr(
            0,
            vec![
                plutus_address(key(1), key(2)),
                plutus_address(key(1), key(2)),
                Datum::constr(1, vec![]),
                step,
                Datum::int(batcher_fee),
                Datum::int(deposit),
            ],
        )
    }

    fn order_tx(step: Datum, lovelace: u64, assets: Vec<(AssetClass, u64)>) -> DexTransaction {
        DexTransaction {
            hash: tx_hash(2),
            valid: true,
            outputs: vec![output(
                1,
                script_address(ORDER_SCRIPT),
                lovelace,
                assets,
                Some(order_datum(step)),
            )],
            ..Default::default()
        }
    }

    #[test]
    fn pool_output_yields_state() {
        let operations = Minswap::new(0).analyze(&pool_tx(), 1_000);
        assert_eq!(operations.len(), 1);
        let Operation::PoolState(state) = &operations[0] else {
            panic!("expected pool state");
        };
        assert_eq!(state.identifier, "aabb");
        assert_eq!(state.token_a, Token::Lovelace);
        assert_eq!(state.reserve_a, 500_000_000);
        assert_eq!(state.reserve_b, 2_000_000_000);
        assert_eq!(state.lp_tokens, Some(1_000_000));
        assert_eq!(
            state.token_lp,
            Some(Token::Asset(asset(LP_POLICY, &[0xaa, 0xbb])))
        );
        assert_eq!(state.source_inputs, vec![UTxOIdentifier::new(tx_hash(9), 0)]);
        assert_eq!(state.position.output_index, 0);
    }

    #[test]
    fn pool_without_nft_is_ignored() {
        let mut tx = pool_tx();
        tx.outputs[0].assets.remove(0);
        assert!(Minswap::new(0).analyze(&tx, 1_000).is_empty());
    }

    #[test]
    fn ada_swap_order() {
        let step = Datum::constr(0, vec![asset_datum(&*min_policy(), MIN), Datum::int(900)]);
        let tx = order_tx(step, 14_000_000, vec![]);
        let operations = Minswap::new(0).analyze(&tx, 1_000);
        let [Operation::Swap(swap)] = operations.as_slice() else {
            panic!("expected one swap, got {operations:?}");
        };
        assert_eq!(swap.in_token, Token::Lovelace);
        assert_eq!(swap.in_amount, 10_000_000);
        assert_eq!(swap.out_token, Token::Asset(asset(min_policy(), MIN)));
        assert_eq!(swap.min_receive, 900);
        assert_eq!(swap.header.sender.pub_key_hash, Some(key(1)));
        assert_eq!(swap.header.sender.stake_key_hash, Some(key(2)));
        assert_eq!(swap.header.pool.pair, Some((swap.in_token.clone(), swap.out_token.clone())));
        assert_eq!(swap.header.position.output_index, 1);
    }

    #[test]
    fn token_swap_offers_held_asset() {
        let step = Datum::constr(0, vec![asset_datum(b"", b""), Datum::int(5)]);
        let tx = order_tx(step, 4_000_000, vec![(asset(min_policy(), MIN), 777)]);
        let operations = Minswap::new(0).analyze(&tx, 1_000);
        let [Operation::Swap(swap)] = operations.as_slice() else {
            panic!("expected one swap");
        };
        assert_eq!(swap.in_token, Token::Asset(asset(min_policy(), MIN)));
        assert_eq!(swap.in_amount, 777);
        assert_eq!(swap.out_token, Token::Lovelace);
    }

    #[test]
    fn deposit_withdraw_and_zap_steps() {
        let deposit = order_tx(
            Datum::constr(2, vec![Datum::int(10)]),
            9_000_000,
            vec![(asset(min_policy(), MIN), 50)],
        );
        let operations = Minswap::new(0).analyze(&deposit, 1);
        let [Operation::Deposit(op)] = operations.as_slice() else {
            panic!("expected deposit");
        };
        assert_eq!(op.amounts[0], (Token::Lovelace, 5_000_000));
        assert_eq!(op.amounts[1].1, 50);
        assert_eq!(op.min_lp_receive, 10);

        let withdraw = order_tx(
            Datum::constr(3, vec![Datum::int(1), Datum::int(2)]),
            4_000_000,
            vec![(asset(LP_POLICY, &[0xaa, 0xbb]), 300)],
        );
        let operations = Minswap::new(0).analyze(&withdraw, 1);
        let [Operation::Withdraw(op)] = operations.as_slice() else {
            panic!("expected withdraw");
        };
        assert_eq!(op.header.pool, PoolRef::by_identifier("aabb"));
        assert_eq!(op.lp_amount, 300);
        assert_eq!((op.min_receive_a, op.min_receive_b), (1, 2));

        let zap = order_tx(
            Datum::constr(4, vec![asset_datum(&*min_policy(), MIN), Datum::int(3)]),
            24_000_000,
            vec![],
        );
        let operations = Minswap::new(0).analyze(&zap, 1);
        let [Operation::Zap(op)] = operations.as_slice() else {
            panic!("expected zap");
        };
        assert_eq!(op.in_amount, 20_000_000);
        assert_eq!(op.min_lp_receive, 3);
    }

    #[test]
    fn fees_beyond_u64_drop_the_order() {
        let step = Datum::constr(0, vec![asset_datum(&*min_policy(), MIN), Datum::int(900)]);
        let mut tx = order_tx(step.clone(), 14_000_000, vec![]);
        tx.outputs[0].datum = Some(order_datum_with_fees(step, u64::MAX, 2_000_000));
        assert!(Minswap::new(0).analyze(&tx, 1_000).is_empty());
    }

    #[test]
    fn unknown_step_is_not_an_order() {
        let tx = order_tx(Datum::constr(9, vec![]), 4_000_000, vec![]);
        assert!(Minswap::new(0).analyze(&tx, 1).is_empty());
    }

    #[test]
    fn cancel_redeemer_without_pool_is_a_cancellation() {
        let order = UTxOIdentifier::new(tx_hash(7), 3);
        let tx = DexTransaction {
            hash: tx_hash(3),
            valid: true,
            inputs: vec![order],
            redeemers: vec![Redeemer {
                tag: RedeemerTag::Spend,
                index: 0,
                data: Datum::constr(1, vec![]),
            }],
            ..Default::default()
        };
        let operations = Minswap::new(0).analyze(&tx, 1);
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].kind(), "cancellation");
    }
}
