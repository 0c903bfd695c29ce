//! Protocol analyzers and the helpers they share

pub mod genius_yield;
pub mod minswap;
pub mod sundaeswap;

use crate::decoder::{decode, Param, ParameterMap, Schema};
use crate::operation::{CancelTarget, Operation, OrderCancellationOp, Position, SenderKeys};
use dexwatch_common::{
    Datum, Dex, DexTransaction, Hash, RedeemerTag, Slot, TxOutput, UTxOIdentifier,
};
use tracing::trace;

/// Hash literal checked at compile time
pub(crate) const fn hash_from_hex<const N: usize>(hex: &str) -> Hash<N> {
    let digits = hex.as_bytes();
    assert!(digits.len() == N * 2, "hash literal has the wrong length");
    let mut bytes = [0u8; N];
    let mut i = 0;
    while i < N {
        bytes[i] = (nibble(digits[2 * i]) << 4) | nibble(digits[2 * i + 1]);
        i += 1;
    }
    Hash::new(bytes)
}

const fn nibble(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => panic!("invalid hex digit"),
    }
}

/// Decode an output's datum, treating a mismatch as "not this shape"
pub(crate) fn decode_output(schema: &Schema, output: &TxOutput) -> Option<ParameterMap> {
    let datum = output.datum.as_ref()?;
    match decode(schema, datum) {
        Ok(params) => Some(params),
        Err(e) => {
            trace!("Output {} does not match: {e}", output.index);
            None
        }
    }
}

pub(crate) fn position(tx: &DexTransaction, slot: Slot, output_index: u16) -> Position {
    Position {
        slot,
        tx_hash: tx.hash,
        output_index,
    }
}

pub(crate) fn sender(params: &ParameterMap) -> SenderKeys {
    SenderKeys {
        pub_key_hash: params.key_hash(Param::SenderPubKeyHash),
        stake_key_hash: params.key_hash(Param::SenderStakeKeyHash),
    }
}

/// Spent inputs in ledger order, which is the order spend redeemers index into
pub(crate) fn sorted_inputs(tx: &DexTransaction) -> Vec<UTxOIdentifier> {
    let mut inputs = tx.inputs.clone();
    inputs.sort();
    inputs
}

/// Spend redeemers by ascending index, paired with the input they unlock
pub(crate) fn spends(tx: &DexTransaction) -> Vec<(UTxOIdentifier, &Datum)> {
    let inputs = sorted_inputs(tx);
    let mut redeemers: Vec<_> = tx.redeemers_with_tag(RedeemerTag::Spend).collect();
    redeemers.sort_by_key(|redeemer| redeemer.index);
    redeemers
        .into_iter()
        .filter_map(|redeemer| {
            inputs.get(redeemer.index as usize).map(|input| (*input, &redeemer.data))
        })
        .collect()
}

/// AMM order cancellations: inputs spent with an empty constructor-1 redeemer in a
/// transaction that does not touch the pool. The reconciler ignores inputs that are not known
/// orders of `dex`.
pub(crate) fn amm_cancellations(
    dex: Dex,
    tx: &DexTransaction,
    slot: Slot,
    touches_pool: bool,
) -> Vec<Operation> {
    if touches_pool {
        return Vec::new();
    }
    spends(tx)
        .into_iter()
        .filter(|(_, data)| matches!(data, Datum::Constr { tag: 1, fields } if fields.is_empty()))
        .map(|(input, _)| {
            Operation::OrderCancellation(OrderCancellationOp {
                dex,
                target: CancelTarget::AmmOrder(input),
                position: position(tx, slot, 0),
            })
        })
        .collect()
}
