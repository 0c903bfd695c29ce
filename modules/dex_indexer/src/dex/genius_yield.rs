//! Genius Yield partial-fill order book.
//!
//! Every order output carries a unique NFT minted with the order, and the NFT name is the
//! order identifier. Opening an order mints the NFT. A partial fill spends the order and
//! recreates it with a smaller offered amount. Completing or cancelling an order burns the
//! NFT, and the spend redeemer says which of the two happened.

use std::sync::LazyLock;

use super::{decode_output, hash_from_hex, position, sender, spends};
use crate::analyzer::Analyzer;
use crate::decoder::{asset_class, stake_address, Param, ParameterMap, Schema};
use crate::operation::{
    CloseAction, Operation, OrderBookMatchOp, OrderBookOrderOp, OrderCloseOp, OrderTarget,
};
use dexwatch_common::{Datum, Dex, DexTransaction, PolicyId, Slot, TxOutput, UTxOIdentifier};

const ORDER_NFT_POLICY: PolicyId =
    hash_from_hex("22f6999d4effc0ade05f6e1a70b702c65d6b3cdf0e301e4a8267f585");

static ORDER_DATUM: LazyLock<Schema> = LazyLock::new(|| {
    Schema::constr(
        0,
        [
            Schema::Bytes(Param::SenderPubKeyHash),
            stake_address(),
            asset_class(Param::OfferedPolicy, Param::OfferedName),
            Schema::Int(Param::OriginalOffer),
            Schema::Int(Param::OfferedAmount),
            asset_class(Param::AskedPolicy, Param::AskedName),
            Schema::constr(
                0,
                [Schema::Int(Param::PriceNumerator), Schema::Int(Param::PriceDenominator)],
            ),
            Schema::Bytes(Param::OrderNft),
            // start, end
            Schema::Any,
            Schema::Any,
            Schema::Int(Param::PartialFills),
            // maker fee, taker fee, contained fee, contained payment
            Schema::Any,
            Schema::Any,
            Schema::Any,
            Schema::Any,
        ],
    )
});

/// Closing spend redeemers: `PartialCancel` and `CompleteFill`. Fills that keep the order
/// open are read off the continuing output instead.
fn close_action(data: &Datum) -> Option<CloseAction> {
    match data {
        Datum::Constr { tag: 0, fields } if fields.is_empty() => Some(CloseAction::Cancel),
        Datum::Constr { tag: 2, fields } if fields.is_empty() => Some(CloseAction::Fill),
        _ => None,
    }
}

pub struct GeniusYield {
    start_slot: Slot,
}

impl GeniusYield {
    pub fn new(start_slot: Slot) -> Self {
        Self { start_slot }
    }

    fn order_op(
        &self,
        tx: &DexTransaction,
        slot: Slot,
        output: &TxOutput,
        params: &ParameterMap,
    ) -> Option<OrderBookOrderOp> {
        let numerator = params.int(Param::PriceNumerator)?;
        let denominator = params.int(Param::PriceDenominator)?;
        if denominator <= 0 || numerator < 0 {
            return None;
        }
        let original = params.amount(Param::OriginalOffer)?;
        let unfilled = params.amount(Param::OfferedAmount)?;
        let asked = (original as i128).checked_mul(numerator)?.checked_div(denominator)?;
        let asked = u64::try_from(asked).ok()?;

        Some(OrderBookOrderOp {
            dex: Dex::GeniusYield,
            identifier: params.hex(Param::OrderNft),
            from_token: params.token(Param::OfferedPolicy, Param::OfferedName)?,
            to_token: params.token(Param::AskedPolicy, Param::AskedName)?,
            original_offer_amount: original,
            unfilled_offer_amount: unfilled,
            asked_amount: asked,
            price: numerator as f64 / denominator as f64,
            num_partial_fills: params.amount(Param::PartialFills)?.try_into().ok()?,
            sender: sender(params),
            position: position(tx, slot, output.index),
        })
    }
}

impl Analyzer for GeniusYield {
    fn dex(&self) -> Dex {
        Dex::GeniusYield
    }

    fn start_slot(&self) -> Slot {
        self.start_slot
    }

    fn analyze(&self, tx: &DexTransaction, slot: Slot) -> Vec<Operation> {
        let mut operations = Vec::new();

        let minted: Vec<_> = tx
            .mints
            .iter()
            .filter(|(class, quantity)| class.policy_id == ORDER_NFT_POLICY && *quantity > 0)
            .map(|(class, _)| class)
            .collect();

        for output in tx.outputs.iter() {
            if output.assets_of_policy(&ORDER_NFT_POLICY).next().is_none() {
                continue;
            }
            let Some(params) = decode_output(&ORDER_DATUM, output) else {
                continue;
            };
            let Some(order) = self.order_op(tx, slot, output, &params) else {
                continue;
            };

            let is_new = output
                .assets_of_policy(&ORDER_NFT_POLICY)
                .any(|(class, _)| minted.contains(&class));
            if is_new {
                operations.push(Operation::OrderBookOrder(order));
                continue;
            }

            // A continuing order was partially filled; the fill is what its offer shrank by
            let Some(identifier) = order.identifier.clone() else {
                continue;
            };
            operations.push(Operation::OrderBookMatch(OrderBookMatchOp {
                dex: Dex::GeniusYield,
                order: OrderTarget::Identifier(identifier),
                matched_token: Some(order.from_token.clone()),
                matched_amount: None,
                remaining: Some(order.unfilled_offer_amount),
                consumes_order: false,
                position: order.position,
            }));
        }

        let burned = tx.burned_names(&ORDER_NFT_POLICY);
        if !burned.is_empty() {
            let closing: Vec<(UTxOIdentifier, CloseAction)> = spends(tx)
                .into_iter()
                .filter_map(|(input, data)| Some((input, close_action(data)?)))
                .collect();
            for class in burned {
                operations.push(Operation::OrderClose(OrderCloseOp {
                    dex: Dex::GeniusYield,
                    order: OrderTarget::Identifier(class.name.to_hex()),
                    spends: closing.clone(),
                    position: position(tx, slot, 0),
                }));
            }
        }

        operations
    }
}
