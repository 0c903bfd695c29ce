use crate::{
    address::map_address,
    error::CodecError,
    plutus::map_plutus_data,
    utils::to_hash,
    value::{map_mint_burn, map_value},
};
use dexwatch_common::{
    Datum, DatumHash, DexTransaction, Redeemer, RedeemerTag, TxHash, TxOutput, UTxOIdentifier,
};
use pallas_primitives::conway;
use pallas_traverse::{MultiEraInput, MultiEraTx, OriginalHash};
use std::collections::HashMap;
use tracing::{debug, warn};

fn map_redeemer_tag(tag: &conway::RedeemerTag) -> RedeemerTag {
    match tag {
        conway::RedeemerTag::Spend => RedeemerTag::Spend,
        conway::RedeemerTag::Mint => RedeemerTag::Mint,
        conway::RedeemerTag::Cert => RedeemerTag::Cert,
        conway::RedeemerTag::Reward => RedeemerTag::Reward,
        conway::RedeemerTag::Vote => RedeemerTag::Vote,
        conway::RedeemerTag::Propose => RedeemerTag::Propose,
    }
}

fn map_input(input: &MultiEraInput) -> UTxOIdentifier {
    let oref = input.output_ref();
    UTxOIdentifier::new(TxHash::from(**oref.hash()), oref.index() as u16)
}

/// Decode a raw transaction and map it for the analyzers
pub fn decode_transaction(raw_tx: &[u8]) -> Result<DexTransaction, CodecError> {
    let tx = MultiEraTx::decode(raw_tx).map_err(|e| CodecError::Transaction(e.to_string()))?;
    Ok(map_transaction(&tx))
}

/// Map a Pallas transaction into the analyzer view.
/// Outputs, datums and redeemers that can't be mapped are skipped with a warning.
pub fn map_transaction(tx: &MultiEraTx) -> DexTransaction {
    let hash = TxHash::from(*tx.hash());

    // Witness datums, for outputs that only carry a datum hash
    let mut witness_datums: HashMap<DatumHash, Datum> = HashMap::new();
    for datum in tx.plutus_data() {
        match map_plutus_data(datum) {
            Ok(mapped) => {
                witness_datums.insert(to_hash(&datum.original_hash()), mapped);
            }
            Err(e) => debug!("Witness datum in {hash} ignored: {e}"),
        }
    }

    let mut outputs = Vec::new();
    for (index, output) in tx.outputs().iter().enumerate() {
        let address = match output.address() {
            Ok(pallas_address) => match map_address(&pallas_address) {
                Ok(address) => address,
                Err(e) => {
                    warn!("Output {index} of {hash} has been ignored: {e}");
                    continue;
                }
            },
            Err(e) => {
                warn!("Output {index} of {hash} has been ignored: {e}");
                continue;
            }
        };

        let datum = match output.datum() {
            Some(conway::MintedDatumOption::Hash(datum_hash)) => {
                witness_datums.get(&to_hash(&datum_hash)).cloned()
            }
            Some(conway::MintedDatumOption::Data(data)) => match map_plutus_data(&data.0) {
                Ok(datum) => Some(datum),
                Err(e) => {
                    debug!("Datum of output {index} in {hash} ignored: {e}");
                    None
                }
            },
            None => None,
        };

        let (lovelace, assets) = map_value(&output.value());
        outputs.push(TxOutput {
            index: index as u16,
            address,
            lovelace,
            assets,
            datum,
        });
    }

    let redeemers = tx
        .redeemers()
        .iter()
        .filter_map(|redeemer| match map_plutus_data(redeemer.data()) {
            Ok(data) => Some(Redeemer {
                tag: map_redeemer_tag(&redeemer.tag()),
                index: redeemer.index(),
                data,
            }),
            Err(e) => {
                debug!("Redeemer {} in {hash} ignored: {e}", redeemer.index());
                None
            }
        })
        .collect();

    DexTransaction {
        hash,
        valid: tx.is_valid(),
        inputs: tx.consumes().iter().map(map_input).collect(),
        reference_inputs: tx.reference_inputs().iter().map(map_input).collect(),
        outputs,
        mints: tx.mints().iter().flat_map(map_mint_burn).collect(),
        redeemers,
    }
}
