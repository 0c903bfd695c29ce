use crate::utils::to_hash;
use dexwatch_common::{AssetClass, AssetName, Lovelace};
use pallas_traverse::{MultiEraPolicyAssets, MultiEraValue};

/// Split an output value into lovelace and a flat list of native assets
pub fn map_value(pallas_value: &MultiEraValue) -> (Lovelace, Vec<(AssetClass, u64)>) {
    let lovelace = pallas_value.coin();
    let mut assets = Vec::new();

    for policy_group in pallas_value.assets() {
        match policy_group {
            MultiEraPolicyAssets::AlonzoCompatibleOutput(policy, kvps) => {
                let policy_id = to_hash(policy);
                for (name, amount) in kvps.iter() {
                    if let Some(name) = AssetName::new(name) {
                        assets.push((AssetClass::new(policy_id, name), *amount));
                    }
                }
            }
            MultiEraPolicyAssets::ConwayOutput(policy, kvps) => {
                let policy_id = to_hash(policy);
                for (name, amount) in kvps.iter() {
                    if let Some(name) = AssetName::new(name) {
                        assets.push((AssetClass::new(policy_id, name), u64::from(*amount)));
                    }
                }
            }
            _ => {}
        }
    }

    (lovelace, assets)
}

/// Minted (positive) and burned (negative) quantities of one policy group
pub fn map_mint_burn(policy_group: &MultiEraPolicyAssets<'_>) -> Vec<(AssetClass, i64)> {
    match policy_group {
        MultiEraPolicyAssets::AlonzoCompatibleMint(policy, kvps) => {
            let policy_id = to_hash(*policy);
            kvps.iter()
                .filter_map(|(name, amount)| {
                    AssetName::new(name).map(|name| (AssetClass::new(policy_id, name), *amount))
                })
                .collect()
        }

        MultiEraPolicyAssets::ConwayMint(policy, kvps) => {
            let policy_id = to_hash(*policy);
            kvps.iter()
                .filter_map(|(name, amount)| {
                    AssetName::new(name)
                        .map(|name| (AssetClass::new(policy_id, name), i64::from(*amount)))
                })
                .collect()
        }

        _ => Vec::new(),
    }
}
