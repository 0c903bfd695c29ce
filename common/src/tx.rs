//! Formatted transaction handed to the protocol analyzers

use crate::{
    datum::Datum,
    hash::{PolicyId, TxHash},
    types::{Address, AssetClass, Lovelace, Token, UTxOIdentifier},
};
use serde::{Deserialize, Serialize};

/// Redeemer purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedeemerTag {
    Spend,
    Mint,
    Cert,
    Reward,
    Vote,
    Propose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redeemer {
    pub tag: RedeemerTag,
    pub index: u32,
    pub data: Datum,
}

/// Transaction output with its datum resolved when possible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: u16,
    pub address: Address,
    pub lovelace: Lovelace,
    pub assets: Vec<(AssetClass, u64)>,

    /// Inline datum, or a hashed datum found in the witness set
    pub datum: Option<Datum>,
}

impl TxOutput {
    /// Quantity of a token held in this output
    pub fn amount_of(&self, token: &Token) -> u64 {
        match token {
            Token::Lovelace => self.lovelace,
            Token::Asset(asset) => self
                .assets
                .iter()
                .filter(|(class, _)| class == asset)
                .map(|(_, quantity)| *quantity)
                .sum(),
        }
    }

    /// Native assets held under a policy
    pub fn assets_of_policy<'a>(
        &'a self,
        policy: &'a PolicyId,
    ) -> impl Iterator<Item = &'a (AssetClass, u64)> + 'a {
        self.assets.iter().filter(move |(class, _)| &class.policy_id == policy)
    }
}

/// Transaction as seen by the analyzers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexTransaction {
    pub hash: TxHash,

    /// False for transactions that failed phase-2 validation
    pub valid: bool,

    /// Spent inputs
    pub inputs: Vec<UTxOIdentifier>,

    pub reference_inputs: Vec<UTxOIdentifier>,
    pub outputs: Vec<TxOutput>,

    /// Minted (positive) and burned (negative) quantities
    pub mints: Vec<(AssetClass, i64)>,

    pub redeemers: Vec<Redeemer>,
}

impl DexTransaction {
    pub fn outputs_at_script<'a>(
        &'a self,
        scripts: &'a [crate::hash::ScriptHash],
    ) -> impl Iterator<Item = &'a TxOutput> + 'a {
        self.outputs.iter().filter(move |output| {
            output.address.payment_script().is_some_and(|hash| scripts.contains(hash))
        })
    }

    /// Asset names burned under a policy, in mint order
    pub fn burned_names(&self, policy: &PolicyId) -> Vec<&AssetClass> {
        self.mints
            .iter()
            .filter(|(class, quantity)| &class.policy_id == policy && *quantity < 0)
            .map(|(class, _)| class)
            .collect()
    }

    pub fn redeemers_with_tag(&self, tag: RedeemerTag) -> impl Iterator<Item = &Redeemer> {
        self.redeemers.iter().filter(move |redeemer| redeemer.tag == tag)
    }
}
