//! Core chain type definitions for DexWatch

use crate::hash::{BlockHash, KeyHash, PolicyId, ScriptHash, TxHash};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub type Slot = u64;
pub type Lovelace = u64;

/// Block status
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Bootstrap,  // Pseudo-block from bootstrap data
    #[default]
    Immutable,  // Now immutable (more than 'k' blocks ago)
    Volatile,   // Volatile, in sequence
    RolledBack, // Volatile, restarted after rollback
}

/// Block info, shared across multiple messages
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block status
    pub status: BlockStatus,

    /// Slot number
    pub slot: Slot,

    /// Block number
    pub number: u64,

    /// Block hash
    pub hash: BlockHash,

    /// UNIX timestamp of the slot
    pub timestamp: u64,
}

impl BlockInfo {
    pub fn point(&self) -> Point {
        Point::Specific {
            slot: self.slot,
            hash: self.hash,
        }
    }
}

/// A position on the chain
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Point {
    #[default]
    Origin,
    Specific { slot: Slot, hash: BlockHash },
}

impl Point {
    pub fn slot_or_default(&self) -> Slot {
        match self {
            Point::Origin => 0,
            Point::Specific { slot, .. } => *slot,
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Origin => f.write_str("origin"),
            Point::Specific { slot, hash } => write!(f, "{slot}@{hash}"),
        }
    }
}

/// Converts slots to wall-clock time from the Shelley hard fork onwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub shelley_start_slot: Slot,
    pub shelley_start_time: u64,
}

impl SlotConfig {
    pub const MAINNET: SlotConfig = SlotConfig {
        shelley_start_slot: 4_492_800,
        shelley_start_time: 1_596_059_091,
    };

    pub fn slot_to_time(&self, slot: Slot) -> u64 {
        (self.shelley_start_time + slot).saturating_sub(self.shelley_start_slot)
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self::MAINNET
    }
}

/// Payment or stake credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Credential {
    Key(KeyHash),
    Script(ScriptHash),
}

impl Credential {
    pub fn hash(&self) -> &KeyHash {
        match self {
            Credential::Key(hash) | Credential::Script(hash) => hash,
        }
    }
}

/// Output address, reduced to the parts the analyzers look at
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Bech32 rendering (base58 for Byron)
    pub bech32: String,

    /// Payment credential, absent for Byron addresses
    pub payment: Option<Credential>,

    /// Stake credential, absent for enterprise addresses
    pub stake: Option<Credential>,
}

impl Address {
    pub fn payment_script(&self) -> Option<&ScriptHash> {
        match &self.payment {
            Some(Credential::Script(hash)) => Some(hash),
            _ => None,
        }
    }
}

/// Native asset name, up to 32 bytes
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetName(Vec<u8>);

impl AssetName {
    pub const MAX_LENGTH: usize = 32;

    pub fn new(bytes: &[u8]) -> Option<Self> {
        (bytes.len() <= Self::MAX_LENGTH).then(|| Self(bytes.to_vec()))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for AssetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AssetName").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for AssetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for AssetName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AssetName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        AssetName::new(&bytes).ok_or_else(|| serde::de::Error::custom("asset name too long"))
    }
}

/// Native asset identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetClass {
    pub policy_id: PolicyId,
    pub name: AssetName,
}

impl AssetClass {
    pub fn new(policy_id: PolicyId, name: AssetName) -> Self {
        Self { policy_id, name }
    }

    /// Concatenated policy id and hex name, the Cardano "unit"
    pub fn unit(&self) -> String {
        format!("{}{}", self.policy_id, self.name)
    }
}

/// Either ada or a native asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Token {
    Lovelace,
    Asset(AssetClass),
}

impl Token {
    /// Builds a token from on-chain policy and name bytes; an empty policy means ada.
    pub fn from_parts(policy: &[u8], name: &[u8]) -> Option<Token> {
        if policy.is_empty() {
            return Some(Token::Lovelace);
        }
        let policy_id = PolicyId::try_from(policy).ok()?;
        Some(Token::Asset(AssetClass::new(policy_id, AssetName::new(name)?)))
    }

    pub fn is_lovelace(&self) -> bool {
        matches!(self, Token::Lovelace)
    }

    pub fn asset(&self) -> Option<&AssetClass> {
        match self {
            Token::Lovelace => None,
            Token::Asset(asset) => Some(asset),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Lovelace => f.write_str("lovelace"),
            Token::Asset(asset) => f.write_str(&asset.unit()),
        }
    }
}

/// Transaction output reference
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UTxOIdentifier {
    pub tx_hash: TxHash,
    pub output_index: u16,
}

impl UTxOIdentifier {
    pub fn new(tx_hash: TxHash, output_index: u16) -> Self {
        Self {
            tx_hash,
            output_index,
        }
    }
}

impl fmt::Display for UTxOIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.output_index)
    }
}
