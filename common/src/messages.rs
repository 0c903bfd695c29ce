//! Definition of DexWatch bus messages

use crate::{commands::ChainSyncCommand, dex::DexEvent, types::*};
use serde::{Deserialize, Serialize};

/// Transactions message
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTxsMessage {
    /// Raw CBOR for each transaction, in block order
    pub txs: Vec<Vec<u8>>,
}

/// Chain state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateTransitionMessage {
    /// Everything after this point has been invalidated
    Rollback(Point),
}

/// Messages delivered by the chain-sync transport, always paired with a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardanoMessage {
    ReceivedTxs(RawTxsMessage),
    StateTransition(StateTransitionMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    ChainSync(ChainSyncCommand),
}

// === Global message enum ===
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Chain data
    Cardano((BlockInfo, CardanoMessage)),

    // Requests to upstream modules
    Command(Command),

    // Indexed DEX activity
    DexEvent(DexEvent),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<DexEvent> for Message {
    fn from(event: DexEvent) -> Self {
        Message::DexEvent(event)
    }
}
