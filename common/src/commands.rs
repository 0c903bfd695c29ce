//! Commands sent to upstream collaborators over the bus

use crate::types::Point;
use serde::{Deserialize, Serialize};

/// Instructions for the chain-sync transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainSyncCommand {
    /// Resume delivery from the first block after this point
    FindIntersect(Point),
}
