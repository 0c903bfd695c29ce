//! Storage collaborator.
//!
//! Reads see a consistent view of the committed tables. Writes run against a private snapshot
//! that only replaces the committed tables once the closure succeeds, so a failed transaction
//! leaves no trace.

use crate::error::StoreError;
use std::future::Future;

mod fjall;
mod memory;
pub mod tables;

pub use self::fjall::FjallStore;
pub use memory::MemoryStore;
pub use tables::{Row, Table, Tables};

pub trait Store: Send + Sync + 'static {
    /// Run a read-only closure over the committed tables
    fn query<R, F>(&self, read: F) -> impl Future<Output = R> + Send
    where
        R: Send,
        F: FnOnce(&Tables) -> R + Send;

    /// Run a closure as one all-or-nothing transaction
    fn with_transaction<R, F>(&self, write: F) -> impl Future<Output = Result<R, StoreError>> + Send
    where
        R: Send,
        F: FnOnce(&mut Tables) -> Result<R, StoreError> + Send;
}
