//! Error taxonomy of the reconciliation pipeline

use thiserror::Error;

pub use crate::decoder::SchemaMismatch;

/// Storage collaborator failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Natural-key collision on insert
    #[error("Duplicate {table} row for key {key}")]
    Conflict { table: &'static str, key: String },

    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: u64 },

    #[error("Storage backend failure: {0}")]
    Backend(String),

    #[error("Row encoding failure: {0}")]
    Codec(#[from] serde_cbor::Error),
}

impl From<fjall::Error> for StoreError {
    fn from(error: fjall::Error) -> Self {
        StoreError::Backend(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Could not resolve {what} after {attempts} attempts")]
    ResolutionExhausted { what: String, attempts: u32 },

    #[error("Persistence conflict survived a retry: {0}")]
    PersistenceConflict(StoreError),

    #[error("Operation is missing {0}")]
    MissingParameter(&'static str),

    #[error("Invalid order transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Metadata lookups are disabled")]
    Unavailable,

    #[error("Metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Metadata request timed out")]
    Timeout,
}
