use super::{Store, Tables};
use crate::error::StoreError;
use tokio::sync::Mutex;

/// Volatile store; everything is lost on restart
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    async fn query<R, F>(&self, read: F) -> R
    where
        R: Send,
        F: FnOnce(&Tables) -> R + Send,
    {
        let tables = self.tables.lock().await;
        read(&tables)
    }

    async fn with_transaction<R, F>(&self, write: F) -> Result<R, StoreError>
    where
        R: Send,
        F: FnOnce(&mut Tables) -> Result<R, StoreError> + Send,
    {
        let mut tables = self.tables.lock().await;
        let mut snapshot = tables.clone();
        let result = write(&mut snapshot)?;
        snapshot.clear_changes();
        *tables = snapshot;
        Ok(result)
    }
}
