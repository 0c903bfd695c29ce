use std::{collections::HashMap, fs, path::Path};

use anyhow::Result;
use fjall::{Database, Keyspace, PersistMode};
use tokio::sync::Mutex;
use tracing::info;

use super::{tables::Change, Store, Tables};
use crate::error::StoreError;

/// Durable store: the tables live in memory and every commit is written through to fjall,
/// one keyspace per table keyed by big-endian row id
pub struct FjallStore {
    database: Database,
    keyspaces: HashMap<&'static str, Keyspace>,
    tables: Mutex<Tables>,
}

impl FjallStore {
    pub fn open(path: &Path, clear: bool) -> Result<Self> {
        if clear && path.exists() {
            fs::remove_dir_all(path)?;
        }
        let database = Database::builder(path).open()?;

        let mut keyspaces = HashMap::new();
        let mut tables = Tables::default();
        let mut rows = 0usize;
        for name in Tables::NAMES {
            let keyspace = database.keyspace(name, fjall::KeyspaceCreateOptions::default)?;
            for entry in keyspace.iter() {
                let (_, value) = entry.into_inner()?;
                tables.load(name, &value)?;
                rows += 1;
            }
            keyspaces.insert(name, keyspace);
        }
        tables.clear_changes();
        info!(rows, path = %path.display(), "Opened DEX store");

        Ok(Self {
            database,
            keyspaces,
            tables: Mutex::new(tables),
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    fn write_through(&self, changes: Vec<Change>) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut batch = self.database.batch();
        for change in changes {
            let keyspace = self.keyspaces.get(change.table).ok_or_else(|| {
                StoreError::Backend(format!("No keyspace for table '{}'", change.table))
            })?;
            let key = change.id.to_be_bytes();
            match change.value {
                Some(value) => batch.insert(keyspace, key, value),
                None => batch.remove(keyspace, key),
            }
        }
        batch.commit()?;
        self.database.persist(PersistMode::Buffer)?;
        Ok(())
    }
}

impl Store for FjallStore {
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
        self.write_through(snapshot.changes()?)?;
        snapshot.clear_changes();
        *tables = snapshot;
        Ok(result)
    }
}
