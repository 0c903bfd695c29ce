use std::future::Future;

use anyhow::Result;
use dexwatch_common::Point;
use fjall::{Database, Keyspace, PersistMode};

/// Chain position tracker: the last fully processed point
pub trait CursorStore: Send + Sync + 'static {
    fn load(&self) -> impl Future<Output = Result<Option<Point>>> + Send;
    fn save(&mut self, point: &Point) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Default)]
pub struct InMemoryCursorStore {
    cursor: Option<Point>,
}

impl InMemoryCursorStore {
    pub fn new(cursor: Point) -> Self {
        Self {
            cursor: Some(cursor),
        }
    }
}

impl CursorStore for InMemoryCursorStore {
    async fn load(&self) -> Result<Option<Point>> {
        Ok(self.cursor.clone())
    }

    async fn save(&mut self, cursor: &Point) -> Result<()> {
        self.cursor = Some(cursor.clone());
        Ok(())
    }
}

const CURSOR_KEYSPACE: &str = "cursor";
const CURSOR_KEY: &[u8] = b"cursor";

/// Cursor kept next to the DEX tables
pub struct FjallCursorStore {
    database: Database,
    keyspace: Keyspace,
}

impl FjallCursorStore {
    pub fn new(database: &Database) -> Result<Self> {
        let keyspace = database.keyspace(CURSOR_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        Ok(Self {
            database: database.clone(),
            keyspace,
        })
    }
}

impl CursorStore for FjallCursorStore {
    async fn load(&self) -> Result<Option<Point>> {
        Ok(match self.keyspace.get(CURSOR_KEY)? {
            Some(bytes) => Some(serde_cbor::from_slice(&bytes)?),
            None => None,
        })
    }

    async fn save(&mut self, cursor: &Point) -> Result<()> {
        self.keyspace.insert(CURSOR_KEY, serde_cbor::to_vec(cursor)?)?;
        self.database.persist(PersistMode::Buffer)?;
        Ok(())
    }
}
