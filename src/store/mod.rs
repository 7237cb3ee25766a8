//! Backing Stores
//!
//! Durable destinations for flushed location records:
//! - `sqlite://<path>` / `sqlite::memory:`: [`SqliteStore`]
//! - `memory://`: [`MemoryStore`], in-process and inspectable
//!
//! The batched writer only ever talks to a `dyn BackingStore`.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::record::GpsRecord;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// A store that accepts batches of location records
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Open the underlying connection; a no-op when already connected
    async fn connect(&self) -> StoreResult<()>;

    /// Close the underlying connection; a no-op when not connected
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Persist all records as one batch, returning how many were written
    ///
    /// On error none of the records should be assumed written.
    async fn insert_many(&self, records: &[GpsRecord]) -> StoreResult<usize>;
}

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store is not connected")]
    NotConnected,

    #[error("Invalid store URI: {0}")]
    InvalidUri(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

const SQLITE_MEMORY: &str = "sqlite::memory:";
const SQLITE_PREFIX: &str = "sqlite://";
const MEMORY_PREFIX: &str = "memory://";

/// Build a store from its URI
///
/// The store is returned disconnected.
pub fn open_store(uri: &str) -> StoreResult<Arc<dyn BackingStore>> {
    let uri = uri.trim();

    if uri == SQLITE_MEMORY {
        return Ok(Arc::new(SqliteStore::in_memory()));
    }

    if let Some(path) = uri.strip_prefix(SQLITE_PREFIX) {
        if path.is_empty() {
            return Err(StoreError::InvalidUri(uri.to_string()));
        }
        return Ok(Arc::new(SqliteStore::new(path)));
    }

    if uri.starts_with(MEMORY_PREFIX) {
        return Ok(Arc::new(MemoryStore::new()));
    }

    Err(StoreError::InvalidUri(uri.to_string()))
}
