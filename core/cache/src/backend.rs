//! Cache backend trait definition and runtime backend selection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use tripsync_common::{Collection, EntityId, Result};

/// `Send + Sync` on native targets, nothing on wasm32 where the browser
/// storage handles are single-threaded.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSendSync: Send + Sync {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + Sync + ?Sized> MaybeSendSync for T {}

/// `Send + Sync` on native targets, nothing on wasm32 where the browser
/// storage handles are single-threaded.
#[cfg(target_arch = "wasm32")]
pub trait MaybeSendSync {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSendSync for T {}

/// Low-level persistence contract every cache backend satisfies.
///
/// Rows are opaque JSON documents keyed by entity id. Backends report a lost
/// connection as `Error::ConnectionClosed` so the store can reopen them.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait CacheBackend: MaybeSendSync {
    /// Backend name (e.g., "sqlite", "indexeddb", "memory").
    fn name(&self) -> &str;

    /// Open the connection and create any missing schema.
    ///
    /// # Postconditions
    /// - One table/object store per collection plus the metadata area exist
    /// - Calling it on an open backend is a no-op
    async fn open(&self) -> Result<()>;

    /// Drop the connection. The next `open` reconnects.
    async fn close(&self);

    /// All rows of a collection.
    async fn scan(&self, collection: Collection) -> Result<Vec<String>>;

    /// One row by id.
    async fn get(&self, collection: Collection, id: EntityId) -> Result<Option<String>>;

    /// Insert or replace rows by id, atomically.
    async fn put_many(&self, collection: Collection, rows: Vec<(EntityId, String)>) -> Result<()>;

    /// Delete one row. Deleting a missing id is not an error.
    async fn delete(&self, collection: Collection, id: EntityId) -> Result<()>;

    /// Delete every row of a collection.
    async fn clear(&self, collection: Collection) -> Result<()>;

    /// Store a metadata value.
    async fn set_meta(&self, key: &str, value: String) -> Result<()>;

    /// Read a metadata value.
    async fn get_meta(&self, key: &str) -> Result<Option<String>>;

    /// Delete every metadata value.
    async fn clear_meta(&self) -> Result<()>;
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// SQLite database file on native targets. `None` keeps the cache in memory.
    pub path: Option<PathBuf>,
    /// IndexedDB database name in the browser.
    pub database_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            database_name: "tripsync".to_string(),
        }
    }
}

/// Pick the backend for the current runtime.
///
/// Native builds always use SQLite. Browser builds use IndexedDB when the
/// factory is reachable and fall back to an in-memory cache otherwise.
#[cfg(not(target_arch = "wasm32"))]
pub fn select_backend(config: &CacheConfig) -> Arc<dyn CacheBackend> {
    match &config.path {
        Some(path) => Arc::new(crate::sqlite::SqliteBackend::new(path)),
        None => Arc::new(crate::sqlite::SqliteBackend::in_memory()),
    }
}

/// Pick the backend for the current runtime.
///
/// Native builds always use SQLite. Browser builds use IndexedDB when the
/// factory is reachable and fall back to an in-memory cache otherwise.
#[cfg(target_arch = "wasm32")]
pub fn select_backend(config: &CacheConfig) -> Arc<dyn CacheBackend> {
    if crate::indexeddb::IndexedDbBackend::is_supported() {
        Arc::new(crate::indexeddb::IndexedDbBackend::new(&config.database_name))
    } else {
        tracing::warn!("IndexedDB unavailable, cache will not survive a reload");
        Arc::new(crate::memory::MemoryBackend::new())
    }
}
