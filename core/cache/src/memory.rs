//! In-memory cache backend for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tripsync_common::{Collection, EntityId, Error, Result};

use crate::backend::CacheBackend;

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<Collection, BTreeMap<EntityId, String>>,
    metadata: HashMap<String, String>,
}

/// In-memory cache backend.
///
/// Useful for testing and as the browser fallback. Data survives `close`
/// (like a file on disk would) but is lost on drop. The connection can be
/// dropped and writes made to fail to exercise the store's recovery paths.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    open: AtomicBool,
    opens: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Number of times a connection was actually opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Invalidate the connection as if the engine had closed it underneath us.
    pub fn drop_connection(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ConnectionClosed("memory backend is not open".to_string()))
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("simulated write failure".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self) -> Result<()> {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .lock()
            .collections
            .get(&collection)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, collection: Collection, id: EntityId) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self
            .lock()
            .collections
            .get(&collection)
            .and_then(|rows| rows.get(&id).cloned()))
    }

    async fn put_many(&self, collection: Collection, rows: Vec<(EntityId, String)>) -> Result<()> {
        self.ensure_writable()?;
        let mut state = self.lock();
        let table = state.collections.entry(collection).or_default();
        for (id, data) in rows {
            table.insert(id, data);
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: EntityId) -> Result<()> {
        self.ensure_writable()?;
        if let Some(rows) = self.lock().collections.get_mut(&collection) {
            rows.remove(&id);
        }
        Ok(())
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.ensure_writable()?;
        self.lock().collections.remove(&collection);
        Ok(())
    }

    async fn set_meta(&self, key: &str, value: String) -> Result<()> {
        self.ensure_writable()?;
        self.lock().metadata.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self.lock().metadata.get(key).cloned())
    }

    async fn clear_meta(&self) -> Result<()> {
        self.ensure_writable()?;
        self.lock().metadata.clear();
        Ok(())
    }
}
