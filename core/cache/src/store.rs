//! Backend-agnostic cache front used by the sync layer and the application.

use futures::future::{FutureExt, Shared};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use tripsync_common::{CachedEntity, Collection, EntityId, Error, Result};

use crate::backend::{select_backend, CacheBackend, CacheConfig};

#[cfg(not(target_arch = "wasm32"))]
type OpenFuture = futures::future::BoxFuture<'static, std::result::Result<(), String>>;
#[cfg(target_arch = "wasm32")]
type OpenFuture = futures::future::LocalBoxFuture<'static, std::result::Result<(), String>>;

#[cfg(not(target_arch = "wasm32"))]
fn open_backend(backend: Arc<dyn CacheBackend>) -> OpenFuture {
    async move { backend.open().await.map_err(|e| e.to_string()) }.boxed()
}

#[cfg(target_arch = "wasm32")]
fn open_backend(backend: Arc<dyn CacheBackend>) -> OpenFuture {
    async move { backend.open().await.map_err(|e| e.to_string()) }.boxed_local()
}

enum InitState {
    Closed,
    Opening {
        attempt: u64,
        open: Shared<OpenFuture>,
    },
    Ready,
}

/// Local cache with identical semantics over every backend.
///
/// Reads never fail: a broken cache looks empty. Writes report their error
/// (already logged) so the sync coordinator can decide whether a pass
/// succeeded; other callers are free to ignore it.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    state: Mutex<InitState>,
    attempts: Mutex<u64>,
}

impl CacheStore {
    /// Create a store over an explicit backend.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(InitState::Closed),
            attempts: Mutex::new(0),
        }
    }

    /// Create a store over the backend matching the current runtime.
    pub fn from_config(config: &CacheConfig) -> Self {
        let backend = select_backend(config);
        info!("Using {} cache backend", backend.name());
        Self::new(backend)
    }

    /// Name of the active backend.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn lock_state(&self) -> MutexGuard<'_, InitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the backend if needed.
    ///
    /// Idempotent. Callers arriving while an open is in flight await that same
    /// attempt instead of starting another one.
    pub async fn initialize(&self) -> Result<()> {
        let (attempt, open) = {
            let mut state = self.lock_state();
            match &*state {
                InitState::Ready => return Ok(()),
                InitState::Opening { attempt, open } => (*attempt, open.clone()),
                InitState::Closed => {
                    let attempt = {
                        let mut attempts =
                            self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
                        *attempts += 1;
                        *attempts
                    };
                    let open = open_backend(self.backend.clone()).shared();
                    debug!("Opening {} cache (attempt {})", self.backend.name(), attempt);
                    *state = InitState::Opening {
                        attempt,
                        open: open.clone(),
                    };
                    (attempt, open)
                }
            }
        };

        let result = open.await;

        let mut state = self.lock_state();
        if matches!(&*state, InitState::Opening { attempt: current, .. } if *current == attempt) {
            *state = if result.is_ok() {
                InitState::Ready
            } else {
                InitState::Closed
            };
        }
        drop(state);

        result.map_err(|e| {
            warn!("Cache initialization failed: {}", e);
            Error::Storage(e)
        })
    }

    /// Whether the backend is currently believed to be open.
    pub fn is_initialized(&self) -> bool {
        matches!(&*self.lock_state(), InitState::Ready)
    }

    /// Forget the open connection so the next call reopens it.
    fn invalidate(&self) {
        let mut state = self.lock_state();
        if matches!(&*state, InitState::Ready) {
            warn!("{} cache connection lost, will reopen", self.backend.name());
            *state = InitState::Closed;
        }
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_connection_closed() {
                self.invalidate();
            }
        }
        result
    }

    /// Raw JSON rows of a collection. Empty on any failure.
    pub async fn get_all_values(&self, collection: Collection) -> Vec<Value> {
        self.scan_rows(collection)
            .await
            .into_iter()
            .filter_map(|row| match serde_json::from_str(&row) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Skipping unreadable row in {}: {}", collection, e);
                    None
                }
            })
            .collect()
    }

    /// Every cached record of `T`'s collection. Empty on any failure.
    pub async fn get_all<T: CachedEntity>(&self) -> Vec<T> {
        self.scan_rows(T::COLLECTION)
            .await
            .into_iter()
            .filter_map(|row| match serde_json::from_str::<T>(&row) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!("Skipping unreadable row in {}: {}", T::COLLECTION, e);
                    None
                }
            })
            .collect()
    }

    async fn scan_rows(&self, collection: Collection) -> Vec<String> {
        if let Err(e) = self.initialize().await {
            warn!("Reading {} from an unavailable cache: {}", collection, e);
            return Vec::new();
        }
        match self.track(self.backend.scan(collection).await) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to read {} from cache: {}", collection, e);
                Vec::new()
            }
        }
    }

    /// One record by id. `None` when missing or on any failure.
    pub async fn get_by_id<T: CachedEntity>(&self, id: EntityId) -> Option<T> {
        if self.initialize().await.is_err() {
            return None;
        }
        let row = match self.track(self.backend.get(T::COLLECTION, id).await) {
            Ok(row) => row?,
            Err(e) => {
                warn!("Failed to read {} {} from cache: {}", T::COLLECTION, id, e);
                return None;
            }
        };
        match serde_json::from_str(&row) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Unreadable {} {} in cache: {}", T::COLLECTION, id, e);
                None
            }
        }
    }

    /// Insert or replace records by id.
    ///
    /// Each item overwrites any stored record with the same id entirely.
    pub async fn upsert_many<T: CachedEntity>(&self, items: &[T]) -> Result<()> {
        let rows = items
            .iter()
            .map(|item| Ok((item.id(), serde_json::to_string(item)?)))
            .collect::<Result<Vec<_>>>()?;
        self.put_rows(T::COLLECTION, rows).await
    }

    /// Insert or replace raw JSON records by their `id` field.
    ///
    /// The whole batch is rejected if any record lacks an integer id.
    pub async fn upsert_values(&self, collection: Collection, values: &[Value]) -> Result<usize> {
        let rows = values
            .iter()
            .map(|value| {
                let id = value.get("id").and_then(Value::as_i64).ok_or_else(|| {
                    Error::InvalidInput(format!("{} record without an integer id", collection))
                })?;
                Ok((id, value.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let count = rows.len();
        self.put_rows(collection, rows).await?;
        Ok(count)
    }

    async fn put_rows(&self, collection: Collection, rows: Vec<(EntityId, String)>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.initialize().await?;
        self.track(self.backend.put_many(collection, rows).await)
            .inspect_err(|e| warn!("Failed to write {} to cache: {}", collection, e))
    }

    /// Delete one record.
    pub async fn remove(&self, collection: Collection, id: EntityId) -> Result<()> {
        self.initialize().await?;
        self.track(self.backend.delete(collection, id).await)
            .inspect_err(|e| warn!("Failed to delete {} {} from cache: {}", collection, id, e))
    }

    /// Delete every record of a collection. Failures are logged only.
    pub async fn clear(&self, collection: Collection) {
        if self.initialize().await.is_err() {
            return;
        }
        match self.track(self.backend.clear(collection).await) {
            Ok(()) => debug!("Cleared {} cache", collection),
            Err(e) => warn!("Failed to clear {} cache: {}", collection, e),
        }
    }

    /// Delete every collection and all metadata (logout).
    pub async fn wipe(&self) {
        for collection in Collection::ALL {
            self.clear(collection).await;
        }
        if self.initialize().await.is_ok() {
            if let Err(e) = self.track(self.backend.clear_meta().await) {
                warn!("Failed to clear cache metadata: {}", e);
            }
        }
        info!("Cache wiped");
    }

    /// Store a metadata value.
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.initialize().await?;
        self.track(self.backend.set_meta(key, value.to_string()).await)
            .inspect_err(|e| warn!("Failed to write metadata '{}': {}", key, e))
    }

    /// Read a metadata value. `None` when missing or on any failure.
    pub async fn get_metadata(&self, key: &str) -> Option<String> {
        if self.initialize().await.is_err() {
            return None;
        }
        match self.track(self.backend.get_meta(key).await) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read metadata '{}': {}", key, e);
                None
            }
        }
    }

    /// Close the backend. The next call reopens it.
    pub async fn close(&self) {
        *self.lock_state() = InitState::Closed;
        self.backend.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tripsync_common::{Trip, TripDraft, Vehicle};

    fn memory_store() -> (Arc<MemoryBackend>, CacheStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = CacheStore::new(backend.clone());
        (backend, store)
    }

    fn vehicle(id: EntityId, name: &str) -> Vehicle {
        serde_json::from_value(json!({ "id": id, "name": name })).unwrap()
    }

    /// Backend whose `open` blocks until released.
    struct GatedBackend {
        inner: MemoryBackend,
        gate: Notify,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for GatedBackend {
        fn name(&self) -> &str {
            "gated"
        }
        async fn open(&self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.inner.open().await
        }
        async fn close(&self) {
            self.inner.close().await
        }
        async fn scan(&self, c: Collection) -> Result<Vec<String>> {
            self.inner.scan(c).await
        }
        async fn get(&self, c: Collection, id: EntityId) -> Result<Option<String>> {
            self.inner.get(c, id).await
        }
        async fn put_many(&self, c: Collection, rows: Vec<(EntityId, String)>) -> Result<()> {
            self.inner.put_many(c, rows).await
        }
        async fn delete(&self, c: Collection, id: EntityId) -> Result<()> {
            self.inner.delete(c, id).await
        }
        async fn clear(&self, c: Collection) -> Result<()> {
            self.inner.clear(c).await
        }
        async fn set_meta(&self, key: &str, value: String) -> Result<()> {
            self.inner.set_meta(key, value).await
        }
        async fn get_meta(&self, key: &str) -> Result<Option<String>> {
            self.inner.get_meta(key).await
        }
        async fn clear_meta(&self) -> Result<()> {
            self.inner.clear_meta().await
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (backend, store) = memory_store();
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
        assert!(store.is_initialized());
        assert_eq!(backend.open_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_shares_one_attempt() {
        let backend = Arc::new(GatedBackend {
            inner: MemoryBackend::new(),
            gate: Notify::new(),
            opens: AtomicUsize::new(0),
        });
        let store = Arc::new(CacheStore::new(backend.clone()));

        let first = tokio::spawn({
            let store = store.clone();
            async move { store.initialize().await }
        });
        let second = tokio::spawn({
            let store = store.clone();
            async move { store.initialize().await }
        });

        while backend.opens.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        backend.gate.notify_one();

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
        assert!(store.is_initialized());
    }

    #[tokio::test]
    async fn test_upsert_replaces_whole_record() {
        let (_backend, store) = memory_store();

        let mut original = vehicle(1, "Van");
        original.license_plate = Some("AB-123".to_string());
        store.upsert_many(&[original]).await.unwrap();
        store.upsert_many(&[vehicle(1, "Truck")]).await.unwrap();

        let stored: Vehicle = store.get_by_id(1).await.unwrap();
        assert_eq!(stored.name, "Truck");
        assert!(stored.license_plate.is_none());
        assert_eq!(store.get_all::<Vehicle>().await.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_values_requires_ids() {
        let (_backend, store) = memory_store();

        let written = store
            .upsert_values(Collection::Locations, &[json!({"id": 1}), json!({"id": 2})])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let result = store
            .upsert_values(Collection::Locations, &[json!({"id": 3}), json!({"name": "x"})])
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(store.get_all_values(Collection::Locations).await.len(), 2);
    }

    #[tokio::test]
    async fn test_reads_degrade_when_backend_broken() {
        let (backend, store) = memory_store();
        store.upsert_many(&[vehicle(1, "Van")]).await.unwrap();

        backend.drop_connection();

        // The read fails with a closed connection, the store reopens on the
        // next call and the data is visible again.
        let first = store.get_all::<Vehicle>().await;
        assert!(first.is_empty());
        assert!(!store.is_initialized());

        let second = store.get_all::<Vehicle>().await;
        assert_eq!(second.len(), 1);
        assert_eq!(backend.open_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_self_heals() {
        let (backend, store) = memory_store();
        store.initialize().await.unwrap();
        backend.drop_connection();

        let result = store.upsert_many(&[vehicle(2, "Bus")]).await;
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));

        store.upsert_many(&[vehicle(2, "Bus")]).await.unwrap();
        let stored: Option<Vehicle> = store.get_by_id(2).await;
        assert_eq!(stored.map(|v| v.name), Some("Bus".to_string()));
    }

    #[tokio::test]
    async fn test_unreadable_rows_are_skipped() {
        let (_backend, store) = memory_store();
        store
            .upsert_values(
                Collection::Vehicles,
                &[json!({"id": 1, "name": "ok"}), json!({"id": 2, "name": 42})],
            )
            .await
            .unwrap();

        let vehicles = store.get_all::<Vehicle>().await;
        assert_eq!(vehicles.len(), 1);
        assert!(store.get_by_id::<Vehicle>(2).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_and_wipe() {
        let (_backend, store) = memory_store();
        let trip = Trip::local(-10, TripDraft::default());
        store.upsert_many(&[trip]).await.unwrap();
        store.set_metadata("hashSnapshot", "{}").await.unwrap();

        store.remove(Collection::Trips, -10).await.unwrap();
        assert!(store.get_by_id::<Trip>(-10).await.is_none());

        store.upsert_many(&[vehicle(1, "Van")]).await.unwrap();
        store.wipe().await;
        assert!(store.get_all::<Vehicle>().await.is_empty());
        assert!(store.get_metadata("hashSnapshot").await.is_none());
    }

    #[tokio::test]
    async fn test_close_reopens_on_next_call() {
        let (backend, store) = memory_store();
        store.set_metadata("k", "v").await.unwrap();
        store.close().await;

        assert_eq!(store.get_metadata("k").await, Some("v".to_string()));
        assert_eq!(backend.open_count(), 2);
    }
}
