//! Shared fixtures: an in-memory remote API with counters, gates and failure injection,
//! plus a cache backend whose metadata writes can be made to fail.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use tripsync_cache::{CacheBackend, CacheStore, MemoryBackend};
use tripsync_common::{Collection, EntityId, Error, Result, Trip, TripDraft};
use tripsync_sync::{Connectivity, RemoteApi, ServerHashes, SyncConfig, SyncCoordinator};

#[derive(Default)]
pub struct MockRemote {
    hashes: Mutex<ServerHashes>,
    data: Mutex<HashMap<Collection, Vec<Value>>>,
    failing: Mutex<HashSet<Collection>>,
    fail_hashes: AtomicBool,
    fail_create: AtomicBool,
    gated: AtomicBool,
    gate: Notify,
    creates_gated: AtomicBool,
    create_gate: Notify,
    next_id: AtomicI64,
    pub hash_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    fetches: Mutex<Vec<Collection>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1000),
            ..Default::default()
        })
    }

    pub fn set_hashes(&self, pairs: &[(&str, &str)]) {
        *self.hashes.lock().unwrap() = hashes(pairs);
    }

    pub fn set_records(&self, collection: Collection, records: Vec<Value>) {
        self.data.lock().unwrap().insert(collection, records);
    }

    pub fn fail_collection(&self, collection: Collection, fail: bool) {
        let mut failing = self.failing.lock().unwrap();
        if fail {
            failing.insert(collection);
        } else {
            failing.remove(&collection);
        }
    }

    pub fn fail_hashes(&self, fail: bool) {
        self.fail_hashes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make hash fetches wait for [`MockRemote::release`].
    pub fn hold(&self, hold: bool) {
        self.gated.store(hold, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Make trip creates wait for [`MockRemote::release_creates`].
    pub fn hold_creates(&self) {
        self.creates_gated.store(true, Ordering::SeqCst);
    }

    /// Let the waiting create through and stop gating later ones.
    pub fn release_creates(&self) {
        self.creates_gated.store(false, Ordering::SeqCst);
        self.create_gate.notify_one();
    }

    pub fn hash_calls(&self) -> usize {
        self.hash_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> Vec<Collection> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn fetch_hashes(&self) -> Result<ServerHashes> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.fail_hashes.load(Ordering::SeqCst) {
            return Err(Error::Remote {
                status: 401,
                message: "unauthorized".to_string(),
            });
        }
        Ok(self.hashes.lock().unwrap().clone())
    }

    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        self.fetches.lock().unwrap().push(collection);
        if self.failing.lock().unwrap().contains(&collection) {
            return Err(Error::Remote {
                status: 400,
                message: format!("{} unavailable", collection),
            });
        }
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(&collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_trip(&self, draft: &TripDraft) -> Result<Trip> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.creates_gated.load(Ordering::SeqCst) {
            self.create_gate.notified().await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Remote {
                status: 422,
                message: "rejected".to_string(),
            });
        }

        let mut trip = Trip::local(self.next_id.fetch_add(1, Ordering::SeqCst), draft.clone());
        trip.is_local = false;
        trip.sync_status = None;
        trip.created_at = Some(Utc::now());

        self.data
            .lock()
            .unwrap()
            .entry(Collection::Trips)
            .or_default()
            .push(serde_json::to_value(&trip).unwrap());
        Ok(trip)
    }
}

pub fn hashes(pairs: &[(&str, &str)]) -> ServerHashes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn location(id: i64, name: &str) -> Value {
    json!({ "id": id, "name": name })
}

pub fn server_trip(id: i64, notes: &str) -> Value {
    json!({ "id": id, "notes": notes, "distanceKm": 12.5 })
}

pub fn draft(notes: &str) -> TripDraft {
    TripDraft {
        notes: Some(notes.to_string()),
        distance_km: Some(4.2),
        ..Default::default()
    }
}

/// Memory backend whose metadata writes fail on demand while record writes keep working.
#[derive(Default)]
pub struct MetaFailingBackend {
    inner: MemoryBackend,
    fail_meta: AtomicBool,
}

impl MetaFailingBackend {
    pub fn set_fail_meta(&self, fail: bool) {
        self.fail_meta.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheBackend for MetaFailingBackend {
    fn name(&self) -> &str {
        "meta-failing"
    }

    async fn open(&self) -> Result<()> {
        self.inner.open().await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<String>> {
        self.inner.scan(collection).await
    }

    async fn get(&self, collection: Collection, id: EntityId) -> Result<Option<String>> {
        self.inner.get(collection, id).await
    }

    async fn put_many(&self, collection: Collection, rows: Vec<(EntityId, String)>) -> Result<()> {
        self.inner.put_many(collection, rows).await
    }

    async fn delete(&self, collection: Collection, id: EntityId) -> Result<()> {
        self.inner.delete(collection, id).await
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.inner.clear(collection).await
    }

    async fn set_meta(&self, key: &str, value: String) -> Result<()> {
        if self.fail_meta.load(Ordering::SeqCst) {
            return Err(Error::Storage("metadata is read-only".to_string()));
        }
        self.inner.set_meta(key, value).await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_meta(key).await
    }

    async fn clear_meta(&self) -> Result<()> {
        self.inner.clear_meta().await
    }
}

pub struct Fixture {
    pub remote: Arc<MockRemote>,
    pub cache: Arc<CacheStore>,
    pub connectivity: Connectivity,
    pub coordinator: Arc<SyncCoordinator>,
}

pub fn fixture(online: bool) -> Fixture {
    fixture_on(online, Arc::new(MemoryBackend::new()))
}

pub fn fixture_on(online: bool, backend: Arc<dyn CacheBackend>) -> Fixture {
    let remote = MockRemote::new();
    let cache = Arc::new(CacheStore::new(backend));
    let connectivity = Connectivity::new(online);
    let coordinator = Arc::new(SyncCoordinator::new(
        cache.clone(),
        remote.clone(),
        connectivity.clone(),
        &SyncConfig::default(),
    ));

    Fixture {
        remote,
        cache,
        connectivity,
        coordinator,
    }
}
