//! Sync coordinator: full synchronization passes and local-write reconciliation.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use tripsync_cache::CacheStore;
use tripsync_common::{Collection, EntityId, Error, Result, Trip, TripDraft};

use crate::config::SyncConfig;
use crate::detector::ChangeDetector;
use crate::remote::RemoteApi;
use crate::retry::RetryExecutor;
use crate::state::{CollectionError, Connectivity, ReconcileOutcome, SyncOutcome, SyncStatus};

/// Holds a single-flight flag for the duration of an operation.
///
/// The flag is cleared on drop, so early returns and panics release it too.
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Issues synthetic ids for records created before the server knows them.
///
/// Ids are the negated millisecond clock, forced strictly decreasing so two
/// drafts created in the same millisecond still differ. Server ids are
/// positive, so the two ranges never meet.
#[derive(Debug, Default)]
pub struct LocalIdGenerator {
    last: AtomicI64,
}

impl LocalIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> EntityId {
        let candidate = -Utc::now().timestamp_millis().max(1);
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(candidate.min(prev - 1))
            })
            .unwrap_or_else(|prev| prev);
        candidate.min(previous - 1)
    }
}

/// Orchestrates synchronization passes against the remote API.
///
/// `perform_sync` and `reconcile_pending_writes` are each single-flight: an
/// overlapping call is rejected immediately, never queued. The two may run
/// back to back or even concurrently with each other.
pub struct SyncCoordinator {
    cache: Arc<CacheStore>,
    remote: Arc<dyn RemoteApi>,
    detector: ChangeDetector,
    retry: Arc<RetryExecutor>,
    connectivity: Connectivity,
    syncing: AtomicBool,
    reconciling: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    local_ids: LocalIdGenerator,
}

impl SyncCoordinator {
    /// Create a coordinator.
    ///
    /// Construct one per signed-in session; call [`SyncCoordinator::reset`]
    /// on logout.
    pub fn new(
        cache: Arc<CacheStore>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Connectivity,
        config: &SyncConfig,
    ) -> Self {
        let retry = Arc::new(RetryExecutor::new(config.retry_config()));
        let detector = ChangeDetector::new(remote.clone(), cache.clone(), retry.clone());

        Self {
            cache,
            remote,
            detector,
            retry,
            connectivity,
            syncing: AtomicBool::new(false),
            reconciling: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            local_ids: LocalIdGenerator::new(),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::SeqCst)
    }

    /// Run one synchronization pass.
    ///
    /// Fetches the server hashes, refetches every collection whose hash
    /// changed (or all of them with `force`), and advances the hash snapshot
    /// only if every one of those collections was persisted.
    ///
    /// # Errors
    /// - `SyncInProgress` if another pass is running
    /// - the hash fetch error; the snapshot is left untouched
    /// - the snapshot write error; collection data is already persisted
    pub async fn perform_sync(&self, force: bool) -> Result<SyncOutcome> {
        let Some(_guard) = FlightGuard::acquire(&self.syncing) else {
            debug!("Sync requested while another pass is running");
            return Err(Error::SyncInProgress);
        };

        let start = Instant::now();
        info!("Starting sync pass (force: {})", force);

        let server = match self.detector.fetch_server_hashes().await {
            Ok(hashes) => hashes,
            Err(e) => {
                error!("Sync aborted, could not fetch server hashes: {}", e);
                return Err(e);
            }
        };

        let changed: BTreeSet<String> = if force {
            server
                .keys()
                .cloned()
                .chain(Collection::hash_keys().into_iter().map(String::from))
                .collect()
        } else {
            let stored = self.detector.stored_snapshot().await;
            ChangeDetector::compare_hashes(&stored.hashes, &server)
        };

        if changed.is_empty() {
            debug!("Server hashes unchanged, nothing to fetch");
            self.mark_synced();
            return Ok(SyncOutcome::unchanged(start.elapsed()));
        }

        let mut synced_collections = Vec::new();
        let mut errors = Vec::new();

        for key in &changed {
            let collections = Collection::for_hash_key(key);
            if collections.is_empty() {
                debug!("'{}' changed but is not cached locally", key);
                continue;
            }

            for collection in collections {
                match self.sync_collection(collection).await {
                    Ok(count) => {
                        debug!("Synced {} ({} records)", collection, count);
                        synced_collections.push(collection);
                    }
                    Err(e) => {
                        warn!("Failed to sync {}: {}", collection, e);
                        errors.push(CollectionError {
                            collection,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        let mut snapshot_advanced = false;
        if errors.is_empty() {
            if let Err(e) = self.detector.persist_hashes(&server).await {
                error!("Collections synced but hash snapshot not saved: {}", e);
                return Err(e);
            }
            snapshot_advanced = true;
        } else {
            info!(
                "{} collection(s) failed, keeping previous hash snapshot",
                errors.len()
            );
        }

        let success = snapshot_advanced;
        if success {
            self.mark_synced();
        }

        let duration = start.elapsed();
        info!(
            "Sync pass finished in {:?}: {} synced, {} failed",
            duration,
            synced_collections.len(),
            errors.len()
        );

        Ok(SyncOutcome {
            success,
            changed: changed.into_iter().collect(),
            synced_collections,
            errors,
            snapshot_advanced,
            duration,
        })
    }

    /// Fetch one collection and replace its cached records by id.
    async fn sync_collection(&self, collection: Collection) -> Result<usize> {
        let remote = self.remote.clone();
        let label = format!("{} fetch", collection);
        let records = self
            .retry
            .execute(&label, || {
                let remote = remote.clone();
                async move { remote.fetch_collection(collection).await }
            })
            .await?;

        self.cache.upsert_values(collection, &records).await
    }

    fn mark_synced(&self) {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    /// Create a trip from user input.
    ///
    /// Online, the server creates it and the returned record is cached as-is.
    /// Offline, or when the server call fails, the trip is cached under a
    /// synthetic id with `pending` status so it is never lost.
    ///
    /// # Errors
    /// - the cache write of a local draft failed
    pub async fn create_local_record(&self, draft: TripDraft) -> Result<Trip> {
        if self.connectivity.is_online() {
            match self.remote.create_trip(&draft).await {
                Ok(trip) => {
                    if let Err(e) = self.cache.upsert_many(std::slice::from_ref(&trip)).await {
                        warn!("Trip {} created remotely but not cached: {}", trip.id, e);
                    }
                    info!("Trip {} created on server", trip.id);
                    return Ok(trip);
                }
                Err(e) => warn!("Remote trip create failed, keeping it locally: {}", e),
            }
        }

        let trip = Trip::local(self.local_ids.next_id(), draft);
        self.cache.upsert_many(std::slice::from_ref(&trip)).await?;
        info!("Trip {} stored locally, pending upload", trip.id);
        Ok(trip)
    }

    /// Trips created on this device that still have to reach the server.
    pub async fn pending_trips(&self) -> Vec<Trip> {
        self.cache
            .get_all::<Trip>()
            .await
            .into_iter()
            .filter(Trip::needs_upload)
            .collect()
    }

    /// Push every pending or failed local trip to the server.
    ///
    /// On success the synthetic-id record is replaced by the server record
    /// (new identity). On failure the record is marked `error` with the message
    /// and attempt time and left for the next run. One failure never stops
    /// the others. Nothing is attempted while offline.
    ///
    /// # Errors
    /// - `ReconcileInProgress` if another reconciliation is running
    pub async fn reconcile_pending_writes(&self) -> Result<ReconcileOutcome> {
        let Some(_guard) = FlightGuard::acquire(&self.reconciling) else {
            debug!("Reconciliation requested while another one is running");
            return Err(Error::ReconcileInProgress);
        };

        if !self.connectivity.is_online() {
            debug!("Offline, postponing reconciliation");
            return Ok(ReconcileOutcome::default());
        }

        let pending = self.pending_trips().await;
        let mut outcome = ReconcileOutcome {
            attempted: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(outcome);
        }

        info!("Reconciling {} pending trip(s)", pending.len());

        for trip in pending {
            match self.remote.create_trip(&trip.draft()).await {
                Ok(created) => match self.replace_local(&trip, &created).await {
                    Ok(()) => {
                        debug!("Trip {} is now {}", trip.id, created.id);
                        outcome.reconciled += 1;
                    }
                    Err(e) => {
                        warn!("Trip {} uploaded but cache not updated: {}", trip.id, e);
                        outcome.failed += 1;
                    }
                },
                Err(e) => {
                    warn!("Upload of trip {} failed: {}", trip.id, e);
                    outcome.failed += 1;

                    let mut failed = trip;
                    failed.mark_failed(e.to_string());
                    if let Err(e) = self.cache.upsert_many(std::slice::from_ref(&failed)).await {
                        warn!("Could not record failure on trip {}: {}", failed.id, e);
                    }
                }
            }
        }

        info!(
            "Reconciliation finished: {} uploaded, {} failed",
            outcome.reconciled, outcome.failed
        );
        Ok(outcome)
    }

    /// Swap a local draft for its server-identified record.
    ///
    /// The server record is written before the draft is removed, so a crash
    /// in between leaves a duplicate rather than a lost trip.
    async fn replace_local(&self, local: &Trip, created: &Trip) -> Result<()> {
        self.cache.upsert_many(std::slice::from_ref(created)).await?;
        self.cache.remove(Collection::Trips, local.id).await
    }

    /// Assemble the runtime status.
    pub async fn get_status(&self) -> SyncStatus {
        let last_sync = *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner);
        let last_sync_time = match last_sync {
            Some(time) => Some(time),
            None => self.detector.stored_snapshot().await.last_sync,
        };

        SyncStatus {
            is_online: self.connectivity.is_online(),
            last_sync_time,
            pending_sync: !self.pending_trips().await.is_empty(),
            sync_in_progress: self.is_syncing(),
            reconcile_in_progress: self.is_reconciling(),
        }
    }

    /// Drop every cached record and the hash snapshot (logout).
    pub async fn reset(&self) {
        self.cache.wipe().await;
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("Sync state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_local_ids_are_negative_and_unique() {
        let ids = LocalIdGenerator::new();
        let issued: Vec<EntityId> = (0..1000).map(|_| ids.next_id()).collect();

        assert!(issued.iter().all(|id| *id < 0));
        let unique: HashSet<_> = issued.iter().collect();
        assert_eq!(unique.len(), issued.len());
        assert!(issued.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_flight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        {
            let _guard = FlightGuard::acquire(&flag).unwrap();
            assert!(FlightGuard::acquire(&flag).is_none());
        }
        assert!(!flag.load(Ordering::SeqCst));
        assert!(FlightGuard::acquire(&flag).is_some());
    }
}
