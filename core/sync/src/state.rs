//! Runtime sync state and pass results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tripsync_common::Collection;

/// Runtime-only view of the engine, assembled on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Any cached trip still waiting for upload (pending or failed).
    pub pending_sync: bool,
    pub sync_in_progress: bool,
    pub reconcile_in_progress: bool,
}

/// A collection that could not be fetched or persisted during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionError {
    pub collection: Collection,
    pub message: String,
}

/// Result of one synchronization pass.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// True when every changed collection was fetched and persisted.
    pub success: bool,
    /// Hash keys the pass considered stale.
    pub changed: Vec<String>,
    /// Collections fetched and persisted.
    pub synced_collections: Vec<Collection>,
    pub errors: Vec<CollectionError>,
    /// Whether the hash snapshot was advanced.
    pub snapshot_advanced: bool,
    pub duration: Duration,
}

impl SyncOutcome {
    /// Pass that found nothing to do.
    pub fn unchanged(duration: Duration) -> Self {
        Self {
            success: true,
            changed: Vec::new(),
            synced_collections: Vec::new(),
            errors: Vec::new(),
            snapshot_advanced: false,
            duration,
        }
    }
}

/// Result of one reconciliation of pending local writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub attempted: usize,
    pub reconciled: usize,
    pub failed: usize,
}

/// Shared online/offline flag fed by the host's connectivity signal.
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record the new state and return the previous one.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_is_shared() {
        let connectivity = Connectivity::new(false);
        let observer = connectivity.clone();

        assert!(!connectivity.set_online(true));
        assert!(observer.is_online());
        assert!(connectivity.set_online(false));
        assert!(!observer.is_online());
    }

    #[test]
    fn test_status_serialization() {
        let status = SyncStatus {
            is_online: true,
            last_sync_time: None,
            pending_sync: false,
            sync_in_progress: false,
            reconcile_in_progress: false,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["isOnline"], true);
        assert_eq!(json["pendingSync"], false);
    }
}
