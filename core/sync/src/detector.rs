//! Hash-based change detection.
//!
//! The server exposes one opaque content hash per collection. Comparing them
//! with the last persisted snapshot tells which collections are stale without
//! transferring any bulk data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use tripsync_cache::CacheStore;
use tripsync_common::{Error, Result};

use crate::remote::{RemoteApi, ServerHashes};
use crate::retry::RetryExecutor;

/// Metadata key the snapshot is stored under.
pub const SNAPSHOT_KEY: &str = "hashSnapshot";

/// Last-synced content hashes plus the time they were recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashSnapshot {
    pub hashes: ServerHashes,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Decides which collections changed on the server.
pub struct ChangeDetector {
    remote: Arc<dyn RemoteApi>,
    cache: Arc<CacheStore>,
    retry: Arc<RetryExecutor>,
}

impl ChangeDetector {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        cache: Arc<CacheStore>,
        retry: Arc<RetryExecutor>,
    ) -> Self {
        Self {
            remote,
            cache,
            retry,
        }
    }

    /// Fetch the current server hashes (one network call, retried on
    /// transient failures).
    pub async fn fetch_server_hashes(&self) -> Result<ServerHashes> {
        let remote = self.remote.clone();
        let hashes = self
            .retry
            .execute("hash fetch", || {
                let remote = remote.clone();
                async move { remote.fetch_hashes().await }
            })
            .await?;
        debug!("Fetched {} server hashes", hashes.len());
        Ok(hashes)
    }

    /// Names whose hash differs between `stored` and `server`.
    ///
    /// A name missing from `stored` counts as changed, which forces a full
    /// sync on first run.
    pub fn compare_hashes(stored: &ServerHashes, server: &ServerHashes) -> BTreeSet<String> {
        server
            .iter()
            .filter(|(name, hash)| stored.get(*name) != Some(*hash))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The persisted snapshot, empty when missing or unreadable.
    pub async fn stored_snapshot(&self) -> HashSnapshot {
        let Some(json) = self.cache.get_metadata(SNAPSHOT_KEY).await else {
            return HashSnapshot::default();
        };
        match serde_json::from_str(&json) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Discarding unreadable hash snapshot: {}", e);
                HashSnapshot::default()
            }
        }
    }

    /// Record `server` as the new checkpoint.
    ///
    /// Only call this after every changed collection of the pass was fetched
    /// and persisted without error.
    pub async fn persist_hashes(&self, server: &ServerHashes) -> Result<HashSnapshot> {
        let snapshot = HashSnapshot {
            hashes: server.clone(),
            last_sync: Some(Utc::now()),
        };
        let json = serde_json::to_string(&snapshot).map_err(Error::from)?;
        self.cache.set_metadata(SNAPSHOT_KEY, &json).await?;
        debug!("Hash snapshot advanced ({} collections)", snapshot.hashes.len());
        Ok(snapshot)
    }

    /// Forget the checkpoint so the next pass refetches everything.
    pub async fn reset(&self) -> Result<()> {
        let json = serde_json::to_string(&HashSnapshot::default()).map_err(Error::from)?;
        self.cache.set_metadata(SNAPSHOT_KEY, &json).await
    }
}
