//! Remote data API contract.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use tripsync_common::{Collection, Result, Trip, TripDraft};

/// Server content hashes by hash key (`trips`, `locations`, ...).
pub type ServerHashes = BTreeMap<String, String>;

/// Remote data API consumed by the sync engine.
///
/// Implementations own transport concerns (authentication, timeouts).
/// Transport failures must surface as `Error::Network`, non-success answers
/// as `Error::Remote` so the retry policy can tell them apart.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Current content hash of every server collection, in one call.
    async fn fetch_hashes(&self) -> Result<ServerHashes>;

    /// Full contents of a collection.
    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>>;

    /// Create a trip. Returns the server record with its assigned id.
    async fn create_trip(&self, draft: &TripDraft) -> Result<Trip>;
}
