//! Events fed to the background scheduler by the host.

use serde::{Deserialize, Serialize};

use tripsync_common::EntityId;

use crate::remote::ServerHashes;

/// Real-time notice from the push hub.
///
/// Payloads only gate whether a pull is worth doing. They are never written
/// to the cache or to the hash snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PushEvent {
    /// One entity changed on the server.
    #[serde(rename_all = "camelCase")]
    EntityChanged {
        /// Hash key of the collection (`trips`, `vehicles`, ...).
        collection: String,
        #[serde(default)]
        entity_id: Option<EntityId>,
        /// New collection hash, when the server sends it.
        #[serde(default)]
        hash: Option<String>,
    },
    /// New server hash set.
    HashesChanged { hashes: ServerHashes },
}

impl PushEvent {
    /// Hashes carried by the event, as a partial server hash map.
    ///
    /// `None` when the event carries no hash and cannot be gated.
    pub fn hashes(&self) -> Option<ServerHashes> {
        match self {
            PushEvent::EntityChanged {
                collection,
                hash: Some(hash),
                ..
            } => Some(ServerHashes::from([(collection.clone(), hash.clone())])),
            PushEvent::EntityChanged { hash: None, .. } => None,
            PushEvent::HashesChanged { hashes } => Some(hashes.clone()),
        }
    }
}

/// Timer period selector, switched by app visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Fast,
    Slow,
}

/// Input to the scheduler control loop.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Connectivity { online: bool },
    Visibility { visible: bool },
    Push(PushEvent),
    SyncNow { force: bool },
}
