//! Tripsync Sync Engine
//!
//! Offline-first synchronization of the reference dataset:
//! - Hash-based change detection against the server
//! - Full-collection refetch with an all-or-nothing checkpoint
//! - Local trip drafts with later reconciliation to server identity
//! - Background scheduling driven by timers, connectivity, visibility and push
//! - Retry strategy with exponential backoff

pub mod config;
pub mod coordinator;
pub mod detector;
pub mod events;
pub mod http;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use config::SyncConfig;
pub use coordinator::{LocalIdGenerator, SyncCoordinator};
pub use detector::{ChangeDetector, HashSnapshot, SNAPSHOT_KEY};
pub use events::{Cadence, PushEvent, SchedulerEvent};
pub use http::HttpRemoteApi;
pub use queue::{WorkQueue, WorkRequest};
pub use remote::{RemoteApi, ServerHashes};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{BackgroundScheduler, SchedulerHandle};
pub use state::{CollectionError, Connectivity, ReconcileOutcome, SyncOutcome, SyncStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _connectivity = Connectivity::default();
        let _queue = WorkQueue::new();
    }
}
