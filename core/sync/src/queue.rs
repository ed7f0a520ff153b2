//! Collapsing work queue between event producers and the sync worker.
//!
//! Holds at most one pending request. Submitting while a request is pending
//! merges the two, so bursts of triggers cost one pass.

use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

/// Work the worker should perform next. Reconciliation runs before sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkRequest {
    pub reconcile: bool,
    pub sync: bool,
    pub force: bool,
}

impl WorkRequest {
    pub fn sync(force: bool) -> Self {
        Self {
            reconcile: false,
            sync: true,
            force,
        }
    }

    /// Upload pending writes, then sync.
    pub fn reconcile_and_sync() -> Self {
        Self {
            reconcile: true,
            sync: true,
            force: false,
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            reconcile: self.reconcile || other.reconcile,
            sync: self.sync || other.sync,
            force: self.force || other.force,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.reconcile && !self.sync
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Option<WorkRequest>,
    closed: bool,
}

/// Single-consumer queue collapsed to one pending [`WorkRequest`].
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add work, merging with anything already pending.
    ///
    /// Returns false once the queue is closed.
    pub fn submit(&self, request: WorkRequest) -> bool {
        if request.is_empty() {
            return true;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return false;
            }
            state.pending = Some(match state.pending.take() {
                Some(pending) => pending.merge(request),
                None => request,
            });
        }

        self.notify.notify_one();
        true
    }

    /// Wait for the next request. `None` once the queue is closed.
    pub async fn next(&self) -> Option<WorkRequest> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return None;
                }
                if let Some(request) = state.pending.take() {
                    return Some(request);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Request currently waiting, if any.
    pub fn pending(&self) -> Option<WorkRequest> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
    }

    /// Drop pending work and wake the consumer so it can exit.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.pending = None;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_requests_collapse() {
        let queue = WorkQueue::new();
        assert!(queue.submit(WorkRequest::sync(false)));
        assert!(queue.submit(WorkRequest::sync(true)));
        assert!(queue.submit(WorkRequest::reconcile_and_sync()));

        assert_eq!(
            queue.pending(),
            Some(WorkRequest {
                reconcile: true,
                sync: true,
                force: true,
            })
        );
    }

    #[tokio::test]
    async fn test_next_takes_the_pending_request() {
        let queue = WorkQueue::new();
        queue.submit(WorkRequest::sync(false));
        queue.submit(WorkRequest::sync(false));

        assert_eq!(queue.next().await, Some(WorkRequest::sync(false)));
        assert!(queue.pending().is_none());
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_submit() {
        let queue = Arc::new(WorkQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::task::yield_now().await;
        queue.submit(WorkRequest::reconcile_and_sync());

        assert_eq!(
            consumer.await.unwrap(),
            Some(WorkRequest::reconcile_and_sync())
        );
    }

    #[tokio::test]
    async fn test_close_ends_consumer_and_rejects_work() {
        let queue = Arc::new(WorkQueue::new());
        queue.submit(WorkRequest::sync(false));
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.next().await, None);
        assert!(!queue.submit(WorkRequest::sync(true)));
    }

    #[test]
    fn test_empty_request_is_ignored() {
        let queue = WorkQueue::new();
        queue.submit(WorkRequest::default());
        assert!(queue.pending().is_none());
    }
}
