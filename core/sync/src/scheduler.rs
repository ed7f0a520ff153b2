//! Background scheduling - timer cadence, connectivity, visibility and push triggers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use tripsync_common::{Error, Result};

use crate::config::SyncConfig;
use crate::coordinator::SyncCoordinator;
use crate::detector::ChangeDetector;
use crate::events::{Cadence, PushEvent, SchedulerEvent};
use crate::queue::{WorkQueue, WorkRequest};

const EVENT_BUFFER: usize = 100;

/// Cloneable sender used by event producers (connectivity, visibility, push).
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    events: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    async fn send(&self, event: SchedulerEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::SchedulerStopped)
    }

    /// Report a connectivity change. Going online uploads pending writes and syncs.
    pub async fn connectivity_changed(&self, online: bool) -> Result<()> {
        self.send(SchedulerEvent::Connectivity { online }).await
    }

    /// Report an app visibility change. Visible runs fast, hidden runs slow.
    pub async fn visibility_changed(&self, visible: bool) -> Result<()> {
        self.send(SchedulerEvent::Visibility { visible }).await
    }

    /// Deliver a push notice. A sync follows only if the pushed hashes differ
    /// from the stored snapshot.
    pub async fn push(&self, event: PushEvent) -> Result<()> {
        self.send(SchedulerEvent::Push(event)).await
    }

    /// Ask for a sync pass as soon as the worker is free.
    pub async fn request_sync(&self, force: bool) -> Result<()> {
        self.send(SchedulerEvent::SyncNow { force }).await
    }
}

struct Running {
    handle: SchedulerHandle,
    queue: Arc<WorkQueue>,
    shutdown: oneshot::Sender<()>,
    control: JoinHandle<()>,
    worker: JoinHandle<()>,
}

/// Decides when the coordinator runs.
///
/// All triggers funnel into one collapsing [`WorkQueue`] drained by a single
/// worker task, so passes never overlap and bursts of triggers cost one pass.
pub struct BackgroundScheduler {
    coordinator: Arc<SyncCoordinator>,
    fast_interval: Duration,
    slow_interval: Duration,
    cadence: Arc<watch::Sender<Cadence>>,
    running: Mutex<Option<Running>>,
}

impl BackgroundScheduler {
    /// Fails with [`Error::Config`] if either interval is zero or fast exceeds slow.
    pub fn new(coordinator: Arc<SyncCoordinator>, config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let (cadence, _) = watch::channel(Cadence::Fast);
        Ok(Self {
            coordinator,
            fast_interval: config.fast_interval(),
            slow_interval: config.slow_interval(),
            cadence: Arc::new(cadence),
            running: Mutex::new(None),
        })
    }

    /// Start scheduling.
    ///
    /// Runs one pass immediately (reconcile, then sync), then arms the timer
    /// and starts listening for events. Calling `start` on a running
    /// scheduler returns its existing handle.
    pub async fn start(&self) -> Result<SchedulerHandle> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.handle.clone());
        }

        info!("Starting background scheduler");
        run_work(&self.coordinator, WorkRequest::reconcile_and_sync()).await;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let queue = Arc::new(WorkQueue::new());

        let control = ControlLoop {
            coordinator: self.coordinator.clone(),
            queue: queue.clone(),
            cadence: self.cadence.clone(),
            fast_interval: self.fast_interval,
            slow_interval: self.slow_interval,
        };
        let control = tokio::spawn(control.run(events_rx, shutdown_rx));

        let worker = {
            let coordinator = self.coordinator.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Some(request) = queue.next().await {
                    run_work(&coordinator, request).await;
                }
                debug!("Sync worker stopped");
            })
        };

        let handle = SchedulerHandle { events: events_tx };
        *running = Some(Running {
            handle: handle.clone(),
            queue,
            shutdown: shutdown_tx,
            control,
            worker,
        });

        Ok(handle)
    }

    /// Stop scheduling.
    ///
    /// Disarms the timer and drops queued work. A pass already running is not
    /// cancelled; the worker exits once it finishes.
    pub async fn stop(&self) {
        let _ = self.halt().await;
    }

    /// Stop scheduling and wait for an in-flight pass to finish.
    pub async fn shutdown(&self) {
        if let Some(worker) = self.halt().await {
            if let Err(e) = worker.await {
                warn!("Sync worker ended abnormally: {}", e);
            }
        }
    }

    async fn halt(&self) -> Option<JoinHandle<()>> {
        let running = self.running.lock().await.take()?;

        let _ = running.shutdown.send(());
        running.queue.close();
        if let Err(e) = running.control.await {
            warn!("Scheduler control loop ended abnormally: {}", e);
        }

        info!("Background scheduler stopped");
        Some(running.worker)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn cadence(&self) -> Cadence {
        *self.cadence.borrow()
    }

    /// Observe cadence switches.
    pub fn subscribe_cadence(&self) -> watch::Receiver<Cadence> {
        self.cadence.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }
}

/// Owns the single timer and turns events into work requests.
struct ControlLoop {
    coordinator: Arc<SyncCoordinator>,
    queue: Arc<WorkQueue>,
    cadence: Arc<watch::Sender<Cadence>>,
    fast_interval: Duration,
    slow_interval: Duration,
}

impl ControlLoop {
    async fn run(
        self,
        mut events: mpsc::Receiver<SchedulerEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut visible = *self.cadence.borrow() == Cadence::Fast;
        let mut ticker = self.arm(*self.cadence.borrow());

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(cadence) = self.handle_event(event, &mut visible).await {
                        self.cadence.send_replace(cadence);
                        ticker = self.arm(cadence);
                    }
                }

                _ = ticker.tick() => {
                    if self.coordinator.connectivity().is_online() {
                        debug!("Timer tick, requesting sync");
                        self.queue.submit(WorkRequest::sync(false));
                    } else {
                        debug!("Offline, skipping timer tick");
                    }
                }
            }
        }

        debug!("Scheduler control loop stopped");
    }

    /// Build the timer for `cadence`. The first tick is one full period away.
    fn arm(&self, cadence: Cadence) -> Interval {
        let period = match cadence {
            Cadence::Fast => self.fast_interval,
            Cadence::Slow => self.slow_interval,
        };
        debug!("Timer armed: {:?} ({:?})", cadence, period);

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Apply one event. Returns the new cadence when it changes.
    async fn handle_event(&self, event: SchedulerEvent, visible: &mut bool) -> Option<Cadence> {
        match event {
            SchedulerEvent::Connectivity { online } => {
                let was_online = self.coordinator.connectivity().set_online(online);
                if online && !was_online {
                    info!("Back online, reconciling and syncing");
                    self.queue.submit(WorkRequest::reconcile_and_sync());
                } else if !online && was_online {
                    info!("Went offline");
                }
                None
            }
            SchedulerEvent::Visibility { visible: now_visible } => {
                if now_visible == *visible {
                    return None;
                }
                *visible = now_visible;

                if now_visible {
                    debug!("App visible, switching to fast cadence");
                    self.queue.submit(WorkRequest::sync(false));
                    Some(Cadence::Fast)
                } else {
                    debug!("App hidden, switching to slow cadence");
                    Some(Cadence::Slow)
                }
            }
            SchedulerEvent::Push(push) => {
                self.handle_push(push).await;
                None
            }
            SchedulerEvent::SyncNow { force } => {
                self.queue.submit(WorkRequest::sync(force));
                None
            }
        }
    }

    async fn handle_push(&self, push: PushEvent) {
        let Some(pushed) = push.hashes() else {
            debug!("Push without hash, requesting sync");
            self.queue.submit(WorkRequest::sync(false));
            return;
        };

        let stored = self.coordinator.detector().stored_snapshot().await;
        let changed = ChangeDetector::compare_hashes(&stored.hashes, &pushed);
        if changed.is_empty() {
            debug!("Push matches stored hashes, ignoring");
        } else {
            debug!("Push reports changes in {:?}, requesting sync", changed);
            self.queue.submit(WorkRequest::sync(false));
        }
    }
}

/// Execute one work request: reconcile first, then sync.
async fn run_work(coordinator: &SyncCoordinator, request: WorkRequest) {
    if !coordinator.connectivity().is_online() {
        debug!("Offline, deferring background work");
        return;
    }

    if request.reconcile {
        match coordinator.reconcile_pending_writes().await {
            Ok(outcome) if outcome.failed > 0 => {
                warn!("{} pending trip(s) could not be uploaded", outcome.failed)
            }
            Ok(_) => {}
            Err(Error::ReconcileInProgress) => debug!("Reconciliation already running"),
            Err(e) => warn!("Background reconciliation failed: {}", e),
        }
    }

    if request.sync {
        match coordinator.perform_sync(request.force).await {
            Ok(outcome) if !outcome.success => {
                warn!("Background sync incomplete: {} error(s)", outcome.errors.len())
            }
            Ok(_) => {}
            Err(Error::SyncInProgress) => debug!("Sync already running"),
            Err(e) => warn!("Background sync failed: {}", e),
        }
    }
}
