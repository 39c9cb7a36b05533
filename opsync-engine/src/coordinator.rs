//! Offline coordinator facade
//!
//! The coordinator is what the rest of the application talks to: it wires
//! connectivity edges to the sync manager, exposes enqueue / manual sync /
//! enable / disable / reset, and folds every fact from the store, the manager
//! and the monitor into one aggregate state object pushed to subscribers.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use opsync_store::{
    OperationKind, OperationPriority, OperationRecord, PendingStore, StorageUsage,
};

use crate::config::SyncConfig;
use crate::connectivity::{ConnectionQuality, ConnectivityMonitor, Transition};
use crate::errors::Result;
use crate::executor::OperationExecutor;
use crate::manager::{CycleOutcome, SyncEvent, SyncManager};
use crate::status::SyncStatus;

/// A record that exhausted its retry budget, surfaced to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRecord {
    pub record: OperationRecord,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Aggregate offline state, owned exclusively by the coordinator.
///
/// Every other component only emits facts; the coordinator folds them in
/// here and broadcasts the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineState {
    pub reachable: bool,
    pub ready: bool,
    pub status: SyncStatus,
    /// Live pending list, updated optimistically on enqueue.
    pub pending: Vec<OperationRecord>,
    pub last_sync: Option<DateTime<Utc>>,
    pub quality: ConnectionQuality,
    pub usage: StorageUsage,
    /// Most recent terminal drop, if any.
    pub last_dropped: Option<DroppedRecord>,
}

impl Default for OfflineState {
    fn default() -> Self {
        Self {
            reachable: false,
            ready: false,
            status: SyncStatus::default(),
            pending: Vec::new(),
            last_sync: None,
            quality: ConnectionQuality::Offline,
            usage: StorageUsage::default(),
            last_dropped: None,
        }
    }
}

type Listener = Arc<dyn Fn(&OfflineState) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Handle returned by [`OfflineCoordinator::subscribe`]. Dropping it detaches
/// the listener; safe at any point, including during coordinator teardown.
pub struct Subscription {
    id: u64,
    observers: Weak<StdMutex<Observers>>,
}

impl Subscription {
    /// Detach the listener now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            lock(&observers).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

// A poisoned lock means a listener panicked; the data is still usable.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Facade over the offline engine.
pub struct OfflineCoordinator {
    store: Arc<dyn PendingStore>,
    manager: Arc<SyncManager>,
    monitor: Arc<ConnectivityMonitor>,
    config: Arc<RwLock<SyncConfig>>,
    state: StdMutex<OfflineState>,
    observers: Arc<StdMutex<Observers>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl OfflineCoordinator {
    /// Bring up the engine over the given store and executor.
    ///
    /// Fails with [`opsync_store::StoreError::Unavailable`] when durable
    /// storage cannot be provided - offline mode cannot be enabled then.
    pub async fn new(
        store: Arc<dyn PendingStore>,
        executor: Arc<dyn OperationExecutor>,
        config: SyncConfig,
    ) -> Result<Arc<Self>> {
        store.initialize().await?;

        let enable = config.enable_sync;
        let debounce = config.debounce;
        let config = Arc::new(RwLock::new(config));

        let monitor = Arc::new(ConnectivityMonitor::new());
        monitor.set_debounce(debounce);

        let (manager, events) = SyncManager::new(store.clone(), executor, config.clone());

        let pending = store.list_pending().await?;
        let last_sync = match store.last_sync().await {
            Ok(at) => at,
            Err(e) => {
                warn!("Could not load last sync time: {}", e);
                None
            }
        };
        let usage = match store.usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Could not read storage usage: {}", e);
                StorageUsage::unknown()
            }
        };

        info!(
            "Offline coordinator ready: {} pending operation(s)",
            pending.len()
        );

        let state = OfflineState {
            reachable: false,
            ready: true,
            status: SyncStatus::default(),
            pending,
            last_sync,
            quality: ConnectionQuality::Offline,
            usage,
            last_dropped: None,
        };

        let coordinator = Arc::new(Self {
            store,
            manager,
            monitor,
            config,
            state: StdMutex::new(state),
            observers: Arc::new(StdMutex::new(Observers::default())),
            tasks: StdMutex::new(Vec::new()),
        });

        Self::spawn_event_loop(&coordinator, events);
        if enable {
            coordinator.enable().await;
        }

        Ok(coordinator)
    }

    /// Queue a mutation for replay.
    ///
    /// The record is visible in the aggregate's pending list before any
    /// network activity happens (optimistic local visibility).
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
        priority: OperationPriority,
    ) -> Result<OperationRecord> {
        let record = OperationRecord::new(kind, payload, priority);
        self.store.put(&record).await?;
        debug!("Queued operation {}", record.id);

        let queued = record.clone();
        self.update_state(move |state| state.pending.push(queued));
        Ok(record)
    }

    /// Force one replay cycle now, regardless of timer phase. Resolves
    /// immediately when unreachable.
    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        if !self.monitor.is_reachable() {
            debug!("Manual sync skipped: unreachable");
            return Ok(CycleOutcome::Unreachable);
        }
        self.manager.run_cycle().await
    }

    /// Start automatic replay. Idempotent.
    pub async fn enable(&self) {
        self.config.write().await.enable_sync = true;
        self.manager
            .clone()
            .start_auto_sync(self.monitor.clone())
            .await;
    }

    /// Stop automatic replay. Idempotent. Pending records are kept and an
    /// in-flight cycle runs to the end of its batch; only future automatic
    /// triggers are halted.
    pub async fn disable(&self) {
        self.config.write().await.enable_sync = false;
        self.manager.stop_auto_sync().await;
    }

    /// Drop all queued offline data. Irreversible.
    pub async fn reset(&self) -> Result<()> {
        self.store.clear().await?;
        info!("Offline data reset");
        self.update_state(|state| {
            state.pending.clear();
            state.last_dropped = None;
        });
        Ok(())
    }

    /// Feed one reachability report from the host platform.
    ///
    /// A (non-suppressed) transition to reachable triggers one immediate
    /// cycle when automatic sync is enabled, independent of the timer phase.
    pub async fn set_reachable(&self, reachable: bool) {
        let transition = self.monitor.set_reachable(reachable);
        if transition == Transition::Unchanged {
            return;
        }
        self.update_state(|state| state.reachable = reachable);

        if transition == Transition::BecameReachable && self.config.read().await.enable_sync {
            let manager = self.manager.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.run_cycle().await {
                    warn!("Reachability-triggered cycle failed: {}", e);
                }
            });
        }
    }

    /// Replace the runtime configuration.
    ///
    /// Restarts the auto-sync timer when the interval changed while running,
    /// and starts/stops it when the enable flag flipped.
    pub async fn set_config(&self, new: SyncConfig) {
        let (interval_changed, was_enabled) = {
            let mut config = self.config.write().await;
            let interval_changed = config.sync_interval != new.sync_interval;
            let was_enabled = config.enable_sync;
            *config = new.clone();
            (interval_changed, was_enabled)
        };
        self.monitor.set_debounce(new.debounce);

        if new.enable_sync && !was_enabled {
            self.manager
                .clone()
                .start_auto_sync(self.monitor.clone())
                .await;
        } else if !new.enable_sync && was_enabled {
            self.manager.stop_auto_sync().await;
        } else if new.enable_sync && interval_changed {
            // Restart so the new period takes effect immediately.
            self.manager.stop_auto_sync().await;
            self.manager
                .clone()
                .start_auto_sync(self.monitor.clone())
                .await;
        }
    }

    /// Current configuration snapshot.
    pub async fn config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    /// Snapshot of the aggregate offline state.
    pub fn state(&self) -> OfflineState {
        lock(&self.state).clone()
    }

    pub fn is_reachable(&self) -> bool {
        self.monitor.is_reachable()
    }

    /// Current replay status snapshot.
    pub fn sync_status(&self) -> SyncStatus {
        self.manager.status()
    }

    /// Register a listener invoked on every aggregate-state change.
    ///
    /// The listener fires once immediately with the current state. Dropping
    /// the returned subscription detaches it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&OfflineState) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = {
            let mut observers = lock(&self.observers);
            let id = observers.next_id;
            observers.next_id += 1;
            observers.listeners.push((id, listener.clone()));
            id
        };
        (*listener)(&self.state());
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Tear down: cancel the auto-sync timer and the event loop, detach all
    /// listeners. An in-flight replay cycle is not interrupted.
    pub async fn shutdown(&self) {
        self.manager.stop_auto_sync().await;
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.observers).listeners.clear();
        info!("Offline coordinator shut down");
    }

    fn spawn_event_loop(coordinator: &Arc<Self>, mut events: mpsc::UnboundedReceiver<SyncEvent>) {
        let weak = Arc::downgrade(coordinator);
        let mut status_rx = coordinator.manager.subscribe_status();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(coordinator) = weak.upgrade() else { break };
                        let status = status_rx.borrow_and_update().clone();
                        coordinator.update_state(|state| state.status = status);
                    }
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(coordinator) = weak.upgrade() else { break };
                        coordinator.apply_event(event).await;
                    }
                }
            }
            debug!("Coordinator event loop stopped");
        });
        lock(&coordinator.tasks).push(handle);
    }

    async fn apply_event(&self, event: SyncEvent) {
        match event {
            // Status changes flow through the watch channel.
            SyncEvent::CycleStarted { .. } => {}
            SyncEvent::CycleFinished { completed, .. } => {
                let pending = match self.store.list_pending().await {
                    Ok(pending) => Some(pending),
                    Err(e) => {
                        warn!("Could not refresh pending list: {}", e);
                        None
                    }
                };
                let usage = self.store.usage().await.ok();
                let last_sync = if completed > 0 {
                    let now = Utc::now();
                    if let Err(e) = self.store.set_last_sync(now).await {
                        warn!("Could not persist last sync time: {}", e);
                    }
                    Some(now)
                } else {
                    None
                };
                self.update_state(move |state| {
                    if let Some(pending) = pending {
                        state.pending = pending;
                    }
                    if let Some(usage) = usage {
                        state.usage = usage;
                    }
                    if let Some(at) = last_sync {
                        state.last_sync = Some(at);
                    }
                });
            }
            // The cycle-level error already flowed through the status watch;
            // records were left untouched.
            SyncEvent::CycleAborted { .. } => {}
            SyncEvent::RecordDropped { record, error } => {
                let pending = self.store.list_pending().await.ok();
                self.update_state(move |state| {
                    if let Some(pending) = pending {
                        state.pending = pending;
                    }
                    state.last_dropped = Some(DroppedRecord {
                        record,
                        error: error.to_string(),
                        at: Utc::now(),
                    });
                });
            }
        }
    }

    /// Apply a mutation to the aggregate, rederive the cosmetic quality tier,
    /// and broadcast the new snapshot.
    fn update_state<F>(&self, apply: F)
    where
        F: FnOnce(&mut OfflineState),
    {
        let snapshot = {
            let mut state = lock(&self.state);
            apply(&mut state);
            state.quality = ConnectionQuality::derive(state.reachable, state.last_sync, Utc::now());
            state.clone()
        };
        self.notify(&snapshot);
    }

    fn notify(&self, state: &OfflineState) {
        // Snapshot the listener list first so a listener may unsubscribe
        // re-entrantly without deadlocking.
        let listeners: Vec<Listener> = lock(&self.observers)
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            (*listener)(state);
        }
    }
}

impl Drop for OfflineCoordinator {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}
