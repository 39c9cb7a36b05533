//! Replay cycle state machine
//!
//! The manager owns the two-state Idle/Replaying machine: it pulls pending
//! records from the store, orders them deterministically, plays each through
//! the injected executor, and removes or re-persists records as it goes. The
//! store has no transactional isolation, so at most one cycle may ever be in
//! flight - the `active` flag is the mutual-exclusion mechanism and is
//! checked-and-set atomically.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use opsync_store::{CycleRecord, OperationRecord, PendingStore};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::errors::Result;
use crate::executor::{ExecutorError, OperationExecutor};
use crate::status::SyncStatus;

/// Facts the manager emits while replaying, folded into the aggregate state
/// by the coordinator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    CycleStarted {
        total: usize,
    },
    CycleFinished {
        completed: usize,
        failed: usize,
        dropped: usize,
    },
    /// Store I/O failed; queued records were left untouched.
    CycleAborted {
        error: String,
    },
    /// Terminal: the record exhausted its retry budget and was removed.
    RecordDropped {
        record: OperationRecord,
        error: ExecutorError,
    },
}

/// How a requested replay cycle resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed {
        completed: usize,
        failed: usize,
        dropped: usize,
    },
    /// Another cycle held the replay flag; nothing was done.
    AlreadyReplaying,
    NothingPending,
    /// The engine is unreachable; nothing was attempted.
    Unreachable,
}

/// Deterministic replay order: priority descending, then `created_at`
/// ascending - FIFO within each priority band.
pub fn replay_order(a: &OperationRecord, b: &OperationRecord) -> CmpOrdering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Owns the replay loop over the pending-operation store.
pub struct SyncManager {
    store: Arc<dyn PendingStore>,
    executor: Arc<dyn OperationExecutor>,
    config: Arc<RwLock<SyncConfig>>,
    /// Idle (false) / Replaying (true).
    active: AtomicBool,
    status_tx: watch::Sender<SyncStatus>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    /// Cancel handle for the auto-sync timer task.
    auto_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    /// Build a manager plus the receiving end of its event stream.
    pub fn new(
        store: Arc<dyn PendingStore>,
        executor: Arc<dyn OperationExecutor>,
        config: Arc<RwLock<SyncConfig>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SyncEvent>) {
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            store,
            executor,
            config,
            active: AtomicBool::new(false),
            status_tx,
            events_tx,
            auto_task: Mutex::new(None),
        });
        (manager, events_rx)
    }

    /// True while a replay cycle is running.
    pub fn is_replaying(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    /// Watch-based status subscription.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Run one replay cycle over the records currently pending.
    ///
    /// Records enqueued after the cycle's initial read are not part of this
    /// batch; they are picked up by the next cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        // Idle -> Replaying. A concurrent trigger (timer tick, reachability
        // edge, manual sync) loses the exchange and backs off.
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Replay cycle already in progress");
            return Ok(CycleOutcome::AlreadyReplaying);
        }

        let result = self.replay_batch().await;

        if let Err(error) = &result {
            warn!("Replay cycle aborted: {}", error);
            self.publish(|status| {
                status.is_active = false;
                status.current_operation = None;
                status.error = Some(error.to_string());
            });
            let _ = self.events_tx.send(SyncEvent::CycleAborted {
                error: error.to_string(),
            });
        }

        self.active.store(false, Ordering::SeqCst);
        result
    }

    async fn replay_batch(&self) -> Result<CycleOutcome> {
        let started_at = Utc::now();

        let mut batch = self.store.list_pending().await?;
        if batch.is_empty() {
            debug!("No pending operations; staying idle");
            return Ok(CycleOutcome::NothingPending);
        }
        batch.sort_by(replay_order);

        let total = batch.len();
        let (max_retries, retry_delay, op_timeout) = {
            let config = self.config.read().await;
            (config.max_retries, config.retry_delay, config.op_timeout)
        };

        info!("Replay cycle started: {} pending operation(s)", total);
        self.status_tx.send_replace(SyncStatus::begin(total));
        let _ = self.events_tx.send(SyncEvent::CycleStarted { total });

        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut dropped = 0usize;

        for (index, mut record) in batch.into_iter().enumerate() {
            self.publish(|status| {
                status.current_operation = Some(record.label());
                status.progress = SyncStatus::batch_progress(index, total);
            });

            match self.execute_one(&record, op_timeout).await {
                Ok(()) => {
                    self.store.remove(&record.id).await?;
                    completed += 1;
                    debug!("Operation confirmed: {}", record.id);
                    self.publish(|status| status.completed = completed);
                }
                Err(error) => {
                    failed += 1;
                    record.retry_count += 1;
                    if record.retry_count >= max_retries {
                        // Terminal. The drop is reported, never swallowed.
                        self.store.remove(&record.id).await?;
                        dropped += 1;
                        warn!(
                            "Dropping operation {} after {} failed attempts: {}",
                            record.id, record.retry_count, error
                        );
                        let _ = self
                            .events_tx
                            .send(SyncEvent::RecordDropped { record, error });
                    } else {
                        debug!(
                            "Operation {} failed (attempt {}/{}): {}",
                            record.id, record.retry_count, max_retries, error
                        );
                        self.store.put(&record).await?;
                    }
                    // One failing record never blocks the rest of the batch;
                    // just give the remote a moment before the next attempt.
                    if !retry_delay.is_zero() {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }

        let finished_at = Utc::now();
        self.publish(|status| {
            status.is_active = false;
            status.progress = 100;
            status.current_operation = None;
        });

        let cycle = CycleRecord {
            started_at,
            finished_at: Some(finished_at),
            completed: completed as u32,
            failed: failed as u32,
            dropped: dropped as u32,
            error: None,
        };
        if let Err(e) = self.store.record_cycle(&cycle).await {
            warn!("Failed to record cycle history: {}", e);
        }

        info!(
            "Replay cycle finished: {} confirmed, {} failed, {} dropped",
            completed, failed, dropped
        );
        let _ = self.events_tx.send(SyncEvent::CycleFinished {
            completed,
            failed,
            dropped,
        });

        Ok(CycleOutcome::Completed {
            completed,
            failed,
            dropped,
        })
    }

    async fn execute_one(
        &self,
        record: &OperationRecord,
        op_timeout: Option<Duration>,
    ) -> std::result::Result<(), ExecutorError> {
        let call = self.executor.execute(record.kind, &record.payload);
        match op_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ExecutorError::Timeout(limit)),
            },
            None => call.await,
        }
    }

    fn publish<F>(&self, update: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        self.status_tx.send_modify(update);
    }

    /// Start the recurring auto-sync timer. Idempotent.
    ///
    /// Each tick runs a cycle only when reachable and Idle; the period is
    /// re-read from the config every iteration.
    pub async fn start_auto_sync(self: Arc<Self>, monitor: Arc<ConnectivityMonitor>) {
        let mut task = self.auto_task.lock().await;
        if task.is_some() {
            debug!("Auto-sync already running");
            return;
        }

        let weak = Arc::downgrade(&self);
        let handle = tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(manager) => manager.config.read().await.sync_interval,
                    None => break,
                };
                tokio::time::sleep(interval).await;

                let Some(manager) = weak.upgrade() else { break };
                if !monitor.is_reachable() {
                    debug!("Auto-sync tick skipped: unreachable");
                    continue;
                }
                // Detached, so cancelling the timer never interrupts a cycle
                // mid-batch.
                tokio::spawn(async move {
                    if let Err(e) = manager.run_cycle().await {
                        warn!("Auto-sync cycle failed: {}", e);
                    }
                });
            }
            debug!("Auto-sync timer stopped");
        });
        *task = Some(handle);
        info!("Auto-sync timer started");
    }

    /// Cancel the auto-sync timer. Idempotent. An in-flight cycle is not
    /// interrupted; it runs to the end of its current batch.
    pub async fn stop_auto_sync(&self) {
        let mut task = self.auto_task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Auto-sync timer cancelled");
        }
    }

    /// Whether the auto-sync timer task is currently scheduled.
    pub async fn auto_sync_running(&self) -> bool {
        self.auto_task.lock().await.is_some()
    }
}
