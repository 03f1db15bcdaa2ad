//! # Sync Controller
//!
//! Owns the local and remote store for one user session and drives
//! synchronization passes on a single dedicated worker thread.
//!
//! ## Scheduling
//!
//! ```text
//!            request_sync()             due time reached
//!   Idle ------------------> SyncScheduled ----------------> Syncing
//!    ^                          ^                               |
//!    |         pass failed, or  |                               |
//!    |         succeeded with a rerun pending                   |
//!    |                          +-------------------------------+
//!    +---------------------- pass succeeded --------------------+
//! ```
//!
//! Requests while `SyncScheduled` are coalesced into the queued pass. A
//! request while `Syncing` marks a rerun: the current pass may have read the
//! local store before the write landed, so a successful pass with a rerun
//! pending schedules another one immediately. Failed passes are retried after
//! a fixed interval, indefinitely.
//!
//! ## Local mutations
//!
//! Every mutation completes on the local store first and only then requests
//! a pass. A local failure is returned to the caller and never triggers one.
//! The local store sits behind one mutex shared by callers and the worker, so
//! a pass sees a consistent local view.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::elapsed_ms;
use crate::error::{PersistenceError, Result};
use crate::model::{AggregateRecord, EditTime, RunRecord};
use crate::session::TokenProvider;
use crate::store::{RemoteSession, StorageComponent};
use crate::sync::{synchronize, SyncReport};

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing to do
    Idle,
    /// A pass is queued (immediately, or after the retry interval)
    SyncScheduled,
    /// A pass is running on the worker
    Syncing,
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub passes_succeeded: u64,
    pub passes_failed: u64,
    /// Requests that arrived while a pass was queued or running
    pub requests_coalesced: u64,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<PersistenceError>,
}

struct Schedule {
    phase: SyncPhase,
    due: Option<Instant>,
    /// A request arrived while a pass was running
    rerun: bool,
    shutdown: bool,
    stats: SyncStats,
}

struct Shared<L, R> {
    local: Mutex<L>,
    remote: Mutex<R>,
    tokens: Arc<dyn TokenProvider>,
    retry_interval: Duration,
    schedule: Mutex<Schedule>,
    changed: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Single-worker synchronization controller.
pub struct SyncController<L, R>
where
    L: StorageComponent + 'static,
    R: StorageComponent + RemoteSession + 'static,
{
    shared: Arc<Shared<L, R>>,
    worker: Option<JoinHandle<()>>,
}

impl<L, R> SyncController<L, R>
where
    L: StorageComponent + 'static,
    R: StorageComponent + RemoteSession + 'static,
{
    /// Take ownership of both stores and start the worker. No pass runs until
    /// one is requested.
    pub fn new(
        local: L,
        remote: R,
        tokens: Arc<dyn TokenProvider>,
        retry_interval: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            local: Mutex::new(local),
            remote: Mutex::new(remote),
            tokens,
            retry_interval,
            schedule: Mutex::new(Schedule {
                phase: SyncPhase::Idle,
                due: None,
                rerun: false,
                shutdown: false,
                stats: SyncStats::default(),
            }),
            changed: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("runsync-sync".to_string())
            .spawn(move || worker_shared.run_worker())
            .map_err(|e| {
                PersistenceError::unavailable(format!("Failed to spawn sync worker: {}", e))
            })?;

        info!(
            "[SyncController] Started (retry interval {:?})",
            retry_interval
        );
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    /// Save (or overwrite) a run locally, then request a pass.
    pub fn save_run(&self, record: &RunRecord) -> Result<EditTime> {
        let edit_time = self.shared.with_local(|local| local.save_record(record, None))?;
        self.request_sync();
        Ok(edit_time)
    }

    /// Delete a run locally by writing its ghost, then removing the record.
    ///
    /// If the ghost cannot be written the record is left alone, so a
    /// record is never removed without its tombstone.
    pub fn delete_run(&self, record: &RunRecord) -> Result<()> {
        let id = record.id;
        self.shared.with_local(|local| {
            local.save_ghost(id)?;
            local.delete_record(id)
        })?;
        self.request_sync();
        Ok(())
    }

    pub fn save_aggregate(&self, record: &AggregateRecord) -> Result<EditTime> {
        let edit_time = self
            .shared
            .with_local(|local| local.save_aggregate(record, None))?;
        self.request_sync();
        Ok(edit_time)
    }

    /// Reset the aggregate to its zeroed form, then request a pass.
    pub fn delete_aggregate(&self) -> Result<()> {
        self.shared.with_local(|local| local.delete_aggregate())?;
        self.request_sync();
        Ok(())
    }

    // ========================================================================
    // Reads (local data immediately, sync in the background)
    // ========================================================================

    pub fn load_runs(&self) -> Result<Vec<RunRecord>> {
        let runs = self
            .shared
            .with_local(|local| local.load_runs_newest_first())?;
        self.request_sync();
        Ok(runs)
    }

    /// The user's aggregate, or the zeroed record if none has been stored.
    pub fn load_aggregate(&self) -> Result<AggregateRecord> {
        let aggregate = self.shared.with_local(|local| local.get_aggregate())?;
        self.request_sync();
        Ok(aggregate.unwrap_or_default())
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Ask for a pass. Folded into a queued pass, or into a rerun if one is
    /// running.
    pub fn request_sync(&self) {
        self.shared.request_sync();
    }

    pub fn phase(&self) -> SyncPhase {
        lock(&self.shared.schedule).phase
    }

    pub fn stats(&self) -> SyncStats {
        lock(&self.shared.schedule).stats.clone()
    }

    /// Block until the controller is idle or `timeout` elapses. Returns
    /// whether it reached idle.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let schedule = lock(&self.shared.schedule);
        let (schedule, _) = self
            .shared
            .changed
            .wait_timeout_while(schedule, timeout, |s| s.phase != SyncPhase::Idle)
            .unwrap_or_else(|e| e.into_inner());
        schedule.phase == SyncPhase::Idle
    }

    /// Block until at least `passes` passes (successful or failed) have
    /// finished, or `timeout` elapses.
    pub fn wait_for_passes(&self, passes: u64, timeout: Duration) -> bool {
        let schedule = lock(&self.shared.schedule);
        let (schedule, _) = self
            .shared
            .changed
            .wait_timeout_while(schedule, timeout, |s| {
                s.stats.passes_succeeded + s.stats.passes_failed < passes
            })
            .unwrap_or_else(|e| e.into_inner());
        schedule.stats.passes_succeeded + schedule.stats.passes_failed >= passes
    }
}

impl<L, R> Drop for SyncController<L, R>
where
    L: StorageComponent + 'static,
    R: StorageComponent + RemoteSession + 'static,
{
    fn drop(&mut self) {
        {
            let mut schedule = lock(&self.shared.schedule);
            schedule.shutdown = true;
        }
        self.shared.changed.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("[SyncController] Worker panicked during shutdown");
            }
        }
        info!("[SyncController] Stopped");
    }
}

impl<L, R> Shared<L, R>
where
    L: StorageComponent,
    R: StorageComponent + RemoteSession,
{
    /// Run `f` against the local store bound to the current user. Without a
    /// signed-in user nothing is read or written.
    fn with_local<T>(&self, f: impl FnOnce(&mut L) -> Result<T>) -> Result<T> {
        let token = self.tokens.current_token()?;
        let mut local = lock(&self.local);
        local.bind_user(&token);
        f(&mut *local)
    }

    fn request_sync(&self) {
        let mut schedule = lock(&self.schedule);
        match schedule.phase {
            SyncPhase::Idle => {
                schedule.phase = SyncPhase::SyncScheduled;
                schedule.due = Some(Instant::now());
                debug!("[SyncController] Pass scheduled");
                drop(schedule);
                self.changed.notify_all();
            }
            SyncPhase::SyncScheduled => {
                schedule.stats.requests_coalesced += 1;
                debug!("[SyncController] Request coalesced into queued pass");
            }
            SyncPhase::Syncing => {
                schedule.stats.requests_coalesced += 1;
                schedule.rerun = true;
                debug!("[SyncController] Request during pass, rerun pending");
            }
        }
    }

    fn run_worker(&self) {
        loop {
            {
                let mut schedule = lock(&self.schedule);
                loop {
                    if schedule.shutdown {
                        return;
                    }
                    match (schedule.phase, schedule.due) {
                        (SyncPhase::SyncScheduled, Some(due)) => {
                            let now = Instant::now();
                            if due <= now {
                                break;
                            }
                            schedule = self
                                .changed
                                .wait_timeout(schedule, due - now)
                                .unwrap_or_else(|e| e.into_inner())
                                .0;
                        }
                        _ => {
                            schedule = self
                                .changed
                                .wait(schedule)
                                .unwrap_or_else(|e| e.into_inner());
                        }
                    }
                }
                schedule.phase = SyncPhase::Syncing;
                schedule.due = None;
            }
            self.changed.notify_all();

            let result = self.run_pass();

            let mut schedule = lock(&self.schedule);
            match result {
                Ok(report) => {
                    if schedule.rerun {
                        debug!("[SyncController] Rerunning for requests made during the pass");
                        schedule.phase = SyncPhase::SyncScheduled;
                        schedule.due = Some(Instant::now());
                    } else {
                        schedule.phase = SyncPhase::Idle;
                    }
                    schedule.stats.passes_succeeded += 1;
                    schedule.stats.last_report = Some(report);
                    schedule.stats.last_error = None;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(
                            "[SyncController] Pass failed: {} (retrying in {:?})",
                            e, self.retry_interval
                        );
                    } else {
                        error!(
                            "[SyncController] Pass failed, not expected to clear on its own: {} (retrying in {:?})",
                            e, self.retry_interval
                        );
                    }
                    schedule.phase = SyncPhase::SyncScheduled;
                    schedule.due = Some(Instant::now() + self.retry_interval);
                    schedule.stats.passes_failed += 1;
                    schedule.stats.last_error = Some(e);
                }
            }
            schedule.rerun = false;
            drop(schedule);
            self.changed.notify_all();
        }
    }

    /// One pass: refresh the token, open a session, reconcile, close the
    /// session.
    fn run_pass(&self) -> Result<SyncReport> {
        let start = Instant::now();
        let token = self.tokens.current_token()?;

        let mut remote = lock(&self.remote);
        remote.bind_user(&token);
        lock(&self.local).bind_user(&token);

        remote.connect()?;
        let result = {
            let mut local = lock(&self.local);
            synchronize(&mut *local, &mut *remote)
        };
        if let Err(e) = remote.disconnect() {
            warn!("[SyncController] Disconnect failed: {}", e);
        }

        info!(
            "[SyncController] Pass {} ({} ms)",
            if result.is_ok() { "succeeded" } else { "failed" },
            elapsed_ms(start)
        );
        result
    }
}
