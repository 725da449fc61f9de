//! CacheEntry - one search task's execution lifetime
//!
//! Cancellation Architecture:
//! Every entry owns a CancellationToken. The task sees it through its TaskContext
//! and checks it at natural iteration points. `cancel_search` only trips the token;
//! the entry becomes Cancelled once the task returns.
//!
//! Completion is a single-assignment slot. Settling it wakes blocking waiters
//! (Condvar) and async waiters (Notify), so N callers share one computation.

use crate::config::SIZE_OF_HIT;
use crate::interface::{CacheError, CacheResult, EntryStatus, Interrupted, SearchResult, SearchTask};
use crate::runtime;
use crate::worthiness::WorthinessPolicy;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Execution context handed to [`SearchTask::execute`].
pub struct TaskContext {
    token: CancellationToken,
    stored_hits: Arc<AtomicU64>,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `Err(Interrupted)` once the search has been cancelled.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted);
        }
        Ok(())
    }

    /// Report how many hits the task currently stores. Never decreases.
    pub fn set_stored_hits(&self, hits: u64) {
        self.stored_hits.fetch_max(hits, Ordering::AcqRel);
    }

    pub fn add_stored_hits(&self, hits: u64) {
        self.stored_hits.fetch_add(hits, Ordering::AcqRel);
    }

    /// For tasks that await inside their own runtime
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Point-in-time metrics of one entry, read under the entry lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryStats {
    pub status: EntryStatus,
    /// The task's `execute` has returned (or never will run)
    pub search_done: bool,
    pub stored_hits: u64,
    pub since_creation: Duration,
    pub since_last_access: Duration,
    /// Wall time spent running (up to now, or up to completion)
    pub waited: Duration,
    /// Time since last access, counted only once finished
    pub unused: Duration,
    pub is_count: bool,
}

impl EntryStats {
    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn size_bytes(&self) -> u64 {
        self.stored_hits * SIZE_OF_HIT
    }
}

enum Slot<O> {
    Pending,
    Running,
    Done(Arc<O>),
    Failed(CacheError),
    Cancelled,
}

impl<O> Slot<O> {
    fn status(&self) -> EntryStatus {
        match self {
            Slot::Pending => EntryStatus::Pending,
            Slot::Running => EntryStatus::Running,
            Slot::Done(_) => EntryStatus::Done,
            Slot::Failed(_) => EntryStatus::Failed,
            Slot::Cancelled => EntryStatus::Cancelled,
        }
    }

    fn outcome(&self) -> Option<CacheResult<Arc<O>>> {
        match self {
            Slot::Pending | Slot::Running => None,
            Slot::Done(result) => Some(Ok(Arc::clone(result))),
            Slot::Failed(err) => Some(Err(err.clone())),
            Slot::Cancelled => Some(Err(CacheError::Cancelled)),
        }
    }
}

struct EntryState<O> {
    slot: Slot<O>,
    last_access: Instant,
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// A cached search: the task, its state and its metrics.
pub struct CacheEntry<T: SearchTask> {
    id: u64,
    task: Arc<T>,
    created: Instant,
    token: CancellationToken,
    stored_hits: Arc<AtomicU64>,
    search_done: AtomicBool,
    worthiness: AtomicI64,
    state: Mutex<EntryState<T::Output>>,
    settled: Condvar,
    settled_async: Notify,
}

impl<T: SearchTask> CacheEntry<T> {
    pub fn new(task: Arc<T>) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            task,
            created: now,
            token: CancellationToken::new(),
            stored_hits: Arc::new(AtomicU64::new(0)),
            search_done: AtomicBool::new(false),
            worthiness: AtomicI64::new(0),
            state: Mutex::new(EntryState {
                slot: Slot::Pending,
                last_access: now,
                started: None,
                finished: None,
            }),
            settled: Condvar::new(),
            settled_async: Notify::new(),
        }
    }

    /// Process-unique id, used in logs and dumps
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    pub fn status(&self) -> EntryStatus {
        self.state.lock().slot.status()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────────

    /// Start executing the task. Only the first call on a Pending entry does anything.
    ///
    /// Blocking starts run the task on the calling thread and return once it settled.
    /// Non-blocking starts hand it to the tokio blocking pool.
    pub fn start(self: &Arc<Self>, blocking: bool) {
        {
            let mut state = self.state.lock();
            if !matches!(state.slot, Slot::Pending) {
                return;
            }
            state.slot = Slot::Running;
            state.started = Some(Instant::now());
        }

        if blocking {
            self.run();
        } else {
            let entry = Arc::clone(self);
            runtime::handle().spawn_blocking(move || entry.run());
        }
    }

    fn run(&self) {
        let ctx = TaskContext {
            token: self.token.clone(),
            stored_hits: Arc::clone(&self.stored_hits),
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.task.execute(&ctx)));
        self.search_done.store(true, Ordering::Release);

        let slot = match result {
            Ok(Ok(output)) => {
                self.stored_hits.fetch_max(output.stored_hits(), Ordering::AcqRel);
                Slot::Done(Arc::new(output))
            }
            Ok(Err(_)) if self.token.is_cancelled() => Slot::Cancelled,
            Ok(Err(err)) => Slot::Failed(CacheError::SearchFailed(Arc::new(err))),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(entry = self.id, task = ?self.task, %message, "search panicked");
                Slot::Failed(CacheError::SearchFailed(Arc::new(anyhow::anyhow!("search panicked: {message}"))))
            }
        };
        self.settle(slot);
    }

    fn settle(&self, slot: Slot<T::Output>) {
        {
            let mut state = self.state.lock();
            state.slot = slot;
            state.finished = Some(Instant::now());
        }
        self.settled.notify_all();
        self.settled_async.notify_waiters();
    }

    /// Request cooperative cancellation.
    ///
    /// A Pending entry is cancelled on the spot; a Running one once its task
    /// notices. Finished entries are left alone.
    pub fn cancel_search(&self) {
        let mut state = self.state.lock();
        match state.slot {
            Slot::Pending => {
                self.token.cancel();
                self.search_done.store(true, Ordering::Release);
                state.slot = Slot::Cancelled;
                state.finished = Some(Instant::now());
                drop(state);
                self.settled.notify_all();
                self.settled_async.notify_waiters();
            }
            Slot::Running => self.token.cancel(),
            Slot::Done(_) | Slot::Failed(_) | Slot::Cancelled => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Results
    // ─────────────────────────────────────────────────────────────────────────────

    /// The settled outcome, if any, without waiting
    pub fn outcome(&self) -> Option<CacheResult<Arc<T::Output>>> {
        self.state.lock().slot.outcome()
    }

    /// Block until the entry settles and return its outcome.
    pub fn get(&self) -> CacheResult<Arc<T::Output>> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.slot.outcome() {
                return outcome;
            }
            self.settled.wait(&mut state);
        }
    }

    /// Like [`get`](Self::get), giving up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<CacheResult<Arc<T::Output>>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.get());
        };
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.slot.outcome() {
                return Some(outcome);
            }
            if self.settled.wait_until(&mut state, deadline).timed_out() {
                return state.slot.outcome();
            }
        }
    }

    /// Wait for the entry to settle without blocking a runtime thread.
    pub async fn wait(&self) -> CacheResult<Arc<T::Output>> {
        loop {
            let notified = self.settled_async.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Done, Failed or Cancelled
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Cancellation was requested, whether or not the task has noticed yet
    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The task itself has stopped producing data
    pub fn is_search_done(&self) -> bool {
        self.search_done.load(Ordering::Acquire)
    }

    pub fn number_of_stored_hits(&self) -> u64 {
        self.stored_hits.load(Ordering::Acquire)
    }

    /// Refresh the access timestamp. Called on every cache hit.
    pub fn update_last_access(&self) {
        self.state.lock().last_access = Instant::now();
    }

    pub fn time_user_waited(&self) -> Duration {
        self.stats().waited
    }

    pub fn time_unused(&self) -> Duration {
        self.stats().unused
    }

    pub fn time_since_creation(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn time_since_last_access(&self) -> Duration {
        self.state.lock().last_access.elapsed()
    }

    /// Consistent snapshot of all metrics.
    pub fn stats(&self) -> EntryStats {
        let state = self.state.lock();
        let now = Instant::now();
        let waited = match (state.started, state.finished) {
            (Some(started), Some(finished)) => finished.saturating_duration_since(started),
            (Some(started), None) => now.saturating_duration_since(started),
            (None, _) => Duration::ZERO,
        };
        let unused = match state.finished {
            Some(finished) => now.saturating_duration_since(finished.max(state.last_access)),
            None => Duration::ZERO,
        };
        EntryStats {
            status: state.slot.status(),
            search_done: self.search_done.load(Ordering::Acquire),
            stored_hits: self.stored_hits.load(Ordering::Acquire),
            since_creation: now.saturating_duration_since(self.created),
            since_last_access: now.saturating_duration_since(state.last_access),
            waited,
            unused,
            is_count: self.task.is_count(),
        }
    }

    /// Recompute and remember the worthiness score.
    pub fn calculate_worthiness(&self, policy: &dyn WorthinessPolicy) -> i64 {
        let worthiness = policy.worthiness(&self.stats());
        self.remember_worthiness(worthiness);
        worthiness
    }

    pub(crate) fn remember_worthiness(&self, worthiness: i64) {
        self.worthiness.store(worthiness, Ordering::Release);
    }

    /// Score from the last `calculate_worthiness` call
    pub fn worthiness(&self) -> i64 {
        self.worthiness.load(Ordering::Acquire)
    }
}

impl<T: SearchTask> fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("status", &self.status())
            .field("stored_hits", &self.number_of_stored_hits())
            .finish()
    }
}

impl<T: SearchTask> fmt::Display for CacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?} [{:?}]", self.id, self.task, self.status())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
