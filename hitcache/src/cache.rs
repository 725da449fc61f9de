//! SearchCache - deduplicating search result cache with load management
//!
//! Concurrency Model:
//! - One mutex guards the task → entry map. Lookup, admission and registration
//!   happen under it as a unit, so equal tasks always end up sharing one entry.
//! - New entries are started after the lock is released; a blocking start never
//!   holds up other submissions.
//! - The load manager sweeps from a background task. A sweep holds the map lock
//!   while it snapshots entries and applies its plan, never while tasks run.

use crate::config::{CacheConfig, SweepLimits, ONE_MB_BYTES, SIZE_OF_HIT};
use crate::entry::CacheEntry;
use crate::interface::{AbortReason, CacheError, CacheResult, ConfigError, EntryStatus, SearchTask};
use crate::load_manager::{plan_sweep, Candidate, LoadManager, Sweep, SweepAction, SweepSummary};
use crate::memory::{MemoryProbe, SystemMemory};
use crate::report::{CacheReport, CacheReporter, CacheStatus, EntrySnapshot, LogReporter};
use crate::worthiness::{DefaultWorthiness, WorthinessPolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Report aggregate cache state at most this often
const LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Include a full entry listing at most this often
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

type EntryMap<T> = HashMap<Arc<T>, Arc<CacheEntry<T>>>;

/// Thread-safe search cache.
///
/// Construct it at server start; call [`shutdown`](Self::shutdown) (or drop it)
/// at the end to stop the load manager and cancel running searches.
pub struct SearchCache<T: SearchTask> {
    shared: Arc<CacheShared<T>>,
    load_manager: Mutex<Option<LoadManager>>,
}

pub(crate) struct CacheShared<T: SearchTask> {
    entries: Mutex<EntryMap<T>>,
    config: CacheConfig,
    limits: SweepLimits,
    cache_disabled: bool,
    memory: Arc<dyn MemoryProbe>,
    worthiness: Arc<dyn WorthinessPolicy>,
    reporter: Arc<dyn CacheReporter>,
    reporting: Mutex<ReportTimer>,
    shut_down: AtomicBool,
}

#[derive(Default)]
struct ReportTimer {
    last_log: Option<Instant>,
    last_snapshot: Option<Instant>,
}

pub struct SearchCacheBuilder<T: SearchTask> {
    config: CacheConfig,
    memory: Option<Arc<dyn MemoryProbe>>,
    worthiness: Arc<dyn WorthinessPolicy>,
    reporter: Arc<dyn CacheReporter>,
    load_manager: bool,
    _task: PhantomData<fn() -> T>,
}

impl<T: SearchTask> SearchCacheBuilder<T> {
    /// Where free memory readings come from (default: the OS)
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = Some(probe);
        self
    }

    pub fn worthiness(mut self, policy: impl WorthinessPolicy + 'static) -> Self {
        self.worthiness = Arc::new(policy);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn CacheReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Don't start the background sweep; call [`SearchCache::sweep`] yourself.
    pub fn without_load_manager(mut self) -> Self {
        self.load_manager = false;
        self
    }

    pub fn build(self) -> Result<SearchCache<T>, ConfigError> {
        self.config.validate()?;

        let cache_disabled = self.config.is_cache_disabled();
        if cache_disabled {
            info!("search cache disabled by configuration, searches will run uncached");
        }

        let shared = Arc::new(CacheShared {
            entries: Mutex::new(HashMap::new()),
            limits: self.config.limits(),
            cache_disabled,
            memory: self.memory.unwrap_or_else(|| Arc::new(SystemMemory::new())),
            worthiness: self.worthiness,
            reporter: self.reporter,
            reporting: Mutex::new(ReportTimer::default()),
            shut_down: AtomicBool::new(false),
            config: self.config,
        });

        let load_manager = self
            .load_manager
            .then(|| LoadManager::spawn(Arc::downgrade(&shared), shared.config.sweep_interval()));

        Ok(SearchCache {
            shared,
            load_manager: Mutex::new(load_manager),
        })
    }
}

impl<T: SearchTask> SearchCache<T> {
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> SearchCacheBuilder<T> {
        SearchCacheBuilder {
            config,
            memory: None,
            worthiness: Arc::new(DefaultWorthiness),
            reporter: Arc::new(LogReporter),
            load_manager: true,
            _task: PhantomData,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────────────

    /// Return the cached entry for `task`, or admit and start a new one in the background.
    pub fn get_async(&self, task: T) -> CacheResult<Arc<CacheEntry<T>>> {
        let (entry, created) = self.shared.lookup_or_admit(task)?;
        if created {
            entry.start(false);
        }
        Ok(entry)
    }

    /// Like [`get_async`](Self::get_async), then block for the result.
    /// A newly admitted search runs on the calling thread.
    pub fn get(&self, task: T) -> CacheResult<Arc<T::Output>> {
        let (entry, created) = self.shared.lookup_or_admit(task)?;
        if created {
            entry.start(true);
        }
        entry.get()
    }

    /// Async counterpart of [`get`](Self::get).
    pub async fn search(&self, task: T) -> CacheResult<Arc<T::Output>> {
        let entry = self.get_async(task)?;
        entry.wait().await
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────────

    /// Unregister the entry for `task` without cancelling it.
    pub fn remove(&self, task: &T) -> Option<Arc<CacheEntry<T>>> {
        let removed = self.shared.entries.lock().remove(task);
        if let Some(entry) = &removed {
            trace!(entry = entry.id(), search = ?task, "removed from cache");
        }
        removed
    }

    /// Remove every search on `index_name`, cancelling the unfinished ones.
    /// Returns how many entries were removed.
    pub fn remove_searches_for_index(&self, index_name: &str) -> usize {
        let mut entries = self.shared.entries.lock();
        let before = entries.len();
        entries.retain(|task, entry| {
            if task.index_name() != index_name {
                return true;
            }
            if !entry.is_search_done() {
                entry.cancel_search();
            }
            false
        });
        let removed = before - entries.len();
        debug!(index = index_name, removed, "removed searches for index");
        removed
    }

    /// Remove all entries, cancelling unfinished searches first if asked.
    pub fn clear(&self, cancel_running: bool) {
        let mut entries = self.shared.entries.lock();
        clear_locked(&mut entries, cancel_running);
    }

    /// Stop the load manager and clear the cache, cancelling running searches.
    /// Later submissions fail with [`CacheError::ShutDown`].
    pub fn shutdown(&self) {
        drop(self.load_manager.lock().take());
        let mut entries = self.shared.entries.lock();
        if !self.shared.shut_down.swap(true, Ordering::AcqRel) {
            info!("search cache shutting down");
        }
        clear_locked(&mut entries, true);
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Load management and status
    // ─────────────────────────────────────────────────────────────────────────────

    /// Run one load management sweep now.
    pub fn sweep(&self) -> SweepSummary {
        self.shared.sweep()
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, task: &T) -> bool {
        self.shared.entries.lock().contains_key(task)
    }

    /// Aggregate status, consistent at the moment of the call.
    pub fn status(&self) -> CacheStatus {
        let entries = self.shared.entries.lock();
        let size_bytes = entries.values().map(|e| e.number_of_stored_hits() * SIZE_OF_HIT).sum();
        CacheStatus::new(&self.shared.config, size_bytes, entries.len(), self.shared.memory.free_bytes())
    }

    /// Per-entry listing, ordered by entry id.
    pub fn contents(&self, debug: bool) -> Vec<EntrySnapshot> {
        let entries = self.shared.entries.lock();
        let mut snapshots: Vec<EntrySnapshot> = entries
            .values()
            .map(|entry| EntrySnapshot::capture(entry, debug))
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }
}

impl<T: SearchTask> Drop for SearchCache<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn clear_locked<T: SearchTask>(entries: &mut EntryMap<T>, cancel_running: bool) {
    if cancel_running {
        for entry in entries.values() {
            if !entry.is_search_done() {
                entry.cancel_search();
            }
        }
    }
    entries.clear();
    debug!("cache cleared");
}

impl<T: SearchTask> CacheShared<T> {
    /// Find the entry for `task` or admit a new one. The bool is true when the
    /// entry was created here and still has to be started.
    fn lookup_or_admit(&self, task: T) -> CacheResult<(Arc<CacheEntry<T>>, bool)> {
        let use_cache = task.use_cache() && !self.cache_disabled;

        let mut entries = self.entries.lock();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CacheError::ShutDown);
        }

        if use_cache {
            if let Some(existing) = entries.get(&task) {
                // A cancelled (or cancelling) search is no result; replace it below
                if existing.status() != EntryStatus::Cancelled && !existing.is_cancel_requested() {
                    existing.update_last_access();
                    trace!(entry = existing.id(), search = ?task, "found in cache");
                    return Ok((Arc::clone(existing), false));
                }
            }
        }

        self.admit(&mut entries, &task)?;

        let task = Arc::new(task);
        let entry = Arc::new(CacheEntry::new(Arc::clone(&task)));
        if use_cache {
            entries.insert(task, Arc::clone(&entry));
        }
        trace!(entry = entry.id(), search = ?entry.task(), cached = use_cache, "not found in cache, starting search");
        Ok((entry, true))
    }

    /// Refuse new work while free memory is below the configured minimum.
    fn admit(&self, entries: &mut EntryMap<T>, task: &T) -> CacheResult<()> {
        let required_megs = self.config.min_free_mem_for_search_megs;
        if self.memory.free_bytes() / ONE_MB_BYTES >= required_megs {
            return Ok(());
        }

        // Try to free up space for this search
        self.sweep_locked(entries);
        let free_megs = self.memory.free_bytes() / ONE_MB_BYTES;
        if free_megs >= required_megs {
            return Ok(());
        }

        warn!(free_megs, required_megs, search = ?task, "can't start new search, not enough memory");
        Err(CacheError::InsufficientMemory { free_megs, required_megs })
    }

    fn sweep_locked(&self, entries: &mut EntryMap<T>) -> SweepSummary {
        let snapshot: Vec<Arc<CacheEntry<T>>> = entries.values().cloned().collect();

        // Freeze worthiness once; entries keep changing while we sort
        let candidates: Vec<Candidate> = snapshot
            .iter()
            .map(|entry| {
                let stats = entry.stats();
                let worthiness = self.worthiness.worthiness(&stats);
                entry.remember_worthiness(worthiness);
                Candidate { worthiness, stats }
            })
            .collect();

        let free_bytes = self.memory.free_bytes();
        let plan = plan_sweep(&candidates, &self.limits, free_bytes);
        self.maybe_report(&snapshot, plan.size_bytes, free_bytes);

        let mut summary = SweepSummary::default();
        for &(index, action) in &plan.actions {
            let entry = &snapshot[index];
            entries.remove(entry.task());
            match action {
                SweepAction::Evict(reason) => {
                    summary.evicted += 1;
                    trace!(entry = entry.id(), search = ?entry.task(), ?reason, "removing search from cache");
                }
                SweepAction::Abort(reason) => {
                    summary.aborted += 1;
                    entry.cancel_search();
                    if reason == AbortReason::TookTooLong {
                        warn!(
                            entry = entry.id(),
                            search = ?entry.task(),
                            waited_sec = candidates[index].stats.waited.as_secs(),
                            max_sec = self.config.max_search_time_sec,
                            "search is taking too long, cancelling"
                        );
                    } else {
                        debug!(entry = entry.id(), search = ?entry.task(), %reason, "aborting search");
                    }
                }
            }
        }

        summary.remaining = entries.len();
        summary.running = entries.values().filter(|e| !e.is_done()).count();
        summary.size_bytes = entries.values().map(|e| e.number_of_stored_hits() * SIZE_OF_HIT).sum();
        summary
    }

    fn maybe_report(&self, snapshot: &[Arc<CacheEntry<T>>], size_bytes: u64, free_bytes: u64) {
        let now = Instant::now();
        let full_listing = {
            let mut timer = self.reporting.lock();
            if timer.last_log.is_some_and(|at| now.duration_since(at) < LOG_INTERVAL) {
                return;
            }
            timer.last_log = Some(now);
            let full = timer
                .last_snapshot
                .map_or(true, |at| now.duration_since(at) >= SNAPSHOT_INTERVAL);
            if full {
                timer.last_snapshot = Some(now);
            }
            full
        };

        let entries: Vec<EntrySnapshot> = snapshot
            .iter()
            .map(|entry| EntrySnapshot::capture(entry, true))
            .collect();
        let report = CacheReport::from_snapshots(&entries, size_bytes, free_bytes);
        self.reporter.cache_info(&report, full_listing.then_some(entries.as_slice()));
    }
}

impl<T: SearchTask> Sweep for CacheShared<T> {
    fn sweep(&self) -> SweepSummary {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries)
    }
}
