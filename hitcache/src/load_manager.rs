//! Load management: the background sweep that keeps the cache within bounds.
//!
//! A sweep works in two steps over entries ordered by frozen worthiness:
//!
//! 1. From least to most worthy: cancel searches running past the time limit,
//!    then evict finished searches while the cache holds too many searches, is
//!    too large, or free memory is below target; once that pressure is gone,
//!    evict finished searches unused for too long.
//! 2. From most to least worthy: let at most `max_concurrent` searches keep
//!    running and abort count tasks nobody polls anymore.
//!
//! The decisions are made by [`plan_sweep`], a pure function over snapshots, so
//! the map lock is only needed to take the snapshot and apply the plan.

use crate::config::{SweepLimits, ONE_MB_BYTES, SIZE_OF_HIT};
use crate::entry::EntryStats;
use crate::interface::AbortReason;
use crate::runtime::{self, DropGuard};
use crate::worthiness::most_worthy_first;
use serde::Serialize;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One entry as seen by the planner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub worthiness: i64,
    pub stats: EntryStats,
}

/// Why a finished search was evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EvictReason {
    LowMemory,
    TooManySearches,
    CacheTooLarge,
    TooOld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Remove a finished search from the cache
    Evict(EvictReason),
    /// Remove a running search and cancel it
    Abort(AbortReason),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepPlan {
    /// (candidate index, action), in the order decided
    pub actions: Vec<(usize, SweepAction)>,
    /// Estimated cache size before the sweep
    pub size_bytes: u64,
}

impl SweepPlan {
    pub fn action_for(&self, candidate: usize) -> Option<SweepAction> {
        self.actions
            .iter()
            .find(|(index, _)| *index == candidate)
            .map(|(_, action)| *action)
    }
}

/// Decide what one sweep removes.
pub fn plan_sweep(candidates: &[Candidate], limits: &SweepLimits, free_bytes: u64) -> SweepPlan {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| most_worthy_first(candidates[a].worthiness, candidates[b].worthiness));

    let size_bytes: u64 = candidates.iter().map(|c| c.stats.size_bytes()).sum();
    let mut cache_size_bytes = size_bytes;
    let mut number_of_searches = candidates.len() as u64;
    let target_free_bytes = limits.target_free_mem_megs.saturating_mul(ONE_MB_BYTES);
    let mut memory_to_free = i128::from(target_free_bytes) - i128::from(free_bytes);

    let mut removed = vec![false; candidates.len()];
    let mut actions = Vec::new();

    // Step 1: least worthy first
    let mut look_at_size_and_age = true;
    for &index in order.iter().rev() {
        let stats = &candidates[index].stats;
        let action = if !stats.search_done && stats.waited > limits.max_search_time {
            Some(SweepAction::Abort(AbortReason::TookTooLong))
        } else if stats.is_done() {
            let mut reason = None;
            if look_at_size_and_age {
                let too_many = limits.max_entries.is_some_and(|max| number_of_searches > max);
                let too_large = limits
                    .max_size_megs
                    .is_some_and(|max| cache_size_bytes / ONE_MB_BYTES > max);
                reason = if too_many {
                    Some(EvictReason::TooManySearches)
                } else if too_large {
                    Some(EvictReason::CacheTooLarge)
                } else if limits.max_age.is_some_and(|max| stats.unused > max) {
                    Some(EvictReason::TooOld)
                } else {
                    None
                };
            }
            if memory_to_free > 0 {
                reason = Some(EvictReason::LowMemory);
            }
            if reason.is_none() {
                // Everything more worthy stays, except to cancel runaway searches
                look_at_size_and_age = false;
            }
            reason.map(SweepAction::Evict)
        } else {
            None
        };

        if let Some(action) = action {
            let freed = stats.stored_hits * SIZE_OF_HIT;
            cache_size_bytes = cache_size_bytes.saturating_sub(freed);
            number_of_searches -= 1;
            if matches!(action, SweepAction::Evict(_)) {
                memory_to_free -= i128::from(freed);
            }
            removed[index] = true;
            actions.push((index, action));
        }
    }

    // Step 2: most worthy first
    let mut cores_left = limits.max_concurrent;
    for &index in &order {
        let stats = &candidates[index].stats;
        if removed[index] || stats.is_done() {
            continue;
        }
        if stats.is_count && stats.since_last_access > limits.abandoned_count_timeout {
            actions.push((index, SweepAction::Abort(AbortReason::AbandonedCount)));
        } else if cores_left > 0 {
            cores_left -= 1;
        } else {
            actions.push((index, SweepAction::Abort(AbortReason::NoCoresLeft)));
        }
    }

    SweepPlan { actions, size_bytes }
}

/// What a sweep did, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub evicted: usize,
    pub aborted: usize,
    pub remaining: usize,
    pub running: usize,
    pub size_bytes: u64,
}

impl SweepSummary {
    pub fn removed(&self) -> usize {
        self.evicted + self.aborted
    }
}

/// Something the load manager can sweep.
pub(crate) trait Sweep: Send + Sync + 'static {
    fn sweep(&self) -> SweepSummary;
}

/// Handle to the background sweep loop. Dropping it stops the loop.
pub(crate) struct LoadManager {
    _guard: DropGuard,
    task: JoinHandle<()>,
}

impl LoadManager {
    pub(crate) fn spawn<S: Sweep>(cache: Weak<S>, interval: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let task = runtime::handle().spawn(run(cache, interval, shutdown.clone()));
        Self {
            _guard: DropGuard::new(shutdown),
            task,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run<S: Sweep>(cache: Weak<S>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    info!(interval_ms = interval.as_millis() as u64, "load manager started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(cache) = cache.upgrade() else {
            break;
        };
        match tokio::task::spawn_blocking(move || cache.sweep()).await {
            Ok(summary) if summary.removed() > 0 => debug!(?summary, "sweep removed searches"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "load manager sweep failed"),
        }
    }

    info!("load manager stopped");
}
