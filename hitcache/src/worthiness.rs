//! Worthiness: how valuable an entry is to keep around.
//!
//! Higher = keep, lower = evict first. Scores are computed from an
//! [`EntryStats`] snapshot so they are deterministic for a given moment and can
//! be frozen once per sweep before sorting.

use crate::entry::EntryStats;
use std::cmp::Ordering;

/// Finished results always rank above running searches.
const FINISHED_BONUS: i64 = 1_000_000_000;

/// One point per this many stored hits (≈2.4 KB of results per millisecond of idleness)
const HITS_PER_POINT: u64 = 100;

/// Running searches lose one point per this many milliseconds of run time
const RUNNING_MS_PER_POINT: u128 = 2;

/// Scores an entry for eviction ordering.
pub trait WorthinessPolicy: Send + Sync {
    fn worthiness(&self, stats: &EntryStats) -> i64;
}

impl<F> WorthinessPolicy for F
where
    F: Fn(&EntryStats) -> i64 + Send + Sync,
{
    fn worthiness(&self, stats: &EntryStats) -> i64 {
        self(stats)
    }
}

/// Favors small, recently accessed, finished results over large, stale or
/// still-running ones.
///
/// - finished: `FINISHED_BONUS - idle_ms - hits / 100`
/// - running:  `-idle_ms - run_ms / 2 - hits / 100`
///
/// "idle" is time since the last client access, so a running search nobody
/// polls sinks below one that clients keep asking about.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWorthiness;

impl WorthinessPolicy for DefaultWorthiness {
    fn worthiness(&self, stats: &EntryStats) -> i64 {
        let size_penalty = clamp(u128::from(stats.stored_hits / HITS_PER_POINT));
        let idle_penalty = clamp(stats.since_last_access.as_millis());
        if stats.is_done() {
            FINISHED_BONUS
                .saturating_sub(idle_penalty)
                .saturating_sub(size_penalty)
        } else {
            let run_penalty = clamp(stats.waited.as_millis() / RUNNING_MS_PER_POINT);
            0i64.saturating_sub(idle_penalty)
                .saturating_sub(run_penalty)
                .saturating_sub(size_penalty)
        }
    }
}

fn clamp(value: u128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Sort order: most worthy first.
pub fn most_worthy_first(a: i64, b: i64) -> Ordering {
    b.cmp(&a)
}
