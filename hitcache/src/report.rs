//! Observability: read-only views of cache state.
//!
//! `CacheStatus` and `EntrySnapshot` are what an admin/status endpoint serializes.
//! `CacheReport` is pushed periodically by the load manager to a `CacheReporter`.

use crate::config::{CacheConfig, SIZE_OF_HIT};
use crate::entry::CacheEntry;
use crate::interface::{EntryStatus, SearchTask};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

/// Aggregate cache status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// `None` when unlimited
    pub max_size_bytes: Option<u64>,
    pub max_number_of_searches: Option<u64>,
    pub max_search_age_sec: Option<u64>,
    pub size_bytes: u64,
    pub number_of_searches: usize,
    pub free_memory: u64,
}

impl CacheStatus {
    pub(crate) fn new(config: &CacheConfig, size_bytes: u64, number_of_searches: usize, free_memory: u64) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes(),
            max_number_of_searches: config.max_number_of_searches,
            max_search_age_sec: config.max_search_age_sec,
            size_bytes,
            number_of_searches,
            free_memory,
        }
    }
}

/// One entry in a contents dump
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySnapshot {
    pub id: u64,
    pub search: String,
    pub index: String,
    pub status: EntryStatus,
    pub stored_hits: u64,
    pub size_bytes: u64,
    pub worthiness: i64,
    pub age_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<EntryDebugInfo>,
}

/// Extra per-entry timings, only in verbose dumps
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDebugInfo {
    pub waited_ms: u64,
    pub unused_ms: u64,
    pub since_last_access_ms: u64,
    pub search_done: bool,
    pub is_count: bool,
}

impl EntrySnapshot {
    /// Describe an entry. Reads the last computed worthiness; never recomputes it.
    pub fn capture<T: SearchTask>(entry: &CacheEntry<T>, debug: bool) -> Self {
        let stats = entry.stats();
        Self {
            id: entry.id(),
            search: format!("{:?}", entry.task()),
            index: entry.task().index_name().to_string(),
            status: stats.status,
            stored_hits: stats.stored_hits,
            size_bytes: stats.size_bytes(),
            worthiness: entry.worthiness(),
            age_ms: millis(stats.since_creation),
            debug: debug.then(|| EntryDebugInfo {
                waited_ms: millis(stats.waited),
                unused_ms: millis(stats.unused),
                since_last_access_ms: millis(stats.since_last_access),
                search_done: stats.search_done,
                is_count: stats.is_count,
            }),
        }
    }
}

/// Periodic aggregate pushed to the reporter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheReport {
    pub timestamp: DateTime<Utc>,
    pub number_of_searches: usize,
    pub number_running: usize,
    pub size_bytes: u64,
    pub free_memory: u64,
    pub largest_entry_bytes: u64,
    pub oldest_entry_age_sec: u64,
}

impl CacheReport {
    pub(crate) fn from_snapshots(snapshots: &[EntrySnapshot], size_bytes: u64, free_memory: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            number_of_searches: snapshots.len(),
            number_running: snapshots
                .iter()
                .filter(|s| !s.status.is_terminal())
                .count(),
            size_bytes,
            free_memory,
            largest_entry_bytes: snapshots
                .iter()
                .map(|s| s.stored_hits * SIZE_OF_HIT)
                .max()
                .unwrap_or(0),
            oldest_entry_age_sec: snapshots.iter().map(|s| s.age_ms / 1000).max().unwrap_or(0),
        }
    }
}

/// Sink for periodic cache state, e.g. a log database or metrics exporter.
///
/// Called from a sweep while the cache is locked; implementations must not
/// call back into the cache.
pub trait CacheReporter: Send + Sync {
    /// `snapshot` carries the full entry listing, but only every few reports.
    fn cache_info(&self, report: &CacheReport, snapshot: Option<&[EntrySnapshot]>);
}

/// Writes reports to the tracing log.
#[derive(Debug, Default)]
pub struct LogReporter;

impl CacheReporter for LogReporter {
    fn cache_info(&self, report: &CacheReport, snapshot: Option<&[EntrySnapshot]>) {
        info!(
            searches = report.number_of_searches,
            running = report.number_running,
            size_bytes = report.size_bytes,
            free_memory = report.free_memory,
            largest_entry_bytes = report.largest_entry_bytes,
            oldest_entry_age_sec = report.oldest_entry_age_sec,
            "cache state"
        );
        if let Some(entries) = snapshot {
            for entry in entries {
                debug!(
                    id = entry.id,
                    search = %entry.search,
                    status = ?entry.status,
                    stored_hits = entry.stored_hits,
                    worthiness = entry.worthiness,
                    age_ms = entry.age_ms,
                    "cache entry"
                );
            }
        }
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u64, status: EntryStatus, hits: u64, age_ms: u64) -> EntrySnapshot {
        EntrySnapshot {
            id,
            search: format!("Search({id})"),
            index: "opensonar".into(),
            status,
            stored_hits: hits,
            size_bytes: hits * SIZE_OF_HIT,
            worthiness: 0,
            age_ms,
            debug: None,
        }
    }

    #[test]
    fn test_report_aggregates() {
        let entries = vec![
            snapshot(1, EntryStatus::Done, 100, 5_000),
            snapshot(2, EntryStatus::Running, 1_000, 61_000),
            snapshot(3, EntryStatus::Pending, 0, 10),
        ];
        let report = CacheReport::from_snapshots(&entries, 26_400, 123);
        assert_eq!(report.number_of_searches, 3);
        assert_eq!(report.number_running, 2);
        assert_eq!(report.largest_entry_bytes, 1_000 * SIZE_OF_HIT);
        assert_eq!(report.oldest_entry_age_sec, 61);
        assert_eq!(report.free_memory, 123);
    }

    #[test]
    fn test_empty_report() {
        let report = CacheReport::from_snapshots(&[], 0, 0);
        assert_eq!(report.number_of_searches, 0);
        assert_eq!(report.largest_entry_bytes, 0);
        assert_eq!(report.oldest_entry_age_sec, 0);
    }

    #[test]
    fn test_status_json_shape() {
        let config = CacheConfig { max_size_megs: None, ..CacheConfig::default() };
        let status = CacheStatus::new(&config, 48, 2, 1_000);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["maxSizeBytes"], serde_json::Value::Null);
        assert_eq!(json["maxNumberOfSearches"], 100);
        assert_eq!(json["sizeBytes"], 48);
        assert_eq!(json["numberOfSearches"], 2);
    }

    #[test]
    fn test_snapshot_omits_debug_when_absent() {
        let json = serde_json::to_value(snapshot(7, EntryStatus::Done, 1, 1)).unwrap();
        assert!(json.get("debug").is_none());
        assert_eq!(json["status"], "done");
        assert_eq!(json["index"], "opensonar");
    }
}
