//! hitcache Interface Definition
//!
//! Types shared between the cache and the search layer that submits work to it.
//! The search-task graph itself lives outside this crate; the cache only sees
//! tasks through the [`SearchTask`] capability defined here.

use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;

use crate::entry::TaskContext;

// ═══════════════════════════════════════════════════════════════════════════════
// TASK CAPABILITY
// ═══════════════════════════════════════════════════════════════════════════════

/// A result object produced by a search task.
pub trait SearchResult: Send + Sync + 'static {
    /// Number of result objects (hits) held by this result.
    fn stored_hits(&self) -> u64;
}

/// An immutable description of search work.
///
/// Two tasks are the same cache key iff they are structurally equal: same
/// operation graph, same parameters. `execute` may block for a long time and
/// must poll `ctx` at natural iteration points so that cancellation is honored.
pub trait SearchTask: Eq + Hash + Debug + Send + Sync + 'static {
    type Output: SearchResult;

    /// Run the search. Report partial progress through [`TaskContext::set_stored_hits`].
    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<Self::Output>;

    /// Name of the corpus/index this task reads from.
    fn index_name(&self) -> &str;

    /// Count-only tasks store no hits; they are aborted when nobody polls them.
    fn is_count(&self) -> bool {
        false
    }

    /// Caller-level opt-out: when false, the task runs but is never cached.
    fn use_cache(&self) -> bool {
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENUMS
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl EntryStatus {
    /// Done, Failed and Cancelled are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryStatus::Done | EntryStatus::Failed | EntryStatus::Cancelled)
    }
}

/// Why the load manager aborted a running search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AbortReason {
    /// Ran longer than the configured maximum search time
    TookTooLong,
    /// Count task that no client polled within the abandonment timeout
    AbandonedCount,
    /// More searches running than the concurrency cap allows
    NoCoresLeft,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            AbortReason::TookTooLong => "search took too long",
            AbortReason::AbandonedCount => "abandoned count",
            AbortReason::NoCoresLeft => "no cores left",
        };
        f.write_str(reason)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for cache operations.
///
/// Cloneable so one settled outcome can be handed to every waiter of an entry.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Insufficient memory to start a new search ({free_megs}M free < {required_megs}M required). Please try again later.")]
    InsufficientMemory { free_megs: u64, required_megs: u64 },
    #[error("Search cancelled")]
    Cancelled,
    #[error("Search failed: {0}")]
    SearchFailed(Arc<anyhow::Error>),
    #[error("Cache has been shut down")]
    ShutDown,
}

impl CacheError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

/// Returned by [`TaskContext::checkpoint`] once the search has been cancelled.
/// Tasks propagate it with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("search interrupted")]
pub struct Interrupted;

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!EntryStatus::Pending.is_terminal());
        assert!(!EntryStatus::Running.is_terminal());
        assert!(EntryStatus::Done.is_terminal());
        assert!(EntryStatus::Failed.is_terminal());
        assert!(EntryStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_insufficient_memory_message_names_both_limits() {
        let err = CacheError::InsufficientMemory { free_megs: 12, required_megs: 50 };
        let msg = err.to_string();
        assert!(msg.contains("12M"));
        assert!(msg.contains("50M"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&EntryStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
