//! hitcache - search result cache and load manager for a corpus search server
//!
//! Deduplicates concurrent identical searches, shares one result between all
//! callers, and keeps memory and CPU use in check with a background sweep that
//! evicts the least worthy finished searches and aborts runaway ones.
//!
//! Search tasks plug in through the [`SearchTask`] trait; the cache never looks
//! inside them beyond equality, hashing and their reported hit count.

mod cache;
pub mod config;
pub mod entry;
pub mod interface;
pub mod load_manager;
pub mod memory;
pub mod report;
mod runtime;
pub mod worthiness;

pub use cache::{SearchCache, SearchCacheBuilder};
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryStats, TaskContext};
pub use interface::*;
pub use load_manager::{plan_sweep, SweepSummary};
pub use memory::{FixedMemory, MemoryProbe, SystemMemory};
pub use report::{CacheReport, CacheReporter, CacheStatus, EntrySnapshot, LogReporter};
pub use worthiness::{DefaultWorthiness, WorthinessPolicy};
