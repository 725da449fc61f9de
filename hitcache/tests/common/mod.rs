//! Shared fixtures: a fake corpus search and cache constructors.

#![allow(dead_code)]

use hitcache::{CacheConfig, FixedMemory, MemoryProbe, SearchCache, SearchResult, SearchTask, TaskContext};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const GIGABYTE: u64 = 1_000_000_000;

#[derive(Debug)]
pub struct Hits(pub u64);

impl SearchResult for Hits {
    fn stored_hits(&self) -> u64 {
        self.0
    }
}

/// A search that takes `steps` milliseconds and then "finds" `hits` hits.
///
/// Identity is (index, pattern, count_only); everything else only shapes how
/// the search behaves, and `runs` counts executions across clones.
#[derive(Debug, Clone)]
pub struct FakeSearch {
    pub index: &'static str,
    pub pattern: &'static str,
    pub hits: u64,
    pub steps: u32,
    pub count_only: bool,
    pub fails: bool,
    pub cacheable: bool,
    runs: Arc<AtomicUsize>,
}

impl FakeSearch {
    pub fn new(index: &'static str, pattern: &'static str) -> Self {
        Self {
            index,
            pattern,
            hits: 10,
            steps: 1,
            count_only: false,
            fails: false,
            cacheable: true,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn hits(mut self, hits: u64) -> Self {
        self.hits = hits;
        self
    }

    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// Runs until cancelled (well, for a very long time)
    pub fn endless(self) -> Self {
        self.steps(u32::MAX)
    }

    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fails = true;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl PartialEq for FakeSearch {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.pattern == other.pattern && self.count_only == other.count_only
    }
}

impl Eq for FakeSearch {}

impl Hash for FakeSearch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.pattern.hash(state);
        self.count_only.hash(state);
    }
}

impl SearchTask for FakeSearch {
    type Output = Hits;

    fn execute(&self, ctx: &TaskContext) -> anyhow::Result<Hits> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for _ in 0..self.steps {
            ctx.checkpoint()?;
            if !self.count_only {
                ctx.add_stored_hits(1);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if self.fails {
            anyhow::bail!("unknown annotation in pattern {}", self.pattern);
        }
        Ok(Hits(if self.count_only { 0 } else { self.hits }))
    }

    fn index_name(&self) -> &str {
        self.index
    }

    fn is_count(&self) -> bool {
        self.count_only
    }

    fn use_cache(&self) -> bool {
        self.cacheable
    }
}

/// Replays scripted readings, one per call; the last one sticks.
pub struct ScriptedMemory {
    readings: Mutex<VecDeque<u64>>,
}

impl ScriptedMemory {
    pub fn new(bytes: u64) -> Self {
        Self { readings: Mutex::new(VecDeque::from([bytes])) }
    }

    pub fn script(&self, readings: impl IntoIterator<Item = u64>) {
        let mut queue = self.readings.lock();
        queue.clear();
        queue.extend(readings);
    }
}

impl MemoryProbe for ScriptedMemory {
    fn free_bytes(&self) -> u64 {
        let mut queue = self.readings.lock();
        if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().copied().unwrap_or_default()
        }
    }
}

/// Cache without background sweeps, with a settable memory reading.
pub fn manual_cache(config: CacheConfig) -> (SearchCache<FakeSearch>, Arc<FixedMemory>) {
    let memory = Arc::new(FixedMemory::new(64 * GIGABYTE));
    let cache = SearchCache::builder(config)
        .memory_probe(memory.clone())
        .without_load_manager()
        .build()
        .unwrap();
    (cache, memory)
}

pub fn default_cache() -> SearchCache<FakeSearch> {
    manual_cache(CacheConfig::default()).0
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
