use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hitcache::config::CacheConfig;
use hitcache::load_manager::Candidate;
use hitcache::{
    plan_sweep, EntryStats, EntryStatus, FixedMemory, SearchCache, SearchResult, SearchTask, TaskContext,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Lookup(u32);

struct Hits(u64);

impl SearchResult for Hits {
    fn stored_hits(&self) -> u64 {
        self.0
    }
}

impl SearchTask for Lookup {
    type Output = Hits;

    fn execute(&self, _ctx: &TaskContext) -> anyhow::Result<Hits> {
        Ok(Hits(u64::from(self.0)))
    }

    fn index_name(&self) -> &str {
        "bench"
    }
}

fn filled_cache(entries: u32) -> SearchCache<Lookup> {
    let config = CacheConfig { max_number_of_searches: None, ..CacheConfig::default() };
    let cache = SearchCache::builder(config)
        .memory_probe(Arc::new(FixedMemory::new(u64::MAX)))
        .without_load_manager()
        .build()
        .unwrap();
    for i in 0..entries {
        cache.get(Lookup(i)).unwrap();
    }
    cache
}

fn bench_hit(c: &mut Criterion) {
    let cache = filled_cache(1_000);
    c.bench_function("cache_hit", |b| b.iter(|| cache.get(Lookup(500)).unwrap()));
}

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");
    group.sample_size(20);

    for size in [100u32, 1_000, 10_000] {
        let cache = filled_cache(size);
        group.bench_with_input(BenchmarkId::new("cache", size), &size, |b, _| b.iter(|| cache.sweep()));

        let candidates: Vec<Candidate> = (0..size)
            .map(|i| Candidate {
                worthiness: i64::from(i % 97),
                stats: EntryStats {
                    status: if i % 10 == 0 { EntryStatus::Running } else { EntryStatus::Done },
                    search_done: i % 10 != 0,
                    stored_hits: u64::from(i) * 100,
                    since_creation: Duration::from_secs(u64::from(i)),
                    since_last_access: Duration::from_millis(u64::from(i)),
                    waited: Duration::from_millis(50),
                    unused: Duration::from_millis(u64::from(i)),
                    is_count: i % 7 == 0,
                },
            })
            .collect();
        let limits = CacheConfig::default().limits();
        group.bench_with_input(BenchmarkId::new("plan", size), &size, |b, _| {
            b.iter(|| plan_sweep(&candidates, &limits, 1_000_000_000))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_hit, bench_sweep);
criterion_main!(benches);
