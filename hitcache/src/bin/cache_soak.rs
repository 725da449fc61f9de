//! Soak test for the search cache
//!
//! Runs many concurrent clients issuing overlapping synthetic corpus searches
//! against one cache, then prints the cache status and contents as JSON.
//!
//! Run with: cargo run --bin cache-soak -- --clients 16 --requests 500

use anyhow::{Context, Result};
use clap::Parser;
use hitcache::{CacheConfig, CacheError, SearchCache, SearchResult, SearchTask, TaskContext};
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const INDEXES: [&str; 3] = ["opensonar", "brown", "gysseling"];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON cache configuration (camelCase keys); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of concurrent clients
    #[arg(short = 'C', long, default_value_t = 8)]
    clients: usize,

    /// Requests per client
    #[arg(short, long, default_value_t = 200)]
    requests: usize,

    /// Number of distinct patterns per index
    #[arg(short, long, default_value_t = 40)]
    distinct: u32,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Log as JSON lines instead of human readable text
    #[arg(long)]
    json_logs: bool,

    /// Include per-entry timings in the contents dump
    #[arg(long)]
    verbose: bool,
}

/// A fake pattern search: "finds" `hits` hits, one batch per millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternSearch {
    index: &'static str,
    pattern: u32,
    count_only: bool,
    broken: bool,
}

impl PatternSearch {
    fn hits(&self) -> u64 {
        u64::from(self.pattern % 17 + 1) * 1_000
    }
}

struct Hits {
    total: u64,
    stored: u64,
}

impl SearchResult for Hits {
    fn stored_hits(&self) -> u64 {
        self.stored
    }
}

impl SearchTask for PatternSearch {
    type Output = Hits;

    fn execute(&self, ctx: &TaskContext) -> Result<Hits> {
        let total = self.hits();
        let batch = 500;
        let mut found = 0;
        while found < total {
            ctx.checkpoint()?;
            found = (found + batch).min(total);
            if !self.count_only {
                ctx.set_stored_hits(found);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if self.broken {
            anyhow::bail!("pattern {} could not be parsed", self.pattern);
        }
        let stored = if self.count_only { 0 } else { total };
        Ok(Hits { total, stored })
    }

    fn index_name(&self) -> &str {
        self.index
    }

    fn is_count(&self) -> bool {
        self.count_only
    }
}

#[derive(Default)]
struct Tally {
    ok: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    rejected: AtomicUsize,
    total_hits: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: Result<std::sync::Arc<Hits>, CacheError>) {
        let counter = match outcome {
            Ok(hits) => {
                self.total_hits.fetch_add(hits.total as usize, Ordering::Relaxed);
                &self.ok
            }
            Err(CacheError::Cancelled) => &self.cancelled,
            Err(CacheError::InsufficientMemory { .. }) => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn init_tracing(json_logs: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hitcache=info,cache_soak=info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => CacheConfig::from_json_file(path)
            .with_context(|| format!("loading cache config from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    let cache: SearchCache<PatternSearch> = SearchCache::new(config).context("creating search cache")?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.clients.max(1))
        .thread_name(|i| format!("soak-client-{i}"))
        .build()
        .context("building client pool")?;

    info!(clients = args.clients, requests = args.requests, distinct = args.distinct, "starting soak");
    let tally = Tally::default();
    let started = Instant::now();

    pool.install(|| {
        (0..args.clients).into_par_iter().for_each(|client| {
            let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(client as u64));
            for _ in 0..args.requests {
                let pattern = rng.gen_range(0..args.distinct.max(1));
                let task = PatternSearch {
                    index: INDEXES[rng.gen_range(0..INDEXES.len())],
                    pattern,
                    count_only: rng.gen_bool(0.1),
                    broken: pattern % 23 == 0,
                };
                tally.record(cache.get(task));
            }
        });
    });

    let elapsed = started.elapsed();
    let sweep = cache.sweep();
    let report = json!({
        "elapsedMs": elapsed.as_millis() as u64,
        "requests": args.clients * args.requests,
        "ok": tally.ok.load(Ordering::Relaxed),
        "failed": tally.failed.load(Ordering::Relaxed),
        "cancelled": tally.cancelled.load(Ordering::Relaxed),
        "rejected": tally.rejected.load(Ordering::Relaxed),
        "totalHits": tally.total_hits.load(Ordering::Relaxed),
        "finalSweep": sweep,
        "status": cache.status(),
        "contents": cache.contents(args.verbose),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    let removed = cache.remove_searches_for_index(INDEXES[0]);
    info!(index = INDEXES[0], removed, "dropped searches for index");
    cache.shutdown();
    Ok(())
}
