//! Free memory introspection for admission control and eviction pressure.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::System;

/// Reuse a memory reading for this long; admission checks can be frequent.
const MEMORY_CACHE_DURATION: Duration = Duration::from_millis(50);

pub trait MemoryProbe: Send + Sync {
    /// Bytes currently available for new results
    fn free_bytes(&self) -> u64;
}

/// Available system memory as reported by the OS.
pub struct SystemMemory {
    system: Mutex<System>,
    cached: Mutex<Option<(Instant, u64)>>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            cached: Mutex::new(None),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn free_bytes(&self) -> u64 {
        let mut cached = self.cached.lock();
        if let Some((at, bytes)) = *cached {
            if at.elapsed() < MEMORY_CACHE_DURATION {
                return bytes;
            }
        }

        let mut system = self.system.lock();
        system.refresh_memory();
        let bytes = system.available_memory();
        *cached = Some((Instant::now(), bytes));
        bytes
    }
}

/// A settable reading, for tests and simulations.
#[derive(Debug)]
pub struct FixedMemory {
    bytes: AtomicU64,
}

impl FixedMemory {
    pub fn new(bytes: u64) -> Self {
        Self { bytes: AtomicU64::new(bytes) }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Release);
    }
}

impl MemoryProbe for FixedMemory {
    fn free_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }
}
