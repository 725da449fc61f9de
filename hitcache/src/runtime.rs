//! Tokio runtime access for code that may run outside any runtime context.

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

/// Global fallback Tokio runtime for when the cache is driven from plain threads.
/// Shared by all caches and never dropped.
static FALLBACK_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("hitcache-worker")
        .build()
        .expect("Failed to create fallback tokio runtime")
});

/// Get a tokio runtime handle - uses current runtime if available, otherwise global fallback
pub(crate) fn handle() -> tokio::runtime::Handle {
    tokio::runtime::Handle::try_current().unwrap_or_else(|_| FALLBACK_RUNTIME.handle().clone())
}

/// RAII guard that cancels a token when dropped.
pub(crate) struct DropGuard {
    token: CancellationToken,
}

impl DropGuard {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_guard_cancels() {
        let token = CancellationToken::new();
        let guard = DropGuard::new(token.clone());
        assert!(!token.is_cancelled());

        drop(guard);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_fallback_handle_outside_runtime() {
        let handle = handle();
        let value = handle.block_on(async { 40 + 2 });
        assert_eq!(value, 42);
    }
}
