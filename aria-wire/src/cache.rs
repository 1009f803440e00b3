//! Cache coherence at the shared-memory boundary.
//!
//! The transport in this build is plain process memory, so flush and
//! invalidate carry no hardware effect - but the call sites and their
//! ordering are part of the protocol contract, so the operations exist,
//! take real ranges, and count themselves for observability.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::memmap::MappedRange;

/// Explicit cache maintenance operations, one instance per container.
#[derive(Default)]
pub struct CacheOps {
    invalidates: AtomicU64,
    flushes: AtomicU64,
}

impl CacheOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate before reading a region the client wrote.
    pub fn invalidate(&self, range: &MappedRange) {
        self.invalidates.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(handle = range.handle, len = range.len, "cache invalidate");
    }

    /// Flush after writing a region the client will read.
    pub fn flush(&self, range: &MappedRange) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(handle = range.handle, len = range.len, "cache flush");
    }

    pub fn invalidate_count(&self) -> u64 {
        self.invalidates.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for CacheOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOps")
            .field("invalidates", &self.invalidate_count())
            .field("flushes", &self.flush_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_are_counted() {
        let cache = CacheOps::new();
        let range = MappedRange {
            handle: 8,
            offset: 0,
            len: 64,
        };
        cache.invalidate(&range);
        cache.invalidate(&range);
        cache.flush(&range);
        assert_eq!(cache.invalidate_count(), 2);
        assert_eq!(cache.flush_count(), 1);
    }
}
