//! Tracked memory accounting and aligned data buffers.
//!
//! Every sizeable allocation the runtime makes is attributed to a heap id
//! and recorded in a [`MemTracker`]: current bytes, peak bytes and
//! allocation counts per heap. The tracker also hosts the simulated
//! allocation-failure counter used by robustness tests.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Heap a runtime allocation is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HeapId {
    /// General-purpose container heap.
    #[default]
    Default,
    /// Low-power island heap for always-on paths.
    LowPower,
}

pub const NUM_HEAPS: usize = 2;

impl HeapId {
    pub fn index(self) -> usize {
        match self {
            HeapId::Default => 0,
            HeapId::LowPower => 1,
        }
    }
}

#[derive(Default)]
struct HeapStats {
    cur_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    num_allocs: AtomicUsize,
    num_frees: AtomicUsize,
    /// Profiling marker currently attributed to this heap, 0 when profiling
    /// is off.
    marker: AtomicU32,
}

/// Per-heap allocation accounting.
///
/// One tracker is constructed per process by the embedder and threaded
/// through every service that allocates; there is no global instance.
pub struct MemTracker {
    heaps: [HeapStats; NUM_HEAPS],
    /// Simulated failure countdown: -1 steady state, N > 0 fails the Nth
    /// accounted allocation and every one after it until reset.
    fail_countdown: AtomicI64,
}

impl MemTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heaps: Default::default(),
            fail_countdown: AtomicI64::new(-1),
        })
    }

    /// Record an allocation of `bytes` against `heap`.
    ///
    /// Fails with [`Error::NoMemory`] when the simulated-failure countdown
    /// trips; the caller must treat that exactly like a real allocator
    /// failure.
    pub fn on_alloc(&self, heap: HeapId, bytes: usize) -> Result<()> {
        if bytes == 0 {
            tracing::error!("zero-size allocation request");
            return Err(Error::BadParam);
        }
        self.check_simulated_failure()?;

        let stats = &self.heaps[heap.index()];
        let cur = stats.cur_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        stats.num_allocs.fetch_add(1, Ordering::Relaxed);
        stats.peak_bytes.fetch_max(cur, Ordering::Relaxed);
        Ok(())
    }

    /// Record a free of `bytes` previously accounted to `heap`.
    pub fn on_free(&self, heap: HeapId, bytes: usize) {
        let stats = &self.heaps[heap.index()];
        stats.cur_bytes.fetch_sub(bytes, Ordering::Relaxed);
        stats.num_frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_bytes(&self, heap: HeapId) -> usize {
        self.heaps[heap.index()].cur_bytes.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self, heap: HeapId) -> usize {
        self.heaps[heap.index()].peak_bytes.load(Ordering::Relaxed)
    }

    pub fn alloc_count(&self, heap: HeapId) -> usize {
        self.heaps[heap.index()].num_allocs.load(Ordering::Relaxed)
    }

    pub fn free_count(&self, heap: HeapId) -> usize {
        self.heaps[heap.index()].num_frees.load(Ordering::Relaxed)
    }

    /// Attach a profiling marker to a heap; 0 disables.
    pub fn set_marker(&self, heap: HeapId, marker: u32) {
        self.heaps[heap.index()].marker.store(marker, Ordering::Relaxed);
    }

    pub fn marker(&self, heap: HeapId) -> u32 {
        self.heaps[heap.index()].marker.load(Ordering::Relaxed)
    }

    /// Arm the simulated failure: the `n`th accounted allocation from now
    /// fails, as does every one after it until [`Self::reset_simulated_failure`].
    pub fn simulate_failure_after(&self, n: u32) {
        self.fail_countdown.store(n as i64, Ordering::Relaxed);
    }

    pub fn reset_simulated_failure(&self) {
        self.fail_countdown.store(-1, Ordering::Relaxed);
    }

    fn check_simulated_failure(&self) -> Result<()> {
        let prev = self.fail_countdown.load(Ordering::Relaxed);
        if prev == -1 {
            return Ok(());
        }
        if prev == 0 {
            tracing::error!("allocation after simulated memory failure");
            return Err(Error::NoMemory);
        }
        if self.fail_countdown.fetch_sub(1, Ordering::Relaxed) == 1 {
            tracing::error!("simulated out-of-memory failure");
            return Err(Error::NoMemory);
        }
        Ok(())
    }
}

impl fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTracker")
            .field("default_cur", &self.current_bytes(HeapId::Default))
            .field("default_peak", &self.peak_bytes(HeapId::Default))
            .field("low_power_cur", &self.current_bytes(HeapId::LowPower))
            .finish()
    }
}

const MIN_ALIGN: usize = 4;
const MAX_ALIGN: usize = 1 << 30;

/// An aligned, heap-attributed byte buffer.
///
/// Data buffers exchanged with external clients must satisfy the transport
/// alignment, so they are allocated here rather than through `Vec`.
/// Contents are zeroed on allocation.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
    heap: HeapId,
    tracker: Arc<MemTracker>,
}

// The buffer is uniquely owned plain bytes.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn new(tracker: &Arc<MemTracker>, heap: HeapId, len: usize, align: usize) -> Result<Self> {
        let align = align.max(MIN_ALIGN);
        if len == 0 || align > MAX_ALIGN || !align.is_power_of_two() {
            return Err(Error::BadParam);
        }
        tracker.on_alloc(heap, len)?;
        let layout = Layout::from_size_align(len, align).map_err(|_| Error::BadParam)?;
        // SAFETY: layout has non-zero size, checked above.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            tracker.on_free(heap, len);
            return Err(Error::NoMemory);
        };
        Ok(Self {
            ptr,
            layout,
            heap,
            tracker: Arc::clone(tracker),
        })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn heap(&self) -> HeapId {
        self.heap
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len come from a live allocation owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees uniqueness.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in new().
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        self.tracker.on_free(self.heap, self.layout.size());
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len())
            .field("align", &self.layout.align())
            .field("heap", &self.heap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_tracks_current_and_peak() {
        let t = MemTracker::new();
        t.on_alloc(HeapId::Default, 100).unwrap();
        t.on_alloc(HeapId::Default, 50).unwrap();
        t.on_free(HeapId::Default, 100);
        assert_eq!(t.current_bytes(HeapId::Default), 50);
        assert_eq!(t.peak_bytes(HeapId::Default), 150);
        assert_eq!(t.alloc_count(HeapId::Default), 2);
        assert_eq!(t.free_count(HeapId::Default), 1);
    }

    #[test]
    fn heaps_are_independent() {
        let t = MemTracker::new();
        t.on_alloc(HeapId::LowPower, 64).unwrap();
        assert_eq!(t.current_bytes(HeapId::Default), 0);
        assert_eq!(t.current_bytes(HeapId::LowPower), 64);
    }

    #[test]
    fn simulated_failure_trips_nth_alloc_and_sticks() {
        let t = MemTracker::new();
        t.simulate_failure_after(2);
        t.on_alloc(HeapId::Default, 8).unwrap();
        assert_eq!(t.on_alloc(HeapId::Default, 8).unwrap_err(), Error::NoMemory);
        assert_eq!(t.on_alloc(HeapId::Default, 8).unwrap_err(), Error::NoMemory);
        t.reset_simulated_failure();
        t.on_alloc(HeapId::Default, 8).unwrap();
    }

    #[test]
    fn aligned_buf_is_aligned_and_zeroed() {
        let t = MemTracker::new();
        let buf = AlignedBuf::new(&t, HeapId::Default, 256, 64).unwrap();
        assert_eq!(buf.as_ptr() as usize % 64, 0);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(t.current_bytes(HeapId::Default), 256);
        drop(buf);
        assert_eq!(t.current_bytes(HeapId::Default), 0);
    }

    #[test]
    fn zero_len_buf_is_bad_param() {
        let t = MemTracker::new();
        assert_eq!(
            AlignedBuf::new(&t, HeapId::Default, 0, 8).unwrap_err(),
            Error::BadParam
        );
    }
}
