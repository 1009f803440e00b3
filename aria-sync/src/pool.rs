//! Per-heap node pool backing the message queues.
//!
//! Nodes are allocated in arrays of a fixed count and addressed by packed
//! (array, slot) indices, never by pointer. Queues splice pool nodes into
//! their own rings; the pool only hands slots out and takes them back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::memory::{HeapId, MemTracker};

/// Packed index of a pool node: array in the high half, slot in the low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u32);

impl NodeId {
    fn new(array: usize, slot: usize) -> Self {
        Self(((array as u32) << 16) | slot as u32)
    }

    fn array(self) -> usize {
        (self.0 >> 16) as usize
    }

    fn slot(self) -> usize {
        (self.0 & 0xffff) as usize
    }
}

/// One pool slot: element payload plus the ring links a queue maintains
/// while it owns the node.
pub(crate) struct Node<T> {
    pub(crate) next: NodeId,
    pub(crate) prev: NodeId,
    pub(crate) priority: u32,
    pub(crate) elem: Option<T>,
}

struct PoolArray<T> {
    nodes: Box<[Node<T>]>,
    in_use: u16,
}

struct PoolInner<T> {
    arrays: Vec<Option<PoolArray<T>>>,
    free: Vec<NodeId>,
}

/// A growable pool of queue nodes for one heap.
pub struct BufPool<T> {
    heap: HeapId,
    nodes_per_array: u16,
    max_arrays: usize,
    tracker: Arc<MemTracker>,
    inner: Mutex<PoolInner<T>>,
}

impl<T> BufPool<T> {
    pub fn new(
        tracker: &Arc<MemTracker>,
        heap: HeapId,
        max_arrays: usize,
        nodes_per_array: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            heap,
            nodes_per_array,
            max_arrays,
            tracker: Arc::clone(tracker),
            inner: Mutex::new(PoolInner {
                arrays: Vec::new(),
                free: Vec::new(),
            }),
        })
    }

    pub fn heap(&self) -> HeapId {
        self.heap
    }

    /// Total node capacity across currently allocated arrays.
    pub fn allocated_nodes(&self) -> usize {
        let inner = self.inner.lock();
        inner.arrays.iter().flatten().count() * self.nodes_per_array as usize
    }

    /// Nodes currently handed out to queues.
    pub fn nodes_in_use(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .arrays
            .iter()
            .flatten()
            .map(|a| a.in_use as usize)
            .sum()
    }

    /// Free arrays that have no node in use. Queues keep working; only
    /// spare capacity is returned.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let mut freed = Vec::new();
        for (idx, entry) in inner.arrays.iter_mut().enumerate() {
            if entry.as_ref().is_some_and(|a| a.in_use == 0) {
                *entry = None;
                freed.push(idx);
            }
        }
        if !freed.is_empty() {
            inner.free.retain(|id| !freed.contains(&id.array()));
            let bytes = freed.len() * self.array_bytes();
            self.tracker.on_free(self.heap, bytes);
            tracing::debug!(arrays = freed.len(), heap = ?self.heap, "pool reset freed arrays");
        }
    }

    pub(crate) fn lock(&self) -> PoolGuard<'_, T> {
        PoolGuard {
            pool: self,
            inner: self.inner.lock(),
        }
    }

    fn array_bytes(&self) -> usize {
        self.nodes_per_array as usize * std::mem::size_of::<Node<T>>()
    }
}

impl<T> fmt::Debug for BufPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufPool")
            .field("heap", &self.heap)
            .field("allocated_nodes", &self.allocated_nodes())
            .field("nodes_in_use", &self.nodes_in_use())
            .finish()
    }
}

pub(crate) struct PoolGuard<'a, T> {
    pool: &'a BufPool<T>,
    inner: parking_lot::MutexGuard<'a, PoolInner<T>>,
}

impl<T> PoolGuard<'_, T> {
    /// Take one node from the pool, growing by one array if needed.
    pub(crate) fn alloc_node(&mut self) -> Result<NodeId> {
        if self.inner.free.is_empty() {
            self.grow()?;
        }
        let id = self.inner.free.pop().ok_or(Error::NoMemory)?;
        let arr = self.inner.arrays[id.array()]
            .as_mut()
            .ok_or(Error::Unexpected)?;
        arr.in_use += 1;
        let node = &mut arr.nodes[id.slot()];
        node.next = id;
        node.prev = id;
        node.priority = 0;
        Ok(id)
    }

    pub(crate) fn free_node(&mut self, id: NodeId) {
        let arr = self.inner.arrays[id.array()]
            .as_mut()
            .expect("freeing node of a destroyed array");
        debug_assert!(arr.nodes[id.slot()].elem.is_none());
        arr.in_use -= 1;
        self.inner.free.push(id);
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node<T> {
        &self.inner.arrays[id.array()].as_ref().unwrap().nodes[id.slot()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        &mut self.inner.arrays[id.array()].as_mut().unwrap().nodes[id.slot()]
    }

    fn grow(&mut self) -> Result<()> {
        let array_idx = match self.inner.arrays.iter().position(Option::is_none) {
            Some(idx) => idx,
            None if self.inner.arrays.len() < self.pool.max_arrays => {
                self.inner.arrays.push(None);
                self.inner.arrays.len() - 1
            }
            None => {
                tracing::error!(heap = ?self.pool.heap, "node pool exhausted");
                return Err(Error::NoMemory);
            }
        };
        self.pool
            .tracker
            .on_alloc(self.pool.heap, self.pool.array_bytes())?;
        let count = self.pool.nodes_per_array as usize;
        let mut nodes = Vec::with_capacity(count);
        for slot in 0..count {
            let id = NodeId::new(array_idx, slot);
            nodes.push(Node {
                next: id,
                prev: id,
                priority: 0,
                elem: None,
            });
        }
        self.inner.arrays[array_idx] = Some(PoolArray {
            nodes: nodes.into_boxed_slice(),
            in_use: 0,
        });
        for slot in 0..count {
            self.inner.free.push(NodeId::new(array_idx, slot));
        }
        Ok(())
    }
}

/// The per-heap pool table: one pool per heap id, created during
/// container bring-up and shared by every queue on that heap.
pub struct QueuePools<T> {
    tracker: Arc<MemTracker>,
    pools: Mutex<HashMap<HeapId, Arc<BufPool<T>>>>,
}

impl<T> QueuePools<T> {
    pub fn new(tracker: &Arc<MemTracker>) -> Arc<Self> {
        Arc::new(Self {
            tracker: Arc::clone(tracker),
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Create the pool for `heap`. Idempotent: an existing pool is kept.
    pub fn setup(&self, heap: HeapId, max_arrays: usize, nodes_per_array: u16) -> Arc<BufPool<T>> {
        let mut pools = self.pools.lock();
        Arc::clone(pools.entry(heap).or_insert_with(|| {
            tracing::debug!(?heap, max_arrays, nodes_per_array, "created queue pool");
            BufPool::new(&self.tracker, heap, max_arrays, nodes_per_array)
        }))
    }

    pub fn get(&self, heap: HeapId) -> Option<Arc<BufPool<T>>> {
        self.pools.lock().get(&heap).cloned()
    }

    /// Drop spare capacity on every pool.
    pub fn reset(&self) {
        for pool in self.pools.lock().values() {
            pool.reset();
        }
    }

    /// Tear down the pool for `heap`. Callers must have destroyed every
    /// queue on that heap first.
    pub fn destroy(&self, heap: HeapId) {
        if let Some(pool) = self.pools.lock().remove(&heap)
            && pool.nodes_in_use() > 0
        {
            tracing::warn!(?heap, in_use = pool.nodes_in_use(), "pool destroyed with live nodes");
        }
    }
}

impl<T> fmt::Debug for QueuePools<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePools")
            .field("num_pools", &self.pools.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_in_arrays_and_reuses_freed_slots() {
        let t = MemTracker::new();
        let pool: Arc<BufPool<u64>> = BufPool::new(&t, HeapId::Default, 2, 4);
        let mut ids = Vec::new();
        {
            let mut g = pool.lock();
            for _ in 0..5 {
                ids.push(g.alloc_node().unwrap());
            }
        }
        assert_eq!(pool.allocated_nodes(), 8);
        assert_eq!(pool.nodes_in_use(), 5);
        {
            let mut g = pool.lock();
            let id = ids.pop().unwrap();
            g.free_node(id);
            let again = g.alloc_node().unwrap();
            assert_eq!(again, id);
        }
    }

    #[test]
    fn exhaustion_is_no_memory() {
        let t = MemTracker::new();
        let pool: Arc<BufPool<u64>> = BufPool::new(&t, HeapId::Default, 1, 2);
        let mut g = pool.lock();
        g.alloc_node().unwrap();
        g.alloc_node().unwrap();
        assert_eq!(g.alloc_node().unwrap_err(), Error::NoMemory);
    }

    #[test]
    fn reset_frees_only_idle_arrays() {
        let t = MemTracker::new();
        let pool: Arc<BufPool<u64>> = BufPool::new(&t, HeapId::Default, 2, 2);
        let held = {
            let mut g = pool.lock();
            let held = g.alloc_node().unwrap();
            // Force a second array into existence, then free its nodes.
            let a = g.alloc_node().unwrap();
            let b = g.alloc_node().unwrap();
            g.node_mut(a).elem = None;
            g.node_mut(b).elem = None;
            g.free_node(a);
            g.free_node(b);
            held
        };
        pool.reset();
        assert_eq!(pool.allocated_nodes(), 2);
        assert_eq!(pool.nodes_in_use(), 1);
        let mut g = pool.lock();
        g.free_node(held);
    }

    #[test]
    fn pool_table_is_idempotent_per_heap() {
        let t = MemTracker::new();
        let pools: Arc<QueuePools<u64>> = QueuePools::new(&t);
        let a = pools.setup(HeapId::Default, 4, 16);
        let b = pools.setup(HeapId::Default, 8, 32);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pools.get(HeapId::LowPower).is_none());
    }

    #[test]
    fn accounting_flows_through_tracker() {
        let t = MemTracker::new();
        let pool: Arc<BufPool<u64>> = BufPool::new(&t, HeapId::Default, 2, 4);
        {
            let mut g = pool.lock();
            let id = g.alloc_node().unwrap();
            g.free_node(id);
        }
        assert!(t.current_bytes(HeapId::Default) > 0);
        pool.reset();
        assert_eq!(t.current_bytes(HeapId::Default), 0);
    }
}
