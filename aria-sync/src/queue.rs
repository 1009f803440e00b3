//! Non-blocking message queue over pooled nodes.
//!
//! A queue is a circular doubly-linked ring of pool nodes addressed by
//! slab indices. The ring holds every node the queue has ever taken from
//! the pool; `active` of them carry elements between `head` and `tail`.
//! When the queue is bound to a channel bit, the bit tracks non-emptiness
//! unless signalling is disabled.

use std::fmt;
use std::sync::Arc;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::mutex::RecursiveMutex;
use crate::pool::{BufPool, NodeId};

/// Creation attributes, set once before [`Queue::new`].
#[derive(Debug, Clone)]
pub struct QueueAttr {
    pub name: String,
    pub max_nodes: u32,
    pub prealloc_nodes: u32,
    pub is_priority: bool,
}

impl Default for QueueAttr {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_nodes: 16,
            prealloc_nodes: 0,
            is_priority: false,
        }
    }
}

impl QueueAttr {
    pub fn named(name: impl Into<String>, max_nodes: u32) -> Self {
        Self {
            name: name.into(),
            max_nodes,
            ..Self::default()
        }
    }
}

struct Binding {
    channel: Arc<Channel>,
    bit: u32,
}

struct QueueState {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    active: u32,
    allocated: u32,
    max_nodes: u32,
    is_priority: bool,
    disable_signaling: bool,
    binding: Option<Binding>,
}

/// A bounded, non-blocking queue of `T` drawing nodes from a shared pool.
pub struct Queue<T: Send> {
    name: String,
    pool: Arc<BufPool<T>>,
    state: RecursiveMutex<QueueState>,
}

impl<T: Send> Queue<T> {
    pub fn new(pool: &Arc<BufPool<T>>, attr: QueueAttr) -> Result<Self> {
        if attr.max_nodes == 0 || attr.prealloc_nodes > attr.max_nodes {
            return Err(Error::BadParam);
        }
        let q = Self {
            name: attr.name,
            pool: Arc::clone(pool),
            state: RecursiveMutex::new(QueueState {
                head: None,
                tail: None,
                active: 0,
                allocated: 0,
                max_nodes: attr.max_nodes,
                is_priority: attr.is_priority,
                disable_signaling: false,
                binding: None,
            }),
        };
        if attr.prealloc_nodes > 0 {
            q.state.lock().with(|st| {
                let mut pool = q.pool.lock();
                for _ in 0..attr.prealloc_nodes {
                    let node = pool.alloc_node()?;
                    Self::splice_after_tail(st, &mut pool, node, false);
                    st.allocated += 1;
                }
                Ok(())
            })?;
        }
        Ok(q)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_nodes(&self) -> u32 {
        self.state.lock().with_ref(|st| st.max_nodes)
    }

    /// Elements currently queued.
    pub fn fullness(&self) -> u32 {
        self.state.lock().with_ref(|st| st.active)
    }

    pub fn is_empty(&self) -> bool {
        self.fullness() == 0
    }

    /// Bind to a channel, claiming `requested_bit` (0 = pick highest
    /// unused). Rebinding migrates the current set-state and releases the
    /// old bit.
    pub fn bind(&self, channel: &Arc<Channel>, requested_bit: u32) -> Result<u32> {
        let new_bit = channel.claim_bit(requested_bit)?;
        self.state.lock().with(|st| {
            let mut was_set = false;
            if let Some(old) = st.binding.take() {
                tracing::debug!(queue = %self.name, "removing old channel from the queue");
                was_set = old.channel.poll(old.bit) != 0;
                old.channel.release_bit(old.bit);
            }
            if was_set {
                channel.signal().set(new_bit);
            }
            st.binding = Some(Binding {
                channel: Arc::clone(channel),
                bit: new_bit,
            });
        });
        Ok(new_bit)
    }

    /// Release the channel bit; the queue keeps its elements.
    pub fn unbind(&self) {
        self.state.lock().with(|st| {
            if let Some(old) = st.binding.take() {
                old.channel.release_bit(old.bit);
            }
        });
    }

    pub fn channel_bit(&self) -> Option<u32> {
        self.state.lock().with_ref(|st| st.binding.as_ref().map(|b| b.bit))
    }

    /// Non-blocking: is this queue's channel bit currently raised.
    pub fn poll(&self) -> bool {
        self.state.lock().with_ref(|st| {
            st.binding
                .as_ref()
                .is_some_and(|b| b.channel.poll(b.bit) != 0)
        })
    }

    /// Append an element. `NeedMore` when full, `NoMemory` when the pool
    /// cannot grow; neither corrupts the ring.
    pub fn push_back(&self, elem: T) -> Result<()> {
        self.push_back_inner(elem, 0)
    }

    /// Append and, on a priority queue, bubble the element toward the head
    /// past every node with a strictly smaller priority. Priority 0 stays
    /// at the tail; equal priorities keep FIFO order.
    pub fn push_back_with_priority(&self, elem: T, priority: u32) -> Result<()> {
        self.push_back_inner(elem, priority)
    }

    fn push_back_inner(&self, elem: T, priority: u32) -> Result<()> {
        self.state.lock().with(|st| {
            if st.binding.is_none() {
                tracing::error!(queue = %self.name, "push on queue with no channel");
                return Err(Error::BadParam);
            }
            if st.active == st.max_nodes {
                tracing::error!(queue = %self.name, active = st.active, "queue overflowed");
                return Err(Error::NeedMore);
            }

            let mut pool = self.pool.lock();
            if st.active == st.allocated {
                let node = pool.alloc_node().inspect_err(|_| {
                    tracing::error!(queue = %self.name, "unable to get queue node");
                })?;
                Self::splice_after_tail(st, &mut pool, node, true);
                st.allocated += 1;
            } else if st.active > 0 {
                let tail = st.tail.ok_or(Error::Unexpected)?;
                st.tail = Some(pool.node(tail).next);
            }

            let tail = st.tail.ok_or(Error::Unexpected)?;
            {
                let node = pool.node_mut(tail);
                debug_assert!(node.elem.is_none());
                node.elem = Some(elem);
                node.priority = 0;
            }
            st.active += 1;

            if st.is_priority && st.active > 1 {
                Self::bubble_tail(st, &mut pool, priority);
            }
            drop(pool);

            if !st.disable_signaling
                && let Some(b) = &st.binding
            {
                b.channel.signal().set(b.bit);
            }
            Ok(())
        })
    }

    /// Detach and return the head element; `NeedMore` when empty. Clears
    /// the channel bit when this pop empties the queue.
    pub fn pop_front(&self) -> Result<T> {
        self.state.lock().with(|st| {
            if st.binding.is_none() {
                return Err(Error::BadParam);
            }
            if st.active == 0 {
                return Err(Error::NeedMore);
            }
            let mut pool = self.pool.lock();
            let head = st.head.ok_or(Error::Unexpected)?;
            let elem = pool.node_mut(head).elem.take().ok_or(Error::Unexpected)?;
            st.active -= 1;
            if st.active == 0 {
                if let Some(b) = &st.binding {
                    b.channel.signal().clear(b.bit);
                }
            } else {
                // Advance only while a node remains for head to point at.
                st.head = Some(pool.node(head).next);
            }
            Ok(elem)
        })
    }

    /// Detach and return the tail element; `NeedMore` when empty.
    pub fn pop_back(&self) -> Result<T> {
        self.state.lock().with(|st| {
            if st.binding.is_none() {
                return Err(Error::BadParam);
            }
            if st.active == 0 {
                return Err(Error::NeedMore);
            }
            let mut pool = self.pool.lock();
            let tail = st.tail.ok_or(Error::Unexpected)?;
            let elem = pool.node_mut(tail).elem.take().ok_or(Error::Unexpected)?;
            st.active -= 1;
            if st.active == 0 {
                if let Some(b) = &st.binding {
                    b.channel.signal().clear(b.bit);
                }
            } else {
                st.tail = Some(pool.node(tail).prev);
            }
            Ok(elem)
        })
    }

    /// Inspect the head element without popping it.
    pub fn peek_front<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.state.lock().with(|st| {
            if st.binding.is_none() {
                return Err(Error::BadParam);
            }
            if st.active == 0 {
                return Err(Error::NeedMore);
            }
            let pool = self.pool.lock();
            let head = st.head.ok_or(Error::Unexpected)?;
            let elem = pool.node(head).elem.as_ref().ok_or(Error::Unexpected)?;
            Ok(f(elem))
        })
    }

    /// Walk head-to-tail while `f` returns true; returns elements visited.
    pub fn peek_forward(&self, mut f: impl FnMut(&T) -> bool) -> usize {
        self.state.lock().with(|st| {
            let pool = self.pool.lock();
            let mut visited = 0usize;
            let Some(mut cur) = st.head else {
                return 0;
            };
            while visited < st.active as usize {
                let node = pool.node(cur);
                let Some(elem) = node.elem.as_ref() else { break };
                visited += 1;
                if !f(elem) {
                    break;
                }
                cur = node.next;
            }
            visited
        })
    }

    /// Suppress or restore channel signalling. Re-enabling with elements
    /// present raises the bit immediately.
    pub fn enable_disable_signaling(&self, enable: bool) {
        self.state.lock().with(|st| {
            st.disable_signaling = !enable;
            let Some(b) = &st.binding else { return };
            if st.disable_signaling {
                b.channel.signal().clear(b.bit);
            } else if st.active > 0 {
                b.channel.signal().set(b.bit);
            }
        });
    }

    /// Splice a fresh node into the ring after the current tail. With
    /// `advance_tail` the new node becomes the tail (push path); without,
    /// it extends spare capacity (prealloc path).
    fn splice_after_tail(
        st: &mut QueueState,
        pool: &mut crate::pool::PoolGuard<'_, T>,
        node: NodeId,
        advance_tail: bool,
    ) {
        match st.tail {
            None => {
                st.head = Some(node);
                st.tail = Some(node);
                let n = pool.node_mut(node);
                n.next = node;
                n.prev = node;
            }
            Some(tail) => {
                let tail_next = pool.node(tail).next;
                {
                    let n = pool.node_mut(node);
                    n.prev = tail;
                    n.next = tail_next;
                }
                pool.node_mut(tail_next).prev = node;
                pool.node_mut(tail).next = node;
                if advance_tail {
                    st.tail = Some(node);
                }
            }
        }
    }

    /// Move the just-pushed tail toward the head while its priority is
    /// strictly greater than its predecessors'.
    fn bubble_tail(st: &mut QueueState, pool: &mut crate::pool::PoolGuard<'_, T>, priority: u32) {
        let src = st.tail.expect("bubble on empty ring");
        pool.node_mut(src).priority = priority;
        if priority == 0 {
            return;
        }
        let head = st.head.expect("bubble on empty ring");
        let mut dst = pool.node(src).prev;
        for _ in 0..st.active - 1 {
            if priority <= pool.node(dst).priority {
                break;
            }
            dst = pool.node(dst).prev;
        }
        if pool.node(dst).next == head {
            // New highest priority: it becomes the head.
            st.head = Some(src);
        }
        if pool.node(dst).next == src {
            return; // already in the right place
        }
        st.tail = Some(pool.node(src).prev);
        if dst != src {
            let (src_prev, src_next) = {
                let n = pool.node(src);
                (n.prev, n.next)
            };
            pool.node_mut(src_prev).next = src_next;
            pool.node_mut(src_next).prev = src_prev;

            let dst_next = pool.node(dst).next;
            pool.node_mut(dst_next).prev = src;
            {
                let n = pool.node_mut(src);
                n.next = dst_next;
                n.prev = dst;
            }
            pool.node_mut(dst).next = src;
        }
    }
}

impl<T: Send> Drop for Queue<T> {
    fn drop(&mut self) {
        self.state.lock().with(|st| {
            if st.active != 0 {
                tracing::warn!(queue = %self.name, active = st.active, "queue destroyed while elements present");
            }
            if let Some(b) = st.binding.take() {
                b.channel.release_bit(b.bit);
            }
            let mut pool = self.pool.lock();
            let mut cur = st.head;
            for _ in 0..st.allocated {
                let id = cur.expect("allocated ring shorter than count");
                let next = pool.node(id).next;
                pool.node_mut(id).elem = None;
                pool.free_node(id);
                cur = Some(next);
            }
            st.head = None;
            st.tail = None;
            st.active = 0;
            st.allocated = 0;
        });
    }
}

impl<T: Send> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state.lock().with_ref(|st| {
            f.debug_struct("Queue")
                .field("name", &self.name)
                .field("active", &st.active)
                .field("allocated", &st.allocated)
                .field("max_nodes", &st.max_nodes)
                .field("bit", &st.binding.as_ref().map(|b| b.bit))
                .finish()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HeapId, MemTracker};

    fn make_queue(attr: QueueAttr) -> (Arc<Channel>, Queue<u64>, u32) {
        let tracker = MemTracker::new();
        let pool = BufPool::new(&tracker, HeapId::Default, 4, 8);
        let ch = Channel::new();
        let q = Queue::new(&pool, attr).unwrap();
        let bit = q.bind(&ch, 0).unwrap();
        (ch, q, bit)
    }

    #[test]
    fn push_pop_roundtrip_on_empty_queue() {
        let (_ch, q, _) = make_queue(QueueAttr::named("q", 4));
        q.push_back(42).unwrap();
        assert_eq!(q.pop_front().unwrap(), 42);
        assert_eq!(q.pop_front().unwrap_err(), Error::NeedMore);
    }

    #[test]
    fn bit_tracks_nonemptiness() {
        let (ch, q, bit) = make_queue(QueueAttr::named("q", 4));
        assert_eq!(ch.poll(bit), 0);
        q.push_back(1).unwrap();
        assert_eq!(ch.poll(bit), bit);
        q.push_back(2).unwrap();
        q.pop_front().unwrap();
        assert_eq!(ch.poll(bit), bit);
        q.pop_front().unwrap();
        assert_eq!(ch.poll(bit), 0);
    }

    #[test]
    fn fifo_order_preserved_through_ring_reuse() {
        let (_ch, q, _) = make_queue(QueueAttr::named("q", 3));
        for round in 0..5u64 {
            q.push_back(round * 10).unwrap();
            q.push_back(round * 10 + 1).unwrap();
            assert_eq!(q.pop_front().unwrap(), round * 10);
            assert_eq!(q.pop_front().unwrap(), round * 10 + 1);
        }
    }

    #[test]
    fn full_queue_is_need_more() {
        let (_ch, q, _) = make_queue(QueueAttr::named("q", 2));
        q.push_back(1).unwrap();
        q.push_back(2).unwrap();
        assert_eq!(q.push_back(3).unwrap_err(), Error::NeedMore);
        assert_eq!(q.fullness(), 2);
        assert_eq!(q.pop_front().unwrap(), 1);
    }

    #[test]
    fn pop_back_detaches_tail() {
        let (_ch, q, _) = make_queue(QueueAttr::named("q", 4));
        q.push_back(1).unwrap();
        q.push_back(2).unwrap();
        q.push_back(3).unwrap();
        assert_eq!(q.pop_back().unwrap(), 3);
        assert_eq!(q.pop_front().unwrap(), 1);
        assert_eq!(q.pop_back().unwrap(), 2);
    }

    #[test]
    fn priority_push_reorders() {
        let attr = QueueAttr {
            is_priority: true,
            ..QueueAttr::named("prio", 8)
        };
        let (_ch, q, _) = make_queue(attr);
        for (elem, prio) in [(0u64, 0u32), (5, 5), (3, 3), (10, 10)] {
            q.push_back_with_priority(elem, prio).unwrap();
        }
        let mut order = Vec::new();
        while let Ok(v) = q.pop_front() {
            order.push(v);
        }
        assert_eq!(order, vec![10, 5, 3, 0]);
    }

    #[test]
    fn equal_priority_keeps_fifo() {
        let attr = QueueAttr {
            is_priority: true,
            ..QueueAttr::named("prio", 8)
        };
        let (_ch, q, _) = make_queue(attr);
        q.push_back_with_priority(1, 5).unwrap();
        q.push_back_with_priority(2, 5).unwrap();
        q.push_back_with_priority(3, 5).unwrap();
        assert_eq!(q.pop_front().unwrap(), 1);
        assert_eq!(q.pop_front().unwrap(), 2);
        assert_eq!(q.pop_front().unwrap(), 3);
    }

    #[test]
    fn priority_zero_stays_at_tail() {
        let attr = QueueAttr {
            is_priority: true,
            ..QueueAttr::named("prio", 8)
        };
        let (_ch, q, _) = make_queue(attr);
        q.push_back_with_priority(7, 7).unwrap();
        q.push_back_with_priority(0, 0).unwrap();
        assert_eq!(q.pop_front().unwrap(), 7);
        assert_eq!(q.pop_front().unwrap(), 0);
    }

    #[test]
    fn disable_signaling_masks_bit() {
        let (ch, q, bit) = make_queue(QueueAttr::named("q", 4));
        q.enable_disable_signaling(false);
        q.push_back(1).unwrap();
        assert_eq!(ch.poll(bit), 0);
        q.enable_disable_signaling(true);
        assert_eq!(ch.poll(bit), bit);
    }

    #[test]
    fn rebind_migrates_set_state() {
        let (ch1, q, bit1) = make_queue(QueueAttr::named("q", 4));
        q.push_back(1).unwrap();
        let ch2 = Channel::new();
        let bit2 = q.bind(&ch2, 0b1).unwrap();
        assert_eq!(bit2, 0b1);
        assert_eq!(ch2.poll(bit2), bit2);
        assert_eq!(ch1.poll(bit1), 0);
        assert_eq!(ch1.bits_used(), 0);
    }

    #[test]
    fn unbind_then_bind_same_bit_is_single_add() {
        let (ch, q, bit) = make_queue(QueueAttr::named("q", 4));
        q.unbind();
        assert_eq!(ch.bits_used(), 0);
        let again = q.bind(&ch, bit).unwrap();
        assert_eq!(again, bit);
        assert_eq!(ch.bits_used(), bit);
    }

    #[test]
    fn peek_front_and_forward() {
        let (_ch, q, _) = make_queue(QueueAttr::named("q", 4));
        assert_eq!(q.peek_front(|_| ()).unwrap_err(), Error::NeedMore);
        q.push_back(1).unwrap();
        q.push_back(2).unwrap();
        q.push_back(3).unwrap();
        assert_eq!(q.peek_front(|&v| v).unwrap(), 1);
        let mut seen = Vec::new();
        let visited = q.peek_forward(|&v| {
            seen.push(v);
            v < 2
        });
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(visited, 2);
        assert_eq!(q.fullness(), 3);
    }

    #[test]
    fn prealloc_nodes_are_reused_without_pool_growth() {
        let tracker = MemTracker::new();
        let pool: Arc<BufPool<u64>> = BufPool::new(&tracker, HeapId::Default, 4, 8);
        let ch = Channel::new();
        let attr = QueueAttr {
            prealloc_nodes: 4,
            ..QueueAttr::named("pre", 4)
        };
        let q = Queue::new(&pool, attr).unwrap();
        q.bind(&ch, 0).unwrap();
        let before = pool.nodes_in_use();
        for i in 0..4 {
            q.push_back(i).unwrap();
        }
        assert_eq!(pool.nodes_in_use(), before);
        drop(q);
        assert_eq!(pool.nodes_in_use(), 0);
    }
}
