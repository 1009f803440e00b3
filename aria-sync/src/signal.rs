//! Condition-variable backed 32-bit signal word.
//!
//! A [`Signal`] multiplexes up to 32 event sources onto one wait point.
//! Setting any bit wakes every waiter whose mask intersects the word;
//! clear-then-set sequences are totally ordered because every mutation
//! happens under the same mutex.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Shared {
    word: Mutex<u32>,
    cond: Condvar,
}

/// A 32-bit signal word with set / clear / get / wait-for-mask.
///
/// Cloning is cheap and shares the underlying word. A waiter blocked in
/// [`Signal::wait`] keeps the shared state alive, so dropping every other
/// clone while a wait is in flight is safe; whether that situation makes
/// sense is the caller's responsibility.
#[derive(Clone)]
pub struct Signal {
    shared: Arc<Shared>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                word: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// OR `mask` into the word and wake all waiters.
    pub fn set(&self, mask: u32) {
        let mut word = self.shared.word.lock();
        *word |= mask;
        self.shared.cond.notify_all();
    }

    /// Clear every bit of `mask` from the word.
    pub fn clear(&self, mask: u32) {
        let mut word = self.shared.word.lock();
        *word &= !mask;
    }

    /// Snapshot of the whole word.
    pub fn get(&self) -> u32 {
        *self.shared.word.lock()
    }

    /// Non-blocking: the subset of `mask` currently set.
    pub fn poll(&self, mask: u32) -> u32 {
        *self.shared.word.lock() & mask
    }

    /// Block until `(word & mask) != 0`, then return that intersection.
    ///
    /// A zero mask returns immediately with 0 - there is nothing to wait
    /// for and blocking forever would be a bug trap.
    pub fn wait(&self, mask: u32) -> u32 {
        if mask == 0 {
            return 0;
        }
        let mut word = self.shared.word.lock();
        while *word & mask == 0 {
            self.shared.cond.wait(&mut word);
        }
        *word & mask
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("word", &format_args!("{:#010x}", self.get()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_clear_get_roundtrip() {
        let sig = Signal::new();
        sig.set(0b101);
        assert_eq!(sig.get(), 0b101);
        sig.clear(0b101);
        assert_eq!(sig.get(), 0);
    }

    #[test]
    fn wait_returns_fired_subset() {
        let sig = Signal::new();
        sig.set(0b110);
        assert_eq!(sig.wait(0b010), 0b010);
        assert_eq!(sig.wait(0b111), 0b110);
    }

    #[test]
    fn wait_zero_mask_is_nonblocking() {
        let sig = Signal::new();
        assert_eq!(sig.wait(0), 0);
    }

    #[test]
    fn wait_blocks_until_set_from_other_thread() {
        let sig = Signal::new();
        let waiter = sig.clone();
        let handle = thread::spawn(move || waiter.wait(0x8000_0000));
        thread::sleep(Duration::from_millis(20));
        sig.set(0x8000_0000);
        assert_eq!(handle.join().unwrap(), 0x8000_0000);
    }

    #[test]
    fn clear_does_not_wake() {
        let sig = Signal::new();
        sig.set(0b1);
        sig.clear(0b1);
        assert_eq!(sig.poll(0b1), 0);
    }
}
