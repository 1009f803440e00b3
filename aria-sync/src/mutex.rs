//! Recursive mutex wrapper.
//!
//! Event fan-out can re-enter queue operations from inside a callback on
//! the same thread, so queue state is guarded by a reentrant lock rather
//! than a plain mutex. Mutable access goes through a short-lived `RefCell`
//! borrow inside [`RecursiveGuard::with`]; callers must not re-enter the
//! same lock while a borrow is live.

use std::cell::RefCell;
use std::fmt;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

pub struct RecursiveMutex<T> {
    inner: ReentrantMutex<RefCell<T>>,
}

impl<T> RecursiveMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(value)),
        }
    }

    pub fn lock(&self) -> RecursiveGuard<'_, T> {
        RecursiveGuard {
            guard: self.inner.lock(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RecursiveMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveMutex").finish_non_exhaustive()
    }
}

pub struct RecursiveGuard<'a, T> {
    guard: ReentrantMutexGuard<'a, RefCell<T>>,
}

impl<T> RecursiveGuard<'_, T> {
    /// Run `f` with mutable access to the protected value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.guard.borrow_mut())
    }

    /// Run `f` with shared access to the protected value.
    pub fn with_ref<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.guard.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_lock_on_same_thread() {
        let m = RecursiveMutex::new(0u32);
        let outer = m.lock();
        outer.with(|v| *v += 1);
        {
            // A second lock on the same thread must not deadlock.
            let inner = m.lock();
            inner.with(|v| *v += 1);
        }
        assert_eq!(outer.with_ref(|v| *v), 2);
    }
}
