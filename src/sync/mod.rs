//! Synchronization primitives used by the kernel.
//!
//! The kernel runs as a collection of host threads, one per user process,
//! that share the kernel tables. These wrappers give the kernel the same
//! guard-based locking surface regardless of the host's mutex flavor, and
//! they never poison: a panicking kernel thread is a kernel bug, and the
//! remaining threads keep a consistent view of the data.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Mutual exclusion for kernel data.
///
/// `lock` blocks the calling kernel thread until the lock is available and
/// returns a guard that releases it on drop. Not reentrant.
pub struct Lock<T> {
    inner: Mutex<T>,
}

/// A guard returned by [`Lock::lock`].
pub type LockGuard<'a, T> = MutexGuard<'a, T>;

impl<T> Lock<T> {
    /// Create a new lock protecting `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, blocking until it is free.
    pub fn lock(&self) -> LockGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Default> Default for Lock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A counting semaphore.
///
/// `down` blocks until the count is positive and decrements it; `up`
/// increments the count and wakes one waiter. Process exit/join use one of
/// these per process: exit releases resources and then `up`s, so a joining
/// parent never observes a half-torn-down child.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with initial count `count`.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Decrement the count, blocking while it is zero.
    pub fn down(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self
                .available
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    /// Increment the count and wake one waiter.
    pub fn up(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.available.notify_one();
    }
}

/// A condition variable paired with a [`Lock`].
pub struct Condition {
    inner: Condvar,
}

impl Condition {
    /// Create a new condition.
    pub const fn new() -> Self {
        Self {
            inner: Condvar::new(),
        }
    }

    /// Atomically release `guard` and wait for a signal, reacquiring the
    /// lock before returning.
    pub fn wait<'a, T>(&self, guard: LockGuard<'a, T>) -> LockGuard<'a, T> {
        self.inner
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.inner.notify_all();
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.inner.notify_one();
    }
}
