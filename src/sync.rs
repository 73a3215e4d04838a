//! Spin locks for the allocator's two process-wide critical sections.
//!
//! The root lock and the big-zone lock are plain atomic test-and-set flags,
//! not OS mutexes: allocator critical sections are short, and the allocator
//! can be called from contexts where yielding to the scheduler (or blocking
//! on a futex) is not safe, such as signal handlers that happen to call
//! `malloc`-adjacent code. A spin loop never calls into the kernel to park.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// A small, data-carrying spin lock.
pub struct SpinLock<T> {
    flag: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever handed out through `lock()`, which
// establishes exclusion via `flag`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is acquired.
    #[inline(always)]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        SpinLockGuard { lock: self }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

#[test]
fn smoke_test_spin_lock() {
    let lock = SpinLock::new(0u32);

    {
        let mut guard = lock.lock();
        *guard += 1;
    }

    assert_eq!(*lock.lock(), 1);
}

#[test]
fn contended_increment() {
    use std::sync::Arc;
    use std::thread;

    let lock = Arc::new(SpinLock::new(0u64));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let lock = Arc::clone(&lock);
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                *lock.lock() += 1;
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*lock.lock(), 8000);
}
