//! Internal spinlocks for runtime synchronization
//!
//! These locks guard short, non-suspending critical sections inside the
//! runtime (remote-ready queue, wait queues, sleep queue, stack pool).
//! A fiber must never suspend while holding one.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Relax-spins on the test loop before escalating to an OS yield
const SPIN_BEFORE_YIELD: u32 = 64;

/// Test-loop rounds before escalating to a zero-length sleep
const SPIN_BEFORE_SLEEP: u32 = 192;

/// Cap on the binary exponential backoff exponent
const MAX_COLLISIONS: u32 = 10;

/// A raw test-and-test-and-set spinlock without an associated value
///
/// `lock()` spins on a cached load of the lock word so contended waiters
/// hit the cache instead of the bus; escalation goes relax -> yield ->
/// sleep(0). A failed exchange after the test loop counts as a collision
/// and triggers binary exponential backoff.
pub struct RawSpinlock {
    locked: AtomicBool,
}

impl RawSpinlock {
    /// Create a new unlocked spinlock
    #[inline]
    pub const fn new() -> Self {
        RawSpinlock {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until it is available
    pub fn lock(&self) {
        let mut collisions = 0u32;
        let mut seed = lcg_seed();
        loop {
            let mut count = 0u32;
            // test loop: wait on a (mostly) cached load
            while self.locked.load(Ordering::Relaxed) {
                if count < SPIN_BEFORE_YIELD {
                    count += 1;
                    core::hint::spin_loop();
                } else if count < SPIN_BEFORE_SLEEP {
                    count += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(std::time::Duration::from_micros(1));
                }
            }
            // test-and-set: this is the only bus traffic under contention
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // lost the race with another waiter: binary exponential backoff
            collisions = (collisions + 1).min(MAX_COLLISIONS);
            let z = lcg_next(&mut seed) & ((1u32 << collisions) - 1);
            for _ in 0..z {
                core::hint::spin_loop();
            }
        }
    }

    /// Try to acquire the lock without spinning
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock
    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        RawSpinlock::new()
    }
}

/// Per-call LCG seed derived from a global counter
#[inline]
fn lcg_seed() -> u32 {
    static SEED: AtomicU32 = AtomicU32::new(0x9e37_79b9);
    SEED.fetch_add(0x61c8_8647, Ordering::Relaxed)
}

#[inline]
fn lcg_next(state: &mut u32) -> u32 {
    *state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    *state >> 16
}

/// A spinlock owning the value it protects
pub struct SpinLock<T> {
    raw: RawSpinlock,
    data: UnsafeCell<T>,
}

// Safety: the lock serializes all access to the inner value
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new spinlock containing the given value
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            raw: RawSpinlock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is available
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard that releases the spinlock when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_raw_lock_unlock() {
        let lock = RawSpinlock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_spinlock_basic() {
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard = 42;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn test_spinlock_try_lock() {
        let lock = SpinLock::new(0u32);

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_spinlock_concurrent() {
        let lock = Arc::new(SpinLock::new(0u32));
        let mut handles = vec![];

        for _ in 0..4 {
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

        assert_eq!(*lock.lock(), 4000);
    }
}
