//! Fiber mutexes
//!
//! Unlike an OS mutex, a contended lock suspends the fiber instead of
//! blocking the thread, and unlock hands ownership directly to the first
//! waiter (FIFO, no barging).

use std::cell::{Cell, UnsafeCell};
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::time::{Duration, Instant};

use weft_core::error::{FiberError, FiberResult};
use weft_core::spinlock::RawSpinlock;

use super::{claim_head_waiter, Claim};
use crate::context::{schedule_ctx, Context};
use crate::list::WaitList;
use crate::scheduler;
use crate::tls;

/// A mutual exclusion primitive for fibers
///
/// Locking an already-owned mutex from its owner fails with
/// `DeadlockWouldOccur` instead of hanging the scheduler.
pub struct Mutex<T> {
    splk: RawSpinlock,
    owner: Cell<*mut Context>,
    wait_queue: UnsafeCell<WaitList>,
    data: UnsafeCell<T>,
}

// Safety: owner and the wait queue are only touched under `splk`; the
// data is exclusive to the lock holder.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            splk: RawSpinlock::new(),
            owner: Cell::new(ptr::null_mut()),
            wait_queue: UnsafeCell::new(WaitList::new()),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the mutex, suspending the fiber while it is contended
    pub fn lock(&self) -> FiberResult<MutexGuard<'_, T>> {
        let me = Context::active();
        self.splk.lock();
        if self.owner.get().is_null() {
            self.owner.set(me);
            self.splk.unlock();
            return Ok(MutexGuard { mutex: self });
        }
        if self.owner.get() == me {
            self.splk.unlock();
            return Err(FiberError::DeadlockWouldOccur);
        }
        unsafe { (*self.wait_queue.get()).push(me) };
        scheduler::suspend_active_with_lock(&self.splk);
        // the releasing fiber handed ownership over before waking us
        debug_assert!(self.owner.get() == me);
        Ok(MutexGuard { mutex: self })
    }

    /// Acquire the mutex only if that needs no suspension
    pub fn try_lock(&self) -> FiberResult<MutexGuard<'_, T>> {
        let me = Context::active();
        self.splk.lock();
        if self.owner.get().is_null() {
            self.owner.set(me);
            self.splk.unlock();
            return Ok(MutexGuard { mutex: self });
        }
        let deadlock = self.owner.get() == me;
        self.splk.unlock();
        if deadlock {
            Err(FiberError::DeadlockWouldOccur)
        } else {
            Err(FiberError::WouldBlock)
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub(crate) fn unlock_internal(&self) {
        self.splk.lock();
        let w = unsafe { (*self.wait_queue.get()).pop() };
        if w.is_null() {
            self.owner.set(ptr::null_mut());
            self.splk.unlock();
        } else {
            // direct hand-off: the waiter owns the mutex before it runs
            self.owner.set(w);
            self.splk.unlock();
            unsafe { schedule_ctx(w) };
        }
    }
}

/// RAII guard releasing the mutex on drop
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the mutex
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the mutex
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock_internal();
    }
}

/// A mutex whose acquisition can carry a deadline
///
/// `try_lock_until` arms the timed-wait handshake, so a timing-out waiter
/// and a releasing owner cannot both claim the same hand-off.
pub struct TimedMutex<T> {
    splk: RawSpinlock,
    owner: Cell<*mut Context>,
    wait_queue: UnsafeCell<WaitList>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for TimedMutex<T> {}
unsafe impl<T: Send> Sync for TimedMutex<T> {}

impl<T> TimedMutex<T> {
    pub fn new(value: T) -> Self {
        TimedMutex {
            splk: RawSpinlock::new(),
            owner: Cell::new(ptr::null_mut()),
            wait_queue: UnsafeCell::new(WaitList::new()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> FiberResult<TimedMutexGuard<'_, T>> {
        let me = Context::active();
        self.splk.lock();
        if self.owner.get().is_null() {
            self.owner.set(me);
            self.splk.unlock();
            return Ok(TimedMutexGuard { mutex: self });
        }
        if self.owner.get() == me {
            self.splk.unlock();
            return Err(FiberError::DeadlockWouldOccur);
        }
        unsafe { (*self.wait_queue.get()).push(me) };
        scheduler::suspend_active_with_lock(&self.splk);
        debug_assert!(self.owner.get() == me);
        Ok(TimedMutexGuard { mutex: self })
    }

    pub fn try_lock(&self) -> FiberResult<TimedMutexGuard<'_, T>> {
        let me = Context::active();
        self.splk.lock();
        if self.owner.get().is_null() {
            self.owner.set(me);
            self.splk.unlock();
            return Ok(TimedMutexGuard { mutex: self });
        }
        let deadlock = self.owner.get() == me;
        self.splk.unlock();
        if deadlock {
            Err(FiberError::DeadlockWouldOccur)
        } else {
            Err(FiberError::WouldBlock)
        }
    }

    /// Acquire the mutex, giving up at `tp`
    ///
    /// Times out with `WouldBlock`.
    pub fn try_lock_until(&self, tp: Instant) -> FiberResult<TimedMutexGuard<'_, T>> {
        let me = Context::active();
        self.splk.lock();
        if self.owner.get().is_null() {
            self.owner.set(me);
            self.splk.unlock();
            return Ok(TimedMutexGuard { mutex: self });
        }
        if self.owner.get() == me {
            self.splk.unlock();
            return Err(FiberError::DeadlockWouldOccur);
        }
        let sched = tls::scheduler();
        unsafe {
            (*self.wait_queue.get()).push(me);
            (*me).wait_splk.set(&self.splk);
            (*me).sleep_splk.set(&(*sched).sleep_splk);
            (*sched).wait_until(tp, Some(&self.splk));
            // whichever side woke us has disarmed the handshake
            debug_assert!((*me).wait_splk.get().is_null());
        }
        self.splk.lock();
        let acquired = self.owner.get() == me;
        self.splk.unlock();
        if acquired {
            Ok(TimedMutexGuard { mutex: self })
        } else {
            Err(FiberError::WouldBlock)
        }
    }

    pub fn try_lock_for(&self, d: Duration) -> FiberResult<TimedMutexGuard<'_, T>> {
        self.try_lock_until(Instant::now() + d)
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock_internal(&self) {
        loop {
            self.splk.lock();
            match unsafe { claim_head_waiter(self.wait_queue.get()) } {
                Claim::None => {
                    self.owner.set(ptr::null_mut());
                    self.splk.unlock();
                    return;
                }
                Claim::Retry => {
                    self.splk.unlock();
                    core::hint::spin_loop();
                }
                Claim::Woken(w) => {
                    self.owner.set(w);
                    self.splk.unlock();
                    unsafe { schedule_ctx(w) };
                    return;
                }
            }
        }
    }
}

/// RAII guard releasing the timed mutex on drop
pub struct TimedMutexGuard<'a, T> {
    mutex: &'a TimedMutex<T>,
}

impl<'a, T> Deref for TimedMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the mutex
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for TimedMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the mutex
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for TimedMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock_internal();
    }
}
