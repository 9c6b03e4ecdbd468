//! Fiber condition variable
//!
//! Waiters enqueue under the condvar's spinlock, release the user mutex,
//! and suspend with the spinlock released only after the stack switch has
//! committed, closing the classic unlock-and-sleep window. Timed waits go
//! through the armed handshake described in the `sync` module docs.

use std::mem;
use std::cell::UnsafeCell;
use std::time::{Duration, Instant};

use weft_core::error::FiberResult;
use weft_core::spinlock::RawSpinlock;

use super::{claim_head_waiter, Claim, Mutex, MutexGuard};
use crate::context::{schedule_ctx, Context};
use crate::list::WaitList;
use crate::scheduler;
use crate::tls;

/// Whether a timed wait returned because its deadline passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult(pub(crate) bool);

impl WaitTimeoutResult {
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

/// A condition variable for fibers
pub struct Condvar {
    splk: RawSpinlock,
    wait_queue: UnsafeCell<WaitList>,
}

// Safety: the wait queue is only touched under `splk`
unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            splk: RawSpinlock::new(),
            wait_queue: UnsafeCell::new(WaitList::new()),
        }
    }

    /// Release `guard`'s mutex and block until notified, then re-acquire
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> FiberResult<MutexGuard<'a, T>> {
        let mutex = guard.mutex();
        let me = Context::active();
        self.splk.lock();
        unsafe { (*self.wait_queue.get()).push(me) };
        // enqueued before anyone can observe the mutex free
        mem::forget(guard);
        mutex.unlock_internal();
        scheduler::suspend_active_with_lock(&self.splk);
        mutex.lock()
    }

    /// Like `wait`, but gives up at `tp`
    pub fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        tp: Instant,
    ) -> FiberResult<(MutexGuard<'a, T>, WaitTimeoutResult)> {
        let mutex = guard.mutex();
        let me = Context::active();
        let sched = tls::scheduler();
        self.splk.lock();
        unsafe {
            (*self.wait_queue.get()).push(me);
            (*me).wait_splk.set(&self.splk);
            (*me).sleep_splk.set(&(*sched).sleep_splk);
        }
        mem::forget(guard);
        mutex.unlock_internal();
        let signaled = unsafe { (*sched).wait_until(tp, Some(&self.splk)) };
        unsafe {
            // whichever side woke us removed us from both queues
            debug_assert!((*me).wait_splk.get().is_null());
            debug_assert!((*me).wait_list.get().is_null());
        }
        let guard = mutex.lock()?;
        Ok((guard, WaitTimeoutResult(!signaled)))
    }

    /// Like `wait`, but gives up after `d`
    pub fn wait_for<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        d: Duration,
    ) -> FiberResult<(MutexGuard<'a, T>, WaitTimeoutResult)> {
        self.wait_until(guard, Instant::now() + d)
    }

    /// Wake one waiter, if any
    ///
    /// A head waiter already being woken by its deadline forces a retry;
    /// the retry window is the deadline path's critical section.
    pub fn notify_one(&self) {
        loop {
            self.splk.lock();
            match unsafe { claim_head_waiter(self.wait_queue.get()) } {
                Claim::None => {
                    self.splk.unlock();
                    return;
                }
                Claim::Retry => {
                    self.splk.unlock();
                    core::hint::spin_loop();
                }
                Claim::Woken(ctx) => {
                    self.splk.unlock();
                    unsafe { schedule_ctx(ctx) };
                    return;
                }
            }
        }
    }

    /// Wake every current waiter
    pub fn notify_all(&self) {
        loop {
            self.splk.lock();
            match unsafe { claim_head_waiter(self.wait_queue.get()) } {
                Claim::None => {
                    self.splk.unlock();
                    return;
                }
                Claim::Retry => {
                    self.splk.unlock();
                    core::hint::spin_loop();
                }
                Claim::Woken(ctx) => {
                    self.splk.unlock();
                    unsafe { schedule_ctx(ctx) };
                }
            }
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}
