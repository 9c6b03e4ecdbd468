//! Fiber-aware synchronization primitives
//!
//! Built on the wait-queue protocol shared with the scheduler: a blocking
//! fiber enqueues itself under the primitive's spinlock and suspends with
//! that lock released only after the stack switch has committed, so a
//! waker can never observe it half-switched.
//!
//! Timed waits additionally arm `wait_splk`/`sleep_splk` on the context.
//! A notifier that finds an armed waiter must try-lock the sleep lock
//! before claiming it; failure means the deadline path on the owning
//! scheduler is already waking that fiber, and the notifier backs off and
//! retries. Each retry is bounded by the deadline path's short critical
//! section, so the loop cannot spin unboundedly against a quiescent peer.

mod condvar;
mod mutex;

pub use condvar::{Condvar, WaitTimeoutResult};
pub use mutex::{Mutex, MutexGuard, TimedMutex, TimedMutexGuard};

use std::ptr;

use crate::context::Context;
use crate::list::WaitList;

/// Outcome of trying to take the head waiter off a wait queue
pub(crate) enum Claim {
    /// Queue empty
    None,
    /// Head is being woken by its deadline; drop the queue lock and retry
    Retry,
    /// Head removed from the queue and disarmed; safe to schedule
    Woken(*mut Context),
}

/// Claim the head waiter of `list`
///
/// # Safety
///
/// The caller must hold the spinlock guarding `list`.
pub(crate) unsafe fn claim_head_waiter(list: *mut WaitList) -> Claim {
    let ctx = (*list).head();
    if ctx.is_null() {
        return Claim::None;
    }
    if !(*ctx).wait_splk.get().is_null() {
        // armed timed waiter: win the race against its deadline or lose it
        let ssplk = (*ctx).sleep_splk.get();
        debug_assert!(!ssplk.is_null());
        if !(*ssplk).try_lock() {
            return Claim::Retry;
        }
        let sched = (*ctx).get_scheduler();
        debug_assert!(ptr::eq(ssplk, &(*sched).sleep_splk));
        (*(*sched).sleep_queue.get()).unlink(ctx);
        (*ctx).wait_splk.set(ptr::null());
        (*ctx).sleep_splk.set(ptr::null());
        (*ssplk).unlock();
    }
    let popped = (*list).pop();
    debug_assert!(ptr::eq(popped, ctx));
    Claim::Woken(ctx)
}
