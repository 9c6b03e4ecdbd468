//! Thread-local runtime state
//!
//! Raw cells only, const-initialized and destructor-free, so they stay
//! readable for the whole lifetime of the thread including the teardown
//! phase driven by the owner guard in `scheduler`.

use std::cell::Cell;
use std::ptr;

use weft_core::spinlock::RawSpinlock;

use crate::context::Context;
use crate::scheduler::Scheduler;

/// Payload carried across a stack switch
///
/// The resumed side inspects this before running any other code: it
/// either releases the lock the suspender was still holding, or makes the
/// handed-over context ready on the current scheduler.
#[derive(Clone, Copy)]
pub(crate) struct Transfer {
    pub from: *mut Context,
    pub lock: *const RawSpinlock,
    pub ready: *mut Context,
}

impl Transfer {
    pub(crate) const fn none() -> Self {
        Transfer {
            from: ptr::null_mut(),
            lock: ptr::null(),
            ready: ptr::null_mut(),
        }
    }
}

thread_local! {
    /// Currently running context on this OS thread
    static ACTIVE: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };

    /// This thread's scheduler
    static SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(ptr::null_mut()) };

    /// Transfer slot written right before each switch
    static TRANSFER_FROM: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
    static TRANSFER_LOCK: Cell<*const RawSpinlock> = const { Cell::new(ptr::null()) };
    static TRANSFER_READY: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
}

#[inline]
pub(crate) fn active() -> *mut Context {
    ACTIVE.with(|c| c.get())
}

#[inline]
pub(crate) fn set_active(ctx: *mut Context) {
    ACTIVE.with(|c| c.set(ctx));
}

#[inline]
pub(crate) fn reset_active() {
    ACTIVE.with(|c| c.set(ptr::null_mut()));
}

#[inline]
pub(crate) fn scheduler() -> *mut Scheduler {
    SCHEDULER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_scheduler(sched: *mut Scheduler) {
    SCHEDULER.with(|c| c.set(sched));
}

#[inline]
pub(crate) fn set_transfer(t: Transfer) {
    TRANSFER_FROM.with(|c| c.set(t.from));
    TRANSFER_LOCK.with(|c| c.set(t.lock));
    TRANSFER_READY.with(|c| c.set(t.ready));
}

#[inline]
pub(crate) fn take_transfer() -> Transfer {
    let t = Transfer {
        from: TRANSFER_FROM.with(|c| c.get()),
        lock: TRANSFER_LOCK.with(|c| c.get()),
        ready: TRANSFER_READY.with(|c| c.get()),
    };
    set_transfer(Transfer::none());
    t
}
