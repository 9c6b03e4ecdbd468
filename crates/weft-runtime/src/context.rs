//! Fiber context
//!
//! One `Context` per fiber: its saved register block, its membership links
//! for every queue kind, its wait queue (fibers joined on it), fiber-local
//! storage, and an atomic reference count shared by the user-visible
//! handle and the owning scheduler.
//!
//! Thread rules: the register block, entry closure, FLS map and the
//! ready/worker/terminated links belong to the owning scheduler thread.
//! `use_count` and `scheduler` are atomic; `terminated` and the wait queue
//! are guarded by `splk`; the sleep links and deadline by the scheduler's
//! sleep spinlock; the remote links by the remote spinlock.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use weft_core::error::{FiberError, FiberResult};
use weft_core::spinlock::RawSpinlock;
use weft_core::{ContextKind, FiberId, Launch};

use crate::arch::{self, SavedRegs};
use crate::list::WaitList;
use crate::scheduler::Scheduler;
use crate::stack::{FiberStack, StackAllocator};
use crate::tls::{self, Transfer};

/// Cleanup callback for one fiber-local storage slot
pub type FlsCleanup = Arc<dyn Fn(*mut u8) + Send + Sync>;

struct FlsEntry {
    value: *mut u8,
    cleanup: Option<FlsCleanup>,
}

/// One fiber
pub struct Context {
    use_count: AtomicUsize,
    kind: ContextKind,
    policy: Launch,

    /// Owning scheduler; null until attached
    scheduler: AtomicPtr<Scheduler>,

    // Intrusive links, one pair per queue kind
    pub(crate) ready_prev: Cell<*mut Context>,
    pub(crate) ready_next: Cell<*mut Context>,
    pub(crate) worker_prev: Cell<*mut Context>,
    pub(crate) worker_next: Cell<*mut Context>,
    pub(crate) sleep_prev: Cell<*mut Context>,
    pub(crate) sleep_next: Cell<*mut Context>,
    pub(crate) terminated_prev: Cell<*mut Context>,
    pub(crate) terminated_next: Cell<*mut Context>,
    pub(crate) remote_prev: Cell<*mut Context>,
    pub(crate) remote_next: Cell<*mut Context>,
    pub(crate) wait_prev: Cell<*mut Context>,
    pub(crate) wait_next: Cell<*mut Context>,

    /// Wait list this context is currently linked on, if any
    pub(crate) wait_list: Cell<*mut WaitList>,

    /// Wake deadline while on a sleep list
    pub(crate) tp: Cell<Option<Instant>>,

    /// Timed-wait handshake: the wait-queue lock and the sleep-queue lock
    /// this context expects a waker to resolve against (see `sync`)
    pub(crate) wait_splk: Cell<*const RawSpinlock>,
    pub(crate) sleep_splk: Cell<*const RawSpinlock>,

    /// Guards `terminated` and `wait_queue`
    pub(crate) splk: RawSpinlock,
    terminated: Cell<bool>,

    /// Fibers blocked in `join` on this context
    pub(crate) wait_queue: UnsafeCell<WaitList>,

    // Execution state
    regs: UnsafeCell<SavedRegs>,
    resumable: Cell<bool>,
    stack: Option<FiberStack>,
    entry: UnsafeCell<Option<Box<dyn FnOnce()>>>,

    fls: UnsafeCell<HashMap<usize, FlsEntry>>,
    properties: UnsafeCell<Option<Box<dyn Any>>>,
}

// Safety: cross-thread access follows the field protocol in the module
// docs; everything else is confined to the owning scheduler thread.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    fn empty(kind: ContextKind, policy: Launch, stack: Option<FiberStack>) -> Box<Context> {
        Box::new(Context {
            use_count: AtomicUsize::new(1),
            kind,
            policy,
            scheduler: AtomicPtr::new(ptr::null_mut()),
            ready_prev: Cell::new(ptr::null_mut()),
            ready_next: Cell::new(ptr::null_mut()),
            worker_prev: Cell::new(ptr::null_mut()),
            worker_next: Cell::new(ptr::null_mut()),
            sleep_prev: Cell::new(ptr::null_mut()),
            sleep_next: Cell::new(ptr::null_mut()),
            terminated_prev: Cell::new(ptr::null_mut()),
            terminated_next: Cell::new(ptr::null_mut()),
            remote_prev: Cell::new(ptr::null_mut()),
            remote_next: Cell::new(ptr::null_mut()),
            wait_prev: Cell::new(ptr::null_mut()),
            wait_next: Cell::new(ptr::null_mut()),
            wait_list: Cell::new(ptr::null_mut()),
            tp: Cell::new(None),
            wait_splk: Cell::new(ptr::null()),
            sleep_splk: Cell::new(ptr::null()),
            splk: RawSpinlock::new(),
            terminated: Cell::new(false),
            wait_queue: UnsafeCell::new(WaitList::new()),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            resumable: Cell::new(false),
            stack,
            entry: UnsafeCell::new(None),
            fls: UnsafeCell::new(HashMap::new()),
            properties: UnsafeCell::new(None),
        })
    }

    /// A context without execution state (main contexts, unit tests)
    pub(crate) fn bare(kind: ContextKind) -> Box<Context> {
        Context::empty(kind, Launch::Post, None)
    }

    /// Wrap the calling thread's native stack as the main context
    pub(crate) fn new_main() -> Box<Context> {
        Context::empty(ContextKind::MAIN | ContextKind::PINNED, Launch::Post, None)
    }

    /// Create the dispatcher context for `sched` on its own stack
    pub(crate) fn new_dispatcher(stack: FiberStack, sched: *mut Scheduler) -> Box<Context> {
        let ctx = Context::empty(
            ContextKind::DISPATCHER | ContextKind::PINNED,
            Launch::Post,
            Some(stack),
        );
        let ptr = &*ctx as *const Context as *mut Context;
        unsafe {
            arch::init_context(
                ctx.regs.get(),
                ctx.stack_top(),
                fiber_entry as usize,
                ptr as usize,
            );
        }
        ctx.scheduler.store(sched, Ordering::Release);
        ctx.resumable.set(true);
        ctx
    }

    #[inline]
    fn stack_top(&self) -> *mut u8 {
        self.stack
            .as_ref()
            .expect("context has no stack")
            .top()
    }

    /// Currently running context of this thread, bootstrapping the
    /// thread's scheduler on first use
    #[inline]
    pub fn active() -> *mut Context {
        crate::scheduler::ensure_thread_init();
        tls::active()
    }

    /// Clear the thread's active-context pointer (scheduler teardown)
    pub(crate) fn reset_active() {
        tls::reset_active();
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        FiberId::from_raw(self as *const Context as usize)
    }

    #[inline]
    pub fn is_kind(&self, kind: ContextKind) -> bool {
        self.kind.is_kind(kind)
    }

    #[inline]
    pub fn policy(&self) -> Launch {
        self.policy
    }

    #[inline]
    pub fn is_resumable(&self) -> bool {
        self.resumable.get()
    }

    #[inline]
    pub(crate) fn get_scheduler(&self) -> *mut Scheduler {
        self.scheduler.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_scheduler(&self, sched: *mut Scheduler) {
        self.scheduler.store(sched, Ordering::Release);
    }

    /// Whether this fiber has finished running
    ///
    /// Reliable from the fiber's own scheduler thread, or after a `join`
    /// on it returned.
    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated.get()
    }

    /// Flag set before the final switch away (caller holds `splk`)
    #[inline]
    pub(crate) fn mark_terminated(&self) {
        self.terminated.set(true);
    }

    // ------------------------------------------------------------------
    // Switching
    // ------------------------------------------------------------------

    /// Switch from the active context into `self`, publishing `transfer`
    /// for the far side. Returns when something switches back into the
    /// suspended caller, which then honors its own resumer's transfer.
    fn switch_in(&self, lock: *const RawSpinlock, ready: *mut Context) {
        let prev = tls::active();
        debug_assert!(!prev.is_null());
        debug_assert!(!ptr::eq(prev, self));
        tls::set_active(self as *const Context as *mut Context);
        tls::set_transfer(Transfer {
            from: prev,
            lock,
            ready,
        });
        // the suspender's continuation becomes valid, the target's is
        // consumed by the switch
        unsafe { (*prev).resumable.set(true) };
        self.resumable.set(false);
        unsafe {
            arch::switch_context((*prev).regs.get(), self.regs.get());
        }
        // the caller's fiber runs again on this line
        Context::apply_transfer();
    }

    /// Honor the transfer published by whoever resumed the running fiber:
    /// release their lock, or make their handed-over context ready here
    pub(crate) fn apply_transfer() {
        let t = tls::take_transfer();
        if !t.lock.is_null() {
            unsafe { (*t.lock).unlock() };
        } else if !t.ready.is_null() {
            unsafe { schedule_ctx(t.ready) };
        }
    }

    /// Switch into `self` with nothing to publish
    pub(crate) fn resume(&self) {
        self.switch_in(ptr::null(), ptr::null_mut());
    }

    /// Switch into `self`; the far side releases `lk` once the switch has
    /// committed, so no waker can observe the suspender half-switched
    pub(crate) fn resume_with_lock(&self, lk: &RawSpinlock) {
        self.switch_in(lk as *const RawSpinlock, ptr::null_mut());
    }

    /// Switch into `self`; the far side enqueues `prev` as ready
    pub(crate) fn resume_schedule(&self, prev: *mut Context) {
        self.switch_in(ptr::null(), prev);
    }

    // ------------------------------------------------------------------
    // Blocking operations (called on the active context's thread)
    // ------------------------------------------------------------------

    /// Block the calling fiber until `self` has terminated
    ///
    /// Fails with `DeadlockWouldOccur` when a fiber joins itself.
    pub fn join(&self) -> FiberResult<()> {
        let me = Context::active();
        if ptr::eq(me, self) {
            return Err(FiberError::DeadlockWouldOccur);
        }
        self.splk.lock();
        if self.terminated.get() {
            self.splk.unlock();
            return Ok(());
        }
        unsafe {
            (*self.wait_queue.get()).push(me);
            crate::scheduler::suspend_active_with_lock(&self.splk);
        }
        debug_assert!(self.terminated.get());
        Ok(())
    }

    /// Make `other` ready, routing through the remote path if it belongs
    /// to another scheduler
    pub fn schedule(&self, other: &Context) {
        unsafe { schedule_ctx(other as *const Context as *mut Context) };
    }

    // ------------------------------------------------------------------
    // Termination (runs on the terminating fiber's own stack)
    // ------------------------------------------------------------------

    pub(crate) fn terminate(&self) -> ! {
        debug_assert!(self.is_kind(ContextKind::WORKER));
        debug_assert!(!self.is_kind(ContextKind::PINNED));
        let sched = self.get_scheduler();
        self.splk.lock();
        self.terminated.set(true);
        // wake everything joined on us before the final switch
        unsafe {
            loop {
                let w = (*self.wait_queue.get()).pop();
                if w.is_null() {
                    break;
                }
                schedule_ctx(w);
            }
            (*sched).terminate(&self.splk, self as *const Context as *mut Context)
        }
    }

    // ------------------------------------------------------------------
    // Fiber-local storage
    // ------------------------------------------------------------------

    /// Value stored under `key`, or null
    pub fn get_fls(&self, key: usize) -> *mut u8 {
        let map = unsafe { &*self.fls.get() };
        map.get(&key).map_or(ptr::null_mut(), |e| e.value)
    }

    /// Store `value` under `key` with an optional cleanup function
    ///
    /// When the key is already present and `cleanup_existing` is set, the
    /// old slot's cleanup runs on its old value before the overwrite.
    pub fn set_fls(
        &self,
        key: usize,
        cleanup: Option<FlsCleanup>,
        value: *mut u8,
        cleanup_existing: bool,
    ) {
        let map = unsafe { &mut *self.fls.get() };
        if let Some(old) = map.insert(
            key,
            FlsEntry {
                value,
                cleanup,
            },
        ) {
            if cleanup_existing {
                if let Some(f) = old.cleanup {
                    if !old.value.is_null() {
                        f(old.value);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduling metadata
    // ------------------------------------------------------------------

    /// Opaque user data handed to the scheduling algorithm
    pub fn properties(&self) -> Option<&dyn Any> {
        unsafe { (*self.properties.get()).as_deref() }
    }

    pub fn set_properties(&self, props: Box<dyn Any>) {
        unsafe { *self.properties.get() = Some(props) };
    }

    /// Attach `other` to the calling thread's scheduler
    pub fn attach(other: &ContextRef) {
        crate::scheduler::ensure_thread_init();
        let sched = tls::scheduler();
        unsafe { (*sched).attach_worker_context(other) };
    }

    /// Detach `other` from its scheduler
    pub fn detach(other: &Context) {
        let sched = other.get_scheduler();
        debug_assert!(!sched.is_null());
        unsafe { (*sched).detach_worker_context(other as *const Context as *mut Context) };
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug_assert!(self.ready_prev.get().is_null() && self.ready_next.get().is_null());
        debug_assert!(self.sleep_prev.get().is_null() && self.sleep_next.get().is_null());
        debug_assert!(self.wait_prev.get().is_null() && self.wait_next.get().is_null());
        // FLS cleanups run before the stack field drops
        let map = unsafe { &mut *self.fls.get() };
        for (_, entry) in map.drain() {
            if let Some(f) = entry.cleanup {
                if !entry.value.is_null() {
                    f(entry.value);
                }
            }
        }
    }
}

/// Make `target` ready on its owning scheduler
///
/// # Safety
///
/// `target` must point to a live, attached context.
pub(crate) unsafe fn schedule_ctx(target: *mut Context) {
    let my_sched = tls::scheduler();
    let their_sched = (*target).get_scheduler();
    debug_assert!(!their_sched.is_null());
    if their_sched == my_sched {
        (*my_sched).schedule(target);
    } else {
        (*their_sched).schedule_from_remote(target);
    }
}

/// Entry point executed on a fresh fiber stack (via the arch trampoline)
extern "C" fn fiber_entry(arg: usize) {
    let ctx = arg as *mut Context;
    // first act: honor the transfer published by the resuming switch
    Context::apply_transfer();
    unsafe {
        if (*ctx).is_kind(ContextKind::DISPATCHER) {
            let sched = (*ctx).get_scheduler();
            (*sched).dispatch()
        }
        {
            let f = (*(*ctx).entry.get())
                .take()
                .expect("worker context started twice");
            // a panicking fiber terminates like a returning one
            if let Err(e) = catch_unwind(AssertUnwindSafe(f)) {
                let what = e
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| e.downcast_ref::<String>().map(|s| s.as_str()))
                    .unwrap_or("non-string panic payload");
                weft_core::werror!("fiber {} panicked: {}", (*ctx).id(), what);
            }
        } // the closure and its captures are gone before the final switch
        (*ctx).terminate()
    }
}

/// Create a worker context running `f` on a stack from `alloc`
///
/// The context is not yet attached to a scheduler.
pub fn make_worker<F>(
    policy: Launch,
    alloc: &dyn StackAllocator,
    f: F,
) -> FiberResult<ContextRef>
where
    F: FnOnce() + 'static,
{
    let stack = alloc.allocate()?;
    let ctx = Context::empty(ContextKind::WORKER, policy, Some(stack));
    unsafe {
        *ctx.entry.get() = Some(Box::new(f));
        let ptr = Box::into_raw(ctx);
        arch::init_context(
            (*ptr).regs.get(),
            (*ptr).stack_top(),
            fiber_entry as usize,
            ptr as usize,
        );
        (*ptr).resumable.set(true);
        Ok(ContextRef::from_new(NonNull::new_unchecked(ptr)))
    }
}

/// Reference-counted handle to a context
///
/// The count starts at one for the creating handle; the scheduler takes
/// its own share at attach and drops it when draining the terminated
/// queue. The last release destroys the context and frees its stack.
pub struct ContextRef {
    ptr: NonNull<Context>,
}

// Safety: Context is Send + Sync under its field protocol
unsafe impl Send for ContextRef {}
unsafe impl Sync for ContextRef {}

impl ContextRef {
    /// Adopt a freshly boxed context whose count is already one
    pub(crate) unsafe fn from_new(ptr: NonNull<Context>) -> Self {
        ContextRef { ptr }
    }

    pub(crate) unsafe fn from_boxed(ctx: Box<Context>) -> Self {
        ContextRef {
            ptr: NonNull::new_unchecked(Box::into_raw(ctx)),
        }
    }

    /// Leak this reference into a raw pointer (count unchanged)
    pub(crate) fn into_raw(self) -> *mut Context {
        let p = self.ptr.as_ptr();
        std::mem::forget(self);
        p
    }

    /// Re-adopt a reference previously leaked with `into_raw`
    pub(crate) unsafe fn from_raw(ptr: *mut Context) -> Self {
        ContextRef {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut Context {
        self.ptr.as_ptr()
    }
}

impl ContextRef {
    /// Enter this fiber into the calling thread's scheduler according to
    /// its launch policy: `Post` enqueues it as ready, `Dispatch` switches
    /// into it immediately and requeues the caller
    pub fn launch(&self) {
        crate::scheduler::ensure_thread_init();
        match self.policy() {
            Launch::Post => unsafe { schedule_ctx(self.as_ptr()) },
            Launch::Dispatch => {
                let me = tls::active();
                self.resume_schedule(me);
            }
        }
    }
}

/// Read a fiber-local slot of the calling fiber
pub fn fls_get(key: usize) -> *mut u8 {
    unsafe { (*Context::active()).get_fls(key) }
}

/// Write a fiber-local slot of the calling fiber
pub fn fls_set(key: usize, cleanup: Option<FlsCleanup>, value: *mut u8, cleanup_existing: bool) {
    unsafe { (*Context::active()).set_fls(key, cleanup, value, cleanup_existing) }
}

impl Deref for ContextRef {
    type Target = Context;

    #[inline]
    fn deref(&self) -> &Context {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for ContextRef {
    fn clone(&self) -> Self {
        unsafe {
            self.ptr.as_ref().use_count.fetch_add(1, Ordering::Relaxed);
        }
        ContextRef { ptr: self.ptr }
    }
}

impl Drop for ContextRef {
    fn drop(&mut self) {
        unsafe {
            if self.ptr.as_ref().use_count.fetch_sub(1, Ordering::Release) == 1 {
                fence(Ordering::Acquire);
                drop(Box::from_raw(self.ptr.as_ptr()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_kind_and_id() {
        let ctx = Context::new_main();
        assert!(ctx.is_kind(ContextKind::MAIN));
        assert!(ctx.is_kind(ContextKind::PINNED));
        assert!(!ctx.is_kind(ContextKind::WORKER));
        assert!(ctx.id().is_some());
    }

    #[test]
    fn test_fls_set_get() {
        let ctx = Context::bare(ContextKind::WORKER);
        let key = 0x10usize;
        assert!(ctx.get_fls(key).is_null());

        let v = Box::into_raw(Box::new(7u32)) as *mut u8;
        ctx.set_fls(key, None, v, false);
        assert_eq!(ctx.get_fls(key), v);
        // reclaim so the test does not leak
        unsafe { drop(Box::from_raw(v as *mut u32)) };
        ctx.set_fls(key, None, ptr::null_mut(), false);
    }

    #[test]
    fn test_fls_cleanup_on_drop() {
        static CLEANED: AtomicUsize = AtomicUsize::new(0);
        let ctx = Context::bare(ContextKind::WORKER);
        let v = Box::into_raw(Box::new(1u8)) as *mut u8;
        let cleanup: FlsCleanup = Arc::new(|p| {
            unsafe { drop(Box::from_raw(p as *mut u8)) };
            CLEANED.fetch_add(1, Ordering::SeqCst);
        });
        ctx.set_fls(1, Some(cleanup), v, false);
        drop(ctx);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fls_cleanup_existing() {
        static CLEANED: AtomicUsize = AtomicUsize::new(0);
        let ctx = Context::bare(ContextKind::WORKER);
        let cleanup: FlsCleanup = Arc::new(|p| {
            unsafe { drop(Box::from_raw(p as *mut u8)) };
            CLEANED.fetch_add(1, Ordering::SeqCst);
        });
        let v1 = Box::into_raw(Box::new(1u8)) as *mut u8;
        let v2 = Box::into_raw(Box::new(2u8)) as *mut u8;
        ctx.set_fls(1, Some(cleanup.clone()), v1, false);
        ctx.set_fls(1, Some(cleanup), v2, true);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 1);
        drop(ctx);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refcount_destroys_once() {
        static CLEANED: AtomicUsize = AtomicUsize::new(0);
        let ctx = Context::bare(ContextKind::WORKER);
        let cleanup: FlsCleanup = Arc::new(|_| {
            CLEANED.fetch_add(1, Ordering::SeqCst);
        });
        ctx.set_fls(1, Some(cleanup), 1usize as *mut u8, false);

        let r1 = unsafe { ContextRef::from_boxed(ctx) };
        let r2 = r1.clone();
        let r3 = r2.clone();
        drop(r1);
        drop(r2);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 0);
        drop(r3);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_properties_roundtrip() {
        let ctx = Context::bare(ContextKind::WORKER);
        assert!(ctx.properties().is_none());
        ctx.set_properties(Box::new(42usize));
        let got = ctx
            .properties()
            .and_then(|p| p.downcast_ref::<usize>())
            .copied();
        assert_eq!(got, Some(42));
    }
}
