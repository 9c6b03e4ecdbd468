//! Per-thread scheduler
//!
//! Every OS thread using the runtime owns exactly one `Scheduler`,
//! installed lazily on first use. The thread's native stack is wrapped as
//! the main context and a dispatcher fiber is attached immediately, so
//! the first time the main context suspends, the dispatcher takes over
//! the bookkeeping loop.
//!
//! Cross-thread coupling is confined to the remote-ready queue (guarded
//! by `remote_splk`), the sleep queue (guarded by `sleep_splk` for the
//! timed-wait handshake) and context reference counts.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use weft_core::spinlock::RawSpinlock;
use weft_core::{wdebug, ContextKind, FiberId};

use crate::algo::{Algorithm, RoundRobin};
use crate::config::RuntimeConfig;
use crate::context::{Context, ContextRef};
use crate::list::{RemoteReadyList, SleepList, TerminatedList, WorkerList};
use crate::stack::{MmapStackAllocator, StackAllocator};
use crate::tls;

/// Per-thread fiber scheduler
pub struct Scheduler {
    algo: UnsafeCell<Box<dyn Algorithm>>,

    main_ctx: Cell<*mut Context>,
    dispatcher_ctx: UnsafeCell<Option<ContextRef>>,

    worker_queue: UnsafeCell<WorkerList>,
    terminated_queue: UnsafeCell<TerminatedList>,

    pub(crate) sleep_queue: UnsafeCell<SleepList>,
    pub(crate) sleep_splk: RawSpinlock,

    remote_queue: UnsafeCell<RemoteReadyList>,
    remote_splk: RawSpinlock,

    shutdown: AtomicBool,
}

// Safety: local queues and the algorithm are touched only by the owning
// thread except where a spinlock protocol says otherwise (remote queue,
// sleep queue, Algorithm::notify).
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub fn new(algo: Box<dyn Algorithm>) -> Scheduler {
        Scheduler {
            algo: UnsafeCell::new(algo),
            main_ctx: Cell::new(ptr::null_mut()),
            dispatcher_ctx: UnsafeCell::new(None),
            worker_queue: UnsafeCell::new(WorkerList::new()),
            terminated_queue: UnsafeCell::new(TerminatedList::new()),
            sleep_queue: UnsafeCell::new(SleepList::new()),
            sleep_splk: RawSpinlock::new(),
            remote_queue: UnsafeCell::new(RemoteReadyList::new()),
            remote_splk: RawSpinlock::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    #[inline]
    fn algo(&self) -> &dyn Algorithm {
        unsafe { &**self.algo.get() }
    }

    #[inline]
    fn dispatcher_ptr(&self) -> *mut Context {
        unsafe {
            (*self.dispatcher_ctx.get())
                .as_ref()
                .expect("scheduler has no dispatcher")
                .as_ptr()
        }
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    pub fn attach_main_context(&self, ctx: *mut Context) {
        debug_assert!(self.main_ctx.get().is_null());
        self.main_ctx.set(ctx);
        unsafe { (*ctx).set_scheduler(self as *const Scheduler as *mut Scheduler) };
    }

    /// Install the dispatcher and make it the first ready context, so the
    /// main context's first suspension enters the dispatch loop
    pub fn attach_dispatcher_context(&self, ctx: ContextRef) {
        let ptr = ctx.as_ptr();
        unsafe {
            (*ptr).set_scheduler(self as *const Scheduler as *mut Scheduler);
            *self.dispatcher_ctx.get() = Some(ctx);
        }
        self.algo().awakened(NonNull::new(ptr).expect("null dispatcher"));
    }

    /// Take a scheduler share of `ctx` and track it in the worker queue
    pub fn attach_worker_context(&self, ctx: &ContextRef) {
        debug_assert!(ctx.get_scheduler().is_null());
        let raw = ctx.clone().into_raw();
        unsafe {
            (*self.worker_queue.get()).push(raw);
            (*raw).set_scheduler(self as *const Scheduler as *mut Scheduler);
        }
    }

    /// Remove `ctx` from the worker queue and drop the scheduler's share
    pub fn detach_worker_context(&self, ctx: *mut Context) {
        unsafe {
            debug_assert!(!(*ctx).is_kind(ContextKind::PINNED));
            (*self.worker_queue.get()).unlink(ctx);
            (*ctx).set_scheduler(ptr::null_mut());
            drop(ContextRef::from_raw(ctx));
        }
    }

    // ------------------------------------------------------------------
    // Making contexts ready
    // ------------------------------------------------------------------

    /// Local wake-up: take `ctx` off the sleep queue if a timed wait was
    /// cut short, then hand it to the algorithm
    pub fn schedule(&self, ctx: *mut Context) {
        debug_assert!(!ctx.is_null());
        self.sleep_splk.lock();
        unsafe { (*self.sleep_queue.get()).unlink(ctx) };
        self.sleep_splk.unlock();
        self.algo().awakened(NonNull::new(ctx).expect("null context"));
    }

    /// Wake-up from another OS thread: enqueue into the remote-ready list
    /// and kick the parked dispatcher
    ///
    /// `notify` runs under the remote lock so the algorithm cannot be torn
    /// down concurrently (the destructor takes the same lock to signal
    /// shutdown).
    pub fn schedule_from_remote(&self, ctx: *mut Context) {
        unsafe {
            debug_assert!(!(*ctx).is_kind(ContextKind::DISPATCHER));
            debug_assert!((*ctx).get_scheduler() == self as *const Scheduler as *mut Scheduler);
        }
        self.remote_splk.lock();
        debug_assert!(!self.shutdown.load(Ordering::Relaxed));
        unsafe { (*self.remote_queue.get()).push(ctx) };
        self.algo().notify();
        self.remote_splk.unlock();
    }

    // ------------------------------------------------------------------
    // Blocking entry points (called on the active fiber)
    // ------------------------------------------------------------------

    fn pick_next_expect(&self) -> *mut Context {
        self.algo()
            .pick_next()
            .expect("scheduler state torn: no runnable context (dispatcher lost)")
            .as_ptr()
    }

    /// Let another fiber run; the yielder goes back into the ready queue
    pub fn yield_active(&self) {
        let me = tls::active();
        unsafe {
            debug_assert!(!(*me).is_kind(ContextKind::DISPATCHER));
            let next = self.pick_next_expect();
            (*next).resume_schedule(me);
        }
    }

    /// Sleep the active fiber until `tp`, optionally releasing `lk` after
    /// the switch commits. Returns true if woken before the deadline.
    pub fn wait_until(&self, tp: Instant, lk: Option<&RawSpinlock>) -> bool {
        let me = tls::active();
        unsafe {
            debug_assert!(!(*me).is_kind(ContextKind::DISPATCHER));
            self.sleep_splk.lock();
            (*self.sleep_queue.get()).push_sorted(me, tp);
            self.sleep_splk.unlock();
            let next = self.pick_next_expect();
            match lk {
                Some(l) => (*next).resume_with_lock(l),
                None => (*next).resume(),
            }
        }
        Instant::now() < tp
    }

    /// Suspend the active fiber until somebody schedules it again
    pub fn suspend(&self) {
        let next = self.pick_next_expect();
        unsafe { (*next).resume() };
    }

    /// Suspend the active fiber, releasing `lk` after the switch commits
    pub fn suspend_with_lock(&self, lk: &RawSpinlock) {
        let next = self.pick_next_expect();
        unsafe { (*next).resume_with_lock(lk) };
    }

    /// Final transition of a terminating fiber: park it on the terminated
    /// queue, drop it from the worker queue, release the terminate lock
    /// and switch away for good
    pub(crate) fn terminate(&self, lk: &RawSpinlock, ctx: *mut Context) -> ! {
        unsafe {
            debug_assert!(ptr::eq(tls::active(), ctx));
            debug_assert!((*ctx).is_kind(ContextKind::WORKER));
            debug_assert!((*(*ctx).wait_queue.get()).is_empty());
            (*self.terminated_queue.get()).push(ctx);
            (*self.worker_queue.get()).unlink(ctx);
            lk.unlock();
            let next = self.pick_next_expect();
            (*next).resume();
        }
        unreachable!("terminated fiber resumed");
    }

    // ------------------------------------------------------------------
    // Algorithm plumbing
    // ------------------------------------------------------------------

    pub fn has_ready_fibers(&self) -> bool {
        self.algo().has_ready_fibers()
    }

    /// Swap in a new scheduling algorithm, migrating ready contexts
    pub fn set_algorithm(&self, algo: Box<dyn Algorithm>) {
        {
            let cur = self.algo();
            while let Some(ctx) = cur.pick_next() {
                algo.awakened(ctx);
            }
        }
        unsafe { *self.algo.get() = algo };
    }

    // ------------------------------------------------------------------
    // Dispatcher
    // ------------------------------------------------------------------

    /// Bookkeeping loop run by the dispatcher fiber
    pub(crate) fn dispatch(&self) -> ! {
        let disp = self.dispatcher_ptr();
        debug_assert!(ptr::eq(tls::active(), disp));
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.algo().notify();
                if unsafe { (*self.worker_queue.get()).is_empty() } {
                    break;
                }
            }
            self.release_terminated();
            self.remote_ready2ready();
            self.sleep2ready();
            match self.algo().pick_next() {
                Some(next) => unsafe {
                    let next = next.as_ptr();
                    debug_assert!((*next).is_resumable());
                    // hand ourselves over so the ready queue never dries up
                    (*next).resume_schedule(disp);
                },
                None => {
                    self.sleep_splk.lock();
                    let deadline = unsafe { (*self.sleep_queue.get()).lowest_deadline() };
                    self.sleep_splk.unlock();
                    self.algo().suspend_until(deadline);
                }
            }
        }
        self.release_terminated();
        // teardown: the main context is parked in join() on us
        unsafe {
            (*disp).splk.lock();
            (*disp).mark_terminated();
            let main = (*(*disp).wait_queue.get()).pop();
            (*disp).splk.unlock();
            debug_assert!(ptr::eq(main, self.main_ctx.get()));
            (*main).resume();
        }
        unreachable!("dispatcher resumed after teardown");
    }

    /// Drop the scheduler's share of every fiber that finished since the
    /// last pass; the last share frees the context and its stack
    fn release_terminated(&self) {
        loop {
            let ctx = unsafe { (*self.terminated_queue.get()).pop() };
            if ctx.is_null() {
                break;
            }
            unsafe {
                debug_assert!((*ctx).is_kind(ContextKind::WORKER));
                debug_assert!((*ctx).is_terminated());
                debug_assert!((*(*ctx).wait_queue.get()).is_empty());
                drop(ContextRef::from_raw(ctx));
            }
        }
    }

    /// Drain the remote-ready inbox into the local ready queue
    fn remote_ready2ready(&self) {
        let mut tmp = RemoteReadyList::new();
        self.remote_splk.lock();
        unsafe { (*self.remote_queue.get()).swap(&mut tmp) };
        self.remote_splk.unlock();
        loop {
            let ctx = tmp.pop();
            if ctx.is_null() {
                break;
            }
            self.schedule(ctx);
        }
    }

    /// Wake sleepers whose deadline has passed
    ///
    /// A sleeper armed for a timed wait on a primitive (`wait_splk` set)
    /// must also leave that primitive's wait queue. Its wait lock is only
    /// try-locked here: on failure a notifier on another thread is already
    /// waking this context, so leave it alone and retry next pass.
    fn sleep2ready(&self) {
        let now = Instant::now();
        loop {
            self.sleep_splk.lock();
            let sq = unsafe { &mut *self.sleep_queue.get() };
            let Some(ctx) = sq.expired_head(now) else {
                self.sleep_splk.unlock();
                break;
            };
            unsafe {
                debug_assert!(!(*ctx).is_kind(ContextKind::DISPATCHER));
                let wq_splk = (*ctx).wait_splk.get();
                if !wq_splk.is_null() {
                    if !(*wq_splk).try_lock() {
                        self.sleep_splk.unlock();
                        break;
                    }
                    let wl = (*ctx).wait_list.get();
                    debug_assert!(!wl.is_null());
                    (*wl).unlink(ctx);
                    (*ctx).wait_splk.set(ptr::null());
                    (*ctx).sleep_splk.set(ptr::null());
                    (*wq_splk).unlock();
                }
                sq.unlink(ctx);
                self.sleep_splk.unlock();
                self.algo()
                    .awakened(NonNull::new(ctx).expect("null context"));
            }
        }
    }
}

// ----------------------------------------------------------------------
// Per-thread bootstrap and teardown
// ----------------------------------------------------------------------

struct ThreadRuntime {
    sched: *mut Scheduler,
    main: Option<ContextRef>,
}

impl Drop for ThreadRuntime {
    fn drop(&mut self) {
        unsafe {
            let s = self.sched;
            // signal shutdown under the remote lock: a remote waker holding
            // the lock finishes before the flag flips
            (*s).remote_splk.lock();
            (*s).shutdown.store(true, Ordering::Release);
            (*s).remote_splk.unlock();

            // wait for the dispatcher to run every remaining fiber down
            let disp = (*s).dispatcher_ptr();
            let _ = (*disp).join();

            assert!(
                (*(*s).worker_queue.get()).is_empty(),
                "scheduler torn down with live workers"
            );
            assert!((*(*s).terminated_queue.get()).is_empty());
            assert!((*(*s).sleep_queue.get()).is_empty());

            Context::reset_active();
            *(*s).dispatcher_ctx.get() = None;
            self.main.take();
            tls::set_scheduler(ptr::null_mut());
            drop(Box::from_raw(s));
            wdebug!("scheduler torn down");
        }
    }
}

thread_local! {
    static RUNTIME_OWNER: RefCell<Option<ThreadRuntime>> = const { RefCell::new(None) };
}

/// Install this thread's scheduler, main context and dispatcher if not
/// done yet
pub fn ensure_thread_init() {
    if !tls::scheduler().is_null() {
        return;
    }
    init_thread();
}

#[cold]
fn init_thread() {
    weft_core::wlog::init();
    let mut cfg = RuntimeConfig::from_env();
    if cfg.validate().is_err() {
        weft_core::wwarn!("invalid WEFT_* environment, using built-in defaults");
        cfg = RuntimeConfig {
            stack_size: crate::config::defaults::STACK_SIZE,
            guard_pages: crate::config::defaults::GUARD_PAGES,
        };
    }

    let sched = Box::into_raw(Box::new(Scheduler::new(Box::new(RoundRobin::new()))));
    let main = unsafe { ContextRef::from_boxed(Context::new_main()) };
    unsafe { (*sched).attach_main_context(main.as_ptr()) };
    tls::set_scheduler(sched);
    tls::set_active(main.as_ptr());

    let alloc = if cfg.guard_pages {
        MmapStackAllocator::new(cfg.stack_size)
    } else {
        MmapStackAllocator::unguarded(cfg.stack_size)
    }
    .expect("validated stack size rejected");
    let stack = alloc
        .allocate()
        .expect("failed to map the dispatcher stack");
    let disp = unsafe { ContextRef::from_boxed(Context::new_dispatcher(stack, sched)) };
    unsafe { (*sched).attach_dispatcher_context(disp) };

    RUNTIME_OWNER.with(|owner| {
        *owner.borrow_mut() = Some(ThreadRuntime {
            sched,
            main: Some(main),
        });
    });
    wdebug!("scheduler initialized");
}

/// Suspend the active fiber, releasing `lk` once the switch committed
pub(crate) fn suspend_active_with_lock(lk: &RawSpinlock) {
    let sched = tls::scheduler();
    debug_assert!(!sched.is_null());
    unsafe { (*sched).suspend_with_lock(lk) };
}

// ----------------------------------------------------------------------
// Free functions (re-exported by the facade)
// ----------------------------------------------------------------------

/// Give up the remaining time of the active fiber
pub fn yield_now() {
    ensure_thread_init();
    unsafe { (*tls::scheduler()).yield_active() };
}

/// Sleep the active fiber until `tp`
pub fn sleep_until(tp: Instant) {
    ensure_thread_init();
    unsafe { (*tls::scheduler()).wait_until(tp, None) };
}

/// Sleep the active fiber for `d`
pub fn sleep_for(d: Duration) {
    sleep_until(Instant::now() + d);
}

/// Identifier of the active fiber
pub fn current_id() -> FiberId {
    unsafe { (*Context::active()).id() }
}

/// Whether the caller is running on a spawned fiber, as opposed to the
/// thread's main context
pub fn is_fiber_context() -> bool {
    ensure_thread_init();
    unsafe { (*tls::active()).is_kind(ContextKind::WORKER) }
}

/// Whether this thread's scheduler has runnable fibers queued
pub fn has_ready_fibers() -> bool {
    ensure_thread_init();
    unsafe { (*tls::scheduler()).has_ready_fibers() }
}

/// Replace the calling thread's scheduling algorithm, migrating any
/// contexts that are already ready
pub fn set_thread_algorithm(algo: Box<dyn Algorithm>) {
    ensure_thread_init();
    unsafe { (*tls::scheduler()).set_algorithm(algo) };
}
