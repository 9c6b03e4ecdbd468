//! # weft - cooperative fibers
//!
//! Many independently-stacked, cooperatively-scheduled execution units
//! ("fibers") multiplexed onto one or more OS threads. Each thread hosts
//! a private scheduler; fibers on different threads interact through the
//! fiber-aware synchronization primitives and a locked remote-wakeup
//! path.
//!
//! ## Features
//!
//! - **Lightweight**: guard-paged mmap stacks, optionally pooled; spawn
//!   and switch without touching the OS scheduler
//! - **Cooperative**: control switches only at `yield_now`, `join`,
//!   sleeps and blocking synchronization - never preemptively
//! - **Pluggable scheduling**: FIFO round-robin by default, any
//!   [`Algorithm`] implementation on request
//! - **Synchronization**: [`Mutex`], [`TimedMutex`] and [`Condvar`] that
//!   suspend fibers instead of blocking threads
//! - **Fiber-local storage**: per-fiber slots with cleanup callbacks
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{Fiber, yield_now};
//!
//! let mut a = Fiber::spawn(|| {
//!     for i in 0..3 {
//!         println!("fiber a: {}", i);
//!         yield_now();
//!     }
//! })?;
//!
//! let mut b = Fiber::spawn(|| {
//!     println!("fiber b");
//! })?;
//!
//! a.join()?;
//! b.join()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        User Code                           │
//! │          Fiber::spawn, yield_now, Mutex, Condvar           │
//! └────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                 Scheduler (one per thread)                 │
//! │   main context │ dispatcher fiber │ ready/sleep/... queues │
//! └────────────────────────────────────────────────────────────┘
//!           │                  │                  ▲
//!           ▼                  ▼                  │ remote wake
//! ┌──────────────────┐ ┌──────────────────┐ ┌────┴─────────────┐
//! │  worker fibers   │ │   stack switch   │ │ other schedulers │
//! │ (own mmap stack) │ │   (naked asm)    │ │ (other threads)  │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//! ```
//!
//! The first fiber operation on a thread installs its scheduler: the
//! thread's native stack becomes the *main context* and a *dispatcher*
//! fiber is attached to drive bookkeeping (draining finished fibers,
//! accepting cross-thread wake-ups, expiring sleeps) and to park the
//! thread when nothing is runnable. Teardown happens automatically when
//! the thread exits: the main context waits for the dispatcher to run
//! every remaining fiber to completion.

use std::sync::atomic::{AtomicUsize, Ordering};

// Re-export core types
pub use weft_core::{ContextKind, FiberError, FiberId, FiberResult, Launch, StackError};

// Re-export log macros and helpers
pub use weft_core::wlog::{self, LogLevel};
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};

// Re-export runtime surface
pub use weft_runtime::{
    current_id, has_ready_fibers, is_fiber_context, sleep_for, sleep_until, yield_now, Algorithm,
    Condvar, MmapStackAllocator, Mutex, MutexGuard, PooledStackAllocator, RoundRobin,
    RuntimeConfig, Scheduler, StackAllocator, TimedMutex, TimedMutexGuard, WaitTimeoutResult,
    DEFAULT_STACK_SIZE, MIN_STACK_SIZE,
};

use weft_runtime::{make_worker, Context, ContextRef};

/// Handle to a spawned fiber
///
/// Dropping a handle without joining detaches the fiber: it keeps
/// running and the scheduler reclaims it when it terminates.
pub struct Fiber {
    ctx: Option<ContextRef>,
}

impl Fiber {
    /// Spawn a fiber on the calling thread's scheduler with the default
    /// stack configuration and `Post` launch policy
    pub fn spawn<F>(f: F) -> FiberResult<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let cfg = RuntimeConfig::from_env();
        cfg.validate()?;
        let alloc = if cfg.guard_pages {
            MmapStackAllocator::new(cfg.stack_size)?
        } else {
            MmapStackAllocator::unguarded(cfg.stack_size)?
        };
        Fiber::spawn_with(Launch::Post, &alloc, f)
    }

    /// Spawn with an explicit launch policy and stack allocator
    ///
    /// With [`Launch::Dispatch`] the caller suspends and the new fiber
    /// runs immediately; control returns when it next yields or blocks.
    pub fn spawn_with<F>(policy: Launch, alloc: &dyn StackAllocator, f: F) -> FiberResult<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let ctx = make_worker(policy, alloc, f)?;
        Context::attach(&ctx);
        ctx.launch();
        Ok(Fiber { ctx: Some(ctx) })
    }

    /// Block the calling fiber until this fiber terminates
    ///
    /// Joining a fiber from itself fails with `DeadlockWouldOccur` and
    /// leaves the handle joinable; joining twice fails with
    /// `InvalidArgument`.
    pub fn join(&mut self) -> FiberResult<()> {
        let ctx = self.ctx.as_ref().ok_or(FiberError::InvalidArgument)?;
        ctx.join()?;
        self.ctx = None;
        Ok(())
    }

    /// Give up the handle; the fiber keeps running detached
    pub fn detach(&mut self) -> FiberResult<()> {
        match self.ctx.take() {
            Some(_) => Ok(()),
            None => Err(FiberError::InvalidArgument),
        }
    }

    /// Whether `join` may still be called
    pub fn is_joinable(&self) -> bool {
        self.ctx.is_some()
    }

    /// Identifier of the underlying context, or `FiberId::NONE` after
    /// join/detach
    pub fn id(&self) -> FiberId {
        self.ctx.as_ref().map(|c| c.id()).unwrap_or(FiberId::NONE)
    }
}

/// Spawn a fiber with the defaults of [`Fiber::spawn`]
pub fn spawn<F>(f: F) -> FiberResult<Fiber>
where
    F: FnOnce() + 'static,
{
    Fiber::spawn(f)
}

/// Replace the calling thread's scheduling algorithm
pub fn use_scheduling_algorithm(algo: Box<dyn Algorithm>) {
    weft_runtime::scheduler::set_thread_algorithm(algo);
}

/// Fiber-local storage
///
/// Each key addresses one slot per fiber; the cleanup callback runs
/// exactly once per stored value, either on overwrite with
/// `cleanup_existing` or when the fiber is reclaimed.
pub mod fls {
    use super::*;

    pub use weft_runtime::FlsCleanup;

    /// A storage key; each `new()` yields a distinct slot identity
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlsKey(usize);

    impl FlsKey {
        pub fn new() -> FlsKey {
            static NEXT: AtomicUsize = AtomicUsize::new(1);
            FlsKey(NEXT.fetch_add(1, Ordering::Relaxed))
        }
    }

    impl Default for FlsKey {
        fn default() -> Self {
            FlsKey::new()
        }
    }

    /// Value stored for `key` on the calling fiber, or null
    pub fn get(key: FlsKey) -> *mut u8 {
        weft_runtime::fls_get(key.0)
    }

    /// Store `value` for `key` on the calling fiber
    pub fn set(key: FlsKey, cleanup: Option<FlsCleanup>, value: *mut u8, cleanup_existing: bool) {
        weft_runtime::fls_set(key.0, cleanup, value, cleanup_existing);
    }
}
