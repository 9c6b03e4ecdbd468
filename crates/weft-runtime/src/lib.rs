//! # weft-runtime
//!
//! The core of the weft fiber runtime: per-thread cooperative schedulers
//! multiplexing many independently-stacked fibers onto OS threads.
//!
//! Layers, bottom up:
//!
//! - [`arch`] - saved-register blocks and the naked-asm stack switch
//! - [`stack`] - mmap'd guard-paged fiber stacks, plain or pooled
//! - `list` - intrusive queues linked through fields embedded in `Context`
//! - [`context`] - one fiber: suspended state, queue memberships, wait
//!   queue, fiber-local storage, reference count
//! - [`algo`] - the pluggable scheduling policy (FIFO round-robin default)
//! - [`scheduler`] - the per-thread coordinator and its dispatcher fiber
//! - [`sync`] - fiber-aware mutexes and condition variable
//!
//! Every switch between fibers goes through a transfer protocol: the
//! suspending side publishes what must happen once the switch has
//! committed (a spinlock to release, or a context to make ready) and the
//! resumed side performs it before touching anything else. That single
//! mechanism is what makes "unlock and sleep" and "yield and requeue"
//! race-free without ever holding a lock across user code.

#[cfg(not(unix))]
compile_error!("weft currently supports unix platforms only");

pub mod algo;
pub mod arch;
pub mod config;
pub mod context;
pub mod scheduler;
pub mod stack;
pub mod sync;

mod list;
mod tls;

pub use algo::{Algorithm, RoundRobin};
pub use config::RuntimeConfig;
pub use context::{fls_get, fls_set, make_worker, Context, ContextRef, FlsCleanup};
pub use scheduler::{
    current_id, ensure_thread_init, has_ready_fibers, is_fiber_context, sleep_for, sleep_until,
    yield_now, Scheduler,
};
pub use stack::{
    FiberStack, MmapStackAllocator, PooledStackAllocator, StackAllocator, DEFAULT_STACK_SIZE,
    MIN_STACK_SIZE,
};
pub use sync::{Condvar, Mutex, MutexGuard, TimedMutex, TimedMutexGuard, WaitTimeoutResult};
