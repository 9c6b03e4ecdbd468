//! Pluggable scheduling algorithm interface

mod round_robin;

pub use round_robin::RoundRobin;

use std::ptr::NonNull;
use std::time::Instant;

use crate::context::Context;

/// Scheduling policy behind a scheduler
///
/// All methods except `notify` are called only by the scheduler's owning
/// thread. `notify` may arrive from any thread (under the scheduler's
/// remote-ready lock) and must be safe to call concurrently with
/// `suspend_until`.
///
/// An implementation may inspect `Context::properties()` of awakened
/// contexts to order them.
pub trait Algorithm: 'static {
    /// Accept a context that became ready
    fn awakened(&self, ctx: NonNull<Context>);

    /// Hand out the next context to run, or None when idle
    fn pick_next(&self) -> Option<NonNull<Context>>;

    /// Whether any context is waiting to run
    fn has_ready_fibers(&self) -> bool;

    /// Park the OS thread until `deadline` (None = indefinitely) or until
    /// a `notify` arrives, whichever is first
    fn suspend_until(&self, deadline: Option<Instant>);

    /// Wake a thread parked in `suspend_until`
    fn notify(&self);
}
