//! # weft-core
//!
//! Platform-independent leaf types for the weft fiber runtime: error
//! enums, the internal spinlocks, the context kind bitmask, launch
//! policies, fiber ids, environment helpers and the log macros.
//!
//! This crate has no dependency on the runtime; `weft-runtime` builds the
//! scheduler and context machinery on top of it.

pub mod env;
pub mod error;
pub mod id;
pub mod kind;
pub mod spinlock;
pub mod wlog;

pub use error::{FiberError, FiberResult, StackError};
pub use id::FiberId;
pub use kind::{ContextKind, Launch};
pub use spinlock::{RawSpinlock, SpinLock, SpinLockGuard};

pub use env::{env_get, env_get_bool, env_get_opt};
