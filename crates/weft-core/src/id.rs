//! Fiber identifier type

use core::fmt;

/// Opaque identifier of a fiber context
///
/// Derived from the context's address, so it is unique among live fibers
/// and totally ordered. The zero value is reserved as the "no fiber"
/// sentinel (used when a call site is not running inside the runtime).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(usize);

impl FiberId {
    /// Sentinel value indicating no fiber
    pub const NONE: FiberId = FiberId(0);

    /// Create an id from a raw context address
    #[inline]
    pub const fn from_raw(addr: usize) -> Self {
        FiberId(addr)
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Check if this identifies a live fiber
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(none)")
        } else {
            write!(f, "FiberId({:#x})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}
