//! Context kind bitmask and launch policy

use core::fmt;
use core::ops::{BitAnd, BitOr};

/// Bitmask classifying a fiber context
///
/// A context may carry several bits: the main context is both `MAIN` and
/// `PINNED`, the dispatcher is both `DISPATCHER` and `PINNED`. Pinned
/// contexts must never migrate between schedulers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ContextKind(u8);

impl ContextKind {
    pub const NONE: ContextKind = ContextKind(0);
    pub const MAIN: ContextKind = ContextKind(1 << 0);
    pub const DISPATCHER: ContextKind = ContextKind(1 << 1);
    pub const WORKER: ContextKind = ContextKind(1 << 2);
    pub const PINNED: ContextKind = ContextKind(1 << 3);

    /// True if any of the bits in `kind` are set on `self`
    #[inline]
    pub const fn is_kind(self, kind: ContextKind) -> bool {
        self.0 & kind.0 != 0
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for ContextKind {
    type Output = ContextKind;

    #[inline]
    fn bitor(self, rhs: ContextKind) -> ContextKind {
        ContextKind(self.0 | rhs.0)
    }
}

impl BitAnd for ContextKind {
    type Output = ContextKind;

    #[inline]
    fn bitand(self, rhs: ContextKind) -> ContextKind {
        ContextKind(self.0 & rhs.0)
    }
}

impl fmt::Debug for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{}", s)
        };
        if self.is_kind(ContextKind::MAIN) {
            put(f, "main")?;
        }
        if self.is_kind(ContextKind::DISPATCHER) {
            put(f, "dispatcher")?;
        }
        if self.is_kind(ContextKind::WORKER) {
            put(f, "worker")?;
        }
        if self.is_kind(ContextKind::PINNED) {
            put(f, "pinned")?;
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// How a newly spawned fiber enters the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Launch {
    /// The fiber is enqueued as ready; the caller keeps running
    #[default]
    Post,

    /// The caller suspends and the fiber runs immediately; control returns
    /// to the caller when the fiber next yields or terminates
    Dispatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mask() {
        let main = ContextKind::MAIN | ContextKind::PINNED;
        assert!(main.is_kind(ContextKind::MAIN));
        assert!(main.is_kind(ContextKind::PINNED));
        assert!(!main.is_kind(ContextKind::WORKER));
        assert!(!ContextKind::NONE.is_kind(ContextKind::MAIN));
    }

    #[test]
    fn test_kind_debug() {
        let k = ContextKind::DISPATCHER | ContextKind::PINNED;
        assert_eq!(format!("{:?}", k), "dispatcher|pinned");
        assert_eq!(format!("{:?}", ContextKind::NONE), "none");
    }
}
