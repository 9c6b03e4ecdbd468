//! Intrusive context queues
//!
//! Links live inside `Context` as one prev/next pair per membership kind,
//! so queue operations never allocate and unlink is O(1). A context may be
//! on at most one list of each kind; push asserts virgin links.
//!
//! Thread rules: the ready, worker and terminated lists are touched only
//! by the owning scheduler thread. The remote-ready list is guarded by the
//! scheduler's remote spinlock, the sleep list by its sleep spinlock, and
//! every wait list by the owning primitive's spinlock.

use std::time::Instant;

use crate::context::Context;

macro_rules! intrusive_list {
    ($(#[$meta:meta])* $name:ident, $prev:ident, $next:ident) => {
        $(#[$meta])*
        pub(crate) struct $name {
            head: *mut Context,
            tail: *mut Context,
        }

        impl $name {
            pub(crate) const fn new() -> Self {
                $name {
                    head: std::ptr::null_mut(),
                    tail: std::ptr::null_mut(),
                }
            }

            #[inline]
            pub(crate) fn is_empty(&self) -> bool {
                self.head.is_null()
            }

            /// Append `c`; its links for this kind must be unset
            pub(crate) fn push(&mut self, c: *mut Context) {
                unsafe {
                    debug_assert!((*c).$prev.get().is_null());
                    debug_assert!((*c).$next.get().is_null());
                    if self.head.is_null() {
                        self.head = c;
                        self.tail = c;
                    } else {
                        (*c).$prev.set(self.tail);
                        (*self.tail).$next.set(c);
                        self.tail = c;
                    }
                }
            }

            /// Take the head, or null if empty
            pub(crate) fn pop(&mut self) -> *mut Context {
                if self.head.is_null() {
                    return std::ptr::null_mut();
                }
                let c = self.head;
                unsafe {
                    self.head = (*c).$next.get();
                    (*c).$next.set(std::ptr::null_mut());
                    if self.head.is_null() {
                        self.tail = std::ptr::null_mut();
                    } else {
                        (*self.head).$prev.set(std::ptr::null_mut());
                    }
                }
                c
            }

            /// Remove `c` wherever it is; no-op if it is not linked here
            pub(crate) fn unlink(&mut self, c: *mut Context) {
                unsafe {
                    let prev = (*c).$prev.get();
                    let next = (*c).$next.get();
                    if prev.is_null() && next.is_null() && self.head != c {
                        return;
                    }
                    if !prev.is_null() {
                        (*prev).$next.set(next);
                    } else {
                        self.head = next;
                    }
                    if !next.is_null() {
                        (*next).$prev.set(prev);
                    } else {
                        self.tail = prev;
                    }
                    (*c).$prev.set(std::ptr::null_mut());
                    (*c).$next.set(std::ptr::null_mut());
                }
            }
        }
    };
}

intrusive_list!(
    /// Runnable contexts, FIFO (owned by the scheduling algorithm)
    ReadyList, ready_prev, ready_next
);

intrusive_list!(
    /// All live worker contexts attached to a scheduler
    WorkerList, worker_prev, worker_next
);

intrusive_list!(
    /// Terminated contexts awaiting the dispatcher's drain
    TerminatedList, terminated_prev, terminated_next
);

intrusive_list!(
    /// Wake-ups arriving from other OS threads (remote spinlock held)
    RemoteReadyList, remote_prev, remote_next
);

impl RemoteReadyList {
    /// Exchange contents with `other` (used to drain under the lock)
    pub(crate) fn swap(&mut self, other: &mut RemoteReadyList) {
        std::mem::swap(&mut self.head, &mut other.head);
        std::mem::swap(&mut self.tail, &mut other.tail);
    }
}

/// Contexts sleeping until a deadline, sorted ascending by deadline
pub(crate) struct SleepList {
    head: *mut Context,
    tail: *mut Context,
}

impl SleepList {
    pub(crate) const fn new() -> Self {
        SleepList {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Insert `c` with wake deadline `tp`, keeping the list sorted.
    /// Equal deadlines preserve insertion order.
    pub(crate) fn push_sorted(&mut self, c: *mut Context, tp: Instant) {
        unsafe {
            debug_assert!((*c).sleep_prev.get().is_null());
            debug_assert!((*c).sleep_next.get().is_null());
            (*c).tp.set(Some(tp));

            // find the first entry with a later deadline
            let mut at = self.head;
            while !at.is_null() {
                match (*at).tp.get() {
                    Some(other) if other > tp => break,
                    _ => at = (*at).sleep_next.get(),
                }
            }

            if at.is_null() {
                // append
                if self.head.is_null() {
                    self.head = c;
                    self.tail = c;
                } else {
                    (*c).sleep_prev.set(self.tail);
                    (*self.tail).sleep_next.set(c);
                    self.tail = c;
                }
            } else {
                // insert before `at`
                let prev = (*at).sleep_prev.get();
                (*c).sleep_next.set(at);
                (*c).sleep_prev.set(prev);
                (*at).sleep_prev.set(c);
                if prev.is_null() {
                    self.head = c;
                } else {
                    (*prev).sleep_next.set(c);
                }
            }
        }
    }

    /// Head of the list if its deadline has been reached, without removing
    pub(crate) fn expired_head(&self, now: Instant) -> Option<*mut Context> {
        if self.head.is_null() {
            return None;
        }
        unsafe {
            match (*self.head).tp.get() {
                Some(tp) if tp <= now => Some(self.head),
                _ => None,
            }
        }
    }

    /// Earliest wake deadline, or None if nothing sleeps
    pub(crate) fn lowest_deadline(&self) -> Option<Instant> {
        if self.head.is_null() {
            return None;
        }
        unsafe { (*self.head).tp.get() }
    }

    /// Remove `c` and clear its deadline; no-op if it is not linked here
    pub(crate) fn unlink(&mut self, c: *mut Context) {
        unsafe {
            let prev = (*c).sleep_prev.get();
            let next = (*c).sleep_next.get();
            if prev.is_null() && next.is_null() && self.head != c {
                return;
            }
            if !prev.is_null() {
                (*prev).sleep_next.set(next);
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).sleep_prev.set(prev);
            } else {
                self.tail = prev;
            }
            (*c).sleep_prev.set(std::ptr::null_mut());
            (*c).sleep_next.set(std::ptr::null_mut());
            (*c).tp.set(None);
        }
    }
}

/// Contexts blocked on one object (a join target, mutex or condvar)
///
/// Each linked context records this list's address so the timed-wait
/// expiry path can remove it under the owner's lock from another vantage
/// point (see the wait-handshake in `sync`).
pub(crate) struct WaitList {
    head: *mut Context,
    tail: *mut Context,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        WaitList {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub(crate) fn head(&self) -> *mut Context {
        self.head
    }

    pub(crate) fn push(&mut self, c: *mut Context) {
        unsafe {
            debug_assert!((*c).wait_prev.get().is_null());
            debug_assert!((*c).wait_next.get().is_null());
            debug_assert!((*c).wait_list.get().is_null());
            (*c).wait_list.set(self as *mut WaitList);
            if self.head.is_null() {
                self.head = c;
                self.tail = c;
            } else {
                (*c).wait_prev.set(self.tail);
                (*self.tail).wait_next.set(c);
                self.tail = c;
            }
        }
    }

    pub(crate) fn pop(&mut self) -> *mut Context {
        if self.head.is_null() {
            return std::ptr::null_mut();
        }
        let c = self.head;
        unsafe {
            self.head = (*c).wait_next.get();
            (*c).wait_next.set(std::ptr::null_mut());
            if self.head.is_null() {
                self.tail = std::ptr::null_mut();
            } else {
                (*self.head).wait_prev.set(std::ptr::null_mut());
            }
            (*c).wait_list.set(std::ptr::null_mut());
        }
        c
    }

    /// Remove `c`; no-op unless it is linked on this list
    pub(crate) fn unlink(&mut self, c: *mut Context) {
        unsafe {
            if (*c).wait_list.get() != self as *mut WaitList {
                return;
            }
            let prev = (*c).wait_prev.get();
            let next = (*c).wait_next.get();
            if !prev.is_null() {
                (*prev).wait_next.set(next);
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).wait_prev.set(prev);
            } else {
                self.tail = prev;
            }
            (*c).wait_prev.set(std::ptr::null_mut());
            (*c).wait_next.set(std::ptr::null_mut());
            (*c).wait_list.set(std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx() -> Box<Context> {
        Context::bare(weft_core::ContextKind::WORKER)
    }

    #[test]
    fn test_push_pop_fifo() {
        let (a, b, c) = (ctx(), ctx(), ctx());
        let (pa, pb, pc) = (
            &*a as *const _ as *mut Context,
            &*b as *const _ as *mut Context,
            &*c as *const _ as *mut Context,
        );
        let mut list = ReadyList::new();
        assert!(list.is_empty());
        list.push(pa);
        list.push(pb);
        list.push(pc);
        assert_eq!(list.pop(), pa);
        assert_eq!(list.pop(), pb);
        assert_eq!(list.pop(), pc);
        assert!(list.pop().is_null());
        assert!(list.is_empty());
    }

    #[test]
    fn test_unlink_middle_and_ends() {
        let (a, b, c) = (ctx(), ctx(), ctx());
        let (pa, pb, pc) = (
            &*a as *const _ as *mut Context,
            &*b as *const _ as *mut Context,
            &*c as *const _ as *mut Context,
        );
        let mut list = ReadyList::new();
        list.push(pa);
        list.push(pb);
        list.push(pc);

        list.unlink(pb);
        assert_eq!(list.pop(), pa);
        assert_eq!(list.pop(), pc);

        // unlinking something not on the list is a no-op
        list.push(pa);
        list.unlink(pb);
        assert_eq!(list.pop(), pa);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remote_swap() {
        let a = ctx();
        let pa = &*a as *const _ as *mut Context;
        let mut src = RemoteReadyList::new();
        let mut dst = RemoteReadyList::new();
        src.push(pa);
        dst.swap(&mut src);
        assert!(src.is_empty());
        assert_eq!(dst.pop(), pa);
    }

    #[test]
    fn test_sleep_sorted() {
        let now = Instant::now();
        let (a, b, c) = (ctx(), ctx(), ctx());
        let (pa, pb, pc) = (
            &*a as *const _ as *mut Context,
            &*b as *const _ as *mut Context,
            &*c as *const _ as *mut Context,
        );
        let mut list = SleepList::new();
        list.push_sorted(pb, now + Duration::from_millis(20));
        list.push_sorted(pa, now + Duration::from_millis(10));
        list.push_sorted(pc, now + Duration::from_millis(30));

        assert_eq!(list.lowest_deadline(), Some(now + Duration::from_millis(10)));
        assert!(list.expired_head(now).is_none());

        let later = now + Duration::from_millis(25);
        assert_eq!(list.expired_head(later), Some(pa));
        list.unlink(pa);
        assert_eq!(list.expired_head(later), Some(pb));
        list.unlink(pb);
        assert!(list.expired_head(later).is_none());
        assert_eq!(list.lowest_deadline(), Some(now + Duration::from_millis(30)));
        list.unlink(pc);
        assert!(list.is_empty());
    }

    #[test]
    fn test_sleep_equal_deadlines_fifo() {
        let now = Instant::now();
        let tp = now + Duration::from_millis(5);
        let (a, b) = (ctx(), ctx());
        let (pa, pb) = (
            &*a as *const _ as *mut Context,
            &*b as *const _ as *mut Context,
        );
        let mut list = SleepList::new();
        list.push_sorted(pa, tp);
        list.push_sorted(pb, tp);
        assert_eq!(list.expired_head(tp), Some(pa));
        list.unlink(pa);
        list.unlink(pb);
    }

    #[test]
    fn test_wait_list_backpointer() {
        let a = ctx();
        let pa = &*a as *const _ as *mut Context;
        let mut list = WaitList::new();
        list.push(pa);
        assert_eq!(a.wait_list.get(), &mut list as *mut WaitList);
        list.unlink(pa);
        assert!(a.wait_list.get().is_null());
        assert!(list.is_empty());

        // unlink against the wrong list is a no-op
        let mut other = WaitList::new();
        list.push(pa);
        other.unlink(pa);
        assert_eq!(list.pop(), pa);
    }
}
