//! Default FIFO round-robin scheduling

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use super::Algorithm;
use crate::context::Context;
use crate::list::ReadyList;

/// FIFO round-robin: ready contexts run in the order they were awakened
///
/// Idle parking is a (mutex, condvar, flag) triple; `notify` sets the
/// flag so a wake-up arriving before the park is never lost.
pub struct RoundRobin {
    rqueue: UnsafeCell<ReadyList>,
    mtx: Mutex<bool>,
    cnd: Condvar,
}

// Safety: rqueue is touched only by the owning scheduler thread; the
// parking triple is thread-safe on its own.
unsafe impl Send for RoundRobin {}
unsafe impl Sync for RoundRobin {}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            rqueue: UnsafeCell::new(ReadyList::new()),
            mtx: Mutex::new(false),
            cnd: Condvar::new(),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        RoundRobin::new()
    }
}

impl Algorithm for RoundRobin {
    fn awakened(&self, ctx: NonNull<Context>) {
        unsafe { (*self.rqueue.get()).push(ctx.as_ptr()) };
    }

    fn pick_next(&self) -> Option<NonNull<Context>> {
        NonNull::new(unsafe { (*self.rqueue.get()).pop() })
    }

    fn has_ready_fibers(&self) -> bool {
        !unsafe { &*self.rqueue.get() }.is_empty()
    }

    fn suspend_until(&self, deadline: Option<Instant>) {
        let mut signaled = self.mtx.lock().expect("parking mutex poisoned");
        match deadline {
            None => {
                while !*signaled {
                    signaled = self.cnd.wait(signaled).expect("parking mutex poisoned");
                }
            }
            Some(tp) => {
                while !*signaled {
                    let now = Instant::now();
                    if now >= tp {
                        break;
                    }
                    let (guard, _timeout) = self
                        .cnd
                        .wait_timeout(signaled, tp - now)
                        .expect("parking mutex poisoned");
                    signaled = guard;
                }
            }
        }
        *signaled = false;
    }

    fn notify(&self) {
        let mut signaled = self.mtx.lock().expect("parking mutex poisoned");
        *signaled = true;
        drop(signaled);
        self.cnd.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_core::ContextKind;

    #[test]
    fn test_fifo_order() {
        let rr = RoundRobin::new();
        let a = Context::bare(ContextKind::WORKER);
        let b = Context::bare(ContextKind::WORKER);
        let pa = NonNull::from(&*a);
        let pb = NonNull::from(&*b);

        assert!(!rr.has_ready_fibers());
        rr.awakened(pa);
        rr.awakened(pb);
        assert!(rr.has_ready_fibers());
        assert_eq!(rr.pick_next(), Some(pa));
        assert_eq!(rr.pick_next(), Some(pb));
        assert_eq!(rr.pick_next(), None);
    }

    #[test]
    fn test_suspend_until_deadline() {
        let rr = RoundRobin::new();
        let start = Instant::now();
        rr.suspend_until(Some(start + Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_notify_before_park_not_lost() {
        let rr = RoundRobin::new();
        rr.notify();
        let start = Instant::now();
        // would park for a long time if the early notify were dropped
        rr.suspend_until(Some(start + Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_notify_wakes_parked_thread() {
        use std::sync::Arc;
        let rr = Arc::new(RoundRobin::new());
        let rr2 = Arc::clone(&rr);
        let start = Instant::now();
        let h = std::thread::spawn(move || {
            rr2.suspend_until(None);
        });
        std::thread::sleep(Duration::from_millis(20));
        rr.notify();
        h.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
