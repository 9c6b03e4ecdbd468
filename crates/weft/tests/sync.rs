//! Mutex, timed mutex and condition variable behavior on one scheduler

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::{spawn, yield_now, Condvar, FiberError, Mutex, TimedMutex};

#[test]
fn test_mutual_exclusion() {
    // N fibers hammer one mutex; the critical-section occupancy never
    // exceeds one and no increment is lost
    let mutex = Arc::new(Mutex::new(0u64));
    let inside = Arc::new(AtomicBool::new(false));
    let mut fibers = Vec::new();
    for _ in 0..8 {
        let mutex = mutex.clone();
        let inside = inside.clone();
        fibers.push(
            spawn(move || {
                for _ in 0..500 {
                    let mut guard = mutex.lock().unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst));
                    *guard += 1;
                    yield_now();
                    assert!(inside.swap(false, Ordering::SeqCst));
                    drop(guard);
                }
            })
            .unwrap(),
        );
    }
    for f in &mut fibers {
        f.join().unwrap();
    }
    assert_eq!(*mutex.lock().unwrap(), 8 * 500);
}

#[test]
fn test_mutex_relock_is_deadlock_error() {
    let mut f = spawn(|| {
        let mutex = Mutex::new(());
        let guard = mutex.lock().unwrap();
        assert_eq!(
            mutex.lock().map(|_| ()),
            Err(FiberError::DeadlockWouldOccur)
        );
        drop(guard);
    })
    .unwrap();
    f.join().unwrap();
}

#[test]
fn test_mutex_try_lock() {
    let mut f = spawn(|| {
        let mutex = Arc::new(Mutex::new(1u32));
        let guard = mutex.try_lock().unwrap();

        let m2 = mutex.clone();
        let mut contender = spawn(move || {
            assert_eq!(m2.try_lock().map(|_| ()), Err(FiberError::WouldBlock));
        })
        .unwrap();
        contender.join().unwrap();

        drop(guard);
        assert!(mutex.try_lock().is_ok());
    })
    .unwrap();
    f.join().unwrap();
}

#[test]
fn test_mutex_fifo_handoff() {
    // waiters acquire in the order they blocked
    let mutex = Arc::new(Mutex::new(()));
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let m = mutex.clone();
    let mut holder = spawn(move || {
        let guard = m.lock().unwrap();
        for _ in 0..8 {
            yield_now(); // let the contenders queue up
        }
        drop(guard);
    })
    .unwrap();

    let mut contenders = Vec::new();
    for i in 0..3u32 {
        let m = mutex.clone();
        let order = order.clone();
        contenders.push(
            spawn(move || {
                let _guard = m.lock().unwrap();
                order.lock().unwrap().push(i);
            })
            .unwrap(),
        );
        yield_now();
    }

    holder.join().unwrap();
    for f in &mut contenders {
        f.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_condvar_timeout_expires() {
    // a wait that is never notified returns timed-out at roughly the
    // deadline and leaves the wait queue empty
    let mut f = spawn(|| {
        let mutex = Mutex::new(());
        let cv = Condvar::new();
        let start = Instant::now();
        let guard = mutex.lock().unwrap();
        let (_guard, result) = cv.wait_for(guard, Duration::from_millis(50)).unwrap();
        let elapsed = start.elapsed();
        assert!(result.timed_out());
        assert!(elapsed >= Duration::from_millis(45), "woke early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "woke late: {:?}", elapsed);
    })
    .unwrap();
    f.join().unwrap();
}

#[test]
fn test_condvar_notify_one() {
    let mutex = Arc::new(Mutex::new(false));
    let cv = Arc::new(Condvar::new());
    let woken = Arc::new(AtomicUsize::new(0));

    let (m, c, w) = (mutex.clone(), cv.clone(), woken.clone());
    let mut waiter = spawn(move || {
        let mut guard = m.lock().unwrap();
        while !*guard {
            guard = c.wait(guard).unwrap();
        }
        w.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    // let the waiter block
    for _ in 0..4 {
        yield_now();
    }
    *mutex.lock().unwrap() = true;
    cv.notify_one();
    waiter.join().unwrap();
    assert_eq!(woken.load(Ordering::SeqCst), 1);
}

#[test]
fn test_condvar_notify_all_wakes_everyone() {
    let mutex = Arc::new(Mutex::new(false));
    let cv = Arc::new(Condvar::new());
    let woken = Arc::new(AtomicUsize::new(0));

    let mut waiters = Vec::new();
    for _ in 0..5 {
        let (m, c, w) = (mutex.clone(), cv.clone(), woken.clone());
        waiters.push(
            spawn(move || {
                let mut guard = m.lock().unwrap();
                while !*guard {
                    guard = c.wait(guard).unwrap();
                }
                drop(guard);
                w.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap(),
        );
    }

    for _ in 0..10 {
        yield_now();
    }
    *mutex.lock().unwrap() = true;
    cv.notify_all();
    for f in &mut waiters {
        f.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 5);
}

#[test]
fn test_condvar_notify_deadline_race() {
    // repeatedly race notify_one against an expiring timed wait; the
    // waiter must resume exactly once per round no matter who wins
    let rounds = 200usize;
    let mutex = Arc::new(Mutex::new(()));
    let cv = Arc::new(Condvar::new());
    let resumed = Arc::new(AtomicUsize::new(0));

    let (m, c, r) = (mutex.clone(), cv.clone(), resumed.clone());
    let mut waiter = spawn(move || {
        for _ in 0..rounds {
            let guard = m.lock().unwrap();
            let _ = c.wait_for(guard, Duration::from_millis(2)).unwrap();
            r.fetch_add(1, Ordering::SeqCst);
        }
    })
    .unwrap();

    // notify from another OS thread on roughly the same cadence as the
    // deadline, so both wake paths keep colliding
    let c2 = cv.clone();
    let notifier = std::thread::spawn(move || {
        for _ in 0..rounds {
            std::thread::sleep(Duration::from_millis(2));
            c2.notify_one();
        }
    });

    waiter.join().unwrap();
    notifier.join().unwrap();
    assert_eq!(resumed.load(Ordering::SeqCst), rounds);
}

#[test]
fn test_timed_mutex_timeout_and_acquire() {
    let mutex = Arc::new(TimedMutex::new(0u32));

    let m = mutex.clone();
    let mut holder = spawn(move || {
        let guard = m.lock().unwrap();
        weft::sleep_for(Duration::from_millis(40));
        drop(guard);
    })
    .unwrap();

    let m = mutex.clone();
    let mut contender = spawn(move || {
        yield_now(); // let the holder take the lock
        // too short: the holder sleeps 40ms
        let res = m.try_lock_for(Duration::from_millis(5)).map(|_| ());
        assert_eq!(res, Err(FiberError::WouldBlock));
        // long enough
        let mut guard = m.try_lock_for(Duration::from_millis(500)).unwrap();
        *guard = 7;
    })
    .unwrap();

    holder.join().unwrap();
    contender.join().unwrap();
    assert_eq!(*mutex.lock().unwrap(), 7);
}

#[test]
fn test_timed_mutex_uncontended_paths() {
    let mut f = spawn(|| {
        let mutex = TimedMutex::new(5u32);
        {
            let guard = mutex.try_lock().unwrap();
            assert_eq!(*guard, 5);
        }
        {
            let guard = mutex
                .try_lock_until(Instant::now() + Duration::from_millis(1))
                .unwrap();
            assert_eq!(*guard, 5);
        }
        let guard = mutex.lock().unwrap();
        assert_eq!(
            mutex.try_lock().map(|_| ()),
            Err(FiberError::DeadlockWouldOccur)
        );
        drop(guard);
    })
    .unwrap();
    f.join().unwrap();
}
