//! Cross-thread scheduling: remote wake-ups, cross-thread mutex hand-off,
//! cross-thread join, sleep ordering

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::{spawn, yield_now, Condvar, Mutex};

#[test]
fn test_cross_thread_mutex_handoff() {
    // fiber B on thread T2 holds the mutex; fiber A on this thread
    // blocks on it; B's unlock must deliver A through the remote path
    let mutex = Arc::new(Mutex::new(0u32));
    let held = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let (m, h, r) = (mutex.clone(), held.clone(), release.clone());
    let t2 = std::thread::spawn(move || {
        let mut b = spawn(move || {
            let mut guard = m.lock().unwrap();
            *guard = 1;
            h.store(true, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                yield_now();
            }
            drop(guard);
        })
        .unwrap();
        b.join().unwrap();
    });

    // wait until B actually owns the mutex
    while !held.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    let m2 = mutex.clone();
    let mut a = spawn(move || {
        let mut guard = m2.lock().unwrap();
        // hand-off: ownership was ours before we ran
        *guard += 1;
    })
    .unwrap();

    // a helper fiber flips the release switch once A has had ample time
    // to block, so the unlock on T2 goes through the remote path
    let r2 = release.clone();
    let mut helper = spawn(move || {
        weft::sleep_for(Duration::from_millis(20));
        r2.store(true, Ordering::SeqCst);
    })
    .unwrap();

    a.join().unwrap();
    helper.join().unwrap();
    t2.join().unwrap();
    assert_eq!(*mutex.lock().unwrap(), 2);
}

#[test]
fn test_remote_condvar_notify() {
    // a plain OS thread (no fiber runtime of its own for the waiter's
    // scheduler) notifies a fiber blocked on this thread
    let mutex = Arc::new(Mutex::new(false));
    let cv = Arc::new(Condvar::new());
    let woken = Arc::new(AtomicBool::new(false));

    let (m, c, w) = (mutex.clone(), cv.clone(), woken.clone());
    let mut waiter = spawn(move || {
        let mut guard = m.lock().unwrap();
        while !*guard {
            guard = c.wait(guard).unwrap();
        }
        w.store(true, Ordering::SeqCst);
    })
    .unwrap();

    // let the waiter block before signalling
    for _ in 0..4 {
        yield_now();
    }

    let (m, c) = (mutex.clone(), cv.clone());
    let t2 = std::thread::spawn(move || {
        let mut b = spawn(move || {
            *m.lock().unwrap() = true;
            c.notify_one();
        })
        .unwrap();
        b.join().unwrap();
    });

    waiter.join().unwrap();
    t2.join().unwrap();
    assert!(woken.load(Ordering::SeqCst));
}

#[test]
fn test_cross_thread_join() {
    // the handle is Send; joining from another thread parks that
    // thread's main context and the terminating fiber wakes it remotely
    let gate = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    let g = gate.clone();
    let mut f = spawn(move || {
        while !g.load(Ordering::SeqCst) {
            yield_now();
        }
    })
    .unwrap();

    let d = done.clone();
    let t2 = std::thread::spawn(move || {
        f.join().unwrap();
        d.store(true, Ordering::SeqCst);
    });

    // keep this thread's scheduler turning while the other thread waits
    let start = Instant::now();
    while !done.load(Ordering::SeqCst) {
        if start.elapsed() > Duration::from_millis(50) {
            gate.store(true, Ordering::SeqCst);
        }
        yield_now();
    }
    t2.join().unwrap();
}

#[test]
fn test_sleep_wake_ordering() {
    // sleepers wake in non-decreasing deadline order
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut fibers = Vec::new();
    for (i, ms) in [(0u32, 30u64), (1, 10), (2, 20)] {
        let order = order.clone();
        fibers.push(
            spawn(move || {
                weft::sleep_for(Duration::from_millis(ms));
                order.lock().unwrap().push(i);
            })
            .unwrap(),
        );
    }
    for f in &mut fibers {
        f.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 0]);
}

#[test]
fn test_sleep_duration_respected() {
    let mut f = spawn(|| {
        let start = Instant::now();
        weft::sleep_for(Duration::from_millis(25));
        assert!(start.elapsed() >= Duration::from_millis(20));
    })
    .unwrap();
    f.join().unwrap();
}

#[test]
fn test_many_remote_wakes() {
    // hammer the remote-ready path: a remote thread repeatedly unlocks a
    // mutex our fiber is blocked on
    let rounds = 100;
    let mutex = Arc::new(Mutex::new(0u64));
    let turn = Arc::new(AtomicUsize::new(0)); // 0 = remote's turn, 1 = local's

    let (m, t) = (mutex.clone(), turn.clone());
    let t2 = std::thread::spawn(move || {
        let mut b = spawn(move || {
            for _ in 0..rounds {
                while t.load(Ordering::SeqCst) != 0 {
                    yield_now();
                }
                *m.lock().unwrap() += 1;
                t.store(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        b.join().unwrap();
    });

    let (m, t) = (mutex.clone(), turn.clone());
    let mut local = spawn(move || {
        for _ in 0..rounds {
            while t.load(Ordering::SeqCst) != 1 {
                yield_now();
            }
            *m.lock().unwrap() += 1;
            t.store(0, Ordering::SeqCst);
        }
    })
    .unwrap();

    local.join().unwrap();
    t2.join().unwrap();
    assert_eq!(*mutex.lock().unwrap(), 2 * rounds as u64);
}
