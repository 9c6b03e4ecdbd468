//! Two fibers taking turns
//!
//! Demonstrates spawning, cooperative yielding and clean shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weft::{spawn, yield_now};

fn main() {
    let worker = std::thread::spawn(|| {
        let n = Arc::new(AtomicUsize::new(0));

        let mut fibers = Vec::new();
        for name in ["ping", "pong"] {
            let n = n.clone();
            fibers.push(
                spawn(move || {
                    for i in 0..5 {
                        println!("[{}] round {}", name, i);
                        n.fetch_add(1, Ordering::SeqCst);
                        yield_now();
                    }
                })
                .expect("spawn failed"),
            );
        }

        for f in &mut fibers {
            f.join().expect("join failed");
        }
        n.load(Ordering::SeqCst)
    });

    let total = worker.join().expect("worker thread panicked");
    println!("total rounds: {}", total);
}
