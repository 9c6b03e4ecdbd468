//! skynet microbenchmark
//!
//! Spawns a 10-ary tree of fibers down to one million leaves; each leaf
//! contributes its index and the root checks the closed-form total.
//! Based on https://github.com/atemerev/skynet

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use weft::{Fiber, Launch, PooledStackAllocator};

const SIZE: u64 = 1_000_000;
const DIV: u64 = 10;
const EXPECTED: u64 = 499_999_500_000;

fn skynet(alloc: &PooledStackAllocator, num: u64, size: u64, acc: &Arc<AtomicU64>) {
    if size == 1 {
        acc.fetch_add(num, Ordering::Relaxed);
        return;
    }
    let sub = size / DIV;
    let mut children = Vec::with_capacity(DIV as usize);
    for i in 0..DIV {
        let alloc2 = alloc.clone();
        let acc2 = Arc::clone(acc);
        let sub_num = num + i * sub;
        children.push(
            Fiber::spawn_with(Launch::Dispatch, alloc, move || {
                skynet(&alloc2, sub_num, sub, &acc2);
            })
            .expect("spawn failed"),
        );
    }
    for mut child in children {
        child.join().expect("join failed");
    }
}

fn main() {
    // run on a spawned thread so scheduler teardown is exercised too
    let worker = std::thread::spawn(|| {
        let alloc = PooledStackAllocator::new(32 * 1024).expect("allocator");
        let acc = Arc::new(AtomicU64::new(0));
        let start = Instant::now();
        skynet(&alloc, 0, SIZE, &acc);
        let elapsed = start.elapsed();
        (acc.load(Ordering::SeqCst), elapsed)
    });

    let (result, elapsed) = worker.join().expect("benchmark thread panicked");
    println!("skynet({}) = {} in {} ms", SIZE, result, elapsed.as_millis());
    if result != EXPECTED {
        eprintln!("invalid result: expected {}", EXPECTED);
        std::process::exit(1);
    }
}
