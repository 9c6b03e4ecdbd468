//! Reduced skynet benchmark as a correctness test: a 10-ary spawn tree
//! where each leaf contributes its index; the total must match the
//! closed-form sum. The full million-fiber version lives in cmd/skynet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use weft::{Fiber, Launch, PooledStackAllocator};

fn skynet(alloc: &PooledStackAllocator, num: u64, size: u64, div: u64, acc: &Arc<AtomicU64>) {
    if size == 1 {
        acc.fetch_add(num, Ordering::Relaxed);
        return;
    }
    let sub = size / div;
    let mut children = Vec::with_capacity(div as usize);
    for i in 0..div {
        let alloc2 = alloc.clone();
        let acc2 = Arc::clone(acc);
        let sub_num = num + i * sub;
        children.push(
            Fiber::spawn_with(Launch::Dispatch, alloc, move || {
                skynet(&alloc2, sub_num, sub, div, &acc2);
            })
            .expect("spawn failed"),
        );
    }
    for mut child in children {
        child.join().expect("join failed");
    }
}

#[test]
fn test_skynet_reduced() {
    let alloc = PooledStackAllocator::new(32 * 1024).unwrap();
    let acc = Arc::new(AtomicU64::new(0));
    skynet(&alloc, 0, 1_000, 10, &acc);
    // sum of 0..999
    assert_eq!(acc.load(Ordering::SeqCst), 499_500);
}

#[test]
fn test_skynet_two_levels() {
    let alloc = PooledStackAllocator::new(32 * 1024).unwrap();
    let acc = Arc::new(AtomicU64::new(0));
    skynet(&alloc, 0, 100, 10, &acc);
    assert_eq!(acc.load(Ordering::SeqCst), 4_950);
}
