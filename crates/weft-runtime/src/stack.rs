//! Fiber stack allocation
//!
//! Stacks are mmap'd regions with an optional PROT_NONE guard page at the
//! low end (stacks grow down). The pooled allocator keeps a LIFO free list
//! so hot spawn/terminate cycles reuse recently freed stacks.

use std::ptr::NonNull;
use std::sync::Arc;

use weft_core::error::{FiberResult, StackError};
use weft_core::spinlock::SpinLock;

/// Smallest stack the runtime will hand out
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default stack size when the caller does not specify one
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

#[inline]
fn page_size() -> usize {
    // sysconf cannot fail for _SC_PAGESIZE on supported platforms
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[inline]
fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Map a stack region of `size` usable bytes plus `guard` guard bytes
/// at the low end. Returns the base of the whole mapping.
fn map_stack(size: usize, guard: usize) -> Result<NonNull<u8>, StackError> {
    let total = size + guard;
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(StackError::AllocationFailed);
    }

    if guard > 0 {
        let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(StackError::ProtectionFailed);
        }
    }

    // Safety: mmap success implies non-null
    Ok(unsafe { NonNull::new_unchecked(base as *mut u8) })
}

fn unmap_stack(base: NonNull<u8>, total: usize) {
    unsafe {
        libc::munmap(base.as_ptr() as *mut libc::c_void, total);
    }
}

/// An owned fiber stack
///
/// Dropping the stack either returns it to its pool or unmaps it. The
/// runtime guarantees the drop happens only after the fiber on it has
/// made its final switch away.
pub struct FiberStack {
    base: NonNull<u8>,
    total: usize,
    pool: Option<Arc<StackPool>>,
}

// Safety: a stack is plain memory; ownership is unique
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Highest address of the usable region (stacks grow down from here)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.total) }
    }

    /// Size of the whole mapping including the guard
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        match self.pool.take() {
            Some(pool) => pool.recycle(self.base),
            None => unmap_stack(self.base, self.total),
        }
    }
}

/// Source of fiber stacks
pub trait StackAllocator {
    /// Allocate a stack for one fiber
    fn allocate(&self) -> FiberResult<FiberStack>;
}

/// Allocator mapping a fresh guard-paged stack per fiber
#[derive(Clone)]
pub struct MmapStackAllocator {
    size: usize,
    guard: usize,
}

impl MmapStackAllocator {
    /// Allocator for stacks of `size` usable bytes with one guard page
    pub fn new(size: usize) -> FiberResult<Self> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::SizeTooSmall.into());
        }
        let pg = page_size();
        Ok(MmapStackAllocator {
            size: round_up(size, pg),
            guard: pg,
        })
    }

    /// Allocator without a guard page (cheaper, no overflow detection)
    pub fn unguarded(size: usize) -> FiberResult<Self> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::SizeTooSmall.into());
        }
        Ok(MmapStackAllocator {
            size: round_up(size, page_size()),
            guard: 0,
        })
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.size
    }
}

impl Default for MmapStackAllocator {
    fn default() -> Self {
        // DEFAULT_STACK_SIZE is well above the minimum
        MmapStackAllocator::new(DEFAULT_STACK_SIZE).unwrap()
    }
}

impl StackAllocator for MmapStackAllocator {
    fn allocate(&self) -> FiberResult<FiberStack> {
        let base = map_stack(self.size, self.guard)?;
        Ok(FiberStack {
            base,
            total: self.size + self.guard,
            pool: None,
        })
    }
}

/// Shared free list behind `PooledStackAllocator`
struct StackPool {
    /// LIFO stack of mapping bases, most recently freed first
    free: SpinLock<Vec<NonNull<u8>>>,
    total: usize,
    guard: usize,
}

// Safety: the free list only holds bases of unused mappings
unsafe impl Send for StackPool {}
unsafe impl Sync for StackPool {}

impl StackPool {
    fn recycle(self: Arc<Self>, base: NonNull<u8>) {
        self.free.lock().push(base);
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        let mut free = self.free.lock();
        for base in free.drain(..) {
            unmap_stack(base, self.total);
        }
    }
}

/// Allocator reusing stacks through a LIFO free list
///
/// Recently freed stacks come back first, so a spawn-heavy workload keeps
/// hitting warm pages instead of the mmap path.
#[derive(Clone)]
pub struct PooledStackAllocator {
    pool: Arc<StackPool>,
    size: usize,
}

impl PooledStackAllocator {
    pub fn new(size: usize) -> FiberResult<Self> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::SizeTooSmall.into());
        }
        let pg = page_size();
        let size = round_up(size, pg);
        Ok(PooledStackAllocator {
            pool: Arc::new(StackPool {
                free: SpinLock::new(Vec::new()),
                total: size + pg,
                guard: pg,
            }),
            size,
        })
    }

    /// Number of stacks currently sitting in the free list
    pub fn pooled(&self) -> usize {
        self.pool.free.lock().len()
    }
}

impl StackAllocator for PooledStackAllocator {
    fn allocate(&self) -> FiberResult<FiberStack> {
        let reused = self.pool.free.lock().pop();
        let base = match reused {
            Some(base) => base,
            None => map_stack(self.size, self.pool.guard)?,
        };
        Ok(FiberStack {
            base,
            total: self.pool.total,
            pool: Some(Arc::clone(&self.pool)),
        })
    }
}
