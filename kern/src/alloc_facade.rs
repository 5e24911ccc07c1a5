//! Allocator facade: the only code in this crate that touches [`tlsf::Heap`]
//! directly.
//!
//! [`tlsf::Heap`] is not reentrant-safe, so every entry point here masks
//! interrupts for the duration of the call — the allocator itself does no
//! locking, matching SPEC_FULL's statement that the heap is "protected by
//! interrupt masking only," not a spinlock or mutex.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tlsf::{BlockAllocator, Heap};

use crate::arch::{self, Arch};

static mut HEAP: Heap = Heap::empty();
static POOL_ADDED: AtomicBool = AtomicBool::new(false);

/// Out-of-memory errno, matching SPEC_FULL's hosted-build contract:
/// callers linking against a libc shim expect `errno == ENOMEM` after a
/// failed allocation, not just a null return.
pub const ENOMEM: i32 = 12;

static ERRNO: AtomicI32 = AtomicI32::new(0);

/// Reads the errno last set by an allocation failure on this facade.
pub fn errno() -> i32 {
    ERRNO.load(Ordering::Relaxed)
}

/// Registers `[mem, mem+len)` as heap backing storage. Called once at boot
/// per memory region the board support package hands the kernel.
///
/// # Safety
/// `mem` must be valid for `len` bytes for the remainder of the program and
/// must not alias any other pool or live allocation.
pub unsafe fn add_pool(mem: *mut u8, len: usize) {
    let irq = arch::Selected::disable_irq();
    HEAP.add_pool(mem, len);
    POOL_ADDED.store(true, Ordering::Relaxed);
    arch::Selected::restore_irq(irq);
}

pub fn malloc(size: usize) -> *mut u8 {
    let irq = arch::Selected::disable_irq();
    let p = unsafe { HEAP.malloc(size) };
    unsafe { arch::Selected::restore_irq(irq) };
    if p.is_null() {
        ERRNO.store(ENOMEM, Ordering::Relaxed);
    }
    p
}

/// Zero-initializing allocation. Uses `checked_mul` rather than a plain
/// `count * size` so a caller-supplied element count that would overflow
/// `usize` fails the allocation instead of wrapping into a too-small
/// request that then gets a successful, under-sized pointer returned to it
/// — the specific bug class upstream's own `calloc` avoids by the same
/// means.
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    let total = match count.checked_mul(size) {
        Some(t) => t,
        None => return core::ptr::null_mut(),
    };
    let p = malloc(total);
    if !p.is_null() {
        unsafe { core::ptr::write_bytes(p, 0, total) };
    }
    p
}

pub fn memalign(align: usize, size: usize) -> *mut u8 {
    let irq = arch::Selected::disable_irq();
    let p = unsafe { HEAP.memalign(align, size) };
    unsafe { arch::Selected::restore_irq(irq) };
    if p.is_null() {
        ERRNO.store(ENOMEM, Ordering::Relaxed);
    }
    p
}

/// # Safety
/// `ptr` must have come from `malloc`/`calloc`/`memalign`/`realloc` on this
/// facade and not already be freed.
pub unsafe fn free(ptr: *mut u8) {
    let irq = arch::Selected::disable_irq();
    HEAP.free(ptr);
    arch::Selected::restore_irq(irq);
}

/// # Safety
/// Same requirement as `free`, when `ptr` is non-null.
pub unsafe fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    let irq = arch::Selected::disable_irq();
    let p = HEAP.realloc(ptr, new_size);
    arch::Selected::restore_irq(irq);
    p
}

pub fn stats() -> (usize, usize) {
    let irq = arch::Selected::disable_irq();
    let stats = unsafe { (HEAP.bytes_used(), HEAP.bytes_free()) };
    unsafe { arch::Selected::restore_irq(irq) };
    stats
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::sync::Mutex;
    use std::vec;

    // The pool and `HEAP` are process-global; serialize tests against them.
    static LOCK: Mutex<()> = Mutex::new(());

    fn ensure_pool() {
        if !POOL_ADDED.load(Ordering::Relaxed) {
            let mem: &'static mut [u8] = Box::leak(vec![0u8; 1 << 16].into_boxed_slice());
            unsafe { add_pool(mem.as_mut_ptr(), mem.len()) };
        }
    }

    #[test]
    fn malloc_free_roundtrip() {
        let _guard = LOCK.lock().unwrap();
        ensure_pool();

        let p = malloc(128);
        assert!(!p.is_null());
        unsafe { free(p) };
    }

    #[test]
    fn calloc_zeroes_and_rejects_overflow() {
        let _guard = LOCK.lock().unwrap();
        ensure_pool();

        let p = calloc(16, 8);
        assert!(!p.is_null());
        for i in 0..128 {
            assert_eq!(unsafe { *p.add(i) }, 0);
        }
        unsafe { free(p) };

        assert!(calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn oom_sets_errno() {
        let _guard = LOCK.lock().unwrap();
        ensure_pool();

        ERRNO.store(0, Ordering::Relaxed);
        let p = malloc(1 << 20); // larger than the whole test pool
        assert!(p.is_null());
        assert_eq!(errno(), ENOMEM);
    }
}
