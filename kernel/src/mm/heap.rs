//! Kernel heap
//!
//! On bare-metal builds the kernel's own allocations (PCBs, staging
//! buffers, queued pipe writes) come from a linked-list heap carved out of
//! the region 0 pages between the original kernel break and the scratch
//! page; [`KernelSpace::set_kernel_brk`] is the growth hook that maps more
//! pages under it. Host builds route the same allocations to the system
//! allocator (see `lib.rs`), so this module is inert there.
//!
//! [`KernelSpace::set_kernel_brk`]: super::KernelSpace::set_kernel_brk

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Hand the initial heap window to the allocator.
///
/// # Safety
///
/// `start..start + size` must be mapped R-W in region 0, unused by anything
/// else, and remain mapped for the lifetime of the kernel.
#[cfg(target_os = "none")]
pub unsafe fn init(start: *mut u8, size: usize) {
    // SAFETY: forwarded verbatim; the caller guarantees the window is
    // mapped, exclusive and immortal.
    unsafe { KERNEL_HEAP.lock().init(start, size) }
}

/// Extend the heap after `set_kernel_brk` mapped more pages above it.
///
/// # Safety
///
/// The `by` bytes directly above the current heap end must have just been
/// mapped R-W and be unused by anything else.
#[cfg(target_os = "none")]
pub unsafe fn extend(by: usize) {
    // SAFETY: forwarded verbatim; the caller guarantees the new window.
    unsafe { KERNEL_HEAP.lock().extend(by) }
}

/// Bytes currently usable without another `set_kernel_brk`.
#[cfg(target_os = "none")]
pub fn free_bytes() -> usize {
    KERNEL_HEAP.lock().free()
}
