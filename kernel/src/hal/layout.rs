//! Memory layout of the simulated machine
//!
//! The machine exposes two software-loaded virtual regions: region 0 is
//! kernel-private and identity-mapped at boot, region 1 is the per-process
//! user region. The kernel stack occupies the top of region 0, with the
//! scratch page directly below it.

/// Log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Size of a virtual page and a physical frame (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Base of region 0 (kernel region).
pub const VMEM_0_BASE: usize = 0;

/// Size of region 0.
pub const VMEM_0_SIZE: usize = 0x10_0000;

/// First address past region 0.
pub const VMEM_0_LIMIT: usize = VMEM_0_BASE + VMEM_0_SIZE;

/// Number of pages in region 0.
pub const VMEM_0_PAGES: usize = VMEM_0_SIZE / PAGE_SIZE;

/// Base of region 1 (user region).
pub const VMEM_1_BASE: usize = VMEM_0_LIMIT;

/// Size of region 1.
pub const VMEM_1_SIZE: usize = 0x10_0000;

/// First address past region 1.
pub const VMEM_1_LIMIT: usize = VMEM_1_BASE + VMEM_1_SIZE;

/// Number of pages in a region 1 page table.
pub const NUM_R1_PAGES: usize = VMEM_1_SIZE / PAGE_SIZE;

/// Number of pages in a kernel stack.
pub const KSTACK_PAGES: usize = 2;

/// Total kernel stack size in bytes.
pub const KERNEL_STACK_MAXSIZE: usize = KSTACK_PAGES * PAGE_SIZE;

/// Lowest address of the kernel stack (top of region 0).
pub const KERNEL_STACK_BASE: usize = VMEM_0_LIMIT - KERNEL_STACK_MAXSIZE;

/// Region 0 page index of the first kernel stack page.
pub const KSTACK_START_PAGE: usize = KERNEL_STACK_BASE >> PAGE_SHIFT;

/// Virtual address of the scratch page, directly below the kernel stack.
///
/// The scratch page is remapped to arbitrary physical frames for
/// cross-address-space copies and must never be allocated to the heap.
pub const SCRATCH_ADDR: usize = KERNEL_STACK_BASE - PAGE_SIZE;

/// Region 0 page index of the scratch page.
pub const SCRATCH_PAGE: usize = SCRATCH_ADDR >> PAGE_SHIFT;

/// Highest region 0 page the kernel heap may grow to (inclusive).
pub const KERNEL_HEAP_MAX_PAGE: usize = SCRATCH_PAGE - 1;

/// Number of terminal devices attached to the machine.
pub const NUM_TERMINALS: usize = 4;

/// Maximum line length the terminal hardware delivers or accepts per
/// transmit.
pub const TERMINAL_MAX_LINE: usize = 1024;

/// Capacity of a pipe's circular byte buffer.
pub const PIPE_BUFFER_LEN: usize = 256;

/// Number of general-purpose registers in a [`UserContext`].
///
/// [`UserContext`]: super::UserContext
pub const GREGS: usize = 8;

/// Bytes reserved above the initial user stack pointer for the start-up
/// stub's first frame.
pub const INITIAL_STACK_FRAME_SIZE: usize = 64;

/// Entry point of the machine-provided idle stub.
///
/// The idle process never runs a loaded program; its saved program counter
/// points at a small routine the machine itself supplies, which loops
/// calling the pause primitive.
pub const IDLE_ENTRY: usize = 0x4000;

/// Whether `addr` lies inside region 1.
pub const fn is_region1_addr(addr: usize) -> bool {
    addr >= VMEM_1_BASE && addr < VMEM_1_LIMIT
}

/// Region 1 page index of a region 1 address.
pub const fn r1_page_index(addr: usize) -> usize {
    (addr - VMEM_1_BASE) >> PAGE_SHIFT
}

/// Virtual address of the start of a region 1 page.
pub const fn r1_page_addr(index: usize) -> usize {
    VMEM_1_BASE + (index << PAGE_SHIFT)
}

/// Round an address down to its page boundary.
pub const fn page_floor(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round an address up to the next page boundary.
pub const fn page_ceil(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
