//! Ridgeline kernel library
//!
//! The process/memory/synchronization core of a small teaching kernel for
//! a simulated two-region machine. The machine itself (registers, TLB,
//! terminals, the save/restore primitive) sits behind the
//! [`hal::Machine`] trait; [`bootstrap::kernel_start`] boots the kernel on
//! it and [`Kernel::handle_trap`] is the entry for every hardware event
//! afterwards.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// On host targets (tests, embedding in a simulator process) the system
// allocator backs the kernel's own allocations; on bare metal the heap in
// `mm::heap` does, fed by `set_kernel_brk`.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod bootstrap;
pub mod error;
pub mod hal;
pub mod loader;
pub mod log_service;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trap;
pub mod tty;

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testutil;

pub use bootstrap::{kernel_start, Kernel};
pub use error::{KernelError, KernelResult, ERROR};
pub use hal::{
    sim::{SimEvent, SimMachine},
    KernelContext, Machine, MachineRegister, TlbFlush, TrapVector, UserContext,
};
pub use loader::{ExecHeader, ExecImageBuilder};
pub use mm::addr_space::KernelImage;
pub use process::{Pid, ProcessState};
pub use syscall::Syscall;
