//! Process control block

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{boxed::Box, string::String, vec::Vec};

use crate::{
    hal::{KernelContext, UserContext},
    mm::page_table::{KernelStackTable, Region1Table},
};

/// Process identifier, drawn from a monotone counter (idle = 0, init = 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state.
///
/// The tag must agree with queue membership: a `Ready` process sits in the
/// ready queue, a `Blocked` process in the blocked queue (plus at most one
/// synchronization-object queue), a `Defunct` process in the defunct queue
/// or on the graveyard. `Orphan` marks a process that exited with no
/// parent left to consume its status.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Currently executing.
    Running = 0,
    /// Runnable, waiting for the CPU.
    Ready = 1,
    /// Waiting for an event.
    Blocked = 2,
    /// Exited; status not yet collected by the parent.
    Defunct = 3,
    /// Exited with no status consumer.
    Orphan = 4,
}

/// Intrusive queue linkage. Both fields are `None` whenever the PCB is in
/// no queue; dequeue and remove null them so the PCB can be re-enqueued
/// elsewhere without cross-queue corruption.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct QueueLink {
    pub(crate) next: Option<Pid>,
    pub(crate) prev: Option<Pid>,
}

/// An in-flight read-like request (tty read, pipe read, wait): where the
/// result must land in the caller's region 1 and how much it asked for.
#[derive(Debug, Clone, Copy)]
pub struct PendingRead {
    /// User destination address.
    pub dest: usize,
    /// Requested length in bytes.
    pub len: usize,
}

/// Kernel-owned bytes staged on a PCB, copied into its region 1 by the
/// trap epilogue once that process's address space is active again.
#[derive(Debug, Clone)]
pub struct StagedBytes {
    /// User destination address.
    pub dest: usize,
    /// The bytes to deliver.
    pub bytes: Vec<u8>,
}

/// Process control block.
pub struct Pcb {
    /// Process id.
    pub pid: Pid,
    /// Human-readable name; appears in log lines only.
    pub name: String,
    /// Scheduling state.
    pub state: ProcessState,
    /// Region 1 page table, owned for the PCB's lifetime.
    pub region1: Box<Region1Table>,
    /// Kernel-stack page-table entries; `None` until `kc_copy` builds
    /// them.
    pub kernel_stack: Option<KernelStackTable>,
    /// Current heap break; `None` until the loader or first `brk` sets it.
    pub brk: Option<usize>,
    /// Saved user register state.
    pub user_context: UserContext,
    /// Saved kernel register state.
    pub kernel_context: KernelContext,
    /// Intrusive scheduler/sync queue linkage.
    pub(crate) link: QueueLink,
    /// Weak back-reference to the parent; nulled when the parent exits.
    pub parent: Option<Pid>,
    /// Live children, owned.
    pub children: Vec<Pid>,
    /// Remaining delay ticks; `None` when not delaying.
    pub delay_ticks: Option<usize>,
    /// Exit status, meaningful once defunct.
    pub exit_status: i32,
    /// Read-like request outstanding while blocked.
    pub pending_read: Option<PendingRead>,
    /// Result bytes awaiting copy-out to this process's region 1.
    pub staged_out: Option<StagedBytes>,
    /// Kernel-owned copy of a queued terminal write.
    pub tty_pending_write: Option<Vec<u8>>,
    /// Lock to re-acquire on behalf of this process when a condition
    /// variable wakes it.
    pub cvar_lock: Option<usize>,
}

impl Pcb {
    /// A fresh PCB with an empty region 1 and no kernel stack.
    pub fn new(pid: Pid, name: &str) -> Self {
        Self {
            pid,
            name: String::from(name),
            state: ProcessState::Ready,
            region1: Box::new(Region1Table::empty()),
            kernel_stack: None,
            brk: None,
            user_context: UserContext::default(),
            kernel_context: KernelContext::zeroed(),
            link: QueueLink::default(),
            parent: None,
            children: Vec::new(),
            delay_ticks: None,
            exit_status: 0,
            pending_read: None,
            staged_out: None,
            tty_pending_write: None,
            cvar_lock: None,
        }
    }

    /// Deposit a syscall return value in the saved register 0.
    pub fn set_syscall_return(&mut self, value: isize) {
        self.user_context.regs[0] = value as usize;
    }
}
