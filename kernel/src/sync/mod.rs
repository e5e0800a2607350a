//! Synchronization objects
//!
//! Mutex locks, condition variables and bounded byte pipes. Every object
//! draws its id from one namespace: the high bits carry a type tag and the
//! low bits a process-wide monotone counter, so a single reclaim entry
//! point can dispatch on the id alone.

pub mod cvar;
pub mod lock;
pub mod pipe;

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::collections::BTreeMap;

use crate::{
    bootstrap::Kernel,
    error::{KernelError, KernelResult, ERROR},
    hal::Machine,
    process::Pid,
    syscall::SysOutcome,
};

pub use cvar::Cvar;
pub use lock::Lock;
pub use pipe::Pipe;

/// Type-tag bits in a synchronization-object id.
pub const LOCK_TAG: usize = 0x1_0000;
/// Condition-variable tag.
pub const CVAR_TAG: usize = 0x2_0000;
/// Pipe tag.
pub const PIPE_TAG: usize = 0x3_0000;
/// Mask selecting the type tag.
pub const TYPE_MASK: usize = 0xF_0000;
/// Mask selecting the raw counter.
pub const RAW_ID_MASK: usize = 0xFFFF;

/// Kind of object an id names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Mutex lock.
    Lock,
    /// Condition variable.
    Cvar,
    /// Bounded byte pipe.
    Pipe,
}

/// Classify an id by its type bits.
pub fn kind_of(id: usize) -> Option<SyncKind> {
    match id & TYPE_MASK {
        LOCK_TAG => Some(SyncKind::Lock),
        CVAR_TAG => Some(SyncKind::Cvar),
        PIPE_TAG => Some(SyncKind::Pipe),
        _ => None,
    }
}

/// Owner of every live synchronization object, keyed by full id.
pub struct SyncRegistry {
    pub(crate) locks: BTreeMap<usize, Lock>,
    pub(crate) cvars: BTreeMap<usize, Cvar>,
    pub(crate) pipes: BTreeMap<usize, Pipe>,
    next_raw: usize,
}

impl SyncRegistry {
    /// An empty registry; raw ids start at 1.
    pub fn new() -> Self {
        Self {
            locks: BTreeMap::new(),
            cvars: BTreeMap::new(),
            pipes: BTreeMap::new(),
            next_raw: 1,
        }
    }

    /// Mint the next id under `tag`.
    pub(crate) fn next_id(&mut self, tag: usize) -> KernelResult<usize> {
        if self.next_raw > RAW_ID_MASK {
            return Err(KernelError::NoMemory {
                what: "synchronization ids",
            });
        }
        let id = tag | self.next_raw;
        self.next_raw += 1;
        Ok(id)
    }

    /// Number of live objects of every kind.
    pub fn live_count(&self) -> usize {
        self.locks.len() + self.cvars.len() + self.pipes.len()
    }
}

impl Default for SyncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Machine> Kernel<M> {
    /// Reclaim: destroy the object named by `id`, dispatching on its type
    /// bits. A held lock cannot be reclaimed; condition variables and
    /// pipes force-wake any queued waiter with `ERROR`.
    pub(crate) fn sys_reclaim(&mut self, id: usize) -> SysOutcome {
        let outcome = match kind_of(id) {
            Some(SyncKind::Lock) => self.reclaim_lock(id),
            Some(SyncKind::Cvar) => self.reclaim_cvar(id),
            Some(SyncKind::Pipe) => self.reclaim_pipe(id),
            None => Err(KernelError::InvalidArg {
                what: "id has no type tag",
            }),
        };
        match outcome {
            Ok(()) => SysOutcome::Complete(0),
            Err(e) => {
                log::debug!(target: "sync", "reclaim {:#x} failed: {}", id, e);
                SysOutcome::Complete(ERROR)
            }
        }
    }

    /// Write a freshly minted object id to the caller's out-pointer.
    pub(crate) fn store_sync_id(&mut self, pid: Pid, dest: usize, id: usize) -> KernelResult<()> {
        self.write_user_bytes(pid, dest, &(id as u32).to_le_bytes())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn type_bits_classify_ids() {
        let mut registry = SyncRegistry::new();
        let lock = registry.next_id(LOCK_TAG).expect("mint lock id");
        let cvar = registry.next_id(CVAR_TAG).expect("mint cvar id");
        let pipe = registry.next_id(PIPE_TAG).expect("mint pipe id");

        assert_eq!(kind_of(lock), Some(SyncKind::Lock));
        assert_eq!(kind_of(cvar), Some(SyncKind::Cvar));
        assert_eq!(kind_of(pipe), Some(SyncKind::Pipe));
        assert_eq!(kind_of(42), None);

        // Raw counters never repeat across kinds.
        assert_ne!(lock & RAW_ID_MASK, cvar & RAW_ID_MASK);
        assert_ne!(cvar & RAW_ID_MASK, pipe & RAW_ID_MASK);
    }
}
