//! Process table
//!
//! Owns every live PCB and hands out process ids from a monotone counter
//! (the id service of the original environment, folded in): the idle
//! process gets pid 0, init gets pid 1.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};

use super::{Pcb, Pid};

/// Arena of live PCBs keyed by pid.
pub struct ProcessTable {
    slots: BTreeMap<Pid, Box<Pcb>>,
    next_pid: u32,
}

impl ProcessTable {
    /// An empty table; the first created process receives pid 0.
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            next_pid: 0,
        }
    }

    /// Allocate a pid and create a fresh PCB under it.
    pub fn create(&mut self, name: &str) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.slots.insert(pid, Box::new(Pcb::new(pid, name)));
        pid
    }

    /// Look up a PCB.
    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.get(&pid).map(Box::as_ref)
    }

    /// Look up a PCB mutably.
    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots.get_mut(&pid).map(Box::as_mut)
    }

    /// The PCB for `pid`, which must be live. A missing pid is a kernel
    /// invariant violation.
    pub fn pcb(&self, pid: Pid) -> &Pcb {
        match self.get(pid) {
            Some(pcb) => pcb,
            None => panic!("pid {pid} not in process table"),
        }
    }

    /// Mutable counterpart of [`ProcessTable::pcb`].
    pub fn pcb_mut(&mut self, pid: Pid) -> &mut Pcb {
        match self.slots.get_mut(&pid) {
            Some(pcb) => pcb.as_mut(),
            None => panic!("pid {pid} not in process table"),
        }
    }

    /// Detach a PCB from the table, transferring ownership to the caller.
    pub fn remove(&mut self, pid: Pid) -> Option<Box<Pcb>> {
        self.slots.remove(&pid)
    }

    /// Whether `pid` is live.
    pub fn contains(&self, pid: Pid) -> bool {
        self.slots.contains_key(&pid)
    }

    /// Number of live processes.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no process is live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshot of all live pids, ascending.
    pub fn pids(&self) -> Vec<Pid> {
        self.slots.keys().copied().collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn pids_are_sequential_from_zero() {
        let mut procs = ProcessTable::new();
        assert_eq!(procs.create("idle"), Pid(0));
        assert_eq!(procs.create("init"), Pid(1));
        assert_eq!(procs.create("child"), Pid(2));
        assert_eq!(procs.len(), 3);
    }

    #[test]
    fn removal_frees_the_slot_but_not_the_pid() {
        let mut procs = ProcessTable::new();
        let a = procs.create("a");
        let removed = procs.remove(a).expect("a was live");
        assert_eq!(removed.pid, a);
        assert!(!procs.contains(a));
        // Pids are never reused.
        assert_eq!(procs.create("b"), Pid(1));
    }
}
