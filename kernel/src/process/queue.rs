//! Intrusive FIFO of PCBs
//!
//! Linkage lives inside the PCB (`next`/`prev` pids resolved through the
//! process table), so enqueue and dequeue are O(1) without allocation.
//! `remove` and `contains` walk the chain; queues are short. Dequeued and
//! removed PCBs get their links nulled so they can be re-enqueued on a
//! different queue without corrupting this one.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use super::{table::ProcessTable, Pid};

/// FIFO queue of PCBs, linked through the PCBs themselves.
#[derive(Debug, Clone, Copy)]
pub struct PcbQueue {
    head: Option<Pid>,
    tail: Option<Pid>,
    len: usize,
}

impl PcbQueue {
    /// An empty queue.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Whether the queue holds no PCBs.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of queued PCBs.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pid at the head, if any.
    pub fn head(&self) -> Option<Pid> {
        self.head
    }

    /// Append `pid` at the tail.
    pub fn enqueue(&mut self, procs: &mut ProcessTable, pid: Pid) {
        {
            let pcb = procs.pcb_mut(pid);
            debug_assert!(
                pcb.link.next.is_none() && pcb.link.prev.is_none(),
                "pid {pid} already linked into a queue"
            );
            pcb.link.prev = self.tail;
            pcb.link.next = None;
        }
        match self.tail {
            Some(tail) => procs.pcb_mut(tail).link.next = Some(pid),
            None => self.head = Some(pid),
        }
        self.tail = Some(pid);
        self.len += 1;
    }

    /// Detach and return the head.
    pub fn dequeue(&mut self, procs: &mut ProcessTable) -> Option<Pid> {
        let pid = self.head?;
        let next = procs.pcb(pid).link.next;
        self.head = next;
        match next {
            Some(next) => procs.pcb_mut(next).link.prev = None,
            None => self.tail = None,
        }
        let pcb = procs.pcb_mut(pid);
        pcb.link.next = None;
        pcb.link.prev = None;
        self.len -= 1;
        Some(pid)
    }

    /// Unlink `pid` from anywhere in the queue. Returns whether it was
    /// present.
    pub fn remove(&mut self, procs: &mut ProcessTable, pid: Pid) -> bool {
        if !self.contains(procs, pid) {
            return false;
        }
        let (prev, next) = {
            let link = &procs.pcb(pid).link;
            (link.prev, link.next)
        };
        match prev {
            Some(prev) => procs.pcb_mut(prev).link.next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => procs.pcb_mut(next).link.prev = prev,
            None => self.tail = prev,
        }
        let pcb = procs.pcb_mut(pid);
        pcb.link.next = None;
        pcb.link.prev = None;
        self.len -= 1;
        true
    }

    /// Whether `pid` is linked into this queue.
    pub fn contains(&self, procs: &ProcessTable, pid: Pid) -> bool {
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == pid {
                return true;
            }
            cursor = procs.pcb(current).link.next;
        }
        false
    }

    /// Snapshot of the queued pids, head first.
    pub fn pids(&self, procs: &ProcessTable) -> Vec<Pid> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(current) = cursor {
            out.push(current);
            cursor = procs.pcb(current).link.next;
        }
        out
    }
}

impl Default for PcbQueue {
    fn default() -> Self {
        Self::new()
    }
}
