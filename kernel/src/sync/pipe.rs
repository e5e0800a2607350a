//! Bounded byte pipes
//!
//! A pipe is a fixed-capacity circular byte buffer with a FIFO of blocked
//! readers and a FIFO of queued writes. A write that does not fully fit
//! stores a kernel-owned copy of its unplaced tail, so the writer's user
//! buffer may be unmapped or overwritten before the write completes. Reads
//! drain the ring and then replay queued writes in order, stopping at the
//! first one that still does not fit.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{collections::VecDeque, vec::Vec};

use crate::{
    bootstrap::Kernel,
    error::{KernelError, KernelResult, ERROR},
    hal::{layout::PIPE_BUFFER_LEN, Machine},
    mm::user::check_user_range,
    process::{PcbQueue, PendingRead, Pid, ProcessState, StagedBytes},
    sync::PIPE_TAG,
    syscall::SysOutcome,
};

/// A write blocked on a full pipe: the owner and the kernel-owned copy of
/// the bytes still to place.
pub(crate) struct PendingWrite {
    pub(crate) pid: Pid,
    pub(crate) bytes: Vec<u8>,
    /// Original request length, returned to the writer on completion.
    pub(crate) total_len: usize,
}

/// A bounded byte pipe.
pub struct Pipe {
    /// Full id including the type tag.
    pub id: usize,
    buffer: [u8; PIPE_BUFFER_LEN],
    read_index: usize,
    write_index: usize,
    bytes_available: usize,
    /// FIFO of processes blocked reading an empty pipe.
    pub readers: PcbQueue,
    /// FIFO of writes whose tails did not fit.
    pub(crate) pending_writes: VecDeque<PendingWrite>,
}

impl Pipe {
    /// An empty pipe.
    pub fn new(id: usize) -> Self {
        Self {
            id,
            buffer: [0; PIPE_BUFFER_LEN],
            read_index: 0,
            write_index: 0,
            bytes_available: 0,
            readers: PcbQueue::new(),
            pending_writes: VecDeque::new(),
        }
    }

    /// Bytes ready to read.
    pub fn available(&self) -> usize {
        self.bytes_available
    }

    /// Free capacity.
    pub fn space(&self) -> usize {
        PIPE_BUFFER_LEN - self.bytes_available
    }

    /// Current read position (ring arithmetic checks in tests).
    pub fn read_index(&self) -> usize {
        self.read_index
    }

    /// Current write position.
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// The ring invariant: `bytes_available` is congruent to
    /// `write_index - read_index` modulo the capacity and never exceeds
    /// it.
    pub fn ring_consistent(&self) -> bool {
        self.bytes_available <= PIPE_BUFFER_LEN
            && self.bytes_available % PIPE_BUFFER_LEN
                == (self.write_index + PIPE_BUFFER_LEN - self.read_index) % PIPE_BUFFER_LEN
    }

    fn push(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.space(), "pipe ring overflow");
        for &b in bytes {
            self.buffer[self.write_index] = b;
            self.write_index = (self.write_index + 1) % PIPE_BUFFER_LEN;
        }
        self.bytes_available += bytes.len();
    }

    fn pop(&mut self, n: usize) -> Vec<u8> {
        debug_assert!(n <= self.bytes_available, "pipe ring underflow");
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.buffer[self.read_index]);
            self.read_index = (self.read_index + 1) % PIPE_BUFFER_LEN;
        }
        self.bytes_available -= n;
        out
    }
}

impl<M: Machine> Kernel<M> {
    /// `pipe_init(&id)`: create a pipe and write its id through the user
    /// out-pointer.
    pub(crate) fn sys_pipe_init(&mut self, dest: usize) -> SysOutcome {
        let id = match self.sync.next_id(PIPE_TAG) {
            Ok(id) => id,
            Err(_) => return SysOutcome::Complete(ERROR),
        };
        self.sync.pipes.insert(id, Pipe::new(id));
        let me = self.current;
        if let Err(e) = self.store_sync_id(me, dest, id) {
            self.sync.pipes.remove(&id);
            return self.syscall_error(e);
        }
        log::debug!(target: "sync", "pipe {:#x} created by pid {}", id, me);
        SysOutcome::Complete(0)
    }

    /// `pipe_read(id, buf, len)`: read up to `len` bytes, blocking while
    /// the pipe is empty.
    pub(crate) fn sys_pipe_read(&mut self, id: usize, buf: usize, len: isize) -> SysOutcome {
        let me = self.current;
        if len <= 0 {
            return SysOutcome::Complete(ERROR);
        }
        let len = len as usize;
        if let Err(e) = check_user_range(buf, len) {
            return self.syscall_error(e);
        }
        let Some(pipe) = self.sync.pipes.get_mut(&id) else {
            return SysOutcome::Complete(ERROR);
        };

        if pipe.bytes_available == 0 {
            pipe.readers.enqueue(&mut self.procs, me);
            let pcb = self.procs.pcb_mut(me);
            pcb.pending_read = Some(PendingRead { dest: buf, len });
            pcb.state = ProcessState::Blocked;
            self.blocked.enqueue(&mut self.procs, me);
            log::trace!(target: "sync", "pid {} blocks reading pipe {:#x}", me, id);
            self.switch_from_current();
            return SysOutcome::Suspended;
        }

        let n = len.min(pipe.bytes_available);
        let data = pipe.pop(n);
        if let Err(e) = self.write_user_bytes(me, buf, &data) {
            return self.syscall_error(e);
        }
        self.drain_pipe_writers(id);
        SysOutcome::Complete(n as isize)
    }

    /// `pipe_write(id, buf, len)`: place what fits now; if a tail
    /// remains, stash a kernel-owned copy of it and block until readers
    /// make room.
    pub(crate) fn sys_pipe_write(&mut self, id: usize, buf: usize, len: isize) -> SysOutcome {
        let me = self.current;
        if len <= 0 {
            return SysOutcome::Complete(ERROR);
        }
        let len = len as usize;
        if !self.sync.pipes.contains_key(&id) {
            return SysOutcome::Complete(ERROR);
        }
        let data = match self.read_user_bytes(me, buf, len) {
            Ok(data) => data,
            Err(e) => return self.syscall_error(e),
        };

        // Place what fits; while a blocked reader can drain the ring,
        // deliver to it and keep placing. Earlier queued writes keep
        // their FIFO position: nothing is placed past them.
        let mut placed = 0usize;
        loop {
            let (reader_ready, fully_placed) = {
                let Some(pipe) = self.sync.pipes.get_mut(&id) else {
                    return SysOutcome::Complete(ERROR);
                };
                if pipe.pending_writes.is_empty() {
                    let n = (len - placed).min(pipe.space());
                    pipe.push(&data[placed..placed + n]);
                    placed += n;
                }
                (
                    !pipe.readers.is_empty() && pipe.bytes_available > 0,
                    placed == len,
                )
            };
            if reader_ready {
                self.deliver_to_waiting_reader(id);
                if fully_placed {
                    return SysOutcome::Complete(len as isize);
                }
                continue;
            }
            if fully_placed {
                return SysOutcome::Complete(len as isize);
            }
            break;
        }

        // The unplaced tail survives as a kernel-owned copy.
        if let Some(pipe) = self.sync.pipes.get_mut(&id) {
            pipe.pending_writes.push_back(PendingWrite {
                pid: me,
                bytes: data[placed..].to_vec(),
                total_len: len,
            });
        }
        let pcb = self.procs.pcb_mut(me);
        pcb.state = ProcessState::Blocked;
        self.blocked.enqueue(&mut self.procs, me);
        log::trace!(
            target: "sync",
            "pid {} blocks writing pipe {:#x} ({} of {} placed)",
            me,
            id,
            placed,
            len
        );
        self.switch_from_current();
        SysOutcome::Suspended
    }

    /// Complete the head blocked reader, if any: move bytes from the ring
    /// into its staging buffer, set its return value and make it ready,
    /// then replay queued writes into the freed space.
    fn deliver_to_waiting_reader(&mut self, id: usize) {
        let delivery = {
            let Some(pipe) = self.sync.pipes.get_mut(&id) else {
                return;
            };
            if pipe.bytes_available == 0 {
                return;
            }
            let Some(reader) = pipe.readers.dequeue(&mut self.procs) else {
                return;
            };
            let request = self.procs.pcb_mut(reader).pending_read.take();
            let want = request.map_or(0, |r| r.len);
            let n = want.min(pipe.bytes_available);
            let data = pipe.pop(n);
            (reader, request, data)
        };

        let (reader, request, data) = delivery;
        let n = data.len() as isize;
        if let Some(request) = request {
            self.procs.pcb_mut(reader).staged_out = Some(StagedBytes {
                dest: request.dest,
                bytes: data,
            });
        }
        self.wake(reader, Some(n));
        self.drain_pipe_writers(id);
    }

    /// Replay queued writes that now fit, FIFO, stopping at the first
    /// that still does not.
    fn drain_pipe_writers(&mut self, id: usize) {
        let mut woken: Vec<(Pid, usize)> = Vec::new();
        {
            let Some(pipe) = self.sync.pipes.get_mut(&id) else {
                return;
            };
            while let Some(front) = pipe.pending_writes.front() {
                if front.bytes.len() > pipe.space() {
                    break;
                }
                let Some(write) = pipe.pending_writes.pop_front() else {
                    break;
                };
                pipe.push(&write.bytes);
                woken.push((write.pid, write.total_len));
            }
        }
        for (pid, total_len) in woken {
            self.wake(pid, Some(total_len as isize));
        }
    }

    /// Destroy a pipe. Blocked readers and queued writers are force-woken
    /// with `ERROR`.
    pub(crate) fn reclaim_pipe(&mut self, id: usize) -> KernelResult<()> {
        if !self.sync.pipes.contains_key(&id) {
            return Err(KernelError::NotFound { what: "pipe", id });
        }
        loop {
            let Some(pipe) = self.sync.pipes.get_mut(&id) else {
                break;
            };
            let Some(reader) = pipe.readers.dequeue(&mut self.procs) else {
                break;
            };
            self.procs.pcb_mut(reader).pending_read = None;
            self.wake(reader, Some(ERROR));
        }
        let writers: Vec<Pid> = match self.sync.pipes.get_mut(&id) {
            Some(pipe) => pipe.pending_writes.drain(..).map(|w| w.pid).collect(),
            None => Vec::new(),
        };
        for pid in writers {
            self.wake(pid, Some(ERROR));
        }
        self.sync.pipes.remove(&id);
        Ok(())
    }
}
