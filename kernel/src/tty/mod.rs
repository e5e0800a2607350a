//! Terminal I/O
//!
//! Each terminal has a bounded input line buffer with a FIFO of blocked
//! readers, and a single in-flight transmit with a FIFO of queued writers.
//! Interrupt data is never written straight to user memory, since the wrong
//! address space is active; read results are staged on the receiving
//! PCB and copied out by the trap epilogue once that process runs again.
//! Write data is copied into kernel-owned buffers up front, so a queued
//! writer's user buffer may change before its turn comes.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{vec, vec::Vec};

use crate::{
    bootstrap::Kernel,
    error::ERROR,
    hal::{
        layout::{NUM_TERMINALS, TERMINAL_MAX_LINE},
        Machine,
    },
    mm::user::check_user_range,
    process::{PcbQueue, PendingRead, Pid, ProcessState, StagedBytes},
    syscall::SysOutcome,
};

/// Per-terminal state.
pub struct Terminal {
    /// FIFO of processes blocked reading.
    pub(crate) readers: PcbQueue,
    /// FIFO of processes queued behind the current writer.
    pub(crate) writers: PcbQueue,
    /// Buffered input, at most [`TERMINAL_MAX_LINE`] bytes.
    pub(crate) input: Vec<u8>,
    /// Kernel-owned outbound buffer for the in-flight transmission.
    pub(crate) outbound: Option<Vec<u8>>,
    /// How much of `outbound` has been handed to the device.
    pub(crate) outbound_pos: usize,
    /// Owner of the in-flight transmission.
    pub(crate) current_writer: Option<Pid>,
    /// Whether a transmission is outstanding. Busy implies
    /// `current_writer` is set.
    pub(crate) busy: bool,
}

impl Terminal {
    /// An idle terminal with nothing buffered.
    pub const fn new() -> Self {
        Self {
            readers: PcbQueue::new(),
            writers: PcbQueue::new(),
            input: Vec::new(),
            outbound: None,
            outbound_pos: 0,
            current_writer: None,
            busy: false,
        }
    }

    /// Buffered input bytes (test hook).
    pub fn buffered_input(&self) -> &[u8] {
        &self.input
    }

    /// Whether a transmission is outstanding.
    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Machine> Kernel<M> {
    /// `tty_read(id, buf, len)`: consume buffered input or block until a
    /// line arrives.
    pub(crate) fn sys_tty_read(&mut self, terminal: usize, buf: usize, len: isize) -> SysOutcome {
        let me = self.current;
        if terminal >= NUM_TERMINALS || len <= 0 {
            return SysOutcome::Complete(ERROR);
        }
        let len = len as usize;
        if let Err(e) = check_user_range(buf, len) {
            return self.syscall_error(e);
        }

        let tty = &mut self.ttys[terminal];
        if !tty.input.is_empty() {
            let n = len.min(tty.input.len());
            let data: Vec<u8> = tty.input.drain(..n).collect();
            // Staged like the interrupt path; the epilogue copies it out
            // before this trap returns to user mode.
            self.procs.pcb_mut(me).staged_out = Some(StagedBytes { dest: buf, bytes: data });
            return SysOutcome::Complete(n as isize);
        }

        tty.readers.enqueue(&mut self.procs, me);
        let pcb = self.procs.pcb_mut(me);
        pcb.pending_read = Some(PendingRead { dest: buf, len });
        pcb.state = ProcessState::Blocked;
        self.blocked.enqueue(&mut self.procs, me);
        log::trace!(target: "tty", "pid {} blocks reading terminal {}", me, terminal);
        self.switch_from_current();
        SysOutcome::Suspended
    }

    /// `tty_write(id, buf, len)`: transmit `len` bytes, blocking until the
    /// device has taken them all. Queued behind the current writer if the
    /// terminal is busy.
    pub(crate) fn sys_tty_write(&mut self, terminal: usize, buf: usize, len: isize) -> SysOutcome {
        let me = self.current;
        if terminal >= NUM_TERMINALS || len <= 0 {
            return SysOutcome::Complete(ERROR);
        }
        let len = len as usize;
        let data = match self.read_user_bytes(me, buf, len) {
            Ok(data) => data,
            Err(e) => return self.syscall_error(e),
        };

        if self.ttys[terminal].busy {
            log::trace!(target: "tty", "terminal {} busy; pid {} queued", terminal, me);
            self.procs.pcb_mut(me).tty_pending_write = Some(data);
            self.ttys[terminal].writers.enqueue(&mut self.procs, me);
        } else {
            self.ttys[terminal].busy = true;
            self.start_tty_write(terminal, me, data);
        }

        let pcb = self.procs.pcb_mut(me);
        pcb.state = ProcessState::Blocked;
        self.blocked.enqueue(&mut self.procs, me);
        self.switch_from_current();
        SysOutcome::Suspended
    }

    /// Begin transmitting `data` for `writer`: first chunk now, the rest
    /// from the transmit-interrupt handler.
    fn start_tty_write(&mut self, terminal: usize, writer: Pid, data: Vec<u8>) {
        let chunk = data.len().min(TERMINAL_MAX_LINE);
        self.hw.tty_transmit(terminal, &data[..chunk]);
        let tty = &mut self.ttys[terminal];
        tty.outbound = Some(data);
        tty.outbound_pos = chunk;
        tty.current_writer = Some(writer);
        log::trace!(
            target: "tty",
            "terminal {} transmit started for pid {} ({} bytes first chunk)",
            terminal,
            writer,
            chunk
        );
    }

    /// Receive interrupt: pull the pending line into the input buffer and
    /// complete the head reader, if any.
    pub(crate) fn tty_receive_trap(&mut self, terminal: usize) {
        if terminal >= NUM_TERMINALS {
            log::warn!(target: "tty", "receive interrupt for bad terminal {}", terminal);
            return;
        }
        let space = TERMINAL_MAX_LINE - self.ttys[terminal].input.len();
        if space > 0 {
            let mut line = vec![0u8; space];
            let n = self.hw.tty_receive(terminal, &mut line);
            self.ttys[terminal].input.extend_from_slice(&line[..n]);
        }

        let tty = &mut self.ttys[terminal];
        if tty.input.is_empty() {
            return;
        }
        let Some(reader) = tty.readers.dequeue(&mut self.procs) else {
            return;
        };
        let request = self.procs.pcb_mut(reader).pending_read.take();
        let want = request.map_or(0, |r| r.len);
        let n = want.min(tty.input.len());
        let data: Vec<u8> = tty.input.drain(..n).collect();
        if let Some(request) = request {
            self.procs.pcb_mut(reader).staged_out = Some(StagedBytes {
                dest: request.dest,
                bytes: data,
            });
        }
        self.wake(reader, Some(n as isize));
    }

    /// Transmit interrupt: feed the device the next chunk, or finish the
    /// current writer and start the next queued one.
    pub(crate) fn tty_transmit_trap(&mut self, terminal: usize) {
        if terminal >= NUM_TERMINALS {
            log::warn!(target: "tty", "transmit interrupt for bad terminal {}", terminal);
            return;
        }

        // More of the outbound buffer to send?
        let next_chunk = {
            let tty = &mut self.ttys[terminal];
            match &tty.outbound {
                Some(outbound) if tty.outbound_pos < outbound.len() => {
                    let chunk = (outbound.len() - tty.outbound_pos).min(TERMINAL_MAX_LINE);
                    Some((tty.outbound_pos, chunk))
                }
                Some(_) => None,
                None => {
                    log::warn!(
                        target: "tty",
                        "transmit interrupt with nothing outstanding on terminal {}",
                        terminal
                    );
                    return;
                }
            }
        };
        if let Some((pos, chunk)) = next_chunk {
            let piece: Vec<u8> = {
                let tty = &self.ttys[terminal];
                let outbound = tty.outbound.as_deref().unwrap_or(&[]);
                outbound[pos..pos + chunk].to_vec()
            };
            self.hw.tty_transmit(terminal, &piece);
            self.ttys[terminal].outbound_pos += chunk;
            return;
        }

        // Transmission complete: wake the writer with the full length.
        let (finished, total) = {
            let tty = &mut self.ttys[terminal];
            let total = tty.outbound.take().map_or(0, |b| b.len());
            tty.outbound_pos = 0;
            (tty.current_writer.take(), total)
        };
        match finished {
            Some(writer) => self.wake(writer, Some(total as isize)),
            None => log::warn!(target: "tty", "transmit finished with no writer"),
        }

        // Start the next queued writer or go idle.
        let next = self.ttys[terminal].writers.dequeue(&mut self.procs);
        match next {
            Some(writer) => {
                let data = self
                    .procs
                    .pcb_mut(writer)
                    .tty_pending_write
                    .take()
                    .unwrap_or_default();
                self.start_tty_write(terminal, writer, data);
            }
            None => self.ttys[terminal].busy = false,
        }
    }
}
