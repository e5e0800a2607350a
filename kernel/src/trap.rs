//! Trap dispatch
//!
//! The machine vectors every hardware event here. The table mirrors the
//! hardware's vector slots; unhandled slots fall through to a handler that
//! terminates the offending process. Every trap runs the same prologue
//! (reap the graveyard, snapshot the live user context into the current
//! PCB) and epilogue (flush staged bytes into the now-current process's
//! region 1, hand its saved user context back to the machine).

use crate::{
    bootstrap::Kernel,
    hal::{layout::is_region1_addr, Machine, MachineRegister, UserContext, TRAP_VECTOR_SIZE},
    syscall::SysOutcome,
};

/// What a vector slot dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapSlot {
    /// Kernel call (syscall).
    Kernel,
    /// Clock tick.
    Clock,
    /// Illegal instruction.
    Illegal,
    /// Memory fault.
    Memory,
    /// Arithmetic error.
    Math,
    /// Terminal received a line.
    TtyReceive,
    /// Terminal transmit completed.
    TtyTransmit,
    /// Disk interrupt (device not implemented).
    Disk,
    /// Default for uninstalled slots.
    NotHandled,
}

/// The trap vector table written to the machine's vector-base register.
pub struct TrapTable {
    slots: [TrapSlot; TRAP_VECTOR_SIZE],
}

impl TrapTable {
    /// A table with every slot unhandled.
    pub const fn new() -> Self {
        Self {
            slots: [TrapSlot::NotHandled; TRAP_VECTOR_SIZE],
        }
    }

    /// Install the standard handlers.
    pub fn install_standard(&mut self) {
        self.slots[0] = TrapSlot::Kernel;
        self.slots[1] = TrapSlot::Clock;
        self.slots[2] = TrapSlot::Illegal;
        self.slots[3] = TrapSlot::Memory;
        self.slots[4] = TrapSlot::Math;
        self.slots[5] = TrapSlot::TtyReceive;
        self.slots[6] = TrapSlot::TtyTransmit;
        self.slots[7] = TrapSlot::Disk;
    }

    /// Handler for `vector`; out-of-range vectors are unhandled.
    pub fn slot(&self, vector: usize) -> TrapSlot {
        self.slots
            .get(vector)
            .copied()
            .unwrap_or(TrapSlot::NotHandled)
    }
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Machine> Kernel<M> {
    /// Fill the vector table and point the machine at it.
    pub(crate) fn install_trap_table(&mut self) {
        self.trap_table.install_standard();
        let base = &self.trap_table as *const TrapTable as usize;
        self.hw.write_register(MachineRegister::VectorBase, base);
    }

    /// Entry point for every hardware trap.
    ///
    /// `vector` is the hardware vector index; `uctxt` is the live user
    /// context, which on return holds the context of whichever process is
    /// current.
    pub fn handle_trap(&mut self, vector: usize, uctxt: &mut UserContext) {
        self.reap_graveyard();
        self.procs.pcb_mut(self.current).user_context = *uctxt;

        match self.trap_table.slot(vector) {
            TrapSlot::Kernel => {
                if let SysOutcome::Complete(value) = self.dispatch_syscall() {
                    self.procs.pcb_mut(self.current).set_syscall_return(value);
                }
            }
            TrapSlot::Clock => self.tick(),
            TrapSlot::Memory => self.handle_memory_fault(uctxt.addr),
            TrapSlot::Illegal => {
                log::warn!(
                    target: "trap",
                    "pid {} executed an illegal instruction at {:#x}",
                    self.current,
                    uctxt.pc
                );
                let _ = self.terminate_current();
            }
            TrapSlot::Math => {
                log::warn!(target: "trap", "pid {} arithmetic fault at {:#x}", self.current, uctxt.pc);
                let _ = self.terminate_current();
            }
            TrapSlot::TtyReceive => self.tty_receive_trap(uctxt.code),
            TrapSlot::TtyTransmit => self.tty_transmit_trap(uctxt.code),
            TrapSlot::Disk | TrapSlot::NotHandled => {
                log::warn!(target: "trap", "unhandled trap vector {} from pid {}", vector, self.current);
                let _ = self.terminate_current();
            }
        }

        self.flush_staged_for_current();
        *uctxt = self.procs.pcb(self.current).user_context;
    }

    /// Memory fault: a region 1 address strictly below the stack floor
    /// and strictly above the break grows the stack; anything else is a
    /// segmentation fault.
    fn handle_memory_fault(&mut self, addr: usize) {
        let me = self.current;
        if is_region1_addr(addr) && self.is_below_stack_above_brk(me, addr) {
            if let Err(e) = self.grow_stack_to(me, addr) {
                log::warn!(target: "trap", "stack growth for pid {} failed: {}", me, e);
                let _ = self.terminate_current();
            }
        } else {
            log::warn!(target: "trap", "pid {} faulted on {:#x}; terminating", me, addr);
            let _ = self.terminate_current();
        }
    }

    /// Copy any staged result bytes into the current process's region 1.
    /// Runs after dispatch, when the right address space is active. A bad
    /// destination kills the staging process, in which case the process
    /// switched in next gets its own staging flushed.
    fn flush_staged_for_current(&mut self) {
        loop {
            let Some(staged) = self.procs.pcb_mut(self.current).staged_out.take() else {
                return;
            };
            match self.write_user_bytes(self.current, staged.dest, &staged.bytes) {
                Ok(()) => return,
                Err(e) => {
                    log::warn!(
                        target: "trap",
                        "staged copy-out to pid {} failed ({}); terminating it",
                        self.current,
                        e
                    );
                    let _ = self.terminate_current();
                }
            }
        }
    }
}
