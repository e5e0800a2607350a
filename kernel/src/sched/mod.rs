//! Scheduling and kernel context switching
//!
//! Round-robin over the ready queue with the idle PCB as the fallback,
//! preemption on clock ticks, delay bookkeeping for sleeping processes,
//! and the two save/restore operations built on the machine primitive:
//! `kc_switch` (suspend here, resume there) and `kc_copy` (seed a new
//! process with the caller's kernel state and a copy of its kernel stack).

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use crate::{
    bootstrap::Kernel,
    error::KernelResult,
    hal::{
        layout::{KSTACK_PAGES, KSTACK_START_PAGE},
        Machine, MachineRegister, TlbFlush,
    },
    mm::page_table::{KernelStackTable, PageProt, PageTableEntry},
    process::{Pid, ProcessState},
};

impl<M: Machine> Kernel<M> {
    /// Allocate the frames for a new kernel stack. Nothing is mapped; the
    /// entries are installed into region 0 when the owner is switched in.
    /// On exhaustion every frame allocated so far is returned.
    pub(crate) fn alloc_kernel_stack(&mut self) -> KernelResult<KernelStackTable> {
        let mut kstack = [PageTableEntry::default(); KSTACK_PAGES];
        let mut allocated: Vec<usize> = Vec::new();
        for entry in kstack.iter_mut() {
            match self.frames.alloc() {
                Ok(pfn) => {
                    *entry = PageTableEntry::mapped(pfn, PageProt::RW);
                    allocated.push(pfn);
                }
                Err(e) => {
                    for &pfn in &allocated {
                        self.frames.free(pfn);
                    }
                    return Err(e);
                }
            }
        }
        Ok(kstack)
    }

    /// Suspend `prev` and resume `next`.
    ///
    /// Saves the live kernel register state into `prev`, installs `next`'s
    /// kernel-stack pages at the well-known region 0 addresses, switches
    /// the region 1 base register, flushes the TLB and resumes from
    /// `next`'s saved kernel state. After this call the kernel is
    /// executing in `next`'s context.
    pub(crate) fn kc_switch(&mut self, prev: Pid, next: Pid) {
        log::trace!(target: "sched", "switch {} -> {}", prev, next);

        let ctx = self.hw.save_kernel_context();
        self.procs.pcb_mut(prev).kernel_context = ctx;

        let Some(kstack) = self.procs.pcb(next).kernel_stack else {
            panic!("switch target pid {next} has no kernel stack");
        };
        self.kspace.install_kernel_stack(&kstack);

        self.current = next;
        self.procs.pcb_mut(next).state = ProcessState::Running;

        let r1 = self.procs.pcb(next).region1.base_token();
        self.hw.write_register(MachineRegister::Ptbr1, r1);
        self.hw.flush_tlb(TlbFlush::All);

        let ctx = self.procs.pcb(next).kernel_context;
        self.hw.resume_kernel_context(&ctx);
    }

    /// Seed `new_pid` with the caller's kernel state: save the live kernel
    /// context into it, allocate its kernel stack if missing, and copy the
    /// current kernel-stack pages into its frames through the scratch
    /// page. The caller keeps running; `new_pid` wakes at the same kernel
    /// point on its own stack.
    pub(crate) fn kc_copy(&mut self, new_pid: Pid) -> KernelResult<()> {
        let ctx = self.hw.save_kernel_context();
        self.procs.pcb_mut(new_pid).kernel_context = ctx;

        let kstack = match self.procs.pcb(new_pid).kernel_stack {
            Some(kstack) => kstack,
            None => {
                let kstack = self.alloc_kernel_stack()?;
                self.procs.pcb_mut(new_pid).kernel_stack = Some(kstack);
                kstack
            }
        };
        for (i, entry) in kstack.iter().enumerate() {
            let src_pfn = self.kspace.entry(KSTACK_START_PAGE + i).pfn;
            self.kspace
                .map_scratch(&mut self.hw, entry.pfn)
                .copy_from_frame(src_pfn);
        }
        self.hw.flush_tlb(TlbFlush::KernelStack);
        Ok(())
    }

    /// Head of the ready queue, or idle when it is empty.
    pub(crate) fn next_runnable(&mut self) -> Pid {
        self.ready.dequeue(&mut self.procs).unwrap_or(self.idle)
    }

    /// Switch away from the current process after it blocked or exited.
    /// The caller has already moved it to the right queue and state.
    pub(crate) fn switch_from_current(&mut self) {
        let prev = self.current;
        let next = self.next_runnable();
        self.kc_switch(prev, next);
    }

    /// Move a blocked process to the ready queue, optionally depositing a
    /// syscall return value in its saved register 0.
    pub(crate) fn wake(&mut self, pid: Pid, retval: Option<isize>) {
        self.blocked.remove(&mut self.procs, pid);
        let pcb = self.procs.pcb_mut(pid);
        pcb.state = ProcessState::Ready;
        pcb.delay_ticks = None;
        if let Some(value) = retval {
            pcb.set_syscall_return(value);
        }
        self.ready.enqueue(&mut self.procs, pid);
        log::trace!(target: "sched", "woke pid {}", pid);
    }

    /// Clock tick: age every delaying process, wake the expired ones, then
    /// rotate the running process to the back of the ready queue.
    pub(crate) fn tick(&mut self) {
        for pid in self.blocked.pids(&self.procs) {
            let pcb = self.procs.pcb_mut(pid);
            let Some(remaining) = pcb.delay_ticks else {
                continue;
            };
            let remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                self.wake(pid, Some(0));
            } else {
                pcb.delay_ticks = Some(remaining);
            }
        }

        let prev = self.current;
        if prev != self.idle {
            self.procs.pcb_mut(prev).state = ProcessState::Ready;
            self.ready.enqueue(&mut self.procs, prev);
        }
        let next = self.next_runnable();
        self.kc_switch(prev, next);
    }

    /// Destroy PCBs whose final context switch has completed. Called at
    /// trap entry, when their kernel stacks are no longer live.
    pub(crate) fn reap_graveyard(&mut self) {
        let dead: Vec<Pid> = self.graveyard.drain(..).collect();
        for pid in dead {
            debug_assert_ne!(pid, self.current, "cannot reap the running process");
            self.destroy_pcb(pid);
        }
    }

    /// Free a PCB's frames and drop it from the process table. The caller
    /// has already detached it from every queue and from its parent.
    pub(crate) fn destroy_pcb(&mut self, pid: Pid) {
        let Some(pcb) = self.procs.remove(pid) else {
            return;
        };
        for (_, entry) in pcb.region1.valid_entries() {
            self.frames.free(entry.pfn);
        }
        if let Some(kstack) = pcb.kernel_stack {
            for entry in kstack {
                self.frames.free(entry.pfn);
            }
        }
        log::debug!(target: "sched", "destroyed pid {} ('{}')", pid, pcb.name);
    }
}
