//! Process system calls: fork, exec, exit, wait, brk, delay
//!
//! `getpid` is answered directly by the dispatcher.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{string::String, vec::Vec};

use crate::{
    bootstrap::Kernel,
    error::{KernelError, KernelResult, ERROR},
    hal::{
        layout::{page_ceil, r1_page_addr, NUM_R1_PAGES, PAGE_SHIFT, VMEM_1_BASE, VMEM_1_LIMIT},
        Machine, MachineRegister, TlbFlush,
    },
    mm::{
        page_table::{PageProt, PageTableEntry},
        user::check_user_range,
    },
    process::{PendingRead, Pid, ProcessState, StagedBytes},
    syscall::SysOutcome,
};

impl<M: Machine> Kernel<M> {
    /// `fork()`: duplicate the current process. The parent gets the child
    /// pid; the child's saved context answers 0.
    pub(crate) fn sys_fork(&mut self) -> SysOutcome {
        let parent = self.current;
        let name = self.procs.pcb(parent).name.clone();
        let child = self.procs.create(&name);
        {
            let parent_pcb = self.procs.pcb(parent);
            let (uc, brk) = (parent_pcb.user_context, parent_pcb.brk);
            let pcb = self.procs.pcb_mut(child);
            pcb.parent = Some(parent);
            pcb.user_context = uc;
            pcb.brk = brk;
            // The child wakes from the same trap with fork() == 0.
            pcb.set_syscall_return(0);
        }

        if let Err(e) = self.copy_region1(parent, child) {
            self.destroy_pcb(child);
            log::warn!(target: "proc", "fork by pid {} failed: {}", parent, e);
            return SysOutcome::Complete(ERROR);
        }
        if let Err(e) = self.kc_copy(child) {
            self.destroy_pcb(child);
            log::warn!(target: "proc", "fork by pid {} failed: {}", parent, e);
            return SysOutcome::Complete(ERROR);
        }

        self.ready.enqueue(&mut self.procs, child);
        self.procs.pcb_mut(parent).children.push(child);

        // Make sure the parent's translation state is intact again.
        let r1 = self.procs.pcb(parent).region1.base_token();
        self.hw.write_register(MachineRegister::Ptbr1, r1);
        self.hw.flush_tlb(TlbFlush::All);

        log::info!(target: "proc", "pid {} forked pid {}", parent, child);
        SysOutcome::Complete(child.0 as isize)
    }

    /// Duplicate every valid region 1 page of `src` into fresh frames
    /// owned by `dst`, copying contents through the scratch page. On
    /// exhaustion the partial copy is torn down by the caller.
    fn copy_region1(&mut self, src: Pid, dst: Pid) -> KernelResult<()> {
        for page in 0..NUM_R1_PAGES {
            let src_pte = *self.procs.pcb(src).region1.entry(page);
            if !src_pte.valid {
                continue;
            }
            let pfn = self.frames.alloc()?;
            self.kspace
                .map_scratch(&mut self.hw, pfn)
                .copy_from_frame(src_pte.pfn);
            *self.procs.pcb_mut(dst).region1.entry_mut(page) =
                PageTableEntry::mapped(pfn, src_pte.prot);
        }
        Ok(())
    }

    /// `exec(filename, argv)`: replace the current image. On recoverable
    /// failure the old image keeps running and the call answers `ERROR`;
    /// after the commit point a failure terminates the process.
    pub(crate) fn sys_exec(&mut self, filename_ptr: usize, argv_ptr: usize) -> SysOutcome {
        let me = self.current;
        let filename = match self.read_user_cstring(me, filename_ptr) {
            Ok(name) => name,
            Err(e) => return self.syscall_error(e),
        };
        // Copy argv into kernel buffers up front: the loader wipes
        // region 1 before it builds the new stack, so these pointers die.
        let mut args: Vec<String> = Vec::new();
        if argv_ptr != 0 {
            let ptrs = match self.read_user_ptr_array(me, argv_ptr) {
                Ok(ptrs) => ptrs,
                Err(e) => return self.syscall_error(e),
            };
            for ptr in ptrs {
                match self.read_user_cstring(me, ptr) {
                    Ok(arg) => args.push(arg),
                    Err(e) => return self.syscall_error(e),
                }
            }
        }

        match self.load_program(me, &filename, &args) {
            Ok(()) => SysOutcome::Complete(0),
            Err(KernelError::UnrecoverableLoad) => {
                log::warn!(
                    target: "proc",
                    "exec of '{}' died after wiping pid {}; killing it",
                    filename,
                    me
                );
                self.terminate_current()
            }
            Err(e) => {
                log::warn!(target: "proc", "exec of '{}' failed: {}", filename, e);
                SysOutcome::Complete(ERROR)
            }
        }
    }

    /// `exit(status)`: finish the current process. Pid 1 exiting halts
    /// the machine.
    pub(crate) fn sys_exit(&mut self, status: i32) -> SysOutcome {
        let me = self.current;
        log::info!(target: "proc", "pid {} exits with status {}", me, status);
        if me == Pid(1) {
            self.hw.halt();
            return SysOutcome::Suspended;
        }
        self.procs.pcb_mut(me).exit_status = status;

        // Orphan the children: null the weak parent reference. A child
        // already defunct has lost its only status consumer and is
        // destroyed outright.
        let children = core::mem::take(&mut self.procs.pcb_mut(me).children);
        for child in children {
            if !self.procs.contains(child) {
                continue;
            }
            self.procs.pcb_mut(child).parent = None;
            if self.procs.pcb(child).state == ProcessState::Defunct {
                self.defunct.remove(&mut self.procs, child);
                self.procs.pcb_mut(child).state = ProcessState::Orphan;
                self.destroy_pcb(child);
            }
        }

        let parent = self.procs.pcb(me).parent;
        match parent {
            Some(parent_pid) if self.waiting_parent.contains(&self.procs, parent_pid) => {
                // Deliver the status straight to the waiting parent and
                // let wait complete at the wake site.
                self.waiting_parent.remove(&mut self.procs, parent_pid);
                let request = self.procs.pcb_mut(parent_pid).pending_read.take();
                if let Some(request) = request {
                    self.procs.pcb_mut(parent_pid).staged_out = Some(StagedBytes {
                        dest: request.dest,
                        bytes: status.to_le_bytes().to_vec(),
                    });
                }
                self.procs
                    .pcb_mut(parent_pid)
                    .children
                    .retain(|&c| c != me);
                self.wake(parent_pid, Some(me.0 as isize));

                // Reaped already; the PCB lives only until the switch
                // below completes.
                self.procs.pcb_mut(me).state = ProcessState::Defunct;
                self.graveyard.push(me);
            }
            Some(_) => {
                self.procs.pcb_mut(me).state = ProcessState::Defunct;
                self.defunct.enqueue(&mut self.procs, me);
            }
            None => {
                // Nobody will ever collect the status.
                self.procs.pcb_mut(me).state = ProcessState::Orphan;
                self.graveyard.push(me);
            }
        }

        self.switch_from_current();
        SysOutcome::Suspended
    }

    /// `wait(&status)`: reap a defunct child now, or block until one
    /// exits.
    pub(crate) fn sys_wait(&mut self, status_ptr: usize) -> SysOutcome {
        let me = self.current;
        if let Err(e) = check_user_range(status_ptr, core::mem::size_of::<i32>()) {
            return self.syscall_error(e);
        }
        if self.procs.pcb(me).children.is_empty() {
            return SysOutcome::Complete(ERROR);
        }

        let reapable = self
            .defunct
            .pids(&self.procs)
            .into_iter()
            .find(|&child| self.procs.pcb(child).parent == Some(me));
        if let Some(child) = reapable {
            let status = self.procs.pcb(child).exit_status;
            if let Err(e) = self.write_user_bytes(me, status_ptr, &status.to_le_bytes()) {
                return self.syscall_error(e);
            }
            self.defunct.remove(&mut self.procs, child);
            self.procs.pcb_mut(me).children.retain(|&c| c != child);
            self.destroy_pcb(child);
            log::debug!(target: "proc", "pid {} reaped pid {}", me, child);
            return SysOutcome::Complete(child.0 as isize);
        }

        // Block until a child's exit delivers its pid and status.
        let pcb = self.procs.pcb_mut(me);
        pcb.pending_read = Some(PendingRead {
            dest: status_ptr,
            len: core::mem::size_of::<i32>(),
        });
        pcb.state = ProcessState::Blocked;
        self.waiting_parent.enqueue(&mut self.procs, me);
        self.switch_from_current();
        SysOutcome::Suspended
    }

    /// `brk(addr)`: move the heap break, mapping or unmapping whole
    /// pages. Setting the break to its current value is a no-op.
    pub(crate) fn sys_brk(&mut self, addr: usize) -> SysOutcome {
        let me = self.current;
        if addr < VMEM_1_BASE || addr > VMEM_1_LIMIT {
            return SysOutcome::Complete(ERROR);
        }

        let new_brk_page = (page_ceil(addr) - VMEM_1_BASE) >> PAGE_SHIFT;
        let (current_brk_page, lowest_stack_page) = {
            let pcb = self.procs.pcb(me);
            let current = match pcb.brk {
                Some(brk) => (page_ceil(brk) - VMEM_1_BASE) >> PAGE_SHIFT,
                // First call: the heap starts at the first unmapped page.
                None => (0..NUM_R1_PAGES)
                    .find(|&p| !pcb.region1.entry(p).valid)
                    .unwrap_or(NUM_R1_PAGES),
            };
            (current, pcb.region1.lowest_stack_page())
        };

        // Keep one guard page between the heap and the stack.
        if let Some(stack_floor) = lowest_stack_page {
            if new_brk_page + 1 > stack_floor {
                log::debug!(target: "proc", "brk of pid {} would collide with the stack", me);
                return SysOutcome::Complete(ERROR);
            }
        }

        if new_brk_page > current_brk_page {
            let mut grown: Vec<usize> = Vec::new();
            for page in current_brk_page..new_brk_page {
                let pfn = match self.frames.alloc() {
                    Ok(pfn) => pfn,
                    Err(e) => {
                        let pcb = self.procs.pcb_mut(me);
                        for &p in &grown {
                            self.frames.free(pcb.region1.entry(p).pfn);
                            pcb.region1.entry_mut(p).invalidate();
                            self.hw.flush_tlb(TlbFlush::Page(r1_page_addr(p)));
                        }
                        log::warn!(target: "proc", "brk of pid {} failed: {}", me, e);
                        return SysOutcome::Complete(ERROR);
                    }
                };
                self.kspace.map_scratch(&mut self.hw, pfn).zero();
                *self.procs.pcb_mut(me).region1.entry_mut(page) =
                    PageTableEntry::mapped(pfn, PageProt::RW);
                grown.push(page);
            }
        } else {
            let pcb = self.procs.pcb_mut(me);
            for page in new_brk_page..current_brk_page {
                let entry = pcb.region1.entry_mut(page);
                if !entry.valid {
                    continue;
                }
                self.frames.free(entry.pfn);
                entry.invalidate();
                self.hw.flush_tlb(TlbFlush::Page(r1_page_addr(page)));
            }
        }

        self.procs.pcb_mut(me).brk = Some(addr);
        SysOutcome::Complete(0)
    }

    /// `delay(ticks)`: sleep for that many clock ticks.
    pub(crate) fn sys_delay(&mut self, ticks: isize) -> SysOutcome {
        if ticks < 0 {
            return SysOutcome::Complete(ERROR);
        }
        if ticks == 0 {
            return SysOutcome::Complete(0);
        }
        let me = self.current;
        let pcb = self.procs.pcb_mut(me);
        pcb.delay_ticks = Some(ticks as usize);
        pcb.state = ProcessState::Blocked;
        self.blocked.enqueue(&mut self.procs, me);
        log::trace!(target: "proc", "pid {} delays for {} ticks", me, ticks);
        self.switch_from_current();
        SysOutcome::Suspended
    }
}
