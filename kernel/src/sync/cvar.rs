//! Condition variables
//!
//! `wait` releases the associated lock and blocks FIFO on the condition.
//! `signal` wakes the head waiter by re-acquiring the lock on its behalf:
//! if the lock is free the waiter owns it and becomes ready at once,
//! otherwise it joins the lock's waiter queue and the release-time handoff
//! finishes the job. Either way a woken waiter returns already holding the
//! lock.

use crate::{
    bootstrap::Kernel,
    error::{KernelError, KernelResult, ERROR},
    hal::Machine,
    process::{PcbQueue, Pid, ProcessState},
    sync::CVAR_TAG,
    syscall::SysOutcome,
};

/// A condition variable.
pub struct Cvar {
    /// Full id including the type tag.
    pub id: usize,
    /// FIFO of blocked waiters.
    pub waiters: PcbQueue,
}

impl<M: Machine> Kernel<M> {
    /// `cvar_init(&id)`: create a condition variable and write its id
    /// through the user out-pointer.
    pub(crate) fn sys_cvar_init(&mut self, dest: usize) -> SysOutcome {
        let id = match self.sync.next_id(CVAR_TAG) {
            Ok(id) => id,
            Err(_) => return SysOutcome::Complete(ERROR),
        };
        self.sync.cvars.insert(
            id,
            Cvar {
                id,
                waiters: PcbQueue::new(),
            },
        );
        let me = self.current;
        if let Err(e) = self.store_sync_id(me, dest, id) {
            self.sync.cvars.remove(&id);
            return self.syscall_error(e);
        }
        log::debug!(target: "sync", "cvar {:#x} created by pid {}", id, me);
        SysOutcome::Complete(0)
    }

    /// `cvar_wait(cvar, lock)`: release the lock and block on the
    /// condition; on wake-up the lock is held again.
    pub(crate) fn sys_cvar_wait(&mut self, cvar_id: usize, lock_id: usize) -> SysOutcome {
        let me = self.current;
        if !self.sync.cvars.contains_key(&cvar_id) {
            return SysOutcome::Complete(ERROR);
        }
        // The caller must hold the lock; releasing checks that, and on
        // failure the caller must not block.
        if let Err(e) = self.release_lock(me, lock_id) {
            log::debug!(target: "sync", "cvar wait without the lock: {}", e);
            return SysOutcome::Complete(ERROR);
        }

        let Some(cvar) = self.sync.cvars.get_mut(&cvar_id) else {
            return SysOutcome::Complete(ERROR);
        };
        cvar.waiters.enqueue(&mut self.procs, me);
        let pcb = self.procs.pcb_mut(me);
        pcb.state = ProcessState::Blocked;
        pcb.cvar_lock = Some(lock_id);
        self.blocked.enqueue(&mut self.procs, me);
        log::trace!(target: "sync", "pid {} waits on cvar {:#x}", me, cvar_id);
        self.switch_from_current();
        SysOutcome::Suspended
    }

    /// `cvar_signal(cvar)`: wake the head waiter, if any.
    pub(crate) fn sys_cvar_signal(&mut self, cvar_id: usize) -> SysOutcome {
        let Some(cvar) = self.sync.cvars.get_mut(&cvar_id) else {
            return SysOutcome::Complete(ERROR);
        };
        let waiter = cvar.waiters.dequeue(&mut self.procs);
        if let Some(pid) = waiter {
            self.finish_cvar_wake(pid);
        }
        SysOutcome::Complete(0)
    }

    /// `cvar_broadcast(cvar)`: wake every waiter; they serialize on the
    /// lock re-acquisition.
    pub(crate) fn sys_cvar_broadcast(&mut self, cvar_id: usize) -> SysOutcome {
        if !self.sync.cvars.contains_key(&cvar_id) {
            return SysOutcome::Complete(ERROR);
        }
        loop {
            let Some(cvar) = self.sync.cvars.get_mut(&cvar_id) else {
                break;
            };
            let Some(pid) = cvar.waiters.dequeue(&mut self.procs) else {
                break;
            };
            self.finish_cvar_wake(pid);
        }
        SysOutcome::Complete(0)
    }

    /// Complete a signalled waiter: re-acquire its lock on its behalf.
    fn finish_cvar_wake(&mut self, pid: Pid) {
        let lock_id = self.procs.pcb_mut(pid).cvar_lock.take();
        let granted = match lock_id {
            Some(lock_id) => self.grant_lock_or_enqueue(pid, lock_id),
            None => Err(KernelError::InvalidArg {
                what: "cvar waiter has no lock",
            }),
        };
        if granted.is_err() {
            // The lock vanished while the waiter slept; it wakes with an
            // error instead of the lock.
            self.wake(pid, Some(ERROR));
        }
    }

    /// Destroy a condition variable. Queued waiters are force-woken with
    /// `ERROR`.
    pub(crate) fn reclaim_cvar(&mut self, id: usize) -> KernelResult<()> {
        if !self.sync.cvars.contains_key(&id) {
            return Err(KernelError::NotFound { what: "cvar", id });
        }
        loop {
            let Some(cvar) = self.sync.cvars.get_mut(&id) else {
                break;
            };
            let Some(pid) = cvar.waiters.dequeue(&mut self.procs) else {
                break;
            };
            self.procs.pcb_mut(pid).cvar_lock = None;
            self.wake(pid, Some(ERROR));
        }
        self.sync.cvars.remove(&id);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use crate::{
        error::ERROR,
        process::ProcessState,
        syscall::SysOutcome,
        testutil::kernel_with_procs,
    };

    #[test]
    fn signal_with_free_lock_grants_it_to_the_waiter() {
        let (mut kernel, pids) = kernel_with_procs(2);
        let lock = kernel.lock_for_test();
        let cvar = kernel.cvar_for_test();
        let (a, b) = (pids[0], pids[1]);

        assert_eq!(kernel.sys_lock_acquire(lock), SysOutcome::Complete(0));
        assert_eq!(kernel.sys_cvar_wait(cvar, lock), SysOutcome::Suspended);
        assert_eq!(kernel.process_state(a), Some(ProcessState::Blocked));
        // The lock was released on entry to wait.
        assert_eq!(kernel.sync.locks[&lock].holder, None);
        assert_eq!(kernel.current_pid(), b);

        assert_eq!(kernel.sys_cvar_signal(cvar), SysOutcome::Complete(0));
        // a wakes already holding the lock.
        assert_eq!(kernel.sync.locks[&lock].holder, Some(a));
        assert_eq!(kernel.process_state(a), Some(ProcessState::Ready));
        assert_eq!(kernel.procs.pcb(a).user_context.regs[0], 0);
    }

    #[test]
    fn signal_with_held_lock_queues_the_waiter_on_the_lock() {
        let (mut kernel, pids) = kernel_with_procs(2);
        let lock = kernel.lock_for_test();
        let cvar = kernel.cvar_for_test();
        let (a, b) = (pids[0], pids[1]);

        assert_eq!(kernel.sys_lock_acquire(lock), SysOutcome::Complete(0));
        assert_eq!(kernel.sys_cvar_wait(cvar, lock), SysOutcome::Suspended);

        // b takes the lock, then signals.
        assert_eq!(kernel.current_pid(), b);
        assert_eq!(kernel.sys_lock_acquire(lock), SysOutcome::Complete(0));
        assert_eq!(kernel.sys_cvar_signal(cvar), SysOutcome::Complete(0));

        // a is off the cvar but still blocked, queued on the lock.
        assert!(kernel.sync.cvars[&cvar].waiters.is_empty());
        assert_eq!(kernel.sync.locks[&lock].waiters.pids(&kernel.procs), [a]);
        assert_eq!(kernel.process_state(a), Some(ProcessState::Blocked));

        // Release hands over and finally wakes a with the lock held.
        assert_eq!(kernel.sys_lock_release(lock), SysOutcome::Complete(0));
        assert_eq!(kernel.sync.locks[&lock].holder, Some(a));
        assert_eq!(kernel.process_state(a), Some(ProcessState::Ready));
    }

    #[test]
    fn broadcast_wakes_every_waiter_serialized_on_the_lock() {
        let (mut kernel, pids) = kernel_with_procs(3);
        let lock = kernel.lock_for_test();
        let cvar = kernel.cvar_for_test();

        // First two processes wait on the condition.
        for _ in 0..2 {
            let me = kernel.current_pid();
            assert_eq!(kernel.sys_lock_acquire(lock), SysOutcome::Complete(0));
            assert_eq!(kernel.sys_cvar_wait(cvar, lock), SysOutcome::Suspended);
            assert_eq!(kernel.process_state(me), Some(ProcessState::Blocked));
        }

        assert_eq!(kernel.current_pid(), pids[2]);
        assert_eq!(kernel.sys_cvar_broadcast(cvar), SysOutcome::Complete(0));

        // The first waiter owns the lock; the second queues on it.
        assert_eq!(kernel.sync.locks[&lock].holder, Some(pids[0]));
        assert_eq!(
            kernel.sync.locks[&lock].waiters.pids(&kernel.procs),
            [pids[1]]
        );
        assert_eq!(kernel.process_state(pids[0]), Some(ProcessState::Ready));
        assert_eq!(kernel.process_state(pids[1]), Some(ProcessState::Blocked));
    }

    #[test]
    fn wait_without_holding_the_lock_fails_without_blocking() {
        let (mut kernel, pids) = kernel_with_procs(1);
        let lock = kernel.lock_for_test();
        let cvar = kernel.cvar_for_test();

        assert_eq!(kernel.sys_cvar_wait(cvar, lock), SysOutcome::Complete(ERROR));
        assert_eq!(kernel.current_pid(), pids[0]);
        assert_eq!(kernel.process_state(pids[0]), Some(ProcessState::Running));
    }

    #[test]
    fn reclaim_force_wakes_waiters_with_error() {
        let (mut kernel, pids) = kernel_with_procs(2);
        let lock = kernel.lock_for_test();
        let cvar = kernel.cvar_for_test();
        let a = pids[0];

        assert_eq!(kernel.sys_lock_acquire(lock), SysOutcome::Complete(0));
        assert_eq!(kernel.sys_cvar_wait(cvar, lock), SysOutcome::Suspended);

        assert_eq!(kernel.sys_reclaim(cvar), SysOutcome::Complete(0));
        assert_eq!(kernel.process_state(a), Some(ProcessState::Ready));
        assert_eq!(kernel.procs.pcb(a).user_context.regs[0], ERROR as usize);
        // Reclaim again: the id is gone.
        assert_eq!(kernel.sys_reclaim(cvar), SysOutcome::Complete(ERROR));
    }
}
