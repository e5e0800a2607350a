//! Mutex locks
//!
//! A lock is held by at most one process; contenders queue FIFO. Release
//! with waiters transfers ownership directly to the head waiter: the
//! releaser never suspends and no other contender can run in between, so
//! nobody can slip in ahead of the queue.

use crate::{
    bootstrap::Kernel,
    error::{KernelError, KernelResult, ERROR},
    hal::Machine,
    process::{PcbQueue, Pid, ProcessState},
    sync::LOCK_TAG,
    syscall::SysOutcome,
};

/// A mutual-exclusion lock.
pub struct Lock {
    /// Full id including the type tag.
    pub id: usize,
    /// Current holder; `None` means unheld, and unheld implies no
    /// waiters.
    pub holder: Option<Pid>,
    /// FIFO of blocked contenders.
    pub waiters: PcbQueue,
}

impl<M: Machine> Kernel<M> {
    /// `lock_init(&id)`: create a lock and write its id through the user
    /// out-pointer.
    pub(crate) fn sys_lock_init(&mut self, dest: usize) -> SysOutcome {
        let id = match self.sync.next_id(LOCK_TAG) {
            Ok(id) => id,
            Err(_) => return SysOutcome::Complete(ERROR),
        };
        self.sync.locks.insert(
            id,
            Lock {
                id,
                holder: None,
                waiters: PcbQueue::new(),
            },
        );
        let me = self.current;
        if let Err(e) = self.store_sync_id(me, dest, id) {
            self.sync.locks.remove(&id);
            return self.syscall_error(e);
        }
        log::debug!(target: "sync", "lock {:#x} created by pid {}", id, me);
        SysOutcome::Complete(0)
    }

    /// `lock_acquire(id)`: take the lock or block FIFO behind the holder.
    pub(crate) fn sys_lock_acquire(&mut self, id: usize) -> SysOutcome {
        let me = self.current;
        let Some(lock) = self.sync.locks.get_mut(&id) else {
            return SysOutcome::Complete(ERROR);
        };
        match lock.holder {
            None => {
                lock.holder = Some(me);
                log::trace!(target: "sync", "lock {:#x} acquired by pid {}", id, me);
                SysOutcome::Complete(0)
            }
            Some(holder) if holder == me => {
                // Re-acquiring a held lock would deadlock the caller.
                SysOutcome::Complete(ERROR)
            }
            Some(_) => {
                lock.waiters.enqueue(&mut self.procs, me);
                let pcb = self.procs.pcb_mut(me);
                pcb.state = ProcessState::Blocked;
                self.blocked.enqueue(&mut self.procs, me);
                log::trace!(target: "sync", "pid {} blocks on lock {:#x}", me, id);
                self.switch_from_current();
                SysOutcome::Suspended
            }
        }
    }

    /// `lock_release(id)`: release, handing ownership straight to the
    /// head waiter if there is one.
    pub(crate) fn sys_lock_release(&mut self, id: usize) -> SysOutcome {
        let me = self.current;
        match self.release_lock(me, id) {
            Ok(()) => SysOutcome::Complete(0),
            Err(e) => {
                log::debug!(target: "sync", "release of lock {:#x} failed: {}", id, e);
                SysOutcome::Complete(ERROR)
            }
        }
    }

    /// Release `id` on behalf of `owner`. On success a queued waiter, if
    /// any, already owns the lock and has been made ready with a
    /// successful return value.
    pub(crate) fn release_lock(&mut self, owner: Pid, id: usize) -> KernelResult<()> {
        let successor = {
            let lock = self.sync.locks.get_mut(&id).ok_or(KernelError::NotFound {
                what: "lock",
                id,
            })?;
            if lock.holder != Some(owner) {
                return Err(KernelError::NotOwner { id });
            }
            let successor = lock.waiters.dequeue(&mut self.procs);
            // Ownership transfers directly; acquire is not re-run.
            lock.holder = successor;
            successor
        };
        if let Some(next) = successor {
            self.wake(next, Some(0));
            log::trace!(
                target: "sync",
                "lock {:#x} transferred from pid {} to pid {}",
                id,
                owner,
                next
            );
        } else {
            log::trace!(target: "sync", "lock {:#x} released by pid {}", id, owner);
        }
        Ok(())
    }

    /// Grant `id` to `pid` if it is free, else queue `pid` on the lock.
    /// `pid` must already be blocked; when queued it simply stays blocked
    /// until the release-time handoff.
    pub(crate) fn grant_lock_or_enqueue(&mut self, pid: Pid, id: usize) -> KernelResult<()> {
        let lock = self.sync.locks.get_mut(&id).ok_or(KernelError::NotFound {
            what: "lock",
            id,
        })?;
        match lock.holder {
            None => {
                lock.holder = Some(pid);
                self.wake(pid, Some(0));
            }
            Some(_) => {
                lock.waiters.enqueue(&mut self.procs, pid);
            }
        }
        Ok(())
    }

    /// Destroy an unheld lock. An unheld lock has no waiters by
    /// invariant.
    pub(crate) fn reclaim_lock(&mut self, id: usize) -> KernelResult<()> {
        let lock = self.sync.locks.get(&id).ok_or(KernelError::NotFound {
            what: "lock",
            id,
        })?;
        if lock.holder.is_some() {
            return Err(KernelError::InvalidArg {
                what: "lock is still held",
            });
        }
        debug_assert!(lock.waiters.is_empty(), "unheld lock with waiters");
        self.sync.locks.remove(&id);
        Ok(())
    }
}
