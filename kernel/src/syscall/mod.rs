//! System call interface
//!
//! Syscall numbers, the dispatcher driven by the kernel-call trap, and the
//! outcome contract: a call either completes with a value for the caller's
//! register 0, or suspends: the caller has been blocked (or
//! terminated) and another process is current when the dispatcher returns.

mod process;

use crate::{
    bootstrap::Kernel,
    error::{KernelError, ERROR},
    hal::Machine,
    mm::user::check_user_range,
};

/// System call numbers, as delivered in the user context's trap code.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    // Process management
    Fork = 1,
    Exec = 2,
    Exit = 3,
    Wait = 4,
    GetPid = 5,
    Brk = 6,
    Delay = 7,

    // Terminal I/O
    TtyRead = 21,
    TtyWrite = 22,

    // Synchronization
    LockInit = 30,
    LockAcquire = 31,
    LockRelease = 32,
    CvarInit = 40,
    CvarWait = 41,
    CvarSignal = 42,
    CvarBroadcast = 43,
    PipeInit = 48,
    PipeRead = 49,
    PipeWrite = 50,
    Reclaim = 60,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, ()> {
        match value {
            1 => Ok(Self::Fork),
            2 => Ok(Self::Exec),
            3 => Ok(Self::Exit),
            4 => Ok(Self::Wait),
            5 => Ok(Self::GetPid),
            6 => Ok(Self::Brk),
            7 => Ok(Self::Delay),
            21 => Ok(Self::TtyRead),
            22 => Ok(Self::TtyWrite),
            30 => Ok(Self::LockInit),
            31 => Ok(Self::LockAcquire),
            32 => Ok(Self::LockRelease),
            40 => Ok(Self::CvarInit),
            41 => Ok(Self::CvarWait),
            42 => Ok(Self::CvarSignal),
            43 => Ok(Self::CvarBroadcast),
            48 => Ok(Self::PipeInit),
            49 => Ok(Self::PipeRead),
            50 => Ok(Self::PipeWrite),
            60 => Ok(Self::Reclaim),
            _ => Err(()),
        }
    }
}

/// What a syscall did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysOutcome {
    /// The call finished; deposit the value in the caller's register 0.
    Complete(isize),
    /// The caller blocked or was terminated; a different process is
    /// current and no return value is written here. Blocked callers get
    /// their register 0 set at the wake site.
    Suspended,
}

impl<M: Machine> Kernel<M> {
    /// Dispatch the kernel-call trap. The caller's user context has
    /// already been saved into its PCB; arguments are read from there.
    pub(crate) fn dispatch_syscall(&mut self) -> SysOutcome {
        let uc = self.procs.pcb(self.current).user_context;
        let Ok(call) = Syscall::try_from(uc.code) else {
            log::warn!(target: "syscall", "unknown syscall {} from pid {}", uc.code, self.current);
            return SysOutcome::Complete(ERROR);
        };
        log::trace!(target: "syscall", "pid {} -> {:?}", self.current, call);

        let (a0, a1, a2) = (uc.regs[0], uc.regs[1], uc.regs[2]);
        match call {
            Syscall::Fork => self.sys_fork(),
            Syscall::Exec => self.sys_exec(a0, a1),
            Syscall::Exit => self.sys_exit(a0 as isize as i32),
            Syscall::Wait => self.sys_wait(a0),
            Syscall::GetPid => SysOutcome::Complete(self.current.0 as isize),
            Syscall::Brk => self.sys_brk(a0),
            Syscall::Delay => self.sys_delay(a0 as isize),
            Syscall::TtyRead => self.sys_tty_read(a0, a1, a2 as isize),
            Syscall::TtyWrite => self.sys_tty_write(a0, a1, a2 as isize),
            Syscall::LockInit => self.out_ptr_call(a0, Self::sys_lock_init),
            Syscall::LockAcquire => self.sys_lock_acquire(a0),
            Syscall::LockRelease => self.sys_lock_release(a0),
            Syscall::CvarInit => self.out_ptr_call(a0, Self::sys_cvar_init),
            Syscall::CvarWait => self.sys_cvar_wait(a0, a1),
            Syscall::CvarSignal => self.sys_cvar_signal(a0),
            Syscall::CvarBroadcast => self.sys_cvar_broadcast(a0),
            Syscall::PipeInit => self.out_ptr_call(a0, Self::sys_pipe_init),
            Syscall::PipeRead => self.sys_pipe_read(a0, a1, a2 as isize),
            Syscall::PipeWrite => self.sys_pipe_write(a0, a1, a2 as isize),
            Syscall::Reclaim => self.sys_reclaim(a0),
        }
    }

    /// Validate an id out-pointer before running an init-style call. A
    /// bad pointer terminates the caller.
    fn out_ptr_call(&mut self, dest: usize, call: fn(&mut Self, usize) -> SysOutcome) -> SysOutcome {
        if let Err(e) = check_user_range(dest, core::mem::size_of::<u32>()) {
            return self.syscall_error(e);
        }
        call(self, dest)
    }

    /// Map a kernel error to the syscall boundary: bad user accesses kill
    /// the caller, everything recoverable becomes `ERROR` in register 0.
    pub(crate) fn syscall_error(&mut self, e: KernelError) -> SysOutcome {
        match e {
            KernelError::BadAccess { addr, len } => {
                log::warn!(
                    target: "syscall",
                    "pid {} passed bad pointer {:#x} (len {}); terminating",
                    self.current,
                    addr,
                    len
                );
                self.terminate_current()
            }
            KernelError::Fatal { .. } => SysOutcome::Suspended,
            other => {
                log::debug!(target: "syscall", "pid {} error: {}", self.current, other);
                SysOutcome::Complete(ERROR)
            }
        }
    }

    /// Kill the current process as if it called `exit(ERROR)`.
    pub(crate) fn terminate_current(&mut self) -> SysOutcome {
        self.sys_exit(ERROR as i32)
    }
}
