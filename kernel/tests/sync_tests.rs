//! Synchronization scenarios driven through the trap interface

mod common;

use common::*;
use ridgeline_kernel::{
    hal::layout::PIPE_BUFFER_LEN, Pid, ProcessState, Syscall, ERROR,
};

/// Boot, then fork a child of init; returns (kernel, init, child) with
/// init current.
fn boot_with_two() -> (ridgeline_kernel::Kernel<ridgeline_kernel::SimMachine>, Pid, Pid) {
    let (mut kernel, _) = boot_default();
    let init = Pid(1);
    run_until_current(&mut kernel, init);
    let uctxt = syscall(&mut kernel, Syscall::Fork, [0, 0, 0]);
    let child = Pid(uctxt.regs[0] as u32);
    (kernel, init, child)
}

#[test]
fn lock_handoff_timeline() {
    let (mut kernel, parent, child) = boot_with_two();

    // Parent creates and acquires the lock.
    let uctxt = syscall(&mut kernel, Syscall::LockInit, [USER_BUF, 0, 0]);
    assert_eq!(uctxt.regs[0], 0);
    let lock = read_id(&kernel, parent, USER_BUF);
    assert_ne!(lock, 0);
    let uctxt = syscall(&mut kernel, Syscall::LockAcquire, [lock, 0, 0]);
    assert_eq!(uctxt.regs[0], 0);

    // Parent delays; child runs and blocks acquiring.
    syscall(&mut kernel, Syscall::Delay, [5, 0, 0]);
    run_until_current(&mut kernel, child);
    syscall(&mut kernel, Syscall::LockAcquire, [lock, 0, 0]);
    assert_eq!(kernel.process_state(child), Some(ProcessState::Blocked));

    // Parent's delay expires; it releases and the lock transfers
    // directly to the child.
    run_until_current(&mut kernel, parent);
    let uctxt = syscall(&mut kernel, Syscall::LockRelease, [lock, 0, 0]);
    assert_eq!(uctxt.regs[0], 0);
    assert_eq!(kernel.process_state(child), Some(ProcessState::Ready));

    // The child resumes from the blocked acquire with success.
    run_until_current(&mut kernel, child);
    assert_eq!(
        kernel.process(child).expect("child").user_context.regs[0],
        0
    );

    // Both release attempts by a non-owner fail.
    run_until_current(&mut kernel, parent);
    let uctxt = syscall(&mut kernel, Syscall::LockRelease, [lock, 0, 0]);
    assert_eq!(uctxt.regs[0], ERROR as usize);
}

#[test]
fn cvar_wait_and_signal_timeline() {
    let (mut kernel, parent, child) = boot_with_two();

    // Parent: lock_init, cvar_init, acquire, cvar_wait.
    syscall(&mut kernel, Syscall::LockInit, [USER_BUF, 0, 0]);
    let lock = read_id(&kernel, parent, USER_BUF);
    syscall(&mut kernel, Syscall::CvarInit, [USER_BUF2, 0, 0]);
    let cvar = read_id(&kernel, parent, USER_BUF2);
    syscall(&mut kernel, Syscall::LockAcquire, [lock, 0, 0]);
    syscall(&mut kernel, Syscall::CvarWait, [cvar, lock, 0]);
    assert_eq!(kernel.process_state(parent), Some(ProcessState::Blocked));

    // Child delays a while, then signals.
    run_until_current(&mut kernel, child);
    syscall(&mut kernel, Syscall::Delay, [5, 0, 0]);
    for _ in 0..5 {
        clock_tick(&mut kernel);
    }
    assert_eq!(kernel.process_state(parent), Some(ProcessState::Blocked));
    run_until_current(&mut kernel, child);
    let uctxt = syscall(&mut kernel, Syscall::CvarSignal, [cvar, 0, 0]);
    assert_eq!(uctxt.regs[0], 0);

    // The parent wakes holding the lock.
    assert_eq!(kernel.process_state(parent), Some(ProcessState::Ready));
    run_until_current(&mut kernel, parent);
    assert_eq!(
        kernel.process(parent).expect("parent").user_context.regs[0],
        0
    );
    let uctxt = syscall(&mut kernel, Syscall::LockRelease, [lock, 0, 0]);
    assert_eq!(uctxt.regs[0], 0, "parent held the lock after cvar_wait");
}

#[test]
fn pipe_transfers_bytes_between_processes() {
    let (mut kernel, parent, child) = boot_with_two();

    syscall(&mut kernel, Syscall::PipeInit, [USER_BUF, 0, 0]);
    let pipe = read_id(&kernel, parent, USER_BUF);

    // Parent blocks reading the empty pipe.
    syscall(&mut kernel, Syscall::PipeRead, [pipe, USER_BUF2, 32]);
    assert_eq!(kernel.process_state(parent), Some(ProcessState::Blocked));

    // Child writes; the parent is completed at wake time.
    run_until_current(&mut kernel, child);
    kernel
        .write_user_bytes(child, USER_BUF, b"through the pipe")
        .expect("seed child buffer");
    let uctxt = syscall(&mut kernel, Syscall::PipeWrite, [pipe, USER_BUF, 16]);
    assert_eq!(uctxt.regs[0], 16);
    assert_eq!(kernel.process_state(parent), Some(ProcessState::Ready));

    // When the parent runs again its buffer holds the bytes and its
    // return register the count.
    run_until_current(&mut kernel, parent);
    assert_eq!(
        kernel.process(parent).expect("parent").user_context.regs[0],
        16
    );
    assert_eq!(
        kernel
            .read_user_bytes(parent, USER_BUF2, 16)
            .expect("delivered bytes"),
        b"through the pipe"
    );
}

#[test]
fn pipe_blocking_write_scenario() {
    let (mut kernel, parent, child) = boot_with_two();

    syscall(&mut kernel, Syscall::PipeInit, [USER_BUF, 0, 0]);
    let pipe = read_id(&kernel, parent, USER_BUF);

    // The writer needs a buffer bigger than a page offset allows in bss:
    // PIPE_BUFFER_LEN + 19 bytes fits fine at USER_BUF.
    let total = PIPE_BUFFER_LEN + 19;
    let payload: Vec<u8> = (0..total).map(|i| (i % 240) as u8).collect();
    kernel
        .write_user_bytes(parent, USER_BUF2, &payload)
        .expect("seed writer");

    // The first PIPE_BUFFER_LEN bytes go immediately; the writer blocks.
    syscall(&mut kernel, Syscall::PipeWrite, [pipe, USER_BUF2, total]);
    assert_eq!(kernel.process_state(parent), Some(ProcessState::Blocked));

    // Reader drains the buffer: the queued tail is placed and the writer
    // wakes with the full length.
    run_until_current(&mut kernel, child);
    let uctxt = syscall(&mut kernel, Syscall::PipeRead, [pipe, USER_BUF, PIPE_BUFFER_LEN]);
    assert_eq!(uctxt.regs[0], PIPE_BUFFER_LEN);
    assert_eq!(kernel.process_state(parent), Some(ProcessState::Ready));
    assert_eq!(
        kernel.process(parent).expect("writer").user_context.regs[0],
        total
    );

    // The remaining 19 bytes arrive in order.
    let uctxt = syscall(&mut kernel, Syscall::PipeRead, [pipe, USER_BUF, 19]);
    assert_eq!(uctxt.regs[0], 19);
    assert_eq!(
        kernel.read_user_bytes(child, USER_BUF, 19).expect("tail"),
        payload[PIPE_BUFFER_LEN..]
    );
}

#[test]
fn reclaim_is_not_found_after_the_first_call() {
    let (mut kernel, parent, _child) = boot_with_two();

    for call in [Syscall::LockInit, Syscall::CvarInit, Syscall::PipeInit] {
        let uctxt = syscall(&mut kernel, call, [USER_BUF, 0, 0]);
        assert_eq!(uctxt.regs[0], 0);
        let id = read_id(&kernel, parent, USER_BUF);
        let uctxt = syscall(&mut kernel, Syscall::Reclaim, [id, 0, 0]);
        assert_eq!(uctxt.regs[0], 0);
        let uctxt = syscall(&mut kernel, Syscall::Reclaim, [id, 0, 0]);
        assert_eq!(uctxt.regs[0], ERROR as usize, "second reclaim finds nothing");
    }
}

#[test]
fn sync_ids_are_distinct_across_kinds() {
    let (mut kernel, parent, _child) = boot_with_two();

    let mut ids = Vec::new();
    for call in [
        Syscall::LockInit,
        Syscall::CvarInit,
        Syscall::PipeInit,
        Syscall::LockInit,
    ] {
        syscall(&mut kernel, call, [USER_BUF, 0, 0]);
        ids.push(read_id(&kernel, parent, USER_BUF));
    }
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            assert_ne!(a, b);
        }
    }
}
