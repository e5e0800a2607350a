//! Memory scenarios: stack growth, fault classification, loader failures

mod common;

use common::*;
use ridgeline_kernel::{
    hal::layout::{r1_page_addr, NUM_R1_PAGES, PAGE_SIZE, VMEM_1_BASE},
    ExecImageBuilder, Pid, ProcessState, Syscall, ERROR,
};

#[test]
fn stack_grows_on_a_fault_between_break_and_stack() {
    let (mut kernel, _) = boot_default();
    let init = Pid(1);
    run_until_current(&mut kernel, init);

    let pcb = kernel.process(init).expect("init");
    let stack_floor = pcb.region1.lowest_stack_page().expect("stack mapped");
    let brk = pcb.brk.expect("loader brk");
    let frames_before = kernel.frames_used();

    // Touch one page below the current stack floor, well above the break.
    let target = r1_page_addr(stack_floor - 1) + 100;
    assert!(target > brk);
    memory_fault(&mut kernel, target);

    // Still running, one page grown, zeroed, accounted for.
    assert_eq!(kernel.current_pid(), init);
    assert_eq!(
        kernel.process(init).expect("init").region1.lowest_stack_page(),
        Some(stack_floor - 1)
    );
    assert_eq!(kernel.frames_used(), frames_before + 1);
    assert_eq!(
        kernel
            .read_user_bytes(init, r1_page_addr(stack_floor - 1), PAGE_SIZE)
            .expect("fresh stack page"),
        vec![0u8; PAGE_SIZE]
    );
    assert!(kernel.audit_frames());
}

#[test]
fn fault_below_the_break_kills_the_process() {
    let (mut kernel, _) = boot_default();
    let init = Pid(1);
    run_until_current(&mut kernel, init);

    // Fork a victim so the machine survives its death.
    let uctxt = syscall(&mut kernel, Syscall::Fork, [0, 0, 0]);
    let victim = Pid(uctxt.regs[0] as u32);
    run_until_current(&mut kernel, victim);

    // An address inside the already-mapped data region is not a
    // stack-growth request: the fault is fatal.
    memory_fault(&mut kernel, VMEM_1_BASE + PAGE_SIZE + 10);
    assert_ne!(kernel.current_pid(), victim);
    assert_eq!(kernel.process_state(victim), Some(ProcessState::Defunct));
}

#[test]
fn fault_outside_region1_kills_the_process() {
    let (mut kernel, _) = boot_default();
    let init = Pid(1);
    run_until_current(&mut kernel, init);
    let uctxt = syscall(&mut kernel, Syscall::Fork, [0, 0, 0]);
    let victim = Pid(uctxt.regs[0] as u32);
    run_until_current(&mut kernel, victim);

    memory_fault(&mut kernel, 0x2000);
    assert_eq!(kernel.process_state(victim), Some(ProcessState::Defunct));
}

#[test]
fn exec_failure_before_commit_keeps_the_old_image() {
    let mut bad = test_program();
    bad[0] ^= 0xFF; // break the magic
    let (mut kernel, _) = boot(
        &[("init", test_program()), ("bad", bad)],
        &["init"],
    );
    let init = Pid(1);
    run_until_current(&mut kernel, init);

    let pc_before = kernel.process(init).expect("init").user_context.pc;
    kernel
        .write_user_bytes(init, USER_BUF, b"bad\0")
        .expect("stage filename");
    let uctxt = syscall(&mut kernel, Syscall::Exec, [USER_BUF, 0, 0]);

    assert_eq!(uctxt.regs[0], ERROR as usize);
    assert_eq!(kernel.current_pid(), init);
    let pcb = kernel.process(init).expect("init survives");
    assert_eq!(pcb.user_context.pc, pc_before, "old image still runs");
    assert_eq!(
        kernel
            .read_user_bytes(init, VMEM_1_BASE + PAGE_SIZE, 17)
            .expect("old data intact"),
        b"test-program-data"
    );
}

#[test]
fn exec_of_a_truncated_image_kills_the_process() {
    // The header promises a full text page but the file ends early.
    let truncated = ExecImageBuilder::new()
        .entry(VMEM_1_BASE + 4)
        .text(&[0x11; 64])
        .data(b"payload")
        .truncate_to(200)
        .build();
    let (mut kernel, _) = boot(
        &[("init", test_program()), ("trunc", truncated)],
        &["init"],
    );
    let init = Pid(1);
    run_until_current(&mut kernel, init);

    let uctxt = syscall(&mut kernel, Syscall::Fork, [0, 0, 0]);
    let victim = Pid(uctxt.regs[0] as u32);
    run_until_current(&mut kernel, victim);

    kernel
        .write_user_bytes(victim, USER_BUF, b"trunc\0")
        .expect("stage filename");
    syscall(&mut kernel, Syscall::Exec, [USER_BUF, 0, 0]);

    // Past the commit point the process is unrecoverable.
    assert_ne!(kernel.current_pid(), victim);
    assert_eq!(kernel.process_state(victim), Some(ProcessState::Defunct));
    assert_eq!(
        kernel.process(victim).expect("defunct").exit_status,
        ERROR as i32
    );
}

#[test]
fn brk_into_the_stack_is_rejected() {
    let (mut kernel, _) = boot_default();
    let init = Pid(1);
    run_until_current(&mut kernel, init);

    let target = r1_page_addr(NUM_R1_PAGES - 1);
    let uctxt = syscall(&mut kernel, Syscall::Brk, [target, 0, 0]);
    assert_eq!(uctxt.regs[0], ERROR as usize);
    assert!(kernel.audit_frames());
}

#[test]
fn bad_user_pointer_terminates_instead_of_corrupting() {
    let (mut kernel, _) = boot_default();
    let init = Pid(1);
    run_until_current(&mut kernel, init);
    let uctxt = syscall(&mut kernel, Syscall::Fork, [0, 0, 0]);
    let victim = Pid(uctxt.regs[0] as u32);
    run_until_current(&mut kernel, victim);

    // A lock-init out-pointer into region 0 must not be written.
    syscall(&mut kernel, Syscall::LockInit, [0x8000, 0, 0]);
    assert_eq!(kernel.process_state(victim), Some(ProcessState::Defunct));
}
