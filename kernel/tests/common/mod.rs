//! Shared harness for the scenario tests
//!
//! Boots the kernel on a `SimMachine` stocked with packed executables,
//! then drives it the way the machine would: by injecting traps and
//! handing the current user context back and forth.

#![allow(dead_code)] // each test binary uses a different slice of this

use ridgeline_kernel::{
    hal::layout::{PAGE_SIZE, VMEM_1_BASE},
    kernel_start, ExecImageBuilder, Kernel, KernelImage, Pid, SimMachine, Syscall, TrapVector,
    UserContext,
};

/// Physical memory handed to every test machine (512 frames).
pub const PMEM_SIZE: usize = 512 * PAGE_SIZE;

/// Kernel image placement used by every test boot.
pub const TEST_IMAGE: KernelImage = KernelImage {
    first_data_page: 8,
    orig_brk_page: 16,
};

/// A user-space scratch address inside the test program's bss page.
pub const USER_BUF: usize = VMEM_1_BASE + 2 * PAGE_SIZE;

/// A second scratch address, far enough from `USER_BUF`.
pub const USER_BUF2: usize = VMEM_1_BASE + 2 * PAGE_SIZE + 1024;

/// The standard test program: one text page, one data page, one bss page.
pub fn test_program() -> Vec<u8> {
    ExecImageBuilder::new()
        .entry(VMEM_1_BASE + 8)
        .text(&[0x90; 64])
        .data(b"test-program-data")
        .bss_pages(1)
        .build()
}

/// Boot a kernel with `programs` installed and `args` as the boot command
/// line. Returns the kernel and the boot-time user context (idle's).
pub fn boot(programs: &[(&str, Vec<u8>)], args: &[&str]) -> (Kernel<SimMachine>, UserContext) {
    let mut hw = SimMachine::new(PMEM_SIZE);
    for (name, bytes) in programs {
        hw.install_program(name, bytes.clone());
    }
    let mut uctxt = UserContext::default();
    let kernel =
        kernel_start(hw, args, PMEM_SIZE, TEST_IMAGE, &mut uctxt).expect("test boot succeeds");
    (kernel, uctxt)
}

/// Boot with the standard program installed as "init".
pub fn boot_default() -> (Kernel<SimMachine>, UserContext) {
    boot(&[("init", test_program())], &["init"])
}

/// Issue a syscall as the current process and return the user context the
/// trap hands back (the context of whichever process is current after).
pub fn syscall(kernel: &mut Kernel<SimMachine>, call: Syscall, args: [usize; 3]) -> UserContext {
    let me = kernel.current_pid();
    let mut uctxt = kernel
        .process(me)
        .expect("current process is live")
        .user_context;
    uctxt.code = call as usize;
    uctxt.regs[0] = args[0];
    uctxt.regs[1] = args[1];
    uctxt.regs[2] = args[2];
    kernel.handle_trap(TrapVector::Kernel as usize, &mut uctxt);
    uctxt
}

/// Inject a clock tick.
pub fn clock_tick(kernel: &mut Kernel<SimMachine>) -> UserContext {
    let me = kernel.current_pid();
    let mut uctxt = kernel
        .process(me)
        .expect("current process is live")
        .user_context;
    kernel.handle_trap(TrapVector::Clock as usize, &mut uctxt);
    uctxt
}

/// Inject a memory fault on `addr` in the current process.
pub fn memory_fault(kernel: &mut Kernel<SimMachine>, addr: usize) -> UserContext {
    let me = kernel.current_pid();
    let mut uctxt = kernel
        .process(me)
        .expect("current process is live")
        .user_context;
    uctxt.addr = addr;
    kernel.handle_trap(TrapVector::Memory as usize, &mut uctxt);
    uctxt
}

/// Inject a terminal-receive interrupt for `terminal`.
pub fn tty_receive_irq(kernel: &mut Kernel<SimMachine>, terminal: usize) -> UserContext {
    let me = kernel.current_pid();
    let mut uctxt = kernel
        .process(me)
        .expect("current process is live")
        .user_context;
    uctxt.code = terminal;
    kernel.handle_trap(TrapVector::TtyReceive as usize, &mut uctxt);
    uctxt
}

/// Complete the outstanding transmit on `terminal` and deliver the
/// transmit interrupt.
pub fn tty_transmit_irq(kernel: &mut Kernel<SimMachine>, terminal: usize) -> UserContext {
    kernel.machine_mut().finish_transmit(terminal);
    let me = kernel.current_pid();
    let mut uctxt = kernel
        .process(me)
        .expect("current process is live")
        .user_context;
    uctxt.code = terminal;
    kernel.handle_trap(TrapVector::TtyTransmit as usize, &mut uctxt);
    uctxt
}

/// Tick the clock until `pid` is the running process (bounded).
pub fn run_until_current(kernel: &mut Kernel<SimMachine>, pid: Pid) {
    for _ in 0..16 {
        if kernel.current_pid() == pid {
            return;
        }
        clock_tick(kernel);
    }
    panic!("pid {pid} never became current");
}

/// Read the id a `*_init` syscall stored at `addr` in `pid`'s memory.
pub fn read_id(kernel: &Kernel<SimMachine>, pid: Pid, addr: usize) -> usize {
    let raw = kernel
        .read_user_bytes(pid, addr, 4)
        .expect("id out-pointer is mapped");
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
}

/// Read a little-endian i32 from `pid`'s memory.
pub fn read_i32(kernel: &Kernel<SimMachine>, pid: Pid, addr: usize) -> i32 {
    let raw = kernel
        .read_user_bytes(pid, addr, 4)
        .expect("status pointer is mapped");
    i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}
