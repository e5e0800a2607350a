//! Boot-sequence scenarios

mod common;

use common::*;
use ridgeline_kernel::{
    hal::layout::{IDLE_ENTRY, INITIAL_STACK_FRAME_SIZE, NUM_R1_PAGES, VMEM_1_BASE},
    kernel_start, KernelImage, MachineRegister, Pid, ProcessState, SimMachine, UserContext,
};

#[test]
fn boot_returns_to_user_mode_in_idle() {
    let (kernel, uctxt) = boot_default();

    assert_eq!(kernel.current_pid(), kernel.idle_pid());
    assert_eq!(kernel.idle_pid(), Pid(0));
    assert_eq!(uctxt.pc, IDLE_ENTRY);

    // Init is loaded, seeded and ready.
    let init = Pid(1);
    assert_eq!(kernel.ready_pids(), [init]);
    assert_eq!(kernel.process_state(init), Some(ProcessState::Ready));
    assert_eq!(
        kernel.process(init).expect("init is live").user_context.pc,
        VMEM_1_BASE + 8
    );
    assert!(kernel.process(init).expect("init is live").kernel_stack.is_some());
}

#[test]
fn boot_programs_machine_registers() {
    let (kernel, _uctxt) = boot_default();
    let hw = kernel.machine();
    assert_eq!(hw.register(MachineRegister::VmEnable), 1);
    assert_eq!(hw.register(MachineRegister::Ptlr1), NUM_R1_PAGES);
    assert_ne!(hw.register(MachineRegister::Ptbr0), 0);
    assert_ne!(hw.register(MachineRegister::VectorBase), 0);
}

#[test]
fn boot_satisfies_frame_conservation() {
    let (kernel, _uctxt) = boot_default();
    assert!(kernel.audit_frames());
}

#[test]
fn init_image_is_loaded_with_its_data() {
    let (kernel, _uctxt) = boot_default();
    let init = Pid(1);
    let data = kernel
        .read_user_bytes(init, VMEM_1_BASE + ridgeline_kernel::hal::layout::PAGE_SIZE, 17)
        .expect("data page mapped");
    assert_eq!(data, b"test-program-data");
}

#[test]
fn argv_is_built_on_the_initial_stack() {
    let (kernel, _uctxt) = boot(
        &[("init", test_program())],
        &["init", "alpha", "beta"],
    );
    let init = Pid(1);
    let sp = kernel.process(init).expect("init is live").user_context.sp;
    let cpp = sp + INITIAL_STACK_FRAME_SIZE;

    // argc, then the argv pointers, then a NULL terminator.
    let argc = read_word(&kernel, init, cpp);
    assert_eq!(argc, 3);
    let argv0 = read_word(&kernel, init, cpp + 8);
    let argv2 = read_word(&kernel, init, cpp + 24);
    let terminator = read_word(&kernel, init, cpp + 32);
    assert_eq!(read_cstr(&kernel, init, argv0), "init");
    assert_eq!(read_cstr(&kernel, init, argv2), "beta");
    assert_eq!(terminator, 0);
    // Double-word alignment of the pointer block.
    assert_eq!(cpp % 8, 0);
}

#[test]
fn boot_without_a_loadable_init_fails() {
    let hw = SimMachine::new(PMEM_SIZE);
    let mut uctxt = UserContext::default();
    let result = kernel_start(hw, &["missing"], PMEM_SIZE, TEST_IMAGE, &mut uctxt);
    assert!(result.is_err());
}

#[test]
fn boot_with_tiny_memory_fails() {
    let hw = SimMachine::new(8 * ridgeline_kernel::hal::layout::PAGE_SIZE);
    let mut uctxt = UserContext::default();
    let image = KernelImage {
        first_data_page: 8,
        orig_brk_page: 16,
    };
    let result = kernel_start(
        hw,
        &["init"],
        8 * ridgeline_kernel::hal::layout::PAGE_SIZE,
        image,
        &mut uctxt,
    );
    assert!(result.is_err());
}

fn read_word(kernel: &ridgeline_kernel::Kernel<SimMachine>, pid: Pid, addr: usize) -> usize {
    let raw = kernel.read_user_bytes(pid, addr, 8).expect("stack word mapped");
    usize::from_le_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ])
}

fn read_cstr(kernel: &ridgeline_kernel::Kernel<SimMachine>, pid: Pid, addr: usize) -> String {
    let mut out = Vec::new();
    let mut cursor = addr;
    loop {
        let byte = kernel.read_user_bytes(pid, cursor, 1).expect("string mapped")[0];
        if byte == 0 {
            break;
        }
        out.push(byte);
        cursor += 1;
    }
    String::from_utf8(out).expect("argv strings are UTF-8")
}
