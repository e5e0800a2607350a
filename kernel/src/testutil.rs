//! Unit-test scaffolding
//!
//! Builds a kernel directly on a [`SimMachine`] without going through the
//! boot path: an idle PCB on the boot kernel stack, a parked placeholder
//! for pid 1 (so exit paths in tests never trip the init-halts rule), and
//! `n` runnable user processes, each with one mapped heap page at the
//! bottom of region 1 and one stack page at the top.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{format, vec::Vec};

use crate::{
    bootstrap::Kernel,
    hal::{
        layout::{
            IDLE_ENTRY, KSTACK_PAGES, KSTACK_START_PAGE, NUM_R1_PAGES, NUM_TERMINALS, PAGE_SIZE,
            VMEM_1_BASE, VMEM_1_LIMIT,
        },
        sim::SimMachine,
    },
    mm::{
        addr_space::{KernelImage, KernelSpace},
        frame::FrameBitmap,
        page_table::{PageProt, PageTableEntry},
    },
    process::{PcbQueue, Pid, ProcessState, ProcessTable},
    sync::{Cvar, Lock, Pipe, SyncRegistry, CVAR_TAG, LOCK_TAG, PIPE_TAG},
    trap::TrapTable,
    tty::Terminal,
};

const TEST_FRAMES: usize = 512;

/// Build a kernel with `n` runnable user processes. The first is current,
/// the rest sit in the ready queue in order.
pub(crate) fn kernel_with_procs(n: usize) -> (Kernel<SimMachine>, Vec<Pid>) {
    crate::log_service::init();

    let image = KernelImage {
        first_data_page: 8,
        orig_brk_page: 16,
    };
    let hw = SimMachine::new(TEST_FRAMES * PAGE_SIZE);
    let mut frames = FrameBitmap::new(TEST_FRAMES);
    let mut kspace = KernelSpace::new(&image, &mut frames).expect("test region 0 table");
    kspace.enable_vm(&mut frames).expect("test vm enable");

    let mut kernel = Kernel {
        hw,
        frames,
        kspace,
        procs: ProcessTable::new(),
        current: Pid(0),
        idle: Pid(0),
        ready: PcbQueue::new(),
        blocked: PcbQueue::new(),
        defunct: PcbQueue::new(),
        waiting_parent: PcbQueue::new(),
        graveyard: Vec::new(),
        sync: SyncRegistry::new(),
        ttys: [const { Terminal::new() }; NUM_TERMINALS],
        trap_table: TrapTable::new(),
    };
    kernel.install_trap_table();

    // Idle on the boot kernel stack.
    let idle = kernel.procs.create("idle");
    kernel.idle = idle;
    kernel.current = idle;
    {
        let stack_pfn = kernel.frames.alloc().expect("idle stack frame");
        let pcb = kernel.procs.pcb_mut(idle);
        *pcb.region1.entry_mut(NUM_R1_PAGES - 1) =
            PageTableEntry::mapped(stack_pfn, PageProt::RW);
        pcb.user_context.pc = IDLE_ENTRY;
        pcb.user_context.sp = VMEM_1_LIMIT - core::mem::size_of::<usize>();
        let mut kstack = [PageTableEntry::default(); KSTACK_PAGES];
        for (i, entry) in kstack.iter_mut().enumerate() {
            *entry = PageTableEntry::mapped(KSTACK_START_PAGE + i, PageProt::RW);
        }
        pcb.kernel_stack = Some(kstack);
        pcb.state = ProcessState::Running;
    }

    // Pid 1 is reserved for init semantics; park a placeholder so test
    // processes exiting never halt the machine.
    let parked = kernel.procs.create("init-parked");
    let kstack = kernel.alloc_kernel_stack().expect("parked kernel stack");
    kernel.procs.pcb_mut(parked).kernel_stack = Some(kstack);
    kernel.procs.pcb_mut(parked).state = ProcessState::Blocked;
    kernel.blocked.enqueue(&mut kernel.procs, parked);

    let mut pids = Vec::with_capacity(n);
    for i in 0..n {
        let pid = kernel.procs.create(&format!("proc{i}"));
        let kstack = kernel.alloc_kernel_stack().expect("test kernel stack");
        let heap_pfn = kernel.frames.alloc().expect("test heap frame");
        let stack_pfn = kernel.frames.alloc().expect("test stack frame");
        let pcb = kernel.procs.pcb_mut(pid);
        pcb.kernel_stack = Some(kstack);
        *pcb.region1.entry_mut(0) = PageTableEntry::mapped(heap_pfn, PageProt::RW);
        *pcb.region1.entry_mut(NUM_R1_PAGES - 1) =
            PageTableEntry::mapped(stack_pfn, PageProt::RW);
        pcb.brk = Some(VMEM_1_BASE + PAGE_SIZE);
        pcb.user_context.pc = VMEM_1_BASE;
        pcb.user_context.sp = VMEM_1_LIMIT - core::mem::size_of::<usize>();
        pids.push(pid);
    }

    if let Some(&first) = pids.first() {
        kernel.current = first;
        kernel.procs.pcb_mut(first).state = ProcessState::Running;
        kernel.procs.pcb_mut(idle).state = ProcessState::Ready;
        for &pid in &pids[1..] {
            kernel.ready.enqueue(&mut kernel.procs, pid);
        }
    }

    (kernel, pids)
}

impl Kernel<SimMachine> {
    /// Mint a lock directly in the registry.
    pub(crate) fn lock_for_test(&mut self) -> usize {
        let id = self.sync.next_id(LOCK_TAG).expect("test lock id");
        self.sync.locks.insert(
            id,
            Lock {
                id,
                holder: None,
                waiters: PcbQueue::new(),
            },
        );
        id
    }

    /// Mint a condition variable directly in the registry.
    pub(crate) fn cvar_for_test(&mut self) -> usize {
        let id = self.sync.next_id(CVAR_TAG).expect("test cvar id");
        self.sync.cvars.insert(
            id,
            Cvar {
                id,
                waiters: PcbQueue::new(),
            },
        );
        id
    }

    /// Mint a pipe directly in the registry.
    pub(crate) fn pipe_for_test(&mut self) -> usize {
        let id = self.sync.next_id(PIPE_TAG).expect("test pipe id");
        self.sync.pipes.insert(id, Pipe::new(id));
        id
    }
}
