//! The kernel root value and boot sequence
//!
//! [`Kernel`] owns every piece of process-wide state: the frame bitmap,
//! the region 0 space, the process table, the scheduler queues, the
//! synchronization registry, the terminal states and the machine itself. Single-threaded borrowing discipline replaces
//! locking: kernel control flow only suspends through the save/restore
//! primitive, so invariants hold at every suspension point.
//!
//! [`kernel_start`] is the machine's entry into the kernel: it builds the
//! root value, creates the idle and init processes, loads the initial
//! program and returns with the machine set up to resume user mode in
//! idle.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{collections::BTreeSet, string::String, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    hal::{
        layout::{
            IDLE_ENTRY, KSTACK_PAGES, KSTACK_START_PAGE, NUM_R1_PAGES, NUM_TERMINALS, PAGE_SIZE,
            VMEM_0_PAGES, VMEM_1_LIMIT,
        },
        Machine, MachineRegister, TlbFlush, UserContext,
    },
    log_service,
    mm::{
        addr_space::{KernelImage, KernelSpace},
        frame::FrameBitmap,
        page_table::{PageProt, PageTableEntry},
    },
    process::{Pcb, PcbQueue, Pid, ProcessState, ProcessTable},
    sync::SyncRegistry,
    trap::TrapTable,
    tty::Terminal,
};

/// The kernel: the root owner of all formerly-global state.
pub struct Kernel<M: Machine> {
    pub(crate) hw: M,
    pub(crate) frames: FrameBitmap,
    pub(crate) kspace: KernelSpace,
    pub(crate) procs: ProcessTable,
    /// The running process.
    pub(crate) current: Pid,
    /// The idle PCB; never enqueued on any queue.
    pub(crate) idle: Pid,
    pub(crate) ready: PcbQueue,
    pub(crate) blocked: PcbQueue,
    pub(crate) defunct: PcbQueue,
    pub(crate) waiting_parent: PcbQueue,
    /// Exited PCBs whose kernel stack is still live until the next trap.
    pub(crate) graveyard: Vec<Pid>,
    pub(crate) sync: SyncRegistry,
    pub(crate) ttys: [Terminal; NUM_TERMINALS],
    pub(crate) trap_table: TrapTable,
}

impl<M: Machine> Kernel<M> {
    /// Pid of the running process.
    pub fn current_pid(&self) -> Pid {
        self.current
    }

    /// Pid of the idle process.
    pub fn idle_pid(&self) -> Pid {
        self.idle
    }

    /// Read-only view of a live PCB.
    pub fn process(&self, pid: Pid) -> Option<&Pcb> {
        self.procs.get(pid)
    }

    /// Scheduling state of a live process.
    pub fn process_state(&self, pid: Pid) -> Option<ProcessState> {
        self.procs.get(pid).map(|pcb| pcb.state)
    }

    /// Ready-queue pids, head first.
    pub fn ready_pids(&self) -> Vec<Pid> {
        self.ready.pids(&self.procs)
    }

    /// Blocked-queue pids, head first.
    pub fn blocked_pids(&self) -> Vec<Pid> {
        self.blocked.pids(&self.procs)
    }

    /// Defunct-queue pids, head first.
    pub fn defunct_pids(&self) -> Vec<Pid> {
        self.defunct.pids(&self.procs)
    }

    /// Waiting-parent-queue pids, head first.
    pub fn waiting_parent_pids(&self) -> Vec<Pid> {
        self.waiting_parent.pids(&self.procs)
    }

    /// The machine, for embedders and the test harness.
    pub fn machine(&self) -> &M {
        &self.hw
    }

    /// Mutable machine access, for injecting device state from outside.
    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.hw
    }

    /// Frames currently marked used in the bitmap.
    pub fn frames_used(&self) -> usize {
        self.frames.used_count()
    }

    /// Frame-conservation audit: the set bits in the bitmap must equal the
    /// distinct frames referenced by the region 0 table (kernel image,
    /// heap, kernel-stack window, scratch page) plus every PCB's region 1
    /// and kernel-stack entries.
    pub fn audit_frames(&self) -> bool {
        let mut referenced: BTreeSet<usize> = BTreeSet::new();
        for vpn in 0..VMEM_0_PAGES {
            let e = self.kspace.entry(vpn);
            if e.valid {
                referenced.insert(e.pfn);
            }
        }
        for pid in self.procs.pids() {
            let pcb = self.procs.pcb(pid);
            for (_, e) in pcb.region1.valid_entries() {
                referenced.insert(e.pfn);
            }
            if let Some(kstack) = &pcb.kernel_stack {
                for e in kstack {
                    referenced.insert(e.pfn);
                }
            }
        }

        let mut consistent = referenced.len() == self.frames.used_count();
        for &pfn in &referenced {
            if !self.frames.is_used(pfn) {
                consistent = false;
            }
        }
        if !consistent {
            log::error!(
                target: "mm",
                "frame audit mismatch: {} referenced, {} marked used",
                referenced.len(),
                self.frames.used_count()
            );
        }
        consistent
    }

    /// Log the failure, stop the machine and surface a fatal error.
    pub(crate) fn fatal(&mut self, reason: &'static str) -> KernelError {
        log::error!(target: "kernel", "fatal: {}", reason);
        self.hw.halt();
        KernelError::Fatal { reason }
    }
}

/// Boot the kernel on `hw`.
///
/// `cmd_args` is the boot command line (its first element names the
/// initial program, defaulting to `"init"`), `pmem_size` the physical
/// memory size in bytes, `image` the placement of the kernel's own image
/// in region 0, and `uctxt` the machine's user-context template. On return
/// `uctxt` holds the idle process's context and the machine resumes user
/// mode there.
pub fn kernel_start<M: Machine>(
    hw: M,
    cmd_args: &[&str],
    pmem_size: usize,
    image: KernelImage,
    uctxt: &mut UserContext,
) -> KernelResult<Kernel<M>> {
    log_service::init();
    log::info!(
        target: "boot",
        "kernel start: {} frames of physical memory",
        pmem_size / PAGE_SIZE
    );

    let mut hw = hw;
    // The identity-mapped kernel image and stack must exist physically.
    if pmem_size / PAGE_SIZE < VMEM_0_PAGES {
        log::error!(target: "boot", "physical memory does not cover region 0");
        hw.halt();
        return Err(KernelError::Fatal {
            reason: "physical memory smaller than region 0",
        });
    }
    let mut frames = FrameBitmap::new(pmem_size / PAGE_SIZE);
    let kspace = match KernelSpace::new(&image, &mut frames) {
        Ok(kspace) => kspace,
        Err(e) => {
            log::error!(target: "boot", "cannot build region 0 table: {}", e);
            hw.halt();
            return Err(e);
        }
    };

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

    kernel
        .hw
        .write_register(MachineRegister::Ptbr0, kernel.kspace.base_token());
    kernel
        .hw
        .write_register(MachineRegister::Ptlr0, VMEM_0_PAGES);
    kernel.install_trap_table();

    // The idle PCB: one user-stack page at the top of region 1, running
    // the machine's idle stub; its kernel stack is the boot stack,
    // identity-mapped and already pinned in the bitmap.
    let idle = kernel.procs.create("idle");
    kernel.idle = idle;
    kernel.current = idle;
    let idle_stack_pfn = match kernel.frames.alloc() {
        Ok(pfn) => pfn,
        Err(_) => return Err(kernel.fatal("no frame for the idle stack")),
    };
    {
        let pcb = kernel.procs.pcb_mut(idle);
        *pcb.region1.entry_mut(NUM_R1_PAGES - 1) =
            PageTableEntry::mapped(idle_stack_pfn, PageProt::RW);
        pcb.user_context = *uctxt;
        pcb.user_context.pc = IDLE_ENTRY;
        pcb.user_context.sp = VMEM_1_LIMIT - core::mem::size_of::<usize>();
        let mut kstack = [PageTableEntry::default(); KSTACK_PAGES];
        for (i, entry) in kstack.iter_mut().enumerate() {
            *entry = PageTableEntry::mapped(KSTACK_START_PAGE + i, PageProt::RW);
        }
        pcb.kernel_stack = Some(kstack);
    }
    let idle_r1 = kernel.procs.pcb(idle).region1.base_token();
    kernel.hw.write_register(MachineRegister::Ptbr1, idle_r1);
    kernel
        .hw
        .write_register(MachineRegister::Ptlr1, NUM_R1_PAGES);

    // The init PCB, with a freshly allocated kernel stack.
    let init_name = cmd_args.first().copied().unwrap_or("init");
    let init = kernel.procs.create(init_name);
    kernel.procs.pcb_mut(init).user_context = *uctxt;
    match kernel.alloc_kernel_stack() {
        Ok(kstack) => kernel.procs.pcb_mut(init).kernel_stack = Some(kstack),
        Err(_) => return Err(kernel.fatal("no frames for init's kernel stack")),
    }

    kernel.hw.write_register(MachineRegister::VmEnable, 1);
    if kernel.kspace.enable_vm(&mut kernel.frames).is_err() {
        return Err(kernel.fatal("cannot enable virtual memory"));
    }

    // Load the initial program into init's region 1.
    let init_r1 = kernel.procs.pcb(init).region1.base_token();
    kernel.hw.write_register(MachineRegister::Ptbr1, init_r1);
    kernel.hw.flush_tlb(TlbFlush::Region1);
    let args: Vec<String> = cmd_args.iter().map(|&a| String::from(a)).collect();
    if let Err(e) = kernel.load_program(init, init_name, &args) {
        log::error!(target: "boot", "cannot load '{}': {}", init_name, e);
        return Err(kernel.fatal("initial program not loadable"));
    }

    // Back to idle's region 1 and seed init's kernel context from the
    // boot context.
    kernel.hw.write_register(MachineRegister::Ptbr1, idle_r1);
    kernel.hw.flush_tlb(TlbFlush::Region1);
    if kernel.kc_copy(init).is_err() {
        return Err(kernel.fatal("cannot seed init's kernel context"));
    }
    kernel.hw.flush_tlb(TlbFlush::All);

    kernel.ready.enqueue(&mut kernel.procs, init);
    kernel.procs.pcb_mut(idle).state = ProcessState::Running;
    *uctxt = kernel.procs.pcb(idle).user_context;

    log::info!(target: "boot", "boot complete; init is '{}' (pid {})", init_name, init);
    Ok(kernel)
}
