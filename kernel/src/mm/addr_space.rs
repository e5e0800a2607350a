//! Kernel (region 0) address space
//!
//! Owns the shared region 0 page table: the identity-mapped kernel image,
//! the kernel heap window grown and shrunk by [`KernelSpace::set_kernel_brk`],
//! the well-known kernel-stack pages rewritten on every context switch, and
//! the scratch page used to reach foreign physical frames. User stack
//! growth (a region 1 concern driven by the memory-fault handler) also
//! lives here because it is the other consumer of the scratch page.

use crate::{
    bootstrap::Kernel,
    error::{KernelError, KernelResult},
    hal::{
        layout::{
            is_region1_addr, r1_page_addr, r1_page_index, KERNEL_HEAP_MAX_PAGE, KSTACK_PAGES,
            KSTACK_START_PAGE, PAGE_SHIFT, SCRATCH_ADDR, SCRATCH_PAGE, VMEM_0_PAGES, VMEM_1_BASE,
        },
        Machine, TlbFlush,
    },
    mm::{
        frame::FrameBitmap,
        page_table::{KernelStackTable, PageProt, PageTableEntry},
    },
    process::Pid,
};

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{vec, vec::Vec};

/// Where the boot loader placed the kernel image in region 0.
///
/// The moral equivalent of the original link-time symbols naming the first
/// kernel data page and the initial kernel break.
#[derive(Debug, Clone, Copy)]
pub struct KernelImage {
    /// First region 0 page holding kernel data; pages below it are text.
    pub first_data_page: usize,
    /// First region 0 page past the kernel's initial break.
    pub orig_brk_page: usize,
}

/// The region 0 page table and its bookkeeping.
pub struct KernelSpace {
    table: Vec<PageTableEntry>,
    orig_brk_page: usize,
    current_brk_page: usize,
    vm_enabled: bool,
    /// Break target recorded before VM was enabled.
    pending_brk_page: Option<usize>,
}

impl KernelSpace {
    /// Build the boot-time region 0 table: kernel text mapped R-X, kernel
    /// data and heap R-W up to the original break, the kernel stack pages
    /// pinned R-W at the top. Every mapped frame is marked used.
    pub fn new(image: &KernelImage, frames: &mut FrameBitmap) -> KernelResult<Self> {
        if image.first_data_page > image.orig_brk_page || image.orig_brk_page > KERNEL_HEAP_MAX_PAGE
        {
            return Err(KernelError::Fatal {
                reason: "kernel image does not fit region 0",
            });
        }

        let mut table = vec![PageTableEntry::default(); VMEM_0_PAGES];
        for vpn in 0..image.orig_brk_page {
            let prot = if vpn < image.first_data_page {
                PageProt::RX
            } else {
                PageProt::RW
            };
            table[vpn] = PageTableEntry::mapped(vpn, prot);
            frames.mark_used(vpn);
        }
        for vpn in KSTACK_START_PAGE..KSTACK_START_PAGE + KSTACK_PAGES {
            table[vpn] = PageTableEntry::mapped(vpn, PageProt::RW);
            frames.mark_used(vpn);
        }

        Ok(Self {
            table,
            orig_brk_page: image.orig_brk_page,
            current_brk_page: image.orig_brk_page,
            vm_enabled: false,
            pending_brk_page: None,
        })
    }

    /// Base address of the table, written to the region 0 base register.
    pub fn base_token(&self) -> usize {
        self.table.as_ptr() as usize
    }

    /// Whether virtual memory has been enabled.
    pub fn vm_enabled(&self) -> bool {
        self.vm_enabled
    }

    /// Current kernel break page (first page past the heap).
    pub fn current_brk_page(&self) -> usize {
        self.current_brk_page
    }

    /// The entry for region 0 page `vpn`.
    pub fn entry(&self, vpn: usize) -> &PageTableEntry {
        &self.table[vpn]
    }

    /// Overwrite the well-known kernel-stack pages with another process's
    /// kernel-stack entries. The caller flushes the TLB.
    pub(crate) fn install_kernel_stack(&mut self, kstack: &KernelStackTable) {
        for (i, pte) in kstack.iter().enumerate() {
            self.table[KSTACK_START_PAGE + i] = *pte;
        }
    }

    /// Mark VM as enabled and apply any break raise recorded before the
    /// switch. Pre-VM the machine addresses memory physically, so the
    /// raised pages are identity mappings.
    pub fn enable_vm(&mut self, frames: &mut FrameBitmap) -> KernelResult<()> {
        self.vm_enabled = true;
        if let Some(pending) = self.pending_brk_page.take() {
            for vpn in self.current_brk_page..pending {
                self.table[vpn] = PageTableEntry::mapped(vpn, PageProt::RW);
                frames.mark_used(vpn);
            }
            self.current_brk_page = pending;
        }
        Ok(())
    }

    /// Grow or shrink the kernel heap to `new_addr`.
    ///
    /// Before VM is enabled this only records the target. Afterwards pages
    /// are mapped or unmapped between the original break and the scratch
    /// page; on frame exhaustion the partial growth is rolled back and the
    /// break is unchanged.
    pub fn set_kernel_brk<M: Machine>(
        &mut self,
        hw: &mut M,
        frames: &mut FrameBitmap,
        new_addr: usize,
    ) -> KernelResult<()> {
        let new_brk_page = crate::hal::layout::page_ceil(new_addr) >> PAGE_SHIFT;

        if new_brk_page < self.orig_brk_page {
            return Err(KernelError::InvalidArg {
                what: "kernel break below original",
            });
        }

        if !self.vm_enabled {
            let recorded = self.pending_brk_page.unwrap_or(self.current_brk_page);
            self.pending_brk_page = Some(recorded.max(new_brk_page));
            log::trace!(target: "mm", "pre-VM kernel break recorded: page {}", new_brk_page);
            return Ok(());
        }

        if new_brk_page > KERNEL_HEAP_MAX_PAGE + 1 {
            return Err(KernelError::NoMemory {
                what: "kernel heap would overlap kernel stack",
            });
        }

        if new_brk_page <= self.current_brk_page {
            for vpn in new_brk_page..self.current_brk_page {
                frames.free(self.table[vpn].pfn);
                self.table[vpn].invalidate();
                hw.flush_tlb(TlbFlush::Page(vpn << PAGE_SHIFT));
            }
        } else {
            let mut grown = Vec::new();
            for vpn in self.current_brk_page..new_brk_page {
                match frames.alloc() {
                    Ok(pfn) => {
                        self.table[vpn] = PageTableEntry::mapped(pfn, PageProt::RW);
                        grown.push(vpn);
                    }
                    Err(e) => {
                        for &v in &grown {
                            frames.free(self.table[v].pfn);
                            self.table[v].invalidate();
                        }
                        return Err(e);
                    }
                }
            }
        }

        self.current_brk_page = new_brk_page;
        log::debug!(target: "mm", "kernel break now at page {}", new_brk_page);
        Ok(())
    }

    /// Map the scratch page onto `pfn`, returning a guard that unmaps on
    /// every exit path. Both the map and the unmap flush the scratch page
    /// from the TLB.
    ///
    /// The scratch page is a process-wide critical region: the guard must
    /// be dropped before any suspension point.
    pub fn map_scratch<'a, M: Machine>(
        &'a mut self,
        hw: &'a mut M,
        pfn: usize,
    ) -> ScratchFrame<'a, M> {
        debug_assert!(!self.table[SCRATCH_PAGE].valid, "scratch page already mapped");
        self.table[SCRATCH_PAGE] = PageTableEntry::mapped(pfn, PageProt::RW);
        hw.flush_tlb(TlbFlush::Page(SCRATCH_ADDR));
        ScratchFrame {
            space: self,
            hw,
            pfn,
        }
    }

    /// Whether the scratch page is currently mapped (audit hook).
    pub fn scratch_mapped(&self) -> Option<usize> {
        let e = &self.table[SCRATCH_PAGE];
        e.valid.then_some(e.pfn)
    }
}

/// A foreign physical frame reached through the scratch page.
///
/// All accesses go through the scratch mapping installed by
/// [`KernelSpace::map_scratch`]; dropping the guard unmaps and flushes.
pub struct ScratchFrame<'a, M: Machine> {
    space: &'a mut KernelSpace,
    hw: &'a mut M,
    pfn: usize,
}

impl<M: Machine> ScratchFrame<'_, M> {
    /// The frame currently mapped.
    pub fn pfn(&self) -> usize {
        self.pfn
    }

    /// Zero the whole frame.
    pub fn zero(&mut self) {
        self.hw.frame_mut(self.pfn).fill(0);
    }

    /// Copy bytes into the frame at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        self.hw.frame_mut(self.pfn)[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Copy the full contents of another physical frame into this one.
    pub fn copy_from_frame(&mut self, src_pfn: usize) {
        let src = self.hw.frame(src_pfn).to_vec();
        self.hw.frame_mut(self.pfn).copy_from_slice(&src);
    }
}

impl<M: Machine> Drop for ScratchFrame<'_, M> {
    fn drop(&mut self) {
        self.space.table[SCRATCH_PAGE].invalidate();
        self.hw.flush_tlb(TlbFlush::Page(SCRATCH_ADDR));
    }
}

impl<M: Machine> Kernel<M> {
    /// Whether `addr` is a plausible stack-growth target for `pid`:
    /// strictly below the current stack floor and strictly above the
    /// break.
    pub(crate) fn is_below_stack_above_brk(&self, pid: Pid, addr: usize) -> bool {
        let pcb = self.procs.pcb(pid);
        let Some(lowest_stack_page) = pcb.region1.lowest_stack_page() else {
            return false;
        };
        let stack_bottom = r1_page_addr(lowest_stack_page);
        let brk = pcb.brk.unwrap_or(VMEM_1_BASE);
        addr < stack_bottom && addr > brk
    }

    /// Grow the current process's user stack down to cover `addr`.
    ///
    /// Allocates and maps pages from the page containing `addr` up to one
    /// below the current stack floor, zeroing each through the scratch
    /// page before it becomes visible. On frame exhaustion nothing remains
    /// mapped.
    pub(crate) fn grow_stack_to(&mut self, pid: Pid, addr: usize) -> KernelResult<()> {
        debug_assert!(is_region1_addr(addr));
        let target_page = r1_page_index(addr);

        let Some(lowest_stack_page) = self.procs.pcb(pid).region1.lowest_stack_page() else {
            return Err(KernelError::InvalidArg {
                what: "process has no stack",
            });
        };

        let mut grown: Vec<usize> = Vec::new();
        for page in target_page..lowest_stack_page {
            let pfn = match self.frames.alloc() {
                Ok(pfn) => pfn,
                Err(e) => {
                    // Roll back: no partial mapping survives a failure.
                    let pcb = self.procs.pcb_mut(pid);
                    for &p in &grown {
                        self.frames.free(pcb.region1.entry(p).pfn);
                        pcb.region1.entry_mut(p).invalidate();
                        self.hw.flush_tlb(TlbFlush::Page(r1_page_addr(p)));
                    }
                    return Err(e);
                }
            };

            // Zero before mapping so no stale data leaks into user space.
            self.kspace.map_scratch(&mut self.hw, pfn).zero();

            *self.procs.pcb_mut(pid).region1.entry_mut(page) =
                PageTableEntry::mapped(pfn, PageProt::RW);
            self.hw.flush_tlb(TlbFlush::Page(r1_page_addr(page)));
            grown.push(page);
        }

        if !grown.is_empty() {
            log::debug!(
                target: "mm",
                "grew stack of pid {} by {} pages to page {}",
                pid,
                grown.len(),
                target_page
            );
        }
        Ok(())
    }
}
