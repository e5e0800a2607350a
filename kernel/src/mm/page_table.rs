//! Page-table entries and the per-process region 1 table

use core::fmt;

use bitflags::bitflags;

use crate::hal::layout::{KSTACK_PAGES, NUM_R1_PAGES};

bitflags! {
    /// Page protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageProt: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl PageProt {
    /// Read/write data page.
    pub const RW: Self = Self::READ.union(Self::WRITE);
    /// Read/execute text page.
    pub const RX: Self = Self::READ.union(Self::EXEC);
}

/// A software-loaded page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry {
    /// Whether the translation is live.
    pub valid: bool,
    /// Protection bits checked by the machine.
    pub prot: PageProt,
    /// Physical frame backing the page.
    pub pfn: usize,
}

impl PageTableEntry {
    /// A live mapping to `pfn` with protection `prot`.
    pub const fn mapped(pfn: usize, prot: PageProt) -> Self {
        Self {
            valid: true,
            prot,
            pfn,
        }
    }

    /// Drop the translation. The frame itself is the caller's to free.
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }
}

/// Page-table entries describing a kernel stack.
pub type KernelStackTable = [PageTableEntry; KSTACK_PAGES];

/// A region 1 page table, fixed at [`NUM_R1_PAGES`] entries.
///
/// Owned by exactly one PCB; entry lifetimes equal the PCB's.
#[derive(Clone)]
pub struct Region1Table {
    entries: [PageTableEntry; NUM_R1_PAGES],
}

impl Region1Table {
    /// A table with every entry invalid.
    pub const fn empty() -> Self {
        Self {
            entries: [PageTableEntry {
                valid: false,
                prot: PageProt::empty(),
                pfn: 0,
            }; NUM_R1_PAGES],
        }
    }

    /// Entry for region 1 page `index`.
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    /// Mutable entry for region 1 page `index`.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    /// Iterate `(page_index, entry)` over the valid entries.
    pub fn valid_entries(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.valid)
    }

    /// Number of valid entries.
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    /// Page index of the lowest page of the contiguous valid run ending at
    /// the top of region 1, the current stack floor. `None` when no page
    /// at the top is mapped.
    pub fn lowest_stack_page(&self) -> Option<usize> {
        let mut lowest = None;
        for i in (0..NUM_R1_PAGES).rev() {
            if !self.entries[i].valid {
                break;
            }
            lowest = Some(i);
        }
        lowest
    }

    /// Base address of the table, written to the region 1 base register.
    pub fn base_token(&self) -> usize {
        self.entries.as_ptr() as usize
    }
}

impl Default for Region1Table {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Region1Table {
    /// Dumps only the valid entries, one per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "region 1 page table:")?;
        for (i, e) in self.valid_entries() {
            writeln!(f, "  page {:3} -> pfn {:4} prot {:?}", i, e.pfn, e.prot)?;
        }
        Ok(())
    }
}
