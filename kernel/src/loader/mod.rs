//! Program loader
//!
//! Parses the executable header, wipes the target's region 1, builds the
//! new text/data/stack mapping, reads the segments in, tightens text to
//! R-X and constructs the initial argv stack. Up to the commit point (the
//! region 1 wipe) every failure is recoverable and the caller's image is
//! intact; afterwards a read failure is fatal to the target process.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{string::String, vec::Vec};

use crate::{
    bootstrap::Kernel,
    error::{KernelError, KernelResult},
    hal::{
        layout::{
            is_region1_addr, page_floor, r1_page_index, INITIAL_STACK_FRAME_SIZE, NUM_R1_PAGES,
            PAGE_SHIFT, PAGE_SIZE, VMEM_1_LIMIT,
        },
        Machine, TlbFlush, UserContext,
    },
    mm::page_table::{PageProt, PageTableEntry},
    process::Pid,
};

/// Magic number opening every executable header.
pub const EXEC_MAGIC: u32 = 0x5244_4758; // "RDGX"

/// Byte length of the on-disk header.
pub const EXEC_HEADER_LEN: usize = 44;

/// Parsed executable header.
///
/// All addresses are region 1 virtual addresses; offsets index the image
/// file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecHeader {
    /// Program entry point.
    pub entry: usize,
    /// File offset of the text segment.
    pub text_offset: usize,
    /// Virtual address of the text segment (page aligned).
    pub text_vaddr: usize,
    /// Text length in pages.
    pub text_pages: usize,
    /// File offset of the initialized-data segment.
    pub data_offset: usize,
    /// Virtual address of the initialized-data segment (page aligned).
    pub data_vaddr: usize,
    /// Initialized data length in pages.
    pub data_pages: usize,
    /// Uninitialized data length in pages.
    pub bss_pages: usize,
    /// First address past the initialized data.
    pub data_end: usize,
    /// First address past the uninitialized data.
    pub bss_end: usize,
}

impl ExecHeader {
    /// Parse and sanity-check a header.
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < EXEC_HEADER_LEN {
            return Err(KernelError::NotLoadable);
        }
        let word = |i: usize| -> usize {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_le_bytes(raw) as usize
        };
        if word(0) as u32 != EXEC_MAGIC {
            return Err(KernelError::NotLoadable);
        }
        let header = Self {
            entry: word(1),
            text_offset: word(2),
            text_vaddr: word(3),
            text_pages: word(4),
            data_offset: word(5),
            data_vaddr: word(6),
            data_pages: word(7),
            bss_pages: word(8),
            data_end: word(9),
            bss_end: word(10),
        };

        let aligned =
            header.text_vaddr % PAGE_SIZE == 0 && header.data_vaddr % PAGE_SIZE == 0;
        if !aligned
            || !is_region1_addr(header.entry)
            || !is_region1_addr(header.text_vaddr)
            || !is_region1_addr(header.data_vaddr)
        {
            return Err(KernelError::NotLoadable);
        }
        Ok(header)
    }
}

impl<M: Machine> Kernel<M> {
    /// Load the executable at `path` into `pid`'s region 1 and point its
    /// user context at the fresh image.
    ///
    /// `NotLoadable` and `NoMemory` leave the old image intact only if
    /// they occur before the region 1 wipe; `UnrecoverableLoad` means the
    /// target must be terminated.
    pub(crate) fn load_program(
        &mut self,
        pid: Pid,
        path: &str,
        args: &[String],
    ) -> KernelResult<()> {
        // The image is copied out of the machine's program store so it
        // stays readable while region 1 is being rebuilt.
        let image = self
            .hw
            .program_bytes(path)
            .ok_or(KernelError::NotLoadable)?
            .to_vec();
        let header = ExecHeader::parse(&image)?;

        let text_pg1 = r1_page_index(header.text_vaddr);
        let data_pg1 = r1_page_index(header.data_vaddr);
        let data_npg = header.data_pages + header.bss_pages;

        // Lay out the initial stack: argv strings at the top, then the
        // pointer array and argc, rounded down to a double word, with the
        // start-up stub's frame reserved above the stack pointer. The
        // argument bytes here are kernel-owned copies, so wiping region 1
        // cannot invalidate them.
        const WORD: usize = core::mem::size_of::<usize>();
        let strings_len: usize = args.iter().map(|a| a.len() + 1).sum();
        let argcount = args.len();
        let cp = VMEM_1_LIMIT - strings_len;
        let cpp = (cp - (argcount + 3) * WORD) & !7;
        let sp = cpp - INITIAL_STACK_FRAME_SIZE;
        let stack_npg = (VMEM_1_LIMIT - page_floor(sp)) >> PAGE_SHIFT;

        // Reject layouts the region 1 table cannot hold: segments must
        // stay in bounds, text below data, and at least one guard page
        // between heap and stack.
        let text_end_pg = text_pg1 + header.text_pages;
        let data_end_pg = data_pg1 + data_npg;
        if text_end_pg > NUM_R1_PAGES - stack_npg
            || data_end_pg > NUM_R1_PAGES
            || (data_npg > 0 && text_end_pg > data_pg1)
            || header.bss_end < header.data_end
            || header.bss_end > VMEM_1_LIMIT
            || data_pg1 + data_npg + stack_npg >= NUM_R1_PAGES
        {
            return Err(KernelError::NotLoadable);
        }

        // Commit point. Throw away the old region 1.
        {
            let pcb = self.procs.pcb_mut(pid);
            for page in 0..NUM_R1_PAGES {
                let entry = pcb.region1.entry_mut(page);
                if entry.valid {
                    self.frames.free(entry.pfn);
                    entry.invalidate();
                }
            }
            pcb.brk = None;
        }
        self.hw.flush_tlb(TlbFlush::Region1);

        // Build the new mapping: text and data writable for the segment
        // reads, the stack at the top. Every fresh frame is zeroed through
        // the scratch page before it becomes visible.
        let mut plan: Vec<(usize, PageProt)> = Vec::new();
        plan.extend((text_pg1..text_pg1 + header.text_pages).map(|p| (p, PageProt::RW)));
        plan.extend((data_pg1..data_pg1 + data_npg).map(|p| (p, PageProt::RW)));
        plan.extend((NUM_R1_PAGES - stack_npg..NUM_R1_PAGES).map(|p| (p, PageProt::RW)));

        let mut mapped: Vec<usize> = Vec::new();
        for &(page, prot) in &plan {
            match self.frames.alloc() {
                Ok(pfn) => {
                    self.kspace.map_scratch(&mut self.hw, pfn).zero();
                    *self.procs.pcb_mut(pid).region1.entry_mut(page) =
                        PageTableEntry::mapped(pfn, prot);
                    mapped.push(page);
                }
                Err(e) => {
                    let pcb = self.procs.pcb_mut(pid);
                    for &p in &mapped {
                        self.frames.free(pcb.region1.entry(p).pfn);
                        pcb.region1.entry_mut(p).invalidate();
                    }
                    self.hw.flush_tlb(TlbFlush::Region1);
                    return Err(e);
                }
            }
        }
        self.hw.flush_tlb(TlbFlush::Region1);

        // Read the segments. A short image past this point is fatal to
        // the process.
        let text_len = header.text_pages << PAGE_SHIFT;
        let data_len = header.data_pages << PAGE_SHIFT;
        let text = image
            .get(header.text_offset..header.text_offset + text_len)
            .ok_or(KernelError::UnrecoverableLoad)?
            .to_vec();
        let data = image
            .get(header.data_offset..header.data_offset + data_len)
            .ok_or(KernelError::UnrecoverableLoad)?
            .to_vec();
        if text_len > 0 {
            self.write_user_bytes(pid, header.text_vaddr, &text)
                .map_err(|_| KernelError::UnrecoverableLoad)?;
        }
        if data_len > 0 {
            self.write_user_bytes(pid, header.data_vaddr, &data)
                .map_err(|_| KernelError::UnrecoverableLoad)?;
        }

        // Text becomes execute-only-plus-read; stale writable translations
        // must not survive, so flush everything.
        {
            let pcb = self.procs.pcb_mut(pid);
            for page in text_pg1..text_pg1 + header.text_pages {
                pcb.region1.entry_mut(page).prot = PageProt::RX;
            }
        }
        self.hw.flush_tlb(TlbFlush::All);

        // Zero the uninitialized-data range.
        if header.bss_end > header.data_end {
            self.zero_user_range(pid, header.data_end, header.bss_end - header.data_end)
                .map_err(|_| KernelError::UnrecoverableLoad)?;
        }

        // Build the argument list on the new stack.
        let mut cursor = cp;
        let mut argv: Vec<usize> = Vec::with_capacity(argcount);
        for arg in args {
            let mut bytes = arg.as_bytes().to_vec();
            bytes.push(0);
            self.write_user_bytes(pid, cursor, &bytes)
                .map_err(|_| KernelError::UnrecoverableLoad)?;
            argv.push(cursor);
            cursor += bytes.len();
        }
        let mut words: Vec<u8> = Vec::with_capacity((argcount + 3) * WORD);
        words.extend_from_slice(&argcount.to_le_bytes());
        for &ptr in &argv {
            words.extend_from_slice(&ptr.to_le_bytes());
        }
        words.extend_from_slice(&0usize.to_le_bytes()); // argv terminator
        words.extend_from_slice(&0usize.to_le_bytes()); // empty envp
        self.write_user_bytes(pid, cpp, &words)
            .map_err(|_| KernelError::UnrecoverableLoad)?;

        // Point the process at the fresh image.
        {
            let pcb = self.procs.pcb_mut(pid);
            pcb.user_context = UserContext {
                pc: header.entry,
                sp,
                ..UserContext::default()
            };
            pcb.brk = Some(header.bss_end);
            pcb.name = String::from(path);
        }

        log::info!(
            target: "loader",
            "loaded '{}' into pid {}: {} text, {} data, {} stack pages",
            path,
            pid,
            header.text_pages,
            data_npg,
            stack_npg
        );
        Ok(())
    }
}

/// Builder for packed executable images, used by the test suite and by
/// simulator harnesses that stock the boot medium.
pub struct ExecImageBuilder {
    entry: usize,
    text: Vec<u8>,
    data: Vec<u8>,
    bss_pages: usize,
    text_vaddr: usize,
    truncate_to: Option<usize>,
}

impl ExecImageBuilder {
    /// Start an image whose text segment begins at the bottom of
    /// region 1.
    pub fn new() -> Self {
        Self {
            entry: crate::hal::layout::VMEM_1_BASE,
            text: Vec::new(),
            data: Vec::new(),
            bss_pages: 0,
            text_vaddr: crate::hal::layout::VMEM_1_BASE,
            truncate_to: None,
        }
    }

    /// Set the entry point.
    pub fn entry(mut self, entry: usize) -> Self {
        self.entry = entry;
        self
    }

    /// Provide text bytes (padded to whole pages).
    pub fn text(mut self, text: &[u8]) -> Self {
        self.text = text.to_vec();
        self
    }

    /// Provide initialized-data bytes (padded to whole pages).
    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    /// Number of uninitialized-data pages following the data segment.
    pub fn bss_pages(mut self, pages: usize) -> Self {
        self.bss_pages = pages;
        self
    }

    /// Truncate the finished image to `len` bytes, producing a file whose
    /// header promises more than the file delivers.
    pub fn truncate_to(mut self, len: usize) -> Self {
        self.truncate_to = Some(len);
        self
    }

    /// Produce the packed image.
    pub fn build(self) -> Vec<u8> {
        let text_pages = self.text.len().div_ceil(PAGE_SIZE).max(1);
        let data_pages = self.data.len().div_ceil(PAGE_SIZE);
        let text_vaddr = self.text_vaddr;
        let data_vaddr = text_vaddr + text_pages * PAGE_SIZE;
        let text_offset = EXEC_HEADER_LEN;
        let data_offset = text_offset + text_pages * PAGE_SIZE;
        let data_end = data_vaddr + data_pages * PAGE_SIZE;
        let bss_end = data_end + self.bss_pages * PAGE_SIZE;

        let mut out = Vec::new();
        for value in [
            EXEC_MAGIC as usize,
            self.entry,
            text_offset,
            text_vaddr,
            text_pages,
            data_offset,
            data_vaddr,
            data_pages,
            self.bss_pages,
            data_end,
            bss_end,
        ] {
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        out.extend_from_slice(&self.text);
        out.resize(text_offset + text_pages * PAGE_SIZE, 0);
        out.extend_from_slice(&self.data);
        out.resize(data_offset + data_pages * PAGE_SIZE, 0);

        if let Some(len) = self.truncate_to {
            out.truncate(len);
        }
        out
    }
}

impl Default for ExecImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
