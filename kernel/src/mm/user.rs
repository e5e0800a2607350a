//! User-memory validation and access
//!
//! Every pointer or buffer range crossing the kernel boundary must lie
//! entirely in region 1; violations terminate the caller. Accesses resolve
//! the range through the owning process's region 1 table page by page, so a
//! range that crosses an unmapped page is also a bad access.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{string::String, vec, vec::Vec};

use crate::{
    bootstrap::Kernel,
    error::{KernelError, KernelResult},
    hal::{
        layout::{is_region1_addr, r1_page_index, PAGE_SIZE},
        Machine,
    },
    process::Pid,
};

/// Longest C string the kernel will read from user space (paths, argv
/// elements).
pub const MAX_USER_STRING: usize = 1024;

/// Most argv entries `exec` will accept.
pub const MAX_ARGV: usize = 32;

/// Check that `[addr, addr + len)` lies entirely in region 1.
pub fn check_user_range(addr: usize, len: usize) -> KernelResult<()> {
    let ok = len > 0
        && is_region1_addr(addr)
        && addr
            .checked_add(len - 1)
            .is_some_and(is_region1_addr);
    if ok {
        Ok(())
    } else {
        Err(KernelError::BadAccess { addr, len })
    }
}

impl<M: Machine> Kernel<M> {
    /// Copy `len` bytes out of `pid`'s region 1 into a kernel buffer.
    ///
    /// Public for simulator harnesses that need to inspect user memory.
    pub fn read_user_bytes(
        &self,
        pid: Pid,
        addr: usize,
        len: usize,
    ) -> KernelResult<Vec<u8>> {
        check_user_range(addr, len)?;
        let pcb = self.procs.pcb(pid);
        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        while out.len() < len {
            let page = r1_page_index(cursor);
            let pte = pcb.region1.entry(page);
            if !pte.valid {
                return Err(KernelError::BadAccess { addr, len });
            }
            let offset = cursor % PAGE_SIZE;
            let take = (PAGE_SIZE - offset).min(len - out.len());
            out.extend_from_slice(&self.hw.frame(pte.pfn)[offset..offset + take]);
            cursor += take;
        }
        Ok(out)
    }

    /// Copy a kernel buffer into `pid`'s region 1.
    ///
    /// Public for simulator harnesses that need to seed user memory.
    pub fn write_user_bytes(
        &mut self,
        pid: Pid,
        addr: usize,
        bytes: &[u8],
    ) -> KernelResult<()> {
        check_user_range(addr, bytes.len())?;
        let mut cursor = addr;
        let mut written = 0;
        while written < bytes.len() {
            let page = r1_page_index(cursor);
            let pte = *self.procs.pcb(pid).region1.entry(page);
            if !pte.valid {
                return Err(KernelError::BadAccess {
                    addr,
                    len: bytes.len(),
                });
            }
            let offset = cursor % PAGE_SIZE;
            let take = (PAGE_SIZE - offset).min(bytes.len() - written);
            self.hw.frame_mut(pte.pfn)[offset..offset + take]
                .copy_from_slice(&bytes[written..written + take]);
            cursor += take;
            written += take;
        }
        Ok(())
    }

    /// Zero `len` bytes of `pid`'s region 1.
    pub(crate) fn zero_user_range(&mut self, pid: Pid, addr: usize, len: usize) -> KernelResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.write_user_bytes(pid, addr, &vec![0u8; len])
    }

    /// Read a NUL-terminated string from `pid`'s region 1.
    pub(crate) fn read_user_cstring(&self, pid: Pid, addr: usize) -> KernelResult<String> {
        let mut bytes = Vec::new();
        for i in 0..MAX_USER_STRING {
            let byte = self.read_user_bytes(pid, addr + i, 1)?[0];
            if byte == 0 {
                return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArg {
                    what: "string is not valid UTF-8",
                });
            }
            bytes.push(byte);
        }
        Err(KernelError::InvalidArg {
            what: "unterminated user string",
        })
    }

    /// Read a zero-terminated array of user pointers (an argv vector).
    pub(crate) fn read_user_ptr_array(&self, pid: Pid, addr: usize) -> KernelResult<Vec<usize>> {
        const WORD: usize = core::mem::size_of::<usize>();
        let mut ptrs = Vec::new();
        for i in 0..MAX_ARGV {
            let raw = self.read_user_bytes(pid, addr + i * WORD, WORD)?;
            let mut word = [0u8; WORD];
            word.copy_from_slice(&raw);
            let ptr = usize::from_le_bytes(word);
            if ptr == 0 {
                return Ok(ptrs);
            }
            ptrs.push(ptr);
        }
        Err(KernelError::InvalidArg {
            what: "argv vector too long",
        })
    }
}
