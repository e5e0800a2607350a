//! Physical frame allocator
//!
//! A flat bitmap over physical frames, one bit per frame, set while the
//! frame is in use. Allocation always returns the lowest free frame, which
//! keeps placement deterministic for the test suite.

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::{vec, vec::Vec};

use crate::error::{KernelError, KernelResult};

/// Bitmap of physical frames.
pub struct FrameBitmap {
    /// One bit per frame, 1 = in use.
    bits: Vec<u8>,
    num_frames: usize,
    used: usize,
}

impl FrameBitmap {
    /// Create a bitmap with every frame free.
    pub fn new(num_frames: usize) -> Self {
        Self {
            bits: vec![0; num_frames.div_ceil(8)],
            num_frames,
            used: 0,
        }
    }

    /// Number of frames tracked.
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Number of frames currently marked used.
    pub fn used_count(&self) -> usize {
        self.used
    }

    /// Whether `frame` is currently marked used.
    pub fn is_used(&self, frame: usize) -> bool {
        self.bits[frame / 8] & (1 << (frame % 8)) != 0
    }

    /// Allocate the lowest free frame, or report exhaustion.
    pub fn alloc(&mut self) -> KernelResult<usize> {
        for (byte_idx, byte) in self.bits.iter_mut().enumerate() {
            if *byte == 0xFF {
                continue;
            }
            for bit in 0..8 {
                if *byte & (1 << bit) == 0 {
                    let frame = byte_idx * 8 + bit;
                    if frame >= self.num_frames {
                        break;
                    }
                    *byte |= 1 << bit;
                    self.used += 1;
                    log::trace!(target: "mm", "allocated frame {}", frame);
                    return Ok(frame);
                }
            }
        }
        Err(KernelError::NoMemory {
            what: "physical frames",
        })
    }

    /// Return a frame to the free pool.
    pub fn free(&mut self, frame: usize) {
        debug_assert!(frame < self.num_frames);
        let byte = frame / 8;
        let bit = 1 << (frame % 8);
        if self.bits[byte] & bit == 0 {
            log::warn!(target: "mm", "double free of frame {}", frame);
            return;
        }
        self.bits[byte] &= !bit;
        self.used -= 1;
        log::trace!(target: "mm", "freed frame {}", frame);
    }

    /// Mark a specific frame as used. Used for frames pinned at boot
    /// (identity-mapped kernel image and kernel stack); idempotent.
    pub fn mark_used(&mut self, frame: usize) {
        debug_assert!(frame < self.num_frames);
        let byte = frame / 8;
        let bit = 1 << (frame % 8);
        if self.bits[byte] & bit == 0 {
            self.bits[byte] |= bit;
            self.used += 1;
        }
    }
}
