// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation seam and the stock frame pool
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator (alloc_zeroed/free/free_count), FramePool, FrameError
//! DEPENDS_ON: types::PhysAddr
//! INVARIANTS: Handed-out frames are zeroed and page aligned; a frame is never
//!             handed out twice without an intervening free; double frees are rejected

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use super::PAGE_SIZE;
use crate::types::PhysAddr;

const WORD_BITS: usize = u64::BITS as usize;

/// Errors reported when returning frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Frame was not handed out by this allocator (or was already freed).
    NotAllocated,
    /// Address is unaligned or lies outside the managed region.
    OutOfPool,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAllocated => f.write_str("frame not allocated"),
            Self::OutOfPool => f.write_str("frame outside pool"),
        }
    }
}

/// Source of zeroed 4 KiB physical frames.
pub trait FrameAllocator {
    /// Allocates one zeroed, page-aligned frame; `None` when exhausted.
    fn alloc_zeroed(&mut self) -> Option<PhysAddr>;
    /// Returns `frame` to the allocator.
    fn free(&mut self, frame: PhysAddr) -> Result<(), FrameError>;
    /// Number of frames currently available.
    fn free_count(&self) -> usize;
}

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct Frame([u8; PAGE_SIZE]);

/// Bump allocator with a recycle stack over a contiguous frame range.
pub struct FramePool {
    base: PhysAddr,
    total: usize,
    next: usize,
    recycled: Vec<usize>,
    in_use: Vec<u64>,
    // Host builds own their backing memory; the target pool manages RAM
    // past the kernel image instead.
    _backing: Option<Vec<Frame>>,
}

impl FramePool {
    /// Creates a pool over the physical range `[start, end)`.
    ///
    /// # Safety
    /// The range must be identity-mapped RAM that nothing else uses for the
    /// lifetime of the pool.
    pub unsafe fn from_region(start: PhysAddr, end: PhysAddr) -> Self {
        let base = super::page_round_up(start.raw()).unwrap_or(end.raw());
        let total = end.raw().saturating_sub(base) / PAGE_SIZE;
        Self::with_base(PhysAddr::from_ppn(base / PAGE_SIZE), total, None)
    }

    /// Creates a pool of `frames` frames backed by kernel heap memory.
    pub fn host(frames: usize) -> Self {
        let mut backing = vec![Frame([0; PAGE_SIZE]); frames];
        let base = backing.as_mut_ptr() as usize;
        Self::with_base(PhysAddr::from_ppn(base / PAGE_SIZE), frames, Some(backing))
    }

    fn with_base(base: PhysAddr, total: usize, backing: Option<Vec<Frame>>) -> Self {
        Self {
            base,
            total,
            next: 0,
            recycled: Vec::new(),
            in_use: vec![0; total.div_ceil(WORD_BITS)],
            _backing: backing,
        }
    }

    /// Total number of frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.total
    }

    /// Returns true if `frame` is currently handed out.
    pub fn is_allocated(&self, frame: PhysAddr) -> bool {
        self.index_of(frame).map(|index| self.test_bit(index)).unwrap_or(false)
    }

    fn index_of(&self, frame: PhysAddr) -> Option<usize> {
        if !frame.is_page_aligned() || frame < self.base {
            return None;
        }
        let index = (frame.raw() - self.base.raw()) / PAGE_SIZE;
        (index < self.total).then_some(index)
    }

    fn test_bit(&self, index: usize) -> bool {
        self.in_use[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set_bit(&mut self, index: usize, value: bool) {
        let word = &mut self.in_use[index / WORD_BITS];
        let mask = 1u64 << (index % WORD_BITS);
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }
}

impl FrameAllocator for FramePool {
    fn alloc_zeroed(&mut self) -> Option<PhysAddr> {
        let index = match self.recycled.pop() {
            Some(index) => index,
            None if self.next < self.total => {
                self.next += 1;
                self.next - 1
            }
            None => {
                log_warn!(target: "frame", "frame pool exhausted ({} frames)", self.total);
                return None;
            }
        };
        self.set_bit(index, true);
        let frame = self.base.offset(index * PAGE_SIZE);
        // SAFETY: `frame` lies inside the pool and is exclusively owned by the
        // caller from here on.
        unsafe { core::ptr::write_bytes(frame.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        Some(frame)
    }

    fn free(&mut self, frame: PhysAddr) -> Result<(), FrameError> {
        let index = self.index_of(frame).ok_or(FrameError::OutOfPool)?;
        if !self.test_bit(index) {
            log_error!(target: "frame", "free of unallocated frame {}", frame);
            return Err(FrameError::NotAllocated);
        }
        self.set_bit(index, false);
        self.recycled.push(index);
        Ok(())
    }

    fn free_count(&self) -> usize {
        self.total - self.next + self.recycled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_distinct_zeroed_frames() {
        let mut pool = FramePool::host(4);
        let a = pool.alloc_zeroed().expect("frame a");
        let b = pool.alloc_zeroed().expect("frame b");
        assert_ne!(a, b);
        assert!(a.is_page_aligned() && b.is_page_aligned());
        unsafe { core::ptr::write_bytes(a.as_mut_ptr::<u8>(), 0xAA, PAGE_SIZE) };
        pool.free(a).unwrap();
        let again = pool.alloc_zeroed().expect("recycled frame");
        assert_eq!(again, a);
        let bytes = unsafe { core::slice::from_raw_parts(again.as_ptr::<u8>(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = FramePool::host(2);
        assert!(pool.alloc_zeroed().is_some());
        assert!(pool.alloc_zeroed().is_some());
        assert_eq!(pool.free_count(), 0);
        assert!(pool.alloc_zeroed().is_none());
    }

    #[test]
    fn rejects_double_and_foreign_frees() {
        let mut pool = FramePool::host(2);
        let frame = pool.alloc_zeroed().unwrap();
        assert_eq!(pool.free(frame), Ok(()));
        assert_eq!(pool.free(frame), Err(FrameError::NotAllocated));
        assert_eq!(pool.free(frame.offset(8)), Err(FrameError::OutOfPool));
        assert_eq!(pool.free(frame.offset(64 * PAGE_SIZE)), Err(FrameError::OutOfPool));
        assert_eq!(pool.free_count(), 2);
    }
}
