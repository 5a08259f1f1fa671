// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address and identity newtypes used across the VM core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, PhysAddr, Pid
//! DEPENDS_ON: mm::{PAGE_SIZE, is_canonical_sv39}
//! INVARIANTS: VirtAddr is canonical Sv39; PhysAddr fits the 44-bit PPN field

use core::fmt;

use crate::mm::{is_canonical_sv39, PAGE_SIZE};

/// Highest physical address representable by an Sv39 PTE (56-bit PA).
const PHYS_ADDR_LIMIT: usize = 1 << 56;

/// Canonical Sv39 virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical_sv39(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| va.is_page_aligned())
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Rounds down to the containing page boundary.
    #[inline]
    pub const fn page_floor(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the three VPN indices in walk order: `[VPN[2], VPN[1], VPN[0]]`.
    #[inline]
    pub const fn vpn_indices(self) -> [usize; 3] {
        [(self.0 >> 30) & 0x1ff, (self.0 >> 21) & 0x1ff, (self.0 >> 12) & 0x1ff]
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<usize> {
        self.0.checked_add(bytes)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical address. The kernel reaches physical memory through an identity
/// mapping, so a `PhysAddr` doubles as a kernel pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < PHYS_ADDR_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn from_ppn(ppn: usize) -> Self {
        Self(ppn << 12)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn ppn(self) -> usize {
        self.0 >> 12
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Process identifier.
///
/// **Ownership**: Only `TaskTable` hands out PIDs.
/// **Invariant**: PID 0 is reserved for the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    pub const KERNEL: Self = Self(0);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_indices_follow_sv39_layout() {
        let va = VirtAddr::new((3 << 30) | (7 << 21) | (9 << 12) | 0x123).unwrap();
        assert_eq!(va.vpn_indices(), [3, 7, 9]);
        assert_eq!(va.page_offset(), 0x123);
        assert_eq!(va.page_floor().raw(), (3 << 30) | (7 << 21) | (9 << 12));
    }

    #[test]
    fn rejects_non_canonical_addresses() {
        assert!(VirtAddr::new(1 << 40).is_none());
        assert!(VirtAddr::new(usize::MAX).is_some());
        assert!(VirtAddr::page_aligned(0x1001).is_none());
    }

    #[test]
    fn phys_addr_ppn_roundtrip() {
        let pa = PhysAddr::new(0x8020_3000).unwrap();
        assert_eq!(PhysAddr::from_ppn(pa.ppn()), pa);
        assert!(PhysAddr::new(1 << 56).is_none());
    }
}
