// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory areas and the per-address-space VMA arena
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vma, VmPerms, VmaHandle, VmaArena (insert/remove/get/find_containing/find_exact)
//! DEPENDS_ON: types::VirtAddr, mm::page_table::PageFlags
//! INVARIANTS: Handles stay valid until their own removal; stale handles are
//!             rejected via a per-slot generation; containment scans prefer the
//!             earliest inserted region

extern crate alloc;

use alloc::vec::Vec;
use core::num::NonZeroU32;

use bitflags::bitflags;

use super::page_table::PageFlags;
use crate::types::VirtAddr;

bitflags! {
    /// Access rights of a region. Bit positions match the PTE R/W/X bits so
    /// that user-supplied `prot` values and PTE flags convert losslessly.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct VmPerms: usize {
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
    }
}

impl VmPerms {
    /// Leaf flags for a user page backing this region.
    pub fn leaf_flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.bits()) | PageFlags::VALID | PageFlags::USER
    }
}

/// One declared region `[start, end)` of an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vma {
    start: VirtAddr,
    end: usize,
    perms: VmPerms,
    mapped: bool,
    seq: u64,
}

impl Vma {
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Exclusive end address.
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start.raw()
    }

    pub fn perms(&self) -> VmPerms {
        self.perms
    }

    /// True once any page of the region has been backed by a frame.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub(crate) fn mark_mapped(&mut self) {
        self.mapped = true;
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start.raw() && addr < self.end
    }

    /// Iterates the page-aligned addresses covered by the region.
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> {
        let start = self.start.raw();
        (start..self.end).step_by(super::PAGE_SIZE).filter_map(VirtAddr::new)
    }
}

/// Stable reference to a VMA inside its arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VmaHandle {
    slot: u32,
    generation: NonZeroU32,
}

struct Slot {
    generation: NonZeroU32,
    vma: Option<Vma>,
}

/// Error returned when the arena cannot grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaFull;

/// Slot arena of VMAs with generation-checked handles.
pub struct VmaArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_seq: u64,
    live: usize,
}

impl VmaArena {
    pub const fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), next_seq: 0, live: 0 }
    }

    /// Inserts `[start, end)` as an unmapped region.
    pub fn insert(&mut self, start: VirtAddr, end: usize, perms: VmPerms) -> Result<VmaHandle, ArenaFull> {
        let vma = Vma { start, end, perms, mapped: false, seq: self.next_seq };
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.slots.len()).map_err(|_| ArenaFull)?;
                self.slots.try_reserve(1).map_err(|_| ArenaFull)?;
                self.slots.push(Slot { generation: NonZeroU32::MIN, vma: None });
                slot
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.vma = Some(vma);
        self.next_seq += 1;
        self.live += 1;
        Ok(VmaHandle { slot, generation: entry.generation })
    }

    /// Detaches the VMA behind `handle`; later uses of the handle fail.
    pub fn remove(&mut self, handle: VmaHandle) -> Option<Vma> {
        let entry = self.slot_mut(handle)?;
        let vma = entry.vma.take()?;
        entry.generation = entry.generation.checked_add(1).unwrap_or(NonZeroU32::MIN);
        self.free.push(handle.slot);
        self.live -= 1;
        Some(vma)
    }

    pub fn get(&self, handle: VmaHandle) -> Option<&Vma> {
        self.slots
            .get(handle.slot as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.vma.as_ref())
    }

    pub fn get_mut(&mut self, handle: VmaHandle) -> Option<&mut Vma> {
        self.slot_mut(handle).and_then(|entry| entry.vma.as_mut())
    }

    /// First-inserted region containing `addr`.
    pub fn find_containing(&self, addr: usize) -> Option<VmaHandle> {
        self.iter()
            .filter(|(_, vma)| vma.contains(addr))
            .min_by_key(|(_, vma)| vma.seq)
            .map(|(handle, _)| handle)
    }

    /// Region whose bounds equal `[start, end)` exactly.
    pub fn find_exact(&self, start: usize, end: usize) -> Option<VmaHandle> {
        self.iter()
            .filter(|(_, vma)| vma.start.raw() == start && vma.end == end)
            .min_by_key(|(_, vma)| vma.seq)
            .map(|(handle, _)| handle)
    }

    /// Live regions in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (VmaHandle, &Vma)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry.vma.as_ref().map(|vma| (VmaHandle { slot: slot as u32, generation: entry.generation }, vma))
        })
    }

    /// Handles of all live regions; safe to remove while walking the result.
    pub fn handles(&self) -> Vec<VmaHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn slot_mut(&mut self, handle: VmaHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|entry| entry.generation == handle.generation)
    }
}

impl Default for VmaArena {
    fn default() -> Self {
        Self::new()
    }
}
