// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 address spaces: a page table plus the VMAs declared in it.

extern crate alloc;

use core::fmt;

use super::{
    frame::FrameAllocator,
    page_table::{MapError, PageFlags, PageTable, PteKind},
    vma::{ArenaFull, Vma, VmaArena, VmaHandle, VmPerms},
    PAGE_SIZE,
};
use crate::{
    config::MAX_ASIDS,
    hal::Tlb,
    types::{PhysAddr, VirtAddr},
};

/// Bytes covered by one level-0 table.
const LEAF_TABLE_SPAN: usize = PAGE_SIZE << 9;
const WORD_BITS: usize = core::mem::size_of::<u64>() * 8;
const BITMAP_WORDS: usize = (MAX_ASIDS + WORD_BITS - 1) / WORD_BITS;

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// VMA bookkeeping could not grow.
    NoMemory,
    /// Provided VMA handle was not recognised.
    InvalidHandle,
    /// Arguments supplied by the caller were invalid.
    InvalidArgs,
    /// No more ASIDs are available.
    AsidExhausted,
    /// Underlying page-table operation failed.
    Mapping(MapError),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

impl From<ArenaFull> for AddressSpaceError {
    fn from(_: ArenaFull) -> Self {
        Self::NoMemory
    }
}

impl fmt::Display for AddressSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mapping(err) => write!(f, "mapping: {err}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Frames returned by an address-space teardown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Teardown {
    pub data_frames: usize,
    pub table_frames: usize,
}

/// Tracks the state of a single Sv39 address space.
pub struct AddressSpace {
    page_table: PageTable,
    vmas: VmaArena,
    asid: u16,
}

impl AddressSpace {
    /// Creates an empty address space with a fresh root table.
    pub fn new(frames: &mut dyn FrameAllocator, asid: u16) -> Result<Self, AddressSpaceError> {
        let page_table = PageTable::new(frames)?;
        Ok(Self { page_table, vmas: VmaArena::new(), asid })
    }

    /// Returns the hardware ASID backing this address space.
    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// Returns the SATP value describing this address space.
    pub fn satp_value(&self) -> usize {
        self.page_table.satp_value(self.asid)
    }

    /// Borrows the page table for read-only inspection.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    /// Declares `[start, start + length)` with `perms`. Nothing is mapped and
    /// overlap with existing regions is not checked. The range must lie
    /// within one canonical half.
    pub fn add_region(
        &mut self,
        start: VirtAddr,
        length: usize,
        perms: VmPerms,
    ) -> Result<VmaHandle, AddressSpaceError> {
        let end = start.checked_add(length).ok_or(AddressSpaceError::InvalidArgs)?;
        if length == 0 {
            return Err(AddressSpaceError::InvalidArgs);
        }
        let last = VirtAddr::new(end - 1).ok_or(AddressSpaceError::InvalidArgs)?;
        if (last.raw() >> 38) & 1 != (start.raw() >> 38) & 1 {
            return Err(AddressSpaceError::InvalidArgs);
        }
        let handle = self.vmas.insert(start, end, perms)?;
        log_debug!(target: "mm", "AS{}: add region {}..{:#x} {:?}", self.asid, start, end, perms);
        Ok(handle)
    }

    /// First-inserted region containing `addr`.
    pub fn find_containing(&self, addr: VirtAddr) -> Option<VmaHandle> {
        self.vmas.find_containing(addr.raw())
    }

    /// Region whose bounds equal `[start, end)` exactly.
    pub fn find_exact(&self, start: VirtAddr, end: usize) -> Option<VmaHandle> {
        self.vmas.find_exact(start.raw(), end)
    }

    /// Detaches a region's bookkeeping. The page table is left untouched.
    pub fn remove(&mut self, handle: VmaHandle) -> Option<Vma> {
        self.vmas.remove(handle)
    }

    pub fn vma(&self, handle: VmaHandle) -> Option<&Vma> {
        self.vmas.get(handle)
    }

    pub(crate) fn vma_mut(&mut self, handle: VmaHandle) -> Option<&mut Vma> {
        self.vmas.get_mut(handle)
    }

    pub fn regions(&self) -> impl Iterator<Item = (VmaHandle, &Vma)> {
        self.vmas.iter()
    }

    pub fn region_count(&self) -> usize {
        self.vmas.len()
    }

    /// Tears down one region: frees every backing frame, clears the leaves,
    /// releases table pages left empty, drops the VMA and flushes stale
    /// translations. Returns the number of data frames released.
    pub fn unmap_region(
        &mut self,
        handle: VmaHandle,
        frames: &mut dyn FrameAllocator,
        tlb: &dyn Tlb,
    ) -> Result<usize, AddressSpaceError> {
        let vma = *self.vmas.get(handle).ok_or(AddressSpaceError::InvalidHandle)?;
        let mut released = 0;
        let mut tables = 0;
        if vma.is_mapped() {
            for page in vma.pages() {
                let PteKind::Leaf { pa, .. } = self.page_table.lookup_leaf(page).kind() else {
                    continue;
                };
                match frames.free(pa) {
                    Ok(()) => released += 1,
                    Err(err) => log_error!(target: "mm", "AS{}: free {} for {} failed: {}", self.asid, pa, page, err),
                }
                self.page_table.install_mapping(frames, page, PhysAddr::ZERO, PAGE_SIZE, PageFlags::empty())?;
            }
            let first = vma.start().raw() & !(LEAF_TABLE_SPAN - 1);
            for chunk in (first..vma.end()).step_by(LEAF_TABLE_SPAN).filter_map(VirtAddr::new) {
                tables += self.page_table.release_empty_tables(frames, chunk);
            }
        }
        self.vmas.remove(handle);
        tlb.flush_all();
        log_debug!(
            target: "mm",
            "AS{}: unmap {}..{:#x} released {} frame(s), {} table(s)",
            self.asid,
            vma.start(),
            vma.end(),
            released,
            tables
        );
        Ok(released)
    }

    /// Process-exit teardown: returns every frame backing a region and every
    /// page-table frame.
    pub fn destroy(self, frames: &mut dyn FrameAllocator, tlb: &dyn Tlb) -> Teardown {
        let Self { page_table, vmas, asid } = self;
        let mut teardown = Teardown::default();
        page_table.for_each_leaf(|va, pte| {
            if !pte.flags().contains(PageFlags::USER) || vmas.find_containing(va.raw()).is_none() {
                return;
            }
            match frames.free(pte.address()) {
                Ok(()) => teardown.data_frames += 1,
                Err(err) => log_error!(target: "mm", "AS{}: free {} failed: {}", asid, pte.address(), err),
            }
        });
        teardown.table_frames = page_table.destroy(frames);
        tlb.flush_all();
        log_info!(
            target: "mm",
            "AS{}: destroyed ({} data, {} table frames)",
            asid,
            teardown.data_frames,
            teardown.table_frames
        );
        teardown
    }
}

/// Bitmap ASID allocator; ASID 0 stays reserved for the kernel.
pub struct AsidAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
}

impl AsidAllocator {
    pub const fn new() -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        bitmap[0] |= 1;
        Self { bitmap, next: 1 }
    }

    pub fn allocate(&mut self) -> Result<u16, AddressSpaceError> {
        for _ in 0..MAX_ASIDS {
            let index = self.next % MAX_ASIDS;
            self.next = (index + 1) % MAX_ASIDS;
            let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Ok(index as u16);
            }
        }
        Err(AddressSpaceError::AsidExhausted)
    }

    pub fn free(&mut self, asid: u16) {
        let index = asid as usize;
        if index != 0 && index < MAX_ASIDS {
            self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }
}

impl Default for AsidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testing::CountingTlb;
    use crate::mm::frame::FramePool;

    fn va(raw: usize) -> VirtAddr {
        VirtAddr::new(raw).unwrap()
    }

    fn back_page(space: &mut AddressSpace, frames: &mut FramePool, addr: usize) -> PhysAddr {
        let handle = space.find_containing(va(addr)).unwrap();
        let flags = space.vma(handle).unwrap().perms().leaf_flags();
        let frame = frames.alloc_zeroed().unwrap();
        space
            .page_table_mut()
            .install_mapping(frames, va(addr), frame, PAGE_SIZE, flags)
            .unwrap();
        space.vma_mut(handle).unwrap().mark_mapped();
        frame
    }

    #[test]
    fn allocate_unique_asids() {
        let mut asids = AsidAllocator::new();
        let mut seen = alloc::collections::BTreeSet::new();
        for _ in 0..(MAX_ASIDS - 1) {
            let asid = asids.allocate().expect("allocate");
            assert_ne!(asid, 0);
            assert!(seen.insert(asid));
        }
        assert_eq!(asids.allocate(), Err(AddressSpaceError::AsidExhausted));
        asids.free(7);
        assert_eq!(asids.allocate(), Ok(7));
    }

    #[test]
    fn satp_encodes_mode_asid_and_root() {
        let mut frames = FramePool::host(2);
        let space = AddressSpace::new(&mut frames, 3).unwrap();
        let satp = space.satp_value();
        assert_eq!(satp >> 60, 8);
        assert_eq!((satp >> 44) & 0xffff, 3);
        assert_eq!(satp & ((1 << 44) - 1), space.page_table().root().ppn());
    }

    #[test]
    fn add_region_rejects_empty_and_non_canonical() {
        let mut frames = FramePool::host(2);
        let mut space = AddressSpace::new(&mut frames, 1).unwrap();
        assert_eq!(space.add_region(va(0x1000), 0, VmPerms::READ), Err(AddressSpaceError::InvalidArgs));
        assert_eq!(
            space.add_region(va((1 << 38) - PAGE_SIZE), 2 * PAGE_SIZE, VmPerms::READ),
            Err(AddressSpaceError::InvalidArgs)
        );
        // Both ends canonical, but the range jumps the hole between halves.
        assert_eq!(
            space.add_region(va(0x1000), 0xffff_ffc0_0000_0000, VmPerms::READ | VmPerms::WRITE),
            Err(AddressSpaceError::InvalidArgs)
        );
        assert_eq!(space.region_count(), 0);
        assert!(space.add_region(va(0xffff_ffc0_0000_0000), PAGE_SIZE, VmPerms::READ).is_ok());
    }

    #[test]
    fn unmap_region_frees_backing_frames() {
        let mut frames = FramePool::host(16);
        let tlb = CountingTlb::default();
        let mut space = AddressSpace::new(&mut frames, 1).unwrap();
        let before_region = frames.free_count();
        let handle = space.add_region(va(0x10000), 4 * PAGE_SIZE, VmPerms::READ | VmPerms::WRITE).unwrap();
        back_page(&mut space, &mut frames, 0x10000);
        back_page(&mut space, &mut frames, 0x12000);

        assert_eq!(space.unmap_region(handle, &mut frames, &tlb), Ok(2));
        assert_eq!(frames.free_count(), before_region);
        assert_eq!(space.page_table().table_frames().len(), 1);
        assert!(space.page_table().lookup_leaf(va(0x10000)).is_invalid());
        assert!(space.page_table().lookup_leaf(va(0x12000)).is_invalid());
        assert!(space.vma(handle).is_none());
        assert_eq!(tlb.full_flushes.get(), 1);
        assert_eq!(space.unmap_region(handle, &mut frames, &tlb), Err(AddressSpaceError::InvalidHandle));
    }

    #[test]
    fn unmap_keeps_tables_shared_with_other_regions() {
        let mut frames = FramePool::host(16);
        let tlb = CountingTlb::default();
        let mut space = AddressSpace::new(&mut frames, 1).unwrap();
        let first = space.add_region(va(0x10000), PAGE_SIZE, VmPerms::READ).unwrap();
        space.add_region(va(0x11000), PAGE_SIZE, VmPerms::READ).unwrap();
        back_page(&mut space, &mut frames, 0x10000);
        back_page(&mut space, &mut frames, 0x11000);
        let before = frames.free_count();

        assert_eq!(space.unmap_region(first, &mut frames, &tlb), Ok(1));
        assert_eq!(frames.free_count(), before + 1);
        assert_eq!(space.page_table().table_frames().len(), 3);
        assert!(space.page_table().lookup_leaf(va(0x11000)).is_leaf());
    }

    #[test]
    fn destroy_returns_every_frame() {
        let mut frames = FramePool::host(32);
        let tlb = CountingTlb::default();
        let initial = frames.free_count();
        let mut space = AddressSpace::new(&mut frames, 1).unwrap();
        space.add_region(va(0x10000), 2 * PAGE_SIZE, VmPerms::READ).unwrap();
        space.add_region(va(0x4000_0000), PAGE_SIZE, VmPerms::WRITE).unwrap();
        back_page(&mut space, &mut frames, 0x10000);
        back_page(&mut space, &mut frames, 0x11000);
        back_page(&mut space, &mut frames, 0x4000_0000);

        let teardown = space.destroy(&mut frames, &tlb);
        assert_eq!(teardown, Teardown { data_frames: 3, table_frames: 5 });
        assert_eq!(frames.free_count(), initial);
    }
}
