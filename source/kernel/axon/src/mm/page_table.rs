// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table engine with lazy allocation of intermediate levels.
//!
//! Table pages come from a [`FrameAllocator`] and are reached through the
//! kernel's identity mapping of physical memory. Every table frame the engine
//! allocates (root included) is recorded so that [`PageTable::destroy`] can
//! hand all of them back.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use static_assertions::{assert_eq_size, const_assert_eq};

use super::{frame::FrameAllocator, page_round_up, PAGE_SIZE};
use crate::types::{PhysAddr, VirtAddr};

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
const PPN_SHIFT: usize = 10;
const PPN_MASK: usize = (1 << 44) - 1;
const FLAG_MASK: usize = (1 << PPN_SHIFT) - 1;

const_assert_eq!(core::mem::size_of::<usize>(), 8);

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    /// Flags stored in an Sv39 PTE.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Permission bits that turn a valid entry into a leaf.
pub const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range or the PA limit.
    OutOfRange,
    /// Walk hit a leaf above level 0 (huge mapping).
    Overlap,
    /// No frame was available for an intermediate table.
    OutOfFrames,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unaligned => "unaligned address",
            Self::OutOfRange => "address out of range",
            Self::Overlap => "huge leaf in walk",
            Self::OutOfFrames => "out of physical frames",
        };
        f.write_str(text)
    }
}

/// Decoded view of a page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PteKind {
    /// Validity bit clear.
    Unmapped,
    /// Valid entry with at least one of R/W/X.
    Leaf { pa: PhysAddr, flags: PageFlags },
    /// Valid entry without R/W/X pointing at the next-level table.
    Table { pa: PhysAddr },
}

/// Raw Sv39 page-table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    /// The all-zero entry; the only invalid encoding this engine writes.
    pub const INVALID: Self = Self(0);

    /// Encodes a leaf for the page at `pa`. VALID is always set.
    pub fn leaf(pa: PhysAddr, flags: PageFlags) -> Self {
        Self(((pa.ppn() & PPN_MASK) << PPN_SHIFT) | (flags | PageFlags::VALID).bits())
    }

    /// Encodes a pointer to the next-level table at `pa`.
    pub fn table(pa: PhysAddr) -> Self {
        Self(((pa.ppn() & PPN_MASK) << PPN_SHIFT) | PageFlags::VALID.bits())
    }

    pub const fn from_bits(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn bits(self) -> usize {
        self.0
    }

    pub const fn is_invalid(self) -> bool {
        self.0 & PageFlags::VALID.bits() == 0
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    pub fn is_leaf(self) -> bool {
        !self.is_invalid() && self.flags().intersects(LEAF_PERMS)
    }

    /// Physical address encoded in the PPN field.
    pub fn address(self) -> PhysAddr {
        PhysAddr::from_ppn((self.0 >> PPN_SHIFT) & PPN_MASK)
    }

    /// Inverse of [`Pte::table`]; `None` for leaves and invalid entries.
    pub fn table_address(self) -> Option<PhysAddr> {
        match self.kind() {
            PteKind::Table { pa } => Some(pa),
            _ => None,
        }
    }

    pub fn kind(self) -> PteKind {
        if self.is_invalid() {
            PteKind::Unmapped
        } else if self.is_leaf() {
            PteKind::Leaf { pa: self.address(), flags: self.flags() }
        } else {
            PteKind::Table { pa: self.address() }
        }
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#x}: {:?})", self.0, self.kind())
    }
}

#[repr(C, align(4096))]
struct TablePage {
    entries: [Pte; PT_ENTRIES],
}

assert_eq_size!(TablePage, [u8; PAGE_SIZE]);

/// Reinterprets the frame at `pa` as a page-table page.
///
/// # Safety
/// `pa` must be a table frame owned by a live [`PageTable`] and reachable
/// through the identity mapping; no other reference to it may be live.
unsafe fn table_at<'a>(pa: PhysAddr) -> &'a mut TablePage {
    // SAFETY: upheld by the caller.
    unsafe { &mut *pa.as_mut_ptr::<TablePage>() }
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
pub struct PageTable {
    root: PhysAddr,
    owned: Vec<PhysAddr>,
}

impl PageTable {
    /// Allocates a zeroed root table.
    pub fn new(frames: &mut dyn FrameAllocator) -> Result<Self, MapError> {
        let root = frames.alloc_zeroed().ok_or(MapError::OutOfFrames)?;
        let mut owned = Vec::new();
        owned.push(root);
        Ok(Self { root, owned })
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root.ppn()
    }

    /// SATP value selecting this table in Sv39 mode under `asid`.
    pub fn satp_value(&self, asid: u16) -> usize {
        const MODE_SV39: usize = 8;
        (MODE_SV39 << 60) | ((asid as usize) << 44) | self.root_ppn()
    }

    /// Every table frame owned by this page table, root first.
    pub fn table_frames(&self) -> &[PhysAddr] {
        &self.owned
    }

    /// Maps `[va, va + size)` onto `[pa, pa + size)` one page at a time.
    ///
    /// Level-0 entries are overwritten unconditionally. `flags` without any of
    /// R/W/X clears the covered entries instead; clearing never allocates.
    /// `size` is rounded up to whole pages.
    pub fn install_mapping(
        &mut self,
        frames: &mut dyn FrameAllocator,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        let pages = page_round_up(size).ok_or(MapError::OutOfRange)? / PAGE_SIZE;
        if pages == 0 {
            return Ok(());
        }
        let span = (pages - 1) * PAGE_SIZE;
        let last_va = va.checked_add(span).and_then(VirtAddr::new).ok_or(MapError::OutOfRange)?;
        if (last_va.raw() >> 38) & 1 != (va.raw() >> 38) & 1 {
            return Err(MapError::OutOfRange);
        }
        pa.raw().checked_add(span).and_then(PhysAddr::new).ok_or(MapError::OutOfRange)?;

        let clear = !flags.intersects(LEAF_PERMS);
        for page in 0..pages {
            let step = page * PAGE_SIZE;
            let va_step = VirtAddr::new(va.raw() + step).ok_or(MapError::OutOfRange)?;
            if clear {
                if let Some(entry) = self.walk(va_step)? {
                    *entry = Pte::INVALID;
                }
            } else {
                let entry = self.walk_create(frames, va_step)?;
                *entry = Pte::leaf(pa.offset(step), flags);
            }
        }
        Ok(())
    }

    /// Returns the level-0 entry for `va`, or [`Pte::INVALID`] if an
    /// intermediate level is absent. Never allocates.
    pub fn lookup_leaf(&self, va: VirtAddr) -> Pte {
        let [vpn2, vpn1, vpn0] = va.vpn_indices();
        let mut table = self.root;
        for index in [vpn2, vpn1] {
            // SAFETY: `table` is the root or a table frame reached through a
            // table pointer we installed; the shared borrow ends immediately.
            let entry = unsafe { table_at(table) }.entries[index];
            match entry.table_address() {
                Some(next) => table = next,
                None => return Pte::INVALID,
            }
        }
        // SAFETY: as above.
        unsafe { table_at(table) }.entries[vpn0]
    }

    /// Translates `va` to a physical address if a leaf maps it.
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        match self.lookup_leaf(va.page_floor()).kind() {
            PteKind::Leaf { pa, .. } => Some(pa.offset(va.page_offset())),
            _ => None,
        }
    }

    /// Visits every level-0 leaf as `(va, pte)`.
    pub fn for_each_leaf(&self, mut visit: impl FnMut(VirtAddr, Pte)) {
        // SAFETY (all blocks below): only frames reached through installed
        // table pointers are dereferenced, and only for reading.
        let root = unsafe { table_at(self.root) };
        for (i2, l2) in root.entries.iter().enumerate() {
            let Some(mid_pa) = l2.table_address() else { continue };
            let mid = unsafe { table_at(mid_pa) };
            for (i1, l1) in mid.entries.iter().enumerate() {
                let Some(leaf_pa) = l1.table_address() else { continue };
                let leaves = unsafe { table_at(leaf_pa) };
                for (i0, pte) in leaves.entries.iter().enumerate() {
                    if !pte.is_leaf() {
                        continue;
                    }
                    if let Some(va) = sign_extend((i2 << 30) | (i1 << 21) | (i0 << 12)) {
                        visit(va, *pte);
                    }
                }
            }
        }
    }

    /// Returns every table frame to `frames`. Leaf frames are not touched;
    /// the owning address space frees those first.
    pub fn destroy(mut self, frames: &mut dyn FrameAllocator) -> usize {
        let mut freed = 0;
        for table in self.owned.drain(..) {
            match frames.free(table) {
                Ok(()) => freed += 1,
                Err(err) => log_error!(target: "pt", "PT: free table {} failed: {}", table, err),
            }
        }
        freed
    }

    /// Releases the level-0 table covering `va` once all of its entries are
    /// invalid, then its level-1 parent under the same condition. The
    /// parent's pointer is cleared before a table frame is freed. Returns the
    /// number of table frames handed back; the root is never released.
    pub fn release_empty_tables(&mut self, frames: &mut dyn FrameAllocator, va: VirtAddr) -> usize {
        let [vpn2, vpn1, _] = va.vpn_indices();
        // SAFETY (all blocks below): exclusive access through `&mut self`;
        // each borrow ends within its statement.
        let Some(mid) = unsafe { table_at(self.root) }.entries[vpn2].table_address() else {
            return 0;
        };
        let mut released = 0;
        if let Some(leaf) = unsafe { table_at(mid) }.entries[vpn1].table_address() {
            if !table_is_empty(leaf) {
                return 0;
            }
            unsafe { table_at(mid) }.entries[vpn1] = Pte::INVALID;
            released += self.release_table(frames, leaf);
        }
        if table_is_empty(mid) {
            unsafe { table_at(self.root) }.entries[vpn2] = Pte::INVALID;
            released += self.release_table(frames, mid);
        }
        released
    }

    fn release_table(&mut self, frames: &mut dyn FrameAllocator, table: PhysAddr) -> usize {
        if let Some(index) = self.owned.iter().position(|&owned| owned == table) {
            self.owned.swap_remove(index);
        }
        match frames.free(table) {
            Ok(()) => 1,
            Err(err) => {
                log_error!(target: "pt", "PT: free table {} failed: {}", table, err);
                0
            }
        }
    }

    /// Walks to the level-0 entry for `va` without allocating.
    fn walk(&mut self, va: VirtAddr) -> Result<Option<&mut Pte>, MapError> {
        let [vpn2, vpn1, vpn0] = va.vpn_indices();
        let mut table = self.root;
        for index in [vpn2, vpn1] {
            // SAFETY: exclusive access through `&mut self`; see `table_at`.
            let entry = unsafe { table_at(table) }.entries[index];
            table = match entry.kind() {
                PteKind::Table { pa } => pa,
                PteKind::Leaf { .. } => return Err(MapError::Overlap),
                PteKind::Unmapped => return Ok(None),
            };
        }
        // SAFETY: as above.
        Ok(Some(unsafe { &mut table_at(table).entries[vpn0] }))
    }

    /// Walks to the level-0 entry for `va`, allocating missing tables.
    fn walk_create(
        &mut self,
        frames: &mut dyn FrameAllocator,
        va: VirtAddr,
    ) -> Result<&mut Pte, MapError> {
        let [vpn2, vpn1, vpn0] = va.vpn_indices();
        let mut table = self.root;
        for index in [vpn2, vpn1] {
            // SAFETY: exclusive access through `&mut self`; see `table_at`.
            let entry = unsafe { &mut table_at(table).entries[index] };
            table = match entry.kind() {
                PteKind::Table { pa } => pa,
                PteKind::Leaf { .. } => return Err(MapError::Overlap),
                PteKind::Unmapped => {
                    let next = frames.alloc_zeroed().ok_or(MapError::OutOfFrames)?;
                    self.owned.push(next);
                    *entry = Pte::table(next);
                    next
                }
            };
        }
        // SAFETY: as above.
        Ok(unsafe { &mut table_at(table).entries[vpn0] })
    }
}

fn table_is_empty(table: PhysAddr) -> bool {
    // SAFETY: only called on table frames reached through installed pointers.
    unsafe { table_at(table) }.entries.iter().all(|pte| pte.is_invalid())
}

fn sign_extend(va: usize) -> Option<VirtAddr> {
    let raw = if va & (1 << 38) != 0 { va | !((1 << 39) - 1) } else { va };
    VirtAddr::new(raw)
}
