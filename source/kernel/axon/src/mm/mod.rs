// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory core for Sv39: page tables, VMAs, demand paging.

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod page_table;
pub mod vma;

pub use address_space::{AddressSpace, AddressSpaceError, AsidAllocator, Teardown};
pub use fault::{AccessKind, FaultOutcome, FaultReason};
pub use frame::{FrameAllocator, FrameError, FramePool};
pub use page_table::{MapError, PageFlags, PageTable, Pte, PteKind};
pub use vma::{Vma, VmaHandle, VmPerms};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Returns true if `va` is sign-extended from bit 38.
pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}

pub const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `len` up to whole pages, `None` on overflow.
pub fn page_round_up(len: usize) -> Option<usize> {
    len.checked_add(PAGE_SIZE - 1).map(align_down)
}

#[cfg(test)]
mod tests_prop;
