// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the Sv39 page-table engine
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - install_mapping/lookup_leaf agreement over multi-page ranges anywhere in
//!     the canonical space, including ranges that cross VPN[0] and VPN[1] boundaries
//!   - Idempotence of repeated installs
//!   - Clearing never allocates and always yields the invalid entry
//!   - Releasing emptied tables returns the table to its root-only shape
//!
//! TEST_SCENARIOS:
//!   - install_then_lookup_agrees(): every page holds pa + i * PAGE_SIZE and flags plus VALID
//!   - install_twice_is_idempotent(): second install changes neither PTEs nor allocator
//!   - clear_after_install_is_invalid(): empty flags clear every leaf, tables stay
//!   - release_after_clear_restores_pool(): emptied tables go back to the pool

use super::{FrameAllocator, FramePool, PageFlags, PageTable, Pte, PteKind, PAGE_SIZE};
use crate::types::{PhysAddr, VirtAddr};
use proptest::prelude::*;

/// Page index bits of a canonical Sv39 address (VPN[2..0]).
const VPN_BITS: usize = 27;

/// Page-aligned start plus a page count that stays inside one canonical half.
fn arb_range() -> impl Strategy<Value = (VirtAddr, usize)> {
    let anywhere = (0usize..512, 0usize..512, 0usize..512, 1usize..=4);
    // Last leaf slots of the last leaf table under a mid table: long ranges
    // from here cross both lower index boundaries.
    let near_boundary =
        (0usize..512, 508usize..512, 1usize..=8).prop_map(|(vpn2, vpn0, pages)| (vpn2, 511, vpn0, pages));
    prop_oneof![anywhere, near_boundary].prop_filter_map(
        "range leaves its canonical half",
        |(vpn2, vpn1, vpn0, pages)| {
            let first = (vpn2 << 18) | (vpn1 << 9) | vpn0;
            let last = first + pages - 1;
            if last >> VPN_BITS != 0 || first >> (VPN_BITS - 1) != last >> (VPN_BITS - 1) {
                return None;
            }
            let mut raw = first << 12;
            if vpn2 >= 256 {
                raw |= !((1usize << 39) - 1);
            }
            VirtAddr::new(raw).map(|va| (va, pages))
        },
    )
}

fn page(va: VirtAddr, index: usize) -> VirtAddr {
    VirtAddr::new(va.raw() + index * PAGE_SIZE).unwrap()
}

fn arb_pa() -> impl Strategy<Value = PhysAddr> {
    (0usize..(1 << 32)).prop_map(PhysAddr::from_ppn)
}

fn arb_flags() -> impl Strategy<Value = PageFlags> {
    (1usize..8, any::<bool>()).prop_map(|(rwx, user)| {
        let flags = PageFlags::from_bits_truncate(rwx << 1);
        if user {
            flags | PageFlags::USER
        } else {
            flags
        }
    })
}

proptest! {
    #[test]
    fn install_then_lookup_agrees((va, pages) in arb_range(), pa in arb_pa(), flags in arb_flags()) {
        let mut frames = FramePool::host(8);
        let mut table = PageTable::new(&mut frames).unwrap();
        table.install_mapping(&mut frames, va, pa, pages * PAGE_SIZE, flags).unwrap();
        for i in 0..pages {
            let expected = pa.offset(i * PAGE_SIZE);
            prop_assert_eq!(
                table.lookup_leaf(page(va, i)).kind(),
                PteKind::Leaf { pa: expected, flags: flags | PageFlags::VALID }
            );
            prop_assert_eq!(table.translate(page(va, i)), Some(expected));
        }
        let past_end = va.checked_add(pages * PAGE_SIZE).and_then(VirtAddr::new);
        if let Some(past_end) = past_end {
            prop_assert_eq!(table.lookup_leaf(past_end), Pte::INVALID);
        }
    }

    #[test]
    fn install_twice_is_idempotent((va, pages) in arb_range(), pa in arb_pa(), flags in arb_flags()) {
        let mut frames = FramePool::host(8);
        let mut table = PageTable::new(&mut frames).unwrap();
        table.install_mapping(&mut frames, va, pa, pages * PAGE_SIZE, flags).unwrap();
        let first: Vec<Pte> = (0..pages).map(|i| table.lookup_leaf(page(va, i))).collect();
        let free = frames.free_count();
        let tables = table.table_frames().len();
        table.install_mapping(&mut frames, va, pa, pages * PAGE_SIZE, flags).unwrap();
        let second: Vec<Pte> = (0..pages).map(|i| table.lookup_leaf(page(va, i))).collect();
        prop_assert_eq!(second, first);
        prop_assert_eq!(frames.free_count(), free);
        prop_assert_eq!(table.table_frames().len(), tables);
    }

    #[test]
    fn clear_after_install_is_invalid((va, pages) in arb_range(), pa in arb_pa(), flags in arb_flags()) {
        let mut frames = FramePool::host(8);
        let mut table = PageTable::new(&mut frames).unwrap();
        table.install_mapping(&mut frames, va, pa, pages * PAGE_SIZE, flags).unwrap();
        let free = frames.free_count();
        let tables = table.table_frames().len();
        table.install_mapping(&mut frames, va, PhysAddr::ZERO, pages * PAGE_SIZE, PageFlags::empty()).unwrap();
        for i in 0..pages {
            prop_assert_eq!(table.lookup_leaf(page(va, i)), Pte::INVALID);
        }
        prop_assert_eq!(frames.free_count(), free);
        prop_assert_eq!(table.table_frames().len(), tables);
    }

    #[test]
    fn release_after_clear_restores_pool((va, pages) in arb_range(), pa in arb_pa(), flags in arb_flags()) {
        let mut frames = FramePool::host(8);
        let mut table = PageTable::new(&mut frames).unwrap();
        let empty = frames.free_count();
        table.install_mapping(&mut frames, va, pa, pages * PAGE_SIZE, flags).unwrap();
        table.install_mapping(&mut frames, va, PhysAddr::ZERO, pages * PAGE_SIZE, PageFlags::empty()).unwrap();
        for i in 0..pages {
            table.release_empty_tables(&mut frames, page(va, i));
        }
        prop_assert_eq!(table.table_frames(), [table.root()]);
        prop_assert_eq!(frames.free_count(), empty);
    }
}
