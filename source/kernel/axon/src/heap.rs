// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel heap backing `alloc` on the target.

use core::ptr::addr_of_mut;

use linked_list_allocator::LockedHeap;

use crate::config::KERNEL_HEAP_SIZE;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

#[repr(C, align(4096))]
struct HeapArena([u8; KERNEL_HEAP_SIZE]);

static mut ARENA: HeapArena = HeapArena([0; KERNEL_HEAP_SIZE]);

/// Hands the static arena to the global allocator. Call once during boot.
pub fn init() {
    // SAFETY: single-hart boot; ARENA is only ever handed out here.
    unsafe {
        let start = addr_of_mut!(ARENA) as *mut u8;
        HEAP.lock().init(start, KERNEL_HEAP_SIZE);
    }
}
