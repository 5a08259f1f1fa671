// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host test doubles for the HAL traits.

extern crate alloc;

use alloc::vec::Vec;
use core::cell::Cell;

use super::{Console, Tlb};
use crate::types::VirtAddr;

/// Console capturing every byte written.
#[derive(Default)]
pub struct CaptureConsole {
    pub bytes: Vec<u8>,
}

impl Console for CaptureConsole {
    fn write_byte(&mut self, byte: u8) {
        self.bytes.push(byte);
    }
}

/// TLB counting flush requests.
#[derive(Default)]
pub struct CountingTlb {
    pub page_flushes: Cell<usize>,
    pub full_flushes: Cell<usize>,
}

impl Tlb for CountingTlb {
    fn flush_page(&self, _va: VirtAddr) {
        self.page_flushes.set(self.page_flushes.get() + 1);
    }

    fn flush_all(&self) {
        self.full_flushes.set(self.full_flushes.get() + 1);
    }
}
