// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use core::fmt::Write;

use super::{Console, Tlb};
use crate::types::VirtAddr;

/// Console backed by the boot UART.
pub struct VirtConsole;

impl Console for VirtConsole {
    fn write_byte(&mut self, byte: u8) {
        crate::uart::KernelUart::lock().write_byte(byte);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let mut uart = crate::uart::KernelUart::lock();
        for &byte in bytes {
            uart.write_byte(byte);
        }
    }
}

impl Write for VirtConsole {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Sv39 TLB helper issuing `sfence.vma`.
pub struct VirtTlb;

impl Tlb for VirtTlb {
    fn flush_page(&self, va: VirtAddr) {
        // SAFETY: sfence.vma only drops cached translations.
        unsafe {
            core::arch::asm!("sfence.vma {0}, x0", in(reg) va.raw(), options(nostack));
        }
    }

    fn flush_all(&self) {
        // SAFETY: as above.
        unsafe {
            core::arch::asm!("sfence.vma x0, x0", options(nostack));
        }
    }
}
