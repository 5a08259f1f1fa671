// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits consumed by the VM core.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod virt;

#[cfg(test)]
pub mod testing;

use crate::types::VirtAddr;

/// Byte sink backing the `write` syscall.
pub trait Console {
    /// Writes a single byte to the console.
    fn write_byte(&mut self, byte: u8);

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_byte(byte);
        }
    }
}

/// TLB management operations.
pub trait Tlb {
    /// Drops cached translations for the page containing `va`.
    fn flush_page(&self, va: VirtAddr);
    /// Flushes the entire translation cache.
    fn flush_all(&self);
}
