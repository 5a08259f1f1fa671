// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! NS16550 UART on the `virt` machine: a locked writer for logs and the
//! console, and a lock-free one for the panic path.

use core::fmt::{self, Write};
use spin::Mutex;

/// Address of the first UART on the `virt` machine.
const UART0_BASE: usize = 0x1000_0000;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(UART0_BASE));

#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the boot UART singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    /// Transmits one byte as-is.
    pub fn write_byte(&mut self, byte: u8) {
        write_mmio(self.base, byte);
    }
}

fn write_mmio(base: usize, value: u8) {
    // SAFETY: `base` is the identity-mapped UART0 register block.
    unsafe {
        while core::ptr::read_volatile((base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
        core::ptr::write_volatile((base + UART_TX) as *mut u8, value);
    }
}

fn write_text(base: usize, s: &str) {
    for &byte in s.as_bytes() {
        if byte == b'\n' {
            write_mmio(base, b'\r');
        }
        write_mmio(base, byte);
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_text(self.base, s);
        Ok(())
    }
}

// Raw, lock-free UART emission for panic contexts where the mutex may already be held.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_text(UART0_BASE, s);
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}
