// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler emitting diagnostics over the raw UART
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std target)
//! DEPENDS_ON: trap::last_trap(), uart::raw_writer()
//! INVARIANTS: No allocations; never takes the UART lock

use core::{fmt::Write, panic::PanicInfo};

use crate::{arch, trap, uart};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = uart::raw_writer();
    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = write!(w, "{}:{}: ", location.file(), location.line());
    }
    match info.message().as_str() {
        Some(msg) => {
            let _ = w.write_str(msg);
        }
        None => {
            let _ = write!(w, "{}", info.message());
        }
    }
    let _ = w.write_str("\n");

    if let Some(last) = trap::last_trap() {
        let _ = writeln!(
            w,
            "PANIC: last trap: {} sepc=0x{:x} scause=0x{:x} stval=0x{:x}",
            trap::describe_cause(last.scause),
            last.sepc,
            last.scause,
            last.stval
        );
    }
    arch::riscv::halt()
}
