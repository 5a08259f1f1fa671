// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V helpers used by the trap path.
//!
//! Host builds get inert stubs so the kernel logic above them stays testable.

/// Reads the faulting address/instruction CSR.
#[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
#[inline]
pub fn read_stval() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::stval::read()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Programs the next supervisor timer interrupt `delta_cycles` from now.
#[inline]
pub fn timer_arm(delta_cycles: u64) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let now = riscv::register::time::read() as u64;
        sbi_rt::set_timer(now.wrapping_add(delta_cycles));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = delta_cycles;
    }
}

/// Issues a WFI instruction or yields on the host.
#[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv64")]
    // SAFETY: wfi has no memory effects.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        core::hint::spin_loop();
    }
}

/// Masks supervisor interrupts and parks the hart for good.
#[cfg_attr(not(all(target_arch = "riscv64", target_os = "none")), allow(dead_code))]
pub fn halt() -> ! {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: clearing sstatus.SIE only stops interrupt delivery.
    unsafe {
        riscv::register::sstatus::clear_sie();
    }
    loop {
        wait_for_interrupt();
    }
}
