// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Build-time kernel configuration.
//!
//! Behavior switches are cargo features (`fault_terminate`, `timer_irq`); sizes and
//! periods live here as constants.

use crate::kernel::FaultPolicy;

/// Timer ticks between two reschedule hints.
pub const TICKS_PER_RESCHEDULE: u64 = 10;

/// Timer re-arm interval in `time` CSR cycles.
pub const DEFAULT_TICK_CYCLES: u64 = 100_000;

/// Number of hardware ASIDs handed out to address spaces.
pub const MAX_ASIDS: usize = 256;

/// Size of the kernel heap backing `alloc`.
pub const KERNEL_HEAP_SIZE: usize = 1 << 20;

/// Highest syscall number accepted by the dispatch table (exclusive).
pub const MAX_SYSCALL: usize = 256;

/// Violation policy compiled into the kernel: report and step over the
/// faulting instruction unless `fault_terminate` is enabled.
pub const DEFAULT_FAULT_POLICY: FaultPolicy = if cfg!(feature = "fault_terminate") {
    FaultPolicy::TerminateProcess
} else {
    FaultPolicy::SkipInstruction
};

/// True when the timer is re-armed through SBI on every tick.
pub const TIMER_REARM: bool = cfg!(feature = "timer_irq");
