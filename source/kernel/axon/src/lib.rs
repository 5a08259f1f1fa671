// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON kernel library: Sv39 virtual memory, demand paging and the
//!          synchronous trap/syscall path
//! OWNERS: @kernel-team
//! PUBLIC API: kernel::Kernel, mm::*, syscall::*, trap::TrapFrame, task::TaskTable
//! DEPENDS_ON: bitflags, spin, static_assertions; riscv + sbi-rt +
//!             linked_list_allocator on the bare-metal target
//! INVARIANTS: No ambient "current process"; every core operation receives its
//!             context explicitly

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

// Log macros must be in scope for every module below.
#[macro_use]
mod diag;

mod arch;
pub mod config;
pub mod hal;
pub mod kernel;
pub mod mm;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod heap;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod panic;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod uart;

pub use diag::log::Level;
pub use kernel::{FaultPolicy, Kernel, KernelFault, TrapOutcome};
