// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs
//! DEPENDS_ON: mm, kernel::KernelFault, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs (Linux RISC-V numbering);
//!             decode/check/execute discipline

pub mod api;

use core::fmt;

use crate::{config::MAX_SYSCALL, kernel::KernelFault, mm};

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Writes a user buffer to a file descriptor (stdout only).
pub const SYSCALL_WRITE: usize = 64;
/// Returns the current process id.
pub const SYSCALL_GETPID: usize = 172;
/// Removes a region previously created by `mmap`, matched exactly.
pub const SYSCALL_MUNMAP: usize = 215;
/// Declares a lazily backed region at a caller-chosen address.
pub const SYSCALL_MMAP: usize = 222;

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// File descriptor is not writable.
    BadFd,
    /// User pointer has no readable backing.
    Fault,
    /// Address-space manager reported an error.
    AddressSpace(mm::AddressSpaceError),
    /// The kernel cannot continue.
    Fatal(KernelFault),
}

impl From<mm::AddressSpaceError> for Error {
    fn from(value: mm::AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<KernelFault> for Error {
    fn from(value: KernelFault) -> Self {
        Self::Fatal(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressSpace(err) => write!(f, "address space: {err}"),
            Self::Fatal(fault) => write!(f, "fatal: {fault}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Creates a table with the default handlers installed.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Returns true if `number` has a handler.
    pub fn is_registered(&self, number: usize) -> bool {
        matches!(self.handlers.get(number), Some(Some(_)))
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
