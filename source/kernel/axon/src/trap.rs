// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap frame layout, cause decoding and the ecall path
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, TrapCause, handle_ecall(), encode_error(), record()/last_trap()
//! DEPENDS_ON: syscall::{SyscallTable, api::Context}, kernel::KernelFault
//! INVARIANTS: Syscall number and arguments come from the saved frame, never
//!             live registers; results land in saved a0/a1; sepc advances by 4
//!             exactly once per completed ecall

use core::fmt::{self, Write};

use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::{
    kernel::KernelFault,
    mm::{AddressSpaceError, MapError},
    syscall::{api, Args, Error as SysError, SyscallTable},
};

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);

/// scause exception code for `ecall` from U-mode.
pub const ECALL_FROM_U: usize = 8;
/// scause interrupt code for the supervisor timer.
pub const SUPERVISOR_TIMER: usize = 5;

// trap frame

/// Register state saved by the trap entry, in this exact order.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct TrapFrame {
    pub ra: usize,
    /// t0..t2
    pub t_lo: [usize; 3],
    /// a0..a7
    pub a: [usize; 8],
    /// t3..t6
    pub t_hi: [usize; 4],
    pub sepc: usize,
}

const WORD: usize = core::mem::size_of::<usize>();
const_assert_eq!(core::mem::size_of::<TrapFrame>(), 17 * WORD);
const_assert_eq!(core::mem::offset_of!(TrapFrame, ra), 0);
const_assert_eq!(core::mem::offset_of!(TrapFrame, t_lo), WORD);
const_assert_eq!(core::mem::offset_of!(TrapFrame, a), 4 * WORD);
const_assert_eq!(core::mem::offset_of!(TrapFrame, t_hi), 12 * WORD);
const_assert_eq!(core::mem::offset_of!(TrapFrame, sepc), 16 * WORD);

impl TrapFrame {
    /// Saved a7.
    #[inline]
    pub fn syscall_number(&self) -> usize {
        self.a[7]
    }

    /// Saved a0..a5.
    #[inline]
    pub fn syscall_args(&self) -> Args {
        Args::new([self.a[0], self.a[1], self.a[2], self.a[3], self.a[4], self.a[5]])
    }

    #[inline]
    pub fn set_return(&mut self, a0: usize, a1: usize) {
        self.a[0] = a0;
        self.a[1] = a1;
    }

    #[inline]
    pub fn skip_instruction(&mut self) {
        self.sepc = self.sepc.wrapping_add(4);
    }
}

// cause decoding

/// Decoded `scause`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapCause {
    Interrupt(usize),
    Exception(usize),
}

impl TrapCause {
    pub const fn decode(scause: usize) -> Self {
        let code = scause & !INTERRUPT_FLAG;
        if scause & INTERRUPT_FLAG != 0 {
            Self::Interrupt(code)
        } else {
            Self::Exception(code)
        }
    }
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    match TrapCause::decode(scause) {
        TrapCause::Interrupt(code) => match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        },
        TrapCause::Exception(code) => match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        },
    }
}

// diagnostics

/// Cause registers of one trap, kept for the panic handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapRecord {
    pub scause: usize,
    pub sepc: usize,
    pub stval: usize,
}

static LAST_TRAP: Mutex<Option<TrapRecord>> = Mutex::new(None);

pub fn record(scause: usize, stval: usize, frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(TrapRecord { scause, sepc: frame.sepc, stval });
}

pub fn last_trap() -> Option<TrapRecord> {
    *LAST_TRAP.lock()
}

pub fn fmt_trap<W: Write>(record: &TrapRecord, frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", record.sepc)?;
    writeln!(f, " scause=0x{:016x} ({})", record.scause, describe_cause(record.scause))?;
    writeln!(f, " stval=0x{:016x}", record.stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.a)
}

// syscall path

/// Runs the syscall described by the saved frame and writes the result back.
///
/// Handler errors become negative errno values in a0. Unknown syscall numbers
/// and fatal handler errors leave the frame untouched and are returned.
pub fn handle_ecall(
    frame: &mut TrapFrame,
    table: &SyscallTable,
    ctx: &mut api::Context<'_>,
) -> Result<(), KernelFault> {
    let number = frame.syscall_number();
    let args = frame.syscall_args();
    let ret = match table.dispatch(number, ctx, &args) {
        Ok(ret) => ret,
        Err(err) => {
            let Some(code) = encode_error(&err) else {
                return Err(match err {
                    SysError::Fatal(fault) => fault,
                    _ => KernelFault::UnknownSyscall(number),
                });
            };
            log_debug!(target: "trap", "pid {}: syscall {} failed: {}", ctx.pid, number, err);
            code
        }
    };
    frame.set_return(ret, 0);
    frame.skip_instruction();
    Ok(())
}

pub const EBADF: usize = 9;
pub const ENOMEM: usize = 12;
pub const EFAULT: usize = 14;
pub const EINVAL: usize = 22;

/// Maps a per-process syscall error onto a negative errno in a0 encoding.
/// `None` for errors that stop the kernel instead of returning to the caller.
pub fn encode_error(err: &SysError) -> Option<usize> {
    match err {
        SysError::InvalidSyscall | SysError::Fatal(_) => None,
        SysError::BadFd => Some(errno(EBADF)),
        SysError::Fault => Some(errno(EFAULT)),
        SysError::AddressSpace(as_err) => Some(address_space_errno(as_err)),
    }
}

fn address_space_errno(err: &AddressSpaceError) -> usize {
    match err {
        AddressSpaceError::NoMemory
        | AddressSpaceError::AsidExhausted
        | AddressSpaceError::Mapping(MapError::OutOfFrames) => errno(ENOMEM),
        AddressSpaceError::InvalidHandle
        | AddressSpaceError::InvalidArgs
        | AddressSpaceError::Mapping(_) => errno(EINVAL),
    }
}

pub const fn errno(code: usize) -> usize {
    (-(code as isize)) as usize
}

// target entry

/// Called by the trap entry once the frame is saved.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
pub extern "C" fn trap_handler(scause: usize, sepc: usize, frame: &mut TrapFrame) {
    frame.sepc = sepc;
    let stval = crate::arch::riscv::read_stval();
    match crate::kernel::with_installed(|kernel| kernel.handle_trap(scause, stval, frame)) {
        Some(crate::kernel::TrapOutcome::Halted(_)) => crate::arch::riscv::halt(),
        Some(_) => {}
        None => {
            log_error!(target: "trap", "trap before kernel install: {}", describe_cause(scause));
            crate::arch::riscv::halt()
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::string::String;

    #[test]
    fn cause_decoding_splits_interrupts() {
        assert_eq!(TrapCause::decode(INTERRUPT_FLAG | 5), TrapCause::Interrupt(SUPERVISOR_TIMER));
        assert_eq!(TrapCause::decode(8), TrapCause::Exception(ECALL_FROM_U));
        assert!(is_interrupt(INTERRUPT_FLAG | 9));
        assert_eq!(describe_cause(15), "StoreAMOPageFault");
        assert_eq!(describe_cause(INTERRUPT_FLAG | 5), "SupervisorTimerInt");
    }

    #[test]
    fn frame_words_follow_entry_layout() {
        let mut words = [0usize; 17];
        for (i, word) in words.iter_mut().enumerate() {
            *word = i;
        }
        // SAFETY: TrapFrame is repr(C) over 17 usizes.
        let frame: TrapFrame = unsafe { core::mem::transmute(words) };
        assert_eq!(frame.ra, 0);
        assert_eq!(frame.syscall_number(), 11);
        assert_eq!(frame.syscall_args().get(0), 4);
        assert_eq!(frame.syscall_args().get(5), 9);
        assert_eq!(frame.sepc, 16);
    }

    #[test]
    fn errno_is_negative_in_two_complement() {
        assert_eq!(errno(EINVAL) as isize, -22);
        assert_eq!(encode_error(&SysError::BadFd), Some(errno(EBADF)));
        assert_eq!(encode_error(&SysError::Fault).map(|v| v as isize), Some(-14));
        assert_eq!(encode_error(&SysError::AddressSpace(AddressSpaceError::NoMemory)), Some(errno(ENOMEM)));
        assert_eq!(encode_error(&SysError::AddressSpace(AddressSpaceError::InvalidArgs)), Some(errno(EINVAL)));
        assert_eq!(encode_error(&SysError::InvalidSyscall), None);
        assert_eq!(encode_error(&SysError::Fatal(KernelFault::OutOfFrames)), None);
    }

    #[test]
    fn record_and_format_last_trap() {
        let frame = TrapFrame { sepc: 0x1000, ..TrapFrame::default() };
        record(13, 0xdead_0000, &frame);
        // Other tests trap concurrently; only presence is stable here.
        assert!(last_trap().is_some());
        let recorded = TrapRecord { scause: 13, sepc: frame.sepc, stval: 0xdead_0000 };
        let mut out = String::new();
        fmt_trap(&recorded, &frame, &mut out).unwrap();
        assert!(out.contains("LoadPageFault"));
        assert!(out.contains("a0..a7"));
    }
}
