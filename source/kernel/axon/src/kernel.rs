// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel context and trap routing
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (handle_trap/spawn/exit/set_fault_policy/ticks), KernelFault,
//!             FaultPolicy, TrapOutcome, install()/with_installed() on target
//! DEPENDS_ON: trap, syscall, mm::fault, task::TaskTable, hal::{Console, Tlb}
//! INVARIANTS: One trap is handled at a time; after a KernelFault no further
//!             trap is processed; the faulting PC is never advanced on resolution

use core::fmt;

use crate::{
    config::{self, DEFAULT_FAULT_POLICY, TICKS_PER_RESCHEDULE},
    hal::{Console, Tlb},
    mm::{
        fault::{self, AccessKind, FaultOutcome},
        AddressSpaceError, FaultReason, FrameAllocator, MapError, Teardown,
    },
    syscall::{api, SyscallTable},
    task::{Pid, TaskTable},
    trap::{self, TrapCause, TrapFrame, ECALL_FROM_U, SUPERVISOR_TIMER},
    types::VirtAddr,
};

/// Conditions the kernel cannot recover from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelFault {
    /// `ecall` with a number outside the dispatch table.
    UnknownSyscall(usize),
    /// Exception the kernel has no handler for.
    UnhandledException { scause: usize, sepc: usize, stval: usize },
    /// The frame allocator ran dry while backing a page.
    OutOfFrames,
    /// The page-table engine rejected an internal request.
    PageTable(MapError),
    /// A user trap arrived while no process was current.
    NoCurrentProcess,
}

impl fmt::Display for KernelFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSyscall(number) => write!(f, "unknown syscall {number}"),
            Self::UnhandledException { scause, sepc, stval } => write!(
                f,
                "unhandled {} (scause={scause:#x} sepc={sepc:#x} stval={stval:#x})",
                trap::describe_cause(*scause)
            ),
            Self::OutOfFrames => f.write_str("out of physical frames"),
            Self::PageTable(err) => write!(f, "page table: {err}"),
            Self::NoCurrentProcess => f.write_str("no current process"),
        }
    }
}

/// What to do with a process whose access hit no region or lacked permission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Kill the process and reclaim its memory.
    TerminateProcess,
    /// Step over the faulting instruction and keep running.
    SkipInstruction,
}

/// Result of one trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return to the interrupted context using the (possibly updated) frame.
    Resume,
    /// The faulting instruction was skipped under [`FaultPolicy::SkipInstruction`].
    ViolationSkipped { pid: Pid, reason: FaultReason },
    /// The current process was terminated; the scheduler must pick another.
    ProcessKilled { pid: Pid, reason: FaultReason },
    /// The kernel stopped on this trap.
    Halted(KernelFault),
    /// The trap was not acted upon.
    Ignored,
}

/// Kernel state reachable from the trap path.
pub struct Kernel<F, C, T> {
    frames: F,
    console: C,
    tlb: T,
    tasks: TaskTable,
    syscalls: SyscallTable,
    policy: FaultPolicy,
    ticks: u64,
    reschedule: bool,
    halted: Option<KernelFault>,
}

impl<F: FrameAllocator, C: Console, T: Tlb> Kernel<F, C, T> {
    pub fn new(frames: F, console: C, tlb: T) -> Self {
        Self {
            frames,
            console,
            tlb,
            tasks: TaskTable::new(),
            syscalls: SyscallTable::with_defaults(),
            policy: DEFAULT_FAULT_POLICY,
            ticks: 0,
            reschedule: false,
            halted: None,
        }
    }

    /// Creates a process; the first one becomes current.
    pub fn spawn(&mut self) -> Result<Pid, AddressSpaceError> {
        self.tasks.spawn(&mut self.frames)
    }

    /// Ends `pid` and reclaims its address space.
    pub fn exit(&mut self, pid: Pid) -> Option<Teardown> {
        self.tasks.exit(pid, &mut self.frames, &self.tlb)
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut TaskTable {
        &mut self.tasks
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn tlb(&self) -> &T {
        &self.tlb
    }

    pub fn fault_policy(&self) -> FaultPolicy {
        self.policy
    }

    /// Overrides the compiled-in violation policy.
    pub fn set_fault_policy(&mut self, policy: FaultPolicy) {
        self.policy = policy;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Returns and clears the reschedule hint raised by the timer.
    pub fn take_reschedule(&mut self) -> bool {
        core::mem::take(&mut self.reschedule)
    }

    /// The fault that stopped the kernel, if any.
    pub fn halted(&self) -> Option<KernelFault> {
        self.halted
    }

    /// Routes one trap. `frame` is the register state saved by trap entry and
    /// is restored from on return.
    pub fn handle_trap(&mut self, scause: usize, stval: usize, frame: &mut TrapFrame) -> TrapOutcome {
        if self.halted.is_some() {
            return TrapOutcome::Ignored;
        }
        trap::record(scause, stval, frame);
        let result = match TrapCause::decode(scause) {
            TrapCause::Interrupt(SUPERVISOR_TIMER) => Ok(self.on_timer()),
            TrapCause::Interrupt(code) => {
                log_debug!(target: "trap", "ignoring interrupt {}", code);
                Ok(TrapOutcome::Ignored)
            }
            TrapCause::Exception(ECALL_FROM_U) => self.on_ecall(frame),
            TrapCause::Exception(code) => match AccessKind::from_scause(code) {
                Some(kind) => self.on_page_fault(kind, stval, frame),
                None => Err(KernelFault::UnhandledException { scause, sepc: frame.sepc, stval }),
            },
        };
        match result {
            Ok(outcome) => outcome,
            Err(fault) => {
                log_error!(target: "trap", "fatal: {}; halting", fault);
                self.halted = Some(fault);
                TrapOutcome::Halted(fault)
            }
        }
    }

    fn on_timer(&mut self) -> TrapOutcome {
        self.ticks += 1;
        if config::TIMER_REARM {
            crate::arch::riscv::timer_arm(config::DEFAULT_TICK_CYCLES);
        }
        if self.ticks % TICKS_PER_RESCHEDULE == 0 {
            log_trace!(target: "trap", "tick {}: reschedule", self.ticks);
            self.reschedule = true;
        }
        TrapOutcome::Resume
    }

    fn on_ecall(&mut self, frame: &mut TrapFrame) -> Result<TrapOutcome, KernelFault> {
        let process = self.tasks.current_mut().ok_or(KernelFault::NoCurrentProcess)?;
        let pid = process.pid();
        let space = process.address_space_mut().ok_or(KernelFault::NoCurrentProcess)?;
        let mut ctx = api::Context::new(pid, space, &mut self.frames, &mut self.console, &self.tlb);
        trap::handle_ecall(frame, &self.syscalls, &mut ctx)?;
        Ok(TrapOutcome::Resume)
    }

    fn on_page_fault(
        &mut self,
        kind: AccessKind,
        stval: usize,
        frame: &mut TrapFrame,
    ) -> Result<TrapOutcome, KernelFault> {
        let process = self.tasks.current_mut().ok_or(KernelFault::NoCurrentProcess)?;
        let pid = process.pid();
        let space = process.address_space_mut().ok_or(KernelFault::NoCurrentProcess)?;
        let outcome = match VirtAddr::new(stval) {
            Some(addr) => fault::resolve(space, &mut self.frames, &self.tlb, kind, addr)?,
            None => FaultOutcome::Violation(FaultReason::NoRegion),
        };
        match outcome {
            FaultOutcome::Resolved => Ok(TrapOutcome::Resume),
            FaultOutcome::Violation(reason) => Ok(self.apply_policy(pid, reason, frame)),
        }
    }

    fn apply_policy(&mut self, pid: Pid, reason: FaultReason, frame: &mut TrapFrame) -> TrapOutcome {
        match self.policy {
            FaultPolicy::TerminateProcess => {
                self.tasks.kill(pid, reason, &mut self.frames, &self.tlb);
                TrapOutcome::ProcessKilled { pid, reason }
            }
            FaultPolicy::SkipInstruction => {
                log_warn!(target: "fault", "pid {}: {} at sepc {:#x}; skipping", pid, reason, frame.sepc);
                frame.skip_instruction();
                TrapOutcome::ViolationSkipped { pid, reason }
            }
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod installed {
    use spin::Mutex;

    use super::Kernel;
    use crate::{
        hal::virt::{VirtConsole, VirtTlb},
        mm::FramePool,
        types::PhysAddr,
    };

    pub type TargetKernel = Kernel<FramePool, VirtConsole, VirtTlb>;

    static KERNEL: Mutex<Option<TargetKernel>> = Mutex::new(None);

    /// Brings up the heap and the frame pool over `[free_start, free_end)`
    /// and installs the kernel used by `trap_handler`.
    ///
    /// # Safety
    /// Must run once, before traps are enabled; the range must be unused RAM.
    pub unsafe fn init(free_start: PhysAddr, free_end: PhysAddr) {
        crate::heap::init();
        // SAFETY: forwarded from the caller.
        let frames = unsafe { FramePool::from_region(free_start, free_end) };
        log_info!(target: "boot", "frame pool: {} frames at {}", frames.capacity(), free_start);
        install(Kernel::new(frames, VirtConsole, VirtTlb));
    }

    pub fn install(kernel: TargetKernel) {
        *KERNEL.lock() = Some(kernel);
    }

    /// Runs `f` against the installed kernel; `None` before `install`.
    pub fn with_installed<R>(f: impl FnOnce(&mut TargetKernel) -> R) -> Option<R> {
        KERNEL.lock().as_mut().map(f)
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use installed::{init, install, with_installed, TargetKernel};
