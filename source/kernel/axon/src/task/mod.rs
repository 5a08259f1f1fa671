// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal process table for the VM core
//! OWNERS: @kernel-sched-team
//! PUBLIC API: TaskTable (spawn/current/kill/exit), Process, TaskState
//! DEPENDS_ON: mm::{AddressSpace, AsidAllocator}, types::Pid
//! INVARIANTS: Every live process owns exactly one address space and one ASID;
//!             both are released when the process stops running; PIDs are never reused

extern crate alloc;

use alloc::vec::Vec;

use crate::{
    hal::Tlb,
    mm::{AddressSpace, AddressSpaceError, AsidAllocator, FaultReason, FrameAllocator, Teardown},
};

pub use crate::types::Pid;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// Terminated by the kernel after a memory violation.
    Killed(FaultReason),
    Exited,
}

/// One user process.
pub struct Process {
    pid: Pid,
    state: TaskState,
    space: Option<AddressSpace>,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    pub fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }
}

/// Process table with a single current slot.
pub struct TaskTable {
    tasks: Vec<Process>,
    current: Option<Pid>,
    asids: AsidAllocator,
}

impl TaskTable {
    pub const fn new() -> Self {
        Self { tasks: Vec::new(), current: None, asids: AsidAllocator::new() }
    }

    /// Creates a process with an empty address space. The first process
    /// becomes current.
    pub fn spawn(&mut self, frames: &mut dyn FrameAllocator) -> Result<Pid, AddressSpaceError> {
        let raw = u32::try_from(self.tasks.len() + 1).map_err(|_| AddressSpaceError::NoMemory)?;
        let pid = Pid::from_raw(raw);
        self.tasks.try_reserve(1).map_err(|_| AddressSpaceError::NoMemory)?;
        let asid = self.asids.allocate()?;
        let space = match AddressSpace::new(frames, asid) {
            Ok(space) => space,
            Err(err) => {
                self.asids.free(asid);
                return Err(err);
            }
        };
        self.tasks.push(Process { pid, state: TaskState::Running, space: Some(space) });
        if self.current.is_none() {
            self.current = Some(pid);
        }
        log_info!(target: "task", "spawned pid {} (asid {})", pid, asid);
        Ok(pid)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    /// Selects the running process; fails for unknown or stopped pids.
    pub fn set_current(&mut self, pid: Pid) -> bool {
        match self.task(pid) {
            Some(process) if process.state == TaskState::Running => {
                self.current = Some(pid);
                true
            }
            _ => false,
        }
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        let pid = self.current?;
        self.task_mut(pid)
    }

    pub fn task(&self, pid: Pid) -> Option<&Process> {
        self.tasks.get(pid.as_index().checked_sub(1)?)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.tasks.get_mut(pid.as_index().checked_sub(1)?)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Terminates `pid` after a memory violation and reclaims its memory.
    pub fn kill(
        &mut self,
        pid: Pid,
        reason: FaultReason,
        frames: &mut dyn FrameAllocator,
        tlb: &dyn Tlb,
    ) -> Option<Teardown> {
        log_warn!(target: "task", "killing pid {}: {}", pid, reason);
        self.stop(pid, TaskState::Killed(reason), frames, tlb)
    }

    /// Normal process exit.
    pub fn exit(&mut self, pid: Pid, frames: &mut dyn FrameAllocator, tlb: &dyn Tlb) -> Option<Teardown> {
        log_info!(target: "task", "pid {} exited", pid);
        self.stop(pid, TaskState::Exited, frames, tlb)
    }

    fn stop(
        &mut self,
        pid: Pid,
        state: TaskState,
        frames: &mut dyn FrameAllocator,
        tlb: &dyn Tlb,
    ) -> Option<Teardown> {
        let process = self.task_mut(pid)?;
        let space = process.space.take()?;
        process.state = state;
        let asid = space.asid();
        let teardown = space.destroy(frames, tlb);
        self.asids.free(asid);
        if self.current == Some(pid) {
            self.current = None;
        }
        Some(teardown)
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
