// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paging page-fault resolver
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AccessKind, FaultOutcome, FaultReason, resolve()
//! DEPENDS_ON: mm::{AddressSpace, FrameAllocator, PageTable}, hal::Tlb
//! INVARIANTS: A violation never allocates a frame; success never advances
//!             the faulting PC; one fault backs at most one page

use core::fmt;

use super::{
    address_space::AddressSpace,
    frame::FrameAllocator,
    page_table::{MapError, PteKind},
    vma::VmPerms,
    PAGE_SIZE,
};
use crate::{hal::Tlb, kernel::KernelFault, types::VirtAddr};

/// scause codes for the three page-fault exceptions.
pub const SCAUSE_INSTRUCTION_PAGE_FAULT: usize = 12;
pub const SCAUSE_LOAD_PAGE_FAULT: usize = 13;
pub const SCAUSE_STORE_PAGE_FAULT: usize = 15;

/// Kind of memory access that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

impl AccessKind {
    /// Maps a page-fault exception code onto the access kind.
    pub const fn from_scause(code: usize) -> Option<Self> {
        match code {
            SCAUSE_INSTRUCTION_PAGE_FAULT => Some(Self::Fetch),
            SCAUSE_LOAD_PAGE_FAULT => Some(Self::Load),
            SCAUSE_STORE_PAGE_FAULT => Some(Self::Store),
            _ => None,
        }
    }

    /// Region permission needed for this access.
    pub const fn required(self) -> VmPerms {
        match self {
            Self::Fetch => VmPerms::EXECUTE,
            Self::Load => VmPerms::READ,
            Self::Store => VmPerms::WRITE,
        }
    }
}

/// Why a fault could not be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultReason {
    /// No region covers the faulting address.
    NoRegion,
    /// The covering region lacks the permission the access needs.
    PermissionDenied { required: VmPerms, granted: VmPerms },
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRegion => f.write_str("no region"),
            Self::PermissionDenied { required, granted } => {
                write!(f, "permission denied (need {:?}, have {:?})", required, granted)
            }
        }
    }
}

/// Result of a fault that did not stop the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is backed; retry the instruction.
    Resolved,
    /// Policy violation by the process.
    Violation(FaultReason),
}

/// Resolves a page fault at `addr` by backing its page with a fresh frame.
pub fn resolve(
    space: &mut AddressSpace,
    frames: &mut dyn FrameAllocator,
    tlb: &dyn Tlb,
    kind: AccessKind,
    addr: VirtAddr,
) -> Result<FaultOutcome, KernelFault> {
    let required = kind.required();
    let Some(handle) = space.find_containing(addr) else {
        log_warn!(target: "fault", "AS{}: {:?} at {}: no region", space.asid(), kind, addr);
        return Ok(FaultOutcome::Violation(FaultReason::NoRegion));
    };
    let granted = match space.vma(handle) {
        Some(vma) => vma.perms(),
        None => return Ok(FaultOutcome::Violation(FaultReason::NoRegion)),
    };
    if !granted.contains(required) {
        log_warn!(
            target: "fault",
            "AS{}: {:?} at {}: region grants {:?}",
            space.asid(),
            kind,
            addr,
            granted
        );
        return Ok(FaultOutcome::Violation(FaultReason::PermissionDenied { required, granted }));
    }

    let page = addr.page_floor();
    let flags = granted.leaf_flags();
    if let PteKind::Leaf { flags: present, .. } = space.page_table().lookup_leaf(page).kind() {
        if present.contains(flags) {
            log_trace!(target: "fault", "AS{}: spurious fault at {}", space.asid(), addr);
            return Ok(FaultOutcome::Resolved);
        }
    }

    let frame = frames.alloc_zeroed().ok_or(KernelFault::OutOfFrames)?;
    if let Err(err) = space.page_table_mut().install_mapping(frames, page, frame, PAGE_SIZE, flags) {
        // Hand the data frame back before escalating.
        if let Err(free_err) = frames.free(frame) {
            log_error!(target: "fault", "AS{}: free {} after failed map: {}", space.asid(), frame, free_err);
        }
        return Err(match err {
            MapError::OutOfFrames => KernelFault::OutOfFrames,
            other => KernelFault::PageTable(other),
        });
    }
    if let Some(vma) = space.vma_mut(handle) {
        vma.mark_mapped();
    }
    tlb.flush_page(page);
    log_debug!(target: "fault", "AS{}: {:?} at {} -> {}", space.asid(), kind, page, frame);
    Ok(FaultOutcome::Resolved)
}
