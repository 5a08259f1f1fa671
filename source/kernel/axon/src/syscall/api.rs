// Copyright 2024 AXON Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers for console output and the mmap/munmap pair
//! OWNERS: @kernel-team
//! PUBLIC API: Context, install_handlers()
//! DEPENDS_ON: mm::{AddressSpace, fault}, hal::{Console, Tlb}
//! INVARIANTS: Handlers decode then check their arguments before touching the
//!             address space; user memory is reached only through the page table

use super::{Args, Error, SyscallTable, SysResult, SYSCALL_GETPID, SYSCALL_MMAP, SYSCALL_MUNMAP, SYSCALL_WRITE};
use crate::{
    hal::{Console, Tlb},
    mm::{
        fault::{self, AccessKind, FaultOutcome},
        page_round_up, AddressSpace, AddressSpaceError, FrameAllocator, PageFlags, PteKind, VmPerms,
        PAGE_SIZE,
    },
    types::{PhysAddr, Pid, VirtAddr},
};

/// File descriptor of the console.
pub const STDOUT_FD: usize = 1;

/// Per-syscall view of the calling process and the devices it may reach.
pub struct Context<'a> {
    pub pid: Pid,
    pub space: &'a mut AddressSpace,
    pub frames: &'a mut dyn FrameAllocator,
    pub console: &'a mut dyn Console,
    pub tlb: &'a dyn Tlb,
}

impl<'a> Context<'a> {
    /// Creates a new context for the current process.
    pub fn new(
        pid: Pid,
        space: &'a mut AddressSpace,
        frames: &'a mut dyn FrameAllocator,
        console: &'a mut dyn Console,
        tlb: &'a dyn Tlb,
    ) -> Self {
        Self { pid, space, frames, console, tlb }
    }

    /// Physical address backing user byte `va`, demand-faulting a page of a
    /// readable region in on first touch.
    fn user_readable(&mut self, va: usize) -> SysResult<PhysAddr> {
        let va = VirtAddr::new(va).ok_or(Error::Fault)?;
        if let PteKind::Leaf { pa, flags } = self.space.page_table().lookup_leaf(va.page_floor()).kind() {
            if flags.contains(PageFlags::READ | PageFlags::USER) {
                return Ok(pa.offset(va.page_offset()));
            }
        }
        match fault::resolve(self.space, self.frames, self.tlb, AccessKind::Load, va)? {
            FaultOutcome::Resolved => self.space.page_table().translate(va).ok_or(Error::Fault),
            FaultOutcome::Violation(reason) => {
                log_warn!(target: "syscall", "pid {}: bad user pointer {}: {}", self.pid, va, reason);
                Err(Error::Fault)
            }
        }
    }
}

#[derive(Copy, Clone)]
struct WriteArgsTyped {
    fd: usize,
    buf: usize,
    count: usize,
}

impl WriteArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { fd: args.get(0), buf: args.get(1), count: args.get(2) }
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.fd != STDOUT_FD {
            return Err(Error::BadFd);
        }
        self.buf.checked_add(self.count).ok_or(Error::Fault)?;
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct MmapArgsTyped {
    addr: VirtAddr,
    len: usize,
    perms: VmPerms,
}

impl MmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let addr = VirtAddr::page_aligned(args.get(0)).ok_or(AddressSpaceError::InvalidArgs)?;
        let len = page_round_up(args.get(1)).ok_or(AddressSpaceError::InvalidArgs)?;
        let perms = VmPerms::from_bits(args.get(2)).ok_or(AddressSpaceError::InvalidArgs)?;
        Ok(Self { addr, len, perms })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.len == 0 {
            return Err(AddressSpaceError::InvalidArgs.into());
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct MunmapArgsTyped {
    addr: VirtAddr,
    end: usize,
}

impl MunmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let addr = VirtAddr::page_aligned(args.get(0)).ok_or(AddressSpaceError::InvalidArgs)?;
        let len = page_round_up(args.get(1)).ok_or(AddressSpaceError::InvalidArgs)?;
        let end = addr.checked_add(len).ok_or(AddressSpaceError::InvalidArgs)?;
        Ok(Self { addr, end })
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_WRITE, sys_write);
    table.register(SYSCALL_GETPID, sys_getpid);
    table.register(SYSCALL_MUNMAP, sys_munmap);
    table.register(SYSCALL_MMAP, sys_mmap);
}

fn sys_write(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = WriteArgsTyped::decode(args);
    typed.check()?;

    // Back every page first so a bad pointer emits nothing.
    let mut cursor = typed.buf;
    let end = typed.buf + typed.count;
    while cursor < end {
        ctx.user_readable(cursor)?;
        cursor = (cursor & !(PAGE_SIZE - 1)) + PAGE_SIZE;
    }

    let mut cursor = typed.buf;
    while cursor < end {
        let pa = ctx.user_readable(cursor)?;
        let chunk = (PAGE_SIZE - (cursor & (PAGE_SIZE - 1))).min(end - cursor);
        // SAFETY: `pa` starts inside a frame mapped for this process and the
        // chunk does not cross the end of that frame.
        let bytes = unsafe { core::slice::from_raw_parts(pa.as_ptr::<u8>(), chunk) };
        ctx.console.write_bytes(bytes);
        cursor += chunk;
    }
    Ok(typed.count)
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.pid.as_index())
}

fn sys_mmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MmapArgsTyped::decode(args)?;
    typed.check()?;
    ctx.space.add_region(typed.addr, typed.len, typed.perms)?;
    log_info!(
        target: "syscall",
        "pid {}: mmap {} len={:#x} {:?}",
        ctx.pid,
        typed.addr,
        typed.len,
        typed.perms
    );
    Ok(typed.addr.raw())
}

fn sys_munmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MunmapArgsTyped::decode(args)?;
    let Some(handle) = ctx.space.find_exact(typed.addr, typed.end) else {
        log_warn!(target: "syscall", "pid {}: munmap {}..{:#x}: no exact region", ctx.pid, typed.addr, typed.end);
        return Err(AddressSpaceError::InvalidArgs.into());
    };
    let released = ctx.space.unmap_region(handle, ctx.frames, ctx.tlb)?;
    log_info!(
        target: "syscall",
        "pid {}: munmap {}..{:#x} released {} frame(s)",
        ctx.pid,
        typed.addr,
        typed.end,
        released
    );
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::testing::{CaptureConsole, CountingTlb};
    use crate::mm::FramePool;

    struct Fixture {
        frames: FramePool,
        space: AddressSpace,
        console: CaptureConsole,
        tlb: CountingTlb,
        table: SyscallTable,
    }

    impl Fixture {
        fn new() -> Self {
            let mut frames = FramePool::host(32);
            let space = AddressSpace::new(&mut frames, 1).unwrap();
            Self {
                frames,
                space,
                console: CaptureConsole::default(),
                tlb: CountingTlb::default(),
                table: SyscallTable::with_defaults(),
            }
        }

        fn call(&mut self, number: usize, regs: [usize; 6]) -> SysResult<usize> {
            let mut ctx = Context::new(
                Pid::from_raw(7),
                &mut self.space,
                &mut self.frames,
                &mut self.console,
                &self.tlb,
            );
            self.table.dispatch(number, &mut ctx, &Args::new(regs))
        }
    }

    const RW: usize = VmPerms::READ.bits() | VmPerms::WRITE.bits();

    #[test]
    fn getpid_reports_caller() {
        let mut fx = Fixture::new();
        assert_eq!(fx.call(SYSCALL_GETPID, [0; 6]), Ok(7));
    }

    #[test]
    fn mmap_rejects_bad_arguments() {
        let mut fx = Fixture::new();
        let invalid = Err(Error::AddressSpace(AddressSpaceError::InvalidArgs));
        assert_eq!(fx.call(SYSCALL_MMAP, [0x10001, 0x1000, RW, 0, 0, 0]), invalid);
        assert_eq!(fx.call(SYSCALL_MMAP, [0x10000, 0, RW, 0, 0, 0]), invalid);
        assert_eq!(fx.call(SYSCALL_MMAP, [0x10000, 0x1000, 1 << 4, 0, 0, 0]), invalid);
        assert_eq!(fx.call(SYSCALL_MMAP, [1 << 40, 0x1000, RW, 0, 0, 0]), invalid);
        assert_eq!(fx.space.region_count(), 0);
    }

    #[test]
    fn mmap_rounds_length_up() {
        let mut fx = Fixture::new();
        assert_eq!(fx.call(SYSCALL_MMAP, [0x10000, 0x1001, RW, 0, 0, 0]), Ok(0x10000));
        let handle = fx.space.find_exact(VirtAddr::new(0x10000).unwrap(), 0x12000).unwrap();
        assert_eq!(fx.space.vma(handle).unwrap().len(), 2 * PAGE_SIZE);
        assert_eq!(fx.call(SYSCALL_MUNMAP, [0x10000, 0x1800, 0, 0, 0, 0]), Ok(0));
    }

    #[test]
    fn write_rejects_other_descriptors() {
        let mut fx = Fixture::new();
        assert_eq!(fx.call(SYSCALL_WRITE, [2, 0x10000, 1, 0, 0, 0]), Err(Error::BadFd));
        assert!(fx.console.bytes.is_empty());
    }

    #[test]
    fn write_copies_across_pages() {
        let mut fx = Fixture::new();
        fx.call(SYSCALL_MMAP, [0x10000, 2 * PAGE_SIZE, RW, 0, 0, 0]).unwrap();
        let start = 0x10000 + PAGE_SIZE - 3;
        // Fault both pages in through a first write, then fill them.
        assert_eq!(fx.call(SYSCALL_WRITE, [1, start, 6, 0, 0, 0]), Ok(6));
        assert_eq!(fx.console.bytes, [0; 6]);
        for (i, byte) in b"abcdef".iter().enumerate() {
            let pa = fx.space.page_table().translate(VirtAddr::new(start + i).unwrap()).unwrap();
            unsafe { *pa.as_mut_ptr::<u8>() = *byte };
        }
        fx.console.bytes.clear();
        assert_eq!(fx.call(SYSCALL_WRITE, [1, start, 6, 0, 0, 0]), Ok(6));
        assert_eq!(fx.console.bytes, b"abcdef");
    }

    #[test]
    fn write_from_unmapped_memory_faults_without_output() {
        let mut fx = Fixture::new();
        fx.call(SYSCALL_MMAP, [0x10000, PAGE_SIZE, RW, 0, 0, 0]).unwrap();
        // Runs off the end of the region.
        assert_eq!(fx.call(SYSCALL_WRITE, [1, 0x10ff0, 0x20, 0, 0, 0]), Err(Error::Fault));
        assert!(fx.console.bytes.is_empty());
        // Write-only region is not readable.
        fx.call(SYSCALL_MMAP, [0x40000, PAGE_SIZE, VmPerms::WRITE.bits(), 0, 0, 0]).unwrap();
        assert_eq!(fx.call(SYSCALL_WRITE, [1, 0x40000, 1, 0, 0, 0]), Err(Error::Fault));
    }

    #[test]
    fn munmap_requires_exact_bounds() {
        let mut fx = Fixture::new();
        fx.call(SYSCALL_MMAP, [0x10000, 4 * PAGE_SIZE, RW, 0, 0, 0]).unwrap();
        let invalid = Err(Error::AddressSpace(AddressSpaceError::InvalidArgs));
        assert_eq!(fx.call(SYSCALL_MUNMAP, [0x10000, 2 * PAGE_SIZE, 0, 0, 0, 0]), invalid);
        assert_eq!(fx.call(SYSCALL_MUNMAP, [0x10000, 8 * PAGE_SIZE, 0, 0, 0, 0]), invalid);
        assert_eq!(fx.call(SYSCALL_MUNMAP, [0x11000, 3 * PAGE_SIZE, 0, 0, 0, 0]), invalid);
        assert_eq!(fx.space.region_count(), 1);
        assert_eq!(fx.call(SYSCALL_MUNMAP, [0x10000, 4 * PAGE_SIZE, 0, 0, 0, 0]), Ok(0));
        assert_eq!(fx.space.region_count(), 0);
    }
}
