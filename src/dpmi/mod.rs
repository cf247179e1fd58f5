//! DPMI block manager.
//!
//! A [`BlockManager`] owns the two page pools protected-mode clients allocate
//! from and the counter of committed bytes they are charged for:
//!
//! - the *general* pool `[dpmi_base, dpmi_base + dpmi_mem_size)`, for
//!   ordinary relocatable blocks and for shared memory;
//! - the *linear* pool `[LINEAR_BASE, dpmi_base)`, for blocks placed at a
//!   client-chosen address or top-down from the end of the window.
//!
//! Blocks themselves live in per-client [`BlockRoot`]s. Every mutation goes
//! through the manager, which keeps host protections, the page attribute
//! words and the counter in step.
//!
//! ```text
//! 0          LINEAR_BASE               dpmi_base                 guest_span
//! | low mem  | linear window  <- top   | general pool  first ->  |
//! ```

use std::io;

use bitflags::bitflags;
use log::{debug, error, warn};

use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::mapping::Protection;
use crate::memory::layout::{DPMI_RESERVED_SPACE, HMA_SIZE, LINEAR_BASE, LOWMEM_SIZE};
use crate::memory::{
    checked_page_align, is_page_aligned, pages, Pool, PoolHooks, PAGE_SHIFT, PAGE_SIZE,
};
use crate::space::{AddressSpace, Cpu, NullCpu};

mod attr;
mod block;
mod root;

pub use attr::{AttrError, CommitType, Effect, PageAttr, Transition};
pub use block::{Block, BlockKind, Handle, LockState, ShmNames};
pub use root::BlockRoot;

use block::is_accounted;

bitflags! {
    /// Options of [`BlockManager::malloc_shared`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShmFlags: u32 {
        /// Map without execute permission.
        const NO_EXEC = 1 << 0;
        /// The name must not be in use yet.
        const EXCLUSIVE = 1 << 1;
    }
}

/// Pool callbacks translating (de)commits into host protection changes.
struct Hooks<'a, S> {
    space: &'a mut S,
    populate: bool,
}

impl<S: AddressSpace> PoolHooks for Hooks<'_, S> {
    fn commit(&mut self, addr: usize, len: usize) -> bool {
        if let Err(err) = self.space.protect(addr as u32, len, Protection::RWX) {
            warn!("DPMI: cannot commit {len:#x} bytes at {addr:#x}: {err}");
            return false;
        }
        if self.populate {
            self.space.populate(addr as u32, len);
        }
        true
    }

    fn uncommit(&mut self, addr: usize, len: usize) {
        if let Err(err) = self.space.protect(addr as u32, len, Protection::NONE) {
            warn!("DPMI: cannot uncommit {len:#x} bytes at {addr:#x}: {err}");
        }
    }

    fn relocate(&mut self, from: usize, to: usize, len: usize) {
        self.space.relocate(from as u32, to as u32, len);
    }
}

/// Page-aligned size of a client request. Zero and sizes that cannot be
/// rounded up are refused.
fn client_size(size: usize) -> Result<usize> {
    match checked_page_align(size) {
        Some(aligned) if aligned != 0 => Ok(aligned),
        _ => Err(Error::InvalidSize(size)),
    }
}

/// Turn a host failure into [`Error::Fatal`]; other errors pass through.
fn escalate(context: &'static str, err: Error) -> Error {
    match err {
        Error::Io(source) => Error::fatal(context, source),
        other => other,
    }
}

/// Allocator and accountant of protected-mode memory.
pub struct BlockManager<S: AddressSpace, C: Cpu = NullCpu> {
    space: S,
    cpu: C,
    general: Pool,
    linear: Pool,
    /// Configured budget in bytes.
    total: usize,
    /// Committed private bytes charged against `total`.
    allocd: usize,
    next_handle: u32,
    no_null_checks: bool,
    shm_prefix: String,
}

impl<S: AddressSpace> BlockManager<S> {
    /// Create a manager for a CPU without translation cache or hardware RAM.
    pub fn new(config: &MemoryConfig, space: S) -> Self {
        Self::with_cpu(config, space, NullCpu)
    }
}

impl<S: AddressSpace, C: Cpu> BlockManager<S, C> {
    pub fn with_cpu(config: &MemoryConfig, space: S, cpu: C) -> Self {
        let general = Pool::new(config.dpmi_base as usize, config.dpmi_mem_size());
        let linear = Pool::new(LINEAR_BASE, config.lin_mem_rsv());
        debug!(
            "DPMI: mem init, pool is {:#x} bytes at {:#x}",
            general.size(),
            general.base()
        );
        debug!("DPMI: free memory available {:#x}", config.dpmi_total());
        Self {
            space,
            cpu,
            general,
            linear,
            total: config.dpmi_total(),
            allocd: 0,
            next_handle: 1,
            no_null_checks: config.no_null_checks,
            shm_prefix: config.shm_prefix.clone(),
        }
    }

    pub fn space(&self) -> &S {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut S {
        &mut self.space
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    /// Configured budget in bytes.
    pub fn total_memory(&self) -> usize {
        self.total
    }

    /// Bytes currently committed against the budget.
    pub fn allocated(&self) -> usize {
        self.allocd
    }

    /// Budget left, not counting the reserved headroom. Zero once the
    /// headroom is in use.
    pub fn free_memory(&self) -> usize {
        self.total.saturating_sub(self.allocd)
    }

    /// Size of the general pool.
    pub fn dpmi_mem_size(&self) -> usize {
        self.general.size()
    }

    /// Size of the linear window.
    pub fn lin_mem_rsv(&self) -> usize {
        self.linear.size()
    }

    /// Unallocated bytes of the linear window.
    pub fn lin_mem_free(&self) -> usize {
        self.linear.free_space()
    }

    /// Budget left including the reserved headroom.
    fn headroom(&self) -> usize {
        (self.total + DPMI_RESERVED_SPACE).saturating_sub(self.allocd)
    }

    fn release(&mut self, bytes: usize) {
        debug_assert!(self.allocd >= bytes, "DPMI: accounting underflow");
        self.allocd = self.allocd.saturating_sub(bytes);
    }

    fn next_handle(&mut self) -> Handle {
        let handle = Handle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn general_hooks(space: &mut S) -> Hooks<'_, S> {
        Hooks {
            space,
            populate: true,
        }
    }

    fn linear_hooks(space: &mut S) -> Hooks<'_, S> {
        Hooks {
            space,
            populate: false,
        }
    }

    /// Allocate a committed, read/write block from the general pool.
    pub fn malloc(&mut self, root: &mut BlockRoot, size: usize) -> Result<Handle> {
        let size = client_size(size)?;
        let available = self.headroom();
        if size > available {
            return Err(Error::BudgetExceeded {
                requested: size,
                available,
            });
        }

        let base = self
            .general
            .alloc(size, &mut Self::general_hooks(&mut self.space))
            .ok_or(Error::OutOfSpace { size })?;

        let handle = self.next_handle();
        root.insert(Block::new(
            handle,
            BlockKind::General,
            base as u32,
            size,
            PageAttr::COMMITTED_RW,
        ));
        self.allocd += size;
        debug!("DPMI: malloc {size:#x} at {base:#x}, handle {handle}");
        Ok(handle)
    }

    /// Allocate a block in the linear window.
    ///
    /// With `base`, the block is placed exactly there; otherwise as high in
    /// the window as it fits. Uncommitted blocks reserve address space only.
    pub fn malloc_linear(
        &mut self,
        root: &mut BlockRoot,
        base: Option<u32>,
        size: usize,
        committed: bool,
    ) -> Result<Handle> {
        let size = client_size(size)?;
        if let Some(base) = base {
            if (base as usize) < self.linear.base() {
                debug!("DPMI: failing lin alloc to lowmem {base:#x}, size {size:#x}");
                return Err(Error::OutOfRange { base, size });
            }
            let end = (base as usize).checked_add(size);
            if end.map_or(true, |end| end > self.linear.end()) {
                debug!("DPMI: failing lin alloc to {base:#x}, size {size:#x}");
                return Err(Error::OutOfRange { base, size });
            }
            if !is_page_aligned(base as usize) {
                return Err(Error::InvalidAddress(base));
            }
        }
        if committed && size > self.free_memory() {
            return Err(Error::BudgetExceeded {
                requested: size,
                available: self.free_memory(),
            });
        }

        let top = self.linear.end();
        let mut hooks = Self::linear_hooks(&mut self.space);
        let addr = match base {
            Some(base) => self.linear.alloc_fixed(base as usize, size, &mut hooks),
            None => self.linear.alloc_aligned_topdown(top, PAGE_SIZE, size, &mut hooks),
        }
        .ok_or(Error::OutOfSpace { size })?;
        let base = addr as u32;

        let (prot, attr) = if committed {
            (Protection::RWX, PageAttr::COMMITTED_RW)
        } else {
            (Protection::NONE, PageAttr::UNCOMMITTED_RW)
        };
        if let Err(err) = self.space.protect(base, size, prot) {
            self.linear
                .free(addr, &mut Self::linear_hooks(&mut self.space));
            return Err(err);
        }

        let handle = self.next_handle();
        root.insert(Block::new(handle, BlockKind::Linear, base, size, attr));
        if committed {
            self.allocd += size;
        }
        debug!("DPMI: linear malloc {size:#x} at {base:#x}, handle {handle}");
        Ok(handle)
    }

    /// Expose physical memory at `phys` as a block. The window comes from the
    /// CPU backend and is neither pool-backed nor accounted.
    pub fn map_hw_ram(&mut self, root: &mut BlockRoot, phys: u32, size: usize) -> Result<Handle> {
        let size = client_size(size)?;
        let base = self.cpu.hardware_ram(phys, size).ok_or_else(|| {
            Error::NotSupported(format!("no hardware RAM window for {phys:#x}"))
        })?;

        let handle = self.next_handle();
        root.insert(Block::new(
            handle,
            BlockKind::HardwareRam,
            base,
            size,
            PageAttr::COMMITTED_RW,
        ));
        debug!("DPMI: hwram {phys:#x} mapped at {base:#x}, handle {handle}");
        Ok(handle)
    }

    /// Release the hardware block containing `vbase`. A shared block is
    /// detached from the address space instead, and released once it has no
    /// names left.
    pub fn unmap_hw_ram(&mut self, root: &mut BlockRoot, vbase: u32) -> Result<()> {
        let block = root.lookup_by_addr(vbase).ok_or(Error::InvalidAddress(vbase))?;
        let handle = block.handle();
        match block.kind() {
            BlockKind::HardwareRam => {
                root.remove(handle);
            }
            BlockKind::Shared => {
                self.unmap_shm(root, handle);
                if root.lookup(handle).is_some_and(|b| b.shm_name().is_none()) {
                    root.remove(handle);
                }
            }
            BlockKind::General | BlockKind::Linear => {
                error!("DPMI: wrong free hwram, handle {handle}");
                return Err(Error::WrongKind {
                    handle,
                    expected: "a memory block",
                });
            }
        }
        Ok(())
    }

    /// Detach a shared block: put the default backing back and return the
    /// area to the general pool.
    fn unmap_shm(&mut self, root: &mut BlockRoot, handle: Handle) {
        let Some(block) = root.lookup(handle) else {
            return;
        };
        let (base, size) = (block.base(), block.size());
        self.cpu.invalidate(base, size);
        if let Err(err) = self.space.restore(base, size) {
            error!("DPMI: restore mapping failed at {base:#x}: {err}");
        }
        self.general
            .free(base as usize, &mut Self::general_hooks(&mut self.space));
        root.detach(handle);
    }

    /// Release a general or linear block, or a shared block whose names were
    /// already dropped.
    pub fn free(&mut self, root: &mut BlockRoot, handle: Handle) -> Result<()> {
        let block = root.lookup(handle).ok_or(Error::InvalidHandle(handle))?;
        if block.is_hwram() {
            error!("DPMI: wrong free hwram, handle {handle}");
            return Err(Error::WrongKind {
                handle,
                expected: "hardware RAM",
            });
        }
        if let Some(name) = block.shm_name() {
            error!("DPMI: wrong free smem, {name}");
            return Err(Error::WrongKind {
                handle,
                expected: "shared memory",
            });
        }

        let (base, size, kind) = (block.base(), block.size(), block.kind());
        self.cpu.invalidate(base, size);
        match kind {
            BlockKind::Shared => {
                if block.is_mapped() {
                    self.unmap_shm(root, handle);
                }
            }
            BlockKind::General | BlockKind::Linear => {
                for (i, attr) in block.attrs().iter().enumerate() {
                    if attr.commit() == CommitType::Mapped {
                        let addr = block.page_addr(i);
                        if let Err(err) = self.space.restore(addr, PAGE_SIZE) {
                            error!("DPMI: restore mapping failed at {addr:#x}: {err}");
                        }
                    }
                }
                if let Err(err) = self.space.protect(base, size, Protection::RW) {
                    warn!("DPMI: cannot unprotect {size:#x} bytes at {base:#x}: {err}");
                }
                let pool = if kind == BlockKind::Linear {
                    &mut self.linear
                } else {
                    &mut self.general
                };
                pool.free(base as usize, &mut Self::general_hooks(&mut self.space));
            }
            BlockKind::HardwareRam => {}
        }

        if let Some(block) = root.remove(handle) {
            self.release(block.accounted_pages() * PAGE_SIZE);
        }
        debug!("DPMI: free handle {handle}");
        Ok(())
    }

    /// Attach the host shared-memory object `/<prefix><name>` as a block.
    ///
    /// An object that already has a size limits the block to that size;
    /// a new one is sized to the request. Failing to open or map the object
    /// is fatal.
    pub fn malloc_shared(
        &mut self,
        root: &mut BlockRoot,
        name: &str,
        size: usize,
        flags: ShmFlags,
    ) -> Result<Handle> {
        let size = client_size(size)?;
        let resolved = format!("/{}{}", self.shm_prefix, name);
        let exclusive = flags.contains(ShmFlags::EXCLUSIVE);

        if exclusive && root.lookup_by_shmname(name).is_some() {
            return Err(Error::AlreadyExists(resolved));
        }

        let object = match self.space.open_shared(&resolved, size, exclusive) {
            Err(Error::Io(err)) if exclusive && err.kind() == io::ErrorKind::AlreadyExists => {
                // Exclusive names carry their owner's identity: nobody here
                // holds it, so the object is an orphan.
                warn!("DPMI: shm object {resolved} already exists");
                if let Err(err) = self.space.unlink_shared(&resolved) {
                    warn!("DPMI: cannot unlink {resolved}: {err}");
                }
                self.space.open_shared(&resolved, size, exclusive)
            }
            other => other,
        }
        .map_err(|err| escalate("shm_open", err))?;

        let size = object.size;
        debug_assert!(is_page_aligned(size));
        let addr = self
            .general
            .alloc(size, &mut Self::general_hooks(&mut self.space))
            .ok_or_else(|| {
                error!("DPMI: unable to alloc {size:#x} for shm {name}");
                Error::OutOfSpace { size }
            })?;

        let mut prot = Protection::RW;
        if !flags.contains(ShmFlags::NO_EXEC) {
            prot |= Protection::EXEC;
        }
        self.space
            .map_shared(addr as u32, prot, object)
            .map_err(|err| escalate("mmap", err))?;

        let handle = self.next_handle();
        let mut block = Block::new(
            handle,
            BlockKind::Shared,
            addr as u32,
            size,
            PageAttr::SHARED_RW,
        );
        block.names = Some(ShmNames {
            name: name.to_string(),
            resolved,
        });
        root.insert(block);
        debug!("DPMI: map shm {name} at {addr:#x}, handle {handle}");
        Ok(handle)
    }

    /// Release a named shared block, unlinking the host object if asked.
    pub fn free_shared(
        &mut self,
        root: &mut BlockRoot,
        handle: Handle,
        unlink: bool,
    ) -> Result<()> {
        let names = self.shm_names(root, handle)?;
        if root.lookup(handle).is_some_and(Block::is_mapped) {
            self.unmap_shm(root, handle);
        }
        if unlink {
            self.unlink(&names.resolved);
        }
        root.remove(handle);
        Ok(())
    }

    /// Drop the names of a shared block, unlinking the host object if asked.
    /// A block still mapped stays until [`free`](Self::free) or
    /// [`unmap_hw_ram`](Self::unmap_hw_ram) releases it.
    pub fn free_shared_partial(
        &mut self,
        root: &mut BlockRoot,
        handle: Handle,
        unlink: bool,
    ) -> Result<()> {
        let names = self.shm_names(root, handle)?;
        if unlink {
            self.unlink(&names.resolved);
        }
        match root.get_mut(handle) {
            Some(block) if block.mapped => block.names = None,
            _ => {
                root.remove(handle);
            }
        }
        Ok(())
    }

    fn shm_names(&self, root: &BlockRoot, handle: Handle) -> Result<ShmNames> {
        let block = root.lookup(handle).ok_or(Error::InvalidHandle(handle))?;
        block.names.clone().ok_or(Error::WrongKind {
            handle,
            expected: "a memory block",
        })
    }

    fn unlink(&mut self, resolved: &str) {
        debug!("DPMI: unlink shm {resolved}");
        if let Err(err) = self.space.unlink_shared(resolved) {
            warn!("DPMI: cannot unlink {resolved}: {err}");
        }
    }

    /// Release every block of `root`, unlinking named shared objects.
    pub fn free_all(&mut self, root: &mut BlockRoot) -> Result<()> {
        let mut first_err = None;
        for handle in root.handles() {
            let Some(block) = root.lookup(handle) else {
                continue;
            };
            let result = if block.is_hwram() {
                root.remove(handle);
                Ok(())
            } else if block.shm_name().is_some() {
                self.free_shared(root, handle, true)
            } else {
                self.free(root, handle)
            };
            if let Err(err) = result {
                error!("DPMI: cannot release handle {handle}: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Resize a block. Linear blocks are resized through
    /// [`realloc_linear`](Self::realloc_linear) with committed growth.
    ///
    /// Returns the block's base, which only changes when growth does not fit
    /// in place.
    pub fn realloc(
        &mut self,
        root: &mut BlockRoot,
        handle: Handle,
        new_size: usize,
    ) -> Result<u32> {
        if new_size == 0 {
            return Err(Error::InvalidSize(new_size));
        }
        let block = root.lookup(handle).ok_or(Error::InvalidHandle(handle))?;
        match block.kind() {
            BlockKind::General => {}
            BlockKind::Linear => return self.realloc_linear(root, handle, new_size, true),
            BlockKind::HardwareRam | BlockKind::Shared => {
                return Err(Error::NotResizable(handle));
            }
        }

        let new_size = client_size(new_size)?;
        let (base, size) = (block.base(), block.size());
        if new_size == size {
            return Ok(base);
        }
        if new_size > size && new_size - size > self.free_memory() {
            debug!("DPMI: realloc failed, not enough dpmi memory");
            return Err(Error::BudgetExceeded {
                requested: new_size - size,
                available: self.free_memory(),
            });
        }

        // The pool needs full access to the old block.
        self.cpu.invalidate(base, size);
        self.space.protect(base, size, Protection::RWX)?;
        let Some(new_base) =
            self.general
                .realloc(base as usize, new_size, &mut Self::general_hooks(&mut self.space))
        else {
            self.restore_page_protection(root, handle)?;
            return Err(Error::OutOfSpace { size: new_size });
        };

        self.finish_realloc(root, handle, new_base as u32, new_size, true);
        self.restore_page_protection(root, handle)?;
        Ok(new_base as u32)
    }

    /// Resize a linear block; grown pages are committed or not per
    /// `committed`.
    pub fn realloc_linear(
        &mut self,
        root: &mut BlockRoot,
        handle: Handle,
        new_size: usize,
        committed: bool,
    ) -> Result<u32> {
        if new_size == 0 {
            return Err(Error::InvalidSize(new_size));
        }
        let block = root.lookup(handle).ok_or(Error::InvalidHandle(handle))?;
        if block.kind() != BlockKind::Linear {
            debug!("DPMI: attempt to realloc memory region with inappropriate function");
            return Err(Error::NotResizable(handle));
        }

        let new_size = client_size(new_size)?;
        let (base, size) = (block.base(), block.size());
        if new_size == size {
            return Ok(base);
        }
        if new_size > size && committed && new_size - size > self.free_memory() {
            debug!("DPMI: realloc failed, not enough dpmi memory");
            return Err(Error::BudgetExceeded {
                requested: new_size - size,
                available: self.free_memory(),
            });
        }

        // Uniform protection lets the host move the range as one mapping.
        self.cpu.invalidate(base, size);
        self.space.protect(base, size, Protection::RWX)?;
        let Some(new_base) =
            self.linear
                .realloc(base as usize, new_size, &mut Self::linear_hooks(&mut self.space))
        else {
            self.restore_page_protection(root, handle)?;
            return Err(Error::OutOfSpace { size: new_size });
        };

        self.finish_realloc(root, handle, new_base as u32, new_size, committed);
        self.restore_page_protection(root, handle)?;
        Ok(new_base as u32)
    }

    /// Resize the attribute array and settle the counter after a pool
    /// reallocation.
    fn finish_realloc(
        &mut self,
        root: &mut BlockRoot,
        handle: Handle,
        new_base: u32,
        new_size: usize,
        committed: bool,
    ) {
        let Some(block) = root.get_mut(handle) else {
            return;
        };
        let old_pages = block.pages();
        let new_pages = pages(new_size);
        if new_pages > old_pages {
            let attr = if committed {
                PageAttr::COMMITTED_RW
            } else {
                PageAttr::UNCOMMITTED_RW
            };
            block.attrs.resize(new_pages, attr);
            if committed {
                self.allocd += (new_pages - old_pages) * PAGE_SIZE;
            }
        } else {
            let released = block.attrs[new_pages..]
                .iter()
                .filter(|a| is_accounted(**a))
                .count();
            block.attrs.truncate(new_pages);
            self.release(released * PAGE_SIZE);
        }
        block.size = new_size;
        root.rebase(handle, new_base);
    }

    /// Give every page of a block the protection its attribute word asks
    /// for. Pages backed by something else are left alone.
    fn restore_page_protection(&mut self, root: &BlockRoot, handle: Handle) -> Result<()> {
        let Some(block) = root.lookup(handle) else {
            return Ok(());
        };
        self.cpu.invalidate(block.base(), block.size());
        let attrs = block.attrs();
        let mut start = 0;
        while start < attrs.len() {
            let prot = attrs[start].host_protection();
            let mut end = start + 1;
            while end < attrs.len() && attrs[end].host_protection() == prot {
                end += 1;
            }
            if let Some(prot) = prot {
                self.space
                    .protect(block.page_addr(start), (end - start) * PAGE_SIZE, prot)
                    .map_err(|err| escalate("mprotect", err))?;
            }
            start = end;
        }
        Ok(())
    }

    /// Make `count` pages of conventional memory at `low_addr` appear at
    /// `offset` inside a block.
    pub fn map_conventional(
        &mut self,
        root: &mut BlockRoot,
        handle: Handle,
        offset: usize,
        low_addr: u32,
        count: usize,
    ) -> Result<()> {
        let block = root.lookup(handle).ok_or(Error::InvalidHandle(handle))?;
        if block.is_hwram() || block.is_shm() {
            return Err(Error::NotSupported(
                "conventional memory over hardware or shared memory".to_string(),
            ));
        }
        if count == 0 {
            return Err(Error::InvalidSize(0));
        }
        let len = count.checked_mul(PAGE_SIZE).ok_or(Error::InvalidSize(count))?;
        if !is_page_aligned(offset) {
            return Err(Error::InvalidAddress(block.base().wrapping_add(offset as u32)));
        }
        if offset.checked_add(len).map_or(true, |end| end > block.size()) {
            return Err(Error::OutOfRange {
                base: block.base().wrapping_add(offset as u32),
                size: len,
            });
        }
        let low_end = (low_addr as usize).checked_add(len);
        if !is_page_aligned(low_addr as usize)
            || low_end.map_or(true, |end| end > LOWMEM_SIZE + HMA_SIZE)
        {
            return Err(Error::InvalidAddress(low_addr));
        }

        let addr = block.page_addr(offset >> PAGE_SHIFT);
        self.cpu.invalidate(addr, len);
        if let Err(err) = self.space.alias_lowmem(addr, len, Protection::RWX, low_addr) {
            debug!("DPMI: map conventional memory failed: {err}");
            return Err(err);
        }

        let first = offset >> PAGE_SHIFT;
        let mut released = 0;
        if let Some(block) = root.get_mut(handle) {
            for attr in &mut block.attrs[first..first + count] {
                if is_accounted(*attr) {
                    released += 1;
                }
                *attr = attr.with_commit(CommitType::Mapped);
            }
        }
        self.release(released * PAGE_SIZE);
        Ok(())
    }

    /// Apply attribute requests to consecutive pages starting at `offset`.
    ///
    /// Each page is updated on its own: a failure leaves the failing page and
    /// all following ones untouched, but earlier pages keep their new state.
    pub fn set_page_attributes(
        &mut self,
        root: &mut BlockRoot,
        handle: Handle,
        offset: usize,
        attrs: &[PageAttr],
    ) -> Result<()> {
        let block = root.lookup(handle).ok_or(Error::InvalidHandle(handle))?;
        if !block.is_mapped() {
            debug!("DPMI: set page attributes on detached block {handle}");
            return Err(Error::InvalidAddress(block.base()));
        }
        if !block.is_linear() {
            debug!("DPMI: attempt to set page attributes for inappropriate mem region");
            if self.no_null_checks && offset == 0 && attrs.len() == 1 {
                return Err(Error::NotSupported(
                    "page attributes at offset 0 of a non-linear block".to_string(),
                ));
            }
        }
        let first = Self::page_range(block, offset, attrs.len())?;
        let Some(block) = root.get_mut(handle) else {
            return Err(Error::InvalidHandle(handle));
        };
        // Hardware windows are outside the budget.
        let accounted = !block.is_hwram();

        for (i, &request) in attrs.iter().enumerate() {
            let page = first + i;
            let current = block.attrs[page];
            if current == request {
                continue;
            }
            if current.shared() && !request.is_attr_only() {
                debug!("DPMI: disallow change type of shared page {page}");
                return Err(Error::SharedPage { page });
            }
            let transition = current.transition(request).map_err(|err| {
                debug!("DPMI: not changing {} on uncommitted page {page}", err.what());
                Error::Uncommitted {
                    page,
                    what: err.what(),
                }
            })?;
            if accounted && transition.commit_delta > 0 && self.free_memory() < PAGE_SIZE {
                debug!("DPMI: memory limit reached, cannot commit page");
                return Err(Error::BudgetExceeded {
                    requested: PAGE_SIZE,
                    available: self.free_memory(),
                });
            }

            let addr = block.page_addr(page);
            match transition.effect {
                Some(Effect::Protect(prot)) => {
                    self.cpu.invalidate(addr, PAGE_SIZE);
                    self.space
                        .protect(addr, PAGE_SIZE, prot)
                        .map_err(|err| escalate("mprotect", err))?;
                }
                Some(Effect::Revoke) => {
                    self.cpu.invalidate(addr, PAGE_SIZE);
                    if let Err(err) = self.space.protect(addr, PAGE_SIZE, Protection::NONE) {
                        debug!("DPMI: cannot revoke page at {addr:#x}: {err}");
                        return Err(err);
                    }
                }
                None => {}
            }

            block.attrs[page] = transition.attr;
            match transition.commit_delta {
                1 if accounted => self.allocd += PAGE_SIZE,
                -1 if accounted => self.release(PAGE_SIZE),
                _ => {}
            }
        }
        Ok(())
    }

    /// Attribute words of `count` pages starting at `offset`, as reported to
    /// clients.
    pub fn get_page_attributes(
        &self,
        root: &BlockRoot,
        handle: Handle,
        offset: usize,
        count: usize,
    ) -> Result<Vec<PageAttr>> {
        let block = root.lookup(handle).ok_or(Error::InvalidHandle(handle))?;
        let first = Self::page_range(block, offset, count)?;
        Ok(block.attrs[first..first + count]
            .iter()
            .map(|a| a.reported())
            .collect())
    }

    /// First page index of `count` pages at `offset`, checked against the
    /// block.
    fn page_range(block: &Block, offset: usize, count: usize) -> Result<usize> {
        let addr = block.base().wrapping_add(offset as u32);
        if !is_page_aligned(offset) {
            return Err(Error::InvalidAddress(addr));
        }
        let first = offset >> PAGE_SHIFT;
        if first.checked_add(count).map_or(true, |end| end > block.pages()) {
            return Err(Error::OutOfRange {
                base: addr,
                size: count.saturating_mul(PAGE_SIZE),
            });
        }
        Ok(first)
    }

    /// Tear the manager down and return the number of bytes still allocated
    /// from its pools.
    pub fn destroy(self) -> usize {
        let leak = self.general.destroy();
        if leak != 0 {
            error!("DPMI: leaked {leak} bytes (main pool)");
        }
        let lin_leak = self.linear.destroy();
        if lin_leak != 0 {
            error!("DPMI: leaked {lin_leak} bytes (linear pool)");
        }
        leak + lin_leak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::fake::{FakeCpu, FakeSpace, Op};

    const BASE: u32 = 0x20_0000;
    const P: usize = PAGE_SIZE;

    fn config() -> MemoryConfig {
        MemoryConfig {
            dpmi_kb: 64,
            dpmi_base: BASE,
            ..Default::default()
        }
    }

    fn manager() -> BlockManager<FakeSpace, FakeCpu> {
        BlockManager::with_cpu(&config(), FakeSpace::default(), FakeCpu::default())
    }

    fn attrs(bits: &[u16]) -> Vec<PageAttr> {
        bits.iter().map(|&b| PageAttr::from_bits(b)).collect()
    }

    fn raw(mgr: &BlockManager<FakeSpace, FakeCpu>, root: &BlockRoot, handle: Handle) -> Vec<u16> {
        let pages = root.lookup(handle).unwrap().pages();
        mgr.get_page_attributes(root, handle, 0, pages)
            .unwrap()
            .into_iter()
            .map(PageAttr::into_bits)
            .collect()
    }

    /// Counter matches the committed private pages, and mapped blocks are
    /// disjoint.
    fn check(mgr: &BlockManager<FakeSpace, FakeCpu>, root: &BlockRoot) {
        let committed: usize = root.iter().map(Block::accounted_pages).sum();
        assert_eq!(mgr.allocated(), committed * P);
        assert!(mgr.allocated() <= mgr.total_memory() + DPMI_RESERVED_SPACE);

        let mut ranges: Vec<_> = root
            .iter()
            .filter(|b| b.is_mapped())
            .map(|b| (b.base() as u64, b.end()))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "blocks overlap: {pair:?}");
        }
    }

    #[test]
    fn test_malloc_commits_pages() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();

        let h = mgr.malloc(&mut root, 3 * P).unwrap();
        let block = root.lookup(h).unwrap();
        assert_eq!(block.base(), BASE);
        assert_eq!(block.kind(), BlockKind::General);
        assert!(!block.is_linear());
        for attr in mgr.get_page_attributes(&root, h, 0, 3).unwrap() {
            assert_eq!(attr.commit(), CommitType::Committed);
            assert!(attr.writable());
            assert!(!attr.no_exec());
        }
        assert_eq!(mgr.allocated(), 3 * P);
        assert_eq!(mgr.space().page_prot(BASE + P as u32), Some(Protection::RWX));
        check(&mgr, &root);
    }

    #[test]
    fn test_decommit_middle_page() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc(&mut root, 3 * P).unwrap();

        mgr.set_page_attributes(&mut root, h, P, &attrs(&[0x00])).unwrap();
        assert_eq!(mgr.allocated(), 2 * P);
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x00, 0x09]);
        assert_eq!(mgr.space().page_prot(BASE + P as u32), Some(Protection::NONE));
        assert_eq!(mgr.space().page_prot(BASE), Some(Protection::RWX));
        assert!(mgr.cpu().invalidated.contains(&(BASE + P as u32, P)));
        check(&mgr, &root);

        mgr.free(&mut root, h).unwrap();
        assert_eq!(mgr.allocated(), 0);
        assert!(root.is_empty());
    }

    #[test]
    fn test_malloc_budget() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let total = mgr.total_memory();

        let err = mgr
            .malloc(&mut root, total + DPMI_RESERVED_SPACE + P)
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
        assert!(err.is_exhaustion());
        assert!(root.is_empty());
        assert_eq!(mgr.allocated(), 0);

        // General allocations may dip into the headroom...
        mgr.malloc(&mut root, total).unwrap();
        assert_eq!(mgr.free_memory(), 0);
        mgr.malloc(&mut root, P).unwrap();
        assert_eq!(mgr.allocated(), total + P);
        assert_eq!(mgr.free_memory(), 0);

        // ...committed linear memory may not.
        assert!(matches!(
            mgr.malloc_linear(&mut root, None, P, true),
            Err(Error::BudgetExceeded { .. })
        ));
        check(&mgr, &root);
    }

    #[test]
    fn test_malloc_rejects_zero() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        assert!(matches!(mgr.malloc(&mut root, 0), Err(Error::InvalidSize(0))));
        assert!(matches!(
            mgr.malloc_linear(&mut root, None, 0, true),
            Err(Error::InvalidSize(0))
        ));
    }

    #[test]
    fn test_linear_fixed_outside_window() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();

        let below = mgr.malloc_linear(&mut root, Some(0x10_0000), P, true);
        assert!(matches!(below, Err(Error::OutOfRange { base: 0x10_0000, .. })));
        assert!(root.is_empty());
        assert_eq!(mgr.allocated(), 0);

        let past_end = mgr.malloc_linear(&mut root, Some(BASE - P as u32), 2 * P, true);
        assert!(matches!(past_end, Err(Error::OutOfRange { .. })));

        let unaligned = mgr.malloc_linear(&mut root, Some(LINEAR_BASE as u32 + 1), P, true);
        assert!(matches!(unaligned, Err(Error::InvalidAddress(_))));
        assert!(root.is_empty());
    }

    #[test]
    fn test_linear_topdown_and_fixed() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        assert_eq!(mgr.lin_mem_rsv(), BASE as usize - LINEAR_BASE);

        let top = mgr.malloc_linear(&mut root, None, 2 * P, false).unwrap();
        let block = root.lookup(top).unwrap();
        assert_eq!(block.base(), BASE - 2 * P as u32);
        assert!(block.is_linear());
        assert_eq!(raw(&mgr, &root, top), vec![0x08, 0x08]);
        assert_eq!(mgr.allocated(), 0);
        assert_eq!(mgr.space().page_prot(BASE - P as u32), Some(Protection::NONE));

        let fixed = mgr
            .malloc_linear(&mut root, Some(LINEAR_BASE as u32), P, true)
            .unwrap();
        assert_eq!(root.lookup(fixed).unwrap().base(), LINEAR_BASE as u32);
        assert_eq!(raw(&mgr, &root, fixed), vec![0x09]);
        assert_eq!(mgr.allocated(), P);
        assert_eq!(mgr.space().page_prot(LINEAR_BASE as u32), Some(Protection::RWX));
        assert_eq!(mgr.lin_mem_free(), mgr.lin_mem_rsv() - 3 * P);

        let taken = mgr.malloc_linear(&mut root, Some(BASE - P as u32), P, false);
        assert!(matches!(taken, Err(Error::OutOfSpace { .. })));
        check(&mgr, &root);
    }

    #[test]
    fn test_commit_linear_pages() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc_linear(&mut root, None, 2 * P, false).unwrap();
        let base = root.lookup(h).unwrap().base();

        mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x09, 0x89]))
            .unwrap();
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x89]);
        assert_eq!(mgr.allocated(), 2 * P);
        assert_eq!(mgr.space().page_prot(base), Some(Protection::RWX));
        assert_eq!(mgr.space().page_prot(base + P as u32), Some(Protection::RW));
        check(&mgr, &root);
    }

    #[test]
    fn test_commit_needs_free_memory() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let total = mgr.total_memory();
        mgr.malloc(&mut root, total - P).unwrap();
        let h = mgr.malloc_linear(&mut root, None, 2 * P, false).unwrap();

        let err = mgr
            .set_page_attributes(&mut root, h, 0, &attrs(&[0x09, 0x09]))
            .unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
        // The first page went through, the second was left alone.
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x08]);
        assert_eq!(mgr.allocated(), total);
        check(&mgr, &root);
    }

    #[test]
    fn test_attr_only_on_uncommitted_page() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc_linear(&mut root, None, P, false).unwrap();

        // Clearing read/write is allowed and keeps the page uncommitted.
        mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x03])).unwrap();
        assert_eq!(raw(&mgr, &root, h), vec![0x00]);
        assert_eq!(mgr.allocated(), 0);

        let err = mgr
            .set_page_attributes(&mut root, h, 0, &attrs(&[0x0b]))
            .unwrap_err();
        assert!(matches!(err, Error::Uncommitted { page: 0, what: "read/write" }));
        let err = mgr
            .set_page_attributes(&mut root, h, 0, &attrs(&[0x83]))
            .unwrap_err();
        assert!(matches!(err, Error::Uncommitted { page: 0, what: "no-execute" }));
        assert_eq!(raw(&mgr, &root, h), vec![0x00]);
        check(&mgr, &root);
    }

    #[test]
    fn test_set_access_bits_are_not_reported() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc(&mut root, P).unwrap();

        mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x79])).unwrap();
        assert_eq!(root.lookup(h).unwrap().attrs()[0].into_bits(), 0x79);
        assert_eq!(raw(&mgr, &root, h), vec![0x69]);
    }

    #[test]
    fn test_page_attribute_ranges() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc(&mut root, 2 * P).unwrap();

        assert!(matches!(
            mgr.set_page_attributes(&mut root, h, P, &attrs(&[0x09, 0x09])),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            mgr.set_page_attributes(&mut root, h, 1, &attrs(&[0x09])),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            mgr.get_page_attributes(&root, h, 0, 3),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            mgr.set_page_attributes(&mut root, Handle::new(99), 0, &attrs(&[0x09])),
            Err(Error::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_no_null_checks() {
        let config = MemoryConfig {
            no_null_checks: true,
            ..config()
        };
        let mut mgr = BlockManager::with_cpu(&config, FakeSpace::default(), FakeCpu::default());
        let mut root = BlockRoot::new();
        let h = mgr.malloc(&mut root, 2 * P).unwrap();

        assert!(matches!(
            mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x01])),
            Err(Error::NotSupported(_))
        ));
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x09]);
        mgr.set_page_attributes(&mut root, h, P, &attrs(&[0x01])).unwrap();
        mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x01, 0x01]))
            .unwrap();
        assert_eq!(raw(&mgr, &root, h), vec![0x01, 0x01]);

        // Linear blocks are not affected.
        let lin = mgr.malloc_linear(&mut root, None, P, true).unwrap();
        mgr.set_page_attributes(&mut root, lin, 0, &attrs(&[0x01])).unwrap();
    }

    #[test]
    fn test_protection_failures() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let lin = mgr.malloc_linear(&mut root, None, P, false).unwrap();
        let general = mgr.malloc(&mut root, P).unwrap();
        mgr.space_mut().fail_protect = true;

        // Failing to protect a page being committed is fatal.
        let err = mgr
            .set_page_attributes(&mut root, lin, 0, &attrs(&[0x09]))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(raw(&mgr, &root, lin), vec![0x08]);

        // Failing to revoke access is reported.
        let err = mgr
            .set_page_attributes(&mut root, general, 0, &attrs(&[0x00]))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(raw(&mgr, &root, general), vec![0x09]);
        check(&mgr, &root);
    }

    #[test]
    fn test_shared_block() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();

        let h = mgr
            .malloc_shared(&mut root, "X", 2 * P - 10, ShmFlags::empty())
            .unwrap();
        let block = root.lookup(h).unwrap();
        assert!(block.is_shm());
        assert!(block.is_linear());
        assert_eq!(block.size(), 2 * P);
        assert_eq!(block.shm_name(), Some("X"));
        assert_eq!(block.resolved_shm_name(), Some("/dpmi_X"));
        assert_eq!(raw(&mgr, &root, h), vec![0x0d, 0x0d]);
        assert_eq!(mgr.allocated(), 0);
        assert!(mgr
            .space()
            .ops
            .contains(&Op::MapShared(block.base(), 2 * P, Protection::RWX)));
        assert_eq!(mgr.space().objects.get("/dpmi_X"), Some(&(2 * P)));

        let no_exec = mgr
            .malloc_shared(&mut root, "X", P, ShmFlags::NO_EXEC)
            .unwrap();
        let base = root.lookup(no_exec).unwrap().base();
        assert!(mgr.space().ops.contains(&Op::MapShared(base, P, Protection::RW)));
        assert_eq!(root.count_shm_blocks("X"), 2);
        check(&mgr, &root);

        assert!(matches!(
            mgr.malloc_shared(&mut root, "Y", 0, ShmFlags::empty()),
            Err(Error::InvalidSize(0))
        ));
    }

    #[test]
    fn test_shared_size_follows_existing_object() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        mgr.space_mut().objects.insert("/dpmi_Z".to_string(), P);

        let h = mgr
            .malloc_shared(&mut root, "Z", 3 * P, ShmFlags::empty())
            .unwrap();
        assert_eq!(root.lookup(h).unwrap().size(), P);
    }

    #[test]
    fn test_shared_page_is_immutable() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr
            .malloc_shared(&mut root, "X", 2 * P, ShmFlags::empty())
            .unwrap();

        for request in [0x00, 0x01, 0x09, 0x0a] {
            let err = mgr
                .set_page_attributes(&mut root, h, 0, &attrs(&[request]))
                .unwrap_err();
            assert!(matches!(err, Error::SharedPage { page: 0 }));
            assert_eq!(raw(&mgr, &root, h), vec![0x0d, 0x0d]);
        }

        // Identical words are skipped; attribute-only changes are allowed.
        mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x0d, 0x03]))
            .unwrap();
        assert_eq!(raw(&mgr, &root, h), vec![0x0d, 0x05]);
        assert_eq!(mgr.allocated(), 0);
    }

    #[test]
    fn test_exclusive_shared_twice() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();

        mgr.malloc_shared(&mut root, "X", P, ShmFlags::EXCLUSIVE)
            .unwrap();
        let err = mgr
            .malloc_shared(&mut root, "X", P, ShmFlags::EXCLUSIVE)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(ref name) if name == "/dpmi_X"));
        assert!(!err.is_exhaustion());
        assert_eq!(root.count_shm_blocks("X"), 1);
    }

    #[test]
    fn test_exclusive_shared_recovers_orphan() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        mgr.space_mut().objects.insert("/dpmi_Y".to_string(), 4 * P);

        let h = mgr
            .malloc_shared(&mut root, "Y", P, ShmFlags::EXCLUSIVE)
            .unwrap();
        assert!(mgr.space().ops.contains(&Op::Unlink("/dpmi_Y".to_string())));
        // Re-created at the requested size.
        assert_eq!(root.lookup(h).unwrap().size(), P);
        assert_eq!(mgr.space().objects.get("/dpmi_Y"), Some(&P));
    }

    #[test]
    fn test_free_shared() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let free_before = mgr.general.free_space();

        let h = mgr
            .malloc_shared(&mut root, "A", P, ShmFlags::empty())
            .unwrap();
        let base = root.lookup(h).unwrap().base();
        assert!(matches!(
            mgr.free(&mut root, h),
            Err(Error::WrongKind { expected: "shared memory", .. })
        ));

        mgr.free_shared(&mut root, h, true).unwrap();
        assert!(root.is_empty());
        assert!(!mgr.space().objects.contains_key("/dpmi_A"));
        assert!(mgr.space().ops.contains(&Op::Restore(base, P)));
        assert_eq!(mgr.general.free_space(), free_before);
    }

    #[test]
    fn test_free_shared_partial_keeps_mapped_block() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr
            .malloc_shared(&mut root, "B", P, ShmFlags::empty())
            .unwrap();
        let base = root.lookup(h).unwrap().base();

        mgr.free_shared_partial(&mut root, h, false).unwrap();
        let block = root.lookup(h).unwrap();
        assert!(block.is_mapped());
        assert_eq!(block.shm_name(), None);
        assert!(root.lookup_by_shmname("B").is_none());
        assert!(mgr.space().objects.contains_key("/dpmi_B"));
        assert!(matches!(
            mgr.free_shared(&mut root, h, true),
            Err(Error::WrongKind { .. })
        ));

        // The nameless mapping goes away through the hardware path.
        mgr.unmap_hw_ram(&mut root, base).unwrap();
        assert!(root.is_empty());
    }

    #[test]
    fn test_detached_shared_block() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr
            .malloc_shared(&mut root, "C", P, ShmFlags::empty())
            .unwrap();
        let base = root.lookup(h).unwrap().base();

        mgr.unmap_hw_ram(&mut root, base).unwrap();
        let block = root.lookup(h).unwrap();
        assert!(!block.is_mapped());
        assert!(root.lookup_by_addr(base).is_none());

        // The area is free again.
        let g = mgr.malloc(&mut root, P).unwrap();
        assert_eq!(root.lookup(g).unwrap().base(), base);

        // The detached block no longer owns its old address.
        let ops = mgr.space().ops.len();
        assert!(matches!(
            mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x03])),
            Err(Error::InvalidAddress(_))
        ));
        assert_eq!(mgr.space().ops.len(), ops);
        assert_eq!(raw(&mgr, &root, g), vec![0x09]);

        mgr.free_shared_partial(&mut root, h, true).unwrap();
        assert!(root.lookup(h).is_none());
        assert!(mgr.space().ops.contains(&Op::Unlink("/dpmi_C".to_string())));
        check(&mgr, &root);
    }

    #[test]
    fn test_realloc_shrink_then_grow() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc(&mut root, 2 * P).unwrap();

        assert_eq!(mgr.realloc(&mut root, h, P).unwrap(), BASE);
        assert_eq!(mgr.allocated(), P);
        assert_eq!(raw(&mgr, &root, h), vec![0x09]);

        assert_eq!(mgr.realloc(&mut root, h, 2 * P).unwrap(), BASE);
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x09]);
        assert_eq!(mgr.allocated(), 2 * P);

        // Same aligned size is a no-op.
        assert_eq!(mgr.realloc(&mut root, h, 2 * P - 1).unwrap(), BASE);
        check(&mgr, &root);
    }

    #[test]
    fn test_realloc_relocates_when_blocked() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let a = mgr.malloc(&mut root, P).unwrap();
        let b = mgr.malloc(&mut root, P).unwrap();

        let moved = mgr.realloc(&mut root, a, 2 * P).unwrap();
        assert_ne!(moved, BASE);
        assert_eq!(root.lookup(a).unwrap().base(), moved);
        assert!(mgr.space().ops.contains(&Op::Relocate(BASE, moved, P)));
        assert!(root.lookup_by_addr(BASE).is_none());
        assert_eq!(root.lookup_by_addr(moved + P as u32).map(Block::handle), Some(a));
        assert_eq!(root.lookup(b).unwrap().base(), BASE + P as u32);
        check(&mgr, &root);
    }

    #[test]
    fn test_realloc_restores_protection() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc(&mut root, 2 * P).unwrap();
        mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x01, 0x00]))
            .unwrap();

        mgr.realloc(&mut root, h, 3 * P).unwrap();
        let space = mgr.space();
        assert_eq!(space.page_prot(BASE), Some(Protection::READ | Protection::EXEC));
        assert_eq!(space.page_prot(BASE + P as u32), Some(Protection::NONE));
        assert_eq!(space.page_prot(BASE + 2 * P as u32), Some(Protection::RWX));
        assert_eq!(raw(&mgr, &root, h), vec![0x01, 0x00, 0x09]);
        assert_eq!(mgr.allocated(), 2 * P);
        check(&mgr, &root);
    }

    #[test]
    fn test_realloc_errors() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let general = mgr.malloc(&mut root, P).unwrap();
        let shared = mgr
            .malloc_shared(&mut root, "S", P, ShmFlags::empty())
            .unwrap();
        mgr.cpu_mut().hw_base = Some(0xe000_0000);
        let hw = mgr.map_hw_ram(&mut root, 0xa_0000, P).unwrap();

        assert!(matches!(mgr.realloc(&mut root, general, 0), Err(Error::InvalidSize(0))));
        assert!(matches!(mgr.realloc(&mut root, shared, 2 * P), Err(Error::NotResizable(_))));
        assert!(matches!(mgr.realloc(&mut root, hw, 2 * P), Err(Error::NotResizable(_))));
        assert!(matches!(
            mgr.realloc_linear(&mut root, general, 2 * P, true),
            Err(Error::NotResizable(_))
        ));
        assert!(matches!(
            mgr.realloc(&mut root, Handle::new(99), P),
            Err(Error::InvalidHandle(_))
        ));

        let total = mgr.total_memory();
        assert!(matches!(
            mgr.realloc(&mut root, general, total + P),
            Err(Error::BudgetExceeded { .. })
        ));
        assert_eq!(root.lookup(general).unwrap().size(), P);
        check(&mgr, &root);
    }

    #[test]
    fn test_realloc_linear() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr
            .malloc_linear(&mut root, Some(LINEAR_BASE as u32), P, true)
            .unwrap();

        let base = mgr.realloc_linear(&mut root, h, 3 * P, false).unwrap();
        assert_eq!(base, LINEAR_BASE as u32);
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x08, 0x08]);
        assert_eq!(mgr.allocated(), P);
        assert_eq!(mgr.space().page_prot(base + P as u32), Some(Protection::NONE));
        assert_eq!(mgr.space().page_prot(base), Some(Protection::RWX));

        // The general entry point grows linear blocks committed.
        mgr.realloc(&mut root, h, P).unwrap();
        mgr.realloc(&mut root, h, 2 * P).unwrap();
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x09]);
        assert_eq!(mgr.allocated(), 2 * P);
        check(&mgr, &root);
    }

    #[test]
    fn test_realloc_linear_failure_restores_protection() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc_linear(&mut root, None, P, false).unwrap();
        let rsv = mgr.lin_mem_rsv();

        let err = mgr.realloc_linear(&mut root, h, rsv + P, false).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace { .. }));
        let base = root.lookup(h).unwrap().base();
        assert_eq!(mgr.space().page_prot(base), Some(Protection::NONE));
        assert_eq!(root.lookup(h).unwrap().size(), P);
    }

    #[test]
    fn test_map_conventional() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc(&mut root, 3 * P).unwrap();

        mgr.map_conventional(&mut root, h, P, 0x1000, 1).unwrap();
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x0a, 0x09]);
        assert_eq!(mgr.allocated(), 2 * P);
        assert!(mgr
            .space()
            .ops
            .contains(&Op::Alias(BASE + P as u32, P, 0x1000)));
        check(&mgr, &root);

        assert!(matches!(
            mgr.map_conventional(&mut root, h, 100, 0x1000, 1),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            mgr.map_conventional(&mut root, h, 2 * P, 0x1000, 2),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            mgr.map_conventional(&mut root, h, 0, (LOWMEM_SIZE + HMA_SIZE) as u32, 1),
            Err(Error::InvalidAddress(_))
        ));

        mgr.free(&mut root, h).unwrap();
        assert!(mgr.space().ops.contains(&Op::Restore(BASE + P as u32, P)));
        assert_eq!(mgr.allocated(), 0);
    }

    #[test]
    fn test_hw_ram() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        assert!(matches!(
            mgr.map_hw_ram(&mut root, 0xa_0000, P),
            Err(Error::NotSupported(_))
        ));

        mgr.cpu_mut().hw_base = Some(0xe000_0000);
        let h = mgr.map_hw_ram(&mut root, 0xa_0000, 2 * P).unwrap();
        let block = root.lookup(h).unwrap();
        assert!(block.is_hwram());
        assert_eq!(block.base(), 0xe000_0000);
        assert_eq!(raw(&mgr, &root, h), vec![0x09, 0x09]);
        assert_eq!(mgr.allocated(), 0);

        assert!(matches!(
            mgr.free(&mut root, h),
            Err(Error::WrongKind { expected: "hardware RAM", .. })
        ));
        let general = mgr.malloc(&mut root, P).unwrap();
        assert!(matches!(
            mgr.unmap_hw_ram(&mut root, BASE),
            Err(Error::WrongKind { .. })
        ));
        assert!(matches!(
            mgr.unmap_hw_ram(&mut root, 0x1234),
            Err(Error::InvalidAddress(0x1234))
        ));

        mgr.unmap_hw_ram(&mut root, 0xe000_1000).unwrap();
        assert!(root.lookup(h).is_none());
        assert!(root.lookup(general).is_some());
    }

    #[test]
    fn test_hw_ram_commit_changes_are_not_accounted() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        mgr.malloc(&mut root, 2 * P).unwrap();
        mgr.cpu_mut().hw_base = Some(0xe000_0000);
        let h = mgr.map_hw_ram(&mut root, 0xa_0000, P).unwrap();

        mgr.set_page_attributes(&mut root, h, 0, &attrs(&[0x00]))
            .unwrap();
        assert!(!root.lookup(h).unwrap().attrs()[0].is_committed());
        assert_eq!(mgr.allocated(), 2 * P);
        check(&mgr, &root);

        mgr.set_page_attributes(&mut root, h, 0, &[PageAttr::COMMITTED_RW])
            .unwrap();
        assert!(root.lookup(h).unwrap().attrs()[0].is_committed());
        assert_eq!(mgr.allocated(), 2 * P);
        check(&mgr, &root);
    }

    #[test]
    fn test_oversized_requests_are_refused() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let h = mgr.malloc(&mut root, 2 * P).unwrap();
        let huge = usize::MAX - P + 1;

        assert!(matches!(
            mgr.malloc(&mut root, usize::MAX),
            Err(Error::InvalidSize(usize::MAX))
        ));
        assert!(matches!(
            mgr.malloc_linear(&mut root, None, usize::MAX, false),
            Err(Error::InvalidSize(_))
        ));
        let lin_base = mgr.linear.base() as u32;
        assert!(matches!(
            mgr.malloc_linear(&mut root, Some(lin_base), huge, false),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            mgr.malloc_shared(&mut root, "big", usize::MAX, ShmFlags::empty()),
            Err(Error::InvalidSize(_))
        ));
        assert!(matches!(
            mgr.realloc(&mut root, h, usize::MAX),
            Err(Error::InvalidSize(_))
        ));
        assert!(matches!(
            mgr.realloc(&mut root, h, huge),
            Err(Error::BudgetExceeded { .. })
        ));
        assert!(matches!(
            mgr.get_page_attributes(&root, h, P, usize::MAX),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            mgr.map_conventional(&mut root, h, 0, 0, usize::MAX / 2),
            Err(Error::InvalidSize(_))
        ));
        assert!(matches!(
            mgr.map_conventional(&mut root, h, P, 0, usize::MAX / P),
            Err(Error::OutOfRange { .. })
        ));

        assert_eq!(root.len(), 1);
        assert_eq!(mgr.allocated(), 2 * P);
        check(&mgr, &root);
    }

    #[test]
    fn test_free_all() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        let free_before = mgr.general.free_space();
        mgr.cpu_mut().hw_base = Some(0xe000_0000);

        mgr.malloc(&mut root, 2 * P).unwrap();
        mgr.malloc_linear(&mut root, None, P, true).unwrap();
        mgr.malloc_shared(&mut root, "F", P, ShmFlags::empty())
            .unwrap();
        let partial = mgr
            .malloc_shared(&mut root, "G", P, ShmFlags::empty())
            .unwrap();
        mgr.free_shared_partial(&mut root, partial, false).unwrap();
        mgr.map_hw_ram(&mut root, 0xa_0000, P).unwrap();
        check(&mgr, &root);

        mgr.free_all(&mut root).unwrap();
        assert!(root.is_empty());
        assert_eq!(mgr.allocated(), 0);
        assert!(!mgr.space().objects.contains_key("/dpmi_F"));
        assert!(mgr.space().objects.contains_key("/dpmi_G"));
        assert_eq!(mgr.general.free_space(), free_before);
        assert_eq!(mgr.lin_mem_free(), mgr.lin_mem_rsv());
        assert_eq!(mgr.destroy(), 0);
    }

    #[test]
    fn test_destroy_reports_leaks() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();
        mgr.malloc(&mut root, P).unwrap();
        mgr.malloc_linear(&mut root, None, 2 * P, false).unwrap();
        assert_eq!(mgr.destroy(), 3 * P);
    }

    #[test]
    fn test_handles_are_unique_across_roots() {
        let mut mgr = manager();
        let mut first = BlockRoot::new();
        let mut second = BlockRoot::new();

        let a = mgr.malloc(&mut first, P).unwrap();
        let b = mgr.malloc(&mut second, P).unwrap();
        assert_ne!(a, b);
        assert!(first.lookup(b).is_none());

        mgr.free(&mut first, a).unwrap();
        let c = mgr.malloc(&mut first, P).unwrap();
        assert_ne!(c, a);
    }

    #[test]
    fn test_accounting_across_mixed_operations() {
        let mut mgr = manager();
        let mut root = BlockRoot::new();

        let a = mgr.malloc(&mut root, 3 * P).unwrap();
        check(&mgr, &root);
        let b = mgr.malloc_linear(&mut root, None, 4 * P, false).unwrap();
        check(&mgr, &root);
        mgr.set_page_attributes(&mut root, b, P, &attrs(&[0x09, 0x09]))
            .unwrap();
        check(&mgr, &root);
        mgr.realloc(&mut root, a, 5 * P).unwrap();
        check(&mgr, &root);
        mgr.set_page_attributes(&mut root, a, 0, &attrs(&[0x00, 0x00]))
            .unwrap();
        check(&mgr, &root);
        mgr.realloc_linear(&mut root, b, 2 * P, true).unwrap();
        check(&mgr, &root);
        mgr.map_conventional(&mut root, a, 4 * P, 0, 1).unwrap();
        check(&mgr, &root);
        mgr.realloc(&mut root, a, 2 * P).unwrap();
        check(&mgr, &root);
        mgr.free(&mut root, b).unwrap();
        check(&mgr, &root);
        mgr.free(&mut root, a).unwrap();
        check(&mgr, &root);
        assert_eq!(mgr.allocated(), 0);
    }
}
