//! Block descriptors.

use std::fmt;

use super::attr::{CommitType, PageAttr};
use crate::memory::{pages, PAGE_SIZE};

/// Identifier of a block, unique for the lifetime of a
/// [`BlockManager`](super::BlockManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a block came to be, which decides how it may be resized and freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Ordinary allocation from the general pool. Relocatable.
    General,
    /// Allocation in the linear window, at a fixed or top-down address.
    Linear,
    /// Window onto physical memory provided by the CPU backend.
    HardwareRam,
    /// Host shared-memory object mapped into the general pool.
    Shared,
}

/// Names of a shared block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNames {
    /// Name as given by the client.
    pub name: String,
    /// Host object name (`/<prefix><name>`).
    pub resolved: String,
}

/// Per-block page locking state. Reserved; no operation reads or writes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockState {
    pub shlock: u32,
    pub shm_lock: u32,
    pub lock_flags: u32,
}

/// One client-visible allocation.
#[derive(Debug, Clone)]
pub struct Block {
    pub(super) handle: Handle,
    pub(super) kind: BlockKind,
    pub(super) base: u32,
    pub(super) size: usize,
    pub(super) attrs: Vec<PageAttr>,
    pub(super) mapped: bool,
    pub(super) names: Option<ShmNames>,
    pub(super) lock: LockState,
}

impl Block {
    pub(super) fn new(
        handle: Handle,
        kind: BlockKind,
        base: u32,
        size: usize,
        attr: PageAttr,
    ) -> Self {
        Self {
            handle,
            kind,
            base,
            size,
            attrs: vec![attr; pages(size)],
            mapped: true,
            names: None,
            lock: LockState::default(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Guest address of the first byte.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Size in bytes, a multiple of the page size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last guest address.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    pub fn pages(&self) -> usize {
        self.attrs.len()
    }

    /// Attribute words, one per page.
    pub fn attrs(&self) -> &[PageAttr] {
        &self.attrs
    }

    /// Whether the block lives outside the general relocatable heap. True
    /// for linear, hardware and shared blocks.
    pub fn is_linear(&self) -> bool {
        self.kind != BlockKind::General
    }

    pub fn is_hwram(&self) -> bool {
        self.kind == BlockKind::HardwareRam
    }

    pub fn is_shm(&self) -> bool {
        self.kind == BlockKind::Shared
    }

    /// False once a shared block has been detached from the address space.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn shm_name(&self) -> Option<&str> {
        self.names.as_ref().map(|n| n.name.as_str())
    }

    pub fn resolved_shm_name(&self) -> Option<&str> {
        self.names.as_ref().map(|n| n.resolved.as_str())
    }

    pub fn lock_state(&self) -> LockState {
        self.lock
    }

    /// Whether `addr` falls inside the block.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr as u64) < self.end()
    }

    /// Guest address of page `index`.
    pub(super) fn page_addr(&self, index: usize) -> u32 {
        self.base + (index * PAGE_SIZE) as u32
    }

    /// Pages counted against the memory budget: committed and not shared.
    /// Hardware windows are never counted.
    pub fn accounted_pages(&self) -> usize {
        if self.is_hwram() {
            return 0;
        }
        self.attrs.iter().filter(|a| is_accounted(**a)).count()
    }
}

/// Whether a page holds accounted private memory.
pub(super) fn is_accounted(attr: PageAttr) -> bool {
    attr.commit() == CommitType::Committed && !attr.shared()
}
