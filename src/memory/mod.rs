//! Guest address space layout and the page pool shared by every allocator.
//!
//! Addresses handed around by this crate are guest flat addresses (the DOS
//! client's linear view) unless a function says it deals in host pointers.

mod pool;

pub use pool::{NoHooks, Pool, PoolHooks};

/// Host page size assumed by the page attribute machinery.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Standard memory layout of the DOS guest.
pub mod layout {
    /// Conventional memory plus the upper memory area (0 - 1MB).
    pub const LOWMEM_SIZE: usize = 0x10_0000;

    /// High memory area directly above 1MB.
    pub const HMA_SIZE: usize = 0x1_0000;

    /// First guest address of the linear allocation window.
    pub const LINEAR_BASE: usize = LOWMEM_SIZE + HMA_SIZE;

    /// Headroom the DPMI budget may dip into (4MB).
    pub const DPMI_RESERVED_SPACE: usize = 4 * 1024 * 1024;

    /// Protected-mode stack size of one DPMI client.
    pub const DPMI_PM_STACK_SIZE: usize = 0x1000;

    /// Maximum number of concurrent DPMI clients.
    pub const DPMI_MAX_CLIENTS: usize = 32;

    /// Local descriptor table entries and their size.
    pub const LDT_ENTRIES: usize = 8192;
    pub const LDT_ENTRY_SIZE: usize = 8;

    /// Size of the host-provided selector code stubs.
    pub const DPMI_SEL_CODE_SIZE: usize = 0x1000;
}

/// Round `size` up to a whole number of pages.
#[inline]
pub const fn page_align(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round `size` up to a whole number of pages, or `None` if that does not
/// fit in a `usize`.
#[inline]
pub const fn checked_page_align(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(end) => Some(end & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Whether `addr` sits on a page boundary.
#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// Number of pages covered by `size` bytes (which must already be aligned).
#[inline]
pub const fn pages(size: usize) -> usize {
    size >> PAGE_SHIFT
}
