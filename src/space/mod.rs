//! The guest address space as seen by the block manager.
//!
//! [`AddressSpace`] collects the host primitives the block manager needs:
//! protection changes, remapping, shared objects. [`Cpu`] is the emulated
//! CPU's side: it caches translations that must be dropped before any
//! protection change, and it knows where hardware RAM windows live.
//!
//! [`MappedSpace`] is the real implementation on top of the
//! [`MappingBackend`](crate::mapping::MappingBackend).

use std::os::fd::OwnedFd;

use crate::error::Result;
use crate::mapping::Protection;

mod mapped;

#[cfg(test)]
pub(crate) mod fake;

pub use mapped::MappedSpace;

/// A host shared-memory object opened for attachment.
#[derive(Debug)]
pub struct SharedObject {
    /// Descriptor of the object, if the address space needs one to map it.
    pub fd: Option<OwnedFd>,
    /// Usable size in bytes: the object's existing size if it had one,
    /// otherwise the requested size.
    pub size: usize,
}

/// Host primitives over guest flat addresses.
pub trait AddressSpace {
    /// Change the protection of `[addr, addr + len)`.
    fn protect(&mut self, addr: u32, len: usize, prot: Protection) -> Result<()>;

    /// Prefault freshly committed pages. Advisory only.
    fn populate(&mut self, addr: u32, len: usize);

    /// Put back the default backing of `[addr, addr + len)` after it was
    /// aliased or shared. Leaves the range read-write.
    fn restore(&mut self, addr: u32, len: usize) -> Result<()>;

    /// Make conventional memory at `low_addr` appear at `addr`.
    fn alias_lowmem(&mut self, addr: u32, len: usize, prot: Protection, low_addr: u32)
        -> Result<()>;

    /// Copy `len` bytes after a pool moved an area.
    fn relocate(&mut self, from: u32, to: u32, len: usize);

    /// Open (creating if needed) the shared object `name`, sized to `size`
    /// bytes if it is new. With `exclusive`, an existing object is an
    /// [`std::io::ErrorKind::AlreadyExists`] error.
    fn open_shared(&mut self, name: &str, size: usize, exclusive: bool) -> Result<SharedObject>;

    /// Map `object` at `addr`, replacing whatever was there.
    fn map_shared(&mut self, addr: u32, prot: Protection, object: SharedObject) -> Result<()>;

    /// Remove the name of a shared object.
    fn unlink_shared(&mut self, name: &str) -> Result<()>;
}

/// The CPU-emulation collaborator.
pub trait Cpu {
    /// Drop cached translations for `[addr, addr + len)`.
    fn invalidate(&mut self, addr: u32, len: usize);

    /// Guest base address of a window onto physical memory, if the CPU
    /// backend can provide one.
    fn hardware_ram(&mut self, phys: u32, size: usize) -> Option<u32>;
}

/// A CPU with no translation cache and no hardware RAM.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCpu;

impl Cpu for NullCpu {
    fn invalidate(&mut self, _addr: u32, _len: usize) {}

    fn hardware_ram(&mut self, _phys: u32, _size: usize) -> Option<u32> {
        None
    }
}
