//! Recording address space and CPU for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::io;

use super::{AddressSpace, Cpu, SharedObject};
use crate::error::{Error, Result};
use crate::mapping::Protection;
use crate::memory::PAGE_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Protect(u32, usize, Protection),
    Restore(u32, usize),
    Alias(u32, usize, u32),
    Relocate(u32, u32, usize),
    MapShared(u32, usize, Protection),
    Unlink(String),
}

#[derive(Debug, Default)]
pub(crate) struct FakeSpace {
    pub ops: Vec<Op>,
    /// Current protection per page address.
    pub prot: BTreeMap<u32, Protection>,
    /// Shared objects by name, with their size.
    pub objects: HashMap<String, usize>,
    pub fail_protect: bool,
}

impl FakeSpace {
    pub fn page_prot(&self, addr: u32) -> Option<Protection> {
        self.prot.get(&addr).copied()
    }

    fn set_prot(&mut self, addr: u32, len: usize, prot: Protection) {
        for page in (addr..addr + len as u32).step_by(PAGE_SIZE) {
            self.prot.insert(page, prot);
        }
    }
}

impl AddressSpace for FakeSpace {
    fn protect(&mut self, addr: u32, len: usize, prot: Protection) -> Result<()> {
        if self.fail_protect {
            return Err(Error::Io(io::Error::from_raw_os_error(libc::ENOMEM)));
        }
        self.ops.push(Op::Protect(addr, len, prot));
        self.set_prot(addr, len, prot);
        Ok(())
    }

    fn populate(&mut self, _addr: u32, _len: usize) {}

    fn restore(&mut self, addr: u32, len: usize) -> Result<()> {
        self.ops.push(Op::Restore(addr, len));
        self.set_prot(addr, len, Protection::RW);
        Ok(())
    }

    fn alias_lowmem(
        &mut self,
        addr: u32,
        len: usize,
        prot: Protection,
        low_addr: u32,
    ) -> Result<()> {
        self.ops.push(Op::Alias(addr, len, low_addr));
        self.set_prot(addr, len, prot);
        Ok(())
    }

    fn relocate(&mut self, from: u32, to: u32, len: usize) {
        self.ops.push(Op::Relocate(from, to, len));
    }

    fn open_shared(&mut self, name: &str, size: usize, exclusive: bool) -> Result<SharedObject> {
        match self.objects.get(name) {
            Some(_) if exclusive => Err(Error::Io(io::Error::from(io::ErrorKind::AlreadyExists))),
            Some(&existing) => Ok(SharedObject {
                fd: None,
                size: size.min(existing),
            }),
            None => {
                self.objects.insert(name.to_string(), size);
                Ok(SharedObject { fd: None, size })
            }
        }
    }

    fn map_shared(&mut self, addr: u32, prot: Protection, object: SharedObject) -> Result<()> {
        self.ops.push(Op::MapShared(addr, object.size, prot));
        self.set_prot(addr, object.size, prot);
        Ok(())
    }

    fn unlink_shared(&mut self, name: &str) -> Result<()> {
        self.ops.push(Op::Unlink(name.to_string()));
        match self.objects.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::Io(io::Error::from(io::ErrorKind::NotFound))),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeCpu {
    pub invalidated: Vec<(u32, usize)>,
    /// Guest base handed out for hardware RAM requests.
    pub hw_base: Option<u32>,
}

impl Cpu for FakeCpu {
    fn invalidate(&mut self, addr: u32, len: usize) {
        self.invalidated.push((addr, len));
    }

    fn hardware_ram(&mut self, _phys: u32, _size: usize) -> Option<u32> {
        self.hw_base
    }
}
