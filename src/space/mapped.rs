//! Host-backed guest address space.

use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

use log::{debug, warn};

use super::{AddressSpace, SharedObject};
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::mapping::{self, shm, Capability, MappingBackend, Protection};
use crate::memory::layout::{HMA_SIZE, LOWMEM_SIZE};

/// An anonymous reservation of host address space, unmapped on drop.
struct Reservation {
    ptr: NonNull<u8>,
    len: usize,
}

impl Reservation {
    fn new(len: usize) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Mapping(format!(
                "cannot reserve {len:#x} bytes of guest space: {}",
                io::Error::last_os_error()
            )));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Mapping("guest space reserved at null".to_string()))?;
        Ok(Self { ptr, len })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

/// The guest flat address space, reserved in host memory.
///
/// Conventional memory and the HMA live in the mapping backend's pool and are
/// aliased at guest address 0, so [`AddressSpace::alias_lowmem`] can show the
/// same pages a second time anywhere else. Everything above starts out as
/// inaccessible anonymous memory that the pools commit on demand.
pub struct MappedSpace {
    reservation: Reservation,
    lowmem: NonNull<u8>,
    backend: MappingBackend,
}

// Safety: all pointers refer to mappings owned by this value.
unsafe impl Send for MappedSpace {}

impl MappedSpace {
    /// Open the mapping backend and lay out the guest space for `config`.
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        let mut backend = MappingBackend::new(config);
        backend.open(Capability::DPMI)?;

        let reservation = Reservation::new(config.guest_span())?;

        let low_size = LOWMEM_SIZE + HMA_SIZE;
        let lowmem = backend
            .alloc(Capability::LOWMEM, low_size)
            .ok_or(Error::OutOfSpace { size: low_size })?;
        backend.alias(
            Capability::LOWMEM,
            Some(reservation.ptr),
            low_size,
            Protection::RWX,
            lowmem.as_ptr(),
        )?;

        debug!(
            "DPMI: guest space {:#x} bytes at {:p}, driver {:?}",
            reservation.len,
            reservation.ptr,
            backend.driver()
        );
        Ok(Self {
            reservation,
            lowmem,
            backend,
        })
    }

    /// Host pointer of a guest address.
    pub fn host_addr(&self, addr: u32) -> *mut u8 {
        debug_assert!((addr as usize) < self.reservation.len);
        unsafe { self.reservation.ptr.as_ptr().add(addr as usize) }
    }

    /// Size of the reserved guest space.
    pub fn span(&self) -> usize {
        self.reservation.len
    }

    /// The mapping backend holding conventional memory.
    pub fn backend(&self) -> &MappingBackend {
        &self.backend
    }

    fn host(&self, addr: u32, len: usize) -> Result<NonNull<u8>> {
        if (addr as usize).checked_add(len).map_or(true, |end| end > self.reservation.len) {
            return Err(Error::InvalidAddress(addr));
        }
        NonNull::new(self.host_addr(addr)).ok_or(Error::InvalidAddress(addr))
    }
}

impl Drop for MappedSpace {
    fn drop(&mut self) {
        self.backend.free(Capability::LOWMEM, self.lowmem);
    }
}

impl AddressSpace for MappedSpace {
    fn protect(&mut self, addr: u32, len: usize, prot: Protection) -> Result<()> {
        let ptr = self.host(addr, len)?;
        if unsafe { libc::mprotect(ptr.as_ptr().cast(), len, prot.bits()) } == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn populate(&mut self, addr: u32, len: usize) {
        if let Ok(ptr) = self.host(addr, len) {
            mapping::populate_write(ptr.as_ptr(), len);
        }
    }

    fn restore(&mut self, addr: u32, len: usize) -> Result<()> {
        let ptr = self.host(addr, len)?;
        let low_size = LOWMEM_SIZE + HMA_SIZE;
        if (addr as usize) < low_size {
            let source = unsafe { self.lowmem.as_ptr().add(addr as usize) };
            self.backend
                .alias(Capability::LOWMEM, Some(ptr), len, Protection::RWX, source)?;
            return Ok(());
        }
        let ret = unsafe {
            libc::mmap(
                ptr.as_ptr().cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn alias_lowmem(
        &mut self,
        addr: u32,
        len: usize,
        prot: Protection,
        low_addr: u32,
    ) -> Result<()> {
        if (low_addr as usize) + len > LOWMEM_SIZE + HMA_SIZE {
            return Err(Error::InvalidAddress(low_addr));
        }
        let target = self.host(addr, len)?;
        let source = unsafe { self.lowmem.as_ptr().add(low_addr as usize) };
        self.backend
            .alias(Capability::LOWMEM, Some(target), len, prot, source)?;
        Ok(())
    }

    fn relocate(&mut self, from: u32, to: u32, len: usize) {
        // Safety: the pool only moves between disjoint committed areas.
        unsafe { std::ptr::copy_nonoverlapping(self.host_addr(from), self.host_addr(to), len) }
    }

    fn open_shared(&mut self, name: &str, size: usize, exclusive: bool) -> Result<SharedObject> {
        let mut oflag = libc::O_RDWR | libc::O_CREAT;
        if exclusive {
            oflag |= libc::O_EXCL;
        }
        let fd = shm::open(name, oflag)?;

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let size = if st.st_size > 0 {
            size.min(st.st_size as usize)
        } else {
            if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } == -1 {
                let err = io::Error::last_os_error();
                warn!("DPMI: unable to ftruncate to {size:#x} for shm {name}: {err}");
                return Err(Error::Io(err));
            }
            size
        };

        Ok(SharedObject { fd: Some(fd), size })
    }

    fn map_shared(&mut self, addr: u32, prot: Protection, object: SharedObject) -> Result<()> {
        let target = self.host(addr, object.size)?;
        let fd = object
            .fd
            .ok_or_else(|| Error::Mapping("shared object has no descriptor".to_string()))?;
        let ret = unsafe {
            libc::mmap(
                target.as_ptr().cast(),
                object.size,
                prot.bits(),
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ret != target.as_ptr().cast() {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn unlink_shared(&mut self, name: &str) -> Result<()> {
        shm::unlink(name)?;
        Ok(())
    }
}
