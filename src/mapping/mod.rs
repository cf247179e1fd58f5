//! Memory-mapping backend.
//!
//! This module obtains one host-backed memory region, sized for every
//! virtualized memory subsystem, maps it shared and read-write, and runs a
//! [`Pool`] over it. Pages of that region can then be aliased anywhere in the
//! host address space, so two virtual ranges observe the same memory without
//! copying.
//!
//! Three backing strategies exist, probed in order of preference:
//!
//! - **shm**: an unlinked POSIX shared-memory object
//! - **memfd**: an anonymous memory file descriptor (Linux)
//! - **file**: an unnamed temporary file

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

use bitflags::bitflags;
use log::{debug, error, info, trace, warn};

use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::memory::{checked_page_align, Pool, PoolHooks};

pub mod file;
pub mod memfd;
pub mod shm;

bitflags! {
    /// Subsystems a mapping request is made on behalf of.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capability: u32 {
        const EMS = 1 << 0;
        const DPMI = 1 << 1;
        const VIDEO = 1 << 2;
        const VGAEMU = 1 << 3;
        const HGC = 1 << 4;
        const HMA = 1 << 5;
        const SHARED = 1 << 6;
        const INIT_HWRAM = 1 << 7;
        const INIT_LOWRAM = 1 << 8;
        const LOWMEM = 1 << 9;
        const EXTMEM = 1 << 10;
        const OTHER = 1 << 11;
    }
}

impl Capability {
    /// Every subsystem at once; closing with this releases the backing store.
    pub const ALL: Capability = Capability::all();
}

bitflags! {
    /// Host page protection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: i32 {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

impl Protection {
    /// No access at all.
    pub const NONE: Protection = Protection::empty();
    /// Read and write.
    pub const RW: Protection = Protection::READ.union(Protection::WRITE);
    /// Read, write and execute.
    pub const RWX: Protection = Protection::RW.union(Protection::EXEC);
}

/// A backing-store strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingDriver {
    /// POSIX shared memory object.
    Shm,
    /// `memfd_create` descriptor.
    Memfd,
    /// Temporary file.
    File,
}

impl MappingDriver {
    /// Probe order when no driver is forced.
    pub const PREFERRED: [MappingDriver; 3] =
        [MappingDriver::Shm, MappingDriver::Memfd, MappingDriver::File];

    /// Short driver name.
    pub fn name(self) -> &'static str {
        match self {
            MappingDriver::Shm => "mapshm",
            MappingDriver::Memfd => "mapmshm",
            MappingDriver::File => "mapfile",
        }
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            MappingDriver::Shm => "Posix SHM mapping",
            MappingDriver::Memfd => "memfd mapping",
            MappingDriver::File => "temp file mapping",
        }
    }

    /// Check if the host supports this strategy.
    pub fn is_available(self) -> bool {
        match self {
            MappingDriver::Shm => shm::is_available(),
            MappingDriver::Memfd => memfd::is_available(),
            MappingDriver::File => file::is_available(),
        }
    }

    fn create_store(self, prefix: &str) -> io::Result<OwnedFd> {
        match self {
            MappingDriver::Shm => shm::create_store(prefix),
            MappingDriver::Memfd => memfd::create_store(prefix),
            MappingDriver::File => file::create_store(prefix),
        }
    }
}

impl fmt::Display for MappingDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Check if any mapping strategy is available on this host.
pub fn is_available() -> bool {
    MappingDriver::PREFERRED.iter().any(|d| d.is_available())
}

/// Get the strategy that would be picked on this host.
pub fn name() -> Option<&'static str> {
    MappingDriver::PREFERRED
        .into_iter()
        .find(|d| d.is_available())
        .map(MappingDriver::name)
}

/// Prefault pages for writing. Purely advisory.
pub(crate) fn populate_write(ptr: *mut u8, len: usize) {
    #[cfg(target_os = "linux")]
    {
        let ret = unsafe { libc::madvise(ptr.cast(), len, libc::MADV_POPULATE_WRITE) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            // Kernels before 5.14 do not know the advice.
            if err.raw_os_error() == Some(libc::EINVAL) {
                trace!("MAPPING: populate advice unsupported");
            } else {
                warn!("MAPPING: madvise({ptr:p}, {len:#x}) failed: {err}");
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = (ptr, len);
    }
}

/// Pool hooks of the backing region: commit is a populate advisory, page
/// reclamation is left to the host.
struct Populate;

impl PoolHooks for Populate {
    fn commit(&mut self, addr: usize, len: usize) -> bool {
        populate_write(addr as *mut u8, len);
        true
    }

    fn uncommit(&mut self, _addr: usize, _len: usize) {}

    fn relocate(&mut self, from: usize, to: usize, len: usize) {
        // Safety: both areas lie in the read-write pool mapping and the pool
        // never hands out overlapping areas.
        unsafe { std::ptr::copy_nonoverlapping(from as *const u8, to as *mut u8, len) }
    }
}

/// The mapped backing region and its pool.
struct Region {
    base: NonNull<u8>,
    size: usize,
    pool: Pool,
}

/// The memory-mapping backend.
///
/// Owns the backing-store descriptor and the host mapping of the whole
/// store. Allocations come from a [`Pool`] over that mapping; [`alias`]
/// exposes any part of it at a second address.
///
/// [`alias`]: MappingBackend::alias
pub struct MappingBackend {
    pool_size: usize,
    estimate_kb: usize,
    prefix: String,
    forced: Option<MappingDriver>,
    driver: Option<MappingDriver>,
    fd: Option<OwnedFd>,
    region: Option<Region>,
    exec_mappable: bool,
}

// Safety: the backend owns its mapping; callers serialize access.
unsafe impl Send for MappingBackend {}

impl MappingBackend {
    /// Create a closed backend sized from `config`.
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            pool_size: config.mapping_pool_size(),
            estimate_kb: config.mapping_estimate_kb(),
            prefix: config.shm_prefix.clone(),
            forced: config.mapping_driver,
            driver: None,
            fd: None,
            region: None,
            exec_mappable: false,
        }
    }

    /// Open the backing store, map it and initialize the pool.
    ///
    /// Idempotent while open. An empty `cap` marks a probe: failures come back
    /// as ordinary errors. Otherwise a failure is [`Error::Fatal`].
    pub fn open(&mut self, cap: Capability) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        if !cap.is_empty() {
            debug!("MAPPING: open, cap={cap:?}");
        }

        let drivers: Vec<MappingDriver> = match self.forced {
            Some(driver) => vec![driver],
            None => MappingDriver::PREFERRED
                .into_iter()
                .filter(|d| d.is_available())
                .collect(),
        };

        let mut last_err = None;
        for driver in drivers {
            match driver.create_store(&self.prefix) {
                Ok(fd) => return self.open_store(driver, fd, cap),
                Err(e) => {
                    debug!("MAPPING: {} unavailable: {e}", driver.description());
                    last_err = Some(e);
                }
            }
        }

        let err = last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no mapping driver"));
        Err(Self::failure(cap, "open mapping store", err))
    }

    fn open_store(&mut self, driver: MappingDriver, fd: OwnedFd, cap: Capability) -> Result<()> {
        let size = self.pool_size;

        if unsafe { libc::ftruncate(fd.as_raw_fd(), 0) } == -1 {
            debug!("MAPPING: cannot truncate store: {}", io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } == -1 {
            let err = io::Error::last_os_error();
            error!("MAPPING: cannot size temp file pool, {err}");
            return Err(Self::failure(cap, "size mapping store", err));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            error!("MAPPING: cannot mmap shared memory pool, {err}");
            return Err(Self::failure(cap, "map mapping store", err));
        }

        // The store may live on a noexec mount. Aliases then map without
        // exec and elevate with mprotect.
        let exec_mappable = unsafe {
            libc::mprotect(ptr, size, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
        } == 0;
        if !exec_mappable {
            warn!(
                "MAPPING: {} refuses PROT_EXEC: {}",
                driver.description(),
                io::Error::last_os_error()
            );
        }
        // The pool itself only needs rw.
        if unsafe { libc::mprotect(ptr, size, libc::PROT_READ | libc::PROT_WRITE) } == -1 {
            warn!("MAPPING: cannot drop exec from pool: {}", io::Error::last_os_error());
        }

        let Some(base) = NonNull::new(ptr.cast::<u8>()) else {
            unsafe { libc::munmap(ptr, size) };
            return Err(Error::Mapping("pool mapped at null".to_string()));
        };
        info!(
            "MAPPING: open via {}, mpool (min {}K) is {} Kbytes at {:p}-{:p}",
            driver.name(),
            self.estimate_kb,
            size / 1024,
            base,
            unsafe { base.as_ptr().add(size - 1) }
        );

        self.unmap_region();
        self.region = Some(Region {
            base,
            size,
            pool: Pool::new(base.as_ptr() as usize, size),
        });
        self.fd = Some(fd);
        self.driver = Some(driver);
        self.exec_mappable = exec_mappable;
        Ok(())
    }

    fn failure(cap: Capability, context: &'static str, err: io::Error) -> Error {
        if cap.is_empty() {
            Error::Mapping(format!("{context}: {err}"))
        } else {
            Error::fatal(context, err)
        }
    }

    /// Release the backing descriptor when `cap` is [`Capability::ALL`].
    ///
    /// Existing mappings stay valid; new aliases can no longer be made.
    pub fn close(&mut self, cap: Capability) {
        debug!("MAPPING: close, cap={cap:?}");
        if cap == Capability::ALL && self.fd.take().is_some() {
            debug!("MAPPING: backing store released");
        }
    }

    /// Allocate `size` bytes from the pool.
    pub fn alloc(&mut self, cap: Capability, size: usize) -> Option<NonNull<u8>> {
        trace!("MAPPING: alloc, cap={cap:?}, mapsize={size:#x}");
        let region = self.region.as_mut()?;
        let addr = region.pool.alloc(size, &mut Populate)?;
        NonNull::new(addr as *mut u8)
    }

    /// Return an allocation to the pool. `addr` must be what [`alloc`]
    /// returned.
    ///
    /// [`alloc`]: MappingBackend::alloc
    pub fn free(&mut self, cap: Capability, addr: NonNull<u8>) -> bool {
        trace!("MAPPING: free, cap={cap:?}, addr={addr:p}");
        match self.region.as_mut() {
            Some(region) => region.pool.free(addr.as_ptr() as usize, &mut Populate),
            None => false,
        }
    }

    /// Resize an allocation.
    ///
    /// Only EMS and DPMI may do this. Shrinking never changes the address;
    /// `old_size` must match the recorded allocation.
    pub fn realloc(
        &mut self,
        cap: Capability,
        addr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        trace!(
            "MAPPING: realloc, cap={cap:?}, addr={addr:p}, old={old_size:#x}, new={new_size:#x}"
        );
        if !cap.intersects(Capability::EMS | Capability::DPMI) {
            return None;
        }
        let region = self.region.as_mut()?;
        let size = region.pool.area_size(addr.as_ptr() as usize);
        if size == 0 || checked_page_align(old_size) != Some(size) {
            return None;
        }
        if checked_page_align(new_size) == Some(size) {
            return Some(addr);
        }
        match region.pool.realloc(addr.as_ptr() as usize, new_size, &mut Populate) {
            Some(moved) => NonNull::new(moved as *mut u8),
            None => {
                debug!("MAPPING: pgrealloc({addr:p},{new_size:#x}) failed");
                None
            }
        }
    }

    /// Map the pool pages behind `source` at `target`, or wherever the host
    /// likes when `target` is `None`.
    pub fn alias(
        &self,
        cap: Capability,
        target: Option<NonNull<u8>>,
        size: usize,
        prot: Protection,
        source: *const u8,
    ) -> Result<NonNull<u8>> {
        let (fd, region) = match (&self.fd, &self.region) {
            (Some(fd), Some(region)) => (fd, region),
            _ => return Err(Error::Io(io::Error::from_raw_os_error(libc::EINVAL))),
        };

        let base = region.base.as_ptr() as usize;
        let offs = (source as usize).wrapping_sub(base);
        if (source as usize) < base || offs + size > region.size {
            debug!("MAPPING: alias_map to address outside of temp file");
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EINVAL)));
        }

        let (hint, flags) = match target {
            Some(t) => (t.as_ptr().cast::<libc::c_void>(), libc::MAP_SHARED | libc::MAP_FIXED),
            None => (std::ptr::null_mut(), libc::MAP_SHARED),
        };
        let map = |prot: Protection| unsafe {
            libc::mmap(hint, size, prot.bits(), flags, fd.as_raw_fd(), offs as libc::off_t)
        };

        let mut addr = libc::MAP_FAILED;
        if self.exec_mappable || !prot.contains(Protection::EXEC) {
            addr = map(prot);
        }
        if addr == libc::MAP_FAILED && prot.contains(Protection::EXEC) {
            addr = map(prot - Protection::EXEC);
            if addr != libc::MAP_FAILED
                && unsafe { libc::mprotect(addr, size, prot.bits()) } == -1
            {
                let err = io::Error::last_os_error();
                error!("MAPPING: shared memory mprotect failed: {err}");
                return Err(Error::fatal("alias mprotect", err));
            }
        }
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            warn!("MAPPING: alias mmap failed: {err}");
            return Err(Error::Io(err));
        }

        debug!("MAPPING: alias {cap:?}, offs {offs:#x} to {hint:p}, size {size:#x}: {addr:p}");
        NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| Error::Mapping("alias mapped at null".to_string()))
    }

    /// Whether the backing store is open.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// The strategy in use, once opened.
    pub fn driver(&self) -> Option<MappingDriver> {
        self.driver
    }

    /// Whether the store accepts executable mappings directly.
    pub fn exec_mappable(&self) -> bool {
        self.exec_mappable
    }

    /// Size of the mapped pool in bytes.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Unpadded size estimate in KB.
    pub fn estimated_kb(&self) -> usize {
        self.estimate_kb
    }

    /// Host address of the pool mapping.
    pub fn pool_base(&self) -> Option<NonNull<u8>> {
        self.region.as_ref().map(|r| r.base)
    }

    /// Free bytes left in the pool.
    pub fn free_space(&self) -> usize {
        self.region.as_ref().map_or(0, |r| r.pool.free_space())
    }

    fn unmap_region(&mut self) {
        if let Some(region) = self.region.take() {
            let leaked = region.pool.destroy();
            if leaked != 0 {
                error!("MAPPING: leaked {leaked} bytes (mapping pool)");
            }
            unsafe { libc::munmap(region.base.as_ptr().cast(), region.size) };
        }
    }
}

impl Drop for MappingBackend {
    fn drop(&mut self) {
        self.unmap_region();
    }
}

impl fmt::Debug for MappingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingBackend")
            .field("driver", &self.driver)
            .field("pool_size", &self.pool_size)
            .field("open", &self.fd.is_some())
            .field("exec_mappable", &self.exec_mappable)
            .finish()
    }
}
