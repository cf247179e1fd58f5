//! POSIX shared memory objects.
//!
//! Used both as a pool backing store (created and immediately unlinked) and
//! for named shared blocks that DPMI clients attach to by name.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

static STORE_SEQ: AtomicU32 = AtomicU32::new(0);

/// Check if POSIX shared memory is usable on this host.
pub fn is_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/dev/shm").is_dir()
    }

    #[cfg(not(target_os = "linux"))]
    {
        cfg!(unix)
    }
}

/// Create an anonymous backing store: a fresh object that is unlinked right
/// away, so only the returned descriptor keeps it alive.
pub fn create_store(prefix: &str) -> io::Result<OwnedFd> {
    let name = format!(
        "/{prefix}pool_{}_{}",
        std::process::id(),
        STORE_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let fd = open(&name, libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC)?;
    if let Err(e) = unlink(&name) {
        log::warn!("MAPPING: cannot unlink {name}: {e}");
    }
    Ok(fd)
}

/// `shm_open` with owner read/write permissions.
pub fn open(name: &str, oflag: libc::c_int) -> io::Result<OwnedFd> {
    let cname = to_cstring(name)?;
    let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t;
    let fd = unsafe { libc::shm_open(cname.as_ptr(), oflag, mode) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // Safety: shm_open returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Remove a named object. Existing mappings stay valid.
pub fn unlink(name: &str) -> io::Result<()> {
    let cname = to_cstring(name)?;
    if unsafe { libc::shm_unlink(cname.as_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_cstring(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
