//! Anonymous memory file descriptors (`memfd_create`).

use std::io;
use std::os::fd::OwnedFd;

/// Check if `memfd_create` exists on this host.
pub fn is_available() -> bool {
    cfg!(target_os = "linux")
}

/// Create an anonymous, close-on-exec memory file.
#[cfg(target_os = "linux")]
pub fn create_store(prefix: &str) -> io::Result<OwnedFd> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let name = CString::new(format!("{prefix}{}", std::process::id()))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // Safety: memfd_create returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
pub fn create_store(_prefix: &str) -> io::Result<OwnedFd> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "memfd_create is Linux-only",
    ))
}
