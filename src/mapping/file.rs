//! Temporary file backing store.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicU32, Ordering};

static FILE_SEQ: AtomicU32 = AtomicU32::new(0);

/// A temp file always works as a last resort.
pub fn is_available() -> bool {
    true
}

/// Create an unnamed temporary file in the system temp directory.
///
/// Uses `O_TMPFILE` where the kernel and filesystem support it, and falls back
/// to creating then unlinking a uniquely named file.
pub fn create_store(prefix: &str) -> io::Result<OwnedFd> {
    let dir = std::env::temp_dir();

    #[cfg(target_os = "linux")]
    {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .mode(0o600)
            .custom_flags(libc::O_TMPFILE | libc::O_CLOEXEC)
            .open(&dir)
        {
            Ok(file) => return Ok(OwnedFd::from(file)),
            Err(e) => log::debug!("MAPPING: O_TMPFILE in {} failed: {e}", dir.display()),
        }
    }

    let path = dir.join(format!(
        "{prefix}{}_{}",
        std::process::id(),
        FILE_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let file: File = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    std::fs::remove_file(&path)?;
    Ok(OwnedFd::from(file))
}
