//! Error types for dpmi-mem.

use thiserror::Error;

use crate::dpmi::Handle;

/// Result type alias using dpmi-mem's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing protected-mode memory.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("invalid memory configuration: {0}")]
    InvalidConfig(String),

    // Resource exhaustion
    #[error("memory limit reached: requested {requested:#x} bytes, {available:#x} available")]
    BudgetExceeded { requested: usize, available: usize },

    #[error("pool exhausted: no room for {size:#x} bytes")]
    OutOfSpace { size: usize },

    #[error("mapping error: {0}")]
    Mapping(String),

    // Invalid handle / address
    #[error("invalid block handle: {0}")]
    InvalidHandle(Handle),

    #[error("invalid address: 0x{0:x}")]
    InvalidAddress(u32),

    #[error("invalid size: {0:#x}")]
    InvalidSize(usize),

    #[error("range 0x{base:x}+{size:#x} is outside the linear window")]
    OutOfRange { base: u32, size: usize },

    // Policy violations
    #[error("block {handle} must be released as {expected}")]
    WrongKind { handle: Handle, expected: &'static str },

    #[error("block {0} is not resizable through this path")]
    NotResizable(Handle),

    #[error("cannot change commit type of shared page {page}")]
    SharedPage { page: usize },

    #[error("cannot change {what} on uncommitted page {page}")]
    Uncommitted { page: usize, what: &'static str },

    #[error("shared memory object {0} already exists")]
    AlreadyExists(String),

    #[error("feature not supported: {0}")]
    NotSupported(String),

    // Host primitive failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal host failure in {context}: {source}")]
    Fatal {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap a host failure that leaves accounting or address-space state
    /// inconsistent.
    pub fn fatal(context: &'static str, source: std::io::Error) -> Self {
        Error::Fatal { context, source }
    }

    /// Whether the embedding layer should treat this error as terminal for the
    /// whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }

    /// Whether the failure was caused by running out of memory rather than by
    /// a bad request.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Error::BudgetExceeded { .. } | Error::OutOfSpace { .. } | Error::Mapping(_)
        )
    }
}
