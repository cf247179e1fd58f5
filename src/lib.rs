//! # dpmi-mem
//!
//! Protected-mode (DPMI) memory management for a DOS virtualizer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dpmi_mem::{BlockManager, BlockRoot, MappedSpace, MemoryConfig, PageAttr, Result};
//!
//! fn main() -> Result<()> {
//!     let config = MemoryConfig::builder()
//!         .dpmi_kb(4096)
//!         .build()?;
//!
//!     let space = MappedSpace::new(&config)?;
//!     let mut dpmi = BlockManager::new(&config, space);
//!     let mut root = BlockRoot::new();
//!
//!     let handle = dpmi.malloc(&mut root, 3 * 4096)?;
//!     // Decommit the middle page.
//!     dpmi.set_page_attributes(&mut root, handle, 4096, &[PageAttr::from_bits(0)])?;
//!
//!     dpmi.free_all(&mut root)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! - [`mapping`]: the host backing store (POSIX shm, memfd or a temp file)
//!   and aliasing of its pages.
//! - [`space`]: the guest address space the block manager works on.
//! - [`dpmi`]: blocks, page attributes and budget accounting.

mod builder;
mod config;
pub mod debug;
mod error;

pub mod dpmi;
pub mod mapping;
pub mod memory;
pub mod space;

// Re-exports
pub use builder::MemoryConfigBuilder;
pub use config::MemoryConfig;
pub use dpmi::{Block, BlockKind, BlockManager, BlockRoot, Handle, PageAttr, ShmFlags};
pub use error::{Error, Result};
pub use mapping::{Capability, MappingBackend, MappingDriver, Protection};
pub use space::{AddressSpace, Cpu, MappedSpace, NullCpu};

/// Check if the current platform has a usable mapping strategy.
pub fn is_supported() -> bool {
    mapping::is_available()
}

/// Get the name of the preferred mapping strategy for the current platform.
///
/// Returns `None` if no strategy is available.
pub fn backend_name() -> Option<&'static str> {
    mapping::name()
}
