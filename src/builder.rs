//! Builder for the memory sizing record.

use crate::mapping::MappingDriver;
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::memory::layout::LINEAR_BASE;
use crate::memory::is_page_aligned;

/// Builder for creating a [`MemoryConfig`].
///
/// # Example
///
/// ```rust
/// use dpmi_mem::MemoryConfig;
///
/// let config = MemoryConfig::builder()
///     .dpmi_kb(8192)
///     .dpmi_base(0x0100_0000)
///     .xms_kb(4096)
///     .build()?;
/// assert_eq!(config.dpmi_total(), 8 * 1024 * 1024);
/// # Ok::<(), dpmi_mem::Error>(())
/// ```
#[derive(Default)]
pub struct MemoryConfigBuilder {
    dpmi_kb: Option<usize>,
    dpmi_base: Option<u32>,
    ems_kb: Option<usize>,
    xms_kb: Option<usize>,
    ext_mem_kb: Option<usize>,
    vga_kb: Option<usize>,
    no_null_checks: bool,
    shm_prefix: Option<String>,
    mapping_driver: Option<MappingDriver>,
}

impl MemoryConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the protected-mode memory budget in KB.
    ///
    /// Default: 16384 KB
    pub fn dpmi_kb(mut self, kb: usize) -> Self {
        self.dpmi_kb = Some(kb);
        self
    }

    /// Set the guest address of the general DPMI pool. Everything between the
    /// HMA and this address becomes the linear window.
    ///
    /// Default: 0x02000000
    pub fn dpmi_base(mut self, base: u32) -> Self {
        self.dpmi_base = Some(base);
        self
    }

    /// Set the expanded memory size in KB.
    pub fn ems_kb(mut self, kb: usize) -> Self {
        self.ems_kb = Some(kb);
        self
    }

    /// Set the XMS size in KB.
    pub fn xms_kb(mut self, kb: usize) -> Self {
        self.xms_kb = Some(kb);
        self
    }

    /// Set the extended memory size in KB.
    pub fn ext_mem_kb(mut self, kb: usize) -> Self {
        self.ext_mem_kb = Some(kb);
        self
    }

    /// Set the emulated video memory size in KB.
    pub fn vga_kb(mut self, kb: usize) -> Self {
        self.vga_kb = Some(kb);
        self
    }

    /// Enable the null-page compatibility check for attribute changes.
    pub fn no_null_checks(mut self, enabled: bool) -> Self {
        self.no_null_checks = enabled;
        self
    }

    /// Set the prefix used for host shared-memory object names.
    pub fn shm_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shm_prefix = Some(prefix.into());
        self
    }

    /// Force a specific mapping strategy.
    pub fn mapping_driver(mut self, driver: MappingDriver) -> Self {
        self.mapping_driver = Some(driver);
        self
    }

    /// Build the config.
    ///
    /// Fails if the DPMI budget is zero or the pool base does not leave a
    /// page-aligned linear window above the HMA.
    pub fn build(self) -> Result<MemoryConfig> {
        let defaults = MemoryConfig::default();

        let dpmi_kb = self.dpmi_kb.unwrap_or(defaults.dpmi_kb);
        if dpmi_kb == 0 {
            return Err(Error::InvalidConfig("dpmi memory must be > 0".to_string()));
        }

        let dpmi_base = self.dpmi_base.unwrap_or(defaults.dpmi_base);
        if !is_page_aligned(dpmi_base as usize) {
            return Err(Error::InvalidConfig(format!(
                "dpmi base 0x{dpmi_base:x} is not page aligned"
            )));
        }
        if (dpmi_base as usize) <= LINEAR_BASE {
            return Err(Error::InvalidConfig(format!(
                "dpmi base 0x{dpmi_base:x} overlaps conventional memory"
            )));
        }

        let shm_prefix = self.shm_prefix.unwrap_or(defaults.shm_prefix);
        if shm_prefix.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "shm prefix {shm_prefix:?} must not contain '/'"
            )));
        }

        let config = MemoryConfig {
            dpmi_kb,
            dpmi_base,
            ems_kb: self.ems_kb.unwrap_or(defaults.ems_kb),
            xms_kb: self.xms_kb.unwrap_or(defaults.xms_kb),
            ext_mem_kb: self.ext_mem_kb.unwrap_or(defaults.ext_mem_kb),
            vga_kb: self.vga_kb.unwrap_or(defaults.vga_kb),
            no_null_checks: self.no_null_checks,
            shm_prefix,
            mapping_driver: self.mapping_driver,
        };

        if u32::try_from(config.guest_span()).is_err() {
            return Err(Error::InvalidConfig(
                "dpmi pool does not fit the 32-bit guest address space".to_string(),
            ));
        }

        Ok(config)
    }
}
