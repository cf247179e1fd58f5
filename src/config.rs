//! Sizing record consumed from the emulator's configuration.

use crate::mapping::MappingDriver;
use crate::memory::layout::{
    DPMI_MAX_CLIENTS, DPMI_PM_STACK_SIZE, DPMI_RESERVED_SPACE, DPMI_SEL_CODE_SIZE, HMA_SIZE,
    LDT_ENTRIES, LDT_ENTRY_SIZE, LINEAR_BASE, LOWMEM_SIZE,
};
use crate::memory::{page_align, PAGE_SIZE};

/// Minimum fragmentation pad added to the mapping pool, in KB.
const MAPPING_PAD_KB: usize = 4 * 1024;

/// Memory sizes of every virtualized subsystem sharing the mapping pool.
///
/// Build one with [`MemoryConfig::builder()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Protected-mode memory offered to DPMI clients, in KB.
    pub dpmi_kb: usize,
    /// Guest address where the general DPMI pool starts.
    pub dpmi_base: u32,
    /// Expanded memory, in KB.
    pub ems_kb: usize,
    /// XMS memory, in KB.
    pub xms_kb: usize,
    /// Extended memory, in KB.
    pub ext_mem_kb: usize,
    /// Emulated video memory, in KB.
    pub vga_kb: usize,
    /// Compatibility switch: refuse single-page attribute changes at offset 0
    /// of non-linear blocks.
    pub no_null_checks: bool,
    /// Prefix of host shared-memory object names.
    pub shm_prefix: String,
    /// Force a mapping strategy instead of probing.
    pub mapping_driver: Option<MappingDriver>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dpmi_kb: 16 * 1024,
            dpmi_base: 0x0200_0000,
            ems_kb: 0,
            xms_kb: 8 * 1024,
            ext_mem_kb: 0,
            vga_kb: 1024,
            no_null_checks: false,
            shm_prefix: "dpmi_".to_string(),
            mapping_driver: None,
        }
    }
}

impl MemoryConfig {
    /// Create a new config builder.
    pub fn builder() -> crate::builder::MemoryConfigBuilder {
        crate::builder::MemoryConfigBuilder::new()
    }

    /// Minimum size of the mapping pool before padding, in KB.
    pub fn mapping_estimate_kb(&self) -> usize {
        self.vga_kb + self.ems_kb + self.xms_kb + self.ext_mem_kb + ((LOWMEM_SIZE + HMA_SIZE) >> 10)
    }

    /// Size of the mapping pool in bytes, padded against heap fragmentation.
    pub fn mapping_pool_size(&self) -> usize {
        let estimate = self.mapping_estimate_kb();
        let padded = estimate + (estimate / 4).max(MAPPING_PAD_KB);
        // 4K pages
        (padded / 4) * PAGE_SIZE
    }

    /// Total protected-mode memory budget in bytes.
    pub fn dpmi_total(&self) -> usize {
        self.dpmi_kb * 1024
    }

    /// Size of the general DPMI pool: the client budget plus host structures
    /// and the reserved headroom.
    pub fn dpmi_mem_size(&self) -> usize {
        if self.dpmi_kb == 0 {
            return 0;
        }
        page_align(self.dpmi_total())
            + page_align(DPMI_PM_STACK_SIZE * DPMI_MAX_CLIENTS)
            + page_align(LDT_ENTRIES * LDT_ENTRY_SIZE)
            + page_align(DPMI_SEL_CODE_SIZE)
            + DPMI_RESERVED_SPACE
            + 5 * PAGE_SIZE
    }

    /// Size of the linear window between the HMA and the DPMI pool.
    pub fn lin_mem_rsv(&self) -> usize {
        if self.dpmi_kb == 0 {
            return 0;
        }
        page_align((self.dpmi_base as usize).saturating_sub(LINEAR_BASE))
    }

    /// Guest address space that must be reserved on the host.
    pub fn guest_span(&self) -> usize {
        self.dpmi_base as usize + self.dpmi_mem_size()
    }
}
