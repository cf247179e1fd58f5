//! Per-client block collections.

use std::collections::{BTreeMap, HashMap};

use super::block::{Block, Handle};

/// All blocks of one DPMI client.
///
/// Blocks are created and destroyed only through a
/// [`BlockManager`](super::BlockManager); the root answers lookups.
#[derive(Debug, Default)]
pub struct BlockRoot {
    blocks: HashMap<Handle, Block>,
    /// Base address of every mapped block.
    by_base: BTreeMap<u32, Handle>,
}

impl BlockRoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn lookup(&self, handle: Handle) -> Option<&Block> {
        self.blocks.get(&handle)
    }

    /// The mapped block containing `addr`.
    pub fn lookup_by_addr(&self, addr: u32) -> Option<&Block> {
        let (_, handle) = self.by_base.range(..=addr).next_back()?;
        self.blocks.get(handle).filter(|b| b.contains(addr))
    }

    /// The shared block attached under `name`.
    pub fn lookup_by_shmname(&self, name: &str) -> Option<&Block> {
        self.blocks.values().find(|b| b.shm_name() == Some(name))
    }

    /// Number of shared blocks attached under `name`.
    pub fn count_shm_blocks(&self, name: &str) -> usize {
        self.blocks.values().filter(|b| b.shm_name() == Some(name)).count()
    }

    /// Handles of all blocks, oldest first.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<_> = self.blocks.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub(super) fn insert(&mut self, block: Block) {
        if block.mapped {
            let prev = self.by_base.insert(block.base, block.handle);
            debug_assert!(prev.is_none(), "mapped blocks overlap at {:#x}", block.base);
        }
        let prev = self.blocks.insert(block.handle, block);
        debug_assert!(prev.is_none(), "duplicate block handle");
    }

    pub(super) fn get_mut(&mut self, handle: Handle) -> Option<&mut Block> {
        self.blocks.get_mut(&handle)
    }

    pub(super) fn remove(&mut self, handle: Handle) -> Option<Block> {
        let block = self.blocks.remove(&handle)?;
        if block.mapped {
            self.by_base.remove(&block.base);
        }
        Some(block)
    }

    /// Move a block to `base` after its pool relocated it.
    pub(super) fn rebase(&mut self, handle: Handle, base: u32) {
        let Some(block) = self.blocks.get_mut(&handle) else {
            return;
        };
        if block.mapped {
            self.by_base.remove(&block.base);
            self.by_base.insert(base, handle);
        }
        block.base = base;
    }

    /// Mark a shared block as no longer present in the address space.
    pub(super) fn detach(&mut self, handle: Handle) {
        if let Some(block) = self.blocks.get_mut(&handle) {
            if block.mapped {
                self.by_base.remove(&block.base);
                block.mapped = false;
            }
        }
    }
}
