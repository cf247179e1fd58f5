//! Page-granular pool allocator.
//!
//! A [`Pool`] hands out page-aligned areas of a fixed address range. It never
//! touches the memory itself: every time it starts or stops backing pages it
//! calls into a [`PoolHooks`] implementation, which decides what that means on
//! the host (protection changes, populate advisories, copying on relocation).
//!
//! Shrinking an area never moves it. Some DOS extenders rely on that.

use std::collections::BTreeMap;

use super::{checked_page_align, page_align};

/// Callbacks a [`Pool`] invokes whenever it (de)commits pages.
pub trait PoolHooks {
    /// Pages `[addr, addr + len)` are about to back an allocation. Returning
    /// `false` aborts the allocation.
    fn commit(&mut self, addr: usize, len: usize) -> bool;

    /// Pages `[addr, addr + len)` no longer back an allocation.
    fn uncommit(&mut self, addr: usize, len: usize);

    /// An area moved during reallocation; `len` bytes must be copied.
    fn relocate(&mut self, from: usize, to: usize, len: usize);
}

/// Hooks that accept every commit and do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl PoolHooks for NoHooks {
    fn commit(&mut self, _addr: usize, _len: usize) -> bool {
        true
    }

    fn uncommit(&mut self, _addr: usize, _len: usize) {}

    fn relocate(&mut self, _from: usize, _to: usize, _len: usize) {}
}

/// First-fit allocator over `[base, base + size)`.
#[derive(Debug)]
pub struct Pool {
    base: usize,
    size: usize,
    /// Allocated areas, start -> length.
    areas: BTreeMap<usize, usize>,
    used: usize,
}

impl Pool {
    /// Create a pool covering `size` bytes starting at `base`.
    pub fn new(base: usize, size: usize) -> Self {
        debug_assert_eq!(page_align(base), base, "pool base must be page aligned");
        Self {
            base,
            size,
            areas: BTreeMap::new(),
            used: 0,
        }
    }

    /// First address of the pool.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the pool in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last address of the pool.
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Check if an address falls within this pool.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Bytes not covered by any allocation.
    pub fn free_space(&self) -> usize {
        self.size - self.used
    }

    /// Size of the area starting at `addr`, or 0 if none starts there.
    pub fn area_size(&self, addr: usize) -> usize {
        self.areas.get(&addr).copied().unwrap_or(0)
    }

    /// Allocated areas as `(start, len)`, in address order.
    pub fn areas(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.areas.iter().map(|(&start, &len)| (start, len))
    }

    /// Allocate `size` bytes at the lowest address that fits.
    pub fn alloc(&mut self, size: usize, hooks: &mut impl PoolHooks) -> Option<usize> {
        let size = checked_page_align(size)?;
        if size == 0 {
            return None;
        }
        let addr = self.first_fit(size)?;
        self.claim(addr, size, hooks)
    }

    /// Allocate exactly `[addr, addr + size)`. Fails if any byte of the range
    /// is outside the pool or already allocated.
    pub fn alloc_fixed(
        &mut self,
        addr: usize,
        size: usize,
        hooks: &mut impl PoolHooks,
    ) -> Option<usize> {
        let size = checked_page_align(size)?;
        if size == 0 || addr < self.base || addr.checked_add(size)? > self.end() {
            return None;
        }
        if !self.is_free(addr, size) {
            return None;
        }
        self.claim(addr, size, hooks)
    }

    /// Allocate `size` bytes at the highest `align`-aligned address whose end
    /// does not exceed `upper`.
    pub fn alloc_aligned_topdown(
        &mut self,
        upper: usize,
        align: usize,
        size: usize,
        hooks: &mut impl PoolHooks,
    ) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        let size = checked_page_align(size)?;
        if size == 0 {
            return None;
        }
        let upper = upper.min(self.end());
        let found = self.gaps().into_iter().rev().find_map(|(start, end)| {
            let top = end.min(upper);
            let candidate = top.checked_sub(size)? & !(align - 1);
            (candidate >= start).then_some(candidate)
        })?;
        self.claim(found, size, hooks)
    }

    /// Resize the area at `addr`.
    ///
    /// Shrinking keeps the address. Growing keeps it when the following gap is
    /// large enough; otherwise a new area is allocated, the contents relocated
    /// and the old area released.
    pub fn realloc(
        &mut self,
        addr: usize,
        new_size: usize,
        hooks: &mut impl PoolHooks,
    ) -> Option<usize> {
        let old_size = self.area_size(addr);
        let new_size = checked_page_align(new_size)?;
        if old_size == 0 || new_size == 0 {
            return None;
        }

        if new_size == old_size {
            return Some(addr);
        }

        if new_size < old_size {
            hooks.uncommit(addr + new_size, old_size - new_size);
            self.areas.insert(addr, new_size);
            self.used -= old_size - new_size;
            return Some(addr);
        }

        let next = self
            .areas
            .range(addr + 1..)
            .next()
            .map(|(&start, _)| start)
            .unwrap_or(self.end());
        if addr.checked_add(new_size).is_some_and(|end| end <= next) {
            if !hooks.commit(addr + old_size, new_size - old_size) {
                return None;
            }
            self.areas.insert(addr, new_size);
            self.used += new_size - old_size;
            return Some(addr);
        }

        let new_addr = self.first_fit(new_size)?;
        self.claim(new_addr, new_size, hooks)?;
        hooks.relocate(addr, new_addr, old_size);
        self.free(addr, hooks);
        Some(new_addr)
    }

    /// Release the area starting at `addr`. Returns `false` if no area starts
    /// there.
    pub fn free(&mut self, addr: usize, hooks: &mut impl PoolHooks) -> bool {
        match self.areas.remove(&addr) {
            Some(len) => {
                self.used -= len;
                hooks.uncommit(addr, len);
                true
            }
            None => false,
        }
    }

    /// Tear the pool down, returning the number of bytes still allocated.
    pub fn destroy(self) -> usize {
        self.used
    }

    fn claim(&mut self, addr: usize, size: usize, hooks: &mut impl PoolHooks) -> Option<usize> {
        if !hooks.commit(addr, size) {
            return None;
        }
        self.areas.insert(addr, size);
        self.used += size;
        Some(addr)
    }

    fn is_free(&self, addr: usize, size: usize) -> bool {
        match self.areas.range(..addr + size).next_back() {
            Some((&start, &len)) => start + len <= addr,
            None => true,
        }
    }

    fn first_fit(&self, size: usize) -> Option<usize> {
        self.gaps()
            .into_iter()
            .find(|&(start, end)| end - start >= size)
            .map(|(start, _)| start)
    }

    /// Unallocated ranges as `(start, end)`, in address order.
    fn gaps(&self) -> Vec<(usize, usize)> {
        let mut gaps = Vec::new();
        let mut cursor = self.base;
        for (&start, &len) in &self.areas {
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = start + len;
        }
        if self.end() > cursor {
            gaps.push((cursor, self.end()));
        }
        gaps
    }
}
