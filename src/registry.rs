// SPDX-License-Identifier: MPL-2.0

//! Per-shard bookkeeping: the ordered VMA set and the free-range map.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::ops::Range;

use crate::{
    addr::Vaddr,
    error::Result,
    platform::Platform,
    vma::Vma,
};

/// The VMAs of one shard, ordered by start address and pairwise disjoint.
///
/// Zero-size sentinel VMAs sit at both edges of the allocatable window so
/// boundary searches never fall off the map.
pub(crate) struct VmaSet {
    map: BTreeMap<Vaddr, Vma>,
}

impl VmaSet {
    pub fn new(platform: &Arc<dyn Platform>, lower: Vaddr, upper: Vaddr) -> Self {
        let mut map = BTreeMap::new();
        map.insert(lower, Vma::sentinel(platform.clone(), lower));
        map.insert(upper, Vma::sentinel(platform.clone(), upper));
        VmaSet { map }
    }

    pub fn insert(&mut self, vma: Vma) {
        let start = vma.start();
        let old = self.map.insert(start, vma);
        debug_assert!(old.is_none());
    }

    pub fn remove(&mut self, start: Vaddr) -> Option<Vma> {
        self.map.remove(&start)
    }

    pub fn get(&self, start: Vaddr) -> Option<&Vma> {
        self.map.get(&start)
    }

    pub fn get_mut(&mut self, start: Vaddr) -> Option<&mut Vma> {
        self.map.get_mut(&start)
    }

    /// The live (non-sentinel) VMAs in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.map.values().filter(|v| !v.is_sentinel())
    }

    /// The VMA containing `addr`, found by lower bound plus one
    /// back-step.
    pub fn find_intersecting(&self, addr: Vaddr) -> Option<&Vma> {
        let (_, vma) = self.map.range(..=addr).next_back()?;
        (vma.start() <= addr && addr < vma.end()).then_some(vma)
    }

    /// The start keys of every VMA overlapping `range`, in order.
    pub fn intersecting_keys(&self, range: Range<Vaddr>) -> Vec<Vaddr> {
        if range.end <= range.start {
            return Vec::new();
        }
        let from = match self.map.range(..=range.start).next_back() {
            Some((&k, v)) if v.end() > range.start => k,
            _ => range.start,
        };
        self.map
            .range(from..range.end)
            .filter(|(_, v)| v.end() > range.start && !v.is_sentinel())
            .map(|(&k, _)| k)
            .collect()
    }

    /// Whether every byte of `[start, end)` lies inside some VMA.
    pub fn is_fully_mapped(&self, start: Vaddr, end: Vaddr) -> bool {
        let mut cur = start;
        for key in self.intersecting_keys(start..end) {
            let vma = &self.map[&key];
            if vma.start() > cur {
                return false;
            }
            cur = vma.end();
            if cur >= end {
                return true;
            }
        }
        false
    }

    /// Splits the VMA containing `edge` so no VMA straddles it. An edge
    /// on a boundary (or in a hole) is a no-op.
    pub fn split_at(&mut self, edge: Vaddr) -> Result<()> {
        let Some(key) = self.find_intersecting(edge).map(|v| v.start()) else {
            return Ok(());
        };
        if key == edge {
            return Ok(());
        }
        let vma = self.map.get_mut(&key).unwrap();
        if let Some(tail) = vma.split_tail(edge)? {
            self.insert(tail);
        }
        Ok(())
    }
}

/// The holes of a shard's address window, keyed by base address. Together
/// with the live VMAs this partitions the shard's claimed window.
pub(crate) struct FreeRanges {
    map: BTreeMap<Vaddr, usize>,
}

impl FreeRanges {
    pub fn new() -> Self {
        FreeRanges {
            map: BTreeMap::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Vaddr, usize)> + '_ {
        self.map.iter().map(|(&b, &l)| (b, l))
    }

    /// First-fit reservation in key order. A partial fit is carved from
    /// the tail of the hole so the map key stays put.
    pub fn reserve(&mut self, size: usize) -> Option<Vaddr> {
        let (&base, &len) = self.map.iter().find(|&(_, &len)| len >= size)?;
        if len > size {
            self.map.insert(base, len - size);
            Some(base + len - size)
        } else {
            self.map.remove(&base);
            Some(base)
        }
    }

    /// Removes `[addr, addr + size)`, which must lie entirely within one
    /// free interval.
    pub fn allocate(&mut self, addr: Vaddr, size: usize) {
        let (&base, &len) = self
            .map
            .range(..=addr)
            .next_back()
            .expect("allocating a range that is not free");
        assert!(addr + size <= base + len, "allocating past a free interval");
        if base == addr {
            self.map.remove(&base);
        } else {
            self.map.insert(base, addr - base);
        }
        if addr + size < base + len {
            self.map.insert(addr + size, base + len - (addr + size));
        }
    }

    /// Returns `[addr, addr + size)` to the map, coalescing with the
    /// neighboring intervals when adjacent.
    pub fn free(&mut self, addr: Vaddr, size: usize) {
        let mut base = addr;
        let mut len = size;
        if let Some((&pbase, &plen)) = self.map.range(..addr).next_back() {
            if pbase + plen == addr {
                base = pbase;
                len += plen;
            }
        }
        if let Some(&nlen) = self.map.get(&(addr + size)) {
            self.map.remove(&(addr + size));
            len += nlen;
        }
        self.map.insert(base, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_then_coalesce() {
        let mut fr = FreeRanges::new();
        fr.free(0x1000, 0x1000);
        fr.free(0x3000, 0x1000);
        assert_eq!(fr.iter().collect::<Vec<_>>(), [(0x1000, 0x1000), (0x3000, 0x1000)]);

        // Filling the gap merges all three.
        fr.free(0x2000, 0x1000);
        assert_eq!(fr.iter().collect::<Vec<_>>(), [(0x1000, 0x3000)]);
    }

    #[test]
    fn reserve_takes_the_tail() {
        let mut fr = FreeRanges::new();
        fr.free(0x10000, 0x4000);
        assert_eq!(fr.reserve(0x1000), Some(0x13000));
        assert_eq!(fr.iter().collect::<Vec<_>>(), [(0x10000, 0x3000)]);

        // An exact fit consumes the interval.
        assert_eq!(fr.reserve(0x3000), Some(0x10000));
        assert_eq!(fr.reserve(0x1000), None);
    }

    #[test]
    fn allocate_splits_the_interval() {
        let mut fr = FreeRanges::new();
        fr.free(0x10000, 0x10000);

        // Middle of the interval leaves a hole on both sides.
        fr.allocate(0x14000, 0x2000);
        assert_eq!(fr.iter().collect::<Vec<_>>(), [(0x10000, 0x4000), (0x16000, 0xa000)]);

        // Head and tail of the remaining intervals.
        fr.allocate(0x10000, 0x1000);
        fr.allocate(0x1f000, 0x1000);
        assert_eq!(fr.iter().collect::<Vec<_>>(), [(0x11000, 0x3000), (0x16000, 0x9000)]);
    }

    #[test]
    #[should_panic]
    fn allocate_requires_a_single_interval() {
        let mut fr = FreeRanges::new();
        fr.free(0x1000, 0x1000);
        fr.free(0x3000, 0x1000);
        fr.allocate(0x1000, 0x3000);
    }
}
