// SPDX-License-Identifier: MPL-2.0

//! Address-space sharding.
//!
//! The window `[SUPERBLOCK_AREA_BASE, MAIN_MEM_AREA_BASE)` is divided into
//! superblocks that CPUs claim exclusively by compare-and-swap, so a CPU
//! allocating virtual space almost never contends with its peers. One
//! extra shard, the last worker, owns everything outside that window.
//!
//! Ownership derivation is a pure function of the address, so lookups are
//! lock-free; only mutation of a shard's VMA set or free-range map takes
//! that shard's lock. The owner of a superblock never changes while a VMA
//! lives inside it.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::ops::Range;
use core::sync::atomic::{AtomicU8, Ordering};

use align_ext::AlignExt;
use spin::RwLock;

use crate::{
    addr::{
        Vaddr, ADDRESS_SPACE_END, LOWER_VMA_LIMIT, MAIN_MEM_AREA_BASE, MAX_CPUS,
        SUPERBLOCK_AREA_BASE, SUPERBLOCK_LEN, SUPERBLOCK_SIZE, UPPER_VMA_LIMIT,
    },
    error::{Errno, Result},
    platform::Platform,
    registry::{FreeRanges, VmaSet},
    return_errno_with_msg,
    vma::Vma,
};

/// The owner byte of an unclaimed superblock.
const FREE: u8 = u8::MAX;

/// One shard: a VMA registry and a free-range map with their locks.
///
/// Lock order: `vmas` before `free_ranges`; `free_ranges` is never held
/// while taking a `vmas` lock.
pub(crate) struct Shard {
    pub vmas: RwLock<VmaSet>,
    pub free_ranges: RwLock<FreeRanges>,
}

/// What a tracked range is, for introspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeKind {
    /// A VMA subject to faulting.
    Mapping,
    /// A registered linear map.
    Linear,
}

pub(crate) struct SuperblockManager {
    platform: Arc<dyn Platform>,
    shards: Vec<Shard>,
    superblocks: Vec<AtomicU8>,
    /// Cross-shard index of every tracked range, for introspection only.
    range_index: RwLock<BTreeMap<Vaddr, (usize, RangeKind)>>,
}

impl SuperblockManager {
    pub fn new(platform: Arc<dyn Platform>, nr_cpus: usize) -> Self {
        assert!(nr_cpus >= 1 && nr_cpus <= MAX_CPUS);
        let mut shards = Vec::with_capacity(nr_cpus + 1);
        for _ in 0..=nr_cpus {
            shards.push(Shard {
                vmas: RwLock::new(VmaSet::new(&platform, LOWER_VMA_LIMIT, UPPER_VMA_LIMIT)),
                free_ranges: RwLock::new(FreeRanges::new()),
            });
        }
        // The shared shard starts out owning everything outside the
        // superblock window; sharded space is handed out as superblocks
        // get claimed.
        {
            let mut fr = shards[nr_cpus].free_ranges.write();
            fr.free(LOWER_VMA_LIMIT, SUPERBLOCK_AREA_BASE - LOWER_VMA_LIMIT);
            fr.free(MAIN_MEM_AREA_BASE, ADDRESS_SPACE_END - MAIN_MEM_AREA_BASE);
        }
        let mut superblocks = Vec::with_capacity(SUPERBLOCK_LEN);
        superblocks.resize_with(SUPERBLOCK_LEN, || AtomicU8::new(FREE));
        SuperblockManager {
            platform,
            shards,
            superblocks,
            range_index: RwLock::new(BTreeMap::new()),
        }
    }

    /// The shard index of the worker serving the non-sharded region.
    pub fn shared_index(&self) -> usize {
        self.shards.len() - 1
    }

    /// The shard the calling CPU allocates from.
    pub fn current_index(&self) -> usize {
        self.platform.current_cpu().min(self.shards.len() - 2)
    }

    pub fn shard(&self, index: usize) -> &Shard {
        &self.shards[index]
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.iter()
    }

    fn superblock_index(addr: Vaddr) -> usize {
        (addr - SUPERBLOCK_AREA_BASE) / SUPERBLOCK_SIZE
    }

    fn superblock_base(index: usize) -> Vaddr {
        SUPERBLOCK_AREA_BASE + index * SUPERBLOCK_SIZE
    }

    /// The shard owning `addr`, or `None` for an unclaimed superblock.
    pub fn owner(&self, addr: Vaddr) -> Option<usize> {
        if !(SUPERBLOCK_AREA_BASE..MAIN_MEM_AREA_BASE).contains(&addr) {
            return Some(self.shared_index());
        }
        match self.superblocks[Self::superblock_index(addr)].load(Ordering::Acquire) {
            FREE => None,
            owner => Some(owner as usize),
        }
    }

    /// The shard owning `addr`, claiming the superblock for the calling
    /// CPU if nobody owns it yet. The freshly claimed superblock's whole
    /// range is registered as free space of that shard.
    pub fn ensure_owner(&self, addr: Vaddr) -> usize {
        loop {
            if let Some(owner) = self.owner(addr) {
                return owner;
            }
            let index = Self::superblock_index(addr);
            let cpu = self.current_index();
            if self.superblocks[index]
                .compare_exchange(FREE, cpu as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.shards[cpu]
                    .free_ranges
                    .write()
                    .free(Self::superblock_base(index), SUPERBLOCK_SIZE);
                return cpu;
            }
        }
    }

    /// Returns claimed superblocks to the free pool; only used to undo a
    /// partial claim.
    fn release_superblocks(&self, start: usize, n: usize) {
        let cpu = self.current_index() as u8;
        for i in start..start + n {
            let _ = self.superblocks[i].compare_exchange(
                cpu,
                FREE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Claims `n` consecutive superblocks for the calling CPU and returns
    /// the index of the first. On a lost claim race, exactly the
    /// successfully claimed prefix is released and the scan restarts.
    pub fn allocate_superblocks(&self, n: usize) -> Result<usize> {
        debug_assert!(n >= 1);
        let cpu = self.current_index() as u8;
        'scan: loop {
            let mut run = 0;
            for i in 0..SUPERBLOCK_LEN {
                if self.superblocks[i].load(Ordering::Acquire) != FREE {
                    run = 0;
                    continue;
                }
                run += 1;
                if run < n {
                    continue;
                }
                let first = i + 1 - n;
                for j in first..=i {
                    if self.superblocks[j]
                        .compare_exchange(FREE, cpu, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        self.release_superblocks(first, j - first);
                        continue 'scan;
                    }
                }
                return Ok(first);
            }
            return_errno_with_msg!(Errno::ENOMEM, "out of virtual address space");
        }
    }

    /// Reserves a hole of `size` bytes in the calling CPU's shard,
    /// claiming fresh superblocks when the free ranges cannot serve the
    /// request.
    pub fn reserve_range(&self, size: usize) -> Result<Vaddr> {
        let cpu = self.current_index();
        let mut free_ranges = self.shards[cpu].free_ranges.write();

        if let Some(addr) = free_ranges.reserve(size) {
            return Ok(addr);
        }

        let n = size.div_ceil(SUPERBLOCK_SIZE);
        let first = self.allocate_superblocks(n)?;
        let base = Self::superblock_base(first);
        if n * SUPERBLOCK_SIZE > size {
            free_ranges.free(base + size, n * SUPERBLOCK_SIZE - size);
        }
        Ok(base)
    }

    /// Decomposes `[start, start + size)` into maximal runs with a single
    /// owner. Runs inside unclaimed superblocks report `None`.
    pub fn generate_owner_list(
        &self,
        start: Vaddr,
        size: usize,
    ) -> Vec<(Vaddr, usize, Option<usize>)> {
        if start + size <= SUPERBLOCK_AREA_BASE || start >= MAIN_MEM_AREA_BASE {
            return alloc::vec![(start, size, self.owner(start))];
        }

        let mut res: Vec<(Vaddr, usize, Option<usize>)> = Vec::new();
        let mut i = 0;
        while i < size {
            let cur = start + i;
            let owner = self.owner(cur);
            let next_barrier = (cur + 1).align_up(SUPERBLOCK_SIZE).min(start + size);
            let len = next_barrier - cur;
            match res.last_mut() {
                Some(prev) if prev.2 == owner => prev.1 += len,
                _ => res.push((cur, len, owner)),
            }
            i += len;
        }
        res
    }

    /// Records a mapping or linear range in the cross-shard index.
    pub fn note_range(&self, range: Range<Vaddr>, kind: RangeKind) {
        self.range_index
            .write()
            .insert(range.start, (range.end - range.start, kind));
    }

    /// Updates the length of a recorded range after a split or resize.
    pub fn resize_range(&self, start: Vaddr, new_len: usize) {
        if let Some(entry) = self.range_index.write().get_mut(&start) {
            entry.0 = new_len;
        }
    }

    pub fn forget_range(&self, start: Vaddr) {
        self.range_index.write().remove(&start);
    }

    /// A snapshot of every tracked range, for introspection.
    pub fn ranges(&self) -> Vec<(Range<Vaddr>, RangeKind)> {
        self.range_index
            .read()
            .iter()
            .map(|(&start, &(len, kind))| (start..start + len, kind))
            .collect()
    }

    /// The total size of all live VMAs, across every shard.
    pub fn all_vmas_size(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.vmas.read().iter().map(Vma::size).sum::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MockPlatform;

    fn manager(cpus: usize) -> SuperblockManager {
        SuperblockManager::new(MockPlatform::new_arc(cpus), cpus)
    }

    #[test]
    fn owner_derivation() {
        let mgr = manager(4);
        assert_eq!(mgr.owner(0x1000), Some(4));
        assert_eq!(mgr.owner(MAIN_MEM_AREA_BASE + 0x1000), Some(4));
        assert_eq!(mgr.owner(SUPERBLOCK_AREA_BASE), None);

        let first = mgr.allocate_superblocks(1).unwrap();
        assert_eq!(first, 0);
        assert_eq!(mgr.owner(SUPERBLOCK_AREA_BASE), Some(0));
        assert_eq!(mgr.owner(SUPERBLOCK_AREA_BASE + SUPERBLOCK_SIZE), None);
    }

    #[test]
    fn superblock_runs_skip_claimed_slots() {
        let mgr = manager(2);
        mgr.superblocks[1].store(1, Ordering::Release);
        // A run of two cannot use slot 0; the first fit is slots 2..4.
        assert_eq!(mgr.allocate_superblocks(2).unwrap(), 2);
        assert_eq!(mgr.allocate_superblocks(1).unwrap(), 0);
    }

    #[test]
    fn reserve_range_claims_and_reuses() {
        let mgr = manager(1);
        let a = mgr.reserve_range(0x4000).unwrap();
        assert_eq!(a, SUPERBLOCK_AREA_BASE);
        // The tail of the superblock serves subsequent requests.
        let b = mgr.reserve_range(0x4000).unwrap();
        assert!(b > a && b < a + SUPERBLOCK_SIZE);

        // A request larger than one superblock claims a consecutive run.
        let c = mgr.reserve_range(SUPERBLOCK_SIZE + 0x1000).unwrap();
        assert_eq!(c % SUPERBLOCK_SIZE, 0);
        assert_eq!(mgr.owner(c), mgr.owner(c + SUPERBLOCK_SIZE));
    }

    #[test]
    fn owner_list_merges_same_owner_runs() {
        let mgr = manager(2);
        let base = SUPERBLOCK_AREA_BASE;
        mgr.superblocks[0].store(0, Ordering::Release);
        mgr.superblocks[1].store(0, Ordering::Release);
        mgr.superblocks[2].store(1, Ordering::Release);

        let list = mgr.generate_owner_list(base + 0x1000, 3 * SUPERBLOCK_SIZE - 0x1000);
        assert_eq!(
            list,
            [
                (base + 0x1000, 2 * SUPERBLOCK_SIZE - 0x1000, Some(0)),
                (base + 2 * SUPERBLOCK_SIZE, SUPERBLOCK_SIZE, Some(1)),
            ]
        );

        // A range entirely below the superblock area is a single run of
        // the shared shard.
        let list = mgr.generate_owner_list(0x10000, 0x1000);
        assert_eq!(list, [(0x10000, 0x1000, Some(2))]);
    }
}
