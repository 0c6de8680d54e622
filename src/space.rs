// SPDX-License-Identifier: MPL-2.0

//! The address space: public mapping operations, the page-fault path,
//! and introspection.
//!
//! All threads share one [`AddressSpace`]. Mutations of a shard's VMAs or
//! page-table entries happen under that shard's `vmas` write lock, except
//! the fault path, which holds the read lock and relies on PTE
//! compare-and-swap; the `free_ranges` lock is taken after the `vmas`
//! lock and never the other way around. Ranges that span several owners
//! are decomposed first and each segment is handled under its owner's
//! locks.

use alloc::{collections::BTreeMap, format, string::String, sync::Arc, vec::Vec};
use core::ops::Range;

use align_ext::AlignExt;
use log::{debug, error, trace};
use spin::{Mutex, RwLock};

use crate::{
    addr::{
        page_size_level, Paddr, Vaddr, HUGE_PAGE_SIZE, NR_LEVELS, NR_PAGE_SIZES, PAGE_SIZE,
        PTE_PER_PAGE, UPPER_VMA_LIMIT,
    },
    arch::{is_page_fault_insn, is_page_fault_write, ExceptionFrame, MemAttr, Pte},
    error::{Errno, Result},
    file::VmFile,
    page_table::{
        self,
        ops::{
            CleanupIntermediatePages, DirtyCleaner, DirtyPageSync, LinearPageMapper, Populate,
            Protection, SplitHugePages, Unpopulate, VirtToPhys,
        },
        PageTableOp, RootTable,
    },
    perms::{MmapFlags, Perm},
    platform::{Platform, Signal},
    registry::VmaSet,
    return_errno_with_msg,
    superblock::{RangeKind, SuperblockManager},
    vma::{map_file_vma, LinearVma, Vma, VmaBacking},
};

/// The advice `madvise` accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advice {
    /// Drop the backing pages of the range, keeping the mappings.
    DontNeed,
    /// Stop using huge pages in the range and break up installed ones.
    NoHugePage,
}

/// A single address space shared by every thread.
pub struct AddressSpace {
    platform: Arc<dyn Platform>,
    root: RootTable,
    sb: SuperblockManager,
    linear_vmas: RwLock<BTreeMap<Vaddr, LinearVma>>,
    /// Serializes page-table modifications outside any VMA.
    page_table_high: Mutex<()>,
}

impl AddressSpace {
    /// Creates an empty address space served by `nr_cpus` shards plus the
    /// shared one.
    pub fn new(platform: Arc<dyn Platform>, nr_cpus: usize) -> Result<Self> {
        let root = RootTable::new(&*platform)?;
        let sb = SuperblockManager::new(platform.clone(), nr_cpus);
        Ok(AddressSpace {
            platform,
            root,
            sb,
            linear_vmas: RwLock::new(BTreeMap::new()),
            page_table_high: Mutex::new(()),
        })
    }

    fn operate<O: PageTableOp>(
        &self,
        op: O,
        vma_start: Vaddr,
        start: Vaddr,
        size: usize,
    ) -> Result<usize> {
        page_table::operate_range(&*self.platform, &self.root, op, vma_start, start, size)
    }

    // ------------------------------------------------------------------
    // Mapping establishment
    // ------------------------------------------------------------------

    /// Maps `size` bytes of anonymous memory and returns the mapped
    /// address. Without `FIXED` a hole is reserved in the calling CPU's
    /// shard; with `FIXED` whatever lives at `addr` is evacuated first.
    pub fn map_anon(
        &self,
        addr: Vaddr,
        size: usize,
        flags: MmapFlags,
        perm: Perm,
    ) -> Result<Vaddr> {
        let size = size.align_up(PAGE_SIZE);
        if size == 0 {
            return_errno_with_msg!(Errno::EINVAL, "empty mapping");
        }
        let start = self.allocate(addr, size, flags, |range| {
            Ok(Vma::new_anon(self.platform.clone(), range, perm, flags))
        })?;
        trace!("map_anon: {:#x}..{:#x} {:?} {:?}", start, start + size, perm, flags);
        if flags.contains(MmapFlags::POPULATE) {
            self.populate_installed(start, size)?;
        }
        Ok(start)
    }

    /// Maps `size` bytes of `file` starting at `offset`.
    pub fn map_file(
        &self,
        addr: Vaddr,
        size: usize,
        flags: MmapFlags,
        perm: Perm,
        file: Arc<dyn VmFile>,
        offset: u64,
    ) -> Result<Vaddr> {
        let size = size.align_up(PAGE_SIZE);
        if size == 0 || offset % PAGE_SIZE as u64 != 0 {
            return_errno_with_msg!(Errno::EINVAL, "empty mapping or unaligned offset");
        }
        let base = addr;
        let start = self.allocate(addr, size, flags, |range| {
            // Fixed mappings may be decomposed by owner; each piece maps
            // the matching slice of the file.
            let piece_off = if flags.contains(MmapFlags::FIXED) {
                offset + (range.start - base) as u64
            } else {
                offset
            };
            map_file_vma(
                self.platform.clone(),
                file.clone(),
                range,
                flags,
                perm,
                piece_off,
            )
        })?;
        trace!("map_file: {:#x}..{:#x} {:?} offset {:#x}", start, start + size, perm, offset);
        if flags.contains(MmapFlags::POPULATE) {
            let fsize = (file.stat()?.size as usize).align_up(PAGE_SIZE);
            self.populate_installed(start, size.min(fsize))?;
        }
        Ok(start)
    }

    /// Reserves or evacuates the target range, builds the VMAs with
    /// `make`, and installs them under their owners' write locks. The
    /// VMAs are built first so a refused mapping changes nothing.
    fn allocate(
        &self,
        addr: Vaddr,
        size: usize,
        flags: MmapFlags,
        make: impl Fn(Range<Vaddr>) -> Result<Vma>,
    ) -> Result<Vaddr> {
        self.platform.ensure_stack_resident();

        if !flags.contains(MmapFlags::FIXED) {
            let mut vma = make(0..size)?;
            let start = self.sb.reserve_range(size)?;
            vma.set_range(start..start + size);
            self.establish(vma);
            return Ok(start);
        }

        if addr % PAGE_SIZE != 0
            || addr < PAGE_SIZE
            || addr.checked_add(size).map_or(true, |end| end > UPPER_VMA_LIMIT)
        {
            return_errno_with_msg!(Errno::EINVAL, "bad fixed mapping address");
        }
        // Claim every superblock the range touches, then carve it up by
        // owner; a VMA never crosses into another owner's superblock.
        let mut claim = addr;
        while claim < addr + size {
            self.sb.ensure_owner(claim);
            claim = (claim + 1).align_up(crate::addr::SUPERBLOCK_SIZE);
        }
        let segments = self.sb.generate_owner_list(addr, size);
        let mut vmas = Vec::with_capacity(segments.len());
        for &(seg_start, seg_len, _) in &segments {
            vmas.push(make(seg_start..seg_start + seg_len)?);
        }
        for ((seg_start, seg_len, owner), vma) in segments.into_iter().zip(vmas) {
            let owner = owner.expect("fixed range not claimed");
            let shard = self.sb.shard(owner);
            {
                let mut set = shard.vmas.write();
                self.evacuate_in(&mut set, owner, seg_start, seg_start + seg_len)?;
            }
            shard.free_ranges.write().allocate(seg_start, seg_len);
            self.establish(vma);
        }
        Ok(addr)
    }

    fn establish(&self, vma: Vma) {
        let owner = self
            .sb
            .owner(vma.start())
            .expect("installing a VMA into an unowned superblock");
        self.sb.note_range(vma.range(), RangeKind::Mapping);
        self.sb.shard(owner).vmas.write().insert(vma);
    }

    /// Populates every VMA piece of a freshly installed mapping, under
    /// the owners' write locks.
    fn populate_installed(&self, start: Vaddr, len: usize) -> Result<usize> {
        let mut total = 0;
        for (seg_start, seg_len, owner) in self.sb.generate_owner_list(start, len) {
            let owner = owner.expect("populating an unowned range");
            let set = self.sb.shard(owner).vmas.write();
            for key in set.intersecting_keys(seg_start..seg_start + seg_len) {
                let vma = set.get(key).unwrap();
                let ps = vma.start().max(seg_start);
                let pe = vma.end().min(seg_start + seg_len);
                total += self.populate_vma(vma, ps, pe - ps, false)?;
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Unmapping
    // ------------------------------------------------------------------

    /// Unmaps `[addr, addr + length)`. The whole range must be mapped.
    /// Dirty shared file pages are synced back best-effort first.
    pub fn munmap(&self, addr: Vaddr, length: usize) -> Result<()> {
        self.platform.ensure_stack_resident();
        let length = length.align_up(PAGE_SIZE);
        if length == 0 || addr % PAGE_SIZE != 0 {
            return_errno_with_msg!(Errno::EINVAL, "bad unmap range");
        }
        for (seg_start, seg_len, owner) in self.sb.generate_owner_list(addr, length) {
            let Some(owner) = owner else {
                return_errno_with_msg!(Errno::EINVAL, "unmapping an unmapped range");
            };
            let mut set = self.sb.shard(owner).vmas.write();
            if !set.is_fully_mapped(seg_start, seg_start + seg_len) {
                return_errno_with_msg!(Errno::EINVAL, "unmapping an unmapped range");
            }
            let _ = self.sync_in(&set, seg_start, seg_start + seg_len);
            self.evacuate_in(&mut set, owner, seg_start, seg_start + seg_len)?;
        }
        Ok(())
    }

    /// Removes the entire VMA containing `addr`, whatever its size.
    /// Mind that operations like mprotect may have split the original
    /// mapping into several VMAs.
    pub fn munmap_anon(&self, addr: Vaddr) -> Result<()> {
        self.platform.ensure_stack_resident();
        let Some(owner) = self.sb.owner(addr) else {
            return_errno_with_msg!(Errno::EINVAL, "no mapping at the address");
        };
        let mut set = self.sb.shard(owner).vmas.write();
        let Some(key) = set.find_intersecting(addr).map(|v| v.start()) else {
            return_errno_with_msg!(Errno::EINVAL, "no mapping at the address");
        };
        self.evacuate_vma(&mut set, owner, key)?;
        Ok(())
    }

    /// Splits at both edges and evacuates every VMA fully inside
    /// `[start, end)`. The caller holds the owner's write lock.
    fn evacuate_in(
        &self,
        set: &mut VmaSet,
        owner: usize,
        start: Vaddr,
        end: Vaddr,
    ) -> Result<usize> {
        self.split_indexed(set, start)?;
        self.split_indexed(set, end)?;
        let mut total = 0;
        for key in set.intersecting_keys(start..end) {
            let vma = set.get(key).unwrap();
            if vma.start() >= start && vma.end() <= end {
                total += self.evacuate_vma(set, owner, key)?;
            }
        }
        Ok(total)
    }

    /// Unmaps a VMA's pages, returns its range to the free map, and
    /// erases it. The caller holds the owner's write lock.
    fn evacuate_vma(&self, set: &mut VmaSet, owner: usize, key: Vaddr) -> Result<usize> {
        let vma = set.remove(key).expect("evacuating a missing VMA");
        let freed = self.operate(
            Unpopulate::new(&*self.platform, vma.page_ops()),
            vma.start(),
            vma.start(),
            vma.size(),
        )?;
        self.sb
            .shard(owner)
            .free_ranges
            .write()
            .free(vma.start(), vma.size());
        self.sb.forget_range(vma.start());
        trace!("evacuated {:#x}..{:#x}, freed {:#x} bytes", vma.start(), vma.end(), freed);
        Ok(freed)
    }

    /// A split that keeps the cross-shard range index in step.
    fn split_indexed(&self, set: &mut VmaSet, edge: Vaddr) -> Result<()> {
        let straddling = set
            .find_intersecting(edge)
            .map(|v| (v.start(), v.end()))
            .filter(|&(s, _)| s < edge);
        set.split_at(edge)?;
        if let Some((s, e)) = straddling {
            self.sb.resize_range(s, edge - s);
            self.sb.note_range(edge..e, RangeKind::Mapping);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    /// Changes the permissions of `[addr, addr + len)`. The whole range
    /// must be mapped. VMAs already carrying `perm` are left untouched.
    pub fn mprotect(&self, addr: Vaddr, len: usize, perm: Perm) -> Result<()> {
        self.platform.ensure_stack_resident();
        if addr % PAGE_SIZE != 0 {
            return_errno_with_msg!(Errno::EINVAL, "unaligned mprotect address");
        }
        let len = len.align_up(PAGE_SIZE);
        for (seg_start, seg_len, owner) in self.sb.generate_owner_list(addr, len) {
            let Some(owner) = owner else {
                return_errno_with_msg!(Errno::ENOMEM, "protecting an unmapped range");
            };
            let mut set = self.sb.shard(owner).vmas.write();
            if !set.is_fully_mapped(seg_start, seg_start + seg_len) {
                return_errno_with_msg!(Errno::ENOMEM, "protecting an unmapped range");
            }
            self.protect_in(&mut set, seg_start, seg_start + seg_len, perm)?;
        }
        Ok(())
    }

    fn protect_in(&self, set: &mut VmaSet, start: Vaddr, end: Vaddr, perm: Perm) -> Result<()> {
        // Validate before any split so a denied request changes nothing.
        for key in set.intersecting_keys(start..end) {
            let vma = set.get(key).unwrap();
            if vma.perm() != perm {
                vma.validate_perm(perm)?;
            }
        }
        let needs_split = |set: &VmaSet, edge: Vaddr| {
            set.find_intersecting(edge)
                .is_some_and(|v| v.perm() != perm && v.start() < edge)
        };
        if needs_split(set, end) {
            self.split_indexed(set, end)?;
        }
        if needs_split(set, start) {
            self.split_indexed(set, start)?;
        }
        for key in set.intersecting_keys(start..end) {
            let vma = set.get_mut(key).unwrap();
            if vma.perm() == perm || vma.start() < start || vma.end() > end {
                continue;
            }
            vma.protect(perm);
            let (vstart, vsize) = (vma.start(), vma.size());
            self.operate(Protection::new(perm), vstart, vstart, vsize)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------

    /// Writes the dirty pages of shared file mappings in the range back
    /// to their files. The whole range must be mapped.
    pub fn msync(&self, addr: Vaddr, len: usize) -> Result<()> {
        let len = len.align_up(PAGE_SIZE);
        for (seg_start, seg_len, owner) in self.sb.generate_owner_list(addr, len) {
            let Some(owner) = owner else {
                return_errno_with_msg!(Errno::ENOMEM, "syncing an unmapped range");
            };
            let set = self.sb.shard(owner).vmas.read();
            if !set.is_fully_mapped(seg_start, seg_start + seg_len) {
                return_errno_with_msg!(Errno::ENOMEM, "syncing an unmapped range");
            }
            self.sync_in(&set, seg_start, seg_start + seg_len)?;
        }
        Ok(())
    }

    fn sync_in(&self, set: &VmaSet, start: Vaddr, end: Vaddr) -> Result<()> {
        for key in set.intersecting_keys(start..end) {
            let vma = set.get(key).unwrap();
            self.sync_vma(vma, start.max(vma.start()), end.min(vma.end()))?;
        }
        Ok(())
    }

    fn sync_vma(&self, vma: &Vma, start: Vaddr, end: Vaddr) -> Result<()> {
        let VmaBacking::File {
            file,
            offset,
            cache_backed,
            ..
        } = vma.backing()
        else {
            return Ok(());
        };
        if !vma.has_flags(MmapFlags::SHARED) {
            return_errno_with_msg!(Errno::ENOMEM, "msync of a private mapping");
        }
        if *cache_backed {
            file.sync_range(
                *offset + (start - vma.start()) as u64,
                *offset + (end - vma.start()) as u64,
            )?;
            return file.fsync();
        }
        let fsize = file.stat()?.size;
        let harvested = self.operate(
            DirtyCleaner::new(DirtyPageSync::new(&*self.platform, &**file, *offset, fsize)),
            vma.start(),
            start,
            end - start,
        )?;
        if harvested != 0 {
            file.fsync()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Residency and advice
    // ------------------------------------------------------------------

    /// Fills `vec` with one byte per page of the range: `0x01` where a
    /// readable page is installed, `0x00` elsewhere.
    pub fn mincore(&self, addr: Vaddr, len: usize, vec: &mut [u8]) -> Result<()> {
        let start = addr.align_down(PAGE_SIZE);
        let end = (addr + len).align_up(PAGE_SIZE);
        let pages = (end - start) / PAGE_SIZE;
        if vec.len() < pages {
            return_errno_with_msg!(Errno::EINVAL, "mincore vector too small");
        }
        if !self.is_linear_mapped(addr, len) && !self.ismapped(addr, len) {
            return_errno_with_msg!(Errno::ENOMEM, "mincore of an unmapped range");
        }
        for (i, page) in (start..end).step_by(PAGE_SIZE).enumerate() {
            vec[i] = match self.query(page) {
                Some((_, pte, _)) if pte.is_present() => 0x01,
                _ => 0x00,
            };
        }
        Ok(())
    }

    /// Applies `advice` to `[addr, addr + size)`. The whole range must be
    /// mapped.
    pub fn madvise(&self, addr: Vaddr, size: usize, advice: Advice) -> Result<()> {
        self.platform.ensure_stack_resident();
        let size = size.align_up(PAGE_SIZE);
        for (seg_start, seg_len, owner) in self.sb.generate_owner_list(addr, size) {
            let Some(owner) = owner else {
                return_errno_with_msg!(Errno::ENOMEM, "advising an unmapped range");
            };
            let seg_end = seg_start + seg_len;
            let mut set = self.sb.shard(owner).vmas.write();
            if !set.is_fully_mapped(seg_start, seg_end) {
                return_errno_with_msg!(Errno::ENOMEM, "advising an unmapped range");
            }
            for key in set.intersecting_keys(seg_start..seg_end) {
                match advice {
                    Advice::DontNeed => {
                        let vma = set.get(key).unwrap();
                        let (ps, pe) = (vma.start().max(seg_start), vma.end().min(seg_end));
                        self.operate(
                            Unpopulate::new(&*self.platform, vma.page_ops()),
                            vma.start(),
                            ps,
                            pe - ps,
                        )?;
                    }
                    Advice::NoHugePage => {
                        let vma = set.get_mut(key).unwrap();
                        if vma.has_flags(MmapFlags::SMALL) {
                            continue;
                        }
                        vma.update_flags(MmapFlags::SMALL);
                        let (ps, pe) = (vma.start().max(seg_start), vma.end().min(seg_end));
                        let vstart = vma.start();
                        self.operate(SplitHugePages, vstart, ps, pe - ps)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Linear maps and kernel ranges
    // ------------------------------------------------------------------

    /// Installs a fixed direct mapping of `[phys, phys + size)` at `virt`
    /// and registers it for introspection. `virt` and `phys` must agree
    /// modulo `slop`, which caps the page size used.
    pub fn linear_map(
        &self,
        virt: Vaddr,
        phys: Paddr,
        size: usize,
        name: &str,
        slop: usize,
        mattr: MemAttr,
    ) -> Result<()> {
        let slop = slop.min(page_size_level(NR_PAGE_SIZES - 1));
        assert_eq!(virt & (slop - 1), phys & (slop - 1));
        {
            let _high = self.page_table_high.lock();
            let mut mapper = LinearPageMapper::new(phys, size, mattr);
            page_table::map_range(&*self.platform, &self.root, &mut mapper, virt, virt, size, slop)?;
        }
        self.linear_vmas.write().insert(
            virt,
            LinearVma {
                virt,
                phys,
                size,
                mattr,
                name: name.into(),
            },
        );
        self.sb.note_range(virt..virt + size, RangeKind::Linear);
        for (seg_start, seg_len, owner) in self.sb.generate_owner_list(virt, size) {
            let owner = owner.unwrap_or_else(|| self.sb.ensure_owner(seg_start));
            self.sb
                .shard(owner)
                .free_ranges
                .write()
                .allocate(seg_start, seg_len);
        }
        debug!("linear map {}: {:#x} -> {:#x}, {:#x} bytes", name, virt, phys, size);
        Ok(())
    }

    /// Populates a raw range outside any VMA with zeroed anonymous pages.
    pub fn kernel_populate(&self, addr: Vaddr, size: usize) -> Result<usize> {
        assert!(addr >= UPPER_VMA_LIMIT);
        let _high = self.page_table_high.lock();
        let provider = crate::providers::AnonPages::zeroed(self.platform.clone());
        self.operate(
            Populate::new(&provider, Perm::RWX, false, true),
            addr,
            addr,
            size,
        )
    }

    /// Releases the pages of a raw range populated with
    /// [`Self::kernel_populate`].
    pub fn kernel_depopulate(&self, addr: Vaddr, size: usize) -> Result<usize> {
        assert!(addr >= UPPER_VMA_LIMIT);
        let _high = self.page_table_high.lock();
        let provider = crate::providers::AnonPages::zeroed(self.platform.clone());
        self.operate(
            Unpopulate::new(&*self.platform, &provider),
            addr,
            addr,
            size,
        )
    }

    /// Frees the leaf page tables of a raw range whose entries have all
    /// been cleared.
    pub fn kernel_cleanup(&self, addr: Vaddr, size: usize) -> Result<()> {
        assert!(addr >= UPPER_VMA_LIMIT);
        let _high = self.page_table_high.lock();
        self.operate(
            CleanupIntermediatePages::new(&*self.platform),
            addr,
            addr,
            size,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn query(&self, vaddr: Vaddr) -> Option<(Paddr, Pte, usize)> {
        let vbase = vaddr.align_down(PAGE_SIZE);
        let mut op = VirtToPhys::new(vaddr);
        page_table::map_range(
            &*self.platform,
            &self.root,
            &mut op,
            vbase,
            vbase,
            PAGE_SIZE,
            PAGE_SIZE,
        )
        .ok()?;
        op.result()
    }

    /// Translates `vaddr` through the page tables.
    pub fn virt_to_phys(&self, vaddr: Vaddr) -> Option<Paddr> {
        self.query(vaddr).map(|(pa, _, _)| pa)
    }

    /// Reads the raw leaf PTE translating `vaddr` under an RCU read
    /// section and hands it (with its level) to `visitor`.
    pub fn visit_pte_rcu<F: FnOnce(Option<(Pte, usize)>)>(&self, vaddr: Vaddr, visitor: F) {
        self.platform.rcu_read_lock();
        let result = self.query(vaddr).map(|(_, pte, level)| (pte, level));
        self.platform.rcu_read_unlock();
        visitor(result);
    }

    /// Whether every byte of `[addr, addr + size)` lies in some VMA.
    pub fn ismapped(&self, addr: Vaddr, size: usize) -> bool {
        for (seg_start, seg_len, owner) in self.sb.generate_owner_list(addr, size) {
            let Some(owner) = owner else { return false };
            let set = self.sb.shard(owner).vmas.read();
            if !set.is_fully_mapped(seg_start, seg_start + seg_len) {
                return false;
            }
        }
        true
    }

    /// Whether every page of `[addr, addr + size)` has a readable page
    /// installed.
    pub fn isreadable(&self, addr: Vaddr, size: usize) -> bool {
        let end = (addr + size).align_up(PAGE_SIZE);
        let mut page = addr.align_down(PAGE_SIZE);
        while page < end {
            match self.query(page) {
                Some((_, pte, _)) if pte.is_present() => {}
                _ => return false,
            }
            page += PAGE_SIZE;
        }
        true
    }

    /// Whether `[addr, addr + size)` lies inside one registered linear
    /// map.
    pub fn is_linear_mapped(&self, addr: Vaddr, size: usize) -> bool {
        let linear = self.linear_vmas.read();
        let Some((_, vma)) = linear.range(..=addr).next_back() else {
            return false;
        };
        addr + size <= vma.virt + vma.size
    }

    /// The total size of all live VMAs.
    pub fn all_vmas_size(&self) -> usize {
        self.sb.all_vmas_size()
    }

    /// A snapshot of every tracked range, mappings and linear maps alike.
    pub fn vma_ranges(&self) -> Vec<(Range<Vaddr>, RangeKind)> {
        self.sb.ranges()
    }

    /// The free intervals of the shard owning `addr`.
    #[cfg(test)]
    pub(crate) fn free_ranges_at(&self, addr: Vaddr) -> Vec<(Vaddr, usize)> {
        let owner = self.sb.owner(addr).unwrap();
        self.sb.shard(owner).free_ranges.read().iter().collect()
    }

    // ------------------------------------------------------------------
    // Fault handling
    // ------------------------------------------------------------------

    /// Serves a page fault at `addr`. Installs the missing page when the
    /// access is legal, raises `SIGSEGV`/`SIGBUS` otherwise.
    pub fn vm_fault(&self, addr: Vaddr, ef: &ExceptionFrame) {
        trace!("vm_fault: addr {:#x}, error code {:#x}", addr, ef.error_code);
        if addr < PAGE_SIZE {
            self.deliver(addr, Signal::Segv, ef);
            return;
        }
        let addr = addr.align_down(PAGE_SIZE);
        let Some(owner) = self.sb.owner(addr) else {
            self.deliver(addr, Signal::Segv, ef);
            return;
        };
        let set = self.sb.shard(owner).vmas.read();
        let Some(vma) = set.find_intersecting(addr) else {
            drop(set);
            self.deliver(addr, Signal::Segv, ef);
            return;
        };
        if access_fault(vma, ef.error_code) {
            drop(set);
            self.deliver(addr, Signal::Segv, ef);
            return;
        }
        self.vma_fault(vma, addr, ef);
    }

    /// Populates one page (or one huge page) of `vma` for the fault at
    /// `addr`. The caller holds the shard's read lock.
    fn vma_fault(&self, vma: &Vma, addr: Vaddr, ef: &ExceptionFrame) {
        let hp_start = vma.start().align_up(HUGE_PAGE_SIZE);
        let hp_end = vma.end().align_down(HUGE_PAGE_SIZE);
        let huge_interior = hp_start <= addr && addr < hp_end;

        let (addr, size) = match vma.backing() {
            VmaBacking::Anon => {
                if !vma.has_flags(MmapFlags::SMALL) && huge_interior {
                    (addr.align_down(HUGE_PAGE_SIZE), HUGE_PAGE_SIZE)
                } else {
                    (addr, PAGE_SIZE)
                }
            }
            VmaBacking::File { file, .. } => {
                let fsize = file.stat().map(|s| s.size).unwrap_or(0);
                if vma.file_offset(addr) >= fsize {
                    self.deliver(addr, Signal::Bus, ef);
                    return;
                }
                if !vma.has_flags(MmapFlags::SMALL)
                    && huge_interior
                    && vma.file_offset(hp_end) < fsize
                {
                    (addr.align_down(HUGE_PAGE_SIZE), HUGE_PAGE_SIZE)
                } else {
                    (addr, PAGE_SIZE)
                }
            }
        };

        let write = is_page_fault_write(ef.error_code);
        if let Err(e) = self.populate_vma(vma, addr, size, write) {
            debug!("fault population failed at {:#x}: {}", addr, e);
            self.deliver(addr, Signal::Bus, ef);
        }
    }

    /// Backs `[vaddr, vaddr + size)` of `vma` with pages from its
    /// provider, returning the bytes newly backed.
    fn populate_vma(&self, vma: &Vma, vaddr: Vaddr, size: usize, write: bool) -> Result<usize> {
        let provider = vma.page_ops();
        let total = if vma.has_flags(MmapFlags::SMALL) {
            self.operate(
                Populate::small(provider, vma.perm(), write, vma.map_dirty()),
                vma.start(),
                vaddr,
                size,
            )?
        } else {
            self.operate(
                Populate::new(provider, vma.perm(), write, vma.map_dirty()),
                vma.start(),
                vaddr,
                size,
            )?
        };
        if vma.perm().contains(Perm::EXEC) {
            self.platform.synchronize_cpu_caches(vaddr, size);
        }
        Ok(total)
    }

    fn deliver(&self, addr: Vaddr, signal: Signal, ef: &ExceptionFrame) {
        if self.platform.is_kernel_text(ef.pc) {
            error!("page fault outside application, addr: {:#018x}", addr);
            panic!("unhandled kernel page fault at {:#x}", addr);
        }
        debug!("delivering {:?} for fault at {:#x}", signal, addr);
        self.platform.handle_mmap_fault(addr, signal, ef);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// One line per VMA in the /proc/self/maps format.
    pub fn procfs_maps(&self) -> String {
        let mut out = String::new();
        for shard in self.sb.shards() {
            let set = shard.vmas.read();
            for vma in set.iter() {
                let perm = vma.perm();
                out += &format!(
                    "{:x}-{:x} {}{}{}{} ",
                    vma.start(),
                    vma.end(),
                    if perm.contains(Perm::READ) { 'r' } else { '-' },
                    if perm.contains(Perm::WRITE) { 'w' } else { '-' },
                    if perm.contains(Perm::EXEC) { 'x' } else { '-' },
                    'p',
                );
                match vma.backing() {
                    VmaBacking::File {
                        file,
                        offset,
                        inode,
                        dev_id,
                        ..
                    } => {
                        out += &format!(
                            "{:08x} {:02x}:{:02x} {} {}\n",
                            offset,
                            (dev_id >> 8) & 0xfff,
                            dev_id & 0xff,
                            inode,
                            file.path(),
                        );
                    }
                    VmaBacking::Anon => out += "00000000 00:00 0\n",
                }
            }
        }
        out
    }

    /// One line per registered linear map.
    pub fn sysfs_linear_maps(&self) -> String {
        let mut out = String::new();
        for vma in self.linear_vmas.read().values() {
            out += &format!(
                "{:18p} {:18p} {:12x} rwxp {} {}\n",
                vma.virt as *const u8,
                vma.phys as *const u8,
                vma.size,
                if vma.mattr == MemAttr::Normal { 'n' } else { 'd' },
                vma.name,
            );
        }
        out
    }
}

/// Whether the faulting access kind exceeds the VMA's permissions.
fn access_fault(vma: &Vma, error_code: u64) -> bool {
    let perm = vma.perm();
    if is_page_fault_insn(error_code) {
        return !perm.contains(Perm::EXEC);
    }
    if is_page_fault_write(error_code) {
        return !perm.contains(Perm::WRITE);
    }
    !perm.contains(Perm::READ)
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Release every VMA's backing pages, then tear down the paging
        // structures themselves. Linear-map targets are not owned and are
        // left alone.
        for shard in self.sb.shards() {
            let mut set = shard.vmas.write();
            let keys: Vec<Vaddr> = set.iter().map(Vma::start).collect();
            for key in keys {
                let vma = set.remove(key).unwrap();
                let _ = self.operate(
                    Unpopulate::new(&*self.platform, vma.page_ops()),
                    vma.start(),
                    vma.start(),
                    vma.size(),
                );
            }
        }
        free_tables(&*self.platform, self.root.paddr(), NR_LEVELS - 1);
        self.platform.free_page(self.root.paddr());
    }
}

/// Frees every page-table node reachable from `table`, whose entries are
/// at `entry_level`. Leaf target pages are never touched.
fn free_tables(platform: &dyn Platform, table: Paddr, entry_level: usize) {
    let slots = platform.phys_to_virt(table) as *const u64;
    for i in 0..PTE_PER_PAGE {
        // SAFETY: `table` is a live page-table node; teardown is
        // single-threaded.
        let pte = Pte::from_raw(unsafe { slots.add(i).read() });
        if pte.is_empty() || pte.is_large() || entry_level == 0 {
            continue;
        }
        if entry_level > 1 {
            free_tables(platform, pte.paddr(), entry_level - 1);
        }
        platform.free_page(pte.paddr());
    }
}
