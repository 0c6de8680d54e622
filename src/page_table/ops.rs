// SPDX-License-Identifier: MPL-2.0

//! Concrete page-table operations.

use alloc::vec::Vec;

use super::{PageTableOp, Ptep};
use crate::{
    addr::{Paddr, PAGE_SIZE},
    arch::{MemAttr, Pte},
    error::{Errno, Error, Result},
    file::VmFile,
    perms::Perm,
    platform::Platform,
    providers::PageProvider,
    return_errno_with_msg,
};

/// Batches pages unmapped during a walk so they are freed only after the
/// TLB no longer holds entries pointing at them.
const TLB_GATHER_MAX_PAGES: usize = 20;

pub(crate) struct TlbGather<'a> {
    platform: &'a dyn Platform,
    pages: [(Paddr, usize); TLB_GATHER_MAX_PAGES],
    nr: usize,
}

impl<'a> TlbGather<'a> {
    const MAX_PAGES: usize = TLB_GATHER_MAX_PAGES;

    fn new(platform: &'a dyn Platform) -> Self {
        TlbGather {
            platform,
            pages: [(0, 0); TLB_GATHER_MAX_PAGES],
            nr: 0,
        }
    }

    /// Queues a page for freeing. Returns whether a flush was forced to
    /// make room.
    fn push(&mut self, page: Paddr, size: usize) -> bool {
        let mut flushed = false;
        if self.nr == Self::MAX_PAGES {
            self.flush();
            flushed = true;
        }
        self.pages[self.nr] = (page, size);
        self.nr += 1;
        flushed
    }

    /// Flushes the TLB and frees the queued pages. Returns whether there
    /// was anything to do.
    fn flush(&mut self) -> bool {
        if self.nr == 0 {
            return false;
        }
        self.platform.flush_tlb_all();
        for &(page, size) in &self.pages[..self.nr] {
            if size == PAGE_SIZE {
                self.platform.free_page(page);
            } else {
                self.platform.free_huge_page(page, size);
            }
        }
        self.nr = 0;
        true
    }
}

/// Fills the missing entries of a range with pages drawn from a provider
/// and gives them the mapping's permissions. The page-fault path and
/// `MAP_POPULATE` both end up here.
pub(crate) struct Populate<'a> {
    provider: &'a dyn PageProvider,
    perm: Perm,
    write: bool,
    map_dirty: bool,
    small_only: bool,
    total: usize,
    err: Option<Error>,
}

impl<'a> Populate<'a> {
    pub fn new(provider: &'a dyn PageProvider, perm: Perm, write: bool, map_dirty: bool) -> Self {
        Populate {
            provider,
            perm,
            write,
            map_dirty,
            small_only: false,
            total: 0,
            err: None,
        }
    }

    /// A populate that only ever installs base pages.
    pub fn small(provider: &'a dyn PageProvider, perm: Perm, write: bool, map_dirty: bool) -> Self {
        Populate {
            small_only: true,
            ..Self::new(provider, perm, write, map_dirty)
        }
    }
}

impl PageTableOp for Populate<'_> {
    fn allocate_intermediate(&self) -> bool {
        true
    }

    fn skip_empty(&self) -> bool {
        false
    }

    fn nr_page_sizes(&self) -> usize {
        if self.small_only {
            1
        } else {
            crate::addr::NR_PAGE_SIZES
        }
    }

    fn page(&mut self, ptep: &Ptep, offset: usize) -> bool {
        let pte = ptep.read();
        // Present and sufficient for the access: nothing to do. A write
        // fault on a read-only entry falls through to the provider, which
        // may upgrade the mapping.
        if !pte.is_empty() && (!self.write || pte.is_writable()) {
            return true;
        }

        let new = Pte::new_leaf(0, self.perm, ptep.level(), MemAttr::Normal)
            .with_dirty(self.map_dirty || self.write);
        match self.provider.map(offset, ptep, new, self.write) {
            Ok(true) => {
                self.total += ptep.page_size();
                true
            }
            // Lost an install race; the winner's mapping serves.
            Ok(false) => true,
            Err(e) => {
                if ptep.level() > 0 {
                    // A huge page could not be provided; retry the range
                    // with base pages.
                    false
                } else {
                    if self.err.is_none() {
                        self.err = Some(e);
                    }
                    true
                }
            }
        }
    }

    fn aborted(&self) -> bool {
        self.err.is_some()
    }

    fn finalize(&mut self) -> Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn account_results(&self) -> usize {
        self.total
    }
}

/// Undoes `Populate`: hands every mapped page back to the provider and
/// clears the entries. Freed pages are held in a [`TlbGather`] until the
/// TLB is clean; emptied leaf tables are reclaimed through RCU.
pub(crate) struct Unpopulate<'a> {
    platform: &'a dyn Platform,
    provider: &'a dyn PageProvider,
    gather: TlbGather<'a>,
    do_flush: bool,
    total: usize,
}

impl<'a> Unpopulate<'a> {
    pub fn new(platform: &'a dyn Platform, provider: &'a dyn PageProvider) -> Self {
        Unpopulate {
            platform,
            provider,
            gather: TlbGather::new(platform),
            do_flush: false,
            total: 0,
        }
    }
}

impl PageTableOp for Unpopulate<'_> {
    fn allocate_intermediate(&self) -> bool {
        false
    }

    fn page(&mut self, ptep: &Ptep, offset: usize) -> bool {
        let pte = ptep.read();
        let page = pte.paddr();
        let size = ptep.page_size();
        // The page is freed even when the entry is no longer marked
        // present; evacuate only walks allocated ranges, so not-present
        // can only mean mprotect(PROT_NONE).
        if self.provider.unmap(page, offset, ptep) {
            self.do_flush = !self.gather.push(page, size);
        } else {
            self.do_flush = true;
        }
        // Providers that keep their page (a file cache) do not clear the
        // entry; make the slot empty regardless.
        ptep.write(Pte::empty());
        self.total += size;
        true
    }

    fn intermediate_page_post(&mut self, ptep: &Ptep, _offset: usize) {
        if ptep.level() != 1 {
            return;
        }
        let table = ptep.read().paddr();
        self.platform.rcu_defer_free_page(table);
        ptep.write(Pte::empty());
    }

    fn tlb_flush_needed(&mut self) -> bool {
        !self.gather.flush() && self.do_flush
    }

    fn account_results(&self) -> usize {
        self.total
    }
}

/// Rewrites the permission bits of every present entry in a range.
pub(crate) struct Protection {
    perm: Perm,
    do_flush: bool,
}

impl Protection {
    pub fn new(perm: Perm) -> Self {
        Protection {
            perm,
            do_flush: false,
        }
    }
}

impl PageTableOp for Protection {
    fn allocate_intermediate(&self) -> bool {
        false
    }

    fn page(&mut self, ptep: &Ptep, _offset: usize) -> bool {
        let pte = ptep.read();
        let old = pte.perm();
        let mut perm = self.perm;
        // A copy-on-write entry never becomes writable through a
        // permission change; the write fault performs the copy.
        if pte.is_cow() {
            perm -= Perm::WRITE;
        }
        ptep.write(pte.with_perm(perm));
        // Dropping a permission invalidates cached translations; granting
        // one does not.
        self.do_flush |= !(old - perm).is_empty();
        true
    }

    fn tlb_flush_needed(&mut self) -> bool {
        self.do_flush
    }
}

/// Receives the pages a [`DirtyCleaner`] harvests.
pub(crate) trait DirtyHandler {
    fn on_dirty(&mut self, page: Paddr, offset: usize, size: usize);
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Clears the dirty bit of every dirty entry in a range and reports the
/// page to a handler. The caller flushes before relying on the bits.
pub(crate) struct DirtyCleaner<H: DirtyHandler> {
    handler: H,
    do_flush: bool,
    total: usize,
}

impl<H: DirtyHandler> DirtyCleaner<H> {
    pub fn new(handler: H) -> Self {
        DirtyCleaner {
            handler,
            do_flush: false,
            total: 0,
        }
    }
}

impl<H: DirtyHandler> PageTableOp for DirtyCleaner<H> {
    fn allocate_intermediate(&self) -> bool {
        false
    }

    fn page(&mut self, ptep: &Ptep, offset: usize) -> bool {
        let pte = ptep.read();
        if !pte.is_dirty() {
            return true;
        }
        self.do_flush = true;
        ptep.write(pte.with_dirty(false));
        self.handler.on_dirty(pte.paddr(), offset, ptep.page_size());
        self.total += ptep.page_size();
        true
    }

    fn tlb_flush_needed(&mut self) -> bool {
        self.do_flush
    }

    fn finalize(&mut self) -> Result<()> {
        self.handler.finalize()
    }

    fn account_results(&self) -> usize {
        self.total
    }
}

/// Queues the dirty pages of a shared file mapping and writes them back
/// through the file once the walk is done.
pub(crate) struct DirtyPageSync<'a> {
    platform: &'a dyn Platform,
    file: &'a dyn VmFile,
    foffset: u64,
    fsize: u64,
    queue: Vec<(Paddr, u64, usize)>,
}

impl<'a> DirtyPageSync<'a> {
    pub fn new(platform: &'a dyn Platform, file: &'a dyn VmFile, foffset: u64, fsize: u64) -> Self {
        DirtyPageSync {
            platform,
            file,
            foffset,
            fsize,
            queue: Vec::new(),
        }
    }
}

impl DirtyHandler for DirtyPageSync<'_> {
    fn on_dirty(&mut self, page: Paddr, offset: usize, size: usize) {
        let off = self.foffset + offset as u64;
        if off >= self.fsize {
            return;
        }
        let len = (size as u64).min(self.fsize - off) as usize;
        self.queue.push((page, off, len));
    }

    fn finalize(&mut self) -> Result<()> {
        for (page, off, len) in self.queue.drain(..) {
            // SAFETY: the page stays mapped for the duration of the sync;
            // the caller holds the shard lock.
            let buf =
                unsafe { core::slice::from_raw_parts(self.platform.phys_to_virt(page), len) };
            let written = self.file.write(buf, off)?;
            if written != len {
                return_errno_with_msg!(Errno::EIO, "short write during msync");
            }
        }
        Ok(())
    }
}

/// A software walk translating one virtual address, reporting the leaf
/// entry it hit.
pub(crate) struct VirtToPhys {
    vaddr: usize,
    result: Option<(Paddr, Pte, usize)>,
}

impl VirtToPhys {
    pub fn new(vaddr: usize) -> Self {
        VirtToPhys {
            vaddr,
            result: None,
        }
    }

    /// `(paddr, leaf pte, level)` of the translation, if one exists.
    pub fn result(&self) -> Option<(Paddr, Pte, usize)> {
        self.result
    }
}

impl PageTableOp for VirtToPhys {
    fn allocate_intermediate(&self) -> bool {
        false
    }

    fn once(&self) -> bool {
        true
    }

    fn split_large(&self) -> bool {
        false
    }

    fn page(&mut self, ptep: &Ptep, _offset: usize) -> bool {
        debug_assert!(self.result.is_none());
        let pte = ptep.read();
        let pa = pte.paddr() + (self.vaddr & (ptep.page_size() - 1));
        self.result = Some((pa, pte, ptep.level()));
        true
    }

    fn sub_page(&mut self, ptep: &Ptep, _level: usize, offset: usize) {
        debug_assert!(ptep.read().is_large());
        self.page(ptep, offset);
    }
}

/// Breaks every huge page in a range down to base pages. The mapping
/// itself is unchanged, so no flush is required here; the next
/// restricting operation pays for one.
pub(crate) struct SplitHugePages;

impl PageTableOp for SplitHugePages {
    fn allocate_intermediate(&self) -> bool {
        false
    }

    fn nr_page_sizes(&self) -> usize {
        1
    }

    fn page(&mut self, ptep: &Ptep, _offset: usize) -> bool {
        debug_assert_eq!(ptep.level(), 0);
        true
    }
}

/// Frees leaf tables whose entries have all been cleared, zeroing the
/// parent entry and deferring the free through RCU so concurrent walkers
/// drain first.
pub(crate) struct CleanupIntermediatePages<'a> {
    platform: &'a dyn Platform,
    live_ptes: usize,
    do_flush: bool,
}

impl<'a> CleanupIntermediatePages<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        CleanupIntermediatePages {
            platform,
            live_ptes: 0,
            do_flush: false,
        }
    }
}

impl PageTableOp for CleanupIntermediatePages<'_> {
    fn allocate_intermediate(&self) -> bool {
        false
    }

    fn split_large(&self) -> bool {
        false
    }

    fn page(&mut self, ptep: &Ptep, _offset: usize) -> bool {
        if ptep.level() == 0 {
            self.live_ptes += 1;
        }
        true
    }

    fn intermediate_page_pre(&mut self, ptep: &Ptep, _offset: usize) {
        if ptep.level() == 1 {
            self.live_ptes = 0;
        }
    }

    fn intermediate_page_post(&mut self, ptep: &Ptep, _offset: usize) {
        if ptep.level() != 1 || self.live_ptes != 0 {
            return;
        }
        let old = ptep.read();
        #[cfg(debug_assertions)]
        {
            let table = self.platform.phys_to_virt(old.paddr()) as *const u64;
            for i in 0..crate::addr::PTE_PER_PAGE {
                debug_assert_eq!(unsafe { table.add(i).read() }, 0);
            }
        }
        ptep.write(Pte::empty());
        self.platform.rcu_defer_free_page(old.paddr());
        self.do_flush = true;
    }

    fn tlb_flush_needed(&mut self) -> bool {
        self.do_flush
    }
}

/// Writes leaf entries mapping a contiguous physical range, used to build
/// the kernel's direct maps. Never descends into existing mappings;
/// whatever slop allows is written at the largest page size.
pub(crate) struct LinearPageMapper {
    start: Paddr,
    end: Paddr,
    mattr: MemAttr,
}

impl LinearPageMapper {
    pub fn new(start: Paddr, size: usize, mattr: MemAttr) -> Self {
        LinearPageMapper {
            start,
            end: start + size,
            mattr,
        }
    }
}

impl PageTableOp for LinearPageMapper {
    fn allocate_intermediate(&self) -> bool {
        true
    }

    fn skip_empty(&self) -> bool {
        false
    }

    fn descend(&self) -> bool {
        false
    }

    fn page(&mut self, ptep: &Ptep, offset: usize) -> bool {
        let addr = self.start + offset;
        debug_assert!(addr < self.end);
        ptep.write(Pte::new_leaf(addr, Perm::RWX, ptep.level(), self.mattr));
        true
    }
}
