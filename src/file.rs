// SPDX-License-Identifier: MPL-2.0

//! The slice of the filesystem interface the VM core consumes, and the
//! shared-memory file built on top of it.

use alloc::sync::Arc;

use bitflags::bitflags;
use hashbrown::HashMap;
use spin::Mutex;

use align_ext::AlignExt;

use crate::{
    addr::{Paddr, HUGE_PAGE_SIZE},
    arch::Pte,
    error::Result,
    page_table::Ptep,
    platform::Platform,
};

bitflags! {
    /// The mode a file was opened with.
    pub struct OpenFlags: u32 {
        const READ =  1 << 0;
        const WRITE = 1 << 1;
    }
}

/// What `stat` reports about a mappable file.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStat {
    pub size: u64,
    pub inode: u64,
    pub dev_id: u64,
}

/// How a file wants its mappings backed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmapStrategy {
    /// Copy file contents into anonymous pages with `pread`; write back
    /// dirty pages on `msync`.
    Read,
    /// Map pages owned by the file's cache through
    /// [`VmFile::map_page`] / [`VmFile::put_page`].
    PageCache,
}

/// A file that can be memory-mapped.
pub trait VmFile: Send + Sync {
    fn open_flags(&self) -> OpenFlags;

    fn stat(&self) -> Result<FileStat>;

    /// Reads at `offset` into `buf`, returning the number of bytes read.
    /// A short read means end of file.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes `buf` at `offset`, returning the number of bytes written.
    fn write(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Flushes the file's own cache for `[start, end)`.
    fn sync_range(&self, _start: u64, _end: u64) -> Result<()> {
        Ok(())
    }

    /// Persists outstanding writes.
    fn fsync(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the file's mount forbids executable mappings.
    fn noexec_mount(&self) -> bool {
        false
    }

    /// The path shown in the mappings dump.
    fn path(&self) -> &str {
        ""
    }

    fn mmap_strategy(&self) -> MmapStrategy {
        MmapStrategy::Read
    }

    /// Installs a cache-owned page for `offset` at `ptep`. Only called
    /// for [`MmapStrategy::PageCache`] files.
    fn map_page(&self, _offset: u64, _ptep: &Ptep, _pte: Pte, _write: bool, _shared: bool) -> bool {
        false
    }

    /// Releases the entry for a cache-owned page. Returning `false` keeps
    /// page ownership with the file.
    fn put_page(&self, _page: Paddr, _offset: u64, _ptep: &Ptep) -> bool {
        false
    }
}

/// An in-memory file backing shared-memory mappings.
///
/// Backing storage is a table of huge pages keyed by huge-page-aligned
/// file offset, allocated zeroed on first touch and owned by the file:
/// unmapping a range releases nothing, the pages go away when the file
/// does.
pub struct ShmFile {
    platform: Arc<dyn Platform>,
    size: usize,
    pages: Mutex<HashMap<u64, Paddr>>,
}

impl ShmFile {
    pub fn new(platform: Arc<dyn Platform>, size: usize) -> Self {
        ShmFile {
            platform,
            size,
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// The huge page backing `hp_off`, allocated on demand.
    fn page(&self, hp_off: u64) -> Option<Paddr> {
        let mut pages = self.pages.lock();
        if let Some(&page) = pages.get(&hp_off) {
            return Some(page);
        }
        let page = self.platform.alloc_huge_page(HUGE_PAGE_SIZE)?;
        // SAFETY: the page is exclusively ours; the table lock is held.
        unsafe { core::ptr::write_bytes(self.platform.phys_to_virt(page), 0, HUGE_PAGE_SIZE) };
        pages.insert(hp_off, page);
        Some(page)
    }
}

impl VmFile for ShmFile {
    fn open_flags(&self) -> OpenFlags {
        OpenFlags::READ | OpenFlags::WRITE
    }

    fn stat(&self) -> Result<FileStat> {
        Ok(FileStat {
            size: self.size as u64,
            inode: 0,
            dev_id: 0,
        })
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.size as u64 {
            return Ok(0);
        }
        let hp_off = offset.align_down(HUGE_PAGE_SIZE as u64);
        let delta = (offset - hp_off) as usize;
        let n = buf
            .len()
            .min(HUGE_PAGE_SIZE - delta)
            .min(self.size - offset as usize);
        match self.page(hp_off) {
            Some(page) => {
                // SAFETY: the backing page outlives the file.
                let src = unsafe {
                    core::slice::from_raw_parts(self.platform.phys_to_virt(page).add(delta), n)
                };
                buf[..n].copy_from_slice(src);
            }
            None => buf[..n].fill(0),
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if offset >= self.size as u64 {
            return Ok(0);
        }
        let hp_off = offset.align_down(HUGE_PAGE_SIZE as u64);
        let delta = (offset - hp_off) as usize;
        let n = buf
            .len()
            .min(HUGE_PAGE_SIZE - delta)
            .min(self.size - offset as usize);
        let Some(page) = self.page(hp_off) else {
            return Ok(0);
        };
        // SAFETY: the backing page outlives the file.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.platform.phys_to_virt(page).add(delta),
                n,
            )
        };
        Ok(n)
    }

    fn mmap_strategy(&self) -> MmapStrategy {
        MmapStrategy::PageCache
    }

    fn map_page(&self, offset: u64, ptep: &Ptep, pte: Pte, _write: bool, _shared: bool) -> bool {
        let hp_off = offset.align_down(HUGE_PAGE_SIZE as u64);
        let delta = (offset - hp_off) as usize;
        if ptep.level() > 0 {
            debug_assert_eq!(delta, 0);
        }
        let Some(page) = self.page(hp_off) else {
            return false;
        };
        // Losing the race is fine; the winner mapped the same cache page.
        ptep.compare_exchange(Pte::empty(), pte.with_paddr(page + delta))
    }

    fn put_page(&self, _page: Paddr, _offset: u64, _ptep: &Ptep) -> bool {
        // Page lifetime is tied to the file, not the mapping.
        false
    }
}

impl Drop for ShmFile {
    fn drop(&mut self) {
        for (_, page) in self.pages.lock().drain() {
            self.platform.free_huge_page(page, HUGE_PAGE_SIZE);
        }
    }
}
