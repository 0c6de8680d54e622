// SPDX-License-Identifier: MPL-2.0

//! Page providers: the pluggable backing behind the populate and
//! unpopulate walks.
//!
//! `map` hands the walker a page for a faulted entry; a `true` return
//! means a new backing page was installed and counts toward accounting.
//! `unmap` releases the entry; returning `true` authorizes the walker to
//! free the page once the TLB is flushed, `false` means the backing
//! object keeps ownership.

use alloc::sync::Arc;

use crate::{
    addr::Paddr,
    arch::Pte,
    error::{Errno, Error, Result},
    file::VmFile,
    page_table::Ptep,
    platform::Platform,
};

pub trait PageProvider: Send + Sync {
    /// Backs the entry at `ptep` for the page at `offset` within the
    /// mapping, installing `pte` with the address bits filled in.
    fn map(&self, offset: usize, ptep: &Ptep, pte: Pte, write: bool) -> Result<bool>;

    /// Releases the entry at `ptep`, currently mapping `page`.
    fn unmap(&self, page: Paddr, offset: usize, ptep: &Ptep) -> bool;
}

/// Installs `pte` pointing at the freshly allocated `page`, unless a
/// concurrent fault won the slot first; the loser frees its page.
fn install_fresh(platform: &dyn Platform, page: Paddr, ptep: &Ptep, pte: Pte) -> bool {
    if ptep.compare_exchange(Pte::empty(), pte.with_paddr(page)) {
        return true;
    }
    if ptep.level() > 0 {
        platform.free_huge_page(page, ptep.page_size());
    } else {
        platform.free_page(page);
    }
    false
}

fn alloc_backing(platform: &dyn Platform, ptep: &Ptep) -> Result<Paddr> {
    let page = if ptep.level() > 0 {
        platform.alloc_huge_page(ptep.page_size())
    } else {
        platform.alloc_page()
    };
    page.ok_or_else(|| Error::with_msg(Errno::ENOMEM, "no physical page for a mapping"))
}

/// Freshly allocated anonymous memory. Pages are zero-filled unless the
/// mapping asked for uninitialized memory.
pub struct AnonPages {
    platform: Arc<dyn Platform>,
    zeroed: bool,
}

impl AnonPages {
    pub fn zeroed(platform: Arc<dyn Platform>) -> Self {
        AnonPages {
            platform,
            zeroed: true,
        }
    }

    pub fn uninitialized(platform: Arc<dyn Platform>) -> Self {
        AnonPages {
            platform,
            zeroed: false,
        }
    }
}

impl PageProvider for AnonPages {
    fn map(&self, _offset: usize, ptep: &Ptep, pte: Pte, _write: bool) -> Result<bool> {
        let page = alloc_backing(&*self.platform, ptep)?;
        if self.zeroed {
            // SAFETY: the page is exclusively ours until installed.
            unsafe {
                core::ptr::write_bytes(self.platform.phys_to_virt(page), 0, ptep.page_size())
            };
        }
        Ok(install_fresh(&*self.platform, page, ptep, pte))
    }

    fn unmap(&self, _page: Paddr, _offset: usize, ptep: &Ptep) -> bool {
        ptep.write(Pte::empty());
        true
    }
}

/// File contents copied into anonymous pages with `pread`; the tail of a
/// short read is zero-filled. Serves private file mappings and
/// filesystems without a page cache.
pub struct FileReadPages {
    platform: Arc<dyn Platform>,
    file: Arc<dyn VmFile>,
    foffset: u64,
}

impl FileReadPages {
    pub fn new(platform: Arc<dyn Platform>, file: Arc<dyn VmFile>, foffset: u64) -> Self {
        FileReadPages {
            platform,
            file,
            foffset,
        }
    }
}

impl PageProvider for FileReadPages {
    fn map(&self, offset: usize, ptep: &Ptep, pte: Pte, _write: bool) -> Result<bool> {
        let size = ptep.page_size();
        let page = alloc_backing(&*self.platform, ptep)?;
        // SAFETY: the page is exclusively ours until installed.
        let buf =
            unsafe { core::slice::from_raw_parts_mut(self.platform.phys_to_virt(page), size) };
        match self.file.read(buf, self.foffset + offset as u64) {
            Ok(n) => buf[n..].fill(0),
            Err(e) => {
                if ptep.level() > 0 {
                    self.platform.free_huge_page(page, size);
                } else {
                    self.platform.free_page(page);
                }
                return Err(e);
            }
        }
        Ok(install_fresh(&*self.platform, page, ptep, pte))
    }

    fn unmap(&self, _page: Paddr, _offset: usize, ptep: &Ptep) -> bool {
        ptep.write(Pte::empty());
        true
    }
}

/// Pages owned by the file's cache; mapping and release are delegated so
/// the filesystem controls the lifecycle.
pub struct FileCachePages {
    file: Arc<dyn VmFile>,
    foffset: u64,
    shared: bool,
}

impl FileCachePages {
    pub fn new(file: Arc<dyn VmFile>, foffset: u64, shared: bool) -> Self {
        FileCachePages {
            file,
            foffset,
            shared,
        }
    }
}

impl PageProvider for FileCachePages {
    fn map(&self, offset: usize, ptep: &Ptep, pte: Pte, write: bool) -> Result<bool> {
        Ok(self
            .file
            .map_page(self.foffset + offset as u64, ptep, pte, write, self.shared))
    }

    fn unmap(&self, page: Paddr, offset: usize, ptep: &Ptep) -> bool {
        self.file.put_page(page, self.foffset + offset as u64, ptep)
    }
}
