// SPDX-License-Identifier: MPL-2.0

//! Virtual memory areas.
//!
//! A [`Vma`] is a page-aligned range with uniform permissions, a flag set,
//! and a page provider supplying its backing. The anonymous and
//! file-backed variants are a tagged enum; shared-memory mappings are
//! file-backed VMAs whose file is a [`crate::file::ShmFile`]. Linear maps
//! are tracked separately as [`LinearVma`]s and never fault.

use alloc::{boxed::Box, string::String, sync::Arc};
use core::ops::Range;

use align_ext::AlignExt;

use crate::{
    addr::{Paddr, Vaddr, PAGE_SIZE},
    arch::MemAttr,
    error::{Errno, Result},
    file::{MmapStrategy, OpenFlags, VmFile},
    perms::{MmapFlags, Perm},
    platform::Platform,
    providers::{AnonPages, FileCachePages, FileReadPages, PageProvider},
    return_errno_with_msg,
};

pub(crate) enum VmaBacking {
    Anon,
    File {
        file: Arc<dyn VmFile>,
        offset: u64,
        inode: u64,
        dev_id: u64,
        cache_backed: bool,
    },
}

pub struct Vma {
    range: Range<Vaddr>,
    perm: Perm,
    flags: MmapFlags,
    map_dirty: bool,
    provider: Box<dyn PageProvider>,
    backing: VmaBacking,
    platform: Arc<dyn Platform>,
}

impl Vma {
    /// An anonymous VMA. Pages are zeroed on first touch unless the
    /// mapping asked for uninitialized memory.
    pub(crate) fn new_anon(
        platform: Arc<dyn Platform>,
        range: Range<Vaddr>,
        perm: Perm,
        flags: MmapFlags,
    ) -> Self {
        let provider: Box<dyn PageProvider> = if flags.contains(MmapFlags::UNINITIALIZED) {
            Box::new(AnonPages::uninitialized(platform.clone()))
        } else {
            Box::new(AnonPages::zeroed(platform.clone()))
        };
        Vma {
            range: align_range(range),
            perm,
            flags,
            map_dirty: true,
            provider,
            backing: VmaBacking::Anon,
            platform,
        }
    }

    /// A zero-size marker at the edge of a shard's allocatable window;
    /// never intersects anything, which simplifies boundary searches.
    pub(crate) fn sentinel(platform: Arc<dyn Platform>, at: Vaddr) -> Self {
        Vma::new_anon(platform, at..at, Perm::empty(), MmapFlags::empty())
    }

    pub fn start(&self) -> Vaddr {
        self.range.start
    }

    pub fn end(&self) -> Vaddr {
        self.range.end
    }

    pub fn size(&self) -> usize {
        self.range.end - self.range.start
    }

    pub fn range(&self) -> Range<Vaddr> {
        self.range.clone()
    }

    pub fn perm(&self) -> Perm {
        self.perm
    }

    pub fn flags(&self) -> MmapFlags {
        self.flags
    }

    pub fn has_flags(&self, flags: MmapFlags) -> bool {
        self.flags.intersects(flags)
    }

    pub(crate) fn update_flags(&mut self, flags: MmapFlags) {
        self.flags |= flags;
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.range.start == self.range.end
    }

    /// Whether populated entries should start out dirty. Shared file
    /// mappings start clean so msync can harvest real writes.
    pub(crate) fn map_dirty(&self) -> bool {
        self.map_dirty
    }

    pub(crate) fn set_range(&mut self, range: Range<Vaddr>) {
        self.range = align_range(range);
    }

    pub(crate) fn protect(&mut self, perm: Perm) {
        self.perm = perm;
    }

    pub(crate) fn page_ops(&self) -> &dyn PageProvider {
        &*self.provider
    }

    pub(crate) fn backing(&self) -> &VmaBacking {
        &self.backing
    }

    /// The file offset backing `addr`, which must lie inside the VMA.
    pub(crate) fn file_offset(&self, addr: Vaddr) -> u64 {
        match &self.backing {
            VmaBacking::File { offset, .. } => *offset + (addr - self.range.start) as u64,
            VmaBacking::Anon => (addr - self.range.start) as u64,
        }
    }

    /// Checks that the backing object permits mapping with `perm`.
    pub(crate) fn validate_perm(&self, perm: Perm) -> Result<()> {
        let VmaBacking::File { file, .. } = &self.backing else {
            return Ok(());
        };
        if !file.open_flags().contains(OpenFlags::READ) {
            return_errno_with_msg!(Errno::EACCES, "mapping a file not open for reading");
        }
        if perm.contains(Perm::WRITE)
            && self.flags.contains(MmapFlags::SHARED)
            && !file.open_flags().contains(OpenFlags::WRITE)
        {
            return_errno_with_msg!(Errno::EACCES, "writable shared mapping of a read-only file");
        }
        if perm.contains(Perm::EXEC) && file.noexec_mount() {
            return_errno_with_msg!(Errno::EPERM, "executable mapping on a noexec mount");
        }
        Ok(())
    }

    /// Splits off `[edge, end)` as a new VMA of the same variant,
    /// truncating `self` to `[start, edge)`. An edge at or outside the
    /// bounds is a no-op. The caller inserts the returned tail.
    pub(crate) fn split_tail(&mut self, edge: Vaddr) -> Result<Option<Vma>> {
        if edge <= self.range.start || edge >= self.range.end {
            return Ok(None);
        }
        debug_assert_eq!(edge % PAGE_SIZE, 0);
        let tail = match &self.backing {
            VmaBacking::Anon => Vma::new_anon(
                self.platform.clone(),
                edge..self.range.end,
                self.perm,
                self.flags,
            ),
            VmaBacking::File { file, .. } => map_file_vma(
                self.platform.clone(),
                file.clone(),
                edge..self.range.end,
                self.flags,
                self.perm,
                self.file_offset(edge),
            )?,
        };
        self.range = self.range.start..edge;
        Ok(Some(tail))
    }
}

fn align_range(range: Range<Vaddr>) -> Range<Vaddr> {
    range.start.align_down(PAGE_SIZE)..range.end.align_up(PAGE_SIZE)
}

/// Builds a file-backed VMA, choosing the page provider the file asks
/// for. File mappings run on base pages.
pub(crate) fn map_file_vma(
    platform: Arc<dyn Platform>,
    file: Arc<dyn VmFile>,
    range: Range<Vaddr>,
    flags: MmapFlags,
    perm: Perm,
    offset: u64,
) -> Result<Vma> {
    let flags = flags | MmapFlags::FILE | MmapFlags::SMALL;
    let shared = flags.contains(MmapFlags::SHARED);
    let stat = file.stat()?;
    let cache_backed = file.mmap_strategy() == MmapStrategy::PageCache;
    let provider: Box<dyn PageProvider> = if cache_backed {
        Box::new(FileCachePages::new(file.clone(), offset, shared))
    } else {
        Box::new(FileReadPages::new(platform.clone(), file.clone(), offset))
    };
    let vma = Vma {
        range: align_range(range),
        perm,
        flags,
        map_dirty: !shared,
        provider,
        backing: VmaBacking::File {
            file,
            offset,
            inode: stat.inode,
            dev_id: stat.dev_id,
            cache_backed,
        },
        platform,
    };
    vma.validate_perm(perm)?;
    Ok(vma)
}

/// A fixed direct mapping of a physical range, registered for
/// introspection only; it does not participate in faulting.
pub struct LinearVma {
    pub(crate) virt: Vaddr,
    pub(crate) phys: Paddr,
    pub(crate) size: usize,
    pub(crate) mattr: MemAttr,
    pub(crate) name: String,
}

impl LinearVma {
    pub fn virt_range(&self) -> Range<Vaddr> {
        self.virt..self.virt + self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
