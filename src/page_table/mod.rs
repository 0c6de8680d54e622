// SPDX-License-Identifier: MPL-2.0

//! The generic page-table walker.
//!
//! [`map_range`] recurses over the paging hierarchy and applies a
//! [`PageTableOp`] to every entry covering a virtual range. The operation
//! decides whether missing intermediate tables are allocated, whether huge
//! leaves are split, and what happens at each PTE; the walker owns the
//! traversal, carries the path on its own recursion (tables hold no parent
//! pointers), and never descends past the operation's smallest page size.
//!
//! Entries are modified in place through [`Ptep`], a pointer to one slot
//! of a live table. Installing an intermediate table races against
//! concurrent faults and is resolved by compare-and-swap; the loser frees
//! the table it allocated.

pub mod ops;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    addr::{
        page_size_level, pt_index, sign_extend_47, Paddr, Vaddr, NR_LEVELS, NR_PAGE_SIZES,
        PAGE_SIZE, PTE_PER_PAGE,
    },
    arch::Pte,
    error::{Errno, Error, Result},
    platform::Platform,
};

/// A pointer to one entry of a live page table.
///
/// Reads and writes go through atomics: the fault path updates entries
/// under a shard read lock, relying on compare-and-swap to serialize
/// concurrent installs.
pub struct Ptep {
    slot: *const AtomicU64,
    level: usize,
}

impl Ptep {
    /// # Safety
    ///
    /// `slot` must point at a PTE inside a live page-table node (or at the
    /// root entry) that outlives the walk using it.
    pub(crate) unsafe fn from_slot(slot: *const AtomicU64, level: usize) -> Self {
        Ptep { slot, level }
    }

    /// The level of the table this entry lives in; 0 is the leaf level.
    pub fn level(&self) -> usize {
        self.level
    }

    /// The size of the virtual range this entry covers.
    pub fn page_size(&self) -> usize {
        page_size_level(self.level)
    }

    pub fn read(&self) -> Pte {
        Pte::from_raw(unsafe { &*self.slot }.load(Ordering::Acquire))
    }

    pub fn write(&self, pte: Pte) {
        unsafe { &*self.slot }.store(pte.raw(), Ordering::Release);
    }

    /// Installs `new` if the entry still holds `old`.
    pub fn compare_exchange(&self, old: Pte, new: Pte) -> bool {
        unsafe { &*self.slot }
            .compare_exchange(old.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What a walk does at each page-table entry.
///
/// The `page` callback is invoked on entries whose coverage is wholly
/// inside the walked range and whose level is below `nr_page_sizes`; a
/// `true` return means the entry was handled at that size, `false` asks
/// the walker to descend and handle it with smaller pages.
pub trait PageTableOp {
    /// Allocate missing intermediate tables instead of skipping the range.
    fn allocate_intermediate(&self) -> bool;

    /// Do not invoke `page` on empty entries.
    fn skip_empty(&self) -> bool {
        true
    }

    /// Descend into existing child tables rather than calling `page` on
    /// the intermediate entry.
    fn descend(&self) -> bool {
        true
    }

    /// Stop after the first entry.
    fn once(&self) -> bool {
        false
    }

    /// Split huge leaves encountered above the operating level.
    fn split_large(&self) -> bool {
        true
    }

    /// The number of leaf sizes the operation may install or handle.
    fn nr_page_sizes(&self) -> usize {
        NR_PAGE_SIZES
    }

    /// Handles a leaf-capable entry. `offset` is the distance from the
    /// start of the VMA the walk was rooted at.
    fn page(&mut self, ptep: &Ptep, offset: usize) -> bool;

    /// Called just before descending into a huge-capable entry mapped by
    /// smaller pages.
    fn intermediate_page_pre(&mut self, _ptep: &Ptep, _offset: usize) {}

    /// Called just after ascending from a huge-capable entry mapped by
    /// smaller pages.
    fn intermediate_page_post(&mut self, _ptep: &Ptep, _offset: usize) {}

    /// Handles a sub-range of a huge leaf when splitting is disabled.
    fn sub_page(&mut self, _ptep: &Ptep, _level: usize, _offset: usize) {}

    /// Stop the walk early; the operation hit a terminal condition.
    fn aborted(&self) -> bool {
        false
    }

    /// Whether a global TLB flush is required once the walk completes.
    /// May release batched pages held back until the flush.
    fn tlb_flush_needed(&mut self) -> bool {
        false
    }

    /// Runs after the walk and the TLB flush.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// The number of bytes the operation accounted.
    fn account_results(&self) -> usize {
        0
    }
}

/// The root of a paging hierarchy: a single synthetic entry above the
/// top-level table, so the walker treats the root like any other level.
pub(crate) struct RootTable {
    root_pte: AtomicU64,
}

impl RootTable {
    pub fn new(platform: &dyn Platform) -> Result<Self> {
        let pa = platform
            .alloc_page()
            .ok_or_else(|| Error::with_msg(Errno::ENOMEM, "no page for the root table"))?;
        // SAFETY: the fresh table is exclusively ours until published.
        unsafe { core::ptr::write_bytes(platform.phys_to_virt(pa), 0, PAGE_SIZE) };
        Ok(RootTable {
            root_pte: AtomicU64::new(Pte::new_table(pa).raw()),
        })
    }

    pub fn paddr(&self) -> Paddr {
        Pte::from_raw(self.root_pte.load(Ordering::Acquire)).paddr()
    }

    fn ptep(&self) -> Ptep {
        // SAFETY: the root entry lives as long as `self`.
        unsafe { Ptep::from_slot(&self.root_pte, NR_LEVELS) }
    }
}

fn clamp(vstart: &mut Vaddr, vend: &mut Vaddr, min: Vaddr, max: Vaddr, slop: usize) {
    *vstart &= !(slop - 1);
    *vend |= slop - 1;
    *vstart = (*vstart).max(min);
    *vend = (*vend).min(max);
}

/// Allocates an empty table and installs it at `parent`. Losing the
/// install race is not an error; the loser frees its table and the caller
/// re-reads the entry.
fn allocate_intermediate_level(platform: &dyn Platform, parent: &Ptep) -> Result<()> {
    let pa = platform
        .alloc_page()
        .ok_or_else(|| Error::with_msg(Errno::ENOMEM, "no page for an intermediate table"))?;
    // SAFETY: the fresh table is exclusively ours until the CAS below.
    unsafe { core::ptr::write_bytes(platform.phys_to_virt(pa), 0, PAGE_SIZE) };
    if !parent.compare_exchange(Pte::empty(), Pte::new_table(pa)) {
        platform.free_page(pa);
    }
    Ok(())
}

/// Replaces a huge leaf with a table of next-level entries inheriting the
/// physical range incrementally. The backing allocator guarantees pieces
/// of a huge allocation may later be freed page by page.
fn split_large_page(platform: &dyn Platform, parent: &Ptep) -> Result<()> {
    let level = parent.level();
    debug_assert!(level >= 1);
    let org = parent.read();
    debug_assert!(org.is_large());

    let pa = platform
        .alloc_page()
        .ok_or_else(|| Error::with_msg(Errno::ENOMEM, "no page to split a huge mapping"))?;
    let child = org.with_large(level - 1 > 0);
    let child_size = page_size_level(level - 1);
    let table = platform.phys_to_virt(pa) as *mut u64;
    for i in 0..PTE_PER_PAGE {
        // SAFETY: the fresh table is exclusively ours until the CAS below.
        unsafe {
            table
                .add(i)
                .write(child.with_paddr(child.paddr() + i * child_size).raw())
        };
    }
    if !parent.compare_exchange(org, Pte::new_table(pa)) {
        // Someone else split (or unmapped) the entry first.
        platform.free_page(pa);
    }
    Ok(())
}

fn walk_level<O: PageTableOp>(
    platform: &dyn Platform,
    op: &mut O,
    parent: &Ptep,
    vma_start: Vaddr,
    vcur: Vaddr,
    vend: Vaddr, // inclusive
    base_virt: Vaddr,
    slop: usize,
) -> Result<()> {
    let level = parent.level() - 1;

    loop {
        let ppte = parent.read();
        if ppte.is_empty() {
            if !op.allocate_intermediate() {
                return Ok(());
            }
            allocate_intermediate_level(platform, parent)?;
            continue;
        }
        if ppte.is_large() {
            if op.split_large() {
                split_large_page(platform, parent)?;
                continue;
            }
            op.sub_page(parent, parent.level(), base_virt.wrapping_sub(vma_start));
            return Ok(());
        }
        break;
    }

    let table = platform.phys_to_virt(parent.read().paddr()) as *const AtomicU64;
    let step = page_size_level(level);
    let idx = pt_index(vcur, level);
    let eidx = pt_index(vend, level);
    let mut base_virt = sign_extend_47(base_virt.wrapping_add(idx * step));

    for idx in idx..=eidx {
        // SAFETY: `table` is a live page-table node and `idx` is in bounds.
        let ptep = unsafe { Ptep::from_slot(table.add(idx), level) };
        let mut vstart1 = vcur;
        let mut vend1 = vend;
        clamp(
            &mut vstart1,
            &mut vend1,
            base_virt,
            base_virt.wrapping_add(step - 1),
            slop,
        );
        if level < op.nr_page_sizes()
            && vstart1 == base_virt
            && vend1 == base_virt.wrapping_add(step - 1)
        {
            let offset = base_virt.wrapping_sub(vma_start);
            let skip = op.skip_empty() && ptep.read().is_empty();
            if level > 0 {
                if !skip {
                    let pte = ptep.read();
                    let descend = op.descend() && !pte.is_empty() && !pte.is_large();
                    if descend || !op.page(&ptep, offset) {
                        op.intermediate_page_pre(&ptep, offset);
                        walk_level(platform, op, &ptep, vma_start, vstart1, vend1, base_virt, slop)?;
                        op.intermediate_page_post(&ptep, offset);
                    }
                }
            } else if !skip {
                op.page(&ptep, offset);
            }
        } else if level > 0 {
            walk_level(platform, op, &ptep, vma_start, vstart1, vend1, base_virt, slop)?;
        }
        base_virt = sign_extend_47(base_virt.wrapping_add(step));
        if op.once() || op.aborted() {
            break;
        }
    }
    Ok(())
}

/// Walks `[vstart, vstart + size)` applying `op`, then issues the
/// architecture's page-table write barrier.
pub(crate) fn map_range<O: PageTableOp>(
    platform: &dyn Platform,
    root: &RootTable,
    op: &mut O,
    vma_start: Vaddr,
    vstart: Vaddr,
    size: usize,
    slop: usize,
) -> Result<()> {
    debug_assert!(size > 0);
    let res = walk_level(
        platform,
        op,
        &root.ptep(),
        vma_start,
        vstart,
        vstart + (size - 1),
        0,
        slop,
    );
    // Force page-table writes to complete before newly mapped memory is
    // touched; only does something on weakly ordered architectures.
    platform.synchronize_page_table_modifications();
    res
}

/// Runs `op` over a page-aligned range, performing the batched global TLB
/// flush the operation asks for at exit, and returns what it accounted.
pub(crate) fn operate_range<O: PageTableOp>(
    platform: &dyn Platform,
    root: &RootTable,
    mut op: O,
    vma_start: Vaddr,
    start: Vaddr,
    size: usize,
) -> Result<usize> {
    use align_ext::AlignExt;

    let start = start.align_down(PAGE_SIZE);
    let size = size.align_up(PAGE_SIZE).max(PAGE_SIZE);
    let walked = map_range(platform, root, &mut op, vma_start, start, size, PAGE_SIZE);
    if op.tlb_flush_needed() {
        platform.flush_tlb_all();
    }
    let finalized = op.finalize();
    walked?;
    finalized?;
    Ok(op.account_results())
}
