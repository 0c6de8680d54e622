// SPDX-License-Identifier: MPL-2.0

//! A mock platform backed by the host heap, a RAM-backed file, and the
//! end-to-end scenarios exercising the whole manager.

use alloc::{
    collections::BTreeMap,
    format,
    string::String,
    sync::Arc,
    vec,
    vec::Vec,
};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::Layout;
use std::collections::HashMap;
use std::thread;

use spin::Mutex;

use crate::{
    addr::{
        page_size_level, Paddr, Vaddr, HUGE_PAGE_SIZE, MAIN_MEM_AREA_BASE, PAGE_SIZE,
        SUPERBLOCK_AREA_BASE, SUPERBLOCK_LEN, SUPERBLOCK_SIZE, UPPER_VMA_LIMIT,
    },
    arch::ExceptionFrame,
    file::{FileStat, OpenFlags, ShmFile, VmFile},
    perms::{MmapFlags, Perm},
    platform::{Platform, Signal},
    space::{AddressSpace, Advice},
    Errno, MemAttr, Result,
};

struct AllocInfo {
    size: usize,
    freed: usize,
}

/// A platform for tests: physical pages come from the host heap and the
/// linear map is the identity.
pub(crate) struct MockPlatform {
    nr_cpus: usize,
    allocated: Mutex<BTreeMap<Paddr, AllocInfo>>,
    flushes: AtomicUsize,
    signals: Mutex<Vec<(Vaddr, Signal)>>,
    rcu_queue: Mutex<Vec<Paddr>>,
    cpu_ids: Mutex<HashMap<thread::ThreadId, usize>>,
}

impl MockPlatform {
    pub fn new_arc(nr_cpus: usize) -> Arc<MockPlatform> {
        Arc::new(MockPlatform {
            nr_cpus,
            allocated: Mutex::new(BTreeMap::new()),
            flushes: AtomicUsize::new(0),
            signals: Mutex::new(Vec::new()),
            rcu_queue: Mutex::new(Vec::new()),
            cpu_ids: Mutex::new(HashMap::new()),
        })
    }

    fn alloc_sized(&self, size: usize) -> Option<Paddr> {
        let layout = Layout::from_size_align(size, size).unwrap();
        // SAFETY: the layout is non-zero.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        self.allocated
            .lock()
            .insert(ptr as Paddr, AllocInfo { size, freed: 0 });
        Some(ptr as Paddr)
    }

    /// Pieces of a huge allocation may be freed page by page; the host
    /// allocation is returned once every byte of it has been freed.
    fn release(&self, paddr: Paddr, size: usize) {
        let mut allocated = self.allocated.lock();
        let (&base, info) = allocated
            .range_mut(..=paddr)
            .next_back()
            .expect("freeing an unknown page");
        assert!(
            paddr + size <= base + info.size,
            "freeing outside any allocation"
        );
        info.freed += size;
        assert!(info.freed <= info.size, "double free");
        if info.freed == info.size {
            let layout = Layout::from_size_align(info.size, info.size).unwrap();
            allocated.remove(&base);
            // SAFETY: `base` came from `alloc` with this layout.
            unsafe { std::alloc::dealloc(base as *mut u8, layout) };
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated
            .lock()
            .values()
            .map(|info| info.size - info.freed)
            .sum()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn signals(&self) -> Vec<(Vaddr, Signal)> {
        self.signals.lock().clone()
    }

    /// Runs the deferred frees now; tests call this at a point where no
    /// walker can be live.
    pub fn drain_rcu(&self) {
        let pages: Vec<Paddr> = self.rcu_queue.lock().drain(..).collect();
        for page in pages {
            self.release(page, PAGE_SIZE);
        }
    }
}

impl Platform for MockPlatform {
    fn alloc_page(&self) -> Option<Paddr> {
        self.alloc_sized(PAGE_SIZE)
    }

    fn alloc_huge_page(&self, size: usize) -> Option<Paddr> {
        self.alloc_sized(size)
    }

    fn free_page(&self, paddr: Paddr) {
        self.release(paddr, PAGE_SIZE);
    }

    fn free_huge_page(&self, paddr: Paddr, size: usize) {
        self.release(paddr, size);
    }

    fn phys_to_virt(&self, paddr: Paddr) -> *mut u8 {
        paddr as *mut u8
    }

    fn current_cpu(&self) -> usize {
        let id = thread::current().id();
        let mut ids = self.cpu_ids.lock();
        let next = ids.len();
        *ids.entry(id).or_insert(next % self.nr_cpus)
    }

    fn rcu_defer_free_page(&self, paddr: Paddr) {
        self.rcu_queue.lock().push(paddr);
    }

    fn flush_tlb_all(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_mmap_fault(&self, addr: Vaddr, signal: Signal, _ef: &ExceptionFrame) {
        self.signals.lock().push((addr, signal));
    }
}

impl Drop for MockPlatform {
    fn drop(&mut self) {
        let pages: Vec<Paddr> = self.rcu_queue.lock().drain(..).collect();
        for page in pages {
            self.release(page, PAGE_SIZE);
        }
    }
}

/// A RAM-backed file.
pub(crate) struct TestFile {
    data: Mutex<Vec<u8>>,
    flags: OpenFlags,
    noexec: bool,
    path: String,
    fsyncs: AtomicUsize,
}

impl TestFile {
    pub fn new(data: Vec<u8>, flags: OpenFlags) -> Arc<TestFile> {
        Arc::new(TestFile {
            data: Mutex::new(data),
            flags,
            noexec: false,
            path: String::from("/tmp/testfile"),
            fsyncs: AtomicUsize::new(0),
        })
    }

    pub fn new_noexec(data: Vec<u8>, flags: OpenFlags) -> Arc<TestFile> {
        Arc::new(TestFile {
            data: Mutex::new(data),
            flags,
            noexec: true,
            path: String::from("/tmp/testfile"),
            fsyncs: AtomicUsize::new(0),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn fsync_count(&self) -> usize {
        self.fsyncs.load(Ordering::Relaxed)
    }
}

impl VmFile for TestFile {
    fn open_flags(&self) -> OpenFlags {
        self.flags
    }

    fn stat(&self) -> Result<FileStat> {
        Ok(FileStat {
            size: self.data.lock().len() as u64,
            inode: 42,
            dev_id: 0x801,
        })
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn fsync(&self) -> Result<()> {
        self.fsyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn noexec_mount(&self) -> bool {
        self.noexec
    }

    fn path(&self) -> &str {
        &self.path
    }
}

fn space(nr_cpus: usize) -> (Arc<MockPlatform>, AddressSpace) {
    let platform = MockPlatform::new_arc(nr_cpus);
    let space = AddressSpace::new(platform.clone(), nr_cpus).unwrap();
    (platform, space)
}

fn ef(write: bool) -> ExceptionFrame {
    ExceptionFrame {
        pc: 0x7000_0000,
        error_code: if write { 0x2 } else { 0x0 },
    }
}

/// Emulates the MMU: translates `va`, honoring the writable bit.
fn translate(space: &AddressSpace, va: Vaddr, write: bool) -> Option<Paddr> {
    let mut result = None;
    space.visit_pte_rcu(va, |r| {
        if let Some((pte, level)) = r {
            if pte.is_present() && (!write || pte.is_writable()) {
                result = Some(pte.paddr() + (va & (page_size_level(level) - 1)));
            }
        }
    });
    result
}

/// Emulates one memory access: translate, fault on a miss, retry once.
fn access(space: &AddressSpace, va: Vaddr, write: bool) -> Option<Paddr> {
    if let Some(pa) = translate(space, va, write) {
        return Some(pa);
    }
    space.vm_fault(va, &ef(write));
    translate(space, va, write)
}

fn write_byte(space: &AddressSpace, platform: &MockPlatform, va: Vaddr, value: u8) -> bool {
    match access(space, va, true) {
        Some(pa) => {
            // SAFETY: the page was just installed and stays alive.
            unsafe { *platform.phys_to_virt(pa) = value };
            true
        }
        None => false,
    }
}

fn read_byte(space: &AddressSpace, platform: &MockPlatform, va: Vaddr) -> Option<u8> {
    // SAFETY: the page was just installed and stays alive.
    access(space, va, false).map(|pa| unsafe { *platform.phys_to_virt(pa) })
}

#[test]
fn anon_mapping_faults_in_and_reads_zero() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, 8192, MmapFlags::empty(), Perm::RW)
        .unwrap();
    assert!((SUPERBLOCK_AREA_BASE..MAIN_MEM_AREA_BASE).contains(&p));

    // Fresh anonymous memory reads as zero.
    assert_eq!(read_byte(&space, &platform, p), Some(0));
    assert!(write_byte(&space, &platform, p, 0xab));
    assert!(write_byte(&space, &platform, p + 4095, 0xab));
    assert_eq!(read_byte(&space, &platform, p), Some(0xab));

    // One byte past the mapping segfaults.
    assert_eq!(access(&space, p + 8192, false), None);
    assert_eq!(platform.signals().last(), Some(&(p + 8192, Signal::Segv)));

    drop(space);
    platform.drain_rcu();
    assert_eq!(platform.allocated_bytes(), 0);
}

#[test]
fn fault_adjacent_to_vma_segfaults() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    assert_eq!(access(&space, p - 1, false), None);
    assert_eq!(access(&space, p + PAGE_SIZE, false), None);
    let signals = platform.signals();
    assert_eq!(signals.len(), 2);
    assert!(signals.iter().all(|&(_, s)| s == Signal::Segv));
}

#[test]
fn populate_then_mprotect_widens_access() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, PAGE_SIZE, MmapFlags::POPULATE, Perm::READ)
        .unwrap();

    // Populated and readable without a fault.
    assert!(translate(&space, p, false).is_some());

    // Writing is a permission fault.
    assert!(!write_byte(&space, &platform, p, 1));
    assert_eq!(platform.signals().last(), Some(&(p, Signal::Segv)));

    space.mprotect(p, PAGE_SIZE, Perm::RW).unwrap();
    assert!(write_byte(&space, &platform, p, 1));

    let mut vec = [0u8; 1];
    space.mincore(p, PAGE_SIZE, &mut vec).unwrap();
    assert_eq!(vec[0], 1);
}

#[test]
fn mprotect_is_idempotent_and_none_blocks_reads() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, 2 * PAGE_SIZE, MmapFlags::POPULATE, Perm::RW)
        .unwrap();

    space.mprotect(p, 2 * PAGE_SIZE, Perm::READ).unwrap();
    let flushes = platform.flush_count();
    // Re-protecting with the same permissions touches nothing.
    space.mprotect(p, 2 * PAGE_SIZE, Perm::READ).unwrap();
    assert_eq!(platform.flush_count(), flushes);

    space.mprotect(p, 2 * PAGE_SIZE, Perm::empty()).unwrap();
    assert_eq!(access(&space, p, false), None);
    assert_eq!(platform.signals().last(), Some(&(p, Signal::Segv)));

    // And back: the pages are still attached.
    space.mprotect(p, 2 * PAGE_SIZE, Perm::READ).unwrap();
    assert_eq!(read_byte(&space, &platform, p), Some(0));
}

#[test]
fn mprotect_splits_at_page_boundaries() {
    let (_platform, space) = space(1);
    let p = space
        .map_anon(0, 4 * PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();

    space
        .mprotect(p + PAGE_SIZE, 2 * PAGE_SIZE, Perm::READ)
        .unwrap();
    let ranges = space.vma_ranges();
    assert_eq!(ranges.len(), 3);

    // Protecting exactly a whole VMA splits nothing further.
    space.mprotect(p + PAGE_SIZE, 2 * PAGE_SIZE, Perm::RW).unwrap();
    assert_eq!(space.vma_ranges().len(), 3);
}

#[test]
fn file_mapping_reads_contents_with_zeroed_tail() {
    let (platform, space) = space(1);
    let mut data = vec![0u8; 10000];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let file = TestFile::new(data, OpenFlags::READ);
    let p = space
        .map_file(0, 16384, MmapFlags::SHARED, Perm::READ, file.clone(), 0)
        .unwrap();

    assert_eq!(read_byte(&space, &platform, p + 9999), Some((9999 % 251) as u8));
    // The tail of the page containing EOF reads as zero.
    assert_eq!(read_byte(&space, &platform, p + 10000), Some(0));
    assert_eq!(read_byte(&space, &platform, p + 12000), Some(0));

    // A page wholly past EOF raises SIGBUS.
    assert_eq!(access(&space, p + 12288, false), None);
    assert_eq!(platform.signals().last(), Some(&(p + 12288, Signal::Bus)));
}

#[test]
fn file_mapping_permission_checks() {
    let (_platform, space) = space(1);
    let ro = TestFile::new(vec![0u8; 4096], OpenFlags::READ);
    // A writable shared mapping of a read-only file is refused.
    let err = space
        .map_file(0, 4096, MmapFlags::SHARED, Perm::RW, ro.clone(), 0)
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EACCES);
    // A private one is fine.
    space
        .map_file(0, 4096, MmapFlags::empty(), Perm::RW, ro, 0)
        .unwrap();

    let noexec = TestFile::new_noexec(vec![0u8; 4096], OpenFlags::READ);
    let err = space
        .map_file(0, 4096, MmapFlags::empty(), Perm::READ | Perm::EXEC, noexec, 0)
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EPERM);
}

#[test]
fn huge_page_fault_split_and_protect() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, HUGE_PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    assert_eq!(p % HUGE_PAGE_SIZE, 0);

    // A single write installs one huge-page entry.
    assert!(write_byte(&space, &platform, p + 0x1234, 0x5a));
    space.visit_pte_rcu(p, |r| {
        let (pte, level) = r.unwrap();
        assert_eq!(level, 1);
        assert!(pte.is_large());
    });

    // An unaligned fault in the interior still rounds down to the huge
    // page; the write above already covers the whole 2 MiB.
    assert_eq!(
        read_byte(&space, &platform, p + HUGE_PAGE_SIZE - 1),
        Some(0)
    );

    space.madvise(p, HUGE_PAGE_SIZE, Advice::NoHugePage).unwrap();
    space.visit_pte_rcu(p + 0x1000, |r| {
        let (pte, level) = r.unwrap();
        assert_eq!(level, 0);
        assert!(!pte.is_large());
    });
    // The split preserves contents.
    assert_eq!(read_byte(&space, &platform, p + 0x1234), Some(0x5a));

    // Restricting the split range costs exactly one TLB flush.
    let flushes = platform.flush_count();
    space.mprotect(p, HUGE_PAGE_SIZE, Perm::READ).unwrap();
    assert_eq!(platform.flush_count(), flushes + 1);

    drop(space);
    platform.drain_rcu();
    assert_eq!(platform.allocated_bytes(), 0);
}

#[test]
fn small_mappings_never_use_huge_pages() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, HUGE_PAGE_SIZE, MmapFlags::SMALL, Perm::RW)
        .unwrap();
    assert!(write_byte(&space, &platform, p, 1));
    space.visit_pte_rcu(p, |r| {
        let (_, level) = r.unwrap();
        assert_eq!(level, 0);
    });
}

#[test]
fn concurrent_anon_mappings_do_not_overlap() {
    let nr = 4;
    let (platform, space) = space(nr);
    let space = Arc::new(space);

    let mut handles = Vec::new();
    for _ in 0..nr {
        let space = space.clone();
        handles.push(thread::spawn(move || {
            space
                .map_anon(0, 1 << 20, MmapFlags::empty(), Perm::RW)
                .unwrap()
        }));
    }
    let mut ranges: Vec<(Vaddr, Vaddr)> = handles
        .into_iter()
        .map(|h| {
            let start = h.join().unwrap();
            (start, start + (1 << 20))
        })
        .collect();
    ranges.sort();

    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping mappings: {:x?}", pair);
    }
    // Each mapping stays inside one superblock.
    for &(start, end) in &ranges {
        assert_eq!(
            (start - SUPERBLOCK_AREA_BASE) / SUPERBLOCK_SIZE,
            (end - 1 - SUPERBLOCK_AREA_BASE) / SUPERBLOCK_SIZE
        );
    }
    assert_eq!(space.all_vmas_size(), nr * (1 << 20));

    drop(space);
    platform.drain_rcu();
    assert_eq!(platform.allocated_bytes(), 0);
}

#[test]
fn munmap_restores_the_address_space() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, 3 * PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    assert!(write_byte(&space, &platform, p + PAGE_SIZE, 7));
    assert!(space.procfs_maps().contains(&format!("{:x}-{:x}", p, p + 3 * PAGE_SIZE)));

    space.munmap(p, 3 * PAGE_SIZE).unwrap();
    assert_eq!(space.procfs_maps(), "");
    assert!(space.vma_ranges().is_empty());
    assert!(!space.ismapped(p, PAGE_SIZE));

    // The hole coalesced back into one interval covering the whole
    // claimed superblock.
    let free = space.free_ranges_at(p);
    assert_eq!(free, [(p, SUPERBLOCK_SIZE)]);
}

#[test]
fn munmap_requires_the_whole_range_mapped() {
    let (_platform, space) = space(1);
    let p = space
        .map_anon(0, 2 * PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    let err = space.munmap(p, 4 * PAGE_SIZE).unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);
    // The mapping survives a failed munmap.
    assert!(space.ismapped(p, 2 * PAGE_SIZE));

    // Unmapping the middle splits the VMA in two.
    let p = space
        .map_anon(0, 3 * PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    space.munmap(p + PAGE_SIZE, PAGE_SIZE).unwrap();
    assert!(space.ismapped(p, PAGE_SIZE));
    assert!(!space.ismapped(p + PAGE_SIZE, PAGE_SIZE));
    assert!(space.ismapped(p + 2 * PAGE_SIZE, PAGE_SIZE));
}

#[test]
fn munmap_anon_removes_the_whole_vma() {
    let (_platform, space) = space(1);
    let p = space
        .map_anon(0, 4 * PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    space.munmap_anon(p + PAGE_SIZE).unwrap();
    assert!(!space.ismapped(p, PAGE_SIZE));
    let err = space.munmap_anon(p).unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);
}

#[test]
fn fixed_mapping_replaces_the_existing_one() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, 2 * PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    assert!(write_byte(&space, &platform, p, 0xcc));

    let q = space
        .map_anon(p, 2 * PAGE_SIZE, MmapFlags::FIXED, Perm::RW)
        .unwrap();
    assert_eq!(p, q);
    // The old contents are gone; the range faults in fresh zeroed pages.
    assert_eq!(read_byte(&space, &platform, p), Some(0));
    assert_eq!(space.all_vmas_size(), 2 * PAGE_SIZE);
}

#[test]
fn fixed_mapping_validates_the_address() {
    let (_platform, space) = space(1);
    let err = space
        .map_anon(0x123, PAGE_SIZE, MmapFlags::FIXED, Perm::RW)
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);
    let err = space
        .map_anon(UPPER_VMA_LIMIT, PAGE_SIZE, MmapFlags::FIXED, Perm::RW)
        .unwrap_err();
    assert_eq!(err.errno(), Errno::EINVAL);

    // A fixed mapping below the superblock area lives in the shared
    // shard.
    let p = space
        .map_anon(0x10000, PAGE_SIZE, MmapFlags::FIXED, Perm::RW)
        .unwrap();
    assert_eq!(p, 0x10000);
}

#[test]
fn msync_writes_dirty_pages_back() {
    let (platform, space) = space(1);
    let file = TestFile::new(vec![0u8; 2 * PAGE_SIZE], OpenFlags::READ | OpenFlags::WRITE);
    let p = space
        .map_file(0, 2 * PAGE_SIZE, MmapFlags::SHARED, Perm::RW, file.clone(), 0)
        .unwrap();

    assert!(write_byte(&space, &platform, p + 100, 0x77));
    space.msync(p, 2 * PAGE_SIZE).unwrap();
    assert_eq!(file.contents()[100], 0x77);
    assert_eq!(file.fsync_count(), 1);

    // Nothing dirty anymore: the second sync writes nothing.
    space.msync(p, 2 * PAGE_SIZE).unwrap();
    assert_eq!(file.fsync_count(), 1);

    // Re-reading the synced page sees the written byte.
    space.madvise(p, 2 * PAGE_SIZE, Advice::DontNeed).unwrap();
    assert_eq!(read_byte(&space, &platform, p + 100), Some(0x77));
}

#[test]
fn msync_refuses_private_and_unmapped_ranges() {
    let (_platform, space) = space(1);
    let file = TestFile::new(vec![0u8; PAGE_SIZE], OpenFlags::READ | OpenFlags::WRITE);
    let p = space
        .map_file(0, PAGE_SIZE, MmapFlags::empty(), Perm::RW, file, 0)
        .unwrap();
    assert_eq!(space.msync(p, PAGE_SIZE).unwrap_err().errno(), Errno::ENOMEM);

    let q = space
        .map_anon(0, PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    space.munmap(q, PAGE_SIZE).unwrap();
    assert_eq!(space.msync(q, PAGE_SIZE).unwrap_err().errno(), Errno::ENOMEM);
}

#[test]
fn madvise_dontneed_drops_anon_pages() {
    let (platform, space) = space(1);
    let p = space
        .map_anon(0, 2 * PAGE_SIZE, MmapFlags::empty(), Perm::RW)
        .unwrap();
    assert!(write_byte(&space, &platform, p, 0xee));
    space.madvise(p, 2 * PAGE_SIZE, Advice::DontNeed).unwrap();
    // The mapping stays; the contents are gone.
    assert_eq!(read_byte(&space, &platform, p), Some(0));

    let err = space
        .madvise(p + 4 * PAGE_SIZE, PAGE_SIZE, Advice::DontNeed)
        .unwrap_err();
    assert_eq!(err.errno(), Errno::ENOMEM);
}

#[test]
fn shm_mappings_share_backing_pages() {
    let platform = MockPlatform::new_arc(1);
    let space = AddressSpace::new(platform.clone(), 1).unwrap();
    let shm = Arc::new(ShmFile::new(platform.clone(), 4 << 20));

    let a = space
        .map_file(0, 1 << 20, MmapFlags::SHARED, Perm::RW, shm.clone(), 0)
        .unwrap();
    let b = space
        .map_file(0, 1 << 20, MmapFlags::SHARED, Perm::RW, shm.clone(), 0)
        .unwrap();
    assert_ne!(a, b);

    assert!(write_byte(&space, &platform, a + 123, 0x42));
    assert_eq!(read_byte(&space, &platform, b + 123), Some(0x42));

    // Unmapping does not free the file's pages.
    space.munmap(a, 1 << 20).unwrap();
    assert_eq!(read_byte(&space, &platform, b + 123), Some(0x42));

    drop(space);
    drop(shm);
    platform.drain_rcu();
    assert_eq!(platform.allocated_bytes(), 0);
}

#[test]
fn linear_map_translates_and_registers() {
    let (platform, space) = space(1);
    let virt = MAIN_MEM_AREA_BASE + 0x100000;
    let phys = 0x8000_0000;
    space
        .linear_map(virt, phys, 2 * PAGE_SIZE, "pci-bar", PAGE_SIZE, MemAttr::Device)
        .unwrap();

    assert_eq!(space.virt_to_phys(virt + 0x1010), Some(phys + 0x1010));
    assert!(space.is_linear_mapped(virt, 2 * PAGE_SIZE));

    let maps = space.sysfs_linear_maps();
    assert!(maps.contains("pci-bar"));
    assert!(maps.contains(" d "));

    let mut vec = [0u8; 2];
    space.mincore(virt, 2 * PAGE_SIZE, &mut vec).unwrap();
    assert_eq!(vec, [1, 1]);

    drop(space);
    platform.drain_rcu();
    assert_eq!(platform.allocated_bytes(), 0);
}

#[test]
fn kernel_ranges_populate_and_clean_up() {
    let (platform, space) = space(1);
    let addr = UPPER_VMA_LIMIT + (1 << 30);

    let populated = space.kernel_populate(addr, 2 * PAGE_SIZE).unwrap();
    assert_eq!(populated, 2 * PAGE_SIZE);
    let pa = space.virt_to_phys(addr).unwrap();
    // SAFETY: kernel_populate just installed this page.
    unsafe { assert_eq!(*platform.phys_to_virt(pa), 0) };

    space.kernel_depopulate(addr, 2 * PAGE_SIZE).unwrap();
    assert_eq!(space.virt_to_phys(addr), None);

    // Table reclamation works on whole huge-page-sized slots.
    let before = platform.allocated_bytes();
    space.kernel_cleanup(addr, HUGE_PAGE_SIZE).unwrap();
    platform.drain_rcu();
    assert!(platform.allocated_bytes() < before);
}

#[test]
fn procfs_maps_format() {
    let (_platform, space) = space(1);
    let file = TestFile::new(vec![1u8; 2 * PAGE_SIZE], OpenFlags::READ);
    let fp = space
        .map_file(0, PAGE_SIZE, MmapFlags::empty(), Perm::READ, file, PAGE_SIZE as u64)
        .unwrap();
    let ap = space
        .map_anon(0, PAGE_SIZE, MmapFlags::empty(), Perm::RWX)
        .unwrap();

    let maps = space.procfs_maps();
    assert!(maps.contains(&format!(
        "{:x}-{:x} r--p 00001000 08:01 42 /tmp/testfile\n",
        fp,
        fp + PAGE_SIZE
    )));
    assert!(maps.contains(&format!(
        "{:x}-{:x} rwxp 00000000 00:00 0\n",
        ap,
        ap + PAGE_SIZE
    )));
}

#[test]
fn out_of_virtual_space_reports_enomem() {
    let (_platform, space) = space(1);
    // More than the whole superblock area can hold.
    let err = space
        .map_anon(
            0,
            (SUPERBLOCK_LEN + 1) * SUPERBLOCK_SIZE,
            MmapFlags::empty(),
            Perm::RW,
        )
        .unwrap_err();
    assert_eq!(err.errno(), Errno::ENOMEM);
}
