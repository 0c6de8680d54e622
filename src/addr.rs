// SPDX-License-Identifier: MPL-2.0

//! Address-space layout constants and helpers.
//!
//! The user window `[LOWER_VMA_LIMIT, UPPER_VMA_LIMIT)` is split in two:
//! `[SUPERBLOCK_AREA_BASE, MAIN_MEM_AREA_BASE)` is carved into fixed-size
//! superblocks that CPUs claim exclusively, and everything outside that
//! region belongs to a single shared shard. The linear map of physical
//! memory starts at `MAIN_MEM_AREA_BASE`.

use static_assertions::const_assert;

/// A virtual address.
pub type Vaddr = usize;
/// A physical address.
pub type Paddr = usize;

pub const PAGE_SIZE_SHIFT: usize = 12;
/// The size of a base page.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_SHIFT;

pub const PTE_PER_PAGE_SHIFT: usize = 9;
/// The number of entries in one page-table node.
pub const PTE_PER_PAGE: usize = 1 << PTE_PER_PAGE_SHIFT;

/// The number of page-table levels below the root.
pub const NR_LEVELS: usize = 4;

/// The number of leaf page sizes the hardware supports (4 KiB and 2 MiB).
pub const NR_PAGE_SIZES: usize = 2;

/// The size of a huge page.
pub const HUGE_PAGE_SIZE: usize = page_size_level(1);

/// The lowest virtual address a VMA may start at.
pub const LOWER_VMA_LIMIT: Vaddr = 0;
/// The base of the CPU-sharded superblock region.
pub const SUPERBLOCK_AREA_BASE: Vaddr = 0x2000_0000_0000;
/// The base of the linear physical-memory map; also the end of the region
/// in which VMAs may live.
pub const MAIN_MEM_AREA_BASE: Vaddr = 0x4000_0000_0000;
/// The lowest virtual address above all VMAs.
pub const UPPER_VMA_LIMIT: Vaddr = MAIN_MEM_AREA_BASE;

/// The size of one superblock.
pub const SUPERBLOCK_SIZE: usize = 1 << 30;
/// The number of superblocks in the sharded region.
pub const SUPERBLOCK_LEN: usize = (MAIN_MEM_AREA_BASE - SUPERBLOCK_AREA_BASE) / SUPERBLOCK_SIZE;

/// The end of the address window tracked by the shared shard's free-range
/// map. Covers the linear map region above `MAIN_MEM_AREA_BASE`.
pub const ADDRESS_SPACE_END: Vaddr = 1 << 62;

/// The most CPUs the superblock owner byte can encode; `u8::MAX` marks a
/// free superblock.
pub const MAX_CPUS: usize = 254;

const_assert!(LOWER_VMA_LIMIT < SUPERBLOCK_AREA_BASE);
const_assert!(SUPERBLOCK_AREA_BASE < MAIN_MEM_AREA_BASE);
const_assert!(SUPERBLOCK_SIZE.is_power_of_two());
const_assert!((MAIN_MEM_AREA_BASE - SUPERBLOCK_AREA_BASE) % SUPERBLOCK_SIZE == 0);
const_assert!(core::mem::size_of::<usize>() == 8);

/// The size of the virtual range one PTE covers at the given level.
pub const fn page_size_level(level: usize) -> usize {
    1 << (PAGE_SIZE_SHIFT + PTE_PER_PAGE_SHIFT * level)
}

/// The index of `virt`'s PTE within a page-table node at the given level.
pub const fn pt_index(virt: Vaddr, level: usize) -> usize {
    (virt >> (PAGE_SIZE_SHIFT + PTE_PER_PAGE_SHIFT * level)) & (PTE_PER_PAGE - 1)
}

/// Extends bit 47 through the upper bits so that page-table index
/// arithmetic lands on canonical addresses.
pub const fn sign_extend_47(virt: Vaddr) -> Vaddr {
    (((virt as i64) << 16) >> 16) as u64 as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_sizes_per_level() {
        assert_eq!(page_size_level(0), 4096);
        assert_eq!(page_size_level(1), 2 << 20);
        assert_eq!(page_size_level(2), 1 << 30);
        assert_eq!(HUGE_PAGE_SIZE, 0x20_0000);
    }

    #[test]
    fn pte_indexing() {
        assert_eq!(pt_index(0, 0), 0);
        assert_eq!(pt_index(PAGE_SIZE, 0), 1);
        assert_eq!(pt_index(HUGE_PAGE_SIZE, 0), 0);
        assert_eq!(pt_index(HUGE_PAGE_SIZE, 1), 1);
        assert_eq!(pt_index(SUPERBLOCK_AREA_BASE, 3), 64);
    }

    #[test]
    fn canonical_sign_extension() {
        assert_eq!(sign_extend_47(0x2000_0000_0000), 0x2000_0000_0000);
        assert_eq!(sign_extend_47(0x8000_0000_0000), 0xffff_8000_0000_0000);
    }
}
