// SPDX-License-Identifier: MPL-2.0

//! x86-64 page-table entries.

use bitflags::bitflags;

use super::MemAttr;
use crate::{
    addr::{Paddr, Vaddr},
    perms::Perm,
};

bitflags! {
    /// The bits of an x86-64 page-table entry.
    pub struct PteFlags: u64 {
        /// The mapping can be reached; on x86 this also implies readability.
        const PRESENT =       1 << 0;
        /// Writes are allowed.
        const WRITABLE =      1 << 1;
        /// Accessible from user mode.
        const USER =          1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Accesses bypass the cache.
        const NO_CACHE =      1 << 4;
        /// The page has been read or written.
        const ACCESSED =      1 << 5;
        /// The page has been written.
        const DIRTY =         1 << 6;
        /// The entry maps a huge page rather than a child table.
        /// Only meaningful on intermediate levels.
        const LARGE =         1 << 7;
        /// Survives a non-global TLB flush.
        const GLOBAL =        1 << 8;
        /// Software: writable requests must be downgraded (copy-on-write).
        const COW =           1 << 9;
        /// Instruction fetches are disallowed.
        const NO_EXECUTE =    1 << 63;
    }
}

/// The bits of a PTE that hold the physical address.
pub const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One page-table entry.
///
/// An all-zero entry is empty: it maps nothing and carries no software
/// state. A non-empty entry without `PRESENT` is a mapping whose
/// permissions have been stripped (`mprotect(PROT_NONE)`); the physical
/// page stays attached so that unpopulate can still release it. Physical
/// page zero is never handed out by the allocator, so a non-empty entry
/// always has address bits set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    /// An entry that maps nothing.
    pub const fn empty() -> Self {
        Pte(0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Pte(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// A leaf entry mapping `paddr` with the given permissions.
    pub fn new_leaf(paddr: Paddr, perm: Perm, level: usize, mattr: MemAttr) -> Self {
        let mut flags = PteFlags::USER;
        if level > 0 {
            flags |= PteFlags::LARGE;
        }
        if let MemAttr::Device = mattr {
            flags |= PteFlags::NO_CACHE;
        }
        Pte(paddr as u64 & PHYS_ADDR_MASK | flags.bits()).with_perm(perm)
    }

    /// An intermediate entry pointing at a child table. Permissive; the
    /// leaves govern access.
    pub fn new_table(paddr: Paddr) -> Self {
        Pte(paddr as u64 & PHYS_ADDR_MASK
            | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits())
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub fn is_large(self) -> bool {
        self.0 & PteFlags::LARGE.bits() != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & PteFlags::WRITABLE.bits() != 0
    }

    pub fn is_dirty(self) -> bool {
        self.0 & PteFlags::DIRTY.bits() != 0
    }

    pub fn is_cow(self) -> bool {
        self.0 & PteFlags::COW.bits() != 0
    }

    pub fn paddr(self) -> Paddr {
        (self.0 & PHYS_ADDR_MASK) as Paddr
    }

    pub fn with_paddr(self, paddr: Paddr) -> Self {
        Pte(self.0 & !PHYS_ADDR_MASK | paddr as u64 & PHYS_ADDR_MASK)
    }

    /// The permissions this entry grants.
    pub fn perm(self) -> Perm {
        let mut perm = Perm::empty();
        if self.is_present() {
            perm |= Perm::READ;
        }
        if self.is_writable() {
            perm |= Perm::WRITE;
        }
        if self.is_present() && self.0 & PteFlags::NO_EXECUTE.bits() == 0 {
            perm |= Perm::EXEC;
        }
        perm
    }

    /// Rewrites the permission bits.
    ///
    /// On x86 the present bit doubles as the read permission, and granting
    /// write or exec without read is not expressible, so any non-empty
    /// permission set implies readability (Linux behaves the same way).
    /// An empty set clears `PRESENT`, keeping the address bits attached.
    pub fn with_perm(self, perm: Perm) -> Self {
        let mut raw = self.0
            & !(PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::NO_EXECUTE).bits()
            | PteFlags::NO_EXECUTE.bits();
        if !perm.is_empty() {
            raw |= PteFlags::PRESENT.bits();
        }
        if perm.contains(Perm::WRITE) {
            raw |= PteFlags::WRITABLE.bits();
        }
        if perm.contains(Perm::EXEC) {
            raw &= !PteFlags::NO_EXECUTE.bits();
        }
        Pte(raw)
    }

    pub fn with_dirty(self, dirty: bool) -> Self {
        if dirty {
            Pte(self.0 | PteFlags::DIRTY.bits())
        } else {
            Pte(self.0 & !PteFlags::DIRTY.bits())
        }
    }

    pub fn with_large(self, large: bool) -> Self {
        if large {
            Pte(self.0 | PteFlags::LARGE.bits())
        } else {
            Pte(self.0 & !PteFlags::LARGE.bits())
        }
    }

    /// Marks the entry copy-on-write, stripping writability. Only base
    /// pages carry the COW bit.
    pub fn mark_cow(self, cow: bool) -> Self {
        if cow {
            Pte(self.0 & !PteFlags::WRITABLE.bits() | PteFlags::COW.bits())
        } else {
            Pte(self.0 & !PteFlags::COW.bits())
        }
    }
}

/// The state a page-fault exception hands to the VM core.
#[derive(Clone, Copy, Debug)]
pub struct ExceptionFrame {
    /// The faulting instruction pointer.
    pub pc: Vaddr,
    /// The hardware page-fault error code.
    pub error_code: u64,
}

/// Whether the fault was caused by a write access.
pub fn is_page_fault_write(error_code: u64) -> bool {
    error_code & (1 << 1) != 0
}

/// Whether the fault was caused by an instruction fetch.
pub fn is_page_fault_insn(error_code: u64) -> bool {
    error_code & (1 << 4) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_entry_bits() {
        let pte = Pte::new_leaf(0x1000, Perm::RW, 0, MemAttr::Normal);
        assert!(pte.is_present());
        assert!(pte.is_writable());
        assert!(!pte.is_large());
        assert_eq!(pte.paddr(), 0x1000);
        assert_eq!(pte.perm(), Perm::RW);

        let huge = Pte::new_leaf(0x20_0000, Perm::READ, 1, MemAttr::Normal);
        assert!(huge.is_large());
        assert_eq!(huge.perm(), Perm::READ);
    }

    #[test]
    fn perm_none_keeps_address() {
        let pte = Pte::new_leaf(0x3000, Perm::RW, 0, MemAttr::Normal).with_perm(Perm::empty());
        assert!(!pte.is_present());
        assert!(!pte.is_empty());
        assert_eq!(pte.paddr(), 0x3000);
        assert_eq!(pte.perm(), Perm::empty());
    }

    #[test]
    fn cow_strips_writability() {
        let pte = Pte::new_leaf(0x4000, Perm::RW, 0, MemAttr::Normal).mark_cow(true);
        assert!(pte.is_cow());
        assert!(!pte.is_writable());
        // Rewriting the permissions does not shed the COW marker.
        assert!(pte.with_perm(Perm::RW).is_cow());
    }

    #[test]
    fn fault_code_decoding() {
        assert!(is_page_fault_write(0x2));
        assert!(!is_page_fault_write(0x1));
        assert!(is_page_fault_insn(0x10));
        assert!(!is_page_fault_insn(0x2));
    }
}
