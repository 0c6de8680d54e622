// SPDX-License-Identifier: MPL-2.0

//! Architecture-specific page-table entry layout and page-fault decoding.

pub mod x86_64;

pub use x86_64::{
    is_page_fault_insn, is_page_fault_write, ExceptionFrame, Pte, PteFlags, PHYS_ADDR_MASK,
};

/// The cacheability of a linear mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemAttr {
    /// Normal write-back memory.
    Normal,
    /// Device memory; accesses bypass the cache.
    Device,
}
