// SPDX-License-Identifier: MPL-2.0

//! The interface to the collaborators the VM core builds on: the physical
//! page allocator, the scheduler, the low-level architecture code, and
//! signal delivery.
//!
//! The kernel supplies one implementation; the tests supply a mock backed
//! by the host heap. Physical page zero must never be handed out, so a
//! non-empty PTE always carries non-zero address bits.

use crate::addr::{Paddr, Vaddr};
use crate::arch::ExceptionFrame;

/// The signal synthesized for an unserviceable page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Access outside any mapping, or with insufficient permissions.
    Segv,
    /// Access beyond the backing object, or a backing I/O failure.
    Bus,
}

/// The environment the VM core runs in.
pub trait Platform: Send + Sync {
    /// Allocates one base page of physical memory. No zeroing is implied.
    fn alloc_page(&self) -> Option<Paddr>;

    /// Allocates `size` bytes of physically contiguous, naturally aligned
    /// memory. No zeroing is implied.
    fn alloc_huge_page(&self, size: usize) -> Option<Paddr>;

    /// Returns a page taken from [`Self::alloc_page`].
    fn free_page(&self, paddr: Paddr);

    /// Returns memory taken from [`Self::alloc_huge_page`].
    ///
    /// Splitting is allowed: pieces of a huge allocation may be returned
    /// page by page through [`Self::free_page`].
    fn free_huge_page(&self, paddr: Paddr, size: usize);

    /// Translates a physical address through the kernel's linear map.
    fn phys_to_virt(&self, paddr: Paddr) -> *mut u8;

    /// The id of the CPU the caller runs on.
    fn current_cpu(&self) -> usize;

    /// Frees a page-table page once every thread that may be traversing it
    /// has passed a quiescent state.
    fn rcu_defer_free_page(&self, paddr: Paddr);

    /// Enters an RCU read-side section.
    fn rcu_read_lock(&self) {}

    /// Leaves an RCU read-side section.
    fn rcu_read_unlock(&self) {}

    /// Invalidates every non-global TLB entry on all CPUs.
    fn flush_tlb_all(&self);

    /// Orders page-table writes against subsequent accesses on
    /// architectures with weak memory models. A no-op on x86.
    fn synchronize_page_table_modifications(&self) {}

    /// Makes freshly written instructions visible to the instruction
    /// stream on architectures with non-unified caches.
    fn synchronize_cpu_caches(&self, _vaddr: Vaddr, _size: usize) {}

    /// Touches the next stack pages of the current thread so that taking a
    /// VMA write lock cannot itself page-fault on the stack and deadlock
    /// against the fault handler.
    fn ensure_stack_resident(&self) {}

    /// Delivers `signal` for the fault at `addr` to the current thread.
    fn handle_mmap_fault(&self, addr: Vaddr, signal: Signal, ef: &ExceptionFrame);

    /// Whether `pc` lies in kernel text. A fault raised from kernel text
    /// is a kernel bug and aborts instead of raising a signal.
    fn is_kernel_text(&self, _pc: Vaddr) -> bool {
        false
    }
}
