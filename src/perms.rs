// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

bitflags! {
    /// The memory access permissions of a mapping.
    pub struct Perm: u32 {
        /// Readable.
        const READ =  1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC =  1 << 2;
        /// Readable + writable.
        const RW = Self::READ.bits | Self::WRITE.bits;
        /// Readable + writable + executable.
        const RWX = Self::READ.bits | Self::WRITE.bits | Self::EXEC.bits;
    }
}

bitflags! {
    /// The flags a mapping is created with.
    pub struct MmapFlags: u32 {
        /// Map at the exact address instead of searching for a hole.
        const FIXED =         1 << 0;
        /// Populate the mapping eagerly instead of on first fault.
        const POPULATE =      1 << 1;
        /// Writes are shared with the backing object.
        const SHARED =        1 << 2;
        /// The mapping is backed by a file.
        const FILE =          1 << 3;
        /// Only base pages; never install huge pages.
        const SMALL =         1 << 4;
        /// Fresh anonymous pages may hold garbage instead of zeros.
        const UNINITIALIZED = 1 << 5;
        /// Reserved for the cooperative-ballooning runtime.
        const JVM_HEAP =      1 << 6;
        /// Reserved for the cooperative-ballooning runtime.
        const JVM_BALLOON =   1 << 7;
    }
}
