//! # Hexahedron Memory Subsystem
//!
//! The virtual-memory core of the kernel:
//! - Page table entry model and 4-level table walker
//! - Fixed virtual address-space layout
//! - Mapping policy (protection bits, copy-on-write, no-execute)
//! - Address spaces (kernel and per-process)
//!
//! ## Key Principle
//!
//! Physical frames come from an external allocator and page tables are
//! reached through an external physical-memory window. Both are traits in
//! [`physical`], so the core never decides where frames live.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod physical;
pub mod virtual_memory;
pub mod region;
pub mod protection;

#[cfg(test)]
mod testing;

use core::fmt;
use hexahedron_hal::{HalError, PageSize, PhysAddr};

pub use protection::{Mapping, MappingPurpose};
pub use region::{Region, RegionKind};
pub use virtual_memory::address_space::{initialize, initialize_with, kernel_space, AddressSpace, BootInfo};
pub use virtual_memory::entry::{EntryFlags, PageTableEntry};
pub use virtual_memory::index::{align_down, align_up, index_at_level, is_canonical, TableLevel};
pub use virtual_memory::mapper::Translation;
pub use virtual_memory::{AddressSpaceId, MemoryContext, SpaceStats};

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Non-canonical or malformed address
    InvalidAddress,
    /// Address does not belong to a region the request may use
    RegionViolation,
    /// Page is already mapped
    AlreadyMapped,
    /// Page is not mapped
    NotMapped,
    /// Frame allocator exhausted
    OutOfMemory,
    /// Attribute set breaks an entry invariant
    InvalidAttributes,
    /// Page lies inside a large-page mapping
    HugePage,
    /// Kernel address space not initialized
    NotInitialized,
    /// Kernel address space already initialized
    AlreadyInitialized,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MemError::InvalidAddress => "invalid address",
            MemError::RegionViolation => "address outside the permitted region",
            MemError::AlreadyMapped => "page already mapped",
            MemError::NotMapped => "page not mapped",
            MemError::OutOfMemory => "out of physical frames",
            MemError::InvalidAttributes => "invalid page attributes",
            MemError::HugePage => "page is covered by a large mapping",
            MemError::NotInitialized => "memory subsystem not initialized",
            MemError::AlreadyInitialized => "memory subsystem already initialized",
        };
        f.write_str(msg)
    }
}

impl From<HalError> for MemError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::OutOfMemory => MemError::OutOfMemory,
            HalError::NotInitialized => MemError::NotInitialized,
            HalError::InvalidAddress | HalError::InvalidParameter | HalError::NotSupported => {
                MemError::InvalidAddress
            }
        }
    }
}

/// Frame - represents a physical page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frame {
    /// Physical address of the frame
    address: PhysAddr,
    /// Size of the frame
    size: PageSize,
}

impl Frame {
    /// Create a new frame
    pub const fn new(address: PhysAddr, size: PageSize) -> Self {
        Self { address, size }
    }

    /// Create a 4 KiB frame
    pub const fn small(address: PhysAddr) -> Self {
        Self::new(address, PageSize::Size4KiB)
    }

    /// Get the physical address
    pub fn address(&self) -> PhysAddr {
        self.address
    }

    /// Get the size
    pub fn size(&self) -> PageSize {
        self.size
    }

    /// Get the end address
    pub fn end(&self) -> PhysAddr {
        PhysAddr::new(self.address.as_u64() + self.size.size())
    }

    /// Check if address is within this frame
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.address && addr < self.end()
    }
}
