//! # Physical Memory Access
//!
//! Page tables live in physical frames. The walker reaches them through a
//! [`PhysicalMemory`] window, which on a running kernel is the
//! physical-memory map region and during early boot is the identity map.

pub mod frame_allocator;

pub use frame_allocator::FrameAllocator;

use crate::region::PHYSMEM_MAP_REGION;
use crate::virtual_memory::table::PageTable;
use hexahedron_hal::PhysAddr;

/// Window through which page-table frames are accessed
///
/// # Safety
/// For every frame handed out by the paired [`FrameAllocator`],
/// `table_ptr` must return a pointer that is valid for reads and writes of
/// one [`PageTable`] for as long as the frame stays allocated, and distinct
/// frames must never alias.
pub unsafe trait PhysicalMemory: Send + Sync {
    /// Pointer to the table stored in `frame`
    fn table_ptr(&self, frame: PhysAddr) -> *mut PageTable;
}

/// Linear physical window: `virt = phys + offset`
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    /// Window at an arbitrary offset
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Early-boot window where physical memory is identity mapped
    pub const fn identity() -> Self {
        Self::new(0)
    }

    /// Window through the kernel's physical-memory map region
    pub const fn physmem_map() -> Self {
        Self::new(PHYSMEM_MAP_REGION)
    }

    /// Offset added to physical addresses
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

// SAFETY: the window covers all of physical memory once the kernel has
// mapped it, which `AddressSpace::new_kernel` does before switching.
unsafe impl PhysicalMemory for DirectMap {
    fn table_ptr(&self, frame: PhysAddr) -> *mut PageTable {
        frame.as_u64().wrapping_add(self.offset) as *mut PageTable
    }
}
