//! # Virtual Memory Management
//!
//! Page table entries, the 4-level walker and address spaces built on top
//! of them.

pub mod address_space;
pub mod entry;
pub mod index;
pub mod mapper;
pub mod table;

use alloc::sync::Arc;
use core::fmt;

use hexahedron_hal::mmu::TranslationCache;

use crate::physical::{FrameAllocator, PhysicalMemory};

/// Collaborators every address space works through
///
/// Cloning is cheap; all address spaces of one system share one context.
#[derive(Clone)]
pub struct MemoryContext {
    frames: Arc<dyn FrameAllocator>,
    memory: Arc<dyn PhysicalMemory>,
    tlb: Arc<dyn TranslationCache>,
}

impl MemoryContext {
    /// Bundle a frame allocator, a physical-memory window and TLB control
    pub fn new(
        frames: Arc<dyn FrameAllocator>,
        memory: Arc<dyn PhysicalMemory>,
        tlb: Arc<dyn TranslationCache>,
    ) -> Self {
        Self { frames, memory, tlb }
    }

    /// Frame allocator
    pub fn frames(&self) -> &dyn FrameAllocator {
        &*self.frames
    }

    /// Physical-memory window
    pub fn memory(&self) -> &dyn PhysicalMemory {
        &*self.memory
    }

    /// TLB maintenance
    pub fn tlb(&self) -> &dyn TranslationCache {
        &*self.tlb
    }
}

impl fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContext").finish_non_exhaustive()
    }
}

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    /// Kernel address space
    pub const KERNEL: Self = Self(0);

    /// Create a new ID
    pub fn new() -> Self {
        use core::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identifier
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for AddressSpaceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Address space statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStats {
    /// Intermediate tables owned by the space (root excluded)
    pub tables: usize,
    /// 4 KiB leaves installed through the space
    pub pages: usize,
}
