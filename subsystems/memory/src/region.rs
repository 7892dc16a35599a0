//! # Address Space Layout
//!
//! The fixed partition of the 64-bit virtual address space:
//!
//! ```text
//! 0x0000000000000000 - 0x0000060000000000: Userspace
//! 0x0000060000000000 - 0x0000070000000000: Usermode stack
//! 0x0000070000000000 - 0x0000070100000000: DMA
//! 0x0000080000000000 - 0x0000080000400000: Framebuffer (legacy, no new mappings)
//! 0x0000400000000000 - 0x0000410000000000: Usermode device memory
//! 0xFFFFFF0000000000 - 0xFFFFFF8000000000: Kernel heap
//! 0xFFFFFF8000000000 - 0xFFFFFF9000000000: Physical memory map
//! 0xFFFFFFF000000000 - 0xFFFFFFF100000000: MMIO
//! 0xFFFFFFFF00000000 - 0xFFFFFFFF80000000: Driver memory
//! 0xFFFFFFFF80000000 - 0xFFFFFFFFFFFFFFFF: Kernel image
//! ```
//!
//! The heap and the physical memory map are adjacent. Resizing either one
//! trips the compile-time checks below.

use hexahedron_hal::VirtAddr;
use static_assertions::const_assert;

use crate::virtual_memory::index::{index_at_level, TableLevel, ENTRIES_PER_TABLE};
use crate::{MemError, MemResult};

/// Start of the userspace range (stack included)
pub const USERSPACE_REGION_START: u64 = 0x0000_0000_0000_0000;
/// End of the userspace range (stack included)
pub const USERSPACE_REGION_END: u64 = 0x0000_0700_0000_0000;

/// Usermode stack region
pub const USERMODE_STACK_REGION: u64 = 0x0000_0600_0000_0000;
/// Usermode stack region size
pub const USERMODE_STACK_SIZE: u64 = 0x0000_0100_0000_0000;

/// DMA region
pub const DMA_REGION: u64 = 0x0000_0700_0000_0000;
/// DMA region size
pub const DMA_REGION_SIZE: u64 = 0x0000_0001_0000_0000;

/// Legacy framebuffer region
pub const FRAMEBUFFER_REGION: u64 = 0x0000_0800_0000_0000;
/// Legacy framebuffer region size
pub const FRAMEBUFFER_REGION_SIZE: u64 = 0x0000_0000_0040_0000;

/// Usermode device region
pub const USERMODE_DEVICE_REGION: u64 = 0x0000_4000_0000_0000;
/// Usermode device region size
pub const USERMODE_DEVICE_SIZE: u64 = 0x0000_0100_0000_0000;

/// Kernel heap region
pub const HEAP_REGION: u64 = 0xFFFF_FF00_0000_0000;
/// Kernel heap region size, up to the physical memory map
pub const HEAP_REGION_SIZE: u64 = PHYSMEM_MAP_REGION - HEAP_REGION;

/// Physical memory map region
pub const PHYSMEM_MAP_REGION: u64 = 0xFFFF_FF80_0000_0000;
/// Physical memory map region size
pub const PHYSMEM_MAP_SIZE: u64 = 0x0000_0010_0000_0000;

/// MMIO region
pub const MMIO_REGION: u64 = 0xFFFF_FFF0_0000_0000;
/// MMIO region size
pub const MMIO_REGION_SIZE: u64 = 0x0000_0001_0000_0000;

/// Driver region
pub const DRIVER_REGION: u64 = 0xFFFF_FFFF_0000_0000;
/// Driver region size
pub const DRIVER_REGION_SIZE: u64 = 0x0000_0000_8000_0000;

/// Kernel image region
pub const KERNEL_IMAGE_REGION: u64 = 0xFFFF_FFFF_8000_0000;
/// Kernel image region size, to the top of the address space
pub const KERNEL_IMAGE_SIZE: u64 = 0x0000_0000_8000_0000;

const_assert!(USERMODE_STACK_REGION + USERMODE_STACK_SIZE == USERSPACE_REGION_END);
const_assert!(USERSPACE_REGION_END <= DMA_REGION);
const_assert!(DMA_REGION + DMA_REGION_SIZE <= FRAMEBUFFER_REGION);
const_assert!(FRAMEBUFFER_REGION + FRAMEBUFFER_REGION_SIZE <= USERMODE_DEVICE_REGION);
const_assert!(USERMODE_DEVICE_REGION + USERMODE_DEVICE_SIZE <= 0x0000_8000_0000_0000);
const_assert!(HEAP_REGION + HEAP_REGION_SIZE == PHYSMEM_MAP_REGION);
const_assert!(PHYSMEM_MAP_REGION + PHYSMEM_MAP_SIZE <= MMIO_REGION);
const_assert!(MMIO_REGION + MMIO_REGION_SIZE <= DRIVER_REGION);
const_assert!(DRIVER_REGION + DRIVER_REGION_SIZE == KERNEL_IMAGE_REGION);
const_assert!(KERNEL_IMAGE_REGION + (KERNEL_IMAGE_SIZE - 1) == u64::MAX);

/// Purpose tag of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Private process memory
    Userspace,
    /// Process stacks
    UsermodeStack,
    /// DMA buffers
    Dma,
    /// Legacy framebuffer window
    Framebuffer,
    /// Device memory mapped into processes
    UsermodeDevice,
    /// Kernel heap
    Heap,
    /// Linear map of all physical memory
    PhysicalMap,
    /// Memory-mapped I/O
    Mmio,
    /// Driver-reserved memory
    Driver,
    /// Kernel code and data
    KernelImage,
}

impl RegionKind {
    /// Whether user-accessible entries may be installed here
    pub const fn is_user(self) -> bool {
        matches!(
            self,
            RegionKind::Userspace | RegionKind::UsermodeStack | RegionKind::UsermodeDevice
        )
    }

    /// Whether leaf frames here belong to the owning process
    pub const fn is_process_private(self) -> bool {
        matches!(self, RegionKind::Userspace | RegionKind::UsermodeStack)
    }

    /// Whether every address space shares the kernel's tables for it
    pub const fn is_kernel_shared(self) -> bool {
        matches!(
            self,
            RegionKind::Dma
                | RegionKind::Heap
                | RegionKind::PhysicalMap
                | RegionKind::Mmio
                | RegionKind::Driver
                | RegionKind::KernelImage
        )
    }

    /// Whether executable entries may be installed here
    pub const fn hosts_code(self) -> bool {
        matches!(self, RegionKind::Userspace | RegionKind::KernelImage)
    }

    /// Whether new mappings may be created here at all
    pub const fn accepts_mappings(self) -> bool {
        !matches!(self, RegionKind::Framebuffer)
    }
}

/// One fixed interval of the virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Region name
    pub name: &'static str,
    /// First address
    pub base: u64,
    /// Size in bytes
    pub size: u64,
    /// Purpose tag
    pub kind: RegionKind,
}

impl Region {
    const fn new(name: &'static str, base: u64, size: u64, kind: RegionKind) -> Self {
        Self { name, base, size, kind }
    }

    /// Last address inside the region
    pub const fn last(&self) -> u64 {
        self.base + (self.size - 1)
    }

    /// Check if `addr` is inside
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Check if `[start, start + len)` is entirely inside
    pub const fn contains_range(&self, start: u64, len: u64) -> bool {
        len != 0 && self.contains(start) && len - 1 <= self.last() - start
    }
}

/// The layout, sorted by base address
pub static REGIONS: [Region; 10] = [
    Region::new("userspace", USERSPACE_REGION_START, USERMODE_STACK_REGION - USERSPACE_REGION_START, RegionKind::Userspace),
    Region::new("usermode-stack", USERMODE_STACK_REGION, USERMODE_STACK_SIZE, RegionKind::UsermodeStack),
    Region::new("dma", DMA_REGION, DMA_REGION_SIZE, RegionKind::Dma),
    Region::new("framebuffer", FRAMEBUFFER_REGION, FRAMEBUFFER_REGION_SIZE, RegionKind::Framebuffer),
    Region::new("usermode-device", USERMODE_DEVICE_REGION, USERMODE_DEVICE_SIZE, RegionKind::UsermodeDevice),
    Region::new("heap", HEAP_REGION, HEAP_REGION_SIZE, RegionKind::Heap),
    Region::new("physmem-map", PHYSMEM_MAP_REGION, PHYSMEM_MAP_SIZE, RegionKind::PhysicalMap),
    Region::new("mmio", MMIO_REGION, MMIO_REGION_SIZE, RegionKind::Mmio),
    Region::new("driver", DRIVER_REGION, DRIVER_REGION_SIZE, RegionKind::Driver),
    Region::new("kernel-image", KERNEL_IMAGE_REGION, KERNEL_IMAGE_SIZE, RegionKind::KernelImage),
];

/// Region containing `addr`, `None` for gaps
pub fn region_of(addr: VirtAddr) -> Option<&'static Region> {
    let addr = addr.as_u64();
    REGIONS.iter().find(|region| region.contains(addr))
}

/// Region holding all of `[start, start + len)`
///
/// Fails with [`MemError::InvalidAddress`] for an empty or wrapping range
/// and [`MemError::RegionViolation`] when the range starts in a gap or
/// crosses a region boundary.
pub fn region_for_range(start: VirtAddr, len: u64) -> MemResult<&'static Region> {
    if len == 0 || start.checked_add(len - 1).is_none() {
        return Err(MemError::InvalidAddress);
    }
    let region = region_of(start).ok_or(MemError::RegionViolation)?;
    if region.contains_range(start.as_u64(), len) {
        Ok(region)
    } else {
        Err(MemError::RegionViolation)
    }
}

/// Check if a top-level slot covers any kernel-shared region
pub fn is_kernel_shared_slot(slot: usize) -> bool {
    REGIONS
        .iter()
        .filter(|region| region.kind.is_kernel_shared())
        .any(|region| {
            let first = index_at_level(region.base, TableLevel::Top);
            let last = index_at_level(region.last(), TableLevel::Top);
            (first..=last).contains(&slot)
        })
}

/// Top-level slots every address space shares with the kernel
pub fn kernel_shared_slots() -> impl Iterator<Item = usize> {
    (0..ENTRIES_PER_TABLE).filter(|&slot| is_kernel_shared_slot(slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_memory::index::is_canonical;

    #[test]
    fn test_regions_sorted_and_disjoint() {
        for pair in REGIONS.windows(2) {
            assert!(pair[0].last() < pair[1].base, "{} overlaps {}", pair[0].name, pair[1].name);
        }
        for region in REGIONS.iter() {
            assert!(is_canonical(region.base) && is_canonical(region.last()), "{}", region.name);
        }
    }

    #[test]
    fn test_heap_lookup() {
        let region = region_of(VirtAddr::new(0xFFFF_FF00_0000_1000)).unwrap();
        assert_eq!(region.kind, RegionKind::Heap);
        assert_eq!(region.last() + 1, PHYSMEM_MAP_REGION);
    }

    #[test]
    fn test_gaps_report_none() {
        assert!(region_of(VirtAddr::new(0x0000_0701_0000_0000)).is_none());
        assert!(region_of(VirtAddr::new(0xFFFF_8000_0000_0000)).is_none());
        assert!(region_of(VirtAddr::new(0x0000_8000_0000_0000)).is_none());
    }

    #[test]
    fn test_kernel_image_reaches_top() {
        let region = region_of(VirtAddr::new(u64::MAX)).unwrap();
        assert_eq!(region.kind, RegionKind::KernelImage);
        assert!(region.contains_range(KERNEL_IMAGE_REGION, KERNEL_IMAGE_SIZE));
    }

    #[test]
    fn test_range_checks() {
        let driver = VirtAddr::new(DRIVER_REGION);
        assert_eq!(region_for_range(driver, 0x1000).unwrap().kind, RegionKind::Driver);
        assert_eq!(region_for_range(VirtAddr::new(0x0000_0701_0000_0000), 0x1000), Err(MemError::RegionViolation));

        // Crosses from the driver region into the kernel image.
        let tail = VirtAddr::new(KERNEL_IMAGE_REGION - 0x1000);
        assert_eq!(region_for_range(tail, 0x2000), Err(MemError::RegionViolation));

        assert_eq!(region_for_range(driver, 0), Err(MemError::InvalidAddress));
        assert_eq!(region_for_range(VirtAddr::new(u64::MAX), 2), Err(MemError::InvalidAddress));

        // A range may end on the last byte of the address space.
        let top = VirtAddr::new(0xFFFF_FFFF_FFFF_F000);
        assert_eq!(region_for_range(top, 0x1000).unwrap().kind, RegionKind::KernelImage);
    }

    #[test]
    fn test_code_regions() {
        let hosts: Vec<&str> = REGIONS.iter().filter(|r| r.kind.hosts_code()).map(|r| r.name).collect();
        assert_eq!(hosts, ["userspace", "kernel-image"]);
    }

    #[test]
    fn test_stack_is_process_private() {
        let stack = region_of(VirtAddr::new(USERMODE_STACK_REGION + 0x1000)).unwrap();
        assert!(stack.kind.is_process_private());
        assert!(!region_of(VirtAddr::new(DMA_REGION)).unwrap().kind.is_process_private());
        assert_eq!(region_of(VirtAddr::new(USERSPACE_REGION_END - 1)).unwrap().kind, RegionKind::UsermodeStack);
        assert_eq!(region_of(VirtAddr::new(USERMODE_STACK_REGION)).unwrap().kind, RegionKind::UsermodeStack);
    }

    #[test]
    fn test_shared_slots_exclude_user_regions() {
        let slots: Vec<usize> = kernel_shared_slots().collect();
        assert_eq!(slots, vec![14, 510, 511]);
        for region in REGIONS.iter().filter(|r| r.kind.is_user()) {
            let first = index_at_level(region.base, TableLevel::Top);
            let last = index_at_level(region.last(), TableLevel::Top);
            for slot in first..=last {
                assert!(!is_kernel_shared_slot(slot), "{} shares slot {}", region.name, slot);
            }
        }
    }
}
