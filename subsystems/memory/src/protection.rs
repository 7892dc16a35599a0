//! # Mapping Policy
//!
//! Turns a mapping intent into the entry attributes the walker installs,
//! and rejects requests that would break a cross-cutting rule:
//!
//! - non-canonical or unaligned addresses
//! - addresses outside the region the purpose belongs to
//! - user-accessible entries outside the user regions
//! - writable copy-on-write or shared entries
//! - entries both writable and executable
//!
//! Only code purposes are executable; everything else gets no-execute.

use hexahedron_hal::{PhysAddr, VirtAddr};

use crate::region::{region_for_range, region_of, RegionKind};
use crate::virtual_memory::entry::{EntryFlags, PHYS_LIMIT};
use crate::virtual_memory::index::{is_canonical, is_page_aligned};
use crate::{MemError, MemResult};

/// What a mapping is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingPurpose {
    /// Kernel text (executable)
    KernelCode,
    /// Kernel data and rodata
    KernelData,
    /// Kernel heap growth
    KernelHeap,
    /// Linear physical memory map
    PhysicalMap,
    /// DMA buffer
    Dma,
    /// Device register window
    Mmio,
    /// Driver-reserved memory
    Driver,
    /// Process code (executable, never writable)
    UserCode,
    /// Process private data
    UserData,
    /// Process stack
    UserStack,
    /// Device memory exposed to a process
    UserDevice,
    /// Process page shared until first write
    CopyOnWrite,
}

impl MappingPurpose {
    /// Regions this purpose may map into
    pub const fn permitted_regions(self) -> &'static [RegionKind] {
        match self {
            MappingPurpose::KernelCode | MappingPurpose::KernelData => &[RegionKind::KernelImage],
            MappingPurpose::KernelHeap => &[RegionKind::Heap],
            MappingPurpose::PhysicalMap => &[RegionKind::PhysicalMap],
            MappingPurpose::Dma => &[RegionKind::Dma],
            MappingPurpose::Mmio => &[RegionKind::Mmio],
            MappingPurpose::Driver => &[RegionKind::Driver],
            MappingPurpose::UserCode | MappingPurpose::UserData => &[RegionKind::Userspace],
            MappingPurpose::UserStack => &[RegionKind::UsermodeStack],
            MappingPurpose::UserDevice => &[RegionKind::UsermodeDevice],
            MappingPurpose::CopyOnWrite => &[RegionKind::Userspace, RegionKind::UsermodeStack],
        }
    }

    /// Executable purposes
    pub const fn is_code(self) -> bool {
        matches!(self, MappingPurpose::KernelCode | MappingPurpose::UserCode)
    }

    /// Purposes that produce user-accessible entries
    pub const fn is_user(self) -> bool {
        matches!(
            self,
            MappingPurpose::UserCode
                | MappingPurpose::UserData
                | MappingPurpose::UserStack
                | MappingPurpose::UserDevice
                | MappingPurpose::CopyOnWrite
        )
    }

    /// Purposes backed by device memory
    pub const fn is_uncached(self) -> bool {
        matches!(
            self,
            MappingPurpose::Dma | MappingPurpose::Mmio | MappingPurpose::UserDevice
        )
    }

    /// Writable unless the caller asks otherwise
    const fn default_writable(self) -> bool {
        !matches!(
            self,
            MappingPurpose::KernelCode | MappingPurpose::UserCode | MappingPurpose::CopyOnWrite
        )
    }
}

/// Extra bits a caller may request on top of the purpose defaults
const REQUESTABLE: EntryFlags = EntryFlags::USER
    .union(EntryFlags::WRITE_THROUGH)
    .union(EntryFlags::CACHE_DISABLE)
    .union(EntryFlags::LARGE_PAGE)
    .union(EntryFlags::GLOBAL)
    .union(EntryFlags::AVAILABLE_1)
    .union(EntryFlags::AVAILABLE_2)
    .union(EntryFlags::AVAILABLE_3);

/// A mapping request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    purpose: MappingPurpose,
    writable: bool,
    overwrite: bool,
    extra: EntryFlags,
}

impl Mapping {
    /// Request with the purpose's defaults
    pub const fn new(purpose: MappingPurpose) -> Self {
        Self {
            purpose,
            writable: purpose.default_writable(),
            overwrite: false,
            extra: EntryFlags::empty(),
        }
    }

    /// Request write access (or drop it)
    pub const fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Read-only mapping
    pub const fn read_only(self) -> Self {
        self.writable(false)
    }

    /// Replace an existing mapping instead of failing
    pub const fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Request extra attribute bits
    pub const fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.extra = self.extra.union(flags);
        self
    }

    /// Purpose
    pub const fn purpose(&self) -> MappingPurpose {
        self.purpose
    }

    /// Whether an existing mapping may be replaced
    pub const fn allows_overwrite(&self) -> bool {
        self.overwrite
    }
}

/// Reject addresses that must never reach a table
pub fn check_virtual(virt: VirtAddr) -> MemResult<()> {
    if !is_canonical(virt.as_u64()) || !is_page_aligned(virt.as_u64()) {
        return Err(MemError::InvalidAddress);
    }
    Ok(())
}

/// Reject frames the entry format cannot hold
pub fn check_frame(frame: PhysAddr) -> MemResult<()> {
    if !is_page_aligned(frame.as_u64()) || frame.as_u64() >= PHYS_LIMIT {
        return Err(MemError::InvalidAddress);
    }
    Ok(())
}

/// Attributes for mapping `frame` at `virt` as requested
pub fn resolve(virt: VirtAddr, frame: PhysAddr, mapping: &Mapping) -> MemResult<EntryFlags> {
    check_virtual(virt)?;
    check_frame(frame)?;

    let purpose = mapping.purpose;
    let region = region_of(virt).ok_or(MemError::RegionViolation)?;
    if !region.kind.accepts_mappings() || !purpose.permitted_regions().contains(&region.kind) {
        log::trace!("{:?} mapping refused in region {}", purpose, region.name);
        return Err(MemError::RegionViolation);
    }
    if !REQUESTABLE.contains(mapping.extra) {
        return Err(MemError::InvalidAttributes);
    }
    if purpose.is_code() && mapping.writable {
        return Err(MemError::InvalidAttributes);
    }

    let mut flags = EntryFlags::PRESENT | mapping.extra;
    flags.set(EntryFlags::USER, purpose.is_user() || mapping.extra.contains(EntryFlags::USER));
    flags.set(EntryFlags::NO_EXECUTE, !purpose.is_code());
    flags.set(EntryFlags::GLOBAL, region.kind.is_kernel_shared() && !region.kind.is_user());
    if purpose.is_uncached() {
        flags.insert(EntryFlags::CACHE_DISABLE);
    }
    if purpose == MappingPurpose::CopyOnWrite {
        flags.insert(EntryFlags::COPY_ON_WRITE);
    } else {
        flags.set(EntryFlags::WRITABLE, mapping.writable);
    }

    guard_user(region.kind, flags)?;
    Ok(flags)
}

/// Attributes for mapping `len` bytes of contiguous frames at `virt`
///
/// The whole range must sit inside one region and every frame must be
/// representable, so a range mapping is refused before any page is touched.
pub fn resolve_range(virt: VirtAddr, frame: PhysAddr, len: u64, mapping: &Mapping) -> MemResult<EntryFlags> {
    let flags = resolve(virt, frame, mapping)?;
    region_for_range(virt, len)?;
    match frame.as_u64().checked_add(len - 1) {
        Some(last) if last < PHYS_LIMIT => Ok(flags),
        _ => Err(MemError::InvalidAddress),
    }
}

/// Attributes for an in-place update of the entry at `virt`
///
/// Hardware-managed bits are dropped from `flags`; the walker carries
/// the stored ones over, together with any sharing mark. Outside code
/// regions no-execute is forced on, and a writable result must be
/// no-execute.
pub fn resolve_update(virt: VirtAddr, flags: EntryFlags) -> MemResult<EntryFlags> {
    check_virtual(virt)?;
    let region = region_of(virt).ok_or(MemError::RegionViolation)?;
    if flags.intersects(EntryFlags::SHARING) {
        return Err(MemError::InvalidAttributes);
    }
    let mut flags = flags.difference(EntryFlags::HARDWARE_MANAGED).union(EntryFlags::PRESENT);
    if !region.kind.hosts_code() {
        flags.insert(EntryFlags::NO_EXECUTE);
    }
    if flags.contains(EntryFlags::WRITABLE) && !flags.contains(EntryFlags::NO_EXECUTE) {
        log::debug!("refusing writable executable entry at {:#x}", virt);
        return Err(MemError::InvalidAttributes);
    }
    guard_user(region.kind, flags)?;
    Ok(flags)
}

/// User-accessible entries only inside user regions
fn guard_user(kind: RegionKind, flags: EntryFlags) -> MemResult<()> {
    if flags.contains(EntryFlags::USER) && !kind.is_user() {
        log::warn!("refusing user-accessible entry in {:?} region", kind);
        return Err(MemError::RegionViolation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{
        DRIVER_REGION, HEAP_REGION, KERNEL_IMAGE_REGION, MMIO_REGION, USERMODE_STACK_REGION,
        FRAMEBUFFER_REGION, USERMODE_DEVICE_REGION,
    };

    const FRAME: PhysAddr = PhysAddr::new(0x20_0000);

    #[test]
    fn test_driver_region_purpose() {
        let virt = VirtAddr::new(DRIVER_REGION + 0x1000);
        assert_eq!(
            resolve(virt, FRAME, &Mapping::new(MappingPurpose::UserData)),
            Err(MemError::RegionViolation)
        );
        let flags = resolve(virt, FRAME, &Mapping::new(MappingPurpose::Driver)).unwrap();
        assert!(flags.contains(EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE));
        assert!(!flags.contains(EntryFlags::USER));
    }

    #[test]
    fn test_non_canonical_rejected() {
        let virt = VirtAddr::new(0x0000_8000_0000_0000);
        assert_eq!(
            resolve(virt, FRAME, &Mapping::new(MappingPurpose::UserData)),
            Err(MemError::InvalidAddress)
        );
    }

    #[test]
    fn test_unaligned_inputs_rejected() {
        let heap = Mapping::new(MappingPurpose::KernelHeap);
        assert_eq!(
            resolve(VirtAddr::new(HEAP_REGION + 1), FRAME, &heap),
            Err(MemError::InvalidAddress)
        );
        assert_eq!(
            resolve(VirtAddr::new(HEAP_REGION), PhysAddr::new(0x1008), &heap),
            Err(MemError::InvalidAddress)
        );
        assert_eq!(
            resolve(VirtAddr::new(HEAP_REGION), PhysAddr::new(PHYS_LIMIT), &heap),
            Err(MemError::InvalidAddress)
        );
    }

    #[test]
    fn test_execute_only_for_code() {
        let code = resolve(VirtAddr::new(KERNEL_IMAGE_REGION), FRAME, &Mapping::new(MappingPurpose::KernelCode)).unwrap();
        assert!(!code.contains(EntryFlags::NO_EXECUTE));
        assert!(!code.contains(EntryFlags::WRITABLE));
        assert!(code.contains(EntryFlags::GLOBAL));

        let data = resolve(VirtAddr::new(KERNEL_IMAGE_REGION), FRAME, &Mapping::new(MappingPurpose::KernelData)).unwrap();
        assert!(data.contains(EntryFlags::NO_EXECUTE | EntryFlags::WRITABLE));

        let user_code = resolve(VirtAddr::new(0x40_0000), FRAME, &Mapping::new(MappingPurpose::UserCode)).unwrap();
        assert!(user_code.contains(EntryFlags::USER));
        assert!(!user_code.intersects(EntryFlags::NO_EXECUTE | EntryFlags::WRITABLE | EntryFlags::GLOBAL));
    }

    #[test]
    fn test_writable_code_rejected() {
        let request = Mapping::new(MappingPurpose::UserCode).writable(true);
        assert_eq!(
            resolve(VirtAddr::new(0x40_0000), FRAME, &request),
            Err(MemError::InvalidAttributes)
        );
        let request = Mapping::new(MappingPurpose::KernelCode).writable(true);
        assert_eq!(
            resolve(VirtAddr::new(KERNEL_IMAGE_REGION), FRAME, &request),
            Err(MemError::InvalidAttributes)
        );
    }

    #[test]
    fn test_copy_on_write_is_read_only() {
        let request = Mapping::new(MappingPurpose::CopyOnWrite).writable(true);
        let flags = resolve(VirtAddr::new(USERMODE_STACK_REGION), FRAME, &request).unwrap();
        assert!(flags.contains(EntryFlags::COPY_ON_WRITE | EntryFlags::USER | EntryFlags::NO_EXECUTE));
        assert!(!flags.contains(EntryFlags::WRITABLE));
    }

    #[test]
    fn test_user_flag_outside_userspace_rejected() {
        let request = Mapping::new(MappingPurpose::KernelHeap).with_flags(EntryFlags::USER);
        assert_eq!(
            resolve(VirtAddr::new(HEAP_REGION), FRAME, &request),
            Err(MemError::RegionViolation)
        );
        assert_eq!(
            resolve_update(VirtAddr::new(HEAP_REGION), EntryFlags::USER | EntryFlags::WRITABLE),
            Err(MemError::RegionViolation)
        );
    }

    #[test]
    fn test_device_mappings_uncached() {
        let mmio = resolve(VirtAddr::new(MMIO_REGION), FRAME, &Mapping::new(MappingPurpose::Mmio)).unwrap();
        assert!(mmio.contains(EntryFlags::CACHE_DISABLE | EntryFlags::NO_EXECUTE));

        let device = resolve(VirtAddr::new(USERMODE_DEVICE_REGION), FRAME, &Mapping::new(MappingPurpose::UserDevice)).unwrap();
        assert!(device.contains(EntryFlags::CACHE_DISABLE | EntryFlags::USER));
    }

    #[test]
    fn test_framebuffer_closed() {
        for purpose in [MappingPurpose::UserData, MappingPurpose::Driver, MappingPurpose::Mmio] {
            assert_eq!(
                resolve(VirtAddr::new(FRAMEBUFFER_REGION), FRAME, &Mapping::new(purpose)),
                Err(MemError::RegionViolation)
            );
        }
    }

    #[test]
    fn test_unrequestable_bits_rejected() {
        let request = Mapping::new(MappingPurpose::UserData).with_flags(EntryFlags::COPY_ON_WRITE);
        assert_eq!(
            resolve(VirtAddr::new(0x1000), FRAME, &request),
            Err(MemError::InvalidAttributes)
        );
    }

    #[test]
    fn test_update_strips_hardware_bits() {
        let flags = resolve_update(
            VirtAddr::new(0x1000),
            EntryFlags::USER | EntryFlags::DIRTY | EntryFlags::ACCESSED,
        )
        .unwrap();
        assert_eq!(flags, EntryFlags::PRESENT | EntryFlags::USER);
        assert_eq!(
            resolve_update(VirtAddr::new(0x1000), EntryFlags::WRITABLE | EntryFlags::COPY_ON_WRITE),
            Err(MemError::InvalidAttributes)
        );
    }

    #[test]
    fn test_update_cannot_request_sharing_marks() {
        for mark in [EntryFlags::COPY_ON_WRITE, EntryFlags::SHARED] {
            assert_eq!(
                resolve_update(VirtAddr::new(0x1000), EntryFlags::USER | EntryFlags::NO_EXECUTE | mark),
                Err(MemError::InvalidAttributes)
            );
        }
    }

    #[test]
    fn test_update_forces_no_execute_outside_code() {
        for addr in [HEAP_REGION, DRIVER_REGION, USERMODE_STACK_REGION, USERMODE_DEVICE_REGION] {
            let flags = resolve_update(VirtAddr::new(addr), EntryFlags::empty()).unwrap();
            assert!(flags.contains(EntryFlags::NO_EXECUTE), "{:#x}", addr);
        }
        let heap = resolve_update(VirtAddr::new(HEAP_REGION), EntryFlags::WRITABLE).unwrap();
        assert_eq!(heap, EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE);

        let code = resolve_update(VirtAddr::new(0x40_0000), EntryFlags::USER).unwrap();
        assert!(!code.contains(EntryFlags::NO_EXECUTE));
    }

    #[test]
    fn test_update_rejects_writable_executable() {
        assert_eq!(
            resolve_update(VirtAddr::new(0x40_0000), EntryFlags::USER | EntryFlags::WRITABLE),
            Err(MemError::InvalidAttributes)
        );
        assert_eq!(
            resolve_update(VirtAddr::new(KERNEL_IMAGE_REGION), EntryFlags::WRITABLE | EntryFlags::GLOBAL),
            Err(MemError::InvalidAttributes)
        );
        assert!(resolve_update(
            VirtAddr::new(0x40_0000),
            EntryFlags::USER | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE
        )
        .is_ok());
    }

    #[test]
    fn test_range_checked_before_mapping() {
        let data = Mapping::new(MappingPurpose::UserData);
        let flags = resolve_range(VirtAddr::new(0x40_0000), FRAME, 0x2800, &data).unwrap();
        assert!(flags.contains(EntryFlags::USER | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE));

        // Second page crosses into the stack region.
        assert_eq!(
            resolve_range(VirtAddr::new(USERMODE_STACK_REGION - 0x1000), FRAME, 0x2000, &data),
            Err(MemError::RegionViolation)
        );
        assert_eq!(
            resolve_range(VirtAddr::new(0x40_0000), PhysAddr::new(PHYS_LIMIT - 0x1000), 0x2000, &data),
            Err(MemError::InvalidAddress)
        );
        assert!(resolve_range(VirtAddr::new(0x40_0000), PhysAddr::new(PHYS_LIMIT - 0x1000), 0x1000, &data).is_ok());
    }
}
