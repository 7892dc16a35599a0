//! # Page Table Entry
//!
//! One 64-bit translation entry. Layout:
//!
//! | Bits  | Field                                              |
//! |-------|----------------------------------------------------|
//! | 0-8   | present, rw, user, pwt, pcd, accessed, dirty, size/PAT, global |
//! | 9-11  | available                                          |
//! | 12-39 | physical frame number (28 bits)                    |
//! | 40-51 | reserved, must be zero                             |
//! | 52    | copy-on-write (software)                           |
//! | 53    | shared read-only (software)                        |
//! | 54-62 | available                                          |
//! | 63    | no-execute                                         |

use core::fmt;

use bitflags::bitflags;
use hexahedron_hal::PhysAddr;
use static_assertions::const_assert_eq;

use super::index::{PAGE_SHIFT, PAGE_SIZE};

/// Width of the frame number field
const FRAME_BITS: u32 = 28;

/// Frame number bits in place (bits 12-39)
pub const FRAME_MASK: u64 = ((1 << FRAME_BITS) - 1) << PAGE_SHIFT;

/// Reserved bits (40-51)
pub const RESERVED_MASK: u64 = 0xFFF << 40;

/// First physical address the frame field cannot represent (1 TiB)
pub const PHYS_LIMIT: u64 = 1 << (FRAME_BITS + PAGE_SHIFT);

bitflags! {
    /// Page table entry attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u64 {
        /// Present in memory
        const PRESENT = 1 << 0;
        /// Writable
        const WRITABLE = 1 << 1;
        /// Accessible from user mode
        const USER = 1 << 2;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled
        const CACHE_DISABLE = 1 << 4;
        /// Accessed (set by hardware)
        const ACCESSED = 1 << 5;
        /// Dirty (set by hardware)
        const DIRTY = 1 << 6;
        /// Large page on directory entries, PAT on leaf entries
        const LARGE_PAGE = 1 << 7;
        /// Global (not flushed on CR3 reload)
        const GLOBAL = 1 << 8;
        /// Available bit 1
        const AVAILABLE_1 = 1 << 9;
        /// Available bit 2
        const AVAILABLE_2 = 1 << 10;
        /// Available bit 3
        const AVAILABLE_3 = 1 << 11;
        /// Copy-on-write, carved from the upper available bits
        const COPY_ON_WRITE = 1 << 52;
        /// Read-only frame shared with another address space
        const SHARED = 1 << 53;
        /// No execute
        const NO_EXECUTE = 1 << 63;
    }
}

impl EntryFlags {
    /// Bits maintained by the processor
    pub const HARDWARE_MANAGED: Self = Self::ACCESSED.union(Self::DIRTY);

    /// Flags of an intermediate (non-leaf) entry
    pub const TABLE: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Marks of a leaf whose frame is referenced by more than one space
    pub const SHARING: Self = Self::COPY_ON_WRITE.union(Self::SHARED);
}

/// Available bits 54-62, preserved but not named
const HIGH_AVAILABLE_MASK: u64 = 0x1FF << 54;

/// Every bit that is not frame number or reserved
const FLAG_MASK: u64 = !(FRAME_MASK | RESERVED_MASK);

/// Page table entry
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry(u64);

const_assert_eq!(core::mem::size_of::<PageTableEntry>(), 8);
const_assert_eq!(FLAG_MASK, EntryFlags::all().bits() | HIGH_AVAILABLE_MASK);

impl PageTableEntry {
    /// Create empty (not present) entry
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Reinterpret a raw value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Create entry with frame and flags
    ///
    /// # Panics
    /// If `frame` is not 4 KiB aligned or not representable, or if `flags`
    /// combine copy-on-write with writable.
    pub fn new(frame: PhysAddr, flags: EntryFlags) -> Self {
        let mut entry = Self::empty();
        entry.set_frame(frame);
        entry.set_flags(flags);
        entry
    }

    /// Create entry pointing to next table
    pub fn table(frame: PhysAddr, user: bool) -> Self {
        let mut flags = EntryFlags::TABLE;
        flags.set(EntryFlags::USER, user);
        Self::new(frame, flags)
    }

    /// Get raw value
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Check if present
    pub const fn is_present(&self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// Check if writable
    pub const fn is_writable(&self) -> bool {
        self.0 & EntryFlags::WRITABLE.bits() != 0
    }

    /// Check if user accessible
    pub const fn is_user(&self) -> bool {
        self.0 & EntryFlags::USER.bits() != 0
    }

    /// Check if write-through
    pub const fn is_write_through(&self) -> bool {
        self.0 & EntryFlags::WRITE_THROUGH.bits() != 0
    }

    /// Check if caching is disabled
    pub const fn is_cache_disabled(&self) -> bool {
        self.0 & EntryFlags::CACHE_DISABLE.bits() != 0
    }

    /// Check if accessed
    pub const fn is_accessed(&self) -> bool {
        self.0 & EntryFlags::ACCESSED.bits() != 0
    }

    /// Check if dirty
    pub const fn is_dirty(&self) -> bool {
        self.0 & EntryFlags::DIRTY.bits() != 0
    }

    /// Check the size bit (PAT on leaf entries)
    pub const fn is_large(&self) -> bool {
        self.0 & EntryFlags::LARGE_PAGE.bits() != 0
    }

    /// Check if global
    pub const fn is_global(&self) -> bool {
        self.0 & EntryFlags::GLOBAL.bits() != 0
    }

    /// Check if copy-on-write
    pub const fn is_copy_on_write(&self) -> bool {
        self.0 & EntryFlags::COPY_ON_WRITE.bits() != 0
    }

    /// Check if the frame is shared read-only
    pub const fn is_shared(&self) -> bool {
        self.0 & EntryFlags::SHARED.bits() != 0
    }

    /// Check if the frame is referenced by another space
    pub const fn is_sharing(&self) -> bool {
        self.0 & EntryFlags::SHARING.bits() != 0
    }

    /// Check if no-execute
    pub const fn is_no_execute(&self) -> bool {
        self.0 & EntryFlags::NO_EXECUTE.bits() != 0
    }

    /// Raw 28-bit frame number
    pub const fn frame_number(&self) -> u64 {
        (self.0 & FRAME_MASK) >> PAGE_SHIFT
    }

    /// Physical address of the frame
    pub const fn frame(&self) -> PhysAddr {
        PhysAddr::new(self.0 & FRAME_MASK)
    }

    /// Set the frame, leaving flags untouched
    ///
    /// # Panics
    /// If `frame` is not 4 KiB aligned or lies beyond [`PHYS_LIMIT`];
    /// storing it would silently drop address bits.
    pub fn set_frame(&mut self, frame: PhysAddr) {
        let addr = frame.as_u64();
        assert!(
            addr % PAGE_SIZE == 0 && addr < PHYS_LIMIT,
            "frame {:#x} is not a representable 4 KiB frame",
            addr
        );
        self.0 = (self.0 & !FRAME_MASK) | addr;
    }

    /// Get flags
    pub const fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Replace all named flags, keeping the frame and unnamed available bits
    ///
    /// # Panics
    /// If `flags` combine copy-on-write or shared with writable.
    pub fn set_flags(&mut self, flags: EntryFlags) {
        assert_cow_read_only(flags);
        self.0 = (self.0 & (FRAME_MASK | HIGH_AVAILABLE_MASK)) | flags.bits();
    }

    /// Add flags
    pub fn insert_flags(&mut self, flags: EntryFlags) {
        self.set_flags(self.flags().union(flags));
    }

    /// Remove flags
    pub fn remove_flags(&mut self, flags: EntryFlags) {
        self.set_flags(self.flags().difference(flags));
    }

    /// Reserved bits as stored
    pub const fn reserved_bits(&self) -> u64 {
        self.0 & RESERVED_MASK
    }

    /// Check if any reserved bit is set
    pub const fn has_reserved_bits(&self) -> bool {
        self.reserved_bits() != 0
    }

    /// Clear entry
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Finish a copy-on-write fault: point at the private copy, drop the
    /// copy-on-write mark and grant write access in one store.
    pub fn resolve_copy_on_write(&mut self, copy: PhysAddr) {
        let flags = self
            .flags()
            .difference(EntryFlags::COPY_ON_WRITE)
            .union(EntryFlags::WRITABLE);
        let mut resolved = *self;
        resolved.set_frame(copy);
        resolved.set_flags(flags);
        *self = resolved;
    }

    /// Turn a writable leaf into a shared copy-on-write leaf
    pub fn mark_copy_on_write(&mut self) {
        let flags = self
            .flags()
            .difference(EntryFlags::WRITABLE)
            .union(EntryFlags::COPY_ON_WRITE);
        self.set_flags(flags);
    }

    /// Mark a read-only leaf as sharing its frame
    pub fn mark_shared(&mut self) {
        debug_assert!(!self.is_writable());
        self.insert_flags(EntryFlags::SHARED);
    }
}

fn assert_cow_read_only(flags: EntryFlags) {
    assert!(
        !flags.intersects(EntryFlags::SHARING) || !flags.contains(EntryFlags::WRITABLE),
        "copy-on-write or shared entry must not be writable"
    );
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            write!(f, "PageTableEntry(not present)")
        } else {
            write!(f, "PageTableEntry(frame={:#x}, ", self.frame().as_u64())?;
            if self.is_writable() { write!(f, "W")?; } else { write!(f, "-")?; }
            if self.is_user() { write!(f, "U")?; } else { write!(f, "-")?; }
            if self.is_large() { write!(f, "L")?; } else { write!(f, "-")?; }
            if self.is_global() { write!(f, "G")?; } else { write!(f, "-")?; }
            if self.is_copy_on_write() { write!(f, "C")?; } else { write!(f, "-")?; }
            if self.is_shared() { write!(f, "S")?; } else { write!(f, "-")?; }
            if self.is_no_execute() { write!(f, "-")?; } else { write!(f, "X")?; }
            write!(f, ")")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bit_positions() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x1000),
            EntryFlags::PRESENT | EntryFlags::COPY_ON_WRITE | EntryFlags::NO_EXECUTE,
        );
        assert_eq!(entry.raw(), 0x8010_0000_0000_1001);
        assert_eq!(entry.frame_number(), 1);
    }

    #[test]
    fn test_entry_creation() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x1234_5000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        );
        assert!(entry.is_present());
        assert!(entry.is_writable());
        assert!(entry.is_user());
        assert!(!entry.is_large());
        assert!(!entry.is_no_execute());
        assert_eq!(entry.frame(), PhysAddr::new(0x1234_5000));
        assert!(!entry.has_reserved_bits());
    }

    #[test]
    fn test_table_entry_flags() {
        let kernel = PageTableEntry::table(PhysAddr::new(0x2000), false);
        assert_eq!(kernel.flags(), EntryFlags::TABLE);
        let user = PageTableEntry::table(PhysAddr::new(0x2000), true);
        assert!(user.is_user() && user.is_writable() && user.is_present());
    }

    #[test]
    fn test_flag_updates_keep_frame() {
        let mut entry = PageTableEntry::new(PhysAddr::new(0xABC000), EntryFlags::PRESENT);
        entry.insert_flags(EntryFlags::WRITABLE | EntryFlags::DIRTY);
        entry.remove_flags(EntryFlags::DIRTY);
        assert_eq!(entry.frame(), PhysAddr::new(0xABC000));
        assert_eq!(entry.flags(), EntryFlags::PRESENT | EntryFlags::WRITABLE);
    }

    #[test]
    fn test_unnamed_available_bits_survive() {
        let mut entry = PageTableEntry::from_raw((1 << 60) | 0x5000 | 1);
        entry.set_flags(EntryFlags::PRESENT | EntryFlags::GLOBAL);
        assert_eq!(entry.raw() & (1 << 60), 1 << 60);
        assert_eq!(entry.frame(), PhysAddr::new(0x5000));
    }

    #[test]
    fn test_reserved_detection() {
        let entry = PageTableEntry::from_raw(0x0000_0100_0000_0001);
        assert!(entry.has_reserved_bits());
        assert!(!PageTableEntry::empty().has_reserved_bits());
    }

    #[test]
    #[should_panic(expected = "not a representable")]
    fn test_unaligned_frame_rejected() {
        let _ = PageTableEntry::new(PhysAddr::new(0x1001), EntryFlags::PRESENT);
    }

    #[test]
    #[should_panic(expected = "not a representable")]
    fn test_frame_beyond_limit_rejected() {
        let _ = PageTableEntry::new(PhysAddr::new(PHYS_LIMIT), EntryFlags::PRESENT);
    }

    #[test]
    #[should_panic(expected = "must not be writable")]
    fn test_writable_cow_rejected() {
        let _ = PageTableEntry::new(
            PhysAddr::new(0x1000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::COPY_ON_WRITE,
        );
    }

    #[test]
    fn test_copy_on_write_transitions() {
        let mut entry = PageTableEntry::new(
            PhysAddr::new(0x7000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER | EntryFlags::NO_EXECUTE,
        );
        entry.mark_copy_on_write();
        assert!(entry.is_copy_on_write());
        assert!(!entry.is_writable());

        entry.resolve_copy_on_write(PhysAddr::new(0x9000));
        assert!(!entry.is_copy_on_write());
        assert!(entry.is_writable());
        assert!(entry.is_user() && entry.is_no_execute());
        assert_eq!(entry.frame(), PhysAddr::new(0x9000));
    }

    #[test]
    fn test_shared_mark() {
        let mut entry = PageTableEntry::new(
            PhysAddr::new(0x7000),
            EntryFlags::PRESENT | EntryFlags::USER,
        );
        entry.mark_shared();
        assert!(entry.is_shared() && entry.is_sharing());
        assert!(!entry.is_copy_on_write());
        assert_eq!(entry.raw() & (1 << 53), 1 << 53);
    }

    #[test]
    #[should_panic(expected = "must not be writable")]
    fn test_writable_shared_rejected() {
        let mut entry = PageTableEntry::new(
            PhysAddr::new(0x7000),
            EntryFlags::PRESENT | EntryFlags::USER | EntryFlags::SHARED,
        );
        entry.insert_flags(EntryFlags::WRITABLE);
    }

    fn flag_strategy() -> impl Strategy<Value = EntryFlags> {
        any::<u64>().prop_map(|bits| {
            let mut flags = EntryFlags::from_bits_truncate(bits);
            if flags.intersects(EntryFlags::SHARING) {
                flags.remove(EntryFlags::WRITABLE);
            }
            flags
        })
    }

    proptest! {
        #[test]
        fn prop_entry_round_trip(frame_number in 0u64..(1 << 28), flags in flag_strategy()) {
            let frame = PhysAddr::new(frame_number << PAGE_SHIFT);
            let entry = PageTableEntry::new(frame, flags);
            prop_assert_eq!(entry.frame(), frame);
            prop_assert_eq!(entry.flags(), flags);
            prop_assert_eq!(entry.reserved_bits(), 0);
            prop_assert_eq!(PageTableEntry::from_raw(entry.raw()), entry);
        }
    }
}
