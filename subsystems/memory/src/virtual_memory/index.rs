//! # Index and Alignment Arithmetic
//!
//! Pure address arithmetic for 4-level paging.

/// Page size (4 KiB)
pub const PAGE_SIZE: u64 = 0x1000;

/// Large page size (2 MiB)
pub const PAGE_SIZE_LARGE: u64 = 0x20_0000;

/// Page shift
pub const PAGE_SHIFT: u32 = 12;

/// Entries per page table
pub const ENTRIES_PER_TABLE: usize = 512;

const INDEX_MASK: u64 = 0x1FF;
const OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Sign-extension bits above bit 47
const CANONICAL_HIGH: u64 = 0x1_FFFF;

/// Radix level of a page table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableLevel {
    /// Top level (bits 39-47)
    Top,
    /// Upper directory (bits 30-38)
    Upper,
    /// Directory (bits 21-29)
    Directory,
    /// Table (bits 12-20)
    Table,
}

impl TableLevel {
    /// Shift of this level's index within a virtual address
    pub const fn shift(self) -> u32 {
        match self {
            TableLevel::Top => PAGE_SHIFT + 27,
            TableLevel::Upper => PAGE_SHIFT + 18,
            TableLevel::Directory => PAGE_SHIFT + 9,
            TableLevel::Table => PAGE_SHIFT,
        }
    }

    /// The level below, `None` for [`TableLevel::Table`]
    pub const fn next(self) -> Option<TableLevel> {
        match self {
            TableLevel::Top => Some(TableLevel::Upper),
            TableLevel::Upper => Some(TableLevel::Directory),
            TableLevel::Directory => Some(TableLevel::Table),
            TableLevel::Table => None,
        }
    }
}

/// Align an address up to the next page boundary
///
/// Already aligned addresses are returned unchanged. Wraps at the top of
/// the address space.
#[inline]
pub const fn align_up(addr: u64) -> u64 {
    addr.wrapping_add(OFFSET_MASK) & !OFFSET_MASK
}

/// Align an address down to its page boundary
#[inline]
pub const fn align_down(addr: u64) -> u64 {
    addr & !OFFSET_MASK
}

/// Check page alignment
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & OFFSET_MASK == 0
}

/// Index selecting the entry for `addr` in a table at `level`
#[inline]
pub const fn index_at_level(addr: u64, level: TableLevel) -> usize {
    ((addr >> level.shift()) & INDEX_MASK) as usize
}

/// Check that bits 48-63 are a sign extension of bit 47
#[inline]
pub const fn is_canonical(addr: u64) -> bool {
    let upper = addr >> 47;
    upper == 0 || upper == CANONICAL_HIGH
}
