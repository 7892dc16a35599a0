//! # Page Table
//!
//! One 4 KiB radix node: 512 entries, reached only through raw slot
//! pointers by the walker.

use static_assertions::const_assert_eq;

use super::entry::PageTableEntry;
use super::index::{ENTRIES_PER_TABLE, PAGE_SIZE};

/// Page table (512 entries, 4KiB aligned)
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const_assert_eq!(core::mem::size_of::<PageTable>(), PAGE_SIZE as usize);

impl PageTable {
    /// Create empty page table
    pub const fn empty() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRIES_PER_TABLE],
        }
    }
}

impl core::fmt::Debug for PageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().enumerate().filter(|(_, e)| e.is_present()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_page_table_layout() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
        assert_eq!(core::mem::size_of::<[PageTableEntry; ENTRIES_PER_TABLE]>(), 4096);
    }

    #[test]
    fn test_debug_lists_present_entries_only() {
        assert_eq!(format!("{:?}", PageTable::empty()), "{}");
    }
}
