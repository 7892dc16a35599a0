//! # x86_64 Paging
//!
//! CR3 access and TLB maintenance for 4-level paging.

use core::arch::asm;

use crate::mmu::{self, TranslationCache};
use crate::{PhysAddr, VirtAddr};

/// CR3 bits holding the root table address
const CR3_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Get the current root table address from CR3
pub fn read_cr3() -> PhysAddr {
    let cr3: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    PhysAddr::new(cr3 & CR3_ADDRESS_MASK)
}

/// Load a new root table into CR3
///
/// # Safety
/// `root` must be the physical address of a valid top-level table that maps
/// the currently executing code and stack.
pub unsafe fn write_cr3(root: PhysAddr) {
    unsafe {
        asm!("mov cr3, {}", in(reg) root.as_u64() & CR3_ADDRESS_MASK, options(nostack, preserves_flags));
    }
}

/// Invalidate a TLB entry
#[inline]
pub fn invlpg(addr: VirtAddr) {
    unsafe {
        asm!("invlpg [{}]", in(reg) addr.as_u64(), options(nostack, preserves_flags));
    }
}

/// Flush all non-global TLB entries by reloading CR3
pub fn flush_all() {
    unsafe {
        let cr3: u64;
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
        asm!("mov cr3, {}", in(reg) cr3, options(nostack));
    }
}

/// TLB maintenance backed by `invlpg` and the registered shootdown hook
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Tlb;

impl X86Tlb {
    /// Create the TLB handle
    pub const fn new() -> Self {
        Self
    }
}

impl TranslationCache for X86Tlb {
    fn invalidate_local(&self, virt: VirtAddr) {
        invlpg(virt);
    }

    fn invalidate_all_local(&self) {
        flush_all();
    }

    fn shootdown(&self, virt: Option<VirtAddr>) {
        mmu::broadcast_shootdown(virt);
    }
}
