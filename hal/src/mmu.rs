//! # MMU Abstraction
//!
//! Translation-cache maintenance as seen by the memory core.
//!
//! Every mutation of a live page table must be followed by an invalidation
//! of the stale translation on the local processor and, on SMP systems, on
//! every other processor that may have cached it. The remote half is a
//! hook installed once by the SMP layer; until one is registered the system
//! is treated as uniprocessor.

use crate::{HalError, HalResult, VirtAddr};
use spin::Once;

/// Cross-processor invalidation hook.
///
/// `Some(addr)` asks every other processor to drop the translation for
/// `addr`, `None` asks for a full flush. The hook must not return before
/// all targeted processors have acknowledged.
pub type ShootdownHook = fn(Option<VirtAddr>);

static SHOOTDOWN: Once<ShootdownHook> = Once::new();

/// Register the cross-processor invalidation hook
///
/// Can only be done once; later registrations are rejected.
pub fn register_shootdown(hook: ShootdownHook) -> HalResult<()> {
    if SHOOTDOWN.is_completed() {
        return Err(HalError::InvalidParameter);
    }
    SHOOTDOWN.call_once(|| hook);
    log::debug!("TLB shootdown hook registered");
    Ok(())
}

/// Run the registered shootdown hook, if any
pub fn broadcast_shootdown(addr: Option<VirtAddr>) {
    if let Some(hook) = SHOOTDOWN.get() {
        hook(addr);
    }
}

/// Translation cache (TLB) maintenance trait
pub trait TranslationCache: Send + Sync {
    /// Invalidate the translation for `virt` on the current processor
    fn invalidate_local(&self, virt: VirtAddr);

    /// Invalidate every non-global translation on the current processor
    fn invalidate_all_local(&self);

    /// Invalidate on all other processors and wait for acknowledgement
    fn shootdown(&self, virt: Option<VirtAddr>);

    /// Invalidate `virt` everywhere
    fn invalidate(&self, virt: VirtAddr) {
        self.invalidate_local(virt);
        self.shootdown(Some(virt));
    }

    /// Flush every processor's translation cache
    fn invalidate_all(&self) {
        self.invalidate_all_local();
        self.shootdown(None);
    }
}
