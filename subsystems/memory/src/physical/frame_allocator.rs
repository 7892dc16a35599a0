//! # Frame Allocator Trait
//!
//! The memory core does not manage physical memory itself. It borrows
//! frames for intermediate page tables and returns them on teardown.

use crate::{Frame, MemResult};

/// Source of zero-or-garbage 4 KiB physical frames
///
/// Implementations synchronize internally; every method takes `&self`.
pub trait FrameAllocator: Send + Sync {
    /// Allocate a frame
    ///
    /// Fails with [`MemError::OutOfMemory`](crate::MemError::OutOfMemory)
    /// when exhausted. The returned frame must be 4 KiB aligned.
    fn allocate_frame(&self) -> MemResult<Frame>;

    /// Deallocate a frame
    fn deallocate_frame(&self, frame: Frame);

    /// Take one more reference to a frame now shared copy-on-write
    ///
    /// Called once for every new sharer a fork creates.
    fn retain_shared(&self, frame: Frame) {
        let _ = frame;
    }

    /// Drop one reference to a frame shared copy-on-write
    ///
    /// Allocators that reference-count shared frames free the frame once
    /// the last sharer is gone. The default keeps the frame alive.
    fn release_shared(&self, frame: Frame) {
        let _ = frame;
    }
}
