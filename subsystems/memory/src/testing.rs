//! Host-side collaborators for unit tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hexahedron_hal::mmu::TranslationCache;
use hexahedron_hal::{PhysAddr, VirtAddr};
use spin::Mutex;

use crate::physical::{FrameAllocator, PhysicalMemory};
use crate::virtual_memory::entry::PageTableEntry;
use crate::virtual_memory::index::PAGE_SIZE;
use crate::virtual_memory::mapper::{read_slot, write_slot};
use crate::virtual_memory::table::PageTable;
use crate::{Frame, MemError, MemResult, MemoryContext};

/// Physical address of the first pool frame
///
/// Leaf frames in tests sit below it, so releases of pool frames and of
/// leaf frames can be told apart.
pub(crate) const POOL_BASE: u64 = 0xF0_0000_0000;

/// Byte a fresh frame is filled with, reserved bits included
const POISON: u8 = 0xFF;

#[derive(Default)]
struct PoolState {
    frames: Vec<Box<PageTable>>,
    budget: Option<usize>,
    live: usize,
    released: Vec<PhysAddr>,
    retained: Vec<PhysAddr>,
    shared_released: Vec<PhysAddr>,
}

/// Frames backed by host memory, never reused
#[derive(Default)]
pub(crate) struct FramePool {
    state: Mutex<PoolState>,
}

impl FramePool {
    /// Allow only `budget` more allocations (`None` for unlimited)
    pub(crate) fn set_budget(&self, budget: Option<usize>) {
        self.state.lock().budget = budget;
    }

    /// Frames handed out and not yet given back
    pub(crate) fn live(&self) -> usize {
        self.state.lock().live
    }

    pub(crate) fn released(&self) -> Vec<PhysAddr> {
        self.state.lock().released.clone()
    }

    pub(crate) fn retained(&self) -> Vec<PhysAddr> {
        self.state.lock().retained.clone()
    }

    pub(crate) fn shared_released(&self) -> Vec<PhysAddr> {
        self.state.lock().shared_released.clone()
    }
}

impl FrameAllocator for FramePool {
    fn allocate_frame(&self) -> MemResult<Frame> {
        let mut state = self.state.lock();
        if let Some(left) = state.budget.as_mut() {
            if *left == 0 {
                return Err(MemError::OutOfMemory);
            }
            *left -= 1;
        }

        let mut table = Box::new(PageTable::empty());
        // SAFETY: the box holds exactly one table and any byte pattern is a
        // valid entry.
        unsafe { core::ptr::write_bytes(&mut *table as *mut PageTable, POISON, 1) };
        let address = PhysAddr::new(POOL_BASE + state.frames.len() as u64 * PAGE_SIZE);
        state.frames.push(table);
        state.live += 1;
        Ok(Frame::small(address))
    }

    fn deallocate_frame(&self, frame: Frame) {
        let mut state = self.state.lock();
        if frame.address().as_u64() >= POOL_BASE {
            state.live -= 1;
        }
        state.released.push(frame.address());
    }

    fn retain_shared(&self, frame: Frame) {
        self.state.lock().retained.push(frame.address());
    }

    fn release_shared(&self, frame: Frame) {
        self.state.lock().shared_released.push(frame.address());
    }
}

// SAFETY: every pool frame is a boxed table that lives as long as the pool
// and is never handed out twice.
unsafe impl PhysicalMemory for FramePool {
    fn table_ptr(&self, frame: PhysAddr) -> *mut PageTable {
        let mut state = self.state.lock();
        let index = frame
            .as_u64()
            .checked_sub(POOL_BASE)
            .map(|offset| (offset / PAGE_SIZE) as usize)
            .filter(|&index| index < state.frames.len())
            .unwrap_or_else(|| panic!("frame {:#x} is not a pool frame", frame));
        &mut *state.frames[index] as *mut PageTable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlbEvent {
    Local(VirtAddr),
    LocalAll,
    Shootdown(Option<VirtAddr>),
}

#[derive(Default)]
pub(crate) struct RecordingTlb {
    events: Mutex<Vec<TlbEvent>>,
}

impl RecordingTlb {
    pub(crate) fn events(&self) -> Vec<TlbEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TranslationCache for RecordingTlb {
    fn invalidate_local(&self, virt: VirtAddr) {
        self.events.lock().push(TlbEvent::Local(virt));
    }

    fn invalidate_all_local(&self) {
        self.events.lock().push(TlbEvent::LocalAll);
    }

    fn shootdown(&self, virt: Option<VirtAddr>) {
        self.events.lock().push(TlbEvent::Shootdown(virt));
    }
}

/// A context over a fresh pool and TLB recorder
pub(crate) fn context() -> (Arc<FramePool>, Arc<RecordingTlb>, MemoryContext) {
    let pool = Arc::new(FramePool::default());
    let tlb = Arc::new(RecordingTlb::default());
    let ctx = MemoryContext::new(pool.clone(), pool.clone(), tlb.clone());
    (pool, tlb, ctx)
}

/// Read entry `index` of the pool table at `table`
pub(crate) fn read_entry(pool: &FramePool, table: PhysAddr, index: usize) -> PageTableEntry {
    read_slot(pool, table, index)
}

/// Overwrite entry `index` of the pool table at `table`
pub(crate) fn write_entry(pool: &FramePool, table: PhysAddr, index: usize, entry: PageTableEntry) {
    write_slot(pool, table, index, entry)
}
