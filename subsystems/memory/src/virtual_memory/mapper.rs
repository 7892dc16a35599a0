//! # Page Table Walker
//!
//! Walks the 4-level radix tree of one address space and mutates its
//! leaves. Intermediate tables are allocated lazily by creating walks and
//! are owned by the tree; leaf frames belong to the caller.
//!
//! A failed creating walk leaves the tables it already installed in place.
//! They are valid empty tables and the next mapping through them reuses
//! them.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use hexahedron_hal::{PageSize, PhysAddr, VirtAddr};

use super::entry::{EntryFlags, PageTableEntry};
use super::index::{index_at_level, is_canonical, TableLevel, ENTRIES_PER_TABLE, PAGE_SIZE_LARGE};
use super::table::PageTable;
use super::MemoryContext;
use crate::physical::{FrameAllocator, PhysicalMemory};
use crate::region::{is_kernel_shared_slot, region_of};
use crate::{Frame, MemError, MemResult};

/// Whether a walk may allocate missing tables
#[derive(Clone, Copy)]
enum WalkMode<'a> {
    /// Allocate missing intermediate tables (map)
    Create {
        /// Source of table frames
        frames: &'a dyn FrameAllocator,
        /// Grant user access on the path
        user: bool,
    },
    /// Report [`MemError::NotMapped`] at the first missing table
    Lookup,
}

/// Walk states, one per radix level plus the final leaf
enum WalkState {
    ResolveTop(PhysAddr),
    ResolveUpper(PhysAddr),
    ResolveDirectory(PhysAddr),
    ResolveTable(PhysAddr),
    Leaf(NonNull<PageTableEntry>, TableLevel),
}

impl WalkState {
    fn below(level: TableLevel, table: PhysAddr) -> Self {
        match level {
            TableLevel::Top => WalkState::ResolveUpper(table),
            TableLevel::Upper => WalkState::ResolveDirectory(table),
            TableLevel::Directory | TableLevel::Table => WalkState::ResolveTable(table),
        }
    }
}

/// Entry slot reached by a walk
struct Located {
    slot: NonNull<PageTableEntry>,
    level: TableLevel,
}

impl Located {
    fn read(&self) -> PageTableEntry {
        // SAFETY: the slot lies in a live table of the tree being walked.
        unsafe { self.slot.as_ptr().read_volatile() }
    }

    /// Callers hold the tree exclusively.
    fn write(&self, entry: PageTableEntry) {
        // SAFETY: as for `read`, and no other walker runs concurrently.
        unsafe { self.slot.as_ptr().write_volatile(entry) }
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Frame backing the page
    pub frame: PhysAddr,
    /// Leaf attributes
    pub flags: EntryFlags,
    /// Size of the leaf mapping
    pub size: PageSize,
}

impl Translation {
    /// Physical address for `virt` inside this mapping
    pub fn address(&self, virt: VirtAddr) -> PhysAddr {
        self.frame.add(virt.as_u64() & (self.size.size() - 1))
    }
}

fn slot(memory: &dyn PhysicalMemory, table: PhysAddr, index: usize) -> NonNull<PageTableEntry> {
    debug_assert!(index < ENTRIES_PER_TABLE);
    let base = memory.table_ptr(table).cast::<PageTableEntry>();
    // SAFETY: a `PageTable` is a `repr(C)` array of 512 entries and `index`
    // is below 512; `table_ptr` never yields null for a live frame.
    unsafe { NonNull::new_unchecked(base.add(index)) }
}

pub(crate) fn read_slot(memory: &dyn PhysicalMemory, table: PhysAddr, index: usize) -> PageTableEntry {
    // SAFETY: see `slot`.
    unsafe { slot(memory, table, index).as_ptr().read_volatile() }
}

pub(crate) fn write_slot(memory: &dyn PhysicalMemory, table: PhysAddr, index: usize, entry: PageTableEntry) {
    // SAFETY: see `slot`; callers hold the tree exclusively.
    unsafe { slot(memory, table, index).as_ptr().write_volatile(entry) }
}

/// Reserved bits read back from a table mean the tree is corrupt.
fn check_entry(entry: PageTableEntry, level: TableLevel, table: PhysAddr) {
    if cfg!(feature = "strict_reserved") && entry.has_reserved_bits() {
        log::error!(
            "reserved bits {:#x} set in {:?} table at {:#x}",
            entry.reserved_bits(),
            level,
            table
        );
        panic!("page table corruption: reserved bits set in {:?} entry {:?}", level, entry);
    }
}

fn assert_canonical(virt: VirtAddr) {
    if !is_canonical(virt.as_u64()) {
        log::error!("non-canonical address {:#x} reached the page table walker", virt);
        panic!("non-canonical address {:#x} reached the page table walker", virt);
    }
}

fn zeroed_table(memory: &dyn PhysicalMemory, frames: &dyn FrameAllocator) -> MemResult<PhysAddr> {
    let frame = frames.allocate_frame()?.address();
    assert!(
        frame.is_aligned(PageSize::Size4KiB.size()),
        "frame allocator returned unaligned frame {:#x}",
        frame
    );
    // SAFETY: the frame was just handed to us and nothing else references it.
    unsafe { memory.table_ptr(frame).write(PageTable::empty()) };
    Ok(frame)
}

fn leaf_size(level: TableLevel) -> PageSize {
    match level {
        TableLevel::Upper => PageSize::Size1GiB,
        TableLevel::Directory => PageSize::Size2MiB,
        TableLevel::Top | TableLevel::Table => PageSize::Size4KiB,
    }
}

/// Address covered by `index` in a table at `level` whose first address is `base`
fn child_base(base: u64, index: usize, level: TableLevel) -> u64 {
    let addr = base | ((index as u64) << level.shift());
    if level == TableLevel::Top && addr & (1 << 47) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr
    }
}

/// The page table tree of one address space
#[derive(Debug)]
pub struct PageTableTree {
    root: PhysAddr,
    tables: AtomicUsize,
    pages: AtomicUsize,
}

impl PageTableTree {
    /// Create a tree with a fresh, zeroed root table
    pub fn new(ctx: &MemoryContext) -> MemResult<Self> {
        let root = zeroed_table(ctx.memory(), ctx.frames())?;
        log::debug!("new page table root at {:#x}", root);
        Ok(Self {
            root,
            tables: AtomicUsize::new(0),
            pages: AtomicUsize::new(0),
        })
    }

    /// Physical address of the root table
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Intermediate tables owned by this tree (root excluded)
    pub fn table_count(&self) -> usize {
        self.tables.load(Ordering::Relaxed)
    }

    /// 4 KiB leaves installed through this tree
    pub fn page_count(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }

    fn walk(
        &self,
        memory: &dyn PhysicalMemory,
        virt: VirtAddr,
        target: TableLevel,
        mode: WalkMode<'_>,
    ) -> MemResult<Located> {
        assert_canonical(virt);
        let mut state = WalkState::ResolveTop(self.root);
        loop {
            state = match state {
                WalkState::ResolveTop(table) => self.resolve(memory, table, TableLevel::Top, virt, target, mode)?,
                WalkState::ResolveUpper(table) => self.resolve(memory, table, TableLevel::Upper, virt, target, mode)?,
                WalkState::ResolveDirectory(table) => {
                    self.resolve(memory, table, TableLevel::Directory, virt, target, mode)?
                }
                WalkState::ResolveTable(table) => self.resolve(memory, table, TableLevel::Table, virt, target, mode)?,
                WalkState::Leaf(slot, level) => return Ok(Located { slot, level }),
            };
        }
    }

    fn resolve(
        &self,
        memory: &dyn PhysicalMemory,
        table: PhysAddr,
        level: TableLevel,
        virt: VirtAddr,
        target: TableLevel,
        mode: WalkMode<'_>,
    ) -> MemResult<WalkState> {
        let index = index_at_level(virt.as_u64(), level);
        let target_slot = slot(memory, table, index);
        // SAFETY: `table` is the root or came from a present entry of this tree.
        let entry = unsafe { target_slot.as_ptr().read_volatile() };
        check_entry(entry, level, table);

        if level == target {
            return Ok(WalkState::Leaf(target_slot, level));
        }

        if entry.is_present() {
            if entry.is_large() && level != TableLevel::Top {
                return match mode {
                    WalkMode::Lookup => Ok(WalkState::Leaf(target_slot, level)),
                    WalkMode::Create { .. } => Err(MemError::HugePage),
                };
            }
            if let WalkMode::Create { user: true, .. } = mode {
                if !entry.is_user() {
                    let mut widened = entry;
                    widened.insert_flags(EntryFlags::USER);
                    // SAFETY: creating walks run with the tree held exclusively.
                    unsafe { target_slot.as_ptr().write_volatile(widened) };
                }
            }
            return Ok(WalkState::below(level, entry.frame()));
        }

        match mode {
            WalkMode::Lookup => Err(MemError::NotMapped),
            WalkMode::Create { frames, user } => {
                let frame = zeroed_table(memory, frames)?;
                // SAFETY: creating walks run with the tree held exclusively.
                unsafe { target_slot.as_ptr().write_volatile(PageTableEntry::table(frame, user)) };
                self.tables.fetch_add(1, Ordering::Relaxed);
                log::debug!("{:?} table for {:#x} created at {:#x}", level.next(), virt, frame);
                Ok(WalkState::below(level, frame))
            }
        }
    }

    /// Install a 4 KiB leaf
    ///
    /// Returns the frame that was replaced when `overwrite` allowed it.
    pub fn map(
        &mut self,
        ctx: &MemoryContext,
        virt: VirtAddr,
        frame: PhysAddr,
        flags: EntryFlags,
        overwrite: bool,
    ) -> MemResult<Option<PhysAddr>> {
        let mode = WalkMode::Create {
            frames: ctx.frames(),
            user: flags.contains(EntryFlags::USER),
        };
        let located = self.walk(ctx.memory(), virt, TableLevel::Table, mode)?;
        let old = located.read();
        let previous = if old.is_present() {
            if !overwrite {
                return Err(MemError::AlreadyMapped);
            }
            Some(old.frame())
        } else {
            self.pages.fetch_add(1, Ordering::Relaxed);
            None
        };

        located.write(PageTableEntry::new(frame, flags));
        ctx.tlb().invalidate(virt);
        log::trace!("mapped {:#x} -> {:#x} ({:?})", virt, frame, flags);
        Ok(previous)
    }

    /// Install a 2 MiB leaf at the directory level
    pub fn map_large(
        &mut self,
        ctx: &MemoryContext,
        virt: VirtAddr,
        frame: PhysAddr,
        flags: EntryFlags,
    ) -> MemResult<()> {
        if !virt.is_aligned(PAGE_SIZE_LARGE) || !frame.is_aligned(PAGE_SIZE_LARGE) {
            return Err(MemError::InvalidAddress);
        }
        let mode = WalkMode::Create {
            frames: ctx.frames(),
            user: flags.contains(EntryFlags::USER),
        };
        let located = self.walk(ctx.memory(), virt, TableLevel::Directory, mode)?;
        if located.read().is_present() {
            return Err(MemError::AlreadyMapped);
        }

        located.write(PageTableEntry::new(frame, flags | EntryFlags::LARGE_PAGE));
        ctx.tlb().invalidate(virt);
        log::trace!("mapped large {:#x} -> {:#x} ({:?})", virt, frame, flags);
        Ok(())
    }

    /// Remove a 4 KiB leaf, returning its frame
    pub fn unmap(&mut self, ctx: &MemoryContext, virt: VirtAddr) -> MemResult<PhysAddr> {
        let located = self.walk(ctx.memory(), virt, TableLevel::Table, WalkMode::Lookup)?;
        if located.level != TableLevel::Table {
            return Err(MemError::HugePage);
        }
        let old = located.read();
        if !old.is_present() {
            return Err(MemError::NotMapped);
        }

        located.write(PageTableEntry::empty());
        self.pages.fetch_sub(1, Ordering::Relaxed);
        ctx.tlb().invalidate(virt);
        log::trace!("unmapped {:#x} (was {:#x})", virt, old.frame());
        Ok(old.frame())
    }

    /// Replace the attributes of a 4 KiB leaf, keeping its frame, the
    /// hardware-managed accessed/dirty bits and its sharing marks
    ///
    /// A leaf whose frame is shared with another space stays read-only:
    /// asking for [`EntryFlags::WRITABLE`] on it, or for a sharing mark on
    /// any leaf, fails with [`MemError::InvalidAttributes`].
    pub fn update(&mut self, ctx: &MemoryContext, virt: VirtAddr, flags: EntryFlags) -> MemResult<()> {
        if flags.intersects(EntryFlags::SHARING) {
            return Err(MemError::InvalidAttributes);
        }
        let located = self.walk(ctx.memory(), virt, TableLevel::Table, WalkMode::Lookup)?;
        if located.level != TableLevel::Table {
            return Err(MemError::HugePage);
        }
        let mut entry = located.read();
        if !entry.is_present() {
            return Err(MemError::NotMapped);
        }
        if entry.is_sharing() && flags.contains(EntryFlags::WRITABLE) {
            log::debug!("refusing write access to shared leaf {:#x}", virt);
            return Err(MemError::InvalidAttributes);
        }

        let kept = entry
            .flags()
            .intersection(EntryFlags::HARDWARE_MANAGED.union(EntryFlags::SHARING));
        entry.set_flags(flags.union(kept));
        located.write(entry);
        ctx.tlb().invalidate(virt);
        log::trace!("updated {:#x} to {:?}", virt, entry.flags());
        Ok(())
    }

    /// Resolve the leaf mapping `virt`
    pub fn lookup(&self, memory: &dyn PhysicalMemory, virt: VirtAddr) -> MemResult<Translation> {
        let located = self.walk(memory, virt, TableLevel::Table, WalkMode::Lookup)?;
        let entry = located.read();
        if !entry.is_present() {
            return Err(MemError::NotMapped);
        }
        let size = leaf_size(located.level);
        Ok(Translation {
            frame: entry.frame().align_down(size.size()),
            flags: entry.flags(),
            size,
        })
    }

    /// Make sure the top-level slot has a table below it
    pub fn reserve_slot(&mut self, ctx: &MemoryContext, slot: usize) -> MemResult<()> {
        let entry = read_slot(ctx.memory(), self.root, slot);
        check_entry(entry, TableLevel::Top, self.root);
        if entry.is_present() {
            return Ok(());
        }
        let frame = zeroed_table(ctx.memory(), ctx.frames())?;
        write_slot(ctx.memory(), self.root, slot, PageTableEntry::table(frame, false));
        self.tables.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Point this tree's kernel-shared top-level slots at `kernel`'s tables
    pub fn share_kernel_slots(&mut self, memory: &dyn PhysicalMemory, kernel: &PageTableTree) {
        for index in (0..ENTRIES_PER_TABLE).filter(|&i| is_kernel_shared_slot(i)) {
            let entry = read_slot(memory, kernel.root, index);
            write_slot(memory, self.root, index, entry);
        }
    }

    /// Release every table and owned frame reachable from the private
    /// top-level slots, then the root itself
    ///
    /// Leaf frames of user-accessible process memory go back through
    /// [`FrameAllocator::deallocate_frame`], copy-on-write and shared leaves
    /// through [`FrameAllocator::release_shared`]. Device and kernel-only
    /// leaves are left alone.
    pub fn teardown(&mut self, ctx: &MemoryContext) {
        let released = self.release_level(ctx, self.root, TableLevel::Top, 0);
        ctx.frames().deallocate_frame(Frame::small(self.root));
        self.tables.store(0, Ordering::Relaxed);
        self.pages.store(0, Ordering::Relaxed);
        log::debug!("released page table root {:#x} and {} tables", self.root, released);
    }

    fn release_level(&self, ctx: &MemoryContext, table: PhysAddr, level: TableLevel, base: u64) -> usize {
        let mut released = 0;
        for index in 0..ENTRIES_PER_TABLE {
            if level == TableLevel::Top && is_kernel_shared_slot(index) {
                continue;
            }
            let entry = read_slot(ctx.memory(), table, index);
            check_entry(entry, level, table);
            if !entry.is_present() {
                continue;
            }
            let virt = child_base(base, index, level);
            match level.next() {
                Some(next) if !entry.is_large() || level == TableLevel::Top => {
                    released += self.release_level(ctx, entry.frame(), next, virt);
                    ctx.frames().deallocate_frame(Frame::small(entry.frame()));
                    released += 1;
                }
                _ => release_leaf(ctx, VirtAddr::new(virt), entry, leaf_size(level)),
            }
        }
        released
    }

    /// Copy the private half of this tree into `child`, sharing process
    /// memory copy-on-write
    ///
    /// Every user-accessible leaf in the userspace and stack regions is
    /// shared: writable leaves are marked copy-on-write in both trees,
    /// read-only ones keep their attributes and gain the shared mark.
    /// Other leaves are copied as is.
    /// Returns the number of leaves now shared.
    #[cfg(feature = "cow")]
    pub fn clone_into(&mut self, ctx: &MemoryContext, child: &mut PageTableTree) -> MemResult<usize> {
        let dst = child.root;
        let shared = self.clone_level(ctx, child, self.root, dst, TableLevel::Top, 0);
        // Entries marked so far are shared even if the clone failed.
        ctx.tlb().invalidate_all();
        shared
    }

    #[cfg(feature = "cow")]
    fn clone_level(
        &self,
        ctx: &MemoryContext,
        child: &PageTableTree,
        src: PhysAddr,
        dst: PhysAddr,
        level: TableLevel,
        base: u64,
    ) -> MemResult<usize> {
        let memory = ctx.memory();
        let mut shared = 0;
        for index in 0..ENTRIES_PER_TABLE {
            if level == TableLevel::Top && is_kernel_shared_slot(index) {
                continue;
            }
            let mut entry = read_slot(memory, src, index);
            check_entry(entry, level, src);
            if !entry.is_present() {
                continue;
            }
            let virt = child_base(base, index, level);
            match level.next() {
                Some(next) if !entry.is_large() || level == TableLevel::Top => {
                    let copy = zeroed_table(memory, ctx.frames())?;
                    let mut link = entry;
                    link.set_frame(copy);
                    // Linked before filling so a failed clone is torn down with the child.
                    write_slot(memory, dst, index, link);
                    child.tables.fetch_add(1, Ordering::Relaxed);
                    shared += self.clone_level(ctx, child, entry.frame(), copy, next, virt)?;
                }
                _ => {
                    if is_private_leaf(VirtAddr::new(virt), entry) {
                        if entry.is_writable() || entry.is_copy_on_write() {
                            entry.mark_copy_on_write();
                        } else {
                            entry.mark_shared();
                        }
                        write_slot(memory, src, index, entry);
                        let size = leaf_size(level);
                        ctx.frames().retain_shared(Frame::new(entry.frame().align_down(size.size()), size));
                        shared += 1;
                    }
                    write_slot(memory, dst, index, entry);
                    child.pages.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(shared)
    }
}

/// User-accessible leaf in the userspace or stack regions
fn is_private_leaf(virt: VirtAddr, entry: PageTableEntry) -> bool {
    entry.is_user() && region_of(virt).is_some_and(|region| region.kind.is_process_private())
}

fn release_leaf(ctx: &MemoryContext, virt: VirtAddr, entry: PageTableEntry, size: PageSize) {
    if !is_private_leaf(virt, entry) {
        return;
    }
    let frame = Frame::new(entry.frame().align_down(size.size()), size);
    if entry.is_sharing() {
        ctx.frames().release_shared(frame);
    } else {
        ctx.frames().deallocate_frame(frame);
    }
}
