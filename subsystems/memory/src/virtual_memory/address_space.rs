//! # Address Space Management
//!
//! An address space is one page table tree plus the lock that serializes
//! structural changes to it. The kernel space is built once at boot and
//! owns the kernel-shared top-level slots; every process space points its
//! own root at those same tables.
//!
//! Tables below a kernel-shared slot are reachable from every root, so
//! changes under those slots go through the kernel tree and its lock no
//! matter which space they are requested on.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hexahedron_hal::{PhysAddr, VirtAddr};
use spin::{Once, RwLock};

use super::entry::EntryFlags;
use super::index::{align_down, align_up, index_at_level, is_canonical, TableLevel, PAGE_SIZE, PAGE_SIZE_LARGE};
use super::mapper::{PageTableTree, Translation};
use super::{AddressSpaceId, MemoryContext, SpaceStats};
use crate::protection::{self, Mapping, MappingPurpose};
use crate::region::{
    is_kernel_shared_slot, kernel_shared_slots, region_for_range, KERNEL_IMAGE_REGION, KERNEL_IMAGE_SIZE,
    PHYSMEM_MAP_REGION, PHYSMEM_MAP_SIZE,
};
use crate::{MemError, MemResult};

/// Boot hand-off values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// Total usable memory (highest physical address)
    pub memory_size: u64,
    /// First physical address after the kernel image
    pub first_free: u64,
    /// End of the kernel text, when the loader reports it
    pub text_end: Option<u64>,
}

impl BootInfo {
    /// Create boot info
    pub const fn new(memory_size: u64, first_free: u64) -> Self {
        Self {
            memory_size,
            first_free,
            text_end: None,
        }
    }

    /// Split the image into executable text below `text_end` and
    /// writable data above it
    pub const fn with_text_end(mut self, text_end: u64) -> Self {
        self.text_end = Some(text_end);
        self
    }

    /// Clamp to what the layout can map
    ///
    /// `memory_size` is limited to the physical-map window and rounded
    /// down to a page; `first_free` is limited to the kernel image window
    /// and to `memory_size`, then rounded up to a page. `text_end` is
    /// rounded up to a page and limited to `first_free`.
    pub fn clamped(self) -> Self {
        let mut memory_size = self.memory_size;
        if memory_size > PHYSMEM_MAP_SIZE {
            log::warn!(
                "memory size {:#x} exceeds the physical map, clamping to {:#x}",
                memory_size,
                PHYSMEM_MAP_SIZE
            );
            memory_size = PHYSMEM_MAP_SIZE;
        }
        let memory_size = align_down(memory_size);

        let limit = memory_size.min(KERNEL_IMAGE_SIZE);
        let mut first_free = self.first_free;
        if first_free > limit {
            log::warn!("first free address {:#x} clamped to {:#x}", first_free, limit);
            first_free = limit;
        }
        let first_free = align_up(first_free);

        Self {
            memory_size,
            first_free,
            text_end: self.text_end.map(|end| align_up(end.min(first_free))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceKind {
    Kernel,
    User,
}

/// A virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    id: AddressSpaceId,
    kind: SpaceKind,
    tree: Arc<RwLock<PageTableTree>>,
    /// Owner of the kernel-shared slots, `tree` itself for the kernel space
    kernel: Arc<RwLock<PageTableTree>>,
    ctx: MemoryContext,
}

impl AddressSpace {
    /// Build the kernel address space
    ///
    /// Pre-creates the kernel-shared top-level tables, identity-maps the
    /// kernel image, maps it again in the kernel image window and maps
    /// physical memory into the physical-map window.
    ///
    /// With a text boundary the high image is executable read-only text
    /// followed by no-execute data. Without one it is mapped writable and
    /// executable as a whole.
    pub fn new_kernel(ctx: MemoryContext, boot: BootInfo) -> MemResult<Self> {
        let boot = boot.clamped();
        let mut tree = PageTableTree::new(&ctx)?;
        for slot in kernel_shared_slots() {
            tree.reserve_slot(&ctx, slot)?;
        }

        // Boot code keeps running from the identity map until it jumps high.
        let identity = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        let image_base = VirtAddr::new(KERNEL_IMAGE_REGION);
        let code = protection::resolve(image_base, PhysAddr::zero(), &Mapping::new(MappingPurpose::KernelCode))?;
        let data = protection::resolve(image_base, PhysAddr::zero(), &Mapping::new(MappingPurpose::KernelData))?;
        let (text_end, text) = match boot.text_end {
            Some(end) => (end, code),
            None => {
                log::warn!("no kernel text boundary, mapping the kernel image writable and executable");
                (boot.first_free, code | EntryFlags::WRITABLE)
            }
        };
        for offset in (0..boot.first_free).step_by(PAGE_SIZE as usize) {
            let frame = PhysAddr::new(offset);
            let image = if offset < text_end { text } else { data };
            tree.map(&ctx, VirtAddr::new(offset), frame, identity, false)?;
            tree.map(&ctx, VirtAddr::new(KERNEL_IMAGE_REGION + offset), frame, image, false)?;
        }

        map_physical_memory(&mut tree, &ctx, boot.memory_size)?;

        let tree = Arc::new(RwLock::new(tree));
        let space = Self {
            id: AddressSpaceId::KERNEL,
            kind: SpaceKind::Kernel,
            tree: tree.clone(),
            kernel: tree,
            ctx,
        };
        log::info!(
            "kernel address space at {:#x}: {:#x} bytes of image ({:#x} text), {:#x} bytes of physical memory mapped",
            space.root(),
            boot.first_free,
            text_end,
            boot.memory_size
        );
        Ok(space)
    }

    /// Create an empty process address space sharing `kernel`'s slots
    pub fn new_user(kernel: &AddressSpace) -> MemResult<Self> {
        let ctx = kernel.ctx.clone();
        let mut tree = PageTableTree::new(&ctx)?;
        tree.share_kernel_slots(ctx.memory(), &kernel.kernel.read());

        let space = Self {
            id: AddressSpaceId::new(),
            kind: SpaceKind::User,
            tree: Arc::new(RwLock::new(tree)),
            kernel: kernel.kernel.clone(),
            ctx,
        };
        log::debug!("address space {:?} created at {:#x}", space.id, space.root());
        Ok(space)
    }

    /// Address space ID
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Whether this is the kernel space
    pub fn is_kernel(&self) -> bool {
        self.kind == SpaceKind::Kernel
    }

    /// Physical address of the root table
    pub fn root(&self) -> PhysAddr {
        self.tree.read().root()
    }

    /// Collaborators of this space
    pub fn context(&self) -> &MemoryContext {
        &self.ctx
    }

    /// Table and page counts of this space's own tree
    ///
    /// Tables and pages under the kernel-shared slots are counted by the
    /// kernel space.
    pub fn stats(&self) -> SpaceStats {
        let tree = self.tree.read();
        SpaceStats {
            tables: tree.table_count(),
            pages: tree.page_count(),
        }
    }

    /// Tree responsible for the top-level slot covering `virt`
    fn tree_for(&self, virt: VirtAddr) -> &RwLock<PageTableTree> {
        if is_kernel_shared_slot(index_at_level(virt.as_u64(), TableLevel::Top)) {
            &self.kernel
        } else {
            &self.tree
        }
    }

    /// Map one page
    pub fn map(&self, virt: VirtAddr, frame: PhysAddr, mapping: &Mapping) -> MemResult<()> {
        let flags = protection::resolve(virt, frame, mapping)?;
        self.tree_for(virt)
            .write()
            .map(&self.ctx, virt, frame, flags, mapping.allows_overwrite())
            .map(|_| ())
    }

    /// Map `len` bytes of contiguous frames starting at `frame`
    ///
    /// The range must lie inside one region; that and the attributes are
    /// checked before any page is mapped. Pages mapped before a later
    /// failure (out of memory, already mapped) stay mapped.
    pub fn map_range(&self, virt: VirtAddr, frame: PhysAddr, len: u64, mapping: &Mapping) -> MemResult<()> {
        let pages = page_count(virt, len)?;
        if pages == 0 {
            return Ok(());
        }
        let flags = protection::resolve_range(virt, frame, len, mapping)?;
        let mut tree = self.tree_for(virt).write();
        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            let page_virt = VirtAddr::new(virt.as_u64() + offset);
            tree.map(&self.ctx, page_virt, frame.add(offset), flags, mapping.allows_overwrite())?;
        }
        Ok(())
    }

    /// Unmap one page, returning its frame
    pub fn unmap(&self, virt: VirtAddr) -> MemResult<PhysAddr> {
        protection::check_virtual(virt)?;
        self.tree_for(virt).write().unmap(&self.ctx, virt)
    }

    /// Unmap every mapped page in `len` bytes, returning their frames
    ///
    /// The range must lie inside one region. Pages that were not mapped
    /// are skipped.
    pub fn unmap_range(&self, virt: VirtAddr, len: u64) -> MemResult<Vec<PhysAddr>> {
        let pages = page_count(virt, len)?;
        if pages == 0 {
            return Ok(Vec::new());
        }
        region_for_range(virt, len)?;
        let mut tree = self.tree_for(virt).write();
        let mut frames = Vec::new();
        for page in 0..pages {
            let page_virt = VirtAddr::new(virt.as_u64() + page * PAGE_SIZE);
            match tree.unmap(&self.ctx, page_virt) {
                Ok(frame) => frames.push(frame),
                Err(MemError::NotMapped) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(frames)
    }

    /// Replace the attributes of a mapped page
    pub fn set_attributes(&self, virt: VirtAddr, flags: EntryFlags) -> MemResult<()> {
        let flags = protection::resolve_update(virt, flags)?;
        self.tree_for(virt).write().update(&self.ctx, virt, flags)
    }

    /// Attributes of the leaf mapping `virt`
    pub fn attributes(&self, virt: VirtAddr) -> MemResult<EntryFlags> {
        self.lookup(virt).map(|translation| translation.flags)
    }

    /// Physical address `virt` translates to
    pub fn translate(&self, virt: VirtAddr) -> MemResult<PhysAddr> {
        self.lookup(virt).map(|translation| translation.address(virt))
    }

    /// Leaf mapping covering `virt`
    pub fn lookup(&self, virt: VirtAddr) -> MemResult<Translation> {
        if !is_canonical(virt.as_u64()) {
            return Err(MemError::InvalidAddress);
        }
        self.tree_for(virt).read().lookup(self.ctx.memory(), virt)
    }

    /// Clone this space copy-on-write
    ///
    /// Writable process memory becomes read-only and copy-on-write in both
    /// spaces; the write fault handler splits it again. Read-only process
    /// memory is shared as is.
    #[cfg(feature = "cow")]
    pub fn fork(&self) -> MemResult<AddressSpace> {
        let ctx = self.ctx.clone();
        let mut parent = self.tree.write();
        let mut tree = PageTableTree::new(&ctx)?;
        // The parent's shared slots hold the kernel's entries.
        tree.share_kernel_slots(ctx.memory(), &parent);

        // Dropping the child on failure releases what was copied so far.
        let child = Self {
            id: AddressSpaceId::new(),
            kind: SpaceKind::User,
            tree: Arc::new(RwLock::new(tree)),
            kernel: self.kernel.clone(),
            ctx,
        };
        let shared = {
            let mut copy = child.tree.write();
            parent.clone_into(&self.ctx, &mut copy)
        }?;
        log::debug!("address space {:?} forked into {:?}, {} pages shared", self.id, child.id, shared);
        Ok(child)
    }

    /// Switch the current processor to this space
    ///
    /// # Safety
    /// The space must map the code and stack currently executing, and must
    /// outlive its use on this processor.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn activate(&self) {
        use hexahedron_hal::arch::x86_64::paging;

        let root = self.root();
        if paging::read_cr3() == root {
            return;
        }
        log::trace!("activating address space {:?} ({:#x})", self.id, root);
        // SAFETY: forwarded to the caller.
        unsafe { paging::write_cr3(root) };
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.kind == SpaceKind::Kernel {
            return;
        }
        let mut tree = self.tree.write();
        let (tables, pages) = (tree.table_count(), tree.page_count());
        tree.teardown(&self.ctx);
        log::debug!("address space {:?} torn down ({} tables, {} pages)", self.id, tables, pages);
    }
}

/// Pages touched by `[virt, virt + len)`, the last one possibly partial
fn page_count(virt: VirtAddr, len: u64) -> MemResult<u64> {
    protection::check_virtual(virt)?;
    if len == 0 {
        return Ok(0);
    }
    virt.checked_add(len - 1).ok_or(MemError::InvalidAddress)?;
    Ok(len.div_ceil(PAGE_SIZE))
}

/// Map `[0, memory_size)` at the physical-map window, 2 MiB at a time
/// where possible
fn map_physical_memory(tree: &mut PageTableTree, ctx: &MemoryContext, memory_size: u64) -> MemResult<()> {
    let mapping = Mapping::new(MappingPurpose::PhysicalMap);
    let flags = protection::resolve(VirtAddr::new(PHYSMEM_MAP_REGION), PhysAddr::zero(), &mapping)?;

    let mut offset = 0;
    while offset < memory_size {
        let virt = VirtAddr::new(PHYSMEM_MAP_REGION + offset);
        let frame = PhysAddr::new(offset);
        if offset % PAGE_SIZE_LARGE == 0 && memory_size - offset >= PAGE_SIZE_LARGE {
            tree.map_large(ctx, virt, frame, flags)?;
            offset += PAGE_SIZE_LARGE;
        } else {
            tree.map(ctx, virt, frame, flags, false)?;
            offset += PAGE_SIZE;
        }
    }
    Ok(())
}

static KERNEL_SPACE: Once<AddressSpace> = Once::new();

/// Build the kernel address space and install it globally
///
/// Can only be done once.
pub fn initialize(memory_size: u64, first_free: u64, ctx: MemoryContext) -> MemResult<&'static AddressSpace> {
    initialize_with(BootInfo::new(memory_size, first_free), ctx)
}

/// [`initialize`] with the full boot hand-off, text boundary included
pub fn initialize_with(boot: BootInfo, ctx: MemoryContext) -> MemResult<&'static AddressSpace> {
    if KERNEL_SPACE.is_completed() {
        return Err(MemError::AlreadyInitialized);
    }
    let space = AddressSpace::new_kernel(ctx, boot)?;
    let mut installed = false;
    let kernel = KERNEL_SPACE.call_once(|| {
        installed = true;
        space
    });
    if !installed {
        return Err(MemError::AlreadyInitialized);
    }
    Ok(kernel)
}

/// The global kernel address space
pub fn kernel_space() -> MemResult<&'static AddressSpace> {
    KERNEL_SPACE.get().ok_or(MemError::NotInitialized)
}
