//! Virtual memory manager.
//!
//! Two-level IA-32 paging: a 1024-entry page directory per address space,
//! each entry pointing at a 1024-entry page table mapping 4 KiB pages.
//! Hardware directory entries hold *physical* table addresses; a shadow
//! array alongside the directory holds the *virtual* pointers the kernel
//! walks, because page tables live in the bootstrap heap.
//!
//! Every address space also carries a region table (at most
//! [`MAX_REGIONS`] entries) describing its mappings. Regions never
//! overlap and are always whole pages.
//!
//! The kernel quarter is shared across address spaces at directory-entry
//! granularity: user spaces copy the kernel's directory slots for
//! `[0xC0000000, 0xFE000000)` and never own tables there. The slots from
//! `KERNEL_TEMP_START` up remain private so each space can carry its own
//! transient mappings of foreign memory.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::{
    arch::hal,
    error::{KernelError, KernelResult},
    mm::{
        self, bootstrap, phys, PhysAddr, VirtAddr, KERNEL_HEAP_START, KERNEL_OFFSET,
        KERNEL_TEMP_START, PAGE_SIZE, USER_HEAP_START,
    },
};

/// Maximum regions per address space.
pub const MAX_REGIONS: usize = 32;

/// First page-directory slot of the kernel quarter.
pub const KERNEL_SLOT_START: usize = KERNEL_OFFSET >> 22;

/// First page-directory slot of the per-space temp window; slots from
/// here on are never shared.
pub const KERNEL_SLOT_PRIVATE: usize = KERNEL_TEMP_START >> 22;

/// Number of shared kernel directory slots.
pub const KERNEL_SHARED_SLOTS: usize = KERNEL_SLOT_PRIVATE - KERNEL_SLOT_START;

bitflags! {
    /// What a virtual region is used for. `AUTO_FREE` additionally makes
    /// `unmap_region` return the backing frames to the frame allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionUsage: u32 {
        const RESERVED  = 0x001;
        const KERNEL    = 0x002;
        const USER      = 0x004;
        const HEAP      = 0x008;
        const STACK     = 0x010;
        const AUTO_FREE = 0x020;
        const TEMP      = 0x040;
        const CODE      = 0x080;
        const DATA      = 0x100;

        const KERNEL_HEAP  = Self::KERNEL.bits() | Self::HEAP.bits();
        const KERNEL_STACK = Self::KERNEL.bits() | Self::STACK.bits();
        const USER_HEAP    = Self::USER.bits() | Self::HEAP.bits();
        const USER_STACK   = Self::USER.bits() | Self::STACK.bits();
    }
}

/// Page access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// One entry in an address space's region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub phys: PhysAddr,
    pub virt: VirtAddr,
    pub size: usize,
    pub usage: RegionUsage,
    pub access: Access,
}

impl Region {
    pub fn end(&self) -> usize {
        self.virt.as_usize() + self.size
    }

    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        let r_start = self.virt.as_usize();
        let r_end = self.end();
        r_start < end && r_end > start
    }
}

// ---------------------------------------------------------------------------
// Page-table entries
// ---------------------------------------------------------------------------

/// A hardware page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    pub const PRESENT: u32 = 1 << 0;
    pub const WRITABLE: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(frame: PhysAddr, writable: bool, user: bool) -> Self {
        let mut bits = (frame.as_usize() as u32) & 0xFFFF_F000 | Self::PRESENT;
        if writable {
            bits |= Self::WRITABLE;
        }
        if user {
            bits |= Self::USER;
        }
        Self(bits)
    }

    pub fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn clear_present(&mut self) {
        self.0 &= !Self::PRESENT;
    }
}

/// A hardware page-directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct DirEntry(u32);

impl DirEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    fn new(table: PhysAddr, writable: bool, user: bool) -> Self {
        let mut bits = (table.as_usize() as u32) & 0xFFFF_F000 | PageEntry::PRESENT;
        if writable {
            bits |= PageEntry::WRITABLE;
        }
        if user {
            bits |= PageEntry::USER;
        }
        Self(bits)
    }

    pub fn is_present(self) -> bool {
        self.0 & PageEntry::PRESENT != 0
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A 4 KiB page table.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageEntry; 1024],
}

/// A 4 KiB page directory. This is what CR3 points at.
#[repr(C, align(4096))]
pub struct PageDirectory {
    pub entries: [DirEntry; 1024],
}

// ---------------------------------------------------------------------------
// Region table
// ---------------------------------------------------------------------------

/// Fixed-capacity, order-preserving table of regions.
pub struct RegionTable {
    entries: [Option<Region>; MAX_REGIONS],
    count: usize,
}

impl RegionTable {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_REGIONS],
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.entries[..self.count].iter().filter_map(Option::as_ref)
    }

    pub fn get(&self, index: usize) -> Option<Region> {
        if index < self.count {
            self.entries[index]
        } else {
            None
        }
    }

    /// Insert a region, rejecting overlap with any existing one.
    /// Exceeding the table capacity is a kernel bug.
    pub fn insert(&mut self, region: Region) -> KernelResult<()> {
        if self.count == MAX_REGIONS {
            panic!("region table full ({} regions)", MAX_REGIONS);
        }

        let start = region.virt.as_usize();
        let end = region.end();
        if self.iter().any(|r| r.overlaps(start, end)) {
            return Err(KernelError::InvalidArgument);
        }

        self.entries[self.count] = Some(region);
        self.count += 1;
        Ok(())
    }

    /// Remove the region starting exactly at `virt`.
    pub fn remove(&mut self, virt: VirtAddr) -> Option<Region> {
        let index = self.entries[..self.count]
            .iter()
            .position(|r| r.map(|r| r.virt) == Some(virt))?;
        let region = self.entries[index];

        // Preserve insertion order.
        for i in index..self.count - 1 {
            self.entries[i] = self.entries[i + 1];
        }
        self.count -= 1;
        self.entries[self.count] = None;
        region
    }

    pub fn find(&self, virt: VirtAddr) -> Option<&Region> {
        self.iter().find(|r| r.virt == virt)
    }

    /// Highest end address of any region at or above `floor`, or `floor`
    /// itself when none qualifies.
    pub fn end_above(&self, floor: usize) -> usize {
        self.iter()
            .filter(|r| r.virt.as_usize() >= floor)
            .map(Region::end)
            .max()
            .unwrap_or(floor)
    }

    /// Highest end address of any *heap* region at or above `floor`.
    /// Stacks and temp mappings do not move the heap watermark.
    fn heap_end_above(&self, floor: usize) -> usize {
        self.iter()
            .filter(|r| r.usage.contains(RegionUsage::HEAP) && r.virt.as_usize() >= floor)
            .map(Region::end)
            .max()
            .unwrap_or(floor)
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Address space
// ---------------------------------------------------------------------------

/// A page directory, its shadow table pointers, and its region table.
pub struct AddressSpace {
    dir: NonNull<PageDirectory>,
    dir_phys: PhysAddr,
    /// Virtual pointers to *owned* page tables; `None` for empty or
    /// foreign (shared-kernel) slots.
    shadow: [Option<NonNull<PageTable>>; 1024],
    regions: RegionTable,
    kernel_space: bool,
}

// SAFETY: the raw table pointers are owned by this address space and only
// reachable through it; access is serialized by the owning process's lock.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    fn alloc_dir() -> KernelResult<(NonNull<PageDirectory>, PhysAddr)> {
        let raw = bootstrap::heap().calloc_aligned(core::mem::size_of::<PageDirectory>())?;
        let dir = raw.cast::<PageDirectory>();
        let dir_phys = bootstrap::heap().phys_of(VirtAddr::new(raw.as_ptr() as usize));
        Ok((dir, dir_phys))
    }

    /// Create the kernel address space.
    pub fn new_kernel() -> KernelResult<Self> {
        let (dir, dir_phys) = Self::alloc_dir()?;
        Ok(Self {
            dir,
            dir_phys,
            shadow: [None; 1024],
            regions: RegionTable::new(),
            kernel_space: true,
        })
    }

    /// Create a user address space aliasing the kernel quarter of
    /// `kernel` by sharing its directory entries.
    pub fn new_user(kernel: &AddressSpace) -> KernelResult<Self> {
        let (dir, dir_phys) = Self::alloc_dir()?;
        let mut space = Self {
            dir,
            dir_phys,
            shadow: [None; 1024],
            regions: RegionTable::new(),
            kernel_space: false,
        };
        space.install_kernel_slots(&kernel.kernel_slots());
        Ok(space)
    }

    /// Physical address of the page directory, for CR3.
    pub fn dir_phys(&self) -> PhysAddr {
        self.dir_phys
    }

    pub fn is_kernel_space(&self) -> bool {
        self.kernel_space
    }

    pub fn region_count(&self) -> usize {
        self.regions.count()
    }

    pub fn region(&self, index: usize) -> Option<Region> {
        self.regions.get(index)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn find_region(&self, virt: VirtAddr) -> Option<Region> {
        self.regions.find(virt).copied()
    }

    /// Snapshot of the shared kernel directory slots.
    pub fn kernel_slots(&self) -> [DirEntry; KERNEL_SHARED_SLOTS] {
        let mut slots = [DirEntry::empty(); KERNEL_SHARED_SLOTS];
        // SAFETY: `dir` is owned and valid.
        let dir = unsafe { self.dir.as_ref() };
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = dir.entries[KERNEL_SLOT_START + i];
        }
        slots
    }

    /// Overwrite the shared kernel directory slots. The tables behind
    /// them stay owned by the kernel address space.
    pub fn install_kernel_slots(&mut self, slots: &[DirEntry; KERNEL_SHARED_SLOTS]) {
        // SAFETY: `dir` is owned and valid.
        let dir = unsafe { self.dir.as_mut() };
        for (i, slot) in slots.iter().enumerate() {
            dir.entries[KERNEL_SLOT_START + i] = *slot;
        }
    }

    /// Look up (or create) the page table covering directory slot `slot`.
    fn fetch_table(
        &mut self,
        slot: usize,
        create: bool,
        writable: bool,
        user: bool,
    ) -> KernelResult<&mut PageTable> {
        if self.shadow[slot].is_none() {
            if !create {
                return Err(KernelError::NotFound);
            }
            if !self.kernel_space && (KERNEL_SLOT_START..KERNEL_SLOT_PRIVATE).contains(&slot) {
                panic!("attempt to map into the shared kernel range of a user space");
            }

            let raw = bootstrap::heap().calloc_aligned(core::mem::size_of::<PageTable>())?;
            let table = raw.cast::<PageTable>();
            let table_phys = bootstrap::heap().phys_of(VirtAddr::new(raw.as_ptr() as usize));

            // SAFETY: `dir` is owned and valid.
            unsafe {
                self.dir.as_mut().entries[slot] = DirEntry::new(table_phys, writable, user);
            }
            self.shadow[slot] = Some(table);
        }

        // SAFETY: the shadow pointer was produced by the bootstrap heap
        // and stays valid until this space is dropped.
        Ok(unsafe { self.shadow[slot].unwrap().as_mut() })
    }

    /// Map `[virt, virt + size)` onto `[phys, phys + size)`.
    ///
    /// Rejects misaligned addresses, non-page-granular sizes, and overlap
    /// with an existing region. With `commit` set, each affected page is
    /// invalidated in the TLB.
    pub fn map_region(
        &mut self,
        phys: PhysAddr,
        virt: VirtAddr,
        size: usize,
        usage: RegionUsage,
        access: Access,
        commit: bool,
    ) -> KernelResult<()> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if !phys.is_page_aligned() || !virt.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        if self.kernel_space && virt.as_usize() < KERNEL_OFFSET {
            panic!(
                "kernel-space region requested below KERNEL_OFFSET ({})",
                virt
            );
        }

        self.regions.insert(Region {
            phys,
            virt,
            size,
            usage,
            access,
        })?;

        let writable = access == Access::ReadWrite;
        let user = usage.contains(RegionUsage::USER);

        for page in 0..size / PAGE_SIZE {
            let va = VirtAddr::new(virt.as_usize() + page * PAGE_SIZE);
            let pa = PhysAddr::new(phys.as_usize() + page * PAGE_SIZE);
            let table = self.fetch_table(va.dir_slot(), true, writable, user)?;
            table.entries[va.table_slot()] = PageEntry::new(pa, writable, user);
        }

        if commit {
            for page in 0..size / PAGE_SIZE {
                // SAFETY: invalidating a TLB entry has no memory effects.
                unsafe {
                    hal::invlpg(virt.as_usize() + page * PAGE_SIZE);
                }
            }
        }

        Ok(())
    }

    /// Unmap the region starting at `virt`.
    ///
    /// Clears the present bits, optionally invalidates the TLB, and, for
    /// auto-free regions, returns the backing frames to the frame
    /// allocator. Returns the removed region entry.
    pub fn unmap_region(&mut self, virt: VirtAddr, commit: bool) -> KernelResult<Region> {
        let region = self.regions.remove(virt).ok_or(KernelError::NotFound)?;

        for page in 0..region.page_count() {
            let va = VirtAddr::new(virt.as_usize() + page * PAGE_SIZE);
            let table = self.fetch_table(va.dir_slot(), false, false, false)?;
            table.entries[va.table_slot()].clear_present();
        }

        if commit {
            for page in 0..region.page_count() {
                // SAFETY: invalidating a TLB entry has no memory effects.
                unsafe {
                    hal::invlpg(virt.as_usize() + page * PAGE_SIZE);
                }
            }
        }

        if region.usage.contains(RegionUsage::AUTO_FREE) {
            phys::allocator().free(region.phys, region.page_count());
        }

        Ok(region)
    }

    /// Allocate physical frames and map them at `virt`. The region is
    /// flagged auto-free so its frames return to the allocator on unmap.
    pub fn alloc_and_map(
        &mut self,
        virt: VirtAddr,
        size: usize,
        usage: RegionUsage,
        access: Access,
        commit: bool,
    ) -> KernelResult<()> {
        let frames = size / PAGE_SIZE;
        let phys_base = phys::allocator().alloc(frames)?;

        self.map_region(
            phys_base,
            virt,
            size,
            usage | RegionUsage::AUTO_FREE,
            access,
            commit,
        )
        .inspect_err(|_| phys::allocator().free(phys_base, frames))
    }

    /// Like [`alloc_and_map`](Self::alloc_and_map), but refuses physical
    /// runs crossing `limit`. ISA DMA buffers must stay below 16 MiB.
    pub fn alloc_and_map_limited(
        &mut self,
        virt: VirtAddr,
        limit: PhysAddr,
        size: usize,
        usage: RegionUsage,
        access: Access,
        commit: bool,
    ) -> KernelResult<()> {
        let frames = size / PAGE_SIZE;
        let phys_base = phys::allocator().alloc(frames)?;

        if phys_base.as_usize() + size > limit.as_usize() {
            phys::allocator().free(phys_base, frames);
            return Err(KernelError::OutOfMemory { requested: size });
        }

        self.map_region(
            phys_base,
            virt,
            size,
            usage | RegionUsage::AUTO_FREE,
            access,
            commit,
        )
        .inspect_err(|_| phys::allocator().free(phys_base, frames))
    }

    /// Map foreign physical memory at a free spot in the temp window.
    ///
    /// Used whenever the kernel must touch another address space's
    /// memory, e.g. to write a new thread's initial stack frame. Undone
    /// with a normal [`unmap_region`](Self::unmap_region).
    pub fn temp_map(&mut self, phys: PhysAddr, size: usize) -> KernelResult<VirtAddr> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut addr = KERNEL_TEMP_START;
        while addr <= usize::MAX - size {
            let conflict = self
                .regions
                .iter()
                .find(|r| r.overlaps(addr, addr + size))
                .map(Region::end);

            match conflict {
                Some(end) => addr = end,
                None => {
                    self.map_region(
                        phys,
                        VirtAddr::new(addr),
                        size,
                        RegionUsage::TEMP,
                        Access::ReadWrite,
                        true,
                    )?;
                    return Ok(VirtAddr::new(addr));
                }
            }
        }

        Err(KernelError::OutOfMemory { requested: size })
    }

    /// Physical base of the region starting exactly at `virt`.
    pub fn region_phys_addr(&self, virt: VirtAddr) -> KernelResult<PhysAddr> {
        self.regions
            .find(virt)
            .map(|r| r.phys)
            .ok_or(KernelError::NotFound)
    }

    /// End of the mapped address space at or above `floor`.
    pub fn address_space_end(&self, floor: usize) -> VirtAddr {
        VirtAddr::new(self.regions.end_above(floor))
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        for table in self.shadow.iter().flatten() {
            bootstrap::heap().free(table.cast());
        }
        bootstrap::heap().free(self.dir.cast());
    }
}

// ---------------------------------------------------------------------------
// Heap regions
// ---------------------------------------------------------------------------

/// Allocate physical memory for a heap of `size` bytes and map it at the
/// end of the space's heap area. Returns the heap's base address.
pub fn create_heap(
    space: &mut AddressSpace,
    size: usize,
    usage: RegionUsage,
) -> KernelResult<VirtAddr> {
    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(KernelError::InvalidArgument);
    }

    let floor = if usage.contains(RegionUsage::USER) {
        USER_HEAP_START
    } else {
        KERNEL_HEAP_START
    };
    let virt = VirtAddr::new(space.regions.heap_end_above(floor));

    space.alloc_and_map(virt, size, usage | RegionUsage::HEAP, Access::ReadWrite, true)?;
    Ok(virt)
}

/// Unmap a heap created by [`create_heap`] and return its frames.
pub fn destroy_heap(space: &mut AddressSpace, base: VirtAddr) -> KernelResult<()> {
    let region = space.find_region(base).ok_or(KernelError::NotFound)?;
    if !region.usage.contains(RegionUsage::HEAP) {
        panic!("destroy_heap on a non-heap region at {}", base);
    }

    // The region carries AUTO_FREE, so unmapping refunds the frames.
    space.unmap_region(base, true)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Fault handling
// ---------------------------------------------------------------------------

/// Page-fault vector.
pub const PAGE_FAULT_VECTOR: u32 = 14;

/// Page faults are fatal: decode CR2 and the error bits, dump the saved
/// registers, panic. Demand paging is intentionally absent.
pub fn page_fault_handler(frame: &mut crate::irq::InterruptFrame) {
    let cr2 = hal::read_cr2();
    let err = frame.err_code;
    log::error!(
        "page fault at {:#010x} ({} of {} page, {} mode{})",
        cr2,
        if err & 0x2 != 0 { "write" } else { "read" },
        if err & 0x1 != 0 {
            "protected"
        } else {
            "non-present"
        },
        if err & 0x4 != 0 { "user" } else { "kernel" },
        if err & 0x10 != 0 { ", instruction fetch" } else { "" },
    );
    crate::irq::dump_frame(frame);
    panic!("unrecoverable page fault at {:#010x}", cr2);
}

/// Build the kernel address space: the first 4 MiB of physical memory
/// mapped at `KERNEL_OFFSET`, page fault handler installed, and paging
/// switched over from the boot stub's tables.
#[cfg(target_arch = "x86")]
pub fn init() -> KernelResult<AddressSpace> {
    let mut space = AddressSpace::new_kernel()?;
    space.map_region(
        PhysAddr::new(0),
        VirtAddr::new(KERNEL_OFFSET),
        4 * 1024 * 1024,
        RegionUsage::KERNEL,
        Access::ReadWrite,
        false,
    )?;

    crate::irq::register_isr(PAGE_FAULT_VECTOR, page_fault_handler)?;

    // SAFETY: the directory maps the kernel image at its linked address,
    // so execution continues seamlessly after the CR3 switch.
    unsafe {
        hal::enable_paging(space.dir_phys().as_usize());
    }

    log::info!(
        "vmm: kernel address space live, directory at {}",
        space.dir_phys()
    );
    Ok(space)
}
