//! Multiboot (v1) handoff.
//!
//! The boot stub preserves the loader's magic and info pointer; this
//! module validates them and walks the memory map into the
//! `(start, length, type)` list the frame allocator consumes.

use crate::mm::{KERNEL_OFFSET, PhysAddr};

/// Magic the bootloader leaves in `eax`.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

const FLAG_MEM: u32 = 1 << 0;
const FLAG_MMAP: u32 = 1 << 6;

/// Region type in a memory-map entry: usable RAM.
const MMAP_AVAILABLE: u32 = 1;

/// The multiboot information structure, as the loader lays it out.
#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

/// One raw memory-map entry. `size` does not include itself.
#[repr(C, packed)]
struct MmapEntry {
    size: u32,
    addr: u64,
    len: u64,
    entry_type: u32,
}

/// A parsed physical memory range.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub start: PhysAddr,
    pub length: usize,
    pub available: bool,
}

/// Access the info structure the loader left at physical `info_addr`.
///
/// # Safety
///
/// `info_addr` must be the pointer received from a multiboot-compliant
/// loader, and low memory must be mapped at `KERNEL_OFFSET`.
pub unsafe fn info_at(info_addr: u32) -> &'static MultibootInfo {
    // SAFETY: per contract; the structure lives in low memory, inside
    // the kernel's fixed mapping.
    unsafe { &*((info_addr as usize + KERNEL_OFFSET) as *const MultibootInfo) }
}

/// Iterate the loader's memory map.
///
/// Falls back to the basic `mem_lower`/`mem_upper` fields when the
/// loader supplied no map.
pub fn memory_ranges(info: &MultibootInfo) -> impl Iterator<Item = MemoryRange> + '_ {
    let mmap = if info.flags & FLAG_MMAP != 0 {
        Some((info.mmap_addr, info.mmap_length))
    } else {
        None
    };

    let mut offset = 0u32;
    let mut basic_emitted = 0u8;

    core::iter::from_fn(move || {
        if let Some((addr, length)) = mmap {
            while offset < length {
                // SAFETY: the loader guarantees `mmap_length` bytes of
                // valid entries at `mmap_addr`.
                let entry = unsafe {
                    &*((addr as usize + offset as usize + KERNEL_OFFSET) as *const MmapEntry)
                };
                offset += entry.size + 4;

                return Some(MemoryRange {
                    start: PhysAddr::new(entry.addr as usize),
                    length: entry.len as usize,
                    available: entry.entry_type == MMAP_AVAILABLE,
                });
            }
            return None;
        }

        // Basic fields: conventional memory below 640 KiB, then the
        // extended block above 1 MiB.
        if info.flags & FLAG_MEM != 0 {
            basic_emitted += 1;
            match basic_emitted {
                1 => {
                    return Some(MemoryRange {
                        start: PhysAddr::new(0),
                        length: info.mem_lower as usize * 1024,
                        available: true,
                    })
                }
                2 => {
                    return Some(MemoryRange {
                        start: PhysAddr::new(0x10_0000),
                        length: info.mem_upper as usize * 1024,
                        available: true,
                    })
                }
                _ => return None,
            }
        }
        None
    })
}

/// The available ranges, in frame-allocator form.
pub fn available_ranges(info: &MultibootInfo) -> impl Iterator<Item = (PhysAddr, usize)> + '_ {
    memory_ranges(info)
        .filter(|r| r.available)
        .map(|r| (r.start, r.length))
}
