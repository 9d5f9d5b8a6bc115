//! ELF32 executable loading.
//!
//! Accepts 32-bit, little-endian, x86 executables. Loading creates a
//! user process, maps every `PT_LOAD` segment page-rounded with
//! permissions derived from the header's W bit, copies the file bytes in
//! through a temporary mapping of the current address space, zeroes the
//! BSS tail, and finally makes the primary thread runnable.

use alloc::{sync::Arc, vec};

use crate::{
    error::{KernelError, KernelResult},
    fs::{SeekOrigin, Stream},
    mm::{
        self,
        vmm::{Access, RegionUsage},
        PhysAddr, VirtAddr, PAGE_SIZE,
    },
    sched::{process, scheduler, Pid, Priority, Tid},
};

/// `\x7fELF`.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const ELF_CLASS_32: u8 = 1;
const ELF_DATA_LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

/// Size of the ELF32 file header.
pub const EHDR_SIZE: usize = 52;

/// Size of one ELF32 program header.
pub const PHDR_SIZE: usize = 32;

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Parsed ELF32 file header.
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub class: u8,
    pub data: u8,
    pub elf_type: u16,
    pub machine: u16,
    pub entry: u32,
    pub phoff: u32,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Parse and validate magic, class, endianness, and machine.
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < EHDR_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        if bytes[..4] != ELF_MAGIC {
            return Err(KernelError::InvalidArgument);
        }

        let header = Self {
            class: bytes[4],
            data: bytes[5],
            elf_type: read_u16(bytes, 16),
            machine: read_u16(bytes, 18),
            entry: read_u32(bytes, 24),
            phoff: read_u32(bytes, 28),
            phentsize: read_u16(bytes, 42),
            phnum: read_u16(bytes, 44),
        };

        if header.class != ELF_CLASS_32 {
            return Err(KernelError::InvalidArgument);
        }
        if header.data != ELF_DATA_LSB {
            return Err(KernelError::InvalidArgument);
        }
        if header.machine != EM_386 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(header)
    }

    pub fn is_executable(&self) -> bool {
        self.elf_type == ET_EXEC
    }
}

/// Parsed ELF32 program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
}

impl ProgramHeader {
    pub fn parse(bytes: &[u8], offset: usize) -> KernelResult<Self> {
        if bytes.len() < offset + PHDR_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            p_type: read_u32(bytes, offset),
            offset: read_u32(bytes, offset + 4),
            vaddr: read_u32(bytes, offset + 8),
            filesz: read_u32(bytes, offset + 16),
            memsz: read_u32(bytes, offset + 20),
            flags: read_u32(bytes, offset + 24),
        })
    }
}

/// Check whether the stream carries a loadable ELF32 x86 image. The
/// stream position is restored before returning.
pub fn probe(stream: &Arc<dyn Stream>) -> KernelResult<()> {
    let pos = stream.tell();

    let mut header = [0u8; EHDR_SIZE];
    let result = stream.read_exact(&mut header).and_then(|()| {
        ElfHeader::parse(&header)?;
        Ok(())
    });

    stream.seek(pos as i64, SeekOrigin::Begin)?;
    result
}

/// Load an executable image already sitting in memory. Returns the new
/// process's pid; its primary thread is in the run queue.
pub fn load_from_memory(image: &[u8]) -> KernelResult<Pid> {
    let header = ElfHeader::parse(image)?;
    if !header.is_executable() {
        return Err(KernelError::InvalidArgument);
    }

    // The thread stays parked until every segment is in place.
    let pid = process::create_process_parked("user", header.entry as usize, Priority::Normal)?;
    let proc = process::find(pid)?;

    for i in 0..header.phnum {
        let ph_offset = header.phoff as usize + usize::from(i) * usize::from(header.phentsize);
        let ph = ProgramHeader::parse(image, ph_offset)?;

        match ph.p_type {
            PT_NULL | PT_PHDR => {}
            PT_LOAD => {
                if let Err(e) = load_segment(&proc, &ph, image) {
                    let _ = process::destroy_process(pid);
                    return Err(e);
                }
            }
            other => panic!("unhandled ELF program header type {:#x}", other),
        }
    }

    let primary = proc.find_thread(Tid(0)).ok_or(KernelError::Unexpected)?;
    scheduler::enqueue(primary);
    log::info!("elf: loaded process {} entry {:#010x}", pid, header.entry);
    Ok(pid)
}

/// Map one `PT_LOAD` segment into `proc` and fill it from the image.
fn load_segment(
    proc: &Arc<process::Process>,
    ph: &ProgramHeader,
    image: &[u8],
) -> KernelResult<()> {
    if ph.memsz == 0 || ph.memsz < ph.filesz {
        return Err(KernelError::InvalidArgument);
    }
    if ph.offset as usize + ph.filesz as usize > image.len() {
        return Err(KernelError::InvalidArgument);
    }

    let usage = if ph.flags & PF_W != 0 {
        RegionUsage::DATA | RegionUsage::USER
    } else {
        RegionUsage::CODE | RegionUsage::USER
    };
    let access = if ph.flags & PF_W != 0 {
        Access::ReadWrite
    } else {
        Access::Read
    };

    // Page-round the mapping around the requested virtual range.
    let align_excess = ph.vaddr as usize % PAGE_SIZE;
    let map_vaddr = ph.vaddr as usize - align_excess;
    let map_size = mm::align_up(ph.memsz as usize + align_excess, PAGE_SIZE);

    let phys = proc.with_inner(|inner| -> KernelResult<PhysAddr> {
        inner.space.alloc_and_map(
            VirtAddr::new(map_vaddr),
            map_size,
            usage,
            access,
            false,
        )?;
        inner.space.region_phys_addr(VirtAddr::new(map_vaddr))
    })?;

    copy_segment(phys, map_size, align_excess, ph, image)
}

/// Copy the segment bytes through a temporary mapping of the current
/// address space and zero the `memsz - filesz` tail.
#[cfg(target_arch = "x86")]
fn copy_segment(
    phys: PhysAddr,
    map_size: usize,
    align_excess: usize,
    ph: &ProgramHeader,
    image: &[u8],
) -> KernelResult<()> {
    use crate::sync::interrupt_guard;

    let current = scheduler::current_process().ok_or(KernelError::InvalidState)?;

    // A reschedule between map and unmap would leave the alias dangling.
    let _irq = interrupt_guard();

    current.with_inner(|inner| -> KernelResult<()> {
        let temp = inner.space.temp_map(phys, map_size)?;
        let base = (temp.as_usize() + align_excess) as *mut u8;

        // SAFETY: the temp mapping covers map_size bytes, and
        // align_excess + memsz fits inside it by construction.
        unsafe {
            core::ptr::copy_nonoverlapping(
                image.as_ptr().add(ph.offset as usize),
                base,
                ph.filesz as usize,
            );
            core::ptr::write_bytes(
                base.add(ph.filesz as usize),
                0,
                (ph.memsz - ph.filesz) as usize,
            );
        }

        inner.space.unmap_region(temp, true)?;
        Ok(())
    })
}

/// Host builds have no physical memory behind the mapping; the segment
/// bookkeeping above is all that can be exercised.
#[cfg(not(target_arch = "x86"))]
fn copy_segment(
    _phys: PhysAddr,
    _map_size: usize,
    _align_excess: usize,
    _ph: &ProgramHeader,
    _image: &[u8],
) -> KernelResult<()> {
    Ok(())
}

/// Probe a stream, slurp it, and launch it.
pub fn execute(stream: &Arc<dyn Stream>) -> KernelResult<Pid> {
    probe(stream)?;

    let pos = stream.tell();
    let end = stream.seek(0, SeekOrigin::End)?;
    stream.seek(pos as i64, SeekOrigin::Begin)?;

    let size = (end - pos) as usize;
    let mut image = vec![0u8; size];
    stream.read_exact(&mut image)?;

    load_from_memory(&image)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::{
        fs::{perm, OpenMode, Vfs},
        mm::{bootstrap, vmm::AddressSpace},
        test_support,
    };

    /// Assemble a minimal ELF32 executable: one PT_LOAD at 0x40_0000
    /// with `file_bytes` of content and `bss` extra zeroed bytes.
    fn minimal_elf(entry: u32, file_bytes: &[u8], bss: u32) -> Vec<u8> {
        let mut image = std::vec![0u8; EHDR_SIZE + PHDR_SIZE];

        image[..4].copy_from_slice(&ELF_MAGIC);
        image[4] = 1; // 32-bit
        image[5] = 1; // little-endian
        image[6] = 1; // version
        image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        image[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes()); // phoff
        image[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        image[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum

        let data_offset = image.len() as u32;
        let ph = EHDR_SIZE;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&data_offset.to_le_bytes());
        image[ph + 8..ph + 12].copy_from_slice(&0x40_0000u32.to_le_bytes()); // vaddr
        image[ph + 16..ph + 20].copy_from_slice(&(file_bytes.len() as u32).to_le_bytes());
        image[ph + 20..ph + 24]
            .copy_from_slice(&(file_bytes.len() as u32 + bss).to_le_bytes());
        image[ph + 24..ph + 28].copy_from_slice(&(PF_R | PF_W).to_le_bytes());

        image.extend_from_slice(file_bytes);
        image
    }

    fn with_kernel_process<R>(f: impl FnOnce() -> R) -> R {
        bootstrap::init_for_tests();
        test_support::seed_frame_allocator();
        let space = AddressSpace::new_kernel().unwrap();
        let kernel = process::create_initial_process(space).unwrap();
        let result = f();
        process::destroy_process(kernel.pid).unwrap();
        result
    }

    #[test]
    fn header_parsing_rejects_foreign_binaries() {
        let image = minimal_elf(0x40_0000, b"code", 0);
        assert!(ElfHeader::parse(&image).is_ok());

        let mut bad_magic = image.clone();
        bad_magic[0] = 0x7E;
        assert_eq!(
            ElfHeader::parse(&bad_magic).unwrap_err(),
            KernelError::InvalidArgument
        );

        let mut bad_class = image.clone();
        bad_class[4] = 2; // 64-bit
        assert_eq!(
            ElfHeader::parse(&bad_class).unwrap_err(),
            KernelError::InvalidArgument
        );

        let mut bad_endian = image.clone();
        bad_endian[5] = 2;
        assert!(ElfHeader::parse(&bad_endian).is_err());

        let mut bad_machine = image;
        bad_machine[18] = 62; // x86-64
        assert!(ElfHeader::parse(&bad_machine).is_err());
    }

    #[test]
    fn program_headers_roundtrip() {
        let image = minimal_elf(0x40_0080, b"payload", 0x100);
        let header = ElfHeader::parse(&image).unwrap();
        assert_eq!(header.entry, 0x40_0080);
        assert_eq!(header.phnum, 1);
        assert!(header.is_executable());

        let ph = ProgramHeader::parse(&image, header.phoff as usize).unwrap();
        assert_eq!(ph.p_type, PT_LOAD);
        assert_eq!(ph.vaddr, 0x40_0000);
        assert_eq!(ph.filesz, 7);
        assert_eq!(ph.memsz, 7 + 0x100);
        assert_eq!(ph.flags, PF_R | PF_W);
    }

    #[test]
    fn probe_restores_stream_position() {
        let fs = Vfs::new();
        fs.mkdir("/bin", perm::ALL).unwrap();
        fs.create("/bin/app", perm::ALL).unwrap();

        let stream = fs.open("/bin/app", OpenMode::READ_WRITE).unwrap();
        stream.write(&minimal_elf(0x40_0000, b"x", 0)).unwrap();
        stream.seek(0, SeekOrigin::Begin).unwrap();

        probe(&stream).unwrap();
        assert_eq!(stream.tell(), 0);
        fs.close(&stream).unwrap();
    }

    #[test]
    fn probe_rejects_non_elf_content() {
        let fs = Vfs::new();
        fs.create("/blob", perm::ALL).unwrap();
        let stream = fs.open("/blob", OpenMode::READ_WRITE).unwrap();
        stream.write(&[0x7Eu8; 64]).unwrap();
        stream.seek(0, SeekOrigin::Begin).unwrap();

        assert_eq!(probe(&stream).unwrap_err(), KernelError::InvalidArgument);
        assert_eq!(stream.tell(), 0);
        fs.close(&stream).unwrap();

        // A stream shorter than the header cannot be an executable
        // either, but that is an end-of-stream condition.
        fs.create("/short", perm::ALL).unwrap();
        let short = fs.open("/short", OpenMode::READ_WRITE).unwrap();
        short.write(b"tiny").unwrap();
        short.seek(0, SeekOrigin::Begin).unwrap();
        assert_eq!(probe(&short).unwrap_err(), KernelError::EndOfStream);
        fs.close(&short).unwrap();
    }

    #[test]
    fn load_creates_process_with_mapped_segment() {
        let _g = test_support::lock();
        with_kernel_process(|| {
            let image = minimal_elf(0x40_0100, b"some program text", 0x2000);
            let free_before = crate::mm::phys::allocator().free_frames();

            let pid = load_from_memory(&image).unwrap();
            let proc = process::find(pid).unwrap();
            assert_eq!(proc.thread_count(), 1);

            // Kernel stack, user stack, and one page-rounded segment.
            assert_eq!(proc.region_count(), 3);
            let segment = proc
                .with_inner(|inner| inner.space.find_region(VirtAddr::new(0x40_0000)))
                .unwrap();
            assert_eq!(segment.size, 0x3000); // 17 bytes text + 0x2000 bss, page-rounded
            assert!(segment.usage.contains(RegionUsage::USER));
            assert!(segment.usage.contains(RegionUsage::DATA));

            let primary = proc.find_thread(Tid(0)).unwrap();
            assert!(scheduler::is_queued(&primary));
            assert_eq!(primary.saved_context().eip, 0x40_0100);

            // Full teardown: process gone, every frame back.
            process::destroy_process(pid).unwrap();
            assert!(process::find(pid).is_err());
            assert_eq!(crate::mm::phys::allocator().free_frames(), free_before);
        });
    }

    #[test]
    fn load_rejects_relocatable_objects() {
        let _g = test_support::lock();
        with_kernel_process(|| {
            let mut image = minimal_elf(0x40_0000, b"x", 0);
            image[16..18].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
            assert_eq!(
                load_from_memory(&image).unwrap_err(),
                KernelError::InvalidArgument
            );
        });
    }
}
