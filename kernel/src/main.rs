//! Ochre kernel binary: multiboot entry and the boot sequence.
//!
//! The assembly stub takes control from the loader with paging off and
//! the image loaded at 1 MiB physical / linked at 3 GiB + 1 MiB. It
//! switches on provisional PSE paging (identity plus the higher-half
//! alias), jumps high, and hands the multiboot state to
//! [`kernel_main`], which brings the subsystems up in dependency order
//! and ends inside the scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use core::arch::global_asm;

    use ochre_kernel::{
        arch::{
            hal,
            x86::{gdt, idt, multiboot, serial, vga},
        },
        fs, klog,
        mm::{self, bootstrap, heap, phys, vmm, PhysAddr, KERNEL_OFFSET},
        sched::scheduler,
        syscall, timer, KERNEL_NAME, KERNEL_VERSION,
    };

    global_asm!(
        r#"
// Multiboot v1 header: page-aligned modules, memory info.
.section .multiboot, "a"
.align 4
.long 0x1BADB002
.long 0x3
.long -(0x1BADB002 + 0x3)

.section .bss
.align 16
boot_stack_bottom:
    .skip 16384
boot_stack_top:

// Provisional page directory: one 4 MiB PSE page, mapped both at 0
// (identity, so the next instruction keeps fetching) and at 3 GiB.
.section .data
.align 4096
boot_page_directory:
    .long 0x00000083
    .fill 767, 4, 0
    .long 0x00000083
    .fill 255, 4, 0

.section .text
.global _start
_start:
    // Everything below runs at physical addresses; symbols are linked
    // high, so translate by hand until paging is on.
    mov ecx, offset boot_page_directory
    sub ecx, 0xC0000000
    mov cr3, ecx

    mov ecx, cr4
    or ecx, 0x10                    // CR4.PSE
    mov cr4, ecx

    mov ecx, cr0
    or ecx, 0x80000000              // CR0.PG
    mov cr0, ecx

    mov ecx, offset 2f
    jmp ecx                         // jump into the higher half
2:
    mov esp, offset boot_stack_top
    push ebx                        // multiboot info (physical)
    push eax                        // loader magic
    call kernel_main
3:
    hlt
    jmp 3b
"#
    );

    // Linker-provided end of the kernel image (virtual).
    extern "C" {
        static __kernel_end: u8;
    }

    /// Rust-side boot entry. Brings the core up leaves-first: console
    /// and logging, descriptor tables, physical memory, the bootstrap
    /// heap, paging proper, the kernel heap, the VFS and syscall
    /// surface, the timer, and finally the scheduler, which never
    /// returns.
    #[no_mangle]
    pub extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
        vga::init();
        serial::init();
        klog::init();
        log::info!(
            "{} {}.{} booting",
            KERNEL_NAME,
            KERNEL_VERSION.0,
            KERNEL_VERSION.1
        );

        if magic != multiboot::BOOTLOADER_MAGIC {
            panic!("not started by a multiboot loader (magic {:#010x})", magic);
        }

        gdt::init();
        idt::init();

        // SAFETY: info_addr came from the multiboot handshake.
        let info = unsafe { multiboot::info_at(info_addr) };
        // SAFETY: linker symbol; its address is the datum.
        let image_end = unsafe { &__kernel_end as *const u8 as usize } - KERNEL_OFFSET;
        phys::init(multiboot::available_ranges(info), PhysAddr::new(image_end));

        bootstrap::init();
        let mut space = vmm::init().expect("kernel address space construction failed");

        // First kernel heap arena; later growth goes through the
        // process layer.
        let heap_base = vmm::create_heap(
            &mut space,
            heap::ARENA_DEFAULT_SIZE,
            vmm::RegionUsage::KERNEL,
        )
        .expect("initial kernel heap");
        // SAFETY: the region was just mapped read-write and is unused.
        unsafe {
            heap::KERNEL_HEAP
                .add_arena(heap_base.as_usize(), heap::ARENA_DEFAULT_SIZE)
                .expect("first arena fits");
        }

        fs::init().expect("vfs namespace");
        syscall::init().expect("syscall vector is free");
        timer::init();

        scheduler::init(space, kernel_thread_main)
    }

    /// First thread of the init process.
    extern "C" fn kernel_thread_main() -> ! {
        log::info!(
            "init thread up; {} KiB physical memory free",
            phys::allocator().free_frames() * mm::PAGE_SIZE / 1024
        );

        loop {
            hal::halt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        hal::cli();
        vga::panic_print(format_args!("\n*** KERNEL PANIC ***\n{}\n", info));
        loop {
            hal::halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("ochre-kernel targets bare-metal i686; build with targets/i686-ochre.json");
}
