//! Interrupt descriptor table.
//!
//! 256 gates. The 32 CPU exceptions and the two software vectors (0x80
//! syscall, 0x81 reschedule) are installed at init; the 16 remapped IRQ
//! lines get their stubs too, but stay masked at the PIC until a
//! handler registers for them.

use core::arch::asm;

use crate::arch::{
    x86::{context, pic},
    KERNEL_CODE_SELECTOR,
};

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    base_low: u16,
    selector: u16,
    reserved: u8,
    flags: u8,
    base_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            base_low: 0,
            selector: 0,
            reserved: 0,
            flags: 0,
            base_high: 0,
        }
    }

    fn new(base: u32, selector: u16, flags: u8) -> Self {
        Self {
            base_low: (base & 0xFFFF) as u16,
            selector,
            reserved: 0,
            flags,
            base_high: ((base >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

/// Present ring-0 32-bit interrupt gate.
const GATE_KERNEL: u8 = 0x8E;

/// Present ring-3-callable interrupt gate, for the software vectors.
const GATE_USER: u8 = 0xEE;

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

/// Build the IDT, remap the PIC, load the table, and hook the
/// general-protection handler.
pub fn init() {
    // SAFETY: runs once, single-threaded, before interrupts are enabled.
    unsafe {
        // CPU exceptions.
        for (vector, &stub) in context::ISR_STUB_TABLE.iter().enumerate() {
            IDT[vector] = IdtEntry::new(stub, KERNEL_CODE_SELECTOR, GATE_KERNEL);
        }

        // Software interrupts, reachable from ring 3.
        IDT[crate::irq::SYSCALL_VECTOR as usize] = IdtEntry::new(
            context::isr_stub_128 as usize as u32,
            KERNEL_CODE_SELECTOR,
            GATE_USER,
        );
        IDT[crate::irq::RESCHEDULE_VECTOR as usize] = IdtEntry::new(
            context::isr_stub_129 as usize as u32,
            KERNEL_CODE_SELECTOR,
            GATE_USER,
        );

        // Remapped IRQ lines.
        pic::init(
            crate::irq::IRQ_BASE_VECTOR as u8,
            crate::irq::IRQ_SLAVE_VECTOR as u8,
        );
        for (line, &stub) in context::IRQ_STUB_TABLE.iter().enumerate() {
            IDT[crate::irq::IRQ_BASE_VECTOR as usize + line] =
                IdtEntry::new(stub, KERNEL_CODE_SELECTOR, GATE_KERNEL);
        }

        let pointer = IdtPointer {
            limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: &raw const IDT as u32,
        };
        asm!("lidt [{0}]", in(reg) core::ptr::addr_of!(pointer));
    }

    // General protection faults go to the common fatal handler.
    crate::irq::register_isr(13, crate::irq::general_protection_handler)
        .expect("vector 13 is in range");

    log::debug!("idt: 256 gates installed, PIC remapped to 0x20/0x28");
}
