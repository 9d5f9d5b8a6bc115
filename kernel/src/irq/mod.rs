//! Interrupt dispatch.
//!
//! The assembly stubs push a uniform frame (segment word, `pushad`
//! image, vector and error code, IRET frame) and call one of two
//! gateways here. Dispatch goes through a 256-entry callback table with
//! one handler per vector. The table is written through atomics at
//! registration time and read lock-free, because the readers run in
//! interrupt context where taking a lock is not an option.
//!
//! Registering a handler for an IRQ-mapped vector unmasks that IRQ line;
//! unregistering masks the line if and only if the vector maps to one.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KernelError, KernelResult};

/// Vector the master PIC's IRQ 0 is remapped to.
pub const IRQ_BASE_VECTOR: u32 = 0x20;

/// Vector the slave PIC's IRQ 8 is remapped to.
pub const IRQ_SLAVE_VECTOR: u32 = 0x28;

/// IRQ0 (the PIT) after remapping.
pub const TIMER_VECTOR: u32 = IRQ_BASE_VECTOR;

/// Software interrupt: syscall gateway.
pub const SYSCALL_VECTOR: u32 = 0x80;

/// Software interrupt: voluntary reschedule.
pub const RESCHEDULE_VECTOR: u32 = 0x81;

/// Saved CPU state as pushed by the interrupt stubs, low address first.
/// `useresp`/`ss` are only meaningful when the interrupt crossed from
/// ring 3.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

/// An interrupt callback.
pub type IsrHandler = fn(&mut InterruptFrame);

/// Per-vector handler table; zero means no handler. Written only by
/// (un)registration, read from interrupt context without locks.
static ISR_TABLE: [AtomicUsize; 256] = [const { AtomicUsize::new(0) }; 256];

/// IRQ line for a vector, if the vector is IRQ-mapped.
pub fn vector_to_irq(vector: u32) -> Option<u8> {
    if (IRQ_BASE_VECTOR..IRQ_BASE_VECTOR + 16).contains(&vector) {
        Some((vector - IRQ_BASE_VECTOR) as u8)
    } else {
        None
    }
}

/// Vector for an IRQ line.
pub fn irq_to_vector(irq: u8) -> Option<u32> {
    if irq < 8 {
        Some(IRQ_BASE_VECTOR + u32::from(irq))
    } else if irq < 16 {
        Some(IRQ_SLAVE_VECTOR + u32::from(irq - 8))
    } else {
        None
    }
}

/// Install `handler` for `vector`. For an IRQ-mapped vector the line is
/// unmasked as a side effect.
pub fn register_isr(vector: u32, handler: IsrHandler) -> KernelResult<()> {
    if vector >= 256 {
        return Err(KernelError::InvalidArgument);
    }
    ISR_TABLE[vector as usize].store(handler as usize, Ordering::Release);

    if let Some(irq) = vector_to_irq(vector) {
        pic::unmask(irq);
    }
    Ok(())
}

/// Remove the handler for `vector`, masking the IRQ line when the
/// vector maps to one.
pub fn unregister_isr(vector: u32) -> KernelResult<()> {
    if vector >= 256 {
        return Err(KernelError::InvalidArgument);
    }
    if let Some(irq) = vector_to_irq(vector) {
        pic::mask(irq);
    }
    ISR_TABLE[vector as usize].store(0, Ordering::Release);
    Ok(())
}

fn handler_for(vector: u32) -> Option<IsrHandler> {
    let raw = ISR_TABLE[vector as usize].load(Ordering::Acquire);
    if raw == 0 {
        None
    } else {
        // SAFETY: only `register_isr` stores non-zero values, always
        // valid `IsrHandler` fn pointers.
        Some(unsafe { core::mem::transmute::<usize, IsrHandler>(raw) })
    }
}

/// Log the full saved register set.
pub fn dump_frame(frame: &InterruptFrame) {
    log::error!(
        "eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx
    );
    log::error!(
        "esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        frame.esi,
        frame.edi,
        frame.ebp,
        frame.esp
    );
    log::error!(
        "eip={:#010x} cs={:#06x} ds={:#06x} eflags={:#010x}",
        frame.eip,
        frame.cs,
        frame.ds,
        frame.eflags
    );
    log::error!(
        "int={:#04x} err={:#010x}",
        frame.int_no,
        frame.err_code
    );
}

/// Gateway for CPU exceptions and software interrupts. Called from the
/// assembly stubs with a pointer to the frame they pushed.
///
/// An unhandled exception is fatal; the register dump is the last thing
/// the kernel prints before the panic.
#[no_mangle]
pub extern "C-unwind" fn isr_gateway(frame: &mut InterruptFrame) {
    if let Some(handler) = handler_for(frame.int_no) {
        handler(frame);
        return;
    }

    if frame.int_no < 32 {
        dump_frame(frame);
        panic!("unhandled CPU exception {:#04x}", frame.int_no);
    }
    log::error!("unhandled software interrupt {:#04x}", frame.int_no);
}

/// Gateway for hardware IRQs. Called from the assembly stubs with a
/// pointer to the frame they pushed.
///
/// Spurious IRQ 7 is filtered by re-reading the in-service register; a
/// genuinely spurious interrupt gets no EOI. For real interrupts the EOI
/// goes to the PIC(s) *before* the callback runs, so a handler that
/// switches threads does not leave the controller blocked.
#[no_mangle]
pub extern "C" fn irq_gateway(frame: &mut InterruptFrame) {
    let Some(irq) = vector_to_irq(frame.int_no) else {
        log::error!("IRQ gateway entered with non-IRQ vector {:#04x}", frame.int_no);
        return;
    };

    if irq == 7 && !pic::irq7_in_service() {
        // Spurious: the PIC raised line 7 with nothing in service.
        return;
    }

    pic::eoi(irq);

    if let Some(handler) = handler_for(frame.int_no) {
        handler(frame);
    } else {
        log::error!("unhandled IRQ {} (vector {:#04x})", irq, frame.int_no);
    }
}

/// General-protection faults are fatal.
pub fn general_protection_handler(frame: &mut InterruptFrame) {
    log::error!(
        "general protection fault at {:#010x} (error code {:#x})",
        frame.eip,
        frame.err_code
    );
    dump_frame(frame);
    panic!("unrecoverable general protection fault");
}

#[cfg(target_arch = "x86")]
use crate::arch::x86::pic;

#[cfg(not(target_arch = "x86"))]
mod pic {
    //! Host stand-in; there is no interrupt controller to talk to.

    pub fn unmask(_irq: u8) {}
    pub fn mask(_irq: u8) {}
    pub fn eoi(_irq: u8) {}

    pub fn irq7_in_service() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(int_no: u32) -> InterruptFrame {
        InterruptFrame {
            ds: 0x10,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            int_no,
            err_code: 0,
            eip: 0xC010_0000,
            cs: 0x08,
            eflags: 0x202,
            useresp: 0,
            ss: 0,
        }
    }

    #[test]
    fn vector_irq_mapping_is_bidirectional() {
        assert_eq!(irq_to_vector(0), Some(0x20));
        assert_eq!(irq_to_vector(7), Some(0x27));
        assert_eq!(irq_to_vector(8), Some(0x28));
        assert_eq!(irq_to_vector(15), Some(0x2F));
        assert_eq!(irq_to_vector(16), None);

        for irq in 0..16u8 {
            assert_eq!(vector_to_irq(irq_to_vector(irq).unwrap()), Some(irq));
        }
        assert_eq!(vector_to_irq(0x1F), None);
        assert_eq!(vector_to_irq(0x30), None);
        assert_eq!(vector_to_irq(SYSCALL_VECTOR), None);
    }

    #[test]
    fn registered_handler_receives_the_frame() {
        fn mark(frame: &mut InterruptFrame) {
            frame.eax = 0xFEED_FACE;
        }

        register_isr(0xC8, mark).unwrap();
        let mut f = frame(0xC8);
        isr_gateway(&mut f);
        assert_eq!(f.eax, 0xFEED_FACE);

        unregister_isr(0xC8).unwrap();
        let mut f2 = frame(0xC8);
        isr_gateway(&mut f2);
        assert_eq!(f2.eax, 0);
    }

    #[test]
    fn out_of_range_vector_is_rejected() {
        fn nop(_: &mut InterruptFrame) {}
        assert_eq!(register_isr(256, nop), Err(KernelError::InvalidArgument));
        assert_eq!(unregister_isr(1000), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn irq_dispatch_reaches_handler() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static HITS: AtomicU32 = AtomicU32::new(0);

        fn count(_: &mut InterruptFrame) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }

        // IRQ 9 -> vector 0x29.
        register_isr(0x29, count).unwrap();
        let mut f = frame(0x29);
        irq_gateway(&mut f);
        irq_gateway(&mut f);
        assert_eq!(HITS.load(Ordering::Relaxed), 2);
        unregister_isr(0x29).unwrap();
    }

    #[test]
    #[should_panic(expected = "unhandled CPU exception")]
    fn unhandled_exception_panics() {
        let mut f = frame(0x06);
        isr_gateway(&mut f);
    }

    #[test]
    fn unhandled_irq_is_diagnosed_not_fatal() {
        let mut f = frame(0x2B);
        irq_gateway(&mut f);
    }
}
