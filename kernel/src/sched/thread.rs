//! Threads and their initial stack frames.
//!
//! Every thread owns a kernel stack; user threads own a user stack too.
//! A thread's saved context is three words (`esp`, `ebp`, `eip`) written
//! by the switch path with interrupts disabled.
//!
//! A brand-new thread has never been switched *out* of, so there is no
//! saved context to restore. Instead its kernel stack is pre-filled with
//! the exact frame the IRQ-return path pops: segment selector word, a
//! `popad` register image, dummy interrupt/error slots, and an IRET frame
//! ending at the entry point. For ring-3 threads the IRET frame also
//! carries the user `ss:esp` so the privilege switch lands on the user
//! stack. Above all of that sits a return address leading into the exit
//! trampoline, so an entry function that simply returns terminates
//! cleanly.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::{
    arch::{
        KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR,
    },
    mm::{PhysAddr, VirtAddr},
    sched::{Pid, Priority, ThreadState, Tid, DEFAULT_QUANTUM},
};

/// Saved execution context of a suspended thread.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
}

/// A kernel- or user-mode thread.
pub struct Thread {
    pub tid: Tid,
    pub pid: Pid,
    pub priority: Priority,
    /// Base of the kernel stack region in the owning process's space.
    pub kernel_stack: VirtAddr,
    /// Base of the user stack region, for ring-3 threads.
    pub user_stack: Option<VirtAddr>,
    pub stack_size: usize,
    /// Physical address of the owning process's page directory, kept
    /// here so the switch path needs no process-table lookup.
    pub page_dir_phys: PhysAddr,

    state: AtomicU32,
    quantum: AtomicU32,
    entered: AtomicBool,
    context: UnsafeCell<Context>,
}

// SAFETY: the context cell is only touched by the switch path and thread
// creation, both with interrupts disabled on a single CPU.
unsafe impl Sync for Thread {}
unsafe impl Send for Thread {}

impl Thread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tid: Tid,
        pid: Pid,
        priority: Priority,
        kernel_stack: VirtAddr,
        user_stack: Option<VirtAddr>,
        stack_size: usize,
        page_dir_phys: PhysAddr,
    ) -> Self {
        Self {
            tid,
            pid,
            priority,
            kernel_stack,
            user_stack,
            stack_size,
            page_dir_phys,
            state: AtomicU32::new(ThreadState::Ready as u32),
            quantum: AtomicU32::new(DEFAULT_QUANTUM),
            entered: AtomicBool::new(false),
            context: UnsafeCell::new(Context::default()),
        }
    }

    pub fn is_user(&self) -> bool {
        self.user_stack.is_some()
    }

    /// Top of the kernel stack; what goes into `TSS.esp0` for this
    /// thread, and where the initial frame is built.
    pub fn kernel_stack_top(&self) -> VirtAddr {
        VirtAddr::new(self.kernel_stack.as_usize() + self.stack_size)
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn quantum(&self) -> u32 {
        self.quantum.load(Ordering::Relaxed)
    }

    pub fn reset_quantum(&self) {
        self.quantum.store(DEFAULT_QUANTUM, Ordering::Relaxed);
    }

    /// True once the scheduler has entered this thread at least once.
    pub fn entered(&self) -> bool {
        self.entered.load(Ordering::Acquire)
    }

    pub fn set_entered(&self) {
        self.entered.store(true, Ordering::Release);
    }

    /// Raw pointer to the saved context, for the switch path.
    pub fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub fn saved_context(&self) -> Context {
        // SAFETY: reads race only with the switch path, which runs with
        // interrupts disabled; both sides are on the same CPU.
        unsafe { *self.context.get() }
    }

    pub fn set_saved_context(&self, context: Context) {
        // SAFETY: as above.
        unsafe {
            *self.context.get() = context;
        }
    }
}

// ---------------------------------------------------------------------------
// Initial stack frame
// ---------------------------------------------------------------------------

/// EFLAGS value for fresh threads: reserved bit 1 plus IF.
const INITIAL_EFLAGS: u32 = 0x202;

/// What to synthesize onto a fresh kernel stack.
pub struct FrameSpec {
    /// Thread entry point.
    pub entry: u32,
    /// Ring-3 thread? Selects CS/DS selectors and the extra `ss:esp`.
    pub user: bool,
    /// Top of the user stack (ignored for kernel threads).
    pub user_stack_top: u32,
    /// Where a returning entry function lands.
    pub exit_trampoline: u32,
    /// Argument handed to the exit trampoline.
    pub exit_arg: u32,
}

/// Number of 32-bit words the initial frame occupies.
pub const fn frame_words(user: bool) -> usize {
    // arg + fake return + trampoline, IRET frame, int/err dummies,
    // popad image, segment word.
    let base = 3 + 3 + 2 + 8 + 1;
    if user {
        base + 2 // user ss:esp popped by the privilege-switching IRET
    } else {
        base
    }
}

/// Write the initial frame into a writable alias of the kernel stack.
///
/// `top` points one-past-the-end of the writable alias; `va_top` is the
/// same boundary as the owning process will see it. Returns the thread's
/// initial `esp` (in the owning process's view).
///
/// # Safety
///
/// `top` must be writable for at least `frame_words(spec.user)` words
/// below it.
pub unsafe fn write_initial_frame(top: *mut u32, va_top: u32, spec: &FrameSpec) -> u32 {
    let mut sp = top;
    let mut push = |value: u32| {
        // SAFETY: stays within the frame extent per the caller contract.
        unsafe {
            sp = sp.sub(1);
            sp.write(value);
        }
    };

    // Entry's return path: `ret` lands in the exit trampoline with a
    // dummy return address and the trampoline argument on the stack.
    push(spec.exit_arg);
    push(0);
    push(spec.exit_trampoline);

    // IRET frame, bottom-up. A privilege-switching IRET additionally
    // pops the user ss:esp.
    if spec.user {
        push(USER_DATA_SELECTOR as u32);
        push(spec.user_stack_top);
    }
    push(INITIAL_EFLAGS);
    push(if spec.user {
        USER_CODE_SELECTOR as u32
    } else {
        KERNEL_CODE_SELECTOR as u32
    });
    push(spec.entry);

    // Interrupt number and error code slots discarded by the gateway
    // epilogue.
    push(0); // err_code
    push(0); // int_no

    // popad image: eax, ecx, edx, ebx, esp (ignored), ebp, esi, edi.
    push(0); // eax
    push(0); // ecx
    push(0); // edx
    push(0); // ebx
    // Words pushed so far; the stored esp mirrors its value before the
    // eax..ebx pushes, though popad discards this slot anyway.
    let words_so_far = 3 + if spec.user { 2 } else { 0 } + 3 + 2 + 4;
    push(va_top - words_so_far * 4 + 4 * 4);
    push(0); // ebp
    push(0); // esi
    push(0); // edi

    // One selector word loaded into DS/ES/FS/GS.
    push(if spec.user {
        USER_DATA_SELECTOR as u32
    } else {
        KERNEL_DATA_SELECTOR as u32
    });

    let used = frame_words(spec.user) as u32;
    debug_assert_eq!(unsafe { top.offset_from(sp) } as u32, used);
    va_top - used * 4
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;

    use super::*;

    fn build(user: bool) -> (vec::Vec<u32>, u32) {
        let words = frame_words(user);
        let mut buf = vec![0u32; words];
        let spec = FrameSpec {
            entry: 0x0040_1000,
            user,
            user_stack_top: 0x7000_0000,
            exit_trampoline: 0xC011_2233,
            exit_arg: 42,
        };
        let va_top = 0xBFFF_E000u32;
        let esp = unsafe { write_initial_frame(buf.as_mut_ptr().add(words), va_top, &spec) };
        (buf, esp)
    }

    #[test]
    fn kernel_frame_layout() {
        let (buf, esp) = build(false);
        assert_eq!(buf.len(), 17);
        assert_eq!(esp, 0xBFFF_E000 - 17 * 4);

        // Top of stack downward: exit arg, fake return, trampoline.
        let n = buf.len();
        assert_eq!(buf[n - 1], 42);
        assert_eq!(buf[n - 2], 0);
        assert_eq!(buf[n - 3], 0xC011_2233);
        // IRET frame: eflags, cs, eip.
        assert_eq!(buf[n - 4], 0x202);
        assert_eq!(buf[n - 5], KERNEL_CODE_SELECTOR as u32);
        assert_eq!(buf[n - 6], 0x0040_1000);
        // err/int dummies.
        assert_eq!(buf[n - 7], 0);
        assert_eq!(buf[n - 8], 0);
        // Segment word at the very bottom.
        assert_eq!(buf[0], KERNEL_DATA_SELECTOR as u32);
    }

    #[test]
    fn user_frame_carries_ring3_selectors_and_stack() {
        let (buf, esp) = build(true);
        assert_eq!(buf.len(), 19);
        assert_eq!(esp, 0xBFFF_E000 - 19 * 4);

        let n = buf.len();
        // Below the trampoline words: ss, esp for the privilege switch.
        assert_eq!(buf[n - 4], USER_DATA_SELECTOR as u32);
        assert_eq!(buf[n - 5], 0x7000_0000);
        assert_eq!(buf[n - 6], 0x202);
        assert_eq!(buf[n - 7], USER_CODE_SELECTOR as u32);
        assert_eq!(buf[n - 8], 0x0040_1000);
        assert_eq!(buf[0], USER_DATA_SELECTOR as u32);
    }

    #[test]
    fn thread_state_transitions() {
        let t = Thread::new(
            Tid(1),
            Pid(100),
            Priority::Normal,
            VirtAddr::new(0xBFFF_C000),
            None,
            0x2000,
            PhysAddr::new(0x1000),
        );
        assert_eq!(t.state(), ThreadState::Ready);
        assert!(!t.entered());

        t.set_state(ThreadState::Running);
        assert_eq!(t.state(), ThreadState::Running);
        t.set_entered();
        assert!(t.entered());

        assert_eq!(t.kernel_stack_top(), VirtAddr::new(0xBFFF_E000));
        assert!(!t.is_user());
    }
}
