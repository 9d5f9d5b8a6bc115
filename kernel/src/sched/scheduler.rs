//! Scheduler core: the run queue singleton, the switch path, thread
//! exit, and the stack reaper.
//!
//! The switch protocol: the tick (IRQ0) and reschedule (int 0x81)
//! handlers call [`preempt`], which snapshots the current thread's
//! context, rotates the queue, and jumps into the next thread. A thread
//! chosen for the first time has no saved context; it is entered by
//! loading its synthesized stack frame through the IRQ return path.
//! Every later entry resumes at the snapshot point inside `preempt`,
//! recognizable by the switch magic in `eax`.
//!
//! An exiting thread is still running on its own kernel stack, and the
//! tick handler runs on it too, so stack teardown is deferred: exit
//! parks the work on a reap list, the next switch arms it, and the
//! switch after that, provably off the dead stack and page directory,
//! performs it.

// The switch path and the reaper only run on the target.
#![cfg_attr(not(target_arch = "x86"), allow(dead_code))]

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{
    mm::VirtAddr,
    sched::{process, Pid, Process, RunQueue, Thread, ThreadState, Tid},
    sync::SpinLock,
    timer,
};

/// Scheduler state: one FIFO run queue and the running thread. The
/// running thread is never in the queue.
pub(crate) struct SchedulerState {
    pub run_queue: RunQueue,
    pub current: Option<Arc<Thread>>,
}

impl SchedulerState {
    pub const fn new() -> Self {
        Self {
            run_queue: RunQueue::new(),
            current: None,
        }
    }

    /// One round-robin step: requeue the current thread (if any) at the
    /// tail and promote the queue head. Returns the new current thread,
    /// or `None` when the queue is empty.
    pub fn rotate(&mut self) -> Option<Arc<Thread>> {
        let next = self.run_queue.pop_front()?;

        if let Some(prev) = self.current.take() {
            prev.set_state(ThreadState::Ready);
            prev.reset_quantum();
            self.run_queue.push_back(prev);
        }

        next.set_state(ThreadState::Running);
        self.current = Some(next.clone());
        Some(next)
    }
}

static SCHEDULER: SpinLock<SchedulerState> = SpinLock::new(SchedulerState::new());

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static ENABLED: AtomicBool = AtomicBool::new(false);

/// `(pid << 32) | tid` of the running thread; zero when none.
static CURRENT_IDS: AtomicU64 = AtomicU64::new(0);

fn pack_ids(pid: Pid, tid: Tid) -> u64 {
    (u64::from(pid.0) << 32) | u64::from(tid.0)
}

/// Identity of the running thread; `(Pid(0), Tid(0))` during boot.
pub fn current_ids() -> (Pid, Tid) {
    let packed = CURRENT_IDS.load(Ordering::Acquire);
    (Pid((packed >> 32) as u32), Tid(packed as u32))
}

/// The running thread, if the scheduler has one.
pub fn current_thread() -> Option<Arc<Thread>> {
    SCHEDULER.lock().current.clone()
}

/// The running thread's process.
pub fn current_process() -> Option<Arc<Process>> {
    let thread = current_thread()?;
    process::find(thread.pid).ok()
}

/// Append a thread to the run queue tail.
pub fn enqueue(thread: Arc<Thread>) {
    thread.set_state(ThreadState::Ready);
    SCHEDULER.lock().run_queue.push_back(thread);
}

/// Pull every queued thread of `pid` out of the run queue.
pub fn remove_process_threads(pid: Pid) -> usize {
    SCHEDULER.lock().run_queue.remove_process(pid)
}

/// True when `thread` sits in the run queue (diagnostics and tests).
pub fn is_queued(thread: &Arc<Thread>) -> bool {
    SCHEDULER.lock().run_queue.contains(thread)
}

/// Gate the switch path on or off. With scheduling disabled the tick
/// handler returns without touching anything.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Release);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Hand the CPU to the next thread without waiting out the quantum.
pub fn yield_now() {
    #[cfg(target_arch = "x86")]
    if INITIALIZED.load(Ordering::Acquire) {
        // Vector 0x81 runs the same switch path as the timer tick.
        unsafe {
            core::arch::asm!("int 0x81", options(nomem, nostack));
        }
        return;
    }

    // No scheduler yet (or a host build): advance virtual time instead,
    // so spin-and-yield waits still make progress toward their timeout.
    timer::advance(1);
}

// ---------------------------------------------------------------------------
// Stack reaper
// ---------------------------------------------------------------------------

struct ReapEntry {
    proc: Arc<Process>,
    kstack: VirtAddr,
    whole_process: bool,
    armed: bool,
}

static REAP_LIST: SpinLock<Vec<ReapEntry>> = SpinLock::new(Vec::new());

fn reap_park(proc: Arc<Process>, kstack: VirtAddr, whole_process: bool) {
    REAP_LIST.lock().push(ReapEntry {
        proc,
        kstack,
        whole_process,
        armed: false,
    });
}

/// Tear down entries armed at the previous switch and arm the rest.
///
/// Arming at switch N and reaping at switch N+1 guarantees the CPU has
/// left the dead thread's stack and page directory in between.
fn reap_drain_and_arm() {
    let ready: Vec<ReapEntry> = {
        let mut list = REAP_LIST.lock();
        let mut ready = Vec::new();
        let mut i = 0;
        while i < list.len() {
            if list[i].armed {
                ready.push(list.swap_remove(i));
            } else {
                list[i].armed = true;
                i += 1;
            }
        }
        ready
    };

    for entry in ready {
        process::reap_teardown(&entry.proc, entry.kstack, entry.whole_process);
    }
}

/// Number of parked reap entries (diagnostics and tests).
pub fn reap_pending() -> usize {
    REAP_LIST.lock().len()
}

// ---------------------------------------------------------------------------
// The switch path
// ---------------------------------------------------------------------------

/// Where a returning thread entry function lands.
pub fn exit_trampoline_addr() -> u32 {
    #[cfg(target_arch = "x86")]
    {
        thread_exit_trampoline as usize as u32
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

/// Entry functions return into here (the creation path pushes this
/// address beneath the IRET frame).
#[cfg(target_arch = "x86")]
extern "C" fn thread_exit_trampoline(_tid: u32) -> ! {
    exit_current_thread()
}

/// Terminate the calling thread.
///
/// Detaches it from its process (deferring kernel-stack and, for a last
/// thread, whole-process teardown to the reaper) and spins until the
/// next tick switches away for good.
#[cfg(target_arch = "x86")]
pub fn exit_current_thread() -> ! {
    use crate::arch::hal;

    let thread = current_thread().expect("exit_current_thread from outside a thread");
    let proc = process::find(thread.pid).expect("exiting thread has a live process");

    let last = process::detach_exiting_thread(&thread).unwrap_or(true);
    thread.set_state(ThreadState::Terminated);

    {
        let mut state = SCHEDULER.lock();
        debug_assert!(state
            .current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &thread)));
        state.current = None;
    }
    CURRENT_IDS.store(0, Ordering::Release);

    reap_park(proc, thread.kernel_stack, last);

    // Wait to be preempted; this thread is gone from every queue, so the
    // switch will never come back here.
    loop {
        hal::sti();
        hal::halt();
    }
}

/// Terminate the calling thread's entire process (the `exit` syscall).
#[cfg(target_arch = "x86")]
pub fn exit_current_process() -> ! {
    use crate::arch::hal;

    let thread = current_thread().expect("exit_current_process from outside a thread");
    let proc = process::find(thread.pid).expect("exiting thread has a live process");

    remove_process_threads(proc.pid);
    process::remove_from_table(proc.pid);
    thread.set_state(ThreadState::Terminated);

    {
        let mut state = SCHEDULER.lock();
        state.current = None;
    }
    CURRENT_IDS.store(0, Ordering::Release);

    reap_park(proc, thread.kernel_stack, true);

    loop {
        hal::sti();
        hal::halt();
    }
}

/// The preemption path, shared by IRQ0 and vector 0x81.
#[cfg(target_arch = "x86")]
pub fn preempt() {
    use crate::arch::{self, x86::context, x86::gdt};

    if !ENABLED.load(Ordering::Acquire) || !INITIALIZED.load(Ordering::Acquire) {
        return;
    }

    reap_drain_and_arm();

    let state = SCHEDULER.lock();
    // The guard is managed manually across the switch below; re-borrow
    // through a mutable binding.
    let mut state = state;

    if let Some(current) = state.current.clone() {
        // Snapshot this thread's context. When a later switch brings the
        // thread back, execution resumes right here with the magic in
        // eax; the guard drop below then releases the lock the switching
        // thread left held for us.
        let resumed = unsafe { context::save_context(current.context_ptr()) };
        if resumed == context::SWITCH_MAGIC {
            return;
        }
    }

    let Some(next) = state.rotate() else {
        panic!("scheduler: run queue empty");
    };
    CURRENT_IDS.store(pack_ids(next.pid, next.tid), Ordering::Release);

    // Traps from ring 3 must land on the incoming thread's kernel stack.
    if next.is_user() {
        gdt::update_tss(
            arch::KERNEL_DATA_SELECTOR,
            next.kernel_stack_top().as_usize() as u32,
        );
    }

    let ctx = next.saved_context();
    let cr3 = next.page_dir_phys.as_usize();

    if !next.entered() {
        next.set_entered();
        // First entry pops the synthesized frame via the IRQ return
        // path; nothing ever returns here, so release the lock now.
        drop(state);
        // SAFETY: the thread's stack frame was built for exactly this.
        unsafe { context::first_enter_thread(ctx.esp, cr3) }
    } else {
        // The resumed thread releases the lock through its own pending
        // guard (see save_context above), so ours must not.
        core::mem::forget(state);
        // SAFETY: esp/ebp/eip were saved by save_context in the target
        // thread's own preempt invocation.
        unsafe { context::resume_thread(ctx.esp, ctx.ebp, ctx.eip, cr3) }
    }
}

/// IRQ0: advance the clock, then run the switch path.
#[cfg(target_arch = "x86")]
fn timer_irq_handler(_frame: &mut crate::irq::InterruptFrame) {
    timer::on_tick();
    preempt();
}

/// Vector 0x81: voluntary reschedule.
#[cfg(target_arch = "x86")]
fn reschedule_handler(_frame: &mut crate::irq::InterruptFrame) {
    preempt();
}

/// Bring the scheduler up and never return.
///
/// Creates the kernel "init" process around the boot address space with
/// the main kernel thread and an idle thread, installs the tick and
/// reschedule handlers, and parks the boot context; the first timer
/// interrupt switches into the main thread.
#[cfg(target_arch = "x86")]
pub fn init(space: crate::mm::vmm::AddressSpace, main_entry: extern "C" fn() -> !) -> ! {
    use crate::arch::hal;

    let proc = process::create_initial_process(space).expect("failed to create init process");
    process::init_heap_growth();

    process::create_thread(&proc, main_entry as usize).expect("failed to create kernel thread");
    process::create_thread(&proc, idle_task as usize).expect("failed to create idle thread");

    crate::irq::register_isr(crate::irq::TIMER_VECTOR, timer_irq_handler)
        .expect("timer vector is free");
    crate::irq::register_isr(crate::irq::RESCHEDULE_VECTOR, reschedule_handler)
        .expect("reschedule vector is free");

    INITIALIZED.store(true, Ordering::Release);
    ENABLED.store(true, Ordering::Release);
    log::info!("scheduler: init process {} with 2 threads", proc.pid);

    // The boot stack is abandoned here; IRQ0 takes it from now on.
    hal::sti();
    loop {
        hal::halt();
    }
}

/// The idle thread: runnable whenever nothing else is.
#[cfg(target_arch = "x86")]
extern "C" fn idle_task() -> ! {
    loop {
        crate::arch::hal::halt();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::{
        mm::{PhysAddr, VirtAddr},
        sched::Priority,
    };

    fn thread(tid: u32) -> Arc<Thread> {
        Arc::new(Thread::new(
            Tid(tid),
            Pid(200),
            Priority::Normal,
            VirtAddr::new(0xBFFF_C000),
            None,
            0x2000,
            PhysAddr::new(0x2000),
        ))
    }

    #[test]
    fn rotate_is_round_robin() {
        let mut state = SchedulerState::new();
        let (a, b) = (thread(1), thread(2));
        state.run_queue.push_back(a.clone());
        state.run_queue.push_back(b.clone());

        // a, b, a, b ...
        for expected in [&a, &b, &a, &b, &a] {
            let next = state.rotate().unwrap();
            assert!(Arc::ptr_eq(&next, expected));
        }
    }

    #[test]
    fn running_thread_is_never_in_the_queue() {
        let mut state = SchedulerState::new();
        let (a, b) = (thread(1), thread(2));
        state.run_queue.push_back(a.clone());
        state.run_queue.push_back(b.clone());

        for _ in 0..5 {
            let current = state.rotate().unwrap();
            assert!(!state.run_queue.contains(&current));
            assert_eq!(current.state(), ThreadState::Running);
        }
    }

    #[test]
    fn rotate_requeues_previous_as_ready() {
        let mut state = SchedulerState::new();
        let (a, b) = (thread(1), thread(2));
        state.run_queue.push_back(a.clone());
        state.run_queue.push_back(b.clone());

        let first = state.rotate().unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        let second = state.rotate().unwrap();
        assert!(Arc::ptr_eq(&second, &b));
        assert_eq!(a.state(), ThreadState::Ready);
        assert!(state.run_queue.contains(&a));
    }

    #[test]
    fn rotate_on_empty_queue_is_none() {
        let mut state = SchedulerState::new();
        assert!(state.rotate().is_none());

        // With a current thread but an empty queue the rotation still
        // yields nothing and leaves the current thread in place.
        let a = thread(1);
        state.run_queue.push_back(a.clone());
        state.rotate().unwrap();
        assert!(state.rotate().is_none());
        assert!(state.current.is_some());
    }

    #[test]
    fn current_ids_default_to_zero() {
        // On the host nothing ever runs the switch path.
        let (pid, tid) = current_ids();
        assert_eq!(pid, Pid(0));
        assert_eq!(tid, Tid(0));
    }
}
