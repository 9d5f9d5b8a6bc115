//! Processes and the process table.
//!
//! A process owns its address space and up to [`MAX_THREADS`] threads; a
//! spinlock guards the mutable interior. The table holds at most
//! [`MAX_PROCESSES`] live processes; slot 0 is always the kernel "init"
//! process.
//!
//! While a process lives it has at least one thread; when the last
//! thread exits the process is destroyed.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        heap,
        vmm::{self, Access, AddressSpace, RegionUsage},
        PhysAddr, VirtAddr, KERNEL_OFFSET,
    },
    sched::{
        scheduler,
        thread::{self, Context, FrameSpec},
        Pid, Priority, ProcessMode, Thread, Tid, KERNEL_STACK_SIZE, MAX_PROCESSES, MAX_THREADS,
        STACK_GAP_SIZE, USER_STACK_SIZE,
    },
    sync::SpinLock,
};

/// Mutable interior of a process.
pub struct ProcessInner {
    pub space: AddressSpace,
    pub threads: Vec<Arc<Thread>>,
    next_tid: u32,
}

/// A kernel- or user-mode process.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub mode: ProcessMode,
    pub priority: Priority,
    inner: SpinLock<ProcessInner>,
}

/// Pid counter. Monotonic, never recycled.
static NEXT_PID: AtomicU32 = AtomicU32::new(100);

fn alloc_pid() -> Pid {
    Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

impl Process {
    fn new(name: &str, mode: ProcessMode, priority: Priority, space: AddressSpace) -> Arc<Self> {
        Arc::new(Self {
            pid: alloc_pid(),
            name: String::from(name),
            mode,
            priority,
            inner: SpinLock::new(ProcessInner {
                space,
                // Reserved up front so pushes never allocate while the
                // process lock is held.
                threads: Vec::with_capacity(MAX_THREADS),
                next_tid: 0,
            }),
        })
    }

    /// Run `f` with the process interior locked.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut ProcessInner) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    pub fn find_thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.inner
            .lock()
            .threads
            .iter()
            .find(|t| t.tid == tid)
            .cloned()
    }

    pub fn region_count(&self) -> usize {
        self.inner.lock().space.region_count()
    }
}

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

struct ProcessTable {
    slots: [Option<Arc<Process>>; MAX_PROCESSES],
    count: usize,
}

static PROCESS_TABLE: SpinLock<ProcessTable> = SpinLock::new(ProcessTable {
    slots: [const { None }; MAX_PROCESSES],
    count: 0,
});

fn register(proc: Arc<Process>) -> KernelResult<()> {
    let mut table = PROCESS_TABLE.lock();
    if table.count == MAX_PROCESSES {
        return Err(KernelError::OutOfMemory {
            requested: core::mem::size_of::<Process>(),
        });
    }
    let count = table.count;
    table.slots[count] = Some(proc);
    table.count += 1;
    Ok(())
}

fn unregister(pid: Pid) {
    let mut table = PROCESS_TABLE.lock();
    let Some(index) = table.slots[..table.count]
        .iter()
        .position(|p| p.as_ref().map(|p| p.pid) == Some(pid))
    else {
        return;
    };
    for i in index..table.count - 1 {
        table.slots[i] = table.slots[i + 1].take();
    }
    table.count -= 1;
    let last = table.count;
    table.slots[last] = None;
}

/// Drop a process from the table without tearing it down. Used by the
/// exit path, which must defer teardown to the reaper.
pub fn remove_from_table(pid: Pid) {
    unregister(pid);
}

/// Look a process up by pid.
pub fn find(pid: Pid) -> KernelResult<Arc<Process>> {
    let table = PROCESS_TABLE.lock();
    table.slots[..table.count]
        .iter()
        .flatten()
        .find(|p| p.pid == pid)
        .cloned()
        .ok_or(KernelError::NotFound)
}

/// Number of live processes.
pub fn count() -> usize {
    PROCESS_TABLE.lock().count
}

/// The kernel "init" process, once boot has created it.
pub fn kernel_process() -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().slots[0].clone()
}

/// Invoke `f` on every live process.
pub fn for_each(mut f: impl FnMut(&Arc<Process>)) {
    let snapshot: Vec<Arc<Process>> = {
        let table = PROCESS_TABLE.lock();
        table.slots[..table.count].iter().flatten().cloned().collect()
    };
    for proc in &snapshot {
        f(proc);
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Wrap the boot-built kernel address space into the "init" process.
/// Installed at table slot 0.
pub fn create_initial_process(space: AddressSpace) -> KernelResult<Arc<Process>> {
    let proc = Process::new("init", ProcessMode::Kernel, Priority::Normal, space);
    register(proc.clone())?;
    Ok(proc)
}

/// Create a user process with `entry` as its primary thread, already
/// eligible to run.
pub fn create_process(name: &str, entry: usize, priority: Priority) -> KernelResult<Pid> {
    create_process_with(name, entry, priority, true)
}

/// Create a user process whose primary thread stays parked. The caller
/// enqueues it when the address space is fully populated; the ELF
/// loader must not let the thread run before its segments exist.
pub fn create_process_parked(name: &str, entry: usize, priority: Priority) -> KernelResult<Pid> {
    create_process_with(name, entry, priority, false)
}

fn create_process_with(
    name: &str,
    entry: usize,
    priority: Priority,
    start: bool,
) -> KernelResult<Pid> {
    let kernel = kernel_process().ok_or(KernelError::InvalidState)?;
    let space = kernel.with_inner(|ki| AddressSpace::new_user(&ki.space))?;

    let proc = Process::new(name, ProcessMode::User, priority, space);
    let pid = proc.pid;
    register(proc.clone())?;

    if let Err(e) = create_thread_with(&proc, entry, start) {
        unregister(pid);
        return Err(e);
    }
    Ok(pid)
}

/// Pick a stack location: below the lowest existing stack region, which
/// itself starts below the kernel base, leaving an unmapped guard gap.
fn find_stack_location(space: &AddressSpace, size: usize) -> VirtAddr {
    let mut floor = KERNEL_OFFSET - crate::mm::PAGE_SIZE;
    for region in space.regions() {
        if region.usage.contains(RegionUsage::STACK) && region.virt.as_usize() < floor {
            floor = region.virt.as_usize();
        }
    }
    if floor < size + STACK_GAP_SIZE {
        panic!("no address space left for a thread stack");
    }
    VirtAddr::new(floor - size - STACK_GAP_SIZE)
}

/// Create a thread in `proc`, starting at `entry`.
pub fn create_thread(proc: &Arc<Process>, entry: usize) -> KernelResult<Tid> {
    create_thread_with(proc, entry, true)
}

/// Thread creation worker.
///
/// Allocates and maps the kernel (and, for user processes, user) stack,
/// then writes the initial frame through a temporary mapping: the new
/// stack lives in an address space that may not be current, so it is
/// aliased into the current one just long enough to initialize it. With
/// `enqueue` clear the thread is left parked.
fn create_thread_with(proc: &Arc<Process>, entry: usize, enqueue: bool) -> KernelResult<Tid> {
    let user = proc.mode == ProcessMode::User;
    let current = scheduler::current_process();

    let mut inner = proc.inner.lock();
    if inner.threads.len() >= MAX_THREADS {
        return Err(KernelError::OutOfMemory {
            requested: KERNEL_STACK_SIZE,
        });
    }
    let tid = Tid(inner.next_tid);
    inner.next_tid += 1;

    let kstack = find_stack_location(&inner.space, KERNEL_STACK_SIZE);
    inner.space.alloc_and_map(
        kstack,
        KERNEL_STACK_SIZE,
        RegionUsage::KERNEL_STACK,
        Access::ReadWrite,
        false,
    )?;

    let ustack = if user {
        let va = find_stack_location(&inner.space, USER_STACK_SIZE);
        if let Err(e) = inner.space.alloc_and_map(
            va,
            USER_STACK_SIZE,
            RegionUsage::USER_STACK,
            Access::ReadWrite,
            false,
        ) {
            let _ = inner.space.unmap_region(kstack, false);
            return Err(e);
        }
        Some(va)
    } else {
        None
    };

    let kstack_phys = inner.space.region_phys_addr(kstack)?;
    let dir_phys = inner.space.dir_phys();

    let thread = Arc::new(Thread::new(
        tid,
        proc.pid,
        proc.priority,
        kstack,
        ustack,
        KERNEL_STACK_SIZE,
        dir_phys,
    ));

    let spec = FrameSpec {
        entry: entry as u32,
        user,
        user_stack_top: ustack
            .map(|v| (v.as_usize() + USER_STACK_SIZE) as u32)
            .unwrap_or(0),
        exit_trampoline: scheduler::exit_trampoline_addr(),
        exit_arg: tid.0,
    };

    // The temp mapping must be made in the *current* address space, the
    // one whose directory the CPU is actually using.
    let same_space = current.as_ref().map_or(true, |c| Arc::ptr_eq(c, proc));
    if same_space {
        write_bootstrap_frame(&mut inner.space, kstack_phys, &thread, &spec)?;
        inner.threads.push(thread.clone());
        drop(inner);
    } else {
        drop(inner);
        let current = current.expect("a current process exists on this path");
        current.with_inner(|ci| write_bootstrap_frame(&mut ci.space, kstack_phys, &thread, &spec))?;
        proc.inner.lock().threads.push(thread.clone());
    }

    if enqueue {
        scheduler::enqueue(thread);
    }
    Ok(tid)
}

/// Alias the new thread's kernel stack into `space`, write the initial
/// frame, record the thread's starting context, drop the alias.
fn write_bootstrap_frame(
    space: &mut AddressSpace,
    kstack_phys: PhysAddr,
    thread: &Thread,
    spec: &FrameSpec,
) -> KernelResult<()> {
    let temp = space.temp_map(kstack_phys, thread.stack_size)?;
    let va_top = thread.kernel_stack_top().as_usize() as u32;

    #[cfg(target_arch = "x86")]
    let esp = {
        let top = (temp.as_usize() + thread.stack_size) as *mut u32;
        // SAFETY: the temp mapping aliases the freshly allocated stack.
        unsafe { thread::write_initial_frame(top, va_top, spec) }
    };
    #[cfg(not(target_arch = "x86"))]
    let esp = {
        // Host builds carry no physical memory behind the mapping; only
        // the bookkeeping and the resulting esp are exercised.
        va_top - (thread::frame_words(spec.user) as u32) * 4
    };

    thread.set_saved_context(Context {
        esp,
        ebp: 0,
        eip: spec.entry,
    });

    space.unmap_region(temp, true)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Destroy a process that is not currently running: pull its threads
/// from the run queue, unmap every region (returning auto-free frames),
/// drop it from the table.
pub fn destroy_process(pid: Pid) -> KernelResult<()> {
    let proc = find(pid)?;
    scheduler::remove_process_threads(pid);

    proc.with_inner(|inner| -> KernelResult<()> {
        inner.threads.clear();
        while let Some(region) = inner.space.region(0) {
            inner.space.unmap_region(region.virt, false)?;
        }
        Ok(())
    })?;

    unregister(pid);
    Ok(())
}

/// Detach an exiting thread from its process: remove it from the thread
/// table and unmap its user stack. The kernel stack is left alone, since the
/// thread is still running on it, and is reaped later by the switch
/// path. Returns true when this was the process's last thread.
pub fn detach_exiting_thread(thread: &Arc<Thread>) -> KernelResult<bool> {
    let proc = find(thread.pid)?;
    let last = proc.with_inner(|inner| -> KernelResult<bool> {
        inner.threads.retain(|t| !Arc::ptr_eq(t, thread));
        if let Some(ustack) = thread.user_stack {
            // No TLB commit: the next address-space switch flushes it.
            inner.space.unmap_region(ustack, false)?;
        }
        Ok(inner.threads.is_empty())
    })?;

    if last {
        // The rest of the teardown (all regions, table slot) also has to
        // wait until the CPU has left this process's page directory.
        unregister(thread.pid);
    }
    Ok(last)
}

/// Deferred teardown run by the reaper once the CPU is provably off the
/// process's stacks and page directory.
pub fn reap_teardown(proc: &Arc<Process>, kstack: VirtAddr, whole_process: bool) {
    proc.with_inner(|inner| {
        if whole_process {
            inner.threads.clear();
            while let Some(region) = inner.space.region(0) {
                let _ = inner.space.unmap_region(region.virt, false);
            }
        } else {
            let _ = inner.space.unmap_region(kstack, false);
        }
    });
}

// ---------------------------------------------------------------------------
// Kernel heap growth
// ---------------------------------------------------------------------------

/// Install the kernel-heap growth hook. Called once at boot, after the
/// init process exists.
pub fn init_heap_growth() {
    heap::set_grow_hook(grow_kernel_heap);
}

/// Ask the VMM for another kernel heap arena and republish the kernel
/// directory slots to every live address space.
fn grow_kernel_heap(size: usize) -> KernelResult<(usize, usize)> {
    let kernel = kernel_process().ok_or(KernelError::InvalidState)?;
    let base =
        kernel.with_inner(|inner| vmm::create_heap(&mut inner.space, size, RegionUsage::KERNEL))?;
    sync_kernel_slots();
    Ok((base.as_usize(), size))
}

/// Propagate the kernel quarter's directory slots into every live
/// address space, so kernel regions created after a process was spawned
/// are visible inside it.
pub fn sync_kernel_slots() {
    let Some(kernel) = kernel_process() else {
        return;
    };
    let slots = kernel.with_inner(|inner| inner.space.kernel_slots());
    for_each(|proc| {
        if !Arc::ptr_eq(proc, &kernel) {
            proc.with_inner(|inner| inner.space.install_kernel_slots(&slots));
        }
    });
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::{mm::bootstrap, test_support};

    fn fresh_kernel_process() -> Arc<Process> {
        bootstrap::init_for_tests();
        test_support::seed_frame_allocator();
        let space = AddressSpace::new_kernel().unwrap();
        create_initial_process(space).unwrap()
    }

    fn teardown(proc: Arc<Process>) {
        destroy_process(proc.pid).unwrap();
    }

    #[test]
    fn initial_process_occupies_slot_zero() {
        let _g = test_support::lock();
        let proc = fresh_kernel_process();
        assert_eq!(kernel_process().unwrap().pid, proc.pid);
        assert_eq!(proc.name, "init");
        assert_eq!(proc.mode, ProcessMode::Kernel);
        teardown(proc);
    }

    #[test]
    fn pids_are_monotonic() {
        let _g = test_support::lock();
        let a = fresh_kernel_process();
        let b = Process::new("other", ProcessMode::Kernel, Priority::Normal, {
            AddressSpace::new_kernel().unwrap()
        });
        assert!(b.pid > a.pid);
        teardown(a);
    }

    #[test]
    fn create_thread_places_stacks_below_kernel_base() {
        let _g = test_support::lock();
        let proc = fresh_kernel_process();

        let tid = create_thread(&proc, 0x1234).unwrap();
        assert_eq!(proc.thread_count(), 1);

        let thread = proc.find_thread(tid).unwrap();
        let expected =
            KERNEL_OFFSET - crate::mm::PAGE_SIZE - KERNEL_STACK_SIZE - STACK_GAP_SIZE;
        assert_eq!(thread.kernel_stack, VirtAddr::new(expected));

        // The second thread's stack sits below the first, gap included.
        let tid2 = create_thread(&proc, 0x5678).unwrap();
        let second = proc.find_thread(tid2).unwrap();
        assert_eq!(
            second.kernel_stack,
            VirtAddr::new(expected - KERNEL_STACK_SIZE - STACK_GAP_SIZE)
        );

        // Initial context points at the synthesized frame.
        let ctx = thread.saved_context();
        assert_eq!(ctx.eip, 0x1234);
        assert_eq!(
            ctx.esp,
            (expected + KERNEL_STACK_SIZE) as u32 - (thread::frame_words(false) as u32) * 4
        );

        // Temp mappings were cleaned up: only the two stack regions remain.
        assert_eq!(proc.region_count(), 2);
        teardown(proc);
    }

    #[test]
    fn thread_limit_is_enforced() {
        let _g = test_support::lock();
        let proc = fresh_kernel_process();

        // Fill the thread table without consuming address space; the
        // region table (32 regions, two per real thread plus the temp
        // alias) could not hold 32 fully materialized stacks anyway.
        proc.with_inner(|inner| {
            for i in 0..MAX_THREADS {
                inner.threads.push(Arc::new(Thread::new(
                    Tid(i as u32),
                    proc.pid,
                    Priority::Normal,
                    VirtAddr::new(0xB000_0000 + i * 0x4000),
                    None,
                    KERNEL_STACK_SIZE,
                    PhysAddr::new(0),
                )));
            }
        });

        assert!(matches!(
            create_thread(&proc, 0x1000),
            Err(KernelError::OutOfMemory { .. })
        ));

        proc.with_inner(|inner| inner.threads.clear());
        teardown(proc);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let _g = test_support::lock();
        let proc = fresh_kernel_process();
        let free_before = crate::mm::phys::allocator().free_frames();

        create_thread(&proc, 0x1000).unwrap();
        create_thread(&proc, 0x2000).unwrap();
        assert!(crate::mm::phys::allocator().free_frames() < free_before);

        teardown(proc);
        assert_eq!(crate::mm::phys::allocator().free_frames(), free_before);
        assert_eq!(count(), 0);
    }

    #[test]
    fn user_process_gets_two_stacks_and_shared_kernel_slots() {
        let _g = test_support::lock();
        let kernel = fresh_kernel_process();
        kernel.with_inner(|inner| {
            inner
                .space
                .map_region(
                    PhysAddr::new(0),
                    VirtAddr::new(KERNEL_OFFSET),
                    4 * 1024 * 1024,
                    RegionUsage::KERNEL,
                    Access::ReadWrite,
                    false,
                )
                .unwrap();
        });

        let pid = create_process("hello", 0x40_0000, Priority::Normal).unwrap();
        let proc = find(pid).unwrap();
        assert_eq!(proc.mode, ProcessMode::User);
        assert_eq!(proc.thread_count(), 1);

        let thread = proc.find_thread(Tid(0)).unwrap();
        assert!(thread.is_user());
        assert!(thread.user_stack.is_some());
        // Kernel stack and user stack both live below the kernel base.
        assert!(thread.kernel_stack.as_usize() < KERNEL_OFFSET);
        assert!(thread.user_stack.unwrap().as_usize() < thread.kernel_stack.as_usize());

        destroy_process(pid).unwrap();
        teardown(kernel);
    }
}
