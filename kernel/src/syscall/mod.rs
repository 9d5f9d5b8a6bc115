//! System call dispatch.
//!
//! User space enters through vector 0x80 with the syscall id in `eax`
//! and arguments in `ebx`/`ecx`/`edx`; the result goes back into the
//! saved frame's `eax`. Kernel objects never cross the boundary as
//! pointers; user space holds opaque handles into kernel-side tables.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    fs::{self, Stream},
    irq::{self, InterruptFrame},
    sync::{RecursiveMutex, SpinLock},
};

pub const SYS_TEST: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_FOPEN: u32 = 2;
pub const SYS_FCLOSE: u32 = 3;
pub const SYS_FWRITE: u32 = 4;
pub const SYS_MUTEX: u32 = 5;

/// `sys_mutex` subcommands, in `ebx`.
pub const MUTEX_CREATE: u32 = 0;
pub const MUTEX_LOCK: u32 = 1;
pub const MUTEX_UNLOCK: u32 = 2;
pub const MUTEX_DESTROY: u32 = 3;

/// Result value for success.
const S_OK: u32 = 0;

type SyscallHandler = fn(&mut InterruptFrame);

static SYSCALLS: &[SyscallHandler] = &[
    sys_test,
    sys_exit,
    sys_fopen,
    sys_fclose,
    sys_fwrite,
    sys_mutex,
];

/// Handle tables. Handles are `index + 1`, so 0 stays "invalid".
struct HandleTable<T> {
    slots: Vec<Option<T>>,
}

impl<T: Clone> HandleTable<T> {
    const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn insert(&mut self, value: T) -> u32 {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                return (i + 1) as u32;
            }
        }
        self.slots.push(Some(value));
        self.slots.len() as u32
    }

    fn get(&self, handle: u32) -> KernelResult<T> {
        let index = handle.checked_sub(1).ok_or(KernelError::NotFound)? as usize;
        self.slots
            .get(index)
            .and_then(Clone::clone)
            .ok_or(KernelError::NotFound)
    }

    fn remove(&mut self, handle: u32) -> KernelResult<T> {
        let index = handle.checked_sub(1).ok_or(KernelError::NotFound)? as usize;
        self.slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(KernelError::NotFound)
    }
}

static OPEN_STREAMS: SpinLock<HandleTable<Arc<dyn Stream>>> = SpinLock::new(HandleTable::new());
static MUTEXES: SpinLock<HandleTable<Arc<RecursiveMutex>>> = SpinLock::new(HandleTable::new());

/// The vector 0x80 gateway.
fn syscall_gateway(frame: &mut InterruptFrame) {
    let id = frame.eax;
    match SYSCALLS.get(id as usize) {
        Some(handler) => handler(frame),
        None => frame.eax = KernelError::InvalidArgument.code(),
    }
}

/// Install the syscall gateway on vector 0x80.
pub fn init() -> KernelResult<()> {
    irq::register_isr(irq::SYSCALL_VECTOR, syscall_gateway)
}

/// Copy a NUL-terminated string out of user memory.
///
/// The pointer is trusted to be mapped; an unmapped access surfaces as a
/// page fault, which this kernel treats as fatal.
#[cfg(target_arch = "x86")]
fn copy_user_cstr(ptr: u32) -> KernelResult<alloc::string::String> {
    use alloc::string::String;

    const MAX_PATH: usize = 4096;

    if ptr == 0 || ptr as usize >= crate::mm::KERNEL_OFFSET {
        return Err(KernelError::InvalidArgument);
    }

    let mut out = String::new();
    for i in 0..MAX_PATH {
        // SAFETY: bounded walk below the kernel base; see above.
        let byte = unsafe { *((ptr as usize + i) as *const u8) };
        if byte == 0 {
            return Ok(out);
        }
        out.push(byte as char);
    }
    Err(KernelError::InvalidArgument)
}

/// No-op syscall used to smoke-test the gateway.
fn sys_test(frame: &mut InterruptFrame) {
    log::debug!("syscall: test invoked");
    frame.eax = S_OK;
}

/// Terminate the calling process.
fn sys_exit(frame: &mut InterruptFrame) {
    #[cfg(target_arch = "x86")]
    {
        let _ = frame;
        crate::sched::scheduler::exit_current_process();
    }
    #[cfg(not(target_arch = "x86"))]
    {
        frame.eax = S_OK;
    }
}

/// Open a stream. `ebx` = path pointer, `edx` = mode bits. Returns a
/// handle in `eax`, or 0 on failure.
fn sys_fopen(frame: &mut InterruptFrame) {
    #[cfg(target_arch = "x86")]
    {
        let result = (|| -> KernelResult<u32> {
            let path = copy_user_cstr(frame.ebx)?;
            let mode =
                fs::OpenMode::from_bits(frame.edx).ok_or(KernelError::InvalidArgument)?;
            let stream = fs::vfs().open(&path, mode)?;
            Ok(OPEN_STREAMS.lock().insert(stream))
        })();
        frame.eax = result.unwrap_or(0);
    }
    #[cfg(not(target_arch = "x86"))]
    {
        frame.eax = 0;
    }
}

/// Close a stream handle in `ebx`.
fn sys_fclose(frame: &mut InterruptFrame) {
    let result = (|| -> KernelResult<u32> {
        let stream = OPEN_STREAMS.lock().remove(frame.ebx)?;
        fs::vfs().close(&stream)?;
        Ok(S_OK)
    })();
    frame.eax = result.unwrap_or_else(KernelError::code);
}

/// Write bytes. `ebx` = handle (1 = console), `ecx` = buffer, `edx` =
/// length. Returns bytes written.
fn sys_fwrite(frame: &mut InterruptFrame) {
    #[cfg(target_arch = "x86")]
    {
        let result = (|| -> KernelResult<u32> {
            if frame.ecx == 0 || frame.ecx as usize >= crate::mm::KERNEL_OFFSET {
                return Err(KernelError::InvalidArgument);
            }
            // SAFETY: user buffer below the kernel base; unmapped bytes
            // fault fatally, as everywhere else in this kernel.
            let buf = unsafe {
                core::slice::from_raw_parts(frame.ecx as *const u8, frame.edx as usize)
            };

            if frame.ebx == 1 {
                // Console output.
                if let Ok(text) = core::str::from_utf8(buf) {
                    crate::arch::x86::vga::print_str(text);
                }
                return Ok(buf.len() as u32);
            }

            let stream = OPEN_STREAMS.lock().get(frame.ebx)?;
            Ok(stream.write(buf)? as u32)
        })();
        frame.eax = result.unwrap_or_else(KernelError::code);
    }
    #[cfg(not(target_arch = "x86"))]
    {
        frame.eax = KernelError::NotImplemented.code();
    }
}

/// Mutex service. `ebx` = subcommand, `edx` = handle (except create).
fn sys_mutex(frame: &mut InterruptFrame) {
    let result = (|| -> KernelResult<u32> {
        match frame.ebx {
            MUTEX_CREATE => Ok(MUTEXES.lock().insert(Arc::new(RecursiveMutex::new()))),
            MUTEX_LOCK => {
                let mutex = MUTEXES.lock().get(frame.edx)?;
                mutex.lock();
                Ok(S_OK)
            }
            MUTEX_UNLOCK => {
                let mutex = MUTEXES.lock().get(frame.edx)?;
                mutex.unlock();
                Ok(S_OK)
            }
            MUTEX_DESTROY => {
                let mutex = MUTEXES.lock().remove(frame.edx)?;
                mutex.destroy();
                Ok(S_OK)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    })();
    frame.eax = result.unwrap_or_else(KernelError::code);
}
