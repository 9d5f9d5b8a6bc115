//! Ochre kernel library.
//!
//! The core of a small 32-bit x86 operating system: physical and
//! virtual memory management, a preemptive round-robin scheduler,
//! interrupt-safe synchronization primitives, a virtual file system
//! with device and filesystem mounting, named pipes, interrupt and
//! syscall dispatch, and an ELF32 loader.
//!
//! The crate builds for the bare-metal `x86` target (the product) and
//! for the host, where the architecture-independent subsystems run
//! under the standard test harness.

#![no_std]

extern crate alloc;

// Host target: link std so unit tests can use the standard harness and
// allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;

// On bare metal the kernel heap is the global allocator.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::GlobalHeapAlloc = mm::heap::GlobalHeapAlloc;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod arch;
pub mod elf;
pub mod error;
pub mod fs;
pub mod irq;
pub mod klog;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod timer;

pub use error::{KernelError, KernelResult};

/// Kernel name, shown in the boot banner.
pub const KERNEL_NAME: &str = "OCHRE";

/// Kernel version.
pub const KERNEL_VERSION: (u16, u16) = (0, 2);
