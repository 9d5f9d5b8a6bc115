//! Architecture support.
//!
//! The kernel proper targets IA-32 protected mode; everything that
//! touches real hardware lives under [`x86`] and is compiled only for
//! `target_arch = "x86"`. The [`hal`] module is the sole doorway the
//! rest of the kernel uses, and it carries an inert host shim so the
//! architecture-independent subsystems build and unit-test on the host.

pub mod hal;

#[cfg(target_arch = "x86")]
pub mod x86;

// GDT selectors. These exact values are load-bearing: the scheduler
// synthesizes stack frames containing them, and the TSS and IDT gates
// reference them.

/// Ring-0 code segment.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// Ring-0 data segment.
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// Ring-3 code segment (RPL 3 included).
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;

/// Ring-3 data segment (RPL 3 included).
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;

/// Task state segment.
pub const TSS_SELECTOR: u16 = 0x28;
