//! Device descriptors.
//!
//! A driver publishes itself on the VFS as a [`Device`]: a typed
//! descriptor plus an operations object. Character devices are pure byte
//! streams; block devices are seekable and report a size. The
//! `initialize`/`finalize` hooks run at mount/unmount time and
//! `open`/`close` at stream granularity.

use alloc::{string::String, sync::Arc};

use crate::error::{KernelError, KernelResult};

/// Transfer discipline of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Char,
    Block,
}

/// Coarse classification, used by device enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Unknown,
    Audio,
    Graphics,
    Storage,
    Pointing,
}

/// Operations a device driver implements.
///
/// `pos` is the stream position for block devices; character devices
/// may ignore it.
pub trait DeviceOps: Send + Sync {
    /// Called once when the device is mounted.
    fn initialize(&self) -> KernelResult<()> {
        Ok(())
    }

    /// Called once when the device is unmounted.
    fn finalize(&self) -> KernelResult<()> {
        Ok(())
    }

    /// Called for every stream opened on the device.
    fn open(&self) -> KernelResult<()> {
        Ok(())
    }

    /// Called for every stream closed on the device.
    fn close(&self) -> KernelResult<()> {
        Ok(())
    }

    fn read(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize>;

    fn write(&self, pos: u64, buf: &[u8]) -> KernelResult<usize>;

    fn ioctl(&self, _code: u32, _arg: usize) -> KernelResult<usize> {
        Err(KernelError::NotImplemented)
    }

    /// Total size in bytes; meaningful for block devices only.
    fn size(&self) -> u64 {
        0
    }
}

/// A device descriptor, mountable on the VFS.
pub struct Device {
    /// Conventional mount location, e.g. `/dev/fd0`.
    pub default_url: String,
    pub device_type: DeviceType,
    pub class: DeviceClass,
    pub ops: Arc<dyn DeviceOps>,
}

impl Device {
    pub fn new(
        default_url: &str,
        device_type: DeviceType,
        class: DeviceClass,
        ops: Arc<dyn DeviceOps>,
    ) -> Self {
        Self {
            default_url: String::from(default_url),
            device_type,
            class,
            ops,
        }
    }
}
