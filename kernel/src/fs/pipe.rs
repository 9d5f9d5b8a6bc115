//! Named byte pipes.
//!
//! A pipe is a fixed-capacity ring buffer published as a character
//! device under `/ipc/<name>`. Transfers are all-or-nothing: a read
//! larger than the buffered byte count fails with `BufferUnderflow`, a
//! write larger than the free space with `BufferOverflow`. The pipe
//! counts its open handles and can delete itself on the last close.

use alloc::{format, string::String, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    fs::{self, Device, DeviceClass, DeviceOps, DeviceType},
};

bitflags! {
    /// Pipe behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeFlags: u32 {
        /// Remove the VFS node when the last handle closes.
        const DELETE_ON_CLOSE = 0x1;
    }
}

/// `ioctl` code: number of buffered bytes.
pub const IOCTL_PIPE_AVAILABLE: u32 = 0x1;

/// `ioctl` code: free space in bytes.
pub const IOCTL_PIPE_FREE: u32 = 0x2;

/// Byte ring buffer with one reserved slot, so a full buffer never
/// looks empty.
pub struct RingBuffer {
    buffer: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl RingBuffer {
    /// A ring holding up to `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity + 1],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Buffered byte count.
    pub fn available(&self) -> usize {
        if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.buffer.len() - (self.read_pos - self.write_pos)
        }
    }

    /// Free space in bytes.
    pub fn free(&self) -> usize {
        self.buffer.len() - 1 - self.available()
    }

    /// Append `data`, failing without a partial write when it does not
    /// fit.
    pub fn write(&mut self, data: &[u8]) -> KernelResult<()> {
        if data.len() > self.free() {
            return Err(KernelError::BufferOverflow);
        }

        let tail_room = self.buffer.len() - self.write_pos;
        if data.len() > tail_room {
            // Wraps: copy in two pieces.
            self.buffer[self.write_pos..].copy_from_slice(&data[..tail_room]);
            self.buffer[..data.len() - tail_room].copy_from_slice(&data[tail_room..]);
            self.write_pos = data.len() - tail_room;
        } else {
            self.buffer[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
            self.write_pos = (self.write_pos + data.len()) % self.buffer.len();
        }
        Ok(())
    }

    /// Remove exactly `out.len()` bytes, failing without a partial read
    /// when fewer are buffered.
    pub fn read(&mut self, out: &mut [u8]) -> KernelResult<()> {
        if out.len() > self.available() {
            return Err(KernelError::BufferUnderflow);
        }

        let tail = self.buffer.len() - self.read_pos;
        if out.len() > tail {
            let remainder = out.len() - tail;
            out[..tail].copy_from_slice(&self.buffer[self.read_pos..]);
            out[tail..].copy_from_slice(&self.buffer[..remainder]);
            self.read_pos = out.len() - tail;
        } else {
            out.copy_from_slice(&self.buffer[self.read_pos..self.read_pos + out.len()]);
            self.read_pos = (self.read_pos + out.len()) % self.buffer.len();
        }
        Ok(())
    }
}

/// Device backing one named pipe.
struct PipeDevice {
    node_path: String,
    ring: Mutex<RingBuffer>,
    handles: AtomicU32,
    flags: PipeFlags,
}

impl DeviceOps for PipeDevice {
    fn open(&self) -> KernelResult<()> {
        self.handles.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close(&self) -> KernelResult<()> {
        let remaining = self.handles.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.flags.contains(PipeFlags::DELETE_ON_CLOSE) {
            fs::vfs().remove(&self.node_path)?;
        }
        Ok(())
    }

    fn read(&self, _pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.ring.lock().read(buf)?;
        Ok(buf.len())
    }

    fn write(&self, _pos: u64, buf: &[u8]) -> KernelResult<usize> {
        self.ring.lock().write(buf)?;
        Ok(buf.len())
    }

    fn ioctl(&self, code: u32, _arg: usize) -> KernelResult<usize> {
        match code {
            IOCTL_PIPE_AVAILABLE => Ok(self.ring.lock().available()),
            IOCTL_PIPE_FREE => Ok(self.ring.lock().free()),
            _ => Err(KernelError::NotImplemented),
        }
    }
}

/// Create a named pipe of `capacity` bytes at `/ipc/<name>`.
pub fn create(name: &str, flags: PipeFlags, capacity: usize) -> KernelResult<()> {
    if name.is_empty() || name.contains(fs::path::PATH_DELIMITER) || capacity == 0 {
        return Err(KernelError::InvalidArgument);
    }

    let node_path = format!("/ipc/{}", name);
    let ops = Arc::new(PipeDevice {
        node_path: node_path.clone(),
        ring: Mutex::new(RingBuffer::with_capacity(capacity)),
        handles: AtomicU32::new(0),
        flags,
    });

    let dev = Device::new(&node_path, DeviceType::Char, DeviceClass::Unknown, ops);
    fs::vfs().mount_device(dev, &node_path)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;

    use super::*;
    use crate::fs::{vfs, OpenMode};

    fn ensure_ipc_dir() {
        let _ = vfs().mkdir("/ipc", fs::perm::ALL);
    }

    #[test]
    fn ring_is_fifo_across_wraparound() {
        let mut ring = RingBuffer::with_capacity(8);
        for round in 0u8..10 {
            let data = [round, round + 100, round + 200];
            ring.write(&data).unwrap();
            let mut out = [0u8; 3];
            ring.read(&mut out).unwrap();
            assert_eq!(out, data);
        }
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn ring_rejects_overflow_and_underflow_without_partial_io() {
        let mut ring = RingBuffer::with_capacity(4);
        assert_eq!(ring.write(b"12345"), Err(KernelError::BufferOverflow));
        assert_eq!(ring.available(), 0);

        ring.write(b"1234").unwrap();
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.write(b"5"), Err(KernelError::BufferOverflow));

        let mut out = [0u8; 5];
        assert_eq!(ring.read(&mut out), Err(KernelError::BufferUnderflow));
        let mut ok = [0u8; 4];
        ring.read(&mut ok).unwrap();
        assert_eq!(&ok, b"1234");
    }

    #[test]
    fn pipe_hand_off_through_the_vfs() {
        ensure_ipc_dir();
        create("handoff", PipeFlags::empty(), 64).unwrap();

        let writer = vfs().open("/ipc/handoff", OpenMode::WRITE).unwrap();
        let reader = vfs().open("/ipc/handoff", OpenMode::READ).unwrap();

        assert_eq!(writer.write(b"hello").unwrap(), 5);
        assert_eq!(reader.ioctl(IOCTL_PIPE_AVAILABLE, 0).unwrap(), 5);

        let mut out = [0u8; 5];
        assert_eq!(reader.read(&mut out).unwrap(), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(reader.ioctl(IOCTL_PIPE_AVAILABLE, 0).unwrap(), 0);

        // Short reads are not a thing on pipes: it is all or nothing.
        let mut more = [0u8; 1];
        assert_eq!(reader.read(&mut more), Err(KernelError::BufferUnderflow));

        vfs().close(&writer).unwrap();
        vfs().close(&reader).unwrap();
        vfs().remove("/ipc/handoff").unwrap();
    }

    #[test]
    fn fifo_order_is_preserved_across_many_writes() {
        ensure_ipc_dir();
        create("fifo-order", PipeFlags::empty(), 256).unwrap();
        let stream = vfs().open("/ipc/fifo-order", OpenMode::READ_WRITE).unwrap();

        let mut expected = vec![];
        for chunk in 0u8..20 {
            let data = [chunk; 7];
            stream.write(&data).unwrap();
            expected.extend_from_slice(&data);
        }

        let mut out = vec![0u8; expected.len()];
        stream.read(&mut out).unwrap();
        assert_eq!(out, expected);

        vfs().close(&stream).unwrap();
        vfs().remove("/ipc/fifo-order").unwrap();
    }

    #[test]
    fn delete_on_close_removes_the_node_on_last_close() {
        ensure_ipc_dir();
        create("transient", PipeFlags::DELETE_ON_CLOSE, 16).unwrap();

        let a = vfs().open("/ipc/transient", OpenMode::READ_WRITE).unwrap();
        let b = vfs().open("/ipc/transient", OpenMode::READ).unwrap();

        vfs().close(&a).unwrap();
        assert!(vfs().resolve("/ipc/transient").is_ok());

        vfs().close(&b).unwrap();
        assert_eq!(
            vfs().resolve("/ipc/transient").unwrap_err(),
            KernelError::NotFound
        );
    }

    #[test]
    fn duplicate_pipe_names_are_rejected() {
        ensure_ipc_dir();
        create("dup", PipeFlags::empty(), 16).unwrap();
        assert_eq!(
            create("dup", PipeFlags::empty(), 16),
            Err(KernelError::AlreadyExists)
        );
        vfs().remove("/ipc/dup").unwrap();
    }

    #[test]
    fn invalid_pipe_parameters_are_rejected() {
        ensure_ipc_dir();
        assert_eq!(
            create("", PipeFlags::empty(), 16),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            create("a/b", PipeFlags::empty(), 16),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            create("zero", PipeFlags::empty(), 0),
            Err(KernelError::InvalidArgument)
        );
    }
}
