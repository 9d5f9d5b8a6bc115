//! Streams: open handles to files, devices, and directories.
//!
//! Every opened object is a [`Stream`]: a uniform
//! `read/write/seek/tell/ioctl/close` capability set with an access mode
//! and a position. Directory listings use the separate [`DirStream`],
//! which snapshots its entries at open time.

use alloc::{string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    fs::{device::Device, Node, NodeType},
};

bitflags! {
    /// Stream access mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Seek reference point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Begin,
    Current,
    End,
}

/// An open handle with the uniform stream capability set.
pub trait Stream: Send + Sync + core::fmt::Debug {
    fn mode(&self) -> OpenMode;

    /// Read up to `buf.len()` bytes. `Ok(0)` only for an empty buffer;
    /// reading at end of data is `Err(EndOfStream)`.
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize>;

    /// Write up to `buf.len()` bytes, returning how many were taken.
    fn write(&self, buf: &[u8]) -> KernelResult<usize>;

    /// Move the position; returns the new absolute position.
    fn seek(&self, offset: i64, origin: SeekOrigin) -> KernelResult<u64>;

    /// Current position.
    fn tell(&self) -> u64;

    /// Device-specific control operation.
    fn ioctl(&self, _code: u32, _arg: usize) -> KernelResult<usize> {
        Err(KernelError::NotImplemented)
    }

    /// Release the handle, dropping the node reference it pins.
    fn close(&self) -> KernelResult<()>;

    /// Read exactly `buf.len()` bytes or fail.
    fn read_exact(&self, buf: &mut [u8]) -> KernelResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                return Err(KernelError::EndOfStream);
            }
            done += n;
        }
        Ok(())
    }
}

fn apply_seek(pos: u64, size: u64, offset: i64, origin: SeekOrigin) -> KernelResult<u64> {
    let base = match origin {
        SeekOrigin::Begin => 0i64,
        SeekOrigin::Current => pos as i64,
        SeekOrigin::End => size as i64,
    };
    let target = base.checked_add(offset).ok_or(KernelError::InvalidArgument)?;
    if target < 0 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(target as u64)
}

// ---------------------------------------------------------------------------
// File streams
// ---------------------------------------------------------------------------

/// Stream over the in-memory bytes of a VFS file node.
pub struct FileStream {
    node: Arc<Node>,
    mode: OpenMode,
    pos: Mutex<u64>,
}

impl FileStream {
    pub fn new(node: Arc<Node>, mode: OpenMode) -> Self {
        Self {
            node,
            mode,
            pos: Mutex::new(0),
        }
    }
}

impl core::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileStream")
            .field("mode", &self.mode)
            .finish()
    }
}

impl Stream for FileStream {
    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if !self.mode.contains(OpenMode::READ) {
            return Err(KernelError::AccessDenied);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut pos = self.pos.lock();
        let n = self.node.with_file(|data| {
            let offset = *pos as usize;
            if offset >= data.len() {
                return Err(KernelError::EndOfStream);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        })??;
        *pos += n as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        if !self.mode.contains(OpenMode::WRITE) {
            return Err(KernelError::AccessDenied);
        }

        let mut pos = self.pos.lock();
        let offset = *pos as usize;
        self.node.with_file_mut(|data| {
            if offset + buf.len() > data.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
        })?;
        *pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn seek(&self, offset: i64, origin: SeekOrigin) -> KernelResult<u64> {
        let mut pos = self.pos.lock();
        let new = apply_seek(*pos, self.node.size(), offset, origin)?;
        *pos = new;
        Ok(new)
    }

    fn tell(&self) -> u64 {
        *self.pos.lock()
    }

    fn close(&self) -> KernelResult<()> {
        self.node.dec_ref();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device streams
// ---------------------------------------------------------------------------

/// Stream over a mounted character or block device.
pub struct DeviceStream {
    node: Arc<Node>,
    device: Arc<Device>,
    mode: OpenMode,
    pos: Mutex<u64>,
}

impl DeviceStream {
    pub fn new(node: Arc<Node>, device: Arc<Device>, mode: OpenMode) -> Self {
        Self {
            node,
            device,
            mode,
            pos: Mutex::new(0),
        }
    }

    fn seekable(&self) -> bool {
        self.device.device_type == crate::fs::device::DeviceType::Block
    }
}

impl core::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("mode", &self.mode)
            .finish()
    }
}

impl Stream for DeviceStream {
    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if !self.mode.contains(OpenMode::READ) {
            return Err(KernelError::AccessDenied);
        }
        let mut pos = self.pos.lock();
        let n = self.device.ops.read(*pos, buf)?;
        if self.seekable() {
            *pos += n as u64;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        if !self.mode.contains(OpenMode::WRITE) {
            return Err(KernelError::AccessDenied);
        }
        let mut pos = self.pos.lock();
        let n = self.device.ops.write(*pos, buf)?;
        if self.seekable() {
            *pos += n as u64;
        }
        Ok(n)
    }

    fn seek(&self, offset: i64, origin: SeekOrigin) -> KernelResult<u64> {
        // Character devices have no position to move.
        if !self.seekable() {
            return Err(KernelError::NotImplemented);
        }
        let mut pos = self.pos.lock();
        let new = apply_seek(*pos, self.device.ops.size(), offset, origin)?;
        *pos = new;
        Ok(new)
    }

    fn tell(&self) -> u64 {
        *self.pos.lock()
    }

    fn ioctl(&self, code: u32, arg: usize) -> KernelResult<usize> {
        self.device.ops.ioctl(code, arg)
    }

    fn close(&self) -> KernelResult<()> {
        self.node.dec_ref();
        self.device.ops.close()
    }
}

// ---------------------------------------------------------------------------
// Directory streams
// ---------------------------------------------------------------------------

/// One directory entry as reported by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
}

/// Snapshot directory iterator.
pub struct DirStream {
    dirname: String,
    entries: Vec<DirEntryInfo>,
    pos: AtomicU32,
}

impl DirStream {
    pub fn new(dirname: String, entries: Vec<DirEntryInfo>) -> Self {
        Self {
            dirname,
            entries,
            pos: AtomicU32::new(0),
        }
    }

    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next entry, or `EndOfStream` when the snapshot is exhausted.
    pub fn readdir(&self) -> KernelResult<DirEntryInfo> {
        let index = self.pos.fetch_add(1, Ordering::Relaxed) as usize;
        if index < self.entries.len() {
            Ok(self.entries[index].clone())
        } else {
            Err(KernelError::EndOfStream)
        }
    }

    /// Restart iteration from the first entry.
    pub fn rewinddir(&self) {
        self.pos.store(0, Ordering::Relaxed);
    }

    /// Release the snapshot.
    pub fn closedir(self) {}
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;

    use super::*;

    #[test]
    fn seek_math_covers_all_origins() {
        assert_eq!(apply_seek(10, 100, 0, SeekOrigin::Begin), Ok(0));
        assert_eq!(apply_seek(10, 100, 5, SeekOrigin::Current), Ok(15));
        assert_eq!(apply_seek(10, 100, -5, SeekOrigin::Current), Ok(5));
        assert_eq!(apply_seek(10, 100, 0, SeekOrigin::End), Ok(100));
        assert_eq!(apply_seek(10, 100, -100, SeekOrigin::End), Ok(0));
        assert_eq!(
            apply_seek(10, 100, -11, SeekOrigin::Current),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn dir_stream_iterates_snapshot_in_order() {
        let stream = DirStream::new(
            String::from("/x"),
            vec![
                DirEntryInfo {
                    name: String::from("a"),
                    node_type: NodeType::File,
                    size: 1,
                },
                DirEntryInfo {
                    name: String::from("b"),
                    node_type: NodeType::Directory,
                    size: 0,
                },
            ],
        );

        assert_eq!(stream.readdir().unwrap().name, "a");
        assert_eq!(stream.readdir().unwrap().name, "b");
        assert_eq!(stream.readdir().unwrap_err(), KernelError::EndOfStream);

        stream.rewinddir();
        assert_eq!(stream.readdir().unwrap().name, "a");
        stream.closedir();
    }
}
