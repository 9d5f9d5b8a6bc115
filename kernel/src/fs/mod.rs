//! Virtual file system.
//!
//! An in-memory tree rooted at `/`. Nodes carry their children directly;
//! file bytes live in a growable buffer on the node. Devices and mounted
//! filesystems hang off nodes as content: a device node holds its
//! [`Device`] descriptor, a mountpoint holds the filesystem driver and
//! has no VFS children; resolution stops there and hands the path
//! remainder to the driver.
//!
//! Nodes are reference-counted by open streams and cannot be removed
//! while referenced.

pub mod device;
pub mod path;
pub mod pipe;
pub mod stream;

use alloc::{
    format,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use spin::RwLock;

pub use device::{Device, DeviceClass, DeviceOps, DeviceType};
pub use stream::{DirEntryInfo, DirStream, FileStream, OpenMode, SeekOrigin, Stream};

use crate::error::{KernelError, KernelResult};

/// Node kinds in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Pipe,
    Symlink,
    MountPoint,
}

/// Permission bits.
pub mod perm {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const EXEC: u32 = 0x4;
    pub const ALL: u32 = 0xFFFF;
}

/// What a node holds besides its children.
pub enum NodeContent {
    None,
    File(Vec<u8>),
    Device(Arc<Device>),
    Mount(Arc<dyn FilesystemDriver>),
}

/// A node in the VFS tree.
pub struct Node {
    name: String,
    node_type: NodeType,
    permissions: u32,
    parent: RwLock<Weak<Node>>,
    children: RwLock<Vec<Arc<Node>>>,
    content: RwLock<NodeContent>,
    ref_count: AtomicU32,
}

impl Node {
    fn new(name: &str, node_type: NodeType, permissions: u32, content: NodeContent) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            node_type,
            permissions,
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            content: RwLock::new(content),
            ref_count: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    /// Size of the node; file content length, zero otherwise.
    pub fn size(&self) -> u64 {
        match &*self.content.read() {
            NodeContent::File(data) => data.len() as u64,
            _ => 0,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_ref(&self) {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "node reference count underflow");
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.read().upgrade()
    }

    /// Run `f` over the file bytes.
    pub fn with_file<R>(&self, f: impl FnOnce(&Vec<u8>) -> R) -> KernelResult<R> {
        match &*self.content.read() {
            NodeContent::File(data) => Ok(f(data)),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Run `f` over the file bytes, mutably.
    pub fn with_file_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> KernelResult<R> {
        match &mut *self.content.write() {
            NodeContent::File(data) => Ok(f(data)),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// The device descriptor of a device node.
    pub fn device(&self) -> Option<Arc<Device>> {
        match &*self.content.read() {
            NodeContent::Device(dev) => Some(dev.clone()),
            _ => None,
        }
    }

    /// The filesystem driver of a mountpoint node.
    pub fn mount_driver(&self) -> Option<Arc<dyn FilesystemDriver>> {
        match &*self.content.read() {
            NodeContent::Mount(driver) => Some(driver.clone()),
            _ => None,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    fn find_child(&self, name: &str) -> Option<Arc<Node>> {
        self.children.read().iter().find(|c| c.name == name).cloned()
    }

    /// Attach `child`, enforcing name uniqueness within this directory.
    fn add_child(self: &Arc<Self>, child: Arc<Node>) -> KernelResult<()> {
        if self.node_type != NodeType::Directory {
            return Err(KernelError::InvalidArgument);
        }
        let mut children = self.children.write();
        if children.iter().any(|c| c.name == child.name) {
            return Err(KernelError::AlreadyExists);
        }
        *child.parent.write() = Arc::downgrade(self);
        children.push(child);
        Ok(())
    }

    fn remove_child(&self, name: &str) -> KernelResult<Arc<Node>> {
        let mut children = self.children.write();
        let index = children
            .iter()
            .position(|c| c.name == name)
            .ok_or(KernelError::NotFound)?;

        let child = &children[index];
        if child.ref_count() > 0 {
            return Err(KernelError::InvalidState);
        }
        if child.child_count() > 0 {
            return Err(KernelError::InvalidState);
        }
        Ok(children.swap_remove(index))
    }
}

// ---------------------------------------------------------------------------
// Filesystem drivers
// ---------------------------------------------------------------------------

/// Interface a mounted filesystem implements. Paths handed in are
/// relative to the mountpoint, always starting with `/`.
pub trait FilesystemDriver: Send + Sync {
    fn fs_name(&self) -> &str;

    fn create(&self, path: &str, permissions: u32) -> KernelResult<()>;

    fn open(&self, path: &str, mode: OpenMode) -> KernelResult<Arc<dyn Stream>>;

    fn opendir(&self, path: &str) -> KernelResult<DirStream>;

    fn mkdir(&self, path: &str, permissions: u32) -> KernelResult<()>;

    /// Destructor, called at unmount.
    fn finalize(&self) -> KernelResult<()>;
}

/// Filesystem constructor: given a stream on the backing storage device,
/// produce a driver instance.
pub type FsConstructor = fn(Arc<dyn Stream>) -> KernelResult<Arc<dyn FilesystemDriver>>;

/// Outcome of path resolution. `remainder` is set when resolution
/// crossed into a mountpoint: the caller forwards it to the driver.
pub struct Resolved {
    pub node: Arc<Node>,
    pub remainder: Option<String>,
}

impl core::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Resolved")
            .field("node", &self.node.name())
            .field("remainder", &self.remainder)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// The VFS
// ---------------------------------------------------------------------------

/// A VFS instance: one tree.
pub struct Vfs {
    root: Arc<Node>,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            root: Node::new("", NodeType::Directory, perm::ALL, NodeContent::None),
        }
    }

    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    /// Walk `path` from the root. Stops early at a mountpoint, returning
    /// it together with the unconsumed remainder.
    pub fn resolve(&self, raw_path: &str) -> KernelResult<Resolved> {
        let normalized = path::normalize(raw_path)?;
        let mut node = self.root.clone();

        if normalized == "/" {
            return Ok(Resolved {
                node,
                remainder: None,
            });
        }

        let mut components = normalized.split(path::PATH_DELIMITER).skip(1).peekable();
        while let Some(component) = components.next() {
            if node.node_type() == NodeType::MountPoint {
                let mut remainder = String::new();
                remainder.push(path::PATH_DELIMITER);
                remainder.push_str(component);
                for rest in components {
                    remainder.push(path::PATH_DELIMITER);
                    remainder.push_str(rest);
                }
                return Ok(Resolved {
                    node,
                    remainder: Some(remainder),
                });
            }
            if node.node_type() != NodeType::Directory {
                return Err(KernelError::NotFound);
            }
            node = node.find_child(component).ok_or(KernelError::NotFound)?;
        }

        Ok(Resolved {
            node,
            remainder: None,
        })
    }

    /// Open a file or device stream.
    pub fn open(&self, raw_path: &str, mode: OpenMode) -> KernelResult<Arc<dyn Stream>> {
        let resolved = self.resolve(raw_path)?;

        if let Some(remainder) = resolved.remainder {
            let driver = resolved.node.mount_driver().ok_or(KernelError::Unexpected)?;
            return driver.open(&remainder, mode);
        }

        let node = resolved.node;
        match node.node_type() {
            NodeType::File => {
                check_permissions(&node, mode)?;
                node.inc_ref();
                Ok(Arc::new(FileStream::new(node, mode)))
            }
            NodeType::CharDevice | NodeType::BlockDevice | NodeType::Pipe => {
                let dev = node.device().ok_or(KernelError::Unexpected)?;
                dev.ops.open()?;
                node.inc_ref();
                Ok(Arc::new(stream::DeviceStream::new(node, dev, mode)))
            }
            NodeType::MountPoint => {
                let driver = node.mount_driver().ok_or(KernelError::Unexpected)?;
                driver.open("/", mode)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Close a stream opened through this VFS.
    pub fn close(&self, stream: &Arc<dyn Stream>) -> KernelResult<()> {
        stream.close()
    }

    /// Create an empty file.
    pub fn create(&self, raw_path: &str, permissions: u32) -> KernelResult<()> {
        let (parent, name) = self.resolve_parent(raw_path)?;
        match parent {
            ParentDir::Local(dir) => dir.add_child(Node::new(
                &name,
                NodeType::File,
                permissions,
                NodeContent::File(Vec::new()),
            )),
            ParentDir::Mounted { driver, inner_path } => driver.create(&inner_path, permissions),
        }
    }

    /// Create an empty directory.
    pub fn mkdir(&self, raw_path: &str, permissions: u32) -> KernelResult<()> {
        let (parent, name) = self.resolve_parent(raw_path)?;
        match parent {
            ParentDir::Local(dir) => dir.add_child(Node::new(
                &name,
                NodeType::Directory,
                permissions,
                NodeContent::None,
            )),
            ParentDir::Mounted { driver, inner_path } => driver.mkdir(&inner_path, permissions),
        }
    }

    /// Open a directory listing.
    pub fn opendir(&self, raw_path: &str) -> KernelResult<DirStream> {
        let resolved = self.resolve(raw_path)?;

        if let Some(remainder) = resolved.remainder {
            let driver = resolved.node.mount_driver().ok_or(KernelError::Unexpected)?;
            return driver.opendir(&remainder);
        }

        let node = resolved.node;
        match node.node_type() {
            NodeType::Directory => {
                // Snapshot the children; later tree changes do not
                // disturb an open listing.
                let entries = node
                    .children
                    .read()
                    .iter()
                    .map(|child| DirEntryInfo {
                        name: child.name.clone(),
                        node_type: child.node_type(),
                        size: child.size(),
                    })
                    .collect();
                Ok(DirStream::new(path::normalize(raw_path)?, entries))
            }
            NodeType::MountPoint => {
                let driver = node.mount_driver().ok_or(KernelError::Unexpected)?;
                driver.opendir("/")
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Remove an unreferenced, childless node.
    pub fn remove(&self, raw_path: &str) -> KernelResult<()> {
        let normalized = path::normalize(raw_path)?;
        if normalized == "/" {
            return Err(KernelError::InvalidArgument);
        }
        let parent = self.resolve(path::dirname(&normalized))?;
        if parent.remainder.is_some() {
            return Err(KernelError::NotImplemented);
        }
        parent
            .node
            .remove_child(path::basename(&normalized))
            .map(|_| ())
    }

    /// Publish a device at `mount_path`, invoking its `initialize` hook.
    pub fn mount_device(&self, dev: Device, mount_path: &str) -> KernelResult<()> {
        let (parent, name) = self.resolve_parent(mount_path)?;
        let ParentDir::Local(dir) = parent else {
            return Err(KernelError::NotImplemented);
        };

        let node_type = match dev.device_type {
            DeviceType::Char => NodeType::CharDevice,
            DeviceType::Block => NodeType::BlockDevice,
        };
        let dev = Arc::new(dev);
        dev.ops.initialize()?;
        dir.add_child(Node::new(
            &name,
            node_type,
            perm::ALL,
            NodeContent::Device(dev),
        ))
    }

    /// Remove a device node, invoking its `finalize` hook first.
    pub fn unmount_device(&self, mount_path: &str) -> KernelResult<()> {
        let resolved = self.resolve(mount_path)?;
        let dev = resolved.node.device().ok_or(KernelError::InvalidArgument)?;
        if resolved.node.ref_count() > 0 {
            return Err(KernelError::InvalidState);
        }
        dev.ops.finalize()?;
        self.remove(mount_path)
    }

    /// Mount a filesystem: open the storage device, run the constructor,
    /// and plant a mountpoint node.
    pub fn mount_fs(
        &self,
        mount_path: &str,
        constructor: FsConstructor,
        storage_path: &str,
    ) -> KernelResult<()> {
        let storage = self.open(storage_path, OpenMode::READ_WRITE)?;
        let driver = match constructor(storage.clone()) {
            Ok(driver) => driver,
            Err(e) => {
                let _ = storage.close();
                return Err(e);
            }
        };

        let (parent, name) = self.resolve_parent(mount_path)?;
        let ParentDir::Local(dir) = parent else {
            let _ = driver.finalize();
            let _ = storage.close();
            return Err(KernelError::NotImplemented);
        };
        dir.add_child(Node::new(
            &name,
            NodeType::MountPoint,
            perm::ALL,
            NodeContent::Mount(driver),
        ))
    }

    /// Unmount a filesystem, invoking the driver's `finalize`.
    pub fn unmount_fs(&self, mount_path: &str) -> KernelResult<()> {
        let resolved = self.resolve(mount_path)?;
        if resolved.remainder.is_some() {
            return Err(KernelError::InvalidArgument);
        }
        let driver = resolved
            .node
            .mount_driver()
            .ok_or(KernelError::InvalidArgument)?;
        if resolved.node.ref_count() > 0 {
            return Err(KernelError::InvalidState);
        }
        driver.finalize()?;
        self.remove(mount_path)
    }

    /// Resolve the parent directory of `raw_path` plus the final name.
    fn resolve_parent(&self, raw_path: &str) -> KernelResult<(ParentDir, String)> {
        let normalized = path::normalize(raw_path)?;
        if normalized == "/" {
            return Err(KernelError::InvalidArgument);
        }
        let name = path::basename(&normalized).to_string();

        let parent = self.resolve(path::dirname(&normalized))?;
        if let Some(remainder) = parent.remainder {
            let driver = parent.node.mount_driver().ok_or(KernelError::Unexpected)?;
            let inner_path = format!("{}/{}", path::without_trailing_delimiter(&remainder), name);
            return Ok((ParentDir::Mounted { driver, inner_path }, name));
        }
        if parent.node.node_type() == NodeType::MountPoint {
            let driver = parent.node.mount_driver().ok_or(KernelError::Unexpected)?;
            let inner_path = format!("/{}", name);
            return Ok((ParentDir::Mounted { driver, inner_path }, name));
        }
        if parent.node.node_type() != NodeType::Directory {
            return Err(KernelError::InvalidArgument);
        }
        Ok((ParentDir::Local(parent.node), name))
    }
}

enum ParentDir {
    Local(Arc<Node>),
    Mounted {
        driver: Arc<dyn FilesystemDriver>,
        inner_path: String,
    },
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

fn check_permissions(node: &Node, mode: OpenMode) -> KernelResult<()> {
    if mode.contains(OpenMode::READ) && node.permissions() & perm::READ == 0 {
        return Err(KernelError::AccessDenied);
    }
    if mode.contains(OpenMode::WRITE) && node.permissions() & perm::WRITE == 0 {
        return Err(KernelError::AccessDenied);
    }
    Ok(())
}

lazy_static! {
    static ref VFS: Vfs = Vfs::new();
}

/// The system VFS.
pub fn vfs() -> &'static Vfs {
    &VFS
}

/// Build the standard namespace: `/dev` and `/ipc`.
pub fn init() -> KernelResult<()> {
    vfs().mkdir("/dev", perm::ALL)?;
    vfs().mkdir("/ipc", perm::ALL)?;
    log::info!("vfs: namespace initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;

    use super::*;

    fn vfs_with_tree() -> Vfs {
        let fs = Vfs::new();
        fs.mkdir("/dev", perm::ALL).unwrap();
        fs.mkdir("/ipc", perm::ALL).unwrap();
        fs.mkdir("/data", perm::ALL).unwrap();
        fs
    }

    #[test]
    fn create_and_resolve_files() {
        let fs = vfs_with_tree();
        fs.create("/data/readme.txt", perm::ALL).unwrap();

        let resolved = fs.resolve("/data/readme.txt").unwrap();
        assert_eq!(resolved.node.name(), "readme.txt");
        assert_eq!(resolved.node.node_type(), NodeType::File);
        assert!(resolved.remainder.is_none());

        assert_eq!(
            fs.resolve("/data/missing").unwrap_err(),
            KernelError::NotFound
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fs = vfs_with_tree();
        fs.create("/data/a", perm::ALL).unwrap();
        assert_eq!(
            fs.create("/data/a", perm::ALL),
            Err(KernelError::AlreadyExists)
        );
        assert_eq!(fs.mkdir("/data", perm::ALL), Err(KernelError::AlreadyExists));
    }

    #[test]
    fn file_write_read_roundtrip() {
        let fs = vfs_with_tree();
        fs.create("/data/f", perm::ALL).unwrap();

        let stream = fs.open("/data/f", OpenMode::READ_WRITE).unwrap();
        let payload = b"the quick brown fox";
        assert_eq!(stream.write(payload).unwrap(), payload.len());

        stream.seek(0, SeekOrigin::Begin).unwrap();
        let mut back = vec![0u8; payload.len()];
        stream.read_exact(&mut back).unwrap();
        assert_eq!(&back, payload);

        // Reading past the end reports end of stream, not failure-as-zero.
        let mut extra = [0u8; 4];
        assert_eq!(stream.read(&mut extra), Err(KernelError::EndOfStream));
        fs.close(&stream).unwrap();
    }

    #[test]
    fn seek_end_matches_file_size() {
        let fs = vfs_with_tree();
        fs.create("/data/f", perm::ALL).unwrap();
        let stream = fs.open("/data/f", OpenMode::READ_WRITE).unwrap();
        stream.write(&[7u8; 123]).unwrap();

        let end = stream.seek(0, SeekOrigin::End).unwrap();
        assert_eq!(end, 123);
        assert_eq!(stream.tell(), 123);
        fs.close(&stream).unwrap();
    }

    #[test]
    fn open_close_balances_refcount() {
        let fs = vfs_with_tree();
        fs.create("/data/f", perm::ALL).unwrap();
        let node = fs.resolve("/data/f").unwrap().node;
        assert_eq!(node.ref_count(), 0);

        let a = fs.open("/data/f", OpenMode::READ).unwrap();
        let b = fs.open("/data/f", OpenMode::READ).unwrap();
        assert_eq!(node.ref_count(), 2);

        fs.close(&a).unwrap();
        fs.close(&b).unwrap();
        assert_eq!(node.ref_count(), 0);
    }

    #[test]
    fn referenced_nodes_cannot_be_removed() {
        let fs = vfs_with_tree();
        fs.create("/data/f", perm::ALL).unwrap();
        let stream = fs.open("/data/f", OpenMode::READ).unwrap();

        assert_eq!(fs.remove("/data/f"), Err(KernelError::InvalidState));
        fs.close(&stream).unwrap();
        fs.remove("/data/f").unwrap();
        assert_eq!(fs.resolve("/data/f").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn write_requires_write_mode() {
        let fs = vfs_with_tree();
        fs.create("/data/f", perm::ALL).unwrap();
        let stream = fs.open("/data/f", OpenMode::READ).unwrap();
        assert_eq!(stream.write(b"x"), Err(KernelError::AccessDenied));
        fs.close(&stream).unwrap();

        fs.create("/data/ro", perm::READ).unwrap();
        assert_eq!(
            fs.open("/data/ro", OpenMode::READ_WRITE).unwrap_err(),
            KernelError::AccessDenied
        );
    }

    #[test]
    fn opendir_snapshots_entries() {
        let fs = vfs_with_tree();
        fs.create("/data/one", perm::ALL).unwrap();
        fs.create("/data/two", perm::ALL).unwrap();

        let dir = fs.opendir("/data").unwrap();
        assert_eq!(dir.len(), 2);

        // Entries added after the snapshot stay invisible to it.
        fs.create("/data/three", perm::ALL).unwrap();
        assert_eq!(dir.len(), 2);

        let mut names: std::vec::Vec<String> = std::vec::Vec::new();
        while let Ok(entry) = dir.readdir() {
            names.push(entry.name);
        }
        names.sort();
        assert_eq!(names, vec!["one", "two"]);

        let fresh = fs.opendir("/data").unwrap();
        assert_eq!(fresh.len(), 3);
    }

    #[test]
    fn root_resolves_to_root() {
        let fs = vfs_with_tree();
        let r = fs.resolve("/").unwrap();
        assert_eq!(r.node.node_type(), NodeType::Directory);
        assert!(Arc::ptr_eq(&r.node, &fs.root()));
        // Empty path is treated as the root as well.
        assert!(Arc::ptr_eq(&fs.resolve("").unwrap().node, &fs.root()));
    }

    // A small in-memory filesystem driver used to exercise mountpoint
    // crossing without dragging in any real storage format.
    struct ToyFs {
        files: spin::Mutex<std::vec::Vec<(String, std::vec::Vec<u8>)>>,
    }

    impl ToyFs {
        fn construct(_storage: Arc<dyn Stream>) -> KernelResult<Arc<dyn FilesystemDriver>> {
            Ok(Arc::new(ToyFs {
                files: spin::Mutex::new(std::vec::Vec::new()),
            }))
        }
    }

    impl FilesystemDriver for ToyFs {
        fn fs_name(&self) -> &str {
            "toyfs"
        }

        fn create(&self, path: &str, _permissions: u32) -> KernelResult<()> {
            let mut files = self.files.lock();
            if files.iter().any(|(p, _)| p == path) {
                return Err(KernelError::AlreadyExists);
            }
            files.push((String::from(path), std::vec::Vec::new()));
            Ok(())
        }

        fn open(&self, path: &str, _mode: OpenMode) -> KernelResult<Arc<dyn Stream>> {
            let files = self.files.lock();
            if files.iter().any(|(p, _)| p == path) {
                Err(KernelError::NotImplemented)
            } else {
                Err(KernelError::NotFound)
            }
        }

        fn opendir(&self, path: &str) -> KernelResult<DirStream> {
            let entries = self
                .files
                .lock()
                .iter()
                .map(|(p, data)| DirEntryInfo {
                    name: String::from(path::basename(p)),
                    node_type: NodeType::File,
                    size: data.len() as u64,
                })
                .collect();
            Ok(DirStream::new(String::from(path), entries))
        }

        fn mkdir(&self, _path: &str, _permissions: u32) -> KernelResult<()> {
            Err(KernelError::NotImplemented)
        }

        fn finalize(&self) -> KernelResult<()> {
            Ok(())
        }
    }

    #[test]
    fn mountpoint_crossing_forwards_remainder() {
        let fs = vfs_with_tree();
        fs.create("/dev/hda", perm::ALL).unwrap();
        fs.mount_fs("/mnt", ToyFs::construct, "/dev/hda").unwrap();

        let resolved = fs.resolve("/mnt/sub/file.txt").unwrap();
        assert_eq!(resolved.node.node_type(), NodeType::MountPoint);
        assert_eq!(resolved.remainder.as_deref(), Some("/sub/file.txt"));

        // create through the mount lands in the driver.
        fs.create("/mnt/hello.txt", perm::ALL).unwrap();
        assert_eq!(
            fs.create("/mnt/hello.txt", perm::ALL),
            Err(KernelError::AlreadyExists)
        );

        let dir = fs.opendir("/mnt").unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.readdir().unwrap().name, "hello.txt");

        // mkdir is not implemented by this driver and must not be
        // absorbed by the VFS layer.
        assert_eq!(
            fs.mkdir("/mnt/dir", perm::ALL),
            Err(KernelError::NotImplemented)
        );

        fs.unmount_fs("/mnt").unwrap();
        assert_eq!(fs.resolve("/mnt").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn mountpoint_has_no_vfs_children() {
        let fs = vfs_with_tree();
        fs.create("/dev/hda", perm::ALL).unwrap();
        fs.mount_fs("/mnt", ToyFs::construct, "/dev/hda").unwrap();

        let node = fs.resolve("/mnt").unwrap().node;
        assert_eq!(node.node_type(), NodeType::MountPoint);
        assert_eq!(node.child_count(), 0);

        fs.create("/mnt/inside", perm::ALL).unwrap();
        assert_eq!(node.child_count(), 0);
    }
}
