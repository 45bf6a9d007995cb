//! Mounted filesystems and the driver contract.
//!
//! A filesystem driver implements [`FilesystemOps`] for whole-filesystem
//! operations and [`InodeOps`] for everything rooted at an inode. The VFS
//! guarantees locking: `read_inode`/`write_inode`/`discard_inode` run with
//! the inode mutex held (the ops receive the guarded data directly).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;

use crate::drivers::Device;
use crate::errno::{ErrorCode, Result};
use crate::fs::dcache::DentryRef;
use crate::fs::file::File;
use crate::fs::icache::{Inode, InodeData, InodeRef};
use crate::fs::Vfs;
use crate::sync::Spinlock;

/// What kind of object an inode describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Device,
}

/// Stat block carried by every inode.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub inum: u64,
    pub file_type: FileType,
    pub size: u64,
    pub nlink: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
}

impl Default for Stat {
    fn default() -> Self {
        Stat {
            inum: 0,
            file_type: FileType::Regular,
            size: 0,
            nlink: 1,
            mode: 0o644,
            uid: 0,
            gid: 0,
        }
    }
}

/// Whole-filesystem operations.
pub trait FilesystemOps: Send + Sync {
    /// Mount: produce the root inode. `fs.device`/`fs.mountpoint` are
    /// filled out before the call.
    fn mount(&self, vfs: &Arc<Vfs>, fs: &Arc<MountedFs>) -> Result<InodeRef>;

    /// Initialize the private blob of a freshly allocated inode. Only the
    /// inode number is valid at this point.
    fn prepare_inode(&self, _inode: &Inode) -> Result<()> {
        Ok(())
    }

    /// Fill a locked, pre-allocated inode from backing store.
    fn read_inode(&self, inode: &Inode, data: &mut InodeData) -> Result<()>;

    /// Write a locked, dirty inode back.
    fn write_inode(&self, _inode: &Inode, _data: &mut InodeData) -> Result<()> {
        Ok(())
    }

    /// Tear down the private blob of an inode leaving the cache.
    fn discard_inode(&self, _inode: &Inode, _data: &mut InodeData) {}
}

/// Per-inode operations.
pub trait InodeOps: Send + Sync {
    /// Emit directory entries in the VFS_DIRENT wire format, advancing the
    /// file offset. Returns the number of bytes produced.
    fn readdir(&self, file: &mut File, buf: &mut [u8]) -> Result<usize>;

    /// Resolve `name` inside `parent` to an inode.
    fn lookup(&self, vfs: &Arc<Vfs>, parent: &InodeRef, name: &str) -> Result<InodeRef>;

    /// Map a file block number to a device block number.
    fn block_map(&self, _inode: &InodeRef, _block: u64, _create: bool) -> Result<u64> {
        Err(ErrorCode::Unsupported)
    }

    /// Read file bytes at the file's offset, advancing it.
    fn read(&self, file: &mut File, buf: &mut [u8]) -> Result<usize>;

    /// Write file bytes at the file's offset, advancing it.
    fn write(&self, _file: &mut File, _buf: &[u8]) -> Result<usize> {
        Err(ErrorCode::Unsupported)
    }

    /// Create a new entry; on success the driver fills the dentry's inode
    /// through `Vfs::dcache.set_inode`.
    fn create(
        &self,
        _vfs: &Arc<Vfs>,
        _dir: &InodeRef,
        _dentry: &DentryRef,
        _mode: u16,
    ) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    /// Remove an entry from a directory.
    fn unlink(&self, _dir: &InodeRef, _dentry: &DentryRef) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    /// Rename an entry.
    fn rename(
        &self,
        _old_dir: &InodeRef,
        _old_dentry: &DentryRef,
        _new_dir: &InodeRef,
        _new_dentry: &DentryRef,
    ) -> Result<()> {
        Err(ErrorCode::Unsupported)
    }

    /// Adjust a freshly opened file handle (devices override the backing,
    /// append-style filesystems preset the offset).
    fn fill_file(&self, _inode: &InodeRef, _file: &mut File) {}
}

/// One mounted filesystem.
pub struct MountedFs {
    pub device: Option<Arc<dyn Device>>,
    pub mountpoint: String,
    pub block_size: u32,
    pub privdata: Spinlock<Option<Box<dyn Any + Send>>>,
    pub ops: Arc<dyn FilesystemOps>,
    root: Spinlock<Option<DentryRef>>,
}

impl MountedFs {
    pub fn new(
        device: Option<Arc<dyn Device>>,
        mountpoint: &str,
        ops: Arc<dyn FilesystemOps>,
    ) -> Self {
        MountedFs {
            device,
            mountpoint: String::from(mountpoint),
            block_size: 512,
            privdata: Spinlock::new(None),
            ops,
            root: Spinlock::new(None),
        }
    }

    pub(crate) fn set_root(&self, d: DentryRef) {
        *self.root.lock() = Some(d);
    }

    /// The filesystem's pinned root dentry.
    pub fn root_dentry(&self) -> DentryRef {
        self.root.lock().clone().expect("filesystem has no root")
    }
}
