//! VFS core: mounted filesystem table, inode cache, dentry cache and the
//! open-file abstraction.

pub mod dcache;
pub mod file;
pub mod icache;
pub mod mount;
pub mod vfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Once;

use crate::drivers::Device;
use crate::errno::{ErrorCode, Result};
use crate::sync::Spinlock;

use dcache::DentryCache;
use icache::{InodeCache, InodeRef};
use mount::{FilesystemOps, MountedFs};

/// Default dentry cache capacity.
pub const DCACHE_ITEMS: usize = 64;
/// Default inode cache capacity.
pub const ICACHE_ITEMS: usize = 64;

/// The process-wide VFS context: both caches plus the mount and
/// filesystem-driver tables.
pub struct Vfs {
    pub dcache: DentryCache,
    pub icache: InodeCache,
    mounts: Spinlock<Vec<Arc<MountedFs>>>,
    filesystems: Spinlock<Vec<(String, Arc<dyn FilesystemOps>)>>,
}

impl Vfs {
    pub fn new(dcache_items: usize, icache_items: usize) -> Arc<Self> {
        Arc::new(Vfs {
            dcache: DentryCache::new(dcache_items),
            icache: InodeCache::new(icache_items),
            mounts: Spinlock::new(Vec::new()),
            filesystems: Spinlock::new(Vec::new()),
        })
    }

    /// Make a filesystem driver available for mounting under `name`.
    pub fn register_filesystem(&self, name: &str, ops: Arc<dyn FilesystemOps>) {
        self.filesystems
            .lock()
            .push((String::from(name), ops));
    }

    /// Mount `fstype` at `mountpoint`. The driver's `mount` supplies the
    /// root inode; the root dentry pins itself with the filesystem's ref.
    pub fn mount(
        self: &Arc<Self>,
        fstype: &str,
        device: Option<Arc<dyn Device>>,
        mountpoint: &str,
    ) -> Result<Arc<MountedFs>> {
        let ops = self
            .filesystems
            .lock()
            .iter()
            .find(|(n, _)| n == fstype)
            .map(|(_, ops)| ops.clone())
            .ok_or(ErrorCode::NotFound)?;

        let fs = Arc::new(MountedFs::new(device, mountpoint, ops.clone()));
        let root_dentry = self.dcache.create_root(&fs);
        let root_inode = ops.mount(self, &fs)?;
        self.dcache.set_inode(&root_dentry, root_inode);
        fs.set_root(root_dentry);

        self.mounts.lock().push(fs.clone());
        log::info!("mounted {} at '{}'", fstype, mountpoint);
        Ok(fs)
    }

    /// The filesystem mounted at "/" (the first mount).
    pub fn root_fs(&self) -> Option<Arc<MountedFs>> {
        self.mounts.lock().first().cloned()
    }

    /// Fetch an inode through the cache, reading it from the filesystem on
    /// a miss.
    pub fn get_inode(&self, fs: &Arc<MountedFs>, inum: u64) -> Result<InodeRef> {
        self.icache.get(fs, inum)
    }
}

static VFS: Once<Arc<Vfs>> = Once::new();

/// Create the boot VFS context with the default cache sizes.
pub fn init() {
    VFS.call_once(|| Vfs::new(DCACHE_ITEMS, ICACHE_ITEMS));
}

/// The boot VFS context. Panics before [`init`].
pub fn instance() -> &'static Arc<Vfs> {
    VFS.get().expect("vfs not initialized")
}
