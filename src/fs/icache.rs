//! Inode cache.
//!
//! A fixed-capacity LRU of inodes keyed by `(filesystem, inode number)`.
//! Inodes carry their own mutex and refcount; the cache only reclaims an
//! entry once its refcount has drained to zero and the slot is wanted for
//! something else. Dropping the last external reference does *not* evict;
//! the entry stays warm so the same inode can be rediscovered without
//! touching the filesystem.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::any::Any;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::errno::{ErrorCode, Result};
use crate::fs::mount::{InodeOps, MountedFs, Stat};
use crate::memory::vmpage::VmPage;
use crate::sync::Spinlock;
use crate::task::scheduler;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InodeFlags: u32 {
        /// Needs `write_inode` before the slot may be reused.
        const DIRTY = 1 << 0;
        /// Allocated but not yet filled by `read_inode`.
        const PENDING = 1 << 1;
        /// `read_inode` failed; never hand this entry out.
        const GONE = 1 << 2;
    }
}

/// Fields protected by the per-inode mutex.
pub struct InodeData {
    pub sb: Stat,
    pub ops: Option<Arc<dyn InodeOps>>,
    pub privdata: Option<Box<dyn Any + Send>>,
    /// Shared VM pages backed by this inode, keyed by file offset.
    pub pages: Vec<Arc<VmPage>>,
}

pub struct Inode {
    pub inum: u64,
    /// Back reference to the owning filesystem. Weak: the mount owns the
    /// root dentry which owns an inode ref, so a strong pointer here would
    /// cycle.
    pub fs: Weak<MountedFs>,
    refcount: AtomicU32,
    flags: AtomicU32,
    /// The inode mutex: held across filesystem operations touching this
    /// inode and while the fault handler consults `pages`.
    pub i: Spinlock<InodeData>,
}

impl Inode {
    pub fn fs(&self) -> Arc<MountedFs> {
        self.fs.upgrade().expect("inode outlived its filesystem")
    }

    pub fn flags(&self) -> InodeFlags {
        InodeFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn set_flag(&self, f: InodeFlags) {
        self.flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    pub fn clear_flag(&self, f: InodeFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Inode operations vector. Panics on a pending inode; callers only
    /// see filled inodes.
    pub fn ops(&self) -> Arc<dyn InodeOps> {
        self.i
            .lock()
            .ops
            .clone()
            .expect("inode has no operations vector")
    }
}

/// Counted handle to a cached inode. Cloning takes another reference;
/// dropping releases it (the slot itself stays cached).
pub struct InodeRef {
    inode: Arc<Inode>,
}

impl core::fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InodeRef").finish()
    }
}

impl InodeRef {
    /// Take a new reference on an already-referenced inode.
    pub fn grab(inode: &Arc<Inode>) -> Self {
        let old = inode.refcount.fetch_add(1, Ordering::SeqCst);
        debug_assert!(old < u32::MAX);
        InodeRef {
            inode: inode.clone(),
        }
    }

    pub fn ptr_eq(a: &InodeRef, b: &InodeRef) -> bool {
        Arc::ptr_eq(&a.inode, &b.inode)
    }

    pub(crate) fn raw(&self) -> &Arc<Inode> {
        &self.inode
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        InodeRef::grab(&self.inode)
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        let old = self.inode.refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "inode refcount underflow");
    }
}

impl Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inode
    }
}

pub struct InodeCache {
    capacity: usize,
    /// LRU, head = most recent.
    inuse: Spinlock<Vec<Arc<Inode>>>,
}

impl InodeCache {
    pub fn new(capacity: usize) -> Self {
        InodeCache {
            capacity,
            inuse: Spinlock::new(Vec::new()),
        }
    }

    /// Look up `(fs, inum)`, reading the inode in on a miss.
    ///
    /// A hit on an entry that another thread is still filling retries
    /// after yielding, so the caller always receives a filled inode.
    pub fn get(&self, fs: &Arc<MountedFs>, inum: u64) -> Result<InodeRef> {
        let entry = loop {
            let mut list = self.inuse.lock();
            if let Some(pos) = list
                .iter()
                .position(|i| i.inum == inum && i.fs.ptr_eq(&Arc::downgrade(fs)))
            {
                let entry = list[pos].clone();
                if entry.flags().contains(InodeFlags::PENDING) {
                    // Another path is filling it; wait our turn.
                    drop(list);
                    scheduler::yield_now();
                    continue;
                }
                if entry.flags().contains(InodeFlags::GONE) {
                    return Err(ErrorCode::Io);
                }
                list.remove(pos);
                list.insert(0, entry.clone());
                return Ok(InodeRef::grab(&entry));
            }

            // Miss: make room, then insert a pending entry so concurrent
            // lookups wait instead of double-reading.
            let victim = if list.len() >= self.capacity {
                Some(self.evict_locked(&mut list)?)
            } else {
                None
            };
            // Cache residence itself is not a reference; the handle from
            // `fill` takes the first one.
            let entry = Arc::new(Inode {
                inum,
                fs: Arc::downgrade(fs),
                refcount: AtomicU32::new(0),
                flags: AtomicU32::new(InodeFlags::PENDING.bits()),
                i: Spinlock::new(InodeData {
                    sb: Stat::default(),
                    ops: None,
                    privdata: None,
                    pages: Vec::new(),
                }),
            });
            list.insert(0, entry.clone());
            drop(list);
            if let Some(v) = victim {
                self.dispose(&v);
            }
            break entry;
        };

        self.fill(fs, entry)
    }

    /// Pick the oldest zero-ref entry off the tail. Panics when every
    /// entry is referenced: the cache is undersized for the workload and
    /// that is an invariant failure, not a runtime error.
    fn evict_locked(&self, list: &mut Vec<Arc<Inode>>) -> Result<Arc<Inode>> {
        for pos in (0..list.len()).rev() {
            let cand = &list[pos];
            // A pending entry has no refs yet but its reader still owns it.
            if cand.refcount() == 0 && !cand.flags().contains(InodeFlags::PENDING) {
                return Ok(list.remove(pos));
            }
        }
        panic!("icache full: every inode is referenced");
    }

    /// Write back and discard an evicted inode.
    fn dispose(&self, inode: &Arc<Inode>) {
        let fs = match inode.fs.upgrade() {
            Some(fs) => fs,
            None => return,
        };
        let mut data = inode.i.lock();
        if inode.flags().contains(InodeFlags::DIRTY) {
            if let Err(e) = fs.ops.write_inode(inode, &mut data) {
                log::error!("write_inode({}) failed on eviction: {:?}", inode.inum, e);
            }
            inode.clear_flag(InodeFlags::DIRTY);
        }
        fs.ops.discard_inode(inode, &mut data);
        data.pages.clear();
        inode.set_flag(InodeFlags::GONE);
    }

    /// Run `prepare_inode` + `read_inode` on a freshly inserted entry.
    fn fill(&self, fs: &Arc<MountedFs>, entry: Arc<Inode>) -> Result<InodeRef> {
        let res = fs.ops.prepare_inode(&entry).and_then(|_| {
            let mut data = entry.i.lock();
            fs.ops.read_inode(&entry, &mut data)
        });
        match res {
            Ok(()) => {
                entry.clear_flag(InodeFlags::PENDING);
                Ok(InodeRef::grab(&entry))
            }
            Err(e) => {
                // Drop the placeholder so later lookups retry the read.
                entry.set_flag(InodeFlags::GONE);
                entry.clear_flag(InodeFlags::PENDING);
                let mut list = self.inuse.lock();
                list.retain(|i| !Arc::ptr_eq(i, &entry));
                Err(e)
            }
        }
    }

    /// Number of cached entries (test/diagnostic aid).
    pub fn len(&self) -> usize {
        self.inuse.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `(fs, inum)` is present without touching LRU order.
    pub fn contains(&self, fs: &Arc<MountedFs>, inum: u64) -> bool {
        self.inuse
            .lock()
            .iter()
            .any(|i| i.inum == inum && i.fs.ptr_eq(&Arc::downgrade(fs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mount::FileType;
    use crate::fs::Vfs;
    use crate::test_support::ramfs::RamFs;

    fn fixture() -> (Arc<Vfs>, Arc<MountedFs>) {
        let vfs = Vfs::new(8, 4);
        vfs.register_filesystem("ramfs", RamFs::build(&[("a", b"hello"), ("b", b"world")]));
        let fs = vfs.mount("ramfs", None, "/").unwrap();
        (vfs, fs)
    }

    #[test]
    fn hit_returns_same_inode_without_rereading() {
        let (vfs, fs) = fixture();
        let a1 = vfs.get_inode(&fs, 2).unwrap();
        let reads_after_first = RamFs::read_inode_count(&fs);
        let a2 = vfs.get_inode(&fs, 2).unwrap();
        assert!(InodeRef::ptr_eq(&a1, &a2));
        assert_eq!(a2.refcount(), 2);
        assert_eq!(RamFs::read_inode_count(&fs), reads_after_first);
    }

    #[test]
    fn stat_survives_deref_and_relookup() {
        let (vfs, fs) = fixture();
        let stat = {
            let ino = vfs.get_inode(&fs, 2).unwrap();
            let sb = ino.i.lock().sb;
            sb
        };
        assert_eq!(stat.file_type, FileType::Regular);
        assert_eq!(stat.size, 5);
        // All external refs dropped; the slot stays warm and a second
        // lookup returns identical stat fields without a new read.
        let reads = RamFs::read_inode_count(&fs);
        let again = vfs.get_inode(&fs, 2).unwrap();
        let sb = again.i.lock().sb;
        assert_eq!(sb.size, stat.size);
        assert_eq!(sb.inum, stat.inum);
        assert_eq!(RamFs::read_inode_count(&fs), reads);
    }

    #[test]
    fn missing_inode_is_an_error_and_not_cached() {
        let (vfs, fs) = fixture();
        assert_eq!(vfs.get_inode(&fs, 999).unwrap_err(), ErrorCode::NotFound);
        assert!(!vfs.icache.contains(&fs, 999));
    }

    #[test]
    fn eviction_prefers_the_lru_tail() {
        let vfs = Vfs::new(8, 2);
        vfs.register_filesystem(
            "ramfs",
            RamFs::build(&[("a", b"1"), ("b", b"2"), ("c", b"3")]),
        );
        let fs = vfs.mount("ramfs", None, "/").unwrap();
        // Capacity 2, and the root inode (refcount held by the root
        // dentry) occupies one slot. The data inodes fight over the rest.
        drop(vfs.get_inode(&fs, 2).unwrap());
        drop(vfs.get_inode(&fs, 3).unwrap());
        assert!(!vfs.icache.contains(&fs, 2));
        assert!(vfs.icache.contains(&fs, 3));
    }
}
