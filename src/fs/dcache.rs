//! Dentry cache.
//!
//! A dentry maps `(parent directory, entry name)` to an inode. The cache
//! keeps as many entries in memory as possible, only recycling one when a
//! new entry is needed and the pool is exhausted. Entries are kept on one
//! LRU list (head = most recent); eviction takes the oldest entry with no
//! references that is not a filesystem root.
//!
//! A looked-up entry whose inode is not yet known ("pending") is invisible
//! to other callers: `lookup` reports it as absent-for-now and the caller
//! retries once the resolver has called `set_inode` or marked the entry
//! negative.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::fs::icache::InodeRef;
use crate::fs::mount::MountedFs;
use crate::sync::Spinlock;

/// Maximum entry-name length, stored inline.
pub const DENTRY_NAME_MAX: usize = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DentryFlags: u32 {
        /// Filesystem root; pinned, never evicted.
        const ROOT = 1 << 0;
        /// Name is known not to exist.
        const NEGATIVE = 1 << 1;
    }
}

pub struct DentryData {
    pub fs: Weak<MountedFs>,
    /// Parent dentry; `None` only for roots and recycled slots. The
    /// pointer outlives the entry's own refcount so a zero-ref entry can
    /// still be matched by `(parent, name)` and revived.
    pub parent: Option<Arc<Dentry>>,
    name: [u8; DENTRY_NAME_MAX],
    name_len: u8,
    pub flags: DentryFlags,
    /// Backing inode; the dentry contributes one inode ref while set.
    pub inode: Option<InodeRef>,
}

impl DentryData {
    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        assert!(bytes.len() <= DENTRY_NAME_MAX, "dentry name too long");
        self.name[..bytes.len()].copy_from_slice(bytes);
        self.name_len = bytes.len() as u8;
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

pub struct Dentry {
    refcount: AtomicU32,
    pub d: Spinlock<DentryData>,
}

impl Dentry {
    fn empty() -> Arc<Dentry> {
        Arc::new(Dentry {
            refcount: AtomicU32::new(0),
            d: Spinlock::new(DentryData {
                fs: Weak::new(),
                parent: None,
                name: [0; DENTRY_NAME_MAX],
                name_len: 0,
                flags: DentryFlags::empty(),
                inode: None,
            }),
        })
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn is_negative(&self) -> bool {
        self.d.lock().flags.contains(DentryFlags::NEGATIVE)
    }

    pub fn is_root(&self) -> bool {
        self.d.lock().flags.contains(DentryFlags::ROOT)
    }

    /// The backing inode, taking a fresh inode ref for the caller.
    pub fn inode(&self) -> Option<InodeRef> {
        self.d.lock().inode.clone()
    }
}

struct DcacheShared {
    capacity: usize,
    /// In-use LRU list, head = most recently used.
    inuse: Spinlock<Vec<Arc<Dentry>>>,
}

/// Counted handle to a cache entry. Clone takes a reference; drop releases
/// it, transitively releasing parent references when the count drains, but
/// the entry itself stays cached for rediscovery.
pub struct DentryRef {
    shared: Arc<DcacheShared>,
    entry: Arc<Dentry>,
}

impl DentryRef {
    pub fn ptr_eq(a: &DentryRef, b: &DentryRef) -> bool {
        Arc::ptr_eq(&a.entry, &b.entry)
    }

    pub fn entry(&self) -> &Arc<Dentry> {
        &self.entry
    }
}

impl core::ops::Deref for DentryRef {
    type Target = Dentry;

    fn deref(&self) -> &Dentry {
        &self.entry
    }
}

impl Clone for DentryRef {
    fn clone(&self) -> Self {
        let old = self.entry.refcount.fetch_add(1, Ordering::SeqCst);
        assert!(old > 0, "cloning a dead dentry handle");
        DentryRef {
            shared: self.shared.clone(),
            entry: self.entry.clone(),
        }
    }
}

impl Drop for DentryRef {
    fn drop(&mut self) {
        // Serialize with eviction; the release may touch parents.
        let _guard = self.shared.inuse.lock();
        release_locked(&self.entry);
    }
}

/// Drop one reference from `entry`; on reaching zero, release the parent
/// chain the same way. The entry keeps its slot, its inode and its parent
/// pointer so the name can be rediscovered without filesystem traffic;
/// only eviction reclaims it.
fn release_locked(entry: &Arc<Dentry>) {
    let mut cur = entry.clone();
    loop {
        let old = cur.refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "dentry refcount underflow");
        if old > 1 {
            return;
        }
        // The parent's counted ref goes away, the pointer stays for
        // identity matching; a revival re-takes the chain.
        let parent = cur.d.lock().parent.clone();
        match parent {
            Some(p) => cur = p,
            None => return,
        }
    }
}

/// Take one reference on `entry`; reviving a zero-ref entry re-takes the
/// parent chain released when it drained. Mirror image of
/// [`release_locked`].
fn grab_locked(entry: &Arc<Dentry>) {
    let mut cur = entry.clone();
    loop {
        let old = cur.refcount.fetch_add(1, Ordering::SeqCst);
        if old > 0 {
            return;
        }
        let parent = cur.d.lock().parent.clone();
        match parent {
            Some(p) => cur = p,
            None => return,
        }
    }
}

pub struct DentryCache {
    shared: Arc<DcacheShared>,
}

impl DentryCache {
    pub fn new(capacity: usize) -> Self {
        DentryCache {
            shared: Arc::new(DcacheShared {
                capacity,
                inuse: Spinlock::new(Vec::new()),
            }),
        }
    }

    fn make_ref(&self, entry: Arc<Dentry>) -> DentryRef {
        DentryRef {
            shared: self.shared.clone(),
            entry,
        }
    }

    /// Obtain a slot: pool space if any is left, otherwise recycle the
    /// oldest unreferenced non-root entry. Panics when every entry is
    /// pinned (the cache is too small to make progress).
    fn find_entry_to_use(&self, inuse: &mut Vec<Arc<Dentry>>) -> Arc<Dentry> {
        if inuse.len() < self.shared.capacity {
            return Dentry::empty();
        }
        for pos in (0..inuse.len()).rev() {
            let cand = &inuse[pos];
            if cand.refcount() != 0 {
                continue;
            }
            let mut data = cand.d.lock();
            if data.flags.contains(DentryFlags::ROOT) {
                continue;
            }
            // Release the backing inode; we are about to overwrite the
            // entry. The parent ref was already dropped when the refcount
            // reached zero.
            data.inode = None;
            data.parent = None;
            data.flags = DentryFlags::empty();
            data.name_len = 0;
            drop(data);
            return inuse.remove(pos);
        }
        panic!("dcache full: no evictable dentry");
    }

    /// Create the pinned root dentry for a filesystem. The returned ref
    /// (refcount 1) belongs to the filesystem itself.
    pub fn create_root(&self, fs: &Arc<MountedFs>) -> DentryRef {
        let mut inuse = self.shared.inuse.lock();
        let entry = self.find_entry_to_use(&mut inuse);
        {
            let mut data = entry.d.lock();
            data.fs = Arc::downgrade(fs);
            data.parent = None;
            data.inode = None; // supplied by the filesystem
            data.flags = DentryFlags::ROOT;
            data.set_name("/");
        }
        entry.refcount.store(1, Ordering::SeqCst);
        inuse.insert(0, entry.clone());
        drop(inuse);
        self.make_ref(entry)
    }

    /// Look up `(parent, name)`.
    ///
    /// Hit on a resolved or negative entry: referenced handle, moved to the
    /// LRU head. Hit on a pending entry: `None`; the caller retries after
    /// the resolver finishes. Miss: a fresh pending entry (refcount 1,
    /// holding a new ref on `parent`); the caller is the resolver and must
    /// call [`set_inode`](DentryCache::set_inode) or mark it negative.
    pub fn lookup(&self, parent: &DentryRef, name: &str) -> Option<DentryRef> {
        let mut inuse = self.shared.inuse.lock();

        // Linear scan; recent entries sit near the head.
        for pos in 0..inuse.len() {
            let cand = inuse[pos].clone();
            let data = cand.d.lock();
            let same_parent = data
                .parent
                .as_ref()
                .map(|p| Arc::ptr_eq(p, parent.entry()))
                .unwrap_or(false);
            if !same_parent || data.name() != name {
                continue;
            }
            if data.inode.is_none() && !data.flags.contains(DentryFlags::NEGATIVE) {
                // Still being resolved by someone else.
                return None;
            }
            drop(data);
            // A zero-ref entry is being revived: re-take the parent refs
            // it released when it drained.
            grab_locked(&cand);
            inuse.remove(pos);
            inuse.insert(0, cand.clone());
            drop(inuse);
            return Some(self.make_ref(cand));
        }

        // Miss: take a slot and hand the caller a pending entry.
        let entry = self.find_entry_to_use(&mut inuse);
        let old = parent.entry().refcount.fetch_add(1, Ordering::SeqCst);
        assert!(old > 0, "lookup under an unreferenced parent");
        {
            let mut data = entry.d.lock();
            data.fs = parent.d.lock().fs.clone();
            data.parent = Some(parent.entry().clone());
            data.inode = None;
            data.flags = DentryFlags::empty();
            data.set_name(name);
        }
        entry.refcount.store(1, Ordering::SeqCst);
        inuse.insert(0, entry.clone());
        drop(inuse);
        Some(self.make_ref(entry))
    }

    /// Attach the backing inode, replacing any previous one and clearing
    /// the negative flag. Consumes the given inode ref; the cache holds it
    /// from now on.
    pub fn set_inode(&self, d: &DentryRef, inode: InodeRef) {
        let mut data = d.entry().d.lock();
        data.inode = Some(inode);
        data.flags.remove(DentryFlags::NEGATIVE);
    }

    /// Record that the name no longer resolves: mark negative and release
    /// the backing inode.
    pub fn unlink(&self, d: &DentryRef) {
        let _guard = self.shared.inuse.lock();
        let mut data = d.entry().d.lock();
        data.flags.insert(DentryFlags::NEGATIVE);
        data.inode = None;
    }

    /// Drop every unreferenced, non-root entry (memory pressure path).
    /// Their inode refs are released; pinned entries stay.
    pub fn purge_old_entries(&self) {
        let mut inuse = self.shared.inuse.lock();
        inuse.retain(|entry| {
            if entry.refcount() > 0 {
                return true;
            }
            let mut data = entry.d.lock();
            if data.flags.contains(DentryFlags::ROOT) {
                return true;
            }
            data.inode = None;
            data.parent = None;
            false
        });
    }

    /// Position of an entry in the LRU list (0 = most recent); test aid.
    pub fn lru_position(&self, d: &DentryRef) -> Option<usize> {
        self.shared
            .inuse
            .lock()
            .iter()
            .position(|e| Arc::ptr_eq(e, d.entry()))
    }

    pub fn len(&self) -> usize {
        self.shared.inuse.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
