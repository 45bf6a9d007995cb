//! VM pages.
//!
//! A VM page binds a virtual address to a physical frame. Shared pages are
//! canonical per `(inode, offset)` and live on the owning inode's page list;
//! areas map them through link pages (aliases onto the same frame). Private
//! pages own their frame outright and are only reachable through their
//! owning area.
//!
//! The per-page lock covers the frame pointer and flags; a shared page's
//! frame contents are only mutated while it is held (the fill path).

use alloc::sync::{Arc, Weak};
use bitflags::bitflags;

use crate::errno::{ErrorCode, Result};
use crate::fs::icache::Inode;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::physical::PhysAllocator;
use crate::sync::{Spinlock, SpinlockGuard};
use crate::PAGE_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmPageFlags: u32 {
        /// Owned by exactly one area; never on an inode list.
        const PRIVATE = 1 << 0;
        /// Canonical page on an inode's backing list, or a link to one.
        const SHARED = 1 << 1;
        /// Mapped without write permission.
        const READONLY = 1 << 2;
        /// Allocated but not yet filled from backing store.
        const PENDING = 1 << 3;
        /// Write access must first instantiate a private copy.
        const COW = 1 << 4;
    }
}

pub struct VmPageData {
    pub flags: VmPageFlags,
    /// Owned physical frame. `None` while pending, and always `None` on a
    /// link page (the canonical page owns the frame).
    pub page: Option<PhysAddr>,
    /// Virtual address this page instance is mapped at within its area.
    pub vaddr: VirtAddr,
    /// Lookup identity of a canonical shared page.
    pub ident: Option<(Weak<Inode>, u64)>,
    /// For link pages: the canonical page whose frame we alias.
    pub source: Option<Arc<VmPage>>,
}

pub struct VmPage {
    phys: Arc<PhysAllocator>,
    pub l: Spinlock<VmPageData>,
}

impl VmPage {
    pub fn lock(&self) -> SpinlockGuard<'_, VmPageData> {
        self.l.lock()
    }

    /// The physical frame backing this page, resolving link pages through
    /// their source. `None` while pending.
    pub fn frame(&self) -> Option<PhysAddr> {
        let data = self.l.lock();
        match (&data.page, &data.source) {
            (Some(p), _) => Some(*p),
            (None, Some(src)) => src.frame(),
            (None, None) => None,
        }
    }

    pub fn flags(&self) -> VmPageFlags {
        self.l.lock().flags
    }

    pub fn is_link(&self) -> bool {
        self.l.lock().source.is_some()
    }
}

impl Drop for VmPage {
    fn drop(&mut self) {
        // Only the frame owner returns it; link pages just drop their
        // Arc on the canonical page.
        if let Some(frame) = self.l.get_mut().page.take() {
            self.phys.free_frame(frame);
        }
    }
}

/// Find the canonical shared page for `(inode, offset)` on the inode's
/// page list. Caller holds the inode mutex.
pub fn lookup_shared(
    pages: &[Arc<VmPage>],
    inode: &Arc<Inode>,
    offset: u64,
) -> Option<Arc<VmPage>> {
    let want = Arc::downgrade(inode);
    pages
        .iter()
        .find(|p| {
            let data = p.l.lock();
            matches!(&data.ident, Some((w, off)) if *off == offset && w.ptr_eq(&want))
        })
        .cloned()
}

/// Create a pending canonical shared page for `(inode, offset)`. The caller
/// inserts it into the inode's page list under the inode mutex and fills it
/// under the page lock.
pub fn create_shared(
    phys: &Arc<PhysAllocator>,
    inode: &Arc<Inode>,
    offset: u64,
    extra: VmPageFlags,
) -> Arc<VmPage> {
    Arc::new(VmPage {
        phys: phys.clone(),
        l: Spinlock::new(VmPageData {
            flags: VmPageFlags::SHARED | VmPageFlags::PENDING | extra,
            page: None,
            vaddr: VirtAddr::new(0),
            ident: Some((Arc::downgrade(inode), offset)),
            source: None,
        }),
    })
}

/// Create a private page with a freshly allocated frame.
pub fn create_private(phys: &Arc<PhysAllocator>, extra: VmPageFlags) -> Result<Arc<VmPage>> {
    let frame = phys.alloc_frame().ok_or(ErrorCode::OutOfMemory)?;
    Ok(Arc::new(VmPage {
        phys: phys.clone(),
        l: Spinlock::new(VmPageData {
            flags: VmPageFlags::PRIVATE | extra,
            page: Some(frame),
            vaddr: VirtAddr::new(0),
            ident: None,
            source: None,
        }),
    }))
}

/// Create a link page aliasing `src`'s frame, the zero-copy shared
/// mapping. Holding the returned page keeps `src` (and its frame) alive.
pub fn link(src: &Arc<VmPage>, extra: VmPageFlags) -> Arc<VmPage> {
    let phys = src.phys.clone();
    Arc::new(VmPage {
        phys,
        l: Spinlock::new(VmPageData {
            flags: VmPageFlags::SHARED | extra,
            page: None,
            vaddr: VirtAddr::new(0),
            ident: None,
            source: Some(src.clone()),
        }),
    })
}

/// Copy the full frame contents of `src` into `dst`.
pub fn copy(phys: &PhysAllocator, src: &Arc<VmPage>, dst: &Arc<VmPage>) -> Result<()> {
    let from = src.frame().ok_or(ErrorCode::BadAddress)?;
    let to = dst.frame().ok_or(ErrorCode::BadAddress)?;
    unsafe {
        core::ptr::copy_nonoverlapping(phys.virt_of(from), phys.virt_of(to), PAGE_SIZE);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arena;

    #[test]
    fn private_page_owns_and_returns_its_frame() {
        let phys = test_arena(4);
        let before = phys.free_frames();
        let p = create_private(&phys, VmPageFlags::empty()).unwrap();
        assert!(p.frame().is_some());
        assert_eq!(phys.free_frames(), before - 1);
        drop(p);
        assert_eq!(phys.free_frames(), before);
    }

    #[test]
    fn link_shares_frame_and_pins_source() {
        let phys = test_arena(4);
        let canon = create_private(&phys, VmPageFlags::SHARED).unwrap();
        let frame = canon.frame().unwrap();
        let alias = link(&canon, VmPageFlags::empty());
        assert_eq!(alias.frame(), Some(frame));
        assert_eq!(Arc::strong_count(&canon), 2);

        let free_before = phys.free_frames();
        drop(canon);
        // Alias still holds the canonical page alive.
        assert_eq!(alias.frame(), Some(frame));
        assert_eq!(phys.free_frames(), free_before);
        drop(alias);
        assert_eq!(phys.free_frames(), free_before + 1);
    }

    #[test]
    fn copy_duplicates_contents() {
        let phys = test_arena(4);
        let a = create_private(&phys, VmPageFlags::empty()).unwrap();
        let b = create_private(&phys, VmPageFlags::empty()).unwrap();
        phys.copy_in(a.frame().unwrap(), 0, b"pattern");
        copy(&phys, &a, &b).unwrap();
        let mut buf = [0u8; 7];
        phys.copy_out(b.frame().unwrap(), 0, &mut buf);
        assert_eq!(&buf, b"pattern");
    }
}
