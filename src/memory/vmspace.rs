//! Address spaces and their areas.
//!
//! A vmspace owns an ordered set of non-overlapping vmareas plus the
//! MD-owned page-table root. Areas may be anonymous (Alloc) or file-backed
//! through a dentry slice; pages materialize on demand in the fault
//! handler.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::arch::{MachDep, PageRoot};
use crate::errno::{ErrorCode, Result};
use crate::fs::dcache::DentryRef;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::physical::PhysAllocator;
use crate::memory::vmpage::VmPage;
use crate::memory::FRAME_SIZE;

/// Start of the user mmap region.
pub const USER_MAP_BASE: u64 = 0x7000_0000;
/// End (exclusive) of the user mmap region.
pub const USER_MAP_LIMIT: u64 = 0xBF00_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AreaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
        /// Copy-on-write semantics: writes never reach the backing object.
        const PRIVATE = 1 << 4;
        /// Filled on demand from the backing dentry.
        const LAZY = 1 << 5;
        /// Anonymous demand-zero memory.
        const ALLOC = 1 << 6;
    }
}

/// File backing of an area: a dentry plus the slice of the file it maps.
#[derive(Clone)]
pub struct AreaBacking {
    pub dentry: DentryRef,
    pub doffset: u64,
    pub dlength: u64,
}

pub struct VmArea {
    pub base: VirtAddr,
    pub len: u64,
    pub flags: AreaFlags,
    pub backing: Option<AreaBacking>,
    /// Pages currently instantiated in this area.
    pub pages: Vec<Arc<VmPage>>,
}

impl VmArea {
    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.base && va.as_u64() < self.base.as_u64() + self.len
    }

    /// The page instantiated at page-aligned `vpage`, if any.
    pub fn page_at(&self, vpage: VirtAddr) -> Option<Arc<VmPage>> {
        self.pages
            .iter()
            .find(|p| p.l.lock().vaddr == vpage)
            .cloned()
    }

    /// Swap the page at `vpage` for `new` (the CoW upgrade path).
    pub fn replace_page(&mut self, vpage: VirtAddr, new: Arc<VmPage>) {
        self.pages.retain(|p| p.l.lock().vaddr != vpage);
        self.pages.push(new);
    }
}

pub struct VmSpace {
    pub areas: Vec<VmArea>,
    pub root: PageRoot,
    pub md: Arc<dyn MachDep>,
    pub phys: Arc<PhysAllocator>,
}

impl VmSpace {
    /// Create an address space: allocate a root table frame and let the MD
    /// layer seed its kernel half.
    pub fn new(md: Arc<dyn MachDep>, phys: Arc<PhysAllocator>) -> Result<Self> {
        let frame = phys.alloc_frame().ok_or(ErrorCode::OutOfMemory)?;
        let mut root = PageRoot(frame.as_u64());
        md.map_kernel(&mut root);
        Ok(VmSpace {
            areas: Vec::new(),
            root,
            md,
            phys,
        })
    }

    /// Insert an area. The range must be page-aligned and must not overlap
    /// any existing area.
    pub fn map_area(
        &mut self,
        base: VirtAddr,
        len: u64,
        flags: AreaFlags,
        backing: Option<AreaBacking>,
    ) -> Result<()> {
        if len == 0 || len % FRAME_SIZE as u64 != 0 || !base.is_page_aligned() {
            return Err(ErrorCode::BadLength);
        }
        let end = base.as_u64() + len;
        for a in &self.areas {
            let a_end = a.base.as_u64() + a.len;
            if base.as_u64() < a_end && a.base.as_u64() < end {
                return Err(ErrorCode::BadAddress);
            }
        }
        let pos = self
            .areas
            .iter()
            .position(|a| a.base > base)
            .unwrap_or(self.areas.len());
        self.areas.insert(
            pos,
            VmArea {
                base,
                len,
                flags,
                backing,
                pages: Vec::new(),
            },
        );
        Ok(())
    }

    /// Remove the area starting exactly at `base` with length `len`,
    /// unmapping and releasing its pages.
    pub fn unmap_area(&mut self, base: VirtAddr, len: u64) -> Result<()> {
        let pos = self
            .areas
            .iter()
            .position(|a| a.base == base && a.len == len)
            .ok_or(ErrorCode::BadAddress)?;
        let area = self.areas.remove(pos);
        for page in &area.pages {
            let vaddr = page.l.lock().vaddr;
            self.md.unmap_pages(&self.root, vaddr, 1)?;
        }
        // Private frames go back to the allocator with the page drop;
        // shared canonical pages stay cached on their inode.
        Ok(())
    }

    pub fn area_containing(&mut self, va: VirtAddr) -> Option<&mut VmArea> {
        self.areas.iter_mut().find(|a| a.contains(va))
    }

    /// First-fit search for `len` bytes of free user address space,
    /// starting at `hint`, wrapping to the region base for a second pass.
    pub fn find_free_range(&self, hint: u64, len: u64) -> Option<VirtAddr> {
        let search = |from: u64| -> Option<u64> {
            let mut cursor = from.max(USER_MAP_BASE);
            for a in &self.areas {
                let a_end = a.base.as_u64() + a.len;
                if a_end <= cursor {
                    continue;
                }
                if a.base.as_u64() >= cursor + len {
                    break;
                }
                cursor = cursor.max(a_end);
            }
            (cursor + len <= USER_MAP_LIMIT).then_some(cursor)
        };
        search(hint)
            .or_else(|| search(USER_MAP_BASE))
            .map(VirtAddr::new)
    }

    /// Translate a virtual address to its backing frame, if instantiated.
    pub fn frame_at(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        let vpage = va.page_align_down();
        self.area_containing(va)
            .and_then(|a| a.page_at(vpage))
            .and_then(|p| p.frame())
    }
}

impl Drop for VmSpace {
    fn drop(&mut self) {
        self.phys.free_frame(PhysAddr::new(self.root.0));
    }
}
