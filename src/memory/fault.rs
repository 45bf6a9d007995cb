//! Page-fault handler.
//!
//! Resolves a faulting access inside a vmspace: file-backed pages come from
//! the owning inode's shared-page list (filled from the dentry on first
//! touch), anonymous pages are demand-zeroed, and writes into private areas
//! get their own copy of shared data.

use crate::errno::{ErrorCode, Result};
use crate::fs::vfs;
use crate::memory::address::VirtAddr;
use crate::memory::vmpage::{self, VmPageFlags};
use crate::memory::vmspace::{AreaBacking, AreaFlags, VmSpace};
use crate::PAGE_SIZE;

/// Page flags derived from the area's permissions: a read-only area maps
/// read-only pages.
fn page_flags_from_area(flags: AreaFlags) -> VmPageFlags {
    if flags.contains(AreaFlags::READ) && !flags.contains(AreaFlags::WRITE) {
        VmPageFlags::READONLY
    } else {
        VmPageFlags::empty()
    }
}

/// Handle a fault at `virt` with the given access kind (READ and/or WRITE).
pub fn handle_fault(vs: &mut VmSpace, virt: VirtAddr, access: AreaFlags) -> Result<()> {
    let md = vs.md.clone();
    let phys = vs.phys.clone();
    let root = vs.root;
    let v_page = virt.page_align_down();

    let area = match vs.area_containing(virt) {
        Some(a) => a,
        None => return Err(ErrorCode::BadAddress),
    };

    // Faults only make sense in demand-filled areas; anything else means
    // the mapping and the hardware disagree.
    if !area.flags.intersects(AreaFlags::ALLOC | AreaFlags::LAZY) {
        panic!(
            "unexpected page fault in area {:#x}+{:#x} flags {:?}, virt {:#x}",
            area.base.as_u64(),
            area.len,
            area.flags,
            virt.as_u64()
        );
    }

    // An already-instantiated page: either a write into a copy-on-write
    // mapping (instantiate the private copy now) or a spurious fault
    // (remap and carry on).
    if let Some(existing) = area.page_at(v_page) {
        let needs_copy = {
            let data = existing.l.lock();
            access.contains(AreaFlags::WRITE)
                && area.flags.contains(AreaFlags::PRIVATE)
                && (data.flags.contains(VmPageFlags::COW) || data.source.is_some())
        };
        if needs_copy {
            let new_vp = vmpage::create_private(&phys, page_flags_from_area(area.flags))?;
            vmpage::copy(&phys, &existing, &new_vp)?;
            new_vp.l.lock().vaddr = v_page;
            area.replace_page(v_page, new_vp.clone());
            let frame = new_vp.frame().expect("fresh private page has a frame");
            md.map_pages(&root, v_page, frame, 1, area.flags)?;
            return Ok(());
        }
        let frame = existing.frame().ok_or(ErrorCode::BadAddress)?;
        let map_flags = if existing.flags().contains(VmPageFlags::READONLY)
            || existing.flags().contains(VmPageFlags::COW)
        {
            area.flags.difference(AreaFlags::WRITE)
        } else {
            area.flags
        };
        md.map_pages(&root, v_page, frame, 1, map_flags)?;
        return Ok(());
    }

    // File-backed portion of the area?
    let backing = area.backing.clone();
    let area_flags = area.flags;
    let area_base = area.base;
    if let Some(b) = backing {
        let rel = v_page.as_u64() - area_base.as_u64();
        if rel < b.dlength {
            return file_fault(vs, v_page, rel, &b, area_flags, access);
        }
    }

    // Anonymous: fresh private page, zeroed through a temporary writable
    // mapping, then remapped with the area's real permissions.
    let new_vp = vmpage::create_private(&phys, VmPageFlags::empty())?;
    new_vp.l.lock().vaddr = v_page;
    let frame = new_vp.frame().expect("fresh private page has a frame");
    let area = vs.area_containing(virt).expect("area vanished under fault");
    area.pages.push(new_vp);
    md.map_pages(&root, v_page, frame, 1, AreaFlags::READ | AreaFlags::WRITE)?;
    phys.zero(frame, PAGE_SIZE);
    md.map_pages(&root, v_page, frame, 1, area_flags)?;
    Ok(())
}

/// The file-backed branch: find or create the canonical shared page for
/// `(inode, read_off)`, fill it if pending, then share, CoW-share or copy
/// it into the area.
fn file_fault(
    vs: &mut VmSpace,
    v_page: VirtAddr,
    rel: u64,
    b: &AreaBacking,
    area_flags: AreaFlags,
    access: AreaFlags,
) -> Result<()> {
    let md = vs.md.clone();
    let phys = vs.phys.clone();
    let root = vs.root;
    let read_off = rel + b.doffset;
    let inode = b.dentry.inode().ok_or(ErrorCode::Io)?;

    // The inode mutex guards the shared-page list.
    let canonical = {
        let mut idata = inode.i.lock();
        match vmpage::lookup_shared(&idata.pages, inode.raw(), read_off) {
            Some(p) => p,
            None => {
                let p = vmpage::create_shared(
                    &phys,
                    inode.raw(),
                    read_off,
                    page_flags_from_area(area_flags),
                );
                idata.pages.push(p.clone());
                p
            }
        }
    };

    // Fill under the page lock so a second fault for the same offset waits
    // for the data instead of reading it twice.
    {
        let mut pdata = canonical.l.lock();
        if pdata.flags.contains(VmPageFlags::PENDING) {
            let frame = phys.alloc_frame().ok_or(ErrorCode::OutOfMemory)?;
            let buf =
                unsafe { core::slice::from_raw_parts_mut(phys.virt_of(frame), PAGE_SIZE) };
            match vfs::kread(&b.dentry, read_off, buf) {
                Ok(n) if n == PAGE_SIZE => {}
                Ok(_) => {
                    phys.free_frame(frame);
                    return Err(ErrorCode::ShortRead);
                }
                Err(e) => {
                    phys.free_frame(frame);
                    return Err(e);
                }
            }
            pdata.page = Some(frame);
            pdata.flags.remove(VmPageFlags::PENDING);
        }
    }

    let whole_page = read_off + PAGE_SIZE as u64 <= b.doffset + b.dlength;
    let private = area_flags.contains(AreaFlags::PRIVATE);

    let (new_vp, map_flags) = if whole_page && !private {
        // Zero-copy shared mapping.
        (vmpage::link(&canonical, page_flags_from_area(area_flags)), area_flags)
    } else if whole_page && private && !access.contains(AreaFlags::WRITE) {
        // Private area, read access: alias the shared frame read-only and
        // defer the copy until a write actually happens.
        (
            vmpage::link(&canonical, VmPageFlags::COW | VmPageFlags::READONLY),
            area_flags.difference(AreaFlags::WRITE),
        )
    } else {
        // Partial page or writing into a private area: take a copy now.
        let vp = vmpage::create_private(&phys, page_flags_from_area(area_flags))?;
        let src = canonical.frame().expect("canonical page filled above");
        let dst = vp.frame().expect("fresh private page has a frame");
        unsafe {
            core::ptr::copy_nonoverlapping(phys.virt_of(src), phys.virt_of(dst), PAGE_SIZE);
        }
        (vp, area_flags)
    };

    new_vp.l.lock().vaddr = v_page;
    let frame = new_vp
        .frame()
        .expect("page resolved to a frame after fill");
    let area = vs
        .area_containing(v_page)
        .expect("area vanished under fault");
    area.pages.push(new_vp);
    md.map_pages(&root, v_page, frame, 1, map_flags)?;
    Ok(())
}
