//! Kernel access to user memory.
//!
//! Copies cross the user/kernel boundary page by page: each page is faulted
//! in (or CoW-upgraded for writes), then the bytes move through the kernel
//! direct map. The kernel view of a user page never survives beyond one
//! copy call, so no view is held across a suspension point.

use crate::errno::{ErrorCode, Result};
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::fault::handle_fault;
use crate::memory::vmpage::VmPageFlags;
use crate::memory::vmspace::{AreaFlags, VmSpace};
use crate::PAGE_SIZE;

/// Materialize the user page containing `va` for the given access and
/// return its frame.
fn user_page_frame(vs: &mut VmSpace, va: VirtAddr, write: bool) -> Result<PhysAddr> {
    let vpage = va.page_align_down();
    let access = if write {
        AreaFlags::WRITE
    } else {
        AreaFlags::READ
    };

    let needs_fault = {
        let area = vs.area_containing(va).ok_or(ErrorCode::BadAddress)?;
        if !area.flags.contains(AreaFlags::USER) {
            return Err(ErrorCode::BadAddress);
        }
        if write && !area.flags.contains(AreaFlags::WRITE) {
            return Err(ErrorCode::BadAddress);
        }
        match area.page_at(vpage) {
            None => true,
            Some(p) => {
                let d = p.l.lock();
                // Writes through a CoW alias must take their copy first.
                write && (d.flags.contains(VmPageFlags::COW) || d.source.is_some())
            }
        }
    };

    if needs_fault {
        handle_fault(vs, vpage, access)?;
    }

    vs.area_containing(va)
        .and_then(|a| a.page_at(vpage))
        .and_then(|p| p.frame())
        .ok_or(ErrorCode::BadAddress)
}

/// Copy `dst.len()` bytes out of `vs` starting at user address `va`.
pub fn copy_from_user(vs: &mut VmSpace, va: VirtAddr, dst: &mut [u8]) -> Result<()> {
    let phys = vs.phys.clone();
    let mut done = 0usize;
    while done < dst.len() {
        let cur = VirtAddr::new(va.as_u64() + done as u64);
        let frame = user_page_frame(vs, cur, false)?;
        let page_off = cur.page_offset();
        let chunk = (PAGE_SIZE - page_off).min(dst.len() - done);
        phys.copy_out(frame, page_off, &mut dst[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Copy `src` into `vs` starting at user address `va`.
pub fn copy_to_user(vs: &mut VmSpace, va: VirtAddr, src: &[u8]) -> Result<()> {
    let phys = vs.phys.clone();
    let mut done = 0usize;
    while done < src.len() {
        let cur = VirtAddr::new(va.as_u64() + done as u64);
        let frame = user_page_frame(vs, cur, true)?;
        let page_off = cur.page_offset();
        let chunk = (PAGE_SIZE - page_off).min(src.len() - done);
        phys.copy_in(frame, page_off, &src[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use crate::test_support::{test_arena, TestMach};

    fn user_space() -> VmSpace {
        let md = Arc::new(TestMach::new());
        let mut vs = VmSpace::new(md, test_arena(32)).unwrap();
        vs.map_area(
            VirtAddr::new(0x7000_0000),
            2 * PAGE_SIZE as u64,
            AreaFlags::READ | AreaFlags::WRITE | AreaFlags::USER | AreaFlags::ALLOC,
            None,
        )
        .unwrap();
        vs
    }

    #[test]
    fn roundtrip_across_a_page_boundary() {
        let mut vs = user_space();
        let va = VirtAddr::new(0x7000_0000 + PAGE_SIZE as u64 - 3);
        copy_to_user(&mut vs, va, b"boundary").unwrap();
        let mut back = [0u8; 8];
        copy_from_user(&mut vs, va, &mut back).unwrap();
        assert_eq!(&back, b"boundary");
    }

    #[test]
    fn unmapped_or_kernel_addresses_are_rejected() {
        let mut vs = user_space();
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(&mut vs, VirtAddr::new(0x1000), &mut buf),
            Err(ErrorCode::BadAddress)
        );
    }

    #[test]
    fn write_to_readonly_user_area_is_rejected() {
        let md = Arc::new(TestMach::new());
        let mut vs = VmSpace::new(md, test_arena(8)).unwrap();
        vs.map_area(
            VirtAddr::new(0x7000_0000),
            PAGE_SIZE as u64,
            AreaFlags::READ | AreaFlags::USER | AreaFlags::ALLOC,
            None,
        )
        .unwrap();
        assert_eq!(
            copy_to_user(&mut vs, VirtAddr::new(0x7000_0000), b"x"),
            Err(ErrorCode::BadAddress)
        );
    }
}
