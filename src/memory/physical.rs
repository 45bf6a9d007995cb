//! Physical frame allocator using a bitmap.
//!
//! Manages 4 KiB frames inside a direct-mapped arena handed over at boot.
//! Physical address 0 is the first byte of the arena; `virt_of`/`phys_of`
//! translate between frame addresses and kernel pointers, which also keeps
//! every DMA-visible address inside the controller's 32-bit reach.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Once;

use crate::memory::address::PhysAddr;
use crate::memory::FRAME_SIZE;
use crate::sync::Spinlock;

pub struct PhysAllocator {
    /// Kernel virtual address of physical 0.
    base: usize,
    inner: Spinlock<Bitmap>,
}

struct Bitmap {
    /// 1 = used, 0 = free.
    bits: Vec<u8>,
    total_frames: usize,
    free_frames: usize,
}

impl Bitmap {
    fn is_used(&self, frame: usize) -> bool {
        self.bits[frame / 8] & (1 << (frame % 8)) != 0
    }

    fn set_used(&mut self, frame: usize) {
        self.bits[frame / 8] |= 1 << (frame % 8);
    }

    fn set_free(&mut self, frame: usize) {
        self.bits[frame / 8] &= !(1 << (frame % 8));
    }
}

impl PhysAllocator {
    /// Take ownership of `size` bytes of page-aligned memory at `base`.
    pub fn new(base: *mut u8, size: usize) -> Self {
        assert!(
            (base as usize) % FRAME_SIZE == 0,
            "physical arena base not page aligned"
        );
        let total_frames = size / FRAME_SIZE;
        assert!(total_frames > 0, "physical arena too small");
        log::info!(
            "physical memory: {} frames ({} KiB)",
            total_frames,
            total_frames * FRAME_SIZE / 1024
        );
        PhysAllocator {
            base: base as usize,
            inner: Spinlock::new(Bitmap {
                bits: vec![0u8; (total_frames + 7) / 8],
                total_frames,
                free_frames: total_frames,
            }),
        }
    }

    /// Allocate a single frame (first-fit bitmap scan).
    pub fn alloc_frame(&self) -> Option<PhysAddr> {
        self.alloc_contiguous(1)
    }

    /// Allocate `count` physically contiguous frames.
    pub fn alloc_contiguous(&self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        let mut bm = self.inner.lock();
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for i in 0..bm.total_frames {
            if bm.is_used(i) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
            if run_len >= count {
                for j in run_start..run_start + count {
                    bm.set_used(j);
                }
                bm.free_frames -= count;
                return Some(PhysAddr::new((run_start * FRAME_SIZE) as u64));
            }
        }
        None
    }

    /// Return a frame to the pool.
    pub fn free_frame(&self, addr: PhysAddr) {
        let frame = addr.frame_index();
        let mut bm = self.inner.lock();
        assert!(frame < bm.total_frames, "free of frame outside arena");
        if bm.is_used(frame) {
            bm.set_free(frame);
            bm.free_frames += 1;
        }
    }

    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_frames
    }

    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames
    }

    /// Kernel pointer for a physical address (direct map).
    pub fn virt_of(&self, p: PhysAddr) -> *mut u8 {
        (self.base + p.as_u64() as usize) as *mut u8
    }

    /// Physical address of a pointer inside the arena.
    pub fn phys_of(&self, v: *const u8) -> PhysAddr {
        PhysAddr::new((v as usize - self.base) as u64)
    }

    /// Copy `src` into physical memory at `p + off`.
    pub fn copy_in(&self, p: PhysAddr, off: usize, src: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.virt_of(p).add(off), src.len());
        }
    }

    /// Copy physical memory at `p + off` into `dst`.
    pub fn copy_out(&self, p: PhysAddr, off: usize, dst: &mut [u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(self.virt_of(p).add(off), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Zero `len` bytes of physical memory at `p`.
    pub fn zero(&self, p: PhysAddr, len: usize) {
        unsafe {
            core::ptr::write_bytes(self.virt_of(p), 0, len);
        }
    }
}

static PHYSMEM: Once<Arc<PhysAllocator>> = Once::new();

/// Hand the boot arena to the global allocator. Called once during bring-up.
pub fn init(base: *mut u8, size: usize) {
    PHYSMEM.call_once(|| Arc::new(PhysAllocator::new(base, size)));
}

/// The boot allocator. Panics before [`init`].
pub fn physmem() -> &'static Arc<PhysAllocator> {
    PHYSMEM.get().expect("physical allocator not initialized")
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_arena;

    #[test]
    fn alloc_free_roundtrip() {
        let phys = test_arena(16);
        assert_eq!(phys.free_frames(), 16);
        let a = phys.alloc_frame().unwrap();
        let b = phys.alloc_frame().unwrap();
        assert_ne!(a, b);
        assert!(a.is_frame_aligned() && b.is_frame_aligned());
        assert_eq!(phys.free_frames(), 14);
        phys.free_frame(a);
        assert_eq!(phys.free_frames(), 15);
        // First-fit hands the freed frame out again.
        assert_eq!(phys.alloc_frame().unwrap(), a);
    }

    #[test]
    fn contiguous_runs() {
        let phys = test_arena(8);
        let run = phys.alloc_contiguous(4).unwrap();
        assert_eq!(run.frame_index(), 0);
        let next = phys.alloc_frame().unwrap();
        assert_eq!(next.frame_index(), 4);
        assert!(phys.alloc_contiguous(4).is_none());
    }

    #[test]
    fn copies_through_direct_map() {
        let phys = test_arena(2);
        let f = phys.alloc_frame().unwrap();
        phys.copy_in(f, 5, b"calyx");
        let mut buf = [0u8; 5];
        phys.copy_out(f, 5, &mut buf);
        assert_eq!(&buf, b"calyx");
        phys.zero(f, crate::PAGE_SIZE);
        phys.copy_out(f, 5, &mut buf);
        assert_eq!(buf, [0u8; 5]);
    }
}
