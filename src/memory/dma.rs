//! DMA memory for host controllers.
//!
//! Controllers see physical addresses; the driver sees the direct map. Whole
//! buffers are frame allocations, while the small fixed-size descriptor
//! structures (TDs, QHs) come from a chunk pool that carves frames up.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{ErrorCode, Result};
use crate::memory::address::PhysAddr;
use crate::memory::physical::PhysAllocator;
use crate::memory::FRAME_SIZE;
use crate::sync::Spinlock;

/// A piece of DMA-capable memory: physical address plus size. The kernel
/// view is `phys` through the allocator's direct map.
#[derive(Debug, Clone, Copy)]
pub struct DmaChunk {
    pub phys: PhysAddr,
    pub size: usize,
}

/// Allocate a page-granular DMA buffer, zeroed.
pub fn alloc_buffer(phys: &PhysAllocator, size: usize) -> Result<DmaChunk> {
    let frames = (size + FRAME_SIZE - 1) / FRAME_SIZE;
    let p = phys
        .alloc_contiguous(frames.max(1))
        .ok_or(ErrorCode::OutOfMemory)?;
    phys.zero(p, frames.max(1) * FRAME_SIZE);
    Ok(DmaChunk { phys: p, size })
}

/// Free a buffer from [`alloc_buffer`].
pub fn free_buffer(phys: &PhysAllocator, chunk: DmaChunk) {
    let frames = ((chunk.size + FRAME_SIZE - 1) / FRAME_SIZE).max(1);
    for i in 0..frames {
        phys.free_frame(PhysAddr::new(chunk.phys.as_u64() + (i * FRAME_SIZE) as u64));
    }
}

/// Fixed-chunk pool for descriptor-sized DMA structures.
pub struct DmaPool {
    phys: Arc<PhysAllocator>,
    chunk_size: usize,
    inner: Spinlock<PoolInner>,
}

struct PoolInner {
    free: Vec<PhysAddr>,
    /// Frames owned by the pool, kept so teardown can return them.
    frames: Vec<PhysAddr>,
}

impl DmaPool {
    /// `chunk_size` must divide the frame size and be a power of two so
    /// chunks never straddle a frame boundary.
    pub fn new(phys: Arc<PhysAllocator>, chunk_size: usize) -> Self {
        assert!(chunk_size.is_power_of_two() && FRAME_SIZE % chunk_size == 0);
        DmaPool {
            phys,
            chunk_size,
            inner: Spinlock::new(PoolInner {
                free: Vec::new(),
                frames: Vec::new(),
            }),
        }
    }

    /// Allocate one zeroed chunk, growing the pool by a frame when empty.
    pub fn alloc(&self) -> Result<DmaChunk> {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            let frame = self.phys.alloc_frame().ok_or(ErrorCode::OutOfMemory)?;
            inner.frames.push(frame);
            let per_frame = FRAME_SIZE / self.chunk_size;
            for i in 0..per_frame {
                inner
                    .free
                    .push(PhysAddr::new(frame.as_u64() + (i * self.chunk_size) as u64));
            }
        }
        let p = inner.free.pop().expect("refilled above");
        self.phys.zero(p, self.chunk_size);
        Ok(DmaChunk {
            phys: p,
            size: self.chunk_size,
        })
    }

    pub fn free(&self, chunk: DmaChunk) {
        self.inner.lock().free.push(chunk.phys);
    }

    pub fn phys_allocator(&self) -> &Arc<PhysAllocator> {
        &self.phys
    }
}

impl Drop for DmaPool {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        for f in inner.frames.iter() {
            self.phys.free_frame(*f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_arena;

    #[test]
    fn pool_chunks_are_aligned_and_recycled() {
        let phys = test_arena(4);
        let pool = DmaPool::new(phys, 32);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(a.phys.as_u64() % 32, 0);
        assert_ne!(a.phys, b.phys);
        pool.free(a);
        let c = pool.alloc().unwrap();
        assert_eq!(c.phys, a.phys);
    }

    #[test]
    fn buffer_alloc_rounds_to_frames() {
        let phys = test_arena(4);
        let before = phys.free_frames();
        let buf = alloc_buffer(&phys, 5000).unwrap();
        assert_eq!(phys.free_frames(), before - 2);
        free_buffer(&phys, buf);
        assert_eq!(phys.free_frames(), before);
    }
}
