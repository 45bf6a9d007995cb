//! Machine-dependent layer contract.
//!
//! The core never touches page tables, trap frames or I/O ports directly;
//! everything below this trait is supplied by the platform at boot. Hosted
//! tests register a stub implementation that records what the core asked for.

use alloc::sync::Arc;
use spin::Once;

use crate::errno::Result;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::vmspace::AreaFlags;
use crate::task::thread::Thread;

/// Opaque page-table root token. Only the MD layer interprets the value
/// (typically the physical address of the top-level table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRoot(pub u64);

/// Saved FPU state (FXSAVE-sized, 16-byte aligned).
#[repr(C, align(16))]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    pub const fn zeroed() -> Self {
        FpuState([0u8; 512])
    }
}

/// Per-thread machine context: general-register save area, FPU save area
/// and the page-table root to load. The register layout is MD-defined; the
/// core only allocates and hands it over on a switch.
#[repr(C, align(16))]
pub struct CpuContext {
    pub regs: [u64; 18],
    pub fpu: FpuState,
    pub root: u64,
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        CpuContext {
            regs: [0; 18],
            fpu: FpuState::zeroed(),
            root: 0,
        }
    }
}

/// The contract the platform implements for the core.
pub trait MachDep: Send + Sync {
    /// Seed a freshly created address-space root with the kernel half.
    fn map_kernel(&self, root: &mut PageRoot);

    /// Map `count` pages `va -> pa` into `root` with the given permissions.
    fn map_pages(
        &self,
        root: &PageRoot,
        va: VirtAddr,
        pa: PhysAddr,
        count: usize,
        flags: AreaFlags,
    ) -> Result<()>;

    /// Remove `count` page mappings starting at `va`.
    fn unmap_pages(&self, root: &PageRoot, va: VirtAddr, count: usize) -> Result<()>;

    /// Save `old`'s context (when present) and resume `new`. Returns when
    /// the old thread is scheduled again.
    fn context_switch(&self, new: &Thread, old: Option<&Thread>);

    /// Busy-wait for at least `us` microseconds (controller settle times).
    fn delay_us(&self, us: u64);
}

static MACHDEP: Once<Arc<dyn MachDep>> = Once::new();

/// Install the platform's MD implementation. Must happen exactly once,
/// before any subsystem that switches contexts or maps pages is used.
pub fn set_machdep(md: Arc<dyn MachDep>) {
    MACHDEP.call_once(|| md);
}

/// The registered MD implementation.
///
/// Panics if called before [`set_machdep`]; that is a boot-order bug.
pub fn machdep() -> &'static Arc<dyn MachDep> {
    MACHDEP.get().expect("machdep layer not registered")
}
