//! Thread data structure and lifecycle.
//!
//! A thread owns its machine context (register/FPU save area, kernel stack)
//! and an info block carrying the three standard file handles plus the
//! working directory. Threads are reference counted; the storage is only
//! reclaimed once the count reaches zero *and* the thread is a zombie.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::CpuContext;
use crate::fs::file::File;
use crate::memory::vmspace::VmSpace;
use crate::sync::Spinlock;
use crate::task::scheduler;

/// Default kernel stack size (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Currently selected by the scheduler.
        const ACTIVE = 1 << 0;
        /// Not eligible for selection.
        const SUSPENDED = 1 << 1;
        /// Kernel thread: no user address space, no stdio handles.
        const KTHREAD = 1 << 2;
        /// Finished; storage reclaimed once the refcount drains.
        const ZOMBIE = 1 << 3;
    }
}

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

pub type ThreadRef = Arc<Thread>;

/// Per-thread info block: the standard handles and the working directory.
#[derive(Default)]
pub struct ThreadInfo {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
    pub cwd: Option<File>,
}

pub struct Thread {
    pub tid: u32,
    pub name: Spinlock<String>,
    flags: AtomicU32,
    refcount: AtomicU32,
    pub context: Spinlock<CpuContext>,
    pub kernel_stack: Spinlock<Box<[u8]>>,
    pub vmspace: Spinlock<Option<Arc<Spinlock<VmSpace>>>>,
    pub info: Spinlock<ThreadInfo>,
}

impl Thread {
    /// Allocate a thread with zero-initialized context and stack. The new
    /// thread starts suspended; attach it to the scheduler and resume it
    /// once its entry point is set up.
    pub fn new(name: &str, flags: ThreadFlags) -> ThreadRef {
        Arc::new(Thread {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: Spinlock::new(String::from(name)),
            flags: AtomicU32::new((flags | ThreadFlags::SUSPENDED).bits()),
            refcount: AtomicU32::new(1),
            context: Spinlock::new(CpuContext::zeroed()),
            kernel_stack: Spinlock::new(vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice()),
            vmspace: Spinlock::new(None),
            info: Spinlock::new(ThreadInfo::default()),
        })
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn set_flag(&self, f: ThreadFlags) {
        self.flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    pub fn clear_flag(&self, f: ThreadFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.flags().contains(ThreadFlags::SUSPENDED)
    }

    pub fn is_zombie(&self) -> bool {
        self.flags().contains(ThreadFlags::ZOMBIE)
    }

    pub fn is_kernel(&self) -> bool {
        self.flags().contains(ThreadFlags::KTHREAD)
    }

    /// Mark suspended. The caller is expected to invoke `schedule()` when
    /// suspending itself; this only flips the flag.
    pub fn set_suspended(&self) {
        self.set_flag(ThreadFlags::SUSPENDED);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn grab(&self) {
        let old = self.refcount.fetch_add(1, Ordering::SeqCst);
        assert!(old > 0, "thread ref on dead thread");
    }
}

/// Drop one reference. When the count reaches zero on a zombie, the thread
/// is unlinked from the scheduler ring and its storage goes away with the
/// last `Arc`.
pub fn thread_deref(t: &ThreadRef) {
    let old = t.refcount.fetch_sub(1, Ordering::SeqCst);
    assert!(old > 0, "thread refcount underflow");
    if old == 1 && t.is_zombie() {
        if let Some(sched) = scheduler::try_global() {
            sched.detach(t);
        }
    }
}

/// Terminate a thread: flag it as a zombie and suspend it so the scheduler
/// never picks it again. Reclamation happens via [`thread_deref`].
pub fn thread_exit(t: &ThreadRef) {
    t.set_flag(ThreadFlags::ZOMBIE | ThreadFlags::SUSPENDED);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_starts_suspended_with_one_ref() {
        let t = Thread::new("worker", ThreadFlags::empty());
        assert!(t.is_suspended());
        assert!(!t.is_zombie());
        assert_eq!(t.refcount(), 1);
        assert!(t.tid > 0);
    }

    #[test]
    fn exit_marks_zombie_and_suspended() {
        let t = Thread::new("doomed", ThreadFlags::KTHREAD);
        t.clear_flag(ThreadFlags::SUSPENDED);
        thread_exit(&t);
        assert!(t.is_zombie());
        assert!(t.is_suspended());
    }
}
