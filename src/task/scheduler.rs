//! Round-robin thread selection.
//!
//! `schedule()` is the only control-transfer primitive: it picks the next
//! runnable thread from the global ring and asks the MD layer to switch to
//! it. Cooperative: it runs on syscall exit, inside blocking primitives,
//! and after IRQs that woke something up. There is no preemption outside
//! these explicit calls.
//!
//! The ring is kept in insertion order; a walk starts after the current
//! thread and takes the first entry that is neither active nor suspended.
//! If nothing is runnable the per-CPU idle thread runs (it is parked as
//! permanently suspended so the walk itself never picks it).

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Once;

use crate::arch::MachDep;
use crate::sync::Spinlock;
use crate::task::thread::{ThreadFlags, ThreadRef};

pub struct Scheduler {
    md: Arc<dyn MachDep>,
    inner: Spinlock<SchedInner>,
}

struct SchedInner {
    /// All threads, insertion order. Ring order is index order, wrapping.
    threads: Vec<ThreadRef>,
    current: Cursor,
    idle: Option<ThreadRef>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Cursor {
    None,
    Ring(usize),
    Idle,
}

impl Scheduler {
    pub fn new(md: Arc<dyn MachDep>) -> Self {
        Scheduler {
            md,
            inner: Spinlock::new(SchedInner {
                threads: Vec::new(),
                current: Cursor::None,
                idle: None,
            }),
        }
    }

    /// Link a thread into the ring. Threads join suspended; resume when
    /// ready to run.
    pub fn attach(&self, t: ThreadRef) {
        self.inner.lock().threads.push(t);
    }

    /// Unlink a thread (zombie teardown path).
    pub fn detach(&self, t: &ThreadRef) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.threads.iter().position(|x| Arc::ptr_eq(x, t)) {
            inner.threads.remove(pos);
            inner.current = match inner.current {
                Cursor::Ring(c) if c == pos => Cursor::None,
                Cursor::Ring(c) if c > pos => Cursor::Ring(c - 1),
                other => other,
            };
        }
    }

    /// Park `t` as this CPU's idle thread. It stays suspended forever so
    /// the ring walk skips it; `schedule()` falls back to it explicitly.
    pub fn register_idle(&self, t: ThreadRef) {
        t.set_flag(ThreadFlags::SUSPENDED);
        self.inner.lock().idle = Some(t);
    }

    /// The thread currently holding the CPU.
    pub fn current(&self) -> Option<ThreadRef> {
        let inner = self.inner.lock();
        match inner.current {
            Cursor::None => None,
            Cursor::Ring(i) => Some(inner.threads[i].clone()),
            Cursor::Idle => inner.idle.clone(),
        }
    }

    /// Mark a thread suspended. Threads suspend themselves by calling this
    /// and then `schedule()`.
    pub fn suspend(&self, t: &ThreadRef) {
        let _guard = self.inner.lock();
        t.set_flag(ThreadFlags::SUSPENDED);
    }

    /// Make a thread runnable again. Legal from IRQ context and from other
    /// threads; the wakeup takes effect at the next `schedule()`.
    pub fn resume(&self, t: &ThreadRef) {
        let _guard = self.inner.lock();
        t.clear_flag(ThreadFlags::SUSPENDED);
    }

    /// Select the next runnable thread and switch to it. Returns (in the
    /// caller's context) once the caller is scheduled again.
    ///
    /// Panics when the ring is empty and no idle thread is registered;
    /// that means boot never created one, which is unrecoverable.
    pub fn schedule(&self) {
        let (new, old) = {
            let mut inner = self.inner.lock();
            if inner.threads.is_empty() && inner.idle.is_none() {
                panic!("schedule: thread ring empty and no idle thread");
            }

            let old = match inner.current {
                Cursor::None => None,
                Cursor::Ring(i) => Some(inner.threads[i].clone()),
                Cursor::Idle => inner.idle.clone(),
            };
            if let Some(ref cur) = old {
                cur.clear_flag(ThreadFlags::ACTIVE);
            }

            let len = inner.threads.len();
            let (start, skip_current) = match inner.current {
                Cursor::Ring(i) if len > 0 => ((i + 1) % len, Some(i)),
                _ => (0, None),
            };

            let mut chosen = None;
            for k in 0..len {
                let idx = (start + k) % len;
                if skip_current == Some(idx) {
                    continue;
                }
                let flags = inner.threads[idx].flags();
                if !flags.intersects(ThreadFlags::ACTIVE | ThreadFlags::SUSPENDED) {
                    chosen = Some(idx);
                    break;
                }
            }

            let new = match chosen {
                Some(idx) => {
                    let t = inner.threads[idx].clone();
                    t.set_flag(ThreadFlags::ACTIVE);
                    assert!(
                        !t.is_suspended(),
                        "schedule: activating suspended thread {}",
                        t.tid
                    );
                    inner.current = Cursor::Ring(idx);
                    t
                }
                None => {
                    let idle = inner
                        .idle
                        .clone()
                        .expect("schedule: nothing runnable and no idle thread");
                    inner.current = Cursor::Idle;
                    idle
                }
            };
            (new, old)
        };

        // Lock released: the switch is atomic as far as the outgoing
        // thread is concerned, and the incoming one may take the scheduler
        // lock immediately.
        self.md.context_switch(&new, old.as_deref());
    }
}

static SCHEDULER: Once<Scheduler> = Once::new();

/// Create the boot scheduler. Requires the MD layer to be registered.
pub fn init(md: Arc<dyn MachDep>) {
    SCHEDULER.call_once(|| Scheduler::new(md));
}

pub fn try_global() -> Option<&'static Scheduler> {
    SCHEDULER.get()
}

pub fn global() -> &'static Scheduler {
    SCHEDULER.get().expect("scheduler not initialized")
}

/// Current thread, if a scheduler is up and tracking one.
pub fn try_current() -> Option<ThreadRef> {
    try_global().and_then(|s| s.current())
}

/// Give up the CPU. Falls back to a pause when no scheduler exists yet
/// (early boot, hosted tests without a ring).
pub fn yield_now() {
    match try_global() {
        Some(s) => s.schedule(),
        None => core::hint::spin_loop(),
    }
}

/// Wake a thread through the global scheduler when present, or by flag
/// alone before one exists.
pub fn resume(t: &ThreadRef) {
    match try_global() {
        Some(s) => s.resume(t),
        None => t.clear_flag(ThreadFlags::SUSPENDED),
    }
}
