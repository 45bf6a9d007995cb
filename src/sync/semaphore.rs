//! Counting semaphore.
//!
//! `wait` suspends the caller on the scheduler until a `signal` arrives;
//! `signal` is safe to call from IRQ context (it only takes spinlocks).

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sync::Spinlock;
use crate::task::scheduler;
use crate::task::thread::ThreadRef;

pub struct Semaphore {
    inner: Spinlock<SemInner>,
}

struct SemInner {
    count: i32,
    waiters: Vec<ThreadRef>,
}

impl Semaphore {
    pub const fn new(initial: i32) -> Self {
        Semaphore {
            inner: Spinlock::new(SemInner {
                count: initial,
                waiters: Vec::new(),
            }),
        }
    }

    /// Decrement (P). Suspends until the count is positive.
    pub fn wait(&self) {
        loop {
            {
                let mut s = self.inner.lock();
                if s.count > 0 {
                    s.count -= 1;
                    if let Some(cur) = scheduler::try_current() {
                        s.waiters.retain(|w| !Arc::ptr_eq(w, &cur));
                    }
                    return;
                }
                // Register as a waiter and suspend; signal() resumes us.
                if let Some(cur) = scheduler::try_current() {
                    if !s.waiters.iter().any(|w| Arc::ptr_eq(w, &cur)) {
                        s.waiters.push(cur.clone());
                    }
                    cur.set_suspended();
                }
            }
            scheduler::yield_now();
        }
    }

    /// Wait once, then absorb any extra signals that piled up. Used by
    /// request/response exchanges where one response may be signalled from
    /// more than one completion path.
    pub fn wait_and_drain(&self) {
        self.wait();
        self.inner.lock().count = 0;
    }

    /// Increment (V) and wake the oldest waiter, if any.
    pub fn signal(&self) {
        let waiter = {
            let mut s = self.inner.lock();
            s.count += 1;
            if s.waiters.is_empty() {
                None
            } else {
                Some(s.waiters.remove(0))
            }
        };
        if let Some(w) = waiter {
            scheduler::resume(&w);
        }
    }

    /// Non-blocking P.
    pub fn try_wait(&self) -> bool {
        let mut s = self.inner.lock();
        if s.count > 0 {
            s.count -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_wait_does_not_block() {
        let sem = Semaphore::new(0);
        sem.signal();
        sem.wait();
        assert!(!sem.try_wait());
    }

    #[test]
    fn wait_and_drain_absorbs_extra_signals() {
        let sem = Semaphore::new(0);
        sem.signal();
        sem.signal();
        sem.signal();
        sem.wait_and_drain();
        assert!(!sem.try_wait());
    }

    #[test]
    fn cross_thread_signal_releases_waiter() {
        let sem = alloc::sync::Arc::new(Semaphore::new(0));
        let s2 = sem.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            s2.signal();
        });
        sem.wait();
        t.join().unwrap();
    }
}
