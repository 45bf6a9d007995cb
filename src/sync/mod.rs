//! Synchronization primitives.
//!
//! Spinlocks come from the `spin` crate; the semaphore integrates with the
//! scheduler so waits suspend the calling thread instead of burning the CPU.

mod semaphore;

pub use semaphore::Semaphore;

/// Busy-waiting lock. IRQ handlers may only ever take these, never a
/// sleeping primitive.
pub type Spinlock<T> = spin::Mutex<T>;
pub type SpinlockGuard<'a, T> = spin::MutexGuard<'a, T>;
