// Synchronization primitives for MLQOS
pub mod semaphore;
pub mod spinlock;

pub use semaphore::{SemaphoreBank, SemaphoreState};
pub use spinlock::{SpinLock, SpinLockGuard};
