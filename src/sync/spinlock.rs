// Mutual exclusion spin locks for MLQOS
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::kernel::{unwind, Unwind};
use crate::process::cpu::{Cpu, CpuTable};

const NOBODY: usize = usize::MAX;
/// Holder id of threads that are not bound to a CPU (timer, host)
const EXTERNAL: usize = usize::MAX - 1;

/// Spins before the waiter lets the host run someone else
const SPINS_BEFORE_YIELD: u32 = 64;

/// A spin lock that disables interrupts on its CPU while held.
///
/// The lock word is a `spin::Mutex<()>`; ownership is tracked separately
/// so that a lock taken by the scheduler can be released by the kernel
/// thread it switched to, which is how a freshly forked process enters
/// user code.
pub struct SpinLock<T> {
    name: &'static str,
    raw: spin::Mutex<()>,
    /// The cpu holding the lock
    cpu: AtomicUsize,
    cpus: Arc<CpuTable>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub fn new(name: &'static str, data: T, cpus: Arc<CpuTable>) -> Self {
        Self {
            name,
            raw: spin::Mutex::new(()),
            cpu: AtomicUsize::new(NOBODY),
            cpus,
            data: UnsafeCell::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock.
    /// Loops (spins) until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Take the lock only if nobody holds it
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let cpu = self.cpus.current();
        if let Some(cpu) = cpu {
            cpu.push_off();
            if self.holding() {
                cpu.pop_off();
                return None;
            }
        }
        match self.raw.try_lock() {
            Some(word) => {
                mem::forget(word);
                self.cpu.store(holder_id(cpu), Ordering::SeqCst);
                Some(SpinLockGuard {
                    lock: self,
                    _not_send: PhantomData,
                })
            }
            None => {
                if let Some(cpu) = cpu {
                    cpu.pop_off();
                }
                None
            }
        }
    }

    fn acquire(&self) {
        let cpu = self.cpus.current();
        if let Some(cpu) = cpu {
            // disable interrupts to avoid deadlock.
            cpu.push_off();
            if self.holding() {
                panic!("acquire {}", self.name);
            }
        }

        let mut spins = 0;
        loop {
            if let Some(word) = self.raw.try_lock() {
                mem::forget(word);
                break;
            }
            if self.cpus.is_frozen() {
                unwind(Unwind::Halted);
            }
            spins += 1;
            if spins % SPINS_BEFORE_YIELD == 0 {
                thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }

        self.cpu.store(holder_id(cpu), Ordering::SeqCst);
    }

    fn release(&self) {
        let cpu = self.cpus.current();
        if cpu.is_some() && !self.holding() {
            panic!("release {}", self.name);
        }
        self.cpu.store(NOBODY, Ordering::SeqCst);
        // SAFETY: the word was locked by acquire() and its guard forgotten
        unsafe { self.raw.force_unlock() };
        if let Some(cpu) = cpu {
            cpu.pop_off();
        }
    }

    /// Check whether this cpu is holding the lock.
    pub fn holding(&self) -> bool {
        self.raw.is_locked() && self.cpu.load(Ordering::SeqCst) == holder_id(self.cpus.current())
    }

    /// Release a lock that was acquired on this cpu by another thread.
    ///
    /// # Safety
    /// The caller must be the thread the holder switched to, and the
    /// holder's guard must not be dropped afterwards.
    pub(crate) unsafe fn force_release(&self) {
        self.release();
    }

    /// Borrow the data without taking the lock.
    ///
    /// # Safety
    /// Racy by construction. Only for diagnostic listings that must work
    /// even when the lock is wedged.
    pub(crate) unsafe fn get_unchecked(&self) -> &T {
        &*self.data.get()
    }
}

fn holder_id(cpu: Option<&Cpu>) -> usize {
    cpu.map_or(EXTERNAL, |cpu| cpu.id)
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    // guards stay on the thread (and cpu) that took them
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Release the lock and hand back the lock itself, for sleep().
    pub fn unlock(guard: Self) -> &'a SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if thread::panicking() {
            // a halted machine unwinds through held locks
            self.lock.cpu.store(NOBODY, Ordering::SeqCst);
            unsafe { self.lock.raw.force_unlock() };
            return;
        }
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::cpu::bind_cpu;

    fn cpus(n: usize) -> Arc<CpuTable> {
        Arc::new(CpuTable::new(n))
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new("test", 1, cpus(1));
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn locking_disables_interrupts_on_the_cpu() {
        let table = cpus(1);
        let lock = SpinLock::new("test", (), table.clone());
        bind_cpu(Some(0));
        table.get(0).sti();
        {
            let _guard = lock.lock();
            assert!(lock.holding());
            assert!(!table.get(0).interrupts_enabled());
            assert_eq!(table.get(0).ncli(), 1);
        }
        assert!(!lock.holding());
        assert!(table.get(0).interrupts_enabled());
        bind_cpu(None);
    }

    #[test]
    #[should_panic(expected = "acquire relock")]
    fn reacquire_on_same_cpu_is_fatal() {
        let lock = SpinLock::new("relock", (), cpus(1));
        bind_cpu(Some(0));
        let _outer = lock.lock();
        let _inner = lock.lock();
    }

    #[test]
    fn excludes_concurrent_threads() {
        let lock = Arc::new(SpinLock::new("counter", 0u64, cpus(1)));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new("busy", (), cpus(1));
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn unlock_hands_back_the_lock() {
        let lock = SpinLock::new("sleepy", 7, cpus(1));
        let guard = lock.lock();
        let again = SpinLockGuard::unlock(guard);
        assert_eq!(*again.lock(), 7);
    }
}
