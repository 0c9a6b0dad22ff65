// Counting semaphores for MLQOS
use std::sync::Arc;

use crate::kernel::Kernel;
use crate::kprintln;
use crate::param::ROOM_SEMAPHORE;
use crate::process::cpu::CpuTable;
use crate::process::pcb::{Channel, ProcState, ProcessError};
use crate::sync::spinlock::SpinLock;

/// Value and waiters of one semaphore
#[derive(Debug)]
pub struct SemaphoreState {
    value: i32,
    /// Blocked processes by table slot, released last-in first-out
    waiters: Vec<usize>,
    /// Waiters popped by release() that have not run yet
    granted: Vec<usize>,
    capacity: usize,
}

impl SemaphoreState {
    fn new(capacity: usize) -> Self {
        Self {
            value: 0,
            waiters: Vec::with_capacity(capacity),
            granted: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }
}

/// Fixed bank of semaphores, each behind its own lock
pub struct SemaphoreBank {
    sems: Box<[SpinLock<SemaphoreState>]>,
}

impl SemaphoreBank {
    pub fn new(count: usize, waiter_capacity: usize, cpus: Arc<CpuTable>) -> Self {
        Self {
            sems: (0..count)
                .map(|_| SpinLock::new("semaphore", SemaphoreState::new(waiter_capacity), cpus.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sems.is_empty()
    }

    fn get(&self, id: usize) -> Result<&SpinLock<SemaphoreState>, ProcessError> {
        self.sems.get(id).ok_or(ProcessError::InvalidSemaphore)
    }

    /// Current value of a semaphore
    pub fn value(&self, id: usize) -> Option<i32> {
        self.sems.get(id).map(|s| s.lock().value)
    }

    /// Number of processes blocked on a semaphore
    pub fn waiting(&self, id: usize) -> Option<usize> {
        self.sems.get(id).map(|s| s.lock().waiters.len())
    }
}

impl Kernel {
    pub fn semaphore_init(&self, id: usize, value: i32) -> Result<(), ProcessError> {
        if value < 0 {
            return Err(ProcessError::InvalidArgument);
        }
        let mut sem = self.semaphores.get(id)?.lock();
        sem.value = value;
        sem.waiters.clear();
        sem.granted.clear();
        Ok(())
    }

    pub fn semaphore_acquire(&self, id: usize) -> Result<(), ProcessError> {
        let lock = self.semaphores.get(id)?;
        let me = self.myproc();
        let mut sem = lock.lock();
        loop {
            if let Some(pos) = sem.granted.iter().position(|&slot| slot == me) {
                sem.granted.swap_remove(pos);
                break;
            }
            if !sem.waiters.contains(&me) {
                if sem.value > 0 {
                    sem.value -= 1;
                    break;
                }
                if sem.waiters.len() == sem.capacity {
                    panic!("semaphore {} waiters", id);
                }
                sem.waiters.push(me);
            } else if self.is_killed(me) {
                sem.waiters.retain(|&slot| slot != me);
                return Err(ProcessError::Killed);
            }
            sem = self.sleep(Channel::Semaphores, sem);
        }
        self.trace_semaphore(me, "acquired", id);
        Ok(())
    }

    pub fn semaphore_release(&self, id: usize) -> Result<(), ProcessError> {
        let lock = self.semaphores.get(id)?;
        let me = self.myproc();
        let mut sem = lock.lock();
        match sem.waiters.pop() {
            Some(waiter) => {
                sem.granted.push(waiter);
                let mut table = self.ptable.lock();
                let p = table.get_mut(waiter);
                if p.state() == ProcState::Sleeping {
                    p.set_state(ProcState::Runnable);
                }
            }
            None => sem.value += 1,
        }
        self.trace_semaphore(me, "released", id);
        Ok(())
    }

    fn trace_semaphore(&self, slot: usize, what: &str, id: usize) {
        if self.config().trace_semaphores && id != ROOM_SEMAPHORE {
            let pid = self.ptable.lock().get(slot).pid;
            kprintln!(self.console(), "process {} {} {}", pid, what, id);
        }
    }
}
