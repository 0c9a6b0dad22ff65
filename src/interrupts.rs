// Timer interrupts and trap return for MLQOS
use core::sync::atomic::{AtomicU64, Ordering};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::kernel::{unwind, Kernel, Unwind};
use crate::process::cpu::CpuTable;
use crate::process::pcb::{Channel, ProcessError};
use crate::sync::spinlock::SpinLock;

/// The tick counter and the lock sleepers on it use
pub struct Clock {
    pub(crate) lock: SpinLock<()>,
    ticks: AtomicU64,
}

impl Clock {
    pub fn new(cpus: Arc<CpuTable>) -> Self {
        Self {
            lock: SpinLock::new("time", (), cpus),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl Kernel {
    /// Current tick. Readable without tickslock.
    pub fn ticks(&self) -> u64 {
        self.clock.now()
    }

    /// One timer interrupt: advance the clock, wake sleepers and
    /// ask every CPU to reschedule.
    pub fn clock_tick(&self) {
        {
            let _guard = self.clock.lock.lock();
            self.clock.ticks.fetch_add(1, Ordering::SeqCst);
            self.wakeup(Channel::Ticks);
        }
        for cpu in self.cpus.iter() {
            cpu.request_resched();
        }
    }

    /// Sleep for n ticks. Fails if the process is killed meanwhile.
    pub fn sleep_ticks(&self, n: u64) -> Result<(), ProcessError> {
        let me = self.myproc();
        let mut guard = self.clock.lock.lock();
        let ticks0 = self.ticks();
        while self.ticks() - ticks0 < n {
            if self.is_killed(me) {
                return Err(ProcessError::Killed);
            }
            guard = self.sleep(Channel::Ticks, guard);
        }
        Ok(())
    }

    /// How many clock tick interrupts have occurred since start.
    pub fn uptime(&self) -> u64 {
        let _guard = self.clock.lock.lock();
        self.ticks()
    }

    /// Return toward user code: the point where a killed process
    /// exits and a timer interrupt forces a yield.
    pub(crate) fn trap_return(&self) {
        if self.cpus.is_frozen() {
            unwind(Unwind::Halted);
        }
        let me = self.myproc();
        if self.is_killed(me) {
            self.exit();
        }
        if self.cpus.mycpu().take_resched() {
            self.yield_cpu();
            if self.is_killed(me) {
                self.exit();
            }
        }
    }
}

/// Start the thread that delivers timer interrupts
pub(crate) fn spawn_timer(kernel: Arc<Kernel>, interval: Duration) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("timer".into()).spawn(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            while !kernel.is_halted() {
                thread::sleep(interval);
                kernel.clock_tick();
            }
        }));
        if let Err(payload) = result {
            kernel.unwound(payload);
        }
    })
}
