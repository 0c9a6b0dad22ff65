// Per-CPU state for MLQOS
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use crate::process::context::Context;

const NO_PROC: usize = usize::MAX;

thread_local! {
    /// CPU this host thread is currently executing on, the analogue of the
    /// local APIC id. Scheduler threads bind once; kernel threads rebind every
    /// time they are dispatched.
    static CURRENT_CPU: Cell<Option<usize>> = const { Cell::new(None) };
}

/// CPU the calling thread runs on, if any
pub fn current_cpu_id() -> Option<usize> {
    CURRENT_CPU.with(|id| id.get())
}

pub(crate) fn bind_cpu(id: Option<usize>) {
    CURRENT_CPU.with(|cell| cell.set(id));
}

/// Per-CPU state
pub struct Cpu {
    pub id: usize,
    /// swtch() here to enter the scheduler
    pub(crate) scheduler: Context,
    /// Slot of the process running on this cpu
    proc: AtomicUsize,
    /// Depth of push_off() nesting
    ncli: AtomicIsize,
    /// Were interrupts enabled before push_off()?
    intena: AtomicBool,
    /// Emulated interrupt-enable flag
    interrupts: AtomicBool,
    /// Set by the timer, consumed at the next preemption point
    need_resched: AtomicBool,
}

impl Cpu {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            scheduler: Context::new(),
            proc: AtomicUsize::new(NO_PROC),
            ncli: AtomicIsize::new(0),
            intena: AtomicBool::new(false),
            interrupts: AtomicBool::new(false),
            need_resched: AtomicBool::new(false),
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub(crate) fn sti(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cli(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }

    pub fn ncli(&self) -> isize {
        self.ncli.load(Ordering::SeqCst)
    }

    pub(crate) fn intena(&self) -> bool {
        self.intena.load(Ordering::SeqCst)
    }

    pub(crate) fn set_intena(&self, enabled: bool) {
        self.intena.store(enabled, Ordering::SeqCst);
    }

    /// push_off/pop_off are like cli/sti except that they are matched:
    /// it takes two pop_off()s to undo two push_off()s. If interrupts
    /// are initially off, push_off then pop_off leaves them off.
    pub(crate) fn push_off(&self) {
        let old = self.interrupts_enabled();
        self.cli();
        if self.ncli.load(Ordering::SeqCst) == 0 {
            self.set_intena(old);
        }
        self.ncli.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn pop_off(&self) {
        if self.interrupts_enabled() {
            panic!("pop_off interruptible");
        }
        let depth = self.ncli.fetch_sub(1, Ordering::SeqCst) - 1;
        if depth < 0 {
            panic!("pop_off");
        }
        if depth == 0 && self.intena() {
            self.sti();
        }
    }

    pub fn proc(&self) -> Option<usize> {
        match self.proc.load(Ordering::SeqCst) {
            NO_PROC => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn set_proc(&self, slot: Option<usize>) {
        self.proc.store(slot.unwrap_or(NO_PROC), Ordering::SeqCst);
    }

    pub(crate) fn request_resched(&self) {
        self.need_resched.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::SeqCst)
    }
}

/// Table of CPUs shared by the kernel and every lock it owns
pub struct CpuTable {
    cpus: Box<[Cpu]>,
    /// Set once the machine halts; spinning lock waiters give up
    frozen: AtomicBool,
}

impl CpuTable {
    pub fn new(ncpu: usize) -> Self {
        Self {
            cpus: (0..ncpu).map(Cpu::new).collect(),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn get(&self, id: usize) -> &Cpu {
        &self.cpus[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter()
    }

    /// The calling thread's CPU, if it is bound to one of ours
    pub fn current(&self) -> Option<&Cpu> {
        current_cpu_id().and_then(|id| self.cpus.get(id))
    }

    /// The calling thread's CPU. Kernel threads only ever run on a CPU.
    pub fn mycpu(&self) -> &Cpu {
        match self.current() {
            Some(cpu) => cpu,
            None => panic!("unknown cpu"),
        }
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }
}
