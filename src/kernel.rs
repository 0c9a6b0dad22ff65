// The MLQOS kernel object
//
// One `Kernel` is one simulated machine: the process table, the CPUs and
// their scheduler threads, the clock, the semaphore bank and the
// collaborators that own memory and files. `boot` starts it with a root
// program, `join` waits for it to halt.
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use conquer_once::spin::OnceCell;

use crate::config::{ConfigError, KernelConfig};
use crate::console::Console;
use crate::interrupts::{spawn_timer, Clock};
use crate::kprintln;
use crate::param::CONSOLE_HISTORY;
use crate::process::cpu::{bind_cpu, CpuTable};
use crate::process::pcb::{KThread, ProcessError};
use crate::process::scheduler::SchedulerCounters;
use crate::process::table::ProcTable;
use crate::services::file_service::{FileLayer, FileService};
use crate::services::memory_service::{
    AddressSpaceManager, KernelStackAllocator, MemoryService, StackPool,
};
use crate::sync::semaphore::SemaphoreBank;
use crate::sync::spinlock::SpinLock;
use crate::syscalls::{CallerLog, Sys};

/// A user program: the body a process runs once it is scheduled
pub type Program = Box<dyn FnOnce(&Sys) + Send + 'static>;

/// Why a kernel thread is unwinding out of its body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unwind {
    /// The process exited and its CPU went back to the scheduler
    Exited,
    /// The machine halted
    Halted,
}

/// Leave the current kernel thread without running its remaining frames.
pub(crate) fn unwind(reason: Unwind) -> ! {
    panic::resume_unwind(Box::new(reason))
}

/// A fatal kernel error that halted the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPanic {
    pub message: String,
}

impl fmt::Display for KernelPanic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "kernel panic: {}", self.message)
    }
}

impl std::error::Error for KernelPanic {}

/// Boot failures
#[derive(Debug)]
pub enum BootError {
    AlreadyBooted,
    Process(ProcessError),
    Spawn(io::Error),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BootError::AlreadyBooted => write!(f, "kernel already booted"),
            BootError::Process(err) => write!(f, "cannot create init: {}", err),
            BootError::Spawn(err) => write!(f, "cannot start thread: {}", err),
        }
    }
}

impl std::error::Error for BootError {}

impl From<ProcessError> for BootError {
    fn from(err: ProcessError) -> Self {
        BootError::Process(err)
    }
}

impl From<io::Error> for BootError {
    fn from(err: io::Error) -> Self {
        BootError::Spawn(err)
    }
}

pub struct Kernel {
    this: Weak<Kernel>,
    config: KernelConfig,
    pub(crate) cpus: Arc<CpuTable>,
    pub(crate) ptable: SpinLock<ProcTable>,
    pub(crate) kthreads: Box<[KThread]>,
    pub(crate) clock: Clock,
    pub(crate) semaphores: SemaphoreBank,
    pub(crate) callers: SpinLock<CallerLog>,
    pub(crate) vm: Arc<dyn AddressSpaceManager>,
    pub(crate) kalloc: Arc<dyn KernelStackAllocator>,
    pub(crate) files: Arc<dyn FileLayer>,
    console: Console,
    pub(crate) initproc: OnceCell<usize>,
    pub(crate) sched_counters: SchedulerCounters,
    booted: AtomicBool,
    outcome: spin::Mutex<Option<Result<i32, KernelPanic>>>,
    threads: spin::Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// A kernel with the in-memory collaborators sized from `config`
    pub fn new(config: KernelConfig) -> Result<Arc<Kernel>, ConfigError> {
        let vm = Arc::new(MemoryService::new(config.user_pages));
        let kalloc = Arc::new(StackPool::new(config.kstack_pages));
        let files = Arc::new(FileService::new());
        Self::with_services(config, vm, kalloc, files)
    }

    pub fn with_services(
        config: KernelConfig,
        vm: Arc<dyn AddressSpaceManager>,
        kalloc: Arc<dyn KernelStackAllocator>,
        files: Arc<dyn FileLayer>,
    ) -> Result<Arc<Kernel>, ConfigError> {
        config.validate()?;
        let cpus = Arc::new(CpuTable::new(config.ncpu));
        Ok(Arc::new_cyclic(|this| Kernel {
            this: this.clone(),
            ptable: SpinLock::new(
                "ptable",
                ProcTable::new(config.nproc, config.ticket_seed),
                cpus.clone(),
            ),
            kthreads: (0..config.nproc).map(|_| KThread::new()).collect(),
            clock: Clock::new(cpus.clone()),
            semaphores: SemaphoreBank::new(
                config.semaphore_count(),
                config.waiter_capacity(),
                cpus.clone(),
            ),
            callers: SpinLock::new("callers", CallerLog::new(), cpus.clone()),
            vm,
            kalloc,
            files,
            console: Console::new(CONSOLE_HISTORY),
            initproc: OnceCell::uninit(),
            sched_counters: SchedulerCounters::default(),
            booted: AtomicBool::new(false),
            outcome: spin::Mutex::new(None),
            threads: spin::Mutex::new(Vec::new()),
            cpus,
            config,
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn cpus(&self) -> &CpuTable {
        &self.cpus
    }

    pub fn semaphores(&self) -> &SemaphoreBank {
        &self.semaphores
    }

    /// Start the machine: create the root process running `init`, then
    /// one scheduler thread per CPU and the timer.
    ///
    /// When `init` returns, the root process keeps reaping children until it
    /// has none left and then shuts the machine down with code 0.
    pub fn boot<F>(self: &Arc<Self>, init: F) -> Result<(), BootError>
    where
        F: FnOnce(&Sys) + Send + 'static,
    {
        if self.booted.swap(true, Ordering::SeqCst) {
            return Err(BootError::AlreadyBooted);
        }
        log::info!(
            "mlqos: booting {} cpus, {} process slots",
            self.cpus.len(),
            self.config.nproc
        );
        self.userinit(Box::new(init))?;

        for cpu in self.cpus.iter() {
            let kernel = self.clone();
            let id = cpu.id;
            let handle = thread::Builder::new()
                .name(format!("cpu{}", id))
                .spawn(move || {
                    bind_cpu(Some(id));
                    let result = panic::catch_unwind(AssertUnwindSafe(|| kernel.scheduler()));
                    bind_cpu(None);
                    if let Err(payload) = result {
                        kernel.unwound(payload);
                    }
                })?;
            self.threads.lock().push(handle);
        }

        if let Some(interval) = self.config.tick_interval {
            let handle = spawn_timer(self.clone(), interval)?;
            self.threads.lock().push(handle);
        }
        Ok(())
    }

    /// Wait for the machine to halt and report how it went down.
    pub fn join(&self) -> Result<i32, KernelPanic> {
        loop {
            let handles: Vec<JoinHandle<()>> = core::mem::take(&mut *self.threads.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    log::warn!("kernel thread died outside the kernel");
                }
            }
        }
        match self.outcome.lock().clone() {
            Some(outcome) => outcome,
            None => Err(KernelPanic {
                message: "machine stopped without halting".to_string(),
            }),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.cpus.is_frozen()
    }

    /// Halt the machine from outside with exit code `code`.
    pub fn power_off(&self, code: i32) {
        self.halt(Ok(code));
    }

    /// Halt the machine from a kernel thread. Does not return.
    pub fn shutdown(&self, code: i32) -> ! {
        log::info!("mlqos: shutdown with code {}", code);
        self.halt(Ok(code));
        unwind(Unwind::Halted)
    }

    fn halt(&self, outcome: Result<i32, KernelPanic>) {
        {
            let mut slot = self.outcome.lock();
            if slot.is_none() {
                *slot = Some(outcome);
            }
        }
        self.cpus.freeze();
        for kthread in self.kthreads.iter() {
            kthread.context.halt();
        }
        for cpu in self.cpus.iter() {
            cpu.scheduler.halt();
        }
    }

    /// Report a kernel error and stop every CPU.
    fn fatal(&self, message: String) {
        log::error!("kernel panic: {}", message);
        kprintln!(self.console, "panic: {}", message);
        self.halt(Err(KernelPanic { message }));
    }

    /// Classify what a kernel thread unwound with. Exits and halts are
    /// the normal ways out; anything else is a kernel panic.
    pub(crate) fn unwound(&self, payload: Box<dyn Any + Send>) {
        if payload.downcast_ref::<Unwind>().is_some() {
            return;
        }
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic".to_string()
        };
        self.fatal(message);
    }

    /// Slot of the root process
    pub(crate) fn init_slot(&self) -> usize {
        match self.initproc.get() {
            Some(&slot) => slot,
            None => panic!("no init process"),
        }
    }

    /// Start the host thread backing a process. It stays parked until a
    /// scheduler dispatches the slot.
    pub(crate) fn spawn_kthread(&self, slot: usize, program: Program, is_init: bool) -> io::Result<()> {
        let kernel = match self.this.upgrade() {
            Some(kernel) => kernel,
            None => return Err(io::Error::new(io::ErrorKind::Other, "kernel dropped")),
        };
        if self.is_halted() {
            return Err(io::Error::new(io::ErrorKind::Other, "machine halted"));
        }
        let handle = thread::Builder::new()
            .name(format!("proc{}", slot))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    if !kernel.kthreads[slot].context.park() {
                        return;
                    }
                    kernel.forkret(slot);
                    let sys = Sys::new(kernel.clone());
                    program(&sys);
                    if !is_init {
                        sys.exit();
                    }
                    // reap orphans, then power off
                    while sys.wait() >= 0 {}
                    sys.shutdown(0);
                }));
                bind_cpu(None);
                if let Err(payload) = result {
                    kernel.unwound(payload);
                }
            })?;
        self.threads.lock().push(handle);
        Ok(())
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("ncpu", &self.cpus.len())
            .field("nproc", &self.config.nproc)
            .field("ticks", &self.ticks())
            .field("halted", &self.is_halted())
            .finish()
    }
}
