// Process Control Block (PCB) for MLQOS
use core::fmt;
use std::sync::atomic::AtomicUsize;

use crate::param::{DEFAULT_RATIO, NOFILE};
use crate::process::context::Context;
use crate::services::file_service::{DirHandle, FileHandle};
use crate::services::memory_service::{AddressSpace, KStack};

/// Process ID type
pub type Pid = i32;

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    /// Edges of the process state graph
    pub fn can_become(self, next: ProcState) -> bool {
        use ProcState::*;
        matches!(
            (self, next),
            (Unused, Embryo)
                | (Embryo, Runnable)
                | (Embryo, Unused)
                | (Runnable, Running)
                | (Running, Runnable)
                | (Running, Sleeping)
                | (Running, Zombie)
                | (Sleeping, Runnable)
                | (Zombie, Unused)
        )
    }

    /// Name used by the scheduling report
    pub fn name(self) -> &'static str {
        match self {
            ProcState::Unused => "UNUSED",
            ProcState::Embryo => "EMBRYO",
            ProcState::Sleeping => "SLEEPING",
            ProcState::Runnable => "RUNNABLE",
            ProcState::Running => "RUNNING",
            ProcState::Zombie => "ZOMBIE",
        }
    }

    /// Fixed-width name used by procdump
    pub fn short_name(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Scheduling class. Lower levels are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    RoundRobin = 1,
    Lottery = 2,
    BestJobFirst = 3,
}

impl Level {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// New processes start in the lottery class
impl Default for Level {
    fn default() -> Self {
        Level::Lottery
    }
}

impl TryFrom<i32> for Level {
    type Error = ProcessError;

    fn try_from(level: i32) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Level::RoundRobin),
            2 => Ok(Level::Lottery),
            3 => Ok(Level::BestJobFirst),
            _ => Err(ProcessError::InvalidLevel),
        }
    }
}

/// What a sleeping process is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A parent blocked in wait(), keyed by its table slot
    Proc(usize),
    /// The tick counter
    Ticks,
    /// Any semaphore of the bank
    Semaphores,
}

/// Weights of the best-job-first rank
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BjfRatios {
    pub priority: f32,
    pub arrival_time: f32,
    pub exec_cycle: f32,
}

impl BjfRatios {
    pub fn new(priority: f32, arrival_time: f32, exec_cycle: f32) -> Self {
        Self {
            priority,
            arrival_time,
            exec_cycle,
        }
    }
}

impl Default for BjfRatios {
    fn default() -> Self {
        Self::new(DEFAULT_RATIO, DEFAULT_RATIO, DEFAULT_RATIO)
    }
}

/// Process Control Block - one per table slot
#[derive(Debug)]
pub struct Proc {
    pub pid: Pid,
    state: ProcState,
    pub level: Level,
    pub ticket: i32,
    /// 1/ticket, fixed at allocation
    pub priority: f32,
    pub arrival_time: u64,
    pub exec_cycle: f32,
    pub wait: u32,
    pub cycle: u32,
    pub cpu_time: u64,
    pub ratios: BjfRatios,
    /// Table slot of the parent process
    pub parent: Option<usize>,
    /// If Some, sleeping on chan
    pub chan: Option<Channel>,
    pub killed: bool,
    pub name: String,
    /// Size of process memory (bytes)
    pub sz: usize,
    pub address_space: Option<AddressSpace>,
    pub kstack: Option<KStack>,
    pub ofile: [Option<FileHandle>; NOFILE],
    pub cwd: Option<DirHandle>,
}

impl Proc {
    pub fn new() -> Self {
        Self {
            pid: 0,
            state: ProcState::Unused,
            level: Level::default(),
            ticket: 0,
            priority: 0.0,
            arrival_time: 0,
            exec_cycle: 0.0,
            wait: 0,
            cycle: 0,
            cpu_time: 0,
            ratios: BjfRatios::default(),
            parent: None,
            chan: None,
            killed: false,
            name: String::new(),
            sz: 0,
            address_space: None,
            kstack: None,
            ofile: Default::default(),
            cwd: None,
        }
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    /// Move along one edge of the state graph. Any other move is fatal.
    pub fn set_state(&mut self, next: ProcState) {
        if !self.state.can_become(next) {
            panic!(
                "illegal state transition {:?} -> {:?} (pid {})",
                self.state, next, self.pid
            );
        }
        self.state = next;
    }

    /// Best-job-first rank; smaller runs first
    pub fn rank(&self) -> f32 {
        self.priority * self.ratios.priority
            + self.arrival_time as f32 * self.ratios.arrival_time
            + self.exec_cycle * self.ratios.exec_cycle
    }

    pub fn is_free(&self) -> bool {
        self.pid == 0 && self.parent.is_none()
    }
}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-slot kernel thread state that lives outside the table lock
pub struct KThread {
    /// swtch() here to run the process
    pub(crate) context: Context,
    /// CPU the scheduler last dispatched this thread on
    pub(crate) cpu: AtomicUsize,
}

impl KThread {
    pub fn new() -> Self {
        Self {
            context: Context::new(),
            cpu: AtomicUsize::new(0),
        }
    }
}

impl Default for KThread {
    fn default() -> Self {
        Self::new()
    }
}

/// Process management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    TableFull,
    OutOfMemory,
    NoChildren,
    Killed,
    ProcessNotFound,
    InvalidLevel,
    InvalidTicket,
    InvalidSemaphore,
    InvalidArgument,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::TableFull => write!(f, "process table full"),
            ProcessError::OutOfMemory => write!(f, "out of memory"),
            ProcessError::NoChildren => write!(f, "no children"),
            ProcessError::Killed => write!(f, "process killed"),
            ProcessError::ProcessNotFound => write!(f, "process not found"),
            ProcessError::InvalidLevel => write!(f, "invalid scheduling level"),
            ProcessError::InvalidTicket => write!(f, "invalid ticket count"),
            ProcessError::InvalidSemaphore => write!(f, "invalid semaphore"),
            ProcessError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl std::error::Error for ProcessError {}
