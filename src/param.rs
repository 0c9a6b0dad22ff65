// Kernel-wide constants for MLQOS

/// Default number of process table slots
pub const NPROC: usize = 64;
/// Default number of CPUs
pub const NCPU: usize = 2;
/// Open files per process
pub const NOFILE: usize = 16;
/// Size of one kernel stack / user page
pub const PGSIZE: usize = 4096;
/// Size of a process kernel stack
pub const KSTACKSIZE: usize = PGSIZE;

/// Base of the kernel stack window handed out by the stack pool
pub const KSTACK_BASE: u64 = 0xFFFF_FF00_0000_0000;

/// Lottery tickets are drawn from 1..=MAX_TICKET
pub const MAX_TICKET: i32 = 100;
/// Scheduler passes a runnable process may wait before it is promoted to level 1
pub const AGING_THRESHOLD: u32 = 8000;
/// Added to `exec_cycle` every time a process is dispatched
pub const EXEC_CYCLE_STEP: f32 = 0.1;
/// Default BJF ratio for every weight
pub const DEFAULT_RATIO: f32 = 1.0;

/// Number of semaphores in the bank
pub const NSEM: usize = 6;
/// Index of the admission ("room") semaphore
pub const ROOM_SEMAPHORE: usize = 5;
/// Number of philosophers in the dining demo
pub const NPHILOSOPHERS: usize = 5;

/// Syscall numbers are below this bound
pub const NSYSCALL: usize = 32;
/// Caller pids remembered per syscall
pub const PIDS_NUM: usize = 64;

/// Lines of console output kept for inspection
pub const CONSOLE_HISTORY: usize = 1024;
