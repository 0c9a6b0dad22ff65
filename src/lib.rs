//! MLQOS: a multilevel-queue scheduling kernel core.
//!
//! The kernel runs hosted: every CPU is a host thread looping in the
//! scheduler and every process is a host thread that only executes while a
//! CPU has switched to it. Processes are picked by one of three policies
//! depending on their queue level:
//!
//! 1. round robin over the time since each process last ran,
//! 2. a lottery over tickets,
//! 3. best job first, by a weighted rank.
//!
//! A process that stays runnable for too many scheduler passes is promoted
//! to level 1.
//!
//! ```no_run
//! use mlqos::{Kernel, KernelConfig};
//!
//! let kernel = Kernel::new(KernelConfig::default()).unwrap();
//! kernel
//!     .boot(|sys| {
//!         let child = sys.fork(|sys| {
//!             mlqos::kprintln!(sys, "child of {}", sys.get_parent_pid());
//!         });
//!         sys.change_process_queue(child, 1);
//!     })
//!     .unwrap();
//! assert_eq!(kernel.join(), Ok(0));
//! ```

pub mod config;
pub mod console;
pub mod interrupts;
pub mod kernel;
pub mod param;
pub mod process;
pub mod programs;
pub mod services;
pub mod sync;
pub mod syscalls;

pub use config::{ConfigError, KernelConfig};
pub use console::Console;
pub use kernel::{BootError, Kernel, KernelPanic, Program};
pub use process::{BjfRatios, Level, Pid, ProcInfo, ProcState, ProcessError, SchedulerStats};
pub use syscalls::{Sys, SyscallNumber};
