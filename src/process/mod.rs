// Process Management Module for MLQOS
pub mod context;
pub mod cpu;
pub mod pcb;
pub mod scheduler;
pub mod sleep;
pub mod table;

pub use context::Context;
pub use cpu::{current_cpu_id, Cpu, CpuTable};
pub use pcb::{BjfRatios, Channel, Level, Pid, Proc, ProcState, ProcessError};
pub use scheduler::{age, best_job_first, dispatch, lottery, round_robin, select, SchedulerStats};
pub use table::{ProcInfo, ProcTable};
