// System calls for MLQOS
use core::fmt;
use std::sync::Arc;

use crate::kernel::Kernel;
use crate::kprintln;
use crate::param::{NSYSCALL, PIDS_NUM};
use crate::process::pcb::{BjfRatios, Pid, ProcessError};

/// System call numbers
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Kill = 6,
    GetPid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Procdump = 19,
    Shutdown = 20,
    Yield = 21,
    GetParentPid = 22,
    GetCallers = 23,
    ChangeProcessQueue = 24,
    SetTicket = 25,
    SetBjfProcess = 26,
    SetBjfKernel = 27,
    PrintInformation = 28,
    SemInit = 29,
    SemAcquire = 30,
    SemRelease = 31,
}

impl SyscallNumber {
    pub const ALL: [SyscallNumber; 21] = [
        SyscallNumber::Fork,
        SyscallNumber::Exit,
        SyscallNumber::Wait,
        SyscallNumber::Kill,
        SyscallNumber::GetPid,
        SyscallNumber::Sbrk,
        SyscallNumber::Sleep,
        SyscallNumber::Uptime,
        SyscallNumber::Procdump,
        SyscallNumber::Shutdown,
        SyscallNumber::Yield,
        SyscallNumber::GetParentPid,
        SyscallNumber::GetCallers,
        SyscallNumber::ChangeProcessQueue,
        SyscallNumber::SetTicket,
        SyscallNumber::SetBjfProcess,
        SyscallNumber::SetBjfKernel,
        SyscallNumber::PrintInformation,
        SyscallNumber::SemInit,
        SyscallNumber::SemAcquire,
        SyscallNumber::SemRelease,
    ];

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for SyscallNumber {
    type Error = SyscallError;

    fn try_from(number: u64) -> Result<Self, Self::Error> {
        SyscallNumber::ALL
            .iter()
            .copied()
            .find(|n| n.as_u64() == number)
            .ok_or(SyscallError::InvalidSyscall)
    }
}

/// System call arguments (up to 6 arguments in x86_64)
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    pub arg0: u64, // rdi
    pub arg1: u64, // rsi
    pub arg2: u64, // rdx
    pub arg3: u64, // r10
    pub arg4: u64, // r8
    pub arg5: u64, // r9
}

impl SyscallArgs {
    pub fn new(args: &[i64]) -> Self {
        let mut regs = [0u64; 6];
        for (reg, arg) in regs.iter_mut().zip(args) {
            *reg = *arg as u64;
        }
        Self {
            arg0: regs[0],
            arg1: regs[1],
            arg2: regs[2],
            arg3: regs[3],
            arg4: regs[4],
            arg5: regs[5],
        }
    }

    fn int(&self, n: usize) -> i32 {
        let reg = match n {
            0 => self.arg0,
            1 => self.arg1,
            2 => self.arg2,
            3 => self.arg3,
            4 => self.arg4,
            _ => self.arg5,
        };
        reg as i64 as i32
    }
}

/// System call result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Success(i64),
    Error(SyscallError),
}

/// System call errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall,
    InvalidArgument,
    /// fork needs the child's program and cannot be raised by number
    NoChildProgram,
    Process(ProcessError),
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyscallError::InvalidSyscall => write!(f, "Invalid syscall number"),
            SyscallError::InvalidArgument => write!(f, "Invalid argument"),
            SyscallError::NoChildProgram => write!(f, "fork without a child program"),
            SyscallError::Process(err) => write!(f, "{}", err),
        }
    }
}

impl From<ProcessError> for SyscallError {
    fn from(err: ProcessError) -> Self {
        SyscallError::Process(err)
    }
}

/// Convert syscall result to the value user code sees
impl From<SyscallResult> for i64 {
    fn from(result: SyscallResult) -> i64 {
        match result {
            SyscallResult::Success(value) => value,
            SyscallResult::Error(_) => -1,
        }
    }
}

impl<T: Into<i64>> From<Result<T, SyscallError>> for SyscallResult {
    fn from(result: Result<T, SyscallError>) -> Self {
        match result {
            Ok(value) => SyscallResult::Success(value.into()),
            Err(err) => SyscallResult::Error(err),
        }
    }
}

/// Pids of the callers of each syscall, in call order.
/// Extra callers past the capacity are dropped.
pub struct CallerLog {
    callers: Box<[[Pid; PIDS_NUM]; NSYSCALL]>,
    sizes: [usize; NSYSCALL],
}

impl CallerLog {
    pub fn new() -> Self {
        Self {
            callers: Box::new([[0; PIDS_NUM]; NSYSCALL]),
            sizes: [0; NSYSCALL],
        }
    }

    pub fn record(&mut self, number: SyscallNumber, pid: Pid) {
        let n = number.as_u64() as usize;
        if self.sizes[n] < PIDS_NUM {
            self.callers[n][self.sizes[n]] = pid;
            self.sizes[n] += 1;
        }
    }

    pub fn callers(&self, number: SyscallNumber) -> &[Pid] {
        let n = number.as_u64() as usize;
        &self.callers[n][..self.sizes[n]]
    }
}

impl Default for CallerLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle a system call
pub fn handle_syscall(kernel: &Kernel, number: SyscallNumber, args: SyscallArgs) -> SyscallResult {
    match number {
        SyscallNumber::Fork => SyscallResult::Error(SyscallError::NoChildProgram),
        SyscallNumber::Exit => kernel.exit(),
        SyscallNumber::Wait => sys_wait(kernel).into(),
        SyscallNumber::Kill => sys_kill(kernel, args).into(),
        SyscallNumber::GetPid => SyscallResult::Success(kernel.getpid().into()),
        SyscallNumber::Sbrk => sys_sbrk(kernel, args).into(),
        SyscallNumber::Sleep => sys_sleep(kernel, args).into(),
        SyscallNumber::Uptime => SyscallResult::Success(kernel.uptime() as i64),
        SyscallNumber::Procdump => {
            kernel.procdump();
            SyscallResult::Success(0)
        }
        SyscallNumber::Shutdown => kernel.shutdown(args.int(0)),
        SyscallNumber::Yield => {
            kernel.yield_cpu();
            SyscallResult::Success(0)
        }
        SyscallNumber::GetParentPid => sys_get_parent_pid(kernel).into(),
        SyscallNumber::GetCallers => sys_get_callers(kernel, args).into(),
        SyscallNumber::ChangeProcessQueue => sys_change_process_queue(kernel, args).into(),
        SyscallNumber::SetTicket => sys_set_ticket(kernel, args).into(),
        SyscallNumber::SetBjfProcess => {
            let ratios = BjfRatios::new(args.int(1) as f32, args.int(2) as f32, args.int(3) as f32);
            kernel.set_bjf_ratios(args.int(0), ratios);
            SyscallResult::Success(0)
        }
        SyscallNumber::SetBjfKernel => {
            let ratios = BjfRatios::new(args.int(0) as f32, args.int(1) as f32, args.int(2) as f32);
            kernel.set_bjf_ratios_all(ratios);
            SyscallResult::Success(0)
        }
        SyscallNumber::PrintInformation => {
            kernel.print_information();
            SyscallResult::Success(0)
        }
        SyscallNumber::SemInit => sys_sem_init(kernel, args).into(),
        SyscallNumber::SemAcquire => sys_sem(kernel, args, Kernel::semaphore_acquire).into(),
        SyscallNumber::SemRelease => sys_sem(kernel, args, Kernel::semaphore_release).into(),
    }
}

// Individual syscall implementations
fn sys_wait(kernel: &Kernel) -> Result<Pid, SyscallError> {
    Ok(kernel.wait()?)
}

fn sys_kill(kernel: &Kernel, args: SyscallArgs) -> Result<i32, SyscallError> {
    kernel.kill(args.int(0))?;
    Ok(0)
}

fn sys_sbrk(kernel: &Kernel, args: SyscallArgs) -> Result<i64, SyscallError> {
    let n = args.arg0 as i64 as isize;
    let addr = kernel.growproc(n)?;
    Ok(addr as i64)
}

fn sys_sleep(kernel: &Kernel, args: SyscallArgs) -> Result<i32, SyscallError> {
    let n = args.int(0);
    if n < 0 {
        return Err(SyscallError::InvalidArgument);
    }
    kernel.sleep_ticks(n as u64)?;
    Ok(0)
}

fn sys_get_parent_pid(kernel: &Kernel) -> Result<Pid, SyscallError> {
    Ok(kernel.get_parent_pid()?)
}

fn sys_get_callers(kernel: &Kernel, args: SyscallArgs) -> Result<i32, SyscallError> {
    let number = SyscallNumber::try_from(args.arg0)?;
    let line = {
        let log = kernel.callers.lock();
        let pids = log.callers(number);
        if pids.is_empty() {
            None
        } else {
            Some(pids.iter().map(|pid| pid.to_string()).collect::<Vec<_>>().join(", "))
        }
    };
    match line {
        Some(line) => kprintln!(kernel.console(), "{}", line),
        None => kprintln!(
            kernel.console(),
            "There is no process which has called system call {}",
            number.as_u64()
        ),
    }
    Ok(0)
}

fn sys_change_process_queue(kernel: &Kernel, args: SyscallArgs) -> Result<i32, SyscallError> {
    kernel.change_process_queue(args.int(0), args.int(1))?;
    Ok(0)
}

fn sys_set_ticket(kernel: &Kernel, args: SyscallArgs) -> Result<i32, SyscallError> {
    kernel.set_ticket(args.int(0), args.int(1))?;
    Ok(0)
}

fn semaphore_id(args: SyscallArgs) -> Result<usize, SyscallError> {
    usize::try_from(args.int(0)).map_err(|_| SyscallError::Process(ProcessError::InvalidSemaphore))
}

fn sys_sem_init(kernel: &Kernel, args: SyscallArgs) -> Result<i32, SyscallError> {
    kernel.semaphore_init(semaphore_id(args)?, args.int(1))?;
    Ok(0)
}

fn sys_sem(
    kernel: &Kernel,
    args: SyscallArgs,
    op: fn(&Kernel, usize) -> Result<(), ProcessError>,
) -> Result<i32, SyscallError> {
    op(kernel, semaphore_id(args)?)?;
    Ok(0)
}

impl Kernel {
    /// Trap into the kernel from the current process
    pub(crate) fn syscall(&self, number: SyscallNumber, args: SyscallArgs) -> i64 {
        self.record_caller(number);
        let result = handle_syscall(self, number, args);
        if let SyscallResult::Error(err) = result {
            log::debug!("syscall {:?} failed: {}", number, err);
        }
        self.trap_return();
        result.into()
    }

    fn record_caller(&self, number: SyscallNumber) {
        let pid = self.getpid();
        self.callers.lock().record(number, pid);
    }
}

/// The system call interface a user program sees.
///
/// Every method traps into the kernel on behalf of the calling process and
/// returns what the user-level wrapper would: -1 on failure.
pub struct Sys {
    kernel: Arc<Kernel>,
}

impl Sys {
    pub(crate) fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    fn call(&self, number: SyscallNumber, args: &[i64]) -> i64 {
        self.kernel.syscall(number, SyscallArgs::new(args))
    }

    /// Raw syscall by number
    pub fn syscall(&self, number: u64, args: SyscallArgs) -> i64 {
        match SyscallNumber::try_from(number) {
            Ok(number) => self.kernel.syscall(number, args),
            Err(_) => {
                log::warn!("unknown sys call {}", number);
                -1
            }
        }
    }

    /// Create a child running `child`; returns its pid, or -1.
    pub fn fork<F>(&self, child: F) -> Pid
    where
        F: FnOnce(&Sys) + Send + 'static,
    {
        self.kernel.record_caller(SyscallNumber::Fork);
        let pid = match self.kernel.fork(Box::new(child)) {
            Ok(pid) => pid,
            Err(err) => {
                log::debug!("fork failed: {}", err);
                -1
            }
        };
        self.kernel.trap_return();
        pid
    }

    pub fn exit(&self) -> ! {
        self.call(SyscallNumber::Exit, &[]);
        unreachable!("exit returned")
    }

    pub fn wait(&self) -> Pid {
        self.call(SyscallNumber::Wait, &[]) as Pid
    }

    pub fn kill(&self, pid: Pid) -> i32 {
        self.call(SyscallNumber::Kill, &[pid as i64]) as i32
    }

    pub fn getpid(&self) -> Pid {
        self.call(SyscallNumber::GetPid, &[]) as Pid
    }

    pub fn get_parent_pid(&self) -> Pid {
        self.call(SyscallNumber::GetParentPid, &[]) as Pid
    }

    /// Grow memory by n bytes; returns the old break, or -1
    pub fn sbrk(&self, n: isize) -> i64 {
        self.call(SyscallNumber::Sbrk, &[n as i64])
    }

    pub fn sleep(&self, ticks: i32) -> i32 {
        self.call(SyscallNumber::Sleep, &[ticks as i64]) as i32
    }

    pub fn uptime(&self) -> u64 {
        self.call(SyscallNumber::Uptime, &[]) as u64
    }

    pub fn yield_now(&self) {
        self.call(SyscallNumber::Yield, &[]);
    }

    pub fn get_callers(&self, number: u64) -> i32 {
        self.call(SyscallNumber::GetCallers, &[number as i64]) as i32
    }

    pub fn change_process_queue(&self, pid: Pid, level: i32) -> i32 {
        self.call(SyscallNumber::ChangeProcessQueue, &[pid as i64, level as i64]) as i32
    }

    pub fn set_ticket(&self, pid: Pid, ticket: i32) -> i32 {
        self.call(SyscallNumber::SetTicket, &[pid as i64, ticket as i64]) as i32
    }

    pub fn set_bjf_ratios(&self, pid: Pid, priority: i32, arrival: i32, exec: i32) -> i32 {
        let args = [pid as i64, priority as i64, arrival as i64, exec as i64];
        self.call(SyscallNumber::SetBjfProcess, &args) as i32
    }

    pub fn set_bjf_ratios_all(&self, priority: i32, arrival: i32, exec: i32) -> i32 {
        let args = [priority as i64, arrival as i64, exec as i64];
        self.call(SyscallNumber::SetBjfKernel, &args) as i32
    }

    pub fn print_information(&self) -> i32 {
        self.call(SyscallNumber::PrintInformation, &[]) as i32
    }

    pub fn procdump(&self) -> i32 {
        self.call(SyscallNumber::Procdump, &[]) as i32
    }

    pub fn sem_init(&self, id: i32, value: i32) -> i32 {
        self.call(SyscallNumber::SemInit, &[id as i64, value as i64]) as i32
    }

    pub fn sem_acquire(&self, id: i32) -> i32 {
        self.call(SyscallNumber::SemAcquire, &[id as i64]) as i32
    }

    pub fn sem_release(&self, id: i32) -> i32 {
        self.call(SyscallNumber::SemRelease, &[id as i64]) as i32
    }

    /// Power the machine off; `Kernel::join` returns `Ok(code)`
    pub fn shutdown(&self, code: i32) -> ! {
        self.call(SyscallNumber::Shutdown, &[code as i64]);
        unreachable!("shutdown returned")
    }

    /// A point where a pending timer interrupt may preempt the caller
    pub fn preempt_point(&self) {
        self.kernel.trap_return();
    }

    /// Write one line on the console, for `kprintln!(sys, ...)`
    pub fn write_line(&self, args: fmt::Arguments) {
        self.kernel.console().write_line(args);
    }
}
