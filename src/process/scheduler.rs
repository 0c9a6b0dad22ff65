// Multilevel process scheduler for MLQOS
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::kernel::{unwind, Kernel, Unwind};
use crate::param::{AGING_THRESHOLD, EXEC_CYCLE_STEP};
use crate::process::context::swtch;
use crate::process::cpu::{bind_cpu, Cpu};
use crate::process::pcb::{Level, Proc, ProcState};
use crate::process::table::ProcTable;
use crate::sync::spinlock::SpinLockGuard;

/// Idle passes before an idle CPU naps instead of spinning
const IDLE_SPINS: u32 = 32;
const IDLE_NAP: Duration = Duration::from_micros(50);

fn runnable_at(table: &ProcTable, level: Level) -> impl Iterator<Item = (usize, &Proc)> {
    table
        .iter()
        .filter(move |(_, p)| p.state() == ProcState::Runnable && p.level == level)
}

/// Level 1: the process that has waited longest since it last ran
pub fn round_robin(table: &ProcTable, now: u64) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (slot, p) in runnable_at(table, Level::RoundRobin) {
        let waited = now as i64 - p.cpu_time as i64;
        if best.map_or(true, |(_, most)| waited > most) {
            best = Some((slot, waited));
        }
    }
    best.map(|(slot, _)| slot)
}

/// Level 2: a lottery over tickets, drawn with the tick counter
pub fn lottery(table: &ProcTable, now: u64) -> Option<usize> {
    let total: i64 = runnable_at(table, Level::Lottery).map(|(_, p)| p.ticket as i64).sum();
    if total <= 0 {
        return None;
    }
    let draw = (now % total as u64) as i64;
    let mut sum = 0;
    for (slot, p) in runnable_at(table, Level::Lottery) {
        sum += p.ticket as i64;
        if draw < sum {
            return Some(slot);
        }
    }
    None
}

/// Level 3: the smallest rank, first in table order on ties
pub fn best_job_first(table: &ProcTable) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (slot, p) in runnable_at(table, Level::BestJobFirst) {
        let rank = p.rank();
        if best.map_or(true, |(_, min)| rank < min) {
            best = Some((slot, rank));
        }
    }
    best.map(|(slot, _)| slot)
}

/// Age every runnable process; promote those that waited too long.
pub fn age(table: &mut ProcTable) {
    for (_, p) in table.iter_mut() {
        if p.state() != ProcState::Runnable {
            continue;
        }
        p.wait += 1;
        if p.wait >= AGING_THRESHOLD {
            p.level = Level::RoundRobin;
            p.wait = 0;
        }
    }
}

/// Pick the next process: level 1, then 2, then 3.
pub fn select(table: &ProcTable, now: u64) -> Option<(usize, Level)> {
    round_robin(table, now)
        .map(|slot| (slot, Level::RoundRobin))
        .or_else(|| lottery(table, now).map(|slot| (slot, Level::Lottery)))
        .or_else(|| best_job_first(table).map(|slot| (slot, Level::BestJobFirst)))
}

/// Account for a dispatch and mark the process RUNNING
pub fn dispatch(table: &mut ProcTable, slot: usize) {
    let p = table.get_mut(slot);
    p.cycle += 1;
    p.exec_cycle += EXEC_CYCLE_STEP;
    p.wait = 0;
    p.set_state(ProcState::Running);
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_switches: u64,
    pub idle_passes: u64,
}

#[derive(Default)]
pub(crate) struct SchedulerCounters {
    switches: AtomicU64,
    idle: AtomicU64,
}

impl SchedulerCounters {
    pub(crate) fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            total_switches: self.switches.load(Ordering::Relaxed),
            idle_passes: self.idle.load(Ordering::Relaxed),
        }
    }
}

impl Kernel {
    /// Per-CPU process scheduler.
    /// Each CPU calls scheduler() after setting itself up.
    /// Scheduler never returns until the machine halts. It loops, doing:
    ///  - choose a process to run
    ///  - swtch to start running that process
    ///  - eventually that process transfers control
    ///    via swtch back to the scheduler.
    pub(crate) fn scheduler(&self) {
        let cpu = self.cpus.mycpu();
        cpu.set_proc(None);
        let mut idle = 0u32;

        loop {
            // Enable interrupts on this processor.
            cpu.sti();
            if self.cpus.is_frozen() {
                return;
            }

            let mut table = self.ptable.lock();
            age(&mut table);
            let picked = select(&table, self.ticks());
            if let Some((slot, level)) = picked {
                // Switch to chosen process. It is the process's job
                // to release ptable.lock and then reacquire it
                // before jumping back to us.
                dispatch(&mut table, slot);
                cpu.set_proc(Some(slot));
                self.kthreads[slot].cpu.store(cpu.id, Ordering::SeqCst);
                self.sched_counters.switches.fetch_add(1, Ordering::Relaxed);
                log::trace!("cpu{}: pid {} from level {}", cpu.id, table.get(slot).pid, level.as_i32());

                swtch(&cpu.scheduler, &self.kthreads[slot].context);

                // Process is done running for now.
                cpu.set_proc(None);
            }
            drop(table);

            if picked.is_some() {
                idle = 0;
                continue;
            }
            self.sched_counters.idle.fetch_add(1, Ordering::Relaxed);
            idle += 1;
            if idle < IDLE_SPINS {
                thread::yield_now();
            } else {
                thread::sleep(IDLE_NAP);
            }
        }
    }

    /// Enter scheduler. Must hold only ptable.lock
    /// and have changed the current process's state.
    pub(crate) fn sched(&self, table: &SpinLockGuard<'_, ProcTable>) {
        let (me, cpu) = self.check_sched(table);
        let intena = cpu.intena();
        swtch(&self.kthreads[me].context, &cpu.scheduler);

        // possibly resumed on another cpu
        let id = self.kthreads[me].cpu.load(Ordering::SeqCst);
        bind_cpu(Some(id));
        self.cpus.get(id).set_intena(intena);
    }

    /// Leave the CPU for good. The scheduler releases ptable.lock
    /// once it is running again.
    pub(crate) fn sched_exit(&self, table: SpinLockGuard<'_, ProcTable>) -> ! {
        let (_, cpu) = self.check_sched(&table);
        mem::forget(table);
        cpu.scheduler.resume();
        bind_cpu(None);
        unwind(Unwind::Exited)
    }

    fn check_sched(&self, table: &SpinLockGuard<'_, ProcTable>) -> (usize, &Cpu) {
        let me = self.myproc();
        if !self.ptable.holding() {
            panic!("sched ptable.lock");
        }
        let cpu = self.cpus.mycpu();
        if cpu.ncli() != 1 {
            panic!("sched locks");
        }
        if table.get(me).state() == ProcState::Running {
            panic!("sched running");
        }
        if cpu.interrupts_enabled() {
            panic!("sched interruptible");
        }
        (me, cpu)
    }

    /// Give up the CPU for one scheduling round.
    pub(crate) fn yield_cpu(&self) {
        let me = self.myproc();
        let mut table = self.ptable.lock();
        let now = self.ticks();
        let p = table.get_mut(me);
        p.set_state(ProcState::Runnable);
        p.cpu_time = now;
        self.sched(&table);
    }

    /// A fork child's very first scheduling by scheduler()
    /// will swtch here.
    pub(crate) fn forkret(&self, slot: usize) {
        bind_cpu(Some(self.kthreads[slot].cpu.load(Ordering::SeqCst)));
        // Still holding ptable.lock from scheduler.
        unsafe { self.ptable.force_release() };
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.sched_counters.snapshot()
    }
}
