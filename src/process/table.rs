// Process table for MLQOS
use core::fmt::Write;

use crate::param::MAX_TICKET;
use crate::process::pcb::{BjfRatios, Channel, Level, Pid, Proc, ProcState, ProcessError};
use crate::services::memory_service::{AddressSpace, KStack};

/// Ticket generator (xorshift64*)
#[derive(Debug, Clone)]
pub struct TicketRng {
    state: u64,
}

impl TicketRng {
    pub fn new(seed: u64) -> Self {
        // xorshift must never hold zero
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Draw a ticket in 1..=MAX_TICKET, mixed with the current tick
    pub fn draw(&mut self, now: u64) -> i32 {
        let mixed = self.next_u64() ^ now.rotate_left(17);
        (mixed % MAX_TICKET as u64) as i32 + 1
    }
}

/// What a reaped zombie leaves behind for the collaborators to free
#[derive(Debug)]
pub struct Reaped {
    pub pid: Pid,
    pub kstack: Option<KStack>,
    pub address_space: Option<AddressSpace>,
}

/// Copy of one descriptor's observable fields
#[derive(Debug, Clone, PartialEq)]
pub struct ProcInfo {
    pub slot: usize,
    pub pid: Pid,
    pub parent_pid: Option<Pid>,
    pub name: String,
    pub state: ProcState,
    pub level: Level,
    pub ticket: i32,
    pub priority: f32,
    pub arrival_time: u64,
    pub exec_cycle: f32,
    pub wait: u32,
    pub cycle: u32,
    pub ratios: BjfRatios,
    pub killed: bool,
    pub sz: usize,
}

/// Fixed-capacity table of process descriptors
pub struct ProcTable {
    procs: Box<[Proc]>,
    next_pid: Pid,
    rng: TicketRng,
}

impl ProcTable {
    pub fn new(nproc: usize, seed: u64) -> Self {
        Self {
            procs: (0..nproc).map(|_| Proc::new()).collect(),
            next_pid: 1,
            rng: TicketRng::new(seed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.procs.len()
    }

    pub fn get(&self, slot: usize) -> &Proc {
        &self.procs[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Proc {
        &mut self.procs[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Proc)> {
        self.procs.iter().enumerate()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Proc)> {
        self.procs.iter_mut().enumerate()
    }

    /// Slot of the live process with this pid
    pub fn find(&self, pid: Pid) -> Option<usize> {
        if pid <= 0 {
            return None;
        }
        self.procs
            .iter()
            .position(|p| p.pid == pid && p.state() != ProcState::Unused)
    }

    pub fn children_of(&self, parent: usize) -> impl Iterator<Item = usize> + '_ {
        self.procs
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.parent == Some(parent))
            .map(|(slot, _)| slot)
    }

    pub fn count_in(&self, state: ProcState) -> usize {
        self.procs.iter().filter(|p| p.state() == state).count()
    }

    /// Every slot that is not UNUSED, in table order
    pub fn snapshot(&self) -> Vec<ProcInfo> {
        self.iter()
            .filter(|(_, p)| p.state() != ProcState::Unused)
            .map(|(slot, p)| ProcInfo {
                slot,
                pid: p.pid,
                parent_pid: p.parent.map(|parent| self.procs[parent].pid),
                name: p.name.clone(),
                state: p.state(),
                level: p.level,
                ticket: p.ticket,
                priority: p.priority,
                arrival_time: p.arrival_time,
                exec_cycle: p.exec_cycle,
                wait: p.wait,
                cycle: p.cycle,
                ratios: p.ratios,
                killed: p.killed,
                sz: p.sz,
            })
            .collect()
    }

    /// Look for an UNUSED slot and set it up as an EMBRYO with a fresh
    /// pid and default scheduling attributes.
    pub fn claim_slot(&mut self, now: u64) -> Option<usize> {
        let slot = self
            .procs
            .iter()
            .position(|p| p.state() == ProcState::Unused)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        let ticket = self.rng.draw(now);

        let p = &mut self.procs[slot];
        p.set_state(ProcState::Embryo);
        p.pid = pid;
        p.level = Level::default();
        p.ticket = ticket;
        p.priority = 1.0 / ticket as f32;
        p.arrival_time = now;
        p.exec_cycle = 0.0;
        p.wait = 0;
        p.cycle = 0;
        p.cpu_time = 0;
        p.ratios = BjfRatios::default();
        p.parent = None;
        p.chan = None;
        p.killed = false;
        p.sz = 0;
        Some(slot)
    }

    /// Roll an EMBRYO that could not be set up back to UNUSED
    pub fn abandon(&mut self, slot: usize) -> Option<KStack> {
        let p = &mut self.procs[slot];
        p.set_state(ProcState::Unused);
        p.pid = 0;
        p.parent = None;
        p.name.clear();
        p.address_space = None;
        p.sz = 0;
        p.kstack.take()
    }

    /// Clear a ZOMBIE's descriptor and hand back what it still owns
    pub fn reap(&mut self, slot: usize) -> Reaped {
        let p = &mut self.procs[slot];
        p.set_state(ProcState::Unused);
        let reaped = Reaped {
            pid: p.pid,
            kstack: p.kstack.take(),
            address_space: p.address_space.take(),
        };
        p.pid = 0;
        p.parent = None;
        p.name.clear();
        p.killed = false;
        p.sz = 0;
        reaped
    }

    /// Wake up all processes sleeping on chan.
    /// The table lock must be held.
    pub fn wakeup1(&mut self, chan: Channel) {
        for p in self.procs.iter_mut() {
            if p.state() == ProcState::Sleeping && p.chan == Some(chan) {
                p.set_state(ProcState::Runnable);
            }
        }
    }

    /// Kill the process with the given pid.
    /// Process won't exit until it returns to user space.
    pub fn kill(&mut self, pid: Pid) -> Result<(), ProcessError> {
        let slot = self.find(pid).ok_or(ProcessError::ProcessNotFound)?;
        let p = &mut self.procs[slot];
        p.killed = true;
        // Wake process from sleep if necessary.
        if p.state() == ProcState::Sleeping {
            p.set_state(ProcState::Runnable);
        }
        Ok(())
    }

    pub fn change_level(&mut self, pid: Pid, level: i32) -> Result<(), ProcessError> {
        let level = Level::try_from(level)?;
        let slot = self.find(pid).ok_or(ProcessError::ProcessNotFound)?;
        let p = &mut self.procs[slot];
        p.level = level;
        p.wait = 0;
        Ok(())
    }

    /// Replace a ticket count. `priority` keeps its allocation-time value.
    pub fn set_ticket(&mut self, pid: Pid, ticket: i32) -> Result<(), ProcessError> {
        let slot = self.find(pid).ok_or(ProcessError::ProcessNotFound)?;
        if !(1..=MAX_TICKET).contains(&ticket) {
            return Err(ProcessError::InvalidTicket);
        }
        self.procs[slot].ticket = ticket;
        Ok(())
    }

    /// Set one process's BJF ratios. An unknown pid is ignored.
    pub fn set_ratios(&mut self, pid: Pid, ratios: BjfRatios) {
        if let Some(slot) = self.find(pid) {
            self.procs[slot].ratios = ratios;
        }
    }

    pub fn set_ratios_all(&mut self, ratios: BjfRatios) {
        for p in self.procs.iter_mut() {
            p.ratios = ratios;
        }
    }

    /// The scheduling report printed by print_information
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<16}{:<7}{:<10}{:<15}{:<17}{:<10}{:<7}{:<7}{:<7}{:<8}{}",
            "name", "pid", "state", "queue-level", "arrivaltime", "ticket", "P_R", "A_R", "E_R", "rank",
            "cycle"
        );
        let _ = writeln!(out, "{}", "-".repeat(111));
        for p in self.procs.iter().filter(|p| !p.name.is_empty()) {
            let _ = writeln!(
                out,
                "{:<16}{:<7}{:<10}{:<15}{:<17}{:<10}{:<7}{:<7}{:<7}{:<8}{}",
                p.name,
                p.pid,
                p.state().name(),
                p.level.as_i32(),
                p.arrival_time,
                p.ticket,
                p.ratios.priority,
                p.ratios.arrival_time,
                p.ratios.exec_cycle,
                p.rank() as i64,
                p.cycle
            );
        }
        out
    }

    /// Print a process listing. No lock is needed by the caller.
    pub fn render_dump(&self) -> String {
        let mut out = String::new();
        for p in self.procs.iter().filter(|p| p.state() != ProcState::Unused) {
            let _ = writeln!(out, "{} {} {}", p.pid, p.state().short_name(), p.name);
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Claim a slot and push it to RUNNABLE with the given level and ticket
    pub(crate) fn runnable(table: &mut ProcTable, level: Level, ticket: i32) -> usize {
        let slot = table.claim_slot(0).unwrap();
        let p = table.get_mut(slot);
        p.set_state(ProcState::Runnable);
        p.level = level;
        p.ticket = ticket;
        p.name = format!("p{}", p.pid);
        slot
    }

    #[test]
    fn claims_fresh_pids_and_defaults() {
        let mut table = ProcTable::new(4, 7);
        let a = table.claim_slot(5).unwrap();
        let b = table.claim_slot(6).unwrap();
        let (pa, pb) = (table.get(a), table.get(b));
        assert_eq!((pa.pid, pb.pid), (1, 2));
        assert_eq!(pa.state(), ProcState::Embryo);
        assert_eq!(pa.level, Level::Lottery);
        assert_eq!(pa.arrival_time, 5);
        assert!((1..=MAX_TICKET).contains(&pa.ticket));
        assert_eq!(pa.priority, 1.0 / pa.ticket as f32);
        assert_eq!(pa.ratios, BjfRatios::default());
    }

    #[test]
    fn full_table_has_no_slot() {
        let mut table = ProcTable::new(2, 1);
        assert!(table.claim_slot(0).is_some());
        assert!(table.claim_slot(0).is_some());
        assert_eq!(table.claim_slot(0), None);
    }

    #[test]
    fn abandoned_slot_is_reusable_with_new_pid() {
        let mut table = ProcTable::new(1, 1);
        let slot = table.claim_slot(0).unwrap();
        table.abandon(slot);
        assert!(table.get(slot).is_free());
        let again = table.claim_slot(0).unwrap();
        assert_eq!(table.get(again).pid, 2);
    }

    #[test]
    fn wakeup_is_a_broadcast_on_one_channel() {
        let mut table = ProcTable::new(4, 1);
        let mut sleepers = Vec::new();
        for chan in [Channel::Ticks, Channel::Ticks, Channel::Semaphores] {
            let slot = runnable(&mut table, Level::Lottery, 1);
            let p = table.get_mut(slot);
            p.set_state(ProcState::Running);
            p.set_state(ProcState::Sleeping);
            p.chan = Some(chan);
            sleepers.push(slot);
        }
        table.wakeup1(Channel::Ticks);
        assert_eq!(table.get(sleepers[0]).state(), ProcState::Runnable);
        assert_eq!(table.get(sleepers[1]).state(), ProcState::Runnable);
        assert_eq!(table.get(sleepers[2]).state(), ProcState::Sleeping);
    }

    #[test]
    fn kill_wakes_a_sleeper() {
        let mut table = ProcTable::new(2, 1);
        let slot = runnable(&mut table, Level::Lottery, 1);
        let pid = table.get(slot).pid;
        let p = table.get_mut(slot);
        p.set_state(ProcState::Running);
        p.set_state(ProcState::Sleeping);
        assert_eq!(table.kill(pid), Ok(()));
        assert!(table.get(slot).killed);
        assert_eq!(table.get(slot).state(), ProcState::Runnable);
        assert_eq!(table.kill(99), Err(ProcessError::ProcessNotFound));
    }

    #[test]
    fn change_level_resets_wait() {
        let mut table = ProcTable::new(2, 1);
        let slot = runnable(&mut table, Level::Lottery, 1);
        let pid = table.get(slot).pid;
        table.get_mut(slot).wait = 1234;
        assert_eq!(table.change_level(pid, 3), Ok(()));
        assert_eq!(table.get(slot).level, Level::BestJobFirst);
        assert_eq!(table.get(slot).wait, 0);
        assert_eq!(table.change_level(pid, 7), Err(ProcessError::InvalidLevel));
        assert_eq!(table.get(slot).level, Level::BestJobFirst);
    }

    #[test]
    fn set_ticket_keeps_priority() {
        let mut table = ProcTable::new(2, 1);
        let slot = table.claim_slot(0).unwrap();
        let pid = table.get(slot).pid;
        let priority = table.get(slot).priority;
        assert_eq!(table.set_ticket(pid, 42), Ok(()));
        assert_eq!(table.get(slot).ticket, 42);
        assert_eq!(table.get(slot).priority, priority);
        assert_eq!(table.set_ticket(pid, 0), Err(ProcessError::InvalidTicket));
        assert_eq!(table.set_ticket(77, 5), Err(ProcessError::ProcessNotFound));
    }

    #[test]
    fn ratios_on_unknown_pid_are_ignored() {
        let mut table = ProcTable::new(2, 1);
        let slot = table.claim_slot(0).unwrap();
        table.set_ratios(99, BjfRatios::new(5.0, 5.0, 5.0));
        assert_eq!(table.get(slot).ratios, BjfRatios::default());
        table.set_ratios_all(BjfRatios::new(2.0, 3.0, 4.0));
        assert_eq!(table.get(slot).ratios, BjfRatios::new(2.0, 3.0, 4.0));
        assert_eq!(table.get(1).ratios, BjfRatios::new(2.0, 3.0, 4.0));
    }

    #[test]
    fn report_lists_named_processes() {
        let mut table = ProcTable::new(3, 1);
        let slot = runnable(&mut table, Level::BestJobFirst, 10);
        table.get_mut(slot).name = "init".to_string();
        let report = table.render_report();
        let lines: Vec<_> = report.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("name"));
        assert!(lines[2].starts_with("init"));
        assert!(lines[2].contains("RUNNABLE"));
        assert_eq!(table.render_dump(), "1 runble init\n");
    }

    #[test]
    fn tickets_stay_in_range() {
        let mut rng = TicketRng::new(0);
        for now in 0..1000 {
            assert!((1..=MAX_TICKET).contains(&rng.draw(now)));
        }
    }
}
