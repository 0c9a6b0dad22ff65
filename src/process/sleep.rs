// Sleep and wakeup for MLQOS
use crate::kernel::Kernel;
use crate::process::pcb::{Channel, ProcState};
use crate::process::table::ProcTable;
use crate::sync::spinlock::SpinLockGuard;

impl Kernel {
    /// Atomically release lock and sleep on chan.
    /// Reacquires lock when awakened.
    pub fn sleep<'a, T>(&self, chan: Channel, lk: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let me = self.myproc();

        // Must acquire ptable.lock in order to change the state and then
        // call sched. Once we hold ptable.lock, we can be guaranteed that
        // we won't miss any wakeup (wakeup runs with ptable.lock locked),
        // so it's okay to release lk.
        let mut table = self.ptable.lock();
        let lk = SpinLockGuard::unlock(lk);

        let p = table.get_mut(me);
        p.chan = Some(chan);
        p.set_state(ProcState::Sleeping);
        log::trace!("pid {} sleeps on {:?}", p.pid, chan);

        self.sched(&table);

        // Tidy up.
        table.get_mut(me).chan = None;
        drop(table);

        lk.lock()
    }

    /// sleep() for callers that already hold ptable.lock.
    pub(crate) fn sleep_locked<'a>(
        &self,
        chan: Channel,
        mut table: SpinLockGuard<'a, ProcTable>,
    ) -> SpinLockGuard<'a, ProcTable> {
        let me = self.myproc();
        let p = table.get_mut(me);
        p.chan = Some(chan);
        p.set_state(ProcState::Sleeping);

        self.sched(&table);

        table.get_mut(me).chan = None;
        table
    }

    /// Wake up all processes sleeping on chan.
    pub fn wakeup(&self, chan: Channel) {
        self.ptable.lock().wakeup1(chan);
    }
}
