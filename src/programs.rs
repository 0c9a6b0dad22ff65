// User programs shipped with MLQOS
//
// Each program is an ordinary function over the syscall handle, so it can be
// passed to `Kernel::boot` directly or run inside a forked child.
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::kprintln;
use crate::param::{NPHILOSOPHERS, ROOM_SEMAPHORE};
use crate::process::pcb::Pid;
use crate::syscalls::Sys;

/// Observations of one dining-philosophers run.
///
/// Philosophers report here right after taking their left fork and right
/// before putting it down, so `peak_left_holders` never overstates how many
/// left forks were held at once.
#[derive(Debug, Default)]
pub struct DiningTable {
    left_holders: AtomicUsize,
    peak_left_holders: AtomicUsize,
    eating: AtomicUsize,
    peak_eating: AtomicUsize,
    meals: [AtomicUsize; NPHILOSOPHERS],
}

impl DiningTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn took_left(&self) {
        let now = self.left_holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_left_holders.fetch_max(now, Ordering::SeqCst);
    }

    fn put_left(&self) {
        self.left_holders.fetch_sub(1, Ordering::SeqCst);
    }

    fn start_eating(&self, philosopher: usize) {
        let now = self.eating.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_eating.fetch_max(now, Ordering::SeqCst);
        self.meals[philosopher].fetch_add(1, Ordering::SeqCst);
    }

    fn stop_eating(&self) {
        self.eating.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak_left_holders(&self) -> usize {
        self.peak_left_holders.load(Ordering::SeqCst)
    }

    pub fn peak_eating(&self) -> usize {
        self.peak_eating.load(Ordering::SeqCst)
    }

    pub fn meals(&self) -> [usize; NPHILOSOPHERS] {
        let mut meals = [0; NPHILOSOPHERS];
        for (count, meal) in meals.iter_mut().zip(&self.meals) {
            *count = meal.load(Ordering::SeqCst);
        }
        meals
    }
}

fn philosopher(sys: &Sys, seat: usize, table: &DiningTable, meals: usize, eat_ticks: i32) {
    let left = seat as i32;
    let right = ((seat + 1) % NPHILOSOPHERS) as i32;
    let room = ROOM_SEMAPHORE as i32;
    for _ in 0..meals {
        sys.sem_acquire(room);
        sys.sem_acquire(left);
        table.took_left();
        sys.sem_acquire(right);

        table.start_eating(seat);
        sys.sleep(eat_ticks);
        table.stop_eating();

        table.put_left();
        sys.sem_release(left);
        sys.sem_release(right);
        sys.sem_release(room);
        // think
        sys.sleep(eat_ticks);
    }
}

/// Five philosophers around five forks, with a room that seats four.
/// Returns once every philosopher has been reaped.
pub fn dining_philosophers(sys: &Sys, table: Arc<DiningTable>, meals: usize, eat_ticks: i32) {
    for fork in 0..NPHILOSOPHERS as i32 {
        sys.sem_init(fork, 1);
    }
    sys.sem_init(ROOM_SEMAPHORE as i32, NPHILOSOPHERS as i32 - 1);

    for seat in 0..NPHILOSOPHERS {
        let table = table.clone();
        let pid = sys.fork(move |sys| philosopher(sys, seat, &table, meals, eat_ticks));
        if pid < 0 {
            kprintln!(sys, "philosopher {}: fork failed", seat);
        }
    }
    while sys.wait() != -1 {}
}

/// A parent, a child and a grandchild each report their parent's pid.
/// Returns the pids seen, as (pid, parent pid) pairs, in print order.
pub fn family_tree(sys: &Sys) -> Vec<(Pid, Pid)> {
    let seen = Arc::new(spin::Mutex::new(Vec::new()));
    let record = seen.clone();
    sys.fork(move |sys| {
        let me = (sys.getpid(), sys.get_parent_pid());
        kprintln!(sys, "second process pid: {} , parent: {}", me.0, me.1);
        record.lock().push(me);
        let record = record.clone();
        sys.fork(move |sys| {
            let me = (sys.getpid(), sys.get_parent_pid());
            kprintln!(sys, "third process pid: {} , parent: {}", me.0, me.1);
            record.lock().push(me);
        });
        sys.wait();
    });
    sys.wait();
    let seen = seen.lock().clone();
    seen
}

/// Fork `workers` CPU-bound children and wait for all of them.
/// Returns how many were reaped.
pub fn cpu_burners(sys: &Sys, workers: usize, iterations: u64) -> usize {
    for _ in 0..workers {
        sys.fork(move |sys| {
            let mut x = 1_000_000f32;
            for i in 0..iterations {
                x /= 1.001;
                if i % 1024 == 0 {
                    sys.preempt_point();
                }
            }
            core::hint::black_box(x);
        });
    }
    let mut reaped = 0;
    while sys.wait() >= 0 {
        reaped += 1;
    }
    reaped
}
