use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mlqos::param::{NPHILOSOPHERS, ROOM_SEMAPHORE};
use mlqos::programs::{dining_philosophers, DiningTable};
use mlqos::{Kernel, KernelConfig};

fn config() -> KernelConfig {
    KernelConfig::default().with_semaphore_tracing(false)
}

#[test]
fn binary_semaphore_excludes() {
    let kernel = Kernel::new(config()).unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));
    {
        let (inside, peak, entries) = (inside.clone(), peak.clone(), entries.clone());
        kernel
            .boot(move |sys| {
                sys.sem_init(0, 1);
                for _ in 0..4 {
                    let (inside, peak, entries) = (inside.clone(), peak.clone(), entries.clone());
                    sys.fork(move |sys| {
                        for _ in 0..25 {
                            assert_eq!(sys.sem_acquire(0), 0);
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            entries.fetch_add(1, Ordering::SeqCst);
                            sys.yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                            assert_eq!(sys.sem_release(0), 0);
                        }
                    });
                }
                while sys.wait() > 0 {}
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(entries.load(Ordering::SeqCst), 100);
    assert_eq!(kernel.semaphores().value(0), Some(1));
    assert_eq!(kernel.semaphores().waiting(0), Some(0));
}

#[test]
fn counting_semaphore_admits_its_value() {
    let kernel = Kernel::new(config().with_cpus(4)).unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let (inside, peak) = (inside.clone(), peak.clone());
        kernel
            .boot(move |sys| {
                sys.sem_init(1, 2);
                for _ in 0..5 {
                    let (inside, peak) = (inside.clone(), peak.clone());
                    sys.fork(move |sys| {
                        for _ in 0..10 {
                            sys.sem_acquire(1);
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            sys.sleep(1);
                            inside.fetch_sub(1, Ordering::SeqCst);
                            sys.sem_release(1);
                        }
                    });
                }
                while sys.wait() > 0 {}
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak {}", peak);
}

#[test]
fn release_hands_over_to_the_latest_waiter() {
    // one cpu, no timer: the order of events is fixed
    let kernel = Kernel::new(config().with_cpus(1).with_tick_interval(None)).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = order.clone();
        kernel
            .boot(move |sys| {
                sys.sem_init(2, 0);
                let mut pids = Vec::new();
                for _ in 0..3 {
                    let order = order.clone();
                    pids.push(sys.fork(move |sys| {
                        sys.sem_acquire(2);
                        let me = sys.getpid();
                        order.lock().unwrap().push(me);
                    }));
                    // let the child block before forking the next one
                    sys.change_process_queue(sys.getpid(), 3);
                    sys.yield_now();
                    sys.change_process_queue(sys.getpid(), 2);
                }
                for _ in 0..3 {
                    sys.sem_release(2);
                    sys.wait();
                }
                order.lock().unwrap().insert(0, pids[2]);
                order.lock().unwrap().insert(1, pids[1]);
                order.lock().unwrap().insert(2, pids[0]);
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    let order = order.lock().unwrap();
    // expected (latest first) followed by what happened
    assert_eq!(order[..3], order[3..]);
}

#[test]
fn a_killed_waiter_leaves_the_semaphore() {
    let kernel = Kernel::new(config()).unwrap();
    let acquired = Arc::new(Mutex::new(None));
    {
        let (acquired, k) = (acquired.clone(), kernel.clone());
        kernel
            .boot(move |sys| {
                sys.sem_init(3, 0);
                let child = {
                    let acquired = acquired.clone();
                    sys.fork(move |sys| {
                        *acquired.lock().unwrap() = Some(sys.sem_acquire(3));
                    })
                };
                while k.semaphores().waiting(3) != Some(1) {
                    sys.sleep(1);
                }
                sys.kill(child);
                assert_eq!(sys.wait(), child);
                assert_eq!(k.semaphores().waiting(3), Some(0));
                assert_eq!(k.semaphores().value(3), Some(0));
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    // a killed process exits on its way out of the call
    assert_eq!(*acquired.lock().unwrap(), None);
}

#[test]
fn invalid_semaphores_are_rejected() {
    let kernel = Kernel::new(config()).unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    {
        let results = results.clone();
        kernel
            .boot(move |sys| {
                let r = vec![
                    sys.sem_init(6, 1),
                    sys.sem_init(-1, 1),
                    sys.sem_init(0, -3),
                    sys.sem_acquire(6),
                    sys.sem_release(42),
                    sys.sem_init(ROOM_SEMAPHORE as i32, 4),
                ];
                *results.lock().unwrap() = r;
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    assert_eq!(*results.lock().unwrap(), vec![-1, -1, -1, -1, -1, 0]);
}

#[test]
fn philosophers_never_all_hold_their_left_fork() {
    let kernel = Kernel::new(config()).unwrap();
    let table = DiningTable::new();
    {
        let table = table.clone();
        kernel
            .boot(move |sys| dining_philosophers(sys, table, 3, 1))
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    assert!(table.peak_left_holders() <= NPHILOSOPHERS - 1);
    assert!(table.peak_eating() <= 2);
    assert_eq!(table.meals(), [3; NPHILOSOPHERS]);
    assert_eq!(kernel.semaphores().value(ROOM_SEMAPHORE), Some(4));
}

#[test]
fn philosophers_trace_their_forks() {
    let kernel = Kernel::new(KernelConfig::default().with_semaphore_tracing(true)).unwrap();
    kernel
        .boot(|sys| dining_philosophers(sys, DiningTable::new(), 1, 1))
        .unwrap();
    assert_eq!(kernel.join(), Ok(0));
    let lines = kernel.console().drain();
    let acquired = lines.iter().filter(|l| l.contains(" acquired ")).count();
    let released = lines.iter().filter(|l| l.contains(" released ")).count();
    // two forks each, the room is not traced
    assert_eq!(acquired, 2 * NPHILOSOPHERS);
    assert_eq!(released, 2 * NPHILOSOPHERS);
    for line in lines.iter().filter(|l| l.contains(" acquired ") || l.contains(" released ")) {
        let words: Vec<&str> = line.split(' ').collect();
        assert_eq!(words.len(), 4, "{}", line);
        assert_eq!(words[0], "process");
        assert!(words[1].parse::<i32>().unwrap() > 1, "{}", line);
        assert!(words[3].parse::<usize>().unwrap() < NPHILOSOPHERS, "{}", line);
    }
}
