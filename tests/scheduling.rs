use std::sync::{Arc, Mutex};

use mlqos::programs::cpu_burners;
use mlqos::{BjfRatios, Kernel, KernelConfig, Level, ProcInfo};

fn config() -> KernelConfig {
    KernelConfig::default().with_semaphore_tracing(false)
}

/// The fields only administrative calls change
fn admin_view(procs: &[ProcInfo]) -> Vec<(i32, Level, i32, BjfRatios, String)> {
    procs
        .iter()
        .map(|p| (p.pid, p.level, p.ticket, p.ratios, p.name.clone()))
        .collect()
}

#[test]
fn unknown_pid_leaves_the_table_alone() {
    let kernel = Kernel::new(config()).unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    let views = Arc::new(Mutex::new(Vec::new()));
    {
        let (results, views, k) = (results.clone(), views.clone(), kernel.clone());
        kernel
            .boot(move |sys| {
                sys.sem_init(0, 0);
                let child = sys.fork(|sys| {
                    sys.sem_acquire(0);
                });
                let before = admin_view(&k.processes());
                let mut r = Vec::new();
                r.push(sys.change_process_queue(999, 1));
                r.push(sys.set_ticket(999, 10));
                r.push(sys.kill(999));
                // ratios on an unknown pid are accepted and ignored
                r.push(sys.set_bjf_ratios(999, 4, 4, 4));
                let after = admin_view(&k.processes());
                *results.lock().unwrap() = r;
                *views.lock().unwrap() = vec![before, after];
                sys.sem_release(0);
                assert_eq!(sys.wait(), child);
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    assert_eq!(*results.lock().unwrap(), vec![-1, -1, -1, 0]);
    let views = views.lock().unwrap();
    assert_eq!(views[0], views[1]);
    assert_eq!(views[0].len(), 2);
}

#[test]
fn administrative_calls_reach_the_descriptor() {
    let kernel = Kernel::new(config()).unwrap();
    let seen = Arc::new(Mutex::new(None));
    {
        let (seen, k) = (seen.clone(), kernel.clone());
        kernel
            .boot(move |sys| {
                sys.sem_init(0, 0);
                let child = sys.fork(|sys| {
                    sys.sem_acquire(0);
                });
                let priority = k.process(child).unwrap().priority;
                let calls = [
                    sys.change_process_queue(child, 3),
                    sys.change_process_queue(child, 0),
                    sys.change_process_queue(child, 4),
                    sys.set_ticket(child, 50),
                    sys.set_ticket(child, 0),
                    sys.set_ticket(child, 101),
                    sys.set_bjf_ratios(child, 2, 3, 4),
                ];
                let info = k.process(child).unwrap();
                *seen.lock().unwrap() = Some((calls, info, priority));
                sys.sem_release(0);
                sys.wait();
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    let (calls, info, priority) = seen.lock().unwrap().take().unwrap();
    assert_eq!(calls, [0, -1, -1, 0, -1, -1, 0]);
    assert_eq!(info.level, Level::BestJobFirst);
    assert_eq!(info.ticket, 50);
    assert_eq!(info.priority, priority);
    assert_eq!(info.ratios, BjfRatios::new(2.0, 3.0, 4.0));
}

#[test]
fn kernel_wide_ratios_reach_every_process() {
    let kernel = Kernel::new(config()).unwrap();
    let ratios = Arc::new(Mutex::new(Vec::new()));
    {
        let (ratios, k) = (ratios.clone(), kernel.clone());
        kernel
            .boot(move |sys| {
                sys.sem_init(0, 0);
                sys.fork(|sys| {
                    sys.sem_acquire(0);
                });
                sys.set_bjf_ratios_all(5, 6, 7);
                *ratios.lock().unwrap() = k.processes().iter().map(|p| p.ratios).collect();
                sys.sem_release(0);
                sys.wait();
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    let ratios = ratios.lock().unwrap();
    assert_eq!(ratios.len(), 2);
    assert!(ratios.iter().all(|&r| r == BjfRatios::new(5.0, 6.0, 7.0)));
}

#[test]
fn starved_process_is_promoted_by_aging() {
    // one cpu and no timer: the parent hogs level 1 and yields by hand
    let config = config().with_cpus(1).with_tick_interval(None);
    let kernel = Kernel::new(config).unwrap();
    let promoted_after = Arc::new(Mutex::new(None));
    {
        let (promoted_after, k) = (promoted_after.clone(), kernel.clone());
        kernel
            .boot(move |sys| {
                let me = sys.getpid();
                sys.change_process_queue(me, 1);
                let child = sys.fork(|_| {});
                sys.change_process_queue(child, 3);
                for round in 0..20_000 {
                    if k.process(child).map(|p| p.level) == Some(Level::RoundRobin) {
                        *promoted_after.lock().unwrap() = Some(round);
                        break;
                    }
                    sys.yield_now();
                }
                sys.wait();
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    let rounds = promoted_after.lock().unwrap().take().expect("never promoted");
    assert!(rounds >= 7_900, "promoted after {} rounds", rounds);
}

#[test]
fn cpu_bound_children_all_finish() {
    let kernel = Kernel::new(config()).unwrap();
    let reaped = Arc::new(Mutex::new(0));
    {
        let reaped = reaped.clone();
        kernel
            .boot(move |sys| {
                *reaped.lock().unwrap() = cpu_burners(sys, 5, 200_000);
            })
            .unwrap();
    }
    assert_eq!(kernel.join(), Ok(0));
    assert_eq!(*reaped.lock().unwrap(), 5);
    assert!(kernel.scheduler_stats().total_switches >= 6);
}

#[test]
fn report_lists_every_process() {
    let kernel = Kernel::new(config()).unwrap();
    kernel
        .boot(|sys| {
            sys.sem_init(0, 0);
            sys.fork(|sys| {
                sys.sem_acquire(0);
            });
            sys.print_information();
            sys.procdump();
            sys.sem_release(0);
            sys.wait();
        })
        .unwrap();
    assert_eq!(kernel.join(), Ok(0));
    let lines = kernel.console().drain();
    let header = lines.iter().position(|l| l.starts_with("name")).unwrap();
    assert_eq!(lines[header + 1], "-".repeat(111));
    let rows: Vec<_> = lines[header + 2..]
        .iter()
        .take_while(|l| l.starts_with("initcode"))
        .collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].contains("RUNNING"));
    assert!(lines.iter().any(|l| l == "1 run    initcode"));
}
