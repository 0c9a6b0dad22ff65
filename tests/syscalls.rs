use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use mlqos::param::PGSIZE;
use mlqos::programs::family_tree;
use mlqos::syscalls::SyscallArgs;
use mlqos::{Kernel, KernelConfig, SyscallNumber};

fn config() -> KernelConfig {
    KernelConfig::default().with_semaphore_tracing(false)
}

fn run<F>(init: F) -> (Arc<Kernel>, Vec<String>)
where
    F: FnOnce(&mlqos::Sys) + Send + 'static,
{
    let kernel = Kernel::new(config()).unwrap();
    kernel.boot(init).unwrap();
    assert_eq!(kernel.join(), Ok(0));
    let lines = kernel.console().drain();
    (kernel, lines)
}

#[test]
fn get_callers_lists_pids_in_call_order() {
    let pids = Arc::new(Mutex::new(Vec::new()));
    let result = Arc::new(Mutex::new(Vec::new()));
    let (p, r) = (pids.clone(), result.clone());
    let (_, lines) = run(move |sys| {
        for _ in 0..2 {
            let p = p.clone();
            sys.fork(move |sys| {
                let me = sys.getpid();
                p.lock().unwrap().push(me);
            });
        }
        while sys.wait() > 0 {}
        let calls = vec![
            sys.get_callers(SyscallNumber::GetPid.as_u64()),
            sys.get_callers(SyscallNumber::SemRelease.as_u64()),
            sys.get_callers(4),
        ];
        *r.lock().unwrap() = calls;
    });
    assert_eq!(*result.lock().unwrap(), vec![0, 0, -1]);

    let pids = pids.lock().unwrap();
    let listed: Vec<i32> = lines[0].split(", ").map(|pid| pid.parse().unwrap()).collect();
    assert_eq!(listed.len(), 2);
    assert_eq!(
        listed.iter().collect::<HashSet<_>>(),
        pids.iter().collect::<HashSet<_>>()
    );
    assert_eq!(lines[1], "There is no process which has called system call 31");
}

#[test]
fn fork_and_wait_are_logged_for_the_parent() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let (_, lines) = run(move |sys| {
        let child = sys.fork(|_| {});
        sys.wait();
        sys.get_callers(SyscallNumber::Fork.as_u64());
        s.lock().unwrap().push(child);
    });
    assert_eq!(lines[0], "1");
    assert!(seen.lock().unwrap()[0] > 1);
}

#[test]
fn parent_pids_follow_the_fork_tree() {
    let tree = Arc::new(Mutex::new(Vec::new()));
    let root = Arc::new(Mutex::new(0));
    let (t, r) = (tree.clone(), root.clone());
    let (_, lines) = run(move |sys| {
        *r.lock().unwrap() = sys.get_parent_pid();
        *t.lock().unwrap() = family_tree(sys);
    });
    // the root process has no parent
    assert_eq!(*root.lock().unwrap(), -1);
    let tree = tree.lock().unwrap();
    assert_eq!(tree.len(), 2);
    let (second, third) = (tree[0], tree[1]);
    assert_eq!(second.1, 1);
    assert_eq!(third.1, second.0);
    assert!(lines.iter().any(|l| l.starts_with("third process pid:")));
}

#[test]
fn sbrk_moves_the_break() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let r = results.clone();
    run(move |sys| {
        let calls = vec![
            sys.sbrk(2 * PGSIZE as isize),
            sys.sbrk(0),
            sys.sbrk(-(PGSIZE as isize)),
            sys.sbrk(0),
            sys.sbrk(-(1 << 20)),
            sys.sbrk(1 << 40),
            sys.sbrk(0),
        ];
        *r.lock().unwrap() = calls;
    });
    let page = PGSIZE as i64;
    assert_eq!(
        *results.lock().unwrap(),
        vec![page, 3 * page, 3 * page, 2 * page, -1, -1, 2 * page]
    );
}

#[test]
fn children_inherit_the_parent_size() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let s = sizes.clone();
    run(move |sys| {
        sys.sbrk(PGSIZE as isize);
        let s = s.clone();
        sys.fork(move |sys| {
            let sz = sys.sbrk(0);
            s.lock().unwrap().push(sz);
        });
        sys.wait();
    });
    assert_eq!(*sizes.lock().unwrap(), vec![2 * PGSIZE as i64]);
}

#[test]
fn sleep_waits_for_the_clock() {
    let results = Arc::new(Mutex::new(None));
    let r = results.clone();
    run(move |sys| {
        let start = sys.uptime();
        let slept = sys.sleep(5);
        let end = sys.uptime();
        let negative = sys.sleep(-1);
        *r.lock().unwrap() = Some((start, slept, end, negative));
    });
    let results = *results.lock().unwrap();
    let (start, slept, end, negative) = results.unwrap();
    assert_eq!(slept, 0);
    assert!(end >= start + 5, "{} -> {}", start, end);
    assert_eq!(negative, -1);
}

#[test]
fn raw_syscalls_check_their_number() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let r = results.clone();
    run(move |sys| {
        let calls = vec![
            sys.syscall(99, SyscallArgs::default()),
            sys.syscall(SyscallNumber::Fork.as_u64(), SyscallArgs::default()),
            sys.syscall(SyscallNumber::GetPid.as_u64(), SyscallArgs::default()),
            sys.syscall(SyscallNumber::Kill.as_u64(), SyscallArgs::new(&[77])),
        ];
        *r.lock().unwrap() = calls;
    });
    assert_eq!(*results.lock().unwrap(), vec![-1, -1, 1, -1]);
}

#[test]
fn shutdown_reports_its_code() {
    let kernel = Kernel::new(config()).unwrap();
    kernel
        .boot(|sys| {
            sys.fork(|sys| loop {
                sys.sleep(1);
            });
            sys.shutdown(42);
        })
        .unwrap();
    assert_eq!(kernel.join(), Ok(42));
    assert!(kernel.is_halted());
}
