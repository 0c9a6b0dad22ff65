// Process Management Service for MLQOS
//
// Process creation, termination and the administrative knobs of the
// scheduler. Everything that changes a descriptor's state goes through
// the table lock.
use std::thread;

use crate::kernel::{Kernel, Program};
use crate::process::pcb::{BjfRatios, Channel, Pid, ProcState, ProcessError};
use crate::process::table::{ProcInfo, ProcTable};
use crate::services::file_service::FileHandle;

/// Attempts at the table lock before a listing reads it unlocked
const LISTING_TRIES: usize = 1000;

impl Kernel {
    /// Slot of the process running on this CPU
    pub(crate) fn myproc(&self) -> usize {
        let cpu = self.cpus.mycpu();
        cpu.push_off();
        let slot = cpu.proc();
        cpu.pop_off();
        match slot {
            Some(slot) => slot,
            None => panic!("myproc: no process on cpu{}", cpu.id),
        }
    }

    pub(crate) fn is_killed(&self, slot: usize) -> bool {
        self.ptable.lock().get(slot).killed
    }

    /// Look in the process table for an UNUSED proc.
    /// If found, change state to EMBRYO and give it a kernel stack.
    fn allocproc(&self) -> Result<usize, ProcessError> {
        let now = self.ticks();
        let slot = self.ptable.lock().claim_slot(now).ok_or(ProcessError::TableFull)?;

        // Allocate kernel stack.
        match self.kalloc.alloc_kernel_stack() {
            Some(stack) => self.ptable.lock().get_mut(slot).kstack = Some(stack),
            None => {
                self.ptable.lock().abandon(slot);
                return Err(ProcessError::OutOfMemory);
            }
        }

        // the new thread starts parked until the scheduler picks it
        self.kthreads[slot].context.reset();
        Ok(slot)
    }

    /// Undo allocproc() for a slot that never became RUNNABLE
    fn free_embryo(&self, slot: usize) {
        if let Some(stack) = self.ptable.lock().abandon(slot) {
            self.kalloc.free(stack);
        }
    }

    /// Set up the first user process.
    pub(crate) fn userinit(&self, program: Program) -> Result<usize, ProcessError> {
        if self.initproc.is_initialized() {
            panic!("userinit: init already exists");
        }
        let slot = self.allocproc()?;

        let image = self.config().init_image_size;
        let space = match self.vm.new_address_space() {
            Ok(space) => space,
            Err(_) => {
                self.free_embryo(slot);
                return Err(ProcessError::OutOfMemory);
            }
        };
        let sz = match self.vm.grow(space, 0, image) {
            Ok(sz) => sz,
            Err(_) => {
                self.vm.destroy(space);
                self.free_embryo(slot);
                return Err(ProcessError::OutOfMemory);
            }
        };

        let console = self.files.open_console();
        let cwd = self.files.root_directory();
        {
            let mut table = self.ptable.lock();
            let p = table.get_mut(slot);
            p.name = "initcode".to_string();
            p.address_space = Some(space);
            p.sz = sz;
            p.ofile[0] = Some(console);
            p.ofile[1] = Some(self.files.duplicate_handle(console));
            p.ofile[2] = Some(self.files.duplicate_handle(console));
            p.cwd = Some(cwd);
        }
        self.initproc.init_once(|| slot);

        if let Err(err) = self.spawn_kthread(slot, program, true) {
            panic!("userinit: cannot start init: {}", err);
        }

        // this assignment to state lets other cores
        // run this process.
        self.ptable.lock().get_mut(slot).set_state(ProcState::Runnable);
        log::debug!("init started in slot {}", slot);
        Ok(slot)
    }

    /// Create a new process copying the caller as the parent.
    /// The child runs `child` instead of returning from fork.
    pub fn fork(&self, child: Program) -> Result<Pid, ProcessError> {
        let me = self.myproc();
        let slot = self.allocproc()?;

        let (space, sz, name, ofile, cwd) = {
            let table = self.ptable.lock();
            let p = table.get(me);
            (p.address_space, p.sz, p.name.clone(), p.ofile, p.cwd)
        };

        // Copy process state from proc.
        let copy = match space {
            Some(space) => self.vm.duplicate(space, sz),
            None => self.vm.new_address_space(),
        };
        let copy = match copy {
            Ok(copy) => copy,
            Err(err) => {
                log::warn!("fork: cannot copy address space: {}", err);
                self.free_embryo(slot);
                return Err(ProcessError::OutOfMemory);
            }
        };

        let mut files: [Option<FileHandle>; crate::param::NOFILE] = Default::default();
        for (fd, file) in ofile.iter().enumerate() {
            files[fd] = file.map(|f| self.files.duplicate_handle(f));
        }
        let cwd = cwd.map(|dir| self.files.duplicate_directory(dir));

        let pid = {
            let mut table = self.ptable.lock();
            let np = table.get_mut(slot);
            np.address_space = Some(copy);
            np.sz = sz;
            np.parent = Some(me);
            np.ofile = files;
            np.cwd = cwd;
            np.name = name;
            np.pid
        };

        if let Err(err) = self.spawn_kthread(slot, child, false) {
            log::warn!("fork: cannot start kernel thread: {}", err);
            self.release_resources(slot);
            self.vm.destroy(copy);
            self.free_embryo(slot);
            return Err(ProcessError::OutOfMemory);
        }

        self.ptable.lock().get_mut(slot).set_state(ProcState::Runnable);
        log::debug!("fork: pid {} from slot {}", pid, me);
        Ok(pid)
    }

    /// Close the files and directory of a slot
    fn release_resources(&self, slot: usize) {
        let (files, cwd) = {
            let mut table = self.ptable.lock();
            let p = table.get_mut(slot);
            let files: Vec<FileHandle> = p.ofile.iter_mut().filter_map(Option::take).collect();
            (files, p.cwd.take())
        };
        for file in files {
            self.files.close(file);
        }
        if let Some(dir) = cwd {
            self.files.release_directory_handle(dir);
        }
    }

    /// Exit the current process. Does not return.
    /// An exited process remains in the zombie state
    /// until its parent calls wait() to find out it exited.
    pub fn exit(&self) -> ! {
        let me = self.myproc();
        if self.initproc.get() == Some(&me) {
            panic!("init exiting");
        }

        // Close all open files.
        self.release_resources(me);

        let mut table = self.ptable.lock();

        // Parent might be sleeping in wait().
        if let Some(parent) = table.get(me).parent {
            table.wakeup1(Channel::Proc(parent));
        }

        // Pass abandoned children to init.
        let init = self.init_slot();
        let children: Vec<usize> = table.children_of(me).collect();
        for child in children {
            table.get_mut(child).parent = Some(init);
            if table.get(child).state() == ProcState::Zombie {
                table.wakeup1(Channel::Proc(init));
            }
        }

        // Jump into the scheduler, never to return.
        let p = table.get_mut(me);
        p.set_state(ProcState::Zombie);
        log::debug!("exit: pid {}", p.pid);
        self.sched_exit(table)
    }

    /// Wait for a child process to exit and return its pid.
    pub fn wait(&self) -> Result<Pid, ProcessError> {
        let me = self.myproc();
        let mut table = self.ptable.lock();
        loop {
            // Scan through table looking for exited children.
            let mut havekids = false;
            let mut zombie = None;
            for child in table.children_of(me) {
                havekids = true;
                if table.get(child).state() == ProcState::Zombie {
                    zombie = Some(child);
                    break;
                }
            }

            if let Some(child) = zombie {
                let reaped = table.reap(child);
                drop(table);
                if let Some(stack) = reaped.kstack {
                    self.kalloc.free(stack);
                }
                if let Some(space) = reaped.address_space {
                    self.vm.destroy(space);
                }
                log::debug!("wait: reaped pid {}", reaped.pid);
                return Ok(reaped.pid);
            }

            // No point waiting if we don't have any children.
            if !havekids {
                return Err(ProcessError::NoChildren);
            }
            if table.get(me).killed {
                return Err(ProcessError::Killed);
            }

            // Wait for children to exit. (See wakeup1 call in exit.)
            table = self.sleep_locked(Channel::Proc(me), table);
        }
    }

    pub fn kill(&self, pid: Pid) -> Result<(), ProcessError> {
        self.ptable.lock().kill(pid)
    }

    /// Grow current process's memory by n bytes.
    /// Returns the size before the change.
    pub fn growproc(&self, n: isize) -> Result<usize, ProcessError> {
        let me = self.myproc();
        let (space, sz) = {
            let table = self.ptable.lock();
            let p = table.get(me);
            (p.address_space, p.sz)
        };
        let space = space.ok_or(ProcessError::OutOfMemory)?;
        let new_sz = if n > 0 {
            self.vm.grow(space, sz, sz + n as usize)
        } else if n < 0 {
            let shrink = n.unsigned_abs();
            if shrink > sz {
                return Err(ProcessError::InvalidArgument);
            }
            self.vm.shrink(space, sz, sz - shrink)
        } else {
            Ok(sz)
        }
        .map_err(|_| ProcessError::OutOfMemory)?;
        self.ptable.lock().get_mut(me).sz = new_sz;
        Ok(sz)
    }

    pub fn getpid(&self) -> Pid {
        let me = self.myproc();
        self.ptable.lock().get(me).pid
    }

    /// Pid of the caller's parent; the root process has none
    pub fn get_parent_pid(&self) -> Result<Pid, ProcessError> {
        let me = self.myproc();
        let table = self.ptable.lock();
        let parent = table.get(me).parent.ok_or(ProcessError::ProcessNotFound)?;
        Ok(table.get(parent).pid)
    }

    pub fn change_process_queue(&self, pid: Pid, level: i32) -> Result<(), ProcessError> {
        self.ptable.lock().change_level(pid, level)
    }

    pub fn set_ticket(&self, pid: Pid, ticket: i32) -> Result<(), ProcessError> {
        self.ptable.lock().set_ticket(pid, ticket)
    }

    pub fn set_bjf_ratios(&self, pid: Pid, ratios: BjfRatios) {
        self.ptable.lock().set_ratios(pid, ratios);
    }

    pub fn set_bjf_ratios_all(&self, ratios: BjfRatios) {
        self.ptable.lock().set_ratios_all(ratios);
    }

    /// Run `f` on the table for a listing. A wedged lock is bypassed.
    fn with_listing<R>(&self, f: impl FnOnce(&ProcTable) -> R) -> R {
        for _ in 0..LISTING_TRIES {
            if let Some(table) = self.ptable.try_lock() {
                return f(&table);
            }
            thread::yield_now();
        }
        log::warn!("ptable.lock busy; listing without it");
        // SAFETY: best effort on a stuck machine
        f(unsafe { self.ptable.get_unchecked() })
    }

    /// Print the scheduling report on the console
    pub fn print_information(&self) {
        let report = self.with_listing(ProcTable::render_report);
        self.console().write_block(&report);
    }

    /// Print a process listing to console. For debugging.
    pub fn procdump(&self) {
        let dump = self.with_listing(ProcTable::render_dump);
        self.console().write_block(&dump);
    }

    /// Descriptors of every live slot
    pub fn processes(&self) -> Vec<ProcInfo> {
        self.with_listing(ProcTable::snapshot)
    }

    pub fn process(&self, pid: Pid) -> Option<ProcInfo> {
        self.processes().into_iter().find(|p| p.pid == pid)
    }
}
