// Boot-time configuration for MLQOS
use core::fmt;
use std::time::Duration;

use crate::param::{NCPU, NPROC, NSEM, PGSIZE};

/// Sizing and behaviour of one kernel instance.
///
/// Every bounded container in the kernel (process table, kernel stack pool,
/// semaphore waiter stacks, console history) is pre-sized from this at boot and
/// never grows afterwards.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub ncpu: usize,
    pub nproc: usize,
    /// Kernel stacks available to the stack allocator
    pub kstack_pages: usize,
    /// User pages available to the address-space manager
    pub user_pages: usize,
    /// Initial size in bytes of the root process image
    pub init_image_size: usize,
    /// Period of the timer thread; `None` means ticks only advance through
    /// `Kernel::clock_tick`
    pub tick_interval: Option<Duration>,
    pub ticket_seed: u64,
    /// Emit "acquired"/"released" console lines from the semaphore bank
    pub trace_semaphores: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ncpu: NCPU,
            nproc: NPROC,
            kstack_pages: NPROC,
            user_pages: 1024,
            init_image_size: PGSIZE,
            tick_interval: Some(Duration::from_millis(1)),
            ticket_seed: 0x2545_F491_4F6C_DD1D,
            trace_semaphores: true,
        }
    }
}

impl KernelConfig {
    pub fn with_cpus(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    pub fn with_nproc(mut self, nproc: usize) -> Self {
        self.nproc = nproc;
        self.kstack_pages = self.kstack_pages.max(nproc);
        self
    }

    pub fn with_kstack_pages(mut self, pages: usize) -> Self {
        self.kstack_pages = pages;
        self
    }

    pub fn with_user_pages(mut self, pages: usize) -> Self {
        self.user_pages = pages;
        self
    }

    pub fn with_tick_interval(mut self, interval: Option<Duration>) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_ticket_seed(mut self, seed: u64) -> Self {
        self.ticket_seed = seed;
        self
    }

    pub fn with_semaphore_tracing(mut self, enabled: bool) -> Self {
        self.trace_semaphores = enabled;
        self
    }

    /// Check the configuration before boot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ncpu == 0 {
            return Err(ConfigError::NoCpus);
        }
        // the root process plus at least one child
        if self.nproc < 2 {
            return Err(ConfigError::TableTooSmall(self.nproc));
        }
        if self.kstack_pages == 0 {
            return Err(ConfigError::NoKernelStacks);
        }
        if self.init_image_size > self.user_pages * PGSIZE {
            return Err(ConfigError::ImageTooLarge(self.init_image_size));
        }
        if let Some(interval) = self.tick_interval {
            if interval.is_zero() {
                return Err(ConfigError::ZeroTickInterval);
            }
        }
        Ok(())
    }

    /// Capacity of each semaphore's waiter stack
    pub fn waiter_capacity(&self) -> usize {
        self.nproc
    }

    pub fn semaphore_count(&self) -> usize {
        NSEM
    }
}

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    NoCpus,
    TableTooSmall(usize),
    NoKernelStacks,
    ImageTooLarge(usize),
    ZeroTickInterval,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::NoCpus => write!(f, "at least one cpu is required"),
            ConfigError::TableTooSmall(n) => write!(f, "process table of {} slots is too small", n),
            ConfigError::NoKernelStacks => write!(f, "kernel stack pool is empty"),
            ConfigError::ImageTooLarge(size) => write!(f, "init image of {} bytes does not fit in user memory", size),
            ConfigError::ZeroTickInterval => write!(f, "timer interval must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
