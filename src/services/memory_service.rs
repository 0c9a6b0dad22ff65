// Memory Management Service for MLQOS
//
// Address spaces and kernel stacks are owned by collaborators behind two
// traits; the kernel only ever holds opaque handles to them.
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;

use spin::Mutex;
use x86_64::VirtAddr;

use crate::param::{KSTACKSIZE, KSTACK_BASE, PGSIZE};

/// Handle to a user address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AddressSpace(u64);

impl AddressSpace {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// A kernel stack handed out by the stack allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KStack {
    index: usize,
    pub base: VirtAddr,
    pub size: usize,
}

impl KStack {
    pub fn top(&self) -> VirtAddr {
        self.base + self.size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfMemory,
    RegionNotFound,
    InvalidSize,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "out of memory"),
            MemoryError::RegionNotFound => write!(f, "no such address space"),
            MemoryError::InvalidSize => write!(f, "invalid size"),
        }
    }
}

/// Address-space manager consumed by fork, exit/wait and sbrk
pub trait AddressSpaceManager: Send + Sync {
    fn new_address_space(&self) -> Result<AddressSpace, MemoryError>;
    /// Copy the first `size` bytes of `space` into a new address space
    fn duplicate(&self, space: AddressSpace, size: usize) -> Result<AddressSpace, MemoryError>;
    /// Grow from `old_size` to `new_size` bytes, returning the new size
    fn grow(&self, space: AddressSpace, old_size: usize, new_size: usize) -> Result<usize, MemoryError>;
    /// Shrink from `old_size` to `new_size` bytes, returning the new size
    fn shrink(&self, space: AddressSpace, old_size: usize, new_size: usize) -> Result<usize, MemoryError>;
    fn destroy(&self, space: AddressSpace);
}

/// Kernel stack allocator consumed by allocproc and wait
pub trait KernelStackAllocator: Send + Sync {
    fn alloc_kernel_stack(&self) -> Option<KStack>;
    fn free(&self, stack: KStack);
}

fn pages(bytes: usize) -> usize {
    bytes.div_ceil(PGSIZE)
}

#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub id: u64,
    pub size: usize,
    pub pages: usize,
}

struct Regions {
    map: BTreeMap<u64, MemoryRegion>,
    pages_in_use: usize,
}

/// Memory Service - address spaces drawn from a fixed page budget
pub struct MemoryService {
    next_region_id: AtomicU64,
    page_budget: usize,
    regions: Mutex<Regions>,
}

impl MemoryService {
    pub fn new(page_budget: usize) -> Self {
        Self {
            next_region_id: AtomicU64::new(1),
            page_budget,
            regions: Mutex::new(Regions {
                map: BTreeMap::new(),
                pages_in_use: 0,
            }),
        }
    }

    pub fn pages_in_use(&self) -> usize {
        self.regions.lock().pages_in_use
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().map.len()
    }

    pub fn get_region_info(&self, space: AddressSpace) -> Option<MemoryRegion> {
        self.regions.lock().map.get(&space.0).cloned()
    }

    fn insert(&self, size: usize) -> Result<AddressSpace, MemoryError> {
        let mut regions = self.regions.lock();
        let needed = pages(size);
        if regions.pages_in_use + needed > self.page_budget {
            return Err(MemoryError::OutOfMemory);
        }
        let id = self.next_region_id.fetch_add(1, Ordering::Relaxed);
        regions.pages_in_use += needed;
        regions.map.insert(
            id,
            MemoryRegion {
                id,
                size,
                pages: needed,
            },
        );
        Ok(AddressSpace(id))
    }

    fn resize(&self, space: AddressSpace, new_size: usize) -> Result<usize, MemoryError> {
        let mut regions = self.regions.lock();
        let in_use = regions.pages_in_use;
        let region = regions.map.get_mut(&space.0).ok_or(MemoryError::RegionNotFound)?;
        let needed = pages(new_size);
        if in_use - region.pages + needed > self.page_budget {
            return Err(MemoryError::OutOfMemory);
        }
        let delta = needed as isize - region.pages as isize;
        region.size = new_size;
        region.pages = needed;
        regions.pages_in_use = (in_use as isize + delta) as usize;
        Ok(new_size)
    }
}

impl AddressSpaceManager for MemoryService {
    fn new_address_space(&self) -> Result<AddressSpace, MemoryError> {
        self.insert(0)
    }

    fn duplicate(&self, space: AddressSpace, size: usize) -> Result<AddressSpace, MemoryError> {
        if !self.regions.lock().map.contains_key(&space.0) {
            return Err(MemoryError::RegionNotFound);
        }
        self.insert(size)
    }

    fn grow(&self, space: AddressSpace, old_size: usize, new_size: usize) -> Result<usize, MemoryError> {
        if new_size < old_size {
            return Err(MemoryError::InvalidSize);
        }
        self.resize(space, new_size)
    }

    fn shrink(&self, space: AddressSpace, old_size: usize, new_size: usize) -> Result<usize, MemoryError> {
        if new_size > old_size {
            return Err(MemoryError::InvalidSize);
        }
        self.resize(space, new_size)
    }

    fn destroy(&self, space: AddressSpace) {
        let mut regions = self.regions.lock();
        if let Some(region) = regions.map.remove(&space.0) {
            regions.pages_in_use -= region.pages;
        } else {
            log::warn!("destroy of unknown address space {}", space.0);
        }
    }
}

/// Fixed pool of kernel stacks laid out from KSTACK_BASE
pub struct StackPool {
    free: Mutex<Vec<usize>>,
    capacity: usize,
}

impl StackPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            // lowest index on top
            free: Mutex::new((0..capacity).rev().collect()),
            capacity,
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl KernelStackAllocator for StackPool {
    fn alloc_kernel_stack(&self) -> Option<KStack> {
        let index = self.free.lock().pop()?;
        Some(KStack {
            index,
            base: VirtAddr::new(KSTACK_BASE + (index * KSTACKSIZE) as u64),
            size: KSTACKSIZE,
        })
    }

    fn free(&self, stack: KStack) {
        let mut free = self.free.lock();
        if stack.index >= self.capacity || free.contains(&stack.index) {
            panic!("kfree");
        }
        free.push(stack.index);
    }
}
