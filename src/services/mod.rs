// Kernel services for MLQOS
pub mod file_service;
pub mod memory_service;
pub mod process_service;

pub use file_service::{DirHandle, FileHandle, FileLayer, FileService};
pub use memory_service::{
    AddressSpace, AddressSpaceManager, KStack, KernelStackAllocator, MemoryError, MemoryService,
    StackPool,
};
