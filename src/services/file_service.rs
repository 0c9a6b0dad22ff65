// File handle service for MLQOS
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;

use spin::Mutex;

/// An open file table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileHandle(u64);

/// A referenced directory inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirHandle(u64);

/// File layer consumed by fork, exit and the first process
pub trait FileLayer: Send + Sync {
    fn open_console(&self) -> FileHandle;
    fn root_directory(&self) -> DirHandle;
    fn duplicate_handle(&self, file: FileHandle) -> FileHandle;
    fn close(&self, file: FileHandle);
    fn duplicate_directory(&self, dir: DirHandle) -> DirHandle;
    fn release_directory_handle(&self, dir: DirHandle);
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub refs: usize,
}

/// Reference-counted table of open files and directories
pub struct FileService {
    next_id: AtomicU64,
    files: Mutex<BTreeMap<u64, FileEntry>>,
    directories: Mutex<BTreeMap<u64, FileEntry>>,
}

impl FileService {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            files: Mutex::new(BTreeMap::new()),
            directories: Mutex::new(BTreeMap::new()),
        }
    }

    /// References held on open files
    pub fn open_file_refs(&self) -> usize {
        self.files.lock().values().map(|f| f.refs).sum()
    }

    /// References held on directories
    pub fn directory_refs(&self) -> usize {
        self.directories.lock().values().map(|d| d.refs).sum()
    }

    fn open(table: &Mutex<BTreeMap<u64, FileEntry>>, id: u64, name: &str) {
        table.lock().insert(
            id,
            FileEntry {
                name: name.to_string(),
                refs: 1,
            },
        );
    }

    fn incref(table: &Mutex<BTreeMap<u64, FileEntry>>, id: u64, what: &str) {
        match table.lock().get_mut(&id) {
            Some(entry) => entry.refs += 1,
            None => panic!("{}dup", what),
        }
    }

    fn decref(table: &Mutex<BTreeMap<u64, FileEntry>>, id: u64, what: &str) {
        let mut table = table.lock();
        let last = match table.get_mut(&id) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => panic!("{}close", what),
        };
        if last {
            table.remove(&id);
        }
    }
}

impl Default for FileService {
    fn default() -> Self {
        Self::new()
    }
}

impl FileLayer for FileService {
    fn open_console(&self) -> FileHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Self::open(&self.files, id, "console");
        FileHandle(id)
    }

    fn root_directory(&self) -> DirHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Self::open(&self.directories, id, "/");
        DirHandle(id)
    }

    fn duplicate_handle(&self, file: FileHandle) -> FileHandle {
        Self::incref(&self.files, file.0, "file");
        file
    }

    fn close(&self, file: FileHandle) {
        Self::decref(&self.files, file.0, "file");
    }

    fn duplicate_directory(&self, dir: DirHandle) -> DirHandle {
        Self::incref(&self.directories, dir.0, "i");
        dir
    }

    fn release_directory_handle(&self, dir: DirHandle) {
        Self::decref(&self.directories, dir.0, "i");
    }
}
