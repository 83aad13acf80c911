// Userspace-facing side: processes and syscall entry points.

pub mod sys_mem;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::err::*;
use crate::mm::inode::FileDescription;
use crate::mm::page_table::PageTableController;
use crate::mm::AddressSpace;
use crate::util::SpinLock;

pub mod caps {
    /// May create executable file mappings and reprotect to EXEC.
    pub const CAP_MAP_EXEC: u64 = 1 << 0;
    /// May request exact placement (MAP_FIXED).
    pub const CAP_MAP_FIXED: u64 = 1 << 1;
}

pub struct Process {
    address_space: Arc<AddressSpace>,
    capabilities: AtomicU64,
    files: SpinLock<BTreeMap<i32, Arc<FileDescription>>>,
}

impl Process {
    pub fn new(page_table: Arc<dyn PageTableController>, capabilities: u64) -> Arc<Self> {
        Arc::new(Self {
            address_space: AddressSpace::new(page_table),
            capabilities: AtomicU64::new(capabilities),
            files: SpinLock::new(BTreeMap::new()),
        })
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    pub fn capabilities(&self) -> u64 {
        self.capabilities.load(Ordering::Relaxed)
    }

    pub fn add_file(&self, fd: i32, file: Arc<FileDescription>) {
        self.files.lock(line!()).insert(fd, file);
    }

    pub fn remove_file(&self, fd: i32) -> Option<Arc<FileDescription>> {
        self.files.lock(line!()).remove(&fd)
    }

    pub fn get_file(&self, fd: i32) -> Result<Arc<FileDescription>, ErrorCode> {
        self.files
            .lock(line!())
            .get(&fd)
            .cloned()
            .ok_or(E_BAD_HANDLE)
    }
}
