// Boundary to the file/inode layer.
//
// The VM core never does file I/O itself: file-backed mappings go through
// this trait, and the file layer decides whether an inode can back a
// shared mapping at all.

use alloc::sync::Arc;

use super::vmobject::VmObject;
use crate::err::ErrorCode;

pub trait Inode: Send + Sync {
    fn size(&self) -> u64;

    /// File-permission bits, as opposed to the open mode of a particular
    /// file description.
    fn may_read(&self) -> bool {
        true
    }

    fn may_write(&self) -> bool {
        true
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ErrorCode>;

    /// The one VmObject directly backing this inode, shared across every
    /// address space that maps it. `E_NO_DEVICE` if this file cannot back
    /// a shared mapping.
    fn shared_vmobject(self: Arc<Self>) -> Result<Arc<VmObject>, ErrorCode>;
}

/// An open file: the inode plus the access mode it was opened with.
pub struct FileDescription {
    inode: Arc<dyn Inode>,
    readable: bool,
    writable: bool,
}

impl FileDescription {
    pub fn new(inode: Arc<dyn Inode>, readable: bool, writable: bool) -> Self {
        Self {
            inode,
            readable,
            writable,
        }
    }

    pub fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}
