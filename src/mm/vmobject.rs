// Backing objects for regions.
//
// A VmObject is the only shared entity in this subsystem: regions own
// their ranges exclusively, but many regions - across many address
// spaces - may hold an Arc to the same VmObject. Its internal state is
// guarded by the object's own lock, never by any address-space lock,
// since unrelated processes race on it.

use alloc::sync::Arc;

use super::inode::Inode;
use crate::err::*;
use crate::util::SpinLock;

/// How anonymous memory is committed against physical backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Commit is reserved up front; pages materialize on first touch.
    Reserve,
    /// Pages are allocated eagerly.
    AllocateNow,
    /// Overcommit: nothing reserved (MAP_NORESERVE).
    Uncommitted,
}

pub enum VmObject {
    Anonymous(AnonymousVmObject),
    PrivateInode(InodeVmObject),
    SharedInode(SharedInodeVmObject),
}

impl VmObject {
    pub fn size(&self) -> u64 {
        match self {
            VmObject::Anonymous(obj) => obj.size,
            VmObject::PrivateInode(obj) => obj.inode.size(),
            VmObject::SharedInode(obj) => obj.inode.size(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, VmObject::Anonymous(_))
    }

    pub fn as_anonymous(&self) -> Option<&AnonymousVmObject> {
        match self {
            VmObject::Anonymous(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_shared_inode(&self) -> Option<&SharedInodeVmObject> {
        match self {
            VmObject::SharedInode(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn inode(&self) -> Option<&Arc<dyn Inode>> {
        match self {
            VmObject::Anonymous(_) => None,
            VmObject::PrivateInode(obj) => Some(&obj.inode),
            VmObject::SharedInode(obj) => Some(&obj.inode),
        }
    }
}

#[derive(Default)]
struct VolatileState {
    volatile: bool,
    purged: bool,
}

/// Plain anonymous memory, optionally purgeable under pressure.
pub struct AnonymousVmObject {
    size: u64,
    strategy: AllocationStrategy,
    volatile_state: SpinLock<VolatileState>,
}

impl AnonymousVmObject {
    pub fn create(size: u64, strategy: AllocationStrategy) -> Arc<VmObject> {
        Arc::new(VmObject::Anonymous(Self {
            size,
            strategy,
            volatile_state: SpinLock::new(VolatileState::default()),
        }))
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile_state.lock(line!()).volatile
    }

    pub fn set_volatile(&self) {
        self.volatile_state.lock(line!()).volatile = true;
    }

    /// Clears volatility. Returns true if the content was purged while
    /// volatile, i.e. the caller's data is gone.
    pub fn set_nonvolatile(&self) -> bool {
        let mut state = self.volatile_state.lock(line!());
        state.volatile = false;
        core::mem::take(&mut state.purged)
    }

    /// Reclaims the content if (and only if) the object is currently
    /// volatile. Returns the number of bytes released.
    pub fn purge(&self) -> u64 {
        let mut state = self.volatile_state.lock(line!());
        if !state.volatile || state.purged {
            return 0;
        }
        state.purged = true;
        self.size
    }
}

/// A private, copy-on-write view of an inode's content. Modifications
/// stay local to the mappings of this object and are never written back.
pub struct InodeVmObject {
    inode: Arc<dyn Inode>,
}

impl InodeVmObject {
    pub fn create(inode: Arc<dyn Inode>) -> Arc<VmObject> {
        Arc::new(VmObject::PrivateInode(Self { inode }))
    }

    pub fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }
}

#[derive(Default)]
struct MappingCounts {
    writable: u32,
    executable: u32,
}

/// Directly backs an inode. One instance exists per inode; every shared
/// mapping of the file, in any address space, references it. The mapping
/// counts below are what keeps W^X global: a file can have writable
/// mappings or executable mappings, never both at once.
pub struct SharedInodeVmObject {
    inode: Arc<dyn Inode>,
    counts: SpinLock<MappingCounts>,
}

impl SharedInodeVmObject {
    pub fn create(inode: Arc<dyn Inode>) -> Arc<VmObject> {
        Arc::new(VmObject::SharedInode(Self {
            inode,
            counts: SpinLock::new(MappingCounts::default()),
        }))
    }

    pub fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }

    pub fn writable_mappings(&self) -> u32 {
        self.counts.lock(line!()).writable
    }

    pub fn executable_mappings(&self) -> u32 {
        self.counts.lock(line!()).executable
    }

    /// Check-and-increment under the object's lock: fails if any
    /// executable mapping exists anywhere.
    pub fn try_add_writable_mapping(&self) -> bool {
        let mut counts = self.counts.lock(line!());
        if counts.executable > 0 {
            return false;
        }
        counts.writable += 1;
        true
    }

    pub fn try_add_executable_mapping(&self) -> bool {
        let mut counts = self.counts.lock(line!());
        if counts.writable > 0 {
            return false;
        }
        counts.executable += 1;
        true
    }

    /// Unchecked increment, for splitting an already-counted mapping into
    /// pieces of the same protection.
    pub fn add_writable_mapping(&self) {
        self.counts.lock(line!()).writable += 1;
    }

    pub fn add_executable_mapping(&self) {
        self.counts.lock(line!()).executable += 1;
    }

    pub fn remove_writable_mapping(&self) {
        let mut counts = self.counts.lock(line!());
        assert!(counts.writable > 0);
        counts.writable -= 1;
    }

    pub fn remove_executable_mapping(&self) {
        let mut counts = self.counts.lock(line!());
        assert!(counts.executable > 0);
        counts.executable -= 1;
    }
}
