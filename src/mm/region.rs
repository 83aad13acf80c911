// A Region is one contiguous mapping in one address space: a virtual
// range, a window into a backing VmObject, current protection, and the
// monotonic protection history the W^X policy is built on.

use alloc::string::String;
use alloc::sync::Arc;

use bitflags::bitflags;

use super::vmobject::VmObject;
use super::{Prot, VirtRange};
use crate::err::*;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// Created through mmap(); only such regions may be unmapped or
        /// reprotected from userspace.
        const MMAP    = 1;
        /// Writes are shared with the backing object (MAP_SHARED).
        const SHARED  = 2;
        /// A thread stack (MAP_STACK).
        const STACK   = 4;
        /// Syscalls may be invoked from this region (see msyscall()).
        const SYSCALL = 8;
    }
}

pub struct Region {
    range: VirtRange,
    vmobject: Arc<VmObject>,
    offset_in_vmobject: u64,
    prot: Prot,
    // Monotonic: set when the corresponding bit is ever granted, never
    // cleared, even across later protection changes.
    has_been_writable: bool,
    has_been_executable: bool,
    flags: RegionFlags,
    name: Option<String>,
}

impl Region {
    pub fn new(
        range: VirtRange,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: u64,
        prot: Prot,
        flags: RegionFlags,
        name: Option<String>,
    ) -> Self {
        Self {
            range,
            vmobject,
            offset_in_vmobject,
            prot,
            has_been_writable: prot.contains(Prot::WRITE),
            has_been_executable: prot.contains(Prot::EXEC),
            flags,
            name,
        }
    }

    pub fn range(&self) -> VirtRange {
        self.range
    }

    pub fn base(&self) -> u64 {
        self.range.start
    }

    pub fn size(&self) -> u64 {
        self.range.size
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn vmobject(&self) -> &Arc<VmObject> {
        &self.vmobject
    }

    pub fn offset_in_vmobject(&self) -> u64 {
        self.offset_in_vmobject
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn is_mmap(&self) -> bool {
        self.flags.contains(RegionFlags::MMAP)
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(RegionFlags::SHARED)
    }

    pub fn is_stack(&self) -> bool {
        self.flags.contains(RegionFlags::STACK)
    }

    pub fn is_syscall_region(&self) -> bool {
        self.flags.contains(RegionFlags::SYSCALL)
    }

    pub fn set_syscall_region(&mut self) {
        self.flags |= RegionFlags::SYSCALL;
    }

    pub fn has_been_writable(&self) -> bool {
        self.has_been_writable
    }

    pub fn has_been_executable(&self) -> bool {
        self.has_been_executable
    }

    /// Changes the protection, accumulating history. Policy checks happen
    /// before this is called; nothing here can fail.
    pub fn set_prot(&mut self, prot: Prot) {
        self.prot = prot;
        self.has_been_writable |= prot.contains(Prot::WRITE);
        self.has_been_executable |= prot.contains(Prot::EXEC);
    }

    /// A piece of this region covering `sub`: same object, adjusted
    /// offset, same protection, history and flags. Used by splits.
    pub fn clone_for_subrange(&self, sub: VirtRange) -> Region {
        assert!(self.range.contains_range(&sub) && !sub.is_empty());
        Region {
            range: sub,
            vmobject: self.vmobject.clone(),
            offset_in_vmobject: self.offset_in_vmobject + (sub.start - self.range.start),
            prot: self.prot,
            has_been_writable: self.has_been_writable,
            has_been_executable: self.has_been_executable,
            flags: self.flags,
            name: self.name.clone(),
        }
    }

    /// Registers this mapping's W/X bits in the shared object's global
    /// counts. Fails (with no side effect) if the object already has
    /// conflicting mappings elsewhere; a no-op for non-shared-inode
    /// backings.
    pub fn register_shared_mapping(&self) -> Result<(), ErrorCode> {
        let Some(obj) = self.vmobject.as_shared_inode() else {
            return Ok(());
        };
        if self.prot.contains(Prot::WRITE) && !obj.try_add_writable_mapping() {
            return Err(E_ACCESS_DENIED);
        }
        if self.prot.contains(Prot::EXEC) && !obj.try_add_executable_mapping() {
            if self.prot.contains(Prot::WRITE) {
                obj.remove_writable_mapping();
            }
            return Err(E_ACCESS_DENIED);
        }
        Ok(())
    }

    /// Unchecked variant for split pieces: the parent was already
    /// counted, so same-protection pieces can never conflict.
    pub fn register_split_piece(&self) {
        let Some(obj) = self.vmobject.as_shared_inode() else {
            return;
        };
        if self.prot.contains(Prot::WRITE) {
            obj.add_writable_mapping();
        }
        if self.prot.contains(Prot::EXEC) {
            obj.add_executable_mapping();
        }
    }

    pub fn unregister_shared_mapping(&self) {
        let Some(obj) = self.vmobject.as_shared_inode() else {
            return;
        };
        if self.prot.contains(Prot::WRITE) {
            obj.remove_writable_mapping();
        }
        if self.prot.contains(Prot::EXEC) {
            obj.remove_executable_mapping();
        }
    }

    /// Moves this mapping's registration from its current protection to
    /// `new_prot`, atomically enough: the new bits are added (checked)
    /// before the old ones are dropped.
    pub fn retag_shared_mapping(&self, new_prot: Prot) -> Result<(), ErrorCode> {
        let Some(obj) = self.vmobject.as_shared_inode() else {
            return Ok(());
        };

        let old = self.prot;
        let added_w = new_prot.contains(Prot::WRITE) && !old.contains(Prot::WRITE);
        let added_x = new_prot.contains(Prot::EXEC) && !old.contains(Prot::EXEC);

        if added_w && !obj.try_add_writable_mapping() {
            return Err(E_ACCESS_DENIED);
        }
        if added_x && !obj.try_add_executable_mapping() {
            if added_w {
                obj.remove_writable_mapping();
            }
            return Err(E_ACCESS_DENIED);
        }

        if old.contains(Prot::WRITE) && !new_prot.contains(Prot::WRITE) {
            obj.remove_writable_mapping();
        }
        if old.contains(Prot::EXEC) && !new_prot.contains(Prot::EXEC) {
            obj.remove_executable_mapping();
        }
        Ok(())
    }
}
