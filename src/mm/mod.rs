// Memory management: address spaces, regions, and the objects backing them.
//
// Only the virtual side lives here. Hardware page tables sit behind
// `page_table::PageTableController`, file content behind `inode::Inode`.

pub mod address_space;
pub mod inode;
pub mod page_table;
pub mod range_alloc;
pub mod region;
pub mod validate;
pub mod vmobject;

use bitflags::bitflags;

pub use address_space::AddressSpace;
pub use region::Region;
pub use region::RegionFlags;
pub use vmobject::VmObject;

pub const PAGE_SIZE: u64 = 1 << 12;
pub const PAGE_SIZE_LOG2: u8 = 12;

// User virtual addresses live in [USER_VMEM_START, USER_VMEM_END).
// The first 64K are never mapped so that null-ish dereferences fault.
pub const USER_VMEM_START: u64 = 1 << 16;
pub const USER_VMEM_END: u64 = 1 << 45;

// Region names are capped the way paths are.
pub const MAX_REGION_NAME_LEN: usize = 4096;

pub const fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

bitflags! {
    /// Protection bits of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ  = 1;
        const WRITE = 2;
        const EXEC  = 4;
    }
}

bitflags! {
    /// mmap() flag bits. SHARED/PRIVATE are required and mutually
    /// exclusive, as are FIXED/RANDOMIZED.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED     = 1;
        const PRIVATE    = 2;
        const ANONYMOUS  = 4;
        const FIXED      = 8;
        const RANDOMIZED = 16;
        const STACK      = 32;
        const NORESERVE  = 64;
    }
}

/// A page-aligned virtual address range: [start, start + size).
/// Pure arithmetic, no ownership.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct VirtRange {
    pub start: u64,
    pub size: u64,
}

impl VirtRange {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    pub const fn empty() -> Self {
        Self { start: 0, size: 0 }
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.start <= addr) && (self.end() > addr)
    }

    pub fn contains_range(&self, other: &Self) -> bool {
        (self.start <= other.start) && (self.end() >= other.end())
    }

    pub fn intersects(&self, other: &Self) -> bool {
        (self.start < other.end()) && (other.start < self.end())
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());

        if start >= end {
            Self::empty()
        } else {
            Self {
                start,
                size: end - start,
            }
        }
    }

    /// Expands [addr, addr + size) to page boundaries. Fails on size zero
    /// or address-space wraparound.
    pub fn from_unaligned(addr: u64, size: u64) -> Result<Self, crate::err::ErrorCode> {
        if size == 0 {
            return Err(crate::err::E_INVALID_ARGUMENT);
        }
        let start = align_down(addr, PAGE_SIZE);
        let end = match addr.checked_add(size) {
            Some(end) => align_up(end, PAGE_SIZE),
            None => return Err(crate::err::E_INVALID_ARGUMENT),
        };
        if end < start || end == 0 {
            return Err(crate::err::E_INVALID_ARGUMENT);
        }
        Ok(Self {
            start,
            size: end - start,
        })
    }

    pub fn is_user(&self) -> bool {
        if self.size == 0 {
            return false;
        }
        match self.start.checked_add(self.size) {
            Some(end) => self.start >= USER_VMEM_START && end <= USER_VMEM_END,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_arithmetic() {
        let range = VirtRange::new(0x2000, 0x2000);
        assert_eq!(range.end(), 0x4000);
        assert!(range.contains(0x2000));
        assert!(range.contains(0x3fff));
        assert!(!range.contains(0x4000));

        let other = VirtRange::new(0x3000, 0x2000);
        assert!(range.intersects(&other));
        assert_eq!(range.intersect(&other), VirtRange::new(0x3000, 0x1000));
        assert!(!range.contains_range(&other));
        assert!(range.contains_range(&VirtRange::new(0x2000, 0x1000)));

        assert!(!range.intersects(&VirtRange::new(0x4000, 0x1000)));
        assert!(range.intersect(&VirtRange::new(0x8000, 0x1000)).is_empty());
    }

    #[test]
    fn from_unaligned_expands_to_page_boundaries() {
        let range = VirtRange::from_unaligned(0x1234, 0x10).unwrap();
        assert_eq!(range, VirtRange::new(0x1000, 0x1000));

        let range = VirtRange::from_unaligned(0x1000, 0x1001).unwrap();
        assert_eq!(range, VirtRange::new(0x1000, 0x2000));

        assert!(VirtRange::from_unaligned(0x1000, 0).is_err());
        assert!(VirtRange::from_unaligned(u64::MAX - 0x100, 0x200).is_err());
    }
}
