// The region set of one process.
//
// Regions are owned exclusively by their AddressSpace and live in an
// ordered map keyed by base address. One lock serializes everything that
// must stay consistent: the region map, the range allocator, and the
// hardware-table edits derived from them. Every operation validates
// fully before mutating, so a failing call leaves no partial state.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::inode::FileDescription;
use super::page_table::PageTableController;
use super::range_alloc::RangeAllocator;
use super::region::{Region, RegionFlags};
use super::validate;
use super::vmobject::{AllocationStrategy, AnonymousVmObject, InodeVmObject, VmObject};
use super::{
    align_down, align_up, is_page_aligned, MapFlags, Prot, VirtRange, MAX_REGION_NAME_LEN,
    PAGE_SIZE, USER_VMEM_END, USER_VMEM_START,
};
use crate::err::*;
use crate::util::SpinLock;

/// The one mremap() transform we support, parsed from the flag word up
/// front so the limitation is explicit rather than scattered over flag
/// checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapRequest {
    /// Re-bind a shared file mapping to a private (COW) copy of the same
    /// inode, in place.
    PrivateClone,
    Unsupported,
}

impl RemapRequest {
    pub fn from_flags(flags: MapFlags) -> Self {
        if flags.contains(MapFlags::PRIVATE)
            && !flags.intersects(MapFlags::SHARED | MapFlags::ANONYMOUS | MapFlags::NORESERVE)
        {
            Self::PrivateClone
        } else {
            Self::Unsupported
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatileAdvice {
    SetVolatile,
    SetNonvolatile,
    Get,
}

/// A snapshot of one region, for queries. Regions themselves never leave
/// the address-space lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub range: VirtRange,
    pub prot: Prot,
    pub flags: RegionFlags,
    pub name: Option<String>,
}

impl RegionInfo {
    fn of(region: &Region) -> Self {
        Self {
            range: region.range(),
            prot: region.prot(),
            flags: region.flags(),
            name: region.name().map(String::from),
        }
    }
}

pub struct AddressSpace {
    inner: SpinLock<AddressSpaceInner>,
}

struct AddressSpaceInner {
    regions: BTreeMap<u64, Region>,
    allocator: RangeAllocator,
    page_table: Arc<dyn PageTableController>,
    enforces_syscall_regions: bool,
}

impl AddressSpace {
    pub fn new(page_table: Arc<dyn PageTableController>) -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(AddressSpaceInner {
                regions: BTreeMap::new(),
                allocator: RangeAllocator::new(VirtRange::new(
                    USER_VMEM_START,
                    USER_VMEM_END - USER_VMEM_START,
                )),
                page_table,
                enforces_syscall_regions: false,
            }),
        })
    }

    /// Creates an anonymous region at an exact range, without the MMAP
    /// flag. This is how the kernel itself (loader, stack setup) places
    /// regions that userspace may not later unmap or reprotect.
    pub fn allocate_region(
        &self,
        range: VirtRange,
        name: Option<&str>,
        prot: Prot,
        strategy: AllocationStrategy,
    ) -> Result<u64, ErrorCode> {
        if !range.is_user() || !is_page_aligned(range.start) || !is_page_aligned(range.size) {
            return Err(E_INVALID_ARGUMENT);
        }

        let vmobject = AnonymousVmObject::create(range.size, strategy);
        let region = Region::new(
            range,
            vmobject,
            0,
            prot,
            RegionFlags::empty(),
            name.map(String::from),
        );

        let mut inner = self.inner.lock(line!());
        inner.allocator.allocate_specific(range)?;
        inner.commit_region(region)?;
        Ok(range.start)
    }

    /// Creates a region over an existing backing object at an exact
    /// range. Used by the file layer when it resolves an mmap() itself.
    pub fn allocate_region_with_vmobject(
        &self,
        range: VirtRange,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: u64,
        name: Option<&str>,
        prot: Prot,
        shared: bool,
    ) -> Result<u64, ErrorCode> {
        if !range.is_user() || !is_page_aligned(range.start) || !is_page_aligned(range.size) {
            return Err(E_INVALID_ARGUMENT);
        }

        let mut flags = RegionFlags::MMAP;
        if shared {
            flags |= RegionFlags::SHARED;
        }
        let region = Region::new(
            range,
            vmobject,
            offset_in_vmobject,
            prot,
            flags,
            name.map(String::from),
        );

        let mut inner = self.inner.lock(line!());
        inner.allocator.allocate_specific(range)?;
        if let Err(err) = region.register_shared_mapping() {
            inner.allocator.deallocate(range);
            return Err(err);
        }
        inner.commit_region(region)?;
        Ok(range.start)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &self,
        hint: u64,
        size: u64,
        alignment: u64,
        prot: Prot,
        flags: MapFlags,
        fd: Option<&FileDescription>,
        offset: u64,
        name: Option<&str>,
    ) -> Result<u64, ErrorCode> {
        if size == 0 || size > USER_VMEM_END {
            return Err(E_INVALID_ARGUMENT);
        }
        let size = align_up(size, PAGE_SIZE);

        let alignment = if alignment == 0 { PAGE_SIZE } else { alignment };
        if !alignment.is_power_of_two() || alignment < PAGE_SIZE {
            log::debug!("mmap: bad alignment 0x{:x}", alignment);
            return Err(E_INVALID_ARGUMENT);
        }

        let shared = flags.contains(MapFlags::SHARED);
        if shared == flags.contains(MapFlags::PRIVATE) {
            // Exactly one of SHARED/PRIVATE.
            return Err(E_INVALID_ARGUMENT);
        }
        if flags.contains(MapFlags::FIXED) && flags.contains(MapFlags::RANDOMIZED) {
            return Err(E_INVALID_ARGUMENT);
        }

        let anonymous = flags.contains(MapFlags::ANONYMOUS);
        let is_stack = flags.contains(MapFlags::STACK);
        if is_stack && !anonymous {
            return Err(E_INVALID_ARGUMENT);
        }

        if let Some(name) = name {
            if name.len() > MAX_REGION_NAME_LEN {
                return Err(E_INVALID_ARGUMENT);
            }
        }

        validate::validate_mmap_prot(prot, is_stack, anonymous, shared, fd)?;

        if flags.contains(MapFlags::FIXED) {
            if !is_page_aligned(hint) {
                return Err(E_INVALID_ARGUMENT);
            }
            if !VirtRange::new(hint, size).is_user() {
                return Err(E_BAD_ADDRESS);
            }
        }

        let (vmobject, offset_in_vmobject): (Arc<VmObject>, u64) = if anonymous {
            if offset != 0 {
                return Err(E_INVALID_ARGUMENT);
            }
            let strategy = if flags.contains(MapFlags::NORESERVE) {
                AllocationStrategy::Uncommitted
            } else {
                AllocationStrategy::Reserve
            };
            (AnonymousVmObject::create(size, strategy), 0)
        } else {
            let Some(fd) = fd else {
                return Err(E_BAD_HANDLE);
            };
            if !is_page_aligned(offset) {
                return Err(E_INVALID_ARGUMENT);
            }
            let vmobject = if shared {
                fd.inode().clone().shared_vmobject()?
            } else {
                InodeVmObject::create(fd.inode().clone())
            };
            (vmobject, offset)
        };

        let mut region_flags = RegionFlags::MMAP;
        if shared {
            region_flags |= RegionFlags::SHARED;
        }
        if is_stack {
            region_flags |= RegionFlags::STACK;
        }

        let mut inner = self.inner.lock(line!());

        let range = if flags.contains(MapFlags::RANDOMIZED) {
            inner.allocator.allocate_randomized(size, alignment)?
        } else if hint != 0 {
            let wanted = VirtRange::new(align_down(hint, PAGE_SIZE), size);
            if wanted.is_user() && inner.allocator.allocate_specific(wanted).is_ok() {
                wanted
            } else if flags.contains(MapFlags::FIXED) {
                return Err(E_OUT_OF_MEMORY);
            } else {
                // The hint cannot be honored: fall back to any free range.
                // Long-standing observable behavior; callers rely on it.
                log::debug!("mmap: hint 0x{:x} unavailable, falling back", hint);
                inner.allocator.allocate(size, alignment)?
            }
        } else {
            inner.allocator.allocate(size, alignment)?
        };

        let region = Region::new(
            range,
            vmobject,
            offset_in_vmobject,
            prot,
            region_flags,
            name.map(String::from),
        );

        if let Err(err) = region.register_shared_mapping() {
            inner.allocator.deallocate(range);
            return Err(err);
        }
        inner.commit_region(region)?;

        log::trace!("mmap: 0x{:x} (0x{:x} bytes)", range.start, range.size);
        Ok(range.start)
    }

    pub fn mprotect(&self, addr: u64, size: u64, prot: Prot) -> Result<(), ErrorCode> {
        let range = VirtRange::from_unaligned(addr, size)?;
        if !range.is_user() {
            return Err(E_BAD_ADDRESS);
        }

        let mut guard = self.inner.lock(line!());
        let inner = &mut *guard;

        // One whole region: mutate in place.
        if let Some(region) = inner.regions.get_mut(&range.start) {
            if region.range() == range {
                if !region.is_mmap() {
                    return Err(E_NOT_ALLOWED);
                }
                validate::validate_prot_change(region, prot)?;
                if region.prot() == prot {
                    return Ok(());
                }
                region.retag_shared_mapping(prot)?;
                region.set_prot(prot);
                inner.page_table.remap(region);
                return Ok(());
            }
        }

        // A proper sub-range of one region: split around it.
        if let Some(base) = inner.find_containing_base(range) {
            {
                let region = &inner.regions[&base];
                if !region.is_mmap() {
                    return Err(E_NOT_ALLOWED);
                }
                validate::validate_prot_change(region, prot)?;
                if region.prot() == prot {
                    return Ok(());
                }
            }

            let old = inner.regions.remove(&base).unwrap();
            let mut middle = old.clone_for_subrange(range);
            middle.set_prot(prot);
            if let Err(err) = middle.register_shared_mapping() {
                inner.regions.insert(base, old);
                return Err(err);
            }

            let (before, after) = split_region_around_range(&old, range);
            for piece in [&before, &after].into_iter().flatten() {
                piece.register_split_piece();
            }
            old.unregister_shared_mapping();

            inner.page_table.remap(&middle);
            inner.insert_region(middle);
            for piece in [before, after].into_iter().flatten() {
                inner.insert_region(piece);
            }
            return Ok(());
        }

        if inner.bases_intersecting(range).is_empty() {
            return Err(E_INVALID_ARGUMENT);
        }
        // Reprotecting across region boundaries could apply inconsistent
        // semantics mid-operation; it is scoped to one region on purpose.
        log::debug!(
            "mprotect: range 0x{:x}..0x{:x} spans multiple regions",
            range.start,
            range.end()
        );
        Err(E_INVALID_ARGUMENT)
    }

    pub fn munmap(&self, addr: u64, size: u64) -> Result<(), ErrorCode> {
        let range = VirtRange::from_unaligned(addr, size)?;
        if !range.is_user() {
            return Err(E_BAD_ADDRESS);
        }

        let mut inner = self.inner.lock(line!());

        let bases = inner.bases_intersecting(range);
        if bases.is_empty() {
            return Err(E_INVALID_ARGUMENT);
        }

        // Validate every intersected region before touching any of them.
        for base in &bases {
            if !inner.regions[base].is_mmap() {
                log::debug!("munmap: non-mmap region at 0x{:x}", base);
                return Err(E_NOT_ALLOWED);
            }
        }

        for base in bases {
            let whole = range.contains_range(&inner.regions[&base].range());
            if whole {
                let old = inner.deallocate_region(base);
                inner.page_table.unmap(&old, true);
                old.unregister_shared_mapping();
            } else {
                let old = inner.regions.remove(&base).unwrap();
                let cut = old.range().intersect(&range);
                let doomed = old.clone_for_subrange(cut);
                let (before, after) = split_region_around_range(&old, cut);

                for piece in [&before, &after].into_iter().flatten() {
                    piece.register_split_piece();
                }
                old.unregister_shared_mapping();

                inner.page_table.unmap(&doomed, true);
                inner.allocator.deallocate(cut);
                for piece in [before, after].into_iter().flatten() {
                    inner.insert_region(piece);
                }
            }
        }
        Ok(())
    }

    pub fn mremap(&self, old_addr: u64, old_size: u64, flags: MapFlags) -> Result<u64, ErrorCode> {
        let range = VirtRange::from_unaligned(old_addr, old_size)?;
        if !range.is_user() {
            return Err(E_BAD_ADDRESS);
        }

        match RemapRequest::from_flags(flags) {
            RemapRequest::Unsupported => {
                log::debug!("mremap: unsupported request, flags {:?}", flags);
                Err(E_NOT_IMPLEMENTED)
            }
            RemapRequest::PrivateClone => {
                let mut inner = self.inner.lock(line!());

                let Some(region) = inner
                    .regions
                    .get(&range.start)
                    .filter(|region| region.range() == range)
                else {
                    return Err(E_INVALID_ARGUMENT);
                };
                if !region.is_mmap() {
                    return Err(E_NOT_ALLOWED);
                }
                let Some(shared_obj) = region.vmobject().as_shared_inode() else {
                    return Err(E_NOT_IMPLEMENTED);
                };
                let inode = shared_obj.inode().clone();

                let old = inner.regions.remove(&range.start).unwrap();
                let mut region_flags = old.flags();
                region_flags.remove(RegionFlags::SHARED);
                let new_region = Region::new(
                    range,
                    InodeVmObject::create(inode),
                    old.offset_in_vmobject(),
                    old.prot(),
                    region_flags,
                    old.name().map(String::from),
                );
                old.unregister_shared_mapping();

                inner.page_table.remap(&new_region);
                inner.insert_region(new_region);
                Ok(range.start)
            }
        }
    }

    /// Returns 0 or 1 (the Get/SetNonvolatile answer).
    pub fn madvise_volatile(
        &self,
        addr: u64,
        size: u64,
        advice: VolatileAdvice,
    ) -> Result<u64, ErrorCode> {
        let range = VirtRange::from_unaligned(addr, size)?;
        if !range.is_user() {
            return Err(E_BAD_ADDRESS);
        }

        let inner = self.inner.lock(line!());
        let Some(base) = inner.find_containing_base(range) else {
            return Err(E_INVALID_ARGUMENT);
        };
        let region = &inner.regions[&base];
        if !region.is_mmap() {
            return Err(E_NOT_ALLOWED);
        }
        let Some(obj) = region.vmobject().as_anonymous() else {
            return Err(E_INVALID_ARGUMENT);
        };

        match advice {
            VolatileAdvice::SetVolatile => {
                obj.set_volatile();
                Ok(0)
            }
            VolatileAdvice::SetNonvolatile => Ok(if obj.set_nonvolatile() { 1 } else { 0 }),
            VolatileAdvice::Get => Ok(if obj.is_volatile() { 1 } else { 0 }),
        }
    }

    pub fn set_mmap_name(&self, addr: u64, size: u64, name: Option<&str>) -> Result<(), ErrorCode> {
        if let Some(name) = name {
            if name.len() > MAX_REGION_NAME_LEN {
                return Err(E_INVALID_ARGUMENT);
            }
        }
        let range = VirtRange::from_unaligned(addr, size)?;
        if !range.is_user() {
            return Err(E_BAD_ADDRESS);
        }

        let mut inner = self.inner.lock(line!());
        let Some(region) = inner
            .regions
            .get_mut(&range.start)
            .filter(|region| region.range() == range)
        else {
            return Err(E_INVALID_ARGUMENT);
        };
        if !region.is_mmap() {
            return Err(E_NOT_ALLOWED);
        }
        region.set_name(name.map(String::from));
        Ok(())
    }

    /// msyscall(addr) marks the region containing addr as
    /// syscall-capable; msyscall(0) seals the set. After sealing, further
    /// marking fails and syscalls are answered from the region flags.
    pub fn msyscall(&self, addr: u64) -> Result<(), ErrorCode> {
        let mut inner = self.inner.lock(line!());
        if inner.enforces_syscall_regions {
            return Err(E_NOT_ALLOWED);
        }
        if addr == 0 {
            inner.enforces_syscall_regions = true;
            return Ok(());
        }

        let Some(base) = inner.find_addr_base(addr) else {
            return Err(E_INVALID_ARGUMENT);
        };
        inner.regions.get_mut(&base).unwrap().set_syscall_region();
        Ok(())
    }

    pub fn may_invoke_syscalls(&self, addr: u64) -> bool {
        let inner = self.inner.lock(line!());
        if !inner.enforces_syscall_regions {
            return true;
        }
        inner
            .find_addr_base(addr)
            .map(|base| inner.regions[&base].is_syscall_region())
            .unwrap_or(false)
    }

    /// Exact-range lookup.
    pub fn find_region_from_range(&self, range: VirtRange) -> Option<RegionInfo> {
        let inner = self.inner.lock(line!());
        inner
            .regions
            .get(&range.start)
            .filter(|region| region.range() == range)
            .map(RegionInfo::of)
    }

    /// Superset lookup: the region wholly containing `range`, if any.
    pub fn find_region_containing(&self, range: VirtRange) -> Option<RegionInfo> {
        let inner = self.inner.lock(line!());
        inner
            .find_containing_base(range)
            .map(|base| RegionInfo::of(&inner.regions[&base]))
    }

    pub fn find_regions_intersecting(&self, range: VirtRange) -> Vec<RegionInfo> {
        let inner = self.inner.lock(line!());
        inner
            .bases_intersecting(range)
            .into_iter()
            .map(|base| RegionInfo::of(&inner.regions[&base]))
            .collect()
    }

    pub fn total_mapped_bytes(&self) -> u64 {
        let inner = self.inner.lock(line!());
        inner.regions.values().map(|region| region.size()).sum()
    }

    /// Memory-pressure entry point: reclaims every volatile anonymous
    /// object in this space. Returns the number of bytes released.
    pub fn purge_volatile_regions(&self) -> u64 {
        let inner = self.inner.lock(line!());
        let mut released = 0;
        for region in inner.regions.values() {
            if let Some(obj) = region.vmobject().as_anonymous() {
                released += obj.purge();
            }
        }
        if released > 0 {
            log::debug!("purged 0x{:x} volatile bytes", released);
        }
        released
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Process exit: every region goes away, shared counts included.
        let mut inner = self.inner.lock(line!());
        while let Some((_, region)) = inner.regions.pop_first() {
            inner.page_table.unmap(&region, true);
            region.unregister_shared_mapping();
        }
    }
}

impl AddressSpaceInner {
    fn insert_region(&mut self, region: Region) {
        let prev = self.regions.insert(region.base(), region);
        assert!(prev.is_none());
    }

    /// Installs hardware translations and inserts the region, undoing the
    /// range reservation on failure. The range must already be reserved.
    fn commit_region(&mut self, region: Region) -> Result<(), ErrorCode> {
        if let Err(err) = self.page_table.map(&region) {
            log::error!(
                "failed to map region at 0x{:x}: error {}",
                region.base(),
                err
            );
            region.unregister_shared_mapping();
            self.allocator.deallocate(region.range());
            return Err(err);
        }
        self.insert_region(region);
        Ok(())
    }

    /// Removes a region this space owns and returns its range to the
    /// allocator. A region we do not own means the region set is corrupt.
    fn deallocate_region(&mut self, base: u64) -> Region {
        let Some(region) = self.regions.remove(&base) else {
            panic!("deallocate_region: no region at 0x{:x}", base);
        };
        self.allocator.deallocate(region.range());
        region
    }

    fn find_containing_base(&self, range: VirtRange) -> Option<u64> {
        self.regions
            .range(..=range.start)
            .next_back()
            .filter(|(_, region)| region.range().contains_range(&range))
            .map(|(&base, _)| base)
    }

    fn find_addr_base(&self, addr: u64) -> Option<u64> {
        self.regions
            .range(..=addr)
            .next_back()
            .filter(|(_, region)| region.range().contains(addr))
            .map(|(&base, _)| base)
    }

    fn bases_intersecting(&self, range: VirtRange) -> Vec<u64> {
        self.regions
            .range(..range.end())
            .filter(|(_, region)| region.range().intersects(&range))
            .map(|(&base, _)| base)
            .collect()
    }
}

/// The surviving outer pieces of `region` with `excised` cut out. Offsets
/// into the backing object are preserved. The pieces are not registered
/// anywhere; the caller owns the bookkeeping.
fn split_region_around_range(
    region: &Region,
    excised: VirtRange,
) -> (Option<Region>, Option<Region>) {
    assert!(region.range().contains_range(&excised));

    let before = if excised.start > region.base() {
        Some(region.clone_for_subrange(VirtRange::new(
            region.base(),
            excised.start - region.base(),
        )))
    } else {
        None
    };
    let after = if excised.end() < region.range().end() {
        Some(region.clone_for_subrange(VirtRange::new(
            excised.end(),
            region.range().end() - excised.end(),
        )))
    } else {
        None
    };
    (before, after)
}
