// End-to-end exercises of the memory syscall surface, from the handlers
// down through protection policy, region splitting, and the shared
// mapping counts. Hardware is stubbed with NullPageTable.

use std::sync::Arc;

use vmspace::err::*;
use vmspace::mm::address_space::VolatileAdvice;
use vmspace::mm::inode::{FileDescription, Inode};
use vmspace::mm::page_table::NullPageTable;
use vmspace::mm::vmobject::{AllocationStrategy, SharedInodeVmObject, VmObject};
use vmspace::mm::{AddressSpace, MapFlags, Prot, RegionFlags, VirtRange, PAGE_SIZE};
use vmspace::uspace::{caps, sys_mem, Process};
use vmspace::util::SpinLock;

struct TestFile {
    content: Vec<u8>,
    writable: bool,
    shared: SpinLock<Option<Arc<VmObject>>>,
}

impl TestFile {
    fn new(content: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            content,
            writable: true,
            shared: SpinLock::new(None),
        })
    }

    fn new_readonly(content: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            content,
            writable: false,
            shared: SpinLock::new(None),
        })
    }
}

impl Inode for TestFile {
    fn size(&self) -> u64 {
        self.content.len() as u64
    }

    fn may_write(&self) -> bool {
        self.writable
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ErrorCode> {
        let offset = offset as usize;
        if offset >= self.content.len() {
            return Ok(0);
        }
        let len = buf.len().min(self.content.len() - offset);
        buf[..len].copy_from_slice(&self.content[offset..offset + len]);
        Ok(len)
    }

    fn shared_vmobject(self: Arc<Self>) -> Result<Arc<VmObject>, ErrorCode> {
        let mut cached = self.shared.lock(line!());
        if let Some(obj) = &*cached {
            return Ok(obj.clone());
        }
        let obj = SharedInodeVmObject::create(self.clone());
        *cached = Some(obj.clone());
        Ok(obj)
    }
}

// A plausible dynamic loader image: ELF64 little-endian ET_DYN header
// followed by zero padding standing in for program headers and text.
fn loader_image() -> Vec<u8> {
    let mut bytes = vec![0_u8; 0x4000];
    bytes[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    bytes[4] = 2; // ELFCLASS64
    bytes[5] = 1; // little-endian
    bytes[6] = 1; // EV_CURRENT
    bytes[16..18].copy_from_slice(&3_u16.to_le_bytes()); // ET_DYN
    bytes[18..20].copy_from_slice(&0x3e_u16.to_le_bytes()); // x86-64
    bytes[20..24].copy_from_slice(&1_u32.to_le_bytes());
    bytes[32..40].copy_from_slice(&64_u64.to_le_bytes()); // e_phoff
    bytes[52..54].copy_from_slice(&64_u16.to_le_bytes()); // e_ehsize
    bytes[54..56].copy_from_slice(&56_u16.to_le_bytes()); // e_phentsize
    bytes[56..58].copy_from_slice(&2_u16.to_le_bytes()); // e_phnum
    bytes
}

fn new_space() -> Arc<AddressSpace> {
    AddressSpace::new(Arc::new(NullPageTable))
}

fn mmap_anon(space: &AddressSpace, size: u64, prot: Prot) -> u64 {
    space
        .mmap(
            0,
            size,
            0,
            prot,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
            None,
        )
        .unwrap()
}

#[test]
fn mmap_creates_a_findable_region() {
    let space = new_space();
    let addr = space
        .mmap(
            0,
            3 * PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
            Some("heap"),
        )
        .unwrap();
    assert_eq!(addr % PAGE_SIZE, 0);

    let info = space
        .find_region_from_range(VirtRange::new(addr, 3 * PAGE_SIZE))
        .unwrap();
    assert_eq!(info.prot, Prot::READ | Prot::WRITE);
    assert!(info.flags.contains(RegionFlags::MMAP));
    assert!(!info.flags.contains(RegionFlags::SHARED));
    assert_eq!(info.name.as_deref(), Some("heap"));
    assert_eq!(space.total_mapped_bytes(), 3 * PAGE_SIZE);
}

#[test]
fn mmap_rejects_wx_and_bad_flag_combinations() {
    let space = new_space();
    assert_eq!(
        space.mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE | Prot::EXEC,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
            None,
        ),
        Err(E_INVALID_ARGUMENT)
    );
    // Neither SHARED nor PRIVATE.
    assert_eq!(
        space.mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::ANONYMOUS,
            None,
            0,
            None
        ),
        Err(E_INVALID_ARGUMENT)
    );
    // Both.
    assert_eq!(
        space.mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::SHARED | MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
            None,
        ),
        Err(E_INVALID_ARGUMENT)
    );
    // Zero size.
    assert_eq!(
        space.mmap(
            0,
            0,
            0,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
            None
        ),
        Err(E_INVALID_ARGUMENT)
    );
    // Stacks are anonymous read+write memory, nothing else.
    assert_eq!(
        space.mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::STACK,
            None,
            0,
            None,
        ),
        Err(E_INVALID_ARGUMENT)
    );
    assert_eq!(space.total_mapped_bytes(), 0);
}

#[test]
fn mmap_hint_falls_back_but_fixed_does_not() {
    let space = new_space();
    let addr = mmap_anon(&space, 4 * PAGE_SIZE, Prot::READ | Prot::WRITE);

    // Hint points into the live mapping: mmap silently picks elsewhere.
    let other = space
        .mmap(
            addr + PAGE_SIZE,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
            None,
        )
        .unwrap();
    assert!(!VirtRange::new(addr, 4 * PAGE_SIZE).contains(other));

    // MAP_FIXED on the same spot refuses instead.
    assert_eq!(
        space.mmap(
            addr + PAGE_SIZE,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
            None,
            0,
            None,
        ),
        Err(E_OUT_OF_MEMORY)
    );

    // And an honorable hint is honored exactly.
    let target = addr + 0x100 * PAGE_SIZE;
    let placed = space
        .mmap(
            target,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
            None,
            0,
            None,
        )
        .unwrap();
    assert_eq!(placed, target);
}

#[test]
fn munmap_of_unmapped_range_fails() {
    let space = new_space();
    assert_eq!(space.munmap(0x10000, PAGE_SIZE), Err(E_INVALID_ARGUMENT));

    let addr = mmap_anon(&space, PAGE_SIZE, Prot::READ);
    space.munmap(addr, PAGE_SIZE).unwrap();
    assert_eq!(space.munmap(addr, PAGE_SIZE), Err(E_INVALID_ARGUMENT));
    assert_eq!(space.total_mapped_bytes(), 0);
}

#[test]
fn munmap_middle_splits_the_region() {
    let space = new_space();
    let addr = mmap_anon(&space, 3 * PAGE_SIZE, Prot::READ | Prot::WRITE);

    space.munmap(addr + PAGE_SIZE, PAGE_SIZE).unwrap();
    assert_eq!(space.total_mapped_bytes(), 2 * PAGE_SIZE);

    assert!(space
        .find_region_from_range(VirtRange::new(addr, PAGE_SIZE))
        .is_some());
    assert!(space
        .find_region_containing(VirtRange::new(addr + PAGE_SIZE, PAGE_SIZE))
        .is_none());
    assert!(space
        .find_region_from_range(VirtRange::new(addr + 2 * PAGE_SIZE, PAGE_SIZE))
        .is_some());

    // The hole is immediately reusable.
    let refill = space
        .mmap(
            addr + PAGE_SIZE,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
            None,
            0,
            None,
        )
        .unwrap();
    assert_eq!(refill, addr + PAGE_SIZE);
}

#[test]
fn munmap_spanning_a_kernel_region_changes_nothing() {
    let space = new_space();
    let base = 0x40_0000;
    space
        .allocate_region(
            VirtRange::new(base, PAGE_SIZE),
            Some("master-tls"),
            Prot::READ,
            AllocationStrategy::Reserve,
        )
        .unwrap();
    let user = space
        .mmap(
            base + PAGE_SIZE,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
            None,
            0,
            None,
        )
        .unwrap();
    assert_eq!(user, base + PAGE_SIZE);

    // The span covers both; the non-mmap region poisons the whole call.
    assert_eq!(space.munmap(base, 2 * PAGE_SIZE), Err(E_NOT_ALLOWED));
    assert!(space
        .find_region_from_range(VirtRange::new(base, PAGE_SIZE))
        .is_some());
    assert!(space
        .find_region_from_range(VirtRange::new(user, PAGE_SIZE))
        .is_some());
}

#[test]
fn mprotect_of_a_kernel_region_is_refused() {
    let space = new_space();
    let base = 0x40_0000;
    space
        .allocate_region(
            VirtRange::new(base, PAGE_SIZE),
            Some("stack-guard"),
            Prot::READ,
            AllocationStrategy::Reserve,
        )
        .unwrap();

    assert_eq!(
        space.mprotect(base, PAGE_SIZE, Prot::READ | Prot::WRITE),
        Err(E_NOT_ALLOWED)
    );
    let info = space
        .find_region_from_range(VirtRange::new(base, PAGE_SIZE))
        .unwrap();
    assert_eq!(info.prot, Prot::READ);
}

#[test]
fn mprotect_spanning_two_regions_changes_nothing() {
    let space = new_space();
    let addr = mmap_anon(&space, 2 * PAGE_SIZE, Prot::READ | Prot::WRITE);
    // Split into two adjacent regions with distinct protections.
    space.mprotect(addr + PAGE_SIZE, PAGE_SIZE, Prot::READ).unwrap();

    assert_eq!(
        space.mprotect(addr, 2 * PAGE_SIZE, Prot::READ),
        Err(E_INVALID_ARGUMENT)
    );

    let regions = space.find_regions_intersecting(VirtRange::new(addr, 2 * PAGE_SIZE));
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].prot, Prot::READ | Prot::WRITE);
    assert_eq!(regions[1].prot, Prot::READ);
}

#[test]
fn mprotect_subrange_tiles_into_three_regions() {
    let space = new_space();
    let addr = mmap_anon(&space, 3 * PAGE_SIZE, Prot::READ | Prot::WRITE);

    space
        .mprotect(addr + PAGE_SIZE, PAGE_SIZE, Prot::READ)
        .unwrap();

    let regions = space.find_regions_intersecting(VirtRange::new(addr, 3 * PAGE_SIZE));
    assert_eq!(regions.len(), 3);
    assert_eq!(regions[0].range, VirtRange::new(addr, PAGE_SIZE));
    assert_eq!(regions[0].prot, Prot::READ | Prot::WRITE);
    assert_eq!(regions[1].range, VirtRange::new(addr + PAGE_SIZE, PAGE_SIZE));
    assert_eq!(regions[1].prot, Prot::READ);
    assert_eq!(
        regions[2].range,
        VirtRange::new(addr + 2 * PAGE_SIZE, PAGE_SIZE)
    );
    assert_eq!(regions[2].prot, Prot::READ | Prot::WRITE);
    assert_eq!(space.total_mapped_bytes(), 3 * PAGE_SIZE);
}

#[test]
fn mprotect_history_is_monotonic() {
    let space = new_space();
    let file = TestFile::new(vec![0_u8; 0x4000]);
    let fd = FileDescription::new(file, true, true);

    let addr = space
        .mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::PRIVATE,
            Some(&fd),
            0,
            None,
        )
        .unwrap();

    // R -> RX is fine for a file mapping, CAP checks live a layer up.
    space.mprotect(addr, PAGE_SIZE, Prot::READ | Prot::EXEC).unwrap();
    // Once executable, never writable again. Not even after dropping X.
    assert_eq!(
        space.mprotect(addr, PAGE_SIZE, Prot::READ | Prot::WRITE),
        Err(E_ACCESS_DENIED)
    );
    space.mprotect(addr, PAGE_SIZE, Prot::READ).unwrap();
    assert_eq!(
        space.mprotect(addr, PAGE_SIZE, Prot::READ | Prot::WRITE),
        Err(E_ACCESS_DENIED)
    );
}

#[test]
fn split_pieces_inherit_protection_history() {
    let space = new_space();
    let file = TestFile::new(vec![0_u8; 0x4000]);
    let fd = FileDescription::new(file, true, true);

    let addr = space
        .mmap(
            0,
            3 * PAGE_SIZE,
            0,
            Prot::READ | Prot::EXEC,
            MapFlags::PRIVATE,
            Some(&fd),
            0,
            None,
        )
        .unwrap();
    space.mprotect(addr + PAGE_SIZE, PAGE_SIZE, Prot::READ).unwrap();

    // The middle piece dropped X, but its history survives the split.
    assert_eq!(
        space.mprotect(addr + PAGE_SIZE, PAGE_SIZE, Prot::READ | Prot::WRITE),
        Err(E_ACCESS_DENIED)
    );
}

#[test]
fn loader_exception_allows_rw_to_rx_once() {
    let space = new_space();
    let file = TestFile::new(loader_image());
    let fd = FileDescription::new(file, true, true);

    let addr = space
        .mmap(
            0,
            4 * PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE,
            Some(&fd),
            0,
            Some("Loader.so"),
        )
        .unwrap();

    // Relocations done; flip the image executable.
    space
        .mprotect(addr, 4 * PAGE_SIZE, Prot::READ | Prot::EXEC)
        .unwrap();

    // The exception is RW -> RX on the image base only; having used it,
    // the region is now formerly-executable and W stays gone.
    assert_eq!(
        space.mprotect(addr, 4 * PAGE_SIZE, Prot::READ | Prot::WRITE),
        Err(E_ACCESS_DENIED)
    );
}

#[test]
fn loader_exception_rejects_non_elf_and_nonzero_offset() {
    let space = new_space();

    // Same transition on a file that is not a shared object.
    let plain = FileDescription::new(TestFile::new(vec![0xaa; 0x4000]), true, true);
    let addr = space
        .mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE,
            Some(&plain),
            0,
            None,
        )
        .unwrap();
    assert_eq!(
        space.mprotect(addr, PAGE_SIZE, Prot::READ | Prot::EXEC),
        Err(E_ACCESS_DENIED)
    );

    // A real image, but mapped from a nonzero file offset.
    let image = FileDescription::new(TestFile::new(loader_image()), true, true);
    let addr = space
        .mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE,
            Some(&image),
            PAGE_SIZE,
            None,
        )
        .unwrap();
    assert_eq!(
        space.mprotect(addr, PAGE_SIZE, Prot::READ | Prot::EXEC),
        Err(E_ACCESS_DENIED)
    );
}

#[test]
fn mprotect_shared_write_needs_a_writable_inode() {
    let space = new_space();
    // The description says writable, the file permission bits do not
    // (think chmod after open); the inode check wins for shared writes.
    let file = TestFile::new_readonly(vec![0_u8; 0x4000]);
    let fd = FileDescription::new(file, true, true);

    let addr = space
        .mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        )
        .unwrap();
    assert_eq!(
        space.mprotect(addr, PAGE_SIZE, Prot::READ | Prot::WRITE),
        Err(E_ACCESS_DENIED)
    );
}

#[test]
fn shared_file_is_never_writable_and_executable_at_once() {
    let file = TestFile::new(vec![0_u8; 0x8000]);

    let space_a = new_space();
    let space_b = new_space();
    let fd = FileDescription::new(file, true, true);

    let a = space_a
        .mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        )
        .unwrap();

    // Another address space, same inode: X is refused while W exists.
    assert_eq!(
        space_b.mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::EXEC,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        ),
        Err(E_ACCESS_DENIED)
    );

    space_a.munmap(a, PAGE_SIZE).unwrap();

    // The writable mapping is gone; now X works, and W is refused.
    let b = space_b
        .mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::EXEC,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        )
        .unwrap();
    assert_eq!(
        space_a.mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        ),
        Err(E_ACCESS_DENIED)
    );

    space_b.munmap(b, PAGE_SIZE).unwrap();
}

#[test]
fn shared_counts_survive_splits_and_unmaps() {
    let file = TestFile::new(vec![0_u8; 0x8000]);
    let space = new_space();
    let other = new_space();
    let fd = FileDescription::new(file, true, true);

    let addr = space
        .mmap(
            0,
            3 * PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        )
        .unwrap();

    // Punch out the middle page; two writable pieces remain.
    space.munmap(addr + PAGE_SIZE, PAGE_SIZE).unwrap();
    assert_eq!(
        other.mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::EXEC,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        ),
        Err(E_ACCESS_DENIED)
    );

    space.munmap(addr, PAGE_SIZE).unwrap();
    assert_eq!(
        other.mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::EXEC,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        ),
        Err(E_ACCESS_DENIED)
    );

    // The last writable piece goes; the object is finally X-able.
    space.munmap(addr + 2 * PAGE_SIZE, PAGE_SIZE).unwrap();
    other
        .mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::EXEC,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        )
        .unwrap();
}

#[test]
fn mremap_private_clone_releases_the_shared_count() {
    let file = TestFile::new(vec![0_u8; 0x8000]);
    let space = new_space();
    let other = new_space();
    let fd = FileDescription::new(file, true, true);

    let addr = space
        .mmap(
            0,
            2 * PAGE_SIZE,
            0,
            Prot::READ | Prot::WRITE,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        )
        .unwrap();

    let new_addr = space.mremap(addr, 2 * PAGE_SIZE, MapFlags::PRIVATE).unwrap();
    assert_eq!(new_addr, addr);

    let info = space
        .find_region_from_range(VirtRange::new(addr, 2 * PAGE_SIZE))
        .unwrap();
    assert!(!info.flags.contains(RegionFlags::SHARED));

    // The global writable count went with it.
    other
        .mmap(
            0,
            PAGE_SIZE,
            0,
            Prot::READ | Prot::EXEC,
            MapFlags::SHARED,
            Some(&fd),
            0,
            None,
        )
        .unwrap();

    // Anything but the private-clone request is not implemented.
    assert_eq!(
        space.mremap(addr, 2 * PAGE_SIZE, MapFlags::SHARED),
        Err(E_NOT_IMPLEMENTED)
    );
}

#[test]
fn madvise_volatile_purge_reports_data_loss() {
    let space = new_space();
    let addr = mmap_anon(&space, 2 * PAGE_SIZE, Prot::READ | Prot::WRITE);

    assert_eq!(
        space
            .madvise_volatile(addr, 2 * PAGE_SIZE, VolatileAdvice::Get)
            .unwrap(),
        0
    );
    space
        .madvise_volatile(addr, 2 * PAGE_SIZE, VolatileAdvice::SetVolatile)
        .unwrap();
    assert_eq!(
        space
            .madvise_volatile(addr, 2 * PAGE_SIZE, VolatileAdvice::Get)
            .unwrap(),
        1
    );

    assert_eq!(space.purge_volatile_regions(), 2 * PAGE_SIZE);
    assert_eq!(space.purge_volatile_regions(), 0);

    // SetNonvolatile reports that the content was purged, exactly once.
    assert_eq!(
        space
            .madvise_volatile(addr, 2 * PAGE_SIZE, VolatileAdvice::SetNonvolatile)
            .unwrap(),
        1
    );
    assert_eq!(
        space
            .madvise_volatile(addr, 2 * PAGE_SIZE, VolatileAdvice::SetNonvolatile)
            .unwrap(),
        0
    );
}

#[test]
fn set_mmap_name_renames_an_exact_region() {
    let space = new_space();
    let addr = mmap_anon(&space, PAGE_SIZE, Prot::READ | Prot::WRITE);

    space.set_mmap_name(addr, PAGE_SIZE, Some("scratch")).unwrap();
    let info = space
        .find_region_from_range(VirtRange::new(addr, PAGE_SIZE))
        .unwrap();
    assert_eq!(info.name.as_deref(), Some("scratch"));

    space.set_mmap_name(addr, PAGE_SIZE, None).unwrap();
    let info = space
        .find_region_from_range(VirtRange::new(addr, PAGE_SIZE))
        .unwrap();
    assert_eq!(info.name, None);

    assert_eq!(
        space.set_mmap_name(addr, 2 * PAGE_SIZE, Some("nope")),
        Err(E_INVALID_ARGUMENT)
    );
}

#[test]
fn msyscall_marks_then_seals() {
    let space = new_space();
    let text = mmap_anon(&space, PAGE_SIZE, Prot::READ);
    let data = mmap_anon(&space, PAGE_SIZE, Prot::READ | Prot::WRITE);

    // Before sealing everything may invoke syscalls.
    assert!(space.may_invoke_syscalls(data));

    space.msyscall(text).unwrap();
    space.msyscall(0).unwrap();

    assert!(space.may_invoke_syscalls(text));
    assert!(space.may_invoke_syscalls(text + PAGE_SIZE - 1));
    assert!(!space.may_invoke_syscalls(data));
    assert!(!space.may_invoke_syscalls(0xdead_0000));

    // Sealed means sealed.
    assert_eq!(space.msyscall(data), Err(E_NOT_ALLOWED));
    assert_eq!(space.msyscall(0), Err(E_NOT_ALLOWED));
}

#[test]
fn randomized_mappings_land_inside_user_space() {
    let space = new_space();
    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..8 {
        let addr = space
            .mmap(
                0,
                PAGE_SIZE,
                0,
                Prot::READ,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::RANDOMIZED,
                None,
                0,
                None,
            )
            .unwrap();
        assert!(VirtRange::new(addr, PAGE_SIZE).is_user());
        assert_eq!(addr % PAGE_SIZE, 0);
        seen.insert(addr);
    }
    // Eight draws from a 2^45-byte space collide with probability ~0.
    assert!(seen.len() > 1);
}

#[test]
fn syscall_layer_gates_capabilities_and_handles() {
    let process = Process::new(Arc::new(NullPageTable), 0);

    // PROT_EXEC without CAP_MAP_EXEC.
    let file = TestFile::new(loader_image());
    process.add_file(3, Arc::new(FileDescription::new(file, true, false)));
    assert_eq!(
        sys_mem::sys_mmap(
            &process,
            0,
            PAGE_SIZE,
            0,
            (Prot::READ | Prot::EXEC).bits() as u32,
            MapFlags::PRIVATE.bits(),
            3,
            0,
            None,
        ),
        Err(E_NOT_ALLOWED)
    );

    // MAP_FIXED without CAP_MAP_FIXED.
    assert_eq!(
        sys_mem::sys_mmap(
            &process,
            0x80_0000,
            PAGE_SIZE,
            0,
            Prot::READ.bits() as u32,
            (MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED).bits(),
            -1,
            0,
            None,
        ),
        Err(E_NOT_ALLOWED)
    );

    // Unknown flag bits are refused outright.
    assert_eq!(
        sys_mem::sys_mmap(
            &process,
            0,
            PAGE_SIZE,
            0,
            Prot::READ.bits() as u32,
            0x8000_0000,
            -1,
            0,
            None
        ),
        Err(E_INVALID_ARGUMENT)
    );
    assert_eq!(
        sys_mem::sys_mprotect(&process, 0x10000, PAGE_SIZE, 0xff),
        Err(E_INVALID_ARGUMENT)
    );

    // A file mapping needs a live handle.
    assert_eq!(
        sys_mem::sys_mmap(
            &process,
            0,
            PAGE_SIZE,
            0,
            Prot::READ.bits() as u32,
            MapFlags::PRIVATE.bits(),
            99,
            0,
            None,
        ),
        Err(E_BAD_HANDLE)
    );
}

#[test]
fn syscall_layer_round_trip() {
    let process = Process::new(Arc::new(NullPageTable), caps::CAP_MAP_EXEC);

    let addr = sys_mem::sys_mmap(
        &process,
        0,
        2 * PAGE_SIZE,
        0,
        (Prot::READ | Prot::WRITE).bits() as u32,
        (MapFlags::PRIVATE | MapFlags::ANONYMOUS).bits(),
        -1,
        0,
        Some("arena"),
    )
    .unwrap();

    sys_mem::sys_madvise(&process, addr, 2 * PAGE_SIZE, sys_mem::MADVISE_SET_VOLATILE).unwrap();
    assert_eq!(
        sys_mem::sys_madvise(&process, addr, 2 * PAGE_SIZE, sys_mem::MADVISE_GET_VOLATILE)
            .unwrap(),
        1
    );
    assert_eq!(
        sys_mem::sys_madvise(&process, addr, 2 * PAGE_SIZE, 77),
        Err(E_INVALID_ARGUMENT)
    );

    sys_mem::sys_set_mmap_name(&process, addr, 2 * PAGE_SIZE, Some("renamed")).unwrap();
    sys_mem::sys_mprotect(&process, addr, 2 * PAGE_SIZE, Prot::READ.bits() as u32).unwrap();
    sys_mem::sys_munmap(&process, addr, 2 * PAGE_SIZE).unwrap();
    assert_eq!(
        sys_mem::sys_munmap(&process, addr, 2 * PAGE_SIZE),
        Err(E_INVALID_ARGUMENT)
    );
}
