// Protection policy. Pure checks only: nothing in this module mutates
// any state, so callers can evaluate the full policy before touching the
// region set.

use alloc::vec;

use xmas_elf::header::{self, Class, Type};

use super::inode::FileDescription;
use super::region::Region;
use super::vmobject::VmObject;
use super::{Prot, PAGE_SIZE};
use crate::err::*;

/// Policy for a fresh mapping: no history exists yet.
pub fn validate_mmap_prot(
    prot: Prot,
    is_stack: bool,
    is_anonymous: bool,
    shared: bool,
    fd: Option<&FileDescription>,
) -> Result<(), ErrorCode> {
    if prot.contains(Prot::WRITE | Prot::EXEC) {
        log::debug!("mmap: W|X requested");
        return Err(E_INVALID_ARGUMENT);
    }

    if is_stack && (prot.contains(Prot::EXEC) || !prot.contains(Prot::READ | Prot::WRITE)) {
        log::debug!("mmap: bad stack prot {:?}", prot);
        return Err(E_INVALID_ARGUMENT);
    }

    if is_anonymous && prot.contains(Prot::EXEC) {
        log::debug!("mmap: EXEC on anonymous memory");
        return Err(E_ACCESS_DENIED);
    }

    if let Some(fd) = fd {
        if prot.contains(Prot::READ) && !fd.is_readable() {
            return Err(E_ACCESS_DENIED);
        }
        if shared && prot.contains(Prot::WRITE) && !fd.is_writable() {
            return Err(E_ACCESS_DENIED);
        }
    }

    Ok(())
}

/// Policy for changing the protection of an existing region. The region's
/// monotonic history participates: once writable, never executable (and
/// vice versa), except through the dynamic-loader exception below.
pub fn validate_prot_change(region: &Region, new_prot: Prot) -> Result<(), ErrorCode> {
    if new_prot.contains(Prot::WRITE | Prot::EXEC) {
        log::debug!("mprotect: W|X requested for region at 0x{:x}", region.base());
        return Err(E_INVALID_ARGUMENT);
    }

    if region.is_stack()
        && (new_prot.contains(Prot::EXEC) || !new_prot.contains(Prot::READ | Prot::WRITE))
    {
        return Err(E_INVALID_ARGUMENT);
    }

    if region.vmobject().is_anonymous() && new_prot.contains(Prot::EXEC) {
        log::debug!("mprotect: EXEC on anonymous region at 0x{:x}", region.base());
        return Err(E_ACCESS_DENIED);
    }

    if region.has_been_executable() && new_prot.contains(Prot::WRITE) {
        log::debug!("mprotect: W on formerly-X region at 0x{:x}", region.base());
        return Err(E_ACCESS_DENIED);
    }

    if region.has_been_writable()
        && new_prot.contains(Prot::EXEC)
        && !allows_dynamic_loader_exception(region, new_prot)
    {
        log::debug!("mprotect: X on formerly-W region at 0x{:x}", region.base());
        return Err(E_ACCESS_DENIED);
    }

    if let Some(inode) = region.vmobject().inode() {
        if new_prot.contains(Prot::READ) && !inode.may_read() {
            return Err(E_ACCESS_DENIED);
        }
        if region.is_shared() && new_prot.contains(Prot::WRITE) && !inode.may_write() {
            return Err(E_ACCESS_DENIED);
        }
    }

    if let Some(shared) = region.vmobject().as_shared_inode() {
        if new_prot.contains(Prot::EXEC) && shared.writable_mappings() > 0 {
            return Err(E_ACCESS_DENIED);
        }
        if new_prot.contains(Prot::WRITE) && shared.executable_mappings() > 0 {
            return Err(E_ACCESS_DENIED);
        }
    }

    Ok(())
}

// The dynamic loader maps its own text RW, relocates it in place, then
// flips it RX. That is the one tolerated W-then-X transition, and only
// for a private file mapping whose content actually looks like an ELF
// shared object.
fn allows_dynamic_loader_exception(region: &Region, new_prot: Prot) -> bool {
    if region.prot() != (Prot::READ | Prot::WRITE) || new_prot != (Prot::READ | Prot::EXEC) {
        return false;
    }
    if region.is_shared() || region.offset_in_vmobject() != 0 {
        return false;
    }
    let VmObject::PrivateInode(obj) = &**region.vmobject() else {
        return false;
    };

    let mut first_page = vec![0_u8; PAGE_SIZE as usize];
    let Ok(len) = obj.inode().read_bytes(0, &mut first_page) else {
        return false;
    };

    is_dynamic_loader_image(&first_page[..len], obj.inode().size())
}

// parse_header reads the pt2 struct through a pointer that must be
// 8-byte aligned; arbitrary input slices are not.
#[repr(align(8))]
struct AlignedFileHeader([u8; 64]);

/// True if `bytes` (the first page of a file of `inode_size` bytes) parse
/// as an ELF64 shared object whose program headers fit inside the file.
/// Total on arbitrary input; must never panic, `bytes` is untrusted.
pub fn is_dynamic_loader_image(bytes: &[u8], inode_size: u64) -> bool {
    let mut aligned = AlignedFileHeader([0; 64]);
    if bytes.len() < aligned.0.len() {
        // Shorter than an ELF64 file header.
        return false;
    }
    aligned.0.copy_from_slice(&bytes[..64]);

    let header = match header::parse_header(&aligned.0) {
        Ok(header) => header,
        Err(_) => return false,
    };

    if header.pt1.class() != Class::SixtyFour {
        return false;
    }
    if header.pt2.type_().as_type() != Type::SharedObject {
        return false;
    }
    if header.pt2.ph_count() == 0 {
        return false;
    }
    if (header.pt2.header_size() as u64) > inode_size {
        return false;
    }

    let ph_bytes = (header.pt2.ph_entry_size() as u64) * (header.pt2.ph_count() as u64);
    match header.pt2.ph_offset().checked_add(ph_bytes) {
        Some(ph_end) => ph_end <= inode_size,
        None => false,
    }
}
