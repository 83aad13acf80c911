// Memory syscall entry points.
//
// Everything here is decode-and-gate: raw argument words become typed
// values, capability bits are checked, file handles are resolved, and the
// rest is the address space's problem. Any bit we do not recognize is a
// hard E_INVALID_ARGUMENT; silently ignoring unknown flags would make
// them impossible to assign meaning later.

use alloc::sync::Arc;

use super::{caps, Process};
use crate::err::*;
use crate::mm::address_space::VolatileAdvice;
use crate::mm::inode::FileDescription;
use crate::mm::{MapFlags, Prot};

pub const MADVISE_SET_VOLATILE: u32 = 1;
pub const MADVISE_SET_NONVOLATILE: u32 = 2;
pub const MADVISE_GET_VOLATILE: u32 = 3;

fn decode_prot(prot: u32) -> Result<Prot, ErrorCode> {
    let Ok(raw) = u8::try_from(prot) else {
        log::debug!("bad prot bits: 0x{:x}", prot);
        return Err(E_INVALID_ARGUMENT);
    };
    Prot::from_bits(raw).ok_or_else(|| {
        log::debug!("bad prot bits: 0x{:x}", prot);
        E_INVALID_ARGUMENT
    })
}

fn decode_map_flags(flags: u32) -> Result<MapFlags, ErrorCode> {
    MapFlags::from_bits(flags).ok_or_else(|| {
        log::debug!("bad mmap flags: 0x{:x}", flags);
        E_INVALID_ARGUMENT
    })
}

#[allow(clippy::too_many_arguments)]
pub fn sys_mmap(
    process: &Process,
    addr: u64,
    size: u64,
    alignment: u64,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u64,
    name: Option<&str>,
) -> Result<u64, ErrorCode> {
    let prot = decode_prot(prot)?;
    let flags = decode_map_flags(flags)?;

    if prot.contains(Prot::EXEC) && process.capabilities() & caps::CAP_MAP_EXEC == 0 {
        log::debug!("sys_mmap: PROT_EXEC w/o CAP_MAP_EXEC");
        return Err(E_NOT_ALLOWED);
    }
    if flags.contains(MapFlags::FIXED) && process.capabilities() & caps::CAP_MAP_FIXED == 0 {
        log::debug!("sys_mmap: MAP_FIXED w/o CAP_MAP_FIXED");
        return Err(E_NOT_ALLOWED);
    }

    let file: Option<Arc<FileDescription>> = if flags.contains(MapFlags::ANONYMOUS) {
        None
    } else {
        Some(process.get_file(fd)?)
    };

    process.address_space().mmap(
        addr,
        size,
        alignment,
        prot,
        flags,
        file.as_deref(),
        offset,
        name,
    )
}

pub fn sys_mprotect(process: &Process, addr: u64, size: u64, prot: u32) -> Result<(), ErrorCode> {
    let prot = decode_prot(prot)?;
    if prot.contains(Prot::EXEC) && process.capabilities() & caps::CAP_MAP_EXEC == 0 {
        log::debug!("sys_mprotect: PROT_EXEC w/o CAP_MAP_EXEC");
        return Err(E_NOT_ALLOWED);
    }
    process.address_space().mprotect(addr, size, prot)
}

pub fn sys_munmap(process: &Process, addr: u64, size: u64) -> Result<(), ErrorCode> {
    process.address_space().munmap(addr, size)
}

pub fn sys_mremap(process: &Process, addr: u64, size: u64, flags: u32) -> Result<u64, ErrorCode> {
    let flags = decode_map_flags(flags)?;
    process.address_space().mremap(addr, size, flags)
}

pub fn sys_madvise(
    process: &Process,
    addr: u64,
    size: u64,
    advice: u32,
) -> Result<u64, ErrorCode> {
    let advice = match advice {
        MADVISE_SET_VOLATILE => VolatileAdvice::SetVolatile,
        MADVISE_SET_NONVOLATILE => VolatileAdvice::SetNonvolatile,
        MADVISE_GET_VOLATILE => VolatileAdvice::Get,
        _ => {
            log::debug!("sys_madvise: bad advice {}", advice);
            return Err(E_INVALID_ARGUMENT);
        }
    };
    process.address_space().madvise_volatile(addr, size, advice)
}

pub fn sys_set_mmap_name(
    process: &Process,
    addr: u64,
    size: u64,
    name: Option<&str>,
) -> Result<(), ErrorCode> {
    process.address_space().set_mmap_name(addr, size, name)
}

pub fn sys_msyscall(process: &Process, addr: u64) -> Result<(), ErrorCode> {
    process.address_space().msyscall(addr)
}
