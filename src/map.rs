//! Thin wrapper over the raw `mmap`/`mprotect`/`madvise`/`munmap` calls this
//! allocator needs.
//!
//! `backtrace-labs/slitter` delegates this to a small C support library
//! compiled by its `build.rs`. This crate has no C support library, so it
//! gets the same syscalls from `nix`, the way this pack's other
//! hardened-allocation and sandboxed-region examples do.

use std::ffi::c_void;
use std::ptr::NonNull;

use nix::sys::mman::{madvise, mmap, mprotect, munmap, MapFlags, MmapAdvise, ProtFlags};

use crate::error::MapError;

fn page_size_or_die() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => panic!("unable to determine system page size"),
    }
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn to_map_error(_err: nix::Error) -> MapError {
    MapError::OutOfMemory
}

/// Reserves and backs a fresh anonymous, zeroed, read-write mapping of
/// `size` bytes. `size` must already be a multiple of the page size.
pub fn map_rw(size: usize, populate: bool) -> Result<NonNull<u8>, MapError> {
    assert!(size > 0 && size % page_size() == 0, "bad region size={}", size);

    let mut flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
    if populate {
        flags |= MapFlags::MAP_POPULATE;
    }

    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            flags,
            -1,
            0,
        )
    }
    .map_err(to_map_error)?;

    NonNull::new(addr as *mut u8).ok_or(MapError::OutOfMemory)
}

/// Reserves `size` bytes of address space with no access permissions at all,
/// without necessarily backing them with memory. Used to carve out guard
/// pages and as the base reservation that guarded regions are sliced from.
pub fn map_none(size: usize) -> Result<NonNull<u8>, MapError> {
    assert!(size > 0 && size % page_size() == 0, "bad region size={}", size);

    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            -1,
            0,
        )
    }
    .map_err(to_map_error)?;

    NonNull::new(addr as *mut u8).ok_or(MapError::OutOfMemory)
}

/// Changes the protection of `[addr, addr + size)` to `prot`.
pub fn protect(addr: NonNull<u8>, size: usize, prot: ProtFlags) -> Result<(), MapError> {
    if size == 0 {
        return Ok(());
    }
    assert!(size % page_size() == 0, "bad region size={}", size);

    unsafe { mprotect(addr.as_ptr() as *mut c_void, size, prot) }.map_err(to_map_error)
}

/// Switches `[addr, addr + page_size())` to no-access, turning it into a
/// guard page.
pub fn guard(addr: NonNull<u8>) -> Result<(), MapError> {
    protect(addr, page_size(), ProtFlags::PROT_NONE)
}

/// Tells the kernel the pages in `[addr, addr + size)` are no longer needed;
/// their contents may be discarded, but the mapping itself stays valid and
/// demand-faults back in as zeroed memory on next touch.
pub fn advise_dontneed(addr: NonNull<u8>, size: usize) -> Result<(), MapError> {
    if size == 0 {
        return Ok(());
    }
    unsafe { madvise(addr.as_ptr() as *mut c_void, size, MmapAdvise::MADV_DONTNEED) }
        .map_err(to_map_error)
}

/// Releases `[addr, addr + size)` back to the kernel entirely.
pub fn unmap(addr: NonNull<u8>, size: usize) -> Result<(), MapError> {
    if size == 0 {
        return Ok(());
    }
    unsafe { munmap(addr.as_ptr() as *mut c_void, size) }.map_err(to_map_error)
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert_eq!(page_size() % 4096, 0);
}

// Simulate a data + metadata allocation workflow: overallocate, trim
// the slop, and ask for real memory in some of the remaining space.
#[test]
fn smoke_test() {
    let region_size = 1usize << 21;
    let base = map_none(3 * region_size).expect("reserve should succeed");

    assert!(region_size > 3 * page_size());

    let bottom = base;
    let guard_page = NonNull::new((base.as_ptr() as usize + page_size()) as *mut u8)
        .expect("should be non-null");
    let remainder = NonNull::new((base.as_ptr() as usize + 2 * page_size()) as *mut u8)
        .expect("should be non-null");

    protect(bottom, page_size(), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
        .expect("should allocate bottom");
    guard(guard_page).expect("should leave guard page unreadable");
    protect(
        remainder,
        region_size - 2 * page_size(),
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
    )
    .expect("should allocate remainder");

    unsafe {
        std::ptr::write_bytes(bottom.as_ptr(), 0x11, page_size());
        assert_eq!(*bottom.as_ptr(), 0x11);
    }

    unmap(base, 3 * region_size).expect("should release everything");
}
