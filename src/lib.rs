mod big_zone;
mod bitmap;
mod config;
mod error;
mod map;
mod mapper;
mod observer;
mod random;
mod root;
mod sync;
mod thread_cache;
mod zone;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_allocation_map;
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_arange_map;

use std::os::raw::c_void;
use std::ptr::NonNull;

pub use config::{GlobalConfig, ZeroSizePolicy, ZoneConfig};
pub use error::{FatalKind, MapError};
pub use mapper::PageProvider;
pub use observer::{set_observer, AllocEventObserver};

/// A single process-wide, never-allocated address handed back for
/// `alloc(0)` under [`ZeroSizePolicy::Sentinel`]. Never written through and
/// never returned by any other path, so two zero-size requests alias the
/// same address without either one being a live allocation.
static ZERO_SIZE_SENTINEL: u8 = 0;

fn zero_size_response() -> Option<NonNull<u8>> {
    match root::root().global_config().zero_size_policy {
        config::ZeroSizePolicy::Sentinel => {
            Some(unsafe { NonNull::new_unchecked(&ZERO_SIZE_SENTINEL as *const u8 as *mut u8) })
        }
        config::ZeroSizePolicy::Null => None,
    }
}

/// Allocates `size` bytes. Requests at or under
/// [`config::SMALL_SZ_MAX`] are served from a size-class zone; larger
/// requests go through the big-allocation path. Returns `None` only for
/// `size == 0` under [`ZeroSizePolicy::Null`] -- every other failure is
/// fatal (see [`error::fatal`]).
pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return zero_size_response();
    }

    let r = root::root();
    let _guard = r.enter();

    let ptr = if size > config::SMALL_SZ_MAX {
        match r.alloc_big(size as u64) {
            Ok(ptr) => ptr,
            Err(_) => return None,
        }
    } else {
        let cached = thread_cache::lookup(size).and_then(|zone_index| {
            r.try_alloc_from_cached_zone(zone_index, size)
        });

        let (ptr, zone_index) = match cached {
            Some(hit) => hit,
            None => r.alloc_small(size),
        };

        thread_cache::record(size, zone_index);
        ptr
    };

    observer::notify_alloc(size, ptr.as_ptr() as usize);
    Some(ptr)
}

/// Allocates space for `nmemb` elements of `size` bytes each, zeroed.
/// Aborts on `nmemb * size` overflow, per [`error::FatalKind::CallocOverflow`].
pub fn calloc(nmemb: usize, size: usize) -> Option<NonNull<u8>> {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => error::fatal(error::FatalKind::CallocOverflow, None),
    };

    let ptr = alloc(total)?;
    if total > 0 {
        // Small-zone chunks are already zeroed on first use and on reuse
        // when `clear_chunk_on_free` is set; big allocations are
        // freshly `mmap`'d and so kernel-zeroed. This covers the
        // remaining case (reuse with `clear_chunk_on_free` disabled).
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, total) };
    }
    Some(ptr)
}

/// Reallocates `ptr` (or allocates fresh, if `ptr` is `None`) to `size`
/// bytes, preserving the lesser of the old and new sizes' worth of content.
pub fn realloc(ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    let old_ptr = match ptr {
        None => return alloc(size),
        Some(p) => p,
    };

    if size == 0 {
        free(old_ptr);
        return zero_size_response();
    }

    let old_size = {
        let r = root::root();
        let _guard = r.enter();
        r.chunk_size_of(old_ptr)
    };
    let new_ptr = alloc(size)?;

    let copy_len = old_size.min(size);
    unsafe {
        std::ptr::copy_nonoverlapping(old_ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
    }
    free(old_ptr);

    Some(new_ptr)
}

/// Frees `ptr`, returning its chunk to quarantine for possible reuse.
pub fn free(ptr: NonNull<u8>) {
    let addr = ptr.as_ptr() as usize;
    let r = root::root();
    let _guard = r.enter();
    if let Some((chunk_size, zone_index)) = r.free_reporting(ptr, false) {
        thread_cache::record(chunk_size, zone_index);
    }
    observer::notify_free(addr);
}

/// Frees `ptr` permanently: the chunk (or big-zone node) is retired and
/// will never be handed out again.
pub fn free_permanently(ptr: NonNull<u8>) {
    let addr = ptr.as_ptr() as usize;
    let r = root::root();
    let _guard = r.enter();
    r.free_reporting(ptr, true);
    observer::notify_free(addr);
}

/// Reports the usable size of the chunk or big allocation backing `ptr`.
pub fn chunk_size(ptr: NonNull<u8>) -> usize {
    let r = root::root();
    let _guard = r.enter();
    r.chunk_size_of(ptr)
}

/// Creates a user-managed zone dedicated to `chunk_size`-byte allocations.
/// Returns an XOR-masked handle; the zone is never selected by
/// [`alloc`]'s first-fit search.
pub fn new_zone(chunk_size: usize) -> Result<u64, MapError> {
    let r = root::root();
    let _guard = r.enter();
    r.new_zone(chunk_size)
}

/// Allocates from a user-managed zone created by [`new_zone`]. `None` if
/// `size` doesn't fit the zone's chunk size or the zone is full -- unlike
/// [`alloc`], this never creates a replacement zone.
pub fn alloc_from_zone(handle: u64, size: usize) -> Option<NonNull<u8>> {
    let r = root::root();
    let _guard = r.enter();
    r.alloc_from_zone(handle, size)
}

/// Frees `ptr`, previously obtained from [`alloc_from_zone`] on the same
/// `handle`.
pub fn free_from_zone(handle: u64, ptr: NonNull<u8>) {
    let r = root::root();
    let _guard = r.enter();
    r.free_from_zone(handle, ptr);
}

/// Tears down a user-managed zone created by [`new_zone`]. The zone's
/// table slot is tombstoned, not reused, so every other zone's handle
/// stays valid.
pub fn destroy_zone(handle: u64) -> Result<(), MapError> {
    let r = root::root();
    let _guard = r.enter();
    r.destroy_zone(handle)
}

/// Total bytes reserved across every zone and every live big allocation.
/// An approximation of reserved, not live, bytes.
pub fn mem_usage() -> u64 {
    let r = root::root();
    let _guard = r.enter();
    r.mem_usage()
}

/// Counts chunks and big allocations currently outstanding. Idempotent
/// with no intervening alloc/free.
pub fn detect_leaks() -> u64 {
    let r = root::root();
    let _guard = r.enter();
    r.detect_leaks()
}

/// Reads the profiler output path from the environment, if a profiler
/// collaborator has been configured to look for it.
pub fn profiler_file_path() -> Option<String> {
    observer::profiler_file_path()
}

#[no_mangle]
pub extern "C" fn iso_alloc(size: usize) -> *mut c_void {
    alloc(size).map_or(std::ptr::null_mut(), |p| p.as_ptr() as *mut c_void)
}

#[no_mangle]
pub extern "C" fn iso_calloc(nmemb: usize, size: usize) -> *mut c_void {
    calloc(nmemb, size).map_or(std::ptr::null_mut(), |p| p.as_ptr() as *mut c_void)
}

/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this library's
/// allocation functions and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn iso_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let ptr = NonNull::new(ptr as *mut u8);
    realloc(ptr, size).map_or(std::ptr::null_mut(), |p| p.as_ptr() as *mut c_void)
}

/// # Safety
///
/// `ptr` must be non-null and previously returned by this library's
/// allocation functions, and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn iso_free(ptr: *mut c_void) {
    if let Some(p) = NonNull::new(ptr as *mut u8) {
        free(p);
    }
}

/// # Safety
///
/// `ptr` must be non-null and previously returned by this library's
/// allocation functions, and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn iso_free_permanently(ptr: *mut c_void) {
    if let Some(p) = NonNull::new(ptr as *mut u8) {
        free_permanently(p);
    }
}

/// # Safety
///
/// `ptr` must be non-null and previously returned by this library's
/// allocation functions, and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn iso_chunk_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr as *mut u8) {
        Some(p) => chunk_size(p),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn iso_alloc_new_zone(chunk_size: usize) -> u64 {
    new_zone(chunk_size).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn iso_alloc_from_zone(handle: u64, size: usize) -> *mut c_void {
    alloc_from_zone(handle, size).map_or(std::ptr::null_mut(), |p| p.as_ptr() as *mut c_void)
}

/// # Safety
///
/// `ptr` must be non-null and previously returned by [`iso_alloc_from_zone`]
/// for the same `handle`, and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn iso_free_from_zone(handle: u64, ptr: *mut c_void) {
    if let Some(p) = NonNull::new(ptr as *mut u8) {
        free_from_zone(handle, p);
    }
}

#[no_mangle]
pub extern "C" fn iso_alloc_destroy_zone(handle: u64) -> i32 {
    match destroy_zone(handle) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn iso_alloc_mem_usage() -> u64 {
    mem_usage()
}

#[no_mangle]
pub extern "C" fn iso_alloc_detect_leaks() -> u64 {
    detect_leaks()
}
