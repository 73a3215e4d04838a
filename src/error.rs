//! Error types and the fatal-abort path.
//!
//! Two surfaces exist on purpose. [`MapError`] covers the handful of
//! failures that can legitimately happen before any security invariant is at
//! risk (the page provider is out of address space, the zone table is full).
//! Everything else -- a canary mismatch, a double free, a foreign pointer --
//! indicates the heap is already corrupt or under attack and is handled by
//! [`fatal`], which logs and calls [`std::process::abort`]. We never return
//! those as `Err` values: by the time we'd notice them, trying to keep
//! running is itself unsafe.

use std::fmt;

/// Failures the page provider or zone table can report without anything
/// being corrupt yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The kernel would not satisfy an `mmap`/`mprotect`/`madvise` request.
    OutOfMemory,
    /// `zones_used == MAX_ZONES`; the root's zone table is full.
    ZoneTableExhausted,
    /// A requested layout could not be satisfied (e.g. zero-sized custom
    /// zone, chunk size above `SMALL_SZ_MAX`).
    InvalidLayout,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "page provider could not satisfy request"),
            MapError::ZoneTableExhausted => write!(f, "zone table exhausted"),
            MapError::InvalidLayout => write!(f, "invalid allocation layout"),
        }
    }
}

impl std::error::Error for MapError {}

/// The security events this allocator aborts on. Kept as a real enum (rather
/// than an inline format string) purely so `fatal` has something that does
/// not require heap allocation to build -- the whole point is that the
/// reporting path must not call back into this allocator.
#[derive(Debug, Clone, Copy)]
pub enum FatalKind {
    FreeOfNeverAllocated,
    DoubleFree,
    FreeOfRetired,
    CanaryMismatch,
    PoisonMismatch,
    MisalignedFree,
    ForeignPointer,
    CallocOverflow,
    CorruptRoot,
    CorruptBigZone,
    ZoneTableExhausted,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FatalKind::FreeOfNeverAllocated => "free of a chunk that was never allocated",
            FatalKind::DoubleFree => "double free detected",
            FatalKind::FreeOfRetired => "free of a canary or permanently-retired chunk",
            FatalKind::CanaryMismatch => "canary mismatch: overflow or use-after-free write",
            FatalKind::PoisonMismatch => "poison pattern mismatch: use-after-free write",
            FatalKind::MisalignedFree => "pointer is not aligned to a chunk boundary",
            FatalKind::ForeignPointer => "free of a pointer this allocator never returned",
            FatalKind::CallocOverflow => "calloc(nmemb, size) overflowed",
            FatalKind::CorruptRoot => "root structure failed its integrity check",
            FatalKind::CorruptBigZone => "big-zone node failed its integrity check",
            FatalKind::ZoneTableExhausted => "zone table exhausted: MAX_ZONES reached",
        };
        write!(f, "{}", msg)
    }
}

/// Logs `kind` at `address` (if known) and aborts the process.
///
/// This never returns. Every lock the caller holds must already be released
/// before calling this: the logger does not call back into the allocator,
/// but nothing else running in this process can make progress while a spin
/// lock is held, and an aborting process still runs `atexit`/signal handlers
/// that may want the heap.
#[cold]
#[inline(never)]
pub fn fatal(kind: FatalKind, address: Option<usize>) -> ! {
    match address {
        Some(addr) => log::error!("fortalloc: {} at {:#x}", kind, addr),
        None => log::error!("fortalloc: {}", kind),
    }
    std::process::abort()
}
