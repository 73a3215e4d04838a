//! Process-wide and per-zone tuning knobs.
//!
//! The per-zone flags mirror the fields of the original C allocator's
//! `iso_alloc_zone_configuration` struct: each one independently turns a
//! security mitigation on or off so a caller can trade safety for speed on a
//! zone-by-zone basis.

use std::num::NonZeroU32;

/// Size, in bytes, of a single zone's user region.
///
/// Shrunk under `test_only_small_constants` (mirroring
/// `backtrace-labs/slitter`'s `magazine_impl.rs` use of the same feature)
/// so proptests exercise bitmap refill and zone-exhaustion edge cases
/// without mapping 8 MiB per zone.
#[cfg(not(feature = "test_only_small_constants"))]
pub const ZONE_USER_SIZE: usize = 8 * 1024 * 1024;
#[cfg(feature = "test_only_small_constants")]
pub const ZONE_USER_SIZE: usize = 64 * 1024;

/// Smallest chunk size a zone may be configured for.
pub const MIN_CHUNK_SIZE: usize = 16;

/// Largest request routed through the zone allocator; anything bigger goes
/// through the big-allocation path.
pub const SMALL_SZ_MAX: usize = 262_144;

/// Largest request the big-allocation path will service.
pub const BIG_SZ_MAX: u64 = 4 * 1024 * 1024 * 1024;

/// Fixed capacity of the root's zone table.
pub const MAX_ZONES: usize = 4096;

/// Depth of a zone's free bit-slot cache.
pub const BIT_SLOT_CACHE_SIZE: usize = 128;

/// Depth of the per-thread zone cache.
pub const THREAD_ZONE_CACHE_SIZE: usize = 8;

/// Byte pattern written into freed chunks.
pub const POISON_BYTE: u8 = 0xde;

/// Mask applied before comparing canaries: the low byte is intentionally
/// excluded so that forcing a zone's canary secret's low byte to zero makes a
/// single-byte linear overflow deterministically corrupt the canary.
pub const CANARY_VALIDATE_MASK: u64 = 0xffff_ffff_ffff_ff00;

/// Size in bytes of a canary.
pub const CANARY_SIZE: usize = 8;

/// Fraction (1 in N) of chunks in a fresh zone that are installed as
/// permanent canary chunks.
pub const CANARY_COUNT_DIV: usize = 100;

/// Default zone size classes created eagerly at root init.
pub const DEFAULT_ZONE_SIZES: &[usize] = &[
    16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192,
];

/// Environment variable consumed by the (external) heap profiler collaborator.
pub const PROFILER_ENV_VAR: &str = "ISO_ALLOC_PROFILER_FILE_PATH";

/// Per-zone security policy. Constructed once, at zone creation, and never
/// mutated afterward -- the zone's behavior for its whole lifetime is fixed
/// by the value it was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneConfig {
    /// Shuffle bit-slot refill order instead of handing out slots in bitmap
    /// order. Breaks spatial predictability of successive allocations.
    pub random_allocation_pattern: bool,
    /// Verify a chunk's neighbors' canaries every time it is handed out.
    pub adjacent_canary_verification_on_alloc: bool,
    /// Verify a chunk's neighbors' canaries every time it is freed.
    pub adjacent_canary_verification_on_free: bool,
    /// Overwrite a chunk's contents with zero (rather than leaving the
    /// poison pattern) the moment it is handed out from reuse.
    pub clear_chunk_on_free: bool,
    /// Abort on free of an already-freed chunk, rather than silently
    /// ignoring the request.
    pub double_free_detection: bool,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            random_allocation_pattern: true,
            adjacent_canary_verification_on_alloc: true,
            adjacent_canary_verification_on_free: true,
            clear_chunk_on_free: true,
            double_free_detection: true,
        }
    }
}

/// What `alloc(0)` should hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroSizePolicy {
    /// Return a single process-wide sentinel address that is never
    /// dereferenced and never reused for a real allocation.
    Sentinel,
    /// Return a null pointer, like the C `malloc(0)` implementations that
    /// choose to signal failure.
    Null,
}

/// Process-wide configuration, built once at root init.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Whether to mprotect the root read-only between facade calls.
    pub protect_root: bool,
    /// Zero-size allocation policy.
    pub zero_size_policy: ZeroSizePolicy,
    /// Default zone size classes to build eagerly at root init.
    pub default_zone_sizes: Vec<usize>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            protect_root: true,
            zero_size_policy: ZeroSizePolicy::Sentinel,
            default_zone_sizes: DEFAULT_ZONE_SIZES.to_vec(),
        }
    }
}

/// Number of chunks a zone of `chunk_size` bytes holds.
pub fn chunk_count_for(chunk_size: usize) -> usize {
    ZONE_USER_SIZE / chunk_size
}

/// Rounds `size` up to the nearest multiple of `page_size`.
pub fn round_up_to_page(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) / page_size * page_size
}

/// Rounds `size` up to the nearest built-in default zone size, if any default
/// is large enough; otherwise returns `size` unchanged (the caller then rounds
/// up to an 8-byte alignment instead).
pub fn round_to_default_class(size: usize) -> Option<NonZeroU32> {
    DEFAULT_ZONE_SIZES
        .iter()
        .find(|&&class| class >= size)
        .map(|&class| NonZeroU32::new(class as u32).expect("default class sizes are nonzero"))
}

/// The chunk size to build a fresh zone with for a `size`-byte request that
/// found no existing fit, per §4.5's "round `size` up … and, for defaults,
/// to the nearest default size class": a default class when one is large
/// enough, else the next 8-byte boundary. Only applies to zones the root
/// creates on demand -- a caller-requested custom zone
/// ([`crate::root::Root::new_zone`]) keeps the exact size it asked for.
pub fn round_for_new_zone(size: usize) -> usize {
    match round_to_default_class(size) {
        Some(class) => class.get() as usize,
        None => (size + 7) / 8 * 8,
    }
}
