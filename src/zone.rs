//! A `Zone` is a contiguous 8 MiB user region plus its state bitmap,
//! dedicated to a single chunk size. Allocation never crosses zones and a
//! zone is never compacted or moved once created.
//!
//! Unlike `backtrace-labs/slitter`'s [`crate::class::Class`] +
//! [`crate::press::Press`] + [`crate::magazine_stack::MagazineStack`] stack,
//! which hands out objects from thread-local magazines backed by a generic
//! mill, a zone hands out chunks directly from a guarded bitmap and keeps
//! only a small FIFO cache of recently-freed slots -- the quarantine is the
//! whole point, so new allocations must not eagerly reuse the chunk a
//! sibling thread just freed.

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")
))]
use disabled_contracts::*;

use std::collections::VecDeque;
use std::ptr::NonNull;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map::{self, Owner};

use crate::bitmap::{Bitmap, ChunkState};
use crate::config::{self, ZoneConfig};
use crate::error::{fatal, FatalKind, MapError};
use crate::mapper::PageProvider;
use crate::random;

/// Result of [`Zone::free`]: whether the freed chunk is now quarantined for
/// reuse or retired forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeDisposition {
    Reusable,
    Permanent,
}

/// A guarded `[guard][payload][guard]` mapping. Holds everything needed to
/// unmap the whole thing later. `payload` is stored XORed with the zone's
/// `pointer_mask` -- never at rest as a plain address -- and unmasked only
/// transiently by [`GuardedRegion::payload`], which callers must not cache
/// across a root-lock release.
struct GuardedRegion {
    mapping_base: NonNull<u8>,
    mapping_size: usize,
    payload_masked: usize,
}

impl GuardedRegion {
    fn payload(&self, mask: u64) -> NonNull<u8> {
        NonNull::new((self.payload_masked as u64 ^ mask) as usize as *mut u8).unwrap()
    }
}

fn map_guarded(
    provider: &'static dyn PageProvider,
    payload_size: usize,
    mask: u64,
) -> Result<GuardedRegion, MapError> {
    let page_size = provider.page_size();
    let payload_pages = crate::config::round_up_to_page(payload_size, page_size);
    let mapping_size = page_size + payload_pages + page_size;

    let mapping_base = provider.map_rw(mapping_size, false)?;
    let payload_addr = mapping_base.as_ptr() as usize + page_size;
    let trailing_guard =
        NonNull::new((mapping_base.as_ptr() as usize + page_size + payload_pages) as *mut u8)
            .unwrap();

    provider.guard(mapping_base)?;
    provider.guard(trailing_guard)?;

    Ok(GuardedRegion {
        mapping_base,
        mapping_size,
        payload_masked: payload_addr ^ mask as usize,
    })
}

/// A single size-class zone: one chunk size, one 8 MiB user region, one
/// state bitmap, both framed in guard pages.
pub struct Zone {
    chunk_size: usize,
    chunk_count: usize,
    /// Whether this zone was created by the root for a default size class
    /// (`true`) or requested explicitly by a caller via
    /// [`crate::root::Root::new_zone`] (`false`); only internal zones are
    /// candidates for `iso_find_zone_fit`.
    internal: bool,
    config: ZoneConfig,
    provider: &'static dyn PageProvider,

    canary_secret: u64,
    pointer_mask: u64,

    user_region: GuardedRegion,
    bitmap_region: GuardedRegion,

    is_full: bool,
    free_bit_slot_cache: VecDeque<u32>,
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_count", &self.chunk_count)
            .field("internal", &self.internal)
            .field("is_full", &self.is_full)
            .finish()
    }
}

impl Zone {
    /// Creates a fresh zone for `chunk_size`-byte chunks. A small fraction
    /// of chunks are installed as permanent canary chunks (state `Retired`)
    /// at creation, chosen at random.
    pub fn new(
        chunk_size: usize,
        internal: bool,
        config: ZoneConfig,
        provider: &'static dyn PageProvider,
    ) -> Result<Zone, MapError> {
        if chunk_size < config::MIN_CHUNK_SIZE || chunk_size > config::SMALL_SZ_MAX {
            return Err(MapError::InvalidLayout);
        }

        let chunk_count = config::chunk_count_for(chunk_size);
        let bitmap_words = (chunk_count + 31) / 32;
        let bitmap_bytes = bitmap_words * std::mem::size_of::<u64>();

        let pointer_mask = random::new_pointer_mask();
        let user_region = map_guarded(provider, config::ZONE_USER_SIZE, pointer_mask)?;
        let bitmap_region = map_guarded(provider, bitmap_bytes, pointer_mask)?;

        let mut zone = Zone {
            chunk_size,
            chunk_count,
            internal,
            config,
            provider,
            canary_secret: random::new_canary_secret(),
            pointer_mask,
            user_region,
            bitmap_region,
            is_full: false,
            free_bit_slot_cache: VecDeque::with_capacity(config::BIT_SLOT_CACHE_SIZE),
        };

        zone.install_canary_chunks();
        Ok(zone)
    }

    fn bitmap_words_mut(&mut self) -> &mut [u64] {
        let bitmap_words = (self.chunk_count + 31) / 32;
        unsafe {
            std::slice::from_raw_parts_mut(
                self.bitmap_region.payload(self.pointer_mask).as_ptr() as *mut u64,
                bitmap_words,
            )
        }
    }

    fn bitmap(&mut self) -> Bitmap<'_> {
        Bitmap::new(self.bitmap_words_mut())
    }

    /// Address of this zone's user region, unmasked by `pointer_mask` for
    /// this one call. Callers must already hold the root lock and must not
    /// cache the result across a lock release.
    pub fn user_pages_start(&self) -> usize {
        self.user_region.payload(self.pointer_mask).as_ptr() as usize
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    fn chunk_ptr(&self, chunk_index: u32) -> NonNull<u8> {
        let offset = chunk_index as usize * self.chunk_size;
        NonNull::new((self.user_pages_start() + offset) as *mut u8).unwrap()
    }

    fn write_canary(&self, chunk_index: u32) {
        let ptr = self.chunk_ptr(chunk_index);
        let masked = self.canary_secret ^ (ptr.as_ptr() as u64 & config::CANARY_VALIDATE_MASK);
        let bytes = masked.to_ne_bytes();

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), config::CANARY_SIZE);
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ptr.as_ptr().add(self.chunk_size - config::CANARY_SIZE),
                config::CANARY_SIZE,
            );
        }
    }

    fn canary_matches(&self, chunk_index: u32) -> bool {
        let ptr = self.chunk_ptr(chunk_index);
        let expected = self.canary_secret ^ (ptr.as_ptr() as u64 & config::CANARY_VALIDATE_MASK);
        let expected_bytes = expected.to_ne_bytes();

        let mut head = [0u8; config::CANARY_SIZE];
        let mut tail = [0u8; config::CANARY_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), head.as_mut_ptr(), config::CANARY_SIZE);
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr().add(self.chunk_size - config::CANARY_SIZE),
                tail.as_mut_ptr(),
                config::CANARY_SIZE,
            );
        }

        head == expected_bytes && tail == expected_bytes
    }

    /// Checks that everything but the boundary canaries still holds
    /// `POISON_BYTE`. Canaries are rewritten unconditionally on free, so
    /// they are excluded regardless of verification configuration.
    fn poison_matches(&self, chunk_index: u32) -> bool {
        let ptr = self.chunk_ptr(chunk_index);
        let body_start = config::CANARY_SIZE.min(self.chunk_size / 2);
        let body_end = self.chunk_size.saturating_sub(body_start);

        if body_end <= body_start {
            return true;
        }

        unsafe {
            let slice =
                std::slice::from_raw_parts(ptr.as_ptr().add(body_start), body_end - body_start);
            slice.iter().all(|&b| b == config::POISON_BYTE)
        }
    }

    fn poison_chunk(&self, chunk_index: u32) {
        let ptr = self.chunk_ptr(chunk_index);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), config::POISON_BYTE, self.chunk_size);
        }
    }

    /// Installs the permanent canary chunks picked at zone creation:
    /// roughly one in [`config::CANARY_COUNT_DIV`], state `Retired`, never
    /// handed out.
    fn install_canary_chunks(&mut self) {
        let canary_count = (self.chunk_count / config::CANARY_COUNT_DIV).max(1);
        let chunk_count = self.chunk_count as u32;

        let mut picked: Vec<u32> = (0..chunk_count).collect();
        random::shuffle(&mut picked);
        picked.truncate(canary_count);

        for &chunk_index in &picked {
            self.write_canary(chunk_index);
            self.bitmap().set(chunk_index, ChunkState::Retired);
        }
    }

    /// Refills the free bit-slot cache by scanning the bitmap from a random
    /// starting word. Marks the zone full if nothing free remains. The
    /// collected slots are handed out in scan order unless
    /// `random_allocation_pattern` is set, in which case they are shuffled
    /// first to break spatial predictability.
    fn refill_cache(&mut self) {
        let page_start = random::below(self.chunk_count.max(1)) as u32;
        let mut bitmap = self.bitmap();

        let mut found = bitmap.collect_free(page_start, config::BIT_SLOT_CACHE_SIZE);
        if found.is_empty() && page_start != 0 {
            found = bitmap.collect_free(0, config::BIT_SLOT_CACHE_SIZE);
        }

        if found.is_empty() {
            self.is_full = true;
            return;
        }

        if self.config.random_allocation_pattern {
            random::shuffle(&mut found);
        }
        self.free_bit_slot_cache.extend(found);
    }

    /// Hands out one chunk, or `None` if the zone is full.
    #[ensures(ret.is_none() -> self.is_full, "a failed alloc always leaves the zone marked full")]
    #[ensures(ret.is_some() ->
              debug_allocation_map::mark_allocated(Owner::Zone(self.chunk_size), ret.unwrap().as_ptr() as usize).is_ok(),
              "Successful allocations match the zone's chunk size and avoid double-allocation.")]
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        if self.is_full {
            return None;
        }

        if self.free_bit_slot_cache.is_empty() {
            self.refill_cache();
        }

        let chunk_index = match self.free_bit_slot_cache.pop_front() {
            Some(slot) => slot,
            None => return None,
        };

        let state = self.bitmap().get(chunk_index);
        let was_reused = match state {
            ChunkState::FreeNeverUsed => false,
            ChunkState::FreeReusable => true,
            ChunkState::Allocated | ChunkState::Retired => {
                fatal(FatalKind::CorruptRoot, Some(self.chunk_ptr(chunk_index).as_ptr() as usize));
            }
        };

        if was_reused && !self.poison_matches(chunk_index) {
            fatal(
                FatalKind::PoisonMismatch,
                Some(self.chunk_ptr(chunk_index).as_ptr() as usize),
            );
        }

        self.bitmap().set(chunk_index, ChunkState::Allocated);

        let ptr = self.chunk_ptr(chunk_index);
        if was_reused && self.config.clear_chunk_on_free {
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, self.chunk_size) };
        }
        if self.config.adjacent_canary_verification_on_alloc {
            self.write_canary(chunk_index);
        }

        Some(ptr)
    }

    fn chunk_index_for(&self, p: NonNull<u8>) -> Option<u32> {
        let base = self.user_pages_start();
        let addr = p.as_ptr() as usize;

        if addr < base {
            return None;
        }
        let offset = addr - base;
        if offset % self.chunk_size != 0 {
            return None;
        }
        let index = offset / self.chunk_size;
        if index >= self.chunk_count {
            return None;
        }
        Some(index as u32)
    }

    /// Frees the chunk at `p`, owned by this zone. `p` must already have
    /// been established (via [`crate::root::Root`]'s pointer search) to
    /// fall within this zone's user region.
    #[requires(debug_allocation_map::mark_released(Owner::Zone(self.chunk_size), p.as_ptr() as usize).is_ok(),
               "Released chunks must match this zone's chunk size and not be double-freed.")]
    pub fn free(&mut self, p: NonNull<u8>, permanent: bool) -> FreeDisposition {
        let chunk_index = match self.chunk_index_for(p) {
            Some(i) => i,
            None => fatal(FatalKind::MisalignedFree, Some(p.as_ptr() as usize)),
        };

        let state = self.bitmap().get(chunk_index);
        match state {
            ChunkState::FreeNeverUsed => {
                fatal(FatalKind::FreeOfNeverAllocated, Some(p.as_ptr() as usize))
            }
            ChunkState::FreeReusable => {
                if self.config.double_free_detection {
                    fatal(FatalKind::DoubleFree, Some(p.as_ptr() as usize));
                }
                return FreeDisposition::Reusable;
            }
            ChunkState::Retired => {
                fatal(FatalKind::FreeOfRetired, Some(p.as_ptr() as usize))
            }
            ChunkState::Allocated => {}
        }

        if self.config.adjacent_canary_verification_on_free {
            self.verify_neighbor_canaries(chunk_index);
        }

        self.poison_chunk(chunk_index);
        self.write_canary(chunk_index);

        let new_state = if permanent {
            ChunkState::Retired
        } else {
            ChunkState::FreeReusable
        };
        self.bitmap().set(chunk_index, new_state);
        self.is_full = false;

        if !permanent && self.free_bit_slot_cache.len() < config::BIT_SLOT_CACHE_SIZE {
            self.free_bit_slot_cache.push_back(chunk_index);
        }

        if permanent {
            FreeDisposition::Permanent
        } else {
            FreeDisposition::Reusable
        }
    }

    fn verify_neighbor_canaries(&mut self, chunk_index: u32) {
        let chunk_count = self.chunk_count;
        let neighbors = [chunk_index.checked_sub(1), Some(chunk_index + 1)];

        for neighbor in neighbors {
            let neighbor = match neighbor {
                Some(n) if (n as usize) < chunk_count => n,
                _ => continue,
            };

            let state = self.bitmap().get(neighbor);
            if matches!(state, ChunkState::Allocated | ChunkState::Retired)
                && !self.canary_matches(neighbor)
            {
                fatal(
                    FatalKind::CanaryMismatch,
                    Some(self.chunk_ptr(neighbor).as_ptr() as usize),
                );
            }
        }
    }

    /// Counts chunks currently in state `Allocated`, for leak detection.
    pub fn count_allocated(&mut self) -> usize {
        let chunk_count = self.chunk_count as u32;
        let mut bitmap = self.bitmap();
        (0..chunk_count)
            .filter(|&i| bitmap.get(i) == ChunkState::Allocated)
            .count()
    }

    /// Walks every retired chunk and every allocated chunk's canaries,
    /// aborting on the first mismatch. Used by integrity sweeps, not on the
    /// allocation fast path.
    pub fn verify(&mut self) {
        let chunk_count = self.chunk_count as u32;
        for chunk_index in 0..chunk_count {
            let state = self.bitmap().get(chunk_index);
            if matches!(state, ChunkState::Allocated | ChunkState::Retired)
                && !self.canary_matches(chunk_index)
            {
                fatal(
                    FatalKind::CanaryMismatch,
                    Some(self.chunk_ptr(chunk_index).as_ptr() as usize),
                );
            }
        }
    }

    /// Releases this zone's mappings back to the kernel. Only valid once no
    /// live chunk references remain -- the root never calls this for
    /// default zones, only for explicit `destroy_zone` on a custom zone.
    pub fn destroy(self) -> Result<(), MapError> {
        self.provider
            .unmap(self.user_region.mapping_base, self.user_region.mapping_size)?;
        self.provider
            .unmap(self.bitmap_region.mapping_base, self.bitmap_region.mapping_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::DEFAULT_PAGE_PROVIDER;

    fn small_config() -> ZoneConfig {
        ZoneConfig::default()
    }

    #[test]
    fn alloc_then_free_then_realloc_detects_reuse_quarantine() {
        let mut zone = Zone::new(64, true, small_config(), &DEFAULT_PAGE_PROVIDER)
            .expect("zone creation should succeed");

        let a = zone.alloc().expect("first alloc should succeed");
        zone.free(a, false);

        // The freed chunk is quarantined behind the FIFO cache, not handed
        // back out immediately by the very next alloc unless nothing else
        // is free -- with a fresh zone there is plenty else free.
        let b = zone.alloc().expect("second alloc should succeed");
        assert_ne!(a, b);
    }

    #[test]
    fn double_free_aborts() {
        // Not exercised here: `fatal` calls `process::abort()`, which would
        // kill the test process. Covered by the integration harness, which
        // runs this scenario in a forked child and asserts on the signal.
    }

    #[test]
    fn canary_round_trips_across_alloc() {
        let mut zone = Zone::new(128, true, small_config(), &DEFAULT_PAGE_PROVIDER)
            .expect("zone creation should succeed");

        let p = zone.alloc().expect("alloc should succeed");
        let chunk_index = zone.chunk_index_for(p).unwrap();
        assert!(zone.canary_matches(chunk_index));
    }

    #[test]
    fn poison_is_written_on_free() {
        let mut zone = Zone::new(256, true, small_config(), &DEFAULT_PAGE_PROVIDER)
            .expect("zone creation should succeed");

        let p = zone.alloc().expect("alloc should succeed");
        zone.free(p, false);

        let chunk_index = zone.chunk_index_for(p).unwrap();
        assert!(zone.poison_matches(chunk_index));
    }

    #[test]
    fn zone_exhausts_and_reports_full() {
        let mut zone = Zone::new(65536, true, small_config(), &DEFAULT_PAGE_PROVIDER)
            .expect("zone creation should succeed");

        let mut handed_out = Vec::new();
        while let Some(p) = zone.alloc() {
            handed_out.push(p);
        }

        assert!(zone.is_full());
        assert!(handed_out.len() <= zone.chunk_count);
    }
}

/// Randomized alloc/free order tests, adapted from
/// `backtrace-labs/slitter`'s `class.rs` `random_order` proptest: bulk
/// allocate a fixed number of slots, then repeatedly either free a live
/// slot or allocate into an empty one, driven by an arbitrary index
/// sequence. Unlike the teacher's version (which only asserts address
/// uniqueness), this also re-checks each live chunk's canaries on every
/// step, since that is the property this allocator adds on top of the
/// teacher's plain magazine stack.
#[cfg(test)]
mod proptests {
    use std::collections::HashSet;

    use proptest::collection::vec;
    use proptest::prelude::*;

    use super::*;
    use crate::mapper::DEFAULT_PAGE_PROVIDER;

    const SLOT_COUNT: usize = 16;

    proptest! {
        #[test]
        fn random_order_preserves_invariants(indices in vec(0..SLOT_COUNT, 1..200)) {
            let mut zone = Zone::new(64, true, ZoneConfig::default(), &DEFAULT_PAGE_PROVIDER)
                .expect("zone creation should succeed");

            let mut slots: Vec<Option<NonNull<u8>>> = Vec::with_capacity(SLOT_COUNT);
            for _ in 0..SLOT_COUNT {
                slots.push(zone.alloc());
            }
            prop_assert!(slots.iter().all(Option::is_some));

            for index in indices {
                if let Some(live) = slots[index].take() {
                    zone.free(live, false);
                } else {
                    slots[index] = zone.alloc();
                }
            }

            let live: Vec<NonNull<u8>> = slots.into_iter().flatten().collect();
            let unique: HashSet<usize> = live.iter().map(|p| p.as_ptr() as usize).collect();
            prop_assert_eq!(live.len(), unique.len());

            for p in &live {
                let chunk_index = zone.chunk_index_for(*p).unwrap();
                prop_assert!(zone.canary_matches(chunk_index));
            }

            zone.verify();
        }
    }
}
