//! The process-wide allocator root: the zone table, the big-zone list, and
//! the two spin locks that serialize access to each.
//!
//! `backtrace-labs/slitter` has no single root object -- its `Class`es are
//! independent and registered in a flat `CLASSES` vector
//! (`class.rs`). This allocator needs one because zone selection and the
//! pointer-search free path both need to scan the *whole* zone table and
//! the whole big-zone list under a single lock, matching the C original's
//! `iso_alloc_root`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use nix::sys::mman::ProtFlags;

use crate::big_zone::BigZone;
use crate::config::{self, GlobalConfig, ZoneConfig};
use crate::error::{fatal, FatalKind, MapError};
use crate::mapper::{PageProvider, DEFAULT_PAGE_PROVIDER};
use crate::random;
use crate::sync::SpinLock;
use crate::zone::Zone;

/// What a pointer-search free/`chunk_size` lookup resolved to.
pub enum Owner {
    Zone(usize),
    Big(usize),
}

/// Zones are stored behind an `Option` and never truly removed from the
/// table: `zones_used` (the table's length) is monotonically increasing,
/// matching the root's invariant of "no reuse of slots after destroy in
/// the simple model". A destroyed slot becomes `None` so every handle
/// issued earlier stays meaningful (or resolves to a dead slot) rather
/// than silently pointing at whatever zone shifted into its place.
struct ZoneTable {
    zones: Vec<Option<Box<Zone>>>,
}

impl ZoneTable {
    fn new() -> Self {
        Self { zones: Vec::new() }
    }

    /// First zone whose chunk size fits, is internally managed, and isn't
    /// full. Scans in insertion order, matching the C original's linear
    /// `iso_find_zone_fit`.
    fn find_fit(&mut self, size: usize) -> Option<usize> {
        self.zones.iter().position(|slot| {
            slot.as_ref()
                .map(|z| z.is_internal() && !z.is_full() && z.chunk_size() >= size)
                .unwrap_or(false)
        })
    }

    fn create(
        &mut self,
        chunk_size: usize,
        internal: bool,
        config: ZoneConfig,
        provider: &'static dyn PageProvider,
    ) -> Result<usize, MapError> {
        if self.zones.len() >= config::MAX_ZONES {
            fatal(FatalKind::ZoneTableExhausted, None);
        }

        let zone = Zone::new(chunk_size, internal, config, provider)?;
        self.zones.push(Some(Box::new(zone)));
        let index = self.zones.len() - 1;
        crate::observer::notify_zone_created(chunk_size);
        Ok(index)
    }

    fn get(&self, index: usize) -> Option<&Zone> {
        self.zones.get(index)?.as_deref()
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut Zone> {
        self.zones.get_mut(index)?.as_deref_mut()
    }
}

struct BigZoneList {
    /// XOR-masked address of the head node, or `0` for an empty list.
    head_masked: usize,
    next_mask: u64,
    canary_secret: u64,
}

impl BigZoneList {
    fn new() -> Self {
        Self {
            head_masked: 0,
            next_mask: random::new_pointer_mask(),
            canary_secret: random::new_canary_secret(),
        }
    }

    fn mask(&self, addr: usize) -> usize {
        addr ^ self.next_mask as usize
    }

    fn push_front(&mut self, mut big: BigZone) {
        big.set_next_masked(self.head_masked);
        self.head_masked = self.mask(big.node_addr());
        // The node is now reachable only through the list; let the handle
        // go out of scope without unmapping anything (`BigZone` has no
        // `Drop` impl).
    }

    /// Finds a freed node with enough capacity to serve `size`, if any.
    fn find_free_fit(&self, size: u64) -> Option<usize> {
        let mut current_masked = self.head_masked;

        while current_masked != 0 {
            let addr = self.mask(current_masked);
            let big = BigZone::from_node_addr(addr);

            if big.is_free() && big.capacity() as u64 >= size {
                return Some(addr);
            }

            current_masked = big.next_masked();
        }

        None
    }

    /// Finds the node owning `p`, if any, without unlinking it.
    fn find(&self, p: usize) -> Option<usize> {
        let mut current_masked = self.head_masked;

        while current_masked != 0 {
            let addr = self.mask(current_masked);
            let big = BigZone::from_node_addr(addr);

            if big.contains(p) {
                return Some(addr);
            }

            current_masked = big.next_masked();
        }

        None
    }

    /// Unlinks the node at `addr`, which must currently be on the list.
    fn unlink(&mut self, addr: usize) {
        let target_masked = self.mask(addr);

        if self.head_masked == target_masked {
            let big = BigZone::from_node_addr(addr);
            self.head_masked = big.next_masked();
            return;
        }

        let mut prev_masked = self.head_masked;
        while prev_masked != 0 {
            let prev_addr = self.mask(prev_masked);
            let mut prev = BigZone::from_node_addr(prev_addr);

            if prev.next_masked() == target_masked {
                let target = BigZone::from_node_addr(addr);
                prev.set_next_masked(target.next_masked());
                return;
            }

            prev_masked = prev.next_masked();
        }

        fatal(FatalKind::CorruptBigZone, Some(addr));
    }
}

/// The process-wide allocator root. Exactly one instance exists per
/// process, mapped with guard pages on both sides; [`root()`] lazily
/// creates it on first use. When `protect_root` is active the payload page
/// is switched to read-only between facade calls via [`Root::enter`].
pub struct Root {
    zone_table: SpinLock<ZoneTable>,
    big_zones: SpinLock<BigZoneList>,
    zone_config: ZoneConfig,
    global_config: GlobalConfig,
    provider: &'static dyn PageProvider,
    zone_handle_mask: u64,
    /// Address and size of this root's own guarded payload page, for
    /// `unprotect`/`reprotect`. Zero when the root was built by
    /// [`Root::new`] for tests, which live in ordinary static storage and
    /// so have nothing to protect.
    page_addr: usize,
    page_size: usize,
}

impl Root {
    fn new_at(provider: &'static dyn PageProvider, page_addr: usize, page_size: usize) -> Self {
        let global_config = GlobalConfig::default();
        let zone_config = ZoneConfig::default();
        let mut zone_table = ZoneTable::new();

        for &size in &global_config.default_zone_sizes {
            if let Err(e) = zone_table.create(size, true, zone_config, provider) {
                log::error!("fortalloc: failed to create default zone size={}: {}", size, e);
            }
        }

        Root {
            zone_table: SpinLock::new(zone_table),
            big_zones: SpinLock::new(BigZoneList::new()),
            zone_config,
            global_config,
            provider,
            zone_handle_mask: random::new_pointer_mask(),
            page_addr,
            page_size,
        }
    }

    /// Maps a fresh `[guard][Root][guard]` region, constructs a `Root`
    /// inside the payload, and returns the payload address. Mirrors
    /// `BigZone::new`'s guard-and-place pattern, minus the random offset --
    /// there is exactly one root per process, so hiding its exact offset
    /// within the payload page buys nothing.
    fn new_guarded(provider: &'static dyn PageProvider) -> Result<usize, MapError> {
        let page_size = provider.page_size();
        let payload_size = config::round_up_to_page(std::mem::size_of::<Root>(), page_size);
        let mapping_size = page_size + payload_size + page_size;

        let mapping_base = provider.map_rw(mapping_size, false)?;
        let payload_addr = mapping_base.as_ptr() as usize + page_size;
        let trailing_guard = NonNull::new(
            (mapping_base.as_ptr() as usize + page_size + payload_size) as *mut u8,
        )
        .unwrap();

        provider.guard(mapping_base)?;
        provider.guard(trailing_guard)?;

        let root = Root::new_at(provider, payload_addr, payload_size);
        unsafe { std::ptr::write(payload_addr as *mut Root, root) };

        Ok(payload_addr)
    }

    /// Test-only root living in ordinary static storage, with nothing to
    /// protect -- `page_size == 0` makes `unprotect`/`reprotect` no-ops.
    #[cfg(test)]
    fn new() -> Self {
        Self::new_at(&DEFAULT_PAGE_PROVIDER, 0, 0)
    }

    fn unprotect(&self) {
        if !self.global_config.protect_root || self.page_size == 0 {
            return;
        }
        let base = NonNull::new(self.page_addr as *mut u8).unwrap();
        if self
            .provider
            .protect(base, self.page_size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
            .is_err()
        {
            fatal(FatalKind::CorruptRoot, Some(self.page_addr));
        }
    }

    fn reprotect(&self) {
        if !self.global_config.protect_root || self.page_size == 0 {
            return;
        }
        let base = NonNull::new(self.page_addr as *mut u8).unwrap();
        if self
            .provider
            .protect(base, self.page_size, ProtFlags::PROT_READ)
            .is_err()
        {
            fatal(FatalKind::CorruptRoot, Some(self.page_addr));
        }
    }

    /// Unprotects the root for the duration of one facade call. The
    /// returned guard reprotects on drop. `mprotect` is idempotent, so a
    /// facade call that nests another (e.g. `realloc` calling `alloc`) may
    /// safely call `enter` more than once.
    pub fn enter(&self) -> RootGuard<'_> {
        self.unprotect();
        RootGuard { root: self }
    }

    pub fn global_config(&self) -> &GlobalConfig {
        &self.global_config
    }

    /// Tries to serve `size` from the specific zone the caller's
    /// thread-local cache last used for it. `None` on a cache miss or a
    /// full zone -- the caller should fall back to [`Root::alloc_small`].
    pub fn try_alloc_from_cached_zone(
        &self,
        zone_index: usize,
        size: usize,
    ) -> Option<(NonNull<u8>, usize)> {
        let mut table = self.zone_table.lock();
        let zone = table.get_mut(zone_index)?;
        if !zone.is_internal() || zone.chunk_size() < size {
            return None;
        }
        zone.alloc().map(|ptr| (ptr, zone_index))
    }

    /// Allocates a small chunk via the root's zone-fit search, creating a
    /// fresh internal zone if no existing one fits. A zone created on
    /// demand is sized to the nearest default size class (or the next
    /// 8-byte boundary past `size`, if no default is large enough) rather
    /// than `size` itself, so an odd request doesn't spawn a zone no other
    /// request can ever share. Returns the serving zone's index so the
    /// caller can prime its thread-local cache.
    pub fn alloc_small(&self, size: usize) -> (NonNull<u8>, usize) {
        let mut table = self.zone_table.lock();

        let zone_index = match table.find_fit(size) {
            Some(i) => i,
            None => table
                .create(config::round_for_new_zone(size), true, self.zone_config, self.provider)
                .unwrap_or_else(|_| fatal(FatalKind::CorruptRoot, None)),
        };

        loop {
            if let Some(ptr) = table.get_mut(zone_index).and_then(Zone::alloc) {
                return (ptr, zone_index);
            }

            // The zone filled between `find_fit` and `alloc` (or was
            // already full going in, for a freshly created zone that
            // somehow couldn't serve even one chunk). Look again.
            match table.find_fit(size) {
                Some(i) if i != zone_index => {
                    if let Some(ptr) = table.get_mut(i).and_then(Zone::alloc) {
                        return (ptr, i);
                    }
                }
                _ => {
                    let fresh = table
                        .create(
                            config::round_for_new_zone(size),
                            true,
                            self.zone_config,
                            self.provider,
                        )
                        .unwrap_or_else(|_| fatal(FatalKind::CorruptRoot, None));
                    if let Some(ptr) = table.get_mut(fresh).and_then(Zone::alloc) {
                        return (ptr, fresh);
                    }
                }
            }
        }
    }

    /// Creates a user-managed zone for explicit `alloc_from_zone` calls.
    /// Returns an XOR-masked handle.
    pub fn new_zone(&self, chunk_size: usize) -> Result<u64, MapError> {
        let mut table = self.zone_table.lock();
        let index = table.create(chunk_size, false, self.zone_config, self.provider)?;
        Ok((index as u64) ^ self.zone_handle_mask)
    }

    fn unmask_handle(&self, handle: u64) -> usize {
        (handle ^ self.zone_handle_mask) as usize
    }

    /// Allocates from a user-managed zone. `None` if `size` doesn't fit the
    /// zone's chunk size, or the zone is full.
    pub fn alloc_from_zone(&self, handle: u64, size: usize) -> Option<NonNull<u8>> {
        let index = self.unmask_handle(handle);
        let mut table = self.zone_table.lock();
        let zone = table.get_mut(index)?;
        if zone.chunk_size() < size {
            return None;
        }
        zone.alloc()
    }

    pub fn free_from_zone(&self, handle: u64, p: NonNull<u8>) {
        let index = self.unmask_handle(handle);
        let mut table = self.zone_table.lock();
        match table.get_mut(index) {
            Some(zone) => {
                zone.free(p, false);
            }
            None => fatal(FatalKind::CorruptRoot, Some(p.as_ptr() as usize)),
        }
    }

    /// Tears down a user-managed zone. The slot is tombstoned, not removed,
    /// so every other zone's index (and thus every other live handle)
    /// stays valid.
    pub fn destroy_zone(&self, handle: u64) -> Result<(), MapError> {
        let index = self.unmask_handle(handle);
        let mut table = self.zone_table.lock();
        let slot = table
            .zones
            .get_mut(index)
            .ok_or(MapError::InvalidLayout)?;
        let zone = slot.take().ok_or(MapError::InvalidLayout)?;
        zone.destroy()
    }

    /// Allocates a big-zone node, reusing a freed node with enough capacity
    /// if one is on the list, or mapping a fresh one and linking it in.
    pub fn alloc_big(&self, size: u64) -> Result<NonNull<u8>, MapError> {
        let mut big_zones = self.big_zones.lock();

        if let Some(addr) = big_zones.find_free_fit(size) {
            let mut big = BigZone::from_node_addr(addr);
            big.reuse_for(size);
            return Ok(NonNull::new(big.user_pages_start() as *mut u8).unwrap());
        }

        let big = BigZone::new(size, big_zones.canary_secret, self.provider)?;
        let ptr = NonNull::new(big.user_pages_start() as *mut u8).unwrap();
        big_zones.push_front(big);
        Ok(ptr)
    }

    /// Resolves `p` to its owning zone or big-zone node under the
    /// appropriate lock, per the root's pointer-search free path. Aborts on
    /// a foreign pointer.
    pub fn find_owner(&self, p: NonNull<u8>) -> Owner {
        let addr = p.as_ptr() as usize;

        {
            let table = self.zone_table.lock();
            for (index, zone) in table.zones.iter().enumerate() {
                let zone = match zone {
                    Some(z) => z,
                    None => continue,
                };
                let start = zone.user_pages_start();
                if addr >= start && addr < start + config::ZONE_USER_SIZE {
                    return Owner::Zone(index);
                }
            }
        }

        {
            let big_zones = self.big_zones.lock();
            if let Some(node_addr) = big_zones.find(addr) {
                return Owner::Big(node_addr);
            }
        }

        fatal(FatalKind::ForeignPointer, Some(addr))
    }

    pub fn free(&self, p: NonNull<u8>, permanent: bool) {
        self.free_reporting(p, permanent);
    }

    /// Frees `p` and, when it was served by a zone, reports that zone's
    /// `(chunk_size, zone_index)` so the façade can prime the thread-local
    /// cache. `None` for big allocations, which the cache never tracks.
    pub fn free_reporting(&self, p: NonNull<u8>, permanent: bool) -> Option<(usize, usize)> {
        match self.find_owner(p) {
            Owner::Zone(index) => {
                let mut table = self.zone_table.lock();
                let zone = table
                    .get_mut(index)
                    .unwrap_or_else(|| fatal(FatalKind::CorruptRoot, Some(p.as_ptr() as usize)));
                let chunk_size = zone.chunk_size();
                zone.free(p, permanent);
                Some((chunk_size, index))
            }
            Owner::Big(node_addr) => {
                let mut big_zones = self.big_zones.lock();
                let canary_secret = big_zones.canary_secret;

                // A permanent free removes the node from the list entirely;
                // a regular free leaves it linked (and `free == true`) so
                // `alloc_big` can reuse its mapping for a same-or-smaller
                // request without another round of `mmap`.
                if permanent {
                    big_zones.unlink(node_addr);
                }

                let big = BigZone::from_node_addr(node_addr);
                if let Err(e) = big.free(permanent, canary_secret) {
                    log::error!("fortalloc: failed to release big allocation: {}", e);
                }
                None
            }
        }
    }

    pub fn chunk_size_of(&self, p: NonNull<u8>) -> usize {
        match self.find_owner(p) {
            Owner::Zone(index) => {
                let table = self.zone_table.lock();
                table
                    .get(index)
                    .unwrap_or_else(|| fatal(FatalKind::CorruptRoot, Some(p.as_ptr() as usize)))
                    .chunk_size()
            }
            Owner::Big(node_addr) => {
                let big_zones = self.big_zones.lock();
                let _ = &big_zones; // hold the lock across the read for consistency
                BigZone::from_node_addr(node_addr).size() as usize
            }
        }
    }

    /// Sum of every zone's user region plus every live big allocation's
    /// user size. An approximation (it doesn't subtract never-touched
    /// chunks), matching the C original's `iso_alloc_mem_usage`, which
    /// reports reserved rather than live bytes.
    pub fn mem_usage(&self) -> u64 {
        let zones_bytes = {
            let table = self.zone_table.lock();
            table.zones.iter().filter(|z| z.is_some()).count() as u64
                * config::ZONE_USER_SIZE as u64
        };

        let big_bytes = {
            let big_zones = self.big_zones.lock();
            let mut total = 0u64;
            let mut current_masked = big_zones.head_masked;
            while current_masked != 0 {
                let addr = big_zones.mask(current_masked);
                let big = BigZone::from_node_addr(addr);
                total += big.size();
                current_masked = big.next_masked();
            }
            total
        };

        zones_bytes + big_bytes
    }

    /// Counts chunks and big allocations currently outstanding (state
    /// `Allocated`, or a big-zone node with `free == false`). Idempotent:
    /// calling it twice with no intervening alloc/free returns the same
    /// count, since it only reads state that alloc/free already mutate.
    pub fn detect_leaks(&self) -> u64 {
        let zones_live = {
            let mut table = self.zone_table.lock();
            table
                .zones
                .iter_mut()
                .filter_map(|slot| slot.as_mut())
                .map(|zone| zone.count_allocated() as u64)
                .sum::<u64>()
        };

        let big_live = {
            let big_zones = self.big_zones.lock();
            let mut count = 0u64;
            let mut current_masked = big_zones.head_masked;
            while current_masked != 0 {
                let addr = big_zones.mask(current_masked);
                let big = BigZone::from_node_addr(addr);
                if !big.is_free() {
                    count += 1;
                }
                current_masked = big.next_masked();
            }
            count
        };

        zones_live + big_live
    }
}

/// RAII handle returned by [`Root::enter`]; reprotects the root on drop.
pub struct RootGuard<'a> {
    root: &'a Root,
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        self.root.reprotect();
    }
}

static ROOT_ADDR: AtomicUsize = AtomicUsize::new(0);
static ROOT_INIT: Once = Once::new();

/// Returns the process-wide root, creating it (in its own guarded mapping)
/// on first call.
pub fn root() -> &'static Root {
    ROOT_INIT.call_once(|| {
        let addr = Root::new_guarded(&DEFAULT_PAGE_PROVIDER)
            .unwrap_or_else(|_| fatal(FatalKind::CorruptRoot, None));
        ROOT_ADDR.store(addr, Ordering::Release);
    });

    let addr = ROOT_ADDR.load(Ordering::Acquire);
    unsafe { &*(addr as *const Root) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_small_creates_a_zone_on_demand() {
        let r = Root::new();
        let (p, _zone_index) = r.alloc_small(48);
        assert_eq!(r.chunk_size_of(p), 64);
    }

    #[test]
    fn free_then_find_owner_round_trips() {
        let r = Root::new();
        let (p, _zone_index) = r.alloc_small(100);
        r.free(p, false);
    }

    #[test]
    fn cached_zone_serves_repeat_requests() {
        let r = Root::new();
        let (_first, zone_index) = r.alloc_small(48);
        let (_second, same_index) = r
            .try_alloc_from_cached_zone(zone_index, 48)
            .expect("cached zone should serve a second request");
        assert_eq!(zone_index, same_index);
    }

    #[test]
    fn big_alloc_is_found_by_pointer_search() {
        let r = Root::new();
        let p = r.alloc_big(1 << 20).expect("big alloc should succeed");
        assert_eq!(r.chunk_size_of(p), 1 << 20);
        r.free(p, false);
    }

    #[test]
    fn custom_zone_round_trips_through_handle() {
        let r = Root::new();
        let handle = r.new_zone(96).expect("zone creation should succeed");
        let p = r.alloc_from_zone(handle, 64).expect("alloc should succeed");
        r.free_from_zone(handle, p);
    }

    #[test]
    fn freed_big_allocation_is_reused_by_a_later_request() {
        let r = Root::new();
        let first = r.alloc_big(1 << 20).expect("big alloc should succeed");
        let first_addr = first.as_ptr() as usize;
        r.free(first, false);

        let second = r
            .alloc_big(1 << 19)
            .expect("second big alloc should succeed");
        assert_eq!(second.as_ptr() as usize, first_addr);
    }

    #[test]
    fn mem_usage_accounts_for_big_allocations() {
        let r = Root::new();
        let before = r.mem_usage();
        let p = r.alloc_big(4096).expect("big alloc should succeed");
        assert!(r.mem_usage() > before);
        r.free(p, true);
    }
}
