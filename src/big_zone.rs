//! The big-allocation path: requests larger than
//! [`crate::config::SMALL_SZ_MAX`] skip the zone bitmap entirely and get
//! their own guarded mapping, linked into the root's `big_zone_head` list.
//!
//! There is no analog to this in `backtrace-labs/slitter`, which routes
//! every request through a `Class`; this module is grounded directly in
//! this pack's hardened-allocation example
//! (`harborgrid-justin-rusty-db/src/security/memory_hardening.rs`), which
//! brackets large allocations in guard pages and dual canaries the same
//! way.
//!
//! Every node carries its own mapping bookkeeping and page provider, so the
//! root's linked-list walk can reconstruct a full [`BigZone`] handle from
//! nothing but a node address.

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

use std::ptr::NonNull;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map::{self, Owner};

use crate::config::{self, CANARY_VALIDATE_MASK};
use crate::error::{fatal, FatalKind, MapError};
use crate::mapper::PageProvider;
use crate::random;

const META_REGION_PAGES: usize = 3;

/// Metadata for one big allocation, placed at a random offset within its
/// guarded 3-page metadata region so that an attacker who can write past
/// the user region's trailing guard still can't predict where the node
/// lives.
#[repr(C, align(8))]
struct BigZoneNode {
    canary_a: u64,
    canary_b: u64,
    size: u64,
    free: bool,
    user_pages_start: usize,
    /// Total size of the `[guard][user][guard]` user mapping, for `unmap`.
    user_mapping_size: usize,
    /// Base of this node's own `[guard][meta][guard]` mapping.
    meta_mapping_base: usize,
    meta_mapping_size: usize,
    /// XOR-masked pointer to the next node in the root's list. `0` marks
    /// the end of the list (real node addresses are never page 0).
    next_masked: usize,
    provider: &'static dyn PageProvider,
}

/// A handle to one big-allocation node. Cheap to reconstruct from a raw
/// address via [`BigZone::from_node_addr`] -- the root's list stores only
/// masked addresses, not live handles, between operations.
pub struct BigZone {
    node: NonNull<BigZoneNode>,
}

impl BigZone {
    /// Allocates a fresh big-zone node for a `size`-byte user request.
    /// `canary_secret` is the root's process-wide `big_zone_canary_secret`.
    #[ensures(ret.is_ok() ->
              debug_allocation_map::mark_allocated(Owner::Big, ret.as_ref().unwrap().user_pages_start()).is_ok(),
              "A successful big allocation is fresh or was previously released.")]
    pub fn new(
        size: u64,
        canary_secret: u64,
        provider: &'static dyn PageProvider,
    ) -> Result<BigZone, MapError> {
        if size == 0 || size >= config::BIG_SZ_MAX {
            return Err(MapError::InvalidLayout);
        }

        let page_size = provider.page_size();
        let meta_payload = META_REGION_PAGES * page_size;
        let meta_mapping_size = page_size + meta_payload + page_size;
        let meta_mapping_base = provider.map_rw(meta_mapping_size, false)?;

        let meta_payload_start = meta_mapping_base.as_ptr() as usize + page_size;
        let meta_trailing_guard = (meta_payload_start + meta_payload) as *mut u8;

        provider.guard(meta_mapping_base)?;
        provider.guard(NonNull::new(meta_trailing_guard).unwrap())?;

        // Place the node at a random 8-byte-aligned offset within the
        // (unguarded) metadata payload, not at its start.
        let node_capacity = meta_payload - std::mem::size_of::<BigZoneNode>();
        let offset = random::below(node_capacity / 8 + 1) * 8;
        let node_ptr = (meta_payload_start + offset) as *mut BigZoneNode;

        let user_size = config::round_up_to_page(size as usize, page_size) + 2 * page_size;
        let user_mapping_base = match provider.map_rw(user_size, false) {
            Ok(base) => base,
            Err(e) => {
                let _ = provider.unmap(meta_mapping_base, meta_mapping_size);
                return Err(e);
            }
        };
        let user_payload =
            NonNull::new((user_mapping_base.as_ptr() as usize + page_size) as *mut u8).unwrap();
        let user_trailing_guard =
            NonNull::new((user_mapping_base.as_ptr() as usize + user_size - page_size) as *mut u8)
                .unwrap();
        provider.guard(user_mapping_base)?;
        provider.guard(user_trailing_guard)?;

        let node_addr = node_ptr as u64;
        let node = BigZoneNode {
            canary_a: canary_secret ^ (node_addr & CANARY_VALIDATE_MASK),
            canary_b: canary_secret ^ !(node_addr & CANARY_VALIDATE_MASK),
            size,
            free: false,
            user_pages_start: user_payload.as_ptr() as usize,
            user_mapping_size: user_size,
            meta_mapping_base: meta_mapping_base.as_ptr() as usize,
            meta_mapping_size,
            next_masked: 0,
            provider,
        };

        unsafe { std::ptr::write(node_ptr, node) };

        Ok(BigZone {
            node: NonNull::new(node_ptr).unwrap(),
        })
    }

    /// Reconstructs a handle from a node address previously obtained via
    /// [`BigZone::node_addr`]. `addr` must be a genuine, live node address.
    pub(crate) fn from_node_addr(addr: usize) -> BigZone {
        BigZone {
            node: NonNull::new(addr as *mut BigZoneNode).expect("node address must be non-null"),
        }
    }

    pub(crate) fn node_addr(&self) -> usize {
        self.node.as_ptr() as usize
    }

    /// Address handed back to the caller.
    pub fn user_pages_start(&self) -> usize {
        unsafe { self.node.as_ref().user_pages_start }
    }

    pub fn size(&self) -> u64 {
        unsafe { self.node.as_ref().size }
    }

    pub fn is_free(&self) -> bool {
        unsafe { self.node.as_ref().free }
    }

    /// Checks whether `p` falls in this node's user region.
    pub fn contains(&self, p: usize) -> bool {
        let node = unsafe { self.node.as_ref() };
        p >= node.user_pages_start && p < node.user_pages_start + node.size as usize
    }

    /// Usable capacity of the user mapping, i.e. the largest request this
    /// node could be reused for without remapping.
    pub(crate) fn capacity(&self) -> usize {
        let node = unsafe { self.node.as_ref() };
        let page_size = node.provider.page_size();
        node.user_mapping_size - 2 * page_size
    }

    /// Reactivates a freed node for a new `new_size`-byte request. Caller
    /// must have already checked `new_size <= self.capacity()`. Canaries are
    /// unaffected: they're derived from the node's address, not its size.
    #[ensures(debug_allocation_map::mark_allocated(Owner::Big, self.user_pages_start()).is_ok(),
              "A reused big allocation is fresh or was previously released.")]
    pub(crate) fn reuse_for(&mut self, new_size: u64) {
        let node = unsafe { self.node.as_mut() };
        node.size = new_size;
        node.free = false;
    }

    pub(crate) fn next_masked(&self) -> usize {
        unsafe { self.node.as_ref().next_masked }
    }

    pub(crate) fn set_next_masked(&mut self, value: usize) {
        unsafe { self.node.as_mut().next_masked = value };
    }

    /// Verifies both canaries against their expected recomputation; aborts
    /// on any mismatch.
    pub fn check_canaries(&self, canary_secret: u64) {
        let node = unsafe { self.node.as_ref() };
        let node_addr = self.node.as_ptr() as u64;
        let expected_a = canary_secret ^ (node_addr & CANARY_VALIDATE_MASK);
        let expected_b = canary_secret ^ !(node_addr & CANARY_VALIDATE_MASK);

        if node.canary_a != expected_a || node.canary_b != expected_b {
            fatal(FatalKind::CorruptBigZone, Some(node.user_pages_start));
        }
    }

    /// Frees the user region. On non-permanent free the pages are
    /// `madvise(DONTNEED)`'d and the node kept `free=true` for possible
    /// reuse by a future request of a compatible size; on permanent free
    /// both mappings are unmapped and the node is gone. The caller is
    /// responsible for unlinking this node from the root's list first.
    #[requires(debug_allocation_map::mark_released(Owner::Big, self.user_pages_start()).is_ok(),
               "Released big allocations must not be double-freed.")]
    pub fn free(self, permanent: bool, canary_secret: u64) -> Result<(), MapError> {
        self.check_canaries(canary_secret);

        let node = unsafe { &mut *self.node.as_ptr() };
        if node.free {
            fatal(FatalKind::DoubleFree, Some(node.user_pages_start));
        }

        let page_size = node.provider.page_size();
        let user_mapping_base =
            NonNull::new((node.user_pages_start - page_size) as *mut u8).unwrap();

        if permanent {
            node.provider.unmap(user_mapping_base, node.user_mapping_size)?;
            node.provider.unmap(
                NonNull::new(node.meta_mapping_base as *mut u8).unwrap(),
                node.meta_mapping_size,
            )?;
        } else {
            node.provider
                .advise_dontneed(user_mapping_base, node.user_mapping_size)?;
            node.free = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::DEFAULT_PAGE_PROVIDER;

    #[test]
    fn new_big_zone_round_trips_data() {
        let secret = random::new_canary_secret();
        let big = BigZone::new(8192, secret, &DEFAULT_PAGE_PROVIDER).expect("should allocate");

        let ptr = big.user_pages_start() as *mut u8;
        unsafe {
            std::ptr::write_bytes(ptr, 0x5a, 8192);
            assert_eq!(*ptr, 0x5a);
        }

        big.check_canaries(secret);
        assert!(big.contains(big.user_pages_start()));
    }

    #[test]
    fn over_cap_request_is_rejected() {
        let secret = random::new_canary_secret();
        let result = BigZone::new(config::BIG_SZ_MAX + 1, secret, &DEFAULT_PAGE_PROVIDER);
        assert!(result.is_err());
    }

    #[test]
    fn exact_cap_request_is_rejected() {
        let secret = random::new_canary_secret();
        let result = BigZone::new(config::BIG_SZ_MAX, secret, &DEFAULT_PAGE_PROVIDER);
        assert!(result.is_err());
    }

    #[test]
    fn non_permanent_free_keeps_node_marked_free() {
        let secret = random::new_canary_secret();
        let big = BigZone::new(4096, secret, &DEFAULT_PAGE_PROVIDER).expect("should allocate");
        let addr = big.node_addr();

        big.free(false, secret).expect("free should succeed");

        let reconstructed = BigZone::from_node_addr(addr);
        assert!(reconstructed.is_free());
    }

    #[test]
    fn reconstructed_handle_matches_original() {
        let secret = random::new_canary_secret();
        let big = BigZone::new(2048, secret, &DEFAULT_PAGE_PROVIDER).expect("should allocate");
        let addr = big.node_addr();
        let user_start = big.user_pages_start();

        let reconstructed = BigZone::from_node_addr(addr);
        assert_eq!(reconstructed.user_pages_start(), user_start);
        reconstructed.check_canaries(secret);
    }
}
