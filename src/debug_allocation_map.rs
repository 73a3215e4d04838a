//! Tracks the internal status of allocated objects in debug builds.
//!
//! `backtrace-labs/slitter`'s version of this module keys entries by
//! `Class`. There is no single analog here: an address can come from a
//! [`crate::zone::Zone`] (keyed by chunk size) or a
//! [`crate::big_zone::BigZone`] (no fixed size). [`Owner`] generalizes the
//! key to cover both, so contracts on `Zone::alloc`/`free` and
//! `BigZone::new`/`free` can all assert against the same ground-truth map.

use std::collections::HashMap;
use std::sync::Mutex;

/// What kind of allocator served an address, for ground-truth bookkeeping
/// independent of the bitmap/canary state the allocator itself maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Came from a zone with this chunk size.
    Zone(usize),
    /// Came from the big-allocation path.
    Big,
}

struct AllocationInfo {
    owner: Owner,
    live: bool,
}

lazy_static::lazy_static! {
    static ref ALLOCATION_STATE_MAP: Mutex<HashMap<usize, AllocationInfo>> = Default::default();
}

/// Confirms that it makes sense to return this allocation to the caller.
pub fn can_be_allocated(owner: Owner, addr: usize) -> Result<(), &'static str> {
    let map = ALLOCATION_STATE_MAP.lock().unwrap();

    if let Some(info) = map.get(&addr) {
        if info.owner != owner {
            return Err("owner mismatch");
        }

        if info.live {
            return Err("double allocation");
        }
    }

    Ok(())
}

/// Marks this allocation as returned to the caller.
pub fn mark_allocated(owner: Owner, addr: usize) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map
        .entry(addr)
        .or_insert(AllocationInfo { owner, live: false });

    if info.owner != owner {
        return Err("owner mismatch");
    }

    if info.live {
        return Err("double allocation");
    }

    info.live = true;
    Ok(())
}

/// Marks this allocation as released by the caller.
pub fn mark_released(owner: Owner, addr: usize) -> Result<(), &'static str> {
    let mut map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map.get_mut(&addr).ok_or("released unknown address")?;

    if info.owner != owner {
        return Err("owner mismatch");
    }

    if !info.live {
        return Err("double free");
    }

    info.live = false;
    Ok(())
}

/// Confirms that the allocation has been released by the caller.
pub fn has_been_released(owner: Owner, addr: usize) -> Result<(), &'static str> {
    let map = ALLOCATION_STATE_MAP.lock().unwrap();
    let info = map.get(&addr).ok_or("released unknown address")?;

    if info.owner != owner {
        return Err("owner mismatch");
    }

    if info.live {
        return Err("released a live allocation");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_release_round_trips() {
        let owner = Owner::Zone(64);
        let addr = 0x1000;

        assert!(can_be_allocated(owner, addr).is_ok());
        assert!(mark_allocated(owner, addr).is_ok());
        assert!(mark_allocated(owner, addr).is_err());

        assert!(mark_released(owner, addr).is_ok());
        assert!(has_been_released(owner, addr).is_ok());
        assert!(mark_released(owner, addr).is_err());
    }

    #[test]
    fn owner_mismatch_is_rejected() {
        let addr = 0x2000;
        assert!(mark_allocated(Owner::Zone(128), addr).is_ok());
        assert!(mark_released(Owner::Big, addr).is_err());
        assert!(mark_released(Owner::Zone(128), addr).is_ok());
    }
}
