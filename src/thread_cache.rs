//! Per-thread LIFO cache of recently used zones, keyed by chunk size.
//!
//! `backtrace-labs/slitter` has a richer analog in its `Cache`
//! (`cache.rs`), which holds a full pair of magazines per class behind
//! `thread_local!` + `.try_with()` with a slow-path fallback for
//! TLS-teardown races. This cache is deliberately simpler -- it is a hint
//! only, never a source of truth (`crate::root::Root` is), so a linear
//! scan of eight entries and a flush on thread exit is all it needs.

use std::cell::RefCell;

use crate::config::THREAD_ZONE_CACHE_SIZE;

#[derive(Clone, Copy)]
struct CacheEntry {
    chunk_size: usize,
    zone_index: usize,
}

struct ThreadCache {
    entries: Vec<CacheEntry>,
}

impl ThreadCache {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(THREAD_ZONE_CACHE_SIZE),
        }
    }

    fn lookup(&self, chunk_size: usize) -> Option<usize> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.chunk_size == chunk_size)
            .map(|e| e.zone_index)
    }

    fn record(&mut self, chunk_size: usize, zone_index: usize) {
        if self.entries.len() == THREAD_ZONE_CACHE_SIZE {
            self.entries.remove(0);
        }
        self.entries.push(CacheEntry {
            chunk_size,
            zone_index,
        });
    }
}

thread_local! {
    static CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::new());
}

/// Looks up a zone index previously recorded for `chunk_size` on this
/// thread. The cache is a hint: a miss (including during TLS teardown)
/// just means the caller falls back to the root's first-fit search.
pub fn lookup(chunk_size: usize) -> Option<usize> {
    CACHE
        .try_with(|cache| cache.borrow().lookup(chunk_size))
        .unwrap_or(None)
}

/// Records that `zone_index` served `chunk_size` on this thread, evicting
/// the oldest entry if the cache is already at capacity.
pub fn record(chunk_size: usize, zone_index: usize) {
    let _ = CACHE.try_with(|cache| cache.borrow_mut().record(chunk_size, zone_index));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_looks_up() {
        record(64, 3);
        assert_eq!(lookup(64), Some(3));
        assert_eq!(lookup(128), None);
    }

    #[test]
    fn most_recent_record_for_a_size_wins() {
        record(256, 1);
        record(256, 2);
        assert_eq!(lookup(256), Some(2));
    }

    #[test]
    fn evicts_oldest_entry_past_capacity() {
        for i in 0..THREAD_ZONE_CACHE_SIZE + 2 {
            record(1000 + i, i);
        }
        assert_eq!(lookup(1000), None);
        assert_eq!(lookup(1000 + THREAD_ZONE_CACHE_SIZE + 1), Some(THREAD_ZONE_CACHE_SIZE + 1));
    }
}
