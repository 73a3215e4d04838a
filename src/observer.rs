//! The profiler / sanity-sampler seam.
//!
//! The original allocator's heap profiler and uninitialized-read sanity
//! sampler are collaborators, not part of this module's scope (see
//! `SPEC_FULL.md` §10.6) -- but the façade still needs somewhere to call
//! out to if one is ever attached, the same way `backtrace-labs/slitter`
//! keeps its `Mapper` trait as an attachment point (`mapper.rs`) rather
//! than hard-coding one mapping strategy.

use std::sync::RwLock;

/// Observes allocator events. The default implementation does nothing;
/// callers that want profiling or sanity sampling register their own
/// implementation with [`set_observer`].
pub trait AllocEventObserver: Send + Sync {
    fn on_alloc(&self, _size: usize, _addr: usize) {}
    fn on_free(&self, _addr: usize) {}
    fn on_zone_created(&self, _chunk_size: usize) {}
}

struct NoopObserver;

impl AllocEventObserver for NoopObserver {}

lazy_static::lazy_static! {
    static ref OBSERVER: RwLock<&'static dyn AllocEventObserver> = RwLock::new(&NoopObserver);
}

/// Installs a new process-wide observer. Intended to be called once, early
/// in process startup, by a profiler collaborator.
pub fn set_observer(observer: &'static dyn AllocEventObserver) {
    *OBSERVER.write().unwrap() = observer;
}

pub fn notify_alloc(size: usize, addr: usize) {
    OBSERVER.read().unwrap().on_alloc(size, addr);
}

pub fn notify_free(addr: usize) {
    OBSERVER.read().unwrap().on_free(addr);
}

pub fn notify_zone_created(chunk_size: usize) {
    OBSERVER.read().unwrap().on_zone_created(chunk_size);
}

/// Reads the profiler output path from the environment, once. Returns
/// `None` if unset -- the allocator itself never opens or writes this
/// file; it's read by the (out-of-scope) profiler collaborator.
pub fn profiler_file_path() -> Option<String> {
    std::env::var(crate::config::PROFILER_ENV_VAR).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        allocs: AtomicUsize,
    }

    impl AllocEventObserver for CountingObserver {
        fn on_alloc(&self, _size: usize, _addr: usize) {
            self.allocs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        notify_alloc(16, 0x1000);
        notify_free(0x1000);
        notify_zone_created(16);
    }

    #[test]
    fn profiler_env_var_round_trips() {
        std::env::set_var(crate::config::PROFILER_ENV_VAR, "/tmp/profile.out");
        assert_eq!(
            profiler_file_path(),
            Some("/tmp/profile.out".to_string())
        );
        std::env::remove_var(crate::config::PROFILER_ENV_VAR);
    }

    #[test]
    fn custom_observer_receives_events() {
        lazy_static::lazy_static! {
            static ref COUNTER: CountingObserver = CountingObserver {
                allocs: AtomicUsize::new(0),
            };
        }
        set_observer(&*COUNTER);
        notify_alloc(32, 0x2000);
        assert_eq!(COUNTER.allocs.load(Ordering::SeqCst), 1);
    }
}
