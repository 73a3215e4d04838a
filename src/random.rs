//! The allocator's sole source of unpredictability: per-zone secrets,
//! canary values, bit-slot shuffling, and the big-zone node's offset within
//! its metadata page all come from here.
//!
//! Unlike `backtrace-labs/slitter`, which has no canaries or masks to
//! randomize, this allocator leans on `rand` the way this pack's other
//! hardened-allocation examples do (`rand::thread_rng()` seeded from OS
//! entropy), rather than hand-rolling a PRNG.

use rand::Rng;

/// Returns a uniformly distributed 64-bit value.
#[inline]
pub fn next_u64() -> u64 {
    rand::thread_rng().gen()
}

/// Returns a uniformly distributed value in `[0, bound)`.
///
/// `bound` must be nonzero.
#[inline]
pub fn below(bound: usize) -> usize {
    assert!(bound > 0, "below() requires a nonzero bound");
    rand::thread_rng().gen_range(0..bound)
}

/// Generates a fresh 64-bit canary secret with its low byte forced to zero.
///
/// Forcing the low byte to zero means a single-byte linear overflow (the
/// most common off-by-one) always corrupts the stored canary in a way that
/// [`crate::config::CANARY_VALIDATE_MASK`] would not already have masked
/// away, so it is always caught.
#[inline]
pub fn new_canary_secret() -> u64 {
    next_u64() & !0xffu64
}

/// Generates a fresh 64-bit pointer-masking secret.
#[inline]
pub fn new_pointer_mask() -> u64 {
    next_u64()
}

/// Shuffles `slots` in place using a Fisher-Yates pass driven by this
/// module's random source.
pub fn shuffle(slots: &mut [u32]) {
    let mut rng = rand::thread_rng();

    for i in (1..slots.len()).rev() {
        let j = rng.gen_range(0..=i);
        slots.swap(i, j);
    }
}

#[test]
fn canary_secret_low_byte_is_zero() {
    for _ in 0..100 {
        assert_eq!(new_canary_secret() & 0xff, 0);
    }
}

#[test]
fn below_respects_bound() {
    for _ in 0..1000 {
        assert!(below(7) < 7);
    }
}

#[test]
fn shuffle_is_a_permutation() {
    let mut slots: Vec<u32> = (0..32).collect();
    let original = slots.clone();

    shuffle(&mut slots);

    let mut sorted = slots.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, original);
}
