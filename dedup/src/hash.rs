//! Content hashing: a randomized per-position sampling table folded through
//! a small mix step.
//!
//! The permutation shuffle uses a dependency-free PCG32, in the same spirit
//! as the engine's other no-crate primitives: sampling resistance against
//! adversarial page headers is the goal, not unpredictability, so pulling in
//! a full `rand` stack (and the OS entropy source it wants) would be
//! overkill for a one-shot boot-time shuffle.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::page_ops::{PageContent, PAGE_U32S};

/// Minimal PCG32, used only to shuffle the sampling permutation at startup.
#[derive(Clone, Copy, Debug)]
struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    const DEFAULT_INC: u64 = 1442695040888963407;
    const MULTIPLIER: u64 = 6364136223846793005;

    fn new(seed: u64) -> Self {
        let mut rng = Pcg32 { state: 0, inc: Self::DEFAULT_INC };
        rng.state = seed.wrapping_add(rng.inc);
        rng.step();
        rng
    }

    fn step(&mut self) {
        self.state = self.state.wrapping_mul(Self::MULTIPLIER).wrapping_add(self.inc);
    }

    fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.step();
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform value in `[0, bound)` via Lemire's rejection method.
    fn next_bounded(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        let threshold = bound.wrapping_neg() % bound;
        loop {
            let candidate = self.next_u32();
            let (product, _) = (candidate as u64 * bound as u64).overflowing_shr(32);
            let low = candidate.wrapping_mul(bound);
            if low >= threshold {
                return product as u32;
            }
        }
    }
}

/// Mix constant the digest loop starts from; arbitrary but fixed so that
/// checksums are stable across runs with the same permutation.
const HASH_SEED: u32 = 0xdead_beef;

/// The process-wide random permutation table used to sample page words.
///
/// Built once at engine startup from a coarse entropy source (a timestamp
/// counter on the host), then reused for every checksum computed for the
/// lifetime of the engine: two pages must be sampled at the same positions
/// to be comparable.
pub struct Permutation {
    order: Box<[u32]>,
    strength: usize,
}

impl Permutation {
    /// Builds a fresh permutation of all word offsets in a page and shuffles
    /// it with `seed`. `strength` (the number of leading entries folded into
    /// each checksum) defaults to `PAGE_U32S / 16`.
    pub fn new(seed: u64) -> Self {
        let mut order: Vec<u32> = (0..PAGE_U32S as u32).collect();
        let mut rng = Pcg32::new(seed);
        // Fisher-Yates.
        for i in (1..order.len()).rev() {
            let j = rng.next_bounded((i + 1) as u32) as usize;
            order.swap(i, j);
        }
        Permutation { order: order.into_boxed_slice(), strength: PAGE_U32S / 16 }
    }

    /// Folds the leading `strength` sampled positions of `content` into a
    /// u32 digest.
    pub fn checksum(&self, content: &PageContent) -> u32 {
        let words = content.as_words();
        let mut hash = HASH_SEED;
        for &pos in &self.order[..self.strength] {
            hash = hash.wrapping_add(words[pos as usize]);
            hash = hash.wrapping_add(hash << 8);
            hash ^= hash >> 12;
        }
        hash
    }

    /// The checksum an all-zero page produces under this permutation.
    pub fn zero_checksum(&self) -> u32 {
        self.checksum(&PageContent::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_fixed_seed() {
        let a = Permutation::new(42);
        let b = Permutation::new(42);
        let content = PageContent::from_words(&[7u32; PAGE_U32S]);
        assert_eq!(a.checksum(&content), b.checksum(&content));
    }

    #[test]
    fn distinguishes_different_content() {
        let perm = Permutation::new(1);
        let words_a: Vec<u32> = (0..PAGE_U32S as u32).collect();
        let words_b: Vec<u32> = (0..PAGE_U32S as u32).map(|w| w.wrapping_add(1)).collect();
        let a = PageContent::from_words(&words_a);
        let b = PageContent::from_words(&words_b);
        assert_ne!(perm.checksum(&a), perm.checksum(&b));
    }

    #[test]
    fn zero_checksum_matches_zero_content() {
        let perm = Permutation::new(5);
        assert_eq!(perm.zero_checksum(), perm.checksum(&PageContent::zero()));
    }

    #[test]
    fn permutation_is_a_bijection() {
        let perm = Permutation::new(99);
        let mut seen = alloc::vec![false; PAGE_U32S];
        for &pos in perm.order.iter() {
            assert!(!seen[pos as usize], "offset sampled twice");
            seen[pos as usize] = true;
        }
    }
}
