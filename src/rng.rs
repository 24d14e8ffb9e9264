//! A dedicated, constant-seeded PRNG for the "kind-of random" orderings used
//! when enumerating cores or contexts (spec §4.7, §9 "kind-of random
//! ordering").
//!
//! We deliberately don't reach for `rand::thread_rng()` here: that would make
//! scheduling order depend on process-external entropy, and two runs of the
//! same simulation would no longer pick the same least-loaded core on ties.
//! A `ChaCha8Rng` seeded from a fixed constant gives the same Fisher-Yates
//! shuffle order every run, matching the original's own `prng_next_long()`
//! with a fixed seed.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seed used for every `DeterministicRng`. Picked arbitrarily; the only
/// requirement is that it's fixed across runs.
const SEED: u64 = 0x5153_5450_5349_4D00;

pub struct DeterministicRng {
    inner: ChaCha8Rng,
}

impl DeterministicRng {
    pub fn new() -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(SEED),
        }
    }

    /// Fisher-Yates shuffle in index order, matching spec §4.7 exactly:
    /// for `i` from `0..n-1`, swap `vec[i]` with `vec[i + prng_next_long() %
    /// (n-i)]`.
    pub fn shuffle<T>(&mut self, vec: &mut [T]) {
        let n = vec.len();
        for i in 0..n {
            let remaining = n - i;
            let j = i + (self.inner.gen_range(0..remaining as u64) as usize);
            vec.swap(i, j);
        }
    }
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_is_deterministic_across_instances() {
        let mut a: Vec<i32> = (0..10).collect();
        let mut b: Vec<i32> = (0..10).collect();
        DeterministicRng::new().shuffle(&mut a);
        DeterministicRng::new().shuffle(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut v: Vec<i32> = (0..20).collect();
        DeterministicRng::new().shuffle(&mut v);
        let mut sorted = v.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }
}
