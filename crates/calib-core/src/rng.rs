//! Deterministic RNG wrapper and seed-derivation helpers.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Deterministic RNG handle handed to sampling algorithms and executors.
///
/// A master `seed: u64` is supplied by the run configuration. Every random
/// decision made for iteration `k` draws from a substream derived by hashing
/// `(master_seed, k)` with SipHash-1-3 under fixed zero keys, so restoring an
/// algorithm snapshot reproduces the exact draws without persisting generator
/// state.
#[derive(Debug, Clone)]
pub struct RngHandle {
    rng: StdRng,
}

impl RngHandle {
    /// Creates a new RNG handle from a master seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Creates the handle used for all draws belonging to one iteration.
    pub fn for_iteration(master_seed: u64, iteration: usize) -> Self {
        Self::from_seed(derive_substream_seed(master_seed, iteration as u64))
    }

    /// Returns a mutable reference to the underlying RNG for advanced usage.
    pub fn inner_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl RngCore for RngHandle {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// Derives the deterministic seed for a specific substream.
pub fn derive_substream_seed(master_seed: u64, substream: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(master_seed);
    hasher.write_u64(substream);
    hasher.finish()
}

/// Seed handed to the simulator for one replicate of one sample.
pub fn simulation_seed(
    master_seed: u64,
    iteration: usize,
    sample: usize,
    replicate: usize,
) -> u64 {
    let intermediate = derive_substream_seed(master_seed ^ 0x5EED_CA11_B5A7_0000, iteration as u64);
    derive_substream_seed(intermediate, ((sample as u64) << 16) | replicate as u64)
}
