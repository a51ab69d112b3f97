//! Deterministic random streams keyed by logical work item.
//!
//! Workers never share a generator: each unit of work (a pixel, an event, a
//! fit probe) asks the pool for the stream of its own index, so the numbers
//! it draws depend only on the base seed and that index, not on which thread
//! ran it or in what order.

use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngStreamPool {
    seed: u64,
}

impl RngStreamPool {
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Generator for work item `index`.
    pub fn stream(&self, index: u64) -> StdRng {
        StdRng::seed_from_u64(mix(self.seed ^ mix(index)))
    }

    /// Independent pool for a nested scope, e.g. one fit iteration.
    pub fn derive(&self, label: u64) -> Self {
        Self::new(mix(self.seed.wrapping_add(0x9E37_79B9_7F4A_7C15) ^ mix(!label)))
    }
}

/// SplitMix64 finaliser.
fn mix(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
