//! Bounded uniform random source for lottery draws.
//!
//! The scheduler only needs "a uniformly distributed integer below an
//! exclusive bound". A seeded xorshift generator keeps runs reproducible;
//! rejection sampling removes the modulo bias that a bare `% bound` would
//! introduce into ticket selection.

use spin::Mutex;

/// Deterministic pseudo-random source shared by all CPUs.
pub struct Rng {
    state: Mutex<u64>,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        // xorshift has a single absorbing zero state.
        let seed = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self { state: Mutex::new(seed) }
    }

    /// Next raw 64-bit value (xorshift64*).
    fn next(&self) -> u64 {
        let mut s = self.state.lock();
        let mut x = *s;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *s = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform draw in `[0, bound)`. `bound` must be nonzero.
    pub fn below(&self, bound: u64) -> u64 {
        assert!(bound > 0, "rand: zero bound");
        // Reject draws from the incomplete final block.
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let r = self.next();
            if r < zone {
                return r % bound;
            }
        }
    }
}
