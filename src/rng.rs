//! Seedable random number generator for deterministic testing.
//!
//! When a seed is provided via [`Config::rng_seed`](crate::Config::rng_seed),
//! identifiers that need not be secret (session ids, connection ids) become
//! deterministic. Handshake randoms and key material always come from the OS.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A random number generator that can be seeded for deterministic behavior.
///
/// Shared between threads, hence the internal lock.
pub struct SeededRng {
    inner: Option<Mutex<StdRng>>,
}

impl SeededRng {
    /// Create a new RNG with an optional seed.
    ///
    /// If `seed` is `Some`, the RNG will produce deterministic values.
    /// If `seed` is `None`, it will use the thread-local random generator.
    pub fn new(seed: Option<u64>) -> Self {
        let inner = seed.map(|s| Mutex::new(StdRng::seed_from_u64(s)));
        Self { inner }
    }

    /// Fill `out` with random bytes.
    pub fn fill(&self, out: &mut [u8]) {
        match self.inner.as_ref() {
            Some(rng) => rng.lock().fill(out),
            None => rand::thread_rng().fill(out),
        }
    }
}

impl std::fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let is_seeded = self.inner.is_some();
        f.debug_struct("SeededRng")
            .field("seeded", &is_seeded)
            .finish()
    }
}
