//! Seeded RNG wrapper for reproducible behavior.
//!
//! Shared by error injection and by the noise added to simulated samples.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded RNG wrapper for reproducible random behavior
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG with optional seed.
    /// If seed is None, uses a random seed from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Whether an operation should fail for a failure probability in `[0, 1]`.
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Gaussian-ish noise with the given amplitude (sum of uniforms).
    pub fn noise(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        let mut rng = self.inner.lock();
        let sum: f64 = (0..4).map(|_| rng.gen::<f64>() - 0.5).sum();
        sum * amplitude
    }

    /// Generate a random value in the given range
    pub fn gen_range<T, R>(&self, range: R) -> T
    where
        T: rand::distributions::uniform::SampleUniform,
        R: rand::distributions::uniform::SampleRange<T>,
    {
        self.inner.lock().gen_range(range)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_is_reproducible() {
        let a = MockRng::new(Some(7));
        let b = MockRng::new(Some(7));
        for _ in 0..10 {
            assert_eq!(a.gen_range(0..1000u32), b.gen_range(0..1000u32));
        }
    }

    #[test]
    fn test_noise_bounds() {
        let rng = MockRng::new(Some(1));
        for _ in 0..100 {
            assert!(rng.noise(2.0).abs() <= 4.0);
        }
        assert_eq!(rng.noise(0.0), 0.0);
    }
}
