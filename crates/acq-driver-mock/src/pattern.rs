//! Synthetic specimen and sample generators for simulated detectors.

/// Simple pseudo-random number generator (LCG) for reproducible texture.
/// Uses the same algorithm as glibc for predictable cross-platform behavior.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// A simulated specimen: intensity as a function of physical position.
///
/// The surface is a lattice of Gaussian particles of varying brightness on a
/// faint gradient. Features are non periodic at the scale of a few lattice
/// cells so that image registration has a unique answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Specimen {
    /// Lattice spacing of the particles (m).
    pub feature_size: f64,
    /// Peak intensity of the brightest particle.
    pub amplitude: f64,
}

impl Default for Specimen {
    fn default() -> Self {
        Self {
            feature_size: 2e-6,
            amplitude: 1000.0,
        }
    }
}

impl Specimen {
    /// Intensity at a physical position (m, Y up).
    pub fn intensity(&self, x: f64, y: f64) -> f64 {
        if self.feature_size <= 0.0 {
            return 0.0;
        }
        let u = x / self.feature_size;
        let v = y / self.feature_size;
        let sigma = 0.25;

        // Only the 3×3 neighbouring cells contribute noticeably.
        let (cu, cv) = (u.floor(), v.floor());
        let mut sum = 0.0;
        for du in -1..=1 {
            for dv in -1..=1 {
                let (i, j) = (cu + du as f64, cv + dv as f64);
                let seed = prng((i as i64 as u64).wrapping_mul(73856093) ^ (j as i64 as u64).wrapping_mul(19349663));
                let brightness = 0.3 + 0.7 * (seed % 1000) as f64 / 1000.0;
                let jitter_u = ((seed >> 10) % 100) as f64 / 400.0;
                let jitter_v = ((seed >> 17) % 100) as f64 / 400.0;
                let (pu, pv) = (i + 0.5 + jitter_u - 0.125, j + 0.5 + jitter_v - 0.125);
                let d2 = (u - pu).powi(2) + (v - pv).powi(2);
                sum += brightness * (-d2 / (2.0 * sigma * sigma)).exp();
            }
        }
        let gradient = 0.05 * (u * 0.1).sin() + 0.05;
        self.amplitude * (sum + gradient)
    }
}

/// Value of element `index` of a multi-element frame (spectrum channel or
/// image pixel) built around a base value.
pub fn element_value(base: f64, index: usize, len: usize) -> f64 {
    if len <= 1 {
        return base;
    }
    let center = (len as f64 - 1.0) / 2.0;
    let width = (len as f64 / 4.0).max(1.0);
    let profile = (-((index as f64 - center) / width).powi(2)).exp();
    base * profile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specimen_is_deterministic_and_positive() {
        let s = Specimen::default();
        let a = s.intensity(1.3e-6, -4.2e-6);
        assert_eq!(a, s.intensity(1.3e-6, -4.2e-6));
        assert!(a > 0.0);
    }

    #[test]
    fn test_specimen_varies() {
        let s = Specimen::default();
        let values: Vec<f64> = (0..20).map(|i| s.intensity(i as f64 * 3e-7, 0.0)).collect();
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(max - min > 50.0);
    }

    #[test]
    fn test_element_value_single() {
        assert_eq!(element_value(7.0, 0, 1), 7.0);
        assert!(element_value(7.0, 0, 16) < element_value(7.0, 8, 16));
    }
}
