//! Randomized checks of the geometry resolution.

use acq_engine::geometry::{resolve_geometry, Roi, Sampling, ScanGrid, ScanLimits};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const EPS: f64 = 1e-9;

fn limits(rng: &mut ChaCha8Rng) -> ScanLimits {
    let w = rng.gen_range(64..2048) as f64;
    let h = rng.gen_range(64..2048) as f64;
    let base = rng.gen_range(1e-9..1e-7);
    ScanLimits {
        field_of_view: (w * base, h * base),
        base_pixel_size: (base, base),
        scale_range: (1.0, w.max(h)),
        max_repetition: (rng.gen_range(1..1024), rng.gen_range(1..1024)),
    }
}

fn roi(rng: &mut ChaCha8Rng) -> Roi {
    let left = rng.gen_range(0.0..0.9);
    let top = rng.gen_range(0.0..0.9);
    let right = rng.gen_range(left + 0.01..=1.0);
    let bottom = rng.gen_range(top + 0.01..=1.0);
    Roi::new(left, top, right, bottom)
}

#[test]
fn test_resolved_geometry_always_fits_field() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5ca7);
    for case in 0..500 {
        let limits = limits(&mut rng);
        let roi = roi(&mut rng);
        let sampling = if rng.gen_bool(0.5) {
            Sampling::Repetition(rng.gen_range(1..300), rng.gen_range(1..300))
        } else {
            let fov = limits.field_of_view.0.max(limits.field_of_view.1);
            Sampling::PixelSize(fov * rng.gen_range(1e-4..0.5))
        };

        let g = resolve_geometry(roi, sampling, &limits).unwrap();
        let (rx, ry) = g.repetition;
        let (fx, fy) = limits.field_of_view;
        let min_pxs = limits.base_pixel_size.0 * limits.scale_range.0;

        assert!(rx >= 1 && ry >= 1, "case {}: {:?}", case, g);
        assert!(rx <= limits.max_repetition.0 && ry <= limits.max_repetition.1, "case {}: {:?}", case, g);
        assert!(g.pixel_size >= min_pxs * (1.0 - EPS), "case {}: {:?}", case, g);
        assert!(rx as f64 * g.pixel_size <= fx * (1.0 + EPS), "case {}: {:?}", case, g);
        assert!(ry as f64 * g.pixel_size <= fy * (1.0 + EPS), "case {}: {:?}", case, g);
        assert!(g.roi.left >= -EPS && g.roi.right <= 1.0 + EPS, "case {}: {:?}", case, g);
        assert!(g.roi.top >= -EPS && g.roi.bottom <= 1.0 + EPS, "case {}: {:?}", case, g);

        let (sx, sy) = g.physical_size();
        assert!((sx - rx as f64 * g.pixel_size).abs() <= fx * EPS, "case {}: {:?}", case, g);
        assert!((sy - ry as f64 * g.pixel_size).abs() <= fy * EPS, "case {}: {:?}", case, g);

        let grid = ScanGrid::new(g);
        assert_eq!(grid.len(), rx as usize * ry as usize);
        for &(x, y) in grid.positions() {
            assert!(x.abs() <= fx / 2.0 * (1.0 + EPS), "case {}: x = {}", case, x);
            assert!(y.abs() <= fy / 2.0 * (1.0 + EPS), "case {}: y = {}", case, y);
        }
    }
}
