//! Scan geometry: region of interest, repetition and pixel size.
//!
//! [`resolve_geometry`] turns a requested ROI plus either a repetition or a
//! pixel size into a consistent [`ScanGeometry`]:
//!
//! ```text
//!   roi width  × field width  == repetition.x × pixel_size
//!   roi height × field height == repetition.y × pixel_size
//! ```
//!
//! Whenever the repetition has to be clipped (grid too large, pixel too small
//! for the scanner) the ROI is recomputed from the clipped repetition and
//! recentered on the requested center, so the triple never goes out of sync.
//!
//! [`ScanGrid`] expands a geometry into the physical positions of every pixel,
//! row-major with X iterating fastest. Physical Y points up: increasing row
//! index means decreasing Y.

use acq_core::capabilities::Scanner;
use acq_core::error::{AcqError, AcqResult};
use acq_core::limits::{FUZZING_TILE, GEOMETRY_EPSILON, MAX_REPETITION};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Region of interest as ratios of the full field: left, top, right, bottom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge (0 = field left).
    pub left: f64,
    /// Top edge (0 = field top).
    pub top: f64,
    /// Right edge (1 = field right).
    pub right: f64,
    /// Bottom edge (1 = field bottom).
    pub bottom: f64,
}

impl Roi {
    /// The reserved "undefined" sentinel, treated as the full field.
    pub const UNDEFINED: Roi = Roi::new(0.0, 0.0, 0.0, 0.0);

    /// The whole field.
    pub const FULL: Roi = Roi::new(0.0, 0.0, 1.0, 1.0);

    /// Build a ROI from its four edges.
    pub const fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Whether this is the undefined sentinel.
    pub fn is_undefined(&self) -> bool {
        *self == Roi::UNDEFINED
    }

    /// Width as a ratio of the field.
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    /// Height as a ratio of the field.
    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }

    /// Center as ratios of the field.
    pub fn center(&self) -> (f64, f64) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    fn validate(&self) -> AcqResult<()> {
        let edges = [self.left, self.top, self.right, self.bottom];
        if edges.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
            return Err(AcqError::Configuration(format!(
                "ROI {:?} must have all edges within [0, 1]",
                edges
            )));
        }
        if self.left > self.right || self.top > self.bottom {
            return Err(AcqError::Configuration(format!(
                "ROI {:?} must have left <= right and top <= bottom",
                edges
            )));
        }
        Ok(())
    }
}

/// How the sampling density is requested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    /// Number of positions along X and Y.
    Repetition(u32, u32),
    /// Distance between positions (m).
    PixelSize(f64),
}

/// Hardware limits the geometry must respect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanLimits {
    /// Physical size of the field (m).
    pub field_of_view: (f64, f64),
    /// Physical size of one scanner base pixel (m).
    pub base_pixel_size: (f64, f64),
    /// Scale range accepted by the scanner.
    pub scale_range: (f64, f64),
    /// Largest repetition accepted along each axis.
    pub max_repetition: (u32, u32),
}

impl ScanLimits {
    /// Limits of a scanner, with the default maximum grid.
    pub fn from_scanner(scanner: &dyn Scanner) -> Self {
        Self {
            field_of_view: scanner.field_of_view(),
            base_pixel_size: scanner.base_pixel_size(),
            scale_range: scanner.scale_range(),
            max_repetition: (MAX_REPETITION, MAX_REPETITION),
        }
    }

    fn pixel_size_range(&self) -> (f64, f64) {
        let base = self.base_pixel_size.0.max(self.base_pixel_size.1);
        let (smin, smax) = self.scale_range;
        let fov = self.field_of_view.0.max(self.field_of_view.1);
        let min = base * smin.max(f64::MIN_POSITIVE);
        (min, (base * smax).min(fov).max(min))
    }
}

/// A consistent (ROI, repetition, pixel size) triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanGeometry {
    /// Region of interest actually scanned.
    pub roi: Roi,
    /// Positions along X and Y.
    pub repetition: (u32, u32),
    /// Distance between positions (m).
    pub pixel_size: f64,
    /// Physical size of the field (m).
    pub field_of_view: (f64, f64),
}

impl ScanGeometry {
    /// Number of scan positions.
    pub fn len(&self) -> usize {
        self.repetition.0 as usize * self.repetition.1 as usize
    }

    /// Whether the grid is empty (never true for a resolved geometry).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical center of the ROI (m, Y up).
    pub fn center(&self) -> (f64, f64) {
        let (cx, cy) = self.roi.center();
        (
            (cx - 0.5) * self.field_of_view.0,
            -(cy - 0.5) * self.field_of_view.1,
        )
    }

    /// Physical size of the ROI (m).
    pub fn physical_size(&self) -> (f64, f64) {
        (
            self.roi.width() * self.field_of_view.0,
            self.roi.height() * self.field_of_view.1,
        )
    }
}

/// Resolve a requested ROI and sampling into a consistent geometry.
///
/// # Errors
/// [`AcqError::Configuration`] when the ROI is malformed or the sampling is
/// not positive.
pub fn resolve_geometry(roi: Roi, sampling: Sampling, limits: &ScanLimits) -> AcqResult<ScanGeometry> {
    let roi = if roi.is_undefined() { Roi::FULL } else { roi };
    roi.validate()?;
    let (fov_x, fov_y) = limits.field_of_view;
    if !(fov_x > 0.0 && fov_y > 0.0) {
        return Err(AcqError::Configuration("Scanner reports an empty field of view".into()));
    }
    let (size_x, size_y) = (roi.width() * fov_x, roi.height() * fov_y);
    let (pxs_min, pxs_max) = limits.pixel_size_range();
    let (max_rx, max_ry) = (limits.max_repetition.0.max(1), limits.max_repetition.1.max(1));

    let (mut rep, mut pxs) = match sampling {
        Sampling::PixelSize(p) => {
            if !(p.is_finite() && p > 0.0) {
                return Err(AcqError::Configuration(format!("Pixel size must be positive, got {}", p)));
            }
            let pxs = p.clamp(pxs_min, pxs_max);
            (
                (count_along(size_x, pxs), count_along(size_y, pxs)),
                pxs,
            )
        }
        Sampling::Repetition(rx, ry) => {
            if rx == 0 || ry == 0 {
                return Err(AcqError::Configuration(format!(
                    "Repetition must be positive, got {}x{}",
                    rx, ry
                )));
            }
            let rep = (rx.min(max_rx), ry.min(max_ry));
            let mut pxs = (size_x / rep.0 as f64).max(size_y / rep.1 as f64);
            // Keep the whole grid within the field.
            if rep.0 as f64 * pxs > fov_x || rep.1 as f64 * pxs > fov_y {
                pxs = (fov_x / rep.0 as f64).min(fov_y / rep.1 as f64);
            }
            if pxs <= 0.0 {
                pxs = pxs_min;
            }
            (rep, pxs.clamp(pxs_min, pxs_max))
        }
    };

    let fit_x = fit_count(fov_x, pxs).min(max_rx);
    let fit_y = fit_count(fov_y, pxs).min(max_ry);
    if rep.0 > fit_x || rep.1 > fit_y {
        let clipped = (rep.0.min(fit_x), rep.1.min(fit_y));
        warn!(
            requested = ?rep,
            clipped = ?clipped,
            pixel_size = pxs,
            "Repetition clipped by hardware limits"
        );
        rep = clipped;
        if let Sampling::PixelSize(_) = sampling {
            // Grow the pixel so the clipped grid still covers the ROI.
            pxs = (size_x / rep.0 as f64)
                .max(size_y / rep.1 as f64)
                .clamp(pxs_min, pxs_max)
                .min(fov_x / rep.0 as f64)
                .min(fov_y / rep.1 as f64);
        }
    }

    let roi = fit_roi(roi.center(), rep, pxs, limits.field_of_view);
    Ok(ScanGeometry {
        roi,
        repetition: rep,
        pixel_size: pxs,
        field_of_view: limits.field_of_view,
    })
}

fn count_along(size: f64, pxs: f64) -> u32 {
    ((size / pxs).round() as u32).max(1)
}

fn fit_count(fov: f64, pxs: f64) -> u32 {
    (((fov / pxs) + GEOMETRY_EPSILON).floor() as u32).max(1)
}

/// ROI of size `rep × pxs` centered on `center`, shifted back into the field.
fn fit_roi(center: (f64, f64), rep: (u32, u32), pxs: f64, fov: (f64, f64)) -> Roi {
    let half_w = (rep.0 as f64 * pxs / fov.0).min(1.0) / 2.0;
    let half_h = (rep.1 as f64 * pxs / fov.1).min(1.0) / 2.0;
    let cx = center.0.clamp(half_w, 1.0 - half_w);
    let cy = center.1.clamp(half_h, 1.0 - half_h);
    Roi::new(cx - half_w, cy - half_h, cx + half_w, cy + half_h)
}

// =============================================================================
// Scan grid
// =============================================================================

/// Physical positions of every pixel of a geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanGrid {
    geometry: ScanGeometry,
    positions: Vec<(f64, f64)>,
}

impl ScanGrid {
    /// Expand a geometry. Index `i` maps to row `i / X`, column `i % X`.
    pub fn new(geometry: ScanGeometry) -> Self {
        let (rx, ry) = geometry.repetition;
        let (cx, cy) = geometry.center();
        let pxs = geometry.pixel_size;
        let mut positions = Vec::with_capacity(geometry.len());
        for iy in 0..ry {
            for ix in 0..rx {
                positions.push((
                    cx + (ix as f64 - (rx as f64 - 1.0) / 2.0) * pxs,
                    cy - (iy as f64 - (ry as f64 - 1.0) / 2.0) * pxs,
                ));
            }
        }
        Self {
            geometry,
            positions,
        }
    }

    /// The geometry this grid was built from.
    pub fn geometry(&self) -> &ScanGeometry {
        &self.geometry
    }

    /// Shape as (rows, columns).
    pub fn shape(&self) -> (usize, usize) {
        (self.geometry.repetition.1 as usize, self.geometry.repetition.0 as usize)
    }

    /// Number of positions.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the grid has no position.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Physical position of index `i`.
    pub fn position(&self, index: usize) -> Option<(f64, f64)> {
        self.positions.get(index).copied()
    }

    /// (row, column) of index `i`.
    pub fn row_col(&self, index: usize) -> (usize, usize) {
        let cols = self.geometry.repetition.0.max(1) as usize;
        (index / cols, index % cols)
    }

    /// All positions in acquisition order.
    pub fn positions(&self) -> &[(f64, f64)] {
        &self.positions
    }
}

// =============================================================================
// Scanner mapping
// =============================================================================

/// Scanner translation (base pixels, Y down) for a physical position.
pub fn to_translation(position: (f64, f64), base: (f64, f64)) -> (f64, f64) {
    (position.0 / base.0, -position.1 / base.1)
}

/// Physical position for a scanner translation.
pub fn from_translation(translation: (f64, f64), base: (f64, f64)) -> (f64, f64) {
    (translation.0 * base.0, -translation.1 * base.1)
}

/// Scanner settings scanning one nominal pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelScan {
    /// Scanner scale.
    pub scale: (f64, f64),
    /// Scanner resolution: `(1, 1)` or the fuzzing tile.
    pub resolution: (u32, u32),
}

impl PixelScan {
    /// Settings for one pixel of `pixel_size`, optionally subdivided into a
    /// fuzzing tile as fine as the scanner allows.
    pub fn for_pixel(pixel_size: f64, limits: &ScanLimits, fuzzing: bool) -> Self {
        let base = limits.base_pixel_size;
        let (smin, smax) = limits.scale_range;
        let tile = if fuzzing {
            let finest = pixel_size / (base.0.max(base.1) * smin.max(f64::MIN_POSITIVE));
            (finest.floor() as u32).clamp(1, FUZZING_TILE)
        } else {
            1
        };
        let scale = (
            (pixel_size / (tile as f64 * base.0)).clamp(smin, smax),
            (pixel_size / (tile as f64 * base.1)).clamp(smin, smax),
        );
        Self {
            scale,
            resolution: (tile, tile),
        }
    }

    /// Side of the sub-pixel tile.
    pub fn tile(&self) -> u32 {
        self.resolution.0
    }
}

/// Clip a translation so a scan of `resolution × scale` stays in a field of
/// `shape` base pixels. Returns the clipped value and whether it changed.
pub fn clip_translation(
    translation: (f64, f64),
    shape: (u32, u32),
    resolution: (u32, u32),
    scale: (f64, f64),
) -> ((f64, f64), bool) {
    let lim_x = ((shape.0 as f64 - resolution.0 as f64 * scale.0) / 2.0).max(0.0);
    let lim_y = ((shape.1 as f64 - resolution.1 as f64 * scale.1) / 2.0).max(0.0);
    let clipped = (
        translation.0.clamp(-lim_x, lim_x),
        translation.1.clamp(-lim_y, lim_y),
    );
    let changed = (clipped.0 - translation.0).abs() > GEOMETRY_EPSILON
        || (clipped.1 - translation.1).abs() > GEOMETRY_EPSILON;
    (clipped, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ScanLimits {
        ScanLimits {
            field_of_view: (512e-8, 512e-8),
            base_pixel_size: (1e-8, 1e-8),
            scale_range: (1.0, 512.0),
            max_repetition: (2048, 2048),
        }
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 1e-9 * b.abs().max(1e-12), "{} != {}", a, b);
    }

    #[test]
    fn test_undefined_roi_is_full_field() {
        let g = resolve_geometry(Roi::UNDEFINED, Sampling::Repetition(8, 8), &limits()).unwrap();
        assert_eq!(g.roi, Roi::FULL);
        assert_eq!(g.repetition, (8, 8));
        assert_close(g.pixel_size, 64e-8);
    }

    #[test]
    fn test_repetition_with_other_aspect_fits_field() {
        let g = resolve_geometry(Roi::FULL, Sampling::Repetition(4, 3), &limits()).unwrap();
        assert_eq!(g.repetition, (4, 3));
        assert_close(g.pixel_size, 128e-8);
        assert_close(g.roi.width(), 1.0);
        assert_close(g.roi.height(), 0.75);
        assert_close(g.roi.center().1, 0.5);
    }

    #[test]
    fn test_pixel_size_rounds_repetition_and_recenters() {
        let roi = Roi::new(0.1, 0.1, 0.3, 0.2);
        let g = resolve_geometry(roi, Sampling::PixelSize(3e-8), &limits()).unwrap();
        let (sx, sy) = g.physical_size();
        assert_close(sx, g.repetition.0 as f64 * g.pixel_size);
        assert_close(sy, g.repetition.1 as f64 * g.pixel_size);
        assert_close(g.roi.center().0, 0.2);
        assert_close(g.roi.center().1, 0.15);
    }

    #[test]
    fn test_clipped_repetition_recomputes_roi() {
        let mut lim = limits();
        lim.max_repetition = (10, 10);
        let g = resolve_geometry(Roi::FULL, Sampling::PixelSize(1e-8), &lim).unwrap();
        assert_eq!(g.repetition, (10, 10));
        let (sx, _) = g.physical_size();
        assert_close(sx, 10.0 * g.pixel_size);
    }

    #[test]
    fn test_pixel_below_scanner_minimum_is_raised() {
        let g = resolve_geometry(Roi::FULL, Sampling::PixelSize(1e-10), &limits()).unwrap();
        assert_close(g.pixel_size, 1e-8);
        assert_eq!(g.repetition, (512, 512));
    }

    #[test]
    fn test_roi_near_edge_shifted_inside() {
        let roi = Roi::new(0.95, 0.0, 1.0, 0.05);
        let g = resolve_geometry(roi, Sampling::Repetition(100, 100), &limits()).unwrap();
        assert!(g.roi.left >= 0.0 && g.roi.right <= 1.0 + 1e-12);
        assert!(g.roi.top >= 0.0);
    }

    #[test]
    fn test_invalid_roi_rejected() {
        for roi in [
            Roi::new(0.5, 0.0, 0.4, 1.0),
            Roi::new(0.0, 0.0, 1.2, 1.0),
            Roi::new(f64::NAN, 0.0, 1.0, 1.0),
        ] {
            assert!(matches!(
                resolve_geometry(roi, Sampling::Repetition(2, 2), &limits()),
                Err(AcqError::Configuration(_))
            ));
        }
        assert!(resolve_geometry(Roi::FULL, Sampling::Repetition(0, 2), &limits()).is_err());
        assert!(resolve_geometry(Roi::FULL, Sampling::PixelSize(-1.0), &limits()).is_err());
    }

    #[test]
    fn test_grid_order_and_y_inversion() {
        let g = resolve_geometry(Roi::FULL, Sampling::Repetition(4, 3), &limits()).unwrap();
        let grid = ScanGrid::new(g);
        assert_eq!(grid.shape(), (3, 4));
        assert_eq!(grid.len(), 12);
        let p0 = grid.position(0).unwrap();
        let p1 = grid.position(1).unwrap();
        let p4 = grid.position(4).unwrap();
        assert_close(p1.0 - p0.0, g.pixel_size);
        assert_close(p0.1 - p4.1, g.pixel_size);
        assert_eq!(grid.row_col(5), (1, 1));
        assert!(p0.1 > 0.0 && p0.0 < 0.0);
    }

    #[test]
    fn test_translation_mapping() {
        let base = (1e-8, 2e-8);
        let t = to_translation((3e-8, 4e-8), base);
        assert_close(t.0, 3.0);
        assert_close(t.1, -2.0);
        let p = from_translation(t, base);
        assert_close(p.0, 3e-8);
        assert_close(p.1, 4e-8);
    }

    #[test]
    fn test_fuzzing_tile_limited_by_min_scale() {
        let lim = limits();
        assert_eq!(PixelScan::for_pixel(64e-8, &lim, true).tile(), 4);
        assert_eq!(PixelScan::for_pixel(2e-8, &lim, true).tile(), 2);
        let plain = PixelScan::for_pixel(64e-8, &lim, false);
        assert_eq!(plain.resolution, (1, 1));
        assert_close(plain.scale.0, 64.0);
    }

    #[test]
    fn test_clip_translation() {
        let (t, clipped) = clip_translation((300.0, -10.0), (512, 512), (1, 1), (1.0, 1.0));
        assert!(clipped);
        assert_close(t.0, 255.5);
        let (_, clipped) = clip_translation((10.0, -10.0), (512, 512), (1, 1), (1.0, 1.0));
        assert!(!clipped);
    }
}
