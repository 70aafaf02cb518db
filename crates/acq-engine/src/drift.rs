//! Anchor-based drift correction.
//!
//! [`AnchorDriftCorrector`] periodically scans a fixed anchor region with the
//! scanning emitter and a scan-driven detector, and compares every anchor
//! image with the first one by phase correlation. The shift found is the
//! specimen drift since the start of the acquisition; the engine subtracts it
//! from all later scan positions.
//!
//! Sign convention: the beam at translation `t` sees the specimen point that
//! was at `t + drift` when the acquisition started, so aiming at `t - drift`
//! cancels the drift.

use crate::geometry::{resolve_geometry, to_translation, Roi, Sampling, ScanLimits};
use crate::leech::Leech;
use crate::live::LiveStore;
use crate::sync::DetectorChannel;
use acq_core::capabilities::{names, Detector, Scanner, TriggerMode};
use acq_core::data::{DataArray, Metadata};
use acq_core::limits::SYNC_TIMEOUT_MARGIN;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ndarray::{Array2, Array3, Axis, Ix2};
use num_complex::Complex64;
use parking_lot::Mutex;
use rustfft::FftPlanner;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Settings of one anchor scan.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AnchorScan {
    scale: (f64, f64),
    resolution: (u32, u32),
    translation: (f64, f64),
    pixel_size: f64,
    center: (f64, f64),
}

#[derive(Debug, Default)]
struct AnchorState {
    reference: Option<Array2<f64>>,
    drift: (f64, f64),
    images: Vec<Array2<f64>>,
    first_date: Option<chrono::DateTime<chrono::Utc>>,
    steps: u64,
}

/// Leech measuring specimen drift on an anchor region.
pub struct AnchorDriftCorrector {
    emitter: Arc<dyn Scanner>,
    detector: Arc<dyn Detector>,
    roi: Roi,
    pixel_size: f64,
    dwell_time: f64,
    period: Duration,
    state: Mutex<AnchorState>,
}

impl std::fmt::Debug for AnchorDriftCorrector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorDriftCorrector")
            .field("roi", &self.roi)
            .field("pixel_size", &self.pixel_size)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl AnchorDriftCorrector {
    /// Corrector scanning `roi` with `pixel_size` (m) using `detector`.
    pub fn new(emitter: Arc<dyn Scanner>, detector: Arc<dyn Detector>, roi: Roi, pixel_size: f64) -> Self {
        Self {
            emitter,
            detector,
            roi,
            pixel_size,
            dwell_time: 1e-6,
            period: Duration::from_secs(10),
            state: Mutex::new(AnchorState::default()),
        }
    }

    /// Dwell time of the anchor scans (s).
    pub fn with_dwell_time(mut self, dwell: f64) -> Self {
        self.dwell_time = dwell;
        self
    }

    /// Acquisition time between two checkpoints.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Drift measured so far (scanner pixels).
    pub fn drift(&self) -> (f64, f64) {
        self.state.lock().drift
    }

    fn plan_scan(&self) -> Result<AnchorScan> {
        let limits = ScanLimits::from_scanner(self.emitter.as_ref());
        let geometry = resolve_geometry(self.roi, Sampling::PixelSize(self.pixel_size), &limits)?;
        let base = self.emitter.base_pixel_size();
        let center = geometry.center();
        Ok(AnchorScan {
            scale: (geometry.pixel_size / base.0, geometry.pixel_size / base.1),
            resolution: geometry.repetition,
            translation: to_translation(center, base),
            pixel_size: geometry.pixel_size,
            center,
        })
    }

    fn scan_duration(&self, scan: &AnchorScan) -> Duration {
        let pixels = scan.resolution.0 as f64 * scan.resolution.1 as f64;
        Duration::from_secs_f64(pixels * self.dwell_time)
    }

    fn steps_per_period(&self, step: Duration) -> u64 {
        if step.is_zero() {
            return 1;
        }
        ((self.period.as_secs_f64() / step.as_secs_f64()).floor() as u64).max(1)
    }

    /// Scan the anchor region once, leaving the emitter as it was.
    async fn scan_anchor(&self) -> Result<Array2<f64>> {
        let scan = self.plan_scan()?;
        let params = self.emitter.parameters();
        let touched = [names::SCALE, names::RESOLUTION, names::TRANSLATION, names::DWELL_TIME];
        let mut previous: Vec<(&str, Value)> = Vec::with_capacity(touched.len());
        for name in touched {
            let param = params
                .get(name)
                .ok_or_else(|| anyhow!("Emitter '{}' has no '{}'", self.emitter.name(), name))?;
            previous.push((name, param.get_json()?));
        }

        let flow = self.detector.data_flow();
        let previous_mode = flow.trigger_mode();
        let switch_mode = !matches!(previous_mode, TriggerMode::Software);

        let result = async {
            for (name, value) in [
                (names::SCALE, serde_json::to_value(scan.scale)?),
                (names::RESOLUTION, serde_json::to_value(scan.resolution)?),
                (names::TRANSLATION, serde_json::to_value(scan.translation)?),
                (names::DWELL_TIME, serde_json::to_value(self.dwell_time)?),
            ] {
                if let Some(param) = params.get(name) {
                    param.set_json(value)?;
                }
            }
            if switch_mode {
                flow.synchronize_on(TriggerMode::Software).await?;
            }

            let mut channel = DetectorChannel::new("anchor", flow.clone());
            channel.subscribe().await?;
            flow.trigger().await?;
            let timeout = self.scan_duration(&scan).mul_f64(3.0) + SYNC_TIMEOUT_MARGIN;
            let frame = channel.recv_timeout(timeout, &CancellationToken::new()).await;
            channel.unsubscribe().await?;
            let frame = frame?.ok_or_else(|| anyhow!("Anchor scan timed out after {:?}", timeout))?;
            frame
                .data
                .into_dimensionality::<Ix2>()
                .context("Anchor image is not 2-D")
        }
        .await;

        if switch_mode {
            flow.synchronize_on(previous_mode).await?;
        }
        for (name, value) in previous {
            if let Some(param) = params.get(name) {
                param.set_json(value)?;
            }
        }
        result
    }
}

#[async_trait]
impl Leech for AnchorDriftCorrector {
    fn name(&self) -> &str {
        "anchor drift corrector"
    }

    fn estimate_time(&self, step: Duration, shape: (usize, usize)) -> Duration {
        let Ok(scan) = self.plan_scan() else {
            return Duration::ZERO;
        };
        let steps = (shape.0 * shape.1) as u64;
        let checkpoints = steps / self.steps_per_period(step) + 1;
        self.scan_duration(&scan) * checkpoints as u32
    }

    async fn start(&self, step: Duration, shape: (usize, usize)) -> Result<Option<u64>> {
        *self.state.lock() = AnchorState::default();
        let started = chrono::Utc::now();
        let image = self.scan_anchor().await.context("Reference anchor scan failed")?;
        let mut state = self.state.lock();
        state.reference = Some(image.clone());
        state.images.push(image);
        state.first_date = Some(started);
        let steps = self.steps_per_period(step);
        state.steps = steps;
        drop(state);

        info!(grid = ?shape, every = steps, "Drift correction started");
        Ok(Some(steps))
    }

    async fn next(&self, _live: &LiveStore) -> Result<u64> {
        let image = self.scan_anchor().await?;
        let reference = self
            .state
            .lock()
            .reference
            .clone()
            .ok_or_else(|| anyhow!("No reference anchor image"))?;
        let scan = self.plan_scan()?;
        let (sx, sy) = phase_correlation(&reference, &image)?;
        let drift = (-sx * scan.scale.0, -sy * scan.scale.1);

        let mut state = self.state.lock();
        state.drift = drift;
        state.images.push(image);
        debug!(shift = ?(sx, sy), drift = ?drift, "Anchor drift measured");
        Ok(state.steps)
    }

    async fn complete(&self, _results: &[DataArray]) -> Result<Vec<DataArray>> {
        let state = self.state.lock();
        let Some(first) = state.images.first() else {
            return Ok(Vec::new());
        };
        if state.images.iter().any(|i| i.dim() != first.dim()) {
            return Err(anyhow!("Anchor images changed shape"));
        }
        let (h, w) = first.dim();
        let mut stack = Array3::<f64>::zeros((state.images.len(), h, w));
        for (mut slot, image) in stack.axis_iter_mut(Axis(0)).zip(&state.images) {
            slot.assign(image);
        }
        let scan = self.plan_scan()?;
        let metadata = Metadata {
            description: Some("Anchor region".into()),
            detector: Some(self.detector.name().to_string()),
            acquisition_date: state.first_date,
            position: Some(scan.center),
            pixel_size: Some((scan.pixel_size, scan.pixel_size)),
            dwell_time: Some(self.dwell_time),
            dims: Some("TYX".into()),
            ..Default::default()
        };
        Ok(vec![DataArray::new(stack.into_dyn(), metadata)])
    }

    fn drift_vector(&self) -> Option<(f64, f64)> {
        Some(self.state.lock().drift)
    }
}

/// Shift `(x, y)` in pixels such that `image(p) ≈ reference(p - shift)`,
/// with sub-pixel refinement.
pub fn phase_correlation(reference: &Array2<f64>, image: &Array2<f64>) -> Result<(f64, f64)> {
    if reference.dim() != image.dim() {
        return Err(anyhow!(
            "Cannot correlate images of shapes {:?} and {:?}",
            reference.dim(),
            image.dim()
        ));
    }
    let (h, w) = reference.dim();
    if h < 2 || w < 2 {
        return Err(anyhow!("Anchor image too small ({}x{})", w, h));
    }

    let mut planner = FftPlanner::<f64>::new();
    let f_ref = fft2(&prepare(reference), &mut planner, false);
    let f_img = fft2(&prepare(image), &mut planner, false);

    let cross = ndarray::Zip::from(&f_img).and(&f_ref).map_collect(|a, b| {
        let r = a * b.conj();
        let norm = r.norm();
        if norm > f64::EPSILON {
            r / norm
        } else {
            Complex64::new(0.0, 0.0)
        }
    });
    let corr = fft2(&cross, &mut planner, true).mapv(|c| c.re);

    let mut peak = (0, 0);
    let mut best = f64::NEG_INFINITY;
    for ((y, x), &v) in corr.indexed_iter() {
        if v > best {
            best = v;
            peak = (y, x);
        }
    }
    let (py, px) = peak;
    let at = |y: isize, x: isize| corr[[y.rem_euclid(h as isize) as usize, x.rem_euclid(w as isize) as usize]];
    let refine = |minus: f64, center: f64, plus: f64| {
        let denom = minus - 2.0 * center + plus;
        if denom.abs() > f64::EPSILON {
            (0.5 * (minus - plus) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        }
    };
    let (iy, ix) = (py as isize, px as isize);
    let dx = refine(at(iy, ix - 1), best, at(iy, ix + 1));
    let dy = refine(at(iy - 1, ix), best, at(iy + 1, ix));

    let wrap = |p: usize, n: usize| if p > n / 2 { p as f64 - n as f64 } else { p as f64 };
    Ok((wrap(px, w) + dx, wrap(py, h) + dy))
}

/// Mean-subtracted, Hann-windowed complex copy.
fn prepare(image: &Array2<f64>) -> Array2<Complex64> {
    let (h, w) = image.dim();
    let mean = image.mean().unwrap_or(0.0);
    let hann = |i: usize, n: usize| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / (n - 1) as f64).cos();
    Array2::from_shape_fn((h, w), |(y, x)| {
        Complex64::new((image[[y, x]] - mean) * hann(y, h) * hann(x, w), 0.0)
    })
}

/// 2-D FFT: rows then columns.
fn fft2(input: &Array2<Complex64>, planner: &mut FftPlanner<f64>, inverse: bool) -> Array2<Complex64> {
    let (h, w) = input.dim();
    let mut out = input.clone();
    let (row_fft, col_fft) = if inverse {
        (planner.plan_fft_inverse(w), planner.plan_fft_inverse(h))
    } else {
        (planner.plan_fft_forward(w), planner.plan_fft_forward(h))
    };
    let mut buffer = Vec::with_capacity(h.max(w));
    for mut row in out.rows_mut() {
        buffer.clear();
        buffer.extend(row.iter().copied());
        row_fft.process(&mut buffer);
        row.iter_mut().zip(&buffer).for_each(|(d, s)| *d = *s);
    }
    for mut col in out.columns_mut() {
        buffer.clear();
        buffer.extend(col.iter().copied());
        col_fft.process(&mut buffer);
        col.iter_mut().zip(&buffer).for_each(|(d, s)| *d = *s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs(h: usize, w: usize, shift: (f64, f64)) -> Array2<f64> {
        let spots = [(10.0, 12.0, 3.0), (30.0, 20.0, 4.0), (22.0, 40.0, 2.5), (45.0, 45.0, 5.0)];
        Array2::from_shape_fn((h, w), |(y, x)| {
            spots
                .iter()
                .map(|(sx, sy, r)| {
                    let dx = x as f64 - sx - shift.0;
                    let dy = y as f64 - sy - shift.1;
                    (-(dx * dx + dy * dy) / (2.0 * r * r)).exp()
                })
                .sum()
        })
    }

    #[test]
    fn test_integer_shift() {
        let reference = blobs(64, 64, (0.0, 0.0));
        let moved = blobs(64, 64, (3.0, -5.0));
        let (sx, sy) = phase_correlation(&reference, &moved).unwrap();
        assert!((sx - 3.0).abs() < 0.3, "sx = {}", sx);
        assert!((sy + 5.0).abs() < 0.3, "sy = {}", sy);
    }

    #[test]
    fn test_no_shift() {
        let reference = blobs(32, 48, (0.0, 0.0));
        let (sx, sy) = phase_correlation(&reference, &reference).unwrap();
        assert!(sx.abs() < 0.1 && sy.abs() < 0.1);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array2::<f64>::zeros((8, 8));
        let b = Array2::<f64>::zeros((8, 9));
        assert!(phase_correlation(&a, &b).is_err());
    }
}
