//! Mock scanning emitter and the scan-driven detector that goes with it.
//!
//! The scanner keeps its settings in [`Parameter`]s whose hardware writers
//! clamp the way a real scan generator does:
//!
//! - `scale` to the accepted scale range
//! - `resolution` to what fits in the field at the current scale
//! - `translation` so the scanned area stays in the field
//!
//! The scan-driven detector ([`MockScanDetector`]) rasters the current
//! scanner settings on every software trigger, taking `dwell × pixels`, and
//! fires the scanner's pixel event for each pixel when `pixel_trigger` is on.

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::flow::{FrameSource, MockDataFlow};
use crate::pattern::Specimen;
use acq_core::capabilities::{
    names, DataFlow, Detector, DetectorDrive, Parameterized, PixelEvent, PixelTick, Scanner,
    TriggerSupport,
};
use acq_core::data::{DataArray, Metadata};
use acq_core::parameter::{Parameter, ParameterSet};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`MockScanner`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockScannerConfig {
    /// Full field in base pixels (default: 512×512)
    pub shape: (u32, u32),
    /// Physical size of one base pixel in m (default: 10 nm)
    pub base_pixel_size: (f64, f64),
    /// Accepted scale range (default: 1 to 512)
    pub scale_range: (f64, f64),
    /// Initial dwell time in s (default: 10 µs)
    pub dwell_time: f64,
    /// Whether the scanner has a per-pixel hardware event output
    pub pixel_event: bool,
    /// Simulated specimen drift per raster, in base pixels
    pub drift_per_scan: (f64, f64),
}

impl Default for MockScannerConfig {
    fn default() -> Self {
        Self {
            shape: (512, 512),
            base_pixel_size: (1e-8, 1e-8),
            scale_range: (1.0, 512.0),
            dwell_time: 1e-5,
            pixel_event: false,
            drift_per_scan: (0.0, 0.0),
        }
    }
}

// =============================================================================
// Shared beam state
// =============================================================================

#[derive(Debug, Clone)]
struct BeamState {
    scale: (f64, f64),
    resolution: (u32, u32),
    translation: (f64, f64),
    dwell_time: f64,
    pixel_trigger: bool,
    /// Accumulated specimen drift, in base pixels
    drift: (f64, f64),
    /// Every translation applied, in order
    history: Vec<(f64, f64)>,
}

/// Read-only view of where the beam is, shared with the detectors.
#[derive(Clone)]
pub struct BeamProbe {
    state: Arc<Mutex<BeamState>>,
    base: (f64, f64),
    specimen: Specimen,
}

impl BeamProbe {
    /// Nominal physical beam position (m, Y up).
    pub fn position(&self) -> (f64, f64) {
        let s = self.state.lock();
        (s.translation.0 * self.base.0, -s.translation.1 * self.base.1)
    }

    /// Physical position on the (drifting) specimen.
    pub fn specimen_position(&self) -> (f64, f64) {
        let s = self.state.lock();
        (
            (s.translation.0 + s.drift.0) * self.base.0,
            -(s.translation.1 + s.drift.1) * self.base.1,
        )
    }

    /// Specimen signal under the beam.
    pub fn signal(&self) -> f64 {
        let (x, y) = self.specimen_position();
        self.specimen.intensity(x, y)
    }
}

// =============================================================================
// MockScanner
// =============================================================================

/// Simulated scanning emitter.
///
/// # Example
///
/// ```rust,ignore
/// let scanner = Arc::new(MockScanner::builder().pixel_event(true).build());
/// let se = Arc::new(MockScanDetector::new("se", scanner.clone()));
/// ```
pub struct MockScanner {
    name: String,
    shape: (u32, u32),
    base: (f64, f64),
    scale_range: (f64, f64),
    state: Arc<Mutex<BeamState>>,
    drift_per_scan: (f64, f64),
    specimen: Specimen,
    pixel_event: Option<PixelEvent>,
    mode: MockMode,
    timing: TimingConfig,
    params: ParameterSet,
}

impl MockScanner {
    /// Default scanner.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Scanner from configuration.
    pub fn with_config(config: MockScannerConfig) -> Self {
        MockScannerBuilder {
            config,
            ..MockScannerBuilder::default()
        }
        .build()
    }

    /// Builder with defaults.
    pub fn builder() -> MockScannerBuilder {
        MockScannerBuilder::default()
    }

    /// Shared beam view for detectors.
    pub fn probe(&self) -> BeamProbe {
        BeamProbe {
            state: self.state.clone(),
            base: self.base,
            specimen: self.specimen,
        }
    }

    /// Every translation written so far (base pixels).
    pub fn translation_history(&self) -> Vec<(f64, f64)> {
        self.state.lock().history.clone()
    }

    /// Accumulated simulated specimen drift (base pixels).
    pub fn drift(&self) -> (f64, f64) {
        self.state.lock().drift
    }

    fn raster_settings(&self) -> BeamState {
        self.state.lock().clone()
    }

    fn advance_drift(&self) {
        let mut s = self.state.lock();
        s.drift.0 += self.drift_per_scan.0;
        s.drift.1 += self.drift_per_scan.1;
    }

    fn set_translation_now(&self, t: (f64, f64)) {
        self.state.lock().translation = t;
    }
}

impl Default for MockScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameterized for MockScanner {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

impl Scanner for MockScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> (u32, u32) {
        self.shape
    }

    fn base_pixel_size(&self) -> (f64, f64) {
        self.base
    }

    fn scale_range(&self) -> (f64, f64) {
        self.scale_range
    }

    fn pixel_event(&self) -> Option<PixelEvent> {
        self.pixel_event.clone()
    }
}

/// Builder for [`MockScanner`]
#[derive(Default)]
pub struct MockScannerBuilder {
    config: MockScannerConfig,
    name: Option<String>,
    mode: MockMode,
    specimen: Specimen,
}

impl MockScannerBuilder {
    /// Device name (default: "ebeam").
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Full field in base pixels.
    pub fn shape(mut self, w: u32, h: u32) -> Self {
        self.config.shape = (w, h);
        self
    }

    /// Base pixel size (m).
    pub fn base_pixel_size(mut self, px: f64, py: f64) -> Self {
        self.config.base_pixel_size = (px, py);
        self
    }

    /// Accepted scale range.
    pub fn scale_range(mut self, min: f64, max: f64) -> Self {
        self.config.scale_range = (min, max);
        self
    }

    /// Initial dwell time (s).
    pub fn dwell_time(mut self, dwell: f64) -> Self {
        self.config.dwell_time = dwell;
        self
    }

    /// Expose a per-pixel hardware event.
    pub fn pixel_event(mut self, enabled: bool) -> Self {
        self.config.pixel_event = enabled;
        self
    }

    /// Simulated specimen drift per raster (base pixels).
    pub fn drift_per_scan(mut self, dx: f64, dy: f64) -> Self {
        self.config.drift_per_scan = (dx, dy);
        self
    }

    /// Operational mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Specimen under the beam.
    pub fn specimen(mut self, specimen: Specimen) -> Self {
        self.specimen = specimen;
        self
    }

    /// Build the scanner.
    pub fn build(self) -> MockScanner {
        let cfg = self.config;
        let (w, h) = (cfg.shape.0.max(1), cfg.shape.1.max(1));
        let (smin, smax) = cfg.scale_range;
        let state = Arc::new(Mutex::new(BeamState {
            scale: (smin.max(1.0).min(smax), smin.max(1.0).min(smax)),
            resolution: (w.min(256), h.min(256)),
            translation: (0.0, 0.0),
            dwell_time: cfg.dwell_time,
            pixel_trigger: false,
            drift: (0.0, 0.0),
            history: Vec::new(),
        }));
        let initial = state.lock().clone();

        let mut params = ParameterSet::new();

        let st = state.clone();
        params.register(
            Parameter::new(names::SCALE, initial.scale)
                .with_description("Pixel size as a multiple of the base pixel size")
                .with_component_bounds(smin, smax)
                .connect_to_hardware_write(move |s: (f64, f64)| {
                    let clamped = (s.0.clamp(smin, smax), s.1.clamp(smin, smax));
                    st.lock().scale = clamped;
                    Ok(clamped)
                }),
        );

        let st = state.clone();
        params.register(
            Parameter::new(names::RESOLUTION, initial.resolution)
                .with_description("Pixels scanned per frame")
                .with_unit("px")
                .connect_to_hardware_write(move |r: (u32, u32)| {
                    let mut s = st.lock();
                    let max_x = ((w as f64 / s.scale.0).floor() as u32).max(1);
                    let max_y = ((h as f64 / s.scale.1).floor() as u32).max(1);
                    let clamped = (r.0.clamp(1, max_x), r.1.clamp(1, max_y));
                    s.resolution = clamped;
                    Ok(clamped)
                }),
        );

        let st = state.clone();
        params.register(
            Parameter::new(names::TRANSLATION, initial.translation)
                .with_description("Shift of the scanned area from the field center")
                .with_unit("px")
                .connect_to_hardware_write(move |t: (f64, f64)| {
                    let mut s = st.lock();
                    let lim_x = ((w as f64 - s.resolution.0 as f64 * s.scale.0) / 2.0).max(0.0);
                    let lim_y = ((h as f64 - s.resolution.1 as f64 * s.scale.1) / 2.0).max(0.0);
                    let clamped = (t.0.clamp(-lim_x, lim_x), t.1.clamp(-lim_y, lim_y));
                    s.translation = clamped;
                    s.history.push(clamped);
                    Ok(clamped)
                }),
        );

        let st = state.clone();
        params.register(
            Parameter::new(names::DWELL_TIME, initial.dwell_time)
                .with_description("Time spent on each pixel")
                .with_unit("s")
                .with_range(1e-7, 1000.0)
                .connect_to_hardware_write(move |d: f64| {
                    st.lock().dwell_time = d;
                    Ok(d)
                }),
        );

        params.register(
            Parameter::new(names::BLANKER, Option::<bool>::None)
                .with_description("Beam blanker, null for automatic"),
        );

        let pixel_event = if cfg.pixel_event {
            let st = state.clone();
            params.register(
                Parameter::new(names::PIXEL_TRIGGER, false)
                    .with_description("Emit the per-pixel hardware event")
                    .connect_to_hardware_write(move |on: bool| {
                        st.lock().pixel_trigger = on;
                        Ok(on)
                    }),
            );
            Some(PixelEvent::new("pixel", 1 << 16))
        } else {
            None
        };

        MockScanner {
            name: self.name.unwrap_or_else(|| "ebeam".to_string()),
            shape: (w, h),
            base: cfg.base_pixel_size,
            scale_range: cfg.scale_range,
            state,
            drift_per_scan: cfg.drift_per_scan,
            specimen: self.specimen,
            pixel_event,
            mode: self.mode,
            timing: TimingConfig::scanner(),
            params,
        }
    }
}

// =============================================================================
// MockScanDetector - secondary electron style detector
// =============================================================================

struct RasterSource {
    detector: String,
    scanner: Arc<MockScanner>,
    errors: ErrorConfig,
    rng: MockRng,
    noise: f64,
}

#[async_trait]
impl FrameSource for RasterSource {
    async fn acquire(&self, _tick: Option<PixelTick>) -> Result<Option<DataArray>> {
        self.errors
            .check_operation(&self.detector, "scan")
            .map_err(anyhow::Error::from)?;

        let s = self.scanner.raster_settings();
        let (rx, ry) = (s.resolution.0 as usize, s.resolution.1 as usize);
        let npix = rx * ry;
        let dwell = Duration::from_secs_f64(s.dwell_time);
        let started = chrono::Utc::now();
        let probe = self.scanner.probe();

        tokio::time::sleep(self.scanner.timing.settling(self.scanner.mode)).await;

        let mut data = ArrayD::<f64>::zeros(IxDyn(&[ry, rx]));
        let center = s.translation;
        for (i, mut row) in data.outer_iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                let tx = center.0 + (j as f64 - (rx as f64 - 1.0) / 2.0) * s.scale.0;
                let ty = center.1 + (i as f64 - (ry as f64 - 1.0) / 2.0) * s.scale.1;
                let x = (tx + s.drift.0) * self.scanner.base.0;
                let y = -(ty + s.drift.1) * self.scanner.base.1;
                *v = probe.specimen.intensity(x, y) + self.rng.noise(self.noise);
            }
        }

        match (&self.scanner.pixel_event, s.pixel_trigger) {
            (Some(event), true) => {
                // Frame-clocked: one tick per pixel, the beam really visits them.
                for index in 0..npix {
                    let (i, j) = (index / rx, index % rx);
                    self.scanner.set_translation_now((
                        center.0 + (j as f64 - (rx as f64 - 1.0) / 2.0) * s.scale.0,
                        center.1 + (i as f64 - (ry as f64 - 1.0) / 2.0) * s.scale.1,
                    ));
                    event.notify(PixelTick { index: index as u64 });
                    tokio::time::sleep(dwell).await;
                }
                self.scanner.set_translation_now(center);
            }
            _ => tokio::time::sleep(dwell * npix as u32).await,
        }
        self.scanner.advance_drift();

        if self.errors.drop_frame() {
            return Ok(None);
        }
        debug!(detector = %self.detector, pixels = npix, "Raster complete");

        let metadata = Metadata {
            description: Some("Secondary electrons".into()),
            detector: Some(self.detector.clone()),
            acquisition_date: Some(started),
            position: Some((center.0 * self.scanner.base.0, -center.1 * self.scanner.base.1)),
            pixel_size: Some((s.scale.0 * self.scanner.base.0, s.scale.1 * self.scanner.base.1)),
            dwell_time: Some(s.dwell_time),
            dims: Some("YX".into()),
            ..Default::default()
        };
        Ok(Some(DataArray::new(data, metadata)))
    }
}

/// Detector producing one value per scanned pixel (e.g. secondary electrons).
pub struct MockScanDetector {
    name: String,
    flow: Arc<MockDataFlow>,
    params: ParameterSet,
}

impl MockScanDetector {
    /// Scan-driven detector on `scanner`.
    pub fn new(name: impl Into<String>, scanner: Arc<MockScanner>) -> Self {
        Self::with_errors(name, scanner, ErrorConfig::none())
    }

    /// Scan-driven detector with error injection.
    pub fn with_errors(name: impl Into<String>, scanner: Arc<MockScanner>, errors: ErrorConfig) -> Self {
        let name = name.into();
        let source = Arc::new(RasterSource {
            detector: name.clone(),
            scanner,
            errors,
            rng: MockRng::new(Some(7)),
            noise: 5.0,
        });
        let flow = Arc::new(MockDataFlow::new(
            name.clone(),
            source,
            TriggerSupport {
                software: true,
                hardware: false,
            },
        ));
        Self {
            name,
            flow,
            params: ParameterSet::new(),
        }
    }
}

impl Parameterized for MockScanDetector {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

impl Detector for MockScanDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_flow(&self) -> Arc<dyn DataFlow> {
        self.flow.clone()
    }

    fn drive(&self) -> DetectorDrive {
        DetectorDrive::Scan
    }
}

/// Parse a `"WxH"` string (used by configuration and the command line).
pub fn parse_pair(text: &str) -> Result<(u32, u32)> {
    let (a, b) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("Expected WxH, got '{}'", text))?;
    Ok((a.trim().parse()?, b.trim().parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::capabilities::{DataObserver, TriggerMode};
    use tokio::sync::mpsc;

    struct Collect(mpsc::UnboundedSender<DataArray>);
    impl DataObserver for Collect {
        fn on_data(&self, data: DataArray) {
            let _ = self.0.send(data);
        }
    }

    #[test]
    fn test_resolution_clamped_by_scale() {
        let scanner = MockScanner::builder().shape(100, 100).build();
        let scale: Parameter<(f64, f64)> = scanner.parameters().get_typed(names::SCALE).unwrap();
        let res: Parameter<(u32, u32)> = scanner.parameters().get_typed(names::RESOLUTION).unwrap();
        scale.set((10.0, 10.0)).unwrap();
        assert_eq!(res.set((50, 5)).unwrap(), (10, 5));
    }

    #[test]
    fn test_translation_clamped_and_recorded() {
        let scanner = MockScanner::builder().shape(100, 100).build();
        let params = scanner.parameters();
        params.get_typed::<(f64, f64)>(names::SCALE).unwrap().set((1.0, 1.0)).unwrap();
        params.get_typed::<(u32, u32)>(names::RESOLUTION).unwrap().set((1, 1)).unwrap();
        let t = params.get_typed::<(f64, f64)>(names::TRANSLATION).unwrap();
        assert_eq!(t.set((80.0, -3.0)).unwrap(), (49.5, -3.0));
        assert_eq!(scanner.translation_history(), vec![(49.5, -3.0)]);
    }

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("4x3").unwrap(), (4, 3));
        assert!(parse_pair("4,3").is_err());
    }

    #[tokio::test]
    async fn test_software_trigger_rasters_current_resolution() {
        let scanner = Arc::new(MockScanner::builder().dwell_time(1e-4).build());
        scanner
            .parameters()
            .get_typed::<(u32, u32)>(names::RESOLUTION)
            .unwrap()
            .set((4, 2))
            .unwrap();
        let se = MockScanDetector::new("se", scanner.clone());
        let flow = se.data_flow();
        flow.synchronize_on(TriggerMode::Software).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = flow.subscribe(Arc::new(Collect(tx))).await.unwrap();
        flow.trigger().await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.shape(), &[2, 4]);
        assert_eq!(frame.metadata.detector.as_deref(), Some("se"));
        flow.unsubscribe(handle).await.unwrap();
        assert_eq!(flow.observer_count(), 0);
    }
}
