//! Mock exposure-driven detector: point counter, spectrometer or camera.
//!
//! Every acquisition waits for the full exposure time (plus readout in
//! realistic mode), then produces a frame whose values come from a
//! [`ValueSource`]. The default source reads the specimen under the beam; tests
//! use [`ValueSource::Sequence`] so each frame carries its own index.
//!
//! The `exposure_time` parameter silently clamps to the maximum exposure, the
//! way many cameras do; the acquisition engine synthesizes longer exposures by
//! integration.

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::flow::{FrameSource, MockDataFlow};
use crate::mock_scanner::BeamProbe;
use crate::pattern::element_value;
use acq_core::capabilities::{
    names, DataFlow, Detector, DetectorDrive, Parameterized, PixelTick, TriggerSupport,
};
use acq_core::data::{DataArray, Metadata};
use acq_core::parameter::{Parameter, ParameterSet};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shape of the frames a detector produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// One scalar per frame
    Point,
    /// One spectrum of `n` channels per frame
    Spectrum(usize),
    /// One `h × w` image per frame
    Image(usize, usize),
}

impl DetectorKind {
    fn shape(&self) -> Vec<usize> {
        match *self {
            DetectorKind::Point => vec![1, 1],
            DetectorKind::Spectrum(n) => vec![n.max(1)],
            DetectorKind::Image(h, w) => vec![h.max(1), w.max(1)],
        }
    }

    fn dims(&self) -> &'static str {
        match self {
            DetectorKind::Point => "YX",
            DetectorKind::Spectrum(_) => "C",
            DetectorKind::Image(_, _) => "YX",
        }
    }
}

/// Where frame values come from.
#[derive(Clone)]
pub enum ValueSource {
    /// Specimen signal under the beam scaled by the exposure (needs a beam probe)
    Specimen,
    /// Frame index (0, 1, 2, ...) counted over every acquired frame
    Sequence,
    /// Constant value
    Constant(f64),
}

/// Configuration for [`MockDetector`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockDetectorConfig {
    /// Frame shape
    pub kind: DetectorKind,
    /// Initial exposure in s (default: 10 ms)
    pub exposure_time: f64,
    /// Longest single exposure in s (default: 1 s)
    pub max_exposure: f64,
    /// Accept the scanner's per-pixel event as trigger
    pub hardware_trigger: bool,
}

impl Default for MockDetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Point,
            exposure_time: 0.01,
            max_exposure: 1.0,
            hardware_trigger: false,
        }
    }
}

struct ExposureSource {
    detector: String,
    kind: DetectorKind,
    exposure: Parameter<f64>,
    values: ValueSource,
    probe: Option<BeamProbe>,
    counter: AtomicU64,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    rng: MockRng,
}

#[async_trait]
impl FrameSource for ExposureSource {
    async fn acquire(&self, _tick: Option<PixelTick>) -> Result<Option<DataArray>> {
        self.errors
            .check_operation(&self.detector, "acquire")
            .map_err(anyhow::Error::from)?;

        let exposure = self.exposure.get();
        let started = chrono::Utc::now();
        let position = self.probe.as_ref().map(|p| p.position());
        let signal = self.probe.as_ref().map(|p| p.signal()).unwrap_or(0.0);

        if !self.errors.early_frame() {
            tokio::time::sleep(Duration::from_secs_f64(exposure) + self.timing.readout(self.mode)).await;
        }

        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        if self.errors.drop_frame() {
            return Ok(None);
        }

        let base = match &self.values {
            ValueSource::Specimen => signal * exposure * 100.0 + self.rng.noise(1.0),
            ValueSource::Sequence => index as f64,
            ValueSource::Constant(v) => *v,
        };
        let shape = self.kind.shape();
        let len: usize = shape.iter().product();
        let data = ArrayD::from_shape_fn(IxDyn(&shape), |ix| {
            let flat = if shape.len() == 2 { ix[0] * shape[1] + ix[1] } else { ix[0] };
            element_value(base, flat, len)
        });

        let metadata = Metadata {
            detector: Some(self.detector.clone()),
            acquisition_date: Some(started),
            position,
            exposure_time: Some(exposure),
            dims: Some(self.kind.dims().to_string()),
            ..Default::default()
        };
        Ok(Some(DataArray::new(data, metadata)))
    }
}

/// Simulated exposure-driven detector.
pub struct MockDetector {
    name: String,
    max_exposure: f64,
    flow: Arc<MockDataFlow>,
    params: ParameterSet,
}

impl MockDetector {
    /// Builder for a detector named `name`.
    pub fn builder(name: impl Into<String>) -> MockDetectorBuilder {
        MockDetectorBuilder {
            name: name.into(),
            config: MockDetectorConfig::default(),
            values: ValueSource::Specimen,
            probe: None,
            mode: MockMode::Instant,
            errors: ErrorConfig::none(),
        }
    }

    /// Detector from configuration.
    pub fn with_config(name: impl Into<String>, config: MockDetectorConfig, probe: Option<BeamProbe>) -> Self {
        let mut builder = Self::builder(name);
        builder.config = config;
        builder.probe = probe;
        builder.build()
    }

    /// Current exposure time (s).
    pub fn exposure(&self) -> Result<f64> {
        self.params
            .get_typed::<f64>(names::EXPOSURE_TIME)
            .map(|p| p.get())
            .ok_or_else(|| anyhow!("No exposure parameter"))
    }
}

impl Parameterized for MockDetector {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

impl Detector for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_flow(&self) -> Arc<dyn DataFlow> {
        self.flow.clone()
    }

    fn drive(&self) -> DetectorDrive {
        DetectorDrive::Exposure
    }

    fn max_exposure(&self) -> Option<f64> {
        Some(self.max_exposure)
    }
}

/// Builder for [`MockDetector`]
pub struct MockDetectorBuilder {
    name: String,
    config: MockDetectorConfig,
    values: ValueSource,
    probe: Option<BeamProbe>,
    mode: MockMode,
    errors: ErrorConfig,
}

impl MockDetectorBuilder {
    /// Frame shape.
    pub fn kind(mut self, kind: DetectorKind) -> Self {
        self.config.kind = kind;
        self
    }

    /// Initial exposure (s).
    pub fn exposure_time(mut self, seconds: f64) -> Self {
        self.config.exposure_time = seconds;
        self
    }

    /// Longest single exposure (s).
    pub fn max_exposure(mut self, seconds: f64) -> Self {
        self.config.max_exposure = seconds;
        self
    }

    /// Accept the scanner's pixel event as trigger.
    pub fn hardware_trigger(mut self, enabled: bool) -> Self {
        self.config.hardware_trigger = enabled;
        self
    }

    /// Where frame values come from.
    pub fn values(mut self, values: ValueSource) -> Self {
        self.values = values;
        self
    }

    /// Beam the detector looks at.
    pub fn probe(mut self, probe: BeamProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Operational mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Error injection.
    pub fn error_config(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Build the detector.
    pub fn build(self) -> MockDetector {
        let max = self.config.max_exposure.max(1e-6);
        let exposure = Parameter::new(names::EXPOSURE_TIME, self.config.exposure_time.clamp(1e-6, max))
            .with_description("Exposure time of one frame")
            .with_unit("s")
            .with_validator(|v: &f64| {
                if v.is_finite() && *v > 0.0 {
                    Ok(())
                } else {
                    Err(anyhow!("Exposure must be positive, got {}", v))
                }
            })
            .connect_to_hardware_write(move |v: f64| Ok(v.min(max)));

        let mut params = ParameterSet::new();
        params.register(exposure.clone());
        if let DetectorKind::Image(_, _) = self.config.kind {
            params.register(
                Parameter::new(names::BINNING, (1u32, 1u32)).with_description("Pixel binning"),
            );
        }

        let source = Arc::new(ExposureSource {
            detector: self.name.clone(),
            kind: self.config.kind,
            exposure,
            values: self.values,
            probe: self.probe,
            counter: AtomicU64::new(0),
            mode: self.mode,
            timing: TimingConfig::detector(),
            errors: self.errors,
            rng: MockRng::new(Some(11)),
        });
        let flow = Arc::new(MockDataFlow::new(
            self.name.clone(),
            source,
            TriggerSupport {
                software: true,
                hardware: self.config.hardware_trigger,
            },
        ));
        MockDetector {
            name: self.name,
            max_exposure: max,
            flow,
            params,
        }
    }
}
