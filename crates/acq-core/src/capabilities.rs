//! Device Capabilities
//!
//! Small, focused traits implemented by the devices taking part in a
//! synchronized acquisition:
//!
//! - A scanning emitter implements [`Scanner`] (and optionally exposes a
//!   per-pixel [`PixelEvent`] for hardware synchronization)
//! - A detector implements [`Detector`] and hands out a push-based
//!   [`DataFlow`]
//! - Stages and focusers implement [`Movable`]
//! - Polarizers, filter wheels and the like implement [`AuxiliaryAxis`]
//!
//! Optional behaviour is discovered through `Option` returning methods and
//! parameter presence, never by probing at every access: a [`crate::stream::Stream`]
//! resolves all of it once into [`crate::stream::StreamCapabilities`].
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async where it talks to hardware (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Keeps settings in a [`ParameterSet`] so they can be snapshotted and
//!   restored without knowing their types

use crate::data::DataArray;
use crate::parameter::ParameterSet;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Parameter names
// =============================================================================

/// Well-known parameter names used by the acquisition engine.
pub mod names {
    /// Scanner scale `(f64, f64)`: pixel size as a multiple of the base pixel size.
    pub const SCALE: &str = "scale";
    /// Scanner resolution `(u32, u32)`: pixels scanned per frame.
    pub const RESOLUTION: &str = "resolution";
    /// Scanner translation `(f64, f64)`: shift from field center, in base pixels.
    pub const TRANSLATION: &str = "translation";
    /// Scanner dwell time `f64` (s).
    pub const DWELL_TIME: &str = "dwell_time";
    /// Scanner blanker `Option<bool>`: `None` is automatic.
    pub const BLANKER: &str = "blanker";
    /// Scanner per-pixel hardware event output `bool`.
    pub const PIXEL_TRIGGER: &str = "pixel_trigger";
    /// Detector exposure time `f64` (s).
    pub const EXPOSURE_TIME: &str = "exposure_time";
    /// Detector binning `(u32, u32)`.
    pub const BINNING: &str = "binning";
}

// =============================================================================
// Hardware pixel event
// =============================================================================

/// One tick of the scanner's per-pixel event line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelTick {
    /// Pixel index within the current raster (row-major).
    pub index: u64,
}

/// Per-pixel hardware event exposed by a scanner.
///
/// Detectors synchronized on it capture one frame per tick.
#[derive(Debug, Clone)]
pub struct PixelEvent {
    name: String,
    sender: broadcast::Sender<PixelTick>,
}

impl PixelEvent {
    /// Create a new event line.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
        }
    }

    /// Event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Listen to the event line.
    pub fn subscribe(&self) -> broadcast::Receiver<PixelTick> {
        self.sender.subscribe()
    }

    /// Fire one tick. Returns the number of listeners reached.
    pub fn notify(&self, tick: PixelTick) -> usize {
        self.sender.send(tick).unwrap_or(0)
    }

    /// Whether two handles refer to the same event line.
    pub fn same_line(&self, other: &PixelEvent) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

/// What starts a detector acquisition.
#[derive(Debug, Clone, Default)]
pub enum TriggerMode {
    /// Free running while subscribed.
    #[default]
    Continuous,
    /// One frame per [`DataFlow::trigger`] call.
    Software,
    /// One frame per tick of a hardware event.
    Hardware(PixelEvent),
}

impl TriggerMode {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            TriggerMode::Continuous => "continuous",
            TriggerMode::Software => "software",
            TriggerMode::Hardware(_) => "hardware",
        }
    }
}

/// Trigger modes a data flow accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerSupport {
    /// Accepts [`TriggerMode::Software`].
    pub software: bool,
    /// Accepts [`TriggerMode::Hardware`].
    pub hardware: bool,
}

// =============================================================================
// Data flow
// =============================================================================

/// Handle returned when subscribing to a data flow, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverHandle(pub u64);

impl ObserverHandle {
    /// Create a new observer handle with the given ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the internal ID (for debugging/logging).
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Receiver of detector data.
///
/// # Contract
///
/// - `on_data()` MUST NOT block: it may run on a driver-owned task
/// - To persist data, implementations move it into their own queue
pub trait DataObserver: Send + Sync {
    /// Called for every array produced while subscribed.
    fn on_data(&self, data: DataArray);

    /// Observer name for debugging.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Push-based source of detector data.
///
/// Frames are produced only while at least one observer is subscribed. In
/// [`TriggerMode::Software`] each [`DataFlow::trigger`] produces one array;
/// in [`TriggerMode::Hardware`] each event tick produces one array.
#[async_trait]
pub trait DataFlow: Send + Sync {
    /// Data flow name (usually the detector name).
    fn name(&self) -> &str;

    /// Register an observer.
    async fn subscribe(&self, observer: Arc<dyn DataObserver>) -> Result<ObserverHandle>;

    /// Remove an observer. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: ObserverHandle) -> Result<()>;

    /// Number of subscribed observers.
    fn observer_count(&self) -> usize;

    /// Trigger modes this flow accepts.
    fn trigger_support(&self) -> TriggerSupport;

    /// Current trigger mode.
    fn trigger_mode(&self) -> TriggerMode;

    /// Change the trigger mode.
    ///
    /// # Errors
    /// Returns Err if the mode is not supported.
    async fn synchronize_on(&self, mode: TriggerMode) -> Result<()>;

    /// Software trigger: request one acquisition.
    ///
    /// # Errors
    /// Returns Err if the flow is not in software mode.
    async fn trigger(&self) -> Result<()>;
}

// =============================================================================
// Parameterized
// =============================================================================

/// Devices exposing their settings as parameters.
pub trait Parameterized: Send + Sync {
    /// All parameters of the device.
    fn parameters(&self) -> &ParameterSet;
}

// =============================================================================
// Scanner
// =============================================================================

/// Capability: Scanning emitter
///
/// Directs the beam to positions within its field. Positions are expressed as
/// a translation from the field center in base pixels; physical positions are
/// `translation × base pixel size` with the vertical axis inverted.
///
/// Required parameters (see [`names`]): `scale`, `resolution`,
/// `translation`, `dwell_time`. Optional: `blanker`, `pixel_trigger`.
pub trait Scanner: Parameterized {
    /// Device name.
    fn name(&self) -> &str;

    /// Maximum resolution at scale 1 (the full field, in base pixels).
    fn shape(&self) -> (u32, u32);

    /// Physical size of one base pixel (m).
    fn base_pixel_size(&self) -> (f64, f64);

    /// Accepted scale range (applied to both axes).
    fn scale_range(&self) -> (f64, f64);

    /// Physical size of the whole scan field (m).
    fn field_of_view(&self) -> (f64, f64) {
        let (w, h) = self.shape();
        let (px, py) = self.base_pixel_size();
        (w as f64 * px, h as f64 * py)
    }

    /// Per-pixel hardware event, if the scanner has one.
    fn pixel_event(&self) -> Option<PixelEvent> {
        None
    }
}

// =============================================================================
// Detector
// =============================================================================

/// How a detector produces its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorDrive {
    /// Acquires while the scanner rasters (one value per scanned pixel).
    Scan,
    /// Acquires for its own exposure time (camera, spectrometer, counter).
    Exposure,
}

/// Capability: Detector
pub trait Detector: Parameterized {
    /// Device name.
    fn name(&self) -> &str;

    /// Data flow delivering the measurements.
    fn data_flow(&self) -> Arc<dyn DataFlow>;

    /// How frames are produced.
    fn drive(&self) -> DetectorDrive;

    /// Longest single exposure the hardware accepts, if it has an exposure.
    fn max_exposure(&self) -> Option<f64> {
        None
    }

    /// Extra time after the exposure before the frame is delivered (s).
    fn readout_time(&self) -> f64 {
        0.0
    }
}

// =============================================================================
// Motion
// =============================================================================

/// Capability: Linear or rotary motion
///
/// # Contract
/// - `move_abs` may return before the move completes
/// - `wait_settled` returns once the axis is at rest
#[async_trait]
pub trait Movable: Send + Sync {
    /// Axis name.
    fn name(&self) -> &str;

    /// Move to absolute position.
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Current position.
    async fn position(&self) -> Result<f64>;

    /// Wait for the motion to settle.
    async fn wait_settled(&self) -> Result<()>;

    /// Travel range `(min, max)`.
    fn limits(&self) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Stop motion immediately.
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Discrete auxiliary positioner (polarizer, filter wheel...)
#[async_trait]
pub trait AuxiliaryAxis: Send + Sync {
    /// Axis name.
    fn name(&self) -> &str;

    /// Named positions the axis accepts.
    fn choices(&self) -> Vec<String>;

    /// Move to a named position and wait for it to be reached.
    async fn move_to(&self, position: &str) -> Result<()>;

    /// Current named position.
    async fn position(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_event_reaches_listeners() {
        let event = PixelEvent::new("pixel", 16);
        let mut a = event.subscribe();
        let mut b = event.clone().subscribe();
        assert_eq!(event.notify(PixelTick { index: 3 }), 2);
        assert_eq!(a.try_recv().unwrap().index, 3);
        assert_eq!(b.try_recv().unwrap().index, 3);
        assert!(event.same_line(&event.clone()));
        assert!(!event.same_line(&PixelEvent::new("other", 1)));
    }

    #[test]
    fn test_notify_without_listener() {
        let event = PixelEvent::new("pixel", 4);
        assert_eq!(event.notify(PixelTick { index: 0 }), 0);
    }
}
