//! Mock Hardware Drivers for synchronized acquisition
//!
//! Simulated devices for testing the acquisition engine without hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mock Drivers
//!
//! - [`MockScanner`] - Scanning emitter with clamping settings, optional
//!   per-pixel hardware event and simulated specimen drift
//! - [`MockScanDetector`] - Scan-driven detector (one value per scanned pixel)
//! - [`MockDetector`] - Exposure-driven point / spectrum / image detector
//! - [`MockStage`] - Motion axis for scan stages and focusers
//! - [`MockPolarizer`] - Discrete auxiliary axis
//!
//! # Timing
//!
//! Exposure and dwell waits are always simulated. [`MockMode::Realistic`]
//! adds readout, settling and communication delays. Failures are injected
//! through an [`ErrorConfig`] given to the device builders.

pub mod common;
mod flow;
mod mock_detector;
mod mock_polarizer;
mod mock_scanner;
mod mock_stage;
mod pattern;

// Re-export common types
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use flow::{FrameSource, MockDataFlow};
pub use mock_detector::{DetectorKind, MockDetector, MockDetectorBuilder, MockDetectorConfig, ValueSource};
pub use mock_polarizer::{MockPolarizer, POLARIZATION_POSITIONS};
pub use mock_scanner::{
    parse_pair, BeamProbe, MockScanDetector, MockScanner, MockScannerBuilder, MockScannerConfig,
};
pub use mock_stage::{LimitBehavior, MockStage, MockStageBuilder, MockStageConfig};
pub use pattern::{element_value, Specimen};
