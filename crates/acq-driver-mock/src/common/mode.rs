//! Operational modes for mock devices.
//!
//! - **Instant**: only the physically meaningful waits (exposure, dwell) are
//!   simulated; no readout or communication delay
//! - **Realistic**: readout, settling and communication delays added
//! - **Chaos**: realistic timing, meant to be paired with an `ErrorConfig`
//!
//! Exposure and dwell waits are never skipped: the acquisition engine treats
//! a frame delivered much faster than expected as bogus.

use serde::{Deserialize, Serialize};

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// No extra delays - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests and the simulator
    Realistic,
    /// Realistic timing for resilience testing with injected errors
    Chaos,
}

impl MockMode {
    /// Whether readout/settling/communication delays apply.
    pub fn delays(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}
