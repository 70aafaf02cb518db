//! Error types for the acquisition system.
//!
//! `AcqError` is the single error type surfaced by the acquisition engine to
//! its callers. Device capability traits return `anyhow::Result` (drivers are
//! free to attach context), and the engine converts those into `AcqError` at
//! its boundary. A [`DriverError`] travelling inside an `anyhow::Error` is
//! recovered by downcast so its category survives the conversion.
//!
//! ## Error Taxonomy
//!
//! - **`Timeout`**: a detector did not deliver within the expected window and
//!   the per-position retry budget is exhausted.
//! - **`HardwareRejection`**: a correctness-critical setting was clamped or
//!   refused by a device. Raised before any data is taken.
//! - **`Cancelled`**: caller-initiated. Always surfaced after cleanup.
//! - **`EmitterBusy`**: another acquisition already owns the scanning emitter.
//! - **`Configuration`**: the request itself is inconsistent.
//! - **`Hardware`** / **`Driver`**: any other device failure.
//! - **`Processing`**: live or final assembly could not fold the data.
//!
//! The enum is `Clone` so the outcome of an acquisition can be read any
//! number of times from its handle.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a driver-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device could not be set up.
    Initialization,
    /// Device refused its configuration.
    Configuration,
    /// Link to the device failed.
    Communication,
    /// Device reported a fault.
    Hardware,
    /// Device did not answer in time.
    Timeout,
    /// Value outside what the device accepts.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured error raised by device drivers.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver that raised the error (e.g. `mock_scanner`).
    pub driver_type: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Human readable description.
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Primary error type of the acquisition engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcqError {
    /// The acquisition request is inconsistent (bad ROI, no streams, ...).
    ///
    /// **Recovery Strategy**: fix the request; nothing was touched on the
    /// hardware.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A correctness-critical setting was clamped or refused by a device.
    ///
    /// Raised before any data is taken, after which the settings session
    /// restores whatever it had already changed.
    #[error("Device '{device}' rejected {setting}: requested {requested}, applied {applied}")]
    HardwareRejection {
        /// Device name.
        device: String,
        /// Setting name.
        setting: String,
        /// Value written (JSON rendering).
        requested: String,
        /// Value read back (JSON rendering).
        applied: String,
    },

    /// A detector failed to deliver within the expected window too many
    /// times for the same scan position.
    #[error("Detector '{detector}' timed out at scan index {index} after {attempts} attempts")]
    Timeout {
        /// Name of the first detector that did not deliver.
        detector: String,
        /// Linear (row-major) scan index of the position.
        index: usize,
        /// Number of consecutive failed attempts.
        attempts: u32,
    },

    /// The acquisition was cancelled by its caller.
    #[error("Acquisition cancelled")]
    Cancelled,

    /// Another acquisition is already running on this scanning emitter.
    #[error("Emitter '{0}' is already used by a running acquisition")]
    EmitterBusy(String),

    /// Waiting for the outcome of an acquisition took longer than allowed.
    #[error("Acquisition still running after {0:?}")]
    WaitTimeout(std::time::Duration),

    /// Structured driver error.
    #[error("{0}")]
    Driver(DriverError),

    /// Any other device failure.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Live or final data assembly failed.
    #[error("Data processing error: {0}")]
    Processing(String),
}

impl AcqError {
    /// True for a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AcqError::Cancelled)
    }
}

impl From<anyhow::Error> for AcqError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(acq) = err.downcast_ref::<AcqError>() {
            return acq.clone();
        }
        if let Some(driver) = err.downcast_ref::<DriverError>() {
            return AcqError::Driver(driver.clone());
        }
        AcqError::Hardware(format!("{:#}", err))
    }
}

impl From<DriverError> for AcqError {
    fn from(err: DriverError) -> Self {
        AcqError::Driver(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AcqError::Timeout {
            detector: "ccd".into(),
            index: 7,
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Detector 'ccd' timed out at scan index 7 after 3 attempts"
        );
    }

    #[test]
    fn test_driver_error_survives_anyhow() {
        let driver = DriverError::new("mock_ccd", DriverErrorKind::Timeout, "no frame");
        let any: anyhow::Error = driver.clone().into();
        assert_eq!(AcqError::from(any), AcqError::Driver(driver));
    }

    #[test]
    fn test_plain_anyhow_becomes_hardware() {
        let any = anyhow::anyhow!("stage stuck").context("moving x");
        match AcqError::from(any) {
            AcqError::Hardware(msg) => assert!(msg.contains("stage stuck")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_round_trips_through_anyhow() {
        let any: anyhow::Error = AcqError::Cancelled.into();
        assert!(AcqError::from(any).is_cancelled());
    }
}
