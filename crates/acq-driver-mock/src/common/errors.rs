//! Error injection framework for mock devices.
//!
//! Enables configurable failures for resilience testing of the acquisition
//! engine. Command failures surface as [`DriverError`]s; dropped frames are
//! silent (the detector just never delivers), which is what makes the
//! engine's synchronization timeout fire.

use super::rng::MockRng;
use acq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for mock devices
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// A deterministic failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Fail every call of `operation` after `count` successful ones
    FailAfterN {
        /// Operation name (e.g. "trigger", "move")
        operation: &'static str,
        /// Successful calls before failures start
        count: u32,
    },
    /// Drop `count` consecutive frames once `after` frames were delivered
    DropFrames {
        /// Frames delivered normally first
        after: u64,
        /// Frames silently discarded
        count: u32,
    },
    /// Deliver `count` consecutive frames without waiting out the exposure
    /// once `after` frames were seen
    EarlyFrames {
        /// Frames delivered normally first
        after: u64,
        /// Frames delivered immediately
        count: u32,
    },
    /// Every call of `operation` reports a timeout
    Timeout {
        /// Operation name
        operation: &'static str,
    },
    /// Hardware fault with specific code, sticky after the first occurrence
    HardwareFault {
        /// Fault code reported in the message
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Operation counters for FailAfterN scenarios
    operation_counts: HashMap<&'static str, u32>,
    /// Frames seen so far (delivered or dropped)
    frames_seen: u64,
    /// Hardware fault code (0 = no fault)
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Create error config with uniform random command failures and a seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Check if an operation should fail and return appropriate error
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.hardware_fault_code != 0 {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure after {} operations", count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Whether the next produced frame must be dropped. Counts the frame.
    pub fn drop_frame(&self) -> bool {
        let mut state = self.state.lock();
        let index = state.frames_seen;
        state.frames_seen += 1;
        self.scenarios.iter().any(|s| match s {
            ErrorScenario::DropFrames { after, count } => {
                index >= *after && index < after + u64::from(*count)
            }
            _ => false,
        })
    }

    /// Whether the next frame skips its exposure. Does not count the frame.
    pub fn early_frame(&self) -> bool {
        let index = self.state.lock().frames_seen;
        self.scenarios.iter().any(|s| match s {
            ErrorScenario::EarlyFrames { after, count } => {
                index >= *after && index < after + u64::from(*count)
            }
            _ => false,
        })
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("test_driver", "trigger").is_ok());
            assert!(!config.drop_frame());
        }
    }

    #[test]
    fn test_random_failures() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("test_driver", "read").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n_and_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "move",
            count: 2,
        });
        assert!(config.check_operation("stage", "move").is_ok());
        assert!(config.check_operation("stage", "move").is_ok());
        assert!(config.check_operation("stage", "move").is_err());
        assert!(config.check_operation("stage", "position").is_ok());

        config.reset();
        assert!(config.check_operation("stage", "move").is_ok());
    }

    #[test]
    fn test_drop_frames_window() {
        let config = ErrorConfig::scenario(ErrorScenario::DropFrames { after: 2, count: 3 });
        let dropped: Vec<bool> = (0..7).map(|_| config.drop_frame()).collect();
        assert_eq!(dropped, vec![false, false, true, true, true, false, false]);
    }

    #[test]
    fn test_early_frames_window() {
        let config = ErrorConfig::scenario(ErrorScenario::EarlyFrames { after: 1, count: 1 });
        let early: Vec<bool> = (0..3)
            .map(|_| {
                let early = config.early_frame();
                assert!(!config.drop_frame());
                early
            })
            .collect();
        assert_eq!(early, vec![false, true, false]);
    }

    #[test]
    fn test_timeout_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout { operation: "move" });
        let err = config.check_operation("stage", "move").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn test_hardware_fault_is_sticky() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });
        let err = config.check_operation("ccd", "trigger").unwrap_err();
        assert!(err.message.contains("66"));
        assert!(config.check_operation("ccd", "other").is_err());
    }
}
