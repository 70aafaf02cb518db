//! Timing configuration for realistic mode.

use super::mode::MockMode;
use std::time::Duration;

/// Hardware-like delays, applied only when the mode asks for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Frame readout time in milliseconds (detectors)
    pub frame_readout_ms: u64,
    /// Settling time in milliseconds (stages, polarizers, scanner jumps)
    pub settling_time_ms: u64,
    /// Communication delay in milliseconds (every command)
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    /// Scanning emitter: short beam settle after a jump.
    pub fn scanner() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 1,
            communication_delay_ms: 1,
        }
    }

    /// Camera or spectrometer readout.
    pub fn detector() -> Self {
        Self {
            frame_readout_ms: 5,
            settling_time_ms: 0,
            communication_delay_ms: 1,
        }
    }

    /// Motion stage.
    pub fn stage() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 50,
            communication_delay_ms: 5,
        }
    }

    /// Rotating polarizer.
    pub fn polarizer() -> Self {
        Self {
            frame_readout_ms: 0,
            settling_time_ms: 30,
            communication_delay_ms: 3,
        }
    }

    /// Readout delay for a mode.
    pub fn readout(&self, mode: MockMode) -> Duration {
        Self::gated(mode, self.frame_readout_ms)
    }

    /// Settling delay for a mode.
    pub fn settling(&self, mode: MockMode) -> Duration {
        Self::gated(mode, self.settling_time_ms)
    }

    /// Communication delay for a mode.
    pub fn communication(&self, mode: MockMode) -> Duration {
        Self::gated(mode, self.communication_delay_ms)
    }

    fn gated(mode: MockMode, ms: u64) -> Duration {
        if mode.delays() {
            Duration::from_millis(ms)
        } else {
            Duration::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing() {
        let config = TimingConfig::default();
        assert_eq!(config.frame_readout_ms, 0);
        assert_eq!(config.settling_time_ms, 0);
    }

    #[test]
    fn test_instant_mode_has_no_delays() {
        let config = TimingConfig::stage();
        assert_eq!(config.settling(MockMode::Instant), Duration::ZERO);
        assert_eq!(config.settling(MockMode::Realistic), Duration::from_millis(50));
    }

    #[test]
    fn test_detector_readout() {
        let config = TimingConfig::detector();
        assert_eq!(config.readout(MockMode::Chaos), Duration::from_millis(5));
    }
}
