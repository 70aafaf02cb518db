//! Engine configuration.
//!
//! Loaded with figment from an optional TOML file, then overridden by
//! `ACQ_`-prefixed environment variables (`ACQ_TIMEOUT_MARGIN=2s`).
//! Durations are written in humantime form (`"500ms"`, `"5s"`).

use acq_core::limits;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing and retry policy of the acquisition engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Step wait timeout, as a multiple of the expected step duration.
    pub timeout_factor: f64,
    /// Fixed margin added to every step wait timeout.
    #[serde(with = "humantime_serde")]
    pub timeout_margin: Duration,
    /// Consecutive failures of one position before the task aborts.
    pub max_sync_failures: u32,
    /// Pause between unsubscribing and resubscribing after a failed step.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// A step shorter than this fraction of its expected duration is suspect.
    pub min_duration_ratio: f64,
    /// Minimum period between two preview renders.
    #[serde(with = "humantime_serde")]
    pub preview_period: Duration,
    /// Wait after every stage or auxiliary move.
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Margin added to the expected frame time in hardware-triggered mode.
    #[serde(with = "humantime_serde")]
    pub dequeue_margin: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_factor: limits::SYNC_TIMEOUT_FACTOR,
            timeout_margin: limits::SYNC_TIMEOUT_MARGIN,
            max_sync_failures: limits::MAX_SYNC_FAILURES,
            retry_delay: limits::SYNC_RETRY_DELAY,
            min_duration_ratio: limits::MIN_DURATION_RATIO,
            preview_period: limits::PREVIEW_PERIOD,
            settle_time: Duration::ZERO,
            dequeue_margin: limits::DEQUEUE_MARGIN,
        }
    }
}

impl EngineConfig {
    /// Defaults merged with `ACQ_` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::figment(None).extract().map_err(Into::into)
    }

    /// Defaults, then the `[engine]` table of `path`, then the environment.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::figment(Some(path.as_ref())).extract().map_err(Into::into)
    }

    /// The provider chain, so callers can merge their own layers.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Figment::from(Toml::file(path)).focus("engine"));
        }
        figment.merge(Env::prefixed("ACQ_"))
    }

    /// Wait timeout of a step expected to take `expected`.
    pub fn step_timeout(&self, expected: Duration) -> Duration {
        expected.mul_f64(self.timeout_factor.max(1.0)) + self.timeout_margin
    }

    /// Shortest plausible duration of a step expected to take `expected`.
    pub fn min_step_duration(&self, expected: Duration) -> Duration {
        expected.mul_f64(self.min_duration_ratio.clamp(0.0, 1.0))
    }

    /// Preview period with the floor applied.
    pub fn effective_preview_period(&self) -> Duration {
        self.preview_period.max(limits::MIN_PREVIEW_PERIOD)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.timeout_factor.is_finite() && self.timeout_factor >= 1.0) {
            anyhow::bail!("timeout_factor must be >= 1, got {}", self.timeout_factor);
        }
        if self.max_sync_failures == 0 {
            anyhow::bail!("max_sync_failures must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_duration_ratio) {
            anyhow::bail!(
                "min_duration_ratio must be within [0, 1], got {}",
                self.min_duration_ratio
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_sync_failures, 3);
        assert_eq!(cfg.timeout_margin, Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_step_timeout() {
        let cfg = EngineConfig::default();
        assert_eq!(
            cfg.step_timeout(Duration::from_secs(1)),
            Duration::from_secs(8)
        );
        assert_eq!(
            cfg.min_step_duration(Duration::from_secs(1)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_preview_floor() {
        let cfg = EngineConfig {
            preview_period: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(cfg.effective_preview_period(), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values() {
        let cfg = EngineConfig {
            timeout_factor: 0.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = EngineConfig {
            max_sync_failures: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
