//! Mock polarization analyzer: a discrete auxiliary axis.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use acq_core::capabilities::AuxiliaryAxis;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Positions of the analyzer, in the order they are usually acquired.
pub const POLARIZATION_POSITIONS: &[&str] = &[
    "horizontal",
    "vertical",
    "posdiag",
    "negdiag",
    "rhc",
    "lhc",
    "pass-through",
];

/// Simulated polarization analyzer.
pub struct MockPolarizer {
    name: String,
    position: Mutex<String>,
    history: Mutex<Vec<String>>,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
}

impl MockPolarizer {
    /// Analyzer starting in "pass-through".
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: Mutex::new("pass-through".to_string()),
            history: Mutex::new(Vec::new()),
            mode: MockMode::Instant,
            timing: TimingConfig::polarizer(),
            errors: ErrorConfig::none(),
        }
    }

    /// Operational mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Error injection.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Every position moved to, in order.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl AuxiliaryAxis for MockPolarizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn choices(&self) -> Vec<String> {
        POLARIZATION_POSITIONS.iter().map(|s| s.to_string()).collect()
    }

    async fn move_to(&self, position: &str) -> Result<()> {
        if !POLARIZATION_POSITIONS.contains(&position) {
            return Err(anyhow!("{}: unknown position '{}'", self.name, position));
        }
        self.errors
            .check_operation(&self.name, "move")
            .map_err(anyhow::Error::from)?;
        tokio::time::sleep(self.timing.communication(self.mode) + self.timing.settling(self.mode))
            .await;
        *self.position.lock() = position.to_string();
        self.history.lock().push(position.to_string());
        Ok(())
    }

    async fn position(&self) -> Result<String> {
        Ok(self.position.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_known_and_unknown() {
        let pol = MockPolarizer::new("analyzer");
        pol.move_to("vertical").await.unwrap();
        assert_eq!(pol.position().await.unwrap(), "vertical");
        assert!(pol.move_to("diagonal").await.is_err());
        assert_eq!(pol.history(), vec!["vertical".to_string()]);
    }
}
