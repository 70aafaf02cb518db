//! Mock motion axis (scan stage axis or focuser).

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use acq_core::capabilities::{Movable, Parameterized};
use acq_core::parameter::{Parameter, ParameterSet};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Limit behavior when position exceeds boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitBehavior {
    /// Hard stop - return error at limit
    HardStop,
    /// Clamp to limit - move to boundary without error
    Clamp,
}

/// Configuration for [`MockStage`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MockStageConfig {
    /// Initial position in m (default: 0.0)
    pub initial_position: f64,
    /// Travel range in m (default: ±1 mm)
    pub limits: (f64, f64),
    /// What happens outside the travel range
    pub behavior: LimitBehavior,
    /// Speed in m/s (default: 1 mm/s)
    pub speed: f64,
}

impl Default for MockStageConfig {
    fn default() -> Self {
        Self {
            initial_position: 0.0,
            limits: (-1e-3, 1e-3),
            behavior: LimitBehavior::HardStop,
            speed: 1e-3,
        }
    }
}

#[derive(Debug, Default)]
struct StageState {
    position: f64,
    history: Vec<f64>,
}

/// Mock motion axis with limits, speed-based move time and settling.
///
/// # Example
///
/// ```rust,ignore
/// let x = MockStage::builder("stage-x").limits(-1e-4, 1e-4).build();
/// x.move_abs(5e-5).await?;
/// x.wait_settled().await?;
/// ```
pub struct MockStage {
    name: String,
    config: MockStageConfig,
    state: Arc<Mutex<StageState>>,
    position: Parameter<f64>,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    params: ParameterSet,
}

impl MockStage {
    /// Builder for an axis named `name`.
    pub fn builder(name: impl Into<String>) -> MockStageBuilder {
        MockStageBuilder {
            name: name.into(),
            config: MockStageConfig::default(),
            mode: MockMode::Instant,
            errors: ErrorConfig::none(),
        }
    }

    /// Axis from configuration.
    pub fn with_config(name: impl Into<String>, config: MockStageConfig) -> Self {
        MockStageBuilder {
            config,
            ..Self::builder(name)
        }
        .build()
    }

    /// Every position reached so far, in order.
    pub fn history(&self) -> Vec<f64> {
        self.state.lock().history.clone()
    }

    fn enforce(&self, target: f64) -> Result<f64> {
        let (min, max) = self.config.limits;
        match self.config.behavior {
            LimitBehavior::Clamp => Ok(target.clamp(min, max)),
            LimitBehavior::HardStop if target < min || target > max => Err(anyhow!(
                "{}: position {:.3e} exceeds limits [{:.3e}, {:.3e}]",
                self.name,
                target,
                min,
                max
            )),
            LimitBehavior::HardStop => Ok(target),
        }
    }
}

impl Parameterized for MockStage {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl Movable for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn move_abs(&self, position: f64) -> Result<()> {
        self.errors
            .check_operation(&self.name, "move")
            .map_err(anyhow::Error::from)?;
        let target = self.enforce(position)?;
        let distance = (target - self.state.lock().position).abs();

        tokio::time::sleep(self.timing.communication(self.mode)).await;
        if self.mode.delays() && self.config.speed > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(distance / self.config.speed)).await;
        }

        {
            let mut state = self.state.lock();
            state.position = target;
            state.history.push(target);
        }
        self.position.publish(target);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.state.lock().position)
    }

    async fn wait_settled(&self) -> Result<()> {
        tokio::time::sleep(self.timing.settling(self.mode)).await;
        Ok(())
    }

    fn limits(&self) -> (f64, f64) {
        self.config.limits
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Builder for [`MockStage`]
pub struct MockStageBuilder {
    name: String,
    config: MockStageConfig,
    mode: MockMode,
    errors: ErrorConfig,
}

impl MockStageBuilder {
    /// Initial position (m).
    pub fn initial_position(mut self, position: f64) -> Self {
        self.config.initial_position = position;
        self
    }

    /// Travel range (m).
    pub fn limits(mut self, min: f64, max: f64) -> Self {
        self.config.limits = (min, max);
        self
    }

    /// Limit behavior.
    pub fn behavior(mut self, behavior: LimitBehavior) -> Self {
        self.config.behavior = behavior;
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

    /// Build the axis.
    pub fn build(self) -> MockStage {
        let position = Parameter::new("position", self.config.initial_position)
            .with_description("Axis position")
            .with_unit("m")
            .read_only();
        let mut params = ParameterSet::new();
        params.register(position.clone());
        MockStage {
            state: Arc::new(Mutex::new(StageState {
                position: self.config.initial_position,
                history: Vec::new(),
            })),
            name: self.name,
            config: self.config,
            position,
            mode: self.mode,
            timing: TimingConfig::stage(),
            errors: self.errors,
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_and_history() {
        let stage = MockStage::builder("x").build();
        stage.move_abs(1e-4).await.unwrap();
        stage.wait_settled().await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 1e-4);
        assert_eq!(stage.history(), vec![1e-4]);
        let p: Parameter<f64> = stage.parameters().get_typed("position").unwrap();
        assert_eq!(p.get(), 1e-4);
    }

    #[tokio::test]
    async fn test_hard_stop_and_clamp() {
        let hard = MockStage::builder("x").limits(-1.0, 1.0).build();
        assert!(hard.move_abs(2.0).await.is_err());

        let soft = MockStage::builder("y")
            .limits(-1.0, 1.0)
            .behavior(LimitBehavior::Clamp)
            .build();
        soft.move_abs(2.0).await.unwrap();
        assert_eq!(soft.position().await.unwrap(), 1.0);
    }
}
