//! Software-triggered step: one explicit request/acknowledge per position.
//!
//! ```text
//!   arm ──▶ move ──▶ trigger ──▶ wait ──▶ validate ──▶ hand over
//!    ▲                                       │
//!    └──── unsubscribe, pause, resubscribe ◀─┘ (timeout or too short)
//! ```
//!
//! A position failing `max_sync_failures` times in a row aborts the task with
//! [`AcqError::Timeout`]; nothing is handed over for that position.

use super::{cancellable, sleep_cancellable, subscribe_all, unsubscribe_all, DetectorChannel};
use crate::config::EngineConfig;
use crate::geometry::{clip_translation, to_translation, PixelScan};
use crate::orchestrator::ScanStage;
use acq_core::capabilities::{Movable, Scanner};
use acq_core::data::DataArray;
use acq_core::error::{AcqError, AcqResult};
use acq_core::parameter::Parameter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where the next step goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepTarget {
    /// Linear (row-major) grid index.
    pub index: usize,
    /// Nominal physical position (m, Y up).
    pub position: (f64, f64),
}

/// Frames of one successful step, in channel order.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// One frame per channel.
    pub frames: Vec<DataArray>,
    /// Attempts needed (1 when nothing was retried).
    pub attempts: u32,
    /// Time from trigger to the last frame.
    pub elapsed: Duration,
}

/// Stage with the position it had when the task started.
struct StageTarget {
    stage: ScanStage,
    origin: (f64, f64),
}

/// Software-triggered synchronization of every channel at one position.
pub struct SoftwareTriggeredStep {
    channels: Vec<DetectorChannel>,
    emitter: Arc<dyn Scanner>,
    translation: Parameter<(f64, f64)>,
    pixel_scan: PixelScan,
    stage: Option<StageTarget>,
    expected: Duration,
    config: EngineConfig,
}

impl std::fmt::Debug for SoftwareTriggeredStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareTriggeredStep")
            .field("channels", &self.channels)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

impl SoftwareTriggeredStep {
    /// Step over `channels` with the emitter configured for `pixel_scan`.
    ///
    /// # Errors
    /// [`AcqError::Configuration`] when the emitter has no translation.
    pub fn new(
        channels: Vec<DetectorChannel>,
        emitter: Arc<dyn Scanner>,
        pixel_scan: PixelScan,
        expected: Duration,
        config: EngineConfig,
    ) -> AcqResult<Self> {
        let translation = emitter
            .parameters()
            .get_typed::<(f64, f64)>(acq_core::names::TRANSLATION)
            .ok_or_else(|| {
                AcqError::Configuration(format!("Emitter '{}' has no translation", emitter.name()))
            })?;
        Ok(Self {
            channels,
            emitter,
            translation,
            pixel_scan,
            stage: None,
            expected,
            config,
        })
    }

    /// Reach positions by moving `stage` from `origin` instead of the beam.
    pub fn with_stage(mut self, stage: ScanStage, origin: (f64, f64)) -> Self {
        self.stage = Some(StageTarget { stage, origin });
        self
    }

    /// Expected duration of one step.
    pub fn expected(&self) -> Duration {
        self.expected
    }

    /// Channels, leading stream first.
    pub fn channels(&self) -> &[DetectorChannel] {
        &self.channels
    }

    /// Unsubscribe everything. Safe to call any number of times.
    pub async fn release(&mut self) -> AcqResult<()> {
        unsubscribe_all(&mut self.channels).await
    }

    /// Acquire one frame per channel at `target`, retrying failed attempts.
    pub async fn run(
        &mut self,
        target: StepTarget,
        drift: (f64, f64),
        token: &CancellationToken,
    ) -> AcqResult<StepOutcome> {
        let timeout = self.config.step_timeout(self.expected);
        let shortest = self.config.min_step_duration(self.expected);
        let mut failures = 0u32;

        loop {
            if token.is_cancelled() {
                return Err(AcqError::Cancelled);
            }

            // Arm
            for channel in self.channels.iter_mut() {
                channel.clear();
            }
            subscribe_all(&mut self.channels).await?;

            self.move_to(target, drift, token).await?;

            // Trigger
            let started = Instant::now();
            for channel in &self.channels {
                let flow = channel.flow().clone();
                cancellable(async { flow.trigger().await.map_err(AcqError::from) }, token).await?;
            }

            // Wait
            let deadline = started + timeout;
            let mut frames = Vec::with_capacity(self.channels.len());
            let mut missing = None;
            for channel in self.channels.iter_mut() {
                match channel.recv(deadline, token).await? {
                    Some(frame) => frames.push(frame),
                    None => {
                        missing = Some(channel.stream().to_string());
                        break;
                    }
                }
            }
            let elapsed = started.elapsed();

            // Validate
            let problem = match &missing {
                Some(_) => Some("timed out"),
                None if elapsed < shortest => Some("implausibly short"),
                None => None,
            };
            let Some(problem) = problem else {
                unsubscribe_all(&mut self.channels).await?;
                for frame in frames.iter_mut() {
                    frame.metadata.position = Some(target.position);
                }
                return Ok(StepOutcome {
                    frames,
                    attempts: failures + 1,
                    elapsed,
                });
            };

            failures += 1;
            let detector = missing.unwrap_or_else(|| {
                self.channels
                    .first()
                    .map(|c| c.stream().to_string())
                    .unwrap_or_default()
            });
            unsubscribe_all(&mut self.channels).await?;
            if failures >= self.config.max_sync_failures {
                return Err(AcqError::Timeout {
                    detector,
                    index: target.index,
                    attempts: failures,
                });
            }
            warn!(
                index = target.index,
                detector = %detector,
                attempt = failures,
                elapsed_ms = elapsed.as_millis() as u64,
                expected_ms = self.expected.as_millis() as u64,
                "Step {}, retrying",
                problem
            );
            sleep_cancellable(self.config.retry_delay, token).await?;
        }
    }

    async fn move_to(&self, target: StepTarget, drift: (f64, f64), token: &CancellationToken) -> AcqResult<()> {
        let base = self.emitter.base_pixel_size();
        let nominal = match &self.stage {
            Some(stage) => {
                let goal = (stage.origin.0 + target.position.0, stage.origin.1 + target.position.1);
                move_stage(&stage.stage, goal, target.index, token).await?;
                if self.config.settle_time > Duration::ZERO {
                    sleep_cancellable(self.config.settle_time, token).await?;
                }
                (0.0, 0.0)
            }
            None => to_translation(target.position, base),
        };
        let requested = (nominal.0 - drift.0, nominal.1 - drift.1);
        let (translation, clipped) = clip_translation(
            requested,
            self.emitter.shape(),
            self.pixel_scan.resolution,
            self.pixel_scan.scale,
        );
        if clipped {
            warn!(
                index = target.index,
                requested = ?requested,
                clipped = ?translation,
                drift = ?drift,
                "Drift correction out of bounds, scan position clipped"
            );
        }
        let applied = self.translation.set(translation)?;
        debug!(index = target.index, translation = ?applied, "Emitter moved");
        Ok(())
    }
}

async fn move_stage(
    stage: &ScanStage,
    goal: (f64, f64),
    index: usize,
    token: &CancellationToken,
) -> AcqResult<()> {
    for (axis, value) in [(&stage.x, goal.0), (&stage.y, goal.1)] {
        let (min, max) = axis.limits();
        let clipped = value.clamp(min, max);
        if clipped != value {
            warn!(index, axis = %axis.name(), requested = value, clipped, "Stage position out of range, clipped");
        }
        let axis: Arc<dyn Movable> = axis.clone();
        cancellable(
            async move {
                axis.move_abs(clipped).await?;
                axis.wait_settled().await?;
                Ok::<(), AcqError>(())
            },
            token,
        )
        .await?;
    }
    Ok(())
}
