//! Leeches: periodic callouts during an acquisition.
//!
//! A [`Leech`] is started with the expected step duration and the grid shape
//! and answers with the number of steps until its first checkpoint. The
//! [`LeechScheduler`] counts steps down and runs the checkpoints:
//!
//! - a leech that fails to start is disabled for the rest of the task
//! - a checkpoint that fails is retried at the very next step
//!
//! Neither failure is fatal. A leech may report a drift vector (scanner
//! pixels) that the engine subtracts from every later scan position.

use crate::live::LiveStore;
use crate::sync::cancellable;
use acq_core::data::DataArray;
use acq_core::error::{AcqError, AcqResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capability: periodic callout during an acquisition.
#[async_trait]
pub trait Leech: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Extra time the leech adds to an acquisition of `shape` (rows,
    /// columns) steps of `step` each.
    fn estimate_time(&self, step: Duration, shape: (usize, usize)) -> Duration;

    /// Prepare for a new acquisition. Returns the number of steps until the
    /// first checkpoint, or `None` when no checkpoint is needed.
    async fn start(&self, step: Duration, shape: (usize, usize)) -> anyhow::Result<Option<u64>>;

    /// Run a checkpoint with the data acquired so far. Returns the number of
    /// steps until the next one.
    async fn next(&self, live: &LiveStore) -> anyhow::Result<u64>;

    /// The acquisition is over; return any data of the leech's own to append
    /// to the result set.
    async fn complete(&self, results: &[DataArray]) -> anyhow::Result<Vec<DataArray>>;

    /// Current drift vector in scanner pixels, if the leech measures one.
    fn drift_vector(&self) -> Option<(f64, f64)> {
        None
    }
}

struct Scheduled {
    leech: Arc<dyn Leech>,
    countdown: Option<u64>,
}

/// Runs the checkpoints of the leeches of one task.
pub struct LeechScheduler {
    active: Vec<Scheduled>,
}

impl std::fmt::Debug for LeechScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.active.iter().map(|s| (s.leech.name(), s.countdown)))
            .finish()
    }
}

impl LeechScheduler {
    /// Total extra time of `leeches`.
    pub fn estimate_time(leeches: &[Arc<dyn Leech>], step: Duration, shape: (usize, usize)) -> Duration {
        leeches.iter().map(|l| l.estimate_time(step, shape)).sum()
    }

    /// Start every leech. Those that fail are logged and left out.
    pub async fn start(
        leeches: &[Arc<dyn Leech>],
        step: Duration,
        shape: (usize, usize),
        token: &CancellationToken,
    ) -> AcqResult<Self> {
        let mut active = Vec::with_capacity(leeches.len());
        for leech in leeches {
            let started = cancellable(
                async { leech.start(step, shape).await.map_err(AcqError::from) },
                token,
            )
            .await;
            match started {
                Ok(countdown) => {
                    debug!(leech = %leech.name(), ?countdown, "Leech started");
                    active.push(Scheduled {
                        leech: leech.clone(),
                        countdown: countdown.map(|c| c.max(1)),
                    });
                }
                Err(AcqError::Cancelled) => return Err(AcqError::Cancelled),
                Err(e) => {
                    warn!(leech = %leech.name(), error = %e, "Leech failed to start, disabled for this acquisition");
                }
            }
        }
        Ok(Self { active })
    }

    /// Whether no leech is running.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Count one step down and run the checkpoints that are due.
    ///
    /// Returns true when at least one checkpoint ran, in which case the
    /// caller must put its own scanner settings back.
    pub async fn after_step(&mut self, live: &LiveStore, token: &CancellationToken) -> AcqResult<bool> {
        let mut ran = false;
        for entry in self.active.iter_mut() {
            let Some(countdown) = entry.countdown.as_mut() else {
                continue;
            };
            *countdown = countdown.saturating_sub(1);
            if *countdown > 0 {
                continue;
            }
            ran = true;
            let leech = entry.leech.clone();
            let result = cancellable(async { leech.next(live).await.map_err(AcqError::from) }, token).await;
            entry.countdown = match result {
                Ok(next) => Some(next.max(1)),
                Err(AcqError::Cancelled) => return Err(AcqError::Cancelled),
                Err(e) => {
                    warn!(leech = %leech.name(), error = %e, "Leech checkpoint failed, retrying at next step");
                    Some(1)
                }
            };
        }
        Ok(ran)
    }

    /// Sum of the drift vectors reported by the running leeches.
    pub fn drift(&self) -> (f64, f64) {
        self.active
            .iter()
            .filter_map(|s| s.leech.drift_vector())
            .fold((0.0, 0.0), |acc, d| (acc.0 + d.0, acc.1 + d.1))
    }

    /// Let every running leech finish; returns their extra data.
    pub async fn complete(&self, results: &[DataArray]) -> Vec<DataArray> {
        let mut extra = Vec::new();
        for entry in &self.active {
            match entry.leech.complete(results).await {
                Ok(data) => {
                    info!(leech = %entry.leech.name(), arrays = data.len(), "Leech completed");
                    extra.extend(data);
                }
                Err(e) => warn!(leech = %entry.leech.name(), error = %e, "Leech failed to complete"),
            }
        }
        extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Script {
        start_fails: bool,
        fail_next: Mutex<u32>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Leech for Script {
        fn name(&self) -> &str {
            "script"
        }
        fn estimate_time(&self, step: Duration, _shape: (usize, usize)) -> Duration {
            step * 2
        }
        async fn start(&self, _step: Duration, _shape: (usize, usize)) -> anyhow::Result<Option<u64>> {
            self.calls.lock().push("start");
            if self.start_fails {
                anyhow::bail!("no anchor");
            }
            Ok(Some(2))
        }
        async fn next(&self, _live: &LiveStore) -> anyhow::Result<u64> {
            self.calls.lock().push("next");
            let mut fail = self.fail_next.lock();
            if *fail > 0 {
                *fail -= 1;
                anyhow::bail!("anchor lost");
            }
            Ok(3)
        }
        async fn complete(&self, _results: &[DataArray]) -> anyhow::Result<Vec<DataArray>> {
            self.calls.lock().push("complete");
            Ok(Vec::new())
        }
        fn drift_vector(&self) -> Option<(f64, f64)> {
            Some((1.0, -2.0))
        }
    }

    #[tokio::test]
    async fn test_start_failure_disables() {
        let leech = Arc::new(Script {
            start_fails: true,
            ..Default::default()
        });
        let token = CancellationToken::new();
        let leeches: Vec<Arc<dyn Leech>> = vec![leech.clone()];
        let mut scheduler = LeechScheduler::start(&leeches, Duration::from_millis(1), (2, 2), &token)
            .await
            .unwrap();
        assert!(scheduler.is_empty());
        assert!(!scheduler.after_step(&LiveStore::default(), &token).await.unwrap());
        assert_eq!(scheduler.drift(), (0.0, 0.0));
        assert_eq!(*leech.calls.lock(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_retried_next_step() {
        let leech = Arc::new(Script::default());
        *leech.fail_next.lock() = 1;
        let token = CancellationToken::new();
        let leeches: Vec<Arc<dyn Leech>> = vec![leech.clone()];
        let mut scheduler = LeechScheduler::start(&leeches, Duration::from_millis(1), (2, 2), &token)
            .await
            .unwrap();
        let live = LiveStore::default();
        let ran: Vec<bool> = {
            let mut ran = Vec::new();
            for _ in 0..6 {
                ran.push(scheduler.after_step(&live, &token).await.unwrap());
            }
            ran
        };
        // Due at step 2, fails, retried at step 3, then every 3 steps.
        assert_eq!(ran, vec![false, true, true, false, false, true]);
        assert_eq!(scheduler.drift(), (1.0, -2.0));
        scheduler.complete(&[]).await;
        assert_eq!(leech.calls.lock().last(), Some(&"complete"));
    }

    #[test]
    fn test_estimate_sums() {
        let leeches: Vec<Arc<dyn Leech>> = vec![Arc::new(Script::default()), Arc::new(Script::default())];
        assert_eq!(
            LeechScheduler::estimate_time(&leeches, Duration::from_secs(1), (1, 1)),
            Duration::from_secs(4)
        );
    }
}
