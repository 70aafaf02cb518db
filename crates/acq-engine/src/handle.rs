//! Progress and result handle of a running acquisition.
//!
//! ```text
//!              finish()
//!  ┌─────────┐ ─────────▶ ┌──────────┐
//!  │ Running │            │ Finished │
//!  └─────────┘ ─────────▶ └──────────┘
//!              cancel()   ┌───────────┐
//!                └──────▶ │ Cancelled │
//!                         └───────────┘
//! ```
//!
//! Terminal states are final: cancelling a finished task is a no-op and a
//! task cancelled while it was finishing stays cancelled. The outcome is
//! published once through a `watch` channel and can be read any number of
//! times; done callbacks run exactly once.

use acq_core::data::DataArray;
use acq_core::error::{AcqError, AcqResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle state of an acquisition task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Acquiring.
    Running = 0,
    /// Ended on its own, with or without error.
    Finished = 1,
    /// Cancellation was requested while running.
    Cancelled = 2,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Running,
            1 => TaskState::Finished,
            _ => TaskState::Cancelled,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Finished => write!(f, "finished"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Data of a task that acquired something.
///
/// `error` is set when the task stopped early; `data` then holds what was
/// acquired until that point.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionResult {
    /// Result set, one array per stream (or per stream and auxiliary
    /// position), followed by leech data.
    pub data: Vec<DataArray>,
    /// Condition that ended a partial acquisition.
    pub error: Option<AcqError>,
}

impl AcquisitionResult {
    /// True when the whole grid was acquired.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Expected time frame of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// When the task started.
    pub start: DateTime<Utc>,
    /// Current estimate of its end.
    pub end: DateTime<Utc>,
}

impl Progress {
    /// Fraction of the expected time elapsed at `now`, in `[0, 1]`.
    pub fn fraction(&self, now: DateTime<Utc>) -> f64 {
        let total = (self.end - self.start).num_milliseconds();
        if total <= 0 {
            return 1.0;
        }
        ((now - self.start).num_milliseconds() as f64 / total as f64).clamp(0.0, 1.0)
    }
}

type Outcome = Option<AcqResult<AcquisitionResult>>;
type DoneCallback = Box<dyn FnOnce(&AcqResult<AcquisitionResult>) + Send>;

struct Shared {
    id: Uuid,
    state: AtomicU8,
    token: CancellationToken,
    progress: watch::Sender<Progress>,
    outcome: watch::Sender<Outcome>,
    callbacks: Mutex<Vec<DoneCallback>>,
}

/// Cancellable, progress-reporting handle on an acquisition.
///
/// Cloning gives another handle on the same task.
#[derive(Clone)]
pub struct AcquisitionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AcquisitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl AcquisitionHandle {
    /// Handle of a task expected to last `expected`.
    pub(crate) fn new(expected: Duration) -> Self {
        let start = Utc::now();
        let end = start + chrono::Duration::from_std(expected).unwrap_or(chrono::Duration::zero());
        let (progress, _) = watch::channel(Progress { start, end });
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                state: AtomicU8::new(TaskState::Running as u8),
                token: CancellationToken::new(),
                progress,
                outcome,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Unique task identifier.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the outcome is available.
    pub fn is_done(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    /// Request cancellation.
    ///
    /// Returns true if the task is cancelled (now or before), false if it had
    /// already finished. Every pending wait of the task is interrupted.
    pub fn cancel(&self) -> bool {
        let swapped = self.shared.state.compare_exchange(
            TaskState::Running as u8,
            TaskState::Cancelled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match swapped {
            Ok(_) => {
                info!(task = %self.shared.id, "Cancellation requested");
                self.shared.token.cancel();
                true
            }
            Err(current) => TaskState::from_u8(current) == TaskState::Cancelled,
        }
    }

    /// Latest time frame.
    pub fn progress(&self) -> Progress {
        *self.shared.progress.borrow()
    }

    /// Follow the time frame updates.
    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.shared.progress.subscribe()
    }

    /// Update the expected end time.
    pub fn set_progress(&self, end: DateTime<Utc>) {
        self.shared.progress.send_modify(|p| p.end = end);
    }

    /// Wait for the outcome, at most `timeout` when given.
    ///
    /// # Errors
    /// The task's error (or [`AcqError::Cancelled`]) when it acquired
    /// nothing, [`AcqError::WaitTimeout`] when it is still running.
    pub async fn result(&self, timeout: Option<Duration>) -> AcqResult<AcquisitionResult> {
        let mut rx = self.shared.outcome.subscribe();
        let wait = async {
            match rx.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                // The sender lives as long as this handle.
                Err(_) => None,
            }
        };
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| AcqError::WaitTimeout(limit))?,
            None => wait.await,
        };
        outcome.unwrap_or_else(|| Err(AcqError::Processing("Acquisition task vanished".into())))
    }

    /// Outcome if already available.
    pub fn try_result(&self) -> Option<AcqResult<AcquisitionResult>> {
        self.shared.outcome.borrow().clone()
    }

    /// Call `callback` with the outcome once it is known (immediately if it
    /// already is). Each callback runs exactly once.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&AcqResult<AcquisitionResult>) + Send + 'static,
    {
        let mut callbacks = self.shared.callbacks.lock();
        let done = self.shared.outcome.borrow().clone();
        match done {
            Some(outcome) => {
                drop(callbacks);
                callback(&outcome);
            }
            None => callbacks.push(Box::new(callback)),
        }
    }

    /// Publish the outcome. Only the first call has an effect.
    pub(crate) fn finish(&self, outcome: AcqResult<AcquisitionResult>) {
        let _ = self.shared.state.compare_exchange(
            TaskState::Running as u8,
            TaskState::Finished as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let callbacks = {
            let mut callbacks = self.shared.callbacks.lock();
            let published = self.shared.outcome.send_if_modified(|slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(outcome.clone());
                true
            });
            if !published {
                return;
            }
            std::mem::take(&mut *callbacks)
        };
        self.set_progress(Utc::now());
        debug!(task = %self.shared.id, state = %self.state(), callbacks = callbacks.len(), "Outcome published");
        for callback in callbacks {
            callback(&outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::data::Metadata;
    use std::sync::atomic::AtomicUsize;

    fn partial() -> AcquisitionResult {
        AcquisitionResult {
            data: vec![DataArray::point(1.0, Metadata::default())],
            error: Some(AcqError::Cancelled),
        }
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_noop() {
        let handle = AcquisitionHandle::new(Duration::from_secs(1));
        handle.finish(Ok(AcquisitionResult {
            data: Vec::new(),
            error: None,
        }));
        assert_eq!(handle.state(), TaskState::Finished);
        assert!(!handle.cancel());
        assert!(!handle.token().is_cancelled());
        assert_eq!(handle.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn test_cancel_idempotent() {
        let handle = AcquisitionHandle::new(Duration::from_secs(1));
        assert!(handle.cancel());
        assert!(handle.cancel());
        assert!(handle.token().is_cancelled());
        handle.finish(Err(AcqError::Cancelled));
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(handle.result(None).await, Err(AcqError::Cancelled));
    }

    #[tokio::test]
    async fn test_result_timeout() {
        let handle = AcquisitionHandle::new(Duration::from_secs(1));
        let waited = handle.result(Some(Duration::from_millis(20))).await;
        assert_eq!(waited, Err(AcqError::WaitTimeout(Duration::from_millis(20))));
        assert!(handle.try_result().is_none());
    }

    #[tokio::test]
    async fn test_result_read_twice() {
        let handle = AcquisitionHandle::new(Duration::from_secs(1));
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.result(None).await })
        };
        handle.finish(Ok(partial()));
        handle.finish(Err(AcqError::Hardware("late".into())));
        assert_eq!(waiter.await.unwrap(), Ok(partial()));
        assert_eq!(handle.result(None).await, Ok(partial()));
    }

    #[test]
    fn test_done_callbacks_run_once() {
        let handle = AcquisitionHandle::new(Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let before = calls.clone();
        handle.add_done_callback(move |_| {
            before.fetch_add(1, Ordering::SeqCst);
        });
        handle.finish(Ok(partial()));
        handle.finish(Ok(partial()));
        let after = calls.clone();
        handle.add_done_callback(move |outcome| {
            assert!(outcome.as_ref().is_ok_and(|r| !r.is_complete()));
            after.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_progress_fraction() {
        let handle = AcquisitionHandle::new(Duration::from_secs(10));
        let p = handle.progress();
        assert_eq!(p.fraction(p.start), 0.0);
        assert_eq!(p.fraction(p.end + chrono::Duration::seconds(1)), 1.0);
        let end = p.start + chrono::Duration::seconds(20);
        handle.set_progress(end);
        assert_eq!(handle.progress().end, end);
    }
}
