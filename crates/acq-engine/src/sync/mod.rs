//! Detector synchronization.
//!
//! Two strategies put scan positions and detector captures in lock-step:
//!
//! - [`SoftwareTriggeredStep`]: arm, move, trigger and wait for every
//!   detector at each position, with per-position retries
//! - [`HardwareTriggeredBlock`]: detectors follow the scanner's per-pixel
//!   event while the scanner rasters the whole grid unattended
//!
//! Detector callbacks only push into a [`DetectorChannel`] queue; the
//! acquisition task is the single consumer.

mod hardware;
mod software;

pub use hardware::HardwareTriggeredBlock;
pub use software::{StepOutcome, StepTarget, SoftwareTriggeredStep};

use acq_core::capabilities::{DataFlow, DataObserver, ObserverHandle};
use acq_core::data::DataArray;
use acq_core::error::{AcqError, AcqResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Observer pushing frames tagged with the subscription they arrived on.
struct ChannelObserver {
    name: String,
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, DataArray)>,
}

impl DataObserver for ChannelObserver {
    fn on_data(&self, data: DataArray) {
        let _ = self.tx.send((self.generation, data));
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Completion queue of one detector.
///
/// Every subscription gets a new generation number; frames from an earlier
/// subscription (a late frame of a retried step) are dropped on receipt.
pub struct DetectorChannel {
    stream: String,
    flow: Arc<dyn DataFlow>,
    tx: mpsc::UnboundedSender<(u64, DataArray)>,
    rx: mpsc::UnboundedReceiver<(u64, DataArray)>,
    generation: u64,
    handle: Option<ObserverHandle>,
}

impl std::fmt::Debug for DetectorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorChannel")
            .field("stream", &self.stream)
            .field("generation", &self.generation)
            .field("subscribed", &self.handle.is_some())
            .finish()
    }
}

impl DetectorChannel {
    /// Channel for the data flow of stream `stream`.
    pub fn new(stream: impl Into<String>, flow: Arc<dyn DataFlow>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            stream: stream.into(),
            flow,
            tx,
            rx,
            generation: 0,
            handle: None,
        }
    }

    /// Stream name.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// The data flow.
    pub fn flow(&self) -> &Arc<dyn DataFlow> {
        &self.flow
    }

    /// Whether an observer is currently subscribed.
    pub fn is_subscribed(&self) -> bool {
        self.handle.is_some()
    }

    /// Subscribe a fresh observer. No-op when already subscribed.
    pub async fn subscribe(&mut self) -> AcqResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.generation += 1;
        let observer = Arc::new(ChannelObserver {
            name: format!("{}#{}", self.stream, self.generation),
            generation: self.generation,
            tx: self.tx.clone(),
        });
        self.handle = Some(self.flow.subscribe(observer).await?);
        trace!(stream = %self.stream, generation = self.generation, "Subscribed");
        Ok(())
    }

    /// Remove the observer. No-op when not subscribed.
    pub async fn unsubscribe(&mut self) -> AcqResult<()> {
        if let Some(handle) = self.handle.take() {
            self.flow.unsubscribe(handle).await?;
            trace!(stream = %self.stream, "Unsubscribed");
        }
        Ok(())
    }

    /// Drop every queued frame.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(stream = %self.stream, dropped, "Discarded stale frames");
        }
        dropped
    }

    /// Next frame of the current subscription.
    ///
    /// Returns `Ok(None)` once `deadline` passes and
    /// [`AcqError::Cancelled`] as soon as `token` is cancelled.
    pub async fn recv(&mut self, deadline: Instant, token: &CancellationToken) -> AcqResult<Option<DataArray>> {
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(AcqError::Cancelled),
                item = tokio::time::timeout_at(deadline, self.rx.recv()) => item,
            };
            match item {
                Err(_) => return Ok(None),
                // Cannot happen: the channel keeps its own sender.
                Ok(None) => return Ok(None),
                Ok(Some((generation, data))) if generation == self.generation => return Ok(Some(data)),
                Ok(Some(_)) => trace!(stream = %self.stream, "Dropped frame of an earlier subscription"),
            }
        }
    }

    /// [`recv`](Self::recv) with a relative timeout.
    pub async fn recv_timeout(&mut self, timeout: Duration, token: &CancellationToken) -> AcqResult<Option<DataArray>> {
        self.recv(Instant::now() + timeout, token).await
    }
}

impl Drop for DetectorChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let flow = self.flow.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = flow.unsubscribe(handle).await;
                });
            }
        }
    }
}

/// Subscribe every channel, unsubscribing the ones already done on failure.
pub(crate) async fn subscribe_all(channels: &mut [DetectorChannel]) -> AcqResult<()> {
    for i in 0..channels.len() {
        if let Err(e) = channels[i].subscribe().await {
            for channel in channels[..i].iter_mut() {
                let _ = channel.unsubscribe().await;
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Unsubscribe every channel, returning the first error after trying all.
pub(crate) async fn unsubscribe_all(channels: &mut [DetectorChannel]) -> AcqResult<()> {
    let mut first = None;
    for channel in channels.iter_mut() {
        if let Err(e) = channel.unsubscribe().await {
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Wait until `duration` elapsed or the token is cancelled.
pub(crate) async fn sleep_cancellable(duration: Duration, token: &CancellationToken) -> AcqResult<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AcqError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run a hardware future, interrupting it when the token is cancelled.
pub(crate) async fn cancellable<T, F>(future: F, token: &CancellationToken) -> AcqResult<T>
where
    F: std::future::Future<Output = AcqResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AcqError::Cancelled),
        result = future => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::capabilities::{TriggerMode, TriggerSupport};
    use acq_core::data::Metadata;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Data flow whose observers are driven by the test.
    #[derive(Default)]
    struct ManualFlow {
        observers: Mutex<Vec<(u64, Arc<dyn DataObserver>)>>,
        next: Mutex<u64>,
    }

    impl ManualFlow {
        fn push(&self, value: f64) {
            for (_, o) in self.observers.lock().iter() {
                o.on_data(DataArray::point(value, Metadata::default()));
            }
        }
    }

    #[async_trait]
    impl DataFlow for ManualFlow {
        fn name(&self) -> &str {
            "manual"
        }
        async fn subscribe(&self, observer: Arc<dyn DataObserver>) -> anyhow::Result<ObserverHandle> {
            let mut next = self.next.lock();
            *next += 1;
            self.observers.lock().push((*next, observer));
            Ok(ObserverHandle::new(*next))
        }
        async fn unsubscribe(&self, handle: ObserverHandle) -> anyhow::Result<()> {
            self.observers.lock().retain(|(id, _)| *id != handle.id());
            Ok(())
        }
        fn observer_count(&self) -> usize {
            self.observers.lock().len()
        }
        fn trigger_support(&self) -> TriggerSupport {
            TriggerSupport::default()
        }
        fn trigger_mode(&self) -> TriggerMode {
            TriggerMode::Continuous
        }
        async fn synchronize_on(&self, _mode: TriggerMode) -> anyhow::Result<()> {
            Ok(())
        }
        async fn trigger(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stale_generation_dropped() {
        let flow = Arc::new(ManualFlow::default());
        let mut channel = DetectorChannel::new("s", flow.clone());
        let token = CancellationToken::new();
        channel.subscribe().await.unwrap();

        // A frame pushed by the first observer after the resubscription.
        let stale = flow.observers.lock()[0].1.clone();
        channel.unsubscribe().await.unwrap();
        channel.subscribe().await.unwrap();
        stale.on_data(DataArray::point(1.0, Metadata::default()));
        flow.push(2.0);

        let frame = channel
            .recv_timeout(Duration::from_millis(200), &token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.mean(), 2.0);
    }

    #[tokio::test]
    async fn test_recv_times_out_and_cancels() {
        let flow = Arc::new(ManualFlow::default());
        let mut channel = DetectorChannel::new("s", flow);
        let token = CancellationToken::new();
        channel.subscribe().await.unwrap();
        assert!(channel
            .recv_timeout(Duration::from_millis(20), &token)
            .await
            .unwrap()
            .is_none());

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = channel
            .recv_timeout(Duration::from_secs(30), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_clear_and_unsubscribe() {
        let flow = Arc::new(ManualFlow::default());
        let mut channel = DetectorChannel::new("s", flow.clone());
        channel.subscribe().await.unwrap();
        channel.subscribe().await.unwrap();
        assert_eq!(flow.observer_count(), 1);
        flow.push(1.0);
        flow.push(2.0);
        assert_eq!(channel.clear(), 2);
        channel.unsubscribe().await.unwrap();
        assert_eq!(flow.observer_count(), 0);
        assert!(!channel.is_subscribed());
    }
}
