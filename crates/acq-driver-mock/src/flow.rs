//! Data flow shared by all simulated detectors.
//!
//! A [`MockDataFlow`] owns the observer registry and the trigger mode, and
//! runs one worker task while at least one observer is subscribed:
//!
//! - **Continuous**: acquire back to back
//! - **Software**: acquire once per queued [`DataFlow::trigger`] call
//! - **Hardware**: acquire once per tick of the scanner's pixel event
//!
//! The worker asks a [`FrameSource`] for each frame. Unsubscribing the last
//! observer aborts the worker, discarding any frame in progress.

use acq_core::capabilities::{
    DataFlow, DataObserver, ObserverHandle, PixelTick, TriggerMode, TriggerSupport,
};
use acq_core::data::DataArray;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type ObserverRegistry = Arc<RwLock<Vec<(u64, Arc<dyn DataObserver>)>>>;

/// Produces the frames of a simulated detector.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    /// Acquire one frame. `tick` is set in hardware-triggered mode.
    /// `Ok(None)` means the frame was lost.
    async fn acquire(&self, tick: Option<PixelTick>) -> Result<Option<DataArray>>;
}

enum Worker {
    Idle,
    Running {
        handle: JoinHandle<()>,
        triggers: Option<mpsc::UnboundedSender<()>>,
    },
}

/// Push-based data flow of a simulated detector.
pub struct MockDataFlow {
    name: String,
    source: Arc<dyn FrameSource>,
    support: TriggerSupport,
    observers: ObserverRegistry,
    next_id: AtomicU64,
    mode: Mutex<TriggerMode>,
    worker: Mutex<Worker>,
}

impl MockDataFlow {
    /// Create a data flow backed by `source`.
    pub fn new(name: impl Into<String>, source: Arc<dyn FrameSource>, support: TriggerSupport) -> Self {
        Self {
            name: name.into(),
            source,
            support,
            observers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            mode: Mutex::new(TriggerMode::Continuous),
            worker: Mutex::new(Worker::Idle),
        }
    }

    fn start_worker(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| anyhow!("Data flow '{}' needs a tokio runtime", self.name))?;
        let mode = self.mode.lock().clone();
        let source = self.source.clone();
        let observers = self.observers.clone();
        let name = self.name.clone();

        let worker = match mode {
            TriggerMode::Continuous => Worker::Running {
                handle: runtime.spawn(async move {
                    loop {
                        if !deliver(&name, source.as_ref(), &observers, None).await {
                            break;
                        }
                    }
                }),
                triggers: None,
            },
            TriggerMode::Software => {
                let (tx, mut rx) = mpsc::unbounded_channel::<()>();
                Worker::Running {
                    handle: runtime.spawn(async move {
                        while rx.recv().await.is_some() {
                            deliver(&name, source.as_ref(), &observers, None).await;
                        }
                    }),
                    triggers: Some(tx),
                }
            }
            TriggerMode::Hardware(event) => {
                let mut ticks = event.subscribe();
                Worker::Running {
                    handle: runtime.spawn(async move {
                        loop {
                            match ticks.recv().await {
                                Ok(tick) => {
                                    deliver(&name, source.as_ref(), &observers, Some(tick)).await;
                                }
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    warn!(flow = %name, missed = n, "Missed pixel events");
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }),
                    triggers: None,
                }
            }
        };
        *self.worker.lock() = worker;
        Ok(())
    }

    fn stop_worker(&self) {
        if let Worker::Running { handle, .. } = std::mem::replace(&mut *self.worker.lock(), Worker::Idle) {
            handle.abort();
        }
    }
}

impl Drop for MockDataFlow {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Acquire one frame and hand it to every observer. Returns false when the
/// source failed.
async fn deliver(
    name: &str,
    source: &dyn FrameSource,
    observers: &ObserverRegistry,
    tick: Option<PixelTick>,
) -> bool {
    match source.acquire(tick).await {
        Ok(Some(data)) => {
            let targets: Vec<Arc<dyn DataObserver>> =
                observers.read().iter().map(|(_, o)| o.clone()).collect();
            for observer in targets {
                observer.on_data(data.clone());
            }
            true
        }
        Ok(None) => {
            debug!(flow = %name, "Frame lost");
            true
        }
        Err(e) => {
            warn!(flow = %name, error = %e, "Acquisition failed");
            false
        }
    }
}

#[async_trait]
impl DataFlow for MockDataFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, observer: Arc<dyn DataObserver>) -> Result<ObserverHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut observers = self.observers.write();
            observers.push((id, observer));
            observers.len() == 1
        };
        if first {
            if let Err(e) = self.start_worker() {
                self.observers.write().retain(|(oid, _)| *oid != id);
                return Err(e);
            }
        }
        Ok(ObserverHandle::new(id))
    }

    async fn unsubscribe(&self, handle: ObserverHandle) -> Result<()> {
        let empty = {
            let mut observers = self.observers.write();
            observers.retain(|(id, _)| *id != handle.id());
            observers.is_empty()
        };
        if empty {
            self.stop_worker();
        }
        Ok(())
    }

    fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    fn trigger_support(&self) -> TriggerSupport {
        self.support
    }

    fn trigger_mode(&self) -> TriggerMode {
        self.mode.lock().clone()
    }

    async fn synchronize_on(&self, mode: TriggerMode) -> Result<()> {
        let accepted = match mode {
            TriggerMode::Continuous => true,
            TriggerMode::Software => self.support.software,
            TriggerMode::Hardware(_) => self.support.hardware,
        };
        if !accepted {
            return Err(anyhow!(
                "Data flow '{}' does not support {} trigger",
                self.name,
                mode.label()
            ));
        }
        *self.mode.lock() = mode;
        if self.observer_count() > 0 {
            self.stop_worker();
            self.start_worker()?;
        }
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        if !matches!(*self.mode.lock(), TriggerMode::Software) {
            return Err(anyhow!("Data flow '{}' is not software triggered", self.name));
        }
        match &*self.worker.lock() {
            Worker::Running {
                triggers: Some(tx), ..
            } => {
                let _ = tx.send(());
            }
            _ => debug!(flow = %self.name, "Trigger ignored: no observer"),
        }
        Ok(())
    }
}
