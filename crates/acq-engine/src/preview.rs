//! Low-frequency live preview.
//!
//! The preview task waits for the live store to change, renders a snapshot
//! and then sleeps what is left of the preview period, so a sink is called at
//! most once per period whatever the frame rate. It is cancelled and joined
//! by the acquisition before the live buffers are taken for finalization.

use crate::live::{LivePreview, LiveStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Receiver of live projections.
///
/// `render` is called from the preview task; it should return quickly.
pub trait PreviewSink: Send + Sync {
    /// Latest projection of every stream with its acquired mask.
    fn render(&self, previews: &[LivePreview]);
}

/// Sink keeping only the last render, for polling callers.
#[derive(Debug, Default)]
pub struct LatestPreview {
    latest: parking_lot::Mutex<Vec<LivePreview>>,
    renders: std::sync::atomic::AtomicU64,
}

impl LatestPreview {
    /// Last rendered projections.
    pub fn latest(&self) -> Vec<LivePreview> {
        self.latest.lock().clone()
    }

    /// Number of renders so far.
    pub fn renders(&self) -> u64 {
        self.renders.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl PreviewSink for LatestPreview {
    fn render(&self, previews: &[LivePreview]) {
        *self.latest.lock() = previews.to_vec();
        self.renders.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }
}

/// Spawn the preview task of one acquisition.
pub(crate) fn spawn_preview(
    store: LiveStore,
    sink: Arc<dyn PreviewSink>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rendered = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = store.changed().notified() => {}
            }
            let started = Instant::now();
            let previews = store.snapshot();
            if !previews.is_empty() {
                sink.render(&previews);
                rendered += 1;
                trace!(streams = previews.len(), version = store.version(), "Preview rendered");
            }
            let rest = period.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(rest) => {}
            }
        }
        debug!(rendered, "Preview stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Roi, ScanGeometry, ScanGrid};
    use crate::live::LiveAssembler;
    use acq_core::data::{DataArray, Metadata};

    #[tokio::test]
    async fn test_renders_throttled_and_stops() {
        let grid = ScanGrid::new(ScanGeometry {
            roi: Roi::FULL,
            repetition: (8, 1),
            pixel_size: 1.0,
            field_of_view: (8.0, 1.0),
        });
        let mut live = LiveAssembler::new(grid, vec!["s".into()], 1);
        let sink = Arc::new(LatestPreview::default());
        let token = CancellationToken::new();
        let task = spawn_preview(live.store(), sink.clone(), Duration::from_millis(200), token.clone());

        for i in 0..8 {
            live.push(0, 0, i, &DataArray::point(i as f64, Metadata::default())).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        task.await.unwrap();

        // Eight updates within one period give at most two renders.
        let renders = sink.renders();
        assert!((1..=2).contains(&renders), "renders = {}", renders);
        let latest = sink.latest();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].image.dim(), (1, 8));
    }
}
