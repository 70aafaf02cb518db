//! Hardware-triggered block: the scanner clocks the detectors.
//!
//! The synchronized detectors capture one frame per tick of the scanner's
//! per-pixel event. The leading (scan-driven) detector is triggered once and
//! the scanner rasters the whole grid unattended; the engine only drains the
//! queues, one frame per grid position and detector, each dequeue bounded by
//! its own timeout. No per-position retry is possible in this mode.

use super::{cancellable, subscribe_all, unsubscribe_all, DetectorChannel};
use crate::config::EngineConfig;
use acq_core::data::DataArray;
use acq_core::error::{AcqError, AcqResult};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One raster of the whole grid with frame-clocked detectors.
pub struct HardwareTriggeredBlock {
    leading: DetectorChannel,
    synced: Vec<DetectorChannel>,
    pixel_time: Duration,
    config: EngineConfig,
}

impl std::fmt::Debug for HardwareTriggeredBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareTriggeredBlock")
            .field("leading", &self.leading)
            .field("synced", &self.synced)
            .field("pixel_time", &self.pixel_time)
            .finish()
    }
}

impl HardwareTriggeredBlock {
    /// Block driven by `leading`'s raster, draining `synced`.
    ///
    /// The data flows of `synced` must already be synchronized on the
    /// scanner's pixel event, with the event output enabled.
    pub fn new(
        leading: DetectorChannel,
        synced: Vec<DetectorChannel>,
        pixel_time: Duration,
        config: EngineConfig,
    ) -> Self {
        Self {
            leading,
            synced,
            pixel_time,
            config,
        }
    }

    /// Unsubscribe everything.
    pub async fn release(&mut self) -> AcqResult<()> {
        let synced = unsubscribe_all(&mut self.synced).await;
        let leading = self.leading.unsubscribe().await;
        synced.and(leading)
    }

    /// Raster `positions` pixels. `on_pixel(channel, index, frame)` receives
    /// every synchronized frame in grid order (channel 0 is the first
    /// synchronized detector) and `on_position(index)` follows once every
    /// detector delivered `index`. The leading detector's raster is returned.
    pub async fn run<F, P>(
        &mut self,
        positions: usize,
        token: &CancellationToken,
        mut on_pixel: F,
        mut on_position: P,
    ) -> AcqResult<DataArray>
    where
        F: FnMut(usize, usize, DataArray) -> AcqResult<()>,
        P: FnMut(usize),
    {
        let result = self.drain(positions, token, &mut on_pixel, &mut on_position).await;
        let released = self.release().await;
        let raster = result?;
        released?;
        Ok(raster)
    }

    async fn drain<F, P>(
        &mut self,
        positions: usize,
        token: &CancellationToken,
        on_pixel: &mut F,
        on_position: &mut P,
    ) -> AcqResult<DataArray>
    where
        F: FnMut(usize, usize, DataArray) -> AcqResult<()>,
        P: FnMut(usize),
    {
        for channel in self.synced.iter_mut() {
            channel.clear();
        }
        self.leading.clear();
        // Listeners first, so no tick is fired before they are ready.
        subscribe_all(&mut self.synced).await?;
        self.leading.subscribe().await?;

        let flow = self.leading.flow().clone();
        cancellable(async { flow.trigger().await.map_err(AcqError::from) }, token).await?;
        let started = Instant::now();
        info!(
            positions,
            detectors = self.synced.len(),
            pixel_ms = self.pixel_time.as_secs_f64() * 1e3,
            "Hardware-triggered raster started"
        );

        let per_dequeue = self.pixel_time + self.config.dequeue_margin;
        for index in 0..positions {
            for (c, channel) in self.synced.iter_mut().enumerate() {
                let deadline = Instant::now() + per_dequeue;
                match channel.recv(deadline, token).await? {
                    Some(frame) => on_pixel(c, index, frame)?,
                    None => {
                        return Err(AcqError::Timeout {
                            detector: channel.stream().to_string(),
                            index,
                            attempts: 1,
                        })
                    }
                }
            }
            if !self.synced.is_empty() {
                on_position(index);
            }
        }

        // Alone, the leading detector is the only clock: wait out the whole raster.
        let deadline = if self.synced.is_empty() {
            started + self.pixel_time * positions as u32 + per_dequeue + self.config.timeout_margin
        } else {
            Instant::now() + per_dequeue + self.config.timeout_margin
        };
        let raster = self.leading.recv(deadline, token).await?.ok_or_else(|| AcqError::Timeout {
            detector: self.leading.stream().to_string(),
            index: positions.saturating_sub(1),
            attempts: 1,
        })?;
        if self.synced.is_empty() {
            for index in 0..positions {
                on_position(index);
            }
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Hardware-triggered raster drained");
        Ok(raster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::capabilities::{names, Detector, Parameterized, TriggerMode};
    use acq_driver_mock::{MockScanDetector, MockScanner};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_leading_only_raster_reports_every_position() {
        let scanner = Arc::new(MockScanner::builder().shape(64, 64).build());
        let params = scanner.parameters();
        params.get_typed::<(u32, u32)>(names::RESOLUTION).unwrap().set((4, 3)).unwrap();
        params.get_typed::<f64>(names::DWELL_TIME).unwrap().set(5e-3).unwrap();
        let se = MockScanDetector::new("se", scanner.clone());
        let flow = se.data_flow();
        flow.synchronize_on(TriggerMode::Software).await.unwrap();

        let config = EngineConfig {
            dequeue_margin: Duration::from_millis(5),
            timeout_margin: Duration::from_millis(30),
            ..Default::default()
        };
        let mut block =
            HardwareTriggeredBlock::new(DetectorChannel::new("se", flow), Vec::new(), Duration::from_millis(5), config);
        let mut reported = Vec::new();
        let raster = block
            .run(12, &CancellationToken::new(), |_, _, _| Ok(()), |index| reported.push(index))
            .await
            .unwrap();

        assert_eq!(raster.shape(), &[3, 4]);
        assert_eq!(reported, (0..12).collect::<Vec<_>>());
        assert!(!block.leading.is_subscribed());
    }
}
