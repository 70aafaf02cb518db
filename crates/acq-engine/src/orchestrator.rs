//! Acquisition orchestrator.
//!
//! [`acquire`] validates a request, resolves it once into a [`TaskPlan`] and
//! spawns one task running it. The caller gets an [`AcquisitionHandle`].
//!
//! ```text
//!  resolve plan ─▶ apply settings ─▶ start leeches
//!                                        │
//!        ┌───────── for each auxiliary position ◀──────┐
//!        ▼                                             │
//!   move aux ─▶ software steps (+ leech checkpoints) ──┤
//!           └─▶ or one hardware-triggered raster ──────┘
//!                                        │
//!  unlink ◀─ restore settings ◀─ stop preview ◀─ finalize + leech data
//! ```
//!
//! Cleanup runs on every exit path. When the task stops early after having
//! acquired something, the partial result set is returned together with the
//! error; with nothing acquired the error alone is returned.

use crate::config::EngineConfig;
use crate::finalize::assemble;
use crate::geometry::{
    resolve_geometry, to_translation, PixelScan, Roi, Sampling, ScanGeometry, ScanGrid, ScanLimits,
};
use crate::handle::{AcquisitionHandle, AcquisitionResult};
use crate::leech::{Leech, LeechScheduler};
use crate::live::LiveAssembler;
use crate::preview::{spawn_preview, PreviewSink};
use crate::settings::HardwareSettingsSession;
use crate::sync::{
    cancellable, sleep_cancellable, DetectorChannel, HardwareTriggeredBlock, SoftwareTriggeredStep, StepTarget,
};
use acq_core::capabilities::{names, AuxiliaryAxis, DetectorDrive, Movable, Scanner, TriggerMode};
use acq_core::error::{AcqError, AcqResult};
use acq_core::limits::AUX_MOVE_ESTIMATE;
use acq_core::stream::{SettingRole, Stream};
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Dwell time used when neither the request nor the emitter provides one.
const DEFAULT_DWELL: f64 = 1e-6;

/// Settings the acquisition drives itself; local settings of the same name
/// are not mirrored while it runs.
const MANAGED_SETTINGS: [&str; 6] = [
    names::SCALE,
    names::RESOLUTION,
    names::TRANSLATION,
    names::DWELL_TIME,
    names::PIXEL_TRIGGER,
    names::EXPOSURE_TIME,
];

// =============================================================================
// Request
// =============================================================================

/// Two motion axes moving the specimen under a fixed beam.
#[derive(Clone)]
pub struct ScanStage {
    /// Horizontal axis (m).
    pub x: Arc<dyn Movable>,
    /// Vertical axis (m, Y up).
    pub y: Arc<dyn Movable>,
}

impl std::fmt::Debug for ScanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanStage")
            .field("x", &self.x.name())
            .field("y", &self.y.name())
            .finish()
    }
}

/// Positions of an auxiliary axis to acquire the whole grid at.
#[derive(Clone)]
pub struct AuxSequence {
    /// Axis to move.
    pub axis: Arc<dyn AuxiliaryAxis>,
    /// Named positions, in acquisition order.
    pub positions: Vec<String>,
}

impl std::fmt::Debug for AuxSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuxSequence")
            .field("axis", &self.axis.name())
            .field("positions", &self.positions)
            .finish()
    }
}

/// Everything an acquisition needs.
///
/// The first stream leads: its emitter is scanned and, in hardware-triggered
/// mode, its detector clocks the others.
#[derive(Clone)]
pub struct AcquisitionRequest {
    /// Streams to acquire, leading stream first.
    pub streams: Vec<Arc<Stream>>,
    /// Region of interest ([`Roi::UNDEFINED`] for the whole field).
    pub roi: Roi,
    /// Grid density.
    pub sampling: Sampling,
    /// Time per scan position (s); the emitter's value when `None`.
    pub dwell_time: Option<f64>,
    /// Effective exposure of exposure-driven detectors (s); each detector's
    /// own value when `None`.
    pub exposure_time: Option<f64>,
    /// Optional auxiliary sequence.
    pub aux: Option<AuxSequence>,
    /// Periodic callouts.
    pub leeches: Vec<Arc<dyn Leech>>,
    /// Reach positions with a stage instead of the beam.
    pub scan_stage: Option<ScanStage>,
    /// Prefer the hardware-triggered strategy when possible.
    pub hardware_sync: bool,
    /// Live preview receiver.
    pub preview: Option<Arc<dyn PreviewSink>>,
}

impl std::fmt::Debug for AcquisitionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionRequest")
            .field("streams", &self.streams.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("roi", &self.roi)
            .field("sampling", &self.sampling)
            .field("aux", &self.aux)
            .field("leeches", &self.leeches.len())
            .field("scan_stage", &self.scan_stage)
            .field("hardware_sync", &self.hardware_sync)
            .finish_non_exhaustive()
    }
}

impl AcquisitionRequest {
    /// Single-position request over the whole field; refine it with the
    /// builder methods.
    pub fn new(streams: Vec<Arc<Stream>>) -> Self {
        Self {
            streams,
            roi: Roi::UNDEFINED,
            sampling: Sampling::Repetition(1, 1),
            dwell_time: None,
            exposure_time: None,
            aux: None,
            leeches: Vec::new(),
            scan_stage: None,
            hardware_sync: false,
            preview: None,
        }
    }

    /// Set the region of interest.
    pub fn roi(mut self, roi: Roi) -> Self {
        self.roi = roi;
        self
    }

    /// Scan `x × y` positions.
    pub fn repetition(mut self, x: u32, y: u32) -> Self {
        self.sampling = Sampling::Repetition(x, y);
        self
    }

    /// Scan with a fixed distance between positions (m).
    pub fn pixel_size(mut self, size: f64) -> Self {
        self.sampling = Sampling::PixelSize(size);
        self
    }

    /// Set the dwell time per position (s).
    pub fn dwell_time(mut self, seconds: f64) -> Self {
        self.dwell_time = Some(seconds);
        self
    }

    /// Set the effective exposure time (s).
    pub fn exposure_time(mut self, seconds: f64) -> Self {
        self.exposure_time = Some(seconds);
        self
    }

    /// Acquire the grid at each of `positions` of `axis`.
    pub fn aux(mut self, axis: Arc<dyn AuxiliaryAxis>, positions: Vec<String>) -> Self {
        self.aux = Some(AuxSequence { axis, positions });
        self
    }

    /// Add a leech.
    pub fn leech(mut self, leech: Arc<dyn Leech>) -> Self {
        self.leeches.push(leech);
        self
    }

    /// Move a stage instead of the beam.
    pub fn scan_stage(mut self, stage: ScanStage) -> Self {
        self.scan_stage = Some(stage);
        self
    }

    /// Prefer hardware triggering.
    pub fn hardware_sync(mut self, enabled: bool) -> Self {
        self.hardware_sync = enabled;
        self
    }

    /// Send live projections to `sink`.
    pub fn preview(mut self, sink: Arc<dyn PreviewSink>) -> Self {
        self.preview = Some(sink);
        self
    }

    fn leading(&self) -> AcqResult<&Arc<Stream>> {
        self.streams
            .first()
            .ok_or_else(|| AcqError::Configuration("No stream to acquire".into()))
    }

    fn validate(&self) -> AcqResult<()> {
        let leading = self.leading()?;
        for stream in &self.streams[1..] {
            if !same_device(stream.emitter(), leading.emitter()) {
                return Err(AcqError::Configuration(format!(
                    "Stream '{}' uses emitter '{}', expected '{}'",
                    stream.name(),
                    stream.emitter().name(),
                    leading.emitter().name()
                )));
            }
        }
        let mut seen = HashSet::new();
        if let Some(name) = self.streams.iter().map(|s| s.name()).find(|n| !seen.insert(*n)) {
            return Err(AcqError::Configuration(format!("Stream '{}' requested twice", name)));
        }
        if let Some(aux) = &self.aux {
            if aux.positions.is_empty() {
                return Err(AcqError::Configuration(format!(
                    "Empty position list for auxiliary axis '{}'",
                    aux.axis.name()
                )));
            }
            let choices = aux.axis.choices();
            if let Some(bad) = aux.positions.iter().find(|p| !choices.is_empty() && !choices.contains(p)) {
                return Err(AcqError::Configuration(format!(
                    "Auxiliary axis '{}' has no position '{}'",
                    aux.axis.name(),
                    bad
                )));
            }
        }
        for value in [self.dwell_time, self.exposure_time].into_iter().flatten() {
            if !(value.is_finite() && value > 0.0) {
                return Err(AcqError::Configuration(format!("Times must be positive, got {}", value)));
            }
        }
        Ok(())
    }
}

fn same_device<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// =============================================================================
// Plan
// =============================================================================

/// How detectors are kept in step with the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// One software trigger per position and detector.
    Software,
    /// Detectors follow the emitter's per-pixel event over one raster.
    Hardware,
}

/// A request resolved against the hardware, once, before anything moves.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPlan {
    /// Consistent scan geometry.
    pub geometry: ScanGeometry,
    /// Synchronization strategy.
    pub strategy: SyncStrategy,
    /// Sub-exposures per position.
    pub integration: u32,
    /// Emitter settings for one position (software strategy).
    pub pixel_scan: PixelScan,
    /// Emitter dwell per scanned pixel (s).
    pub scanner_dwell: f64,
    /// Exposure to apply per stream (s), already divided by `integration`.
    pub exposures: Vec<Option<f64>>,
    /// Expected duration of one step (one sub-exposure of one position, or
    /// one pixel of the hardware raster).
    pub step_duration: Duration,
    /// Auxiliary positions (1 without sequence).
    pub aux_len: usize,
}

impl TaskPlan {
    /// Resolve `request`.
    ///
    /// # Errors
    /// [`AcqError::Configuration`] for an inconsistent request.
    pub fn resolve(request: &AcquisitionRequest) -> AcqResult<Self> {
        let leading = request.leading()?;
        let emitter = leading.emitter();
        let limits = ScanLimits::from_scanner(emitter.as_ref());
        let geometry = resolve_geometry(request.roi, request.sampling, &limits)?;

        let caps = leading.capabilities();
        let fuzzing = leading.policy().fuzzing && caps.fuzzing;
        if leading.policy().fuzzing && !caps.fuzzing {
            warn!(stream = %leading.name(), "Fuzzing not supported, scanning whole pixels");
        }

        let dwell = request
            .dwell_time
            .or_else(|| local_f64(leading, SettingRole::Emitter, names::DWELL_TIME))
            .or_else(|| current_f64(emitter.parameters(), names::DWELL_TIME))
            .unwrap_or(DEFAULT_DWELL);

        // Requested effective exposure per stream and the integration it needs.
        let mut requested = Vec::with_capacity(request.streams.len());
        let mut integration = 1u32;
        for stream in &request.streams {
            let detector = stream.detector();
            let exposure = if detector.drive() == DetectorDrive::Exposure
                && detector.parameters().contains(names::EXPOSURE_TIME)
            {
                request
                    .exposure_time
                    .or_else(|| local_f64(stream, SettingRole::Detector, names::EXPOSURE_TIME))
                    .or_else(|| current_f64(detector.parameters(), names::EXPOSURE_TIME))
            } else {
                None
            };
            if let (Some(exp), Some(max), true) =
                (exposure, detector.max_exposure(), stream.capabilities().integration)
            {
                if max > 0.0 && exp > max {
                    integration = integration.max((exp / max).ceil() as u32);
                }
            }
            requested.push(exposure);
        }
        let exposures: Vec<Option<f64>> = requested
            .iter()
            .map(|e| e.map(|t| t / integration as f64))
            .collect();
        let slowest_exposure = request
            .streams
            .iter()
            .zip(&exposures)
            .filter_map(|(s, e)| e.map(|t| t + s.detector().readout_time()))
            .fold(0.0, f64::max);
        let position_time = dwell.max(slowest_exposure);

        let strategy = match (request.hardware_sync, hardware_blocker(request, integration, fuzzing)) {
            (true, None) => SyncStrategy::Hardware,
            (true, Some(reason)) => {
                info!(reason, "Hardware synchronization unavailable, using software triggers");
                SyncStrategy::Software
            }
            (false, _) => SyncStrategy::Software,
        };

        let pixel_scan = PixelScan::for_pixel(geometry.pixel_size, &limits, fuzzing);
        let sub_pixels = (pixel_scan.resolution.0 * pixel_scan.resolution.1).max(1) as f64;
        let scanner_dwell = match strategy {
            SyncStrategy::Software => position_time / sub_pixels,
            SyncStrategy::Hardware => position_time,
        };

        Ok(Self {
            geometry,
            strategy,
            integration,
            pixel_scan,
            scanner_dwell,
            exposures,
            step_duration: Duration::from_secs_f64(position_time),
            aux_len: request.aux.as_ref().map_or(1, |a| a.positions.len()),
        })
    }

    /// Steps of the whole task.
    pub fn total_steps(&self) -> usize {
        let per_aux = match self.strategy {
            SyncStrategy::Software => self.geometry.len() * self.integration as usize,
            SyncStrategy::Hardware => self.geometry.len(),
        };
        per_aux * self.aux_len
    }

    /// Expected time spent at one grid position.
    pub fn position_duration(&self) -> Duration {
        self.step_duration * self.integration
    }

    /// Expected duration of the task, leeches and auxiliary moves included.
    pub fn estimate(&self, leeches: &[Arc<dyn Leech>], has_aux: bool) -> Duration {
        let shape = (self.geometry.repetition.1 as usize, self.geometry.repetition.0 as usize);
        let steps = self.step_duration * self.total_steps() as u32;
        let extra = LeechScheduler::estimate_time(leeches, self.position_duration(), shape) * self.aux_len as u32;
        let moves = if has_aux {
            AUX_MOVE_ESTIMATE * self.aux_len as u32
        } else {
            Duration::ZERO
        };
        steps + extra + moves
    }
}

/// Why the hardware-triggered strategy cannot be used, if it cannot.
fn hardware_blocker(request: &AcquisitionRequest, integration: u32, fuzzing: bool) -> Option<&'static str> {
    let leading = request.streams.first()?;
    let emitter = leading.emitter();
    if !leading.capabilities().scan_driven {
        return Some("leading detector is not scan-driven");
    }
    if emitter.pixel_event().is_none() || !emitter.parameters().contains(names::PIXEL_TRIGGER) {
        return Some("emitter has no per-pixel event");
    }
    if request.streams[1..].iter().any(|s| !s.capabilities().hardware_trigger) {
        return Some("a detector cannot follow the pixel event");
    }
    if !request.leeches.is_empty() {
        return Some("leeches need software steps");
    }
    if integration > 1 {
        return Some("image integration needs software steps");
    }
    if fuzzing {
        return Some("fuzzing needs software steps");
    }
    if request.scan_stage.is_some() {
        return Some("scan stage needs software steps");
    }
    None
}

fn local_f64(stream: &Stream, role: SettingRole, name: &str) -> Option<f64> {
    stream.local_value(role, name).and_then(|v| v.as_f64())
}

fn current_f64(params: &acq_core::parameter::ParameterSet, name: &str) -> Option<f64> {
    params.get(name).and_then(|p| p.get_json().ok()).and_then(|v| v.as_f64())
}

// =============================================================================
// Emitter lease
// =============================================================================

static BUSY_EMITTERS: Lazy<Mutex<HashSet<usize>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive use of a scanning emitter, released on drop.
struct EmitterLease {
    key: usize,
    name: String,
}

impl EmitterLease {
    fn take(emitter: &Arc<dyn Scanner>) -> AcqResult<Self> {
        let key = Arc::as_ptr(emitter) as *const () as usize;
        if !BUSY_EMITTERS.lock().insert(key) {
            return Err(AcqError::EmitterBusy(emitter.name().to_string()));
        }
        Ok(Self {
            key,
            name: emitter.name().to_string(),
        })
    }
}

impl Drop for EmitterLease {
    fn drop(&mut self) {
        BUSY_EMITTERS.lock().remove(&self.key);
        debug!(emitter = %self.name, "Emitter released");
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Starts acquisitions with a fixed engine configuration.
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    config: EngineConfig,
}

impl Orchestrator {
    /// Orchestrator using `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Expected duration of `request`, without touching the hardware.
    pub fn estimate(&self, request: &AcquisitionRequest) -> AcqResult<Duration> {
        request.validate()?;
        let plan = TaskPlan::resolve(request)?;
        Ok(plan.estimate(&request.leeches, request.aux.is_some()))
    }

    /// Start acquiring `request`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// [`AcqError::Configuration`] for an invalid request and
    /// [`AcqError::EmitterBusy`] when another acquisition runs on the same
    /// emitter. Errors while acquiring are reported through the handle.
    pub fn acquire(&self, request: AcquisitionRequest) -> AcqResult<AcquisitionHandle> {
        self.config
            .validate()
            .map_err(|e| AcqError::Configuration(format!("{:#}", e)))?;
        request.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| AcqError::Configuration("Acquisitions need a tokio runtime".into()))?;
        let plan = TaskPlan::resolve(&request)?;
        let lease = EmitterLease::take(request.leading()?.emitter())?;

        let expected = plan.estimate(&request.leeches, request.aux.is_some());
        let handle = AcquisitionHandle::new(expected);
        info!(
            task = %handle.id(),
            streams = request.streams.len(),
            grid = ?plan.geometry.repetition,
            pixel_size = plan.geometry.pixel_size,
            strategy = ?plan.strategy,
            integration = plan.integration,
            expected_s = expected.as_secs_f64(),
            "Acquisition started"
        );

        let span = info_span!("acquisition", task = %handle.id());
        let config = self.config.clone();
        let task_handle = handle.clone();
        runtime.spawn(
            async move {
                let outcome = run_task(&request, &config, &plan, &task_handle).await;
                match &outcome {
                    Ok(result) => match &result.error {
                        None => info!(arrays = result.data.len(), "Acquisition completed"),
                        Some(e) => warn!(arrays = result.data.len(), error = %e, "Acquisition ended early with partial data"),
                    },
                    Err(e) if e.is_cancelled() => info!("Acquisition cancelled"),
                    Err(e) => warn!(error = %e, "Acquisition failed"),
                }
                drop(lease);
                task_handle.finish(outcome);
            }
            .instrument(span),
        );
        Ok(handle)
    }
}

/// Start acquiring `request` with `config`. See [`Orchestrator::acquire`].
pub fn acquire(request: AcquisitionRequest, config: EngineConfig) -> AcqResult<AcquisitionHandle> {
    Orchestrator::new(config).acquire(request)
}

/// Expected duration of `request`. See [`Orchestrator::estimate`].
pub fn estimate_acquisition_time(request: &AcquisitionRequest, config: &EngineConfig) -> AcqResult<Duration> {
    Orchestrator::new(config.clone()).estimate(request)
}

// =============================================================================
// Task
// =============================================================================

/// Running estimate of the end time; the first step is left out of the
/// average.
struct ProgressTracker {
    total: usize,
    done: usize,
    expected: Duration,
    measured: Duration,
    measured_steps: u32,
    extra: Duration,
}

impl ProgressTracker {
    fn new(plan: &TaskPlan, extra: Duration) -> Self {
        Self {
            total: plan.total_steps(),
            done: 0,
            expected: plan.step_duration,
            measured: Duration::ZERO,
            measured_steps: 0,
            extra,
        }
    }

    fn step_done(&mut self, elapsed: Duration, handle: &AcquisitionHandle) {
        self.done += 1;
        if self.done > 1 {
            self.measured += elapsed;
            self.measured_steps += 1;
        }
        let per_step = if self.measured_steps > 0 {
            self.measured / self.measured_steps
        } else {
            self.expected
        };
        let left = self.total.saturating_sub(self.done);
        let left_extra = if self.total > 0 {
            self.extra.mul_f64(left as f64 / self.total as f64)
        } else {
            Duration::ZERO
        };
        let remaining = per_step * left as u32 + left_extra;
        let end = Utc::now() + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero());
        handle.set_progress(end);
    }
}

struct TaskRun<'a> {
    request: &'a AcquisitionRequest,
    config: &'a EngineConfig,
    plan: &'a TaskPlan,
    handle: &'a AcquisitionHandle,
    token: CancellationToken,
    grid: ScanGrid,
    session: HardwareSettingsSession,
    live: LiveAssembler,
    scheduler: Option<LeechScheduler>,
    progress: ProgressTracker,
    stage_origin: (f64, f64),
    reactivate: Vec<Arc<Stream>>,
}

async fn run_task(
    request: &AcquisitionRequest,
    config: &EngineConfig,
    plan: &TaskPlan,
    handle: &AcquisitionHandle,
) -> AcqResult<AcquisitionResult> {
    let grid = ScanGrid::new(plan.geometry);
    let names = request.streams.iter().map(|s| s.name().to_string()).collect();
    let live = LiveAssembler::new(grid.clone(), names, plan.integration);
    let shape = grid.shape();
    let extra = LeechScheduler::estimate_time(&request.leeches, plan.position_duration(), shape) * plan.aux_len as u32;

    let preview_token = handle.token().child_token();
    let preview = request.preview.clone().map(|sink| {
        spawn_preview(
            live.store(),
            sink,
            config.effective_preview_period(),
            preview_token.clone(),
        )
    });

    let mut run = TaskRun {
        request,
        config,
        plan,
        handle,
        token: handle.token(),
        grid,
        session: HardwareSettingsSession::new(),
        live,
        scheduler: None,
        progress: ProgressTracker::new(plan, extra),
        stage_origin: (0.0, 0.0),
        reactivate: Vec::new(),
    };
    let outcome = run.execute().await;
    if let Err(e) = &outcome {
        debug!(error = %e, "Acquisition loop stopped");
    }

    // Cleanup, whatever happened.
    for stream in &request.streams {
        stream.unlink_local_settings();
    }
    let failures = run.session.restore().await;
    if failures > 0 {
        warn!(failures, "Some settings could not be restored");
    }
    for stream in &run.reactivate {
        stream.set_active(true);
    }
    preview_token.cancel();
    if let Some(task) = preview {
        if let Err(e) = task.await {
            warn!(error = %e, "Preview task failed");
        }
    }

    let TaskRun { live, scheduler, .. } = run;
    let error = outcome.err();
    if !live.has_data() {
        return match error {
            Some(e) => Err(e),
            None => Ok(AcquisitionResult {
                data: Vec::new(),
                error: None,
            }),
        };
    }
    let keep_separate: Vec<bool> = request.streams.iter().map(|s| s.policy().keep_separate).collect();
    let mut data = match assemble(live.into_buffers(), &keep_separate, plan.integration) {
        Ok(data) => data,
        Err(e) => return Err(error.unwrap_or(e)),
    };
    if let Some(scheduler) = &scheduler {
        let extra = scheduler.complete(&data).await;
        data.extend(extra);
    }
    Ok(AcquisitionResult { data, error })
}

impl TaskRun<'_> {
    fn leading(&self) -> &Arc<Stream> {
        // Validated non-empty before the task was spawned.
        &self.request.streams[0]
    }

    fn check_cancelled(&self) -> AcqResult<()> {
        if self.token.is_cancelled() {
            return Err(AcqError::Cancelled);
        }
        Ok(())
    }

    async fn execute(&mut self) -> AcqResult<()> {
        self.prepare_streams().await?;
        self.apply_emitter_settings()?;
        self.apply_detector_settings()?;
        self.synchronize_flows().await?;
        self.check_cancelled()?;

        if !self.request.leeches.is_empty() {
            let scheduler = LeechScheduler::start(
                &self.request.leeches,
                self.plan.position_duration(),
                self.grid.shape(),
                &self.token,
            )
            .await?;
            // A checkpoint may have moved the emitter.
            self.apply_step_settings()?;
            self.scheduler = Some(scheduler);
        }

        let labels: Vec<Option<String>> = match &self.request.aux {
            Some(aux) => aux.positions.iter().cloned().map(Some).collect(),
            None => vec![None],
        };
        for (aux_index, label) in labels.into_iter().enumerate() {
            self.check_cancelled()?;
            if let (Some(aux), Some(label)) = (&self.request.aux, label) {
                info!(axis = %aux.axis.name(), position = %label, index = aux_index, "Moving auxiliary axis");
                let axis = aux.axis.clone();
                let session = &mut self.session;
                cancellable(session.move_aux(axis, &label), &self.token).await?;
                if self.config.settle_time > Duration::ZERO {
                    sleep_cancellable(self.config.settle_time, &self.token).await?;
                }
                self.live.set_aux_label(aux_index, label);
            }
            match self.plan.strategy {
                SyncStrategy::Software => self.scan_software(aux_index).await?,
                SyncStrategy::Hardware => self.scan_hardware(aux_index).await?,
            }
        }
        Ok(())
    }

    /// Remember everything local settings, focusers and the stage may change,
    /// then link the local settings not driven by the acquisition.
    async fn prepare_streams(&mut self) -> AcqResult<()> {
        for stream in &self.request.streams {
            let emitter = stream.emitter();
            let detector = stream.detector();
            for name in stream.local_settings(SettingRole::Emitter).names() {
                self.session.remember(emitter.name(), emitter.parameters(), name)?;
            }
            for name in stream.local_settings(SettingRole::Detector).names() {
                self.session.remember(detector.name(), detector.parameters(), name)?;
            }
            if let Some(focuser) = stream.focuser() {
                self.session.remember_position(focuser.clone()).await?;
            }
            if stream.is_active() {
                // Relinked with the managed settings left out, then back.
                stream.unlink_local_settings();
                self.reactivate.push(stream.clone());
            }
            stream.link_local_settings(&MANAGED_SETTINGS);
        }

        if let Some(stage) = &self.request.scan_stage {
            self.session.remember_position(stage.x.clone()).await?;
            self.session.remember_position(stage.y.clone()).await?;
            self.stage_origin = (stage.x.position().await?, stage.y.position().await?);
            debug!(origin = ?self.stage_origin, "Scan stage origin");
        }
        Ok(())
    }

    fn apply_emitter_settings(&mut self) -> AcqResult<()> {
        let emitter = self.leading().emitter().clone();
        let (device, params) = (emitter.name(), emitter.parameters());
        match self.plan.strategy {
            SyncStrategy::Software => {
                if params.contains(names::PIXEL_TRIGGER) {
                    self.session.apply(device, params, names::PIXEL_TRIGGER, false)?;
                }
                // Written by every step.
                self.session.remember(device, params, names::TRANSLATION)?;
                self.apply_step_settings()
            }
            SyncStrategy::Hardware => {
                let geometry = &self.plan.geometry;
                let base = emitter.base_pixel_size();
                let scale = (geometry.pixel_size / base.0, geometry.pixel_size / base.1);
                self.session.apply_checked(device, params, names::SCALE, scale)?;
                self.session
                    .apply_checked(device, params, names::RESOLUTION, geometry.repetition)?;
                let center = to_translation(geometry.center(), base);
                self.session.apply(device, params, names::TRANSLATION, center)?;
                self.session
                    .apply(device, params, names::DWELL_TIME, self.plan.scanner_dwell)?;
                self.session.apply_checked(device, params, names::PIXEL_TRIGGER, true)?;
                Ok(())
            }
        }
    }

    /// Emitter settings of one software step. Also used to put them back
    /// after a leech checkpoint.
    fn apply_step_settings(&mut self) -> AcqResult<()> {
        if self.plan.strategy != SyncStrategy::Software {
            return Ok(());
        }
        let emitter = self.leading().emitter().clone();
        let (device, params) = (emitter.name(), emitter.parameters());
        let scan = self.plan.pixel_scan;
        self.session.apply_checked(device, params, names::SCALE, scan.scale)?;
        self.session.apply_checked(device, params, names::RESOLUTION, scan.resolution)?;
        self.session
            .apply(device, params, names::DWELL_TIME, self.plan.scanner_dwell)?;
        Ok(())
    }

    fn apply_detector_settings(&mut self) -> AcqResult<()> {
        for (stream, exposure) in self.request.streams.iter().zip(&self.plan.exposures) {
            let Some(exposure) = exposure else {
                continue;
            };
            let detector = stream.detector();
            if self.plan.integration > 1 {
                self.session.apply_checked(
                    detector.name(),
                    detector.parameters(),
                    names::EXPOSURE_TIME,
                    *exposure,
                )?;
            } else {
                self.session
                    .apply(detector.name(), detector.parameters(), names::EXPOSURE_TIME, *exposure)?;
            }
        }
        Ok(())
    }

    async fn synchronize_flows(&mut self) -> AcqResult<()> {
        let event = self.leading().emitter().pixel_event();
        for (i, stream) in self.request.streams.iter().enumerate() {
            let mode = match (self.plan.strategy, &event) {
                (SyncStrategy::Hardware, Some(event)) if i > 0 => TriggerMode::Hardware(event.clone()),
                _ => TriggerMode::Software,
            };
            let flow = stream.data_flow();
            cancellable(self.session.synchronize(flow, mode), &self.token).await?;
        }
        Ok(())
    }

    async fn scan_software(&mut self, aux: usize) -> AcqResult<()> {
        let channels = self
            .request
            .streams
            .iter()
            .map(|s| DetectorChannel::new(s.name(), s.data_flow()))
            .collect();
        let mut step = SoftwareTriggeredStep::new(
            channels,
            self.leading().emitter().clone(),
            self.plan.pixel_scan,
            self.plan.step_duration,
            self.config.clone(),
        )?;
        if let Some(stage) = &self.request.scan_stage {
            step = step.with_stage(stage.clone(), self.stage_origin);
        }
        let result = self.software_loop(&mut step, aux).await;
        let released = step.release().await;
        result.and(released)
    }

    async fn software_loop(&mut self, step: &mut SoftwareTriggeredStep, aux: usize) -> AcqResult<()> {
        let store = self.live.store();
        let started = Instant::now();
        for index in 0..self.grid.len() {
            self.check_cancelled()?;
            let position = self.grid.position(index).ok_or_else(|| {
                AcqError::Processing(format!("No position for index {}", index))
            })?;
            for _ in 0..self.plan.integration {
                let drift = self.scheduler.as_ref().map_or((0.0, 0.0), LeechScheduler::drift);
                let outcome = step.run(StepTarget { index, position }, drift, &self.token).await?;
                for (channel, frame) in outcome.frames.iter().enumerate() {
                    self.live.push(channel, aux, index, frame)?;
                }
                self.progress.step_done(outcome.elapsed, self.handle);
            }
            if let Some(scheduler) = self.scheduler.as_mut() {
                if scheduler.after_step(&store, &self.token).await? {
                    self.apply_step_settings()?;
                }
            }
        }
        debug!(aux, positions = self.grid.len(), elapsed_ms = started.elapsed().as_millis() as u64, "Grid scanned");
        Ok(())
    }

    async fn scan_hardware(&mut self, aux: usize) -> AcqResult<()> {
        let mut channels = self
            .request
            .streams
            .iter()
            .map(|s| DetectorChannel::new(s.name(), s.data_flow()));
        let Some(leading) = channels.next() else {
            return Err(AcqError::Configuration("No stream to acquire".into()));
        };
        let mut block =
            HardwareTriggeredBlock::new(leading, channels.collect(), self.plan.step_duration, self.config.clone());

        let live = &mut self.live;
        let progress = &mut self.progress;
        let handle = self.handle;
        let pixel_time = self.plan.step_duration;
        let raster = block
            .run(
                self.grid.len(),
                &self.token,
                |channel, index, frame| live.push(channel + 1, aux, index, &frame),
                |_| progress.step_done(pixel_time, handle),
            )
            .await?;
        self.live.fold_raster(0, aux, &raster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_driver_mock::{DetectorKind, MockDetector, MockScanDetector, MockScanner};

    fn streams(pixel_event: bool, hardware: bool) -> Vec<Arc<Stream>> {
        let scanner = Arc::new(MockScanner::builder().shape(64, 64).pixel_event(pixel_event).build());
        let se = Arc::new(MockScanDetector::new("se", scanner.clone()));
        let ccd = Arc::new(
            MockDetector::builder("ccd")
                .kind(DetectorKind::Point)
                .max_exposure(0.1)
                .hardware_trigger(hardware)
                .build(),
        );
        vec![
            Arc::new(Stream::builder("se", se, scanner.clone()).build()),
            Arc::new(Stream::builder("ccd", ccd, scanner).build()),
        ]
    }

    #[test]
    fn test_plan_integration_count() {
        let request = AcquisitionRequest::new(streams(false, false))
            .repetition(4, 3)
            .dwell_time(1e-5)
            .exposure_time(0.25);
        let plan = TaskPlan::resolve(&request).unwrap();
        assert_eq!(plan.integration, 3);
        assert_eq!(plan.exposures[0], None);
        let sub = plan.exposures[1].unwrap();
        assert!((sub - 0.25 / 3.0).abs() < 1e-12);
        assert_eq!(plan.strategy, SyncStrategy::Software);
        assert_eq!(plan.total_steps(), 36);
    }

    #[test]
    fn test_hardware_strategy_selection() {
        let request = AcquisitionRequest::new(streams(true, true))
            .repetition(8, 8)
            .exposure_time(0.001)
            .hardware_sync(true);
        assert_eq!(TaskPlan::resolve(&request).unwrap().strategy, SyncStrategy::Hardware);

        let integrated = request.clone().exposure_time(0.3);
        assert_eq!(TaskPlan::resolve(&integrated).unwrap().strategy, SyncStrategy::Software);

        let no_event = AcquisitionRequest::new(streams(false, true)).hardware_sync(true);
        assert_eq!(TaskPlan::resolve(&no_event).unwrap().strategy, SyncStrategy::Software);

        let unsynced = AcquisitionRequest::new(streams(true, false)).hardware_sync(true);
        assert_eq!(TaskPlan::resolve(&unsynced).unwrap().strategy, SyncStrategy::Software);
    }

    #[test]
    fn test_request_validation() {
        assert!(matches!(
            AcquisitionRequest::new(Vec::new()).validate(),
            Err(AcqError::Configuration(_))
        ));
        let mut mixed = streams(false, false);
        mixed.extend(streams(false, false).into_iter().skip(1));
        assert!(matches!(
            AcquisitionRequest::new(mixed).validate(),
            Err(AcqError::Configuration(_))
        ));
        let negative = AcquisitionRequest::new(streams(false, false)).dwell_time(-1.0);
        assert!(negative.validate().is_err());
    }

    struct FarDrift;

    #[async_trait::async_trait]
    impl Leech for FarDrift {
        fn name(&self) -> &str {
            "far drift"
        }
        fn estimate_time(&self, _step: Duration, _shape: (usize, usize)) -> Duration {
            Duration::ZERO
        }
        async fn start(&self, _step: Duration, _shape: (usize, usize)) -> anyhow::Result<Option<u64>> {
            Ok(None)
        }
        async fn next(&self, _live: &crate::live::LiveStore) -> anyhow::Result<u64> {
            Ok(1)
        }
        async fn complete(&self, _results: &[acq_core::data::DataArray]) -> anyhow::Result<Vec<acq_core::data::DataArray>> {
            Ok(Vec::new())
        }
        fn drift_vector(&self) -> Option<(f64, f64)> {
            Some((1e6, 0.0))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[tracing_test::traced_test]
    async fn test_out_of_bounds_drift_is_clipped() {
        let request = AcquisitionRequest::new(streams(false, false))
            .repetition(2, 1)
            .exposure_time(0.002)
            .leech(Arc::new(FarDrift));
        let config = EngineConfig {
            timeout_margin: Duration::from_millis(200),
            ..Default::default()
        };
        let result = acquire(request, config)
            .unwrap()
            .result(Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(result.is_complete());
        assert!(logs_contain("Drift correction out of bounds, scan position clipped"));
    }

    #[test]
    fn test_estimate_counts_steps() {
        let request = AcquisitionRequest::new(streams(false, false))
            .repetition(10, 10)
            .dwell_time(1e-3)
            .exposure_time(0.02);
        let estimate = estimate_acquisition_time(&request, &EngineConfig::default()).unwrap();
        assert!((estimate.as_secs_f64() - 2.0).abs() < 1e-6, "{:?}", estimate);
    }
}
