//! Streams: a detector, its data flow and the emitter it depends on.
//!
//! A [`Stream`] owns *local settings*: detached copies of selected hardware
//! parameters. While the stream is inactive they can be edited freely without
//! touching the devices. Linking pushes the local values to the hardware and
//! mirrors later changes in both directions until the stream is unlinked.
//!
//! ```text
//!   local "dwell_time" ──set──▶ scanner "dwell_time"
//!          ▲                          │
//!          └────── applied value ─────┘
//! ```
//!
//! Optional capabilities (hardware synchronization, fuzzing, integration,
//! focuser) are resolved once when the stream is built, see
//! [`StreamCapabilities`].

use crate::capabilities::{names, DataFlow, Detector, DetectorDrive, Movable, Scanner};
use crate::parameter::{ParameterBase, ParameterSet};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which device a local setting shadows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingRole {
    /// The scanning emitter.
    Emitter,
    /// The stream's detector.
    Detector,
}

/// Optional behaviour supported by a stream, resolved at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCapabilities {
    /// Detector acquires while the scanner rasters.
    pub scan_driven: bool,
    /// Data flow accepts software triggers.
    pub software_trigger: bool,
    /// Detector can follow the emitter's per-pixel hardware event.
    pub hardware_trigger: bool,
    /// Sub-pixel scanning is possible.
    pub fuzzing: bool,
    /// Long exposures can be synthesized from shorter ones.
    pub integration: bool,
    /// A focuser is attached.
    pub focuser: bool,
}

impl StreamCapabilities {
    /// Probe the devices of a stream.
    pub fn resolve(detector: &dyn Detector, emitter: &dyn Scanner, has_focuser: bool) -> Self {
        let support = detector.data_flow().trigger_support();
        let scan_driven = detector.drive() == DetectorDrive::Scan;
        let emitter_params = emitter.parameters();
        Self {
            scan_driven,
            software_trigger: support.software,
            hardware_trigger: !scan_driven
                && support.hardware
                && emitter.pixel_event().is_some()
                && emitter_params.contains(names::PIXEL_TRIGGER),
            fuzzing: scan_driven
                && emitter_params.contains(names::SCALE)
                && emitter_params.contains(names::RESOLUTION),
            integration: detector.max_exposure().is_some()
                && detector.parameters().contains(names::EXPOSURE_TIME),
            focuser: has_focuser,
        }
    }
}

/// Per-stream acquisition policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPolicy {
    /// With an auxiliary sequence, keep one array per position instead of
    /// averaging them.
    pub keep_separate: bool,
    /// Scan each nominal pixel with a sub-pixel tile.
    pub fuzzing: bool,
}

/// One detector acquiring with one scanning emitter.
pub struct Stream {
    name: String,
    detector: Arc<dyn Detector>,
    emitter: Arc<dyn Scanner>,
    focuser: Option<Arc<dyn Movable>>,
    emitter_settings: ParameterSet,
    detector_settings: ParameterSet,
    policy: StreamPolicy,
    capabilities: StreamCapabilities,
    active: AtomicBool,
    links: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("detector", &self.detector.name())
            .field("emitter", &self.emitter.name())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Start building a stream.
    pub fn builder(
        name: impl Into<String>,
        detector: Arc<dyn Detector>,
        emitter: Arc<dyn Scanner>,
    ) -> StreamBuilder {
        StreamBuilder {
            name: name.into(),
            detector,
            emitter,
            focuser: None,
            emitter_local: Vec::new(),
            detector_local: Vec::new(),
            policy: StreamPolicy::default(),
        }
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The detector.
    pub fn detector(&self) -> &Arc<dyn Detector> {
        &self.detector
    }

    /// The scanning emitter.
    pub fn emitter(&self) -> &Arc<dyn Scanner> {
        &self.emitter
    }

    /// The detector's data flow.
    pub fn data_flow(&self) -> Arc<dyn DataFlow> {
        self.detector.data_flow()
    }

    /// Optional focuser.
    pub fn focuser(&self) -> Option<&Arc<dyn Movable>> {
        self.focuser.as_ref()
    }

    /// Local settings shadowing one device.
    pub fn local_settings(&self, role: SettingRole) -> &ParameterSet {
        match role {
            SettingRole::Emitter => &self.emitter_settings,
            SettingRole::Detector => &self.detector_settings,
        }
    }

    /// Local value of a setting as JSON, if the stream shadows it.
    pub fn local_value(&self, role: SettingRole, name: &str) -> Option<serde_json::Value> {
        self.local_settings(role)
            .get(name)
            .and_then(|p| p.get_json().ok())
    }

    /// Acquisition policy.
    pub fn policy(&self) -> StreamPolicy {
        self.policy
    }

    /// Capabilities resolved at construction.
    pub fn capabilities(&self) -> StreamCapabilities {
        self.capabilities
    }

    /// Whether local settings are currently linked to the hardware.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Activate (link all local settings) or deactivate (unlink) the stream.
    pub fn set_active(&self, active: bool) {
        if active {
            self.link_local_settings(&[]);
        } else {
            self.unlink_local_settings();
        }
    }

    /// Push local settings to the hardware and mirror them both ways.
    ///
    /// Settings listed in `managed` are left alone: the caller drives them.
    /// Values the hardware refuses are logged and the local copy is updated
    /// with what the device kept. Linking an already linked stream is a no-op.
    pub fn link_local_settings(&self, managed: &[&str]) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let runtime = tokio::runtime::Handle::try_current().ok();
        if runtime.is_none() {
            warn!(stream = %self.name, "No runtime: local settings pushed once, not mirrored");
        }

        let mut links = self.links.lock();
        let pairs = [
            (&self.emitter_settings, self.emitter.parameters()),
            (&self.detector_settings, self.detector.parameters()),
        ];
        for (local_set, hw_set) in pairs {
            for name in local_set.names() {
                if managed.contains(&name) {
                    continue;
                }
                let (Some(local), Some(hw)) = (local_set.get(name), hw_set.get(name)) else {
                    continue;
                };
                push_local(&self.name, local.as_ref(), hw.as_ref());
                if let Some(rt) = &runtime {
                    // Subscribe before spawning so no change is missed.
                    let local_changes = local.subscribe_json();
                    let hw_changes = hw.subscribe_json();
                    links.push(rt.spawn(mirror_to_hardware(
                        self.name.clone(),
                        local_changes,
                        local.clone(),
                        hw.clone(),
                    )));
                    links.push(rt.spawn(mirror_to_local(hw_changes, local)));
                }
            }
        }
        debug!(stream = %self.name, links = links.len(), "Local settings linked");
    }

    /// Stop mirroring local settings.
    pub fn unlink_local_settings(&self) {
        self.active.store(false, Ordering::Release);
        for handle in self.links.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        for handle in self.links.get_mut().drain(..) {
            handle.abort();
        }
    }
}

fn push_local(stream: &str, local: &dyn ParameterBase, hw: &dyn ParameterBase) {
    let Ok(value) = local.get_json() else {
        return;
    };
    match hw.set_json(value.clone()) {
        Ok(applied) => {
            if applied != value {
                warn!(
                    stream,
                    setting = %local.name(),
                    requested = %value,
                    applied = %applied,
                    "Hardware adjusted local setting"
                );
            }
            let _ = local.publish_json(applied);
        }
        Err(e) => {
            warn!(stream, setting = %local.name(), error = %e, "Hardware refused local setting");
            if let Ok(current) = hw.get_json() {
                let _ = local.publish_json(current);
            }
        }
    }
}

async fn mirror_to_hardware(
    stream: String,
    mut changes: BoxStream<'static, serde_json::Value>,
    local: Arc<dyn ParameterBase>,
    hw: Arc<dyn ParameterBase>,
) {
    while let Some(value) = changes.next().await {
        match hw.set_json(value) {
            Ok(applied) => {
                let _ = local.publish_json(applied);
            }
            Err(e) => {
                warn!(stream = %stream, setting = %local.name(), error = %e, "Hardware refused local setting");
            }
        }
    }
}

async fn mirror_to_local(
    mut changes: BoxStream<'static, serde_json::Value>,
    local: Arc<dyn ParameterBase>,
) {
    while let Some(value) = changes.next().await {
        let _ = local.publish_json(value);
    }
}

/// Builder for [`Stream`].
pub struct StreamBuilder {
    name: String,
    detector: Arc<dyn Detector>,
    emitter: Arc<dyn Scanner>,
    focuser: Option<Arc<dyn Movable>>,
    emitter_local: Vec<String>,
    detector_local: Vec<String>,
    policy: StreamPolicy,
}

impl StreamBuilder {
    /// Attach a focuser.
    pub fn focuser(mut self, focuser: Arc<dyn Movable>) -> Self {
        self.focuser = Some(focuser);
        self
    }

    /// Emitter parameters to shadow locally.
    pub fn local_emitter_settings(mut self, settings: &[&str]) -> Self {
        self.emitter_local = settings.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Detector parameters to shadow locally.
    pub fn local_detector_settings(mut self, settings: &[&str]) -> Self {
        self.detector_local = settings.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Keep one array per auxiliary position.
    pub fn keep_separate(mut self, keep: bool) -> Self {
        self.policy.keep_separate = keep;
        self
    }

    /// Request sub-pixel scanning.
    pub fn fuzzing(mut self, fuzzing: bool) -> Self {
        self.policy.fuzzing = fuzzing;
        self
    }

    /// Build the stream. Names the device does not have are skipped.
    pub fn build(self) -> Stream {
        let emitter_settings = shadow_set(self.emitter.parameters(), &self.emitter_local);
        let detector_settings = shadow_set(self.detector.parameters(), &self.detector_local);
        let capabilities = StreamCapabilities::resolve(
            self.detector.as_ref(),
            self.emitter.as_ref(),
            self.focuser.is_some(),
        );
        let mut policy = self.policy;
        if policy.fuzzing && !capabilities.fuzzing {
            warn!(stream = %self.name, "Fuzzing requested but not supported, disabled");
            policy.fuzzing = false;
        }
        Stream {
            name: self.name,
            detector: self.detector,
            emitter: self.emitter,
            focuser: self.focuser,
            emitter_settings,
            detector_settings,
            policy,
            capabilities,
            active: AtomicBool::new(false),
            links: Mutex::new(Vec::new()),
        }
    }
}

fn shadow_set(hardware: &ParameterSet, wanted: &[String]) -> ParameterSet {
    let mut set = ParameterSet::new();
    for name in wanted {
        match hardware.get(name) {
            Some(p) => set.insert(p.shadow()),
            None => debug!(setting = %name, "Device has no such setting, not shadowed"),
        }
    }
    set
}
