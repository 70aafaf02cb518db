//! Hardware settings session.
//!
//! Every device setting an acquisition touches goes through a
//! [`HardwareSettingsSession`], which remembers the value the setting had the
//! first time it was touched. [`HardwareSettingsSession::restore`] writes all
//! of them back once the task is over, whatever the outcome:
//!
//! - parameters, in the order they were first touched, followed by one more
//!   pass for values a device clamped because of a dependency between
//!   settings (a resolution restored while a large scale is still applied)
//! - data flow trigger modes
//! - stage, focuser and auxiliary axis positions
//!
//! A failing write is logged and skipped so one broken device cannot keep the
//! others from being restored. A session dropped without `restore()` puts the
//! parameters back synchronously and hands the rest to the runtime.

use acq_core::capabilities::{AuxiliaryAxis, DataFlow, Movable, TriggerMode};
use acq_core::error::{AcqError, AcqResult};
use acq_core::parameter::{ParameterBase, ParameterSet, ParameterValue};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Relative tolerance used when reading back floating point settings.
const READBACK_TOLERANCE: f64 = 1e-9;

enum Saved {
    Parameter {
        device: String,
        parameter: Arc<dyn ParameterBase>,
        previous: Value,
    },
    Trigger {
        flow: Arc<dyn DataFlow>,
        previous: TriggerMode,
    },
    Position {
        axis: Arc<dyn Movable>,
        previous: f64,
    },
    Aux {
        axis: Arc<dyn AuxiliaryAxis>,
        previous: String,
    },
}

impl Saved {
    fn label(&self) -> String {
        match self {
            Saved::Parameter {
                device, parameter, ..
            } => format!("{}.{}", device, parameter.name()),
            Saved::Trigger { flow, .. } => format!("{}.trigger", flow.name()),
            Saved::Position { axis, .. } => format!("{}.position", axis.name()),
            Saved::Aux { axis, .. } => format!("{}.position", axis.name()),
        }
    }
}

/// Records and restores the device settings changed by one acquisition.
#[derive(Default)]
pub struct HardwareSettingsSession {
    saved: Vec<Saved>,
    touched: HashSet<String>,
    restored: bool,
}

impl std::fmt::Debug for HardwareSettingsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareSettingsSession")
            .field("saved", &self.saved.iter().map(Saved::label).collect::<Vec<_>>())
            .field("restored", &self.restored)
            .finish()
    }
}

impl HardwareSettingsSession {
    /// Empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of settings remembered.
    pub fn len(&self) -> usize {
        self.saved.len()
    }

    /// Whether nothing has been touched yet.
    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    /// Whether `restore()` already ran.
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    fn first_touch(&mut self, key: String) -> bool {
        self.touched.insert(key)
    }

    /// Remember a parameter without changing it, so that whatever changes it
    /// later (e.g. linked local settings) is undone by `restore()`.
    pub fn remember(&mut self, device: &str, params: &ParameterSet, name: &str) -> AcqResult<bool> {
        let Some(parameter) = params.get(name) else {
            return Ok(false);
        };
        let key = format!("param:{}.{}", device, name);
        if self.first_touch(key) {
            let previous = parameter.get_json()?;
            debug!(device, setting = name, previous = %previous, "Setting remembered");
            self.saved.push(Saved::Parameter {
                device: device.to_string(),
                parameter,
                previous,
            });
        }
        Ok(true)
    }

    /// Write a setting, returning what the device actually applied, or
    /// `None` when the device has no such setting.
    ///
    /// A clamped value is logged and accepted.
    pub fn apply_json(
        &mut self,
        device: &str,
        params: &ParameterSet,
        name: &str,
        value: Value,
    ) -> AcqResult<Option<Value>> {
        if !self.remember(device, params, name)? {
            debug!(device, setting = name, "Device has no such setting, skipped");
            return Ok(None);
        }
        let Some(parameter) = params.get(name) else {
            return Ok(None);
        };
        let applied = parameter.set_json(value.clone())?;
        if !json_close(&applied, &value) {
            warn!(
                device,
                setting = name,
                requested = %value,
                applied = %applied,
                "Hardware adjusted setting"
            );
        }
        Ok(Some(applied))
    }

    /// Typed [`apply_json`](Self::apply_json).
    pub fn apply<T: ParameterValue>(
        &mut self,
        device: &str,
        params: &ParameterSet,
        name: &str,
        value: T,
    ) -> AcqResult<Option<T>> {
        let json = serde_json::to_value(&value)
            .map_err(|e| AcqError::Configuration(format!("{}: {}", name, e)))?;
        match self.apply_json(device, params, name, json)? {
            Some(applied) => serde_json::from_value(applied)
                .map(Some)
                .map_err(|e| AcqError::Hardware(format!("{}.{} read back: {}", device, name, e))),
            None => Ok(None),
        }
    }

    /// Write a setting the acquisition cannot do without: a missing setting
    /// is a configuration error and any adjustment a hardware rejection.
    pub fn apply_checked<T: ParameterValue>(
        &mut self,
        device: &str,
        params: &ParameterSet,
        name: &str,
        value: T,
    ) -> AcqResult<T> {
        let requested = serde_json::to_value(&value)
            .map_err(|e| AcqError::Configuration(format!("{}: {}", name, e)))?;
        let applied = self
            .apply_json(device, params, name, requested.clone())?
            .ok_or_else(|| {
                AcqError::Configuration(format!("Device '{}' has no '{}' setting", device, name))
            })?;
        if !json_close(&applied, &requested) {
            return Err(AcqError::HardwareRejection {
                device: device.to_string(),
                setting: name.to_string(),
                requested: requested.to_string(),
                applied: applied.to_string(),
            });
        }
        serde_json::from_value(applied)
            .map_err(|e| AcqError::Hardware(format!("{}.{} read back: {}", device, name, e)))
    }

    /// Switch a data flow to another trigger mode.
    pub async fn synchronize(&mut self, flow: Arc<dyn DataFlow>, mode: TriggerMode) -> AcqResult<()> {
        let key = format!("trigger:{}:{:p}", flow.name(), Arc::as_ptr(&flow) as *const ());
        if self.first_touch(key) {
            self.saved.push(Saved::Trigger {
                flow: flow.clone(),
                previous: flow.trigger_mode(),
            });
        }
        debug!(flow = %flow.name(), mode = mode.label(), "Synchronizing data flow");
        flow.synchronize_on(mode).await?;
        Ok(())
    }

    /// Remember the position of an axis without moving it.
    pub async fn remember_position(&mut self, axis: Arc<dyn Movable>) -> AcqResult<()> {
        let key = format!("axis:{}:{:p}", axis.name(), Arc::as_ptr(&axis) as *const ());
        if self.first_touch(key) {
            let previous = axis.position().await?;
            self.saved.push(Saved::Position { axis, previous });
        }
        Ok(())
    }

    /// Move an axis and wait for it to settle.
    pub async fn move_axis(&mut self, axis: Arc<dyn Movable>, position: f64) -> AcqResult<()> {
        self.remember_position(axis.clone()).await?;
        axis.move_abs(position).await?;
        axis.wait_settled().await?;
        Ok(())
    }

    /// Move an auxiliary axis to a named position.
    pub async fn move_aux(&mut self, axis: Arc<dyn AuxiliaryAxis>, position: &str) -> AcqResult<()> {
        let key = format!("aux:{}:{:p}", axis.name(), Arc::as_ptr(&axis) as *const ());
        if self.first_touch(key) {
            let previous = axis.position().await?;
            self.saved.push(Saved::Aux {
                axis: axis.clone(),
                previous,
            });
        }
        axis.move_to(position).await?;
        Ok(())
    }

    /// Put back every remembered setting. Runs once; later calls are no-ops.
    ///
    /// Returns the number of settings that could not be restored.
    pub async fn restore(&mut self) -> usize {
        if self.restored {
            debug!("Settings already restored");
            return 0;
        }
        self.restored = true;
        let saved = std::mem::take(&mut self.saved);
        let mut failures = restore_parameters(&saved);

        for entry in saved.iter().rev() {
            let result = match entry {
                Saved::Parameter { .. } => continue,
                Saved::Trigger { flow, previous } => flow.synchronize_on(previous.clone()).await,
                Saved::Position { axis, previous } => match axis.move_abs(*previous).await {
                    Ok(()) => axis.wait_settled().await,
                    Err(e) => Err(e),
                },
                Saved::Aux { axis, previous } => axis.move_to(previous).await,
            };
            if let Err(e) = result {
                warn!(setting = %entry.label(), error = %e, "Failed to restore setting");
                failures += 1;
            }
        }
        info!(settings = saved.len(), failures, "Hardware settings restored");
        failures
    }
}

/// Restore parameters in first-touch order, then rewrite those the device
/// clamped. Returns the number of failures.
fn restore_parameters(saved: &[Saved]) -> usize {
    let params: Vec<(&String, &Arc<dyn ParameterBase>, &Value)> = saved
        .iter()
        .filter_map(|s| match s {
            Saved::Parameter {
                device,
                parameter,
                previous,
            } => Some((device, parameter, previous)),
            _ => None,
        })
        .collect();

    let mut pending = Vec::new();
    for (device, parameter, previous) in &params {
        match parameter.set_json((*previous).clone()) {
            Ok(applied) if json_close(&applied, previous) => {}
            Ok(_) => pending.push((*device, *parameter, *previous)),
            Err(e) => {
                warn!(device = %device, setting = %parameter.name(), error = %e, "Failed to restore setting");
                pending.push((*device, *parameter, *previous));
            }
        }
    }

    let mut failures = 0;
    for (device, parameter, previous) in pending {
        match parameter.set_json(previous.clone()) {
            Ok(applied) if json_close(&applied, previous) => {}
            Ok(applied) => {
                warn!(
                    device = %device,
                    setting = %parameter.name(),
                    previous = %previous,
                    applied = %applied,
                    "Setting restored to a different value"
                );
                failures += 1;
            }
            Err(e) => {
                warn!(device = %device, setting = %parameter.name(), error = %e, "Failed to restore setting");
                failures += 1;
            }
        }
    }
    failures
}

impl Drop for HardwareSettingsSession {
    fn drop(&mut self) {
        if self.restored || self.saved.is_empty() {
            return;
        }
        warn!(settings = self.saved.len(), "Session dropped without restore, restoring now");
        restore_parameters(&self.saved);
        let rest: Vec<Saved> = std::mem::take(&mut self.saved)
            .into_iter()
            .filter(|s| !matches!(s, Saved::Parameter { .. }))
            .collect();
        if rest.is_empty() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let mut session = HardwareSettingsSession {
                saved: rest,
                touched: HashSet::new(),
                restored: false,
            };
            runtime.spawn(async move {
                session.restore().await;
            });
        }
    }
}

/// JSON equality with a relative tolerance on numbers.
fn json_close(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= READBACK_TOLERANCE * x.abs().max(y.abs()).max(1e-300),
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_close(a, b))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::parameter::Parameter;
    use serde_json::json;

    fn clamped_set() -> (ParameterSet, Parameter<f64>) {
        let p = Parameter::new("gain", 1.0).connect_to_hardware_write(|v: f64| Ok(v.min(10.0)));
        let mut set = ParameterSet::new();
        set.register(p.clone());
        set.register(Parameter::new("mode", "auto".to_string()));
        (set, p)
    }

    #[tokio::test]
    async fn test_restore_previous_values_once() {
        let (set, gain) = clamped_set();
        let before = set.snapshot();
        let mut session = HardwareSettingsSession::new();
        session.apply("det", &set, "gain", 4.0).unwrap();
        session.apply("det", &set, "gain", 6.0).unwrap();
        session.apply("det", &set, "mode", "manual".to_string()).unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session.restore().await, 0);
        assert_eq!(set.snapshot(), before);
        gain.set(3.0).unwrap();
        assert_eq!(session.restore().await, 0);
        assert_eq!(gain.get(), 3.0);
    }

    #[test]
    fn test_apply_reports_clamped_value() {
        let (set, _) = clamped_set();
        let mut session = HardwareSettingsSession::new();
        assert_eq!(session.apply("det", &set, "gain", 50.0).unwrap(), Some(10.0));
        assert_eq!(session.apply("det", &set, "missing", 1.0).unwrap(), None);
    }

    #[test]
    fn test_apply_checked_rejects_adjustment() {
        let (set, _) = clamped_set();
        let mut session = HardwareSettingsSession::new();
        let err = session.apply_checked("det", &set, "gain", 50.0).unwrap_err();
        assert!(matches!(err, AcqError::HardwareRejection { ref setting, .. } if setting == "gain"));
        assert!(matches!(
            session.apply_checked("det", &set, "missing", 1.0),
            Err(AcqError::Configuration(_))
        ));
    }

    #[test]
    fn test_remember_then_external_change_is_undone() {
        let (set, gain) = clamped_set();
        let mut session = HardwareSettingsSession::new();
        assert!(session.remember("det", &set, "gain").unwrap());
        gain.set(8.0).unwrap();
        drop(session);
        assert_eq!(gain.get(), 1.0);
    }

    #[tokio::test]
    async fn test_restore_failure_does_not_stop_others() {
        let fragile = Parameter::new("fragile", 1.0).connect_to_hardware_write(|v: f64| {
            if v < 2.0 {
                anyhow::bail!("refused")
            }
            Ok(v)
        });
        let other = Parameter::new("other", 0.0);
        let mut set = ParameterSet::new();
        set.register(fragile.clone());
        set.register(other.clone());

        let mut session = HardwareSettingsSession::new();
        session.apply("det", &set, "fragile", 5.0).unwrap();
        session.apply("det", &set, "other", 7.0).unwrap();
        assert_eq!(session.restore().await, 1);
        assert_eq!(other.get(), 0.0);
        assert_eq!(fragile.get(), 5.0);
    }

    #[test]
    fn test_json_close() {
        assert!(json_close(&json!([1.0, 2.0]), &json!([1.0, 2.0000000000001])));
        assert!(!json_close(&json!([1.0, 2.0]), &json!([1.0, 2.1])));
        assert!(json_close(&json!(null), &json!(null)));
        assert!(json_close(&json!(3), &json!(3.0)));
    }
}
