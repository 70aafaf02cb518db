//! Parameter<T> - Observable device settings
//!
//! Every device setting the acquisition engine touches (scanner scale,
//! resolution, translation, dwell time, detector exposure, ...) is a
//! [`Parameter<T>`]: a `tokio::sync::watch` backed value with metadata, an
//! optional validator and an optional hardware writer.
//!
//! # Data Flow
//!
//! ```text
//! caller calls param.set(value)
//!         │
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 1. Validate (read-only, validator)                │
//! └───────────────────────────────────────────────────┘
//!         │ (fails here if invalid)
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 2. Hardware writer returns the value it applied   │
//! │    (devices may silently clamp)                   │
//! └───────────────────────────────────────────────────┘
//!         │
//!         ▼
//! ┌───────────────────────────────────────────────────┐
//! │ 3. Publish applied value if it changed            │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! `set()` returns the *applied* value, so callers that care about clamping
//! (the hardware settings session) can compare it to what they asked for.
//!
//! [`ParameterBase`] provides type-erased JSON access used by the settings
//! session to snapshot and restore values without knowing their types, and
//! [`ParameterSet`] is the per-device registry.

use anyhow::{anyhow, Result};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Validator callback type.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// Hardware write callback. Returns the value the device actually applied.
pub type HardwareWriter<T> = Arc<dyn Fn(T) -> Result<T> + Send + Sync>;

/// Bound required for values stored in a parameter.
pub trait ParameterValue:
    Clone + Send + Sync + PartialEq + Debug + Serialize + DeserializeOwned + 'static
{
}

impl<T> ParameterValue for T where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + DeserializeOwned + 'static
{
}

/// Metadata for a parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterMetadata {
    /// Parameter name (unique within a device).
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Physical unit (e.g. "s", "m", "px").
    pub unit: Option<String>,
    /// Whether writes are rejected.
    pub read_only: bool,
    /// Minimum accepted value (per component for tuples).
    #[serde(default)]
    pub min_value: Option<f64>,
    /// Maximum accepted value (per component for tuples).
    #[serde(default)]
    pub max_value: Option<f64>,
}

struct SharedState<T> {
    metadata: ParameterMetadata,
    validator: Option<Validator<T>>,
    hardware_writer: Option<HardwareWriter<T>>,
}

/// Typed, observable device setting.
pub struct Parameter<T>
where
    T: ParameterValue,
{
    sender: watch::Sender<T>,
    shared: Arc<RwLock<SharedState<T>>>,
}

impl<T: ParameterValue> Clone for Parameter<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: ParameterValue> Debug for Parameter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.shared.read().metadata.name)
            .field("value", &*self.sender.borrow())
            .finish_non_exhaustive()
    }
}

impl<T: ParameterValue> Parameter<T> {
    /// Create a new parameter with an initial value.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender,
            shared: Arc::new(RwLock::new(SharedState {
                metadata: ParameterMetadata {
                    name: name.into(),
                    ..Default::default()
                },
                validator: None,
                hardware_writer: None,
            })),
        }
    }

    /// Set parameter description
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Set parameter unit
    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        self.shared.write().metadata.unit = Some(unit.into());
        self
    }

    /// Mark as read-only.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Add a custom validator. Runs before the hardware writer.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.write().validator = Some(Arc::new(validator));
        self
    }

    /// Connect the parameter to the device.
    ///
    /// The writer receives the requested value and returns the value the
    /// device really applied, which becomes the published value.
    pub fn connect_to_hardware_write<F>(self, writer: F) -> Self
    where
        F: Fn(T) -> Result<T> + Send + Sync + 'static,
    {
        self.shared.write().hardware_writer = Some(Arc::new(writer));
        self
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Parameter name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Metadata snapshot.
    pub fn metadata(&self) -> ParameterMetadata {
        self.shared.read().metadata.clone()
    }

    /// Validate a value without writing it.
    pub fn validate(&self, value: &T) -> Result<()> {
        let guard = self.shared.read();
        if guard.metadata.read_only {
            return Err(anyhow!("Parameter '{}' is read-only", guard.metadata.name));
        }
        if let Some(validator) = &guard.validator {
            validator(value)?;
        }
        Ok(())
    }

    /// Write a value to the device and publish what was applied.
    pub fn set(&self, value: T) -> Result<T> {
        self.validate(&value)?;
        let writer = self.shared.read().hardware_writer.clone();
        let applied = match writer {
            Some(write) => write(value)?,
            None => value,
        };
        self.publish(applied.clone());
        Ok(applied)
    }

    /// Publish a value coming from the device itself (no validation, no write).
    pub fn publish(&self, value: T) {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl Parameter<f64> {
    /// Reject values outside `[min, max]` and expose the bounds in metadata.
    pub fn with_range(self, min: f64, max: f64) -> Self {
        {
            let mut guard = self.shared.write();
            guard.metadata.min_value = Some(min);
            guard.metadata.max_value = Some(max);
            let name = guard.metadata.name.clone();
            guard.validator = Some(Arc::new(move |v: &f64| {
                if !v.is_finite() || *v < min || *v > max {
                    return Err(anyhow!(
                        "{} = {} outside range [{}, {}]",
                        name,
                        v,
                        min,
                        max
                    ));
                }
                Ok(())
            }));
        }
        self
    }
}

impl Parameter<(f64, f64)> {
    /// Record per-component bounds in metadata. Enforcement is left to the
    /// hardware writer, which is expected to clamp.
    pub fn with_component_bounds(self, min: f64, max: f64) -> Self {
        {
            let mut guard = self.shared.write();
            guard.metadata.min_value = Some(min);
            guard.metadata.max_value = Some(max);
        }
        self
    }
}

// =============================================================================
// ParameterBase - type-erased access
// =============================================================================

/// Type-erased parameter access (JSON values).
pub trait ParameterBase: Send + Sync {
    /// Parameter name.
    fn name(&self) -> String;

    /// Current value as JSON.
    fn get_json(&self) -> Result<serde_json::Value>;

    /// Write a JSON value; returns the applied value as JSON.
    fn set_json(&self, value: serde_json::Value) -> Result<serde_json::Value>;

    /// Metadata snapshot.
    fn metadata(&self) -> ParameterMetadata;

    /// Stream of values published after this call (the current value is not
    /// repeated).
    fn subscribe_json(&self) -> BoxStream<'static, serde_json::Value>;

    /// Publish a JSON value as if it came from the device (no write).
    fn publish_json(&self, value: serde_json::Value) -> Result<()>;

    /// Detached copy: same name, metadata, validator and current value, but
    /// not connected to the device. Used for stream-local settings.
    fn shadow(&self) -> Arc<dyn ParameterBase>;

    /// Downcasting support.
    fn as_any(&self) -> &dyn Any;
}

impl<T: ParameterValue> ParameterBase for Parameter<T> {
    fn name(&self) -> String {
        Parameter::name(self)
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self.get())
            .map_err(|e| anyhow!("Failed to serialize parameter '{}': {}", self.name(), e))
    }

    fn set_json(&self, value: serde_json::Value) -> Result<serde_json::Value> {
        let typed: T = serde_json::from_value(value).map_err(|e| {
            anyhow!(
                "Failed to deserialize parameter '{}': {}. Expected type: {}",
                self.name(),
                e,
                std::any::type_name::<T>()
            )
        })?;
        let applied = self.set(typed)?;
        Ok(serde_json::to_value(applied)?)
    }

    fn metadata(&self) -> ParameterMetadata {
        Parameter::metadata(self)
    }

    fn subscribe_json(&self) -> BoxStream<'static, serde_json::Value> {
        WatchStream::from_changes(self.subscribe())
            .map(|v| serde_json::to_value(v).unwrap_or(serde_json::Value::Null))
            .boxed()
    }

    fn publish_json(&self, value: serde_json::Value) -> Result<()> {
        let typed: T = serde_json::from_value(value)?;
        self.publish(typed);
        Ok(())
    }

    fn shadow(&self) -> Arc<dyn ParameterBase> {
        let guard = self.shared.read();
        let (sender, _) = watch::channel(self.get());
        Arc::new(Parameter {
            sender,
            shared: Arc::new(RwLock::new(SharedState {
                metadata: guard.metadata.clone(),
                validator: guard.validator.clone(),
                hardware_writer: None,
            })),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// ParameterSet
// =============================================================================

/// Named parameters of one device.
#[derive(Default, Clone)]
pub struct ParameterSet {
    parameters: BTreeMap<String, Arc<dyn ParameterBase>>,
}

impl Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("names", &self.names())
            .finish()
    }
}

impl ParameterSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter under its own name.
    pub fn register<T: ParameterValue>(&mut self, parameter: Parameter<T>) {
        self.parameters
            .insert(parameter.name(), Arc::new(parameter) as Arc<dyn ParameterBase>);
    }

    /// Register an already type-erased parameter.
    pub fn insert(&mut self, parameter: Arc<dyn ParameterBase>) {
        self.parameters.insert(parameter.name(), parameter);
    }

    /// Type-erased access.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ParameterBase>> {
        self.parameters.get(name).cloned()
    }

    /// Typed access (clone of the handle, shares the value).
    pub fn get_typed<T: ParameterValue>(&self, name: &str) -> Option<Parameter<T>> {
        self.parameters
            .get(name)
            .and_then(|p| p.as_any().downcast_ref::<Parameter<T>>())
            .cloned()
    }

    /// Whether a parameter with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// All parameter names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.parameters.keys().map(|s| s.as_str()).collect()
    }

    /// Current value of every parameter. Values that fail to serialize are
    /// skipped.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.parameters
            .iter()
            .filter_map(|(name, p)| p.get_json().ok().map(|v| (name.clone(), v)))
            .collect()
    }
}
