//! `acq-core`
//!
//! Core trait definitions and types for synchronized scan acquisition.
//!
//! This crate provides the building blocks shared by the acquisition engine
//! and the device drivers:
//!
//! - [`capabilities`]: small async traits a device implements (`Scanner`,
//!   `Detector`, `DataFlow`, `Movable`, `AuxiliaryAxis`)
//! - [`parameter`]: observable, type-erasable device settings
//! - [`data`]: `DataArray` and its `Metadata`
//! - [`stream`]: a detector + emitter pair with local settings and resolved
//!   capabilities
//! - [`error`]: the `AcqError` taxonomy
//! - [`limits`]: shared timing defaults and hard limits

pub mod capabilities;
pub mod data;
pub mod error;
pub mod limits;
pub mod parameter;
pub mod stream;

pub use capabilities::{
    names, AuxiliaryAxis, DataFlow, DataObserver, Detector, DetectorDrive, Movable,
    ObserverHandle, Parameterized, PixelEvent, PixelTick, Scanner, TriggerMode, TriggerSupport,
};
pub use data::{DataArray, Metadata};
pub use error::{AcqError, AcqResult, DriverError, DriverErrorKind};
pub use parameter::{Parameter, ParameterBase, ParameterMetadata, ParameterSet, ParameterValue};
pub use stream::{SettingRole, Stream, StreamBuilder, StreamCapabilities, StreamPolicy};
