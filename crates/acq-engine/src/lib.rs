//! `acq-engine`
//!
//! Multi-detector synchronized scan acquisition.
//!
//! Given a set of streams sharing one scanning emitter, the engine resolves a
//! consistent scan grid, configures the hardware through a restorable
//! settings session, visits every grid position in lock-step with all
//! detectors and assembles the results:
//!
//! - [`geometry`]: ROI / repetition / pixel size resolution and the scan grid
//! - [`settings`]: record-and-restore of every device setting touched
//! - [`sync`]: software-triggered steps and hardware-triggered rasters
//! - [`live`] and [`finalize`]: live buffers and the final result set
//! - [`leech`] and [`drift`]: periodic callouts, anchor drift correction
//! - [`orchestrator`]: the acquisition task, with its [`handle`] and
//!   [`preview`]
//! - [`config`]: engine timings and limits
//!
//! # Example
//!
//! ```rust,ignore
//! let request = AcquisitionRequest::new(vec![se_stream, ccd_stream])
//!     .repetition(64, 48)
//!     .exposure_time(0.05);
//! let handle = acquire(request, EngineConfig::from_env()?)?;
//! let result = handle.result(None).await?;
//! ```

pub mod config;
pub mod drift;
pub mod finalize;
pub mod geometry;
pub mod handle;
pub mod leech;
pub mod live;
pub mod orchestrator;
pub mod preview;
pub mod settings;
pub mod sync;

pub use config::EngineConfig;
pub use drift::AnchorDriftCorrector;
pub use geometry::{resolve_geometry, Roi, Sampling, ScanGeometry, ScanGrid, ScanLimits};
pub use handle::{AcquisitionHandle, AcquisitionResult, Progress, TaskState};
pub use leech::{Leech, LeechScheduler};
pub use live::{LiveAssembler, LivePreview, LiveStore};
pub use orchestrator::{
    acquire, estimate_acquisition_time, AcquisitionRequest, AuxSequence, Orchestrator, ScanStage,
    SyncStrategy, TaskPlan,
};
pub use preview::{LatestPreview, PreviewSink};
pub use settings::HardwareSettingsSession;
