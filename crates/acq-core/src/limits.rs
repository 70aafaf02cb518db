//! Shared hard limits and default timings of the acquisition engine.
//!
//! Engine configuration (`EngineConfig` in `acq-engine`) defaults to these
//! values; drivers use them to bound their own waits.

use std::time::Duration;

// =============================================================================
// Synchronization
// =============================================================================

/// Consecutive failures tolerated for one scan position before the
/// acquisition is aborted.
pub const MAX_SYNC_FAILURES: u32 = 3;

/// Step timeout = `SYNC_TIMEOUT_FACTOR` × expected duration + `SYNC_TIMEOUT_MARGIN`.
pub const SYNC_TIMEOUT_FACTOR: f64 = 3.0;

/// Fixed part of the step timeout.
pub const SYNC_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Pause between unsubscribing and resubscribing after a failed step.
pub const SYNC_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A step completing faster than this fraction of its expected duration is
/// considered bogus.
pub const MIN_DURATION_RATIO: f64 = 0.5;

/// Extra time allowed per dequeue in hardware-triggered mode.
pub const DEQUEUE_MARGIN: Duration = Duration::from_secs(2);

// =============================================================================
// Preview
// =============================================================================

/// Default minimum period between two preview renders.
pub const PREVIEW_PERIOD: Duration = Duration::from_millis(500);

/// Preview period floor: configurations asking for less are raised to this.
pub const MIN_PREVIEW_PERIOD: Duration = Duration::from_millis(250);

// =============================================================================
// Geometry
// =============================================================================

/// Sub-pixel tile side used when fuzzing is enabled.
pub const FUZZING_TILE: u32 = 4;

/// Largest grid accepted along one axis.
pub const MAX_REPETITION: u32 = 4096;

/// Tolerance used when comparing physical sizes.
pub const GEOMETRY_EPSILON: f64 = 1e-9;

/// Time needed to move an auxiliary axis, used by time estimates.
pub const AUX_MOVE_ESTIMATE: Duration = Duration::from_millis(500);
