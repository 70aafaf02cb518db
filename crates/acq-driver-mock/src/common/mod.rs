//! Common infrastructure for mock devices.
//!
//! Provides reusable components for building simulated acquisition hardware:
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Hardware-like readout, settling and communication delays
//! - **errors**: Error injection, including dropped frames
//! - **rng**: Seeded random number generator

pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

// Re-export commonly used types
pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
