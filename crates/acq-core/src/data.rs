use chrono::{DateTime, Utc};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Metadata attached to every array produced by a detector or by the
/// acquisition engine.
///
/// Positions are physical offsets from the field center (m), with the Y axis
/// pointing up (row 0 of an image is its top, i.e. the largest Y).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Free text description (usually the stream name).
    pub description: Option<String>,
    /// Detector that produced the data.
    pub detector: Option<String>,
    /// When the acquisition started.
    pub acquisition_date: Option<DateTime<Utc>>,
    /// Physical center of the data (m).
    pub position: Option<(f64, f64)>,
    /// Physical size of one pixel (m).
    pub pixel_size: Option<(f64, f64)>,
    /// Exposure time (s).
    pub exposure_time: Option<f64>,
    /// Scanner dwell time per pixel (s).
    pub dwell_time: Option<f64>,
    /// Number of sub-exposures averaged into this array.
    pub integration_count: Option<u32>,
    /// Auxiliary axis position the data was taken at.
    pub aux_position: Option<String>,
    /// Dimension labels, outermost first (e.g. "YX", "CYX").
    pub dims: Option<String>,
}

/// N-dimensional measurement with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DataArray {
    /// Sample values.
    pub data: ArrayD<f64>,
    /// Acquisition metadata.
    pub metadata: Metadata,
}

impl DataArray {
    /// Wrap an array.
    pub fn new(data: ArrayD<f64>, metadata: Metadata) -> Self {
        Self { data, metadata }
    }

    /// A single scalar sample, stored as a `1×1` array.
    pub fn point(value: f64, metadata: Metadata) -> Self {
        Self {
            data: ArrayD::from_elem(IxDyn(&[1, 1]), value),
            metadata,
        }
    }

    /// Array shape.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Mean value (0.0 for an empty array).
    pub fn mean(&self) -> f64 {
        self.data.mean().unwrap_or(0.0)
    }

    /// Acquisition timestamp, falling back to the epoch when unknown.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.acquisition_date.unwrap_or_default()
    }
}
