//! Error types for the fusion pipeline.
//!
//! Fatal conditions (allocation, size mismatches, device failures) are
//! [`KFusionError`]. A frame that fails to track is not fatal and is reported
//! as a [`TrackingFailure`](crate::tracking::TrackingFailure) instead.

use thiserror::Error;

use crate::image::ImageSize;

#[derive(Debug, Error)]
pub enum KFusionError {
    /// A buffer could not be reserved at initialization.
    #[error("failed to allocate {bytes} bytes for {what}")]
    Allocation { what: &'static str, bytes: usize },

    /// Input image size does not match what the pipeline was built for.
    #[error("image size mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        expected: ImageSize,
        actual: ImageSize,
    },

    /// Sample buffer length disagrees with the declared image size.
    #[error("depth buffer holds {actual} samples, image size needs {expected}")]
    BufferLength { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device execution failure; surfaced immediately, never retried.
    #[error(transparent)]
    Device(#[from] anyhow::Error),

    /// A stage that consumes depth was called before any frame was ingested.
    #[error("no depth frame has been ingested")]
    NoDepth,
}

pub type Result<T> = std::result::Result<T, KFusionError>;
