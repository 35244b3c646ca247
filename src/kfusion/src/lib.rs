//! Dense RGB-D tracking and mapping with a truncated signed distance field.
//!
//! This library fuses a stream of depth frames into a TSDF voxel volume while
//! tracking the camera against surfaces raycast from that volume.
//!
//! # Architecture
//!
//! Every frame flows through the same stages:
//! - Ingestion: raw or metric depth into an internal metric image
//! - Filtering: bilateral filter and a multi-level depth pyramid
//! - Tracking: projective point-to-plane ICP, coarse to fine
//! - Integration: running-average fusion into the volume
//! - Raycasting: vertex and normal maps for the next frame's tracking
//!
//! Per-pixel and per-voxel stages run as data-parallel loops over rayon, or as
//! CubeCL CUDA kernels with the `cuda` feature.
//!
//! # Usage
//!
//! ```ignore
//! use kfusion::{DepthInput, KFusion, KFusionConfig, RawDepthUnits};
//!
//! let config = KFusionConfig::builder()
//!     .volume([256, 256, 256], [2.0, 2.0, 2.0])
//!     .build()?;
//! let mut fusion = KFusion::new(config)?;
//! fusion.set_pose(initial_pose);
//!
//! for frame in frames {
//!     let input = DepthInput::HostRaw { samples: &frame, size, units: RawDepthUnits::MILLIMETERS };
//!     match fusion.process_frame(input)? {
//!         Some(Err(failure)) => println!("lost track: {failure}"),
//!         _ => println!("pose:\n{}", fusion.pose()),
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod image;
pub mod integrate;
pub mod kfusion;
pub mod parallel;
pub mod preprocess;
pub mod raycast;
pub mod test_utils;
pub mod timing;
pub mod tracking;
pub mod transform;
pub mod volume;

#[cfg(feature = "cuda")]
pub mod gpu;

pub use config::{ImageResolution, KFusionConfig, KFusionConfigBuilder, ReduceLayout, TrackingMode, VolumeLaunch, WorkGroup};
pub use error::{KFusionError, Result};
pub use image::{Image, ImageSize};
pub use preprocess::{DepthInput, DepthPyramid, RawDepthUnits};
pub use timing::FrameTiming;
pub use tracking::{LinearSystem, TrackOutcome, TrackRecord, TrackStatus, TrackSummary, TrackingFailure};
pub use transform::{CameraIntrinsics, Float3, Matrix4};
pub use volume::{HostVolume, PackedVoxel, Voxel, Volume};

// High-level API (recommended for most users)
pub use crate::kfusion::KFusion;

// GPU runtime (optional, for direct device access)
#[cfg(feature = "cuda")]
pub use gpu::{is_cuda_available, DeviceDepth, DeviceMaps, DeviceVolume, GpuRuntime};

/// Print only when the `test-verbose` feature is enabled.
#[macro_export]
macro_rules! test_println {
    ($($arg:tt)*) => {{
        #[cfg(feature = "test-verbose")]
        {
            println!($($arg)*);
        }
    }};
}
