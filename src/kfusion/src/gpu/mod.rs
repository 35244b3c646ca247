//! CubeCL CUDA backend for the per-pixel and per-voxel stages.

mod kernels;
mod maps;
mod runtime;

pub use maps::DeviceMaps;
pub use runtime::{is_cuda_available, DeviceDepth, DeviceVolume, GpuRuntime};
