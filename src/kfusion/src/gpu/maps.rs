//! Device-resident frame buffers.
//!
//! Every image the pipeline touches between ingestion and tracking lives
//! here for the lifetime of a [`crate::KFusion`] instance: the metric input,
//! the per-level depth, vertex and normal pyramid, the per-level track
//! records, and the raycast reference surface. Stages read and write these
//! handles directly; the host only sees them through explicit downloads.
//!
//! Memory layout:
//! ```text
//! raw_depth            [W × H]
//! levels[l].depth      [W/2^l × H/2^l]
//! levels[l].vertex     [W/2^l × H/2^l × 3]
//! levels[l].normal     [W/2^l × H/2^l × 3]
//! levels[l].inv_k      [16]
//! levels[l].records    [W/2^l × H/2^l × 8]   (per-pixel mode only)
//! surface.{vertex,normal,depth}                render size
//! scratch              [groups × lanes × 8]
//! sums                 [groups × lanes × 32]
//! partials             [groups × 32]
//! ```

use cubecl::prelude::*;
use cubecl::server::Handle;

use super::kernels::{RECORD_STRIDE, SYSTEM_STRIDE};
use super::runtime::GpuRuntime;
use crate::config::{KFusionConfig, ReduceLayout, TrackingMode};
use crate::error::Result;
use crate::image::ImageSize;
use crate::preprocess::gaussian_kernel;

/// Row-major image of `channels` interleaved floats per pixel.
///
/// Allocated once with uninitialized contents; the stage that owns the image
/// writes every element before any other stage reads it.
pub struct DeviceImage {
    pub(super) handle: Handle,
    size: ImageSize,
    channels: usize,
}

impl DeviceImage {
    pub(super) fn empty(runtime: &GpuRuntime, size: ImageSize, channels: usize) -> Self {
        let len = size.pixel_count() * channels;
        Self {
            handle: runtime.client().empty(len * std::mem::size_of::<f32>()),
            size,
            channels,
        }
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of floats in the buffer.
    pub(super) fn len(&self) -> usize {
        self.size.pixel_count() * self.channels
    }
}

/// Buffers of one pyramid level.
pub(super) struct DeviceLevel {
    pub(super) depth: DeviceImage,
    pub(super) vertex: DeviceImage,
    pub(super) normal: DeviceImage,
    /// Inverse intrinsics at this level, uploaded once.
    pub(super) inv_k: Handle,
    pub(super) records: Option<DeviceImage>,
}

/// Raycast output in world coordinates; the tracking reference.
pub(super) struct DeviceSurface {
    pub(super) vertex: DeviceImage,
    pub(super) normal: DeviceImage,
    pub(super) depth: DeviceImage,
}

/// All per-frame device buffers of one pipeline.
///
/// Sized from a [`KFusionConfig`] at allocation and reused for every frame,
/// so steady-state processing performs no device allocations apart from the
/// two small matrices each tracking iteration uploads. Track records exist
/// only in per-pixel mode; the fused path reduces straight into `sums`.
pub struct DeviceMaps {
    pub(super) raw_depth: DeviceImage,
    pub(super) gaussian: Handle,
    pub(super) gaussian_len: usize,
    pub(super) levels: Vec<DeviceLevel>,
    pub(super) surface: DeviceSurface,
    pub(super) scratch: Handle,
    pub(super) sums: Handle,
    pub(super) partials: Handle,
    pub(super) layout: ReduceLayout,
}

impl DeviceMaps {
    /// Allocate every buffer for `config`. Nothing is initialized except
    /// the constant tables and the reference surface, which starts empty.
    pub fn allocate(runtime: &GpuRuntime, config: &KFusionConfig) -> Result<Self> {
        let client = runtime.client();
        let render = config.render_size();
        let layout = config.reduce_layout;
        let units = (layout.groups * layout.lanes) as usize;
        let float = std::mem::size_of::<f32>();

        let gaussian = gaussian_kernel(config.delta, config.radius);
        let mut levels = Vec::with_capacity(config.pyramid_levels());
        let mut size = render;
        for level in 0..config.pyramid_levels() {
            let inv_k = config.camera.at_level(level).inverse_matrix();
            let records = (config.tracking_mode == TrackingMode::PerPixel)
                .then(|| DeviceImage::empty(runtime, size, RECORD_STRIDE as usize));
            levels.push(DeviceLevel {
                depth: DeviceImage::empty(runtime, size, 1),
                vertex: DeviceImage::empty(runtime, size, 3),
                normal: DeviceImage::empty(runtime, size, 3),
                inv_k: client.create(f32::as_bytes(&inv_k.to_row_major())),
                records,
            });
            size = size.half();
        }

        let mut maps = Self {
            raw_depth: DeviceImage::empty(runtime, render, 1),
            gaussian: client.create(f32::as_bytes(&gaussian)),
            gaussian_len: gaussian.len(),
            levels,
            surface: DeviceSurface {
                vertex: DeviceImage::empty(runtime, render, 3),
                normal: DeviceImage::empty(runtime, render, 3),
                depth: DeviceImage::empty(runtime, render, 1),
            },
            scratch: client.empty(units * RECORD_STRIDE as usize * float),
            sums: client.empty(units * SYSTEM_STRIDE as usize * float),
            partials: client.empty(layout.groups as usize * SYSTEM_STRIDE as usize * float),
            layout,
        };
        runtime.clear_surface(&mut maps, config.raycast_block);
        Ok(maps)
    }

    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    pub fn size(&self, level: usize) -> ImageSize {
        self.levels[level].depth.size()
    }

    pub fn render_size(&self) -> ImageSize {
        self.raw_depth.size()
    }
}
