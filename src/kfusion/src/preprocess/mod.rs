//! Depth preprocessing: ingestion, filtering, and the multi-scale pyramid.
//!
//! Level 0 of the pyramid is the bilateral-filtered input at render size.
//! Each coarser level is a robust half-sample of the one above. Every level
//! carries camera-frame vertex and normal maps computed with that level's
//! intrinsics.

mod bilateral;
mod geometry;
mod ingest;

pub use bilateral::{bilateral_filter, bilateral_pixel, gaussian_kernel, half_sample_robust};
pub use geometry::{depth_to_vertex, is_valid_normal, vertex_to_normal, INVALID_NORMAL};
pub use ingest::{ingest_metric, ingest_raw, input_stride, DepthInput, RawDepthUnits};

use tracing::debug;

use crate::error::Result;
use crate::image::{Image, ImageSize};
use crate::parallel::WorkGroup;
use crate::transform::{CameraIntrinsics, Float3};

/// Depth, vertex, and normal images for every pyramid level, finest first.
///
/// Level `l` is `base / 2^l` in each dimension. Vertices are in camera
/// coordinates of that level; pixels without a valid normal hold
/// [`INVALID_NORMAL`].
#[derive(Debug, Clone)]
pub struct DepthPyramid {
    pub depth: Vec<Image<f32>>,
    pub vertex: Vec<Image<Float3>>,
    pub normal: Vec<Image<Float3>>,
}

impl DepthPyramid {
    pub fn allocate(base: ImageSize, levels: usize) -> Result<Self> {
        let mut depth = Vec::with_capacity(levels);
        let mut vertex = Vec::with_capacity(levels);
        let mut normal = Vec::with_capacity(levels);
        let mut size = base;
        for _ in 0..levels {
            depth.push(Image::allocate(size, 0.0, "pyramid depth")?);
            vertex.push(Image::allocate(size, Float3::zeros(), "pyramid vertex")?);
            normal.push(Image::allocate(size, INVALID_NORMAL, "pyramid normal")?);
            size = size.half();
        }
        Ok(Self {
            depth,
            vertex,
            normal,
        })
    }

    pub fn levels(&self) -> usize {
        self.depth.len()
    }

    pub fn size(&self, level: usize) -> ImageSize {
        self.depth[level].size()
    }

    /// Rebuild every level from `depth[0]`, which the caller has filled.
    pub fn build_from_base(&mut self, camera: &CameraIntrinsics, e_delta: f32, block: WorkGroup) {
        for level in 1..self.levels() {
            let (finer, coarser) = self.depth.split_at_mut(level);
            half_sample_robust(&mut coarser[0], &finer[level - 1], 3.0 * e_delta, block);
        }
        self.build_geometry(camera, block);
    }

    /// Recompute vertex and normal maps from the current depth levels.
    pub fn build_geometry(&mut self, camera: &CameraIntrinsics, block: WorkGroup) {
        for level in 0..self.levels() {
            let inv_k = camera.at_level(level).inverse_matrix();
            depth_to_vertex(&mut self.vertex[level], &self.depth[level], &inv_k, block);
            vertex_to_normal(&mut self.normal[level], &self.vertex[level], block);
        }
        debug!(levels = self.levels(), base = %self.size(0), "built depth pyramid");
    }
}
