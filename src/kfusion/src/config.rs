//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::error::{KFusionError, Result};
use crate::image::ImageSize;
use crate::transform::{CameraIntrinsics, Float3};

pub use crate::parallel::{VolumeLaunch, WorkGroup};

/// Largest work group a device launch accepts.
pub const MAX_GROUP_UNITS: u32 = 1024;

/// Resolution of the processing and render images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageResolution {
    /// 320x240; 640x480 input is down-sampled by 2.
    #[default]
    Half,
    /// 640x480.
    Full,
}

impl ImageResolution {
    pub fn size(&self) -> ImageSize {
        match self {
            ImageResolution::Half => ImageSize::new(320, 240),
            ImageResolution::Full => ImageSize::new(640, 480),
        }
    }
}

/// How tracking turns the current and reference maps into a linear system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrackingMode {
    /// Write one record per pixel, then reduce the record image.
    #[default]
    PerPixel,
    /// Compute each pixel's contribution inside the reduction itself.
    Fused,
}

/// Partition used by the two-phase reduction.
///
/// Output depends on this partition only in floating-point summation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceLayout {
    /// Independent groups; each produces one partial sum.
    pub groups: u32,
    /// Lanes per group; must be a power of two for the in-group tree.
    pub lanes: u32,
}

impl Default for ReduceLayout {
    fn default() -> Self {
        Self {
            groups: 8,
            lanes: 128,
        }
    }
}

/// Configuration for [`KFusion`](crate::KFusion).
///
/// Covers the volume geometry, camera, raycast range, preprocessing filter,
/// tracking schedule and thresholds, and the launch shapes of every stage.
/// [`Default`] gives a 64³ volume spanning 1 m, processed at half of
/// 640x480 with three pyramid levels. Build variations with
/// [`KFusionConfig::builder`]; the pipeline runs
/// [`validate`](Self::validate) before allocating anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KFusionConfig {
    /// Voxel counts along x, y, z.
    pub volume_size: [u32; 3],
    /// World extent of the volume in meters. The volume spans [0, dim].
    pub volume_dimensions: [f32; 3],
    pub resolution: ImageResolution,
    /// Intrinsics at the processing resolution.
    pub camera: CameraIntrinsics,
    /// Raycast clipping range in meters.
    pub near_plane: f32,
    pub far_plane: f32,
    /// Truncation distance in meters.
    pub mu: f32,
    /// Per-voxel weight cap.
    pub max_weight: f32,
    /// Bilateral filter half-width in pixels.
    pub radius: u32,
    /// Spatial sigma of the bilateral filter, in pixels.
    pub delta: f32,
    /// Range sigma of the bilateral filter, in meters.
    pub e_delta: f32,
    /// ICP correspondence distance gate in meters.
    pub dist_threshold: f32,
    /// ICP minimum normal dot product.
    pub normal_threshold: f32,
    /// ICP iterations per pyramid level, finest first.
    pub iterations: Vec<u32>,
    pub image_block: WorkGroup,
    pub raycast_block: WorkGroup,
    pub reduce_layout: ReduceLayout,
    pub tracking_mode: TrackingMode,
    /// Minimum fraction of render pixels that must be valid after tracking.
    pub track_min_fraction: f32,
    /// Maximum accepted RMSE of the point-to-plane residual in meters.
    pub track_max_rmse: f32,
    /// Largest eigenvalue ratio of JᵀJ the solver accepts, as its inverse.
    pub solver_tolerance: f64,
    /// Run the CubeCL kernels when a CUDA device is present.
    pub use_gpu: bool,
}

impl Default for KFusionConfig {
    fn default() -> Self {
        Self {
            volume_size: [64, 64, 64],
            volume_dimensions: [1.0, 1.0, 1.0],
            resolution: ImageResolution::Half,
            camera: CameraIntrinsics::new(531.15 / 2.0, 531.15 / 2.0, 640.0 / 4.0, 480.0 / 4.0),
            near_plane: 0.4,
            far_plane: 4.0,
            mu: 0.1,
            max_weight: 100.0,
            radius: 2,
            delta: 4.0,
            e_delta: 0.1,
            dist_threshold: 0.2,
            normal_threshold: 0.7,
            iterations: vec![5, 5, 5],
            image_block: WorkGroup::new(20, 20, 1),
            raycast_block: WorkGroup::new(16, 16, 1),
            reduce_layout: ReduceLayout::default(),
            tracking_mode: TrackingMode::PerPixel,
            track_min_fraction: 0.15,
            track_max_rmse: 2e-2,
            solver_tolerance: 1e-6,
            use_gpu: false,
        }
    }
}

impl KFusionConfig {
    pub fn builder() -> KFusionConfigBuilder {
        KFusionConfigBuilder::new()
    }

    pub fn render_size(&self) -> ImageSize {
        self.resolution.size()
    }

    pub fn pyramid_levels(&self) -> usize {
        self.iterations.len()
    }

    /// Edge lengths of one voxel.
    pub fn voxel_size(&self) -> Float3 {
        Float3::new(
            self.volume_dimensions[0] / self.volume_size[0] as f32,
            self.volume_dimensions[1] / self.volume_size[1] as f32,
            self.volume_dimensions[2] / self.volume_size[2] as f32,
        )
    }

    /// Fine raycast step: half the smallest voxel edge.
    pub fn step_size(&self) -> f32 {
        let dim = self.volume_dimensions.iter().cloned().fold(f32::INFINITY, f32::min);
        let size = self.volume_size.iter().copied().max().unwrap_or(1) as f32;
        0.5 * dim / size
    }

    /// Coarse raycast step used while far from any surface.
    pub fn large_step(&self) -> f32 {
        0.75 * self.mu
    }

    pub fn volume_launch(&self) -> VolumeLaunch {
        VolumeLaunch::for_volume(self.volume_size)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(KFusionError::InvalidConfig(msg));

        if self.volume_size.iter().any(|&s| s == 0) {
            return invalid(format!("volume size must be positive, got {:?}", self.volume_size));
        }
        if self.volume_dimensions.iter().any(|&d| !(d > 0.0 && d.is_finite())) {
            return invalid(format!(
                "volume dimensions must be positive, got {:?}",
                self.volume_dimensions
            ));
        }
        if !(self.near_plane > 0.0 && self.near_plane < self.far_plane) {
            return invalid(format!(
                "need 0 < near < far, got near={} far={}",
                self.near_plane, self.far_plane
            ));
        }
        if !(self.mu > 0.0) {
            return invalid(format!("mu must be positive, got {}", self.mu));
        }
        if !(self.max_weight >= 1.0 && self.max_weight <= u16::MAX as f32) {
            return invalid(format!(
                "max weight must be in [1, {}], got {}",
                u16::MAX,
                self.max_weight
            ));
        }
        if !(self.delta > 0.0 && self.e_delta > 0.0) {
            return invalid("bilateral sigmas must be positive".to_string());
        }
        if !(-1.0..=1.0).contains(&self.normal_threshold) {
            return invalid(format!(
                "normal threshold must be a cosine, got {}",
                self.normal_threshold
            ));
        }
        if !(self.dist_threshold > 0.0) {
            return invalid(format!(
                "distance threshold must be positive, got {}",
                self.dist_threshold
            ));
        }
        if self.iterations.is_empty() {
            return invalid("at least one pyramid level is required".to_string());
        }
        let size = self.render_size();
        let coarsest = u32::try_from(self.iterations.len() - 1)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift));
        let divides = coarsest.is_some_and(|c| size.width % c == 0 && size.height % c == 0);
        if !divides {
            return invalid(format!(
                "{} pyramid levels do not divide render size {size}",
                self.iterations.len()
            ));
        }
        for (name, block) in [("image", self.image_block), ("raycast", self.raycast_block)] {
            if block.x == 0 || block.y == 0 {
                return invalid(format!("{name} block must be non-empty, got {block:?}"));
            }
            let units = u64::from(block.x) * u64::from(block.y);
            if units > u64::from(MAX_GROUP_UNITS) {
                return invalid(format!(
                    "{name} block has {units} units, at most {MAX_GROUP_UNITS} are supported"
                ));
            }
        }
        let layout = self.reduce_layout;
        if layout.groups == 0 || !layout.lanes.is_power_of_two() || layout.lanes > MAX_GROUP_UNITS {
            return invalid(format!(
                "reduce layout needs groups > 0 and power-of-two lanes, got {layout:?}"
            ));
        }
        if !(0.0..=1.0).contains(&self.track_min_fraction) || !(self.track_max_rmse > 0.0) {
            return invalid("tracking acceptance thresholds out of range".to_string());
        }
        if !(self.solver_tolerance > 0.0 && self.solver_tolerance < 1.0) {
            return invalid(format!(
                "solver tolerance must be in (0, 1), got {}",
                self.solver_tolerance
            ));
        }
        Ok(())
    }
}

/// Builder for [`KFusionConfig`].
#[derive(Debug, Clone, Default)]
pub struct KFusionConfigBuilder {
    config: KFusionConfig,
}

impl KFusionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the voxel grid and its world extent.
    pub fn volume(mut self, size: [u32; 3], dimensions: [f32; 3]) -> Self {
        self.config.volume_size = size;
        self.config.volume_dimensions = dimensions;
        self
    }

    pub fn resolution(mut self, resolution: ImageResolution) -> Self {
        self.config.resolution = resolution;
        self
    }

    pub fn camera(mut self, camera: CameraIntrinsics) -> Self {
        self.config.camera = camera;
        self
    }

    pub fn clip_planes(mut self, near: f32, far: f32) -> Self {
        self.config.near_plane = near;
        self.config.far_plane = far;
        self
    }

    /// Set the truncation distance.
    pub fn mu(mut self, mu: f32) -> Self {
        self.config.mu = mu;
        self
    }

    pub fn max_weight(mut self, max_weight: f32) -> Self {
        self.config.max_weight = max_weight;
        self
    }

    /// Set bilateral radius and its spatial/range sigmas.
    pub fn bilateral(mut self, radius: u32, delta: f32, e_delta: f32) -> Self {
        self.config.radius = radius;
        self.config.delta = delta;
        self.config.e_delta = e_delta;
        self
    }

    pub fn icp_thresholds(mut self, dist_threshold: f32, normal_threshold: f32) -> Self {
        self.config.dist_threshold = dist_threshold;
        self.config.normal_threshold = normal_threshold;
        self
    }

    /// Iterations per pyramid level, finest first.
    pub fn iterations(mut self, iterations: Vec<u32>) -> Self {
        self.config.iterations = iterations;
        self
    }

    pub fn image_block(mut self, block: WorkGroup) -> Self {
        self.config.image_block = block;
        self
    }

    pub fn raycast_block(mut self, block: WorkGroup) -> Self {
        self.config.raycast_block = block;
        self
    }

    pub fn reduce_layout(mut self, groups: u32, lanes: u32) -> Self {
        self.config.reduce_layout = ReduceLayout { groups, lanes };
        self
    }

    pub fn tracking_mode(mut self, mode: TrackingMode) -> Self {
        self.config.tracking_mode = mode;
        self
    }

    /// Set the tracking acceptance gates.
    pub fn track_acceptance(mut self, min_fraction: f32, max_rmse: f32) -> Self {
        self.config.track_min_fraction = min_fraction;
        self.config.track_max_rmse = max_rmse;
        self
    }

    pub fn solver_tolerance(mut self, tolerance: f64) -> Self {
        self.config.solver_tolerance = tolerance;
        self
    }

    /// Enable or disable GPU acceleration.
    ///
    /// Falls back to CPU if CUDA is not available.
    pub fn use_gpu(mut self, use_gpu: bool) -> Self {
        self.config.use_gpu = use_gpu;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<KFusionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
