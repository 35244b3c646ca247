//! Frame pipeline: ingest, filter, track, integrate, raycast.

use tracing::{debug, info, warn};

use crate::config::{KFusionConfig, VolumeLaunch};
use crate::error::{KFusionError, Result};
use crate::image::Image;
use crate::integrate::{integrate, IntegrateParams};
use crate::preprocess::{bilateral_filter, gaussian_kernel, ingest_metric, ingest_raw, DepthInput, DepthPyramid, INVALID_NORMAL};
use crate::raycast::{raycast, RaycastParams};
use crate::timing::{FrameTiming, Timer, TimingCollector};
use crate::tracking::{ReferenceFrame, TrackOutcome, Tracker};
use crate::transform::{Float3, Matrix4};
use crate::volume::{HostVolume, Volume};
use crate::time_phase;

#[cfg(feature = "cuda")]
use crate::gpu::{is_cuda_available, DeviceMaps, DeviceVolume, GpuRuntime};

/// Map and frame buffers of the CPU backend.
struct HostMaps {
    volume: Volume,
    raw_depth: Image<f32>,
    gaussian: Vec<f32>,
    pyramid: DepthPyramid,
    /// Raycast output, in world coordinates; the tracking reference.
    vertex: Image<Float3>,
    normal: Image<Float3>,
    depth: Image<f32>,
}

impl HostMaps {
    fn allocate(config: &KFusionConfig) -> Result<Self> {
        let size = config.render_size();
        Ok(Self {
            volume: Volume::allocate(config.volume_size, config.volume_dimensions)?,
            raw_depth: Image::allocate(size, 0.0, "raw depth")?,
            gaussian: gaussian_kernel(config.delta, config.radius),
            pyramid: DepthPyramid::allocate(size, config.pyramid_levels())?,
            vertex: Image::allocate(size, Float3::zeros(), "raycast vertex")?,
            normal: Image::allocate(size, INVALID_NORMAL, "raycast normal")?,
            depth: Image::allocate(size, 0.0, "raycast depth")?,
        })
    }

    fn clear_surface(&mut self) {
        self.vertex.fill(Float3::zeros());
        self.normal.fill(INVALID_NORMAL);
        self.depth.fill(0.0);
    }
}

/// Map and frame buffers of the CUDA backend. Everything but the staging
/// image lives on the device.
#[cfg(feature = "cuda")]
struct DeviceBackend {
    runtime: GpuRuntime,
    volume: DeviceVolume,
    maps: DeviceMaps,
    /// Host input converted to meters before upload.
    staging: Image<f32>,
}

/// Which backend runs the stages, with the buffers it owns.
enum Backend {
    Host(HostMaps),
    #[cfg(feature = "cuda")]
    Device(DeviceBackend),
}

/// Dense tracking and mapping pipeline.
///
/// Frames are processed strictly one at a time. Each stage reads only the
/// buffers written by earlier stages and runs to completion before the next.
/// With the CUDA backend every intermediate image stays on the device; the
/// map accessors return explicit host copies.
///
/// ```ignore
/// let mut fusion = KFusion::new(KFusionConfig::default())?;
/// fusion.set_pose(initial_pose);
/// for frame in frames {
///     fusion.ingest_depth(DepthInput::HostRaw { samples: &frame, size, units: RawDepthUnits::MILLIMETERS })?;
///     fusion.filter_depth()?;
///     if fusion.track()?.is_ok() {
///         fusion.integrate()?;
///     }
/// }
/// ```
pub struct KFusion {
    config: KFusionConfig,
    volume_launch: VolumeLaunch,
    backend: Backend,

    pose: Matrix4,
    inv_pose: Matrix4,

    has_depth: bool,
    raycast_pose: Matrix4,
    has_reference: bool,

    tracker: Tracker,
    timing: TimingCollector,
}

impl KFusion {
    /// Allocate every buffer the pipeline needs. Fails on an invalid
    /// configuration or when any allocation cannot be satisfied.
    pub fn new(config: KFusionConfig) -> Result<Self> {
        config.validate()?;
        let volume_launch = config.volume_launch();
        let backend = Self::create_backend(&config)?;
        let tracker = match &backend {
            Backend::Host(_) => Tracker::new(&config)?,
            #[cfg(feature = "cuda")]
            Backend::Device(_) => Tracker::for_device(&config)?,
        };
        let fusion = Self {
            volume_launch,
            backend,
            pose: Matrix4::identity(),
            inv_pose: Matrix4::identity(),
            has_depth: false,
            raycast_pose: Matrix4::identity(),
            has_reference: false,
            tracker,
            timing: TimingCollector::new(),
            config,
        };
        info!(
            volume = ?fusion.config.volume_size,
            dimensions = ?fusion.config.volume_dimensions,
            render = %fusion.config.render_size(),
            levels = fusion.config.pyramid_levels(),
            backend = fusion.backend_name(),
            "initialized fusion pipeline"
        );
        Ok(fusion)
    }

    fn create_backend(config: &KFusionConfig) -> Result<Backend> {
        if config.use_gpu {
            #[cfg(feature = "cuda")]
            {
                if is_cuda_available() {
                    let runtime = GpuRuntime::new()?;
                    let volume = runtime.create_volume(
                        config.volume_size,
                        config.volume_dimensions,
                        config.volume_launch(),
                    )?;
                    let maps = DeviceMaps::allocate(&runtime, config)?;
                    let staging = Image::allocate(config.render_size(), 0.0, "depth staging")?;
                    return Ok(Backend::Device(DeviceBackend {
                        runtime,
                        volume,
                        maps,
                        staging,
                    }));
                }
                warn!("CUDA device not available, falling back to CPU");
            }
            #[cfg(not(feature = "cuda"))]
            warn!("built without the `cuda` feature, falling back to CPU");
        }
        Ok(Backend::Host(HostMaps::allocate(config)?))
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Host(_) => "cpu",
            #[cfg(feature = "cuda")]
            Backend::Device(_) => "cuda",
        }
    }

    pub fn config(&self) -> &KFusionConfig {
        &self.config
    }

    pub fn volume_launch(&self) -> &VolumeLaunch {
        &self.volume_launch
    }

    /// Empty the map and invalidate the tracking reference. The pose is
    /// left unchanged; the next frame is integrated without tracking.
    pub fn reset(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Host(maps) => {
                maps.volume.reset();
                maps.clear_surface();
            }
            #[cfg(feature = "cuda")]
            Backend::Device(device) => {
                device.runtime.reset_volume(&device.volume)?;
                device.runtime.clear_surface(&mut device.maps, self.config.raycast_block);
            }
        }
        self.has_reference = false;
        debug!("volume reset");
        Ok(())
    }

    /// Overwrite the camera-to-world pose.
    pub fn set_pose(&mut self, pose: Matrix4) {
        self.pose = pose;
        self.inv_pose = pose.inverse_rigid();
    }

    pub fn pose(&self) -> &Matrix4 {
        &self.pose
    }

    pub fn inverse_pose(&self) -> &Matrix4 {
        &self.inv_pose
    }

    /// Convert a depth frame into the internal metric buffer. Starts a new
    /// frame for timing purposes.
    pub fn ingest_depth(&mut self, input: DepthInput<'_>) -> Result<()> {
        self.timing.start_frame();
        let timer = Timer::new("filter");
        let block = self.config.image_block;
        match &mut self.backend {
            Backend::Host(maps) => match input {
                DepthInput::HostRaw { samples, size, units } => {
                    ingest_raw(&mut maps.raw_depth, samples, size, units, block)?
                }
                DepthInput::HostMetric { depth, size } => ingest_metric(&mut maps.raw_depth, depth, size, block)?,
                #[cfg(feature = "cuda")]
                DepthInput::Device(_) => {
                    return Err(KFusionError::Device(anyhow::anyhow!(
                        "device-resident depth passed to the CPU backend"
                    )));
                }
            },
            #[cfg(feature = "cuda")]
            Backend::Device(device) => match input {
                DepthInput::HostRaw { samples, size, units } => {
                    ingest_raw(&mut device.staging, samples, size, units, block)?;
                    device.runtime.load_depth(&mut device.maps, &device.staging)?;
                }
                DepthInput::HostMetric { depth, size } => {
                    ingest_metric(&mut device.staging, depth, size, block)?;
                    device.runtime.load_depth(&mut device.maps, &device.staging)?;
                }
                DepthInput::Device(depth) => device.runtime.ingest_depth(&mut device.maps, depth, block)?,
            },
        }
        self.has_depth = true;
        self.timing.record_phase("filter", timer.elapsed_ms());
        Ok(())
    }

    /// Bilateral-filter the ingested depth and rebuild the pyramid.
    pub fn filter_depth(&mut self) -> Result<()> {
        self.require_depth()?;
        let timer = Timer::new("filter");
        let camera = self.config.camera;
        let block = self.config.image_block;
        match &mut self.backend {
            Backend::Host(maps) => {
                bilateral_filter(
                    &mut maps.pyramid.depth[0],
                    &maps.raw_depth,
                    &maps.gaussian,
                    self.config.e_delta,
                    self.config.radius,
                    block,
                );
                maps.pyramid.build_from_base(&camera, self.config.e_delta, block);
            }
            #[cfg(feature = "cuda")]
            Backend::Device(device) => {
                device
                    .runtime
                    .preprocess(&mut device.maps, self.config.e_delta, self.config.radius, block)?;
            }
        }
        self.timing.record_phase("filter", timer.elapsed_ms());
        Ok(())
    }

    /// Align the filtered frame against the last raycast.
    ///
    /// The outer `Result` carries fatal errors. The inner [`TrackOutcome`]
    /// reports whether this frame tracked; on failure the pose is unchanged.
    pub fn track(&mut self) -> Result<TrackOutcome> {
        self.require_depth()?;
        if !self.has_reference {
            debug!("no raycast reference yet, tracking will find no correspondences");
        }
        let view = self.config.camera.matrix() * self.raycast_pose.inverse_rigid();
        let outcome = match &self.backend {
            Backend::Host(maps) => {
                let reference = ReferenceFrame {
                    vertex: &maps.vertex,
                    normal: &maps.normal,
                    view,
                };
                self.tracker
                    .track(&maps.pyramid, &reference, &mut self.pose, &mut self.timing)
            }
            #[cfg(feature = "cuda")]
            Backend::Device(device) => self.tracker.track_on_device(
                &device.runtime,
                &device.maps,
                &view,
                &mut self.pose,
                &mut self.timing,
            )?,
        };
        if let Ok(summary) = &outcome {
            self.inv_pose = self.pose.inverse_rigid();
            debug!(
                iterations = summary.iterations,
                valid = summary.valid_pixels,
                rmse = summary.rmse,
                "tracked frame"
            );
        }
        Ok(outcome)
    }

    /// Fuse the ingested depth at the current pose, then refresh the
    /// tracking reference by raycasting.
    pub fn integrate(&mut self) -> Result<()> {
        self.require_depth()?;
        let params = IntegrateParams {
            mu: self.config.mu,
            max_weight: self.config.max_weight,
        };
        let k = self.config.camera.matrix();
        time_phase!(self.timing, "integrate", {
            match &mut self.backend {
                Backend::Host(maps) => {
                    integrate(&mut maps.volume, &maps.raw_depth, &self.inv_pose, &k, params, &self.volume_launch);
                }
                #[cfg(feature = "cuda")]
                Backend::Device(device) => {
                    device
                        .runtime
                        .integrate(&device.volume, &device.maps, &self.inv_pose, &k, params)?;
                }
            }
        });
        self.raycast()
    }

    /// Render the map from the current pose into the reference maps.
    pub fn raycast(&mut self) -> Result<()> {
        let timer = Timer::new("raycast");
        let view = self.pose * self.config.camera.inverse_matrix();
        let params = RaycastParams {
            near_plane: self.config.near_plane,
            far_plane: self.config.far_plane,
            step: self.config.step_size(),
            large_step: self.config.large_step(),
        };
        let block = self.config.raycast_block;
        match &mut self.backend {
            Backend::Host(maps) => {
                let HostMaps {
                    volume,
                    vertex,
                    normal,
                    depth,
                    ..
                } = maps;
                raycast(vertex, normal, depth, volume, &view, &params, block);
            }
            #[cfg(feature = "cuda")]
            Backend::Device(device) => {
                device
                    .runtime
                    .raycast(&device.volume, &mut device.maps, &view, &params, block)?;
            }
        }
        self.raycast_pose = self.pose;
        self.has_reference = true;
        self.timing.record_phase("raycast", timer.elapsed_ms());
        Ok(())
    }

    /// Ingest, filter, and track one frame, integrating it when tracking
    /// succeeds. The first frame after construction or [`KFusion::reset`]
    /// has nothing to track against; it is integrated at the current pose
    /// and `None` is returned.
    pub fn process_frame(&mut self, input: DepthInput<'_>) -> Result<Option<TrackOutcome>> {
        self.ingest_depth(input)?;
        self.filter_depth()?;
        if !self.has_reference {
            self.integrate()?;
            return Ok(None);
        }
        let outcome = self.track()?;
        if outcome.is_ok() {
            self.integrate()?;
        }
        Ok(Some(outcome))
    }

    /// Whether a raycast has produced a reference since construction or the
    /// last reset.
    pub fn has_reference(&self) -> bool {
        self.has_reference
    }

    /// Copy of the raycast vertex map, in world coordinates.
    pub fn vertex_map(&self) -> Result<Image<Float3>> {
        match &self.backend {
            Backend::Host(maps) => Ok(maps.vertex.clone()),
            #[cfg(feature = "cuda")]
            Backend::Device(device) => Ok(device.runtime.download_surface(&device.maps)?.0),
        }
    }

    /// Copy of the raycast normal map; misses hold [`INVALID_NORMAL`].
    pub fn normal_map(&self) -> Result<Image<Float3>> {
        match &self.backend {
            Backend::Host(maps) => Ok(maps.normal.clone()),
            #[cfg(feature = "cuda")]
            Backend::Device(device) => Ok(device.runtime.download_surface(&device.maps)?.1),
        }
    }

    /// Copy of the raycast depth map (ray parameter; 0 for misses).
    pub fn depth_map(&self) -> Result<Image<f32>> {
        match &self.backend {
            Backend::Host(maps) => Ok(maps.depth.clone()),
            #[cfg(feature = "cuda")]
            Backend::Device(device) => Ok(device.runtime.download_surface(&device.maps)?.2),
        }
    }

    /// Metric depth of the last ingested frame, at render size.
    pub fn input_depth(&self) -> Result<Image<f32>> {
        match &self.backend {
            Backend::Host(maps) => Ok(maps.raw_depth.clone()),
            #[cfg(feature = "cuda")]
            Backend::Device(device) => Ok(device.runtime.download_input(&device.maps)?),
        }
    }

    /// Bilateral-filtered input at render size.
    pub fn filtered_depth(&self) -> Result<Image<f32>> {
        match &self.backend {
            Backend::Host(maps) => Ok(maps.pyramid.depth[0].clone()),
            #[cfg(feature = "cuda")]
            Backend::Device(device) => Ok(device.runtime.download_level_depth(&device.maps, 0)?),
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Copy of the map in host memory.
    pub fn volume_to_host(&self) -> Result<HostVolume> {
        match &self.backend {
            Backend::Host(maps) => Ok(maps.volume.to_host()),
            #[cfg(feature = "cuda")]
            Backend::Device(device) => Ok(device.runtime.download_volume(&device.volume)?),
        }
    }

    /// Stage timings of the current frame.
    pub fn last_timing(&self) -> FrameTiming {
        self.timing.current()
    }

    fn require_depth(&self) -> Result<()> {
        if self.has_depth {
            Ok(())
        } else {
            Err(KFusionError::NoDepth)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageSize;
    use crate::preprocess::RawDepthUnits;
    use crate::test_utils::{corner_scene, pose_from_euler, test_config};

    fn start_pose() -> Matrix4 {
        pose_from_euler(Float3::new(1.0, 1.0, 0.0), 0.0, 0.0, 0.0)
    }

    #[test]
    fn test_stages_require_depth() {
        let mut fusion = KFusion::new(test_config()).unwrap();
        assert!(matches!(fusion.filter_depth(), Err(KFusionError::NoDepth)));
        assert!(matches!(fusion.track(), Err(KFusionError::NoDepth)));
        assert!(matches!(fusion.integrate(), Err(KFusionError::NoDepth)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.mu = 0.0;
        assert!(matches!(KFusion::new(config), Err(KFusionError::InvalidConfig(_))));
    }

    #[test]
    fn test_ingest_rejects_wrong_size() {
        let mut fusion = KFusion::new(test_config()).unwrap();
        let size = ImageSize::new(100, 100);
        let samples = vec![1000u16; size.pixel_count()];
        let result = fusion.ingest_depth(DepthInput::HostRaw {
            samples: &samples,
            size,
            units: RawDepthUnits::MILLIMETERS,
        });
        assert!(matches!(result, Err(KFusionError::DimensionMismatch { .. })));

        let short = vec![1.0f32; 10];
        let result = fusion.ingest_depth(DepthInput::HostMetric {
            depth: &short,
            size: fusion.config().render_size(),
        });
        assert!(matches!(result, Err(KFusionError::BufferLength { .. })));
    }

    #[test]
    fn test_set_pose_keeps_inverse() {
        let mut fusion = KFusion::new(test_config()).unwrap();
        let pose = pose_from_euler(Float3::new(0.5, 0.2, -0.1), 0.1, 0.2, -0.3);
        fusion.set_pose(pose);
        let product = *fusion.pose() * *fusion.inverse_pose();
        for r in 0..4 {
            for c in 0..4 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((product.rows[r][c] - expected).abs() < 1e-5);
            }
        }
    }

    fn ingest_scene(fusion: &mut KFusion, pose: &Matrix4) {
        let config = fusion.config().clone();
        let depth = corner_scene().render_depth(pose, &config.camera, config.render_size());
        fusion
            .ingest_depth(DepthInput::HostMetric {
                depth: depth.as_slice(),
                size: depth.size(),
            })
            .unwrap();
    }

    #[test]
    fn test_integrate_then_reset() {
        let config = test_config();
        let mut fusion = KFusion::new(config.clone()).unwrap();
        fusion.set_pose(start_pose());
        ingest_scene(&mut fusion, &start_pose());
        fusion.integrate().unwrap();

        assert!(fusion.has_reference());
        assert!(fusion.volume_to_host().unwrap().observed_count() > 0);
        let hits = fusion.depth_map().unwrap().as_slice().iter().filter(|&&d| d > 0.0).count();
        assert!(hits > config.render_size().pixel_count() / 2);

        let pose_before = *fusion.pose();
        fusion.reset().unwrap();
        assert_eq!(fusion.volume_to_host().unwrap().observed_count(), 0);
        assert_eq!(*fusion.pose(), pose_before);
    }

    #[test]
    fn test_reset_clears_reference_surface() {
        let mut fusion = KFusion::new(test_config()).unwrap();
        fusion.set_pose(start_pose());
        ingest_scene(&mut fusion, &start_pose());
        fusion.filter_depth().unwrap();
        fusion.integrate().unwrap();
        fusion.reset().unwrap();

        assert!(!fusion.has_reference());
        assert!(fusion.depth_map().unwrap().as_slice().iter().all(|&d| d == 0.0));
        assert!(fusion.vertex_map().unwrap().as_slice().iter().all(|v| *v == Float3::zeros()));
        assert!(fusion.normal_map().unwrap().as_slice().iter().all(|n| *n == INVALID_NORMAL));

        // The same frame no longer finds anything to align against.
        let nudged = pose_from_euler(Float3::new(1.01, 1.0, 0.0), 0.0, 0.0, 0.0);
        fusion.set_pose(nudged);
        let outcome = fusion.track().unwrap();
        assert!(outcome.is_err());
        assert_eq!(*fusion.pose(), nudged);
    }
}
