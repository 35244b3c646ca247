//! Frame-to-model ICP tracking.
//!
//! Each iteration associates current-frame vertices with the raycast
//! reference by projection, linearizes the point-to-plane residual, reduces
//! the per-pixel contributions to a 6x6 system, and applies the solved twist
//! on the left of the pose. Levels run coarsest first.

mod linearize;
mod reduce;
mod solver;
mod types;

pub use linearize::{track, track_pixel, ReferenceFrame, TrackParams};
pub use reduce::{combine_partials, reduce, reduce_partials, track_and_reduce, tree_reduce};
pub use solver::solve_twist;
pub use types::{
    slot, LinearSystem, TrackOutcome, TrackRecord, TrackStatus, TrackSummary, TrackingFailure,
    REDUCTION_WIDTH,
};

use std::convert::Infallible;

use tracing::{debug, warn};

use crate::config::{KFusionConfig, ReduceLayout, TrackingMode};
use crate::error::Result;
use crate::image::{Image, ImageSize};
use crate::parallel::WorkGroup;
use crate::preprocess::DepthPyramid;
use crate::timing::{Timer, TimingCollector};
use crate::transform::{se3_exp, Matrix4};

/// Iteration schedule and acceptance thresholds.
#[derive(Debug, Clone)]
struct Schedule {
    iterations: Vec<u32>,
    min_fraction: f32,
    max_rmse: f32,
    solver_tolerance: f64,
}

/// Coarse-to-fine ICP driver.
///
/// Holds the association gates, the per-level iteration schedule, the
/// acceptance thresholds and the reduction layout taken from a
/// [`KFusionConfig`]. In per-pixel mode it also owns one [`TrackRecord`]
/// image per pyramid level, which the host backend fills on every iteration
/// and which stay readable through [`Tracker::records`] until the next frame.
///
/// A frame is tracked by running each level's iterations, coarsest first.
/// Each iteration linearizes, solves the 6x6 system and composes the
/// increment onto the pose. The result is accepted only if the final system
/// tracked enough pixels with a low enough RMSE.
pub struct Tracker {
    params: TrackParams,
    mode: TrackingMode,
    layout: ReduceLayout,
    block: WorkGroup,
    schedule: Schedule,
    /// One record image per level; empty in fused mode.
    records: Vec<Image<TrackRecord>>,
}

impl Tracker {
    pub fn new(config: &KFusionConfig) -> Result<Self> {
        Self::with_host_records(config, config.tracking_mode == TrackingMode::PerPixel)
    }

    /// Tracker whose records live on the device; no host record buffers are
    /// allocated and [`Tracker::records`] always returns `None`.
    #[cfg(feature = "cuda")]
    pub fn for_device(config: &KFusionConfig) -> Result<Self> {
        Self::with_host_records(config, false)
    }

    fn with_host_records(config: &KFusionConfig, host_records: bool) -> Result<Self> {
        let mut records = Vec::new();
        if host_records {
            let mut size = config.render_size();
            for _ in 0..config.pyramid_levels() {
                records.push(Image::allocate(size, TrackRecord::default(), "track records")?);
                size = size.half();
            }
        }
        Ok(Self {
            params: TrackParams {
                dist_threshold: config.dist_threshold,
                normal_threshold: config.normal_threshold,
            },
            mode: config.tracking_mode,
            layout: config.reduce_layout,
            block: config.image_block,
            schedule: Schedule {
                iterations: config.iterations.clone(),
                min_fraction: config.track_min_fraction,
                max_rmse: config.track_max_rmse,
                solver_tolerance: config.solver_tolerance,
            },
            records,
        })
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn params(&self) -> &TrackParams {
        &self.params
    }

    /// Records written by the last per-pixel linearization of `level`.
    pub fn records(&self, level: usize) -> Option<&Image<TrackRecord>> {
        self.records.get(level)
    }

    /// Build the reduced system for one pyramid level at `pose`.
    pub fn linearize(
        &mut self,
        pyramid: &DepthPyramid,
        level: usize,
        reference: &ReferenceFrame<'_>,
        pose: &Matrix4,
        timing: &mut TimingCollector,
    ) -> LinearSystem {
        let vertex = &pyramid.vertex[level];
        let normal = &pyramid.normal[level];
        match self.records.get_mut(level) {
            Some(records) => {
                let timer = Timer::new("track");
                track(records, vertex, normal, reference, pose, &self.params, self.block);
                timing.record_phase("track", timer.elapsed_ms());

                let timer = Timer::new("reduce");
                let system = reduce(records, self.layout);
                timing.record_phase("reduce", timer.elapsed_ms());
                system
            }
            None => {
                let timer = Timer::new("reduce");
                let system = track_and_reduce(vertex, normal, reference, pose, &self.params, self.layout);
                timing.record_phase("reduce", timer.elapsed_ms());
                system
            }
        }
    }

    /// Estimate the pose of the frame in `pyramid`, starting from `pose`.
    ///
    /// On success `pose` holds the new estimate. On failure it is restored to
    /// its value on entry.
    pub fn track(
        &mut self,
        pyramid: &DepthPyramid,
        reference: &ReferenceFrame<'_>,
        pose: &mut Matrix4,
        timing: &mut TimingCollector,
    ) -> TrackOutcome {
        let schedule = self.schedule.clone();
        let result = schedule.run(pyramid.levels(), pyramid.size(0), pose, timing, |level, pose, timing| {
            Ok::<_, Infallible>(self.linearize(pyramid, level, reference, pose, timing))
        });
        match result {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }

    /// Same schedule as [`Tracker::track`] with linearization and reduction
    /// on the device. The current frame and reference surface are read from
    /// `maps`; `view` maps world points to reference pixels.
    #[cfg(feature = "cuda")]
    pub fn track_on_device(
        &mut self,
        runtime: &crate::gpu::GpuRuntime,
        maps: &crate::gpu::DeviceMaps,
        view: &Matrix4,
        pose: &mut Matrix4,
        timing: &mut TimingCollector,
    ) -> Result<TrackOutcome> {
        let schedule = self.schedule.clone();
        let params = self.params;
        let block = self.block;
        let outcome = schedule.run(maps.levels(), maps.render_size(), pose, timing, |level, pose, timing| {
            let timer = Timer::new("reduce");
            let system = runtime.linearize(maps, level, pose, view, &params, block)?;
            timing.record_phase("reduce", timer.elapsed_ms());
            Ok::<_, anyhow::Error>(system)
        })?;
        Ok(outcome)
    }
}

impl Schedule {
    /// Run every configured iteration, then judge the result. The pose is
    /// restored to its entry value when tracking fails.
    fn run<E, L>(
        &self,
        levels: usize,
        base: ImageSize,
        pose: &mut Matrix4,
        timing: &mut TimingCollector,
        mut linearize: L,
    ) -> std::result::Result<TrackOutcome, E>
    where
        L: FnMut(usize, &Matrix4, &mut TimingCollector) -> std::result::Result<LinearSystem, E>,
    {
        let initial = *pose;
        let outcome = match self.iterate(levels, base, pose, timing, &mut linearize) {
            Ok(outcome) => outcome,
            Err(err) => {
                *pose = initial;
                return Err(err);
            }
        };
        if let Err(failure) = &outcome {
            warn!(%failure, "tracking failed, keeping previous pose");
            *pose = initial;
        }
        Ok(outcome)
    }

    fn iterate<E, L>(
        &self,
        levels: usize,
        base: ImageSize,
        pose: &mut Matrix4,
        timing: &mut TimingCollector,
        linearize: &mut L,
    ) -> std::result::Result<TrackOutcome, E>
    where
        L: FnMut(usize, &Matrix4, &mut TimingCollector) -> std::result::Result<LinearSystem, E>,
    {
        let levels = self.iterations.len().min(levels);
        let mut steps = 0;

        for level in (0..levels).rev() {
            for iteration in 0..self.iterations[level] {
                let system = linearize(level, pose, timing)?;
                debug!(
                    level,
                    iteration,
                    valid = system.valid_count(),
                    rmse = system.rmse(),
                    too_far = system.too_far_count(),
                    normal_mismatch = system.normal_mismatch_count(),
                    "icp iteration"
                );

                let timer = Timer::new("solve");
                let twist = solve_twist(&system, self.solver_tolerance);
                timing.record_phase("solve", timer.elapsed_ms());
                let twist = match twist {
                    Ok(twist) => twist,
                    Err(failure) => return Ok(Err(failure)),
                };
                *pose = se3_exp(&twist) * *pose;
                if !pose.is_finite() {
                    return Ok(Err(TrackingFailure::NonFinite));
                }
                steps += 1;
            }
        }

        // Acceptance is judged on the finest level at the final pose.
        let system = linearize(0, pose, timing)?;
        Ok(self.accept(system, base, steps))
    }

    fn accept(&self, system: LinearSystem, base: ImageSize, iterations: usize) -> TrackOutcome {
        let required = (self.min_fraction * base.pixel_count() as f32).ceil() as u32;
        if !system.is_finite() {
            return Err(TrackingFailure::NonFinite);
        }
        if system.valid_count() < required {
            return Err(TrackingFailure::InsufficientCorrespondences {
                valid: system.valid_count(),
                required,
            });
        }
        let rmse = system.rmse();
        if rmse > self.max_rmse {
            return Err(TrackingFailure::ResidualTooLarge {
                rmse,
                max: self.max_rmse,
            });
        }
        Ok(TrackSummary {
            iterations,
            valid_pixels: system.valid_count(),
            rmse,
            system,
        })
    }
}
