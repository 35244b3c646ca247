//! Surface extraction by ray marching the TSDF volume.

use crate::image::Image;
use crate::parallel::{launch_image_triple, WorkGroup};
use crate::preprocess::INVALID_NORMAL;
use crate::transform::{Float3, Matrix4};
use crate::volume::Volume;

/// Distance below which the march switches to the fine step.
const FINE_STEP_THRESHOLD: f32 = 0.8;

/// Ray-marching limits, all in metres along the ray.
///
/// The march starts at `near_plane` (or the volume entry point if later) and
/// gives up at `far_plane` (or the exit point if earlier). It advances by
/// `large_step` while the sampled distance is at least 0.8, by `step`
/// otherwise, and stops at the first positive-to-negative crossing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastParams {
    pub near_plane: f32,
    pub far_plane: f32,
    /// Fine step near surfaces.
    pub step: f32,
    /// Coarse step in free space.
    pub large_step: f32,
}

/// Entry and exit parameters of the ray against the box [0, dim].
pub fn intersect_box(origin: &Float3, direction: &Float3, dim: &Float3) -> Option<(f32, f32)> {
    let mut t_min = f32::NEG_INFINITY;
    let mut t_max = f32::INFINITY;
    for axis in 0..3 {
        let o = origin[axis];
        let d = direction[axis];
        if d.abs() < 1e-12 {
            if o < 0.0 || o > dim[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / d;
        let a = -o * inv;
        let b = (dim[axis] - o) * inv;
        t_min = t_min.max(a.min(b));
        t_max = t_max.min(a.max(b));
    }
    (t_min <= t_max).then_some((t_min, t_max))
}

/// March one ray and return the ray parameter of the first zero crossing.
pub fn march_ray(volume: &Volume, origin: &Float3, direction: &Float3, params: &RaycastParams) -> Option<f32> {
    let (t_enter, t_exit) = intersect_box(origin, direction, &volume.dim())?;
    let t_near = t_enter.max(params.near_plane);
    let t_far = t_exit.min(params.far_plane);
    if t_near >= t_far {
        return None;
    }

    let mut t = t_near;
    let mut step = params.large_step;
    let mut f_t = volume.sample(&(origin + direction * t));
    if f_t <= 0.0 {
        return None;
    }
    let mut fine = false;

    while t < t_far {
        let f_tt = volume.sample(&(origin + direction * t));
        if f_tt < 0.0 {
            return Some(t + step * f_tt / (f_t - f_tt));
        }
        if fine && f_tt > f_t {
            return None;
        }
        if f_tt < FINE_STEP_THRESHOLD {
            step = params.step;
            fine = true;
        }
        f_t = f_tt;
        t += step;
    }
    None
}

/// Render vertex, normal, and depth maps of the volume seen through `view`
/// (`pose * K⁻¹`). Misses get a zero vertex, [`INVALID_NORMAL`], and zero depth.
pub fn raycast(
    vertex: &mut Image<Float3>,
    normal: &mut Image<Float3>,
    depth: &mut Image<f32>,
    volume: &Volume,
    view: &Matrix4,
    params: &RaycastParams,
    block: WorkGroup,
) {
    let origin = view.translation();
    launch_image_triple(vertex, normal, depth, block, |x, y| {
        let direction = view.rotate(&Float3::new(x as f32, y as f32, 1.0));
        match march_ray(volume, &origin, &direction, params) {
            Some(t) => {
                let hit = origin + direction * t;
                let grad = volume.gradient(&hit);
                let len = grad.norm();
                let n = if len > 0.0 { grad / len } else { INVALID_NORMAL };
                (hit, n, t)
            }
            None => (Float3::zeros(), INVALID_NORMAL, 0.0),
        }
    });
}
