//! Truncated signed distance volume.
//!
//! The volume covers the axis-aligned box [0, dim] in world coordinates with
//! `size` voxels per axis. Voxel (x, y, z) has its center at
//! `(i + 0.5) * dim / size`.
//!
//! Storage is column-contiguous: all z samples of one (x, y) column are
//! adjacent, so the integration pass can hand whole columns to workers.

mod voxel;

pub use voxel::{PackedVoxel, Voxel, DISTANCE_SCALE};

use rayon::prelude::*;

use crate::error::{KFusionError, Result};
use crate::parallel::{launch_columns, VolumeLaunch};
use crate::transform::Float3;

/// Host-resident TSDF grid of `size` voxels spanning `dim` metres.
///
/// Each voxel stores a packed truncated distance and an integration weight
/// (see [`PackedVoxel`]). A freshly allocated or [`reset`](Self::reset)
/// volume holds distance 1 and weight 0 everywhere, which integration treats
/// as unobserved free space and raycasting as empty.
///
/// Voxels are kept column-contiguous, at `(y * size_x + x) * size_z + z`.
/// Use [`to_host`](Self::to_host) for a decoded snapshot in x-fastest order.
pub struct Volume {
    size: [u32; 3],
    dim: Float3,
    voxels: Vec<PackedVoxel>,
}

impl Volume {
    /// Allocate a volume with every voxel in the reset state.
    pub fn allocate(size: [u32; 3], dim: [f32; 3]) -> Result<Self> {
        let len = size.iter().map(|&s| s as usize).product::<usize>();
        let mut voxels = Vec::new();
        voxels
            .try_reserve_exact(len)
            .map_err(|_| KFusionError::Allocation {
                what: "volume",
                bytes: len * std::mem::size_of::<PackedVoxel>(),
            })?;
        voxels.resize(len, PackedVoxel::EMPTY);
        Ok(Self {
            size,
            dim: Float3::new(dim[0], dim[1], dim[2]),
            voxels,
        })
    }

    pub fn size(&self) -> [u32; 3] {
        self.size
    }

    pub fn dim(&self) -> Float3 {
        self.dim
    }

    pub fn voxel_size(&self) -> Float3 {
        Float3::new(
            self.dim.x / self.size[0] as f32,
            self.dim.y / self.size[1] as f32,
            self.dim.z / self.size[2] as f32,
        )
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Set every voxel to distance 1, weight 0.
    pub fn reset(&mut self) {
        self.voxels.par_iter_mut().for_each(|v| *v = PackedVoxel::EMPTY);
    }

    #[inline]
    fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (y as usize * self.size[0] as usize + x as usize) * self.size[2] as usize + z as usize
    }

    pub fn voxel(&self, x: u32, y: u32, z: u32) -> Voxel {
        self.voxels[self.index(x, y, z)].decode()
    }

    pub fn set_voxel(&mut self, x: u32, y: u32, z: u32, voxel: Voxel) {
        let idx = self.index(x, y, z);
        self.voxels[idx] = PackedVoxel::encode(voxel);
    }

    /// World position of a voxel center.
    #[inline]
    pub fn position(&self, x: u32, y: u32, z: u32) -> Float3 {
        let vs = self.voxel_size();
        Float3::new(
            (x as f32 + 0.5) * vs.x,
            (y as f32 + 0.5) * vs.y,
            (z as f32 + 0.5) * vs.z,
        )
    }

    /// Stored distance with each coordinate clamped into the grid.
    #[inline]
    fn distance_clamped(&self, c: [i32; 3]) -> f32 {
        let x = c[0].clamp(0, self.size[0] as i32 - 1) as u32;
        let y = c[1].clamp(0, self.size[1] as i32 - 1) as u32;
        let z = c[2].clamp(0, self.size[2] as i32 - 1) as u32;
        self.voxels[self.index(x, y, z)].distance()
    }

    /// Continuous grid coordinate of `p`: integer base and fractional offset.
    #[inline]
    fn cell(&self, p: &Float3) -> ([i32; 3], Float3) {
        let scaled = Float3::new(
            p.x * self.size[0] as f32 / self.dim.x - 0.5,
            p.y * self.size[1] as f32 / self.dim.y - 0.5,
            p.z * self.size[2] as f32 / self.dim.z - 0.5,
        );
        let base = [
            scaled.x.floor() as i32,
            scaled.y.floor() as i32,
            scaled.z.floor() as i32,
        ];
        let frac = Float3::new(
            scaled.x - base[0] as f32,
            scaled.y - base[1] as f32,
            scaled.z - base[2] as f32,
        );
        (base, frac)
    }

    /// Blend `value(corner)` over the 8 cell corners with trilinear weights.
    #[inline]
    fn trilinear(base: [i32; 3], f: Float3, value: impl Fn([i32; 3]) -> f32) -> f32 {
        let mut acc = 0.0;
        for dz in 0..2 {
            let wz = if dz == 0 { 1.0 - f.z } else { f.z };
            for dy in 0..2 {
                let wy = if dy == 0 { 1.0 - f.y } else { f.y };
                for dx in 0..2 {
                    let wx = if dx == 0 { 1.0 - f.x } else { f.x };
                    acc += wx * wy * wz * value([base[0] + dx, base[1] + dy, base[2] + dz]);
                }
            }
        }
        acc
    }

    /// Trilinearly interpolated distance at world position `p`.
    pub fn sample(&self, p: &Float3) -> f32 {
        let (base, frac) = self.cell(p);
        Self::trilinear(base, frac, |c| self.distance_clamped(c))
    }

    /// Gradient of the interpolated distance field at `p`, in 1/meters.
    ///
    /// Each component interpolates central differences taken at the 8 cell
    /// corners, with neighbor lookups clamped like [`Volume::sample`].
    pub fn gradient(&self, p: &Float3) -> Float3 {
        let (base, frac) = self.cell(p);
        let vs = self.voxel_size();
        let mut grad = Float3::zeros();
        for axis in 0..3 {
            let diff = Self::trilinear(base, frac, |c| {
                let mut hi = c;
                let mut lo = c;
                hi[axis] += 1;
                lo[axis] -= 1;
                self.distance_clamped(hi) - self.distance_clamped(lo)
            });
            grad[axis] = diff / (2.0 * vs[axis]);
        }
        grad
    }

    /// Run `kernel(x, y, column)` over every (x, y) column in parallel.
    pub(crate) fn for_each_column<F>(&mut self, launch: &VolumeLaunch, kernel: F)
    where
        F: Fn(u32, u32, &mut [PackedVoxel]) + Sync,
    {
        let column_len = self.size[2] as usize;
        let row_width = self.size[0] as usize;
        launch_columns(&mut self.voxels, column_len, row_width, launch, kernel);
    }

    /// Decoded copy in x-fastest order.
    pub fn to_host(&self) -> HostVolume {
        HostVolume::from_packed(self.size, self.dim, &self.voxels)
    }
}

/// Decoded snapshot of a volume, indexed `x + size_x * (y + size_y * z)`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostVolume {
    /// Voxel count per axis.
    pub size: [u32; 3],
    /// Extent in metres.
    pub dim: Float3,
    pub voxels: Vec<Voxel>,
}

impl HostVolume {
    /// Decode column-contiguous packed storage.
    pub fn from_packed(size: [u32; 3], dim: Float3, packed: &[PackedVoxel]) -> Self {
        let [sx, sy, sz] = size.map(|s| s as usize);
        let mut voxels = vec![Voxel::EMPTY; sx * sy * sz];
        for y in 0..sy {
            for x in 0..sx {
                let column = &packed[(y * sx + x) * sz..(y * sx + x + 1) * sz];
                for (z, v) in column.iter().enumerate() {
                    voxels[x + sx * (y + sy * z)] = v.decode();
                }
            }
        }
        Self { size, dim, voxels }
    }

    pub fn get(&self, x: u32, y: u32, z: u32) -> Voxel {
        let [sx, sy, _] = self.size.map(|s| s as usize);
        self.voxels[x as usize + sx * (y as usize + sy * z as usize)]
    }

    /// Voxels that have received at least one observation.
    pub fn observed_count(&self) -> usize {
        self.voxels.iter().filter(|v| v.weight > 0.0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    /// Fill with a linear field d = (z_world - plane_z) / mu, clamped.
    fn planar_volume(plane_z: f32, mu: f32) -> Volume {
        let mut volume = Volume::allocate([16, 16, 16], [1.0, 1.0, 1.0]).unwrap();
        for z in 0..16 {
            for y in 0..16 {
                for x in 0..16 {
                    let p = volume.position(x, y, z);
                    let d = ((plane_z - p.z) / mu).clamp(-1.0, 1.0);
                    volume.set_voxel(x, y, z, Voxel { distance: d, weight: 1.0 });
                }
            }
        }
        volume
    }

    #[test]
    fn test_sample_at_voxel_center_returns_stored_value() {
        let volume = planar_volume(0.5, 0.3);
        let p = volume.position(4, 7, 9);
        assert_relative_eq!(
            volume.sample(&p),
            volume.voxel(4, 7, 9).distance,
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_sample_is_continuous() {
        let volume = planar_volume(0.47, 0.2);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let eps = 1e-4f32;
        // Largest slope is 1/mu per meter along z.
        let bound = 3.0 * eps / 0.2 + 1e-5;
        for _ in 0..500 {
            let p = Float3::new(rng.gen_range(-0.1..1.1), rng.gen_range(-0.1..1.1), rng.gen_range(-0.1..1.1));
            let q = p + Float3::new(eps, -eps, eps);
            assert!((volume.sample(&p) - volume.sample(&q)).abs() <= bound);
        }
    }

    #[test]
    fn test_gradient_of_linear_field() {
        let mu = 0.4;
        let volume = planar_volume(0.5, mu);
        let g = volume.gradient(&Float3::new(0.5, 0.5, 0.5));
        assert_relative_eq!(g.x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(g.y, 0.0, epsilon = 1e-3);
        assert_relative_eq!(g.z, -1.0 / mu, epsilon = 1e-2);
    }

    #[test]
    fn test_out_of_grid_lookups_clamp() {
        let volume = planar_volume(0.5, 0.3);
        let inside = volume.sample(&volume.position(0, 0, 0));
        assert_relative_eq!(volume.sample(&Float3::new(-5.0, -5.0, -5.0)), inside, epsilon = 1e-6);
    }

    #[test]
    fn test_reset_clears_weights() {
        let mut volume = planar_volume(0.5, 0.3);
        volume.reset();
        let host = volume.to_host();
        assert_eq!(host.observed_count(), 0);
        assert!(host.voxels.iter().all(|v| *v == Voxel::EMPTY));
    }

    #[test]
    fn test_host_snapshot_order() {
        let mut volume = Volume::allocate([3, 4, 5], [1.0, 1.0, 1.0]).unwrap();
        volume.set_voxel(2, 1, 3, Voxel { distance: -0.5, weight: 9.0 });
        let host = volume.to_host();
        assert_eq!(host.get(2, 1, 3).weight, 9.0);
        assert_eq!(host.voxels[2 + 3 * (1 + 4 * 3)].weight, 9.0);
        assert_eq!(host.observed_count(), 1);
    }
}
