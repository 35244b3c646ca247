//! Fusion of a depth frame into the TSDF volume.
//!
//! One worker handles an (x, y) column and marches along z, stepping the
//! camera-space position and its projection incrementally.

use crate::image::Image;
use crate::parallel::VolumeLaunch;
use crate::transform::{Float3, Matrix4};
use crate::volume::{PackedVoxel, Volume, Voxel};

/// Parameters of one fusion pass.
///
/// A voxel is updated when its signed distance to the observed surface along
/// the viewing axis exceeds `-mu`; the sample is `min(1, diff / mu)`. Each
/// update adds one to the weight until it reaches `max_weight`, after which
/// the running average keeps a fixed memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrateParams {
    /// Truncation distance in meters.
    pub mu: f32,
    /// Weight cap; at least 1.
    pub max_weight: f32,
}

/// Voxels closer to the camera plane than this are skipped.
const MIN_CAMERA_Z: f32 = 1e-4;

/// Running-average update of one voxel with a new truncated sample.
#[inline]
pub fn fuse_sample(voxel: Voxel, sdf: f32, max_weight: f32) -> Voxel {
    let w = voxel.weight;
    Voxel {
        distance: ((voxel.distance * w + sdf) / (w + 1.0)).clamp(-1.0, 1.0),
        weight: (w + 1.0).min(max_weight),
    }
}

/// Fuse `depth`, seen from the camera whose world-to-camera transform is
/// `inv_pose`, into `volume`.
pub fn integrate(
    volume: &mut Volume,
    depth: &Image<f32>,
    inv_pose: &Matrix4,
    k: &Matrix4,
    params: IntegrateParams,
    launch: &VolumeLaunch,
) {
    let size = depth.size();
    let max_x = size.width as f32 - 1.0;
    let max_y = size.height as f32 - 1.0;
    let voxel_size = volume.voxel_size();
    let z_step = Float3::new(0.0, 0.0, voxel_size.z);
    let delta = inv_pose.rotate(&z_step);
    let camera_delta = k.rotate(&delta);
    let origin_of = |x: u32, y: u32| Float3::new((x as f32 + 0.5) * voxel_size.x, (y as f32 + 0.5) * voxel_size.y, 0.5 * voxel_size.z);

    volume.for_each_column(launch, |x, y, column| {
        let mut pos = inv_pose.transform_point(&origin_of(x, y));
        let mut camera_x = k.transform_point(&pos);

        for slot in column.iter_mut() {
            let here = pos;
            let projected = camera_x;
            pos += delta;
            camera_x += camera_delta;

            if here.z < MIN_CAMERA_Z {
                continue;
            }
            let px = projected.x / projected.z + 0.5;
            let py = projected.y / projected.z + 0.5;
            if px < 0.0 || px > max_x || py < 0.0 || py > max_y {
                continue;
            }
            let measured = depth.get(px as u32, py as u32);
            if measured <= 0.0 {
                continue;
            }
            let ray_scale = (1.0 + (here.x / here.z).powi(2) + (here.y / here.z).powi(2)).sqrt();
            let diff = (measured - projected.z) * ray_scale;
            if diff > -params.mu {
                let sdf = (diff / params.mu).min(1.0);
                *slot = PackedVoxel::encode(fuse_sample(slot.decode(), sdf, params.max_weight));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageSize;
    use crate::parallel::VolumeLaunch;
    use crate::transform::CameraIntrinsics;
    use approx::assert_relative_eq;

    fn setup() -> (Volume, Image<f32>, Matrix4, Matrix4, VolumeLaunch) {
        let volume = Volume::allocate([32, 32, 32], [1.0, 1.0, 1.0]).unwrap();
        let camera = CameraIntrinsics::new(80.0, 80.0, 32.0, 24.0);
        // Camera at the middle of the z = 0 face looking along +z.
        let pose = Matrix4::from_translation(&Float3::new(0.5, 0.5, 0.0));
        let depth = Image::allocate(ImageSize::new(64, 48), 0.6, "depth").unwrap();
        let launch = VolumeLaunch::for_volume([32, 32, 32]);
        (volume, depth, pose.inverse_rigid(), camera.matrix(), launch)
    }

    #[test]
    fn test_fuse_sample_running_average() {
        let v = fuse_sample(Voxel { distance: 0.5, weight: 3.0 }, -0.5, 100.0);
        assert_relative_eq!(v.distance, 0.25);
        assert_eq!(v.weight, 4.0);
        let capped = fuse_sample(Voxel { distance: 0.5, weight: 10.0 }, 0.5, 10.0);
        assert_eq!(capped.weight, 10.0);
    }

    #[test]
    fn test_single_frame_carves_plane() {
        let (mut volume, depth, inv_pose, k, launch) = setup();
        let params = IntegrateParams { mu: 0.1, max_weight: 100.0 };
        integrate(&mut volume, &depth, &inv_pose, &k, params, &launch);

        // Center column: voxel z index 16 sits at z = 0.515, in front of the plane.
        let front = volume.voxel(16, 16, 16);
        assert_eq!(front.weight, 1.0);
        assert_relative_eq!(front.distance, (0.6 - 0.515) / 0.1, epsilon = 2e-2);

        // Well in front: clamped to 1.
        assert_relative_eq!(volume.voxel(16, 16, 2).distance, 1.0);

        // More than mu behind: untouched.
        let behind = volume.voxel(16, 16, 30);
        assert_eq!(behind, Voxel::EMPTY);
    }

    #[test]
    fn test_repeated_integration_converges() {
        let (mut volume, depth, inv_pose, k, launch) = setup();
        let params = IntegrateParams { mu: 0.1, max_weight: 5.0 };
        integrate(&mut volume, &depth, &inv_pose, &k, params, &launch);
        let first = volume.to_host();

        for _ in 0..7 {
            integrate(&mut volume, &depth, &inv_pose, &k, params, &launch);
        }
        let last = volume.to_host();
        for (a, b) in first.voxels.iter().zip(&last.voxels) {
            if a.weight > 0.0 {
                assert_eq!(b.weight, 5.0);
                assert!((a.distance - b.distance).abs() <= 1e-4);
            } else {
                assert_eq!(b.weight, 0.0);
            }
        }
    }

    #[test]
    fn test_voxels_behind_camera_untouched() {
        let (mut volume, _, _, k, launch) = setup();
        // Camera in the middle of the volume; everything with z < 0.5 is
        // behind it.
        let pose = Matrix4::from_translation(&Float3::new(0.5, 0.5, 0.5));
        let depth = Image::allocate(ImageSize::new(64, 48), 0.3, "depth").unwrap();
        let params = IntegrateParams { mu: 0.1, max_weight: 100.0 };
        integrate(&mut volume, &depth, &pose.inverse_rigid(), &k, params, &launch);

        for z in 0..16 {
            assert_eq!(volume.voxel(16, 16, z), Voxel::EMPTY, "z = {z}");
            assert_eq!(volume.voxel(14, 17, z), Voxel::EMPTY, "z = {z}");
        }
        assert_eq!(volume.voxel(16, 16, 20).weight, 1.0);
    }

    #[test]
    fn test_voxels_projecting_outside_image_untouched() {
        let volume_size = [32, 32, 32];
        let mut volume = Volume::allocate(volume_size, [1.0, 1.0, 1.0]).unwrap();
        let launch = VolumeLaunch::for_volume(volume_size);
        // Narrow field of view centered on column (16, 16).
        let camera = CameraIntrinsics::new(2000.0, 2000.0, 32.0, 24.0);
        let center = volume.position(16, 16, 0);
        let pose = Matrix4::from_translation(&Float3::new(center.x, center.y, 0.0));
        let depth = Image::allocate(ImageSize::new(64, 48), 0.6, "depth").unwrap();
        let params = IntegrateParams { mu: 0.1, max_weight: 100.0 };
        integrate(&mut volume, &depth, &pose.inverse_rigid(), &camera.matrix(), params, &launch);

        assert_eq!(volume.voxel(16, 16, 10).weight, 1.0);
        for (x, y) in [(2, 16), (16, 2), (30, 30), (0, 0)] {
            for z in 0..32 {
                assert_eq!(volume.voxel(x, y, z), Voxel::EMPTY, "({x}, {y}, {z})");
            }
        }
    }

    #[test]
    fn test_truncation_limit_behind_surface() {
        let (mut volume, depth, inv_pose, k, launch) = setup();
        let params = IntegrateParams { mu: 0.1, max_weight: 100.0 };
        integrate(&mut volume, &depth, &inv_pose, &k, params, &launch);

        // z index 21 sits 7 cm behind the plane at 0.6 m: inside the band.
        let inside = volume.voxel(16, 16, 21);
        assert_eq!(inside.weight, 1.0);
        assert_relative_eq!(inside.distance, (0.6 - 0.671875) / 0.1, epsilon = 2e-2);

        // From index 22 on the signed distance is below -mu.
        for z in 22..32 {
            assert_eq!(volume.voxel(16, 16, z), Voxel::EMPTY, "z = {z}");
        }
    }

    #[test]
    fn test_weight_saturates_at_cap() {
        let (mut volume, depth, inv_pose, k, launch) = setup();
        let params = IntegrateParams { mu: 0.1, max_weight: 3.0 };
        for frame in 1..=6 {
            integrate(&mut volume, &depth, &inv_pose, &k, params, &launch);
            let expected = (frame as f32).min(3.0);
            assert_eq!(volume.voxel(16, 16, 16).weight, expected, "frame {frame}");
            assert_eq!(volume.voxel(16, 16, 2).weight, expected, "frame {frame}");
        }
        let host = volume.to_host();
        assert!(host.voxels.iter().all(|v| v.weight <= 3.0));
    }
}
