//! Projective data association and point-to-plane linearization.

use crate::image::Image;
use crate::parallel::{launch_image, WorkGroup};
use crate::preprocess::is_valid_normal;
use crate::transform::{Float3, Matrix4};

use super::types::{TrackRecord, TrackStatus};

/// Gates applied when associating a current-frame point with the reference.
/// Pairs failing the distance gate get [`TrackStatus::TooFar`], pairs
/// failing the normal gate [`TrackStatus::WrongNormal`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackParams {
    /// Maximum point-to-point distance in meters.
    pub dist_threshold: f32,
    /// Minimum cosine between associated normals.
    pub normal_threshold: f32,
}

/// World-frame surface predicted by the last raycast.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceFrame<'a> {
    pub vertex: &'a Image<Float3>,
    pub normal: &'a Image<Float3>,
    /// `K * inverse(raycast pose)`: world point to reference pixel.
    pub view: Matrix4,
}

/// Associate one current-frame point with the reference and linearize the
/// residual `n_ref · (v_ref - T v)` around `pose`.
#[inline]
pub fn track_pixel(
    vertex: &Float3,
    normal: &Float3,
    reference: &ReferenceFrame<'_>,
    pose: &Matrix4,
    params: &TrackParams,
) -> TrackRecord {
    if !is_valid_normal(normal) {
        return TrackRecord::rejected(TrackStatus::NoInput);
    }

    let projected_vertex = pose.transform_point(vertex);
    let projected_pos = reference.view.transform_point(&projected_vertex);
    if projected_pos.z <= 0.0 {
        return TrackRecord::rejected(TrackStatus::OutOfImage);
    }
    let px = projected_pos.x / projected_pos.z + 0.5;
    let py = projected_pos.y / projected_pos.z + 0.5;
    let size = reference.vertex.size();
    if px < 0.0 || px > (size.width - 1) as f32 || py < 0.0 || py > (size.height - 1) as f32 {
        return TrackRecord::rejected(TrackStatus::OutOfImage);
    }
    let (rx, ry) = (px as u32, py as u32);

    let reference_normal = reference.normal.get(rx, ry);
    if !is_valid_normal(&reference_normal) {
        return TrackRecord::rejected(TrackStatus::NoCorrespondence);
    }

    let diff = reference.vertex.get(rx, ry) - projected_vertex;
    if diff.norm() > params.dist_threshold {
        return TrackRecord::rejected(TrackStatus::TooFar);
    }

    let projected_normal = pose.rotate(normal);
    if projected_normal.dot(&reference_normal) < params.normal_threshold {
        return TrackRecord::rejected(TrackStatus::NormalMismatch);
    }

    let rot = projected_vertex.cross(&reference_normal);
    TrackRecord::valid(
        reference_normal.dot(&diff),
        [
            reference_normal.x,
            reference_normal.y,
            reference_normal.z,
            rot.x,
            rot.y,
            rot.z,
        ],
    )
}

/// Write one record per current-frame pixel.
pub fn track(
    output: &mut Image<TrackRecord>,
    vertex: &Image<Float3>,
    normal: &Image<Float3>,
    reference: &ReferenceFrame<'_>,
    pose: &Matrix4,
    params: &TrackParams,
    block: WorkGroup,
) {
    debug_assert_eq!(output.size(), vertex.size());
    launch_image(output, block, |x, y| {
        track_pixel(&vertex.get(x, y), &normal.get(x, y), reference, pose, params)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageSize;
    use crate::preprocess::INVALID_NORMAL;
    use crate::transform::CameraIntrinsics;
    use approx::assert_relative_eq;

    struct Fixture {
        vertex: Image<Float3>,
        normal: Image<Float3>,
        camera: CameraIntrinsics,
    }

    /// Reference: fronto-parallel plane at z = 1 seen from the origin.
    fn fixture() -> Fixture {
        let size = ImageSize::new(32, 24);
        let camera = CameraIntrinsics::new(30.0, 30.0, 16.0, 12.0);
        let inv_k = camera.inverse_matrix();
        let mut vertex = Image::allocate(size, Float3::zeros(), "v").unwrap();
        let normal = Image::allocate(size, Float3::new(0.0, 0.0, -1.0), "n").unwrap();
        for y in 0..24 {
            for x in 0..32 {
                vertex.set(x, y, inv_k.rotate(&Float3::new(x as f32, y as f32, 1.0)));
            }
        }
        Fixture { vertex, normal, camera }
    }

    const PARAMS: TrackParams = TrackParams {
        dist_threshold: 0.1,
        normal_threshold: 0.8,
    };

    #[test]
    fn test_residual_and_jacobian() {
        let f = fixture();
        let reference = ReferenceFrame {
            vertex: &f.vertex,
            normal: &f.normal,
            view: f.camera.matrix(),
        };
        // Point 2 cm in front of the plane.
        let v = Float3::new(0.0, 0.0, 0.98);
        let rec = track_pixel(&v, &Float3::new(0.0, 0.0, -1.0), &reference, &Matrix4::identity(), &PARAMS);
        assert_eq!(rec.status, TrackStatus::Valid);
        assert_relative_eq!(rec.error, -0.02, epsilon = 1e-6);
        assert_relative_eq!(rec.jacobian[2], -1.0);
        // v x n is zero on the optical axis.
        assert_relative_eq!(rec.jacobian[3], 0.0);
    }

    #[test]
    fn test_rejection_codes() {
        let mut f = fixture();
        f.normal.set(20, 12, INVALID_NORMAL);
        let reference = ReferenceFrame {
            vertex: &f.vertex,
            normal: &f.normal,
            view: f.camera.matrix(),
        };
        let pose = Matrix4::identity();
        let facing = Float3::new(0.0, 0.0, -1.0);

        let no_input = track_pixel(&Float3::new(0.0, 0.0, 1.0), &INVALID_NORMAL, &reference, &pose, &PARAMS);
        assert_eq!(no_input.status, TrackStatus::NoInput);

        let outside = track_pixel(&Float3::new(5.0, 0.0, 1.0), &facing, &reference, &pose, &PARAMS);
        assert_eq!(outside.status, TrackStatus::OutOfImage);

        let hole = f.vertex.get(20, 12);
        let no_ref = track_pixel(&hole, &facing, &reference, &pose, &PARAMS);
        assert_eq!(no_ref.status, TrackStatus::NoCorrespondence);

        let far = track_pixel(&Float3::new(0.0, 0.0, 1.5), &facing, &reference, &pose, &PARAMS);
        assert_eq!(far.status, TrackStatus::TooFar);

        let tilted = Float3::new(0.8, 0.0, -0.6);
        let mismatch = track_pixel(&Float3::new(0.0, 0.0, 1.0), &tilted, &reference, &pose, &PARAMS);
        assert_eq!(mismatch.status, TrackStatus::NormalMismatch);
    }
}
