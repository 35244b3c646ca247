//! Synthetic scenes and pose helpers for tests.
//!
//! Scenes are built from analytic primitives and rendered to depth images by
//! exact ray casting, so tests have ground truth for both geometry and pose.

use nalgebra::{Rotation3, Vector3};

use crate::config::KFusionConfig;
use crate::image::{Image, ImageSize};
use crate::parallel::{launch_image, WorkGroup};
use crate::preprocess::{depth_to_vertex, is_valid_normal, vertex_to_normal, INVALID_NORMAL};
use crate::transform::{CameraIntrinsics, Float3, Matrix4};

const RENDER_BLOCK: WorkGroup = WorkGroup::new(32, 8, 1);

/// Analytic surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    /// Points with `normal · p == offset`.
    Plane { normal: Float3, offset: f32 },
    Sphere { center: Float3, radius: f32 },
    /// Axis-aligned box.
    Cuboid { min: Float3, max: Float3 },
}

impl Primitive {
    /// Smallest positive ray parameter at which the ray meets the surface.
    pub fn intersect(&self, origin: &Float3, direction: &Float3) -> Option<f32> {
        match *self {
            Primitive::Plane { normal, offset } => {
                let denom = normal.dot(direction);
                if denom.abs() < 1e-9 {
                    return None;
                }
                let t = (offset - normal.dot(origin)) / denom;
                (t > 0.0).then_some(t)
            }
            Primitive::Sphere { center, radius } => {
                let oc = origin - center;
                let a = direction.dot(direction);
                let b = oc.dot(direction);
                let c = oc.dot(&oc) - radius * radius;
                let disc = b * b - a * c;
                if disc < 0.0 {
                    return None;
                }
                let root = disc.sqrt();
                [(-b - root) / a, (-b + root) / a].into_iter().find(|&t| t > 0.0)
            }
            Primitive::Cuboid { min, max } => {
                let mut t0 = f32::NEG_INFINITY;
                let mut t1 = f32::INFINITY;
                for axis in 0..3 {
                    let d = direction[axis];
                    if d.abs() < 1e-12 {
                        if origin[axis] < min[axis] || origin[axis] > max[axis] {
                            return None;
                        }
                        continue;
                    }
                    let a = (min[axis] - origin[axis]) / d;
                    let b = (max[axis] - origin[axis]) / d;
                    t0 = t0.max(a.min(b));
                    t1 = t1.min(a.max(b));
                }
                if t0 > t1 {
                    None
                } else if t0 > 0.0 {
                    Some(t0)
                } else if t1 > 0.0 {
                    Some(t1)
                } else {
                    None
                }
            }
        }
    }
}

/// Union of primitives; a ray sees the nearest hit.
#[derive(Debug, Clone, Default)]
pub struct SyntheticScene {
    pub primitives: Vec<Primitive>,
}

impl SyntheticScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plane(mut self, normal: Float3, offset: f32) -> Self {
        self.primitives.push(Primitive::Plane {
            normal: normal.normalize(),
            offset,
        });
        self
    }

    pub fn with_sphere(mut self, center: Float3, radius: f32) -> Self {
        self.primitives.push(Primitive::Sphere { center, radius });
        self
    }

    pub fn with_cuboid(mut self, min: Float3, max: Float3) -> Self {
        self.primitives.push(Primitive::Cuboid { min, max });
        self
    }

    pub fn intersect(&self, origin: &Float3, direction: &Float3) -> Option<f32> {
        self.primitives
            .iter()
            .filter_map(|p| p.intersect(origin, direction))
            .fold(None, |best, t| Some(best.map_or(t, |b: f32| b.min(t))))
    }

    /// Z-depth image seen by a camera at `pose` (camera to world); 0 where
    /// nothing is hit.
    pub fn render_depth(&self, pose: &Matrix4, camera: &CameraIntrinsics, size: ImageSize) -> Image<f32> {
        let mut depth = Image::new(size, 0.0);
        let inv_k = camera.inverse_matrix();
        let origin = pose.translation();
        launch_image(&mut depth, RENDER_BLOCK, |x, y| {
            // Camera ray with unit z, so the hit parameter is the z-depth.
            let ray = inv_k.rotate(&Float3::new(x as f32, y as f32, 1.0));
            self.intersect(&origin, &pose.rotate(&ray)).unwrap_or(0.0)
        });
        depth
    }
}

/// Three orthogonal walls and a sphere, inside a 2 m volume and visible from
/// a camera at (1, 1, 0) looking along +z.
pub fn corner_scene() -> SyntheticScene {
    SyntheticScene::new()
        .with_plane(Float3::new(0.0, 0.0, 1.0), 1.6)
        .with_plane(Float3::new(0.0, 1.0, 0.0), 1.5)
        .with_plane(Float3::new(1.0, 0.0, 0.0), 0.3)
        .with_sphere(Float3::new(1.15, 1.05, 1.1), 0.2)
}

/// Single wall at z = `distance` in front of a camera at (1, 1, 0).
pub fn wall_scene(distance: f32) -> SyntheticScene {
    SyntheticScene::new().with_plane(Float3::new(0.0, 0.0, 1.0), distance)
}

/// Configuration used by tests: 64³ voxels over 2 m, 320x240.
pub fn test_config() -> KFusionConfig {
    KFusionConfig {
        volume_dimensions: [2.0, 2.0, 2.0],
        ..KFusionConfig::default()
    }
}

/// Camera-to-world pose from a translation and roll/pitch/yaw in radians.
pub fn pose_from_euler(translation: Float3, roll: f32, pitch: f32, yaw: f32) -> Matrix4 {
    let rotation = Rotation3::from_euler_angles(roll, pitch, yaw);
    Matrix4::from_rotation_translation(rotation.matrix(), &translation)
}

/// Pose whose camera sits at `eye` and looks at `target` with +y down.
pub fn look_at(eye: Float3, target: Float3) -> Matrix4 {
    let forward = (target - eye).normalize();
    let down_hint = Vector3::new(0.0, 1.0, 0.0);
    let right = down_hint.cross(&forward).normalize();
    let down = forward.cross(&right);
    let rotation = nalgebra::Matrix3::from_columns(&[right, down, forward]);
    Matrix4::from_rotation_translation(&rotation, &eye)
}

/// World-frame vertex and normal maps of `scene` seen from `pose`, as the
/// raycaster would produce them.
pub fn reference_maps(
    scene: &SyntheticScene,
    pose: &Matrix4,
    camera: &CameraIntrinsics,
    size: ImageSize,
) -> (Image<Float3>, Image<Float3>) {
    let depth = scene.render_depth(pose, camera, size);
    let mut vertex = Image::new(size, Float3::zeros());
    let mut normal = vertex.clone();
    depth_to_vertex(&mut vertex, &depth, &camera.inverse_matrix(), RENDER_BLOCK);
    vertex_to_normal(&mut normal, &vertex, RENDER_BLOCK);

    for px in vertex.as_mut_slice() {
        if px.z > 0.0 {
            *px = pose.transform_point(px);
        }
    }
    for n in normal.as_mut_slice() {
        *n = if is_valid_normal(n) { pose.rotate(n) } else { INVALID_NORMAL };
    }
    (vertex, normal)
}

/// Fraction of pixels with depth.
pub fn coverage(depth: &Image<f32>) -> f32 {
    let valid = depth.as_slice().iter().filter(|&&d| d > 0.0).count();
    valid as f32 / depth.size().pixel_count() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_render_plane_depth_is_constant() {
        let pose = pose_from_euler(Float3::new(1.0, 1.0, 0.0), 0.0, 0.0, 0.0);
        let cam = CameraIntrinsics::new(100.0, 100.0, 32.0, 24.0);
        let depth = wall_scene(1.3).render_depth(&pose, &cam, ImageSize::new(64, 48));
        assert_relative_eq!(depth.get(0, 0), 1.3, epsilon = 1e-5);
        assert_relative_eq!(depth.get(63, 47), 1.3, epsilon = 1e-5);
    }

    #[test]
    fn test_corner_scene_is_fully_covered() {
        let config = test_config();
        let pose = pose_from_euler(Float3::new(1.0, 1.0, 0.0), 0.0, 0.0, 0.0);
        let depth = corner_scene().render_depth(&pose, &config.camera, config.render_size());
        assert_eq!(coverage(&depth), 1.0);
        assert!(depth.as_slice().iter().all(|&d| d <= 1.6 + 1e-4));
    }

    #[test]
    fn test_sphere_and_cuboid_hits() {
        let origin = Float3::new(0.0, 0.0, 0.0);
        let dir = Float3::new(0.0, 0.0, 1.0);
        let sphere = Primitive::Sphere {
            center: Float3::new(0.0, 0.0, 2.0),
            radius: 0.5,
        };
        assert_relative_eq!(sphere.intersect(&origin, &dir).unwrap(), 1.5);
        let cuboid = Primitive::Cuboid {
            min: Float3::new(-1.0, -1.0, 1.0),
            max: Float3::new(1.0, 1.0, 3.0),
        };
        assert_relative_eq!(cuboid.intersect(&origin, &dir).unwrap(), 1.0);
    }

    #[test]
    fn test_scene_returns_nearest_hit() {
        let scene = SyntheticScene::new()
            .with_plane(Float3::new(0.0, 0.0, 1.0), 4.0)
            .with_cuboid(Float3::new(-0.5, -0.5, 2.0), Float3::new(0.5, 0.5, 2.5))
            .with_sphere(Float3::new(0.0, 0.0, 3.0), 0.2);
        let origin = Float3::zeros();
        let hit = scene.intersect(&origin, &Float3::new(0.0, 0.0, 1.0)).unwrap();
        assert_relative_eq!(hit, 2.0, epsilon = 1e-6);
        // Passes beside the cuboid and the sphere onto the back plane.
        let hit = scene.intersect(&origin, &Float3::new(0.3, 0.0, 1.0)).unwrap();
        assert_relative_eq!(hit, 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_look_at_points_forward() {
        let pose = look_at(Float3::new(0.0, 0.0, 0.0), Float3::new(0.0, 0.0, 2.0));
        assert_relative_eq!(pose.rotation(), nalgebra::Matrix3::identity(), epsilon = 1e-6);
    }
}
