//! Back-projection of depth into vertex and normal maps.

use crate::image::Image;
use crate::parallel::{launch_image, WorkGroup};
use crate::transform::{Float3, Matrix4};

/// Marker stored in place of a normal that could not be computed.
pub const INVALID_NORMAL: Float3 = Float3::new(-2.0, 0.0, 0.0);

#[inline]
pub fn is_valid_normal(n: &Float3) -> bool {
    n.x != INVALID_NORMAL.x
}

/// Camera-frame vertex for each pixel: `depth * K⁻¹ (x, y, 1)`, or zero
/// where depth is missing.
pub fn depth_to_vertex(vertex: &mut Image<Float3>, depth: &Image<f32>, inv_k: &Matrix4, block: WorkGroup) {
    debug_assert_eq!(vertex.size(), depth.size());
    launch_image(vertex, block, |x, y| {
        let d = depth.get(x, y);
        if d > 0.0 {
            inv_k.rotate(&Float3::new(x as f32, y as f32, 1.0)) * d
        } else {
            Float3::zeros()
        }
    });
}

/// Normal from the cross product of vertical and horizontal central
/// differences. Border pixels, pixels with a missing neighbor, and degenerate
/// neighborhoods get [`INVALID_NORMAL`].
pub fn vertex_to_normal(normal: &mut Image<Float3>, vertex: &Image<Float3>, block: WorkGroup) {
    debug_assert_eq!(normal.size(), vertex.size());
    let (w, h) = (vertex.width(), vertex.height());
    launch_image(normal, block, |x, y| {
        if x == 0 || y == 0 || x + 1 >= w || y + 1 >= h {
            return INVALID_NORMAL;
        }
        let left = vertex.get(x - 1, y);
        let right = vertex.get(x + 1, y);
        let up = vertex.get(x, y - 1);
        let down = vertex.get(x, y + 1);
        if left.z == 0.0 || right.z == 0.0 || up.z == 0.0 || down.z == 0.0 {
            return INVALID_NORMAL;
        }
        let n = (down - up).cross(&(right - left));
        let len = n.norm();
        if len > 0.0 {
            n / len
        } else {
            INVALID_NORMAL
        }
    });
}
