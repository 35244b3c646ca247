//! Edge-preserving bilateral filter and robust half-sampling.

use crate::image::Image;
use crate::parallel::{launch_image, WorkGroup};

/// Spatial weights `exp(-i^2 / (2 delta^2))` for `i` in `-radius..=radius`.
pub fn gaussian_kernel(delta: f32, radius: u32) -> Vec<f32> {
    let r = radius as i32;
    (-r..=r)
        .map(|i| {
            let x = i as f32;
            (-(x * x) / (2.0 * delta * delta)).exp()
        })
        .collect()
}

/// Filter one pixel. Zero-depth neighbors never contribute and a zero-depth
/// center stays zero.
#[inline]
pub fn bilateral_pixel(input: &Image<f32>, x: u32, y: u32, gaussian: &[f32], e_delta: f32, radius: u32) -> f32 {
    let center = input.get(x, y);
    if center == 0.0 {
        return 0.0;
    }
    let r = radius as i32;
    let inv_range = 1.0 / (2.0 * e_delta * e_delta);
    let mut sum = 0.0f32;
    let mut total = 0.0f32;
    for j in -r..=r {
        for i in -r..=r {
            let cur = input.get_clamped(x as i32 + i, y as i32 + j);
            if cur > 0.0 {
                let diff = cur - center;
                let factor = gaussian[(i + r) as usize]
                    * gaussian[(j + r) as usize]
                    * (-(diff * diff) * inv_range).exp();
                total += factor;
                sum += factor * cur;
            }
        }
    }
    sum / total
}

pub fn bilateral_filter(
    out: &mut Image<f32>,
    input: &Image<f32>,
    gaussian: &[f32],
    e_delta: f32,
    radius: u32,
    block: WorkGroup,
) {
    debug_assert_eq!(gaussian.len(), 2 * radius as usize + 1);
    launch_image(out, block, |x, y| bilateral_pixel(input, x, y, gaussian, e_delta, radius));
}

/// Halve `input` into `out`, averaging the 2x2 block members whose depth lies
/// within `e_d` of the block's top-left sample.
pub fn half_sample_robust(out: &mut Image<f32>, input: &Image<f32>, e_d: f32, block: WorkGroup) {
    debug_assert_eq!(out.size(), input.size().half());
    launch_image(out, block, |x, y| {
        let (sx, sy) = (2 * x, 2 * y);
        let center = input.get(sx, sy);
        let mut sum = 0.0f32;
        let mut count = 0.0f32;
        for j in 0..2 {
            for i in 0..2 {
                let cur = input.get_clamped((sx + i) as i32, (sy + j) as i32);
                if (cur - center).abs() < e_d {
                    sum += cur;
                    count += 1.0;
                }
            }
        }
        sum / count
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageSize;
    use approx::assert_relative_eq;

    const BLOCK: WorkGroup = WorkGroup::new(8, 8, 1);

    fn filter(input: &Image<f32>) -> Image<f32> {
        let mut out = Image::allocate(input.size(), 0.0, "filtered").unwrap();
        let gaussian = gaussian_kernel(4.0, 2);
        bilateral_filter(&mut out, input, &gaussian, 0.1, 2, BLOCK);
        out
    }

    #[test]
    fn test_kernel_shape() {
        let g = gaussian_kernel(4.0, 2);
        assert_eq!(g.len(), 5);
        assert_relative_eq!(g[2], 1.0);
        assert_relative_eq!(g[0], g[4]);
        assert_relative_eq!(g[1], (-1.0f32 / 32.0).exp());
    }

    #[test]
    fn test_constant_region_unchanged() {
        let input = Image::allocate(ImageSize::new(24, 16), 1.25, "depth").unwrap();
        let out = filter(&input);
        for &v in out.as_slice() {
            assert_relative_eq!(v, 1.25, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_step_edge_preserved() {
        let size = ImageSize::new(24, 16);
        let mut input = Image::allocate(size, 1.0, "depth").unwrap();
        for y in 0..16 {
            for x in 12..24 {
                input.set(x, y, 2.0);
            }
        }
        let out = filter(&input);
        for y in 0..16 {
            assert_relative_eq!(out.get(11, y), 1.0, epsilon = 1e-4);
            assert_relative_eq!(out.get(12, y), 2.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_invalid_border_not_propagated() {
        let size = ImageSize::new(20, 20);
        let mut input = Image::allocate(size, 0.8, "depth").unwrap();
        for i in 0..20 {
            input.set(i, 0, 0.0);
            input.set(0, i, 0.0);
        }
        let out = filter(&input);
        assert_eq!(out.get(0, 5), 0.0);
        assert_eq!(out.get(7, 0), 0.0);
        assert_relative_eq!(out.get(1, 1), 0.8, epsilon = 1e-5);
        assert_relative_eq!(out.get(2, 1), 0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_half_sample_rejects_outliers() {
        let size = ImageSize::new(4, 2);
        let input = Image::from_vec(size, vec![1.0, 1.02, 3.0, 3.0, 5.0, 1.04, 3.0, 0.0]).unwrap();
        let mut out = Image::allocate(size.half(), 0.0, "half").unwrap();
        half_sample_robust(&mut out, &input, 0.3, WorkGroup::new(2, 2, 1));
        // Block 0: 5.0 is too far from the anchor 1.0.
        assert_relative_eq!(out.get(0, 0), (1.0 + 1.02 + 1.04) / 3.0, epsilon = 1e-6);
        // Block 1: the zero sample is dropped.
        assert_relative_eq!(out.get(1, 0), 3.0, epsilon = 1e-6);
    }
}
