//! Owned 2D image buffers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KFusionError, Result};

/// Width and height of an image in pixels.
///
/// Pyramid levels are derived with [`half`](Self::half), so odd sizes lose
/// their last row or column at coarser levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of the next coarser pyramid level.
    pub fn half(&self) -> Self {
        Self::new(self.width / 2, self.height / 2)
    }

    pub fn double(&self) -> Self {
        Self::new(self.width * 2, self.height * 2)
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Row-major image with one `T` per pixel.
///
/// Pixel (x, y) lives at `y * width + x`. The buffer length always equals
/// `size.pixel_count()`; constructors that take caller data check this and
/// [`allocate`](Self::allocate) reports allocation failure instead of
/// aborting.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<T> {
    size: ImageSize,
    data: Vec<T>,
}

impl<T: Copy> Image<T> {
    pub fn new(size: ImageSize, fill: T) -> Self {
        Self {
            size,
            data: vec![fill; size.pixel_count()],
        }
    }

    /// Allocate an image filled with `fill`.
    ///
    /// Reports [`KFusionError::Allocation`] instead of aborting when the
    /// buffer cannot be reserved.
    pub fn allocate(size: ImageSize, fill: T, what: &'static str) -> Result<Self> {
        let len = size.pixel_count();
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| KFusionError::Allocation {
                what,
                bytes: len * std::mem::size_of::<T>(),
            })?;
        data.resize(len, fill);
        Ok(Self { size, data })
    }

    pub fn from_vec(size: ImageSize, data: Vec<T>) -> Result<Self> {
        if data.len() != size.pixel_count() {
            return Err(KFusionError::BufferLength {
                expected: size.pixel_count(),
                actual: data.len(),
            });
        }
        Ok(Self { size, data })
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> T {
        self.data[self.size.index(x, y)]
    }

    /// Pixel lookup with coordinates clamped into the image.
    #[inline]
    pub fn get_clamped(&self, x: i32, y: i32) -> T {
        let cx = x.clamp(0, self.size.width as i32 - 1) as u32;
        let cy = y.clamp(0, self.size.height as i32 - 1) as u32;
        self.get(cx, cy)
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: T) {
        let idx = self.size.index(x, y);
        self.data[idx] = value;
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Overwrite this image with the contents of `other` of the same size.
    pub fn copy_from(&mut self, other: &Image<T>) -> Result<()> {
        if other.size != self.size {
            return Err(KFusionError::DimensionMismatch {
                expected: self.size,
                actual: other.size,
            });
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_lookup() {
        let size = ImageSize::new(3, 2);
        let img = Image::from_vec(size, vec![0, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(img.get_clamped(-4, 0), 0);
        assert_eq!(img.get_clamped(7, 1), 5);
        assert_eq!(img.get_clamped(1, 9), 4);
    }

    #[test]
    fn test_from_vec_length_checked() {
        let err = Image::from_vec(ImageSize::new(4, 4), vec![0.0f32; 15]).unwrap_err();
        assert!(matches!(
            err,
            KFusionError::BufferLength {
                expected: 16,
                actual: 15
            }
        ));
    }

    #[test]
    fn test_copy_from_rejects_other_size() {
        let mut a = Image::allocate(ImageSize::new(4, 4), 0u16, "a").unwrap();
        let b = Image::allocate(ImageSize::new(2, 2), 1u16, "b").unwrap();
        assert!(a.copy_from(&b).is_err());
    }
}
