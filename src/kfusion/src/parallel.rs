//! Data-parallel launch primitives for the CPU backend.
//!
//! Every per-pixel stage is a kernel `Fn(x, y) -> T` in which each invocation
//! owns exactly one output element. Launches split the output into
//! `block.x` by `block.y` tiles, one band of tile rows per rayon task,
//! mirroring the 2D work-group shape the GPU kernels use.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::image::Image;

/// 3D work-group shape.
///
/// Image stages use `x` and `y` as the tile size (the CUDA cube dimension on
/// the GPU) and ignore `z`. Volume passes use all three. The shape changes
/// scheduling only; outputs are identical for every valid shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkGroup {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkGroup {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Number of groups needed to cover `extent` in each dimension.
    pub fn groups_for(&self, extent: [u32; 3]) -> WorkGroup {
        WorkGroup::new(
            extent[0].div_ceil(self.x.max(1)),
            extent[1].div_ceil(self.y.max(1)),
            extent[2].div_ceil(self.z.max(1)),
        )
    }
}

/// Launch shape for volume passes, chosen once from the volume size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLaunch {
    /// Voxels per group. A block spanning the full z extent makes each
    /// worker own whole columns.
    pub block: WorkGroup,
    /// Groups per axis; `block * grid` covers the volume.
    pub grid: WorkGroup,
}

impl VolumeLaunch {
    /// Thin volumes get 2x2 column groups spanning the full depth, larger
    /// ones fall back to 8x8x8 blocks.
    pub fn for_volume(size: [u32; 3]) -> Self {
        let block = if size[2] <= 64 {
            WorkGroup::new(2, 2, size[2])
        } else {
            WorkGroup::new(8, 8, 8)
        };
        Self {
            block,
            grid: block.groups_for(size),
        }
    }

    /// Columns handed to one worker in a column launch.
    pub fn columns_per_group(&self) -> usize {
        (self.block.x * self.block.y).max(1) as usize
    }
}

/// Column ranges of width `block.x` covering a row of `width` pixels.
fn column_tiles(width: usize, block: WorkGroup) -> impl Iterator<Item = std::ops::Range<usize>> {
    let tile = block.x.max(1) as usize;
    (0..width).step_by(tile).map(move |x0| x0..(x0 + tile).min(width))
}

/// Run `kernel` for every pixel of `out`.
///
/// Each band of `block.y` rows is one task; within a band pixels are
/// visited tile by tile, `block.x` columns at a time.
pub fn launch_image<T, F>(out: &mut Image<T>, block: WorkGroup, kernel: F)
where
    T: Copy + Send,
    F: Fn(u32, u32) -> T + Sync,
{
    let width = out.width() as usize;
    if width == 0 {
        return;
    }
    let rows_per_band = block.y.max(1) as usize;
    let band = width * rows_per_band;

    out.as_mut_slice()
        .par_chunks_mut(band)
        .enumerate()
        .for_each(|(b, chunk)| {
            for tile in column_tiles(width, block) {
                for (r, row) in chunk.chunks_mut(width).enumerate() {
                    let y = (b * rows_per_band + r) as u32;
                    for x in tile.clone() {
                        row[x] = kernel(x as u32, y);
                    }
                }
            }
        });
}

/// Run `kernel` for every pixel, writing three outputs of the same size.
/// Traversal matches [`launch_image`].
pub fn launch_image_triple<A, B, C, F>(
    a: &mut Image<A>,
    b: &mut Image<B>,
    c: &mut Image<C>,
    block: WorkGroup,
    kernel: F,
) where
    A: Copy + Send,
    B: Copy + Send,
    C: Copy + Send,
    F: Fn(u32, u32) -> (A, B, C) + Sync,
{
    debug_assert_eq!(a.size(), b.size());
    debug_assert_eq!(a.size(), c.size());
    let width = a.width() as usize;
    if width == 0 {
        return;
    }
    let rows_per_band = block.y.max(1) as usize;
    let band = width * rows_per_band;

    a.as_mut_slice()
        .par_chunks_mut(band)
        .zip(b.as_mut_slice().par_chunks_mut(band))
        .zip(c.as_mut_slice().par_chunks_mut(band))
        .enumerate()
        .for_each(|(bi, ((ca, cb), cc))| {
            for tile in column_tiles(width, block) {
                let rows = ca
                    .chunks_mut(width)
                    .zip(cb.chunks_mut(width))
                    .zip(cc.chunks_mut(width));
                for (r, ((ra, rb), rc)) in rows.enumerate() {
                    let y = (bi * rows_per_band + r) as u32;
                    for x in tile.clone() {
                        let (va, vb, vc) = kernel(x as u32, y);
                        ra[x] = va;
                        rb[x] = vb;
                        rc[x] = vc;
                    }
                }
            }
        });
}

/// Run `kernel(x, y, column)` over every `(x, y)` column of a volume whose
/// voxels are stored column-contiguous (`column_len` entries per column,
/// columns in row-major `(x, y)` order with `row_width` columns per row).
pub fn launch_columns<T, F>(
    data: &mut [T],
    column_len: usize,
    row_width: usize,
    launch: &VolumeLaunch,
    kernel: F,
) where
    T: Send,
    F: Fn(u32, u32, &mut [T]) + Sync,
{
    if column_len == 0 || row_width == 0 {
        return;
    }
    let per_group = launch.columns_per_group();
    data.par_chunks_mut(column_len * per_group)
        .enumerate()
        .for_each(|(g, group)| {
            for (i, column) in group.chunks_mut(column_len).enumerate() {
                let c = g * per_group + i;
                kernel((c % row_width) as u32, (c / row_width) as u32, column);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageSize;

    #[test]
    fn test_launch_image_visits_every_pixel_once() {
        let mut out = Image::allocate(ImageSize::new(37, 23), 0u32, "test").unwrap();
        launch_image(&mut out, WorkGroup::new(8, 5, 1), |x, y| y * 1000 + x);
        for y in 0..23 {
            for x in 0..37 {
                assert_eq!(out.get(x, y), y * 1000 + x);
            }
        }
    }

    #[test]
    fn test_block_shape_does_not_change_output() {
        let size = ImageSize::new(53, 29);
        let kernel = |x: u32, y: u32| (x * 31 + y * 17) % 97;
        let mut reference = Image::allocate(size, 0u32, "reference").unwrap();
        launch_image(&mut reference, WorkGroup::new(1, 1, 1), kernel);
        for block in [WorkGroup::new(8, 8, 1), WorkGroup::new(64, 3, 1), WorkGroup::new(5, 100, 1)] {
            let mut out = Image::allocate(size, 0u32, "out").unwrap();
            launch_image(&mut out, block, kernel);
            assert_eq!(out, reference, "block {block:?}");
        }
    }

    #[test]
    fn test_column_tiles_cover_row() {
        let tiles: Vec<_> = column_tiles(10, WorkGroup::new(4, 1, 1)).collect();
        assert_eq!(tiles, vec![0..4, 4..8, 8..10]);
        let single: Vec<_> = column_tiles(3, WorkGroup::new(16, 1, 1)).collect();
        assert_eq!(single, vec![0..3]);
    }

    #[test]
    fn test_launch_triple_writes_all_outputs() {
        let size = ImageSize::new(9, 7);
        let mut a = Image::allocate(size, 0u32, "a").unwrap();
        let mut b = Image::allocate(size, 0.0f32, "b").unwrap();
        let mut c = Image::allocate(size, false, "c").unwrap();
        launch_image_triple(&mut a, &mut b, &mut c, WorkGroup::new(4, 2, 1), |x, y| {
            (x + y, x as f32, y % 2 == 0)
        });
        assert_eq!(a.get(8, 6), 14);
        assert_eq!(b.get(3, 4), 3.0);
        assert!(c.get(0, 4));
        assert!(!c.get(0, 5));
    }

    #[test]
    fn test_launch_columns_coordinates() {
        let (sx, sy, sz) = (5usize, 3usize, 4usize);
        let mut data = vec![(0u32, 0u32); sx * sy * sz];
        let launch = VolumeLaunch::for_volume([sx as u32, sy as u32, sz as u32]);
        launch_columns(&mut data, sz, sx, &launch, |x, y, column| {
            for v in column.iter_mut() {
                *v = (x, y);
            }
        });
        for y in 0..sy {
            for x in 0..sx {
                let base = (y * sx + x) * sz;
                assert_eq!(data[base + sz - 1], (x as u32, y as u32));
            }
        }
    }

    #[test]
    fn test_volume_launch_shapes() {
        let thin = VolumeLaunch::for_volume([64, 64, 64]);
        assert_eq!(thin.block, WorkGroup::new(2, 2, 64));
        assert_eq!(thin.grid, WorkGroup::new(32, 32, 1));

        let deep = VolumeLaunch::for_volume([256, 256, 256]);
        assert_eq!(deep.block, WorkGroup::new(8, 8, 8));
        assert_eq!(deep.grid, WorkGroup::new(32, 32, 32));
    }
}
