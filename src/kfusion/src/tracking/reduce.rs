//! Two-phase parallel reduction of tracking records.
//!
//! Phase one runs `groups` independent workers. Group `g` owns image rows
//! `g, g + groups, ...`; within a group, lane `l` owns columns
//! `l, l + lanes, ...`. Each lane sums its pixels, then the lanes are folded
//! pairwise in a halving tree, one round at a time. Phase two adds the group
//! partials in group order. For a fixed layout the result is deterministic.

use rayon::prelude::*;

use crate::config::ReduceLayout;
use crate::image::{Image, ImageSize};
use crate::transform::{Float3, Matrix4};

use super::linearize::{track_pixel, ReferenceFrame, TrackParams};
use super::types::{LinearSystem, TrackRecord};

/// Fold `lanes` into `lanes[0]`. The length must be a power of two.
pub fn tree_reduce(lanes: &mut [LinearSystem]) -> LinearSystem {
    debug_assert!(lanes.len().is_power_of_two());
    let mut active = lanes.len();
    while active > 1 {
        let half = active / 2;
        let (lower, upper) = lanes[..active].split_at_mut(half);
        for (a, b) in lower.iter_mut().zip(upper.iter()) {
            a.merge(b);
        }
        active = half;
    }
    lanes.first().copied().unwrap_or_default()
}

/// Phase one: one partial system per group, in group order.
pub fn reduce_partials<F>(size: ImageSize, layout: ReduceLayout, record_at: F) -> Vec<LinearSystem>
where
    F: Fn(u32, u32) -> TrackRecord + Sync,
{
    let groups = layout.groups.max(1);
    let lane_count = layout.lanes.max(1) as usize;

    (0..groups)
        .into_par_iter()
        .map(|g| {
            let mut lanes = vec![LinearSystem::zeros(); lane_count];
            for y in (g..size.height).step_by(groups as usize) {
                for (lane, acc) in lanes.iter_mut().enumerate() {
                    for x in (lane as u32..size.width).step_by(lane_count) {
                        acc.accumulate(&record_at(x, y));
                    }
                }
            }
            tree_reduce(&mut lanes)
        })
        .collect()
}

/// Phase two: sum partials in order.
pub fn combine_partials(partials: &[LinearSystem]) -> LinearSystem {
    partials.iter().fold(LinearSystem::zeros(), |mut acc, p| {
        acc.merge(p);
        acc
    })
}

/// Reduce an image of per-pixel records.
pub fn reduce(records: &Image<TrackRecord>, layout: ReduceLayout) -> LinearSystem {
    let partials = reduce_partials(records.size(), layout, |x, y| records.get(x, y));
    combine_partials(&partials)
}

/// Linearize and reduce in one pass without materializing records.
pub fn track_and_reduce(
    vertex: &Image<Float3>,
    normal: &Image<Float3>,
    reference: &ReferenceFrame<'_>,
    pose: &Matrix4,
    params: &TrackParams,
    layout: ReduceLayout,
) -> LinearSystem {
    let partials = reduce_partials(vertex.size(), layout, |x, y| {
        track_pixel(&vertex.get(x, y), &normal.get(x, y), reference, pose, params)
    });
    combine_partials(&partials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::types::TrackStatus;
    use rand::{Rng, SeedableRng};

    /// Records with small integer values so every sum is exact in f32.
    fn integer_records(size: ImageSize, seed: u64) -> Image<TrackRecord> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut img = Image::allocate(size, TrackRecord::default(), "records").unwrap();
        for y in 0..size.height {
            for x in 0..size.width {
                let rec = match rng.gen_range(0..6) {
                    0 => TrackRecord::rejected(TrackStatus::TooFar),
                    1 => TrackRecord::rejected(TrackStatus::NormalMismatch),
                    2 => TrackRecord::rejected(TrackStatus::OutOfImage),
                    _ => {
                        let mut j = [0.0f32; 6];
                        for v in j.iter_mut() {
                            *v = rng.gen_range(-3..=3) as f32;
                        }
                        TrackRecord::valid(rng.gen_range(-2..=2) as f32, j)
                    }
                };
                img.set(x, y, rec);
            }
        }
        img
    }

    fn serial_sum(records: &Image<TrackRecord>) -> LinearSystem {
        let mut sys = LinearSystem::zeros();
        for r in records.as_slice() {
            sys.accumulate(r);
        }
        sys
    }

    #[test]
    fn test_reduction_is_exact_for_any_layout() {
        let records = integer_records(ImageSize::new(64, 48), 11);
        let expected = serial_sum(&records);
        for (groups, lanes) in [(1, 1), (8, 128), (3, 16), (16, 2), (64, 64)] {
            let got = reduce(&records, ReduceLayout { groups, lanes });
            assert_eq!(got, expected, "layout {groups}x{lanes}");
        }
        let total = expected.valid_count()
            + expected.too_far_count()
            + expected.normal_mismatch_count()
            + expected.other_rejected_count();
        assert_eq!(total, 64 * 48);
    }

    #[test]
    fn test_partials_are_ordered_by_group() {
        let records = integer_records(ImageSize::new(16, 8), 3);
        let layout = ReduceLayout { groups: 4, lanes: 4 };
        let partials = reduce_partials(records.size(), layout, |x, y| records.get(x, y));
        assert_eq!(partials.len(), 4);
        // Group 1 owns rows 1 and 5.
        let mut group1 = LinearSystem::zeros();
        for y in [1, 5] {
            for x in 0..16 {
                group1.accumulate(&records.get(x, y));
            }
        }
        assert_eq!(partials[1], group1);
    }

    #[test]
    fn test_tree_reduce_single_lane() {
        let mut lanes = vec![LinearSystem::zeros(); 1];
        lanes[0].values[3] = 2.0;
        assert_eq!(tree_reduce(&mut lanes).values[3], 2.0);
    }
}
