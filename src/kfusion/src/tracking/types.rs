//! Per-pixel tracking records and the reduced linear system.

use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of associating one pixel with the reference map.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackStatus {
    Valid = 1,
    /// The current frame has no normal at this pixel.
    NoInput = -1,
    /// The transformed point projects outside the reference image.
    OutOfImage = -2,
    /// The reference map has no surface at the projected pixel.
    NoCorrespondence = -3,
    /// Point-to-point distance above the gate.
    TooFar = -4,
    /// Normals disagree beyond the gate.
    NormalMismatch = -5,
}

impl TrackStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Valid),
            -1 => Some(Self::NoInput),
            -2 => Some(Self::OutOfImage),
            -3 => Some(Self::NoCorrespondence),
            -4 => Some(Self::TooFar),
            -5 => Some(Self::NormalMismatch),
            _ => None,
        }
    }
}

/// Residual and Jacobian row of one pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackRecord {
    pub status: TrackStatus,
    /// Point-to-plane residual in meters.
    pub error: f32,
    /// Derivative of the residual w.r.t. the twist (translation, rotation).
    pub jacobian: [f32; 6],
}

impl Default for TrackRecord {
    fn default() -> Self {
        Self::rejected(TrackStatus::NoInput)
    }
}

impl TrackRecord {
    pub const fn rejected(status: TrackStatus) -> Self {
        Self {
            status,
            error: 0.0,
            jacobian: [0.0; 6],
        }
    }

    pub const fn valid(error: f32, jacobian: [f32; 6]) -> Self {
        Self {
            status: TrackStatus::Valid,
            error,
            jacobian,
        }
    }
}

/// Number of floats in a reduced system.
pub const REDUCTION_WIDTH: usize = 32;

/// Offsets into [`LinearSystem::values`].
pub mod slot {
    /// Sum of squared residuals.
    pub const ERROR: usize = 0;
    /// Jᵀe, 6 entries.
    pub const JTE: usize = 1;
    /// Upper triangle of JᵀJ, row-major, 21 entries.
    pub const JTJ: usize = 7;
    pub const VALID: usize = 28;
    pub const TOO_FAR: usize = 29;
    pub const NORMAL_MISMATCH: usize = 30;
    /// Every other rejection.
    pub const OTHER: usize = 31;
}

/// Sums over all pixels needed for one Gauss-Newton step, plus diagnostic
/// counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSystem {
    pub values: [f32; REDUCTION_WIDTH],
}

impl Default for LinearSystem {
    fn default() -> Self {
        Self::zeros()
    }
}

impl LinearSystem {
    pub const fn zeros() -> Self {
        Self {
            values: [0.0; REDUCTION_WIDTH],
        }
    }

    /// Add one pixel's contribution.
    #[inline]
    pub fn accumulate(&mut self, record: &TrackRecord) {
        let s = &mut self.values;
        match record.status {
            TrackStatus::Valid => {}
            TrackStatus::TooFar => {
                s[slot::TOO_FAR] += 1.0;
                return;
            }
            TrackStatus::NormalMismatch => {
                s[slot::NORMAL_MISMATCH] += 1.0;
                return;
            }
            _ => {
                s[slot::OTHER] += 1.0;
                return;
            }
        }

        let e = record.error;
        let j = &record.jacobian;
        s[slot::ERROR] += e * e;
        for i in 0..6 {
            s[slot::JTE + i] += e * j[i];
        }
        let mut k = slot::JTJ;
        for r in 0..6 {
            for c in r..6 {
                s[k] += j[r] * j[c];
                k += 1;
            }
        }
        s[slot::VALID] += 1.0;
    }

    /// Element-wise sum.
    #[inline]
    pub fn merge(&mut self, other: &LinearSystem) {
        for (a, b) in self.values.iter_mut().zip(other.values.iter()) {
            *a += *b;
        }
    }

    pub fn error_sum(&self) -> f32 {
        self.values[slot::ERROR]
    }

    pub fn valid_count(&self) -> u32 {
        self.values[slot::VALID] as u32
    }

    pub fn too_far_count(&self) -> u32 {
        self.values[slot::TOO_FAR] as u32
    }

    pub fn normal_mismatch_count(&self) -> u32 {
        self.values[slot::NORMAL_MISMATCH] as u32
    }

    pub fn other_rejected_count(&self) -> u32 {
        self.values[slot::OTHER] as u32
    }

    /// Root mean squared residual of the valid pixels.
    pub fn rmse(&self) -> f32 {
        let n = self.values[slot::VALID];
        if n > 0.0 {
            (self.error_sum() / n).sqrt()
        } else {
            f32::INFINITY
        }
    }

    pub fn jte(&self) -> Vector6<f64> {
        Vector6::from_fn(|i, _| self.values[slot::JTE + i] as f64)
    }

    /// Full symmetric JᵀJ.
    pub fn jtj(&self) -> Matrix6<f64> {
        let mut m = Matrix6::zeros();
        let mut k = slot::JTJ;
        for r in 0..6 {
            for c in r..6 {
                let v = self.values[k] as f64;
                m[(r, c)] = v;
                m[(c, r)] = v;
                k += 1;
            }
        }
        m
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Why a frame failed to track. The pose is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TrackingFailure {
    #[error("only {valid} valid correspondences, need {required}")]
    InsufficientCorrespondences { valid: u32, required: u32 },
    #[error("normal equations are singular or ill-conditioned")]
    SingularSystem,
    #[error("non-finite values in the linear system")]
    NonFinite,
    #[error("residual RMSE {rmse} exceeds {max}")]
    ResidualTooLarge { rmse: f32, max: f32 },
}

/// Statistics of a successfully tracked frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSummary {
    /// Gauss-Newton steps applied across all levels.
    pub iterations: usize,
    pub valid_pixels: u32,
    pub rmse: f32,
    /// Reduction evaluated at the final pose.
    pub system: LinearSystem,
}

pub type TrackOutcome = Result<TrackSummary, TrackingFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            TrackStatus::Valid,
            TrackStatus::NoInput,
            TrackStatus::OutOfImage,
            TrackStatus::NoCorrespondence,
            TrackStatus::TooFar,
            TrackStatus::NormalMismatch,
        ] {
            assert_eq!(TrackStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TrackStatus::from_code(0), None);
    }

    #[test]
    fn test_accumulate_layout() {
        let mut sys = LinearSystem::zeros();
        sys.accumulate(&TrackRecord::valid(2.0, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        sys.accumulate(&TrackRecord::rejected(TrackStatus::TooFar));
        sys.accumulate(&TrackRecord::rejected(TrackStatus::OutOfImage));
        sys.accumulate(&TrackRecord::rejected(TrackStatus::NoInput));

        assert_eq!(sys.error_sum(), 4.0);
        assert_eq!(sys.values[slot::JTE + 5], 12.0);
        // Row 0 of the triangle, then row 1 starting at (1, 1).
        assert_eq!(sys.values[slot::JTJ + 5], 6.0);
        assert_eq!(sys.values[slot::JTJ + 6], 4.0);
        assert_eq!(sys.values[slot::JTJ + 20], 36.0);
        assert_eq!(sys.valid_count(), 1);
        assert_eq!(sys.too_far_count(), 1);
        assert_eq!(sys.other_rejected_count(), 2);

        let jtj = sys.jtj();
        assert_eq!(jtj[(4, 2)], 15.0);
        assert_eq!(jtj[(2, 4)], 15.0);
    }
}
