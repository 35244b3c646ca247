//! Rigid transforms, camera intrinsics, and the se(3) exponential map.
//!
//! [`Matrix4`] is stored as four rows so it can be uploaded to kernels
//! unchanged. Heavier linear algebra (general inverse, interop with
//! `Isometry3`) goes through nalgebra.

use std::fmt;
use std::ops::Mul;

use nalgebra::{Isometry3, Matrix3, Matrix4 as NaMatrix4, Translation3, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// 3-component single precision vector used for vertices and normals.
pub type Float3 = Vector3<f32>;

/// 4x4 homogeneous transform in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix4 {
    pub rows: [[f32; 4]; 4],
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Matrix4 {
    pub const fn identity() -> Self {
        Self {
            rows: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    pub const fn from_rows(rows: [[f32; 4]; 4]) -> Self {
        Self { rows }
    }

    pub fn from_rotation_translation(rotation: &Matrix3<f32>, translation: &Float3) -> Self {
        let mut m = Self::identity();
        for r in 0..3 {
            for c in 0..3 {
                m.rows[r][c] = rotation[(r, c)];
            }
            m.rows[r][3] = translation[r];
        }
        m
    }

    pub fn from_translation(translation: &Float3) -> Self {
        Self::from_rotation_translation(&Matrix3::identity(), translation)
    }

    pub fn translation(&self) -> Float3 {
        Float3::new(self.rows[0][3], self.rows[1][3], self.rows[2][3])
    }

    pub fn rotation(&self) -> Matrix3<f32> {
        Matrix3::from_fn(|r, c| self.rows[r][c])
    }

    pub fn transpose(&self) -> Self {
        let mut t = Self::identity();
        for r in 0..4 {
            for c in 0..4 {
                t.rows[r][c] = self.rows[c][r];
            }
        }
        t
    }

    /// Apply the full affine transform to a point (w = 1).
    #[inline]
    pub fn transform_point(&self, p: &Float3) -> Float3 {
        let r = &self.rows;
        Float3::new(
            r[0][0] * p.x + r[0][1] * p.y + r[0][2] * p.z + r[0][3],
            r[1][0] * p.x + r[1][1] * p.y + r[1][2] * p.z + r[1][3],
            r[2][0] * p.x + r[2][1] * p.y + r[2][2] * p.z + r[2][3],
        )
    }

    /// Apply only the upper-left 3x3 block to a direction.
    #[inline]
    pub fn rotate(&self, v: &Float3) -> Float3 {
        let r = &self.rows;
        Float3::new(
            r[0][0] * v.x + r[0][1] * v.y + r[0][2] * v.z,
            r[1][0] * v.x + r[1][1] * v.y + r[1][2] * v.z,
            r[2][0] * v.x + r[2][1] * v.y + r[2][2] * v.z,
        )
    }

    /// Inverse of a rigid transform: [Rᵀ | -Rᵀt].
    pub fn inverse_rigid(&self) -> Self {
        let rt = self.rotation().transpose();
        let t = -(rt * self.translation());
        Self::from_rotation_translation(&rt, &t)
    }

    /// General inverse; `None` when the matrix is singular.
    pub fn try_inverse(&self) -> Option<Self> {
        self.to_nalgebra().try_inverse().map(|m| Self::from(&m))
    }

    pub fn to_row_major(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for (r, row) in self.rows.iter().enumerate() {
            out[r * 4..r * 4 + 4].copy_from_slice(row);
        }
        out
    }

    pub fn to_nalgebra(&self) -> NaMatrix4<f32> {
        NaMatrix4::from_fn(|r, c| self.rows[r][c])
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self::from(&iso.to_homogeneous().cast::<f32>())
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        let rotation = self.rotation().cast::<f64>();
        let t = self.translation().cast::<f64>();
        Isometry3::from_parts(
            Translation3::from(t),
            UnitQuaternion::from_matrix(&rotation),
        )
    }

    pub fn is_finite(&self) -> bool {
        self.rows.iter().flatten().all(|v| v.is_finite())
    }
}

impl From<&NaMatrix4<f32>> for Matrix4 {
    fn from(m: &NaMatrix4<f32>) -> Self {
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = m[(r, c)];
            }
        }
        Self { rows }
    }
}

impl Mul for Matrix4 {
    type Output = Matrix4;

    fn mul(self, rhs: Matrix4) -> Matrix4 {
        let mut out = [[0.0f32; 4]; 4];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = (0..4).map(|k| self.rows[r][k] * rhs.rows[k][c]).sum();
            }
        }
        Matrix4 { rows: out }
    }
}

impl fmt::Display for Matrix4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.rows {
            writeln!(f, "{:>10.5} {:>10.5} {:>10.5} {:>10.5}", row[0], row[1], row[2], row[3])?;
        }
        Ok(())
    }
}

/// Pinhole intrinsics (fx, fy, cx, cy) in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl CameraIntrinsics {
    pub const fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Intrinsics for pyramid level `level` (divided by 2^level).
    pub fn at_level(&self, level: usize) -> Self {
        let s = 1.0 / (1u32 << level) as f32;
        Self::new(self.fx * s, self.fy * s, self.cx * s, self.cy * s)
    }

    /// K as a homogeneous matrix.
    pub fn matrix(&self) -> Matrix4 {
        Matrix4::from_rows([
            [self.fx, 0.0, self.cx, 0.0],
            [0.0, self.fy, self.cy, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// K⁻¹ as a homogeneous matrix.
    pub fn inverse_matrix(&self) -> Matrix4 {
        Matrix4::from_rows([
            [1.0 / self.fx, 0.0, -self.cx / self.fx, 0.0],
            [0.0, 1.0 / self.fy, -self.cy / self.fy, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }
}

/// Skew-symmetric matrix such that `skew(a) * b == a.cross(&b)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map of a twist ordered (translation, rotation).
pub fn se3_exp(twist: &Vector6<f64>) -> Matrix4 {
    let v = Vector3::new(twist[0], twist[1], twist[2]);
    let w = Vector3::new(twist[3], twist[4], twist[5]);
    let theta = w.norm();
    let wx = skew(&w);
    let wx2 = wx * wx;

    let (a, b, c) = if theta < 1e-8 {
        (1.0, 0.5, 1.0 / 6.0)
    } else {
        let t2 = theta * theta;
        (
            theta.sin() / theta,
            (1.0 - theta.cos()) / t2,
            (theta - theta.sin()) / (t2 * theta),
        )
    };

    let rotation = Matrix3::identity() + wx * a + wx2 * b;
    let jacobian = Matrix3::identity() + wx * b + wx2 * c;
    let translation = jacobian * v;

    Matrix4::from_rotation_translation(&rotation.cast::<f32>(), &translation.cast::<f32>())
}
