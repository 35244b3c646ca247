//! Solution of the 6x6 normal equations.
//!
//! JᵀJ is symmetric positive semi-definite; it is solved by Cholesky after an
//! eigenvalue check rejects rank-deficient or badly conditioned systems (for
//! example a single plane, which leaves three motions unconstrained).

use nalgebra::Vector6;

use super::types::{LinearSystem, TrackingFailure};

/// Twist `x` with `JᵀJ x = Jᵀe`, ordered (translation, rotation).
///
/// `tolerance` is the smallest accepted ratio between the smallest and the
/// largest eigenvalue of JᵀJ.
pub fn solve_twist(system: &LinearSystem, tolerance: f64) -> Result<Vector6<f64>, TrackingFailure> {
    if !system.is_finite() {
        return Err(TrackingFailure::NonFinite);
    }
    let jtj = system.jtj();
    let jte = system.jte();

    let eigen = jtj.symmetric_eigenvalues();
    let max_ev = eigen.max();
    let min_ev = eigen.min();
    if !(max_ev > 0.0) || min_ev <= max_ev * tolerance {
        return Err(TrackingFailure::SingularSystem);
    }

    let chol = jtj.cholesky().ok_or(TrackingFailure::SingularSystem)?;
    let x = chol.solve(&jte);
    if x.iter().all(|v| v.is_finite()) {
        Ok(x)
    } else {
        Err(TrackingFailure::NonFinite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::types::TrackRecord;
    use approx::assert_relative_eq;

    fn system_from_rows(rows: &[([f32; 6], f32)]) -> LinearSystem {
        let mut sys = LinearSystem::zeros();
        for (j, e) in rows {
            sys.accumulate(&TrackRecord::valid(*e, *j));
        }
        sys
    }

    #[test]
    fn test_recovers_exact_solution() {
        let x_true = [0.01f32, -0.02, 0.03, 0.001, 0.002, -0.003];
        let mut rows = Vec::new();
        for i in 0..6 {
            let mut j = [0.0f32; 6];
            j[i] = 1.0;
            j[(i + 1) % 6] = 0.5;
            let e: f32 = j.iter().zip(x_true.iter()).map(|(a, b)| a * b).sum();
            rows.push((j, e));
        }
        let x = solve_twist(&system_from_rows(&rows), 1e-6).unwrap();
        for i in 0..6 {
            assert_relative_eq!(x[i], x_true[i] as f64, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rank_deficient_rejected() {
        // Only the z translation is observed.
        let rows = vec![([0.0, 0.0, 1.0, 0.0, 0.0, 0.0], 0.1); 10];
        assert_eq!(
            solve_twist(&system_from_rows(&rows), 1e-6),
            Err(TrackingFailure::SingularSystem)
        );
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut sys = LinearSystem::zeros();
        sys.values[3] = f32::NAN;
        assert_eq!(solve_twist(&sys, 1e-6), Err(TrackingFailure::NonFinite));
    }
}
