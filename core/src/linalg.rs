//! Linear algebra helpers for Kalman beliefs.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn chol_solve_spd(a, b, opt) -> Option<DMatrix<f64>>
//!     pub fn robust_spd_solve(a, b) -> Option<DMatrix<f64>>
//!     pub fn gaussian_log_likelihood(residual, covariance) -> f64
//!     pub fn uncertainty_axes(covariance) -> (Vector2<f64>, Vector2<f64>)
//!
//! Strategy for SPD solves:
//! 1) Symmetrize A ← 0.5 (A + Aᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Explicit inverse as the last resort

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

/// Scale applied to the square root of the position covariance eigenvalues when reporting
/// the uncertainty ellipse. Roughly the 95% radius of a 2-D Gaussian.
pub const ELLIPSE_SCALE: f64 = 1.98;
/// Eigenvalues with a magnitude at or below this are treated as exactly zero.
pub const EIGEN_TOLERANCE: f64 = 1e-10;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Simple matrix symmetrization function that reduces round-off errors associated
/// with floating point arithmetic.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub initial_jitter: f64, // e.g., 1e-12
    pub max_jitter: f64,     // e.g., 1e-6
    pub max_tries: usize,    // e.g., 6
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

/// Cholesky factorization of a symmetrized SPD-ish matrix with jitter retries.
fn jittered_cholesky(a: &DMatrix<f64>, opt: SolveOptions) -> Option<Cholesky<f64, nalgebra::Dyn>> {
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        return Some(ch);
    }
    let n = a_sym.nrows();
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        let mut a_j = a_sym.clone();
        for i in 0..n {
            a_j[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(a_j) {
            return Some(ch);
        }
        jitter *= 10.0;
        if jitter > opt.max_jitter {
            break;
        }
    }
    None
}

/// Solve A X = B for SPD-ish A via Cholesky, with jitter retries.
/// Returns None if all attempts fail or the shapes are incompatible.
pub fn chol_solve_spd(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return None;
    }
    jittered_cholesky(a, opt).map(|ch| ch.solve(b))
}

/// Robust SPD solve with sane defaults:
/// - Cholesky + jitter (preferred)
/// - Last resort: explicit inverse
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    chol_solve_spd(a, b, SolveOptions::default())
        .or_else(|| symmetrize(a).try_inverse().map(|inv| &inv * b))
}

/// Log density of a zero-mean multivariate Gaussian evaluated at `residual`.
///
/// Returns negative infinity when the covariance is singular beyond repair, so that the
/// caller's weight normalization simply discards the hypothesis.
pub fn gaussian_log_likelihood(residual: &DVector<f64>, covariance: &DMatrix<f64>) -> f64 {
    let n = residual.len();
    if covariance.nrows() != n || !covariance.is_square() {
        return f64::NEG_INFINITY;
    }
    match jittered_cholesky(covariance, SolveOptions::default()) {
        Some(ch) => {
            let l = ch.l();
            let log_det = 2.0 * l.diagonal().iter().map(|d| d.ln()).sum::<f64>();
            let solved = ch.solve(residual);
            let mahalanobis = residual.dot(&solved);
            -0.5 * (n as f64 * (2.0 * std::f64::consts::PI).ln() + log_det + mahalanobis)
        }
        None => f64::NEG_INFINITY,
    }
}

/// Clamp an eigenvalue of a covariance matrix: tiny magnitudes and negative round-off
/// both become zero.
#[inline]
pub fn clamp_eigenvalue(lambda: f64) -> f64 {
    if lambda.abs() <= EIGEN_TOLERANCE || lambda < 0.0 {
        0.0
    } else {
        lambda
    }
}

/// Major and minor semi-axis offsets of the uncertainty ellipse of a 2-D position covariance.
///
/// Each offset is an eigenvector scaled by `ELLIPSE_SCALE * sqrt(λ)`, so adding it to the
/// position mean gives the end point of that axis. The first returned vector belongs to the
/// larger eigenvalue.
pub fn uncertainty_axes(covariance: &Matrix2<f64>) -> (Vector2<f64>, Vector2<f64>) {
    let symmetric = 0.5 * (covariance + covariance.transpose());
    let eigen = SymmetricEigen::new(symmetric);
    let (major, minor) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };
    let axis = |i: usize| -> Vector2<f64> {
        let lambda = clamp_eigenvalue(eigen.eigenvalues[i]);
        eigen.eigenvectors.column(i).into_owned() * (ELLIPSE_SCALE * lambda.sqrt())
    };
    (axis(major), axis(minor))
}

/* =============================== Tests ==================================== */
