// Nearest symmetric positive-definite matrix
//
// Higham (1988) projection followed by diagonal nudges, after D'Errico's
// nearestSPD. Used to recover a usable covariance when a Cholesky
// factorization fails.

use nalgebra as na;
use na::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::constants::NEAREST_PD_MAX_ITERATIONS;

const DECOMPOSITION_MAX_ITERATIONS: usize = 1000;

/// True if `a` admits a Cholesky factorization
pub fn is_positive_definite(a: &DMatrix<f64>) -> bool {
    a.iter().all(|v| v.is_finite()) && a.clone().cholesky().is_some()
}

/// Closest positive-definite matrix to `a`
///
/// Always returns a matrix that admits a Cholesky factorization; when the
/// projection does not converge within the iteration cap the result falls
/// back to a positive diagonal.
pub fn nearest_positive_definite(a: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    let spacing = spacing(a);
    if a.iter().any(|v| !v.is_finite()) {
        warn!("non-finite covariance, falling back to a diagonal matrix");
        return diagonal_fallback(a, spacing);
    }

    let b = (a + a.transpose()) / 2.0;
    let h = match b.clone().try_svd(false, true, f64::EPSILON, DECOMPOSITION_MAX_ITERATIONS) {
        Some(svd) => match svd.v_t {
            Some(v_t) => v_t.transpose() * DMatrix::from_diagonal(&svd.singular_values) * v_t,
            None => b.clone(),
        },
        None => b.clone(),
    };
    let a2 = (&b + h) / 2.0;
    let mut a3 = (&a2 + a2.transpose()) / 2.0;

    let identity = DMatrix::<f64>::identity(n, n);
    let mut k = 1usize;
    while !is_positive_definite(&a3) {
        if k > NEAREST_PD_MAX_ITERATIONS {
            warn!("nearest positive-definite search did not converge, using diagonal fallback");
            return diagonal_fallback(&a3, spacing);
        }
        let min_eig = match a3.clone().try_symmetric_eigen(f64::EPSILON, DECOMPOSITION_MAX_ITERATIONS) {
            Some(eig) => eig.eigenvalues.min(),
            None => return diagonal_fallback(&a3, spacing),
        };
        let kf = k as f64;
        a3 += &identity * (-min_eig * kf * kf + spacing);
        k += 1;
    }
    debug!("nearest positive-definite matrix found after {} nudges", k - 1);
    a3
}

/// Lower Cholesky factor of `p`, repairing `p` first if necessary
pub fn lower_cholesky(p: &DMatrix<f64>) -> DMatrix<f64> {
    if let Some(chol) = p.clone().cholesky() {
        return chol.l();
    }
    let repaired = nearest_positive_definite(p);
    match repaired.clone().cholesky() {
        Some(chol) => chol.l(),
        None => DMatrix::from_diagonal(&repaired.diagonal().map(|d| d.max(0.0).sqrt())),
    }
}

// Distance from the matrix norm to the next representable float
fn spacing(a: &DMatrix<f64>) -> f64 {
    let norm = a.norm();
    if norm.is_finite() {
        (norm * f64::EPSILON).max(f64::EPSILON)
    } else {
        f64::EPSILON
    }
}

fn diagonal_fallback(a: &DMatrix<f64>, spacing: f64) -> DMatrix<f64> {
    let diag: DVector<f64> = a.diagonal().map(|d| d.abs().max(spacing));
    DMatrix::from_diagonal(&diag)
}
