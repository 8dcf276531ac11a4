// Unscented Kalman Filter
//
// Sigma points are spread by `alpha * sqrt(kappa)` along the columns of the
// lower Cholesky factor; the correction is blended per state with the model's
// update weights.

use nalgebra as na;
use na::{DMatrix, DVector};

use super::nearest_pd::lower_cholesky;
use super::{divergence_check, invert, pack, Estimate, KalmanFilter};
use crate::codegen::{NumericModel, Sample};
use crate::constants::{DEFAULT_UKF_ALPHA, DEFAULT_UKF_BETA, DEFAULT_UKF_KAPPA};
use crate::error::Result;

/// Represents mean and covariance of a multivariate normal distribution
#[derive(Debug, Clone)]
pub struct Moments {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

/// Sigma-point weights for a state of dimension `L`
#[derive(Debug, Clone, PartialEq)]
pub struct UnscentedWeights {
    /// Weights for mean calculation (`Wa`)
    pub mean: DVector<f64>,
    /// Weights for covariance calculation (`Wc`)
    pub covariance: DVector<f64>,
    /// Multiplier of the Cholesky columns, `alpha * sqrt(kappa)`
    pub spread: f64,
}

impl UnscentedWeights {
    pub fn new(state_dim: usize, alpha: f64, beta: f64, kappa: f64) -> Self {
        let l = state_dim as f64;
        let c = alpha * alpha * kappa;
        let n_points = 2 * state_dim + 1;

        let mut mean = DVector::from_element(n_points, 1.0 / (2.0 * c));
        mean[0] = (c - l) / c;

        let mut covariance = mean.clone();
        covariance[0] = mean[0] + 1.0 - alpha * alpha + beta;

        Self {
            mean,
            covariance,
            spread: alpha * kappa.sqrt(),
        }
    }

    pub fn n_points(&self) -> usize {
        self.mean.len()
    }
}

/// Represents a collection of sigma points and their associated weights
#[derive(Debug, Clone)]
pub struct SigmaPoints {
    /// Sigma points, one per row
    pub points: DMatrix<f64>,
    pub weights: UnscentedWeights,
}

impl SigmaPoints {
    pub fn point(&self, i: usize) -> DVector<f64> {
        self.points.row(i).transpose()
    }
}

/// Sigma points `x`, `x + spread * A[:, j]`, `x - spread * A[:, j]`
///
/// `A` is the lower Cholesky factor of the covariance, repaired to the
/// nearest positive-definite matrix when the factorization fails.
pub fn moments2points(moments: &Moments, weights: &UnscentedWeights) -> SigmaPoints {
    let n_dim = moments.mean.len();
    let mu = &moments.mean;
    let chol = lower_cholesky(&moments.covariance);

    let mut points = DMatrix::zeros(2 * n_dim + 1, n_dim);
    points.row_mut(0).copy_from(&mu.transpose());
    for j in 0..n_dim {
        let offset = chol.column(j) * weights.spread;
        points.row_mut(j + 1).copy_from(&(mu + &offset).transpose());
        points.row_mut(n_dim + j + 1).copy_from(&(mu - &offset).transpose());
    }

    SigmaPoints {
        points,
        weights: weights.clone(),
    }
}

/// Calculate mean and covariance from sigma points
///
/// The mean uses `Wa`, the covariance `Wc`; `sigma_noise` is added when given.
pub fn points2moments(points: &SigmaPoints, sigma_noise: Option<&DMatrix<f64>>) -> Moments {
    let n_points = points.points.nrows();
    let n_dim = points.points.ncols();

    let mut mean = DVector::zeros(n_dim);
    for i in 0..n_points {
        mean += points.point(i) * points.weights.mean[i];
    }

    let mut covariance = DMatrix::zeros(n_dim, n_dim);
    for i in 0..n_points {
        let diff = points.point(i) - &mean;
        covariance += &diff * diff.transpose() * points.weights.covariance[i];
    }

    if let Some(noise) = sigma_noise {
        covariance += noise;
    }

    Moments { mean, covariance }
}

/// Propagate sigma points through `f` and approximate the resulting moments
pub fn unscented_transform<F>(
    points: &SigmaPoints,
    f: F,
    sigma_noise: Option<&DMatrix<f64>>,
) -> (SigmaPoints, Moments)
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let n_points = points.points.nrows();
    let transformed: Vec<DVector<f64>> = (0..n_points).map(|i| f(&points.point(i))).collect();

    let n_dim_out = transformed.first().map_or(0, |p| p.len());
    let mut out = DMatrix::zeros(n_points, n_dim_out);
    for (i, point) in transformed.iter().enumerate() {
        out.row_mut(i).copy_from(&point.transpose());
    }

    let points_out = SigmaPoints {
        points: out,
        weights: points.weights.clone(),
    };
    let moments = points2moments(&points_out, sigma_noise);
    (points_out, moments)
}

/// `Wc`-weighted covariance between state and observation sigma points
pub fn cross_covariance(
    state_points: &SigmaPoints,
    state_mean: &DVector<f64>,
    obs_points: &SigmaPoints,
    obs_mean: &DVector<f64>,
) -> DMatrix<f64> {
    let mut cross = DMatrix::zeros(state_points.points.ncols(), obs_points.points.ncols());
    for i in 0..state_points.points.nrows() {
        let dx = state_points.point(i) - state_mean;
        let dz = obs_points.point(i) - obs_mean;
        cross += dx * dz.transpose() * state_points.weights.covariance[i];
    }
    cross
}

/// Unscented filter over a compiled model
#[derive(Debug, Clone)]
pub struct UnscentedFilter {
    model: NumericModel,
    x: DVector<f64>,
    p: DMatrix<f64>,
    weights: UnscentedWeights,
    /// `I - Wx`
    wxi: DMatrix<f64>,
}

impl UnscentedFilter {
    /// Start from `x0`/`P0`; `alpha`, `beta` and `kappa` come from the model
    /// parameters, defaulting to 1, 2 and 3
    pub fn new(model: NumericModel) -> Self {
        let alpha = model.param("alpha", DEFAULT_UKF_ALPHA);
        let beta = model.param("beta", DEFAULT_UKF_BETA);
        let kappa = model.param("kappa", DEFAULT_UKF_KAPPA);
        let n = model.state_dim();
        let weights = UnscentedWeights::new(n, alpha, beta, kappa);
        let wxi = DMatrix::identity(n, n) - &model.wx;
        Self {
            x: model.x0.clone(),
            p: model.p0.clone(),
            model,
            weights,
            wxi,
        }
    }

    pub fn weights(&self) -> &UnscentedWeights {
        &self.weights
    }
}

impl KalmanFilter for UnscentedFilter {
    fn evolve(&mut self, sample: &Sample) -> Result<()> {
        let packed = pack(&self.model, sample)?;
        let model = &self.model;

        // predict
        let current = Moments {
            mean: self.x.clone(),
            covariance: self.p.clone(),
        };
        let spred = moments2points(&current, &self.weights);
        let (_, predicted) =
            unscented_transform(&spred, |s| model.f(s, &packed.u, packed.deltat), Some(&model.q));

        // observe
        let supdate = moments2points(&predicted, &self.weights);
        let (zpoints, observed) = unscented_transform(&supdate, |s| model.h(s), Some(&model.r));
        let csz = cross_covariance(&supdate, &predicted.mean, &zpoints, &observed.mean);

        // correct
        let s_inv = invert(&observed.covariance)?;
        let gain = &csz * s_inv;
        let x = &predicted.mean + &model.wx * &gain * (&packed.z - &observed.mean);
        let p_plus = &predicted.covariance - &gain * &observed.covariance * gain.transpose();
        let p = &self.wxi * &predicted.covariance * &self.wxi + &model.wx * p_plus * &model.wx;

        divergence_check(&x, &p)?;
        self.x = x;
        self.p = p;
        Ok(())
    }

    fn state(&self) -> Estimate {
        Estimate {
            x: self.x.clone(),
            p: self.p.clone(),
            z: self.model.h(&self.x),
        }
    }
}
