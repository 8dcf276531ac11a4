// Extended Kalman Filter
//
// Linearizes `f` at the previous estimate and `h` at the prediction. The
// covariance update is blended with the update weights so that states with a
// weight below one keep part of their predicted uncertainty.

use nalgebra as na;
use na::{DMatrix, DVector};

use super::{divergence_check, invert, pack, Estimate, KalmanFilter};
use crate::codegen::{NumericModel, Sample};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ExtendedFilter {
    model: NumericModel,
    x: DVector<f64>,
    p: DMatrix<f64>,
    identity: DMatrix<f64>,
}

impl ExtendedFilter {
    pub fn new(model: NumericModel) -> Self {
        let n = model.state_dim();
        Self {
            x: model.x0.clone(),
            p: model.p0.clone(),
            identity: DMatrix::identity(n, n),
            model,
        }
    }
}

impl KalmanFilter for ExtendedFilter {
    fn evolve(&mut self, sample: &Sample) -> Result<()> {
        let packed = pack(&self.model, sample)?;
        let model = &self.model;

        let x_pred = model.f(&self.x, &packed.u, packed.deltat);
        let f = model.dfdx(&self.x, &packed.u, packed.deltat);
        let h = model.dhdx(&x_pred);
        let p_pred = &f * &self.p * f.transpose() + &model.q;

        let innovation = &packed.z - model.h(&x_pred);
        let s = &h * &p_pred * h.transpose() + &model.r;
        let gain = &p_pred * h.transpose() * invert(&s)?;

        let x = &x_pred + &model.wx * &gain * innovation;
        let p_full = (&self.identity - &gain * &h) * &p_pred;
        let p = &model.wx * (&p_pred - &p_full) * &model.wx + p_full;

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
