// Declarative nonlinear state-space model
//
// Holds the variable roles, the transition and observation expressions and
// their Jacobians. Jacobian rows are recomputed whenever a row is replaced so
// the matrices never go stale.

use std::collections::BTreeMap;

use tracing::debug;

use super::metrics::{ErrorMetric, LowpassKind, Metrics, NegativityMetric, Normalization, SmoothnessMetric};
use super::variable::{ProcessVariable, VariableTable};
use crate::error::{Error, Result};
use crate::symbolic::{render, DerivativeError, Expr, Language, VarId};

#[derive(Debug, Clone, PartialEq)]
pub struct KalmanModel {
    name: String,
    vars: VariableTable,
    xvars: Vec<VarId>,
    uvars: Vec<VarId>,
    zvars: Vec<VarId>,
    deltat: VarId,
    f: Vec<Expr>,
    dfdx: Vec<Vec<Expr>>,
    h: Vec<Expr>,
    dhdx: Vec<Vec<Expr>>,
    params: BTreeMap<String, f64>,
    metrics: Metrics,
    bindings: BTreeMap<VarId, String>,
}

impl KalmanModel {
    /// Build a model with identity transition and zero observation
    pub fn new(
        name: impl Into<String>,
        vars: VariableTable,
        xvars: Vec<VarId>,
        uvars: Vec<VarId>,
        zvars: Vec<VarId>,
        deltat: VarId,
    ) -> Result<Self> {
        let mut seen = Vec::new();
        for &id in xvars.iter().chain(&uvars).chain(&zvars).chain(std::iter::once(&deltat)) {
            if !vars.contains(id) {
                return Err(Error::UnknownVariable(id.to_string()));
            }
            if seen.contains(&id) {
                return Err(Error::DuplicateVariable(vars.symbol(id).to_string()));
            }
            seen.push(id);
        }

        let n = xvars.len();
        let f = xvars.iter().map(|&x| Expr::var(x)).collect();
        let dfdx = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { Expr::one() } else { Expr::zero() })
                    .collect()
            })
            .collect();
        let h = vec![Expr::zero(); zvars.len()];
        let dhdx = vec![vec![Expr::zero(); n]; zvars.len()];

        Ok(Self {
            name: name.into(),
            vars,
            xvars,
            uvars,
            zvars,
            deltat,
            f,
            dfdx,
            h,
            dhdx,
            params: BTreeMap::new(),
            metrics: Metrics::default(),
            bindings: BTreeMap::new(),
        })
    }

    /// Set row `var` of `f` and recompute its Jacobian row
    pub fn add_state_transition_func(&mut self, var: VarId, expr: impl Into<Expr>) -> Result<()> {
        let expr = expr.into();
        let index = self
            .xvars
            .iter()
            .position(|&x| x == var)
            .ok_or_else(|| Error::NotAStateVariable(self.describe(var)))?;
        self.check_known(&expr)?;
        let row = self.jacobian_row(&expr)?;
        debug!("{}: f[{}] = {}", self.name, self.vars.symbol(var), self.render(&expr));
        self.f[index] = expr;
        self.dfdx[index] = row;
        Ok(())
    }

    /// Set row `var` of `h` and recompute its Jacobian row
    pub fn add_observation_func(&mut self, var: VarId, expr: impl Into<Expr>) -> Result<()> {
        let expr = expr.into();
        let index = self
            .zvars
            .iter()
            .position(|&z| z == var)
            .ok_or_else(|| Error::NotAnObservationVariable(self.describe(var)))?;
        self.check_known(&expr)?;
        let row = self.jacobian_row(&expr)?;
        debug!("{}: h[{}] = {}", self.name, self.vars.symbol(var), self.render(&expr));
        self.h[index] = expr;
        self.dhdx[index] = row;
        Ok(())
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, value: f64) {
        self.params.insert(name.into(), value);
    }

    /// Score `actual` against the input series bound to `reference`
    pub fn add_error_metric(&mut self, reference: VarId, actual: VarId, weight: f64) -> Result<()> {
        self.add_error_metric_normalized(reference, actual, weight, Normalization::default())
    }

    pub fn add_error_metric_normalized(
        &mut self,
        reference: VarId,
        actual: VarId,
        weight: f64,
        normalization: Normalization,
    ) -> Result<()> {
        if !self.is_estimated(actual) {
            return Err(Error::NotAnObservationVariable(self.describe(actual)));
        }
        if !self.vars.contains(reference) {
            return Err(Error::UnknownVariable(reference.to_string()));
        }
        self.metrics.error.insert(
            actual,
            ErrorMetric {
                reference,
                weight,
                normalization,
            },
        );
        Ok(())
    }

    /// Penalize high-frequency content of `var`; `filter_coef` defaults to 0.005
    pub fn add_smoothness_metric(&mut self, var: VarId, weight: f64, filter_coef: Option<f64>) -> Result<()> {
        let mut metric = SmoothnessMetric::new(weight);
        if let Some(coef) = filter_coef {
            metric.filter_coef = coef;
        }
        self.add_smoothness_metric_with(var, metric)
    }

    pub fn add_smoothness_metric_with(&mut self, var: VarId, metric: SmoothnessMetric) -> Result<()> {
        self.check_estimated(var)?;
        self.metrics.smoothness.insert(var, metric);
        Ok(())
    }

    /// Smoothness metric measured against a moving average instead
    pub fn add_boxcar_smoothness_metric(&mut self, var: VarId, weight: f64, filter_coef: f64) -> Result<()> {
        self.add_smoothness_metric_with(
            var,
            SmoothnessMetric {
                weight,
                filter_coef,
                lowpass: LowpassKind::BoxCar,
            },
        )
    }

    pub fn add_negativity_metric(&mut self, var: VarId, weight: f64) -> Result<()> {
        self.check_estimated(var)?;
        self.metrics.negativity.insert(var, NegativityMetric { weight });
        Ok(())
    }

    /// Read the dataset series `series` for input variable `var`
    pub fn bind_input(&mut self, var: VarId, series: impl Into<String>) -> Result<()> {
        if !self.vars.contains(var) {
            return Err(Error::UnknownVariable(var.to_string()));
        }
        self.bindings.insert(var, series.into());
        Ok(())
    }

    /// Dataset series feeding `var`; the symbol unless rebound
    pub fn input_series_name(&self, var: VarId) -> &str {
        self.bindings
            .get(&var)
            .map(String::as_str)
            .unwrap_or_else(|| self.vars.symbol(var))
    }

    /// Variables read from the dataset: controls, observations, time step
    /// and error-metric references
    pub fn inputs(&self) -> Vec<VarId> {
        let mut out: Vec<VarId> = Vec::new();
        let refs = self.metrics.error.values().map(|m| m.reference);
        for id in self
            .uvars
            .iter()
            .chain(&self.zvars)
            .copied()
            .chain(std::iter::once(self.deltat))
            .chain(refs)
        {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variables(&self) -> &VariableTable {
        &self.vars
    }

    pub fn variables_mut(&mut self) -> &mut VariableTable {
        &mut self.vars
    }

    pub fn variable(&self, id: VarId) -> &ProcessVariable {
        self.vars.get(id)
    }

    pub fn symbol(&self, id: VarId) -> &str {
        self.vars.symbol(id)
    }

    pub fn xvars(&self) -> &[VarId] {
        &self.xvars
    }

    pub fn uvars(&self) -> &[VarId] {
        &self.uvars
    }

    pub fn zvars(&self) -> &[VarId] {
        &self.zvars
    }

    pub fn deltat(&self) -> VarId {
        self.deltat
    }

    pub fn f(&self) -> &[Expr] {
        &self.f
    }

    pub fn dfdx(&self) -> &[Vec<Expr>] {
        &self.dfdx
    }

    pub fn h(&self) -> &[Expr] {
        &self.h
    }

    pub fn dhdx(&self) -> &[Vec<Expr>] {
        &self.dhdx
    }

    pub fn params(&self) -> &BTreeMap<String, f64> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Render an expression with this model's symbols
    pub fn render(&self, expr: &Expr) -> String {
        render(expr, Language::Rust, &|id| self.vars.symbol(id).to_string())
    }

    fn jacobian_row(&self, expr: &Expr) -> Result<Vec<Expr>> {
        self.xvars
            .iter()
            .map(|&x| {
                expr.partial_derivative(x)
                    .map_err(|e| self.derivative_error(e))
            })
            .collect()
    }

    fn derivative_error(&self, e: DerivativeError) -> Error {
        Error::UnsupportedDerivative {
            expr: self.render(&e.expr),
            variable: self.vars.symbol(e.variable).to_string(),
        }
    }

    fn check_known(&self, expr: &Expr) -> Result<()> {
        match expr.variables().into_iter().find(|&id| !self.vars.contains(id)) {
            Some(id) => Err(Error::UnknownVariable(id.to_string())),
            None => Ok(()),
        }
    }

    fn is_estimated(&self, var: VarId) -> bool {
        self.xvars.contains(&var) || self.zvars.contains(&var)
    }

    fn check_estimated(&self, var: VarId) -> Result<()> {
        if self.is_estimated(var) {
            Ok(())
        } else {
            Err(Error::NotAStateVariable(self.describe(var)))
        }
    }

    fn describe(&self, var: VarId) -> String {
        if self.vars.contains(var) {
            self.vars.symbol(var).to_string()
        } else {
            var.to_string()
        }
    }
}
