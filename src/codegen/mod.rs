// Numeric model compilation
//
// Turns a symbolic `KalmanModel` into an evaluable expression graph whose
// variable references are resolved to vector slots up front. Nothing is
// written to disk or reloaded; `source` renders the same model as text for
// inspection.

pub mod source;

use std::collections::BTreeMap;

use nalgebra as na;
use na::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::model::{KalmanModel, Param};
use crate::symbolic::{signed_pow, Expr, VarId};

pub use source::render_model;

/// One row of input data, keyed by variable; NaN counts as absent
pub type Sample = BTreeMap<VarId, f64>;

/// Inputs of one filter step extracted from a sample
#[derive(Debug, Clone, PartialEq)]
pub struct Packed {
    pub u: DVector<f64>,
    pub z: DVector<f64>,
    pub deltat: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    State(usize),
    Control(usize),
    TimeStep,
}

/// Expression with variables resolved to slots
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Const(f64),
    Slot(Slot),
    Sum(Box<Node>, Box<Node>),
    Product(Box<Node>, Box<Node>),
    Power(Box<Node>, Box<Node>),
    Conditional(Box<[Node; 4]>),
}

struct Inputs<'a> {
    x: &'a DVector<f64>,
    u: Option<&'a DVector<f64>>,
    deltat: f64,
}

impl Node {
    fn eval(&self, inputs: &Inputs<'_>) -> f64 {
        match self {
            Node::Const(v) => *v,
            Node::Slot(Slot::State(i)) => inputs.x[*i],
            Node::Slot(Slot::Control(i)) => inputs.u.map_or(f64::NAN, |u| u[*i]),
            Node::Slot(Slot::TimeStep) => inputs.deltat,
            Node::Sum(l, r) => l.eval(inputs) + r.eval(inputs),
            Node::Product(l, r) => l.eval(inputs) * r.eval(inputs),
            Node::Power(b, e) => signed_pow(b.eval(inputs), e.eval(inputs)),
            Node::Conditional(parts) => {
                let [probe, threshold, less, greater] = &**parts;
                if probe.eval(inputs) > threshold.eval(inputs) {
                    greater.eval(inputs)
                } else {
                    less.eval(inputs)
                }
            }
        }
    }
}

/// Which variables a generated function can see
struct Scope<'a> {
    model: &'a KalmanModel,
    function: &'static str,
    with_controls: bool,
}

impl Scope<'_> {
    fn resolve(&self, id: VarId) -> Result<Slot> {
        let m = self.model;
        if let Some(i) = m.xvars().iter().position(|&x| x == id) {
            return Ok(Slot::State(i));
        }
        if self.with_controls {
            if let Some(i) = m.uvars().iter().position(|&u| u == id) {
                return Ok(Slot::Control(i));
            }
            if id == m.deltat() {
                return Ok(Slot::TimeStep);
            }
        }
        Err(Error::UnboundVariable {
            variable: m.symbol(id).to_string(),
            function: self.function.to_string(),
        })
    }

    fn compile(&self, expr: &Expr) -> Result<Node> {
        if expr.is_zero() {
            return Ok(Node::Const(0.0));
        }
        Ok(match expr {
            Expr::Constant(v) => Node::Const(*v),
            Expr::Variable(id) => Node::Slot(self.resolve(*id)?),
            Expr::Sum(l, r) => Node::Sum(Box::new(self.compile(l)?), Box::new(self.compile(r)?)),
            Expr::Product(l, r) => Node::Product(Box::new(self.compile(l)?), Box::new(self.compile(r)?)),
            Expr::Power(b, e) => Node::Power(Box::new(self.compile(b)?), Box::new(self.compile(e)?)),
            Expr::Conditional {
                probe,
                threshold,
                less,
                greater,
            } => Node::Conditional(Box::new([
                self.compile(probe)?,
                self.compile(threshold)?,
                self.compile(less)?,
                self.compile(greater)?,
            ])),
        })
    }

    fn compile_row(&self, exprs: &[Expr]) -> Result<Vec<Node>> {
        exprs.iter().map(|e| self.compile(e)).collect()
    }
}

/// Evaluable filter model: packing function, `f`, `df/dx`, `h`, `dh/dx`
/// and the initial/noise/weight matrices
#[derive(Debug, Clone)]
pub struct NumericModel {
    name: String,
    controls: Vec<VarId>,
    observations: Vec<VarId>,
    deltat: VarId,
    symbols: BTreeMap<VarId, String>,
    f: Vec<Node>,
    dfdx: Vec<Vec<Node>>,
    h: Vec<Node>,
    dhdx: Vec<Vec<Node>>,
    pub x0: DVector<f64>,
    pub p0: DMatrix<f64>,
    pub q: DMatrix<f64>,
    pub r: DMatrix<f64>,
    pub wx: DMatrix<f64>,
    pub params: BTreeMap<String, f64>,
}

impl NumericModel {
    /// Compile `model` with its current calibration values
    pub fn build(model: &KalmanModel) -> Result<Self> {
        let transition = Scope {
            model,
            function: "f",
            with_controls: true,
        };
        let observation = Scope {
            model,
            function: "h",
            with_controls: false,
        };
        let f = transition.compile_row(model.f())?;
        let dfdx = model
            .dfdx()
            .iter()
            .map(|row| transition.compile_row(row))
            .collect::<Result<Vec<_>>>()?;
        let h = observation.compile_row(model.h())?;
        let dhdx = model
            .dhdx()
            .iter()
            .map(|row| observation.compile_row(row))
            .collect::<Result<Vec<_>>>()?;

        let x0 = calibration(model, model.xvars(), Param::InitialValue);
        let p0 = DMatrix::from_diagonal(&calibration(model, model.xvars(), Param::InitialCovariance));
        let q = DMatrix::from_diagonal(&calibration(model, model.xvars(), Param::Noise));
        let r = DMatrix::from_diagonal(&calibration(model, model.zvars(), Param::Noise));
        let wx = DMatrix::from_diagonal(&calibration(model, model.xvars(), Param::UpdateWeight));

        let symbols = model
            .uvars()
            .iter()
            .chain(model.zvars())
            .chain(std::iter::once(&model.deltat()))
            .map(|&id| (id, model.symbol(id).to_string()))
            .collect();

        Ok(Self {
            name: model.name().to_string(),
            controls: model.uvars().to_vec(),
            observations: model.zvars().to_vec(),
            deltat: model.deltat(),
            symbols,
            f,
            dfdx,
            h,
            dhdx,
            x0,
            p0,
            q,
            r,
            wx,
            params: model.params().clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_dim(&self) -> usize {
        self.x0.len()
    }

    pub fn observation_dim(&self) -> usize {
        self.observations.len()
    }

    /// Named parameter, or `default` when the model does not register it
    pub fn param(&self, name: &str, default: f64) -> f64 {
        self.params.get(name).copied().unwrap_or(default)
    }

    /// Extract `(u, z, deltat)`; `None` if any of them is absent
    pub fn pack(&self, sample: &Sample) -> Option<Packed> {
        let value = |id: &VarId| sample.get(id).copied().filter(|v| !v.is_nan());
        let u = self.controls.iter().map(value).collect::<Option<Vec<_>>>()?;
        let z = self.observations.iter().map(value).collect::<Option<Vec<_>>>()?;
        let deltat = value(&self.deltat)?;
        Some(Packed {
            u: DVector::from_vec(u),
            z: DVector::from_vec(z),
            deltat,
        })
    }

    /// Symbols of the required inputs `sample` lacks
    pub fn missing(&self, sample: &Sample) -> Vec<String> {
        self.controls
            .iter()
            .chain(&self.observations)
            .chain(std::iter::once(&self.deltat))
            .filter(|&&id| sample.get(&id).map_or(true, |v| v.is_nan()))
            .map(|id| self.symbols.get(id).cloned().unwrap_or_else(|| id.to_string()))
            .collect()
    }

    /// State transition
    pub fn f(&self, x: &DVector<f64>, u: &DVector<f64>, deltat: f64) -> DVector<f64> {
        let inputs = Inputs { x, u: Some(u), deltat };
        DVector::from_iterator(self.f.len(), self.f.iter().map(|n| n.eval(&inputs)))
    }

    /// Transition Jacobian
    pub fn dfdx(&self, x: &DVector<f64>, u: &DVector<f64>, deltat: f64) -> DMatrix<f64> {
        let inputs = Inputs { x, u: Some(u), deltat };
        evaluate_matrix(&self.dfdx, self.state_dim(), &inputs)
    }

    /// Observation
    pub fn h(&self, x: &DVector<f64>) -> DVector<f64> {
        let inputs = Inputs { x, u: None, deltat: f64::NAN };
        DVector::from_iterator(self.h.len(), self.h.iter().map(|n| n.eval(&inputs)))
    }

    /// Observation Jacobian
    pub fn dhdx(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let inputs = Inputs { x, u: None, deltat: f64::NAN };
        evaluate_matrix(&self.dhdx, self.state_dim(), &inputs)
    }
}

fn calibration(model: &KalmanModel, vars: &[VarId], param: Param) -> DVector<f64> {
    DVector::from_iterator(vars.len(), vars.iter().map(|&v| model.variable(v).get(param)))
}

fn evaluate_matrix(rows: &[Vec<Node>], ncols: usize, inputs: &Inputs<'_>) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), ncols, |i, j| rows[i][j].eval(inputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProcessVariable, VariableTable};

    struct Fixture {
        model: KalmanModel,
        xs: VarId,
        xe: VarId,
        xs_in: VarId,
        deltat: VarId,
    }

    fn fixture() -> Fixture {
        let mut vars = VariableTable::new();
        let deltat = vars.declare(ProcessVariable::new("deltat", 0.0, 0.0, 0.0, "sec")).unwrap();
        let xe = vars.declare(ProcessVariable::new("xe", 0.0, 0.0, 0.0, "usteps")).unwrap();
        let xs = vars.declare(ProcessVariable::new("xs", 1.0, 20.0, 1.0, "usteps")).unwrap();
        let dxsdt = vars
            .declare(ProcessVariable::new("dxsdt", 2.0, 5.0, 0.1, "usteps/sec").with_update_weight(0.5))
            .unwrap();
        let xs_in = vars.declare(ProcessVariable::new("xs_in", 0.0, 0.0, 10.0, "usteps")).unwrap();
        let mut model =
            KalmanModel::new("fixture", vars, vec![xs, dxsdt], vec![xe], vec![xs_in], deltat).unwrap();
        model.add_state_transition_func(xs, xs + dxsdt * deltat).unwrap();
        model.add_state_transition_func(dxsdt, 0.5 * (xe - xs)).unwrap();
        model.add_observation_func(xs_in, xs).unwrap();
        Fixture { model, xs, xe, xs_in, deltat }
    }

    #[test]
    fn test_matrices_from_calibration() {
        let fx = fixture();
        let m = NumericModel::build(&fx.model).unwrap();
        assert_eq!(m.x0, DVector::from_vec(vec![1.0, 2.0]));
        assert_eq!(m.p0, DMatrix::from_diagonal(&DVector::from_vec(vec![20.0, 5.0])));
        assert_eq!(m.q, DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 0.1])));
        assert_eq!(m.r, DMatrix::from_diagonal(&DVector::from_vec(vec![10.0])));
        assert_eq!(m.wx, DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 0.5])));
    }

    #[test]
    fn test_functions_evaluate() {
        let fx = fixture();
        let m = NumericModel::build(&fx.model).unwrap();
        let x = DVector::from_vec(vec![3.0, 4.0]);
        let u = DVector::from_vec(vec![7.0]);

        let fx_val = m.f(&x, &u, 0.5);
        assert!((fx_val[0] - 5.0).abs() < 1e-12);
        assert!((fx_val[1] - 2.0).abs() < 1e-12);

        let jac = m.dfdx(&x, &u, 0.5);
        assert_eq!(jac[(0, 0)], 1.0);
        assert_eq!(jac[(0, 1)], 0.5);
        assert_eq!(jac[(1, 0)], -0.5);
        // symbolically zero entries are exact zeros
        assert_eq!(jac[(1, 1)], 0.0);

        assert_eq!(m.h(&x), DVector::from_vec(vec![3.0]));
        assert_eq!(m.dhdx(&x), DMatrix::from_row_slice(1, 2, &[1.0, 0.0]));
    }

    #[test]
    fn test_packing_reports_absent_inputs() {
        let fx = fixture();
        let m = NumericModel::build(&fx.model).unwrap();
        let mut sample = Sample::new();
        sample.insert(fx.xe, 1.0);
        sample.insert(fx.xs_in, 2.0);
        sample.insert(fx.deltat, 0.1);
        let packed = m.pack(&sample).unwrap();
        assert_eq!(packed.u, DVector::from_vec(vec![1.0]));
        assert_eq!(packed.z, DVector::from_vec(vec![2.0]));
        assert_eq!(packed.deltat, 0.1);

        sample.insert(fx.xe, f64::NAN);
        assert!(m.pack(&sample).is_none());
        assert_eq!(m.missing(&sample), vec!["xe".to_string()]);

        sample.remove(&fx.deltat);
        assert_eq!(m.missing(&sample), vec!["xe".to_string(), "deltat".to_string()]);
    }

    #[test]
    fn test_control_inside_observation_rejected() {
        let mut fx = fixture();
        let (xs, xe, xs_in) = (fx.xs, fx.xe, fx.xs_in);
        fx.model.add_observation_func(xs_in, xs + xe).unwrap();
        match NumericModel::build(&fx.model) {
            Err(Error::UnboundVariable { variable, function }) => {
                assert_eq!(variable, "xe");
                assert_eq!(function, "h");
            }
            other => panic!("unexpected result {:?}", other.map(|m| m.name().to_string())),
        }
    }

    #[test]
    fn test_observation_noise_lookup() {
        let fx = fixture();
        let mut model = fx.model.clone();
        model.variables_mut().get_mut(fx.xs_in).noise = 4.0;
        let m = NumericModel::build(&model).unwrap();
        assert_eq!(m.r[(0, 0)], 4.0);
        assert_eq!(m.param("alpha", 1.0), 1.0);
    }
}
