// Registry of extrusion process models
//
// Every model observes the syringe position `xs_in` and the hydraulic
// pressure `Ph_in`, read from the raw `xs` and `P` recordings.

use crate::error::{Error, Result};
use crate::model::{KalmanModel, ProcessVariable, VariableTable};
use crate::symbolic::{Expr, VarId};

/// Names accepted by [`build_model`]
pub const MODEL_NAMES: &[&str] = &["basic", "velocity", "degen", "gel", "empty_c1f1"];

pub fn build_model(name: &str) -> Result<KalmanModel> {
    match name {
        "basic" => basic(),
        "velocity" => velocity(),
        "degen" => degen(),
        "gel" => gel(),
        "empty_c1f1" => empty_c1f1(),
        _ => Err(Error::UnknownModel(name.to_string())),
    }
}

fn declare(
    vars: &mut VariableTable,
    symbol: &str,
    initial_value: f64,
    initial_covariance: f64,
    noise: f64,
    units: &str,
) -> Result<VarId> {
    vars.declare(ProcessVariable::new(symbol, initial_value, initial_covariance, noise, units))
}

// Observed quantities shared by every model
struct Sensors {
    xs_in: VarId,
    ph_in: VarId,
}

impl Sensors {
    fn bind(&self, model: &mut KalmanModel) -> Result<()> {
        model.bind_input(self.xs_in, "xs")?;
        model.bind_input(self.ph_in, "P")?;
        model.add_error_metric(self.xs_in, self.xs_in, 1.0)?;
        model.add_error_metric(self.ph_in, self.ph_in, 1.0)
    }
}

/// Two-chamber model with separate hydraulic and syringe pressures
fn basic() -> Result<KalmanModel> {
    let mut vars = VariableTable::new();
    let deltat = declare(&mut vars, "deltat", 0.0, 0.0, 0.0, "sec")?;
    let xe = declare(&mut vars, "xe", 0.0, 10.0, 10.0, "usteps")?;
    let xs = declare(&mut vars, "xs", 0.0, 10.0, 10.0, "usteps")?;
    let xs_in = declare(&mut vars, "xs_in", 0.0, 0.0, 10.0, "usteps")?;
    let xn = declare(&mut vars, "xn", 0.0, 10.0, 10.0, "usteps")?;
    let dxndt = declare(&mut vars, "dxndt", 0.0, 10.0, 10.0, "usteps/sec")?;
    let ph = declare(&mut vars, "Ph", 0.0, 3.0, 100.0, "Pa")?;
    let ph_in = declare(&mut vars, "Ph_in", 0.0, 0.0, 100.0, "Pa")?;
    let ps = declare(&mut vars, "Ps", 0.0, 3.0, 100.0, "Pa")?;
    let chl = declare(&mut vars, "Chl", 3.4, 0.1, 0.1, "Pa/ustep")?;
    let csl = declare(&mut vars, "Csl", 1.7, 0.1, 0.1, "Pa/ustep")?;
    let rhoeta = declare(&mut vars, "rhoeta", 20.0, 0.1, 0.1, "Pa/ustep")?;
    let ahas = declare(&mut vars, "AhAs", 0.5, 0.1, 0.1, "m^2/m^2")?;
    let ffdas = declare(&mut vars, "FfdAs", 0.0, 1.0, 1.0, "Pa")?;
    let xs0 = declare(&mut vars, "xs0", 0.0, 1.0, 10.0, "usteps")?;
    let ph0 = declare(&mut vars, "Ph0", 5000.0, 1000.0, 50.0, "Pa")?;

    let xvars = vec![xs, xn, dxndt, ph, ps, chl, csl, rhoeta, ahas, ffdas, xs0, ph0];
    let mut model = KalmanModel::new("basic", vars, xvars, vec![xe], vec![xs_in, ph_in], deltat)?;
    model.add_state_transition_func(xs, xn + ps / csl)?;
    model.add_state_transition_func(xn, xn + deltat * dxndt)?;
    model.add_state_transition_func(dxndt, ps / rhoeta)?;
    model.add_state_transition_func(ph, chl * (xe - xs))?;
    model.add_state_transition_func(ps, ahas * ph - ffdas)?;
    model.add_observation_func(xs_in, xs + xs0)?;
    model.add_observation_func(ph_in, ph + ph0)?;

    Sensors { xs_in, ph_in }.bind(&mut model)?;
    model.add_smoothness_metric(dxndt, 1.0, None)?;
    Ok(model)
}

/// Constant-velocity syringe with an independent pressure offset
fn velocity() -> Result<KalmanModel> {
    let mut vars = VariableTable::new();
    let deltat = declare(&mut vars, "deltat", 0.0, 0.0, 0.0, "sec")?;
    let xs = declare(&mut vars, "xs", 0.0, 20.0, 1.0, "usteps")?;
    let xs_in = declare(&mut vars, "xs_in", 0.0, 0.0, 10.0, "usteps")?;
    let dxsdt = declare(&mut vars, "dxsdt", 0.0, 20.0, 0.5, "usteps/sec")?;
    let ph = declare(&mut vars, "Ph", 1.0, 30.0, 0.1, "Pa")?;
    let ph0 = declare(&mut vars, "Ph0", 2500.0, 100.0, 0.1, "Pa")?;
    let ph_in = declare(&mut vars, "Ph_in", 0.0, 0.0, 3.0, "Pa")?;

    let mut model = KalmanModel::new(
        "velocity",
        vars,
        vec![xs, dxsdt, ph, ph0],
        vec![],
        vec![xs_in, ph_in],
        deltat,
    )?;
    model.add_state_transition_func(xs, xs + dxsdt * deltat)?;
    model.add_observation_func(xs_in, xs)?;
    model.add_observation_func(ph_in, ph + ph0)?;

    Sensors { xs_in, ph_in }.bind(&mut model)?;
    model.add_smoothness_metric(dxsdt, 1.0, None)?;
    Ok(model)
}

/// Shear-thinning flow above a velocity threshold
fn degen() -> Result<KalmanModel> {
    let mut vars = VariableTable::new();
    let deltat = declare(&mut vars, "deltat", 0.0, 0.0, 0.0, "sec")?;

    let xe = declare(&mut vars, "xe", 0.0, 0.0, 0.0, "usteps")?;
    let xs = declare(&mut vars, "xs", 0.0, 0.0, 0.1, "usteps")?;
    let xs_in = declare(&mut vars, "xs_in", 0.0, 0.0, 20.0, "usteps")?;
    let dxsdt = declare(&mut vars, "dxsdt", 0.0, 0.0, 0.2, "usteps/sec")?;
    let ph = declare(&mut vars, "Ph", 0.0, 0.0, 0.1, "Pa")?;
    let ph0 = declare(&mut vars, "Ph0", 2500.0, 100.0, 0.01, "Pa")?;
    let ph_in = declare(&mut vars, "Ph_in", 0.0, 0.0, 3.0, "Pa")?;
    let ps = declare(&mut vars, "Ps", 0.0, 0.0, 0.1, "Pa")?;
    let pfric = declare(&mut vars, "Pfric", 0.0, 0.0, 10.0, "Pa")?;

    let chl = declare(&mut vars, "Chl", 1.2, 0.4, 0.01, "Pa/ustep")?;

    let m = vars.declare(
        ProcessVariable::new("m", 0.56, 0.05, 0.00001, "dimensionless").with_update_weight(0.05),
    )?;
    let gamma = vars.declare(ProcessVariable::new("gamma", 6.0, 0.5, 0.00001, "idk").with_update_weight(0.05))?;

    let xvars = vec![xs, dxsdt, ph, ph0, ps, pfric, chl, m, gamma];
    let mut model = KalmanModel::new("degen", vars, xvars, vec![xe], vec![xs_in, ph_in], deltat)?;
    model.add_state_transition_func(xs, xs + dxsdt * deltat)?;
    model.add_state_transition_func(ps, ph - pfric)?;
    model.add_state_transition_func(dxsdt, Expr::conditional(dxsdt, 25.0, dxsdt, gamma * ps.pow(m)))?;
    model.add_state_transition_func(ph, chl * (xe - xs))?;
    model.add_observation_func(xs_in, xs)?;
    model.add_observation_func(ph_in, ph + ph0)?;

    Sensors { xs_in, ph_in }.bind(&mut model)?;
    model.add_smoothness_metric(dxsdt, 1.0, None)?;
    model.add_negativity_metric(ph, 1.0)?;
    Ok(model)
}

/// Gel extrusion: one capacitance, linear friction, shear thinning
fn gel() -> Result<KalmanModel> {
    let mut vars = VariableTable::new();
    let deltat = declare(&mut vars, "deltat", 0.0, 0.0, 0.0, "sec")?;

    let xe = declare(&mut vars, "xe", 0.0, 0.0, 0.0, "usteps")?;
    let xs = declare(&mut vars, "xs", 0.0, 20.0, 1.0, "usteps")?;
    let xs_in = declare(&mut vars, "xs_in", 0.0, 0.0, 10.0, "usteps")?;
    let dxsdt = declare(&mut vars, "dxsdt", 0.0, 20.0, 0.1, "usteps/sec")?;
    let xn = declare(&mut vars, "xn", 0.0, 20.0, 0.0, "usteps")?;
    let dxndt = declare(&mut vars, "dxndt", 0.0, 20.0, 0.0, "usteps/sec")?;
    let ph = declare(&mut vars, "Ph", 1.0, 30.0, 0.1, "Pa")?;
    let ph0 = declare(&mut vars, "Ph0", 2500.0, 100.0, 0.0, "Pa")?;
    let ph_in = declare(&mut vars, "Ph_in", 0.0, 0.0, 3.0, "Pa")?;
    let ps = declare(&mut vars, "Ps", 1.0, 30.0, 0.0, "Pa")?;

    let chl = declare(&mut vars, "Chl", 1.2, 0.4, 0.0, "Pa/ustep")?;
    let csl = declare(&mut vars, "Csl", 2.5, 0.4, 0.1, "Pa/ustep")?;
    let ahas = declare(&mut vars, "AhAs", (0.5f64 / 0.7).powi(2), 0.1, 0.0, "dimensionless")?;

    let a0 = declare(&mut vars, "a0", 300.0, 1000.0, 0.0, "Pa")?;
    let a1 = declare(&mut vars, "a1", 3.0, 1.0, 0.0, "Pa/(ustep/sec)")?;

    let m = declare(&mut vars, "m", 0.56, 0.05, 0.0, "dimensionless")?;
    let gamma = declare(&mut vars, "gamma", 6.0, 0.5, 0.0, "idk")?;

    let xvars = vec![xs, dxsdt, xn, dxndt, ph, ph0, ps, chl, csl, ahas, a0, a1, m, gamma];
    let mut model = KalmanModel::new("gel", vars, xvars, vec![xe], vec![xs_in, ph_in], deltat)?;
    model.add_state_transition_func(xs, xs + dxsdt * deltat)?;
    model.add_state_transition_func(xn, xn + dxndt * deltat)?;
    model.add_state_transition_func(a0, ahas * ph - ps - a1 * dxsdt)?;
    model.add_state_transition_func(dxndt, gamma * ps.pow(m))?;
    model.add_state_transition_func(ph, chl * (xe - xs))?;
    model.add_state_transition_func(ps, csl * (xn - xs))?;
    model.add_observation_func(xs_in, xs)?;
    model.add_observation_func(ph_in, ph + ph0)?;

    Sensors { xs_in, ph_in }.bind(&mut model)?;
    model.add_smoothness_metric(dxsdt, 1.0, None)?;
    model.add_negativity_metric(ph, 1.0)?;
    Ok(model)
}

/// Empty syringe: capacitance and linear friction only
fn empty_c1f1() -> Result<KalmanModel> {
    let mut vars = VariableTable::new();
    let deltat = declare(&mut vars, "deltat", 0.0, 0.0, 0.0, "sec")?;

    let xe = declare(&mut vars, "xe", 0.0, 0.0, 0.0, "usteps")?;
    let xs = declare(&mut vars, "xs", 0.0, 20.0, 0.0, "usteps")?;
    let xs_in = declare(&mut vars, "xs_in", 0.0, 0.0, 0.0, "usteps")?;
    let dxsdt = declare(&mut vars, "dxsdt", 0.0, 20.0, 0.0, "usteps/sec")?;
    let ph = declare(&mut vars, "Ph", 0.0, 30.0, 0.0, "Pa")?;
    let ph0 = declare(&mut vars, "Ph0", 2500.0, 100.0, 0.0, "Pa")?;
    let ph_in = declare(&mut vars, "Ph_in", 0.0, 0.0, 0.0, "Pa")?;

    let chl = declare(&mut vars, "Chl", 3.0, 0.4, 0.0, "Pa/ustep")?;

    let a0 = declare(&mut vars, "a0", 300.0, 1000.0, 0.0, "Pa")?;
    let a1 = declare(&mut vars, "a1", 3.0, 1.0, 0.0, "Pa/(ustep/sec)")?;

    let xvars = vec![xs, dxsdt, ph, ph0, chl, a0, a1];
    let mut model = KalmanModel::new("empty_c1f1", vars, xvars, vec![xe], vec![xs_in, ph_in], deltat)?;
    model.add_state_transition_func(xs, xs + dxsdt * deltat)?;
    model.add_state_transition_func(dxsdt, (ph - a0) / a1)?;
    model.add_state_transition_func(ph, chl * (xe - xs))?;
    model.add_observation_func(xs_in, xs)?;
    model.add_observation_func(ph_in, ph + ph0)?;

    Sensors { xs_in, ph_in }.bind(&mut model)?;
    model.add_smoothness_metric(dxsdt, 1.0, None)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::NumericModel;

    #[test]
    fn test_every_model_builds_and_compiles() {
        for name in MODEL_NAMES {
            let model = build_model(name).unwrap();
            assert_eq!(model.name(), *name);
            let numeric = NumericModel::build(&model).unwrap();
            assert_eq!(numeric.observation_dim(), 2);
            assert_eq!(numeric.state_dim(), model.xvars().len());
        }
    }

    #[test]
    fn test_unknown_model() {
        assert!(matches!(build_model("nope"), Err(Error::UnknownModel(_))));
    }

    #[test]
    fn test_sensor_bindings() {
        let model = build_model("gel").unwrap();
        let vars = model.variables();
        assert_eq!(model.input_series_name(vars.lookup("xs_in").unwrap()), "xs");
        assert_eq!(model.input_series_name(vars.lookup("Ph_in").unwrap()), "P");
        assert_eq!(model.input_series_name(vars.lookup("xe").unwrap()), "xe");
    }

    #[test]
    fn test_degen_threshold_jacobian() {
        let model = build_model("degen").unwrap();
        let vars = model.variables();
        let dxsdt = vars.lookup("dxsdt").unwrap();
        let ps = vars.lookup("Ps").unwrap();
        let row = model.xvars().iter().position(|&v| v == dxsdt).unwrap();
        let col = model.xvars().iter().position(|&v| v == ps).unwrap();
        let entry = &model.dfdx()[row][col];

        // below the threshold dxsdt carries over, above it Ps drives the flow
        let at = |v: f64| {
            entry.eval(&|id| {
                if id == dxsdt {
                    v
                } else if id == ps {
                    100.0
                } else {
                    model.variable(id).initial_value
                }
            })
        };
        assert_eq!(at(10.0), 0.0);
        let expected = 6.0 * 0.56 * 100f64.powf(0.56 - 1.0);
        assert!((at(30.0) - expected).abs() < 1e-9);
    }
}
