// Zeroth-order parameter search over the calibration values of a model
//
// Each round perturbs every tunable parameter up and down by a shrinking
// relative step, then applies the best trials greedily for as long as the
// batch cost keeps dropping.

use tracing::{debug, info};

use crate::constants::{OPTIMIZER_ROUNDS, OPTIMIZER_STEP_DECAY, OPTIMIZER_STEP_SIZE};
use crate::error::Result;
use crate::model::{KalmanModel, Param};
use crate::symbolic::VarId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarGroup {
    Xvars,
    Zvars,
}

/// One tunable value: variable by group and position, and its parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialAddress {
    pub group: VarGroup,
    pub index: usize,
    pub param: Param,
}

impl TrialAddress {
    pub fn var(&self, model: &KalmanModel) -> VarId {
        match self.group {
            VarGroup::Xvars => model.xvars()[self.index],
            VarGroup::Zvars => model.zvars()[self.index],
        }
    }
}

/// Scale the addressed value by `1 + change`
///
/// Returns the previous value, or `None` when the trial is not allowed:
/// observations only tune their noise, zero values never move and update
/// weights must stay within [0, 1].
pub fn manipulate(model: &mut KalmanModel, address: &TrialAddress, change: f64) -> Option<f64> {
    if address.group == VarGroup::Zvars && address.param != Param::Noise {
        return None;
    }
    let id = address.var(model);
    let original = model.variable(id).get(address.param);
    let value = original * (1.0 + change);
    if original == 0.0 || (address.param == Param::UpdateWeight && !(0.0..=1.0).contains(&value)) {
        return None;
    }
    model.variables_mut().get_mut(id).set(address.param, value);
    Some(original)
}

pub fn restore(model: &mut KalmanModel, address: &TrialAddress, value: f64) {
    let id = address.var(model);
    model.variables_mut().get_mut(id).set(address.param, value);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub rounds: usize,
    pub step_size: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            rounds: OPTIMIZER_ROUNDS,
            step_size: OPTIMIZER_STEP_SIZE,
        }
    }
}

impl OptimizerConfig {
    /// Relative step used in round `n`
    pub fn step(&self, round: usize) -> f64 {
        self.step_size * (-(round as f64) / OPTIMIZER_STEP_DECAY).exp()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationReport {
    pub rounds: usize,
    pub best_cost: Option<f64>,
    pub applied: Vec<TrialAddress>,
}

struct Trial {
    address: TrialAddress,
    cost: f64,
    change: f64,
}

fn finite(cost: Option<f64>) -> Option<f64> {
    cost.filter(|c| !c.is_nan())
}

fn all_addresses(model: &KalmanModel) -> Vec<TrialAddress> {
    let groups = [(VarGroup::Xvars, model.xvars().len()), (VarGroup::Zvars, model.zvars().len())];
    groups
        .into_iter()
        .flat_map(|(group, len)| {
            (0..len).flat_map(move |index| Param::ALL.into_iter().map(move |param| TrialAddress { group, index, param }))
        })
        .collect()
}

/// Minimize `evaluate` by perturbing the calibration values of `model`
///
/// `evaluate` receives the model and the output subdirectories for the run
/// and returns the batch cost, `None` when there is none. The model is
/// left holding every applied improvement.
pub fn optimize<F>(model: &mut KalmanModel, config: &OptimizerConfig, mut evaluate: F) -> Result<OptimizationReport>
where
    F: FnMut(&KalmanModel, &[String]) -> Result<Option<f64>>,
{
    let mut report = OptimizationReport {
        rounds: 0,
        best_cost: None,
        applied: Vec::new(),
    };

    for n in 0..config.rounds {
        report.rounds = n + 1;
        info!("==== Round {} ====", n);
        let round = format!("opt{}", n);
        let reference = finite(evaluate(model, &[round.clone(), "reference".to_string()])?);
        info!("reference cost ({}): {:?}", n, reference);
        report.best_cost = reference;

        let step = config.step(n);
        let mut trials = Vec::new();
        for address in all_addresses(model) {
            for (direction, change) in [("dec", -step), ("inc", step)] {
                let Some(original) = manipulate(model, &address, change) else {
                    continue;
                };
                let label = format!("{}-{}-{}", model.symbol(address.var(model)), address.param, direction);
                debug!("Running {} ({})...", label, n);
                let cost = evaluate(model, &[round.clone(), "trial".to_string(), label]);
                restore(model, &address, original);
                if let Some(cost) = finite(cost?) {
                    trials.push(Trial { address, cost, change });
                }
            }
        }
        trials.sort_by(|a, b| a.cost.total_cmp(&b.cost));

        let mut best = reference;
        let mut improved = false;
        for (i, trial) in trials.iter().enumerate() {
            let Some(original) = manipulate(model, &trial.address, trial.change) else {
                continue;
            };
            let cost = evaluate(model, &[round.clone(), "optimize".to_string(), i.to_string()]);
            let cost = match cost {
                Ok(cost) => finite(cost),
                Err(e) => {
                    restore(model, &trial.address, original);
                    return Err(e);
                }
            };
            let better = match (cost, best) {
                (Some(c), Some(b)) => c < b,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !better {
                restore(model, &trial.address, original);
                break;
            }
            info!("Applying {:?} optimizes down to {:?}", trial.address, cost);
            best = cost;
            improved = true;
            report.applied.push(trial.address);
        }
        report.best_cost = best;
        if !improved {
            break;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProcessVariable, VariableTable};

    fn model() -> KalmanModel {
        let mut vars = VariableTable::new();
        let deltat = vars.declare(ProcessVariable::new("deltat", 0.0, 0.0, 0.0, "sec")).unwrap();
        let xs = vars
            .declare(ProcessVariable::new("xs", 1.0, 4.0, 1.0, "usteps").with_update_weight(0.9))
            .unwrap();
        let dxsdt = vars.declare(ProcessVariable::new("dxsdt", 0.0, 2.0, 0.5, "usteps/sec")).unwrap();
        let xs_in = vars.declare(ProcessVariable::new("xs_in", 0.0, 0.0, 10.0, "usteps")).unwrap();
        KalmanModel::new("opt", vars, vec![xs, dxsdt], vec![], vec![xs_in], deltat).unwrap()
    }

    fn noise(model: &KalmanModel, symbol: &str) -> f64 {
        model.variable(model.variables().lookup(symbol).unwrap()).noise
    }

    #[test]
    fn test_manipulate_rules() {
        let mut m = model();
        let z_cov = TrialAddress { group: VarGroup::Zvars, index: 0, param: Param::InitialCovariance };
        assert_eq!(manipulate(&mut m, &z_cov, 0.1), None);

        let z_noise = TrialAddress { group: VarGroup::Zvars, index: 0, param: Param::Noise };
        assert_eq!(manipulate(&mut m, &z_noise, 0.1), Some(10.0));
        assert!((noise(&m, "xs_in") - 11.0).abs() < 1e-12);
        restore(&mut m, &z_noise, 10.0);
        assert_eq!(noise(&m, "xs_in"), 10.0);

        // zero initial value never moves
        let dx_value = TrialAddress { group: VarGroup::Xvars, index: 1, param: Param::InitialValue };
        assert_eq!(manipulate(&mut m, &dx_value, 0.1), None);

        // 0.9 * 1.2 > 1
        let weight = TrialAddress { group: VarGroup::Xvars, index: 0, param: Param::UpdateWeight };
        assert_eq!(manipulate(&mut m, &weight, 0.2), None);
        assert_eq!(manipulate(&mut m, &weight, -0.2), Some(0.9));
    }

    #[test]
    fn test_step_decays() {
        let config = OptimizerConfig::default();
        assert!((config.step(0) - 0.2).abs() < 1e-12);
        assert!((config.step(20) - 0.2 / std::f64::consts::E).abs() < 1e-12);
    }

    #[test]
    fn test_no_improvement_leaves_model_unchanged() {
        let mut m = model();
        let original = m.clone();
        let mut calls = Vec::new();
        let report = optimize(&mut m, &OptimizerConfig::default(), |candidate, subdirs| {
            calls.push(subdirs.join("/"));
            // any deviation from the starting calibration costs more
            Ok(Some(if *candidate == original { 1.0 } else { 2.0 }))
        })
        .unwrap();

        assert_eq!(m, original);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.best_cost, Some(1.0));
        assert!(report.applied.is_empty());
        assert_eq!(calls[0], "opt0/reference");
        assert!(calls.iter().any(|c| c == "opt0/trial/xs_in-noise-inc"));
        assert!(calls.iter().all(|c| !c.contains("xs_in-initialValue")));
    }

    #[test]
    fn test_greedy_descent_moves_toward_minimum() {
        let mut m = model();
        let config = OptimizerConfig { rounds: 30, step_size: 0.2 };
        let report = optimize(&mut m, &config, |candidate, _| {
            let v = noise(candidate, "xs");
            Ok(Some((v - 2.0).powi(2)))
        })
        .unwrap();

        assert!(!report.applied.is_empty());
        assert!((noise(&m, "xs") - 2.0).abs() < 0.1, "noise {}", noise(&m, "xs"));
        // parameters the cost ignores stay put
        assert_eq!(noise(&m, "dxsdt"), 0.5);
        assert_eq!(noise(&m, "xs_in"), 10.0);
    }

    #[test]
    fn test_trials_without_cost_are_discarded() {
        let mut m = model();
        let original = m.clone();
        let report = optimize(&mut m, &OptimizerConfig::default(), |candidate, _| {
            Ok(if *candidate == original { Some(1.0) } else { None })
        })
        .unwrap();
        assert_eq!(m, original);
        assert_eq!(report.rounds, 1);
    }
}
