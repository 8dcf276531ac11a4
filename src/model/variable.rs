// Process variables and their calibration table

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::symbolic::VarId;

/// A named quantity of the model together with its calibration values
///
/// The same record describes states, controls, observations and the time
/// step; which fields matter depends on the role the model assigns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessVariable {
    pub symbol: String,
    pub initial_value: f64,
    pub initial_covariance: f64,
    /// Diagonal contribution to Q (states) or R (observations)
    pub noise: f64,
    pub units: String,
    /// Fraction of the correction applied to this state, in [0, 1]
    pub update_weight: f64,
}

impl ProcessVariable {
    pub fn new(
        symbol: impl Into<String>,
        initial_value: f64,
        initial_covariance: f64,
        noise: f64,
        units: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            initial_value,
            initial_covariance,
            noise,
            units: units.into(),
            update_weight: 1.0,
        }
    }

    pub fn with_update_weight(mut self, update_weight: f64) -> Self {
        self.update_weight = update_weight;
        self
    }

    pub fn get(&self, param: Param) -> f64 {
        match param {
            Param::InitialValue => self.initial_value,
            Param::InitialCovariance => self.initial_covariance,
            Param::Noise => self.noise,
            Param::UpdateWeight => self.update_weight,
        }
    }

    pub fn set(&mut self, param: Param, value: f64) {
        match param {
            Param::InitialValue => self.initial_value = value,
            Param::InitialCovariance => self.initial_covariance = value,
            Param::Noise => self.noise = value,
            Param::UpdateWeight => self.update_weight = value,
        }
    }
}

/// Tunable calibration field of a process variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Param {
    InitialValue,
    InitialCovariance,
    Noise,
    UpdateWeight,
}

impl Param {
    pub const ALL: [Param; 4] = [
        Param::InitialValue,
        Param::InitialCovariance,
        Param::Noise,
        Param::UpdateWeight,
    ];

    /// Name used in summary and override files
    pub fn name(self) -> &'static str {
        match self {
            Param::InitialValue => "initialValue",
            Param::InitialCovariance => "initialCovariance",
            Param::Noise => "noise",
            Param::UpdateWeight => "updateWeight",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Param {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Param::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| Error::UnknownParameter(s.to_string()))
    }
}

/// Side table holding every declared variable, addressed by `VarId`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableTable {
    vars: Vec<ProcessVariable>,
    by_symbol: BTreeMap<String, VarId>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variable and return its handle
    pub fn declare(&mut self, mut var: ProcessVariable) -> Result<VarId> {
        if self.by_symbol.contains_key(&var.symbol) {
            return Err(Error::DuplicateVariable(var.symbol));
        }
        if var.update_weight > 1.0 {
            warn!(
                "process variable {} has an update weight greater than 1, setting to 1",
                var.symbol
            );
            var.update_weight = 1.0;
        }
        let id = VarId(self.vars.len() as u32);
        self.by_symbol.insert(var.symbol.clone(), id);
        self.vars.push(var);
        Ok(id)
    }

    pub fn lookup(&self, symbol: &str) -> Result<VarId> {
        self.by_symbol
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::UnknownVariable(symbol.to_string()))
    }

    pub fn contains(&self, id: VarId) -> bool {
        id.index() < self.vars.len()
    }

    /// Panics if `id` was issued by another table
    pub fn get(&self, id: VarId) -> &ProcessVariable {
        &self.vars[id.index()]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut ProcessVariable {
        &mut self.vars[id.index()]
    }

    pub fn symbol(&self, id: VarId) -> &str {
        &self.vars[id.index()].symbol
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &ProcessVariable)> {
        self.vars
            .iter()
            .enumerate()
            .map(|(i, v)| (VarId(i as u32), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_and_lookup() {
        let mut table = VariableTable::new();
        let xs = table
            .declare(ProcessVariable::new("xs", 0.0, 20.0, 1.0, "usteps"))
            .unwrap();
        let ph = table
            .declare(ProcessVariable::new("Ph", 1.0, 30.0, 0.1, "Pa"))
            .unwrap();
        assert_ne!(xs, ph);
        assert_eq!(table.lookup("Ph").unwrap(), ph);
        assert_eq!(table.symbol(xs), "xs");
        assert_eq!(table.len(), 2);
        assert!(matches!(table.lookup("nope"), Err(Error::UnknownVariable(_))));
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let mut table = VariableTable::new();
        table.declare(ProcessVariable::new("xs", 0.0, 1.0, 1.0, "")).unwrap();
        let err = table
            .declare(ProcessVariable::new("xs", 2.0, 1.0, 1.0, ""))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateVariable(s) if s == "xs"));
    }

    #[test]
    fn test_update_weight_clamped() {
        let mut table = VariableTable::new();
        let id = table
            .declare(ProcessVariable::new("m", 0.56, 0.05, 1e-5, "").with_update_weight(3.0))
            .unwrap();
        assert_eq!(table.get(id).update_weight, 1.0);
    }

    #[test]
    fn test_param_access() {
        let mut var = ProcessVariable::new("gamma", 6.0, 0.5, 1e-5, "idk").with_update_weight(0.05);
        for param in Param::ALL {
            var.set(param, var.get(param) * 2.0);
        }
        assert_eq!(var.initial_value, 12.0);
        assert_eq!(var.initial_covariance, 1.0);
        assert_eq!(var.noise, 2e-5);
        assert_eq!(var.update_weight, 0.1);
        assert_eq!("updateWeight".parse::<Param>().unwrap(), Param::UpdateWeight);
        assert!("mode".parse::<Param>().is_err());
    }
}
