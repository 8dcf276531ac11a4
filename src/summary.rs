// Run summaries, parameter overrides and parameter tracking
//
// Summary files are JSON with sorted keys:
//   { "cost": .., "metrics": { "error": {..}, .. }, "vars": { "<symbol>": {..} } }
// The "vars" block doubles as an override file for later runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::constants::PARAM_TRACKING_DIR;
use crate::error::{Error, Result};
use crate::model::{KalmanModel, Param};
use crate::output::CsvOutput;

/// Role of a variable in the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarMode {
    Xvar,
    Zvar,
    Uvar,
}

/// Calibration snapshot of one variable
///
/// States carry every parameter, observations only their noise, controls
/// nothing but the mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VarSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_covariance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<f64>,
    pub mode: VarMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_weight: Option<f64>,
}

impl VarSummary {
    /// Numeric parameters present in this snapshot
    pub fn params(&self) -> Vec<(Param, f64)> {
        [
            (Param::InitialCovariance, self.initial_covariance),
            (Param::InitialValue, self.initial_value),
            (Param::Noise, self.noise),
            (Param::UpdateWeight, self.update_weight),
        ]
        .into_iter()
        .filter_map(|(p, v)| v.map(|v| (p, v)))
        .collect()
    }
}

/// Per-metric cost factors keyed by variable symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Costs {
    #[serde(default)]
    pub error: BTreeMap<String, f64>,
    #[serde(default)]
    pub negativity: BTreeMap<String, f64>,
    #[serde(default)]
    pub smoothness: BTreeMap<String, f64>,
}

impl Costs {
    pub fn total(&self) -> f64 {
        self.error.values().chain(self.negativity.values()).chain(self.smoothness.values()).sum()
    }

    /// `(category, symbol, cost)` rows, most expensive first
    pub fn ranked(&self) -> Vec<(&'static str, &str, f64)> {
        let mut rows: Vec<(&'static str, &str, f64)> = self
            .error
            .iter()
            .map(|(k, v)| ("error", k.as_str(), *v))
            .chain(self.smoothness.iter().map(|(k, v)| ("smoothness", k.as_str(), *v)))
            .chain(self.negativity.iter().map(|(k, v)| ("negativity", k.as_str(), *v)))
            .collect();
        rows.sort_by(|a, b| b.2.total_cmp(&a.2));
        rows
    }
}

/// RMS error of the firmware position extrapolator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extrapolation {
    /// Driven by the filter's velocity estimate
    pub kalman: f64,
    /// Driven by a low-passed finite-difference velocity
    pub lowpass: f64,
}

/// Contents of `summary.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Total cost; absent when not finite
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extrapolation: Option<Extrapolation>,
    pub metrics: Costs,
    pub vars: BTreeMap<String, VarSummary>,
}

impl Summary {
    pub fn new(model: &KalmanModel, metrics: Costs, extrapolation: Option<Extrapolation>) -> Self {
        let total = metrics.total();
        Self {
            cost: total.is_finite().then_some(total),
            extrapolation,
            metrics,
            vars: generate_json_spec(model),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&text).map_err(|e| Error::json(format!("parsing {}", path.display()), e))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::json(format!("serializing {}", path.display()), e))?;
        fs::write(path, text + "\n").map_err(|e| Error::io(format!("writing {}", path.display()), e))
    }
}

/// Snapshot of every state, observation and control variable
pub fn generate_json_spec(model: &KalmanModel) -> BTreeMap<String, VarSummary> {
    let mut out = BTreeMap::new();
    for &id in model.xvars() {
        let v = model.variable(id);
        out.insert(
            v.symbol.clone(),
            VarSummary {
                initial_covariance: Some(v.initial_covariance),
                initial_value: Some(v.initial_value),
                mode: VarMode::Xvar,
                noise: Some(v.noise),
                update_weight: Some(v.update_weight),
            },
        );
    }
    for &id in model.zvars() {
        let v = model.variable(id);
        out.insert(
            v.symbol.clone(),
            VarSummary {
                initial_covariance: None,
                initial_value: None,
                mode: VarMode::Zvar,
                noise: Some(v.noise),
                update_weight: None,
            },
        );
    }
    for &id in model.uvars() {
        out.insert(
            model.symbol(id).to_string(),
            VarSummary {
                initial_covariance: None,
                initial_value: None,
                mode: VarMode::Uvar,
                noise: None,
                update_weight: None,
            },
        );
    }
    out
}

/// `{ "vars": { "<symbol>": { "<param>": value } } }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideFile {
    pub vars: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl OverrideFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&text).map_err(|e| Error::json(format!("parsing {}", path.display()), e))
    }
}

/// Apply overrides to the state and observation variables of `model`
///
/// The `mode` entry and symbols the model does not know are ignored.
/// Returns the number of values applied.
pub fn override_params(model: &mut KalmanModel, overrides: &OverrideFile) -> Result<usize> {
    let targets: Vec<_> = model.xvars().iter().chain(model.zvars()).copied().collect();
    let mut applied = 0;
    for id in targets {
        let symbol = model.symbol(id).to_string();
        let Some(params) = overrides.vars.get(&symbol) else {
            continue;
        };
        for (name, value) in params {
            if name == "mode" {
                continue;
            }
            let param: Param = name.parse()?;
            let Some(value) = value.as_f64() else {
                warn!("override {}.{} is not a number, ignoring", symbol, name);
                continue;
            };
            debug!("override {}.{} = {}", symbol, name, value);
            model.variables_mut().get_mut(id).set(param, value);
            applied += 1;
        }
    }
    for symbol in overrides.vars.keys() {
        if model.variables().lookup(symbol).is_err() {
            debug!("override for unknown variable {} ignored", symbol);
        }
    }
    Ok(applied)
}

/// Which summaries and values `track_params` collects
#[derive(Debug, Clone)]
pub struct TrackOptions {
    /// Only directories whose path matches (from the start)
    pub model_dir_regex: Option<String>,
    /// Summary file names to read (matched from the start)
    pub model_file_regex: String,
    /// Variable symbols, or `["all"]`
    pub vars: Vec<String>,
    /// Parameter names, or `["all"]`
    pub params: Vec<String>,
}

/// Compile `pattern` so it only matches from the start of the text
pub(crate) fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})", pattern)).map_err(|source| Error::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn selects(list: &[String], item: &str) -> bool {
    (list.len() == 1 && list[0] == "all") || list.iter().any(|s| s == item)
}

/// Collect `(parameter value, cost)` pairs from every summary under `root`
/// and write one CSV per variable/parameter into `root/param_tracking`
pub fn track_params(root: &Path, options: &TrackOptions) -> Result<Vec<PathBuf>> {
    let dir_re = options.model_dir_regex.as_deref().map(anchored).transpose()?;
    let file_re = anchored(&options.model_file_regex)?;

    let mut points: BTreeMap<String, BTreeMap<String, Vec<(f64, f64)>>> = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::InvalidData {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let dir = path.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        if let Some(re) = &dir_re {
            if !re.is_match(&dir) {
                continue;
            }
        }
        let file_name = entry.file_name().to_string_lossy();
        if !file_re.is_match(&file_name) {
            continue;
        }
        let summary = match Summary::load(path) {
            Ok(s) => s,
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let Some(cost) = summary.cost else {
            debug!("{} has no cost", path.display());
            continue;
        };
        for (var, snapshot) in &summary.vars {
            if !selects(&options.vars, var) {
                continue;
            }
            for (param, value) in snapshot.params() {
                if selects(&options.params, param.name()) {
                    points
                        .entry(var.clone())
                        .or_default()
                        .entry(param.name().to_string())
                        .or_default()
                        .push((value, cost));
                }
            }
        }
    }

    let out_dir = root.join(PARAM_TRACKING_DIR);
    fs::create_dir_all(&out_dir)
        .map_err(|e| Error::io(format!("creating {}", out_dir.display()), e))?;
    let mut written = Vec::new();
    for (var, nested) in points {
        for (param, mut data) in nested {
            data.sort_by(|a, b| a.0.total_cmp(&b.0));
            let name = format!("{}_{}", var, param);
            let mut csv = CsvOutput::create(&out_dir.join(format!("{}.csv", name)), &[name, "cost".to_string()])?;
            for (value, cost) in &data {
                csv.write_row(&[*value, *cost])?;
            }
            written.push(csv.finish()?);
        }
    }
    info!("wrote {} parameter tables to {}", written.len(), out_dir.display());
    Ok(written)
}
