// Dataset analysis: run a filter over recorded series and score the result
//
// One dataset directory produces one output directory holding the rendered
// model, the filter table and `summary.json`. Batches weight each dataset's
// cost by its row count.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::DVector;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::codegen::{render_model, NumericModel, Sample};
use crate::constants::{
    DEFAULT_DELTAT_CATCHUP, DXSDT_LOWPASS_COEFFICIENT, EXTRAPOLATION_LOWPASS_COEFFICIENT, SUMMARY_FILE_NAME,
    TABLE_FILE_NAME,
};
use crate::error::{Error, Result};
use crate::kalman::{FilterKind, KalmanFilter};
use crate::model::{KalmanModel, Normalization};
use crate::output::{write_text, CsvOutput};
use crate::series::{Dataset, TimeSeries};
use crate::summary::{anchored, Costs, Extrapolation, Summary};
use crate::symbolic::{Language, VarId};

/// Filter inputs keyed by the model variable they feed
pub type InputSeries = BTreeMap<VarId, TimeSeries>;

/// Per-step filter output: `(time, x, diag(P), h(x))`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterTable {
    pub times: Vec<f64>,
    pub states: Vec<DVector<f64>>,
    pub covariances: Vec<DVector<f64>>,
    pub observations: Vec<DVector<f64>>,
    /// Rows dropped for missing data
    pub skipped: usize,
}

impl FilterTable {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    fn column(&self, name: String, rows: &[DVector<f64>], index: usize) -> TimeSeries {
        TimeSeries::from_rows(name, self.times.iter().copied().zip(rows.iter().map(|r| r[index])))
    }

    /// Estimated states and predicted observations as series
    pub fn output_series(&self, model: &KalmanModel) -> BTreeMap<VarId, TimeSeries> {
        let mut out = BTreeMap::new();
        for (i, &id) in model.xvars().iter().enumerate() {
            out.insert(id, self.column(format!("kalman_{}", model.symbol(id)), &self.states, i));
        }
        for (i, &id) in model.zvars().iter().enumerate() {
            out.insert(id, self.column(format!("kalman_{}", model.symbol(id)), &self.observations, i));
        }
        out
    }

    pub fn header(&self, model: &KalmanModel) -> Vec<String> {
        let mut header = vec!["t".to_string()];
        header.extend(model.xvars().iter().map(|&id| format!("kalman_{}", model.symbol(id))));
        header.extend(model.xvars().iter().map(|&id| format!("kalman_cov_{}", model.symbol(id))));
        header.extend(model.zvars().iter().map(|&id| format!("kalman_{}", model.symbol(id))));
        header
    }

    pub fn write_csv(&self, model: &KalmanModel, path: &Path) -> Result<PathBuf> {
        let mut csv = CsvOutput::create(path, &self.header(model))?;
        for i in 0..self.len() {
            let mut row = vec![self.times[i]];
            row.extend(self.states[i].iter());
            row.extend(self.covariances[i].iter());
            row.extend(self.observations[i].iter());
            csv.write_row(&row)?;
        }
        csv.finish()
    }
}

/// Feed every row of `inputs` through `filter`
///
/// All series must have the same length and timestamps. Rows the filter
/// rejects for missing data are skipped; any other error aborts.
pub fn kalman_process(inputs: &InputSeries, filter: &mut dyn KalmanFilter) -> Result<FilterTable> {
    let mut table = FilterTable::default();
    let Some(first) = inputs.values().next() else {
        return Ok(table);
    };
    for series in inputs.values() {
        if series.len() != first.len() {
            return Err(Error::SeriesLengthMismatch {
                name: series.name().to_string(),
                expected: first.len(),
                actual: series.len(),
            });
        }
        if let Some(row) = (0..first.len()).find(|&i| series.times()[i] != first.times()[i]) {
            return Err(Error::SeriesTimestampMismatch {
                name: series.name().to_string(),
                row,
                expected: first.times()[row],
                actual: series.times()[row],
            });
        }
    }

    for (row, &time) in first.times().iter().enumerate() {
        let sample: Sample = inputs.iter().map(|(&id, s)| (id, s.values()[row])).collect();
        match filter.evolve(&sample) {
            Ok(()) => {}
            Err(Error::MissingData { missing }) => {
                warn!("row {} (t={}): missing data for {:?}, skipping", row, time, missing);
                table.skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        }
        let estimate = filter.state();
        table.times.push(time);
        table.covariances.push(estimate.p.diagonal());
        table.states.push(estimate.x);
        table.observations.push(estimate.z);
    }
    Ok(table)
}

fn zero_based(series: &TimeSeries) -> TimeSeries {
    let offset = series.values().first().copied().unwrap_or(0.0);
    series.apply_unary(|v| v - offset)
}

/// Derive the extrusion filter inputs from raw recordings
///
/// `xe` and `xs` are shifted to start at zero. `dxsdt` is the derivative of
/// the low-passed `xs`, and `deltat` holds the step before each `xe` sample.
/// Every series is resampled onto the `xe` timeline.
pub fn prepare_extrusion_inputs(raw: &Dataset) -> Result<Dataset> {
    let xe = zero_based(raw.get("xe")?);
    let xs = zero_based(raw.get("xs")?);
    let timeline = xe.times().to_vec();

    let mut out = Dataset::new();
    for name in raw.names().filter(|&n| n != "xe" && n != "xs") {
        out.insert(raw.get(name)?.resample_at(&timeline));
    }

    let dxsdt = xs
        .lowpass(DXSDT_LOWPASS_COEFFICIENT)
        .derivative()
        .renamed("dxsdt")
        .resample_at(&timeline);
    out.insert(dxsdt);

    let deltat = timeline
        .iter()
        .enumerate()
        .map(|(i, &t)| (t, if i == 0 { t } else { t - timeline[i - 1] }));
    out.insert(TimeSeries::from_rows("deltat", deltat));

    out.insert(xs.resample_at(&timeline));
    out.insert(xe);
    Ok(out)
}

/// Pick the dataset series for every input of `model`
pub fn bind_inputs(model: &KalmanModel, dataset: &Dataset) -> Result<InputSeries> {
    model
        .inputs()
        .into_iter()
        .map(|id| Ok((id, dataset.get(model.input_series_name(id))?.clone())))
        .collect()
}

/// Evaluate every metric of `model` against the filter output
pub fn calculate_costs(
    model: &KalmanModel,
    inputs: &InputSeries,
    outputs: &BTreeMap<VarId, TimeSeries>,
) -> Costs {
    let metrics = model.metrics();
    let mut costs = Costs::default();

    for (var, metric) in &metrics.error {
        let (Some(actual), Some(reference)) = (outputs.get(var), inputs.get(&metric.reference)) else {
            warn!("no series for error metric on {}", model.symbol(*var));
            continue;
        };
        let normalizer = match metric.normalization {
            Normalization::AverageAbs => reference.average_abs(),
            Normalization::Rms => reference.rms(),
        };
        let cost = metric.weight * actual.error(reference).rms() / normalizer;
        costs.error.insert(model.symbol(*var).to_string(), cost);
    }

    for (var, metric) in &metrics.smoothness {
        let Some(series) = outputs.get(var) else {
            continue;
        };
        let cost = metric.weight * series.smoothness(metric.lowpass, metric.filter_coef) / series.rms();
        costs.smoothness.insert(model.symbol(*var).to_string(), cost);
    }

    for (var, metric) in &metrics.negativity {
        let Some(series) = outputs.get(var) else {
            continue;
        };
        let negative = series.apply_unary(|v| v.min(0.0));
        let cost = metric.weight * negative.rms() / series.rms();
        costs.negativity.insert(model.symbol(*var).to_string(), cost);
    }

    costs
}

/// Replay the firmware position extrapolator
///
/// Each step predicts a velocity that pulls the extrapolated position back
/// toward `xs` over `catchup` seconds. `dxsdt` and `deltat` are read at the
/// sample times of `xs`.
pub fn calculate_extrapolation(
    xs: &TimeSeries,
    dxsdt: &TimeSeries,
    deltat: &TimeSeries,
    catchup: f64,
) -> TimeSeries {
    let times = xs.times();
    let Some(&start) = xs.values().first() else {
        return TimeSeries::from_rows("xs_extrapolation", std::iter::empty());
    };
    let mut values = Vec::with_capacity(times.len());
    values.push(start);
    for (i, (&t, &position)) in times.iter().zip(xs.values()).enumerate().take(times.len() - 1) {
        let predicted = (position - values[i]) / catchup + dxsdt.interpolate_at(t);
        values.push(values[i] + deltat.interpolate_at(t) * predicted);
    }
    TimeSeries::from_rows("xs_extrapolation", times.iter().copied().zip(values))
}

/// `<parent>/kalman-<filter>-<dataset>-<model>/<subdirs...>`
pub fn assemble_output_dir(data_dir: &Path, filter: FilterKind, model_name: &str, subdirs: &[String]) -> PathBuf {
    let dataset = data_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut dir = data_dir
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("kalman-{}-{}-{}", filter, dataset, model_name));
    for sub in subdirs {
        dir.push(sub);
    }
    dir
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisOptions {
    pub filter: FilterKind,
    /// Score runs by extrapolation error with this catch-up time
    pub deltat_catchup: Option<f64>,
    /// Log the per-metric cost breakdown
    pub complete_summary: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            filter: FilterKind::default(),
            deltat_catchup: Some(DEFAULT_DELTAT_CATCHUP),
            complete_summary: false,
        }
    }
}

/// Cost of one dataset and the weight it carries in a batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetOutcome {
    pub cost: f64,
    pub weight: usize,
}

fn simulate_extrapolation(
    model: &KalmanModel,
    prepared: &Dataset,
    outputs: &BTreeMap<VarId, TimeSeries>,
    catchup: f64,
) -> Result<Option<Extrapolation>> {
    let Some(dxsdt) = model
        .xvars()
        .iter()
        .find(|&&id| model.symbol(id) == "dxsdt")
        .and_then(|id| outputs.get(id))
    else {
        warn!("model {} has no dxsdt state, skipping extrapolation", model.name());
        return Ok(None);
    };
    let xs = prepared.get("xs")?;
    let deltat = prepared.get("deltat")?;

    let kalman = calculate_extrapolation(xs, dxsdt, deltat, catchup).error(xs).rms();
    let lowpass_dxsdt = xs.derivative().exp_lowpass(EXTRAPOLATION_LOWPASS_COEFFICIENT);
    let lowpass = calculate_extrapolation(xs, &lowpass_dxsdt, deltat, catchup)
        .error(xs)
        .rms();
    info!("extrapolation RMS error: kalman {}, lowpass {}", kalman, lowpass);
    Ok(Some(Extrapolation { kalman, lowpass }))
}

fn log_breakdown(costs: &Costs) {
    let total = costs.total();
    info!("Total cost: {}", total);
    for (category, symbol, cost) in costs.ranked() {
        info!(
            " * {:.<24} {:.3}% ({:.3e})",
            format!("{}-{}:", category, symbol),
            100.0 * cost / total,
            cost
        );
    }
}

/// Run `model` over one dataset directory and write its outputs
///
/// Returns `None` when the filter diverges.
pub fn analyze_dataset(
    data_dir: &Path,
    model: &KalmanModel,
    options: &AnalysisOptions,
    subdirs: &[String],
) -> Result<Option<DatasetOutcome>> {
    let out_dir = assemble_output_dir(data_dir, options.filter, model.name(), subdirs);
    fs::create_dir_all(&out_dir).map_err(|e| Error::io(format!("creating {}", out_dir.display()), e))?;
    debug!("saving output to {}", out_dir.display());

    let numeric = NumericModel::build(model)?;
    let language = Language::Rust;
    write_text(
        &out_dir.join(format!("model.{}", language.file_extension())),
        &render_model(model, language),
    )?;

    let prepared = prepare_extrusion_inputs(&Dataset::load_dir(data_dir)?)?;
    let inputs = bind_inputs(model, &prepared)?;
    let weight = prepared.get("xe")?.len();

    let mut filter = options.filter.build(numeric);
    let table = match kalman_process(&inputs, filter.as_mut()) {
        Ok(table) => table,
        Err(e) if e.is_divergence() => {
            warn!("{}: {}", data_dir.display(), e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    if table.skipped > 0 {
        warn!("{}: skipped {} rows with missing data", data_dir.display(), table.skipped);
    }
    table.write_csv(model, &out_dir.join(TABLE_FILE_NAME))?;

    let outputs = table.output_series(model);
    let costs = calculate_costs(model, &inputs, &outputs);
    let extrapolation = match options.deltat_catchup {
        Some(catchup) => simulate_extrapolation(model, &prepared, &outputs, catchup)?,
        None => None,
    };
    if options.complete_summary {
        log_breakdown(&costs);
    }

    let total = costs.total();
    Summary::new(model, costs, extrapolation).save(&out_dir.join(SUMMARY_FILE_NAME))?;

    let cost = match (options.deltat_catchup, extrapolation) {
        (Some(_), Some(ext)) => ext.kalman,
        _ => total,
    };
    Ok(Some(DatasetOutcome { cost, weight }))
}

/// Row-weighted average cost over `data_dirs`
///
/// Stops at the first dataset without a finite cost and returns `None`.
pub fn analyze_batch(
    data_dirs: &[PathBuf],
    model: &KalmanModel,
    options: &AnalysisOptions,
    subdirs: &[String],
) -> Result<Option<f64>> {
    let mut weighted = 0.0;
    let mut total_weight = 0usize;
    for dir in data_dirs {
        let outcome = analyze_dataset(dir, model, options, subdirs)?;
        match outcome {
            Some(DatasetOutcome { cost, weight }) if cost.is_finite() => {
                info!("{} (weight {}): cost is {}", dir.display(), weight, cost);
                weighted += cost * weight as f64;
                total_weight += weight;
            }
            _ => {
                info!("{}: no cost", dir.display());
                return Ok(None);
            }
        }
    }
    if total_weight == 0 {
        return Ok(None);
    }
    let average = weighted / total_weight as f64;
    info!("Total (average) cost is {}", average);
    Ok(Some(average))
}

/// Directories under `root` whose name matches `pattern` from the start
pub fn discover_data_dirs(pattern: &str, root: &Path, recurse: bool) -> Result<Vec<PathBuf>> {
    let re = anchored(pattern)?;
    let mut walker = WalkDir::new(root).min_depth(1);
    if !recurse {
        walker = walker.max_depth(1);
    }
    let mut dirs = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| Error::InvalidData {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if entry.file_type().is_dir() && re.is_match(&entry.file_name().to_string_lossy()) {
            dirs.push(entry.into_path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProcessVariable, VariableTable};
    use crate::models::build_model;

    struct Ramp {
        model: KalmanModel,
        inputs: InputSeries,
        dxsdt: VarId,
    }

    // xs' = xs + dxsdt * deltat with dxsdt fed as a control
    fn ramp(rows: usize) -> Ramp {
        let mut vars = VariableTable::new();
        let deltat = vars.declare(ProcessVariable::new("deltat", 0.0, 0.0, 0.0, "sec")).unwrap();
        let dxsdt = vars.declare(ProcessVariable::new("dxsdt", 0.0, 0.0, 0.0, "usteps/sec")).unwrap();
        let xs = vars.declare(ProcessVariable::new("xs", 0.0, 1.0, 0.01, "usteps")).unwrap();
        let xs_in = vars.declare(ProcessVariable::new("xs_in", 0.0, 0.0, 1.0, "usteps")).unwrap();
        let mut model = KalmanModel::new("ramp", vars, vec![xs], vec![dxsdt], vec![xs_in], deltat).unwrap();
        model.add_state_transition_func(xs, xs + dxsdt * deltat).unwrap();
        model.add_observation_func(xs_in, xs).unwrap();

        let times: Vec<f64> = (0..rows).map(|i| 0.1 * i as f64).collect();
        let series = |name: &str, f: &dyn Fn(usize, f64) -> f64| {
            TimeSeries::from_rows(name, times.iter().enumerate().map(|(i, &t)| (t, f(i, t))))
        };
        let mut inputs = InputSeries::new();
        inputs.insert(xs_in, series("xs_in", &|_, t| 5.0 * t));
        inputs.insert(dxsdt, series("dxsdt", &|_, _| 5.0));
        inputs.insert(deltat, series("deltat", &|i, _| if i == 0 { 0.0 } else { 0.1 }));
        Ramp { model, inputs, dxsdt }
    }

    #[test]
    fn test_end_to_end_ramp() {
        let ramp = ramp(50);
        let numeric = NumericModel::build(&ramp.model).unwrap();
        for kind in [FilterKind::Ekf, FilterKind::Ukf] {
            let mut filter = kind.build(numeric.clone());
            let table = kalman_process(&ramp.inputs, filter.as_mut()).unwrap();
            assert_eq!(table.len(), 50);
            let xs = table.states.last().unwrap()[0];
            assert!((xs - 24.5).abs() < 1e-3, "{} xs = {}", kind, xs);
        }
    }

    #[test]
    fn test_missing_control_skips_one_row() {
        let mut ramp = ramp(20);
        let control = ramp.inputs[&ramp.dxsdt].clone();
        let values: Vec<f64> = control
            .values()
            .iter()
            .enumerate()
            .map(|(i, &v)| if i == 7 { f64::NAN } else { v })
            .collect();
        ramp.inputs.insert(
            ramp.dxsdt,
            TimeSeries::new("dxsdt", control.times().to_vec(), values).unwrap(),
        );

        let numeric = NumericModel::build(&ramp.model).unwrap();
        let mut filter = FilterKind::Ekf.build(numeric);
        let table = kalman_process(&ramp.inputs, filter.as_mut()).unwrap();
        assert_eq!(table.len(), 19);
        assert_eq!(table.skipped, 1);
        assert!(!table.times.iter().any(|&t| (t - 0.7).abs() < 1e-9));
    }

    #[test]
    fn test_mismatched_series_abort() {
        let ramp_model = ramp(10);
        let numeric = NumericModel::build(&ramp_model.model).unwrap();

        let mut short = ramp_model.inputs.clone();
        short.insert(ramp_model.dxsdt, TimeSeries::from_rows("dxsdt", [(0.0, 5.0), (0.1, 5.0)]));
        let mut filter = FilterKind::Ekf.build(numeric.clone());
        assert!(matches!(
            kalman_process(&short, filter.as_mut()),
            Err(Error::SeriesLengthMismatch { actual: 2, .. })
        ));

        let mut shifted = ramp_model.inputs.clone();
        let times: Vec<f64> = (0..10).map(|i| 0.1 * i as f64 + 0.01).collect();
        shifted.insert(
            ramp_model.dxsdt,
            TimeSeries::new("dxsdt", times, vec![5.0; 10]).unwrap(),
        );
        let mut filter = FilterKind::Ekf.build(numeric);
        assert!(matches!(
            kalman_process(&shifted, filter.as_mut()),
            Err(Error::SeriesTimestampMismatch { row: 0, .. })
        ));
    }

    #[test]
    fn test_calculate_costs() {
        let mut ramp = ramp(4);
        let xs = ramp.model.variables().lookup("xs").unwrap();
        let xs_in = ramp.model.variables().lookup("xs_in").unwrap();
        ramp.model.add_error_metric(xs_in, xs, 2.0).unwrap();
        ramp.model.add_negativity_metric(xs, 1.0).unwrap();

        let times = vec![0.0, 1.0, 2.0, 3.0];
        let reference = TimeSeries::new("xs_in", times.clone(), vec![2.0, -2.0, 2.0, -2.0]).unwrap();
        ramp.inputs.insert(xs_in, reference);
        let mut outputs = BTreeMap::new();
        outputs.insert(xs, TimeSeries::new("kalman_xs", times, vec![3.0, -1.0, 3.0, -1.0]).unwrap());

        let costs = calculate_costs(&ramp.model, &ramp.inputs, &outputs);
        // error is 1 everywhere, reference average |v| is 2
        assert!((costs.error["xs"] - 1.0).abs() < 1e-12);
        // rms(min(v, 0)) = sqrt(0.5), rms(v) = sqrt(5)
        assert!((costs.negativity["xs"] - (0.5f64 / 5.0).sqrt()).abs() < 1e-12);
        assert!(costs.smoothness.is_empty());
    }

    #[test]
    fn test_extrapolation_tracks_exact_velocity() {
        let times: Vec<f64> = (0..30).map(|i| 0.1 * i as f64).collect();
        let xs = TimeSeries::from_rows("xs", times.iter().map(|&t| (t, 5.0 * t)));
        let dxsdt = TimeSeries::from_rows("dxsdt", times.iter().map(|&t| (t, 5.0)));
        let deltat = TimeSeries::from_rows("deltat", times.iter().map(|&t| (t, 0.1)));
        let out = calculate_extrapolation(&xs, &dxsdt, &deltat, 1.0);
        assert_eq!(out.len(), xs.len());
        assert!(out.error(&xs).rms() < 1e-9);

        // a wrong velocity is pulled back toward xs
        let slow = dxsdt.apply_unary(|v| v - 1.0);
        let fast_catchup = calculate_extrapolation(&xs, &slow, &deltat, 0.2).error(&xs).rms();
        let slow_catchup = calculate_extrapolation(&xs, &slow, &deltat, 5.0).error(&xs).rms();
        assert!(fast_catchup < slow_catchup);
    }

    #[test]
    fn test_prepare_extrusion_inputs() {
        let mut raw = Dataset::new();
        let rows = |offset: f64, slope: f64| (0..50).map(move |i| (0.1 * i as f64, offset + slope * 0.1 * i as f64));
        raw.insert(TimeSeries::from_rows("xe", rows(100.0, 6.0)));
        raw.insert(TimeSeries::from_rows("xs", rows(40.0, 5.0)));
        raw.insert(TimeSeries::from_rows("P", (0..25).map(|i| (0.2 * i as f64 + 0.05, 3000.0))));

        let prepared = prepare_extrusion_inputs(&raw).unwrap();
        let xe = prepared.get("xe").unwrap();
        assert_eq!(xe.values()[0], 0.0);
        assert_eq!(prepared.get("xs").unwrap().values()[0], 0.0);
        for name in ["xs", "P", "dxsdt", "deltat"] {
            assert_eq!(prepared.get(name).unwrap().times(), xe.times(), "{}", name);
        }

        let deltat = prepared.get("deltat").unwrap().values();
        assert_eq!(deltat[0], 0.0);
        assert!(deltat[1..].iter().all(|d| (d - 0.1).abs() < 1e-9));

        let dxsdt = prepared.get("dxsdt").unwrap().values();
        assert!((dxsdt[30] - 5.0).abs() < 1e-9);
        assert!((dxsdt[49] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_assemble_output_dir() {
        let dir = assemble_output_dir(
            Path::new("/data/run-03"),
            FilterKind::Ukf,
            "velocity",
            &["opt2".to_string(), "reference".to_string()],
        );
        assert_eq!(dir, PathBuf::from("/data/kalman-ukf-run-03-velocity/opt2/reference"));
    }

    fn write_recording(dir: &Path, rows: usize) {
        fs::create_dir_all(dir).unwrap();
        let mut xe = String::from("t,xe\n");
        let mut xs = String::from("t,xs\n");
        let mut p = String::from("t,P\n");
        for i in 0..rows {
            let us = 1_000_000 + 10_000 * i as u64;
            let t = 0.01 * i as f64;
            xe.push_str(&format!("{},{}\n", us, 200.0 + 6.0 * t));
            xs.push_str(&format!("{},{}\n", us, 50.0 + 5.0 * t + 0.01 * (i % 3) as f64));
            p.push_str(&format!("{},{}\n", us, 2500.0 + 10.0 * t));
        }
        fs::write(dir.join("xe-vs-t.csv"), xe).unwrap();
        fs::write(dir.join("xs-vs-t.csv"), xs).unwrap();
        fs::write(dir.join("P-vs-t.csv"), p).unwrap();
    }

    #[test]
    fn test_analyze_dataset_writes_outputs() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("run1");
        write_recording(&data, 200);
        let model = build_model("velocity").unwrap();
        let options = AnalysisOptions {
            deltat_catchup: Some(0.5),
            ..AnalysisOptions::default()
        };

        let outcome = analyze_dataset(&data, &model, &options, &["run".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(outcome.weight, 200);
        assert!(outcome.cost.is_finite());

        let out_dir = root.path().join("kalman-ekf-run1-velocity").join("run");
        let summary = Summary::load(&out_dir.join(SUMMARY_FILE_NAME)).unwrap();
        assert!(summary.cost.is_some());
        assert_eq!(summary.extrapolation.map(|e| e.kalman), Some(outcome.cost));
        assert!(summary.vars.contains_key("dxsdt"));

        let table = fs::read_to_string(out_dir.join(TABLE_FILE_NAME)).unwrap();
        assert!(table.starts_with("t,kalman_xs,kalman_dxsdt,"));
        assert_eq!(table.lines().count(), 201);
        let text = fs::read_to_string(out_dir.join("model.rs")).unwrap();
        assert!(text.starts_with(crate::codegen::source::AUTOGENERATED_HEADER));
    }

    #[test]
    fn test_analyze_batch_weights_by_rows() {
        let root = tempfile::tempdir().unwrap();
        let a = root.path().join("run_a");
        let b = root.path().join("run_b");
        write_recording(&a, 100);
        write_recording(&b, 300);
        let model = build_model("velocity").unwrap();
        let options = AnalysisOptions::default();
        let subdirs = ["batch".to_string()];

        let ca = analyze_dataset(&a, &model, &options, &subdirs).unwrap().unwrap();
        let cb = analyze_dataset(&b, &model, &options, &subdirs).unwrap().unwrap();
        // scored by the one-second extrapolation unless told otherwise
        let summary_a = root.path().join("kalman-ekf-run_a-velocity/batch").join(SUMMARY_FILE_NAME);
        let summary = Summary::load(&summary_a).unwrap();
        assert_eq!(summary.extrapolation.map(|e| e.kalman), Some(ca.cost));
        let by_metrics = AnalysisOptions {
            deltat_catchup: None,
            ..options
        };
        let total = analyze_dataset(&a, &model, &by_metrics, &subdirs).unwrap().unwrap();
        assert_eq!(Some(total.cost), Summary::load(&summary_a).unwrap().cost);
        assert!(Summary::load(&summary_a).unwrap().extrapolation.is_none());
        let expected = (ca.cost * 100.0 + cb.cost * 300.0) / 400.0;
        let average = analyze_batch(&[a, b], &model, &options, &subdirs).unwrap().unwrap();
        assert!((average - expected).abs() < 1e-12);
        assert_eq!(analyze_batch(&[], &model, &options, &subdirs).unwrap(), None);
    }

    #[test]
    fn test_divergence_stops_batch() {
        let root = tempfile::tempdir().unwrap();
        let first = root.path().join("run_a");
        let second = root.path().join("run_b");
        write_recording(&first, 50);
        write_recording(&second, 50);

        // no prior uncertainty, process noise or sensor noise: S is singular
        let mut model = build_model("velocity").unwrap();
        let estimated: Vec<VarId> = model.xvars().iter().chain(model.zvars()).copied().collect();
        for id in estimated {
            let var = model.variables_mut().get_mut(id);
            var.initial_covariance = 0.0;
            var.noise = 0.0;
        }
        let options = AnalysisOptions::default();
        let subdirs = ["batch".to_string()];

        assert_eq!(analyze_dataset(&first, &model, &options, &subdirs).unwrap(), None);
        let out_dir = root.path().join("kalman-ekf-run_a-velocity").join("batch");
        assert!(!out_dir.join(SUMMARY_FILE_NAME).exists());

        fs::remove_dir_all(root.path().join("kalman-ekf-run_a-velocity")).unwrap();
        assert_eq!(analyze_batch(&[first, second], &model, &options, &subdirs).unwrap(), None);
        assert!(root.path().join("kalman-ekf-run_a-velocity").exists());
        assert!(!root.path().join("kalman-ekf-run_b-velocity").exists());
    }

    #[test]
    fn test_discover_data_dirs() {
        let root = tempfile::tempdir().unwrap();
        for dir in ["print-01", "print-02", "other", "nested/print-03"] {
            fs::create_dir_all(root.path().join(dir)).unwrap();
        }
        fs::write(root.path().join("print-file"), "").unwrap();

        let flat = discover_data_dirs("print-", root.path(), false).unwrap();
        assert_eq!(flat, vec![root.path().join("print-01"), root.path().join("print-02")]);
        let deep = discover_data_dirs("print-", root.path(), true).unwrap();
        assert_eq!(deep.len(), 3);
        assert!(discover_data_dirs("(", root.path(), false).is_err());
    }
}
