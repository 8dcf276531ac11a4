// Time series container and signal utilities
//
// A `TimeSeries` holds strictly increasing sample times. Binary operations
// first resample both operands onto the union of their sample times with
// clamped linear interpolation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::constants::MICROS_PER_SECOND;
use crate::error::{Error, Result};
use crate::model::LowpassKind;

#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    name: String,
    times: Vec<f64>,
    values: Vec<f64>,
}

/// Two series sampled on a shared timeline
#[derive(Debug, Clone, PartialEq)]
pub struct Joined {
    pub times: Vec<f64>,
    pub left: Vec<f64>,
    pub right: Vec<f64>,
}

impl TimeSeries {
    /// Build from rows, dropping any row whose time does not increase
    pub fn from_rows(name: impl Into<String>, rows: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let name = name.into();
        let mut times = Vec::new();
        let mut values = Vec::new();
        let mut dropped = 0usize;
        for (t, v) in rows {
            match times.last() {
                Some(&last) if !(t > last) => dropped += 1,
                _ => {
                    times.push(t);
                    values.push(v);
                }
            }
        }
        if dropped > 0 {
            debug!("{}: dropped {} non-increasing rows", name, dropped);
        }
        Self { name, times, values }
    }

    /// Build from parallel columns of equal length
    pub fn new(name: impl Into<String>, times: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        let name = name.into();
        if times.len() != values.len() {
            return Err(Error::SeriesLengthMismatch {
                name,
                expected: times.len(),
                actual: values.len(),
            });
        }
        Ok(Self::from_rows(name, times.into_iter().zip(values)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.times.iter().copied().zip(self.values.iter().copied())
    }

    /// Linear interpolation, clamped to the first/last value outside the range
    pub fn interpolate_at(&self, t: f64) -> f64 {
        let n = self.times.len();
        if n == 0 {
            return f64::NAN;
        }
        if t <= self.times[0] {
            return self.values[0];
        }
        if t >= self.times[n - 1] {
            return self.values[n - 1];
        }
        // first index with time > t; guaranteed in 1..n here
        let hi = self.times.partition_point(|&x| x <= t);
        let lo = hi - 1;
        let (t0, t1) = (self.times[lo], self.times[hi]);
        let (v0, v1) = (self.values[lo], self.values[hi]);
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }

    /// Values of `self` at `times`
    pub fn resample_at(&self, times: &[f64]) -> TimeSeries {
        TimeSeries::from_rows(
            self.name.clone(),
            times.iter().map(|&t| (t, self.interpolate_at(t))),
        )
    }

    /// Values of `self` on the timeline of `other`
    pub fn resample_onto(&self, other: &TimeSeries) -> TimeSeries {
        self.resample_at(&other.times)
    }

    /// Both series on the union of their sample times
    pub fn join(&self, other: &TimeSeries) -> Joined {
        let times = union_times(&self.times, &other.times);
        let left = times.iter().map(|&t| self.interpolate_at(t)).collect();
        let right = times.iter().map(|&t| other.interpolate_at(t)).collect();
        Joined { times, left, right }
    }

    pub fn apply_unary(&self, f: impl Fn(f64) -> f64) -> TimeSeries {
        TimeSeries {
            name: self.name.clone(),
            times: self.times.clone(),
            values: self.values.iter().map(|&v| f(v)).collect(),
        }
    }

    /// `f(self, other)` on the union timeline
    pub fn apply_binary(&self, other: &TimeSeries, f: impl Fn(f64, f64) -> f64) -> TimeSeries {
        let joined = self.join(other);
        TimeSeries {
            name: self.name.clone(),
            values: joined
                .left
                .iter()
                .zip(&joined.right)
                .map(|(&a, &b)| f(a, b))
                .collect(),
            times: joined.times,
        }
    }

    /// `self - reference` on the union timeline
    pub fn error(&self, reference: &TimeSeries) -> TimeSeries {
        self.apply_binary(reference, |a, b| a - b)
            .renamed(format!("{}_error", self.name))
    }

    /// Finite differences placed at interval midpoints; one sample shorter
    pub fn derivative(&self) -> TimeSeries {
        let rows = self
            .times
            .windows(2)
            .zip(self.values.windows(2))
            .map(|(t, v)| ((t[0] + t[1]) / 2.0, (v[1] - v[0]) / (t[1] - t[0])));
        TimeSeries::from_rows(format!("d{}dt", self.name), rows)
    }

    /// Trailing moving average over `floor(1 / a)` samples
    ///
    /// The first samples average over the shorter window available.
    pub fn lowpass(&self, a: f64) -> TimeSeries {
        let window = ((1.0 / a).floor() as usize).max(1);
        let mut sum = 0.0;
        let mut values = Vec::with_capacity(self.values.len());
        for (i, &v) in self.values.iter().enumerate() {
            sum += v;
            if i >= window {
                sum -= self.values[i - window];
            }
            values.push(sum / (i + 1).min(window) as f64);
        }
        TimeSeries {
            name: self.name.clone(),
            times: self.times.clone(),
            values,
        }
    }

    /// First-order exponential filter seeded with the first sample
    pub fn exp_lowpass(&self, a: f64) -> TimeSeries {
        let mut average = self.values.first().copied().unwrap_or(0.0);
        let values = self
            .values
            .iter()
            .map(|&v| {
                average = average * (1.0 - a) + v * a;
                average
            })
            .collect();
        TimeSeries {
            name: self.name.clone(),
            times: self.times.clone(),
            values,
        }
    }

    pub fn filtered(&self, kind: LowpassKind, a: f64) -> TimeSeries {
        match kind {
            LowpassKind::Exponential => self.exp_lowpass(a),
            LowpassKind::BoxCar => self.lowpass(a),
        }
    }

    pub fn rms(&self) -> f64 {
        rms(&self.values)
    }

    pub fn average_abs(&self) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        self.values.iter().map(|v| v.abs()).sum::<f64>() / self.values.len() as f64
    }

    /// RMS of the high-frequency residual `self - lowpass(self)`
    pub fn smoothness(&self, kind: LowpassKind, a: f64) -> f64 {
        let low = self.filtered(kind, a);
        let residual: Vec<f64> = self
            .values
            .iter()
            .zip(&low.values)
            .map(|(v, l)| v - l)
            .collect();
        rms(&residual)
    }
}

pub(crate) fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

fn union_times(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let next = match (a.get(i), b.get(j)) {
            (Some(&x), Some(&y)) if x < y => {
                i += 1;
                x
            }
            (Some(&x), Some(&y)) if y < x => {
                j += 1;
                y
            }
            (Some(&x), Some(_)) => {
                i += 1;
                j += 1;
                x
            }
            (Some(&x), None) => {
                i += 1;
                x
            }
            (None, Some(&y)) => {
                j += 1;
                y
            }
            (None, None) => break,
        };
        out.push(next);
    }
    out
}

/// Named collection of series belonging to one recording
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    series: BTreeMap<String, TimeSeries>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, series: TimeSeries) {
        self.series.insert(series.name.clone(), series);
    }

    pub fn get(&self, name: &str) -> Result<&TimeSeries> {
        self.series
            .get(name)
            .ok_or_else(|| Error::MissingSeries(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.series.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Load every `<name>-vs-<axis>.csv` or `.txt` file in `dir`
    ///
    /// Each row is `timestamp_us, value` (comma or whitespace separated).
    /// Times are converted to seconds relative to the first row.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir)
            .map_err(|e| Error::io(format!("reading data directory {}", dir.display()), e))?;
        let mut dataset = Dataset::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(format!("listing {}", dir.display()), e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = series_name(&path) {
                let series = load_file(&path, &name)?;
                debug!("loaded {} ({} rows) from {}", name, series.len(), path.display());
                dataset.insert(series);
            }
        }
        if dataset.is_empty() {
            warn!("no data files found in {}", dir.display());
        }
        Ok(dataset)
    }
}

// "xs-vs-t.csv" -> "xs"
fn series_name(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if ext != "csv" && ext != "txt" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (name, axis) = stem.split_once("-vs-")?;
    let valid = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid(name) && valid(axis) {
        Some(name.to_string())
    } else {
        None
    }
}

fn load_file(path: &Path, name: &str) -> Result<TimeSeries> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty());
        let parsed = match (fields.next(), fields.next()) {
            (Some(t), Some(v)) => t.parse::<f64>().ok().zip(v.parse::<f64>().ok()),
            _ => None,
        };
        match parsed {
            Some(row) => rows.push(row),
            // a leading header line is allowed
            None if rows.is_empty() => continue,
            None => {
                return Err(Error::InvalidData {
                    path: path.to_path_buf(),
                    reason: format!("line {} is not a (timestamp, value) pair", lineno + 1),
                })
            }
        }
    }
    let start = rows.first().map_or(0.0, |&(t, _)| t);
    Ok(TimeSeries::from_rows(
        name,
        rows.into_iter()
            .map(|(t, v)| ((t - start) / MICROS_PER_SECOND, v)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(name: &str, rows: &[(f64, f64)]) -> TimeSeries {
        TimeSeries::from_rows(name, rows.iter().copied())
    }

    #[test]
    fn test_non_increasing_rows_dropped() {
        let s = series("xs", &[(0.0, 1.0), (1.0, 2.0), (1.0, 3.0), (0.5, 4.0), (2.0, 5.0)]);
        assert_eq!(s.times(), &[0.0, 1.0, 2.0]);
        assert_eq!(s.values(), &[1.0, 2.0, 5.0]);
    }

    #[test]
    fn test_new_checks_lengths() {
        let err = TimeSeries::new("P", vec![0.0, 1.0], vec![1.0]).unwrap_err();
        assert!(matches!(err, Error::SeriesLengthMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_interpolation_is_clamped() {
        let s = series("xs", &[(0.0, 0.0), (1.0, 10.0), (3.0, 30.0)]);
        assert_eq!(s.interpolate_at(-1.0), 0.0);
        assert_eq!(s.interpolate_at(0.5), 5.0);
        assert_eq!(s.interpolate_at(2.0), 20.0);
        assert_eq!(s.interpolate_at(1.0), 10.0);
        assert_eq!(s.interpolate_at(9.0), 30.0);
    }

    #[test]
    fn test_join_on_union_timeline() {
        let a = series("a", &[(0.0, 0.0), (2.0, 2.0)]);
        let b = series("b", &[(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]);
        let j = a.join(&b);
        assert_eq!(j.times, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(j.left, vec![0.0, 1.0, 2.0, 2.0]);
        assert_eq!(j.right, vec![10.0, 10.0, 20.0, 30.0]);

        let diff = b.error(&a);
        assert_eq!(diff.values(), &[10.0, 9.0, 18.0, 28.0]);
        assert_eq!(diff.name(), "b_error");
    }

    #[test]
    fn test_resample_onto() {
        let xs = series("xs", &[(0.0, 0.0), (1.0, 2.0)]);
        let xe = series("xe", &[(0.25, 0.0), (0.5, 0.0), (2.0, 0.0)]);
        let r = xs.resample_onto(&xe);
        assert_eq!(r.times(), xe.times());
        assert_eq!(r.values(), &[0.5, 1.0, 2.0]);
    }

    #[test]
    fn test_derivative_midpoints() {
        let s = series("xs", &[(0.0, 0.0), (1.0, 2.0), (3.0, 4.0)]);
        let d = s.derivative();
        assert_eq!(d.name(), "dxsdt");
        assert_eq!(d.times(), &[0.5, 2.0]);
        assert_eq!(d.values(), &[2.0, 1.0]);
    }

    #[test]
    fn test_boxcar_lowpass() {
        let s = series("x", &[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0), (3.0, 7.0)]);
        // window floor(1 / 0.5) = 2
        let f = s.lowpass(0.5);
        assert_eq!(f.values(), &[1.0, 2.0, 4.0, 6.0]);
        assert_eq!(f.times(), s.times());
    }

    #[test]
    fn test_exponential_lowpass() {
        let s = series("x", &[(0.0, 2.0), (1.0, 4.0), (2.0, 4.0)]);
        let f = s.exp_lowpass(0.5);
        assert_eq!(f.values(), &[2.0, 3.0, 3.5]);
    }

    #[test]
    fn test_statistics() {
        let s = series("x", &[(0.0, 3.0), (1.0, -4.0)]);
        assert!((s.rms() - (12.5f64).sqrt()).abs() < 1e-12);
        assert_eq!(s.average_abs(), 3.5);
        let flat = series("y", &[(0.0, 2.0), (1.0, 2.0), (2.0, 2.0)]);
        assert_eq!(flat.smoothness(LowpassKind::Exponential, 0.1), 0.0);
        assert_eq!(flat.smoothness(LowpassKind::BoxCar, 0.1), 0.0);
        assert!(series("e", &[]).rms().is_nan());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("xs-vs-t.csv"),
            "t,xs\n1000000,5\n1500000,6\n1500000,7\n2000000,8\n",
        )
        .unwrap();
        fs::write(dir.path().join("P-vs-t.txt"), "1000000 100\n3000000 300\n").unwrap();
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let data = Dataset::load_dir(dir.path()).unwrap();
        assert_eq!(data.names().collect::<Vec<_>>(), vec!["P", "xs"]);
        let xs = data.get("xs").unwrap();
        assert_eq!(xs.times(), &[0.0, 0.5, 1.0]);
        assert_eq!(xs.values(), &[5.0, 6.0, 8.0]);
        assert_eq!(data.get("P").unwrap().times(), &[0.0, 2.0]);
        assert!(matches!(data.get("xe"), Err(Error::MissingSeries(_))));
    }

    #[test]
    fn test_load_rejects_garbage_rows() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("xs-vs-t.csv"), "0,1\nbroken\n").unwrap();
        assert!(matches!(
            Dataset::load_dir(dir.path()),
            Err(Error::InvalidData { .. })
        ));
    }
}
