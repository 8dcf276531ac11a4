// Cost metric declarations attached to a model

use std::collections::BTreeMap;

use crate::constants::DEFAULT_SMOOTHNESS_COEFFICIENT;
use crate::symbolic::VarId;

/// Divisor applied to the RMS error of an error metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// Mean absolute value of the reference series
    #[default]
    AverageAbs,
    /// RMS of the reference series
    Rms,
}

/// Low-pass filter used to measure smoothness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LowpassKind {
    /// First-order exponential filter with the metric coefficient
    #[default]
    Exponential,
    /// Moving average over `floor(1 / coefficient)` samples
    BoxCar,
}

/// Compare an estimated variable against an input series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorMetric {
    pub reference: VarId,
    pub weight: f64,
    pub normalization: Normalization,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothnessMetric {
    pub weight: f64,
    pub filter_coef: f64,
    pub lowpass: LowpassKind,
}

impl SmoothnessMetric {
    pub fn new(weight: f64) -> Self {
        Self {
            weight,
            filter_coef: DEFAULT_SMOOTHNESS_COEFFICIENT,
            lowpass: LowpassKind::default(),
        }
    }
}

/// Penalize negative excursions of an estimated variable
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegativityMetric {
    pub weight: f64,
}

/// Every metric of a model, keyed by the estimated variable
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    pub error: BTreeMap<VarId, ErrorMetric>,
    pub smoothness: BTreeMap<VarId, SmoothnessMetric>,
    pub negativity: BTreeMap<VarId, NegativityMetric>,
}

impl Metrics {
    pub fn is_empty(&self) -> bool {
        self.error.is_empty() && self.smoothness.is_empty() && self.negativity.is_empty()
    }
}
