// Error taxonomy for model construction, filtering and analysis

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Differentiation hit a base/exponent combination outside the supported subset
    #[error("unsupported derivative of {expr} with respect to {variable}")]
    UnsupportedDerivative { expr: String, variable: String },

    /// A sample did not carry every control/observation/time-step value
    #[error("missing data for {missing:?}")]
    MissingData { missing: Vec<String> },

    #[error("series {name} has {actual} rows, expected {expected}")]
    SeriesLengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("series {name} row {row} has time {actual}, expected {expected}")]
    SeriesTimestampMismatch {
        name: String,
        row: usize,
        expected: f64,
        actual: f64,
    },

    /// Innovation covariance could not be inverted
    #[error("filter diverged: {reason}")]
    FilterDivergence { reason: String },

    #[error("unknown variable {0}")]
    UnknownVariable(String),

    #[error("unknown parameter {0}")]
    UnknownParameter(String),

    #[error("variable {0} is declared twice")]
    DuplicateVariable(String),

    #[error("{0} is not a state variable of this model")]
    NotAStateVariable(String),

    #[error("{0} is not an observation variable of this model")]
    NotAnObservationVariable(String),

    /// An expression refers to a variable the generated function cannot see
    #[error("variable {variable} is not available in {function}")]
    UnboundVariable { variable: String, function: String },

    #[error("dataset has no series named {0}")]
    MissingSeries(String),

    #[error("unknown model {0}")]
    UnknownModel(String),

    #[error("invalid data in {path}: {reason}")]
    InvalidData { path: PathBuf, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json {
            context: context.into(),
            source,
        }
    }

    /// True for errors that only invalidate the current dataset
    pub fn is_divergence(&self) -> bool {
        matches!(self, Error::FilterDivergence { .. })
    }
}
