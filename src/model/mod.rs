// State-space model definition

pub mod metrics;
pub mod state_space;
pub mod variable;

pub use metrics::{ErrorMetric, LowpassKind, Metrics, NegativityMetric, Normalization, SmoothnessMetric};
pub use state_space::KalmanModel;
pub use variable::{Param, ProcessVariable, VariableTable};
