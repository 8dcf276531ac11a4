// Shared constants for filtering, analysis and optimization

/// Low-pass coefficient of a smoothness metric when none is given
pub const DEFAULT_SMOOTHNESS_COEFFICIENT: f64 = 0.005;

/// UKF spread parameter when the model does not register `alpha`
pub const DEFAULT_UKF_ALPHA: f64 = 1.0;

/// UKF prior-distribution parameter when the model does not register `beta`
pub const DEFAULT_UKF_BETA: f64 = 2.0;

/// UKF secondary scaling when the model does not register `kappa`
pub const DEFAULT_UKF_KAPPA: f64 = 3.0;

/// Iteration cap of the nearest positive-definite repair before the
/// diagonal fallback takes over
pub const NEAREST_PD_MAX_ITERATIONS: usize = 100;

/// Box-car coefficient used to smooth `xs` before differentiating it
pub const DXSDT_LOWPASS_COEFFICIENT: f64 = 0.1;

/// Catch-up time (seconds) of the extrapolation that scores a run
pub const DEFAULT_DELTAT_CATCHUP: f64 = 1.0;

/// Exponential coefficient of the reference derivative in the
/// extrapolation simulation
pub const EXTRAPOLATION_LOWPASS_COEFFICIENT: f64 = 0.2;

/// Optimizer rounds before giving up on convergence
pub const OPTIMIZER_ROUNDS: usize = 100;

/// Relative perturbation of the first optimizer round
pub const OPTIMIZER_STEP_SIZE: f64 = 0.2;

/// Rounds over which the step size decays by a factor of e
pub const OPTIMIZER_STEP_DECAY: f64 = 20.0;

/// Timestamps in the raw data files are microseconds
pub const MICROS_PER_SECOND: f64 = 1e6;

/// Summary file written per analysis run
pub const SUMMARY_FILE_NAME: &str = "summary.json";

/// Filter output table written per analysis run
pub const TABLE_FILE_NAME: &str = "kalman.csv";

/// Directory created under the model root by `track-params`
pub const PARAM_TRACKING_DIR: &str = "param_tracking";
