use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::constants::{DEFAULT_DELTAT_CATCHUP, OPTIMIZER_ROUNDS, OPTIMIZER_STEP_SIZE};
use crate::kalman::FilterKind;
use crate::symbolic::Language;

/// Extrusion process state estimation and model calibration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Log to the terminal only instead of a log-<timestamp> file
    #[arg(long, global = true, default_value_t = false)]
    pub disable_logging: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the filter over one dataset or a batch and report the cost
    Run(RunArgs),
    /// Tune the model parameters to minimize the batch cost
    Optimize(OptimizeArgs),
    /// Write the generated filter source for a model
    Generate(GenerateArgs),
    /// Collect parameter values and costs from summary files
    TrackParams(TrackParamsArgs),
}

/// Model selection shared by every command that builds a model
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Model name (basic, velocity, degen, gel, empty_c1f1)
    #[arg(long)]
    pub model: String,

    /// JSON file overriding variable parameters
    #[arg(long, value_name = "FILE")]
    pub override_params: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Filter flavour
    #[arg(long, value_enum, default_value_t = FilterKind::Ekf)]
    pub filter_type: FilterKind,

    /// Treat --data-dir as a regex over directory names under --data-dir-root
    #[arg(long, default_value_t = false)]
    pub batch: bool,

    /// Dataset directory, or a directory name pattern with --batch
    #[arg(long)]
    pub data_dir: String,

    /// Where to look for batch directories
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub data_dir_root: PathBuf,

    /// Search below --data-dir-root recursively
    #[arg(long, default_value_t = false)]
    pub data_dir_recurse: bool,

    /// Score runs by the extrapolation error with this catch-up time (seconds)
    #[arg(long, default_value_t = DEFAULT_DELTAT_CATCHUP)]
    pub deltat_catchup: f64,
}

#[derive(Args, Debug, Clone)]
pub struct OptimizeArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Relative perturbation of the first round
    #[arg(long, default_value_t = OPTIMIZER_STEP_SIZE)]
    pub step_size: f64,

    /// Maximum number of rounds
    #[arg(long, default_value_t = OPTIMIZER_ROUNDS)]
    pub rounds: usize,
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Target language
    #[arg(long, value_enum, default_value_t = Language::Cpp)]
    pub language: Language,

    /// Output directory; defaults to the capitalized model name
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct TrackParamsArgs {
    /// Root of the tree holding run outputs
    #[arg(long, value_name = "DIR")]
    pub model_dir_root: PathBuf,

    /// Only read directories whose path matches this regex
    #[arg(long)]
    pub model_dir_regex: Option<String>,

    /// Summary file name regex
    #[arg(long, default_value = "summary.json")]
    pub model_file_regex: String,

    /// Variables to track, or "all"
    #[arg(long, num_args = 1.., default_value = "all")]
    pub vars: Vec<String>,

    /// Parameters to track, or "all"
    #[arg(long, num_args = 1.., default_value = "all")]
    pub params: Vec<String>,
}
