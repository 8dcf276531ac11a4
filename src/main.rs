// Extrusion Kalman - Main Entry Point
// Licensed under AGPL v3

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;
use extrusion_kalman::analysis::{analyze_batch, discover_data_dirs, AnalysisOptions};
use extrusion_kalman::codegen::render_model;
use extrusion_kalman::config::{
    Command, Config, GenerateArgs, ModelArgs, OptimizeArgs, RunArgs, TrackParamsArgs,
};
use extrusion_kalman::model::KalmanModel;
use extrusion_kalman::models::build_model;
use extrusion_kalman::optimizer::{optimize, OptimizerConfig};
use extrusion_kalman::output::write_text;
use extrusion_kalman::summary::{generate_json_spec, override_params, track_params, OverrideFile, TrackOptions};
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    let batch = matches!(config.command, Command::Run(_) | Command::Optimize(_));
    let log_file = if batch && !config.disable_logging {
        let name = format!("log-{}", chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"));
        eprintln!("Logging to {}...", name);
        Some(PathBuf::from(name))
    } else {
        None
    };
    init_logging(config.verbose, log_file.as_deref())?;

    match &config.command {
        Command::Run(args) => run(args),
        Command::Optimize(args) => run_optimizer(args),
        Command::Generate(args) => generate(args),
        Command::TrackParams(args) => track(args),
    }
}

fn load_model(args: &ModelArgs) -> Result<KalmanModel, Box<dyn std::error::Error>> {
    let mut model = build_model(&args.model)?;
    info!("Opening model {}", model.name());
    if let Some(path) = &args.override_params {
        let applied = override_params(&mut model, &OverrideFile::load(path)?)?;
        info!("Applied {} parameter overrides from {}", applied, path.display());
    }
    Ok(model)
}

fn data_dirs(args: &RunArgs) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    if args.batch {
        let dirs = discover_data_dirs(&args.data_dir, &args.data_dir_root, args.data_dir_recurse)?;
        info!("Preparing to process:");
        for dir in &dirs {
            info!(" - {}", dir.display());
        }
        Ok(dirs)
    } else {
        let dir = PathBuf::from(&args.data_dir);
        if !dir.is_dir() {
            return Err(format!("Data directory \"{}\" does not exist", args.data_dir).into());
        }
        Ok(vec![dir])
    }
}

fn analysis_options(args: &RunArgs, complete_summary: bool) -> AnalysisOptions {
    AnalysisOptions {
        filter: args.filter_type,
        deltat_catchup: Some(args.deltat_catchup),
        complete_summary,
    }
}

fn run(args: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = load_model(&args.model)?;
    let dirs = data_dirs(args)?;
    let options = analysis_options(args, true);
    match analyze_batch(&dirs, &model, &options, &["run".to_string()])? {
        Some(cost) => {
            info!("Cost: {}", cost);
            Ok(())
        }
        None => Err("batch produced no cost".into()),
    }
}

fn run_optimizer(args: &OptimizeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut model = load_model(&args.run.model)?;
    let dirs = data_dirs(&args.run)?;
    let options = analysis_options(&args.run, false);
    let config = OptimizerConfig {
        rounds: args.rounds,
        step_size: args.step_size,
    };

    let report = optimize(&mut model, &config, |candidate, subdirs| {
        analyze_batch(&dirs, candidate, &options, subdirs)
    })?;
    info!(
        "Finished after {} rounds, {} changes applied, best cost {:?}",
        report.rounds,
        report.applied.len(),
        report.best_cost
    );
    info!("Final parameters: {}", serde_json::to_string(&generate_json_spec(&model))?);
    Ok(())
}

// "velocity" -> "Velocity"
fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn generate(args: &GenerateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = load_model(&args.model)?;
    let dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(capitalize(model.name())));
    let path = dir.join(format!("{}.{}", model.name(), args.language.file_extension()));
    write_text(&path, &render_model(&model, args.language))?;
    info!("Wrote {}", path.display());
    Ok(())
}

fn track(args: &TrackParamsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let options = TrackOptions {
        model_dir_regex: args.model_dir_regex.clone(),
        model_file_regex: args.model_file_regex.clone(),
        vars: args.vars.clone(),
        params: args.params.clone(),
    };
    let written = track_params(&args.model_dir_root, &options)?;
    if written.is_empty() {
        warn!("No parameter data found under {}", args.model_dir_root.display());
    }
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_max_level(level);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            subscriber.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => subscriber.init(),
    }
    if verbose {
        info!("Verbose logging enabled (DEBUG level)");
    }
    Ok(())
}
