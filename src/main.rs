use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use mlearn::config::Library;
use mlearn::{run_mtl_model, run_singletask_model, Config};
use tracing::info;

#[derive(Parser)]
#[command(name = "mlearn")]
#[command(about = "Train and evaluate text classification models", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "MLEARN_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model and record per-epoch scores
    Train {
        /// Run configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Score a stored model on the test split
    Evaluate {
        /// Run configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    mlearn::logging::init_logging(cli.verbose, cli.quiet, cli.json)?;

    match cli.command {
        Commands::Train { config } => run(config, true)?,
        Commands::Evaluate { config } => run(config, false)?,
        Commands::Validate { file } => validate_config(file)?,
        Commands::Info => show_system_info(),
    }

    Ok(())
}

#[cfg(feature = "cuda")]
fn select_device() -> Result<Device> {
    Device::new_cuda(0).context("Failed to open CUDA device")
}

#[cfg(all(feature = "metal", not(feature = "cuda")))]
fn select_device() -> Result<Device> {
    Device::new_metal(0).context("Failed to open Metal device")
}

#[cfg(not(any(feature = "cuda", feature = "metal")))]
fn select_device() -> Result<Device> {
    Ok(Device::Cpu)
}

fn run(config_path: PathBuf, train: bool) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration file {}", config_path.display()))?;
    let device = select_device()?;
    info!(
        "{} '{}' with a {} model",
        if train { "Training on" } else { "Evaluating on" },
        config.data.name,
        config.library
    );

    let history = if config.multitask.is_some() {
        run_mtl_model(&config, train, &device).context("Multi-task run failed")?
    } else {
        run_singletask_model(&config, train, &device).context("Run failed")?
    };

    info!(
        "Finished after {} epoch(s){}",
        history.epochs_run,
        if history.stopped_early { ", stopped early" } else { "" }
    );
    info!("Results written to {}", config.output.results.display());
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = Config::from_file(&config_path).context("Failed to load configuration file")?;

    info!("Configuration is valid");
    info!("  - Dataset: {}", config.data.name);
    info!("  - Model: {} ({} features)", config.library, config.vectorizer);
    match config.library {
        Library::Neural => {
            info!("  - Hidden dim: {}", config.model.hidden_dim);
            info!("  - Epochs: {}", config.training.epochs);
        }
        Library::Classical => info!("  - Params: {:?}", config.classical.params),
    }
    if let Some(multitask) = &config.multitask {
        info!("  - Auxiliary tasks: {}", multitask.aux_tasks.len());
    }
    info!("  - Metrics: {:?}", config.metrics.metrics);

    Ok(())
}

fn show_system_info() {
    println!("mlearn - text classification training");
    println!();
    println!("Version: {}", mlearn::VERSION);
    println!();
    println!("Models:");
    println!("  neural     MLP with one output head per task");
    println!("  classical  multinomial naive Bayes");
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA: enabled");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA: not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal: enabled");
    #[cfg(not(feature = "metal"))]
    println!("  Metal: not compiled");

    #[cfg(feature = "accelerate")]
    println!("  Accelerate: enabled");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate: not compiled");

    println!("  CPU: enabled");
    println!();
    println!("Usage:");
    println!("  mlearn train -c config.json");
    println!("  mlearn evaluate -c config.json");
    println!("  mlearn validate -f config.json");
    println!("  mlearn info");
}
