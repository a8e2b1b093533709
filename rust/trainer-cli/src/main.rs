//! Trainer checkpoint tool
//!
//! Inspects, lists and upgrades checkpoints written by `trainer-core`.
//!
//! # Usage
//!
//! ```bash
//! # Summarize a checkpoint
//! trainer-ckpt inspect runs/resnet/epoch=12.ckpt
//!
//! # List preemption snapshots, newest last
//! trainer-ckpt snapshots runs/resnet/hpc
//!
//! # Migrate a checkpoint saved with the legacy callback keys
//! trainer-ckpt upgrade runs/resnet/epoch=12.ckpt --monitor val_loss
//!
//! # Use the settings of a training run
//! trainer-ckpt --config trainer.toml snapshots hpc
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trainer_core::{CheckpointManager, TrainerConfig};

/// Trainer checkpoint tool
#[derive(Parser, Debug)]
#[command(name = "trainer-ckpt")]
#[command(about = "Inspect, list and upgrade training checkpoints")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a summary of a checkpoint file
    Inspect { file: PathBuf },

    /// List preemption snapshots in a directory
    Snapshots {
        /// Defaults to the configured weights_save_path
        dir: Option<PathBuf>,
    },

    /// Rewrite a checkpoint that uses the legacy callback keys
    Upgrade {
        file: PathBuf,

        /// Metric watched by the early stopping monitor resuming from it
        #[arg(long)]
        monitor: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => TrainerConfig::from_file(path)?,
        None => TrainerConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;

    let manager = CheckpointManager::from_config(&config)?;

    let output = match args.command {
        Command::Inspect { file } => commands::inspect(&manager, &file)?,
        Command::Snapshots { dir } => {
            let dir = dir.unwrap_or_else(|| manager.weights_save_path().to_path_buf());
            commands::snapshots(&manager, &dir)?
        }
        Command::Upgrade { file, monitor } => {
            let monitor = monitor.unwrap_or_else(|| config.early_stopping.monitor.clone());
            commands::upgrade(&manager, &file, &monitor)?
        }
    };
    print!("{output}");

    Ok(())
}
