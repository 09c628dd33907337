//! CLI entry point for the MEA pipeline.
//!
//! ```bash
//! mea_pipeline init            # scaffold an experiment directory
//! mea_pipeline start           # run the processing loop
//! ```
//!
//! `start` loads `experiment.yaml` and `electrode_coords.txt` from the
//! experiment directory, then polls for data until interrupted; Ctrl+C
//! finishes in-flight work and exits cleanly.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mea_pipeline::{ElectrodeLayout, ExperimentLayout, Scheduler, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "mea_pipeline")]
#[command(about = "Staged processing pipeline for MEA recordings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the processing loop over an experiment directory
    Start {
        /// Experiment directory (defaults to the working directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Scaffold a new experiment directory
    Init {
        /// Experiment directory (defaults to the working directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start { dir } => start(resolve_dir(dir)?).await,
        Commands::Init { dir } => init(resolve_dir(dir)?),
    }
}

fn resolve_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(d) => Ok(d),
        None => std::env::current_dir().context("cannot resolve working directory"),
    }
}

async fn start(root: PathBuf) -> Result<()> {
    let settings = Settings::load(&root)
        .with_context(|| format!("loading experiment config from {}", root.display()))?;
    mea_pipeline::logging::init(&settings.log_level)?;
    let electrodes = ElectrodeLayout::load(&root, settings.n_channels)
        .context("loading electrode coordinates")?;

    let layout = ExperimentLayout::new(&root);
    std::fs::create_dir_all(layout.raw_dir())?;
    std::fs::create_dir_all(layout.computed_dir())?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing in-flight work");
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler = Scheduler::new(Arc::new(settings), Arc::new(electrodes), &root, shutdown_rx);
    scheduler.run().await?;
    Ok(())
}

fn init(root: PathBuf) -> Result<()> {
    let layout = ExperimentLayout::new(&root);
    std::fs::create_dir_all(layout.acquisition_dir())?;
    std::fs::create_dir_all(layout.raw_dir())?;
    std::fs::create_dir_all(layout.computed_dir())?;

    let config_path = root.join(mea_pipeline::config::CONFIG_FILE);
    if config_path.exists() {
        println!("{} already exists, leaving it untouched", config_path.display());
    } else {
        let template = serde_yaml::to_string(&Settings::template())?;
        std::fs::write(&config_path, template)?;
        println!("wrote {}", config_path.display());
    }

    println!(
        "add {} ({} lines of `x y`) before starting",
        root.join(mea_pipeline::config::ELECTRODE_COORDS_FILE).display(),
        Settings::template().n_channels
    );
    println!("initialized experiment at {}", root.display());
    Ok(())
}
