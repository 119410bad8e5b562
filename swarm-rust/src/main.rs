mod config;
mod launcher;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use config::Experiment;

#[derive(Parser)]
#[command(
    name = "murmur-swarm",
    version,
    about = "In-process murmur experiment runner: spawns a swarm of agents and reports per-round metrics"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an experiment file
    Run {
        /// Path to the JSON experiment file
        #[arg(env = "MURMUR_EXPERIMENT")]
        experiment: PathBuf,
    },
    /// Write a starter experiment file
    Template {
        /// Where to write it
        #[arg(default_value = "experiment.json")]
        path: PathBuf,
    },
    /// Print the murmur-swarm version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().command {
        Command::Run { experiment } => run(&experiment).await,
        Command::Template { path } => template(&path),
        Command::Version => {
            println!("murmur-swarm {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run(path: &PathBuf) -> Result<()> {
    let is_json = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !is_json {
        bail!("only .json experiment files are supported, got {}", path.display());
    }
    let experiment = Experiment::load(path)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let outcome = launcher::run_experiment(&experiment, shutdown_rx).await?;

    if let Some(csv_path) = &experiment.metrics_csv {
        std::fs::write(csv_path, outcome.csv)
            .with_context(|| format!("cannot write metrics to {}", csv_path.display()))?;
        tracing::info!(path = %csv_path.display(), "Metrics written");
    }

    let agents = outcome.summaries.len();
    let mean_loss = outcome
        .summaries
        .iter()
        .map(|(_, summary)| summary.evaluation.loss)
        .sum::<f32>()
        / agents as f32;
    let mean_accuracy = outcome
        .summaries
        .iter()
        .map(|(_, summary)| summary.evaluation.accuracy)
        .sum::<f32>()
        / agents as f32;
    tracing::info!(agents, mean_loss, mean_accuracy, "Experiment finished");
    Ok(())
}

fn template(path: &PathBuf) -> Result<()> {
    if path.exists() {
        bail!("file {} already exists", path.display());
    }
    let starter = Experiment {
        metrics_csv: Some(PathBuf::from("metrics.csv")),
        ..Experiment::default()
    };
    let body = serde_json::to_string_pretty(&starter)?;
    std::fs::write(path, body + "\n")
        .with_context(|| format!("cannot write template to {}", path.display()))?;
    println!("Template written to {}", path.display());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
