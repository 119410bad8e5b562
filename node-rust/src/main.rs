mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use murmur_protocol::{
    by_name, Agent, EuclideanDistance, HttpTransport, LinearModel, TracingObserver, Transport,
};

use config::NodeConfig;

#[derive(Parser)]
#[command(name = "murmur-node", about = "Murmur consensus node: one agent of a decentralized swarm")]
struct Cli {
    /// Path to the node configuration file (JSON)
    #[arg(long, default_value = "node.json", env = "MURMUR_CONFIG")]
    config: PathBuf,

    /// Listen address override, e.g. 0.0.0.0:7500
    #[arg(long, env = "MURMUR_LISTEN")]
    listen: Option<String>,

    /// Bearer token override for node-to-node auth
    #[arg(long, env = "MURMUR_TOKEN")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut node = NodeConfig::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        node.listen = listen;
    }
    if let Some(token) = cli.token {
        node.token = Some(token);
    }

    tracing::info!(
        address = %node.address,
        listen = %node.listen,
        peers = node.peers.len(),
        strategy = %node.strategy,
        "Starting murmur node"
    );

    let (transport, inbox) =
        HttpTransport::new(node.address.clone(), node.directory(), node.token.clone());
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let state = Arc::new(server::AppState {
        address: node.address.bare(),
        token: node.token.clone(),
        inbox,
        started_at: Utc::now(),
    });
    let app = server::create_router(state, node.max_message_size + 4096);

    let listener = tokio::net::TcpListener::bind(&node.listen).await?;
    tracing::info!("Listening on {}", node.listen);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut server_rx = shutdown_rx.clone();
    let http_server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_rx.changed().await;
            })
            .await
    });

    let strategy = by_name(&node.strategy, Some(node.seed))
        .ok_or_else(|| anyhow::anyhow!("unknown strategy '{}'", node.strategy))?;
    let model = LinearModel::new(node.seed, node.model_dim, node.train_samples, node.test_samples);
    let observer = Arc::new(TracingObserver::new(node.address.to_string()));

    let agent = Agent::new(
        node.agent_config(),
        transport,
        Box::new(model),
        strategy,
        Arc::new(EuclideanDistance),
        observer,
    )?;

    let summary = agent.run(shutdown_rx).await;
    tracing::info!(
        rounds = summary.rounds,
        loss = summary.evaluation.loss,
        accuracy = summary.evaluation.accuracy,
        "Node finished"
    );

    http_server.abort();
    let _ = http_server.await;
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
