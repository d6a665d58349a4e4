//! Herald -- S3 gateway with S3/Swift backends and replica mirroring.
//!
//! Startup restores the mirror queues from the last task store snapshot
//! before the listener opens. SIGTERM/SIGINT stop the listener; open
//! connections drain while the final snapshot is taken, both within the
//! shutdown timeout, and then the dispatchers are stopped.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use herald::backends::Backends;
use herald::buckets::BucketStore;
use herald::config::Config;
use herald::forward::Forwarder;
use herald::replication::{
    FileSnapshotStore, Replicator, S3SnapshotStore, SnapshotStore, TaskStore,
};
use tracing::{error, info};

/// Command-line arguments for the Herald gateway.
#[derive(Parser, Debug)]
#[command(
    name = "herald",
    version,
    about = "S3 gateway with S3/Swift backends and replica mirroring"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "herald.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = herald::config::load_config(&cli.config)?;
    init_tracing(&config);
    info!("Configuration loaded from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        herald::metrics::init_metrics();
        herald::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let forwarder = Forwarder::new(Duration::from_secs(config.server.backend_timeout))?;
    let backends = Backends::new(forwarder.clone());
    let buckets = BucketStore::from_config(&config);
    info!("{} bucket(s) configured", buckets.len());

    let snapshots = snapshot_store(&config, forwarder)?;
    let queues: Vec<String> = buckets
        .iter()
        .filter(|b| b.has_replicas())
        .map(|b| b.name.clone())
        .collect();
    let tasks = Arc::new(
        TaskStore::open(
            snapshots,
            queues.clone(),
            config.replication.queue_capacity,
        )
        .await?,
    );
    tasks.start_background_sync(Duration::from_secs(config.replication.sync_interval));

    let replicator = Arc::new(Replicator::new(
        Arc::clone(&tasks),
        backends.clone(),
        &config.replication,
    ));
    let dispatchers = replicator.start(queues);

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(herald::AppState {
        config: Arc::new(config),
        buckets: Arc::new(buckets),
        backends,
        tasks: Arc::clone(&tasks),
    });
    let app = herald::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Herald listening on {}", bind_addr);

    let served = herald::server::serve_until(
        listener,
        app,
        shutdown_signal(),
        Arc::clone(&tasks),
        shutdown_timeout,
    )
    .await;
    for dispatcher in dispatchers {
        dispatcher.abort();
    }
    served?;

    info!("Herald shut down");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Remote S3 snapshots when configured, a local directory otherwise.
fn snapshot_store(
    config: &Config,
    forwarder: Forwarder,
) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    let store = &config.task_store;
    Ok(match &store.remote {
        Some(remote) => {
            info!(
                "Task store snapshots in bucket '{}' at {}",
                store.bucket, remote.endpoint
            );
            Arc::new(S3SnapshotStore::new(forwarder, remote.clone(), &store.bucket))
        }
        None => {
            info!("Task store snapshots in {}", store.local_dir);
            Arc::new(FileSnapshotStore::new(&store.local_dir)?)
        }
    })
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
