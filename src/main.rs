use anyhow::Context;
use clap::Parser;
use meter_emulator::{create_backend, create_frontend, AppConfig, Poller, SnapshotStore};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Snapshots older than this many poll intervals are reported as stale.
const STALE_AFTER_INTERVALS: u32 = 3;
const MIN_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "meter_emulator",
    version,
    about = "Emulates a Shelly Pro 3EM from Enphase Envoy readings"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "METER_EMULATOR_CONFIG", default_value = "/app/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting meter emulator");

    // Every configuration problem surfaces here, before anything is bound
    let config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let phases = config.frontend.shelly.phases;
    let backend = create_backend(&config.backend, phases)?;
    let poll_interval = backend.poll_interval();
    let request_timeout = backend.request_timeout();
    let stale_after = (poll_interval * STALE_AFTER_INTERVALS).max(MIN_STALE_AFTER);
    let store = SnapshotStore::new(phases, stale_after);
    let mut frontend = create_frontend(&config.frontend, store.clone())?;
    info!(
        "Backend: {}, frontend: {} ({} phase(s)), stale after {:?}",
        backend.name(),
        frontend.name(),
        phases.count(),
        stale_after
    );

    let bind_address = config.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    let local_addr = listener.local_addr()?;
    info!("Serving on http://{local_addr}");
    frontend.start(local_addr.port());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = Poller::new(backend, store, poll_interval, request_timeout).spawn(shutdown_rx);

    let served = axum::serve(listener, frontend.router())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await;

    frontend.stop();
    if let Err(e) = poller.await {
        warn!("Poller task ended abnormally: {e}");
    }
    served.context("HTTP server failed")?;
    info!("Meter emulator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
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
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
