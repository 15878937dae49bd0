//! sentinel-failover binary entry point.

use clap::Parser;
use sentinel_failover::{telemetry, Config, FailoverController};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Points a Kubernetes Service at the Redis master reported by Sentinel.
#[derive(Parser, Debug)]
#[command(name = "sentinel-failover")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Optional; environment variables
    /// prefixed with SENTINEL_FAILOVER override it.
    #[arg(short, long, default_value = "sentinel-failover.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("SENTINEL_FAILOVER")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    let _telemetry =
        telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(config_file = %args.config.display(), "Starting sentinel-failover");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let controller = FailoverController::new(config.failover);
    if let Err(e) = controller.run(shutdown).await {
        error!("Controller error: {}", e);
        return Err(e.into());
    }

    info!("sentinel-failover shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
