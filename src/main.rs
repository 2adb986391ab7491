use poolgate::config::Config;
use poolgate::launcher::{ProcessLauncher, WorkerLauncher};
use poolgate::registry::PoolRegistry;
use poolgate::router::GatewayServer;
use poolgate::sweeper::Sweeper;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("poolgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Build the pool
    let launcher = ProcessLauncher::new(config.defaults.clone());
    let registry = PoolRegistry::new(config.classes.clone(), config.defaults.clone(), launcher);

    // Spawn the sweeper (if enabled, no timer otherwise)
    let sweeper_handle = if config.cleanup.enabled {
        let sweeper = Sweeper::new(
            Arc::clone(&registry),
            config.cleanup.interval(),
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(sweeper.run()))
    } else {
        info!("Sweeper disabled in configuration");
        None
    };

    // Spawn the gateway listener
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(bind_addr, Arc::clone(&registry), shutdown_rx.clone());
    let mut server_handle = tokio::spawn(async move { server.run().await });

    // Run until a termination signal or a fatal server error
    let outcome = wait_for_shutdown(&mut server_handle).await;

    // A fatal outcome means the server task already finished
    let server_handle = match outcome {
        Outcome::Fatal(_) => None,
        Outcome::Signal => Some(server_handle),
    };

    shutdown(&shutdown_tx, &registry, server_handle, sweeper_handle).await;

    match outcome {
        Outcome::Signal => {
            info!("Shutdown complete");
            Ok(())
        }
        Outcome::Fatal(e) => {
            error!(error = %e, "Fatal condition, exiting");
            Err(e)
        }
    }
}

enum Outcome {
    Signal,
    Fatal(anyhow::Error),
}

async fn wait_for_shutdown(server_handle: &mut JoinHandle<anyhow::Result<()>>) -> Outcome {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                Outcome::Signal
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                Outcome::Signal
            }
            result = server_handle => Outcome::Fatal(server_exit_error(result)),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                Outcome::Signal
            }
            result = server_handle => Outcome::Fatal(server_exit_error(result)),
        }
    }
}

fn server_exit_error(result: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow::anyhow!("gateway server exited unexpectedly"),
        Ok(Err(e)) => e,
        Err(e) => anyhow::anyhow!("gateway server task panicked: {}", e),
    }
}

/// Single shutdown coordinator: signal all tasks, tear down the worker pool,
/// then bound the wait for the listener and the sweeper.
async fn shutdown<L: WorkerLauncher>(
    shutdown_tx: &watch::Sender<bool>,
    registry: &Arc<PoolRegistry<L>>,
    server_handle: Option<JoinHandle<anyhow::Result<()>>>,
    sweeper_handle: Option<JoinHandle<()>>,
) {
    let _ = shutdown_tx.send(true);

    info!("Tearing down worker pool...");
    registry.teardown_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = server_handle {
            let _ = handle.await;
        }
        if let Some(handle) = sweeper_handle {
            let _ = handle.await;
        }
    })
    .await;
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        cleanup_enabled = config.cleanup.enabled,
        cleanup_interval_secs = config.cleanup.interval_secs,
        "Sweeper settings"
    );
    for (class, cfg) in &config.classes {
        info!(
            class,
            enabled = cfg.enabled,
            base_port = cfg.base_port,
            ttl_secs = cfg.ttl(&config.defaults).as_secs(),
            "Worker class configured; created on demand at /{}-<index>",
            class
        );
    }
}
