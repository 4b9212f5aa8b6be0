use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use worldhub::config::Config;
use worldhub::directory::Directory;
use worldhub::engine::{ContainerEngine, DockerEngine, WORKSPACE_PORT};
use worldhub::lifecycle::{LifecycleConfig, LifecycleManager, TeardownScope};
use worldhub::monitor::ActivityMonitor;
use worldhub::ports::PortAllocator;
use worldhub::proxy::GatewayServer;
use worldhub::registry::Registry;
use worldhub::session::Sessions;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("worldhub=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration from the environment
    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Connect to the container engine
    let engine = DockerEngine::connect(None, config.stop_grace()).await?;
    let engine: Arc<dyn ContainerEngine> = Arc::new(engine);

    let registry = Arc::new(Registry::new());

    let ports = Arc::new(PortAllocator::new(config.port_range));
    // Keep the gateway's own listener and the workspace-internal port
    // out of the allocatable pool.
    ports.reserve(config.port);
    ports.reserve(WORKSPACE_PORT);

    let directory = Directory::new(&config.directory_path);

    let lifecycle = LifecycleManager::new(
        engine,
        Arc::clone(&registry),
        Arc::clone(&ports),
        directory,
        LifecycleConfig {
            image: config.image(),
            volume: config.volume.clone(),
            ready_timeout: config.ready_timeout(),
            ready_interval: config.ready_interval(),
        },
    );

    // Rebuild the registry from the engine's state: the registry is
    // in-memory only, so a restart must re-adopt running workspaces.
    if let Err(e) = lifecycle.reconcile().await {
        warn!(error = %e, "Startup reconciliation failed, continuing with empty registry");
    } else {
        info!(workspaces = registry.len(), "Startup reconciliation complete");
    }

    let sessions = Arc::new(Sessions::new(config.cookie_secret.clone()));

    // Spawn the gateway server
    let bind_addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.bind, port = config.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(
        bind_addr,
        Arc::clone(&lifecycle),
        sessions,
        shutdown_rx.clone(),
    );
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Spawn the activity monitor
    let monitor = ActivityMonitor::new(
        Arc::clone(&lifecycle),
        config.idle_timeout(),
        config.sweep_interval(),
        shutdown_rx.clone(),
    );
    tokio::spawn(monitor.run());

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown: the server and monitor stop accepting work
    let _ = shutdown_tx.send(true);

    // Drain every workspace before exiting
    info!("Tearing down all workspaces...");
    lifecycle.teardown(TeardownScope::All).await;

    // Wait for the server task to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting workspace gateway");
    info!(
        bind = %config.bind,
        port = config.port,
        image = %config.image(),
        volume = %config.volume,
        directory = %config.directory_path.display(),
        "Gateway configuration"
    );
    info!(
        idle_timeout_secs = config.idle_timeout_secs,
        sweep_interval_secs = config.sweep_interval_secs,
        port_range_low = config.port_range.0,
        port_range_high = config.port_range.1,
        ready_timeout_secs = config.ready_timeout_secs,
        "Workspace lifecycle settings"
    );
}
