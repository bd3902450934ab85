use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subgate::api::{ApiServer, PKG_NAME, VERSION};
use subgate::config::Config;
use subgate::control;
use subgate::pool::{ConnectionPool, PoolConfig};
use subgate::proxy::ProxyServer;
use subgate::routes::RoutingTable;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("subgate=debug".parse().expect("valid log directive")),
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

    // The routing table is the single shared mutable resource
    let table = Arc::new(RoutingTable::with_ttl(
        config.listen.clone(),
        config.server.route_ttl(),
    ));

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    }));

    // Control channel: the API queues actions, the control loop applies them
    let (action_tx, action_rx) = mpsc::channel(64);
    let control_handle = tokio::spawn(control::run(
        Arc::clone(&table),
        action_rx,
        shutdown_rx.clone(),
    ));

    // One proxy server per configured listen port
    let mut proxy_handles = Vec::new();
    for pm in &config.listen {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, pm.listen)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port = pm.listen, error = %e, "Invalid bind address");
                anyhow::anyhow!("Invalid bind address: {}", e)
            })?;

        let proxy = ProxyServer::bind(
            addr,
            Arc::clone(&table),
            Arc::clone(&pool),
            shutdown_rx.clone(),
        )
        .await?;

        proxy_handles.push(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "Proxy server error");
            }
        }));
    }

    // Internal API server (control actions + introspection)
    let api_addr: SocketAddr = format!("127.0.0.1:{}", config.server.api_port)
        .parse()
        .map_err(|e| {
            error!(api_port = config.server.api_port, error = %e, "Invalid API bind address");
            anyhow::anyhow!("Invalid API bind address: {}", e)
        })?;

    // Generate or use configured API token
    let api_token = config.server.api_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure api_token to set a fixed value)");
        token
    });

    let api_server = ApiServer::bind(
        api_addr,
        Arc::clone(&table),
        action_tx,
        shutdown_rx.clone(),
        api_token,
    )
    .await?;

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in proxy_handles {
            let _ = handle.await;
        }
        let _ = api_handle.await;
        let _ = control_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        api_port = config.server.api_port,
        route_ttl_secs = config.server.route_ttl_secs,
        "Server configuration"
    );
    for pm in &config.listen {
        info!(listen_port = pm.listen, target_port = pm.target, "Port map");
    }
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
}
