use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use market_cache_gateway::clock::system_clock;
use market_cache_gateway::config::{Cli, Config};
use market_cache_gateway::gateway::Gateway;
use market_cache_gateway::server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "market_cache_gateway=debug,tower_http=debug"
    } else {
        "market_cache_gateway=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("market-cache-gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration; a malformed tier table or endpoint list stops here.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        cache_backend = ?config.cache.backend,
        endpoints = config.database.endpoints.len(),
        priority_mode = ?config.database.priority_mode,
        subjects = config.rate_limit.subjects.len(),
        "Configuration loaded"
    );

    let gateway = Gateway::new(&config, system_clock()).await?;

    // Build application state.
    let state = Arc::new(AppState {
        gateway,
        config_path: cli.config.clone(),
        request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state.clone());

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    state.gateway.close().await;
    Ok(())
}
