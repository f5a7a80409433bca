//! asset-cache: persistent binary asset cache with an HTTP front.
//!
//! Fetches assets by URL, keeps them in a quota-bounded on-disk store, and
//! serves them back (stale if upstream is down).

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use asset_cache::cache::orchestrator::AssetCache;
use asset_cache::cache::sweeper;
use asset_cache::config::{Cli, Config};
use asset_cache::fetch::http::HttpFetcher;
use asset_cache::server::{build_router, AppState};
use asset_cache::store::open_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "asset_cache=debug,tower_http=debug"
    } else {
        "asset_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("asset-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        backend = ?config.store.backend,
        root = %config.store.root.display(),
        max_bytes = config.quota.max_bytes,
        max_entries = config.quota.max_entries,
        max_age_secs = ?config.staleness.max_age_secs,
        version_check = config.staleness.version_check,
        "Configuration loaded"
    );

    // Open the store and build the cache.
    let store = open_store(&config).await?;
    let cache = Arc::new(AssetCache::from_config(store, &config)?);

    // Bring a reopened store back within quota before serving.
    let report = cache.enforce_quota().await?;
    info!(
        entries = report.remaining_entries,
        bytes = report.remaining_bytes,
        evicted = report.evicted.len(),
        "Store ready"
    );

    let sweeper = config.sweeper.enabled.then(|| {
        sweeper::spawn(
            Arc::clone(&cache),
            Duration::from_secs(config.sweeper.interval_secs.max(1)),
        )
    });

    let fetcher = HttpFetcher::new(&config.fetch)?;

    // Build application state.
    let state = Arc::new(AppState {
        cache,
        fetcher: Arc::new(fetcher),
        config: config.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = &config.server.listen;
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }
    info!("Shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
