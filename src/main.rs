//! artifact-cache-tier: tiered artifact cache server.
//!
//! Serves extraction pipeline artifacts through a hierarchy of tiers:
//!   memory (hot) → local segment files (warm) → shared remote store (cold)
//!
//! Misses are loaded from an artifact directory behind a rate limiter,
//! a circuit breaker and bounded retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use artifact_cache_tier::cache::coordinator::CacheCoordinator;
use artifact_cache_tier::cache::distributed::SharedMemoryStore;
use artifact_cache_tier::cache::persistent::PersistentTier;
use artifact_cache_tier::clock::system_clock;
use artifact_cache_tier::config::{Cli, Config};
use artifact_cache_tier::metrics::{PrometheusMetrics, SharedMetrics};
use artifact_cache_tier::resilience::ResilientFetcher;
use artifact_cache_tier::server::http_api::{build_router, AppState};
use artifact_cache_tier::source::DirectorySource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "artifact_cache_tier=debug,tower_http=debug"
    } else {
        "artifact_cache_tier=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).with_target(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
    }

    info!("artifact-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        source = %config.source.id,
        root = %config.source.root.display(),
        memory = ?config.memory.capacity,
        shards = config.memory.shards,
        disk = config.disk.enabled,
        remote = config.remote.enabled,
        "Configuration loaded"
    );

    let clock = system_clock();
    let prometheus = Arc::new(PrometheusMetrics::new().context("registering metrics")?);
    let metrics: SharedMetrics = prometheus.clone();

    // Upstream source behind the resilience layer.
    let source = Arc::new(DirectorySource::new(config.source.id.clone(), config.source.root.clone()));
    let fetcher = Arc::new(ResilientFetcher::new(source, &config, metrics.clone()));

    let mut builder = CacheCoordinator::builder(config.clone())
        .fetcher(fetcher)
        .metrics(metrics.clone())
        .clock(clock.clone());

    // L2: local segment files.
    let disk = if config.disk.enabled {
        let tier = PersistentTier::open(config.disk.clone(), config.compression.clone(), clock.clone())
            .with_context(|| format!("opening disk tier at {}", config.disk.path.display()))?;
        let _compactor = tier.spawn_compactor(Duration::from_millis(config.disk.compaction_interval_ms));
        info!(dir = %tier.dir().display(), keys = tier.stats().key_count, "Disk tier ready");
        builder = builder.disk(Arc::new(tier.clone()));
        Some(tier)
    } else {
        None
    };

    // L3: the shared store stands in for a remote deployment.
    if config.remote.enabled {
        builder = builder.remote(Arc::new(SharedMemoryStore::new(config.remote.max_bytes, clock.clone())));
        info!(max_bytes = config.remote.max_bytes, "Remote tier ready");
    }

    let cache = builder.build()?;

    // Build application state.
    let state = Arc::new(AppState {
        cache: cache.clone(),
        metrics: prometheus,
        disk,
        request_timeout: Duration::from_millis(config.server.request_timeout_ms),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    // Drain background tier writes before exiting.
    cache.flush().await;
    info!("Background writes flushed");

    Ok(())
}
