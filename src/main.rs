// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod cache;
mod config;
mod detector;
mod executor;
mod graph;
mod market_data;
mod monitor;
mod router;
mod store;
mod venue;

use cache::{MarketCache, MemoryCache, RedisCache};
use config::Config;
use detector::Detector;
use executor::ExecutionCoordinator;
use market_data::MarketDataService;
use monitor::{ApprovalGate, Monitor};
use router::FundsRouter;
use store::Store;
use venue::VenueRegistry;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Load environment
    dotenv::dotenv().ok();

    let config = Config::load_or_default();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.monitoring.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("═══════════════════════════════════════════");
    info!("    CROSSARB  multi-exchange arbitrage engine");
    info!("═══════════════════════════════════════════");
    info!("Configuration loaded");
    info!("  Venues: {}", config.venue_names().join(", "));
    info!("  Pairs: {}", config.pairs.len());
    info!(
        "  Min profit margin: {:.2}%",
        config.strategy.min_profit_margin * 100.0
    );

    // Shared infrastructure
    let cache: Arc<dyn MarketCache> = match config.service.cache_backend.as_str() {
        "memory" => {
            warn!("using in-process cache; market data will not survive restarts");
            Arc::new(MemoryCache::new())
        }
        _ => Arc::new(RedisCache::connect(&config.service.redis_url).await?),
    };
    let store = Arc::new(Store::open(&config.service.database_path)?);
    let registry = Arc::new(VenueRegistry::new(config.venues.clone()));
    let monitor = Arc::new(Monitor::new(
        config.monitoring.telegram_bot_token.clone(),
        config.monitoring.telegram_chat_id.clone(),
    ));
    let gate = Arc::new(ApprovalGate::new());
    let config = Arc::new(config);

    // In-memory indexes
    let opportunities: detector::SharedOpportunities =
        Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let orders: executor::SharedOrders = Arc::new(parking_lot::Mutex::new(HashMap::new()));
    let transfers: router::SharedTransfers = Arc::new(parking_lot::Mutex::new(HashMap::new()));

    // Detected opportunities flow to the coordinator over this queue.
    let (exec_tx, exec_rx) = mpsc::channel::<i64>(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Market data fanout
    let market_data = Arc::new(MarketDataService::new(
        cache.clone(),
        registry.clone(),
        config.clone(),
    ));
    let mut tasks = market_data.start(shutdown_rx.clone());

    // Arbitrage scanner
    let scanner = Arc::new(Detector::new(
        cache.clone(),
        registry.clone(),
        store.clone(),
        monitor.clone(),
        config.clone(),
        opportunities.clone(),
        exec_tx.clone(),
    ));
    {
        let scanner = scanner.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            scanner.run(shutdown).await;
        }));
    }

    // Execution coordinator
    let coordinator = Arc::new(ExecutionCoordinator::new(
        cache.clone(),
        registry.clone(),
        store.clone(),
        monitor.clone(),
        gate.clone(),
        config.clone(),
        opportunities.clone(),
        orders.clone(),
    ));
    {
        let coordinator = coordinator.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            coordinator.run(exec_rx, shutdown).await;
        }));
    }

    // Funds router
    let funds_router = Arc::new(FundsRouter::new(
        cache.clone(),
        registry.clone(),
        store.clone(),
        monitor.clone(),
        config.clone(),
        transfers.clone(),
    ));

    // Periodic stats summary
    {
        let monitor = monitor.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => monitor.log_summary().await,
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    monitor.send_startup_message().await;

    // HTTP surface
    let app = api::router(Arc::new(api::AppState {
        registry: registry.clone(),
        store,
        gate,
        funds_router,
        health: market_data.health(),
        opportunities,
        orders,
        transfers,
        exec_tx,
    }));
    let bind = format!("{}:{}", config.service.bind_address, config.service.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("HTTP service listening on {bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop loops, then close adapter connections with a hard deadline.
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("task did not stop within the shutdown deadline");
        }
    }
    registry.close_all().await;
    monitor.log_summary().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        return;
    }
    info!("shutdown signal received");
}
