//! ProxyNest - Entry Point
//!
//! Starts the lease API server and the background verification services
//! with graceful shutdown support.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod database;
mod error;
mod lease;
mod models;
mod probe;
mod services;
mod store;

use api::{ApiServer, AppState};
use config::Config;
use database::Database;
use lease::{ExpiryReaper, ReservationManager};
use probe::{ConnectProbe, HttpGeoResolver};
use services::{BackgroundScheduler, GeoClassifier, HealthChecker};
use store::{PgProxyStore, ProxyStore};

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxynest=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ProxyNest");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    // Connect to database and run migrations
    let db = Database::new(&config).await?;
    db.run_migrations().await?;

    let store: Arc<dyn ProxyStore> = Arc::new(PgProxyStore::new(db.pool().clone()));

    // Lease engine
    let manager = Arc::new(ReservationManager::new(
        store.clone(),
        config.reservation_config(),
    ));

    // Background services share one probe-concurrency limiter
    let mut scheduler = BackgroundScheduler::new(config.scheduler_config());
    let limiter = scheduler.probe_limiter();

    let probe_timeout = Duration::from_secs(config.background.probe_timeout);
    let probe = Arc::new(ConnectProbe::new(
        config.background.probe_target.host.clone(),
        config.background.probe_target.port,
        probe_timeout,
    ));
    let resolver = Arc::new(HttpGeoResolver::new(
        config.background.geo_lookup.host.clone(),
        config.background.geo_lookup.port,
        config.background.geo_lookup.path.clone(),
        probe_timeout,
    ));

    let reaper = ExpiryReaper::new(store.clone(), config.reaper_config());
    let reap_interval = Duration::from_secs(config.background.reap_interval);
    scheduler.spawn("expiry-reaper", reap_interval, move |shutdown| async move {
        reaper.run(shutdown).await;
    });

    let health_checker = HealthChecker::new(
        store.clone(),
        probe,
        limiter.clone(),
        config.health_config(),
    );
    let health_interval = Duration::from_secs(config.background.health_interval);
    scheduler.spawn("health-checker", health_interval, move |shutdown| async move {
        health_checker.run(shutdown).await;
    });

    let geo_classifier = GeoClassifier::new(store.clone(), resolver, limiter, config.geo_config());
    let geo_interval = Duration::from_secs(config.background.geo_interval);
    scheduler.spawn("geo-classifier", geo_interval, move |shutdown| async move {
        geo_classifier.run(shutdown).await;
    });

    // API server
    let api_server = ApiServer::new(config.api.clone(), AppState::new(store, manager));
    let api_shutdown = scheduler.shutdown_receiver();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!("API server starting on {}", config.api_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    scheduler.shutdown().await;
    let _ = api_task.await;
    db.close().await;

    info!("ProxyNest stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("Failed to install signal handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
