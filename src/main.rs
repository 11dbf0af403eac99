//! coldtrack - Telemetry engine for cold-chain device fleets.
//!
//! # API Endpoints
//!
//! - `POST /telemetry` - Ingest a device reading
//! - `GET /devices` - Current state of all devices (`?status=` filter)
//! - `GET /devices/:id` - Current state of one device
//! - `DELETE /devices/:id` - Remove a device (`?purge=true` drops its history)
//! - `GET /devices/:id/history` - Persisted history
//! - `GET /devices/:id/chart` - Downsampled chart series
//! - `GET /devices/:id/report` - Statistics report
//! - `GET /devices/:id/track` - Movement track
//! - `GET /fleet/summary` - Live device counts by status
//! - `GET /map/clusters` - Map clusters
//! - `POST /sync` - Flush pending changes now
//! - `DELETE /history` - Retention purge
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use coldtrack::api::{AppState, router};
use coldtrack::config::Config;
use coldtrack::service::TelemetryService;
use coldtrack::storage::SqliteStore;

/// How long each background task gets to finish after shutdown is signalled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("coldtrack=info".parse()?))
        .init();

    // Load configuration from environment
    let config = Config::from_env();
    info!(port = config.port, db_url = %config.database_url, "Starting coldtrack server");

    // Initialize database
    let store = SqliteStore::new(&config.database_url).await?;
    info!("Database initialized");

    // Restore live state and start background tasks
    let service = Arc::new(TelemetryService::new(Arc::new(store), config.service.clone()));
    service.restore().await?;
    service.start().await;

    // Build router
    let app = router(AppState {
        service: service.clone(),
    });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "coldtrack is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, flushing pending history");
    service.shutdown(SHUTDOWN_TIMEOUT).await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
