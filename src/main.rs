// =============================================================================
// FLEET SERVICE - Main Entry Point
// =============================================================================
// Fleet lifecycle coordinator over HTTP.
//
// WHAT THIS SERVICE DOES:
// - Dispatches, completes and cancels trips, keeping vehicle, driver and
//   expense records consistent in one transaction per event
// - Opens, starts and closes maintenance, holding vehicles in the shop
// - Manual service toggle, driver updates, completion-rate recompute
// - Vehicles, drivers, expenses and complaints records
// - Prometheus metrics and Redis lifecycle notifications
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod config;      // Configuration loading (config.rs)
mod coordinator; // Lifecycle commands (coordinator.rs)
mod db;          // Pool, migrations, listings (db.rs)
mod db_store;    // FleetStore for PostgreSQL (db_store.rs)
mod error;       // Error types (error.rs)
mod handlers;    // HTTP request handlers (handlers.rs)
mod lifecycle;   // State machine checks (lifecycle.rs)
mod metrics;     // Prometheus metrics setup (metrics.rs)
mod models;      // Data structures (models.rs)
mod notify;      // Lifecycle event publishing (notify.rs)
mod policy;      // Caller identity and role gate (policy.rs)
mod store;       // Persistence seam (store.rs)

#[cfg(test)]
mod memory_store;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::coordinator::FleetCoordinator;
use crate::db::Database;
use crate::metrics::setup_metrics;
use crate::notify::Notifier;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every handler through State<Arc<AppState>>.
pub struct AppState {
    /// Listings, creates and health checks
    pub db: Database,

    /// Lifecycle commands, backed by the same pool
    pub coordinator: FleetCoordinator<Database>,

    /// Lifecycle event publisher (also used for the Redis readiness probe)
    pub notifier: Notifier,

    /// Prometheus metrics handle
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Connect to Redis when configured. A failed connection degrades the
/// notifier to log-only instead of aborting startup.
async fn connect_notifier(config: &Config) -> Notifier {
    let Some(url) = config.redis_url.as_deref() else {
        info!("REDIS_URL not set; lifecycle events will only be logged");
        return Notifier::log_only();
    };

    let connection = match redis::Client::open(url) {
        Ok(client) => redis::aio::ConnectionManager::new(client).await,
        Err(e) => Err(e),
    };

    match connection {
        Ok(conn) => {
            info!(channel = %config.lifecycle_channel, "Connected to Redis");
            Notifier::new(conn, config.lifecycle_channel.clone())
        }
        Err(e) => {
            warn!(error = %e, "Failed to connect to Redis; lifecycle events will only be logged");
            Notifier::log_only()
        }
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // ----- Health, readiness, metrics -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Vehicles -----
        .route(
            "/api/v1/vehicles",
            get(handlers::list_vehicles).post(handlers::create_vehicle),
        )
        .route("/api/v1/vehicles/:id", get(handlers::get_vehicle))
        .route("/api/v1/vehicles/:id/service", post(handlers::set_vehicle_service))
        // ----- Drivers -----
        .route(
            "/api/v1/drivers",
            get(handlers::list_drivers).post(handlers::create_driver),
        )
        .route(
            "/api/v1/drivers/:id",
            get(handlers::get_driver).patch(handlers::update_driver),
        )
        .route(
            "/api/v1/drivers/:id/completion-rate",
            post(handlers::recompute_completion_rate),
        )
        // ----- Trips -----
        .route(
            "/api/v1/trips",
            get(handlers::list_trips).post(handlers::dispatch_trip),
        )
        .route("/api/v1/trips/:id", get(handlers::get_trip))
        .route("/api/v1/trips/:id/complete", post(handlers::complete_trip))
        .route("/api/v1/trips/:id/cancel", post(handlers::cancel_trip))
        // ----- Maintenance -----
        .route(
            "/api/v1/maintenance",
            get(handlers::list_maintenance).post(handlers::open_maintenance),
        )
        .route("/api/v1/maintenance/:id", get(handlers::get_maintenance))
        .route("/api/v1/maintenance/:id/start", post(handlers::start_maintenance))
        .route("/api/v1/maintenance/:id/close", post(handlers::close_maintenance))
        // ----- Expenses -----
        .route(
            "/api/v1/expenses",
            get(handlers::list_expenses).post(handlers::create_expense),
        )
        .route("/api/v1/expenses/:id", get(handlers::get_expense))
        // ----- Complaints -----
        .route(
            "/api/v1/complaints",
            get(handlers::list_complaints).post(handlers::file_complaint),
        )
        .route(
            "/api/v1/complaints/:id",
            get(handlers::get_complaint)
                .patch(handlers::review_complaint)
                .delete(handlers::delete_complaint),
        )
        // ----- Middleware Layers -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Environment and logging
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // RUST_LOG overrides, e.g. RUST_LOG=info,fleet_service=trace
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleet_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Fleet Service...");

    // -------------------------------------------------------------------------
    // STEP 2: Configuration and metrics
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 3: PostgreSQL
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url, config.database_max_connections).await?;
    info!(max_connections = config.database_max_connections, "Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 4: Notifications
    // -------------------------------------------------------------------------
    let notifier = connect_notifier(&config).await;
    info!(publishing = notifier.is_connected(), "Lifecycle notifier ready");

    // -------------------------------------------------------------------------
    // STEP 5: State, routes, server
    // -------------------------------------------------------------------------
    let state = Arc::new(AppState {
        coordinator: FleetCoordinator::new(db.clone(), notifier.clone()),
        db,
        notifier,
        metrics_handle,
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Fleet Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
