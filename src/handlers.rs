// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer).
//
// Lifecycle routes delegate to the `FleetCoordinator`; reads and the simple
// create/review routes go straight to `Database`. Every handler times itself
// and records `http_requests_total`; lifecycle handlers also record
// `fleet_lifecycle_transitions_total`.
//
// The caller is resolved by the `Actor` extractor from identity headers,
// so handlers that take an `Actor` reject anonymous requests with 401.
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::db::Page;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::policy::{self, Actor, Operation};
use crate::store::FleetStore;
use crate::AppState;

// -----------------------------------------------------------------------------
// METRICS HELPERS
// -----------------------------------------------------------------------------

fn record_request<T>(
    method: &str,
    endpoint: &str,
    success: StatusCode,
    start: Instant,
    result: &AppResult<T>,
) {
    let status = match result {
        Ok(_) => success,
        Err(e) => e.status_code(),
    };
    metrics::record_http_request(method, endpoint, status.as_u16(), start.elapsed().as_secs_f64());
}

fn record_transition<T>(
    operation: Operation,
    method: &str,
    endpoint: &str,
    success: StatusCode,
    start: Instant,
    result: &AppResult<T>,
) {
    record_request(method, endpoint, success, start, result);
    metrics::record_lifecycle_transition(operation.as_str(), metrics::outcome_label(result));
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "fleet-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe - database, and Redis when one is configured
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = match state.notifier.connection() {
        Some(mut conn) => {
            let start = Instant::now();
            let ok = redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .is_ok();
            metrics::record_redis_operation("ping", start.elapsed().as_secs_f64());
            Some(ok)
        }
        None => None,
    };

    let all_healthy = db_healthy && redis_healthy.unwrap_or(true);
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        tracing::warn!(database = db_healthy, redis = ?redis_healthy, "Readiness check failed");
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus metrics endpoint
///
/// GET /metrics
///
/// Fleet-wide gauges are refreshed here, once per scrape.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    refresh_fleet_gauges(&state.db).await;
    state.metrics_handle.render()
}

async fn refresh_fleet_gauges(db: &crate::db::Database) {
    let start = Instant::now();
    match db.vehicle_counts_by_status().await {
        Ok(counts) => {
            for status in VehicleStatus::ALL {
                let count = counts
                    .iter()
                    .find(|(s, _)| *s == status)
                    .map_or(0, |(_, n)| *n);
                metrics::set_vehicles_by_status(status.as_str(), count);
            }
            metrics::record_db_query("select", start.elapsed().as_secs_f64());
        }
        Err(e) => tracing::warn!(error = %e, "Failed to refresh vehicle gauges"),
    }
}

// -----------------------------------------------------------------------------
// QUERY PARAMETERS
// -----------------------------------------------------------------------------
/// Query parameters for list endpoints
///
/// # Example
/// GET /api/v1/trips?page=2&per_page=50&status=DISPATCHED
#[derive(Debug, Deserialize)]
pub struct ListParams<S> {
    /// Page number (1-indexed, default: 1)
    #[serde(default = "default_page")]
    pub page: i64,

    /// Items per page (default: 20, max: 100)
    #[serde(default = "default_per_page")]
    pub per_page: i64,

    /// Optional status filter
    pub status: Option<S>,
}

fn default_page() -> i64 {
    1
}
fn default_per_page() -> i64 {
    20
}

impl<S> ListParams<S> {
    fn page(&self) -> Page {
        Page::new(self.page, self.per_page)
    }
}

fn list_response<T>(items: Vec<T>, total: i64, page: Page) -> ListResponse<T> {
    ListResponse {
        items,
        total,
        page: page.page,
        per_page: page.per_page,
    }
}

// =============================================================================
// VEHICLES
// =============================================================================

/// GET /api/v1/vehicles
pub async fn list_vehicles(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<ListParams<VehicleStatus>>,
) -> AppResult<Json<ListResponse<Vehicle>>> {
    let start = Instant::now();
    let page = params.page();
    let status = params.status;

    let result = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state.db.list_vehicles(actor.organization_id, status, page).await
    }
    .await;
    record_request("GET", "/api/v1/vehicles", StatusCode::OK, start, &result);
    metrics::record_db_query("select", start.elapsed().as_secs_f64());

    let (items, total) = result?;
    Ok(Json(list_response(items, total, page)))
}

/// GET /api/v1/vehicles/:id
pub async fn get_vehicle(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vehicle>> {
    let start = Instant::now();

    let result: AppResult<Vehicle> = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state
            .db
            .find_vehicle(actor.organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Vehicle not found: {}", id)))
    }
    .await;
    record_request("GET", "/api/v1/vehicles/:id", StatusCode::OK, start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/vehicles
pub async fn create_vehicle(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<CreateVehicleRequest>,
) -> AppResult<(StatusCode, Json<Vehicle>)> {
    let start = Instant::now();

    let result = async {
        policy::authorize(&actor, Operation::CreateVehicle)?;
        req.validate()?;
        state.db.create_vehicle(actor.organization_id, &req).await
    }
    .await;
    record_request("POST", "/api/v1/vehicles", StatusCode::CREATED, start, &result);

    let vehicle = result?;
    tracing::info!(vehicle_id = %vehicle.id, license_plate = %vehicle.license_plate, "Vehicle registered");
    Ok((StatusCode::CREATED, Json(vehicle)))
}

/// Take a vehicle out of service or bring it back
///
/// POST /api/v1/vehicles/:id/service
///
/// # Request Body
/// ```json
/// { "status": "OUT_OF_SERVICE" }
/// ```
pub async fn set_vehicle_service(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<ServiceToggleRequest>,
) -> AppResult<Json<Vehicle>> {
    let start = Instant::now();
    let result = state
        .coordinator
        .set_vehicle_service(&actor, id, req.status)
        .await;
    record_transition(
        Operation::ToggleVehicleService,
        "POST",
        "/api/v1/vehicles/:id/service",
        StatusCode::OK,
        start,
        &result,
    );
    Ok(Json(result?))
}

// =============================================================================
// DRIVERS
// =============================================================================

/// GET /api/v1/drivers
pub async fn list_drivers(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<ListParams<DutyStatus>>,
) -> AppResult<Json<ListResponse<Driver>>> {
    let start = Instant::now();
    let page = params.page();
    let status = params.status;

    let result = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state.db.list_drivers(actor.organization_id, status, page).await
    }
    .await;
    record_request("GET", "/api/v1/drivers", StatusCode::OK, start, &result);
    metrics::record_db_query("select", start.elapsed().as_secs_f64());

    let (items, total) = result?;
    Ok(Json(list_response(items, total, page)))
}

/// GET /api/v1/drivers/:id
pub async fn get_driver(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Driver>> {
    let start = Instant::now();

    let result: AppResult<Driver> = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state
            .db
            .find_driver(actor.organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Driver not found: {}", id)))
    }
    .await;
    record_request("GET", "/api/v1/drivers/:id", StatusCode::OK, start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/drivers
pub async fn create_driver(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<CreateDriverRequest>,
) -> AppResult<(StatusCode, Json<Driver>)> {
    let start = Instant::now();

    let result = async {
        policy::authorize(&actor, Operation::CreateDriver)?;
        req.validate()?;
        state
            .db
            .create_driver(actor.organization_id, &req, Utc::now().date_naive())
            .await
    }
    .await;
    record_request("POST", "/api/v1/drivers", StatusCode::CREATED, start, &result);

    let driver = result?;
    tracing::info!(driver_id = %driver.id, duty_status = %driver.duty_status, "Driver registered");
    Ok((StatusCode::CREATED, Json(driver)))
}

/// Patch license, duty status or safety score
///
/// PATCH /api/v1/drivers/:id
pub async fn update_driver(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateDriverRequest>,
) -> AppResult<Json<Driver>> {
    let start = Instant::now();
    let result = state.coordinator.update_driver(&actor, id, req).await;
    record_transition(
        Operation::UpdateDriver,
        "PATCH",
        "/api/v1/drivers/:id",
        StatusCode::OK,
        start,
        &result,
    );
    Ok(Json(result?))
}

/// POST /api/v1/drivers/:id/completion-rate
pub async fn recompute_completion_rate(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CompletionRateResponse>> {
    let start = Instant::now();
    let result = state.coordinator.recompute_completion_rate(&actor, id).await;
    record_transition(
        Operation::RecomputeCompletionRate,
        "POST",
        "/api/v1/drivers/:id/completion-rate",
        StatusCode::OK,
        start,
        &result,
    );
    Ok(Json(result?))
}

// =============================================================================
// TRIPS
// =============================================================================

/// GET /api/v1/trips
pub async fn list_trips(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<ListParams<TripStatus>>,
) -> AppResult<Json<ListResponse<Trip>>> {
    let start = Instant::now();
    let page = params.page();
    let status = params.status;

    let result = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state.db.list_trips(actor.organization_id, status, page).await
    }
    .await;
    record_request("GET", "/api/v1/trips", StatusCode::OK, start, &result);
    metrics::record_db_query("select", start.elapsed().as_secs_f64());

    let (items, total) = result?;
    Ok(Json(list_response(items, total, page)))
}

/// GET /api/v1/trips/:id
pub async fn get_trip(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Trip>> {
    let start = Instant::now();

    let result: AppResult<Trip> = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state
            .db
            .find_trip(actor.organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Trip not found: {}", id)))
    }
    .await;
    record_request("GET", "/api/v1/trips/:id", StatusCode::OK, start, &result);

    Ok(Json(result?))
}

/// Dispatch a trip
///
/// POST /api/v1/trips
///
/// # Response
/// - 201 Created: trip with vehicle and driver summaries
/// - 404 Not Found: vehicle or driver missing
/// - 409 Conflict: vehicle/driver state, license, capacity or odometer check failed
pub async fn dispatch_trip(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<DispatchTripRequest>,
) -> AppResult<(StatusCode, Json<TripDetail>)> {
    let start = Instant::now();
    let result = state.coordinator.dispatch_trip(&actor, req).await;
    record_transition(
        Operation::DispatchTrip,
        "POST",
        "/api/v1/trips",
        StatusCode::CREATED,
        start,
        &result,
    );
    Ok((StatusCode::CREATED, Json(result?)))
}

/// Complete a dispatched trip
///
/// POST /api/v1/trips/:id/complete
///
/// # Request Body
/// ```json
/// { "end_odometer_km": 1250 }
/// ```
pub async fn complete_trip(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteTripRequest>,
) -> AppResult<Json<TripCompletionResponse>> {
    let start = Instant::now();
    let result = state.coordinator.complete_trip(&actor, id, req).await;
    record_transition(
        Operation::CompleteTrip,
        "POST",
        "/api/v1/trips/:id/complete",
        StatusCode::OK,
        start,
        &result,
    );
    Ok(Json(result?))
}

/// POST /api/v1/trips/:id/cancel
pub async fn cancel_trip(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TripCancellationResponse>> {
    let start = Instant::now();
    let result = state.coordinator.cancel_trip(&actor, id).await;
    record_transition(
        Operation::CancelTrip,
        "POST",
        "/api/v1/trips/:id/cancel",
        StatusCode::OK,
        start,
        &result,
    );
    Ok(Json(result?))
}

// =============================================================================
// MAINTENANCE
// =============================================================================

/// GET /api/v1/maintenance
pub async fn list_maintenance(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<ListParams<MaintenanceStatus>>,
) -> AppResult<Json<ListResponse<MaintenanceLog>>> {
    let start = Instant::now();
    let page = params.page();
    let status = params.status;

    let result = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state.db.list_maintenance_logs(actor.organization_id, status, page).await
    }
    .await;
    record_request("GET", "/api/v1/maintenance", StatusCode::OK, start, &result);
    metrics::record_db_query("select", start.elapsed().as_secs_f64());

    let (items, total) = result?;
    Ok(Json(list_response(items, total, page)))
}

/// GET /api/v1/maintenance/:id
pub async fn get_maintenance(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MaintenanceLog>> {
    let start = Instant::now();

    let result: AppResult<MaintenanceLog> = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state
            .db
            .find_maintenance_log(actor.organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Maintenance log not found: {}", id)))
    }
    .await;
    record_request("GET", "/api/v1/maintenance/:id", StatusCode::OK, start, &result);

    Ok(Json(result?))
}

/// Open a maintenance log and move the vehicle IN_SHOP
///
/// POST /api/v1/maintenance
pub async fn open_maintenance(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<OpenMaintenanceRequest>,
) -> AppResult<(StatusCode, Json<MaintenanceLog>)> {
    let start = Instant::now();
    let result = state.coordinator.open_maintenance(&actor, req).await;
    record_transition(
        Operation::OpenMaintenance,
        "POST",
        "/api/v1/maintenance",
        StatusCode::CREATED,
        start,
        &result,
    );
    Ok((StatusCode::CREATED, Json(result?)))
}

/// POST /api/v1/maintenance/:id/start
pub async fn start_maintenance(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MaintenanceLog>> {
    let start = Instant::now();
    let result = state.coordinator.start_maintenance(&actor, id).await;
    record_transition(
        Operation::StartMaintenance,
        "POST",
        "/api/v1/maintenance/:id/start",
        StatusCode::OK,
        start,
        &result,
    );
    Ok(Json(result?))
}

/// POST /api/v1/maintenance/:id/close
pub async fn close_maintenance(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MaintenanceCloseResponse>> {
    let start = Instant::now();
    let result = state.coordinator.close_maintenance(&actor, id).await;
    record_transition(
        Operation::CloseMaintenance,
        "POST",
        "/api/v1/maintenance/:id/close",
        StatusCode::OK,
        start,
        &result,
    );
    Ok(Json(result?))
}

// =============================================================================
// EXPENSES
// =============================================================================

/// GET /api/v1/expenses
pub async fn list_expenses(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<ListParams<ExpenseStatus>>,
) -> AppResult<Json<ListResponse<Expense>>> {
    let start = Instant::now();
    let page = params.page();
    let status = params.status;

    let result = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state.db.list_expenses(actor.organization_id, status, page).await
    }
    .await;
    record_request("GET", "/api/v1/expenses", StatusCode::OK, start, &result);
    metrics::record_db_query("select", start.elapsed().as_secs_f64());

    let (items, total) = result?;
    Ok(Json(list_response(items, total, page)))
}

/// GET /api/v1/expenses/:id
pub async fn get_expense(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Expense>> {
    let start = Instant::now();

    let result: AppResult<Expense> = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state
            .db
            .get_expense(actor.organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Expense not found: {}", id)))
    }
    .await;
    record_request("GET", "/api/v1/expenses/:id", StatusCode::OK, start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/expenses
pub async fn create_expense(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<CreateExpenseRequest>,
) -> AppResult<(StatusCode, Json<Expense>)> {
    let start = Instant::now();

    let result = async {
        policy::authorize(&actor, Operation::CreateExpense)?;
        req.validate()?;
        state.db.create_expense(actor.organization_id, &req).await
    }
    .await;
    record_request("POST", "/api/v1/expenses", StatusCode::CREATED, start, &result);

    let expense = result?;
    tracing::info!(expense_id = %expense.id, total_cost = expense.total_cost, "Expense recorded");
    Ok((StatusCode::CREATED, Json(expense)))
}

// =============================================================================
// COMPLAINTS
// =============================================================================

/// GET /api/v1/complaints
pub async fn list_complaints(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<ListParams<ComplaintStatus>>,
) -> AppResult<Json<ListResponse<Complaint>>> {
    let start = Instant::now();
    let page = params.page();
    let status = params.status;

    let result = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state.db.list_complaints(actor.organization_id, status, page).await
    }
    .await;
    record_request("GET", "/api/v1/complaints", StatusCode::OK, start, &result);
    metrics::record_db_query("select", start.elapsed().as_secs_f64());

    let (items, total) = result?;
    Ok(Json(list_response(items, total, page)))
}

/// GET /api/v1/complaints/:id
pub async fn get_complaint(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Complaint>> {
    let start = Instant::now();

    let result: AppResult<Complaint> = async {
        policy::authorize(&actor, Operation::ViewFleet)?;
        state
            .db
            .get_complaint(actor.organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Complaint not found: {}", id)))
    }
    .await;
    record_request("GET", "/api/v1/complaints/:id", StatusCode::OK, start, &result);

    Ok(Json(result?))
}

/// POST /api/v1/complaints
pub async fn file_complaint(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<CreateComplaintRequest>,
) -> AppResult<(StatusCode, Json<Complaint>)> {
    let start = Instant::now();

    let result = async {
        policy::authorize(&actor, Operation::FileComplaint)?;
        req.validate()?;
        state
            .db
            .create_complaint(actor.organization_id, actor.user_id, &req)
            .await
    }
    .await;
    record_request("POST", "/api/v1/complaints", StatusCode::CREATED, start, &result);

    let complaint = result?;
    tracing::info!(complaint_id = %complaint.id, severity = ?complaint.severity, "Complaint filed");
    Ok((StatusCode::CREATED, Json(complaint)))
}

/// Move a complaint through review
///
/// PATCH /api/v1/complaints/:id
///
/// # Request Body
/// ```json
/// { "status": "RESOLVED", "resolution_notes": "Driver retrained" }
/// ```
pub async fn review_complaint(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<ReviewComplaintRequest>,
) -> AppResult<Json<Complaint>> {
    let start = Instant::now();

    let result = async {
        policy::authorize(&actor, Operation::ReviewComplaint)?;
        state
            .db
            .review_complaint(actor.organization_id, id, actor.user_id, &req)
            .await
    }
    .await;
    record_request("PATCH", "/api/v1/complaints/:id", StatusCode::OK, start, &result);

    let complaint = result?;
    tracing::info!(complaint_id = %complaint.id, status = %complaint.status, "Complaint reviewed");
    Ok(Json(complaint))
}

/// DELETE /api/v1/complaints/:id
pub async fn delete_complaint(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let start = Instant::now();

    let result = async {
        policy::authorize(&actor, Operation::DeleteComplaint)?;
        state.db.soft_delete_complaint(actor.organization_id, id).await
    }
    .await;
    record_request("DELETE", "/api/v1/complaints/:id", StatusCode::NO_CONTENT, start, &result);

    result?;
    tracing::info!(complaint_id = %id, "Complaint deleted");
    Ok(StatusCode::NO_CONTENT)
}
