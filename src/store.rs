// =============================================================================
// STORE MODULE
// =============================================================================
// The persistence seam the lifecycle coordinator is written against.
//
// Reads are organization-scoped lookups. Each write method applies one
// lifecycle event atomically: either every row it touches changes, or none
// does. Status-guarded writes are conditional on the state the coordinator
// observed ("UPDATE ... WHERE status = expected"); when a guard matches zero
// rows the whole event is abandoned with `StoreError::StaleState`.
//
// Implementations:
// - `Database` (db_store.rs): PostgreSQL transactions via sqlx
// - `MemoryStore` (memory_store.rs, tests only)
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Driver, DutyStatus, Expense, MaintenanceLog, MaintenanceStatus, Trip, TripStatus, Vehicle,
    VehicleStatus,
};

// =============================================================================
// ERRORS
// =============================================================================
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write found the entity in a different state than expected
    #[error("{entity} {id} is no longer {expected}")]
    StaleState {
        entity: &'static str,
        id: Uuid,
        expected: String,
    },

    /// A row the event depends on vanished mid-transaction
    #[error("{entity} not found: {id}")]
    Missing { entity: &'static str, id: Uuid },

    /// Storage or transaction failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn stale(entity: &'static str, id: Uuid, expected: impl ToString) -> Self {
        StoreError::StaleState {
            entity,
            id,
            expected: expected.to_string(),
        }
    }

    pub fn missing(entity: &'static str, id: Uuid) -> Self {
        StoreError::Missing { entity, id }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// COMMAND PLANS
// =============================================================================
// A plan carries everything one lifecycle event writes plus the states the
// coordinator observed when it checked preconditions.

/// New trip to insert; vehicle must still be AVAILABLE, driver still ON_DUTY.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub organization_id: Uuid,
    pub trip_id: Uuid,
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub cargo_weight_kg: f64,
    pub origin_address: String,
    pub destination_address: String,
    pub estimated_fuel_cost: f64,
    pub start_odometer_km: f64,
    pub revenue: f64,
    pub dispatched_at: DateTime<Utc>,
}

/// Trip must still be DISPATCHED. The vehicle is released only when
/// `release_vehicle` is set and it is still ON_TRIP.
#[derive(Debug, Clone)]
pub struct CompletionPlan {
    pub organization_id: Uuid,
    pub trip_id: Uuid,
    pub vehicle_id: Uuid,
    /// Set AVAILABLE only if still ON_TRIP; the odometer ratchets either way
    pub release_vehicle: bool,
    pub driver_id: Uuid,
    pub end_odometer_km: f64,
    pub estimated_fuel_cost: f64,
    pub expense_id: Uuid,
    pub completed_at: DateTime<Utc>,
}

/// Trip must still be in `expected_trip_status`. The vehicle is released
/// only when `release_vehicle` is set and it is still ON_TRIP.
#[derive(Debug, Clone)]
pub struct CancellationPlan {
    pub organization_id: Uuid,
    pub trip_id: Uuid,
    pub expected_trip_status: TripStatus,
    pub vehicle_id: Uuid,
    pub release_vehicle: bool,
    pub driver_id: Uuid,
    pub cancelled_at: DateTime<Utc>,
}

/// New maintenance log; vehicle must still be in `expected_vehicle_status`.
#[derive(Debug, Clone)]
pub struct MaintenanceOpenPlan {
    pub organization_id: Uuid,
    pub log_id: Uuid,
    pub vehicle_id: Uuid,
    pub expected_vehicle_status: VehicleStatus,
    pub issue_description: String,
    pub service_date: NaiveDate,
    pub cost: f64,
}

/// Log must still be in `expected_log_status`. The vehicle is released only
/// when `release_vehicle` is set and it is still IN_SHOP.
#[derive(Debug, Clone)]
pub struct MaintenanceClosePlan {
    pub organization_id: Uuid,
    pub log_id: Uuid,
    pub expected_log_status: MaintenanceStatus,
    pub vehicle_id: Uuid,
    pub release_vehicle: bool,
    pub closed_at: DateTime<Utc>,
}

/// Driver columns to overwrite; `None` leaves a column unchanged.
#[derive(Debug, Clone, Default)]
pub struct DriverChanges {
    pub license_number: Option<String>,
    pub license_expiry: Option<NaiveDate>,
    pub duty_status: Option<DutyStatus>,
    pub safety_score: Option<f64>,
}

// =============================================================================
// COMMAND RESULTS
// =============================================================================

#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub trip: Trip,
    pub vehicle: Vehicle,
    pub driver: Driver,
}

#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub trip: Trip,
    pub vehicle: Vehicle,
    pub vehicle_released: bool,
    pub driver: Driver,
    pub expense: Expense,
}

#[derive(Debug, Clone)]
pub struct CancellationRecord {
    pub trip: Trip,
    pub vehicle_released: bool,
}

#[derive(Debug, Clone)]
pub struct MaintenanceCloseRecord {
    pub log: MaintenanceLog,
    pub vehicle_released: bool,
}

// =============================================================================
// STORE TRAIT
// =============================================================================
#[async_trait]
pub trait FleetStore: Send + Sync {
    // ---- organization-scoped reads ----
    async fn find_vehicle(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Vehicle>>;
    async fn find_driver(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Driver>>;
    async fn find_trip(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Trip>>;
    async fn find_maintenance_log(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<MaintenanceLog>>;

    // ---- atomic lifecycle events ----

    /// Vehicle AVAILABLE -> ON_TRIP, driver ON_DUTY reasserted, trip inserted.
    async fn dispatch_trip(&self, plan: &DispatchPlan) -> StoreResult<DispatchRecord>;

    /// Trip -> COMPLETED, vehicle odometer ratcheted and conditionally
    /// released, driver -> OFF_DUTY with recomputed completion rate, expense
    /// inserted.
    async fn complete_trip(&self, plan: &CompletionPlan) -> StoreResult<CompletionRecord>;

    /// Trip -> CANCELLED, vehicle conditionally released, driver -> OFF_DUTY.
    async fn cancel_trip(&self, plan: &CancellationPlan) -> StoreResult<CancellationRecord>;

    /// Log inserted OPEN, vehicle -> IN_SHOP.
    async fn open_maintenance(&self, plan: &MaintenanceOpenPlan) -> StoreResult<MaintenanceLog>;

    /// Log OPEN -> IN_PROGRESS.
    async fn start_maintenance(
        &self,
        organization_id: Uuid,
        log_id: Uuid,
    ) -> StoreResult<MaintenanceLog>;

    /// Log -> CLOSED, vehicle conditionally released.
    async fn close_maintenance(
        &self,
        plan: &MaintenanceClosePlan,
    ) -> StoreResult<MaintenanceCloseRecord>;

    /// Vehicle `expected` -> `target`.
    async fn set_vehicle_status(
        &self,
        organization_id: Uuid,
        vehicle_id: Uuid,
        expected: VehicleStatus,
        target: VehicleStatus,
    ) -> StoreResult<Vehicle>;

    /// Overwrite the given driver columns. `None` when the driver is missing.
    async fn update_driver(
        &self,
        organization_id: Uuid,
        driver_id: Uuid,
        changes: &DriverChanges,
    ) -> StoreResult<Option<Driver>>;

    /// Full-scan recompute of a driver's completion rate; returns the new
    /// rate, or `None` when the driver is missing.
    async fn recompute_completion_rate(
        &self,
        organization_id: Uuid,
        driver_id: Uuid,
    ) -> StoreResult<Option<f64>>;
}
