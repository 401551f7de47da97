// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures used throughout the service: persisted entities, their
// status enums, API request/response bodies and health/error responses.
//
// Every entity row carries an `organization_id`. All queries filter by it, so
// a row from another tenant is indistinguishable from a missing row.
// =============================================================================

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

// =============================================================================
// STATUS ENUMS
// =============================================================================
// Each enum maps to a PostgreSQL enum type created in `Database::run_migrations`
// and serializes as SCREAMING_SNAKE_CASE on the wire (e.g. "ON_TRIP").

/// Operational status of a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "vehicle_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStatus {
    Available,
    OnTrip,
    InShop,
    OutOfService,
}

impl VehicleStatus {
    pub const ALL: [VehicleStatus; 4] = [
        VehicleStatus::Available,
        VehicleStatus::OnTrip,
        VehicleStatus::InShop,
        VehicleStatus::OutOfService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Available => "AVAILABLE",
            VehicleStatus::OnTrip => "ON_TRIP",
            VehicleStatus::InShop => "IN_SHOP",
            VehicleStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

/// Duty status of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "duty_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DutyStatus {
    OnDuty,
    OffDuty,
    Suspended,
}

impl DutyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DutyStatus::OnDuty => "ON_DUTY",
            DutyStatus::OffDuty => "OFF_DUTY",
            DutyStatus::Suspended => "SUSPENDED",
        }
    }
}

/// Trip status. COMPLETED and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "trip_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Dispatched,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Dispatched => "DISPATCHED",
            TripStatus::Completed => "COMPLETED",
            TripStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Completed | TripStatus::Cancelled)
    }
}

/// Maintenance log status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "maintenance_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceStatus {
    Open,
    InProgress,
    Closed,
}

impl MaintenanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceStatus::Open => "OPEN",
            MaintenanceStatus::InProgress => "IN_PROGRESS",
            MaintenanceStatus::Closed => "CLOSED",
        }
    }
}

/// Expense status. Informational only; no transition rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "expense_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpenseStatus {
    Recorded,
    Approved,
    Rejected,
}

/// Complaint severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "complaint_severity", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplaintSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Complaint review workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "complaint_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplaintStatus {
    Open,
    UnderReview,
    Resolved,
    Dismissed,
}

impl ComplaintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplaintStatus::Open => "OPEN",
            ComplaintStatus::UnderReview => "UNDER_REVIEW",
            ComplaintStatus::Resolved => "RESOLVED",
            ComplaintStatus::Dismissed => "DISMISSED",
        }
    }

    /// RESOLVED and DISMISSED close the complaint and stamp the resolver.
    pub fn is_closing(&self) -> bool {
        matches!(self, ComplaintStatus::Resolved | ComplaintStatus::Dismissed)
    }
}

macro_rules! display_via_as_str {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

display_via_as_str!(VehicleStatus, DutyStatus, TripStatus, MaintenanceStatus, ComplaintStatus);

// =============================================================================
// ENTITIES
// =============================================================================

/// A fleet vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Vehicle {
    pub id: Uuid,
    pub organization_id: Uuid,

    /// Globally unique registration plate
    pub license_plate: String,

    pub model: String,

    /// Maximum cargo weight accepted for a trip
    pub max_capacity_kg: f64,

    /// Running odometer. Never decreases.
    pub odometer_km: f64,

    pub acquisition_cost: f64,
    pub status: VehicleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A driver profile, bound 1:1 to a user identity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Driver {
    pub id: Uuid,
    pub organization_id: Uuid,

    /// User identity this profile belongs to (used for trip ownership checks)
    pub user_id: Uuid,

    pub full_name: String,
    pub license_number: String,
    pub license_expiry: NaiveDate,
    pub duty_status: DutyStatus,

    /// 0-100, maintained by safety officers
    pub safety_score: f64,

    /// Share of this driver's trips that were completed, 0-100 with 2 decimals
    pub completion_rate: f64,

    pub complaint_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A trip assigning one vehicle and one driver to a cargo run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trip {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub cargo_weight_kg: f64,
    pub origin_address: String,
    pub destination_address: String,
    pub estimated_fuel_cost: f64,
    pub start_odometer_km: f64,

    /// Set on completion only
    pub end_odometer_km: Option<f64>,

    /// end - start, set on completion only
    pub distance_km: Option<f64>,

    pub revenue: f64,
    pub status: TripStatus,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cost entry against a vehicle/driver, optionally tied to a trip.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Expense {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub trip_id: Option<Uuid>,
    pub fuel_liters: f64,
    pub fuel_cost: f64,
    pub misc_cost: f64,

    /// fuel_cost + misc_cost, fixed at creation
    pub total_cost: f64,

    pub expense_date: DateTime<Utc>,
    pub status: ExpenseStatus,
    pub created_at: DateTime<Utc>,
}

/// A maintenance job holding a vehicle in the shop.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MaintenanceLog {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub vehicle_id: Uuid,
    pub issue_description: String,
    pub service_date: NaiveDate,
    pub cost: f64,
    pub status: MaintenanceStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A complaint filed against a vehicle, trip or driver.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Complaint {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub reporter_id: Uuid,
    pub vehicle_id: Option<Uuid>,
    pub trip_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub severity: ComplaintSeverity,
    pub description: String,
    pub status: ComplaintStatus,
    pub resolved_by: Option<Uuid>,
    pub resolution_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,

    /// Soft delete marker; deleted complaints never leave the database layer
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// SUMMARIES
// =============================================================================
// Compact views attached to trip responses.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleSummary {
    pub id: Uuid,
    pub license_plate: String,
    pub model: String,
    pub status: VehicleStatus,
    pub odometer_km: f64,
}

impl From<&Vehicle> for VehicleSummary {
    fn from(v: &Vehicle) -> Self {
        Self {
            id: v.id,
            license_plate: v.license_plate.clone(),
            model: v.model.clone(),
            status: v.status,
            odometer_km: v.odometer_km,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSummary {
    pub id: Uuid,
    pub full_name: String,
    pub license_number: String,
    pub duty_status: DutyStatus,
    pub completion_rate: f64,
}

impl From<&Driver> for DriverSummary {
    fn from(d: &Driver) -> Self {
        Self {
            id: d.id,
            full_name: d.full_name.clone(),
            license_number: d.license_number.clone(),
            duty_status: d.duty_status,
            completion_rate: d.completion_rate,
        }
    }
}

/// Trip with its vehicle and driver attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripDetail {
    #[serde(flatten)]
    pub trip: Trip,
    pub vehicle: VehicleSummary,
    pub driver: DriverSummary,
}

/// Response for trip completion: the trip plus the expense it generated.
#[derive(Debug, Clone, Serialize)]
pub struct TripCompletionResponse {
    #[serde(flatten)]
    pub detail: TripDetail,
    pub expense: Expense,
    /// False when the vehicle was no longer ON_TRIP and was left untouched
    pub vehicle_released: bool,
}

/// Response for trip cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct TripCancellationResponse {
    #[serde(flatten)]
    pub trip: Trip,
    /// False when the vehicle was no longer ON_TRIP and was left untouched
    pub vehicle_released: bool,
}

/// Response for closing a maintenance log.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceCloseResponse {
    #[serde(flatten)]
    pub log: MaintenanceLog,
    /// False when the vehicle was no longer IN_SHOP and was left untouched
    pub vehicle_released: bool,
}

/// Response for an explicit completion-rate recompute.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRateResponse {
    pub driver_id: Uuid,
    pub completion_rate: f64,
}

// =============================================================================
// API REQUEST STRUCTURES
// =============================================================================
// Each request validates its own ranges via `validate()`. The coordinator and
// database layer assume validated input.

fn require_non_negative(field: &str, value: f64) -> AppResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(AppError::BadRequest(format!(
            "{} must be a non-negative number",
            field
        )));
    }
    Ok(())
}

fn require_text(field: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Request body for dispatching a trip
///
/// # Example JSON
/// ```json
/// {
///   "vehicle_id": "6a2f...",
///   "driver_id": "0c9e...",
///   "cargo_weight_kg": 400,
///   "origin_address": "Depot 1",
///   "destination_address": "Warehouse 7",
///   "estimated_fuel_cost": 85.5,
///   "start_odometer_km": 1000,
///   "revenue": 450
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTripRequest {
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub cargo_weight_kg: f64,
    pub origin_address: String,
    pub destination_address: String,
    pub estimated_fuel_cost: f64,
    pub start_odometer_km: f64,
    #[serde(default)]
    pub revenue: f64,
}

impl DispatchTripRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_non_negative("cargo_weight_kg", self.cargo_weight_kg)?;
        require_non_negative("estimated_fuel_cost", self.estimated_fuel_cost)?;
        require_non_negative("start_odometer_km", self.start_odometer_km)?;
        require_non_negative("revenue", self.revenue)?;
        require_text("origin_address", &self.origin_address)?;
        require_text("destination_address", &self.destination_address)
    }
}

/// Request body for completing a trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTripRequest {
    pub end_odometer_km: f64,
}

impl CompleteTripRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_non_negative("end_odometer_km", self.end_odometer_km)
    }
}

/// Request body for opening a maintenance log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenMaintenanceRequest {
    pub vehicle_id: Uuid,
    pub issue_description: String,
    pub service_date: NaiveDate,
    #[serde(default)]
    pub cost: f64,
}

impl OpenMaintenanceRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_text("issue_description", &self.issue_description)?;
        require_non_negative("cost", self.cost)
    }
}

/// Request body for the manual service toggle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceToggleRequest {
    /// AVAILABLE or OUT_OF_SERVICE
    pub status: VehicleStatus,
}

/// Partial update of a driver's license, duty and safety fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDriverRequest {
    pub license_number: Option<String>,
    pub license_expiry: Option<NaiveDate>,
    pub duty_status: Option<DutyStatus>,
    pub safety_score: Option<f64>,
}

impl UpdateDriverRequest {
    pub fn validate(&self) -> AppResult<()> {
        if let Some(number) = &self.license_number {
            require_text("license_number", number)?;
        }
        if let Some(score) = self.safety_score {
            if !(0.0..=100.0).contains(&score) {
                return Err(AppError::BadRequest(
                    "safety_score must be between 0 and 100".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Request body for registering a vehicle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVehicleRequest {
    pub license_plate: String,
    pub model: String,
    pub max_capacity_kg: f64,
    #[serde(default)]
    pub odometer_km: f64,
    #[serde(default)]
    pub acquisition_cost: f64,
}

impl CreateVehicleRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_text("license_plate", &self.license_plate)?;
        require_text("model", &self.model)?;
        require_non_negative("max_capacity_kg", self.max_capacity_kg)?;
        require_non_negative("odometer_km", self.odometer_km)?;
        require_non_negative("acquisition_cost", self.acquisition_cost)
    }
}

/// Request body for registering a driver profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDriverRequest {
    pub user_id: Uuid,
    pub full_name: String,
    pub license_number: String,
    pub license_expiry: NaiveDate,
    #[serde(default = "default_safety_score")]
    pub safety_score: f64,
}

fn default_safety_score() -> f64 {
    100.0
}

impl CreateDriverRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_text("full_name", &self.full_name)?;
        require_text("license_number", &self.license_number)?;
        if !(0.0..=100.0).contains(&self.safety_score) {
            return Err(AppError::BadRequest(
                "safety_score must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// Request body for logging an expense manually
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExpenseRequest {
    pub vehicle_id: Uuid,
    pub driver_id: Uuid,
    pub trip_id: Option<Uuid>,
    #[serde(default)]
    pub fuel_liters: f64,
    #[serde(default)]
    pub fuel_cost: f64,
    #[serde(default)]
    pub misc_cost: f64,
    pub expense_date: Option<DateTime<Utc>>,
}

impl CreateExpenseRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_non_negative("fuel_liters", self.fuel_liters)?;
        require_non_negative("fuel_cost", self.fuel_cost)?;
        require_non_negative("misc_cost", self.misc_cost)
    }

    pub fn total_cost(&self) -> f64 {
        self.fuel_cost + self.misc_cost
    }
}

/// Request body for filing a complaint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateComplaintRequest {
    pub vehicle_id: Option<Uuid>,
    pub trip_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub severity: ComplaintSeverity,
    pub description: String,
}

impl CreateComplaintRequest {
    pub fn validate(&self) -> AppResult<()> {
        require_text("description", &self.description)
    }
}

/// Request body for moving a complaint through review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComplaintRequest {
    pub status: ComplaintStatus,
    pub resolution_notes: Option<String>,
}

// =============================================================================
// LIST RESPONSE
// =============================================================================

/// Paginated list response
#[derive(Debug, Clone, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    /// None when no Redis URL is configured
    pub redis: Option<bool>,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
