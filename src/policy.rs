// =============================================================================
// POLICY MODULE
// =============================================================================
// Caller identity and the role gate.
//
// Authentication happens upstream; requests arrive with the caller already
// resolved into three headers:
//   x-user-id:          UUID of the user
//   x-user-role:        FLEET_MANAGER | DISPATCHER | SAFETY_OFFICER |
//                       FINANCIAL_ANALYST | DRIVER
//   x-organization-id:  UUID of the tenant
//
// Which roles may run which operation is one declarative table,
// `permitted_roles`, consulted through `authorize`.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ROLE_HEADER: &str = "x-user-role";
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

// =============================================================================
// ROLES
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    FleetManager,
    Dispatcher,
    SafetyOfficer,
    FinancialAnalyst,
    Driver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::FleetManager => "FLEET_MANAGER",
            Role::Dispatcher => "DISPATCHER",
            Role::SafetyOfficer => "SAFETY_OFFICER",
            Role::FinancialAnalyst => "FINANCIAL_ANALYST",
            Role::Driver => "DRIVER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FLEET_MANAGER" => Ok(Role::FleetManager),
            "DISPATCHER" => Ok(Role::Dispatcher),
            "SAFETY_OFFICER" => Ok(Role::SafetyOfficer),
            "FINANCIAL_ANALYST" => Ok(Role::FinancialAnalyst),
            "DRIVER" => Ok(Role::Driver),
            other => Err(AppError::Unauthorized(format!("Unknown role: {}", other))),
        }
    }
}

// =============================================================================
// ACTOR
// =============================================================================

/// The resolved caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
    pub organization_id: Uuid,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role, organization_id: Uuid) -> Self {
        Self {
            user_id,
            role,
            organization_id,
        }
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> AppResult<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(format!("Missing {} header", name)))
}

fn header_uuid(parts: &Parts, name: &str) -> AppResult<Uuid> {
    header_value(parts, name)?
        .parse()
        .map_err(|_| AppError::Unauthorized(format!("Malformed {} header", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Actor {
            user_id: header_uuid(parts, USER_ID_HEADER)?,
            role: header_value(parts, ROLE_HEADER)?.parse()?,
            organization_id: header_uuid(parts, ORGANIZATION_HEADER)?,
        })
    }
}

// =============================================================================
// OPERATIONS & POLICY MAP
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DispatchTrip,
    CompleteTrip,
    CancelTrip,
    OpenMaintenance,
    StartMaintenance,
    CloseMaintenance,
    ToggleVehicleService,
    UpdateDriver,
    RecomputeCompletionRate,
    CreateVehicle,
    CreateDriver,
    CreateExpense,
    FileComplaint,
    ReviewComplaint,
    DeleteComplaint,
    ViewFleet,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::DispatchTrip => "dispatch_trip",
            Operation::CompleteTrip => "complete_trip",
            Operation::CancelTrip => "cancel_trip",
            Operation::OpenMaintenance => "open_maintenance",
            Operation::StartMaintenance => "start_maintenance",
            Operation::CloseMaintenance => "close_maintenance",
            Operation::ToggleVehicleService => "toggle_vehicle_service",
            Operation::UpdateDriver => "update_driver",
            Operation::RecomputeCompletionRate => "recompute_completion_rate",
            Operation::CreateVehicle => "create_vehicle",
            Operation::CreateDriver => "create_driver",
            Operation::CreateExpense => "create_expense",
            Operation::FileComplaint => "file_complaint",
            Operation::ReviewComplaint => "review_complaint",
            Operation::DeleteComplaint => "delete_complaint",
            Operation::ViewFleet => "view_fleet",
        }
    }
}

const ALL_ROLES: &[Role] = &[
    Role::FleetManager,
    Role::Dispatcher,
    Role::SafetyOfficer,
    Role::FinancialAnalyst,
    Role::Driver,
];

/// Roles allowed to run each operation.
///
/// For `CompleteTrip`, DRIVER is additionally restricted to trips assigned to
/// the caller; the coordinator enforces that once the trip is loaded.
pub fn permitted_roles(operation: Operation) -> &'static [Role] {
    use Role::*;
    match operation {
        Operation::DispatchTrip | Operation::CancelTrip => &[Dispatcher, FleetManager],
        Operation::CompleteTrip => &[Driver, Dispatcher, FleetManager],
        Operation::OpenMaintenance
        | Operation::StartMaintenance
        | Operation::CloseMaintenance => &[FleetManager, SafetyOfficer],
        Operation::ToggleVehicleService
        | Operation::RecomputeCompletionRate
        | Operation::CreateVehicle => &[FleetManager],
        Operation::UpdateDriver | Operation::CreateDriver => &[FleetManager, SafetyOfficer],
        Operation::CreateExpense => &[FleetManager, FinancialAnalyst, Driver],
        Operation::ReviewComplaint | Operation::DeleteComplaint => &[SafetyOfficer, FleetManager],
        Operation::FileComplaint | Operation::ViewFleet => ALL_ROLES,
    }
}

/// Reject the caller unless their role is listed for `operation`.
pub fn authorize(actor: &Actor, operation: Operation) -> AppResult<()> {
    if permitted_roles(operation).contains(&actor.role) {
        return Ok(());
    }
    Err(AppError::Forbidden(format!(
        "Role {} is not permitted to {}",
        actor.role,
        operation.as_str()
    )))
}
