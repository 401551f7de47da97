// =============================================================================
// LIFECYCLE MODULE
// =============================================================================
// State machines for Vehicle, Driver duty, Trip, MaintenanceLog and Complaint,
// plus the precondition checks the coordinator runs before it opens a
// transaction. Everything here is pure: no I/O, no clock reads.
//
// Vehicle:      AVAILABLE <-> ON_TRIP        (dispatch / complete, cancel)
//               AVAILABLE|OUT_OF_SERVICE|IN_SHOP -> IN_SHOP (maintenance open)
//               IN_SHOP -> AVAILABLE         (maintenance close)
//               not ON_TRIP -> AVAILABLE|OUT_OF_SERVICE (manual toggle)
// Trip:         DISPATCHED -> COMPLETED | CANCELLED
// Maintenance:  OPEN -> IN_PROGRESS -> CLOSED, OPEN -> CLOSED
// Complaint:    OPEN -> UNDER_REVIEW | RESOLVED | DISMISSED
//               UNDER_REVIEW -> RESOLVED | DISMISSED
// =============================================================================

use chrono::NaiveDate;

use crate::error::{AppError, AppResult};
use crate::models::{
    ComplaintStatus, DispatchTripRequest, Driver, DutyStatus, MaintenanceLog, MaintenanceStatus,
    Trip, TripStatus, Vehicle, VehicleStatus,
};

// =============================================================================
// SHARED INVARIANT HELPERS
// =============================================================================

/// A license is valid through the whole of its expiry day.
pub fn license_is_valid(expiry: NaiveDate, today: NaiveDate) -> bool {
    expiry >= today
}

pub fn check_capacity(cargo_weight_kg: f64, vehicle: &Vehicle) -> AppResult<()> {
    if cargo_weight_kg > vehicle.max_capacity_kg {
        return Err(AppError::InvalidState(format!(
            "Cargo weight {} kg exceeds vehicle capacity of {} kg",
            cargo_weight_kg, vehicle.max_capacity_kg
        )));
    }
    Ok(())
}

/// A new reading may never be below what the vehicle already reports.
pub fn check_odometer_not_below(reading_km: f64, vehicle: &Vehicle) -> AppResult<()> {
    if reading_km < vehicle.odometer_km {
        return Err(AppError::InvalidState(format!(
            "Start odometer {} km is below the vehicle's current reading of {} km",
            reading_km, vehicle.odometer_km
        )));
    }
    Ok(())
}

/// Odometer after a completed trip: the end reading, never lower than before.
pub fn ratchet_odometer(current_km: f64, end_km: f64) -> f64 {
    current_km.max(end_km)
}

/// Duty status to persist for a driver write.
///
/// A license expiry in the past forces SUSPENDED, whatever duty status was
/// requested alongside it. Returns `None` when nothing should be written.
pub fn effective_duty_status(
    requested: Option<DutyStatus>,
    license_expiry: Option<NaiveDate>,
    today: NaiveDate,
) -> Option<DutyStatus> {
    match license_expiry {
        Some(expiry) if !license_is_valid(expiry, today) => Some(DutyStatus::Suspended),
        _ => requested,
    }
}

// =============================================================================
// DERIVED STATISTICS
// =============================================================================

/// Completed share of all trips as a percentage rounded to 2 decimals.
/// A driver without trips has a rate of 0.
pub fn completion_rate(completed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let rate = completed as f64 / total as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

// =============================================================================
// TRIP DISPATCH
// =============================================================================

/// Dispatch preconditions 3-7, in order; the first failure wins.
/// Existence of vehicle and driver (1-2) is checked by the caller.
pub fn check_dispatch(
    vehicle: &Vehicle,
    driver: &Driver,
    request: &DispatchTripRequest,
    today: NaiveDate,
) -> AppResult<()> {
    if vehicle.status != VehicleStatus::Available {
        return Err(AppError::InvalidState(format!(
            "Vehicle is {} and cannot be assigned",
            vehicle.status
        )));
    }

    if driver.duty_status != DutyStatus::OnDuty {
        return Err(AppError::InvalidState(format!(
            "Driver is {} and cannot be assigned",
            driver.duty_status
        )));
    }

    if !license_is_valid(driver.license_expiry, today) {
        return Err(AppError::InvalidState(format!(
            "Driver license expired on {}",
            driver.license_expiry
        )));
    }

    check_capacity(request.cargo_weight_kg, vehicle)?;
    check_odometer_not_below(request.start_odometer_km, vehicle)
}

// =============================================================================
// TRIP COMPLETION / CANCELLATION
// =============================================================================

pub fn check_completion(trip: &Trip, end_odometer_km: f64) -> AppResult<()> {
    if trip.status.is_terminal() {
        return Err(AppError::InvalidState(format!(
            "Trip is {} and cannot be completed",
            trip.status
        )));
    }

    if end_odometer_km <= trip.start_odometer_km {
        return Err(AppError::InvalidState(format!(
            "End odometer {} km must be greater than start odometer {} km",
            end_odometer_km, trip.start_odometer_km
        )));
    }
    Ok(())
}

pub fn check_cancellation(trip: &Trip) -> AppResult<()> {
    match trip.status {
        TripStatus::Completed => Err(AppError::InvalidState(
            "Trip is COMPLETED and cannot be cancelled".to_string(),
        )),
        TripStatus::Cancelled => Err(AppError::InvalidState(
            "Trip is already CANCELLED".to_string(),
        )),
        TripStatus::Dispatched => Ok(()),
    }
}

// =============================================================================
// MAINTENANCE
// =============================================================================

pub fn check_maintenance_open(vehicle: &Vehicle) -> AppResult<()> {
    if vehicle.status == VehicleStatus::OnTrip {
        return Err(AppError::InvalidState(format!(
            "Vehicle is {} and cannot be sent to maintenance",
            vehicle.status
        )));
    }
    Ok(())
}

pub fn check_maintenance_start(log: &MaintenanceLog) -> AppResult<()> {
    if log.status != MaintenanceStatus::Open {
        return Err(AppError::InvalidState(format!(
            "Maintenance log is {} and cannot be started",
            log.status
        )));
    }
    Ok(())
}

pub fn check_maintenance_close(log: &MaintenanceLog) -> AppResult<()> {
    if log.status == MaintenanceStatus::Closed {
        return Err(AppError::InvalidState(
            "Maintenance log is already closed".to_string(),
        ));
    }
    Ok(())
}

// =============================================================================
// MANUAL SERVICE TOGGLE
// =============================================================================

pub fn check_service_toggle(vehicle: &Vehicle, target: VehicleStatus) -> AppResult<()> {
    if !matches!(
        target,
        VehicleStatus::Available | VehicleStatus::OutOfService
    ) {
        return Err(AppError::BadRequest(format!(
            "Service status must be AVAILABLE or OUT_OF_SERVICE, got {}",
            target
        )));
    }

    if vehicle.status == VehicleStatus::OnTrip {
        return Err(AppError::InvalidState(format!(
            "Vehicle is {} and cannot change service status",
            vehicle.status
        )));
    }
    Ok(())
}

// =============================================================================
// COMPLAINTS
// =============================================================================

pub fn complaint_transition_allowed(from: ComplaintStatus, to: ComplaintStatus) -> bool {
    use ComplaintStatus::*;
    matches!(
        (from, to),
        (Open, UnderReview) | (Open, Resolved) | (Open, Dismissed)
            | (UnderReview, Resolved)
            | (UnderReview, Dismissed)
    )
}

pub fn check_complaint_transition(from: ComplaintStatus, to: ComplaintStatus) -> AppResult<()> {
    if !complaint_transition_allowed(from, to) {
        return Err(AppError::InvalidState(format!(
            "Complaint is {} and cannot move to {}",
            from, to
        )));
    }
    Ok(())
}
