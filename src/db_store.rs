// =============================================================================
// DATABASE STORE
// =============================================================================
// `FleetStore` for PostgreSQL. Each lifecycle event runs in one transaction;
// returning early drops the `Transaction`, which rolls it back.
//
// Guarded updates use `WHERE status = $expected ... RETURNING *` so a lost race
// shows up as "no row" and becomes `StoreError::StaleState`.
// =============================================================================

use std::time::Instant;

use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::warn;
use uuid::Uuid;

use crate::db::{is_unique_violation, Database};
use crate::lifecycle;
use crate::metrics;
use crate::models::{
    Driver, DutyStatus, Expense, MaintenanceLog, MaintenanceStatus, Trip, TripStatus, Vehicle,
    VehicleStatus,
};
use crate::store::{
    CancellationPlan, CancellationRecord, CompletionPlan, CompletionRecord, DispatchPlan,
    DispatchRecord, DriverChanges, FleetStore, MaintenanceClosePlan, MaintenanceCloseRecord,
    MaintenanceOpenPlan, StoreError, StoreResult,
};

/// Recompute and persist a driver's completion rate on `conn`.
/// Returns `None` when the driver does not exist in the organization.
async fn refresh_completion_rate(
    conn: &mut PgConnection,
    organization_id: Uuid,
    driver_id: Uuid,
) -> StoreResult<Option<f64>> {
    let (completed, total): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FILTER (WHERE status = 'COMPLETED'), COUNT(*)
        FROM trips
        WHERE driver_id = $1 AND organization_id = $2
        "#,
    )
    .bind(driver_id)
    .bind(organization_id)
    .fetch_one(&mut *conn)
    .await?;

    let rate = lifecycle::completion_rate(completed, total);

    let updated = sqlx::query(
        r#"
        UPDATE drivers SET completion_rate = $3, updated_at = NOW()
        WHERE id = $1 AND organization_id = $2
        "#,
    )
    .bind(driver_id)
    .bind(organization_id)
    .bind(rate)
    .execute(&mut *conn)
    .await?;

    Ok((updated.rows_affected() > 0).then_some(rate))
}

#[async_trait]
impl FleetStore for Database {
    // -------------------------------------------------------------------------
    // READS
    // -------------------------------------------------------------------------

    async fn find_vehicle(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Vehicle>> {
        let vehicle = sqlx::query_as::<_, Vehicle>(
            "SELECT * FROM vehicles WHERE id = $1 AND organization_id = $2",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(vehicle)
    }

    async fn find_driver(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Driver>> {
        let driver = sqlx::query_as::<_, Driver>(
            "SELECT * FROM drivers WHERE id = $1 AND organization_id = $2",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(driver)
    }

    async fn find_trip(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Trip>> {
        let trip = sqlx::query_as::<_, Trip>(
            "SELECT * FROM trips WHERE id = $1 AND organization_id = $2",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(trip)
    }

    async fn find_maintenance_log(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<MaintenanceLog>> {
        let log = sqlx::query_as::<_, MaintenanceLog>(
            "SELECT * FROM maintenance_logs WHERE id = $1 AND organization_id = $2",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(log)
    }

    // -------------------------------------------------------------------------
    // TRIPS
    // -------------------------------------------------------------------------

    async fn dispatch_trip(&self, plan: &DispatchPlan) -> StoreResult<DispatchRecord> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let vehicle = sqlx::query_as::<_, Vehicle>(
            r#"
            UPDATE vehicles SET status = 'ON_TRIP', updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = 'AVAILABLE'
            RETURNING *
            "#,
        )
        .bind(plan.vehicle_id)
        .bind(plan.organization_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::stale("Vehicle", plan.vehicle_id, VehicleStatus::Available))?;

        // Guard only: the driver stays ON_DUTY.
        let driver = sqlx::query_as::<_, Driver>(
            r#"
            UPDATE drivers SET duty_status = 'ON_DUTY', updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND duty_status = 'ON_DUTY'
            RETURNING *
            "#,
        )
        .bind(plan.driver_id)
        .bind(plan.organization_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::stale("Driver", plan.driver_id, DutyStatus::OnDuty))?;

        let trip = sqlx::query_as::<_, Trip>(
            r#"
            INSERT INTO trips
                (id, organization_id, vehicle_id, driver_id, cargo_weight_kg,
                 origin_address, destination_address, estimated_fuel_cost,
                 start_odometer_km, revenue, status, dispatched_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'DISPATCHED', $11)
            RETURNING *
            "#,
        )
        .bind(plan.trip_id)
        .bind(plan.organization_id)
        .bind(plan.vehicle_id)
        .bind(plan.driver_id)
        .bind(plan.cargo_weight_kg)
        .bind(&plan.origin_address)
        .bind(&plan.destination_address)
        .bind(plan.estimated_fuel_cost)
        .bind(plan.start_odometer_km)
        .bind(plan.revenue)
        .bind(plan.dispatched_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::stale("Vehicle", plan.vehicle_id, VehicleStatus::Available)
            } else {
                e.into()
            }
        })?;

        tx.commit().await?;
        metrics::record_db_query("transaction", start.elapsed().as_secs_f64());

        Ok(DispatchRecord {
            trip,
            vehicle,
            driver,
        })
    }

    async fn complete_trip(&self, plan: &CompletionPlan) -> StoreResult<CompletionRecord> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let trip = sqlx::query_as::<_, Trip>(
            r#"
            UPDATE trips
            SET status = 'COMPLETED',
                end_odometer_km = $3,
                distance_km = $3 - start_odometer_km,
                completed_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = 'DISPATCHED'
            RETURNING *
            "#,
        )
        .bind(plan.trip_id)
        .bind(plan.organization_id)
        .bind(plan.end_odometer_km)
        .bind(plan.completed_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::stale("Trip", plan.trip_id, TripStatus::Dispatched))?;

        let prior: VehicleStatus = sqlx::query_scalar(
            "SELECT status FROM vehicles WHERE id = $1 AND organization_id = $2 FOR UPDATE",
        )
        .bind(plan.vehicle_id)
        .bind(plan.organization_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::missing("Vehicle", plan.vehicle_id))?;
        let vehicle_released = plan.release_vehicle && prior == VehicleStatus::OnTrip;

        // The odometer ratchets whatever the vehicle's status.
        let vehicle = sqlx::query_as::<_, Vehicle>(
            r#"
            UPDATE vehicles
            SET status = CASE WHEN $4 THEN 'AVAILABLE'::vehicle_status ELSE status END,
                odometer_km = GREATEST(odometer_km, $3),
                updated_at = NOW()
            WHERE id = $1 AND organization_id = $2
            RETURNING *
            "#,
        )
        .bind(plan.vehicle_id)
        .bind(plan.organization_id)
        .bind(plan.end_odometer_km)
        .bind(vehicle_released)
        .fetch_one(&mut *tx)
        .await?;

        let off_duty = sqlx::query(
            r#"
            UPDATE drivers SET duty_status = 'OFF_DUTY', updated_at = NOW()
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(plan.driver_id)
        .bind(plan.organization_id)
        .execute(&mut *tx)
        .await?;
        if off_duty.rows_affected() == 0 {
            return Err(StoreError::missing("Driver", plan.driver_id));
        }

        refresh_completion_rate(&mut *tx, plan.organization_id, plan.driver_id)
            .await?
            .ok_or_else(|| StoreError::missing("Driver", plan.driver_id))?;

        let driver = sqlx::query_as::<_, Driver>(
            "SELECT * FROM drivers WHERE id = $1 AND organization_id = $2",
        )
        .bind(plan.driver_id)
        .bind(plan.organization_id)
        .fetch_one(&mut *tx)
        .await?;

        let expense = sqlx::query_as::<_, Expense>(
            r#"
            INSERT INTO expenses
                (id, organization_id, vehicle_id, driver_id, trip_id, fuel_liters,
                 fuel_cost, misc_cost, total_cost, expense_date, status)
            VALUES ($1, $2, $3, $4, $5, 0, $6, 0, $6, $7, 'RECORDED')
            RETURNING *
            "#,
        )
        .bind(plan.expense_id)
        .bind(plan.organization_id)
        .bind(plan.vehicle_id)
        .bind(plan.driver_id)
        .bind(plan.trip_id)
        .bind(plan.estimated_fuel_cost)
        .bind(plan.completed_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::record_db_query("transaction", start.elapsed().as_secs_f64());

        Ok(CompletionRecord {
            trip,
            vehicle,
            vehicle_released,
            driver,
            expense,
        })
    }

    async fn cancel_trip(&self, plan: &CancellationPlan) -> StoreResult<CancellationRecord> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let trip = sqlx::query_as::<_, Trip>(
            r#"
            UPDATE trips SET status = 'CANCELLED', cancelled_at = $4, updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = $3
            RETURNING *
            "#,
        )
        .bind(plan.trip_id)
        .bind(plan.organization_id)
        .bind(plan.expected_trip_status)
        .bind(plan.cancelled_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::stale("Trip", plan.trip_id, plan.expected_trip_status))?;

        let mut vehicle_released = false;
        if plan.release_vehicle {
            let released = sqlx::query(
                r#"
                UPDATE vehicles SET status = 'AVAILABLE', updated_at = NOW()
                WHERE id = $1 AND organization_id = $2 AND status = 'ON_TRIP'
                "#,
            )
            .bind(plan.vehicle_id)
            .bind(plan.organization_id)
            .execute(&mut *tx)
            .await?;
            vehicle_released = released.rows_affected() > 0;
        }

        let off_duty = sqlx::query(
            r#"
            UPDATE drivers SET duty_status = 'OFF_DUTY', updated_at = NOW()
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(plan.driver_id)
        .bind(plan.organization_id)
        .execute(&mut *tx)
        .await?;
        if off_duty.rows_affected() == 0 {
            return Err(StoreError::missing("Driver", plan.driver_id));
        }

        tx.commit().await?;
        metrics::record_db_query("transaction", start.elapsed().as_secs_f64());

        Ok(CancellationRecord {
            trip,
            vehicle_released,
        })
    }

    // -------------------------------------------------------------------------
    // MAINTENANCE
    // -------------------------------------------------------------------------

    async fn open_maintenance(&self, plan: &MaintenanceOpenPlan) -> StoreResult<MaintenanceLog> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE vehicles SET status = 'IN_SHOP', updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = $3
            "#,
        )
        .bind(plan.vehicle_id)
        .bind(plan.organization_id)
        .bind(plan.expected_vehicle_status)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            return Err(StoreError::stale(
                "Vehicle",
                plan.vehicle_id,
                plan.expected_vehicle_status,
            ));
        }

        let log = sqlx::query_as::<_, MaintenanceLog>(
            r#"
            INSERT INTO maintenance_logs
                (id, organization_id, vehicle_id, issue_description, service_date, cost, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'OPEN')
            RETURNING *
            "#,
        )
        .bind(plan.log_id)
        .bind(plan.organization_id)
        .bind(plan.vehicle_id)
        .bind(&plan.issue_description)
        .bind(plan.service_date)
        .bind(plan.cost)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::record_db_query("transaction", start.elapsed().as_secs_f64());

        Ok(log)
    }

    async fn start_maintenance(
        &self,
        organization_id: Uuid,
        log_id: Uuid,
    ) -> StoreResult<MaintenanceLog> {
        let log = sqlx::query_as::<_, MaintenanceLog>(
            r#"
            UPDATE maintenance_logs SET status = 'IN_PROGRESS', updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = 'OPEN'
            RETURNING *
            "#,
        )
        .bind(log_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::stale("Maintenance log", log_id, MaintenanceStatus::Open))?;

        Ok(log)
    }

    async fn close_maintenance(
        &self,
        plan: &MaintenanceClosePlan,
    ) -> StoreResult<MaintenanceCloseRecord> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let log = sqlx::query_as::<_, MaintenanceLog>(
            r#"
            UPDATE maintenance_logs SET status = 'CLOSED', closed_at = $4, updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = $3
            RETURNING *
            "#,
        )
        .bind(plan.log_id)
        .bind(plan.organization_id)
        .bind(plan.expected_log_status)
        .bind(plan.closed_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            StoreError::stale("Maintenance log", plan.log_id, plan.expected_log_status)
        })?;

        let mut vehicle_released = false;
        if plan.release_vehicle {
            let released = sqlx::query(
                r#"
                UPDATE vehicles SET status = 'AVAILABLE', updated_at = NOW()
                WHERE id = $1 AND organization_id = $2 AND status = 'IN_SHOP'
                "#,
            )
            .bind(plan.vehicle_id)
            .bind(plan.organization_id)
            .execute(&mut *tx)
            .await?;
            vehicle_released = released.rows_affected() > 0;
        }

        tx.commit().await?;
        metrics::record_db_query("transaction", start.elapsed().as_secs_f64());

        Ok(MaintenanceCloseRecord {
            log,
            vehicle_released,
        })
    }

    // -------------------------------------------------------------------------
    // VEHICLES & DRIVERS
    // -------------------------------------------------------------------------

    async fn set_vehicle_status(
        &self,
        organization_id: Uuid,
        vehicle_id: Uuid,
        expected: VehicleStatus,
        target: VehicleStatus,
    ) -> StoreResult<Vehicle> {
        let vehicle = sqlx::query_as::<_, Vehicle>(
            r#"
            UPDATE vehicles SET status = $4, updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = $3
            RETURNING *
            "#,
        )
        .bind(vehicle_id)
        .bind(organization_id)
        .bind(expected)
        .bind(target)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::stale("Vehicle", vehicle_id, expected))?;

        Ok(vehicle)
    }

    async fn update_driver(
        &self,
        organization_id: Uuid,
        driver_id: Uuid,
        changes: &DriverChanges,
    ) -> StoreResult<Option<Driver>> {
        let driver = sqlx::query_as::<_, Driver>(
            r#"
            UPDATE drivers
            SET license_number = COALESCE($3, license_number),
                license_expiry = COALESCE($4, license_expiry),
                duty_status = COALESCE($5, duty_status),
                safety_score = COALESCE($6, safety_score),
                updated_at = NOW()
            WHERE id = $1 AND organization_id = $2
            RETURNING *
            "#,
        )
        .bind(driver_id)
        .bind(organization_id)
        .bind(&changes.license_number)
        .bind(changes.license_expiry)
        .bind(changes.duty_status)
        .bind(changes.safety_score)
        .fetch_optional(&self.pool)
        .await?;

        Ok(driver)
    }

    async fn recompute_completion_rate(
        &self,
        organization_id: Uuid,
        driver_id: Uuid,
    ) -> StoreResult<Option<f64>> {
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let rate = refresh_completion_rate(&mut *tx, organization_id, driver_id).await?;
        if rate.is_none() {
            warn!(driver_id = %driver_id, "Completion rate requested for unknown driver");
            return Ok(None);
        }

        tx.commit().await?;
        metrics::record_db_query("transaction", start.elapsed().as_secs_f64());

        Ok(rate)
    }
}
