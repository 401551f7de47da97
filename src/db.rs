// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL access: connection pool, schema migrations, listings and the
// single-statement create/review operations.
//
// The multi-row lifecycle events (dispatch, completion, maintenance, ...) live
// in db_store.rs as the `FleetStore` implementation for `Database`.
//
// Every query filters on organization_id. A row owned by another tenant is
// reported exactly like a missing row.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::lifecycle;
use crate::models::{
    Complaint, ComplaintStatus, CreateComplaintRequest, CreateDriverRequest, CreateExpenseRequest,
    CreateVehicleRequest, Driver, DutyStatus, Expense, ExpenseStatus, MaintenanceLog,
    MaintenanceStatus, ReviewComplaintRequest, Trip, TripStatus, Vehicle, VehicleStatus,
};

// -----------------------------------------------------------------------------
// PAGINATION
// -----------------------------------------------------------------------------

/// A validated page window (1-indexed page, 1..=100 rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub per_page: i64,
}

impl Page {
    pub const MAX_PER_PAGE: i64 = 100;

    pub fn new(page: i64, per_page: i64) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.per_page
    }
}

/// SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    /// SQLx PostgreSQL connection pool
    pub(crate) pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    /// * `max_connections` - Upper bound on pooled connections
    ///
    /// # Returns
    /// * `Ok(Database)` - Connected database instance
    /// * `Err` - Connection failed
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create enum types, tables and indexes. Idempotent.
    pub async fn run_migrations(&self) -> Result<()> {
        // CREATE TYPE has no IF NOT EXISTS
        let enum_types = [
            ("vehicle_status", "'AVAILABLE', 'ON_TRIP', 'IN_SHOP', 'OUT_OF_SERVICE'"),
            ("duty_status", "'ON_DUTY', 'OFF_DUTY', 'SUSPENDED'"),
            ("trip_status", "'DISPATCHED', 'COMPLETED', 'CANCELLED'"),
            ("maintenance_status", "'OPEN', 'IN_PROGRESS', 'CLOSED'"),
            ("expense_status", "'RECORDED', 'APPROVED', 'REJECTED'"),
            ("complaint_severity", "'LOW', 'MEDIUM', 'HIGH', 'CRITICAL'"),
            ("complaint_status", "'OPEN', 'UNDER_REVIEW', 'RESOLVED', 'DISMISSED'"),
        ];
        for (name, labels) in enum_types {
            let sql = format!(
                "DO $$ BEGIN CREATE TYPE {name} AS ENUM ({labels}); \
                 EXCEPTION WHEN duplicate_object THEN null; END $$;"
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create enum type {}", name))?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vehicles (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL,
                license_plate VARCHAR(32) UNIQUE NOT NULL,
                model VARCHAR(255) NOT NULL,
                max_capacity_kg DOUBLE PRECISION NOT NULL,
                odometer_km DOUBLE PRECISION NOT NULL DEFAULT 0,
                acquisition_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                status vehicle_status NOT NULL DEFAULT 'AVAILABLE',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT non_negative_capacity CHECK (max_capacity_kg >= 0),
                CONSTRAINT non_negative_odometer CHECK (odometer_km >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create vehicles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drivers (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL,
                user_id UUID UNIQUE NOT NULL,
                full_name VARCHAR(255) NOT NULL,
                license_number VARCHAR(64) NOT NULL,
                license_expiry DATE NOT NULL,
                duty_status duty_status NOT NULL DEFAULT 'OFF_DUTY',
                safety_score DOUBLE PRECISION NOT NULL DEFAULT 100,
                completion_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
                complaint_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT safety_score_range CHECK (safety_score BETWEEN 0 AND 100)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create drivers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trips (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL,
                vehicle_id UUID NOT NULL REFERENCES vehicles(id),
                driver_id UUID NOT NULL REFERENCES drivers(id),
                cargo_weight_kg DOUBLE PRECISION NOT NULL,
                origin_address TEXT NOT NULL,
                destination_address TEXT NOT NULL,
                estimated_fuel_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                start_odometer_km DOUBLE PRECISION NOT NULL,
                end_odometer_km DOUBLE PRECISION,
                distance_km DOUBLE PRECISION,
                revenue DOUBLE PRECISION NOT NULL DEFAULT 0,
                status trip_status NOT NULL DEFAULT 'DISPATCHED',
                dispatched_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ,
                cancelled_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create trips table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS expenses (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL,
                vehicle_id UUID NOT NULL REFERENCES vehicles(id),
                driver_id UUID NOT NULL REFERENCES drivers(id),
                trip_id UUID REFERENCES trips(id),
                fuel_liters DOUBLE PRECISION NOT NULL DEFAULT 0,
                fuel_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                misc_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                total_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                expense_date TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                status expense_status NOT NULL DEFAULT 'RECORDED',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create expenses table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS maintenance_logs (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL,
                vehicle_id UUID NOT NULL REFERENCES vehicles(id),
                issue_description TEXT NOT NULL,
                service_date DATE NOT NULL,
                cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                status maintenance_status NOT NULL DEFAULT 'OPEN',
                closed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create maintenance_logs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS complaints (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id UUID NOT NULL,
                reporter_id UUID NOT NULL,
                vehicle_id UUID REFERENCES vehicles(id),
                trip_id UUID REFERENCES trips(id),
                driver_id UUID REFERENCES drivers(id),
                severity complaint_severity NOT NULL DEFAULT 'LOW',
                description TEXT NOT NULL,
                status complaint_status NOT NULL DEFAULT 'OPEN',
                resolved_by UUID,
                resolution_notes TEXT,
                resolved_at TIMESTAMPTZ,
                deleted_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create complaints table")?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_vehicles_org_status ON vehicles(organization_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_drivers_org ON drivers(organization_id)",
            "CREATE INDEX IF NOT EXISTS idx_trips_org_status ON trips(organization_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_trips_driver ON trips(driver_id)",
            "CREATE INDEX IF NOT EXISTS idx_expenses_org ON expenses(organization_id)",
            "CREATE INDEX IF NOT EXISTS idx_maintenance_org_status ON maintenance_logs(organization_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_complaints_org ON complaints(organization_id) WHERE deleted_at IS NULL",
            // At most one DISPATCHED trip per vehicle
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_trips_vehicle_dispatched ON trips(vehicle_id) WHERE status = 'DISPATCHED'",
        ];
        for sql in indexes {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to run: {}", sql))?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // READ OPERATIONS
    // -------------------------------------------------------------------------
    // Status filters bind NULL for "any status".

    /// List vehicles, optionally filtered by status
    ///
    /// # Returns
    /// Tuple of (items, total_count)
    pub async fn list_vehicles(
        &self,
        organization_id: Uuid,
        status: Option<VehicleStatus>,
        page: Page,
    ) -> AppResult<(Vec<Vehicle>, i64)> {
        let items = sqlx::query_as::<_, Vehicle>(
            r#"
            SELECT * FROM vehicles
            WHERE organization_id = $1 AND ($2::vehicle_status IS NULL OR status = $2)
            ORDER BY license_plate ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(organization_id)
        .bind(status)
        .bind(page.per_page)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM vehicles WHERE organization_id = $1 AND ($2::vehicle_status IS NULL OR status = $2)",
        )
        .bind(organization_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total.0))
    }

    /// Vehicle counts per status across the whole fleet, for the gauge.
    pub async fn vehicle_counts_by_status(&self) -> AppResult<Vec<(VehicleStatus, i64)>> {
        let rows = sqlx::query_as::<_, (VehicleStatus, i64)>(
            "SELECT status, COUNT(*) FROM vehicles GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_drivers(
        &self,
        organization_id: Uuid,
        status: Option<DutyStatus>,
        page: Page,
    ) -> AppResult<(Vec<Driver>, i64)> {
        let items = sqlx::query_as::<_, Driver>(
            r#"
            SELECT * FROM drivers
            WHERE organization_id = $1 AND ($2::duty_status IS NULL OR duty_status = $2)
            ORDER BY full_name ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(organization_id)
        .bind(status)
        .bind(page.per_page)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM drivers WHERE organization_id = $1 AND ($2::duty_status IS NULL OR duty_status = $2)",
        )
        .bind(organization_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total.0))
    }

    /// List trips, newest dispatch first
    pub async fn list_trips(
        &self,
        organization_id: Uuid,
        status: Option<TripStatus>,
        page: Page,
    ) -> AppResult<(Vec<Trip>, i64)> {
        let items = sqlx::query_as::<_, Trip>(
            r#"
            SELECT * FROM trips
            WHERE organization_id = $1 AND ($2::trip_status IS NULL OR status = $2)
            ORDER BY dispatched_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(organization_id)
        .bind(status)
        .bind(page.per_page)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM trips WHERE organization_id = $1 AND ($2::trip_status IS NULL OR status = $2)",
        )
        .bind(organization_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total.0))
    }

    pub async fn list_maintenance_logs(
        &self,
        organization_id: Uuid,
        status: Option<MaintenanceStatus>,
        page: Page,
    ) -> AppResult<(Vec<MaintenanceLog>, i64)> {
        let items = sqlx::query_as::<_, MaintenanceLog>(
            r#"
            SELECT * FROM maintenance_logs
            WHERE organization_id = $1 AND ($2::maintenance_status IS NULL OR status = $2)
            ORDER BY service_date DESC, created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(organization_id)
        .bind(status)
        .bind(page.per_page)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM maintenance_logs WHERE organization_id = $1 AND ($2::maintenance_status IS NULL OR status = $2)",
        )
        .bind(organization_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total.0))
    }

    pub async fn list_expenses(
        &self,
        organization_id: Uuid,
        status: Option<ExpenseStatus>,
        page: Page,
    ) -> AppResult<(Vec<Expense>, i64)> {
        let items = sqlx::query_as::<_, Expense>(
            r#"
            SELECT * FROM expenses
            WHERE organization_id = $1 AND ($2::expense_status IS NULL OR status = $2)
            ORDER BY expense_date DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(organization_id)
        .bind(status)
        .bind(page.per_page)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM expenses WHERE organization_id = $1 AND ($2::expense_status IS NULL OR status = $2)",
        )
        .bind(organization_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total.0))
    }

    pub async fn get_expense(&self, organization_id: Uuid, id: Uuid) -> AppResult<Option<Expense>> {
        let expense = sqlx::query_as::<_, Expense>(
            "SELECT * FROM expenses WHERE id = $1 AND organization_id = $2",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(expense)
    }

    /// List complaints that have not been soft-deleted
    pub async fn list_complaints(
        &self,
        organization_id: Uuid,
        status: Option<ComplaintStatus>,
        page: Page,
    ) -> AppResult<(Vec<Complaint>, i64)> {
        let items = sqlx::query_as::<_, Complaint>(
            r#"
            SELECT * FROM complaints
            WHERE organization_id = $1 AND deleted_at IS NULL
              AND ($2::complaint_status IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(organization_id)
        .bind(status)
        .bind(page.per_page)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM complaints
            WHERE organization_id = $1 AND deleted_at IS NULL
              AND ($2::complaint_status IS NULL OR status = $2)
            "#,
        )
        .bind(organization_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((items, total.0))
    }

    pub async fn get_complaint(&self, organization_id: Uuid, id: Uuid) -> AppResult<Option<Complaint>> {
        let complaint = sqlx::query_as::<_, Complaint>(
            "SELECT * FROM complaints WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(complaint)
    }

    // -------------------------------------------------------------------------
    // WRITE OPERATIONS
    // -------------------------------------------------------------------------

    /// Register a vehicle as AVAILABLE
    ///
    /// # Returns
    /// * `Err(AppError::Conflict)` - license plate already registered
    pub async fn create_vehicle(
        &self,
        organization_id: Uuid,
        req: &CreateVehicleRequest,
    ) -> AppResult<Vehicle> {
        sqlx::query_as::<_, Vehicle>(
            r#"
            INSERT INTO vehicles
                (id, organization_id, license_plate, model, max_capacity_kg,
                 odometer_km, acquisition_cost, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'AVAILABLE')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(req.license_plate.trim())
        .bind(&req.model)
        .bind(req.max_capacity_kg)
        .bind(req.odometer_km)
        .bind(req.acquisition_cost)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!(
                    "Vehicle with license plate {} already exists",
                    req.license_plate.trim()
                ))
            } else {
                e.into()
            }
        })
    }

    /// Register a driver profile; an already expired license starts SUSPENDED
    pub async fn create_driver(
        &self,
        organization_id: Uuid,
        req: &CreateDriverRequest,
        today: NaiveDate,
    ) -> AppResult<Driver> {
        let duty_status = if lifecycle::license_is_valid(req.license_expiry, today) {
            DutyStatus::OffDuty
        } else {
            DutyStatus::Suspended
        };

        sqlx::query_as::<_, Driver>(
            r#"
            INSERT INTO drivers
                (id, organization_id, user_id, full_name, license_number,
                 license_expiry, duty_status, safety_score, completion_rate)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(req.user_id)
        .bind(&req.full_name)
        .bind(&req.license_number)
        .bind(req.license_expiry)
        .bind(duty_status)
        .bind(req.safety_score)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!("User {} already has a driver profile", req.user_id))
            } else {
                e.into()
            }
        })
    }

    /// Record an expense; the vehicle, driver and trip must belong to the
    /// organization.
    pub async fn create_expense(
        &self,
        organization_id: Uuid,
        req: &CreateExpenseRequest,
    ) -> AppResult<Expense> {
        self.require_row("vehicles", "Vehicle", organization_id, req.vehicle_id)
            .await?;
        self.require_row("drivers", "Driver", organization_id, req.driver_id)
            .await?;
        if let Some(trip_id) = req.trip_id {
            self.require_row("trips", "Trip", organization_id, trip_id).await?;
        }

        let expense = sqlx::query_as::<_, Expense>(
            r#"
            INSERT INTO expenses
                (id, organization_id, vehicle_id, driver_id, trip_id, fuel_liters,
                 fuel_cost, misc_cost, total_cost, expense_date, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'RECORDED')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(req.vehicle_id)
        .bind(req.driver_id)
        .bind(req.trip_id)
        .bind(req.fuel_liters)
        .bind(req.fuel_cost)
        .bind(req.misc_cost)
        .bind(req.total_cost())
        .bind(req.expense_date.unwrap_or_else(Utc::now))
        .fetch_one(&self.pool)
        .await?;

        Ok(expense)
    }

    /// File a complaint. A complaint against a driver bumps their
    /// complaint_count in the same transaction.
    pub async fn create_complaint(
        &self,
        organization_id: Uuid,
        reporter_id: Uuid,
        req: &CreateComplaintRequest,
    ) -> AppResult<Complaint> {
        if let Some(vehicle_id) = req.vehicle_id {
            self.require_row("vehicles", "Vehicle", organization_id, vehicle_id)
                .await?;
        }
        if let Some(trip_id) = req.trip_id {
            self.require_row("trips", "Trip", organization_id, trip_id).await?;
        }

        let mut tx = self.pool.begin().await?;

        if let Some(driver_id) = req.driver_id {
            let bumped = sqlx::query(
                r#"
                UPDATE drivers
                SET complaint_count = complaint_count + 1, updated_at = NOW()
                WHERE id = $1 AND organization_id = $2
                "#,
            )
            .bind(driver_id)
            .bind(organization_id)
            .execute(&mut *tx)
            .await?;

            if bumped.rows_affected() == 0 {
                return Err(AppError::NotFound(format!("Driver not found: {}", driver_id)));
            }
        }

        let complaint = sqlx::query_as::<_, Complaint>(
            r#"
            INSERT INTO complaints
                (id, organization_id, reporter_id, vehicle_id, trip_id, driver_id,
                 severity, description, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'OPEN')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(reporter_id)
        .bind(req.vehicle_id)
        .bind(req.trip_id)
        .bind(req.driver_id)
        .bind(req.severity)
        .bind(&req.description)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(complaint)
    }

    /// Move a complaint through review. Resolver, notes and resolved_at are
    /// stamped only when entering RESOLVED or DISMISSED.
    pub async fn review_complaint(
        &self,
        organization_id: Uuid,
        id: Uuid,
        reviewer_id: Uuid,
        req: &ReviewComplaintRequest,
    ) -> AppResult<Complaint> {
        let current = self
            .get_complaint(organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Complaint not found: {}", id)))?;

        lifecycle::check_complaint_transition(current.status, req.status)?;

        let closing = req.status.is_closing();
        sqlx::query_as::<_, Complaint>(
            r#"
            UPDATE complaints
            SET status = $4,
                resolved_by = CASE WHEN $5 THEN $6 ELSE resolved_by END,
                resolution_notes = CASE WHEN $5 THEN $7 ELSE resolution_notes END,
                resolved_at = CASE WHEN $5 THEN NOW() ELSE resolved_at END,
                updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = $3 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(organization_id)
        .bind(current.status)
        .bind(req.status)
        .bind(closing)
        .bind(reviewer_id)
        .bind(&req.resolution_notes)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AppError::InvalidState(format!("Complaint {} is no longer {}", id, current.status))
        })
    }

    /// Soft-delete a complaint. Deleted complaints disappear from all reads.
    pub async fn soft_delete_complaint(&self, organization_id: Uuid, id: Uuid) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE complaints
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(organization_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Complaint not found: {}", id)));
        }

        Ok(())
    }

    /// NotFound unless `table` has row `id` in the organization.
    /// `table` is always one of this module's literals.
    async fn require_row(
        &self,
        table: &str,
        entity: &str,
        organization_id: Uuid,
        id: Uuid,
    ) -> AppResult<()> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE id = $1 AND organization_id = $2)",
            table
        );
        let exists: (bool,) = sqlx::query_as(&sql)
            .bind(id)
            .bind(organization_id)
            .fetch_one(&self.pool)
            .await?;

        if !exists.0 {
            return Err(AppError::NotFound(format!("{} not found: {}", entity, id)));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    /// Check if database connection is healthy
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
