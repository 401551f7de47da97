// =============================================================================
// IN-MEMORY STORE (tests)
// =============================================================================
// `FleetStore` over HashMaps behind one tokio Mutex. Each lifecycle event
// works on a copy of the tables and swaps it in only on success, so a stale
// guard leaves nothing behind, same as a rolled-back transaction.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::lifecycle;
use crate::models::{
    Driver, DutyStatus, Expense, ExpenseStatus, MaintenanceLog, MaintenanceStatus, Trip, TripStatus,
    Vehicle, VehicleStatus,
};
use crate::store::{
    CancellationPlan, CancellationRecord, CompletionPlan, CompletionRecord, DispatchPlan,
    DispatchRecord, DriverChanges, FleetStore, MaintenanceClosePlan, MaintenanceCloseRecord,
    MaintenanceOpenPlan, StoreError, StoreResult,
};

#[derive(Clone, Default)]
struct Tables {
    vehicles: HashMap<Uuid, Vehicle>,
    drivers: HashMap<Uuid, Driver>,
    trips: HashMap<Uuid, Trip>,
    expenses: Vec<Expense>,
    maintenance: HashMap<Uuid, MaintenanceLog>,
}

impl Tables {
    fn vehicle_mut(&mut self, organization_id: Uuid, id: Uuid) -> Option<&mut Vehicle> {
        self.vehicles
            .get_mut(&id)
            .filter(|v| v.organization_id == organization_id)
    }

    fn driver_mut(&mut self, organization_id: Uuid, id: Uuid) -> Option<&mut Driver> {
        self.drivers
            .get_mut(&id)
            .filter(|d| d.organization_id == organization_id)
    }

    fn trip_mut(&mut self, organization_id: Uuid, id: Uuid) -> Option<&mut Trip> {
        self.trips
            .get_mut(&id)
            .filter(|t| t.organization_id == organization_id)
    }

    fn log_mut(&mut self, organization_id: Uuid, id: Uuid) -> Option<&mut MaintenanceLog> {
        self.maintenance
            .get_mut(&id)
            .filter(|l| l.organization_id == organization_id)
    }

    fn refresh_completion_rate(&mut self, organization_id: Uuid, driver_id: Uuid) -> Option<f64> {
        let (completed, total) = self
            .trips
            .values()
            .filter(|t| t.driver_id == driver_id && t.organization_id == organization_id)
            .fold((0, 0), |(completed, total), t| {
                let done = i64::from(t.status == TripStatus::Completed);
                (completed + done, total + 1)
            });
        let rate = lifecycle::completion_rate(completed, total);

        let driver = self.driver_mut(organization_id, driver_id)?;
        driver.completion_rate = rate;
        driver.updated_at = Utc::now();
        Some(rate)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub async fn insert_vehicle(&self, vehicle: Vehicle) {
        self.tables.lock().await.vehicles.insert(vehicle.id, vehicle);
    }

    pub async fn insert_driver(&self, driver: Driver) {
        self.tables.lock().await.drivers.insert(driver.id, driver);
    }

    pub async fn vehicle(&self, id: Uuid) -> Option<Vehicle> {
        self.tables.lock().await.vehicles.get(&id).cloned()
    }

    pub async fn driver(&self, id: Uuid) -> Option<Driver> {
        self.tables.lock().await.drivers.get(&id).cloned()
    }

    pub async fn trip_count(&self) -> usize {
        self.tables.lock().await.trips.len()
    }

    pub async fn dispatched_trips_for_vehicle(&self, vehicle_id: Uuid) -> usize {
        self.tables
            .lock()
            .await
            .trips
            .values()
            .filter(|t| t.vehicle_id == vehicle_id && t.status == TripStatus::Dispatched)
            .count()
    }

    pub async fn expenses(&self) -> Vec<Expense> {
        self.tables.lock().await.expenses.clone()
    }

    pub async fn maintenance_count(&self) -> usize {
        self.tables.lock().await.maintenance.len()
    }

    /// Overwrite a vehicle status behind the coordinator's back.
    pub async fn force_vehicle_status(&self, id: Uuid, status: VehicleStatus) {
        if let Some(vehicle) = self.tables.lock().await.vehicles.get_mut(&id) {
            vehicle.status = status;
        }
    }

    pub async fn remove_driver(&self, id: Uuid) {
        self.tables.lock().await.drivers.remove(&id);
    }

    async fn transact<T, F>(&self, apply: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Tables) -> StoreResult<T> + Send,
        T: Send,
    {
        let mut tables = self.tables.lock().await;
        let mut working = tables.clone();
        let out = apply(&mut working)?;
        *tables = working;
        Ok(out)
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn find_vehicle(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Vehicle>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .vehicles
            .get(&id)
            .filter(|v| v.organization_id == organization_id)
            .cloned())
    }

    async fn find_driver(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Driver>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .drivers
            .get(&id)
            .filter(|d| d.organization_id == organization_id)
            .cloned())
    }

    async fn find_trip(&self, organization_id: Uuid, id: Uuid) -> StoreResult<Option<Trip>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .trips
            .get(&id)
            .filter(|t| t.organization_id == organization_id)
            .cloned())
    }

    async fn find_maintenance_log(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<MaintenanceLog>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .maintenance
            .get(&id)
            .filter(|l| l.organization_id == organization_id)
            .cloned())
    }

    async fn dispatch_trip(&self, plan: &DispatchPlan) -> StoreResult<DispatchRecord> {
        self.transact(|t| {
            let org = plan.organization_id;

            let vehicle = t
                .vehicle_mut(org, plan.vehicle_id)
                .filter(|v| v.status == VehicleStatus::Available)
                .ok_or_else(|| StoreError::stale("Vehicle", plan.vehicle_id, VehicleStatus::Available))?;
            vehicle.status = VehicleStatus::OnTrip;
            vehicle.updated_at = plan.dispatched_at;
            let vehicle = vehicle.clone();

            let driver = t
                .driver_mut(org, plan.driver_id)
                .filter(|d| d.duty_status == DutyStatus::OnDuty)
                .ok_or_else(|| StoreError::stale("Driver", plan.driver_id, DutyStatus::OnDuty))?;
            driver.updated_at = plan.dispatched_at;
            let driver = driver.clone();

            let trip = Trip {
                id: plan.trip_id,
                organization_id: org,
                vehicle_id: plan.vehicle_id,
                driver_id: plan.driver_id,
                cargo_weight_kg: plan.cargo_weight_kg,
                origin_address: plan.origin_address.clone(),
                destination_address: plan.destination_address.clone(),
                estimated_fuel_cost: plan.estimated_fuel_cost,
                start_odometer_km: plan.start_odometer_km,
                end_odometer_km: None,
                distance_km: None,
                revenue: plan.revenue,
                status: TripStatus::Dispatched,
                dispatched_at: plan.dispatched_at,
                completed_at: None,
                cancelled_at: None,
                created_at: plan.dispatched_at,
                updated_at: plan.dispatched_at,
            };
            t.trips.insert(trip.id, trip.clone());

            Ok(DispatchRecord {
                trip,
                vehicle,
                driver,
            })
        })
        .await
    }

    async fn complete_trip(&self, plan: &CompletionPlan) -> StoreResult<CompletionRecord> {
        self.transact(|t| {
            let org = plan.organization_id;
            let now = plan.completed_at;

            let trip = t
                .trip_mut(org, plan.trip_id)
                .filter(|trip| trip.status == TripStatus::Dispatched)
                .ok_or_else(|| StoreError::stale("Trip", plan.trip_id, TripStatus::Dispatched))?;
            trip.status = TripStatus::Completed;
            trip.end_odometer_km = Some(plan.end_odometer_km);
            trip.distance_km = Some(plan.end_odometer_km - trip.start_odometer_km);
            trip.completed_at = Some(now);
            trip.updated_at = now;
            let trip = trip.clone();

            let vehicle = t
                .vehicle_mut(org, plan.vehicle_id)
                .ok_or_else(|| StoreError::missing("Vehicle", plan.vehicle_id))?;
            let vehicle_released = plan.release_vehicle && vehicle.status == VehicleStatus::OnTrip;
            if vehicle_released {
                vehicle.status = VehicleStatus::Available;
            }
            vehicle.odometer_km = lifecycle::ratchet_odometer(vehicle.odometer_km, plan.end_odometer_km);
            vehicle.updated_at = now;
            let vehicle = vehicle.clone();

            let driver = t
                .driver_mut(org, plan.driver_id)
                .ok_or_else(|| StoreError::missing("Driver", plan.driver_id))?;
            driver.duty_status = DutyStatus::OffDuty;
            driver.updated_at = now;
            t.refresh_completion_rate(org, plan.driver_id);
            let driver = t.drivers[&plan.driver_id].clone();

            let expense = Expense {
                id: plan.expense_id,
                organization_id: org,
                vehicle_id: plan.vehicle_id,
                driver_id: plan.driver_id,
                trip_id: Some(plan.trip_id),
                fuel_liters: 0.0,
                fuel_cost: plan.estimated_fuel_cost,
                misc_cost: 0.0,
                total_cost: plan.estimated_fuel_cost,
                expense_date: now,
                status: ExpenseStatus::Recorded,
                created_at: now,
            };
            t.expenses.push(expense.clone());

            Ok(CompletionRecord {
                trip,
                vehicle,
                vehicle_released,
                driver,
                expense,
            })
        })
        .await
    }

    async fn cancel_trip(&self, plan: &CancellationPlan) -> StoreResult<CancellationRecord> {
        self.transact(|t| {
            let org = plan.organization_id;
            let now = plan.cancelled_at;

            let trip = t
                .trip_mut(org, plan.trip_id)
                .filter(|trip| trip.status == plan.expected_trip_status)
                .ok_or_else(|| StoreError::stale("Trip", plan.trip_id, plan.expected_trip_status))?;
            trip.status = TripStatus::Cancelled;
            trip.cancelled_at = Some(now);
            trip.updated_at = now;
            let trip = trip.clone();

            let mut vehicle_released = false;
            if plan.release_vehicle {
                if let Some(vehicle) = t
                    .vehicle_mut(org, plan.vehicle_id)
                    .filter(|v| v.status == VehicleStatus::OnTrip)
                {
                    vehicle.status = VehicleStatus::Available;
                    vehicle.updated_at = now;
                    vehicle_released = true;
                }
            }

            let driver = t
                .driver_mut(org, plan.driver_id)
                .ok_or_else(|| StoreError::missing("Driver", plan.driver_id))?;
            driver.duty_status = DutyStatus::OffDuty;
            driver.updated_at = now;

            Ok(CancellationRecord {
                trip,
                vehicle_released,
            })
        })
        .await
    }

    async fn open_maintenance(&self, plan: &MaintenanceOpenPlan) -> StoreResult<MaintenanceLog> {
        self.transact(|t| {
            let org = plan.organization_id;
            let now = Utc::now();

            let vehicle = t
                .vehicle_mut(org, plan.vehicle_id)
                .filter(|v| v.status == plan.expected_vehicle_status)
                .ok_or_else(|| {
                    StoreError::stale("Vehicle", plan.vehicle_id, plan.expected_vehicle_status)
                })?;
            vehicle.status = VehicleStatus::InShop;
            vehicle.updated_at = now;

            let log = MaintenanceLog {
                id: plan.log_id,
                organization_id: org,
                vehicle_id: plan.vehicle_id,
                issue_description: plan.issue_description.clone(),
                service_date: plan.service_date,
                cost: plan.cost,
                status: MaintenanceStatus::Open,
                closed_at: None,
                created_at: now,
                updated_at: now,
            };
            t.maintenance.insert(log.id, log.clone());

            Ok(log)
        })
        .await
    }

    async fn start_maintenance(
        &self,
        organization_id: Uuid,
        log_id: Uuid,
    ) -> StoreResult<MaintenanceLog> {
        self.transact(|t| {
            let log = t
                .log_mut(organization_id, log_id)
                .filter(|l| l.status == MaintenanceStatus::Open)
                .ok_or_else(|| StoreError::stale("Maintenance log", log_id, MaintenanceStatus::Open))?;
            log.status = MaintenanceStatus::InProgress;
            log.updated_at = Utc::now();
            Ok(log.clone())
        })
        .await
    }

    async fn close_maintenance(
        &self,
        plan: &MaintenanceClosePlan,
    ) -> StoreResult<MaintenanceCloseRecord> {
        self.transact(|t| {
            let org = plan.organization_id;
            let now = plan.closed_at;

            let log = t
                .log_mut(org, plan.log_id)
                .filter(|l| l.status == plan.expected_log_status)
                .ok_or_else(|| {
                    StoreError::stale("Maintenance log", plan.log_id, plan.expected_log_status)
                })?;
            log.status = MaintenanceStatus::Closed;
            log.closed_at = Some(now);
            log.updated_at = now;
            let log = log.clone();

            let mut vehicle_released = false;
            if plan.release_vehicle {
                if let Some(vehicle) = t
                    .vehicle_mut(org, plan.vehicle_id)
                    .filter(|v| v.status == VehicleStatus::InShop)
                {
                    vehicle.status = VehicleStatus::Available;
                    vehicle.updated_at = now;
                    vehicle_released = true;
                }
            }

            Ok(MaintenanceCloseRecord {
                log,
                vehicle_released,
            })
        })
        .await
    }

    async fn set_vehicle_status(
        &self,
        organization_id: Uuid,
        vehicle_id: Uuid,
        expected: VehicleStatus,
        target: VehicleStatus,
    ) -> StoreResult<Vehicle> {
        self.transact(|t| {
            let vehicle = t
                .vehicle_mut(organization_id, vehicle_id)
                .filter(|v| v.status == expected)
                .ok_or_else(|| StoreError::stale("Vehicle", vehicle_id, expected))?;
            vehicle.status = target;
            vehicle.updated_at = Utc::now();
            Ok(vehicle.clone())
        })
        .await
    }

    async fn update_driver(
        &self,
        organization_id: Uuid,
        driver_id: Uuid,
        changes: &DriverChanges,
    ) -> StoreResult<Option<Driver>> {
        self.transact(|t| {
            let Some(driver) = t.driver_mut(organization_id, driver_id) else {
                return Ok(None);
            };
            if let Some(license_number) = &changes.license_number {
                driver.license_number = license_number.clone();
            }
            if let Some(expiry) = changes.license_expiry {
                driver.license_expiry = expiry;
            }
            if let Some(duty_status) = changes.duty_status {
                driver.duty_status = duty_status;
            }
            if let Some(score) = changes.safety_score {
                driver.safety_score = score;
            }
            driver.updated_at = Utc::now();
            Ok(Some(driver.clone()))
        })
        .await
    }

    async fn recompute_completion_rate(
        &self,
        organization_id: Uuid,
        driver_id: Uuid,
    ) -> StoreResult<Option<f64>> {
        self.transact(|t| Ok(t.refresh_completion_rate(organization_id, driver_id)))
            .await
    }
}
