// =============================================================================
// COORDINATOR MODULE
// =============================================================================
// The fleet lifecycle coordinator: trip dispatch, completion and cancellation,
// maintenance open/start/close, the manual service toggle, driver updates and
// the completion-rate recompute.
//
// Every command follows the same shape:
//   1. role gate (policy map)
//   2. load the entities, organization-scoped (missing => NotFound)
//   3. pure precondition checks from `lifecycle` (=> InvalidState)
//   4. one atomic store call whose writes are conditional on the states seen
//      in step 2 (lost race => InvalidState, never retried)
//   5. fire-and-forget lifecycle event
//
// Nothing is written before step 4, so a rejected command leaves no trace.
// =============================================================================

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::lifecycle;
use crate::models::{
    CompleteTripRequest, CompletionRateResponse, DispatchTripRequest, Driver, MaintenanceCloseResponse,
    MaintenanceLog, OpenMaintenanceRequest, Trip, TripCancellationResponse, TripCompletionResponse,
    TripDetail, UpdateDriverRequest, Vehicle, VehicleStatus,
};
use crate::notify::{LifecycleEvent, Notifier};
use crate::policy::{self, Actor, Operation, Role};
use crate::store::{
    CancellationPlan, CompletionPlan, DispatchPlan, DriverChanges, FleetStore,
    MaintenanceClosePlan, MaintenanceOpenPlan,
};

pub struct FleetCoordinator<S> {
    store: S,
    notifier: Notifier,
}

impl<S: FleetStore> FleetCoordinator<S> {
    pub fn new(store: S, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    // -------------------------------------------------------------------------
    // ORGANIZATION-SCOPED LOADERS
    // -------------------------------------------------------------------------

    async fn load_vehicle(&self, organization_id: Uuid, id: Uuid) -> AppResult<Vehicle> {
        self.store
            .find_vehicle(organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Vehicle not found: {}", id)))
    }

    async fn load_driver(&self, organization_id: Uuid, id: Uuid) -> AppResult<Driver> {
        self.store
            .find_driver(organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Driver not found: {}", id)))
    }

    async fn load_trip(&self, organization_id: Uuid, id: Uuid) -> AppResult<Trip> {
        self.store
            .find_trip(organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Trip not found: {}", id)))
    }

    async fn load_maintenance_log(&self, organization_id: Uuid, id: Uuid) -> AppResult<MaintenanceLog> {
        self.store
            .find_maintenance_log(organization_id, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Maintenance log not found: {}", id)))
    }

    // =========================================================================
    // TRIP DISPATCH
    // =========================================================================
    /// Assign an AVAILABLE vehicle and an ON_DUTY driver to a new trip.
    pub async fn dispatch_trip(
        &self,
        actor: &Actor,
        request: DispatchTripRequest,
    ) -> AppResult<TripDetail> {
        policy::authorize(actor, Operation::DispatchTrip)?;
        request.validate()?;
        let org = actor.organization_id;

        let vehicle = self.load_vehicle(org, request.vehicle_id).await?;
        let driver = self.load_driver(org, request.driver_id).await?;
        lifecycle::check_dispatch(&vehicle, &driver, &request, Self::today())?;

        let plan = DispatchPlan {
            organization_id: org,
            trip_id: Uuid::new_v4(),
            vehicle_id: vehicle.id,
            driver_id: driver.id,
            cargo_weight_kg: request.cargo_weight_kg,
            origin_address: request.origin_address,
            destination_address: request.destination_address,
            estimated_fuel_cost: request.estimated_fuel_cost,
            start_odometer_km: request.start_odometer_km,
            revenue: request.revenue,
            dispatched_at: Utc::now(),
        };
        let record = self.store.dispatch_trip(&plan).await?;

        info!(
            trip_id = %record.trip.id,
            vehicle_id = %record.vehicle.id,
            driver_id = %record.driver.id,
            cargo_weight_kg = record.trip.cargo_weight_kg,
            "Trip dispatched"
        );
        self.notifier.publish(LifecycleEvent::TripDispatched {
            organization_id: org,
            trip_id: record.trip.id,
            vehicle_id: record.vehicle.id,
            driver_id: record.driver.id,
        });

        Ok(TripDetail {
            vehicle: (&record.vehicle).into(),
            driver: (&record.driver).into(),
            trip: record.trip,
        })
    }

    // =========================================================================
    // TRIP COMPLETION
    // =========================================================================
    /// Close a DISPATCHED trip: release the vehicle with its new odometer
    /// reading, take the driver off duty, refresh their completion rate and
    /// book the estimated fuel cost as an expense.
    pub async fn complete_trip(
        &self,
        actor: &Actor,
        trip_id: Uuid,
        request: CompleteTripRequest,
    ) -> AppResult<TripCompletionResponse> {
        policy::authorize(actor, Operation::CompleteTrip)?;
        request.validate()?;
        let org = actor.organization_id;

        let trip = self.load_trip(org, trip_id).await?;

        if actor.role == Role::Driver {
            let assigned = self.load_driver(org, trip.driver_id).await?;
            if assigned.user_id != actor.user_id {
                return Err(AppError::Forbidden(
                    "Drivers may only complete their own trips".to_string(),
                ));
            }
        }

        lifecycle::check_completion(&trip, request.end_odometer_km)?;

        let vehicle = self.load_vehicle(org, trip.vehicle_id).await?;
        let release_vehicle = vehicle.status == VehicleStatus::OnTrip;
        if !release_vehicle {
            warn!(
                trip_id = %trip.id,
                vehicle_id = %vehicle.id,
                vehicle_status = %vehicle.status,
                "Completing trip whose vehicle is not ON_TRIP; vehicle status left unchanged"
            );
        }

        let plan = CompletionPlan {
            organization_id: org,
            trip_id: trip.id,
            vehicle_id: trip.vehicle_id,
            release_vehicle,
            driver_id: trip.driver_id,
            end_odometer_km: request.end_odometer_km,
            estimated_fuel_cost: trip.estimated_fuel_cost,
            expense_id: Uuid::new_v4(),
            completed_at: Utc::now(),
        };
        let record = self.store.complete_trip(&plan).await?;

        if release_vehicle && !record.vehicle_released {
            warn!(
                trip_id = %trip.id,
                vehicle_id = %trip.vehicle_id,
                "Vehicle left ON_TRIP between read and completion; vehicle status left unchanged"
            );
        }
        let distance_km = record.trip.distance_km.unwrap_or_default();
        info!(
            trip_id = %record.trip.id,
            distance_km,
            odometer_km = record.vehicle.odometer_km,
            vehicle_released = record.vehicle_released,
            completion_rate = record.driver.completion_rate,
            expense_id = %record.expense.id,
            "Trip completed"
        );
        self.notifier.publish(LifecycleEvent::TripCompleted {
            organization_id: org,
            trip_id: record.trip.id,
            vehicle_id: record.vehicle.id,
            driver_id: record.driver.id,
            distance_km,
            expense_id: record.expense.id,
            vehicle_released: record.vehicle_released,
        });

        Ok(TripCompletionResponse {
            detail: TripDetail {
                vehicle: (&record.vehicle).into(),
                driver: (&record.driver).into(),
                trip: record.trip,
            },
            expense: record.expense,
            vehicle_released: record.vehicle_released,
        })
    }

    // =========================================================================
    // TRIP CANCELLATION
    // =========================================================================
    /// Cancel a DISPATCHED trip. The vehicle goes back to AVAILABLE only if
    /// it is still ON_TRIP; the driver goes OFF_DUTY regardless.
    pub async fn cancel_trip(
        &self,
        actor: &Actor,
        trip_id: Uuid,
    ) -> AppResult<TripCancellationResponse> {
        policy::authorize(actor, Operation::CancelTrip)?;
        let org = actor.organization_id;

        let trip = self.load_trip(org, trip_id).await?;
        lifecycle::check_cancellation(&trip)?;

        let vehicle = self.load_vehicle(org, trip.vehicle_id).await?;
        let release_vehicle = vehicle.status == VehicleStatus::OnTrip;
        if !release_vehicle {
            warn!(
                trip_id = %trip.id,
                vehicle_id = %vehicle.id,
                vehicle_status = %vehicle.status,
                "Cancelling trip whose vehicle is not ON_TRIP; vehicle status left unchanged"
            );
        }

        let plan = CancellationPlan {
            organization_id: org,
            trip_id: trip.id,
            expected_trip_status: trip.status,
            vehicle_id: trip.vehicle_id,
            release_vehicle,
            driver_id: trip.driver_id,
            cancelled_at: Utc::now(),
        };
        let record = self.store.cancel_trip(&plan).await?;

        if release_vehicle && !record.vehicle_released {
            warn!(
                trip_id = %trip.id,
                vehicle_id = %trip.vehicle_id,
                "Vehicle left ON_TRIP between read and cancel; vehicle status left unchanged"
            );
        }
        info!(trip_id = %record.trip.id, vehicle_released = record.vehicle_released, "Trip cancelled");
        self.notifier.publish(LifecycleEvent::TripCancelled {
            organization_id: org,
            trip_id: record.trip.id,
            vehicle_id: record.trip.vehicle_id,
            vehicle_released: record.vehicle_released,
        });

        Ok(TripCancellationResponse {
            trip: record.trip,
            vehicle_released: record.vehicle_released,
        })
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================
    /// Open a maintenance log and pull the vehicle into the shop.
    pub async fn open_maintenance(
        &self,
        actor: &Actor,
        request: OpenMaintenanceRequest,
    ) -> AppResult<MaintenanceLog> {
        policy::authorize(actor, Operation::OpenMaintenance)?;
        request.validate()?;
        let org = actor.organization_id;

        let vehicle = self.load_vehicle(org, request.vehicle_id).await?;
        lifecycle::check_maintenance_open(&vehicle)?;

        let plan = MaintenanceOpenPlan {
            organization_id: org,
            log_id: Uuid::new_v4(),
            vehicle_id: vehicle.id,
            expected_vehicle_status: vehicle.status,
            issue_description: request.issue_description,
            service_date: request.service_date,
            cost: request.cost,
        };
        let log = self.store.open_maintenance(&plan).await?;

        info!(
            maintenance_log_id = %log.id,
            vehicle_id = %log.vehicle_id,
            previous_status = %vehicle.status,
            "Maintenance opened"
        );
        self.notifier.publish(LifecycleEvent::MaintenanceOpened {
            organization_id: org,
            maintenance_log_id: log.id,
            vehicle_id: log.vehicle_id,
        });

        Ok(log)
    }

    /// Mark an OPEN maintenance log as IN_PROGRESS.
    pub async fn start_maintenance(&self, actor: &Actor, log_id: Uuid) -> AppResult<MaintenanceLog> {
        policy::authorize(actor, Operation::StartMaintenance)?;
        let org = actor.organization_id;

        let log = self.load_maintenance_log(org, log_id).await?;
        lifecycle::check_maintenance_start(&log)?;

        let log = self.store.start_maintenance(org, log.id).await?;
        info!(maintenance_log_id = %log.id, "Maintenance started");

        Ok(log)
    }

    /// Close a maintenance log. The vehicle goes back to AVAILABLE only if it
    /// is still IN_SHOP.
    pub async fn close_maintenance(
        &self,
        actor: &Actor,
        log_id: Uuid,
    ) -> AppResult<MaintenanceCloseResponse> {
        policy::authorize(actor, Operation::CloseMaintenance)?;
        let org = actor.organization_id;

        let log = self.load_maintenance_log(org, log_id).await?;
        lifecycle::check_maintenance_close(&log)?;

        let vehicle = self.load_vehicle(org, log.vehicle_id).await?;
        let release_vehicle = vehicle.status == VehicleStatus::InShop;
        if !release_vehicle {
            warn!(
                maintenance_log_id = %log.id,
                vehicle_id = %vehicle.id,
                vehicle_status = %vehicle.status,
                "Closing maintenance on a vehicle that is not IN_SHOP; vehicle status left unchanged"
            );
        }

        let plan = MaintenanceClosePlan {
            organization_id: org,
            log_id: log.id,
            expected_log_status: log.status,
            vehicle_id: log.vehicle_id,
            release_vehicle,
            closed_at: Utc::now(),
        };
        let record = self.store.close_maintenance(&plan).await?;

        if release_vehicle && !record.vehicle_released {
            warn!(
                maintenance_log_id = %log.id,
                vehicle_id = %log.vehicle_id,
                "Vehicle left IN_SHOP between read and close; vehicle status left unchanged"
            );
        }
        info!(
            maintenance_log_id = %record.log.id,
            vehicle_released = record.vehicle_released,
            "Maintenance closed"
        );
        self.notifier.publish(LifecycleEvent::MaintenanceClosed {
            organization_id: org,
            maintenance_log_id: record.log.id,
            vehicle_id: record.log.vehicle_id,
            vehicle_released: record.vehicle_released,
        });

        Ok(MaintenanceCloseResponse {
            log: record.log,
            vehicle_released: record.vehicle_released,
        })
    }

    // =========================================================================
    // MANUAL SERVICE TOGGLE
    // =========================================================================
    /// Take a vehicle out of service or bring it back. Not allowed mid-trip.
    pub async fn set_vehicle_service(
        &self,
        actor: &Actor,
        vehicle_id: Uuid,
        target: VehicleStatus,
    ) -> AppResult<Vehicle> {
        policy::authorize(actor, Operation::ToggleVehicleService)?;
        let org = actor.organization_id;

        let vehicle = self.load_vehicle(org, vehicle_id).await?;
        lifecycle::check_service_toggle(&vehicle, target)?;

        let updated = self
            .store
            .set_vehicle_status(org, vehicle.id, vehicle.status, target)
            .await?;

        info!(
            vehicle_id = %updated.id,
            from = %vehicle.status,
            to = %updated.status,
            "Vehicle service status changed"
        );
        self.notifier.publish(LifecycleEvent::VehicleServiceChanged {
            organization_id: org,
            vehicle_id: updated.id,
            status: updated.status,
        });

        Ok(updated)
    }

    // =========================================================================
    // DRIVER UPDATE
    // =========================================================================
    /// Patch license, duty and safety fields. A license expiry in the past
    /// suspends the driver, overriding any duty status in the same request.
    pub async fn update_driver(
        &self,
        actor: &Actor,
        driver_id: Uuid,
        request: UpdateDriverRequest,
    ) -> AppResult<Driver> {
        policy::authorize(actor, Operation::UpdateDriver)?;
        request.validate()?;
        let org = actor.organization_id;

        let current = self.load_driver(org, driver_id).await?;

        let duty_status =
            lifecycle::effective_duty_status(request.duty_status, request.license_expiry, Self::today());
        if duty_status != request.duty_status {
            info!(
                driver_id = %current.id,
                license_expiry = ?request.license_expiry,
                requested = ?request.duty_status,
                "License expiry is in the past; driver suspended"
            );
        }

        let changes = DriverChanges {
            license_number: request.license_number,
            license_expiry: request.license_expiry,
            duty_status,
            safety_score: request.safety_score,
        };
        let updated = self
            .store
            .update_driver(org, current.id, &changes)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Driver not found: {}", driver_id)))?;

        if updated.duty_status != current.duty_status {
            self.notifier.publish(LifecycleEvent::DriverDutyChanged {
                organization_id: org,
                driver_id: updated.id,
                duty_status: updated.duty_status,
            });
        }

        Ok(updated)
    }

    // =========================================================================
    // DERIVED STATISTICS
    // =========================================================================
    /// Recompute a driver's completion rate from their full trip history.
    pub async fn recompute_completion_rate(
        &self,
        actor: &Actor,
        driver_id: Uuid,
    ) -> AppResult<CompletionRateResponse> {
        policy::authorize(actor, Operation::RecomputeCompletionRate)?;

        let completion_rate = self
            .store
            .recompute_completion_rate(actor.organization_id, driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Driver not found: {}", driver_id)))?;

        info!(driver_id = %driver_id, completion_rate, "Completion rate recomputed");

        Ok(CompletionRateResponse {
            driver_id,
            completion_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::models::{DutyStatus, MaintenanceStatus, TripStatus};
    use crate::store::StoreError;
    use chrono::Duration;

    // -------------------------------------------------------------------------
    // FIXTURES
    // -------------------------------------------------------------------------

    struct Fleet {
        coordinator: FleetCoordinator<MemoryStore>,
        org: Uuid,
        manager: Actor,
        dispatcher: Actor,
    }

    impl Fleet {
        fn new() -> Self {
            let org = Uuid::new_v4();
            Self {
                coordinator: FleetCoordinator::new(MemoryStore::default(), Notifier::log_only()),
                org,
                manager: Actor::new(Uuid::new_v4(), Role::FleetManager, org),
                dispatcher: Actor::new(Uuid::new_v4(), Role::Dispatcher, org),
            }
        }

        fn store(&self) -> &MemoryStore {
            self.coordinator.store()
        }

        async fn vehicle(&self, status: VehicleStatus, odometer_km: f64, capacity_kg: f64) -> Vehicle {
            let vehicle = Vehicle {
                id: Uuid::new_v4(),
                organization_id: self.org,
                license_plate: format!("FL-{}", &Uuid::new_v4().simple().to_string()[..6]),
                model: "Box truck".to_string(),
                max_capacity_kg: capacity_kg,
                odometer_km,
                acquisition_cost: 40_000.0,
                status,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.store().insert_vehicle(vehicle.clone()).await;
            vehicle
        }

        async fn driver(&self, duty_status: DutyStatus) -> Driver {
            let driver = Driver {
                id: Uuid::new_v4(),
                organization_id: self.org,
                user_id: Uuid::new_v4(),
                full_name: "Sam Okafor".to_string(),
                license_number: "LIC-2041".to_string(),
                license_expiry: Utc::now().date_naive() + Duration::days(365),
                duty_status,
                safety_score: 92.0,
                completion_rate: 0.0,
                complaint_count: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.store().insert_driver(driver.clone()).await;
            driver
        }

        async fn current_vehicle(&self, id: Uuid) -> Vehicle {
            self.store().vehicle(id).await.expect("vehicle exists")
        }

        async fn current_driver(&self, id: Uuid) -> Driver {
            self.store().driver(id).await.expect("driver exists")
        }
    }

    fn dispatch_request(vehicle: &Vehicle, driver: &Driver, cargo: f64, start: f64) -> DispatchTripRequest {
        DispatchTripRequest {
            vehicle_id: vehicle.id,
            driver_id: driver.id,
            cargo_weight_kg: cargo,
            origin_address: "North depot".to_string(),
            destination_address: "Riverside market".to_string(),
            estimated_fuel_cost: 120.5,
            start_odometer_km: start,
            revenue: 800.0,
        }
    }

    fn invalid_state(err: AppError) -> String {
        match err {
            AppError::InvalidState(msg) => msg,
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------------
    // DISPATCH
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn dispatch_assigns_vehicle_and_driver() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;

        let detail = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 400.0, 1000.0))
            .await
            .unwrap();

        assert_eq!(detail.trip.status, TripStatus::Dispatched);
        assert_eq!(detail.vehicle.status, VehicleStatus::OnTrip);
        assert_eq!(detail.driver.duty_status, DutyStatus::OnDuty);
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::OnTrip);
        assert_eq!(fleet.current_driver(d.id).await.duty_status, DutyStatus::OnDuty);
    }

    #[tokio::test]
    async fn second_dispatch_on_busy_vehicle_is_rejected() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d1 = fleet.driver(DutyStatus::OnDuty).await;
        let d2 = fleet.driver(DutyStatus::OnDuty).await;

        fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d1, 400.0, 1000.0))
            .await
            .unwrap();
        let err = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d2, 100.0, 1000.0))
            .await
            .unwrap_err();

        assert_eq!(invalid_state(err), "Vehicle is ON_TRIP and cannot be assigned");
        assert_eq!(fleet.store().dispatched_trips_for_vehicle(v.id).await, 1);
    }

    #[tokio::test]
    async fn overweight_cargo_is_rejected_before_any_write() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;

        let err = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 600.0, 1000.0))
            .await
            .unwrap_err();

        assert!(invalid_state(err).contains("exceeds vehicle capacity"));
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::Available);
        assert_eq!(fleet.store().trip_count().await, 0);
    }

    #[tokio::test]
    async fn dispatch_checks_existence_before_state() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::OnTrip, 1000.0, 500.0).await;
        let ghost = Driver {
            id: Uuid::new_v4(),
            ..fleet.driver(DutyStatus::OnDuty).await
        };

        let err = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &ghost, 10.0, 1000.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn other_tenants_entities_are_not_found() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let outsider = Actor::new(Uuid::new_v4(), Role::Dispatcher, Uuid::new_v4());

        let err = fleet
            .coordinator
            .dispatch_trip(&outsider, dispatch_request(&v, &d, 10.0, 1000.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn drivers_cannot_dispatch() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let as_driver = Actor::new(d.user_id, Role::Driver, fleet.org);

        let err = fleet
            .coordinator
            .dispatch_trip(&as_driver, dispatch_request(&v, &d, 10.0, 1000.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn concurrent_dispatches_assign_the_vehicle_once() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d1 = fleet.driver(DutyStatus::OnDuty).await;
        let d2 = fleet.driver(DutyStatus::OnDuty).await;

        let (a, b) = tokio::join!(
            fleet
                .coordinator
                .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d1, 100.0, 1000.0)),
            fleet
                .coordinator
                .dispatch_trip(&fleet.manager, dispatch_request(&v, &d2, 100.0, 1000.0)),
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(fleet.store().dispatched_trips_for_vehicle(v.id).await, 1);
    }

    #[tokio::test]
    async fn stale_vehicle_aborts_dispatch_without_partial_writes() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;

        // Another request moved the vehicle after preconditions were checked.
        fleet.store().force_vehicle_status(v.id, VehicleStatus::InShop).await;
        let plan = DispatchPlan {
            organization_id: fleet.org,
            trip_id: Uuid::new_v4(),
            vehicle_id: v.id,
            driver_id: d.id,
            cargo_weight_kg: 10.0,
            origin_address: "A".to_string(),
            destination_address: "B".to_string(),
            estimated_fuel_cost: 1.0,
            start_odometer_km: 1000.0,
            revenue: 0.0,
            dispatched_at: Utc::now(),
        };

        let err = fleet.store().dispatch_trip(&plan).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleState { entity: "Vehicle", .. }));
        assert_eq!(
            AppError::from(err).to_string(),
            format!("Vehicle {} is no longer AVAILABLE", v.id)
        );
        assert_eq!(fleet.store().trip_count().await, 0);
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::InShop);
    }

    // -------------------------------------------------------------------------
    // COMPLETION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn completion_updates_every_related_entity() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 400.0, 1000.0))
            .await
            .unwrap()
            .trip;

        let done = fleet
            .coordinator
            .complete_trip(&fleet.dispatcher, trip.id, CompleteTripRequest { end_odometer_km: 1250.0 })
            .await
            .unwrap();

        assert_eq!(done.detail.trip.status, TripStatus::Completed);
        assert_eq!(done.detail.trip.distance_km, Some(250.0));
        assert!(done.detail.trip.completed_at.is_some());

        let vehicle = fleet.current_vehicle(v.id).await;
        assert_eq!(vehicle.odometer_km, 1250.0);
        assert_eq!(vehicle.status, VehicleStatus::Available);

        let driver = fleet.current_driver(d.id).await;
        assert_eq!(driver.duty_status, DutyStatus::OffDuty);
        assert_eq!(driver.completion_rate, 100.0);

        assert_eq!(done.expense.trip_id, Some(trip.id));
        assert_eq!(done.expense.fuel_liters, 0.0);
        assert_eq!(done.expense.total_cost, trip.estimated_fuel_cost);
        assert_eq!(fleet.store().expenses().await.len(), 1);
    }

    #[tokio::test]
    async fn round_trip_of_one_hundred_km() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 5000.0, 800.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.manager, dispatch_request(&v, &d, 100.0, 5000.0))
            .await
            .unwrap()
            .trip;

        let done = fleet
            .coordinator
            .complete_trip(&fleet.manager, trip.id, CompleteTripRequest { end_odometer_km: 5100.0 })
            .await
            .unwrap();

        assert_eq!(done.detail.trip.distance_km, Some(100.0));
        assert_eq!(fleet.current_vehicle(v.id).await.odometer_km, 5100.0);
    }

    #[tokio::test]
    async fn completing_twice_names_the_current_status() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 400.0, 1000.0))
            .await
            .unwrap()
            .trip;
        let complete = || CompleteTripRequest { end_odometer_km: 1250.0 };

        fleet
            .coordinator
            .complete_trip(&fleet.dispatcher, trip.id, complete())
            .await
            .unwrap();
        let err = fleet
            .coordinator
            .complete_trip(&fleet.dispatcher, trip.id, complete())
            .await
            .unwrap_err();

        assert_eq!(invalid_state(err), "Trip is COMPLETED and cannot be completed");
        assert_eq!(fleet.store().expenses().await.len(), 1);
    }

    #[tokio::test]
    async fn end_odometer_must_exceed_start() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 1000.0))
            .await
            .unwrap()
            .trip;

        let err = fleet
            .coordinator
            .complete_trip(&fleet.dispatcher, trip.id, CompleteTripRequest { end_odometer_km: 1000.0 })
            .await
            .unwrap_err();

        assert!(invalid_state(err).contains("must be greater than start odometer"));
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::OnTrip);
    }

    #[tokio::test]
    async fn drivers_complete_only_their_own_trips() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let other = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 1000.0))
            .await
            .unwrap()
            .trip;

        let intruder = Actor::new(other.user_id, Role::Driver, fleet.org);
        let err = fleet
            .coordinator
            .complete_trip(&intruder, trip.id, CompleteTripRequest { end_odometer_km: 1100.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let owner = Actor::new(d.user_id, Role::Driver, fleet.org);
        let done = fleet
            .coordinator
            .complete_trip(&owner, trip.id, CompleteTripRequest { end_odometer_km: 1100.0 })
            .await
            .unwrap();
        assert_eq!(done.detail.trip.status, TripStatus::Completed);
    }

    #[tokio::test]
    async fn completion_rate_covers_the_whole_history() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 0.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;

        // First trip cancelled, driver put back on duty, second trip completed.
        let first = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 0.0))
            .await
            .unwrap()
            .trip;
        fleet.coordinator.cancel_trip(&fleet.dispatcher, first.id).await.unwrap();
        fleet
            .coordinator
            .update_driver(
                &fleet.manager,
                d.id,
                UpdateDriverRequest {
                    duty_status: Some(DutyStatus::OnDuty),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 0.0))
            .await
            .unwrap()
            .trip;
        let done = fleet
            .coordinator
            .complete_trip(&fleet.dispatcher, second.id, CompleteTripRequest { end_odometer_km: 40.0 })
            .await
            .unwrap();

        assert_eq!(done.detail.driver.completion_rate, 50.0);

        let recomputed = fleet
            .coordinator
            .recompute_completion_rate(&fleet.manager, d.id)
            .await
            .unwrap();
        assert_eq!(recomputed.completion_rate, 50.0);
    }

    #[tokio::test]
    async fn completion_leaves_third_state_vehicle_but_finishes_trip() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 1000.0))
            .await
            .unwrap()
            .trip;
        fleet.store().force_vehicle_status(v.id, VehicleStatus::OutOfService).await;

        let completed = fleet
            .coordinator
            .complete_trip(&fleet.dispatcher, trip.id, CompleteTripRequest { end_odometer_km: 1200.0 })
            .await
            .unwrap();

        assert!(!completed.vehicle_released);
        assert_eq!(completed.detail.trip.status, TripStatus::Completed);
        let vehicle = fleet.current_vehicle(v.id).await;
        assert_eq!(vehicle.status, VehicleStatus::OutOfService);
        assert_eq!(vehicle.odometer_km, 1200.0);
        assert_eq!(fleet.current_driver(d.id).await.duty_status, DutyStatus::OffDuty);
        assert_eq!(fleet.current_driver(d.id).await.completion_rate, 100.0);
        assert_eq!(fleet.store().expenses().await.len(), 1);
    }

    #[tokio::test]
    async fn completion_aborts_when_driver_row_is_gone() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 1000.0))
            .await
            .unwrap()
            .trip;
        fleet.store().remove_driver(d.id).await;

        let err = fleet
            .coordinator
            .complete_trip(&fleet.dispatcher, trip.id, CompleteTripRequest { end_odometer_km: 1100.0 })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
        let stored = fleet.store().find_trip(fleet.org, trip.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TripStatus::Dispatched);
        let vehicle = fleet.current_vehicle(v.id).await;
        assert_eq!(vehicle.status, VehicleStatus::OnTrip);
        assert_eq!(vehicle.odometer_km, 1000.0);
        assert!(fleet.store().expenses().await.is_empty());
    }

    // -------------------------------------------------------------------------
    // CANCELLATION
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn cancellation_releases_vehicle_and_driver() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 1000.0))
            .await
            .unwrap()
            .trip;

        let cancelled = fleet.coordinator.cancel_trip(&fleet.dispatcher, trip.id).await.unwrap();

        assert_eq!(cancelled.trip.status, TripStatus::Cancelled);
        assert!(cancelled.vehicle_released);
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::Available);
        assert_eq!(fleet.current_driver(d.id).await.duty_status, DutyStatus::OffDuty);

        let err = fleet.coordinator.cancel_trip(&fleet.dispatcher, trip.id).await.unwrap_err();
        assert_eq!(invalid_state(err), "Trip is already CANCELLED");
    }

    #[tokio::test]
    async fn completed_trips_cannot_be_cancelled() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 1000.0))
            .await
            .unwrap()
            .trip;
        fleet
            .coordinator
            .complete_trip(&fleet.dispatcher, trip.id, CompleteTripRequest { end_odometer_km: 1010.0 })
            .await
            .unwrap();

        let err = fleet.coordinator.cancel_trip(&fleet.dispatcher, trip.id).await.unwrap_err();
        assert_eq!(invalid_state(err), "Trip is COMPLETED and cannot be cancelled");
    }

    #[tokio::test]
    async fn cancellation_leaves_a_vehicle_that_moved_elsewhere() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 1000.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let trip = fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 1000.0))
            .await
            .unwrap()
            .trip;
        fleet
            .store()
            .force_vehicle_status(v.id, VehicleStatus::OutOfService)
            .await;

        let cancelled = fleet.coordinator.cancel_trip(&fleet.dispatcher, trip.id).await.unwrap();

        assert!(!cancelled.vehicle_released);
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::OutOfService);
        assert_eq!(fleet.current_driver(d.id).await.duty_status, DutyStatus::OffDuty);
    }

    // -------------------------------------------------------------------------
    // MAINTENANCE
    // -------------------------------------------------------------------------

    fn maintenance_request(vehicle: &Vehicle) -> OpenMaintenanceRequest {
        OpenMaintenanceRequest {
            vehicle_id: vehicle.id,
            issue_description: "Brake pads worn".to_string(),
            service_date: Utc::now().date_naive(),
            cost: 350.0,
        }
    }

    #[tokio::test]
    async fn maintenance_open_and_close_cycle() {
        let fleet = Fleet::new();
        let v2 = fleet.vehicle(VehicleStatus::Available, 200.0, 500.0).await;

        let log = fleet
            .coordinator
            .open_maintenance(&fleet.manager, maintenance_request(&v2))
            .await
            .unwrap();
        assert_eq!(log.status, MaintenanceStatus::Open);
        assert_eq!(fleet.current_vehicle(v2.id).await.status, VehicleStatus::InShop);

        let closed = fleet.coordinator.close_maintenance(&fleet.manager, log.id).await.unwrap();
        assert_eq!(closed.log.status, MaintenanceStatus::Closed);
        assert!(closed.log.closed_at.is_some());
        assert!(closed.vehicle_released);
        assert_eq!(fleet.current_vehicle(v2.id).await.status, VehicleStatus::Available);

        let err = fleet.coordinator.close_maintenance(&fleet.manager, log.id).await.unwrap_err();
        assert_eq!(invalid_state(err), "Maintenance log is already closed");
        assert_eq!(fleet.current_vehicle(v2.id).await.status, VehicleStatus::Available);
    }

    #[tokio::test]
    async fn vehicles_on_trip_cannot_enter_the_shop() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::OnTrip, 200.0, 500.0).await;

        let err = fleet
            .coordinator
            .open_maintenance(&fleet.manager, maintenance_request(&v))
            .await
            .unwrap_err();
        assert!(invalid_state(err).contains("cannot be sent to maintenance"));
        assert_eq!(fleet.store().maintenance_count().await, 0);
    }

    #[tokio::test]
    async fn maintenance_start_then_close() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::OutOfService, 200.0, 500.0).await;
        let safety = Actor::new(Uuid::new_v4(), Role::SafetyOfficer, fleet.org);

        let log = fleet
            .coordinator
            .open_maintenance(&safety, maintenance_request(&v))
            .await
            .unwrap();
        let started = fleet.coordinator.start_maintenance(&safety, log.id).await.unwrap();
        assert_eq!(started.status, MaintenanceStatus::InProgress);

        let err = fleet.coordinator.start_maintenance(&safety, log.id).await.unwrap_err();
        assert!(invalid_state(err).contains("IN_PROGRESS"));

        let closed = fleet.coordinator.close_maintenance(&safety, log.id).await.unwrap();
        assert_eq!(closed.log.status, MaintenanceStatus::Closed);
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::Available);
    }

    #[tokio::test]
    async fn closing_maintenance_does_not_clobber_a_third_state() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 200.0, 500.0).await;
        let log = fleet
            .coordinator
            .open_maintenance(&fleet.manager, maintenance_request(&v))
            .await
            .unwrap();
        fleet
            .coordinator
            .set_vehicle_service(&fleet.manager, v.id, VehicleStatus::OutOfService)
            .await
            .unwrap();

        let closed = fleet.coordinator.close_maintenance(&fleet.manager, log.id).await.unwrap();

        assert!(!closed.vehicle_released);
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::OutOfService);
    }

    // -------------------------------------------------------------------------
    // SERVICE TOGGLE
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn service_toggle_round_trip() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 0.0, 500.0).await;

        let out = fleet
            .coordinator
            .set_vehicle_service(&fleet.manager, v.id, VehicleStatus::OutOfService)
            .await
            .unwrap();
        assert_eq!(out.status, VehicleStatus::OutOfService);

        let back = fleet
            .coordinator
            .set_vehicle_service(&fleet.manager, v.id, VehicleStatus::Available)
            .await
            .unwrap();
        assert_eq!(back.status, VehicleStatus::Available);
    }

    #[tokio::test]
    async fn service_toggle_is_blocked_mid_trip() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 0.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        fleet
            .coordinator
            .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 100.0, 0.0))
            .await
            .unwrap();

        let err = fleet
            .coordinator
            .set_vehicle_service(&fleet.manager, v.id, VehicleStatus::OutOfService)
            .await
            .unwrap_err();
        assert!(invalid_state(err).contains("cannot change service status"));
        assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::OnTrip);

        let err = fleet
            .coordinator
            .set_vehicle_service(&fleet.dispatcher, v.id, VehicleStatus::OutOfService)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    // -------------------------------------------------------------------------
    // DRIVER UPDATE
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn past_license_expiry_suspends_despite_requested_duty() {
        let fleet = Fleet::new();
        let d = fleet.driver(DutyStatus::OffDuty).await;

        let updated = fleet
            .coordinator
            .update_driver(
                &fleet.manager,
                d.id,
                UpdateDriverRequest {
                    license_expiry: Some(Utc::now().date_naive() - Duration::days(1)),
                    duty_status: Some(DutyStatus::OnDuty),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.duty_status, DutyStatus::Suspended);
    }

    #[tokio::test]
    async fn driver_update_applies_plain_fields() {
        let fleet = Fleet::new();
        let d = fleet.driver(DutyStatus::OffDuty).await;
        let renewed = Utc::now().date_naive() + Duration::days(700);

        let updated = fleet
            .coordinator
            .update_driver(
                &fleet.manager,
                d.id,
                UpdateDriverRequest {
                    license_number: Some("LIC-9001".to_string()),
                    license_expiry: Some(renewed),
                    duty_status: None,
                    safety_score: Some(88.5),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.license_number, "LIC-9001");
        assert_eq!(updated.license_expiry, renewed);
        assert_eq!(updated.duty_status, DutyStatus::OffDuty);
        assert_eq!(updated.safety_score, 88.5);
    }

    #[tokio::test]
    async fn recompute_for_unknown_driver_is_not_found() {
        let fleet = Fleet::new();
        let err = fleet
            .coordinator
            .recompute_completion_rate(&fleet.manager, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    // -------------------------------------------------------------------------
    // INVARIANTS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn on_trip_matches_exactly_one_dispatched_trip() {
        let fleet = Fleet::new();
        let v = fleet.vehicle(VehicleStatus::Available, 0.0, 500.0).await;
        let d = fleet.driver(DutyStatus::OnDuty).await;
        let mut odometer = 0.0;

        for round in 0..3 {
            let trip = fleet
                .coordinator
                .dispatch_trip(&fleet.dispatcher, dispatch_request(&v, &d, 50.0, odometer))
                .await
                .unwrap()
                .trip;
            assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::OnTrip);
            assert_eq!(fleet.store().dispatched_trips_for_vehicle(v.id).await, 1);

            if round % 2 == 0 {
                odometer += 75.0;
                fleet
                    .coordinator
                    .complete_trip(&fleet.dispatcher, trip.id, CompleteTripRequest { end_odometer_km: odometer })
                    .await
                    .unwrap();
            } else {
                fleet.coordinator.cancel_trip(&fleet.dispatcher, trip.id).await.unwrap();
            }
            assert_eq!(fleet.current_vehicle(v.id).await.status, VehicleStatus::Available);
            assert_eq!(fleet.store().dispatched_trips_for_vehicle(v.id).await, 0);
            assert_eq!(fleet.current_vehicle(v.id).await.odometer_km, odometer);

            fleet
                .coordinator
                .update_driver(
                    &fleet.manager,
                    d.id,
                    UpdateDriverRequest {
                        duty_status: Some(DutyStatus::OnDuty),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
    }
}
