// =============================================================================
// NOTIFY MODULE
// =============================================================================
// Fire-and-forget publication of lifecycle events.
//
// Events are serialized as JSON and PUBLISHed on a Redis channel from a
// spawned task. Downstream consumers (mailers, dashboards) subscribe to that
// channel. Publishing never blocks or fails the operation that produced the
// event; failures are logged and counted.
// =============================================================================

use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::metrics;
use crate::models::{VehicleStatus, DutyStatus};

// =============================================================================
// EVENTS
// =============================================================================
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    TripDispatched {
        organization_id: Uuid,
        trip_id: Uuid,
        vehicle_id: Uuid,
        driver_id: Uuid,
    },
    TripCompleted {
        organization_id: Uuid,
        trip_id: Uuid,
        vehicle_id: Uuid,
        driver_id: Uuid,
        distance_km: f64,
        expense_id: Uuid,
        vehicle_released: bool,
    },
    TripCancelled {
        organization_id: Uuid,
        trip_id: Uuid,
        vehicle_id: Uuid,
        vehicle_released: bool,
    },
    MaintenanceOpened {
        organization_id: Uuid,
        maintenance_log_id: Uuid,
        vehicle_id: Uuid,
    },
    MaintenanceClosed {
        organization_id: Uuid,
        maintenance_log_id: Uuid,
        vehicle_id: Uuid,
        vehicle_released: bool,
    },
    VehicleServiceChanged {
        organization_id: Uuid,
        vehicle_id: Uuid,
        status: VehicleStatus,
    },
    DriverDutyChanged {
        organization_id: Uuid,
        driver_id: Uuid,
        duty_status: DutyStatus,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::TripDispatched { .. } => "trip_dispatched",
            LifecycleEvent::TripCompleted { .. } => "trip_completed",
            LifecycleEvent::TripCancelled { .. } => "trip_cancelled",
            LifecycleEvent::MaintenanceOpened { .. } => "maintenance_opened",
            LifecycleEvent::MaintenanceClosed { .. } => "maintenance_closed",
            LifecycleEvent::VehicleServiceChanged { .. } => "vehicle_service_changed",
            LifecycleEvent::DriverDutyChanged { .. } => "driver_duty_changed",
        }
    }
}

// =============================================================================
// NOTIFIER
// =============================================================================

/// Publishes lifecycle events. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    redis: Option<redis::aio::ConnectionManager>,
    channel: String,
}

impl Notifier {
    pub fn new(redis: redis::aio::ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            redis: Some(redis),
            channel: channel.into(),
        }
    }

    /// Notifier that only logs events (no Redis configured).
    pub fn log_only() -> Self {
        Self {
            redis: None,
            channel: String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.redis.is_some()
    }

    /// Connection handle for readiness probes.
    pub fn connection(&self) -> Option<redis::aio::ConnectionManager> {
        self.redis.clone()
    }

    /// Publish `event` in the background. Returns immediately.
    pub fn publish(&self, event: LifecycleEvent) {
        let name = event.name();

        let Some(mut conn) = self.redis.clone() else {
            tracing::debug!(event = name, payload = ?event, "Lifecycle event (not published)");
            return;
        };

        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(event = name, error = %e, "Failed to serialize lifecycle event");
                return;
            }
        };
        let channel = self.channel.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let result: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&payload)
                .query_async(&mut conn)
                .await;
            metrics::record_redis_operation("publish", start.elapsed().as_secs_f64());

            match result {
                Ok(receivers) => {
                    tracing::debug!(event = name, channel = %channel, receivers, "Lifecycle event published")
                }
                Err(e) => {
                    tracing::warn!(event = name, channel = %channel, error = %e, "Failed to publish lifecycle event")
                }
            }
        });
    }
}
