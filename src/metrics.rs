// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics, rendered at GET /metrics.
//
// - Counter: requests, lifecycle transitions (only go up)
// - Histogram: request, query and Redis latencies
// - Gauge: vehicles per status, refreshed when the vehicle list is read
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::error::AppError;

// =============================================================================
// METRIC NAMES
// =============================================================================

/// HTTP request counter
/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Lifecycle transition attempts
/// Labels: operation (dispatch_trip, complete_trip, ...), outcome (success/rejected/error)
pub const FLEET_LIFECYCLE_TRANSITIONS_TOTAL: &str = "fleet_lifecycle_transitions_total";

/// Vehicles per status on the last vehicle listing
/// Labels: status
pub const FLEET_VEHICLES_BY_STATUS: &str = "fleet_vehicles_by_status";

/// Database query duration histogram
/// Labels: operation (select/insert/update/transaction)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (publish/ping)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the global Prometheus recorder and return the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "Total number of HTTP requests received"
    );

    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        FLEET_LIFECYCLE_TRANSITIONS_TOTAL,
        "Lifecycle transition attempts by operation and outcome"
    );

    describe_gauge!(
        FLEET_VEHICLES_BY_STATUS,
        "Number of vehicles in each status"
    );

    describe_histogram!(
        DB_QUERY_DURATION_SECONDS,
        "Database query latency in seconds"
    );

    describe_histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "Redis operation latency in seconds"
    );

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Record an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (GET, POST, etc.)
/// * `endpoint` - Route template (/api/v1/trips/:id/complete)
/// * `status` - Response status code
/// * `duration_secs` - Request duration in seconds
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Outcome label for a lifecycle attempt: rejected covers caller-side
/// failures (not found, invalid state, forbidden), error covers the rest.
pub fn outcome_label<T>(result: &Result<T, AppError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) if e.is_unexpected() => "error",
        Err(_) => "rejected",
    }
}

/// Record a lifecycle transition attempt
pub fn record_lifecycle_transition(operation: &str, outcome: &str) {
    counter!(
        FLEET_LIFECYCLE_TRANSITIONS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Update the vehicle count gauge for one status
pub fn set_vehicles_by_status(status: &str, count: i64) {
    gauge!(
        FLEET_VEHICLES_BY_STATUS,
        "status" => status.to_string()
    )
    .set(count as f64);
}

/// Record database query duration
pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        let ok: Result<(), AppError> = Ok(());
        let rejected: Result<(), AppError> = Err(AppError::InvalidState("busy".into()));
        let failed: Result<(), AppError> = Err(AppError::Internal("boom".into()));
        assert_eq!(outcome_label(&ok), "success");
        assert_eq!(outcome_label(&rejected), "rejected");
        assert_eq!(outcome_label(&failed), "error");
    }
}
