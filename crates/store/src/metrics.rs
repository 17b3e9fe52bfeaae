//! Operational metrics for the store.
//!
//! Metrics are emitted through the `metrics` facade; the embedding server
//! decides which recorder (Prometheus, StatsD, ...) receives them. Without an
//! installed recorder every call is a no-op.

use std::time::Duration;

use metrics::{counter, histogram};

use crate::error::ExtractionWarning;

/// Metric names as constants for consistency.
#[allow(missing_docs)]
pub mod names {
    pub const EXTRACTION_FAILURES_TOTAL: &str = "helios_store_extraction_failures_total";
    pub const WRITES_TOTAL: &str = "helios_store_writes_total";
    pub const VERSION_CONFLICTS_TOTAL: &str = "helios_store_version_conflicts_total";
    pub const SEARCH_DURATION_SECONDS: &str = "helios_store_search_duration_seconds";
}

/// Records one failure per warning, labelled by resource type and rule.
pub fn record_extraction_failures(warnings: &[ExtractionWarning]) {
    for warning in warnings {
        counter!(
            names::EXTRACTION_FAILURES_TOTAL,
            "resource_type" => warning.resource_type.clone(),
            "rule" => warning.rule.clone()
        )
        .increment(1);
    }
}

/// Records a committed write.
pub fn record_write(resource_type: &str, operation: &str) {
    counter!(
        names::WRITES_TOTAL,
        "resource_type" => resource_type.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Records a rejected optimistic-concurrency write.
pub fn record_version_conflict(resource_type: &str) {
    counter!(
        names::VERSION_CONFLICTS_TOTAL,
        "resource_type" => resource_type.to_string()
    )
    .increment(1);
}

/// Records the wall time of a search.
pub fn record_search(resource_type: &str, duration: Duration) {
    histogram!(
        names::SEARCH_DURATION_SECONDS,
        "resource_type" => resource_type.to_string()
    )
    .record(duration.as_secs_f64());
}
