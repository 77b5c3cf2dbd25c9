//! Registry Metrics
//!
//! Recorded through the `metrics` facade; nothing is exported unless the host
//! process installs a recorder.
//!
//! Metrics tracked:
//! - `waypoint_lease_renewals_total` - successful heartbeats by backend
//! - `waypoint_lease_retries_total` - lease recovery attempts by backend
//! - `waypoint_lease_abandoned_total` - sessions that exhausted their retries
//! - `waypoint_discovery_events_total` - change events applied, by kind
//! - `waypoint_discovery_rebuilds_total` - full snapshot rebuilds
//! - `waypoint_discovery_skipped_entries_total` - malformed or foreign entries dropped
//! - `waypoint_discovery_nodes` - nodes currently indexed

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register descriptions for all metrics
pub fn register_metric_descriptions() {
    // Registration metrics
    describe_counter!(
        "waypoint_lease_renewals_total",
        "Total number of successful lease renewals"
    );
    describe_counter!(
        "waypoint_lease_retries_total",
        "Total number of lease recovery attempts"
    );
    describe_counter!(
        "waypoint_lease_abandoned_total",
        "Total number of sessions that exhausted lease recovery"
    );

    // Discovery metrics
    describe_counter!(
        "waypoint_discovery_events_total",
        "Total number of change events applied to the index"
    );
    describe_counter!(
        "waypoint_discovery_rebuilds_total",
        "Total number of full index rebuilds"
    );
    describe_counter!(
        "waypoint_discovery_skipped_entries_total",
        "Total number of entries skipped while building the index"
    );
    describe_gauge!(
        "waypoint_discovery_nodes",
        "Number of nodes currently indexed"
    );
}

/// Record a successful renewal
pub fn record_lease_renewal(backend: &str) {
    counter!("waypoint_lease_renewals_total", "backend" => backend.to_string()).increment(1);
}

/// Record a recovery attempt
pub fn record_lease_retry(backend: &str) {
    counter!("waypoint_lease_retries_total", "backend" => backend.to_string()).increment(1);
}

/// Record an abandoned session
pub fn record_lease_abandoned(backend: &str) {
    counter!("waypoint_lease_abandoned_total", "backend" => backend.to_string()).increment(1);
}

/// Record an applied change event
pub fn record_discovery_event(source: &str, kind: &str) {
    counter!(
        "waypoint_discovery_events_total",
        "source" => source.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a full rebuild
pub fn record_discovery_rebuild(source: &str) {
    counter!("waypoint_discovery_rebuilds_total", "source" => source.to_string()).increment(1);
}

/// Record a skipped entry
pub fn record_skipped_entry(source: &str, reason: &str) {
    counter!(
        "waypoint_discovery_skipped_entries_total",
        "source" => source.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Update the indexed node gauge
pub fn set_discovery_nodes(env: &str, count: usize) {
    gauge!("waypoint_discovery_nodes", "env" => env.to_string()).set(count as f64);
}
