//! Structured Events
//!
//! One function per lifecycle event so field names stay consistent across
//! backends.
//!
//! Event types:
//! - `lease_granted` - a registration handle was acquired
//! - `node_installed` - a node was written under a lease
//! - `lease_retry` - a recovery attempt is starting
//! - `lease_recovered` - the lease was re-acquired and the node re-written
//! - `lease_abandoned` - recovery attempts are exhausted
//! - `node_upserted` - discovery applied a put
//! - `node_removed` - discovery applied a delete
//! - `index_rebuilt` - discovery swapped in a full snapshot
//! - `watch_resumed` - discovery resubscribed after a stream interruption

use tracing::{debug, error, info, warn};

/// Emit a lease granted event
pub fn lease_granted(backend: &str, lease_id: i64, ttl_secs: u64) {
    debug!(
        event_type = "lease_granted",
        backend = %backend,
        lease_id = lease_id,
        ttl_secs = ttl_secs,
        "Lease granted"
    );
}

/// Emit a node installed event
pub fn node_installed(backend: &str, app_id: &str, env: &str, lease_id: i64, methods: usize) {
    info!(
        event_type = "node_installed",
        backend = %backend,
        app_id = %app_id,
        env = %env,
        lease_id = lease_id,
        methods = methods,
        "Node installed"
    );
}

/// Emit a lease retry event
pub fn lease_retry(backend: &str, attempt: u32, max_retry: u32, reason: &str) {
    warn!(
        event_type = "lease_retry",
        backend = %backend,
        attempt = attempt,
        max_retry = max_retry,
        reason = %reason,
        "Retrying lease"
    );
}

/// Emit a lease recovered event
pub fn lease_recovered(backend: &str, lease_id: i64, attempt: u32) {
    info!(
        event_type = "lease_recovered",
        backend = %backend,
        lease_id = lease_id,
        attempt = attempt,
        "Lease recovered"
    );
}

/// Emit a lease abandoned event
pub fn lease_abandoned(backend: &str, attempts: u32) {
    error!(
        event_type = "lease_abandoned",
        backend = %backend,
        attempts = attempts,
        "Lease recovery exhausted, node is no longer registered"
    );
}

/// Emit a node upserted event
pub fn node_upserted(source: &str, app_id: &str, lease_id: i64) {
    debug!(
        event_type = "node_upserted",
        source = %source,
        app_id = %app_id,
        lease_id = lease_id,
        "Node upserted"
    );
}

/// Emit a node removed event
pub fn node_removed(source: &str, app_id: &str, lease_id: i64) {
    debug!(
        event_type = "node_removed",
        source = %source,
        app_id = %app_id,
        lease_id = lease_id,
        "Node removed"
    );
}

/// Emit an index rebuilt event
pub fn index_rebuilt(source: &str, env: &str, apps: usize, nodes: usize, skipped: usize) {
    debug!(
        event_type = "index_rebuilt",
        source = %source,
        env = %env,
        apps = apps,
        nodes = nodes,
        skipped = skipped,
        "Index rebuilt"
    );
}

/// Emit a watch resumed event
pub fn watch_resumed(source: &str, reason: &str) {
    warn!(
        event_type = "watch_resumed",
        source = %source,
        reason = %reason,
        "Watch resumed"
    );
}
