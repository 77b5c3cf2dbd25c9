//! Lease backend seam
//!
//! A backend turns "keep this node visible" into its own primitives: an etcd
//! lease with keep-alives, a Consul TTL check, or a periodically rewritten
//! ConfigMap entry. The session drives all of them through this trait.

use async_trait::async_trait;
use std::time::Duration;
use waypoint_core::{LeaseId, Result, ServiceConf, ServiceNode};

/// Registration handle held by a session.
pub trait LeaseHandle: Send {
    fn id(&self) -> LeaseId;
}

/// Renewable registration primitives of one coordination backend.
#[async_trait]
pub trait LeaseBackend: Send + Sync + 'static {
    type Lease: LeaseHandle + 'static;

    /// Short backend name used in logs, metrics and errors.
    fn name(&self) -> &'static str;

    /// Acquire a fresh registration handle.
    async fn grant(&self, ttl: Duration) -> Result<Self::Lease>;

    /// Write `node` under `lease`.
    async fn put(&self, lease: &mut Self::Lease, node: &ServiceNode) -> Result<()>;

    /// One heartbeat. `node` carries a fresh `run_date` for backends that
    /// renew by rewriting. An error means the lease is lost.
    async fn renew(&self, lease: &mut Self::Lease, node: &ServiceNode) -> Result<()>;

    /// Release the handle and whatever was written under it.
    async fn revoke(&self, lease: Self::Lease) -> Result<()>;

    /// Heartbeat period for the session's TTL.
    fn renew_interval(&self, conf: &ServiceConf) -> Duration {
        conf.heartbeat_interval(2)
    }

    /// Wait before each recovery attempt.
    fn retry_backoff(&self, ttl: Duration) -> Duration {
        ttl * 5
    }
}

/// Locally generated registration handle: the current time in nanoseconds,
/// never zero.
pub fn local_lease_id() -> LeaseId {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_micros() * 1_000);
    if nanos == 0 {
        1
    } else {
        nanos
    }
}
