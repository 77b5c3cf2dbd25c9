//! Service Configuration
//!
//! `ServiceConf` is shared by registration sessions and discovery caches.
//! Floors are applied silently by [`ServiceConf::bootstrap`]; a caller
//! asking for a 1s TTL gets 10s, not an error.

use crate::node::{Kernel, Network};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "waypoint";

/// Minimum lease/heartbeat TTL in seconds.
pub const MIN_TTL_SECONDS: u32 = 10;

/// Minimum number of lease recovery attempts.
pub const MIN_MAX_RETRY: u32 = 3;

/// Registration/discovery configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConf {
    /// Isolation domain (key prefix, Consul service prefix, or k8s namespace).
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub kernel: Kernel,
    /// Lease recovery attempts before the session gives up.
    #[serde(default)]
    pub max_retry: u32,
    /// Lease/heartbeat TTL in seconds.
    #[serde(default, rename = "ttl")]
    pub ttl_seconds: u32,
}

impl ServiceConf {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Configured namespace, or the default when unset.
    pub fn namespace_or_default(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    /// Apply defaults and floors. Idempotent.
    pub fn bootstrap(&mut self) {
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        self.ttl_seconds = self.ttl_seconds.max(MIN_TTL_SECONDS);
        self.max_retry = self.max_retry.max(MIN_MAX_RETRY);
        self.network.bootstrap();
        self.kernel.bootstrap();
    }

    /// Lease/heartbeat TTL, floor included even before `bootstrap`.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl_seconds.max(MIN_TTL_SECONDS)))
    }

    /// Heartbeat period: `ttl / divisor`, never shorter than one second.
    pub fn heartbeat_interval(&self, divisor: u32) -> Duration {
        (self.ttl() / divisor.max(1)).max(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_applies_floors() {
        let mut conf = ServiceConf {
            ttl_seconds: 1,
            max_retry: 0,
            ..Default::default()
        };
        conf.bootstrap();
        assert_eq!(conf.namespace, DEFAULT_NAMESPACE);
        assert_eq!(conf.namespace_or_default(), DEFAULT_NAMESPACE);
        assert_eq!(conf.ttl_seconds, MIN_TTL_SECONDS);
        assert_eq!(conf.max_retry, MIN_MAX_RETRY);
        assert_eq!(conf.kernel.language, "Rust");
        assert!(!conf.network.sn.is_empty());
    }

    #[test]
    fn test_bootstrap_keeps_higher_values() {
        let mut conf = ServiceConf {
            namespace: "mesh".to_string(),
            ttl_seconds: 30,
            max_retry: 8,
            ..Default::default()
        };
        conf.bootstrap();
        assert_eq!(conf.namespace, "mesh");
        assert_eq!(conf.ttl_seconds, 30);
        assert_eq!(conf.max_retry, 8);
    }

    #[test]
    fn test_heartbeat_interval_floor() {
        let conf = ServiceConf {
            ttl_seconds: 10,
            ..Default::default()
        };
        assert_eq!(conf.heartbeat_interval(2), Duration::from_secs(5));
        assert_eq!(conf.heartbeat_interval(3), Duration::from_nanos(3_333_333_333));
        assert_eq!(conf.heartbeat_interval(30), Duration::from_secs(1));

        let unset = ServiceConf::default();
        assert_eq!(unset.ttl(), Duration::from_secs(10));
    }

    #[test]
    fn test_deserialize_ttl_field() {
        let conf: ServiceConf =
            serde_json::from_str(r#"{"namespace":"mesh","ttl":15,"max_retry":4}"#).unwrap();
        assert_eq!(conf.ttl_seconds, 15);
        assert_eq!(conf.max_retry, 4);
    }
}
