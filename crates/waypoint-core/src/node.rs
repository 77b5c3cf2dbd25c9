//! Service Node Model
//!
//! A `ServiceNode` describes one running instance: identity (`meta`), where
//! to reach it (`network`), what it serves (`methods`) and when it last
//! heartbeated (`run_date`). Nodes are immutable once published; every
//! heartbeat or re-write produces a new version under the same lease.

use crate::error::{Error, Result};
use crate::methods::MethodSet;
use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

/// Registration handle: backend-assigned (etcd) or locally generated.
pub type LeaseId = i64;

/// Fixed-width local datetime used for `run_date` by producers and the
/// staleness filter alike.
pub const RUN_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Language stamped into every node's kernel.
pub const KERNEL_LANGUAGE: &str = "Rust";

/// Kernel version used when none is configured.
pub const DEFAULT_KERNEL_VERSION: &str = "v0.0.1";

/// Weight published when the caller leaves it at zero.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Current local time at second precision.
pub fn now_local() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Format a timestamp the way `run_date` is stored.
pub fn format_run_date(at: NaiveDateTime) -> String {
    at.format(RUN_DATE_FORMAT).to_string()
}

/// Parse a stored `run_date`.
pub fn parse_run_date(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, RUN_DATE_FORMAT).ok()
}

/// Service identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Environment; nodes in different envs never see each other.
    #[serde(default)]
    pub env: String,
    /// Logical service id shared by all instances and versions.
    #[serde(default)]
    pub app_id: String,
    /// Instance version.
    #[serde(default)]
    pub version: String,
}

impl Meta {
    pub fn new<S: Into<String>>(env: S, app_id: S, version: S) -> Self {
        Self {
            env: env.into(),
            app_id: app_id.into(),
            version: version.into(),
        }
    }

    /// Fill empty fields from `other`.
    pub fn backfill(&mut self, other: &Meta) {
        if self.app_id.is_empty() {
            self.app_id = other.app_id.clone();
        }
        if self.env.is_empty() {
            self.env = other.env.clone();
        }
        if self.version.is_empty() {
            self.version = other.version.clone();
        }
    }

    /// Both identity fields are required to publish or index a node.
    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() {
            return Err(Error::config("meta.app_id is empty"));
        }
        if self.env.is_empty() {
            return Err(Error::config("meta.env is empty"));
        }
        Ok(())
    }
}

/// Runtime that produced the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub version: String,
}

impl Kernel {
    pub fn bootstrap(&mut self) {
        self.language = KERNEL_LANGUAGE.to_string();
        if self.version.is_empty() {
            self.version = DEFAULT_KERNEL_VERSION.to_string();
        }
    }
}

/// Addresses a node is reachable on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Interface serial; gateways prefer traffic within the same SN.
    #[serde(default)]
    pub sn: String,
    /// Cluster-internal address.
    #[serde(default)]
    pub internal: String,
    /// Externally reachable address.
    #[serde(default)]
    pub external: String,
}

impl Network {
    /// Fill defaults: a generated SN, the outbound-routable local IP, and
    /// the internal address as external fallback.
    pub fn bootstrap(&mut self) {
        if self.sn.is_empty() {
            self.sn = uuid::Uuid::new_v4().simple().to_string();
        }
        if self.internal.is_empty() {
            self.internal = detect_internal_ip().to_string();
        }
        if self.external.is_empty() {
            self.external = self.internal.clone();
        }
    }
}

/// IP of the interface the OS would route external traffic through.
///
/// Connecting a UDP socket sends nothing; it only resolves the route.
pub fn detect_internal_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// One registered service instance, as published to a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    #[serde(default)]
    pub proto_count: u32,
    #[serde(default)]
    pub lease_id: LeaseId,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub run_date: String,
    #[serde(default)]
    pub methods: MethodSet,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub kernel: Kernel,
    #[serde(default)]
    pub meta: Meta,
}

impl ServiceNode {
    /// Node advertising `methods`, identity to be stamped at install time.
    pub fn with_methods<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Decode a stored entry, rejecting entries without identity.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let node: ServiceNode = serde_json::from_slice(raw)
            .map_err(|e| Error::data_integrity(format!("invalid node JSON: {e}")))?;
        node.meta
            .validate()
            .map_err(|e| Error::data_integrity(e.to_string()))?;
        Ok(node)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn app_id(&self) -> &str {
        &self.meta.app_id
    }

    /// Record a heartbeat at `at`.
    pub fn stamp(&mut self, at: NaiveDateTime) {
        self.run_date = format_run_date(at);
    }

    /// Parsed `run_date`, if it is in the expected format.
    pub fn run_at(&self) -> Option<NaiveDateTime> {
        parse_run_date(&self.run_date)
    }

    /// Whether the last heartbeat is `ttl` or more old at `now`.
    ///
    /// Both sides are truncated to the second, so a node exactly `ttl` old
    /// may have missed its window by up to a second and counts as stale.
    /// A missing or unparsable `run_date` counts as stale too.
    pub fn is_stale(&self, now: NaiveDateTime, ttl: Duration) -> bool {
        match self.run_at() {
            Some(at) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => now - at >= ttl,
                Err(_) => false,
            },
            None => true,
        }
    }

    pub fn check_method(&self, method: &str) -> Result<()> {
        if self.methods.contains(method) {
            Ok(())
        } else {
            Err(Error::NodeMethodNotFound(method.to_string()))
        }
    }

    /// Freshest heartbeat first, then highest lease id.
    pub fn fresher_first(a: &ServiceNode, b: &ServiceNode) -> Ordering {
        b.run_at()
            .cmp(&a.run_at())
            .then_with(|| b.lease_id.cmp(&a.lease_id))
    }
}
