//! Consul Backend
//!
//! Registration is a Consul agent service with a TTL check; heartbeats mark
//! the check passing. Discovery long-polls the health endpoint for the
//! `{namespace}-{env}` service and rebuilds from every changed response.

use crate::config::RegistryConfig;
use crate::discovery::{ChangeBatch, ChangeSource, Snapshot};
use crate::session::{local_lease_id, LeaseBackend, LeaseHandle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};
use waypoint_core::{Error, LeaseId, RebuildPolicy, Result, ServiceConf, ServiceNode};

const BACKEND: &str = "consul";

/// Service meta key holding the encoded node.
pub const META_NODE: &str = "node";
pub const META_APP_ID: &str = "app_id";
pub const META_ENV: &str = "env";
pub const META_VERSION: &str = "version";

/// Response header carrying the blocking-query index.
pub const INDEX_HEADER: &str = "x-consul-index";

fn consul_error(e: reqwest::Error) -> Error {
    Error::backend(BACKEND, e)
}

/// Consul service name shared by every node of one env.
pub fn service_name(namespace: &str, env: &str) -> String {
    format!("{namespace}-{env}")
}

#[derive(Debug, Serialize)]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Vec<&'a str>,
    #[serde(rename = "Meta")]
    meta: HashMap<&'static str, String>,
    #[serde(rename = "Check")]
    check: TtlCheck,
}

#[derive(Debug, Serialize)]
struct TtlCheck {
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

#[derive(Debug, Serialize)]
struct CheckUpdate<'a> {
    #[serde(rename = "Status")]
    status: &'a str,
    #[serde(rename = "Output")]
    output: &'a str,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Meta", default)]
    meta: Option<HashMap<String, String>>,
}

/// Thin client for the agent and health endpoints we use.
#[derive(Debug, Clone)]
pub struct ConsulApi {
    http: reqwest::Client,
    addr: String,
}

impl ConsulApi {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.consul_request_timeout())
            .build()
            .map_err(consul_error)?;
        Ok(Self {
            http,
            addr: config.consul_addr.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    async fn register_service(&self, registration: &ServiceRegistration<'_>) -> Result<()> {
        self.http
            .put(self.url("/v1/agent/service/register"))
            .json(registration)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(consul_error)?;
        Ok(())
    }

    /// Mark a TTL check passing.
    pub async fn pass_check(&self, check_id: &str) -> Result<()> {
        self.http
            .put(self.url(&format!("/v1/agent/check/update/{check_id}")))
            .json(&CheckUpdate {
                status: "passing",
                output: "ok",
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(consul_error)?;
        Ok(())
    }

    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        self.http
            .put(self.url(&format!("/v1/agent/service/deregister/{service_id}")))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(consul_error)?;
        Ok(())
    }

    /// Passing instances of `service` as encoded nodes, plus the response
    /// index. Blocks up to `wait` while the index equals `index`.
    pub async fn health_service(
        &self,
        service: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(Vec<Vec<u8>>, u64)> {
        let mut request = self
            .http
            .get(self.url(&format!("/v1/health/service/{service}")))
            .query(&[("passing", "true")]);
        if index > 0 {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", wait.as_secs())),
            ]);
        }

        let resp = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(consul_error)?;
        let next_index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::backend(BACKEND, format!("missing {INDEX_HEADER} header")))?;
        let entries: Vec<HealthEntry> = resp.json().await.map_err(consul_error)?;

        let nodes = entries
            .into_iter()
            .filter_map(|entry| entry.service.meta?.remove(META_NODE))
            .map(String::into_bytes)
            .collect();
        Ok((nodes, next_index))
    }
}

/// Locally generated handle plus the service it registered.
#[derive(Debug)]
pub struct ConsulLease {
    id: LeaseId,
    ttl: Duration,
    service_id: Option<String>,
}

impl ConsulLease {
    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    pub fn check_id(&self) -> Option<String> {
        self.service_id.as_deref().map(check_id)
    }
}

impl LeaseHandle for ConsulLease {
    fn id(&self) -> LeaseId {
        self.id
    }
}

/// Check id Consul assigns to a service's inline check.
pub fn check_id(service_id: &str) -> String {
    format!("service:{service_id}")
}

/// TTL-check registration against a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulBackend {
    api: ConsulApi,
    namespace: String,
}

impl ConsulBackend {
    pub fn new(api: ConsulApi, conf: &ServiceConf) -> Self {
        Self {
            api,
            namespace: conf.namespace_or_default().to_string(),
        }
    }
}

#[async_trait]
impl LeaseBackend for ConsulBackend {
    type Lease = ConsulLease;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn grant(&self, ttl: Duration) -> Result<ConsulLease> {
        Ok(ConsulLease {
            id: local_lease_id(),
            ttl,
            service_id: None,
        })
    }

    async fn put(&self, lease: &mut ConsulLease, node: &ServiceNode) -> Result<()> {
        let meta = &node.meta;
        let lease_id = lease.id;
        let service_id = lease
            .service_id
            .get_or_insert_with(|| {
                format!(
                    "{}-{}-{}-{}-{}",
                    self.namespace,
                    meta.env,
                    meta.app_id,
                    lease_id,
                    uuid::Uuid::new_v4()
                )
            })
            .clone();

        let ttl_secs = lease.ttl.as_secs();
        let registration = ServiceRegistration {
            id: &service_id,
            name: service_name(&self.namespace, &meta.env),
            address: &node.network.internal,
            port: 0,
            tags: vec![meta.app_id.as_str(), meta.version.as_str()],
            meta: HashMap::from([
                (META_NODE, node.encode()?),
                (META_APP_ID, meta.app_id.clone()),
                (META_ENV, meta.env.clone()),
                (META_VERSION, meta.version.clone()),
            ]),
            check: TtlCheck {
                ttl: format!("{ttl_secs}s"),
                deregister_critical_service_after: format!("{}s", ttl_secs * 3),
            },
        };

        self.api.register_service(&registration).await?;
        self.api.pass_check(&check_id(&service_id)).await?;
        trace!(service_id = %service_id, "Service registered");
        Ok(())
    }

    async fn renew(&self, lease: &mut ConsulLease, _node: &ServiceNode) -> Result<()> {
        let check = lease
            .check_id()
            .ok_or_else(|| Error::backend(BACKEND, "no check registered"))?;
        self.api.pass_check(&check).await
    }

    async fn revoke(&self, lease: ConsulLease) -> Result<()> {
        match lease.service_id {
            Some(service_id) => self.api.deregister(&service_id).await,
            None => Ok(()),
        }
    }
}

/// Blocking-query index.
///
/// Consul may return an index lower than the last one seen (e.g. after a
/// leader change); the documented response is to start over from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsulIndex {
    last: u64,
}

impl ConsulIndex {
    pub fn value(&self) -> u64 {
        self.last
    }

    /// Record a response index; returns whether the data may have changed.
    pub fn observe(&mut self, index: u64) -> bool {
        if index == self.last {
            return false;
        }
        if index < self.last {
            self.last = 0;
        } else {
            self.last = index;
        }
        true
    }
}

/// Long-poll change feed for one env.
pub struct ConsulChangeSource {
    api: ConsulApi,
    service: String,
    index: ConsulIndex,
    wait: Duration,
    error_backoff: Duration,
}

impl ConsulChangeSource {
    pub fn new(api: ConsulApi, conf: &ServiceConf, env: &str, config: &RegistryConfig) -> Self {
        Self {
            api,
            service: service_name(conf.namespace_or_default(), env),
            index: ConsulIndex::default(),
            wait: config.consul_wait,
            error_backoff: config.consul_error_backoff,
        }
    }

    pub fn index(&self) -> ConsulIndex {
        self.index
    }
}

#[async_trait]
impl ChangeSource for ConsulChangeSource {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn bootstrap(&mut self) -> Result<Snapshot> {
        let (entries, index) = self.api.health_service(&self.service, 0, self.wait).await?;
        self.index.observe(index);
        debug!(service = %self.service, index = index, count = entries.len(), "Loaded consul snapshot");
        Ok(Snapshot::new(entries, RebuildPolicy::keep_all()))
    }

    async fn next_batch(&mut self) -> Result<ChangeBatch> {
        let (entries, index) = self
            .api
            .health_service(&self.service, self.index.value(), self.wait)
            .await?;
        if !self.index.observe(index) {
            return Ok(ChangeBatch::Unchanged);
        }
        trace!(service = %self.service, index = index, "Consul index moved");
        Ok(ChangeBatch::Snapshot(Snapshot::new(
            entries,
            RebuildPolicy::keep_all(),
        )))
    }

    fn retry_delay(&self) -> Duration {
        self.error_backoff
    }
}
