//! Kubernetes Backend
//!
//! Every env is one ConfigMap, `waypoint-registry-{env}`, in the namespace
//! named by the service configuration. Each node is a data entry keyed
//! `{appId}.{leaseId}`. There are no server-side leases: a heartbeat rewrites
//! the entry with a fresh `run_date`, and discovery drops entries whose
//! `run_date` is older than the TTL.

use crate::config::RegistryConfig;
use crate::discovery::{ChangeBatch, ChangeSource, Snapshot};
use crate::session::{local_lease_id, LeaseBackend, LeaseHandle};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use waypoint_core::{Error, LeaseId, RebuildPolicy, Result, ServiceConf, ServiceNode};

const BACKEND: &str = "kubernetes";

/// Label put on every ConfigMap we create.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "waypoint";

fn kube_error(e: kube::Error) -> Error {
    Error::backend(BACKEND, e)
}

fn status_code(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

/// ConfigMap holding every node of one env.
pub fn configmap_name(env: &str) -> String {
    format!("waypoint-registry-{env}")
}

/// Data key of one registration.
pub fn data_key(app_id: &str, lease_id: LeaseId) -> String {
    format!("{app_id}.{lease_id}")
}

/// Locally generated id plus the entry it was written to.
#[derive(Debug)]
pub struct KubeLease {
    id: LeaseId,
    entry: Option<(String, String)>,
}

impl LeaseHandle for KubeLease {
    fn id(&self) -> LeaseId {
        self.id
    }
}

/// ConfigMap-entry registration.
#[derive(Clone)]
pub struct KubeBackend {
    api: Api<ConfigMap>,
}

impl KubeBackend {
    pub fn new(client: Client, conf: &ServiceConf) -> Self {
        Self {
            api: Api::namespaced(client, conf.namespace_or_default()),
        }
    }

    async fn write_entry(&self, name: &str, key: &str, value: String) -> Result<()> {
        let patch = json!({ "data": { key: value } });
        match self
            .api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => self.create_with(name, key, value).await,
            Err(e) => Err(kube_error(e)),
        }
    }

    async fn create_with(&self, name: &str, key: &str, value: String) -> Result<()> {
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGED_BY.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), value.clone())])),
            ..Default::default()
        };
        match self.api.create(&PostParams::default(), &configmap).await {
            Ok(_) => {
                debug!(configmap = %name, "Created registry ConfigMap");
                Ok(())
            }
            // Another node created it first; our entry still has to go in.
            Err(e) if status_code(&e) == Some(409) => {
                let patch = json!({ "data": { key: value } });
                self.api
                    .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(kube_error)?;
                Ok(())
            }
            Err(e) => Err(kube_error(e)),
        }
    }
}

#[async_trait]
impl LeaseBackend for KubeBackend {
    type Lease = KubeLease;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn grant(&self, _ttl: Duration) -> Result<KubeLease> {
        Ok(KubeLease {
            id: local_lease_id(),
            entry: None,
        })
    }

    async fn put(&self, lease: &mut KubeLease, node: &ServiceNode) -> Result<()> {
        let name = configmap_name(&node.meta.env);
        let key = data_key(&node.meta.app_id, lease.id);
        self.write_entry(&name, &key, node.encode()?).await?;
        lease.entry = Some((name, key));
        Ok(())
    }

    async fn renew(&self, lease: &mut KubeLease, node: &ServiceNode) -> Result<()> {
        let Some((name, key)) = lease.entry.as_ref() else {
            return Err(Error::backend(BACKEND, "renew before put"));
        };
        let patch = json!({ "data": { key.as_str(): node.encode()? } });
        // No create on 404: a deleted ConfigMap means the registration is gone.
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(kube_error)?;
        Ok(())
    }

    async fn revoke(&self, lease: KubeLease) -> Result<()> {
        let Some((name, key)) = lease.entry else {
            return Ok(());
        };
        let patch = json!({ "data": { key: null } });
        match self
            .api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(kube_error(e)),
        }
    }
}

/// Periodic ConfigMap reads.
///
/// An unchanged `resourceVersion` skips the rebuild, except that the cached
/// entries are re-emitted once per TTL so dead nodes still age out when
/// nothing else writes.
pub struct KubeChangeSource {
    api: Api<ConfigMap>,
    name: String,
    interval: Duration,
    ttl: Duration,
    version: Option<String>,
    entries: Vec<Vec<u8>>,
    rebuilt_at: Instant,
}

impl KubeChangeSource {
    pub fn new(client: Client, conf: &ServiceConf, env: &str, config: &RegistryConfig) -> Self {
        let ttl = conf.ttl();
        Self {
            api: Api::namespaced(client, conf.namespace_or_default()),
            name: configmap_name(env),
            interval: config
                .kube_poll_interval
                .unwrap_or_else(|| conf.heartbeat_interval(2)),
            ttl,
            version: None,
            entries: Vec::new(),
            rebuilt_at: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn snapshot(&mut self) -> Snapshot {
        self.rebuilt_at = Instant::now();
        Snapshot::new(self.entries.clone(), RebuildPolicy::stale_after(self.ttl))
    }

    async fn fetch(&self) -> Result<(Option<String>, Vec<Vec<u8>>)> {
        let Some(configmap) = self.api.get_opt(&self.name).await.map_err(kube_error)? else {
            return Ok((None, Vec::new()));
        };
        let entries = configmap
            .data
            .unwrap_or_default()
            .into_values()
            .map(String::into_bytes)
            .collect();
        Ok((configmap.metadata.resource_version, entries))
    }
}

/// Whether an unchanged ConfigMap should be re-evaluated for expired nodes.
///
/// Heartbeats are second-granular, so a single check per TTL can miss a node
/// that expires just after it; checking twice per TTL bounds the overstay.
fn staleness_due(since_rebuild: Duration, ttl: Duration) -> bool {
    since_rebuild >= ttl / 2
}

#[async_trait]
impl ChangeSource for KubeChangeSource {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn bootstrap(&mut self) -> Result<Snapshot> {
        let (version, entries) = self.fetch().await?;
        debug!(configmap = %self.name, count = entries.len(), "Loaded registry ConfigMap");
        self.version = version;
        self.entries = entries;
        Ok(self.snapshot())
    }

    async fn next_batch(&mut self) -> Result<ChangeBatch> {
        tokio::time::sleep(self.interval).await;
        let (version, entries) = self.fetch().await?;
        if version == self.version {
            if !staleness_due(self.rebuilt_at.elapsed(), self.ttl) {
                return Ok(ChangeBatch::Unchanged);
            }
            trace!(configmap = %self.name, "Re-evaluating staleness");
            return Ok(ChangeBatch::Snapshot(self.snapshot()));
        }
        trace!(configmap = %self.name, version = ?version, "ConfigMap changed");
        self.version = version;
        self.entries = entries;
        Ok(ChangeBatch::Snapshot(self.snapshot()))
    }

    fn retry_delay(&self) -> Duration {
        self.interval
    }
}
