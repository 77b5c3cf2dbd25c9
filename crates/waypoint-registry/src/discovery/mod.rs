//! Discovery Cache
//!
//! Keeps a local `method -> app -> nodes` index for one env in step with a
//! backend change feed. Reads take a shared lock and return copies of the
//! node list; the watcher applies each event in its own exclusive section and
//! builds full snapshots off-lock before swapping them in.

mod source;

pub use source::{ChangeBatch, ChangeEvent, ChangeSource, Snapshot};

use crate::observability::{events, metrics};
use crate::session::{LogSink, TracingSink};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Level};
use waypoint_core::node::now_local;
use waypoint_core::{Error, Meta, Result, ServiceConf, ServiceIndex, ServiceNode};

/// Consistent, concurrently readable view of one env's registrations.
pub struct DiscoveryCache<S: ChangeSource> {
    inner: Arc<CacheInner<S>>,
}

impl<S: ChangeSource> Clone for DiscoveryCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct CacheInner<S: ChangeSource> {
    env: String,
    conf: ServiceConf,
    index: RwLock<ServiceIndex>,
    source: tokio::sync::Mutex<S>,
    source_name: &'static str,
    cancel: CancellationToken,
    log: Box<dyn LogSink>,
}

/// Collects options before the bootstrap read.
pub struct CacheBuilder<S: ChangeSource> {
    source: S,
    meta: Meta,
    conf: ServiceConf,
    log: Option<Box<dyn LogSink>>,
}

impl<S: ChangeSource> CacheBuilder<S> {
    /// Destination for the cache's own log lines.
    pub fn with_log<L: LogSink + 'static>(mut self, sink: L) -> Self {
        self.log = Some(Box::new(sink));
        self
    }

    /// Validate identity, apply config floors and load the initial snapshot.
    pub async fn connect(mut self) -> Result<DiscoveryCache<S>> {
        if self.meta.env.is_empty() {
            return Err(Error::config("meta.env is empty"));
        }
        let mut conf = self.conf;
        conf.bootstrap();

        let source_name = self.source.name();
        let snapshot = self.source.bootstrap().await?;

        let inner = CacheInner {
            env: self.meta.env,
            conf,
            index: RwLock::new(ServiceIndex::new()),
            source: tokio::sync::Mutex::new(self.source),
            source_name,
            cancel: CancellationToken::new(),
            log: self.log.unwrap_or_else(|| Box::new(TracingSink)),
        };
        inner.apply_snapshot(snapshot);

        debug!(
            source = source_name,
            env = %inner.env,
            nodes = inner.index.read().node_count(),
            "Discovery cache ready"
        );

        Ok(DiscoveryCache {
            inner: Arc::new(inner),
        })
    }
}

impl<S: ChangeSource> DiscoveryCache<S> {
    pub fn builder(source: S, meta: Meta, conf: ServiceConf) -> CacheBuilder<S> {
        CacheBuilder {
            source,
            meta,
            conf,
            log: None,
        }
    }

    /// Build with default options.
    pub async fn new(source: S, meta: Meta, conf: ServiceConf) -> Result<Self> {
        Self::builder(source, meta, conf).connect().await
    }

    pub fn env(&self) -> &str {
        &self.inner.env
    }

    /// Bootstrapped configuration (floors applied).
    pub fn conf(&self) -> &ServiceConf {
        &self.inner.conf
    }

    /// Nodes serving `method`, freshest first.
    pub fn get_service(&self, method: &str) -> Result<Vec<Arc<ServiceNode>>> {
        self.inner.index.read().lookup(method)
    }

    /// Nodes registered under `app_id`, freshest first.
    pub fn get_nodes(&self, app_id: &str) -> Result<Vec<Arc<ServiceNode>>> {
        self.inner.index.read().nodes(app_id)
    }

    /// Copy of the current index.
    pub fn index(&self) -> ServiceIndex {
        self.inner.index.read().clone()
    }

    pub fn node_count(&self) -> usize {
        self.inner.index.read().node_count()
    }

    /// Consume the change feed until [`unwatch`](Self::unwatch).
    pub async fn watcher(&self) {
        let inner = &self.inner;
        let mut source = inner.source.lock().await;
        let name = inner.source_name;
        debug!(source = name, env = %inner.env, "Watching for changes");

        loop {
            let batch = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => break,
                batch = source.next_batch() => batch,
            };

            match batch {
                Ok(ChangeBatch::Unchanged) => trace!(source = name, "No changes"),
                Ok(ChangeBatch::Events(changes)) => inner.apply_events(changes),
                Ok(ChangeBatch::Snapshot(snapshot)) => inner.apply_snapshot(snapshot),
                Err(e) => {
                    inner.log.log(Level::WARN, &format!("{name} watch failed: {e}"));
                    let delay = source.retry_delay();
                    tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!(source = name, env = %inner.env, "Watcher stopped");
    }

    /// Stop the watcher; blocked backend calls are abandoned.
    pub fn unwatch(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_watching(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }
}

impl<S: ChangeSource> CacheInner<S> {
    /// Decode an entry of this env, or skip it.
    fn decode(&self, raw: &[u8]) -> Option<ServiceNode> {
        match ServiceNode::decode(raw) {
            Ok(node) if node.meta.env == self.env => Some(node),
            Ok(node) => {
                trace!(
                    source = self.source_name,
                    app_id = %node.app_id(),
                    env = %node.meta.env,
                    "Skipping node of another env"
                );
                metrics::record_skipped_entry(self.source_name, "env_mismatch");
                None
            }
            Err(e) => {
                self.log.log(
                    Level::WARN,
                    &format!("{} skipping malformed entry: {e}", self.source_name),
                );
                metrics::record_skipped_entry(self.source_name, "malformed");
                None
            }
        }
    }

    fn apply_events(&self, changes: Vec<ChangeEvent>) {
        for change in changes {
            match change {
                ChangeEvent::Put(raw) => {
                    let Some(node) = self.decode(&raw) else {
                        continue;
                    };
                    let app_id = node.app_id().to_string();
                    let lease_id = node.lease_id;
                    self.index.write().upsert(node);
                    events::node_upserted(self.source_name, &app_id, lease_id);
                    metrics::record_discovery_event(self.source_name, "put");
                }
                ChangeEvent::Delete { app_id, lease_id } => {
                    if self.index.write().remove(&app_id, lease_id) {
                        events::node_removed(self.source_name, &app_id, lease_id);
                    }
                    metrics::record_discovery_event(self.source_name, "delete");
                }
            }
        }
        metrics::set_discovery_nodes(&self.env, self.index.read().node_count());
    }

    fn apply_snapshot(&self, snapshot: Snapshot) {
        let total = snapshot.entries.len();
        let nodes: Vec<ServiceNode> = snapshot
            .entries
            .iter()
            .filter_map(|raw| self.decode(raw))
            .collect();
        let next = ServiceIndex::rebuild(nodes, &snapshot.policy, now_local());
        let (apps, node_count) = (next.app_ids().count(), next.node_count());

        *self.index.write() = next;

        events::index_rebuilt(
            self.source_name,
            &self.env,
            apps,
            node_count,
            total - node_count,
        );
        metrics::record_discovery_rebuild(self.source_name);
        metrics::set_discovery_nodes(&self.env, node_count);
    }
}
