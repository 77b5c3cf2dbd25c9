//! Register and discover through one in-process store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use waypoint_core::{Error, LeaseId, Meta, RebuildPolicy, Result, ServiceConf, ServiceNode};
use waypoint_registry::{
    ChangeBatch, ChangeEvent, ChangeSource, DiscoveryCache, LeaseBackend, LeaseHandle,
    RegistrationSession, SessionExit, SessionState, Snapshot,
};

#[derive(Default)]
struct Store {
    next_lease: LeaseId,
    live: HashSet<LeaseId>,
    entries: BTreeMap<(String, LeaseId), Vec<u8>>,
    watchers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
}

impl Store {
    fn publish(&mut self, event: ChangeEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn remove(&mut self, lease: LeaseId) {
        self.live.remove(&lease);
        let gone: Vec<_> = self
            .entries
            .keys()
            .filter(|(_, id)| *id == lease)
            .cloned()
            .collect();
        for (app_id, lease_id) in gone {
            self.entries.remove(&(app_id.clone(), lease_id));
            self.publish(ChangeEvent::Delete { app_id, lease_id });
        }
    }
}

#[derive(Clone, Default)]
struct MemoryStore(Arc<Mutex<Store>>);

impl MemoryStore {
    /// Drop a lease as if it had timed out server-side.
    fn expire(&self, lease: LeaseId) {
        self.0.lock().remove(lease);
    }
}

struct MemoryLease(LeaseId);

impl LeaseHandle for MemoryLease {
    fn id(&self) -> LeaseId {
        self.0
    }
}

#[derive(Clone, Default)]
struct MemoryBackend {
    store: MemoryStore,
    renewals: Arc<AtomicU32>,
}

#[async_trait]
impl LeaseBackend for MemoryBackend {
    type Lease = MemoryLease;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn grant(&self, _ttl: Duration) -> Result<MemoryLease> {
        let mut store = self.store.0.lock();
        store.next_lease += 1;
        let id = store.next_lease;
        store.live.insert(id);
        Ok(MemoryLease(id))
    }

    async fn put(&self, lease: &mut MemoryLease, node: &ServiceNode) -> Result<()> {
        let mut store = self.store.0.lock();
        if !store.live.contains(&lease.0) {
            return Err(Error::backend("memory", "lease not found"));
        }
        let raw = node.encode()?.into_bytes();
        store
            .entries
            .insert((node.meta.app_id.clone(), lease.0), raw.clone());
        store.publish(ChangeEvent::Put(raw));
        Ok(())
    }

    async fn renew(&self, lease: &mut MemoryLease, _node: &ServiceNode) -> Result<()> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        if self.store.0.lock().live.contains(&lease.0) {
            Ok(())
        } else {
            Err(Error::backend("memory", "lease expired"))
        }
    }

    async fn revoke(&self, lease: MemoryLease) -> Result<()> {
        self.store.0.lock().remove(lease.0);
        Ok(())
    }

    fn renew_interval(&self, _conf: &ServiceConf) -> Duration {
        Duration::from_millis(20)
    }

    fn retry_backoff(&self, _ttl: Duration) -> Duration {
        Duration::from_millis(10)
    }
}

struct MemorySource {
    store: MemoryStore,
    rx: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
}

#[async_trait]
impl ChangeSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn bootstrap(&mut self) -> Result<Snapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = self.store.0.lock();
        store.watchers.push(tx);
        self.rx = Some(rx);
        Ok(Snapshot::new(
            store.entries.values().cloned().collect(),
            RebuildPolicy::keep_all(),
        ))
    }

    async fn next_batch(&mut self) -> Result<ChangeBatch> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::backend("memory", "not bootstrapped"));
        };
        match rx.recv().await {
            Some(event) => Ok(ChangeBatch::Events(vec![event])),
            None => Err(Error::backend("memory", "store closed")),
        }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(10)
    }
}

async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

const SAY_HELLO: &str = "/helloworld.Greeter/SayHello";

#[tokio::test]
async fn test_lifecycle_seen_by_discovery() {
    let store = MemoryStore::default();
    let backend = MemoryBackend {
        store: store.clone(),
        ..Default::default()
    };
    let conf = ServiceConf::new("mesh");

    let session = RegistrationSession::builder(
        backend.clone(),
        Meta::new("prod", "greeter", "v1"),
        conf.clone(),
    )
    .connect()
    .await
    .unwrap();
    let cache = DiscoveryCache::new(
        MemorySource {
            store: store.clone(),
            rx: None,
        },
        Meta::new("prod", "", ""),
        conf,
    )
    .await
    .unwrap();
    let watcher = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.watcher().await })
    };

    session
        .install(ServiceNode::with_methods([SAY_HELLO]))
        .await
        .unwrap();
    eventually(|| cache.get_service(SAY_HELLO).is_ok()).await;
    let first = session.lease_id().await.unwrap();
    assert_eq!(cache.get_service(SAY_HELLO).unwrap()[0].lease_id, first);

    let heartbeat = {
        let session = session.clone();
        tokio::spawn(async move { session.sustain_lease().await })
    };
    eventually(|| backend.renewals.load(Ordering::SeqCst) >= 2).await;

    // Server-side expiry: discovery drops the node, the session re-registers.
    store.expire(first);
    eventually(|| {
        cache
            .get_service(SAY_HELLO)
            .map(|nodes| nodes.iter().all(|n| n.lease_id != first))
            .unwrap_or(false)
    })
    .await;
    let nodes = cache.get_service(SAY_HELLO).unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(Some(nodes[0].lease_id), session.lease_id().await);
    assert_eq!(session.state(), SessionState::Healthy);
    assert_eq!(session.retry_count(), 0);

    session.uninstall().await;
    assert_eq!(heartbeat.await.unwrap(), SessionExit::Cancelled);
    eventually(|| cache.get_service(SAY_HELLO).is_err()).await;
    assert!(matches!(
        cache.get_nodes("greeter"),
        Err(Error::NodeNotFound(_))
    ));
    assert!(cache.index().is_consistent());

    cache.unwatch();
    watcher.await.unwrap();
}

#[tokio::test]
async fn test_two_apps_share_env() {
    let store = MemoryStore::default();
    let backend = MemoryBackend {
        store: store.clone(),
        ..Default::default()
    };
    let conf = ServiceConf::new("mesh");

    let greeter = RegistrationSession::builder(
        backend.clone(),
        Meta::new("prod", "greeter", "v1"),
        conf.clone(),
    )
    .connect()
    .await
    .unwrap();
    greeter
        .install(ServiceNode::with_methods([SAY_HELLO, "/health.Health/Check"]))
        .await
        .unwrap();

    let billing = RegistrationSession::builder(
        backend.clone(),
        Meta::new("prod", "billing", "v3"),
        conf.clone(),
    )
    .connect()
    .await
    .unwrap();
    billing
        .install(ServiceNode::with_methods(["/billing.Billing/Charge"]))
        .await
        .unwrap();

    let cache = DiscoveryCache::new(
        MemorySource {
            store: store.clone(),
            rx: None,
        },
        Meta::new("prod", "", ""),
        conf,
    )
    .await
    .unwrap();

    assert_eq!(cache.get_service(SAY_HELLO).unwrap()[0].meta.app_id, "greeter");
    assert_eq!(
        cache.get_service("/billing.Billing/Charge").unwrap()[0]
            .meta
            .version,
        "v3"
    );
    assert_eq!(cache.get_nodes("billing").unwrap().len(), 1);
    assert_eq!(cache.node_count(), 2);
}
