//! Etcd Backend
//!
//! Registration rides on an etcd lease: the node is written with the lease
//! attached and kept alive through the lease keep-alive stream. Discovery
//! reads the env prefix once, then watches it from the snapshot revision.

use crate::config::RegistryConfig;
use crate::discovery::{ChangeBatch, ChangeEvent, ChangeSource, Snapshot};
use crate::observability::events;
use crate::session::{LeaseBackend, LeaseHandle};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions, Watcher,
    WatchOptions, WatchResponse, WatchStream,
};
use std::time::Duration;
use tracing::{debug, trace, warn};
use waypoint_core::keys::{env_prefix, node_key, parse_node_key};
use waypoint_core::{Error, LeaseId, RebuildPolicy, Result, ServiceConf, ServiceNode};

const BACKEND: &str = "etcd";

fn etcd_error(e: etcd_client::Error) -> Error {
    Error::backend(BACKEND, e)
}

/// Connect to etcd with exponential backoff
pub async fn connect(endpoints: &[String], config: &RegistryConfig) -> Result<Client> {
    let backoff = ExponentialBackoff {
        initial_interval: config.etcd_backoff_initial,
        max_interval: config.etcd_backoff_max,
        max_elapsed_time: Some(config.etcd_backoff_max_elapsed),
        multiplier: config.etcd_backoff_multiplier,
        ..Default::default()
    };

    retry(backoff, || async move {
        match Client::connect(endpoints, None).await {
            Ok(client) => {
                debug!("Connected to etcd");
                Ok(client)
            }
            Err(e) => {
                warn!(error = %e, "etcd connection failed, retrying");
                Err(backoff::Error::transient(e))
            }
        }
    })
    .await
    .map_err(|e| Error::backend(BACKEND, format!("failed to connect after retries: {e}")))
}

/// Etcd lease plus its lazily opened keep-alive channel.
pub struct EtcdLease {
    id: LeaseId,
    keep_alive: Option<(LeaseKeeper, LeaseKeepAliveStream)>,
}

impl LeaseHandle for EtcdLease {
    fn id(&self) -> LeaseId {
        self.id
    }
}

/// Lease-backed registration against etcd.
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
    namespace: String,
    retry_backoff: Duration,
}

impl EtcdBackend {
    pub fn new(client: Client, conf: &ServiceConf, config: &RegistryConfig) -> Self {
        Self {
            client,
            namespace: conf.namespace_or_default().to_string(),
            retry_backoff: config.etcd_retry_backoff,
        }
    }

    fn key_for(&self, node: &ServiceNode) -> String {
        node_key(&self.namespace, &node.meta.env, node.app_id(), node.lease_id)
    }
}

#[async_trait]
impl LeaseBackend for EtcdBackend {
    type Lease = EtcdLease;

    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn grant(&self, ttl: Duration) -> Result<EtcdLease> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl.as_secs() as i64, None)
            .await
            .map_err(etcd_error)?;
        Ok(EtcdLease {
            id: resp.id(),
            keep_alive: None,
        })
    }

    async fn put(&self, lease: &mut EtcdLease, node: &ServiceNode) -> Result<()> {
        let key = self.key_for(node);
        let value = node.encode()?;
        let mut client = self.client.clone();
        client
            .put(key.clone(), value, Some(PutOptions::new().with_lease(lease.id)))
            .await
            .map_err(etcd_error)?;
        trace!(key = %key, lease_id = lease.id, "Node written");
        Ok(())
    }

    async fn renew(&self, lease: &mut EtcdLease, _node: &ServiceNode) -> Result<()> {
        if lease.keep_alive.is_none() {
            let mut client = self.client.clone();
            let channel = client
                .lease_keep_alive(lease.id)
                .await
                .map_err(etcd_error)?;
            lease.keep_alive = Some(channel);
        }

        let result = match lease.keep_alive.as_mut() {
            Some((keeper, stream)) => keep_alive_once(keeper, stream).await,
            None => Err(Error::backend(BACKEND, "keep-alive channel missing")),
        };
        if result.is_err() {
            lease.keep_alive = None;
        }
        result
    }

    async fn revoke(&self, lease: EtcdLease) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease.id).await.map_err(etcd_error)?;
        Ok(())
    }

    /// A third of the TTL leaves two keep-alives of slack.
    fn renew_interval(&self, conf: &ServiceConf) -> Duration {
        conf.heartbeat_interval(3)
    }

    fn retry_backoff(&self, _ttl: Duration) -> Duration {
        self.retry_backoff
    }
}

/// Send one keep-alive and wait for its ack.
async fn keep_alive_once(
    keeper: &mut LeaseKeeper,
    stream: &mut LeaseKeepAliveStream,
) -> Result<()> {
    keeper.keep_alive().await.map_err(etcd_error)?;
    match stream.message().await {
        Ok(Some(resp)) if resp.ttl() > 0 => {
            trace!(lease_id = resp.id(), ttl = resp.ttl(), "Keep-alive OK");
            Ok(())
        }
        Ok(Some(_)) => Err(Error::backend(BACKEND, "lease expired")),
        Ok(None) => Err(Error::backend(BACKEND, "keep-alive stream closed")),
        Err(e) => Err(etcd_error(e)),
    }
}

/// Position in the etcd revision history.
///
/// Moves forward only, except when the server reports compaction. After
/// compaction the next batch must be a full reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchCursor {
    next: i64,
    resync: bool,
}

impl WatchCursor {
    /// Revision the next watch starts from.
    pub fn next_revision(&self) -> i64 {
        self.next
    }

    /// Whether events were lost and the prefix must be read again.
    pub fn needs_resync(&self) -> bool {
        self.resync
    }

    /// A snapshot was read at `revision`.
    pub fn on_snapshot(&mut self, revision: i64) {
        self.next = self.next.max(revision + 1);
        self.resync = false;
    }

    /// A watch response carried `header_revision`.
    pub fn advance(&mut self, header_revision: i64) {
        self.next = self.next.max(header_revision + 1);
    }

    /// Account for one watch response. The creation ack reports the current
    /// revision, not delivered history, so it does not move the cursor.
    pub fn on_response(&mut self, created: bool, header_revision: Option<i64>) {
        if created {
            return;
        }
        if let Some(revision) = header_revision {
            self.advance(revision);
        }
    }

    /// The watch was cancelled. Returns whether history was compacted past
    /// the cursor, in which case it jumps to just after the compaction point
    /// and asks for a reload.
    pub fn on_cancel(&mut self, compact_revision: i64) -> bool {
        if compact_revision > 0 {
            self.next = compact_revision + 1;
            self.resync = true;
            true
        } else {
            false
        }
    }
}

/// Identify the registration a delete event removed.
///
/// The key is authoritative; the previous value is a fallback for keys that
/// do not follow the layout.
pub fn delete_target(
    prefix: &str,
    key: &str,
    prev_value: Option<&[u8]>,
) -> Option<(String, LeaseId)> {
    if let Some((app_id, lease_id)) = parse_node_key(prefix, key) {
        return Some((app_id.to_string(), lease_id));
    }
    let node = ServiceNode::decode(prev_value?).ok()?;
    Some((node.meta.app_id, node.lease_id))
}

/// Map one watch event under `prefix` to a cache change.
pub fn change_for(
    prefix: &str,
    event_type: EventType,
    key: &[u8],
    value: &[u8],
    prev_value: Option<&[u8]>,
) -> Option<ChangeEvent> {
    match event_type {
        EventType::Put => Some(ChangeEvent::Put(value.to_vec())),
        EventType::Delete => {
            let key = String::from_utf8_lossy(key);
            match delete_target(prefix, &key, prev_value) {
                Some((app_id, lease_id)) => Some(ChangeEvent::Delete { app_id, lease_id }),
                None => {
                    warn!(key = %key, "Unrecognized key in delete event");
                    None
                }
            }
        }
    }
}

/// An open watch.
///
/// The watcher owns the request half of the bidirectional stream; etcd ends
/// the response stream once it is dropped, so both live and die together.
pub struct OpenWatch<W, S> {
    watcher: W,
    stream: S,
}

impl<W, S> OpenWatch<W, S> {
    pub fn new(watcher: W, stream: S) -> Self {
        Self { watcher, stream }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_watcher(self) -> W {
        self.watcher
    }
}

type EtcdWatch = OpenWatch<Watcher, WatchStream>;

/// Watch-based change feed for one env prefix.
pub struct EtcdChangeSource {
    client: Client,
    prefix: String,
    cursor: WatchCursor,
    watch: Option<EtcdWatch>,
    resubscribe_delay: Duration,
}

impl EtcdChangeSource {
    pub fn new(client: Client, conf: &ServiceConf, env: &str, config: &RegistryConfig) -> Self {
        Self {
            client,
            prefix: env_prefix(conf.namespace_or_default(), env),
            cursor: WatchCursor::default(),
            watch: None,
            resubscribe_delay: config.watch_resubscribe_delay,
        }
    }

    pub fn cursor(&self) -> WatchCursor {
        self.cursor
    }

    async fn load(&mut self) -> Result<Snapshot> {
        let resp = self
            .client
            .get(self.prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(etcd_error)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        self.cursor.on_snapshot(revision);

        let entries = resp.kvs().iter().map(|kv| kv.value().to_vec()).collect();
        debug!(
            prefix = %self.prefix,
            revision = revision,
            count = resp.kvs().len(),
            "Loaded etcd snapshot"
        );
        Ok(Snapshot::new(entries, RebuildPolicy::keep_all()))
    }

    async fn subscribe(&mut self) -> Result<EtcdWatch> {
        let options = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(self.cursor.next_revision());
        let (watcher, stream) = self
            .client
            .watch(self.prefix.clone(), Some(options))
            .await
            .map_err(etcd_error)?;
        debug!(
            prefix = %self.prefix,
            start_revision = self.cursor.next_revision(),
            watch_id = watcher.watch_id(),
            "Watch stream established"
        );
        Ok(OpenWatch::new(watcher, stream))
    }

    fn handle_response(&mut self, resp: WatchResponse) -> ChangeBatch {
        self.cursor
            .on_response(resp.created(), resp.header().map(|h| h.revision()));
        let changes = resp
            .events()
            .iter()
            .filter_map(|event| {
                let kv = event.kv()?;
                change_for(
                    &self.prefix,
                    event.event_type(),
                    kv.key(),
                    kv.value(),
                    event.prev_kv().map(|prev| prev.value()),
                )
            })
            .collect();
        ChangeBatch::Events(changes)
    }

    /// Close the current watch, best-effort cancelling it server-side.
    async fn close_watch(&mut self) {
        if let Some(watch) = self.watch.take() {
            let mut watcher = watch.into_watcher();
            if let Err(e) = watcher.cancel().await {
                trace!(error = %e, "Watch cancel not delivered");
            }
        }
    }

    async fn resubscribe_later(&mut self, reason: &str) -> ChangeBatch {
        self.close_watch().await;
        events::watch_resumed(BACKEND, reason);
        tokio::time::sleep(self.resubscribe_delay).await;
        ChangeBatch::Unchanged
    }
}

#[async_trait]
impl ChangeSource for EtcdChangeSource {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn bootstrap(&mut self) -> Result<Snapshot> {
        self.load().await
    }

    async fn next_batch(&mut self) -> Result<ChangeBatch> {
        if self.cursor.needs_resync() {
            let snapshot = self.load().await?;
            return Ok(ChangeBatch::Snapshot(snapshot));
        }

        if self.watch.is_none() {
            let watch = self.subscribe().await?;
            self.watch = Some(watch);
        }
        let Some(watch) = self.watch.as_mut() else {
            return Ok(ChangeBatch::Unchanged);
        };

        let message = watch.stream_mut().message().await;
        match message {
            Ok(Some(resp)) if resp.canceled() => {
                if self.cursor.on_cancel(resp.compact_revision()) {
                    // Events between the old cursor and the compaction point
                    // are gone; reload before watching again.
                    Ok(self.resubscribe_later("compacted").await)
                } else {
                    Ok(self.resubscribe_later("canceled").await)
                }
            }
            Ok(Some(resp)) => Ok(self.handle_response(resp)),
            Ok(None) => Ok(self.resubscribe_later("stream closed").await),
            Err(e) => {
                self.watch = None;
                Err(etcd_error(e))
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        self.resubscribe_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_is_monotonic() {
        let mut cursor = WatchCursor::default();
        cursor.on_snapshot(10);
        assert_eq!(cursor.next_revision(), 11);

        cursor.advance(15);
        assert_eq!(cursor.next_revision(), 16);
        cursor.advance(12);
        assert_eq!(cursor.next_revision(), 16);
        cursor.on_snapshot(3);
        assert_eq!(cursor.next_revision(), 16);
    }

    #[test]
    fn test_cursor_cancel_without_compaction_keeps_position() {
        let mut cursor = WatchCursor::default();
        cursor.advance(20);
        assert!(!cursor.on_cancel(0));
        assert!(!cursor.needs_resync());
        assert_eq!(cursor.next_revision(), 21);
    }

    #[test]
    fn test_cursor_jumps_past_compaction() {
        let mut cursor = WatchCursor::default();
        cursor.advance(20);
        assert!(cursor.on_cancel(40));
        assert_eq!(cursor.next_revision(), 41);
    }

    #[test]
    fn test_delete_target_from_key() {
        let prefix = env_prefix("waypoint", "prod");
        assert_eq!(
            delete_target(&prefix, "waypoint/prod/svc/7", None),
            Some(("svc".to_string(), 7))
        );
    }

    #[test]
    fn test_delete_target_falls_back_to_prev_value() {
        let prefix = env_prefix("waypoint", "prod");
        let prev = br#"{"lease_id":9,"meta":{"env":"prod","app_id":"svc"}}"#;
        assert_eq!(
            delete_target(&prefix, "waypoint/prod/odd-key", Some(prev)),
            Some(("svc".to_string(), 9))
        );
        assert_eq!(delete_target(&prefix, "waypoint/prod/odd-key", None), None);
    }

    #[test]
    fn test_created_ack_does_not_move_cursor() {
        let mut cursor = WatchCursor::default();
        cursor.on_snapshot(10);
        cursor.on_response(true, Some(30));
        assert_eq!(cursor.next_revision(), 11);
        cursor.on_response(false, Some(12));
        assert_eq!(cursor.next_revision(), 13);
        cursor.on_response(false, None);
        assert_eq!(cursor.next_revision(), 13);
    }

    #[test]
    fn test_compaction_requests_reload_until_snapshot() {
        let mut cursor = WatchCursor::default();
        cursor.on_snapshot(10);
        assert!(!cursor.needs_resync());

        assert!(cursor.on_cancel(40));
        assert!(cursor.needs_resync());
        assert_eq!(cursor.next_revision(), 41);

        // The reload is read after the compaction point.
        cursor.on_snapshot(55);
        assert!(!cursor.needs_resync());
        assert_eq!(cursor.next_revision(), 56);
    }

    #[test]
    fn test_change_for_maps_puts_and_deletes() {
        let prefix = env_prefix("waypoint", "prod");
        let value = br#"{"lease_id":7,"meta":{"env":"prod","app_id":"svc"}}"#;

        assert_eq!(
            change_for(&prefix, EventType::Put, b"waypoint/prod/svc/7", value, None),
            Some(ChangeEvent::Put(value.to_vec()))
        );
        assert_eq!(
            change_for(&prefix, EventType::Delete, b"waypoint/prod/svc/7", b"", None),
            Some(ChangeEvent::Delete {
                app_id: "svc".to_string(),
                lease_id: 7
            })
        );
        assert_eq!(
            change_for(&prefix, EventType::Delete, b"waypoint/prod/odd", b"", Some(value)),
            Some(ChangeEvent::Delete {
                app_id: "svc".to_string(),
                lease_id: 7
            })
        );
        assert_eq!(
            change_for(&prefix, EventType::Delete, b"waypoint/prod/odd", b"", None),
            None
        );
    }

    #[test]
    fn test_open_watch_keeps_watcher_alive() {
        use std::sync::Arc;

        let watcher = Arc::new(());
        let mut watch = OpenWatch::new(watcher.clone(), vec![1u8]);
        assert_eq!(Arc::strong_count(&watcher), 2);

        watch.stream_mut().push(2);
        assert_eq!(Arc::strong_count(&watcher), 2);

        let released = watch.into_watcher();
        assert_eq!(Arc::strong_count(&watcher), 2);
        drop(released);
        assert_eq!(Arc::strong_count(&watcher), 1);
    }
}
