//! Registration Session
//!
//! Owns one registration handle and the last node written under it. The
//! lifecycle is install -> heartbeat loop -> bounded recovery -> uninstall:
//!
//! - `install` stamps the node with session identity and writes it.
//! - `sustain_lease` renews on a fixed period. A failed renewal moves the
//!   session to `Degraded` and starts recovery: hook, backoff, re-grant,
//!   re-write of the last node. Success returns to `Healthy`; `max_retry`
//!   failures in a row make the session `Terminal` until the next install.
//! - `uninstall` cancels the loop and revokes best-effort.
//!
//! Every backend call in the loop races the session's cancellation token.

mod hooks;
mod lease;
mod state;

pub use hooks::{LogSink, RetryHook, TracingSink};
pub use lease::{local_lease_id, LeaseBackend, LeaseHandle};
pub use state::{SessionExit, SessionState};

use crate::observability::{events, metrics};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Level};
use waypoint_core::node::{now_local, DEFAULT_WEIGHT};
use waypoint_core::{Error, LeaseId, Meta, Result, ServiceConf, ServiceNode};

/// Upper bound on best-effort revokes so shutdown never hangs on a dead backend.
const REVOKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A renewable registration of one node.
pub struct RegistrationSession<B: LeaseBackend> {
    inner: Arc<SessionInner<B>>,
}

impl<B: LeaseBackend> Clone for RegistrationSession<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SessionInner<B: LeaseBackend> {
    backend: B,
    conf: ServiceConf,
    meta: Mutex<Meta>,
    lease: tokio::sync::Mutex<Option<B::Lease>>,
    last_node: Mutex<Option<ServiceNode>>,
    retries: AtomicU32,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    retry_before: Option<Box<dyn RetryHook>>,
    retry_after: Option<Box<dyn RetryHook>>,
    log: Box<dyn LogSink>,
}

/// Collects observers before the initial lease is granted.
pub struct SessionBuilder<B: LeaseBackend> {
    backend: B,
    meta: Meta,
    conf: ServiceConf,
    retry_before: Option<Box<dyn RetryHook>>,
    retry_after: Option<Box<dyn RetryHook>>,
    log: Option<Box<dyn LogSink>>,
}

impl<B: LeaseBackend> SessionBuilder<B> {
    /// Called before every recovery attempt.
    pub fn with_retry_before<H: RetryHook + 'static>(mut self, hook: H) -> Self {
        self.retry_before = Some(Box::new(hook));
        self
    }

    /// Called after a successful recovery.
    pub fn with_retry_after<H: RetryHook + 'static>(mut self, hook: H) -> Self {
        self.retry_after = Some(Box::new(hook));
        self
    }

    /// Destination for the session's own log lines.
    pub fn with_log<S: LogSink + 'static>(mut self, sink: S) -> Self {
        self.log = Some(Box::new(sink));
        self
    }

    /// Apply config floors and grant the initial lease.
    pub async fn connect(self) -> Result<RegistrationSession<B>> {
        let mut conf = self.conf;
        conf.bootstrap();

        let (state, _) = watch::channel(SessionState::Healthy);
        let inner = SessionInner {
            backend: self.backend,
            conf,
            meta: Mutex::new(self.meta),
            lease: tokio::sync::Mutex::new(None),
            last_node: Mutex::new(None),
            retries: AtomicU32::new(0),
            cancel: CancellationToken::new(),
            state,
            retry_before: self.retry_before,
            retry_after: self.retry_after,
            log: self.log.unwrap_or_else(|| Box::new(TracingSink)),
        };

        let lease = inner.grant().await?;
        *inner.lease.lock().await = Some(lease);

        Ok(RegistrationSession {
            inner: Arc::new(inner),
        })
    }
}

impl<B: LeaseBackend> RegistrationSession<B> {
    /// Start building a session. `meta` may be partial; empty fields are
    /// filled from the first installed node.
    pub fn builder(backend: B, meta: Meta, conf: ServiceConf) -> SessionBuilder<B> {
        SessionBuilder {
            backend,
            meta,
            conf,
            retry_before: None,
            retry_after: None,
            log: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Bootstrapped configuration (floors applied).
    pub fn conf(&self) -> &ServiceConf {
        &self.inner.conf
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed recovery attempts.
    pub fn retry_count(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Last node written, as published.
    pub fn last_node(&self) -> Option<ServiceNode> {
        self.inner.last_node.lock().clone()
    }

    /// Currently held registration handle.
    pub async fn lease_id(&self) -> Option<LeaseId> {
        self.inner.lease.lock().await.as_ref().map(LeaseHandle::id)
    }

    /// Stamp `node` with session identity and write it under the current
    /// lease, acquiring a new one if the session lost it.
    pub async fn install(&self, mut node: ServiceNode) -> Result<()> {
        let inner = &self.inner;

        node.meta = {
            let mut meta = inner.meta.lock();
            meta.backfill(&node.meta);
            meta.validate()?;
            meta.clone()
        };
        node.kernel = inner.conf.kernel.clone();
        node.network = inner.conf.network.clone();
        if node.weight == 0 {
            node.weight = DEFAULT_WEIGHT;
        }

        let mut slot = inner.lease.lock().await;
        if inner.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        let mut lease = match slot.take() {
            Some(lease) => lease,
            None => inner.grant().await?,
        };
        node.lease_id = lease.id();
        node.stamp(now_local());
        *inner.last_node.lock() = Some(node.clone());

        let written = inner.backend.put(&mut lease, &node).await;
        *slot = Some(lease);
        written?;
        drop(slot);

        inner.retries.store(0, Ordering::SeqCst);
        inner.state.send_replace(SessionState::Healthy);
        events::node_installed(
            inner.backend.name(),
            node.app_id(),
            &node.meta.env,
            node.lease_id,
            node.methods.len(),
        );
        Ok(())
    }

    /// Keep the registration alive until cancelled or recovery is exhausted.
    ///
    /// Never raises; the exit reason and the state channel tell callers what
    /// happened.
    pub async fn sustain_lease(&self) -> SessionExit {
        let inner = &self.inner;
        let period = inner.backend.renew_interval(&inner.conf);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip first immediate tick

        debug!(
            backend = inner.backend.name(),
            period_ms = period.as_millis() as u64,
            "Sustaining lease"
        );

        loop {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return inner.cancelled(),
                _ = ticker.tick() => {}
            }

            let renewed = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return inner.cancelled(),
                result = inner.renew() => result,
            };

            match renewed {
                Ok(()) => {
                    inner.retries.store(0, Ordering::SeqCst);
                    metrics::record_lease_renewal(inner.backend.name());
                }
                Err(e) => {
                    inner.log(
                        Level::WARN,
                        &format!("{} lease renewal failed: {e}", inner.backend.name()),
                    );
                    inner.state.send_replace(SessionState::Degraded);
                    if let Some(exit) = inner.recover(e).await {
                        return exit;
                    }
                    ticker.reset();
                }
            }
        }
    }

    /// Cancel the heartbeat loop and revoke the registration best-effort.
    pub async fn uninstall(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.state.send_replace(SessionState::Cancelled);

        let lease = inner.lease.lock().await.take();
        if let Some(lease) = lease {
            let lease_id = lease.id();
            match tokio::time::timeout(REVOKE_TIMEOUT, inner.backend.revoke(lease)).await {
                Ok(Ok(())) => debug!(lease_id = lease_id, "Lease revoked"),
                Ok(Err(e)) => warn!(lease_id = lease_id, error = %e, "Failed to revoke lease"),
                Err(_) => warn!(lease_id = lease_id, "Timed out revoking lease"),
            }
        }
    }
}

impl<B: LeaseBackend> SessionInner<B> {
    fn log(&self, level: Level, message: &str) {
        self.log.log(level, message);
    }

    async fn grant(&self) -> Result<B::Lease> {
        let ttl = self.conf.ttl();
        let lease = self.backend.grant(ttl).await?;
        events::lease_granted(self.backend.name(), lease.id(), ttl.as_secs());
        Ok(lease)
    }

    /// One heartbeat for the current lease.
    async fn renew(&self) -> Result<()> {
        let Some(mut node) = self.last_node.lock().clone() else {
            trace!("Nothing installed yet, skipping renewal");
            return Ok(());
        };

        let mut slot = self.lease.lock().await;
        let Some(lease) = slot.as_mut() else {
            return Err(Error::backend(self.backend.name(), "no lease held"));
        };
        node.lease_id = lease.id();
        node.stamp(now_local());
        self.backend.renew(lease, &node).await?;
        drop(slot);

        trace!(lease_id = node.lease_id, "Lease renewed");
        *self.last_node.lock() = Some(node);
        Ok(())
    }

    /// Bounded recovery. `None` means the lease is back; `Some` is the exit
    /// reason for `sustain_lease`.
    async fn recover(&self, cause: Error) -> Option<SessionExit> {
        let name = self.backend.name();
        let max_retry = self.conf.max_retry;
        let backoff = self.backend.retry_backoff(self.conf.ttl());
        let mut reason = cause.to_string();

        loop {
            let attempts = self.retries.load(Ordering::SeqCst);
            if attempts >= max_retry {
                self.abandon(attempts).await;
                return Some(SessionExit::Exhausted { attempts });
            }

            if let Some(hook) = &self.retry_before {
                hook.on_retry();
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(self.cancelled()),
                _ = tokio::time::sleep(backoff) => {}
            }

            let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
            events::lease_retry(name, attempt, max_retry, &reason);
            metrics::record_lease_retry(name);
            self.log(
                Level::INFO,
                &format!("{name} retry lease: {attempt}/{max_retry}"),
            );

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(self.cancelled()),
                result = self.reacquire() => result,
            };

            match result {
                Ok(lease_id) => {
                    if let Some(hook) = &self.retry_after {
                        hook.on_retry();
                    }
                    self.retries.store(0, Ordering::SeqCst);
                    self.state.send_replace(SessionState::Healthy);
                    events::lease_recovered(name, lease_id, attempt);
                    return None;
                }
                Err(e) => {
                    self.log(Level::WARN, &format!("{name} lease recovery failed: {e}"));
                    reason = e.to_string();
                }
            }
        }
    }

    /// Replace the lost lease and re-write the last node under the new one.
    async fn reacquire(&self) -> Result<LeaseId> {
        let mut slot = self.lease.lock().await;
        if let Some(stale) = slot.take() {
            let stale_id = stale.id();
            match tokio::time::timeout(REVOKE_TIMEOUT, self.backend.revoke(stale)).await {
                Ok(Ok(())) => trace!(lease_id = stale_id, "Stale lease revoked"),
                Ok(Err(e)) => trace!(lease_id = stale_id, error = %e, "Stale lease not revoked"),
                Err(_) => trace!(lease_id = stale_id, "Timed out revoking stale lease"),
            }
        }

        // Held in the slot from the moment it exists, so an uninstall that
        // interrupts the write below still finds and revokes it.
        let lease = slot.insert(self.grant().await?);
        let lease_id = lease.id();

        let last = self.last_node.lock().clone();
        if let Some(mut node) = last {
            node.lease_id = lease_id;
            node.stamp(now_local());
            if let Err(e) = self.backend.put(lease, &node).await {
                if let Some(lease) = slot.take() {
                    let _ = tokio::time::timeout(REVOKE_TIMEOUT, self.backend.revoke(lease)).await;
                }
                return Err(e);
            }
            *self.last_node.lock() = Some(node);
        }

        Ok(lease_id)
    }

    async fn abandon(&self, attempts: u32) {
        // The lease is presumed gone; the next install grants a fresh one.
        self.lease.lock().await.take();
        self.state.send_replace(SessionState::Terminal);
        events::lease_abandoned(self.backend.name(), attempts);
        metrics::record_lease_abandoned(self.backend.name());
        self.log(
            Level::ERROR,
            &format!(
                "{} lease recovery exhausted after {attempts} attempts",
                self.backend.name()
            ),
        );
    }

    fn cancelled(&self) -> SessionExit {
        self.state.send_replace(SessionState::Cancelled);
        SessionExit::Cancelled
    }
}
