//! Change sources
//!
//! Backends differ only in how changes arrive: pushed events, long-poll
//! snapshots or periodic snapshots. A source hides that behind one call that
//! yields the next batch; the cache turns batches into index updates.

use async_trait::async_trait;
use std::time::Duration;
use waypoint_core::{LeaseId, RebuildPolicy, Result};

/// One incremental change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A node was written; raw stored value.
    Put(Vec<u8>),
    /// A node's registration disappeared.
    Delete { app_id: String, lease_id: LeaseId },
}

/// Full dataset of one env, still encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub entries: Vec<Vec<u8>>,
    pub policy: RebuildPolicy,
}

impl Snapshot {
    pub fn new(entries: Vec<Vec<u8>>, policy: RebuildPolicy) -> Self {
        Self { entries, policy }
    }
}

/// What a source produced on one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeBatch {
    /// Apply incrementally, in order.
    Events(Vec<ChangeEvent>),
    /// Replace the whole index.
    Snapshot(Snapshot),
    /// Nothing changed since the last batch.
    Unchanged,
}

/// Backend change feed for one `(namespace, env)`.
#[async_trait]
pub trait ChangeSource: Send + 'static {
    /// Short backend name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Read the full dataset and remember where it was taken.
    async fn bootstrap(&mut self) -> Result<Snapshot>;

    /// Wait for the next batch after the remembered position.
    ///
    /// Must be cancel-safe: the cache drops the future on shutdown and the
    /// position must not have moved for a batch that was never returned.
    async fn next_batch(&mut self) -> Result<ChangeBatch>;

    /// Backoff after `next_batch` fails.
    fn retry_delay(&self) -> Duration;
}
