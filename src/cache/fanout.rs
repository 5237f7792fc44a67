//! Per-subscriber replication of update batches.
//!
//! Every subscriber owns a pending queue the cache appends to under the
//! write lock; a driver loop drains it through [`AttributeCache::send`]
//! with at most one delivery in flight per subscriber. A slow mirror
//! accumulates pending records but never blocks the writer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::attr::{FileAttr, FileSet};

use super::{snapshot_locked, AttributeCache, State};

/// Push channel to one replica. Implementations typically wrap an RPC
/// connection; `send` blocks until the mirror acknowledged the batch.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Identity of the replica, unique within one cache.
    fn id(&self) -> String;

    /// Delivers a batch downstream. Called at most once concurrently per
    /// subscriber.
    async fn send(&self, batch: &[FileAttr]) -> Result<(), SendError>;
}

/// Failure surfaced by [`AttributeCache::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The subscriber was removed while a delivery was pending. The drained
    /// batch is lost; a reconnecting replica starts from a fresh snapshot.
    Disappeared(String),
    /// The downstream transport rejected the batch.
    Downstream(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disappeared(id) => write!(f, "subscriber {id:?} disappeared"),
            SendError::Downstream(message) => write!(f, "downstream send failed: {message}"),
        }
    }
}

impl std::error::Error for SendError {}

pub(crate) struct ClientState {
    pub(crate) client: Arc<dyn Subscriber>,
    pub(crate) pending: Vec<FileAttr>,
    pub(crate) busy: bool,
}

/// Appends a batch to every subscriber's pending queue. Runs under the
/// cache write lock, inside the same critical section as the map mutation.
pub(crate) fn queue_locked(state: &mut State, batch: &FileSet) {
    for entry in state.clients.values_mut() {
        entry.pending.extend(batch.files.iter().cloned());
    }
}

impl AttributeCache {
    /// Registers a replica. Its pending queue is seeded with a full sorted
    /// snapshot taken under the same lock acquisition, so the first
    /// delivery brings it to the exact current state. A colliding id is a
    /// programmer error and aborts.
    pub async fn add_client(&self, client: Arc<dyn Subscriber>) {
        let id = client.id();
        let mut state = self.state.write().await;
        if state.clients.contains_key(&id) {
            panic!("subscriber id {id:?} already registered");
        }
        let pending = snapshot_locked(&state).files;
        debug!(id = %id, seeded = pending.len(), "subscriber added");
        state.clients.insert(id, ClientState { client, pending, busy: false });
    }

    /// Drops a replica and wakes any delivery waiting on it.
    pub async fn rm_client(&self, id: &str) {
        let mut state = self.state.write().await;
        if state.clients.remove(id).is_some() {
            debug!(id = %id, "subscriber removed");
            self.wakeup.notify_waiters();
        }
    }

    /// Drains the subscriber's pending queue in one delivery. Waits until
    /// no other delivery to the same subscriber is in flight; returns
    /// immediately when nothing is pending. The queue is cleared before the
    /// downstream call, so on failure the caller decides whether to tear
    /// the replica down or resume.
    pub async fn send(&self, id: &str) -> Result<(), SendError> {
        let (client, batch) = loop {
            let mut state = self.state.write().await;
            let entry = match state.clients.get_mut(id) {
                Some(entry) => entry,
                None => return Err(SendError::Disappeared(id.to_owned())),
            };
            if entry.busy {
                self.wait_broadcast(state).await;
                continue;
            }
            if entry.pending.is_empty() {
                return Ok(());
            }
            let batch = std::mem::take(&mut entry.pending);
            entry.busy = true;
            break (entry.client.clone(), batch);
        };

        debug!(id = %id, records = batch.len(), "delivering batch");
        let result = client.send(&batch).await;

        let mut state = self.state.write().await;
        if let Some(entry) = state.clients.get_mut(id) {
            entry.busy = false;
        }
        drop(state);
        self.wakeup.notify_waiters();
        result
    }
}
