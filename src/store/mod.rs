//! Consensus Store Module
//!
//! The linearizable key-value store that membership and leadership data
//! live in. Everything above this module talks to it through the
//! [`ConsensusStore`] trait so the backing store is injected per node.

mod memory;

pub use memory::{ReplicatedStore, StoreHandle};

use std::time::Duration;

use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::Result;

/// Identity the store assigns to a member at join time
pub type MemberId = u64;

/// Handle of a granted lease
pub type LeaseId = u64;

/// Store-wide modification counter
pub type Revision = u64;

/// A stored key and its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created
    pub create_revision: Revision,
    /// Revision of the last modification
    pub mod_revision: Revision,
    /// Lease the key is attached to, if any
    pub lease: Option<LeaseId>,
}

/// Change notification delivered to watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete(KeyValue),
}

impl WatchEvent {
    /// Key the event refers to
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) | WatchEvent::Delete(kv) => &kv.key,
        }
    }
}

/// Stream of changes under a key prefix
pub struct WatchStream {
    prefix: String,
    inner: BroadcastStream<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(prefix: &str, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.to_string(),
            inner: BroadcastStream::new(rx),
        }
    }

    /// Wait for the next event under the watched prefix
    ///
    /// Returns `None` once the store is dropped. A watcher that falls behind
    /// skips the missed events; callers re-read the store after waking.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        while let Some(item) = self.inner.next().await {
            match item {
                Ok(event) if event.key().starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::debug!("Watcher on {} lagged by {} events", self.prefix, missed);
                }
            }
        }
        None
    }
}

/// Linearizable replicated key-value store
#[async_trait::async_trait]
pub trait ConsensusStore: Send + Sync {
    /// Read one key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Read every key under a prefix, ordered by key
    async fn range(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Write a key, optionally attached to a lease
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision>;

    /// Write a key only if it does not exist; returns whether it was written
    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<bool>;

    /// Write a key only if its current mod revision is `expected`; returns
    /// whether it was written. An absent key never matches.
    async fn compare_and_put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        expected: Revision,
    ) -> Result<bool>;

    /// Remove a key atomically; returns the removed entry
    async fn delete(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Grant a lease that expires after `ttl` without keep-alives
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease; fails with `LeaseExpired` if it is gone
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revoke a lease and delete its keys
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Subscribe to changes under a prefix
    fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Join the consensus group under `name`, returning the member id
    async fn join(&self, name: &str) -> Result<MemberId>;

    /// Disconnect this node; later calls fail
    fn close(&self) {}
}
