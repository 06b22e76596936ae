//! In-process Replicated Store
//!
//! A single shared store that every node of a local cluster connects to
//! through its own [`StoreHandle`]. All operations serialize on one lock,
//! which makes every read linearizable. Leases expire lazily: each
//! operation first purges expired leases and their keys.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch, Mutex};

use super::{ConsensusStore, KeyValue, LeaseId, MemberId, Revision, WatchEvent, WatchStream};
use crate::error::{Error, Result};

/// Capacity of the watch event channel
const WATCH_CHANNEL_SIZE: usize = 1024;

struct Lease {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

#[derive(Default)]
struct StoreState {
    revision: Revision,
    data: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    /// Joined member names and their ids
    members: HashMap<String, MemberId>,
}

impl StoreState {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }

    /// Drop expired leases together with their keys
    fn purge_expired(&mut self, now: Instant, events: &broadcast::Sender<WatchEvent>) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            tracing::debug!("Lease {} expired", id);
            self.drop_lease(id, events);
        }
    }

    fn drop_lease(&mut self, id: LeaseId, events: &broadcast::Sender<WatchEvent>) {
        let Some(lease) = self.leases.remove(&id) else {
            return;
        };
        for key in lease.keys {
            if let Some(kv) = self.data.remove(&key) {
                self.next_revision();
                let _ = events.send(WatchEvent::Delete(kv));
            }
        }
    }

    fn detach(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(id) = lease {
            if let Some(lease) = self.leases.get_mut(&id) {
                lease.keys.remove(key);
            }
        }
    }

    fn write(
        &mut self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        events: &broadcast::Sender<WatchEvent>,
    ) -> Result<Revision> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(Error::LeaseExpired(id));
            }
        }

        let previous = self.data.get(key).map(|kv| (kv.create_revision, kv.lease));
        if let Some((_, old_lease)) = previous {
            self.detach(key, old_lease);
        }

        let revision = self.next_revision();
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: previous.map(|(created, _)| created).unwrap_or(revision),
            mod_revision: revision,
            lease,
        };

        if let Some(id) = lease {
            if let Some(lease) = self.leases.get_mut(&id) {
                lease.keys.insert(key.to_string());
            }
        }

        self.data.insert(key.to_string(), kv.clone());
        let _ = events.send(WatchEvent::Put(kv));
        Ok(revision)
    }
}

/// Shared backing store for a local cluster
pub struct ReplicatedStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<WatchEvent>,
    paused: watch::Sender<bool>,
}

impl ReplicatedStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_SIZE);
        let (paused, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(StoreState {
                next_lease: 1,
                ..StoreState::default()
            }),
            events,
            paused,
        })
    }

    /// Open a handle for the node called `node`
    pub fn connect(self: &Arc<Self>, node: &str) -> Arc<StoreHandle> {
        Arc::new(StoreHandle {
            node: node.to_string(),
            backend: Arc::clone(self),
            closed: AtomicBool::new(false),
        })
    }

    /// Stall every operation until [`resume`](Self::resume) is called
    pub fn pause(&self) {
        self.paused.send_replace(true);
        tracing::warn!("Replicated store paused");
    }

    /// Let stalled operations proceed
    pub fn resume(&self) {
        self.paused.send_replace(false);
        tracing::info!("Replicated store resumed");
    }

    /// Current store revision
    pub async fn revision(&self) -> Revision {
        self.state.lock().await.revision
    }

    async fn wait_unpaused(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Lock the state after waiting out a pause and purging expired leases
    async fn lock(&self) -> tokio::sync::MutexGuard<'_, StoreState> {
        self.wait_unpaused().await;
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now(), &self.events);
        state
    }
}

/// One node's connection to a [`ReplicatedStore`]
pub struct StoreHandle {
    node: String,
    backend: Arc<ReplicatedStore>,
    closed: AtomicBool,
}

impl StoreHandle {
    /// Name of the node owning this handle
    pub fn node(&self) -> &str {
        &self.node
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Store(format!("node {} is disconnected from the store", self.node)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConsensusStore for StoreHandle {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check_open()?;
        let state = self.backend.lock().await;
        Ok(state.data.get(key).cloned())
    }

    async fn range(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check_open()?;
        let state = self.backend.lock().await;
        Ok(state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        self.check_open()?;
        let mut state = self.backend.lock().await;
        state.write(key, value, lease, &self.backend.events)
    }

    async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<bool> {
        self.check_open()?;
        let mut state = self.backend.lock().await;
        if state.data.contains_key(key) {
            return Ok(false);
        }
        state.write(key, value, lease, &self.backend.events)?;
        Ok(true)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        expected: Revision,
    ) -> Result<bool> {
        self.check_open()?;
        let mut state = self.backend.lock().await;
        match state.data.get(key) {
            Some(kv) if kv.mod_revision == expected => {}
            _ => return Ok(false),
        }
        state.write(key, value, lease, &self.backend.events)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check_open()?;
        let mut state = self.backend.lock().await;
        let Some(kv) = state.data.remove(key) else {
            return Ok(None);
        };
        state.detach(key, kv.lease);
        state.next_revision();
        let _ = self.backend.events.send(WatchEvent::Delete(kv.clone()));
        Ok(Some(kv))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.check_open()?;
        let mut state = self.backend.lock().await;
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        self.check_open()?;
        let mut state = self.backend.lock().await;
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(Error::LeaseExpired(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.check_open()?;
        let mut state = self.backend.lock().await;
        state.drop_lease(lease, &self.backend.events);
        Ok(())
    }

    fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.check_open()?;
        Ok(WatchStream::new(prefix, self.backend.events.subscribe()))
    }

    async fn join(&self, name: &str) -> Result<MemberId> {
        self.check_open()?;
        let mut state = self.backend.lock().await;
        if let Some(id) = state.members.get(name) {
            return Ok(*id);
        }

        let taken: HashSet<MemberId> = state.members.values().copied().collect();
        let id = loop {
            let candidate: MemberId = rand::random();
            if candidate != 0 && !taken.contains(&candidate) {
                break candidate;
            }
        };
        state.members.insert(name.to_string(), id);
        tracing::info!("{} joined the store as member {:x}", name, id);
        Ok(id)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Store handle for {} closed", self.node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");

        handle.put("/a", b"1".to_vec(), None).await.unwrap();
        let kv = handle.get("/a").await.unwrap().unwrap();
        assert_eq!(kv.value, b"1");
        assert_eq!(kv.create_revision, kv.mod_revision);

        handle.put("/a", b"2".to_vec(), None).await.unwrap();
        let updated = handle.get("/a").await.unwrap().unwrap();
        assert_eq!(updated.create_revision, kv.create_revision);
        assert!(updated.mod_revision > kv.mod_revision);

        assert!(handle.delete("/a").await.unwrap().is_some());
        assert!(handle.delete("/a").await.unwrap().is_none());
        assert!(handle.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_range_is_prefix_bounded_and_ordered() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");

        handle.put("/m/b", vec![], None).await.unwrap();
        handle.put("/m/a", vec![], None).await.unwrap();
        handle.put("/n/a", vec![], None).await.unwrap();

        let keys: Vec<_> = handle
            .range("/m/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/m/a", "/m/b"]);
    }

    #[tokio::test]
    async fn test_create_only_once() {
        let store = ReplicatedStore::new();
        let a = store.connect("pd1");
        let b = store.connect("pd2");

        assert!(a.create("/leader", b"a".to_vec(), None).await.unwrap());
        assert!(!b.create("/leader", b"b".to_vec(), None).await.unwrap());
        assert_eq!(b.get("/leader").await.unwrap().unwrap().value, b"a");
    }

    #[tokio::test]
    async fn test_compare_and_put_needs_current_revision() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");

        let first = handle.put("/m/a", b"1".to_vec(), None).await.unwrap();
        let second = handle.put("/m/a", b"2".to_vec(), None).await.unwrap();

        assert!(!handle.compare_and_put("/m/a", b"3".to_vec(), None, first).await.unwrap());
        assert!(handle.compare_and_put("/m/a", b"3".to_vec(), None, second).await.unwrap());
        assert_eq!(handle.get("/m/a").await.unwrap().unwrap().value, b"3");

        let current = handle.delete("/m/a").await.unwrap().unwrap().mod_revision;
        assert!(!handle.compare_and_put("/m/a", b"4".to_vec(), None, current).await.unwrap());
        assert!(handle.get("/m/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_expiry_removes_keys() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");

        let lease = handle.grant_lease(Duration::from_millis(50)).await.unwrap();
        handle.put("/leader", b"x".to_vec(), Some(lease)).await.unwrap();
        assert!(handle.get("/leader").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(handle.get("/leader").await.unwrap().is_none());
        assert!(matches!(
            handle.keep_alive(lease).await,
            Err(Error::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke_removes_keys() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");

        let lease = handle.grant_lease(Duration::from_secs(60)).await.unwrap();
        handle.put("/leader", b"x".to_vec(), Some(lease)).await.unwrap();
        handle.revoke(lease).await.unwrap();
        assert!(handle.get("/leader").await.unwrap().is_none());
        assert!(matches!(
            handle.put("/leader", b"y".to_vec(), Some(lease)).await,
            Err(Error::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_sees_prefix_events() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");
        let mut watch = handle.watch("/m/").unwrap();

        handle.put("/other", vec![], None).await.unwrap();
        handle.put("/m/a", vec![], None).await.unwrap();
        handle.delete("/m/a").await.unwrap();

        assert!(matches!(watch.next().await, Some(WatchEvent::Put(kv)) if kv.key == "/m/a"));
        assert!(matches!(watch.next().await, Some(WatchEvent::Delete(kv)) if kv.key == "/m/a"));
    }

    #[tokio::test]
    async fn test_join_is_stable_per_name() {
        let store = ReplicatedStore::new();
        let a = store.connect("pd1");
        let b = store.connect("pd2");

        let id1 = a.join("pd1").await.unwrap();
        let id2 = b.join("pd2").await.unwrap();
        assert_ne!(id1, id2);
        assert_eq!(a.join("pd1").await.unwrap(), id1);
    }

    #[tokio::test]
    async fn test_closed_handle_fails() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");
        handle.close();
        assert!(matches!(handle.get("/a").await, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn test_pause_stalls_operations() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");

        store.pause();
        let stalled = tokio::time::timeout(Duration::from_millis(50), handle.get("/a")).await;
        assert!(stalled.is_err());

        store.resume();
        assert!(handle.get("/a").await.unwrap().is_none());
    }
}
