//! Member Registry
//!
//! Reads and writes member records through the consensus store. Nothing is
//! cached here: every call goes to the store, so reads are as fresh as the
//! store's own reads.

use std::sync::Arc;
use std::time::Duration;

use super::membership::Member;
use super::with_deadline;
use crate::error::{Error, Result};
use crate::store::ConsensusStore;

/// Key prefix under which member records live
pub const MEMBERS_PREFIX: &str = "/wolfmeta/members/";

/// Store key of a member record
pub fn member_key(name: &str) -> String {
    format!("{}{}", MEMBERS_PREFIX, name)
}

/// Directory of cluster members backed by the consensus store
pub struct MemberRegistry {
    store: Arc<dyn ConsensusStore>,
    request_timeout: Duration,
}

impl MemberRegistry {
    /// Create a registry reading through `store`
    pub fn new(store: Arc<dyn ConsensusStore>, request_timeout: Duration) -> Self {
        Self {
            store,
            request_timeout,
        }
    }

    /// All current members, ordered by name
    pub async fn list(&self) -> Result<Vec<Member>> {
        let entries = with_deadline(
            self.request_timeout,
            "list members",
            self.store.range(MEMBERS_PREFIX),
        )
        .await?;

        entries
            .iter()
            .map(|kv| bincode::deserialize::<Member>(&kv.value).map_err(Error::from))
            .collect()
    }

    /// Number of current members
    pub async fn count(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    /// Look up a member by exact name
    pub async fn get(&self, name: &str) -> Result<Member> {
        let entry = with_deadline(
            self.request_timeout,
            "get member",
            self.store.get(&member_key(name)),
        )
        .await?;

        match entry {
            Some(kv) => Ok(bincode::deserialize(&kv.value)?),
            None => Err(Error::MemberNotFound(name.to_string())),
        }
    }

    /// Remove a member by exact name
    ///
    /// A single store delete; of two concurrent deletes of one name exactly
    /// one sees the record. A missing record is `MemberNotFound` whether it
    /// never existed or was removed before.
    pub async fn delete(&self, name: &str) -> Result<Member> {
        let removed = with_deadline(
            self.request_timeout,
            "delete member",
            self.store.delete(&member_key(name)),
        )
        .await?;

        match removed {
            Some(kv) => {
                let member: Member = bincode::deserialize(&kv.value)?;
                tracing::info!("Removed member {} ({:x})", member.name, member.id);
                Ok(member)
            }
            None => Err(Error::MemberNotFound(name.to_string())),
        }
    }

    /// Register a member at join time
    ///
    /// A member restarting under its old id replaces its record (its URLs
    /// may have changed). Another id already holding the name is rejected.
    /// A record removed while it is being replaced stays removed.
    pub async fn register(&self, member: &Member) -> Result<()> {
        member.validate()?;
        let key = member_key(&member.name);
        let value = bincode::serialize(member)?;

        let created = with_deadline(
            self.request_timeout,
            "register member",
            self.store.create(&key, value.clone(), None),
        )
        .await?;
        if created {
            tracing::info!("Registered member {} ({:x})", member.name, member.id);
            return Ok(());
        }

        loop {
            let existing = with_deadline(
                self.request_timeout,
                "register member",
                self.store.get(&key),
            )
            .await?
            .ok_or_else(|| Error::MemberNotFound(member.name.clone()))?;

            let current: Member = bincode::deserialize(&existing.value)?;
            if current.id != member.id {
                return Err(Error::DuplicateMember(member.name.clone()));
            }

            let replaced = with_deadline(
                self.request_timeout,
                "register member",
                self.store
                    .compare_and_put(&key, value.clone(), None, existing.mod_revision),
            )
            .await?;
            if replaced {
                tracing::info!("Re-registered member {} ({:x})", member.name, member.id);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::store::{KeyValue, LeaseId, MemberId, ReplicatedStore, Revision, StoreHandle, WatchStream};

    /// Store whose first `get` is followed by a delete of the same key, as if
    /// another node removed the record right after we read it
    struct DeleteAfterRead {
        inner: Arc<StoreHandle>,
        armed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ConsensusStore for DeleteAfterRead {
        async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
            let found = self.inner.get(key).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.delete(key).await?;
            }
            Ok(found)
        }

        async fn range(&self, prefix: &str) -> Result<Vec<KeyValue>> {
            self.inner.range(prefix).await
        }

        async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
            self.inner.put(key, value, lease).await
        }

        async fn create(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<bool> {
            self.inner.create(key, value, lease).await
        }

        async fn compare_and_put(
            &self,
            key: &str,
            value: Vec<u8>,
            lease: Option<LeaseId>,
            expected: Revision,
        ) -> Result<bool> {
            self.inner.compare_and_put(key, value, lease, expected).await
        }

        async fn delete(&self, key: &str) -> Result<Option<KeyValue>> {
            self.inner.delete(key).await
        }

        async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
            self.inner.grant_lease(ttl).await
        }

        async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
            self.inner.keep_alive(lease).await
        }

        async fn revoke(&self, lease: LeaseId) -> Result<()> {
            self.inner.revoke(lease).await
        }

        fn watch(&self, prefix: &str) -> Result<WatchStream> {
            self.inner.watch(prefix)
        }

        async fn join(&self, name: &str) -> Result<MemberId> {
            self.inner.join(name).await
        }
    }

    fn member(name: &str, id: u64) -> Member {
        Member::new(
            name.to_string(),
            id,
            vec![format!("http://{}.local:2379", name)],
            vec![format!("http://{}.local:2380", name)],
        )
    }

    fn registry(store: &Arc<ReplicatedStore>, node: &str) -> MemberRegistry {
        MemberRegistry::new(store.connect(node), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let store = ReplicatedStore::new();
        let reg = registry(&store, "pd1");

        reg.register(&member("pd2", 2)).await.unwrap();
        reg.register(&member("pd1", 1)).await.unwrap();

        let names: Vec<_> = reg.list().await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["pd1", "pd2"]);
        assert_eq!(reg.get("pd2").await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_views_agree_across_nodes() {
        let store = ReplicatedStore::new();
        let a = registry(&store, "pd1");
        let b = registry(&store, "pd2");

        a.register(&member("pd1", 1)).await.unwrap();
        b.register(&member("pd2", 2)).await.unwrap();

        assert_eq!(a.list().await.unwrap(), b.list().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_twice_is_not_found() {
        let store = ReplicatedStore::new();
        let reg = registry(&store, "pd1");
        reg.register(&member("pd1", 1)).await.unwrap();

        assert_eq!(reg.delete("pd1").await.unwrap().name, "pd1");
        assert!(matches!(reg.delete("pd1").await, Err(Error::MemberNotFound(_))));
        assert!(matches!(reg.delete("never").await, Err(Error::MemberNotFound(_))));
        assert_eq!(reg.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_name_match_is_case_sensitive() {
        let store = ReplicatedStore::new();
        let reg = registry(&store, "pd1");
        reg.register(&member("pd1", 1)).await.unwrap();

        assert!(matches!(reg.get("PD1").await, Err(Error::MemberNotFound(_))));
        assert!(matches!(reg.delete("PD1").await, Err(Error::MemberNotFound(_))));
        assert_eq!(reg.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deletes_one_wins() {
        let store = ReplicatedStore::new();
        let a = Arc::new(registry(&store, "pd1"));
        let b = Arc::new(registry(&store, "pd2"));
        a.register(&member("pd3", 3)).await.unwrap();

        let (ra, rb) = tokio::join!(a.delete("pd3"), b.delete("pd3"));
        let successes = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = ReplicatedStore::new();
        let reg = registry(&store, "pd1");
        reg.register(&member("pd1", 1)).await.unwrap();

        assert!(matches!(
            reg.register(&member("pd1", 9)).await,
            Err(Error::DuplicateMember(_))
        ));
    }

    #[tokio::test]
    async fn test_reregister_same_id_updates_urls() {
        let store = ReplicatedStore::new();
        let reg = registry(&store, "pd1");
        reg.register(&member("pd1", 1)).await.unwrap();

        let mut moved = member("pd1", 1);
        moved.client_urls = vec!["http://elsewhere:2379".to_string()];
        reg.register(&moved).await.unwrap();

        assert_eq!(reg.get("pd1").await.unwrap().client_urls, moved.client_urls);
        assert_eq!(reg.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reregister_does_not_revive_concurrent_delete() {
        let store = ReplicatedStore::new();
        let reg = registry(&store, "pd1");
        reg.register(&member("pd1", 1)).await.unwrap();

        let racing = MemberRegistry::new(
            Arc::new(DeleteAfterRead {
                inner: store.connect("pd1"),
                armed: AtomicBool::new(true),
            }),
            Duration::from_secs(1),
        );
        let mut moved = member("pd1", 1);
        moved.client_urls = vec!["http://elsewhere:2379".to_string()];

        assert!(matches!(racing.register(&moved).await, Err(Error::MemberNotFound(_))));
        assert!(matches!(reg.get("pd1").await, Err(Error::MemberNotFound(_))));
        assert_eq!(reg.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let store = ReplicatedStore::new();
        let reg = MemberRegistry::new(store.connect("pd1"), Duration::from_millis(50));
        reg.register(&member("pd1", 1)).await.unwrap();

        store.pause();
        assert!(matches!(reg.list().await, Err(Error::Timeout(_))));
        assert!(matches!(reg.delete("pd1").await, Err(Error::Timeout(_))));
        store.resume();

        // The timed-out delete never reached the store
        assert_eq!(reg.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_not_not_found() {
        let store = ReplicatedStore::new();
        let handle = store.connect("pd1");
        handle.put(&member_key("bad"), vec![0xff], None).await.unwrap();

        let reg = MemberRegistry::new(handle, Duration::from_secs(1));
        assert!(matches!(reg.get("bad").await, Err(Error::Serialization(_))));
    }
}
