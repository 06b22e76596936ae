//! Leadership Tracker
//!
//! Answers "who is leader" by reading the leader key from the consensus
//! store. Any node can answer; nothing is derived locally.

use std::sync::Arc;
use std::time::Duration;

use super::membership::Leader;
use super::with_deadline;
use crate::error::{Error, Result};
use crate::store::{ConsensusStore, KeyValue};

/// Store key holding the current leader, attached to the leader's lease
pub const LEADER_KEY: &str = "/wolfmeta/leader";

/// Interval between leader key reads while waiting for a leader
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read-through view of the elected leader
pub struct LeadershipTracker {
    store: Arc<dyn ConsensusStore>,
    request_timeout: Duration,
}

impl LeadershipTracker {
    /// Create a tracker reading through `store`
    pub fn new(store: Arc<dyn ConsensusStore>, request_timeout: Duration) -> Self {
        Self {
            store,
            request_timeout,
        }
    }

    /// Raw leader key entry, if a leader is elected
    pub(crate) async fn leader_entry(&self) -> Result<Option<KeyValue>> {
        with_deadline(self.request_timeout, "get leader", self.store.get(LEADER_KEY)).await
    }

    /// The current leader, or `None` while no leader is elected
    pub async fn current_leader(&self) -> Result<Option<Leader>> {
        match self.leader_entry().await? {
            Some(kv) => Ok(Some(bincode::deserialize(&kv.value)?)),
            None => Ok(None),
        }
    }

    /// The current leader, or `NoLeader`
    pub async fn leader(&self) -> Result<Leader> {
        self.current_leader().await?.ok_or(Error::NoLeader)
    }

    /// Wait until a leader is elected or `deadline` passes
    pub async fn wait_for_leader(&self, deadline: Duration) -> Result<Leader> {
        let mut watch = self.store.watch(LEADER_KEY)?;
        let wait = async {
            loop {
                if let Some(leader) = self.current_leader().await? {
                    return Ok::<_, Error>(leader);
                }
                // Lease expiry is only noticed on access, so poll as well
                tokio::select! {
                    _ = watch.next() => {}
                    _ = tokio::time::sleep(LEADER_POLL_INTERVAL) => {}
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("wait for leader".into())),
        }
    }
}
