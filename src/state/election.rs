//! Leader Election
//!
//! Campaigns for the store's leader key with randomized timeouts. The key is
//! created only if absent and is attached to a lease that the leader keeps
//! alive, so the store decides who wins and a dead leader's key expires.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use rand::Rng;

use super::leadership::LEADER_KEY;
use super::membership::Leader;
use super::registry::member_key;
use super::with_deadline;
use crate::error::{Error, Result};
use crate::store::{ConsensusStore, LeaseId};

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Following a leader (or waiting for one)
    Follower,
    /// Trying to create the leader key
    Candidate,
    /// Holding the leader key
    Leader,
}

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Minimum election timeout in milliseconds
    pub timeout_min_ms: u64,
    /// Maximum election timeout in milliseconds
    pub timeout_max_ms: u64,
    /// Leader lease TTL
    pub lease_ttl: Duration,
    /// Deadline for each store call
    pub request_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            timeout_min_ms: 300,
            timeout_max_ms: 600,
            lease_ttl: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Election coordinator manages this node's leadership campaign
pub struct ElectionCoordinator {
    /// This node's name
    name: String,
    /// Descriptor written to the leader key when we win
    leader: Leader,
    /// Current state
    state: RwLock<ElectionState>,
    /// Lease backing our leader key while we lead
    lease: RwLock<Option<LeaseId>>,
    /// Create revision of the leader key we hold
    term: RwLock<u64>,
    /// Election configuration
    config: ElectionConfig,
    /// Consensus store
    store: Arc<dyn ConsensusStore>,
}

impl ElectionCoordinator {
    /// Create a new election coordinator
    pub fn new(
        name: String,
        leader: Leader,
        store: Arc<dyn ConsensusStore>,
        config: ElectionConfig,
    ) -> Self {
        Self {
            name,
            leader,
            state: RwLock::new(ElectionState::Follower),
            lease: RwLock::new(None),
            term: RwLock::new(0),
            config,
            store,
        }
    }

    /// Generate a random election timeout
    fn random_timeout(config: &ElectionConfig) -> Duration {
        let mut rng = rand::thread_rng();
        let ms = rng.gen_range(config.timeout_min_ms..=config.timeout_max_ms);
        Duration::from_millis(ms)
    }

    /// Get current state
    pub async fn state(&self) -> ElectionState {
        *self.state.read().await
    }

    /// Whether this node holds the leader key
    pub async fn is_leader(&self) -> bool {
        self.state().await == ElectionState::Leader
    }

    /// Revision at which our leadership began (0 if not leading)
    pub async fn term(&self) -> u64 {
        *self.term.read().await
    }

    /// Descriptor this node advertises when leading
    pub fn self_leader(&self) -> &Leader {
        &self.leader
    }

    /// Try once to become leader; returns whether we won
    pub async fn campaign(&self) -> Result<bool> {
        *self.state.write().await = ElectionState::Candidate;

        let lease = with_deadline(
            self.config.request_timeout,
            "grant leader lease",
            self.store.grant_lease(self.config.lease_ttl),
        )
        .await?;

        let value = bincode::serialize(&self.leader)?;
        let created = with_deadline(
            self.config.request_timeout,
            "create leader key",
            self.store.create(LEADER_KEY, value, Some(lease)),
        )
        .await;

        match created {
            Ok(true) => {
                let term = match self.store.get(LEADER_KEY).await? {
                    Some(kv) => kv.create_revision,
                    None => 0,
                };
                *self.lease.write().await = Some(lease);
                *self.term.write().await = term;
                *self.state.write().await = ElectionState::Leader;
                tracing::info!("{} won election at revision {}, becoming LEADER", self.name, term);
                Ok(true)
            }
            Ok(false) => {
                let _ = self.store.revoke(lease).await;
                *self.state.write().await = ElectionState::Follower;
                Ok(false)
            }
            Err(e) => {
                let _ = self.store.revoke(lease).await;
                *self.state.write().await = ElectionState::Follower;
                Err(e)
            }
        }
    }

    /// Refresh our lease and confirm the leader key is still ours
    pub async fn keep_alive(&self) -> Result<()> {
        let Some(lease) = *self.lease.read().await else {
            return Ok(());
        };

        match with_deadline(
            self.config.request_timeout,
            "keep leader lease alive",
            self.store.keep_alive(lease),
        )
        .await
        {
            Ok(()) => {}
            Err(Error::LeaseExpired(_)) => {
                tracing::warn!("{} lost its leader lease", self.name);
                self.step_down().await;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let current = with_deadline(
            self.config.request_timeout,
            "get leader",
            self.store.get(LEADER_KEY),
        )
        .await?;
        let still_ours = matches!(&current, Some(kv) if kv.lease == Some(lease));
        if !still_ours {
            tracing::warn!("{} no longer holds the leader key", self.name);
            self.resign().await?;
            return Ok(());
        }

        if !self.is_member().await? {
            tracing::warn!("{} was removed from the cluster, giving up leadership", self.name);
            self.resign().await?;
        }
        Ok(())
    }

    /// Whether this node's member record is still registered
    async fn is_member(&self) -> Result<bool> {
        let record = with_deadline(
            self.config.request_timeout,
            "get own member record",
            self.store.get(&member_key(&self.name)),
        )
        .await?;
        Ok(record.is_some())
    }

    /// Give up leadership, deleting the leader key via its lease
    pub async fn resign(&self) -> Result<()> {
        let lease = self.lease.write().await.take();
        if let Some(lease) = lease {
            tracing::info!("{} resigning leadership", self.name);
            self.store.revoke(lease).await?;
        }
        self.step_down().await;
        Ok(())
    }

    /// Become follower without touching the store
    async fn step_down(&self) {
        *self.lease.write().await = None;
        *self.term.write().await = 0;
        *self.state.write().await = ElectionState::Follower;
    }

    /// Run the campaign loop until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("Election loop for {} started", self.name);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = if self.is_leader().await {
                self.keep_alive().await
            } else {
                self.follow().await
            };
            if let Err(e) = result {
                tracing::warn!("Election round for {} failed: {}", self.name, e);
            }

            let pause = if self.is_leader().await {
                self.config.lease_ttl / 3
            } else {
                Self::random_timeout(&self.config)
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Election loop for {} stopped", self.name);
    }

    /// Campaign if the leader key is vacant and we are still a member
    async fn follow(&self) -> Result<()> {
        let current = with_deadline(
            self.config.request_timeout,
            "get leader",
            self.store.get(LEADER_KEY),
        )
        .await?;
        if current.is_some() {
            return Ok(());
        }

        if !self.is_member().await? {
            tracing::debug!("{} is not a registered member, not campaigning", self.name);
            return Ok(());
        }
        self.campaign().await?;
        Ok(())
    }
}
