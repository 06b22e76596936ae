//! Cluster Membership Types
//!
//! Member records, the leader descriptor and the per-node startup status.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::MemberId;

/// Startup status of a node, as seen by whoever started it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node is starting and has not joined the store yet
    Starting,
    /// Node joined the store and registered itself
    Joined,
    /// Node is serving the membership API
    Serving,
    /// Node failed to join or serve within its deadline
    FailedToStart,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Starting => write!(f, "STARTING"),
            NodeStatus::Joined => write!(f, "JOINED"),
            NodeStatus::Serving => write!(f, "SERVING"),
            NodeStatus::FailedToStart => write!(f, "FAILED_TO_START"),
        }
    }
}

impl NodeStatus {
    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        matches!(
            (self, next),
            (NodeStatus::Starting, NodeStatus::Joined)
                | (NodeStatus::Joined, NodeStatus::Serving)
                | (NodeStatus::Starting, NodeStatus::FailedToStart)
                | (NodeStatus::Joined, NodeStatus::FailedToStart)
        )
    }
}

/// A registered cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Unique member name
    pub name: String,
    /// Identity assigned by the store at join time
    #[serde(default)]
    pub id: MemberId,
    /// URLs clients use to reach this member
    pub client_urls: Vec<String>,
    /// URLs used for peer traffic
    pub peer_urls: Vec<String>,
}

impl Member {
    /// Create a member record
    pub fn new(name: String, id: MemberId, client_urls: Vec<String>, peer_urls: Vec<String>) -> Self {
        Self {
            name,
            id,
            client_urls,
            peer_urls,
        }
    }

    /// Check the record can be stored
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidMember("name cannot be empty".into()));
        }
        if self.name.contains('/') {
            return Err(Error::InvalidMember(format!("name {} contains '/'", self.name)));
        }
        if self.client_urls.is_empty() {
            return Err(Error::InvalidMember(format!("{} has no client URLs", self.name)));
        }
        if self.peer_urls.is_empty() {
            return Err(Error::InvalidMember(format!("{} has no peer URLs", self.name)));
        }
        Ok(())
    }

    /// Client URLs sorted, for order-independent comparison
    pub fn sorted_client_urls(&self) -> Vec<String> {
        let mut urls = self.client_urls.clone();
        urls.sort();
        urls
    }

    /// Peer URLs sorted, for order-independent comparison
    pub fn sorted_peer_urls(&self) -> Vec<String> {
        let mut urls = self.peer_urls.clone();
        urls.sort();
        urls
    }
}

/// The elected leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leader {
    /// Advertised client address of the leader
    pub addr: String,
    /// Process id of the leader
    pub pid: u32,
}

impl Leader {
    /// Descriptor for a process advertising `addr`
    pub fn for_process(addr: String) -> Self {
        Self {
            addr,
            pid: std::process::id(),
        }
    }
}

impl std::fmt::Display for Leader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (pid {})", self.addr, self.pid)
    }
}
