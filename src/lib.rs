//! WolfMeta - Cluster Membership Directory and Leader Discovery
//!
//! A small metadata service in which every node keeps an eventually
//! identical view of who is in the cluster and who leads it. Membership and
//! leadership live in a linearizable consensus store; each node reads
//! through to that store, so any node can answer any query.
//!
//! # Architecture
//!
//! Each [`server::Server`] joins the store, registers a member record and
//! runs a lease-based leader election. Its HTTP API lists and removes
//! members and reports the current leader.
//!
//! # Features
//!
//! - Member directory with atomic create-if-absent registration
//! - Lease-backed leader election with automatic failover
//! - REST API for listing, inspecting and removing members
//! - Concurrent cluster bootstrap with convergence checks
//! - In-process replicated store for local clusters and tests

pub mod config;
pub mod error;
pub mod store;
pub mod state;
pub mod api;
pub mod server;
pub mod cluster;
pub mod client;

pub use config::WolfMetaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfMetaConfig;
    pub use crate::error::{Error, Result};
    pub use crate::store::{ConsensusStore, ReplicatedStore};
    pub use crate::state::{Leader, Member, MemberRegistry, LeadershipTracker, NodeStatus};
    pub use crate::server::Server;
    pub use crate::cluster::{Cluster, ClusterBootstrap};
    pub use crate::client::MembersClient;
}
