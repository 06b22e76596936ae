//! State Management Module
//!
//! Member registry and leadership views over the consensus store, the
//! leader election loop, and persistent per-node state.

mod tracker;
mod membership;
mod registry;
mod leadership;
pub mod election;

pub use tracker::StateTracker;
pub use membership::{Member, Leader, NodeStatus};
pub use registry::{MemberRegistry, MEMBERS_PREFIX, member_key};
pub use leadership::{LeadershipTracker, LEADER_KEY};
pub use election::{ElectionCoordinator, ElectionConfig, ElectionState};

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Run a store operation under a deadline
///
/// Expiry becomes `Error::Timeout`, never a domain error.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(op.to_string())),
    }
}
