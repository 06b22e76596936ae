//! Cluster Bootstrap
//!
//! Brings up a set of servers concurrently and waits until they agree on
//! membership and leadership. Used by tests and by the local development
//! cluster command.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::seq::IteratorRandom;

use crate::config::WolfMetaConfig;
use crate::error::{Error, Result};
use crate::server::Server;
use crate::state::Leader;
use crate::store::{ConsensusStore, ReplicatedStore};

/// Interval between convergence checks
const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Starts clusters
pub struct ClusterBootstrap;

impl ClusterBootstrap {
    /// Start one server per config against a shared in-process store
    pub async fn start(configs: Vec<WolfMetaConfig>, store: Arc<ReplicatedStore>) -> Result<Cluster> {
        Self::start_with(configs, |name| -> Arc<dyn ConsensusStore> { store.connect(name) }).await
    }

    /// Start one server per config, each with the store handle `connect`
    /// returns for its name
    pub async fn start_with<F>(configs: Vec<WolfMetaConfig>, connect: F) -> Result<Cluster>
    where
        F: Fn(&str) -> Arc<dyn ConsensusStore>,
    {
        if configs.is_empty() {
            return Err(Error::Config("cluster needs at least one node".into()));
        }
        let mut seen = HashSet::new();
        for config in &configs {
            if !seen.insert(config.node.name.as_str()) {
                return Err(Error::Config(format!("duplicate node name {}", config.node.name)));
            }
        }
        let settle_timeout = configs
            .iter()
            .map(WolfMetaConfig::settle_timeout)
            .max()
            .unwrap_or_default();

        let mut cluster = Cluster {
            servers: BTreeMap::new(),
            data_dirs: configs.iter().map(|c| c.data_dir().clone()).collect(),
            shut_down: false,
        };

        let mut starts = Vec::with_capacity(configs.len());
        for config in configs {
            let name = config.node.name.clone();
            let server = Arc::new(Server::new(config, connect(&name)));
            cluster.servers.insert(name, Arc::clone(&server));
            starts.push(tokio::spawn(async move { server.start().await }));
        }
        tracing::info!("Bootstrapping cluster of {} members", cluster.len());

        // Every start has finished, successfully or not, past this point
        let mut failure = None;
        for outcome in join_all(starts).await {
            let result = outcome.unwrap_or_else(|e| Err(Error::Internal(format!("start task: {}", e))));
            if let Err(e) = result {
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            tracing::error!("Cluster bootstrap failed: {}", e);
            cluster.shutdown().await;
            return Err(e);
        }

        if let Err(e) = cluster.wait_converged(settle_timeout).await {
            tracing::error!("Cluster did not converge: {}", e);
            cluster.shutdown().await;
            return Err(e);
        }

        tracing::info!("Cluster of {} members is ready", cluster.len());
        Ok(cluster)
    }
}

/// A running set of servers
pub struct Cluster {
    servers: BTreeMap<String, Arc<Server>>,
    data_dirs: Vec<PathBuf>,
    shut_down: bool,
}

impl Cluster {
    /// Number of tracked servers
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Names of tracked servers, ordered
    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Tracked servers, ordered by name
    pub fn servers(&self) -> impl Iterator<Item = &Arc<Server>> {
        self.servers.values()
    }

    /// Server by member name
    pub fn server(&self, name: &str) -> Option<&Arc<Server>> {
        self.servers.get(name)
    }

    /// A uniformly chosen tracked server
    pub fn random_server(&self) -> Option<&Arc<Server>> {
        self.servers.values().choose(&mut rand::thread_rng())
    }

    /// The tracked server that currently holds leadership
    pub async fn leader_server(&self) -> Option<&Arc<Server>> {
        for server in self.servers.values() {
            if server.is_leader().await {
                return Some(server);
            }
        }
        None
    }

    /// Stop tracking `name`, handing its server back to the caller
    ///
    /// The server keeps running; its data directory is still removed at
    /// shutdown.
    pub fn forget(&mut self, name: &str) -> Option<Arc<Server>> {
        let server = self.servers.remove(name);
        if server.is_some() {
            tracing::debug!("No longer tracking {}", name);
        }
        server
    }

    /// Wait until every tracked server lists exactly the tracked members and
    /// all of them report the same leader
    pub async fn wait_converged(&self, deadline: Duration) -> Result<Leader> {
        let check = async {
            loop {
                match self.converged().await {
                    Ok(Some(leader)) => return leader,
                    Ok(None) => {}
                    Err(e) => tracing::debug!("Convergence check failed: {}", e),
                }
                tokio::time::sleep(CONVERGENCE_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(deadline, check)
            .await
            .map_err(|_| Error::Timeout("cluster convergence".into()))
    }

    async fn converged(&self) -> Result<Option<Leader>> {
        let expected = self.names();
        let mut agreed: Option<Leader> = None;

        for server in self.servers.values() {
            let names: Vec<String> = server
                .registry()
                .list()
                .await?
                .into_iter()
                .map(|m| m.name)
                .collect();
            if names != expected {
                return Ok(None);
            }

            let Some(leader) = server.get_leader().await? else {
                return Ok(None);
            };
            match &agreed {
                Some(seen) if *seen != leader => return Ok(None),
                Some(_) => {}
                None => agreed = Some(leader),
            }
        }

        Ok(agreed)
    }

    /// Stop every server and remove data directories
    ///
    /// Idempotent; also covers servers that failed to start.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        join_all(self.servers.values().map(|s| s.close())).await;
        self.remove_data_dirs();
        tracing::info!("Cluster shut down");
    }

    fn remove_data_dirs(&self) {
        for dir in &self.data_dirs {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {:?}: {}", dir, e),
            }
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        for server in self.servers.values() {
            server.signal_shutdown();
        }
        self.remove_data_dirs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn bootstrap(n: usize, dir: &std::path::Path) -> Cluster {
        let configs = WolfMetaConfig::test_cluster(n, dir).unwrap();
        ClusterBootstrap::start(configs, ReplicatedStore::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_three_nodes_converge() {
        let dir = tempdir().unwrap();
        let mut cluster = bootstrap(3, dir.path()).await;

        assert_eq!(cluster.names(), vec!["pd1", "pd2", "pd3"]);
        for server in cluster.servers() {
            assert_eq!(server.registry().count().await.unwrap(), 3);
        }

        let leader = cluster.leader_server().await.unwrap();
        let random = cluster.random_server().unwrap();
        assert_eq!(
            random.get_leader().await.unwrap().as_ref(),
            Some(leader.self_leader())
        );

        cluster.shutdown().await;
        assert!(!dir.path().join("pd1").exists());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_leader_across_nodes() {
        let dir = tempdir().unwrap();
        let mut cluster = bootstrap(3, dir.path()).await;

        let mut leaders = 0;
        for server in cluster.servers() {
            if server.is_leader().await {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_forget_after_delete() {
        let dir = tempdir().unwrap();
        let mut cluster = bootstrap(3, dir.path()).await;

        let removed = cluster.server("pd1").unwrap().registry().delete("pd2").await.unwrap();
        assert_eq!(removed.name, "pd2");
        let pd2 = cluster.forget("pd2").unwrap();

        cluster.wait_converged(Duration::from_secs(5)).await.unwrap();
        for server in cluster.servers() {
            let names: Vec<_> = server.registry().list().await.unwrap().into_iter().map(|m| m.name).collect();
            assert_eq!(names, vec!["pd1", "pd3"]);
        }

        pd2.close().await;
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_tears_down() {
        let dir = tempdir().unwrap();
        let mut configs = WolfMetaConfig::test_cluster(2, dir.path()).unwrap();
        configs[1].node.client_urls = configs[0].node.client_urls.clone();

        let result = ClusterBootstrap::start(configs, ReplicatedStore::new()).await;
        assert!(matches!(result, Err(Error::StartupFailure { .. })));
        assert!(!dir.path().join("pd1").exists());
        assert!(!dir.path().join("pd2").exists());
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected_before_any_start() {
        let dir = tempdir().unwrap();
        let mut configs = WolfMetaConfig::test_cluster(3, dir.path()).unwrap();
        configs[2].node.name = "pd1".to_string();

        let result = ClusterBootstrap::start(configs, ReplicatedStore::new()).await;
        assert!(matches!(result, Err(Error::Config(_))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        for name in ["pd1", "pd2", "pd3"] {
            assert!(!dir.path().join(name).exists());
        }
    }

    #[tokio::test]
    async fn test_empty_config_rejected() {
        let result = ClusterBootstrap::start(Vec::new(), ReplicatedStore::new()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
