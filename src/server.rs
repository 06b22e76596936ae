//! Member Server
//!
//! One node of a WolfMeta cluster. Starting a server joins the consensus
//! store, registers the member record, binds the HTTP API and runs the
//! election loop; closing it stops all of that and disconnects from the
//! store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::api::{AppState, HttpServer};
use crate::config::WolfMetaConfig;
use crate::error::{Error, Result};
use crate::state::{
    with_deadline, ElectionConfig, ElectionCoordinator, Leader, LeadershipTracker, Member,
    MemberRegistry, NodeStatus, StateTracker,
};
use crate::store::{ConsensusStore, MemberId};

/// A single cluster member
pub struct Server {
    config: WolfMetaConfig,
    store: Arc<dyn ConsensusStore>,
    registry: Arc<MemberRegistry>,
    leadership: Arc<LeadershipTracker>,
    election: Arc<ElectionCoordinator>,
    status: RwLock<NodeStatus>,
    member_id: RwLock<Option<MemberId>>,
    tracker: Mutex<Option<StateTracker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Server {
    /// Create a server for `config` talking to `store`
    pub fn new(config: WolfMetaConfig, store: Arc<dyn ConsensusStore>) -> Self {
        let request_timeout = config.request_timeout();
        let election = ElectionCoordinator::new(
            config.node.name.clone(),
            Leader::for_process(config.advertise_client_url()),
            Arc::clone(&store),
            ElectionConfig {
                timeout_min_ms: config.cluster.election_timeout_min_ms,
                timeout_max_ms: config.cluster.election_timeout_max_ms,
                lease_ttl: config.leader_lease(),
                request_timeout,
            },
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            registry: Arc::new(MemberRegistry::new(Arc::clone(&store), request_timeout)),
            leadership: Arc::new(LeadershipTracker::new(Arc::clone(&store), request_timeout)),
            election: Arc::new(election),
            store,
            config,
            status: RwLock::new(NodeStatus::Starting),
            member_id: RwLock::new(None),
            tracker: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Member name
    pub fn name(&self) -> &str {
        &self.config.node.name
    }

    /// Node configuration
    pub fn config(&self) -> &WolfMetaConfig {
        &self.config
    }

    /// Lifecycle status
    pub async fn status(&self) -> NodeStatus {
        *self.status.read().await
    }

    /// Id assigned by the store at join, once joined
    pub async fn member_id(&self) -> Option<MemberId> {
        *self.member_id.read().await
    }

    /// Member directory as seen from this node
    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    /// Leader view as seen from this node
    pub fn leadership(&self) -> &Arc<LeadershipTracker> {
        &self.leadership
    }

    /// Whether this node currently holds leadership
    pub async fn is_leader(&self) -> bool {
        self.election.is_leader().await
    }

    /// Descriptor this node publishes when it leads
    pub fn self_leader(&self) -> &Leader {
        self.election.self_leader()
    }

    /// Self-reported leader descriptor, present only while leading
    pub async fn leader(&self) -> Option<Leader> {
        if self.is_leader().await {
            Some(self.self_leader().clone())
        } else {
            None
        }
    }

    /// The cluster's leader as read from the store
    pub async fn get_leader(&self) -> Result<Option<Leader>> {
        self.leadership.current_leader().await
    }

    async fn set_status(&self, next: NodeStatus) {
        let mut status = self.status.write().await;
        if !status.can_transition_to(next) {
            tracing::warn!("{}: unexpected status change {} -> {}", self.name(), *status, next);
        }
        tracing::debug!("{}: {} -> {}", self.name(), *status, next);
        *status = next;
    }

    /// Join the cluster and start serving
    ///
    /// Ready once the member is registered, the HTTP listener is bound and
    /// the election loop is running. Any failure, including the join
    /// deadline passing, leaves the server in `FailedToStart`.
    pub async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        tracing::info!("Starting member {}", self.name());

        let outcome = match tokio::time::timeout(self.config.join_timeout(), self.start_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("join of {}", self.name()))),
        };

        match outcome {
            Ok(()) => {
                self.set_status(NodeStatus::Serving).await;
                tracing::info!(
                    "Member {} serving on {}",
                    self.name(),
                    self.config.advertise_client_url()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Member {} failed to start: {}", self.name(), e);
                self.set_status(NodeStatus::FailedToStart).await;
                self.signal_shutdown();
                for task in self.tasks.lock().await.drain(..) {
                    task.abort();
                }
                Err(Error::StartupFailure {
                    name: self.name().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let name = self.name().to_string();

        let tracker = StateTracker::new(self.config.state_dir(), name.clone())?;
        let starts = tracker.record_start().await?;

        let id = with_deadline(
            self.config.request_timeout(),
            "join store",
            self.store.join(&name),
        )
        .await?;
        match tracker.member_id().await? {
            Some(previous) if previous != id => {
                tracing::warn!("{} rejoined with id {:x} (was {:x})", name, id, previous);
            }
            _ => {}
        }
        tracker.set_member_id(id).await?;
        *self.member_id.write().await = Some(id);
        *self.tracker.lock().await = Some(tracker);

        let member = Member::new(name.clone(), id, self.config.client_urls(), self.config.peer_urls());
        self.registry.register(&member).await?;
        self.set_status(NodeStatus::Joined).await;
        tracing::info!("{} joined as member {:x} (start #{})", name, id, starts);

        let listener = TcpListener::bind(self.config.api_bind_address()?).await?;
        let http = HttpServer::new(
            self.config.api.clone(),
            Arc::new(AppState {
                name: name.clone(),
                registry: Arc::clone(&self.registry),
                leadership: Arc::clone(&self.leadership),
                election: Arc::clone(&self.election),
            }),
        );

        let mut tasks = self.tasks.lock().await;
        let http_shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http.serve(listener, http_shutdown).await {
                tracing::error!("HTTP API for {} failed: {}", name, e);
            }
        }));
        tasks.push(tokio::spawn(
            Arc::clone(&self.election).run(self.shutdown.subscribe()),
        ));

        Ok(())
    }

    /// Ask background tasks to stop without waiting for them
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop serving, give up leadership and disconnect from the store
    ///
    /// Safe to call more than once and after a failed start.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Closing member {}", self.name());

        self.signal_shutdown();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!("{} task ended abnormally: {}", self.name(), e);
                }
            }
        }

        let resign = with_deadline(
            self.config.request_timeout(),
            "resign leadership",
            self.election.resign(),
        );
        if let Err(e) = resign.await {
            tracing::warn!("{} could not resign leadership: {}", self.name(), e);
        }

        self.store.close();
        self.tracker.lock().await.take();
        tracing::info!("Member {} closed", self.name());
    }
}
