//! Per-request orchestration.
//!
//! The coordinator owns one request end to end: session lookup, status
//! transitions, the realiser run, rollback on failure, and the domain
//! description publish that follows every successful change. Operations on
//! the same graph are serialised by a per-graph lock; different graphs run
//! in parallel (the realiser's switch locks arbitrate where their paths
//! overlap).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use sdno_controller::{ControllerClient, TopologyProvider};
use sdno_nffg::Nffg;
use sdno_store::{GraphStore, SessionStatus};

use crate::config::Config;
use crate::domain::{DomainInfo, ResourceDescription};
use crate::error::{DoError, DoResult};
use crate::realiser::Realiser;

/// Hook handed the refreshed domain description after each change. The
/// messaging transport itself lives outside the orchestrator.
#[async_trait]
pub trait DescriptionPublisher: Send + Sync {
    async fn publish(&self, info: &DomainInfo) -> DoResult<()>;
}

/// Status answer of `status_graph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStatus {
    pub status: SessionStatus,
    pub percentage: u8,
}

pub struct SessionCoordinator {
    config: Arc<Config>,
    store: GraphStore,
    realiser: Realiser,
    description: Arc<ResourceDescription>,
    publisher: Option<Arc<dyn DescriptionPublisher>>,
    graph_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionCoordinator {
    pub fn new(
        config: Arc<Config>,
        store: GraphStore,
        controller: Arc<dyn ControllerClient>,
        topology: Arc<tokio::sync::RwLock<TopologyProvider>>,
        description: Arc<ResourceDescription>,
        publisher: Option<Arc<dyn DescriptionPublisher>>,
    ) -> Self {
        let realiser = Realiser::new(
            config.clone(),
            store.clone(),
            controller,
            topology,
            description.clone(),
        );
        SessionCoordinator {
            config,
            store,
            realiser,
            description,
            publisher,
            graph_locks: DashMap::new(),
        }
    }

    fn graph_lock(&self, user_id: &str, graph_id: &str) -> Arc<Mutex<()>> {
        self.graph_locks
            .entry(format!("{user_id}/{graph_id}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Instantiates a new graph. The graph id is generated here: a fresh
    /// UUID that collides with no deployed graph. Returns the graph id.
    #[instrument(skip(self, nffg))]
    pub async fn post_graph(&self, mut nffg: Nffg, user_id: &str) -> DoResult<String> {
        self.realiser.validate(&nffg)?;

        let graph_id = self.fresh_graph_id().await?;
        nffg.id = Some(graph_id.clone());
        info!(%graph_id, user = user_id, "instantiating new graph");

        let lock = self.graph_lock(user_id, &graph_id);
        let _guard = lock.lock().await;

        let app_names = self.realiser.application_names(&nffg)?;
        let session_id = self
            .store
            .store_graph(&mut nffg, user_id, &app_names, self.config.gre_bridge_id())
            .await?;

        match self.realiser.realise(&nffg, &session_id, user_id).await {
            Ok(()) => {
                self.store
                    .update_status(&session_id, SessionStatus::Complete)
                    .await?;
                info!(%graph_id, %session_id, "graph instantiated");
                self.publish_description().await;
                Ok(graph_id)
            }
            Err(err) => {
                error!(%graph_id, %session_id, error = %err, "realisation failed, rolling back");
                self.rollback(&session_id).await;
                Err(err)
            }
        }
    }

    /// Updates a deployed graph by diffing against the stored one.
    #[instrument(skip(self, new_nffg))]
    pub async fn put_graph(&self, mut new_nffg: Nffg, graph_id: &str, user_id: &str) -> DoResult<()> {
        let session = self
            .store
            .active_session(user_id, graph_id, true)
            .await?
            .ok_or_else(|| DoError::NoGraphFound(graph_id.to_string()))?;
        let session_id = session.session_id;

        let lock = self.graph_lock(user_id, graph_id);
        let _guard = lock.lock().await;

        new_nffg.id = Some(graph_id.to_string());
        self.realiser.validate(&new_nffg)?;

        self.store
            .update_status(&session_id, SessionStatus::Updating)
            .await?;

        let old = self
            .store
            .load_graph(&session_id)
            .await?
            .ok_or_else(|| DoError::internal("active session without a stored graph"))?;
        let mut diff = old.diff(&new_nffg);
        debug!(%graph_id, "update diff computed");

        let outcome: DoResult<()> = async {
            self.realiser.reconcile_update(&mut diff, &session_id).await?;
            let app_names = self.realiser.application_names(&diff)?;
            self.store
                .update_graph(&mut diff, &session_id, &app_names, self.config.gre_bridge_id())
                .await?;
            self.realiser.realise(&diff, &session_id, user_id).await
        }
        .await;

        match outcome {
            Ok(()) => {
                self.store
                    .update_status(&session_id, SessionStatus::Complete)
                    .await?;
                info!(%graph_id, %session_id, "graph updated");
                self.publish_description().await;
                Ok(())
            }
            Err(err) => {
                error!(%graph_id, %session_id, error = %err, "update failed, rolling back");
                self.rollback(&session_id).await;
                Err(err)
            }
        }
    }

    /// Removes a deployed graph. Best-effort: partial teardown failures are
    /// logged, the session always ends.
    #[instrument(skip(self))]
    pub async fn delete_graph(&self, graph_id: &str, user_id: &str) -> DoResult<()> {
        let session = self
            .store
            .active_session(user_id, graph_id, false)
            .await?
            .ok_or_else(|| DoError::SessionNotFound(graph_id.to_string()))?;
        let session_id = session.session_id;

        let lock = self.graph_lock(user_id, graph_id);
        let _guard = lock.lock().await;

        self.realiser.delete_session_graph(&session_id).await?;
        info!(%graph_id, %session_id, "graph deleted");
        self.publish_description().await;
        Ok(())
    }

    /// The reconstructed logical NF-FG (externals projection-dropped).
    pub async fn get_graph(&self, graph_id: &str, user_id: &str) -> DoResult<Nffg> {
        let session = self
            .store
            .active_session(user_id, graph_id, true)
            .await?
            .ok_or_else(|| DoError::SessionNotFound(graph_id.to_string()))?;
        self.store
            .load_graph(&session.session_id)
            .await?
            .ok_or_else(|| DoError::internal("active session without a stored graph"))
    }

    /// Session status plus realisation progress percentage.
    pub async fn status_graph(&self, graph_id: &str, user_id: &str) -> DoResult<GraphStatus> {
        let session = self
            .store
            .active_session(user_id, graph_id, false)
            .await?
            .ok_or_else(|| DoError::SessionNotFound(graph_id.to_string()))?;
        let status = session.status();
        let percentage = if status == SessionStatus::Error {
            0
        } else {
            self.store.flow_rule_progress(&session.session_id).await?
        };
        Ok(GraphStatus { status, percentage })
    }

    /// All deployed graphs, for the collection listing.
    pub async fn list_graphs(&self) -> DoResult<Vec<(String, Nffg)>> {
        Ok(self.store.list_graphs().await?)
    }

    async fn fresh_graph_id(&self) -> DoResult<String> {
        for _ in 0..8 {
            let candidate = Uuid::new_v4().to_string();
            if !self.store.graph_id_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(DoError::internal("could not allocate a unique graph id"))
    }

    /// Failure path of POST/PUT: free whatever the realiser managed to
    /// allocate, then park the session in error.
    async fn rollback(&self, session_id: &str) {
        if let Err(err) = self.realiser.delete_session_graph(session_id).await {
            warn!(%session_id, error = %err, "rollback incomplete");
        }
        if let Err(err) = self.store.update_error(session_id).await {
            warn!(%session_id, error = %err, "could not mark session as errored");
        }
    }

    /// Refreshes and publishes the domain description. A failing publish is
    /// logged and never undoes the realisation.
    async fn publish_description(&self) {
        let deployed = match self.store.list_graphs().await {
            Ok(graphs) => graphs.into_iter().map(|(id, _)| id).collect(),
            Err(err) => {
                warn!(error = %err, "could not list deployed graphs for the description");
                return;
            }
        };
        self.description.set_deployed_graphs(deployed);
        if let Err(err) = self.description.save().await {
            warn!(error = %err, "domain description save failed");
        }
        if let Some(publisher) = &self.publisher {
            if let Err(err) = publisher.publish(&self.description.info()).await {
                warn!(error = %DoError::Messaging(err.to_string()), "description publish failed");
            }
        }
    }
}
