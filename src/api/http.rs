//! HTTP API Server
//!
//! REST API for listing and removing members and for leader discovery.
//! Every node serves every route; reads and writes go straight to the
//! consensus store.

use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::state::{ElectionCoordinator, LeadershipTracker, Leader, Member, MemberRegistry};
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Member name of this node
    pub name: String,
    /// Member directory
    pub registry: Arc<MemberRegistry>,
    /// Leader view
    pub leadership: Arc<LeadershipTracker>,
    /// This node's election loop
    pub election: Arc<ElectionCoordinator>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Router with every route mounted under the configured prefix
    pub fn router(&self) -> Router {
        Self::create_router(&self.config, Arc::clone(&self.state))
    }

    /// Create the router
    fn create_router(config: &ApiConfig, state: Arc<AppState>) -> Router {
        let routes = Router::new()
            .route("/members", get(handle_list_members))
            .route(
                "/members/:name",
                get(handle_get_member).delete(handle_delete_member),
            )
            .route("/leader", get(handle_leader))
            .route("/health", get(handle_health))
            .with_state(state);

        let router = Router::new()
            .nest(&config.prefix, routes)
            .layer(TraceLayer::new_for_http());

        if config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve on an already-bound listener until `shutdown` flips to true
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let addr = listener.local_addr()?;
        tracing::info!("HTTP API for {} listening on {}", self.state.name, addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API for {} stopped", self.state.name);
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Member list response
#[derive(Debug, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<Member>,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub name: String,
    pub is_leader: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error returned from handlers
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::MemberNotFound(_) => (StatusCode::NOT_FOUND, "MEMBER_NOT_FOUND"),
            Error::NoLeader => (StatusCode::SERVICE_UNAVAILABLE, "NO_LEADER"),
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            Error::DuplicateMember(_) => (StatusCode::CONFLICT, "DUPLICATE_MEMBER"),
            Error::InvalidMember(_) => (StatusCode::BAD_REQUEST, "INVALID_MEMBER"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Handlers ============

async fn handle_list_members(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<MembersResponse>> {
    let members = state.registry.list().await?;
    Ok(Json(MembersResponse { members }))
}

async fn handle_get_member(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Member>> {
    Ok(Json(state.registry.get(&name).await?))
}

async fn handle_delete_member(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Delete member {} requested via {}", name, state.name);
    state.registry.delete(&name).await?;
    Ok(StatusCode::OK)
}

async fn handle_leader(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Leader>> {
    Ok(Json(state.leadership.leader().await?))
}

async fn handle_health(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        name: state.name.clone(),
        is_leader: state.election.is_leader().await,
    })
}
