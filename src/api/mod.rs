// REST API for cluster administration and definition lookups

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::admin::{AdminError, AdministrationHandle};
use crate::catalog::{DefinitionCatalog, DefinitionKind};
use crate::redirection::{RedirectionError, RedirectionRule};
use crate::source::Resolution;
use crate::types::{IdentityCard, RegistryVersion};

#[derive(Clone)]
pub struct AppState {
    pub admin: AdministrationHandle,
    pub catalog: Arc<DefinitionCatalog>,
    /// Cancelled when the node shuts down. Each request works under a child.
    pub shutdown: CancellationToken,
}

pub fn create_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/redirections",
            get(get_redirections)
                .post(append_redirections)
                .delete(pop_redirections),
        )
        .route("/definitions/refresh", post(refresh_definitions))
        .route("/definitions/{kind}", get(list_definitions))
        .route("/definitions/{kind}/{id}", get(get_definition))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn admin_error_response(e: AdminError) -> Response {
    let status = match &e {
        AdminError::Redirection(RedirectionError::Validation { .. }) => StatusCode::BAD_REQUEST,
        AdminError::Redirection(RedirectionError::Conflict { .. }) => StatusCode::CONFLICT,
        AdminError::WorkerStopped => StatusCode::SERVICE_UNAVAILABLE,
        AdminError::Persistence(_) | AdminError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Administration request failed: {}", e);
    }
    error_response(status, e.to_string())
}

fn identity_or_anonymous(identity: Option<String>) -> IdentityCard {
    identity.map(IdentityCard::new).unwrap_or_else(IdentityCard::anonymous)
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    version: Option<RegistryVersion>,
}

/// 304 when the caller already holds the current version.
async fn get_redirections(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    let cancel = state.shutdown.child_token();
    match state.admin.get_snapshot(query.version.as_ref(), &cancel) {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => StatusCode::NOT_MODIFIED.into_response(),
        Err(e) => admin_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct AppendRequest {
    rules: Vec<RedirectionRule>,
    identity: Option<String>,
}

async fn append_redirections(
    State(state): State<AppState>,
    Json(req): Json<AppendRequest>,
) -> Response {
    let identity = identity_or_anonymous(req.identity);
    debug!("{} appends {} redirection rule(s)", identity, req.rules.len());

    let cancel = state.shutdown.child_token();
    match state.admin.request_append(req.rules, identity, &cancel).await {
        Ok(applied) => Json(serde_json::json!({ "applied": applied })).into_response(),
        Err(e) => admin_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct PopRequest {
    ids: Vec<Uuid>,
    identity: Option<String>,
}

async fn pop_redirections(State(state): State<AppState>, Json(req): Json<PopRequest>) -> Response {
    let identity = identity_or_anonymous(req.identity);
    debug!("{} removes {} redirection rule(s)", identity, req.ids.len());

    let cancel = state.shutdown.child_token();
    match state.admin.request_pop(req.ids, identity, &cancel).await {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(e) => admin_error_response(e),
    }
}

async fn list_definitions(
    State(state): State<AppState>,
    Path(kind): Path<DefinitionKind>,
) -> Response {
    let cancel = state.shutdown.child_token();
    match state.catalog.list_json(kind, &cancel).await {
        Ok(definitions) => Json(serde_json::json!({
            "kind": kind.as_str(),
            "definitions": definitions,
            "count": definitions.len(),
        }))
        .into_response(),
        Err(e) => {
            error!("Listing {} definitions failed: {:#}", kind.as_str(), e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn get_definition(
    State(state): State<AppState>,
    Path((kind, id)): Path<(DefinitionKind, Uuid)>,
) -> Response {
    let cancel = state.shutdown.child_token();
    match state.catalog.resolve_json(kind, id, &cancel).await {
        Ok(Resolution::Found(definition)) => Json(definition).into_response(),
        Ok(Resolution::NotFound) => error_response(
            StatusCode::NOT_FOUND,
            format!("{} '{}' not found", kind.as_str(), id),
        ),
        Ok(Resolution::Unavailable { failed_sources }) => {
            warn!("{} {} unavailable from {:?}", kind.as_str(), id, failed_sources);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": format!("{} '{}' could not be resolved", kind.as_str(), id),
                    "failed_sources": failed_sources,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn refresh_definitions(State(state): State<AppState>) -> Response {
    let cancel = state.shutdown.child_token();
    match state.catalog.force_update_all(&cancel).await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => {
            error!("Definition refresh failed: {:#}", e);
            error_response(StatusCode::BAD_GATEWAY, format!("{:#}", e))
        }
    }
}
