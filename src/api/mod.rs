//! HTTP surface: webhook intake plus a few read-only endpoints.
//!
//! Thin by design: every route is a direct wrapper around the dispatcher
//! or storage. Webhook signature verification happens upstream (reverse
//! proxy / ingress), matching the deployment the engine is built for.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Dispatcher;
use crate::error::Error;
use crate::storage::{SqliteStorage, WorkflowLog};
use crate::triggers::webhook;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub storage: SqliteStorage,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/webhooks/paperless", post(paperless_webhook))
        .route("/api/webhooks/lexoffice", post(lexoffice_webhook))
        .route("/api/logs", get(list_logs))
        .route("/api/mappings", get(list_mappings))
        .route("/api/reconciliation/runs", get(list_reconciliation_runs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn paperless_webhook(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let event = webhook::paperless_event(body);
    info!(event_type = %event.event_type, "received paperless webhook");
    let logs = state.dispatcher.dispatch(event).await?;
    Ok(Json(dispatch_response(&logs)))
}

async fn lexoffice_webhook(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let event = webhook::lexoffice_event(body);
    info!(event_type = %event.event_type, "received lexoffice webhook");
    let logs = state.dispatcher.dispatch(event).await?;
    Ok(Json(dispatch_response(&logs)))
}

fn dispatch_response(logs: &[WorkflowLog]) -> Value {
    json!({
        "status": "accepted",
        "executions": logs
            .iter()
            .map(|log| {
                json!({
                    "log_id": log.id,
                    "workflow_id": log.workflow_id,
                    "workflow_name": log.workflow_name,
                    "status": log.status,
                })
            })
            .collect::<Vec<_>>(),
    })
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let logs = state.storage.list_logs(query.limit.min(500)).await?;
    Ok(Json(json!({ "logs": logs })))
}

async fn list_mappings(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mappings = state.storage.list_mappings().await?;
    Ok(Json(json!({ "mappings": mappings })))
}

async fn list_reconciliation_runs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let runs = state
        .storage
        .list_reconciliation_runs(query.limit.min(500))
        .await?;
    Ok(Json(json!({ "runs": runs })))
}

/// Maps engine errors onto HTTP responses with stable codes.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Config(_) | Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::RateLimitTimeout { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
