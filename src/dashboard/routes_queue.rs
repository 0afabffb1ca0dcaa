//! Admin queue API — review and resolve monetization opportunities.
//!
//! Reads are open; every mutation requires an admin bearer token, and the
//! token's subject is recorded as the reviewer on the opportunity.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::middleware_auth::RequireAdmin;
use super::AppState;
use crate::db::QueueError;

/// Map queue errors onto the admin API's status codes. Stale-view conflicts
/// and missing rows are the caller's problem; everything else is ours.
fn queue_error_response(e: QueueError) -> Response {
    let status = match &e {
        QueueError::NotFound(_) | QueueError::ActionNotFound(_) => StatusCode::NOT_FOUND,
        QueueError::InvalidState { .. } | QueueError::InvalidActionState { .. } => {
            StatusCode::CONFLICT
        }
        QueueError::EmptyActions => StatusCode::BAD_REQUEST,
        QueueError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

#[derive(Deserialize)]
pub(super) struct PendingQuery {
    #[serde(default = "default_pending_limit")]
    limit: i64,
}

fn default_pending_limit() -> i64 {
    20
}

#[derive(Deserialize)]
pub(super) struct RejectPayload {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct ExpirePayload {
    older_than_days: i64,
}

/// `GET /api/queue/pending?limit=N` — pending opportunities in review order
/// plus current queue stats.
pub(super) async fn handler_queue_pending(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PendingQuery>,
) -> impl IntoResponse {
    let opportunities = match state.db().get_pending_opportunities(q.limit).await {
        Ok(rows) => rows,
        Err(e) => return queue_error_response(e),
    };
    let stats = match state.db().get_queue_stats().await {
        Ok(stats) => stats,
        Err(e) => return queue_error_response(e),
    };
    Json(serde_json::json!({ "opportunities": opportunities, "stats": stats })).into_response()
}

/// `GET /api/queue/stats`
pub(super) async fn handler_queue_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db().get_queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => queue_error_response(e),
    }
}

/// `GET /api/queue/opportunities/{id}` — one opportunity with its actions.
pub(super) async fn handler_queue_get(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match state.db().get_opportunity(id).await {
        Ok(opportunity) => Json(opportunity).into_response(),
        Err(e) => queue_error_response(e),
    }
}

/// `POST /api/queue/opportunities/{id}/approve` — admin only. Approves the
/// opportunity and cascades approval to every child action atomically.
pub(super) async fn handler_queue_approve(
    State(state): State<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match state.db().approve_opportunity(id, &admin.user_id).await {
        Ok(opportunity) => {
            tracing::info!(opportunity_id = id, reviewer = %admin.user_id, "opportunity approved");
            Json(opportunity).into_response()
        }
        Err(e) => queue_error_response(e),
    }
}

/// `POST /api/queue/opportunities/{id}/reject` — admin only, with an
/// optional reason recorded on the opportunity.
pub(super) async fn handler_queue_reject(
    State(state): State<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    AxumPath(id): AxumPath<i64>,
    Json(payload): Json<RejectPayload>,
) -> impl IntoResponse {
    match state
        .db()
        .reject_opportunity(id, &admin.user_id, payload.reason.as_deref())
        .await
    {
        Ok(opportunity) => {
            tracing::info!(opportunity_id = id, reviewer = %admin.user_id, "opportunity rejected");
            Json(opportunity).into_response()
        }
        Err(e) => queue_error_response(e),
    }
}

/// `POST /api/queue/expire` — admin only. Bulk-expires stale pending
/// opportunities and returns the count changed.
pub(super) async fn handler_queue_expire(
    State(state): State<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    Json(payload): Json<ExpirePayload>,
) -> impl IntoResponse {
    if payload.older_than_days <= 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "older_than_days must be positive"})),
        )
            .into_response();
    }
    match state
        .db()
        .expire_old_opportunities(payload.older_than_days)
        .await
    {
        Ok(expired) => {
            tracing::info!(expired, reviewer = %admin.user_id, "queue expiry sweep");
            Json(serde_json::json!({ "expired": expired })).into_response()
        }
        Err(e) => queue_error_response(e),
    }
}
