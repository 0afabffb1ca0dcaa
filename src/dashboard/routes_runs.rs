//! Run API — trigger agent jobs, browse run history, read the status report.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

use super::middleware_auth::RequireAdmin;
use super::AppState;
use crate::agent::orchestrator::{run_job, status_report};
use crate::agent::RunType;
use crate::db::RunHistoryFilter;

#[derive(Deserialize)]
pub(super) struct TriggerPayload {
    job_type: String,
}

/// `POST /api/runs/trigger` — admin only. Runs the named job to completion
/// and returns the finalized run summary.
///
/// The job runs on a spawned task: if the client gives up or the request
/// times out, the run still finishes and finalizes its `agent_runs` row.
pub(super) async fn handler_runs_trigger(
    State(state): State<Arc<AppState>>,
    RequireAdmin(admin): RequireAdmin,
    Json(payload): Json<TriggerPayload>,
) -> impl IntoResponse {
    let job = match RunType::from_str(&payload.job_type) {
        Ok(job) => job,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    };
    tracing::info!(job = %job, triggered_by = %admin.user_id, "run triggered via API");

    let ctx = state.ctx.clone();
    let joined = tokio::spawn(async move { run_job(&ctx, job).await }).await;
    let result = match joined {
        Ok(result) => result,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": format!("run task panicked: {}", e)})),
            )
                .into_response()
        }
    };

    match result {
        Ok(summary) => {
            state
                .prom_metrics
                .record_run(&summary.run_type, &summary.status, summary.opportunities_found);
            if job == RunType::Report {
                let report = status_report(&state.ctx).await;
                return Json(serde_json::json!({ "run": summary, "report": report }))
                    .into_response();
            }
            Json(summary).into_response()
        }
        Err(e) => {
            state.prom_metrics.record_run(job.as_str(), "failed", 0);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": format!("{:#}", e)})),
            )
                .into_response()
        }
    }
}

/// `GET /api/runs/history?days=&run_type=&status=&page=&limit=` — paged run
/// records with aggregate stats over the same filter.
pub(super) async fn handler_runs_history(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RunHistoryFilter>,
) -> impl IntoResponse {
    match state.db().get_run_history(&filter).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// `GET /api/runs/report` — the read-only status report.
pub(super) async fn handler_runs_report(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(status_report(&state.ctx).await)
}

/// `GET /api/runs/{id}`
pub(super) async fn handler_runs_get(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    match state.db().get_agent_run(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "agent run not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
