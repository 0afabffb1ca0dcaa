//! # Dashboard — Admin API and Agent Host
//!
//! Runs an Axum HTTP server exposing the opportunity review queue and the
//! agent run API, plus health and Prometheus endpoints. The serve loop also
//! hosts the schedule: queue gauges refresh every 30 seconds and, when
//! configured, a full agent run fires once its interval has elapsed.

pub(crate) mod middleware_auth;
mod routes_health;
mod routes_queue;
mod routes_runs;

use crate::agent::orchestrator::{run_job, JobContext};
use crate::agent::RunType;
use crate::analytics::HttpMetricsSource;
use crate::config::Settings;
use crate::db::Database;
use crate::prom_metrics;
use anyhow::Result;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

pub struct AppState {
    pub ctx: JobContext,
    pub prom_metrics: prom_metrics::Metrics,
}

impl AppState {
    pub fn new(ctx: JobContext) -> Arc<Self> {
        Arc::new(AppState {
            ctx,
            prom_metrics: prom_metrics::Metrics::new(),
        })
    }

    pub(super) fn db(&self) -> &Database {
        &self.ctx.db
    }
}

/// Middleware that records HTTP request counts and duration into Prometheus,
/// generates (or propagates) a request ID for correlation, and wraps the
/// request in a tracing span using `.instrument()` for proper async propagation.
async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let response = next.run(req).instrument(span).await;

    state.prom_metrics.record_http(
        &method,
        &norm_path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    let mut response = response;
    response
        .headers_mut()
        .insert("x-request-id", request_id.parse().unwrap());
    response
}

/// Normalize URL path to collapse high-cardinality segments (UUIDs, numeric IDs)
/// into placeholders, preventing histogram label explosion.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.is_empty() {
                seg.to_string()
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                ":uuid".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/queue/pending", get(routes_queue::handler_queue_pending))
        .route("/api/queue/stats", get(routes_queue::handler_queue_stats))
        .route(
            "/api/queue/opportunities/{id}",
            get(routes_queue::handler_queue_get),
        )
        .route(
            "/api/queue/opportunities/{id}/approve",
            post(routes_queue::handler_queue_approve),
        )
        .route(
            "/api/queue/opportunities/{id}/reject",
            post(routes_queue::handler_queue_reject),
        )
        .route("/api/queue/expire", post(routes_queue::handler_queue_expire))
        .route("/api/runs/trigger", post(routes_runs::handler_runs_trigger))
        .route("/api/runs/history", get(routes_runs::handler_runs_history))
        .route("/api/runs/report", get(routes_runs::handler_runs_report))
        .route("/api/runs/{id}", get(routes_runs::handler_runs_get))
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Whether a scheduled full run should fire. Keyed off the stored run rows,
/// not an in-process timer: restarts do not reset the schedule, and a run row
/// in `running` state blocks a second start.
async fn full_run_due(db: &Database, interval_hours: u64) -> Result<bool> {
    let latest = db.latest_run_of_type(RunType::Full.as_str()).await?;
    Ok(match latest {
        None => true,
        Some(row) => Utc::now() - row.started_at >= chrono::Duration::hours(interval_hours as i64),
    })
}

pub async fn run(port: u16, database_url: &str, cfg: Settings) -> Result<()> {
    let db = Database::connect(database_url).await?;
    db.migrate().await?;
    let source = HttpMetricsSource::from_settings(&cfg)?;
    let ctx = JobContext {
        db,
        source: Arc::new(source),
        cfg,
    };
    let state = AppState::new(ctx);
    let app = build_router(state.clone());

    // Background task: refresh queue gauges, fire scheduled full runs
    let tick_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            match tick_state.db().get_queue_stats().await {
                Ok(stats) => tick_state.prom_metrics.set_queue_stats(&stats),
                Err(e) => warn!(error = %e, "failed to refresh queue gauges"),
            }
            let interval_hours = tick_state.ctx.cfg.schedule_interval_hours;
            if interval_hours == 0 {
                continue;
            }
            match full_run_due(tick_state.db(), interval_hours).await {
                Ok(false) => {}
                Ok(true) => {
                    info!(interval_hours, "scheduled full run starting");
                    match run_job(&tick_state.ctx, RunType::Full).await {
                        Ok(summary) => {
                            tick_state.prom_metrics.record_run(
                                &summary.run_type,
                                &summary.status,
                                summary.opportunities_found,
                            );
                            info!(
                                run_id = summary.id,
                                status = %summary.status,
                                "scheduled full run finished"
                            );
                        }
                        Err(e) => {
                            tick_state
                                .prom_metrics
                                .record_run(RunType::Full.as_str(), "failed", 0);
                            warn!(error = %e, "scheduled full run failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to check run schedule"),
            }
        }
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "dashboard running");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("dashboard shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! { _ = ctrl_c => info!("received SIGINT, shutting down"), _ = sigterm.recv() => info!("received SIGTERM, shutting down") }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
