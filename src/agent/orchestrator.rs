//! # Orchestrator — Run Bookkeeping over the Job Pipeline
//!
//! Every invocation gets an `agent_runs` row: created in `running`, finalized
//! to `completed` or `failed`. Single jobs re-throw their error, but only
//! after the row is durably finalized, so the audit trail survives a crashing
//! caller. A full run executes the fixed sequence with per-job failure
//! isolation: one sub-job failing never stops the next, and the run only
//! counts as failed when every sub-job failed.
//!
//! ## Run flavors
//!
//! - single named job: dispatch, finalize, propagate errors
//! - `full`: the whole sequence, totals summed, `errors_encountered` counts
//!   failed sub-jobs
//! - `report`: read-only aggregation plus a bookkeeping row, never fails

use super::{cleanup, forecast, rpm, scanner, sync, JobOutcome, RunType};
use crate::analytics::MetricsSource;
use crate::config::Settings;
use crate::db::{AgentRunRow, Database, ForecastRow, QueueStats, RunAggregates};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything a job needs to run. Cheap to clone; the metrics source is
/// shared behind an Arc so stub sources in tests drop in cleanly.
#[derive(Clone)]
pub struct JobContext {
    pub db: Database,
    pub source: Arc<dyn MetricsSource>,
    pub cfg: Settings,
}

/// The caller-facing shape of a finalized (or just-created) run.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub id: i64,
    pub run_type: String,
    pub status: String,
    pub items_processed: i64,
    pub opportunities_found: i64,
    pub errors_encountered: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub log_summary: Option<String>,
    pub error_details: Option<Value>,
}

impl From<AgentRunRow> for RunSummary {
    fn from(row: AgentRunRow) -> Self {
        let duration_secs = row
            .completed_at
            .map(|done| (done - row.started_at).num_milliseconds() as f64 / 1000.0);
        RunSummary {
            id: row.id,
            run_type: row.run_type,
            status: row.status,
            items_processed: row.items_processed,
            opportunities_found: row.opportunities_found,
            errors_encountered: row.errors_encountered,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_secs,
            log_summary: row.log_summary,
            error_details: row.error_details,
        }
    }
}

/// Read-only pipeline summary. Sections that cannot be fetched degrade to
/// empty or null instead of failing the report.
#[derive(Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub recent_runs: Vec<RunSummary>,
    pub aggregates: Option<RunAggregates>,
    pub queue: Option<QueueStats>,
    pub forecast_accuracy: Option<forecast::ForecastAccuracy>,
    pub upcoming_forecasts: Vec<ForecastRow>,
}

fn error_details(e: &anyhow::Error) -> Value {
    let chain: Vec<String> = e.chain().skip(1).map(|cause| cause.to_string()).collect();
    json!({ "message": e.to_string(), "chain": chain })
}

fn describe_outcome(job: RunType, outcome: &JobOutcome) -> String {
    format!(
        "{}: {} items, {} opportunities, {} recoverable errors",
        job, outcome.items_processed, outcome.opportunities_found, outcome.errors
    )
}

async fn execute_single(ctx: &JobContext, job: RunType) -> Result<JobOutcome> {
    let today = Utc::now().date_naive();
    match job {
        RunType::MetricsSync => {
            let days_back = ctx.cfg.sync_days_back.max(1);
            let start = today - chrono::Duration::days(days_back - 1);
            let dates = sync::expand_date_range(start, today);
            sync::run_metrics_sync(&ctx.db, ctx.source.as_ref(), &ctx.cfg, &dates).await
        }
        RunType::OpportunityScan => scanner::run_opportunity_scan(&ctx.db, &ctx.cfg, today).await,
        RunType::RpmAnalysis => rpm::run_rpm_analysis(&ctx.db, &ctx.cfg, today).await,
        RunType::Forecast => forecast::run_forecast_job(&ctx.db, &ctx.cfg, today).await,
        RunType::Cleanup => cleanup::run_cleanup(&ctx.db, &ctx.cfg).await,
        RunType::Full | RunType::Report => {
            anyhow::bail!("{} is not a single job", job)
        }
    }
}

/// Run one job under a fresh `agent_runs` row and return the finalized
/// summary. Errors from single jobs propagate, but never before the row is
/// finalized.
pub async fn run_job(ctx: &JobContext, job: RunType) -> Result<RunSummary> {
    match job {
        RunType::Full => run_full(ctx).await,
        RunType::Report => run_report(ctx).await,
        single => run_single(ctx, single).await,
    }
}

async fn run_single(ctx: &JobContext, job: RunType) -> Result<RunSummary> {
    let run = ctx.db.create_agent_run(job.as_str()).await?;
    info!(run_id = run.id, job = %job, "agent run started");

    match execute_single(ctx, job).await {
        Ok(outcome) => {
            let summary = describe_outcome(job, &outcome);
            let row = ctx
                .db
                .complete_agent_run(
                    run.id,
                    outcome.items_processed,
                    outcome.opportunities_found,
                    outcome.errors,
                    &summary,
                )
                .await?;
            info!(run_id = run.id, job = %job, %summary, "agent run completed");
            Ok(RunSummary::from(row))
        }
        Err(e) => {
            let details = error_details(&e);
            // The audit row must be durable before the error continues up.
            if let Err(db_err) = ctx
                .db
                .fail_agent_run(run.id, 0, 0, 1, "job failed", &details)
                .await
            {
                error!(run_id = run.id, error = %db_err, "could not record run failure");
            }
            Err(e.context(format!("{} run {} failed", job, run.id)))
        }
    }
}

async fn run_full(ctx: &JobContext) -> Result<RunSummary> {
    let run = ctx.db.create_agent_run(RunType::Full.as_str()).await?;
    info!(run_id = run.id, "full agent run started");

    let mut totals = JobOutcome::default();
    let mut lines = Vec::new();
    let mut failures: Vec<Value> = Vec::new();

    for job in RunType::FULL_SEQUENCE {
        match execute_single(ctx, job).await {
            Ok(outcome) => {
                // Recoverable errors inside a sub-job stay that job's
                // business; at this level only whole-job failures count.
                totals.items_processed += outcome.items_processed;
                totals.opportunities_found += outcome.opportunities_found;
                lines.push(describe_outcome(job, &outcome));
                info!(run_id = run.id, job = %job, items = outcome.items_processed, "sub-job completed");
            }
            Err(e) => {
                let rendered = format!("{:#}", e);
                warn!(run_id = run.id, job = %job, error = %rendered, "sub-job failed, continuing");
                lines.push(format!("{}: FAILED ({})", job, rendered));
                failures.push(json!({ "job": job.as_str(), "error": rendered }));
            }
        }
    }

    let failed_jobs = failures.len() as i64;
    let summary = lines.join("; ");

    if failed_jobs == RunType::FULL_SEQUENCE.len() as i64 {
        let details = json!({ "message": "every sub-job failed", "sub_jobs": failures });
        let row = ctx
            .db
            .fail_agent_run(run.id, 0, 0, failed_jobs, &summary, &details)
            .await?;
        error!(run_id = run.id, "full run failed: no sub-job succeeded");
        return Err(anyhow::anyhow!("full run {} failed: every sub-job failed", row.id));
    }

    let row = ctx
        .db
        .complete_agent_run(
            run.id,
            totals.items_processed,
            totals.opportunities_found,
            failed_jobs,
            &summary,
        )
        .await?;
    info!(
        run_id = run.id,
        items = totals.items_processed,
        opportunities = totals.opportunities_found,
        failed_jobs,
        "full run completed"
    );
    Ok(RunSummary::from(row))
}

async fn run_report(ctx: &JobContext) -> Result<RunSummary> {
    let run = ctx.db.create_agent_run(RunType::Report.as_str()).await?;
    let report = status_report(ctx).await;
    let row = ctx
        .db
        .complete_agent_run(
            run.id,
            report.recent_runs.len() as i64,
            0,
            0,
            "status report generated",
        )
        .await?;
    Ok(RunSummary::from(row))
}

/// Aggregate recent runs, queue stats, and forecast standing into one
/// read-only snapshot. Individual sections degrade on error rather than
/// failing the whole report.
pub async fn status_report(ctx: &JobContext) -> StatusReport {
    let filter = Default::default();
    let current_month = forecast::month_start(Utc::now().date_naive());

    let recent_runs = match ctx.db.get_recent_runs(ctx.cfg.report_run_limit).await {
        Ok(rows) => rows.into_iter().map(RunSummary::from).collect(),
        Err(e) => {
            warn!(error = %e, "report: recent runs unavailable");
            Vec::new()
        }
    };
    let aggregates = match ctx.db.get_run_aggregates(&filter).await {
        Ok(aggregates) => Some(aggregates),
        Err(e) => {
            warn!(error = %e, "report: run aggregates unavailable");
            None
        }
    };
    let queue = match ctx.db.get_queue_stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "report: queue stats unavailable");
            None
        }
    };
    let forecast_accuracy = match forecast::forecast_accuracy(&ctx.db).await {
        Ok(accuracy) => Some(accuracy),
        Err(e) => {
            warn!(error = %e, "report: forecast accuracy unavailable");
            None
        }
    };
    let upcoming_forecasts = match ctx.db.list_forecasts(12).await {
        Ok(rows) => rows
            .into_iter()
            .filter(|f| f.forecast_month >= current_month)
            .collect(),
        Err(e) => {
            warn!(error = %e, "report: forecasts unavailable");
            Vec::new()
        }
    };

    StatusReport {
        generated_at: Utc::now(),
        recent_runs,
        aggregates,
        queue,
        forecast_accuracy,
        upcoming_forecasts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn make_row(status: &str) -> AgentRunRow {
        let started = Utc::now();
        AgentRunRow {
            id: 7,
            run_type: "metrics_sync".into(),
            status: status.into(),
            started_at: started,
            completed_at: Some(started + chrono::Duration::milliseconds(2500)),
            items_processed: 42,
            opportunities_found: 3,
            errors_encountered: 1,
            log_summary: None,
            error_details: None,
        }
    }

    #[test]
    fn summary_computes_duration_from_timestamps() {
        let summary = RunSummary::from(make_row("completed"));
        assert_eq!(summary.duration_secs, Some(2.5));
    }

    #[test]
    fn summary_of_unfinished_run_has_no_duration() {
        let mut row = make_row("running");
        row.completed_at = None;
        let summary = RunSummary::from(row);
        assert_eq!(summary.duration_secs, None);
    }

    #[test]
    fn error_details_carry_the_full_chain() {
        let err = anyhow!("connection refused")
            .context("fetching metrics for 2025-07-01")
            .context("metrics sync failed");
        let details = error_details(&err);
        assert_eq!(details["message"], "metrics sync failed");
        let chain = details["chain"].as_array().unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], "fetching metrics for 2025-07-01");
        assert_eq!(chain[1], "connection refused");
    }

    #[test]
    fn outcome_description_names_the_job() {
        let line = describe_outcome(
            RunType::RpmAnalysis,
            &JobOutcome {
                items_processed: 12,
                opportunities_found: 2,
                errors: 0,
            },
        );
        assert_eq!(line, "rpm_analysis: 12 items, 2 opportunities, 0 recoverable errors");
    }
}
