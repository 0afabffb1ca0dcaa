//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Contains the
//! execution logic for the `run`, `report`, and `migrate` subcommands.

use anyhow::Result;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tollgate::agent::orchestrator::{run_job, status_report, JobContext};
use tollgate::agent::RunType;
use tollgate::analytics::HttpMetricsSource;
use tollgate::config::Settings;
use tollgate::db::Database;
use tracing::info;

/// Connect, migrate, and assemble the shared job context.
async fn job_context(database_url: &str, cfg: Settings) -> Result<JobContext> {
    let db = Database::connect(database_url).await?;
    db.migrate().await?;
    let source = HttpMetricsSource::from_settings(&cfg)?;
    Ok(JobContext {
        db,
        source: Arc::new(source),
        cfg,
    })
}

/// Run one agent job to completion and print its finalized summary.
pub fn run_job_command(rt: &Runtime, database_url: &str, cfg: Settings, job: &str) -> Result<()> {
    let job: RunType = job.parse()?;
    rt.block_on(async {
        let ctx = job_context(database_url, cfg).await?;
        let summary = run_job(&ctx, job).await?;
        eprintln!("Run #{} ({})", summary.id, summary.run_type);
        eprintln!("  Status:         {}", summary.status);
        eprintln!("  Items:          {}", summary.items_processed);
        eprintln!("  Opportunities:  {}", summary.opportunities_found);
        eprintln!("  Errors:         {}", summary.errors_encountered);
        if let Some(secs) = summary.duration_secs {
            eprintln!("  Duration:       {:.1}s", secs);
        }
        if let Some(log) = &summary.log_summary {
            eprintln!("  Summary:        {}", log);
        }
        Ok(())
    })
}

/// Print a status report over recent runs, the queue, and the forecast.
pub fn run_report(rt: &Runtime, database_url: &str, cfg: Settings, json: bool) -> Result<()> {
    rt.block_on(async {
        let ctx = job_context(database_url, cfg).await?;
        let report = status_report(&ctx).await;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        eprintln!(
            "Status report ({})",
            report.generated_at.format("%Y-%m-%d %H:%M UTC")
        );

        if let Some(agg) = &report.aggregates {
            eprintln!(
                "  Runs:          {} total, {} completed, {} failed",
                agg.total_runs, agg.completed, agg.failed
            );
            eprintln!("  Success rate:  {:.1}%", agg.success_rate);
            if let Some(avg) = agg.avg_duration_secs {
                eprintln!("  Avg duration:  {:.1}s", avg);
            }
        }

        if !report.recent_runs.is_empty() {
            eprintln!(
                "\n{:<6} {:<17} {:<11} {:>7} {:>6} {:>7}  {}",
                "ID", "TYPE", "STATUS", "ITEMS", "OPPS", "ERRORS", "STARTED"
            );
            eprintln!("{}", "-".repeat(80));
            for run in &report.recent_runs {
                eprintln!(
                    "{:<6} {:<17} {:<11} {:>7} {:>6} {:>7}  {}",
                    run.id,
                    run.run_type,
                    run.status,
                    run.items_processed,
                    run.opportunities_found,
                    run.errors_encountered,
                    run.started_at.format("%Y-%m-%d %H:%M")
                );
            }
        }

        if let Some(queue) = &report.queue {
            eprintln!(
                "\n  Queue:         {} pending (${:.2} est. monthly impact)",
                queue.pending, queue.pending_revenue_impact
            );
            eprintln!(
                "                 {} approved, {} implemented, {} rejected, {} expired",
                queue.approved, queue.implemented, queue.rejected, queue.expired
            );
        }

        if let Some(acc) = &report.forecast_accuracy {
            match acc.accuracy_pct {
                Some(pct) => eprintln!(
                    "\n  Forecast:      {:.1}% accurate over {} reconciled months",
                    pct, acc.forecasts_considered
                ),
                None => eprintln!("\n  Forecast:      no reconciled months yet"),
            }
        }
        for f in &report.upcoming_forecasts {
            eprintln!(
                "    {}  ${:>12.2}  confidence {:.2}",
                f.forecast_month.format("%Y-%m"),
                f.forecasted_total_revenue,
                f.confidence_level
            );
        }
        Ok(())
    })
}

/// Apply pending migrations and exit.
pub fn run_migrate(rt: &Runtime, database_url: &str) -> Result<()> {
    rt.block_on(async {
        let db = Database::connect(database_url).await?;
        db.migrate().await?;
        info!("migrations applied");
        Ok(())
    })
}
