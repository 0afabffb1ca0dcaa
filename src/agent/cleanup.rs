//! # Cleanup — Queue Expiry and Retention Pruning
//!
//! Last job in a full run. Expires stale pending opportunities nobody acted
//! on and prunes metric and run rows past their retention horizons. Each
//! sweep is a single bulk statement; there is nothing to batch.

use super::JobOutcome;
use crate::config::Settings;
use crate::db::Database;
use anyhow::Result;
use tracing::info;

pub async fn run_cleanup(db: &Database, cfg: &Settings) -> Result<JobOutcome> {
    let expired = db.expire_old_opportunities(cfg.expire_after_days).await?;
    let metrics_pruned = db.prune_old_metrics(cfg.metrics_retention_days).await?;
    let runs_pruned = db.prune_old_runs(cfg.runs_retention_days).await?;

    info!(
        expired,
        metrics_pruned, runs_pruned, "cleanup complete"
    );
    Ok(JobOutcome {
        items_processed: (expired + metrics_pruned + runs_pruned) as i64,
        opportunities_found: 0,
        errors: 0,
    })
}
