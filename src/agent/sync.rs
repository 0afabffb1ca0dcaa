//! # Sync — Metrics Snapshot Job
//!
//! Pulls page-level analytics for each requested date and upserts one
//! `monetization_metrics` row per page through the batched executor, so a
//! large site never slams the pool with thousands of concurrent upserts.
//! A date whose fetch fails is logged and skipped; later dates still run.

use super::JobOutcome;
use crate::analytics::{MetricsSource, PageDayMetrics};
use crate::batch::BatchRunner;
use crate::config::Settings;
use crate::db::{Database, MetricUpsert};
use anyhow::{bail, Result};
use chrono::NaiveDate;
use tracing::{debug, info, warn};

/// Inclusive date range, oldest first. Empty when `start > end`.
pub fn expand_date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut current = start;
    while current <= end {
        days.push(current);
        current += chrono::Duration::days(1);
    }
    days
}

fn to_upsert(date: NaiveDate, page: PageDayMetrics) -> MetricUpsert {
    MetricUpsert {
        metric_date: date,
        page_url: page.url,
        page_views: page.page_views,
        unique_visitors: page.unique_visitors,
        clicks: page.clicks,
        revenue: page.revenue_usd,
        avg_session_secs: page.avg_session_secs,
    }
}

/// Sync snapshots for every date in `dates`. Returns the number of page-day
/// rows stored. Fails only when the whole request produced nothing: every
/// fetch failed, or every upsert failed.
pub async fn run_metrics_sync(
    db: &Database,
    source: &dyn MetricsSource,
    cfg: &Settings,
    dates: &[NaiveDate],
) -> Result<JobOutcome> {
    if dates.is_empty() {
        return Ok(JobOutcome::default());
    }

    let runner = BatchRunner::new(cfg.batch_size, cfg.batch_delay());
    let mut synced_rows = 0i64;
    let mut failed_upserts = 0i64;
    let mut failed_dates = 0usize;

    for &date in dates {
        let pages = match source.fetch_page_metrics(date).await {
            Ok(pages) => pages,
            Err(e) => {
                failed_dates += 1;
                warn!(%date, error = %e, "metrics fetch failed, skipping date");
                continue;
            }
        };
        if pages.is_empty() {
            debug!(%date, "analytics source returned no pages");
            continue;
        }

        let upserts: Vec<MetricUpsert> = pages.into_iter().map(|p| to_upsert(date, p)).collect();
        let outcome = runner
            .run_with_progress(
                upserts,
                |m| async move { db.upsert_page_metric(&m).await },
                |done, total| debug!(%date, done, total, "sync progress"),
            )
            .await;

        synced_rows += outcome.successes as i64;
        failed_upserts += outcome.failures as i64;
        if outcome.failures > 0 {
            warn!(
                %date,
                stored = outcome.successes,
                failed = outcome.failures,
                "metrics sync stored a partial day"
            );
        } else {
            info!(%date, pages = outcome.successes, "metrics synced");
        }
    }

    if failed_dates == dates.len() {
        bail!("metrics sync failed for all {} requested dates", dates.len());
    }
    if synced_rows == 0 && failed_upserts > 0 {
        bail!("metrics sync stored no rows ({} upserts failed)", failed_upserts);
    }

    Ok(JobOutcome {
        items_processed: synced_rows,
        opportunities_found: 0,
        errors: failed_dates as i64 + failed_upserts,
    })
}
