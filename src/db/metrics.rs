//! Monetization metric snapshots: daily per-page rows from the analytics
//! source, plus the window and monthly aggregates the analysis jobs read.

use super::Database;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct PageMetricRow {
    pub id: i64,
    pub metric_date: NaiveDate,
    pub page_url: String,
    pub page_views: i64,
    pub unique_visitors: i64,
    pub clicks: i64,
    pub revenue: f64,
    pub avg_session_secs: f64,
    pub synced_at: DateTime<Utc>,
}

/// One snapshot to persist. Identity is (metric_date, page_url); re-syncing
/// the same pair overwrites in place.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetricUpsert {
    pub metric_date: NaiveDate,
    pub page_url: String,
    pub page_views: i64,
    pub unique_visitors: i64,
    pub clicks: i64,
    pub revenue: f64,
    pub avg_session_secs: f64,
}

/// Per-page aggregate over a trailing window. The half splits (before /
/// on-or-after the midpoint date) feed the trend detectors.
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct PageWindowStats {
    pub page_url: String,
    pub days_with_data: i64,
    pub total_views: i64,
    pub total_clicks: i64,
    pub total_revenue: f64,
    pub avg_session_secs: f64,
    pub first_half_views: i64,
    pub second_half_views: i64,
    pub first_half_revenue: f64,
    pub second_half_revenue: f64,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct MonthlyRevenue {
    /// First day of the month.
    pub month: NaiveDate,
    pub revenue: f64,
    pub page_views: i64,
}

impl Database {
    /// Idempotent upsert of one page-day snapshot.
    pub async fn upsert_page_metric(&self, m: &MetricUpsert) -> Result<()> {
        sqlx::query(
            "INSERT INTO monetization_metrics
                 (metric_date, page_url, page_views, unique_visitors, clicks,
                  revenue, avg_session_secs)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (metric_date, page_url) DO UPDATE SET
                 page_views = EXCLUDED.page_views,
                 unique_visitors = EXCLUDED.unique_visitors,
                 clicks = EXCLUDED.clicks,
                 revenue = EXCLUDED.revenue,
                 avg_session_secs = EXCLUDED.avg_session_secs,
                 synced_at = now()",
        )
        .bind(m.metric_date)
        .bind(&m.page_url)
        .bind(m.page_views)
        .bind(m.unique_visitors)
        .bind(m.clicks)
        .bind(m.revenue)
        .bind(m.avg_session_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Per-page aggregates for rows on or after `since`, with totals split
    /// around `midpoint` for trend detection. Busiest pages first.
    pub async fn metrics_window_stats(
        &self,
        since: NaiveDate,
        midpoint: NaiveDate,
    ) -> Result<Vec<PageWindowStats>> {
        let rows = sqlx::query_as::<_, PageWindowStats>(
            "SELECT page_url,
                    COUNT(*) AS days_with_data,
                    COALESCE(SUM(page_views), 0)::BIGINT AS total_views,
                    COALESCE(SUM(clicks), 0)::BIGINT AS total_clicks,
                    COALESCE(SUM(revenue), 0) AS total_revenue,
                    COALESCE(AVG(avg_session_secs), 0) AS avg_session_secs,
                    COALESCE(SUM(page_views) FILTER (WHERE metric_date < $2), 0)::BIGINT
                        AS first_half_views,
                    COALESCE(SUM(page_views) FILTER (WHERE metric_date >= $2), 0)::BIGINT
                        AS second_half_views,
                    COALESCE(SUM(revenue) FILTER (WHERE metric_date < $2), 0)
                        AS first_half_revenue,
                    COALESCE(SUM(revenue) FILTER (WHERE metric_date >= $2), 0)
                        AS second_half_revenue
             FROM monetization_metrics
             WHERE metric_date >= $1
             GROUP BY page_url
             ORDER BY total_views DESC",
        )
        .bind(since)
        .bind(midpoint)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Realized revenue for one calendar month, `[month_start, next_month)`.
    pub async fn monthly_revenue_total(
        &self,
        month_start: NaiveDate,
        next_month: NaiveDate,
    ) -> Result<f64> {
        let total = sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(revenue), 0) FROM monetization_metrics
             WHERE metric_date >= $1 AND metric_date < $2",
        )
        .bind(month_start)
        .bind(next_month)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    /// True when any snapshot exists inside `[month_start, next_month)`.
    /// Reconciliation refuses to record an actual of zero for a month that
    /// simply has no data.
    pub async fn month_has_metrics(
        &self,
        month_start: NaiveDate,
        next_month: NaiveDate,
    ) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                 SELECT 1 FROM monetization_metrics
                 WHERE metric_date >= $1 AND metric_date < $2
             )",
        )
        .bind(month_start)
        .bind(next_month)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Monthly revenue history for rows on or after `since`, oldest month
    /// first. Months with no rows are simply absent.
    pub async fn monthly_revenue_history(&self, since: NaiveDate) -> Result<Vec<MonthlyRevenue>> {
        let rows = sqlx::query_as::<_, MonthlyRevenue>(
            "SELECT (date_trunc('month', metric_date))::date AS month,
                    COALESCE(SUM(revenue), 0) AS revenue,
                    COALESCE(SUM(page_views), 0)::BIGINT AS page_views
             FROM monetization_metrics
             WHERE metric_date >= $1
             GROUP BY 1
             ORDER BY 1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Number of page rows stored for one date. Used for sync logging and
    /// idempotency checks.
    pub async fn count_metrics_for_date(&self, date: NaiveDate) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM monetization_metrics WHERE metric_date = $1",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Drop snapshots older than the retention window. Returns rows removed.
    pub async fn prune_old_metrics(&self, older_than_days: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM monetization_metrics
             WHERE metric_date < (now() - ($1 * interval '1 day'))::date",
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
