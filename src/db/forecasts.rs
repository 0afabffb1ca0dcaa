//! Revenue forecast storage. One row per forecast month; regenerating a
//! forecast overwrites the projection, while a month whose actuals have been
//! reconciled is locked against further writes.

use super::Database;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct ForecastRow {
    pub id: i64,
    pub forecast_month: NaiveDate,
    pub forecasted_total_revenue: f64,
    pub confidence_level: f64,
    pub month_over_month_growth: f64,
    pub actual_total_revenue: Option<f64>,
    pub generated_at: DateTime<Utc>,
}

impl Database {
    /// Upsert the projection for one month. Returns false when the month
    /// already has actuals recorded and was left untouched.
    pub async fn upsert_forecast(
        &self,
        month: NaiveDate,
        forecasted_total_revenue: f64,
        confidence_level: f64,
        month_over_month_growth: f64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO revenue_forecasts
                 (forecast_month, forecasted_total_revenue, confidence_level,
                  month_over_month_growth)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (forecast_month) DO UPDATE SET
                 forecasted_total_revenue = EXCLUDED.forecasted_total_revenue,
                 confidence_level = EXCLUDED.confidence_level,
                 month_over_month_growth = EXCLUDED.month_over_month_growth,
                 generated_at = now()
             WHERE revenue_forecasts.actual_total_revenue IS NULL",
        )
        .bind(month)
        .bind(forecasted_total_revenue)
        .bind(confidence_level)
        .bind(month_over_month_growth)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_forecast(&self, month: NaiveDate) -> Result<Option<ForecastRow>> {
        let row = sqlx::query_as::<_, ForecastRow>(
            "SELECT * FROM revenue_forecasts WHERE forecast_month = $1",
        )
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Most recent forecast months first.
    pub async fn list_forecasts(&self, limit: i64) -> Result<Vec<ForecastRow>> {
        let rows = sqlx::query_as::<_, ForecastRow>(
            "SELECT * FROM revenue_forecasts ORDER BY forecast_month DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Forecast months strictly before `before` that still lack actuals,
    /// oldest first. These are the months `update_actuals` reconciles.
    pub async fn unreconciled_months(&self, before: NaiveDate) -> Result<Vec<ForecastRow>> {
        let rows = sqlx::query_as::<_, ForecastRow>(
            "SELECT * FROM revenue_forecasts
             WHERE actual_total_revenue IS NULL AND forecast_month < $1
             ORDER BY forecast_month ASC",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Record realized revenue for a month. The NULL guard makes
    /// reconciliation write-once.
    pub async fn set_actual_revenue(&self, month: NaiveDate, actual: f64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE revenue_forecasts SET actual_total_revenue = $2
             WHERE forecast_month = $1 AND actual_total_revenue IS NULL",
        )
        .bind(month)
        .bind(actual)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// All forecasts that have been reconciled against actuals.
    pub async fn forecasts_with_actuals(&self) -> Result<Vec<ForecastRow>> {
        let rows = sqlx::query_as::<_, ForecastRow>(
            "SELECT * FROM revenue_forecasts
             WHERE actual_total_revenue IS NOT NULL
             ORDER BY forecast_month ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
