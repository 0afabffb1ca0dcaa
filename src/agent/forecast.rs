//! # Forecast — Revenue Projection and Reconciliation
//!
//! Projects total monthly revenue a few months out from a trailing window of
//! realized metrics: a weighted moving average anchors the level (recent
//! months weigh heaviest) and an averaged month-over-month growth ratio
//! extrapolates the trend. Confidence decays with distance from the present.
//!
//! Past months are reconciled against realized totals before every
//! regeneration, and a reconciled month is locked: regenerating overwrites
//! projections, never actuals.

use super::{round_cents, JobOutcome};
use crate::config::Settings;
use crate::db::{Database, MonthlyRevenue};
use anyhow::Result;
use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;
use tracing::{info, warn};

/// Month-over-month growth is clamped to this band so one anomalous month
/// cannot compound into an absurd multi-month projection.
const GROWTH_CLAMP: f64 = 0.5;
/// Per-month geometric decay applied to confidence.
const CONFIDENCE_DECAY: f64 = 0.85;
const CONFIDENCE_FLOOR: f64 = 0.05;

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(Months::new(months)).unwrap_or(date)
}

/// Weighted moving average with linearly increasing weights, oldest first.
/// `[10, 20, 30]` averages to `(10*1 + 20*2 + 30*3) / 6`.
pub fn weighted_moving_average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    for (i, value) in values.iter().enumerate() {
        let weight = (i + 1) as f64;
        weighted += value * weight;
        weight_sum += weight;
    }
    Some(weighted / weight_sum)
}

/// Mean month-over-month growth ratio over consecutive pairs, clamped to
/// ±[`GROWTH_CLAMP`]. Pairs whose earlier month earned nothing are skipped
/// rather than dividing by zero.
pub fn average_mom_growth(values: &[f64]) -> f64 {
    let mut ratios = Vec::new();
    for pair in values.windows(2) {
        if pair[0] > 0.0 {
            ratios.push(pair[1] / pair[0] - 1.0);
        }
    }
    if ratios.is_empty() {
        return 0.0;
    }
    let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
    mean.clamp(-GROWTH_CLAMP, GROWTH_CLAMP)
}

/// Confidence for a projection `months_out` months from now (1 = next
/// month), given how many months of history fed the model. Longer history
/// raises the base; distance decays it geometrically. Never increases with
/// distance.
pub fn confidence_for_distance(history_months: usize, months_out: u32) -> f64 {
    let base = (0.4 + 0.075 * history_months as f64).min(0.85);
    let decayed = base * CONFIDENCE_DECAY.powi(months_out.saturating_sub(1) as i32);
    decayed.max(CONFIDENCE_FLOOR)
}

#[derive(Clone, Debug, Serialize)]
pub struct ForecastProjection {
    pub month: NaiveDate,
    pub projected_revenue: f64,
    pub confidence: f64,
    pub growth: f64,
}

/// Project the next `months_ahead` months from realized history (oldest
/// first). Empty history yields no projections rather than a guessed zero.
pub fn project_revenue(
    history: &[MonthlyRevenue],
    from_month: NaiveDate,
    months_ahead: u32,
) -> Vec<ForecastProjection> {
    let revenues: Vec<f64> = history.iter().map(|m| m.revenue).collect();
    let base = match weighted_moving_average(&revenues) {
        Some(base) => base,
        None => return Vec::new(),
    };
    let growth = average_mom_growth(&revenues);
    (1..=months_ahead)
        .map(|k| ForecastProjection {
            month: add_months(from_month, k),
            projected_revenue: round_cents(base * (1.0 + growth).powi(k as i32)),
            confidence: confidence_for_distance(history.len(), k),
            growth,
        })
        .collect()
}

/// Mean absolute percentage error over `(forecast, actual)` pairs. Months
/// whose realized revenue is zero cannot express a percentage error and are
/// skipped; None when no pair is usable.
pub fn mean_absolute_percentage_error(pairs: &[(f64, f64)]) -> Option<f64> {
    let mut total = 0.0;
    let mut counted = 0usize;
    for (forecast, actual) in pairs {
        if *actual == 0.0 {
            continue;
        }
        total += ((forecast - actual) / actual).abs() * 100.0;
        counted += 1;
    }
    if counted == 0 {
        None
    } else {
        Some(total / counted as f64)
    }
}

pub fn accuracy_from_mape(mape: f64) -> f64 {
    (100.0 - mape).max(0.0)
}

#[derive(Clone, Debug, Serialize)]
pub struct ForecastAccuracy {
    pub forecasts_considered: i64,
    pub mean_absolute_percentage_error: Option<f64>,
    pub accuracy_pct: Option<f64>,
}

/// Regenerate projections for the months ahead. The current partial month is
/// excluded from history so a half-elapsed month does not drag the level
/// down. Returns `(written, locked)` where locked months already carry
/// actuals and were left untouched.
pub async fn generate_forecast(
    db: &Database,
    cfg: &Settings,
    today: NaiveDate,
) -> Result<(i64, i64)> {
    let current = month_start(today);
    let since = current
        .checked_sub_months(Months::new(cfg.forecast_history_months))
        .unwrap_or(current);
    let mut history = db.monthly_revenue_history(since).await?;
    history.retain(|m| m.month < current);

    let projections = project_revenue(&history, current, cfg.forecast_months_ahead);
    if projections.is_empty() {
        warn!("no realized revenue history, skipping forecast generation");
        return Ok((0, 0));
    }

    let mut written = 0i64;
    let mut locked = 0i64;
    for p in &projections {
        let wrote = db
            .upsert_forecast(p.month, p.projected_revenue, p.confidence, p.growth)
            .await?;
        if wrote {
            written += 1;
        } else {
            locked += 1;
        }
    }
    info!(
        written,
        locked,
        history_months = history.len(),
        "forecast regenerated"
    );
    Ok((written, locked))
}

/// Fill in realized totals for every fully elapsed forecast month still
/// lacking them. A month with no synced metrics at all stays open; zero rows
/// and zero revenue are not the same claim.
pub async fn update_actuals(db: &Database, today: NaiveDate) -> Result<i64> {
    let current = month_start(today);
    let open = db.unreconciled_months(current).await?;
    let mut updated = 0i64;
    for row in open {
        let month = row.forecast_month;
        let next = add_months(month, 1);
        if !db.month_has_metrics(month, next).await? {
            continue;
        }
        let actual = db.monthly_revenue_total(month, next).await?;
        if db.set_actual_revenue(month, actual).await? > 0 {
            updated += 1;
        }
    }
    Ok(updated)
}

/// Accuracy across every reconciled forecast. Zero reconciled forecasts is a
/// valid answer, not an error.
pub async fn forecast_accuracy(db: &Database) -> Result<ForecastAccuracy> {
    let rows = db.forecasts_with_actuals().await?;
    let pairs: Vec<(f64, f64)> = rows
        .iter()
        .filter_map(|r| {
            r.actual_total_revenue
                .map(|actual| (r.forecasted_total_revenue, actual))
        })
        .filter(|(_, actual)| *actual != 0.0)
        .collect();
    let mape = mean_absolute_percentage_error(&pairs);
    Ok(ForecastAccuracy {
        forecasts_considered: pairs.len() as i64,
        mean_absolute_percentage_error: mape,
        accuracy_pct: mape.map(accuracy_from_mape),
    })
}

/// Reconciliation runs before regeneration so freshly locked months are
/// already immune by the time new projections are upserted.
pub async fn run_forecast_job(db: &Database, cfg: &Settings, today: NaiveDate) -> Result<JobOutcome> {
    let reconciled = update_actuals(db, today).await?;
    let (written, locked) = generate_forecast(db, cfg, today).await?;
    info!(reconciled, written, locked, "forecast job complete");
    Ok(JobOutcome {
        items_processed: reconciled + written,
        opportunities_found: 0,
        errors: 0,
    })
}
