//! # Config — Environment-Driven Settings
//!
//! All agent tunables come from environment variables (loaded from `.env` via
//! dotenvy in main) with conservative defaults. DATABASE_URL is handled by the
//! CLI layer, not here, so `Settings` can be constructed without a database.

use anyhow::{Context, Result};
use std::time::Duration;

/// Runtime tunables for the agent pipeline and its HTTP surface.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Base URL of the external analytics source.
    pub analytics_base_url: String,
    /// Bearer credential for the analytics source. None disables auth headers.
    pub analytics_api_key: Option<String>,
    /// Request timeout for analytics fetches.
    pub fetch_timeout_secs: u64,
    /// Token bucket capacity for analytics requests.
    pub rate_capacity: u32,
    /// Token bucket refill interval in milliseconds.
    pub rate_refill_ms: u64,

    /// Max concurrent item operations per batch slice.
    pub batch_size: usize,
    /// Pause between batch slices in milliseconds.
    pub batch_delay_ms: u64,

    /// Days of history the sync job pulls when no explicit date is given.
    pub sync_days_back: i64,
    /// Trailing window (days) for the scanner and RPM aggregates.
    pub scan_window_days: i64,
    /// Detector hits below this confidence are discarded, not queued.
    pub confidence_floor: f64,
    /// Pages at or below this RPM percentile are flagged as underperforming.
    pub rpm_low_percentile: f64,
    /// Traffic growth ratio that counts as a spike in the RPM job.
    pub rpm_spike_factor: f64,

    /// Pending opportunities older than this many days are expired by cleanup.
    pub expire_after_days: i64,
    /// Metric snapshots older than this are pruned by cleanup.
    pub metrics_retention_days: i64,
    /// Terminal agent runs older than this are pruned by cleanup.
    pub runs_retention_days: i64,

    /// How many future months the forecaster projects.
    pub forecast_months_ahead: u32,
    /// How many trailing months feed the forecast model.
    pub forecast_history_months: u32,

    /// Runs included in the status report.
    pub report_run_limit: i64,
    /// Hours between scheduled full runs from the serve loop. 0 disables.
    pub schedule_interval_hours: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            analytics_base_url: "https://analytics.internal".to_string(),
            analytics_api_key: None,
            fetch_timeout_secs: 30,
            rate_capacity: 10,
            rate_refill_ms: 1_000,
            batch_size: 10,
            batch_delay_ms: 250,
            sync_days_back: 1,
            scan_window_days: 30,
            confidence_floor: 0.5,
            rpm_low_percentile: 0.25,
            rpm_spike_factor: 2.0,
            expire_after_days: 30,
            metrics_retention_days: 365,
            runs_retention_days: 90,
            forecast_months_ahead: 3,
            forecast_history_months: 6,
            report_run_limit: 20,
            schedule_interval_hours: 0,
        }
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults for
    /// anything unset. A set-but-unparseable variable is an error, not a
    /// silent fallback.
    pub fn from_env() -> Result<Self> {
        let d = Settings::default();
        Ok(Settings {
            analytics_base_url: env_string("ANALYTICS_BASE_URL", &d.analytics_base_url),
            analytics_api_key: std::env::var("ANALYTICS_API_KEY").ok().filter(|k| !k.is_empty()),
            fetch_timeout_secs: env_parsed("ANALYTICS_TIMEOUT_SECS", d.fetch_timeout_secs)?,
            rate_capacity: env_parsed("ANALYTICS_RATE_CAPACITY", d.rate_capacity)?,
            rate_refill_ms: env_parsed("ANALYTICS_RATE_REFILL_MS", d.rate_refill_ms)?,
            batch_size: env_parsed("AGENT_BATCH_SIZE", d.batch_size)?,
            batch_delay_ms: env_parsed("AGENT_BATCH_DELAY_MS", d.batch_delay_ms)?,
            sync_days_back: env_parsed("SYNC_DAYS_BACK", d.sync_days_back)?,
            scan_window_days: env_parsed("SCANNER_WINDOW_DAYS", d.scan_window_days)?,
            confidence_floor: env_parsed("SCANNER_CONFIDENCE_FLOOR", d.confidence_floor)?,
            rpm_low_percentile: env_parsed("RPM_LOW_PERCENTILE", d.rpm_low_percentile)?,
            rpm_spike_factor: env_parsed("RPM_SPIKE_FACTOR", d.rpm_spike_factor)?,
            expire_after_days: env_parsed("QUEUE_EXPIRE_DAYS", d.expire_after_days)?,
            metrics_retention_days: env_parsed("METRICS_RETENTION_DAYS", d.metrics_retention_days)?,
            runs_retention_days: env_parsed("RUNS_RETENTION_DAYS", d.runs_retention_days)?,
            forecast_months_ahead: env_parsed("FORECAST_MONTHS_AHEAD", d.forecast_months_ahead)?,
            forecast_history_months: env_parsed(
                "FORECAST_HISTORY_MONTHS",
                d.forecast_history_months,
            )?,
            report_run_limit: env_parsed("REPORT_RUN_LIMIT", d.report_run_limit)?,
            schedule_interval_hours: env_parsed("AGENT_SCHEDULE_HOURS", d.schedule_interval_hours)?,
        })
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn rate_refill(&self) -> Duration {
        Duration::from_millis(self.rate_refill_ms)
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert!(s.batch_size > 0);
        assert!(s.confidence_floor >= 0.0 && s.confidence_floor <= 1.0);
        assert!(s.rpm_low_percentile > 0.0 && s.rpm_low_percentile < 1.0);
        assert!(s.forecast_months_ahead >= 1);
        assert_eq!(s.schedule_interval_hours, 0, "scheduling must default off");
    }

    #[test]
    fn env_parsed_reads_set_variable() {
        std::env::set_var("TOLLGATE_TEST_BATCH", "42");
        let v: usize = env_parsed("TOLLGATE_TEST_BATCH", 7).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn env_parsed_falls_back_when_unset() {
        let v: u64 = env_parsed("TOLLGATE_TEST_UNSET_VAR", 123).unwrap();
        assert_eq!(v, 123);
    }

    #[test]
    fn env_parsed_rejects_garbage() {
        std::env::set_var("TOLLGATE_TEST_GARBAGE", "not-a-number");
        let v: Result<u64> = env_parsed("TOLLGATE_TEST_GARBAGE", 1);
        assert!(v.is_err(), "set-but-invalid must error, not fall back");
    }

    #[test]
    fn env_string_ignores_empty() {
        std::env::set_var("TOLLGATE_TEST_EMPTY", "");
        assert_eq!(env_string("TOLLGATE_TEST_EMPTY", "fallback"), "fallback");
    }

    #[test]
    fn duration_helpers() {
        let s = Settings {
            batch_delay_ms: 250,
            fetch_timeout_secs: 30,
            ..Settings::default()
        };
        assert_eq!(s.batch_delay(), Duration::from_millis(250));
        assert_eq!(s.fetch_timeout(), Duration::from_secs(30));
    }
}
