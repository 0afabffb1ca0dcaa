//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use async_trait::async_trait;
use chrono::NaiveDate;
use tollgate::agent::orchestrator::JobContext;
use tollgate::analytics::{MetricsSource, PageDayMetrics};
use tollgate::config::Settings;
use tollgate::db::Database;

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// One-time schema initialization.
static SCHEMA_INIT: Once = Once::new();

/// Ensure the test database schema is set up (runs migrations once per test suite).
pub fn ensure_schema() {
    SCHEMA_INIT.call_once(|| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pool = sqlx::PgPool::connect(&test_db_url()).await.unwrap();
            tollgate::db::MIGRATOR.run(&pool).await.unwrap();
        });
    });
}

/// Connect to the test database (also ensures schema is set up).
pub async fn setup_test_db() -> Database {
    ensure_schema();
    let db = Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    truncate_all_tables(db.pool()).await;
    db
}

/// Truncate all tables to ensure test isolation.
pub async fn truncate_all_tables(pool: &sqlx::PgPool) {
    sqlx::raw_sql(
        "TRUNCATE TABLE opportunity_actions, opportunities, monetization_metrics,
                        revenue_forecasts, agent_runs
         CASCADE",
    )
    .execute(pool)
    .await
    .unwrap();
}

/// Canned metrics source. Returns the same page set for every requested date,
/// or fails every fetch when built with [`StubSource::failing`].
pub struct StubSource {
    pages: Vec<PageDayMetrics>,
    fail: bool,
}

impl StubSource {
    pub fn with_pages(pages: Vec<PageDayMetrics>) -> Self {
        StubSource { pages, fail: false }
    }

    pub fn failing() -> Self {
        StubSource {
            pages: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl MetricsSource for StubSource {
    async fn fetch_page_metrics(&self, date: NaiveDate) -> anyhow::Result<Vec<PageDayMetrics>> {
        if self.fail {
            anyhow::bail!("stub source refusing fetch for {}", date);
        }
        Ok(self.pages.clone())
    }
}

/// A page snapshot with plausible ancillary numbers derived from views.
pub fn make_page(url: &str, views: i64, revenue: f64) -> PageDayMetrics {
    PageDayMetrics {
        url: url.to_string(),
        page_views: views,
        unique_visitors: views * 7 / 10,
        clicks: views / 50,
        revenue_usd: revenue,
        avg_session_secs: 75.0,
    }
}

/// Settings tuned for tests: small sync window, no background schedule.
pub fn test_settings() -> Settings {
    let mut cfg = Settings::default();
    cfg.schedule_interval_hours = 0;
    cfg.sync_days_back = 2;
    cfg
}

/// Job context backed by the test database and a stub source.
pub async fn test_context(source: StubSource) -> JobContext {
    let db = setup_test_db().await;
    JobContext {
        db,
        source: Arc::new(source),
        cfg: test_settings(),
    }
}

/// Build an Axum test app router connected to the test database. The stub
/// source serves one healthy page so triggered sync runs succeed.
pub async fn build_test_app() -> axum::Router {
    let ctx = test_context(StubSource::with_pages(vec![make_page(
        "/guides/espresso",
        1200,
        18.75,
    )]))
    .await;
    let state = tollgate::dashboard::AppState::new(ctx);
    tollgate::dashboard::build_router(state)
}
