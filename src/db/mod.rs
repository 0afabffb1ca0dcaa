//! # Database — PostgreSQL Storage Layer
//!
//! Async storage for the monetization agent pipeline via `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `agent_runs`: audit trail, one row per orchestrator job invocation
//! - `opportunities` / `opportunity_actions`: the approval queue state machine
//! - `monetization_metrics`: daily per-page snapshots from the analytics source
//! - `revenue_forecasts`: monthly projections reconciled against actuals
//!
//! ## Module Structure
//!
//! Operations are split into submodules by domain:
//!
//! - [`runs`] — agent run lifecycle (create, finalize, history, aggregates)
//! - [`queue`] — opportunity/action state machine; the only code that mutates
//!   opportunity or action status
//! - [`metrics`] — snapshot upserts and window aggregates
//! - [`forecasts`] — forecast upserts guarded against overwriting actuals

mod forecasts;
mod metrics;
mod queue;
mod runs;

pub use forecasts::ForecastRow;
pub use metrics::{MetricUpsert, MonthlyRevenue, PageMetricRow, PageWindowStats};
pub use queue::{
    ActionRow, NewAction, NewOpportunity, OpportunityRow, OpportunityWithActions, QueueError,
    QueueStats,
};
pub use runs::{AgentRunRow, RunAggregates, RunHistory, RunHistoryFilter, RunTypeCount};

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Embedded migrations, applied by `tollgate migrate` and the test harness.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Database { pool })
    }

    /// Wrap an existing pool (used by the test harness).
    pub fn from_pool(pool: PgPool) -> Self {
        Database { pool }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply any pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    ///
    /// Used by the `/readyz` probe. Returns `Ok(())` if the database
    /// responds, or an error if the connection is broken.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
