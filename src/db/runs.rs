//! Agent run audit trail: creation, finalization, history, and aggregates.
//!
//! A run row is created when a job starts and finalized exactly once when it
//! ends. The `status = 'running'` guard on the finalizing updates is what
//! enforces the single-transition rule at the storage level.

use super::Database;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct AgentRunRow {
    pub id: i64,
    pub run_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_processed: i64,
    pub opportunities_found: i64,
    pub errors_encountered: i64,
    pub log_summary: Option<String>,
    pub error_details: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RunHistoryFilter {
    /// Only runs started within the last N days.
    pub days: Option<i64>,
    pub run_type: Option<String>,
    pub status: Option<String>,
    /// Zero-based page index.
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl RunHistoryFilter {
    pub(crate) fn page_size(&self) -> i64 {
        self.limit.unwrap_or(25).clamp(1, 200)
    }

    pub(crate) fn offset(&self) -> i64 {
        self.page.unwrap_or(0).max(0) * self.page_size()
    }
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct RunTypeCount {
    pub run_type: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub items_processed: i64,
    pub opportunities_found: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunAggregates {
    pub total_runs: i64,
    pub completed: i64,
    pub failed: i64,
    /// completed / finished, in percent. 100 when nothing has finished yet.
    pub success_rate: f64,
    pub avg_duration_secs: Option<f64>,
    pub by_type: Vec<RunTypeCount>,
}

#[derive(Serialize)]
pub struct RunHistory {
    pub runs: Vec<AgentRunRow>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub aggregates: RunAggregates,
}

impl Database {
    /// Insert a new run in `running` state and return it.
    pub async fn create_agent_run(&self, run_type: &str) -> Result<AgentRunRow> {
        let row = sqlx::query_as::<_, AgentRunRow>(
            "INSERT INTO agent_runs (run_type, status) VALUES ($1, 'running') RETURNING *",
        )
        .bind(run_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Finalize a running run as completed. Errors if the run is missing or
    /// already finalized.
    pub async fn complete_agent_run(
        &self,
        id: i64,
        items_processed: i64,
        opportunities_found: i64,
        errors_encountered: i64,
        log_summary: &str,
    ) -> Result<AgentRunRow> {
        let row = sqlx::query_as::<_, AgentRunRow>(
            "UPDATE agent_runs
             SET status = 'completed', completed_at = now(),
                 items_processed = $2, opportunities_found = $3,
                 errors_encountered = $4, log_summary = $5
             WHERE id = $1 AND status = 'running'
             RETURNING *",
        )
        .bind(id)
        .bind(items_processed)
        .bind(opportunities_found)
        .bind(errors_encountered)
        .bind(log_summary)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row),
            None => bail!("agent run {} is not running, refusing to finalize", id),
        }
    }

    /// Finalize a running run as failed, attaching structured error details.
    pub async fn fail_agent_run(
        &self,
        id: i64,
        items_processed: i64,
        opportunities_found: i64,
        errors_encountered: i64,
        log_summary: &str,
        error_details: &Value,
    ) -> Result<AgentRunRow> {
        let row = sqlx::query_as::<_, AgentRunRow>(
            "UPDATE agent_runs
             SET status = 'failed', completed_at = now(),
                 items_processed = $2, opportunities_found = $3,
                 errors_encountered = $4, log_summary = $5, error_details = $6
             WHERE id = $1 AND status = 'running'
             RETURNING *",
        )
        .bind(id)
        .bind(items_processed)
        .bind(opportunities_found)
        .bind(errors_encountered)
        .bind(log_summary)
        .bind(error_details)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row),
            None => bail!("agent run {} is not running, refusing to finalize", id),
        }
    }

    pub async fn get_agent_run(&self, id: i64) -> Result<Option<AgentRunRow>> {
        let row = sqlx::query_as::<_, AgentRunRow>("SELECT * FROM agent_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Most recent run of one type, regardless of status. The serve loop uses
    /// this to decide whether a scheduled full run is due.
    pub async fn latest_run_of_type(&self, run_type: &str) -> Result<Option<AgentRunRow>> {
        let row = sqlx::query_as::<_, AgentRunRow>(
            "SELECT * FROM agent_runs WHERE run_type = $1
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(run_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Most recent runs, newest first.
    pub async fn get_recent_runs(&self, limit: i64) -> Result<Vec<AgentRunRow>> {
        let rows = sqlx::query_as::<_, AgentRunRow>(
            "SELECT * FROM agent_runs ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Filtered, paged run history with aggregate stats over the same filter.
    pub async fn get_run_history(&self, filter: &RunHistoryFilter) -> Result<RunHistory> {
        let mut conditions = Vec::new();
        let mut param_idx = 1u32;

        if filter.days.is_some() {
            conditions.push(format!("started_at > now() - (${} * interval '1 day')", param_idx));
            param_idx += 1;
        }
        if filter.run_type.is_some() {
            conditions.push(format!("run_type = ${}", param_idx));
            param_idx += 1;
        }
        if filter.status.is_some() {
            conditions.push(format!("status = ${}", param_idx));
            param_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT * FROM agent_runs{} ORDER BY started_at DESC LIMIT ${} OFFSET ${}",
            where_clause,
            param_idx,
            param_idx + 1,
        );
        let mut query = sqlx::query_as::<_, AgentRunRow>(&sql);
        if let Some(days) = filter.days {
            query = query.bind(days);
        }
        if let Some(ref run_type) = filter.run_type {
            query = query.bind(run_type);
        }
        if let Some(ref status) = filter.status {
            query = query.bind(status);
        }
        let runs = query
            .bind(filter.page_size())
            .bind(filter.offset())
            .fetch_all(&self.pool)
            .await?;

        let count_sql = format!("SELECT COUNT(*) FROM agent_runs{}", where_clause);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(days) = filter.days {
            count_query = count_query.bind(days);
        }
        if let Some(ref run_type) = filter.run_type {
            count_query = count_query.bind(run_type);
        }
        if let Some(ref status) = filter.status {
            count_query = count_query.bind(status);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let aggregates = self.get_run_aggregates(filter).await?;

        Ok(RunHistory {
            runs,
            total,
            page: filter.page.unwrap_or(0).max(0),
            page_size: filter.page_size(),
            aggregates,
        })
    }

    /// Aggregate stats over runs matching the filter (ignoring paging).
    pub async fn get_run_aggregates(&self, filter: &RunHistoryFilter) -> Result<RunAggregates> {
        let mut conditions = Vec::new();
        let mut param_idx = 1u32;
        if filter.days.is_some() {
            conditions.push(format!("started_at > now() - (${} * interval '1 day')", param_idx));
            param_idx += 1;
        }
        if filter.run_type.is_some() {
            conditions.push(format!("run_type = ${}", param_idx));
            param_idx += 1;
        }
        if filter.status.is_some() {
            conditions.push(format!("status = ${}", param_idx));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let summary_sql = format!(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                    AVG(EXTRACT(EPOCH FROM (completed_at - started_at))::float8)
                        FILTER (WHERE completed_at IS NOT NULL) AS avg_duration
             FROM agent_runs{}",
            where_clause
        );
        let mut summary_query =
            sqlx::query_as::<_, (i64, i64, i64, Option<f64>)>(&summary_sql);
        if let Some(days) = filter.days {
            summary_query = summary_query.bind(days);
        }
        if let Some(ref run_type) = filter.run_type {
            summary_query = summary_query.bind(run_type);
        }
        if let Some(ref status) = filter.status {
            summary_query = summary_query.bind(status);
        }
        let (total_runs, completed, failed, avg_duration_secs) =
            summary_query.fetch_one(&self.pool).await?;

        let by_type_sql = format!(
            "SELECT run_type,
                    COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                    COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                    COALESCE(SUM(items_processed), 0)::BIGINT AS items_processed,
                    COALESCE(SUM(opportunities_found), 0)::BIGINT AS opportunities_found
             FROM agent_runs{}
             GROUP BY run_type
             ORDER BY run_type",
            where_clause
        );
        let mut by_type_query = sqlx::query_as::<_, RunTypeCount>(&by_type_sql);
        if let Some(days) = filter.days {
            by_type_query = by_type_query.bind(days);
        }
        if let Some(ref run_type) = filter.run_type {
            by_type_query = by_type_query.bind(run_type);
        }
        if let Some(ref status) = filter.status {
            by_type_query = by_type_query.bind(status);
        }
        let by_type = by_type_query.fetch_all(&self.pool).await?;

        let finished = completed + failed;
        let success_rate = if finished > 0 {
            completed as f64 / finished as f64 * 100.0
        } else {
            100.0
        };

        Ok(RunAggregates {
            total_runs,
            completed,
            failed,
            success_rate,
            avg_duration_secs,
            by_type,
        })
    }

    /// Delete terminal runs older than the retention window. Running rows are
    /// never pruned. Returns the number of rows removed.
    pub async fn prune_old_runs(&self, older_than_days: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM agent_runs
             WHERE status IN ('completed', 'failed')
               AND started_at < now() - ($1 * interval '1 day')",
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
