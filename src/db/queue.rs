//! # Action Queue — Opportunity/Action State Machine
//!
//! The approval workflow for detected monetization opportunities. This module
//! is the only code that mutates opportunity or action status; scanner jobs
//! create through [`Database::create_opportunity`] and administrators resolve
//! through approve/reject.
//!
//! ## Transitions
//!
//! Opportunity: `pending → {approved, rejected, expired}`, `approved →
//! implemented`. Action: `pending → {approved, rejected}` only via the parent
//! cascade, `approved → executed` via the external executor entry point.
//!
//! Approve/reject update the parent and every child in a single transaction,
//! so a concurrent reader never sees a resolved opportunity with pending
//! children or the reverse.

use super::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("opportunity {0} not found")]
    NotFound(i64),
    #[error("action {0} not found")]
    ActionNotFound(i64),
    #[error("opportunity {id} is '{current}', expected '{expected}'")]
    InvalidState {
        id: i64,
        current: String,
        expected: &'static str,
    },
    #[error("action {id} is '{current}', expected '{expected}'")]
    InvalidActionState {
        id: i64,
        current: String,
        expected: &'static str,
    },
    #[error("an opportunity must carry at least one action")]
    EmptyActions,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct OpportunityRow {
    pub id: i64,
    pub opportunity_type: String,
    pub title: String,
    pub description: String,
    pub priority: i32,
    pub confidence: f64,
    pub estimated_revenue_impact: Option<f64>,
    pub page_url: Option<String>,
    pub subject_id: Option<i64>,
    pub category: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub rejection_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct ActionRow {
    pub id: i64,
    pub opportunity_id: i64,
    pub action_type: String,
    pub action_data: Value,
    pub status: String,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct OpportunityWithActions {
    #[serde(flatten)]
    pub opportunity: OpportunityRow,
    pub actions: Vec<ActionRow>,
}

/// Input for the creation path. Status is not a field: everything starts
/// pending.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewOpportunity {
    pub opportunity_type: String,
    pub title: String,
    pub description: String,
    pub priority: i32,
    pub confidence: f64,
    pub estimated_revenue_impact: Option<f64>,
    pub page_url: Option<String>,
    pub subject_id: Option<i64>,
    pub category: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewAction {
    pub action_type: String,
    pub action_data: Value,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
    pub expired: i64,
    pub implemented: i64,
    pub total: i64,
    /// Sum of estimated_revenue_impact over pending rows, NULLs counted as 0.
    pub pending_revenue_impact: f64,
}

impl Database {
    /// Insert an opportunity and its actions, all pending, in one
    /// transaction. Fails with [`QueueError::EmptyActions`] when no actions
    /// are supplied; an opportunity nothing can execute is not reviewable.
    pub async fn create_opportunity(
        &self,
        new: &NewOpportunity,
        actions: &[NewAction],
    ) -> Result<OpportunityWithActions, QueueError> {
        if actions.is_empty() {
            return Err(QueueError::EmptyActions);
        }

        let mut tx = self.pool.begin().await?;
        let opportunity = sqlx::query_as::<_, OpportunityRow>(
            "INSERT INTO opportunities
                 (opportunity_type, title, description, priority, confidence,
                  estimated_revenue_impact, page_url, subject_id, category)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING *",
        )
        .bind(&new.opportunity_type)
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.priority)
        .bind(new.confidence)
        .bind(new.estimated_revenue_impact)
        .bind(&new.page_url)
        .bind(new.subject_id)
        .bind(&new.category)
        .fetch_one(&mut *tx)
        .await?;

        let mut inserted = Vec::with_capacity(actions.len());
        for action in actions {
            let row = sqlx::query_as::<_, ActionRow>(
                "INSERT INTO opportunity_actions (opportunity_id, action_type, action_data)
                 VALUES ($1, $2, $3)
                 RETURNING *",
            )
            .bind(opportunity.id)
            .bind(&action.action_type)
            .bind(&action.action_data)
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(row);
        }
        tx.commit().await?;

        Ok(OpportunityWithActions {
            opportunity,
            actions: inserted,
        })
    }

    /// Pending opportunities for review: highest priority first, then highest
    /// confidence, oldest first as the tie-break.
    pub async fn get_pending_opportunities(
        &self,
        limit: i64,
    ) -> Result<Vec<OpportunityRow>, QueueError> {
        let rows = sqlx::query_as::<_, OpportunityRow>(
            "SELECT * FROM opportunities
             WHERE status = 'pending'
             ORDER BY priority DESC, confidence DESC, created_at ASC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, approved, rejected, expired, implemented, total, pending_revenue_impact) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64, f64)>(
                "SELECT COUNT(*) FILTER (WHERE status = 'pending'),
                        COUNT(*) FILTER (WHERE status = 'approved'),
                        COUNT(*) FILTER (WHERE status = 'rejected'),
                        COUNT(*) FILTER (WHERE status = 'expired'),
                        COUNT(*) FILTER (WHERE status = 'implemented'),
                        COUNT(*),
                        COALESCE(SUM(COALESCE(estimated_revenue_impact, 0))
                            FILTER (WHERE status = 'pending'), 0)
                 FROM opportunities",
            )
            .fetch_one(&self.pool)
            .await?;
        Ok(QueueStats {
            pending,
            approved,
            rejected,
            expired,
            implemented,
            total,
            pending_revenue_impact,
        })
    }

    /// Approve a pending opportunity and cascade approval to every child
    /// action atomically.
    pub async fn approve_opportunity(
        &self,
        id: i64,
        reviewer: &str,
    ) -> Result<OpportunityWithActions, QueueError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query_as::<_, OpportunityRow>(
            "UPDATE opportunities
             SET status = 'approved', reviewed_at = now(), reviewed_by = $2
             WHERE id = $1 AND status = 'pending'
             RETURNING *",
        )
        .bind(id)
        .bind(reviewer)
        .fetch_optional(&mut *tx)
        .await?;

        let opportunity = match updated {
            Some(row) => row,
            None => return Err(self.resolve_missing(id, "pending").await),
        };

        sqlx::query(
            "UPDATE opportunity_actions SET status = 'approved'
             WHERE opportunity_id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let actions = sqlx::query_as::<_, ActionRow>(
            "SELECT * FROM opportunity_actions WHERE opportunity_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(OpportunityWithActions {
            opportunity,
            actions,
        })
    }

    /// Reject a pending opportunity and cascade rejection to every child
    /// action atomically. The reason is optional and stored verbatim.
    pub async fn reject_opportunity(
        &self,
        id: i64,
        reviewer: &str,
        reason: Option<&str>,
    ) -> Result<OpportunityWithActions, QueueError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query_as::<_, OpportunityRow>(
            "UPDATE opportunities
             SET status = 'rejected', reviewed_at = now(), reviewed_by = $2,
                 rejection_reason = $3
             WHERE id = $1 AND status = 'pending'
             RETURNING *",
        )
        .bind(id)
        .bind(reviewer)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;

        let opportunity = match updated {
            Some(row) => row,
            None => return Err(self.resolve_missing(id, "pending").await),
        };

        sqlx::query(
            "UPDATE opportunity_actions SET status = 'rejected'
             WHERE opportunity_id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let actions = sqlx::query_as::<_, ActionRow>(
            "SELECT * FROM opportunity_actions WHERE opportunity_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(OpportunityWithActions {
            opportunity,
            actions,
        })
    }

    /// Bulk-expire pending opportunities older than the cutoff. Child actions
    /// stay pending: nothing executes actions outside an approved parent, so
    /// the rows are inert, and approve/reject remain the only cascades.
    pub async fn expire_old_opportunities(&self, older_than_days: i64) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE opportunities
             SET status = 'expired'
             WHERE status = 'pending'
               AND created_at < now() - ($1 * interval '1 day')",
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// True when a pending opportunity of this type already targets the
    /// page. The detector jobs use this to avoid re-queueing the same
    /// finding on every run while the first is still awaiting review.
    pub async fn pending_opportunity_exists(
        &self,
        opportunity_type: &str,
        page_url: &str,
    ) -> Result<bool, QueueError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                 SELECT 1 FROM opportunities
                 WHERE status = 'pending' AND opportunity_type = $1 AND page_url = $2
             )",
        )
        .bind(opportunity_type)
        .bind(page_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Read one opportunity with its child actions in insertion order.
    pub async fn get_opportunity(&self, id: i64) -> Result<OpportunityWithActions, QueueError> {
        let opportunity =
            sqlx::query_as::<_, OpportunityRow>("SELECT * FROM opportunities WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(QueueError::NotFound(id))?;
        let actions = sqlx::query_as::<_, ActionRow>(
            "SELECT * FROM opportunity_actions WHERE opportunity_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(OpportunityWithActions {
            opportunity,
            actions,
        })
    }

    /// External-executor entry point: flag an approved opportunity as fully
    /// implemented.
    pub async fn mark_opportunity_implemented(
        &self,
        id: i64,
    ) -> Result<OpportunityRow, QueueError> {
        let updated = sqlx::query_as::<_, OpportunityRow>(
            "UPDATE opportunities SET status = 'implemented'
             WHERE id = $1 AND status = 'approved'
             RETURNING *",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match updated {
            Some(row) => Ok(row),
            None => Err(self.resolve_missing(id, "approved").await),
        }
    }

    /// External-executor entry point: record that an approved action ran.
    pub async fn mark_action_executed(&self, action_id: i64) -> Result<ActionRow, QueueError> {
        let updated = sqlx::query_as::<_, ActionRow>(
            "UPDATE opportunity_actions
             SET status = 'executed', executed_at = now()
             WHERE id = $1 AND status = 'approved'
             RETURNING *",
        )
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = updated {
            return Ok(row);
        }
        let current = sqlx::query_scalar::<_, String>(
            "SELECT status FROM opportunity_actions WHERE id = $1",
        )
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await?;
        match current {
            Some(current) => Err(QueueError::InvalidActionState {
                id: action_id,
                current,
                expected: "approved",
            }),
            None => Err(QueueError::ActionNotFound(action_id)),
        }
    }

    /// Distinguish "no such row" from "row in the wrong state" after a
    /// guarded update matched nothing.
    async fn resolve_missing(&self, id: i64, expected: &'static str) -> QueueError {
        let current =
            sqlx::query_scalar::<_, String>("SELECT status FROM opportunities WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        match current {
            Ok(Some(current)) => QueueError::InvalidState {
                id,
                current,
                expected,
            },
            Ok(None) => QueueError::NotFound(id),
            Err(e) => QueueError::Db(e),
        }
    }
}
