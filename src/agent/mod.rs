//! # Agent — Monetization Job Pipeline
//!
//! The named jobs the orchestrator runs against the marketplace's metrics
//! and content, leaf-first:
//!
//! - [`sync`] — pull daily per-page snapshots from the analytics source
//! - [`scanner`] — heuristic detectors that queue candidate opportunities
//! - [`rpm`] — yield analysis flagging under-performing and spiking pages
//! - [`forecast`] — monthly revenue projection and actuals reconciliation
//! - [`cleanup`] — queue expiry and retention pruning
//! - [`orchestrator`] — run bookkeeping, the fixed full sequence, reporting
//!
//! Every job returns a [`JobOutcome`]. For single runs `errors` counts
//! recoverable per-item or per-date failures; for a full run the orchestrator
//! instead records the number of failed sub-jobs.

pub mod cleanup;
pub mod forecast;
pub mod orchestrator;
pub mod rpm;
pub mod scanner;
pub mod sync;

use crate::db::{NewAction, NewOpportunity};
use anyhow::bail;
use serde::{Deserialize, Serialize};

/// The named jobs the orchestrator can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    MetricsSync,
    OpportunityScan,
    RpmAnalysis,
    Forecast,
    Cleanup,
    Full,
    Report,
}

impl RunType {
    /// The single jobs a full run executes, in their fixed order. Sync feeds
    /// the detectors, the detectors feed the queue, forecasting runs on
    /// whatever data made it in, cleanup goes last.
    pub const FULL_SEQUENCE: [RunType; 5] = [
        RunType::MetricsSync,
        RunType::OpportunityScan,
        RunType::RpmAnalysis,
        RunType::Forecast,
        RunType::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::MetricsSync => "metrics_sync",
            RunType::OpportunityScan => "opportunity_scan",
            RunType::RpmAnalysis => "rpm_analysis",
            RunType::Forecast => "forecast",
            RunType::Cleanup => "cleanup",
            RunType::Full => "full",
            RunType::Report => "report",
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metrics_sync" => Ok(RunType::MetricsSync),
            "opportunity_scan" => Ok(RunType::OpportunityScan),
            "rpm_analysis" => Ok(RunType::RpmAnalysis),
            "forecast" => Ok(RunType::Forecast),
            "cleanup" => Ok(RunType::Cleanup),
            "full" => Ok(RunType::Full),
            "report" => Ok(RunType::Report),
            other => bail!(
                "unknown job type '{}' (expected one of: metrics_sync, opportunity_scan, \
                 rpm_analysis, forecast, cleanup, full, report)",
                other
            ),
        }
    }
}

/// What a job reports back to the orchestrator for the run row.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct JobOutcome {
    pub items_processed: i64,
    pub opportunities_found: i64,
    /// Recoverable failures the job absorbed (failed dates, failed upserts,
    /// failed queue inserts). The job still completed.
    pub errors: i64,
}

impl JobOutcome {
    pub fn merge(&mut self, other: JobOutcome) {
        self.items_processed += other.items_processed;
        self.opportunities_found += other.opportunities_found;
        self.errors += other.errors;
    }
}

/// A detector hit ready for the queue's creation path.
#[derive(Clone, Debug)]
pub struct CandidateOpportunity {
    pub opportunity: NewOpportunity,
    pub actions: Vec<NewAction>,
}

/// Dollar amounts surfaced to reviewers are rounded to whole cents.
pub(crate) fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
