//! # Scanner — Opportunity Detection Job
//!
//! Pure heuristic detectors over per-page window aggregates. Each detector
//! either declines or produces a full [`CandidateOpportunity`] (priority,
//! confidence, impact estimate, actions); the job filters hits against the
//! configured confidence floor and pushes survivors through the queue's
//! creation path. Detectors never touch the database.

use super::{round_cents, CandidateOpportunity, JobOutcome};
use crate::config::Settings;
use crate::db::{Database, NewAction, NewOpportunity, PageWindowStats};
use anyhow::Result;
use chrono::NaiveDate;
use serde_json::json;
use tracing::{info, warn};

// Detector thresholds, tuned for a month-long window.
const PLACEMENT_MIN_VIEWS: i64 = 1_000;
const PLACEMENT_MAX_REVENUE: f64 = 1.0;
const ENGAGED_MIN_VIEWS: i64 = 500;
const ENGAGED_MIN_SESSION_SECS: f64 = 90.0;
const ENGAGED_MAX_CTR: f64 = 0.002;
const RISING_GROWTH_RATIO: f64 = 1.5;
const RISING_MIN_RECENT_VIEWS: i64 = 300;
const RISING_MAX_REVENUE_GROWTH: f64 = 1.1;

/// Site-baseline revenue per mille used to size impact estimates.
const BASELINE_RPM_USD: f64 = 12.0;
/// Fraction of the theoretical ceiling a new placement realistically captures.
const CAPTURE_RATE: f64 = 0.25;

pub(crate) fn click_through_rate(stats: &PageWindowStats) -> f64 {
    if stats.total_views <= 0 {
        return 0.0;
    }
    stats.total_clicks as f64 / stats.total_views as f64
}

/// High traffic, near-zero revenue: no placement is earning on this page.
pub fn detect_untapped_traffic(stats: &PageWindowStats) -> Option<CandidateOpportunity> {
    if stats.total_views < PLACEMENT_MIN_VIEWS || stats.total_revenue > PLACEMENT_MAX_REVENUE {
        return None;
    }
    let confidence = (0.55 + stats.total_views as f64 / 50_000.0).min(0.95);
    let estimated =
        stats.total_views as f64 / 1000.0 * BASELINE_RPM_USD * CAPTURE_RATE;
    Some(CandidateOpportunity {
        opportunity: NewOpportunity {
            opportunity_type: "untapped_traffic".into(),
            title: format!("Monetize high-traffic page {}", stats.page_url),
            description: format!(
                "{} views over the window earned ${:.2}; the page has traffic but no \
                 effective monetization placement.",
                stats.total_views, stats.total_revenue
            ),
            priority: 8,
            confidence,
            estimated_revenue_impact: Some(round_cents(estimated)),
            page_url: Some(stats.page_url.clone()),
            subject_id: None,
            category: Some("placement".into()),
        },
        actions: vec![NewAction {
            action_type: "add_placement".into(),
            action_data: json!({ "page_url": stats.page_url, "slot": "inline_primary" }),
        }],
    })
}

/// Long sessions and steady traffic, but almost nobody clicks through:
/// audience affinity exists and nothing on the page exploits it.
pub fn detect_engaged_unconverted(stats: &PageWindowStats) -> Option<CandidateOpportunity> {
    if stats.total_views < ENGAGED_MIN_VIEWS
        || stats.avg_session_secs < ENGAGED_MIN_SESSION_SECS
        || click_through_rate(stats) >= ENGAGED_MAX_CTR
    {
        return None;
    }
    let confidence = (0.5 + stats.avg_session_secs / 600.0).min(0.8);
    let estimated =
        stats.total_views as f64 / 1000.0 * BASELINE_RPM_USD * CAPTURE_RATE * 0.5;
    Some(CandidateOpportunity {
        opportunity: NewOpportunity {
            opportunity_type: "engaged_unconverted".into(),
            title: format!("Convert engaged readers on {}", stats.page_url),
            description: format!(
                "Average session of {:.0}s across {} views with a click-through rate of \
                 {:.2}%; engaged readers have nothing relevant to click.",
                stats.avg_session_secs,
                stats.total_views,
                click_through_rate(stats) * 100.0
            ),
            priority: 6,
            confidence,
            estimated_revenue_impact: Some(round_cents(estimated)),
            page_url: Some(stats.page_url.clone()),
            subject_id: None,
            category: Some("conversion".into()),
        },
        actions: vec![
            NewAction {
                action_type: "add_affiliate_module".into(),
                action_data: json!({ "page_url": stats.page_url, "position": "after_content" }),
            },
            NewAction {
                action_type: "insert_related_offers".into(),
                action_data: json!({ "page_url": stats.page_url, "max_offers": 3 }),
            },
        ],
    })
}

/// Traffic grew across the window halves while revenue stayed flat: the page
/// is taking off before monetization caught up.
pub fn detect_rising_page(stats: &PageWindowStats) -> Option<CandidateOpportunity> {
    if stats.first_half_views <= 0 || stats.second_half_views < RISING_MIN_RECENT_VIEWS {
        return None;
    }
    let growth = stats.second_half_views as f64 / stats.first_half_views as f64;
    if growth < RISING_GROWTH_RATIO {
        return None;
    }
    let revenue_kept_pace =
        stats.second_half_revenue > stats.first_half_revenue * RISING_MAX_REVENUE_GROWTH;
    if revenue_kept_pace {
        return None;
    }
    let confidence = (0.45 + (growth - RISING_GROWTH_RATIO) * 0.1).min(0.85);
    let estimated = stats.second_half_views as f64 / 1000.0 * BASELINE_RPM_USD * CAPTURE_RATE;
    Some(CandidateOpportunity {
        opportunity: NewOpportunity {
            opportunity_type: "rising_page".into(),
            title: format!("Catch monetization up on rising page {}", stats.page_url),
            description: format!(
                "Views grew {:.1}x across the window ({} to {}) while revenue stayed \
                 flat (${:.2} to ${:.2}).",
                growth,
                stats.first_half_views,
                stats.second_half_views,
                stats.first_half_revenue,
                stats.second_half_revenue
            ),
            priority: 7,
            confidence,
            estimated_revenue_impact: Some(round_cents(estimated)),
            page_url: Some(stats.page_url.clone()),
            subject_id: None,
            category: Some("placement".into()),
        },
        actions: vec![
            NewAction {
                action_type: "add_placement".into(),
                action_data: json!({ "page_url": stats.page_url, "slot": "inline_primary" }),
            },
            NewAction {
                action_type: "boost_internal_links".into(),
                action_data: json!({ "page_url": stats.page_url }),
            },
        ],
    })
}

/// Run every detector against one page's aggregates.
pub fn scan_page(stats: &PageWindowStats) -> Vec<CandidateOpportunity> {
    [
        detect_untapped_traffic(stats),
        detect_engaged_unconverted(stats),
        detect_rising_page(stats),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Scan the trailing window and queue every detector hit that clears the
/// confidence floor and is not already pending for the same page.
pub async fn run_opportunity_scan(
    db: &Database,
    cfg: &Settings,
    today: NaiveDate,
) -> Result<JobOutcome> {
    let since = today - chrono::Duration::days(cfg.scan_window_days);
    let midpoint = today - chrono::Duration::days(cfg.scan_window_days / 2);
    let stats = db.metrics_window_stats(since, midpoint).await?;

    let mut created = 0i64;
    let mut discarded = 0i64;
    let mut already_pending = 0i64;
    let mut errors = 0i64;

    for page_stats in &stats {
        for candidate in scan_page(page_stats) {
            if candidate.opportunity.confidence < cfg.confidence_floor {
                discarded += 1;
                continue;
            }
            let exists = db
                .pending_opportunity_exists(
                    &candidate.opportunity.opportunity_type,
                    &page_stats.page_url,
                )
                .await?;
            if exists {
                already_pending += 1;
                continue;
            }
            match db
                .create_opportunity(&candidate.opportunity, &candidate.actions)
                .await
            {
                Ok(_) => created += 1,
                Err(e) => {
                    errors += 1;
                    warn!(
                        page = %page_stats.page_url,
                        error = %e,
                        "failed to queue scanner opportunity"
                    );
                }
            }
        }
    }

    info!(
        pages = stats.len(),
        created, discarded, already_pending, "opportunity scan complete"
    );
    Ok(JobOutcome {
        items_processed: stats.len() as i64,
        opportunities_found: created,
        errors,
    })
}
