//! # RPM — Yield Analysis Job
//!
//! Computes revenue-per-mille (revenue / views x 1000) per page over the
//! trailing window and flags two shapes of underperformance: pages earning
//! far below the fleet's typical yield, and pages whose traffic spiked
//! without the yield following. Findings go through the same queue creation
//! path as the scanner.

use super::{round_cents, CandidateOpportunity, JobOutcome};
use crate::config::Settings;
use crate::db::{Database, NewAction, NewOpportunity, PageWindowStats};
use anyhow::Result;
use chrono::NaiveDate;
use serde_json::json;
use tracing::{info, warn};

/// Pages below this many window views carry too much noise to rank.
const MIN_VIEWS_FOR_YIELD: i64 = 500;
/// A low-percentile page is only flagged when it also earns under half the
/// fleet median, so a tightly-clustered fleet flags nothing.
const MEDIAN_GAP_RATIO: f64 = 0.5;

/// Revenue per mille page views. None when there is no traffic to divide by.
pub fn compute_rpm(revenue: f64, views: i64) -> Option<f64> {
    if views <= 0 {
        return None;
    }
    Some(revenue / views as f64 * 1000.0)
}

/// Nearest-rank percentile over a sorted slice. `p` in [0, 1].
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 1.0);
    let rank = (p * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}

#[derive(Clone, Debug)]
pub struct PageYield {
    pub page_url: String,
    pub rpm: f64,
    pub total_views: i64,
    pub total_revenue: f64,
    pub first_half_rpm: Option<f64>,
    pub second_half_rpm: Option<f64>,
    pub view_growth: Option<f64>,
}

fn to_yield(stats: &PageWindowStats) -> Option<PageYield> {
    if stats.total_views < MIN_VIEWS_FOR_YIELD {
        return None;
    }
    let rpm = compute_rpm(stats.total_revenue, stats.total_views)?;
    let view_growth = if stats.first_half_views > 0 {
        Some(stats.second_half_views as f64 / stats.first_half_views as f64)
    } else {
        None
    };
    Some(PageYield {
        page_url: stats.page_url.clone(),
        rpm,
        total_views: stats.total_views,
        total_revenue: stats.total_revenue,
        first_half_rpm: compute_rpm(stats.first_half_revenue, stats.first_half_views),
        second_half_rpm: compute_rpm(stats.second_half_revenue, stats.second_half_views),
        view_growth,
    })
}

fn low_yield_candidate(page: &PageYield, threshold: f64, median: f64) -> CandidateOpportunity {
    let gap = (median - page.rpm).max(0.0);
    let estimated = gap * page.total_views as f64 / 1000.0;
    let confidence = (0.5 + (median - page.rpm) / median.max(f64::EPSILON) * 0.35).min(0.9);
    CandidateOpportunity {
        opportunity: NewOpportunity {
            opportunity_type: "low_yield".into(),
            title: format!("Raise yield on underperforming page {}", page.page_url),
            description: format!(
                "RPM ${:.2} against a fleet median of ${:.2} (p-threshold ${:.2}) across \
                 {} views; placements here earn well below comparable pages.",
                page.rpm, median, threshold, page.total_views
            ),
            priority: 7,
            confidence,
            estimated_revenue_impact: Some(round_cents(estimated)),
            page_url: Some(page.page_url.clone()),
            subject_id: None,
            category: Some("yield".into()),
        },
        actions: vec![NewAction {
            action_type: "review_placements".into(),
            action_data: json!({
                "page_url": page.page_url,
                "current_rpm": round_cents(page.rpm),
                "fleet_median_rpm": round_cents(median),
            }),
        }],
    }
}

fn spike_candidate(page: &PageYield, growth: f64) -> CandidateOpportunity {
    let second_rpm = page.second_half_rpm.unwrap_or(0.0);
    let first_rpm = page.first_half_rpm.unwrap_or(0.0);
    CandidateOpportunity {
        opportunity: NewOpportunity {
            opportunity_type: "traffic_spike_yield_lag".into(),
            title: format!("Yield lagging a traffic spike on {}", page.page_url),
            description: format!(
                "Traffic grew {:.1}x in the recent half of the window while RPM moved \
                 from ${:.2} to ${:.2}; the new audience is not being monetized.",
                growth, first_rpm, second_rpm
            ),
            priority: 6,
            confidence: (0.45 + (growth - 1.0) * 0.08).min(0.85),
            estimated_revenue_impact: Some(round_cents(
                (first_rpm - second_rpm).max(0.5) * page.total_views as f64 / 1000.0,
            )),
            page_url: Some(page.page_url.clone()),
            subject_id: None,
            category: Some("yield".into()),
        },
        actions: vec![NewAction {
            action_type: "review_placements".into(),
            action_data: json!({ "page_url": page.page_url, "reason": "traffic_spike" }),
        }],
    }
}

/// Rank the fleet's yields and produce candidates for both detector shapes.
pub fn analyze_yields(
    stats: &[PageWindowStats],
    low_percentile: f64,
    spike_factor: f64,
) -> Vec<CandidateOpportunity> {
    let yields: Vec<PageYield> = stats.iter().filter_map(to_yield).collect();
    if yields.len() < 3 {
        // Percentiles over one or two pages flag noise, not signal.
        return Vec::new();
    }

    let mut rpms: Vec<f64> = yields.iter().map(|y| y.rpm).collect();
    rpms.sort_by(|a, b| a.total_cmp(b));
    let threshold = match percentile(&rpms, low_percentile) {
        Some(t) => t,
        None => return Vec::new(),
    };
    let median = match percentile(&rpms, 0.5) {
        Some(m) => m,
        None => return Vec::new(),
    };

    let mut candidates = Vec::new();
    for page in &yields {
        if page.rpm <= threshold && page.rpm < median * MEDIAN_GAP_RATIO {
            candidates.push(low_yield_candidate(page, threshold, median));
        }
        if let Some(growth) = page.view_growth {
            let yield_followed = match (page.first_half_rpm, page.second_half_rpm) {
                (Some(first), Some(second)) => second > first,
                _ => false,
            };
            if growth >= spike_factor && !yield_followed {
                candidates.push(spike_candidate(page, growth));
            }
        }
    }
    candidates
}

/// Aggregate the window, rank yields, and queue findings that clear the
/// confidence floor.
pub async fn run_rpm_analysis(
    db: &Database,
    cfg: &Settings,
    today: NaiveDate,
) -> Result<JobOutcome> {
    let since = today - chrono::Duration::days(cfg.scan_window_days);
    let midpoint = today - chrono::Duration::days(cfg.scan_window_days / 2);
    let stats = db.metrics_window_stats(since, midpoint).await?;
    let candidates = analyze_yields(&stats, cfg.rpm_low_percentile, cfg.rpm_spike_factor);

    let mut created = 0i64;
    let mut discarded = 0i64;
    let mut already_pending = 0i64;
    let mut errors = 0i64;

    for candidate in candidates {
        if candidate.opportunity.confidence < cfg.confidence_floor {
            discarded += 1;
            continue;
        }
        let page_url = candidate.opportunity.page_url.clone().unwrap_or_default();
        let exists = db
            .pending_opportunity_exists(&candidate.opportunity.opportunity_type, &page_url)
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
                warn!(page = %page_url, error = %e, "failed to queue yield opportunity");
            }
        }
    }

    info!(
        pages = stats.len(),
        created, discarded, already_pending, "rpm analysis complete"
    );
    Ok(JobOutcome {
        items_processed: stats.len() as i64,
        opportunities_found: created,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stats(page_url: &str, views: i64, revenue: f64) -> PageWindowStats {
        PageWindowStats {
            page_url: page_url.to_string(),
            days_with_data: 30,
            total_views: views,
            total_clicks: views / 100,
            total_revenue: revenue,
            avg_session_secs: 60.0,
            first_half_views: views / 2,
            second_half_views: views - views / 2,
            first_half_revenue: revenue / 2.0,
            second_half_revenue: revenue - revenue / 2.0,
        }
    }

    #[test]
    fn compute_rpm_divides_per_mille() {
        let rpm = compute_rpm(25.0, 5_000).unwrap();
        assert!((rpm - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn compute_rpm_refuses_zero_views() {
        assert!(compute_rpm(25.0, 0).is_none());
        assert!(compute_rpm(25.0, -5).is_none());
    }

    #[test]
    fn percentile_nearest_rank() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        assert_eq!(percentile(&values, 0.25), Some(2.0));
        assert_eq!(percentile(&values, 0.5), Some(4.0));
        assert_eq!(percentile(&values, 1.0), Some(8.0));
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn analyze_flags_the_clearly_starved_page() {
        // Nine healthy pages around $10 RPM, one at $0.50.
        let mut fleet: Vec<PageWindowStats> = (0..9)
            .map(|i| make_stats(&format!("/healthy/{}", i), 10_000, 100.0 + i as f64))
            .collect();
        fleet.push(make_stats("/starved", 10_000, 5.0));

        let candidates = analyze_yields(&fleet, 0.25, 100.0);
        let low: Vec<_> = candidates
            .iter()
            .filter(|c| c.opportunity.opportunity_type == "low_yield")
            .collect();
        assert_eq!(low.len(), 1, "only the starved page should be flagged");
        assert_eq!(low[0].opportunity.page_url.as_deref(), Some("/starved"));
    }

    #[test]
    fn analyze_stays_quiet_on_a_uniform_fleet() {
        let fleet: Vec<PageWindowStats> = (0..10)
            .map(|i| make_stats(&format!("/page/{}", i), 10_000, 100.0))
            .collect();
        let candidates = analyze_yields(&fleet, 0.25, 100.0);
        assert!(
            candidates.is_empty(),
            "uniform yields must not be flagged, got {}",
            candidates.len()
        );
    }

    #[test]
    fn analyze_flags_spike_with_lagging_yield() {
        let mut fleet: Vec<PageWindowStats> = (0..5)
            .map(|i| make_stats(&format!("/page/{}", i), 10_000, 100.0))
            .collect();
        // Views tripled in the second half, revenue did not move.
        fleet.push(PageWindowStats {
            first_half_views: 1_000,
            second_half_views: 3_000,
            first_half_revenue: 20.0,
            second_half_revenue: 20.0,
            ..make_stats("/spiking", 4_000, 40.0)
        });

        let candidates = analyze_yields(&fleet, 0.25, 2.0);
        let spikes: Vec<_> = candidates
            .iter()
            .filter(|c| c.opportunity.opportunity_type == "traffic_spike_yield_lag")
            .collect();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].opportunity.page_url.as_deref(), Some("/spiking"));
    }

    #[test]
    fn analyze_needs_a_minimum_fleet() {
        let fleet = vec![make_stats("/only", 10_000, 1.0)];
        assert!(analyze_yields(&fleet, 0.25, 2.0).is_empty());
    }

    #[test]
    fn tiny_pages_are_excluded_from_ranking() {
        let mut fleet: Vec<PageWindowStats> = (0..5)
            .map(|i| make_stats(&format!("/page/{}", i), 10_000, 100.0))
            .collect();
        fleet.push(make_stats("/tiny", 50, 0.0));
        let candidates = analyze_yields(&fleet, 0.25, 100.0);
        assert!(
            !candidates
                .iter()
                .any(|c| c.opportunity.page_url.as_deref() == Some("/tiny")),
            "pages under the view floor must not be ranked"
        );
    }
}
