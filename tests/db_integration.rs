//! Database integration tests.
//!
//! All tests require TEST_DATABASE_URL to be set.
//! Run with: TEST_DATABASE_URL=postgres://... cargo test --test db_integration
//!
//! Tests should be run single-threaded to avoid conflicts:
//!   cargo test --test db_integration -- --test-threads=1

mod common;

use chrono::NaiveDate;
use serde_json::json;
use tollgate::db::{Database, MetricUpsert, NewAction, NewOpportunity, QueueError, RunHistoryFilter};

/// Skip the test if TEST_DATABASE_URL is not set.
macro_rules! require_db {
    () => {
        if !common::has_test_db() {
            eprintln!("Skipping: TEST_DATABASE_URL not set");
            return;
        }
    };
}

async fn setup() -> Database {
    common::setup_test_db().await
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn make_opportunity(priority: i32, confidence: f64) -> NewOpportunity {
    NewOpportunity {
        opportunity_type: "untapped_traffic".into(),
        title: format!("Monetize page (priority {})", priority),
        description: "High traffic, no earnings".into(),
        priority,
        confidence,
        estimated_revenue_impact: Some(50.0),
        page_url: Some(format!("/guides/p{}-c{}", priority, (confidence * 100.0) as i64)),
        subject_id: None,
        category: Some("placement".into()),
    }
}

fn make_actions(n: usize) -> Vec<NewAction> {
    (0..n)
        .map(|i| NewAction {
            action_type: "add_affiliate_links".into(),
            action_data: json!({ "slot": i }),
        })
        .collect()
}

// --- Queue state machine ---

#[tokio::test]
async fn connect_to_test_db() {
    require_db!();
    let _db = setup().await;
    // If we get here without panic, connection succeeded
}

#[tokio::test]
async fn create_opportunity_starts_everything_pending() {
    require_db!();
    let db = setup().await;

    let created = db
        .create_opportunity(&make_opportunity(8, 0.9), &make_actions(2))
        .await
        .unwrap();

    assert_eq!(created.opportunity.status, "pending");
    assert_eq!(created.opportunity.priority, 8);
    assert_eq!(created.actions.len(), 2);
    assert!(created.actions.iter().all(|a| a.status == "pending"));
    assert!(created.actions.iter().all(|a| a.executed_at.is_none()));
}

#[tokio::test]
async fn create_opportunity_requires_at_least_one_action() {
    require_db!();
    let db = setup().await;

    let err = db
        .create_opportunity(&make_opportunity(5, 0.7), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::EmptyActions));
}

#[tokio::test]
async fn pending_queue_orders_by_priority_confidence_then_age() {
    require_db!();
    let db = setup().await;

    // Inserted deliberately out of review order.
    db.create_opportunity(&make_opportunity(3, 0.9), &make_actions(1))
        .await
        .unwrap();
    db.create_opportunity(&make_opportunity(9, 0.5), &make_actions(1))
        .await
        .unwrap();
    db.create_opportunity(&make_opportunity(9, 0.8), &make_actions(1))
        .await
        .unwrap();

    let pending = db.get_pending_opportunities(10).await.unwrap();
    let order: Vec<(i32, f64)> = pending.iter().map(|o| (o.priority, o.confidence)).collect();
    assert_eq!(
        order,
        vec![(9, 0.8), (9, 0.5), (3, 0.9)],
        "priority wins, confidence breaks priority ties"
    );
}

#[tokio::test]
async fn pending_queue_breaks_full_ties_by_age() {
    require_db!();
    let db = setup().await;

    let mut first = make_opportunity(7, 0.6);
    first.page_url = Some("/guides/older".into());
    let mut second = make_opportunity(7, 0.6);
    second.page_url = Some("/guides/newer".into());

    let older = db.create_opportunity(&first, &make_actions(1)).await.unwrap();
    db.create_opportunity(&second, &make_actions(1)).await.unwrap();

    let pending = db.get_pending_opportunities(10).await.unwrap();
    assert_eq!(pending[0].id, older.opportunity.id, "oldest first on a full tie");
}

#[tokio::test]
async fn approve_cascades_to_every_pending_action() {
    require_db!();
    let db = setup().await;

    let created = db
        .create_opportunity(&make_opportunity(6, 0.8), &make_actions(3))
        .await
        .unwrap();

    let approved = db
        .approve_opportunity(created.opportunity.id, "reviewer@site")
        .await
        .unwrap();

    assert_eq!(approved.opportunity.status, "approved");
    assert_eq!(approved.opportunity.reviewed_by.as_deref(), Some("reviewer@site"));
    assert!(approved.opportunity.reviewed_at.is_some());
    assert_eq!(approved.actions.len(), 3);
    assert!(approved.actions.iter().all(|a| a.status == "approved"));
}

#[tokio::test]
async fn approve_is_single_shot() {
    require_db!();
    let db = setup().await;

    let created = db
        .create_opportunity(&make_opportunity(6, 0.8), &make_actions(1))
        .await
        .unwrap();
    db.approve_opportunity(created.opportunity.id, "first").await.unwrap();

    let err = db
        .approve_opportunity(created.opportunity.id, "second")
        .await
        .unwrap_err();
    match err {
        QueueError::InvalidState { current, expected, .. } => {
            assert_eq!(current, "approved");
            assert_eq!(expected, "pending");
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }
}

#[tokio::test]
async fn reject_stores_reason_and_cascades() {
    require_db!();
    let db = setup().await;

    let created = db
        .create_opportunity(&make_opportunity(4, 0.6), &make_actions(2))
        .await
        .unwrap();

    let rejected = db
        .reject_opportunity(created.opportunity.id, "reviewer@site", Some("seasonal noise"))
        .await
        .unwrap();

    assert_eq!(rejected.opportunity.status, "rejected");
    assert_eq!(
        rejected.opportunity.rejection_reason.as_deref(),
        Some("seasonal noise")
    );
    assert!(rejected.actions.iter().all(|a| a.status == "rejected"));

    // A rejected opportunity cannot then be approved.
    let err = db
        .approve_opportunity(created.opportunity.id, "reviewer@site")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidState { .. }));
}

#[tokio::test]
async fn resolving_missing_opportunity_reports_not_found() {
    require_db!();
    let db = setup().await;

    let err = db.approve_opportunity(999_999, "reviewer").await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(999_999)));
}

#[tokio::test]
async fn expire_touches_only_stale_pending_rows() {
    require_db!();
    let db = setup().await;

    let stale = db
        .create_opportunity(&make_opportunity(5, 0.7), &make_actions(1))
        .await
        .unwrap();
    let fresh = db
        .create_opportunity(&make_opportunity(6, 0.7), &make_actions(1))
        .await
        .unwrap();

    sqlx::query("UPDATE opportunities SET created_at = now() - interval '40 days' WHERE id = $1")
        .bind(stale.opportunity.id)
        .execute(db.pool())
        .await
        .unwrap();

    assert_eq!(db.expire_old_opportunities(30).await.unwrap(), 1);
    assert_eq!(
        db.expire_old_opportunities(30).await.unwrap(),
        0,
        "a second sweep finds nothing left to expire"
    );

    let stale_now = db.get_opportunity(stale.opportunity.id).await.unwrap();
    assert_eq!(stale_now.opportunity.status, "expired");
    assert_eq!(
        stale_now.actions[0].status, "pending",
        "expiry does not cascade to actions"
    );
    let fresh_now = db.get_opportunity(fresh.opportunity.id).await.unwrap();
    assert_eq!(fresh_now.opportunity.status, "pending");
}

#[tokio::test]
async fn queue_stats_counts_statuses_and_pending_impact() {
    require_db!();
    let db = setup().await;

    let mut a = make_opportunity(8, 0.9);
    a.estimated_revenue_impact = Some(100.0);
    let mut b = make_opportunity(7, 0.8);
    b.estimated_revenue_impact = Some(40.5);
    let mut c = make_opportunity(6, 0.7);
    c.estimated_revenue_impact = None;

    db.create_opportunity(&a, &make_actions(1)).await.unwrap();
    let to_reject = db.create_opportunity(&b, &make_actions(1)).await.unwrap();
    db.create_opportunity(&c, &make_actions(1)).await.unwrap();
    db.reject_opportunity(to_reject.opportunity.id, "reviewer", None)
        .await
        .unwrap();

    let stats = db.get_queue_stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.total, 3);
    assert!(
        (stats.pending_revenue_impact - 100.0).abs() < 1e-9,
        "NULL impacts count as zero, resolved rows are excluded: {}",
        stats.pending_revenue_impact
    );
}

#[tokio::test]
async fn mark_action_executed_only_after_approval() {
    require_db!();
    let db = setup().await;

    let created = db
        .create_opportunity(&make_opportunity(6, 0.8), &make_actions(1))
        .await
        .unwrap();
    let action_id = created.actions[0].id;

    let err = db.mark_action_executed(action_id).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidActionState { .. }));

    db.approve_opportunity(created.opportunity.id, "reviewer").await.unwrap();
    let executed = db.mark_action_executed(action_id).await.unwrap();
    assert_eq!(executed.status, "executed");
    assert!(executed.executed_at.is_some());

    let err = db.mark_action_executed(action_id).await.unwrap_err();
    assert!(
        matches!(err, QueueError::InvalidActionState { .. }),
        "executing twice is refused"
    );
}

#[tokio::test]
async fn mark_opportunity_implemented_only_from_approved() {
    require_db!();
    let db = setup().await;

    let created = db
        .create_opportunity(&make_opportunity(6, 0.8), &make_actions(1))
        .await
        .unwrap();

    let err = db
        .mark_opportunity_implemented(created.opportunity.id)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidState { .. }));

    db.approve_opportunity(created.opportunity.id, "reviewer").await.unwrap();
    let implemented = db
        .mark_opportunity_implemented(created.opportunity.id)
        .await
        .unwrap();
    assert_eq!(implemented.status, "implemented");
}

#[tokio::test]
async fn pending_opportunity_exists_matches_type_and_page() {
    require_db!();
    let db = setup().await;

    let mut new = make_opportunity(7, 0.8);
    new.page_url = Some("/guides/espresso".into());
    let created = db.create_opportunity(&new, &make_actions(1)).await.unwrap();

    assert!(db
        .pending_opportunity_exists("untapped_traffic", "/guides/espresso")
        .await
        .unwrap());
    assert!(!db
        .pending_opportunity_exists("low_yield_page", "/guides/espresso")
        .await
        .unwrap());
    assert!(!db
        .pending_opportunity_exists("untapped_traffic", "/guides/grinders")
        .await
        .unwrap());

    // Resolving the opportunity clears the way for a fresh detection.
    db.reject_opportunity(created.opportunity.id, "reviewer", None)
        .await
        .unwrap();
    assert!(!db
        .pending_opportunity_exists("untapped_traffic", "/guides/espresso")
        .await
        .unwrap());
}

// --- Agent run audit trail ---

#[tokio::test]
async fn run_lifecycle_create_then_complete() {
    require_db!();
    let db = setup().await;

    let run = db.create_agent_run("metrics_sync").await.unwrap();
    assert_eq!(run.status, "running");
    assert!(run.completed_at.is_none());

    let done = db
        .complete_agent_run(run.id, 42, 3, 1, "synced 42 rows")
        .await
        .unwrap();
    assert_eq!(done.status, "completed");
    assert_eq!(done.items_processed, 42);
    assert_eq!(done.opportunities_found, 3);
    assert_eq!(done.errors_encountered, 1);
    assert_eq!(done.log_summary.as_deref(), Some("synced 42 rows"));
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn failed_run_stores_error_details() {
    require_db!();
    let db = setup().await;

    let run = db.create_agent_run("forecast").await.unwrap();
    let details = json!({ "message": "no history", "chain": [] });
    let failed = db
        .fail_agent_run(run.id, 0, 0, 1, "job failed", &details)
        .await
        .unwrap();

    assert_eq!(failed.status, "failed");
    assert_eq!(failed.error_details, Some(details));
}

#[tokio::test]
async fn finalizing_twice_is_refused() {
    require_db!();
    let db = setup().await;

    let run = db.create_agent_run("cleanup").await.unwrap();
    db.complete_agent_run(run.id, 1, 0, 0, "done").await.unwrap();

    assert!(db.complete_agent_run(run.id, 9, 9, 9, "again").await.is_err());
    assert!(db
        .fail_agent_run(run.id, 0, 0, 1, "late failure", &json!({}))
        .await
        .is_err());

    let row = db.get_agent_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.items_processed, 1, "first finalization is preserved");
}

#[tokio::test]
async fn run_history_filters_by_type_and_pages() {
    require_db!();
    let db = setup().await;

    for _ in 0..3 {
        let run = db.create_agent_run("full").await.unwrap();
        db.complete_agent_run(run.id, 10, 0, 0, "ok").await.unwrap();
    }
    for _ in 0..2 {
        let run = db.create_agent_run("metrics_sync").await.unwrap();
        db.complete_agent_run(run.id, 5, 0, 0, "ok").await.unwrap();
    }

    let filter = RunHistoryFilter {
        run_type: Some("full".into()),
        limit: Some(2),
        ..Default::default()
    };
    let page0 = db.get_run_history(&filter).await.unwrap();
    assert_eq!(page0.total, 3);
    assert_eq!(page0.runs.len(), 2);
    assert!(page0.runs.iter().all(|r| r.run_type == "full"));

    let filter = RunHistoryFilter {
        run_type: Some("full".into()),
        limit: Some(2),
        page: Some(1),
        ..Default::default()
    };
    let page1 = db.get_run_history(&filter).await.unwrap();
    assert_eq!(page1.runs.len(), 1, "second page holds the remainder");
    assert_eq!(page1.page, 1);
}

#[tokio::test]
async fn aggregates_success_rate_counts_only_finished_runs() {
    require_db!();
    let db = setup().await;

    for _ in 0..2 {
        let run = db.create_agent_run("opportunity_scan").await.unwrap();
        db.complete_agent_run(run.id, 10, 2, 0, "ok").await.unwrap();
    }
    let failed = db.create_agent_run("opportunity_scan").await.unwrap();
    db.fail_agent_run(failed.id, 0, 0, 1, "boom", &json!({}))
        .await
        .unwrap();
    db.create_agent_run("opportunity_scan").await.unwrap(); // still running

    let agg = db
        .get_run_aggregates(&RunHistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(agg.total_runs, 4);
    assert_eq!(agg.completed, 2);
    assert_eq!(agg.failed, 1);
    assert!(
        (agg.success_rate - 200.0 / 3.0).abs() < 0.01,
        "running rows stay out of the success rate: {}",
        agg.success_rate
    );
    assert_eq!(agg.by_type.len(), 1);
    assert_eq!(agg.by_type[0].opportunities_found, 4);
}

#[tokio::test]
async fn latest_run_of_type_ignores_status() {
    require_db!();
    let db = setup().await;

    let older = db.create_agent_run("full").await.unwrap();
    db.complete_agent_run(older.id, 1, 0, 0, "ok").await.unwrap();
    sqlx::query("UPDATE agent_runs SET started_at = started_at - interval '1 hour' WHERE id = $1")
        .bind(older.id)
        .execute(db.pool())
        .await
        .unwrap();
    let newer = db.create_agent_run("full").await.unwrap();

    let latest = db.latest_run_of_type("full").await.unwrap().unwrap();
    assert_eq!(latest.id, newer.id);
    assert_eq!(latest.status, "running", "a running row still counts as latest");
    assert!(db.latest_run_of_type("report").await.unwrap().is_none());
}

#[tokio::test]
async fn prune_old_runs_spares_running_rows() {
    require_db!();
    let db = setup().await;

    let old_done = db.create_agent_run("cleanup").await.unwrap();
    db.complete_agent_run(old_done.id, 1, 0, 0, "ok").await.unwrap();
    let old_running = db.create_agent_run("cleanup").await.unwrap();
    let recent = db.create_agent_run("cleanup").await.unwrap();
    db.complete_agent_run(recent.id, 1, 0, 0, "ok").await.unwrap();

    sqlx::query("UPDATE agent_runs SET started_at = now() - interval '120 days' WHERE id = ANY($1)")
        .bind(vec![old_done.id, old_running.id])
        .execute(db.pool())
        .await
        .unwrap();

    assert_eq!(db.prune_old_runs(90).await.unwrap(), 1);
    assert!(db.get_agent_run(old_done.id).await.unwrap().is_none());
    assert!(
        db.get_agent_run(old_running.id).await.unwrap().is_some(),
        "running rows survive retention no matter their age"
    );
    assert!(db.get_agent_run(recent.id).await.unwrap().is_some());
}

// --- Metric snapshots ---

fn make_metric(date: NaiveDate, url: &str, views: i64, revenue: f64) -> MetricUpsert {
    MetricUpsert {
        metric_date: date,
        page_url: url.into(),
        page_views: views,
        unique_visitors: views * 7 / 10,
        clicks: views / 50,
        revenue,
        avg_session_secs: 80.0,
    }
}

#[tokio::test]
async fn upsert_page_metric_overwrites_in_place() {
    require_db!();
    let db = setup().await;
    let day = d(2025, 6, 15);

    db.upsert_page_metric(&make_metric(day, "/guides/espresso", 1000, 10.0))
        .await
        .unwrap();
    db.upsert_page_metric(&make_metric(day, "/guides/espresso", 1200, 14.5))
        .await
        .unwrap();

    assert_eq!(db.count_metrics_for_date(day).await.unwrap(), 1);
    let total = db
        .monthly_revenue_total(d(2025, 6, 1), d(2025, 7, 1))
        .await
        .unwrap();
    assert!((total - 14.5).abs() < 1e-9, "re-sync replaced the snapshot: {}", total);
}

#[tokio::test]
async fn window_stats_split_around_midpoint() {
    require_db!();
    let db = setup().await;

    for (day, views, revenue) in [
        (d(2025, 6, 1), 100, 1.0),
        (d(2025, 6, 2), 200, 2.0),
        (d(2025, 6, 3), 300, 3.0),
        (d(2025, 6, 4), 400, 4.0),
    ] {
        db.upsert_page_metric(&make_metric(day, "/guides/espresso", views, revenue))
            .await
            .unwrap();
    }

    let stats = db
        .metrics_window_stats(d(2025, 6, 1), d(2025, 6, 3))
        .await
        .unwrap();
    assert_eq!(stats.len(), 1);
    let page = &stats[0];
    assert_eq!(page.days_with_data, 4);
    assert_eq!(page.total_views, 1000);
    assert_eq!(page.first_half_views, 300, "days before the midpoint");
    assert_eq!(page.second_half_views, 700, "midpoint day belongs to the second half");
    assert!((page.first_half_revenue - 3.0).abs() < 1e-9);
    assert!((page.second_half_revenue - 7.0).abs() < 1e-9);
}

#[tokio::test]
async fn window_stats_order_busiest_pages_first() {
    require_db!();
    let db = setup().await;

    db.upsert_page_metric(&make_metric(d(2025, 6, 1), "/quiet", 50, 0.5))
        .await
        .unwrap();
    db.upsert_page_metric(&make_metric(d(2025, 6, 1), "/busy", 5000, 50.0))
        .await
        .unwrap();

    let stats = db
        .metrics_window_stats(d(2025, 6, 1), d(2025, 6, 1))
        .await
        .unwrap();
    assert_eq!(stats[0].page_url, "/busy");
    assert_eq!(stats[1].page_url, "/quiet");
}

#[tokio::test]
async fn monthly_history_groups_by_month_oldest_first() {
    require_db!();
    let db = setup().await;

    db.upsert_page_metric(&make_metric(d(2025, 4, 10), "/a", 100, 10.0))
        .await
        .unwrap();
    db.upsert_page_metric(&make_metric(d(2025, 4, 20), "/b", 100, 15.0))
        .await
        .unwrap();
    db.upsert_page_metric(&make_metric(d(2025, 5, 5), "/a", 300, 30.0))
        .await
        .unwrap();

    let history = db.monthly_revenue_history(d(2025, 1, 1)).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].month, d(2025, 4, 1));
    assert!((history[0].revenue - 25.0).abs() < 1e-9);
    assert_eq!(history[1].month, d(2025, 5, 1));
    assert_eq!(history[1].page_views, 300);
}

#[tokio::test]
async fn month_has_metrics_distinguishes_empty_months() {
    require_db!();
    let db = setup().await;

    db.upsert_page_metric(&make_metric(d(2025, 6, 15), "/a", 100, 5.0))
        .await
        .unwrap();

    assert!(db.month_has_metrics(d(2025, 6, 1), d(2025, 7, 1)).await.unwrap());
    assert!(!db.month_has_metrics(d(2025, 5, 1), d(2025, 6, 1)).await.unwrap());
}

#[tokio::test]
async fn prune_old_metrics_drops_only_stale_rows() {
    require_db!();
    let db = setup().await;
    let today = chrono::Utc::now().date_naive();

    db.upsert_page_metric(&make_metric(today - chrono::Duration::days(100), "/old", 100, 1.0))
        .await
        .unwrap();
    db.upsert_page_metric(&make_metric(today, "/new", 100, 1.0))
        .await
        .unwrap();

    assert_eq!(db.prune_old_metrics(30).await.unwrap(), 1);
    assert_eq!(db.count_metrics_for_date(today).await.unwrap(), 1);
}

// --- Revenue forecasts ---

#[tokio::test]
async fn forecast_upsert_then_lock_with_actuals() {
    require_db!();
    let db = setup().await;
    let month = d(2025, 7, 1);

    assert!(db.upsert_forecast(month, 1500.0, 0.6, 0.05).await.unwrap());
    assert!(
        db.upsert_forecast(month, 1600.0, 0.65, 0.06).await.unwrap(),
        "regeneration may revise a month with no actuals"
    );

    assert_eq!(db.set_actual_revenue(month, 1234.56).await.unwrap(), 1);
    assert!(
        !db.upsert_forecast(month, 9999.0, 0.9, 0.5).await.unwrap(),
        "a reconciled month is locked against regeneration"
    );
    assert_eq!(
        db.set_actual_revenue(month, 0.01).await.unwrap(),
        0,
        "actuals are write-once"
    );

    let row = db.get_forecast(month).await.unwrap().unwrap();
    assert!((row.forecasted_total_revenue - 1600.0).abs() < 1e-9);
    assert_eq!(row.actual_total_revenue, Some(1234.56));
}

#[tokio::test]
async fn unreconciled_months_lists_only_past_gaps() {
    require_db!();
    let db = setup().await;

    db.upsert_forecast(d(2025, 1, 1), 1000.0, 0.6, 0.0).await.unwrap();
    db.upsert_forecast(d(2025, 2, 1), 1100.0, 0.6, 0.1).await.unwrap();
    db.upsert_forecast(d(2025, 9, 1), 1200.0, 0.5, 0.1).await.unwrap();
    db.set_actual_revenue(d(2025, 1, 1), 990.0).await.unwrap();

    let gaps = db.unreconciled_months(d(2025, 8, 1)).await.unwrap();
    let months: Vec<NaiveDate> = gaps.iter().map(|f| f.forecast_month).collect();
    assert_eq!(
        months,
        vec![d(2025, 2, 1)],
        "future months and reconciled months are excluded"
    );
}

#[tokio::test]
async fn list_forecasts_newest_month_first() {
    require_db!();
    let db = setup().await;

    db.upsert_forecast(d(2025, 7, 1), 1000.0, 0.6, 0.0).await.unwrap();
    db.upsert_forecast(d(2025, 9, 1), 1200.0, 0.5, 0.1).await.unwrap();
    db.upsert_forecast(d(2025, 8, 1), 1100.0, 0.55, 0.1).await.unwrap();

    let rows = db.list_forecasts(10).await.unwrap();
    let months: Vec<NaiveDate> = rows.iter().map(|f| f.forecast_month).collect();
    assert_eq!(months, vec![d(2025, 9, 1), d(2025, 8, 1), d(2025, 7, 1)]);

    let with_actuals = db.forecasts_with_actuals().await.unwrap();
    assert!(with_actuals.is_empty());
}
