//! # Prometheus Metrics — Exposition for Scraping
//!
//! Exposes tollgate operational metrics in the Prometheus text exposition
//! format for scraping by Prometheus, Grafana Agent, or any
//! OpenMetrics-compatible collector.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tollgate_agent_runs_total` | Counter | `run_type`, `status` | Finalized agent runs |
//! | `tollgate_opportunities_created_total` | Counter | — | Opportunities queued by detector jobs |
//! | `tollgate_queue_opportunities` | Gauge | `status` | Opportunities currently in each queue state |
//! | `tollgate_queue_pending_revenue_impact` | Gauge | — | Estimated revenue impact across pending opportunities |
//! | `tollgate_http_requests_total` | Counter | `method`, `path`, `status` | HTTP requests served |
//! | `tollgate_http_request_duration_seconds` | Histogram | `method`, `path` | HTTP request latency |
//!
//! ## Integration
//!
//! Run and opportunity counters are bumped when the serve loop or the trigger
//! endpoint finalizes a run; queue gauges are refreshed from the dashboard's
//! background loop. The `/metrics` endpoint renders the current registry
//! state on each scrape.
//!
//! ## References
//!
//! - [OpenMetrics specification](https://openmetrics.io/)
//! - [Prometheus exposition format](https://prometheus.io/docs/instrumenting/exposition_formats/)

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

use crate::db::QueueStats;

/// Label set for finalized runs.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct RunLabel {
    pub run_type: String,
    pub status: String,
}

/// Label set for queue state gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct QueueStateLabel {
    pub status: String,
}

/// Label set for the HTTP request counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
    pub status: String,
}

/// Label set for the HTTP latency histogram. Status is left off to keep
/// histogram cardinality at one series per route.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpPathLabel {
    pub method: String,
    pub path: String,
}

/// Thread-safe metrics registry for the tollgate pipeline.
///
/// All fields use atomic types and are safe to update from any thread or
/// async task. The `Family` type creates per-label-set instances on first use.
pub struct Metrics {
    pub registry: Registry,
    pub agent_runs: Family<RunLabel, Counter>,
    pub opportunities_created: Counter,
    pub queue_opportunities: Family<QueueStateLabel, Gauge>,
    pub queue_pending_revenue_impact: Gauge<f64, AtomicU64>,
    pub http_requests: Family<HttpLabel, Counter>,
    pub http_request_duration: Family<HttpPathLabel, Histogram>,
}

impl Metrics {
    /// Create a new metrics registry with all tollgate metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let agent_runs = Family::<RunLabel, Counter>::default();
        registry.register(
            "tollgate_agent_runs",
            "Finalized agent runs by type and status",
            agent_runs.clone(),
        );

        let opportunities_created = Counter::default();
        registry.register(
            "tollgate_opportunities_created",
            "Opportunities queued by detector jobs",
            opportunities_created.clone(),
        );

        let queue_opportunities = Family::<QueueStateLabel, Gauge>::default();
        registry.register(
            "tollgate_queue_opportunities",
            "Opportunities currently in each queue state",
            queue_opportunities.clone(),
        );

        let queue_pending_revenue_impact = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "tollgate_queue_pending_revenue_impact",
            "Estimated revenue impact summed over pending opportunities",
            queue_pending_revenue_impact.clone(),
        );

        let http_requests = Family::<HttpLabel, Counter>::default();
        registry.register(
            "tollgate_http_requests",
            "HTTP requests served by method, path, and status",
            http_requests.clone(),
        );

        let http_request_duration = Family::<HttpPathLabel, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 12))
        });
        registry.register(
            "tollgate_http_request_duration_seconds",
            "HTTP request latency by method and path",
            http_request_duration.clone(),
        );

        Self {
            registry,
            agent_runs,
            opportunities_created,
            queue_opportunities,
            queue_pending_revenue_impact,
            http_requests,
            http_request_duration,
        }
    }

    /// Record a finalized run and any opportunities it queued.
    pub fn record_run(&self, run_type: &str, status: &str, opportunities_found: i64) {
        self.agent_runs
            .get_or_create(&RunLabel {
                run_type: run_type.to_string(),
                status: status.to_string(),
            })
            .inc();
        if opportunities_found > 0 {
            self.opportunities_created.inc_by(opportunities_found as u64);
        }
    }

    /// Refresh the queue gauges from a stats snapshot.
    pub fn set_queue_stats(&self, stats: &QueueStats) {
        let states = [
            ("pending", stats.pending),
            ("approved", stats.approved),
            ("rejected", stats.rejected),
            ("expired", stats.expired),
            ("implemented", stats.implemented),
        ];
        for (status, count) in states {
            self.queue_opportunities
                .get_or_create(&QueueStateLabel {
                    status: status.to_string(),
                })
                .set(count);
        }
        self.queue_pending_revenue_impact
            .set(stats.pending_revenue_impact);
    }

    /// Record one served HTTP request.
    pub fn record_http(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        self.http_requests
            .get_or_create(&HttpLabel {
                method: method.to_string(),
                path: path.to_string(),
                status: status.to_string(),
            })
            .inc();
        self.http_request_duration
            .get_or_create(&HttpPathLabel {
                method: method.to_string(),
                path: path.to_string(),
            })
            .observe(duration_secs);
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("encoding metrics should not fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> QueueStats {
        QueueStats {
            pending: 4,
            approved: 2,
            rejected: 1,
            expired: 0,
            implemented: 3,
            total: 10,
            pending_revenue_impact: 512.75,
        }
    }

    #[test]
    fn metrics_encode_returns_valid_text() {
        let m = Metrics::new();
        m.record_run("metrics_sync", "completed", 0);
        m.record_run("opportunity_scan", "completed", 3);
        m.set_queue_stats(&stats());

        let output = m.encode();
        assert!(output.contains("tollgate_agent_runs"));
        assert!(output.contains("metrics_sync"));
        assert!(output.contains("tollgate_queue_opportunities"));
        assert!(output.contains("tollgate_queue_pending_revenue_impact"));
    }

    #[test]
    fn opportunities_counter_accumulates_across_runs() {
        let m = Metrics::new();
        m.record_run("opportunity_scan", "completed", 3);
        m.record_run("rpm_analysis", "completed", 2);
        assert_eq!(m.opportunities_created.get(), 5);
    }

    #[test]
    fn per_run_type_counters_independent() {
        let m = Metrics::new();
        m.record_run("forecast", "completed", 0);
        m.record_run("forecast", "failed", 0);
        m.record_run("cleanup", "completed", 0);

        let output = m.encode();
        assert!(output.contains("forecast"));
        assert!(output.contains("cleanup"));
        assert!(output.contains("failed"));
    }

    #[test]
    fn http_metrics_record_without_panicking() {
        let m = Metrics::new();
        m.record_http("GET", "/api/queue/pending", 200, 0.012);
        m.record_http("POST", "/api/queue/{id}/approve", 409, 0.004);
        let output = m.encode();
        assert!(output.contains("tollgate_http_requests"));
        assert!(output.contains("tollgate_http_request_duration_seconds"));
    }
}
