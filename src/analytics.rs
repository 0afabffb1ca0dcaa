//! # Analytics — External Metrics Source
//!
//! The pipeline's one external read dependency: dated, per-page numeric
//! snapshots. Jobs depend on the [`MetricsSource`] trait so tests can swap in
//! a canned source; production uses [`HttpMetricsSource`] backed by reqwest
//! with request timeouts and an explicit [`TokenBucket`] pacing calls against
//! the provider's rate limit. The bucket is owned by the caller and passed
//! in, so rate state is visible and shareable rather than hidden in a
//! module-level counter.

use crate::config::Settings;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

/// One page's metrics for one day, as the source reports them.
#[derive(Clone, Debug, Deserialize)]
pub struct PageDayMetrics {
    pub url: String,
    #[serde(default)]
    pub page_views: i64,
    #[serde(default)]
    pub unique_visitors: i64,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub revenue_usd: f64,
    #[serde(default)]
    pub avg_session_secs: f64,
}

#[derive(Debug, Deserialize)]
struct PageMetricsResponse {
    pages: Vec<PageDayMetrics>,
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch every page's snapshot for one date.
    async fn fetch_page_metrics(&self, date: NaiveDate) -> Result<Vec<PageDayMetrics>>;
}

// ── Token bucket ────────────────────────────────────────────────

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: starts full at `capacity`, refills one token every
/// `refill_every`. `acquire` sleeps until a token is available, so a burst of
/// `capacity` requests passes immediately and sustained traffic settles at
/// the refill rate.
pub struct TokenBucket {
    capacity: f64,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1) as f64;
        TokenBucket {
            capacity,
            refill_every: refill_every.max(Duration::from_millis(1)),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        let earned = elapsed.as_secs_f64() / self.refill_every.as_secs_f64();
        if earned > 0.0 {
            state.tokens = (state.tokens + earned).min(self.capacity);
            state.last_refill = Instant::now();
        }
    }

    /// Take one token without waiting. Returns false when the bucket is dry.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, sleeping until one becomes available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                self.refill_every.mul_f64(1.0 - state.tokens)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// ── HTTP source ─────────────────────────────────────────────────

pub struct HttpMetricsSource {
    base_url: Url,
    api_key: Option<String>,
    client: reqwest::Client,
    bucket: Arc<TokenBucket>,
}

impl HttpMetricsSource {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        bucket: Arc<TokenBucket>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid analytics base URL")?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .context("failed to build analytics HTTP client")?;
        Ok(HttpMetricsSource {
            base_url,
            api_key,
            client,
            bucket,
        })
    }

    /// Build the production source plus its bucket from settings.
    pub fn from_settings(cfg: &Settings) -> Result<Self> {
        let bucket = Arc::new(TokenBucket::new(cfg.rate_capacity, cfg.rate_refill()));
        HttpMetricsSource::new(
            &cfg.analytics_base_url,
            cfg.analytics_api_key.clone(),
            cfg.fetch_timeout(),
            bucket,
        )
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch_page_metrics(&self, date: NaiveDate) -> Result<Vec<PageDayMetrics>> {
        self.bucket.acquire().await;

        let mut url = self
            .base_url
            .join("/v1/pages/metrics")
            .context("failed to build analytics URL")?;
        url.query_pairs_mut()
            .append_pair("date", &date.format("%Y-%m-%d").to_string());

        let mut request = self.client.get(url);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("analytics fetch failed for {}", date))?;
        if !response.status().is_success() {
            bail!(
                "analytics source returned {} for {}",
                response.status(),
                date
            );
        }
        let body: PageMetricsResponse = response
            .json()
            .await
            .context("invalid analytics response body")?;
        Ok(body.pages)
    }
}
