//! Engagement source: the external popularity signal driving price moves.
//!
//! The HTTP source caches per-asset signals with a TTL and backs off
//! exponentially after failures, so a flapping upstream degrades to stale
//! data instead of hammering the endpoint once per tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::retry::{retry_async, RetryConfig};
use crate::state::Config;
use crate::valuation::ENGAGEMENT_FLOOR;

pub const SCORE_WEIGHT: f64 = 1.0;
pub const COMMENT_WEIGHT: f64 = 2.0;
pub const VOLUME_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngagementSignal {
    pub score: f64,
    pub comment_count: u64,
}

/// Weighted blend of post score, comment count and trade volume, floored
/// so the downstream percent-change formula never divides by zero.
pub fn weighted_score(signal: &EngagementSignal, trade_volume: u64) -> f64 {
    let raw = signal.score * SCORE_WEIGHT
        + signal.comment_count as f64 * COMMENT_WEIGHT
        + trade_volume as f64 * VOLUME_WEIGHT;
    if raw.is_finite() {
        raw.max(ENGAGEMENT_FLOOR)
    } else {
        ENGAGEMENT_FLOOR
    }
}

#[async_trait]
pub trait EngagementSource: Send + Sync {
    async fn fetch(&self, asset_id: &str) -> Result<EngagementSignal>;
}

// ---------------------------------------------------------------------------
// HTTP source with TTL cache and failure backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    signal: Option<EngagementSignal>,
    fetched_at: Option<Instant>,
    failures: u32,
    last_failure: Option<Instant>,
}

impl CacheEntry {
    fn empty() -> Self {
        Self { signal: None, fetched_at: None, failures: 0, last_failure: None }
    }

    fn is_fresh(&self, ttl_secs: u64) -> bool {
        match self.fetched_at {
            Some(at) => at.elapsed() < Duration::from_secs(ttl_secs),
            None => false,
        }
    }

    fn backoff_secs(&self) -> u64 {
        // 2^failures seconds, capped at 300s
        2u64.saturating_pow(self.failures.min(8)).min(300)
    }

    fn can_retry(&self) -> bool {
        match self.last_failure {
            None => true,
            Some(last) => last.elapsed() >= Duration::from_secs(self.backoff_secs()),
        }
    }

    fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(Instant::now());
    }

    fn record_success(&mut self, signal: EngagementSignal) {
        self.signal = Some(signal);
        self.fetched_at = Some(Instant::now());
        self.failures = 0;
        self.last_failure = None;
    }
}

#[derive(Debug, Deserialize)]
struct EngagementPayload {
    score: f64,
    comments: u64,
}

pub struct HttpEngagementSource {
    client: Client,
    base: String,
    ttl_secs: u64,
    retry: RetryConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl HttpEngagementSource {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.http_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base: cfg.engagement_base.trim_end_matches('/').to_string(),
            ttl_secs: cfg.engagement_ttl_secs,
            retry: RetryConfig::default(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn cached(&self, asset_id: &str) -> CacheEntry {
        self.cache
            .lock()
            .map(|c| c.get(asset_id).copied().unwrap_or_else(CacheEntry::empty))
            .unwrap_or_else(|_| CacheEntry::empty())
    }

    fn with_entry(&self, asset_id: &str, f: impl FnOnce(&mut CacheEntry)) {
        if let Ok(mut cache) = self.cache.lock() {
            let entry = cache.entry(asset_id.to_string()).or_insert_with(CacheEntry::empty);
            f(entry);
        }
    }

    async fn fetch_remote(&self, asset_id: &str) -> Result<EngagementSignal> {
        let url = format!("{}/engagement/{}", self.base, asset_id);
        let payload: EngagementPayload = retry_async(&self.retry, "fetch_engagement", || async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET {url}"))?;
            let resp = resp.error_for_status()?;
            Ok(resp.json::<EngagementPayload>().await?)
        })
        .await?;
        Ok(EngagementSignal { score: payload.score, comment_count: payload.comments })
    }
}

#[async_trait]
impl EngagementSource for HttpEngagementSource {
    async fn fetch(&self, asset_id: &str) -> Result<EngagementSignal> {
        let entry = self.cached(asset_id);
        if entry.is_fresh(self.ttl_secs) {
            if let Some(signal) = entry.signal {
                return Ok(signal);
            }
        }
        if !entry.can_retry() {
            // Still inside the backoff window: serve stale if we have it.
            return entry
                .signal
                .ok_or_else(|| anyhow!("engagement source backing off for {asset_id}"));
        }

        match self.fetch_remote(asset_id).await {
            Ok(signal) => {
                self.with_entry(asset_id, |e| e.record_success(signal));
                Ok(signal)
            }
            Err(err) => {
                self.with_entry(asset_id, |e| e.record_failure());
                log(
                    Level::Warn,
                    Domain::Feed,
                    "engagement_fetch_failed",
                    obj(&[
                        ("asset_id", v_str(asset_id)),
                        ("error", v_str(&err.to_string())),
                        ("stale_available", v_str(if entry.signal.is_some() { "yes" } else { "no" })),
                    ]),
                );
                match entry.signal {
                    Some(stale) => Ok(stale),
                    None => Err(err),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Programmable source for tests and offline runs
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FixedEngagementSource {
    signals: Mutex<HashMap<String, EngagementSignal>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    fetches: AtomicU64,
}

impl FixedEngagementSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, asset_id: &str, signal: EngagementSignal) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.insert(asset_id.to_string(), signal);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Artificial latency per fetch; lets tests hold a tick in flight.
    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngagementSource for FixedEngagementSource {
    async fn fetch(&self, asset_id: &str) -> Result<EngagementSignal> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("engagement source down"));
        }
        self.signals
            .lock()
            .map_err(|_| anyhow!("signal map poisoned"))?
            .get(asset_id)
            .copied()
            .ok_or_else(|| anyhow!("no signal for {asset_id}"))
    }
}
