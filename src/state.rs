use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Samples kept per asset; older ticks fall off the front.
pub const PRICE_HISTORY_CAP: usize = 24;

#[derive(Clone, Debug)]
pub struct Config {
    pub sqlite_path: String,
    pub engagement_base: String,
    pub http_timeout_ms: u64,
    pub engagement_ttl_secs: u64,
    pub tick_interval_secs: u64,
    pub first_tick_delay_secs: u64,
    pub history_sink_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./market.sqlite".to_string()),
            engagement_base: std::env::var("ENGAGEMENT_BASE").unwrap_or_else(|_| "http://127.0.0.1:8099".to_string()),
            http_timeout_ms: std::env::var("HTTP_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5000),
            engagement_ttl_secs: std::env::var("ENGAGEMENT_TTL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            tick_interval_secs: std::env::var("TICK_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600),
            first_tick_delay_secs: std::env::var("FIRST_TICK_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600),
            history_sink_enabled: std::env::var("HISTORY_SINK")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(true),
        }
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

pub fn now_ts_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// One committed market tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts: u64,
    pub price: f64,
}

/// Immutable content payload supplied at issuance. Validation of the text
/// itself belongs to the caller; only the price is checked here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetContent {
    pub template: String,
    pub title: String,
    pub text: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub creator_id: String,
    pub creator_name: String,
    pub created_at: u64,
    pub template: String,
    pub title: String,
    pub text: String,
    pub categories: Vec<String>,
    pub total_shares: u64,
    pub available_shares: u64,
    pub current_price: f64,
    pub trade_volume: u64,
    pub engagement_score: f64,
    pub price_history: VecDeque<PricePoint>,
    pub last_updated: u64,
}

impl Asset {
    pub fn age_days(&self, now: u64) -> f64 {
        now.saturating_sub(self.created_at) as f64 / 86_400.0
    }

    /// Fold one valuation result into market state. History is appended and
    /// the oldest samples evicted past the cap.
    pub fn apply_valuation(&mut self, v: &Valuation) {
        self.current_price = v.new_price;
        self.engagement_score = v.engagement_score;
        self.last_updated = v.ts;
        self.price_history.push_back(PricePoint { ts: v.ts, price: v.new_price });
        while self.price_history.len() > PRICE_HISTORY_CAP {
            self.price_history.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Holding {
    pub shares: u64,
    pub average_buy_price: f64,
}

/// Per-user map of asset holdings, created lazily on first allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Portfolio {
    pub holdings: HashMap<String, Holding>,
}

/// Result of one recompute pass. Not persisted as its own entity; forwarded
/// to the history sink and folded into the asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Valuation {
    pub asset_id: String,
    pub previous_price: f64,
    pub new_price: f64,
    pub price_change_pct: f64,
    pub market_cap: f64,
    pub engagement_score: f64,
    pub ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Retired,
}

/// Persistent per-asset schedule record. The recompute chain consults the
/// status before re-arming, so retiring an asset winds its chain down at
/// the next wake-up instead of requiring task cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub asset_id: String,
    pub status: ScheduleStatus,
    pub armed_at: u64,
}
