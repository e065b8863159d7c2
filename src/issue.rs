//! Issuance: mint a new asset, allocate its share pool, grant the founder
//! cut, register indexes and arm the first recompute tick.

use std::sync::Arc;

use rand::Rng;

use crate::errors::{MarketError, MarketResult};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::sched::{Scheduler, TickJob, TICK_JOB};
use crate::state::{
    now_ts, now_ts_ms, Asset, AssetContent, Holding, PricePoint, ScheduleRecord, ScheduleStatus,
};
use crate::store::{category_key, MarketStore, ASSET_INDEX_KEY};
use crate::valuation::ENGAGEMENT_FLOOR;

/// Share pool fixed at issuance.
pub const TOTAL_SHARES: u64 = 1000;
/// Fraction of the pool granted to the creator at zero cost.
pub const FOUNDER_FRACTION: f64 = 0.10;

/// Epoch millis plus a random suffix. Best-effort uniqueness; collisions
/// under heavy concurrent creation are an accepted limitation.
pub fn new_asset_id() -> String {
    format!("{}-{:04}", now_ts_ms(), rand::thread_rng().gen_range(0..10_000))
}

pub struct IssuanceService {
    store: MarketStore,
    scheduler: Arc<dyn Scheduler>,
    first_tick_delay_secs: u64,
}

impl IssuanceService {
    pub fn new(store: MarketStore, scheduler: Arc<dyn Scheduler>, first_tick_delay_secs: u64) -> Self {
        Self { store, scheduler, first_tick_delay_secs }
    }

    /// Create and commit a new asset. Content is assumed pre-validated by
    /// the caller; the price is not.
    pub fn create_asset(
        &self,
        content: AssetContent,
        initial_price: f64,
        creator_id: &str,
        creator_name: &str,
    ) -> MarketResult<Asset> {
        if !initial_price.is_finite() || initial_price <= 0.0 {
            return Err(MarketError::invalid(format!(
                "initial share price must be positive, got {initial_price}"
            )));
        }

        let now = now_ts();
        let id = new_asset_id();
        let founder_shares = (TOTAL_SHARES as f64 * FOUNDER_FRACTION).round() as u64;

        let asset = Asset {
            id: id.clone(),
            creator_id: creator_id.to_string(),
            creator_name: creator_name.to_string(),
            created_at: now,
            template: content.template,
            title: content.title,
            text: content.text,
            categories: content.categories,
            total_shares: TOTAL_SHARES,
            available_shares: TOTAL_SHARES - founder_shares,
            current_price: initial_price,
            trade_volume: 0,
            engagement_score: ENGAGEMENT_FLOOR,
            price_history: [PricePoint { ts: now, price: initial_price }].into_iter().collect(),
            last_updated: now,
        };
        let schedule = ScheduleRecord {
            asset_id: id.clone(),
            status: ScheduleStatus::Active,
            armed_at: now,
        };

        // Asset, founder grant and schedule land in one store mutation;
        // index membership is an idempotent set-add per index.
        self.store.commit_issuance(
            &asset,
            Holding { shares: founder_shares, average_buy_price: 0.0 },
            &schedule,
        )?;
        self.store.index_add(ASSET_INDEX_KEY, &id)?;
        for category in &asset.categories {
            self.store.index_add(&category_key(category), &id)?;
        }

        self.scheduler.schedule(
            TICK_JOB,
            self.first_tick_delay_secs,
            TickJob { asset_id: id.clone() },
        );

        log(
            Level::Info,
            Domain::Issue,
            "asset_created",
            obj(&[
                ("asset_id", v_str(&id)),
                ("creator_id", v_str(creator_id)),
                ("initial_price", v_num(initial_price)),
                ("founder_shares", v_num(founder_shares as f64)),
                ("categories", v_num(asset.categories.len() as f64)),
            ]),
        );

        Ok(asset)
    }
}
