//! Service facade: wires store, engagement source, scheduler and sink into
//! the operations exposed to the (excluded) UI/trading layer.

use std::sync::Arc;

use crate::engage::EngagementSource;
use crate::errors::{MarketError, MarketResult};
use crate::history::HistorySink;
use crate::issue::IssuanceService;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::rank::RankingService;
use crate::sched::{Scheduler, TickJob, TICK_JOB};
use crate::state::{now_ts, Asset, AssetContent, Config, ScheduleStatus, Valuation};
use crate::store::{KvStore, MarketStore};
use crate::tick::TickEngine;

pub struct MarketService {
    store: MarketStore,
    scheduler: Arc<dyn Scheduler>,
    engine: Arc<TickEngine>,
    issuance: IssuanceService,
    ranking: RankingService,
    tick_interval_secs: u64,
}

impl MarketService {
    pub fn new(
        cfg: &Config,
        kv: Arc<dyn KvStore>,
        engagement: Arc<dyn EngagementSource>,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn HistorySink>,
    ) -> Self {
        let store = MarketStore::new(kv);
        let engine = Arc::new(TickEngine::new(
            store.clone(),
            engagement,
            scheduler.clone(),
            sink,
            cfg.tick_interval_secs,
        ));
        let issuance =
            IssuanceService::new(store.clone(), scheduler.clone(), cfg.first_tick_delay_secs);
        let ranking = RankingService::new(store.clone());
        Self {
            store,
            scheduler,
            engine,
            issuance,
            ranking,
            tick_interval_secs: cfg.tick_interval_secs,
        }
    }

    /// The tick engine, for the dispatcher task.
    pub fn engine(&self) -> Arc<TickEngine> {
        self.engine.clone()
    }

    pub fn create_asset(
        &self,
        content: AssetContent,
        initial_price: f64,
        creator_id: &str,
        creator_name: &str,
    ) -> MarketResult<Asset> {
        self.issuance.create_asset(content, initial_price, creator_id, creator_name)
    }

    pub fn get_trending(&self, limit: usize, category: Option<&str>) -> MarketResult<Vec<Asset>> {
        self.ranking.get_trending(limit, category)
    }

    pub async fn valuate(&self, asset_id: &str) -> MarketResult<Valuation> {
        self.engine.valuate(asset_id).await
    }

    /// Flip the schedule record so the asset's recompute chain winds down
    /// at its next wake-up.
    pub fn retire_schedule(&self, asset_id: &str) -> MarketResult<()> {
        let mut record = self
            .store
            .load_schedule(asset_id)?
            .ok_or_else(|| MarketError::not_found(format!("schedule for {asset_id}")))?;
        if record.status == ScheduleStatus::Retired {
            return Ok(());
        }
        record.status = ScheduleStatus::Retired;
        self.store.save_schedule(&record)?;
        log(
            Level::Info,
            Domain::Tick,
            "schedule_retired",
            obj(&[("asset_id", v_str(asset_id))]),
        );
        Ok(())
    }

    /// Startup recovery: re-arm one tick per active schedule record so
    /// chains survive a restart. Returns how many were armed.
    pub fn rearm_active(&self) -> MarketResult<usize> {
        let mut armed = 0usize;
        for mut record in self.store.schedules()? {
            if record.status != ScheduleStatus::Active {
                continue;
            }
            record.armed_at = now_ts();
            self.store.save_schedule(&record)?;
            self.scheduler.schedule(
                TICK_JOB,
                self.tick_interval_secs,
                TickJob { asset_id: record.asset_id.clone() },
            );
            armed += 1;
        }
        log(
            Level::Info,
            Domain::System,
            "schedules_rearmed",
            obj(&[("count", v_num(armed as f64))]),
        );
        Ok(armed)
    }
}
