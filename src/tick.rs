//! The recompute loop: a self-rescheduling chain of single-shot jobs, one
//! chain per asset. Every pass loads the asset, consults the engagement
//! source, applies the valuation algorithm, commits, and re-arms itself.
//! The chain never stops on its own; only a retired schedule record ends
//! it. Failures are logged and swallowed so availability of the loop wins
//! over surfacing any single tick's error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex as AsyncMutex;

use crate::engage::{weighted_score, EngagementSource};
use crate::errors::{MarketError, MarketResult};
use crate::history::HistorySink;
use crate::invariants;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::sched::{DueJob, Scheduler, TickJob, TICK_JOB};
use crate::state::{now_ts, ScheduleStatus, Valuation};
use crate::store::MarketStore;
use crate::valuation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pass for the same asset holds the guard right now.
    Overlap,
    /// The asset id resolved to nothing in the store.
    AssetMissing,
}

/// Tagged result of one recompute pass. None of these stop the schedule.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Committed(Valuation),
    Skipped(SkipReason),
    Failed(String),
}

impl TickOutcome {
    pub fn committed(&self) -> Option<&Valuation> {
        match self {
            TickOutcome::Committed(v) => Some(v),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TickOutcome::Committed(_) => "committed",
            TickOutcome::Skipped(SkipReason::Overlap) => "skipped_overlap",
            TickOutcome::Skipped(SkipReason::AssetMissing) => "skipped_missing",
            TickOutcome::Failed(_) => "failed",
        }
    }
}

pub struct TickEngine {
    store: MarketStore,
    engagement: Arc<dyn EngagementSource>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn HistorySink>,
    tick_interval_secs: u64,
    guards: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TickEngine {
    pub fn new(
        store: MarketStore,
        engagement: Arc<dyn EngagementSource>,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn HistorySink>,
        tick_interval_secs: u64,
    ) -> Self {
        Self {
            store,
            engagement,
            scheduler,
            sink,
            tick_interval_secs,
            guards: Mutex::new(HashMap::new()),
        }
    }

    fn guard_for(&self, asset_id: &str) -> Arc<AsyncMutex<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guards
            .entry(asset_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// One scheduler-driven pass. A duplicate invocation that finds the
    /// guard taken skips without re-arming; the holder's re-arm keeps the
    /// chain single-stranded under at-least-once delivery.
    pub async fn tick(&self, asset_id: &str) -> TickOutcome {
        let guard = self.guard_for(asset_id);
        let _held = match guard.try_lock_owned() {
            Ok(held) => held,
            Err(_) => {
                let outcome = TickOutcome::Skipped(SkipReason::Overlap);
                self.log_outcome(asset_id, &outcome);
                return outcome;
            }
        };

        let outcome = match self.revalue_locked(asset_id).await {
            Ok(valuation) => TickOutcome::Committed(valuation),
            Err(MarketError::NotFound(_)) => TickOutcome::Skipped(SkipReason::AssetMissing),
            Err(err) => TickOutcome::Failed(err.to_string()),
        };

        self.log_outcome(asset_id, &outcome);
        self.rearm(asset_id);
        outcome
    }

    /// On-demand recomputation: same commit path as the loop, but waits
    /// its turn on the guard and surfaces errors instead of swallowing.
    pub async fn valuate(&self, asset_id: &str) -> MarketResult<Valuation> {
        let guard = self.guard_for(asset_id);
        let _held = guard.lock_owned().await;
        self.revalue_locked(asset_id).await
    }

    async fn revalue_locked(&self, asset_id: &str) -> MarketResult<Valuation> {
        let mut asset = self
            .store
            .load_asset(asset_id)?
            .ok_or_else(|| MarketError::not_found(format!("asset {asset_id}")))?;

        let now = now_ts();
        let new_score = match self.engagement.fetch(asset_id).await {
            Ok(signal) => weighted_score(&signal, asset.trade_volume),
            Err(err) => {
                // Degrade to the stored score rather than failing the pass.
                log(
                    Level::Warn,
                    Domain::Feed,
                    "engagement_degraded",
                    obj(&[
                        ("asset_id", v_str(asset_id)),
                        ("error", v_str(&err.to_string())),
                        ("stored_score", v_num(asset.engagement_score)),
                    ]),
                );
                asset.engagement_score.max(valuation::ENGAGEMENT_FLOOR)
            }
        };

        let valuation = valuation::revalue(&asset, new_score, now);
        asset.apply_valuation(&valuation);
        invariants::check_asset(&asset).map_err(|v| MarketError::Invariant(v.msg))?;
        self.store.save_asset(&asset)?;

        if let Err(err) = self.sink.record(&valuation) {
            log(
                Level::Warn,
                Domain::Store,
                "history_sink_failed",
                obj(&[("asset_id", v_str(asset_id)), ("error", v_str(&err.to_string()))]),
            );
        }

        Ok(valuation)
    }

    /// Consult the schedule record and re-arm the chain. A transient read
    /// failure re-arms anyway; only an explicit retirement (or a missing
    /// record) ends the chain.
    fn rearm(&self, asset_id: &str) {
        match self.store.load_schedule(asset_id) {
            Ok(Some(mut record)) if record.status == ScheduleStatus::Active => {
                record.armed_at = now_ts();
                if let Err(err) = self.store.save_schedule(&record) {
                    log(
                        Level::Warn,
                        Domain::Tick,
                        "schedule_touch_failed",
                        obj(&[("asset_id", v_str(asset_id)), ("error", v_str(&err.to_string()))]),
                    );
                }
                self.scheduler.schedule(
                    TICK_JOB,
                    self.tick_interval_secs,
                    TickJob { asset_id: asset_id.to_string() },
                );
            }
            Ok(Some(_)) => {
                log(
                    Level::Info,
                    Domain::Tick,
                    "chain_retired",
                    obj(&[("asset_id", v_str(asset_id))]),
                );
            }
            Ok(None) => {
                log(
                    Level::Warn,
                    Domain::Tick,
                    "schedule_record_missing",
                    obj(&[("asset_id", v_str(asset_id))]),
                );
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Tick,
                    "schedule_read_failed",
                    obj(&[("asset_id", v_str(asset_id)), ("error", v_str(&err.to_string()))]),
                );
                self.scheduler.schedule(
                    TICK_JOB,
                    self.tick_interval_secs,
                    TickJob { asset_id: asset_id.to_string() },
                );
            }
        }
    }

    fn log_outcome(&self, asset_id: &str, outcome: &TickOutcome) {
        let mut fields = obj(&[
            ("asset_id", v_str(asset_id)),
            ("outcome", v_str(outcome.label())),
        ]);
        let level = match outcome {
            TickOutcome::Committed(v) => {
                fields.insert("previous_price".to_string(), v_num(v.previous_price));
                fields.insert("new_price".to_string(), v_num(v.new_price));
                fields.insert("change_pct".to_string(), v_num(v.price_change_pct));
                fields.insert("market_cap".to_string(), v_num(v.market_cap));
                Level::Info
            }
            TickOutcome::Skipped(_) => Level::Info,
            TickOutcome::Failed(reason) => {
                fields.insert("reason".to_string(), v_str(reason));
                Level::Error
            }
        };
        log(level, Domain::Tick, "tick", fields);
    }
}

/// Drain due jobs and run each pass in its own task, so chains for
/// different assets proceed in parallel.
pub async fn run_dispatcher(engine: Arc<TickEngine>, mut rx: UnboundedReceiver<DueJob>) {
    while let Some(due) = rx.recv().await {
        if due.job != TICK_JOB {
            log(
                Level::Warn,
                Domain::System,
                "unknown_job",
                obj(&[("job", v_str(&due.job))]),
            );
            continue;
        }
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.tick(&due.payload.asset_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engage::{EngagementSignal, FixedEngagementSource};
    use crate::history::MemoryHistorySink;
    use crate::issue::IssuanceService;
    use crate::sched::ManualScheduler;
    use crate::state::AssetContent;
    use crate::store::{MarketStore, MemoryStore};

    struct Rig {
        engine: TickEngine,
        store: MarketStore,
        source: Arc<FixedEngagementSource>,
        sched: Arc<ManualScheduler>,
        sink: Arc<MemoryHistorySink>,
        issuance: IssuanceService,
    }

    fn rig() -> Rig {
        let store = MarketStore::new(Arc::new(MemoryStore::new()));
        let source = Arc::new(FixedEngagementSource::new());
        let sched = Arc::new(ManualScheduler::new());
        let sink = Arc::new(MemoryHistorySink::new());
        let engine = TickEngine::new(
            store.clone(),
            source.clone(),
            sched.clone(),
            sink.clone(),
            3600,
        );
        let issuance = IssuanceService::new(store.clone(), sched.clone(), 3600);
        Rig { engine, store, source, sched, sink, issuance }
    }

    fn content() -> AssetContent {
        AssetContent {
            template: "classic".to_string(),
            title: "stonks".to_string(),
            text: "only up".to_string(),
            categories: vec!["dank".to_string()],
        }
    }

    #[tokio::test]
    async fn committed_tick_mutates_and_rearms() {
        let r = rig();
        let asset = r.issuance.create_asset(content(), 10.0, "u1", "t").unwrap();
        r.sched.drain();

        // score 10 -> weighted 20 is +100%, clamped to +30%.
        r.source.set(&asset.id, EngagementSignal { score: 20.0, comment_count: 0 });
        let outcome = r.engine.tick(&asset.id).await;
        let valuation = outcome.committed().expect("committed");
        assert!((valuation.new_price - 13.0).abs() < 1e-9);

        let stored = r.store.load_asset(&asset.id).unwrap().unwrap();
        assert!((stored.current_price - 13.0).abs() < 1e-9);
        assert_eq!(stored.engagement_score, 20.0);
        assert_eq!(stored.price_history.len(), 2);
        assert_eq!(r.sink.len(), 1);

        let jobs = r.sched.drain();
        assert_eq!(jobs.len(), 1, "committed tick re-arms exactly once");
        assert_eq!(jobs[0].2.asset_id, asset.id);
    }

    #[tokio::test]
    async fn engagement_failure_degrades_and_still_commits() {
        let r = rig();
        let asset = r.issuance.create_asset(content(), 10.0, "u1", "t").unwrap();
        r.sched.drain();
        r.source.set_failing(true);

        let outcome = r.engine.tick(&asset.id).await;
        let valuation = outcome.committed().expect("degraded pass still commits");
        assert_eq!(valuation.price_change_pct, 0.0);
        assert_eq!(valuation.new_price, 10.0);
        assert_eq!(r.sched.drain().len(), 1);
    }

    #[tokio::test]
    async fn missing_asset_skips_but_rearms_while_active() {
        let r = rig();
        // Dangling schedule record: asset blob lost, chain must survive.
        r.store
            .save_schedule(&crate::state::ScheduleRecord {
                asset_id: "ghost".to_string(),
                status: ScheduleStatus::Active,
                armed_at: 0,
            })
            .unwrap();

        let outcome = r.engine.tick("ghost").await;
        assert!(matches!(outcome, TickOutcome::Skipped(SkipReason::AssetMissing)));
        assert_eq!(r.sched.drain().len(), 1, "NotFound trades a wasted tick for resilience");
    }

    #[tokio::test]
    async fn unknown_asset_without_schedule_does_not_rearm() {
        let r = rig();
        let outcome = r.engine.tick("nobody").await;
        assert!(matches!(outcome, TickOutcome::Skipped(SkipReason::AssetMissing)));
        assert_eq!(r.sched.pending(), 0);
    }

    #[tokio::test]
    async fn retired_schedule_ends_chain_after_final_commit() {
        let r = rig();
        let asset = r.issuance.create_asset(content(), 10.0, "u1", "t").unwrap();
        r.sched.drain();
        r.source.set(&asset.id, EngagementSignal { score: 10.0, comment_count: 0 });

        let mut record = r.store.load_schedule(&asset.id).unwrap().unwrap();
        record.status = ScheduleStatus::Retired;
        r.store.save_schedule(&record).unwrap();

        let outcome = r.engine.tick(&asset.id).await;
        assert!(outcome.committed().is_some(), "tick itself still commits");
        assert_eq!(r.sched.pending(), 0, "retired chain does not re-arm");
    }

    #[tokio::test]
    async fn overlapping_invocation_skips_without_rearming() {
        let r = rig();
        let asset = r.issuance.create_asset(content(), 10.0, "u1", "t").unwrap();
        r.sched.drain();
        r.source.set(&asset.id, EngagementSignal { score: 10.0, comment_count: 0 });
        // Keep the first pass in flight long enough for the second to land.
        r.source.set_delay_ms(100);

        let (first, second) = tokio::join!(r.engine.tick(&asset.id), r.engine.tick(&asset.id));
        let labels = [first.label(), second.label()];
        assert!(labels.contains(&"committed"));
        assert!(labels.contains(&"skipped_overlap"));
        assert_eq!(r.sched.drain().len(), 1, "only the committed pass re-arms");
    }

    #[tokio::test]
    async fn valuate_surfaces_not_found() {
        let r = rig();
        let err = r.engine.valuate("nobody").await.unwrap_err();
        assert!(matches!(err, MarketError::NotFound(_)));
    }
}
