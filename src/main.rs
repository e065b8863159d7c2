use std::sync::Arc;

use anyhow::Result;

use mememarket::engage::HttpEngagementSource;
use mememarket::history::{HistorySink, NullHistorySink};
use mememarket::logging::{log, obj, v_num, v_str, Domain, Level};
use mememarket::market::MarketService;
use mememarket::sched::TokioScheduler;
use mememarket::state::Config;
use mememarket::store::SqliteStore;
use mememarket::tick::run_dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    let store = Arc::new(SqliteStore::open(&cfg.sqlite_path)?);
    store.init()?;
    let engagement = Arc::new(HttpEngagementSource::new(&cfg)?);
    let (scheduler, rx) = TokioScheduler::new();
    let sink: Arc<dyn HistorySink> = if cfg.history_sink_enabled {
        store.clone()
    } else {
        Arc::new(NullHistorySink)
    };

    let service = MarketService::new(&cfg, store, engagement, Arc::new(scheduler), sink);

    // Chains persist across restarts: every active schedule gets one tick
    // re-armed before the dispatcher starts draining.
    let rearmed = service.rearm_active()?;
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("engagement_base", v_str(&cfg.engagement_base)),
            ("tick_secs", v_num(cfg.tick_interval_secs as f64)),
            ("rearmed", v_num(rearmed as f64)),
        ]),
    );

    let dispatcher = tokio::spawn(run_dispatcher(service.engine(), rx));

    tokio::signal::ctrl_c().await?;
    log(Level::Info, Domain::System, "shutdown", obj(&[]));
    dispatcher.abort();
    Ok(())
}
