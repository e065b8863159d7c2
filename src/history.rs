//! Market-history sink: best-effort append of valuation records for
//! downstream aggregate reporting. Sink failures never roll back an asset
//! commit.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::params;

use crate::state::Valuation;
use crate::store::SqliteStore;

pub trait HistorySink: Send + Sync {
    fn record(&self, valuation: &Valuation) -> Result<()>;
}

impl HistorySink for SqliteStore {
    fn record(&self, valuation: &Valuation) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO market_history
                (ts, asset_id, previous_price, new_price, price_change_pct, market_cap, engagement_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                valuation.ts as i64,
                valuation.asset_id,
                valuation.previous_price,
                valuation.new_price,
                valuation.price_change_pct,
                valuation.market_cap,
                valuation.engagement_score,
            ],
        )?;
        Ok(())
    }
}

/// Collects valuations in memory; used by tests and demo runs.
#[derive(Default)]
pub struct MemoryHistorySink {
    entries: Mutex<Vec<Valuation>>,
}

impl MemoryHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Valuation> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl HistorySink for MemoryHistorySink {
    fn record(&self, valuation: &Valuation) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("history sink lock poisoned"))?
            .push(valuation.clone());
        Ok(())
    }
}

/// Discards everything; wired in when the sink is disabled by config.
pub struct NullHistorySink;

impl HistorySink for NullHistorySink {
    fn record(&self, _valuation: &Valuation) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valuation() -> Valuation {
        Valuation {
            asset_id: "m-1".to_string(),
            previous_price: 10.0,
            new_price: 13.0,
            price_change_pct: 0.3,
            market_cap: 13_000.0,
            engagement_score: 20.0,
            ts: 42,
        }
    }

    #[test]
    fn memory_sink_collects() {
        let sink = MemoryHistorySink::new();
        sink.record(&valuation()).unwrap();
        sink.record(&valuation()).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.snapshot()[0].new_price, 13.0);
    }

    #[test]
    fn sqlite_sink_appends() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init().unwrap();
        store.record(&valuation()).unwrap();
        store.record(&valuation()).unwrap();
        assert_eq!(store.history_len().unwrap(), 2);
    }
}
