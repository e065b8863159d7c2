//! Keyed persistence.
//!
//! The market treats its store as an opaque key-value API. `update` is the
//! one primitive with teeth: an atomic multi-key read-modify-write, which
//! is what makes issuance commits and index appends safe under concurrent
//! callers. The sqlite implementation runs it inside a transaction; the
//! in-memory implementation holds its map lock for the duration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::state::{Asset, Holding, Portfolio, ScheduleRecord};

pub const ASSET_INDEX_KEY: &str = "asset_index";

pub fn asset_key(id: &str) -> String {
    format!("asset:{id}")
}

pub fn category_key(name: &str) -> String {
    format!("category:{name}")
}

pub fn portfolio_key(user_id: &str) -> String {
    format!("portfolio:{user_id}")
}

pub fn schedule_key(asset_id: &str) -> String {
    format!("schedule:{asset_id}")
}

/// Entries handed to an `update` closure: requested key -> current value.
/// Entries left as `Some` after the closure are written back; `None` means
/// the key stays absent.
pub type UpdateEntries = BTreeMap<String, Option<String>>;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    /// Atomic read-modify-write across `keys`.
    fn update(&self, keys: &[&str], apply: &dyn Fn(&mut UpdateEntries) -> Result<()>) -> Result<()>;
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Sqlite store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS market_history (
                ts INTEGER NOT NULL,
                asset_id TEXT NOT NULL,
                previous_price REAL NOT NULL,
                new_price REAL NOT NULL,
                price_change_pct REAL NOT NULL,
                market_cap REAL NOT NULL,
                engagement_score REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    pub fn history_len(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM market_history", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn update(&self, keys: &[&str], apply: &dyn Fn(&mut UpdateEntries) -> Result<()>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut entries = UpdateEntries::new();
        for key in keys {
            let value: Option<String> = tx
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
                .optional()?;
            entries.insert(key.to_string(), value);
        }

        apply(&mut entries)?;

        for (key, value) in &entries {
            if let Some(value) = value {
                tx.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let pattern = format!("{prefix}%");
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE key LIKE ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![pattern], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> Result<MutexGuard<'_, HashMap<String, String>>> {
        self.map.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.map()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn update(&self, keys: &[&str], apply: &dyn Fn(&mut UpdateEntries) -> Result<()>) -> Result<()> {
        let mut map = self.map()?;
        let mut entries = UpdateEntries::new();
        for key in keys {
            entries.insert(key.to_string(), map.get(*key).cloned());
        }
        apply(&mut entries)?;
        for (key, value) in entries {
            if let Some(value) = value {
                map.insert(key, value);
            }
        }
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> =
            self.map()?.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Typed access layer
// ---------------------------------------------------------------------------

/// Serde-aware wrapper over the raw store, shared by issuance, the tick
/// engine and the ranking query.
#[derive(Clone)]
pub struct MarketStore {
    kv: Arc<dyn KvStore>,
}

impl MarketStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(raw) => {
                let value = serde_json::from_str(&raw).with_context(|| format!("decoding {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.kv.put(key, &raw)
    }

    pub fn load_asset(&self, id: &str) -> Result<Option<Asset>> {
        self.get_json(&asset_key(id))
    }

    pub fn save_asset(&self, asset: &Asset) -> Result<()> {
        self.put_json(&asset_key(&asset.id), asset)
    }

    pub fn load_portfolio(&self, user_id: &str) -> Result<Option<Portfolio>> {
        self.get_json(&portfolio_key(user_id))
    }

    pub fn load_schedule(&self, asset_id: &str) -> Result<Option<ScheduleRecord>> {
        self.get_json(&schedule_key(asset_id))
    }

    pub fn save_schedule(&self, record: &ScheduleRecord) -> Result<()> {
        self.put_json(&schedule_key(&record.asset_id), record)
    }

    /// All persisted schedule records, in key order.
    pub fn schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let mut records = Vec::new();
        for key in self.kv.list_keys("schedule:")? {
            if let Some(raw) = self.kv.get(&key)? {
                let record: ScheduleRecord =
                    serde_json::from_str(&raw).with_context(|| format!("decoding {key}"))?;
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn index_read(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.get_json(key)?.unwrap_or_default())
    }

    /// Append `id` to an index list if absent. Atomic set-add; concurrent
    /// issuances cannot lose each other's entries.
    pub fn index_add(&self, key: &str, id: &str) -> Result<()> {
        self.kv.update(&[key], &|entries| {
            let current = entries.get(key).cloned().flatten();
            let mut ids: Vec<String> = match current {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Vec::new(),
            };
            if !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
            entries.insert(key.to_string(), Some(serde_json::to_string(&ids)?));
            Ok(())
        })
    }

    /// Commit a freshly issued asset, its founder grant and its schedule
    /// record as one atomic store mutation. The creator's portfolio is
    /// re-read inside the commit so concurrent issuances by the same user
    /// merge instead of clobbering.
    pub fn commit_issuance(
        &self,
        asset: &Asset,
        founder: Holding,
        schedule: &ScheduleRecord,
    ) -> Result<()> {
        let a_key = asset_key(&asset.id);
        let p_key = portfolio_key(&asset.creator_id);
        let s_key = schedule_key(&asset.id);

        let asset_raw = serde_json::to_string(asset)?;
        let schedule_raw = serde_json::to_string(schedule)?;
        let asset_id = asset.id.as_str();

        self.kv.update(&[a_key.as_str(), p_key.as_str(), s_key.as_str()], &|entries| {
            let mut portfolio: Portfolio = match entries.get(&p_key).cloned().flatten() {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Portfolio::default(),
            };
            portfolio.holdings.insert(asset_id.to_string(), founder);

            entries.insert(a_key.clone(), Some(asset_raw.clone()));
            entries.insert(p_key.clone(), Some(serde_json::to_string(&portfolio)?));
            entries.insert(s_key.clone(), Some(schedule_raw.clone()));
            Ok(())
        })
    }
}
