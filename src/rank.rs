//! Trending query: assets ordered by their most recent single-tick percent
//! price change.

use crate::errors::MarketResult;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::state::Asset;
use crate::store::{category_key, MarketStore, ASSET_INDEX_KEY};

/// Fractional change between the last two history samples. Assets with
/// fewer than two samples rank neutral rather than being excluded.
pub fn recent_change_pct(asset: &Asset) -> f64 {
    let n = asset.price_history.len();
    if n < 2 {
        return 0.0;
    }
    let prev = asset.price_history[n - 2].price;
    let last = asset.price_history[n - 1].price;
    if prev <= 0.0 {
        return 0.0;
    }
    (last - prev) / prev
}

pub struct RankingService {
    store: MarketStore,
}

impl RankingService {
    pub fn new(store: MarketStore) -> Self {
        Self { store }
    }

    /// Read-only. Ties keep index emission order (stable sort, no
    /// secondary key); dangling index pointers are skipped.
    pub fn get_trending(&self, limit: usize, category: Option<&str>) -> MarketResult<Vec<Asset>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let index = match category {
            Some(name) => category_key(name),
            None => ASSET_INDEX_KEY.to_string(),
        };
        let ids = self.store.index_read(&index)?;

        let mut ranked: Vec<(f64, Asset)> = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.store.load_asset(id)? {
                Some(asset) => ranked.push((recent_change_pct(&asset), asset)),
                None => continue,
            }
        }

        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);

        log(
            Level::Debug,
            Domain::Rank,
            "trending",
            obj(&[
                ("index", v_str(&index)),
                ("candidates", v_num(ids.len() as f64)),
                ("returned", v_num(ranked.len() as f64)),
            ]),
        );

        Ok(ranked.into_iter().map(|(_, asset)| asset).collect())
    }
}
