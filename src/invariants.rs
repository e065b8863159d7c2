use crate::state::{Asset, PRICE_HISTORY_CAP};
use crate::valuation::ENGAGEMENT_FLOOR;

#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub msg: String,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.msg)
    }
}

fn violation(msg: &str) -> Result<(), InvariantViolation> {
    Err(InvariantViolation { msg: msg.to_string() })
}

/// Checked before every asset commit. A violation marks the tick failed
/// rather than persisting a corrupt record.
pub fn check_asset(asset: &Asset) -> Result<(), InvariantViolation> {
    if !asset.current_price.is_finite() || asset.current_price <= 0.0 {
        return violation("current_price not positive finite");
    }
    if asset.available_shares > asset.total_shares {
        return violation("available_shares exceeds total_shares");
    }
    if asset.engagement_score.is_nan() || asset.engagement_score < ENGAGEMENT_FLOOR {
        return violation("engagement_score below floor");
    }
    if asset.price_history.len() > PRICE_HISTORY_CAP {
        return violation("price_history over cap");
    }
    let mut prev_ts = 0u64;
    for point in &asset.price_history {
        if point.ts < prev_ts {
            return violation("price_history timestamps not monotonic");
        }
        if !point.price.is_finite() || point.price <= 0.0 {
            return violation("price_history sample not positive finite");
        }
        prev_ts = point.ts;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PricePoint;
    use std::collections::VecDeque;

    fn asset() -> Asset {
        Asset {
            id: "m-1".to_string(),
            creator_id: "u1".to_string(),
            creator_name: "tester".to_string(),
            created_at: 100,
            template: "classic".to_string(),
            title: "t".to_string(),
            text: "x".to_string(),
            categories: vec![],
            total_shares: 1000,
            available_shares: 900,
            current_price: 1.0,
            trade_volume: 0,
            engagement_score: 10.0,
            price_history: VecDeque::from(vec![
                PricePoint { ts: 100, price: 1.0 },
                PricePoint { ts: 200, price: 1.1 },
            ]),
            last_updated: 200,
        }
    }

    #[test]
    fn healthy_asset_passes() {
        assert!(check_asset(&asset()).is_ok());
    }

    #[test]
    fn rejects_zero_price() {
        let mut a = asset();
        a.current_price = 0.0;
        assert!(check_asset(&a).is_err());
    }

    #[test]
    fn rejects_share_overflow() {
        let mut a = asset();
        a.available_shares = 1001;
        assert!(check_asset(&a).is_err());
    }

    #[test]
    fn rejects_unordered_history() {
        let mut a = asset();
        a.price_history.push_back(PricePoint { ts: 50, price: 1.0 });
        assert!(check_asset(&a).is_err());
    }

    #[test]
    fn rejects_engagement_below_floor() {
        let mut a = asset();
        a.engagement_score = 5.0;
        assert!(check_asset(&a).is_err());
    }
}
