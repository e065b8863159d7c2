//! Price-change algorithm: pure and deterministic given its inputs.
//!
//! One tick turns an engagement delta into a bounded fractional price move:
//! young assets react harder than old ones, traded assets harder than
//! dormant ones, and no single tick moves the price more than 30% either
//! way.

use crate::state::{Asset, Valuation};

/// Absolute price floor; holds regardless of the computed delta.
pub const PRICE_FLOOR: f64 = 0.1;
/// Per-tick clamp on the fractional price change.
pub const MAX_TICK_MOVE: f64 = 0.3;
/// Engagement scores are floored here before any division.
pub const ENGAGEMENT_FLOOR: f64 = 10.0;
/// Volatility decays linearly by this much per day of asset age.
pub const VOLATILITY_DECAY_PER_DAY: f64 = 0.1;
/// Aged assets keep at least this much responsiveness.
pub const VOLATILITY_FLOOR: f64 = 0.1;
/// Trade volume amplification is capped at 2x.
pub const VOLUME_FACTOR_CAP: f64 = 2.0;
/// Shares of trade volume per +1.0 of volume factor.
pub const VOLUME_SCALE: f64 = 1000.0;

pub fn volatility_factor(age_days: f64) -> f64 {
    (1.0 - age_days * VOLATILITY_DECAY_PER_DAY).max(VOLATILITY_FLOOR)
}

pub fn volume_factor(trade_volume: u64) -> f64 {
    (1.0 + trade_volume as f64 / VOLUME_SCALE).min(VOLUME_FACTOR_CAP)
}

/// Compute one valuation for `asset` given a freshly observed engagement
/// score. `now` is epoch seconds; the caller owns the clock.
pub fn revalue(asset: &Asset, new_score: f64, now: u64) -> Valuation {
    let prev_score = asset.engagement_score.max(ENGAGEMENT_FLOOR);
    // A non-finite observation carries no signal; treat it as no change.
    let new_score = if new_score.is_finite() { new_score.max(ENGAGEMENT_FLOOR) } else { prev_score };

    let score_change = (new_score - prev_score) / prev_score;
    let raw_delta = score_change * volatility_factor(asset.age_days(now)) * volume_factor(asset.trade_volume);
    let price_change_pct = raw_delta.clamp(-MAX_TICK_MOVE, MAX_TICK_MOVE);
    let new_price = (asset.current_price * (1.0 + price_change_pct)).max(PRICE_FLOOR);

    Valuation {
        asset_id: asset.id.clone(),
        previous_price: asset.current_price,
        new_price,
        price_change_pct,
        market_cap: asset.total_shares as f64 * new_price,
        engagement_score: new_score,
        ts: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PricePoint;
    use std::collections::VecDeque;

    fn asset_with(price: f64, engagement: f64, created_at: u64, volume: u64) -> Asset {
        Asset {
            id: "m-1".to_string(),
            creator_id: "u1".to_string(),
            creator_name: "tester".to_string(),
            created_at,
            template: "classic".to_string(),
            title: "t".to_string(),
            text: "x".to_string(),
            categories: vec![],
            total_shares: 1000,
            available_shares: 900,
            current_price: price,
            trade_volume: volume,
            engagement_score: engagement,
            price_history: VecDeque::from(vec![PricePoint { ts: created_at, price }]),
            last_updated: created_at,
        }
    }

    #[test]
    fn no_change_in_score_leaves_price_alone() {
        let asset = asset_with(7.0, 10.0, 0, 0);
        let v = revalue(&asset, 10.0, 0);
        assert_eq!(v.price_change_pct, 0.0);
        assert_eq!(v.new_price, 7.0);
        assert_eq!(v.market_cap, 7_000.0);
    }

    #[test]
    fn doubling_score_clamps_to_max_move() {
        // score 10 -> 20 is +100%, clamped to +30%: 10.0 becomes 13.0.
        let asset = asset_with(10.0, 10.0, 0, 0);
        let v = revalue(&asset, 20.0, 0);
        assert_eq!(v.price_change_pct, MAX_TICK_MOVE);
        assert!((v.new_price - 13.0).abs() < 1e-12);
        assert!((v.market_cap - 13_000.0).abs() < 1e-9);
    }

    #[test]
    fn crash_in_score_clamps_downward() {
        let asset = asset_with(10.0, 100.0, 0, 0);
        let v = revalue(&asset, 10.0, 0);
        assert_eq!(v.price_change_pct, -MAX_TICK_MOVE);
        assert!((v.new_price - 7.0).abs() < 1e-12);
    }

    #[test]
    fn price_never_drops_below_floor() {
        let asset = asset_with(0.12, 100.0, 0, 0);
        let v = revalue(&asset, 10.0, 0);
        assert_eq!(v.new_price, PRICE_FLOOR);
    }

    #[test]
    fn volatility_decays_with_age_and_floors() {
        assert_eq!(volatility_factor(0.0), 1.0);
        assert_eq!(volatility_factor(5.0), 0.5);
        assert_eq!(volatility_factor(30.0), VOLATILITY_FLOOR);
    }

    #[test]
    fn volume_amplifies_and_caps() {
        assert_eq!(volume_factor(0), 1.0);
        assert_eq!(volume_factor(500), 1.5);
        assert_eq!(volume_factor(10_000), VOLUME_FACTOR_CAP);
    }

    #[test]
    fn aged_asset_moves_less() {
        // 5 days old: +100% score change scaled by 0.5 volatility, then
        // clamped: still hits the 30% ceiling. Use a smaller delta instead.
        let five_days = 5 * 86_400;
        let asset = asset_with(10.0, 10.0, 0, 0);
        let aged = asset_with(10.0, 10.0, 0, 0);
        let v_young = revalue(&asset, 11.0, 0);
        let v_old = revalue(&aged, 11.0, five_days);
        assert!((v_young.price_change_pct - 0.10).abs() < 1e-12);
        assert!((v_old.price_change_pct - 0.05).abs() < 1e-12);
    }

    #[test]
    fn stored_score_below_floor_never_divides_small() {
        // A corrupt stored score of 0 must not divide by zero.
        let asset = asset_with(10.0, 0.0, 0, 0);
        let v = revalue(&asset, 10.0, 0);
        assert_eq!(v.price_change_pct, 0.0);
        assert!(v.new_price.is_finite());
    }

    #[test]
    fn delta_bounds_hold_across_input_grid() {
        for &prev in &[10.0, 50.0, 1_000.0] {
            for &new_score in &[-100.0, 0.0, 10.0, 500.0, 1e9] {
                for &age in &[0u64, 86_400, 90 * 86_400] {
                    for &volume in &[0u64, 100, 1_000_000] {
                        let asset = asset_with(25.0, prev, 0, volume);
                        let v = revalue(&asset, new_score, age);
                        assert!(v.price_change_pct >= -MAX_TICK_MOVE);
                        assert!(v.price_change_pct <= MAX_TICK_MOVE);
                        assert!(v.new_price >= PRICE_FLOOR);
                        assert!(v.engagement_score >= ENGAGEMENT_FLOOR);
                    }
                }
            }
        }
    }

    #[test]
    fn non_finite_observation_is_no_signal() {
        let asset = asset_with(10.0, 40.0, 0, 0);
        let v = revalue(&asset, f64::NAN, 0);
        assert_eq!(v.price_change_pct, 0.0);
        assert_eq!(v.engagement_score, 40.0);
    }
}
