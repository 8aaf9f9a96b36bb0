// =============================================================================
// Price Adjuster — spread-adaptive submit-price offset
// =============================================================================
//
// In a calm book the configured base offset applies as-is. Once the spread
// exceeds the adaptive threshold, the offset scales with the spread
// (spread_bps * multiplier), capped at max_adaptive_offset_bps. BUY orders
// pay up (+offset), SELL orders give way (-offset).
// =============================================================================

use crate::config::AdaptivePricing;
use crate::market::analyzer::MarketSnapshot;
use crate::types::{Side, MAX_ORDER_PRICE, MIN_ORDER_PRICE};

/// Computes the submit price from a market price, side, and book snapshot.
#[derive(Debug, Clone)]
pub struct PriceAdjuster {
    cfg: AdaptivePricing,
}

impl PriceAdjuster {
    pub fn new(cfg: AdaptivePricing) -> Self {
        Self { cfg }
    }

    /// Effective offset in bps for the observed spread.
    pub fn effective_offset_bps(&self, spread_bps: f64) -> f64 {
        let base = self.cfg.price_offset_bps;
        if spread_bps <= self.cfg.adaptive_threshold_bps {
            return base;
        }
        (spread_bps * self.cfg.spread_multiplier)
            .max(base)
            .min(self.cfg.max_adaptive_offset_bps)
    }

    /// Apply the spread-adaptive offset to `market_price`.
    ///
    /// Returns the adjusted price (clamped to the venue band, rounded to
    /// 4 decimals) and the effective offset that was applied.
    pub fn adjust_adaptive(
        &self,
        market_price: f64,
        side: Side,
        snapshot: &MarketSnapshot,
    ) -> (f64, f64) {
        let offset_bps = self.effective_offset_bps(snapshot.spread_bps);
        (self.apply_offset(market_price, side, offset_bps), offset_bps)
    }

    /// Apply the base (non-adaptive) offset.
    pub fn adjust(&self, market_price: f64, side: Side) -> f64 {
        self.apply_offset(market_price, side, self.cfg.price_offset_bps)
    }

    fn apply_offset(&self, market_price: f64, side: Side, offset_bps: f64) -> f64 {
        let factor = match side {
            Side::Buy => 1.0 + offset_bps / 10_000.0,
            Side::Sell => 1.0 - offset_bps / 10_000.0,
        };
        let adjusted = (market_price * factor).clamp(MIN_ORDER_PRICE, MAX_ORDER_PRICE);
        round4(adjusted)
    }

    /// Dollar cost of the offset for reporting: shares * (adjusted - market).
    pub fn slippage_cost(shares: f64, adjusted_price: f64, market_price: f64) -> f64 {
        shares * (adjusted_price - market_price)
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::analyzer::MarketSnapshot;

    fn adjuster(base: f64) -> PriceAdjuster {
        PriceAdjuster::new(AdaptivePricing {
            price_offset_bps: base,
            adaptive_threshold_bps: 150.0,
            spread_multiplier: 0.5,
            max_adaptive_offset_bps: 300.0,
        })
    }

    fn snapshot_with_spread(spread_bps: f64) -> MarketSnapshot {
        MarketSnapshot {
            token_id: "tok".to_string(),
            best_ask: 0.51,
            best_bid: 0.49,
            midpoint: 0.50,
            spread_bps,
            ..MarketSnapshot::default()
        }
    }

    #[test]
    fn calm_spread_keeps_base_offset() {
        let adj = adjuster(100.0);
        assert!((adj.effective_offset_bps(150.0) - 100.0).abs() < f64::EPSILON);
        assert!((adj.effective_offset_bps(0.0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn wide_spread_scales_offset() {
        let adj = adjuster(100.0);
        // 400 bps spread * 0.5 = 200 bps effective.
        assert!((adj.effective_offset_bps(400.0) - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn effective_offset_never_drops_below_base_nor_exceeds_cap() {
        let adj = adjuster(100.0);
        // Just over the threshold: spread * mult would be 80 bps, floor at base.
        assert!((adj.effective_offset_bps(160.0) - 100.0).abs() < f64::EPSILON);
        // Far over: capped at 300.
        assert!((adj.effective_offset_bps(5_000.0) - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn buy_pays_up_sell_gives_way() {
        let adj = adjuster(100.0);
        let snap = snapshot_with_spread(50.0);
        let (buy, off_b) = adj.adjust_adaptive(0.50, Side::Buy, &snap);
        let (sell, off_s) = adj.adjust_adaptive(0.50, Side::Sell, &snap);
        assert!((off_b - 100.0).abs() < f64::EPSILON);
        assert!((off_s - 100.0).abs() < f64::EPSILON);
        assert!((buy - 0.505).abs() < 1e-9);
        assert!((sell - 0.495).abs() < 1e-9);
    }

    #[test]
    fn adjusted_price_stays_inside_venue_band() {
        let adj = adjuster(300.0);
        let snap = snapshot_with_spread(0.0);
        let (hi, _) = adj.adjust_adaptive(0.985, Side::Buy, &snap);
        let (lo, _) = adj.adjust_adaptive(0.012, Side::Sell, &snap);
        assert!(hi <= 0.99);
        assert!(lo >= 0.01);
    }

    #[test]
    fn adjusted_price_rounds_to_four_decimals() {
        let adj = adjuster(33.0);
        let snap = snapshot_with_spread(0.0);
        let (p, _) = adj.adjust_adaptive(0.123456, Side::Buy, &snap);
        assert!((p * 10_000.0 - (p * 10_000.0).round()).abs() < 1e-9);
    }

    #[test]
    fn slippage_cost_is_signed() {
        assert!((PriceAdjuster::slippage_cost(100.0, 0.505, 0.50) - 0.5).abs() < 1e-9);
        assert!((PriceAdjuster::slippage_cost(100.0, 0.495, 0.50) + 0.5).abs() < 1e-9);
    }
}
