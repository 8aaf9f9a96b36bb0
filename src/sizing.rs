// =============================================================================
// Copy-Size Calculator — turns a leader fill into a follower share count
// =============================================================================
//
// BUY strategies:
//   proportional_to_portfolio  shares = balance * pct / price
//   proportional_to_trader     shares = delta * balance / leader_value
//   fixed                      shares = balance * pct / price (ignores delta)
//
// SELL strategies need a live follower position:
//   proportional  shares = follower_pos * (delta / leader_previous_qty)
//   full_exit     shares = follower_pos
//   match_delta   shares = min(delta, follower_pos)
//
// Post-calc adjustments run in a fixed order (cap, minimum, rounding,
// affordability) so the result is deterministic for a given input.
// =============================================================================

use tracing::debug;

use crate::config::{SizingConfig, VENUE_MIN_ORDER_SIZE};
use crate::market::analyzer::MarketSnapshot;
use crate::types::{BelowMinAction, SellStrategy, Side, SizingMethod};

/// Floor `v` to two decimal places.
fn floor2(v: f64) -> f64 {
    (v * 100.0).floor() / 100.0
}

/// A leader position change as seen by the orchestrator.
#[derive(Debug, Clone)]
pub struct LeaderChange {
    pub side: Side,
    /// Shares the leader traded; positive.
    pub delta: f64,
    /// Leader's holding in the token before this trade, when known.
    pub previous_qty: Option<f64>,
}

/// Computed follower size plus the human-readable adjustments applied.
#[derive(Debug, Clone)]
pub struct SizeDecision {
    pub shares: f64,
    pub notes: Vec<String>,
}

impl SizeDecision {
    pub fn skipped(&self) -> bool {
        self.shares <= 0.0
    }
}

/// Stateless sizing logic configured once at startup.
#[derive(Debug, Clone)]
pub struct SizeCalculator {
    cfg: SizingConfig,
}

impl SizeCalculator {
    pub fn new(cfg: SizingConfig) -> Self {
        Self { cfg }
    }

    // -------------------------------------------------------------------------
    // Copy gate
    // -------------------------------------------------------------------------

    /// Decide whether a leader change is worth copying at all.
    pub fn should_copy(&self, change: &LeaderChange, follower_pos: f64) -> (bool, Option<String>) {
        if change.delta < 1.0 {
            return (
                false,
                Some(format!("leader delta {:.2} is below 1 share", change.delta)),
            );
        }
        if change.side == Side::Sell && follower_pos <= 0.0 {
            return (false, Some("no follower position to sell".to_string()));
        }
        (true, None)
    }

    // -------------------------------------------------------------------------
    // BUY sizing
    // -------------------------------------------------------------------------

    /// Size a BUY copy.
    ///
    /// `leader_portfolio_value` feeds the trader-proportional strategy; when
    /// it is unknown the strategy degrades to a 10 % mirror of the delta.
    pub fn calculate_buy(
        &self,
        leader_delta: f64,
        price: f64,
        balance: f64,
        leader_portfolio_value: Option<f64>,
    ) -> SizeDecision {
        let mut notes = Vec::new();

        let mut shares = match self.cfg.method {
            SizingMethod::ProportionalToPortfolio | SizingMethod::Fixed => {
                balance * self.cfg.portfolio_percent / 100.0 / price
            }
            SizingMethod::ProportionalToTrader => match leader_portfolio_value {
                Some(value) if value > 0.0 => leader_delta * balance / value,
                _ => {
                    notes.push("leader portfolio value unknown; mirroring 10% of delta".to_string());
                    0.1 * leader_delta
                }
            },
        };

        // 1. Per-token cap.
        if self.cfg.max_position_per_token > 0.0 && shares > self.cfg.max_position_per_token {
            notes.push(format!(
                "capped from {:.2} to per-token limit {:.2}",
                shares, self.cfg.max_position_per_token
            ));
            shares = self.cfg.max_position_per_token;
        }

        // 2. Minimum order size.
        if shares < self.cfg.min_order_size {
            match self.cfg.below_min_action {
                BelowMinAction::Skip => {
                    notes.push(format!(
                        "size {:.2} below minimum {:.2}; skipping",
                        shares, self.cfg.min_order_size
                    ));
                    return SizeDecision { shares: 0.0, notes };
                }
                BelowMinAction::BuyAtMin => {
                    let min = self.cfg.min_order_size.max(VENUE_MIN_ORDER_SIZE);
                    notes.push(format!("size {:.2} bumped to minimum {:.2}", shares, min));
                    shares = min;
                }
            }
        }

        // 3. Round down to 0.01 shares.
        shares = floor2(shares);

        // 4. Affordability clamp.
        if shares * price > balance {
            let affordable = floor2(balance / price);
            notes.push(format!(
                "clamped from {:.2} to affordable {:.2} (balance {:.2})",
                shares, affordable, balance
            ));
            shares = affordable;
        }

        debug!(shares, price, balance, "buy size computed");
        SizeDecision { shares, notes }
    }

    // -------------------------------------------------------------------------
    // SELL sizing
    // -------------------------------------------------------------------------

    /// Size a SELL copy against the follower's current position.
    pub fn calculate_sell(&self, change: &LeaderChange, follower_pos: f64) -> SizeDecision {
        let mut notes = Vec::new();

        let mut shares = match self.cfg.sell_strategy {
            SellStrategy::Proportional => match change.previous_qty {
                Some(prev) if prev > 0.0 => follower_pos * (change.delta / prev),
                _ => {
                    notes.push(
                        "leader prior quantity unknown; matching delta instead".to_string(),
                    );
                    change.delta.min(follower_pos)
                }
            },
            SellStrategy::FullExit => follower_pos,
            SellStrategy::MatchDelta => change.delta.min(follower_pos),
        };

        // Cannot sell more than we hold.
        if shares > follower_pos {
            shares = follower_pos;
        }

        shares = floor2(shares);

        // Below-minimum sells are only allowed when they close the position.
        let closes_position = follower_pos - shares < 0.01;
        if shares < self.cfg.min_order_size && !closes_position {
            notes.push(format!(
                "sell size {:.2} below minimum {:.2} and would not close the position; skipping",
                shares, self.cfg.min_order_size
            ));
            return SizeDecision { shares: 0.0, notes };
        }

        debug!(shares, follower_pos, "sell size computed");
        SizeDecision { shares, notes }
    }

    // -------------------------------------------------------------------------
    // Depth adjustment
    // -------------------------------------------------------------------------

    /// Shrink an order that would punch through the near book.
    ///
    /// A zero near-depth means the book gave us no data; the size passes
    /// through untouched. Otherwise the order is reduced to 80 % of the
    /// available depth (never below the minimum order size, never above the
    /// original request).
    pub fn adjust_for_depth(
        &self,
        shares: f64,
        snapshot: &MarketSnapshot,
        side: Side,
    ) -> (f64, Option<String>) {
        let near_depth = match side {
            Side::Buy => snapshot.ask_depth_near,
            Side::Sell => snapshot.bid_depth_near,
        };

        if near_depth <= 0.0 || shares <= near_depth {
            return (shares, None);
        }

        let reduced = floor2(0.8 * near_depth)
            .max(self.cfg.min_order_size)
            .min(shares);
        let note = format!(
            "reduced {:.2} -> {:.2}: only {:.2} shares near the top of the {} book",
            shares,
            reduced,
            near_depth,
            match side {
                Side::Buy => "ask",
                Side::Sell => "bid",
            }
        );
        (reduced, Some(note))
    }

    // -------------------------------------------------------------------------
    // Adaptive expiration
    // -------------------------------------------------------------------------

    /// Halve the resting time of orders placed into a volatile book.
    pub fn adaptive_expiration(&self, snapshot: &MarketSnapshot, base_secs: u64) -> u64 {
        if !snapshot.is_volatile {
            return base_secs;
        }
        (base_secs / 2).max(5)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::analyzer::MarketSnapshot;
    use crate::types::BelowMinAction;

    fn calc(cfg: SizingConfig) -> SizeCalculator {
        SizeCalculator::new(cfg)
    }

    fn default_cfg() -> SizingConfig {
        SizingConfig {
            portfolio_percent: 5.0,
            min_order_size: 5.0,
            ..SizingConfig::default()
        }
    }

    fn snapshot_with_depth(bid_depth: f64, ask_depth: f64) -> MarketSnapshot {
        MarketSnapshot {
            bid_depth_near: bid_depth,
            ask_depth_near: ask_depth,
            ..MarketSnapshot::default()
        }
    }

    // --- BUY sizing -------------------------------------------------------

    #[test]
    fn portfolio_five_percent_of_1000_at_half_dollar_is_100_shares() {
        let d = calc(default_cfg()).calculate_buy(500.0, 0.50, 1000.0, Some(10_000.0));
        assert!((d.shares - 100.0).abs() < 1e-9);
    }

    #[test]
    fn trader_proportional_scales_by_portfolio_ratio() {
        let cfg = SizingConfig {
            method: SizingMethod::ProportionalToTrader,
            ..default_cfg()
        };
        // Leader traded 500 shares out of a $10k book; we have $1k.
        let d = calc(cfg).calculate_buy(500.0, 0.50, 1000.0, Some(10_000.0));
        assert!((d.shares - 50.0).abs() < 1e-9);
    }

    #[test]
    fn trader_proportional_falls_back_when_leader_value_unknown() {
        let cfg = SizingConfig {
            method: SizingMethod::ProportionalToTrader,
            ..default_cfg()
        };
        let d = calc(cfg).calculate_buy(500.0, 0.50, 1000.0, None);
        assert!((d.shares - 50.0).abs() < 1e-9);
        assert!(!d.notes.is_empty());
    }

    #[test]
    fn below_min_skip_returns_zero() {
        let cfg = SizingConfig {
            portfolio_percent: 0.1,
            below_min_action: BelowMinAction::Skip,
            ..default_cfg()
        };
        // 1000 * 0.001 / 0.50 = 2 shares < 5 minimum.
        let d = calc(cfg).calculate_buy(100.0, 0.50, 1000.0, None);
        assert!(d.skipped());
    }

    #[test]
    fn below_min_buy_at_min_bumps_to_floor() {
        let cfg = SizingConfig {
            portfolio_percent: 0.1,
            below_min_action: BelowMinAction::BuyAtMin,
            ..default_cfg()
        };
        let d = calc(cfg).calculate_buy(100.0, 0.50, 1000.0, None);
        assert!((d.shares - 5.0).abs() < 1e-9);
    }

    #[test]
    fn per_token_cap_applies_before_rounding() {
        let cfg = SizingConfig {
            max_position_per_token: 40.0,
            ..default_cfg()
        };
        let d = calc(cfg).calculate_buy(500.0, 0.50, 1000.0, None);
        assert!((d.shares - 40.0).abs() < 1e-9);
    }

    #[test]
    fn unaffordable_buy_clamps_to_balance() {
        let cfg = SizingConfig {
            portfolio_percent: 0.1,
            below_min_action: BelowMinAction::BuyAtMin,
            ..default_cfg()
        };
        // Computed size bumps to the 5-share minimum, but 5 * 0.60 = $3.00
        // exceeds the $2 balance; clamps to floor(2 / 0.60) = 3.33 shares.
        let d = calc(cfg).calculate_buy(100.0, 0.60, 2.0, None);
        assert!((d.shares - 3.33).abs() < 1e-9);
        assert!(d.shares * 0.60 <= 2.0 + 1e-9);
    }

    // --- SELL sizing ------------------------------------------------------

    #[test]
    fn proportional_sell_mirrors_leader_fraction() {
        // Leader held 1000, sold 500; follower holds 100 => sells 50.
        let change = LeaderChange {
            side: Side::Sell,
            delta: 500.0,
            previous_qty: Some(1000.0),
        };
        let d = calc(default_cfg()).calculate_sell(&change, 100.0);
        assert!((d.shares - 50.0).abs() < 1e-9);
    }

    #[test]
    fn full_exit_sells_everything() {
        let cfg = SizingConfig {
            sell_strategy: SellStrategy::FullExit,
            ..default_cfg()
        };
        let change = LeaderChange {
            side: Side::Sell,
            delta: 10.0,
            previous_qty: Some(1000.0),
        };
        let d = calc(cfg).calculate_sell(&change, 72.5);
        assert!((d.shares - 72.5).abs() < 1e-9);
    }

    #[test]
    fn match_delta_caps_at_follower_position() {
        let cfg = SizingConfig {
            sell_strategy: SellStrategy::MatchDelta,
            ..default_cfg()
        };
        let change = LeaderChange {
            side: Side::Sell,
            delta: 500.0,
            previous_qty: Some(1000.0),
        };
        let d = calc(cfg).calculate_sell(&change, 30.0);
        assert!((d.shares - 30.0).abs() < 1e-9);
    }

    #[test]
    fn tiny_sell_allowed_only_when_closing() {
        let change = LeaderChange {
            side: Side::Sell,
            delta: 30.0,
            previous_qty: Some(1000.0),
        };
        // 100 * 30/1000 = 3 shares, below the 5-share minimum, position stays open.
        let d = calc(default_cfg()).calculate_sell(&change, 100.0);
        assert!(d.skipped());

        // Follower holds only 3 shares; a full exit below minimum is fine.
        let cfg = SizingConfig {
            sell_strategy: SellStrategy::FullExit,
            ..default_cfg()
        };
        let d = calc(cfg).calculate_sell(&change, 3.0);
        assert!((d.shares - 3.0).abs() < 1e-9);
    }

    // --- Copy gate --------------------------------------------------------

    #[test]
    fn sub_share_deltas_are_not_copied() {
        let change = LeaderChange {
            side: Side::Buy,
            delta: 0.5,
            previous_qty: None,
        };
        let (ok, reason) = calc(default_cfg()).should_copy(&change, 0.0);
        assert!(!ok);
        assert!(reason.is_some());
    }

    #[test]
    fn sell_without_position_is_not_copied() {
        let change = LeaderChange {
            side: Side::Sell,
            delta: 100.0,
            previous_qty: Some(500.0),
        };
        let (ok, _) = calc(default_cfg()).should_copy(&change, 0.0);
        assert!(!ok);
        let (ok, _) = calc(default_cfg()).should_copy(&change, 10.0);
        assert!(ok);
    }

    // --- Depth adjustment -------------------------------------------------

    #[test]
    fn depth_adjust_never_grows_and_is_identity_within_depth() {
        let c = calc(default_cfg());
        let snap = snapshot_with_depth(0.0, 200.0);
        let (size, note) = c.adjust_for_depth(150.0, &snap, Side::Buy);
        assert!((size - 150.0).abs() < 1e-9);
        assert!(note.is_none());
    }

    #[test]
    fn depth_adjust_zero_depth_means_no_data() {
        let c = calc(default_cfg());
        let snap = snapshot_with_depth(0.0, 0.0);
        let (size, note) = c.adjust_for_depth(500.0, &snap, Side::Buy);
        assert!((size - 500.0).abs() < 1e-9);
        assert!(note.is_none());
    }

    #[test]
    fn depth_adjust_shrinks_to_80_percent_of_depth() {
        let c = calc(default_cfg());
        let snap = snapshot_with_depth(50.0, 0.0);
        let (size, note) = c.adjust_for_depth(100.0, &snap, Side::Sell);
        assert!((size - 40.0).abs() < 1e-9);
        assert!(note.is_some());
        assert!(size <= 100.0);
    }

    // --- Adaptive expiration ----------------------------------------------

    #[test]
    fn volatile_books_halve_expiration_with_floor() {
        let c = calc(default_cfg());
        let mut snap = MarketSnapshot::default();
        assert_eq!(c.adaptive_expiration(&snap, 60), 60);
        snap.is_volatile = true;
        assert_eq!(c.adaptive_expiration(&snap, 60), 30);
        assert_eq!(c.adaptive_expiration(&snap, 6), 5);
    }
}
