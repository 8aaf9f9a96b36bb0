// =============================================================================
// Market-Condition Checker — gates orders on the state of the book
// =============================================================================
//
// Hard rejects: stale data, spread past the hard limit, divergence past the
// hard limit, not enough near depth for the order. Everything else degrades
// to warnings so the caller can log and proceed.
// =============================================================================

use tracing::debug;

use crate::config::MarketGates;
use crate::market::analyzer::{MarketCondition, MarketSnapshot};
use crate::types::{RiskLevel, Side};

/// Outcome of a market-condition check.
#[derive(Debug, Clone)]
pub struct ConditionDecision {
    pub approved: bool,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub risk_level: RiskLevel,
}

/// Stateless gate over a [`MarketSnapshot`].
#[derive(Debug, Clone)]
pub struct ConditionChecker {
    cfg: MarketGates,
}

impl ConditionChecker {
    pub fn new(cfg: MarketGates) -> Self {
        Self { cfg }
    }

    /// Check a snapshot, optionally against an intended order size.
    pub fn check(
        &self,
        snapshot: &MarketSnapshot,
        order_size: Option<f64>,
        side: Side,
    ) -> ConditionDecision {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        if snapshot.condition == MarketCondition::Stale {
            reasons.push("market data is stale".to_string());
        }

        if snapshot.spread_bps > self.cfg.max_spread_bps {
            reasons.push(format!(
                "spread {:.0} bps exceeds the {:.0} bps limit",
                snapshot.spread_bps, self.cfg.max_spread_bps
            ));
        } else if snapshot.spread_bps > self.cfg.wide_spread_threshold_bps {
            warnings.push(format!(
                "spread {:.0} bps is unusually wide",
                snapshot.spread_bps
            ));
        }

        if snapshot.divergence_bps > self.cfg.max_divergence_bps {
            reasons.push(format!(
                "price diverges {:.0} bps from the leader fill (limit {:.0})",
                snapshot.divergence_bps, self.cfg.max_divergence_bps
            ));
        } else if snapshot.divergence_bps > 0.6 * self.cfg.max_divergence_bps {
            warnings.push(format!(
                "divergence {:.0} bps is approaching the limit",
                snapshot.divergence_bps
            ));
        }

        // Depth checks only apply when the book reported depth at all; a
        // zero reading means the snapshot came from the price fallback.
        let near_depth = match side {
            Side::Buy => snapshot.ask_depth_near,
            Side::Sell => snapshot.bid_depth_near,
        };
        if let Some(size) = order_size {
            if near_depth > 0.0 {
                if near_depth < self.cfg.min_depth_shares {
                    reasons.push(format!(
                        "only {:.0} shares near the top of the book (need {:.0})",
                        near_depth, self.cfg.min_depth_shares
                    ));
                } else if size > 0.5 * near_depth {
                    warnings.push(format!(
                        "order of {:.0} shares is more than half the near depth ({:.0})",
                        size, near_depth
                    ));
                }
            }
        }

        let approved = reasons.is_empty();
        let risk_level = if snapshot.is_volatile {
            RiskLevel::High
        } else if !warnings.is_empty() {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        debug!(
            token = %snapshot.token_id,
            condition = %snapshot.condition,
            approved,
            risk = %risk_level,
            "market condition checked"
        );

        ConditionDecision {
            approved,
            reasons,
            warnings,
            risk_level,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::analyzer::MarketSnapshot;

    fn checker() -> ConditionChecker {
        ConditionChecker::new(MarketGates::default())
    }

    fn snap() -> MarketSnapshot {
        MarketSnapshot {
            token_id: "tok".to_string(),
            best_ask: 0.51,
            best_bid: 0.49,
            midpoint: 0.50,
            spread: 0.02,
            spread_bps: 200.0,
            bid_depth_near: 100.0,
            ask_depth_near: 100.0,
            ..MarketSnapshot::default()
        }
    }

    #[test]
    fn spread_just_under_limit_passes_just_over_rejects() {
        let mut s = snap();
        s.spread_bps = 790.0;
        assert!(checker().check(&s, Some(10.0), Side::Buy).approved);
        s.spread_bps = 810.0;
        assert!(!checker().check(&s, Some(10.0), Side::Buy).approved);
    }

    #[test]
    fn stale_snapshot_is_rejected() {
        let mut s = snap();
        s.condition = MarketCondition::Stale;
        let d = checker().check(&s, None, Side::Buy);
        assert!(!d.approved);
        assert!(d.reasons.iter().any(|r| r.contains("stale")));
    }

    #[test]
    fn divergence_past_limit_rejects_and_near_limit_warns() {
        let mut s = snap();
        s.divergence_bps = 600.0;
        assert!(!checker().check(&s, None, Side::Buy).approved);

        s.divergence_bps = 350.0; // > 0.6 * 500
        let d = checker().check(&s, None, Side::Buy);
        assert!(d.approved);
        assert!(!d.warnings.is_empty());
        assert_eq!(d.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn thin_relevant_side_rejects_sized_orders() {
        let mut s = snap();
        s.ask_depth_near = 4.0;
        let d = checker().check(&s, Some(10.0), Side::Buy);
        assert!(!d.approved);
        // The bid side is what matters for a SELL; that one is fine.
        let d = checker().check(&s, Some(10.0), Side::Sell);
        assert!(d.approved);
    }

    #[test]
    fn zero_depth_means_no_data_and_no_depth_reject() {
        let mut s = snap();
        s.ask_depth_near = 0.0;
        s.bid_depth_near = 0.0;
        let d = checker().check(&s, Some(1000.0), Side::Buy);
        assert!(d.approved);
    }

    #[test]
    fn big_order_against_small_depth_warns() {
        let s = snap();
        let d = checker().check(&s, Some(60.0), Side::Buy);
        assert!(d.approved);
        assert!(d.warnings.iter().any(|w| w.contains("half")));
    }

    #[test]
    fn volatile_snapshot_is_high_risk_even_if_approved() {
        let mut s = snap();
        s.is_volatile = true;
        let d = checker().check(&s, None, Side::Buy);
        assert!(d.approved);
        assert_eq!(d.risk_level, RiskLevel::High);
    }
}
