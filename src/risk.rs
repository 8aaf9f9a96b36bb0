// =============================================================================
// Risk Checker — ordered capital-protection gates plus the kill switch
// =============================================================================
//
// Check order (first failure rejects):
//   1. Kill switch engaged
//   2. Total loss limit (engages the kill switch, then rejects)
//   3. Daily loss limit
//   4. BUY affordability
//   5. BUY spend caps (per token, per market, total holdings; 0 = unlimited)
//   6. SELL position coverage
//
// Approvals can still carry warnings; the aggregate risk level reflects
// them. The kill switch is process-wide and latched: once engaged, every
// check rejects until an explicit reset.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RiskLimits;
use crate::executor::SpendSnapshot;
use crate::types::{OrderSpec, RiskLevel, Side};

/// Balance below which an approval is flagged.
const LOW_BALANCE_WARNING: f64 = 50.0;

// ---------------------------------------------------------------------------
// Kill switch
// ---------------------------------------------------------------------------

/// Process-wide latched trading halt. Engaged once by the risk checker when
/// the total-loss limit is breached; cleared only by an explicit reset.
#[derive(Debug, Default)]
pub struct KillSwitch {
    engaged: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "kill switch engaged — all orders will be rejected");
        *self.reason.write() = Some(reason);
        self.engaged.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.engaged.store(false, Ordering::SeqCst);
        *self.reason.write() = None;
        warn!("kill switch reset");
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }
}

// ---------------------------------------------------------------------------
// Trading state snapshot
// ---------------------------------------------------------------------------

/// Follower-account snapshot handed to the risk gate. Derived per decision,
/// never persisted.
#[derive(Debug, Clone, Default)]
pub struct TradingState {
    pub daily_pnl: f64,
    pub total_pnl: f64,
    pub balance: f64,
    /// Token id -> held quantity.
    pub positions: HashMap<String, f64>,
    pub total_shares: f64,
    pub spend: SpendSnapshot,
}

/// Outcome of a risk check.
#[derive(Debug, Clone, Serialize)]
pub struct RiskDecision {
    pub approved: bool,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub risk_level: RiskLevel,
}

// ---------------------------------------------------------------------------
// Risk checker
// ---------------------------------------------------------------------------

pub struct RiskChecker {
    limits: RiskLimits,
    kill: std::sync::Arc<KillSwitch>,
}

impl RiskChecker {
    pub fn new(limits: RiskLimits, kill: std::sync::Arc<KillSwitch>) -> Self {
        Self { limits, kill }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill
    }

    /// Run every gate against the order. The first hard failure rejects.
    pub fn check(&self, order: &OrderSpec, state: &TradingState) -> RiskDecision {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();
        let cost = order.cost();

        // 1. Kill switch first, always.
        if self.kill.is_engaged() {
            let why = self
                .kill
                .reason()
                .unwrap_or_else(|| "unspecified".to_string());
            reasons.push(format!("kill switch engaged: {why}"));
            return self.rejected(reasons);
        }

        // 2. Total loss — latches the kill switch.
        if state.total_pnl <= -self.limits.max_total_loss {
            let msg = format!(
                "total loss {:.2} breached the {:.2} limit",
                -state.total_pnl, self.limits.max_total_loss
            );
            self.kill.engage(msg.clone());
            reasons.push(msg);
            return self.rejected(reasons);
        }

        // 3. Daily loss.
        if state.daily_pnl <= -self.limits.max_daily_loss {
            reasons.push(format!(
                "daily loss {:.2} breached the {:.2} limit",
                -state.daily_pnl, self.limits.max_daily_loss
            ));
            return self.rejected(reasons);
        }

        match order.side {
            Side::Buy => {
                // 4. Affordability.
                if cost > state.balance {
                    reasons.push(format!(
                        "order cost {:.2} exceeds balance {:.2}",
                        cost, state.balance
                    ));
                    return self.rejected(reasons);
                }

                // 5. Spend caps; a zero limit disables the cap.
                let token_spent = state
                    .spend
                    .token_spend
                    .get(&order.token_id)
                    .copied()
                    .unwrap_or(0.0);
                if self.limits.max_token_spend > 0.0
                    && token_spent + cost > self.limits.max_token_spend
                {
                    reasons.push(format!(
                        "token spend {:.2} + {:.2} would exceed the {:.2} cap",
                        token_spent, cost, self.limits.max_token_spend
                    ));
                    return self.rejected(reasons);
                }

                let market_spent = state
                    .spend
                    .market_spend
                    .get(&order.market_id)
                    .copied()
                    .unwrap_or(0.0);
                if self.limits.max_market_spend > 0.0
                    && market_spent + cost > self.limits.max_market_spend
                {
                    reasons.push(format!(
                        "market spend {:.2} + {:.2} would exceed the {:.2} cap",
                        market_spent, cost, self.limits.max_market_spend
                    ));
                    return self.rejected(reasons);
                }

                if self.limits.total_holdings_limit > 0.0
                    && state.spend.total_holdings_value + cost > self.limits.total_holdings_limit
                {
                    reasons.push(format!(
                        "holdings {:.2} + {:.2} would exceed the {:.2} limit",
                        state.spend.total_holdings_value, cost, self.limits.total_holdings_limit
                    ));
                    return self.rejected(reasons);
                }
            }
            Side::Sell => {
                // 6. Position coverage.
                let held = state
                    .positions
                    .get(&order.token_id)
                    .copied()
                    .unwrap_or(0.0);
                if held - order.size < 0.0 {
                    reasons.push(format!(
                        "sell of {:.2} exceeds held quantity {:.2}",
                        order.size, held
                    ));
                    return self.rejected(reasons);
                }
            }
        }

        // Soft conditions on an approved order.
        let mut daily_70 = false;
        if -state.daily_pnl > 0.7 * self.limits.max_daily_loss {
            daily_70 = true;
            warnings.push(format!(
                "daily loss {:.2} is past 70% of the {:.2} limit",
                -state.daily_pnl, self.limits.max_daily_loss
            ));
        }
        if -state.total_pnl > 0.5 * self.limits.max_total_loss {
            warnings.push(format!(
                "total loss {:.2} is past 50% of the {:.2} limit",
                -state.total_pnl, self.limits.max_total_loss
            ));
        }
        if state.balance < LOW_BALANCE_WARNING {
            warnings.push(format!("balance {:.2} is running low", state.balance));
        }
        if order.side == Side::Buy && cost > 0.2 * state.balance {
            warnings.push(format!(
                "order cost {:.2} is more than 20% of balance {:.2}",
                cost, state.balance
            ));
        }

        let risk_level = if daily_70 || warnings.len() >= 2 {
            RiskLevel::High
        } else if !warnings.is_empty() {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        debug!(
            token = %order.token_id,
            side = %order.side,
            cost,
            risk = %risk_level,
            warnings = warnings.len(),
            "risk check approved"
        );

        RiskDecision {
            approved: true,
            reasons,
            warnings,
            risk_level,
        }
    }

    fn rejected(&self, reasons: Vec<String>) -> RiskDecision {
        warn!(?reasons, "risk check rejected order");
        RiskDecision {
            approved: false,
            reasons,
            warnings: Vec::new(),
            risk_level: RiskLevel::High,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;
    use std::sync::Arc;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_daily_loss: 50.0,
            max_total_loss: 100.0,
            max_token_spend: 0.0,
            max_market_spend: 0.0,
            total_holdings_limit: 0.0,
        }
    }

    fn checker(limits: RiskLimits) -> RiskChecker {
        RiskChecker::new(limits, Arc::new(KillSwitch::new()))
    }

    fn buy(size: f64, price: f64) -> OrderSpec {
        OrderSpec::new("tok", Side::Buy, size, price, OrderType::Limit, None, 0.0, None)
            .with_market("mkt")
    }

    fn sell(size: f64, price: f64) -> OrderSpec {
        OrderSpec::new("tok", Side::Sell, size, price, OrderType::Limit, None, 0.0, None)
            .with_market("mkt")
    }

    fn healthy_state() -> TradingState {
        TradingState {
            balance: 1000.0,
            ..TradingState::default()
        }
    }

    #[test]
    fn healthy_buy_is_approved_low_risk() {
        let d = checker(limits()).check(&buy(100.0, 0.50), &healthy_state());
        assert!(d.approved);
        assert_eq!(d.risk_level, RiskLevel::Low);
        assert!(d.warnings.is_empty());
    }

    #[test]
    fn total_loss_breach_latches_the_kill_switch() {
        let kill = Arc::new(KillSwitch::new());
        let c = RiskChecker::new(limits(), kill.clone());
        let mut state = healthy_state();
        state.total_pnl = -100.0;

        let d = c.check(&buy(10.0, 0.50), &state);
        assert!(!d.approved);
        assert!(kill.is_engaged());
        assert!(kill.reason().unwrap().contains("total loss"));

        // Once latched, even a perfectly healthy order is rejected.
        let d = c.check(&buy(10.0, 0.50), &healthy_state());
        assert!(!d.approved);
        assert!(d.reasons[0].contains("kill switch"));

        // Explicit reset restores trading.
        kill.reset();
        let d = c.check(&buy(10.0, 0.50), &healthy_state());
        assert!(d.approved);
    }

    #[test]
    fn daily_loss_rejects_without_latching() {
        let kill = Arc::new(KillSwitch::new());
        let c = RiskChecker::new(limits(), kill.clone());
        let mut state = healthy_state();
        state.daily_pnl = -50.0;

        let d = c.check(&buy(10.0, 0.50), &state);
        assert!(!d.approved);
        assert!(!kill.is_engaged());
    }

    #[test]
    fn unaffordable_buy_is_rejected() {
        let mut state = healthy_state();
        state.balance = 10.0;
        let d = checker(limits()).check(&buy(100.0, 0.50), &state);
        assert!(!d.approved);
        assert!(d.reasons[0].contains("balance"));
    }

    #[test]
    fn token_spend_cap_counts_prior_spend() {
        let mut l = limits();
        l.max_token_spend = 60.0;
        let mut state = healthy_state();
        state.spend.token_spend.insert("tok".to_string(), 40.0);

        // 40 already spent + 30 more > 60.
        let d = checker(l.clone()).check(&buy(60.0, 0.50), &state);
        assert!(!d.approved);

        // 40 + 15 stays under the cap.
        let d = checker(l).check(&buy(30.0, 0.50), &state);
        assert!(d.approved);
    }

    #[test]
    fn market_spend_and_holdings_caps_reject() {
        let mut l = limits();
        l.max_market_spend = 20.0;
        let mut state = healthy_state();
        state.spend.market_spend.insert("mkt".to_string(), 15.0);
        let d = checker(l).check(&buy(20.0, 0.50), &state);
        assert!(!d.approved);

        let mut l = limits();
        l.total_holdings_limit = 100.0;
        let mut state = healthy_state();
        state.spend.total_holdings_value = 95.0;
        let d = checker(l).check(&buy(20.0, 0.50), &state);
        assert!(!d.approved);
    }

    #[test]
    fn zero_spend_limits_mean_unlimited() {
        let mut state = healthy_state();
        state.spend.token_spend.insert("tok".to_string(), 1_000_000.0);
        state.spend.total_holdings_value = 1_000_000.0;
        let d = checker(limits()).check(&buy(100.0, 0.50), &state);
        assert!(d.approved);
    }

    #[test]
    fn oversell_is_rejected() {
        let mut state = healthy_state();
        state.positions.insert("tok".to_string(), 30.0);
        let d = checker(limits()).check(&sell(40.0, 0.50), &state);
        assert!(!d.approved);
        let d = checker(limits()).check(&sell(30.0, 0.50), &state);
        assert!(d.approved);
    }

    #[test]
    fn warnings_raise_the_risk_level() {
        // One warning (big order) -> medium.
        let d = checker(limits()).check(&buy(500.0, 0.50), &healthy_state());
        assert!(d.approved);
        assert_eq!(d.risk_level, RiskLevel::Medium);

        // 70% daily loss warning -> high.
        let mut state = healthy_state();
        state.daily_pnl = -40.0;
        let d = checker(limits()).check(&buy(10.0, 0.50), &state);
        assert!(d.approved);
        assert_eq!(d.risk_level, RiskLevel::High);
    }
}
