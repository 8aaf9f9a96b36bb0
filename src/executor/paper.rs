// =============================================================================
// Paper Executor — deterministic local fill simulator
// =============================================================================
//
// Fill semantics:
//   BUY  — fills min(requested, affordable) at the order price, where
//          affordable is floor(balance / price) whole shares. Partial fills
//          happen when the balance runs out; an order that cannot afford a
//          single share fails.
//   SELL — fills min(requested, held) at the order price. Realized P&L is
//          filled * (price - avg entry). A position that reaches zero is
//          deleted, which also clears its entry price.
//
// The entry price records the first BUY that opened the position and is
// unchanged by averaging-in; the average price is the size-weighted mean.
//
// All account state sits behind one mutex: buy averaging and sell P&L are
// not re-entrant, and two events for the same token must serialize.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{Executor, SpendSnapshot};
use crate::types::{OrderResult, OrderSpec, OrderStatus, OrderType, Side, TradingMode};

/// Quantities below this are treated as a closed position.
const QTY_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// A simulated holding in one token.
#[derive(Debug, Clone, Serialize)]
pub struct PaperPosition {
    pub token_id: String,
    pub market_id: String,
    pub quantity: f64,
    /// Size-weighted average cost per share.
    pub avg_price: f64,
    /// Total USD paid for the current holding.
    pub total_cost: f64,
    /// Price of the first BUY that opened this position. Stable across
    /// averaging-in; reset only when the position closes.
    pub entry_price: f64,
    pub opened_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Account state
// ---------------------------------------------------------------------------

struct PaperState {
    balance: f64,
    positions: HashMap<String, PaperPosition>,
    total_pnl: f64,
    daily_pnl: f64,
    daily_date: String,
    spend: SpendSnapshot,
}

impl PaperState {
    /// Reset the daily P&L when the UTC date rolls over.
    fn maybe_roll_daily(&mut self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if self.daily_date != today {
            info!(old = %self.daily_date, new = %today, "paper daily P&L reset");
            self.daily_date = today;
            self.daily_pnl = 0.0;
        }
    }
}

/// Deterministic stand-in for a live venue adapter.
pub struct PaperExecutor {
    state: Mutex<PaperState>,
}

impl PaperExecutor {
    pub fn new(starting_balance: f64) -> Self {
        info!(starting_balance, "paper executor initialised");
        Self {
            state: Mutex::new(PaperState {
                balance: starting_balance,
                positions: HashMap::new(),
                total_pnl: 0.0,
                daily_pnl: 0.0,
                daily_date: Utc::now().format("%Y-%m-%d").to_string(),
                spend: SpendSnapshot::default(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Fill logic
    // -------------------------------------------------------------------------

    fn fill_buy(&self, order: &OrderSpec) -> OrderResult {
        let mut s = self.state.lock();
        s.maybe_roll_daily();

        let placed_at_ms = Utc::now().timestamp_millis();
        let price = order.price;

        // Whole-share affordability guard, then a fractional fill.
        let affordable = (s.balance / price).floor();
        if affordable < 1.0 {
            warn!(
                token = %order.token_id,
                balance = s.balance,
                price,
                "buy rejected: insufficient balance"
            );
            return failed_result(
                order,
                placed_at_ms,
                format!(
                    "Insufficient balance: {:.2} cannot cover one share at {:.4}",
                    s.balance, price
                ),
            );
        }

        let filled = order.size.min(affordable);
        let cost = filled * price;
        s.balance -= cost;

        let now_ms = Utc::now().timestamp_millis();
        let pos = s
            .positions
            .entry(order.token_id.clone())
            .or_insert_with(|| PaperPosition {
                token_id: order.token_id.clone(),
                market_id: order.market_id.clone(),
                quantity: 0.0,
                avg_price: 0.0,
                total_cost: 0.0,
                entry_price: price,
                opened_at_ms: now_ms,
            });

        let new_qty = pos.quantity + filled;
        pos.avg_price = (pos.quantity * pos.avg_price + cost) / new_qty;
        pos.quantity = new_qty;
        pos.total_cost += cost;

        // Spend tracking.
        *s.spend.token_spend.entry(order.token_id.clone()).or_insert(0.0) += cost;
        *s.spend.market_spend.entry(order.market_id.clone()).or_insert(0.0) += cost;
        s.spend.total_holdings_value += cost;

        let status = if filled + QTY_EPSILON >= order.size {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };

        info!(
            token = %order.token_id,
            filled,
            requested = order.size,
            price,
            balance = s.balance,
            status = %status,
            "paper buy filled"
        );

        OrderResult {
            order_id: Uuid::new_v4().to_string(),
            status,
            filled_size: filled,
            remaining_size: (order.size - filled).max(0.0),
            avg_fill_price: price,
            error: None,
            placed_at_ms,
            executed_at_ms: Some(Utc::now().timestamp_millis()),
            mode: TradingMode::Paper,
            order_type: order.order_type,
            expired: false,
        }
    }

    fn fill_sell(&self, order: &OrderSpec) -> OrderResult {
        let mut s = self.state.lock();
        s.maybe_roll_daily();

        let placed_at_ms = Utc::now().timestamp_millis();
        let price = order.price;

        let Some(pos) = s.positions.get_mut(&order.token_id) else {
            warn!(token = %order.token_id, "sell rejected: no position");
            return failed_result(
                order,
                placed_at_ms,
                format!("No position in token {}", order.token_id),
            );
        };

        let filled = order.size.min(pos.quantity);
        let avg_entry = pos.avg_price;
        let proceeds = filled * price;
        let realized = filled * (price - avg_entry);

        pos.quantity -= filled;
        pos.total_cost -= filled * avg_entry;
        let closed = pos.quantity <= QTY_EPSILON;
        if closed {
            s.positions.remove(&order.token_id);
        }

        s.balance += proceeds;
        s.total_pnl += realized;
        s.daily_pnl += realized;
        s.spend.total_holdings_value = (s.spend.total_holdings_value - filled * avg_entry).max(0.0);

        let status = if filled + QTY_EPSILON >= order.size {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };

        info!(
            token = %order.token_id,
            filled,
            requested = order.size,
            price,
            realized,
            closed,
            status = %status,
            "paper sell filled"
        );

        OrderResult {
            order_id: Uuid::new_v4().to_string(),
            status,
            filled_size: filled,
            remaining_size: (order.size - filled).max(0.0),
            avg_fill_price: price,
            error: None,
            placed_at_ms,
            executed_at_ms: Some(Utc::now().timestamp_millis()),
            mode: TradingMode::Paper,
            order_type: order.order_type,
            expired: false,
        }
    }
}

fn failed_result(order: &OrderSpec, placed_at_ms: i64, error: String) -> OrderResult {
    OrderResult {
        order_id: Uuid::new_v4().to_string(),
        status: OrderStatus::Failed,
        filled_size: 0.0,
        remaining_size: order.size,
        avg_fill_price: 0.0,
        error: Some(error),
        placed_at_ms,
        executed_at_ms: None,
        mode: TradingMode::Paper,
        order_type: order.order_type,
        expired: false,
    }
}

// ---------------------------------------------------------------------------
// Executor impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Executor for PaperExecutor {
    async fn execute(&self, order: &OrderSpec) -> OrderResult {
        debug!(token = %order.token_id, side = %order.side, size = order.size, "paper execute");
        match order.side {
            Side::Buy => self.fill_buy(order),
            Side::Sell => self.fill_sell(order),
        }
    }

    async fn balance(&self) -> f64 {
        self.state.lock().balance
    }

    async fn position(&self, token_id: &str) -> f64 {
        self.state
            .lock()
            .positions
            .get(token_id)
            .map(|p| p.quantity)
            .unwrap_or(0.0)
    }

    async fn all_positions(&self) -> HashMap<String, f64> {
        self.state
            .lock()
            .positions
            .iter()
            .map(|(token, pos)| (token.clone(), pos.quantity))
            .collect()
    }

    async fn all_position_details(&self) -> HashMap<String, PaperPosition> {
        self.state.lock().positions.clone()
    }

    async fn position_detail(&self, token_id: &str) -> Option<PaperPosition> {
        self.state.lock().positions.get(token_id).cloned()
    }

    fn mode(&self) -> TradingMode {
        TradingMode::Paper
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn total_pnl(&self) -> f64 {
        self.state.lock().total_pnl
    }

    fn daily_pnl(&self) -> f64 {
        let mut s = self.state.lock();
        s.maybe_roll_daily();
        s.daily_pnl
    }

    fn spend_snapshot(&self) -> Option<SpendSnapshot> {
        Some(self.state.lock().spend.clone())
    }

    async fn sell_all_positions(&self, prices: &HashMap<String, f64>) -> Vec<(String, OrderResult)> {
        let open: Vec<(String, String, f64, f64)> = {
            let s = self.state.lock();
            s.positions
                .values()
                .map(|p| (p.token_id.clone(), p.market_id.clone(), p.quantity, p.avg_price))
                .collect()
        };

        let mut results = Vec::with_capacity(open.len());
        for (token, market, quantity, avg_price) in open {
            let price = prices.get(&token).copied().unwrap_or(avg_price);
            let order = OrderSpec::new(
                token.clone(),
                Side::Sell,
                quantity,
                price,
                OrderType::Market,
                None,
                0.0,
                None,
            )
            .with_market(market);
            results.push((token, self.fill_sell(&order)));
        }
        results
    }
}

impl std::fmt::Debug for PaperExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("PaperExecutor")
            .field("balance", &s.balance)
            .field("open_positions", &s.positions.len())
            .field("total_pnl", &s.total_pnl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn buy(token: &str, size: f64, price: f64) -> OrderSpec {
        OrderSpec::new(token, Side::Buy, size, price, OrderType::Limit, None, 0.0, None)
            .with_market("mkt")
    }

    fn sell(token: &str, size: f64, price: f64) -> OrderSpec {
        OrderSpec::new(token, Side::Sell, size, price, OrderType::Limit, None, 0.0, None)
            .with_market("mkt")
    }

    #[tokio::test]
    async fn buy_then_sell_round_trips_balance_and_pnl() {
        let exec = PaperExecutor::new(1000.0);
        let r = exec.execute(&buy("tok", 100.0, 0.50)).await;
        assert_eq!(r.status, OrderStatus::Filled);
        assert!((exec.balance().await - 950.0).abs() < 1e-9);

        let r = exec.execute(&sell("tok", 100.0, 0.60)).await;
        assert_eq!(r.status, OrderStatus::Filled);
        // 100 * (0.60 - 0.50) = 10 profit; balance 950 + 60 = 1010.
        assert!((exec.balance().await - 1010.0).abs() < 1e-9);
        assert!((exec.total_pnl() - 10.0).abs() < 1e-9);
        assert!((exec.position("tok").await - 0.0).abs() < f64::EPSILON);
        assert!(exec.position_detail("tok").await.is_none());
    }

    #[tokio::test]
    async fn partial_fill_when_balance_runs_out() {
        let exec = PaperExecutor::new(50.0);
        let r = exec.execute(&buy("tok", 200.0, 0.50)).await;
        assert_eq!(r.status, OrderStatus::Partial);
        assert!((r.filled_size - 100.0).abs() < 1e-9);
        assert!((r.remaining_size - 100.0).abs() < 1e-9);
        assert!(exec.balance().await.abs() < 1e-9);
    }

    #[tokio::test]
    async fn unaffordable_buy_fails_with_reason() {
        let exec = PaperExecutor::new(0.50);
        let r = exec.execute(&buy("tok", 100.0, 0.60)).await;
        assert_eq!(r.status, OrderStatus::Failed);
        assert!(r.error.unwrap().contains("Insufficient"));
        assert!((exec.balance().await - 0.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn entry_price_is_stable_and_avg_is_weighted() {
        let exec = PaperExecutor::new(1000.0);
        exec.execute(&buy("tok", 100.0, 0.40)).await;
        exec.execute(&buy("tok", 100.0, 0.60)).await;

        let detail = exec.position_detail("tok").await.unwrap();
        assert!((detail.entry_price - 0.40).abs() < 1e-9);
        assert!((detail.avg_price - 0.50).abs() < 1e-9);
        assert!((detail.quantity - 200.0).abs() < 1e-9);
        assert!((detail.total_cost - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn entry_price_resets_after_position_closes() {
        let exec = PaperExecutor::new(1000.0);
        exec.execute(&buy("tok", 50.0, 0.40)).await;
        exec.execute(&sell("tok", 50.0, 0.45)).await;
        // Re-open at a different price: fresh entry.
        exec.execute(&buy("tok", 50.0, 0.70)).await;
        let detail = exec.position_detail("tok").await.unwrap();
        assert!((detail.entry_price - 0.70).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_without_position_fails() {
        let exec = PaperExecutor::new(100.0);
        let r = exec.execute(&sell("tok", 10.0, 0.50)).await;
        assert_eq!(r.status, OrderStatus::Failed);
        assert!(r.error.unwrap().contains("No position"));
    }

    #[tokio::test]
    async fn oversized_sell_caps_at_held_quantity() {
        let exec = PaperExecutor::new(100.0);
        exec.execute(&buy("tok", 40.0, 0.50)).await;
        let r = exec.execute(&sell("tok", 100.0, 0.55)).await;
        assert_eq!(r.status, OrderStatus::Partial);
        assert!((r.filled_size - 40.0).abs() < 1e-9);
        assert!((exec.position("tok").await - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn spend_tracker_accumulates_and_unwinds() {
        let exec = PaperExecutor::new(1000.0);
        exec.execute(&buy("tok", 100.0, 0.50)).await;
        let spend = exec.spend_snapshot().unwrap();
        assert!((spend.token_spend["tok"] - 50.0).abs() < 1e-9);
        assert!((spend.market_spend["mkt"] - 50.0).abs() < 1e-9);
        assert!((spend.total_holdings_value - 50.0).abs() < 1e-9);

        exec.execute(&sell("tok", 100.0, 0.60)).await;
        let spend = exec.spend_snapshot().unwrap();
        // Holdings unwind at cost; buy-side spend history remains.
        assert!(spend.total_holdings_value.abs() < 1e-9);
        assert!((spend.token_spend["tok"] - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_all_positions_drains_and_second_call_is_empty() {
        let exec = PaperExecutor::new(1000.0);
        exec.execute(&buy("tok1", 50.0, 0.40)).await;
        exec.execute(&buy("tok2", 30.0, 0.60)).await;

        let mut prices = HashMap::new();
        prices.insert("tok1".to_string(), 0.50);

        let results = exec.sell_all_positions(&prices).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.status == OrderStatus::Filled));
        // tok1 sold at the mapped price, tok2 fell back to its avg price.
        assert!((exec.total_pnl() - 5.0).abs() < 1e-9);

        let again = exec.sell_all_positions(&prices).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn quantities_never_go_negative() {
        let exec = PaperExecutor::new(1000.0);
        exec.execute(&buy("tok", 10.0, 0.50)).await;
        exec.execute(&sell("tok", 7.0, 0.50)).await;
        exec.execute(&sell("tok", 7.0, 0.50)).await;
        let positions = exec.all_positions().await;
        assert!(positions.values().all(|&q| q >= 0.0));
        assert!((exec.balance().await - 1000.0).abs() < 1e-9);
    }
}
