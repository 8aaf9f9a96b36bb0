// =============================================================================
// Executor seam — the boundary a live venue adapter plugs into
// =============================================================================

pub mod paper;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

pub use paper::{PaperExecutor, PaperPosition};

use crate::types::{OrderResult, OrderSpec, TradingMode};

/// Running spend totals maintained across fills. The risk gate reads these
/// to enforce per-token, per-market, and total-holdings caps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpendSnapshot {
    /// USD spent on BUYs per token.
    pub token_spend: HashMap<String, f64>,
    /// USD spent on BUYs per market.
    pub market_spend: HashMap<String, f64>,
    /// Current value of all holdings at cost.
    pub total_holdings_value: f64,
}

/// Order execution contract. The paper implementation is mandatory; a live
/// adapter implements the same surface and is swapped in behind
/// `Arc<dyn Executor>`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Submit an order and report how it filled.
    async fn execute(&self, order: &OrderSpec) -> OrderResult;

    /// Available cash balance in USD.
    async fn balance(&self) -> f64;

    /// Held quantity for a token (0 when no position).
    async fn position(&self, token_id: &str) -> f64;

    /// Token id -> held quantity for every open position.
    async fn all_positions(&self) -> HashMap<String, f64>;

    /// Full position records, including entry prices and cost basis.
    async fn all_position_details(&self) -> HashMap<String, PaperPosition>;

    /// Full record for one position.
    async fn position_detail(&self, token_id: &str) -> Option<PaperPosition>;

    fn mode(&self) -> TradingMode;

    fn is_ready(&self) -> bool;

    /// Realized P&L since the process started.
    fn total_pnl(&self) -> f64;

    /// Realized P&L for the current UTC day.
    fn daily_pnl(&self) -> f64;

    /// Spend totals, when the implementation tracks them.
    fn spend_snapshot(&self) -> Option<SpendSnapshot> {
        None
    }

    /// Close every open position at the given prices (falling back to the
    /// position's average price). One `(token, result)` pair per position.
    async fn sell_all_positions(&self, _prices: &HashMap<String, f64>) -> Vec<(String, OrderResult)> {
        Vec::new()
    }

    /// Cancel any resting orders. A no-op for executors without them.
    async fn cancel_all_orders(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
