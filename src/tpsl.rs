// =============================================================================
// TP/SL Monitor — periodic take-profit / stop-loss evaluation
// =============================================================================
//
// Runs as a background task, waking every 5 seconds to:
//   1. Pull all open position details from the executor.
//   2. Fetch their SELL-side prices in parallel.
//   3. Compare each position's move against the configured thresholds.
//   4. Publish a trigger with a prebuilt market-sell of the full quantity.
//
// The trigger carries the entry price observed here so the orchestrator can
// report deterministic P&L regardless of what the executor does afterwards.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::TpSlConfig;
use crate::executor::Executor;
use crate::types::{ExitTrigger, InboundEvent, OrderSpec, OrderType, Side, TriggerKind};
use crate::venue::client::VenueClient;

/// Interval at which positions are evaluated.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Threshold comparison for one position.
///
/// Percentages are plain percent; a disabled side is 0. Take-profit wins
/// when both sides would somehow fire.
fn evaluate(cfg: &TpSlConfig, entry_price: f64, current_price: f64) -> Option<TriggerKind> {
    if entry_price <= 0.0 {
        return None;
    }
    let change = (current_price - entry_price) / entry_price;

    if cfg.take_profit_percent > 0.0 && change >= cfg.take_profit_percent / 100.0 {
        return Some(TriggerKind::TakeProfit);
    }
    if cfg.stop_loss_percent > 0.0 && change <= -cfg.stop_loss_percent / 100.0 {
        return Some(TriggerKind::StopLoss);
    }
    None
}

/// Run the monitor loop until shutdown.
pub async fn run_tpsl_monitor(
    cfg: TpSlConfig,
    executor: Arc<dyn Executor>,
    client: Arc<VenueClient>,
    events: mpsc::Sender<InboundEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_s = MONITOR_INTERVAL.as_secs(),
        tp_pct = cfg.take_profit_percent,
        sl_pct = cfg.stop_loss_percent,
        "TP/SL monitor started"
    );

    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("TP/SL monitor stopping");
                return;
            }
        }

        let positions = executor.all_position_details().await;
        if positions.is_empty() {
            continue;
        }

        let requests: Vec<(String, Side)> = positions
            .keys()
            .map(|token| (token.clone(), Side::Sell))
            .collect();
        let prices = client.get_prices_parallel(&requests).await;

        for (token, price_result) in prices {
            let current_price = match price_result {
                Ok(p) => p,
                Err(e) => {
                    warn!(token = %token, error = %e, "TP/SL price fetch failed — skipping this tick");
                    continue;
                }
            };
            let Some(position) = positions.get(&token) else {
                continue;
            };

            let Some(kind) = evaluate(&cfg, position.entry_price, current_price) else {
                debug!(
                    token = %token,
                    entry = position.entry_price,
                    current = current_price,
                    "TP/SL: no trigger"
                );
                continue;
            };

            info!(
                token = %token,
                kind = %kind,
                entry = position.entry_price,
                current = current_price,
                quantity = position.quantity,
                "TP/SL TRIGGERED — submitting exit"
            );

            let order = OrderSpec::new(
                token.clone(),
                Side::Sell,
                position.quantity,
                current_price,
                OrderType::Market,
                None,
                0.0,
                None,
            )
            .with_market(&position.market_id);

            let trigger = ExitTrigger {
                kind,
                token_id: token.clone(),
                entry_price: position.entry_price,
                current_price,
                order,
            };

            if events.send(InboundEvent::TpSlTrigger(trigger)).await.is_err() {
                warn!("event queue closed — TP/SL monitor stopping");
                return;
            }
        }
    }
}
