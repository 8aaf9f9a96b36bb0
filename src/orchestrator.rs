// =============================================================================
// Orchestrator — serial consumer of the inbound queue and owner of the
// handle-trade hot path
// =============================================================================
//
// One event at a time comes off the bounded queue. For a leader trade the
// pipeline is:
//
//   watched-set update -> parallel fan-out (book / balance / leader value /
//   follower position) -> copy gate -> snapshot -> market-condition gate ->
//   recommended price -> sizing + depth adjust -> adaptive price +
//   expiration -> risk gate -> execute -> persist + alert
//
// Only the fan-out stage runs concurrently; everything after it is strictly
// sequential for a given event. Latencies reported externally are corrected
// by the measured clock drift exactly once, here.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::alerts::{AlertSink, Severity};
use crate::config::BotConfig;
use crate::detector::ActivityDetector;
use crate::executor::Executor;
use crate::market::analyzer::{MarketAnalyzer, MarketSnapshot};
use crate::market::condition::ConditionChecker;
use crate::pricing::PriceAdjuster;
use crate::risk::{KillSwitch, RiskChecker, TradingState};
use crate::sizing::{LeaderChange, SizeCalculator};
use crate::store::{LatencyTriplet, SessionStats, TradeRecord, TradeStore};
use crate::types::{
    ExitTrigger, InboundEvent, OrderSpec, OrderType, Side, TradeEvent, TriggerKind,
};
use crate::venue::client::VenueClient;
use crate::venue::warmers::{BookCache, WatchedTokens};

/// Latency samples kept for the rolling average.
const LATENCY_WINDOW: usize = 100;
/// Cadence of the periodic stats line.
const STATS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Latency tracking
// ---------------------------------------------------------------------------

/// Ring buffer of the last [`LATENCY_WINDOW`] total latencies; O(1) insert,
/// averaged at query time.
#[derive(Debug, Default)]
struct LatencyStats {
    samples: VecDeque<i64>,
}

impl LatencyStats {
    fn record(&mut self, total_ms: i64) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(total_ms);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<i64>() as f64 / self.samples.len() as f64
    }
}

/// Subtract the measured clock drift from a raw latency. Applied once, at
/// the reporting boundary.
fn calibrate(raw_ms: i64, drift_ms: i64) -> i64 {
    raw_ms - drift_ms
}

/// Apply a leader trade to the tracked leader position map, returning the
/// quantity held *before* the trade (None when this token was never seen).
fn apply_leader_change(positions: &mut HashMap<String, f64>, event: &TradeEvent) -> Option<f64> {
    let previous = positions.get(&event.token_id).copied();
    match event.side {
        Side::Buy => {
            *positions.entry(event.token_id.clone()).or_insert(0.0) += event.size;
        }
        Side::Sell => {
            if let Some(qty) = positions.get_mut(&event.token_id) {
                *qty -= event.size;
                if *qty <= 0.0 {
                    positions.remove(&event.token_id);
                }
            }
        }
    }
    previous
}

/// Periodic snapshot of engine health.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub polls: u64,
    pub trades_detected: u64,
    pub trades_executed: u64,
    pub avg_total_latency_ms: f64,
    pub clock_drift_ms: i64,
    pub latency_calibrated: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    cfg: BotConfig,
    client: Arc<VenueClient>,
    books: Arc<BookCache>,
    watched: Arc<WatchedTokens>,
    executor: Arc<dyn Executor>,
    store: Arc<TradeStore>,
    alerts: Arc<AlertSink>,
    detector: Arc<ActivityDetector>,
    analyzer: MarketAnalyzer,
    condition: ConditionChecker,
    pricer: PriceAdjuster,
    sizer: SizeCalculator,
    risk: RiskChecker,
    session_id: i64,
    leader_positions: HashMap<String, f64>,
    latencies: LatencyStats,
    trades_executed: u64,
}

impl Orchestrator {
    /// Wire up the pipeline, calibrate the clock, seed the leader position
    /// map and watched set, and open the session.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        cfg: BotConfig,
        client: Arc<VenueClient>,
        books: Arc<BookCache>,
        watched: Arc<WatchedTokens>,
        executor: Arc<dyn Executor>,
        store: Arc<TradeStore>,
        alerts: Arc<AlertSink>,
        kill: Arc<KillSwitch>,
        detector: Arc<ActivityDetector>,
    ) -> anyhow::Result<Self> {
        // Clock drift calibration; a failure only means uncalibrated numbers.
        match client.check_clock_sync().await {
            Ok(sync) => info!(
                drift_ms = sync.drift_ms,
                synchronized = sync.synchronized,
                "clock drift calibrated"
            ),
            Err(e) => warn!(error = %e, "clock sync failed — latencies will be uncalibrated"),
        }

        // Seed leader positions; they double as the initial watched set.
        let mut leader_positions = HashMap::new();
        match client.get_positions(&cfg.leader_address).await {
            Ok(positions) => {
                let tokens: Vec<String> =
                    positions.iter().map(|p| p.token_id.clone()).collect();
                for p in positions {
                    leader_positions.insert(p.token_id, p.quantity);
                }
                watched.replace(tokens);
                info!(count = leader_positions.len(), "leader positions seeded");
            }
            Err(e) => warn!(error = %e, "could not seed leader positions — starting empty"),
        }

        let starting_balance = executor.balance().await;
        let session_id = store.open_session(
            cfg.trading_mode,
            &cfg.detection_method.to_string(),
            &cfg.leader_address,
            starting_balance,
        )?;

        info!(
            session_id,
            leader = %cfg.leader_address,
            tag = cfg.leader_tag.as_deref().unwrap_or("-"),
            mode = %cfg.trading_mode,
            starting_balance,
            "session opened"
        );

        Ok(Self {
            analyzer: MarketAnalyzer::new(cfg.market.clone()),
            condition: ConditionChecker::new(cfg.market.clone()),
            pricer: PriceAdjuster::new(cfg.pricing.clone()),
            sizer: SizeCalculator::new(cfg.sizing.clone()),
            risk: RiskChecker::new(cfg.risk.clone(), kill),
            cfg,
            client,
            books,
            watched,
            executor,
            store,
            alerts,
            detector,
            session_id,
            leader_positions,
            latencies: LatencyStats::default(),
            trades_executed: 0,
        })
    }

    /// Consume the inbound queue until shutdown, then close the session.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<InboundEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);
        stats_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        stats_ticker.tick().await; // swallow the immediate first tick

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(InboundEvent::LeaderTrade { event, detection_latency_ms }) => {
                            self.handle_trade_event(event, detection_latency_ms).await;
                        }
                        Some(InboundEvent::TpSlTrigger(trigger)) => {
                            self.handle_exit_trigger(trigger).await;
                        }
                        Some(InboundEvent::OneClickSell) => {
                            self.handle_one_click_sell().await;
                        }
                        None => break,
                    }
                }
                _ = stats_ticker.tick() => {
                    let stats = self.stats();
                    info!(
                        polls = stats.polls,
                        detected = stats.trades_detected,
                        executed = stats.trades_executed,
                        avg_latency_ms = stats.avg_total_latency_ms,
                        calibrated = stats.latency_calibrated,
                        "engine stats"
                    );
                }
                _ = shutdown.changed() => break,
            }
        }

        self.close_session().await;
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            polls: self.detector.polls(),
            trades_detected: self.detector.detected(),
            trades_executed: self.trades_executed,
            avg_total_latency_ms: self.latencies.average(),
            clock_drift_ms: self.client.clock_drift_ms(),
            latency_calibrated: self.client.is_clock_synchronized(),
        }
    }

    // -------------------------------------------------------------------------
    // Hot path
    // -------------------------------------------------------------------------

    async fn handle_trade_event(&mut self, event: TradeEvent, detection_latency_ms: i64) {
        let t0 = Instant::now();

        // A leader BUY may open a token we were not yet watching.
        if event.side == Side::Buy {
            self.watched.add(&event.token_id);
        }

        // Parallel fan-out: book, balance, leader value, and (for SELLs
        // only) the follower position. Skipping the position fetch on BUYs
        // saves a venue round trip.
        let (book, balance, leader_value, follower_pos) = tokio::join!(
            self.fetch_book(&event.token_id),
            self.executor.balance(),
            async {
                self.client
                    .get_portfolio_value(&self.cfg.leader_address, false)
                    .await
                    .ok()
            },
            async {
                if event.side == Side::Sell {
                    self.executor.position(&event.token_id).await
                } else {
                    0.0
                }
            },
        );

        let previous_qty = apply_leader_change(&mut self.leader_positions, &event);
        let change = LeaderChange {
            side: event.side,
            delta: event.size,
            previous_qty,
        };

        let (copy, skip_reason) = self.sizer.should_copy(&change, follower_pos);
        if !copy {
            debug!(
                id = %event.id,
                reason = skip_reason.as_deref().unwrap_or("-"),
                "leader trade not copied"
            );
            return;
        }

        // Decision snapshot, from the book when we have one.
        let snapshot = self.build_snapshot(&event, book).await;

        let gate = self
            .condition
            .check(&snapshot, Some(event.size), event.side);
        if !gate.approved {
            let reason = gate.reasons.join("; ");
            info!(id = %event.id, %reason, "market condition rejected copy");
            self.alerts.notify(
                Severity::Medium,
                format!("copy of {} skipped: {reason}", event.token_id),
            );
            return;
        }
        for w in &gate.warnings {
            debug!(id = %event.id, warning = %w, "market condition warning");
        }

        let market_price = MarketAnalyzer::recommended_price(&snapshot, event.side);

        // Sizing, then depth-aware shrink.
        let decision = match event.side {
            Side::Buy => self
                .sizer
                .calculate_buy(event.size, market_price, balance, leader_value),
            Side::Sell => self.sizer.calculate_sell(&change, follower_pos),
        };
        for note in &decision.notes {
            debug!(id = %event.id, note = %note, "sizing note");
        }
        if decision.skipped() {
            debug!(id = %event.id, "size calculation produced nothing to do");
            return;
        }
        let (size, depth_note) = self
            .sizer
            .adjust_for_depth(decision.shares, &snapshot, event.side);
        if let Some(note) = depth_note {
            info!(id = %event.id, %note, "order shrunk to book depth");
        }

        let (price, offset_bps) = self
            .pricer
            .adjust_adaptive(market_price, event.side, &snapshot);
        let expiration = self
            .sizer
            .adaptive_expiration(&snapshot, self.cfg.order_expiration_secs);

        let order = OrderSpec::new(
            event.token_id.clone(),
            event.side,
            size,
            price,
            self.cfg.order_type,
            Some(expiration),
            offset_bps,
            Some(event.id.clone()),
        )
        .with_market(&event.market_id);

        // Trading state for the risk gate, reusing the fan-out balance.
        let state = self.build_trading_state(balance).await;
        let risk = self.risk.check(&order, &state);
        if !risk.approved {
            let reason = risk.reasons.join("; ");
            info!(id = %event.id, %reason, "risk gate rejected copy");
            self.alerts.notify(
                Severity::High,
                format!("copy of {} blocked: {reason}", event.token_id),
            );
            return;
        }
        for w in &risk.warnings {
            debug!(id = %event.id, warning = %w, "risk warning");
        }

        // For SELLs, pin the entry price before execution so the recorded
        // P&L does not depend on executor-internal ordering.
        let entry_price = if event.side == Side::Sell {
            self.executor
                .position_detail(&event.token_id)
                .await
                .map(|d| d.avg_price)
        } else {
            None
        };

        let exec_start = Instant::now();
        let result = self.executor.execute(&order).await;
        let execution_latency_ms = exec_start.elapsed().as_millis() as i64;

        let drift = self.client.clock_drift_ms();
        let detection_ms = calibrate(detection_latency_ms, drift);
        let total_ms = detection_ms + t0.elapsed().as_millis() as i64;

        let pnl = match (event.side, entry_price) {
            (Side::Sell, Some(entry)) if result.is_fill() => {
                Some(result.filled_size * (result.avg_fill_price - entry))
            }
            _ => None,
        };

        self.store.record_trade(&TradeRecord {
            session_id: self.session_id,
            token_id: event.token_id.clone(),
            market_id: event.market_id.clone(),
            side: event.side,
            order_type: order.order_type,
            requested_size: order.size,
            filled_size: result.filled_size,
            fill_price: result.avg_fill_price,
            status: result.status,
            mode: result.mode,
            pnl,
            source_trade_id: Some(event.id.clone()),
            title: event.title.clone(),
            latency: LatencyTriplet {
                detection_ms: Some(detection_ms),
                execution_ms: Some(execution_latency_ms),
                total_ms: Some(total_ms),
            },
        });

        if result.is_fill() {
            self.trades_executed += 1;
            self.latencies.record(total_ms);
            info!(
                id = %event.id,
                token = %event.token_id,
                side = %event.side,
                filled = result.filled_size,
                price = result.avg_fill_price,
                pnl = pnl.unwrap_or(0.0),
                detection_ms,
                execution_ms = execution_latency_ms,
                total_ms,
                calibrated = self.client.is_clock_synchronized(),
                "copy filled"
            );
            self.alerts.notify(
                Severity::Medium,
                format!(
                    "copied {} {:.2} {} @ {:.4} ({} ms total)",
                    event.side, result.filled_size, event.token_id, result.avg_fill_price, total_ms
                ),
            );
        } else {
            let why = result.error.as_deref().unwrap_or("unknown");
            warn!(id = %event.id, error = why, "copy execution failed");
            self.alerts.notify(
                Severity::High,
                format!("copy of {} failed: {why}", event.token_id),
            );
        }
    }

    // -------------------------------------------------------------------------
    // TP/SL and one-click exits
    // -------------------------------------------------------------------------

    async fn handle_exit_trigger(&mut self, trigger: ExitTrigger) {
        info!(
            token = %trigger.token_id,
            kind = %trigger.kind,
            entry = trigger.entry_price,
            current = trigger.current_price,
            "executing exit trigger"
        );

        let exec_start = Instant::now();
        let result = self.executor.execute(&trigger.order).await;
        let execution_latency_ms = exec_start.elapsed().as_millis() as i64;

        // P&L against the entry price the monitor observed at trigger time.
        let pnl = result
            .is_fill()
            .then(|| result.filled_size * (result.avg_fill_price - trigger.entry_price));

        self.store.record_trade(&TradeRecord {
            session_id: self.session_id,
            token_id: trigger.token_id.clone(),
            market_id: trigger.order.market_id.clone(),
            side: Side::Sell,
            order_type: trigger.order.order_type,
            requested_size: trigger.order.size,
            filled_size: result.filled_size,
            fill_price: result.avg_fill_price,
            status: result.status,
            mode: result.mode,
            pnl,
            source_trade_id: None,
            title: Some(trigger.kind.to_string()),
            latency: LatencyTriplet {
                detection_ms: None,
                execution_ms: Some(execution_latency_ms),
                total_ms: None,
            },
        });

        if result.is_fill() {
            self.trades_executed += 1;
            let severity = match trigger.kind {
                TriggerKind::TakeProfit => Severity::Medium,
                TriggerKind::StopLoss => Severity::High,
            };
            self.alerts.notify(
                severity,
                format!(
                    "{} closed {:.2} {} @ {:.4}, P&L {:+.2}",
                    trigger.kind,
                    result.filled_size,
                    trigger.token_id,
                    result.avg_fill_price,
                    pnl.unwrap_or(0.0)
                ),
            );
        } else {
            warn!(
                token = %trigger.token_id,
                error = result.error.as_deref().unwrap_or("unknown"),
                "exit trigger execution failed"
            );
        }
    }

    async fn handle_one_click_sell(&mut self) {
        let details = self.executor.all_position_details().await;
        if details.is_empty() {
            info!("one-click sell: no open positions");
            return;
        }

        // Current bids for every open token; fall back to entry cost inside
        // the executor for any token we cannot price.
        let requests: Vec<(String, Side)> = details
            .keys()
            .map(|token| (token.clone(), Side::Sell))
            .collect();
        let mut prices = HashMap::new();
        for (token, result) in self.client.get_prices_parallel(&requests).await {
            if let Ok(price) = result {
                prices.insert(token, price);
            }
        }

        let results = self.executor.sell_all_positions(&prices).await;
        let mut total_pnl = 0.0;
        for (token, result) in &results {
            if !result.is_fill() {
                warn!(
                    token = %token,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "one-click sell leg failed"
                );
                continue;
            }
            self.trades_executed += 1;
            let detail = details.get(token);
            let pnl = detail
                .map(|d| result.filled_size * (result.avg_fill_price - d.avg_price));
            total_pnl += pnl.unwrap_or(0.0);

            self.store.record_trade(&TradeRecord {
                session_id: self.session_id,
                token_id: token.clone(),
                market_id: detail.map(|d| d.market_id.clone()).unwrap_or_default(),
                side: Side::Sell,
                order_type: OrderType::Market,
                requested_size: result.filled_size + result.remaining_size,
                filled_size: result.filled_size,
                fill_price: result.avg_fill_price,
                status: result.status,
                mode: result.mode,
                pnl,
                source_trade_id: None,
                title: Some("one_click_sell".to_string()),
                latency: LatencyTriplet::default(),
            });
        }

        info!(sold = results.len(), total_pnl, "one-click sell completed");
        self.alerts.notify(
            Severity::High,
            format!("one-click sell closed {} positions", results.len()),
        );
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    async fn close_session(&self) {
        let stats = SessionStats {
            poll_count: self.detector.polls(),
            trades_detected: self.detector.detected(),
            trades_executed: self.trades_executed,
            total_pnl: self.executor.total_pnl(),
            ending_balance: self.executor.balance().await,
        };
        // Best effort: a failed close must not block shutdown.
        if let Err(e) = self.store.close_session(self.session_id, stats) {
            warn!(error = %e, "failed to close session");
        }
        info!(
            session_id = self.session_id,
            executed = stats.trades_executed,
            total_pnl = stats.total_pnl,
            ending_balance = stats.ending_balance,
            "session closed"
        );
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Warm cache first, venue second.
    async fn fetch_book(&self, token_id: &str) -> Option<(crate::types::RawOrderBook, i64)> {
        if let Some((book, age_ms)) = self.books.get(token_id) {
            return Some((book, age_ms));
        }
        match self.client.get_order_book(token_id).await {
            Ok(book) => Some((book, 0)),
            Err(e) => {
                warn!(token_id, error = %e, "book fetch failed — falling back to price endpoints");
                None
            }
        }
    }

    async fn build_snapshot(
        &self,
        event: &TradeEvent,
        book: Option<(crate::types::RawOrderBook, i64)>,
    ) -> MarketSnapshot {
        if let Some((book, age_ms)) = book {
            if !book.is_empty() {
                return self.analyzer.analyze(
                    &event.token_id,
                    &book,
                    event.price,
                    Some(event.size),
                    Some(age_ms),
                );
            }
        }

        if self.cfg.use_trader_price {
            return self.analyzer.analyze_from_prices(
                &event.token_id,
                event.price,
                event.price,
                event.price,
            );
        }

        // Book unavailable: fall back to the price endpoints. A BUY intent
        // resolves to the ask, a SELL intent to the bid.
        let (ask, bid) = tokio::join!(
            self.client.get_price(&event.token_id, Side::Buy),
            self.client.get_price(&event.token_id, Side::Sell),
        );
        self.analyzer.analyze_from_prices(
            &event.token_id,
            ask.unwrap_or(event.price),
            bid.unwrap_or(event.price),
            event.price,
        )
    }

    async fn build_trading_state(&self, balance: f64) -> TradingState {
        let positions = self.executor.all_positions().await;
        let total_shares = positions.values().sum();
        TradingState {
            daily_pnl: self.executor.daily_pnl(),
            total_pnl: self.executor.total_pnl(),
            balance,
            positions,
            total_shares,
            spend: self.executor.spend_snapshot().unwrap_or_default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_ring_buffer_caps_at_window() {
        let mut stats = LatencyStats::default();
        for i in 0..(LATENCY_WINDOW + 50) {
            stats.record(i as i64);
        }
        assert_eq!(stats.samples.len(), LATENCY_WINDOW);
        // Oldest 50 samples are gone: average over 50..149.
        let expected = (50..150).sum::<i64>() as f64 / 100.0;
        assert!((stats.average() - expected).abs() < 1e-9);
    }

    #[test]
    fn latency_average_of_empty_buffer_is_zero() {
        let stats = LatencyStats::default();
        assert!((stats.average() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn drift_correction_subtracts_raw_drift() {
        assert_eq!(calibrate(500, 120), 380);
        assert_eq!(calibrate(500, -120), 620);
        // Re-calibrating a corrected value would double-subtract; the raw
        // value is calibrated exactly once at the reporting boundary.
        assert_ne!(calibrate(calibrate(500, 120), 120), 380);
    }

    #[test]
    fn leader_tracker_returns_pre_trade_quantity() {
        let mut positions = HashMap::new();

        let buy = TradeEvent {
            id: "t1".into(),
            token_id: "tok".into(),
            market_id: "mkt".into(),
            side: Side::Buy,
            size: 100.0,
            price: 0.5,
            timestamp_secs: 0,
            title: None,
            outcome: None,
        };
        assert_eq!(apply_leader_change(&mut positions, &buy), None);
        assert!((positions["tok"] - 100.0).abs() < 1e-9);

        let sell = TradeEvent {
            side: Side::Sell,
            size: 40.0,
            id: "t2".into(),
            ..buy.clone()
        };
        assert_eq!(apply_leader_change(&mut positions, &sell), Some(100.0));
        assert!((positions["tok"] - 60.0).abs() < 1e-9);

        let sell_all = TradeEvent {
            side: Side::Sell,
            size: 60.0,
            id: "t3".into(),
            ..buy
        };
        assert_eq!(apply_leader_change(&mut positions, &sell_all), Some(60.0));
        assert!(!positions.contains_key("tok"));
    }
}
