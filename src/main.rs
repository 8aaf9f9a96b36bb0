// =============================================================================
// Shadow Copy Engine — Main Entry Point
// =============================================================================
//
// Observes one leader trader and mirrors their fills from a follower
// account. The engine starts in paper mode unless configured otherwise; a
// live adapter is a pluggable implementation of the Executor trait.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod config;
mod detector;
mod executor;
mod market;
mod orchestrator;
mod pricing;
mod rate_gate;
mod risk;
mod sizing;
mod store;
mod tpsl;
mod types;
mod venue;
mod ws_trigger;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::{AlertSink, WebhookTransport};
use crate::config::BotConfig;
use crate::detector::ActivityDetector;
use crate::executor::{Executor, PaperExecutor};
use crate::orchestrator::Orchestrator;
use crate::risk::KillSwitch;
use crate::store::TradeStore;
use crate::types::{InboundEvent, TradingMode};
use crate::venue::client::VenueClient;
use crate::venue::warmers::{
    run_book_warmer, run_portfolio_prefetch, run_price_warmer, BookCache, WatchedTokens,
};

/// Capacity of the inbound event queue. Producers block when the
/// orchestrator falls this far behind, which is the intended backpressure.
const EVENT_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Shadow Copy Engine — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cfg = BotConfig::from_env()?;
    info!(
        leader = %cfg.leader_address,
        tag = cfg.leader_tag.as_deref().unwrap_or("-"),
        mode = %cfg.trading_mode,
        method = %cfg.detection_method,
        poll_interval_ms = cfg.poll_interval_ms,
        "configuration loaded"
    );

    // ── 2. Shared infrastructure ─────────────────────────────────────────
    let client = Arc::new(VenueClient::new(&cfg.data_api_url, &cfg.market_api_url));
    let store = Arc::new(TradeStore::open(&cfg.store_path)?);
    let kill = Arc::new(KillSwitch::new());
    let books = Arc::new(BookCache::new());
    let watched = Arc::new(WatchedTokens::new(Vec::new()));

    let mut alert_sink = AlertSink::new(cfg.alert_min_severity);
    if let Some(url) = &cfg.alert_webhook_primary {
        alert_sink.add_channel(Arc::new(WebhookTransport::new("primary", url)));
    }
    if let Some(url) = &cfg.alert_webhook_secondary {
        alert_sink.add_channel(Arc::new(WebhookTransport::new("secondary", url)));
    }
    let alerts = Arc::new(alert_sink);

    // ── 3. Executor ──────────────────────────────────────────────────────
    // SAFETY: no live adapter ships with this build; live mode falls back
    // to the paper simulator rather than guessing at a venue signer.
    if cfg.trading_mode == TradingMode::Live {
        warn!("live trading requested but no live adapter is wired — running paper");
    }
    let executor: Arc<dyn Executor> = Arc::new(PaperExecutor::new(cfg.paper_balance));

    // ── 4. Event queue & shutdown signal ─────────────────────────────────
    let (event_tx, event_rx) = mpsc::channel::<InboundEvent>(EVENT_QUEUE_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 5. Detector ──────────────────────────────────────────────────────
    let detector = Arc::new(ActivityDetector::new(
        client.clone(),
        alerts.clone(),
        cfg.leader_address.clone(),
        Duration::from_millis(cfg.poll_interval_ms),
        cfg.max_consecutive_errors,
    ));

    // ── 6. Orchestrator (clock sync, leader seed, session open) ─────────
    let orchestrator = Orchestrator::start(
        cfg.clone(),
        client.clone(),
        books.clone(),
        watched.clone(),
        executor.clone(),
        store.clone(),
        alerts.clone(),
        kill.clone(),
        detector.clone(),
    )
    .await?;

    // ── 7. Background loops ──────────────────────────────────────────────
    tokio::spawn(run_book_warmer(
        client.clone(),
        books.clone(),
        watched.subscribe(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_price_warmer(
        client.clone(),
        watched.subscribe(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_portfolio_prefetch(
        client.clone(),
        cfg.leader_address.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(detector.clone().run(event_tx.clone(), shutdown_rx.clone()));

    tokio::spawn(ws_trigger::run_ws_trigger(
        cfg.market_ws_url.clone(),
        detector.clone(),
        alerts.clone(),
        watched.subscribe(),
        shutdown_rx.clone(),
    ));

    if cfg.tpsl.enabled {
        tokio::spawn(tpsl::run_tpsl_monitor(
            cfg.tpsl.clone(),
            executor.clone(),
            client.clone(),
            event_tx.clone(),
            shutdown_rx.clone(),
        ));
    } else {
        info!("TP/SL monitor disabled by configuration");
    }

    // ── 8. Hot path ──────────────────────────────────────────────────────
    let orchestrator_handle = tokio::spawn(orchestrator.run(event_rx, shutdown_rx));

    info!("engine running — press Ctrl-C to stop");

    // ── 9. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    drop(event_tx);
    let _ = orchestrator_handle.await;

    info!("shutdown complete");
    Ok(())
}
