// =============================================================================
// WS Trigger — last-trade stream that pokes the detector awake
// =============================================================================
//
// Subscribes to the venue's market channel for the watched tokens. Any
// `last_trade_price` message touching a watched token forces an immediate
// activity poll, collapsing the detection delay from one poll interval to
// one WS hop.
//
// Reconnects back off exponentially (1, 2, 4, 8, 16, capped at 30 s). After
// ten consecutive failures the trigger disables itself and the engine runs
// on polling alone. Watched-set changes reconnect with the new list; the
// venue is not assumed to support incremental subscribe.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::alerts::{AlertSink, Severity};
use crate::detector::ActivityDetector;

/// Heartbeat interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Reconnect backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Consecutive reconnect failures before the trigger gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

enum ConnExit {
    Shutdown,
    Resubscribe,
    Closed,
}

/// Extract the watched token ids signalled by one WS text frame. The server
/// batches messages into arrays; single objects appear too.
fn trade_signal_tokens(text: &str, watched: &HashSet<String>) -> Vec<String> {
    if text.eq_ignore_ascii_case("PONG") {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };

    let items: Vec<&serde_json::Value> = match value.as_array() {
        Some(arr) => arr.iter().collect(),
        None => vec![&value],
    };

    items
        .into_iter()
        .filter(|m| m.get("event_type").and_then(|v| v.as_str()) == Some("last_trade_price"))
        .filter_map(|m| m.get("asset_id").and_then(|v| v.as_str()))
        .filter(|asset| watched.contains(*asset))
        .map(|s| s.to_string())
        .collect()
}

/// Run the WS trigger until shutdown or permanent failure.
pub async fn run_ws_trigger(
    url: String,
    detector: Arc<ActivityDetector>,
    alerts: Arc<AlertSink>,
    mut watched: watch::Receiver<Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(url = %url, "WS trigger started");

    let mut attempts: u32 = 0;
    let mut backoff = Duration::from_secs(1);

    loop {
        // Nothing to subscribe to yet: wait for the watched set to fill.
        while watched.borrow().is_empty() {
            tokio::select! {
                res = watched.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }

        let assets: Vec<String> = watched.borrow_and_update().clone();

        match connect_and_stream(&url, &assets, &detector, &mut watched, &mut shutdown).await {
            Ok(ConnExit::Shutdown) => {
                info!("WS trigger stopping");
                return;
            }
            Ok(ConnExit::Resubscribe) => {
                debug!("watched set changed — reconnecting with new subscription");
                attempts = 0;
                backoff = Duration::from_secs(1);
            }
            Ok(ConnExit::Closed) => {
                warn!("WS connection closed by server — reconnecting");
                attempts = 0;
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                attempts += 1;
                if attempts >= MAX_RECONNECT_ATTEMPTS {
                    warn!(error = %e, attempts, "WS trigger disabled — falling back to polling alone");
                    alerts.notify(
                        Severity::High,
                        "trade WebSocket disabled after repeated failures; polling continues",
                    );
                    return;
                }
                warn!(error = %e, attempts, backoff_s = backoff.as_secs(), "WS connect failed — backing off");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn connect_and_stream(
    url: &str,
    assets: &[String],
    detector: &Arc<ActivityDetector>,
    watched: &mut watch::Receiver<Vec<String>>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<ConnExit> {
    let (ws_stream, _resp) = connect_async(url).await?;
    info!(assets = assets.len(), "market WS connected");

    let (mut write, mut read) = ws_stream.split();

    let sub = serde_json::json!({
        "type": "market",
        "assets_ids": assets,
    });
    write.send(Message::Text(sub.to_string())).await?;

    let watched_set: HashSet<String> = assets.iter().cloned().collect();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = ping.tick() => {
                write.send(Message::Text("PING".to_string())).await?;
            }
            res = watched.changed() => {
                if res.is_err() {
                    return Ok(ConnExit::Shutdown);
                }
                return Ok(ConnExit::Resubscribe);
            }
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(ConnExit::Shutdown);
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Ok(ConnExit::Closed);
                };
                match msg? {
                    Message::Text(text) => {
                        for token in trade_signal_tokens(&text, &watched_set) {
                            debug!(token = %token, "trade signal — forcing poll");
                            detector.trigger_poll_now();
                        }
                    }
                    Message::Ping(payload) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(frame) => {
                        debug!(?frame, "market WS close frame");
                        return Ok(ConnExit::Closed);
                    }
                    _ => {}
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn watched(tokens: &[&str]) -> HashSet<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn batched_messages_yield_one_signal_per_watched_match() {
        let text = r#"[
            {"event_type": "last_trade_price", "asset_id": "tok1", "price": "0.52"},
            {"event_type": "last_trade_price", "asset_id": "other", "price": "0.10"},
            {"event_type": "book", "asset_id": "tok1"}
        ]"#;
        let signals = trade_signal_tokens(text, &watched(&["tok1", "tok2"]));
        assert_eq!(signals, vec!["tok1".to_string()]);
    }

    #[test]
    fn single_object_messages_are_accepted() {
        let text = r#"{"event_type": "last_trade_price", "asset_id": "tok2"}"#;
        let signals = trade_signal_tokens(text, &watched(&["tok2"]));
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn unwatched_assets_and_other_events_are_ignored() {
        let text = r#"{"event_type": "last_trade_price", "asset_id": "unknown"}"#;
        assert!(trade_signal_tokens(text, &watched(&["tok1"])).is_empty());

        let text = r#"{"event_type": "price_change", "asset_id": "tok1"}"#;
        assert!(trade_signal_tokens(text, &watched(&["tok1"])).is_empty());
    }

    #[test]
    fn pong_and_garbage_frames_are_ignored() {
        assert!(trade_signal_tokens("PONG", &watched(&["tok1"])).is_empty());
        assert!(trade_signal_tokens("not json", &watched(&["tok1"])).is_empty());
    }
}
