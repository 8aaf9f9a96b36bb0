// =============================================================================
// Activity Detector — tight poll loop over the leader's trade feed
// =============================================================================
//
// Polls `/activity` with an incremental `after` cursor and a dedup set. The
// loop is deliberately tight rather than a fixed-interval timer: the time a
// poll takes is subtracted from the wait, so a slow venue round trip does
// not stretch the detection cadence.
//
// Error handling:
//   - rate limited   -> pause 5 s, resume
//   - other errors   -> consecutive counter; at the threshold the detector
//                       announces a degraded state, and the first success
//                       afterwards announces recovery
//
// The first poll after start only seeds the dedup set and cursor; nothing
// is emitted for trades that happened before the engine came up.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::alerts::{AlertSink, Severity};
use crate::types::{InboundEvent, TradeEvent};
use crate::venue::client::{TradeQuery, VenueClient, VenueError, VenueResult};

/// Activity rows requested per poll.
const POLL_LIMIT: u32 = 50;
/// Pause after a venue rate-limit response.
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(5);
/// Dedup set size that triggers a trim.
const SEEN_CAP: usize = 1000;
/// Dedup set size after a trim.
const SEEN_TRIM_TO: usize = 500;

// ---------------------------------------------------------------------------
// Dedup set
// ---------------------------------------------------------------------------

/// Insertion-ordered id set, trimmed oldest-first when it overflows.
struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    /// Record an id; returns false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        true
    }

    fn len(&self) -> usize {
        self.set.len()
    }

    /// Drop oldest ids until the set is back at the trim target.
    fn trim(&mut self) {
        if self.set.len() <= SEEN_CAP {
            return;
        }
        while self.set.len() > SEEN_TRIM_TO {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            } else {
                break;
            }
        }
        debug!(len = self.set.len(), "seen-id set trimmed");
    }
}

// ---------------------------------------------------------------------------
// Trade feed
// ---------------------------------------------------------------------------

/// The slice of the venue the detector polls. The venue client is the
/// production feed; tests script one.
#[async_trait]
pub trait TradeFeed: Send + Sync {
    async fn get_trades(&self, addr: &str, query: TradeQuery) -> VenueResult<Vec<TradeEvent>>;
}

#[async_trait]
impl TradeFeed for VenueClient {
    async fn get_trades(&self, addr: &str, query: TradeQuery) -> VenueResult<Vec<TradeEvent>> {
        VenueClient::get_trades(self, addr, query).await
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct ActivityDetector {
    client: Arc<dyn TradeFeed>,
    alerts: Arc<AlertSink>,
    leader_address: String,
    poll_interval: Duration,
    max_consecutive_errors: u32,
    poke: Notify,
    poll_count: AtomicU64,
    trades_detected: AtomicU64,
}

impl ActivityDetector {
    pub fn new(
        client: Arc<dyn TradeFeed>,
        alerts: Arc<AlertSink>,
        leader_address: impl Into<String>,
        poll_interval: Duration,
        max_consecutive_errors: u32,
    ) -> Self {
        Self {
            client,
            alerts,
            leader_address: leader_address.into(),
            poll_interval,
            max_consecutive_errors,
            poke: Notify::new(),
            poll_count: AtomicU64::new(0),
            trades_detected: AtomicU64::new(0),
        }
    }

    /// Break the current sleep and poll immediately. Called by the WS
    /// trigger when a watched token prints a trade.
    pub fn trigger_poll_now(&self) {
        self.poke.notify_one();
    }

    pub fn polls(&self) -> u64 {
        self.poll_count.load(Ordering::Relaxed)
    }

    pub fn detected(&self) -> u64 {
        self.trades_detected.load(Ordering::Relaxed)
    }

    /// Run the poll loop until shutdown. Detected trades are published onto
    /// the orchestrator's queue; the send blocks only when the queue is
    /// full, which is the intended backpressure.
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Sender<InboundEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            leader = %self.leader_address,
            interval_ms = self.poll_interval.as_millis() as u64,
            "activity detector started"
        );

        let mut seen = SeenIds::new();
        let mut last_trade_sec: Option<i64> = None;
        let mut consecutive_errors: u32 = 0;
        let mut degraded = false;
        let mut initial = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let poll_start = tokio::time::Instant::now();
            self.poll_count.fetch_add(1, Ordering::Relaxed);

            let query = TradeQuery {
                limit: POLL_LIMIT,
                after_unix_sec: last_trade_sec,
            };

            match self.client.get_trades(&self.leader_address, query).await {
                Ok(trades) => {
                    if degraded {
                        degraded = false;
                        info!("activity detector recovered");
                        self.alerts
                            .notify(Severity::Medium, "activity detector recovered");
                    }
                    consecutive_errors = 0;

                    if initial {
                        // Seed only: no emissions for pre-start trades.
                        for trade in &trades {
                            seen.insert(&trade.id);
                        }
                        last_trade_sec = Some(
                            trades
                                .iter()
                                .map(|t| t.timestamp_secs)
                                .max()
                                .unwrap_or_else(|| Utc::now().timestamp()),
                        );
                        initial = false;
                        debug!(seeded = trades.len(), "initial activity snapshot recorded");
                    } else {
                        let now_ms = Utc::now().timestamp_millis();
                        let mut max_sec = last_trade_sec.unwrap_or(0);

                        // The feed is newest-first; emit oldest-first so the
                        // follower replays the leader in order.
                        for trade in trades.iter().rev() {
                            if !seen.insert(&trade.id) {
                                continue;
                            }
                            max_sec = max_sec.max(trade.timestamp_secs);
                            let detection_latency_ms = now_ms - trade.timestamp_secs * 1000;
                            self.trades_detected.fetch_add(1, Ordering::Relaxed);

                            info!(
                                id = %trade.id,
                                token = %trade.token_id,
                                side = %trade.side,
                                size = trade.size,
                                price = trade.price,
                                detection_latency_ms,
                                "leader trade detected"
                            );

                            if events
                                .send(InboundEvent::LeaderTrade {
                                    event: trade.clone(),
                                    detection_latency_ms,
                                })
                                .await
                                .is_err()
                            {
                                warn!("event queue closed — detector stopping");
                                return;
                            }
                        }
                        last_trade_sec = Some(max_sec);
                        seen.trim();
                    }
                }
                // Rate limiting is pacing feedback, not a fault: pause and
                // resume without touching the degraded counter.
                Err(VenueError::RateLimited) => {
                    warn!("activity poll rate limited — pausing 5s");
                    tokio::select! {
                        _ = tokio::time::sleep(RATE_LIMIT_PAUSE) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(error = %e, consecutive_errors, "activity poll failed");
                    if consecutive_errors == self.max_consecutive_errors {
                        degraded = true;
                        self.alerts.notify(
                            Severity::High,
                            format!(
                                "activity detector degraded after {consecutive_errors} consecutive errors"
                            ),
                        );
                    }
                }
            }

            // Tight loop: subtract the poll duration from the wait.
            let elapsed = poll_start.elapsed();
            let wait = self.poll_interval.saturating_sub(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.poke.notified() => {
                    debug!("poll forced by trade signal");
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("activity detector stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_ids_deduplicate() {
        let mut seen = SeenIds::new();
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.contains("a"));
        assert!(!seen.contains("b"));
    }

    #[test]
    fn seen_ids_trim_drops_oldest_down_to_target() {
        let mut seen = SeenIds::new();
        for i in 0..(SEEN_CAP + 1) {
            seen.insert(&format!("id-{i}"));
        }
        assert_eq!(seen.len(), SEEN_CAP + 1);
        seen.trim();
        assert_eq!(seen.len(), SEEN_TRIM_TO);
        // The oldest ids are gone, the newest survive.
        assert!(!seen.contains("id-0"));
        assert!(seen.contains(&format!("id-{SEEN_CAP}")));
    }

    #[test]
    fn seen_ids_trim_is_a_noop_under_the_cap() {
        let mut seen = SeenIds::new();
        for i in 0..100 {
            seen.insert(&format!("id-{i}"));
        }
        seen.trim();
        assert_eq!(seen.len(), 100);
    }

    // --- Rate-limit handling ----------------------------------------------

    use std::sync::atomic::AtomicU32;

    use crate::types::Side;

    /// Feed that seeds empty, then rate-limits, then prints one trade.
    struct ScriptedFeed {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TradeFeed for ScriptedFeed {
        async fn get_trades(
            &self,
            _addr: &str,
            _query: TradeQuery,
        ) -> VenueResult<Vec<TradeEvent>> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(Vec::new()),
                1 => Err(VenueError::RateLimited),
                2 => Ok(vec![TradeEvent {
                    id: TradeEvent::make_id("0xaaa", Utc::now().timestamp(), 10.0),
                    token_id: "tok".to_string(),
                    market_id: "mkt".to_string(),
                    side: Side::Buy,
                    size: 10.0,
                    price: 0.52,
                    timestamp_secs: Utc::now().timestamp(),
                    title: None,
                    outcome: None,
                }]),
                _ => Ok(Vec::new()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_poll_pauses_five_seconds_then_resumes() {
        let feed = Arc::new(ScriptedFeed {
            calls: AtomicU32::new(0),
        });
        let detector = Arc::new(ActivityDetector::new(
            feed.clone(),
            Arc::new(AlertSink::new(Severity::Low)),
            "0xleader",
            Duration::from_millis(100),
            5,
        ));

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        tokio::spawn(detector.clone().run(events_tx, shutdown_rx));

        // The only emission is the post-resume trade: the initial poll seeds
        // silently and the rate-limited poll emits nothing while pausing.
        let event = events_rx.recv().await.expect("detector should resume and emit");
        let elapsed = started.elapsed();

        let InboundEvent::LeaderTrade { event, .. } = event else {
            panic!("unexpected event kind");
        };
        assert_eq!(event.token_id, "tok");
        assert!(
            elapsed >= RATE_LIMIT_PAUSE,
            "trade emitted after {elapsed:?}, inside the rate-limit pause"
        );
        assert!(elapsed < Duration::from_secs(10));
        assert_eq!(detector.detected(), 1);

        let _ = shutdown_tx.send(true);
    }
}
