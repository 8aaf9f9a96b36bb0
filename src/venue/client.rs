// =============================================================================
// Venue Client — typed access to the leader data and market data endpoints
// =============================================================================
//
// All reads are rate-gated per endpoint family and cached where the data
// tolerates it:
//   - portfolio value: 30 s TTL, stale value returned on fetch failure
//   - prices: 5 s TTL keyed by (token, intent), stale on failure
//
// The BUY/SELL side-flip happens here and only here: to BUY at market we ask
// the venue for its best SELL quote (the ask), and vice versa. Callers pass
// their *intent* side.
//
// No automatic retries beyond the stale-cache fallback; the caller decides
// how to react to a typed error.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::rate_gate::RateGates;
use crate::types::{BookLevel, Position, RawOrderBook, Side, TradeEvent};

/// Portfolio value cache TTL.
const PORTFOLIO_TTL: Duration = Duration::from_secs(30);
/// Price cache TTL.
const PRICE_TTL: Duration = Duration::from_secs(5);
/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Clock drift below this magnitude counts as synchronized.
const CLOCK_SYNC_TOLERANCE_MS: i64 = 100;

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Typed failure from a venue call. Rate limiting is its own kind so the
/// detector can pause rather than count it toward the degraded threshold.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue rate limit hit")]
    RateLimited,
    #[error("{endpoint} request failed: {source}")]
    Network {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned status {status}")]
    Upstream {
        endpoint: &'static str,
        status: u16,
    },
    #[error("{endpoint} returned malformed data: {detail}")]
    Decode {
        endpoint: &'static str,
        detail: String,
    },
}

pub type VenueResult<T> = Result<T, VenueError>;

// ---------------------------------------------------------------------------
// Clock sync
// ---------------------------------------------------------------------------

/// Result of a clock-drift probe against the venue.
#[derive(Debug, Clone, Copy)]
pub struct ClockSync {
    /// Local clock minus server clock, milliseconds.
    pub drift_ms: i64,
    pub synchronized: bool,
}

/// drift = avg(local_before, local_after) - server time.
fn compute_drift_ms(local_before_ms: i64, local_after_ms: i64, server_ms: i64) -> i64 {
    (local_before_ms + local_after_ms) / 2 - server_ms
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

struct CachedF64 {
    value: f64,
    fetched_at: Instant,
}

impl CachedF64 {
    fn fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawPosition {
    #[serde(alias = "tokenId", alias = "asset")]
    token_id: String,
    #[serde(default, alias = "marketId", alias = "conditionId")]
    market_id: String,
    #[serde(alias = "size")]
    quantity: f64,
    #[serde(default, alias = "avgPrice")]
    avg_price: f64,
    #[serde(default, alias = "curPrice", alias = "currentPrice")]
    current_price: Option<f64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
}

impl From<RawPosition> for Position {
    fn from(raw: RawPosition) -> Self {
        Position {
            token_id: raw.token_id,
            market_id: raw.market_id,
            quantity: raw.quantity,
            avg_price: raw.avg_price,
            current_price: raw.current_price,
            title: raw.title,
            outcome: raw.outcome,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawActivity {
    #[serde(rename = "type")]
    kind: String,
    #[serde(alias = "transactionHash", alias = "txHash")]
    tx_hash: String,
    /// Seconds since epoch.
    timestamp: i64,
    #[serde(alias = "tokenId", alias = "asset")]
    token_id: String,
    #[serde(default, alias = "marketId", alias = "conditionId")]
    market_id: String,
    side: Side,
    size: f64,
    price: f64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
}

/// Convert the venue's activity rows into trade events; only rows of type
/// "TRADE" count.
fn parse_activity(rows: Vec<RawActivity>) -> Vec<TradeEvent> {
    rows.into_iter()
        .filter(|r| r.kind == "TRADE")
        .map(|r| TradeEvent {
            id: TradeEvent::make_id(&r.tx_hash, r.timestamp, r.size),
            token_id: r.token_id,
            market_id: r.market_id,
            side: r.side,
            size: r.size,
            price: r.price,
            timestamp_secs: r.timestamp,
            title: r.title,
            outcome: r.outcome,
        })
        .collect()
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn value_as_f64(val: &serde_json::Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().ok()
    } else {
        val.as_f64()
    }
}

/// `/value` responds with either `{value}` or `[{value}]`, value being a
/// string or a number.
fn extract_portfolio_value(body: &serde_json::Value) -> Option<f64> {
    let obj = if let Some(arr) = body.as_array() {
        arr.first()?
    } else {
        body
    };
    value_as_f64(obj.get("value")?)
}

/// Parse one side of a `/book` response: an array of `{price, size}` where
/// both fields arrive as strings.
fn parse_book_side(levels: Option<&serde_json::Value>) -> Vec<BookLevel> {
    let Some(arr) = levels.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|l| {
            let price = value_as_f64(l.get("price")?)?;
            let size = value_as_f64(l.get("size")?)?;
            Some(BookLevel { price, size })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Options for a trade-activity query.
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeQuery {
    pub limit: u32,
    /// Only return trades at or after this unix-seconds timestamp.
    pub after_unix_sec: Option<i64>,
}

pub struct VenueClient {
    http: reqwest::Client,
    data_api_url: String,
    market_api_url: String,
    gates: RateGates,
    price_cache: RwLock<HashMap<(String, Side), CachedF64>>,
    portfolio_cache: RwLock<HashMap<String, CachedF64>>,
    clock_drift_ms: AtomicI64,
    clock_synchronized: AtomicBool,
}

impl VenueClient {
    pub fn new(data_api_url: impl Into<String>, market_api_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            data_api_url: data_api_url.into(),
            market_api_url: market_api_url.into(),
            gates: RateGates::new(),
            price_cache: RwLock::new(HashMap::new()),
            portfolio_cache: RwLock::new(HashMap::new()),
            clock_drift_ms: AtomicI64::new(0),
            clock_synchronized: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Leader data endpoints
    // -------------------------------------------------------------------------

    /// GET /positions?user=<addr>
    #[instrument(skip(self), name = "venue::get_positions")]
    pub async fn get_positions(&self, addr: &str) -> VenueResult<Vec<Position>> {
        self.gates.positions.acquire().await;
        let url = format!("{}/positions?user={}", self.data_api_url, addr);
        let body = self.send_get("positions", &url).await?;

        let raw: Vec<RawPosition> =
            serde_json::from_value(body).map_err(|e| VenueError::Decode {
                endpoint: "positions",
                detail: e.to_string(),
            })?;

        debug!(count = raw.len(), "positions fetched");
        Ok(raw.into_iter().map(Position::from).collect())
    }

    /// GET /activity?user=<addr>&limit=<n>&after=<unixSec>
    ///
    /// Returns trades newest-first, exactly as the venue reports them.
    #[instrument(skip(self), name = "venue::get_trades")]
    pub async fn get_trades(&self, addr: &str, query: TradeQuery) -> VenueResult<Vec<TradeEvent>> {
        self.gates.activity.acquire().await;
        let mut url = format!(
            "{}/activity?user={}&limit={}",
            self.data_api_url, addr, query.limit
        );
        if let Some(after) = query.after_unix_sec {
            url.push_str(&format!("&after={after}"));
        }
        let body = self.send_get("activity", &url).await?;

        let raw: Vec<RawActivity> =
            serde_json::from_value(body).map_err(|e| VenueError::Decode {
                endpoint: "activity",
                detail: e.to_string(),
            })?;

        let trades = parse_activity(raw);
        debug!(count = trades.len(), "activity fetched");
        Ok(trades)
    }

    /// GET /value?user=<addr>, cached for 30 s.
    ///
    /// `force_refresh` bypasses the TTL (used by the prefetch loop). A fetch
    /// failure falls back to the stale cached value with a warning.
    #[instrument(skip(self), name = "venue::get_portfolio_value")]
    pub async fn get_portfolio_value(&self, addr: &str, force_refresh: bool) -> VenueResult<f64> {
        if !force_refresh {
            let cache = self.portfolio_cache.read();
            if let Some(entry) = cache.get(addr) {
                if entry.fresh(PORTFOLIO_TTL) {
                    return Ok(entry.value);
                }
            }
        }

        self.gates.positions.acquire().await;
        let url = format!("{}/value?user={}", self.data_api_url, addr);
        match self.send_get("value", &url).await {
            Ok(body) => {
                let value = extract_portfolio_value(&body).ok_or_else(|| VenueError::Decode {
                    endpoint: "value",
                    detail: "missing value field".to_string(),
                })?;
                self.portfolio_cache.write().insert(
                    addr.to_string(),
                    CachedF64 {
                        value,
                        fetched_at: Instant::now(),
                    },
                );
                Ok(value)
            }
            Err(e) => {
                if let Some(entry) = self.portfolio_cache.read().get(addr) {
                    warn!(error = %e, "portfolio value fetch failed — serving stale cache");
                    return Ok(entry.value);
                }
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Market data endpoints
    // -------------------------------------------------------------------------

    /// Best executable price for an *intent* side, cached for 5 s.
    ///
    /// The side flip lives here: a BUY intent queries the venue's SELL quote
    /// (the ask) and a SELL intent queries the BUY quote (the bid).
    #[instrument(skip(self), name = "venue::get_price")]
    pub async fn get_price(&self, token_id: &str, intent: Side) -> VenueResult<f64> {
        let key = (token_id.to_string(), intent);
        {
            let cache = self.price_cache.read();
            if let Some(entry) = cache.get(&key) {
                if entry.fresh(PRICE_TTL) {
                    return Ok(entry.value);
                }
            }
        }

        self.gates.book.acquire().await;
        let quote_side = intent.flipped();
        let url = format!(
            "{}/price?token_id={}&side={}",
            self.market_api_url, token_id, quote_side
        );
        match self.send_get("price", &url).await {
            Ok(body) => {
                let price = body
                    .get("price")
                    .and_then(value_as_f64)
                    .ok_or_else(|| VenueError::Decode {
                        endpoint: "price",
                        detail: "missing price field".to_string(),
                    })?;
                self.price_cache.write().insert(
                    key,
                    CachedF64 {
                        value: price,
                        fetched_at: Instant::now(),
                    },
                );
                Ok(price)
            }
            Err(e) => {
                if let Some(entry) = self.price_cache.read().get(&key) {
                    warn!(token_id, error = %e, "price fetch failed — serving stale cache");
                    return Ok(entry.value);
                }
                Err(e)
            }
        }
    }

    /// Fetch a batch of prices concurrently. Individual failures surface per
    /// request; one bad token does not sink the batch.
    pub async fn get_prices_parallel(
        &self,
        requests: &[(String, Side)],
    ) -> Vec<(String, VenueResult<f64>)> {
        let futures = requests
            .iter()
            .map(|(token, intent)| async move {
                let result = self.get_price(token, *intent).await;
                (token.clone(), result)
            })
            .collect::<Vec<_>>();
        futures_util::future::join_all(futures).await
    }

    /// GET /book?token_id=<t>
    #[instrument(skip(self), name = "venue::get_order_book")]
    pub async fn get_order_book(&self, token_id: &str) -> VenueResult<RawOrderBook> {
        self.gates.book.acquire().await;
        let url = format!("{}/book?token_id={}", self.market_api_url, token_id);
        let body = self.send_get("book", &url).await?;

        Ok(RawOrderBook {
            bids: parse_book_side(body.get("bids")),
            asks: parse_book_side(body.get("asks")),
        })
    }

    /// GET /midpoint?token_id=<t>
    pub async fn get_midpoint(&self, token_id: &str) -> VenueResult<f64> {
        self.gates.book.acquire().await;
        let url = format!("{}/midpoint?token_id={}", self.market_api_url, token_id);
        let body = self.send_get("midpoint", &url).await?;
        body.get("mid")
            .and_then(value_as_f64)
            .ok_or_else(|| VenueError::Decode {
                endpoint: "midpoint",
                detail: "missing mid field".to_string(),
            })
    }

    /// GET /spread?token_id=<t>
    pub async fn get_spread(&self, token_id: &str) -> VenueResult<f64> {
        self.gates.book.acquire().await;
        let url = format!("{}/spread?token_id={}", self.market_api_url, token_id);
        let body = self.send_get("spread", &url).await?;
        body.get("spread")
            .and_then(value_as_f64)
            .ok_or_else(|| VenueError::Decode {
                endpoint: "spread",
                detail: "missing spread field".to_string(),
            })
    }

    // -------------------------------------------------------------------------
    // Clock sync
    // -------------------------------------------------------------------------

    /// Probe the venue's clock via the HTTP Date header of a lightweight
    /// request and store the measured drift. All detection latencies the
    /// engine reports externally are corrected by this drift.
    #[instrument(skip(self), name = "venue::check_clock_sync")]
    pub async fn check_clock_sync(&self) -> VenueResult<ClockSync> {
        self.gates.book.acquire().await;

        let local_before = chrono::Utc::now().timestamp_millis();
        let resp = self
            .http
            .get(&self.market_api_url)
            .send()
            .await
            .map_err(|source| VenueError::Network {
                endpoint: "clock",
                source,
            })?;
        let local_after = chrono::Utc::now().timestamp_millis();

        let server_ms = resp
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| dt.timestamp_millis())
            .ok_or_else(|| VenueError::Decode {
                endpoint: "clock",
                detail: "missing or malformed Date header".to_string(),
            })?;

        let drift_ms = compute_drift_ms(local_before, local_after, server_ms);
        let synchronized = drift_ms.abs() < CLOCK_SYNC_TOLERANCE_MS;

        self.clock_drift_ms.store(drift_ms, Ordering::Relaxed);
        self.clock_synchronized.store(synchronized, Ordering::Relaxed);

        debug!(drift_ms, synchronized, "clock sync checked");
        Ok(ClockSync {
            drift_ms,
            synchronized,
        })
    }

    /// Most recently measured drift (local minus server), milliseconds.
    pub fn clock_drift_ms(&self) -> i64 {
        self.clock_drift_ms.load(Ordering::Relaxed)
    }

    pub fn is_clock_synchronized(&self) -> bool {
        self.clock_synchronized.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn send_get(
        &self,
        endpoint: &'static str,
        url: &str,
    ) -> VenueResult<serde_json::Value> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| VenueError::Network { endpoint, source })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            warn!(endpoint, "venue rate limit response");
            return Err(VenueError::RateLimited);
        }
        if !status.is_success() {
            return Err(VenueError::Upstream {
                endpoint,
                status: status.as_u16(),
            });
        }

        resp.json().await.map_err(|e| VenueError::Decode {
            endpoint,
            detail: e.to_string(),
        })
    }
}

impl std::fmt::Debug for VenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueClient")
            .field("data_api_url", &self.data_api_url)
            .field("market_api_url", &self.market_api_url)
            .field("clock_drift_ms", &self.clock_drift_ms.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_side_is_flipped_exactly_once() {
        // BUY intent asks for the venue's SELL quote and vice versa.
        assert_eq!(Side::Buy.flipped(), Side::Sell);
        assert_eq!(Side::Sell.flipped(), Side::Buy);
    }

    #[test]
    fn activity_rows_filter_on_trade_type() {
        let rows: Vec<RawActivity> = serde_json::from_value(serde_json::json!([
            {
                "type": "TRADE",
                "transactionHash": "0xaaa",
                "timestamp": 1_700_000_000,
                "asset": "tok1",
                "conditionId": "mkt1",
                "side": "BUY",
                "size": 25.0,
                "price": 0.42
            },
            {
                "type": "REDEEM",
                "transactionHash": "0xbbb",
                "timestamp": 1_700_000_100,
                "asset": "tok2",
                "side": "SELL",
                "size": 10.0,
                "price": 0.9
            }
        ]))
        .unwrap();

        let trades = parse_activity(rows);
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.token_id, "tok1");
        assert_eq!(t.market_id, "mkt1");
        assert_eq!(t.side, Side::Buy);
        assert_eq!(t.id, TradeEvent::make_id("0xaaa", 1_700_000_000, 25.0));
    }

    #[test]
    fn portfolio_value_handles_object_and_array_shapes() {
        let obj = serde_json::json!({"value": "123.45"});
        assert!((extract_portfolio_value(&obj).unwrap() - 123.45).abs() < 1e-9);

        let arr = serde_json::json!([{"user": "0xabc", "value": 99.5}]);
        assert!((extract_portfolio_value(&arr).unwrap() - 99.5).abs() < 1e-9);

        let empty = serde_json::json!([]);
        assert!(extract_portfolio_value(&empty).is_none());
    }

    #[test]
    fn book_sides_parse_string_levels() {
        let body = serde_json::json!({
            "bids": [{"price": "0.49", "size": "100"}, {"price": "0.48", "size": "50"}],
            "asks": [{"price": "0.51", "size": "75"}]
        });
        let bids = parse_book_side(body.get("bids"));
        let asks = parse_book_side(body.get("asks"));
        assert_eq!(bids.len(), 2);
        assert_eq!(asks.len(), 1);
        assert!((bids[0].price - 0.49).abs() < 1e-9);
        assert!((asks[0].size - 75.0).abs() < 1e-9);
    }

    #[test]
    fn book_side_skips_malformed_levels() {
        let body = serde_json::json!({
            "bids": [{"price": "not-a-number", "size": "100"}, {"price": "0.40", "size": "10"}]
        });
        let bids = parse_book_side(body.get("bids"));
        assert_eq!(bids.len(), 1);
    }

    #[test]
    fn drift_uses_midpoint_of_local_timestamps() {
        // Local clock 150 ms ahead of the server, 100 ms round trip.
        let drift = compute_drift_ms(10_000, 10_100, 9_900);
        assert_eq!(drift, 150);
        // A perfectly synced clock.
        let drift = compute_drift_ms(10_000, 10_100, 10_050);
        assert_eq!(drift, 0);
    }

    #[test]
    fn value_as_f64_accepts_strings_and_numbers() {
        assert!((value_as_f64(&serde_json::json!("0.42")).unwrap() - 0.42).abs() < 1e-9);
        assert!((value_as_f64(&serde_json::json!(0.42)).unwrap() - 0.42).abs() < 1e-9);
        assert!(value_as_f64(&serde_json::json!(null)).is_none());
    }
}
