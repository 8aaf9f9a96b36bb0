// =============================================================================
// Cache Warmers — keep hot market data at most one TTL old
// =============================================================================
//
// Three background loops, all driven by the watched-token set:
//   - book warmer:       refreshes order books every 2.5 s
//   - price warmer:      refreshes BUY-side prices every 4 s
//   - portfolio prefetch: refreshes the leader's portfolio value every 30 s
//
// The watched set starts as the leader's current positions and grows when
// the leader opens a new one. Updates are whole-set replacements fanned out
// over a watch channel; the warmers pick up the new set on their next tick.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::types::{RawOrderBook, Side};
use crate::venue::client::VenueClient;

/// Book warmer refresh period.
pub const BOOK_WARM_INTERVAL: Duration = Duration::from_millis(2500);
/// Price warmer refresh period.
pub const PRICE_WARM_INTERVAL: Duration = Duration::from_secs(4);
/// Portfolio value prefetch period.
pub const PORTFOLIO_PREFETCH_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Watched tokens
// ---------------------------------------------------------------------------

/// The replicated set of tokens whose caches and WS subscriptions are kept
/// warm. Writers replace the entire set; readers hold a watch receiver.
#[derive(Debug)]
pub struct WatchedTokens {
    tx: watch::Sender<Vec<String>>,
}

impl WatchedTokens {
    pub fn new(initial: Vec<String>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the whole set. No-op when nothing changed.
    pub fn replace(&self, mut tokens: Vec<String>) {
        tokens.sort();
        tokens.dedup();
        self.tx.send_if_modified(|current| {
            if *current == tokens {
                false
            } else {
                *current = tokens;
                true
            }
        });
    }

    /// Add one token, preserving replace-entire-set semantics underneath.
    pub fn add(&self, token_id: &str) {
        let mut tokens = self.current();
        if tokens.iter().any(|t| t == token_id) {
            return;
        }
        tokens.push(token_id.to_string());
        self.replace(tokens);
    }

    pub fn current(&self) -> Vec<String> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Book cache
// ---------------------------------------------------------------------------

struct CachedBook {
    book: RawOrderBook,
    fetched_at: Instant,
}

/// Order books maintained by the book warmer. Single writer (the warmer),
/// many readers; each write replaces the whole entry.
#[derive(Default)]
pub struct BookCache {
    books: RwLock<HashMap<String, CachedBook>>,
}

impl BookCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token_id: &str, book: RawOrderBook) {
        self.books.write().insert(
            token_id.to_string(),
            CachedBook {
                book,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Cached book plus its age in milliseconds, if present.
    pub fn get(&self, token_id: &str) -> Option<(RawOrderBook, i64)> {
        let books = self.books.read();
        let entry = books.get(token_id)?;
        let age_ms = entry.fetched_at.elapsed().as_millis() as i64;
        Some((entry.book.clone(), age_ms))
    }
}

// ---------------------------------------------------------------------------
// Warmer loops
// ---------------------------------------------------------------------------

/// Refresh order books for all watched tokens until shutdown.
pub async fn run_book_warmer(
    client: Arc<VenueClient>,
    cache: Arc<BookCache>,
    watched: watch::Receiver<Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_ms = BOOK_WARM_INTERVAL.as_millis() as u64, "book warmer started");
    let mut ticker = tokio::time::interval(BOOK_WARM_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("book warmer stopping");
                return;
            }
        }

        let tokens = watched.borrow().clone();
        for token in tokens {
            match client.get_order_book(&token).await {
                Ok(book) => cache.insert(&token, book),
                Err(e) => warn!(token = %token, error = %e, "book warm failed"),
            }
        }
    }
}

/// Refresh BUY-side prices for all watched tokens until shutdown. The venue
/// client's own price cache is the store; this loop just keeps it warm.
pub async fn run_price_warmer(
    client: Arc<VenueClient>,
    watched: watch::Receiver<Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_s = PRICE_WARM_INTERVAL.as_secs(), "price warmer started");
    let mut ticker = tokio::time::interval(PRICE_WARM_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("price warmer stopping");
                return;
            }
        }

        let requests: Vec<(String, Side)> = watched
            .borrow()
            .iter()
            .map(|t| (t.clone(), Side::Buy))
            .collect();
        if requests.is_empty() {
            continue;
        }

        let results = client.get_prices_parallel(&requests).await;
        let failures = results.iter().filter(|(_, r)| r.is_err()).count();
        if failures > 0 {
            debug!(failures, total = results.len(), "price warm round had failures");
        }
    }
}

/// Keep the leader's portfolio value fresh until shutdown.
pub async fn run_portfolio_prefetch(
    client: Arc<VenueClient>,
    leader_address: String,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_s = PORTFOLIO_PREFETCH_INTERVAL.as_secs(),
        "portfolio prefetch started"
    );
    let mut ticker = tokio::time::interval(PORTFOLIO_PREFETCH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                info!("portfolio prefetch stopping");
                return;
            }
        }

        if let Err(e) = client.get_portfolio_value(&leader_address, true).await {
            warn!(error = %e, "portfolio prefetch failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookLevel;

    #[test]
    fn watched_tokens_replace_deduplicates() {
        let watched = WatchedTokens::new(vec![]);
        watched.replace(vec!["b".into(), "a".into(), "b".into()]);
        assert_eq!(watched.current(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn watched_tokens_add_is_idempotent() {
        let watched = WatchedTokens::new(vec!["a".into()]);
        let mut rx = watched.subscribe();
        rx.borrow_and_update();

        watched.add("a");
        assert!(!rx.has_changed().unwrap());

        watched.add("b");
        assert!(rx.has_changed().unwrap());
        assert_eq!(watched.current().len(), 2);
    }

    #[test]
    fn book_cache_reports_age() {
        let cache = BookCache::new();
        assert!(cache.get("tok").is_none());

        cache.insert(
            "tok",
            RawOrderBook {
                bids: vec![BookLevel { price: 0.49, size: 10.0 }],
                asks: vec![],
            },
        );
        let (book, age_ms) = cache.get("tok").unwrap();
        assert_eq!(book.bids.len(), 1);
        assert!(age_ms < 1000);
    }
}
