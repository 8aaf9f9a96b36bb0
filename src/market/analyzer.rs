// =============================================================================
// Market Analyzer — turns a raw order book into a decision-ready snapshot
// =============================================================================
//
// One snapshot per decision; snapshots are never cached or shared. All
// depth/spread thresholds come from the MarketGates config so the analyzer
// and the condition gate always agree on what "wide" or "thin" means.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::MarketGates;
use crate::types::{BookLevel, RawOrderBook, Side};

// ---------------------------------------------------------------------------
// Snapshot model
// ---------------------------------------------------------------------------

/// Classified state of the book at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketCondition {
    Normal,
    WideSpread,
    ThinBook,
    HighDivergence,
    Stale,
}

impl Default for MarketCondition {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::WideSpread => "wide_spread",
            Self::ThinBook => "thin_book",
            Self::HighDivergence => "high_divergence",
            Self::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// Ephemeral view of one token's market, built for a single decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub token_id: String,
    /// Unix milliseconds at snapshot time.
    pub timestamp_ms: i64,
    pub best_ask: f64,
    pub best_bid: f64,
    pub midpoint: f64,
    /// best_ask - best_bid, in price units.
    pub spread: f64,
    /// Spread in bps of $1 (token prices live in [0, 1]).
    pub spread_bps: f64,
    /// Summed size on bid levels within the depth range of the best bid.
    pub bid_depth_near: f64,
    pub ask_depth_near: f64,
    /// Volume-weighted fill price for the target size, when the book covers it.
    pub weighted_ask: Option<f64>,
    pub weighted_bid: Option<f64>,
    /// |midpoint - leader fill price|.
    pub divergence: f64,
    /// Divergence in bps of the leader price.
    pub divergence_bps: f64,
    pub is_volatile: bool,
    pub condition: MarketCondition,
    pub reasons: Vec<String>,
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Stateless book analysis configured by [`MarketGates`].
#[derive(Debug, Clone)]
pub struct MarketAnalyzer {
    cfg: MarketGates,
}

impl MarketAnalyzer {
    pub fn new(cfg: MarketGates) -> Self {
        Self { cfg }
    }

    /// Analyze a raw book against the leader's fill price.
    ///
    /// `target_size` enables the volume-weighted fill price computation.
    /// `book_age_ms` is the age of the book data when it came from a cache;
    /// books older than the stale threshold yield a `Stale` snapshot.
    pub fn analyze(
        &self,
        token_id: &str,
        book: &RawOrderBook,
        leader_price: f64,
        target_size: Option<f64>,
        book_age_ms: Option<i64>,
    ) -> MarketSnapshot {
        // Drop degenerate levels, then order each side best-first.
        let mut asks: Vec<BookLevel> = book
            .asks
            .iter()
            .copied()
            .filter(|l| l.price > 0.0 && l.size > 0.0)
            .collect();
        let mut bids: Vec<BookLevel> = book
            .bids
            .iter()
            .copied()
            .filter(|l| l.price > 0.0 && l.size > 0.0)
            .collect();
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));

        let best_ask = asks.first().map(|l| l.price).unwrap_or(leader_price);
        let best_bid = bids.first().map(|l| l.price).unwrap_or(leader_price);

        let range = self.cfg.depth_range_percent / 100.0;
        let ask_depth_near = depth_near(&asks, best_ask, range);
        let bid_depth_near = depth_near(&bids, best_bid, range);

        let weighted_ask = target_size.and_then(|size| weighted_fill(&asks, size));
        let weighted_bid = target_size.and_then(|size| weighted_fill(&bids, size));

        let empty = asks.is_empty() && bids.is_empty();
        let too_old = book_age_ms
            .map(|age| age > self.cfg.stale_price_threshold_ms)
            .unwrap_or(false);

        self.build_snapshot(
            token_id,
            best_ask,
            best_bid,
            leader_price,
            bid_depth_near,
            ask_depth_near,
            weighted_ask,
            weighted_bid,
            empty || too_old,
            // Depth gates only make sense when the book actually had levels.
            !empty,
        )
    }

    /// Fallback when no book is available: build a zero-depth snapshot from
    /// the price endpoints (or the leader price itself).
    pub fn analyze_from_prices(
        &self,
        token_id: &str,
        ask: f64,
        bid: f64,
        leader_price: f64,
    ) -> MarketSnapshot {
        let best_ask = if ask > 0.0 { ask } else { leader_price };
        let best_bid = if bid > 0.0 { bid } else { leader_price };
        self.build_snapshot(
            token_id, best_ask, best_bid, leader_price, 0.0, 0.0, None, None, false, false,
        )
    }

    /// Price the executor should aim for on the given side.
    pub fn recommended_price(snapshot: &MarketSnapshot, side: Side) -> f64 {
        match side {
            Side::Buy => snapshot.weighted_ask.unwrap_or(snapshot.best_ask),
            Side::Sell => snapshot.weighted_bid.unwrap_or(snapshot.best_bid),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_snapshot(
        &self,
        token_id: &str,
        best_ask: f64,
        best_bid: f64,
        leader_price: f64,
        bid_depth_near: f64,
        ask_depth_near: f64,
        weighted_ask: Option<f64>,
        weighted_bid: Option<f64>,
        stale: bool,
        has_depth_data: bool,
    ) -> MarketSnapshot {
        let midpoint = (best_ask + best_bid) / 2.0;
        let spread = best_ask - best_bid;
        let spread_bps = spread * 10_000.0;
        let divergence = (midpoint - leader_price).abs();
        let divergence_bps = if leader_price > 0.0 {
            divergence / leader_price * 10_000.0
        } else {
            0.0
        };

        let mut reasons = Vec::new();
        let mut is_volatile = false;

        let condition = if stale {
            reasons.push("no usable book data".to_string());
            MarketCondition::Stale
        } else if spread_bps > self.cfg.max_spread_bps {
            is_volatile = true;
            reasons.push(format!(
                "spread {spread_bps:.0} bps exceeds the {:.0} bps limit",
                self.cfg.max_spread_bps
            ));
            MarketCondition::WideSpread
        } else if spread_bps > self.cfg.wide_spread_threshold_bps {
            is_volatile = true;
            reasons.push(format!(
                "spread {spread_bps:.0} bps is above the wide threshold of {:.0} bps",
                self.cfg.wide_spread_threshold_bps
            ));
            MarketCondition::WideSpread
        } else if divergence_bps > self.cfg.max_divergence_bps {
            is_volatile = true;
            reasons.push(format!(
                "price diverges {divergence_bps:.0} bps from the leader fill"
            ));
            MarketCondition::HighDivergence
        } else if has_depth_data
            && (bid_depth_near < self.cfg.min_depth_shares
                || ask_depth_near < self.cfg.min_depth_shares)
        {
            is_volatile = true;
            reasons.push(format!(
                "near depth (bid {bid_depth_near:.0} / ask {ask_depth_near:.0}) below {:.0} shares",
                self.cfg.min_depth_shares
            ));
            MarketCondition::ThinBook
        } else {
            MarketCondition::Normal
        };

        MarketSnapshot {
            token_id: token_id.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            best_ask,
            best_bid,
            midpoint,
            spread,
            spread_bps,
            bid_depth_near,
            ask_depth_near,
            weighted_ask,
            weighted_bid,
            divergence,
            divergence_bps,
            is_volatile,
            condition,
            reasons,
        }
    }
}

/// Sum of sizes on levels within `range` (fractional) of the best price.
fn depth_near(levels: &[BookLevel], best: f64, range: f64) -> f64 {
    if best <= 0.0 {
        return 0.0;
    }
    let band = best * range;
    levels
        .iter()
        .filter(|l| (l.price - best).abs() <= band)
        .map(|l| l.size)
        .sum()
}

/// Walk best-first levels accumulating cost until `target` shares are
/// covered. Returns the volume-weighted price, or None if the book is too
/// shallow to fill the target.
fn weighted_fill(levels: &[BookLevel], target: f64) -> Option<f64> {
    if target <= 0.0 {
        return None;
    }
    let mut filled = 0.0;
    let mut cost = 0.0;
    for level in levels {
        let take = level.size.min(target - filled);
        filled += take;
        cost += take * level.price;
        if filled >= target - 1e-9 {
            return Some(cost / filled);
        }
    }
    None
}
