// =============================================================================
// Shared types used across the Shadow copy-trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order side
// ---------------------------------------------------------------------------

/// Side of a trade or order. Matches the venue's "BUY"/"SELL" strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// The opposite side. Used by the venue client's quote side-flip.
    pub fn flipped(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Mode enums
// ---------------------------------------------------------------------------

/// Whether orders are simulated locally or routed to a live adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// How leader trades are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Activity,
    Positions,
}

impl Default for DetectionMethod {
    fn default() -> Self {
        Self::Activity
    }
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Activity => write!(f, "activity"),
            Self::Positions => write!(f, "positions"),
        }
    }
}

/// BUY sizing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMethod {
    ProportionalToPortfolio,
    ProportionalToTrader,
    Fixed,
}

impl Default for SizingMethod {
    fn default() -> Self {
        Self::ProportionalToPortfolio
    }
}

/// SELL sizing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellStrategy {
    Proportional,
    FullExit,
    MatchDelta,
}

impl Default for SellStrategy {
    fn default() -> Self {
        Self::Proportional
    }
}

/// What to do when a computed BUY size lands below the minimum order size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BelowMinAction {
    BuyAtMin,
    Skip,
}

impl Default for BelowMinAction {
    fn default() -> Self {
        Self::Skip
    }
}

/// Coarse risk classification attached to gate decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Low
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

// ---------------------------------------------------------------------------
// Venue positions
// ---------------------------------------------------------------------------

/// A position held at the venue by the leader or the follower.
///
/// Quantity is always >= 0; the venue deletes rather than zeroes positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token_id: String,
    #[serde(default)]
    pub market_id: String,
    pub quantity: f64,
    /// Average entry price in [0, 1].
    #[serde(default)]
    pub avg_price: f64,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

// ---------------------------------------------------------------------------
// Leader trade events
// ---------------------------------------------------------------------------

/// A single leader fill observed on the activity feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Dedup id derived from tx hash + timestamp + size; see [`TradeEvent::make_id`].
    pub id: String,
    pub token_id: String,
    pub market_id: String,
    pub side: Side,
    /// Shares traded; always positive.
    pub size: f64,
    /// Fill price in (0, 1).
    pub price: f64,
    /// Venue timestamp, seconds resolution.
    pub timestamp_secs: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

impl TradeEvent {
    /// Build the dedup id for a fill. One transaction can contain several
    /// fills of different sizes, so the size participates in the id.
    pub fn make_id(tx_hash: &str, timestamp_secs: i64, size: f64) -> String {
        format!("{tx_hash}-{timestamp_secs}-{size:.4}")
    }
}

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// One price level of the raw order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Raw order book as returned by the venue (unsorted, unfiltered).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl RawOrderBook {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Follower orders
// ---------------------------------------------------------------------------

/// Order type submitted to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Limit
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// Venue price band for submitted orders.
pub const MIN_ORDER_PRICE: f64 = 0.01;
pub const MAX_ORDER_PRICE: f64 = 0.99;

/// Follower order intent produced by the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub token_id: String,
    /// Market the token belongs to; used by per-market spend caps.
    #[serde(default)]
    pub market_id: String,
    pub side: Side,
    /// Post-adjustment share count, rounded to 0.01.
    pub size: f64,
    /// Post-adjustment submit price, clamped to [0.01, 0.99].
    pub price: f64,
    pub order_type: OrderType,
    /// Relative expiration in seconds, when the order type supports it.
    #[serde(default)]
    pub expiration_secs: Option<u64>,
    /// Absolute expiry, unix milliseconds.
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    /// Effective price offset applied, in bps.
    #[serde(default)]
    pub offset_bps: f64,
    /// Id of the leader trade that triggered this order, if any.
    #[serde(default)]
    pub source_trade_id: Option<String>,
}

impl OrderSpec {
    /// Build a spec enforcing the price band and 0.01 size granularity.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token_id: impl Into<String>,
        side: Side,
        size: f64,
        price: f64,
        order_type: OrderType,
        expiration_secs: Option<u64>,
        offset_bps: f64,
        source_trade_id: Option<String>,
    ) -> Self {
        let price = price.clamp(MIN_ORDER_PRICE, MAX_ORDER_PRICE);
        let size = (size * 100.0).floor() / 100.0;
        let expires_at_ms =
            expiration_secs.map(|secs| chrono::Utc::now().timestamp_millis() + secs as i64 * 1000);
        Self {
            token_id: token_id.into(),
            market_id: String::new(),
            side,
            size,
            price,
            order_type,
            expiration_secs,
            expires_at_ms,
            offset_bps,
            source_trade_id,
        }
    }

    pub fn with_market(mut self, market_id: impl Into<String>) -> Self {
        self.market_id = market_id.into();
        self
    }

    /// Notional cost of the order in USD.
    pub fn cost(&self) -> f64 {
        self.size * self.price
    }
}

/// Execution status of a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Live,
    Filled,
    Partial,
    Expired,
    Cancelled,
    Failed,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Live => "live",
            Self::Filled => "filled",
            Self::Partial => "partial",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of an execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub remaining_size: f64,
    pub avg_fill_price: f64,
    #[serde(default)]
    pub error: Option<String>,
    /// Unix milliseconds when the order was accepted by the executor.
    pub placed_at_ms: i64,
    /// Unix milliseconds when the fill completed, if it did.
    #[serde(default)]
    pub executed_at_ms: Option<i64>,
    pub mode: TradingMode,
    pub order_type: OrderType,
    #[serde(default)]
    pub expired: bool,
}

impl OrderResult {
    pub fn is_fill(&self) -> bool {
        matches!(self.status, OrderStatus::Filled | OrderStatus::Partial)
    }
}

// ---------------------------------------------------------------------------
// Inbound event queue
// ---------------------------------------------------------------------------

/// Why a TP/SL trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    TakeProfit,
    StopLoss,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit => write!(f, "take_profit"),
            Self::StopLoss => write!(f, "stop_loss"),
        }
    }
}

/// A TP/SL exit signal with a prebuilt market-sell order.
#[derive(Debug, Clone)]
pub struct ExitTrigger {
    pub kind: TriggerKind,
    pub token_id: String,
    /// Entry price of the position at trigger time; P&L is computed against
    /// this value, not the executor's post-trade state.
    pub entry_price: f64,
    pub current_price: f64,
    pub order: OrderSpec,
}

/// Events consumed serially by the orchestrator. Producers (activity
/// detector, TP/SL monitor, dashboard hooks) publish onto one bounded queue
/// instead of holding back-pointers into the orchestrator.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    LeaderTrade {
        event: TradeEvent,
        detection_latency_ms: i64,
    },
    TpSlTrigger(ExitTrigger),
    OneClickSell,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_flip_is_symmetric() {
        assert_eq!(Side::Buy.flipped(), Side::Sell);
        assert_eq!(Side::Sell.flipped(), Side::Buy);
        assert_eq!(Side::Buy.flipped().flipped(), Side::Buy);
    }

    #[test]
    fn side_parses_venue_strings() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        assert!("HOLD".parse::<Side>().is_err());
    }

    #[test]
    fn trade_id_distinguishes_fills_within_one_tx() {
        let a = TradeEvent::make_id("0xabc", 1_700_000_000, 10.0);
        let b = TradeEvent::make_id("0xabc", 1_700_000_000, 25.5);
        assert_ne!(a, b);
        assert_eq!(a, TradeEvent::make_id("0xabc", 1_700_000_000, 10.0));
    }

    #[test]
    fn order_spec_enforces_price_band_and_size_granularity() {
        let spec = OrderSpec::new(
            "tok",
            Side::Buy,
            10.999,
            1.25,
            OrderType::Limit,
            Some(60),
            0.0,
            None,
        );
        assert!((spec.price - 0.99).abs() < f64::EPSILON);
        assert!((spec.size - 10.99).abs() < 1e-9);
        assert!(spec.expires_at_ms.is_some());

        let low = OrderSpec::new("tok", Side::Sell, 5.0, 0.0001, OrderType::Limit, None, 0.0, None);
        assert!((low.price - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn sizing_enums_deserialize_snake_case() {
        let m: SizingMethod = serde_json::from_str("\"proportional_to_trader\"").unwrap();
        assert_eq!(m, SizingMethod::ProportionalToTrader);
        let s: SellStrategy = serde_json::from_str("\"full_exit\"").unwrap();
        assert_eq!(s, SellStrategy::FullExit);
        let a: BelowMinAction = serde_json::from_str("\"buy_at_min\"").unwrap();
        assert_eq!(a, BelowMinAction::BuyAtMin);
    }
}
