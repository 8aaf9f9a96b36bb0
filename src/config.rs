// =============================================================================
// Bot Configuration — environment-driven settings for the copy engine
// =============================================================================
//
// Every tunable documented for the engine lives here. `BotConfig::from_env`
// overlays environment variables (loaded via dotenv in main) on top of the
// defaults; components receive only the sub-struct they need.
//
// All fields carry `#[serde(default)]` so a partial JSON blob (tests,
// dashboards) deserialises cleanly.
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::alerts::Severity;
use crate::types::{
    BelowMinAction, DetectionMethod, OrderType, SellStrategy, SizingMethod, TradingMode,
};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_portfolio_percent() -> f64 {
    5.0
}

fn default_price_offset_bps() -> f64 {
    100.0
}

fn default_min_order_size() -> f64 {
    VENUE_MIN_ORDER_SIZE
}

fn default_max_daily_loss() -> f64 {
    50.0
}

fn default_max_total_loss() -> f64 {
    100.0
}

fn default_order_expiration_secs() -> u64 {
    60
}

fn default_adaptive_threshold_bps() -> f64 {
    150.0
}

fn default_adaptive_multiplier() -> f64 {
    0.5
}

fn default_max_adaptive_offset_bps() -> f64 {
    300.0
}

fn default_wide_spread_threshold_bps() -> f64 {
    500.0
}

fn default_max_spread_bps() -> f64 {
    800.0
}

fn default_max_divergence_bps() -> f64 {
    500.0
}

fn default_min_depth_shares() -> f64 {
    10.0
}

fn default_depth_range_percent() -> f64 {
    1.0
}

fn default_stale_price_threshold_ms() -> i64 {
    5000
}

fn default_take_profit_percent() -> f64 {
    10.0
}

fn default_stop_loss_percent() -> f64 {
    5.0
}

fn default_paper_balance() -> f64 {
    1000.0
}

fn default_store_path() -> String {
    "shadow_trades.db".to_string()
}

fn default_data_api_url() -> String {
    "https://data-api.shadow.trade".to_string()
}

fn default_market_api_url() -> String {
    "https://clob.shadow.trade".to_string()
}

fn default_market_ws_url() -> String {
    "wss://ws-subscriptions.shadow.trade/ws/market".to_string()
}

/// Hard floor on order size imposed by the venue.
pub const VENUE_MIN_ORDER_SIZE: f64 = 5.0;

// =============================================================================
// Sub-structs handed to individual components
// =============================================================================

/// Parameters for the copy-size calculator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(default)]
    pub method: SizingMethod,
    /// Portfolio percentage used by the portfolio/fixed strategies.
    #[serde(default = "default_portfolio_percent")]
    pub portfolio_percent: f64,
    #[serde(default = "default_min_order_size")]
    pub min_order_size: f64,
    /// Per-token share cap; 0 disables the cap.
    #[serde(default)]
    pub max_position_per_token: f64,
    #[serde(default)]
    pub below_min_action: BelowMinAction,
    #[serde(default)]
    pub sell_strategy: SellStrategy,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            method: SizingMethod::default(),
            portfolio_percent: default_portfolio_percent(),
            min_order_size: default_min_order_size(),
            max_position_per_token: 0.0,
            below_min_action: BelowMinAction::default(),
            sell_strategy: SellStrategy::default(),
        }
    }
}

/// Loss and spend limits enforced by the risk checker. A zero limit on a
/// spend field means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,
    #[serde(default = "default_max_total_loss")]
    pub max_total_loss: f64,
    #[serde(default)]
    pub max_token_spend: f64,
    #[serde(default)]
    pub max_market_spend: f64,
    #[serde(default)]
    pub total_holdings_limit: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_total_loss: default_max_total_loss(),
            max_token_spend: 0.0,
            max_market_spend: 0.0,
            total_holdings_limit: 0.0,
        }
    }
}

/// Thresholds shared by the market analyzer and the condition gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketGates {
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: f64,
    #[serde(default = "default_wide_spread_threshold_bps")]
    pub wide_spread_threshold_bps: f64,
    #[serde(default = "default_max_divergence_bps")]
    pub max_divergence_bps: f64,
    #[serde(default = "default_min_depth_shares")]
    pub min_depth_shares: f64,
    /// Levels within this percentage of the best price count as near depth.
    #[serde(default = "default_depth_range_percent")]
    pub depth_range_percent: f64,
    #[serde(default = "default_stale_price_threshold_ms")]
    pub stale_price_threshold_ms: i64,
}

impl Default for MarketGates {
    fn default() -> Self {
        Self {
            max_spread_bps: default_max_spread_bps(),
            wide_spread_threshold_bps: default_wide_spread_threshold_bps(),
            max_divergence_bps: default_max_divergence_bps(),
            min_depth_shares: default_min_depth_shares(),
            depth_range_percent: default_depth_range_percent(),
            stale_price_threshold_ms: default_stale_price_threshold_ms(),
        }
    }
}

/// Spread-adaptive price offset parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptivePricing {
    /// Base offset applied to every order, in bps.
    #[serde(default = "default_price_offset_bps")]
    pub price_offset_bps: f64,
    /// Spread above which the offset scales with the spread.
    #[serde(default = "default_adaptive_threshold_bps")]
    pub adaptive_threshold_bps: f64,
    #[serde(default = "default_adaptive_multiplier")]
    pub spread_multiplier: f64,
    #[serde(default = "default_max_adaptive_offset_bps")]
    pub max_adaptive_offset_bps: f64,
}

impl Default for AdaptivePricing {
    fn default() -> Self {
        Self {
            price_offset_bps: default_price_offset_bps(),
            adaptive_threshold_bps: default_adaptive_threshold_bps(),
            spread_multiplier: default_adaptive_multiplier(),
            max_adaptive_offset_bps: default_max_adaptive_offset_bps(),
        }
    }
}

/// Take-profit / stop-loss monitor settings. Percentages are plain percent
/// (10.0 means 10 %).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpSlConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
}

impl Default for TpSlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            take_profit_percent: default_take_profit_percent(),
            stop_loss_percent: default_stop_loss_percent(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the Shadow copy engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Address of the trader being copied.
    pub leader_address: String,
    /// Optional human tag for the leader, used in logs and alerts.
    #[serde(default)]
    pub leader_tag: Option<String>,

    // --- Detection ----------------------------------------------------------
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default)]
    pub detection_method: DetectionMethod,

    // --- Order shaping ------------------------------------------------------
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub pricing: AdaptivePricing,
    #[serde(default)]
    pub order_type: OrderType,
    #[serde(default = "default_order_expiration_secs")]
    pub order_expiration_secs: u64,
    /// Build the decision snapshot from the leader's fill price instead of
    /// the book when the book is unavailable.
    #[serde(default)]
    pub use_trader_price: bool,

    // --- Gates --------------------------------------------------------------
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub market: MarketGates,
    #[serde(default)]
    pub tpsl: TpSlConfig,

    // --- Execution ----------------------------------------------------------
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default = "default_paper_balance")]
    pub paper_balance: f64,

    // --- Infrastructure -----------------------------------------------------
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_data_api_url")]
    pub data_api_url: String,
    #[serde(default = "default_market_api_url")]
    pub market_api_url: String,
    #[serde(default = "default_market_ws_url")]
    pub market_ws_url: String,

    // --- Alerts -------------------------------------------------------------
    #[serde(default)]
    pub alert_min_severity: Severity,
    #[serde(default)]
    pub alert_webhook_primary: Option<String>,
    #[serde(default)]
    pub alert_webhook_secondary: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            leader_address: String::new(),
            leader_tag: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
            detection_method: DetectionMethod::default(),
            sizing: SizingConfig::default(),
            pricing: AdaptivePricing::default(),
            order_type: OrderType::default(),
            order_expiration_secs: default_order_expiration_secs(),
            use_trader_price: false,
            risk: RiskLimits::default(),
            market: MarketGates::default(),
            tpsl: TpSlConfig::default(),
            trading_mode: TradingMode::default(),
            paper_balance: default_paper_balance(),
            store_path: default_store_path(),
            data_api_url: default_data_api_url(),
            market_api_url: default_market_api_url(),
            market_ws_url: default_market_ws_url(),
            alert_min_severity: Severity::default(),
            alert_webhook_primary: None,
            alert_webhook_secondary: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment parsing helpers
// ---------------------------------------------------------------------------

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_str(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "unparseable env value — keeping default");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env_str(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(key, value = other, "unparseable boolean env value — keeping default");
            None
        }
    }
}

/// Parse an enum-ish value via its serde representation.
fn env_enum<T: serde::de::DeserializeOwned>(key: &str) -> Option<T> {
    let raw = env_str(key)?;
    match serde_json::from_value(serde_json::Value::String(raw.trim().to_string())) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, "unknown enum env value — keeping default");
            None
        }
    }
}

impl BotConfig {
    /// Build a config from the process environment.
    ///
    /// `LEADER_ADDRESS` is the only required key; everything else falls back
    /// to the defaults above.
    pub fn from_env() -> Result<Self> {
        let Some(leader_address) = env_str("LEADER_ADDRESS") else {
            bail!("LEADER_ADDRESS is required");
        };

        let mut cfg = Self {
            leader_address,
            ..Self::default()
        };

        cfg.leader_tag = env_str("LEADER_TAG");
        if let Some(v) = env_parse("POLL_INTERVAL_MS") {
            cfg.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("MAX_CONSECUTIVE_ERRORS") {
            cfg.max_consecutive_errors = v;
        }
        if let Some(v) = env_enum("DETECTION_METHOD") {
            cfg.detection_method = v;
        }

        if let Some(v) = env_enum("SIZING_METHOD") {
            cfg.sizing.method = v;
        }
        if let Some(v) = env_parse("PORTFOLIO_PERCENT") {
            cfg.sizing.portfolio_percent = v;
        }
        if let Some(v) = env_parse("MIN_ORDER_SIZE") {
            cfg.sizing.min_order_size = v;
        }
        if let Some(v) = env_parse("MAX_POSITION_PER_TOKEN") {
            cfg.sizing.max_position_per_token = v;
        }
        if let Some(v) = env_enum("BELOW_MIN_ACTION") {
            cfg.sizing.below_min_action = v;
        }
        if let Some(v) = env_enum("SELL_STRATEGY") {
            cfg.sizing.sell_strategy = v;
        }

        if let Some(v) = env_parse("PRICE_OFFSET_BPS") {
            cfg.pricing.price_offset_bps = v;
        }
        if let Some(v) = env_parse("ADAPTIVE_SPREAD_THRESHOLD_BPS") {
            cfg.pricing.adaptive_threshold_bps = v;
        }
        if let Some(v) = env_parse("ADAPTIVE_SPREAD_MULTIPLIER") {
            cfg.pricing.spread_multiplier = v;
        }
        if let Some(v) = env_parse("MAX_ADAPTIVE_OFFSET_BPS") {
            cfg.pricing.max_adaptive_offset_bps = v;
        }
        if let Some(v) = env_enum("ORDER_TYPE") {
            cfg.order_type = v;
        }
        if let Some(v) = env_parse("ORDER_EXPIRATION_SECS") {
            cfg.order_expiration_secs = v;
        }
        if let Some(v) = env_bool("USE_TRADER_PRICE") {
            cfg.use_trader_price = v;
        }

        if let Some(v) = env_parse("MAX_DAILY_LOSS") {
            cfg.risk.max_daily_loss = v;
        }
        if let Some(v) = env_parse("MAX_TOTAL_LOSS") {
            cfg.risk.max_total_loss = v;
        }
        if let Some(v) = env_parse("MAX_TOKEN_SPEND") {
            cfg.risk.max_token_spend = v;
        }
        if let Some(v) = env_parse("MAX_MARKET_SPEND") {
            cfg.risk.max_market_spend = v;
        }
        if let Some(v) = env_parse("TOTAL_HOLDINGS_LIMIT") {
            cfg.risk.total_holdings_limit = v;
        }

        if let Some(v) = env_parse("MAX_SPREAD_BPS") {
            cfg.market.max_spread_bps = v;
        }
        if let Some(v) = env_parse("WIDE_SPREAD_THRESHOLD_BPS") {
            cfg.market.wide_spread_threshold_bps = v;
        }
        if let Some(v) = env_parse("MAX_DIVERGENCE_BPS") {
            cfg.market.max_divergence_bps = v;
        }
        if let Some(v) = env_parse("MIN_DEPTH_SHARES") {
            cfg.market.min_depth_shares = v;
        }
        if let Some(v) = env_parse("DEPTH_RANGE_PERCENT") {
            cfg.market.depth_range_percent = v;
        }
        if let Some(v) = env_parse("STALE_PRICE_THRESHOLD_MS") {
            cfg.market.stale_price_threshold_ms = v;
        }

        if let Some(v) = env_bool("TPSL_ENABLED") {
            cfg.tpsl.enabled = v;
        }
        if let Some(v) = env_parse("TAKE_PROFIT_PERCENT") {
            cfg.tpsl.take_profit_percent = v;
        }
        if let Some(v) = env_parse("STOP_LOSS_PERCENT") {
            cfg.tpsl.stop_loss_percent = v;
        }

        if let Some(v) = env_enum("TRADING_MODE") {
            cfg.trading_mode = v;
        }
        if let Some(v) = env_parse("PAPER_BALANCE") {
            cfg.paper_balance = v;
        }

        if let Some(v) = env_str("STORE_PATH") {
            cfg.store_path = v;
        }
        if let Some(v) = env_str("DATA_API_URL") {
            cfg.data_api_url = v;
        }
        if let Some(v) = env_str("MARKET_API_URL") {
            cfg.market_api_url = v;
        }
        if let Some(v) = env_str("MARKET_WS_URL") {
            cfg.market_ws_url = v;
        }

        if let Some(v) = env_enum("ALERT_MIN_SEVERITY") {
            cfg.alert_min_severity = v;
        }
        cfg.alert_webhook_primary = env_str("ALERT_WEBHOOK_PRIMARY");
        cfg.alert_webhook_secondary = env_str("ALERT_WEBHOOK_SECONDARY");

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.leader_address.trim().is_empty() {
            bail!("leader address must not be empty");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll interval must be positive");
        }
        if !(0.0..=100.0).contains(&self.sizing.portfolio_percent) {
            bail!("portfolio percent must be within [0, 100]");
        }
        if self.sizing.min_order_size < VENUE_MIN_ORDER_SIZE {
            bail!(
                "min order size {} is below the venue floor of {}",
                self.sizing.min_order_size,
                VENUE_MIN_ORDER_SIZE
            );
        }
        if self.trading_mode == TradingMode::Paper && self.paper_balance <= 0.0 {
            bail!("paper balance must be positive in paper mode");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BotConfig {
        BotConfig {
            leader_address: "0xleader".to_string(),
            ..BotConfig::default()
        }
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = base();
        assert_eq!(cfg.poll_interval_ms, 1000);
        assert_eq!(cfg.max_consecutive_errors, 5);
        assert!((cfg.pricing.adaptive_threshold_bps - 150.0).abs() < f64::EPSILON);
        assert!((cfg.pricing.spread_multiplier - 0.5).abs() < f64::EPSILON);
        assert!((cfg.pricing.max_adaptive_offset_bps - 300.0).abs() < f64::EPSILON);
        assert!((cfg.market.depth_range_percent - 1.0).abs() < f64::EPSILON);
        assert!((cfg.sizing.min_order_size - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.trading_mode, TradingMode::Paper);
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "leader_address": "0xabc", "poll_interval_ms": 250 }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.leader_address, "0xabc");
        assert_eq!(cfg.poll_interval_ms, 250);
        assert_eq!(cfg.sizing.method, SizingMethod::ProportionalToPortfolio);
        assert!((cfg.paper_balance - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_sub_floor_min_order_size() {
        let mut cfg = base();
        cfg.sizing.min_order_size = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut cfg = base();
        cfg.poll_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = base();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.leader_address, cfg2.leader_address);
        assert_eq!(cfg.sizing.method, cfg2.sizing.method);
        assert_eq!(cfg.order_type, cfg2.order_type);
    }
}
