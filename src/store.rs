// =============================================================================
// Trade Store — append-only SQLite persistence for trades and sessions
// =============================================================================
//
// WAL journal mode gives single-writer / many-reader concurrency. Write
// errors are logged and swallowed: persistence must never fail the hot
// path. Analytics (summary + advanced metrics) are computed on demand.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::types::{OrderStatus, OrderType, Side, TradingMode};

/// Schema, applied idempotently at open.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    mode TEXT NOT NULL,
    detection_method TEXT NOT NULL,
    leader_address TEXT NOT NULL,
    poll_count INTEGER NOT NULL DEFAULT 0,
    trades_detected INTEGER NOT NULL DEFAULT 0,
    trades_executed INTEGER NOT NULL DEFAULT 0,
    total_pnl REAL NOT NULL DEFAULT 0,
    starting_balance REAL NOT NULL,
    ending_balance REAL
);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    token_id TEXT NOT NULL,
    market_id TEXT NOT NULL DEFAULT '',
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    requested_size REAL NOT NULL,
    filled_size REAL NOT NULL,
    fill_price REAL NOT NULL,
    cost REAL NOT NULL,
    status TEXT NOT NULL,
    mode TEXT NOT NULL,
    pnl REAL,
    source_trade_id TEXT,
    title TEXT,
    detection_latency_ms INTEGER,
    execution_latency_ms INTEGER,
    total_latency_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_trades_session ON trades(session_id);
CREATE INDEX IF NOT EXISTS idx_trades_token ON trades(token_id);
CREATE INDEX IF NOT EXISTS idx_trades_created ON trades(created_at);
"#;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Detection / execution / total latency for one trade, already
/// drift-corrected by the orchestrator.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyTriplet {
    pub detection_ms: Option<i64>,
    pub execution_ms: Option<i64>,
    pub total_ms: Option<i64>,
}

/// Denormalised trade row handed to [`TradeStore::record_trade`].
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub session_id: i64,
    pub token_id: String,
    pub market_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub requested_size: f64,
    pub filled_size: f64,
    pub fill_price: f64,
    pub status: OrderStatus,
    pub mode: TradingMode,
    pub pnl: Option<f64>,
    pub source_trade_id: Option<String>,
    pub title: Option<String>,
    pub latency: LatencyTriplet,
}

/// Final statistics stamped into the session row at close.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub poll_count: u64,
    pub trades_detected: u64,
    pub trades_executed: u64,
    pub total_pnl: f64,
    pub ending_balance: f64,
}

/// Aggregate statistics over recorded trades.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeSummary {
    pub total_trades: u64,
    pub buys: u64,
    pub sells: u64,
    pub volume: f64,
    pub total_pnl: f64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: f64,
    pub avg_size: f64,
    pub avg_total_latency_ms: f64,
    pub best_pnl: f64,
    pub worst_pnl: f64,
}

/// Performance metrics over the closed (SELL) trades, in time order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdvancedMetrics {
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub longest_win_streak: u32,
    pub longest_loss_streak: u32,
    pub expectancy: f64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open trade store at {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply trade store schema")?;
        info!(path = %path.display(), "trade store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply trade store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Open a new session row and return its id.
    pub fn open_session(
        &self,
        mode: TradingMode,
        detection_method: &str,
        leader_address: &str,
        starting_balance: f64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (started_at, mode, detection_method, leader_address, starting_balance)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Utc::now().timestamp_millis(),
                mode.to_string(),
                detection_method,
                leader_address,
                starting_balance
            ],
        )
        .context("failed to insert session")?;
        let id = conn.last_insert_rowid();
        info!(session_id = id, "session opened");
        Ok(id)
    }

    /// Stamp final statistics and the end time into a session row.
    pub fn close_session(&self, session_id: i64, stats: SessionStats) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET ended_at = ?1, poll_count = ?2, trades_detected = ?3,
                    trades_executed = ?4, total_pnl = ?5, ending_balance = ?6
             WHERE id = ?7",
            params![
                Utc::now().timestamp_millis(),
                stats.poll_count as i64,
                stats.trades_detected as i64,
                stats.trades_executed as i64,
                stats.total_pnl,
                stats.ending_balance,
                session_id
            ],
        )
        .context("failed to close session")?;
        info!(session_id, "session closed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Append a trade row. Storage failures log and are swallowed — the hot
    /// path must not die on a disk hiccup.
    pub fn record_trade(&self, record: &TradeRecord) {
        let cost = record.filled_size * record.fill_price;
        let result = self.conn.lock().execute(
            "INSERT INTO trades (session_id, created_at, token_id, market_id, side, order_type,
                    requested_size, filled_size, fill_price, cost, status, mode, pnl,
                    source_trade_id, title, detection_latency_ms, execution_latency_ms, total_latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                record.session_id,
                Utc::now().timestamp_millis(),
                record.token_id,
                record.market_id,
                record.side.to_string(),
                record.order_type.to_string(),
                record.requested_size,
                record.filled_size,
                record.fill_price,
                cost,
                record.status.to_string(),
                record.mode.to_string(),
                record.pnl,
                record.source_trade_id,
                record.title,
                record.latency.detection_ms,
                record.latency.execution_ms,
                record.latency.total_ms,
            ],
        );

        match result {
            Ok(_) => debug!(token = %record.token_id, side = %record.side, cost, "trade recorded"),
            Err(e) => error!(error = %e, "failed to record trade — continuing"),
        }
    }

    // -------------------------------------------------------------------------
    // Analytics
    // -------------------------------------------------------------------------

    /// Aggregate summary over all trades, or one session's.
    pub fn summary(&self, session_id: Option<i64>) -> Result<TradeSummary> {
        let conn = self.conn.lock();
        let (filter, bind): (&str, Vec<i64>) = match session_id {
            Some(id) => ("WHERE session_id = ?1", vec![id]),
            None => ("", Vec::new()),
        };

        let sql = format!(
            "SELECT side, filled_size, cost, pnl, total_latency_ms FROM trades {filter} ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql).context("failed to prepare summary query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(bind), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })
            .context("failed to run summary query")?;

        let mut s = TradeSummary {
            best_pnl: f64::NEG_INFINITY,
            worst_pnl: f64::INFINITY,
            ..TradeSummary::default()
        };
        let mut size_sum = 0.0;
        let mut latency_sum = 0.0;
        let mut latency_n = 0u64;

        for row in rows {
            let (side, filled, cost, pnl, latency) = row.context("bad summary row")?;
            s.total_trades += 1;
            if side == "BUY" {
                s.buys += 1;
            } else {
                s.sells += 1;
            }
            s.volume += cost;
            size_sum += filled;
            if let Some(p) = pnl {
                s.total_pnl += p;
                if p > 0.0 {
                    s.wins += 1;
                } else if p < 0.0 {
                    s.losses += 1;
                }
                s.best_pnl = s.best_pnl.max(p);
                s.worst_pnl = s.worst_pnl.min(p);
            }
            if let Some(l) = latency {
                latency_sum += l as f64;
                latency_n += 1;
            }
        }

        if s.total_trades > 0 {
            s.avg_size = size_sum / s.total_trades as f64;
        }
        if latency_n > 0 {
            s.avg_total_latency_ms = latency_sum / latency_n as f64;
        }
        let decided = s.wins + s.losses;
        if decided > 0 {
            s.win_rate = s.wins as f64 / decided as f64;
        }
        if s.best_pnl == f64::NEG_INFINITY {
            s.best_pnl = 0.0;
        }
        if s.worst_pnl == f64::INFINITY {
            s.worst_pnl = 0.0;
        }
        Ok(s)
    }

    /// Advanced metrics over closed trades (SELL rows with a recorded P&L),
    /// ordered by time.
    pub fn advanced_metrics(&self, session_id: Option<i64>) -> Result<AdvancedMetrics> {
        let conn = self.conn.lock();
        let (filter, bind): (&str, Vec<i64>) = match session_id {
            Some(id) => ("AND session_id = ?1", vec![id]),
            None => ("", Vec::new()),
        };

        let sql = format!(
            "SELECT pnl FROM trades WHERE side = 'SELL' AND pnl IS NOT NULL {filter} ORDER BY created_at"
        );
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare metrics query")?;
        let pnls: Vec<f64> = stmt
            .query_map(rusqlite::params_from_iter(bind), |row| row.get(0))
            .context("failed to run metrics query")?
            .collect::<std::result::Result<_, _>>()
            .context("bad metrics row")?;

        Ok(compute_advanced(&pnls))
    }
}

/// Pure metric computation over a time-ordered P&L series.
fn compute_advanced(pnls: &[f64]) -> AdvancedMetrics {
    let mut m = AdvancedMetrics::default();
    if pnls.is_empty() {
        return m;
    }

    // Sharpe: sample stdev, annualised by sqrt(365); zero when degenerate.
    let n = pnls.len() as f64;
    let mean = pnls.iter().sum::<f64>() / n;
    if pnls.len() >= 2 {
        let var = pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let stdev = var.sqrt();
        if stdev > 0.0 {
            m.sharpe_ratio = mean / stdev * 365.0_f64.sqrt();
        }
    }

    // Max drawdown from the running cumulative-P&L peak.
    let mut cumulative = 0.0;
    let mut peak = 0.0;
    for p in pnls {
        cumulative += p;
        if cumulative > peak {
            peak = cumulative;
        }
        let drawdown = peak - cumulative;
        if drawdown > m.max_drawdown {
            m.max_drawdown = drawdown;
            m.max_drawdown_pct = if peak > 0.0 { drawdown / peak * 100.0 } else { 0.0 };
        }
    }

    // Profit factor, averages, streaks.
    let wins: Vec<f64> = pnls.iter().copied().filter(|&p| p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|&p| p < 0.0).collect();
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().map(|p| p.abs()).sum();

    m.profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    if !wins.is_empty() {
        m.avg_win = gross_profit / wins.len() as f64;
    }
    if !losses.is_empty() {
        m.avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
    }

    let mut win_streak = 0u32;
    let mut loss_streak = 0u32;
    for &p in pnls {
        if p > 0.0 {
            win_streak += 1;
            loss_streak = 0;
        } else if p < 0.0 {
            loss_streak += 1;
            win_streak = 0;
        } else {
            // Breakeven resets both streaks.
            win_streak = 0;
            loss_streak = 0;
        }
        m.longest_win_streak = m.longest_win_streak.max(win_streak);
        m.longest_loss_streak = m.longest_loss_streak.max(loss_streak);
    }

    let decided = wins.len() + losses.len();
    if decided > 0 {
        let win_rate = wins.len() as f64 / decided as f64;
        let loss_rate = losses.len() as f64 / decided as f64;
        m.expectancy = win_rate * m.avg_win - loss_rate * m.avg_loss.abs();
    }

    m
}
