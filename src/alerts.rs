// =============================================================================
// Alert Sink — severity-filtered, rate-limited notifications
// =============================================================================
//
// Two optional channels, each behind its own rate limiter (at most 20
// messages a minute, at least 2 s between sends). Delivery is fire-and-
// forget: the hot path never waits on a webhook, and a failed send only
// logs.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Max messages per channel per minute.
const MAX_PER_MINUTE: usize = 20;
/// Minimum spacing between sends on one channel.
const MIN_GAP: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Alert severity, most severe first. A message is dropped when it is less
/// severe than the configured minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Low
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// Delivery backend for one alert channel. The actual message formatting of
/// external services stays behind this seam.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, text: &str) -> anyhow::Result<()>;
}

/// Generic JSON webhook POST.
pub struct WebhookTransport {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

#[async_trait]
impl AlertTransport for WebhookTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, text: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({ "text": text });
        let resp = self.http.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook returned {}", resp.status());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Sliding-window limiter: at most [`MAX_PER_MINUTE`] sends, never two
/// within [`MIN_GAP`].
struct RateWindow {
    sent: VecDeque<Instant>,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            sent: VecDeque::new(),
        }
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.sent.front() {
            if now.duration_since(front) > Duration::from_secs(60) {
                self.sent.pop_front();
            } else {
                break;
            }
        }

        if self.sent.len() >= MAX_PER_MINUTE {
            return false;
        }
        if let Some(&last) = self.sent.back() {
            if now.duration_since(last) < MIN_GAP {
                return false;
            }
        }
        self.sent.push_back(now);
        true
    }
}

struct Channel {
    transport: Arc<dyn AlertTransport>,
    limiter: Mutex<RateWindow>,
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Fan-out point for engine notifications.
pub struct AlertSink {
    min_severity: Severity,
    channels: Vec<Channel>,
}

impl AlertSink {
    pub fn new(min_severity: Severity) -> Self {
        Self {
            min_severity,
            channels: Vec::new(),
        }
    }

    pub fn add_channel(&mut self, transport: Arc<dyn AlertTransport>) {
        self.channels.push(Channel {
            transport,
            limiter: Mutex::new(RateWindow::new()),
        });
    }

    /// True when the message would pass the severity filter.
    pub fn passes(&self, severity: Severity) -> bool {
        severity <= self.min_severity
    }

    /// Send a message to every channel whose limiter allows it. Never
    /// blocks: deliveries run on spawned tasks and failures only log.
    pub fn notify(&self, severity: Severity, message: impl Into<String>) {
        if !self.passes(severity) {
            return;
        }
        let message = message.into();
        let text = format!("[{severity}] {message}");

        for channel in &self.channels {
            if !channel.limiter.lock().allow_at(Instant::now()) {
                debug!(
                    channel = channel.transport.name(),
                    "alert dropped by rate limiter"
                );
                continue;
            }
            let transport = channel.transport.clone();
            let text = text.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.deliver(&text).await {
                    warn!(channel = transport.name(), error = %e, "alert delivery failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for AlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSink")
            .field("min_severity", &self.min_severity)
            .field("channels", &self.channels.len())
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
    fn severity_orders_most_severe_first() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Medium);
        assert!(Severity::Medium < Severity::Low);
    }

    #[test]
    fn severity_filter_drops_less_severe_messages() {
        let sink = AlertSink::new(Severity::High);
        assert!(sink.passes(Severity::Critical));
        assert!(sink.passes(Severity::High));
        assert!(!sink.passes(Severity::Medium));
        assert!(!sink.passes(Severity::Low));
    }

    #[test]
    fn rate_window_enforces_minimum_gap() {
        let mut window = RateWindow::new();
        let t0 = Instant::now();
        assert!(window.allow_at(t0));
        assert!(!window.allow_at(t0 + Duration::from_millis(500)));
        assert!(window.allow_at(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn rate_window_caps_per_minute_volume() {
        let mut window = RateWindow::new();
        let t0 = Instant::now();
        for i in 0..MAX_PER_MINUTE {
            assert!(window.allow_at(t0 + Duration::from_secs(2 * i as u64)));
        }
        // 21st message within the minute of the first 20 is dropped...
        assert!(!window.allow_at(t0 + Duration::from_secs(41)));
        // ...but allowed once the oldest sends age out of the window.
        assert!(window.allow_at(t0 + Duration::from_secs(62)));
    }

    #[test]
    fn severity_parses_config_strings() {
        let s: Severity = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(s, Severity::Critical);
        let s: Severity = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(s, Severity::Medium);
    }
}
