// =============================================================================
// Rate Gate — per-endpoint pacing to avoid venue 429s
// =============================================================================
//
// Two variants:
//   - IntervalGate: enforces a minimum interval between calls by recording
//     the last scheduled slot. Callers suspend until their slot arrives.
//   - TokenBucket: capacity C, refill R tokens/second. `consume(n)` lets the
//     balance go negative (debt model) so concurrent callers serialize
//     without head-of-line spikes.
//
// One IntervalGate per endpoint family:
//   activity ~100/s, positions ~20/s, book/price ~15/s.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// Minimum interval between activity-feed calls (~100/s).
pub const ACTIVITY_INTERVAL: Duration = Duration::from_millis(10);
/// Minimum interval between position/value calls (~20/s).
pub const POSITIONS_INTERVAL: Duration = Duration::from_millis(50);
/// Minimum interval between book/price calls (~15/s).
pub const BOOK_INTERVAL: Duration = Duration::from_millis(66);

// ---------------------------------------------------------------------------
// IntervalGate
// ---------------------------------------------------------------------------

/// Enforces a minimum spacing between calls to one endpoint family.
///
/// Each caller reserves the next free slot under the lock and then sleeps
/// outside it, so concurrent callers line up instead of stampeding.
pub struct IntervalGate {
    name: &'static str,
    min_interval: Duration,
    /// The most recently reserved slot.
    last_slot: Mutex<Option<Instant>>,
}

impl IntervalGate {
    pub fn new(name: &'static str, min_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            last_slot: Mutex::new(None),
        }
    }

    /// Suspend until this caller's slot arrives.
    pub async fn acquire(&self) {
        let slot = {
            let mut last = self.last_slot.lock();
            let now = Instant::now();
            let slot = match *last {
                Some(prev) => (prev + self.min_interval).max(now),
                None => now,
            };
            *last = Some(slot);
            slot
        };

        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            trace!(gate = self.name, wait_ms = wait.as_millis() as u64, "rate gate wait");
            tokio::time::sleep(wait).await;
        }
    }
}

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with debt semantics for pooled connections.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens, suspending for `max(0, (n - tokens) / refill)` when
    /// the bucket cannot cover the request. The balance may go negative;
    /// later callers inherit the debt and wait proportionally longer.
    pub async fn consume(&self, n: f64) {
        let wait = {
            let mut s = self.state.lock();
            let now = Instant::now();

            let elapsed = now.duration_since(s.last_refill).as_secs_f64();
            s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            s.last_refill = now;

            let shortfall = n - s.tokens;
            s.tokens -= n;

            if shortfall > 0.0 {
                Duration::from_secs_f64(shortfall / self.refill_per_sec)
            } else {
                Duration::ZERO
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token balance (may be negative while in debt).
    pub fn available(&self) -> f64 {
        let mut s = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(s.last_refill).as_secs_f64();
        s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        s.last_refill = now;
        s.tokens
    }
}

// ---------------------------------------------------------------------------
// Endpoint-family gate set
// ---------------------------------------------------------------------------

/// The three gates protecting the venue's endpoint families.
pub struct RateGates {
    pub activity: IntervalGate,
    pub positions: IntervalGate,
    pub book: IntervalGate,
}

impl RateGates {
    pub fn new() -> Self {
        Self {
            activity: IntervalGate::new("activity", ACTIVITY_INTERVAL),
            positions: IntervalGate::new("positions", POSITIONS_INTERVAL),
            book: IntervalGate::new("book", BOOK_INTERVAL),
        }
    }
}

impl Default for RateGates {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interval_gate_spaces_calls() {
        let gate = IntervalGate::new("test", Duration::from_millis(20));
        let start = Instant::now();
        gate.acquire().await;
        gate.acquire().await;
        gate.acquire().await;
        // Three calls: first immediate, then 2 waits of ~20 ms.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn interval_gate_first_call_is_immediate() {
        let gate = IntervalGate::new("test", Duration::from_millis(500));
        let start = Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn token_bucket_allows_burst_up_to_capacity() {
        let bucket = TokenBucket::new(5.0, 10.0);
        let start = Instant::now();
        for _ in 0..5 {
            bucket.consume(1.0).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn token_bucket_goes_into_debt_and_waits() {
        let bucket = TokenBucket::new(1.0, 100.0);
        bucket.consume(1.0).await;
        let start = Instant::now();
        // 2 tokens short at 100 tokens/s => ~20 ms wait.
        bucket.consume(2.0).await;
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(bucket.available() <= 0.5);
    }

    #[tokio::test]
    async fn token_bucket_refills_to_capacity_only() {
        let bucket = TokenBucket::new(2.0, 1000.0);
        bucket.consume(1.0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let available = bucket.available();
        assert!(available <= 2.0 + 1e-9);
        assert!(available > 1.5);
    }
}
