// =============================================================================
// Error taxonomy & retry/backoff primitives
// =============================================================================
//
// Classification rules:
//   - Config            fatal at startup, never raised at runtime
//   - Auth              surfaces only after the broker port exhausted refresh
//   - TransientBroker   timeouts / 5xx / rate-limit; retryable
//   - BrokerReject      explicit broker rejection; never retried
//   - LockAcquisition   symbol already owned; caller picks another candidate
//   - LockExpired/NotFound  holder has been preempted; abandon safely
//   - Store             retryable with bounded backoff
//   - Invariant         never swallowed; logged with full context + alert
// =============================================================================

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Unified error type for the trading core.
#[derive(Debug, Error)]
pub enum TradeError {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker authentication failed after refresh attempts.
    #[error("broker auth error: {0}")]
    Auth(String),

    /// Timeout, 5xx, or rate-limit from the broker. Retryable.
    #[error("transient broker error: {0}")]
    TransientBroker(String),

    /// Explicit broker rejection (risk limit, bad symbol, ...). Not retryable.
    #[error("broker rejected: {0}")]
    BrokerReject(String),

    /// The symbol is already owned by another worker.
    #[error("lock on {symbol} held by {holder}")]
    LockAcquisition { symbol: String, holder: String },

    /// The caller's lock has passed its TTL.
    #[error("lock on {symbol} expired")]
    LockExpired { symbol: String },

    /// No lock row exists for the symbol/worker pair.
    #[error("no lock on {symbol} held by {worker_id}")]
    LockNotFound { symbol: String, worker_id: String },

    /// Persistent store failure. Retryable with bounded backoff.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A data-integrity rule was about to be broken (e.g. a fill exceeding
    /// order quantity). Local state is left untouched.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl TradeError {
    /// Whether a bounded retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBroker(_) | Self::Store(_))
    }

    /// Process exit code for errors that escape to the binary edge.
    /// 1 = configuration, 2 = infrastructure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            _ => 2,
        }
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, TradeError>;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff schedule: base 1 s, doubling, capped at 30 s, with up
/// to 20 % random jitter on every delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    /// Defaults for transient faults: 1 s base, 30 s cap, 3 attempts.
    pub fn transient() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 3)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Next delay to sleep, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt += 1;
        Some(jitter(capped))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Apply up to +20 % random jitter so that a fleet of workers does not
/// hammer the broker in lock-step after an outage.
pub fn jitter(d: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.2);
    d.mul_f64(factor)
}

/// Retry `op` on transient failures using the given backoff schedule.
/// Non-transient errors are returned immediately.
pub async fn retry_transient<T, F, Fut>(mut backoff: Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "transient failure — backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}
