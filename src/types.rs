// =============================================================================
// Shared types used across the Meridian trading fleet
// =============================================================================
//
// Every monetary value is a `rust_decimal::Decimal` quantized to 4 fractional
// digits; share quantities are whole `i64`. Status enums carry their own
// transition rules so that services can reject illegal moves uniformly.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fractional digits kept for prices and PnL values.
pub const MONEY_SCALE: u32 = 4;

/// Maximum accepted length of a caller-supplied idempotency key.
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 200;

/// Quantize a monetary value to [`MONEY_SCALE`] fractional digits.
pub fn to_money(value: Decimal) -> Decimal {
    value.round_dp(MONEY_SCALE)
}

// ---------------------------------------------------------------------------
// Order enums
// ---------------------------------------------------------------------------

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of order sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Life-cycle state of an order.
///
/// Legal moves:
///   PENDING -> SENT | REJECTED
///   SENT    -> PARTIAL | FILLED | CANCELED | REJECTED
///   PARTIAL -> FILLED | CANCELED
/// FILLED, CANCELED, and REJECTED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Sent,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "PARTIAL" => Some(Self::Partial),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    /// Whether moving from `self` to `next` respects the order state graph.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Rejected)
                | (Sent, Partial)
                | (Sent, Filled)
                | (Sent, Canceled)
                | (Sent, Rejected)
                | (Partial, Filled)
                | (Partial, Canceled)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Lock & worker enums
// ---------------------------------------------------------------------------

/// State of a symbol ownership record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    Active,
    Expired,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Life-cycle state of a registered worker process.
///
/// Legal moves:
///   IDLE     -> SCANNING | EXITING | TERMINATED
///   SCANNING -> HOLDING  | EXITING | TERMINATED
///   HOLDING  -> SCANNING | EXITING | TERMINATED
///   EXITING  -> TERMINATED
/// The direct jumps to TERMINATED exist for the stale-worker reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Scanning,
    Holding,
    Exiting,
    Terminated,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Scanning => "SCANNING",
            Self::Holding => "HOLDING",
            Self::Exiting => "EXITING",
            Self::Terminated => "TERMINATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(Self::Idle),
            "SCANNING" => Some(Self::Scanning),
            "HOLDING" => Some(Self::Holding),
            "EXITING" => Some(Self::Exiting),
            "TERMINATED" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Idle, Scanning)
                | (Idle, Exiting)
                | (Idle, Terminated)
                | (Scanning, Holding)
                | (Scanning, Exiting)
                | (Scanning, Terminated)
                | (Holding, Scanning)
                | (Holding, Exiting)
                | (Holding, Terminated)
                | (Exiting, Terminated)
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Mode & sell-reason enums
// ---------------------------------------------------------------------------

/// Whether the fleet trades against the paper or the live broker endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingMode {
    Paper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl TradingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PAPER" => Some(Self::Paper),
            "LIVE" => Some(Self::Live),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => f.write_str("PAPER"),
            Self::Live => f.write_str("LIVE"),
        }
    }
}

/// Why a sell signal was emitted. Carried into the audit log with every exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SellReason {
    StopLoss,
    TakeProfit,
    TrendBreak,
    TimeExit,
    Forced,
}

impl SellReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "STOP_LOSS",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TrendBreak => "TREND_BREAK",
            Self::TimeExit => "TIME_EXIT",
            Self::Forced => "FORCED",
        }
    }
}

impl std::fmt::Display for SellReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A requested trade, as stored in the `orders` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    /// Assigned by the broker after acceptance; absent until then.
    #[serde(default)]
    pub broker_order_id: Option<String>,
    /// Caller-supplied key guaranteeing at-most-one placement.
    pub idempotency_key: String,
    pub worker_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: i64,
    /// Present iff `order_type == Limit`.
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub avg_fill_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_qty(&self) -> i64 {
        self.qty - self.filled_qty
    }
}

/// A single execution report, as stored in the `fills` table. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: Uuid,
    /// Broker-assigned execution id, unique across the system; dedup key.
    pub broker_fill_id: String,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price: Decimal,
    pub fill_time: DateTime<Utc>,
}

/// Exclusive symbol ownership, as stored in the `stock_locks` table.
/// `symbol` is the primary identity; the row is overwritten on re-acquire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockLock {
    pub id: Uuid,
    pub symbol: String,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub status: LockStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == LockStatus::Expired || now > self.expires_at
    }
}

/// A registered worker instance, as stored in the `worker_processes` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub worker_id: String,
    pub status: WorkerStatus,
    /// Set iff `status == Holding`.
    pub current_symbol: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-worker per-date performance rollup, as stored in `daily_summaries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySummary {
    pub worker_id: String,
    pub summary_date: NaiveDate,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Sum of positive realized round-trip PnL.
    pub gross_profit: Decimal,
    /// Magnitude of negative realized round-trip PnL (stored positive).
    pub gross_loss: Decimal,
    pub net_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    /// Largest peak-to-trough decline of the day's cumulative PnL curve.
    pub max_drawdown: Decimal,
    /// `winning_trades / total_trades`, 0 when no trades.
    pub win_rate: f64,
    /// `gross_profit / gross_loss`; +inf when loss is zero and profit > 0.
    pub profit_factor: f64,
}

// ---------------------------------------------------------------------------
// Ephemeral scan output
// ---------------------------------------------------------------------------

/// A symbol that passed the coarse poll filters, scored for possible entry.
/// Not persisted; lives for the duration of one scan tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub price: Decimal,
    pub volume: i64,
    /// Strategy-supplied scalar; higher is better.
    pub score: f64,
    /// Opaque per-strategy indicator values, kept for the audit log.
    #[serde(default)]
    pub indicators: HashMap<String, f64>,
    pub scanned_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_status_terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Sent.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn order_status_forbids_backward_moves() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Sent));
        assert!(OrderStatus::Sent.can_transition_to(OrderStatus::Partial));
        assert!(OrderStatus::Partial.can_transition_to(OrderStatus::Filled));

        assert!(!OrderStatus::Sent.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Filled.can_transition_to(OrderStatus::Partial));
        assert!(!OrderStatus::Canceled.can_transition_to(OrderStatus::Sent));
        assert!(!OrderStatus::Partial.can_transition_to(OrderStatus::Rejected));
    }

    #[test]
    fn worker_status_graph() {
        assert!(WorkerStatus::Idle.can_transition_to(WorkerStatus::Scanning));
        assert!(WorkerStatus::Scanning.can_transition_to(WorkerStatus::Holding));
        assert!(WorkerStatus::Holding.can_transition_to(WorkerStatus::Scanning));
        assert!(WorkerStatus::Exiting.can_transition_to(WorkerStatus::Terminated));

        // SCANNING can never jump straight back to IDLE, and nothing leaves
        // TERMINATED.
        assert!(!WorkerStatus::Scanning.can_transition_to(WorkerStatus::Idle));
        assert!(!WorkerStatus::Terminated.can_transition_to(WorkerStatus::Idle));
        assert!(!WorkerStatus::Idle.can_transition_to(WorkerStatus::Holding));
    }

    #[test]
    fn enum_round_trips_through_str() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::Sent,
            OrderStatus::Partial,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(Side::parse("BUY"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("HOLD"), None);
        assert_eq!(TradingMode::parse("paper"), Some(TradingMode::Paper));
        assert_eq!(WorkerStatus::parse("HOLDING"), Some(WorkerStatus::Holding));
        assert_eq!(LockStatus::parse("ACTIVE"), Some(LockStatus::Active));
    }

    #[test]
    fn money_quantizes_to_four_digits() {
        assert_eq!(to_money(dec!(10.123456)), dec!(10.1235));
        assert_eq!(to_money(dec!(10)), dec!(10));
    }

    #[test]
    fn lock_expiry_check_uses_both_status_and_deadline() {
        let now = Utc::now();
        let lock = StockLock {
            id: Uuid::new_v4(),
            symbol: "A".into(),
            worker_id: "w1".into(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(300),
            heartbeat_at: now,
            status: LockStatus::Active,
            created_at: now,
            updated_at: now,
        };
        assert!(!lock.is_expired_at(now));
        assert!(lock.is_expired_at(now + chrono::Duration::seconds(301)));

        let expired = StockLock {
            status: LockStatus::Expired,
            ..lock
        };
        assert!(expired.is_expired_at(now));
    }
}
