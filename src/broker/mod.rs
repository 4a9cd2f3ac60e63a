// =============================================================================
// Broker Port — the contract the trading core consumes
// =============================================================================
//
// The broker is the source of truth for positions and fills; everything the
// core persists locally is a cache reconciled against it. Adapters must keep
// two promises: `place_order` is idempotent with respect to the request's
// idempotency key, and every execution report carries a unique
// `broker_fill_id`.
// =============================================================================

pub mod mock;
pub mod rate_limit;
pub mod rest;
pub mod stream;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{OrderStatus, OrderType, Side};

pub use mock::MockBroker;
pub use rate_limit::RateLimiter;
pub use rest::RestBroker;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Bearer token returned by `authenticate`. Refresh is the adapter's job;
/// callers only ever see a valid token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// A placement request as handed to the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// At-most-one placement key; the adapter may retry on timeout without
    /// duplicating.
    pub idempotency_key: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: i64,
    /// Required iff `order_type == Limit`.
    pub price: Option<Decimal>,
}

/// An order as reported by the broker (used during reconciliation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub broker_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: i64,
    pub filled_qty: i64,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
}

/// A position as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: i64,
    pub avg_price: Decimal,
}

/// A quote snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,
    /// Shares traded so far today.
    pub volume: i64,
    /// Notional traded so far today.
    pub turnover: Decimal,
    pub as_of: DateTime<Utc>,
}

/// A quote tick pushed over the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteEvent {
    pub symbol: String,
    pub price: Decimal,
    pub volume: i64,
    pub at: DateTime<Utc>,
}

/// An execution report pushed over the stream. May be replayed after a
/// reconnect; consumers dedup on `broker_fill_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub broker_fill_id: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: i64,
    pub price: Decimal,
    pub fill_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Port trait
// ---------------------------------------------------------------------------

/// Operations the core consumes from a broker adapter.
///
/// Stream subscriptions deliver into bounded channels and are responsible for
/// reconnecting with backoff and re-subscribing previously registered symbols;
/// they return once the shutdown signal is observed.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Return a currently-valid bearer token, refreshing as needed.
    async fn authenticate(&self) -> Result<Token>;

    /// Place an order; returns the broker-assigned order id. Idempotent with
    /// respect to `req.idempotency_key`.
    async fn place_order(&self, req: &OrderRequest) -> Result<String>;

    /// Ask the broker to cancel. `true` means the cancel was accepted, not
    /// that the order is already canceled.
    async fn cancel_order(&self, broker_order_id: &str, account_id: &str) -> Result<bool>;

    async fn get_orders(&self, account_id: &str) -> Result<Vec<BrokerOrder>>;

    async fn get_cash(&self, account_id: &str) -> Result<Decimal>;

    async fn get_positions(&self, account_id: &str) -> Result<Vec<BrokerPosition>>;

    /// Snapshot quotes for a set of symbols (used by the poller and as the
    /// HOLDING-path fallback when the stream cache is stale).
    async fn get_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>>;

    /// Stream quote ticks for `symbols` into `tx` until shutdown.
    async fn subscribe_quotes(
        &self,
        symbols: &[String],
        tx: mpsc::Sender<QuoteEvent>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()>;

    /// Stream execution reports into `tx` until shutdown.
    async fn subscribe_executions(
        &self,
        tx: mpsc::Sender<ExecutionEvent>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()>;
}
