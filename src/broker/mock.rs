// =============================================================================
// Mock Broker — deterministic in-memory BrokerPort for tests
// =============================================================================
//
// Honours the two adapter promises the core depends on: placements dedup on
// the idempotency key, and every scripted execution carries a unique fill id.
// Tests drive it directly: set quotes, script failures, emit fills.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};

use crate::broker::{
    BrokerOrder, BrokerPort, BrokerPosition, ExecutionEvent, OrderRequest, Quote, QuoteEvent,
    Token,
};
use crate::error::{Result, TradeError};

#[derive(Default)]
struct Inner {
    quotes: HashMap<String, Quote>,
    positions: Vec<BrokerPosition>,
    orders: Vec<BrokerOrder>,
    cash: Decimal,
    /// idempotency_key -> broker_order_id, the dedup map.
    placements: HashMap<String, String>,
    /// Every placement request observed, duplicates included.
    placed: Vec<OrderRequest>,
    cancels: Vec<String>,
    next_order_seq: u64,
    next_fill_seq: u64,
    /// Errors to return from the next `place_order` calls, FIFO.
    place_failures: Vec<TradeError>,
    /// When set, every accepted placement immediately emits a full fill at
    /// this price (or the request/quote price when `None`).
    auto_fill: bool,
    auto_fill_price: Option<Decimal>,
    exec_txs: Vec<mpsc::Sender<ExecutionEvent>>,
    quote_txs: Vec<mpsc::Sender<QuoteEvent>>,
}

/// Deterministic broker double. Clone-cheap via `Arc`.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    pub fn set_quote(&self, symbol: &str, price: Decimal, volume: i64, turnover: Decimal) {
        let mut inner = self.inner.lock();
        inner.quotes.insert(
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                price,
                volume,
                turnover,
                as_of: Utc::now(),
            },
        );
    }

    pub fn set_quote_at(&self, quote: Quote) {
        self.inner.lock().quotes.insert(quote.symbol.clone(), quote);
    }

    pub fn set_cash(&self, cash: Decimal) {
        self.inner.lock().cash = cash;
    }

    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        self.inner.lock().positions = positions;
    }

    pub fn set_orders(&self, orders: Vec<BrokerOrder>) {
        self.inner.lock().orders = orders;
    }

    /// Queue an error for the next `place_order` call (FIFO).
    pub fn fail_next_place(&self, error: TradeError) {
        self.inner.lock().place_failures.push(error);
    }

    /// Every accepted placement immediately emits a full fill.
    pub fn enable_auto_fill(&self, price: Option<Decimal>) {
        let mut inner = self.inner.lock();
        inner.auto_fill = true;
        inner.auto_fill_price = price;
    }

    /// All placement requests seen, duplicates included.
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.inner.lock().placed.clone()
    }

    /// Distinct broker orders created (idempotent retries collapse).
    pub fn distinct_placements(&self) -> usize {
        self.inner.lock().placements.len()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.inner.lock().cancels.clone()
    }

    /// Push an execution report to every subscribed consumer.
    pub async fn emit_execution(&self, event: ExecutionEvent) {
        let txs = self.inner.lock().exec_txs.clone();
        for tx in txs {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Push a quote tick to every subscribed consumer.
    pub async fn emit_quote(&self, event: QuoteEvent) {
        let txs = self.inner.lock().quote_txs.clone();
        for tx in txs {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Build a full fill for a previously placed order.
    pub fn fill_for(&self, req: &OrderRequest, price: Decimal) -> ExecutionEvent {
        let mut inner = self.inner.lock();
        inner.next_fill_seq += 1;
        let broker_order_id = inner
            .placements
            .get(&req.idempotency_key)
            .cloned()
            .unwrap_or_default();
        ExecutionEvent {
            broker_fill_id: format!("MF{}", inner.next_fill_seq),
            broker_order_id,
            symbol: req.symbol.clone(),
            side: req.side,
            qty: req.qty,
            price,
            fill_time: Utc::now(),
        }
    }
}

#[async_trait]
impl BrokerPort for MockBroker {
    async fn authenticate(&self) -> Result<Token> {
        Ok(Token {
            access_token: "mock-token".into(),
            expires_at: Utc::now() + Duration::hours(12),
        })
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<String> {
        let (order_id, auto) = {
            let mut inner = self.inner.lock();
            inner.placed.push(req.clone());

            if !inner.place_failures.is_empty() {
                return Err(inner.place_failures.remove(0));
            }

            let order_id = match inner.placements.get(&req.idempotency_key) {
                Some(existing) => existing.clone(),
                None => {
                    inner.next_order_seq += 1;
                    let id = format!("MO{}", inner.next_order_seq);
                    inner
                        .placements
                        .insert(req.idempotency_key.clone(), id.clone());
                    id
                }
            };
            (order_id, inner.auto_fill)
        };

        if auto {
            let price = {
                let inner = self.inner.lock();
                inner
                    .auto_fill_price
                    .or(req.price)
                    .or_else(|| inner.quotes.get(&req.symbol).map(|q| q.price))
                    .unwrap_or(Decimal::ONE)
            };
            let event = {
                let mut inner = self.inner.lock();
                inner.next_fill_seq += 1;
                ExecutionEvent {
                    broker_fill_id: format!("MF{}", inner.next_fill_seq),
                    broker_order_id: order_id.clone(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    qty: req.qty,
                    price,
                    fill_time: Utc::now(),
                }
            };
            self.emit_execution(event).await;
        }

        Ok(order_id)
    }

    async fn cancel_order(&self, broker_order_id: &str, _account_id: &str) -> Result<bool> {
        self.inner.lock().cancels.push(broker_order_id.to_string());
        Ok(true)
    }

    async fn get_orders(&self, _account_id: &str) -> Result<Vec<BrokerOrder>> {
        Ok(self.inner.lock().orders.clone())
    }

    async fn get_cash(&self, _account_id: &str) -> Result<Decimal> {
        Ok(self.inner.lock().cash)
    }

    async fn get_positions(&self, _account_id: &str) -> Result<Vec<BrokerPosition>> {
        Ok(self.inner.lock().positions.clone())
    }

    async fn get_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        let inner = self.inner.lock();
        Ok(symbols
            .iter()
            .filter_map(|s| inner.quotes.get(s).cloned())
            .collect())
    }

    async fn subscribe_quotes(
        &self,
        _symbols: &[String],
        tx: mpsc::Sender<QuoteEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.inner.lock().quote_txs.push(tx);
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn subscribe_executions(
        &self,
        tx: mpsc::Sender<ExecutionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.inner.lock().exec_txs.push(tx);
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MockBroker")
            .field("quotes", &inner.quotes.len())
            .field("placements", &inner.placements.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, Side};
    use rust_decimal_macros::dec;

    fn request(key: &str) -> OrderRequest {
        OrderRequest {
            idempotency_key: key.to_string(),
            account_id: "ACC1".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: 10,
            price: None,
        }
    }

    #[tokio::test]
    async fn placement_dedups_on_idempotency_key() {
        let broker = MockBroker::new();
        let id1 = broker.place_order(&request("k1")).await.unwrap();
        let id2 = broker.place_order(&request("k1")).await.unwrap();
        let id3 = broker.place_order(&request("k2")).await.unwrap();

        assert_eq!(id1, id2, "same key yields the same broker order");
        assert_ne!(id1, id3);
        assert_eq!(broker.distinct_placements(), 2);
        assert_eq!(broker.placed().len(), 3);
    }

    #[tokio::test]
    async fn scripted_failure_then_success() {
        let broker = MockBroker::new();
        broker.fail_next_place(TradeError::TransientBroker("timeout".into()));

        assert!(broker.place_order(&request("k1")).await.is_err());
        assert!(broker.place_order(&request("k1")).await.is_ok());
    }

    #[tokio::test]
    async fn auto_fill_reaches_subscribers() {
        let broker = MockBroker::new();
        broker.enable_auto_fill(Some(dec!(100)));

        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let b = broker.clone();
        tokio::spawn(async move { b.subscribe_executions(tx, stop_rx).await });
        tokio::task::yield_now().await;

        broker.place_order(&request("k1")).await.unwrap();
        let fill = rx.recv().await.expect("fill emitted");
        assert_eq!(fill.qty, 10);
        assert_eq!(fill.price, dec!(100));
        assert_eq!(fill.side, Side::Buy);
    }
}
