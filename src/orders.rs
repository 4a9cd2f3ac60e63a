// =============================================================================
// Order Service — exactly-once placement and the authoritative order ledger
// =============================================================================
//
// Three promises:
//   1. `create_order` with a repeated idempotency key returns the existing
//      row — never a duplicate.
//   2. `send_order` passes the idempotency key through to the broker, so a
//      timeout retry cannot double-place; an unknown outcome leaves the row
//      PENDING for reconciliation.
//   3. `process_execution` applies each fill in one store transaction,
//      dedups on `broker_fill_id`, and refuses any fill that would push
//      `filled_qty` past `qty` — the local record is never corrupted.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerPort, ExecutionEvent, OrderRequest};
use crate::clock::Clock;
use crate::error::{Result, TradeError};
use crate::notify::{AlertLevel, Notifier};
use crate::pnl::{position_from_fills, PositionView};
use crate::store::{FillApply, OrderInsert, OrderStore};
use crate::types::{
    Fill, Order, OrderStatus, OrderType, Side, IDEMPOTENCY_KEY_MAX_LEN,
};

// ---------------------------------------------------------------------------
// Inputs & outcomes
// ---------------------------------------------------------------------------

/// A new order as requested by the orchestrator.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub idempotency_key: String,
    pub worker_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: i64,
    pub price: Option<Decimal>,
}

/// Outcome of ingesting one execution report.
#[derive(Debug, Clone)]
pub enum ProcessedFill {
    /// Fill recorded; the refreshed parent order.
    Applied(Order),
    /// Same `broker_fill_id` seen before; nothing changed.
    Duplicate,
    /// No local order carries this broker order id (yet).
    Unmatched,
    /// Dropped: overflow or a fill against a terminal order. Alerted.
    Rejected,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    broker: Arc<dyn BrokerPort>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    account_id: String,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        broker: Arc<dyn BrokerPort>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        account_id: String,
    ) -> Self {
        Self {
            store,
            broker,
            notifier,
            clock,
            account_id,
        }
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    /// Persist a new PENDING order, or return the existing row when the
    /// idempotency key has been used before.
    pub async fn create_order(&self, req: NewOrder) -> Result<Order> {
        if req.qty <= 0 {
            return Err(TradeError::Invariant(format!(
                "order qty must be positive, got {}",
                req.qty
            )));
        }
        if req.idempotency_key.is_empty() || req.idempotency_key.len() > IDEMPOTENCY_KEY_MAX_LEN {
            return Err(TradeError::Invariant(
                "idempotency key must be 1..=200 chars".into(),
            ));
        }
        match (req.order_type, req.price) {
            (OrderType::Limit, None) => {
                return Err(TradeError::Invariant("LIMIT order without a price".into()))
            }
            (OrderType::Market, Some(_)) => {
                return Err(TradeError::Invariant("MARKET order with a price".into()))
            }
            _ => {}
        }

        let now = self.clock.now();
        let order = Order {
            order_id: Uuid::new_v4(),
            broker_order_id: None,
            idempotency_key: req.idempotency_key,
            worker_id: req.worker_id,
            symbol: req.symbol,
            side: req.side,
            order_type: req.order_type,
            qty: req.qty,
            price: req.price,
            status: OrderStatus::Pending,
            filled_qty: 0,
            avg_fill_price: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert(&order).await? {
            OrderInsert::Inserted(order) => {
                info!(
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    side = %order.side,
                    qty = order.qty,
                    "order created"
                );
                Ok(order)
            }
            OrderInsert::Duplicate(existing) => {
                debug!(
                    order_id = %existing.order_id,
                    idempotency_key = %existing.idempotency_key,
                    "create_order deduplicated"
                );
                Ok(existing)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Send
    // -------------------------------------------------------------------------

    /// Place a PENDING order at the broker.
    ///
    /// On success: SENT with the broker order id. On explicit rejection:
    /// REJECTED (returned, not raised). On timeout with unknown outcome the
    /// row stays PENDING and the transient error propagates so the caller
    /// schedules a reconciliation attempt. Calling again for an order that
    /// already left PENDING just returns the current row.
    pub async fn send_order(&self, order_id: Uuid) -> Result<Order> {
        let order = self
            .store
            .get(order_id)
            .await?
            .ok_or_else(|| TradeError::Invariant(format!("unknown order {order_id}")))?;

        if order.status != OrderStatus::Pending {
            debug!(order_id = %order_id, status = %order.status, "send_order: already sent");
            return Ok(order);
        }

        let request = OrderRequest {
            idempotency_key: order.idempotency_key.clone(),
            account_id: self.account_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            qty: order.qty,
            price: order.price,
        };

        match self.broker.place_order(&request).await {
            Ok(broker_order_id) => {
                let now = self.clock.now();
                let changed = self
                    .store
                    .mark_sent(order_id, &broker_order_id, now)
                    .await?;
                if !changed {
                    // A concurrent path (retry, reconciliation) beat us.
                    warn!(order_id = %order_id, "mark_sent raced — re-reading");
                }
                let sent = self
                    .store
                    .get(order_id)
                    .await?
                    .ok_or_else(|| TradeError::Invariant(format!("order {order_id} vanished")))?;
                info!(
                    order_id = %order_id,
                    broker_order_id = %broker_order_id,
                    symbol = %sent.symbol,
                    "order sent"
                );
                Ok(sent)
            }
            Err(TradeError::BrokerReject(reason)) => {
                warn!(order_id = %order_id, reason = %reason, "order rejected by broker");
                self.store
                    .mark_rejected(order_id, &reason, self.clock.now())
                    .await?;
                self.store
                    .get(order_id)
                    .await?
                    .ok_or_else(|| TradeError::Invariant(format!("order {order_id} vanished")))
            }
            Err(e) => {
                // Unknown outcome: leave PENDING. The idempotency key makes a
                // later retry safe, and reconciliation will adopt the broker
                // order if it actually went through.
                warn!(order_id = %order_id, error = %e, "placement outcome unknown — order stays PENDING");
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cancel
    // -------------------------------------------------------------------------

    /// Ask the broker to cancel. Optimistic: the local row is only marked
    /// CANCELED once the broker reports the terminal state (via
    /// [`Self::confirm_cancel`]).
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<bool> {
        let order = self
            .store
            .get(order_id)
            .await?
            .ok_or_else(|| TradeError::Invariant(format!("unknown order {order_id}")))?;

        if !matches!(order.status, OrderStatus::Sent | OrderStatus::Partial) {
            return Err(TradeError::Invariant(format!(
                "cancel illegal for order {order_id} in status {}",
                order.status
            )));
        }
        let broker_order_id = order.broker_order_id.as_deref().ok_or_else(|| {
            TradeError::Invariant(format!("order {order_id} has no broker order id"))
        })?;

        let accepted = self
            .broker
            .cancel_order(broker_order_id, &self.account_id)
            .await?;
        info!(order_id = %order_id, accepted, "cancel requested");
        Ok(accepted)
    }

    /// Record the broker-reported terminal cancel. True when the row moved.
    pub async fn confirm_cancel(&self, order_id: Uuid) -> Result<bool> {
        let changed = self.store.mark_canceled(order_id, self.clock.now()).await?;
        if changed {
            info!(order_id = %order_id, "order canceled (broker-confirmed)");
        }
        Ok(changed)
    }

    // -------------------------------------------------------------------------
    // Fill ingestion
    // -------------------------------------------------------------------------

    /// Ingest one execution report from the broker stream.
    pub async fn process_execution(&self, event: &ExecutionEvent) -> Result<ProcessedFill> {
        let Some(order) = self.store.get_by_broker_id(&event.broker_order_id).await? else {
            warn!(
                broker_order_id = %event.broker_order_id,
                broker_fill_id = %event.broker_fill_id,
                "execution for unknown broker order"
            );
            return Ok(ProcessedFill::Unmatched);
        };

        let fill = Fill {
            fill_id: Uuid::new_v4(),
            broker_fill_id: event.broker_fill_id.clone(),
            order_id: order.order_id,
            symbol: event.symbol.clone(),
            side: event.side,
            qty: event.qty,
            price: event.price,
            fill_time: event.fill_time,
        };
        self.process_fill(fill).await
    }

    /// Apply one fill: dedup, insert, and bump the parent order — all in one
    /// store transaction.
    pub async fn process_fill(&self, fill: Fill) -> Result<ProcessedFill> {
        match self.store.apply_fill(&fill).await? {
            FillApply::Applied(order) => {
                info!(
                    order_id = %order.order_id,
                    broker_fill_id = %fill.broker_fill_id,
                    fill_qty = fill.qty,
                    filled_qty = order.filled_qty,
                    status = %order.status,
                    "fill applied"
                );
                Ok(ProcessedFill::Applied(order))
            }
            FillApply::DuplicateFill => {
                debug!(broker_fill_id = %fill.broker_fill_id, "duplicate fill ignored");
                Ok(ProcessedFill::Duplicate)
            }
            FillApply::Overflow(order) => {
                let msg = format!(
                    "fill {} of qty {} would exceed order {} qty {} (filled {})",
                    fill.broker_fill_id, fill.qty, order.order_id, order.qty, order.filled_qty
                );
                error!(
                    order_id = %order.order_id,
                    broker_fill_id = %fill.broker_fill_id,
                    "invariant violation: {msg}"
                );
                self.notifier.alert(AlertLevel::Error, &msg).await;
                Ok(ProcessedFill::Rejected)
            }
            FillApply::IllegalState(order) => {
                warn!(
                    order_id = %order.order_id,
                    status = %order.status,
                    broker_fill_id = %fill.broker_fill_id,
                    "fill against non-fillable order dropped"
                );
                self.notifier
                    .alert(
                        AlertLevel::Warn,
                        &format!(
                            "fill {} dropped: order {} is {}",
                            fill.broker_fill_id, order.order_id, order.status
                        ),
                    )
                    .await;
                Ok(ProcessedFill::Rejected)
            }
            FillApply::OrderNotFound => {
                warn!(order_id = %fill.order_id, "fill references unknown order");
                Ok(ProcessedFill::Unmatched)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        self.store.get(order_id).await
    }

    pub async fn open_orders(&self, worker_id: &str) -> Result<Vec<Order>> {
        self.store.list_non_terminal(Some(worker_id)).await
    }

    /// Derive the worker's position on `symbol` from the fills table.
    pub async fn position(
        &self,
        worker_id: &str,
        symbol: &str,
        current_price: Option<Decimal>,
    ) -> Result<PositionView> {
        let fills = self.store.list_fills_for_symbol(worker_id, symbol).await?;
        Ok(position_from_fills(symbol, &fills, current_price))
    }
}

impl std::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("account_id", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn setup() -> (OrderService, MockBroker, Arc<ManualClock>) {
        let store = MemoryStore::new();
        let broker = MockBroker::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(),
        ));
        let service = OrderService::new(
            Arc::new(store),
            Arc::new(broker.clone()),
            Arc::new(Notifier::disabled()),
            clock.clone(),
            "ACC1".to_string(),
        );
        (service, broker, clock)
    }

    fn buy_order(key: &str, qty: i64) -> NewOrder {
        NewOrder {
            idempotency_key: key.to_string(),
            worker_id: "w1".to_string(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty,
            price: None,
        }
    }

    fn execution(order: &Order, fill_id: &str, qty: i64, price: Decimal) -> ExecutionEvent {
        ExecutionEvent {
            broker_fill_id: fill_id.to_string(),
            broker_order_id: order.broker_order_id.clone().unwrap(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty,
            price,
            fill_time: Utc.with_ymd_and_hms(2024, 6, 3, 10, 5, 0).unwrap(),
        }
    }

    // --- Create ------------------------------------------------------------

    #[tokio::test]
    async fn create_is_idempotent_on_key() {
        let (service, _, _) = setup();
        let first = service.create_order(buy_order("k1", 10)).await.unwrap();
        let second = service.create_order(buy_order("k1", 10)).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(first.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn create_validates_shape() {
        let (service, _, _) = setup();
        assert!(service.create_order(buy_order("k1", 0)).await.is_err());
        assert!(service.create_order(buy_order("", 10)).await.is_err());

        let mut limit_without_price = buy_order("k2", 10);
        limit_without_price.order_type = OrderType::Limit;
        assert!(service.create_order(limit_without_price).await.is_err());

        let mut market_with_price = buy_order("k3", 10);
        market_with_price.price = Some(dec!(10));
        assert!(service.create_order(market_with_price).await.is_err());

        let long_key = "k".repeat(IDEMPOTENCY_KEY_MAX_LEN + 1);
        assert!(service.create_order(buy_order(&long_key, 10)).await.is_err());
    }

    // --- Send --------------------------------------------------------------

    #[tokio::test]
    async fn send_moves_pending_to_sent_once() {
        let (service, broker, _) = setup();
        let order = service.create_order(buy_order("k1", 10)).await.unwrap();

        let sent = service.send_order(order.order_id).await.unwrap();
        assert_eq!(sent.status, OrderStatus::Sent);
        assert!(sent.broker_order_id.is_some());

        // Second send is a no-op read.
        let again = service.send_order(order.order_id).await.unwrap();
        assert_eq!(again.status, OrderStatus::Sent);
        assert_eq!(broker.distinct_placements(), 1);
    }

    #[tokio::test]
    async fn timeout_then_retry_places_exactly_once() {
        // The broker times out with unknown outcome; the row stays PENDING
        // and the retry with the same key cannot double-place.
        let (service, broker, _) = setup();
        let order = service.create_order(buy_order("k1", 10)).await.unwrap();

        broker.fail_next_place(TradeError::TransientBroker("timeout".into()));
        let err = service.send_order(order.order_id).await.unwrap_err();
        assert!(err.is_transient());

        let pending = service.get_order(order.order_id).await.unwrap().unwrap();
        assert_eq!(pending.status, OrderStatus::Pending);

        let sent = service.send_order(order.order_id).await.unwrap();
        assert_eq!(sent.status, OrderStatus::Sent);
        assert_eq!(broker.distinct_placements(), 1);
    }

    #[tokio::test]
    async fn broker_reject_marks_rejected() {
        let (service, broker, _) = setup();
        let order = service.create_order(buy_order("k1", 10)).await.unwrap();

        broker.fail_next_place(TradeError::BrokerReject("bad symbol".into()));
        let rejected = service.send_order(order.order_id).await.unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
    }

    // --- Fills -------------------------------------------------------------

    #[tokio::test]
    async fn partial_then_full_fill_progression() {
        let (service, _, _) = setup();
        let order = service.create_order(buy_order("k1", 10)).await.unwrap();
        let sent = service.send_order(order.order_id).await.unwrap();

        let outcome = service
            .process_execution(&execution(&sent, "F1", 4, dec!(100)))
            .await
            .unwrap();
        let ProcessedFill::Applied(after_partial) = outcome else {
            panic!("expected applied fill");
        };
        assert_eq!(after_partial.status, OrderStatus::Partial);
        assert_eq!(after_partial.filled_qty, 4);
        assert_eq!(after_partial.avg_fill_price, dec!(100));

        let outcome = service
            .process_execution(&execution(&sent, "F2", 6, dec!(110)))
            .await
            .unwrap();
        let ProcessedFill::Applied(filled) = outcome else {
            panic!("expected applied fill");
        };
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.filled_qty, 10);
        assert_eq!(filled.avg_fill_price, dec!(106)); // (4*100 + 6*110) / 10
    }

    #[tokio::test]
    async fn duplicate_fill_is_idempotent() {
        let (service, _, _) = setup();
        let order = service.create_order(buy_order("k1", 10)).await.unwrap();
        let sent = service.send_order(order.order_id).await.unwrap();
        let event = execution(&sent, "F1", 10, dec!(100));

        let first = service.process_execution(&event).await.unwrap();
        assert!(matches!(first, ProcessedFill::Applied(_)));

        let replay = service.process_execution(&event).await.unwrap();
        assert!(matches!(replay, ProcessedFill::Duplicate));

        let order = service.get_order(sent.order_id).await.unwrap().unwrap();
        assert_eq!(order.filled_qty, 10, "aggregate updated exactly once");
    }

    #[tokio::test]
    async fn overflow_fill_rejected_then_legit_fill_accepted() {
        // A spurious 7-share fill against a 5-share order is dropped whole;
        // the later legitimate 5-share fill completes the order.
        let (service, _, _) = setup();
        let order = service.create_order(buy_order("k1", 5)).await.unwrap();
        let sent = service.send_order(order.order_id).await.unwrap();

        let spurious = service
            .process_execution(&execution(&sent, "F9", 7, dec!(100)))
            .await
            .unwrap();
        assert!(matches!(spurious, ProcessedFill::Rejected));

        let untouched = service.get_order(sent.order_id).await.unwrap().unwrap();
        assert_eq!(untouched.filled_qty, 0);
        assert_eq!(untouched.status, OrderStatus::Sent);

        let legit = service
            .process_execution(&execution(&sent, "F10", 5, dec!(100)))
            .await
            .unwrap();
        let ProcessedFill::Applied(filled) = legit else {
            panic!("expected applied fill");
        };
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.filled_qty, 5);
    }

    #[tokio::test]
    async fn unmatched_execution_reported() {
        let (service, _, _) = setup();
        let event = ExecutionEvent {
            broker_fill_id: "F1".into(),
            broker_order_id: "NOPE".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            qty: 1,
            price: dec!(1),
            fill_time: Utc::now(),
        };
        let outcome = service.process_execution(&event).await.unwrap();
        assert!(matches!(outcome, ProcessedFill::Unmatched));
    }

    // --- Cancel ------------------------------------------------------------

    #[tokio::test]
    async fn partial_fill_then_cancel_keeps_executed_portion() {
        let (service, _, _) = setup();
        let order = service.create_order(buy_order("k1", 10)).await.unwrap();
        let sent = service.send_order(order.order_id).await.unwrap();

        service
            .process_execution(&execution(&sent, "F1", 4, dec!(100)))
            .await
            .unwrap();

        assert!(service.cancel_order(sent.order_id).await.unwrap());
        // Optimistic: still PARTIAL until the broker confirms.
        let order = service.get_order(sent.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Partial);

        assert!(service.confirm_cancel(sent.order_id).await.unwrap());
        let order = service.get_order(sent.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
        assert_eq!(order.filled_qty, 4, "executed portion preserved");

        // A late fill against the canceled order is dropped.
        let late = service
            .process_execution(&execution(&sent, "F2", 6, dec!(100)))
            .await
            .unwrap();
        assert!(matches!(late, ProcessedFill::Rejected));
    }

    #[tokio::test]
    async fn cancel_illegal_for_pending_and_terminal() {
        let (service, _, _) = setup();
        let order = service.create_order(buy_order("k1", 10)).await.unwrap();
        assert!(service.cancel_order(order.order_id).await.is_err());

        let sent = service.send_order(order.order_id).await.unwrap();
        service
            .process_execution(&execution(&sent, "F1", 10, dec!(100)))
            .await
            .unwrap();
        assert!(service.cancel_order(sent.order_id).await.is_err());
    }

    // --- Position ----------------------------------------------------------

    #[tokio::test]
    async fn position_derived_from_fifo_fills() {
        let (service, _, _) = setup();
        let buy = service.create_order(buy_order("k1", 10)).await.unwrap();
        let buy = service.send_order(buy.order_id).await.unwrap();
        service
            .process_execution(&execution(&buy, "F1", 10, dec!(100)))
            .await
            .unwrap();

        let mut sell_req = buy_order("k2", 4);
        sell_req.side = Side::Sell;
        let sell = service.create_order(sell_req).await.unwrap();
        let sell = service.send_order(sell.order_id).await.unwrap();
        service
            .process_execution(&execution(&sell, "F2", 4, dec!(110)))
            .await
            .unwrap();

        let pos = service
            .position("w1", "AAPL", Some(dec!(105)))
            .await
            .unwrap();
        assert_eq!(pos.net_qty, 6);
        assert_eq!(pos.avg_cost, dec!(100));
        assert_eq!(pos.realized_pnl, dec!(40));
        assert_eq!(pos.unrealized_pnl, Some(dec!(30)));
    }
}
