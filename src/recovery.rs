// =============================================================================
// Recovery & Reconciliation — broker truth at startup, sweeping in steady state
// =============================================================================
//
// Startup reconciliation runs before the event loop: the broker's view of
// orders and positions overrides any divergent local view. Orders the broker
// knows but we do not are adopted under a `reconciled:` idempotency key;
// local orders the broker has never heard of are declared LOST once old
// enough. The periodic sweeper expires overdue locks and reaps silent
// workers; it may run in every worker concurrently.
// =============================================================================

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerPort, BrokerPosition};
use crate::clock::Clock;
use crate::error::Result;
use crate::lifecycle::WorkerLifecycleService;
use crate::lock::LockService;
use crate::store::{OrderInsert, OrderStore};
use crate::types::{Order, OrderStatus};

/// Cadence of the lock/worker sweeper.
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(30);

/// Reason recorded on local orders the broker never saw.
const LOST_REASON: &str = "LOST";

// ---------------------------------------------------------------------------
// Startup reconciliation
// ---------------------------------------------------------------------------

/// Per-action counts from one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Broker-known open orders adopted into the local store.
    pub adopted_broker_orders: u32,
    /// Local non-terminal orders declared LOST.
    pub lost_local_orders: u32,
    /// Local orders whose terminal status was synced from the broker.
    pub synced_terminal_orders: u32,
    /// Broker positions taken as the authoritative view.
    pub positions_refreshed: u32,
    pub completed_at: DateTime<Utc>,
}

/// Authoritative state handed back to the orchestrator.
#[derive(Debug, Clone)]
pub struct RecoveredState {
    pub report: RecoveryReport,
    /// Broker positions, keyed view for the worker's position cache.
    pub positions: Vec<BrokerPosition>,
}

/// Run one startup reconciliation pass for `worker_id`.
pub async fn reconcile_startup(
    broker: &Arc<dyn BrokerPort>,
    orders: &Arc<dyn OrderStore>,
    clock: &Arc<dyn Clock>,
    account_id: &str,
    worker_id: &str,
    lost_order_timeout: Duration,
) -> Result<RecoveredState> {
    let now = clock.now();
    info!(worker_id, "startup reconciliation started");

    // 1. Broker truth.
    let broker_orders = broker.get_orders(account_id).await?;
    let broker_positions = broker.get_positions(account_id).await?;

    // 2. Local view.
    let local_open = orders.list_non_terminal(None).await?;

    let mut report = RecoveryReport {
        completed_at: now,
        ..Default::default()
    };

    // 3. Adopt broker-known open orders missing locally.
    for remote in broker_orders.iter().filter(|o| !o.status.is_terminal()) {
        let known = local_open
            .iter()
            .any(|l| l.broker_order_id.as_deref() == Some(remote.broker_order_id.as_str()));
        if known {
            continue;
        }

        let adopted = Order {
            order_id: Uuid::new_v4(),
            broker_order_id: Some(remote.broker_order_id.clone()),
            idempotency_key: format!("reconciled:{}", remote.broker_order_id),
            worker_id: worker_id.to_string(),
            symbol: remote.symbol.clone(),
            side: remote.side,
            order_type: remote.order_type,
            qty: remote.qty,
            price: remote.price,
            status: remote.status,
            filled_qty: remote.filled_qty,
            avg_fill_price: remote.price.unwrap_or(Decimal::ZERO),
            created_at: now,
            updated_at: now,
        };
        match orders.insert(&adopted).await? {
            OrderInsert::Inserted(_) => {
                warn!(
                    broker_order_id = %remote.broker_order_id,
                    symbol = %remote.symbol,
                    "adopted broker order unknown to local store"
                );
                report.adopted_broker_orders += 1;
            }
            OrderInsert::Duplicate(_) => {
                debug!(
                    broker_order_id = %remote.broker_order_id,
                    "broker order already adopted by an earlier pass"
                );
            }
        }
    }

    // 4. Local non-terminal orders the broker does not report.
    for local in &local_open {
        let remote = local.broker_order_id.as_deref().and_then(|bid| {
            broker_orders
                .iter()
                .find(|r| r.broker_order_id == bid)
        });

        match remote {
            None => {
                if now - local.created_at >= lost_order_timeout {
                    if orders
                        .mark_rejected(local.order_id, LOST_REASON, now)
                        .await?
                    {
                        warn!(
                            order_id = %local.order_id,
                            symbol = %local.symbol,
                            age_secs = (now - local.created_at).num_seconds(),
                            "local order not known to broker — marked LOST"
                        );
                        report.lost_local_orders += 1;
                    }
                } else {
                    debug!(
                        order_id = %local.order_id,
                        "young unplaced order left PENDING for the next poll"
                    );
                }
            }
            // 5. Matched: adopt the broker's terminal verdicts.
            Some(r) if r.status == OrderStatus::Canceled => {
                if orders.mark_canceled(local.order_id, now).await? {
                    report.synced_terminal_orders += 1;
                }
            }
            Some(r) if r.status == OrderStatus::Rejected => {
                if orders
                    .mark_rejected(local.order_id, "broker-reported rejection", now)
                    .await?
                {
                    report.synced_terminal_orders += 1;
                }
            }
            Some(_) => {}
        }
    }

    // 6. Positions: the broker's list is the derived view from here on.
    report.positions_refreshed = broker_positions.len() as u32;

    info!(
        adopted = report.adopted_broker_orders,
        lost = report.lost_local_orders,
        synced = report.synced_terminal_orders,
        positions = report.positions_refreshed,
        "startup reconciliation completed"
    );

    Ok(RecoveredState {
        report,
        positions: broker_positions,
    })
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// Periodic stale-lock & stale-worker sweep. Runs until shutdown; every pass
/// is idempotent and safe to run from many workers at once.
pub async fn run_sweeper(
    locks: Arc<LockService>,
    lifecycle: Arc<WorkerLifecycleService>,
    heartbeat_interval: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) {
    let stale_threshold =
        Duration::milliseconds((heartbeat_interval.as_millis() as i64) * 3);
    info!(
        sweep_interval_secs = SWEEP_INTERVAL.as_secs(),
        stale_threshold_secs = stale_threshold.num_seconds(),
        "sweeper started"
    );

    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("sweeper stopped");
                    return;
                }
                continue;
            }
        }

        if let Err(e) = locks.cleanup_expired().await {
            warn!(error = %e, "lock sweep failed — retrying next pass");
        }
        if let Err(e) = lifecycle.cleanup_stale_workers(stale_threshold).await {
            warn!(error = %e, "worker sweep failed — retrying next pass");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerOrder, MockBroker};
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::{OrderType, Side};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct Fixture {
        broker: MockBroker,
        broker_port: Arc<dyn BrokerPort>,
        orders: Arc<dyn OrderStore>,
        clock: Arc<ManualClock>,
        clock_port: Arc<dyn Clock>,
    }

    fn fixture() -> Fixture {
        let broker = MockBroker::new();
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap(),
        ));
        Fixture {
            broker_port: Arc::new(broker.clone()),
            broker,
            orders: Arc::new(store),
            clock_port: clock.clone(),
            clock,
        }
    }

    fn remote_order(id: &str, status: OrderStatus) -> BrokerOrder {
        BrokerOrder {
            broker_order_id: id.to_string(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: 10,
            filled_qty: 0,
            price: Some(dec!(100)),
            status,
        }
    }

    fn local_order(
        f: &Fixture,
        key: &str,
        broker_order_id: Option<&str>,
        status: OrderStatus,
    ) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            broker_order_id: broker_order_id.map(str::to_string),
            idempotency_key: key.to_string(),
            worker_id: "w1".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: 10,
            price: None,
            status,
            filled_qty: 0,
            avg_fill_price: Decimal::ZERO,
            created_at: f.clock.now(),
            updated_at: f.clock.now(),
        }
    }

    async fn run(f: &Fixture) -> RecoveredState {
        reconcile_startup(
            &f.broker_port,
            &f.orders,
            &f.clock_port,
            "ACC1",
            "w1",
            Duration::seconds(300),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn adopts_unknown_broker_orders_once() {
        let f = fixture();
        f.broker
            .set_orders(vec![remote_order("BO1", OrderStatus::Sent)]);

        let first = run(&f).await;
        assert_eq!(first.report.adopted_broker_orders, 1);

        let adopted = f
            .orders
            .get_by_broker_id("BO1")
            .await
            .unwrap()
            .expect("adopted order");
        assert_eq!(adopted.idempotency_key, "reconciled:BO1");
        assert_eq!(adopted.status, OrderStatus::Sent);
        assert_eq!(adopted.worker_id, "w1");

        // Second pass finds it and adopts nothing.
        let second = run(&f).await;
        assert_eq!(second.report.adopted_broker_orders, 0);
    }

    #[tokio::test]
    async fn old_unknown_local_orders_become_lost() {
        let f = fixture();
        let stale = local_order(&f, "k-old", None, OrderStatus::Pending);
        f.orders.insert(&stale).await.unwrap();

        f.clock.advance_secs(301);
        let fresh = local_order(&f, "k-new", None, OrderStatus::Pending);
        f.orders.insert(&fresh).await.unwrap();

        let state = run(&f).await;
        assert_eq!(state.report.lost_local_orders, 1);

        let lost = f.orders.get(stale.order_id).await.unwrap().unwrap();
        assert_eq!(lost.status, OrderStatus::Rejected);

        let kept = f.orders.get(fresh.order_id).await.unwrap().unwrap();
        assert_eq!(kept.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn broker_terminal_status_wins_for_matched_orders() {
        let f = fixture();
        let local = local_order(&f, "k1", Some("BO1"), OrderStatus::Sent);
        f.orders.insert(&local).await.unwrap();
        f.broker
            .set_orders(vec![remote_order("BO1", OrderStatus::Canceled)]);

        let state = run(&f).await;
        assert_eq!(state.report.synced_terminal_orders, 1);

        let synced = f.orders.get(local.order_id).await.unwrap().unwrap();
        assert_eq!(synced.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn broker_positions_are_reported_as_authoritative() {
        let f = fixture();
        f.broker.set_positions(vec![BrokerPosition {
            symbol: "AAPL".into(),
            qty: 10,
            avg_price: dec!(101.5),
        }]);

        let state = run(&f).await;
        assert_eq!(state.report.positions_refreshed, 1);
        assert_eq!(state.positions.len(), 1);
        assert_eq!(state.positions[0].symbol, "AAPL");
    }

    #[tokio::test]
    async fn matched_live_orders_are_left_alone() {
        let f = fixture();
        let local = local_order(&f, "k1", Some("BO1"), OrderStatus::Sent);
        f.orders.insert(&local).await.unwrap();
        f.broker
            .set_orders(vec![remote_order("BO1", OrderStatus::Sent)]);
        f.clock.advance_secs(400);

        let state = run(&f).await;
        assert_eq!(state.report.lost_local_orders, 0);
        assert_eq!(state.report.synced_terminal_orders, 0);

        let untouched = f.orders.get(local.order_id).await.unwrap().unwrap();
        assert_eq!(untouched.status, OrderStatus::Sent);
    }
}
