// =============================================================================
// PnL Engine — FIFO lot accounting and the daily summary rollup
// =============================================================================
//
// Realized PnL consumes open BUY lots oldest-first; unrealized PnL marks the
// remaining lots against the current price. A "trade" is a closed round-trip:
// it completes the moment a symbol's net quantity returns to flat, and its
// PnL is everything realized since the previous flat point.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::{OrderStore, SummaryStore};
use crate::types::{to_money, DailySummary, Fill, Side};

// ---------------------------------------------------------------------------
// Lot book
// ---------------------------------------------------------------------------

/// One open BUY lot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lot {
    pub qty: i64,
    pub price: Decimal,
}

/// Per-symbol FIFO queue of open lots plus accumulated realized PnL.
#[derive(Debug, Clone, Default)]
pub struct LotBook {
    lots: VecDeque<Lot>,
    realized: Decimal,
}

impl LotBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one execution. Returns the realized PnL delta (zero for buys).
    pub fn apply(&mut self, side: Side, qty: i64, price: Decimal) -> Decimal {
        match side {
            Side::Buy => {
                self.lots.push_back(Lot { qty, price });
                Decimal::ZERO
            }
            Side::Sell => {
                let mut remaining = qty;
                let mut delta = Decimal::ZERO;
                while remaining > 0 {
                    let Some(front) = self.lots.front_mut() else {
                        // Long-only book: a sell beyond held quantity points
                        // at broker-side inconsistency upstream.
                        warn!(excess = remaining, "sell exceeds open lots — ignoring excess");
                        break;
                    };
                    let consumed = remaining.min(front.qty);
                    delta += (price - front.price) * Decimal::from(consumed);
                    front.qty -= consumed;
                    remaining -= consumed;
                    if front.qty == 0 {
                        self.lots.pop_front();
                    }
                }
                let delta = to_money(delta);
                self.realized += delta;
                delta
            }
        }
    }

    pub fn net_qty(&self) -> i64 {
        self.lots.iter().map(|l| l.qty).sum()
    }

    pub fn realized(&self) -> Decimal {
        self.realized
    }

    /// Quantity-weighted cost of the open lots; zero when flat.
    pub fn avg_cost(&self) -> Decimal {
        let qty = self.net_qty();
        if qty == 0 {
            return Decimal::ZERO;
        }
        let notional: Decimal = self
            .lots
            .iter()
            .map(|l| l.price * Decimal::from(l.qty))
            .sum();
        to_money(notional / Decimal::from(qty))
    }

    /// `(current_price - lot_price) * lot_qty` summed over the open lots.
    pub fn unrealized(&self, current_price: Decimal) -> Decimal {
        let total: Decimal = self
            .lots
            .iter()
            .map(|l| (current_price - l.price) * Decimal::from(l.qty))
            .sum();
        to_money(total)
    }
}

// ---------------------------------------------------------------------------
// Position view
// ---------------------------------------------------------------------------

/// Derived per-symbol position: net quantity, cost, and mark-to-market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    pub net_qty: i64,
    pub avg_cost: Decimal,
    pub realized_pnl: Decimal,
    /// Present when a current price was available to mark against.
    pub unrealized_pnl: Option<Decimal>,
}

/// Fold a symbol's fill history (oldest first) into a position view.
pub fn position_from_fills(
    symbol: &str,
    fills: &[Fill],
    current_price: Option<Decimal>,
) -> PositionView {
    let mut book = LotBook::new();
    for fill in fills {
        book.apply(fill.side, fill.qty, fill.price);
    }
    PositionView {
        symbol: symbol.to_string(),
        net_qty: book.net_qty(),
        avg_cost: book.avg_cost(),
        realized_pnl: book.realized(),
        unrealized_pnl: current_price.map(|p| book.unrealized(p)),
    }
}

// ---------------------------------------------------------------------------
// Daily aggregates
// ---------------------------------------------------------------------------

/// Compute the per-worker per-date rollup from the day's fills.
///
/// `unrealized` is the end-of-day mark of whatever remains open (zero after a
/// clean forced liquidation). Residual realized PnL on symbols that never
/// returned to flat still lands in gross profit/loss so `net_pnl` stays
/// truthful; only closed round-trips count as trades.
pub fn compute_summary(
    worker_id: &str,
    date: NaiveDate,
    fills: &[Fill],
    unrealized: Decimal,
) -> DailySummary {
    let mut books: BTreeMap<&str, LotBook> = BTreeMap::new();
    let mut open_trade_pnl: BTreeMap<&str, Decimal> = BTreeMap::new();

    let mut total_trades = 0u32;
    let mut winning_trades = 0u32;
    let mut losing_trades = 0u32;
    let mut gross_profit = Decimal::ZERO;
    let mut gross_loss = Decimal::ZERO;

    // Drawdown over the running cumulative realized curve.
    let mut cumulative = Decimal::ZERO;
    let mut peak = Decimal::ZERO;
    let mut max_drawdown = Decimal::ZERO;

    for fill in fills {
        let book = books.entry(fill.symbol.as_str()).or_default();
        let delta = book.apply(fill.side, fill.qty, fill.price);

        if fill.side == Side::Sell {
            let acc = open_trade_pnl.entry(fill.symbol.as_str()).or_default();
            *acc += delta;

            cumulative += delta;
            if cumulative > peak {
                peak = cumulative;
            }
            let drawdown = peak - cumulative;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }

            if book.net_qty() == 0 {
                let trade_pnl = *acc;
                open_trade_pnl.remove(fill.symbol.as_str());

                total_trades += 1;
                if trade_pnl > Decimal::ZERO {
                    winning_trades += 1;
                    gross_profit += trade_pnl;
                } else if trade_pnl < Decimal::ZERO {
                    losing_trades += 1;
                    gross_loss += -trade_pnl;
                }
            }
        }
    }

    // Residual realized PnL from positions still open at day end.
    for (_, residual) in open_trade_pnl {
        if residual > Decimal::ZERO {
            gross_profit += residual;
        } else if residual < Decimal::ZERO {
            gross_loss += -residual;
        }
    }

    let win_rate = if total_trades == 0 {
        0.0
    } else {
        f64::from(winning_trades) / f64::from(total_trades)
    };

    let profit_factor = if gross_loss.is_zero() {
        if gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
    };

    DailySummary {
        worker_id: worker_id.to_string(),
        summary_date: date,
        total_trades,
        winning_trades,
        losing_trades,
        gross_profit: to_money(gross_profit),
        gross_loss: to_money(gross_loss),
        net_pnl: to_money(gross_profit - gross_loss),
        unrealized_pnl: to_money(unrealized),
        max_drawdown: to_money(max_drawdown),
        win_rate,
        profit_factor,
    }
}

// ---------------------------------------------------------------------------
// Daily summary service
// ---------------------------------------------------------------------------

/// Computes and upserts the `(worker_id, summary_date)` rollup. Idempotent:
/// regenerating the same day overwrites the previous row.
pub struct DailySummaryService {
    orders: Arc<dyn OrderStore>,
    summaries: Arc<dyn SummaryStore>,
    clock: Arc<dyn Clock>,
}

impl DailySummaryService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        summaries: Arc<dyn SummaryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            summaries,
            clock,
        }
    }

    /// Generate and persist today's rollup for `worker_id`.
    pub async fn generate_today(&self, worker_id: &str, unrealized: Decimal) -> Result<DailySummary> {
        let date = self.clock.now().date_naive();
        self.generate_summary(worker_id, date, unrealized).await
    }

    pub async fn generate_summary(
        &self,
        worker_id: &str,
        date: NaiveDate,
        unrealized: Decimal,
    ) -> Result<DailySummary> {
        let fills = self.orders.list_fills_for_date(worker_id, date).await?;
        let summary = compute_summary(worker_id, date, &fills, unrealized);

        info!(
            worker_id,
            date = %date,
            total_trades = summary.total_trades,
            net_pnl = %summary.net_pnl,
            win_rate = summary.win_rate,
            "daily summary generated"
        );

        self.summaries.upsert(&summary).await?;
        Ok(summary)
    }
}

impl std::fmt::Debug for DailySummaryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailySummaryService").finish()
    }
}
