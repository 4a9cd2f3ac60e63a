// =============================================================================
// Momentum Strategy — turnover-weighted entries, layered exit rules
// =============================================================================
//
// Entry: rank by liquidity-weighted momentum score, buy when the score clears
// the floor, size to the capital limit.
//
// Exit precedence (first match wins):
//   1. Stop-loss        price <= avg_cost * (1 - stop_loss_pct)
//   2. Take-profit      price >= avg_cost * (1 + take_profit_pct)
//   3. Trend break      price retreats trend_break_pct from the high water
//                       while still above cost
//   4. Time exit        held longer than max_holding_secs
// =============================================================================

use chrono::Duration;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::broker::Quote;
use crate::config::StrategyParams;
use crate::pnl::PositionView;
use crate::strategy::{BuySignal, SellSignal, Strategy, StrategyContext};
use crate::types::{Candidate, SellReason};

/// Volume at which the volume component of the score saturates.
const VOLUME_SATURATION: f64 = 5_000_000.0;
/// Turnover at which the turnover component saturates.
const TURNOVER_SATURATION: f64 = 1_000_000_000.0;

pub struct MomentumStrategy {
    params: StrategyParams,
}

impl MomentumStrategy {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }

    fn pct(value: f64) -> Decimal {
        Decimal::from_f64(value).unwrap_or_default()
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn score(&self, quote: &Quote) -> f64 {
        let volume_score = (quote.volume as f64 / VOLUME_SATURATION).min(1.0);
        let turnover_score =
            (quote.turnover.to_f64().unwrap_or(0.0) / TURNOVER_SATURATION).min(1.0);
        0.5 * volume_score + 0.5 * turnover_score
    }

    fn should_buy(&self, candidate: &Candidate, ctx: &StrategyContext) -> Option<BuySignal> {
        if candidate.score < self.params.min_score {
            return None;
        }
        if candidate.price <= Decimal::ZERO {
            return None;
        }

        // Size to whichever is tighter: free cash or the per-worker cap.
        let budget = ctx.cash.min(ctx.capital_limit);
        let qty = (budget / candidate.price).floor().to_i64().unwrap_or(0);
        if qty <= 0 {
            return None;
        }

        Some(BuySignal {
            confidence: candidate.score.min(1.0),
            qty: Some(qty),
            price: None, // market entry
            reason: format!(
                "momentum score {:.3} above floor {:.3}",
                candidate.score, self.params.min_score
            ),
        })
    }

    fn should_sell(
        &self,
        _symbol: &str,
        position: &PositionView,
        current_price: Decimal,
        ctx: &StrategyContext,
    ) -> Option<SellSignal> {
        if position.net_qty <= 0 || position.avg_cost <= Decimal::ZERO {
            return None;
        }
        let cost = position.avg_cost;

        let stop = cost * (Decimal::ONE - Self::pct(self.params.stop_loss_pct));
        if current_price <= stop {
            return Some(SellSignal {
                confidence: 1.0,
                price: None,
                reason: SellReason::StopLoss,
            });
        }

        let target = cost * (Decimal::ONE + Self::pct(self.params.take_profit_pct));
        if current_price >= target {
            return Some(SellSignal {
                confidence: 1.0,
                price: None,
                reason: SellReason::TakeProfit,
            });
        }

        if let Some(high) = ctx.high_water {
            let trail = high * (Decimal::ONE - Self::pct(self.params.trend_break_pct));
            if current_price <= trail && current_price > cost {
                return Some(SellSignal {
                    confidence: 0.8,
                    price: None,
                    reason: SellReason::TrendBreak,
                });
            }
        }

        if let Some(since) = ctx.holding_since {
            let held = ctx.now - since;
            if held >= Duration::seconds(self.params.max_holding_secs as i64) {
                return Some(SellSignal {
                    confidence: 1.0,
                    price: None,
                    reason: SellReason::TimeExit,
                });
            }
        }

        None
    }
}

impl std::fmt::Debug for MomentumStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MomentumStrategy")
            .field("params", &self.params)
            .finish()
    }
}
