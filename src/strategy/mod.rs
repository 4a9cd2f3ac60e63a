// =============================================================================
// Strategy Executor — thin dispatcher over a pluggable trading strategy
// =============================================================================
//
// The core stays strategy-agnostic: concrete logic lives behind the
// `Strategy` trait, and the executor only enforces the contract — a returned
// signal has cleared the confidence gate and carries a human-readable reason
// for the audit trail.
// =============================================================================

pub mod momentum;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::Quote;
use crate::config::StrategyParams;
use crate::error::{Result, TradeError};
use crate::pnl::PositionView;
use crate::types::{Candidate, SellReason};

pub use momentum::MomentumStrategy;

// ---------------------------------------------------------------------------
// Signals & context
// ---------------------------------------------------------------------------

/// An entry signal. `qty`/`price` are optional overrides; the orchestrator
/// sizes the order when they are absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuySignal {
    pub confidence: f64,
    pub qty: Option<i64>,
    pub price: Option<Decimal>,
    pub reason: String,
}

/// An exit signal. `price` requests a LIMIT exit; `None` means market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellSignal {
    pub confidence: f64,
    pub price: Option<Decimal>,
    pub reason: SellReason,
}

/// Read-only facts handed to the strategy on every evaluation.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub now: DateTime<Utc>,
    /// Free cash reported by the broker.
    pub cash: Decimal,
    /// Hard cap on entry notional for this worker.
    pub capital_limit: Decimal,
    pub params: StrategyParams,
    /// When the current position was opened (HOLDING evaluations only).
    pub holding_since: Option<DateTime<Utc>>,
    /// Highest price seen since entry (HOLDING evaluations only).
    pub high_water: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Scalar ranking for the poller; higher is better. Non-finite values
    /// drop the symbol from the scan.
    fn score(&self, quote: &Quote) -> f64;

    fn should_buy(&self, candidate: &Candidate, ctx: &StrategyContext) -> Option<BuySignal>;

    fn should_sell(
        &self,
        symbol: &str,
        position: &PositionView,
        current_price: Decimal,
        ctx: &StrategyContext,
    ) -> Option<SellSignal>;
}

/// Resolve a strategy by its configured name.
pub fn build_strategy(name: &str, params: &StrategyParams) -> Result<Arc<dyn Strategy>> {
    match name {
        "momentum" => Ok(Arc::new(MomentumStrategy::new(params.clone()))),
        other => Err(TradeError::Config(format!("unknown strategy '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct StrategyExecutor {
    inner: Arc<dyn Strategy>,
    min_confidence: f64,
}

impl StrategyExecutor {
    pub fn new(inner: Arc<dyn Strategy>, min_confidence: f64) -> Self {
        Self {
            inner,
            min_confidence,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn score(&self, quote: &Quote) -> f64 {
        self.inner.score(quote)
    }

    /// Evaluate an entry. Signals below the confidence gate or without an
    /// audit reason never reach the caller.
    pub fn should_buy(&self, candidate: &Candidate, ctx: &StrategyContext) -> Option<BuySignal> {
        let signal = self.inner.should_buy(candidate, ctx)?;

        if signal.confidence < self.min_confidence {
            debug!(
                symbol = %candidate.symbol,
                confidence = signal.confidence,
                gate = self.min_confidence,
                "buy signal below confidence gate"
            );
            return None;
        }
        if signal.reason.is_empty() {
            warn!(
                symbol = %candidate.symbol,
                strategy = self.inner.name(),
                "buy signal without a reason dropped"
            );
            return None;
        }

        debug!(
            symbol = %candidate.symbol,
            confidence = signal.confidence,
            reason = %signal.reason,
            "buy signal emitted"
        );
        Some(signal)
    }

    /// Evaluate an exit with the same gate.
    pub fn should_sell(
        &self,
        symbol: &str,
        position: &PositionView,
        current_price: Decimal,
        ctx: &StrategyContext,
    ) -> Option<SellSignal> {
        let signal = self.inner.should_sell(symbol, position, current_price, ctx)?;

        if signal.confidence < self.min_confidence {
            debug!(
                symbol,
                confidence = signal.confidence,
                gate = self.min_confidence,
                "sell signal below confidence gate"
            );
            return None;
        }

        debug!(
            symbol,
            confidence = signal.confidence,
            reason = %signal.reason,
            "sell signal emitted"
        );
        Some(signal)
    }
}

impl std::fmt::Debug for StrategyExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyExecutor")
            .field("strategy", &self.inner.name())
            .field("min_confidence", &self.min_confidence)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct FixedStrategy {
        confidence: f64,
        reason: String,
    }

    impl Strategy for FixedStrategy {
        fn name(&self) -> &str {
            "fixed"
        }

        fn score(&self, _quote: &Quote) -> f64 {
            self.confidence
        }

        fn should_buy(&self, _c: &Candidate, _ctx: &StrategyContext) -> Option<BuySignal> {
            Some(BuySignal {
                confidence: self.confidence,
                qty: Some(1),
                price: None,
                reason: self.reason.clone(),
            })
        }

        fn should_sell(
            &self,
            _symbol: &str,
            _position: &PositionView,
            _price: Decimal,
            _ctx: &StrategyContext,
        ) -> Option<SellSignal> {
            Some(SellSignal {
                confidence: self.confidence,
                price: None,
                reason: SellReason::TakeProfit,
            })
        }
    }

    fn candidate() -> Candidate {
        Candidate {
            symbol: "AAPL".into(),
            price: dec!(100),
            volume: 10_000,
            score: 0.9,
            indicators: HashMap::new(),
            scanned_at: Utc::now(),
        }
    }

    fn ctx() -> StrategyContext {
        StrategyContext {
            now: Utc::now(),
            cash: dec!(10000),
            capital_limit: dec!(10000),
            params: StrategyParams::default(),
            holding_since: None,
            high_water: None,
        }
    }

    fn position() -> PositionView {
        PositionView {
            symbol: "AAPL".into(),
            net_qty: 10,
            avg_cost: dec!(100),
            realized_pnl: dec!(0),
            unrealized_pnl: None,
        }
    }

    #[test]
    fn confidence_gate_blocks_weak_signals() {
        let strong = StrategyExecutor::new(
            Arc::new(FixedStrategy {
                confidence: 0.8,
                reason: "looks good".into(),
            }),
            0.5,
        );
        assert!(strong.should_buy(&candidate(), &ctx()).is_some());
        assert!(strong
            .should_sell("AAPL", &position(), dec!(101), &ctx())
            .is_some());

        let weak = StrategyExecutor::new(
            Arc::new(FixedStrategy {
                confidence: 0.4,
                reason: "meh".into(),
            }),
            0.5,
        );
        assert!(weak.should_buy(&candidate(), &ctx()).is_none());
        assert!(weak
            .should_sell("AAPL", &position(), dec!(101), &ctx())
            .is_none());
    }

    #[test]
    fn reasonless_buy_signal_is_dropped() {
        let executor = StrategyExecutor::new(
            Arc::new(FixedStrategy {
                confidence: 0.9,
                reason: String::new(),
            }),
            0.5,
        );
        assert!(executor.should_buy(&candidate(), &ctx()).is_none());
    }

    #[test]
    fn registry_resolves_known_names_only() {
        let params = StrategyParams::default();
        assert!(build_strategy("momentum", &params).is_ok());
        assert!(matches!(
            build_strategy("hope-and-pray", &params),
            Err(TradeError::Config(_))
        ));
    }
}
