// =============================================================================
// Market Data Poller — candidate discovery over the configured universe
// =============================================================================
//
// One poll: snapshot quotes from the broker, drop anything failing the coarse
// liquidity/price filters or carrying stale data, score what survives with
// the strategy-supplied scalar, sort descending, cap at `max_n`. No persisted
// side effects; a failed poll is the orchestrator's problem to retry on the
// next tick.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info};

use crate::broker::{BrokerPort, Quote};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::types::Candidate;

/// Coarse filters applied before scoring.
#[derive(Debug, Clone)]
pub struct CandidateFilters {
    pub min_volume: i64,
    pub min_turnover: Decimal,
    pub price_min: Decimal,
    pub price_max: Decimal,
    /// Quotes older than this are treated as missing data.
    pub staleness: chrono::Duration,
}

impl CandidateFilters {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_volume: config.min_candidate_volume,
            min_turnover: config.min_candidate_turnover,
            price_min: config.candidate_price_min,
            price_max: config.candidate_price_max,
            staleness: config.quote_staleness(),
        }
    }

    fn passes(&self, quote: &Quote, now: chrono::DateTime<chrono::Utc>) -> bool {
        if now - quote.as_of > self.staleness {
            return false;
        }
        quote.volume >= self.min_volume
            && quote.turnover >= self.min_turnover
            && quote.price >= self.price_min
            && quote.price <= self.price_max
    }
}

pub struct MarketDataPoller {
    broker: Arc<dyn BrokerPort>,
    clock: Arc<dyn Clock>,
}

impl MarketDataPoller {
    pub fn new(broker: Arc<dyn BrokerPort>, clock: Arc<dyn Clock>) -> Self {
        Self { broker, clock }
    }

    /// Run one poll over `universe` and return at most `max_n` scored
    /// candidates, best first.
    pub async fn discover_candidates(
        &self,
        universe: &[String],
        filters: &CandidateFilters,
        max_n: usize,
        score: &(dyn Fn(&Quote) -> f64 + Send + Sync),
    ) -> Result<Vec<Candidate>> {
        let quotes = self.broker.get_quotes(universe).await?;
        let now = self.clock.now();
        let polled = quotes.len();

        let mut candidates: Vec<Candidate> = quotes
            .into_iter()
            .filter(|q| filters.passes(q, now))
            .filter_map(|q| {
                let s = score(&q);
                // A NaN score means the strategy could not rate the symbol.
                if !s.is_finite() {
                    debug!(symbol = %q.symbol, "non-finite score — candidate dropped");
                    return None;
                }
                let mut indicators = HashMap::new();
                indicators.insert("volume".to_string(), q.volume as f64);
                indicators.insert("turnover".to_string(), q.turnover.to_f64().unwrap_or(0.0));
                Some(Candidate {
                    symbol: q.symbol,
                    price: q.price,
                    volume: q.volume,
                    score: s,
                    indicators,
                    scanned_at: now,
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(max_n);

        info!(
            polled,
            passed = candidates.len(),
            max_n,
            "candidate poll complete"
        );
        Ok(candidates)
    }
}

impl std::fmt::Debug for MarketDataPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataPoller").finish()
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
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn filters() -> CandidateFilters {
        CandidateFilters {
            min_volume: 1_000,
            min_turnover: dec!(10000),
            price_min: dec!(5),
            price_max: dec!(500),
            staleness: chrono::Duration::seconds(30),
        }
    }

    fn setup() -> (MarketDataPoller, MockBroker, Arc<ManualClock>) {
        let broker = MockBroker::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(),
        ));
        let poller = MarketDataPoller::new(Arc::new(broker.clone()), clock.clone());
        (poller, broker, clock)
    }

    fn universe() -> Vec<String> {
        vec!["A".into(), "B".into(), "C".into(), "D".into()]
    }

    #[tokio::test]
    async fn filters_drop_thin_and_out_of_range_symbols() {
        let (poller, broker, _) = setup();
        broker.set_quote("A", dec!(100), 50_000, dec!(5000000)); // passes
        broker.set_quote("B", dec!(100), 10, dec!(5000000)); // volume too low
        broker.set_quote("C", dec!(2), 50_000, dec!(5000000)); // price too low
        broker.set_quote("D", dec!(100), 50_000, dec!(1)); // turnover too low

        let out = poller
            .discover_candidates(&universe(), &filters(), 10, &|_| 0.5)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].symbol, "A");
    }

    #[tokio::test]
    async fn stale_quotes_are_treated_as_missing() {
        let (poller, broker, clock) = setup();
        broker.set_quote("A", dec!(100), 50_000, dec!(5000000));

        clock.advance_secs(31);
        let out = poller
            .discover_candidates(&universe(), &filters(), 10, &|_| 0.5)
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn candidates_sorted_by_score_and_truncated() {
        let (poller, broker, _) = setup();
        broker.set_quote("A", dec!(100), 10_000, dec!(1000000));
        broker.set_quote("B", dec!(100), 30_000, dec!(1000000));
        broker.set_quote("C", dec!(100), 20_000, dec!(1000000));

        let score = |q: &Quote| q.volume as f64;
        let out = poller
            .discover_candidates(&universe(), &filters(), 2, &score)
            .await
            .unwrap();

        assert_eq!(out.len(), 2, "capped at max_n");
        assert_eq!(out[0].symbol, "B");
        assert_eq!(out[1].symbol, "C");
        assert!(out[0].score > out[1].score);
    }

    #[tokio::test]
    async fn non_finite_scores_are_dropped() {
        let (poller, broker, _) = setup();
        broker.set_quote("A", dec!(100), 50_000, dec!(5000000));
        let out = poller
            .discover_candidates(&universe(), &filters(), 10, &|_| f64::NAN)
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn missing_symbols_are_skipped() {
        let (poller, broker, _) = setup();
        broker.set_quote("A", dec!(100), 50_000, dec!(5000000));
        // B, C, D have no quotes at all.
        let out = poller
            .discover_candidates(&universe(), &filters(), 10, &|_| 0.5)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
    }
}
