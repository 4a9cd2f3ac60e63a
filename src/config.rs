// =============================================================================
// Worker Configuration — env-first with an optional JSON file
// =============================================================================
//
// Precedence: built-in defaults < JSON file (--config PATH) < environment.
// Every field carries `#[serde(default)]` so that an older config file never
// breaks loading. Credentials are read from the environment only and are
// never serialised.
// =============================================================================

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TradeError};
use crate::session::TradingSession;
use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_universe() -> Vec<String> {
    Vec::new()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_lock_ttl_ms() -> u64 {
    300_000
}

fn default_lock_renew_threshold_ms() -> u64 {
    // TTL / 3
    100_000
}

fn default_shutdown_deadline_ms() -> u64 {
    60_000
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_rpc_max_retries() -> u32 {
    3
}

fn default_rate_limit_per_sec() -> u32 {
    20
}

fn default_capital_limit() -> Decimal {
    Decimal::new(10_000_0000, 4) // 10,000.0000
}

fn default_daily_loss_limit() -> Decimal {
    Decimal::new(500_0000, 4) // 500.0000
}

fn default_liquidation_offset_min() -> i64 {
    15
}

fn default_session_open() -> String {
    "09:00".to_string()
}

fn default_session_close() -> String {
    "15:30".to_string()
}

fn default_strategy_name() -> String {
    "momentum".to_string()
}

fn default_min_buy_confidence() -> f64 {
    0.5
}

fn default_min_candidate_volume() -> i64 {
    10_000
}

fn default_min_candidate_turnover() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_candidate_price_min() -> Decimal {
    Decimal::ONE
}

fn default_candidate_price_max() -> Decimal {
    Decimal::new(1_000_000, 0)
}

fn default_quote_staleness_ms() -> u64 {
    30_000
}

fn default_lost_order_timeout_ms() -> u64 {
    300_000
}

fn default_max_candidates() -> usize {
    10
}

fn default_bind_addr() -> String {
    "127.0.0.1:3701".to_string()
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Tunable parameters consumed by the built-in strategies. Strategy-specific
/// and opaque to the rest of the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Exit when price falls this fraction below entry (e.g. 0.02 = 2 %).
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Exit when price rises this fraction above entry.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Trend-break exit: price retreats this fraction from the session high.
    #[serde(default = "default_trend_break_pct")]
    pub trend_break_pct: f64,

    /// Time exit after this many seconds in the position.
    #[serde(default = "default_max_holding_secs")]
    pub max_holding_secs: u64,

    /// Candidates scoring below this are never bought.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

fn default_stop_loss_pct() -> f64 {
    0.02
}

fn default_take_profit_pct() -> f64 {
    0.03
}

fn default_trend_break_pct() -> f64 {
    0.015
}

fn default_max_holding_secs() -> u64 {
    3_600
}

fn default_min_score() -> f64 {
    0.2
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            trend_break_pct: default_trend_break_pct(),
            max_holding_secs: default_max_holding_secs(),
            min_score: default_min_score(),
        }
    }
}

// =============================================================================
// Credentials (environment only)
// =============================================================================

/// Broker credentials. Loaded from the environment, never serialised.
#[derive(Clone)]
pub struct Credentials {
    pub app_key: String,
    pub app_secret: String,
    pub account_number: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        let app_key = require_env("BROKER_APP_KEY")?;
        let app_secret = require_env("BROKER_APP_SECRET")?;
        let account_number = require_env("BROKER_ACCOUNT_NUMBER")?;
        Ok(Self {
            app_key,
            app_secret,
            account_number,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("account_number", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Config
// =============================================================================

/// Full runtime configuration for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- Mode & universe -----------------------------------------------------
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// The finite symbol universe this worker scans.
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,

    // --- Runtime cadences ----------------------------------------------------
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Renew the lock once time-to-expiry drops below this.
    #[serde(default = "default_lock_renew_threshold_ms")]
    pub lock_renew_threshold_ms: u64,

    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: u32,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    // --- Risk ----------------------------------------------------------------
    /// Maximum notional a single entry may commit.
    #[serde(default = "default_capital_limit")]
    pub capital_limit_per_worker: Decimal,

    /// Realized day loss at which the worker stops entering.
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,

    #[serde(default = "default_liquidation_offset_min")]
    pub session_liquidation_offset_min: i64,

    /// Session open, "HH:MM" UTC.
    #[serde(default = "default_session_open")]
    pub session_open: String,

    /// Session close, "HH:MM" UTC.
    #[serde(default = "default_session_close")]
    pub session_close: String,

    // --- Strategy ------------------------------------------------------------
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,

    #[serde(default = "default_min_buy_confidence")]
    pub min_buy_confidence: f64,

    #[serde(default)]
    pub strategy_params: StrategyParams,

    // --- Candidate filters ---------------------------------------------------
    #[serde(default = "default_min_candidate_volume")]
    pub min_candidate_volume: i64,

    #[serde(default = "default_min_candidate_turnover")]
    pub min_candidate_turnover: Decimal,

    #[serde(default = "default_candidate_price_min")]
    pub candidate_price_min: Decimal,

    #[serde(default = "default_candidate_price_max")]
    pub candidate_price_max: Decimal,

    #[serde(default = "default_quote_staleness_ms")]
    pub quote_staleness_ms: u64,

    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    // --- Recovery ------------------------------------------------------------
    #[serde(default = "default_lost_order_timeout_ms")]
    pub lost_order_timeout_ms: u64,

    // --- Store & operational surface ----------------------------------------
    /// Opaque connection string; env `DATABASE_URL`.
    #[serde(default)]
    pub database_url: String,

    /// Address of the worker's health/state HTTP endpoint.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Notifications (optional) -------------------------------------------
    #[serde(default)]
    pub slack_token: Option<String>,

    #[serde(default)]
    pub slack_channel: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl Config {
    /// Load configuration: defaults, then the optional JSON file, then the
    /// environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    TradeError::Config(format!("failed to read config {}: {e}", p.display()))
                })?;
                let parsed: Self = serde_json::from_str(&content).map_err(|e| {
                    TradeError::Config(format!("failed to parse config {}: {e}", p.display()))
                })?;
                info!(path = %p.display(), "config file loaded");
                parsed
            }
            None => Self::default(),
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the enumerated environment variables.
    fn apply_env(&mut self) -> Result<()> {
        if let Some(mode) = std::env::var("TRADING_MODE").ok().filter(|s| !s.is_empty()) {
            self.trading_mode = TradingMode::parse(&mode)
                .ok_or_else(|| TradeError::Config(format!("invalid TRADING_MODE '{mode}'")))?;
        }
        if let Ok(syms) = std::env::var("WORKER_UNIVERSE") {
            self.universe = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        override_env(&mut self.poll_interval_ms, "POLL_INTERVAL_MS")?;
        override_env(&mut self.heartbeat_interval_ms, "HEARTBEAT_INTERVAL_MS")?;
        override_env(&mut self.lock_ttl_ms, "LOCK_TTL_MS")?;
        override_env(&mut self.lock_renew_threshold_ms, "LOCK_RENEW_THRESHOLD_MS")?;
        override_env(&mut self.shutdown_deadline_ms, "SHUTDOWN_DEADLINE_MS")?;
        override_env(&mut self.rpc_timeout_ms, "RPC_TIMEOUT_MS")?;
        override_env(&mut self.rpc_max_retries, "RPC_MAX_RETRIES")?;
        override_env(&mut self.rate_limit_per_sec, "RATE_LIMIT_PER_SEC")?;
        override_env(&mut self.capital_limit_per_worker, "CAPITAL_LIMIT_PER_WORKER")?;
        override_env(&mut self.daily_loss_limit, "DAILY_LOSS_LIMIT")?;
        override_env(
            &mut self.session_liquidation_offset_min,
            "SESSION_LIQUIDATION_OFFSET_MIN",
        )?;
        override_env(&mut self.session_open, "SESSION_OPEN")?;
        override_env(&mut self.session_close, "SESSION_CLOSE")?;
        override_env(&mut self.strategy_name, "STRATEGY_NAME")?;
        override_env(&mut self.min_buy_confidence, "MIN_BUY_CONFIDENCE")?;
        override_env(&mut self.min_candidate_volume, "MIN_CANDIDATE_VOLUME")?;
        override_env(&mut self.min_candidate_turnover, "MIN_CANDIDATE_TURNOVER")?;
        override_env(&mut self.candidate_price_min, "CANDIDATE_PRICE_MIN")?;
        override_env(&mut self.candidate_price_max, "CANDIDATE_PRICE_MAX")?;
        override_env(&mut self.quote_staleness_ms, "QUOTE_STALENESS_MS")?;
        override_env(&mut self.lost_order_timeout_ms, "LOST_ORDER_TIMEOUT_MS")?;
        override_env(&mut self.database_url, "DATABASE_URL")?;
        override_env(&mut self.bind_addr, "WORKER_BIND_ADDR")?;

        if let Ok(v) = std::env::var("SLACK_BOT_TOKEN") {
            if !v.is_empty() {
                self.slack_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("SLACK_CHANNEL") {
            if !v.is_empty() {
                self.slack_channel = Some(v);
            }
        }

        override_env(&mut self.strategy_params.stop_loss_pct, "STRAT_STOP_LOSS_PCT")?;
        override_env(
            &mut self.strategy_params.take_profit_pct,
            "STRAT_TAKE_PROFIT_PCT",
        )?;
        override_env(
            &mut self.strategy_params.trend_break_pct,
            "STRAT_TREND_BREAK_PCT",
        )?;
        override_env(
            &mut self.strategy_params.max_holding_secs,
            "STRAT_MAX_HOLDING_SECS",
        )?;
        override_env(&mut self.strategy_params.min_score, "STRAT_MIN_SCORE")?;

        Ok(())
    }

    /// Fail fast on anything that would only blow up mid-session.
    fn validate(&self) -> Result<()> {
        if self.universe.is_empty() {
            return Err(TradeError::Config(
                "WORKER_UNIVERSE is empty — nothing to scan".into(),
            ));
        }
        if self.database_url.is_empty() {
            return Err(TradeError::Config("DATABASE_URL is not set".into()));
        }
        if self.lock_ttl_ms == 0 || self.heartbeat_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(TradeError::Config(
                "poll/heartbeat/lock-ttl intervals must be non-zero".into(),
            ));
        }
        if self.lock_renew_threshold_ms >= self.lock_ttl_ms {
            return Err(TradeError::Config(
                "LOCK_RENEW_THRESHOLD_MS must be below LOCK_TTL_MS".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_buy_confidence) {
            return Err(TradeError::Config(
                "MIN_BUY_CONFIDENCE must lie in [0, 1]".into(),
            ));
        }
        parse_hhmm(&self.session_open)?;
        parse_hhmm(&self.session_close)?;
        Ok(())
    }

    /// The trading session described by this config.
    pub fn session(&self) -> TradingSession {
        // Validated in `validate`; the expects cannot fire after `load`.
        TradingSession::new(
            parse_hhmm(&self.session_open).expect("validated session_open"),
            parse_hhmm(&self.session_close).expect("validated session_close"),
            self.session_liquidation_offset_min,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_ttl_ms as i64)
    }

    pub fn lock_renew_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_renew_threshold_ms as i64)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn quote_staleness(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.quote_staleness_ms as i64)
    }

    pub fn lost_order_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lost_order_timeout_ms as i64)
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn require_env(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(TradeError::Config(format!("{key} is not set"))),
    }
}

fn override_env<T>(slot: &mut T, key: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        if !raw.is_empty() {
            *slot = raw
                .parse()
                .map_err(|e| TradeError::Config(format!("invalid {key} '{raw}': {e}")))?;
        }
    }
    Ok(())
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| TradeError::Config(format!("invalid session time '{s}': {e}")))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paper);
        assert_eq!(cfg.poll_interval_ms, 5_000);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.lock_ttl_ms, 300_000);
        assert_eq!(cfg.lock_renew_threshold_ms, 100_000);
        assert_eq!(cfg.shutdown_deadline_ms, 60_000);
        assert_eq!(cfg.rpc_timeout_ms, 10_000);
        assert_eq!(cfg.rpc_max_retries, 3);
        assert_eq!(cfg.rate_limit_per_sec, 20);
        assert_eq!(cfg.session_liquidation_offset_min, 15);
        assert_eq!(cfg.strategy_name, "momentum");
        assert!((cfg.min_buy_confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "LIVE", "universe": ["AAPL", "MSFT"] }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.universe, vec!["AAPL", "MSFT"]);
        assert_eq!(cfg.max_candidates, 10);
        assert_eq!(cfg.capital_limit_per_worker, dec!(10000));
    }

    #[test]
    fn validation_rejects_empty_universe() {
        let mut cfg = Config::default();
        cfg.database_url = "postgres://localhost/meridian".into();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, TradeError::Config(_)));
    }

    #[test]
    fn validation_rejects_renew_threshold_above_ttl() {
        let mut cfg = Config::default();
        cfg.universe = vec!["AAPL".into()];
        cfg.database_url = "postgres://localhost/meridian".into();
        cfg.lock_renew_threshold_ms = cfg.lock_ttl_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_built_from_strings() {
        let mut cfg = Config::default();
        cfg.session_open = "08:30".into();
        cfg.session_close = "16:00".into();
        cfg.session_liquidation_offset_min = 10;
        let s = cfg.session();
        assert_eq!(s.open, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(s.close, NaiveTime::from_hms_opt(16, 0, 0).unwrap());
        assert_eq!(s.liquidation_offset_min, 10);
    }

    #[test]
    fn round_trip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.poll_interval_ms, cfg2.poll_interval_ms);
        assert_eq!(cfg.capital_limit_per_worker, cfg2.capital_limit_per_worker);
        assert_eq!(cfg.strategy_name, cfg2.strategy_name);
    }
}
