// =============================================================================
// REST Broker Adapter — bearer auth + HMAC-SHA256 signed order requests
// =============================================================================
//
// SECURITY: the app secret is never logged or serialized. It is used only to
// sign order-mutating request bodies; the signature travels in the
// `X-Signature` header alongside the app key.
//
// The adapter owns three responsibilities the core never sees:
//   - token refresh (401 triggers one forced refresh + replay),
//   - transient retry with the shared backoff schedule,
//   - rate limiting (every RPC takes a token-bucket permit first).
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};

use crate::broker::rate_limit::RateLimiter;
use crate::broker::{
    stream, BrokerOrder, BrokerPort, BrokerPosition, ExecutionEvent, OrderRequest, Quote,
    QuoteEvent, Token,
};
use crate::config::{Config, Credentials};
use crate::error::{retry_transient, Backoff, Result, TradeError};
use crate::types::{OrderStatus, OrderType, Side, TradingMode};

type HmacSha256 = Hmac<Sha256>;

/// Paper-trading REST endpoint.
const PAPER_BASE_URL: &str = "https://paperapi.meridian-broker.com";
/// Live REST endpoint.
const LIVE_BASE_URL: &str = "https://api.meridian-broker.com";
/// Paper-trading stream endpoint.
const PAPER_WS_URL: &str = "wss://paperstream.meridian-broker.com/v1/stream";
/// Live stream endpoint.
const LIVE_WS_URL: &str = "wss://stream.meridian-broker.com/v1/stream";

/// Refresh the token this long before its stated expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// REST/WebSocket broker adapter implementing [`BrokerPort`].
pub struct RestBroker {
    creds: Credentials,
    base_url: String,
    ws_url: String,
    http: reqwest::Client,
    token: tokio::sync::Mutex<Option<Token>>,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
}

impl RestBroker {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Build an adapter for the configured trading mode. The underlying HTTP
    /// client carries the per-RPC timeout; retries happen above it.
    pub fn new(config: &Config, creds: Credentials, limiter: Arc<RateLimiter>) -> Result<Self> {
        let (base_url, ws_url) = match config.trading_mode {
            TradingMode::Paper => (PAPER_BASE_URL, PAPER_WS_URL),
            TradingMode::Live => (LIVE_BASE_URL, LIVE_WS_URL),
        };

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&creds.app_key) {
            default_headers.insert("X-App-Key", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(config.rpc_timeout())
            .build()
            .map_err(|e| TradeError::Config(format!("failed to build http client: {e}")))?;

        debug!(mode = %config.trading_mode, base_url, "RestBroker initialised");

        Ok(Self {
            creds,
            base_url: base_url.to_string(),
            ws_url: ws_url.to_string(),
            http,
            token: tokio::sync::Mutex::new(None),
            limiter,
            max_retries: config.rpc_max_retries,
        })
    }

    // -------------------------------------------------------------------------
    // Signing & auth
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of a request body.
    fn sign(&self, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.app_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Return a cached token if it is still comfortably valid, otherwise
    /// fetch a fresh one.
    async fn current_token(&self) -> Result<Token> {
        let mut slot = self.token.lock().await;
        if let Some(tok) = slot.as_ref() {
            let margin = Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);
            if tok.expires_at - margin > Utc::now() {
                return Ok(tok.clone());
            }
        }
        let fresh = self.fetch_token().await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop the cached token so the next call is forced to re-authenticate.
    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }

    async fn fetch_token(&self) -> Result<Token> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        self.limiter.acquire().await;

        let url = format!("{}/oauth2/token", self.base_url);
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "app_key": self.creds.app_key,
            "app_secret": self.creds.app_secret,
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TradeError::Auth(format!(
                "token endpoint returned {status}: {text}"
            )));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| TradeError::Auth(format!("failed to parse token response: {e}")))?;

        debug!(expires_in = parsed.expires_in, "broker token refreshed");

        Ok(Token {
            access_token: parsed.access_token,
            expires_at: Utc::now() + Duration::seconds(parsed.expires_in),
        })
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Issue one authenticated request. A 401 forces a single token refresh
    /// and replay before surfacing `AuthError`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        idempotency_key: Option<&str>,
    ) -> Result<serde_json::Value> {
        self.limiter.acquire().await;

        let mut refreshed = false;
        loop {
            let token = self.current_token().await?;
            let url = format!("{}{}", self.base_url, path);

            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token.access_token);

            if let Some(b) = body {
                let raw = b.to_string();
                req = req
                    .header("X-Signature", self.sign(&raw))
                    .header("Content-Type", "application/json")
                    .body(raw);
            }
            if let Some(key) = idempotency_key {
                req = req.header("X-Idempotency-Key", key);
            }

            let resp = req.send().await.map_err(map_reqwest_error)?;
            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                warn!(path, "401 from broker — refreshing token and replaying once");
                self.invalidate_token().await;
                refreshed = true;
                continue;
            }

            let text = resp.text().await.map_err(map_reqwest_error)?;
            return match status {
                s if s.is_success() => {
                    if text.is_empty() {
                        Ok(serde_json::Value::Null)
                    } else {
                        serde_json::from_str(&text).map_err(|e| {
                            TradeError::TransientBroker(format!(
                                "unparseable broker response from {path}: {e}"
                            ))
                        })
                    }
                }
                StatusCode::UNAUTHORIZED => {
                    Err(TradeError::Auth(format!("{path} returned 401: {text}")))
                }
                StatusCode::TOO_MANY_REQUESTS => Err(TradeError::TransientBroker(format!(
                    "{path} rate-limited: {text}"
                ))),
                s if s.is_server_error() => Err(TradeError::TransientBroker(format!(
                    "{path} returned {s}: {text}"
                ))),
                s => Err(TradeError::BrokerReject(format!(
                    "{path} returned {s}: {text}"
                ))),
            };
        }
    }

    /// Request with the shared transient-retry schedule on top.
    async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        idempotency_key: Option<String>,
    ) -> Result<serde_json::Value> {
        let backoff = Backoff::new(
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(30),
            self.max_retries,
        );
        retry_transient(backoff, || {
            self.request(
                method.clone(),
                path,
                body.as_ref(),
                idempotency_key.as_deref(),
            )
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OrderRow {
    order_id: String,
    symbol: String,
    side: String,
    order_type: String,
    qty: i64,
    #[serde(default)]
    filled_qty: i64,
    #[serde(default)]
    price: Option<Decimal>,
    status: String,
}

#[derive(Deserialize)]
struct PositionRow {
    symbol: String,
    qty: i64,
    avg_price: Decimal,
}

#[derive(Deserialize)]
struct QuoteRow {
    symbol: String,
    price: Decimal,
    volume: i64,
    #[serde(default)]
    turnover: Decimal,
    as_of: DateTime<Utc>,
}

fn parse_broker_order(row: OrderRow) -> Result<BrokerOrder> {
    let side = Side::parse(&row.side)
        .ok_or_else(|| TradeError::TransientBroker(format!("unknown side '{}'", row.side)))?;
    let order_type = OrderType::parse(&row.order_type).ok_or_else(|| {
        TradeError::TransientBroker(format!("unknown order type '{}'", row.order_type))
    })?;
    let status = OrderStatus::parse(&row.status)
        .ok_or_else(|| TradeError::TransientBroker(format!("unknown status '{}'", row.status)))?;
    Ok(BrokerOrder {
        broker_order_id: row.order_id,
        symbol: row.symbol,
        side,
        order_type,
        qty: row.qty,
        filled_qty: row.filled_qty,
        price: row.price,
        status,
    })
}

/// Map reqwest transport failures into the taxonomy. Timeouts and connection
/// problems are transient; anything else at this layer is too.
fn map_reqwest_error(e: reqwest::Error) -> TradeError {
    TradeError::TransientBroker(format!("http transport error: {e}"))
}

// ---------------------------------------------------------------------------
// BrokerPort implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl BrokerPort for RestBroker {
    #[instrument(skip(self), name = "broker::authenticate")]
    async fn authenticate(&self) -> Result<Token> {
        self.current_token().await
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side), name = "broker::place_order")]
    async fn place_order(&self, req: &OrderRequest) -> Result<String> {
        let mut body = serde_json::json!({
            "account_id": req.account_id,
            "symbol": req.symbol,
            "side": req.side.as_str(),
            "order_type": req.order_type.as_str(),
            "qty": req.qty,
        });
        if let Some(price) = req.price {
            body["price"] = serde_json::json!(price);
        }

        let resp = self
            .request_with_retry(
                Method::POST,
                "/v1/orders",
                Some(body),
                Some(req.idempotency_key.clone()),
            )
            .await?;

        let order_id = resp
            .get("order_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                TradeError::TransientBroker("placement response missing order_id".into())
            })?;

        debug!(broker_order_id = order_id, "order placed");
        Ok(order_id.to_string())
    }

    #[instrument(skip(self), name = "broker::cancel_order")]
    async fn cancel_order(&self, broker_order_id: &str, account_id: &str) -> Result<bool> {
        let path = format!("/v1/orders/{broker_order_id}?account_id={account_id}");
        match self
            .request_with_retry(Method::DELETE, &path, None, None)
            .await
        {
            Ok(resp) => Ok(resp
                .get("accepted")
                .and_then(|v| v.as_bool())
                .unwrap_or(true)),
            // An explicit reject here means the broker refused the cancel
            // (usually already terminal) — not an infrastructure fault.
            Err(TradeError::BrokerReject(reason)) => {
                warn!(broker_order_id, reason, "cancel not accepted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "broker::get_orders")]
    async fn get_orders(&self, account_id: &str) -> Result<Vec<BrokerOrder>> {
        let path = format!("/v1/accounts/{account_id}/orders");
        let resp = self.request_with_retry(Method::GET, &path, None, None).await?;
        let rows: Vec<OrderRow> = serde_json::from_value(resp)
            .map_err(|e| TradeError::TransientBroker(format!("bad orders payload: {e}")))?;
        rows.into_iter().map(parse_broker_order).collect()
    }

    #[instrument(skip(self), name = "broker::get_cash")]
    async fn get_cash(&self, account_id: &str) -> Result<Decimal> {
        let path = format!("/v1/accounts/{account_id}/cash");
        let resp = self.request_with_retry(Method::GET, &path, None, None).await?;
        resp.get("cash")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .or_else(|| {
                resp.get("cash")
                    .and_then(|v| v.as_f64())
                    .and_then(Decimal::from_f64_retain)
            })
            .ok_or_else(|| TradeError::TransientBroker("cash payload missing 'cash'".into()))
    }

    #[instrument(skip(self), name = "broker::get_positions")]
    async fn get_positions(&self, account_id: &str) -> Result<Vec<BrokerPosition>> {
        let path = format!("/v1/accounts/{account_id}/positions");
        let resp = self.request_with_retry(Method::GET, &path, None, None).await?;
        let rows: Vec<PositionRow> = serde_json::from_value(resp)
            .map_err(|e| TradeError::TransientBroker(format!("bad positions payload: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|r| BrokerPosition {
                symbol: r.symbol,
                qty: r.qty,
                avg_price: r.avg_price,
            })
            .collect())
    }

    #[instrument(skip(self, symbols), fields(count = symbols.len()), name = "broker::get_quotes")]
    async fn get_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("/v1/quotes?symbols={}", symbols.join(","));
        let resp = self.request_with_retry(Method::GET, &path, None, None).await?;
        let rows: Vec<QuoteRow> = serde_json::from_value(resp)
            .map_err(|e| TradeError::TransientBroker(format!("bad quotes payload: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|r| Quote {
                symbol: r.symbol,
                price: r.price,
                volume: r.volume,
                turnover: r.turnover,
                as_of: r.as_of,
            })
            .collect())
    }

    async fn subscribe_quotes(
        &self,
        symbols: &[String],
        tx: mpsc::Sender<QuoteEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let token = self.current_token().await?;
        stream::run_quote_stream(&self.ws_url, &token.access_token, symbols, tx, shutdown).await
    }

    async fn subscribe_executions(
        &self,
        tx: mpsc::Sender<ExecutionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let token = self.current_token().await?;
        stream::run_execution_stream(&self.ws_url, &token.access_token, tx, shutdown).await
    }
}

impl std::fmt::Debug for RestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBroker")
            .field("base_url", &self.base_url)
            .field("creds", &self.creds)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_order_row_parses() {
        let row = OrderRow {
            order_id: "BO1".into(),
            symbol: "AAPL".into(),
            side: "BUY".into(),
            order_type: "LIMIT".into(),
            qty: 10,
            filled_qty: 4,
            price: Some(Decimal::new(1_000_000, 4)),
            status: "PARTIAL".into(),
        };
        let order = parse_broker_order(row).unwrap();
        assert_eq!(order.broker_order_id, "BO1");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.status, OrderStatus::Partial);
        assert_eq!(order.filled_qty, 4);
    }

    #[test]
    fn unknown_status_is_surfaced() {
        let row = OrderRow {
            order_id: "BO2".into(),
            symbol: "AAPL".into(),
            side: "BUY".into(),
            order_type: "MARKET".into(),
            qty: 1,
            filled_qty: 0,
            price: None,
            status: "LIMBO".into(),
        };
        assert!(parse_broker_order(row).is_err());
    }
}
