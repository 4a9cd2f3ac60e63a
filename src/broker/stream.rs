// =============================================================================
// Broker WebSocket Streams — quote ticks and execution reports
// =============================================================================
//
// Each stream runs until shutdown is signalled: connect, subscribe, pump
// messages into the channel, and on any disconnect reconnect with jittered
// backoff and re-subscribe the original symbol set. A full channel drops the
// oldest semantics to the consumer (send awaits); callbacks never block the
// socket task beyond that.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::broker::{ExecutionEvent, QuoteEvent};
use crate::error::{jitter, Result, TradeError};
use crate::types::Side;

/// Delay before the first reconnect attempt; doubles up to the cap.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Quote stream
// ---------------------------------------------------------------------------

/// Stream quote ticks for `symbols` into `tx` until shutdown. Reconnects
/// forever; a single failed session is logged, never fatal.
pub async fn run_quote_stream(
    ws_url: &str,
    access_token: &str,
    symbols: &[String],
    tx: mpsc::Sender<QuoteEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let subscribe = serde_json::json!({
        "op": "subscribe",
        "channel": "quotes",
        "token": access_token,
        "symbols": symbols,
    });

    let mut delay = RECONNECT_BASE;
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match pump_session(ws_url, &subscribe, &tx, &mut shutdown, parse_quote_event).await {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::Disconnected) => {
                warn!(url = %ws_url, "quote stream ended — reconnecting");
                delay = RECONNECT_BASE;
            }
            Err(e) => {
                error!(url = %ws_url, error = %e, "quote stream error — reconnecting");
            }
        }

        let wait = jitter(delay);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {}
        }
        delay = (delay * 2).min(RECONNECT_CAP);
    }
}

// ---------------------------------------------------------------------------
// Execution stream
// ---------------------------------------------------------------------------

/// Stream execution reports into `tx` until shutdown. The broker may replay
/// reports after a reconnect; consumers dedup on `broker_fill_id`.
pub async fn run_execution_stream(
    ws_url: &str,
    access_token: &str,
    tx: mpsc::Sender<ExecutionEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let subscribe = serde_json::json!({
        "op": "subscribe",
        "channel": "executions",
        "token": access_token,
    });

    let mut delay = RECONNECT_BASE;
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match pump_session(ws_url, &subscribe, &tx, &mut shutdown, parse_execution_event).await {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::Disconnected) => {
                warn!(url = %ws_url, "execution stream ended — reconnecting");
                delay = RECONNECT_BASE;
            }
            Err(e) => {
                error!(url = %ws_url, error = %e, "execution stream error — reconnecting");
            }
        }

        let wait = jitter(delay);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {}
        }
        delay = (delay * 2).min(RECONNECT_CAP);
    }
}

// ---------------------------------------------------------------------------
// Session plumbing
// ---------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Connect, send the subscribe frame, and pump messages through `parse` into
/// the channel until the socket drops or shutdown fires.
async fn pump_session<T>(
    ws_url: &str,
    subscribe: &serde_json::Value,
    tx: &mpsc::Sender<T>,
    shutdown: &mut watch::Receiver<bool>,
    parse: fn(&str) -> Result<Option<T>>,
) -> Result<SessionEnd> {
    info!(url = %ws_url, "connecting broker stream");

    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .map_err(|e| TradeError::TransientBroker(format!("websocket connect failed: {e}")))?;

    let (mut write, mut read) = ws_stream.split();
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| TradeError::TransientBroker(format!("subscribe frame failed: {e}")))?;

    info!(url = %ws_url, "broker stream connected and subscribed");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(SessionEnd::Shutdown);
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse(&text) {
                    Ok(Some(event)) => {
                        if tx.send(event).await.is_err() {
                            // Consumer gone — treat as shutdown.
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                    Ok(None) => {} // heartbeat / ack frame
                    Err(e) => warn!(error = %e, "unparseable stream frame dropped"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(TradeError::TransientBroker(format!("stream read error: {e}")))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct QuoteFrame {
    #[serde(rename = "type")]
    kind: String,
    symbol: String,
    price: Decimal,
    #[serde(default)]
    volume: i64,
    at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ExecutionFrame {
    #[serde(rename = "type")]
    kind: String,
    fill_id: String,
    order_id: String,
    symbol: String,
    side: String,
    qty: i64,
    price: Decimal,
    fill_time: DateTime<Utc>,
}

fn parse_quote_event(text: &str) -> Result<Option<QuoteEvent>> {
    // Non-quote frames (acks, heartbeats) are silently skipped.
    let frame: QuoteFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => return Ok(None),
    };
    if frame.kind != "quote" {
        return Ok(None);
    }
    Ok(Some(QuoteEvent {
        symbol: frame.symbol,
        price: frame.price,
        volume: frame.volume,
        at: frame.at,
    }))
}

fn parse_execution_event(text: &str) -> Result<Option<ExecutionEvent>> {
    let frame: ExecutionFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => return Ok(None),
    };
    if frame.kind != "execution" {
        return Ok(None);
    }
    let side = Side::parse(&frame.side).ok_or_else(|| {
        TradeError::TransientBroker(format!("execution frame with unknown side '{}'", frame.side))
    })?;
    Ok(Some(ExecutionEvent {
        broker_fill_id: frame.fill_id,
        broker_order_id: frame.order_id,
        symbol: frame.symbol,
        side,
        qty: frame.qty,
        price: frame.price,
        fill_time: frame.fill_time,
    }))
}
