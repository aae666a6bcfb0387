//! Bybit v5 private websocket: authenticates, subscribes to the master's
//! position, execution and order topics, and parses frames into
//! [`StreamEvent`]s.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, ConnectorResult};
use crate::models::{ApiCredentials, MasterExecution, Position, Side};

use super::bybit_client::{parse_decimal, sign};
use super::types::{OrderUpdate, StreamEvent};
use super::{EventReceiver, StreamSource};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PRIVATE_TOPICS: [&str; 3] = ["position", "execution", "order"];
const EVENT_BUFFER: usize = 1024;

/// Opens private streams against a Bybit websocket endpoint.
pub struct BybitStreamSource {
    ws_url: String,
    ping_interval: Duration,
}

impl BybitStreamSource {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ping_interval: Duration::from_secs(20),
        }
    }
}

#[async_trait]
impl StreamSource for BybitStreamSource {
    async fn connect(&self, credentials: &ApiCredentials) -> ConnectorResult<EventReceiver> {
        let socket = connect_private(&self.ws_url, credentials).await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run_private_loop(socket, tx, self.ping_interval));
        Ok(rx)
    }
}

async fn connect_private(
    base_url: &str,
    credentials: &ApiCredentials,
) -> ConnectorResult<WsStream> {
    let endpoint = format!("{}/v5/private", base_url.trim_end_matches('/'));
    let (mut socket, _) = connect_async(endpoint.as_str())
        .await
        .map_err(|e| ConnectorError::Transport(e.to_string()))?;

    let expires = (Utc::now() + chrono::Duration::seconds(10)).timestamp_millis();
    let signature = sign(&credentials.api_secret, &format!("GET/realtime{}", expires))?;
    let auth = json!({
        "op": "auth",
        "args": [credentials.api_key, expires, signature],
    });
    send_text(&mut socket, auth.to_string()).await?;

    match socket.next().await {
        Some(Ok(Message::Text(text))) => {
            let value: Value = serde_json::from_str(&text)?;
            if !value.get("success").and_then(Value::as_bool).unwrap_or(false) {
                let reason = value
                    .get("ret_msg")
                    .and_then(Value::as_str)
                    .unwrap_or("auth rejected")
                    .to_string();
                return Err(ConnectorError::Credential(reason));
            }
        }
        Some(Ok(other)) => {
            return Err(ConnectorError::Decode(format!("unexpected auth reply: {:?}", other)));
        }
        Some(Err(e)) => return Err(ConnectorError::Transport(e.to_string())),
        None => return Err(ConnectorError::Transport("socket closed during auth".to_string())),
    }
    info!("Private websocket authenticated");

    let subscribe = json!({ "op": "subscribe", "args": PRIVATE_TOPICS });
    send_text(&mut socket, subscribe.to_string()).await?;
    info!(topics = ?PRIVATE_TOPICS, "Subscribed to private channels");

    Ok(socket)
}

async fn send_text(socket: &mut WsStream, text: String) -> ConnectorResult<()> {
    socket
        .send(Message::Text(text))
        .await
        .map_err(|e| ConnectorError::Transport(e.to_string()))
}

/// Pump frames into `tx` until the socket ends or the receiver is dropped.
async fn run_private_loop(
    mut socket: WsStream,
    tx: mpsc::Sender<ConnectorResult<StreamEvent>>,
    ping_every: Duration,
) {
    let mut heartbeat = interval(ping_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!("Stream receiver dropped, closing socket");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = socket.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Ignoring non UTF-8 frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Private stream closed by server");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ConnectorError::Transport(e.to_string()))).await;
                        break;
                    }
                    None => break,
                };

                let events = match parse_frame(&text) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed frame");
                        continue;
                    }
                };
                for event in events {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = send_text(&mut socket, json!({ "op": "ping" }).to_string()).await {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    }
}

/// Parse one websocket frame. Control frames (pong, acks) yield nothing.
pub(crate) fn parse_frame(text: &str) -> ConnectorResult<Vec<StreamEvent>> {
    let frame: Frame = serde_json::from_str(text)?;
    let Some(topic) = frame.topic else {
        if let Some(op) = frame.op {
            debug!(op, "Control frame");
        }
        return Ok(Vec::new());
    };

    let mut events = Vec::new();
    match topic.as_str() {
        "execution" => {
            for raw in serde_json::from_value::<Vec<RawExecution>>(frame.data)? {
                // Funding and settlement rows are not trades
                if !raw.exec_type.is_empty() && raw.exec_type != "Trade" {
                    continue;
                }
                events.push(StreamEvent::Execution(MasterExecution {
                    exec_id: raw.exec_id,
                    order_id: raw.order_id,
                    side: parse_side(&raw.side)?,
                    exec_qty: parse_decimal(&raw.exec_qty)?,
                    exec_price: parse_decimal(&raw.exec_price)?,
                    closed_size: parse_decimal(&raw.closed_size)?,
                    exec_time: parse_millis(&raw.exec_time),
                    symbol: raw.symbol,
                }));
            }
        }
        "position" => {
            for raw in serde_json::from_value::<Vec<RawPosition>>(frame.data)? {
                let size = parse_decimal(&raw.size)?;
                // A flat position is reported with side "" or "None"
                let side = match Side::from_str(&raw.side) {
                    Ok(side) => side,
                    Err(_) if size.is_zero() => Side::Buy,
                    Err(e) => return Err(ConnectorError::Decode(e.to_string())),
                };
                events.push(StreamEvent::Position(Position {
                    symbol: raw.symbol,
                    side,
                    size,
                    entry_price: parse_decimal(&raw.entry_price)?,
                    mark_price: parse_decimal(&raw.mark_price)?,
                }));
            }
        }
        "order" => {
            for raw in serde_json::from_value::<Vec<RawOrder>>(frame.data)? {
                events.push(StreamEvent::Order(OrderUpdate {
                    side: parse_side(&raw.side)?,
                    quantity: parse_decimal(&raw.qty)?,
                    symbol: raw.symbol,
                    order_id: raw.order_id,
                    status: raw.order_status,
                }));
            }
        }
        other => debug!(topic = other, "Ignoring topic"),
    }
    Ok(events)
}

fn parse_side(value: &str) -> ConnectorResult<Side> {
    Side::from_str(value).map_err(|e| ConnectorError::Decode(e.to_string()))
}

fn parse_millis(value: &str) -> DateTime<Utc> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

#[derive(Deserialize)]
struct Frame {
    topic: Option<String>,
    op: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExecution {
    symbol: String,
    side: String,
    exec_id: String,
    order_id: String,
    exec_qty: String,
    exec_price: String,
    #[serde(default)]
    closed_size: String,
    #[serde(default)]
    exec_time: String,
    #[serde(default)]
    exec_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    #[serde(default)]
    side: String,
    size: String,
    #[serde(default)]
    entry_price: String,
    #[serde(default)]
    mark_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    symbol: String,
    order_id: String,
    order_status: String,
    side: String,
    qty: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_execution_frame() {
        let text = r#"{"topic":"execution","creationTime":1,"data":[
            {"category":"linear","symbol":"BTCUSDT","side":"Buy","execId":"e-1","orderId":"o-1",
             "execQty":"1","execPrice":"60000","closedSize":"0","execTime":"1700000000000",
             "execType":"Trade"},
            {"category":"linear","symbol":"BTCUSDT","side":"Sell","execId":"f-1","orderId":"",
             "execQty":"1","execPrice":"60000","closedSize":"","execTime":"1700000000000",
             "execType":"Funding"}
        ]}"#;

        let events = parse_frame(text).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Execution(exec) => {
                assert_eq!(exec.exec_id, "e-1");
                assert_eq!(exec.side, Side::Buy);
                assert_eq!(exec.exec_qty, dec!(1));
                assert_eq!(exec.exec_price, dec!(60000));
                assert_eq!(exec.exec_time.timestamp_millis(), 1_700_000_000_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_flat_position() {
        let text = r#"{"topic":"position","data":[
            {"symbol":"ETHUSDT","side":"","size":"0","entryPrice":"0","markPrice":"3000"}
        ]}"#;
        let events = parse_frame(text).unwrap();
        match &events[0] {
            StreamEvent::Position(p) => {
                assert!(p.is_closed());
                assert_eq!(p.symbol, "ETHUSDT");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_order_frame() {
        let text = r#"{"topic":"order","data":[
            {"symbol":"SOLUSDT","orderId":"o-9","orderStatus":"Filled","side":"Sell","qty":"12.5"}
        ]}"#;
        let events = parse_frame(text).unwrap();
        match &events[0] {
            StreamEvent::Order(o) => {
                assert_eq!(o.status, "Filled");
                assert_eq!(o.quantity, dec!(12.5));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_control_frames_yield_nothing() {
        assert!(parse_frame(r#"{"op":"pong","success":true}"#).unwrap().is_empty());
        assert!(parse_frame(r#"{"op":"subscribe","success":true,"conn_id":"x"}"#)
            .unwrap()
            .is_empty());
        assert!(parse_frame("not json").is_err());
    }
}
