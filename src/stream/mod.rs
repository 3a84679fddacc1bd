use crate::models::StreamEvent;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const KRAKEN_WS_URL: &str = "wss://ws.kraken.com/";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Idle window after which we probe the connection with a ping.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(20);

/// Live tick subscription for one pair.
///
/// Subscribes to the `trade` and `ticker` channels and forwards typed
/// [`StreamEvent`]s over an mpsc channel to a single consumer. On any
/// connection failure it reconnects after a fixed delay, indefinitely,
/// until the stop signal flips. Malformed messages are dropped silently;
/// status/heartbeat messages are surfaced but never as price data.
pub struct TickStream {
    url: String,
    ws_pair: String,
    events: mpsc::Sender<StreamEvent>,
    stop: watch::Receiver<bool>,
}

impl TickStream {
    pub fn new(pair: &str, events: mpsc::Sender<StreamEvent>, stop: watch::Receiver<bool>) -> Self {
        Self::with_url(KRAKEN_WS_URL, pair, events, stop)
    }

    /// Point the stream at a different endpoint (used by tests).
    pub fn with_url(
        url: &str,
        pair: &str,
        events: mpsc::Sender<StreamEvent>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            url: url.to_string(),
            ws_pair: normalize_ws_pair(pair),
            events,
            stop,
        }
    }

    /// Run until stopped. Each connection failure is reported as a status
    /// event and followed by a reconnect.
    pub async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                break;
            }

            match self.connect_and_listen().await {
                Ok(()) => break, // stop observed inside the session
                Err(e) => {
                    tracing::warn!("websocket session ended: {e}, reconnecting in {RECONNECT_DELAY:?}");
                    let _ = self
                        .events
                        .send(StreamEvent::Status(format!("ws error: {e}")))
                        .await;
                }
            }

            // Sleep through the reconnect delay, but wake early on stop.
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = self.stop.changed() => {}
            }
        }

        tracing::info!("tick stream stopped");
    }

    async fn connect_and_listen(&mut self) -> anyhow::Result<()> {
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url))
            .await
            .map_err(|_| anyhow::anyhow!("connect timeout"))??;
        let (mut sender, mut receiver) = ws.split();

        let _ = self.events.send(StreamEvent::Status("ws open".to_string())).await;

        for channel in ["trade", "ticker"] {
            let subscription = json!({
                "event": "subscribe",
                "pair": [self.ws_pair],
                "subscription": { "name": channel }
            });
            sender.send(Message::Text(subscription.to_string())).await?;
        }

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    if *self.stop.borrow() {
                        let _ = sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                received = tokio::time::timeout(MESSAGE_TIMEOUT, receiver.next()) => {
                    match received {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            for event in parse_message(&text) {
                                if self.events.send(event).await.is_err() {
                                    // Consumer gone; treat like a stop.
                                    return Ok(());
                                }
                            }
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            sender.send(Message::Pong(payload)).await?;
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            anyhow::bail!("closed by remote");
                        }
                        Ok(Some(Ok(_))) => {} // binary/pong: ignore
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(None) => anyhow::bail!("stream ended"),
                        Err(_) => {
                            // Idle too long: keepalive probe. A dead
                            // connection fails here and triggers reconnect.
                            sender.send(Message::Ping(Vec::new())).await?;
                        }
                    }
                }
            }
        }
    }
}

/// Kraken WS pair notation, e.g. "XRPUSD" -> "XRP/USD".
fn normalize_ws_pair(pair: &str) -> String {
    if pair.contains('/') || pair.len() <= 3 {
        pair.to_string()
    } else {
        format!("{}/{}", &pair[..pair.len() - 3], &pair[pair.len() - 3..])
    }
}

/// Decode one raw WS message into zero or more events.
///
/// Channel data arrives as arrays `[channelID, payload, channelName, pair]`;
/// control messages are objects with an `event` field. Anything else is
/// dropped.
fn parse_message(text: &str) -> Vec<StreamEvent> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };

    if let Some(event) = value.get("event").and_then(Value::as_str) {
        let status = match event {
            "subscriptionStatus" => {
                let channel = value
                    .get("subscription")
                    .and_then(|s| s.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("?");
                let state = value.get("status").and_then(Value::as_str).unwrap_or("?");
                let pair = value.get("pair").and_then(Value::as_str).unwrap_or("");
                format!("ws {channel} {state} {pair}")
            }
            other => format!("ws {other}"),
        };
        return vec![StreamEvent::Status(status)];
    }

    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    if items.len() < 4 {
        return Vec::new();
    }

    match items[2].as_str() {
        Some("trade") => items[1]
            .as_array()
            .map(|trades| trades.iter().filter_map(trade_event).collect())
            .unwrap_or_default(),
        Some("ticker") => ticker_event(&items[1]).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Trade payload entry: `[price, volume, time, side, orderType, misc]`.
fn trade_event(entry: &Value) -> Option<StreamEvent> {
    let fields = entry.as_array()?;
    let price = fields.first().and_then(parse_number)?;
    let secs = fields.get(2).and_then(parse_number)?;
    let time = DateTime::from_timestamp_millis((secs * 1000.0) as i64)?;
    Some(StreamEvent::Trade { price, time })
}

/// Ticker payload: `{"a": [ask, ..], "b": [bid, ..], "c": [last, ..], ..}`.
fn ticker_event(payload: &Value) -> Option<StreamEvent> {
    let first = |key: &str| payload.get(key)?.get(0).and_then(parse_number);
    Some(StreamEvent::Ticker {
        bid: first("b")?,
        ask: first("a")?,
        last: first("c")?,
        time: Utc::now(),
    })
}

fn parse_number(v: &Value) -> Option<f64> {
    v.as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| v.as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ws_pair() {
        assert_eq!(normalize_ws_pair("XRPUSD"), "XRP/USD");
        assert_eq!(normalize_ws_pair("XBT/USD"), "XBT/USD");
        assert_eq!(normalize_ws_pair("BTC"), "BTC");
    }

    #[test]
    fn test_parse_trade_message() {
        let msg = r#"[337,[["1.0451","250.0","1700000042.123456","b","l",""],["1.0453","10.0","1700000043.5","s","m",""]],"trade","XRP/USD"]"#;
        let events = parse_message(msg);
        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::Trade { price, time } => {
                assert_eq!(*price, 1.0451);
                assert_eq!(time.timestamp(), 1700000042);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ticker_message() {
        let msg = r#"[340,{"a":["1.0460",100,"100.0"],"b":["1.0440",50,"50.0"],"c":["1.0451","42.0"]},"ticker","XRP/USD"]"#;
        let events = parse_message(msg);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Ticker { bid, ask, last, .. } => {
                assert_eq!(*bid, 1.0440);
                assert_eq!(*ask, 1.0460);
                assert_eq!(*last, 1.0451);
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_subscription_status() {
        let msg = r#"{"event":"subscriptionStatus","channelName":"trade","pair":"XRP/USD","status":"subscribed","subscription":{"name":"trade"}}"#;
        let events = parse_message(msg);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Status(s) => assert_eq!(s, "ws trade subscribed XRP/USD"),
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_heartbeat_surfaced_as_status() {
        let events = parse_message(r#"{"event":"heartbeat"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Status(s) if s == "ws heartbeat"));
    }

    #[test]
    fn test_malformed_messages_dropped() {
        assert!(parse_message("not json").is_empty());
        assert!(parse_message("[1,2]").is_empty());
        assert!(parse_message(r#"[1,{},"book","XRP/USD"]"#).is_empty());
        assert!(parse_message(r#"[1,[["bad"]],"trade","XRP/USD"]"#).is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_when_stop_already_set() {
        let (_stop_tx, stop_rx) = watch::channel(true);
        let (tx, _rx) = mpsc::channel(4);
        let stream = TickStream::with_url("ws://127.0.0.1:9", "XRPUSD", tx, stop_rx);

        // No connection attempt should be needed to observe the signal.
        tokio::time::timeout(Duration::from_secs(1), stream.run())
            .await
            .expect("run did not observe the stop signal");
    }

    #[tokio::test]
    async fn test_run_stops_during_reconnect_backoff() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, _rx) = mpsc::channel(8);
        // Nothing listens here, so every connect fails and the stream
        // sits in its reconnect delay.
        let stream = TickStream::with_url("ws://127.0.0.1:9", "XRPUSD", tx, stop_rx);
        let handle = tokio::spawn(stream.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        // Stopping again is harmless.
        stop_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("stream did not stop after the signal")
            .unwrap();
    }
}
