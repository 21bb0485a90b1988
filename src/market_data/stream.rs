// =============================================================================
// Public WebSocket Client — one connection per contract category
// =============================================================================
//
// Lifecycle per connection:
//   DISCONNECTED -> CONNECTING -> OPEN -> SUBSCRIBED, DEGRADED on error/close
//
// On open one subscribe frame lists tickers.S, publicTrade.S and
// orderbook.1.S for every symbol of the category. Incoming frames are routed
// by topic prefix: tickers merge into the shared TickerStore under the
// null-preserving rule, trades and orderbook frames are forwarded raw on the
// tick bus. Nothing in the read loop blocks for more than the store mutex.
//
// Reconnects back off through [1, 2, 5, 10, 30] seconds; the index resets
// after a successful open. Failed subscription responses are logged and left
// un-ready until the next reconnect re-sends the full frame.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::bus::{TickBus, TickEvent, TickKind};
use crate::bybit::client::parse_opt_f64;
use crate::bybit::ws_public_url;
use crate::bybit::MarketDataClient;
use crate::market_data::{InstantTicker, TickerStore};
use crate::metrics::MetricsRegistry;
use crate::types::Category;

/// Reconnect backoff schedule in seconds, capped at the last entry.
const RECONNECT_DELAYS: [u64; 5] = [1, 2, 5, 10, 30];
/// Protocol ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Heartbeat log cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Open,
    Subscribed,
    Degraded,
}

/// One public streaming connection for a category.
pub struct PublicWsClient {
    category: Category,
    url: String,
    symbols: RwLock<Vec<String>>,
    store: Arc<TickerStore>,
    bus: Arc<TickBus>,
    metrics: Arc<MetricsRegistry>,

    state: Mutex<ConnState>,
    running: std::sync::atomic::AtomicBool,
    outbound: Mutex<Option<UnboundedSender<Message>>>,
    delay_index: AtomicUsize,

    // Heartbeat counter, reset after each emission.
    message_count: AtomicU64,

    // Per-topic last-message instants for the inactivity watchdog.
    last_msg_by_topic: Mutex<HashMap<String, Instant>>,
    debug_ws: bool,
    inactivity_threshold: Duration,
}

impl PublicWsClient {
    pub fn new(
        category: Category,
        symbols: Vec<String>,
        testnet: bool,
        store: Arc<TickerStore>,
        bus: Arc<TickBus>,
        metrics: Arc<MetricsRegistry>,
        debug_ws: bool,
        inactivity_threshold_s: u64,
    ) -> Self {
        Self {
            url: ws_public_url(category, testnet),
            category,
            symbols: RwLock::new(symbols),
            store,
            bus,
            metrics,
            state: Mutex::new(ConnState::Disconnected),
            running: std::sync::atomic::AtomicBool::new(false),
            outbound: Mutex::new(None),
            delay_index: AtomicUsize::new(0),
            message_count: AtomicU64::new(0),
            last_msg_by_topic: Mutex::new(HashMap::new()),
            debug_ws,
            inactivity_threshold: Duration::from_secs(inactivity_threshold_s),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn category(&self) -> Category {
        self.category
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
    }

    /// Replace the category's symbol set. Newly added symbols get an
    /// incremental subscribe immediately when the connection is live; the
    /// full set is re-sent on the next reconnect either way.
    pub fn update_symbols(&self, symbols: Vec<String>) {
        let added: Vec<String> = {
            let current = self.symbols.read();
            symbols
                .iter()
                .filter(|s| !current.contains(s))
                .cloned()
                .collect()
        };
        *self.symbols.write() = symbols;

        for symbol in added {
            if let Err(e) = self.subscribe_symbol(&symbol) {
                debug!(symbol = %symbol, error = %e, "incremental subscribe deferred to reconnect");
            }
        }
    }

    /// Send an incremental subscribe frame for one symbol's three topics.
    /// Fails fast when no live connection exists; the caller owns retries.
    pub fn subscribe_symbol(&self, symbol: &str) -> Result<()> {
        let state = self.state();
        if !matches!(state, ConnState::Open | ConnState::Subscribed) {
            anyhow::bail!("no live {} connection (state={state:?})", self.category);
        }

        let topics = topics_for(symbol);
        let frame = json!({"op": "subscribe", "args": topics});

        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .context("outbound channel not installed")?;
        tx.send(Message::Text(frame.to_string()))
            .context("outbound channel closed")?;

        for topic in &topics {
            info!(category = %self.category, topic = %topic, "[WS SUBSCRIBE]");
        }
        Ok(())
    }

    /// Connection loop with automatic reconnect. Returns when `stop()` is
    /// called.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            self.set_state(ConnState::Connecting);
            info!(category = %self.category, url = %self.url, "connecting public stream");

            match connect_async(&self.url).await {
                Ok((ws_stream, _response)) => {
                    self.metrics.record_ws_connection();
                    self.delay_index.store(0, Ordering::SeqCst);
                    self.set_state(ConnState::Open);

                    if let Err(e) = self.serve_connection(ws_stream).await {
                        if self.running.load(Ordering::SeqCst) {
                            error!(category = %self.category, error = %e, "[WS ERROR] stream failed");
                        }
                    }
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!(category = %self.category, error = %e, "[WS ERROR] connect failed");
                        self.metrics.record_ws_error();
                    }
                }
            }

            *self.outbound.lock() = None;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.set_state(ConnState::Degraded);
            let idx = self.delay_index.load(Ordering::SeqCst);
            let delay = RECONNECT_DELAYS[idx.min(RECONNECT_DELAYS.len() - 1)];
            warn!(category = %self.category, delay_s = delay, "stream degraded, reconnecting");

            // Sleep in 1s slices so stop() is honored promptly.
            for _ in 0..delay {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if idx < RECONNECT_DELAYS.len() - 1 {
                self.delay_index.store(idx + 1, Ordering::SeqCst);
            }
        }

        self.set_state(ConnState::Disconnected);
        info!(category = %self.category, "public stream stopped");
    }

    async fn serve_connection(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        // Initial subscription frame covering every symbol of the category.
        let symbols = self.symbols.read().clone();
        if symbols.is_empty() {
            warn!(category = %self.category, "no symbols to subscribe");
        } else {
            let topics: Vec<String> = symbols.iter().flat_map(|s| topics_for(s)).collect();
            {
                let mut last_seen = self.last_msg_by_topic.lock();
                last_seen.clear();
                for t in &topics {
                    last_seen.insert(t.clone(), Instant::now());
                }
            }
            let frame = json!({"op": "subscribe", "args": topics});
            write
                .send(Message::Text(frame.to_string()))
                .await
                .context("failed to send subscribe frame")?;
            info!(
                category = %self.category,
                symbols = symbols.len(),
                topics = symbols.len() * 3,
                "[WS SUBSCRIBE] subscription frame sent"
            );
            self.set_state(ConnState::Subscribed);
        }

        // Writer side: forward dynamic frames and emit protocol pings.
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock() = Some(tx);

        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if write.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ping.tick() => {
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader side.
        let result = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.message_count.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_ws_message();
                    self.handle_frame(&text);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    warn!(category = %self.category, frame = ?frame, "stream closed by peer");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.metrics.record_ws_error();
                    break Err(anyhow::Error::from(e)).context("stream read error");
                }
                None => {
                    warn!(category = %self.category, "stream ended");
                    break Ok(());
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }
        };

        writer.abort();
        result
    }

    // -------------------------------------------------------------------------
    // Frame routing
    // -------------------------------------------------------------------------

    fn handle_frame(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(category = %self.category, error = %e, "unparseable frame");
                return;
            }
        };

        // Subscription responses.
        if frame["op"].as_str() == Some("subscribe") {
            let success = frame["success"].as_bool().unwrap_or(true);
            let ret_msg = frame["ret_msg"]
                .as_str()
                .or_else(|| frame["retMsg"].as_str())
                .unwrap_or("");
            let args = frame["request"]["args"].clone();
            if !success {
                error!(
                    category = %self.category,
                    reason = %ret_msg,
                    args = %args,
                    "[WS ERROR] subscription rejected"
                );
            } else {
                debug!(category = %self.category, args = %args, "[WS SUBSCRIBE] ok");
            }
            return;
        }

        let Some(topic) = frame["topic"].as_str() else {
            return;
        };

        if self.debug_ws {
            self.last_msg_by_topic
                .lock()
                .insert(topic.to_string(), Instant::now());
        }

        if let Some(symbol) = topic.strip_prefix("tickers.") {
            if let Some(update) = normalize_ticker(&frame["data"]) {
                self.store.merge(symbol, &update);
                // Subscribers receive the normalized record, not the raw
                // frame with its alternate field names.
                self.bus.publish(TickEvent {
                    symbol: symbol.to_string(),
                    kind: TickKind::Ticker,
                    payload: json!({
                        "symbol": symbol,
                        "fundingRate": update.funding_rate,
                        "volume24h": update.turnover_24h,
                        "bid1Price": update.bid,
                        "ask1Price": update.ask,
                        "nextFundingTime": update.next_funding_time,
                        "markPrice": update.mark_price,
                        "lastPrice": update.last_price,
                    }),
                });
            }
        } else if let Some(symbol) = topic.strip_prefix("publicTrade.") {
            self.bus.publish(TickEvent {
                symbol: symbol.to_string(),
                kind: TickKind::Trade,
                payload: frame["data"].clone(),
            });
        } else if let Some(symbol) = topic.strip_prefix("orderbook.1.") {
            self.bus.publish(TickEvent {
                symbol: symbol.to_string(),
                kind: TickKind::Orderbook,
                payload: frame["data"].clone(),
            });
        }
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    /// Log "N msgs in last T s" every 10 seconds and reset the counter.
    pub async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            let count = self.message_count.swap(0, Ordering::Relaxed);
            let per_sec = count as f64 / HEARTBEAT_INTERVAL.as_secs_f64();
            info!(
                category = %self.category,
                msgs = count,
                window_s = HEARTBEAT_INTERVAL.as_secs(),
                rate = format!("{per_sec:.1}/s"),
                "[WS HEARTBEAT]"
            );
        }
    }

    /// Warn when a subscribed topic has been silent for longer than the
    /// configured threshold. Diagnostics only; never reconnects.
    pub async fn inactivity_watchdog(self: Arc<Self>) {
        if !self.debug_ws {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut last_warn: HashMap<String, Instant> = HashMap::new();

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            let now = Instant::now();
            let stale: Vec<String> = {
                let last_seen = self.last_msg_by_topic.lock();
                last_seen
                    .iter()
                    .filter(|(_, ts)| now.duration_since(**ts) >= self.inactivity_threshold)
                    .map(|(topic, _)| topic.clone())
                    .collect()
            };
            for topic in stale {
                let due = last_warn
                    .get(&topic)
                    .map_or(true, |w| now.duration_since(*w) >= self.inactivity_threshold);
                if due {
                    warn!(
                        category = %self.category,
                        topic = %topic,
                        endpoint = %self.url,
                        "[WS ERROR] no messages received on topic"
                    );
                    last_warn.insert(topic, now);
                }
            }
        }
    }

    /// Idempotent shutdown: stops the run loop and closes the socket.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(Message::Close(None));
        }
        info!(category = %self.category, "stream stop requested");
    }
}

impl std::fmt::Debug for PublicWsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicWsClient")
            .field("category", &self.category)
            .field("state", &self.state())
            .field("symbols", &self.symbols.read().len())
            .finish()
    }
}

/// The three public topics subscribed per symbol.
fn topics_for(symbol: &str) -> Vec<String> {
    vec![
        format!("tickers.{symbol}"),
        format!("publicTrade.{symbol}"),
        format!("orderbook.1.{symbol}"),
    ]
}

/// Normalize a tickers.* payload into an [`InstantTicker`] update, accepting
/// the alternate short field names some frames carry. Returns None when the
/// payload holds nothing usable.
fn normalize_ticker(data: &Value) -> Option<InstantTicker> {
    let update = InstantTicker {
        funding_rate: parse_opt_f64(&data["fundingRate"]),
        turnover_24h: parse_opt_f64(&data["turnover24h"]).or_else(|| parse_opt_f64(&data["volume24h"])),
        bid: parse_opt_f64(&data["bid1Price"]).or_else(|| parse_opt_f64(&data["bp"])),
        ask: parse_opt_f64(&data["ask1Price"]).or_else(|| parse_opt_f64(&data["ap"])),
        next_funding_time: next_funding_seconds(data),
        mark_price: parse_opt_f64(&data["markPrice"]),
        last_price: parse_opt_f64(&data["lastPrice"]).or_else(|| parse_opt_f64(&data["lp"])),
        updated_at: chrono::Utc::now().timestamp(),
    };

    let empty = update.funding_rate.is_none()
        && update.turnover_24h.is_none()
        && update.bid.is_none()
        && update.ask.is_none()
        && update.next_funding_time.is_none()
        && update.mark_price.is_none()
        && update.last_price.is_none();
    if empty {
        None
    } else {
        Some(update)
    }
}

fn next_funding_seconds(data: &Value) -> Option<i64> {
    let raw = &data["nextFundingTime"];
    let alt = &data["nft"];
    let ms = raw
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| raw.as_i64())
        .or_else(|| alt.as_str().and_then(|s| s.parse::<i64>().ok()))
        .or_else(|| alt.as_i64())?;
    Some(ms / 1000)
}

/// Drop symbols that instruments-info does not know, logging each rejection.
/// On a wholesale validation failure the original list is returned so a REST
/// outage cannot empty the watchlist.
pub async fn validate_symbols(
    client: &MarketDataClient,
    category: Category,
    symbols: Vec<String>,
) -> Vec<String> {
    let mut valid = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        match client.validate_symbol(category, symbol).await {
            Ok(true) => valid.push(symbol.clone()),
            Ok(false) => {
                error!(category = %category, symbol = %symbol, "[WS ERROR] symbol unknown to instruments-info");
            }
            Err(e) => {
                warn!(category = %category, symbol = %symbol, error = %e, "[WS ERROR] symbol validation failed, keeping");
                valid.push(symbol.clone());
            }
        }
    }
    valid
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_for_tests() -> Arc<PublicWsClient> {
        Arc::new(PublicWsClient::new(
            Category::Linear,
            vec!["BTCUSDT".to_string()],
            true,
            Arc::new(TickerStore::new()),
            Arc::new(TickBus::new()),
            Arc::new(MetricsRegistry::new()),
            false,
            10,
        ))
    }

    #[test]
    fn topics_cover_three_streams() {
        let topics = topics_for("BTCUSDT");
        assert_eq!(
            topics,
            vec!["tickers.BTCUSDT", "publicTrade.BTCUSDT", "orderbook.1.BTCUSDT"]
        );
    }

    #[test]
    fn normalize_accepts_canonical_names() {
        let data = json!({
            "symbol": "BTCUSDT",
            "fundingRate": "0.0001",
            "turnover24h": "15000000",
            "bid1Price": "27000.5",
            "ask1Price": "27001.0",
            "nextFundingTime": "1700000000000",
            "markPrice": "27000.7",
            "lastPrice": "27000.6"
        });
        let t = normalize_ticker(&data).unwrap();
        assert_eq!(t.funding_rate, Some(0.0001));
        assert_eq!(t.turnover_24h, Some(15_000_000.0));
        assert_eq!(t.bid, Some(27000.5));
        assert_eq!(t.ask, Some(27001.0));
        assert_eq!(t.next_funding_time, Some(1_700_000_000));
        assert_eq!(t.last_price, Some(27000.6));
    }

    #[test]
    fn normalize_accepts_alternate_names() {
        let data = json!({
            "s": "BTCUSDT",
            "volume24h": "9000000",
            "bp": "100.0",
            "ap": "100.1",
            "nft": 1700000000000i64,
            "lp": "100.05"
        });
        let t = normalize_ticker(&data).unwrap();
        assert_eq!(t.turnover_24h, Some(9_000_000.0));
        assert_eq!(t.bid, Some(100.0));
        assert_eq!(t.ask, Some(100.1));
        assert_eq!(t.next_funding_time, Some(1_700_000_000));
        assert_eq!(t.last_price, Some(100.05));
    }

    #[test]
    fn normalize_rejects_empty_payload() {
        assert!(normalize_ticker(&json!({"symbol": "BTCUSDT"})).is_none());
        assert!(normalize_ticker(&json!({})).is_none());
    }

    #[test]
    fn ticker_frame_merges_into_store_and_publishes() {
        let client = client_for_tests();
        let mut rx = client.bus.subscribe("BTCUSDT");

        client.handle_frame(
            &json!({
                "topic": "tickers.BTCUSDT",
                "data": {"fundingRate": "0.0002", "lastPrice": "27000"}
            })
            .to_string(),
        );

        let stored = client.store.get("BTCUSDT").unwrap();
        assert_eq!(stored.funding_rate, Some(0.0002));
        assert_eq!(stored.last_price, Some(27000.0));
        assert_eq!(rx.try_recv().unwrap().kind, TickKind::Ticker);
    }

    #[test]
    fn trade_and_orderbook_frames_publish_without_store_writes() {
        let client = client_for_tests();
        let mut rx = client.bus.subscribe("ETHUSDT");

        client.handle_frame(
            &json!({"topic": "publicTrade.ETHUSDT", "data": [{"p": "1800", "v": "2"}]}).to_string(),
        );
        client.handle_frame(
            &json!({"topic": "orderbook.1.ETHUSDT", "data": {"b": [["1799", "1"]], "a": [["1801", "1"]]}})
                .to_string(),
        );

        assert!(!client.store.has_symbol("ETHUSDT"));
        assert_eq!(rx.try_recv().unwrap().kind, TickKind::Trade);
        assert_eq!(rx.try_recv().unwrap().kind, TickKind::Orderbook);
    }

    #[test]
    fn subscription_rejection_is_tolerated() {
        let client = client_for_tests();
        // Must not panic or publish anything.
        client.handle_frame(
            &json!({
                "op": "subscribe",
                "success": false,
                "ret_msg": "error:handler not found",
                "request": {"args": ["tickers.BOGUS"]}
            })
            .to_string(),
        );
    }

    #[test]
    fn dynamic_subscribe_fails_fast_when_disconnected() {
        let client = client_for_tests();
        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(client.subscribe_symbol("SOLUSDT").is_err());
    }

    #[test]
    fn stop_is_idempotent() {
        let client = client_for_tests();
        client.running.store(true, Ordering::SeqCst);
        client.stop();
        client.stop(); // second call is a no-op
        assert!(!client.running.load(Ordering::SeqCst));
    }

    #[test]
    fn update_symbols_replaces_set() {
        let client = client_for_tests();
        client.update_symbols(vec!["ETHUSDT".to_string(), "SOLUSDT".to_string()]);
        assert_eq!(client.symbols.read().len(), 2);
    }
}
