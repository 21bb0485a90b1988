// =============================================================================
// Tick Bus — publish/subscribe decoupling of streaming from consumers
// =============================================================================
//
// The streaming layer publishes "tick for S" events; the turbo controller
// subscribes per symbol on activation and drops the receiver on
// termination. Publishing must never block the WebSocket read loop: sends
// are unbounded and closed receivers are pruned inline.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Which streaming topic produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Ticker,
    Trade,
    Orderbook,
}

/// One streaming event for one symbol.
#[derive(Debug, Clone)]
pub struct TickEvent {
    pub symbol: String,
    pub kind: TickKind,
    pub payload: serde_json::Value,
}

/// Per-symbol fan-out plus an all-symbols firehose.
#[derive(Default)]
pub struct TickBus {
    by_symbol: RwLock<HashMap<String, Vec<UnboundedSender<TickEvent>>>>,
    firehose: RwLock<Vec<UnboundedSender<TickEvent>>>,
}

impl TickBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events for one symbol. The subscription ends when the
    /// receiver is dropped.
    pub fn subscribe(&self, symbol: &str) -> UnboundedReceiver<TickEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.by_symbol
            .write()
            .entry(symbol.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Subscribe to events for every symbol.
    pub fn subscribe_all(&self) -> UnboundedReceiver<TickEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.firehose.write().push(tx);
        rx
    }

    /// Deliver an event to the symbol's subscribers and the firehose.
    /// Closed receivers are pruned as they are discovered.
    pub fn publish(&self, event: TickEvent) {
        {
            let mut by_symbol = self.by_symbol.write();
            if let Some(senders) = by_symbol.get_mut(&event.symbol) {
                senders.retain(|tx| tx.send(event.clone()).is_ok());
                if senders.is_empty() {
                    by_symbol.remove(&event.symbol);
                }
            }
        }
        let mut firehose = self.firehose.write();
        firehose.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live per-symbol subscriptions (for diagnostics).
    pub fn subscription_count(&self) -> usize {
        self.by_symbol.read().values().map(|v| v.len()).sum()
    }
}

impl std::fmt::Debug for TickBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickBus")
            .field("subscriptions", &self.subscription_count())
            .field("firehose", &self.firehose.read().len())
            .finish()
    }
}
