// =============================================================================
// Fusion State — per-symbol instant tickers merged from streaming and REST
// =============================================================================
//
// One mutex spans the whole symbol map. Reads hand out defensive copies;
// writes apply the null-preserving merge atomically. Per symbol, updates are
// serialized in arrival order; across symbols no ordering is promised.
// =============================================================================

pub mod stream;

use std::collections::HashMap;

use parking_lot::Mutex;

/// Last known market state for one symbol. Every field is individually
/// optional; a field is only ever replaced by a newer non-null value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstantTicker {
    /// Funding rate as a plain fraction.
    pub funding_rate: Option<f64>,
    /// 24h turnover in quote currency.
    pub turnover_24h: Option<f64>,
    /// Best bid price.
    pub bid: Option<f64>,
    /// Best ask price.
    pub ask: Option<f64>,
    /// Next funding settlement, epoch seconds.
    pub next_funding_time: Option<i64>,
    pub mark_price: Option<f64>,
    pub last_price: Option<f64>,
    /// Wall-clock of the most recent update, epoch seconds.
    pub updated_at: i64,
}

impl InstantTicker {
    /// Merge `update` into `self`: latest non-null wins per field, null
    /// never overwrites. The update timestamp always advances.
    pub fn merge_from(&mut self, update: &InstantTicker) {
        if update.funding_rate.is_some() {
            self.funding_rate = update.funding_rate;
        }
        if update.turnover_24h.is_some() {
            self.turnover_24h = update.turnover_24h;
        }
        if update.bid.is_some() {
            self.bid = update.bid;
        }
        if update.ask.is_some() {
            self.ask = update.ask;
        }
        if update.next_funding_time.is_some() {
            self.next_funding_time = update.next_funding_time;
        }
        if update.mark_price.is_some() {
            self.mark_price = update.mark_price;
        }
        if update.last_price.is_some() {
            self.last_price = update.last_price;
        }
        self.updated_at = self.updated_at.max(update.updated_at);
    }

    /// Spread fraction against the mid price, when both sides are known and
    /// strictly positive.
    pub fn spread(&self) -> Option<f64> {
        let bid = self.bid?;
        let ask = self.ask?;
        if bid <= 0.0 || ask <= 0.0 {
            return None;
        }
        let mid = (ask + bid) / 2.0;
        if mid <= 0.0 {
            return None;
        }
        Some((ask - bid) / mid)
    }
}

/// Thread-safe store of per-symbol instant tickers.
#[derive(Default)]
pub struct TickerStore {
    tickers: Mutex<HashMap<String, InstantTicker>>,
}

impl TickerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update into the symbol's ticker, creating it on first
    /// contact.
    pub fn merge(&self, symbol: &str, update: &InstantTicker) {
        let mut tickers = self.tickers.lock();
        tickers
            .entry(symbol.to_string())
            .or_default()
            .merge_from(update);
    }

    /// Defensive copy of one symbol's ticker.
    pub fn get(&self, symbol: &str) -> Option<InstantTicker> {
        self.tickers.lock().get(symbol).cloned()
    }

    /// Defensive copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, InstantTicker> {
        self.tickers.lock().clone()
    }

    /// True once at least one update has been merged for `symbol`.
    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.tickers.lock().contains_key(symbol)
    }

    /// Epoch seconds of the symbol's last update.
    pub fn last_update(&self, symbol: &str) -> Option<i64> {
        self.tickers.lock().get(symbol).map(|t| t.updated_at)
    }

    /// Drop entries older than `ttl_seconds`. Returns the purged count.
    pub fn purge_expired(&self, ttl_seconds: i64) -> usize {
        let now = chrono::Utc::now().timestamp();
        let mut tickers = self.tickers.lock();
        let before = tickers.len();
        tickers.retain(|_, t| now - t.updated_at <= ttl_seconds);
        before - tickers.len()
    }

    pub fn len(&self) -> usize {
        self.tickers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.lock().is_empty()
    }
}

impl std::fmt::Debug for TickerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickerStore")
            .field("symbols", &self.len())
            .finish()
    }
}
