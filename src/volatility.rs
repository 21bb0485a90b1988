// =============================================================================
// Volatility Cache — TTL'd short-horizon realized volatility per symbol
// =============================================================================
//
// The filter pipeline and the turbo re-validation both consult this cache;
// neither ever triggers a fetch. A background task owned by the coordinator
// refreshes the active symbols from 5-minute klines.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bybit::client::Kline;
use crate::bybit::MarketDataClient;
use crate::types::Category;

/// Kline interval used for the realized-range computation.
const VOL_INTERVAL_MIN: u32 = 5;
/// Number of bars in the lookback window.
const VOL_WINDOW: u32 = 6;

struct Entry {
    volatility: f64,
    cached_at: i64,
}

/// Per-symbol volatility fractions with a TTL.
pub struct VolatilityCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl_seconds: i64,
}

impl VolatilityCache {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_seconds,
        }
    }

    /// Cached volatility for `symbol`, or None when absent or expired.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        let now = chrono::Utc::now().timestamp();
        let entries = self.entries.lock();
        entries
            .get(symbol)
            .filter(|e| now - e.cached_at <= self.ttl_seconds)
            .map(|e| e.volatility)
    }

    pub fn set(&self, symbol: &str, volatility: f64) {
        self.entries.lock().insert(
            symbol.to_string(),
            Entry {
                volatility,
                cached_at: chrono::Utc::now().timestamp(),
            },
        );
    }

    /// Drop expired entries; returns the purged count.
    pub fn purge_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now - e.cached_at <= self.ttl_seconds);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Refresh every symbol in `symbols` whose cache entry is missing or
    /// expired. Individual fetch failures only skip that symbol.
    pub async fn refresh_symbols(
        &self,
        client: &MarketDataClient,
        symbols: &[(String, Category)],
    ) {
        for (symbol, category) in symbols {
            if self.get(symbol).is_some() {
                continue;
            }
            match client
                .fetch_klines(*category, symbol, VOL_INTERVAL_MIN, VOL_WINDOW)
                .await
            {
                Ok(klines) => {
                    if let Some(vol) = realized_range(&klines) {
                        self.set(symbol, vol);
                        debug!(symbol = %symbol, volatility = vol, "volatility refreshed");
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "volatility fetch failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for VolatilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolatilityCache")
            .field("entries", &self.len())
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

/// Realized range over the window as a fraction of the last close:
/// `(max(high) − min(low)) / last_close`. None on an empty window or a
/// non-positive close.
pub fn realized_range(klines: &[Kline]) -> Option<f64> {
    if klines.is_empty() {
        return None;
    }
    let high = klines.iter().map(|k| k.high).fold(f64::MIN, f64::max);
    let low = klines.iter().map(|k| k.low).fold(f64::MAX, f64::min);
    let close = klines.last()?.close;
    if close <= 0.0 || high < low {
        return None;
    }
    Some((high - low) / close)
}

/// Background refresh loop run by the coordinator. `symbols` is re-read each
/// round so watchlist changes are picked up.
pub async fn refresh_loop(
    cache: Arc<VolatilityCache>,
    client: MarketDataClient,
    symbols: Arc<parking_lot::RwLock<Vec<(String, Category)>>>,
    interval_seconds: u64,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));
    while running.load(std::sync::atomic::Ordering::SeqCst) {
        interval.tick().await;
        if !running.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        let targets = symbols.read().clone();
        if targets.is_empty() {
            continue;
        }
        cache.refresh_symbols(&client, &targets).await;
        let purged = cache.purge_expired();
        if purged > 0 {
            debug!(purged, "volatility cache purged");
        }
    }
}
