// =============================================================================
// Turbo Controller — funding-window fast path per symbol
// =============================================================================
//
// Activation, bounded parallelism, cooldown and teardown live here; the
// per-symbol fast loop itself is in `runner.rs`. One registry lock guards
// `active`, `cooldown_until`, `has_ws_data` and the busy set; each loop task
// exclusively owns its own TurboState.
//
// Teardown discipline: a loop that reaches a terminal reason finalizes
// itself through `finish_symbol`, which never joins — so a task can never
// attempt to join itself. Only external stops (`stop_for_symbol`,
// `stop_all`) set the stop flag and await the task, with a 2s timeout.
// =============================================================================

pub mod runner;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::TickBus;
use crate::bybit::order::OrderApi;
use crate::bybit::MarketDataClient;
use crate::market_data::TickerStore;
use crate::metrics::MetricsRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::types::{Candidate, Category};
use crate::volatility::VolatilityCache;
use crate::watchlist::filters::parse_funding_time;
use crate::watchlist::WatchlistManager;

/// Attempts for the dynamic streaming subscription.
const SUBSCRIBE_RETRIES: u32 = 3;
/// Spacing between subscription attempts.
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Join timeout when stopping a loop task externally.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Narrow interface through which the controller requests incremental
/// streaming subscriptions. Implemented over the per-category connections.
pub trait StreamSubscriber: Send + Sync {
    fn subscribe_symbol(&self, category: Category, symbol: &str) -> anyhow::Result<()>;
}

/// Why a per-symbol loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    FundingDone,
    Miss,
    FilterBreak,
    SortieConditions,
    FatalError,
    Shutdown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::FundingDone => "funding_done",
            StopReason::Miss => "miss",
            StopReason::FilterBreak => "filter_break",
            StopReason::SortieConditions => "sortie_conditions",
            StopReason::FatalError => "fatal_error",
            StopReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ActiveEntry {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    active: HashMap<String, ActiveEntry>,
    /// Symbol -> wall-clock deadline (epoch seconds) before which a new
    /// activation is forbidden.
    cooldown_until: HashMap<String, i64>,
    /// Symbols that received at least one trade/orderbook streaming frame.
    has_ws_data: HashSet<String>,
    /// Symbols whose loop has an order or position outstanding; these are
    /// never deactivated by a top-N switch.
    busy: HashSet<String>,
    open_positions: HashSet<String>,
    trades_today: u32,
    trades_date: String,
}

pub struct TurboController {
    config: Arc<RuntimeConfig>,
    client: MarketDataClient,
    order: Arc<dyn OrderApi>,
    store: Arc<TickerStore>,
    bus: Arc<TickBus>,
    volatility: Arc<VolatilityCache>,
    watchlist: Arc<WatchlistManager>,
    metrics: Arc<MetricsRegistry>,
    subscriber: Arc<dyn StreamSubscriber>,
    inner: Mutex<Inner>,
    running: AtomicBool,
}

impl TurboController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RuntimeConfig>,
        client: MarketDataClient,
        order: Arc<dyn OrderApi>,
        store: Arc<TickerStore>,
        bus: Arc<TickBus>,
        volatility: Arc<VolatilityCache>,
        watchlist: Arc<WatchlistManager>,
        metrics: Arc<MetricsRegistry>,
        subscriber: Arc<dyn StreamSubscriber>,
    ) -> Self {
        info!(
            enabled = config.turbo.enabled,
            trigger_s = config.turbo.trigger_seconds,
            entry_s = config.turbo.entry_seconds,
            max_parallel = config.turbo.max_parallel_pairs,
            "turbo controller initialised"
        );
        Self {
            config,
            client,
            order,
            store,
            bus,
            volatility,
            watchlist,
            metrics,
            subscriber,
            inner: Mutex::new(Inner::default()),
            running: AtomicBool::new(true),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn is_active(&self, symbol: &str) -> bool {
        self.inner.lock().active.contains_key(symbol)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.inner.lock().active.keys().cloned().collect()
    }

    pub fn cooldown_count(&self) -> usize {
        self.inner.lock().cooldown_until.len()
    }

    /// Eligible means: not embargoed. Expired cooldown entries are cleaned
    /// up on the way.
    pub fn is_eligible(&self, symbol: &str) -> bool {
        let now = chrono::Utc::now().timestamp();
        let mut inner = self.inner.lock();
        match inner.cooldown_until.get(symbol) {
            Some(&deadline) if now < deadline => false,
            Some(_) => {
                inner.cooldown_until.remove(symbol);
                true
            }
            None => true,
        }
    }

    pub fn cooldown_deadline(&self, symbol: &str) -> Option<i64> {
        self.inner.lock().cooldown_until.get(symbol).copied()
    }

    pub fn has_ws_data(&self, symbol: &str) -> bool {
        self.inner.lock().has_ws_data.contains(symbol)
    }

    /// Mark that at least one streaming frame arrived for `symbol`.
    pub fn mark_ws_data(&self, symbol: &str) {
        let mut inner = self.inner.lock();
        if inner.has_ws_data.insert(symbol.to_string()) {
            debug!(symbol, "first streaming data received");
        }
    }

    // -------------------------------------------------------------------------
    // Busy / position / trade-cap bookkeeping (called by the runner)
    // -------------------------------------------------------------------------

    pub(crate) fn mark_busy(&self, symbol: &str) {
        self.inner.lock().busy.insert(symbol.to_string());
    }

    pub(crate) fn mark_position_open(&self, symbol: &str) {
        self.inner.lock().open_positions.insert(symbol.to_string());
    }

    pub(crate) fn mark_position_closed(&self, symbol: &str) {
        self.inner.lock().open_positions.remove(symbol);
    }

    /// Gate shared by every entry attempt: daily trade cap and open-position
    /// cap, with a UTC date rollover on the counter.
    pub(crate) fn entry_allowed(&self) -> bool {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut inner = self.inner.lock();
        if inner.trades_date != today {
            inner.trades_date = today;
            inner.trades_today = 0;
        }
        if inner.trades_today >= self.config.risk.max_trades_per_day {
            warn!(
                trades_today = inner.trades_today,
                cap = self.config.risk.max_trades_per_day,
                "entry blocked by daily trade cap"
            );
            return false;
        }
        if inner.open_positions.len() >= self.config.risk.max_open_positions {
            warn!(
                open = inner.open_positions.len(),
                cap = self.config.risk.max_open_positions,
                "entry blocked by open-position cap"
            );
            return false;
        }
        true
    }

    pub(crate) fn record_entry_sent(&self) {
        self.inner.lock().trades_today += 1;
        self.metrics.record_turbo_entry();
    }

    // -------------------------------------------------------------------------
    // Activation
    // -------------------------------------------------------------------------

    /// Evaluate the ranked candidates for turbo activation. Called on every
    /// re-rank pass.
    pub async fn check_candidates(self: Arc<Self>, candidates: &[Candidate]) {
        if !self.config.turbo.enabled || !self.running.load(Ordering::SeqCst) {
            return;
        }

        // Optional mid-cycle deactivation of idle loops that fell out of
        // the top-N.
        if self.config.turbo.allow_midcycle_topn_switch {
            let current: HashSet<&str> = candidates.iter().map(|c| c.symbol.as_str()).collect();
            let dropped: Vec<String> = {
                let inner = self.inner.lock();
                inner
                    .active
                    .keys()
                    .filter(|s| !current.contains(s.as_str()) && !inner.busy.contains(*s))
                    .cloned()
                    .collect()
            };
            for symbol in dropped {
                info!(symbol = %symbol, "active symbol dropped out of top-N");
                self.stop_for_symbol(&symbol, StopReason::SortieConditions).await;
            }
        }

        for candidate in candidates {
            self.clone().try_activate(candidate).await;
        }
    }

    async fn try_activate(self: Arc<Self>, candidate: &Candidate) {
        let symbol = &candidate.symbol;

        let Some(remaining_s) = self.time_to_funding_seconds(candidate) else {
            debug!(symbol = %symbol, "no usable funding time, skipping");
            return;
        };
        if remaining_s > self.config.turbo.trigger_seconds {
            return;
        }
        if self.is_active(symbol) {
            return;
        }
        if !self.is_eligible(symbol) {
            let remaining = self
                .cooldown_deadline(symbol)
                .map(|d| d - chrono::Utc::now().timestamp())
                .unwrap_or(0);
            debug!(symbol = %symbol, cooldown_remaining_s = remaining, "in cooldown");
            return;
        }
        {
            let inner = self.inner.lock();
            if inner.active.len() >= self.config.turbo.max_parallel_pairs {
                drop(inner);
                self.metrics.record_turbo_skip();
                info!(
                    symbol = %symbol,
                    active = self.active_count(),
                    cap = self.config.turbo.max_parallel_pairs,
                    "[Turbo SKIP] capacity reached"
                );
                return;
            }
        }

        let category = self
            .watchlist
            .category_of(symbol)
            .unwrap_or(Category::Linear);

        // Incremental streaming subscription, retried up to 3 times.
        if !self.subscribe_with_retry(category, symbol).await {
            self.metrics.record_turbo_skip();
            return;
        }

        // Streaming gate: first frame must arrive within the timeout; a
        // REST seed is injected meanwhile so the loop starts warm.
        if !self.await_ws_data(category, symbol).await {
            self.metrics.record_turbo_skip();
            return;
        }

        // Re-check capacity and activity under one lock before inserting;
        // the awaits above may have raced another activation.
        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut inner = self.inner.lock();
            if inner.active.contains_key(symbol) {
                return;
            }
            if inner.active.len() >= self.config.turbo.max_parallel_pairs {
                drop(inner);
                self.metrics.record_turbo_skip();
                info!(symbol = %symbol, "[Turbo SKIP] capacity reached");
                return;
            }
            inner.active.insert(
                symbol.clone(),
                ActiveEntry {
                    stop: stop.clone(),
                    handle: None,
                },
            );
        }

        let ctx = runner::RunnerContext {
            controller: Arc::clone(&self),
            symbol: symbol.clone(),
            category,
            meta_score: candidate.score,
            activation_funding_s: remaining_s,
            activated_at: chrono::Utc::now().timestamp(),
            stop: stop.clone(),
        };
        let handle = tokio::spawn(runner::run_loop(ctx));
        if let Some(entry) = self.inner.lock().active.get_mut(symbol) {
            entry.handle = Some(handle);
        }

        info!(symbol = %symbol, t = remaining_s, "[Turbo ON]");
    }

    /// Resolve time-to-funding in priority order: fused ticker, REST
    /// snapshot, then the candidate's formatted string.
    fn time_to_funding_seconds(&self, candidate: &Candidate) -> Option<i64> {
        let now = chrono::Utc::now().timestamp();

        if let Some(next) = self
            .store
            .get(&candidate.symbol)
            .and_then(|t| t.next_funding_time)
        {
            return Some((next - now).max(0));
        }
        if let Some(raw) = self.watchlist.original_funding(&candidate.symbol) {
            if let Some(next) = crate::watchlist::filters::parse_next_funding(&raw) {
                return Some((next - now).max(0));
            }
        }
        parse_funding_time(&candidate.funding_time)
    }

    async fn subscribe_with_retry(&self, category: Category, symbol: &str) -> bool {
        for attempt in 1..=SUBSCRIBE_RETRIES {
            match self.subscriber.subscribe_symbol(category, symbol) {
                Ok(()) => return true,
                Err(e) => {
                    if attempt < SUBSCRIBE_RETRIES {
                        warn!(
                            symbol,
                            attempt,
                            error = %e,
                            "[WS SUBSCRIBE] retrying dynamic subscription"
                        );
                        tokio::time::sleep(SUBSCRIBE_RETRY_DELAY).await;
                    } else {
                        warn!(symbol, error = %e, "[WS ERROR] dynamic subscription failed after {SUBSCRIBE_RETRIES} attempts");
                    }
                }
            }
        }
        false
    }

    /// Wait until the symbol has streaming data, injecting a REST ticker
    /// seed so the loop can start from a warm snapshot. Returns false on
    /// timeout.
    async fn await_ws_data(&self, category: Category, symbol: &str) -> bool {
        if self.has_ws_data(symbol) {
            return true;
        }

        let mut rx = self.bus.subscribe(symbol);

        // REST seed while we wait for the first frame.
        match self.client.fetch_instrument_ticker(category, symbol).await {
            Ok(seed) => {
                self.store.merge(symbol, &seed);
                debug!(symbol, "REST ticker seed injected");
            }
            Err(e) => {
                warn!(symbol, error = %e, "REST ticker seed failed");
            }
        }

        let timeout = Duration::from_secs(self.config.turbo.ws_timeout_seconds);
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(_)) => {
                self.mark_ws_data(symbol);
                info!(symbol, "[Turbo READY] first streaming data received");
                true
            }
            _ => {
                warn!(
                    symbol,
                    timeout_s = self.config.turbo.ws_timeout_seconds,
                    "no streaming data before timeout"
                );
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Termination
    // -------------------------------------------------------------------------

    /// Finalize a symbol from inside its own loop: remove the registry
    /// entry, arm the cooldown, bump counters, log. Never joins.
    pub(crate) fn finish_symbol(&self, symbol: &str, reason: StopReason) {
        let removed = {
            let mut inner = self.inner.lock();
            inner.busy.remove(symbol);
            inner.open_positions.remove(symbol);
            inner.active.remove(symbol)
        };
        if removed.is_none() {
            debug!(symbol, "finish on inactive symbol ignored");
            return;
        }
        self.apply_termination(symbol, reason);
    }

    /// Stop a symbol's loop from outside: set the stop flag, await the task
    /// briefly, then finalize.
    pub async fn stop_for_symbol(&self, symbol: &str, reason: StopReason) {
        let entry = {
            let mut inner = self.inner.lock();
            inner.busy.remove(symbol);
            inner.open_positions.remove(symbol);
            inner.active.remove(symbol)
        };
        let Some(entry) = entry else {
            debug!(symbol, "stop on inactive symbol ignored");
            return;
        };

        entry.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = entry.handle {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                warn!(symbol, "turbo loop did not stop within the join timeout");
            }
        }
        self.apply_termination(symbol, reason);
    }

    fn apply_termination(&self, symbol: &str, reason: StopReason) {
        let cooldown_s = self.config.turbo.cooldown_s;
        if cooldown_s > 0 {
            let deadline = chrono::Utc::now().timestamp() + cooldown_s as i64;
            self.inner
                .lock()
                .cooldown_until
                .insert(symbol.to_string(), deadline);
        }

        match reason {
            StopReason::FundingDone => self.metrics.record_turbo_exit(),
            StopReason::Miss => self.metrics.record_turbo_miss(),
            StopReason::FilterBreak => self.metrics.record_turbo_filter_break(),
            StopReason::FatalError => self.metrics.record_turbo_error(),
            StopReason::SortieConditions | StopReason::Shutdown => {}
        }

        info!(
            symbol,
            reason = %reason,
            cooldown_s,
            "[Turbo OFF]"
        );
    }

    /// Stop every active loop in sequence. Idempotent; a second call finds
    /// an empty registry and does nothing.
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        let symbols = self.active_symbols();
        for symbol in symbols {
            self.stop_for_symbol(&symbol, StopReason::Shutdown).await;
        }
    }

    // -------------------------------------------------------------------------
    // Streaming gate maintenance
    // -------------------------------------------------------------------------

    /// Drain the bus firehose and maintain the per-symbol "has streaming
    /// data" gate. Trade and orderbook frames qualify; bare ticker merges do
    /// not (they may come from the REST seed path).
    pub async fn run_ws_gate_loop(self: Arc<Self>, running: Arc<AtomicBool>) {
        let mut rx = self.bus.subscribe_all();
        while running.load(Ordering::SeqCst) {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(event)) => {
                    if matches!(event.kind, crate::bus::TickKind::Trade | crate::bus::TickKind::Orderbook)
                    {
                        self.mark_ws_data(&event.symbol);
                    }
                }
                Ok(None) => break,
                Err(_) => {} // timeout: re-check the running flag
            }
        }
    }

    // -------------------------------------------------------------------------
    // Accessors for the runner
    // -------------------------------------------------------------------------

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn order_api(&self) -> &Arc<dyn OrderApi> {
        &self.order
    }

    pub(crate) fn ticker_store(&self) -> &Arc<TickerStore> {
        &self.store
    }

    pub(crate) fn market_client(&self) -> &MarketDataClient {
        &self.client
    }

    pub(crate) fn volatility_cache(&self) -> &Arc<VolatilityCache> {
        &self.volatility
    }

    pub(crate) fn watchlist_manager(&self) -> &Arc<WatchlistManager> {
        &self.watchlist
    }

    pub(crate) fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub(crate) fn is_stopping(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Periodic metrics monitor body.
    pub fn log_metrics_summary(&self) {
        self.metrics.log_turbo_summary(
            self.active_count(),
            self.config.turbo.max_parallel_pairs,
            self.cooldown_count(),
        );
    }
}

impl std::fmt::Debug for TurboController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TurboController")
            .field("active", &inner.active.len())
            .field("cooldown", &inner.cooldown_until.len())
            .field("enabled", &self.config.turbo.enabled)
            .finish()
    }
}
