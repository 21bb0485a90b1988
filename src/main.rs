// =============================================================================
// Borealis Perp Nexus — Main Entry Point
// =============================================================================
//
// Startup order: config -> shared services -> initial watchlist -> public
// streams -> re-rank loop -> periodic refresh -> volatility refresh ->
// metrics monitor. Shutdown runs the same chain in dependency order:
// turbo -> watchlist refresh -> streaming -> volatility -> metrics.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod bus;
mod bybit;
mod market_data;
mod metrics;
mod runtime_config;
mod turbo;
mod types;
mod volatility;
mod watchlist;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bus::TickBus;
use crate::bybit::order::BybitOrderClient;
use crate::bybit::{rest_base_url, MarketDataClient, RateLimiter};
use crate::market_data::stream::{validate_symbols, PublicWsClient};
use crate::market_data::TickerStore;
use crate::metrics::MetricsRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::turbo::{StreamSubscriber, TurboController};
use crate::types::Category;
use crate::volatility::VolatilityCache;
use crate::watchlist::{WatchlistError, WatchlistManager};

/// Ticker entries older than this are purged from the fusion store.
const TICKER_TTL_S: i64 = 120;
/// Cadence of the turbo metrics summary log.
const METRICS_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Routes dynamic subscription requests to the right per-category
/// connection.
struct DualStreamSubscriber {
    linear: Option<Arc<PublicWsClient>>,
    inverse: Option<Arc<PublicWsClient>>,
}

impl StreamSubscriber for DualStreamSubscriber {
    fn subscribe_symbol(&self, category: Category, symbol: &str) -> anyhow::Result<()> {
        let conn = match category {
            Category::Linear => self.linear.as_ref(),
            Category::Inverse => self.inverse.as_ref(),
        };
        conn.with_context(|| format!("no {category} streaming connection"))?
            .subscribe_symbol(symbol)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Perp Nexus — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = "runtime_config.json";
    let config = if std::path::Path::new(config_path).exists() {
        // A present-but-invalid file is fatal.
        RuntimeConfig::load(config_path)?
    } else {
        warn!(path = config_path, "no config file found, using defaults");
        RuntimeConfig::from_defaults()?
    };
    let config = Arc::new(config);

    info!(
        categorie = %config.categorie,
        testnet = config.testnet,
        top_n = config.scoring.top_n,
        turbo_enabled = config.turbo.enabled,
        refresh_interval_s = config.refresh_interval,
        "configuration active"
    );

    // ── 2. Shared services ───────────────────────────────────────────────
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build reqwest client");
    let limiter = Arc::new(RateLimiter::default());
    let base_url = rest_base_url(config.testnet);
    let market_client = MarketDataClient::new(http.clone(), base_url, limiter.clone());

    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BYBIT_API_KEY / BYBIT_API_SECRET not set, order placement will be rejected");
    }
    let order_client = Arc::new(BybitOrderClient::new(
        http.clone(),
        base_url,
        api_key,
        api_secret,
        limiter.clone(),
    ));

    let store = Arc::new(TickerStore::new());
    let tick_bus = Arc::new(TickBus::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let vol_cache = Arc::new(VolatilityCache::new(config.volatility_ttl_sec as i64));

    let watchlist = Arc::new(WatchlistManager::new(
        config.clone(),
        market_client.clone(),
        vol_cache.clone(),
        metrics.clone(),
    ));

    // ── 3. Initial watchlist ─────────────────────────────────────────────
    match watchlist.run_cycle().await {
        Ok(()) => {}
        Err(WatchlistError::NoCandidates) => {
            anyhow::bail!("no symbols match the configured criteria, nothing to watch");
        }
        Err(WatchlistError::FundingUnavailable) => {
            anyhow::bail!("no funding data available for the selected categories");
        }
        Err(e) => return Err(e).context("initial watchlist build failed"),
    }

    // ── 4. Public streams ────────────────────────────────────────────────
    let linear_symbols = validate_symbols(
        &market_client,
        Category::Linear,
        watchlist.linear_symbols(),
    )
    .await;
    let inverse_symbols = validate_symbols(
        &market_client,
        Category::Inverse,
        watchlist.inverse_symbols(),
    )
    .await;

    let selection_categories = config.categorie.categories();
    let mut ws_linear: Option<Arc<PublicWsClient>> = None;
    let mut ws_inverse: Option<Arc<PublicWsClient>> = None;
    let mut stream_tasks = Vec::new();

    for category in selection_categories {
        let symbols = match category {
            Category::Linear => linear_symbols.clone(),
            Category::Inverse => inverse_symbols.clone(),
        };
        let client = Arc::new(PublicWsClient::new(
            category,
            symbols,
            config.testnet,
            store.clone(),
            tick_bus.clone(),
            metrics.clone(),
            config.logging.debug_ws,
            config.logging.debug_ws_inactivity_s,
        ));
        stream_tasks.push(tokio::spawn(client.clone().run()));
        tokio::spawn(client.clone().heartbeat_loop());
        tokio::spawn(client.clone().inactivity_watchdog());
        match category {
            Category::Linear => ws_linear = Some(client),
            Category::Inverse => ws_inverse = Some(client),
        }
    }
    info!(
        linear = ws_linear.is_some(),
        inverse = ws_inverse.is_some(),
        "public streams launched"
    );

    // Resubscribe streams when the watchlist membership changes.
    {
        let ws_linear = ws_linear.clone();
        let ws_inverse = ws_inverse.clone();
        watchlist.set_refresh_subscriber(Box::new(move |linear, inverse, _funding| {
            if let Some(conn) = &ws_linear {
                conn.update_symbols(linear.to_vec());
            }
            if let Some(conn) = &ws_inverse {
                conn.update_symbols(inverse.to_vec());
            }
        }));
    }

    // ── 5. Turbo controller ──────────────────────────────────────────────
    let subscriber = Arc::new(DualStreamSubscriber {
        linear: ws_linear.clone(),
        inverse: ws_inverse.clone(),
    });
    let turbo = Arc::new(TurboController::new(
        config.clone(),
        market_client.clone(),
        order_client,
        store.clone(),
        tick_bus.clone(),
        vol_cache.clone(),
        watchlist.clone(),
        metrics.clone(),
        subscriber,
    ));

    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(turbo.clone().run_ws_gate_loop(running.clone()));

    // ── 6. Re-rank / turbo-check loop ────────────────────────────────────
    let vol_symbols: Arc<RwLock<Vec<(String, Category)>>> = Arc::new(RwLock::new(Vec::new()));
    {
        let watchlist = watchlist.clone();
        let turbo = turbo.clone();
        let store = store.clone();
        let running = running.clone();
        let vol_symbols = vol_symbols.clone();
        let interval_s = config.refresh_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_s));
            interval.tick().await;
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let purged = store.purge_expired(TICKER_TTL_S);
                if purged > 0 {
                    info!(purged, "stale tickers purged");
                }

                let ranked = watchlist.rerank_with_live(&store);
                if let Some(best) = ranked.first() {
                    info!(
                        top = ?ranked.iter().map(|c| c.symbol.as_str()).collect::<Vec<_>>(),
                        best_score = best.score.unwrap_or(0.0),
                        funding_t = %best.funding_time,
                        "re-rank complete"
                    );
                }

                // Volatility refresh targets follow the filtered candidates.
                {
                    let targets: Vec<(String, Category)> = watchlist
                        .filtered_candidates()
                        .iter()
                        .map(|c| {
                            (
                                c.symbol.clone(),
                                watchlist.category_of(&c.symbol).unwrap_or(Category::Linear),
                            )
                        })
                        .collect();
                    *vol_symbols.write() = targets;
                }

                turbo.clone().check_candidates(&ranked).await;
            }
            info!("re-rank loop stopped");
        });
    }

    // ── 7. Periodic watchlist refresh ────────────────────────────────────
    tokio::spawn(
        watchlist
            .clone()
            .periodic_refresh_loop(running.clone()),
    );

    // ── 8. Volatility refresh ────────────────────────────────────────────
    tokio::spawn(volatility::refresh_loop(
        vol_cache.clone(),
        market_client.clone(),
        vol_symbols,
        config.volatility_ttl_sec.max(30) / 2,
        running.clone(),
    ));

    // ── 9. Metrics monitor ───────────────────────────────────────────────
    {
        let turbo = turbo.clone();
        let running = running.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_MONITOR_INTERVAL);
            interval.tick().await;
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                turbo.log_metrics_summary();
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Dependency order: turbo first so no order is left unmanaged.
    turbo.stop_all().await;
    watchlist.stop();
    running.store(false, Ordering::SeqCst);
    if let Some(conn) = &ws_linear {
        conn.stop();
    }
    if let Some(conn) = &ws_inverse {
        conn.stop();
    }

    // Join the receive loops, bounded so a wedged socket cannot hang the
    // shutdown.
    for task in stream_tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("streaming task did not stop within the join timeout");
        }
    }
    turbo.log_metrics_summary();

    info!("Borealis Perp Nexus shut down complete.");
    Ok(())
}
