// =============================================================================
// Runtime Configuration — validated engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Borealis engine. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading
// an older config file. Environment variables override file values.
//
// `validate()` collects every violation before failing so a broken file is
// reported in one pass; an invalid configuration is fatal at startup.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::CategorySelection;
use crate::watchlist::filters::FilterParams;
use crate::watchlist::scoring::ScoringConfig;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_limite() -> usize {
    10
}

fn default_volatility_ttl_sec() -> u64 {
    120
}

fn default_refresh_interval() -> u64 {
    15
}

fn default_trigger_seconds() -> i64 {
    70
}

fn default_entry_seconds() -> i64 {
    60
}

fn default_refresh_ms() -> u64 {
    1000
}

fn default_max_parallel_pairs() -> usize {
    2
}

fn default_cooldown_s() -> u64 {
    120
}

fn default_miss_order_timeout_s() -> u64 {
    10
}

fn default_ws_timeout_seconds() -> u64 {
    30
}

fn default_leverage() -> f64 {
    5.0
}

fn default_capital_fraction() -> f64 {
    0.2
}

fn default_min_notional_usd() -> f64 {
    10.0
}

fn default_account_equity_fallback() -> f64 {
    10_000.0
}

fn default_max_open_positions() -> usize {
    2
}

fn default_max_trades_per_day() -> u32 {
    50
}

fn default_debug_ws_inactivity_s() -> u64 {
    10
}

// =============================================================================
// Sections
// =============================================================================

/// Fast-path (turbo) parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurboConfig {
    /// Master switch.
    #[serde(default)]
    pub enabled: bool,

    /// Activate a symbol when time-to-funding drops to this many seconds.
    #[serde(default = "default_trigger_seconds")]
    pub trigger_seconds: i64,

    /// Order-placement gate inside the active loop.
    #[serde(default = "default_entry_seconds")]
    pub entry_seconds: i64,

    /// Loop period per active symbol.
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,

    /// Cap on concurrently active symbols.
    #[serde(default = "default_max_parallel_pairs")]
    pub max_parallel_pairs: usize,

    /// Post-exit embargo per symbol.
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: u64,

    /// Cancel the resting order and exit when a live filter breaks.
    #[serde(default = "default_true")]
    pub cancel_on_filter_break: bool,

    /// Entry-unfilled timeout.
    #[serde(default = "default_miss_order_timeout_s")]
    pub miss_order_timeout_s: u64,

    /// When false, a running turbo is not deactivated just because the
    /// symbol dropped out of the top-N mid cycle.
    #[serde(default)]
    pub allow_midcycle_topn_switch: bool,

    /// Max wait for the first streaming tick on a symbol.
    #[serde(default = "default_ws_timeout_seconds")]
    pub ws_timeout_seconds: u64,
}

impl Default for TurboConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_seconds: default_trigger_seconds(),
            entry_seconds: default_entry_seconds(),
            refresh_ms: default_refresh_ms(),
            max_parallel_pairs: default_max_parallel_pairs(),
            cooldown_s: default_cooldown_s(),
            cancel_on_filter_break: true,
            miss_order_timeout_s: default_miss_order_timeout_s(),
            allow_midcycle_topn_switch: false,
            ws_timeout_seconds: default_ws_timeout_seconds(),
        }
    }
}

/// How the exit order is placed at the funding settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOrderType {
    LimitPostOnly,
    Market,
}

impl Default for ExitOrderType {
    fn default() -> Self {
        ExitOrderType::LimitPostOnly
    }
}

/// Which book side anchors the passive entry price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricePolicy {
    BestBid,
    BestAsk,
    Mid,
}

impl Default for PricePolicy {
    fn default() -> Self {
        PricePolicy::BestBid
    }
}

/// Order sizing and placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionsConfig {
    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// Fraction of equity committed per entry.
    #[serde(default = "default_capital_fraction")]
    pub capital_fraction: f64,

    #[serde(default = "default_true")]
    pub post_only: bool,

    #[serde(default = "default_true")]
    pub close_at_funding: bool,

    #[serde(default = "default_true")]
    pub reduce_only_on_exit: bool,

    #[serde(default)]
    pub exit_order_type: ExitOrderType,

    #[serde(default)]
    pub price_policy: PricePolicy,

    /// Passive offset applied to the anchor price, in basis points.
    #[serde(default)]
    pub maker_offset_bps: f64,

    /// Entries below this notional are abandoned.
    #[serde(default = "default_min_notional_usd")]
    pub min_notional_usd: f64,

    /// Used only when the wallet-balance call fails.
    #[serde(default = "default_account_equity_fallback")]
    pub account_equity_fallback: f64,
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            capital_fraction: default_capital_fraction(),
            post_only: true,
            close_at_funding: true,
            reduce_only_on_exit: true,
            exit_order_type: ExitOrderType::default(),
            price_policy: PricePolicy::default(),
            maker_offset_bps: 0.0,
            min_notional_usd: default_min_notional_usd(),
            account_equity_fallback: default_account_equity_fallback(),
        }
    }
}

/// Trading caps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskConfig {
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,

    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
            max_trades_per_day: default_max_trades_per_day(),
        }
    }
}

/// Diagnostics verbosity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug_logs: bool,

    /// Enables raw-frame tracing and the per-topic inactivity watchdog.
    #[serde(default)]
    pub debug_ws: bool,

    #[serde(default = "default_debug_ws_inactivity_s")]
    pub debug_ws_inactivity_s: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug_logs: false,
            debug_ws: false,
            debug_ws_inactivity_s: default_debug_ws_inactivity_s(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Borealis engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Use the Bybit testnet endpoints.
    #[serde(default = "default_true")]
    pub testnet: bool,

    /// Which category maps to fetch.
    #[serde(default)]
    pub categorie: CategorySelection,

    // --- Filter bounds (None disables the bound) -----------------------------
    #[serde(default)]
    pub funding_min: Option<f64>,

    #[serde(default)]
    pub funding_max: Option<f64>,

    /// Legacy raw volume floor in quote currency.
    #[serde(default)]
    pub volume_min: Option<f64>,

    /// Volume floor in millions; takes precedence over `volume_min`.
    #[serde(default)]
    pub volume_min_millions: Option<f64>,

    /// Max spread fraction; must lie in [0, 1].
    #[serde(default)]
    pub spread_max: Option<f64>,

    #[serde(default)]
    pub volatility_min: Option<f64>,

    #[serde(default)]
    pub volatility_max: Option<f64>,

    /// Funding-time window bounds, minutes, each in [0, 1440].
    #[serde(default)]
    pub funding_time_min_minutes: Option<u32>,

    #[serde(default)]
    pub funding_time_max_minutes: Option<u32>,

    /// Pre-score soft cap in (0, 1000].
    #[serde(default = "default_limite")]
    pub limite: usize,

    /// Volatility cache TTL in [10, 3600] seconds.
    #[serde(default = "default_volatility_ttl_sec")]
    pub volatility_ttl_sec: u64,

    /// Periodic full-refresh cadence; 0 disables, else [60, 86400] seconds.
    #[serde(default)]
    pub refresh_watchlist_interval: u64,

    /// Re-rank cadence in seconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub turbo: TurboConfig,

    #[serde(default)]
    pub positions: PositionsConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes via defaults")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file, apply environment overrides and
    /// validate. Returns an error the caller treats as fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config.apply_env_overrides();
        config.validate()?;

        info!(
            path = %path.display(),
            categorie = %config.categorie,
            testnet = config.testnet,
            turbo_enabled = config.turbo.enabled,
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Defaults + environment overrides, validated. Used when no config
    /// file exists.
    pub fn from_defaults() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Persist the current configuration using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runtime config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Environment variables take precedence over file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BOREALIS_TESTNET") {
            if let Ok(b) = v.parse::<bool>() {
                self.testnet = b;
            }
        }
        if let Ok(v) = std::env::var("BOREALIS_CATEGORY") {
            match v.to_lowercase().as_str() {
                "linear" => self.categorie = CategorySelection::Linear,
                "inverse" => self.categorie = CategorySelection::Inverse,
                "both" => self.categorie = CategorySelection::Both,
                _ => {}
            }
        }
        Self::env_f64("BOREALIS_FUNDING_MIN", &mut self.funding_min);
        Self::env_f64("BOREALIS_FUNDING_MAX", &mut self.funding_max);
        Self::env_f64("BOREALIS_VOLUME_MIN_MILLIONS", &mut self.volume_min_millions);
        Self::env_f64("BOREALIS_SPREAD_MAX", &mut self.spread_max);
        Self::env_f64("BOREALIS_VOLATILITY_MIN", &mut self.volatility_min);
        Self::env_f64("BOREALIS_VOLATILITY_MAX", &mut self.volatility_max);
        if let Ok(v) = std::env::var("BOREALIS_LIMIT") {
            if let Ok(n) = v.parse::<usize>() {
                self.limite = n;
            }
        }
        if let Ok(v) = std::env::var("BOREALIS_REFRESH_WATCHLIST_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.refresh_watchlist_interval = n;
            }
        }
    }

    fn env_f64(key: &str, slot: &mut Option<f64>) {
        if let Ok(v) = std::env::var(key) {
            if let Ok(n) = v.parse::<f64>() {
                *slot = Some(n);
            }
        }
    }

    /// Validate the whole configuration, collecting every violation.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let (Some(min), Some(max)) = (self.funding_min, self.funding_max) {
            if min > max {
                errors.push(format!("funding_min ({min}) exceeds funding_max ({max})"));
            }
        }
        if let (Some(min), Some(max)) = (self.volatility_min, self.volatility_max) {
            if min > max {
                errors.push(format!(
                    "volatility_min ({min}) exceeds volatility_max ({max})"
                ));
            }
        }
        for (name, value) in [
            ("funding_min", self.funding_min),
            ("funding_max", self.funding_max),
            ("volatility_min", self.volatility_min),
            ("volatility_max", self.volatility_max),
            ("volume_min", self.volume_min),
            ("volume_min_millions", self.volume_min_millions),
        ] {
            if let Some(v) = value {
                if v < 0.0 {
                    errors.push(format!("{name} cannot be negative ({v})"));
                }
            }
        }
        if let Some(s) = self.spread_max {
            if !(0.0..=1.0).contains(&s) {
                errors.push(format!("spread_max must lie in [0, 1] ({s})"));
            }
        }
        for (name, value) in [
            ("funding_time_min_minutes", self.funding_time_min_minutes),
            ("funding_time_max_minutes", self.funding_time_max_minutes),
        ] {
            if let Some(v) = value {
                if v > 1440 {
                    errors.push(format!("{name} exceeds 1440 minutes ({v})"));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.funding_time_min_minutes, self.funding_time_max_minutes)
        {
            if min > max {
                errors.push(format!(
                    "funding_time_min_minutes ({min}) exceeds funding_time_max_minutes ({max})"
                ));
            }
        }
        if self.limite == 0 || self.limite > 1000 {
            errors.push(format!("limite must lie in (0, 1000] ({})", self.limite));
        }
        if !(10..=3600).contains(&self.volatility_ttl_sec) {
            errors.push(format!(
                "volatility_ttl_sec must lie in [10, 3600] ({})",
                self.volatility_ttl_sec
            ));
        }
        if self.refresh_watchlist_interval != 0
            && !(60..=86_400).contains(&self.refresh_watchlist_interval)
        {
            errors.push(format!(
                "refresh_watchlist_interval must be 0 or in [60, 86400] ({})",
                self.refresh_watchlist_interval
            ));
        }
        if self.refresh_interval == 0 {
            errors.push("refresh_interval must be positive".to_string());
        }
        if self.scoring.top_n == 0 {
            errors.push("scoring.top_n must be positive".to_string());
        }

        // Turbo section.
        if self.turbo.trigger_seconds <= 0 {
            errors.push(format!(
                "turbo.trigger_seconds must be positive ({})",
                self.turbo.trigger_seconds
            ));
        }
        if self.turbo.entry_seconds <= 0 {
            errors.push(format!(
                "turbo.entry_seconds must be positive ({})",
                self.turbo.entry_seconds
            ));
        }
        if self.turbo.entry_seconds > self.turbo.trigger_seconds {
            errors.push(format!(
                "turbo.entry_seconds ({}) exceeds turbo.trigger_seconds ({})",
                self.turbo.entry_seconds, self.turbo.trigger_seconds
            ));
        }
        if self.turbo.refresh_ms == 0 {
            errors.push("turbo.refresh_ms must be positive".to_string());
        }
        if self.turbo.max_parallel_pairs == 0 {
            errors.push("turbo.max_parallel_pairs must be positive".to_string());
        }

        // Positions section.
        if self.positions.leverage <= 0.0 {
            errors.push(format!(
                "positions.leverage must be positive ({})",
                self.positions.leverage
            ));
        }
        if !(0.0..=1.0).contains(&self.positions.capital_fraction)
            || self.positions.capital_fraction == 0.0
        {
            errors.push(format!(
                "positions.capital_fraction must lie in (0, 1] ({})",
                self.positions.capital_fraction
            ));
        }
        if self.positions.maker_offset_bps < 0.0 {
            errors.push(format!(
                "positions.maker_offset_bps cannot be negative ({})",
                self.positions.maker_offset_bps
            ));
        }
        if self.positions.min_notional_usd < 0.0 {
            errors.push(format!(
                "positions.min_notional_usd cannot be negative ({})",
                self.positions.min_notional_usd
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "invalid configuration:\n{}",
                errors
                    .iter()
                    .map(|e| format!("  - {e}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        }
    }

    /// Filter thresholds consumed by the pure pipeline.
    pub fn filter_params(&self) -> FilterParams {
        FilterParams {
            funding_min: self.funding_min,
            funding_max: self.funding_max,
            volume_min: self.volume_min,
            volume_min_millions: self.volume_min_millions,
            spread_max: self.spread_max,
            volatility_min: self.volatility_min,
            volatility_max: self.volatility_max,
            funding_time_min_minutes: self.funding_time_min_minutes,
            funding_time_max_minutes: self.funding_time_max_minutes,
            limit: Some(self.limite),
        }
    }
}
