// =============================================================================
// Shared Types — Borealis Perp Nexus
// =============================================================================

use serde::{Deserialize, Serialize};

/// Contract family of a perpetual symbol. Linear and inverse contracts live
/// on distinct public streaming endpoints and are fetched separately over
/// REST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Linear,
    Inverse,
}

impl Category {
    /// Query-string value expected by the Bybit v5 REST API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Linear => "linear",
            Category::Inverse => "inverse",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which categories the watchlist should scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategorySelection {
    Linear,
    Inverse,
    Both,
}

impl CategorySelection {
    /// Concrete categories covered by this selection.
    pub fn categories(&self) -> Vec<Category> {
        match self {
            CategorySelection::Linear => vec![Category::Linear],
            CategorySelection::Inverse => vec![Category::Inverse],
            CategorySelection::Both => vec![Category::Linear, Category::Inverse],
        }
    }
}

impl Default for CategorySelection {
    fn default() -> Self {
        CategorySelection::Linear
    }
}

impl std::fmt::Display for CategorySelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CategorySelection::Linear => "linear",
            CategorySelection::Inverse => "inverse",
            CategorySelection::Both => "both",
        };
        f.write_str(s)
    }
}

/// Order side as expected by the Bybit v5 order endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-symbol entry of the REST funding map.
#[derive(Debug, Clone, PartialEq)]
pub struct FundingInfo {
    /// Funding rate as a plain fraction (0.0001 = 0.01%).
    pub funding_rate: f64,
    /// 24h turnover in quote currency.
    pub turnover_24h: f64,
    /// Next funding settlement as delivered by the API (epoch ms string).
    pub next_funding_time: Option<String>,
}

/// A symbol that survived the filter pipeline. `score` is populated by the
/// ranking stage only.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub symbol: String,
    pub funding_rate: f64,
    pub turnover_24h: f64,
    /// Time to funding formatted as "Hh Mm Ss" (empty higher units dropped).
    pub funding_time: String,
    /// Spread as a fraction of the mid price; None when never evaluated.
    pub spread: Option<f64>,
    /// Realized volatility fraction; None when the cache had no entry.
    pub volatility: Option<f64>,
    pub score: Option<f64>,
}

impl Candidate {
    pub fn new(symbol: impl Into<String>, funding_rate: f64, turnover_24h: f64) -> Self {
        Self {
            symbol: symbol.into(),
            funding_rate,
            turnover_24h,
            funding_time: "-".to_string(),
            spread: None,
            volatility: None,
            score: None,
        }
    }
}

/// Tick/lot constraints for one instrument, sourced from instruments-info.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentLimits {
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_order_qty: f64,
}

impl Default for InstrumentLimits {
    fn default() -> Self {
        Self {
            tick_size: 0.01,
            qty_step: 0.001,
            min_order_qty: 0.001,
        }
    }
}

/// Round `value` down to the nearest multiple of `step`. Used for both price
/// (tick size) and quantity (lot size) so orders never violate instrument
/// precision rules.
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let scaled = (value / step).floor();
    // Re-quantize through the step's decimal precision to avoid float dust
    // like 0.30000000000000004.
    let decimals = step_decimals(step);
    let raw = scaled * step;
    let factor = 10f64.powi(decimals as i32);
    (raw * factor).round() / factor
}

fn step_decimals(step: f64) -> u32 {
    let mut decimals = 0u32;
    let mut s = step;
    while s.fract().abs() > 1e-9 && decimals < 10 {
        s *= 10.0;
        decimals += 1;
    }
    decimals
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_serde() {
        let cat: Category = serde_json::from_str("\"linear\"").unwrap();
        assert_eq!(cat, Category::Linear);
        assert_eq!(serde_json::to_string(&Category::Inverse).unwrap(), "\"inverse\"");
    }

    #[test]
    fn selection_expands_to_categories() {
        assert_eq!(CategorySelection::Linear.categories(), vec![Category::Linear]);
        assert_eq!(
            CategorySelection::Both.categories(),
            vec![Category::Linear, Category::Inverse]
        );
    }

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.to_string(), "Buy");
    }

    #[test]
    fn round_to_step_quantizes_down() {
        assert!((round_to_step(0.1234, 0.001) - 0.123).abs() < 1e-12);
        assert!((round_to_step(27123.7, 0.5) - 27123.5).abs() < 1e-9);
        assert!((round_to_step(5.0, 0.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn round_to_step_never_rounds_up() {
        assert!((round_to_step(0.9999, 0.01) - 0.99).abs() < 1e-12);
        assert!((round_to_step(10.0, 3.0) - 9.0).abs() < 1e-12);
    }
}
