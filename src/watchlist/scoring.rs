// =============================================================================
// Scoring Engine — composite score and top-N ranking
// =============================================================================
//
//   score = w_f·funding + w_v·ln(max(volume, 1)) − w_s·spread − w_vol·vol
//
// Funding, spread and volatility enter as plain fractions; volume in quote
// currency. Missing spread/volatility contribute a zero penalty.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Candidate;

/// Composite score coefficients and the final selection size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    #[serde(default = "default_weight_funding")]
    pub weight_funding: f64,
    #[serde(default = "default_weight_volume")]
    pub weight_volume: f64,
    #[serde(default = "default_weight_spread")]
    pub weight_spread: f64,
    #[serde(default = "default_weight_volatility")]
    pub weight_volatility: f64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_weight_funding() -> f64 {
    1000.0
}

fn default_weight_volume() -> f64 {
    10.0
}

fn default_weight_spread() -> f64 {
    200.0
}

fn default_weight_volatility() -> f64 {
    50.0
}

fn default_top_n() -> usize {
    1
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weight_funding: default_weight_funding(),
            weight_volume: default_weight_volume(),
            weight_spread: default_weight_spread(),
            weight_volatility: default_weight_volatility(),
            top_n: default_top_n(),
        }
    }
}

/// Stateless scoring engine.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Deterministic composite score. `ln` clamps at ln(1)=0 when the
    /// volume is non-positive.
    pub fn compute_score(&self, funding: f64, volume: f64, spread: f64, volatility: f64) -> f64 {
        let log_volume = volume.max(1.0).ln();
        let c = &self.config;
        c.weight_funding * funding + c.weight_volume * log_volume
            - c.weight_spread * spread
            - c.weight_volatility * volatility
    }

    /// Score every candidate, sort descending and keep the top N. Ties
    /// break by |funding| descending, then symbol ascending.
    pub fn rank_candidates(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        if candidates.is_empty() {
            return candidates;
        }

        let mut scored: Vec<Candidate> = candidates
            .into_iter()
            .map(|mut c| {
                let score = self.compute_score(
                    c.funding_rate,
                    c.turnover_24h,
                    c.spread.unwrap_or(0.0),
                    c.volatility.unwrap_or(0.0),
                );
                c.score = Some(score);
                c
            })
            .collect();

        scored.sort_by(|a, b| {
            let sa = a.score.unwrap_or(f64::MIN);
            let sb = b.score.unwrap_or(f64::MIN);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.funding_rate
                        .abs()
                        .partial_cmp(&a.funding_rate.abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        scored.truncate(self.config.top_n);
        debug!(selected = scored.len(), "ranking complete");
        scored
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ScoringEngine {
        ScoringEngine::new(ScoringConfig {
            weight_funding: 1000.0,
            weight_volume: 10.0,
            weight_spread: 200.0,
            weight_volatility: 50.0,
            top_n: 2,
        })
    }

    fn candidate(symbol: &str, funding: f64, volume: f64, spread: f64, vol: f64) -> Candidate {
        Candidate {
            symbol: symbol.to_string(),
            funding_rate: funding,
            turnover_24h: volume,
            funding_time: "-".to_string(),
            spread: Some(spread),
            volatility: Some(vol),
            score: None,
        }
    }

    #[test]
    fn score_matches_formula() {
        let e = engine();
        let score = e.compute_score(0.0005, 1_000_000.0, 0.002, 0.01);
        let expected = 1000.0 * 0.0005 + 10.0 * 1_000_000f64.ln() - 200.0 * 0.002 - 50.0 * 0.01;
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn score_is_deterministic() {
        let e = engine();
        let a = e.compute_score(0.0003, 55e6, 0.0011, 0.004);
        let b = e.compute_score(0.0003, 55e6, 0.0011, 0.004);
        assert_eq!(a, b);
    }

    #[test]
    fn ln_clamps_at_zero_volume() {
        let e = engine();
        let zero = e.compute_score(0.0, 0.0, 0.0, 0.0);
        let negative = e.compute_score(0.0, -5.0, 0.0, 0.0);
        assert_eq!(zero, 0.0);
        assert_eq!(negative, 0.0);
    }

    #[test]
    fn ranking_sorts_descending_and_truncates() {
        let e = engine();
        let ranked = e.rank_candidates(vec![
            candidate("LOW", 0.0001, 10e6, 0.001, 0.01),
            candidate("HIGH", 0.002, 500e6, 0.0005, 0.005),
            candidate("MID", 0.0008, 100e6, 0.001, 0.01),
        ]);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].symbol, "HIGH");
        assert_eq!(ranked[1].symbol, "MID");
        assert!(ranked[0].score.unwrap() > ranked[1].score.unwrap());
    }

    #[test]
    fn ties_break_by_abs_funding_then_symbol() {
        let e = ScoringEngine::new(ScoringConfig {
            weight_funding: 0.0,
            weight_volume: 0.0,
            weight_spread: 0.0,
            weight_volatility: 0.0,
            top_n: 3,
        });
        // All scores are zero; order must come from |funding| then symbol.
        let ranked = e.rank_candidates(vec![
            candidate("ZZZ", 0.001, 1e6, 0.0, 0.0),
            candidate("AAA", 0.001, 1e6, 0.0, 0.0),
            candidate("MMM", 0.005, 1e6, 0.0, 0.0),
        ]);
        let symbols: Vec<&str> = ranked.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["MMM", "AAA", "ZZZ"]);
    }

    #[test]
    fn missing_penalties_are_zero_not_exclusion() {
        let e = engine();
        let mut c = candidate("BTCUSDT", 0.001, 100e6, 0.0, 0.0);
        c.spread = None;
        c.volatility = None;
        let ranked = e.rank_candidates(vec![c]);
        assert_eq!(ranked.len(), 1);
        let with_zero = e.compute_score(0.001, 100e6, 0.0, 0.0);
        assert!((ranked[0].score.unwrap() - with_zero).abs() < 1e-12);
    }

    #[test]
    fn empty_input_ranks_to_empty() {
        assert!(engine().rank_candidates(Vec::new()).is_empty());
    }

    #[test]
    fn default_config_values() {
        let c = ScoringConfig::default();
        assert_eq!(c.weight_funding, 1000.0);
        assert_eq!(c.weight_volume, 10.0);
        assert_eq!(c.weight_spread, 200.0);
        assert_eq!(c.weight_volatility, 50.0);
        assert_eq!(c.top_n, 1);
    }
}
