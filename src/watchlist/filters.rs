// =============================================================================
// Watchlist Filters — pure filter pipeline and funding-time arithmetic
// =============================================================================
//
// No I/O in this module. Every function takes its inputs (including "now")
// explicitly so the pipeline is deterministic under test.
//
// Funding settlements are fixed 8h apart. A stored next-funding instant that
// already passed is advanced by whole intervals until strictly in the
// future before any remainder is computed.
// =============================================================================

use std::collections::{HashMap, HashSet};

use crate::types::{Candidate, FundingInfo};
use crate::volatility::VolatilityCache;

/// Fixed funding interval on the exchange.
pub const FUNDING_INTERVAL_S: i64 = 8 * 3600;

// ---------------------------------------------------------------------------
// Funding-time arithmetic
// ---------------------------------------------------------------------------

/// Normalize a next-funding representation to UTC epoch seconds. Accepts
/// epoch milliseconds (integer or decimal string) and ISO-8601 strings.
pub fn parse_next_funding(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Numeric forms are epoch milliseconds.
    if let Ok(ms) = trimmed.parse::<i64>() {
        return Some(ms / 1000);
    }
    if let Ok(ms) = trimmed.parse::<f64>() {
        if ms.is_finite() && ms > 0.0 {
            return Some((ms / 1000.0) as i64);
        }
        return None;
    }

    // ISO-8601 / RFC 3339.
    let normalized = trimmed.replace('Z', "+00:00");
    chrono::DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Advance `funding_s` by whole 8h intervals until it lies strictly after
/// `now_s`. The result stays congruent to the input modulo the interval.
pub fn advance_to_future(funding_s: i64, now_s: i64) -> i64 {
    if funding_s > now_s {
        return funding_s;
    }
    let behind = now_s - funding_s;
    let intervals = behind / FUNDING_INTERVAL_S + 1;
    funding_s + intervals * FUNDING_INTERVAL_S
}

/// Seconds until the nearest future settlement, from any accepted
/// representation. Always strictly positive when Some.
pub fn seconds_remaining(raw: &str, now_s: i64) -> Option<i64> {
    let funding_s = parse_next_funding(raw)?;
    Some(advance_to_future(funding_s, now_s) - now_s)
}

/// Minutes until the nearest future settlement, for the time-window filter.
pub fn minutes_remaining(raw: &str, now_s: i64) -> Option<f64> {
    seconds_remaining(raw, now_s).map(|s| s as f64 / 60.0)
}

/// Format a positive remainder as "Hh Mm Ss", suppressing empty higher
/// units ("5m 3s", "42s").
pub fn format_funding_time(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Format the remainder for a raw next-funding value, "-" when unusable.
pub fn format_remaining(raw: Option<&str>, now_s: i64) -> String {
    raw.and_then(|r| seconds_remaining(r, now_s))
        .map(format_funding_time)
        .unwrap_or_else(|| "-".to_string())
}

/// Parse a formatted remainder back into seconds. Accepts every shape
/// [`format_funding_time`] produces plus the compact variants "2h30m",
/// "1m30s", "45s" and a bare "2h".
pub fn parse_funding_time(text: &str) -> Option<i64> {
    let s = text.trim();
    if s.is_empty() || s == "-" {
        return None;
    }

    let mut total: i64 = 0;
    let mut value: i64 = 0;
    let mut has_digit = false;
    let mut matched_unit = false;

    for c in s.chars() {
        match c {
            '0'..='9' => {
                value = value * 10 + (c as i64 - '0' as i64);
                has_digit = true;
            }
            'h' => {
                if !has_digit {
                    return None;
                }
                total += value * 3600;
                value = 0;
                has_digit = false;
                matched_unit = true;
            }
            'm' => {
                if !has_digit {
                    return None;
                }
                total += value * 60;
                value = 0;
                has_digit = false;
                matched_unit = true;
            }
            's' => {
                if !has_digit {
                    return None;
                }
                total += value;
                value = 0;
                has_digit = false;
                matched_unit = true;
            }
            ' ' => {}
            _ => return None,
        }
    }

    // Trailing digits without a unit mean a malformed string.
    if has_digit || !matched_unit {
        return None;
    }
    Some(total)
}

// ---------------------------------------------------------------------------
// Filter pipeline
// ---------------------------------------------------------------------------

/// Threshold set applied by the pipeline. A None bound is inactive.
#[derive(Debug, Clone, Default)]
pub struct FilterParams {
    pub funding_min: Option<f64>,
    pub funding_max: Option<f64>,
    pub volume_min: Option<f64>,
    pub volume_min_millions: Option<f64>,
    pub spread_max: Option<f64>,
    pub volatility_min: Option<f64>,
    pub volatility_max: Option<f64>,
    pub funding_time_min_minutes: Option<u32>,
    pub funding_time_max_minutes: Option<u32>,
    /// Pre-score soft cap applied after the funding/volume/time stage.
    pub limit: Option<usize>,
}

impl FilterParams {
    /// Effective volume floor in quote currency; millions take precedence
    /// over the legacy raw value.
    pub fn effective_volume_min(&self) -> Option<f64> {
        self.volume_min_millions
            .map(|m| m * 1_000_000.0)
            .or(self.volume_min)
    }
}

/// Stage 1: retain symbols present in both the perpetual universe and the
/// funding map.
pub fn stage_universe<'a>(
    universe: &HashSet<String>,
    funding_map: &'a HashMap<String, FundingInfo>,
) -> Vec<(&'a String, &'a FundingInfo)> {
    funding_map
        .iter()
        .filter(|(symbol, _)| universe.contains(*symbol))
        .collect()
}

/// Stage 2: funding bounds, volume floor and funding-time window, then sort
/// by |funding| descending (symbol ascending on ties) and truncate to the
/// pre-score cap.
pub fn stage_funding_volume_time(
    entries: Vec<(&String, &FundingInfo)>,
    params: &FilterParams,
    now_s: i64,
) -> Vec<Candidate> {
    let volume_floor = params.effective_volume_min();
    let time_filter_active =
        params.funding_time_min_minutes.is_some() || params.funding_time_max_minutes.is_some();

    let mut kept = Vec::new();
    for (symbol, info) in entries {
        let abs_funding = info.funding_rate.abs();
        if params.funding_min.is_some_and(|min| abs_funding < min) {
            continue;
        }
        if params.funding_max.is_some_and(|max| abs_funding > max) {
            continue;
        }
        if volume_floor.is_some_and(|min| info.turnover_24h < min) {
            continue;
        }

        if time_filter_active {
            let minutes = info
                .next_funding_time
                .as_deref()
                .and_then(|raw| minutes_remaining(raw, now_s));
            // Filtering on a window requires a usable timestamp.
            let Some(minutes) = minutes else { continue };
            if params
                .funding_time_min_minutes
                .is_some_and(|min| minutes < min as f64)
            {
                continue;
            }
            if params
                .funding_time_max_minutes
                .is_some_and(|max| minutes > max as f64)
            {
                continue;
            }
        }

        let mut candidate = Candidate::new(symbol.clone(), info.funding_rate, info.turnover_24h);
        candidate.funding_time = format_remaining(info.next_funding_time.as_deref(), now_s);
        kept.push(candidate);
    }

    kept.sort_by(|a, b| {
        b.funding_rate
            .abs()
            .partial_cmp(&a.funding_rate.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    if let Some(limit) = params.limit {
        kept.truncate(limit);
    }
    kept
}

/// Stage 3: attach spreads and drop candidates above `spread_max`. With no
/// threshold, spreads are attached where known and nothing is dropped. With
/// a threshold, a candidate whose spread could not be determined is dropped
/// as well.
pub fn stage_spread(
    candidates: Vec<Candidate>,
    spreads: &HashMap<String, f64>,
    spread_max: Option<f64>,
) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter_map(|mut c| {
            let spread = spreads.get(&c.symbol).copied();
            match spread_max {
                None => {
                    c.spread = spread;
                    Some(c)
                }
                Some(max) => match spread {
                    Some(s) if s <= max => {
                        c.spread = Some(s);
                        Some(c)
                    }
                    _ => None,
                },
            }
        })
        .collect()
}

/// Stage 4: attach cached volatility and apply the bounds. An unknown
/// volatility keeps the candidate eligible.
pub fn stage_volatility(
    candidates: Vec<Candidate>,
    cache: &VolatilityCache,
    volatility_min: Option<f64>,
    volatility_max: Option<f64>,
) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter_map(|mut c| {
            let vol = cache.get(&c.symbol);
            c.volatility = vol;
            if let Some(v) = vol {
                if volatility_min.is_some_and(|min| v < min) {
                    return None;
                }
                if volatility_max.is_some_and(|max| v > max) {
                    return None;
                }
            }
            Some(c)
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn info(funding: f64, volume: f64, next_ms: Option<i64>) -> FundingInfo {
        FundingInfo {
            funding_rate: funding,
            turnover_24h: volume,
            next_funding_time: next_ms.map(|ms| ms.to_string()),
        }
    }

    // ── time arithmetic ─────────────────────────────────────────────────

    #[test]
    fn parse_next_funding_accepts_all_representations() {
        assert_eq!(parse_next_funding("1700000000000"), Some(1_700_000_000));
        assert_eq!(parse_next_funding("1700000000000.0"), Some(1_700_000_000));
        assert_eq!(
            parse_next_funding("2023-11-14T22:13:20Z"),
            Some(1_700_000_000)
        );
        assert_eq!(
            parse_next_funding("2023-11-14T22:13:20+00:00"),
            Some(1_700_000_000)
        );
        assert_eq!(parse_next_funding(""), None);
        assert_eq!(parse_next_funding("not-a-time"), None);
    }

    #[test]
    fn advance_keeps_future_instants_untouched() {
        assert_eq!(advance_to_future(NOW + 100, NOW), NOW + 100);
    }

    #[test]
    fn advance_is_congruent_modulo_interval() {
        for behind in [1i64, 300, 3600, 28_800, 90_000, 500_000] {
            let t = NOW - behind;
            let advanced = advance_to_future(t, NOW);
            assert!(advanced > NOW, "behind={behind}");
            assert_eq!((advanced - t) % FUNDING_INTERVAL_S, 0, "behind={behind}");
            assert!(advanced - NOW <= FUNDING_INTERVAL_S, "behind={behind}");
        }
    }

    #[test]
    fn rollover_five_minutes_past_gives_about_7h55m() {
        let five_min_ago_ms = (NOW - 300) * 1000;
        let remaining = seconds_remaining(&five_min_ago_ms.to_string(), NOW).unwrap();
        assert_eq!(remaining, FUNDING_INTERVAL_S - 300); // 7h 55m
        assert_eq!(format_funding_time(remaining), "7h 55m 0s");
    }

    #[test]
    fn rollover_25_hours_past_gives_about_7h() {
        let ms = (NOW - 25 * 3600) * 1000;
        let remaining = seconds_remaining(&ms.to_string(), NOW).unwrap();
        // 25h behind = 3 full intervals + 1h; next settlement in 7h.
        assert_eq!(remaining, 7 * 3600);
    }

    #[test]
    fn format_suppresses_empty_higher_units() {
        assert_eq!(format_funding_time(2 * 3600 + 16 * 60 + 8), "2h 16m 8s");
        assert_eq!(format_funding_time(5 * 60 + 3), "5m 3s");
        assert_eq!(format_funding_time(42), "42s");
        assert_eq!(format_funding_time(0), "0s");
    }

    #[test]
    fn parse_format_round_trip_at_second_resolution() {
        for x in [0i64, 1, 59, 60, 61, 3599, 3600, 3661, 7 * 3600 + 55 * 60, 28_799] {
            assert_eq!(parse_funding_time(&format_funding_time(x)), Some(x), "x={x}");
        }
    }

    #[test]
    fn parse_accepts_compact_variants() {
        assert_eq!(parse_funding_time("2h30m"), Some(2 * 3600 + 30 * 60));
        assert_eq!(parse_funding_time("1m30s"), Some(90));
        assert_eq!(parse_funding_time("45s"), Some(45));
        assert_eq!(parse_funding_time("2h"), Some(7200));
        assert_eq!(parse_funding_time("2h 16m 8s"), Some(2 * 3600 + 16 * 60 + 8));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_funding_time("-"), None);
        assert_eq!(parse_funding_time(""), None);
        assert_eq!(parse_funding_time("soon"), None);
        assert_eq!(parse_funding_time("12"), None);
        assert_eq!(parse_funding_time("h"), None);
    }

    // ── pipeline stages ─────────────────────────────────────────────────

    fn universe(symbols: &[&str]) -> HashSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn universe_join_keeps_intersection() {
        let mut funding_map = HashMap::new();
        funding_map.insert("BTCUSDT".to_string(), info(0.0001, 1e9, None));
        funding_map.insert("DELISTED".to_string(), info(0.01, 1e9, None));

        let joined = stage_universe(&universe(&["BTCUSDT", "ETHUSDT"]), &funding_map);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].0, "BTCUSDT");
    }

    #[test]
    fn funding_bounds_apply_to_absolute_value() {
        let mut funding_map = HashMap::new();
        funding_map.insert("POS".to_string(), info(0.0005, 1e9, None));
        funding_map.insert("NEG".to_string(), info(-0.0005, 1e9, None));
        funding_map.insert("SMALL".to_string(), info(0.00001, 1e9, None));

        let params = FilterParams {
            funding_min: Some(0.0001),
            ..Default::default()
        };
        let entries = stage_universe(&universe(&["POS", "NEG", "SMALL"]), &funding_map);
        let kept = stage_funding_volume_time(entries, &params, NOW);
        let symbols: Vec<&str> = kept.iter().map(|c| c.symbol.as_str()).collect();
        assert!(symbols.contains(&"POS"));
        assert!(symbols.contains(&"NEG"));
        assert!(!symbols.contains(&"SMALL"));
    }

    #[test]
    fn volume_millions_takes_precedence_over_legacy() {
        let params = FilterParams {
            volume_min: Some(1.0),
            volume_min_millions: Some(50.0),
            ..Default::default()
        };
        assert_eq!(params.effective_volume_min(), Some(50_000_000.0));

        let legacy_only = FilterParams {
            volume_min: Some(750_000.0),
            ..Default::default()
        };
        assert_eq!(legacy_only.effective_volume_min(), Some(750_000.0));
    }

    #[test]
    fn volume_floor_drops_thin_symbols() {
        let mut funding_map = HashMap::new();
        funding_map.insert("FAT".to_string(), info(0.001, 100e6, None));
        funding_map.insert("THIN".to_string(), info(0.001, 1e6, None));

        let params = FilterParams {
            volume_min_millions: Some(50.0),
            ..Default::default()
        };
        let entries = stage_universe(&universe(&["FAT", "THIN"]), &funding_map);
        let kept = stage_funding_volume_time(entries, &params, NOW);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].symbol, "FAT");
    }

    #[test]
    fn time_window_requires_parseable_timestamp() {
        let mut funding_map = HashMap::new();
        funding_map.insert("IN".to_string(), info(0.001, 1e9, Some((NOW + 1800) * 1000)));
        funding_map.insert("OUT".to_string(), info(0.001, 1e9, Some((NOW + 7 * 3600) * 1000)));
        funding_map.insert("NOTS".to_string(), info(0.001, 1e9, None));

        let params = FilterParams {
            funding_time_max_minutes: Some(60),
            ..Default::default()
        };
        let entries = stage_universe(&universe(&["IN", "OUT", "NOTS"]), &funding_map);
        let kept = stage_funding_volume_time(entries, &params, NOW);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].symbol, "IN");
    }

    #[test]
    fn sort_is_abs_funding_desc_then_symbol() {
        let mut funding_map = HashMap::new();
        funding_map.insert("AAA".to_string(), info(0.001, 1e9, None));
        funding_map.insert("BBB".to_string(), info(-0.002, 1e9, None));
        funding_map.insert("CCC".to_string(), info(0.001, 1e9, None));

        let entries = stage_universe(&universe(&["AAA", "BBB", "CCC"]), &funding_map);
        let kept = stage_funding_volume_time(entries, &FilterParams::default(), NOW);
        let symbols: Vec<&str> = kept.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BBB", "AAA", "CCC"]);
    }

    #[test]
    fn pre_score_cap_truncates() {
        let mut funding_map = HashMap::new();
        for i in 0..10 {
            funding_map.insert(format!("SYM{i}USDT"), info(0.001 * (i + 1) as f64, 1e9, None));
        }
        let params = FilterParams {
            limit: Some(3),
            ..Default::default()
        };
        let entries = stage_universe(
            &funding_map.keys().cloned().collect(),
            &funding_map,
        );
        let kept = stage_funding_volume_time(entries, &params, NOW);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].symbol, "SYM9USDT");
    }

    #[test]
    fn spread_stage_without_threshold_attaches_and_keeps() {
        let candidates = vec![Candidate::new("BTCUSDT", 0.001, 1e9)];
        let mut spreads = HashMap::new();
        spreads.insert("BTCUSDT".to_string(), 0.0004);

        let kept = stage_spread(candidates, &spreads, None);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].spread, Some(0.0004));
    }

    #[test]
    fn spread_stage_with_threshold_drops_wide_and_unknown() {
        let candidates = vec![
            Candidate::new("TIGHT", 0.001, 1e9),
            Candidate::new("WIDE", 0.001, 1e9),
            Candidate::new("UNKNOWN", 0.001, 1e9),
        ];
        let mut spreads = HashMap::new();
        spreads.insert("TIGHT".to_string(), 0.0004);
        spreads.insert("WIDE".to_string(), 0.02);

        let kept = stage_spread(candidates, &spreads, Some(0.003));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].symbol, "TIGHT");
    }

    #[test]
    fn volatility_stage_unknown_stays_eligible() {
        let cache = VolatilityCache::new(600);
        cache.set("CALM", 0.004);
        cache.set("WILD", 0.09);

        let candidates = vec![
            Candidate::new("CALM", 0.001, 1e9),
            Candidate::new("WILD", 0.001, 1e9),
            Candidate::new("UNKNOWN", 0.001, 1e9),
        ];
        let kept = stage_volatility(candidates, &cache, None, Some(0.05));
        let symbols: Vec<&str> = kept.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["CALM", "UNKNOWN"]);
        assert_eq!(kept[0].volatility, Some(0.004));
        assert_eq!(kept[1].volatility, None);
    }

    #[test]
    fn tightening_thresholds_never_admits_previously_rejected() {
        // Monotonicity spot-check across the funding/volume stage.
        let mut funding_map = HashMap::new();
        funding_map.insert("A".to_string(), info(0.0008, 40e6, None));
        funding_map.insert("B".to_string(), info(0.0002, 90e6, None));
        funding_map.insert("C".to_string(), info(0.0015, 10e6, None));
        let uni = universe(&["A", "B", "C"]);

        let loose = FilterParams {
            funding_min: Some(0.0001),
            volume_min_millions: Some(5.0),
            ..Default::default()
        };
        let tight = FilterParams {
            funding_min: Some(0.0005),
            volume_min_millions: Some(30.0),
            ..Default::default()
        };

        let loose_kept: HashSet<String> =
            stage_funding_volume_time(stage_universe(&uni, &funding_map), &loose, NOW)
                .into_iter()
                .map(|c| c.symbol)
                .collect();
        let tight_kept: HashSet<String> =
            stage_funding_volume_time(stage_universe(&uni, &funding_map), &tight, NOW)
                .into_iter()
                .map(|c| c.symbol)
                .collect();

        assert!(tight_kept.is_subset(&loose_kept));
    }
}
