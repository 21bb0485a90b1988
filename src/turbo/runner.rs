// =============================================================================
// Turbo Runner — the per-symbol fast loop state machine
// =============================================================================
//
// One task per active symbol, woken every `refresh_ms`. Each tick:
// snapshot -> entry gate -> fill detection -> funding exit -> miss detection
// -> filter re-validation -> eligibility check. Transient errors log and
// continue; fatal errors terminate the loop with reason `fatal_error`.
//
// The TurboState is owned exclusively by this task. Terminal reasons are
// finalized through `TurboController::finish_symbol`, which never joins.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bybit::error::{is_transient_order_code, BybitError};
use crate::bybit::order::{OrderRequest, OrderState, OrderType, TimeInForce};
use crate::runtime_config::{ExitOrderType, PricePolicy};
use crate::turbo::{StopReason, TurboController};
use crate::types::{round_to_step, Category, InstrumentLimits, Side};
use crate::watchlist::filters::parse_next_funding;
use crate::watchlist::scoring::ScoringEngine;

/// Everything a loop task needs, captured at activation.
pub(crate) struct RunnerContext {
    pub controller: Arc<TurboController>,
    pub symbol: String,
    pub category: Category,
    /// Composite score at activation, tie-break for the entry side.
    pub meta_score: Option<f64>,
    /// Time-to-funding observed at activation, countdown fallback when no
    /// fresher source is available.
    pub activation_funding_s: i64,
    pub activated_at: i64,
    pub stop: Arc<AtomicBool>,
}

/// Mutable per-symbol state, exclusively owned by the loop task.
#[derive(Debug, Default)]
pub(crate) struct TurboState {
    pub entry_sent: bool,
    /// Entry permanently given up for this activation (sizing failed or the
    /// submission retry was exhausted).
    pub entry_abandoned: bool,
    pub order_id: Option<String>,
    pub entry_attempts: u32,
    pub position_open: bool,
    pub entry_price: Option<f64>,
    pub entry_qty: Option<f64>,
    pub entry_side: Option<Side>,
    pub entry_sent_at: Option<i64>,
    pub limits: InstrumentLimits,
}

/// Point-in-time merge of fused streaming state and REST fallbacks.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub funding_time_s: Option<i64>,
    pub funding_rate: Option<f64>,
    pub volume: Option<f64>,
    pub spread: Option<f64>,
    pub volatility: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last_price: Option<f64>,
    pub score: Option<f64>,
}

/// Entry point spawned by the controller.
pub(crate) async fn run_loop(ctx: RunnerContext) {
    info!(symbol = %ctx.symbol, "turbo loop started");

    let mut state = TurboState::default();

    // Instrument precision, fetched once. Defaults are safe but coarse.
    match ctx
        .controller
        .market_client()
        .fetch_instrument_limits(ctx.category, &ctx.symbol)
        .await
    {
        Ok(limits) => state.limits = limits,
        Err(e) => {
            warn!(symbol = %ctx.symbol, error = %e, "instrument limits unavailable, using defaults");
        }
    }

    let refresh = Duration::from_millis(ctx.controller.config().turbo.refresh_ms);

    loop {
        if ctx.stop.load(Ordering::SeqCst) || ctx.controller.is_stopping() {
            // External stop owns the termination bookkeeping.
            break;
        }

        if let Some(reason) = tick_once(&ctx, &mut state).await {
            ctx.controller.finish_symbol(&ctx.symbol, reason);
            break;
        }

        tokio::time::sleep(refresh).await;
    }

    info!(symbol = %ctx.symbol, "turbo loop ended");
}

/// One pass of the state machine. Returns the terminal reason, if any.
pub(crate) async fn tick_once(ctx: &RunnerContext, state: &mut TurboState) -> Option<StopReason> {
    let snapshot = build_snapshot(ctx);

    let Some(funding_time_s) = snapshot.funding_time_s else {
        debug!(symbol = %ctx.symbol, "waiting for funding timing data");
        return None;
    };

    let config = ctx.controller.config();
    let now = chrono::Utc::now().timestamp();

    // 2. Entry gate.
    if !state.entry_sent
        && !state.entry_abandoned
        && funding_time_s <= config.turbo.entry_seconds
        && ctx.controller.entry_allowed()
    {
        match try_entry(ctx, state, &snapshot).await {
            EntryOutcome::Sent => {}
            EntryOutcome::Abandoned => {
                state.entry_abandoned = true;
            }
        }
    }

    // 3. Fill detection.
    if state.entry_sent && !state.position_open {
        if let Some(reason) = poll_fill(ctx, state, &snapshot).await {
            return Some(reason);
        }
    }

    // 4. Funding-window exit.
    if state.position_open && config.positions.close_at_funding && funding_time_s <= 0 {
        match submit_exit(ctx, state, &snapshot).await {
            Ok(()) => return Some(StopReason::FundingDone),
            Err(fatal) => {
                if fatal {
                    return Some(StopReason::FatalError);
                }
                // Transient failure: retry on the next tick.
                return None;
            }
        }
    }

    // 5. Miss detection.
    if state.entry_sent && !state.position_open {
        let timed_out = state
            .entry_sent_at
            .is_some_and(|ts| now - ts > config.turbo.miss_order_timeout_s as i64);
        if funding_time_s <= 0 || timed_out {
            cancel_resting_order(ctx, state).await;
            let why = if timed_out { "entry timeout" } else { "funding elapsed unfilled" };
            warn!(symbol = %ctx.symbol, why, "[Turbo MISS]");
            return Some(StopReason::Miss);
        }
    }

    // 6. Filter re-validation.
    if let Some(violation) = filter_violation(config, &snapshot) {
        if config.turbo.cancel_on_filter_break {
            warn!(symbol = %ctx.symbol, violation = %violation, "[Filter] live threshold broken");
            cancel_resting_order(ctx, state).await;
            return Some(StopReason::FilterBreak);
        }
        warn!(
            symbol = %ctx.symbol,
            violation = %violation,
            "[Filter] live threshold broken (cancel_on_filter_break=false)"
        );
    }

    // 7. Eligibility loss: nothing outstanding and the window moved away.
    if funding_time_s > config.turbo.trigger_seconds && !state.entry_sent && !state.position_open {
        info!(symbol = %ctx.symbol, t = funding_time_s, "window left without entry");
        return Some(StopReason::SortieConditions);
    }

    None
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Merge the fused ticker and the REST fallbacks into one tick-local record.
/// Time-to-funding resolves in priority order: fused ticker, REST snapshot,
/// activation countdown.
pub(crate) fn build_snapshot(ctx: &RunnerContext) -> Snapshot {
    let now = chrono::Utc::now().timestamp();
    let ticker = ctx.controller.ticker_store().get(&ctx.symbol);

    let mut snapshot = Snapshot::default();
    if let Some(t) = &ticker {
        snapshot.funding_rate = t.funding_rate;
        snapshot.volume = t.turnover_24h;
        snapshot.bid = t.bid;
        snapshot.ask = t.ask;
        snapshot.spread = t.spread();
        snapshot.last_price = t.last_price;
        snapshot.funding_time_s = t.next_funding_time.map(|next| (next - now).max(0));
    }

    if snapshot.funding_time_s.is_none() {
        snapshot.funding_time_s = ctx
            .controller
            .watchlist_manager()
            .original_funding(&ctx.symbol)
            .and_then(|raw| parse_next_funding(&raw))
            .map(|next| (next - now).max(0));
    }
    if snapshot.funding_time_s.is_none() {
        let elapsed = now - ctx.activated_at;
        snapshot.funding_time_s = Some((ctx.activation_funding_s - elapsed).max(0));
    }

    if snapshot.last_price.is_none() {
        if let (Some(bid), Some(ask)) = (snapshot.bid, snapshot.ask) {
            snapshot.last_price = Some((bid + ask) / 2.0);
        }
    }

    snapshot.volatility = ctx.controller.volatility_cache().get(&ctx.symbol);

    if let (Some(funding), Some(volume)) = (snapshot.funding_rate, snapshot.volume) {
        let scorer = ScoringEngine::new(ctx.controller.config().scoring.clone());
        snapshot.score = Some(scorer.compute_score(
            funding,
            volume,
            snapshot.spread.unwrap_or(0.0),
            snapshot.volatility.unwrap_or(0.0),
        ));
    }

    snapshot
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

pub(crate) enum EntryOutcome {
    Sent,
    Abandoned,
}

async fn try_entry(
    ctx: &RunnerContext,
    state: &mut TurboState,
    snapshot: &Snapshot,
) -> EntryOutcome {
    let config = ctx.controller.config();

    let Some(side) = entry_side(snapshot, ctx.meta_score) else {
        debug!(symbol = %ctx.symbol, "no side determinable, abandoning entry");
        return EntryOutcome::Abandoned;
    };

    // Equity from the order client; configured fallback only on failure.
    let equity = match ctx.controller.order_api().wallet_equity().await {
        Ok(e) if e > 0.0 => e,
        Ok(_) | Err(_) => {
            let fallback = config.positions.account_equity_fallback;
            warn!(symbol = %ctx.symbol, fallback, "wallet equity unavailable, using configured fallback");
            fallback
        }
    };

    let Some(qty) = entry_quantity(config, &state.limits, equity, snapshot) else {
        return EntryOutcome::Abandoned;
    };
    let Some(price) = entry_price(config.positions.price_policy, config.positions.maker_offset_bps, &state.limits, snapshot)
    else {
        debug!(symbol = %ctx.symbol, "no bid/ask available for pricing, abandoning entry");
        return EntryOutcome::Abandoned;
    };

    let request = OrderRequest {
        category: ctx.category,
        symbol: ctx.symbol.clone(),
        side,
        order_type: OrderType::Limit,
        qty,
        price: Some(price),
        time_in_force: if config.positions.post_only {
            TimeInForce::PostOnly
        } else {
            TimeInForce::Gtc
        },
        reduce_only: false,
    };

    loop {
        state.entry_attempts += 1;
        match ctx.controller.order_api().place_order(&request).await {
            Ok(ack) => {
                state.entry_sent = true;
                state.order_id = Some(ack.order_id);
                state.entry_sent_at = Some(chrono::Utc::now().timestamp());
                state.entry_side = Some(side);
                state.entry_qty = Some(qty);
                ctx.controller.mark_busy(&ctx.symbol);
                ctx.controller.record_entry_sent();
                info!(
                    symbol = %ctx.symbol,
                    side = %side,
                    price,
                    qty,
                    funding = snapshot.funding_rate.unwrap_or(0.0),
                    t = snapshot.funding_time_s.unwrap_or(-1),
                    "[Turbo ENTRY]"
                );
                return EntryOutcome::Sent;
            }
            Err(e) => {
                let transient = e.ret_code().is_some_and(is_transient_order_code);
                if transient && state.entry_attempts <= 1 {
                    warn!(symbol = %ctx.symbol, error = %e, "transient order rejection, retrying once");
                    continue;
                }
                warn!(symbol = %ctx.symbol, error = %e, "entry submission failed, giving up on entry");
                ctx.controller.metrics_registry().record_turbo_error();
                return EntryOutcome::Abandoned;
            }
        }
    }
}

/// Buy when longs receive funding, sell when shorts do; a flat rate ties on
/// the composite score's sign.
pub(crate) fn entry_side(snapshot: &Snapshot, meta_score: Option<f64>) -> Option<Side> {
    let funding = snapshot.funding_rate?;
    if funding > 0.0 {
        Some(Side::Buy)
    } else if funding < 0.0 {
        Some(Side::Sell)
    } else {
        let score = snapshot.score.or(meta_score).unwrap_or(0.0);
        Some(if score >= 0.0 { Side::Buy } else { Side::Sell })
    }
}

/// Quantity from equity, capital fraction and leverage, quantized to the
/// instrument's lot size. None abandons the attempt.
pub(crate) fn entry_quantity(
    config: &crate::runtime_config::RuntimeConfig,
    limits: &InstrumentLimits,
    equity: f64,
    snapshot: &Snapshot,
) -> Option<f64> {
    let last_price = snapshot.last_price.filter(|p| *p > 0.0)?;

    let notional = equity * config.positions.capital_fraction;
    if notional < config.positions.min_notional_usd {
        warn!(
            notional,
            min = config.positions.min_notional_usd,
            "notional below minimum, abandoning entry"
        );
        return None;
    }

    let qty = round_to_step(notional * config.positions.leverage / last_price, limits.qty_step);
    if qty < limits.min_order_qty || qty <= 0.0 {
        warn!(qty, min_qty = limits.min_order_qty, "quantity below instrument minimum");
        return None;
    }
    Some(qty)
}

/// Passive price per the configured policy, offset to stay maker, quantized
/// to the tick size.
pub(crate) fn entry_price(
    policy: PricePolicy,
    maker_offset_bps: f64,
    limits: &InstrumentLimits,
    snapshot: &Snapshot,
) -> Option<f64> {
    let bid = snapshot.bid.filter(|p| *p > 0.0)?;
    let ask = snapshot.ask.filter(|p| *p > 0.0)?;

    let raw = match policy {
        PricePolicy::BestBid => bid * (1.0 + maker_offset_bps / 10_000.0),
        PricePolicy::BestAsk => ask * (1.0 - maker_offset_bps / 10_000.0),
        PricePolicy::Mid => {
            let mid = (bid + ask) / 2.0;
            if maker_offset_bps > 0.0 {
                mid * (1.0 + maker_offset_bps / 10_000.0)
            } else {
                mid
            }
        }
    };
    let price = round_to_step(raw, limits.tick_size);
    (price > 0.0).then_some(price)
}

// ---------------------------------------------------------------------------
// Fill detection
// ---------------------------------------------------------------------------

async fn poll_fill(
    ctx: &RunnerContext,
    state: &mut TurboState,
    snapshot: &Snapshot,
) -> Option<StopReason> {
    let order_id = state.order_id.clone()?;

    match ctx
        .controller
        .order_api()
        .order_status(ctx.category, &ctx.symbol, &order_id)
        .await
    {
        Ok(status) => match status.state {
            OrderState::Filled => {
                state.position_open = true;
                state.entry_price = status.avg_price.or(snapshot.last_price);
                state.entry_qty = status.filled_qty.or(state.entry_qty);
                ctx.controller.mark_position_open(&ctx.symbol);
                info!(
                    symbol = %ctx.symbol,
                    side = ?state.entry_side,
                    price = ?state.entry_price,
                    qty = ?state.entry_qty,
                    "entry filled, position open"
                );
                None
            }
            OrderState::Rejected => {
                warn!(symbol = %ctx.symbol, "entry order rejected by the exchange");
                Some(StopReason::Miss)
            }
            OrderState::Cancelled => {
                warn!(symbol = %ctx.symbol, "entry order cancelled externally");
                Some(StopReason::Miss)
            }
            _ => None,
        },
        Err(e) if is_transient_error(&e) => {
            debug!(symbol = %ctx.symbol, error = %e, "order status poll failed, retrying next tick");
            None
        }
        Err(e) => {
            warn!(symbol = %ctx.symbol, error = %e, "order status poll failed fatally");
            ctx.controller.metrics_registry().record_turbo_error();
            Some(StopReason::FatalError)
        }
    }
}

// ---------------------------------------------------------------------------
// Exit
// ---------------------------------------------------------------------------

/// Submit the reduce-only exit at the funding settlement. `Err(true)` is
/// fatal, `Err(false)` transient.
async fn submit_exit(
    ctx: &RunnerContext,
    state: &mut TurboState,
    snapshot: &Snapshot,
) -> Result<(), bool> {
    let config = ctx.controller.config();
    let entry_side = state.entry_side.unwrap_or(Side::Buy);
    let exit_side = entry_side.opposite();
    let qty = state.entry_qty.unwrap_or(0.0);
    if qty <= 0.0 {
        warn!(symbol = %ctx.symbol, "no filled quantity recorded, closing without order");
        return Ok(());
    }

    let (order_type, time_in_force, price) = match config.positions.exit_order_type {
        ExitOrderType::Market => (OrderType::Market, TimeInForce::Ioc, None),
        ExitOrderType::LimitPostOnly => {
            let price = entry_price(
                config.positions.price_policy,
                config.positions.maker_offset_bps,
                &state.limits,
                snapshot,
            );
            match price {
                Some(p) => (OrderType::Limit, TimeInForce::PostOnly, Some(p)),
                None => {
                    warn!(symbol = %ctx.symbol, "no book for limit exit, falling back to market");
                    (OrderType::Market, TimeInForce::Ioc, None)
                }
            }
        }
    };

    let request = OrderRequest {
        category: ctx.category,
        symbol: ctx.symbol.clone(),
        side: exit_side,
        order_type,
        qty,
        price,
        time_in_force,
        reduce_only: config.positions.reduce_only_on_exit,
    };

    match ctx.controller.order_api().place_order(&request).await {
        Ok(_ack) => {
            let exit_price = price
                .or(snapshot.last_price)
                .or(state.entry_price)
                .unwrap_or(0.0);
            let entry = state.entry_price.unwrap_or(exit_price);
            let pnl = position_pnl(entry_side, entry, exit_price, qty);
            let slippage = if entry > 0.0 {
                (exit_price - entry).abs() / entry
            } else {
                0.0
            };
            ctx.controller.mark_position_closed(&ctx.symbol);
            info!(
                symbol = %ctx.symbol,
                side = %exit_side,
                pnl = format!("{pnl:.4}"),
                slippage = format!("{slippage:.6}"),
                "[Turbo EXIT] funding captured"
            );
            Ok(())
        }
        Err(e) if is_transient_error(&e) => {
            warn!(symbol = %ctx.symbol, error = %e, "exit submission failed, retrying next tick");
            ctx.controller.metrics_registry().record_turbo_error();
            Err(false)
        }
        Err(e) => {
            warn!(symbol = %ctx.symbol, error = %e, "exit submission failed fatally");
            ctx.controller.metrics_registry().record_turbo_error();
            Err(true)
        }
    }
}

/// Signed PnL of a closed position.
pub(crate) fn position_pnl(entry_side: Side, entry: f64, exit: f64, qty: f64) -> f64 {
    match entry_side {
        Side::Buy => (exit - entry) * qty,
        Side::Sell => (entry - exit) * qty,
    }
}

// ---------------------------------------------------------------------------
// Miss / filter break helpers
// ---------------------------------------------------------------------------

async fn cancel_resting_order(ctx: &RunnerContext, state: &mut TurboState) {
    let Some(order_id) = state.order_id.take() else {
        return;
    };
    if state.position_open {
        return;
    }
    match ctx
        .controller
        .order_api()
        .cancel_order(ctx.category, &ctx.symbol, &order_id)
        .await
    {
        Ok(()) => info!(symbol = %ctx.symbol, order_id = %order_id, "resting order cancelled"),
        Err(e) => debug!(symbol = %ctx.symbol, order_id = %order_id, error = %e, "cancel failed"),
    }
}

/// Re-apply the live thresholds to the current snapshot. Returns the first
/// violation, None when everything holds. Unknown values never violate.
pub(crate) fn filter_violation(
    config: &crate::runtime_config::RuntimeConfig,
    snapshot: &Snapshot,
) -> Option<String> {
    if let Some(funding) = snapshot.funding_rate {
        let abs = funding.abs();
        if let Some(min) = config.funding_min {
            if abs < min {
                return Some(format!("funding {abs:.6} < min {min:.6}"));
            }
        }
        if let Some(max) = config.funding_max {
            if abs > max {
                return Some(format!("funding {abs:.6} > max {max:.6}"));
            }
        }
    }
    if let (Some(volume), Some(min_millions)) = (snapshot.volume, config.volume_min_millions) {
        let millions = volume / 1_000_000.0;
        if millions < min_millions {
            return Some(format!("volume {millions:.1}M < min {min_millions:.1}M"));
        }
    }
    if let (Some(spread), Some(max)) = (snapshot.spread, config.spread_max) {
        if spread > max {
            return Some(format!("spread {spread:.4} > max {max:.4}"));
        }
    }
    if let (Some(vol), Some(max)) = (snapshot.volatility, config.volatility_max) {
        if vol > max {
            return Some(format!("volatility {vol:.4} > max {max:.4}"));
        }
    }
    None
}

fn is_transient_error(e: &BybitError) -> bool {
    e.is_retryable()
        || matches!(
            e,
            BybitError::Transport(_) | BybitError::HttpStatus { .. }
        )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::InstantTicker;
    use crate::runtime_config::RuntimeConfig;
    use crate::turbo::testutil::{controller_with, register_active, MockOrderApi};

    fn ctx_for(controller: &Arc<TurboController>, symbol: &str) -> RunnerContext {
        RunnerContext {
            controller: controller.clone(),
            symbol: symbol.to_string(),
            category: Category::Linear,
            meta_score: Some(1.0),
            activation_funding_s: 65,
            activated_at: chrono::Utc::now().timestamp(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn seed_ticker(
        controller: &Arc<TurboController>,
        symbol: &str,
        funding: f64,
        funding_in_s: i64,
    ) {
        let now = chrono::Utc::now().timestamp();
        controller.ticker_store().merge(
            symbol,
            &InstantTicker {
                funding_rate: Some(funding),
                turnover_24h: Some(150e6),
                bid: Some(100.0),
                ask: Some(100.05),
                next_funding_time: Some(now + funding_in_s),
                mark_price: Some(100.02),
                last_price: Some(100.02),
                updated_at: now,
            },
        );
    }

    fn snapshot_with(funding: f64, bid: f64, ask: f64, last: f64) -> Snapshot {
        Snapshot {
            funding_time_s: Some(58),
            funding_rate: Some(funding),
            volume: Some(150e6),
            spread: Some((ask - bid) / ((ask + bid) / 2.0)),
            volatility: Some(0.01),
            bid: Some(bid),
            ask: Some(ask),
            last_price: Some(last),
            score: Some(1.0),
        }
    }

    // ── pure helpers ────────────────────────────────────────────────────

    #[test]
    fn side_follows_funding_sign() {
        let mut s = snapshot_with(0.0005, 100.0, 100.1, 100.05);
        assert_eq!(entry_side(&s, None), Some(Side::Buy));
        s.funding_rate = Some(-0.0005);
        assert_eq!(entry_side(&s, None), Some(Side::Sell));
    }

    #[test]
    fn side_ties_on_score_sign() {
        let mut s = snapshot_with(0.0, 100.0, 100.1, 100.05);
        s.score = Some(-2.0);
        assert_eq!(entry_side(&s, None), Some(Side::Sell));
        s.score = Some(3.0);
        assert_eq!(entry_side(&s, None), Some(Side::Buy));
        s.score = None;
        assert_eq!(entry_side(&s, Some(-1.0)), Some(Side::Sell));
    }

    #[test]
    fn quantity_scales_with_equity_and_leverage() {
        let config = RuntimeConfig::default(); // capital_fraction=0.2, leverage=5
        let limits = InstrumentLimits {
            qty_step: 0.001,
            min_order_qty: 0.001,
            tick_size: 0.01,
        };
        let s = snapshot_with(0.001, 100.0, 100.1, 100.0);
        // 10000 * 0.2 * 5 / 100 = 100
        let qty = entry_quantity(&config, &limits, 10_000.0, &s).unwrap();
        assert!((qty - 100.0).abs() < 1e-9);
    }

    #[test]
    fn quantity_abandons_below_min_notional() {
        let mut config = RuntimeConfig::default();
        config.positions.min_notional_usd = 50.0;
        let limits = InstrumentLimits::default();
        let s = snapshot_with(0.001, 100.0, 100.1, 100.0);
        // equity 100 * fraction 0.2 = 20 < 50
        assert!(entry_quantity(&config, &limits, 100.0, &s).is_none());
    }

    #[test]
    fn quantity_respects_lot_size() {
        let config = RuntimeConfig::default();
        let limits = InstrumentLimits {
            qty_step: 1.0,
            min_order_qty: 1.0,
            tick_size: 0.01,
        };
        let s = snapshot_with(0.001, 3.0, 3.01, 3.0);
        // 10000 * 0.2 * 5 / 3 = 3333.33 -> 3333
        let qty = entry_quantity(&config, &limits, 10_000.0, &s).unwrap();
        assert!((qty - 3333.0).abs() < 1e-9);
    }

    #[test]
    fn price_policies_anchor_correctly() {
        let limits = InstrumentLimits {
            tick_size: 0.01,
            ..Default::default()
        };
        let s = snapshot_with(0.001, 100.0, 100.5, 100.2);

        let bid = entry_price(PricePolicy::BestBid, 0.0, &limits, &s).unwrap();
        assert!((bid - 100.0).abs() < 1e-9);

        let ask = entry_price(PricePolicy::BestAsk, 0.0, &limits, &s).unwrap();
        assert!((ask - 100.5).abs() < 1e-9);

        let mid = entry_price(PricePolicy::Mid, 0.0, &limits, &s).unwrap();
        assert!((mid - 100.25).abs() < 1e-9);
    }

    #[test]
    fn maker_offset_shifts_price_in_bps() {
        let limits = InstrumentLimits {
            tick_size: 0.0001,
            ..Default::default()
        };
        let s = snapshot_with(0.001, 1.0, 1.01, 1.005);
        // 10 bps above the bid: 1.0 * 1.001 = 1.001
        let p = entry_price(PricePolicy::BestBid, 10.0, &limits, &s).unwrap();
        assert!((p - 1.001).abs() < 1e-9);
    }

    #[test]
    fn pnl_sign_depends_on_side() {
        assert!((position_pnl(Side::Buy, 100.0, 101.0, 2.0) - 2.0).abs() < 1e-9);
        assert!((position_pnl(Side::Sell, 100.0, 101.0, 2.0) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn filter_violation_detects_each_threshold() {
        let mut config = RuntimeConfig::default();
        config.funding_min = Some(0.0001);
        config.funding_max = Some(0.01);
        config.volume_min_millions = Some(50.0);
        config.spread_max = Some(0.003);
        config.volatility_max = Some(0.05);

        let good = snapshot_with(0.001, 100.0, 100.05, 100.02);
        assert!(filter_violation(&config, &good).is_none());

        let mut weak_funding = good.clone();
        weak_funding.funding_rate = Some(0.00001);
        assert!(filter_violation(&config, &weak_funding).unwrap().contains("funding"));

        let mut thin = good.clone();
        thin.volume = Some(1e6);
        assert!(filter_violation(&config, &thin).unwrap().contains("volume"));

        let mut wide = good.clone();
        wide.spread = Some(0.02);
        assert!(filter_violation(&config, &wide).unwrap().contains("spread"));

        let mut wild = good.clone();
        wild.volatility = Some(0.2);
        assert!(filter_violation(&config, &wild).unwrap().contains("volatility"));

        // Unknown values never violate.
        let unknown = Snapshot::default();
        assert!(filter_violation(&config, &unknown).is_none());
    }

    // ── state machine scenarios ─────────────────────────────────────────

    #[tokio::test]
    async fn normal_flow_entry_fill_exit() {
        let mock = Arc::new(MockOrderApi::new());
        *mock.fill_after_polls.lock() = 1;
        let controller = controller_with(RuntimeConfig::default(), mock.clone());
        register_active(&controller, "BTCUSDT");
        seed_ticker(&controller, "BTCUSDT", 0.0005, 58);

        let ctx = ctx_for(&controller, "BTCUSDT");
        let mut state = TurboState::default();

        // Tick 1: inside the entry window -> Buy post-only limit submitted.
        assert_eq!(tick_once(&ctx, &mut state).await, None);
        assert!(state.entry_sent);
        {
            let placed = mock.placed.lock();
            assert_eq!(placed.len(), 1);
            assert_eq!(placed[0].side, Side::Buy);
            assert_eq!(placed[0].order_type, OrderType::Limit);
            assert_eq!(placed[0].time_in_force, TimeInForce::PostOnly);
            assert!(!placed[0].reduce_only);
        }
        assert_eq!(controller.metrics_registry().turbo().entries, 1);

        // Tick 2: order reports filled -> position opens.
        assert_eq!(tick_once(&ctx, &mut state).await, None);
        assert!(state.position_open);
        assert_eq!(state.entry_price, Some(100.0));

        // Funding instant reached -> reduce-only exit, reason funding_done.
        seed_ticker(&controller, "BTCUSDT", 0.0005, 0);
        let reason = tick_once(&ctx, &mut state).await;
        assert_eq!(reason, Some(StopReason::FundingDone));
        {
            let placed = mock.placed.lock();
            assert_eq!(placed.len(), 2);
            assert_eq!(placed[1].side, Side::Sell);
            assert!(placed[1].reduce_only);
        }
    }

    #[tokio::test]
    async fn negative_funding_enters_short() {
        let mock = Arc::new(MockOrderApi::new());
        *mock.fill_after_polls.lock() = 1000;
        let controller = controller_with(RuntimeConfig::default(), mock.clone());
        register_active(&controller, "ETHUSDT");
        seed_ticker(&controller, "ETHUSDT", -0.0008, 55);

        let ctx = ctx_for(&controller, "ETHUSDT");
        let mut state = TurboState::default();
        tick_once(&ctx, &mut state).await;
        assert_eq!(mock.placed.lock()[0].side, Side::Sell);
    }

    #[tokio::test]
    async fn miss_cancels_and_reports() {
        let mock = Arc::new(MockOrderApi::new());
        *mock.fill_after_polls.lock() = 1000; // never fills
        let controller = controller_with(RuntimeConfig::default(), mock.clone());
        register_active(&controller, "BTCUSDT");
        seed_ticker(&controller, "BTCUSDT", 0.0005, 58);

        let ctx = ctx_for(&controller, "BTCUSDT");
        let mut state = TurboState::default();
        tick_once(&ctx, &mut state).await;
        assert!(state.entry_sent);

        // Funding elapses with the order still resting.
        seed_ticker(&controller, "BTCUSDT", 0.0005, 0);
        let reason = tick_once(&ctx, &mut state).await;
        assert_eq!(reason, Some(StopReason::Miss));
        assert_eq!(mock.cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn miss_on_entry_timeout() {
        let mut config = RuntimeConfig::default();
        config.turbo.miss_order_timeout_s = 10;
        let mock = Arc::new(MockOrderApi::new());
        *mock.fill_after_polls.lock() = 1000;
        let controller = controller_with(config, mock.clone());
        register_active(&controller, "BTCUSDT");
        seed_ticker(&controller, "BTCUSDT", 0.0005, 58);

        let ctx = ctx_for(&controller, "BTCUSDT");
        let mut state = TurboState::default();
        tick_once(&ctx, &mut state).await;

        // Backdate the submission past the timeout.
        state.entry_sent_at = Some(chrono::Utc::now().timestamp() - 11);
        let reason = tick_once(&ctx, &mut state).await;
        assert_eq!(reason, Some(StopReason::Miss));
        assert_eq!(mock.cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn filter_break_cancels_resting_order() {
        let mut config = RuntimeConfig::default();
        config.spread_max = Some(0.0001); // everything violates
        let mock = Arc::new(MockOrderApi::new());
        *mock.fill_after_polls.lock() = 1000;
        let controller = controller_with(config, mock.clone());
        register_active(&controller, "BTCUSDT");
        seed_ticker(&controller, "BTCUSDT", 0.0005, 58);

        let ctx = ctx_for(&controller, "BTCUSDT");
        let mut state = TurboState::default();
        // Entry goes out first (entry gate precedes the filter check), then
        // the spread violation cancels it.
        let reason = tick_once(&ctx, &mut state).await;
        assert_eq!(reason, Some(StopReason::FilterBreak));
        assert_eq!(mock.cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn filter_break_ignored_when_cancel_disabled() {
        let mut config = RuntimeConfig::default();
        config.spread_max = Some(0.0001);
        config.turbo.cancel_on_filter_break = false;
        let mock = Arc::new(MockOrderApi::new());
        *mock.fill_after_polls.lock() = 1000;
        let controller = controller_with(config, mock.clone());
        register_active(&controller, "BTCUSDT");
        seed_ticker(&controller, "BTCUSDT", 0.0005, 58);

        let ctx = ctx_for(&controller, "BTCUSDT");
        let mut state = TurboState::default();
        let reason = tick_once(&ctx, &mut state).await;
        assert_eq!(reason, None);
        assert!(mock.cancelled.lock().is_empty());
    }

    #[tokio::test]
    async fn transient_rejection_retries_once() {
        let mock = Arc::new(MockOrderApi::new());
        *mock.fill_after_polls.lock() = 1000;
        mock.place_error_codes.lock().push(10006); // first attempt fails
        let controller = controller_with(RuntimeConfig::default(), mock.clone());
        register_active(&controller, "BTCUSDT");
        seed_ticker(&controller, "BTCUSDT", 0.0005, 58);

        let ctx = ctx_for(&controller, "BTCUSDT");
        let mut state = TurboState::default();
        tick_once(&ctx, &mut state).await;
        assert!(state.entry_sent);
        assert_eq!(state.entry_attempts, 2);
        assert_eq!(mock.placed.lock().len(), 1);
    }

    #[tokio::test]
    async fn fatal_rejection_abandons_entry() {
        let mock = Arc::new(MockOrderApi::new());
        mock.place_error_codes.lock().push(10005); // auth error, no retry
        let controller = controller_with(RuntimeConfig::default(), mock.clone());
        register_active(&controller, "BTCUSDT");
        seed_ticker(&controller, "BTCUSDT", 0.0005, 58);

        let ctx = ctx_for(&controller, "BTCUSDT");
        let mut state = TurboState::default();
        let reason = tick_once(&ctx, &mut state).await;
        assert_eq!(reason, None);
        assert!(state.entry_abandoned);
        assert!(!state.entry_sent);
        assert!(mock.placed.lock().is_empty());
    }

    #[tokio::test]
    async fn eligibility_loss_without_entry() {
        let mock = Arc::new(MockOrderApi::new());
        let controller = controller_with(RuntimeConfig::default(), mock);
        register_active(&controller, "BTCUSDT");
        // Funding moved back out of the window (e.g. after settlement).
        seed_ticker(&controller, "BTCUSDT", 0.0005, 7 * 3600);

        let ctx = ctx_for(&controller, "BTCUSDT");
        let mut state = TurboState::default();
        let reason = tick_once(&ctx, &mut state).await;
        assert_eq!(reason, Some(StopReason::SortieConditions));
    }

    #[tokio::test]
    async fn snapshot_falls_back_to_activation_countdown() {
        let mock = Arc::new(MockOrderApi::new());
        let controller = controller_with(RuntimeConfig::default(), mock);
        // No ticker, no REST snapshot.
        let ctx = ctx_for(&controller, "GHOSTUSDT");
        let snapshot = build_snapshot(&ctx);
        let t = snapshot.funding_time_s.unwrap();
        assert!((60..=65).contains(&t), "countdown from activation, got {t}");
    }

    #[tokio::test]
    async fn cooldown_applies_after_loop_finish() {
        let mock = Arc::new(MockOrderApi::new());
        let controller = controller_with(RuntimeConfig::default(), mock);
        register_active(&controller, "BTCUSDT");
        controller.finish_symbol("BTCUSDT", StopReason::Miss);
        assert!(!controller.is_eligible("BTCUSDT"));
        let deadline = controller.cooldown_deadline("BTCUSDT").unwrap();
        assert!(deadline > chrono::Utc::now().timestamp());
    }
}
