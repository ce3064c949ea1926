//! The per-market quote cycle.
//!
//! One pass: reload the MM snapshot, gate on pause/resolution/volatility,
//! pull fresh market data (four parallel RPCs per outcome), run the sanity
//! gate, compute desired quotes, diff against tracked orders, and dispatch
//! cancels-then-places. A market-level lock guarantees at most one cycle
//! per market at a time; cycles for different markets run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RuntimeSettings;
use crate::errors::{EngineError, EngineResult};
use crate::grid::PriceGrid;
use crate::store::Store;
use crate::types::{
    Market, MmRecord, OrderKey, OrderSide, Outcome, QuoteEventKind, TrackedOrder,
};
use crate::venue::types::{OutcomeView, PlaceOrderRequest, TimeInForce, WireSide};
use crate::venue::{client_order_id, with_retry, SharedAdapter, VenueRegistry, MAX_ORDER_BATCH};
use super::calc::{self, QuoteInputs, QuoteSet};
use super::diff::{diff_orders, DesiredEntry};
use super::sanity::{self, DataCheckInputs};

/// Cool-off applied when the mid gaps violently.
const VOLATILITY_PAUSE_MINUTES: i64 = 5;
/// Requote at least this often even if the mid sits still.
const MAX_QUOTE_AGE_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(&'static str),
    SanityFailed(String),
    VolatilityPaused,
    Quoted { kept: usize, cancelled: usize, placed: usize },
}

pub struct QuoteCycle {
    store: Store,
    registry: VenueRegistry,
    /// One lock per market; a cycle holds it for its whole duration.
    market_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl QuoteCycle {
    pub fn new(store: Store, registry: VenueRegistry) -> Self {
        Self {
            store,
            registry,
            market_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, market_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.market_locks.lock().await;
        locks
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one cycle for every enrolled market.
    pub async fn run_all(&self, settings: &RuntimeSettings) {
        if !settings.mm_enabled {
            debug!("quoting disabled; skipping cycle");
            return;
        }
        let mms = match self.store.list_active_mms() {
            Ok(m) => m,
            Err(e) => {
                warn!("list mms: {e}");
                return;
            }
        };
        for mm in mms {
            match self.run_market(&mm, settings).await {
                Ok(CycleOutcome::Quoted { kept, cancelled, placed }) => {
                    debug!(
                        market = %mm.market_id,
                        kept, cancelled, placed,
                        "cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("💥 cycle for {} failed: {e}", mm.market_id);
                }
            }
        }
    }

    pub async fn run_market(
        &self,
        mm: &MmRecord,
        settings: &RuntimeSettings,
    ) -> EngineResult<CycleOutcome> {
        let lock = self.lock_for(&mm.market_id).await;
        let Ok(_guard) = lock.try_lock() else {
            // A cycle is already inside this market.
            return Ok(CycleOutcome::Skipped("cycle in flight"));
        };

        // Fresh snapshot: the FSM may have moved inventory since the list.
        let mm = self
            .store
            .get_mm(mm.id)?
            .ok_or_else(|| EngineError::invariant(format!("mm {} vanished", mm.id)))?;
        if !mm.active {
            return Ok(CycleOutcome::Skipped("inactive"));
        }
        if mm.paused {
            return Ok(CycleOutcome::Skipped("paused"));
        }
        let now = Utc::now();
        if let Some(until) = mm.state.volatility_pause_until {
            if until > now {
                return Ok(CycleOutcome::Skipped("volatility pause"));
            }
        }

        let market = self
            .store
            .get_market(&mm.market_id)?
            .ok_or_else(|| EngineError::invariant(format!("market {} missing", mm.market_id)))?;
        if !market.active {
            return Ok(CycleOutcome::Skipped("market inactive"));
        }

        // Pre-resolution halt: stop quoting and pull resting orders.
        if let Some(hours) = market.hours_to_end(now) {
            if hours < mm.config.min_time_to_resolution_hours {
                self.halt_pre_resolution(&mm, &market, hours).await?;
                return Ok(CycleOutcome::Skipped("pre-resolution"));
            }
        }

        let adapter = self.registry.get(&market.venue)?;
        let grid = PriceGrid::new(market.price_ranges.clone());

        // Four independent RPCs per outcome, fetched concurrently.
        let (yes_view, no_view) = tokio::join!(
            fetch_outcome_view(&adapter, market.token_for(Outcome::Yes)),
            fetch_outcome_view(&adapter, market.token_for(Outcome::No)),
        );
        let yes_view = yes_view?;
        let no_view = no_view?;

        // Sanity gate, data half, per outcome; either failure halts.
        for (outcome, view, stored_mid) in [
            (Outcome::Yes, &yes_view, market.yes_mid),
            (Outcome::No, &no_view, market.no_mid),
        ] {
            let auth_mid = match view.midpoint {
                Some(m) => m,
                None => {
                    return self
                        .sanity_fail(&mm, format!("{} midpoint unavailable", outcome.as_str()))
                        .await;
                }
            };
            let inputs = DataCheckInputs {
                outcome,
                auth_mid,
                best_bid: view.best.bid,
                best_ask: view.best.ask,
                spread: view.spread.unwrap_or(0.0),
                tick: grid.tick_size(auth_mid),
                stored_mid,
                stored_at: market.last_updated,
                now,
            };
            if let Err(reason) = sanity::check_market_data(&inputs) {
                return self.sanity_fail(&mm, reason.to_string()).await;
            }
        }

        let yes_mid = yes_view.midpoint.unwrap_or(0.0);
        let no_mid = no_view.midpoint.unwrap_or(0.0);

        // Volatility gate: a gap beyond 3× the refresh threshold pauses the
        // market for a cool-off instead of chasing it.
        if let Some(stored) = market.yes_mid {
            if stored > 0.0 {
                let frac = (yes_mid - stored).abs() / stored;
                if frac > 3.0 * settings.mm_refresh_threshold {
                    self.volatility_pause(&mm, &adapter, stored, yes_mid).await?;
                    return Ok(CycleOutcome::VolatilityPaused);
                }
            }
        }

        let tracked = self.store.list_tracked_orders(mm.id)?;

        // Requote only when something moved or the quotes are ageing.
        if !self.should_requote(&mm, &market, yes_mid, settings, !tracked.is_empty()) {
            self.store
                .update_market_mids(&market.market_id, yes_mid, no_mid, now)?;
            return Ok(CycleOutcome::Skipped("mid unchanged"));
        }

        // Desired quotes per outcome.
        let yes_quotes = compute_for_outcome(&mm, &grid, Outcome::Yes, yes_mid, &yes_view);
        let no_quotes = compute_for_outcome(&mm, &grid, Outcome::No, no_mid, &no_view);

        // Sanity gate, quote half.
        for (outcome, set, view) in [
            (Outcome::Yes, &yes_quotes, &yes_view),
            (Outcome::No, &no_quotes, &no_view),
        ] {
            let bid = set.top_bid().map(|d| d.price);
            let ask = set.top_ask().map(|d| d.price);
            if let Err(reason) =
                sanity::check_quotes(outcome, bid, ask, view.best.bid, view.best.ask)
            {
                return self.sanity_fail(&mm, reason.to_string()).await;
            }
        }

        let mut desired: Vec<DesiredEntry> = Vec::new();
        collect_entries(&mut desired, &market, Outcome::Yes, &yes_quotes);
        collect_entries(&mut desired, &market, Outcome::No, &no_quotes);

        let diff = diff_orders(&desired, &tracked, &grid);
        let kept = diff.keep.len();
        let reduce_only = yes_quotes.reduce_only || no_quotes.reduce_only;

        let cancelled = self.dispatch_cancels(&mm, &adapter, &diff.cancel).await;
        let placed = self
            .dispatch_places(&mm, &adapter, &diff.place, reduce_only)
            .await;

        self.store
            .update_market_mids(&market.market_id, yes_mid, no_mid, now)?;
        if kept > 0 || placed > 0 {
            self.store.bump_last_quote_at(mm.id, now)?;
        }

        Ok(CycleOutcome::Quoted { kept, cancelled, placed })
    }

    fn should_requote(
        &self,
        mm: &MmRecord,
        market: &Market,
        new_mid: f64,
        settings: &RuntimeSettings,
        has_orders: bool,
    ) -> bool {
        if !has_orders {
            return true;
        }
        if let Some(stored) = market.yes_mid {
            if stored > 0.0 && (new_mid - stored).abs() / stored > settings.mm_refresh_threshold {
                return true;
            }
        } else {
            return true;
        }
        match mm.state.last_quote_at {
            Some(at) => (Utc::now() - at).num_seconds() > MAX_QUOTE_AGE_SECS,
            None => true,
        }
    }

    async fn sanity_fail(&self, mm: &MmRecord, reason: String) -> EngineResult<CycleOutcome> {
        warn!("🚧 SANITY_CHECK_FAILED [{}]: {reason}", mm.market_id);
        self.store.log_event(
            mm.id,
            QuoteEventKind::SanityCheckFailed,
            serde_json::json!({ "reason": reason }),
        )?;
        Ok(CycleOutcome::SanityFailed(reason))
    }

    async fn volatility_pause(
        &self,
        mm: &MmRecord,
        adapter: &SharedAdapter,
        stored: f64,
        new_mid: f64,
    ) -> EngineResult<()> {
        let until = Utc::now() + Duration::minutes(VOLATILITY_PAUSE_MINUTES);
        warn!(
            "🌪️ volatility pause [{}]: mid {stored:.3} → {new_mid:.3}; paused until {until}",
            mm.market_id,
        );
        self.store.set_volatility_pause(mm.id, Some(until))?;
        self.store.log_event(
            mm.id,
            QuoteEventKind::Pause,
            serde_json::json!({
                "reason": "volatility",
                "stored_mid": stored,
                "new_mid": new_mid,
                "until": until.to_rfc3339(),
            }),
        )?;
        // Pull resting orders; a gapping market is not one to rest in.
        let tracked = self.store.list_tracked_orders(mm.id)?;
        self.dispatch_cancels(mm, adapter, &tracked).await;
        Ok(())
    }

    async fn halt_pre_resolution(
        &self,
        mm: &MmRecord,
        market: &Market,
        hours: f64,
    ) -> EngineResult<()> {
        let tracked = self.store.list_tracked_orders(mm.id)?;
        if tracked.is_empty() {
            return Ok(());
        }
        info!(
            "🏁 {} is {hours:.1}h from resolution — pulling {} resting order(s)",
            market.market_id,
            tracked.len(),
        );
        let adapter = self.registry.get(&market.venue)?;
        self.dispatch_cancels(mm, &adapter, &tracked).await;
        self.store.log_event(
            mm.id,
            QuoteEventKind::Pause,
            serde_json::json!({ "reason": "pre-resolution", "hours_to_end": hours }),
        )?;
        Ok(())
    }

    /// Cancels run before places. Remote-first: the tracked row is only
    /// removed once the venue confirms, so a failed cancel never leaves a
    /// blind order.
    async fn dispatch_cancels(
        &self,
        mm: &MmRecord,
        adapter: &SharedAdapter,
        cancels: &[TrackedOrder],
    ) -> usize {
        let mut done = 0usize;
        for order in cancels {
            let order_id = order.order_id.clone();
            let res = with_retry("cancel_order", || {
                let adapter = adapter.clone();
                let order_id = order_id.clone();
                async move { adapter.cancel_order(&order_id).await }
            })
            .await;
            match res {
                Ok(()) => {
                    if let Err(e) = self.store.delete_tracked_order(&order.order_id) {
                        warn!("delete tracked {}: {e}", order.order_id);
                        continue;
                    }
                    let _ = self.store.log_event(
                        mm.id,
                        QuoteEventKind::QuoteCancelled,
                        serde_json::json!({
                            "order_id": order.order_id,
                            "outcome": order.key.outcome.as_str(),
                            "side": order.key.side.as_str(),
                            "price": order.price,
                        }),
                    );
                    done += 1;
                }
                Err(e) => {
                    warn!(
                        "❌ cancel {} failed: {e} — keeping tracked row",
                        order.order_id
                    );
                }
            }
        }
        done
    }

    async fn dispatch_places(
        &self,
        mm: &MmRecord,
        adapter: &SharedAdapter,
        places: &[DesiredEntry],
        reduce_only: bool,
    ) -> usize {
        let mut done = 0usize;
        for chunk in places.chunks(MAX_ORDER_BATCH) {
            let reqs: Vec<PlaceOrderRequest> = chunk
                .iter()
                .map(|want| PlaceOrderRequest {
                    token: want.token.clone(),
                    side: match want.key.side {
                        OrderSide::Buy => WireSide::Buy,
                        OrderSide::Sell => WireSide::Sell,
                    },
                    price: want.price,
                    size: want.size,
                    time_in_force: TimeInForce::Gtc,
                    post_only: true,
                    reduce_only,
                    client_order_id: Some(client_order_id(
                        mm.id, &want.key, want.price, want.size,
                    )),
                    order_group_id: None,
                })
                .collect();

            let outcomes = match with_retry("place_orders", || {
                let adapter = adapter.clone();
                let reqs = reqs.clone();
                async move { adapter.place_orders(&reqs).await }
            })
            .await
            {
                Ok(o) => o,
                Err(e) => {
                    warn!("❌ batch place failed: {e}");
                    continue;
                }
            };

            for (want, out) in chunk.iter().zip(outcomes) {
                if !out.success {
                    warn!(
                        "❌ place {:?} {:.3}x{:.1} rejected: {:?}",
                        want.key, want.price, want.size, out.error,
                    );
                    continue;
                }
                let row = TrackedOrder {
                    mm_id: mm.id,
                    key: want.key,
                    order_id: out.order_id.clone(),
                    client_order_id: Some(client_order_id(mm.id, &want.key, want.price, want.size)),
                    order_group_id: None,
                    token: want.token.clone(),
                    price: want.price,
                    size: want.size,
                    last_matched_size: None,
                    placed_at: Utc::now(),
                };
                if let Err(e) = self.store.insert_tracked_order(&row) {
                    warn!("track order {}: {e}", out.order_id);
                    continue;
                }
                let _ = self.store.log_event(
                    mm.id,
                    QuoteEventKind::QuotePlaced,
                    serde_json::json!({
                        "order_id": out.order_id,
                        "outcome": want.key.outcome.as_str(),
                        "side": want.key.side.as_str(),
                        "tier": want.key.tier,
                        "price": want.price,
                        "size": want.size,
                    }),
                );
                done += 1;
            }
        }
        done
    }
}

async fn fetch_outcome_view(adapter: &SharedAdapter, token: &str) -> EngineResult<OutcomeView> {
    let token = token.to_string();
    let (midpoint, spread, best, book) = tokio::join!(
        with_retry("midpoint", || {
            let a = adapter.clone();
            let t = token.clone();
            async move { a.midpoint(&t).await }
        }),
        with_retry("spread", || {
            let a = adapter.clone();
            let t = token.clone();
            async move { a.spread(&t).await }
        }),
        with_retry("best", || {
            let a = adapter.clone();
            let t = token.clone();
            async move { a.best(&t).await }
        }),
        with_retry("book", || {
            let a = adapter.clone();
            let t = token.clone();
            async move { a.orderbook_snapshot(&t).await }
        }),
    );
    Ok(OutcomeView {
        token,
        midpoint: midpoint?,
        spread: spread?,
        best: best?,
        book: book?,
    })
}

fn compute_for_outcome(
    mm: &MmRecord,
    grid: &PriceGrid,
    outcome: Outcome,
    mid: f64,
    view: &OutcomeView,
) -> QuoteSet {
    let inputs = QuoteInputs {
        mid,
        target_spread: mm.config.target_spread,
        inventory: mm.state.inventory(outcome),
        skew_factor: mm.config.skew_factor,
        order_size: mm.config.order_size,
        max_inventory: mm.config.max_inventory,
        grid,
        policy: mm.config.policy,
        best_bid: view.best.bid,
        best_ask: view.best.ask,
        avg_cost: mm.state.avg_cost(outcome),
        bid_offset_ticks: mm.config.bid_offset_ticks,
        ask_offset_ticks: mm.config.ask_offset_ticks,
        tiers: mm.config.tiers.as_deref().unwrap_or(&calc::DEFAULT_TIERS),
    };
    calc::compute(&inputs)
}

fn collect_entries(out: &mut Vec<DesiredEntry>, market: &Market, outcome: Outcome, set: &QuoteSet) {
    let token = market.token_for(outcome).to_string();
    for d in &set.bids {
        out.push(DesiredEntry {
            key: OrderKey::new(outcome, OrderSide::Buy, d.tier),
            token: token.clone(),
            price: d.price,
            size: d.size,
        });
    }
    for d in &set.asks {
        out.push(DesiredEntry {
            key: OrderKey::new(outcome, OrderSide::Sell, d.tier),
            token: token.clone(),
            price: d.price,
            size: d.size,
        });
    }
}
