//! Fill & inventory state machine.
//!
//! One actor task is the sole writer of inventory, average cost and realized
//! P&L for every market maker. Everything that wants to mutate that state
//! (push fills, reconciliation overwrites, pauses, config updates) sends an
//! [`InventoryCmd`] down the channel. Readers get immutable snapshots via a
//! `watch` broadcast or read the store.
//!
//! Fills from any source other than the authoritative positions feed are
//! verified against the cached position map before they touch inventory.
//! A fill that fails verification is parked as a PENDING event; the sync
//! cycle promotes it once on-chain drift corroborates it, and the TTL
//! rejects it if the chain never does.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::errors::EngineResult;
use crate::store::Store;
use crate::types::{
    FillRecord, MmConfig, MmState, OrderSide, Outcome, PendingFillEvent, PendingFillStatus,
    QuoteEventKind,
};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Share tolerance when verifying a claimed fill against positions.
    pub verify_tolerance: f64,
    /// Drift at or above this logs a WARN during chain sync.
    pub drift_warn_threshold: f64,
    /// PENDING events older than this flip to REJECTED.
    pub pending_ttl_minutes: i64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            verify_tolerance: 0.1,
            drift_warn_threshold: 0.1,
            pending_ttl_minutes: 15,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────

/// Where a fill observation came from. Authoritative sources skip
/// verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSource {
    /// Push stream (order/trade message). Verified.
    Push,
    /// Full-sync terminal-order delta. Verified.
    Reconciliation,
    /// Pending-fill promotion, already corroborated by the chain.
    Promotion,
}

#[derive(Debug, Clone)]
pub struct FillObservation {
    pub mm_id: i64,
    pub order_id: String,
    pub token: String,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub price: f64,
    /// Size of this delta alone.
    pub delta: f64,
    /// Cumulative matched size after this fill (idempotency key half).
    pub matched_total_after: f64,
    pub source: FillSource,
}

/// One outcome's authoritative position as fetched from the venue.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainPosition {
    pub size: f64,
    pub avg_price: f64,
}

#[derive(Debug)]
pub enum InventoryCmd {
    ApplyFill {
        obs: FillObservation,
        respond: Option<oneshot::Sender<FillOutcome>>,
    },
    /// Fast/full sync: promote pending, warn on drift, then overwrite.
    SyncFromChain {
        mm_id: i64,
        yes: ChainPosition,
        no: ChainPosition,
        respond: Option<oneshot::Sender<SyncReport>>,
    },
    /// Refresh the cached authoritative position map (token → size).
    PositionsSnapshot { positions: HashMap<String, f64> },
    Pause { mm_id: i64, reason: String },
    Resume { mm_id: i64 },
    ConfigUpdate { mm_id: i64, config: MmConfig },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    Applied,
    /// Same (order_id, matched_total_after) seen before.
    Duplicate,
    /// Verification failed; parked as a PENDING event.
    Parked,
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub promoted: usize,
    pub drift_yes: f64,
    pub drift_no: f64,
}

/// Read-side snapshot broadcast after every mutation.
pub type InventorySnapshot = HashMap<i64, MmState>;

#[derive(Clone)]
pub struct InventoryHandle {
    tx: mpsc::Sender<InventoryCmd>,
    snapshot_rx: watch::Receiver<InventorySnapshot>,
}

impl InventoryHandle {
    pub async fn apply_fill(&self, obs: FillObservation) -> FillOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(InventoryCmd::ApplyFill { obs, respond: Some(tx) })
            .await
            .is_err()
        {
            return FillOutcome::Error("inventory actor gone".to_string());
        }
        rx.await
            .unwrap_or_else(|_| FillOutcome::Error("inventory actor dropped response".to_string()))
    }

    pub async fn sync_from_chain(
        &self,
        mm_id: i64,
        yes: ChainPosition,
        no: ChainPosition,
    ) -> Option<SyncReport> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(InventoryCmd::SyncFromChain { mm_id, yes, no, respond: Some(tx) })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn positions_snapshot(&self, positions: HashMap<String, f64>) {
        let _ = self
            .tx
            .send(InventoryCmd::PositionsSnapshot { positions })
            .await;
    }

    pub async fn pause(&self, mm_id: i64, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(InventoryCmd::Pause { mm_id, reason: reason.into() })
            .await;
    }

    pub async fn resume(&self, mm_id: i64) {
        let _ = self.tx.send(InventoryCmd::Resume { mm_id }).await;
    }

    pub async fn config_update(&self, mm_id: i64, config: MmConfig) {
        let _ = self.tx.send(InventoryCmd::ConfigUpdate { mm_id, config }).await;
    }

    pub fn snapshot(&self) -> InventorySnapshot {
        self.snapshot_rx.borrow().clone()
    }
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

pub struct InventoryBook {
    cfg: InventoryConfig,
    store: Store,
    cmd_rx: mpsc::Receiver<InventoryCmd>,
    snapshot_tx: watch::Sender<InventorySnapshot>,
    states: InventorySnapshot,
    /// Cached authoritative positions by token; None until the first feed.
    positions_cache: Option<HashMap<String, f64>>,
}

impl InventoryBook {
    pub fn spawn(cfg: InventoryConfig, store: Store) -> (InventoryHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let (snap_tx, snap_rx) = watch::channel(InventorySnapshot::new());
        let actor = Self::new(cfg, store, rx, snap_tx);
        let handle = InventoryHandle { tx, snapshot_rx: snap_rx };
        let join = tokio::spawn(actor.run());
        (handle, join)
    }

    pub fn new(
        cfg: InventoryConfig,
        store: Store,
        cmd_rx: mpsc::Receiver<InventoryCmd>,
        snapshot_tx: watch::Sender<InventorySnapshot>,
    ) -> Self {
        Self {
            cfg,
            store,
            cmd_rx,
            snapshot_tx,
            states: InventorySnapshot::new(),
            positions_cache: None,
        }
    }

    pub async fn run(mut self) {
        info!(
            "📦 inventory book started | tol={:.2} drift_warn={:.2} ttl={}m",
            self.cfg.verify_tolerance, self.cfg.drift_warn_threshold, self.cfg.pending_ttl_minutes,
        );

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                InventoryCmd::ApplyFill { obs, respond } => {
                    let out = self.handle_fill(&obs);
                    if let Some(tx) = respond {
                        let _ = tx.send(out);
                    }
                }
                InventoryCmd::SyncFromChain { mm_id, yes, no, respond } => {
                    let report = self.handle_chain_sync(mm_id, yes, no);
                    if let Some(tx) = respond {
                        let _ = tx.send(report);
                    }
                }
                InventoryCmd::PositionsSnapshot { positions } => {
                    self.positions_cache = Some(positions);
                }
                InventoryCmd::Pause { mm_id, reason } => self.handle_pause(mm_id, &reason),
                InventoryCmd::Resume { mm_id } => {
                    if let Err(e) = self.store.set_mm_paused(mm_id, false) {
                        error!("resume mm {mm_id}: {e}");
                    } else {
                        info!("▶️ mm {mm_id} resumed");
                    }
                }
                InventoryCmd::ConfigUpdate { mm_id, config } => {
                    if let Err(e) = self.store.update_mm_config(mm_id, &config) {
                        error!("config update mm {mm_id}: {e}");
                    }
                }
            }
            let _ = self.snapshot_tx.send(self.states.clone());
        }

        info!("📦 inventory book shutting down (channel closed)");
    }

    fn state_for(&mut self, mm_id: i64) -> MmState {
        if let Some(s) = self.states.get(&mm_id) {
            return s.clone();
        }
        let s = self
            .store
            .get_mm(mm_id)
            .ok()
            .flatten()
            .map(|r| r.state)
            .unwrap_or_default();
        self.states.insert(mm_id, s.clone());
        s
    }

    // ─────────────────────────────────────────────────
    // Fill application
    // ─────────────────────────────────────────────────

    pub fn handle_fill(&mut self, obs: &FillObservation) -> FillOutcome {
        // Idempotency: one application per (order_id, matched_total_after).
        // The key is only *claimed* at apply time so a parked fill can still
        // be promoted later; replays of a parked fill are swallowed by the
        // pending table's own unique index.
        match self
            .store
            .fill_already_applied(&obs.order_id, obs.matched_total_after)
        {
            Ok(false) => {}
            Ok(true) => {
                debug!(
                    order_id = %obs.order_id,
                    matched_total = obs.matched_total_after,
                    "duplicate fill discarded"
                );
                return FillOutcome::Duplicate;
            }
            Err(e) => return FillOutcome::Error(e.to_string()),
        }

        let state = self.state_for(obs.mm_id);

        // Verify non-authoritative sources against the cached positions.
        if obs.source != FillSource::Promotion {
            match self.verify_fill(&state, obs) {
                Verification::Accepted => {}
                Verification::Degraded => {
                    warn!(
                        "⚠️ positions cache unavailable — accepting {} {} fill {:.2}@{:.3} unverified",
                        obs.outcome.as_str(),
                        obs.side.as_str(),
                        obs.delta,
                        obs.price,
                    );
                }
                Verification::Failed { observed, expected } => {
                    warn!(
                        "🚫 Fill verification failed: {} {} {:.2}@{:.3} order={} (position {:.2}, expected {:.2}) — parking",
                        obs.outcome.as_str(),
                        obs.side.as_str(),
                        obs.delta,
                        obs.price,
                        obs.order_id,
                        observed,
                        expected,
                    );
                    let pending = PendingFillEvent {
                        id: 0,
                        mm_id: obs.mm_id,
                        order_id: obs.order_id.clone(),
                        matched_total: obs.matched_total_after,
                        outcome: obs.outcome,
                        side: obs.side,
                        price: obs.price,
                        size: obs.delta,
                        status: PendingFillStatus::Pending,
                        observed_at: Utc::now(),
                    };
                    if let Err(e) = self.store.insert_pending_fill(&pending) {
                        error!("park pending fill: {e}");
                    }
                    return FillOutcome::Parked;
                }
            }
        }

        match self.apply_and_persist(obs, state) {
            Ok(true) => FillOutcome::Applied,
            Ok(false) => FillOutcome::Duplicate,
            Err(e) => FillOutcome::Error(e.to_string()),
        }
    }

    /// Claim the idempotency key and apply. Ok(false) = key already taken.
    fn apply_and_persist(&mut self, obs: &FillObservation, state: MmState) -> EngineResult<bool> {
        if !self
            .store
            .try_mark_fill_applied(&obs.order_id, obs.matched_total_after)?
        {
            return Ok(false);
        }
        let (new_state, realized_delta) = apply_fill(&state, obs.outcome, obs.side, obs.price, obs.delta);

        if let Err(msg) = new_state.check_invariants() {
            error!("💥 invariant violation applying fill to mm {}: {msg}", obs.mm_id);
            self.handle_pause(obs.mm_id, &format!("invariant violation: {msg}"));
            return Ok(false);
        }

        self.store.write_mm_state(obs.mm_id, &new_state)?;
        self.states.insert(obs.mm_id, new_state.clone());

        let fill = FillRecord {
            mm_id: obs.mm_id,
            outcome: obs.outcome,
            side: obs.side,
            price: obs.price,
            size: obs.delta,
            value: obs.price * obs.delta,
            realized_pnl_delta: realized_delta,
            filled_at: Utc::now(),
        };
        self.store.insert_fill(&fill)?;

        // Order lifecycle: advance the cumulative matched size and retire
        // the row once fully matched.
        if let Some(order) = self.store.get_tracked_order(&obs.order_id)? {
            let fully_matched = obs.matched_total_after >= order.size - 1e-9;
            if fully_matched {
                self.store.delete_tracked_order(&obs.order_id)?;
                self.store.log_event(
                    obs.mm_id,
                    QuoteEventKind::Fill,
                    serde_json::json!({
                        "order_id": obs.order_id,
                        "outcome": obs.outcome.as_str(),
                        "side": obs.side.as_str(),
                        "price": obs.price,
                        "size": obs.delta,
                        "realized_pnl_delta": realized_delta,
                    }),
                )?;
            } else {
                self.store.update_last_matched(&obs.order_id, obs.matched_total_after)?;
                self.store.log_event(
                    obs.mm_id,
                    QuoteEventKind::PartialFill,
                    serde_json::json!({
                        "order_id": obs.order_id,
                        "matched_total": obs.matched_total_after,
                        "size": obs.delta,
                    }),
                )?;
            }
        } else {
            // Fill for an order we no longer track (e.g. promotion after
            // cleanup): record the fill event only.
            self.store.log_event(
                obs.mm_id,
                QuoteEventKind::Fill,
                serde_json::json!({
                    "order_id": obs.order_id,
                    "outcome": obs.outcome.as_str(),
                    "side": obs.side.as_str(),
                    "price": obs.price,
                    "size": obs.delta,
                    "realized_pnl_delta": realized_delta,
                    "untracked": true,
                }),
            )?;
        }

        info!(
            "🔔 fill applied: mm={} {} {} {:.2}@{:.3} → YES {:.1}@{:.4} NO {:.1}@{:.4} pnl={:+.4}",
            obs.mm_id,
            obs.outcome.as_str(),
            obs.side.as_str(),
            obs.delta,
            obs.price,
            self.states[&obs.mm_id].yes_inventory,
            self.states[&obs.mm_id].avg_yes_cost,
            self.states[&obs.mm_id].no_inventory,
            self.states[&obs.mm_id].avg_no_cost,
            realized_delta,
        );
        Ok(true)
    }

    fn verify_fill(&self, state: &MmState, obs: &FillObservation) -> Verification {
        let Some(cache) = &self.positions_cache else {
            return Verification::Degraded;
        };
        let observed = cache.get(&obs.token).copied().unwrap_or(0.0);
        let signed_delta = match obs.side {
            OrderSide::Buy => obs.delta,
            OrderSide::Sell => -obs.delta,
        };
        let expected = state.inventory(obs.outcome) + signed_delta;
        if (observed - expected).abs() <= self.cfg.verify_tolerance {
            Verification::Accepted
        } else {
            Verification::Failed { observed, expected }
        }
    }

    // ─────────────────────────────────────────────────
    // Chain sync: promote, warn, overwrite
    // ─────────────────────────────────────────────────

    fn handle_chain_sync(&mut self, mm_id: i64, yes: ChainPosition, no: ChainPosition) -> SyncReport {
        let state = self.state_for(mm_id);
        let mut report = SyncReport {
            drift_yes: yes.size - state.yes_inventory,
            drift_no: no.size - state.no_inventory,
            ..Default::default()
        };

        // 1. Promote pending fills the chain now corroborates, oldest first.
        report.promoted = self.promote_pending(mm_id, report.drift_yes, report.drift_no);

        // 2. Expire the ones the chain never backed.
        if let Err(e) = self
            .store
            .expire_pending_fills(Duration::minutes(self.cfg.pending_ttl_minutes))
        {
            error!("expire pending fills: {e}");
        }

        // 3. Drift warning (measured before overwrite, after promotion).
        let state = self.state_for(mm_id);
        let drift_yes = yes.size - state.yes_inventory;
        let drift_no = no.size - state.no_inventory;
        if drift_yes.abs() >= self.cfg.drift_warn_threshold
            || drift_no.abs() >= self.cfg.drift_warn_threshold
        {
            warn!(
                "📐 inventory drift on mm {mm_id}: YES local {:.2} vs chain {:.2} ({:+.2}); NO local {:.2} vs chain {:.2} ({:+.2})",
                state.yes_inventory, yes.size, drift_yes,
                state.no_inventory, no.size, drift_no,
            );
        }

        // 4. Positions feed is the source of truth: overwrite.
        let mut new_state = state.clone();
        new_state.yes_inventory = yes.size.max(0.0);
        new_state.no_inventory = no.size.max(0.0);
        new_state.avg_yes_cost = if new_state.yes_inventory > 0.0 { yes.avg_price } else { 0.0 };
        new_state.avg_no_cost = if new_state.no_inventory > 0.0 { no.avg_price } else { 0.0 };

        if let Err(e) = self.store.write_mm_state(mm_id, &new_state) {
            error!("chain sync write mm {mm_id}: {e}");
            return report;
        }
        self.states.insert(mm_id, new_state);
        report
    }

    /// Convert PENDING events to CONFIRMED while actual drift in the right
    /// direction covers them (± tolerance). Partially covered events keep
    /// their remainder pending.
    fn promote_pending(&mut self, mm_id: i64, drift_yes: f64, drift_no: f64) -> usize {
        let pending = match self.store.list_pending_fills(mm_id) {
            Ok(p) => p,
            Err(e) => {
                error!("list pending fills: {e}");
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }

        // Uncovered drift per (outcome, direction); each promotion eats it.
        let mut buy_yes = drift_yes.max(0.0);
        let mut sell_yes = (-drift_yes).max(0.0);
        let mut buy_no = drift_no.max(0.0);
        let mut sell_no = (-drift_no).max(0.0);

        let tol = self.cfg.verify_tolerance;
        let mut promoted = 0usize;

        for ev in pending {
            let slot = match (ev.outcome, ev.side) {
                (Outcome::Yes, OrderSide::Buy) => &mut buy_yes,
                (Outcome::Yes, OrderSide::Sell) => &mut sell_yes,
                (Outcome::No, OrderSide::Buy) => &mut buy_no,
                (Outcome::No, OrderSide::Sell) => &mut sell_no,
            };
            if *slot + tol >= ev.size {
                // Fully covered: confirm and apply.
                *slot = (*slot - ev.size).max(0.0);
                if let Err(e) = self
                    .store
                    .set_pending_fill_status(ev.id, PendingFillStatus::Confirmed)
                {
                    error!("confirm pending {}: {e}", ev.id);
                    continue;
                }
                let obs = FillObservation {
                    mm_id,
                    order_id: ev.order_id.clone(),
                    token: String::new(),
                    outcome: ev.outcome,
                    side: ev.side,
                    price: ev.price,
                    delta: ev.size,
                    matched_total_after: ev.matched_total,
                    source: FillSource::Promotion,
                };
                let state = self.state_for(mm_id);
                if let Err(e) = self.apply_and_persist(&obs, state) {
                    error!("apply promoted fill: {e}");
                } else {
                    info!(
                        "✅ pending fill promoted: mm={mm_id} {} {} {:.2}@{:.3}",
                        ev.outcome.as_str(),
                        ev.side.as_str(),
                        ev.size,
                        ev.price,
                    );
                    promoted += 1;
                }
            } else if *slot > tol {
                // Partially covered: confirm the covered part, keep the rest.
                let covered = *slot;
                *slot = 0.0;
                if let Err(e) = self.store.shrink_pending_fill(ev.id, ev.size - covered) {
                    error!("shrink pending {}: {e}", ev.id);
                    continue;
                }
                let obs = FillObservation {
                    mm_id,
                    order_id: ev.order_id.clone(),
                    token: String::new(),
                    outcome: ev.outcome,
                    side: ev.side,
                    price: ev.price,
                    delta: covered,
                    // Partial promotion uses a shifted idempotency key so the
                    // remainder can still confirm later.
                    matched_total_after: ev.matched_total - (ev.size - covered),
                    source: FillSource::Promotion,
                };
                let state = self.state_for(mm_id);
                if let Err(e) = self.apply_and_persist(&obs, state) {
                    error!("apply partial promotion: {e}");
                } else {
                    info!(
                        "✅ pending fill partially promoted: mm={mm_id} {:.2} of {:.2}",
                        covered, ev.size,
                    );
                    promoted += 1;
                }
            }
        }
        promoted
    }

    fn handle_pause(&mut self, mm_id: i64, reason: &str) {
        if let Err(e) = self.store.set_mm_paused(mm_id, true) {
            error!("pause mm {mm_id}: {e}");
            return;
        }
        let _ = self.store.log_event(
            mm_id,
            QuoteEventKind::Pause,
            serde_json::json!({ "reason": reason }),
        );
        warn!("⏸️ mm {mm_id} paused: {reason}");
    }
}

enum Verification {
    Accepted,
    Degraded,
    Failed { observed: f64, expected: f64 },
}

// ─────────────────────────────────────────────────────────
// The pure fill transition
// ─────────────────────────────────────────────────────────

/// Apply one fill to an MM state. Returns the new state and the realized
/// P&L delta (non-zero only for sells against held inventory).
pub fn apply_fill(
    state: &MmState,
    outcome: Outcome,
    side: OrderSide,
    price: f64,
    delta: f64,
) -> (MmState, f64) {
    let mut s = state.clone();
    let (inv, avg) = match outcome {
        Outcome::Yes => (s.yes_inventory, s.avg_yes_cost),
        Outcome::No => (s.no_inventory, s.avg_no_cost),
    };

    let (new_inv, new_avg, realized) = match side {
        OrderSide::Buy => {
            let new_inv = inv + delta;
            let new_avg = if new_inv > 0.0 {
                (avg * inv + price * delta) / new_inv
            } else {
                0.0
            };
            (new_inv, new_avg, 0.0)
        }
        OrderSide::Sell => {
            let realized = if inv > 0.0 {
                (price - avg) * delta.min(inv)
            } else {
                0.0
            };
            let new_inv = (inv - delta).max(0.0);
            let new_avg = if new_inv > 0.0 { avg } else { 0.0 };
            (new_inv, new_avg, realized)
        }
    };

    match outcome {
        Outcome::Yes => {
            s.yes_inventory = new_inv;
            s.avg_yes_cost = new_avg;
        }
        Outcome::No => {
            s.no_inventory = new_inv;
            s.avg_no_cost = new_avg;
        }
    }
    s.realized_pnl += realized;
    (s, realized)
}
