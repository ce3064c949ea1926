//! Job scheduling.
//!
//! Interval-driven tokio loops, one per job, with three exclusion layers:
//! a per-job `AtomicBool` (the same job never overlaps itself; an overrun
//! skips the next tick instead of queueing it), a shared guard across the
//! sync family (inventory sync and full sync never interleave), and
//! store-backed advisory leases so a second process instance cannot run
//! the same job concurrently.
//!
//! The kill switch blocks every scheduled job. Startup order: one full
//! sync, one candidate refresh (if enabled), then the intervals are armed;
//! the push listener is started by the binary after that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeSettings;
use crate::quoting::cycle::QuoteCycle;
use crate::reconcile::Reconciler;
use crate::screening::{screen, ScreeningConfig, ScreeningInput};
use crate::store::Store;
use crate::venue::types::MarketFilter;
use crate::venue::{with_retry, VenueRegistry};
use crate::grid::PriceGrid;

/// Advisory lease length; jobs renew by re-acquiring on each run.
const LOCK_LEASE_SECS: i64 = 300;

#[derive(Default)]
pub struct JobGuards {
    pub quote: AtomicBool,
    pub scan: AtomicBool,
    pub inventory_sync: AtomicBool,
    pub full_sync: AtomicBool,
    pub candidates: AtomicBool,
    /// Shared across the sync family.
    pub sync_family: AtomicBool,
}

pub struct Scheduler {
    store: Store,
    registry: VenueRegistry,
    cycle: Arc<QuoteCycle>,
    reconciler: Arc<Reconciler>,
    guards: Arc<JobGuards>,
    instance: String,
    shutdown_rx: watch::Receiver<bool>,
    /// Degraded-subsystem notes surfaced by the status endpoint.
    degraded: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        registry: VenueRegistry,
        cycle: Arc<QuoteCycle>,
        reconciler: Arc<Reconciler>,
        instance: String,
        shutdown_rx: watch::Receiver<bool>,
        degraded: Arc<parking_lot::Mutex<Vec<String>>>,
    ) -> Self {
        Self {
            store,
            registry,
            cycle,
            reconciler,
            guards: Arc::new(JobGuards::default()),
            instance,
            shutdown_rx,
            degraded,
        }
    }

    /// Current settings: store row if present, else environment seed.
    pub fn settings(&self) -> RuntimeSettings {
        match self.store.load_settings() {
            Ok(Some(s)) => s,
            Ok(None) => RuntimeSettings::from_env(),
            Err(e) => {
                error!("settings load failed ({e}); using env seed");
                RuntimeSettings::from_env()
            }
        }
    }

    fn kill_switch_on(&self, settings: &RuntimeSettings) -> bool {
        if settings.kill_switch_active {
            debug!("kill switch active — job blocked");
            true
        } else {
            false
        }
    }

    /// Run `f` under the per-job guard, the optional family guard and an
    /// advisory lease. Any guard being busy skips the run entirely.
    async fn run_exclusive<F, Fut>(
        &self,
        name: &'static str,
        guard: &AtomicBool,
        family: Option<&AtomicBool>,
        f: F,
    ) where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if guard.swap(true, Ordering::SeqCst) {
            debug!("⏭️ {name}: previous run still in flight — skipping tick");
            return;
        }
        if let Some(fam) = family {
            if fam.swap(true, Ordering::SeqCst) {
                debug!("⏭️ {name}: sync family busy — skipping tick");
                guard.store(false, Ordering::SeqCst);
                return;
            }
        }
        let leased = match self.store.try_acquire_lock(name, &self.instance, LOCK_LEASE_SECS) {
            Ok(true) => true,
            Ok(false) => {
                debug!("⏭️ {name}: advisory lease held elsewhere — skipping tick");
                false
            }
            Err(e) => {
                warn!("{name}: advisory lock error: {e}");
                false
            }
        };
        if leased {
            f().await;
            if let Err(e) = self.store.release_lock(name, &self.instance) {
                warn!("{name}: lease release failed: {e}");
            }
        }
        if let Some(fam) = family {
            fam.store(false, Ordering::SeqCst);
        }
        guard.store(false, Ordering::SeqCst);
    }

    fn note_degraded(&self, reason: String) {
        let mut d = self.degraded.lock();
        if !d.contains(&reason) {
            d.push(reason);
        }
    }

    fn clear_degraded(&self, prefix: &str) {
        self.degraded.lock().retain(|r| !r.starts_with(prefix));
    }

    // ─────────────────────────────────────────────────
    // Job bodies
    // ─────────────────────────────────────────────────

    async fn quote_job(&self) {
        let settings = self.settings();
        if self.kill_switch_on(&settings) {
            return;
        }
        let guards = self.guards.clone();
        self.run_exclusive("quote_loop", &guards.quote, None, || async {
            self.cycle.run_all(&settings).await;
        })
        .await;
    }

    async fn inventory_sync_job(&self) {
        let settings = self.settings();
        if self.kill_switch_on(&settings) {
            return;
        }
        let guards = self.guards.clone();
        self.run_exclusive(
            "inventory_sync",
            &guards.inventory_sync,
            Some(&guards.sync_family),
            || async {
                match self.reconciler.inventory_sync().await {
                    Ok(()) => self.clear_degraded("positions"),
                    Err(e) => {
                        warn!("inventory sync: {e}");
                        self.note_degraded(format!("positions: {e}"));
                    }
                }
            },
        )
        .await;
    }

    async fn full_sync_job(&self) {
        let settings = self.settings();
        if self.kill_switch_on(&settings) {
            return;
        }
        let guards = self.guards.clone();
        self.run_exclusive(
            "full_sync",
            &guards.full_sync,
            Some(&guards.sync_family),
            || async {
                if let Err(e) = self.reconciler.full_sync().await {
                    warn!("full sync: {e}");
                }
            },
        )
        .await;
    }

    /// Refresh enrolled markets: cached metadata, end-of-life detection.
    async fn scan_job(&self) {
        let settings = self.settings();
        if self.kill_switch_on(&settings) {
            return;
        }
        let guards = self.guards.clone();
        self.run_exclusive("market_scan", &guards.scan, None, || async {
            let markets = match self.store.list_active_markets() {
                Ok(m) => m,
                Err(e) => {
                    warn!("scan: list markets: {e}");
                    return;
                }
            };
            let now = chrono::Utc::now();
            for market in markets {
                // End-of-life first: past end-time markets stop quoting.
                if let Some(end) = market.end_time {
                    if end <= now {
                        info!("🏁 {} passed its end time — deactivating", market.market_id);
                        let _ = self.store.deactivate_market(&market.market_id);
                        if let Ok(Some(mm)) = self.store.get_mm_by_market(&market.market_id) {
                            let _ = self.store.set_mm_active(mm.id, false);
                        }
                        continue;
                    }
                }
                let Ok(adapter) = self.registry.get(&market.venue) else {
                    continue;
                };
                match adapter.get_market(&market.market_id).await {
                    Ok(vm) if vm.closed || !vm.active => {
                        info!("🏁 {} closed at venue — deactivating", market.market_id);
                        let _ = self.store.deactivate_market(&market.market_id);
                        if let Ok(Some(mm)) = self.store.get_mm_by_market(&market.market_id) {
                            let _ = self.store.set_mm_active(mm.id, false);
                        }
                    }
                    Ok(vm) => {
                        let mut m = market.clone();
                        m.price_ranges = vm.price_ranges;
                        m.end_time = vm.end_time.or(m.end_time);
                        let _ = self.store.upsert_market(&m);
                    }
                    Err(e) => debug!("scan {}: {e}", market.market_id),
                }
            }
        })
        .await;
    }

    /// Score the candidate universe and cache the results.
    async fn candidates_job(&self) {
        let settings = self.settings();
        if self.kill_switch_on(&settings) {
            return;
        }
        let guards = self.guards.clone();
        self.run_exclusive("mm_candidates", &guards.candidates, None, || async {
            let cfg = screening_config(&settings);
            for venue_id in self.registry.venue_ids() {
                let Ok(adapter) = self.registry.get(&venue_id) else {
                    continue;
                };
                let filter = MarketFilter {
                    active_only: true,
                    min_volume_24h: Some(settings.min_liquidity),
                    limit: Some(200),
                };
                let markets = match with_retry("list_markets", || {
                    let a = adapter.clone();
                    let f = filter.clone();
                    async move { a.list_markets(&f).await }
                })
                .await
                {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("candidates: list markets on {venue_id}: {e}");
                        continue;
                    }
                };

                let mut scored = 0usize;
                let mut eligible = 0usize;
                for vm in &markets {
                    if !vm.is_binary() {
                        continue;
                    }
                    // Serve from cache while the TTL holds.
                    if let Ok(Some(_)) = self
                        .store
                        .fresh_candidate(&vm.market_id, settings.candidate_ttl_hours)
                    {
                        continue;
                    }
                    let yes_token = &vm.tokens[0];
                    let (book, mid, spread) = tokio::join!(
                        adapter.orderbook_snapshot(yes_token),
                        adapter.midpoint(yes_token),
                        adapter.spread(yes_token),
                    );
                    let Ok(book) = book else { continue };
                    let grid = PriceGrid::new(vm.price_ranges.clone());
                    let candidate = screen(
                        &ScreeningInput {
                            market: vm,
                            yes_book: &book,
                            no_book: None,
                            auth_midpoint: mid.ok().flatten(),
                            auth_spread: spread.ok().flatten(),
                            grid: &grid,
                            venue: &venue_id,
                        },
                        &cfg,
                    );
                    if candidate.eligible {
                        eligible += 1;
                    }
                    scored += 1;
                    if let Err(e) = self.store.upsert_candidate(&candidate) {
                        warn!("candidate upsert {}: {e}", vm.market_id);
                    }
                }
                info!("🔍 candidates on {venue_id}: {scored} scored, {eligible} eligible");
            }
        })
        .await;
    }

    // ─────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────

    /// Startup sequence, then arm the interval loops. Returns the spawned
    /// job handles so the binary can await them on shutdown.
    pub async fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let settings = self.settings();
        info!(
            "🗓️ scheduler starting | quote={}s inv_sync={}s full_sync={}s scan={}s candidates={}s",
            settings.mm_interval_secs,
            settings.inventory_sync_interval_secs,
            settings.sync_interval_secs,
            settings.scan_interval_secs,
            settings.mm_candidates_interval_secs,
        );

        // (1) One full sync before any quoting.
        self.full_sync_job().await;
        // (2) One candidate refresh if enabled.
        if settings.mm_candidates_interval_secs > 0 {
            self.candidates_job().await;
        }

        // (3) Arm the cron loops.
        let mut handles = Vec::new();
        handles.push(self.clone().spawn_loop(settings.mm_interval_secs, JobKind::Quote));
        handles.push(
            self.clone()
                .spawn_loop(settings.inventory_sync_interval_secs, JobKind::InventorySync),
        );
        handles.push(self.clone().spawn_loop(settings.sync_interval_secs, JobKind::FullSync));
        handles.push(self.clone().spawn_loop(settings.scan_interval_secs, JobKind::Scan));
        if settings.mm_candidates_interval_secs > 0 {
            handles.push(
                self.clone()
                    .spawn_loop(settings.mm_candidates_interval_secs, JobKind::Candidates),
            );
        }
        handles
    }

    fn spawn_loop(self: Arc<Self>, interval_secs: u64, kind: JobKind) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the startup sequence already
            // covered that ground.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match kind {
                            JobKind::Quote => self.quote_job().await,
                            JobKind::InventorySync => self.inventory_sync_job().await,
                            JobKind::FullSync => self.full_sync_job().await,
                            JobKind::Scan => self.scan_job().await,
                            JobKind::Candidates => self.candidates_job().await,
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("job loop {kind:?} stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum JobKind {
    Quote,
    InventorySync,
    FullSync,
    Scan,
    Candidates,
}

fn screening_config(settings: &RuntimeSettings) -> ScreeningConfig {
    ScreeningConfig {
        min_time_to_end_hours: settings.mm_min_time_to_resolution,
        max_spread_ticks: settings.max_spread_ticks,
        min_top_depth_notional: settings.min_liquidity,
        exclude_mid_lt: settings.min_prob,
        exclude_mid_gt: settings.max_prob,
        assumed_order_size: settings.mm_default_order_size,
        ..ScreeningConfig::default()
    }
}
