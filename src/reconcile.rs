//! Reconciliation against the venue and the chain.
//!
//! Two cadences. The fast inventory sync fetches authoritative positions
//! and overwrites MM inventory through the FSM (which first promotes any
//! pending fills the chain now corroborates). The hourly full sync also
//! walks every tracked order, classifies the ones the venue no longer
//! lists, applies unrecorded fills, and explains position drift with a
//! small set of heuristics.
//!
//! Destructive honesty rule: if the venue reports zero open orders while
//! we track some, the orders pass is skipped; a flaky feed must never
//! trigger a mass delete.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::inventory::{ChainPosition, FillObservation, FillSource, InventoryHandle};
use crate::store::Store;
use crate::types::{OrderSide, Outcome, QuoteEventKind, TrackedOrder};
use crate::venue::types::{OpenOrdersFilter, OrderLookup, StatusClass, VenuePosition};
use crate::venue::{with_retry, VenueRegistry};

/// Token required by the reset-to-chain operation. Irreversible; the
/// caller must echo it exactly.
pub const RESET_CONFIRMATION_TOKEN: &str = "CONFIRM-RESET-TO-CHAIN";

// ─────────────────────────────────────────────────────────
// Drift heuristics
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriftKind {
    ExternalSale,
    PositionMerged,
    UntrackedReduction,
    UntrackedIncrease,
    TrackedSellsNotSynced,
}

impl DriftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftKind::ExternalSale => "EXTERNAL_SALE",
            DriftKind::PositionMerged => "POSITION_MERGED",
            DriftKind::UntrackedReduction => "UNTRACKED_REDUCTION",
            DriftKind::UntrackedIncrease => "UNTRACKED_INCREASE",
            DriftKind::TrackedSellsNotSynced => "TRACKED_SELLS_NOT_SYNCED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftIssue {
    pub mm_id: i64,
    pub outcome: Outcome,
    pub drift: f64,
    pub kind: DriftKind,
}

/// Explain one outcome's drift from recent activity.
///
/// `drift` is chain minus local. `recent_sells` is the share total of SELL
/// fills recorded in the lookback window; `other_outcome_drift` feeds the
/// merge heuristic (merging YES+NO burns both sides equally).
pub fn classify_drift(
    _outcome: Outcome,
    drift: f64,
    other_outcome_drift: f64,
    recent_sells: f64,
    has_active_sell_orders: bool,
) -> Option<DriftKind> {
    const EPS: f64 = 1e-9;
    if drift.abs() < EPS {
        return None;
    }
    if drift > 0.0 {
        return Some(DriftKind::UntrackedIncrease);
    }
    let loss = -drift;
    if recent_sells + 1e-9 >= loss {
        // Our own recorded sells already explain it; the feed lags.
        return Some(DriftKind::TrackedSellsNotSynced);
    }
    if (drift - other_outcome_drift).abs() < EPS && other_outcome_drift < 0.0 {
        return Some(DriftKind::PositionMerged);
    }
    if has_active_sell_orders {
        // A resting ask may have filled without us seeing it yet.
        return Some(DriftKind::UntrackedReduction);
    }
    Some(DriftKind::ExternalSale)
}

// ─────────────────────────────────────────────────────────
// Missing-order classification
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum MissingOrderAction {
    /// Venue has no memory of it: tracked row is stale, delete.
    DeleteStale,
    /// Venue says LIVE even though the open list missed it: keep and warn.
    /// Never assume filled without a reported match.
    KeepAndWarn,
    /// Terminal with a cumulative match; apply the unrecorded delta first.
    Terminal { status: String, size_matched: f64 },
}

pub fn classify_missing_order(lookup: &OrderLookup) -> MissingOrderAction {
    match lookup {
        OrderLookup::NotFound => MissingOrderAction::DeleteStale,
        OrderLookup::Found(order) => match order.status_class() {
            StatusClass::Live => MissingOrderAction::KeepAndWarn,
            StatusClass::Terminal | StatusClass::Unknown => MissingOrderAction::Terminal {
                status: order.status.clone(),
                size_matched: order.size_matched,
            },
        },
    }
}

// ─────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct FullSyncReport {
    pub orders_checked: usize,
    pub stale_deleted: usize,
    pub kept_live: usize,
    pub fills_applied: usize,
    pub orders_pass_skipped: bool,
    pub issues: Vec<DriftIssue>,
}

pub struct Reconciler {
    store: Store,
    registry: VenueRegistry,
    inventory: InventoryHandle,
}

impl Reconciler {
    pub fn new(store: Store, registry: VenueRegistry, inventory: InventoryHandle) -> Self {
        Self {
            store,
            registry,
            inventory,
        }
    }

    /// Fetch positions across venues, keyed by token. `None` = degraded.
    async fn fetch_positions(&self) -> Option<HashMap<String, VenuePosition>> {
        let mut all: HashMap<String, VenuePosition> = HashMap::new();
        let mut any_ok = false;
        for venue_id in self.registry.venue_ids() {
            let Ok(adapter) = self.registry.get(&venue_id) else {
                continue;
            };
            let res = with_retry("positions", || {
                let a = adapter.clone();
                async move { a.positions().await }
            })
            .await;
            match res {
                Ok(Some(positions)) => {
                    any_ok = true;
                    for p in positions {
                        all.insert(p.token.clone(), p);
                    }
                }
                Ok(None) => {
                    warn!("📉 positions feed degraded on venue {venue_id}");
                }
                Err(e) => {
                    warn!("📉 positions fetch failed on venue {venue_id}: {e}");
                }
            }
        }
        if any_ok {
            Some(all)
        } else {
            None
        }
    }

    /// Fast sync (~10 s): positions are the source of truth.
    pub async fn inventory_sync(&self) -> EngineResult<()> {
        let Some(positions) = self.fetch_positions().await else {
            return Err(EngineError::degraded(
                "positions feed returned nothing; keeping local inventory",
            ));
        };

        // Refresh the FSM's verification cache.
        let size_map: HashMap<String, f64> =
            positions.iter().map(|(k, v)| (k.clone(), v.size)).collect();
        self.inventory.positions_snapshot(size_map).await;

        for mm in self.store.list_active_mms()? {
            let Some(market) = self.store.get_market(&mm.market_id)? else {
                continue;
            };
            let yes = chain_position(&positions, &market.yes_token);
            let no = chain_position(&positions, &market.no_token);

            // A resolved token means the market is done; flag it inactive.
            if positions
                .get(&market.yes_token)
                .map(|p| p.is_resolved())
                .unwrap_or(false)
            {
                info!("🏁 {} reports resolved positions — deactivating", market.market_id);
                self.store.deactivate_market(&market.market_id)?;
                self.store.set_mm_active(mm.id, false)?;
                continue;
            }

            if let Some(report) = self.inventory.sync_from_chain(mm.id, yes, no).await {
                if report.promoted > 0 {
                    debug!("mm {} promoted {} pending fill(s)", mm.id, report.promoted);
                }
            }
        }
        Ok(())
    }

    /// Full sync (hourly): orders pass then positions pass.
    pub async fn full_sync(&self) -> EngineResult<FullSyncReport> {
        let mut report = FullSyncReport::default();

        let tracked = self.store.list_all_tracked_orders()?;
        report.orders_checked = tracked.len();

        if !tracked.is_empty() {
            self.orders_pass(&tracked, &mut report).await?;
        }

        self.positions_pass(&mut report).await?;

        info!(
            "🔄 full sync: {} tracked checked, {} stale deleted, {} kept live, {} fills applied, {} drift issue(s){}",
            report.orders_checked,
            report.stale_deleted,
            report.kept_live,
            report.fills_applied,
            report.issues.len(),
            if report.orders_pass_skipped { " [orders pass skipped]" } else { "" },
        );
        Ok(report)
    }

    async fn orders_pass(
        &self,
        tracked: &[TrackedOrder],
        report: &mut FullSyncReport,
    ) -> EngineResult<()> {
        // Group tracked orders by venue so each venue is listed once.
        let mut by_venue: HashMap<String, Vec<&TrackedOrder>> = HashMap::new();
        for o in tracked {
            let Some(mm) = self.store.get_mm(o.mm_id)? else {
                continue;
            };
            let Some(market) = self.store.get_market(&mm.market_id)? else {
                continue;
            };
            by_venue.entry(market.venue).or_default().push(o);
        }

        for (venue_id, orders) in by_venue {
            let adapter = self.registry.get(&venue_id)?;
            let open = match with_retry("open_orders", || {
                let a = adapter.clone();
                async move { a.open_orders(&OpenOrdersFilter::default()).await }
            })
            .await
            {
                Ok(o) => o,
                Err(e) => {
                    warn!("open orders fetch failed on {venue_id}: {e} — skipping pass");
                    report.orders_pass_skipped = true;
                    continue;
                }
            };

            if open.is_empty() && !orders.is_empty() {
                // Empty list + tracked orders smells like a bad feed.
                warn!(
                    "🛑 venue {venue_id} reports zero open orders while {} tracked — skipping orders pass",
                    orders.len(),
                );
                report.orders_pass_skipped = true;
                continue;
            }

            let open_ids: HashMap<&str, &crate::venue::types::VenueOrder> =
                open.iter().map(|o| (o.order_id.as_str(), o)).collect();

            for order in orders {
                if open_ids.contains_key(order.order_id.as_str()) {
                    continue; // still resting, nothing to reconcile
                }
                let lookup = with_retry("get_order", || {
                    let a = adapter.clone();
                    let id = order.order_id.clone();
                    async move { a.get_order(&id).await }
                })
                .await?;

                match classify_missing_order(&lookup) {
                    MissingOrderAction::DeleteStale => {
                        self.store.delete_tracked_order(&order.order_id)?;
                        self.store.log_event(
                            order.mm_id,
                            QuoteEventKind::OrderStale,
                            serde_json::json!({ "order_id": order.order_id }),
                        )?;
                        report.stale_deleted += 1;
                    }
                    MissingOrderAction::KeepAndWarn => {
                        warn!(
                            "👻 order {} LIVE at venue but missing from open list — keeping",
                            order.order_id,
                        );
                        report.kept_live += 1;
                    }
                    MissingOrderAction::Terminal { status, size_matched } => {
                        let prior = order.last_matched_size.unwrap_or(0.0);
                        if size_matched > prior + 1e-9 {
                            let delta = size_matched - prior;
                            let obs = FillObservation {
                                mm_id: order.mm_id,
                                order_id: order.order_id.clone(),
                                token: order.token.clone(),
                                outcome: order.key.outcome,
                                side: order.key.side,
                                price: order.price,
                                delta,
                                matched_total_after: size_matched,
                                source: FillSource::Reconciliation,
                            };
                            self.inventory.apply_fill(obs).await;
                            report.fills_applied += 1;
                        }
                        // The FSM retires fully matched rows itself; sweep
                        // whatever terminal remainder is left.
                        if self.store.delete_tracked_order(&order.order_id)? {
                            self.store.log_event(
                                order.mm_id,
                                QuoteEventKind::OrderCancelled,
                                serde_json::json!({
                                    "order_id": order.order_id,
                                    "status": status,
                                    "size_matched": size_matched,
                                }),
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn positions_pass(&self, report: &mut FullSyncReport) -> EngineResult<()> {
        let Some(positions) = self.fetch_positions().await else {
            warn!("📉 positions pass skipped: feed degraded");
            return Ok(());
        };
        let size_map: HashMap<String, f64> =
            positions.iter().map(|(k, v)| (k.clone(), v.size)).collect();
        self.inventory.positions_snapshot(size_map).await;

        for mm in self.store.list_active_mms()? {
            let Some(market) = self.store.get_market(&mm.market_id)? else {
                continue;
            };
            let yes = chain_position(&positions, &market.yes_token);
            let no = chain_position(&positions, &market.no_token);

            let drift_yes = yes.size - mm.state.yes_inventory;
            let drift_no = no.size - mm.state.no_inventory;

            let since = Utc::now() - Duration::hours(1);
            let recent_sells: f64 = self
                .store
                .recent_fills(mm.id, since)?
                .iter()
                .filter(|f| f.side == OrderSide::Sell)
                .map(|f| f.size)
                .sum();
            let has_sells = self
                .store
                .list_tracked_orders(mm.id)?
                .iter()
                .any(|o| o.key.side == OrderSide::Sell);

            for (outcome, drift, other) in [
                (Outcome::Yes, drift_yes, drift_no),
                (Outcome::No, drift_no, drift_yes),
            ] {
                if let Some(kind) = classify_drift(outcome, drift, other, recent_sells, has_sells) {
                    report.issues.push(DriftIssue {
                        mm_id: mm.id,
                        outcome,
                        drift,
                        kind,
                    });
                }
            }

            self.inventory.sync_from_chain(mm.id, yes, no).await;
        }
        Ok(())
    }

    /// Overwrite every MM from chain truth and drop all tracked orders.
    /// Irreversible; refuses without the exact confirmation token and
    /// refuses while the positions feed is degraded.
    pub async fn reset_to_chain(&self, confirmation: &str) -> EngineResult<usize> {
        if confirmation != RESET_CONFIRMATION_TOKEN {
            return Err(EngineError::permanent(
                "reset_to_chain refused: bad confirmation token",
            ));
        }
        let Some(positions) = self.fetch_positions().await else {
            return Err(EngineError::degraded(
                "reset_to_chain refused: positions feed degraded",
            ));
        };

        let mut cleared = 0usize;
        for mm in self.store.list_active_mms()? {
            let Some(market) = self.store.get_market(&mm.market_id)? else {
                continue;
            };
            let yes = chain_position(&positions, &market.yes_token);
            let no = chain_position(&positions, &market.no_token);
            self.inventory.sync_from_chain(mm.id, yes, no).await;
            cleared += self.store.delete_tracked_orders_for_mm(mm.id)?;
            self.store.log_event(
                mm.id,
                QuoteEventKind::Error,
                serde_json::json!({ "reason": "reset_to_chain" }),
            )?;
        }
        warn!("🧨 reset_to_chain executed: {cleared} tracked order(s) cleared");
        Ok(cleared)
    }
}

fn chain_position(positions: &HashMap<String, VenuePosition>, token: &str) -> ChainPosition {
    positions
        .get(token)
        .map(|p| ChainPosition {
            size: p.size,
            avg_price: p.avg_price,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InventoryBook, InventoryConfig};
    use crate::types::{Market, MmConfig, OrderKey};
    use crate::venue::types::{
        BestQuote, CancelAllFilter, MarketFilter, PlaceOrderOutcome, PlaceOrderRequest,
        VenueFill, VenueMarket, VenueOrder, WireSide,
    };
    use crate::venue::VenueAdapter;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    struct FakeVenue {
        open: StdMutex<Vec<VenueOrder>>,
        lookups: StdMutex<HashMap<String, VenueOrder>>,
        positions: StdMutex<Option<Vec<VenuePosition>>>,
    }

    impl FakeVenue {
        fn new() -> Self {
            Self {
                open: StdMutex::new(Vec::new()),
                lookups: StdMutex::new(HashMap::new()),
                positions: StdMutex::new(Some(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl VenueAdapter for FakeVenue {
        fn venue_id(&self) -> &str {
            "clob"
        }
        async fn list_markets(&self, _f: &MarketFilter) -> EngineResult<Vec<VenueMarket>> {
            Ok(vec![])
        }
        async fn get_market(&self, _id: &str) -> EngineResult<VenueMarket> {
            Err(EngineError::permanent("not used"))
        }
        async fn orderbook_snapshot(
            &self,
            _t: &str,
        ) -> EngineResult<crate::types::OrderbookSnapshot> {
            Ok(Default::default())
        }
        async fn midpoint(&self, _t: &str) -> EngineResult<Option<f64>> {
            Ok(None)
        }
        async fn spread(&self, _t: &str) -> EngineResult<Option<f64>> {
            Ok(None)
        }
        async fn best(&self, _t: &str) -> EngineResult<BestQuote> {
            Ok(Default::default())
        }
        async fn place_order(&self, _r: &PlaceOrderRequest) -> EngineResult<PlaceOrderOutcome> {
            Err(EngineError::permanent("not used"))
        }
        async fn place_orders(
            &self,
            _r: &[PlaceOrderRequest],
        ) -> EngineResult<Vec<PlaceOrderOutcome>> {
            Err(EngineError::permanent("not used"))
        }
        async fn cancel_order(&self, _id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn cancel_all(&self, _f: &CancelAllFilter) -> EngineResult<usize> {
            Ok(0)
        }
        async fn open_orders(&self, _f: &OpenOrdersFilter) -> EngineResult<Vec<VenueOrder>> {
            Ok(self.open.lock().unwrap().clone())
        }
        async fn get_order(&self, id: &str) -> EngineResult<OrderLookup> {
            Ok(self
                .lookups
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .map(OrderLookup::Found)
                .unwrap_or(OrderLookup::NotFound))
        }
        async fn positions(&self) -> EngineResult<Option<Vec<VenuePosition>>> {
            Ok(self.positions.lock().unwrap().clone())
        }
        async fn fills(&self, _s: chrono::DateTime<Utc>) -> EngineResult<Vec<VenueFill>> {
            Ok(vec![])
        }
    }

    fn venue_order(id: &str, status: &str, matched: f64) -> VenueOrder {
        VenueOrder {
            order_id: id.to_string(),
            token: "yes-tok".to_string(),
            side: WireSide::Buy,
            price: 0.50,
            original_size: 10.0,
            size_matched: matched,
            status: status.to_string(),
        }
    }

    async fn setup() -> (Store, NamedTempFile, i64, Reconciler, Arc<FakeVenue>) {
        let f = NamedTempFile::new().unwrap();
        let store = Store::open(f.path()).unwrap();
        let market = Market {
            market_id: "m1".to_string(),
            venue: "clob".to_string(),
            question: "?".to_string(),
            yes_token: "yes-tok".to_string(),
            no_token: "no-tok".to_string(),
            price_ranges: vec![],
            yes_mid: None,
            no_mid: None,
            last_updated: None,
            end_time: None,
            active: true,
        };
        store.upsert_market(&market).unwrap();
        let id = store.create_mm("m1", &MmConfig::default()).unwrap();

        let fake = Arc::new(FakeVenue::new());
        let mut registry = VenueRegistry::new();
        registry.register(fake.clone());

        let (handle, _join) = InventoryBook::spawn(InventoryConfig::default(), store.clone());
        let rec = Reconciler::new(store.clone(), registry, handle);
        (store, f, id, rec, fake)
    }

    fn tracked(mm_id: i64, id: &str, last_matched: Option<f64>) -> TrackedOrder {
        TrackedOrder {
            mm_id,
            key: OrderKey::new(Outcome::Yes, OrderSide::Buy, 0),
            order_id: id.to_string(),
            client_order_id: None,
            order_group_id: None,
            token: "yes-tok".to_string(),
            price: 0.50,
            size: 10.0,
            last_matched_size: last_matched,
            placed_at: Utc::now(),
        }
    }

    // ── Pure classification ──

    #[test]
    fn test_classify_missing_order() {
        assert_eq!(
            classify_missing_order(&OrderLookup::NotFound),
            MissingOrderAction::DeleteStale
        );
        assert_eq!(
            classify_missing_order(&OrderLookup::Found(venue_order("o", "LIVE", 0.0))),
            MissingOrderAction::KeepAndWarn
        );
        match classify_missing_order(&OrderLookup::Found(venue_order("o", "MATCHED", 10.0))) {
            MissingOrderAction::Terminal { size_matched, .. } => {
                assert!((size_matched - 10.0).abs() < 1e-9)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_drift_kinds() {
        // Gains are untracked increases.
        assert_eq!(
            classify_drift(Outcome::Yes, 5.0, 0.0, 0.0, false),
            Some(DriftKind::UntrackedIncrease)
        );
        // Losses our own sells explain: feed lag.
        assert_eq!(
            classify_drift(Outcome::Yes, -5.0, 0.0, 5.0, false),
            Some(DriftKind::TrackedSellsNotSynced)
        );
        // Equal loss on both outcomes: a merge burned the pair.
        assert_eq!(
            classify_drift(Outcome::Yes, -5.0, -5.0, 0.0, false),
            Some(DriftKind::PositionMerged)
        );
        // Active asks make an untracked fill plausible.
        assert_eq!(
            classify_drift(Outcome::Yes, -5.0, 0.0, 0.0, true),
            Some(DriftKind::UntrackedReduction)
        );
        // Otherwise somebody sold outside the engine.
        assert_eq!(
            classify_drift(Outcome::Yes, -5.0, 0.0, 0.0, false),
            Some(DriftKind::ExternalSale)
        );
        assert_eq!(classify_drift(Outcome::Yes, 0.0, 0.0, 0.0, false), None);
    }

    // ── Full sync behaviour ──

    #[tokio::test]
    async fn test_terminal_order_with_unrecorded_fills() {
        // Tracked order absent from the open list; get_order says MATCHED
        // with size_matched=10 while we recorded 3 → apply 7, delete row.
        let (store, _f, id, rec, fake) = setup().await;
        store.insert_tracked_order(&tracked(id, "o1", Some(3.0))).unwrap();
        // Another order still resting so the defensive skip doesn't fire.
        store.insert_tracked_order(&{
            let mut t = tracked(id, "o2", None);
            t.key = OrderKey::new(Outcome::No, OrderSide::Buy, 0);
            t.token = "no-tok".to_string();
            t
        })
        .unwrap();
        fake.open.lock().unwrap().push(venue_order("o2", "LIVE", 0.0));
        fake.lookups
            .lock()
            .unwrap()
            .insert("o1".to_string(), venue_order("o1", "MATCHED", 10.0));

        let report = rec.full_sync().await.unwrap();
        assert_eq!(report.fills_applied, 1);
        assert!(store.get_tracked_order("o1").unwrap().is_none());
        assert!(store.get_tracked_order("o2").unwrap().is_some());

        // 7 shares landed in inventory (degraded acceptance is fine here:
        // reconciliation fills verify against the positions cache too, and
        // the fake venue reported no positions).
        let mm = store.get_mm(id).unwrap().unwrap();
        // State was subsequently overwritten by the positions pass (chain
        // says 0); the fill record is the durable evidence.
        let fills = store
            .recent_fills(id, Utc::now() - Duration::minutes(5))
            .unwrap();
        assert_eq!(fills.len(), 1);
        assert!((fills[0].size - 7.0).abs() < 1e-9);
        assert!(mm.state.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_stale_order_deleted() {
        let (store, _f, id, rec, fake) = setup().await;
        store.insert_tracked_order(&tracked(id, "gone", None)).unwrap();
        store.insert_tracked_order(&{
            let mut t = tracked(id, "alive", None);
            t.key = OrderKey::new(Outcome::Yes, OrderSide::Sell, 0);
            t
        })
        .unwrap();
        fake.open.lock().unwrap().push(venue_order("alive", "LIVE", 0.0));
        // "gone" not in open list and lookup returns NotFound.

        let report = rec.full_sync().await.unwrap();
        assert_eq!(report.stale_deleted, 1);
        assert!(store.get_tracked_order("gone").unwrap().is_none());
        let events = store.recent_events(id, 10).unwrap();
        assert!(events.iter().any(|e| e.kind == QuoteEventKind::OrderStale));
    }

    #[tokio::test]
    async fn test_live_but_unlisted_kept() {
        let (store, _f, id, rec, fake) = setup().await;
        store.insert_tracked_order(&tracked(id, "ghost", None)).unwrap();
        store.insert_tracked_order(&{
            let mut t = tracked(id, "listed", None);
            t.key = OrderKey::new(Outcome::Yes, OrderSide::Sell, 0);
            t
        })
        .unwrap();
        fake.open.lock().unwrap().push(venue_order("listed", "LIVE", 0.0));
        fake.lookups
            .lock()
            .unwrap()
            .insert("ghost".to_string(), venue_order("ghost", "LIVE", 0.0));

        let report = rec.full_sync().await.unwrap();
        assert_eq!(report.kept_live, 1);
        assert!(store.get_tracked_order("ghost").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_open_orders_defensive_skip() {
        // Venue says nothing is open while we track two orders: refuse to
        // mass-delete.
        let (store, _f, id, rec, _fake) = setup().await;
        store.insert_tracked_order(&tracked(id, "a", None)).unwrap();
        store.insert_tracked_order(&{
            let mut t = tracked(id, "b", None);
            t.key = OrderKey::new(Outcome::Yes, OrderSide::Sell, 0);
            t
        })
        .unwrap();

        let report = rec.full_sync().await.unwrap();
        assert!(report.orders_pass_skipped);
        assert_eq!(report.stale_deleted, 0);
        assert_eq!(store.list_tracked_orders(id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inventory_sync_overwrites_from_chain() {
        let (store, _f, id, rec, fake) = setup().await;
        *fake.positions.lock().unwrap() = Some(vec![VenuePosition {
            token: "yes-tok".to_string(),
            size: 12.0,
            avg_price: 0.44,
            redeemable: false,
            cur_price: 0.5,
        }]);

        rec.inventory_sync().await.unwrap();
        let mm = store.get_mm(id).unwrap().unwrap();
        assert!((mm.state.yes_inventory - 12.0).abs() < 1e-9);
        assert!((mm.state.avg_yes_cost - 0.44).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_degraded_positions_refuses_overwrite() {
        let (store, _f, id, rec, fake) = setup().await;
        // Seed local state, then kill the feed.
        let mut st = store.get_mm(id).unwrap().unwrap().state;
        st.yes_inventory = 9.0;
        st.avg_yes_cost = 0.5;
        store.write_mm_state(id, &st).unwrap();
        *fake.positions.lock().unwrap() = None;

        let err = rec.inventory_sync().await.unwrap_err();
        assert!(matches!(err, EngineError::DataDegraded(_)));
        let mm = store.get_mm(id).unwrap().unwrap();
        assert!((mm.state.yes_inventory - 9.0).abs() < 1e-9); // untouched
    }

    #[tokio::test]
    async fn test_resolved_position_deactivates_market() {
        let (store, _f, id, rec, fake) = setup().await;
        *fake.positions.lock().unwrap() = Some(vec![VenuePosition {
            token: "yes-tok".to_string(),
            size: 10.0,
            avg_price: 0.44,
            redeemable: true,
            cur_price: 1.0,
        }]);
        rec.inventory_sync().await.unwrap();
        assert!(!store.get_market("m1").unwrap().unwrap().active);
        assert!(!store.get_mm(id).unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_reset_to_chain_guarded() {
        let (store, _f, id, rec, _fake) = setup().await;
        store.insert_tracked_order(&tracked(id, "o1", None)).unwrap();

        assert!(rec.reset_to_chain("yes please").await.is_err());
        assert_eq!(store.list_tracked_orders(id).unwrap().len(), 1);

        let cleared = rec.reset_to_chain(RESET_CONFIRMATION_TOKEN).await.unwrap();
        assert_eq!(cleared, 1);
        assert!(store.list_tracked_orders(id).unwrap().is_empty());
    }
}
