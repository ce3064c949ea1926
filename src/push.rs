//! Push event listener.
//!
//! One long-lived authenticated stream, subscribed to the `order`, `trade`
//! and `position` topics. The upstream library's auto-reconnect is not
//! used; the backoff policy lives here: exponential `base * 2^attempt`
//! plus jitter, capped, with a minimum gap between attempts and a streak
//! reset once a connection has stayed up long enough.
//!
//! Updates for the same order id are applied strictly in arrival order via
//! a per-order serial lane; unrelated orders run in parallel. Fill deltas
//! are verified by the inventory FSM before they touch state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::inventory::{ChainPosition, FillObservation, FillSource, InventoryHandle};
use crate::store::Store;
use crate::types::{Outcome, QuoteEventKind};
use crate::venue::types::{
    classify_status_str, json_f64, opt_json_f64, PushOrderMsg, PushPositionMsg, PushTradeMsg,
    StatusClass,
};

// ─────────────────────────────────────────────────────────
// Backoff policy
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub min_gap: Duration,
    /// A connection that survives this long resets the attempt streak.
    pub stable_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            jitter: Duration::from_millis(250),
            min_gap: Duration::from_secs(1),
            stable_after: Duration::from_secs(20),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (0-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.cap);
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        (exp + Duration::from_millis(jitter_ms)).max(self.min_gap)
    }
}

// ─────────────────────────────────────────────────────────
// Per-order serial lanes
// ─────────────────────────────────────────────────────────

/// FIFO lanes keyed by order id. Submitting to an idle key spawns a worker
/// that drains the lane and removes the entry when it runs dry; submitting
/// to a busy key appends. Same key → strict order; different keys → parallel.
pub struct SerialLanes<T> {
    inner: Arc<Mutex<HashMap<String, VecDeque<T>>>>,
}

impl<T> Clone for SerialLanes<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> SerialLanes<T> {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn submit<F, Fut>(&self, key: String, item: T, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        {
            let mut map = self.inner.lock();
            if let Some(queue) = map.get_mut(&key) {
                queue.push_back(item);
                return; // a worker is already draining this lane
            }
            map.insert(key.clone(), VecDeque::new());
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut current = item;
            loop {
                handler(current).await;
                let next = {
                    let mut map = inner.lock();
                    match map.get_mut(&key).and_then(|q| q.pop_front()) {
                        Some(n) => Some(n),
                        None => {
                            map.remove(&key);
                            None
                        }
                    }
                };
                match next {
                    Some(n) => current = n,
                    None => break,
                }
            }
        });
    }

    pub fn active_lanes(&self) -> usize {
        self.inner.lock().len()
    }
}

// ─────────────────────────────────────────────────────────
// Trade-event dedup
// ─────────────────────────────────────────────────────────

/// Bounded TTL cache keyed by trade identity so replayed trade events
/// after a reconnect are not double-counted. (Order events carry a
/// cumulative `size_matched`, which is self-deduplicating; trades report
/// per-event deltas and need this.)
pub struct DedupCache {
    seen_at: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen_at: HashMap::with_capacity(max_entries.min(4096)),
            ttl,
            max_entries,
        }
    }

    /// True the first time a key is seen inside the TTL window.
    pub fn remember(&mut self, key: String) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.ttl).unwrap_or(now);
        self.seen_at.retain(|_, ts| *ts >= cutoff);

        if self.seen_at.contains_key(&key) {
            return false;
        }
        self.seen_at.insert(key, now);
        while self.seen_at.len() > self.max_entries {
            let oldest = self
                .seen_at
                .iter()
                .min_by_key(|(_, ts)| *ts)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.seen_at.remove(&k);
                }
                None => break,
            }
        }
        true
    }
}

// ─────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// How often the token→MM map is rebuilt.
    pub token_map_refresh: Duration,
}

impl PushConfig {
    pub fn new(ws_url: String, api_key: String, api_secret: String, api_passphrase: String) -> Self {
        Self {
            ws_url,
            api_key,
            api_secret,
            api_passphrase,
            token_map_refresh: Duration::from_secs(300),
        }
    }
}

type TokenMap = HashMap<String, (i64, Outcome)>;

pub struct PushListener {
    cfg: PushConfig,
    backoff: BackoffPolicy,
    store: Store,
    inventory: InventoryHandle,
    shutdown_rx: watch::Receiver<bool>,
    token_map: Arc<Mutex<TokenMap>>,
    token_map_built: Arc<Mutex<Option<Instant>>>,
    lanes: SerialLanes<PushOrderMsg>,
    trade_dedup: Arc<Mutex<DedupCache>>,
}

impl PushListener {
    pub fn new(
        cfg: PushConfig,
        store: Store,
        inventory: InventoryHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            backoff: BackoffPolicy::default(),
            store,
            inventory,
            shutdown_rx,
            token_map: Arc::new(Mutex::new(TokenMap::new())),
            token_map_built: Arc::new(Mutex::new(None)),
            lanes: SerialLanes::new(),
            trade_dedup: Arc::new(Mutex::new(DedupCache::new(
                Duration::from_secs(15 * 60),
                50_000,
            ))),
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("📡 push listener started | url={}", self.cfg.ws_url);
        let mut attempt: u32 = 0;
        let mut last_attempt: Option<Instant> = None;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            if let Some(last) = last_attempt {
                let since = last.elapsed();
                if since < self.backoff.min_gap {
                    sleep(self.backoff.min_gap - since).await;
                }
            }
            last_attempt = Some(Instant::now());

            let connected_at = Instant::now();
            match self.clone().connect_and_listen().await {
                Ok(()) => info!("📡 push stream closed"),
                Err(e) => warn!("📡 push stream error: {e:#}"),
            }
            if *self.shutdown_rx.borrow() {
                break;
            }

            if connected_at.elapsed() >= self.backoff.stable_after {
                attempt = 0; // it held long enough; start the ladder over
            }
            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!("📡 reconnecting in {:.1}s (attempt {attempt})", delay.as_secs_f64());

            let mut shutdown = self.shutdown_rx.clone();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }
        info!("📡 push listener stopped");
    }

    async fn connect_and_listen(self: Arc<Self>) -> anyhow::Result<()> {
        let connect = tokio::time::timeout(
            Duration::from_secs(10),
            connect_async(&self.cfg.ws_url),
        )
        .await;
        let (ws, resp) = match connect {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => anyhow::bail!("connect: {e}"),
            Err(_) => anyhow::bail!("connect timeout"),
        };
        info!("✅ push stream connected (status={:?})", resp.status());
        let (mut write, mut read) = ws.split();

        let subscribe = json!({
            "operation": "subscribe",
            "topics": ["order", "trade", "position"],
            "auth": {
                "apiKey": self.cfg.api_key,
                "secret": self.cfg.api_secret,
                "passphrase": self.cfg.api_passphrase,
            },
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        // Keepalive.
        let ping = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                if write.send(Message::Text("PING".to_string())).await.is_err() {
                    break;
                }
            }
        });

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.route_text(&text).await,
                        Some(Ok(Message::Close(_))) => {
                            warn!("📡 server closed the stream");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("📡 read error: {e}");
                            break;
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
            }
        }

        ping.abort();
        Ok(())
    }

    async fn route_text(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let items = if value.is_array() {
            value.as_array().cloned().unwrap_or_default()
        } else {
            vec![value]
        };
        for item in items {
            self.route_event(&item).await;
        }
    }

    pub async fn route_event(&self, value: &Value) {
        let event_type = value
            .get("event_type")
            .or_else(|| value.get("type"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match event_type.as_str() {
            "order" => {
                let Ok(msg) = serde_json::from_value::<PushOrderMsg>(value.clone()) else {
                    debug!("unparsable order message");
                    return;
                };
                self.submit_order_update(msg);
            }
            "trade" => {
                let Ok(msg) = serde_json::from_value::<PushTradeMsg>(value.clone()) else {
                    debug!("unparsable trade message");
                    return;
                };
                self.handle_trade(&msg).await;
            }
            "position" => {
                let Ok(msg) = serde_json::from_value::<PushPositionMsg>(value.clone()) else {
                    debug!("unparsable position message");
                    return;
                };
                self.handle_position(&msg).await;
            }
            _ => {}
        }
    }

    /// Queue an order update on its serial lane.
    fn submit_order_update(&self, msg: PushOrderMsg) {
        let store = self.store.clone();
        let inventory = self.inventory.clone();
        let key = msg.id.clone();
        self.lanes.submit(key, msg, move |m| {
            let store = store.clone();
            let inventory = inventory.clone();
            async move {
                handle_order_update(&store, &inventory, &m).await;
            }
        });
    }

    /// Trade events fan out to their maker orders.
    async fn handle_trade(&self, msg: &PushTradeMsg) {
        for mo in &msg.maker_orders {
            let dedup_key = format!("tid:{}:mo:{}", msg.id, mo.order_id);
            if !self.trade_dedup.lock().remember(dedup_key) {
                debug!("duplicate trade event for {} — dropped", mo.order_id);
                continue;
            }
            let Some(tracked) = self.store.get_tracked_order(&mo.order_id).ok().flatten() else {
                continue;
            };
            let delta = opt_json_f64(&mo.matched_amount).unwrap_or(0.0);
            if delta <= 0.0 {
                continue;
            }
            let price = opt_json_f64(&mo.price)
                .or_else(|| opt_json_f64(&msg.price))
                .unwrap_or(tracked.price);
            let matched_total = tracked.last_matched_size.unwrap_or(0.0) + delta;
            let obs = FillObservation {
                mm_id: tracked.mm_id,
                order_id: tracked.order_id.clone(),
                token: tracked.token.clone(),
                outcome: tracked.key.outcome,
                side: tracked.key.side,
                price,
                delta,
                matched_total_after: matched_total,
                source: FillSource::Push,
            };
            self.inventory.apply_fill(obs).await;
        }
    }

    /// Position updates only touch tokens we map to an enrolled MM.
    async fn handle_position(&self, msg: &PushPositionMsg) {
        self.maybe_refresh_token_map();
        let Some((mm_id, outcome)) = self.token_map.lock().get(&msg.asset).copied() else {
            debug!("position update for unmapped token — ignored");
            return;
        };
        let Some(size) = json_f64(&msg.size) else {
            return;
        };
        let avg = opt_json_f64(&msg.avg_price).unwrap_or(0.0);

        // Only the reported outcome moves; the other side keeps its local
        // value.
        let Ok(Some(mm)) = self.store.get_mm(mm_id) else {
            return;
        };
        let (yes, no) = match outcome {
            Outcome::Yes => (
                ChainPosition { size, avg_price: avg },
                ChainPosition {
                    size: mm.state.no_inventory,
                    avg_price: mm.state.avg_no_cost,
                },
            ),
            Outcome::No => (
                ChainPosition {
                    size: mm.state.yes_inventory,
                    avg_price: mm.state.avg_yes_cost,
                },
                ChainPosition { size, avg_price: avg },
            ),
        };
        self.inventory.sync_from_chain(mm_id, yes, no).await;
    }

    fn maybe_refresh_token_map(&self) {
        {
            let built = self.token_map_built.lock();
            if let Some(at) = *built {
                if at.elapsed() < self.cfg.token_map_refresh {
                    return;
                }
            }
        }
        let mut map = TokenMap::new();
        if let Ok(mms) = self.store.list_active_mms() {
            for mm in mms {
                if let Ok(Some(market)) = self.store.get_market(&mm.market_id) {
                    map.insert(market.yes_token.clone(), (mm.id, Outcome::Yes));
                    map.insert(market.no_token.clone(), (mm.id, Outcome::No));
                }
            }
        }
        debug!("token map rebuilt: {} entries", map.len());
        *self.token_map.lock() = map;
        *self.token_map_built.lock() = Some(Instant::now());
    }
}

/// Apply one order update: fill delta first, then terminal cleanup.
/// Runs on the order's serial lane.
pub async fn handle_order_update(store: &Store, inventory: &InventoryHandle, msg: &PushOrderMsg) {
    let Some(tracked) = store.get_tracked_order(&msg.id).ok().flatten() else {
        debug!("order update for untracked {} — ignored", msg.id);
        return;
    };

    let status = msg.status.to_ascii_uppercase();
    let size_matched = opt_json_f64(&msg.size_matched).unwrap_or(0.0);
    let price = opt_json_f64(&msg.price).unwrap_or(tracked.price);

    let prior = tracked.last_matched_size.unwrap_or(0.0);
    if size_matched > prior + 1e-9 {
        let obs = FillObservation {
            mm_id: tracked.mm_id,
            order_id: tracked.order_id.clone(),
            token: tracked.token.clone(),
            outcome: tracked.key.outcome,
            side: tracked.key.side,
            price,
            delta: size_matched - prior,
            matched_total_after: size_matched,
            source: FillSource::Push,
        };
        inventory.apply_fill(obs).await;
    }

    if classify_status_str(&status) == StatusClass::Terminal {
        // The FSM retires fully matched rows; this sweeps cancels/expiries.
        match store.delete_tracked_order(&msg.id) {
            Ok(true) => {
                let _ = store.log_event(
                    tracked.mm_id,
                    QuoteEventKind::OrderCancelled,
                    serde_json::json!({
                        "order_id": msg.id,
                        "status": status,
                        "size_matched": size_matched,
                    }),
                );
                info!("🗑️ order {} terminal ({status}) — untracked", msg.id);
            }
            Ok(false) => {}
            Err(e) => warn!("delete tracked {}: {e}", msg.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{InventoryBook, InventoryConfig};
    use crate::types::{Market, MmConfig, OrderKey, OrderSide, TrackedOrder};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::NamedTempFile;

    // ── Backoff ──

    #[test]
    fn test_backoff_ladder_caps() {
        let p = BackoffPolicy {
            jitter: Duration::ZERO,
            ..BackoffPolicy::default()
        };
        assert_eq!(p.delay(0), Duration::from_secs(2));
        assert_eq!(p.delay(1), Duration::from_secs(4));
        assert_eq!(p.delay(3), Duration::from_secs(16));
        assert_eq!(p.delay(10), Duration::from_secs(60)); // capped
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let p = BackoffPolicy::default();
        for attempt in 0..6 {
            let d = p.delay(attempt);
            let floor = p.base * 2u32.pow(attempt).min(30);
            let floor = floor.min(p.cap);
            assert!(d >= floor);
            assert!(d <= floor + p.jitter);
        }
    }

    #[test]
    fn test_backoff_respects_min_gap() {
        let p = BackoffPolicy {
            base: Duration::from_millis(10),
            jitter: Duration::ZERO,
            min_gap: Duration::from_secs(1),
            ..BackoffPolicy::default()
        };
        assert!(p.delay(0) >= Duration::from_secs(1));
    }

    // ── Serial lanes ──

    #[tokio::test]
    async fn test_lane_preserves_per_key_order() {
        let lanes: SerialLanes<u32> = SerialLanes::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16u32 {
            let seen = seen.clone();
            lanes.submit("order-1".to_string(), i, move |v| {
                let seen = seen.clone();
                async move {
                    // A slow handler: later submissions must still queue.
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    seen.lock().push(v);
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
        // Lane entry dropped once drained.
        assert_eq!(lanes.active_lanes(), 0);
    }

    #[tokio::test]
    async fn test_lanes_run_keys_in_parallel() {
        let lanes: SerialLanes<&'static str> = SerialLanes::new();
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for key in ["a", "b", "c", "d"] {
            let running = running.clone();
            let peak = peak.clone();
            lanes.submit(key.to_string(), key, move |_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(peak.load(Ordering::SeqCst) >= 2, "lanes should overlap");
    }

    // ── Dedup ──

    #[test]
    fn test_dedup_blocks_replay() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 16);
        assert!(cache.remember("t1".to_string()));
        assert!(!cache.remember("t1".to_string()));
        assert!(cache.remember("t2".to_string()));
    }

    // ── Order update handling ──

    fn setup() -> (Store, NamedTempFile, i64, InventoryHandle) {
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
        let (handle, _join) = InventoryBook::spawn(InventoryConfig::default(), store.clone());
        (store, f, id, handle)
    }

    fn track(store: &Store, mm_id: i64, id: &str, size: f64) {
        store
            .insert_tracked_order(&TrackedOrder {
                mm_id,
                key: OrderKey::new(Outcome::Yes, OrderSide::Buy, 0),
                order_id: id.to_string(),
                client_order_id: None,
                order_group_id: None,
                token: "yes-tok".to_string(),
                price: 0.50,
                size,
                last_matched_size: None,
                placed_at: Utc::now(),
            })
            .unwrap();
    }

    fn order_msg(id: &str, status: &str, matched: f64) -> PushOrderMsg {
        serde_json::from_value(json!({
            "id": id,
            "status": status,
            "price": "0.50",
            "original_size": "10",
            "size_matched": matched.to_string(),
            "asset_id": "yes-tok",
            "outcome": "Yes",
            "side": "BUY",
            "market": "m1",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_partial_fill_applied_via_lane_handler() {
        let (store, _f, id, handle) = setup();
        track(&store, id, "o1", 10.0);

        handle_order_update(&store, &handle, &order_msg("o1", "LIVE", 4.0)).await;
        let mm = store.get_mm(id).unwrap().unwrap();
        assert!((mm.state.yes_inventory - 4.0).abs() < 1e-9);
        let o = store.get_tracked_order("o1").unwrap().unwrap();
        assert!((o.last_matched_size.unwrap() - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_replayed_update_is_idempotent() {
        let (store, _f, id, handle) = setup();
        track(&store, id, "o1", 10.0);

        handle_order_update(&store, &handle, &order_msg("o1", "LIVE", 4.0)).await;
        handle_order_update(&store, &handle, &order_msg("o1", "LIVE", 4.0)).await;
        let mm = store.get_mm(id).unwrap().unwrap();
        assert!((mm.state.yes_inventory - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_terminal_cancel_removes_row() {
        let (store, _f, id, handle) = setup();
        track(&store, id, "o1", 10.0);

        handle_order_update(&store, &handle, &order_msg("o1", "CANCELLED", 0.0)).await;
        assert!(store.get_tracked_order("o1").unwrap().is_none());
        let events = store.recent_events(id, 5).unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == QuoteEventKind::OrderCancelled));
        // No fill was invented.
        let mm = store.get_mm(id).unwrap().unwrap();
        assert!((mm.state.yes_inventory - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_matched_terminal_applies_then_retires() {
        let (store, _f, id, handle) = setup();
        track(&store, id, "o1", 10.0);

        handle_order_update(&store, &handle, &order_msg("o1", "MATCHED", 10.0)).await;
        assert!(store.get_tracked_order("o1").unwrap().is_none());
        let mm = store.get_mm(id).unwrap().unwrap();
        assert!((mm.state.yes_inventory - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_untracked_order_ignored() {
        let (store, _f, id, handle) = setup();
        handle_order_update(&store, &handle, &order_msg("mystery", "LIVE", 5.0)).await;
        let mm = store.get_mm(id).unwrap().unwrap();
        assert!((mm.state.yes_inventory - 0.0).abs() < 1e-9);
    }
}
