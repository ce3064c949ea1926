//! Uniform operations over heterogeneous venues.
//!
//! Each venue implements [`VenueAdapter`]; adapters register into a
//! [`VenueRegistry`] keyed by venue id. Authoritative top-of-book data
//! (midpoint / spread / best) comes from dedicated endpoints because the raw
//! book mid may diverge from what the venue will actually match at.

pub mod kalshi;
pub mod limiter;
pub mod polymarket;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

use crate::errors::{EngineError, EngineResult};
use crate::types::{BookLevel, OrderbookSnapshot, OrderKey};
use self::types::{
    BestQuote, CancelAllFilter, MarketFilter, OpenOrdersFilter, OrderLookup, PlaceOrderOutcome,
    PlaceOrderRequest, VenueFill, VenueMarket, VenueOrder, VenuePosition,
};

/// Venue batch-placement hard cap.
pub const MAX_ORDER_BATCH: usize = 15;

/// Bounded retry for transient RPC failures.
pub const RPC_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 250;

// ─────────────────────────────────────────────────────────
// Orderbook streaming
// ─────────────────────────────────────────────────────────

pub type SnapshotCallback = Arc<dyn Fn(&str, OrderbookSnapshot) + Send + Sync>;
/// (token, bid levels changed, ask levels changed)
pub type DeltaCallback = Arc<dyn Fn(&str, &[BookLevel], &[BookLevel]) + Send + Sync>;
pub type StreamErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Cancellation handle for an orderbook subscription. Dropping it leaves
/// the stream running; call [`cancel`](Self::cancel) to tear it down.
pub struct SubscriptionHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(shutdown: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self { shutdown, join }
    }

    pub async fn cancel(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn abort(self) {
        let _ = self.shutdown.send(true);
        self.join.abort();
    }
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue_id(&self) -> &str;

    // ── Market data (public) ──
    async fn list_markets(&self, filter: &MarketFilter) -> EngineResult<Vec<VenueMarket>>;
    async fn get_market(&self, market_id: &str) -> EngineResult<VenueMarket>;
    async fn orderbook_snapshot(&self, token: &str) -> EngineResult<OrderbookSnapshot>;

    /// Stream book snapshots and level deltas for the given tokens. Venues
    /// without a market-data stream leave the default and are polled.
    async fn subscribe_orderbook(
        &self,
        _tokens: &[String],
        _on_snapshot: SnapshotCallback,
        _on_delta: DeltaCallback,
        _on_error: StreamErrorCallback,
    ) -> EngineResult<SubscriptionHandle> {
        Err(EngineError::permanent(format!(
            "venue {} has no orderbook stream",
            self.venue_id()
        )))
    }

    async fn midpoint(&self, token: &str) -> EngineResult<Option<f64>>;
    async fn spread(&self, token: &str) -> EngineResult<Option<f64>>;
    async fn best(&self, token: &str) -> EngineResult<BestQuote>;

    // ── Trading (authenticated) ──
    async fn place_order(&self, req: &PlaceOrderRequest) -> EngineResult<PlaceOrderOutcome>;
    /// Batch placement; callers must chunk to [`MAX_ORDER_BATCH`].
    async fn place_orders(&self, reqs: &[PlaceOrderRequest])
        -> EngineResult<Vec<PlaceOrderOutcome>>;
    async fn cancel_order(&self, order_id: &str) -> EngineResult<()>;
    async fn cancel_all(&self, filter: &CancelAllFilter) -> EngineResult<usize>;
    async fn open_orders(&self, filter: &OpenOrdersFilter) -> EngineResult<Vec<VenueOrder>>;
    async fn get_order(&self, order_id: &str) -> EngineResult<OrderLookup>;

    /// Authoritative positions. `Ok(None)` signals a degraded feed; callers
    /// must fall back, never treat it as flat.
    async fn positions(&self) -> EngineResult<Option<Vec<VenuePosition>>>;
    async fn fills(&self, since: chrono::DateTime<chrono::Utc>) -> EngineResult<Vec<VenueFill>>;

    // ── Optional order-group support ──
    async fn create_order_group(&self, _params: &str) -> EngineResult<Option<String>> {
        Ok(None)
    }
    async fn reset_order_group(&self, _group_id: &str) -> EngineResult<()> {
        Ok(())
    }
}

pub type SharedAdapter = Arc<dyn VenueAdapter>;

/// Adapters keyed by venue id.
#[derive(Default, Clone)]
pub struct VenueRegistry {
    adapters: HashMap<String, SharedAdapter>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: SharedAdapter) {
        self.adapters.insert(adapter.venue_id().to_string(), adapter);
    }

    pub fn get(&self, venue_id: &str) -> EngineResult<SharedAdapter> {
        self.adapters
            .get(venue_id)
            .cloned()
            .ok_or_else(|| EngineError::config(format!("no adapter registered for venue {venue_id}")))
    }

    pub fn venue_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

/// Retry a transient-failing RPC a bounded number of times.
/// Permanent errors propagate immediately.
pub async fn with_retry<T, F, Fut>(what: &str, mut call: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < RPC_RETRIES => {
                attempt += 1;
                let backoff = Duration::from_millis(RETRY_BACKOFF_MS * (1 << attempt.min(4)));
                warn!("🔁 {what} transient failure (attempt {attempt}): {e} — retrying in {}ms", backoff.as_millis());
                sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stable client-order id: a digest of the order's identity so replays of
/// the same placement collide instead of duplicating.
pub fn client_order_id(mm_id: i64, key: &OrderKey, price: f64, size: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mm_id.to_le_bytes());
    hasher.update(key.outcome.as_str().as_bytes());
    hasher.update(key.side.as_str().as_bytes());
    hasher.update(key.tier.to_le_bytes());
    hasher.update(format!("{price:.6}").as_bytes());
    hasher.update(format!("{size:.6}").as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, Outcome};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_client_order_id_stable() {
        let key = OrderKey::new(Outcome::Yes, OrderSide::Buy, 0);
        let a = client_order_id(7, &key, 0.48, 10.0);
        let b = client_order_id(7, &key, 0.48, 10.0);
        assert_eq!(a, b);
        let c = client_order_id(7, &key, 0.49, 10.0);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn test_retry_exhausts_then_fails() {
        let calls = AtomicU32::new(0);
        let res: EngineResult<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::transient("boom")) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), RPC_RETRIES);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent() {
        let calls = AtomicU32::new(0);
        let res: EngineResult<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::permanent("denied")) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let calls = AtomicU32::new(0);
        let res = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EngineError::transient("first"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 42);
    }

    #[test]
    fn test_registry_lookup() {
        let reg = VenueRegistry::new();
        assert!(reg.get("nope").is_err());
    }
}
