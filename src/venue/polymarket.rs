//! Decimal CLOB venue adapter ("clob").
//!
//! Prices travel as decimal strings already aligned to the venue's tick
//! grid; sizes are share counts; dollar amounts are 1e6 fixed-point USDC.
//! Authenticated calls carry L2 headers: api key, passphrase, timestamp and
//! an HMAC-SHA256 signature over `timestamp + method + path + body`.
//!
//! In dry-run mode `place_order` is a pure local synthesiser: it burns no
//! rate limit, talks to no venue, and returns a synthetic order id the rest
//! of the engine tracks like any other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::VenueCredentials;
use crate::errors::{classify_http, classify_status, EngineError, EngineResult};
use crate::types::{BookLevel, OrderbookSnapshot, PriceRange};
use super::limiter::VenueLimiters;
use super::types::{
    json_f64, BestQuote, CancelAllFilter, MarketFilter, OpenOrdersFilter, OrderLookup,
    PlaceOrderOutcome, PlaceOrderRequest, VenueFill, VenueMarket, VenueOrder, VenuePosition,
    WireSide,
};
use super::{
    DeltaCallback, SnapshotCallback, StreamErrorCallback, SubscriptionHandle, VenueAdapter,
    MAX_ORDER_BATCH,
};

/// Fixed-point scale for USDC amounts on the wire.
const USDC_SCALE: f64 = 1_000_000.0;

pub struct ClobVenue {
    base_url: String,
    ws_url: String,
    http: reqwest::Client,
    creds: VenueCredentials,
    limiters: VenueLimiters,
    dry_run: bool,
    dry_seq: AtomicU64,
}

// ─────────────────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireMarket {
    #[serde(rename = "condition_id")]
    market_id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    tokens: Vec<WireToken>,
    #[serde(default)]
    tick_ranges: Vec<WireTickRange>,
    #[serde(default)]
    end_date_iso: Option<String>,
    #[serde(default)]
    volume_24h: Option<serde_json::Value>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct WireToken {
    token_id: String,
    #[serde(default)]
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct WireTickRange {
    start: serde_json::Value,
    end: serde_json::Value,
    step: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireBookLevel {
    price: serde_json::Value,
    size: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireBook {
    #[serde(default)]
    bids: Vec<WireBookLevel>,
    #[serde(default)]
    asks: Vec<WireBookLevel>,
}

#[derive(Debug, Deserialize)]
struct WireScalar {
    #[serde(alias = "mid", alias = "spread")]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WirePrice {
    price: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireOrderAck {
    #[serde(rename = "orderID", alias = "order_id", default)]
    order_id: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    status: String,
    #[serde(rename = "errorMsg", alias = "error_msg", default)]
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireOpenOrder {
    id: String,
    asset_id: String,
    side: String,
    price: serde_json::Value,
    original_size: serde_json::Value,
    size_matched: serde_json::Value,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    asset: String,
    /// 1e6 fixed-point share count.
    size: serde_json::Value,
    avg_price: serde_json::Value,
    #[serde(default)]
    redeemable: bool,
    #[serde(default)]
    cur_price: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    #[serde(default)]
    order_id: String,
    asset_id: String,
    side: String,
    price: serde_json::Value,
    size: serde_json::Value,
    #[serde(default)]
    match_time: Option<i64>,
}

impl ClobVenue {
    pub fn new(
        base_url: String,
        ws_url: String,
        creds: VenueCredentials,
        timeout_secs: u64,
        dry_run: bool,
    ) -> EngineResult<Self> {
        url::Url::parse(&base_url)
            .map_err(|e| EngineError::config(format!("bad venue url {base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineError::config(format!("http client: {e}")))?;
        Ok(Self {
            base_url,
            ws_url,
            http,
            creds,
            limiters: VenueLimiters::new_default(),
            dry_run,
            dry_seq: AtomicU64::new(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// L2 signature: base64(HMAC-SHA256(secret, ts + method + path + body)).
    fn sign(&self, method: &str, path: &str, body: &str, ts: i64) -> EngineResult<String> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(&self.creds.api_secret)
            .unwrap_or_else(|_| self.creds.api_secret.as_bytes().to_vec());
        let mut mac = Hmac::<Sha256>::new_from_slice(&key)
            .map_err(|e| EngineError::config(format!("bad api secret: {e}")))?;
        mac.update(format!("{ts}{method}{path}{body}").as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    async fn get_public<T: serde::de::DeserializeOwned>(&self, path: &str) -> EngineResult<T> {
        self.limiters.public.acquire().await;
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| classify_http(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        resp.json::<T>()
            .await
            .map_err(|e| EngineError::permanent(format!("decode {path}: {e}")))
    }

    async fn send_auth(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> EngineResult<reqwest::Response> {
        self.limiters.auth.acquire().await;
        let ts = Utc::now().timestamp();
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let sig = self.sign(method.as_str(), path, &body_str, ts)?;

        let mut req = self
            .http
            .request(method, self.url(path))
            .header("POLY-API-KEY", &self.creds.api_key)
            .header("POLY-PASSPHRASE", &self.creds.api_passphrase)
            .header("POLY-TIMESTAMP", ts.to_string())
            .header("POLY-SIGNATURE", sig);
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await.map_err(|e| classify_http(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        Ok(resp)
    }

    fn convert_market(&self, w: WireMarket) -> VenueMarket {
        let price_ranges = w
            .tick_ranges
            .iter()
            .filter_map(|r| {
                Some(PriceRange {
                    start: json_f64(&r.start)?,
                    end: json_f64(&r.end)?,
                    step: json_f64(&r.step)?,
                })
            })
            .collect();
        VenueMarket {
            market_id: w.market_id,
            question: w.question,
            tokens: w.tokens.iter().map(|t| t.token_id.clone()).collect(),
            outcome_names: w.tokens.into_iter().map(|t| t.outcome).collect(),
            price_ranges,
            end_time: w
                .end_date_iso
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            volume_24h: w.volume_24h.as_ref().and_then(json_f64).unwrap_or(0.0),
            active: w.active,
            closed: w.closed,
        }
    }

    fn convert_book(w: WireBook) -> OrderbookSnapshot {
        let mut bids: Vec<BookLevel> = w
            .bids
            .iter()
            .filter_map(|l| {
                Some(BookLevel {
                    price: json_f64(&l.price)?,
                    size: json_f64(&l.size)?,
                })
            })
            .collect();
        let mut asks: Vec<BookLevel> = w
            .asks
            .iter()
            .filter_map(|l| {
                Some(BookLevel {
                    price: json_f64(&l.price)?,
                    size: json_f64(&l.size)?,
                })
            })
            .collect();
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        OrderbookSnapshot { bids, asks }
    }

    fn order_body(req: &PlaceOrderRequest) -> serde_json::Value {
        serde_json::json!({
            "tokenID": req.token,
            "side": match req.side { WireSide::Buy => "BUY", WireSide::Sell => "SELL" },
            "price": format!("{:.4}", req.price),
            "size": format!("{:.2}", req.size),
            "orderType": req.time_in_force.as_str(),
            "postOnly": req.post_only,
            "reduceOnly": req.reduce_only,
            "clientOrderID": req.client_order_id,
            "orderGroupID": req.order_group_id,
        })
    }

    fn synth_order(&self, req: &PlaceOrderRequest) -> PlaceOrderOutcome {
        let n = self.dry_seq.fetch_add(1, Ordering::Relaxed);
        let order_id = format!("dry-{}-{n}", &req.token[..8.min(req.token.len())]);
        debug!(
            "📝 [DRY-RUN] {} {}@{:.4} size={:.2} → {order_id}",
            req.side.as_str(),
            req.token,
            req.price,
            req.size,
        );
        PlaceOrderOutcome {
            success: true,
            order_id,
            status: "LIVE".to_string(),
            error: None,
        }
    }
}

#[async_trait]
impl VenueAdapter for ClobVenue {
    fn venue_id(&self) -> &str {
        "clob"
    }

    async fn list_markets(&self, filter: &MarketFilter) -> EngineResult<Vec<VenueMarket>> {
        let wire: Vec<WireMarket> = self.get_public("/markets").await?;
        let mut out: Vec<VenueMarket> = wire
            .into_iter()
            .map(|w| self.convert_market(w))
            .filter(|m| !filter.active_only || (m.active && !m.closed))
            .filter(|m| {
                filter
                    .min_volume_24h
                    .map(|v| m.volume_24h >= v)
                    .unwrap_or(true)
            })
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn get_market(&self, market_id: &str) -> EngineResult<VenueMarket> {
        let wire: WireMarket = self.get_public(&format!("/markets/{market_id}")).await?;
        Ok(self.convert_market(wire))
    }

    async fn orderbook_snapshot(&self, token: &str) -> EngineResult<OrderbookSnapshot> {
        let wire: WireBook = self.get_public(&format!("/book?token_id={token}")).await?;
        Ok(Self::convert_book(wire))
    }

    /// Market-data stream: `book` events deliver full snapshots,
    /// `price_change` events deliver per-level deltas. On any stream error
    /// the error callback fires once and the task exits; reconnect policy
    /// belongs to the caller.
    async fn subscribe_orderbook(
        &self,
        tokens: &[String],
        on_snapshot: SnapshotCallback,
        on_delta: DeltaCallback,
        on_error: StreamErrorCallback,
    ) -> EngineResult<SubscriptionHandle> {
        let url = format!("{}/market", self.ws_url.trim_end_matches('/'));
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| EngineError::transient(format!("ws connect: {e}")))?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "operation": "subscribe",
            "assets_ids": tokens,
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| EngineError::transient(format!("ws subscribe: {e}")))?;

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                                    continue;
                                };
                                handle_book_event(&value, &on_snapshot, &on_delta);
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                on_error("stream closed".to_string());
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                on_error(format!("stream error: {e}"));
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                }
            }
        });
        Ok(SubscriptionHandle::new(shutdown_tx, join))
    }

    async fn midpoint(&self, token: &str) -> EngineResult<Option<f64>> {
        let wire: WireScalar = self.get_public(&format!("/midpoint?token_id={token}")).await?;
        Ok(json_f64(&wire.value))
    }

    async fn spread(&self, token: &str) -> EngineResult<Option<f64>> {
        let wire: WireScalar = self.get_public(&format!("/spread?token_id={token}")).await?;
        Ok(json_f64(&wire.value))
    }

    async fn best(&self, token: &str) -> EngineResult<BestQuote> {
        let bid: WirePrice = self
            .get_public(&format!("/price?token_id={token}&side=buy"))
            .await?;
        let ask: WirePrice = self
            .get_public(&format!("/price?token_id={token}&side=sell"))
            .await?;
        Ok(BestQuote {
            bid: json_f64(&bid.price).filter(|p| *p > 0.0),
            ask: json_f64(&ask.price).filter(|p| *p > 0.0),
        })
    }

    async fn place_order(&self, req: &PlaceOrderRequest) -> EngineResult<PlaceOrderOutcome> {
        if self.dry_run {
            return Ok(self.synth_order(req));
        }
        let resp = self
            .send_auth(reqwest::Method::POST, "/order", Some(Self::order_body(req)))
            .await?;
        let ack: WireOrderAck = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode order ack: {e}")))?;
        if !ack.success {
            warn!("❌ order rejected: status={} err={:?}", ack.status, ack.error_msg);
        }
        Ok(PlaceOrderOutcome {
            success: ack.success,
            order_id: ack.order_id,
            status: ack.status.to_ascii_uppercase(),
            error: ack.error_msg,
        })
    }

    async fn place_orders(
        &self,
        reqs: &[PlaceOrderRequest],
    ) -> EngineResult<Vec<PlaceOrderOutcome>> {
        if reqs.len() > MAX_ORDER_BATCH {
            return Err(EngineError::invariant(format!(
                "order batch {} exceeds venue cap {MAX_ORDER_BATCH}",
                reqs.len()
            )));
        }
        if self.dry_run {
            return Ok(reqs.iter().map(|r| self.synth_order(r)).collect());
        }
        let body = serde_json::json!({
            "orders": reqs.iter().map(Self::order_body).collect::<Vec<_>>(),
        });
        let resp = self
            .send_auth(reqwest::Method::POST, "/orders", Some(body))
            .await?;
        let acks: Vec<WireOrderAck> = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode batch ack: {e}")))?;
        Ok(acks
            .into_iter()
            .map(|ack| PlaceOrderOutcome {
                success: ack.success,
                order_id: ack.order_id,
                status: ack.status.to_ascii_uppercase(),
                error: ack.error_msg,
            })
            .collect())
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        if self.dry_run {
            debug!("📝 [DRY-RUN] cancel {order_id}");
            return Ok(());
        }
        let body = serde_json::json!({ "orderID": order_id });
        self.send_auth(reqwest::Method::DELETE, "/order", Some(body))
            .await?;
        Ok(())
    }

    async fn cancel_all(&self, filter: &CancelAllFilter) -> EngineResult<usize> {
        if self.dry_run {
            debug!("📝 [DRY-RUN] cancel-all {:?}", filter.market_id);
            return Ok(0);
        }
        let body = serde_json::json!({
            "market": filter.market_id,
            "asset_id": filter.token,
        });
        let resp = self
            .send_auth(reqwest::Method::DELETE, "/cancel-all", Some(body))
            .await?;
        #[derive(Deserialize)]
        struct CancelAck {
            #[serde(default)]
            canceled: Vec<String>,
        }
        let ack: CancelAck = resp.json().await.unwrap_or(CancelAck { canceled: vec![] });
        Ok(ack.canceled.len())
    }

    async fn open_orders(&self, filter: &OpenOrdersFilter) -> EngineResult<Vec<VenueOrder>> {
        let mut path = "/data/orders".to_string();
        if let Some(m) = &filter.market_id {
            path = format!("{path}?market={m}");
        } else if let Some(t) = &filter.token {
            path = format!("{path}?asset_id={t}");
        }
        let resp = self.send_auth(reqwest::Method::GET, &path, None).await?;
        let wire: Vec<WireOpenOrder> = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode open orders: {e}")))?;
        Ok(wire
            .into_iter()
            .filter_map(|w| {
                Some(VenueOrder {
                    order_id: w.id,
                    token: w.asset_id,
                    side: match w.side.to_ascii_uppercase().as_str() {
                        "BUY" => WireSide::Buy,
                        "SELL" => WireSide::Sell,
                        _ => return None,
                    },
                    price: json_f64(&w.price)?,
                    original_size: json_f64(&w.original_size)?,
                    size_matched: json_f64(&w.size_matched).unwrap_or(0.0),
                    status: w.status.to_ascii_uppercase(),
                })
            })
            .collect())
    }

    async fn get_order(&self, order_id: &str) -> EngineResult<OrderLookup> {
        let resp = self
            .send_auth(reqwest::Method::GET, &format!("/data/order/{order_id}"), None)
            .await;
        match resp {
            Ok(resp) => {
                let w: WireOpenOrder = resp
                    .json()
                    .await
                    .map_err(|e| EngineError::permanent(format!("decode order: {e}")))?;
                Ok(OrderLookup::Found(VenueOrder {
                    order_id: w.id,
                    token: w.asset_id,
                    side: match w.side.to_ascii_uppercase().as_str() {
                        "SELL" => WireSide::Sell,
                        _ => WireSide::Buy,
                    },
                    price: json_f64(&w.price).unwrap_or(0.0),
                    original_size: json_f64(&w.original_size).unwrap_or(0.0),
                    size_matched: json_f64(&w.size_matched).unwrap_or(0.0),
                    status: w.status.to_ascii_uppercase(),
                }))
            }
            Err(EngineError::VenuePermanent(msg)) if msg.starts_with("not found") => {
                Ok(OrderLookup::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn positions(&self) -> EngineResult<Option<Vec<VenuePosition>>> {
        let resp = self
            .send_auth(reqwest::Method::GET, "/positions", None)
            .await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_transient() => {
                warn!("📉 positions feed transiently unavailable: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let wire: Vec<WirePosition> = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode positions: {e}")))?;
        Ok(Some(
            wire.into_iter()
                .filter_map(|w| {
                    Some(VenuePosition {
                        token: w.asset,
                        // Fixed-point → decimal shares.
                        size: json_f64(&w.size)? / USDC_SCALE,
                        avg_price: json_f64(&w.avg_price).unwrap_or(0.0),
                        redeemable: w.redeemable,
                        cur_price: w.cur_price.as_ref().and_then(json_f64).unwrap_or(0.0),
                    })
                })
                .collect(),
        ))
    }

    async fn fills(&self, since: DateTime<Utc>) -> EngineResult<Vec<VenueFill>> {
        let path = format!("/data/trades?after={}", since.timestamp());
        let resp = self.send_auth(reqwest::Method::GET, &path, None).await?;
        let wire: Vec<WireTrade> = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode trades: {e}")))?;
        Ok(wire
            .into_iter()
            .filter_map(|w| {
                Some(VenueFill {
                    order_id: w.order_id,
                    token: w.asset_id,
                    side: match w.side.to_ascii_uppercase().as_str() {
                        "SELL" => WireSide::Sell,
                        _ => WireSide::Buy,
                    },
                    price: json_f64(&w.price)?,
                    size: json_f64(&w.size)?,
                    ts: w
                        .match_time
                        .and_then(|t| Utc.timestamp_opt(t, 0).single())
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect())
    }

    async fn create_order_group(&self, params: &str) -> EngineResult<Option<String>> {
        if self.dry_run {
            let _ = params;
            return Ok(Some(format!("dry-group-{}", uuid::Uuid::new_v4())));
        }
        let body = serde_json::json!({ "params": params });
        let resp = self
            .send_auth(reqwest::Method::POST, "/order-group", Some(body))
            .await?;
        #[derive(Deserialize)]
        struct GroupAck {
            id: String,
        }
        let ack: GroupAck = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode group ack: {e}")))?;
        info!("🧺 order group created: {}", ack.id);
        Ok(Some(ack.id))
    }

    async fn reset_order_group(&self, group_id: &str) -> EngineResult<()> {
        if self.dry_run {
            return Ok(());
        }
        let body = serde_json::json!({ "id": group_id });
        self.send_auth(reqwest::Method::POST, "/order-group/reset", Some(body))
            .await?;
        Ok(())
    }
}

/// Route one market-stream event to the right callback.
fn handle_book_event(value: &serde_json::Value, on_snapshot: &SnapshotCallback, on_delta: &DeltaCallback) {
    let event_type = value
        .get("event_type")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let token = value
        .get("asset_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if token.is_empty() {
        return;
    }

    match event_type {
        "book" => {
            if let Ok(wire) = serde_json::from_value::<WireBook>(value.clone()) {
                on_snapshot(token, ClobVenue::convert_book(wire));
            }
        }
        "price_change" => {
            let changes = value
                .get("changes")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let mut bid_changes: Vec<BookLevel> = Vec::new();
            let mut ask_changes: Vec<BookLevel> = Vec::new();
            for c in &changes {
                let Some(price) = c.get("price").and_then(json_f64) else {
                    continue;
                };
                let Some(size) = c.get("size").and_then(json_f64) else {
                    continue;
                };
                let level = BookLevel { price, size };
                match c.get("side").and_then(|v| v.as_str()).unwrap_or_default() {
                    "BUY" | "buy" => bid_changes.push(level),
                    "SELL" | "sell" => ask_changes.push(level),
                    _ => {}
                }
            }
            if !bid_changes.is_empty() || !ask_changes.is_empty() {
                on_delta(token, &bid_changes, &ask_changes);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::types::TimeInForce;
    use std::sync::Arc;

    fn venue() -> ClobVenue {
        ClobVenue::new(
            "https://clob.example.com".to_string(),
            "wss://ws.clob.example.com/ws".to_string(),
            VenueCredentials {
                api_key: "k".into(),
                api_secret: base64::engine::general_purpose::STANDARD.encode(b"secret"),
                api_passphrase: "p".into(),
                wallet_key: String::new(),
            },
            15,
            true,
        )
        .unwrap()
    }

    fn req(price: f64) -> PlaceOrderRequest {
        PlaceOrderRequest {
            token: "1234567890".to_string(),
            side: WireSide::Buy,
            price,
            size: 10.0,
            time_in_force: TimeInForce::Gtc,
            post_only: true,
            reduce_only: false,
            client_order_id: None,
            order_group_id: None,
        }
    }

    #[tokio::test]
    async fn test_dry_run_synthesises_ids() {
        let v = venue();
        let a = v.place_order(&req(0.48)).await.unwrap();
        let b = v.place_order(&req(0.49)).await.unwrap();
        assert!(a.success && b.success);
        assert_ne!(a.order_id, b.order_id);
        assert!(a.order_id.starts_with("dry-"));
        assert_eq!(a.status, "LIVE");
    }

    #[tokio::test]
    async fn test_batch_cap_enforced() {
        let v = venue();
        let reqs: Vec<_> = (0..16).map(|i| req(0.40 + i as f64 * 0.01)).collect();
        assert!(v.place_orders(&reqs).await.is_err());
        let reqs: Vec<_> = (0..15).map(|i| req(0.40 + i as f64 * 0.01)).collect();
        assert_eq!(v.place_orders(&reqs).await.unwrap().len(), 15);
    }

    #[test]
    fn test_signature_is_stable() {
        let v = venue();
        let a = v.sign("POST", "/order", "{}", 1_700_000_000).unwrap();
        let b = v.sign("POST", "/order", "{}", 1_700_000_000).unwrap();
        assert_eq!(a, b);
        let c = v.sign("POST", "/order", "{}", 1_700_000_001).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_book_conversion_sorts() {
        let wire = WireBook {
            bids: vec![
                WireBookLevel { price: serde_json::json!("0.45"), size: serde_json::json!("5") },
                WireBookLevel { price: serde_json::json!("0.48"), size: serde_json::json!("10") },
            ],
            asks: vec![
                WireBookLevel { price: serde_json::json!("0.55"), size: serde_json::json!("5") },
                WireBookLevel { price: serde_json::json!("0.52"), size: serde_json::json!("10") },
            ],
        };
        let book = ClobVenue::convert_book(wire);
        assert!((book.best_bid().unwrap().price - 0.48).abs() < 1e-9);
        assert!((book.best_ask().unwrap().price - 0.52).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_point_scale() {
        assert!((12_500_000.0 / USDC_SCALE - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_book_event_routing() {
        use parking_lot::Mutex;
        let snaps: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let deltas: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

        let s = snaps.clone();
        let on_snapshot: SnapshotCallback = Arc::new(move |token, book| {
            assert!(book.best_bid().is_some());
            s.lock().push(token.to_string());
        });
        let d = deltas.clone();
        let on_delta: DeltaCallback = Arc::new(move |_token, bids, asks| {
            d.lock().push((bids.len(), asks.len()));
        });

        let snapshot_event = serde_json::json!({
            "event_type": "book",
            "asset_id": "tok-1",
            "bids": [{"price": "0.48", "size": "10"}],
            "asks": [{"price": "0.52", "size": "10"}],
        });
        handle_book_event(&snapshot_event, &on_snapshot, &on_delta);

        let delta_event = serde_json::json!({
            "event_type": "price_change",
            "asset_id": "tok-1",
            "changes": [
                {"side": "BUY", "price": "0.47", "size": "5"},
                {"side": "SELL", "price": "0.53", "size": "0"},
            ],
        });
        handle_book_event(&delta_event, &on_snapshot, &on_delta);

        assert_eq!(*snaps.lock(), vec!["tok-1".to_string()]);
        assert_eq!(*deltas.lock(), vec![(1, 1)]);
    }
}
