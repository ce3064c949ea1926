//! Cent-priced exchange adapter ("kalshi").
//!
//! Prices travel as integer cents (÷100 to decimal); sizes are whole
//! contracts. Authenticated requests carry a key id plus a detached
//! signature over `timestamp + method + path`. Production deployments sign
//! with the exchange's RSA-PSS-SHA256 scheme through an operator-supplied
//! [`RequestSigner`]; the in-tree [`HmacSigner`] covers tests and dry-run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::errors::{classify_http, classify_status, EngineError, EngineResult};
use crate::types::{BookLevel, OrderbookSnapshot};
use super::limiter::VenueLimiters;
use super::types::{
    BestQuote, CancelAllFilter, MarketFilter, OpenOrdersFilter, OrderLookup, PlaceOrderOutcome,
    PlaceOrderRequest, VenueFill, VenueMarket, VenueOrder, VenuePosition, WireSide,
};
use super::{VenueAdapter, MAX_ORDER_BATCH};

/// Detached request-signing seam. The production signer (RSA-PSS-SHA256
/// over the exchange's canonical message) lives outside this crate.
pub trait RequestSigner: Send + Sync {
    fn key_id(&self) -> &str;
    fn sign(&self, message: &str) -> EngineResult<String>;
}

/// HMAC-SHA256 signer used by tests and dry-run.
pub struct HmacSigner {
    key_id: String,
    secret: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key_id: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.as_ref().to_vec(),
        }
    }
}

impl RequestSigner for HmacSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sign(&self, message: &str) -> EngineResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|e| EngineError::config(format!("bad signer secret: {e}")))?;
        mac.update(message.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

pub struct CentVenue {
    base_url: String,
    http: reqwest::Client,
    signer: Arc<dyn RequestSigner>,
    limiters: VenueLimiters,
    dry_run: bool,
    dry_seq: AtomicU64,
}

// ─────────────────────────────────────────────────────────
// Wire shapes (integer cents)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireMarket {
    ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    yes_token: String,
    #[serde(default)]
    no_token: String,
    #[serde(default)]
    close_time: Option<String>,
    #[serde(default)]
    volume_24h: Option<f64>,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct WireMarkets {
    markets: Vec<WireMarket>,
}

#[derive(Debug, Deserialize)]
struct WireBookSide {
    #[serde(default)]
    levels: Vec<(i64, i64)>, // (price_cents, contracts)
}

#[derive(Debug, Deserialize)]
struct WireBook {
    #[serde(default)]
    yes: Option<WireBookSide>,
    #[serde(default)]
    bids: Option<WireBookSide>,
    #[serde(default)]
    asks: Option<WireBookSide>,
}

#[derive(Debug, Deserialize)]
struct WireOrderAck {
    order_id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    order_id: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    side: String,
    price_cents: i64,
    count: i64,
    #[serde(default)]
    fill_count: i64,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct WireOrders {
    orders: Vec<WireOrder>,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    token: String,
    position: i64,
    #[serde(default)]
    avg_price_cents: i64,
    #[serde(default)]
    settled: bool,
    #[serde(default)]
    last_price_cents: i64,
}

#[derive(Debug, Deserialize)]
struct WirePositions {
    positions: Vec<WirePosition>,
}

#[derive(Debug, Deserialize)]
struct WireFill {
    order_id: String,
    token: String,
    side: String,
    price_cents: i64,
    count: i64,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireFills {
    fills: Vec<WireFill>,
}

fn cents_to_price(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn price_to_cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

impl CentVenue {
    pub fn new(
        base_url: String,
        signer: Arc<dyn RequestSigner>,
        timeout_secs: u64,
        dry_run: bool,
    ) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| EngineError::config(format!("http client: {e}")))?;
        Ok(Self {
            base_url,
            http,
            signer,
            limiters: VenueLimiters::new_default(),
            dry_run,
            dry_seq: AtomicU64::new(1),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
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
        let ts = Utc::now().timestamp_millis();
        let message = format!("{ts}{}{path}", method.as_str());
        let sig = self.signer.sign(&message)?;
        let mut req = self
            .http
            .request(method, self.url(path))
            .header("EXC-ACCESS-KEY", self.signer.key_id())
            .header("EXC-ACCESS-TIMESTAMP", ts.to_string())
            .header("EXC-ACCESS-SIGNATURE", sig);
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

    fn convert_market(w: WireMarket) -> VenueMarket {
        let yes = if w.yes_token.is_empty() {
            format!("{}-YES", w.ticker)
        } else {
            w.yes_token
        };
        let no = if w.no_token.is_empty() {
            format!("{}-NO", w.ticker)
        } else {
            w.no_token
        };
        VenueMarket {
            market_id: w.ticker,
            question: w.title,
            tokens: vec![yes, no],
            outcome_names: vec!["Yes".to_string(), "No".to_string()],
            // Flat one-cent grid.
            price_ranges: vec![],
            end_time: w
                .close_time
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            volume_24h: w.volume_24h.unwrap_or(0.0),
            active: w.status.eq_ignore_ascii_case("active"),
            closed: w.status.eq_ignore_ascii_case("settled")
                || w.status.eq_ignore_ascii_case("closed"),
        }
    }

    fn synth_order(&self, req: &PlaceOrderRequest) -> PlaceOrderOutcome {
        let n = self.dry_seq.fetch_add(1, Ordering::Relaxed);
        debug!(
            "📝 [DRY-RUN] {} {}@{} size={:.0}",
            req.side.as_str(),
            req.token,
            price_to_cents(req.price),
            req.size,
        );
        PlaceOrderOutcome {
            success: true,
            order_id: format!("dry-cent-{n}"),
            status: "OPEN".to_string(),
            error: None,
        }
    }
}

#[async_trait]
impl VenueAdapter for CentVenue {
    fn venue_id(&self) -> &str {
        "kalshi"
    }

    async fn list_markets(&self, filter: &MarketFilter) -> EngineResult<Vec<VenueMarket>> {
        let wire: WireMarkets = self.get_public("/markets").await?;
        let mut out: Vec<VenueMarket> = wire
            .markets
            .into_iter()
            .map(Self::convert_market)
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
        #[derive(Deserialize)]
        struct One {
            market: WireMarket,
        }
        let wire: One = self.get_public(&format!("/markets/{market_id}")).await?;
        Ok(Self::convert_market(wire.market))
    }

    async fn orderbook_snapshot(&self, token: &str) -> EngineResult<OrderbookSnapshot> {
        let wire: WireBook = self
            .get_public(&format!("/markets/{token}/orderbook"))
            .await?;
        let mut bids: Vec<BookLevel> = wire
            .bids
            .or(wire.yes)
            .map(|s| {
                s.levels
                    .into_iter()
                    .map(|(p, c)| BookLevel {
                        price: cents_to_price(p),
                        size: c as f64,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut asks: Vec<BookLevel> = wire
            .asks
            .map(|s| {
                s.levels
                    .into_iter()
                    .map(|(p, c)| BookLevel {
                        price: cents_to_price(p),
                        size: c as f64,
                    })
                    .collect()
            })
            .unwrap_or_default();
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        Ok(OrderbookSnapshot { bids, asks })
    }

    async fn midpoint(&self, token: &str) -> EngineResult<Option<f64>> {
        Ok(self.orderbook_snapshot(token).await?.book_mid())
    }

    async fn spread(&self, token: &str) -> EngineResult<Option<f64>> {
        let book = self.orderbook_snapshot(token).await?;
        match (book.best_bid(), book.best_ask()) {
            (Some(b), Some(a)) => Ok(Some(a.price - b.price)),
            _ => Ok(None),
        }
    }

    async fn best(&self, token: &str) -> EngineResult<BestQuote> {
        let book = self.orderbook_snapshot(token).await?;
        Ok(BestQuote {
            bid: book.best_bid().map(|l| l.price),
            ask: book.best_ask().map(|l| l.price),
        })
    }

    async fn place_order(&self, req: &PlaceOrderRequest) -> EngineResult<PlaceOrderOutcome> {
        if self.dry_run {
            return Ok(self.synth_order(req));
        }
        let body = serde_json::json!({
            "token": req.token,
            "side": req.side.as_str(),
            "price_cents": price_to_cents(req.price),
            "count": req.size.round() as i64,
            "time_in_force": req.time_in_force.as_str(),
            "post_only": req.post_only,
            "reduce_only": req.reduce_only,
            "client_order_id": req.client_order_id,
        });
        let resp = self
            .send_auth(reqwest::Method::POST, "/portfolio/orders", Some(body))
            .await?;
        let ack: WireOrderAck = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode order ack: {e}")))?;
        Ok(PlaceOrderOutcome {
            success: !ack.order_id.is_empty(),
            order_id: ack.order_id,
            status: ack.status.to_ascii_uppercase(),
            error: None,
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
        // No batch endpoint on this venue: sequential placement behind the
        // auth limiter.
        let mut out = Vec::with_capacity(reqs.len());
        for req in reqs {
            out.push(self.place_order(req).await?);
        }
        Ok(out)
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        if self.dry_run {
            debug!("📝 [DRY-RUN] cancel {order_id}");
            return Ok(());
        }
        self.send_auth(
            reqwest::Method::DELETE,
            &format!("/portfolio/orders/{order_id}"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn cancel_all(&self, filter: &CancelAllFilter) -> EngineResult<usize> {
        let open = self
            .open_orders(&OpenOrdersFilter {
                market_id: filter.market_id.clone(),
                token: filter.token.clone(),
            })
            .await?;
        let mut cancelled = 0usize;
        for o in &open {
            match self.cancel_order(&o.order_id).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!("❌ cancel {} failed: {e}", o.order_id),
            }
        }
        Ok(cancelled)
    }

    async fn open_orders(&self, filter: &OpenOrdersFilter) -> EngineResult<Vec<VenueOrder>> {
        let resp = self
            .send_auth(reqwest::Method::GET, "/portfolio/orders?status=open", None)
            .await?;
        let wire: WireOrders = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode open orders: {e}")))?;
        Ok(wire
            .orders
            .into_iter()
            .filter(|w| {
                filter
                    .token
                    .as_ref()
                    .map(|t| &w.token == t)
                    .unwrap_or(true)
            })
            .map(|w| VenueOrder {
                order_id: w.order_id,
                token: w.token,
                side: if w.side.eq_ignore_ascii_case("SELL") {
                    WireSide::Sell
                } else {
                    WireSide::Buy
                },
                price: cents_to_price(w.price_cents),
                original_size: w.count as f64,
                size_matched: w.fill_count as f64,
                status: w.status.to_ascii_uppercase(),
            })
            .collect())
    }

    async fn get_order(&self, order_id: &str) -> EngineResult<OrderLookup> {
        let resp = self
            .send_auth(
                reqwest::Method::GET,
                &format!("/portfolio/orders/{order_id}"),
                None,
            )
            .await;
        match resp {
            Ok(resp) => {
                #[derive(Deserialize)]
                struct One {
                    order: WireOrder,
                }
                let w: One = resp
                    .json()
                    .await
                    .map_err(|e| EngineError::permanent(format!("decode order: {e}")))?;
                let w = w.order;
                Ok(OrderLookup::Found(VenueOrder {
                    order_id: w.order_id,
                    token: w.token,
                    side: if w.side.eq_ignore_ascii_case("SELL") {
                        WireSide::Sell
                    } else {
                        WireSide::Buy
                    },
                    price: cents_to_price(w.price_cents),
                    original_size: w.count as f64,
                    size_matched: w.fill_count as f64,
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
            .send_auth(reqwest::Method::GET, "/portfolio/positions", None)
            .await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_transient() => {
                warn!("📉 positions feed transiently unavailable: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let wire: WirePositions = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode positions: {e}")))?;
        Ok(Some(
            wire.positions
                .into_iter()
                .map(|w| VenuePosition {
                    token: w.token,
                    size: w.position as f64,
                    avg_price: cents_to_price(w.avg_price_cents),
                    redeemable: w.settled,
                    cur_price: cents_to_price(w.last_price_cents),
                })
                .collect(),
        ))
    }

    async fn fills(&self, since: DateTime<Utc>) -> EngineResult<Vec<VenueFill>> {
        let resp = self
            .send_auth(
                reqwest::Method::GET,
                &format!("/portfolio/fills?min_ts={}", since.timestamp()),
                None,
            )
            .await?;
        let wire: WireFills = resp
            .json()
            .await
            .map_err(|e| EngineError::permanent(format!("decode fills: {e}")))?;
        Ok(wire
            .fills
            .into_iter()
            .map(|w| VenueFill {
                order_id: w.order_id,
                token: w.token,
                side: if w.side.eq_ignore_ascii_case("SELL") {
                    WireSide::Sell
                } else {
                    WireSide::Buy
                },
                price: cents_to_price(w.price_cents),
                size: w.count as f64,
                ts: w
                    .ts
                    .and_then(|t| Utc.timestamp_opt(t, 0).single())
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::types::TimeInForce;

    fn venue() -> CentVenue {
        CentVenue::new(
            "https://api.cent.example.com".to_string(),
            Arc::new(HmacSigner::new("key-1", b"secret")),
            15,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_cent_conversion() {
        assert!((cents_to_price(47) - 0.47).abs() < 1e-9);
        assert_eq!(price_to_cents(0.47), 47);
        assert_eq!(price_to_cents(0.475), 48); // rounds
    }

    #[test]
    fn test_hmac_signer_deterministic() {
        let s = HmacSigner::new("k", b"secret");
        assert_eq!(s.sign("msg").unwrap(), s.sign("msg").unwrap());
        assert_ne!(s.sign("msg").unwrap(), s.sign("msg2").unwrap());
    }

    #[tokio::test]
    async fn test_dry_run_order() {
        let v = venue();
        let out = v
            .place_order(&PlaceOrderRequest {
                token: "KXBTC-YES".into(),
                side: WireSide::Buy,
                price: 0.47,
                size: 10.0,
                time_in_force: TimeInForce::Gtc,
                post_only: true,
                reduce_only: false,
                client_order_id: None,
                order_group_id: None,
            })
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.status, "OPEN");
    }
}
