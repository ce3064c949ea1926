//! Wire-level types shared by the venue adapters.
//!
//! Status strings arrive in whatever casing the venue feels like; everything
//! is normalised to uppercase before classification. Terminal set =
//! {MATCHED, CANCELLED, CANCELED, EXPIRED}; live set = {LIVE, OPEN}.

use serde::{Deserialize, Serialize};

use crate::types::{OrderbookSnapshot, PriceRange};

// ─────────────────────────────────────────────────────────
// Markets
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueMarket {
    pub market_id: String,
    pub question: String,
    /// Outcome token ids in fixed order: index 0 = YES, index 1 = NO.
    pub tokens: Vec<String>,
    pub outcome_names: Vec<String>,
    pub price_ranges: Vec<PriceRange>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub volume_24h: f64,
    pub active: bool,
    pub closed: bool,
}

impl VenueMarket {
    pub fn is_binary(&self) -> bool {
        self.tokens.len() == 2
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    pub active_only: bool,
    pub min_volume_24h: Option<f64>,
    pub limit: Option<usize>,
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireSide {
    Buy,
    Sell,
}

impl WireSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireSide::Buy => "BUY",
            WireSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub token: String,
    pub side: WireSide,
    pub price: f64,
    pub size: f64,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
    pub order_group_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderOutcome {
    pub success: bool,
    pub order_id: String,
    pub status: String,
    pub error: Option<String>,
}

/// Normalised order status classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Live,
    Terminal,
    Unknown,
}

pub fn classify_status_str(raw: &str) -> StatusClass {
    match raw.trim().to_ascii_uppercase().as_str() {
        "LIVE" | "OPEN" => StatusClass::Live,
        "MATCHED" | "CANCELLED" | "CANCELED" | "EXPIRED" => StatusClass::Terminal,
        _ => StatusClass::Unknown,
    }
}

/// An order as the venue reports it.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub order_id: String,
    pub token: String,
    pub side: WireSide,
    pub price: f64,
    pub original_size: f64,
    pub size_matched: f64,
    pub status: String,
}

impl VenueOrder {
    pub fn status_class(&self) -> StatusClass {
        classify_status_str(&self.status)
    }
}

#[derive(Debug, Clone)]
pub enum OrderLookup {
    Found(VenueOrder),
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct OpenOrdersFilter {
    pub market_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CancelAllFilter {
    pub market_id: Option<String>,
    pub token: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Positions & fills
// ─────────────────────────────────────────────────────────

/// Authoritative position for one outcome token.
/// `redeemable == true` or `cur_price == 0` means the market resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub token: String,
    pub size: f64,
    pub avg_price: f64,
    pub redeemable: bool,
    pub cur_price: f64,
}

impl VenuePosition {
    pub fn is_resolved(&self) -> bool {
        self.redeemable || self.cur_price == 0.0
    }
}

#[derive(Debug, Clone)]
pub struct VenueFill {
    pub order_id: String,
    pub token: String,
    pub side: WireSide,
    pub price: f64,
    pub size: f64,
    pub ts: chrono::DateTime<chrono::Utc>,
}

/// Top-of-book triple served by the authoritative endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestQuote {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

/// Everything the quote cycle reads for one outcome in one round trip set.
#[derive(Debug, Clone)]
pub struct OutcomeView {
    pub token: String,
    pub midpoint: Option<f64>,
    pub spread: Option<f64>,
    pub best: BestQuote,
    pub book: OrderbookSnapshot,
}

// ─────────────────────────────────────────────────────────
// Push stream wire schema (subset)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PushOrderMsg {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub original_size: Option<serde_json::Value>,
    #[serde(default)]
    pub size_matched: Option<serde_json::Value>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushMakerOrder {
    pub order_id: String,
    #[serde(default)]
    pub matched_amount: Option<serde_json::Value>,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub asset_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushTradeMsg {
    pub id: String,
    #[serde(default)]
    pub maker_orders: Vec<PushMakerOrder>,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub size: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushPositionMsg {
    pub asset: String,
    pub size: serde_json::Value,
    #[serde(default)]
    pub avg_price: Option<serde_json::Value>,
}

/// Venues encode numbers as strings or raw numbers; accept both.
pub fn json_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
}

pub fn opt_json_f64(v: &Option<serde_json::Value>) -> Option<f64> {
    v.as_ref().and_then(json_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_normalisation() {
        assert_eq!(classify_status_str("live"), StatusClass::Live);
        assert_eq!(classify_status_str(" OPEN "), StatusClass::Live);
        assert_eq!(classify_status_str("Matched"), StatusClass::Terminal);
        assert_eq!(classify_status_str("CANCELED"), StatusClass::Terminal);
        assert_eq!(classify_status_str("CANCELLED"), StatusClass::Terminal);
        assert_eq!(classify_status_str("EXPIRED"), StatusClass::Terminal);
        assert_eq!(classify_status_str("RETRYING"), StatusClass::Unknown);
    }

    #[test]
    fn test_resolved_position() {
        let p = VenuePosition {
            token: "t".into(),
            size: 10.0,
            avg_price: 0.5,
            redeemable: true,
            cur_price: 0.99,
        };
        assert!(p.is_resolved());
        let p2 = VenuePosition { redeemable: false, cur_price: 0.0, ..p.clone() };
        assert!(p2.is_resolved());
        let p3 = VenuePosition { redeemable: false, cur_price: 0.4, ..p };
        assert!(!p3.is_resolved());
    }

    #[test]
    fn test_json_number_or_string() {
        assert_eq!(json_f64(&serde_json::json!("0.53")), Some(0.53));
        assert_eq!(json_f64(&serde_json::json!(0.53)), Some(0.53));
        assert_eq!(json_f64(&serde_json::json!("x")), None);
    }
}
