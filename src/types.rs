//! Core data model shared across the engine.
//!
//! Prices are decimals in (0, 1); sizes are share counts. All persisted
//! timestamps are UTC. Inventories are never negative; an MM with zero
//! inventory on an outcome has zero average cost on that outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Outcomes & sides
// ─────────────────────────────────────────────────────────

/// The two outcomes of a binary market. Token index 0 = YES, 1 = NO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" | "UP" => Some(Outcome::Yes),
            "NO" | "DOWN" => Some(Outcome::No),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "BID" => Some(OrderSide::Buy),
            "SELL" | "ASK" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Markets
// ─────────────────────────────────────────────────────────

/// An enrolled market. Exactly two outcome tokens, in YES/NO order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub market_id: String,
    pub venue: String,
    pub question: String,
    pub yes_token: String,
    pub no_token: String,
    /// Piecewise tick schedule, if the venue publishes one.
    pub price_ranges: Vec<PriceRange>,
    /// Cached mids, refreshed by the quote loop.
    pub yes_mid: Option<f64>,
    pub no_mid: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Market {
    pub fn token_for(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Yes => &self.yes_token,
            Outcome::No => &self.no_token,
        }
    }

    pub fn outcome_for_token(&self, token: &str) -> Option<Outcome> {
        if token == self.yes_token {
            Some(Outcome::Yes)
        } else if token == self.no_token {
            Some(Outcome::No)
        } else {
            None
        }
    }

    pub fn hours_to_end(&self, now: DateTime<Utc>) -> Option<f64> {
        self.end_time
            .map(|end| (end - now).num_seconds() as f64 / 3600.0)
    }
}

/// One band of the piecewise tick grid: [start, end) quantises at `step`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

// ─────────────────────────────────────────────────────────
// Market maker records
// ─────────────────────────────────────────────────────────

/// How the calculator positions quotes relative to the touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotingPolicy {
    /// Join the best bid/ask.
    Touch,
    /// One tick inside the spread when there is room; else touch.
    Inside,
    /// Rest behind the touch at the skewed theoretical prices.
    Back,
    /// Join the bid; ask at the touch but never below cost basis.
    Defensive,
    /// Multiple levels at configured offsets.
    Tiered,
    /// Fixed tick offsets off the touch on each side.
    Offsets,
}

impl QuotingPolicy {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "touch" => Some(QuotingPolicy::Touch),
            "inside" => Some(QuotingPolicy::Inside),
            "back" => Some(QuotingPolicy::Back),
            "defensive" => Some(QuotingPolicy::Defensive),
            "tiered" => Some(QuotingPolicy::Tiered),
            "offsets" => Some(QuotingPolicy::Offsets),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotingPolicy::Touch => "touch",
            QuotingPolicy::Inside => "inside",
            QuotingPolicy::Back => "back",
            QuotingPolicy::Defensive => "defensive",
            QuotingPolicy::Tiered => "tiered",
            QuotingPolicy::Offsets => "offsets",
        }
    }
}

/// One level of the tiered policy: `offset_ticks` behind the base price,
/// carrying `weight` of the side's size. Weights must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuoteTier {
    pub offset_ticks: u32,
    pub weight: f64,
}

/// Static per-MM configuration (operator-tunable).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmConfig {
    pub target_spread: f64,
    pub skew_factor: f64,
    pub order_size: f64,
    pub max_inventory: f64,
    pub policy: QuotingPolicy,
    pub min_time_to_resolution_hours: f64,
    pub bid_offset_ticks: Option<u32>,
    pub ask_offset_ticks: Option<u32>,
    /// Levels for the tiered policy; None falls back to the built-ins.
    #[serde(default)]
    pub tiers: Option<Vec<QuoteTier>>,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            target_spread: 0.02,
            skew_factor: 0.02,
            order_size: 10.0,
            max_inventory: 100.0,
            policy: QuotingPolicy::Back,
            min_time_to_resolution_hours: 6.0,
            bid_offset_ticks: None,
            ask_offset_ticks: None,
            tiers: None,
        }
    }
}

/// Runtime state. Mutated only by the inventory FSM and reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MmState {
    pub yes_inventory: f64,
    pub no_inventory: f64,
    pub avg_yes_cost: f64,
    pub avg_no_cost: f64,
    pub realized_pnl: f64,
    pub last_quote_at: Option<DateTime<Utc>>,
    pub volatility_pause_until: Option<DateTime<Utc>>,
}

impl MmState {
    pub fn inventory(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Yes => self.yes_inventory,
            Outcome::No => self.no_inventory,
        }
    }

    pub fn avg_cost(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Yes => self.avg_yes_cost,
            Outcome::No => self.avg_no_cost,
        }
    }

    /// Invariant: inventories ≥ 0 and zero inventory ⇒ zero avg cost.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.yes_inventory < 0.0 || self.no_inventory < 0.0 {
            return Err(format!(
                "negative inventory: yes={} no={}",
                self.yes_inventory, self.no_inventory
            ));
        }
        if self.yes_inventory == 0.0 && self.avg_yes_cost != 0.0 {
            return Err(format!("zero YES inventory with avg cost {}", self.avg_yes_cost));
        }
        if self.no_inventory == 0.0 && self.avg_no_cost != 0.0 {
            return Err(format!("zero NO inventory with avg cost {}", self.avg_no_cost));
        }
        Ok(())
    }
}

/// One market maker. Exactly one per enrolled market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmRecord {
    pub id: i64,
    pub market_id: String,
    pub active: bool,
    pub paused: bool,
    pub config: MmConfig,
    pub state: MmState,
}

// ─────────────────────────────────────────────────────────
// Tracked orders & fills
// ─────────────────────────────────────────────────────────

/// Key for a tracked order slot. Tier 0 unless the tiered policy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub outcome: Outcome,
    pub side: OrderSide,
    pub tier: u32,
}

impl OrderKey {
    pub fn new(outcome: Outcome, side: OrderSide, tier: u32) -> Self {
        Self { outcome, side, tier }
    }
}

/// A live order we placed and still account for.
/// Rows are insert/delete only; price and size never mutate in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub mm_id: i64,
    pub key: OrderKey,
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub order_group_id: Option<String>,
    pub token: String,
    pub price: f64,
    pub size: f64,
    /// Cumulative matched quantity last observed; None until first fill.
    pub last_matched_size: Option<f64>,
    pub placed_at: DateTime<Utc>,
}

/// Append-only fill record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub mm_id: i64,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub value: f64,
    pub realized_pnl_delta: f64,
    pub filled_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────
// Pending fill events
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingFillStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl PendingFillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingFillStatus::Pending => "PENDING",
            PendingFillStatus::Confirmed => "CONFIRMED",
            PendingFillStatus::Rejected => "REJECTED",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(PendingFillStatus::Pending),
            "CONFIRMED" => Some(PendingFillStatus::Confirmed),
            "REJECTED" => Some(PendingFillStatus::Rejected),
            _ => None,
        }
    }
}

/// A provisional fill observed via push, awaiting on-chain corroboration.
/// Unique on (order_id, matched_total).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFillEvent {
    pub id: i64,
    pub mm_id: i64,
    pub order_id: String,
    /// Cumulative matched size after this fill.
    pub matched_total: f64,
    pub outcome: Outcome,
    pub side: OrderSide,
    pub price: f64,
    /// Size of this delta alone.
    pub size: f64,
    pub status: PendingFillStatus,
    pub observed_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────
// Quote history (operator audit trail)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteEventKind {
    QuotePlaced,
    QuoteCancelled,
    Fill,
    Pause,
    SanityCheckFailed,
    OrderStale,
    OrderCancelled,
    PartialFill,
    Error,
}

impl QuoteEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteEventKind::QuotePlaced => "QUOTE_PLACED",
            QuoteEventKind::QuoteCancelled => "QUOTE_CANCELLED",
            QuoteEventKind::Fill => "FILL",
            QuoteEventKind::Pause => "PAUSE",
            QuoteEventKind::SanityCheckFailed => "SANITY_CHECK_FAILED",
            QuoteEventKind::OrderStale => "ORDER_STALE",
            QuoteEventKind::OrderCancelled => "ORDER_CANCELLED",
            QuoteEventKind::PartialFill => "PARTIAL_FILL",
            QuoteEventKind::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteEvent {
    pub mm_id: i64,
    pub kind: QuoteEventKind,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────
// Orderbook snapshots
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Sorted book: bids descending, asks ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderbookSnapshot {
    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    pub fn book_mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b.price >= a.price,
            _ => false,
        }
    }

    /// Notional (price·size) resting within ±range of mid, both sides.
    pub fn depth_within(&self, mid: f64, range: f64) -> f64 {
        let lo = mid - range;
        let hi = mid + range;
        let bid_depth: f64 = self
            .bids
            .iter()
            .filter(|l| l.price >= lo)
            .map(|l| l.price * l.size)
            .sum();
        let ask_depth: f64 = self
            .asks
            .iter()
            .filter(|l| l.price <= hi)
            .map(|l| l.price * l.size)
            .sum();
        bid_depth + ask_depth
    }
}

// ─────────────────────────────────────────────────────────
// Candidates (screening results)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateMetrics {
    pub mid: f64,
    pub spread_ticks: f64,
    pub top_depth_notional: f64,
    pub depth_1c: f64,
    pub depth_3c: f64,
    pub depth_5c: f64,
    pub book_slope: f64,
    pub queue_speed: f64,
    pub queue_depth_ratio: f64,
    pub volume_24h: f64,
    pub hours_to_end: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateScores {
    pub liquidity: f64,
    pub flow: f64,
    pub time: f64,
    pub price_zone: f64,
    pub queue_speed: f64,
    pub queue_depth: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub market_id: String,
    pub venue: String,
    pub metrics: CandidateMetrics,
    pub scores: CandidateScores,
    pub eligible: bool,
    pub disqualify_reasons: Vec<String>,
    pub flags: Vec<String>,
    pub scored_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────
// Status surfaces
// ─────────────────────────────────────────────────────────

/// Per-market operator-visible state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail")]
pub enum MarketStatus {
    Active,
    PausedManual,
    PausedPreResolution,
    PausedVolatility,
    SanityFailing(String),
}

/// Global engine state for the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reasons")]
pub enum GlobalStatus {
    Running,
    Killed,
    Degraded(Vec<String>),
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_round_trip() {
        assert_eq!(Outcome::from_str_loose("yes"), Some(Outcome::Yes));
        assert_eq!(Outcome::from_str_loose("NO"), Some(Outcome::No));
        assert_eq!(Outcome::from_str_loose("maybe"), None);
        assert_eq!(Outcome::Yes.opposite(), Outcome::No);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            QuotingPolicy::from_str_loose("Defensive"),
            Some(QuotingPolicy::Defensive)
        );
        assert_eq!(QuotingPolicy::from_str_loose("aggressive"), None);
    }

    #[test]
    fn test_state_invariants() {
        let mut s = MmState::default();
        assert!(s.check_invariants().is_ok());

        s.yes_inventory = 10.0;
        s.avg_yes_cost = 0.5;
        assert!(s.check_invariants().is_ok());

        s.yes_inventory = 0.0;
        assert!(s.check_invariants().is_err()); // cost lingers at zero inventory

        s.avg_yes_cost = 0.0;
        s.no_inventory = -1.0;
        assert!(s.check_invariants().is_err());
    }

    #[test]
    fn test_book_depth_within() {
        let book = OrderbookSnapshot {
            bids: vec![
                BookLevel { price: 0.49, size: 100.0 },
                BookLevel { price: 0.45, size: 100.0 },
            ],
            asks: vec![
                BookLevel { price: 0.51, size: 100.0 },
                BookLevel { price: 0.55, size: 100.0 },
            ],
        };
        let mid = book.book_mid().unwrap();
        assert!((mid - 0.50).abs() < 1e-9);

        // 1c window catches only the touch levels
        let d1 = book.depth_within(mid, 0.01);
        assert!((d1 - (0.49 * 100.0 + 0.51 * 100.0)).abs() < 1e-9);

        // 5c window catches all four levels
        let d5 = book.depth_within(mid, 0.05);
        assert!((d5 - (0.49 * 100.0 + 0.45 * 100.0 + 0.51 * 100.0 + 0.55 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn test_crossed_book() {
        let book = OrderbookSnapshot {
            bids: vec![BookLevel { price: 0.55, size: 10.0 }],
            asks: vec![BookLevel { price: 0.54, size: 10.0 }],
        };
        assert!(book.is_crossed());
    }
}
