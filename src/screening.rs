//! Market screening: is this book worth making?
//!
//! Produces a [`Candidate`] per market: derived book metrics, six 0–100
//! sub-scores, a weighted total, and the hard disqualification reasons.
//! Disqualifications are collected, never short-circuited, so the operator
//! sees every problem at once.

use chrono::Utc;
use tracing::debug;

use crate::grid::PriceGrid;
use crate::types::{Candidate, CandidateMetrics, CandidateScores, OrderbookSnapshot};
use crate::venue::types::VenueMarket;

// Reason codes (stable strings for the dashboard).
pub const R_TOO_CLOSE_TO_END: &str = "TOO_CLOSE_TO_END";
pub const R_SPREAD_TOO_WIDE: &str = "SPREAD_TOO_WIDE";
pub const R_TOP_DEPTH_TOO_LOW: &str = "TOP_DEPTH_TOO_LOW";
pub const R_DEPTH_3C_TOO_LOW: &str = "DEPTH_3C_TOO_LOW";
pub const R_SIDE_DEPTH_TOO_LOW: &str = "SIDE_DEPTH_TOO_LOW";
pub const R_QUEUE_TOO_SLOW: &str = "QUEUE_TOO_SLOW";
pub const R_VOLUME_TOO_LOW: &str = "VOLUME_TOO_LOW";
pub const R_MID_OUT_OF_BAND: &str = "MID_OUT_OF_BAND";
pub const R_MULTI_OUTCOME: &str = "MULTI_OUTCOME";
pub const R_AMBIGUOUS_RESOLUTION: &str = "AMBIGUOUS_RESOLUTION";
pub const R_NO_BOOK_MISSING: &str = "NO_BOOK_MISSING";
pub const R_BOOK_EMPTY: &str = "BOOK_EMPTY";

pub const F_THIN_NO_BOOK: &str = "THIN_NO_BOOK";
pub const F_WIDE_BOOK_SLOPE: &str = "WIDE_BOOK_SLOPE";
pub const F_NEAR_PRICE_BOUND: &str = "NEAR_PRICE_BOUND";

/// Questions whose settlement reads like a judgement call.
const AMBIGUOUS_KEYWORDS: [&str; 5] = [
    "resolves early",
    "whichever",
    "discretion",
    "subjective",
    "committee",
];

#[derive(Debug, Clone)]
pub struct ScreeningConfig {
    pub min_time_to_end_hours: f64,
    pub max_spread_ticks: u32,
    pub min_top_depth_notional: f64,
    pub min_depth_3c: f64,
    pub min_side_depth: f64,
    pub min_queue_speed: f64,
    pub min_volume_24h: f64,
    pub exclude_mid_lt: f64,
    pub exclude_mid_gt: f64,
    /// Window for the mid-range depth metric, cents.
    pub depth_mid_range_cents: f64,
    pub require_no_book: bool,
    /// Order size assumed when judging queue depth.
    pub assumed_order_size: f64,
    // Score saturation points.
    pub liquidity_saturation: f64,
    pub flow_saturation: f64,
    pub time_saturation_hours: f64,
    pub queue_speed_saturation: f64,
    pub queue_depth_saturation: f64,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            min_time_to_end_hours: 12.0,
            max_spread_ticks: 10,
            min_top_depth_notional: 50.0,
            min_depth_3c: 150.0,
            min_side_depth: 25.0,
            min_queue_speed: 0.5,
            min_volume_24h: 500.0,
            exclude_mid_lt: 0.05,
            exclude_mid_gt: 0.95,
            depth_mid_range_cents: 3.0,
            require_no_book: false,
            assumed_order_size: 10.0,
            liquidity_saturation: 5_000.0,
            flow_saturation: 50_000.0,
            time_saturation_hours: 24.0 * 14.0,
            queue_speed_saturation: 50.0,
            queue_depth_saturation: 20.0,
        }
    }
}

/// Everything the screener looks at for one market.
pub struct ScreeningInput<'a> {
    pub market: &'a VenueMarket,
    pub yes_book: &'a OrderbookSnapshot,
    pub no_book: Option<&'a OrderbookSnapshot>,
    /// Authoritative top-of-book data, preferred over raw-book derivation.
    pub auth_midpoint: Option<f64>,
    pub auth_spread: Option<f64>,
    pub grid: &'a PriceGrid,
    pub venue: &'a str,
}

fn log_sat(value: f64, saturation: f64) -> f64 {
    if saturation <= 0.0 || value <= 0.0 {
        return 0.0;
    }
    (100.0 * (1.0 + value).log10() / (1.0 + saturation).log10()).clamp(0.0, 100.0)
}

fn lin_sat(value: f64, saturation: f64) -> f64 {
    if saturation <= 0.0 {
        return 0.0;
    }
    (100.0 * value / saturation).clamp(0.0, 100.0)
}

pub fn screen(input: &ScreeningInput<'_>, cfg: &ScreeningConfig) -> Candidate {
    let now = Utc::now();
    let mut reasons: Vec<String> = Vec::new();
    let mut flags: Vec<String> = Vec::new();

    let market = input.market;
    let book = input.yes_book;

    // 1. Mid: authoritative preferred, raw book as fallback.
    let book_mid = book.book_mid();
    let mid = input.auth_midpoint.or(book_mid).unwrap_or(0.0);
    if mid <= 0.0 {
        reasons.push(R_BOOK_EMPTY.to_string());
    }
    let tick = input.grid.tick_size(mid.max(input.grid.min_price));

    // 2. Spread in ticks.
    let raw_spread = input.auth_spread.or_else(|| {
        match (book.best_bid(), book.best_ask()) {
            (Some(b), Some(a)) => Some(a.price - b.price),
            _ => None,
        }
    });
    let spread_ticks = raw_spread.map(|s| (s / tick).round()).unwrap_or(f64::INFINITY);

    // 3. Top-of-book notional.
    let top_depth_notional = match (book.best_bid(), book.best_ask()) {
        (Some(b), Some(a)) => b.price * b.size + a.price * a.size,
        _ => 0.0,
    };
    let top_depth_shares = match (book.best_bid(), book.best_ask()) {
        (Some(b), Some(a)) => b.size + a.size,
        _ => 0.0,
    };

    // 4. Depth bands around mid.
    let depth_1c = book.depth_within(mid, 0.01);
    let depth_mid = book.depth_within(mid, cfg.depth_mid_range_cents / 100.0);
    let depth_5c = book.depth_within(mid, 0.05);

    // 5. Book slope: how front-loaded the liquidity is.
    let book_slope = if depth_5c > 0.0 { depth_1c / depth_5c } else { 0.0 };

    // 6. Queue metrics.
    let volume_24h = market.volume_24h;
    let queue_speed = if depth_mid > 0.0 { volume_24h / depth_mid } else { 0.0 };
    let queue_depth_ratio = if cfg.assumed_order_size > 0.0 {
        top_depth_shares / cfg.assumed_order_size
    } else {
        0.0
    };

    let hours_to_end = market
        .end_time
        .map(|end| (end - now).num_seconds() as f64 / 3600.0);

    // 7. Hard disqualifications, all of them, no short-circuit.
    if let Some(h) = hours_to_end {
        if h < cfg.min_time_to_end_hours {
            reasons.push(format!("{R_TOO_CLOSE_TO_END}: {h:.1}h"));
        }
    }
    if spread_ticks > cfg.max_spread_ticks as f64 {
        reasons.push(format!("{R_SPREAD_TOO_WIDE}: {spread_ticks:.0} ticks"));
    }
    if top_depth_notional < cfg.min_top_depth_notional {
        reasons.push(format!("{R_TOP_DEPTH_TOO_LOW}: {top_depth_notional:.0}"));
    }
    if depth_mid < cfg.min_depth_3c {
        reasons.push(format!("{R_DEPTH_3C_TOO_LOW}: {depth_mid:.0}"));
    }
    let bid_depth: f64 = book.bids.iter().map(|l| l.price * l.size).sum();
    let ask_depth: f64 = book.asks.iter().map(|l| l.price * l.size).sum();
    if bid_depth < cfg.min_side_depth || ask_depth < cfg.min_side_depth {
        reasons.push(format!(
            "{R_SIDE_DEPTH_TOO_LOW}: bid={bid_depth:.0} ask={ask_depth:.0}"
        ));
    }
    if queue_speed < cfg.min_queue_speed {
        reasons.push(format!("{R_QUEUE_TOO_SLOW}: {queue_speed:.2}"));
    }
    if volume_24h < cfg.min_volume_24h {
        reasons.push(format!("{R_VOLUME_TOO_LOW}: {volume_24h:.0}"));
    }
    if mid < cfg.exclude_mid_lt || mid > cfg.exclude_mid_gt {
        reasons.push(format!("{R_MID_OUT_OF_BAND}: {mid:.3}"));
    }
    if !market.is_binary() {
        reasons.push(format!("{R_MULTI_OUTCOME}: {} tokens", market.tokens.len()));
    }
    let question = market.question.to_lowercase();
    if AMBIGUOUS_KEYWORDS.iter().any(|k| question.contains(k)) {
        reasons.push(R_AMBIGUOUS_RESOLUTION.to_string());
    }
    if cfg.require_no_book && input.no_book.is_none() {
        reasons.push(R_NO_BOOK_MISSING.to_string());
    }

    // Soft flags.
    if let Some(no_book) = input.no_book {
        if no_book.book_mid().is_none() {
            flags.push(F_THIN_NO_BOOK.to_string());
        }
    }
    if book_slope > 0.0 && book_slope < 0.1 {
        flags.push(F_WIDE_BOOK_SLOPE.to_string());
    }
    if mid > 0.0 && (mid < cfg.exclude_mid_lt + 0.05 || mid > cfg.exclude_mid_gt - 0.05) {
        flags.push(F_NEAR_PRICE_BOUND.to_string());
    }

    // 8. Sub-scores, each 0–100.
    let liquidity = 0.6 * log_sat(top_depth_notional, cfg.liquidity_saturation)
        + 0.4 * log_sat(depth_mid, cfg.liquidity_saturation);
    let flow = log_sat(volume_24h, cfg.flow_saturation);
    let time = match hours_to_end {
        // No end time published → effectively unbounded runway.
        None => 100.0,
        Some(h) if h <= cfg.min_time_to_end_hours => 0.0,
        Some(h) => lin_sat(h - cfg.min_time_to_end_hours, cfg.time_saturation_hours),
    };
    let price_zone = price_zone_score(mid, cfg.exclude_mid_lt, cfg.exclude_mid_gt);
    let queue_speed_score = log_sat(queue_speed, cfg.queue_speed_saturation);
    let queue_depth_score = lin_sat(queue_depth_ratio, cfg.queue_depth_saturation);

    let total = 0.35 * queue_speed_score
        + 0.25 * liquidity
        + 0.15 * flow
        + 0.10 * time
        + 0.10 * price_zone
        + 0.05 * queue_depth_score;

    debug!(
        market = %market.market_id,
        total = format!("{total:.1}"),
        reasons = reasons.len(),
        "screened"
    );

    Candidate {
        market_id: market.market_id.clone(),
        venue: input.venue.to_string(),
        metrics: CandidateMetrics {
            mid,
            spread_ticks: if spread_ticks.is_finite() { spread_ticks } else { -1.0 },
            top_depth_notional,
            depth_1c,
            depth_3c: depth_mid,
            depth_5c,
            book_slope,
            queue_speed,
            queue_depth_ratio,
            volume_24h,
            hours_to_end,
        },
        scores: CandidateScores {
            liquidity,
            flow,
            time,
            price_zone,
            queue_speed: queue_speed_score,
            queue_depth: queue_depth_score,
            total,
        },
        eligible: reasons.is_empty(),
        disqualify_reasons: reasons,
        flags,
        scored_at: now,
    }
}

/// 100 inside the comfortable middle band, linear falloff toward the
/// exclusion bounds, 0 at or beyond them.
fn price_zone_score(mid: f64, lo: f64, hi: f64) -> f64 {
    const BAND_LO: f64 = 0.15;
    const BAND_HI: f64 = 0.85;
    if mid <= lo || mid >= hi {
        return 0.0;
    }
    if mid >= BAND_LO && mid <= BAND_HI {
        return 100.0;
    }
    if mid < BAND_LO {
        100.0 * (mid - lo) / (BAND_LO - lo)
    } else {
        100.0 * (hi - mid) / (hi - BAND_HI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookLevel;
    use chrono::Duration;

    fn deep_book() -> OrderbookSnapshot {
        OrderbookSnapshot {
            bids: vec![
                BookLevel { price: 0.49, size: 500.0 },
                BookLevel { price: 0.48, size: 500.0 },
                BookLevel { price: 0.46, size: 500.0 },
            ],
            asks: vec![
                BookLevel { price: 0.51, size: 500.0 },
                BookLevel { price: 0.52, size: 500.0 },
                BookLevel { price: 0.54, size: 500.0 },
            ],
        }
    }

    fn market(question: &str, tokens: usize, hours: i64, volume: f64) -> VenueMarket {
        VenueMarket {
            market_id: "m1".to_string(),
            question: question.to_string(),
            tokens: (0..tokens).map(|i| format!("t{i}")).collect(),
            outcome_names: vec!["Yes".into(), "No".into()],
            price_ranges: vec![],
            end_time: Some(Utc::now() + Duration::hours(hours)),
            volume_24h: volume,
            active: true,
            closed: false,
        }
    }

    fn run(m: &VenueMarket, book: &OrderbookSnapshot, cfg: &ScreeningConfig) -> Candidate {
        let grid = PriceGrid::default();
        screen(
            &ScreeningInput {
                market: m,
                yes_book: book,
                no_book: None,
                auth_midpoint: None,
                auth_spread: None,
                grid: &grid,
                venue: "clob",
            },
            cfg,
        )
    }

    #[test]
    fn test_healthy_market_eligible() {
        let m = market("Will X happen by year end?", 2, 24 * 30, 20_000.0);
        let c = run(&m, &deep_book(), &ScreeningConfig::default());
        assert!(c.eligible, "reasons: {:?}", c.disqualify_reasons);
        assert!(c.scores.total > 30.0);
        assert!((c.metrics.mid - 0.50).abs() < 1e-9);
        assert!((c.metrics.spread_ticks - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_reasons_are_collected_not_short_circuited() {
        // Empty book, near end, no volume, 3 outcomes: every gate trips.
        let m = market("Which committee member wins?", 3, 1, 0.0);
        let c = run(&m, &OrderbookSnapshot::default(), &ScreeningConfig::default());
        assert!(!c.eligible);
        let joined = c.disqualify_reasons.join("|");
        assert!(joined.contains(R_TOO_CLOSE_TO_END));
        assert!(joined.contains(R_TOP_DEPTH_TOO_LOW));
        assert!(joined.contains(R_VOLUME_TOO_LOW));
        assert!(joined.contains(R_MULTI_OUTCOME));
        assert!(joined.contains(R_AMBIGUOUS_RESOLUTION));
        assert!(c.disqualify_reasons.len() >= 5);
    }

    #[test]
    fn test_wide_spread_disqualifies() {
        let mut book = deep_book();
        book.asks[0].price = 0.65; // 16 ticks wide
        book.asks[1].price = 0.66;
        book.asks[2].price = 0.67;
        let m = market("Will X happen?", 2, 24 * 30, 20_000.0);
        let c = run(&m, &book, &ScreeningConfig::default());
        assert!(c
            .disqualify_reasons
            .iter()
            .any(|r| r.contains(R_SPREAD_TOO_WIDE)));
    }

    #[test]
    fn test_extreme_mid_disqualifies() {
        let book = OrderbookSnapshot {
            bids: vec![BookLevel { price: 0.02, size: 5_000.0 }],
            asks: vec![BookLevel { price: 0.03, size: 5_000.0 }],
        };
        let m = market("Will a long shot land?", 2, 24 * 30, 20_000.0);
        let c = run(&m, &book, &ScreeningConfig::default());
        assert!(c
            .disqualify_reasons
            .iter()
            .any(|r| r.contains(R_MID_OUT_OF_BAND)));
        assert!((c.scores.price_zone - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_authoritative_mid_preferred() {
        let m = market("Will X happen?", 2, 24 * 30, 20_000.0);
        let grid = PriceGrid::default();
        let book = deep_book();
        let c = screen(
            &ScreeningInput {
                market: &m,
                yes_book: &book,
                no_book: None,
                auth_midpoint: Some(0.47),
                auth_spread: Some(0.03),
                grid: &grid,
                venue: "clob",
            },
            &ScreeningConfig::default(),
        );
        assert!((c.metrics.mid - 0.47).abs() < 1e-9);
        assert!((c.metrics.spread_ticks - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_require_no_book() {
        let m = market("Will X happen?", 2, 24 * 30, 20_000.0);
        let mut cfg = ScreeningConfig::default();
        cfg.require_no_book = true;
        let c = run(&m, &deep_book(), &cfg);
        assert!(c
            .disqualify_reasons
            .iter()
            .any(|r| r.contains(R_NO_BOOK_MISSING)));
    }

    #[test]
    fn test_weighted_total() {
        let s = CandidateScores {
            liquidity: 100.0,
            flow: 100.0,
            time: 100.0,
            price_zone: 100.0,
            queue_speed: 100.0,
            queue_depth: 100.0,
            total: 0.0,
        };
        let total = 0.35 * s.queue_speed
            + 0.25 * s.liquidity
            + 0.15 * s.flow
            + 0.10 * s.time
            + 0.10 * s.price_zone
            + 0.05 * s.queue_depth;
        assert!((total - 100.0).abs() < 1e-9); // weights sum to 1
    }

    #[test]
    fn test_price_zone_falloff() {
        assert!((price_zone_score(0.50, 0.05, 0.95) - 100.0).abs() < 1e-9);
        assert!((price_zone_score(0.10, 0.05, 0.95) - 50.0).abs() < 1e-9);
        assert!((price_zone_score(0.05, 0.05, 0.95) - 0.0).abs() < 1e-9);
        assert!((price_zone_score(0.90, 0.05, 0.95) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_book_slope() {
        let m = market("Will X happen?", 2, 24 * 30, 20_000.0);
        let c = run(&m, &deep_book(), &ScreeningConfig::default());
        // 1c band holds the touch only; 5c band holds everything.
        assert!(c.metrics.book_slope > 0.0 && c.metrics.book_slope < 1.0);
        let all = c.metrics.depth_5c;
        assert!(all > c.metrics.depth_1c);
    }
}
